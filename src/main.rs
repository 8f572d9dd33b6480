// LOADFLOW: Programmable HTTP Load Generator
// Copyright (c) 2024 Bugb Technologies

use loadflow::config::ContainerConfig;
use loadflow::error::Result;
use loadflow::flow::FlowMap;
use loadflow::orchestrator::Orchestrator;
use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

mod cli;
use cli::Cli;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    if let Err(e) = init_logging(&cli) {
        eprintln!("failed to initialize logging: {e}");
        std::process::exit(1);
    }

    if let Err(e) = run(cli).await {
        tracing::error!("{e}");
        eprintln!("error: {e}");
        std::process::exit(1);
    }
}

fn init_logging(cli: &Cli) -> Result<()> {
    let filter = match cli.verbose {
        0 => "loadflow=info".to_string(),
        1 => "loadflow=debug".to_string(),
        _ => "loadflow=trace".to_string(),
    };
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));
    let fmt_layer = tracing_subscriber::fmt::layer();
    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .init();
    Ok(())
}

async fn run(cli: Cli) -> Result<()> {
    let mut config = ContainerConfig::from_file(&cli.config)?;
    if let Some(ref flow_override) = cli.flow {
        config.flow_path = flow_override.to_string_lossy().into_owned();
    }
    if cli.run_once {
        config.run_once = true;
    }
    config.validate()?;

    let flow: FlowMap = load_flow(&config.flow_path)?;

    tracing::info!(
        flow = %flow.name,
        sim_users = config.sim_users,
        run_once = config.run_once,
        "starting load flow"
    );

    let orchestrator = Orchestrator::new(config, flow)?;
    orchestrator.start()?;

    let report_interval = tokio::time::Duration::from_secs(5);
    let mut ticker = tokio::time::interval(report_interval);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let snapshot = orchestrator.metrics_snapshot();
                tracing::info!(
                    active_users = orchestrator.active_user_count(),
                    requests_per_second = snapshot.requests_per_second,
                    avg_iteration_ms = snapshot.average_iteration_duration.as_millis(),
                    total_iterations = snapshot.total_iterations,
                    "metrics"
                );
            }
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("received interrupt, stopping");
                break;
            }
        }
    }

    orchestrator.stop().await;
    Ok(())
}

fn load_flow(path: &str) -> Result<FlowMap> {
    let contents = std::fs::read_to_string(path)?;
    let flow = match std::path::Path::new(path)
        .extension()
        .and_then(|e| e.to_str())
    {
        Some("yaml") | Some("yml") => serde_yaml::from_str(&contents)?,
        Some("json") => serde_json::from_str(&contents)?,
        other => {
            return Err(loadflow::error::Error::config(format!(
                "unsupported flow document format: {other:?} (expected yaml or json)"
            )))
        }
    };
    Ok(flow)
}
