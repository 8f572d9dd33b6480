//! Orchestrator: the top-level lifecycle control surface. Owns the flow
//! document, the request executor, and the pool of per-user simulator
//! tasks, and exposes the start/stop/metrics contract.

use crate::config::ContainerConfig;
use crate::error::{Error, Result};
use crate::flow::{validate_flow, FlowMap};
use crate::interpreter::StepPacing;
use crate::metrics::{Metrics, Snapshot};
use crate::network::RequestExecutor;
use crate::simulator::{simulate_user, OnIterationStart, SimulatorConfig};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

/// Runs a declarative flow against a target with N concurrent simulated
/// users until told to stop.
pub struct Orchestrator {
    config: ContainerConfig,
    flow: Arc<FlowMap>,
    metrics: Arc<Metrics>,
    executor: Arc<RequestExecutor>,
    stop_flag: Arc<AtomicBool>,
    active_users: Arc<AtomicU32>,
    handles: Mutex<Vec<JoinHandle<()>>>,
    on_iteration_start: Option<OnIterationStart>,
}

impl Orchestrator {
    /// Builds an orchestrator from a validated config and flow document.
    pub fn new(config: ContainerConfig, flow: FlowMap) -> Result<Self> {
        config.validate()?;
        validate_flow(&flow)?;

        let mut default_headers = flow.headers.clone();
        default_headers
            .entry("Accept".to_string())
            .or_insert_with(|| "application/json".to_string());

        let metrics = Arc::new(Metrics::new()?);

        let executor = RequestExecutor::new(
            config.flow_target_url.clone(),
            Duration::from_secs(config.request_timeout_secs),
            config.override_step_url_host,
            config.flow_target_dns_override,
            default_headers,
            metrics.clone(),
        )?;

        Ok(Self {
            config,
            flow: Arc::new(flow),
            metrics,
            executor: Arc::new(executor),
            stop_flag: Arc::new(AtomicBool::new(false)),
            active_users: Arc::new(AtomicU32::new(0)),
            handles: Mutex::new(Vec::new()),
            on_iteration_start: None,
        })
    }

    /// Installs a hook invoked at the start of every iteration after the
    /// first. Must be called before [`Orchestrator::start`].
    pub fn with_on_iteration_start(mut self, hook: OnIterationStart) -> Self {
        self.on_iteration_start = Some(hook);
        self
    }

    /// Starts `simUsers` concurrent simulator tasks. Idempotent: calling
    /// `start` while already running is a no-op.
    pub fn start(&self) -> Result<()> {
        let mut handles = self.handles.lock();
        if !handles.is_empty() {
            return Ok(());
        }
        if self.stop_flag.load(Ordering::SeqCst) {
            return Err(Error::Validation(
                "orchestrator already stopped; construct a new one to run again".into(),
            ));
        }

        let pacing = StepPacing {
            min_ms: self.config.min_sleep_ms,
            max_ms: self.config.max_sleep_ms,
        };

        for user_id in 0..self.config.sim_users {
            let sim_config = SimulatorConfig {
                flow: self.flow.clone(),
                executor: self.executor.clone(),
                metrics: self.metrics.clone(),
                pacing,
                flow_cycle_delay_ms: self.config.flow_cycle_delay_ms,
                run_once: self.config.run_once,
                on_iteration_start: self.on_iteration_start.clone(),
                xff_header_name: self.config.xff_header_name.clone(),
            };
            let stop_flag = self.stop_flag.clone();
            let active_users = self.active_users.clone();
            handles.push(tokio::spawn(simulate_user(
                user_id,
                sim_config,
                stop_flag,
                active_users,
            )));
        }

        Ok(())
    }

    /// Raises the stop signal and waits for every simulator task to finish
    /// its current iteration and exit. Idempotent.
    pub async fn stop(&self) {
        self.stop_flag.store(true, Ordering::SeqCst);
        let handles = {
            let mut guard = self.handles.lock();
            std::mem::take(&mut *guard)
        };
        for handle in handles {
            let _ = handle.await;
        }
    }

    /// Number of simulator tasks currently between iterations or mid-flow.
    pub fn active_user_count(&self) -> u32 {
        self.active_users.load(Ordering::SeqCst)
    }

    /// A point-in-time throughput/latency snapshot.
    pub fn metrics_snapshot(&self) -> Snapshot {
        self.metrics.snapshot()
    }

    /// Renders the Prometheus text exposition of all metrics.
    pub fn export_prometheus(&self) -> Result<String> {
        self.metrics.export_prometheus()
    }
}
