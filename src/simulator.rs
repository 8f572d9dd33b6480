//! User simulator: the per-user lifecycle that repeatedly runs one flow
//! iteration against a fresh execution context and identity.

use crate::context::{reserved, Context};
use crate::flow::FlowMap;
use crate::identity;
use crate::interpreter::{run_steps, StepPacing};
use crate::metrics::Metrics;
use crate::network::RequestExecutor;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Called at the start of every iteration after the first, letting a caller
/// inject per-iteration state before the flow runs again.
pub type OnIterationStart = Arc<dyn Fn(u64, &mut Context) + Send + Sync>;

/// Parameters shared by every simulated user in a run.
#[derive(Clone)]
pub struct SimulatorConfig {
    pub flow: Arc<FlowMap>,
    pub executor: Arc<RequestExecutor>,
    pub metrics: Arc<Metrics>,
    pub pacing: StepPacing,
    /// Fixed delay between iterations for the same user. When `None`, the
    /// delay is instead a fresh uniform random draw from `pacing`'s
    /// min/max bounds each iteration (minimum 1ms), per spec 4.7 step f.
    pub flow_cycle_delay_ms: Option<u64>,
    pub run_once: bool,
    pub on_iteration_start: Option<OnIterationStart>,
    /// Header name carrying the per-iteration fake source IP (`config.xffHeaderName`).
    pub xff_header_name: String,
}

impl SimulatorConfig {
    fn inter_iteration_delay(&self) -> Duration {
        match self.flow_cycle_delay_ms {
            Some(ms) => Duration::from_millis(ms),
            None => {
                let min = self.pacing.min_ms.max(1);
                let max = self.pacing.max_ms.max(min);
                Duration::from_millis(fastrand::u64(min..=max))
            }
        }
    }
}

/// Runs one simulated user's lifecycle until `stop_flag` is raised (or, in
/// `run_once` mode, for exactly one iteration).
pub async fn simulate_user(
    user_id: u32,
    config: SimulatorConfig,
    stop_flag: Arc<AtomicBool>,
    active_users: Arc<AtomicU32>,
) {
    active_users.fetch_add(1, Ordering::SeqCst);
    let _guard = ActiveUserGuard(&active_users);

    let span = tracing::info_span!("user", user_id);
    let _entered = span.enter();

    let mut iteration: u64 = 0;
    loop {
        if stop_flag.load(Ordering::Relaxed) {
            break;
        }
        iteration += 1;

        let identity = identity::generate();
        let mut ctx = Context::new();
        ctx.insert(reserved::USER_ID, user_id as i64);
        ctx.insert(reserved::USER_FAKE_IP, identity.fake_ip.to_string());
        ctx.insert(reserved::FLOW_INSTANCE, uuid::Uuid::new_v4().to_string());
        ctx.insert(
            reserved::FLOW_START_TIME_EPOCH,
            chrono::Utc::now().timestamp(),
        );
        ctx.extend_top_level(config.flow.static_vars.clone());

        // spec §4.5 step 4, layer 1: a fresh per-iteration session identity
        // (user-agent, accept-language, fake source IP) forms the base
        // header layer, overridden by the flow's own headers and then the
        // step's.
        let mut session_headers = HashMap::new();
        session_headers.insert("User-Agent".to_string(), identity.user_agent.to_string());
        session_headers.insert(
            "Accept-Language".to_string(),
            identity.accept_language.to_string(),
        );
        session_headers.insert(config.xff_header_name.clone(), identity.fake_ip.to_string());
        ctx.set_session_headers(session_headers);

        if iteration >= 2 {
            if let Some(ref hook) = config.on_iteration_start {
                hook(iteration, &mut ctx);
            }
        }

        let start = Instant::now();
        let result = run_steps(
            &config.flow.steps,
            &mut ctx,
            &config.executor,
            config.pacing,
            &stop_flag,
        )
        .await;
        let elapsed = start.elapsed();

        let succeeded = match result {
            Ok(()) => ctx.flow_error().is_none(),
            Err(e) => {
                tracing::warn!(error = %e, iteration, "flow iteration aborted");
                false
            }
        };
        if !succeeded {
            if let Some(err) = ctx.flow_error() {
                tracing::warn!(iteration, flow_error = %err, "flow iteration ended with an error");
            }
        }
        config.metrics.record_iteration(elapsed, succeeded);

        if config.run_once {
            break;
        }
        if stop_flag.load(Ordering::Relaxed) {
            break;
        }
        let delay = config.inter_iteration_delay();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
    }
}

struct ActiveUserGuard<'a>(&'a Arc<AtomicU32>);

impl Drop for ActiveUserGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}
