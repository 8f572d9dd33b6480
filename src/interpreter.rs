//! Step interpreter: walks a flow's step list against a single execution
//! context, dispatching request/condition/loop steps, honoring stop
//! signals and the `flow_error` short-circuit between every step.

use crate::condition::{evaluate, ConditionData};
use crate::context::{reserved, Context};
use crate::error::Result;
use crate::flow::{OnFailure, Step};
use crate::network::{FailureKind, RequestExecutor};
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

/// Inter-step random sleep bounds, in milliseconds.
#[derive(Debug, Clone, Copy)]
pub struct StepPacing {
    pub min_ms: u64,
    pub max_ms: u64,
}

impl StepPacing {
    pub fn sample(&self) -> Duration {
        if self.max_ms <= self.min_ms {
            return Duration::from_millis(self.min_ms);
        }
        let ms = fastrand::u64(self.min_ms..=self.max_ms);
        Duration::from_millis(ms)
    }
}

/// Walks `steps` sequentially against `ctx`, stopping early if `stop_flag`
/// is raised or a request step sets `flow_error` under an `onFailure: stop`
/// policy.
pub async fn run_steps(
    steps: &[Step],
    ctx: &mut Context,
    executor: &RequestExecutor,
    pacing: StepPacing,
    stop_flag: &AtomicBool,
) -> Result<()> {
    for (i, step) in steps.iter().enumerate() {
        if stop_flag.load(Ordering::Relaxed) {
            return Ok(());
        }
        if ctx.flow_error().is_some() {
            return Ok(());
        }
        if i > 0 {
            tokio::time::sleep(pacing.sample()).await;
        }

        run_step(step, ctx, executor, pacing, stop_flag).await?;

        if ctx.flow_error().is_some() {
            return Ok(());
        }
    }
    Ok(())
}

async fn run_step(
    step: &Step,
    ctx: &mut Context,
    executor: &RequestExecutor,
    pacing: StepPacing,
    stop_flag: &AtomicBool,
) -> Result<()> {
    match step {
        Step::Request(req) => {
            let outcome = executor.execute(req, ctx).await?;

            ctx.insert(
                &format!("response_{}_status", req.id),
                Value::Number(outcome.status.into()),
            );
            ctx.insert(
                &format!("response_{}_headers", req.id),
                Value::Object(outcome.headers.clone()),
            );
            ctx.insert(&format!("response_{}_body", req.id), outcome.body.clone());
            ctx.insert(
                &format!("response_{}_error", req.id),
                match &outcome.error {
                    Some(e) => Value::String(e.clone()),
                    None => Value::Null,
                },
            );

            executor.apply_extraction(req, outcome.status, &outcome.headers, &outcome.body, ctx);

            match outcome.failure {
                FailureKind::None => {}
                FailureKind::PreRequest => {
                    tracing::warn!(step = %step.label(), status = outcome.status, "pre-request failure");
                    // Pre-request failures always halt the iteration, regardless
                    // of the step's onFailure policy (spec §7).
                    ctx.set_flow_error_if_absent(format!(
                        "step {} failed before sending: {}",
                        req.id,
                        outcome.error.as_deref().unwrap_or("unknown error")
                    ));
                }
                FailureKind::Protocol => {
                    tracing::warn!(step = %step.label(), status = outcome.status, "request step failed");
                    if matches!(RequestExecutor::on_failure_policy(req), OnFailure::Stop) {
                        ctx.set_flow_error_if_absent(format!(
                            "step {} failed with status {}",
                            req.id, outcome.status
                        ));
                    }
                }
            }
            Ok(())
        }
        Step::Condition(cond) => {
            let structured_usable = cond
                .condition_data
                .as_ref()
                .is_some_and(ConditionData::is_usable);
            let branch_taken = if structured_usable {
                evaluate(cond.condition_data.as_ref().unwrap(), ctx)
            } else if let Some(legacy) = cond.condition.as_deref().filter(|s| !s.is_empty()) {
                crate::condition::evaluate_legacy(legacy, ctx)
            } else {
                false
            };
            let branch = if branch_taken { &cond.then } else { &cond.r#else };
            Box::pin(run_steps(branch, ctx, executor, pacing, stop_flag)).await
        }
        Step::Loop(loop_step) => {
            // source accepts either a bare path or a `{{path}}`-wrapped one.
            let source_path = loop_step
                .source
                .strip_prefix("{{")
                .and_then(|s| s.strip_suffix("}}"))
                .map(str::trim)
                .unwrap_or(loop_step.source.as_str());
            let items = ctx.get(source_path).cloned();
            let items = match items {
                Some(serde_json::Value::Array(items)) => items,
                _ => {
                    tracing::warn!(
                        step = %step.label(),
                        source = %loop_step.source,
                        "loop source is missing or not an array, skipping"
                    );
                    return Ok(());
                }
            };

            for (index, item) in items.into_iter().enumerate() {
                if stop_flag.load(Ordering::Relaxed) || ctx.flow_error().is_some() {
                    break;
                }
                let mut iter_ctx = ctx.deep_copy();
                iter_ctx.set(&loop_step.loop_variable, item);
                iter_ctx.set(&format!("{}_index", loop_step.loop_variable), index as u64);
                Box::pin(run_steps(
                    &loop_step.steps,
                    &mut iter_ctx,
                    executor,
                    pacing,
                    stop_flag,
                ))
                .await?;
                if let Some(err) = iter_ctx.flow_error() {
                    ctx.set(reserved::FLOW_ERROR, err.clone());
                    break;
                }
            }
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::Context;
    use crate::flow::{ConditionStep, LoopStep, Method, OnFailure, RequestStep, StepId};
    use serde_json::json;
    use std::collections::HashMap;

    fn executor() -> RequestExecutor {
        RequestExecutor::new(
            url::Url::parse("http://127.0.0.1:1/").unwrap(),
            Duration::from_secs(5),
            true,
            None,
            HashMap::new(),
            std::sync::Arc::new(crate::metrics::Metrics::new().unwrap()),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn loop_over_missing_source_is_a_noop() {
        let loop_step = Step::Loop(LoopStep {
            id: StepId("l1".into()),
            name: None,
            source: "items".into(),
            loop_variable: "item".into(),
            steps: vec![],
        });
        let mut ctx = Context::new();
        let stop = AtomicBool::new(false);
        let result = run_steps(
            &[loop_step],
            &mut ctx,
            &executor(),
            StepPacing { min_ms: 0, max_ms: 0 },
            &stop,
        )
        .await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn condition_false_with_no_else_is_a_noop() {
        let cond = Step::Condition(ConditionStep {
            id: StepId("c1".into()),
            name: None,
            condition: None,
            condition_data: Some(crate::condition::ConditionData {
                variable: "x".into(),
                operator: "exists".into(),
                value: serde_json::Value::Null,
            }),
            then: vec![],
            r#else: vec![],
        });
        let mut ctx = Context::new();
        let stop = AtomicBool::new(false);
        assert!(run_steps(
            &[cond],
            &mut ctx,
            &executor(),
            StepPacing { min_ms: 0, max_ms: 0 },
            &stop
        )
        .await
        .is_ok());
    }

    #[tokio::test]
    async fn stop_flag_halts_before_next_step() {
        let mut ctx = Context::new();
        ctx.set("ran_second", json!(false));
        let req1 = Step::Request(RequestStep {
            id: StepId("r1".into()),
            name: None,
            method: Method::Get,
            url: "http://127.0.0.1:1/does-not-matter".into(),
            headers: HashMap::new(),
            body: None,
            extract: HashMap::new(),
            on_failure: OnFailure::Continue,
        });
        let stop = AtomicBool::new(true);
        let result = run_steps(
            &[req1],
            &mut ctx,
            &executor(),
            StepPacing { min_ms: 0, max_ms: 0 },
            &stop,
        )
        .await;
        assert!(result.is_ok());
    }
}
