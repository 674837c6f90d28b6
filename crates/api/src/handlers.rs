//! Built-in job handlers shipped with the binary.
//!
//! Real integrations (ad platforms, analytics syncs, automation flows) are
//! registered by the services that own them; these exist so a fresh
//! deployment can exercise the queue end to end.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Value, json};

use clinicflow_infra::jobs::{HandlerRegistry, JobContext, JobHandler, JobOutcome, parse_resume_at};

/// Completes immediately, echoing the payload back as the result.
#[derive(Debug, Default)]
pub struct NoopHandler;

#[async_trait]
impl JobHandler for NoopHandler {
    async fn run(&self, payload: Value, ctx: JobContext) -> anyhow::Result<JobOutcome> {
        Ok(JobOutcome::completed_with(json!({
            "ok": true,
            "attempt": ctx.job().attempts,
            "payload": payload,
        })))
    }
}

/// Payload accepted by [`ScriptedHandler`].
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct Script {
    /// Fail with this message.
    fail: Option<String>,
    /// Ask to be retried at this time (RFC 3339 or epoch ms).
    resume_at: Option<String>,
    /// Ask to be retried after this many seconds.
    retry_after_secs: Option<u64>,
    /// Sleep before deciding, to exercise timeouts.
    sleep_ms: Option<u64>,
    result: Option<Value>,
}

/// Follows instructions in its payload: complete, fail, or wait.
///
/// Used by smoke tests and operators to check scheduler behavior without
/// touching an external API.
#[derive(Debug, Default)]
pub struct ScriptedHandler;

#[async_trait]
impl JobHandler for ScriptedHandler {
    async fn run(&self, _payload: Value, ctx: JobContext) -> anyhow::Result<JobOutcome> {
        let script: Script = ctx.payload_as()?;

        if let Some(ms) = script.sleep_ms {
            tokio::time::sleep(Duration::from_millis(ms)).await;
        }
        if let Some(message) = script.fail {
            anyhow::bail!(message);
        }

        let waiting = match (script.resume_at.as_deref(), script.retry_after_secs) {
            (Some(raw), _) => Some(match parse_resume_at(raw) {
                Some(at) => JobOutcome::waiting_until(at),
                // Unparseable resume times fall back to the default backoff.
                None => JobOutcome::waiting(),
            }),
            (None, Some(secs)) => Some(JobOutcome::waiting_for(Duration::from_secs(secs))),
            (None, None) => None,
        };

        let outcome = waiting.unwrap_or_else(JobOutcome::completed);
        Ok(match script.result {
            Some(result) => outcome.with_result(result),
            None => outcome,
        })
    }
}

/// Register every built-in handler.
pub fn register_builtin(registry: &mut HandlerRegistry) {
    registry
        .register("noop", Arc::new(NoopHandler))
        .register("scripted", Arc::new(ScriptedHandler));
}
