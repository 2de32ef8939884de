//! Run observability: a single callback trait with no-op defaults,
//! mirroring `event.rs`'s `EventHandler` shape (one trait, override only
//! what you care about) but scoped to exactly the lifecycle points the
//! Interaction Engine passes through, rather than the teacher's broader
//! agent/orchestration event surface.

use async_trait::async_trait;

use crate::cloudllm::error::EngineError;

/// Real-time notifications about one run's progress through the engine
/// state machine. All methods default to doing nothing, so a caller only
/// implements the ones it needs.
#[async_trait]
pub trait Telemetry: Send + Sync {
    async fn run_start(&self, _run_id: &str) {}
    async fn turn_start(&self, _run_id: &str, _turn: u32) {}
    async fn llm_call_start(&self, _run_id: &str) {}
    async fn llm_call_end(&self, _run_id: &str, _output_tokens: Option<usize>) {}
    async fn tool_call_start(&self, _run_id: &str, _call_id: &str, _tool_name: &str) {}
    async fn tool_call_end(&self, _run_id: &str, _call_id: &str, _succeeded: bool) {}
    async fn guardrail_reject(&self, _run_id: &str, _guardrail_name: &str, _reason: &str) {}
    async fn handoff(&self, _run_id: &str, _target_agent_id: &str) {}
    async fn pause(&self, _run_id: &str, _pending_call_ids: &[String]) {}
    async fn resume(&self, _run_id: &str) {}
    async fn run_end(&self, _run_id: &str, _error: Option<&EngineError>) {}
}

/// A no-op sink, used when a caller doesn't wire up its own [`Telemetry`].
pub struct NoopTelemetry;

#[async_trait]
impl Telemetry for NoopTelemetry {}

/// Forwards every event to the `log` facade at a level proportional to its
/// severity, the same forwarding role `event.rs`'s doc examples show a
/// handler playing, but wired directly into `log` rather than requiring the
/// caller to write their own `println!`-based handler.
pub struct LoggingTelemetry;

#[async_trait]
impl Telemetry for LoggingTelemetry {
    async fn run_start(&self, run_id: &str) {
        log::info!("run {} started", run_id);
    }

    async fn turn_start(&self, run_id: &str, turn: u32) {
        log::debug!("run {} entering turn {}", run_id, turn);
    }

    async fn llm_call_start(&self, run_id: &str) {
        log::debug!("run {} calling llm transport", run_id);
    }

    async fn llm_call_end(&self, run_id: &str, output_tokens: Option<usize>) {
        log::debug!("run {} llm call complete ({:?} output tokens)", run_id, output_tokens);
    }

    async fn tool_call_start(&self, run_id: &str, call_id: &str, tool_name: &str) {
        log::debug!("run {} dispatching tool {} ({})", run_id, tool_name, call_id);
    }

    async fn tool_call_end(&self, run_id: &str, call_id: &str, succeeded: bool) {
        log::debug!("run {} tool call {} finished (succeeded={})", run_id, call_id, succeeded);
    }

    async fn guardrail_reject(&self, run_id: &str, guardrail_name: &str, reason: &str) {
        log::warn!("run {} guardrail {} rejected: {}", run_id, guardrail_name, reason);
    }

    async fn handoff(&self, run_id: &str, target_agent_id: &str) {
        log::info!("run {} handed off to {}", run_id, target_agent_id);
    }

    async fn pause(&self, run_id: &str, pending_call_ids: &[String]) {
        log::info!("run {} paused awaiting confirmation for {:?}", run_id, pending_call_ids);
    }

    async fn resume(&self, run_id: &str) {
        log::info!("run {} resumed", run_id);
    }

    async fn run_end(&self, run_id: &str, error: Option<&EngineError>) {
        match error {
            Some(e) => log::error!("run {} ended with error: {}", run_id, e),
            None => log::info!("run {} completed", run_id),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn noop_telemetry_accepts_every_callback_without_panicking() {
        let telemetry = NoopTelemetry;
        telemetry.run_start("r1").await;
        telemetry.turn_start("r1", 1).await;
        telemetry.pause("r1", &["c1".to_string()]).await;
        telemetry.run_end("r1", None).await;
    }
}
