//! Error taxonomy for the agent runtime.
//!
//! The runtime never throws across its public surface (panics aside): every
//! fallible operation returns a [`Result<T, EngineError>`], and each variant
//! of [`EngineError`] corresponds to exactly one error `kind` a caller can
//! match on. Internal helpers that need to interoperate with foreign error
//! types (a transport's own error, a tool's own error) use the
//! [`DynError`] alias and are mapped into an `EngineError` before crossing
//! a public boundary.

use std::error::Error;
use std::fmt;

/// Catch-all alias for boundary-crossing errors from collaborators
/// (transports, tools, memory) whose error types we don't own.
pub type DynError = Box<dyn Error + Send + Sync>;

/// The full error taxonomy a caller of the public engine surface can observe.
#[derive(Debug, Clone)]
pub enum EngineError {
    /// An input guardrail rejected the request before any LLM call was made.
    InputGuardrailReject { reason: String },
    /// An output guardrail rejected the assistant's final response.
    OutputGuardrailReject { reason: String },
    /// The run exhausted `agent.max_turns` without reaching a terminal state.
    MaxTurnsExceeded { turns: u32 },
    /// The LLM transport failed. `retryable` reflects the transport's own
    /// classification, not a guess made by the engine.
    LlmTransportError { message: String, retryable: bool },
    /// The transport produced no events for longer than `max_stream_idle_time`.
    LlmStreamTimeout,
    /// A tool call referenced a name absent from the registry.
    ToolUnknown { name: String },
    /// A tool call's arguments failed schema validation.
    ToolBadArgs { name: String, detail: String },
    /// A tool ran and reported an application-level failure.
    ToolExecutionError { call_id: String, detail: String },
    /// A `$ref:call_id.pointer` token pointed at a result that never
    /// materialized (missing call id, or a dangling JSON pointer).
    ToolUnresolvedRef { call_id: String, reference: String },
    /// The dependency graph built from `$ref` tokens contains a cycle.
    ToolCycleDetected,
    /// Structured output failed schema validation after exhausting retries.
    StructuredParseError { detail: String },
    /// A `RunSnapshot`'s `version` is older than this engine's minimum.
    SnapshotIncompatible { found: u32, minimum: u32 },
    /// The run was cooperatively canceled.
    Canceled,
    /// Sub-agent nesting exceeded `max_sub_agent_depth`.
    SubAgentDepthExceeded { depth: u32 },
    /// `resume()` was called on a snapshot with a confirmation-requiring
    /// tool call that has no approve/reject decision attached.
    ConfirmationMissing { call_id: String },
    /// A single response requested more tool calls than
    /// `RuntimeConfig::max_tool_calls_per_batch` allows.
    ToolBatchTooLarge { requested: usize, max: usize },
}

impl fmt::Display for EngineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EngineError::InputGuardrailReject { reason } => {
                write!(f, "input guardrail rejected request: {}", reason)
            }
            EngineError::OutputGuardrailReject { reason } => {
                write!(f, "output guardrail rejected response: {}", reason)
            }
            EngineError::MaxTurnsExceeded { turns } => {
                write!(f, "max_turns exceeded after {} turns", turns)
            }
            EngineError::LlmTransportError { message, retryable } => {
                write!(f, "llm transport error (retryable={}): {}", retryable, message)
            }
            EngineError::LlmStreamTimeout => write!(f, "llm stream idle timeout"),
            EngineError::ToolUnknown { name } => write!(f, "unknown tool: {}", name),
            EngineError::ToolBadArgs { name, detail } => {
                write!(f, "bad arguments for tool {}: {}", name, detail)
            }
            EngineError::ToolExecutionError { call_id, detail } => {
                write!(f, "tool call {} failed: {}", call_id, detail)
            }
            EngineError::ToolUnresolvedRef { call_id, reference } => write!(
                f,
                "tool call {} has an unresolved reference: {}",
                call_id, reference
            ),
            EngineError::ToolCycleDetected => write!(f, "tool call batch contains a dependency cycle"),
            EngineError::StructuredParseError { detail } => {
                write!(f, "structured output failed validation: {}", detail)
            }
            EngineError::SnapshotIncompatible { found, minimum } => write!(
                f,
                "snapshot version {} is older than minimum supported version {}",
                found, minimum
            ),
            EngineError::Canceled => write!(f, "run was canceled"),
            EngineError::SubAgentDepthExceeded { depth } => {
                write!(f, "sub-agent recursion exceeded max depth {}", depth)
            }
            EngineError::ConfirmationMissing { call_id } => write!(
                f,
                "resume is missing an approve/reject decision for call {}",
                call_id
            ),
            EngineError::ToolBatchTooLarge { requested, max } => write!(
                f,
                "tool call batch of {} exceeds max_tool_calls_per_batch ({})",
                requested, max
            ),
        }
    }
}

impl Error for EngineError {}

/// Stable string tag for each variant, used by callers who want to match on
/// `result.error.kind` without pulling in the enum itself (e.g. across an
/// FFI or serialization boundary).
impl EngineError {
    pub fn kind(&self) -> &'static str {
        match self {
            EngineError::InputGuardrailReject { .. } => "input_guardrail_reject",
            EngineError::OutputGuardrailReject { .. } => "output_guardrail_reject",
            EngineError::MaxTurnsExceeded { .. } => "max_turns_exceeded",
            EngineError::LlmTransportError { .. } => "llm_transport_error",
            EngineError::LlmStreamTimeout => "llm_stream_timeout",
            EngineError::ToolUnknown { .. } => "tool_unknown",
            EngineError::ToolBadArgs { .. } => "tool_bad_args",
            EngineError::ToolExecutionError { .. } => "tool_execution_error",
            EngineError::ToolUnresolvedRef { .. } => "tool_unresolved_ref",
            EngineError::ToolCycleDetected => "tool_cycle_detected",
            EngineError::StructuredParseError { .. } => "structured_parse_error",
            EngineError::SnapshotIncompatible { .. } => "snapshot_incompatible",
            EngineError::Canceled => "canceled",
            EngineError::SubAgentDepthExceeded { .. } => "sub_agent_depth_exceeded",
            EngineError::ConfirmationMissing { .. } => "confirmation_missing",
            EngineError::ToolBatchTooLarge { .. } => "tool_batch_too_large",
        }
    }

    /// Whether the engine's own retry schedule should attempt this error
    /// again (distinct from the transport's own `retryable` flag, which this
    /// delegates to).
    pub fn is_retryable(&self) -> bool {
        matches!(self, EngineError::LlmTransportError { retryable: true, .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_is_stable_per_variant() {
        let err = EngineError::ToolUnknown { name: "foo".into() };
        assert_eq!(err.kind(), "tool_unknown");
        assert!(!err.is_retryable());
    }

    #[test]
    fn retryable_follows_transport_flag() {
        let retryable = EngineError::LlmTransportError { message: "timeout".into(), retryable: true };
        let permanent = EngineError::LlmTransportError { message: "bad key".into(), retryable: false };
        assert!(retryable.is_retryable());
        assert!(!permanent.is_retryable());
    }

    #[test]
    fn display_includes_detail() {
        let err = EngineError::MaxTurnsExceeded { turns: 4 };
        assert_eq!(err.to_string(), "max_turns exceeded after 4 turns");
    }

    #[test]
    fn tool_batch_too_large_is_not_retryable() {
        let err = EngineError::ToolBatchTooLarge { requested: 80, max: 64 };
        assert_eq!(err.kind(), "tool_batch_too_large");
        assert!(!err.is_retryable());
    }
}
