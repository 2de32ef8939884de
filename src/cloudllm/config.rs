//! Configuration for the agent runtime.
//!
//! Provides [`RuntimeConfig`] for the resource budgets the engine enforces
//! and the directory used by the bundled [`crate::cloudllm::memory::ThoughtChainMemory`]
//! collaborator. Users construct this manually — no TOML/YAML/config-file
//! parsing dependency is introduced; a blueprint loader that builds agents
//! and configuration from a file is explicitly out of scope for this crate.
//!
//! # Example
//!
//! ```rust
//! use agent_runtime_core::cloudllm::config::RuntimeConfig;
//!
//! let config = RuntimeConfig::default();
//! assert_eq!(config.max_tool_calls_per_batch, 64);
//! ```

use std::path::PathBuf;
use std::time::Duration;

/// Global resource budgets and storage locations for the runtime.
///
/// This struct is intentionally minimal; fields are public and meant to be
/// overridden directly rather than loaded from a config file.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Directory where `.jsonl` memory/snapshot files are stored.
    pub storage_dir: PathBuf,
    /// Hard cap on tool calls accepted in a single batch (§5 resource budgets).
    pub max_tool_calls_per_batch: usize,
    /// Hard cap on nested sub-agent recursion depth.
    pub max_sub_agent_depth: u32,
    /// How long the engine waits for the next stream event before treating
    /// the LLM call as timed out.
    pub max_stream_idle_time: Duration,
    /// Default per-agent turn budget used when an `AgentDefinition` doesn't
    /// declare its own `max_turns`.
    pub default_max_turns: u32,
    /// Whether structured-output validation retries count against
    /// `max_turns` (see SPEC_FULL.md §9 decisions).
    pub structured_retries_count_against_max_turns: bool,
    /// How many times `interact_structured` re-prompts with a reflective
    /// error message after a schema-validation failure before surfacing
    /// `structured_parse_error` (§4.6.1 step 4).
    pub structured_output_retry_limit: u32,
    /// Attempts the engine makes against the transport for one LLM call,
    /// counting the first attempt, before giving up on a retryable error (§7).
    pub transport_retry_max_attempts: u32,
    /// Base delay of the engine's exponential backoff between transport
    /// retries; attempt `n` (0-indexed) waits `base * 2^n`.
    pub transport_retry_base_delay: Duration,
}

impl Default for RuntimeConfig {
    /// Defaults matching the resource budgets called out in the component
    /// design: 64 tool calls per batch, depth-8 sub-agent recursion, a
    /// 120-second stream idle timeout, and 10 turns per run unless an agent
    /// overrides it.
    fn default() -> Self {
        Self {
            storage_dir: PathBuf::from("agent_runtime_snapshots"),
            max_tool_calls_per_batch: 64,
            max_sub_agent_depth: 8,
            max_stream_idle_time: Duration::from_secs(120),
            default_max_turns: 10,
            structured_retries_count_against_max_turns: true,
            structured_output_retry_limit: 1,
            transport_retry_max_attempts: 3,
            transport_retry_base_delay: Duration::from_millis(200),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_matches_documented_budgets() {
        let config = RuntimeConfig::default();
        assert_eq!(config.max_tool_calls_per_batch, 64);
        assert_eq!(config.max_sub_agent_depth, 8);
        assert_eq!(config.max_stream_idle_time, Duration::from_secs(120));
        assert_eq!(config.structured_output_retry_limit, 1);
        assert_eq!(config.transport_retry_max_attempts, 3);
    }

    #[test]
    fn fields_are_directly_overridable() {
        let config = RuntimeConfig {
            max_tool_calls_per_batch: 8,
            ..RuntimeConfig::default()
        };
        assert_eq!(config.max_tool_calls_per_batch, 8);
    }
}
