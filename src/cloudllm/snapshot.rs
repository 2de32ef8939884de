//! Run Snapshot (C7): the serializable freeze/resume boundary for a paused
//! run, plus the approve/reject/resume mutation surface.
//!
//! Grounded in `thought_chain.rs`'s append-only `.jsonl` persistence and its
//! SHA-256 integrity fingerprint (`compute_thought_hash`), adapted here to a
//! single versioned record per run rather than a growing hash chain of many
//! thoughts: one snapshot file is overwritten each time the run pauses, and
//! its `integrity_hash` covers the serialized payload so a caller can detect
//! on-disk tampering or truncation before trusting a resume.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

use crate::cloudllm::context::Context;
use crate::cloudllm::error::{DynError, EngineError};
use crate::cloudllm::tool_executor::ToolCallRequest;

/// The current on-disk snapshot format version. Bumped whenever a
/// backward-incompatible field is added or removed.
pub const SNAPSHOT_VERSION: u32 = 1;

/// Where in the state machine a paused run sits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunPhase {
    Running,
    PausedForConfirmation,
    Done,
}

/// A serializable copy of a [`Context`]'s conversation, independent of the
/// live `Context` type so the wire format doesn't break when `Context`
/// grows new in-memory-only fields.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextSnapshot {
    pub messages_json: Vec<serde_json::Value>,
    pub turn_count: u32,
    pub state: HashMap<String, serde_json::Value>,
}

/// One pending tool call awaiting an approve/reject decision.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingCall {
    pub call_id: String,
    pub tool_name: String,
    pub arguments: serde_json::Value,
}

/// A complete, versioned freeze of one run. Unknown top-level fields found
/// on disk are preserved in `extra` rather than dropped, so a newer engine
/// reading an older snapshot (or vice versa, within the same major version)
/// doesn't silently discard data it doesn't recognize.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSnapshot {
    pub version: u32,
    pub run_id: String,
    pub agent_id: String,
    pub context: ContextSnapshot,
    pub pending_batch: Vec<PendingCall>,
    pub partial_results: HashMap<String, serde_json::Value>,
    pub decisions: HashMap<String, bool>,
    pub phase: RunPhase,
    pub created_at: DateTime<Utc>,
    #[serde(flatten)]
    pub extra: HashMap<String, serde_json::Value>,
}

impl RunSnapshot {
    pub fn new(run_id: impl Into<String>, agent_id: impl Into<String>, context: &Context, pending_batch: Vec<ToolCallRequest>) -> Self {
        let messages_json = context
            .messages()
            .iter()
            .map(|m| serde_json::to_value(DebugMessage(m)).unwrap_or(serde_json::Value::Null))
            .collect();
        Self {
            version: SNAPSHOT_VERSION,
            run_id: run_id.into(),
            agent_id: agent_id.into(),
            context: ContextSnapshot { messages_json, turn_count: context.turn_count(), state: HashMap::new() },
            pending_batch: pending_batch
                .into_iter()
                .map(|r| PendingCall { call_id: r.call_id, tool_name: r.tool_name, arguments: r.arguments })
                .collect(),
            partial_results: HashMap::new(),
            decisions: HashMap::new(),
            phase: RunPhase::PausedForConfirmation,
            created_at: Utc::now(),
            extra: HashMap::new(),
        }
    }

    /// Record an approve (`true`) or reject (`false`) decision for one
    /// pending call. Does not itself resume the run.
    pub fn decide(&mut self, call_id: &str, approve: bool) {
        self.decisions.insert(call_id.to_string(), approve);
    }

    /// Verify every pending call has a decision attached, per
    /// `EngineError::ConfirmationMissing` (§7).
    pub fn check_all_decided(&self) -> Result<(), EngineError> {
        for call in &self.pending_batch {
            if !self.decisions.contains_key(&call.call_id) {
                return Err(EngineError::ConfirmationMissing { call_id: call.call_id.clone() });
            }
        }
        Ok(())
    }

    fn canonical_bytes(&self) -> Vec<u8> {
        serde_json::to_vec(self).unwrap_or_default()
    }

    fn integrity_hash(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.canonical_bytes());
        format!("{:x}", hasher.finalize())
    }

    /// Persist this snapshot to `storage_dir/{run_id}.snapshot.jsonl`,
    /// writing the integrity hash as a second line so a reader can verify
    /// the payload wasn't truncated or altered in place.
    pub fn save(&self, storage_dir: &Path) -> Result<PathBuf, DynError> {
        std::fs::create_dir_all(storage_dir)?;
        let path = storage_dir.join(format!("{}.snapshot.jsonl", self.run_id));
        let payload = serde_json::to_string(self)?;
        let hash = self.integrity_hash();
        std::fs::write(&path, format!("{}\n{}\n", payload, hash))?;
        Ok(path)
    }

    /// Load and verify a snapshot previously written by [`RunSnapshot::save`].
    /// Rejects a snapshot whose `version` is older than [`SNAPSHOT_VERSION`]
    /// with [`EngineError::SnapshotIncompatible`], and rejects a payload
    /// whose recomputed hash doesn't match the stored one.
    pub fn load(path: &Path) -> Result<Self, DynError> {
        let raw = std::fs::read_to_string(path)?;
        let mut lines = raw.lines();
        let payload = lines.next().ok_or("empty snapshot file")?;
        let stored_hash = lines.next().ok_or("snapshot missing integrity hash")?;

        let snapshot: RunSnapshot = serde_json::from_str(payload)?;
        // constant-time compare: a snapshot file can be handed back by an
        // external resume request, so don't leak match-length via timing.
        let computed = snapshot.integrity_hash();
        if computed.as_bytes().ct_eq(stored_hash.as_bytes()).unwrap_u8() != 1 {
            return Err("snapshot integrity hash mismatch".into());
        }
        if snapshot.version < SNAPSHOT_VERSION {
            return Err(Box::new(EngineError::SnapshotIncompatible { found: snapshot.version, minimum: SNAPSHOT_VERSION }));
        }
        Ok(snapshot)
    }
}

/// Adapter so `Context::Message` (which intentionally carries no `Serialize`
/// impl of its own, to keep the hot conversation path free of a serde
/// dependency on every append) can still be captured in a snapshot.
struct DebugMessage<'a>(&'a crate::cloudllm::context::Message);

impl<'a> Serialize for DebugMessage<'a> {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        use crate::cloudllm::context::Message;
        use serde::ser::SerializeMap;
        let mut map = serializer.serialize_map(None)?;
        match self.0 {
            Message::System { content } => {
                map.serialize_entry("role", "system")?;
                map.serialize_entry("content", content)?;
            }
            Message::User { content } => {
                map.serialize_entry("role", "user")?;
                map.serialize_entry("content", content)?;
            }
            Message::Assistant { content, tool_calls } => {
                map.serialize_entry("role", "assistant")?;
                map.serialize_entry("content", content)?;
                let calls: Vec<_> = tool_calls
                    .iter()
                    .map(|t| serde_json::json!({ "call_id": t.call_id, "tool_name": t.tool_name, "arguments": t.arguments }))
                    .collect();
                map.serialize_entry("tool_calls", &calls)?;
            }
            Message::ToolResult { call_id, payload, status } => {
                map.serialize_entry("role", "tool_result")?;
                map.serialize_entry("call_id", call_id)?;
                map.serialize_entry("payload", payload)?;
                map.serialize_entry("status", &format!("{:?}", status))?;
            }
            Message::HandoffMarker { target_agent_id, transferred_context } => {
                map.serialize_entry("role", "handoff_marker")?;
                map.serialize_entry("target_agent_id", target_agent_id)?;
                map.serialize_entry("transferred_context", transferred_context)?;
            }
        }
        map.end()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cloudllm::context::Message;

    fn sample_context() -> Context {
        let mut ctx = Context::new();
        ctx.append(Message::user("hello"));
        ctx.append(Message::assistant_text("hi there"));
        ctx
    }

    #[test]
    fn round_trips_through_disk() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = sample_context();
        let pending = vec![ToolCallRequest {
            call_id: "c1".into(),
            tool_name: "dangerous_tool".into(),
            arguments: serde_json::json!({}),
        }];
        let snapshot = RunSnapshot::new("run-1", "agent-1", &ctx, pending);
        let path = snapshot.save(dir.path()).unwrap();
        let loaded = RunSnapshot::load(&path).unwrap();
        assert_eq!(loaded.run_id, "run-1");
        assert_eq!(loaded.pending_batch.len(), 1);
    }

    #[test]
    fn rejects_incompatible_version() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = sample_context();
        let mut snapshot = RunSnapshot::new("run-1", "agent-1", &ctx, vec![]);
        snapshot.version = 0;
        let path = snapshot.save(dir.path()).unwrap();
        let err = RunSnapshot::load(&path).unwrap_err();
        assert!(err.to_string().contains("older than minimum"));
    }

    #[test]
    fn confirmation_missing_until_all_pending_calls_decided() {
        let ctx = sample_context();
        let pending = vec![
            ToolCallRequest { call_id: "c1".into(), tool_name: "t".into(), arguments: serde_json::json!({}) },
            ToolCallRequest { call_id: "c2".into(), tool_name: "t".into(), arguments: serde_json::json!({}) },
        ];
        let mut snapshot = RunSnapshot::new("run-1", "agent-1", &ctx, pending);
        assert!(snapshot.check_all_decided().is_err());
        snapshot.decide("c1", true);
        assert!(snapshot.check_all_decided().is_err());
        snapshot.decide("c2", false);
        assert!(snapshot.check_all_decided().is_ok());
    }
}
