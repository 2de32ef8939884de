//! Tool Plan Executor (C5): turns a batch of tool calls into a dependency
//! DAG via `$ref:call_id.json_pointer` tokens, executes it wave by wave,
//! and aggregates results back in original call order.
//!
//! Grounded in `tool_protocol.rs`'s `ToolRegistry::execute_tool` (one call
//! routed to its owning protocol, failures converted to a `ToolResult`
//! rather than propagated) and generalized from a single synchronous call
//! into a concurrent, dependency-aware batch, in the spirit of
//! `council.rs`'s `join_all` fan-out over a `Vec<LLMSession>`.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use serde_json::Value;

use crate::cloudllm::error::EngineError;
use crate::cloudllm::tool_registry::{ToolRegistry, ToolResult, ToolResultStatus};

/// One requested call within a batch.
#[derive(Debug, Clone)]
pub struct ToolCallRequest {
    pub call_id: String,
    pub tool_name: String,
    pub arguments: Value,
}

/// What to do when one call in a batch fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorPolicy {
    /// Abort the whole batch at the first failure.
    FailFast,
    /// Let sibling calls in the same and later waves proceed; only calls
    /// that depend (transitively) on the failed one are skipped.
    Isolate,
    /// Like `Isolate`, but dependents are executed with an error payload
    /// substituted for the unresolved reference rather than skipped.
    ContinueWithErrorPayload,
}

/// The outcome of running a batch.
pub struct BatchOutcome {
    /// Results in original request order, one per requested call.
    pub results: Vec<ToolResult>,
    /// Call ids that require confirmation and have not yet been approved;
    /// non-empty means the batch is paused rather than complete.
    pub pending_confirmation: Vec<String>,
}

/// A reference token of the form `$ref:call_id.json_pointer`, e.g.
/// `$ref:c1.results/0/id`.
#[derive(Debug, Clone)]
struct Reference {
    call_id: String,
    pointer: String,
}

fn parse_reference(raw: &str) -> Option<Reference> {
    let rest = raw.strip_prefix("$ref:")?;
    let (call_id, pointer) = match rest.split_once('.') {
        Some((c, p)) => (c.to_string(), format!("/{}", p.replace('.', "/"))),
        None => (rest.to_string(), String::new()),
    };
    Some(Reference { call_id, pointer })
}

/// Find every `$ref:...` string anywhere inside `value`, recursively.
fn collect_references(value: &Value) -> Vec<Reference> {
    let mut out = Vec::new();
    match value {
        Value::String(s) => {
            if let Some(r) = parse_reference(s) {
                out.push(r);
            }
        }
        Value::Array(items) => {
            for item in items {
                out.extend(collect_references(item));
            }
        }
        Value::Object(map) => {
            for v in map.values() {
                out.extend(collect_references(v));
            }
        }
        _ => {}
    }
    out
}

/// Recursively substitute every `$ref:...` string in `value` with the
/// resolved JSON pointed to, if that call's result is available in
/// `resolved`. References to calls absent from `resolved` are left
/// untouched by this pass (the caller has already verified all
/// dependencies resolve before dispatch).
fn substitute_references(value: &Value, resolved: &HashMap<String, Value>) -> Value {
    match value {
        Value::String(s) => {
            if let Some(r) = parse_reference(s) {
                if let Some(root) = resolved.get(&r.call_id) {
                    if r.pointer.is_empty() {
                        return root.clone();
                    }
                    if let Some(pointed) = root.pointer(&r.pointer) {
                        return pointed.clone();
                    }
                }
            }
            value.clone()
        }
        Value::Array(items) => Value::Array(items.iter().map(|v| substitute_references(v, resolved)).collect()),
        Value::Object(map) => {
            let mut out = serde_json::Map::new();
            for (k, v) in map {
                out.insert(k.clone(), substitute_references(v, resolved));
            }
            Value::Object(out)
        }
        other => other.clone(),
    }
}

/// Build the dependency DAG (call_id -> the call_ids it references) and
/// topologically layer it into waves. Returns an error if a call
/// references an unknown call_id or a cycle is present.
fn plan_waves(requests: &[ToolCallRequest]) -> Result<Vec<Vec<usize>>, EngineError> {
    let index_of: HashMap<&str, usize> =
        requests.iter().enumerate().map(|(i, r)| (r.call_id.as_str(), i)).collect();

    let mut deps: Vec<HashSet<usize>> = Vec::with_capacity(requests.len());
    for req in requests {
        let mut set = HashSet::new();
        for reference in collect_references(&req.arguments) {
            match index_of.get(reference.call_id.as_str()) {
                Some(&dep_index) => {
                    set.insert(dep_index);
                }
                None => {
                    return Err(EngineError::ToolUnresolvedRef {
                        call_id: req.call_id.clone(),
                        reference: reference.call_id.clone(),
                    });
                }
            }
        }
        deps.push(set);
    }

    let mut remaining: HashSet<usize> = (0..requests.len()).collect();
    let mut waves = Vec::new();
    while !remaining.is_empty() {
        let ready: Vec<usize> = remaining
            .iter()
            .copied()
            .filter(|i| deps[*i].iter().all(|d| !remaining.contains(d)))
            .collect();
        if ready.is_empty() {
            return Err(EngineError::ToolCycleDetected);
        }
        for r in &ready {
            remaining.remove(r);
        }
        let mut wave = ready;
        wave.sort_unstable();
        waves.push(wave);
    }
    Ok(waves)
}

/// Run a batch of tool calls against `registry`, resolving intra-batch
/// `$ref:` dependencies wave by wave.
pub async fn run_batch(
    registry: Arc<ToolRegistry>,
    requests: Vec<ToolCallRequest>,
    policy: ErrorPolicy,
) -> Result<BatchOutcome, EngineError> {
    if requests.is_empty() {
        return Ok(BatchOutcome { results: Vec::new(), pending_confirmation: Vec::new() });
    }

    let pending_confirmation: Vec<String> = requests
        .iter()
        .filter(|r| registry.get(&r.tool_name).map(|d| d.requires_confirmation).unwrap_or(false))
        .map(|r| r.call_id.clone())
        .collect();
    if !pending_confirmation.is_empty() {
        return Ok(BatchOutcome { results: Vec::new(), pending_confirmation });
    }

    let waves = plan_waves(&requests)?;
    let mut resolved_payloads: HashMap<String, Value> = HashMap::new();
    let mut results_by_call_id: HashMap<String, ToolResult> = HashMap::new();
    let mut failed: HashSet<String> = HashSet::new();

    'waves: for wave in waves {
        let mut tasks = Vec::with_capacity(wave.len());
        for index in wave {
            let request = requests[index].clone();
            let upstream_failed = collect_references(&request.arguments)
                .into_iter()
                .any(|r| failed.contains(&r.call_id));

            if upstream_failed && policy == ErrorPolicy::Isolate {
                results_by_call_id.insert(
                    request.call_id.clone(),
                    ToolResult::skipped(&request.call_id, "upstream dependency failed"),
                );
                failed.insert(request.call_id.clone());
                continue;
            }

            let arguments = if upstream_failed && policy == ErrorPolicy::ContinueWithErrorPayload {
                serde_json::json!({ "error": "upstream dependency failed" })
            } else {
                substitute_references(&request.arguments, &resolved_payloads)
            };

            let registry = registry.clone();
            tasks.push(tokio::spawn(async move {
                let result = registry.execute(&request.call_id, &request.tool_name, arguments).await;
                (request.call_id, result)
            }));
        }

        for task in tasks {
            let (call_id, result) = task
                .await
                .map_err(|e| EngineError::ToolExecutionError { call_id: String::new(), detail: e.to_string() })?;
            if result.status == ToolResultStatus::Error {
                failed.insert(call_id.clone());
                if policy == ErrorPolicy::FailFast {
                    results_by_call_id.insert(call_id, result);
                    break 'waves;
                }
            } else {
                resolved_payloads.insert(call_id.clone(), result.payload.clone());
            }
            results_by_call_id.insert(call_id, result);
        }
    }

    let results = requests
        .iter()
        .filter_map(|r| results_by_call_id.remove(&r.call_id))
        .collect();

    Ok(BatchOutcome { results, pending_confirmation: Vec::new() })
}
