//! Tool Registry (C2): a per-agent, immutable-after-construction catalog of
//! declared tools, split into always-offered ("eager") and
//! search-selected ("deferred") tools.
//!
//! Grounded in `tool_protocol.rs`'s `ToolRegistry`/`ToolMetadata`/`Tool`
//! trio, generalized with the fields the runtime specification requires
//! that the teacher's version lacks: `requires_confirmation`, an
//! eager/deferred `category`, a `call_id`-bearing result type, and a
//! pluggable ranking strategy used to cut down the schema surface sent to
//! the LLM on a given turn. Duplicate tool names are a configuration error
//! (fail fast), matching the registry's existing posture toward malformed
//! setup rather than the teacher's current last-write-wins `add_protocol`
//! behavior (see DESIGN.md).

use async_trait::async_trait;
use std::collections::HashMap;
use std::error::Error;
use std::fmt;
use std::sync::Arc;

use crate::cloudllm::error::DynError;

/// Whether a tool is always offered to the LLM, or only offered when a
/// [`SelectionStrategy`] ranks it among the top-K for the current request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToolCategory {
    Eager,
    Deferred,
}

/// A declared tool's static shape: identity, schema, and execution policy.
#[derive(Debug, Clone)]
pub struct ToolDeclaration {
    pub name: String,
    pub description: String,
    pub parameters_schema: serde_json::Value,
    pub requires_confirmation: bool,
    pub category: ToolCategory,
}

impl ToolDeclaration {
    pub fn new(name: impl Into<String>, description: impl Into<String>, parameters_schema: serde_json::Value) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            parameters_schema,
            requires_confirmation: false,
            category: ToolCategory::Eager,
        }
    }

    pub fn requires_confirmation(mut self) -> Self {
        self.requires_confirmation = true;
        self
    }

    pub fn deferred(mut self) -> Self {
        self.category = ToolCategory::Deferred;
        self
    }
}

/// Outcome of one executed tool call, keyed by the call id the LLM (or the
/// executor, for synthesized skip results) assigned it — filling the gap in
/// `tool_protocol.rs::ToolResult`, which has no call correlation field.
#[derive(Debug, Clone)]
pub struct ToolResult {
    pub call_id: String,
    pub status: ToolResultStatus,
    pub payload: serde_json::Value,
    pub error_message: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToolResultStatus {
    Success,
    Error,
    Skipped,
}

impl ToolResult {
    pub fn success(call_id: impl Into<String>, payload: serde_json::Value) -> Self {
        Self { call_id: call_id.into(), status: ToolResultStatus::Success, payload, error_message: None }
    }

    pub fn error(call_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            call_id: call_id.into(),
            status: ToolResultStatus::Error,
            payload: serde_json::Value::Null,
            error_message: Some(message.into()),
        }
    }

    pub fn skipped(call_id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            call_id: call_id.into(),
            status: ToolResultStatus::Skipped,
            payload: serde_json::Value::Null,
            error_message: Some(reason.into()),
        }
    }
}

/// Error returned by [`ToolRegistry::declare`] and friends.
#[derive(Debug, Clone)]
pub enum ToolRegistryError {
    DuplicateName(String),
    NotFound(String),
}

impl fmt::Display for ToolRegistryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ToolRegistryError::DuplicateName(name) => {
                write!(f, "tool '{}' is already declared in this registry", name)
            }
            ToolRegistryError::NotFound(name) => write!(f, "tool not found: {}", name),
        }
    }
}

impl Error for ToolRegistryError {}

/// The per-tool execution handler. A local in-process handler is the only
/// protocol this crate ships; remote protocols (MCP, HTTP, ...) are an
/// application concern that implements the same trait.
#[async_trait]
pub trait ToolHandler: Send + Sync {
    async fn execute(&self, tool_name: &str, arguments: serde_json::Value) -> Result<serde_json::Value, DynError>;
}

/// A ranking strategy selects, for a given free-text query and the pool of
/// deferred tools, the top `k` declarations to offer this turn.
pub trait SelectionStrategy: Send + Sync {
    fn select<'a>(&self, query: &str, pool: &[&'a ToolDeclaration], top_k: usize) -> Vec<&'a ToolDeclaration>;
}

/// BM25 lexical scoring over `name + description`, `k1=1.2, b=0.75` by
/// default, matching the formula in SPEC_FULL.md §4.2.
pub struct Bm25Strategy {
    pub k1: f64,
    pub b: f64,
}

impl Default for Bm25Strategy {
    fn default() -> Self {
        Self { k1: 1.2, b: 0.75 }
    }
}

fn tokenize(text: &str) -> Vec<String> {
    text.to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|s| !s.is_empty())
        .map(|s| s.to_string())
        .collect()
}

impl SelectionStrategy for Bm25Strategy {
    fn select<'a>(&self, query: &str, pool: &[&'a ToolDeclaration], top_k: usize) -> Vec<&'a ToolDeclaration> {
        let query_terms = tokenize(query);
        if query_terms.is_empty() || pool.is_empty() {
            return pool.iter().take(top_k).copied().collect();
        }

        let docs: Vec<Vec<String>> =
            pool.iter().map(|t| tokenize(&format!("{} {}", t.name, t.description))).collect();
        let avgdl = docs.iter().map(|d| d.len()).sum::<usize>() as f64 / docs.len() as f64;
        let n = docs.len() as f64;

        let mut doc_freq: HashMap<&str, usize> = HashMap::new();
        for term in &query_terms {
            let df = docs.iter().filter(|d| d.contains(term)).count();
            doc_freq.insert(term.as_str(), df);
        }

        let mut scored: Vec<(f64, &'a ToolDeclaration)> = pool
            .iter()
            .zip(docs.iter())
            .map(|(tool, doc)| {
                let dl = doc.len() as f64;
                let score: f64 = query_terms
                    .iter()
                    .map(|term| {
                        let df = *doc_freq.get(term.as_str()).unwrap_or(&0);
                        if df == 0 {
                            return 0.0;
                        }
                        let idf = ((n - df as f64 + 0.5) / (df as f64 + 0.5) + 1.0).ln();
                        let tf = doc.iter().filter(|w| *w == term).count() as f64;
                        idf * (tf * (self.k1 + 1.0)) / (tf + self.k1 * (1.0 - self.b + self.b * dl / avgdl))
                    })
                    .sum();
                (score, *tool)
            })
            .collect();

        scored.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));
        scored.into_iter().take(top_k).map(|(_, t)| t).collect()
    }
}

/// Cosine similarity over caller-supplied embedding vectors, keyed by tool
/// name. Tools with no embedding registered sort last.
pub struct SemanticStrategy {
    pub query_embedding: Vec<f32>,
    pub tool_embeddings: HashMap<String, Vec<f32>>,
}

fn cosine(a: &[f32], b: &[f32]) -> f64 {
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        0.0
    } else {
        (dot / (norm_a * norm_b)) as f64
    }
}

impl SelectionStrategy for SemanticStrategy {
    fn select<'a>(&self, _query: &str, pool: &[&'a ToolDeclaration], top_k: usize) -> Vec<&'a ToolDeclaration> {
        let mut scored: Vec<(f64, &'a ToolDeclaration)> = pool
            .iter()
            .map(|tool| {
                let score = self
                    .tool_embeddings
                    .get(&tool.name)
                    .map(|emb| cosine(&self.query_embedding, emb))
                    .unwrap_or(f64::MIN);
                (score, *tool)
            })
            .collect();
        scored.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));
        scored.into_iter().take(top_k).map(|(_, t)| t).collect()
    }
}

/// Match-any over a set of regex patterns applied to `name + description`.
pub struct RegexStrategy {
    patterns: Vec<regex::Regex>,
}

impl RegexStrategy {
    pub fn new(patterns: Vec<&str>) -> Self {
        Self { patterns: patterns.into_iter().filter_map(|p| regex::Regex::new(p).ok()).collect() }
    }
}

impl SelectionStrategy for RegexStrategy {
    fn select<'a>(&self, _query: &str, pool: &[&'a ToolDeclaration], top_k: usize) -> Vec<&'a ToolDeclaration> {
        pool.iter()
            .filter(|t| {
                let haystack = format!("{} {}", t.name, t.description);
                self.patterns.iter().any(|re| re.is_match(&haystack))
            })
            .take(top_k)
            .copied()
            .collect()
    }
}

/// Adapts an arbitrary ranking closure into a [`SelectionStrategy`].
pub struct CustomStrategy<F>(pub F)
where
    F: for<'a> Fn(&str, &[&'a ToolDeclaration], usize) -> Vec<&'a ToolDeclaration> + Send + Sync;

impl<F> SelectionStrategy for CustomStrategy<F>
where
    F: for<'a> Fn(&str, &[&'a ToolDeclaration], usize) -> Vec<&'a ToolDeclaration> + Send + Sync,
{
    fn select<'a>(&self, query: &str, pool: &[&'a ToolDeclaration], top_k: usize) -> Vec<&'a ToolDeclaration> {
        (self.0)(query, pool, top_k)
    }
}

struct Entry {
    declaration: ToolDeclaration,
    handler: Arc<dyn ToolHandler>,
}

/// The immutable-after-construction catalog of tools available to one
/// agent. `declare` fails fast on a duplicate name rather than silently
/// overwriting, unlike `tool_protocol.rs::ToolRegistry::add_protocol`.
pub struct ToolRegistry {
    entries: HashMap<String, Entry>,
    strategy: Box<dyn SelectionStrategy>,
}

impl ToolRegistry {
    pub fn new(strategy: Box<dyn SelectionStrategy>) -> Self {
        Self { entries: HashMap::new(), strategy }
    }

    pub fn declare(&mut self, declaration: ToolDeclaration, handler: Arc<dyn ToolHandler>) -> Result<(), ToolRegistryError> {
        if self.entries.contains_key(&declaration.name) {
            return Err(ToolRegistryError::DuplicateName(declaration.name));
        }
        self.entries.insert(declaration.name.clone(), Entry { declaration, handler });
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&ToolDeclaration> {
        self.entries.get(name).map(|e| &e.declaration)
    }

    /// `eager_tools ∪ strategy.top_k(query, deferred_tools)` — the C2
    /// `select` operation.
    pub fn select(&self, query: &str, top_k: usize) -> Vec<&ToolDeclaration> {
        let mut eager: Vec<&ToolDeclaration> = Vec::new();
        let mut deferred_pool: Vec<&ToolDeclaration> = Vec::new();
        for entry in self.entries.values() {
            match entry.declaration.category {
                ToolCategory::Eager => eager.push(&entry.declaration),
                ToolCategory::Deferred => deferred_pool.push(&entry.declaration),
            }
        }
        let mut selected = self.strategy.select(query, &deferred_pool, top_k);
        eager.append(&mut selected);
        eager
    }

    pub async fn execute(&self, call_id: &str, tool_name: &str, arguments: serde_json::Value) -> ToolResult {
        let entry = match self.entries.get(tool_name) {
            Some(e) => e,
            None => return ToolResult::error(call_id, format!("tool not found: {}", tool_name)),
        };
        match entry.handler.execute(tool_name, arguments).await {
            Ok(payload) => ToolResult::success(call_id, payload),
            Err(e) => ToolResult::error(call_id, e.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct EchoHandler;

    #[async_trait]
    impl ToolHandler for EchoHandler {
        async fn execute(&self, tool_name: &str, arguments: serde_json::Value) -> Result<serde_json::Value, DynError> {
            Ok(serde_json::json!({ "tool": tool_name, "echo": arguments }))
        }
    }

    fn registry() -> ToolRegistry {
        ToolRegistry::new(Box::new(Bm25Strategy::default()))
    }

    #[test]
    fn duplicate_name_fails_fast() {
        let mut r = registry();
        let decl = ToolDeclaration::new("t", "desc", serde_json::json!({}));
        r.declare(decl.clone(), Arc::new(EchoHandler)).unwrap();
        let err = r.declare(decl, Arc::new(EchoHandler)).unwrap_err();
        assert!(matches!(err, ToolRegistryError::DuplicateName(_)));
    }

    #[tokio::test]
    async fn execute_routes_to_handler() {
        let mut r = registry();
        r.declare(ToolDeclaration::new("echo", "echoes input", serde_json::json!({})), Arc::new(EchoHandler))
            .unwrap();
        let result = r.execute("call_1", "echo", serde_json::json!({"x": 1})).await;
        assert_eq!(result.status, ToolResultStatus::Success);
        assert_eq!(result.payload["tool"], "echo");
    }

    #[tokio::test]
    async fn unknown_tool_is_an_error_result() {
        let r = registry();
        let result = r.execute("call_1", "missing", serde_json::json!({})).await;
        assert_eq!(result.status, ToolResultStatus::Error);
    }

    #[test]
    fn select_always_includes_eager_tools() {
        let mut r = registry();
        r.declare(ToolDeclaration::new("always_on", "eager tool", serde_json::json!({})), Arc::new(EchoHandler))
            .unwrap();
        r.declare(
            ToolDeclaration::new("weather", "get the weather for a city", serde_json::json!({})).deferred(),
            Arc::new(EchoHandler),
        )
        .unwrap();
        let selected = r.select("completely unrelated query", 0);
        assert!(selected.iter().any(|t| t.name == "always_on"));
        assert!(!selected.iter().any(|t| t.name == "weather"));
    }

    #[test]
    fn bm25_prefers_lexical_overlap() {
        let strategy = Bm25Strategy::default();
        let weather = ToolDeclaration::new("get_weather", "get the current weather for a city", serde_json::json!({}));
        let calc = ToolDeclaration::new("calculator", "evaluate a math expression", serde_json::json!({}));
        let pool = vec![&weather, &calc];
        let ranked = strategy.select("what is the weather today", &pool, 1);
        assert_eq!(ranked[0].name, "get_weather");
    }
}
