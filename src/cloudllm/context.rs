//! Context (C1): per-run state — message history, turn counter, a
//! user-state map, and an optional memory handle.
//!
//! Grounded in two teacher modules folded into one type: the
//! conversational-history/token-budget philosophy of `llm_session.rs`
//! (approximate character-based token counting, oldest-first trimming) and
//! the pluggable-strategy shape of `context_strategy.rs`'s `ContextStrategy`
//! trait, generalized from a single `LLMSession`-bound trait into the
//! read-only `window(policy)` operation the runtime specification calls for.

use std::collections::HashMap;
use std::sync::Arc;

use crate::cloudllm::memory::Memory;

/// A single tool call surfaced on an assistant message, before it has been
/// routed through the Tool Plan Executor.
#[derive(Debug, Clone)]
pub struct ToolCallSummary {
    pub call_id: String,
    pub tool_name: String,
    pub arguments: serde_json::Value,
}

/// Outcome tag for a `Message::ToolResult` entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToolResultStatus {
    Success,
    Error,
    Skipped,
}

/// A tagged-union conversation item. Never mutated after creation; Context
/// only grows (§3.2).
#[derive(Debug, Clone)]
pub enum Message {
    System { content: String },
    User { content: String },
    Assistant { content: Option<String>, tool_calls: Vec<ToolCallSummary> },
    ToolResult { call_id: String, payload: serde_json::Value, status: ToolResultStatus },
    HandoffMarker { target_agent_id: String, transferred_context: bool },
}

impl Message {
    pub fn system(content: impl Into<String>) -> Self {
        Message::System { content: content.into() }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Message::User { content: content.into() }
    }

    pub fn assistant_text(content: impl Into<String>) -> Self {
        Message::Assistant { content: Some(content.into()), tool_calls: Vec::new() }
    }

    pub fn assistant_tool_calls(tool_calls: Vec<ToolCallSummary>) -> Self {
        Message::Assistant { content: None, tool_calls }
    }

    /// Approximate a JSON-serialized rendering used for token estimation and
    /// novelty detection, following `llm_session.rs`'s own text-based
    /// approach rather than an exact tokenizer.
    fn approx_text(&self) -> String {
        match self {
            Message::System { content } | Message::User { content } => content.clone(),
            Message::Assistant { content, tool_calls } => {
                let mut s = content.clone().unwrap_or_default();
                for tc in tool_calls {
                    s.push(' ');
                    s.push_str(&tc.tool_name);
                    s.push(' ');
                    s.push_str(&tc.arguments.to_string());
                }
                s
            }
            Message::ToolResult { payload, .. } => payload.to_string(),
            Message::HandoffMarker { target_agent_id, .. } => target_agent_id.clone(),
        }
    }
}

/// Estimate the number of tokens in a string: one token per four
/// characters, matching `llm_session.rs::count_tokens`.
fn count_tokens(text: &str) -> usize {
    (text.len() / 4).max(1)
}

/// Estimate the token cost of a single message, including a fixed
/// per-message overhead for its role annotation.
fn count_message_tokens(message: &Message) -> usize {
    1 + count_tokens(&message.approx_text())
}

/// An ordered, append-only conversation log plus the ambient state a run
/// carries: turn counter, a string-keyed state map, and an optional memory
/// handle. Owned exclusively by one Interaction Engine run at a time.
#[derive(Clone)]
pub struct Context {
    messages: Vec<Message>,
    turn_count: u32,
    state: HashMap<String, serde_json::Value>,
    memory: Option<Arc<dyn Memory>>,
}

impl Context {
    pub fn new() -> Self {
        Self { messages: Vec::new(), turn_count: 0, state: HashMap::new(), memory: None }
    }

    pub fn with_memory(memory: Arc<dyn Memory>) -> Self {
        Self { memory: Some(memory), ..Self::new() }
    }

    /// Append-only by construction: there is no public mutable indexer into
    /// `messages`.
    pub fn append(&mut self, message: Message) {
        self.messages.push(message);
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn turn_count(&self) -> u32 {
        self.turn_count
    }

    pub fn begin_turn(&mut self) {
        self.turn_count += 1;
    }

    /// Reverse one `begin_turn`, for callers whose retry policy says a
    /// round-trip shouldn't count against `max_turns` (e.g.
    /// `RuntimeConfig::structured_retries_count_against_max_turns = false`).
    pub fn undo_turn(&mut self) {
        self.turn_count = self.turn_count.saturating_sub(1);
    }

    pub fn set_state(&mut self, key: impl Into<String>, value: serde_json::Value) {
        self.state.insert(key.into(), value);
    }

    pub fn get_state(&self, key: &str) -> Option<&serde_json::Value> {
        self.state.get(key)
    }

    pub fn memory(&self) -> Option<&Arc<dyn Memory>> {
        self.memory.as_ref()
    }

    /// Replace the message tail starting at `from` with `replacement`,
    /// atomically. The only sanctioned exception to append-only growth
    /// (§3.2), used by window policies that compact history in place.
    pub fn replace_tail(&mut self, from: usize, replacement: Vec<Message>) {
        self.messages.truncate(from);
        self.messages.extend(replacement);
    }

    /// A bounded view of the conversation for payload assembly, produced by
    /// a pluggable [`WindowPolicy`]. Never mutates `self`.
    pub fn window(&self, policy: &dyn WindowPolicy) -> Vec<Message> {
        policy.window(self)
    }

    fn estimated_tokens(&self) -> usize {
        self.messages.iter().map(count_message_tokens).sum()
    }
}

impl Default for Context {
    fn default() -> Self {
        Self::new()
    }
}

/// A pluggable policy for bounding how much of `Context` is sent to the LLM
/// on a given turn. Grounded in `context_strategy.rs`'s `ContextStrategy`
/// trait, generalized from an `LLMSession`-bound `should_compact`/`compact`
/// pair into a pure, non-mutating `window` projection.
pub trait WindowPolicy: Send + Sync {
    /// Human-readable name for logging and diagnostics.
    fn name(&self) -> &str;

    /// Produce the bounded view sent to the transport this turn.
    fn window(&self, context: &Context) -> Vec<Message>;
}

/// Default policy: a plain sliding window over the most recent messages,
/// bounded by an approximate token budget. Mirrors `TrimStrategy`'s
/// oldest-first eviction, but expressed as a view rather than an in-place
/// mutation of session state.
pub struct TrimWindowPolicy {
    /// Ratio of `estimated_tokens / max_tokens` above which older messages
    /// start getting dropped from the view. Default: `0.85`, matching
    /// `TrimStrategy::default()`.
    pub threshold: f64,
    pub max_tokens: usize,
}

impl TrimWindowPolicy {
    pub fn new(max_tokens: usize) -> Self {
        Self { threshold: 0.85, max_tokens }
    }
}

impl WindowPolicy for TrimWindowPolicy {
    fn name(&self) -> &str {
        "TrimWindowPolicy"
    }

    fn window(&self, context: &Context) -> Vec<Message> {
        let budget = (self.max_tokens as f64 * self.threshold) as usize;
        let mut kept: Vec<Message> = Vec::new();
        let mut used = 0usize;
        for message in context.messages.iter().rev() {
            let cost = count_message_tokens(message);
            if used + cost > budget && !kept.is_empty() {
                break;
            }
            used += cost;
            kept.push(message.clone());
        }
        kept.reverse();
        kept
    }
}

/// A window policy that, once the dropped prefix grows past a threshold,
/// replaces it in the view with a single synthetic system message
/// summarizing what was dropped (a byte-count placeholder summary; actual
/// LLM-authored compaction is performed by the engine's reflection-style
/// call and persisted via `Context::replace_tail`, not by this policy
/// itself — see `SelfCompressionStrategy` for the teacher's equivalent).
pub struct SummarizingWindowPolicy {
    pub threshold: f64,
    pub max_tokens: usize,
    pub recent_window: usize,
}

impl SummarizingWindowPolicy {
    pub fn new(max_tokens: usize, recent_window: usize) -> Self {
        Self { threshold: 0.80, max_tokens, recent_window }
    }
}

impl WindowPolicy for SummarizingWindowPolicy {
    fn name(&self) -> &str {
        "SummarizingWindowPolicy"
    }

    fn window(&self, context: &Context) -> Vec<Message> {
        let estimated = context.estimated_tokens();
        let budget = (self.max_tokens as f64 * self.threshold) as usize;
        if estimated <= budget || context.messages.len() <= self.recent_window {
            return context.messages.clone();
        }
        let split = context.messages.len() - self.recent_window;
        let dropped = &context.messages[..split];
        let recent = &context.messages[split..];
        let summary = Message::system(format!(
            "[{} earlier message(s) summarized: ~{} tokens omitted]",
            dropped.len(),
            dropped.iter().map(count_message_tokens).sum::<usize>()
        ));
        let mut view = vec![summary];
        view.extend(recent.iter().cloned());
        view
    }
}

/// Wraps an inner policy and only applies it at high token pressure, or at
/// moderate pressure when recent turns are lexically unoriginal relative to
/// prior history (bigram-overlap heuristic). Mirrors
/// `NoveltyAwareStrategy`'s thresholds and `estimate_novelty` algorithm.
pub struct NoveltyAwareWindowPolicy {
    pub high_threshold: f64,
    pub moderate_threshold: f64,
    pub novelty_threshold: f64,
    pub recent_window: usize,
    pub max_tokens: usize,
    pub inner: Box<dyn WindowPolicy>,
}

impl NoveltyAwareWindowPolicy {
    pub fn new(max_tokens: usize, inner: Box<dyn WindowPolicy>) -> Self {
        Self {
            high_threshold: 0.90,
            moderate_threshold: 0.70,
            novelty_threshold: 0.30,
            recent_window: 4,
            max_tokens,
            inner,
        }
    }

    fn estimate_novelty(&self, context: &Context) -> f64 {
        let history = &context.messages;
        if history.len() < 2 {
            return 1.0;
        }
        let split = history.len().saturating_sub(self.recent_window);
        let prior_ngrams = extract_bigrams(&history[..split]);
        let recent_ngrams = extract_bigrams(&history[split..]);
        if recent_ngrams.is_empty() {
            return 1.0;
        }
        let novel = recent_ngrams.iter().filter(|ng| !prior_ngrams.contains(*ng)).count();
        novel as f64 / recent_ngrams.len() as f64
    }
}

impl WindowPolicy for NoveltyAwareWindowPolicy {
    fn name(&self) -> &str {
        "NoveltyAwareWindowPolicy"
    }

    fn window(&self, context: &Context) -> Vec<Message> {
        let estimated = context.estimated_tokens();
        let ratio = estimated as f64 / self.max_tokens.max(1) as f64;
        let should_compact = if ratio > self.high_threshold {
            true
        } else if ratio > self.moderate_threshold {
            self.estimate_novelty(context) < self.novelty_threshold
        } else {
            false
        };
        if should_compact {
            self.inner.window(context)
        } else {
            context.messages.clone()
        }
    }
}

fn extract_bigrams(messages: &[Message]) -> std::collections::HashSet<String> {
    let mut bigrams = std::collections::HashSet::new();
    for message in messages {
        let text = message.approx_text();
        let words: Vec<&str> = text.split_whitespace().collect();
        for pair in words.windows(2) {
            bigrams.insert(format!("{} {}", pair[0].to_lowercase(), pair[1].to_lowercase()));
        }
    }
    bigrams
}
