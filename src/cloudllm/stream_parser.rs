//! Structured Stream Parser (C4): incremental assembly of partial JSON from
//! a token stream, plus the unified callback dispatch over transport events.
//!
//! This is net-new relative to the teacher: `client_wrapper.rs`'s
//! `MessageChunk` only carries a coarse content delta and a finish reason,
//! with no notion of structured partial values. The incremental JSON
//! completer below follows the stack-based algorithm in SPEC_FULL.md
//! §4.4.1, grounded in spirit (streaming, delta-driven accumulation) on
//! `client_wrapper.rs`'s `MessageChunkStream` consumption pattern.

use std::collections::HashMap;

use futures_util::StreamExt;

use crate::cloudllm::transport::{StreamEvent, StreamEventStream};

/// Unified callback surface a caller implements to observe one streamed
/// response, per §4.4. All methods default to no-ops so a caller only
/// overrides the ones it cares about.
pub trait StreamCallbacks: Send {
    fn on_text_delta(&mut self, _chunk: &str) {}
    fn on_tool_call(&mut self, _call_id: &str, _tool_name: &str, _arguments: &serde_json::Value) {}
    fn on_partial_json(&mut self, _fields_so_far: &serde_json::Map<String, serde_json::Value>) {}
    fn on_parsed_complete(&mut self, _value: &serde_json::Value) {}
    fn on_error(&mut self, _kind: &str, _detail: &str) {}
}

/// Consumes a transport's [`StreamEventStream`] and drives a
/// [`StreamCallbacks`] implementor in strict arrival order (§4.4.2),
/// tracking structured-output partial JSON via [`IncrementalJsonAssembler`]
/// and per-call tool arguments via [`ToolCallArgumentAssembler`]. Grounded
/// in spirit on `client_wrapper.rs`'s `MessageChunkStream` consumption loop.
pub struct StructuredStreamParser {
    structured_output: bool,
    json_assembler: IncrementalJsonAssembler,
    tool_args: ToolCallArgumentAssembler,
}

impl StructuredStreamParser {
    pub fn new(structured_output: bool) -> Self {
        Self { structured_output, json_assembler: IncrementalJsonAssembler::new(), tool_args: ToolCallArgumentAssembler::new() }
    }

    /// Drain `events` to completion, invoking `callbacks` for each event.
    /// Callbacks run on this same task; per §4.4.2 they must return quickly
    /// and must not re-enter the engine.
    pub async fn dispatch(&mut self, mut events: StreamEventStream, callbacks: &mut dyn StreamCallbacks) {
        while let Some(event) = events.next().await {
            match event {
                StreamEvent::TextDelta(chunk) => {
                    if self.structured_output {
                        if let Some(partial) = self.json_assembler.push(&chunk) {
                            callbacks.on_partial_json(&partial);
                        }
                    }
                    callbacks.on_text_delta(&chunk);
                }
                StreamEvent::ToolCallDelta { call_id, tool_name: _, arguments_delta } => {
                    self.tool_args.push(&call_id, &arguments_delta);
                }
                StreamEvent::ToolCallComplete { call_id, tool_name, arguments } => {
                    callbacks.on_tool_call(&call_id, &tool_name, &arguments);
                }
                StreamEvent::ResponseComplete { .. } => {
                    if self.structured_output {
                        match self.json_assembler.finish() {
                            Ok(value) => callbacks.on_parsed_complete(&value),
                            Err(e) => callbacks.on_error("structured_parse_error", &e.to_string()),
                        }
                    }
                }
                StreamEvent::Error(detail) => callbacks.on_error("llm_transport_error", &detail),
            }
        }
    }
}

/// Tracks one in-progress JSON value being assembled from deltas and
/// performs the stack-based completion described in §4.4.1.
#[derive(Default)]
pub struct IncrementalJsonAssembler {
    buffer: String,
    closed_top_level_keys: Vec<String>,
    last_emitted_key_count: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ScanState {
    Normal,
    InString { escaped: bool },
}

impl IncrementalJsonAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed the next delta. Returns `Some(map)` with a best-effort partial
    /// projection if at least one new top-level key closed since the last
    /// call (the throttling rule in §4.4.2), else `None`.
    pub fn push(&mut self, delta: &str) -> Option<serde_json::Map<String, serde_json::Value>> {
        self.buffer.push_str(delta);
        self.rescan_closed_keys();
        if self.closed_top_level_keys.len() == self.last_emitted_key_count {
            return None;
        }
        self.last_emitted_key_count = self.closed_top_level_keys.len();
        self.project()
    }

    /// Attempt to parse the buffer as a complete JSON value as-is (no
    /// completion tail needed). Used once the transport signals the
    /// response is fully received.
    pub fn finish(&self) -> Result<serde_json::Value, serde_json::Error> {
        serde_json::from_str(&self.buffer)
    }

    /// Re-derive which top-level object keys have a fully closed value in
    /// the *original, un-augmented* buffer, per step 3 of §4.4.1.
    fn rescan_closed_keys(&mut self) {
        self.closed_top_level_keys.clear();
        let bytes: Vec<char> = self.buffer.chars().collect();
        let mut state = ScanState::Normal;
        let mut depth: i32 = 0;
        let mut pending_key: Option<String> = None;
        let mut awaiting_value = false;
        let mut key_buf = String::new();
        let mut i = 0usize;
        let mut in_value_string = false;

        while i < bytes.len() {
            let c = bytes[i];
            match state {
                ScanState::InString { escaped } => {
                    if escaped {
                        state = ScanState::InString { escaped: false };
                    } else if c == '\\' {
                        state = ScanState::InString { escaped: true };
                    } else if c == '"' {
                        state = ScanState::Normal;
                        if depth == 1 && awaiting_value && in_value_string {
                            // a top-level string value just closed
                            if let Some(k) = pending_key.take() {
                                self.closed_top_level_keys.push(k);
                            }
                            awaiting_value = false;
                            in_value_string = false;
                        } else if depth == 0 {
                            // closed the top-level object's own key string; capture it
                            pending_key = Some(key_buf.clone());
                        } else if depth == 1 && !awaiting_value {
                            pending_key = Some(key_buf.clone());
                        }
                        key_buf.clear();
                    } else if depth <= 1 && !awaiting_value {
                        key_buf.push(c);
                    }
                }
                ScanState::Normal => match c {
                    '"' => {
                        state = ScanState::InString { escaped: false };
                        if depth == 1 && awaiting_value {
                            in_value_string = true;
                        }
                    }
                    '{' | '[' => {
                        depth += 1;
                    }
                    '}' | ']' => {
                        depth -= 1;
                        if depth == 1 && awaiting_value {
                            if let Some(k) = pending_key.take() {
                                self.closed_top_level_keys.push(k);
                            }
                            awaiting_value = false;
                        }
                    }
                    ':' => {
                        if depth == 1 {
                            awaiting_value = true;
                        }
                    }
                    ',' => {
                        if depth == 1 {
                            awaiting_value = false;
                        }
                    }
                    c if depth == 1 && awaiting_value && !c.is_whitespace() => {
                        // scanning a bare literal (number/true/false/null) —
                        // look ahead to see whether it terminates before a
                        // top-level comma or closing brace.
                        let mut j = i;
                        while j < bytes.len() && bytes[j] != ',' && bytes[j] != '}' {
                            j += 1;
                        }
                        if j < bytes.len() {
                            if let Some(k) = pending_key.take() {
                                self.closed_top_level_keys.push(k);
                            }
                            awaiting_value = false;
                        }
                        i = j;
                        continue;
                    }
                    _ => {}
                },
            }
            i += 1;
        }
    }

    /// Synthesize the completion tail and parse, projecting only the keys
    /// [`rescan_closed_keys`] found closed in the original buffer.
    fn project(&self) -> Option<serde_json::Map<String, serde_json::Value>> {
        let completed = complete_json(&self.buffer)?;
        let value: serde_json::Value = serde_json::from_str(&completed).ok()?;
        let object = value.as_object()?;
        let mut projected = serde_json::Map::new();
        for key in &self.closed_top_level_keys {
            if let Some(v) = object.get(key) {
                projected.insert(key.clone(), v.clone());
            }
        }
        Some(projected)
    }
}

/// Synthesize a minimal completion tail for `buffer`: close any open
/// strings, arrays, and objects in LIFO order, dropping a dangling trailing
/// comma or key-without-value first (§4.4.1 steps 1-2).
pub fn complete_json(buffer: &str) -> Option<String> {
    let mut stack: Vec<char> = Vec::new();
    let mut state = ScanState::Normal;
    for c in buffer.chars() {
        match state {
            ScanState::InString { escaped } => {
                if escaped {
                    state = ScanState::InString { escaped: false };
                } else if c == '\\' {
                    state = ScanState::InString { escaped: true };
                } else if c == '"' {
                    state = ScanState::Normal;
                    stack.pop();
                }
            }
            ScanState::Normal => match c {
                '"' => {
                    state = ScanState::InString { escaped: false };
                    stack.push('"');
                }
                '{' => stack.push('}'),
                '[' => stack.push(']'),
                '}' | ']' => {
                    stack.pop();
                }
                _ => {}
            },
        }
    }

    let mut trimmed = buffer.trim_end().to_string();
    if matches!(state, ScanState::InString { .. }) {
        // inside an open string: nothing dangling to trim, just close it below.
    } else if trimmed.ends_with(',') {
        trimmed.pop();
    } else if trimmed.ends_with(':') {
        // dangling key with no value: strip back to the comma/open-brace
        // preceding the key's opening quote.
        if let Some(key_start) = find_dangling_key_start(&trimmed) {
            trimmed.truncate(key_start);
            let t = trimmed.trim_end();
            trimmed = if t.ends_with(',') { t[..t.len() - 1].to_string() } else { t.to_string() };
        }
    }

    let mut tail = String::new();
    // Re-derive the stack for the trimmed text, since trimming may have
    // changed what's open (e.g. dropping a whole dangling "key": pair).
    let mut stack2: Vec<char> = Vec::new();
    let mut state2 = ScanState::Normal;
    for c in trimmed.chars() {
        match state2 {
            ScanState::InString { escaped } => {
                if escaped {
                    state2 = ScanState::InString { escaped: false };
                } else if c == '\\' {
                    state2 = ScanState::InString { escaped: true };
                } else if c == '"' {
                    state2 = ScanState::Normal;
                    stack2.pop();
                }
            }
            ScanState::Normal => match c {
                '"' => {
                    state2 = ScanState::InString { escaped: false };
                    stack2.push('"');
                }
                '{' => stack2.push('}'),
                '[' => stack2.push(']'),
                '}' | ']' => {
                    stack2.pop();
                }
                _ => {}
            },
        }
    }
    for closer in stack2.iter().rev() {
        tail.push(*closer);
    }

    Some(format!("{}{}", trimmed, tail))
}

/// Find the byte index where a dangling top-level key's opening quote
/// begins, scanning backward from the end of `text` (which is known to end
/// with `:`).
fn find_dangling_key_start(text: &str) -> Option<usize> {
    let bytes: Vec<(usize, char)> = text.char_indices().collect();
    let mut i = bytes.len();
    // skip the trailing ':' and any whitespace before it
    while i > 0 && (bytes[i - 1].1 == ':' || bytes[i - 1].1.is_whitespace()) {
        i -= 1;
    }
    if i == 0 || bytes[i - 1].1 != '"' {
        return None;
    }
    i -= 1; // consume closing quote
    while i > 0 {
        i -= 1;
        if bytes[i].1 == '"' && (i == 0 || bytes[i - 1].1 != '\\') {
            return Some(bytes[i].0);
        }
    }
    None
}

/// Per-call-id argument assembler used while a tool call's arguments are
/// still streaming in as `ToolCallDelta` events.
#[derive(Default)]
pub struct ToolCallArgumentAssembler {
    buffers: HashMap<String, String>,
}

impl ToolCallArgumentAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, call_id: &str, delta: &str) {
        self.buffers.entry(call_id.to_string()).or_default().push_str(delta);
    }

    pub fn finish(&self, call_id: &str) -> Option<serde_json::Value> {
        self.buffers.get(call_id).and_then(|b| serde_json::from_str(b).ok())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn complete_json_closes_open_object_and_string() {
        let completed = complete_json(r#"{"title": "X"#).unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&completed).unwrap();
        assert_eq!(parsed["title"], "X");
    }

    #[test]
    fn complete_json_drops_dangling_key() {
        let completed = complete_json(r#"{"title": "X", "tags":"#).unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&completed).unwrap();
        assert_eq!(parsed["title"], "X");
        assert!(parsed.get("tags").is_none());
    }

    #[test]
    fn complete_json_drops_dangling_trailing_comma() {
        let completed = complete_json(r#"{"title": "X","#).unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&completed).unwrap();
        assert_eq!(parsed["title"], "X");
    }

    #[test]
    fn assembler_emits_closed_keys_progressively() {
        let mut assembler = IncrementalJsonAssembler::new();
        assert!(assembler.push(r#"{"title""#).is_none());
        assert!(assembler.push(r#": "X""#).is_some());
        let after_title = assembler.push(", \"tags\": [\"a\"").unwrap();
        assert_eq!(after_title.get("title").unwrap(), "X");
        let after_tags = assembler.push("]}").unwrap();
        assert_eq!(after_tags["tags"], serde_json::json!(["a"]));
    }

    #[test]
    fn assembler_suppresses_duplicate_emissions() {
        let mut assembler = IncrementalJsonAssembler::new();
        assembler.push(r#"{"title": "X""#);
        assert!(assembler.push("").is_none());
    }

    #[tokio::test]
    async fn tool_call_argument_assembler_parses_once_complete() {
        let mut assembler = ToolCallArgumentAssembler::new();
        assembler.push("c1", r#"{"city":"#);
        assembler.push("c1", r#""Tokyo"}"#);
        let parsed = assembler.finish("c1").unwrap();
        assert_eq!(parsed["city"], "Tokyo");
    }

    #[derive(Default)]
    struct RecordingCallbacks {
        partials: Vec<serde_json::Map<String, serde_json::Value>>,
        completed: Vec<serde_json::Value>,
        errors: Vec<(String, String)>,
    }

    impl StreamCallbacks for RecordingCallbacks {
        fn on_partial_json(&mut self, fields_so_far: &serde_json::Map<String, serde_json::Value>) {
            self.partials.push(fields_so_far.clone());
        }

        fn on_parsed_complete(&mut self, value: &serde_json::Value) {
            self.completed.push(value.clone());
        }

        fn on_error(&mut self, kind: &str, detail: &str) {
            self.errors.push((kind.to_string(), detail.to_string()));
        }
    }

    #[tokio::test]
    async fn structured_stream_parser_emits_partials_then_one_completion() {
        let chunks = vec![
            StreamEvent::TextDelta(r#"{"title""#.to_string()),
            StreamEvent::TextDelta(r#"": "X""#.to_string()),
            StreamEvent::TextDelta(r#", "tags": ["a""#.to_string()),
            StreamEvent::TextDelta(r#", "b"]}"#.to_string()),
            StreamEvent::ResponseComplete { usage: None },
        ];
        let stream: StreamEventStream = Box::pin(futures_util::stream::iter(chunks));
        let mut parser = StructuredStreamParser::new(true);
        let mut callbacks = RecordingCallbacks::default();
        parser.dispatch(stream, &mut callbacks).await;

        assert_eq!(callbacks.partials[0].get("title").unwrap(), "X");
        let last_partial = callbacks.partials.last().unwrap();
        assert_eq!(last_partial["title"], "X");
        assert_eq!(last_partial["tags"], serde_json::json!(["a", "b"]));

        assert_eq!(callbacks.completed.len(), 1);
        assert_eq!(callbacks.completed[0]["tags"], serde_json::json!(["a", "b"]));
    }
}
