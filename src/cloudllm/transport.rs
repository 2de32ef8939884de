//! The LLM Transport Contract: the collaborator boundary between the engine
//! and whatever speaks to an actual model provider.
//!
//! The engine never hard-codes a vendor SDK. It depends only on
//! [`LlmTransport`], a trait shaped after CloudLLM's own `ClientWrapper`:
//! a non-streaming `send` every implementation must provide, and an
//! optional `send_stream` override for transports that can emit incremental
//! events. Wiring a concrete HTTP client (OpenAI, Anthropic, ...) against
//! this trait is application/blueprint glue and is not shipped by this
//! crate; [`StubTransport`] below is a deterministic in-memory
//! implementation used by the test suite and by callers who want to drive
//! the engine with scripted responses.
//!
//! # Example
//!
//! ```rust
//! use agent_runtime_core::cloudllm::transport::{LlmTransport, Payload, Role, TransportMessage};
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
//! use agent_runtime_core::cloudllm::transport::StubTransport;
//! let transport = StubTransport::with_text_reply("hello there");
//! let payload = Payload {
//!     model_id: "stub-model".to_string(),
//!     messages: vec![TransportMessage::text(Role::User, "hi")],
//!     tools: vec![],
//!     structured_output_schema: None,
//!     temperature: None,
//!     max_output_tokens: None,
//! };
//! let response = transport.send(&payload).await?;
//! assert_eq!(response.text.as_deref(), Some("hello there"));
//! # Ok(())
//! # }
//! ```

use async_trait::async_trait;
use std::fmt;
use std::pin::Pin;
use std::sync::Mutex;

use crate::cloudllm::error::DynError;

/// A transport failure carrying the transport's own retry classification.
/// Transports that want the engine's §7 retry schedule to act on a failure
/// should return this (boxed into `DynError`) rather than an opaque error;
/// the engine downcasts for it and treats anything else as non-retryable.
#[derive(Debug)]
pub struct TransportError {
    pub message: String,
    pub retryable: bool,
}

impl TransportError {
    pub fn retryable(message: impl Into<String>) -> Self {
        Self { message: message.into(), retryable: true }
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self { message: message.into(), retryable: false }
    }
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for TransportError {}

/// Role of a single transported message.
#[derive(Debug, Clone, PartialEq)]
pub enum Role {
    System,
    User,
    Assistant,
    /// A tool-result message correlating with a prior assistant tool call.
    Tool { call_id: String },
}

/// A single tool call as reported by the transport in a non-streaming response.
#[derive(Debug, Clone)]
pub struct NativeToolCall {
    pub call_id: String,
    pub tool_name: String,
    pub arguments: serde_json::Value,
}

/// A message as handed to, or received from, the transport. Distinct from
/// [`crate::cloudllm::context::Message`]: this is the wire-shaped
/// representation the transport actually consumes, after the engine has
/// projected a windowed `Context` into a flat ordered list.
#[derive(Debug, Clone)]
pub struct TransportMessage {
    pub role: Role,
    pub content: String,
    pub tool_calls: Vec<NativeToolCall>,
}

impl TransportMessage {
    pub fn text(role: Role, content: impl Into<String>) -> Self {
        Self { role, content: content.into(), tool_calls: Vec::new() }
    }
}

/// Provider-agnostic schema for a single declared tool, derived from a
/// [`crate::cloudllm::tool_registry::ToolDeclaration`].
#[derive(Debug, Clone)]
pub struct ToolSchema {
    pub name: String,
    pub description: String,
    pub parameters_schema: serde_json::Value,
}

/// A full request to the transport: model id, the conversation so far, the
/// tool schemas the registry selected for this turn, and an optional
/// structured-output schema.
#[derive(Debug, Clone)]
pub struct Payload {
    pub model_id: String,
    pub messages: Vec<TransportMessage>,
    pub tools: Vec<ToolSchema>,
    pub structured_output_schema: Option<serde_json::Value>,
    pub temperature: Option<f32>,
    pub max_output_tokens: Option<u32>,
}

/// Token accounting for a single transport call.
#[derive(Debug, Clone, Default)]
pub struct TokenUsage {
    pub input_tokens: usize,
    pub output_tokens: usize,
    pub total_tokens: usize,
}

/// The non-streaming response shape: either free text, a structured object,
/// or a batch of tool calls (never more than one of text/tool_calls is
/// meaningfully populated, per the upstream provider's own turn-taking, but
/// both fields exist so a provider that interleaves text and tool calls in
/// one turn can still be represented — see SPEC_FULL.md §9 decisions on
/// text-and-tool-calls ordering).
#[derive(Debug, Clone, Default)]
pub struct TransportResponse {
    pub text: Option<String>,
    pub tool_calls: Vec<NativeToolCall>,
    pub usage: Option<TokenUsage>,
}

/// One event in a streamed response, consumed by
/// [`crate::cloudllm::stream_parser::StructuredStreamParser`].
#[derive(Debug, Clone)]
pub enum StreamEvent {
    TextDelta(String),
    ToolCallDelta { call_id: String, tool_name: Option<String>, arguments_delta: String },
    ToolCallComplete { call_id: String, tool_name: String, arguments: serde_json::Value },
    ResponseComplete { usage: Option<TokenUsage> },
    Error(String),
}

pub type StreamEventStream = Pin<Box<dyn futures_util::Stream<Item = StreamEvent> + Send>>;

/// The LLM Transport Contract (§6.1). Implementations must be `Send + Sync`
/// so a transport handle can be shared across concurrent runs.
#[async_trait]
pub trait LlmTransport: Send + Sync {
    /// Full request/response call.
    async fn send(&self, payload: &Payload) -> Result<TransportResponse, DynError>;

    /// Streaming call. Transports without streaming support inherit the
    /// default, which simply resolves to `None`; the engine falls back to
    /// [`LlmTransport::send`] in that case.
    async fn send_stream(&self, _payload: &Payload) -> Result<Option<StreamEventStream>, DynError> {
        Ok(None)
    }

    /// Identifier of the model this transport talks to, used in telemetry.
    fn model_name(&self) -> &str;
}

/// A deterministic, in-memory transport for tests and scripted demos. Each
/// call to [`LlmTransport::send`] pops the next queued response; once the
/// queue is drained it repeats the last response.
pub struct StubTransport {
    model_name: String,
    responses: Mutex<Vec<TransportResponse>>,
}

impl StubTransport {
    pub fn new(model_name: impl Into<String>, responses: Vec<TransportResponse>) -> Self {
        Self { model_name: model_name.into(), responses: Mutex::new(responses) }
    }

    pub fn with_text_reply(text: impl Into<String>) -> Self {
        Self::new(
            "stub-model",
            vec![TransportResponse { text: Some(text.into()), tool_calls: vec![], usage: None }],
        )
    }
}

#[async_trait]
impl LlmTransport for StubTransport {
    async fn send(&self, _payload: &Payload) -> Result<TransportResponse, DynError> {
        let mut queue = self.responses.lock().unwrap();
        if queue.len() > 1 {
            Ok(queue.remove(0))
        } else if let Some(last) = queue.last() {
            Ok(last.clone())
        } else {
            Ok(TransportResponse::default())
        }
    }

    fn model_name(&self) -> &str {
        &self.model_name
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn stub_transport_pops_queued_responses_in_order() {
        let transport = StubTransport::new(
            "m",
            vec![
                TransportResponse { text: Some("first".into()), tool_calls: vec![], usage: None },
                TransportResponse { text: Some("second".into()), tool_calls: vec![], usage: None },
            ],
        );
        let payload = Payload {
            model_id: "m".into(),
            messages: vec![],
            tools: vec![],
            structured_output_schema: None,
            temperature: None,
            max_output_tokens: None,
        };
        let first = transport.send(&payload).await.unwrap();
        let second = transport.send(&payload).await.unwrap();
        let third = transport.send(&payload).await.unwrap();
        assert_eq!(first.text.as_deref(), Some("first"));
        assert_eq!(second.text.as_deref(), Some("second"));
        assert_eq!(third.text.as_deref(), Some("second"));
    }

    #[test]
    fn transport_error_retryability_survives_boxing_into_dyn_error() {
        let boxed: DynError = Box::new(TransportError::retryable("rate limited"));
        let recovered = boxed.downcast_ref::<TransportError>().expect("downcast");
        assert!(recovered.retryable);
        assert_eq!(recovered.message, "rate limited");
    }
}
