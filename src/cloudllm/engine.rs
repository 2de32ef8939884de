//! Interaction Engine (C6): drives one agent run through
//! START -> INPUT_GUARD -> LLM_CALL -> PARSE -> DISPATCH ->
//! {TEXT_DONE | TOOL_EXEC -> LLM_CALL | HANDOFF | PAUSED} -> OUTPUT_GUARD -> DONE.
//!
//! Grounded in `agent.rs::Agent::send`'s single-call-then-tool-loop shape,
//! generalized from "one tool call per response, looped" into full
//! batch/DAG dispatch via [`crate::cloudllm::tool_executor`], and in
//! `planner.rs::BasicPlanner`'s iteration-budget/outcome-tagging style
//! (`PlannerOutcome`, `max_tool_iterations`).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;

use crate::cloudllm::config::RuntimeConfig;
use crate::cloudllm::context::{Context, Message, ToolCallSummary, WindowPolicy};
use crate::cloudllm::error::{DynError, EngineError};
use crate::cloudllm::guardrail::GuardrailChain;
use crate::cloudllm::snapshot::RunSnapshot;
use crate::cloudllm::stream_parser::StreamCallbacks;
use crate::cloudllm::telemetry::{NoopTelemetry, Telemetry};
use crate::cloudllm::tool_executor::{run_batch, ErrorPolicy, ToolCallRequest};
use crate::cloudllm::tool_registry::{ToolRegistry, ToolResultStatus};
use crate::cloudllm::transport::{LlmTransport, NativeToolCall, Payload, Role, StreamEvent, StreamEventStream, ToolSchema, TransportMessage, TransportResponse};

/// A sub-agent reachable from another agent as a synthetic tool
/// (`invoke_<snake_name>`, §4.6.3). `shared_context` controls whether the
/// nested run sees the caller's full `Context` or starts from a fresh one.
pub struct SubAgentDeclaration {
    pub definition: Arc<AgentDefinition>,
    pub shared_context: bool,
}

impl SubAgentDeclaration {
    pub fn new(definition: Arc<AgentDefinition>) -> Self {
        Self { definition, shared_context: false }
    }

    pub fn with_shared_context(mut self) -> Self {
        self.shared_context = true;
        self
    }
}

/// A declaration-scoped critic (§4.6.2): after a pure-text turn, the
/// producer's output is handed to an isolated second LLM call running
/// `system_prompt`; a rejection feeds the critique back to the producer and
/// re-enters the loop, up to `max_retries` times.
pub struct CriticDeclaration {
    pub system_prompt: String,
    pub model_id: String,
    pub max_retries: u32,
}

impl CriticDeclaration {
    pub fn new(system_prompt: impl Into<String>, model_id: impl Into<String>) -> Self {
        Self { system_prompt: system_prompt.into(), model_id: model_id.into(), max_retries: 1 }
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }
}

/// Static declaration of one agent definition: its system prompt, model id,
/// turn budget, and tool-selection query. Handoffs are other
/// `AgentDefinition`s the engine is configured to recognize by name;
/// `sub_agents` are other `AgentDefinition`s surfaced to this agent as
/// callable tools (§4.6.3).
pub struct AgentDefinition {
    pub agent_id: String,
    pub system_prompt: String,
    pub model_id: String,
    pub max_turns: u32,
    pub tool_selection_query: String,
    pub tool_top_k: usize,
    pub sub_agents: Vec<SubAgentDeclaration>,
    pub critic: Option<CriticDeclaration>,
}

impl AgentDefinition {
    pub fn new(agent_id: impl Into<String>, system_prompt: impl Into<String>, model_id: impl Into<String>) -> Self {
        Self {
            agent_id: agent_id.into(),
            system_prompt: system_prompt.into(),
            model_id: model_id.into(),
            max_turns: 10,
            tool_selection_query: String::new(),
            tool_top_k: 8,
            sub_agents: Vec::new(),
            critic: None,
        }
    }

    pub fn with_max_turns(mut self, max_turns: u32) -> Self {
        self.max_turns = max_turns;
        self
    }

    pub fn with_sub_agents(mut self, sub_agents: Vec<SubAgentDeclaration>) -> Self {
        self.sub_agents = sub_agents;
        self
    }

    pub fn with_critic(mut self, critic: CriticDeclaration) -> Self {
        self.critic = Some(critic);
        self
    }
}

/// `invoke_<snake_name>` — the synthetic tool name a sub-agent is surfaced
/// under (§4.6.3).
fn invoke_tool_name(agent_id: &str) -> String {
    format!("invoke_{}", to_snake_case(agent_id))
}

fn to_snake_case(s: &str) -> String {
    s.chars().map(|c| if c.is_alphanumeric() { c.to_ascii_lowercase() } else { '_' }).collect()
}

/// Generate a fresh run id for callers that don't track their own, e.g. a
/// CLI driving one-off interactions. Grounded in `planner.rs`'s own use of
/// `uuid::Uuid` for correlating planner turns.
pub fn new_run_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// Outcome of folding one transport response into the context: either the
/// loop continues to another LLM call, or it reaches one of `interact`'s
/// terminal states. Factored out of `interact` so [`Engine::interact_stream`]
/// can share the PARSE/DISPATCH/TOOL_EXEC step without duplicating it.
enum TurnOutcome {
    Continue,
    Done(String),
    Paused(RunSnapshot),
    Handoff { target_agent_id: String, transferred_context: Context },
}

/// Outcome of one [`Engine::run_critic`] call (§4.6.2).
enum CriticVerdict {
    Accept,
    Reject(String),
}

/// Terminal outcome of one `interact` call.
#[derive(Debug)]
pub enum InteractionOutcome {
    /// The run completed normally with a final assistant message.
    Done { final_text: String },
    /// The run paused because one or more dispatched tool calls require
    /// confirmation. Resume with [`Engine::resume`] after deciding each.
    Paused { snapshot: RunSnapshot },
    /// The assistant requested a handoff to another agent; the caller is
    /// expected to re-enter `interact` against the target agent.
    Handoff { target_agent_id: String, transferred_context: Option<Context> },
}

/// The Interaction Engine: one instance per run, holding the collaborators
/// it was wired with. An engine itself is stateless across runs — all
/// mutable state lives in the `Context` passed to `interact`.
pub struct Engine {
    pub transport: Arc<dyn LlmTransport>,
    pub tool_registry: Arc<ToolRegistry>,
    pub input_guardrails: GuardrailChain<String>,
    pub output_guardrails: GuardrailChain<String>,
    pub window_policy: Box<dyn WindowPolicy>,
    pub telemetry: Arc<dyn Telemetry>,
    pub tool_error_policy: ErrorPolicy,
    pub config: RuntimeConfig,
}

impl Engine {
    pub fn new(transport: Arc<dyn LlmTransport>, tool_registry: Arc<ToolRegistry>, window_policy: Box<dyn WindowPolicy>) -> Self {
        Self {
            transport,
            tool_registry,
            input_guardrails: GuardrailChain::new(),
            output_guardrails: GuardrailChain::new(),
            window_policy,
            telemetry: Arc::new(NoopTelemetry),
            tool_error_policy: ErrorPolicy::Isolate,
            config: RuntimeConfig::default(),
        }
    }

    pub fn with_telemetry(mut self, telemetry: Arc<dyn Telemetry>) -> Self {
        self.telemetry = telemetry;
        self
    }

    pub fn with_input_guardrails(mut self, guardrails: GuardrailChain<String>) -> Self {
        self.input_guardrails = guardrails;
        self
    }

    pub fn with_output_guardrails(mut self, guardrails: GuardrailChain<String>) -> Self {
        self.output_guardrails = guardrails;
        self
    }

    /// Override the default resource budgets (§5) and retry/backoff policy
    /// (§7) this engine enforces.
    pub fn with_config(mut self, config: RuntimeConfig) -> Self {
        self.config = config;
        self
    }

    /// One LLM call with the engine's declarative bounded-backoff retry
    /// (§7): retried only while the transport itself marks the failure
    /// retryable, up to `config.transport_retry_max_attempts` attempts.
    async fn send_with_retry(&self, payload: &Payload) -> Result<TransportResponse, EngineError> {
        let mut attempt: u32 = 0;
        loop {
            match self.transport.send(payload).await {
                Ok(response) => return Ok(response),
                Err(e) => {
                    let (message, retryable) = classify_transport_error(&e);
                    let err = EngineError::LlmTransportError { message, retryable };
                    if !err.is_retryable() || attempt + 1 >= self.config.transport_retry_max_attempts {
                        return Err(err);
                    }
                    tokio::time::sleep(self.config.transport_retry_base_delay * 2u32.pow(attempt)).await;
                    attempt += 1;
                }
            }
        }
    }

    /// Streaming counterpart of [`send_with_retry`](Engine::send_with_retry).
    async fn send_stream_with_retry(&self, payload: &Payload) -> Result<Option<StreamEventStream>, EngineError> {
        let mut attempt: u32 = 0;
        loop {
            match self.transport.send_stream(payload).await {
                Ok(stream) => return Ok(stream),
                Err(e) => {
                    let (message, retryable) = classify_transport_error(&e);
                    let err = EngineError::LlmTransportError { message, retryable };
                    if !err.is_retryable() || attempt + 1 >= self.config.transport_retry_max_attempts {
                        return Err(err);
                    }
                    tokio::time::sleep(self.config.transport_retry_base_delay * 2u32.pow(attempt)).await;
                    attempt += 1;
                }
            }
        }
    }

    /// Run one interaction to completion (or pause/handoff), appending a
    /// `User` message for `input` and driving the state machine until a
    /// terminal `InteractionOutcome`.
    pub async fn interact(
        &self,
        run_id: &str,
        definition: &AgentDefinition,
        context: &mut Context,
        input: &str,
    ) -> Result<InteractionOutcome, EngineError> {
        self.interact_at_depth(run_id, definition, context, input, 0).await
    }

    /// `interact`'s actual implementation, carrying the sub-agent recursion
    /// depth (§4.6.3, §5) so nested `invoke_<snake_name>` dispatch inside
    /// [`process_response`](Engine::process_response) can bound itself
    /// without a side channel.
    async fn interact_at_depth(
        &self,
        run_id: &str,
        definition: &AgentDefinition,
        context: &mut Context,
        input: &str,
        depth: u32,
    ) -> Result<InteractionOutcome, EngineError> {
        self.telemetry.run_start(run_id).await;

        // INPUT_GUARD
        let gated = self
            .input_guardrails
            .run(input.to_string())
            .await
            .map_err(|e| map_dyn_error(e))?;
        let gated_input = match gated {
            Ok(value) => value,
            Err((name, reason)) => {
                self.telemetry.guardrail_reject(run_id, &name, &reason).await;
                let err = EngineError::InputGuardrailReject { reason };
                self.telemetry.run_end(run_id, Some(&err)).await;
                return Err(err);
            }
        };
        context.append(Message::user(gated_input));

        let mut critic_retries_left = definition.critic.as_ref().map(|c| c.max_retries).unwrap_or(0);

        loop {
            context.begin_turn();
            if context.turn_count() > definition.max_turns {
                let err = EngineError::MaxTurnsExceeded { turns: context.turn_count() };
                self.telemetry.run_end(run_id, Some(&err)).await;
                return Err(err);
            }
            self.telemetry.turn_start(run_id, context.turn_count()).await;

            // LLM_CALL
            let payload = self.build_payload(definition, context, None);
            self.telemetry.llm_call_start(run_id).await;
            let response = self.send_with_retry(&payload).await?;
            self.telemetry.llm_call_end(run_id, response.usage.as_ref().map(|u| u.output_tokens)).await;

            match self.process_response(run_id, definition, context, response, depth).await? {
                TurnOutcome::Continue => continue,
                TurnOutcome::Done(final_text) => {
                    // REFLECTION (§4.6.2, optional, declaration-scoped)
                    if let Some(critic) = &definition.critic {
                        if critic_retries_left > 0 {
                            match self.run_critic(run_id, critic, &final_text).await? {
                                CriticVerdict::Accept => {}
                                CriticVerdict::Reject(critique) => {
                                    critic_retries_left -= 1;
                                    context.append(Message::Assistant { content: Some(final_text), tool_calls: Vec::new() });
                                    context.append(Message::user(format!(
                                        "A reviewer rejected your last answer: {}\nPlease revise your answer accordingly.",
                                        critique
                                    )));
                                    continue;
                                }
                            }
                        }
                    }
                    // OUTPUT_GUARD
                    let gated = self.output_guardrails.run(final_text).await.map_err(map_dyn_error)?;
                    return match gated {
                        Ok(value) => {
                            self.telemetry.run_end(run_id, None).await;
                            Ok(InteractionOutcome::Done { final_text: value })
                        }
                        Err((name, reason)) => {
                            self.telemetry.guardrail_reject(run_id, &name, &reason).await;
                            let err = EngineError::OutputGuardrailReject { reason };
                            self.telemetry.run_end(run_id, Some(&err)).await;
                            Err(err)
                        }
                    };
                }
                TurnOutcome::Paused(snapshot) => return Ok(InteractionOutcome::Paused { snapshot }),
                TurnOutcome::Handoff { target_agent_id, transferred_context } => {
                    self.telemetry.run_end(run_id, None).await;
                    return Ok(InteractionOutcome::Handoff { target_agent_id, transferred_context: Some(transferred_context) });
                }
            }
        }
    }

    /// Invoke a declared critic as an isolated second LLM call over
    /// `producer_output` (§4.6.2). The critic accepts unless its reply opens
    /// with `REJECT`, in which case the remainder of its reply is the
    /// critique fed back to the producer.
    async fn run_critic(&self, run_id: &str, critic: &CriticDeclaration, producer_output: &str) -> Result<CriticVerdict, EngineError> {
        let payload = Payload {
            model_id: critic.model_id.clone(),
            messages: vec![
                TransportMessage::text(Role::System, critic.system_prompt.clone()),
                TransportMessage::text(Role::User, producer_output.to_string()),
            ],
            tools: Vec::new(),
            structured_output_schema: None,
            temperature: None,
            max_output_tokens: None,
        };
        self.telemetry.llm_call_start(run_id).await;
        let response = self.send_with_retry(&payload).await?;
        self.telemetry.llm_call_end(run_id, response.usage.as_ref().map(|u| u.output_tokens)).await;
        let verdict_text = response.text.unwrap_or_default();
        match verdict_text.strip_prefix("REJECT") {
            Some(rest) => Ok(CriticVerdict::Reject(rest.trim_start_matches(':').trim().to_string())),
            None => Ok(CriticVerdict::Accept),
        }
    }

    /// Streaming counterpart of [`interact`](Engine::interact): drives the
    /// same state machine but calls [`LlmTransport::send_stream`] at each
    /// LLM_CALL step and forwards every [`StreamEvent`] to `callbacks` as it
    /// arrives (§4.4, §6.5), falling back to the non-streaming `send` for
    /// transports that don't override `send_stream` (per its own doc
    /// comment). Runs on a spawned task; returns a [`StreamHandle`] the
    /// caller can `join` for the terminal [`InteractionOutcome`] or pass to
    /// [`cancel`] to request cooperative early stop at the next turn
    /// boundary.
    pub fn interact_stream(
        self: Arc<Self>,
        run_id: String,
        definition: AgentDefinition,
        mut context: Context,
        input: String,
        mut callbacks: Box<dyn StreamCallbacks>,
    ) -> StreamHandle {
        let cancel_flag = Arc::new(AtomicBool::new(false));
        let task_cancel_flag = cancel_flag.clone();
        let join = tokio::spawn(async move {
            let engine = self;
            engine.telemetry.run_start(&run_id).await;

            let gated = engine
                .input_guardrails
                .run(input)
                .await
                .map_err(map_dyn_error)?;
            let gated_input = match gated {
                Ok(value) => value,
                Err((name, reason)) => {
                    engine.telemetry.guardrail_reject(&run_id, &name, &reason).await;
                    let err = EngineError::InputGuardrailReject { reason };
                    engine.telemetry.run_end(&run_id, Some(&err)).await;
                    return Err(err);
                }
            };
            context.append(Message::user(gated_input));

            loop {
                if task_cancel_flag.load(Ordering::SeqCst) {
                    let err = EngineError::Canceled;
                    engine.telemetry.run_end(&run_id, Some(&err)).await;
                    return Err(err);
                }
                context.begin_turn();
                if context.turn_count() > definition.max_turns {
                    let err = EngineError::MaxTurnsExceeded { turns: context.turn_count() };
                    engine.telemetry.run_end(&run_id, Some(&err)).await;
                    return Err(err);
                }
                engine.telemetry.turn_start(&run_id, context.turn_count()).await;

                let payload = engine.build_payload(&definition, &context, None);
                engine.telemetry.llm_call_start(&run_id).await;
                let response = match engine.send_stream_with_retry(&payload).await? {
                    Some(stream) => collect_streamed_response(stream, callbacks.as_mut(), engine.config.max_stream_idle_time).await?,
                    None => engine.send_with_retry(&payload).await?,
                };
                engine.telemetry.llm_call_end(&run_id, response.usage.as_ref().map(|u| u.output_tokens)).await;

                match engine.process_response(&run_id, &definition, &mut context, response, 0).await? {
                    TurnOutcome::Continue => continue,
                    TurnOutcome::Done(final_text) => {
                        let gated = engine.output_guardrails.run(final_text).await.map_err(map_dyn_error)?;
                        return match gated {
                            Ok(value) => {
                                engine.telemetry.run_end(&run_id, None).await;
                                Ok(InteractionOutcome::Done { final_text: value })
                            }
                            Err((name, reason)) => {
                                engine.telemetry.guardrail_reject(&run_id, &name, &reason).await;
                                let err = EngineError::OutputGuardrailReject { reason };
                                engine.telemetry.run_end(&run_id, Some(&err)).await;
                                Err(err)
                            }
                        };
                    }
                    TurnOutcome::Paused(snapshot) => return Ok(InteractionOutcome::Paused { snapshot }),
                    TurnOutcome::Handoff { target_agent_id, transferred_context } => {
                        engine.telemetry.run_end(&run_id, None).await;
                        return Ok(InteractionOutcome::Handoff { target_agent_id, transferred_context: Some(transferred_context) });
                    }
                }
            }
        });
        StreamHandle { cancel_flag, join }
    }

    /// Structured-output counterpart of [`interact`](Engine::interact): asks
    /// the transport to constrain its final response to `schema` and
    /// deserializes it into `T` once the run reaches `TEXT_DONE`. Tool calls
    /// are still dispatched exactly as in `interact`; only the terminal text
    /// response is parsed as structured data rather than handed back raw.
    pub async fn interact_structured<T: serde::de::DeserializeOwned>(
        &self,
        run_id: &str,
        definition: &AgentDefinition,
        context: &mut Context,
        input: &str,
        schema: serde_json::Value,
    ) -> Result<T, EngineError> {
        self.telemetry.run_start(run_id).await;

        let gated = self.input_guardrails.run(input.to_string()).await.map_err(map_dyn_error)?;
        let gated_input = match gated {
            Ok(value) => value,
            Err((name, reason)) => {
                self.telemetry.guardrail_reject(run_id, &name, &reason).await;
                let err = EngineError::InputGuardrailReject { reason };
                self.telemetry.run_end(run_id, Some(&err)).await;
                return Err(err);
            }
        };
        context.append(Message::user(gated_input));

        let mut parse_retries_left = self.config.structured_output_retry_limit;

        loop {
            context.begin_turn();
            if context.turn_count() > definition.max_turns {
                let err = EngineError::MaxTurnsExceeded { turns: context.turn_count() };
                self.telemetry.run_end(run_id, Some(&err)).await;
                return Err(err);
            }
            self.telemetry.turn_start(run_id, context.turn_count()).await;

            let payload = self.build_payload(definition, context, Some(schema.clone()));
            self.telemetry.llm_call_start(run_id).await;
            let response = self.send_with_retry(&payload).await?;
            self.telemetry.llm_call_end(run_id, response.usage.as_ref().map(|u| u.output_tokens)).await;

            match self.process_response(run_id, definition, context, response, 0).await? {
                TurnOutcome::Continue => continue,
                TurnOutcome::Done(final_text) => {
                    match serde_json::from_str::<T>(&final_text) {
                        Ok(value) => {
                            self.telemetry.run_end(run_id, None).await;
                            return Ok(value);
                        }
                        Err(e) if parse_retries_left > 0 => {
                            // retry up to a small bound with a reflective error message (§4.6.1 step 4)
                            parse_retries_left -= 1;
                            context.append(Message::Assistant { content: Some(final_text), tool_calls: Vec::new() });
                            context.append(Message::user(format!(
                                "Your last response did not match the required JSON schema: {}. Please respond again with output that validates against the schema.",
                                e
                            )));
                            if !self.config.structured_retries_count_against_max_turns {
                                context.undo_turn();
                            }
                            continue;
                        }
                        Err(e) => {
                            let err = EngineError::StructuredParseError { detail: e.to_string() };
                            self.telemetry.run_end(run_id, Some(&err)).await;
                            return Err(err);
                        }
                    }
                }
                TurnOutcome::Paused(snapshot) => {
                    let err = EngineError::StructuredParseError { detail: format!("run paused awaiting confirmation (run_id={})", snapshot.run_id) };
                    self.telemetry.run_end(run_id, Some(&err)).await;
                    return Err(err);
                }
                TurnOutcome::Handoff { target_agent_id, .. } => {
                    let err = EngineError::StructuredParseError { detail: format!("run handed off to {} before producing structured output", target_agent_id) };
                    self.telemetry.run_end(run_id, Some(&err)).await;
                    return Err(err);
                }
            }
        }
    }

    /// PARSE + DISPATCH + TOOL_EXEC: fold one transport response into
    /// `context`, run any requested tool calls, and report what the caller's
    /// loop should do next. Shared by [`interact`](Engine::interact) and
    /// [`interact_stream`](Engine::interact_stream).
    async fn process_response(
        &self,
        run_id: &str,
        definition: &AgentDefinition,
        context: &mut Context,
        response: TransportResponse,
        depth: u32,
    ) -> Result<TurnOutcome, EngineError> {
        let tool_calls: Vec<ToolCallSummary> = response
            .tool_calls
            .iter()
            .map(|c| ToolCallSummary { call_id: c.call_id.clone(), tool_name: c.tool_name.clone(), arguments: c.arguments.clone() })
            .collect();
        context.append(Message::Assistant { content: response.text.clone(), tool_calls: tool_calls.clone() });

        if let Some(handoff) = tool_calls.iter().find(|c| c.tool_name.starts_with("handoff_to_")) {
            let target = handoff.tool_name.trim_start_matches("handoff_to_").to_string();
            context.append(Message::HandoffMarker { target_agent_id: target.clone(), transferred_context: true });
            self.telemetry.handoff(run_id, &target).await;
            return Ok(TurnOutcome::Handoff { target_agent_id: target, transferred_context: context.clone() });
        }

        if tool_calls.is_empty() {
            return Ok(TurnOutcome::Done(response.text.unwrap_or_default()));
        }

        if tool_calls.len() > self.config.max_tool_calls_per_batch {
            let err = EngineError::ToolBatchTooLarge { requested: tool_calls.len(), max: self.config.max_tool_calls_per_batch };
            self.telemetry.run_end(run_id, Some(&err)).await;
            return Err(err);
        }

        // Sub-agent-as-tool dispatch (§4.6.3): calls whose name matches a
        // declared sub-agent's `invoke_<snake_name>` run a nested engine
        // instance rather than going through the tool registry.
        let mut regular_calls = Vec::with_capacity(tool_calls.len());
        for call in &tool_calls {
            let sub_agent = definition.sub_agents.iter().find(|s| invoke_tool_name(&s.definition.agent_id) == call.tool_name);
            match sub_agent {
                Some(sub_agent) => {
                    self.telemetry.tool_call_start(run_id, &call.call_id, &call.tool_name).await;
                    let (payload, status) = self.invoke_sub_agent(sub_agent, call, context, depth).await?;
                    self.telemetry.tool_call_end(run_id, &call.call_id, status == ToolResultStatus::Success).await;
                    context.append(Message::ToolResult { call_id: call.call_id.clone(), payload, status: to_context_status(status) });
                }
                None => regular_calls.push(call.clone()),
            }
        }

        if regular_calls.is_empty() {
            return Ok(TurnOutcome::Continue);
        }

        let requests: Vec<ToolCallRequest> = regular_calls
            .iter()
            .map(|c| ToolCallRequest { call_id: c.call_id.clone(), tool_name: c.tool_name.clone(), arguments: c.arguments.clone() })
            .collect();
        for req in &requests {
            self.telemetry.tool_call_start(run_id, &req.call_id, &req.tool_name).await;
        }
        let outcome = run_batch(self.tool_registry.clone(), requests.clone(), self.tool_error_policy).await?;

        if !outcome.pending_confirmation.is_empty() {
            let snapshot = RunSnapshot::new(run_id, definition.agent_id.clone(), context, requests);
            self.telemetry.pause(run_id, &outcome.pending_confirmation).await;
            return Ok(TurnOutcome::Paused(snapshot));
        }

        for result in &outcome.results {
            self.telemetry.tool_call_end(run_id, &result.call_id, result.status == ToolResultStatus::Success).await;
            context.append(Message::ToolResult {
                call_id: result.call_id.clone(),
                payload: result.payload.clone(),
                status: to_context_status(result.status),
            });
        }
        Ok(TurnOutcome::Continue)
    }

    /// Run one `invoke_<snake_name>` call as a nested
    /// [`interact_at_depth`](Engine::interact_at_depth), bounded by
    /// `config.max_sub_agent_depth`, returning the tool-result
    /// payload/status the caller's loop should fold into `Context`.
    async fn invoke_sub_agent(
        &self,
        sub_agent: &SubAgentDeclaration,
        call: &ToolCallSummary,
        caller_context: &Context,
        depth: u32,
    ) -> Result<(serde_json::Value, ToolResultStatus), EngineError> {
        if depth + 1 > self.config.max_sub_agent_depth {
            return Err(EngineError::SubAgentDepthExceeded { depth: depth + 1 });
        }
        let nested_input = call.arguments.get("input").and_then(|v| v.as_str()).unwrap_or_default().to_string();
        let mut nested_context = if sub_agent.shared_context { caller_context.clone() } else { Context::new() };
        let nested_run_id = new_run_id();
        let outcome = Box::pin(self.interact_at_depth(&nested_run_id, &sub_agent.definition, &mut nested_context, &nested_input, depth + 1)).await;
        match outcome {
            Ok(InteractionOutcome::Done { final_text }) => Ok((serde_json::json!({ "output": final_text }), ToolResultStatus::Success)),
            Ok(other) => Ok((
                serde_json::json!({ "error": format!("sub-agent did not complete with a final answer: {:?}", other) }),
                ToolResultStatus::Error,
            )),
            Err(e) => Ok((serde_json::json!({ "error": e.to_string() }), ToolResultStatus::Error)),
        }
    }

    /// Resume a paused run after every pending call has an approve/reject
    /// decision. Approved calls execute for real; rejected calls are
    /// recorded as skipped so the LLM sees why they didn't run.
    pub async fn resume(
        &self,
        run_id: &str,
        definition: &AgentDefinition,
        context: &mut Context,
        snapshot: &RunSnapshot,
    ) -> Result<InteractionOutcome, EngineError> {
        snapshot.check_all_decided()?;
        self.telemetry.resume(run_id).await;

        for call in &snapshot.pending_batch {
            let approved = snapshot.decisions.get(&call.call_id).copied().unwrap_or(false);
            let result = if approved {
                self.tool_registry.execute(&call.call_id, &call.tool_name, call.arguments.clone()).await
            } else {
                crate::cloudllm::tool_registry::ToolResult::skipped(&call.call_id, "rejected by operator")
            };
            context.append(Message::ToolResult {
                call_id: result.call_id.clone(),
                payload: result.payload.clone(),
                status: to_context_status(result.status),
            });
        }

        self.interact(run_id, definition, context, "").await
    }

    fn build_payload(&self, definition: &AgentDefinition, context: &Context, structured_output_schema: Option<serde_json::Value>) -> Payload {
        let windowed = context.window(self.window_policy.as_ref());
        let mut messages = vec![TransportMessage::text(Role::System, definition.system_prompt.clone())];
        for message in &windowed {
            messages.push(to_transport_message(message));
        }
        let mut tools: Vec<ToolSchema> = self
            .tool_registry
            .select(&definition.tool_selection_query, definition.tool_top_k)
            .into_iter()
            .map(|d| ToolSchema { name: d.name.clone(), description: d.description.clone(), parameters_schema: d.parameters_schema.clone() })
            .collect();
        for sub_agent in &definition.sub_agents {
            tools.push(ToolSchema {
                name: invoke_tool_name(&sub_agent.definition.agent_id),
                description: format!("Invoke the '{}' sub-agent with a natural-language instruction.", sub_agent.definition.agent_id),
                parameters_schema: serde_json::json!({
                    "type": "object",
                    "properties": { "input": { "type": "string", "description": "instruction passed to the sub-agent" } },
                    "required": ["input"]
                }),
            });
        }
        Payload {
            model_id: definition.model_id.clone(),
            messages,
            tools,
            structured_output_schema,
            temperature: None,
            max_output_tokens: None,
        }
    }
}

/// A running [`Engine::interact_stream`] call. `join` awaits its terminal
/// outcome; [`cancel`] requests cooperative early stop at the next turn
/// boundary (checked before each LLM call, not mid-stream).
pub struct StreamHandle {
    cancel_flag: Arc<AtomicBool>,
    join: tokio::task::JoinHandle<Result<InteractionOutcome, EngineError>>,
}

impl StreamHandle {
    /// Await the spawned run to completion. A task that panicked or was
    /// force-aborted surfaces as [`EngineError::Canceled`].
    pub async fn join(self) -> Result<InteractionOutcome, EngineError> {
        self.join.await.unwrap_or(Err(EngineError::Canceled))
    }
}

/// Request cooperative cancellation of a run started with
/// [`Engine::interact_stream`] (§6.5). The run stops at its next turn
/// boundary rather than mid-stream, so an in-flight tool batch still
/// completes.
pub fn cancel(handle: &StreamHandle) {
    handle.cancel_flag.store(true, Ordering::SeqCst);
}

/// Drain one streamed transport response to completion, forwarding every
/// event to `callbacks` as it arrives and assembling the same
/// [`TransportResponse`] shape `interact`'s non-streaming path would have
/// received, so [`Engine::process_response`] can treat both paths alike.
async fn collect_streamed_response(
    mut stream: StreamEventStream,
    callbacks: &mut dyn StreamCallbacks,
    idle_timeout: Duration,
) -> Result<TransportResponse, EngineError> {
    let mut text = String::new();
    let mut tool_calls = Vec::new();
    let mut usage = None;
    loop {
        let event = match tokio::time::timeout(idle_timeout, stream.next()).await {
            Ok(Some(event)) => event,
            Ok(None) => break,
            Err(_) => {
                callbacks.on_error("llm_stream_timeout", "no stream event arrived within max_stream_idle_time");
                return Err(EngineError::LlmStreamTimeout);
            }
        };
        match event {
            StreamEvent::TextDelta(chunk) => {
                callbacks.on_text_delta(&chunk);
                text.push_str(&chunk);
            }
            StreamEvent::ToolCallDelta { .. } => {}
            StreamEvent::ToolCallComplete { call_id, tool_name, arguments } => {
                callbacks.on_tool_call(&call_id, &tool_name, &arguments);
                tool_calls.push(NativeToolCall { call_id, tool_name, arguments });
            }
            StreamEvent::ResponseComplete { usage: final_usage } => {
                usage = final_usage;
            }
            StreamEvent::Error(detail) => {
                callbacks.on_error("llm_transport_error", &detail);
                return Err(EngineError::LlmTransportError { message: detail, retryable: false });
            }
        }
    }
    Ok(TransportResponse { text: if text.is_empty() { None } else { Some(text) }, tool_calls, usage })
}

fn to_context_status(status: crate::cloudllm::tool_registry::ToolResultStatus) -> crate::cloudllm::context::ToolResultStatus {
    use crate::cloudllm::context::ToolResultStatus as CtxStatus;
    use crate::cloudllm::tool_registry::ToolResultStatus as RegStatus;
    match status {
        RegStatus::Success => CtxStatus::Success,
        RegStatus::Error => CtxStatus::Error,
        RegStatus::Skipped => CtxStatus::Skipped,
    }
}

fn to_transport_message(message: &Message) -> TransportMessage {
    match message {
        Message::System { content } => TransportMessage::text(Role::System, content.clone()),
        Message::User { content } => TransportMessage::text(Role::User, content.clone()),
        Message::Assistant { content, tool_calls } => TransportMessage {
            role: Role::Assistant,
            content: content.clone().unwrap_or_default(),
            tool_calls: tool_calls
                .iter()
                .map(|t| crate::cloudllm::transport::NativeToolCall {
                    call_id: t.call_id.clone(),
                    tool_name: t.tool_name.clone(),
                    arguments: t.arguments.clone(),
                })
                .collect(),
        },
        Message::ToolResult { call_id, payload, .. } => {
            TransportMessage::text(Role::Tool { call_id: call_id.clone() }, payload.to_string())
        }
        Message::HandoffMarker { target_agent_id, .. } => {
            TransportMessage::text(Role::System, format!("[handed off to {}]", target_agent_id))
        }
    }
}

fn map_dyn_error(e: DynError) -> EngineError {
    EngineError::LlmTransportError { message: e.to_string(), retryable: false }
}

/// Recover a transport's own retry classification from a boxed error (§7).
/// Transports that return [`crate::cloudllm::transport::TransportError`]
/// get their `retryable` flag honored; any other error type defaults to
/// non-retryable rather than guessed at.
fn classify_transport_error(e: &DynError) -> (String, bool) {
    match e.downcast_ref::<crate::cloudllm::transport::TransportError>() {
        Some(transport_err) => (transport_err.message.clone(), transport_err.retryable),
        None => (e.to_string(), false),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cloudllm::context::TrimWindowPolicy;
    use crate::cloudllm::tool_registry::Bm25Strategy;
    use crate::cloudllm::transport::{NativeToolCall, StubTransport, TransportResponse};
    use async_trait::async_trait;

    fn engine_with(responses: Vec<TransportResponse>) -> Engine {
        let transport = Arc::new(StubTransport::new("m", responses));
        let registry = Arc::new(ToolRegistry::new(Box::new(Bm25Strategy::default())));
        Engine::new(transport, registry, Box::new(TrimWindowPolicy::new(10_000)))
    }

    #[test]
    fn new_run_id_produces_distinct_values() {
        assert_ne!(new_run_id(), new_run_id());
    }

    #[tokio::test]
    async fn plain_text_response_completes_the_run() {
        let engine = engine_with(vec![TransportResponse { text: Some("hi back".into()), tool_calls: vec![], usage: None }]);
        let definition = AgentDefinition::new("agent-1", "you are helpful", "m");
        let mut context = Context::new();
        let outcome = engine.interact("run-1", &definition, &mut context, "hello").await.unwrap();
        match outcome {
            InteractionOutcome::Done { final_text } => assert_eq!(final_text, "hi back"),
            _ => panic!("expected Done"),
        }
    }

    #[tokio::test]
    async fn input_guardrail_rejection_short_circuits_before_any_llm_call() {
        let engine = engine_with(vec![]).with_input_guardrails(
            GuardrailChain::new().with(Box::new(crate::cloudllm::guardrail::PredicateGuardrail::new(
                "no_secrets",
                |v: &str| if v.contains("password") { Some("contains a secret".into()) } else { None },
            ))),
        );
        let definition = AgentDefinition::new("agent-1", "sys", "m");
        let mut context = Context::new();
        let result = engine.interact("run-1", &definition, &mut context, "my password is hunter2").await;
        assert!(matches!(result, Err(EngineError::InputGuardrailReject { .. })));
    }

    #[tokio::test]
    async fn tool_call_requiring_confirmation_pauses_the_run() {
        struct Noop;
        #[async_trait]
        impl crate::cloudllm::tool_registry::ToolHandler for Noop {
            async fn execute(&self, _tool_name: &str, arguments: serde_json::Value) -> Result<serde_json::Value, DynError> {
                Ok(arguments)
            }
        }
        let mut registry = ToolRegistry::new(Box::new(Bm25Strategy::default()));
        registry
            .declare(
                crate::cloudllm::tool_registry::ToolDeclaration::new("delete_file", "", serde_json::json!({})).requires_confirmation(),
                Arc::new(Noop),
            )
            .unwrap();

        let transport = Arc::new(StubTransport::new(
            "m",
            vec![TransportResponse {
                text: None,
                tool_calls: vec![NativeToolCall { call_id: "c1".into(), tool_name: "delete_file".into(), arguments: serde_json::json!({}) }],
                usage: None,
            }],
        ));
        let engine = Engine::new(transport, Arc::new(registry), Box::new(TrimWindowPolicy::new(10_000)));
        let definition = AgentDefinition::new("agent-1", "sys", "m");
        let mut context = Context::new();
        let outcome = engine.interact("run-1", &definition, &mut context, "delete it").await.unwrap();
        match outcome {
            InteractionOutcome::Paused { snapshot } => assert_eq!(snapshot.pending_batch.len(), 1),
            _ => panic!("expected Paused"),
        }
    }

    #[tokio::test]
    async fn handoff_tool_call_ends_the_loop_with_a_handoff_outcome() {
        let transport = Arc::new(StubTransport::new(
            "m",
            vec![TransportResponse {
                text: None,
                tool_calls: vec![NativeToolCall {
                    call_id: "c1".into(),
                    tool_name: "handoff_to_billing_agent".into(),
                    arguments: serde_json::json!({}),
                }],
                usage: None,
            }],
        ));
        let registry = Arc::new(ToolRegistry::new(Box::new(Bm25Strategy::default())));
        let engine = Engine::new(transport, registry, Box::new(TrimWindowPolicy::new(10_000)));
        let definition = AgentDefinition::new("agent-1", "sys", "m");
        let mut context = Context::new();
        let outcome = engine.interact("run-1", &definition, &mut context, "I have a billing question").await.unwrap();
        match outcome {
            InteractionOutcome::Handoff { target_agent_id, .. } => assert_eq!(target_agent_id, "billing_agent"),
            _ => panic!("expected Handoff"),
        }
    }

    #[tokio::test]
    async fn max_turns_exceeded_surfaces_as_an_error() {
        // every response keeps requesting the same tool, forcing an infinite loop were it not budgeted
        let transport = Arc::new(StubTransport::new(
            "m",
            vec![TransportResponse {
                text: None,
                tool_calls: vec![NativeToolCall { call_id: "c1".into(), tool_name: "noop".into(), arguments: serde_json::json!({}) }],
                usage: None,
            }],
        ));
        struct Noop;
        #[async_trait]
        impl crate::cloudllm::tool_registry::ToolHandler for Noop {
            async fn execute(&self, _tool_name: &str, arguments: serde_json::Value) -> Result<serde_json::Value, DynError> {
                Ok(arguments)
            }
        }
        let mut registry = ToolRegistry::new(Box::new(Bm25Strategy::default()));
        registry
            .declare(crate::cloudllm::tool_registry::ToolDeclaration::new("noop", "", serde_json::json!({})), Arc::new(Noop))
            .unwrap();
        let engine = Engine::new(transport, Arc::new(registry), Box::new(TrimWindowPolicy::new(10_000)));
        let definition = AgentDefinition::new("agent-1", "sys", "m").with_max_turns(2);
        let mut context = Context::new();
        let result = engine.interact("run-1", &definition, &mut context, "go").await;
        assert!(matches!(result, Err(EngineError::MaxTurnsExceeded { .. })));
    }

    struct NoopCallbacks;
    impl StreamCallbacks for NoopCallbacks {}

    #[tokio::test]
    async fn interact_stream_falls_back_to_send_when_transport_has_no_streaming() {
        let engine = Arc::new(engine_with(vec![TransportResponse { text: Some("hi".into()), tool_calls: vec![], usage: None }]));
        let definition = AgentDefinition::new("agent-1", "sys", "m");
        let handle = engine.interact_stream("run-1".into(), definition, Context::new(), "hello".into(), Box::new(NoopCallbacks));
        match handle.join().await.unwrap() {
            InteractionOutcome::Done { final_text } => assert_eq!(final_text, "hi"),
            _ => panic!("expected Done"),
        }
    }

    #[tokio::test]
    async fn interact_stream_cancel_before_first_turn_surfaces_canceled() {
        let engine = Arc::new(engine_with(vec![TransportResponse { text: Some("hi".into()), tool_calls: vec![], usage: None }]));
        let definition = AgentDefinition::new("agent-1", "sys", "m");
        let handle = engine.interact_stream("run-1".into(), definition, Context::new(), "hello".into(), Box::new(NoopCallbacks));
        cancel(&handle);
        let result = handle.join().await;
        assert!(matches!(result, Err(EngineError::Canceled)));
    }

    struct StreamingStub {
        events: std::sync::Mutex<Option<Vec<StreamEvent>>>,
    }

    #[async_trait]
    impl LlmTransport for StreamingStub {
        async fn send(&self, _payload: &Payload) -> Result<TransportResponse, DynError> {
            Ok(TransportResponse::default())
        }

        async fn send_stream(&self, _payload: &Payload) -> Result<Option<crate::cloudllm::transport::StreamEventStream>, DynError> {
            let events = self.events.lock().unwrap().take().unwrap_or_default();
            Ok(Some(Box::pin(futures_util::stream::iter(events))))
        }

        fn model_name(&self) -> &str {
            "streaming-stub"
        }
    }

    struct ChunkRecorder(Arc<std::sync::Mutex<Vec<String>>>);
    impl StreamCallbacks for ChunkRecorder {
        fn on_text_delta(&mut self, chunk: &str) {
            self.0.lock().unwrap().push(chunk.to_string());
        }
    }

    #[tokio::test]
    async fn interact_stream_forwards_text_deltas_as_they_arrive() {
        let events = vec![
            StreamEvent::TextDelta("hel".into()),
            StreamEvent::TextDelta("lo".into()),
            StreamEvent::ResponseComplete { usage: None },
        ];
        let transport = Arc::new(StreamingStub { events: std::sync::Mutex::new(Some(events)) });
        let registry = Arc::new(ToolRegistry::new(Box::new(Bm25Strategy::default())));
        let engine = Arc::new(Engine::new(transport, registry, Box::new(TrimWindowPolicy::new(10_000))));
        let definition = AgentDefinition::new("agent-1", "sys", "m");
        let chunks = Arc::new(std::sync::Mutex::new(Vec::new()));
        let handle = engine.interact_stream("run-1".into(), definition, Context::new(), "hello".into(), Box::new(ChunkRecorder(chunks.clone())));
        match handle.join().await.unwrap() {
            InteractionOutcome::Done { final_text } => assert_eq!(final_text, "hello"),
            _ => panic!("expected Done"),
        }
        assert_eq!(*chunks.lock().unwrap(), vec!["hel".to_string(), "lo".to_string()]);
    }

    #[tokio::test]
    async fn interact_structured_parses_final_text_into_caller_type() {
        #[derive(serde::Deserialize, PartialEq, Debug)]
        struct Answer {
            value: i32,
        }
        let engine = engine_with(vec![TransportResponse { text: Some(r#"{"value": 42}"#.into()), tool_calls: vec![], usage: None }]);
        let definition = AgentDefinition::new("agent-1", "sys", "m");
        let mut context = Context::new();
        let schema = serde_json::json!({"type": "object", "properties": {"value": {"type": "integer"}}});
        let answer: Answer = engine.interact_structured("run-1", &definition, &mut context, "what is the answer", schema).await.unwrap();
        assert_eq!(answer, Answer { value: 42 });
    }

    #[tokio::test]
    async fn interact_structured_surfaces_parse_error_on_malformed_json() {
        #[derive(serde::Deserialize, Debug)]
        #[allow(dead_code)]
        struct Answer {
            value: i32,
        }
        let engine = engine_with(vec![TransportResponse { text: Some("not json".into()), tool_calls: vec![], usage: None }]);
        let definition = AgentDefinition::new("agent-1", "sys", "m");
        let mut context = Context::new();
        let result: Result<Answer, EngineError> =
            engine.interact_structured("run-1", &definition, &mut context, "q", serde_json::json!({})).await;
        assert!(matches!(result, Err(EngineError::StructuredParseError { .. })));
    }

    #[tokio::test]
    async fn interact_structured_retries_once_on_malformed_json_then_succeeds() {
        #[derive(serde::Deserialize, PartialEq, Debug)]
        struct Answer {
            value: i32,
        }
        let engine = engine_with(vec![
            TransportResponse { text: Some("not json".into()), tool_calls: vec![], usage: None },
            TransportResponse { text: Some(r#"{"value": 7}"#.into()), tool_calls: vec![], usage: None },
        ]);
        let definition = AgentDefinition::new("agent-1", "sys", "m");
        let mut context = Context::new();
        let schema = serde_json::json!({"type": "object", "properties": {"value": {"type": "integer"}}});
        let answer: Answer = engine.interact_structured("run-1", &definition, &mut context, "what is the answer", schema).await.unwrap();
        assert_eq!(answer, Answer { value: 7 });
    }

    #[tokio::test]
    async fn tool_batch_larger_than_configured_max_surfaces_as_an_error() {
        let transport = Arc::new(StubTransport::new(
            "m",
            vec![TransportResponse {
                text: None,
                tool_calls: vec![
                    NativeToolCall { call_id: "c1".into(), tool_name: "noop".into(), arguments: serde_json::json!({}) },
                    NativeToolCall { call_id: "c2".into(), tool_name: "noop".into(), arguments: serde_json::json!({}) },
                ],
                usage: None,
            }],
        ));
        let registry = Arc::new(ToolRegistry::new(Box::new(Bm25Strategy::default())));
        let mut engine = Engine::new(transport, registry, Box::new(TrimWindowPolicy::new(10_000)));
        engine = engine.with_config(RuntimeConfig { max_tool_calls_per_batch: 1, ..RuntimeConfig::default() });
        let definition = AgentDefinition::new("agent-1", "sys", "m");
        let mut context = Context::new();
        let result = engine.interact("run-1", &definition, &mut context, "go").await;
        assert!(matches!(result, Err(EngineError::ToolBatchTooLarge { requested: 2, max: 1 })));
    }

    #[tokio::test]
    async fn stream_idle_timeout_surfaces_as_llm_stream_timeout() {
        struct StallingStub;
        #[async_trait]
        impl LlmTransport for StallingStub {
            async fn send(&self, _payload: &Payload) -> Result<TransportResponse, DynError> {
                Ok(TransportResponse::default())
            }
            async fn send_stream(&self, _payload: &Payload) -> Result<Option<crate::cloudllm::transport::StreamEventStream>, DynError> {
                Ok(Some(Box::pin(futures_util::stream::pending())))
            }
            fn model_name(&self) -> &str {
                "stalling-stub"
            }
        }
        let transport = Arc::new(StallingStub);
        let registry = Arc::new(ToolRegistry::new(Box::new(Bm25Strategy::default())));
        let mut engine = Engine::new(transport, registry, Box::new(TrimWindowPolicy::new(10_000)));
        engine = engine.with_config(RuntimeConfig { max_stream_idle_time: Duration::from_millis(20), ..RuntimeConfig::default() });
        let definition = AgentDefinition::new("agent-1", "sys", "m");
        let engine = Arc::new(engine);
        let handle = engine.interact_stream("run-1".into(), definition, Context::new(), "hello".into(), Box::new(NoopCallbacks));
        let result = handle.join().await;
        assert!(matches!(result, Err(EngineError::LlmStreamTimeout)));
    }

    struct FlakyThenOkTransport {
        remaining_failures: std::sync::atomic::AtomicU32,
    }

    #[async_trait]
    impl LlmTransport for FlakyThenOkTransport {
        async fn send(&self, _payload: &Payload) -> Result<TransportResponse, DynError> {
            if self.remaining_failures.fetch_sub(1, Ordering::SeqCst) > 0 {
                return Err(Box::new(crate::cloudllm::transport::TransportError::retryable("temporarily unavailable")));
            }
            Ok(TransportResponse { text: Some("recovered".into()), tool_calls: vec![], usage: None })
        }
        fn model_name(&self) -> &str {
            "flaky-stub"
        }
    }

    #[tokio::test]
    async fn retryable_transport_failure_is_retried_until_it_succeeds() {
        let transport = Arc::new(FlakyThenOkTransport { remaining_failures: std::sync::atomic::AtomicU32::new(2) });
        let registry = Arc::new(ToolRegistry::new(Box::new(Bm25Strategy::default())));
        let mut engine = Engine::new(transport, registry, Box::new(TrimWindowPolicy::new(10_000)));
        engine = engine.with_config(RuntimeConfig { transport_retry_base_delay: Duration::from_millis(1), ..RuntimeConfig::default() });
        let definition = AgentDefinition::new("agent-1", "sys", "m");
        let mut context = Context::new();
        let outcome = engine.interact("run-1", &definition, &mut context, "hello").await.unwrap();
        match outcome {
            InteractionOutcome::Done { final_text } => assert_eq!(final_text, "recovered"),
            _ => panic!("expected Done"),
        }
    }

    struct PermanentFailureTransport;
    #[async_trait]
    impl LlmTransport for PermanentFailureTransport {
        async fn send(&self, _payload: &Payload) -> Result<TransportResponse, DynError> {
            Err(Box::new(crate::cloudllm::transport::TransportError::permanent("bad api key")))
        }
        fn model_name(&self) -> &str {
            "permanent-failure-stub"
        }
    }

    #[tokio::test]
    async fn non_retryable_transport_failure_surfaces_on_the_first_attempt() {
        let transport = Arc::new(PermanentFailureTransport);
        let registry = Arc::new(ToolRegistry::new(Box::new(Bm25Strategy::default())));
        let engine = Engine::new(transport, registry, Box::new(TrimWindowPolicy::new(10_000)));
        let definition = AgentDefinition::new("agent-1", "sys", "m");
        let mut context = Context::new();
        let result = engine.interact("run-1", &definition, &mut context, "hello").await;
        assert!(matches!(result, Err(EngineError::LlmTransportError { retryable: false, .. })));
    }

    #[tokio::test]
    async fn sub_agent_tool_call_dispatches_a_nested_run_and_returns_its_final_text() {
        let sub_definition = Arc::new(AgentDefinition::new("db-agent", "you run queries", "m"));

        let parent_transport = Arc::new(StubTransport::new(
            "m",
            vec![
                TransportResponse {
                    text: None,
                    tool_calls: vec![NativeToolCall {
                        call_id: "c1".into(),
                        tool_name: "invoke_db_agent".into(),
                        arguments: serde_json::json!({"input": "how many rows?"}),
                    }],
                    usage: None,
                },
                TransportResponse { text: Some("the db agent says 42 rows affected".into()), tool_calls: vec![], usage: None },
            ],
        ));
        let parent_registry = Arc::new(ToolRegistry::new(Box::new(Bm25Strategy::default())));
        let parent_engine = Engine::new(parent_transport, parent_registry, Box::new(TrimWindowPolicy::new(10_000)));

        let parent_definition = AgentDefinition::new("orchestrator", "you delegate to db-agent", "m")
            .with_sub_agents(vec![SubAgentDeclaration::new(sub_definition)]);
        let mut context = Context::new();
        let outcome = parent_engine.interact("run-1", &parent_definition, &mut context, "ask the db agent").await.unwrap();
        match outcome {
            InteractionOutcome::Done { final_text } => assert_eq!(final_text, "the db agent says 42 rows affected"),
            _ => panic!("expected Done"),
        }
    }

    #[tokio::test]
    async fn sub_agent_invocation_past_max_depth_surfaces_as_a_hard_error() {
        let transport = Arc::new(StubTransport::new(
            "m",
            vec![TransportResponse {
                text: None,
                tool_calls: vec![NativeToolCall {
                    call_id: "c1".into(),
                    tool_name: "invoke_helper".into(),
                    arguments: serde_json::json!({"input": "keep going"}),
                }],
                usage: None,
            }],
        ));
        let registry = Arc::new(ToolRegistry::new(Box::new(Bm25Strategy::default())));
        let mut engine = Engine::new(transport, registry, Box::new(TrimWindowPolicy::new(10_000)));
        engine = engine.with_config(RuntimeConfig { max_sub_agent_depth: 0, ..RuntimeConfig::default() });
        let helper_definition = Arc::new(AgentDefinition::new("helper", "you assist", "m"));
        let definition =
            AgentDefinition::new("orchestrator", "you delegate", "m").with_sub_agents(vec![SubAgentDeclaration::new(helper_definition)]);
        let mut context = Context::new();
        let result = engine.interact("run-1", &definition, &mut context, "go").await;
        assert!(matches!(result, Err(EngineError::SubAgentDepthExceeded { depth: 1 })));
    }

    /// Dispatches to a different scripted transport depending on whether the
    /// payload targets the critic model, so one engine instance can exercise
    /// a producer/critic exchange with each side fully scripted.
    struct ProducerAndCriticStub {
        producer: StubTransport,
        critic_replies: std::sync::Mutex<Vec<&'static str>>,
    }

    #[async_trait]
    impl LlmTransport for ProducerAndCriticStub {
        async fn send(&self, payload: &Payload) -> Result<TransportResponse, DynError> {
            if payload.model_id == "critic-model" {
                let mut replies = self.critic_replies.lock().unwrap();
                let text = if replies.len() > 1 { replies.remove(0) } else { *replies.last().unwrap() };
                Ok(TransportResponse { text: Some(text.into()), tool_calls: vec![], usage: None })
            } else {
                self.producer.send(payload).await
            }
        }
        fn model_name(&self) -> &str {
            "producer-and-critic-stub"
        }
    }

    #[tokio::test]
    async fn critic_rejects_once_then_accepts_the_revised_answer() {
        let transport = Arc::new(ProducerAndCriticStub {
            producer: StubTransport::new(
                "m",
                vec![
                    TransportResponse { text: Some("rough draft".into()), tool_calls: vec![], usage: None },
                    TransportResponse { text: Some("polished answer".into()), tool_calls: vec![], usage: None },
                ],
            ),
            critic_replies: std::sync::Mutex::new(vec!["REJECT: too terse", "looks good"]),
        });
        let registry = Arc::new(ToolRegistry::new(Box::new(Bm25Strategy::default())));
        let engine = Engine::new(transport, registry, Box::new(TrimWindowPolicy::new(10_000)));
        let definition =
            AgentDefinition::new("agent-1", "sys", "m").with_critic(CriticDeclaration::new("you are a critic", "critic-model"));
        let mut context = Context::new();
        let outcome = engine.interact("run-1", &definition, &mut context, "draft something").await.unwrap();
        match outcome {
            InteractionOutcome::Done { final_text } => assert_eq!(final_text, "polished answer"),
            _ => panic!("expected Done"),
        }
    }

    #[tokio::test]
    async fn critic_accepts_the_first_draft_without_a_retry() {
        let transport = Arc::new(ProducerAndCriticStub {
            producer: StubTransport::with_text_reply("first try"),
            critic_replies: std::sync::Mutex::new(vec!["looks good"]),
        });
        let registry = Arc::new(ToolRegistry::new(Box::new(Bm25Strategy::default())));
        let engine = Engine::new(transport, registry, Box::new(TrimWindowPolicy::new(10_000)));
        let definition =
            AgentDefinition::new("agent-1", "sys", "m").with_critic(CriticDeclaration::new("you are a critic", "critic-model"));
        let mut context = Context::new();
        let outcome = engine.interact("run-1", &definition, &mut context, "draft something").await.unwrap();
        match outcome {
            InteractionOutcome::Done { final_text } => assert_eq!(final_text, "first try"),
            _ => panic!("expected Done"),
        }
    }
}
