// src/cloudllm/mod.rs

pub mod config;
pub mod context;
pub mod engine;
pub mod error;
pub mod guardrail;
pub mod memory;
pub mod snapshot;
pub mod stream_parser;
pub mod telemetry;
pub mod thought_chain;
pub mod tool_executor;
pub mod tool_registry;
pub mod transport;

// Let's explicitly export Engine so we don't have to access it via
// cloudllm::engine::Engine and instead as cloudllm::Engine
pub use engine::{cancel, AgentDefinition, Engine, InteractionOutcome, StreamHandle};
