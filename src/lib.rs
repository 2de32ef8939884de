// src/lib.rs

// Import the top-level `cloudllm` module.
pub mod cloudllm;

// Re-exporting key items for easier external access at the crate root.
pub use cloudllm::context::{Context, Message};
pub use cloudllm::engine::{cancel, AgentDefinition, CriticDeclaration, Engine, InteractionOutcome, StreamHandle, SubAgentDeclaration};
pub use cloudllm::error::{DynError, EngineError};
