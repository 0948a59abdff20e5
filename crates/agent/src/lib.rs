//! Research Agent - model-driven phase execution
//!
//! This crate holds everything between the pure domain in `researchkit-core`
//! and the terminal front end:
//! - Talks to a locally hosted model over the Ollama chat protocol (`llm`)
//! - Runs the tool-augmented conversation loop (`conversation`)
//! - Validates model-requested tool arguments before dispatch (`guardrails`)
//! - Drives the human approval/feedback cycle (`approval`)
//! - Sequences the four research phases (`workflow`)
//!
//! # Architecture
//!
//! One phase is one fresh conversation:
//! 1. **Prompt** (`prompts`) - render the phase system prompt from earlier artifacts
//! 2. **Generate** (`conversation`) - model calls interleaved with tool dispatches
//! 3. **Review** (`approval`) - approve, edit, give feedback or skip
//! 4. **Persist** (`workflow`) - store, checkpoint, advance the flow
//!
//! # Key Types
//!
//! - `ConversationEngine` - bounded tool loop over an `LlmClient`
//! - `ToolRegistry` - the closed set of research tools
//! - `PhaseOrchestrator` - the workflow driver
//!
//! The model only proposes text and tool calls. Which phase runs next and
//! what gets persisted is decided by the flow state machine and the human.

pub mod approval;
pub mod conversation;
pub mod guardrails;
pub mod interrupt;
pub mod llm;
pub mod prompts;
pub mod telemetry;
pub mod tools;
pub mod workflow;

pub use approval::{ApprovalController, ApprovalOutcome, ReviewDecision, ReviewRequest, Reviewer};
pub use conversation::{ConversationEngine, EngineError, EngineReply, ToolMode, TurnObserver};
pub use interrupt::AbortSignal;
pub use llm::{LlmClient, ModelError, ModelTurn, OllamaClient};
pub use tools::{ResearchTool, SourceEntry, SourceLog, ToolFailure, ToolKind, ToolRegistry};
pub use workflow::{
    ArtifactStore, Checkpointer, FailureKind, PhaseOrchestrator, PhaseReport, PhaseStatus, ResearchSession,
    WorkflowReport,
};
