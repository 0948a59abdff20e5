pub mod audit;
pub mod config;
pub mod domain;
pub mod errors;
pub mod flows;

pub use domain::artifact::{Artifact, ArtifactOrigin, RunId};
pub use domain::conversation::{
    Conversation, ConversationError, Message, Role, ToolCall, ToolDefinition, ToolResult,
};
pub use errors::{ApplicationError, DomainError, InterfaceError};
pub use flows::{
    FlowEngine, FlowTransitionError, Phase, PhaseCompletion, PhaseEvent, ResearchFlow,
    WorkflowProgress, WorkflowStatus,
};
