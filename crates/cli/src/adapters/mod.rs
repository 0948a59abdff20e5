//! Host-side implementations of the agent's seams: filesystem storage,
//! git checkpoints, HTTP research tools and the interactive terminal.

pub mod git;
pub mod research_tools;
pub mod terminal;
pub mod workspace;
