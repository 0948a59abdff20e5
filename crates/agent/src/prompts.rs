//! Phase prompt rendering.
//!
//! System prompts are tera templates compiled into the binary; the context of
//! a phase (topic, earlier artifacts, bibliography) is rendered into them. The
//! seed user message of each phase is plain text.

use researchkit_core::Phase;
use serde::Serialize;
use tera::{Context, Tera};
use thiserror::Error;

/// Outline used for the plan when the workspace carries no template of its own.
pub const DEFAULT_PLAN_OUTLINE: &str = include_str!("../templates/prompts/plan-outline.md");

#[derive(Debug, Error)]
pub enum PromptError {
    #[error("prompt template `{name}` failed: {message}")]
    Template { name: &'static str, message: String },
}

/// Everything a phase prompt may refer to. Empty strings mean "not available".
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct PhaseContext {
    pub topic: String,
    pub constitution: String,
    pub plan_template: String,
    pub plan: String,
    pub findings: String,
    pub sources: String,
}

impl PhaseContext {
    pub fn for_topic(topic: impl Into<String>) -> Self {
        Self { topic: topic.into(), ..Self::default() }
    }

    /// Field holding the accepted artifact of `phase`; synthesis has none
    /// because no later phase reads it.
    pub fn slot_mut(&mut self, phase: Phase) -> Option<&mut String> {
        match phase {
            Phase::Constitution => Some(&mut self.constitution),
            Phase::Plan => Some(&mut self.plan),
            Phase::Execute => Some(&mut self.findings),
            Phase::Synthesize => None,
        }
    }
}

pub struct PromptLibrary {
    tera: Tera,
}

impl PromptLibrary {
    pub fn new() -> Result<Self, PromptError> {
        let mut tera = Tera::default();
        for phase in Phase::ALL {
            let name = template_name(phase);
            tera.add_raw_template(name, template_body(phase)).map_err(|error| PromptError::Template {
                name,
                message: error.to_string(),
            })?;
        }
        Ok(Self { tera })
    }

    pub fn system_prompt(&self, phase: Phase, context: &PhaseContext) -> Result<String, PromptError> {
        let name = template_name(phase);
        let mut rendering = context.clone();
        if rendering.plan_template.trim().is_empty() {
            rendering.plan_template = DEFAULT_PLAN_OUTLINE.to_string();
        }
        let tera_context = Context::from_serialize(&rendering)
            .map_err(|error| PromptError::Template { name, message: error.to_string() })?;
        self.tera
            .render(name, &tera_context)
            .map_err(|error| PromptError::Template { name, message: error.to_string() })
    }

    pub fn seed_request(&self, phase: Phase, context: &PhaseContext) -> String {
        match phase {
            Phase::Constitution if context.constitution.trim().is_empty() => {
                "Help me create a research constitution for this project. Reply with the complete constitution."
                    .to_string()
            }
            Phase::Constitution => {
                "Help me refine the research constitution for this project. Reply with the complete revised constitution."
                    .to_string()
            }
            Phase::Plan => format!(
                "Research topic: {}\n\nCreate a comprehensive research plan for investigating this topic.",
                context.topic
            ),
            Phase::Execute => "Begin executing the research plan. Use the available tools to gather \
                               information for each objective and present the findings with clear citations."
                .to_string(),
            Phase::Synthesize => {
                "Synthesize all research findings into a comprehensive final report.".to_string()
            }
        }
    }
}

fn template_name(phase: Phase) -> &'static str {
    match phase {
        Phase::Constitution => "constitution.md.tera",
        Phase::Plan => "plan.md.tera",
        Phase::Execute => "execute.md.tera",
        Phase::Synthesize => "synthesize.md.tera",
    }
}

fn template_body(phase: Phase) -> &'static str {
    match phase {
        Phase::Constitution => include_str!("../templates/prompts/constitution.md.tera"),
        Phase::Plan => include_str!("../templates/prompts/plan.md.tera"),
        Phase::Execute => include_str!("../templates/prompts/execute.md.tera"),
        Phase::Synthesize => include_str!("../templates/prompts/synthesize.md.tera"),
    }
}
