use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Constitution,
    Plan,
    Execute,
    Synthesize,
}

impl Phase {
    pub const ALL: [Phase; 4] = [Phase::Constitution, Phase::Plan, Phase::Execute, Phase::Synthesize];

    pub fn next(self) -> Option<Phase> {
        match self {
            Self::Constitution => Some(Self::Plan),
            Self::Plan => Some(Self::Execute),
            Self::Execute => Some(Self::Synthesize),
            Self::Synthesize => None,
        }
    }

    pub fn ordinal(self) -> usize {
        match self {
            Self::Constitution => 1,
            Self::Plan => 2,
            Self::Execute => 3,
            Self::Synthesize => 4,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Self::Constitution => "constitution",
            Self::Plan => "plan",
            Self::Execute => "execute",
            Self::Synthesize => "synthesize",
        }
    }

    /// Only the methodology phase is optional.
    pub fn is_optional(self) -> bool {
        matches!(self, Self::Constitution)
    }

    /// Phases earlier than `self`, in workflow order.
    pub fn predecessors(self) -> impl Iterator<Item = Phase> {
        Self::ALL.into_iter().filter(move |phase| *phase < self)
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

impl std::str::FromStr for Phase {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "constitution" => Ok(Self::Constitution),
            "plan" => Ok(Self::Plan),
            "execute" => Ok(Self::Execute),
            "synthesize" => Ok(Self::Synthesize),
            other => Err(format!(
                "unknown phase `{other}` (expected constitution|plan|execute|synthesize)"
            )),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum PhaseEvent {
    Approved,
    Edited,
    Skipped,
    Failed { reason: String },
    Aborted,
    RetryRequested,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PhaseCompletion {
    Approved,
    Edited,
    Skipped,
}

impl PhaseCompletion {
    pub fn produced_artifact(self) -> bool {
        matches!(self, Self::Approved | Self::Edited)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum WorkflowStatus {
    InProgress { next: Phase },
    Completed,
    /// A mandatory phase was skipped; later phases cannot run.
    Incomplete { blocked_at: Phase },
    Failed { phase: Phase, reason: String },
    Aborted { phase: Phase },
}

impl WorkflowStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::InProgress { .. })
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::InProgress { .. } => "in_progress",
            Self::Completed => "completed",
            Self::Incomplete { .. } => "incomplete",
            Self::Failed { .. } => "failed",
            Self::Aborted { .. } => "aborted",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransitionOutcome {
    pub phase: Phase,
    pub event: PhaseEvent,
    pub from: WorkflowStatus,
    pub to: WorkflowStatus,
}

/// Run-level record of where the workflow stands and how each phase ended.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkflowProgress {
    status: WorkflowStatus,
    completions: BTreeMap<Phase, PhaseCompletion>,
}

impl WorkflowProgress {
    pub fn new(status: WorkflowStatus) -> Self {
        Self { status, completions: BTreeMap::new() }
    }

    pub fn status(&self) -> &WorkflowStatus {
        &self.status
    }

    pub fn current_phase(&self) -> Option<Phase> {
        match self.status {
            WorkflowStatus::InProgress { next } => Some(next),
            _ => None,
        }
    }

    pub fn completion(&self, phase: Phase) -> Option<PhaseCompletion> {
        self.completions.get(&phase).copied()
    }

    pub fn completions(&self) -> impl Iterator<Item = (Phase, PhaseCompletion)> + '_ {
        self.completions.iter().map(|(phase, completion)| (*phase, *completion))
    }

    pub(crate) fn record(&mut self, outcome: &TransitionOutcome) {
        let completion = match outcome.event {
            PhaseEvent::Approved => Some(PhaseCompletion::Approved),
            PhaseEvent::Edited => Some(PhaseCompletion::Edited),
            PhaseEvent::Skipped => Some(PhaseCompletion::Skipped),
            PhaseEvent::RetryRequested => {
                self.completions.remove(&outcome.phase);
                None
            }
            PhaseEvent::Failed { .. } | PhaseEvent::Aborted => None,
        };
        if let Some(completion) = completion {
            self.completions.insert(outcome.phase, completion);
        }
        self.status = outcome.to.clone();
    }
}
