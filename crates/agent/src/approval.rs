use async_trait::async_trait;
use researchkit_core::{Artifact, ArtifactOrigin, Conversation, Phase};
use thiserror::Error;
use tracing::{debug, info};

use crate::conversation::{ConversationEngine, EngineError, ToolMode};

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ReviewDecision {
    Approve,
    /// Replacement text supplied directly by the human.
    Edit(String),
    Feedback(String),
    Skip,
}

impl ReviewDecision {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Approve => "approve",
            Self::Edit(_) => "edit",
            Self::Feedback(_) => "feedback",
            Self::Skip => "skip",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReviewRequest {
    pub phase: Phase,
    pub candidate: String,
    /// Number of feedback-driven regenerations so far.
    pub revision: u32,
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ReviewError {
    #[error("review interrupted by user")]
    Interrupted,
    #[error("reviewer input failed: {0}")]
    Io(String),
}

#[async_trait]
pub trait Reviewer: Send + Sync {
    async fn review(&self, request: ReviewRequest) -> Result<ReviewDecision, ReviewError>;

    /// Asked after a phase fails; `true` reruns the phase.
    async fn confirm_retry(&self, _phase: Phase, _reason: &str) -> Result<bool, ReviewError> {
        Ok(false)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ApprovalState {
    Generated { candidate: String, revision: u32 },
    Regenerating { feedback: String, previous: String, revision: u32 },
    Approved { body: String, revision: u32 },
    Edited { body: String, revision: u32 },
    Skipped { revision: u32 },
}

impl ApprovalState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Approved { .. } | Self::Edited { .. } | Self::Skipped { .. })
    }

    pub fn revision(&self) -> u32 {
        match self {
            Self::Generated { revision, .. }
            | Self::Regenerating { revision, .. }
            | Self::Approved { revision, .. }
            | Self::Edited { revision, .. }
            | Self::Skipped { revision } => *revision,
        }
    }
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ApprovalTransitionError {
    #[error("decision `{decision}` is not valid in state {state:?}")]
    InvalidDecision { state: ApprovalState, decision: &'static str },
    #[error("a regenerated candidate is only accepted while regenerating, not in {state:?}")]
    UnexpectedCandidate { state: ApprovalState },
}

/// Pure transition rules of the approval cycle.
pub struct ApprovalCycle;

impl ApprovalCycle {
    pub fn start(candidate: impl Into<String>) -> ApprovalState {
        ApprovalState::Generated { candidate: candidate.into(), revision: 0 }
    }

    /// Blank feedback or blank edits leave the candidate on the table.
    pub fn apply(
        state: ApprovalState,
        decision: ReviewDecision,
    ) -> Result<ApprovalState, ApprovalTransitionError> {
        let ApprovalState::Generated { candidate, revision } = state else {
            return Err(ApprovalTransitionError::InvalidDecision {
                state,
                decision: decision.label(),
            });
        };

        let next = match decision {
            ReviewDecision::Approve => ApprovalState::Approved { body: candidate, revision },
            ReviewDecision::Edit(body) if body.trim().is_empty() => {
                ApprovalState::Generated { candidate, revision }
            }
            ReviewDecision::Edit(body) => ApprovalState::Edited { body, revision },
            ReviewDecision::Feedback(feedback) if feedback.trim().is_empty() => {
                ApprovalState::Generated { candidate, revision }
            }
            ReviewDecision::Feedback(feedback) => {
                ApprovalState::Regenerating { feedback, previous: candidate, revision }
            }
            ReviewDecision::Skip => ApprovalState::Skipped { revision },
        };
        Ok(next)
    }

    pub fn regenerated(
        state: ApprovalState,
        candidate: impl Into<String>,
    ) -> Result<ApprovalState, ApprovalTransitionError> {
        match state {
            ApprovalState::Regenerating { revision, .. } => {
                Ok(ApprovalState::Generated { candidate: candidate.into(), revision: revision + 1 })
            }
            other => Err(ApprovalTransitionError::UnexpectedCandidate { state: other }),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ApprovalOutcome {
    Accepted(Artifact),
    Skipped { revisions: u32 },
}

#[derive(Debug, Error)]
pub enum ApprovalError {
    #[error("regeneration failed after {revision} revisions: {source}")]
    Engine {
        #[source]
        source: EngineError,
        last_candidate: String,
        revision: u32,
    },
    #[error("review failed: {source}")]
    Review {
        #[source]
        source: ReviewError,
        last_candidate: String,
    },
    #[error(transparent)]
    Transition(#[from] ApprovalTransitionError),
}

impl ApprovalError {
    pub fn is_interrupt(&self) -> bool {
        matches!(
            self,
            Self::Engine { source: EngineError::Interrupted, .. }
                | Self::Review { source: ReviewError::Interrupted, .. }
        )
    }

    pub fn last_candidate(&self) -> Option<&str> {
        match self {
            Self::Engine { last_candidate, .. } | Self::Review { last_candidate, .. } => {
                Some(last_candidate)
            }
            Self::Transition(_) => None,
        }
    }
}

/// Drives one artifact through review until it reaches a terminal state.
pub struct ApprovalController<'a> {
    engine: &'a ConversationEngine,
    reviewer: &'a dyn Reviewer,
}

impl<'a> ApprovalController<'a> {
    pub fn new(engine: &'a ConversationEngine, reviewer: &'a dyn Reviewer) -> Self {
        Self { engine, reviewer }
    }

    /// Feedback is appended to `conversation` as a user message and the
    /// engine re-invoked; repeated identical feedback regenerates each time.
    pub async fn run(
        &self,
        phase: Phase,
        conversation: &mut Conversation,
        candidate: String,
        mode: ToolMode,
    ) -> Result<ApprovalOutcome, ApprovalError> {
        let mut state = ApprovalCycle::start(candidate);

        loop {
            state = match state {
                ApprovalState::Generated { ref candidate, revision } => {
                    let request = ReviewRequest { phase, candidate: candidate.clone(), revision };
                    let decision = self
                        .engine
                        .abort_signal()
                        .guard(self.reviewer.review(request))
                        .await
                        .unwrap_or(Err(ReviewError::Interrupted))
                        .map_err(|source| ApprovalError::Review {
                            source,
                            last_candidate: candidate.clone(),
                        })?;
                    info!(
                        event_name = "approval.decision",
                        phase = %phase,
                        revision,
                        decision = decision.label(),
                        "review decision received"
                    );
                    ApprovalCycle::apply(state, decision)?
                }
                ApprovalState::Regenerating { ref feedback, ref previous, revision } => {
                    debug!(event_name = "approval.regenerating", phase = %phase, revision, "regenerating");
                    let reply = self
                        .engine
                        .respond(conversation, feedback, mode)
                        .await
                        .map_err(|source| ApprovalError::Engine {
                            source,
                            last_candidate: previous.clone(),
                            revision,
                        })?;
                    ApprovalCycle::regenerated(state, reply.text)?
                }
                ApprovalState::Approved { body, revision } => {
                    return Ok(ApprovalOutcome::Accepted(Artifact::new(
                        phase,
                        body,
                        ArtifactOrigin::Generated,
                        revision,
                    )));
                }
                ApprovalState::Edited { body, revision } => {
                    return Ok(ApprovalOutcome::Accepted(Artifact::new(
                        phase,
                        body,
                        ArtifactOrigin::Edited,
                        revision,
                    )));
                }
                ApprovalState::Skipped { revision } => {
                    return Ok(ApprovalOutcome::Skipped { revisions: revision });
                }
            };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{ApprovalCycle, ApprovalState, ApprovalTransitionError, ReviewDecision};

    #[test]
    fn approve_keeps_generated_candidate() {
        let state = ApprovalCycle::apply(ApprovalCycle::start("draft"), ReviewDecision::Approve)
            .expect("approve");
        assert_eq!(state, ApprovalState::Approved { body: "draft".to_string(), revision: 0 });
        assert!(state.is_terminal());
    }

    #[test]
    fn feedback_then_regeneration_bumps_revision() {
        let state = ApprovalCycle::apply(
            ApprovalCycle::start("draft"),
            ReviewDecision::Feedback("shorter".to_string()),
        )
        .expect("feedback");
        assert!(matches!(state, ApprovalState::Regenerating { ref feedback, .. } if feedback == "shorter"));

        let state = ApprovalCycle::regenerated(state, "draft v2").expect("regenerated");
        assert_eq!(state, ApprovalState::Generated { candidate: "draft v2".to_string(), revision: 1 });
    }

    #[test]
    fn blank_feedback_and_blank_edit_re_present_candidate() {
        let start = ApprovalCycle::start("draft");
        let after_feedback =
            ApprovalCycle::apply(start.clone(), ReviewDecision::Feedback("   ".to_string()))
                .expect("blank feedback");
        let after_edit =
            ApprovalCycle::apply(start.clone(), ReviewDecision::Edit("\n".to_string())).expect("blank edit");

        assert_eq!(after_feedback, start);
        assert_eq!(after_edit, start);
    }

    #[test]
    fn edit_is_terminal_and_replaces_text() {
        let state = ApprovalCycle::apply(
            ApprovalCycle::start("draft"),
            ReviewDecision::Edit("my own text".to_string()),
        )
        .expect("edit");
        assert_eq!(state, ApprovalState::Edited { body: "my own text".to_string(), revision: 0 });

        let error = ApprovalCycle::apply(state, ReviewDecision::Approve).expect_err("terminal");
        assert!(matches!(error, ApprovalTransitionError::InvalidDecision { decision: "approve", .. }));
    }

    #[test]
    fn skip_is_terminal() {
        let state =
            ApprovalCycle::apply(ApprovalCycle::start("draft"), ReviewDecision::Skip).expect("skip");
        assert_eq!(state, ApprovalState::Skipped { revision: 0 });
        assert!(ApprovalCycle::regenerated(state, "late").is_err());
    }
}
