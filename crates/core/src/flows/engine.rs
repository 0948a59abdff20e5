use thiserror::Error;

use crate::audit::{AuditCategory, AuditContext, AuditEvent, AuditOutcome, AuditSink};
use crate::flows::states::{Phase, PhaseEvent, TransitionOutcome, WorkflowProgress, WorkflowStatus};

pub trait FlowDefinition {
    fn initial_status(&self) -> WorkflowStatus;
    fn transition(
        &self,
        current: &WorkflowStatus,
        phase: Phase,
        event: &PhaseEvent,
    ) -> Result<TransitionOutcome, FlowTransitionError>;
}

/// Constitution, Plan, Execute, Synthesize in strict order.
#[derive(Clone, Debug, Default)]
pub struct ResearchFlow;

impl FlowDefinition for ResearchFlow {
    fn initial_status(&self) -> WorkflowStatus {
        WorkflowStatus::InProgress { next: Phase::Constitution }
    }

    fn transition(
        &self,
        current: &WorkflowStatus,
        phase: Phase,
        event: &PhaseEvent,
    ) -> Result<TransitionOutcome, FlowTransitionError> {
        transition_research(current, phase, event)
    }
}

pub struct FlowEngine<F> {
    flow: F,
}

impl<F> FlowEngine<F>
where
    F: FlowDefinition,
{
    pub fn new(flow: F) -> Self {
        Self { flow }
    }

    pub fn start(&self) -> WorkflowProgress {
        WorkflowProgress::new(self.flow.initial_status())
    }

    /// Applies `event` for `phase` and records the phase completion on success.
    /// A rejected event leaves `progress` untouched.
    pub fn apply(
        &self,
        progress: &mut WorkflowProgress,
        phase: Phase,
        event: &PhaseEvent,
    ) -> Result<TransitionOutcome, FlowTransitionError> {
        let outcome = self.flow.transition(progress.status(), phase, event)?;
        progress.record(&outcome);
        Ok(outcome)
    }

    pub fn apply_with_audit<S>(
        &self,
        progress: &mut WorkflowProgress,
        phase: Phase,
        event: &PhaseEvent,
        sink: &S,
        audit: &AuditContext,
    ) -> Result<TransitionOutcome, FlowTransitionError>
    where
        S: AuditSink + ?Sized,
    {
        let result = self.apply(progress, phase, event);
        match &result {
            Ok(outcome) => {
                sink.emit(
                    AuditEvent::from_context(
                        audit,
                        "flow.transition_applied",
                        AuditCategory::Flow,
                        AuditOutcome::Success,
                    )
                    .with_phase(phase)
                    .with_metadata("from", outcome.from.label())
                    .with_metadata("to", outcome.to.label())
                    .with_metadata("event", format!("{:?}", outcome.event)),
                );
            }
            Err(error) => {
                sink.emit(
                    AuditEvent::from_context(
                        audit,
                        "flow.transition_rejected",
                        AuditCategory::Flow,
                        AuditOutcome::Rejected,
                    )
                    .with_phase(phase)
                    .with_metadata("error", error.to_string()),
                );
            }
        }
        result
    }
}

impl Default for FlowEngine<ResearchFlow> {
    fn default() -> Self {
        Self::new(ResearchFlow)
    }
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum FlowTransitionError {
    #[error("phase {phase} cannot run while workflow is {status:?}")]
    PhaseOutOfOrder { phase: Phase, status: WorkflowStatus },
    #[error("invalid event {event:?} for phase {phase} while workflow is {status:?}")]
    InvalidTransition { phase: Phase, event: PhaseEvent, status: WorkflowStatus },
}

fn transition_research(
    current: &WorkflowStatus,
    phase: Phase,
    event: &PhaseEvent,
) -> Result<TransitionOutcome, FlowTransitionError> {
    use PhaseEvent::{Aborted, Approved, Edited, Failed, RetryRequested, Skipped};

    let to = match (current, event) {
        (WorkflowStatus::InProgress { next }, _) if *next != phase => {
            return Err(FlowTransitionError::PhaseOutOfOrder { phase, status: current.clone() });
        }
        (WorkflowStatus::InProgress { .. }, Approved | Edited) => match phase.next() {
            Some(next) => WorkflowStatus::InProgress { next },
            None => WorkflowStatus::Completed,
        },
        (WorkflowStatus::InProgress { .. }, Skipped) => {
            if phase.is_optional() {
                match phase.next() {
                    Some(next) => WorkflowStatus::InProgress { next },
                    None => WorkflowStatus::Completed,
                }
            } else {
                WorkflowStatus::Incomplete { blocked_at: phase }
            }
        }
        (WorkflowStatus::InProgress { .. }, Failed { reason }) => {
            WorkflowStatus::Failed { phase, reason: reason.clone() }
        }
        (WorkflowStatus::InProgress { .. }, Aborted) => WorkflowStatus::Aborted { phase },
        (WorkflowStatus::Failed { phase: stopped, .. }, RetryRequested)
        | (WorkflowStatus::Aborted { phase: stopped }, RetryRequested)
        | (WorkflowStatus::Incomplete { blocked_at: stopped }, RetryRequested)
            if *stopped == phase =>
        {
            WorkflowStatus::InProgress { next: phase }
        }
        _ => {
            return Err(FlowTransitionError::InvalidTransition {
                phase,
                event: event.clone(),
                status: current.clone(),
            });
        }
    };

    Ok(TransitionOutcome { phase, event: event.clone(), from: current.clone(), to })
}

#[cfg(test)]
mod tests {
    use crate::audit::{AuditContext, AuditOutcome, InMemoryAuditSink};
    use crate::flows::engine::{FlowEngine, FlowTransitionError, ResearchFlow};
    use crate::flows::states::{Phase, PhaseCompletion, PhaseEvent, WorkflowStatus};

    #[test]
    fn approving_every_phase_completes_the_workflow() {
        let engine = FlowEngine::new(ResearchFlow);
        let mut progress = engine.start();

        for phase in Phase::ALL {
            assert_eq!(progress.current_phase(), Some(phase));
            engine.apply(&mut progress, phase, &PhaseEvent::Approved).expect("approve");
        }

        assert_eq!(progress.status(), &WorkflowStatus::Completed);
        assert_eq!(progress.completions().count(), 4);
    }

    #[test]
    fn skipped_constitution_still_advances_to_plan() {
        let engine = FlowEngine::new(ResearchFlow);
        let mut progress = engine.start();

        let outcome = engine
            .apply(&mut progress, Phase::Constitution, &PhaseEvent::Skipped)
            .expect("constitution may be skipped");

        assert_eq!(outcome.to, WorkflowStatus::InProgress { next: Phase::Plan });
        assert_eq!(progress.completion(Phase::Constitution), Some(PhaseCompletion::Skipped));
    }

    #[test]
    fn skipped_plan_blocks_later_phases() {
        let engine = FlowEngine::new(ResearchFlow);
        let mut progress = engine.start();
        engine.apply(&mut progress, Phase::Constitution, &PhaseEvent::Edited).expect("edit");

        engine.apply(&mut progress, Phase::Plan, &PhaseEvent::Skipped).expect("skip plan");
        assert_eq!(progress.status(), &WorkflowStatus::Incomplete { blocked_at: Phase::Plan });

        let error = engine
            .apply(&mut progress, Phase::Execute, &PhaseEvent::Approved)
            .expect_err("execute must not run after a skipped plan");
        assert!(matches!(error, FlowTransitionError::InvalidTransition { .. }));
        assert!(progress.completion(Phase::Execute).is_none());
    }

    #[test]
    fn out_of_order_phase_is_rejected_without_mutation() {
        let engine = FlowEngine::new(ResearchFlow);
        let mut progress = engine.start();

        let error = engine
            .apply(&mut progress, Phase::Synthesize, &PhaseEvent::Approved)
            .expect_err("synthesize cannot run first");

        assert!(matches!(error, FlowTransitionError::PhaseOutOfOrder { .. }));
        assert_eq!(progress.current_phase(), Some(Phase::Constitution));
    }

    #[test]
    fn failed_phase_can_be_retried() {
        let engine = FlowEngine::new(ResearchFlow);
        let mut progress = engine.start();
        engine.apply(&mut progress, Phase::Constitution, &PhaseEvent::Skipped).expect("skip");
        engine
            .apply(
                &mut progress,
                Phase::Plan,
                &PhaseEvent::Failed { reason: "model unavailable".to_owned() },
            )
            .expect("fail");
        assert!(progress.status().is_terminal());

        engine.apply(&mut progress, Phase::Plan, &PhaseEvent::RetryRequested).expect("retry");
        assert_eq!(progress.current_phase(), Some(Phase::Plan));

        let error = engine
            .apply(&mut progress, Phase::Plan, &PhaseEvent::RetryRequested)
            .expect_err("cannot retry a running phase");
        assert!(matches!(error, FlowTransitionError::InvalidTransition { .. }));
    }

    #[test]
    fn audit_sink_records_applied_and_rejected_transitions() {
        let engine = FlowEngine::new(ResearchFlow);
        let mut progress = engine.start();
        let sink = InMemoryAuditSink::default();
        let audit = AuditContext::new(None, "run-1", "orchestrator");

        engine
            .apply_with_audit(&mut progress, Phase::Constitution, &PhaseEvent::Approved, &sink, &audit)
            .expect("approve");
        let _ = engine.apply_with_audit(
            &mut progress,
            Phase::Execute,
            &PhaseEvent::Approved,
            &sink,
            &audit,
        );

        let events = sink.events();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].event_type, "flow.transition_applied");
        assert_eq!(events[0].metadata.get("to").map(String::as_str), Some("in_progress"));
        assert_eq!(events[1].outcome, AuditOutcome::Rejected);
        assert_eq!(events[1].correlation_id, "run-1");
    }
}
