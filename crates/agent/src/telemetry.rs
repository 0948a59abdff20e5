use std::sync::Arc;

use researchkit_core::audit::{AuditEvent, AuditOutcome, AuditSink};
use tracing::{info, warn};

/// Forwards audit events to the tracing subscriber installed by the binary.
#[derive(Clone, Copy, Debug, Default)]
pub struct TracingAuditSink;

impl AuditSink for TracingAuditSink {
    fn emit(&self, event: AuditEvent) {
        let phase = event.phase.map(|phase| phase.label()).unwrap_or("-");
        let metadata = serde_json::to_string(&event.metadata).unwrap_or_default();
        match event.outcome {
            AuditOutcome::Success => info!(
                event_name = %event.event_type,
                correlation_id = %event.correlation_id,
                phase,
                category = ?event.category,
                actor = %event.actor,
                metadata = %metadata,
                "audit"
            ),
            AuditOutcome::Rejected | AuditOutcome::Failed => warn!(
                event_name = %event.event_type,
                correlation_id = %event.correlation_id,
                phase,
                category = ?event.category,
                outcome = ?event.outcome,
                actor = %event.actor,
                metadata = %metadata,
                "audit"
            ),
        }
    }
}

/// Fans each event out to every inner sink, in order.
#[derive(Clone, Default)]
pub struct FanoutAuditSink {
    sinks: Vec<Arc<dyn AuditSink>>,
}

impl FanoutAuditSink {
    pub fn new(sinks: Vec<Arc<dyn AuditSink>>) -> Self {
        Self { sinks }
    }
}

impl AuditSink for FanoutAuditSink {
    fn emit(&self, event: AuditEvent) {
        if let Some((last, rest)) = self.sinks.split_last() {
            for sink in rest {
                sink.emit(event.clone());
            }
            last.emit(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use researchkit_core::audit::{
        AuditCategory, AuditContext, AuditEvent, AuditOutcome, AuditSink, InMemoryAuditSink,
    };
    use researchkit_core::RunId;

    use super::{FanoutAuditSink, TracingAuditSink};

    #[test]
    fn fanout_delivers_to_every_sink() {
        let first = InMemoryAuditSink::default();
        let second = InMemoryAuditSink::default();
        let sinks: Vec<Arc<dyn AuditSink>> =
            vec![Arc::new(first.clone()), Arc::new(TracingAuditSink), Arc::new(second.clone())];
        let sink = FanoutAuditSink::new(sinks);

        let context = AuditContext::for_run(&RunId("run-1".to_string()), "tester");
        sink.emit(AuditEvent::from_context(
            &context,
            "checkpoint.committed",
            AuditCategory::Checkpoint,
            AuditOutcome::Success,
        ));

        assert_eq!(first.event_types(), vec!["checkpoint.committed"]);
        assert_eq!(second.event_types(), vec!["checkpoint.committed"]);
    }
}
