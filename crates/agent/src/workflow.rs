//! Phase orchestration.
//!
//! Sequences Constitution, Plan, Execute and Synthesize. Each phase seeds a
//! fresh conversation from its prompt, runs the approval cycle, persists the
//! accepted artifact, checkpoints it and records the outcome in the flow
//! state machine from `researchkit_core::flows`.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{Local, NaiveDate};
use researchkit_core::audit::{AuditCategory, AuditContext, AuditEvent, AuditOutcome, AuditSink};
use researchkit_core::{
    Artifact, ArtifactOrigin, Conversation, FlowEngine, FlowTransitionError, Phase, PhaseEvent,
    ResearchFlow, RunId, WorkflowStatus,
};
use serde::Serialize;
use thiserror::Error;
use tracing::{info, warn};

use crate::approval::{ApprovalController, ApprovalError, ApprovalOutcome, Reviewer};
use crate::conversation::{ConversationEngine, EngineError, ToolMode};
use crate::prompts::{PhaseContext, PromptLibrary};
use crate::telemetry::TracingAuditSink;

const ACTOR: &str = "researchkit";
const MAX_SLUG_CHARS: usize = 50;

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ResearchSession {
    pub run_id: RunId,
    pub topic: String,
    pub started_on: NaiveDate,
}

impl ResearchSession {
    pub fn new(topic: impl Into<String>) -> Self {
        Self::on_date(topic, Local::now().date_naive())
    }

    pub fn on_date(topic: impl Into<String>, started_on: NaiveDate) -> Self {
        Self { run_id: RunId::generate(), topic: topic.into(), started_on }
    }

    pub fn slug(&self) -> String {
        topic_slug(&self.topic)
    }

    /// `<YYYY-MM-DD>-<slug>`, the per-run directory under `research/`.
    pub fn directory_name(&self) -> String {
        format!("{}-{}", self.started_on.format("%Y-%m-%d"), self.slug())
    }

    /// File name of the synthesis copy placed at the project root.
    pub fn synthesis_copy_name(&self) -> String {
        format!("{}-synthesis-{}.md", self.slug(), self.started_on.format("%Y-%m-%d"))
    }
}

pub fn topic_slug(topic: &str) -> String {
    let mut slug = String::new();
    let mut pending_dash = false;
    for ch in topic.chars() {
        if slug.len() >= MAX_SLUG_CHARS {
            break;
        }
        if ch.is_ascii_alphanumeric() {
            if pending_dash && !slug.is_empty() {
                slug.push('-');
            }
            pending_dash = false;
            slug.push(ch.to_ascii_lowercase());
        } else {
            pending_dash = true;
        }
    }
    if slug.is_empty() {
        "research".to_string()
    } else {
        slug
    }
}

pub fn commit_message(phase: Phase, topic: &str) -> String {
    match phase {
        Phase::Constitution => "docs: update research constitution".to_string(),
        Phase::Plan => format!("docs: add research plan for {topic}"),
        Phase::Execute => "docs: document research findings".to_string(),
        Phase::Synthesize => "docs: complete research synthesis".to_string(),
    }
}

/// Synthesis works only from what earlier phases gathered.
pub fn tool_mode(phase: Phase) -> ToolMode {
    match phase {
        Phase::Synthesize => ToolMode::Disabled,
        Phase::Constitution | Phase::Plan | Phase::Execute => ToolMode::Enabled,
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("could not read {}: {message}", .path.display())]
    Read { path: PathBuf, message: String },
    #[error("could not write {}: {message}", .path.display())]
    Write { path: PathBuf, message: String },
}

/// Durable home of accepted artifacts and their supporting documents.
#[async_trait]
pub trait ArtifactStore: Send + Sync {
    /// Previously persisted artifact for `phase`, if any.
    async fn load(&self, session: &ResearchSession, phase: Phase) -> Result<Option<String>, StoreError>;

    /// Persists `artifact` and returns every path written.
    async fn save(&self, session: &ResearchSession, artifact: &Artifact) -> Result<Vec<PathBuf>, StoreError>;

    async fn plan_template(&self) -> Result<Option<String>, StoreError>;

    async fn bibliography(&self, session: &ResearchSession) -> Result<Option<String>, StoreError>;
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum CheckpointError {
    #[error("version control unavailable: {0}")]
    Unavailable(String),
    #[error("`{command}` failed: {stderr}")]
    CommandFailed { command: String, stderr: String },
}

#[async_trait]
pub trait Checkpointer: Send + Sync {
    async fn checkpoint(&self, paths: &[PathBuf], message: &str) -> Result<(), CheckpointError>;
}

pub trait PhaseObserver: Send + Sync {
    fn on_phase_started(&self, _phase: Phase) {}
    fn on_phase_finished(&self, _report: &PhaseReport) {}
}

#[derive(Clone, Copy, Debug, Default)]
pub struct SilentPhaseObserver;

impl PhaseObserver for SilentPhaseObserver {}

/// What made a phase fail. Drives the error class and exit code of a run.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    ServiceUnavailable,
    ModelProtocol,
    ToolLoopExceeded,
    InvalidConversation,
    Review,
    Storage,
    Prompt,
}

impl FailureKind {
    pub fn from_engine(error: &EngineError) -> Self {
        match error {
            EngineError::ServiceUnavailable(_) => Self::ServiceUnavailable,
            EngineError::Protocol(_) => Self::ModelProtocol,
            EngineError::ToolLoopExceeded { .. } => Self::ToolLoopExceeded,
            EngineError::Conversation(_) => Self::InvalidConversation,
            // Interrupts end the phase as aborted before a kind is needed.
            EngineError::Interrupted => Self::Review,
        }
    }

    fn from_approval(error: &ApprovalError) -> Self {
        match error {
            ApprovalError::Engine { source, .. } => Self::from_engine(source),
            ApprovalError::Review { .. } | ApprovalError::Transition(_) => Self::Review,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Self::ServiceUnavailable => "service_unavailable",
            Self::ModelProtocol => "model_protocol",
            Self::ToolLoopExceeded => "tool_loop_exceeded",
            Self::InvalidConversation => "invalid_conversation",
            Self::Review => "review",
            Self::Storage => "storage",
            Self::Prompt => "prompt",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum PhaseStatus {
    Approved,
    Edited,
    Skipped,
    Failed { kind: FailureKind, reason: String },
    Aborted,
}

impl PhaseStatus {
    pub fn event(&self) -> PhaseEvent {
        match self {
            Self::Approved => PhaseEvent::Approved,
            Self::Edited => PhaseEvent::Edited,
            Self::Skipped => PhaseEvent::Skipped,
            Self::Failed { reason, .. } => PhaseEvent::Failed { reason: reason.clone() },
            Self::Aborted => PhaseEvent::Aborted,
        }
    }

    pub fn failure_kind(&self) -> Option<FailureKind> {
        match self {
            Self::Failed { kind, .. } => Some(*kind),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum CheckpointStatus {
    Disabled,
    NotAttempted,
    Committed,
    Failed { reason: String },
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct PhaseReport {
    pub phase: Phase,
    pub status: PhaseStatus,
    pub revisions: u32,
    /// Messages in the phase conversation when it ended.
    pub conversation_len: usize,
    pub artifact_paths: Vec<PathBuf>,
    pub checkpoint: CheckpointStatus,
    /// Text the human last saw, kept when the phase ends without accepting it.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_candidate: Option<String>,
    /// Transcript of a phase that failed or was interrupted.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub conversation: Option<Conversation>,
}

impl PhaseReport {
    fn ended(phase: Phase, status: PhaseStatus, conversation_len: usize) -> Self {
        Self {
            phase,
            status,
            revisions: 0,
            conversation_len,
            artifact_paths: Vec::new(),
            checkpoint: CheckpointStatus::NotAttempted,
            last_candidate: None,
            conversation: None,
        }
    }

    fn with_last_candidate(mut self, candidate: Option<String>) -> Self {
        self.last_candidate = candidate;
        self
    }

    fn with_conversation(mut self, conversation: Option<&Conversation>) -> Self {
        self.conversation = conversation.cloned();
        self
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct WorkflowReport {
    pub run_id: RunId,
    pub topic: String,
    pub status: WorkflowStatus,
    pub phases: Vec<PhaseReport>,
}

impl WorkflowReport {
    pub fn is_complete(&self) -> bool {
        self.status == WorkflowStatus::Completed
    }

    pub fn phase(&self, phase: Phase) -> Option<&PhaseReport> {
        self.phases.iter().rev().find(|report| report.phase == phase)
    }

    /// Most recent failed phase report, if the run ended in failure.
    pub fn failed_phase(&self) -> Option<&PhaseReport> {
        match &self.status {
            WorkflowStatus::Failed { phase, .. } => self.phase(*phase),
            _ => None,
        }
    }
}

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error(transparent)]
    Flow(#[from] FlowTransitionError),
}

pub struct PhaseOrchestrator {
    engine: ConversationEngine,
    prompts: PromptLibrary,
    reviewer: Arc<dyn Reviewer>,
    store: Arc<dyn ArtifactStore>,
    checkpointer: Option<Arc<dyn Checkpointer>>,
    audit: Arc<dyn AuditSink>,
    observer: Arc<dyn PhaseObserver>,
    flow: FlowEngine<ResearchFlow>,
}

impl PhaseOrchestrator {
    pub fn new(
        engine: ConversationEngine,
        prompts: PromptLibrary,
        reviewer: Arc<dyn Reviewer>,
        store: Arc<dyn ArtifactStore>,
    ) -> Self {
        Self {
            engine,
            prompts,
            reviewer,
            store,
            checkpointer: None,
            audit: Arc::new(TracingAuditSink),
            observer: Arc::new(SilentPhaseObserver),
            flow: FlowEngine::new(ResearchFlow),
        }
    }

    pub fn with_checkpointer(mut self, checkpointer: Arc<dyn Checkpointer>) -> Self {
        self.checkpointer = Some(checkpointer);
        self
    }

    pub fn with_audit(mut self, audit: Arc<dyn AuditSink>) -> Self {
        self.audit = audit;
        self
    }

    pub fn with_observer(mut self, observer: Arc<dyn PhaseObserver>) -> Self {
        self.observer = observer;
        self
    }

    pub fn engine(&self) -> &ConversationEngine {
        &self.engine
    }

    /// Runs phases until the flow leaves `InProgress`. A failed phase is rerun
    /// when the reviewer confirms a retry.
    pub async fn run(&self, session: &ResearchSession) -> Result<WorkflowReport, OrchestratorError> {
        let audit = AuditContext::for_run(&session.run_id, ACTOR);
        let mut progress = self.flow.start();
        let mut context = PhaseContext::for_topic(session.topic.clone());
        let mut phases = Vec::new();

        info!(
            event_name = "workflow.started",
            correlation_id = %session.run_id.as_str(),
            topic = %session.topic,
            "research workflow started"
        );

        while let Some(phase) = progress.current_phase() {
            self.observer.on_phase_started(phase);
            let report = self.run_phase(session, phase, &mut context, &audit).await;
            self.observer.on_phase_finished(&report);

            let event = report.status.event();
            self.flow.apply_with_audit(&mut progress, phase, &event, self.audit.as_ref(), &audit)?;

            let failure = match &report.status {
                PhaseStatus::Failed { reason, .. } => Some(reason.clone()),
                _ => None,
            };
            phases.push(report);

            if let Some(reason) = failure {
                if self.confirm_retry(phase, &reason).await {
                    self.engine.abort_signal().reset();
                    self.flow.apply_with_audit(
                        &mut progress,
                        phase,
                        &PhaseEvent::RetryRequested,
                        self.audit.as_ref(),
                        &audit,
                    )?;
                }
            }
        }

        let status = progress.status().clone();
        info!(
            event_name = "workflow.finished",
            correlation_id = %session.run_id.as_str(),
            status = status.label(),
            phases_run = phases.len(),
            "research workflow finished"
        );
        Ok(WorkflowReport { run_id: session.run_id.clone(), topic: session.topic.clone(), status, phases })
    }

    async fn run_phase(
        &self,
        session: &ResearchSession,
        phase: Phase,
        context: &mut PhaseContext,
        audit: &AuditContext,
    ) -> PhaseReport {
        info!(
            event_name = "phase.started",
            correlation_id = %session.run_id.as_str(),
            phase = %phase,
            "phase started"
        );

        if let Err(error) = self.hydrate(session, phase, context).await {
            return self.failed(session, phase, FailureKind::Storage, error.to_string(), None, None);
        }
        let system_prompt = match self.prompts.system_prompt(phase, context) {
            Ok(prompt) => prompt,
            Err(error) => {
                return self.failed(session, phase, FailureKind::Prompt, error.to_string(), None, None)
            }
        };

        let mode = tool_mode(phase);
        let mut conversation = Conversation::seeded(system_prompt);
        let seed = self.prompts.seed_request(phase, context);
        let first = match self.engine.respond(&mut conversation, &seed, mode).await {
            Ok(reply) => reply,
            Err(EngineError::Interrupted) => {
                return self.aborted(session, phase, &conversation, None);
            }
            Err(error) => {
                let kind = FailureKind::from_engine(&error);
                return self.failed(session, phase, kind, error.to_string(), Some(&conversation), None);
            }
        };

        let controller = ApprovalController::new(&self.engine, self.reviewer.as_ref());
        let artifact = match controller.run(phase, &mut conversation, first.text, mode).await {
            Ok(ApprovalOutcome::Accepted(artifact)) => artifact,
            Ok(ApprovalOutcome::Skipped { revisions }) => {
                self.audit.emit(
                    AuditEvent::from_context(audit, "review.skipped", AuditCategory::Review, AuditOutcome::Success)
                        .with_phase(phase)
                        .with_metadata("revisions", revisions.to_string()),
                );
                info!(
                    event_name = "phase.skipped",
                    correlation_id = %session.run_id.as_str(),
                    phase = %phase,
                    revisions,
                    "phase skipped by reviewer"
                );
                let mut report = PhaseReport::ended(phase, PhaseStatus::Skipped, conversation.len());
                report.revisions = revisions;
                return report;
            }
            Err(error) => {
                let last_candidate = error.last_candidate().map(str::to_string);
                return if error.is_interrupt() {
                    self.aborted(session, phase, &conversation, last_candidate)
                } else {
                    let kind = FailureKind::from_approval(&error);
                    self.failed(session, phase, kind, error.to_string(), Some(&conversation), last_candidate)
                };
            }
        };

        self.audit.emit(
            AuditEvent::from_context(audit, "review.accepted", AuditCategory::Review, AuditOutcome::Success)
                .with_phase(phase)
                .with_metadata("origin", format!("{:?}", artifact.origin))
                .with_metadata("revisions", artifact.revisions.to_string()),
        );

        let paths = match self.store.save(session, &artifact).await {
            Ok(paths) => paths,
            Err(error) => {
                self.audit.emit(
                    AuditEvent::from_context(
                        audit,
                        "artifact.save_failed",
                        AuditCategory::Persistence,
                        AuditOutcome::Failed,
                    )
                    .with_phase(phase)
                    .with_metadata("error", error.to_string()),
                );
                let candidate = Some(artifact.body.clone());
                return self.failed(
                    session,
                    phase,
                    FailureKind::Storage,
                    error.to_string(),
                    Some(&conversation),
                    candidate,
                );
            }
        };
        self.audit.emit(
            AuditEvent::from_context(audit, "artifact.saved", AuditCategory::Persistence, AuditOutcome::Success)
                .with_phase(phase)
                .with_metadata("paths", paths.len().to_string()),
        );

        if let Some(slot) = context.slot_mut(phase) {
            slot.clone_from(&artifact.body);
        }
        let checkpoint = self.checkpoint(session, phase, &paths, audit).await;

        let status = match artifact.origin {
            ArtifactOrigin::Generated => PhaseStatus::Approved,
            ArtifactOrigin::Edited => PhaseStatus::Edited,
        };
        info!(
            event_name = "phase.accepted",
            correlation_id = %session.run_id.as_str(),
            phase = %phase,
            revisions = artifact.revisions,
            conversation_len = conversation.len(),
            "phase artifact accepted"
        );
        PhaseReport {
            phase,
            status,
            revisions: artifact.revisions,
            conversation_len: conversation.len(),
            artifact_paths: paths,
            checkpoint,
            last_candidate: None,
            conversation: None,
        }
    }

    /// Fills context the current run has not produced from persisted artifacts.
    async fn hydrate(
        &self,
        session: &ResearchSession,
        phase: Phase,
        context: &mut PhaseContext,
    ) -> Result<(), StoreError> {
        let mut wanted = phase.predecessors().collect::<Vec<_>>();
        if phase == Phase::Constitution {
            wanted.push(Phase::Constitution);
        }

        for needed in wanted {
            let missing = context.slot_mut(needed).is_some_and(|slot| slot.trim().is_empty());
            if !missing {
                continue;
            }
            if let Some(body) = self.store.load(session, needed).await? {
                if let Some(slot) = context.slot_mut(needed) {
                    *slot = body;
                }
            }
        }

        match phase {
            Phase::Plan => {
                if let Some(template) = self.store.plan_template().await? {
                    context.plan_template = template;
                }
            }
            Phase::Synthesize => {
                context.sources = self.store.bibliography(session).await?.unwrap_or_default();
            }
            Phase::Constitution | Phase::Execute => {}
        }
        Ok(())
    }

    async fn checkpoint(
        &self,
        session: &ResearchSession,
        phase: Phase,
        paths: &[PathBuf],
        audit: &AuditContext,
    ) -> CheckpointStatus {
        let Some(checkpointer) = &self.checkpointer else {
            return CheckpointStatus::Disabled;
        };
        if paths.is_empty() {
            return CheckpointStatus::NotAttempted;
        }

        let message = commit_message(phase, &session.topic);
        match checkpointer.checkpoint(paths, &message).await {
            Ok(()) => {
                self.audit.emit(
                    AuditEvent::from_context(
                        audit,
                        "checkpoint.committed",
                        AuditCategory::Checkpoint,
                        AuditOutcome::Success,
                    )
                    .with_phase(phase)
                    .with_metadata("message", message),
                );
                CheckpointStatus::Committed
            }
            Err(error) => {
                warn!(
                    event_name = "checkpoint.failed",
                    correlation_id = %session.run_id.as_str(),
                    phase = %phase,
                    error = %error,
                    "checkpoint failed; continuing"
                );
                self.audit.emit(
                    AuditEvent::from_context(
                        audit,
                        "checkpoint.failed",
                        AuditCategory::Checkpoint,
                        AuditOutcome::Failed,
                    )
                    .with_phase(phase)
                    .with_metadata("error", error.to_string()),
                );
                CheckpointStatus::Failed { reason: error.to_string() }
            }
        }
    }

    async fn confirm_retry(&self, phase: Phase, reason: &str) -> bool {
        let answer = self.engine.abort_signal().guard(self.reviewer.confirm_retry(phase, reason)).await;
        matches!(answer, Ok(Ok(true)))
    }

    fn failed(
        &self,
        session: &ResearchSession,
        phase: Phase,
        kind: FailureKind,
        reason: String,
        conversation: Option<&Conversation>,
        last_candidate: Option<String>,
    ) -> PhaseReport {
        let conversation_len = conversation.map_or(0, Conversation::len);
        warn!(
            event_name = "phase.failed",
            correlation_id = %session.run_id.as_str(),
            phase = %phase,
            kind = kind.label(),
            reason = %reason,
            conversation_len,
            "phase failed"
        );
        PhaseReport::ended(phase, PhaseStatus::Failed { kind, reason }, conversation_len)
            .with_last_candidate(last_candidate)
            .with_conversation(conversation)
    }

    fn aborted(
        &self,
        session: &ResearchSession,
        phase: Phase,
        conversation: &Conversation,
        last_candidate: Option<String>,
    ) -> PhaseReport {
        warn!(
            event_name = "phase.aborted",
            correlation_id = %session.run_id.as_str(),
            phase = %phase,
            conversation_len = conversation.len(),
            "phase interrupted"
        );
        PhaseReport::ended(phase, PhaseStatus::Aborted, conversation.len())
            .with_last_candidate(last_candidate)
            .with_conversation(Some(conversation))
    }
}
