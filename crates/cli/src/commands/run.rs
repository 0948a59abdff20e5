use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use researchkit_agent::approval::ReviewError;
use researchkit_agent::llm::supports_tools;
use researchkit_agent::prompts::PromptLibrary;
use researchkit_agent::telemetry::{FanoutAuditSink, TracingAuditSink};
use researchkit_agent::tools::SourceLog;
use researchkit_agent::workflow::Checkpointer;
use researchkit_agent::{
    AbortSignal, ConversationEngine, FailureKind, OllamaClient, PhaseOrchestrator, ResearchSession,
    ToolRegistry, WorkflowReport,
};
use researchkit_core::audit::{AuditContext, AuditSink, InMemoryAuditSink};
use researchkit_core::config::{AppConfig, LoadOptions};
use researchkit_core::{ApplicationError, DomainError, WorkflowStatus};
use serde_json::{json, Value};
use tracing::{info, warn};

use crate::adapters::git::GitCheckpointer;
use crate::adapters::research_tools::{build_http_client, FetchUrlTool, ParsePdfTool, WebSearchTool};
use crate::adapters::terminal::{TerminalObserver, TerminalReviewer};
use crate::adapters::workspace::FsWorkspace;
use crate::commands::CommandResult;
use crate::init_logging;

const COMMAND: &str = "run";
const ACTOR: &str = "researchkit-cli";
const EXIT_INTERRUPTED: u8 = 130;
/// Grace period for in-flight blocking work once the run has its result.
const SHUTDOWN_GRACE: Duration = Duration::from_millis(250);

pub fn run(topic: Option<String>, options: LoadOptions) -> CommandResult {
    let config = match AppConfig::load(options) {
        Ok(config) => config,
        Err(error) => {
            return CommandResult::failure(COMMAND, "config_validation", error.to_string(), 2)
        }
    };
    init_logging(&config);

    let runtime = match tokio::runtime::Builder::new_current_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(error) => {
            return CommandResult::failure(
                COMMAND,
                "runtime",
                format!("failed to initialize async runtime: {error}"),
                1,
            )
        }
    };

    let result = runtime.block_on(execute(config, topic));
    runtime.shutdown_timeout(SHUTDOWN_GRACE);
    result
}

async fn execute(config: AppConfig, topic: Option<String>) -> CommandResult {
    let project_dir = match std::env::current_dir() {
        Ok(dir) => dir,
        Err(error) => {
            return CommandResult::failure(COMMAND, "workspace", error.to_string(), 1);
        }
    };
    let workspace = Arc::new(FsWorkspace::new(project_dir.clone(), &config.workspace.root_dir));
    if let Err(error) = workspace.init().await {
        return CommandResult::failure(COMMAND, "workspace", error.to_string(), 1);
    }

    let client = match OllamaClient::from_config(&config.model) {
        Ok(client) => client,
        Err(error) => return CommandResult::failure(COMMAND, "config_validation", error.to_string(), 2),
    };
    if let Err(result) = check_model_server(&client).await {
        return result;
    }

    let reviewer = match TerminalReviewer::new() {
        Ok(reviewer) => Arc::new(reviewer),
        Err(error) => {
            return CommandResult::failure(COMMAND, "input", format!("could not read the terminal: {error}"), 1)
        }
    };
    let topic = match resolve_topic(topic, &reviewer).await {
        Ok(topic) => topic,
        Err(result) => return result,
    };

    let session = ResearchSession::new(topic);
    let recorder = InMemoryAuditSink::default();
    let assembled =
        assemble(&config, client, &session, project_dir, workspace, reviewer, recorder.clone()).await;
    let orchestrator = match assembled {
        Ok(orchestrator) => orchestrator,
        Err(error) => {
            return CommandResult::failure(COMMAND, "startup", format!("{error:#}"), 1);
        }
    };

    info!(
        event_name = "run.started",
        correlation_id = %session.run_id.as_str(),
        model = %config.model.model,
        "starting research run"
    );

    match orchestrator.run(&session).await {
        Ok(report) => {
            let warnings =
                recorder.failures().into_iter().map(|event| event.event_type).collect::<Vec<_>>();
            report_outcome(&report, &warnings)
        }
        Err(error) => CommandResult::failure(COMMAND, "internal", error.to_string(), 1),
    }
}

/// Fails fast when the model server cannot be reached, before any prompt.
async fn check_model_server(client: &OllamaClient) -> Result<(), CommandResult> {
    client.ping().await.map_err(|error| {
        CommandResult::failure(
            COMMAND,
            "service_unavailable",
            format!("cannot reach the model server at `{}`: {error}; is Ollama running?", client.base_url()),
            3,
        )
    })
}

async fn resolve_topic(
    topic: Option<String>,
    reviewer: &TerminalReviewer,
) -> Result<String, CommandResult> {
    let raw = match topic {
        Some(topic) => topic,
        None => match reviewer.prompt_line("Research topic: ").await {
            Ok(line) => line,
            Err(ReviewError::Interrupted) => {
                return Err(CommandResult::outcome(
                    COMMAND,
                    "aborted",
                    None,
                    "no topic entered",
                    None,
                    None,
                    EXIT_INTERRUPTED,
                ))
            }
            Err(error) => return Err(CommandResult::failure(COMMAND, "input", error.to_string(), 1)),
        },
    };

    let topic = raw.trim();
    if topic.is_empty() {
        return Err(CommandResult::failure(COMMAND, "bad_request", "research topic must not be empty", 2));
    }
    Ok(topic.to_string())
}

async fn assemble(
    config: &AppConfig,
    client: OllamaClient,
    session: &ResearchSession,
    project_dir: PathBuf,
    workspace: Arc<FsWorkspace>,
    reviewer: Arc<TerminalReviewer>,
    recorder: InMemoryAuditSink,
) -> anyhow::Result<PhaseOrchestrator> {
    if !supports_tools(client.model()) {
        warn!(
            event_name = "model.tools_unsupported",
            model = %client.model(),
            "model is not known to support tool calling; research tools may be ignored"
        );
    }

    let http = build_http_client(&config.tools).context("failed to build HTTP client for tools")?;
    let sources: Arc<dyn SourceLog> = Arc::new(workspace.source_log(session));
    let mut registry = ToolRegistry::default();
    registry.register(WebSearchTool::new(http.clone(), config.tools.search_endpoint.clone(), sources.clone()));
    registry.register(FetchUrlTool::new(http.clone(), config.tools.max_content_chars, sources.clone()));
    registry.register(ParsePdfTool::new(
        http,
        config.tools.pdftotext_bin.clone(),
        config.tools.max_content_chars,
        workspace.research_dir(session),
        sources,
    ));

    let abort = AbortSignal::new();
    spawn_interrupt_listener(abort.clone());

    let sinks: Vec<Arc<dyn AuditSink>> =
        vec![Arc::new(TracingAuditSink), Arc::new(recorder)];
    let audit: Arc<dyn AuditSink> = Arc::new(FanoutAuditSink::new(sinks));
    let observer = Arc::new(TerminalObserver);

    let engine = ConversationEngine::new(Arc::new(client), Arc::new(registry), config.engine)
        .with_observer(observer.clone())
        .with_audit(audit.clone(), AuditContext::for_run(&session.run_id, ACTOR))
        .with_abort(abort);

    let prompts = PromptLibrary::new().context("failed to compile prompt templates")?;
    let mut orchestrator = PhaseOrchestrator::new(engine, prompts, reviewer, workspace)
        .with_audit(audit)
        .with_observer(observer);

    if let Some(checkpointer) = checkpointer(config, project_dir).await {
        orchestrator = orchestrator.with_checkpointer(checkpointer);
    }
    Ok(orchestrator)
}

async fn checkpointer(config: &AppConfig, project_dir: PathBuf) -> Option<Arc<dyn Checkpointer>> {
    if !config.workspace.commit_checkpoints {
        return None;
    }
    match GitCheckpointer::discover(project_dir) {
        Ok(git) if git.is_repository().await => Some(Arc::new(git)),
        Ok(_) => {
            warn!(event_name = "checkpoint.disabled", "not a git repository; artifacts will not be committed");
            None
        }
        Err(error) => {
            warn!(event_name = "checkpoint.disabled", error = %error, "git unavailable; artifacts will not be committed");
            None
        }
    }
}

/// The first Ctrl-C aborts the run gracefully; a second one exits at once.
fn spawn_interrupt_listener(abort: AbortSignal) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_err() {
            return;
        }
        warn!(event_name = "run.interrupt", "interrupt received; finishing the current step");
        abort.trigger();

        if tokio::signal::ctrl_c().await.is_ok() {
            warn!(event_name = "run.interrupt_forced", "second interrupt received; exiting");
            std::process::exit(i32::from(EXIT_INTERRUPTED));
        }
    });
}

/// Error class and exit code follow what made the phase fail.
fn failure_error(kind: Option<FailureKind>, message: String) -> ApplicationError {
    match kind {
        Some(FailureKind::ServiceUnavailable | FailureKind::ModelProtocol) => {
            ApplicationError::Integration(message)
        }
        Some(FailureKind::ToolLoopExceeded | FailureKind::InvalidConversation) => {
            ApplicationError::Domain(DomainError::InvariantViolation(message))
        }
        Some(FailureKind::Storage) => ApplicationError::Persistence(message),
        Some(FailureKind::Review | FailureKind::Prompt) | None => ApplicationError::Configuration(message),
    }
}

/// `warnings` are the failed audit events recorded during the run.
fn report_outcome(report: &WorkflowReport, warnings: &[String]) -> CommandResult {
    let run_id = report.run_id.as_str().to_string();
    let mut details = serde_json::to_value(report).unwrap_or(Value::Null);
    let failed = report.failed_phase();
    if let Value::Object(map) = &mut details {
        map.insert("warnings".to_string(), json!(warnings));
        if let Some(failed) = failed {
            map.insert("last_candidate".to_string(), json!(failed.last_candidate));
            map.insert(
                "conversation".to_string(),
                serde_json::to_value(&failed.conversation).unwrap_or(Value::Null),
            );
        }
    }

    match &report.status {
        WorkflowStatus::Completed => CommandResult::outcome(
            COMMAND,
            "ok",
            None,
            format!("research on `{}` completed", report.topic),
            Some(run_id),
            Some(details),
            0,
        ),
        WorkflowStatus::Incomplete { blocked_at } => CommandResult::outcome(
            COMMAND,
            "incomplete",
            None,
            format!("{} was skipped; later phases did not run", blocked_at.label()),
            Some(run_id),
            Some(details),
            0,
        ),
        WorkflowStatus::Failed { phase, reason } => {
            let kind = failed.and_then(|failed| failed.status.failure_kind());
            let error = failure_error(kind, format!("{} phase failed: {reason}", phase.label()))
                .into_interface(run_id.clone());
            let error_class = kind.map_or("internal", FailureKind::label);
            CommandResult::outcome(
                COMMAND,
                "error",
                Some(error_class),
                format!("{} ({error})", error.user_message()),
                Some(run_id),
                Some(details),
                error.exit_code(),
            )
        }
        WorkflowStatus::Aborted { phase } => CommandResult::outcome(
            COMMAND,
            "aborted",
            None,
            format!("interrupted during {}; accepted artifacts were kept", phase.label()),
            Some(run_id),
            Some(details),
            EXIT_INTERRUPTED,
        ),
        WorkflowStatus::InProgress { next } => CommandResult::outcome(
            COMMAND,
            "error",
            Some("internal"),
            format!("workflow stopped before {}", next.label()),
            Some(run_id),
            Some(json!({ "next": next.label() })),
            1,
        ),
    }
}
