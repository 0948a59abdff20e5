//! Interactive reviewer and progress output for a terminal session.

use std::io::{BufRead, Write};
use std::path::PathBuf;
use std::sync::mpsc;
use std::thread;

use async_trait::async_trait;
use researchkit_agent::approval::{ReviewDecision, ReviewError, ReviewRequest, Reviewer};
use researchkit_agent::conversation::TurnObserver;
use researchkit_agent::workflow::{CheckpointStatus, PhaseObserver, PhaseReport, PhaseStatus};
use researchkit_core::{Phase, ToolCall, ToolResult};
use tokio::process::Command;
use tokio::sync::oneshot;

const DEFAULT_EDITOR: &str = "nano";

type LineReply = oneshot::Sender<std::io::Result<Option<String>>>;

/// Reads terminal lines on a dedicated thread, one line per request.
///
/// A read blocked in the thread never holds up runtime shutdown, and no read
/// is outstanding while an editor owns the terminal. A line whose requester
/// went away (interrupted prompt) goes to the next request.
struct LineReader {
    requests: mpsc::Sender<LineReply>,
}

impl LineReader {
    fn spawn<R, F>(open: F) -> std::io::Result<Self>
    where
        R: BufRead,
        F: FnOnce() -> R + Send + 'static,
    {
        let (requests, pending) = mpsc::channel::<LineReply>();
        thread::Builder::new().name("researchkit-input".to_string()).spawn(move || {
            let mut input = open();
            while let Ok(mut reply) = pending.recv() {
                let mut line = String::new();
                let mut result = input.read_line(&mut line).map(|read| (read > 0).then_some(line));
                loop {
                    match reply.send(result) {
                        Ok(()) => break,
                        Err(unsent) => match pending.recv() {
                            Ok(next) => {
                                result = unsent;
                                reply = next;
                            }
                            Err(_) => return,
                        },
                    }
                }
            }
        })?;
        Ok(Self { requests })
    }

    /// `None` at end of input.
    async fn read_line(&self) -> Result<Option<String>, ReviewError> {
        let (reply, answer) = oneshot::channel();
        self.requests.send(reply).map_err(|_| ReviewError::Io("terminal input is closed".to_string()))?;
        match answer.await {
            Ok(Ok(line)) => Ok(line),
            Ok(Err(error)) => Err(ReviewError::Io(error.to_string())),
            Err(_) => Err(ReviewError::Io("terminal input is closed".to_string())),
        }
    }
}

pub struct TerminalReviewer {
    input: LineReader,
    editor: String,
}

impl TerminalReviewer {
    pub fn new() -> std::io::Result<Self> {
        let editor = std::env::var("EDITOR")
            .ok()
            .filter(|value| !value.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_EDITOR.to_string());
        Self::with_input(|| std::io::stdin().lock(), editor)
    }

    fn with_input<R, F>(open: F, editor: String) -> std::io::Result<Self>
    where
        R: BufRead,
        F: FnOnce() -> R + Send + 'static,
    {
        Ok(Self { input: LineReader::spawn(open)?, editor })
    }

    /// Reads one line; end of input is reported as an interrupt.
    pub async fn prompt_line(&self, prompt: &str) -> Result<String, ReviewError> {
        print_flush(prompt);
        match self.input.read_line().await? {
            Some(line) => Ok(line.trim_end_matches(['\r', '\n']).to_string()),
            None => Err(ReviewError::Interrupted),
        }
    }

    async fn edit(&self, candidate: &str) -> Result<String, ReviewError> {
        let file = tempfile::Builder::new()
            .prefix("researchkit-edit-")
            .suffix(".md")
            .tempfile()
            .map_err(|error| ReviewError::Io(error.to_string()))?;
        let path: PathBuf = file.path().to_path_buf();
        tokio::fs::write(&path, candidate).await.map_err(|error| ReviewError::Io(error.to_string()))?;

        let status = Command::new(&self.editor)
            .arg(&path)
            .status()
            .await
            .map_err(|error| ReviewError::Io(format!("could not start editor `{}`: {error}", self.editor)))?;
        if !status.success() {
            return Err(ReviewError::Io(format!("editor `{}` exited with {status}", self.editor)));
        }
        tokio::fs::read_to_string(&path).await.map_err(|error| ReviewError::Io(error.to_string()))
    }
}

#[async_trait]
impl Reviewer for TerminalReviewer {
    async fn review(&self, request: ReviewRequest) -> Result<ReviewDecision, ReviewError> {
        println!();
        println!("{}", rule(&format!("{} draft (revision {})", request.phase.label(), request.revision)));
        println!("{}", request.candidate);
        println!("{}", rule(""));

        let prompt = format!("Approve {}? [y]es / [e]dit / [f]eedback / [s]kip: ", request.phase.label());
        loop {
            let answer = self.prompt_line(&prompt).await?;
            match parse_choice(&answer) {
                Some(Choice::Approve) => return Ok(ReviewDecision::Approve),
                Some(Choice::Edit) => match self.edit(&request.candidate).await {
                    Ok(edited) => return Ok(ReviewDecision::Edit(edited)),
                    Err(error) => println!("Edit failed ({error}); the draft is unchanged."),
                },
                Some(Choice::Feedback) => {
                    let feedback = self.prompt_line("Feedback: ").await?;
                    return Ok(ReviewDecision::Feedback(feedback));
                }
                Some(Choice::Skip) => return Ok(ReviewDecision::Skip),
                None => println!("Please answer y, e, f or s."),
            }
        }
    }

    async fn confirm_retry(&self, phase: Phase, reason: &str) -> Result<bool, ReviewError> {
        println!("{} phase failed: {reason}", phase.label());
        let answer = self.prompt_line("Retry this phase? [y/N]: ").await?;
        Ok(matches!(answer.trim().to_ascii_lowercase().as_str(), "y" | "yes"))
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Choice {
    Approve,
    Edit,
    Feedback,
    Skip,
}

fn parse_choice(answer: &str) -> Option<Choice> {
    match answer.trim().to_ascii_lowercase().as_str() {
        "y" | "yes" => Some(Choice::Approve),
        "e" | "edit" => Some(Choice::Edit),
        "f" | "feedback" => Some(Choice::Feedback),
        "s" | "skip" => Some(Choice::Skip),
        _ => None,
    }
}

/// Prints phase banners, tool activity and model commentary.
#[derive(Clone, Copy, Debug, Default)]
pub struct TerminalObserver;

impl TurnObserver for TerminalObserver {
    fn on_commentary(&self, text: &str) {
        println!("{}", text.trim());
    }

    fn on_tool_dispatch(&self, call: &ToolCall) {
        let target = call
            .argument_str("query")
            .or_else(|| call.argument_str("url"))
            .unwrap_or_default();
        println!("  -> {} {target}", call.name);
    }

    fn on_tool_result(&self, call: &ToolCall, result: &ToolResult) {
        match result.error_message() {
            Some(error) => println!("  !! {} failed: {error}", call.name),
            None => println!("  ok {}", call.name),
        }
    }
}

impl PhaseObserver for TerminalObserver {
    fn on_phase_started(&self, phase: Phase) {
        println!();
        println!("{}", phase_banner(phase));
    }

    fn on_phase_finished(&self, report: &PhaseReport) {
        let verdict = match &report.status {
            PhaseStatus::Approved => "approved".to_string(),
            PhaseStatus::Edited => "accepted with edits".to_string(),
            PhaseStatus::Skipped => "skipped".to_string(),
            PhaseStatus::Failed { kind, reason } => format!("failed ({}): {reason}", kind.label()),
            PhaseStatus::Aborted => "interrupted".to_string(),
        };
        println!("{} {verdict}", report.phase.label());
        for path in &report.artifact_paths {
            println!("  saved {}", path.display());
        }
        match &report.checkpoint {
            CheckpointStatus::Committed => println!("  committed to git"),
            CheckpointStatus::Failed { reason } => println!("  warning: git commit failed ({reason})"),
            CheckpointStatus::Disabled | CheckpointStatus::NotAttempted => {}
        }
    }
}

fn phase_banner(phase: Phase) -> String {
    format!("=== PHASE {}: {} ===", phase.ordinal(), phase.label().to_ascii_uppercase())
}

fn rule(title: &str) -> String {
    if title.is_empty() {
        "-".repeat(60)
    } else {
        format!("--- {title} {}", "-".repeat(55_usize.saturating_sub(title.len())))
    }
}

fn print_flush(text: &str) {
    print!("{text}");
    let _ = std::io::stdout().flush();
}
