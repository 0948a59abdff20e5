pub mod adapters;
pub mod commands;

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Args, Parser, Subcommand};
use researchkit_core::config::{AppConfig, ConfigOverrides, LoadOptions, LogFormat};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(
    name = "researchkit",
    about = "Phase-driven research assistant backed by a local model",
    long_about = "Walk a research topic through constitution, plan, execute and synthesize phases, \
                  reviewing every artifact before it is saved.",
    after_help = "Examples:\n  researchkit init\n  researchkit run \"urban heat islands\"\n  researchkit models\n  researchkit doctor --json"
)]
pub struct Cli {
    #[command(flatten)]
    global: GlobalArgs,
    #[command(subcommand)]
    command: Command,
}

#[derive(Clone, Debug, Default, Args)]
pub struct GlobalArgs {
    #[arg(long, global = true, help = "Path to a researchkit.toml config file")]
    pub config: Option<PathBuf>,
    #[arg(long, global = true, help = "Model name to use for this invocation")]
    pub model: Option<String>,
    #[arg(long, global = true, help = "Base URL of the Ollama server")]
    pub base_url: Option<String>,
    #[arg(long, global = true, help = "Log level (error, warn, info, debug, trace)")]
    pub log_level: Option<String>,
    #[arg(long, global = true, help = "Maximum model calls per answer")]
    pub max_tool_iterations: Option<u32>,
    #[arg(long, global = true, help = "Do not commit accepted artifacts to git")]
    pub no_commit: bool,
}

impl GlobalArgs {
    pub fn load_options(&self) -> LoadOptions {
        LoadOptions {
            config_path: self.config.clone(),
            require_file: self.config.is_some(),
            overrides: ConfigOverrides {
                model: self.model.clone(),
                base_url: self.base_url.clone(),
                log_level: self.log_level.clone(),
                max_tool_iterations: self.max_tool_iterations,
                commit_checkpoints: self.no_commit.then_some(false),
            },
        }
    }
}

#[derive(Debug, Subcommand)]
enum Command {
    #[command(about = "Run the research workflow for a topic (prompts for one if omitted)")]
    Run { topic: Option<String> },
    #[command(about = "Create the .researchkit workspace and an optional config file")]
    Init {
        #[arg(long, help = "Model to record in the new config file")]
        model: Option<String>,
    },
    #[command(about = "List models available on the Ollama server")]
    Models {
        #[arg(long, help = "Include models without tool-calling support")]
        all: bool,
    },
    #[command(about = "Check config, model endpoint, git, pdftotext and workspace readiness")]
    Doctor {
        #[arg(long, help = "Emit machine-readable JSON output")]
        json: bool,
    },
    #[command(
        about = "Inspect effective configuration values with source attribution and redaction"
    )]
    Config,
}

/// Installs the stderr subscriber once; later calls are no-ops.
pub fn init_logging(config: &AppConfig) {
    let filter = EnvFilter::try_new(&config.logging.level).unwrap_or_else(|_| EnvFilter::new("warn"));
    let builder =
        tracing_subscriber::fmt().with_target(false).with_env_filter(filter).with_writer(std::io::stderr);

    let _ = match config.logging.format {
        LogFormat::Compact => builder.compact().try_init(),
        LogFormat::Pretty => builder.pretty().try_init(),
        LogFormat::Json => builder.json().try_init(),
    };
}

pub fn run() -> ExitCode {
    let cli = Cli::parse();
    let options = cli.global.load_options();

    let result = match cli.command {
        Command::Run { topic } => commands::run::run(topic, options),
        Command::Init { model } => commands::init::run(model, options),
        Command::Models { all } => commands::models::run(all, options),
        Command::Doctor { json } => {
            commands::CommandResult { exit_code: 0, output: commands::doctor::run(json, options) }
        }
        Command::Config => {
            commands::CommandResult { exit_code: 0, output: commands::config::run(options) }
        }
    };

    println!("{}", result.output);
    ExitCode::from(result.exit_code)
}
