use std::path::Path;

use researchkit_core::config::{AppConfig, LoadOptions};
use serde_json::json;
use toml::{Table, Value};
use tracing::info;

use crate::adapters::workspace::FsWorkspace;
use crate::commands::CommandResult;

const COMMAND: &str = "init";

pub fn run(model: Option<String>, options: LoadOptions) -> CommandResult {
    match std::env::current_dir() {
        Ok(project_dir) => run_in(&project_dir, model, options),
        Err(error) => CommandResult::failure(COMMAND, "workspace", error.to_string(), 1),
    }
}

/// Creates the workspace under `project_dir`. An existing config file is kept.
pub fn run_in(project_dir: &Path, model: Option<String>, options: LoadOptions) -> CommandResult {
    let config = match AppConfig::load(options) {
        Ok(config) => config,
        Err(error) => {
            return CommandResult::failure(COMMAND, "config_validation", error.to_string(), 2)
        }
    };

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

    let workspace = FsWorkspace::new(project_dir, &config.workspace.root_dir);
    let mut created = match runtime.block_on(workspace.init()) {
        Ok(created) => created,
        Err(error) => return CommandResult::failure(COMMAND, "workspace", error.to_string(), 1),
    };

    let config_path = workspace.config_path();
    if !config_path.exists() {
        let model = model.unwrap_or_else(|| config.model.model.clone());
        let rendered = match render_config(&config, &model) {
            Ok(rendered) => rendered,
            Err(error) => return CommandResult::failure(COMMAND, "serialization", error.to_string(), 1),
        };
        if let Err(error) = std::fs::write(&config_path, rendered) {
            return CommandResult::failure(
                COMMAND,
                "workspace",
                format!("could not write `{}`: {error}", config_path.display()),
                1,
            );
        }
        created.push(config_path);
    }

    info!(
        event_name = "workspace.initialized",
        root = %workspace.root().display(),
        created = created.len(),
        "workspace initialized"
    );

    let message = if created.is_empty() {
        format!("workspace already initialized at `{}`", workspace.root().display())
    } else {
        format!("initialized workspace at `{}`", workspace.root().display())
    };
    let created = created.iter().map(|path| path.display().to_string()).collect::<Vec<_>>();
    CommandResult::success_with(COMMAND, message, json!({ "created": created }))
}

fn render_config(config: &AppConfig, model_name: &str) -> Result<String, toml::ser::Error> {
    let mut model = Table::new();
    model.insert("base_url".to_string(), Value::String(config.model.base_url.clone()));
    model.insert("model".to_string(), Value::String(model_name.to_string()));

    let mut engine = Table::new();
    engine.insert(
        "max_tool_iterations".to_string(),
        Value::Integer(i64::from(config.engine.max_tool_iterations)),
    );

    let mut workspace = Table::new();
    workspace.insert("commit_checkpoints".to_string(), Value::Boolean(config.workspace.commit_checkpoints));

    let mut logging = Table::new();
    logging.insert("level".to_string(), Value::String(config.logging.level.clone()));

    let mut root = Table::new();
    root.insert("model".to_string(), Value::Table(model));
    root.insert("engine".to_string(), Value::Table(engine));
    root.insert("workspace".to_string(), Value::Table(workspace));
    root.insert("logging".to_string(), Value::Table(logging));
    toml::to_string(&root)
}

#[cfg(test)]
mod tests {
    use researchkit_core::config::AppConfig;

    use super::render_config;

    #[test]
    fn rendered_config_round_trips_through_toml() {
        let rendered = render_config(&AppConfig::default(), "qwen2.5:7b").expect("render");
        let parsed = rendered.parse::<toml::Value>().expect("parse");

        assert_eq!(parsed["model"]["model"].as_str(), Some("qwen2.5:7b"));
        assert_eq!(parsed["engine"]["max_tool_iterations"].as_integer(), Some(10));
        assert!(parsed.get("tools").is_none());
    }
}
