use researchkit_agent::llm::supports_tools;
use researchkit_agent::{ModelError, OllamaClient};
use researchkit_core::config::{AppConfig, LoadOptions};
use serde_json::json;

use crate::commands::CommandResult;

const COMMAND: &str = "models";

pub fn run(all: bool, options: LoadOptions) -> CommandResult {
    let config = match AppConfig::load(options) {
        Ok(config) => config,
        Err(error) => {
            return CommandResult::failure(COMMAND, "config_validation", error.to_string(), 2)
        }
    };

    let client = match OllamaClient::from_config(&config.model) {
        Ok(client) => client,
        Err(error) => return model_failure(&error),
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

    match runtime.block_on(client.list_models(!all)) {
        Ok(models) => {
            let message = if models.is_empty() && !all {
                "no tool-capable models installed; pass --all to list every model".to_string()
            } else {
                format!("{} model(s) available at `{}`", models.len(), client.base_url())
            };
            CommandResult::success_with(
                COMMAND,
                message,
                json!({
                    "base_url": client.base_url(),
                    "configured": client.model(),
                    "configured_supports_tools": supports_tools(client.model()),
                    "models": models,
                }),
            )
        }
        Err(error) => model_failure(&error),
    }
}

fn model_failure(error: &ModelError) -> CommandResult {
    match error {
        ModelError::ServiceUnavailable(_) => {
            CommandResult::failure(COMMAND, "service_unavailable", error.to_string(), 3)
        }
        ModelError::Protocol(_) => CommandResult::failure(COMMAND, "protocol", error.to_string(), 1),
    }
}
