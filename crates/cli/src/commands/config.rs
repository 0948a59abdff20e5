use std::env;
use std::fs;
use std::path::Path;

use researchkit_core::config::{AppConfig, LoadOptions};
use toml::Value;

struct Field<'a> {
    key: &'static str,
    value: String,
    env_keys: &'a [&'static str],
    overridden: bool,
}

pub fn run(options: LoadOptions) -> String {
    let overrides = options.overrides.clone();
    let config_file_path = AppConfig::discover_file(options.config_path.as_deref());
    let config = match AppConfig::load(options) {
        Ok(config) => config,
        Err(error) => return format!("config validation failed: {error}"),
    };
    let config_file_doc = load_config_file_doc(config_file_path.as_deref());

    let fields = [
        Field {
            key: "model.base_url",
            value: config.model.base_url.clone(),
            env_keys: &["RESEARCHKIT_MODEL_BASE_URL", "OLLAMA_URL"],
            overridden: overrides.base_url.is_some(),
        },
        Field {
            key: "model.model",
            value: config.model.model.clone(),
            env_keys: &["RESEARCHKIT_MODEL"],
            overridden: overrides.model.is_some(),
        },
        Field {
            key: "model.temperature",
            value: config.model.temperature.to_string(),
            env_keys: &["RESEARCHKIT_MODEL_TEMPERATURE"],
            overridden: false,
        },
        Field {
            key: "model.top_p",
            value: config.model.top_p.to_string(),
            env_keys: &["RESEARCHKIT_MODEL_TOP_P"],
            overridden: false,
        },
        Field {
            key: "model.num_ctx",
            value: config.model.num_ctx.to_string(),
            env_keys: &["RESEARCHKIT_MODEL_NUM_CTX"],
            overridden: false,
        },
        Field {
            key: "model.timeout_secs",
            value: config.model.timeout_secs.to_string(),
            env_keys: &["RESEARCHKIT_MODEL_TIMEOUT_SECS"],
            overridden: false,
        },
        Field {
            key: "model.api_key",
            value: if config.model.api_key.is_some() { "<redacted>" } else { "<unset>" }.to_string(),
            env_keys: &["RESEARCHKIT_MODEL_API_KEY"],
            overridden: false,
        },
        Field {
            key: "engine.max_tool_iterations",
            value: config.engine.max_tool_iterations.to_string(),
            env_keys: &["RESEARCHKIT_ENGINE_MAX_TOOL_ITERATIONS"],
            overridden: overrides.max_tool_iterations.is_some(),
        },
        Field {
            key: "tools.search_endpoint",
            value: config.tools.search_endpoint.clone(),
            env_keys: &["RESEARCHKIT_TOOLS_SEARCH_ENDPOINT"],
            overridden: false,
        },
        Field {
            key: "tools.fetch_timeout_secs",
            value: config.tools.fetch_timeout_secs.to_string(),
            env_keys: &["RESEARCHKIT_TOOLS_FETCH_TIMEOUT_SECS"],
            overridden: false,
        },
        Field {
            key: "tools.max_content_chars",
            value: config.tools.max_content_chars.to_string(),
            env_keys: &["RESEARCHKIT_TOOLS_MAX_CONTENT_CHARS"],
            overridden: false,
        },
        Field {
            key: "tools.user_agent",
            value: config.tools.user_agent.clone(),
            env_keys: &["RESEARCHKIT_TOOLS_USER_AGENT"],
            overridden: false,
        },
        Field {
            key: "tools.pdftotext_bin",
            value: config.tools.pdftotext_bin.clone(),
            env_keys: &["RESEARCHKIT_TOOLS_PDFTOTEXT_BIN"],
            overridden: false,
        },
        Field {
            key: "workspace.root_dir",
            value: config.workspace.root_dir.display().to_string(),
            env_keys: &["RESEARCHKIT_WORKSPACE_ROOT_DIR"],
            overridden: false,
        },
        Field {
            key: "workspace.commit_checkpoints",
            value: config.workspace.commit_checkpoints.to_string(),
            env_keys: &["RESEARCHKIT_WORKSPACE_COMMIT_CHECKPOINTS"],
            overridden: overrides.commit_checkpoints.is_some(),
        },
        Field {
            key: "logging.level",
            value: config.logging.level.clone(),
            env_keys: &["RESEARCHKIT_LOGGING_LEVEL", "RESEARCHKIT_LOG_LEVEL"],
            overridden: overrides.log_level.is_some(),
        },
        Field {
            key: "logging.format",
            value: format!("{:?}", config.logging.format),
            env_keys: &["RESEARCHKIT_LOGGING_FORMAT", "RESEARCHKIT_LOG_FORMAT"],
            overridden: false,
        },
    ];

    let mut lines =
        vec!["effective config (source precedence: flag > env > file > default):".to_string()];
    for field in &fields {
        let source = field_source(field, config_file_doc.as_ref(), config_file_path.as_deref());
        lines.push(render_line(field.key, &field.value, source));
    }
    lines.join("\n")
}

fn load_config_file_doc(path: Option<&Path>) -> Option<Value> {
    let path = path?;
    let raw = fs::read_to_string(path).ok()?;
    raw.parse::<Value>().ok()
}

fn field_source(field: &Field<'_>, config_file_doc: Option<&Value>, config_file_path: Option<&Path>) -> String {
    if field.overridden {
        return "flag".to_string();
    }
    if let Some(env_key) = field.env_keys.iter().find(|key| env::var_os(key).is_some()) {
        return format!("env ({env_key})");
    }

    if let Some(doc) = config_file_doc {
        if contains_path(doc, field.key) {
            let file_path = config_file_path
                .map(|path| path.display().to_string())
                .unwrap_or_else(|| "config file".to_string());
            return format!("file ({file_path})");
        }
    }

    "default".to_string()
}

fn contains_path(root: &Value, key_path: &str) -> bool {
    let mut current = root;
    for key in key_path.split('.') {
        let Some(next) = current.get(key) else {
            return false;
        };
        current = next;
    }
    true
}

fn render_line(key: &str, value: &str, source: String) -> String {
    format!("- {key} = {value} (source: {source})")
}

#[cfg(test)]
mod tests {
    use super::contains_path;

    #[test]
    fn dotted_paths_walk_nested_tables() {
        let doc = "[model]\nmodel = \"qwen2.5\"\n".parse::<toml::Value>().expect("toml");
        assert!(contains_path(&doc, "model.model"));
        assert!(!contains_path(&doc, "model.base_url"));
        assert!(!contains_path(&doc, "logging.level"));
    }
}
