use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const DEFAULT_CONFIG_FILE: &str = "researchkit.toml";
pub const WORKSPACE_CONFIG_FILE: &str = ".researchkit/config/researchkit.toml";

#[derive(Clone, Debug)]
pub struct AppConfig {
    pub model: ModelConfig,
    pub engine: EngineConfig,
    pub tools: ToolsConfig,
    pub workspace: WorkspaceConfig,
    pub logging: LoggingConfig,
}

#[derive(Clone, Debug)]
pub struct ModelConfig {
    pub base_url: String,
    pub model: String,
    pub temperature: f32,
    pub top_p: f32,
    pub num_ctx: u32,
    pub timeout_secs: u64,
    pub api_key: Option<SecretString>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct EngineConfig {
    /// Upper bound on model calls made while answering one user message.
    pub max_tool_iterations: u32,
}

#[derive(Clone, Debug)]
pub struct ToolsConfig {
    pub search_endpoint: String,
    pub fetch_timeout_secs: u64,
    pub max_content_chars: usize,
    pub user_agent: String,
    pub pdftotext_bin: String,
}

#[derive(Clone, Debug)]
pub struct WorkspaceConfig {
    pub root_dir: PathBuf,
    pub commit_checkpoints: bool,
}

#[derive(Clone, Debug)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    Compact,
    Pretty,
    Json,
}

#[derive(Clone, Debug, Default)]
pub struct ConfigOverrides {
    pub model: Option<String>,
    pub base_url: Option<String>,
    pub log_level: Option<String>,
    pub max_tool_iterations: Option<u32>,
    pub commit_checkpoints: Option<bool>,
}

#[derive(Clone, Debug, Default)]
pub struct LoadOptions {
    pub config_path: Option<PathBuf>,
    pub require_file: bool,
    pub overrides: ConfigOverrides,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("could not read config file `{path}`: {source}")]
    ReadFile { path: PathBuf, source: std::io::Error },
    #[error("could not parse config file `{path}`: {source}")]
    ParseFile { path: PathBuf, source: toml::de::Error },
    #[error("required config file was not found: `{0}`")]
    MissingConfigFile(PathBuf),
    #[error("environment variable interpolation failed for `{var}`")]
    MissingEnvInterpolation { var: String },
    #[error("unterminated environment interpolation expression")]
    UnterminatedInterpolation,
    #[error("invalid environment override for `{key}`: `{value}`")]
    InvalidEnvOverride { key: String, value: String },
    #[error("configuration validation failed: {0}")]
    Validation(String),
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            model: ModelConfig {
                base_url: "http://localhost:11434".to_string(),
                model: "llama3.1".to_string(),
                temperature: 0.7,
                top_p: 0.9,
                num_ctx: 4096,
                timeout_secs: 120,
                api_key: None,
            },
            engine: EngineConfig::default(),
            tools: ToolsConfig {
                search_endpoint: "https://api.duckduckgo.com/".to_string(),
                fetch_timeout_secs: 30,
                max_content_chars: 10_000,
                user_agent: format!("researchkit/{}", env!("CARGO_PKG_VERSION")),
                pdftotext_bin: "pdftotext".to_string(),
            },
            workspace: WorkspaceConfig {
                root_dir: PathBuf::from(".researchkit"),
                commit_checkpoints: true,
            },
            logging: LoggingConfig { level: "warn".to_string(), format: LogFormat::Compact },
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self { max_tool_iterations: 10 }
    }
}

fn secret_value(value: String) -> SecretString {
    value.into()
}

impl std::str::FromStr for LogFormat {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "compact" => Ok(Self::Compact),
            "pretty" => Ok(Self::Pretty),
            "json" => Ok(Self::Json),
            other => Err(ConfigError::Validation(format!(
                "unsupported log format `{other}` (expected compact|pretty|json)"
            ))),
        }
    }
}

impl AppConfig {
    pub fn load(options: LoadOptions) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        let maybe_path = resolve_config_path(options.config_path.as_deref());

        if let Some(path) = maybe_path {
            let patch = read_patch(&path)?;
            config.apply_patch(patch);
        } else if options.require_file {
            let expected =
                options.config_path.unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE));
            return Err(ConfigError::MissingConfigFile(expected));
        }

        config.apply_env_overrides()?;
        config.apply_overrides(options.overrides);
        config.validate()?;

        Ok(config)
    }

    /// First config file that `load` would read, if any.
    pub fn discover_file(explicit_path: Option<&Path>) -> Option<PathBuf> {
        resolve_config_path(explicit_path)
    }

    fn apply_patch(&mut self, patch: ConfigPatch) {
        if let Some(model) = patch.model {
            if let Some(base_url) = model.base_url {
                self.model.base_url = base_url;
            }
            if let Some(name) = model.model {
                self.model.model = name;
            }
            if let Some(temperature) = model.temperature {
                self.model.temperature = temperature;
            }
            if let Some(top_p) = model.top_p {
                self.model.top_p = top_p;
            }
            if let Some(num_ctx) = model.num_ctx {
                self.model.num_ctx = num_ctx;
            }
            if let Some(timeout_secs) = model.timeout_secs {
                self.model.timeout_secs = timeout_secs;
            }
            if let Some(model_api_key_value) = model.api_key {
                self.model.api_key = Some(secret_value(model_api_key_value));
            }
        }

        if let Some(engine) = patch.engine {
            if let Some(max_tool_iterations) = engine.max_tool_iterations {
                self.engine.max_tool_iterations = max_tool_iterations;
            }
        }

        if let Some(tools) = patch.tools {
            if let Some(search_endpoint) = tools.search_endpoint {
                self.tools.search_endpoint = search_endpoint;
            }
            if let Some(fetch_timeout_secs) = tools.fetch_timeout_secs {
                self.tools.fetch_timeout_secs = fetch_timeout_secs;
            }
            if let Some(max_content_chars) = tools.max_content_chars {
                self.tools.max_content_chars = max_content_chars;
            }
            if let Some(user_agent) = tools.user_agent {
                self.tools.user_agent = user_agent;
            }
            if let Some(pdftotext_bin) = tools.pdftotext_bin {
                self.tools.pdftotext_bin = pdftotext_bin;
            }
        }

        if let Some(workspace) = patch.workspace {
            if let Some(root_dir) = workspace.root_dir {
                self.workspace.root_dir = root_dir;
            }
            if let Some(commit_checkpoints) = workspace.commit_checkpoints {
                self.workspace.commit_checkpoints = commit_checkpoints;
            }
        }

        if let Some(logging) = patch.logging {
            if let Some(level) = logging.level {
                self.logging.level = level;
            }
            if let Some(format) = logging.format {
                self.logging.format = format;
            }
        }
    }

    fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        let base_url = read_env("RESEARCHKIT_MODEL_BASE_URL").or_else(|| read_env("OLLAMA_URL"));
        if let Some(value) = base_url {
            self.model.base_url = value;
        }
        if let Some(value) = read_env("RESEARCHKIT_MODEL") {
            self.model.model = value;
        }
        if let Some(value) = read_env("RESEARCHKIT_MODEL_TEMPERATURE") {
            self.model.temperature = parse_f32("RESEARCHKIT_MODEL_TEMPERATURE", &value)?;
        }
        if let Some(value) = read_env("RESEARCHKIT_MODEL_TOP_P") {
            self.model.top_p = parse_f32("RESEARCHKIT_MODEL_TOP_P", &value)?;
        }
        if let Some(value) = read_env("RESEARCHKIT_MODEL_NUM_CTX") {
            self.model.num_ctx = parse_u32("RESEARCHKIT_MODEL_NUM_CTX", &value)?;
        }
        if let Some(value) = read_env("RESEARCHKIT_MODEL_TIMEOUT_SECS") {
            self.model.timeout_secs = parse_u64("RESEARCHKIT_MODEL_TIMEOUT_SECS", &value)?;
        }
        if let Some(value) = read_env("RESEARCHKIT_MODEL_API_KEY") {
            self.model.api_key = Some(secret_value(value));
        }

        if let Some(value) = read_env("RESEARCHKIT_ENGINE_MAX_TOOL_ITERATIONS") {
            self.engine.max_tool_iterations =
                parse_u32("RESEARCHKIT_ENGINE_MAX_TOOL_ITERATIONS", &value)?;
        }

        if let Some(value) = read_env("RESEARCHKIT_TOOLS_SEARCH_ENDPOINT") {
            self.tools.search_endpoint = value;
        }
        if let Some(value) = read_env("RESEARCHKIT_TOOLS_FETCH_TIMEOUT_SECS") {
            self.tools.fetch_timeout_secs =
                parse_u64("RESEARCHKIT_TOOLS_FETCH_TIMEOUT_SECS", &value)?;
        }
        if let Some(value) = read_env("RESEARCHKIT_TOOLS_MAX_CONTENT_CHARS") {
            self.tools.max_content_chars =
                parse_usize("RESEARCHKIT_TOOLS_MAX_CONTENT_CHARS", &value)?;
        }
        if let Some(value) = read_env("RESEARCHKIT_TOOLS_USER_AGENT") {
            self.tools.user_agent = value;
        }
        if let Some(value) = read_env("RESEARCHKIT_TOOLS_PDFTOTEXT_BIN") {
            self.tools.pdftotext_bin = value;
        }

        if let Some(value) = read_env("RESEARCHKIT_WORKSPACE_ROOT_DIR") {
            self.workspace.root_dir = PathBuf::from(value);
        }
        if let Some(value) = read_env("RESEARCHKIT_WORKSPACE_COMMIT_CHECKPOINTS") {
            self.workspace.commit_checkpoints =
                parse_bool("RESEARCHKIT_WORKSPACE_COMMIT_CHECKPOINTS", &value)?;
        }

        let log_level =
            read_env("RESEARCHKIT_LOGGING_LEVEL").or_else(|| read_env("RESEARCHKIT_LOG_LEVEL"));
        if let Some(value) = log_level {
            self.logging.level = value;
        }
        let log_format =
            read_env("RESEARCHKIT_LOGGING_FORMAT").or_else(|| read_env("RESEARCHKIT_LOG_FORMAT"));
        if let Some(value) = log_format {
            self.logging.format = value.parse()?;
        }

        Ok(())
    }

    fn apply_overrides(&mut self, overrides: ConfigOverrides) {
        if let Some(model) = overrides.model {
            self.model.model = model;
        }
        if let Some(base_url) = overrides.base_url {
            self.model.base_url = base_url;
        }
        if let Some(log_level) = overrides.log_level {
            self.logging.level = log_level;
        }
        if let Some(max_tool_iterations) = overrides.max_tool_iterations {
            self.engine.max_tool_iterations = max_tool_iterations;
        }
        if let Some(commit_checkpoints) = overrides.commit_checkpoints {
            self.workspace.commit_checkpoints = commit_checkpoints;
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_model(&self.model)?;
        validate_engine(&self.engine)?;
        validate_tools(&self.tools)?;
        validate_workspace(&self.workspace)?;
        validate_logging(&self.logging)?;
        Ok(())
    }
}

fn resolve_config_path(explicit_path: Option<&Path>) -> Option<PathBuf> {
    if let Some(path) = explicit_path {
        return path.exists().then_some(path.to_path_buf());
    }

    [PathBuf::from(DEFAULT_CONFIG_FILE), PathBuf::from(WORKSPACE_CONFIG_FILE)]
        .into_iter()
        .find(|path| path.exists())
}

fn read_patch(path: &Path) -> Result<ConfigPatch, ConfigError> {
    let raw = fs::read_to_string(path)
        .map_err(|source| ConfigError::ReadFile { path: path.to_path_buf(), source })?;

    let interpolated = interpolate_env_vars(&raw)?;
    toml::from_str::<ConfigPatch>(&interpolated)
        .map_err(|source| ConfigError::ParseFile { path: path.to_path_buf(), source })
}

fn interpolate_env_vars(input: &str) -> Result<String, ConfigError> {
    let mut output = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(ch) = chars.next() {
        if ch == '$' && matches!(chars.peek(), Some('{')) {
            chars.next();
            let mut key = String::new();

            loop {
                match chars.next() {
                    Some('}') => break,
                    Some(next) => key.push(next),
                    None => return Err(ConfigError::UnterminatedInterpolation),
                }
            }

            let value = env::var(&key)
                .map_err(|_| ConfigError::MissingEnvInterpolation { var: key.clone() })?;
            output.push_str(&value);
            continue;
        }

        output.push(ch);
    }

    Ok(output)
}

fn is_http_url(value: &str) -> bool {
    value.starts_with("http://") || value.starts_with("https://")
}

fn validate_model(model: &ModelConfig) -> Result<(), ConfigError> {
    if model.model.trim().is_empty() {
        return Err(ConfigError::Validation(
            "model.model is required. Run `researchkit models` to list installed models"
                .to_string(),
        ));
    }

    if !is_http_url(model.base_url.trim()) {
        return Err(ConfigError::Validation(
            "model.base_url must start with http:// or https://".to_string(),
        ));
    }

    if !(0.0..=2.0).contains(&model.temperature) {
        return Err(ConfigError::Validation(
            "model.temperature must be in range 0.0..=2.0".to_string(),
        ));
    }

    if !(0.0..=1.0).contains(&model.top_p) {
        return Err(ConfigError::Validation("model.top_p must be in range 0.0..=1.0".to_string()));
    }

    if model.num_ctx < 512 {
        return Err(ConfigError::Validation("model.num_ctx must be at least 512".to_string()));
    }

    if model.timeout_secs == 0 || model.timeout_secs > 600 {
        return Err(ConfigError::Validation(
            "model.timeout_secs must be in range 1..=600".to_string(),
        ));
    }

    if let Some(api_key) = &model.api_key {
        if api_key.expose_secret().trim().is_empty() {
            return Err(ConfigError::Validation(
                "model.api_key must not be blank when set".to_string(),
            ));
        }
    }

    Ok(())
}

fn validate_engine(engine: &EngineConfig) -> Result<(), ConfigError> {
    if engine.max_tool_iterations == 0 || engine.max_tool_iterations > 100 {
        return Err(ConfigError::Validation(
            "engine.max_tool_iterations must be in range 1..=100".to_string(),
        ));
    }
    Ok(())
}

fn validate_tools(tools: &ToolsConfig) -> Result<(), ConfigError> {
    if !is_http_url(tools.search_endpoint.trim()) {
        return Err(ConfigError::Validation(
            "tools.search_endpoint must start with http:// or https://".to_string(),
        ));
    }

    if tools.fetch_timeout_secs == 0 || tools.fetch_timeout_secs > 300 {
        return Err(ConfigError::Validation(
            "tools.fetch_timeout_secs must be in range 1..=300".to_string(),
        ));
    }

    if tools.max_content_chars < 100 {
        return Err(ConfigError::Validation(
            "tools.max_content_chars must be at least 100".to_string(),
        ));
    }

    if tools.pdftotext_bin.trim().is_empty() {
        return Err(ConfigError::Validation("tools.pdftotext_bin must not be empty".to_string()));
    }

    Ok(())
}

fn validate_workspace(workspace: &WorkspaceConfig) -> Result<(), ConfigError> {
    if workspace.root_dir.as_os_str().is_empty() {
        return Err(ConfigError::Validation("workspace.root_dir must not be empty".to_string()));
    }
    Ok(())
}

fn validate_logging(logging: &LoggingConfig) -> Result<(), ConfigError> {
    let level = logging.level.trim().to_ascii_lowercase();
    match level.as_str() {
        "trace" | "debug" | "info" | "warn" | "error" => Ok(()),
        _ => Err(ConfigError::Validation(
            "logging.level must be one of trace|debug|info|warn|error".to_string(),
        )),
    }
}

fn read_env(key: &str) -> Option<String> {
    env::var(key).ok().filter(|value| !value.trim().is_empty())
}

fn invalid_override(key: &str, value: &str) -> ConfigError {
    ConfigError::InvalidEnvOverride { key: key.to_string(), value: value.to_string() }
}

fn parse_u32(key: &str, value: &str) -> Result<u32, ConfigError> {
    value.trim().parse::<u32>().map_err(|_| invalid_override(key, value))
}

fn parse_u64(key: &str, value: &str) -> Result<u64, ConfigError> {
    value.trim().parse::<u64>().map_err(|_| invalid_override(key, value))
}

fn parse_usize(key: &str, value: &str) -> Result<usize, ConfigError> {
    value.trim().parse::<usize>().map_err(|_| invalid_override(key, value))
}

fn parse_f32(key: &str, value: &str) -> Result<f32, ConfigError> {
    value.trim().parse::<f32>().map_err(|_| invalid_override(key, value))
}

fn parse_bool(key: &str, value: &str) -> Result<bool, ConfigError> {
    value.trim().parse::<bool>().map_err(|_| invalid_override(key, value))
}

#[derive(Debug, Default, Deserialize)]
struct ConfigPatch {
    model: Option<ModelPatch>,
    engine: Option<EnginePatch>,
    tools: Option<ToolsPatch>,
    workspace: Option<WorkspacePatch>,
    logging: Option<LoggingPatch>,
}

#[derive(Debug, Default, Deserialize)]
struct ModelPatch {
    base_url: Option<String>,
    model: Option<String>,
    temperature: Option<f32>,
    top_p: Option<f32>,
    num_ctx: Option<u32>,
    timeout_secs: Option<u64>,
    api_key: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct EnginePatch {
    max_tool_iterations: Option<u32>,
}

#[derive(Debug, Default, Deserialize)]
struct ToolsPatch {
    search_endpoint: Option<String>,
    fetch_timeout_secs: Option<u64>,
    max_content_chars: Option<usize>,
    user_agent: Option<String>,
    pdftotext_bin: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct WorkspacePatch {
    root_dir: Option<PathBuf>,
    commit_checkpoints: Option<bool>,
}

#[derive(Debug, Default, Deserialize)]
struct LoggingPatch {
    level: Option<String>,
    format: Option<LogFormat>,
}

#[cfg(test)]
mod tests {
    use std::env;
    use std::fs;
    use std::io;
    use std::sync::{Mutex, OnceLock};

    use secrecy::ExposeSecret;
    use tempfile::TempDir;

    use super::{AppConfig, ConfigError, ConfigOverrides, LoadOptions, LogFormat};

    static ENV_LOCK: OnceLock<Mutex<()>> = OnceLock::new();

    fn env_lock() -> &'static Mutex<()> {
        ENV_LOCK.get_or_init(|| Mutex::new(()))
    }

    fn clear_vars(vars: &[&str]) {
        for var in vars {
            env::remove_var(var);
        }
    }

    fn ensure(condition: bool, message: &'static str) -> Result<(), String> {
        if condition {
            Ok(())
        } else {
            Err(message.to_string())
        }
    }

    #[test]
    fn defaults_validate_without_a_file() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        let config = AppConfig::load(LoadOptions::default())
            .map_err(|err| format!("config load failed: {err}"))?;

        ensure(config.model.model == "llama3.1", "default model should be llama3.1")?;
        ensure(config.engine.max_tool_iterations == 10, "default iteration bound should be 10")?;
        ensure(config.tools.max_content_chars == 10_000, "default content cap should be 10000")?;
        ensure(config.logging.level == "warn", "default log level should be warn")?;
        ensure(
            matches!(config.logging.format, LogFormat::Compact),
            "default logging format should be compact",
        )
    }

    #[test]
    fn file_load_supports_env_interpolation() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        env::set_var("TEST_RESEARCH_MODEL", "qwen2.5:14b");
        env::set_var("TEST_RESEARCH_TOKEN", "token-from-env");

        let result = (|| -> Result<(), String> {
            let dir = TempDir::new().map_err(|err: io::Error| err.to_string())?;
            let path = dir.path().join("researchkit.toml");
            fs::write(
                &path,
                r#"
[model]
model = "${TEST_RESEARCH_MODEL}"
api_key = "${TEST_RESEARCH_TOKEN}"
"#,
            )
            .map_err(|err| err.to_string())?;

            let config =
                AppConfig::load(LoadOptions { config_path: Some(path), ..LoadOptions::default() })
                    .map_err(|err| format!("config load failed: {err}"))?;

            ensure(config.model.model == "qwen2.5:14b", "model should be interpolated")?;
            ensure(
                config.model.api_key.as_ref().map(|key| key.expose_secret() == "token-from-env")
                    == Some(true),
                "api key should be loaded from environment",
            )?;
            Ok(())
        })();

        clear_vars(&["TEST_RESEARCH_MODEL", "TEST_RESEARCH_TOKEN"]);
        result
    }

    #[test]
    fn missing_interpolation_variable_is_reported() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;
        env::remove_var("TEST_RESEARCH_UNSET");

        let dir = TempDir::new().map_err(|err: io::Error| err.to_string())?;
        let path = dir.path().join("researchkit.toml");
        fs::write(&path, "[model]\nmodel = \"${TEST_RESEARCH_UNSET}\"\n")
            .map_err(|err| err.to_string())?;

        let error = match AppConfig::load(LoadOptions {
            config_path: Some(path),
            ..LoadOptions::default()
        }) {
            Ok(_) => return Err("expected interpolation failure".to_string()),
            Err(error) => error,
        };
        ensure(
            matches!(error, ConfigError::MissingEnvInterpolation { ref var } if var == "TEST_RESEARCH_UNSET"),
            "interpolation error should name the variable",
        )
    }

    #[test]
    fn ollama_url_alias_and_log_aliases_are_supported() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        env::set_var("OLLAMA_URL", "http://gpu-box:11434");
        env::set_var("RESEARCHKIT_LOG_LEVEL", "debug");
        env::set_var("RESEARCHKIT_LOG_FORMAT", "pretty");

        let result = (|| -> Result<(), String> {
            let config = AppConfig::load(LoadOptions::default())
                .map_err(|err| format!("config load failed: {err}"))?;

            ensure(
                config.model.base_url == "http://gpu-box:11434",
                "OLLAMA_URL should set the model endpoint",
            )?;
            ensure(config.logging.level == "debug", "debug log level should be set from env var")?;
            ensure(
                matches!(config.logging.format, LogFormat::Pretty),
                "pretty logging format should be set from env var",
            )?;
            Ok(())
        })();

        clear_vars(&["OLLAMA_URL", "RESEARCHKIT_LOG_LEVEL", "RESEARCHKIT_LOG_FORMAT"]);
        result
    }

    #[test]
    fn precedence_defaults_file_env_overrides() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        env::set_var("RESEARCHKIT_MODEL_BASE_URL", "http://from-env:11434");
        env::set_var("RESEARCHKIT_ENGINE_MAX_TOOL_ITERATIONS", "25");

        let result = (|| -> Result<(), String> {
            let dir = TempDir::new().map_err(|err: io::Error| err.to_string())?;
            let path = dir.path().join("researchkit.toml");
            fs::write(
                &path,
                r#"
[model]
base_url = "http://from-file:11434"
model = "mistral-nemo"

[engine]
max_tool_iterations = 5

[logging]
level = "info"
"#,
            )
            .map_err(|err| err.to_string())?;

            let config = AppConfig::load(LoadOptions {
                config_path: Some(path),
                overrides: ConfigOverrides {
                    model: Some("llama3.2".to_string()),
                    log_level: Some("error".to_string()),
                    ..ConfigOverrides::default()
                },
                ..LoadOptions::default()
            })
            .map_err(|err| format!("config load failed: {err}"))?;

            ensure(config.model.model == "llama3.2", "override model should win")?;
            ensure(config.logging.level == "error", "overridden log level should be error")?;
            ensure(
                config.model.base_url == "http://from-env:11434",
                "env base url should win over file and defaults",
            )?;
            ensure(
                config.engine.max_tool_iterations == 25,
                "env iteration bound should win over file",
            )?;
            Ok(())
        })();

        clear_vars(&["RESEARCHKIT_MODEL_BASE_URL", "RESEARCHKIT_ENGINE_MAX_TOOL_ITERATIONS"]);
        result
    }

    #[test]
    fn validation_fails_fast_with_actionable_error() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        env::set_var("RESEARCHKIT_MODEL_TEMPERATURE", "3.5");

        let result = (|| -> Result<(), String> {
            let error = match AppConfig::load(LoadOptions::default()) {
                Ok(_) => {
                    return Err("expected validation failure but config load succeeded".to_string())
                }
                Err(error) => error,
            };
            let has_message = matches!(
                error,
                ConfigError::Validation(ref message) if message.contains("model.temperature")
            );
            ensure(has_message, "validation failure should mention model.temperature")
        })();

        clear_vars(&["RESEARCHKIT_MODEL_TEMPERATURE"]);
        result
    }

    #[test]
    fn iteration_bound_outside_range_is_rejected() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        let error = match AppConfig::load(LoadOptions {
            overrides: ConfigOverrides {
                max_tool_iterations: Some(0),
                ..ConfigOverrides::default()
            },
            ..LoadOptions::default()
        }) {
            Ok(_) => return Err("zero iterations must be rejected".to_string()),
            Err(error) => error,
        };
        ensure(
            matches!(error, ConfigError::Validation(ref message) if message.contains("max_tool_iterations")),
            "validation failure should mention engine.max_tool_iterations",
        )
    }

    #[test]
    fn non_numeric_env_override_is_reported() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        env::set_var("RESEARCHKIT_MODEL_NUM_CTX", "lots");
        let result = match AppConfig::load(LoadOptions::default()) {
            Ok(_) => Err("expected override failure".to_string()),
            Err(error) => ensure(
                matches!(error, ConfigError::InvalidEnvOverride { ref key, .. } if key == "RESEARCHKIT_MODEL_NUM_CTX"),
                "error should name the offending variable",
            ),
        };

        clear_vars(&["RESEARCHKIT_MODEL_NUM_CTX"]);
        result
    }

    #[test]
    fn secret_values_are_not_leaked_by_debug() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        env::set_var("RESEARCHKIT_MODEL_API_KEY", "sk-secret-value");

        let result = (|| -> Result<(), String> {
            let config = AppConfig::load(LoadOptions::default())
                .map_err(|err| format!("config load failed: {err}"))?;
            let debug = format!("{config:?}");

            ensure(!debug.contains("sk-secret-value"), "debug output should not contain api key")
        })();

        clear_vars(&["RESEARCHKIT_MODEL_API_KEY"]);
        result
    }

    #[test]
    fn required_file_must_exist() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;
        let dir = TempDir::new().map_err(|err: io::Error| err.to_string())?;
        let missing = dir.path().join("absent.toml");

        let error = match AppConfig::load(LoadOptions {
            config_path: Some(missing.clone()),
            require_file: true,
            ..LoadOptions::default()
        }) {
            Ok(_) => return Err("expected missing file failure".to_string()),
            Err(error) => error,
        };
        ensure(
            matches!(error, ConfigError::MissingConfigFile(ref path) if *path == missing),
            "missing file error should carry the requested path",
        )
    }
}
