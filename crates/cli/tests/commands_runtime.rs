use std::env;
use std::sync::{Mutex, OnceLock};

use researchkit_cli::commands::{config, doctor, init, models};
use researchkit_core::config::{ConfigOverrides, LoadOptions};
use serde_json::Value;
use tempfile::TempDir;

#[test]
fn config_attributes_env_values_and_redacts_api_key() {
    with_env(
        &[("RESEARCHKIT_MODEL", "qwen2.5:7b"), ("RESEARCHKIT_MODEL_API_KEY", "sk-very-secret")],
        || {
            let output = config::run(LoadOptions::default());

            assert!(output.contains("- model.model = qwen2.5:7b (source: env (RESEARCHKIT_MODEL))"));
            assert!(output.contains("- model.api_key = <redacted>"));
            assert!(output.contains("- engine.max_tool_iterations = 10 (source: default)"));
            assert!(!output.contains("sk-very-secret"));
        },
    );
}

#[test]
fn config_flag_overrides_win_over_env() {
    with_env(&[("RESEARCHKIT_MODEL", "qwen2.5:7b")], || {
        let options = LoadOptions {
            overrides: ConfigOverrides { model: Some("mistral-nemo".to_string()), ..ConfigOverrides::default() },
            ..LoadOptions::default()
        };
        let output = config::run(options);

        assert!(output.contains("- model.model = mistral-nemo (source: flag)"));
    });
}

#[test]
fn ollama_url_alias_is_attributed() {
    with_env(&[("OLLAMA_URL", "http://gpu-box:11434")], || {
        let output = config::run(LoadOptions::default());
        assert!(output.contains("- model.base_url = http://gpu-box:11434 (source: env (OLLAMA_URL))"));
    });
}

#[test]
fn doctor_json_reports_config_failure_and_skips_dependent_checks() {
    with_env(&[("RESEARCHKIT_MODEL_TEMPERATURE", "9")], || {
        let payload = parse_payload(&doctor::run(true, LoadOptions::default()));

        assert_eq!(payload["overall_status"], "fail");
        let checks = payload["checks"].as_array().expect("checks array");
        assert_eq!(checks[0]["name"], "config_validation");
        assert_eq!(checks[0]["status"], "fail");

        let status_of = |name: &str| {
            checks
                .iter()
                .find(|check| check["name"] == name)
                .map(|check| check["status"].clone())
                .unwrap_or(Value::Null)
        };
        assert_eq!(status_of("model_endpoint"), "skipped");
        assert_eq!(status_of("workspace"), "skipped");
        assert_ne!(status_of("git"), Value::Null, "git is checked without config");
    });
}

#[test]
fn init_creates_workspace_and_config_once() {
    with_env(&[], || {
        let dir = TempDir::new().expect("tempdir");

        let first = init::run_in(dir.path(), Some("qwen2.5:7b".to_string()), LoadOptions::default());
        assert_eq!(first.exit_code, 0, "{}", first.output);
        let payload = parse_payload(&first.output);
        assert_eq!(payload["command"], "init");
        assert_eq!(payload["details"]["created"].as_array().map(Vec::len), Some(6));

        let config_path = dir.path().join(".researchkit/config/researchkit.toml");
        let written = std::fs::read_to_string(&config_path).expect("config written");
        assert!(written.contains("qwen2.5:7b"));
        assert!(dir.path().join(".researchkit/templates/plan-template.md").is_file());

        let second = init::run_in(dir.path(), Some("llama3.1".to_string()), LoadOptions::default());
        let payload = parse_payload(&second.output);
        assert_eq!(payload["details"]["created"].as_array().map(Vec::len), Some(0));
        assert_eq!(std::fs::read_to_string(&config_path).expect("config kept"), written);
    });
}

#[test]
fn init_rejects_invalid_env_with_config_code() {
    with_env(&[("RESEARCHKIT_MODEL_NUM_CTX", "lots")], || {
        let dir = TempDir::new().expect("tempdir");
        let result = init::run_in(dir.path(), None, LoadOptions::default());

        assert_eq!(result.exit_code, 2);
        let payload = parse_payload(&result.output);
        assert_eq!(payload["error_class"], "config_validation");
        assert!(!dir.path().join(".researchkit").exists());
    });
}

#[test]
fn models_reports_unreachable_endpoint() {
    with_env(&[("RESEARCHKIT_MODEL_BASE_URL", "http://127.0.0.1:9")], || {
        let result = models::run(false, LoadOptions::default());

        assert_eq!(result.exit_code, 3);
        let payload = parse_payload(&result.output);
        assert_eq!(payload["command"], "models");
        assert_eq!(payload["error_class"], "service_unavailable");
    });
}

#[test]
fn missing_explicit_config_file_fails_validation() {
    with_env(&[], || {
        let options = LoadOptions {
            config_path: Some("does-not-exist.toml".into()),
            require_file: true,
            ..LoadOptions::default()
        };
        let result = models::run(true, options);

        assert_eq!(result.exit_code, 2);
        assert_eq!(parse_payload(&result.output)["error_class"], "config_validation");
    });
}

fn parse_payload(output: &str) -> Value {
    serde_json::from_str(output).expect("command output should be valid JSON")
}

fn with_env(vars: &[(&str, &str)], test_fn: impl FnOnce()) {
    static ENV_LOCK: OnceLock<Mutex<()>> = OnceLock::new();
    let _guard =
        ENV_LOCK.get_or_init(|| Mutex::new(())).lock().expect("env mutex should not be poisoned");

    let keys = [
        "OLLAMA_URL",
        "RESEARCHKIT_MODEL",
        "RESEARCHKIT_MODEL_BASE_URL",
        "RESEARCHKIT_MODEL_TEMPERATURE",
        "RESEARCHKIT_MODEL_TOP_P",
        "RESEARCHKIT_MODEL_NUM_CTX",
        "RESEARCHKIT_MODEL_TIMEOUT_SECS",
        "RESEARCHKIT_MODEL_API_KEY",
        "RESEARCHKIT_ENGINE_MAX_TOOL_ITERATIONS",
        "RESEARCHKIT_TOOLS_SEARCH_ENDPOINT",
        "RESEARCHKIT_TOOLS_FETCH_TIMEOUT_SECS",
        "RESEARCHKIT_TOOLS_MAX_CONTENT_CHARS",
        "RESEARCHKIT_TOOLS_USER_AGENT",
        "RESEARCHKIT_TOOLS_PDFTOTEXT_BIN",
        "RESEARCHKIT_WORKSPACE_ROOT_DIR",
        "RESEARCHKIT_WORKSPACE_COMMIT_CHECKPOINTS",
        "RESEARCHKIT_LOGGING_LEVEL",
        "RESEARCHKIT_LOGGING_FORMAT",
        "RESEARCHKIT_LOG_LEVEL",
        "RESEARCHKIT_LOG_FORMAT",
    ];

    let previous_values: Vec<(&str, Option<String>)> =
        keys.iter().map(|key| (*key, env::var(key).ok())).collect();

    for key in &keys {
        env::remove_var(key);
    }
    for (key, value) in vars {
        env::set_var(key, value);
    }

    test_fn();

    for (key, value) in previous_values {
        if let Some(value) = value {
            env::set_var(key, value);
        } else {
            env::remove_var(key);
        }
    }
}
