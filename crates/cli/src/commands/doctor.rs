use std::path::Path;

use researchkit_agent::llm::supports_tools;
use researchkit_agent::OllamaClient;
use researchkit_core::config::{AppConfig, LoadOptions};
use serde::Serialize;

use crate::adapters::workspace::FsWorkspace;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
enum CheckStatus {
    Pass,
    Fail,
    Skipped,
}

#[derive(Debug, Serialize)]
struct DoctorCheck {
    name: &'static str,
    status: CheckStatus,
    details: String,
}

impl DoctorCheck {
    fn pass(name: &'static str, details: impl Into<String>) -> Self {
        Self { name, status: CheckStatus::Pass, details: details.into() }
    }

    fn fail(name: &'static str, details: impl Into<String>) -> Self {
        Self { name, status: CheckStatus::Fail, details: details.into() }
    }

    fn skipped(name: &'static str, details: impl Into<String>) -> Self {
        Self { name, status: CheckStatus::Skipped, details: details.into() }
    }
}

#[derive(Debug, Serialize)]
struct DoctorReport {
    overall_status: CheckStatus,
    summary: String,
    checks: Vec<DoctorCheck>,
}

pub fn run(json_output: bool, options: LoadOptions) -> String {
    let report = build_report(options);

    if json_output {
        return serde_json::to_string_pretty(&report).unwrap_or_else(|error| {
            format!(
                "{{\"overall_status\":\"fail\",\"summary\":\"doctor serialization failed\",\"error\":\"{}\"}}",
                escape_json(&error.to_string())
            )
        });
    }

    render_human(&report)
}

fn build_report(options: LoadOptions) -> DoctorReport {
    let mut checks = Vec::new();

    match AppConfig::load(options) {
        Ok(config) => {
            checks.push(DoctorCheck::pass("config_validation", "configuration loaded and validated"));
            checks.extend(check_model(&config));
            checks.push(check_git());
            checks.push(check_pdftotext(&config));
            checks.push(check_workspace(&config));
        }
        Err(error) => {
            checks.push(DoctorCheck::fail("config_validation", error.to_string()));
            for name in ["model_endpoint", "model_available"] {
                checks.push(DoctorCheck::skipped(name, "skipped because configuration did not load"));
            }
            checks.push(check_git());
            for name in ["pdftotext", "workspace"] {
                checks.push(DoctorCheck::skipped(name, "skipped because configuration did not load"));
            }
        }
    }

    let all_pass = checks.iter().all(|check| check.status == CheckStatus::Pass);
    let overall_status = if all_pass { CheckStatus::Pass } else { CheckStatus::Fail };
    let summary = if all_pass {
        "doctor: all readiness checks passed".to_string()
    } else {
        "doctor: one or more readiness checks failed".to_string()
    };

    DoctorReport { overall_status, summary, checks }
}

fn check_model(config: &AppConfig) -> Vec<DoctorCheck> {
    let client = match OllamaClient::from_config(&config.model) {
        Ok(client) => client,
        Err(error) => {
            return vec![
                DoctorCheck::fail("model_endpoint", error.to_string()),
                DoctorCheck::skipped("model_available", "skipped because the model client did not build"),
            ];
        }
    };

    let runtime = match tokio::runtime::Builder::new_current_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(error) => {
            return vec![
                DoctorCheck::fail("model_endpoint", format!("failed to initialize async runtime: {error}")),
                DoctorCheck::skipped("model_available", "skipped because the endpoint was not checked"),
            ];
        }
    };

    if let Err(error) = runtime.block_on(client.ping()) {
        return vec![
            DoctorCheck::fail("model_endpoint", format!("`{}`: {error}", client.base_url())),
            DoctorCheck::skipped("model_available", "skipped because the endpoint is unreachable"),
        ];
    }
    let endpoint = DoctorCheck::pass("model_endpoint", format!("reached `{}`", client.base_url()));

    let available = match runtime.block_on(client.list_models(false)) {
        Ok(models) if !models.iter().any(|name| is_same_model(name, client.model())) => DoctorCheck::fail(
            "model_available",
            format!("`{}` is not installed; run `ollama pull {}`", client.model(), client.model()),
        ),
        Ok(_) if !supports_tools(client.model()) => DoctorCheck::fail(
            "model_available",
            format!("`{}` is installed but not known to support tool calling", client.model()),
        ),
        Ok(_) => DoctorCheck::pass("model_available", format!("`{}` is installed and tool-capable", client.model())),
        Err(error) => DoctorCheck::fail("model_available", error.to_string()),
    };

    vec![endpoint, available]
}

/// `llama3.1` matches an installed `llama3.1:latest`.
fn is_same_model(installed: &str, configured: &str) -> bool {
    installed == configured
        || (!configured.contains(':')
            && installed.split_once(':').map(|(base, _)| base == configured).unwrap_or(false))
}

fn check_git() -> DoctorCheck {
    match which::which("git") {
        Ok(path) => DoctorCheck::pass("git", format!("found `{}`", path.display())),
        Err(_) => DoctorCheck::fail("git", "`git` not found on PATH; checkpoints will be disabled"),
    }
}

fn check_pdftotext(config: &AppConfig) -> DoctorCheck {
    match which::which(&config.tools.pdftotext_bin) {
        Ok(path) => DoctorCheck::pass("pdftotext", format!("found `{}`", path.display())),
        Err(_) => DoctorCheck::fail(
            "pdftotext",
            format!("`{}` not found; parse_pdf will report the tool as unavailable", config.tools.pdftotext_bin),
        ),
    }
}

fn check_workspace(config: &AppConfig) -> DoctorCheck {
    let project_dir = match std::env::current_dir() {
        Ok(dir) => dir,
        Err(error) => return DoctorCheck::fail("workspace", error.to_string()),
    };
    workspace_check(&project_dir, config)
}

fn workspace_check(project_dir: &Path, config: &AppConfig) -> DoctorCheck {
    let workspace = FsWorkspace::new(project_dir, &config.workspace.root_dir);
    if workspace.exists() {
        DoctorCheck::pass("workspace", format!("found `{}`", workspace.root().display()))
    } else {
        DoctorCheck::fail(
            "workspace",
            format!("`{}` does not exist; run `researchkit init`", workspace.root().display()),
        )
    }
}

fn render_human(report: &DoctorReport) -> String {
    let mut lines = Vec::new();
    lines.push(report.summary.clone());

    for check in &report.checks {
        let marker = match check.status {
            CheckStatus::Pass => "ok",
            CheckStatus::Fail => "fail",
            CheckStatus::Skipped => "skip",
        };
        lines.push(format!("- [{marker}] {}: {}", check.name, check.details));
    }

    lines.join("\n")
}

fn escape_json(value: &str) -> String {
    value.replace('\\', "\\\\").replace('"', "\\\"")
}

#[cfg(test)]
mod tests {
    use researchkit_core::config::AppConfig;
    use tempfile::TempDir;

    use super::{is_same_model, render_human, workspace_check, CheckStatus, DoctorCheck, DoctorReport};

    #[test]
    fn untagged_model_matches_latest_tag() {
        assert!(is_same_model("llama3.1:latest", "llama3.1"));
        assert!(is_same_model("qwen2.5:7b", "qwen2.5:7b"));
        assert!(!is_same_model("qwen2.5:14b", "qwen2.5:7b"));
        assert!(!is_same_model("llama3.2:latest", "llama3.1"));
    }

    #[test]
    fn missing_workspace_points_at_init() {
        let dir = TempDir::new().expect("tempdir");
        let check = workspace_check(dir.path(), &AppConfig::default());

        assert_eq!(check.status, CheckStatus::Fail);
        assert!(check.details.contains("researchkit init"));
    }

    #[test]
    fn human_output_marks_each_check() {
        let report = DoctorReport {
            overall_status: CheckStatus::Fail,
            summary: "doctor: one or more readiness checks failed".to_string(),
            checks: vec![
                DoctorCheck::pass("config_validation", "ok"),
                DoctorCheck::skipped("model_available", "endpoint down"),
            ],
        };
        let rendered = render_human(&report);

        assert!(rendered.contains("- [ok] config_validation: ok"));
        assert!(rendered.contains("- [skip] model_available: endpoint down"));
    }
}
