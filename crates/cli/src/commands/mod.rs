pub mod config;
pub mod doctor;
pub mod init;
pub mod models;
pub mod run;

use researchkit_core::InterfaceError;
use serde::Serialize;
use serde_json::Value;

#[derive(Debug, Clone)]
pub struct CommandResult {
    pub exit_code: u8,
    pub output: String,
}

#[derive(Debug, Serialize)]
struct CommandOutcome {
    command: String,
    status: String,
    error_class: Option<String>,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    correlation_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    details: Option<Value>,
}

impl CommandResult {
    pub fn success(command: &str, message: impl Into<String>) -> Self {
        Self::outcome(command, "ok", None, message, None, None, 0)
    }

    pub fn success_with(command: &str, message: impl Into<String>, details: Value) -> Self {
        Self::outcome(command, "ok", None, message, None, Some(details), 0)
    }

    pub fn failure(
        command: &str,
        error_class: &str,
        message: impl Into<String>,
        exit_code: u8,
    ) -> Self {
        Self::outcome(command, "error", Some(error_class), message, None, None, exit_code)
    }

    pub fn from_interface(command: &str, error: &InterfaceError) -> Self {
        let error_class = match error {
            InterfaceError::BadRequest { .. } => "bad_request",
            InterfaceError::ServiceUnavailable { .. } => "service_unavailable",
            InterfaceError::Internal { .. } => "internal",
        };
        Self::outcome(
            command,
            "error",
            Some(error_class),
            format!("{} ({error})", error.user_message()),
            Some(error.correlation_id().to_string()),
            None,
            error.exit_code(),
        )
    }

    /// Full-form constructor for commands that report more than ok/error.
    pub fn outcome(
        command: &str,
        status: &str,
        error_class: Option<&str>,
        message: impl Into<String>,
        correlation_id: Option<String>,
        details: Option<Value>,
        exit_code: u8,
    ) -> Self {
        let payload = CommandOutcome {
            command: command.to_string(),
            status: status.to_string(),
            error_class: error_class.map(str::to_string),
            message: message.into(),
            correlation_id,
            details,
        };
        Self { exit_code, output: serialize_payload(payload) }
    }
}

fn serialize_payload(payload: CommandOutcome) -> String {
    serde_json::to_string(&payload).unwrap_or_else(|error| {
        format!(
            "{{\"command\":\"unknown\",\"status\":\"error\",\"error_class\":\"serialization\",\"message\":\"{}\"}}",
            error.to_string().replace('\\', "\\\\").replace('"', "\\\"")
        )
    })
}

#[cfg(test)]
mod tests {
    use researchkit_core::ApplicationError;
    use serde_json::{json, Value};

    use super::CommandResult;

    #[test]
    fn interface_errors_carry_exit_code_and_correlation() {
        let error = ApplicationError::Integration("connection refused".to_string()).into_interface("run-9");
        let result = CommandResult::from_interface("run", &error);

        assert_eq!(result.exit_code, 3);
        let payload: Value = serde_json::from_str(&result.output).expect("json");
        assert_eq!(payload["error_class"], "service_unavailable");
        assert_eq!(payload["correlation_id"], "run-9");
    }

    #[test]
    fn details_are_omitted_unless_present() {
        let plain: Value = serde_json::from_str(&CommandResult::success("init", "done").output).expect("json");
        assert!(plain.get("details").is_none());

        let detailed: Value =
            serde_json::from_str(&CommandResult::success_with("init", "done", json!({ "n": 1 })).output)
                .expect("json");
        assert_eq!(detailed["details"]["n"], 1);
    }
}
