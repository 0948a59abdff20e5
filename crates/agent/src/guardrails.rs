use std::path::{Component, Path};

use serde_json::{Map, Value};

use crate::tools::ToolKind;

#[derive(Clone, Debug, PartialEq)]
pub enum GuardrailDecision {
    /// Dispatch with the normalized arguments.
    Allow { arguments: Map<String, Value> },
    Deny { reason_code: &'static str, message: String },
}

/// Argument checks applied before any model-requested tool runs.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GuardrailPolicy {
    pub default_search_results: u64,
    pub max_search_results: u64,
}

impl Default for GuardrailPolicy {
    fn default() -> Self {
        Self { default_search_results: 10, max_search_results: 25 }
    }
}

impl GuardrailPolicy {
    pub fn evaluate(&self, kind: ToolKind, arguments: &Map<String, Value>) -> GuardrailDecision {
        let mut normalized = arguments.clone();
        let checked = match kind {
            ToolKind::WebSearch => self.check_search(&mut normalized),
            ToolKind::FetchUrl => check_url(&normalized).and_then(|()| {
                check_optional_bool(&mut normalized, "extract_text", true)
            }),
            ToolKind::ParsePdf => {
                check_url(&normalized).and_then(|()| check_save_path(&normalized))
            }
        };
        match checked {
            Ok(()) => GuardrailDecision::Allow { arguments: normalized },
            Err((reason_code, message)) => GuardrailDecision::Deny { reason_code, message },
        }
    }

    fn check_search(&self, arguments: &mut Map<String, Value>) -> Result<(), Denial> {
        required_str(arguments, "query")?;
        let requested = match arguments.get("max_results") {
            None | Some(Value::Null) => self.default_search_results,
            Some(value) => value.as_u64().ok_or((
                "invalid_max_results",
                "`max_results` must be a positive integer".to_string(),
            ))?,
        };
        let clamped = requested.clamp(1, self.max_search_results);
        arguments.insert("max_results".to_string(), Value::from(clamped));
        Ok(())
    }
}

type Denial = (&'static str, String);

fn required_str<'a>(arguments: &'a Map<String, Value>, key: &str) -> Result<&'a str, Denial> {
    match arguments.get(key).and_then(Value::as_str).map(str::trim) {
        Some(value) if !value.is_empty() => Ok(value),
        _ => Err(("missing_argument", format!("`{key}` is required and must be a non-empty string"))),
    }
}

fn check_url(arguments: &Map<String, Value>) -> Result<(), Denial> {
    let url = required_str(arguments, "url")?;
    if url.starts_with("http://") || url.starts_with("https://") {
        Ok(())
    } else {
        Err(("unsupported_scheme", format!("`{url}` is not an http(s) URL")))
    }
}

fn check_optional_bool(
    arguments: &mut Map<String, Value>,
    key: &str,
    default: bool,
) -> Result<(), Denial> {
    match arguments.get(key) {
        None | Some(Value::Null) => {
            arguments.insert(key.to_string(), Value::Bool(default));
            Ok(())
        }
        Some(Value::Bool(_)) => Ok(()),
        Some(_) => Err(("invalid_argument", format!("`{key}` must be a boolean"))),
    }
}

fn check_save_path(arguments: &Map<String, Value>) -> Result<(), Denial> {
    let Some(raw) = arguments.get("save_path") else {
        return Ok(());
    };
    let Some(path) = raw.as_str() else {
        return Err(("invalid_argument", "`save_path` must be a string".to_string()));
    };
    let escapes = Path::new(path)
        .components()
        .any(|component| !matches!(component, Component::Normal(_) | Component::CurDir));
    if path.trim().is_empty() || escapes {
        return Err((
            "unsafe_save_path",
            "`save_path` must be a relative path inside the research directory".to_string(),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use serde_json::{json, Map, Value};

    use super::{GuardrailDecision, GuardrailPolicy};
    use crate::tools::ToolKind;

    fn args(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(map) => map,
            _ => Map::new(),
        }
    }

    #[test]
    fn search_defaults_and_clamps_result_count() {
        let policy = GuardrailPolicy::default();

        let decision = policy.evaluate(ToolKind::WebSearch, &args(json!({ "query": "tides" })));
        let GuardrailDecision::Allow { arguments } = decision else {
            panic!("expected allow");
        };
        assert_eq!(arguments["max_results"], json!(10));

        let decision = policy
            .evaluate(ToolKind::WebSearch, &args(json!({ "query": "tides", "max_results": 500 })));
        let GuardrailDecision::Allow { arguments } = decision else {
            panic!("expected allow");
        };
        assert_eq!(arguments["max_results"], json!(25));
    }

    #[test]
    fn missing_query_is_denied() {
        let decision = GuardrailPolicy::default().evaluate(ToolKind::WebSearch, &Map::new());
        assert!(matches!(
            decision,
            GuardrailDecision::Deny { reason_code: "missing_argument", ref message } if message.contains("query")
        ));
    }

    #[test]
    fn non_http_urls_are_denied() {
        let decision = GuardrailPolicy::default()
            .evaluate(ToolKind::FetchUrl, &args(json!({ "url": "file:///etc/passwd" })));
        assert!(matches!(decision, GuardrailDecision::Deny { reason_code: "unsupported_scheme", .. }));
    }

    #[test]
    fn fetch_gets_default_extract_text() {
        let decision = GuardrailPolicy::default()
            .evaluate(ToolKind::FetchUrl, &args(json!({ "url": "https://example.org" })));
        let GuardrailDecision::Allow { arguments } = decision else {
            panic!("expected allow");
        };
        assert_eq!(arguments["extract_text"], json!(true));
    }

    #[test]
    fn pdf_save_path_may_not_escape() {
        let policy = GuardrailPolicy::default();
        let escaping = policy.evaluate(
            ToolKind::ParsePdf,
            &args(json!({ "url": "https://example.org/a.pdf", "save_path": "../../a.pdf" })),
        );
        assert!(matches!(escaping, GuardrailDecision::Deny { reason_code: "unsafe_save_path", .. }));

        let inside = policy.evaluate(
            ToolKind::ParsePdf,
            &args(json!({ "url": "https://example.org/a.pdf", "save_path": "papers/a.pdf" })),
        );
        assert!(matches!(inside, GuardrailDecision::Allow { .. }));
    }
}
