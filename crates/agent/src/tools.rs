use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use researchkit_core::ToolDefinition;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use thiserror::Error;

/// The closed set of research capabilities the model may request.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolKind {
    WebSearch,
    FetchUrl,
    ParsePdf,
}

impl ToolKind {
    pub const ALL: [ToolKind; 3] = [ToolKind::WebSearch, ToolKind::FetchUrl, ToolKind::ParsePdf];

    pub fn name(self) -> &'static str {
        match self {
            Self::WebSearch => "web_search",
            Self::FetchUrl => "fetch_url",
            Self::ParsePdf => "parse_pdf",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.name() == name)
    }

    pub fn definition(self) -> ToolDefinition {
        let (description, parameter_schema) = match self {
            Self::WebSearch => (
                "Search the web for information. Returns a list of results with titles, URLs and snippets.",
                json!({
                    "type": "object",
                    "properties": {
                        "query": { "type": "string", "description": "Search query" },
                        "max_results": {
                            "type": "integer",
                            "description": "Maximum number of results to return",
                            "default": 10
                        }
                    },
                    "required": ["query"]
                }),
            ),
            Self::FetchUrl => (
                "Fetch the content of a web page and return its readable text.",
                json!({
                    "type": "object",
                    "properties": {
                        "url": { "type": "string", "description": "URL to fetch" },
                        "extract_text": {
                            "type": "boolean",
                            "description": "Strip markup and return plain text",
                            "default": true
                        }
                    },
                    "required": ["url"]
                }),
            ),
            Self::ParsePdf => (
                "Download a PDF document and extract its text.",
                json!({
                    "type": "object",
                    "properties": {
                        "url": { "type": "string", "description": "URL of the PDF document" },
                        "save_path": {
                            "type": "string",
                            "description": "Optional relative path to keep a copy of the PDF"
                        }
                    },
                    "required": ["url"]
                }),
            ),
        };
        ToolDefinition {
            name: self.name().to_string(),
            description: description.to_string(),
            parameter_schema,
        }
    }
}

impl std::fmt::Display for ToolKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ToolFailure {
    #[error("invalid arguments: {0}")]
    InvalidArguments(String),
    #[error("{0}")]
    Unavailable(String),
    #[error("{0}")]
    Execution(String),
}

#[async_trait]
pub trait ResearchTool: Send + Sync {
    fn kind(&self) -> ToolKind;
    async fn invoke(&self, arguments: &Map<String, Value>) -> Result<Value, ToolFailure>;
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ToolLookupError {
    #[error("unknown tool `{0}`")]
    NotFound(String),
}

/// Populated once at startup, then shared read-only.
#[derive(Default)]
pub struct ToolRegistry {
    tools: BTreeMap<ToolKind, Box<dyn ResearchTool>>,
}

impl ToolRegistry {
    pub fn register<T>(&mut self, tool: T)
    where
        T: ResearchTool + 'static,
    {
        self.tools.insert(tool.kind(), Box::new(tool));
    }

    pub fn lookup(&self, name: &str) -> Result<&dyn ResearchTool, ToolLookupError> {
        ToolKind::from_name(name)
            .and_then(|kind| self.tools.get(&kind))
            .map(|tool| tool.as_ref())
            .ok_or_else(|| ToolLookupError::NotFound(name.to_string()))
    }

    pub fn schemas(&self) -> Vec<ToolDefinition> {
        self.tools.keys().map(|kind| kind.definition()).collect()
    }

    pub fn kinds(&self) -> impl Iterator<Item = ToolKind> + '_ {
        self.tools.keys().copied()
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceEntry {
    pub url: String,
    pub title: Option<String>,
    pub via: ToolKind,
}

impl SourceEntry {
    pub fn new(url: impl Into<String>, title: Option<String>, via: ToolKind) -> Self {
        Self { url: url.into(), title, via }
    }
}

/// Append-only bibliography that tools record discovered sources into.
#[async_trait]
pub trait SourceLog: Send + Sync {
    async fn record(&self, entry: SourceEntry) -> std::io::Result<()>;
}

#[derive(Clone, Default)]
pub struct InMemorySourceLog {
    entries: Arc<Mutex<Vec<SourceEntry>>>,
}

impl InMemorySourceLog {
    pub fn entries(&self) -> Vec<SourceEntry> {
        match self.entries.lock() {
            Ok(entries) => entries.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

#[async_trait]
impl SourceLog for InMemorySourceLog {
    async fn record(&self, entry: SourceEntry) -> std::io::Result<()> {
        match self.entries.lock() {
            Ok(mut entries) => entries.push(entry),
            Err(poisoned) => poisoned.into_inner().push(entry),
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use serde_json::{json, Map, Value};

    use super::{ResearchTool, ToolFailure, ToolKind, ToolLookupError, ToolRegistry};

    struct EchoTool(ToolKind);

    #[async_trait]
    impl ResearchTool for EchoTool {
        fn kind(&self) -> ToolKind {
            self.0
        }

        async fn invoke(&self, arguments: &Map<String, Value>) -> Result<Value, ToolFailure> {
            Ok(Value::Object(arguments.clone()))
        }
    }

    #[test]
    fn schemas_follow_kind_order_regardless_of_registration_order() {
        let mut registry = ToolRegistry::default();
        registry.register(EchoTool(ToolKind::ParsePdf));
        registry.register(EchoTool(ToolKind::WebSearch));

        let names = registry.schemas().into_iter().map(|schema| schema.name).collect::<Vec<_>>();
        assert_eq!(names, vec!["web_search", "parse_pdf"]);
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn unknown_and_unregistered_names_are_not_found() {
        let mut registry = ToolRegistry::default();
        registry.register(EchoTool(ToolKind::WebSearch));

        assert!(matches!(
            registry.lookup("delete_everything"),
            Err(ToolLookupError::NotFound(ref name)) if name == "delete_everything"
        ));
        assert!(registry.lookup("fetch_url").is_err());
        assert!(registry.lookup("web_search").is_ok());
    }

    #[tokio::test]
    async fn lookup_dispatches_to_registered_tool() {
        let mut registry = ToolRegistry::default();
        registry.register(EchoTool(ToolKind::FetchUrl));

        let mut arguments = Map::new();
        arguments.insert("url".to_string(), json!("https://example.org"));
        let tool = registry.lookup("fetch_url").expect("registered");
        let payload = tool.invoke(&arguments).await.expect("invoke");

        assert_eq!(payload["url"], json!("https://example.org"));
    }

    #[test]
    fn every_definition_requires_its_primary_argument() {
        for kind in ToolKind::ALL {
            let definition = kind.definition();
            let required = definition.parameter_schema["required"].as_array().cloned();
            assert!(required.is_some_and(|fields| !fields.is_empty()), "{kind} lacks required");
        }
    }
}
