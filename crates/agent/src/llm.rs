use std::collections::{BTreeSet, HashMap};
use std::time::Duration;

use async_trait::async_trait;
use researchkit_core::config::ModelConfig;
use researchkit_core::{Conversation, Message, Role, ToolCall, ToolDefinition};
use reqwest::Client;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::{debug, warn};

/// Base names of model families known to honour the `tools` field.
pub const TOOL_COMPATIBLE_MODELS: [&str; 6] =
    ["llama3.2", "llama3.1", "mistral-nemo", "qwen2.5", "command-r", "firefunction"];

#[derive(Clone, Debug, PartialEq)]
pub enum ModelTurn {
    FinalResponse(String),
    /// Tool calls take precedence over text; any text is commentary only.
    ToolRequest { calls: Vec<ToolCall>, commentary: Option<String> },
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ModelError {
    #[error("model service unavailable: {0}")]
    ServiceUnavailable(String),
    #[error("model protocol error: {0}")]
    Protocol(String),
}

#[async_trait]
pub trait LlmClient: Send + Sync {
    async fn send(
        &self,
        conversation: &Conversation,
        tools: &[ToolDefinition],
    ) -> Result<ModelTurn, ModelError>;
}

pub fn supports_tools(model: &str) -> bool {
    let base_name = model.split(':').next().unwrap_or(model).to_ascii_lowercase();
    TOOL_COMPATIBLE_MODELS.iter().any(|compatible| base_name.starts_with(compatible))
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
pub struct SamplingOptions {
    pub temperature: f32,
    pub top_p: f32,
    pub num_ctx: u32,
}

/// Client for the Ollama `/api/chat` endpoint. Performs no retries.
#[derive(Clone)]
pub struct OllamaClient {
    http: Client,
    base_url: String,
    model: String,
    options: SamplingOptions,
    api_key: Option<SecretString>,
}

impl std::fmt::Debug for OllamaClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OllamaClient")
            .field("base_url", &self.base_url)
            .field("model", &self.model)
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

impl OllamaClient {
    pub fn from_config(config: &ModelConfig) -> Result<Self, ModelError> {
        let http = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|error| ModelError::ServiceUnavailable(error.to_string()))?;
        Ok(Self {
            http,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            model: config.model.clone(),
            options: SamplingOptions {
                temperature: config.temperature,
                top_p: config.top_p,
                num_ctx: config.num_ctx,
            },
            api_key: config.api_key.clone(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        let builder = self.http.request(method, format!("{}{path}", self.base_url));
        match &self.api_key {
            Some(key) => builder.bearer_auth(key.expose_secret()),
            None => builder,
        }
    }

    /// Installed models, sorted, optionally filtered to tool-capable families.
    pub async fn list_models(&self, tool_compatible_only: bool) -> Result<Vec<String>, ModelError> {
        let response = self
            .request(reqwest::Method::GET, "/api/tags")
            .send()
            .await
            .map_err(transport_error)?;
        let body = read_body(response).await?;
        let tags: TagsResponse = serde_json::from_str(&body)
            .map_err(|error| ModelError::Protocol(format!("undecodable model list: {error}")))?;

        let mut models = tags
            .models
            .into_iter()
            .map(|model| model.name)
            .filter(|name| !tool_compatible_only || supports_tools(name))
            .collect::<Vec<_>>();
        models.sort();
        Ok(models)
    }

    pub async fn ping(&self) -> Result<(), ModelError> {
        let response = self
            .request(reqwest::Method::GET, "/api/tags")
            .send()
            .await
            .map_err(transport_error)?;
        read_body(response).await.map(|_| ())
    }
}

#[async_trait]
impl LlmClient for OllamaClient {
    async fn send(
        &self,
        conversation: &Conversation,
        tools: &[ToolDefinition],
    ) -> Result<ModelTurn, ModelError> {
        let request = ChatRequest::new(&self.model, conversation, tools, self.options);
        debug!(
            event_name = "model.request",
            model = %self.model,
            message_count = conversation.len(),
            tool_count = tools.len(),
            "sending chat request"
        );

        let response = self
            .request(reqwest::Method::POST, "/api/chat")
            .json(&request)
            .send()
            .await
            .map_err(transport_error)?;
        let body = read_body(response).await?;
        let decoded: ChatResponse = serde_json::from_str(&body).map_err(|error| {
            ModelError::Protocol(format!("undecodable chat response: {error}"))
        })?;
        decode_turn(decoded)
    }
}

fn transport_error(error: reqwest::Error) -> ModelError {
    warn!(event_name = "model.transport_failed", error = %error, "model endpoint unreachable");
    ModelError::ServiceUnavailable(error.to_string())
}

async fn read_body(response: reqwest::Response) -> Result<String, ModelError> {
    let status = response.status();
    let body = response.text().await.map_err(transport_error)?;
    if status.is_server_error() {
        return Err(ModelError::ServiceUnavailable(format!("status {status}: {body}")));
    }
    if !status.is_success() {
        return Err(ModelError::Protocol(format!("status {status}: {body}")));
    }
    Ok(body)
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<WireMessage<'a>>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tools: Vec<WireTool<'a>>,
    stream: bool,
    options: SamplingOptions,
}

impl<'a> ChatRequest<'a> {
    fn new(
        model: &'a str,
        conversation: &'a Conversation,
        tools: &'a [ToolDefinition],
        options: SamplingOptions,
    ) -> Self {
        let mut call_names: HashMap<&'a str, &'a str> = HashMap::new();
        let messages = conversation
            .messages()
            .iter()
            .map(|message| {
                for call in &message.tool_calls {
                    call_names.insert(call.id.as_str(), call.name.as_str());
                }
                WireMessage::encode(message, &call_names)
            })
            .collect();
        let tools = tools
            .iter()
            .map(|tool| WireTool {
                kind: "function",
                function: WireFunctionSpec {
                    name: &tool.name,
                    description: &tool.description,
                    parameters: &tool.parameter_schema,
                },
            })
            .collect();
        Self { model, messages, tools, stream: false, options }
    }
}

#[derive(Debug, Serialize)]
struct WireMessage<'a> {
    role: Role,
    content: &'a str,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tool_calls: Vec<WireCallOut<'a>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_call_id: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_name: Option<&'a str>,
}

impl<'a> WireMessage<'a> {
    fn encode(message: &'a Message, call_names: &HashMap<&'a str, &'a str>) -> Self {
        let tool_call_id = message.tool_call_id.as_deref();
        Self {
            role: message.role,
            content: &message.content,
            tool_calls: message
                .tool_calls
                .iter()
                .map(|call| WireCallOut {
                    id: &call.id,
                    function: WireFunctionOut { name: &call.name, arguments: &call.arguments },
                })
                .collect(),
            tool_call_id,
            tool_name: tool_call_id.and_then(|id| call_names.get(id).copied()),
        }
    }
}

#[derive(Debug, Serialize)]
struct WireCallOut<'a> {
    id: &'a str,
    function: WireFunctionOut<'a>,
}

#[derive(Debug, Serialize)]
struct WireFunctionOut<'a> {
    name: &'a str,
    arguments: &'a Map<String, Value>,
}

#[derive(Debug, Serialize)]
struct WireTool<'a> {
    #[serde(rename = "type")]
    kind: &'static str,
    function: WireFunctionSpec<'a>,
}

#[derive(Debug, Serialize)]
struct WireFunctionSpec<'a> {
    name: &'a str,
    description: &'a str,
    parameters: &'a Value,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    message: Option<WireReply>,
}

#[derive(Debug, Deserialize)]
struct WireReply {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calls: Option<Vec<WireCallIn>>,
}

#[derive(Debug, Deserialize)]
struct WireCallIn {
    #[serde(default)]
    id: Option<String>,
    function: WireFunctionIn,
}

#[derive(Debug, Deserialize)]
struct WireFunctionIn {
    name: String,
    #[serde(default)]
    arguments: Value,
}

#[derive(Debug, Deserialize)]
struct TagsResponse {
    #[serde(default)]
    models: Vec<TagEntry>,
}

#[derive(Debug, Deserialize)]
struct TagEntry {
    name: String,
}

fn decode_turn(response: ChatResponse) -> Result<ModelTurn, ModelError> {
    let Some(reply) = response.message else {
        return Err(ModelError::Protocol("response has no `message` field".to_string()));
    };
    let text = reply.content.unwrap_or_default();
    let wire_calls = reply.tool_calls.unwrap_or_default();

    if wire_calls.is_empty() {
        return Ok(ModelTurn::FinalResponse(text));
    }

    let mut seen = BTreeSet::new();
    let mut calls = Vec::with_capacity(wire_calls.len());
    for (index, wire) in wire_calls.into_iter().enumerate() {
        if wire.function.name.trim().is_empty() {
            return Err(ModelError::Protocol(format!("tool call {index} has no function name")));
        }
        let id = match wire.id.filter(|id| !id.trim().is_empty() && !seen.contains(id)) {
            Some(id) => id,
            None => synthesize_call_id(index, &seen),
        };
        seen.insert(id.clone());
        calls.push(ToolCall::new(id, wire.function.name, decode_arguments(wire.function.arguments)));
    }

    let commentary = Some(text).filter(|text| !text.trim().is_empty());
    Ok(ModelTurn::ToolRequest { calls, commentary })
}

/// `call_{index}`, bumped until it is not taken by an id already in the turn.
fn synthesize_call_id(index: usize, seen: &BTreeSet<String>) -> String {
    (index..)
        .map(|candidate| format!("call_{candidate}"))
        .find(|candidate| !seen.contains(candidate))
        .unwrap_or_else(|| format!("call_{index}_{}", seen.len()))
}

fn decode_arguments(raw: Value) -> Map<String, Value> {
    match raw {
        Value::Object(map) => map,
        Value::String(encoded) => match serde_json::from_str::<Value>(&encoded) {
            Ok(Value::Object(map)) => map,
            _ => {
                warn!(event_name = "model.arguments_undecodable", "tool arguments were not a JSON object");
                Map::new()
            }
        },
        _ => Map::new(),
    }
}
