use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

/// A model-issued request to invoke a named tool. Arguments are not
/// validated until dispatch.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    pub arguments: Map<String, Value>,
}

impl ToolCall {
    pub fn new(id: impl Into<String>, name: impl Into<String>, arguments: Map<String, Value>) -> Self {
        Self { id: id.into(), name: name.into(), arguments }
    }

    pub fn argument_str(&self, key: &str) -> Option<&str> {
        self.arguments.get(key).and_then(Value::as_str)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ToolResult {
    pub tool_call_id: String,
    pub success: bool,
    pub payload: Value,
}

impl ToolResult {
    pub fn success(tool_call_id: impl Into<String>, payload: Value) -> Self {
        Self { tool_call_id: tool_call_id.into(), success: true, payload }
    }

    pub fn failure(tool_call_id: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            tool_call_id: tool_call_id.into(),
            success: false,
            payload: serde_json::json!({ "error": error.into() }),
        }
    }

    pub fn error_message(&self) -> Option<&str> {
        if self.success {
            return None;
        }
        self.payload.get("error").and_then(Value::as_str)
    }

    /// Text fed back to the model as the content of the `tool` message.
    pub fn to_content(&self) -> String {
        serde_json::to_string(&self.payload).unwrap_or_else(|_| "{}".to_string())
    }
}

/// Static schema advertised to the model for one tool.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub parameter_schema: Value,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

impl Message {
    pub fn system(content: impl Into<String>) -> Self {
        Self::plain(Role::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::plain(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::plain(Role::Assistant, content)
    }

    pub fn tool_request(content: impl Into<String>, tool_calls: Vec<ToolCall>) -> Self {
        Self { role: Role::Assistant, content: content.into(), tool_calls, tool_call_id: None }
    }

    pub fn tool_result(result: &ToolResult) -> Self {
        Self {
            role: Role::Tool,
            content: result.to_content(),
            tool_calls: Vec::new(),
            tool_call_id: Some(result.tool_call_id.clone()),
        }
    }

    fn plain(role: Role, content: impl Into<String>) -> Self {
        Self { role, content: content.into(), tool_calls: Vec::new(), tool_call_id: None }
    }

    pub fn has_tool_calls(&self) -> bool {
        !self.tool_calls.is_empty()
    }
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ConversationError {
    #[error("message {index}: tool message has no tool_call_id")]
    MissingToolCallId { index: usize },
    #[error("message {index}: tool result `{tool_call_id}` does not answer the preceding assistant turn")]
    OrphanedToolResult { index: usize, tool_call_id: String },
    #[error("message {index}: tool call `{tool_call_id}` was already answered")]
    DuplicateToolResult { index: usize, tool_call_id: String },
    #[error("message {index}: assistant turn repeats tool call id `{tool_call_id}`")]
    DuplicateToolCallId { index: usize, tool_call_id: String },
    #[error("message {index}: {role:?} message carries tool metadata it may not have")]
    UnexpectedToolMetadata { index: usize, role: Role },
}

/// Append-only message history for one phase.
///
/// Deserialized histories are replayed through the same checks as `append`.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "ConversationRecord")]
pub struct Conversation {
    messages: Vec<Message>,
}

#[derive(Deserialize)]
struct ConversationRecord {
    messages: Vec<Message>,
}

impl TryFrom<ConversationRecord> for Conversation {
    type Error = ConversationError;

    fn try_from(record: ConversationRecord) -> Result<Self, Self::Error> {
        Self::try_from(record.messages)
    }
}

impl TryFrom<Vec<Message>> for Conversation {
    type Error = ConversationError;

    fn try_from(messages: Vec<Message>) -> Result<Self, Self::Error> {
        ReplayState::from_history(&messages)?;
        Ok(Self { messages })
    }
}

impl Conversation {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn seeded(system_prompt: impl Into<String>) -> Self {
        Self { messages: vec![Message::system(system_prompt)] }
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn last(&self) -> Option<&Message> {
        self.messages.last()
    }

    /// Appends a message after checking it keeps the request/response
    /// alternation valid. Rejected messages leave the history untouched.
    pub fn append(&mut self, message: Message) -> Result<(), ConversationError> {
        let index = self.messages.len();
        let mut state = ReplayState::from_history(&self.messages)?;
        state.accept(index, &message)?;
        self.messages.push(message);
        Ok(())
    }

    pub fn push_user(&mut self, content: impl Into<String>) -> Result<(), ConversationError> {
        self.append(Message::user(content))
    }

    pub fn push_tool_result(&mut self, result: &ToolResult) -> Result<(), ConversationError> {
        self.append(Message::tool_result(result))
    }

    /// Tool calls of the most recent assistant turn that have no result yet.
    pub fn pending_tool_calls(&self) -> Vec<&ToolCall> {
        let Some(turn_start) = self.messages.iter().rposition(|m| m.role == Role::Assistant)
        else {
            return Vec::new();
        };
        let answered = self.messages[turn_start + 1..]
            .iter()
            .filter_map(|m| m.tool_call_id.as_deref())
            .collect::<BTreeSet<_>>();
        self.messages[turn_start]
            .tool_calls
            .iter()
            .filter(|call| !answered.contains(call.id.as_str()))
            .collect()
    }

    /// Replays the whole history against the alternation invariant.
    pub fn validate(&self) -> Result<(), ConversationError> {
        ReplayState::from_history(&self.messages).map(|_| ())
    }
}

#[derive(Default)]
struct ReplayState {
    open_calls: BTreeSet<String>,
    answered: BTreeSet<String>,
    in_tool_turn: bool,
}

impl ReplayState {
    fn from_history(messages: &[Message]) -> Result<Self, ConversationError> {
        let mut state = Self::default();
        for (index, message) in messages.iter().enumerate() {
            state.accept(index, message)?;
        }
        Ok(state)
    }

    fn accept(&mut self, index: usize, message: &Message) -> Result<(), ConversationError> {
        match message.role {
            Role::Tool => {
                let Some(tool_call_id) = message.tool_call_id.clone() else {
                    return Err(ConversationError::MissingToolCallId { index });
                };
                if !self.in_tool_turn {
                    return Err(ConversationError::OrphanedToolResult { index, tool_call_id });
                }
                if self.answered.contains(&tool_call_id) {
                    return Err(ConversationError::DuplicateToolResult { index, tool_call_id });
                }
                if !self.open_calls.remove(&tool_call_id) {
                    return Err(ConversationError::OrphanedToolResult { index, tool_call_id });
                }
                self.answered.insert(tool_call_id);
            }
            Role::Assistant => {
                if message.tool_call_id.is_some() {
                    return Err(ConversationError::UnexpectedToolMetadata {
                        index,
                        role: message.role,
                    });
                }
                self.open_calls.clear();
                self.answered.clear();
                self.in_tool_turn = message.has_tool_calls();
                for call in &message.tool_calls {
                    if !self.open_calls.insert(call.id.clone()) {
                        return Err(ConversationError::DuplicateToolCallId {
                            index,
                            tool_call_id: call.id.clone(),
                        });
                    }
                }
            }
            Role::System | Role::User => {
                if message.has_tool_calls() || message.tool_call_id.is_some() {
                    return Err(ConversationError::UnexpectedToolMetadata {
                        index,
                        role: message.role,
                    });
                }
                self.open_calls.clear();
                self.answered.clear();
                self.in_tool_turn = false;
            }
        }
        Ok(())
    }
}
