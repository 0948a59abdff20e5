use std::sync::Arc;

use researchkit_core::audit::{AuditCategory, AuditContext, AuditEvent, AuditOutcome, AuditSink};
use researchkit_core::config::EngineConfig;
use researchkit_core::{Conversation, ConversationError, Message, ToolCall, ToolResult};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::guardrails::{GuardrailDecision, GuardrailPolicy};
use crate::interrupt::AbortSignal;
use crate::llm::{LlmClient, ModelError, ModelTurn};
use crate::tools::ToolRegistry;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ToolMode {
    Enabled,
    /// No schemas are advertised and any requested call fails back to the model.
    Disabled,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EngineReply {
    pub text: String,
    pub model_calls: u32,
    pub tool_dispatches: u32,
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum EngineError {
    #[error("model service unavailable: {0}")]
    ServiceUnavailable(String),
    #[error("model returned an unusable response: {0}")]
    Protocol(String),
    #[error("model kept requesting tools after {limit} calls without a final answer")]
    ToolLoopExceeded { limit: u32 },
    #[error("interrupted by user")]
    Interrupted,
    #[error(transparent)]
    Conversation(#[from] ConversationError),
}

impl From<ModelError> for EngineError {
    fn from(value: ModelError) -> Self {
        match value {
            ModelError::ServiceUnavailable(message) => Self::ServiceUnavailable(message),
            ModelError::Protocol(message) => Self::Protocol(message),
        }
    }
}

/// Hooks for surfacing loop progress to the human.
pub trait TurnObserver: Send + Sync {
    fn on_commentary(&self, _text: &str) {}
    fn on_tool_dispatch(&self, _call: &ToolCall) {}
    fn on_tool_result(&self, _call: &ToolCall, _result: &ToolResult) {}
}

#[derive(Clone, Copy, Debug, Default)]
pub struct SilentObserver;

impl TurnObserver for SilentObserver {}

pub struct ConversationEngine {
    client: Arc<dyn LlmClient>,
    registry: Arc<ToolRegistry>,
    guardrails: GuardrailPolicy,
    config: EngineConfig,
    observer: Arc<dyn TurnObserver>,
    audit: Option<(Arc<dyn AuditSink>, AuditContext)>,
    abort: AbortSignal,
}

impl ConversationEngine {
    pub fn new(client: Arc<dyn LlmClient>, registry: Arc<ToolRegistry>, config: EngineConfig) -> Self {
        Self {
            client,
            registry,
            guardrails: GuardrailPolicy::default(),
            config,
            observer: Arc::new(SilentObserver),
            audit: None,
            abort: AbortSignal::new(),
        }
    }

    pub fn with_guardrails(mut self, guardrails: GuardrailPolicy) -> Self {
        self.guardrails = guardrails;
        self
    }

    pub fn with_observer(mut self, observer: Arc<dyn TurnObserver>) -> Self {
        self.observer = observer;
        self
    }

    pub fn with_audit(mut self, sink: Arc<dyn AuditSink>, context: AuditContext) -> Self {
        self.audit = Some((sink, context));
        self
    }

    pub fn with_abort(mut self, abort: AbortSignal) -> Self {
        self.abort = abort;
        self
    }

    pub fn abort_signal(&self) -> &AbortSignal {
        &self.abort
    }

    pub fn config(&self) -> EngineConfig {
        self.config
    }

    /// Appends `user_text` and runs the tool loop until the model answers.
    pub async fn respond(
        &self,
        conversation: &mut Conversation,
        user_text: &str,
        mode: ToolMode,
    ) -> Result<EngineReply, EngineError> {
        conversation.push_user(user_text)?;
        self.resolve(conversation, mode).await
    }

    /// Runs the tool loop against the conversation as it stands.
    ///
    /// Every append made before a failure stays in `conversation`, and tool
    /// side effects are never rolled back.
    pub async fn resolve(
        &self,
        conversation: &mut Conversation,
        mode: ToolMode,
    ) -> Result<EngineReply, EngineError> {
        let schemas = match mode {
            ToolMode::Enabled => self.registry.schemas(),
            ToolMode::Disabled => Vec::new(),
        };
        let limit = self.config.max_tool_iterations;
        let mut model_calls = 0_u32;
        let mut tool_dispatches = 0_u32;

        loop {
            if model_calls >= limit {
                warn!(
                    event_name = "engine.tool_loop_exceeded",
                    correlation_id = %self.correlation_id(),
                    limit,
                    message_count = conversation.len(),
                    "tool loop hit iteration limit"
                );
                self.emit("engine.tool_loop_exceeded", AuditCategory::Model, AuditOutcome::Failed, |event| {
                    event.with_metadata("limit", limit.to_string())
                });
                return Err(EngineError::ToolLoopExceeded { limit });
            }

            model_calls += 1;
            debug!(
                event_name = "engine.iteration",
                correlation_id = %self.correlation_id(),
                iteration = model_calls,
                message_count = conversation.len(),
                tool_count = schemas.len(),
                "calling model"
            );

            let turn = self
                .abort
                .guard(self.client.send(conversation, &schemas))
                .await
                .map_err(|_| EngineError::Interrupted)?
                .map_err(|error| {
                    warn!(
                        event_name = "engine.model_failed",
                        correlation_id = %self.correlation_id(),
                        error = %error,
                        "model call failed"
                    );
                    EngineError::from(error)
                })?;

            match turn {
                ModelTurn::FinalResponse(text) => {
                    conversation.append(Message::assistant(text.clone()))?;
                    info!(
                        event_name = "engine.final_response",
                        correlation_id = %self.correlation_id(),
                        model_calls,
                        tool_dispatches,
                        "model produced final response"
                    );
                    return Ok(EngineReply { text, model_calls, tool_dispatches });
                }
                ModelTurn::ToolRequest { calls, commentary } => {
                    if let Some(text) = commentary.as_deref() {
                        self.observer.on_commentary(text);
                    }
                    info!(
                        event_name = "engine.tool_request",
                        correlation_id = %self.correlation_id(),
                        tool_call_count = calls.len(),
                        "model requested tools"
                    );
                    conversation
                        .append(Message::tool_request(commentary.unwrap_or_default(), calls.clone()))?;

                    for call in &calls {
                        self.observer.on_tool_dispatch(call);
                        let result = self
                            .abort
                            .guard(self.dispatch(call, mode))
                            .await
                            .map_err(|_| EngineError::Interrupted)?;
                        tool_dispatches += 1;
                        conversation.push_tool_result(&result)?;
                        self.observer.on_tool_result(call, &result);
                    }
                }
            }
        }
    }

    async fn dispatch(&self, call: &ToolCall, mode: ToolMode) -> ToolResult {
        if mode == ToolMode::Disabled {
            return self.reject(call, "tools_disabled", "tools are not available in this phase".to_string());
        }

        let tool = match self.registry.lookup(&call.name) {
            Ok(tool) => tool,
            Err(error) => return self.reject(call, "unknown_tool", error.to_string()),
        };

        let arguments = match self.guardrails.evaluate(tool.kind(), &call.arguments) {
            GuardrailDecision::Allow { arguments } => arguments,
            GuardrailDecision::Deny { reason_code, message } => {
                return self.reject(call, reason_code, message);
            }
        };

        debug!(
            event_name = "tool.dispatched",
            correlation_id = %self.correlation_id(),
            tool = %call.name,
            call_id = %call.id,
            "dispatching tool call"
        );
        match tool.invoke(&arguments).await {
            Ok(payload) => {
                self.emit("tool.succeeded", AuditCategory::Tool, AuditOutcome::Success, |event| {
                    event.with_metadata("tool", call.name.clone()).with_metadata("call_id", call.id.clone())
                });
                ToolResult::success(&call.id, payload)
            }
            Err(failure) => {
                warn!(
                    event_name = "tool.failed",
                    correlation_id = %self.correlation_id(),
                    tool = %call.name,
                    error = %failure,
                    "tool failed; reporting back to model"
                );
                self.emit("tool.failed", AuditCategory::Tool, AuditOutcome::Failed, |event| {
                    event.with_metadata("tool", call.name.clone()).with_metadata("error", failure.to_string())
                });
                ToolResult::failure(&call.id, failure.to_string())
            }
        }
    }

    fn reject(&self, call: &ToolCall, reason_code: &'static str, message: String) -> ToolResult {
        warn!(
            event_name = "tool.rejected",
            correlation_id = %self.correlation_id(),
            tool = %call.name,
            reason_code,
            "tool call rejected before dispatch"
        );
        self.emit("tool.rejected", AuditCategory::Tool, AuditOutcome::Rejected, |event| {
            event.with_metadata("tool", call.name.clone()).with_metadata("reason_code", reason_code)
        });
        ToolResult::failure(&call.id, message)
    }

    fn correlation_id(&self) -> &str {
        self.audit.as_ref().map(|(_, context)| context.correlation_id.as_str()).unwrap_or("unassigned")
    }

    fn emit<F>(&self, event_type: &str, category: AuditCategory, outcome: AuditOutcome, decorate: F)
    where
        F: FnOnce(AuditEvent) -> AuditEvent,
    {
        if let Some((sink, context)) = &self.audit {
            sink.emit(decorate(AuditEvent::from_context(context, event_type, category, outcome)));
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex};

    use async_trait::async_trait;
    use researchkit_core::audit::{AuditContext, InMemoryAuditSink};
    use researchkit_core::config::EngineConfig;
    use researchkit_core::{Conversation, Role, ToolCall, ToolDefinition};
    use serde_json::{json, Map, Value};

    use super::{ConversationEngine, EngineError, ToolMode, TurnObserver};
    use crate::llm::{LlmClient, ModelError, ModelTurn};
    use crate::tools::{ResearchTool, ToolFailure, ToolKind, ToolRegistry};

    #[derive(Default)]
    struct ScriptedClient {
        turns: Mutex<VecDeque<Result<ModelTurn, ModelError>>>,
        advertised: Mutex<Vec<usize>>,
    }

    impl ScriptedClient {
        fn new(turns: Vec<Result<ModelTurn, ModelError>>) -> Self {
            Self { turns: Mutex::new(turns.into()), advertised: Mutex::default() }
        }

        fn calls(&self) -> usize {
            self.advertised.lock().map(|calls| calls.len()).unwrap_or(0)
        }
    }

    #[async_trait]
    impl LlmClient for ScriptedClient {
        async fn send(
            &self,
            _conversation: &Conversation,
            tools: &[ToolDefinition],
        ) -> Result<ModelTurn, ModelError> {
            self.advertised.lock().expect("lock").push(tools.len());
            self.turns
                .lock()
                .expect("lock")
                .pop_front()
                .unwrap_or_else(|| Ok(ModelTurn::FinalResponse("fallback".to_string())))
        }
    }

    struct AlwaysToolsClient;

    #[async_trait]
    impl LlmClient for AlwaysToolsClient {
        async fn send(
            &self,
            conversation: &Conversation,
            _tools: &[ToolDefinition],
        ) -> Result<ModelTurn, ModelError> {
            Ok(ModelTurn::ToolRequest {
                calls: vec![search_call(&format!("call_{}", conversation.len()), "again")],
                commentary: None,
            })
        }
    }

    struct StubSearch {
        outcome: Result<Value, ToolFailure>,
        invocations: Mutex<Vec<Map<String, Value>>>,
    }

    impl StubSearch {
        fn returning(outcome: Result<Value, ToolFailure>) -> Arc<Self> {
            Arc::new(Self { outcome, invocations: Mutex::default() })
        }
    }

    struct SharedSearch(Arc<StubSearch>);

    #[async_trait]
    impl ResearchTool for SharedSearch {
        fn kind(&self) -> ToolKind {
            ToolKind::WebSearch
        }

        async fn invoke(&self, arguments: &Map<String, Value>) -> Result<Value, ToolFailure> {
            self.0.invocations.lock().expect("lock").push(arguments.clone());
            self.0.outcome.clone()
        }
    }

    #[derive(Default)]
    struct RecordingObserver {
        commentary: Mutex<Vec<String>>,
        dispatched: Mutex<Vec<String>>,
    }

    impl TurnObserver for RecordingObserver {
        fn on_commentary(&self, text: &str) {
            self.commentary.lock().expect("lock").push(text.to_string());
        }

        fn on_tool_dispatch(&self, call: &ToolCall) {
            self.dispatched.lock().expect("lock").push(call.name.clone());
        }
    }

    fn search_call(id: &str, query: &str) -> ToolCall {
        let mut arguments = Map::new();
        arguments.insert("query".to_string(), json!(query));
        ToolCall::new(id, "web_search", arguments)
    }

    fn registry_with(search: &Arc<StubSearch>) -> Arc<ToolRegistry> {
        let mut registry = ToolRegistry::default();
        registry.register(SharedSearch(Arc::clone(search)));
        Arc::new(registry)
    }

    fn build_engine(client: Arc<dyn LlmClient>, registry: Arc<ToolRegistry>, limit: u32) -> ConversationEngine {
        ConversationEngine::new(client, registry, EngineConfig { max_tool_iterations: limit })
    }

    #[tokio::test]
    async fn immediate_final_response_takes_one_exchange() {
        let client = Arc::new(ScriptedClient::new(vec![Ok(ModelTurn::FinalResponse("X".to_string()))]));
        let search = StubSearch::returning(Ok(json!({})));
        let engine = build_engine(client.clone(), registry_with(&search), 10);
        let mut conversation = Conversation::new();

        let reply = engine.respond(&mut conversation, "hello", ToolMode::Enabled).await.expect("reply");

        assert_eq!(reply.text, "X");
        assert_eq!(reply.model_calls, 1);
        assert_eq!(reply.tool_dispatches, 0);
        assert_eq!(client.calls(), 1);
        assert!(search.invocations.lock().expect("lock").is_empty());
        assert_eq!(conversation.len(), 2);
    }

    #[tokio::test]
    async fn web_search_round_trip_produces_four_messages() {
        let client = Arc::new(ScriptedClient::new(vec![
            Ok(ModelTurn::ToolRequest { calls: vec![search_call("c1", "X")], commentary: None }),
            Ok(ModelTurn::FinalResponse("Summary citing result 1".to_string())),
        ]));
        let search = StubSearch::returning(Ok(json!({ "results": [{ "title": "r1" }] })));
        let engine = build_engine(client.clone(), registry_with(&search), 10);
        let mut conversation = Conversation::new();

        let reply = engine.respond(&mut conversation, "research X", ToolMode::Enabled).await.expect("reply");

        assert_eq!(reply.text, "Summary citing result 1");
        assert_eq!(reply.model_calls, 2);
        assert_eq!(reply.tool_dispatches, 1);
        assert_eq!(client.calls(), 2);
        let roles = conversation.messages().iter().map(|message| message.role).collect::<Vec<_>>();
        assert_eq!(roles, vec![Role::User, Role::Assistant, Role::Tool, Role::Assistant]);
        assert_eq!(conversation.messages()[2].tool_call_id.as_deref(), Some("c1"));
        conversation.validate().expect("alternation holds");
    }

    #[tokio::test]
    async fn failed_tool_is_fed_back_and_loop_continues() {
        let client = Arc::new(ScriptedClient::new(vec![
            Ok(ModelTurn::ToolRequest { calls: vec![search_call("c1", "X")], commentary: None }),
            Ok(ModelTurn::FinalResponse("gave up on search".to_string())),
        ]));
        let search = StubSearch::returning(Err(ToolFailure::Execution("timeout".to_string())));
        let engine = build_engine(client, registry_with(&search), 10);
        let mut conversation = Conversation::new();

        let reply = engine.respond(&mut conversation, "go", ToolMode::Enabled).await.expect("reply");

        assert_eq!(reply.text, "gave up on search");
        let tool_message = &conversation.messages()[2];
        assert_eq!(tool_message.role, Role::Tool);
        assert_eq!(tool_message.content, r#"{"error":"timeout"}"#);
    }

    #[tokio::test]
    async fn always_requesting_tools_stops_at_the_ceiling() {
        let search = StubSearch::returning(Ok(json!({ "results": [] })));
        let engine = build_engine(Arc::new(AlwaysToolsClient), registry_with(&search), 3);
        let mut conversation = Conversation::new();

        let error = engine
            .respond(&mut conversation, "loop forever", ToolMode::Enabled)
            .await
            .expect_err("bounded");

        assert_eq!(error, EngineError::ToolLoopExceeded { limit: 3 });
        assert_eq!(search.invocations.lock().expect("lock").len(), 3);
        assert_eq!(conversation.len(), 1 + 3 * 2, "partial transcript is kept");
        conversation.validate().expect("transcript stays well formed");
    }

    #[tokio::test]
    async fn unknown_tool_becomes_failed_result() {
        let client = Arc::new(ScriptedClient::new(vec![
            Ok(ModelTurn::ToolRequest {
                calls: vec![ToolCall::new("c1", "launch_rockets", Map::new())],
                commentary: Some("Trying something".to_string()),
            }),
            Ok(ModelTurn::FinalResponse("done".to_string())),
        ]));
        let search = StubSearch::returning(Ok(json!({})));
        let observer = Arc::new(RecordingObserver::default());
        let sink = InMemoryAuditSink::default();
        let engine = build_engine(client, registry_with(&search), 10)
            .with_observer(observer.clone())
            .with_audit(Arc::new(sink.clone()), AuditContext::new(None, "run-7", "engine"));
        let mut conversation = Conversation::new();

        engine.respond(&mut conversation, "go", ToolMode::Enabled).await.expect("reply");

        assert!(conversation.messages()[2].content.contains("unknown tool `launch_rockets`"));
        assert_eq!(conversation.messages()[1].content, "Trying something");
        assert_eq!(*observer.commentary.lock().expect("lock"), vec!["Trying something".to_string()]);
        assert_eq!(*observer.dispatched.lock().expect("lock"), vec!["launch_rockets".to_string()]);
        assert_eq!(sink.event_types(), vec!["tool.rejected".to_string()]);
    }

    #[tokio::test]
    async fn guardrail_denial_skips_the_tool() {
        let client = Arc::new(ScriptedClient::new(vec![
            Ok(ModelTurn::ToolRequest {
                calls: vec![ToolCall::new("c1", "web_search", Map::new())],
                commentary: None,
            }),
            Ok(ModelTurn::FinalResponse("ok".to_string())),
        ]));
        let search = StubSearch::returning(Ok(json!({})));
        let engine = build_engine(client, registry_with(&search), 10);
        let mut conversation = Conversation::new();

        engine.respond(&mut conversation, "go", ToolMode::Enabled).await.expect("reply");

        assert!(search.invocations.lock().expect("lock").is_empty());
        assert!(conversation.messages()[2].content.contains("`query` is required"));
    }

    #[tokio::test]
    async fn disabled_tools_are_not_advertised() {
        let client = Arc::new(ScriptedClient::new(vec![Ok(ModelTurn::FinalResponse("s".to_string()))]));
        let search = StubSearch::returning(Ok(json!({})));
        let engine = build_engine(client.clone(), registry_with(&search), 10);
        let mut conversation = Conversation::new();

        engine.respond(&mut conversation, "synthesize", ToolMode::Disabled).await.expect("reply");

        assert_eq!(*client.advertised.lock().expect("lock"), vec![0]);
    }

    #[tokio::test]
    async fn service_failure_surfaces_without_assistant_append() {
        let client = Arc::new(ScriptedClient::new(vec![Err(ModelError::ServiceUnavailable(
            "connection refused".to_string(),
        ))]));
        let search = StubSearch::returning(Ok(json!({})));
        let engine = build_engine(client, registry_with(&search), 10);
        let mut conversation = Conversation::new();

        let error = engine.respond(&mut conversation, "go", ToolMode::Enabled).await.expect_err("fails");

        assert!(matches!(error, EngineError::ServiceUnavailable(_)));
        assert_eq!(conversation.len(), 1, "user message is kept");
    }

    #[tokio::test]
    async fn triggered_abort_interrupts_before_the_model_call() {
        let client = Arc::new(ScriptedClient::new(vec![Ok(ModelTurn::FinalResponse("x".to_string()))]));
        let search = StubSearch::returning(Ok(json!({})));
        let engine = build_engine(client.clone(), registry_with(&search), 10);
        engine.abort_signal().trigger();
        let mut conversation = Conversation::new();

        let error = engine.respond(&mut conversation, "go", ToolMode::Enabled).await.expect_err("aborted");

        assert_eq!(error, EngineError::Interrupted);
        assert_eq!(client.calls(), 0);
        assert_eq!(conversation.len(), 1);
    }
}
