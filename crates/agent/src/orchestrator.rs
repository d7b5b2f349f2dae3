//! The agent orchestrator: session lifecycle, the streaming tool-use
//! loop, provider switching, and cancellation.
//!
//! One chat round at a time. A `Semaphore` with a single permit gates
//! `chat`; a second concurrent call fails fast with [`Error::Busy`]
//! instead of queueing. Each chat gets a fresh `CancellationToken`
//! checked at the top of every round and before every stream chunk.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard, PoisonError};

use serde_json::Value;
use tokio::sync::{mpsc, Mutex as TokioMutex, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use krait_config::{mask_secrets, Config, ProviderConfig};
use krait_core::client::{ChatClient, ChatRequest, StreamChunk};
use krait_core::error::{Error, ProviderError, Result, ToolError};
use krait_core::message::{ContentBlock, Message, Role};
use krait_core::tool::{ToolCall, ToolRegistry};
use krait_mcp::{proxy_tools, McpManager};
use krait_runner::TaskRunner;
use krait_store::{SessionRecord, Store};

use crate::events::AgentEvent;
use crate::factory::ClientFactory;
use crate::history;
use crate::prompt;
use crate::titles;
use crate::tools::{self, DelegateContext, DelegateTaskTool};

/// Hard cap on model calls per chat turn. A model stuck invoking
/// tools forever gets cut off here.
pub const MAX_TOOL_ROUNDS: usize = 25;

/// The mutable per-session state behind the orchestrator.
#[derive(Debug, Clone)]
pub struct SessionState {
    pub session_id: Option<i64>,
    pub history: Vec<Message>,
    pub provider: String,
    pub model: Option<String>,
}

fn lock<T>(mutex: &StdMutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// The conversational agent.
pub struct Agent {
    config: Config,
    store: Arc<dyn Store>,
    factory: Arc<dyn ClientFactory>,
    registry: StdMutex<ToolRegistry>,
    remote_aliases: StdMutex<HashSet<String>>,
    mcp: Option<Arc<McpManager>>,
    delegate_ctx: Arc<StdMutex<DelegateContext>>,
    state: TokioMutex<SessionState>,
    gate: Semaphore,
    clients: TokioMutex<HashMap<String, Arc<dyn ChatClient>>>,
    titles_client: TokioMutex<Option<Arc<dyn ChatClient>>>,
    cancel: StdMutex<CancellationToken>,
    persona: Option<String>,
}

impl Agent {
    pub fn new(config: Config, store: Arc<dyn Store>, factory: Arc<dyn ClientFactory>) -> Self {
        let mut registry = ToolRegistry::new();
        for tool in tools::memory_tools(Arc::clone(&store)) {
            registry.register(tool);
        }
        let delegate_ctx = Arc::new(StdMutex::new(DelegateContext::default()));
        if !config.runners.is_empty() {
            let runners: BTreeMap<String, Arc<TaskRunner>> = config
                .runners
                .iter()
                .map(|(name, cfg)| {
                    (
                        name.clone(),
                        Arc::new(TaskRunner::new(name.clone(), cfg.clone())),
                    )
                })
                .collect();
            registry.register(Arc::new(DelegateTaskTool::new(
                runners,
                config.general.workspace_dir.clone(),
                Arc::clone(&delegate_ctx),
            )));
        }
        let mcp = (!config.mcp_servers.is_empty())
            .then(|| Arc::new(McpManager::from_config(&config.mcp_servers)));
        let provider = config.general.default_provider.clone();
        Self {
            config,
            store,
            factory,
            registry: StdMutex::new(registry),
            remote_aliases: StdMutex::new(HashSet::new()),
            mcp,
            delegate_ctx,
            state: TokioMutex::new(SessionState {
                session_id: None,
                history: Vec::new(),
                provider,
                model: None,
            }),
            gate: Semaphore::new(1),
            clients: TokioMutex::new(HashMap::new()),
            titles_client: TokioMutex::new(None),
            cancel: StdMutex::new(CancellationToken::new()),
            persona: None,
        }
    }

    pub fn with_persona(mut self, persona: impl Into<String>) -> Self {
        self.persona = Some(persona.into());
        self
    }

    // --- Remote tools ---

    /// Connect every configured remote server and (re-)register its
    /// tools. Unreachable servers are logged and skipped.
    pub async fn connect_remote_tools(&self) {
        let Some(manager) = &self.mcp else { return };
        manager.connect_all().await;
        let proxies = proxy_tools(manager).await;
        let mut aliases = lock(&self.remote_aliases);
        let mut registry = lock(&self.registry);
        registry.retain(|name| !aliases.contains(name));
        aliases.clear();
        for tool in proxies {
            aliases.insert(tool.name().to_string());
            registry.register(tool);
        }
        info!(remote_tools = aliases.len(), "remote tools registered");
    }

    // --- Sessions ---

    /// Start a fresh session, archiving the current one.
    pub async fn new_session(&self) -> Result<i64> {
        let mut state = self.state.lock().await;
        if let Some(old) = state.session_id {
            if let Err(e) = self.store.archive_session(old).await {
                warn!(session_id = old, error = %e, "failed to archive previous session");
            }
        }
        let id = self.store.create_session().await?;
        state.session_id = Some(id);
        state.history.clear();
        info!(session_id = id, "new session");
        Ok(id)
    }

    /// Switch to an existing session and load its history wholesale.
    pub async fn resume_session(&self, id: i64) -> Result<()> {
        let session = self
            .store
            .get_session(id)
            .await?
            .ok_or(Error::SessionNotFound(id))?;
        let rows = self.store.messages(session.id, None).await?;
        let mut state = self.state.lock().await;
        state.session_id = Some(session.id);
        state.history = rows
            .into_iter()
            .map(|r| Message {
                role: r.role,
                content: r.content,
            })
            .collect();
        info!(session_id = id, messages = state.history.len(), "session resumed");
        Ok(())
    }

    /// Recent sessions, newest first.
    pub async fn list_sessions(&self, limit: usize) -> Result<Vec<SessionRecord>> {
        Ok(self.store.list_sessions(limit).await?)
    }

    /// Delete sessions outright. Deleting the active one leaves the
    /// orchestrator without a session until the next chat creates one.
    pub async fn delete_sessions(&self, ids: &[i64]) -> Result<u64> {
        let deleted = self.store.delete_sessions(ids).await?;
        let mut state = self.state.lock().await;
        if state.session_id.is_some_and(|id| ids.contains(&id)) {
            state.session_id = None;
            state.history.clear();
        }
        Ok(deleted)
    }

    async fn ensure_session(&self) -> Result<i64> {
        let mut state = self.state.lock().await;
        if let Some(id) = state.session_id {
            return Ok(id);
        }
        let id = self.store.create_session().await?;
        state.session_id = Some(id);
        Ok(id)
    }

    pub async fn session_id(&self) -> Option<i64> {
        self.state.lock().await.session_id
    }

    // --- Provider / model switching ---

    pub async fn current_provider(&self) -> String {
        self.state.lock().await.provider.clone()
    }

    pub async fn current_model(&self) -> Option<String> {
        self.state.lock().await.model.clone()
    }

    /// Switch the active provider. The model resets to the provider
    /// default and the choice is persisted best-effort.
    pub async fn switch_provider(&self, name: &str) -> Result<()> {
        let provider = self
            .config
            .providers
            .get(name)
            .ok_or_else(|| Error::config(format!("unknown provider '{name}'")))?;
        if !provider.has_credentials() {
            return Err(Error::config(format!(
                "provider '{name}' has no API key configured"
            )));
        }
        {
            let mut state = self.state.lock().await;
            state.provider = name.to_string();
            state.model = None;
        }
        self.persist_provider_model(name.to_string(), None);
        Ok(())
    }

    /// Switch the model within the active provider, honoring its
    /// allow-list when one is configured.
    pub async fn switch_model(&self, model: &str) -> Result<()> {
        let provider_name = self.state.lock().await.provider.clone();
        let provider = self
            .config
            .providers
            .get(&provider_name)
            .ok_or_else(|| Error::config(format!("unknown provider '{provider_name}'")))?;
        if !provider.models.is_empty() && !provider.models.iter().any(|m| m == model) {
            return Err(Error::Provider(ProviderError::ModelNotAllowed(
                model.to_string(),
            )));
        }
        self.state.lock().await.model = Some(model.to_string());
        self.persist_provider_model(provider_name, Some(model.to_string()));
        Ok(())
    }

    /// Re-apply the provider/model persisted by previous runs. A saved
    /// provider that no longer exists or lost its key is skipped.
    pub async fn restore_provider_model(&self) -> Result<()> {
        if let Some(provider) = self.store.get_setting("last_provider").await? {
            if self
                .config
                .providers
                .get(&provider)
                .is_some_and(ProviderConfig::has_credentials)
            {
                let mut state = self.state.lock().await;
                state.provider = provider;
                state.model = None;
            } else {
                warn!(provider = %provider, "saved provider is no longer usable, keeping default");
                return Ok(());
            }
        }
        if let Some(model) = self.store.get_setting("last_model").await? {
            if !model.is_empty() {
                self.state.lock().await.model = Some(model);
            }
        }
        Ok(())
    }

    fn persist_provider_model(&self, provider: String, model: Option<String>) {
        let store = Arc::clone(&self.store);
        tokio::spawn(async move {
            if let Err(e) = store.set_setting("last_provider", &provider).await {
                warn!(error = %e, "failed to persist provider choice");
            }
            if let Err(e) = store
                .set_setting("last_model", model.as_deref().unwrap_or(""))
                .await
            {
                warn!(error = %e, "failed to persist model choice");
            }
        });
    }

    // --- Cancellation ---

    /// Cancel the in-flight chat round, if any. The token also fans out
    /// to any delegated subprocess via the delegate context.
    pub fn cancel(&self) {
        lock(&self.cancel).cancel();
        info!("cancellation requested");
    }

    // --- The chat loop ---

    /// Run one user turn to completion, streaming [`AgentEvent`]s as
    /// they happen. Returns the assistant's final text.
    pub async fn chat(
        &self,
        content: impl Into<String>,
        events: mpsc::Sender<AgentEvent>,
    ) -> Result<String> {
        let _permit = self.gate.try_acquire().map_err(|_| Error::Busy)?;
        let token = {
            let mut guard = lock(&self.cancel);
            *guard = CancellationToken::new();
            guard.clone()
        };
        let session_id = self.ensure_session().await?;
        {
            let mut ctx = lock(&self.delegate_ctx);
            ctx.session_id = Some(session_id);
            ctx.cancel = token.clone();
        }

        let content = content.into();
        let system = prompt::build_system_prompt(
            self.persona.as_deref(),
            &self.config.general,
            &self.store,
            &content,
        )
        .await;

        let user = Message::user(content);
        self.store
            .add_message(session_id, Role::User, &user.content)
            .await?;
        self.state.lock().await.history.push(user);

        let client = {
            let provider = self.state.lock().await.provider.clone();
            self.client_for(&provider).await?
        };
        let tool_defs = lock(&self.registry).definitions();

        let (final_text, finish_reason) = {
            let mut rounds = 0;
            loop {
                if rounds >= MAX_TOOL_ROUNDS {
                    warn!(session_id, "tool-use round cap reached");
                    break (String::new(), "max_rounds".to_string());
                }
                rounds += 1;
                if token.is_cancelled() {
                    return Err(Error::Cancelled);
                }

                let (messages, model) = {
                    let state = self.state.lock().await;
                    (
                        history::truncate(&state.history, self.config.general.context_rounds),
                        state.model.clone(),
                    )
                };
                let request = ChatRequest {
                    messages,
                    system: Some(system.clone()),
                    tools: tool_defs.clone(),
                    model,
                };

                let mut rx = client.chat_stream(request).await?;
                let mut text = String::new();
                let mut invocations: Vec<ToolCall> = Vec::new();
                let mut finish: Option<String> = None;
                while let Some(chunk) = rx.recv().await {
                    if token.is_cancelled() {
                        return Err(Error::Cancelled);
                    }
                    let chunk = chunk?;
                    if !chunk.text.is_empty() {
                        events.send(AgentEvent::Text(chunk.text.clone())).await.ok();
                        text.push_str(&chunk.text);
                    }
                    if let Some(id) = &chunk.tool_use_id {
                        let arguments: Value = serde_json::from_str(&chunk.tool_arguments_json)
                            .unwrap_or_else(|_| serde_json::json!({}));
                        invocations.push(ToolCall {
                            id: id.clone(),
                            name: chunk.tool_name.clone().unwrap_or_default(),
                            arguments,
                        });
                    }
                    if let Some(reason) = &chunk.finish_reason {
                        finish = Some(reason.clone());
                    }
                }

                let mut blocks: Vec<ContentBlock> = Vec::new();
                if !text.is_empty() {
                    blocks.push(ContentBlock::text(text.clone()));
                }
                for call in &invocations {
                    blocks.push(ContentBlock::tool_use(
                        call.id.clone(),
                        call.name.clone(),
                        call.arguments.clone(),
                    ));
                }
                if !blocks.is_empty() {
                    let assistant = Message::assistant(blocks);
                    self.store
                        .add_message(session_id, Role::Assistant, &assistant.content)
                        .await?;
                    self.state.lock().await.history.push(assistant);
                }

                // A stream that ends without a finish reason terminates
                // the loop even when it carried invocations.
                let wants_tools = !invocations.is_empty()
                    && finish
                        .as_deref()
                        .map_or(false, StreamChunk::is_tool_use_finish);
                if !wants_tools {
                    break (text, finish.unwrap_or_else(|| "end_turn".to_string()));
                }

                debug!(session_id, count = invocations.len(), "dispatching tool invocations");
                let mut results: Vec<ContentBlock> = Vec::new();
                for call in &invocations {
                    results.push(self.dispatch(call, &events).await?);
                }
                let tool_msg = Message::tool_results(results);
                self.store
                    .add_message(session_id, Role::ToolResult, &tool_msg.content)
                    .await?;
                self.state.lock().await.history.push(tool_msg);
            }
        };

        events
            .send(AgentEvent::Finished {
                reason: finish_reason,
            })
            .await
            .ok();

        self.slim_history().await;
        self.maybe_generate_title(session_id).await;
        Ok(final_text)
    }

    async fn dispatch(
        &self,
        call: &ToolCall,
        events: &mpsc::Sender<AgentEvent>,
    ) -> Result<ContentBlock> {
        events
            .send(AgentEvent::ToolStarted {
                id: call.id.clone(),
                name: call.name.clone(),
            })
            .await
            .ok();
        let tool = lock(&self.registry).get(&call.name);
        let Some(tool) = tool else {
            warn!(tool = %call.name, "model invoked an unknown tool");
            return Ok(ContentBlock::tool_error(
                call.id.clone(),
                format!("Error: unknown tool '{}'", call.name),
            ));
        };
        match tool.execute(call.arguments.clone()).await {
            Ok(result) if result.success => Ok(ContentBlock::tool_result(call.id.clone(), result.output)),
            Ok(result) => Ok(ContentBlock::tool_error(
                call.id.clone(),
                mask_secrets(&result.output),
            )),
            Err(ToolError::Cancelled) => Err(Error::Cancelled),
            Err(e) => Ok(ContentBlock::tool_error(
                call.id.clone(),
                format!("Error: {}", mask_secrets(&e.to_string())),
            )),
        }
    }

    /// Apply the store's slimming policy to the in-memory history so a
    /// long-lived session does not keep full artifacts around.
    async fn slim_history(&self) {
        let policy = self.store.slim_policy().clone();
        let mut state = self.state.lock().await;
        for message in &mut state.history {
            message.content = policy.slim(message.role, &message.content);
        }
    }

    async fn client_for(&self, provider: &str) -> Result<Arc<dyn ChatClient>> {
        let mut clients = self.clients.lock().await;
        if let Some(client) = clients.get(provider) {
            return Ok(Arc::clone(client));
        }
        let cfg = self
            .config
            .providers
            .get(provider)
            .ok_or_else(|| Error::config(format!("unknown provider '{provider}'")))?;
        let client = self.factory.build(provider, cfg)?;
        clients.insert(provider.to_string(), Arc::clone(&client));
        Ok(client)
    }

    // --- Titles ---

    /// Fire-and-forget title generation when the session is untitled
    /// and a titles model is configured.
    async fn maybe_generate_title(&self, session_id: i64) {
        let Some(titles_cfg) = &self.config.titles else {
            return;
        };
        match self.store.get_session(session_id).await {
            Ok(Some(session)) if session.title.is_none() => {}
            Ok(_) => return,
            Err(e) => {
                warn!(session_id, error = %e, "could not check session title");
                return;
            }
        }
        let client = match self.titles_client().await {
            Ok(client) => client,
            Err(e) => {
                warn!(error = %e, "titles client unavailable");
                return;
            }
        };
        let model = Some(titles_cfg.model.clone());
        let store = Arc::clone(&self.store);
        tokio::spawn(titles::generate_title(client, model, store, session_id));
    }

    async fn titles_client(&self) -> Result<Arc<dyn ChatClient>> {
        let mut guard = self.titles_client.lock().await;
        if let Some(client) = &*guard {
            return Ok(Arc::clone(client));
        }
        let titles_cfg = self
            .config
            .titles
            .as_ref()
            .ok_or_else(|| Error::config("no titles model configured"))?;
        let provider = ProviderConfig {
            api_key: titles_cfg.api_key.clone(),
            api_base: titles_cfg.api_base.clone(),
            default_model: titles_cfg.model.clone(),
            models: Vec::new(),
            max_tokens: Some(titles_cfg.max_tokens),
            headers: HashMap::new(),
        };
        let client = self.factory.build("titles", &provider)?;
        *guard = Some(Arc::clone(&client));
        Ok(client)
    }

    // --- Shutdown ---

    pub async fn close(&self) {
        if let Some(mcp) = &self.mcp {
            mcp.close().await;
        }
        let clients: Vec<Arc<dyn ChatClient>> =
            self.clients.lock().await.drain().map(|(_, c)| c).collect();
        for client in clients {
            client.close().await;
        }
        if let Some(client) = self.titles_client.lock().await.take() {
            client.close().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use krait_config::GeneralConfig;
    use krait_core::client::ChatResponse;
    use krait_store::MemoryStore;
    use serde_json::json;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    struct MockClient {
        scripts: StdMutex<VecDeque<Vec<StreamChunk>>>,
        calls: AtomicUsize,
        delay: Duration,
        repeat_last: bool,
    }

    impl MockClient {
        fn scripted(scripts: Vec<Vec<StreamChunk>>) -> Arc<Self> {
            Arc::new(Self {
                scripts: StdMutex::new(scripts.into()),
                calls: AtomicUsize::new(0),
                delay: Duration::ZERO,
                repeat_last: false,
            })
        }

        fn repeating(script: Vec<StreamChunk>) -> Arc<Self> {
            Arc::new(Self {
                scripts: StdMutex::new(VecDeque::from([script])),
                calls: AtomicUsize::new(0),
                delay: Duration::ZERO,
                repeat_last: true,
            })
        }

        fn slow(scripts: Vec<Vec<StreamChunk>>, delay: Duration) -> Arc<Self> {
            Arc::new(Self {
                scripts: StdMutex::new(scripts.into()),
                calls: AtomicUsize::new(0),
                delay,
                repeat_last: false,
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl ChatClient for MockClient {
        async fn chat(&self, _request: ChatRequest) -> std::result::Result<ChatResponse, ProviderError> {
            Ok(ChatResponse::default())
        }

        async fn chat_stream(
            &self,
            _request: ChatRequest,
        ) -> std::result::Result<
            mpsc::Receiver<std::result::Result<StreamChunk, ProviderError>>,
            ProviderError,
        > {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            let script = {
                let mut scripts = self.scripts.lock().unwrap();
                if self.repeat_last && scripts.len() == 1 {
                    scripts[0].clone()
                } else {
                    scripts.pop_front().unwrap_or_default()
                }
            };
            let (tx, rx) = mpsc::channel(16);
            tokio::spawn(async move {
                for chunk in script {
                    if tx.send(Ok(chunk)).await.is_err() {
                        break;
                    }
                }
            });
            Ok(rx)
        }
    }

    struct MockFactory {
        client: Arc<MockClient>,
    }

    impl ClientFactory for MockFactory {
        fn build(
            &self,
            _provider_name: &str,
            _config: &ProviderConfig,
        ) -> Result<Arc<dyn ChatClient>> {
            Ok(Arc::clone(&self.client) as Arc<dyn ChatClient>)
        }
    }

    fn provider(api_key: &str) -> ProviderConfig {
        ProviderConfig {
            api_key: api_key.into(),
            api_base: None,
            default_model: "mock-model".into(),
            models: Vec::new(),
            max_tokens: None,
            headers: HashMap::new(),
        }
    }

    fn test_config() -> Config {
        let mut general = GeneralConfig::default();
        general.default_provider = "mock".into();
        Config {
            general,
            providers: HashMap::from([("mock".to_string(), provider("key"))]),
            titles: None,
            runners: HashMap::new(),
            mcp_servers: Vec::new(),
            slim: Default::default(),
        }
    }

    fn agent_with(client: Arc<MockClient>) -> (Arc<Agent>, Arc<dyn Store>) {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::default());
        let agent = Agent::new(
            test_config(),
            Arc::clone(&store),
            Arc::new(MockFactory { client }),
        );
        (Arc::new(agent), store)
    }

    fn drain(mut rx: mpsc::Receiver<AgentEvent>) -> Vec<AgentEvent> {
        let mut out = Vec::new();
        while let Ok(event) = rx.try_recv() {
            out.push(event);
        }
        out
    }

    #[tokio::test]
    async fn plain_text_round_streams_and_persists() {
        let client = MockClient::scripted(vec![vec![
            StreamChunk::text_delta("Hello"),
            StreamChunk::text_delta(" there"),
            StreamChunk::finish("end_turn"),
        ]]);
        let (agent, store) = agent_with(Arc::clone(&client));
        let (tx, rx) = mpsc::channel(64);

        let reply = agent.chat("hi", tx).await.unwrap();
        assert_eq!(reply, "Hello there");
        assert_eq!(client.calls(), 1);

        let events = drain(rx);
        assert!(matches!(events[0], AgentEvent::Text(ref t) if t == "Hello"));
        assert!(matches!(
            events.last(),
            Some(AgentEvent::Finished { reason }) if reason == "end_turn"
        ));

        let session_id = agent.session_id().await.unwrap();
        let rows = store.messages(session_id, None).await.unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].role, Role::User);
        assert_eq!(rows[1].role, Role::Assistant);
    }

    #[tokio::test]
    async fn two_invocations_become_one_tool_result_message() {
        let client = MockClient::scripted(vec![
            vec![
                StreamChunk::tool_use("t1", "memory_list", "{}"),
                StreamChunk::tool_use("t2", "memory_list", "{}"),
                StreamChunk::finish("tool_use"),
            ],
            vec![
                StreamChunk::text_delta("done"),
                StreamChunk::finish("end_turn"),
            ],
        ]);
        let (agent, store) = agent_with(Arc::clone(&client));
        let (tx, rx) = mpsc::channel(64);

        let reply = agent.chat("list my memories twice", tx).await.unwrap();
        assert_eq!(reply, "done");
        assert_eq!(client.calls(), 2);

        let events = drain(rx);
        let started: Vec<&AgentEvent> = events
            .iter()
            .filter(|e| matches!(e, AgentEvent::ToolStarted { .. }))
            .collect();
        assert_eq!(started.len(), 2);

        let session_id = agent.session_id().await.unwrap();
        let rows = store.messages(session_id, None).await.unwrap();
        // user, assistant(tool_use x2), tool_result, assistant(text)
        assert_eq!(rows.len(), 4);
        assert_eq!(rows[2].role, Role::ToolResult);
        let krait_core::message::MessageContent::Blocks(blocks) = &rows[2].content else {
            panic!("tool results must be blocks");
        };
        assert_eq!(blocks.len(), 2);
        assert!(blocks.iter().all(|b| matches!(
            b,
            ContentBlock::ToolResult { is_error: false, .. }
        )));
    }

    #[tokio::test]
    async fn missing_finish_reason_ends_the_round_without_dispatch() {
        // An interrupted stream can carry a tool-use block but never a
        // finish chunk; that must not trigger tool dispatch or another
        // model call.
        let client = MockClient::scripted(vec![vec![StreamChunk::tool_use(
            "t1",
            "memory_list",
            "{}",
        )]]);
        let (agent, _store) = agent_with(Arc::clone(&client));
        let (tx, rx) = mpsc::channel(64);

        agent.chat("go", tx).await.unwrap();
        assert_eq!(client.calls(), 1);
        let events = drain(rx);
        assert!(!events
            .iter()
            .any(|e| matches!(e, AgentEvent::ToolStarted { .. })));
        assert!(matches!(
            events.last(),
            Some(AgentEvent::Finished { reason }) if reason == "end_turn"
        ));
    }

    #[tokio::test]
    async fn unknown_tool_becomes_an_error_block() {
        let client = MockClient::scripted(vec![
            vec![
                StreamChunk::tool_use("t1", "definitely_not_a_tool", "{}"),
                StreamChunk::finish("tool_use"),
            ],
            vec![
                StreamChunk::text_delta("recovered"),
                StreamChunk::finish("end_turn"),
            ],
        ]);
        let (agent, store) = agent_with(client);
        let (tx, _rx) = mpsc::channel(64);

        let reply = agent.chat("use a bogus tool", tx).await.unwrap();
        assert_eq!(reply, "recovered");

        let session_id = agent.session_id().await.unwrap();
        let rows = store.messages(session_id, None).await.unwrap();
        let krait_core::message::MessageContent::Blocks(blocks) = &rows[2].content else {
            panic!("tool results must be blocks");
        };
        assert!(matches!(
            &blocks[0],
            ContentBlock::ToolResult { is_error: true, content, .. }
                if content.contains("unknown tool")
        ));
    }

    #[tokio::test]
    async fn round_cap_stops_a_tool_loop() {
        let client = MockClient::repeating(vec![
            StreamChunk::tool_use("t", "memory_list", "{}"),
            StreamChunk::finish("tool_use"),
        ]);
        let (agent, _store) = agent_with(Arc::clone(&client));
        let (tx, rx) = mpsc::channel(1024);

        let reply = agent.chat("loop forever", tx).await.unwrap();
        assert_eq!(reply, "");
        assert_eq!(client.calls(), MAX_TOOL_ROUNDS);
        assert!(matches!(
            drain(rx).last(),
            Some(AgentEvent::Finished { reason }) if reason == "max_rounds"
        ));
    }

    #[tokio::test]
    async fn second_concurrent_chat_is_rejected() {
        let client = MockClient::slow(
            vec![vec![
                StreamChunk::text_delta("slow reply"),
                StreamChunk::finish("end_turn"),
            ]],
            Duration::from_millis(300),
        );
        let (agent, _store) = agent_with(client);

        let first = {
            let agent = Arc::clone(&agent);
            let (tx, _rx) = mpsc::channel(64);
            tokio::spawn(async move { agent.chat("one", tx).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;

        let (tx, _rx) = mpsc::channel(64);
        let second = agent.chat("two", tx).await;
        assert!(matches!(second, Err(Error::Busy)));

        assert_eq!(first.await.unwrap().unwrap(), "slow reply");
    }

    #[tokio::test]
    async fn cancel_aborts_the_round() {
        let client = MockClient::slow(
            vec![vec![
                StreamChunk::text_delta("never seen"),
                StreamChunk::finish("end_turn"),
            ]],
            Duration::from_millis(300),
        );
        let (agent, _store) = agent_with(client);

        let handle = {
            let agent = Arc::clone(&agent);
            let (tx, _rx) = mpsc::channel(64);
            tokio::spawn(async move { agent.chat("one", tx).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        agent.cancel();

        assert!(matches!(handle.await.unwrap(), Err(Error::Cancelled)));
    }

    #[tokio::test]
    async fn switching_to_an_unknown_provider_fails() {
        let (agent, _store) = agent_with(MockClient::scripted(vec![]));
        let err = agent.switch_provider("ghost").await.unwrap_err();
        assert!(err.to_string().contains("ghost"));
    }

    #[tokio::test]
    async fn switching_to_a_keyless_provider_fails() {
        let client = MockClient::scripted(vec![]);
        let store: Arc<dyn Store> = Arc::new(MemoryStore::default());
        let mut config = test_config();
        config.providers.insert("keyless".into(), provider(""));
        let agent = Agent::new(config, store, Arc::new(MockFactory { client }));

        let err = agent.switch_provider("keyless").await.unwrap_err();
        assert!(err.to_string().contains("API key"));
        assert_eq!(agent.current_provider().await, "mock");
    }

    #[tokio::test]
    async fn provider_switch_resets_model_and_persists() {
        let client = MockClient::scripted(vec![]);
        let store: Arc<dyn Store> = Arc::new(MemoryStore::default());
        let mut config = test_config();
        config.providers.insert("other".into(), provider("key2"));
        let agent = Agent::new(config, Arc::clone(&store), Arc::new(MockFactory { client }));

        agent.switch_model("mock-model-large").await.unwrap();
        assert_eq!(agent.current_model().await.as_deref(), Some("mock-model-large"));

        agent.switch_provider("other").await.unwrap();
        assert_eq!(agent.current_provider().await, "other");
        assert_eq!(agent.current_model().await, None);

        // The persist task is spawned; give it a tick.
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(
            store.get_setting("last_provider").await.unwrap().as_deref(),
            Some("other")
        );
    }

    #[tokio::test]
    async fn model_allow_list_is_enforced() {
        let client = MockClient::scripted(vec![]);
        let store: Arc<dyn Store> = Arc::new(MemoryStore::default());
        let mut config = test_config();
        config
            .providers
            .get_mut("mock")
            .map(|p| p.models = vec!["mock-small".into()]);
        let agent = Agent::new(config, store, Arc::new(MockFactory { client }));

        assert!(agent.switch_model("mock-small").await.is_ok());
        let err = agent.switch_model("forbidden").await.unwrap_err();
        assert!(matches!(
            err,
            Error::Provider(ProviderError::ModelNotAllowed(_))
        ));
    }

    #[tokio::test]
    async fn restore_skips_an_unusable_saved_provider() {
        let client = MockClient::scripted(vec![]);
        let store: Arc<dyn Store> = Arc::new(MemoryStore::default());
        store.set_setting("last_provider", "gone").await.unwrap();
        store.set_setting("last_model", "m").await.unwrap();
        let agent = Agent::new(test_config(), store, Arc::new(MockFactory { client }));

        agent.restore_provider_model().await.unwrap();
        assert_eq!(agent.current_provider().await, "mock");
        assert_eq!(agent.current_model().await, None);
    }

    #[tokio::test]
    async fn restore_applies_a_valid_saved_pair() {
        let client = MockClient::scripted(vec![]);
        let store: Arc<dyn Store> = Arc::new(MemoryStore::default());
        let mut config = test_config();
        config.providers.insert("other".into(), provider("key2"));
        store.set_setting("last_provider", "other").await.unwrap();
        store.set_setting("last_model", "other-large").await.unwrap();
        let agent = Agent::new(config, store, Arc::new(MockFactory { client }));

        agent.restore_provider_model().await.unwrap();
        assert_eq!(agent.current_provider().await, "other");
        assert_eq!(agent.current_model().await.as_deref(), Some("other-large"));
    }

    #[tokio::test]
    async fn new_session_archives_the_old_one() {
        let client = MockClient::scripted(vec![vec![
            StreamChunk::text_delta("ok"),
            StreamChunk::finish("end_turn"),
        ]]);
        let (agent, store) = agent_with(client);
        let (tx, _rx) = mpsc::channel(64);
        agent.chat("hello", tx).await.unwrap();
        let first = agent.session_id().await.unwrap();

        let second = agent.new_session().await.unwrap();
        assert_ne!(first, second);
        assert!(store.get_session(first).await.unwrap().unwrap().archived);
    }

    #[tokio::test]
    async fn resume_loads_history_wholesale() {
        let client = MockClient::scripted(vec![
            vec![
                StreamChunk::text_delta("first reply"),
                StreamChunk::finish("end_turn"),
            ],
            vec![
                StreamChunk::text_delta("second reply"),
                StreamChunk::finish("end_turn"),
            ],
        ]);
        let (agent, _store) = agent_with(client);
        let (tx, _rx) = mpsc::channel(64);
        agent.chat("hello", tx).await.unwrap();
        let id = agent.session_id().await.unwrap();

        agent.new_session().await.unwrap();
        agent.resume_session(id).await.unwrap();
        assert_eq!(agent.session_id().await, Some(id));
        let state = agent.state.lock().await;
        assert_eq!(state.history.len(), 2);
    }

    #[tokio::test]
    async fn deleting_the_active_session_clears_it() {
        let client = MockClient::scripted(vec![vec![
            StreamChunk::text_delta("ok"),
            StreamChunk::finish("end_turn"),
        ]]);
        let (agent, store) = agent_with(client);
        let (tx, _rx) = mpsc::channel(64);
        agent.chat("hello", tx).await.unwrap();
        let id = agent.session_id().await.unwrap();

        assert_eq!(agent.delete_sessions(&[id]).await.unwrap(), 1);
        assert_eq!(agent.session_id().await, None);
        assert!(store.get_session(id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn resuming_a_missing_session_fails() {
        let (agent, _store) = agent_with(MockClient::scripted(vec![]));
        let err = agent.resume_session(9999).await.unwrap_err();
        assert!(matches!(err, Error::SessionNotFound(9999)));
    }

    #[tokio::test]
    async fn tool_arguments_parse_with_empty_fallback() {
        let client = MockClient::scripted(vec![
            vec![
                // Garbage arguments must not abort the round.
                StreamChunk::tool_use("t1", "memory_list", "not json"),
                StreamChunk::finish("tool_use"),
            ],
            vec![
                StreamChunk::text_delta("fine"),
                StreamChunk::finish("end_turn"),
            ],
        ]);
        let (agent, _store) = agent_with(client);
        let (tx, _rx) = mpsc::channel(64);
        assert_eq!(agent.chat("go", tx).await.unwrap(), "fine");
    }

    #[tokio::test]
    async fn memory_tool_roundtrip_through_the_loop() {
        let client = MockClient::scripted(vec![
            vec![
                StreamChunk::tool_use("t1", "memory_add", json!({"text": "krait test fact"}).to_string()),
                StreamChunk::finish("tool_use"),
            ],
            vec![
                StreamChunk::text_delta("saved"),
                StreamChunk::finish("end_turn"),
            ],
        ]);
        let (agent, store) = agent_with(client);
        let (tx, _rx) = mpsc::channel(64);
        agent.chat("remember this", tx).await.unwrap();

        let hits = store.memory_search("krait", 5).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].text, "krait test fact");
    }
}
