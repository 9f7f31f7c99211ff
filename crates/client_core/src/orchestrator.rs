use std::sync::Arc;

use shared::{
    domain::{Attachment, ChatScope, Message, MessageId},
    protocol::{Identity, InboundKind, OutboundEvent},
};
use tokio::{
    sync::{broadcast::error::RecvError, Mutex},
    task::JoinHandle,
};
use tracing::{debug, info, warn};

use crate::{
    api::ChatBackend,
    config::ClientConfig,
    delivery::{DeliveryOptions, DeliveryPipeline},
    error::{ChatError, ChatResult},
    gateway::{ConnectionGateway, GatewayOptions},
    render::RenderSink,
    session::{ActiveSession, SessionReader},
    transport::RealtimeTransport,
    typing::{TypingOptions, TypingTracker},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    Idle,
    Switching(ChatScope),
    Active(ChatScope),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SwitchOutcome {
    /// The scope is active; `loaded` messages arrived with the first page.
    Activated { loaded: usize },
    AlreadyActive,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HistoryMode {
    Record,
    Replay,
}

/// Back/forward list of visited chats.
#[derive(Debug, Default)]
pub struct NavigationHistory {
    entries: Vec<ChatScope>,
    cursor: Option<usize>,
}

impl NavigationHistory {
    /// Records a visit; forward entries past the cursor are dropped.
    pub fn push(&mut self, scope: ChatScope) {
        if let Some(cursor) = self.cursor {
            self.entries.truncate(cursor + 1);
            if self.entries.last() == Some(&scope) {
                return;
            }
        }
        self.entries.push(scope);
        self.cursor = Some(self.entries.len() - 1);
    }

    pub fn back(&mut self) -> Option<ChatScope> {
        let cursor = self.cursor?.checked_sub(1)?;
        self.cursor = Some(cursor);
        self.entries.get(cursor).copied()
    }

    pub fn forward(&mut self) -> Option<ChatScope> {
        let cursor = self.cursor? + 1;
        let scope = self.entries.get(cursor).copied()?;
        self.cursor = Some(cursor);
        Some(scope)
    }

    pub fn current(&self) -> Option<ChatScope> {
        self.cursor.and_then(|cursor| self.entries.get(cursor).copied())
    }
}

struct OrchestratorState {
    phase: SessionPhase,
    /// Bumped on every switch; results of older switches are discarded.
    switch_generation: u64,
    history: NavigationHistory,
}

/// Drives chat switching and routes user actions to the connection, delivery and typing components.
pub struct ChatSessionOrchestrator {
    session: ActiveSession,
    gateway: Arc<ConnectionGateway>,
    pipeline: Arc<DeliveryPipeline>,
    typing: Arc<TypingTracker>,
    renderer: Arc<dyn RenderSink>,
    state: Mutex<OrchestratorState>,
    status_forwarder: Mutex<Option<JoinHandle<()>>>,
}

impl ChatSessionOrchestrator {
    pub fn new(
        session: ActiveSession,
        gateway: Arc<ConnectionGateway>,
        pipeline: Arc<DeliveryPipeline>,
        typing: Arc<TypingTracker>,
        renderer: Arc<dyn RenderSink>,
    ) -> Arc<Self> {
        Arc::new(Self {
            session,
            gateway,
            pipeline,
            typing,
            renderer,
            state: Mutex::new(OrchestratorState {
                phase: SessionPhase::Idle,
                switch_generation: 0,
                history: NavigationHistory::default(),
            }),
            status_forwarder: Mutex::new(None),
        })
    }

    /// Wires a gateway, delivery pipeline and typing tracker around one shared session.
    pub fn new_with_dependencies(
        config: &ClientConfig,
        identity: Identity,
        transport: Arc<dyn RealtimeTransport>,
        backend: Arc<dyn ChatBackend>,
        renderer: Arc<dyn RenderSink>,
    ) -> Arc<Self> {
        let session = ActiveSession::new();
        let gateway = ConnectionGateway::new(
            transport,
            identity.clone(),
            session.reader(),
            GatewayOptions::from(config),
        );
        let pipeline = DeliveryPipeline::new(
            backend,
            Arc::clone(&gateway),
            Arc::clone(&renderer),
            session.reader(),
            identity,
            DeliveryOptions::from(config),
        );
        let typing = TypingTracker::new(
            Arc::clone(&gateway),
            Arc::clone(&renderer),
            session.reader(),
            TypingOptions::from(config),
        );
        Self::new(session, gateway, pipeline, typing, renderer)
    }

    pub fn gateway(&self) -> &Arc<ConnectionGateway> {
        &self.gateway
    }

    pub fn pipeline(&self) -> &Arc<DeliveryPipeline> {
        &self.pipeline
    }

    pub fn typing(&self) -> &Arc<TypingTracker> {
        &self.typing
    }

    pub fn session(&self) -> SessionReader {
        self.session.reader()
    }

    pub fn current_scope(&self) -> Option<ChatScope> {
        self.session.current()
    }

    pub async fn phase(&self) -> SessionPhase {
        self.state.lock().await.phase
    }

    /// Registers inbound handlers, mirrors connection state to the renderer and connects.
    pub async fn start(&self) -> ChatResult<()> {
        {
            let mut forwarder = self.status_forwarder.lock().await;
            if forwarder.is_none() {
                self.gateway
                    .on(InboundKind::MessageNew, self.pipeline.clone())
                    .await;
                self.gateway
                    .on(InboundKind::TypingStart, self.typing.clone())
                    .await;
                self.gateway
                    .on(InboundKind::TypingStop, self.typing.clone())
                    .await;
                *forwarder = Some(self.spawn_status_forwarder());
            }
        }
        self.gateway.connect().await
    }

    pub async fn shutdown(&self) {
        if let Some(scope) = self.session.current() {
            self.typing.stop_typing(scope).await;
        }
        self.typing.clear().await;
        self.gateway.disconnect().await;
        if let Some(task) = self.status_forwarder.lock().await.take() {
            task.abort();
        }
        info!("session: shut down");
    }

    pub async fn switch_to_chat(&self, scope: ChatScope) -> ChatResult<SwitchOutcome> {
        self.switch(scope, HistoryMode::Record).await
    }

    pub async fn navigate_back(&self) -> ChatResult<SwitchOutcome> {
        let target = self.state.lock().await.history.back();
        match target {
            Some(scope) => self.switch(scope, HistoryMode::Replay).await,
            None => Err(ChatError::GuardSkip("no earlier chat in history")),
        }
    }

    pub async fn navigate_forward(&self) -> ChatResult<SwitchOutcome> {
        let target = self.state.lock().await.history.forward();
        match target {
            Some(scope) => self.switch(scope, HistoryMode::Replay).await,
            None => Err(ChatError::GuardSkip("no later chat in history")),
        }
    }

    async fn switch(&self, scope: ChatScope, mode: HistoryMode) -> ChatResult<SwitchOutcome> {
        let (generation, previous) = {
            let mut state = self.state.lock().await;
            match state.phase {
                SessionPhase::Active(active) if active == scope => {
                    debug!(%scope, "session: chat already active");
                    return Ok(SwitchOutcome::AlreadyActive);
                }
                SessionPhase::Switching(pending) if pending == scope => {
                    debug!(%scope, "session: switch already in progress");
                    return Err(ChatError::GuardSkip("switch to this chat already in progress"));
                }
                _ => {}
            }
            state.switch_generation += 1;
            state.phase = SessionPhase::Switching(scope);
            if mode == HistoryMode::Record {
                state.history.push(scope);
            }
            (state.switch_generation, self.session.set(Some(scope)))
        };
        info!(%scope, generation, "session: switching chat");

        if let Some(previous) = previous.filter(|previous| *previous != scope) {
            self.typing.stop_typing(previous).await;
            self.gateway
                .emit(OutboundEvent::LeaveScope { scope: previous })
                .await;
        }
        self.pipeline.reset_page(scope).await;
        self.renderer.show_loading(scope);
        self.gateway.emit(OutboundEvent::JoinScope { scope }).await;
        self.typing.refresh(scope).await;

        let first_page = self.pipeline.load_messages(scope, 0).await;

        {
            let mut state = self.state.lock().await;
            if state.switch_generation != generation {
                debug!(%scope, generation, "session: discarding superseded switch");
                self.hide_stale_loading(scope);
                return Err(ChatError::Stale { scope });
            }
            state.phase = SessionPhase::Active(scope);
        }
        self.renderer.hide_loading(scope);

        match first_page {
            Ok(messages) => {
                info!(%scope, loaded = messages.len(), "session: chat active");
                Ok(SwitchOutcome::Activated {
                    loaded: messages.len(),
                })
            }
            Err(err) if err.is_silent() => {
                debug!(%scope, "session: first page skipped: {err}");
                Ok(SwitchOutcome::Activated { loaded: 0 })
            }
            Err(err) => {
                warn!(%scope, "session: first page failed: {err}");
                self.renderer.load_failed(scope, &err.to_string());
                Ok(SwitchOutcome::Activated { loaded: 0 })
            }
        }
    }

    /// Loads the next older page of the active chat.
    pub async fn load_older(&self) -> ChatResult<Vec<Message>> {
        let SessionPhase::Active(scope) = self.phase().await else {
            return Err(ChatError::GuardSkip("no active chat"));
        };
        let page = self.pipeline.page(scope).await;
        if page.loading {
            return Err(ChatError::GuardSkip("page load already in flight"));
        }
        if !page.has_more {
            return Err(ChatError::GuardSkip("history exhausted"));
        }

        self.renderer.show_loading(scope);
        let result = self.pipeline.load_messages(scope, page.offset).await;
        match &result {
            Err(ChatError::Stale { .. }) => {
                debug!(%scope, "session: older page arrived for an inactive chat");
                self.hide_stale_loading(scope);
            }
            Err(err) if err.is_silent() => self.renderer.hide_loading(scope),
            Err(err) => {
                warn!(%scope, offset = page.offset, "session: older page failed: {err}");
                self.renderer.hide_loading(scope);
                self.renderer.load_failed(scope, &err.to_string());
            }
            Ok(_) => self.renderer.hide_loading(scope),
        }
        result
    }

    /// A newer switch back into `scope` owns its indicator.
    fn hide_stale_loading(&self, scope: ChatScope) {
        if self.session.current() != Some(scope) {
            self.renderer.hide_loading(scope);
        }
    }

    /// Sends into the active chat and ends the local typing burst.
    pub async fn send(&self, content: &str, attachments: Vec<Attachment>) -> ChatResult<Message> {
        let Some(scope) = self.session.current() else {
            return Err(ChatError::Validation("no chat is open".to_string()));
        };
        self.typing.stop_typing(scope).await;
        self.pipeline.send_message(scope, content, attachments).await
    }

    pub async fn retry(&self, id: MessageId) -> ChatResult<Message> {
        self.pipeline.retry_message(id).await
    }

    pub async fn input_changed(&self, text: &str) {
        self.typing.input_changed(text).await;
    }

    pub async fn input_blurred(&self) {
        self.typing.input_blurred().await;
    }

    fn spawn_status_forwarder(&self) -> JoinHandle<()> {
        let mut transitions = self.gateway.subscribe_state();
        let renderer = Arc::clone(&self.renderer);
        renderer.connection_changed(self.gateway.state());
        tokio::spawn(async move {
            loop {
                match transitions.recv().await {
                    Ok(state) => renderer.connection_changed(state),
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped, "session: connection updates lagged");
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        })
    }
}

#[cfg(test)]
#[path = "tests/orchestrator_tests.rs"]
mod tests;
