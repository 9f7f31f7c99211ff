use std::{collections::HashMap, sync::Arc, time::Duration};

use async_trait::async_trait;
use shared::{
    domain::{ChatScope, UserId},
    protocol::{InboundEvent, OutboundEvent, TypingPayload},
};
use tokio::{sync::Mutex, task::JoinHandle, time::Instant};
use tracing::debug;

use crate::{
    config::ClientConfig,
    gateway::{ConnectionGateway, InboundHandler},
    render::RenderSink,
    session::SessionReader,
};

#[derive(Debug, Clone)]
pub struct TypingOptions {
    /// Silence after the last keystroke before `typing:stop` is sent.
    pub debounce: Duration,
    /// Lifetime of a remote indicator without a refresh.
    pub expiry: Duration,
}

impl From<&ClientConfig> for TypingOptions {
    fn from(config: &ClientConfig) -> Self {
        Self {
            debounce: config.typing_debounce(),
            expiry: config.typing_expiry(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TypingEntry {
    pub scope: ChatScope,
    pub user_id: UserId,
    pub username: String,
    pub last_seen_at: Instant,
}

struct TimerSlot {
    generation: u64,
    timer: JoinHandle<()>,
}

struct RemoteEntry {
    username: String,
    first_seen: u64,
    last_seen_at: Instant,
    expiry: TimerSlot,
}

#[derive(Default)]
struct TypingState {
    next_generation: u64,
    next_order: u64,
    /// Local bursts with their debounce timers.
    local: HashMap<ChatScope, TimerSlot>,
    remote: HashMap<(ChatScope, UserId), RemoteEntry>,
}

impl TypingState {
    fn bump(&mut self) -> u64 {
        self.next_generation += 1;
        self.next_generation
    }

    fn summary(&self, scope: ChatScope) -> Option<String> {
        let mut typing: Vec<&RemoteEntry> = self
            .remote
            .iter()
            .filter(|((entry_scope, _), _)| *entry_scope == scope)
            .map(|(_, entry)| entry)
            .collect();
        typing.sort_by_key(|entry| entry.first_seen);
        let names: Vec<&str> = typing.iter().map(|entry| entry.username.as_str()).collect();
        format_typing_summary(&names)
    }
}

/// Outgoing typing bursts and incoming typing indicators.
pub struct TypingTracker {
    gateway: Arc<ConnectionGateway>,
    renderer: Arc<dyn RenderSink>,
    session: SessionReader,
    local_user: UserId,
    options: TypingOptions,
    state: Arc<Mutex<TypingState>>,
}

impl TypingTracker {
    pub fn new(
        gateway: Arc<ConnectionGateway>,
        renderer: Arc<dyn RenderSink>,
        session: SessionReader,
        options: TypingOptions,
    ) -> Arc<Self> {
        let local_user = gateway.identity().user_id;
        Arc::new(Self {
            gateway,
            renderer,
            session,
            local_user,
            options,
            state: Arc::new(Mutex::new(TypingState::default())),
        })
    }

    /// Announces a typing burst once and re-arms its debounce timer.
    pub async fn start_typing(&self, scope: ChatScope) {
        let mut state = self.state.lock().await;
        let generation = state.bump();
        let burst_active = match state.local.remove(&scope) {
            Some(previous) => {
                previous.timer.abort();
                true
            }
            None => false,
        };
        if !burst_active {
            debug!(%scope, "typing: burst started");
            self.gateway.emit(OutboundEvent::TypingStart { scope }).await;
        }

        let timer = {
            let state = Arc::clone(&self.state);
            let gateway = Arc::clone(&self.gateway);
            let debounce = self.options.debounce;
            tokio::spawn(async move {
                tokio::time::sleep(debounce).await;
                let mut state = state.lock().await;
                let current = state.local.get(&scope).map(|slot| slot.generation);
                if current != Some(generation) {
                    return;
                }
                state.local.remove(&scope);
                debug!(%scope, "typing: burst went quiet");
                gateway.emit(OutboundEvent::TypingStop { scope }).await;
            })
        };
        state.local.insert(scope, TimerSlot { generation, timer });
    }

    /// Ends the burst in `scope` right away. Returns false when nothing was active.
    pub async fn stop_typing(&self, scope: ChatScope) -> bool {
        let mut state = self.state.lock().await;
        let Some(burst) = state.local.remove(&scope) else {
            return false;
        };
        burst.timer.abort();
        debug!(%scope, "typing: burst stopped");
        self.gateway.emit(OutboundEvent::TypingStop { scope }).await;
        true
    }

    /// Input text of the active chat changed; empty input ends the burst.
    pub async fn input_changed(&self, text: &str) {
        let Some(scope) = self.session.current() else {
            return;
        };
        if text.trim().is_empty() {
            self.stop_typing(scope).await;
        } else {
            self.start_typing(scope).await;
        }
    }

    pub async fn input_blurred(&self) {
        if let Some(scope) = self.session.current() {
            self.stop_typing(scope).await;
        }
    }

    /// Records a remote typing indicator. Returns false for the local user's own echo.
    pub async fn on_remote_typing(&self, payload: TypingPayload) -> bool {
        if payload.user_id == self.local_user {
            return false;
        }
        let key = (payload.scope, payload.user_id);

        let mut state = self.state.lock().await;
        let generation = state.bump();
        let timer = self.spawn_expiry(key, generation);
        let (first_seen, appeared) = match state.remote.remove(&key) {
            Some(previous) => {
                previous.expiry.timer.abort();
                (previous.first_seen, false)
            }
            None => {
                state.next_order += 1;
                (state.next_order, true)
            }
        };
        state.remote.insert(
            key,
            RemoteEntry {
                username: payload.username,
                first_seen,
                last_seen_at: Instant::now(),
                expiry: TimerSlot { generation, timer },
            },
        );
        if appeared {
            debug!(scope = %payload.scope, user_id = payload.user_id.0, "typing: remote user started");
            self.publish(&state, payload.scope);
        }
        true
    }

    pub async fn on_remote_stop_typing(&self, payload: TypingPayload) -> bool {
        let mut state = self.state.lock().await;
        let Some(entry) = state.remote.remove(&(payload.scope, payload.user_id)) else {
            return false;
        };
        entry.expiry.timer.abort();
        debug!(scope = %payload.scope, user_id = payload.user_id.0, "typing: remote user stopped");
        self.publish(&state, payload.scope);
        true
    }

    pub async fn summary(&self, scope: ChatScope) -> Option<String> {
        self.state.lock().await.summary(scope)
    }

    /// Users currently typing in `scope`, in order of first appearance.
    pub async fn entries(&self, scope: ChatScope) -> Vec<TypingEntry> {
        let state = self.state.lock().await;
        let mut entries: Vec<(u64, TypingEntry)> = state
            .remote
            .iter()
            .filter(|((entry_scope, _), _)| *entry_scope == scope)
            .map(|((scope, user_id), entry)| {
                (
                    entry.first_seen,
                    TypingEntry {
                        scope: *scope,
                        user_id: *user_id,
                        username: entry.username.clone(),
                        last_seen_at: entry.last_seen_at,
                    },
                )
            })
            .collect();
        entries.sort_by_key(|(order, _)| *order);
        entries.into_iter().map(|(_, entry)| entry).collect()
    }

    /// Re-renders the indicator of `scope`, used after the active chat changes.
    pub async fn refresh(&self, scope: ChatScope) {
        let state = self.state.lock().await;
        self.renderer
            .typing_changed(scope, state.summary(scope).as_deref());
    }

    /// Cancels every pending timer without emitting anything.
    pub async fn clear(&self) {
        let mut state = self.state.lock().await;
        for (_, slot) in state.local.drain() {
            slot.timer.abort();
        }
        for (_, entry) in state.remote.drain() {
            entry.expiry.timer.abort();
        }
    }

    fn publish(&self, state: &TypingState, scope: ChatScope) {
        if self.session.is_current(&scope) {
            self.renderer
                .typing_changed(scope, state.summary(scope).as_deref());
        }
    }

    fn spawn_expiry(&self, key: (ChatScope, UserId), generation: u64) -> JoinHandle<()> {
        let state = Arc::clone(&self.state);
        let renderer = Arc::clone(&self.renderer);
        let session = self.session.clone();
        let expiry = self.options.expiry;
        tokio::spawn(async move {
            tokio::time::sleep(expiry).await;
            let mut state = state.lock().await;
            let current = state.remote.get(&key).map(|entry| entry.expiry.generation);
            if current != Some(generation) {
                return;
            }
            state.remote.remove(&key);
            let (scope, user_id) = key;
            debug!(%scope, user_id = user_id.0, "typing: remote indicator expired");
            if session.is_current(&scope) {
                renderer.typing_changed(scope, state.summary(scope).as_deref());
            }
        })
    }
}

#[async_trait]
impl InboundHandler for TypingTracker {
    async fn handle(&self, event: &InboundEvent) {
        match event {
            InboundEvent::TypingStart(payload) => {
                self.on_remote_typing(payload.clone()).await;
            }
            InboundEvent::TypingStop(payload) => {
                self.on_remote_stop_typing(payload.clone()).await;
            }
            _ => {}
        }
    }
}

/// Human-readable indicator for the given typists, first arrival first.
pub fn format_typing_summary(names: &[&str]) -> Option<String> {
    match names {
        [] => None,
        [only] => Some(format!("{only} is typing...")),
        [first, second] => Some(format!("{first} and {second} are typing...")),
        [first, rest @ ..] => Some(format!("{first} and {} others are typing...", rest.len())),
    }
}

#[cfg(test)]
#[path = "tests/typing_tests.rs"]
mod tests;
