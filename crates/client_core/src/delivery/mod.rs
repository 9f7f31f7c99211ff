//! Optimistic send, retry, reconciliation and history pagination.
//!
//! Every message the user submits is rendered immediately as `Pending` under a
//! temporary id and kept in an in-memory outbox until it either reaches the
//! server (`Confirmed`, reconciled in place) or runs out of attempts
//! (`Failed`, kept visible for a manual retry). Server echoes are matched back
//! to outbox entries by the `client_nonce` the request carried. Without a
//! nonce they fall back to a content match; while a send with the same content
//! is still in flight the echo is held back until the send responses say which
//! server id belongs to which temporary id.

mod dedup;
mod pagination;

use std::{
    collections::{BTreeMap, HashMap, HashSet},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use async_trait::async_trait;
use chrono::Utc;
use shared::{
    domain::{Attachment, ChatScope, Message, MessageId, MessageState},
    protocol::{Identity, InboundEvent, MessageRecord, SendMessageRequest},
};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::{
    api::ChatBackend,
    config::ClientConfig,
    error::{ChatError, ChatResult},
    gateway::{ConnectionGateway, InboundHandler},
    render::RenderSink,
    session::SessionReader,
};

use dedup::SeenIds;
use pagination::PageSlot;
pub use pagination::SessionPage;

#[derive(Debug, Clone)]
pub struct DeliveryOptions {
    /// First attempt plus automatic retries.
    pub max_send_attempts: u32,
    pub send_retry_delay: Duration,
    pub ready_timeout: Duration,
    pub seen_window: usize,
    pub reconcile_window: Duration,
}

impl From<&ClientConfig> for DeliveryOptions {
    fn from(config: &ClientConfig) -> Self {
        Self {
            max_send_attempts: config.max_send_attempts(),
            send_retry_delay: config.send_retry_delay(),
            ready_timeout: config.ready_timeout(),
            seen_window: config.seen_window,
            reconcile_window: config.reconcile_window(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InboundOutcome {
    Duplicate,
    Reconciled { temp_id: u64 },
    /// Our own echo without a nonce; held until the send response names its id.
    Deferred,
    Appended,
}

/// How a nonce-less echo relates to the unconfirmed messages.
enum EchoMatch {
    /// A message with the same content is still being delivered.
    InFlight,
    /// Oldest failed message with the same content.
    Settled(u64),
    Unmatched,
}

#[derive(Default)]
struct DeliveryState {
    /// Pending and failed messages keyed by temporary id; ordered oldest first.
    outbox: BTreeMap<u64, Message>,
    /// Messages reconciled by an echo while their sender was still waiting on the response.
    reconciled: HashMap<u64, Message>,
    /// Own echoes that could belong to any of several in-flight sends.
    deferred: Vec<MessageRecord>,
    pages: HashMap<ChatScope, PageSlot>,
    seen: HashMap<ChatScope, SeenIds>,
    /// Ids rendered from history since the scope's cursor was last reset.
    history: HashMap<ChatScope, HashSet<u64>>,
}

pub struct DeliveryPipeline {
    backend: Arc<dyn ChatBackend>,
    gateway: Arc<ConnectionGateway>,
    renderer: Arc<dyn RenderSink>,
    session: SessionReader,
    identity: Identity,
    options: DeliveryOptions,
    next_temp_id: AtomicU64,
    state: Mutex<DeliveryState>,
}

impl DeliveryPipeline {
    pub fn new(
        backend: Arc<dyn ChatBackend>,
        gateway: Arc<ConnectionGateway>,
        renderer: Arc<dyn RenderSink>,
        session: SessionReader,
        identity: Identity,
        options: DeliveryOptions,
    ) -> Arc<Self> {
        Arc::new(Self {
            backend,
            gateway,
            renderer,
            session,
            identity,
            options,
            next_temp_id: AtomicU64::new(0),
            state: Mutex::new(DeliveryState::default()),
        })
    }

    /// Renders `content` as pending right away, then delivers it with bounded retries.
    pub async fn send_message(
        &self,
        scope: ChatScope,
        content: impl Into<String>,
        attachments: Vec<Attachment>,
    ) -> ChatResult<Message> {
        let content = content.into();
        if content.trim().is_empty() && attachments.is_empty() {
            return Err(ChatError::Validation("message is empty".to_string()));
        }

        let temp_id = self.next_temp_id.fetch_add(1, Ordering::SeqCst) + 1;
        let message = Message {
            id: MessageId::Temporary(temp_id),
            scope,
            content,
            author_id: self.identity.user_id,
            author_name: Some(self.identity.username.clone()),
            created_at: Utc::now(),
            state: MessageState::Pending,
            attachments,
        };
        self.state
            .lock()
            .await
            .outbox
            .insert(temp_id, message.clone());
        self.renderer.append(&message);
        debug!(%scope, temp_id, "delivery: rendered optimistic message");

        self.deliver(temp_id, self.options.max_send_attempts).await
    }

    /// Gives a failed message one more delivery attempt.
    pub async fn retry_message(&self, id: MessageId) -> ChatResult<Message> {
        let MessageId::Temporary(temp_id) = id else {
            return Err(ChatError::GuardSkip("confirmed messages cannot be retried"));
        };
        {
            let mut state = self.state.lock().await;
            match state.outbox.get_mut(&temp_id) {
                Some(message) if message.state == MessageState::Failed => {
                    message.state = MessageState::Pending;
                    self.renderer.mark_pending(id);
                }
                _ => {
                    debug!(temp_id, "delivery: retry skipped; message is not failed");
                    return Err(ChatError::GuardSkip("message is not in a failed state"));
                }
            }
        }
        info!(temp_id, "delivery: manual retry");
        self.deliver(temp_id, 1).await
    }

    async fn deliver(&self, temp_id: u64, max_attempts: u32) -> ChatResult<Message> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let request = {
                let mut state = self.state.lock().await;
                match state.outbox.get(&temp_id) {
                    Some(message) => SendMessageRequest {
                        scope: message.scope,
                        content: message.content.clone(),
                        attachments: message.attachments.clone(),
                        client_nonce: temp_id,
                    },
                    None => {
                        return state
                            .reconciled
                            .remove(&temp_id)
                            .ok_or(ChatError::GuardSkip("message is no longer pending"));
                    }
                }
            };

            let result = match self
                .gateway
                .wait_authenticated(self.options.ready_timeout)
                .await
            {
                Ok(()) => self.backend.send_message(request).await,
                Err(err) => Err(err),
            };

            match result {
                Ok(record) => return Ok(self.confirm(temp_id, record).await),
                Err(err) if err.is_retryable() && attempt < max_attempts => {
                    warn!(
                        temp_id,
                        attempt, max_attempts, "delivery: send attempt failed, retrying: {err}"
                    );
                    tokio::time::sleep(self.options.send_retry_delay).await;
                }
                Err(err) => return self.fail(temp_id, err).await,
            }
        }
    }

    async fn confirm(&self, temp_id: u64, record: MessageRecord) -> Message {
        let scope = record.scope;
        let server_id = record.message_id;
        let confirmed = record.into_message();

        let mut state = self.state.lock().await;
        self.seen_window(&mut state, scope).insert(server_id);
        // The response is authoritative; a held-back echo with this id is ours.
        state.deferred.retain(|echo| echo.message_id != server_id);
        let result = if state.outbox.remove(&temp_id).is_some() {
            self.renderer
                .reconcile(MessageId::Temporary(temp_id), &confirmed);
            info!(%scope, temp_id, message_id = server_id, "delivery: message confirmed");
            confirmed
        } else {
            // A nonce echo won the race and already reconciled this message.
            state.reconciled.remove(&temp_id).unwrap_or(confirmed)
        };
        self.flush_deferred(&mut state);
        result
    }

    async fn fail(&self, temp_id: u64, err: ChatError) -> ChatResult<Message> {
        let mut guard = self.state.lock().await;
        let state = &mut *guard;
        match state.outbox.get_mut(&temp_id) {
            Some(message) => message.state = MessageState::Failed,
            None => return state.reconciled.remove(&temp_id).ok_or(err),
        }

        // The server may have stored an attempt whose response never arrived.
        if let Some((_, stored)) = self
            .flush_deferred(state)
            .into_iter()
            .find(|(settled, _)| *settled == temp_id)
        {
            return Ok(stored);
        }

        let reason = err.to_string();
        self.renderer
            .mark_failed(MessageId::Temporary(temp_id), &reason);
        warn!(temp_id, reason = %reason, "delivery: message failed");
        Err(err)
    }

    /// Releases held echoes once no send with the same content is in flight.
    /// Returns the failed messages that turned out to be stored.
    fn flush_deferred(&self, state: &mut DeliveryState) -> Vec<(u64, Message)> {
        let mut settled = Vec::new();
        for echo in std::mem::take(&mut state.deferred) {
            match self.match_content(&state.outbox, &echo) {
                EchoMatch::InFlight => state.deferred.push(echo),
                EchoMatch::Settled(temp_id) => {
                    state.outbox.remove(&temp_id);
                    let confirmed = echo.into_message();
                    self.renderer
                        .reconcile(MessageId::Temporary(temp_id), &confirmed);
                    info!(temp_id, message_id = %confirmed.id, "delivery: failed message was stored");
                    settled.push((temp_id, confirmed));
                }
                EchoMatch::Unmatched => {
                    debug!(message_id = echo.message_id, "delivery: releasing held echo");
                    self.renderer.append(&echo.into_message());
                }
            }
        }
        settled
    }

    /// Loads one history page, at most one request per scope at a time.
    pub async fn load_messages(&self, scope: ChatScope, offset: usize) -> ChatResult<Vec<Message>> {
        let epoch = {
            let mut state = self.state.lock().await;
            match state.pages.entry(scope).or_default().try_begin() {
                Ok(epoch) => epoch,
                Err(reason) => {
                    debug!(%scope, reason, "delivery: page load skipped");
                    return Err(ChatError::GuardSkip(reason));
                }
            }
        };

        let result = self.backend.fetch_page(scope, offset).await;

        let mut guard = self.state.lock().await;
        let state = &mut *guard;
        let slot = state.pages.entry(scope).or_default();
        if !slot.finish(epoch) {
            debug!(%scope, offset, "delivery: dropping page for a reset cursor");
            return Err(ChatError::Stale { scope });
        }
        if !self.session.is_current(&scope) {
            debug!(%scope, offset, "delivery: dropping page for inactive scope");
            return Err(ChatError::Stale { scope });
        }
        let records = result?;
        slot.advance(records.len());

        let seen = state
            .seen
            .entry(scope)
            .or_insert_with(|| SeenIds::new(self.options.seen_window));
        let history = state.history.entry(scope).or_default();
        let messages: Vec<Message> = records
            .into_iter()
            .filter(|record| !seen.contains(record.message_id))
            .filter(|record| history.insert(record.message_id))
            .map(MessageRecord::into_message)
            .collect();
        debug!(
            %scope,
            offset,
            loaded = messages.len(),
            has_more = slot.page.has_more,
            "delivery: history page loaded"
        );
        if !messages.is_empty() {
            self.renderer.prepend_history(scope, &messages);
        }
        Ok(messages)
    }

    /// Rewinds the history cursor; the next page starts from the newest messages again.
    pub async fn reset_page(&self, scope: ChatScope) {
        let mut state = self.state.lock().await;
        state.pages.entry(scope).or_default().reset();
        state.history.remove(&scope);
    }

    pub async fn page(&self, scope: ChatScope) -> SessionPage {
        self.state
            .lock()
            .await
            .pages
            .get(&scope)
            .map(|slot| slot.page)
            .unwrap_or_default()
    }

    /// Pending and failed messages for `scope`, oldest first.
    pub async fn unconfirmed(&self, scope: ChatScope) -> Vec<Message> {
        self.state
            .lock()
            .await
            .outbox
            .values()
            .filter(|message| message.scope == scope)
            .cloned()
            .collect()
    }

    pub async fn on_inbound_message(&self, record: MessageRecord) -> InboundOutcome {
        let scope = record.scope;
        let server_id = record.message_id;

        let mut state = self.state.lock().await;
        let from_history = state
            .history
            .get(&scope)
            .is_some_and(|ids| ids.contains(&server_id));
        if from_history || !self.seen_window(&mut state, scope).insert(server_id) {
            debug!(%scope, message_id = server_id, "delivery: dropping duplicate inbound message");
            return InboundOutcome::Duplicate;
        }

        if let Some(nonce) = record.client_nonce {
            let ours = state.outbox.get(&nonce).is_some_and(|message| {
                message.scope == record.scope && message.author_id == record.author_id
            });
            if ours {
                return self.reconcile_echo(&mut state, nonce, record.into_message());
            }
            self.renderer.append(&record.into_message());
            return InboundOutcome::Appended;
        }

        match self.match_content(&state.outbox, &record) {
            EchoMatch::InFlight => {
                debug!(%scope, message_id = server_id, "delivery: holding echo until sends settle");
                state.deferred.push(record);
                InboundOutcome::Deferred
            }
            EchoMatch::Settled(temp_id) => {
                self.reconcile_echo(&mut state, temp_id, record.into_message())
            }
            EchoMatch::Unmatched => {
                self.renderer.append(&record.into_message());
                InboundOutcome::Appended
            }
        }
    }

    fn reconcile_echo(
        &self,
        state: &mut DeliveryState,
        temp_id: u64,
        confirmed: Message,
    ) -> InboundOutcome {
        let awaiting_sender = state
            .outbox
            .remove(&temp_id)
            .is_some_and(|message| message.state == MessageState::Pending);
        if awaiting_sender {
            state.reconciled.insert(temp_id, confirmed.clone());
        }
        self.renderer
            .reconcile(MessageId::Temporary(temp_id), &confirmed);
        info!(scope = %confirmed.scope, temp_id, message_id = %confirmed.id, "delivery: reconciled from echo");
        InboundOutcome::Reconciled { temp_id }
    }

    fn seen_window<'a>(&self, state: &'a mut DeliveryState, scope: ChatScope) -> &'a mut SeenIds {
        state
            .seen
            .entry(scope)
            .or_insert_with(|| SeenIds::new(self.options.seen_window))
    }

    /// Content match for echoes that carry no nonce.
    fn match_content(&self, outbox: &BTreeMap<u64, Message>, record: &MessageRecord) -> EchoMatch {
        let window = chrono::Duration::from_std(self.options.reconcile_window)
            .unwrap_or_else(|_| chrono::Duration::seconds(10));
        let mut settled = None;
        for (temp_id, message) in outbox {
            let same = message.scope == record.scope
                && message.author_id == record.author_id
                && message.content == record.content
                && (message.created_at - record.created_at).abs() <= window;
            if !same {
                continue;
            }
            if message.state == MessageState::Pending {
                return EchoMatch::InFlight;
            }
            settled.get_or_insert(*temp_id);
        }
        settled.map_or(EchoMatch::Unmatched, EchoMatch::Settled)
    }
}

#[async_trait]
impl InboundHandler for DeliveryPipeline {
    async fn handle(&self, event: &InboundEvent) {
        if let InboundEvent::MessageNew { message } = event {
            self.on_inbound_message(message.clone()).await;
        }
    }
}

#[cfg(test)]
#[path = "../tests/delivery_tests.rs"]
mod tests;
