//! Fakes shared by the in-crate test modules.

use std::{
    collections::{HashMap, VecDeque},
    sync::{
        atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::Utc;
use shared::{
    domain::{ChatScope, Message, MessageId, UserId},
    protocol::{Identity, InboundEvent, LinkStatus, MessageRecord, OutboundEvent, SendMessageRequest},
};
use tokio::sync::{broadcast, watch};

use crate::{
    api::ChatBackend,
    error::ChatResult,
    gateway::{ConnectionGateway, ConnectionState, GatewayOptions},
    render::{RenderEvent, RenderSink},
    session::SessionReader,
    transport::RealtimeTransport,
};

pub(crate) fn identity(user_id: i64, username: &str) -> Identity {
    Identity {
        user_id: UserId(user_id),
        username: username.to_string(),
        token: None,
    }
}

pub(crate) fn record(message_id: u64, scope: ChatScope, author: i64, content: &str) -> MessageRecord {
    MessageRecord {
        message_id,
        scope,
        author_id: UserId(author),
        author_name: None,
        content: content.to_string(),
        created_at: Utc::now(),
        attachments: Vec::new(),
        client_nonce: None,
    }
}

pub(crate) fn quiet_gateway_options() -> GatewayOptions {
    GatewayOptions {
        reconnect_attempts: 3,
        reconnect_delay: Duration::from_millis(100),
        heartbeat_interval: Duration::from_secs(3600),
        heartbeat_timeout: Duration::from_secs(5),
    }
}

/// Gateway over `transport`, connected and authenticated.
pub(crate) async fn connected_gateway(
    transport: Arc<FakeTransport>,
    user: Identity,
    session: SessionReader,
) -> Arc<ConnectionGateway> {
    let gateway = ConnectionGateway::new(transport, user, session, quiet_gateway_options());
    gateway.connect().await.expect("connect");
    assert_eq!(gateway.state(), ConnectionState::Authenticated);
    gateway
}

/// Polls `condition` until it holds; panics after roughly five seconds.
pub(crate) async fn wait_until(what: &str, condition: impl Fn() -> bool) {
    for _ in 0..1000 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("timed out waiting for {what}");
}

pub(crate) struct FakeTransport {
    events: broadcast::Sender<InboundEvent>,
    sent: Mutex<Vec<OutboundEvent>>,
    connects: AtomicUsize,
    closes: AtomicUsize,
    failing_connects: AtomicUsize,
    failing_auth: AtomicBool,
    hanging_pings: AtomicBool,
    drop_on_auth: AtomicUsize,
}

impl FakeTransport {
    pub(crate) fn new() -> Arc<Self> {
        let (events, _) = broadcast::channel(256);
        Arc::new(Self {
            events,
            sent: Mutex::new(Vec::new()),
            connects: AtomicUsize::new(0),
            closes: AtomicUsize::new(0),
            failing_connects: AtomicUsize::new(0),
            failing_auth: AtomicBool::new(false),
            hanging_pings: AtomicBool::new(false),
            drop_on_auth: AtomicUsize::new(0),
        })
    }

    pub(crate) fn push(&self, event: InboundEvent) {
        let _ = self.events.send(event);
    }

    pub(crate) fn drop_link(&self, reason: &str) {
        self.push(InboundEvent::ConnectionChanged(LinkStatus {
            connected: false,
            reason: Some(reason.to_string()),
        }));
    }

    pub(crate) fn fail_next_connects(&self, count: usize) {
        self.failing_connects.store(count, Ordering::SeqCst);
    }

    pub(crate) fn fail_auth(&self, fail: bool) {
        self.failing_auth.store(fail, Ordering::SeqCst);
    }

    /// The link drops again while the `connect_number`-th connection authenticates.
    pub(crate) fn drop_during_auth(&self, connect_number: usize) {
        self.drop_on_auth.store(connect_number, Ordering::SeqCst);
    }

    pub(crate) fn hang_pings(&self, hang: bool) {
        self.hanging_pings.store(hang, Ordering::SeqCst);
    }

    pub(crate) fn connect_count(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    pub(crate) fn close_count(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }

    pub(crate) fn sent(&self) -> Vec<OutboundEvent> {
        self.sent.lock().expect("sent log").clone()
    }

    pub(crate) fn sent_names(&self) -> Vec<&'static str> {
        self.sent().iter().map(OutboundEvent::name).collect()
    }

    pub(crate) fn clear_sent(&self) {
        self.sent.lock().expect("sent log").clear();
    }
}

#[async_trait]
impl RealtimeTransport for FakeTransport {
    async fn connect(&self) -> Result<()> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        let pending_failures = self.failing_connects.load(Ordering::SeqCst);
        if pending_failures > 0 {
            self.failing_connects
                .store(pending_failures - 1, Ordering::SeqCst);
            return Err(anyhow!("connection refused"));
        }
        Ok(())
    }

    async fn authenticate(&self, identity: &Identity) -> Result<()> {
        if self.failing_auth.load(Ordering::SeqCst) {
            return Err(anyhow!("identity rejected"));
        }
        if self.drop_on_auth.load(Ordering::SeqCst) == self.connect_count() {
            self.drop_link("reset during handshake");
        }
        self.send(OutboundEvent::Authenticate(identity.clone())).await
    }

    async fn send(&self, event: OutboundEvent) -> Result<()> {
        self.sent.lock().expect("sent log").push(event);
        Ok(())
    }

    async fn ping(&self) -> Result<()> {
        if self.hanging_pings.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        Ok(())
    }

    async fn close(&self) {
        self.closes.fetch_add(1, Ordering::SeqCst);
    }

    fn subscribe(&self) -> broadcast::Receiver<InboundEvent> {
        self.events.subscribe()
    }
}

/// Backend answering from scripted results; unscripted sends succeed with fresh ids.
pub(crate) struct FakeBackend {
    author: UserId,
    next_id: AtomicU64,
    sends: Mutex<VecDeque<ChatResult<MessageRecord>>>,
    sends_by_nonce: Mutex<HashMap<u64, ChatResult<MessageRecord>>>,
    pages: Mutex<HashMap<ChatScope, VecDeque<ChatResult<Vec<MessageRecord>>>>>,
    send_requests: Mutex<Vec<SendMessageRequest>>,
    fetches: Mutex<Vec<(ChatScope, usize)>>,
    page_gate: watch::Sender<bool>,
    send_gate: watch::Sender<bool>,
}

impl FakeBackend {
    pub(crate) fn new(author: i64) -> Arc<Self> {
        Arc::new(Self {
            author: UserId(author),
            next_id: AtomicU64::new(1000),
            sends: Mutex::new(VecDeque::new()),
            sends_by_nonce: Mutex::new(HashMap::new()),
            pages: Mutex::new(HashMap::new()),
            send_requests: Mutex::new(Vec::new()),
            fetches: Mutex::new(Vec::new()),
            page_gate: watch::channel(true).0,
            send_gate: watch::channel(true).0,
        })
    }

    pub(crate) fn script_send(&self, result: ChatResult<MessageRecord>) {
        self.sends.lock().expect("sends").push_back(result);
    }

    /// Answer for the request carrying `nonce`, whatever order requests arrive in.
    pub(crate) fn script_send_for(&self, nonce: u64, result: ChatResult<MessageRecord>) {
        self.sends_by_nonce
            .lock()
            .expect("sends")
            .insert(nonce, result);
    }

    pub(crate) fn script_page(&self, scope: ChatScope, result: ChatResult<Vec<MessageRecord>>) {
        self.pages
            .lock()
            .expect("pages")
            .entry(scope)
            .or_default()
            .push_back(result);
    }

    /// Page requests block until [`FakeBackend::release_pages`].
    pub(crate) fn hold_pages(&self) {
        self.page_gate.send_replace(false);
    }

    pub(crate) fn release_pages(&self) {
        self.page_gate.send_replace(true);
    }

    pub(crate) fn hold_sends(&self) {
        self.send_gate.send_replace(false);
    }

    pub(crate) fn release_sends(&self) {
        self.send_gate.send_replace(true);
    }

    pub(crate) fn send_requests(&self) -> Vec<SendMessageRequest> {
        self.send_requests.lock().expect("send requests").clone()
    }

    pub(crate) fn send_count(&self) -> usize {
        self.send_requests.lock().expect("send requests").len()
    }

    pub(crate) fn fetches(&self) -> Vec<(ChatScope, usize)> {
        self.fetches.lock().expect("fetches").clone()
    }
}

#[async_trait]
impl ChatBackend for FakeBackend {
    async fn fetch_page(&self, scope: ChatScope, offset: usize) -> ChatResult<Vec<MessageRecord>> {
        self.fetches.lock().expect("fetches").push((scope, offset));
        let mut gate = self.page_gate.subscribe();
        let _ = gate.wait_for(|open| *open).await;
        let scripted = self
            .pages
            .lock()
            .expect("pages")
            .get_mut(&scope)
            .and_then(VecDeque::pop_front);
        scripted.unwrap_or_else(|| Ok(Vec::new()))
    }

    async fn send_message(&self, request: SendMessageRequest) -> ChatResult<MessageRecord> {
        self.send_requests
            .lock()
            .expect("send requests")
            .push(request.clone());
        let mut gate = self.send_gate.subscribe();
        let _ = gate.wait_for(|open| *open).await;
        let by_nonce = self
            .sends_by_nonce
            .lock()
            .expect("sends")
            .remove(&request.client_nonce);
        let scripted = by_nonce.or_else(|| self.sends.lock().expect("sends").pop_front());
        scripted.unwrap_or_else(|| {
            Ok(MessageRecord {
                message_id: self.next_id.fetch_add(1, Ordering::SeqCst),
                scope: request.scope,
                author_id: self.author,
                author_name: None,
                content: request.content,
                created_at: Utc::now(),
                attachments: request.attachments,
                client_nonce: Some(request.client_nonce),
            })
        })
    }
}

#[derive(Default)]
pub(crate) struct RecordingSink {
    events: Mutex<Vec<RenderEvent>>,
}

impl RecordingSink {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub(crate) fn events(&self) -> Vec<RenderEvent> {
        self.events.lock().expect("render log").clone()
    }

    pub(crate) fn clear(&self) {
        self.events.lock().expect("render log").clear();
    }

    pub(crate) fn count(&self, matches: impl Fn(&RenderEvent) -> bool) -> usize {
        self.events().iter().filter(|event| matches(event)).count()
    }

    pub(crate) fn typing_summaries(&self, scope: ChatScope) -> Vec<Option<String>> {
        self.events()
            .into_iter()
            .filter_map(|event| match event {
                RenderEvent::TypingChanged { scope: s, summary } if s == scope => Some(summary),
                _ => None,
            })
            .collect()
    }

    fn record(&self, event: RenderEvent) {
        self.events.lock().expect("render log").push(event);
    }
}

impl RenderSink for RecordingSink {
    fn append(&self, message: &Message) {
        self.record(RenderEvent::Appended(message.clone()));
    }

    fn reconcile(&self, temp_id: MessageId, confirmed: &Message) {
        self.record(RenderEvent::Reconciled {
            temp_id,
            confirmed: confirmed.clone(),
        });
    }

    fn mark_failed(&self, id: MessageId, reason: &str) {
        self.record(RenderEvent::Failed {
            id,
            reason: reason.to_string(),
        });
    }

    fn mark_pending(&self, id: MessageId) {
        self.record(RenderEvent::Pending(id));
    }

    fn prepend_history(&self, scope: ChatScope, messages: &[Message]) {
        self.record(RenderEvent::HistoryPrepended {
            scope,
            messages: messages.to_vec(),
        });
    }

    fn show_loading(&self, scope: ChatScope) {
        self.record(RenderEvent::LoadingShown(scope));
    }

    fn hide_loading(&self, scope: ChatScope) {
        self.record(RenderEvent::LoadingHidden(scope));
    }

    fn load_failed(&self, scope: ChatScope, reason: &str) {
        self.record(RenderEvent::LoadFailed {
            scope,
            reason: reason.to_string(),
        });
    }

    fn typing_changed(&self, scope: ChatScope, summary: Option<&str>) {
        self.record(RenderEvent::TypingChanged {
            scope,
            summary: summary.map(str::to_string),
        });
    }

    fn connection_changed(&self, state: ConnectionState) {
        self.record(RenderEvent::ConnectionChanged(state));
    }
}
