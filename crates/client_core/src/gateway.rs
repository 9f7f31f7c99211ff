use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use async_trait::async_trait;
use shared::protocol::{Identity, InboundEvent, InboundKind, OutboundEvent};
use tokio::{
    sync::{broadcast, watch, Mutex, RwLock},
    task::JoinHandle,
};
use tokio_stream::{wrappers::errors::BroadcastStreamRecvError, wrappers::BroadcastStream, StreamExt};
use tracing::{debug, error, info, warn};

use crate::{
    config::ClientConfig,
    error::{ChatError, ChatResult},
    session::SessionReader,
    transport::RealtimeTransport,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Authenticated,
}

impl ConnectionState {
    /// `Authenticated` implies `Connected`.
    pub fn is_connected(self) -> bool {
        matches!(
            self,
            ConnectionState::Connected | ConnectionState::Authenticated
        )
    }
}

#[async_trait]
pub trait InboundHandler: Send + Sync {
    async fn handle(&self, event: &InboundEvent);
}

#[derive(Debug, Clone)]
pub struct GatewayOptions {
    pub reconnect_attempts: u32,
    pub reconnect_delay: Duration,
    pub heartbeat_interval: Duration,
    pub heartbeat_timeout: Duration,
}

impl From<&ClientConfig> for GatewayOptions {
    fn from(config: &ClientConfig) -> Self {
        Self {
            reconnect_attempts: config.reconnect_attempts,
            reconnect_delay: config.reconnect_delay(),
            heartbeat_interval: config.heartbeat_interval(),
            heartbeat_timeout: config.heartbeat_timeout(),
        }
    }
}

#[derive(Default)]
struct GatewayTasks {
    pump: Option<JoinHandle<()>>,
    reconnect: Option<JoinHandle<()>>,
    closed_by_user: bool,
}

/// Owner of the single realtime connection shared by every chat view.
pub struct ConnectionGateway {
    transport: Arc<dyn RealtimeTransport>,
    identity: Identity,
    session: SessionReader,
    options: GatewayOptions,
    state: watch::Sender<ConnectionState>,
    transitions: broadcast::Sender<ConnectionState>,
    handlers: RwLock<HashMap<InboundKind, Vec<Arc<dyn InboundHandler>>>>,
    /// Bumped whenever a link is established or torn down; heartbeats of older links stop.
    link_generation: AtomicU64,
    tasks: Mutex<GatewayTasks>,
}

impl ConnectionGateway {
    pub fn new(
        transport: Arc<dyn RealtimeTransport>,
        identity: Identity,
        session: SessionReader,
        options: GatewayOptions,
    ) -> Arc<Self> {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        let (transitions, _) = broadcast::channel(64);
        Arc::new(Self {
            transport,
            identity,
            session,
            options,
            state,
            transitions,
            handlers: RwLock::new(HashMap::new()),
            link_generation: AtomicU64::new(0),
            tasks: Mutex::new(GatewayTasks::default()),
        })
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    /// Every state transition, in order.
    pub fn subscribe_state(&self) -> broadcast::Receiver<ConnectionState> {
        self.transitions.subscribe()
    }

    /// Resolves once the connection is authenticated, or fails after `timeout`.
    pub async fn wait_authenticated(&self, timeout: Duration) -> ChatResult<()> {
        let mut rx = self.state.subscribe();
        let ready = tokio::time::timeout(
            timeout,
            rx.wait_for(|state| *state == ConnectionState::Authenticated),
        )
        .await
        .map(|waited| waited.is_ok())
        .unwrap_or(false);
        if ready {
            Ok(())
        } else {
            Err(ChatError::NotConnected)
        }
    }

    /// Registers an inbound handler. Handlers for the same kind all fire, in registration order.
    pub async fn on(&self, kind: InboundKind, handler: Arc<dyn InboundHandler>) {
        self.handlers
            .write()
            .await
            .entry(kind)
            .or_default()
            .push(handler);
    }

    /// Establishes the connection, or reuses the one already open or opening.
    pub async fn connect(self: &Arc<Self>) -> ChatResult<()> {
        {
            let mut tasks = self.tasks.lock().await;
            if tasks.pump.is_none() {
                tasks.pump = Some(self.spawn_pump());
            }
            if self.state() != ConnectionState::Disconnected || tasks.reconnect.is_some() {
                debug!(state = ?self.state(), "gateway: reusing existing connection");
                return Ok(());
            }
            tasks.closed_by_user = false;
            self.set_state(ConnectionState::Connecting);
        }

        if let Err(err) = self.establish().await {
            self.set_state(ConnectionState::Disconnected);
            return Err(err);
        }
        Ok(())
    }

    /// Sends the identity over an open connection.
    pub async fn authenticate(&self) -> ChatResult<()> {
        if !self.state().is_connected() {
            return Err(ChatError::NotConnected);
        }
        self.transport
            .authenticate(&self.identity)
            .await
            .map_err(|err| ChatError::Transport(format!("{err:#}")))?;
        self.set_state(ConnectionState::Authenticated);
        info!(
            user_id = self.identity.user_id.0,
            "gateway: authenticated"
        );

        if let Some(scope) = self.session.current() {
            info!(%scope, "gateway: rejoining active scope");
            self.emit(OutboundEvent::JoinScope { scope }).await;
        }
        Ok(())
    }

    /// Hands an event to the transport. Never fails; dropped events are logged.
    pub async fn emit(&self, event: OutboundEvent) -> bool {
        let state = self.state();
        if state != ConnectionState::Authenticated {
            warn!(
                event = event.name(),
                ?state,
                "gateway: dropping outbound event; connection not authenticated"
            );
            return false;
        }
        let name = event.name();
        match self.transport.send(event).await {
            Ok(()) => true,
            Err(err) => {
                warn!(event = name, "gateway: emit failed: {err:#}");
                false
            }
        }
    }

    /// Closes the connection on purpose; no reconnect follows.
    pub async fn disconnect(&self) {
        let (pump, reconnect) = {
            let mut tasks = self.tasks.lock().await;
            tasks.closed_by_user = true;
            (tasks.pump.take(), tasks.reconnect.take())
        };
        if let Some(task) = reconnect {
            task.abort();
        }
        if let Some(task) = pump {
            task.abort();
        }
        self.link_generation.fetch_add(1, Ordering::SeqCst);
        self.transport.close().await;
        self.set_state(ConnectionState::Disconnected);
        info!("gateway: disconnected by client");
    }

    async fn establish(self: &Arc<Self>) -> ChatResult<()> {
        self.transport
            .connect()
            .await
            .map_err(|err| ChatError::Transport(format!("{err:#}")))?;
        let generation = self.link_generation.fetch_add(1, Ordering::SeqCst) + 1;
        self.set_state(ConnectionState::Connected);
        self.spawn_heartbeat(generation);

        if let Err(err) = self.authenticate().await {
            self.link_generation.fetch_add(1, Ordering::SeqCst);
            self.transport.close().await;
            return Err(err);
        }
        Ok(())
    }

    fn set_state(&self, next: ConnectionState) {
        let previous = self.state.send_replace(next);
        if previous != next {
            info!(from = ?previous, to = ?next, "gateway: connection state changed");
            let _ = self.transitions.send(next);
        }
    }

    fn spawn_pump(self: &Arc<Self>) -> JoinHandle<()> {
        let mut inbound = BroadcastStream::new(self.transport.subscribe());
        let gateway = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(item) = inbound.next().await {
                match item {
                    Ok(event) => gateway.dispatch(event).await,
                    Err(BroadcastStreamRecvError::Lagged(skipped)) => {
                        warn!(skipped, "gateway: inbound events lagged");
                    }
                }
            }
            debug!("gateway: inbound stream ended");
        })
    }

    async fn dispatch(self: &Arc<Self>, event: InboundEvent) {
        if let InboundEvent::ConnectionChanged(status) = &event {
            if !status.connected {
                let reason = status
                    .reason
                    .clone()
                    .unwrap_or_else(|| "connection closed".to_string());
                self.handle_connection_lost(&reason).await;
            }
        }

        let handlers = self
            .handlers
            .read()
            .await
            .get(&event.kind())
            .cloned()
            .unwrap_or_default();
        if handlers.is_empty() {
            debug!(event = event.kind().as_str(), "gateway: no handler registered");
        }
        for handler in handlers {
            handler.handle(&event).await;
        }
    }

    async fn handle_connection_lost(self: &Arc<Self>, reason: &str) {
        let mut tasks = self.tasks.lock().await;
        if tasks.closed_by_user || tasks.reconnect.is_some() || !self.state().is_connected() {
            debug!(reason, "gateway: ignoring connection loss; no live link");
            return;
        }
        warn!(reason, "gateway: connection lost; scheduling reconnect");
        self.link_generation.fetch_add(1, Ordering::SeqCst);
        self.transport.close().await;
        self.set_state(ConnectionState::Disconnected);
        let gateway = Arc::clone(self);
        tasks.reconnect = Some(tokio::spawn(async move {
            gateway.reconnect_loop().await;
        }));
    }

    async fn reconnect_loop(self: &Arc<Self>) {
        let max_attempts = self.options.reconnect_attempts;
        for attempt in 1..=max_attempts {
            tokio::time::sleep(self.options.reconnect_delay).await;
            // Held through the handshake: a drop on the new link is only
            // handled once this task has cleared `reconnect`.
            let mut tasks = self.tasks.lock().await;
            if tasks.closed_by_user {
                return;
            }
            info!(attempt, max_attempts, "gateway: reconnecting");
            self.set_state(ConnectionState::Connecting);
            match self.establish().await {
                Ok(()) => {
                    info!(attempt, "gateway: reconnected");
                    tasks.reconnect = None;
                    return;
                }
                Err(err) => {
                    warn!(attempt, "gateway: reconnect attempt failed: {err}");
                    self.set_state(ConnectionState::Disconnected);
                }
            }
        }
        error!(max_attempts, "gateway: reconnect attempts exhausted; staying disconnected");
        self.tasks.lock().await.reconnect = None;
    }

    fn spawn_heartbeat(self: &Arc<Self>, generation: u64) {
        let gateway = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(gateway.options.heartbeat_interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if gateway.link_generation.load(Ordering::SeqCst) != generation
                    || !gateway.state().is_connected()
                {
                    break;
                }
                let pong =
                    tokio::time::timeout(gateway.options.heartbeat_timeout, gateway.transport.ping())
                        .await;
                if gateway.link_generation.load(Ordering::SeqCst) != generation {
                    break;
                }
                match pong {
                    Ok(Ok(())) => debug!("gateway: heartbeat acknowledged"),
                    Ok(Err(err)) => {
                        debug!("gateway: heartbeat failed: {err:#}");
                        gateway.handle_connection_lost("heartbeat failed").await;
                        break;
                    }
                    Err(_) => {
                        debug!("gateway: heartbeat missed");
                        gateway.handle_connection_lost("heartbeat missed").await;
                        break;
                    }
                }
            }
        });
    }
}

#[cfg(test)]
#[path = "tests/gateway_tests.rs"]
mod tests;
