use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use futures::{stream::SplitSink, SinkExt, StreamExt};
use shared::protocol::{Identity, InboundEvent, LinkStatus, OutboundEvent};
use tokio::{
    net::TcpStream,
    sync::{broadcast, Mutex, Notify},
    task::JoinHandle,
};
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use tracing::{debug, warn};

/// Low-level realtime link. The gateway owns lifecycle policy; implementations only move frames.
///
/// An unexpected drop of the link must be reported as an
/// [`InboundEvent::ConnectionChanged`] with `connected: false`.
#[async_trait]
pub trait RealtimeTransport: Send + Sync {
    async fn connect(&self) -> Result<()>;
    async fn authenticate(&self, identity: &Identity) -> Result<()>;
    async fn send(&self, event: OutboundEvent) -> Result<()>;
    /// Resolves once the remote side answered a liveness ping.
    async fn ping(&self) -> Result<()>;
    async fn close(&self);
    fn subscribe(&self) -> broadcast::Receiver<InboundEvent>;
}

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;

/// JSON-over-WebSocket transport; frames are `{"event": ..., "payload": ...}`.
pub struct WebSocketTransport {
    url: String,
    writer: Mutex<Option<WsSink>>,
    reader: Mutex<Option<JoinHandle<()>>>,
    events: broadcast::Sender<InboundEvent>,
    pong: Arc<Notify>,
    closing: Arc<AtomicBool>,
}

impl WebSocketTransport {
    pub fn new(url: impl Into<String>) -> Self {
        let (events, _) = broadcast::channel(1024);
        Self {
            url: url.into(),
            writer: Mutex::new(None),
            reader: Mutex::new(None),
            events,
            pong: Arc::new(Notify::new()),
            closing: Arc::new(AtomicBool::new(false)),
        }
    }

    async fn write(&self, frame: Message) -> Result<()> {
        let mut guard = self.writer.lock().await;
        let sink = guard
            .as_mut()
            .ok_or_else(|| anyhow!("websocket is not connected"))?;
        sink.send(frame).await.context("websocket send failed")
    }
}

#[async_trait]
impl RealtimeTransport for WebSocketTransport {
    async fn connect(&self) -> Result<()> {
        let (ws_stream, _) = connect_async(&self.url)
            .await
            .with_context(|| format!("failed to connect websocket: {}", self.url))?;
        let (sink, mut stream) = ws_stream.split();
        self.closing.store(false, Ordering::SeqCst);
        *self.writer.lock().await = Some(sink);

        let events = self.events.clone();
        let pong = Arc::clone(&self.pong);
        let closing = Arc::clone(&self.closing);
        let task = tokio::spawn(async move {
            let reason = loop {
                match stream.next().await {
                    Some(Ok(Message::Text(text))) => {
                        match serde_json::from_str::<InboundEvent>(&text) {
                            Ok(event) => {
                                let _ = events.send(event);
                            }
                            Err(err) => warn!("transport: dropping invalid frame: {err}"),
                        }
                    }
                    Some(Ok(Message::Pong(_))) => pong.notify_waiters(),
                    Some(Ok(Message::Close(frame))) => {
                        break frame
                            .map(|f| f.reason.to_string())
                            .unwrap_or_else(|| "closed by server".to_string());
                    }
                    Some(Ok(_)) => {}
                    Some(Err(err)) => break format!("websocket receive failed: {err}"),
                    None => break "websocket stream ended".to_string(),
                }
            };
            if closing.load(Ordering::SeqCst) {
                debug!("transport: reader stopped after local close");
                return;
            }
            let _ = events.send(InboundEvent::ConnectionChanged(LinkStatus {
                connected: false,
                reason: Some(reason),
            }));
        });

        if let Some(previous) = self.reader.lock().await.replace(task) {
            previous.abort();
        }
        Ok(())
    }

    async fn authenticate(&self, identity: &Identity) -> Result<()> {
        self.send(OutboundEvent::Authenticate(identity.clone()))
            .await
            .context("failed to send identity")
    }

    async fn send(&self, event: OutboundEvent) -> Result<()> {
        let text = serde_json::to_string(&event)?;
        self.write(Message::Text(text)).await
    }

    async fn ping(&self) -> Result<()> {
        let notified = self.pong.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();
        self.write(Message::Ping(Vec::new())).await?;
        notified.await;
        Ok(())
    }

    async fn close(&self) {
        self.closing.store(true, Ordering::SeqCst);
        if let Some(mut sink) = self.writer.lock().await.take() {
            let _ = sink.close().await;
        }
        if let Some(reader) = self.reader.lock().await.take() {
            reader.abort();
        }
    }

    fn subscribe(&self) -> broadcast::Receiver<InboundEvent> {
        self.events.subscribe()
    }
}

#[cfg(test)]
#[path = "tests/transport_tests.rs"]
mod tests;
