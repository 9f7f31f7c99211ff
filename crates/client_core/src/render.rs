use shared::domain::{ChatScope, Message, MessageId};
use tokio::sync::broadcast;

use crate::gateway::ConnectionState;

/// Consumer of message records and session status, keyed by scope.
///
/// Implementations must not block; they are called while delivery work is in progress.
pub trait RenderSink: Send + Sync {
    fn append(&self, message: &Message);
    fn reconcile(&self, temp_id: MessageId, confirmed: &Message);
    fn mark_failed(&self, id: MessageId, reason: &str);
    fn mark_pending(&self, id: MessageId);
    /// Older history for `scope`, oldest first.
    fn prepend_history(&self, scope: ChatScope, messages: &[Message]);
    fn show_loading(&self, scope: ChatScope);
    fn hide_loading(&self, scope: ChatScope);
    fn load_failed(&self, scope: ChatScope, reason: &str);
    fn typing_changed(&self, scope: ChatScope, summary: Option<&str>);
    fn connection_changed(&self, state: ConnectionState);
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RenderEvent {
    Appended(Message),
    Reconciled {
        temp_id: MessageId,
        confirmed: Message,
    },
    Failed {
        id: MessageId,
        reason: String,
    },
    Pending(MessageId),
    HistoryPrepended {
        scope: ChatScope,
        messages: Vec<Message>,
    },
    LoadingShown(ChatScope),
    LoadingHidden(ChatScope),
    LoadFailed {
        scope: ChatScope,
        reason: String,
    },
    TypingChanged {
        scope: ChatScope,
        summary: Option<String>,
    },
    ConnectionChanged(ConnectionState),
}

/// Render sink that republishes every call on a broadcast channel.
pub struct EventRenderSink {
    events: broadcast::Sender<RenderEvent>,
}

impl EventRenderSink {
    pub fn new(capacity: usize) -> Self {
        let (events, _) = broadcast::channel(capacity);
        Self { events }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RenderEvent> {
        self.events.subscribe()
    }

    fn publish(&self, event: RenderEvent) {
        let _ = self.events.send(event);
    }
}

impl Default for EventRenderSink {
    fn default() -> Self {
        Self::new(1024)
    }
}

impl RenderSink for EventRenderSink {
    fn append(&self, message: &Message) {
        self.publish(RenderEvent::Appended(message.clone()));
    }

    fn reconcile(&self, temp_id: MessageId, confirmed: &Message) {
        self.publish(RenderEvent::Reconciled {
            temp_id,
            confirmed: confirmed.clone(),
        });
    }

    fn mark_failed(&self, id: MessageId, reason: &str) {
        self.publish(RenderEvent::Failed {
            id,
            reason: reason.to_string(),
        });
    }

    fn mark_pending(&self, id: MessageId) {
        self.publish(RenderEvent::Pending(id));
    }

    fn prepend_history(&self, scope: ChatScope, messages: &[Message]) {
        self.publish(RenderEvent::HistoryPrepended {
            scope,
            messages: messages.to_vec(),
        });
    }

    fn show_loading(&self, scope: ChatScope) {
        self.publish(RenderEvent::LoadingShown(scope));
    }

    fn hide_loading(&self, scope: ChatScope) {
        self.publish(RenderEvent::LoadingHidden(scope));
    }

    fn load_failed(&self, scope: ChatScope, reason: &str) {
        self.publish(RenderEvent::LoadFailed {
            scope,
            reason: reason.to_string(),
        });
    }

    fn typing_changed(&self, scope: ChatScope, summary: Option<&str>) {
        self.publish(RenderEvent::TypingChanged {
            scope,
            summary: summary.map(str::to_string),
        });
    }

    fn connection_changed(&self, state: ConnectionState) {
        self.publish(RenderEvent::ConnectionChanged(state));
    }
}
