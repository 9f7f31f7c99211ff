//! Active-chat context shared by every component.
//!
//! [`ActiveSession`] is the only handle able to change the current scope and is
//! owned by the orchestrator. Every other component receives a [`SessionReader`].

use shared::domain::ChatScope;
use tokio::sync::watch;

pub struct ActiveSession {
    tx: watch::Sender<Option<ChatScope>>,
}

impl ActiveSession {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(None);
        Self { tx }
    }

    pub fn reader(&self) -> SessionReader {
        SessionReader {
            rx: self.tx.subscribe(),
        }
    }

    pub fn current(&self) -> Option<ChatScope> {
        *self.tx.borrow()
    }

    /// Replaces the current scope and returns the previous one.
    pub(crate) fn set(&self, scope: Option<ChatScope>) -> Option<ChatScope> {
        self.tx.send_replace(scope)
    }
}

impl Default for ActiveSession {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Clone)]
pub struct SessionReader {
    rx: watch::Receiver<Option<ChatScope>>,
}

impl SessionReader {
    pub fn current(&self) -> Option<ChatScope> {
        *self.rx.borrow()
    }

    pub fn is_current(&self, scope: &ChatScope) -> bool {
        self.current().as_ref() == Some(scope)
    }
}
