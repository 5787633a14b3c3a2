//! In-process message delivery between DKG sessions

use async_trait::async_trait;
use bls_dkg_core::{DkgMessage, PartyIndex, Session};
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::{debug, trace};

/// Transport errors
#[derive(Debug, Error)]
pub enum NetworkError {
    /// No session registered under the sender's index
    #[error("Party {0} is not connected")]
    NotConnected(PartyIndex),
}

/// Moves messages between parties
#[async_trait]
pub trait Transport: Send + Sync {
    /// Deliver a message to every committee member
    async fn broadcast(&self, from: PartyIndex, message: DkgMessage) -> Result<(), NetworkError>;

    /// Deliver a message to `to` only
    async fn send_direct(
        &self,
        from: PartyIndex,
        to: PartyIndex,
        message: DkgMessage,
    ) -> Result<(), NetworkError>;

    /// Route each message by its recipient
    async fn send(&self, from: PartyIndex, messages: Vec<DkgMessage>) -> Result<(), NetworkError> {
        for message in messages {
            match message.recipient() {
                Some(to) => self.send_direct(from, to, message).await?,
                None => self.broadcast(from, message).await?,
            }
        }
        Ok(())
    }

    /// Wait until new messages may have arrived, or at most `max_wait`
    async fn wait_for_activity(&self, max_wait: Duration);
}

/// Broadcast network connecting sessions that live in the same process
pub struct LoopbackNetwork {
    /// Registered sessions by party index
    sessions: Arc<DashMap<PartyIndex, Arc<Session>>>,
    /// Wakes parties waiting for input
    notify: broadcast::Sender<()>,
}

impl LoopbackNetwork {
    /// Create an empty network
    pub fn new() -> Self {
        let (notify, _) = broadcast::channel(100);
        Self {
            sessions: Arc::new(DashMap::new()),
            notify,
        }
    }

    /// Connect a session so it can send and receive
    pub fn register(&self, session: Arc<Session>) {
        self.sessions.insert(session.party_index(), session);
    }

    /// Number of connected sessions
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

impl Default for LoopbackNetwork {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Transport for LoopbackNetwork {
    async fn broadcast(&self, from: PartyIndex, message: DkgMessage) -> Result<(), NetworkError> {
        if !self.sessions.contains_key(&from) {
            return Err(NetworkError::NotConnected(from));
        }

        for entry in self.sessions.iter() {
            // Rejections only drop this copy; the recipient decides what it accepts.
            if let Err(e) = entry.value().push_message(message.clone()) {
                debug!(
                    from,
                    to = *entry.key(),
                    round = message.round(),
                    error = %e,
                    "Message rejected"
                );
            }
        }
        trace!(from, round = message.round(), "Message broadcast");

        let _ = self.notify.send(());
        Ok(())
    }

    async fn send_direct(
        &self,
        from: PartyIndex,
        to: PartyIndex,
        message: DkgMessage,
    ) -> Result<(), NetworkError> {
        if !self.sessions.contains_key(&from) {
            return Err(NetworkError::NotConnected(from));
        }
        let recipient = self
            .sessions
            .get(&to)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or(NetworkError::NotConnected(to))?;

        let round = message.round();
        if let Err(e) = recipient.push_message(message) {
            debug!(from, to, round, error = %e, "Message rejected");
        }
        trace!(from, to, round, "Message sent");

        let _ = self.notify.send(());
        Ok(())
    }

    async fn wait_for_activity(&self, max_wait: Duration) {
        let mut rx = self.notify.subscribe();
        tokio::select! {
            _ = rx.recv() => {}
            _ = tokio::time::sleep(max_wait) => {}
        }
    }
}
