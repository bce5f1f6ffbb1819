//! Client process handles
//!
//! A [`ClientHandle`] is the crate's view of a client process: an identity,
//! a liveness token, and a notice channel. Coordinators store the handle,
//! watch the liveness token, and push notices (host death, returned
//! messages) back through the channel. Dropping the paired [`ClientGuard`]
//! is how a client process "dies".

use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::mpsc;
use tokio_util::sync::{CancellationToken, DropGuard};

/// Asynchronous notices delivered to a client process
#[derive(Debug, Clone)]
pub enum ClientNotice {
    /// The broker host serving this client's channel went away
    BrokerHostDown(String),
    /// An un-routable message published on this client's channel came back
    Returned(Bytes),
}

/// Handle to a client process, cheap to clone
#[derive(Clone)]
pub struct ClientHandle {
    id: Arc<str>,
    alive: CancellationToken,
    notices: mpsc::UnboundedSender<ClientNotice>,
}

/// Keeps the client alive; dropping it cancels the liveness token
pub struct ClientGuard {
    _inner: DropGuard,
}

impl ClientHandle {
    /// Create a handle plus its liveness guard and notice receiver
    pub fn new(
        id: impl Into<String>,
    ) -> (Self, ClientGuard, mpsc::UnboundedReceiver<ClientNotice>) {
        let alive = CancellationToken::new();
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = Self {
            id: Arc::from(id.into()),
            alive: alive.clone(),
            notices: tx,
        };
        let guard = ClientGuard {
            _inner: alive.drop_guard(),
        };
        (handle, guard, rx)
    }

    /// The client's identity
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Whether the client process is still alive
    pub fn is_alive(&self) -> bool {
        !self.alive.is_cancelled()
    }

    /// Token that fires when the client process dies
    pub fn alive_token(&self) -> CancellationToken {
        self.alive.clone()
    }

    /// Deliver a notice, best effort
    pub fn notify(&self, notice: ClientNotice) {
        let _ = self.notices.send(notice);
    }
}

impl std::fmt::Debug for ClientHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientHandle")
            .field("id", &self.id)
            .field("alive", &self.is_alive())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_guard_drop_kills_client() {
        let (handle, guard, _rx) = ClientHandle::new("p1");
        assert!(handle.is_alive());

        drop(guard);
        assert!(!handle.is_alive());
        handle.alive_token().cancelled().await;
    }

    #[tokio::test]
    async fn test_notices_are_delivered() {
        let (handle, _guard, mut rx) = ClientHandle::new("p1");
        handle.notify(ClientNotice::BrokerHostDown("rabbit-1".into()));

        match rx.recv().await {
            Some(ClientNotice::BrokerHostDown(host)) => assert_eq!(host, "rabbit-1"),
            other => panic!("unexpected notice: {other:?}"),
        }
    }

    #[test]
    fn test_notify_after_receiver_gone_is_silent() {
        let (handle, _guard, rx) = ClientHandle::new("p1");
        drop(rx);
        handle.notify(ClientNotice::Returned(Bytes::from_static(b"{}")));
    }
}
