//! Transport seam between connection handlers and room loops

use std::sync::Arc;
use tokio::sync::mpsc;

/// Transport errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("Channel closed")]
    Closed,

    #[error("Channel full, message dropped")]
    Full,
}

/// One-way, non-blocking message sink
///
/// Implementations must not block: the room loop sends from inside a tick.
pub trait Transport<M>: Send + Sync {
    fn send(&self, msg: M) -> Result<(), TransportError>;
}

pub type SharedTransport<M> = Arc<dyn Transport<M>>;

/// Transport backed by a bounded tokio channel
pub struct ChannelTransport<M> {
    tx: mpsc::Sender<M>,
}

impl<M> ChannelTransport<M> {
    pub fn new(tx: mpsc::Sender<M>) -> Self {
        Self { tx }
    }
}

impl<M> Clone for ChannelTransport<M> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
        }
    }
}

impl<M: Send + 'static> Transport<M> for ChannelTransport<M> {
    fn send(&self, msg: M) -> Result<(), TransportError> {
        self.tx.try_send(msg).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => TransportError::Full,
            mpsc::error::TrySendError::Closed(_) => TransportError::Closed,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::{assert_err, assert_ok};

    #[tokio::test]
    async fn channel_transport_reports_full_and_closed() {
        let (tx, mut rx) = mpsc::channel::<u32>(1);
        let transport = ChannelTransport::new(tx);

        assert_ok!(transport.send(1));
        assert_eq!(assert_err!(transport.send(2)), TransportError::Full);
        assert_eq!(rx.recv().await, Some(1));

        drop(rx);
        assert_eq!(transport.send(3), Err(TransportError::Closed));
    }

    #[test]
    fn shared_transport_is_object_safe() {
        let (tx, mut rx) = mpsc::channel::<&'static str>(4);
        let shared: SharedTransport<&'static str> = Arc::new(ChannelTransport::new(tx));
        let clone = shared.clone();

        assert_ok!(shared.send("a"));
        assert_ok!(clone.send("b"));
        assert_eq!(tokio_test::block_on(rx.recv()), Some("a"));
        assert_eq!(rx.try_recv(), Ok("b"));
    }
}
