//! Display publishers.

use tokio::sync::broadcast;
use tracing::trace;

use instrument_health_core::{Result, SessionIdentity, StatusRecord};

const DEFAULT_CHANNEL_CAPACITY: usize = 256;

/// Receives every accepted status change.
///
/// Called after the registry lock is released; errors are logged by the
/// registry and never reach the caller of `upsert`.
pub trait StatusPublisher: Send + Sync {
    /// Publish the new record, or `None` when the identity was removed.
    fn publish(&self, identity: &SessionIdentity, record: Option<&StatusRecord>) -> Result<()>;
}

/// One change seen by a display.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusUpdate {
    /// Identity that changed
    pub identity: SessionIdentity,
    /// New record, `None` after removal
    pub record: Option<StatusRecord>,
}

/// Fans status changes out over a tokio broadcast channel.
#[derive(Debug, Clone)]
pub struct BroadcastPublisher {
    sender: broadcast::Sender<StatusUpdate>,
}

impl BroadcastPublisher {
    /// Create a publisher buffering up to `capacity` updates per receiver.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Attach a new receiver. Slow receivers see `Lagged` and skip ahead.
    pub fn subscribe(&self) -> broadcast::Receiver<StatusUpdate> {
        self.sender.subscribe()
    }
}

impl Default for BroadcastPublisher {
    fn default() -> Self {
        Self::new(DEFAULT_CHANNEL_CAPACITY)
    }
}

impl StatusPublisher for BroadcastPublisher {
    fn publish(&self, identity: &SessionIdentity, record: Option<&StatusRecord>) -> Result<()> {
        let update = StatusUpdate {
            identity: identity.clone(),
            record: record.cloned(),
        };
        // No receivers means no display is attached
        if self.sender.send(update).is_err() {
            trace!(%identity, "No display attached");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_broadcast_reaches_every_receiver() {
        let publisher = BroadcastPublisher::new(8);
        let mut first = publisher.subscribe();
        let mut second = publisher.subscribe();
        let identity = SessionIdentity::resolved("DC2200", "M001").unwrap();

        publisher.publish(&identity, None).unwrap();

        assert_eq!(first.recv().await.unwrap().identity, identity);
        assert_eq!(second.recv().await.unwrap().record, None);
    }

    #[test]
    fn test_publish_without_receivers_is_ok() {
        let publisher = BroadcastPublisher::default();
        let identity = SessionIdentity::resolved("DC2200", "M001").unwrap();
        assert!(publisher.publish(&identity, None).is_ok());
    }
}
