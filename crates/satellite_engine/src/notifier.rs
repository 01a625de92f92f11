//! Table-change notifications.
//!
//! The engine calls the notifier once per applied transaction, local or
//! remote, with the set of tables it touched. This is the only externally
//! observable "something changed" signal.

use std::collections::BTreeSet;
use tokio::sync::broadcast;

/// Where an applied transaction came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeOrigin {
    /// Written through this process.
    Local,
    /// Received from the peer (live transaction or shape delivery).
    Remote,
}

/// Tables touched by one applied transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableChange {
    /// Database the change applies to.
    pub db_name: String,
    /// Affected tables.
    pub tables: BTreeSet<String>,
    /// Source of the change.
    pub origin: ChangeOrigin,
}

/// Sink for table-change notifications.
pub trait Notifier: Send + Sync {
    /// Called after a transaction is committed locally.
    fn tables_changed(&self, change: &TableChange);
}

/// Notifier that fans changes out over a broadcast channel.
pub struct ChannelNotifier {
    sender: broadcast::Sender<TableChange>,
}

impl ChannelNotifier {
    /// Creates a notifier that buffers up to `capacity` undelivered changes
    /// per subscriber.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Subscribes to future changes.
    pub fn subscribe(&self) -> broadcast::Receiver<TableChange> {
        self.sender.subscribe()
    }
}

impl Default for ChannelNotifier {
    fn default() -> Self {
        Self::new(256)
    }
}

impl Notifier for ChannelNotifier {
    fn tables_changed(&self, change: &TableChange) {
        // No subscribers is not an error.
        let _ = self.sender.send(change.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delivers_to_every_subscriber() {
        let notifier = ChannelNotifier::default();
        let mut a = notifier.subscribe();
        let mut b = notifier.subscribe();

        let change = TableChange {
            db_name: "app.db".into(),
            tables: ["items".to_string()].into_iter().collect(),
            origin: ChangeOrigin::Remote,
        };
        notifier.tables_changed(&change);

        assert_eq!(a.try_recv().unwrap(), change);
        assert_eq!(b.try_recv().unwrap(), change);
    }

    #[test]
    fn no_subscribers_is_fine() {
        ChannelNotifier::new(1).tables_changed(&TableChange {
            db_name: "x".into(),
            tables: BTreeSet::new(),
            origin: ChangeOrigin::Local,
        });
    }
}
