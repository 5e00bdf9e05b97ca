use std::{collections::HashMap, fmt, sync::Arc, time::Duration};

use tokio::sync::{mpsc, Mutex};

use crate::error::{Error, RoutingErrorKind};

/// A capacity-1 handoff between the publisher of a peer id and the subscriber waiting for it.
struct Slot<T> {
    sender: mpsc::Sender<T>,
    receiver: Mutex<mpsc::Receiver<T>>,
}

impl<T> Slot<T> {
    fn new() -> Self {
        let (sender, receiver) = mpsc::channel(1);
        Self {
            sender,
            receiver: Mutex::new(receiver),
        }
    }
}

/// RoutingTable pairs publishers with subscribers by peer id. Whichever side arrives first creates the slot,
/// so the handoff works in either order.
pub struct RoutingTable<T> {
    slots: Mutex<HashMap<String, Arc<Slot<T>>>>,
}

impl<T> fmt::Debug for RoutingTable<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RoutingTable").finish_non_exhaustive()
    }
}

impl<T: Send + 'static> Default for RoutingTable<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Send + 'static> RoutingTable<T> {
    pub fn new() -> Self {
        Self {
            slots: Mutex::new(HashMap::new()),
        }
    }

    async fn slot(&self, peer_id: &str) -> Arc<Slot<T>> {
        let mut slots = self.slots.lock().await;
        slots
            .entry(peer_id.to_owned())
            .or_insert_with(|| {
                tracing::debug!("Routing slot for peer_id={} is created", peer_id);
                Arc::new(Slot::new())
            })
            .clone()
    }

    /// Hands `value` over to the subscriber of `peer_id`. When a previous value is still pending this waits
    /// until it has been consumed.
    pub async fn publish(&self, peer_id: &str, value: T) -> Result<(), Error> {
        let slot = self.slot(peer_id).await;
        slot.sender.send(value).await.map_err(|_| {
            Error::new_routing(
                format!("Routing slot for {} is closed", peer_id),
                RoutingErrorKind::SlotClosedError,
            )
        })?;
        tracing::debug!("Published into routing slot peer_id={}", peer_id);
        Ok(())
    }

    /// Waits for the value published under `peer_id`. `None` waits forever.
    pub async fn acquire(&self, peer_id: &str, timeout: Option<Duration>) -> Result<T, Error> {
        let slot = self.slot(peer_id).await;
        let wait = async {
            let mut receiver = slot.receiver.lock().await;
            receiver.recv().await
        };

        let received = match timeout {
            Some(duration) => tokio::time::timeout(duration, wait).await.map_err(|_| {
                Error::new_routing(
                    format!(
                        "Publisher {} did not arrive within {:?}",
                        peer_id, duration
                    ),
                    RoutingErrorKind::RoutingTimeoutError,
                )
            })?,
            None => wait.await,
        };

        received.ok_or_else(|| {
            Error::new_routing(
                format!("Routing slot for {} is closed", peer_id),
                RoutingErrorKind::SlotClosedError,
            )
        })
    }

    /// Takes back a value nobody has claimed yet, when `is_own` recognises it. A value published by someone
    /// else is put back. Returns whether a value was withdrawn.
    pub async fn withdraw(&self, peer_id: &str, is_own: impl Fn(&T) -> bool) -> bool {
        let slot = {
            let slots = self.slots.lock().await;
            match slots.get(peer_id) {
                Some(slot) => slot.clone(),
                None => return false,
            }
        };
        let value = {
            // A locked receiver belongs to a waiting subscriber, so nothing is pending.
            let Ok(mut receiver) = slot.receiver.try_lock() else {
                return false;
            };
            match receiver.try_recv() {
                Ok(value) => value,
                Err(_) => return false,
            }
        };
        if is_own(&value) {
            tracing::debug!("Withdrew unclaimed value from routing slot peer_id={}", peer_id);
            return true;
        }
        if slot.sender.send(value).await.is_err() {
            tracing::warn!("Routing slot for peer_id={} closed while restoring a value", peer_id);
        }
        false
    }

    /// Whether a published value is waiting for a subscriber.
    pub async fn is_pending(&self, peer_id: &str) -> bool {
        let slots = self.slots.lock().await;
        slots
            .get(peer_id)
            .map(|slot| slot.sender.capacity() == 0)
            .unwrap_or(false)
    }

    pub async fn len(&self) -> usize {
        self.slots.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscriber_first_waits_for_publisher() {
        let table = Arc::new(RoutingTable::<String>::new());

        let waiting = {
            let table = table.clone();
            tokio::spawn(async move { table.acquire("u1", None).await })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!waiting.is_finished());

        table.publish("u1", "track-a".to_string()).await.unwrap();
        let received = waiting.await.unwrap().unwrap();
        assert_eq!(received, "track-a");
        assert_eq!(table.len().await, 1);
    }

    #[tokio::test]
    async fn publisher_first_is_received_immediately() {
        let table = RoutingTable::<String>::new();
        table.publish("u1", "track-a".to_string()).await.unwrap();
        assert!(table.is_pending("u1").await);

        let received = table
            .acquire("u1", Some(Duration::from_millis(10)))
            .await
            .unwrap();
        assert_eq!(received, "track-a");
        assert!(!table.is_pending("u1").await);
    }

    #[tokio::test]
    async fn acquire_times_out_without_publisher() {
        let table = RoutingTable::<String>::new();
        let err = table
            .acquire("ghost", Some(Duration::from_millis(20)))
            .await
            .unwrap_err();
        assert_eq!(
            err.routing_kind(),
            Some(&RoutingErrorKind::RoutingTimeoutError)
        );
        // The slot stays so a later publisher can still be paired.
        table.publish("ghost", "late".to_string()).await.unwrap();
        assert!(table.is_pending("ghost").await);
    }

    #[tokio::test]
    async fn second_publisher_blocks_until_drained() {
        let table = Arc::new(RoutingTable::<u32>::new());
        table.publish("u1", 1).await.unwrap();

        let second = {
            let table = table.clone();
            tokio::spawn(async move { table.publish("u1", 2).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!second.is_finished());

        assert_eq!(table.acquire("u1", None).await.unwrap(), 1);
        second.await.unwrap().unwrap();
        assert_eq!(table.acquire("u1", None).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn withdrawn_value_frees_the_slot() {
        let table = RoutingTable::<&'static str>::new();
        table.publish("u1", "stale").await.unwrap();

        assert!(table.withdraw("u1", |value| *value == "stale").await);
        assert!(!table.is_pending("u1").await);

        // The next publisher does not block behind the withdrawn value.
        tokio::time::timeout(Duration::from_millis(100), table.publish("u1", "fresh"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(table.acquire("u1", None).await.unwrap(), "fresh");
    }

    #[tokio::test]
    async fn withdraw_keeps_values_it_does_not_own() {
        let table = RoutingTable::<&'static str>::new();
        assert!(!table.withdraw("u1", |_| true).await);

        table.publish("u1", "fresh").await.unwrap();
        assert!(!table.withdraw("u1", |value| *value == "stale").await);
        assert!(table.is_pending("u1").await);
        assert_eq!(table.acquire("u1", None).await.unwrap(), "fresh");
    }

    #[tokio::test]
    async fn withdraw_does_not_disturb_a_waiting_subscriber() {
        let table = Arc::new(RoutingTable::<&'static str>::new());
        let waiting = {
            let table = table.clone();
            tokio::spawn(async move { table.acquire("u1", None).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert!(!table.withdraw("u1", |_| true).await);
        table.publish("u1", "fresh").await.unwrap();
        assert_eq!(waiting.await.unwrap().unwrap(), "fresh");
    }

    #[tokio::test]
    async fn slots_are_independent_per_peer() {
        let table = RoutingTable::<&'static str>::new();
        table.publish("a", "from-a").await.unwrap();
        table.publish("b", "from-b").await.unwrap();
        assert_eq!(table.acquire("b", None).await.unwrap(), "from-b");
        assert_eq!(table.acquire("a", None).await.unwrap(), "from-a");
    }
}
