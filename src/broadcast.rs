//! State fan-out to host subscribers
//!
//! The broadcaster owns the latest `(state, error)` pair and delivers it to
//! any number of subscribers. A new subscriber receives the current pair
//! immediately, then every later emission; emissions are totally ordered
//! across all subscribers because publication and subscriber-set changes
//! share one lock. Each snapshot travels as a single channel message, so a
//! subscriber never observes a torn pair.

use std::sync::{Arc, Mutex, Weak};
use std::task::{Context, Poll};

use futures::Stream;
use tokio::sync::mpsc;

use crate::state::StateSnapshot;

struct BroadcastInner {
    current: StateSnapshot,
    next_id: u64,
    subscribers: Vec<(u64, mpsc::UnboundedSender<StateSnapshot>)>,
}

/// Replay-of-one state broadcaster
pub struct StateBroadcaster {
    inner: Arc<Mutex<BroadcastInner>>,
}

impl StateBroadcaster {
    pub fn new(initial: StateSnapshot) -> Self {
        Self {
            inner: Arc::new(Mutex::new(BroadcastInner {
                current: initial,
                next_id: 0,
                subscribers: Vec::new(),
            })),
        }
    }

    /// The latest published snapshot.
    pub fn latest(&self) -> StateSnapshot {
        self.inner.lock().unwrap().current
    }

    /// Publish a snapshot to every subscriber.
    ///
    /// A snapshot identical to the current one is dropped; the stream only
    /// carries changes. Disconnected subscribers are pruned here.
    pub fn publish(&self, snapshot: StateSnapshot) {
        let mut inner = self.inner.lock().unwrap();
        if inner.current == snapshot {
            return;
        }
        inner.current = snapshot;
        inner
            .subscribers
            .retain(|(_, tx)| tx.send(snapshot).is_ok());
    }

    /// Register a subscriber.
    ///
    /// The current snapshot is queued for the new subscriber before the lock
    /// is released, so it can neither miss nor double-receive the pair that
    /// was current at subscribe time.
    pub fn subscribe(&self) -> Subscription {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut inner = self.inner.lock().unwrap();
        let id = inner.next_id;
        inner.next_id += 1;
        // The receiver is alive; this send cannot fail.
        let _ = tx.send(inner.current);
        inner.subscribers.push((id, tx));
        Subscription {
            id,
            rx,
            registry: Arc::downgrade(&self.inner),
        }
    }

    /// Number of live subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.inner.lock().unwrap().subscribers.len()
    }
}

/// Handle to one registered subscriber
///
/// Receives the replayed current snapshot first, then every later emission
/// in order. Dropping the subscription unsubscribes it.
pub struct Subscription {
    id: u64,
    rx: mpsc::UnboundedReceiver<StateSnapshot>,
    registry: Weak<Mutex<BroadcastInner>>,
}

impl Subscription {
    /// Receive the next snapshot; `None` once unsubscribed and drained.
    pub async fn next(&mut self) -> Option<StateSnapshot> {
        self.rx.recv().await
    }

    /// Receive the next snapshot without waiting; `None` when the queue is
    /// currently empty.
    pub fn try_next(&mut self) -> Option<StateSnapshot> {
        self.rx.try_recv().ok()
    }

    /// Stop delivery. Idempotent; snapshots queued before the call can
    /// still be drained, each one complete.
    pub fn unsubscribe(&mut self) {
        if let Some(registry) = self.registry.upgrade() {
            let mut inner = registry.lock().unwrap();
            inner.subscribers.retain(|(id, _)| *id != self.id);
        }
        self.rx.close();
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}

impl Stream for Subscription {
    type Item = StateSnapshot;

    fn poll_next(mut self: std::pin::Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::{ErrorState, SessionState};
    use futures::StreamExt;

    fn snap(state: SessionState, error: ErrorState) -> StateSnapshot {
        StateSnapshot::new(state, error)
    }

    #[tokio::test]
    async fn test_subscribe_replays_current_pair() {
        let broadcaster = StateBroadcaster::new(StateSnapshot::unbound());
        let mut sub = broadcaster.subscribe();

        assert_eq!(sub.next().await, Some(StateSnapshot::unbound()));
    }

    #[tokio::test]
    async fn test_late_subscriber_sees_latest_then_only_new() {
        let broadcaster = StateBroadcaster::new(StateSnapshot::unbound());
        broadcaster.publish(snap(SessionState::Disconnected, ErrorState::NoError));
        broadcaster.publish(snap(SessionState::Connecting, ErrorState::NoError));
        broadcaster.publish(snap(SessionState::Connected, ErrorState::NoError));

        let mut sub = broadcaster.subscribe();
        assert_eq!(
            sub.next().await,
            Some(snap(SessionState::Connected, ErrorState::NoError))
        );

        broadcaster.publish(snap(SessionState::Disconnecting, ErrorState::NoError));
        assert_eq!(
            sub.next().await,
            Some(snap(SessionState::Disconnecting, ErrorState::NoError))
        );
    }

    #[tokio::test]
    async fn test_emission_order_is_total_across_subscribers() {
        let broadcaster = StateBroadcaster::new(StateSnapshot::unbound());
        let mut first = broadcaster.subscribe();
        let mut second = broadcaster.subscribe();

        let updates = [
            snap(SessionState::Disconnected, ErrorState::NoError),
            snap(SessionState::Connecting, ErrorState::NoError),
            snap(SessionState::Error, ErrorState::AuthFailed),
            snap(SessionState::Error, ErrorState::LookupFailed),
        ];
        for update in updates {
            broadcaster.publish(update);
        }

        for sub in [&mut first, &mut second] {
            assert_eq!(sub.next().await, Some(StateSnapshot::unbound()));
            for update in updates {
                assert_eq!(sub.next().await, Some(update));
            }
        }
    }

    #[tokio::test]
    async fn test_duplicate_snapshots_are_suppressed() {
        let broadcaster = StateBroadcaster::new(StateSnapshot::unbound());
        let mut sub = broadcaster.subscribe();
        assert_eq!(sub.next().await, Some(StateSnapshot::unbound()));

        broadcaster.publish(snap(SessionState::Connecting, ErrorState::NoError));
        broadcaster.publish(snap(SessionState::Connecting, ErrorState::NoError));
        broadcaster.publish(snap(SessionState::Connected, ErrorState::NoError));

        assert_eq!(
            sub.next().await,
            Some(snap(SessionState::Connecting, ErrorState::NoError))
        );
        // The duplicate was dropped; the next delivery is the real change.
        assert_eq!(
            sub.next().await,
            Some(snap(SessionState::Connected, ErrorState::NoError))
        );
    }

    #[tokio::test]
    async fn test_distinct_error_values_are_not_coalesced() {
        let broadcaster = StateBroadcaster::new(StateSnapshot::unbound());
        let mut sub = broadcaster.subscribe();
        assert_eq!(sub.next().await, Some(StateSnapshot::unbound()));

        broadcaster.publish(snap(SessionState::Error, ErrorState::AuthFailed));
        broadcaster.publish(snap(SessionState::Error, ErrorState::LookupFailed));

        assert_eq!(
            sub.next().await,
            Some(snap(SessionState::Error, ErrorState::AuthFailed))
        );
        assert_eq!(
            sub.next().await,
            Some(snap(SessionState::Error, ErrorState::LookupFailed))
        );
    }

    #[tokio::test]
    async fn test_unsubscribe_is_idempotent_and_stops_delivery() {
        let broadcaster = StateBroadcaster::new(StateSnapshot::unbound());
        let mut sub = broadcaster.subscribe();
        assert_eq!(broadcaster.subscriber_count(), 1);

        sub.unsubscribe();
        sub.unsubscribe();
        assert_eq!(broadcaster.subscriber_count(), 0);

        broadcaster.publish(snap(SessionState::Connecting, ErrorState::NoError));
        // The replayed initial snapshot was queued before unsubscribe; the
        // publish after unsubscribe never reaches this subscriber.
        assert_eq!(sub.next().await, Some(StateSnapshot::unbound()));
        assert_eq!(sub.next().await, None);
    }

    #[tokio::test]
    async fn test_dropped_subscription_is_pruned() {
        let broadcaster = StateBroadcaster::new(StateSnapshot::unbound());
        let sub = broadcaster.subscribe();
        drop(sub);
        assert_eq!(broadcaster.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn test_subscription_is_a_stream() {
        let broadcaster = StateBroadcaster::new(StateSnapshot::unbound());
        let mut sub = broadcaster.subscribe();
        broadcaster.publish(snap(SessionState::Connecting, ErrorState::NoError));

        let first = StreamExt::next(&mut sub).await;
        let second = StreamExt::next(&mut sub).await;
        assert_eq!(first, Some(StateSnapshot::unbound()));
        assert_eq!(second, Some(snap(SessionState::Connecting, ErrorState::NoError)));
    }
}
