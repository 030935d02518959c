//! Change-notification stream published by the engine.
//!
//! Collaborators (playback UI, channel directory, republishing) subscribe via
//! [`Events::subscribe`] and react to discoveries, state changes, and soft
//! error conditions. The engine never pushes UI updates itself.

use serde::Serialize;
use tokio::sync::broadcast;

use crate::store::ItemState;

/// Default capacity of the broadcast channel. A slow consumer that falls more
/// than this many events behind sees `RecvError::Lagged` and must resync via
/// `list_items`.
const EVENT_CAPACITY: usize = 256;

/// One observable change in engine state.
///
/// Serializable so thin consumers can forward events over IPC unchanged.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EngineEvent {
    SubscriptionAdded {
        subscription_id: i64,
        url: String,
    },
    SubscriptionRemoved {
        subscription_id: i64,
    },
    /// A poll pass finished for one subscription. `not_modified` means the
    /// source answered 304 from our cached validators; that still counts as a
    /// successful poll.
    PollCompleted {
        subscription_id: i64,
        new_items: usize,
        not_modified: bool,
    },
    PollFailed {
        subscription_id: i64,
        error: String,
    },
    ItemDiscovered {
        item_id: i64,
        subscription_id: i64,
        title: String,
    },
    StateChanged {
        item_id: i64,
        state: ItemState,
    },
    DownloadProgress {
        item_id: i64,
        bytes_downloaded: u64,
        bytes_expected: Option<u64>,
    },
    /// Eviction could not bring usage under the configured budget. Soft
    /// condition: nothing was force-deleted.
    OverBudget {
        usage_bytes: u64,
        budget_bytes: u64,
    },
    ItemEvicted {
        item_id: i64,
        reclaimed_bytes: u64,
    },
}

/// Cloneable handle for emitting and subscribing to [`EngineEvent`]s.
#[derive(Clone)]
pub struct Events {
    tx: broadcast::Sender<EngineEvent>,
}

impl Events {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_CAPACITY);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.tx.subscribe()
    }

    /// Publish an event. Having no subscribers is not an error — the engine
    /// runs headless in tests and in the CLI's one-shot modes.
    pub fn emit(&self, event: EngineEvent) {
        let _ = self.tx.send(event);
    }
}

impl Default for Events {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_emit_without_subscribers_is_ok() {
        let events = Events::new();
        events.emit(EngineEvent::SubscriptionRemoved { subscription_id: 1 });
    }

    #[tokio::test]
    async fn test_subscriber_receives_events() {
        let events = Events::new();
        let mut rx = events.subscribe();

        events.emit(EngineEvent::ItemDiscovered {
            item_id: 7,
            subscription_id: 1,
            title: "Pilot".into(),
        });

        match rx.recv().await.unwrap() {
            EngineEvent::ItemDiscovered { item_id, .. } => assert_eq!(item_id, 7),
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[test]
    fn test_events_serialize_tagged() {
        let json = serde_json::to_string(&EngineEvent::OverBudget {
            usage_bytes: 10,
            budget_bytes: 5,
        })
        .unwrap();
        assert!(json.contains("\"type\":\"over_budget\""));
    }
}
