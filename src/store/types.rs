use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

// ============================================================================
// Error Types
// ============================================================================

/// Store-level errors with user-facing messages.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Another instance of telecast has the database locked.
    #[error("Another instance of telecast appears to be running. Please close it and try again.")]
    InstanceLocked,

    /// Migration failed
    #[error("Database migration failed: {0}")]
    Migration(String),

    /// Generic database error
    #[error("Database error: {0}")]
    Other(#[from] sqlx::Error),
}

impl StoreError {
    /// Check if a sqlx error indicates database locking
    pub(crate) fn from_sqlx(err: sqlx::Error) -> Self {
        let error_string = err.to_string().to_lowercase();

        // SQLITE_BUSY (5): database is locked
        // SQLITE_LOCKED (6): database table is locked
        // SQLITE_CANTOPEN (14): unable to open database file
        if error_string.contains("database is locked")
            || error_string.contains("database table is locked")
            || error_string.contains("sqlite_busy")
            || error_string.contains("sqlite_locked")
            || error_string.contains("unable to open database file")
        {
            return StoreError::InstanceLocked;
        }

        StoreError::Other(err)
    }
}

/// A lifecycle transition was requested that the state machine does not
/// permit. These are contract violations between components, surfaced to the
/// caller rather than silently applied — the row is left untouched.
#[derive(Debug, Error)]
pub enum TransitionError {
    #[error("item {item_id} not found")]
    NotFound { item_id: i64 },

    #[error("item {item_id} in state '{state}' does not accept '{event}'")]
    InvalidEdge {
        item_id: i64,
        state: ItemState,
        event: &'static str,
    },

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

// ============================================================================
// Item Lifecycle
// ============================================================================

/// Lifecycle state of an item. `Failed` and `Evicted` are terminal for the
/// engine's automatic flows; `Failed` additionally accepts an explicit user
/// retry and both accept nothing else.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemState {
    Discovered,
    Queued,
    Downloading,
    Downloaded,
    Watched,
    Failed,
    Evicted,
}

impl ItemState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ItemState::Discovered => "discovered",
            ItemState::Queued => "queued",
            ItemState::Downloading => "downloading",
            ItemState::Downloaded => "downloaded",
            ItemState::Watched => "watched",
            ItemState::Failed => "failed",
            ItemState::Evicted => "evicted",
        }
    }

    /// States whose items hold a materialized file in the library (and
    /// therefore contribute to the storage ledger).
    pub fn has_file(&self) -> bool {
        matches!(self, ItemState::Downloaded | ItemState::Watched)
    }
}

impl fmt::Display for ItemState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ItemState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "discovered" => Ok(ItemState::Discovered),
            "queued" => Ok(ItemState::Queued),
            "downloading" => Ok(ItemState::Downloading),
            "downloaded" => Ok(ItemState::Downloaded),
            "watched" => Ok(ItemState::Watched),
            "failed" => Ok(ItemState::Failed),
            "evicted" => Ok(ItemState::Evicted),
            other => Err(format!("unknown item state '{other}'")),
        }
    }
}

/// An event driving the item state machine. Payload-carrying variants supply
/// the fields the transition must record atomically with the state change.
#[derive(Debug, Clone)]
pub enum ItemEvent {
    /// `discovered -> queued`: the download scheduler accepted the item.
    Admit,
    /// `queued -> downloading`: a transfer slot was claimed.
    Start,
    /// `downloading -> downloaded`: transfer finished and was verified.
    Complete { file_path: String, file_size: i64 },
    /// `downloading -> queued`: transient failure with retry budget left.
    /// The prior transfer is fully torn down before this event is applied.
    RetryableFailure { error: String, retry_at: i64 },
    /// `downloading -> queued`: transfer torn down without counting an
    /// attempt (engine shutdown, cancellation, stale row at startup).
    Interrupt,
    /// `downloading -> failed`: retry budget exhausted or non-retryable.
    Fail { error: String },
    /// `downloaded -> watched`: playback signal from the UI collaborator.
    MarkWatched,
    /// `{discovered,queued,downloaded,watched,failed} -> evicted`: storage
    /// manager reclaim or user delete. Never applies to a live transfer.
    Evict,
    /// `failed -> queued`: explicit user retry, attempt counter reset.
    Retry,
    /// `{downloaded,watched} -> queued`: startup reconcile found the
    /// library file missing; the item goes back for re-download.
    FileMissing,
}

impl ItemEvent {
    /// States this event may be applied from.
    pub fn sources(&self) -> &'static [ItemState] {
        match self {
            ItemEvent::Admit => &[ItemState::Discovered],
            ItemEvent::Start => &[ItemState::Queued],
            ItemEvent::Complete { .. } => &[ItemState::Downloading],
            ItemEvent::RetryableFailure { .. } => &[ItemState::Downloading],
            ItemEvent::Interrupt => &[ItemState::Downloading],
            ItemEvent::Fail { .. } => &[ItemState::Downloading],
            ItemEvent::MarkWatched => &[ItemState::Downloaded],
            ItemEvent::Evict => &[
                ItemState::Discovered,
                ItemState::Queued,
                ItemState::Downloaded,
                ItemState::Watched,
                ItemState::Failed,
            ],
            ItemEvent::Retry => &[ItemState::Failed],
            ItemEvent::FileMissing => &[ItemState::Downloaded, ItemState::Watched],
        }
    }

    /// State this event lands in.
    pub fn target(&self) -> ItemState {
        match self {
            ItemEvent::Admit => ItemState::Queued,
            ItemEvent::Start => ItemState::Downloading,
            ItemEvent::Complete { .. } => ItemState::Downloaded,
            ItemEvent::RetryableFailure { .. } => ItemState::Queued,
            ItemEvent::Interrupt => ItemState::Queued,
            ItemEvent::Fail { .. } => ItemState::Failed,
            ItemEvent::MarkWatched => ItemState::Watched,
            ItemEvent::Evict => ItemState::Evicted,
            ItemEvent::Retry => ItemState::Queued,
            ItemEvent::FileMissing => ItemState::Queued,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            ItemEvent::Admit => "admit",
            ItemEvent::Start => "start",
            ItemEvent::Complete { .. } => "complete",
            ItemEvent::RetryableFailure { .. } => "retryable_failure",
            ItemEvent::Interrupt => "interrupt",
            ItemEvent::Fail { .. } => "fail",
            ItemEvent::MarkWatched => "mark_watched",
            ItemEvent::Evict => "evict",
            ItemEvent::Retry => "retry",
            ItemEvent::FileMissing => "file_missing",
        }
    }

    pub fn permitted_from(&self, state: ItemState) -> bool {
        self.sources().contains(&state)
    }
}

// ============================================================================
// Descriptors (parser output, store input)
// ============================================================================

/// One downloadable media reference attached to an item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Enclosure {
    pub url: String,
    /// Size declared by the feed, if any. Advisory until verified on disk.
    pub length: Option<i64>,
    pub mime_type: Option<String>,
}

/// HTTP cache validators for conditional refetch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Validators {
    pub etag: Option<String>,
    pub last_modified: Option<String>,
}

impl Validators {
    pub fn is_empty(&self) -> bool {
        self.etag.is_none() && self.last_modified.is_none()
    }
}

/// A normalized item produced by the feed parser, keyed for deduplication.
#[derive(Debug, Clone)]
pub struct ItemDescriptor {
    pub dedup_key: String,
    pub title: String,
    pub published: Option<i64>,
    /// First enclosure is the one we download; the rest are alternates kept
    /// for consumers that prefer another encoding.
    pub enclosures: Vec<Enclosure>,
    pub validators: Validators,
}

impl ItemDescriptor {
    pub fn primary_enclosure(&self) -> &Enclosure {
        // Parser guarantees at least one enclosure per descriptor.
        &self.enclosures[0]
    }
}

// ============================================================================
// Persistent Entities
// ============================================================================

/// Per-subscription retention policy. `None` everywhere = keep forever.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetentionPolicy {
    /// Keep at most this many materialized items (newest by publish time).
    pub max_items: Option<u32>,
    /// Evict materialized items published more than this many days ago.
    pub max_age_days: Option<u32>,
}

impl RetentionPolicy {
    pub fn unlimited() -> Self {
        Self::default()
    }

    pub fn is_unlimited(&self) -> bool {
        self.max_items.is_none() && self.max_age_days.is_none()
    }
}

/// A tracked feed source.
#[derive(Debug, Clone)]
pub struct Subscription {
    pub id: i64,
    pub url: String,
    pub title: String,
    /// Feed dialect detected on last successful parse ("rss", "atom", ...).
    pub kind: String,
    /// Base poll interval in seconds; 0 = use the engine default.
    pub poll_interval_secs: i64,
    pub last_polled: Option<i64>,
    pub consecutive_failures: i64,
    pub last_error: Option<String>,
    pub validators: Validators,
    pub retention: RetentionPolicy,
    pub created_at: i64,
}

impl Subscription {
    /// Unix timestamp at which this subscription is next eligible to poll.
    ///
    /// Base interval on success; doubled per consecutive failure up to
    /// `ceiling`; a never-polled subscription is due immediately.
    pub fn next_poll_at(&self, default_interval_secs: u64, ceiling_secs: u64) -> i64 {
        let last = match self.last_polled {
            Some(t) => t,
            None => return 0,
        };

        let base = if self.poll_interval_secs > 0 {
            self.poll_interval_secs as u64
        } else {
            default_interval_secs
        };

        // Saturate the shift so a long outage can't overflow.
        let shift = self.consecutive_failures.clamp(0, 32) as u32;
        let backed_off = base.saturating_mul(1u64 << shift.min(32)).min(ceiling_secs.max(base));

        last.saturating_add(backed_off as i64)
    }

    pub fn is_due(&self, now: i64, default_interval_secs: u64, ceiling_secs: u64) -> bool {
        self.next_poll_at(default_interval_secs, ceiling_secs) <= now
    }
}

/// Internal row type for Subscription queries.
#[derive(Debug, sqlx::FromRow)]
pub(crate) struct SubscriptionRow {
    pub id: i64,
    pub url: String,
    pub title: String,
    pub kind: String,
    pub poll_interval_secs: i64,
    pub last_polled: Option<i64>,
    pub consecutive_failures: i64,
    pub last_error: Option<String>,
    pub etag: Option<String>,
    pub last_modified: Option<String>,
    pub retention_max_items: Option<i64>,
    pub retention_max_age_days: Option<i64>,
    pub created_at: i64,
}

impl SubscriptionRow {
    pub(crate) fn into_subscription(self) -> Subscription {
        Subscription {
            id: self.id,
            url: self.url,
            title: self.title,
            kind: self.kind,
            poll_interval_secs: self.poll_interval_secs,
            last_polled: self.last_polled,
            consecutive_failures: self.consecutive_failures,
            last_error: self.last_error,
            validators: Validators {
                etag: self.etag,
                last_modified: self.last_modified,
            },
            retention: RetentionPolicy {
                max_items: self.retention_max_items.map(|v| v as u32),
                max_age_days: self.retention_max_age_days.map(|v| v as u32),
            },
            created_at: self.created_at,
        }
    }
}

/// One discoverable content unit from a feed, with its full lifecycle record.
#[derive(Debug, Clone)]
pub struct Item {
    pub id: i64,
    pub subscription_id: i64,
    pub dedup_key: String,
    pub title: String,
    pub published: Option<i64>,
    pub enclosure: Enclosure,
    pub alternate_enclosures: Vec<Enclosure>,
    pub state: ItemState,
    pub discovered_at: i64,
    pub queued_at: Option<i64>,
    pub downloaded_at: Option<i64>,
    pub watched_at: Option<i64>,
    /// Final library path; populated exactly in `downloaded`/`watched`.
    pub file_path: Option<String>,
    /// Verified on-disk size; populated exactly in `downloaded`/`watched`.
    pub file_size: Option<i64>,
    /// Resume offset carried across transfer attempts.
    pub bytes_downloaded: i64,
    pub attempts: i64,
    /// Backoff deadline; the item is not re-admitted before this time.
    pub retry_at: Option<i64>,
    pub last_failure: Option<String>,
    /// User "keep": exempt from eviction and retention.
    pub pinned: bool,
    pub validators: Validators,
}

/// Columns selected for every Item query, in `ItemRow` field order.
pub(crate) const ITEM_COLUMNS: &str = "id, subscription_id, dedup_key, title, published, \
     enclosure_url, enclosure_size, enclosure_mime, alternate_enclosures, \
     state, discovered_at, queued_at, downloaded_at, watched_at, \
     file_path, file_size, bytes_downloaded, attempts, retry_at, \
     last_failure, pinned, etag, last_modified";

/// Internal row type for Item queries (sqlx FromRow), converted via
/// `into_item()` which parses the state column and the alternates JSON.
#[derive(Debug, sqlx::FromRow)]
pub(crate) struct ItemRow {
    pub id: i64,
    pub subscription_id: i64,
    pub dedup_key: String,
    pub title: String,
    pub published: Option<i64>,
    pub enclosure_url: String,
    pub enclosure_size: Option<i64>,
    pub enclosure_mime: Option<String>,
    pub alternate_enclosures: String,
    pub state: String,
    pub discovered_at: i64,
    pub queued_at: Option<i64>,
    pub downloaded_at: Option<i64>,
    pub watched_at: Option<i64>,
    pub file_path: Option<String>,
    pub file_size: Option<i64>,
    pub bytes_downloaded: i64,
    pub attempts: i64,
    pub retry_at: Option<i64>,
    pub last_failure: Option<String>,
    pub pinned: bool,
    pub etag: Option<String>,
    pub last_modified: Option<String>,
}

impl ItemRow {
    pub(crate) fn into_item(self) -> anyhow::Result<Item> {
        let state = self
            .state
            .parse::<ItemState>()
            .map_err(|e| anyhow::anyhow!("item {}: {e}", self.id))?;
        let alternate_enclosures: Vec<Enclosure> =
            serde_json::from_str(&self.alternate_enclosures).unwrap_or_default();

        Ok(Item {
            id: self.id,
            subscription_id: self.subscription_id,
            dedup_key: self.dedup_key,
            title: self.title,
            published: self.published,
            enclosure: Enclosure {
                url: self.enclosure_url,
                length: self.enclosure_size,
                mime_type: self.enclosure_mime,
            },
            alternate_enclosures,
            state,
            discovered_at: self.discovered_at,
            queued_at: self.queued_at,
            downloaded_at: self.downloaded_at,
            watched_at: self.watched_at,
            file_path: self.file_path,
            file_size: self.file_size,
            bytes_downloaded: self.bytes_downloaded,
            attempts: self.attempts,
            retry_at: self.retry_at,
            last_failure: self.last_failure,
            pinned: self.pinned,
            validators: Validators {
                etag: self.etag,
                last_modified: self.last_modified,
            },
        })
    }
}

/// Filter for `list_items`.
#[derive(Debug, Clone, Default)]
pub struct ItemFilter {
    pub subscription_id: Option<i64>,
    pub states: Option<Vec<ItemState>>,
    pub limit: Option<i64>,
}

/// Result of an item upsert pass for one poll.
#[derive(Debug, Default)]
pub struct UpsertOutcome {
    /// IDs of rows created by this pass, in feed document order.
    pub created: Vec<i64>,
    /// Count of already-known items whose mutable fields were refreshed.
    pub updated: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_state_round_trip() {
        for state in [
            ItemState::Discovered,
            ItemState::Queued,
            ItemState::Downloading,
            ItemState::Downloaded,
            ItemState::Watched,
            ItemState::Failed,
            ItemState::Evicted,
        ] {
            assert_eq!(state.as_str().parse::<ItemState>().unwrap(), state);
        }
        assert!("paused".parse::<ItemState>().is_err());
    }

    #[test]
    fn test_downloading_never_evictable() {
        assert!(!ItemEvent::Evict.permitted_from(ItemState::Downloading));
        assert!(!ItemEvent::Evict.permitted_from(ItemState::Evicted));
    }

    #[test]
    fn test_next_poll_backoff_doubles_and_caps() {
        let mut sub = Subscription {
            id: 1,
            url: "https://example.com/feed".into(),
            title: String::new(),
            kind: "rss".into(),
            poll_interval_secs: 600,
            last_polled: Some(1_000_000),
            consecutive_failures: 0,
            last_error: None,
            validators: Validators::default(),
            retention: RetentionPolicy::unlimited(),
            created_at: 0,
        };

        assert_eq!(sub.next_poll_at(3600, 86_400), 1_000_600);

        sub.consecutive_failures = 1;
        assert_eq!(sub.next_poll_at(3600, 86_400), 1_001_200);

        sub.consecutive_failures = 3;
        assert_eq!(sub.next_poll_at(3600, 86_400), 1_004_800);

        // Far past the ceiling
        sub.consecutive_failures = 30;
        assert_eq!(sub.next_poll_at(3600, 86_400), 1_000_000 + 86_400);
    }

    #[test]
    fn test_never_polled_is_due() {
        let sub = Subscription {
            id: 1,
            url: "https://example.com/feed".into(),
            title: String::new(),
            kind: "rss".into(),
            poll_interval_secs: 0,
            last_polled: None,
            consecutive_failures: 0,
            last_error: None,
            validators: Validators::default(),
            retention: RetentionPolicy::unlimited(),
            created_at: 0,
        };
        assert!(sub.is_due(0, 3600, 86_400));
    }

    fn arb_state() -> impl Strategy<Value = ItemState> {
        prop_oneof![
            Just(ItemState::Discovered),
            Just(ItemState::Queued),
            Just(ItemState::Downloading),
            Just(ItemState::Downloaded),
            Just(ItemState::Watched),
            Just(ItemState::Failed),
            Just(ItemState::Evicted),
        ]
    }

    fn arb_event() -> impl Strategy<Value = ItemEvent> {
        prop_oneof![
            Just(ItemEvent::Admit),
            Just(ItemEvent::Start),
            Just(ItemEvent::Complete {
                file_path: "x".into(),
                file_size: 1
            }),
            Just(ItemEvent::RetryableFailure {
                error: "e".into(),
                retry_at: 1
            }),
            Just(ItemEvent::Interrupt),
            Just(ItemEvent::Fail { error: "e".into() }),
            Just(ItemEvent::MarkWatched),
            Just(ItemEvent::Evict),
            Just(ItemEvent::Retry),
            Just(ItemEvent::FileMissing),
        ]
    }

    proptest! {
        /// Any permitted event sequence only ever visits edges of the
        /// documented machine, and terminal `evicted` accepts nothing.
        #[test]
        fn prop_event_sequences_follow_machine(
            start in arb_state(),
            events in prop::collection::vec(arb_event(), 0..24),
        ) {
            let mut state = start;
            for event in events {
                if event.permitted_from(state) {
                    prop_assert!(event.sources().contains(&state));
                    state = event.target();
                } else {
                    // Rejected events must not change state.
                }
            }
            if state == ItemState::Evicted {
                for event in [
                    ItemEvent::Admit,
                    ItemEvent::Start,
                    ItemEvent::MarkWatched,
                    ItemEvent::Evict,
                    ItemEvent::Retry,
                ] {
                    prop_assert!(!event.permitted_from(ItemState::Evicted), "{}", event.name());
                }
            }
        }

        /// `downloaded` is only reachable through `Complete`, which requires
        /// `downloading` — no path skips the transfer.
        #[test]
        fn prop_downloaded_only_via_complete(event in arb_event()) {
            if event.target() == ItemState::Downloaded {
                prop_assert_eq!(event.sources(), &[ItemState::Downloading][..]);
            }
        }
    }
}
