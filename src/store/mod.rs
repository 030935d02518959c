//! Durable record of subscriptions and item lifecycle, backed by SQLite.
//!
//! The [`Database`] handle is the single serialized authority over item
//! state: every lifecycle mutation goes through [`Database::transition`],
//! which is a guarded compare-and-swap, so racing schedulers cannot
//! double-transition an item.

mod items;
mod ledger;
mod schema;
mod subscriptions;
mod types;

pub use ledger::{LedgerSnapshot, SubscriptionUsage};
pub use schema::Database;
pub use types::{
    Enclosure, Item, ItemDescriptor, ItemEvent, ItemFilter, ItemState, RetentionPolicy,
    StoreError, Subscription, TransitionError, UpsertOutcome, Validators,
};
