//! telecast — feed ingestion and download engine for an internet-TV client.
//!
//! The engine subscribes to video feeds, discovers new items, downloads their
//! enclosures into a local library, and enforces a disk budget over what it
//! keeps. Playback, channel browsing, and sharing layers are external
//! consumers: they watch the [`events`] stream and read finished files.
//!
//! # Architecture
//!
//! - [`feed`] — fetching and parsing of feed documents
//! - [`store`] — SQLite-backed registry of subscriptions and item lifecycle
//! - [`poll`] — per-subscription poll scheduling with failure backoff
//! - [`download`] — bounded-concurrency transfer pool with retry and resume
//! - [`library`] — on-disk layout, storage budget, eviction, reconciliation
//! - [`engine`] — the facade that composes the above
//!
//! Every component takes its [`store::Database`] handle explicitly; there are
//! no process-wide singletons, so isolated engine instances can coexist (the
//! test suites rely on this).

pub mod config;
pub mod download;
pub mod engine;
pub mod events;
pub mod feed;
pub mod library;
pub mod poll;
pub mod store;

pub use config::Config;
pub use engine::Engine;
pub use events::EngineEvent;
pub use store::{Item, ItemState, RetentionPolicy, Subscription};
