#![forbid(unsafe_code)]
#![deny(
    warnings,
    dead_code,
    unused,
    unused_imports,
    unused_must_use,
    unreachable_pub,
    clippy::all,
    clippy::pedantic,
    clippy::nursery,
    rustdoc::broken_intra_doc_links,
    rustdoc::bare_urls,
    missing_docs
)]

//! Lifecycle event bus for separation jobs.
//!
//! The bus assigns sequential identifiers and keeps a bounded replay buffer so
//! late subscribers can catch up on what happened to a job. Internally it uses
//! `tokio::broadcast`; when the channel overflows the oldest events are dropped.

pub mod payloads;
pub mod routing;

pub use payloads::{DEFAULT_REPLAY_CAPACITY, Event, EventEnvelope, EventId};
pub use routing::{EventBus, EventStream};
