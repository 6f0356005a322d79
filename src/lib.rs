#![doc = include_str!("../README.md")]

/// Deduplicating, bounded event buffer.
pub mod buffer;
/// clap flags for the `mip-live` binary.
pub mod cli;
/// Live feed client: stream loop, polling fallback and owner handle.
pub mod client;
/// Connection state machine and snapshots.
pub mod client_state;
/// `Config` tree and flag validation.
pub mod config;
/// `FeedError` and the crate result alias.
pub mod error;
/// Notification bus between client and consumers.
pub mod events;
/// Line formats for printed events.
pub mod formatter;
/// Prometheus series and the `FeedHealth` summary.
pub mod monitoring;
/// `text/event-stream` decoding.
pub mod sse;
/// Log subscriber setup.
pub mod tracing_setup;
/// Push and poll transports.
pub mod transport;
/// Decision feed wire types.
pub mod types;
/// Prints bus notifications to the terminal.
pub mod ui;
/// Foreground/background gate for polling.
pub mod visibility;

pub use error::FeedError;
