//! Token-budgeted context window management.
//!
//! `ctxwarden` keeps a bounded token budget for the context an assistant
//! carries around: conversation turns, code, project state, errors, and
//! memories. Items live in named sections of a [`ContextWindow`](item::ContextWindow);
//! when a section fills up, items are scored, the stale ones evicted and
//! the expendable ones compressed with cheap text heuristics. A background
//! policy loop compresses across managers as aggregate usage climbs, and a
//! fallback ladder recovers whenever a compression attempt fails.
//!
//! # Getting started
//!
//! ```ignore
//! use ctxwarden::prelude::*;
//!
//! #[tokio::main]
//! async fn main() -> ctxwarden::Result<()> {
//!     let config = WardenConfig::default().with_total_tokens(32_000);
//!
//!     let mut window = ContextWindowManager::new("main", &config)?;
//!     window.add(ContextItem::new("q1", "Why does the build fail?", ContentType::Conversation));
//!     let window = window.into_shared();
//!
//!     let auto = AutoCompressionManager::new(&config)?;
//!     auto.events().add_handler(LoggingHandler);
//!     auto.register("main", window.clone());
//!     auto.start();
//!
//!     let report = auto.check_and_compress().await;
//!     println!("{report:?}");
//!     Ok(())
//! }
//! ```
//!
//! # Where to find things
//!
//! - **Items and sections:** [`item`]. Token counts are estimated with
//!   [`estimate_tokens`](item::estimate_tokens).
//! - **Admission, eviction, rebalancing:** [`ContextWindowManager`](window::ContextWindowManager).
//! - **Scoring:** [`ContextPrioritizer`](prioritizer::ContextPrioritizer).
//! - **Compression:** the four strategies and [`ContextCompressor`](compression::ContextCompressor)
//!   in [`compression`]; content-aware compression in
//!   [`EnhancedCompressor`](compression::EnhancedCompressor).
//! - **Recovery:** [`FallbackSystem`](fallback::FallbackSystem).
//! - **Policy loop:** [`AutoCompressionManager`](auto::AutoCompressionManager).
//! - **Telemetry:** [`TokenMonitor`](monitor::TokenMonitor) and the
//!   [`EventBus`](events::EventBus).
//! - **Configuration:** [`WardenConfig`](config::WardenConfig), loadable
//!   from JSON with schema validation.

pub mod auto;
pub mod compression;
pub mod config;
pub mod error;
pub mod events;
pub mod fallback;
pub mod item;
pub mod logging;
pub mod monitor;
pub mod prelude;
pub mod prioritizer;
pub mod session;
pub mod snapshot;
pub mod window;

pub use error::{CompressionError, Result, WardenError};
