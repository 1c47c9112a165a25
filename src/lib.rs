//! # qualer-dl
//!
//! Credential-gated extraction of Qualer calibration data into CSV files or SQLite.
//!
//! ## Design Philosophy
//!
//! qualer-dl is designed to be:
//! - **One session per run** - A single authenticated browsing context is shared by every
//!   concurrent lookup and renewed transparently when it expires
//! - **Bounded fan-out** - Lookups over the cross product of reference ids run on a fixed
//!   number of workers, fail-fast or best-effort
//! - **Typed failures** - Every error carries a stable [`ErrorKind`], so callers decide
//!   what is fatal
//! - **Event-driven** - Consumers subscribe to progress events, no polling required
//!
//! ## Quick Start
//!
//! ```no_run
//! use qualer_dl::{Config, Credential, Harvester, Job};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = Config::default();
//!     let credential = Credential::new("user@example.com", "secret");
//!     let harvester = Harvester::connect(config, credential)?;
//!
//!     // Subscribe to events
//!     let mut events = harvester.subscribe();
//!     tokio::spawn(async move {
//!         while let Ok(event) = events.recv().await {
//!             println!("Event: {:?}", event);
//!         }
//!     });
//!
//!     let summary = harvester.run(&Job::ALL).await?;
//!     println!("{} rows written", summary.rows_written());
//!     harvester.close().await;
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::unwrap_used)]
#![warn(clippy::expect_used)]

/// Configuration types
pub mod config;
/// SQLite persistence and post-load maintenance
pub mod db;
/// JSON endpoint client and decoding
pub mod endpoints;
/// Error types
pub mod error;
/// Bounded fan-out over reference id pairs
pub mod fanout;
/// Extraction jobs
pub mod harvest;
/// Retry logic for transient render failures
pub mod retry;
/// Authenticated browsing session
pub mod session;
/// CSV and table row sinks
pub mod sink;
/// Core types and events
pub mod types;

// unwrap/expect are acceptable in test fixtures
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
pub(crate) mod test_helpers;

// Re-export commonly used types
pub use config::{CollectionMode, Config, FailurePolicy, IfExists, OutputTarget};
pub use db::Database;
pub use endpoints::EndpointClient;
pub use error::{DatabaseError, Error, ErrorKind, Result};
pub use fanout::FanOut;
pub use harvest::{Harvester, Job, ReferenceData, RunSummary};
pub use session::{Browser, Credential, HttpBrowser, Session};
pub use sink::{CsvSink, RowSink, TableSink};
pub use types::{BatchReport, Event, FailedPair, ReferenceId, Row, TaskPair, TaskState};
