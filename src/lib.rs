//! # edge-shaper
//!
//! Per-subscriber bandwidth shaper control plane for an ISP edge box.
//!
//! Given a hierarchical description of the operator's network and a flat
//! table of subscriber devices, edge-shaper programs the Linux traffic
//! control subsystem (one HTB per NIC queue under an MQ root) and an
//! XDP-based per-CPU packet classifier, so that every packet lands in the
//! correct HTB leaf on the correct CPU. It then periodically scrapes qdisc
//! counters and publishes derived time-series (throughput, drops, CAKE tin
//! classification) to an external store.
//!
//! ## Design Philosophy
//!
//! - **Library-first** - the CLI binary is a thin driver; everything is
//!   reachable through the library API
//! - **Pure core, one impure edge** - only the [`executor`] touches the
//!   host; planner, compiler, reconciler and the stats math are pure over
//!   in-memory state and fully testable against a recording executor
//! - **Stateful across reloads** - the compiled structure, class-id
//!   counters and stats windows are persisted so partial reloads can
//!   mutate a live tree without touching unchanged circuits
//!
//! ## Quick Start
//!
//! ```no_run
//! use edge_shaper::{Config, Shaper, ShellExecutor};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = Config::default();
//!     let executor = Arc::new(ShellExecutor::new(&config));
//!     let shaper = Shaper::new(config, executor)?;
//!
//!     // Build and apply the whole queue tree
//!     shaper.full_reload().await?;
//!
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::unwrap_used)]
#![warn(clippy::expect_used)]

/// Per-queue class-id allocation
pub mod allocator;
/// Queue-tree compilation (TC command batch + XDP entries)
pub mod compiler;
/// Configuration types
pub mod config;
/// Error types
pub mod error;
/// Shell and XDP execution boundary
pub mod executor;
/// On-disk snapshots
pub mod persist;
/// Capacity planning (queues, generated parents, placement, caps)
pub mod planner;
/// Time-series points and the HTTP write path
pub mod publisher;
/// Incremental snapshot reconciliation
pub mod reconciler;
/// Reload orchestration
pub mod shaper;
/// Qdisc counter scraping and derived series
pub mod stats;
/// Topology model, circuits and the input loaders
pub mod topology;
/// Core shared types (handles, directions, tins)
pub mod types;

// Re-export commonly used types
pub use config::{Config, SqmMode, TimeSeriesConfig};
pub use error::{Error, Result};
pub use executor::{Executor, ExecutorCall, RecordingExecutor, ShellExecutor, ShellOutput};
pub use publisher::{InfluxWriter, MemorySink, Point, PointSink};
pub use reconciler::{ReconcileSummary, SnapshotDiff, diff_snapshots};
pub use shaper::Shaper;
pub use stats::StatsCollector;
pub use topology::{Circuit, Device, NetworkNode, QueuingStructure, TopologyNode};
pub use types::{Direction, TcHandle, Tin};
