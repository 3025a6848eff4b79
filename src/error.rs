//! Error types for edge-shaper
//!
//! This module provides error handling for the whole control plane:
//! - Input validation failures (topology document, subscriber table)
//! - Capacity and class-id allocation failures
//! - Kernel rejection of emitted traffic-control commands
//! - Stats scrape and time-series publisher failures

use thiserror::Error;

/// Result type alias for edge-shaper operations
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for edge-shaper
///
/// The compiler and planner produce these up-front (synchronous, structured);
/// the executor returns best-effort status; the stats path is resilient by
/// design and only surfaces errors that abort a whole scrape.
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error with context about which setting is invalid
    #[error("configuration error: {message}")]
    Config {
        /// Human-readable error message describing the configuration issue
        message: String,
        /// The configuration key that caused the error (e.g., "interface_a")
        key: Option<String>,
    },

    /// Input validation rejected the topology document or subscriber table
    ///
    /// Validation is all-or-nothing: every failure found in a pass is
    /// collected before the reload is aborted.
    #[error("validation failed with {} problem(s): {}", failures.len(), failures.join("; "))]
    Validation {
        /// Every validation problem found, in row order
        failures: Vec<String>,
    },

    /// Fewer than 2 NIC queues / CPU cores available
    #[error("only {queues} NIC rx/tx queue(s) / CPU core(s) available; at least 2 are required")]
    CapacityImpossible {
        /// The number of queues that were discovered
        queues: usize,
    },

    /// A traffic-control command was rejected by the kernel
    #[error("kernel rejected command '{command}': {line}")]
    KernelRejected {
        /// The command that was rejected
        command: String,
        /// The kernel error line captured from the command's output
        line: String,
    },

    /// The per-CPU minor handle counter would exceed the 16-bit HTB cap
    #[error("class minor handles exhausted on CPU queue {queue}")]
    ClassIdExhausted {
        /// The CPU queue (1-based) whose counter overflowed
        queue: u16,
    },

    /// A qdisc stats dump could not be decoded
    #[error("stats parse failure: {0}")]
    StatsParse(String),

    /// The time-series publisher rejected or failed a write
    #[error("publisher error: {0}")]
    Publisher(String),

    /// A referenced node or circuit does not exist in the compiled structure
    #[error("not found: {0}")]
    NotFound(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Subscriber table CSV error
    #[error("subscriber table error: {0}")]
    Csv(#[from] csv::Error),

    /// Network error
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),
}

impl Error {
    /// Shorthand for a config error without an associated key
    pub fn config(message: impl Into<String>) -> Self {
        Error::Config {
            message: message.into(),
            key: None,
        }
    }

    /// Shorthand for a config error tied to a specific key
    pub fn config_key(message: impl Into<String>, key: impl Into<String>) -> Self {
        Error::Config {
            message: message.into(),
            key: Some(key.into()),
        }
    }
}
