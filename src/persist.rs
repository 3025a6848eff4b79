//! On-disk snapshots: the compiled queuing structure, the last-loaded
//! subscriber table, stats windows and the last-run stamp.
//!
//! Everything lives under the configured data directory and is written
//! atomically (temp file + rename) so a crash mid-write never leaves a
//! half-serialized snapshot for the next reload to trip over.

use crate::error::{Error, Result};
use crate::topology::QueuingStructure;
use chrono::{DateTime, Local, NaiveDateTime};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Format of the `lastRun.txt` stamp, e.g. `01-Aug-2026 (14:03:52.123456)`
const LAST_RUN_FORMAT: &str = "%d-%b-%Y (%H:%M:%S%.6f)";

/// Well-known file locations under the data directory
#[derive(Clone, Debug)]
pub struct DataFiles {
    dir: PathBuf,
}

impl DataFiles {
    /// Snapshot files rooted at `dir`
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// The data directory itself
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Compiled topology with class handles and allocator counters
    pub fn queuing_structure(&self) -> PathBuf {
        self.dir.join("queuingStructure.json")
    }

    /// Copy of the subscriber table that was successfully loaded last
    pub fn shaped_devices_last_loaded(&self) -> PathBuf {
        self.dir.join("ShapedDevices.lastLoaded.csv")
    }

    /// Last subscriber table that passed validation
    pub fn last_good_subscribers(&self) -> PathBuf {
        self.dir.join("lastGoodConfig.csv")
    }

    /// Last topology document that passed validation
    pub fn last_good_topology(&self) -> PathBuf {
        self.dir.join("lastGoodConfig.json")
    }

    /// Per-circuit stats snapshot (two-sample window)
    pub fn stats_by_circuit(&self) -> PathBuf {
        self.dir.join("statsByCircuit.json")
    }

    /// Per-parent-node stats snapshot
    pub fn stats_by_parent_node(&self) -> PathBuf {
        self.dir.join("statsByParentNode.json")
    }

    /// CAKE tin stats snapshot
    pub fn tins_stats(&self) -> PathBuf {
        self.dir.join("tinsStats.json")
    }

    /// Cumulative counters that outlive individual scrapes
    pub fn long_term_stats(&self) -> PathBuf {
        self.dir.join("longTermStats.json")
    }

    /// Wall-clock stamp of the last successful reload
    pub fn last_run(&self) -> PathBuf {
        self.dir.join("lastRun.txt")
    }

    /// Staging file for the batched tc transaction
    pub fn tc_batch_file(&self) -> PathBuf {
        self.dir.join("linux_tc.txt")
    }
}

/// Write `contents` to `path` atomically: temp file in the same directory,
/// then rename over the target
pub fn atomic_write(path: &Path, contents: &[u8]) -> Result<()> {
    let tmp = path.with_extension("tmp");
    std::fs::write(&tmp, contents)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}

/// Serialize a value as pretty JSON to `path`, atomically
pub fn save_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let raw = serde_json::to_vec_pretty(value)?;
    atomic_write(path, &raw)?;
    debug!(path = %path.display(), "snapshot written");
    Ok(())
}

/// Load a JSON snapshot; `Ok(None)` when the file does not exist yet
pub fn load_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    match std::fs::read_to_string(path) {
        Ok(raw) => Ok(Some(serde_json::from_str(&raw)?)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Persist the compiled structure for the incremental path
pub fn save_queuing_structure(files: &DataFiles, structure: &QueuingStructure) -> Result<()> {
    save_json(&files.queuing_structure(), structure)
}

/// Load the compiled structure from the last full reload
pub fn load_queuing_structure(files: &DataFiles) -> Result<QueuingStructure> {
    load_json(&files.queuing_structure())?.ok_or_else(|| {
        Error::NotFound(
            "no compiled queuing structure on disk; run a full reload first".to_string(),
        )
    })
}

/// Stamp the current wall-clock time as the last successful reload
pub fn write_last_run(files: &DataFiles) -> Result<()> {
    let stamp = Local::now().format(LAST_RUN_FORMAT).to_string();
    atomic_write(&files.last_run(), stamp.as_bytes())
}

/// Whether this is the first reload since the system booted.
///
/// Compares the `lastRun.txt` stamp against the kernel boot time from
/// `/proc/stat`. A missing or unparsable stamp counts as a first run, which
/// only makes the reload more conservative (it enables the last-good
/// fallback).
pub fn first_run_since_boot(files: &DataFiles) -> bool {
    let Ok(raw) = std::fs::read_to_string(files.last_run()) else {
        return true;
    };
    let Ok(last_run) = NaiveDateTime::parse_from_str(raw.trim(), LAST_RUN_FORMAT) else {
        warn!("could not parse lastRun.txt; treating as first run since boot");
        return true;
    };
    match system_boot_time() {
        Some(booted) => booted.naive_local() > last_run,
        None => {
            warn!("could not determine system boot time; treating as first run since boot");
            true
        }
    }
}

fn system_boot_time() -> Option<DateTime<Local>> {
    let stat = std::fs::read_to_string("/proc/stat").ok()?;
    let btime = stat
        .lines()
        .find_map(|line| line.strip_prefix("btime "))?
        .trim()
        .parse::<i64>()
        .ok()?;
    DateTime::from_timestamp(btime, 0).map(|dt| dt.with_timezone(&Local))
}
