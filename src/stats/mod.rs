//! Qdisc counter scraping and derived time-series.
//!
//! Each invocation decodes `tc -j -s qdisc show` for both interfaces, keys
//! the entries by parent handle, slides the two-sample window on every
//! tracked circuit, computes rate/drop deltas as pure functions of the
//! sample pair, aggregates per parent node, and hands measurement points to
//! the publisher. All state is persisted so the prior-sample window
//! survives a process restart.
//!
//! The scrape is resilient by design: a missing qdisc entry, a counter
//! rollback or a zero-length interval zeroes the affected deltas and the
//! scrape continues.

#[cfg(test)]
mod tests;

use crate::config::Config;
use crate::error::{Error, Result};
use crate::executor::Executor;
use crate::persist::{self, DataFiles};
use crate::publisher::{Point, PointSink};
use crate::topology::QueuingStructure;
use crate::types::{Direction, TcHandle, Tin};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::{debug, info, warn};

/// Circuit points are flushed to the publisher in chunks of this size
const PUBLISH_CHUNK_SIZE: usize = 200;

// ---------------------------------------------------------------------------
// Qdisc dump decoding
// ---------------------------------------------------------------------------

/// One entry of a `tc -j -s qdisc show` dump
#[derive(Clone, Debug, Default, Deserialize)]
pub struct QdiscDump {
    /// Qdisc kind, e.g. `cake` or `fq_codel`
    #[serde(default)]
    pub kind: String,
    /// Parent handle as printed by tc, e.g. `1:3`
    #[serde(default)]
    pub parent: Option<String>,
    /// Cumulative bytes sent
    #[serde(default)]
    pub bytes: u64,
    /// Cumulative packets sent
    #[serde(default)]
    pub packets: u64,
    /// Cumulative packet drops
    #[serde(default)]
    pub drops: u64,
    /// Per-tin counters (CAKE diffserv4: Bulk, BestEffort, Video, Voice)
    #[serde(default)]
    pub tins: Vec<TinDump>,
}

/// Per-tin counters within a CAKE qdisc dump
#[derive(Clone, Copy, Debug, Default, Deserialize)]
pub struct TinDump {
    /// Packets sent from this tin
    #[serde(default)]
    pub sent_packets: u64,
    /// Packets dropped in this tin
    #[serde(default)]
    pub drops: u64,
    /// Packets ECN-marked instead of dropped
    #[serde(default)]
    pub ecn_mark: u64,
    /// Pure-ack drops (not counted as congestion loss)
    #[serde(default)]
    pub ack_drops: u64,
}

impl TinDump {
    /// Drops that indicate real congestion: ECN marks plus drops, minus
    /// ack filtering
    pub fn true_drops(&self) -> f64 {
        self.ecn_mark as f64 + self.drops as f64 - self.ack_drops as f64
    }
}

/// Reformat a tc parent handle the way stored classids are rendered:
/// `1:3` -> `0x1:0x3`
fn parent_key(parent: &str) -> String {
    parent
        .split(':')
        .take(2)
        .map(|half| format!("0x{half}"))
        .collect::<Vec<_>>()
        .join(":")
}

/// Decode a qdisc dump and key it by reformatted parent handle.
///
/// Entries without a parent (the MQ root) are skipped. An empty dump (e.g.
/// a simulated run) yields an empty map.
pub fn parse_qdisc_dump(raw: &str) -> Result<HashMap<String, QdiscDump>> {
    if raw.trim().is_empty() {
        return Ok(HashMap::new());
    }
    let entries: Vec<QdiscDump> = serde_json::from_str(raw)
        .map_err(|e| Error::StatsParse(format!("qdisc dump is not valid JSON: {e}")))?;
    Ok(entries
        .into_iter()
        .filter_map(|entry| {
            let parent = entry.parent.as_deref()?;
            Some((parent_key(parent), entry))
        })
        .collect())
}

// ---------------------------------------------------------------------------
// Two-sample windows
// ---------------------------------------------------------------------------

/// Cumulative counters captured for one direction in one scrape
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct DirectionCounters {
    /// Bytes sent
    pub bytes_sent: u64,
    /// Packets sent
    pub packets_sent: u64,
    /// Packets dropped
    pub packet_drops: u64,
    /// drops / packets over the cumulative counters, 3 decimals
    pub overload_factor: f64,
}

impl DirectionCounters {
    /// Capture counters from a qdisc entry
    pub fn from_dump(dump: &QdiscDump) -> Self {
        Self {
            bytes_sent: dump.bytes,
            packets_sent: dump.packets,
            packet_drops: dump.drops,
            overload_factor: ratio3(dump.drops as f64, dump.packets as f64),
        }
    }
}

/// One scrape of both directions for a circuit
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct QuerySample {
    /// Download-direction counters (interface A)
    pub download: DirectionCounters,
    /// Upload-direction counters (interface B)
    pub upload: DirectionCounters,
    /// Wall-clock capture time
    pub time: DateTime<Utc>,
}

/// Rates and deltas derived from a pair of samples
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct DeltaSample {
    /// Download throughput in bits per second
    pub bits_download: u64,
    /// Upload throughput in bits per second
    pub bits_upload: u64,
    /// Download bytes since the prior sample
    pub bytes_sent_download: u64,
    /// Upload bytes since the prior sample
    pub bytes_sent_upload: u64,
    /// Download packets since the prior sample
    pub packets_sent_download: u64,
    /// Upload packets since the prior sample
    pub packets_sent_upload: u64,
    /// Download drops since the prior sample
    pub packet_drops_download: u64,
    /// Upload drops since the prior sample
    pub packet_drops_upload: u64,
    /// Drops / packets over the interval, download direction
    pub overload_factor_download: f64,
    /// Drops / packets over the interval, upload direction
    pub overload_factor_upload: f64,
}

/// Sliding two-sample window for one circuit
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct CircuitStats {
    /// The previous scrape, if any
    pub prior_query: Option<QuerySample>,
    /// The latest scrape
    pub current_query: Option<QuerySample>,
    /// Derived deltas between the two
    #[serde(default)]
    pub since_last_query: DeltaSample,
}

/// Compute the deltas between a sample pair.
///
/// Pure: missing prior, a non-positive interval, or a counter that went
/// backwards all zero the affected values rather than failing the scrape.
pub fn since_last_query(current: &QuerySample, prior: Option<&QuerySample>) -> DeltaSample {
    let Some(prior) = prior else {
        return DeltaSample::default();
    };

    let bytes_download = current.download.bytes_sent.saturating_sub(prior.download.bytes_sent);
    let bytes_upload = current.upload.bytes_sent.saturating_sub(prior.upload.bytes_sent);
    let packets_download = current
        .download
        .packets_sent
        .saturating_sub(prior.download.packets_sent);
    let packets_upload = current
        .upload
        .packets_sent
        .saturating_sub(prior.upload.packets_sent);
    let drops_download = current
        .download
        .packet_drops
        .saturating_sub(prior.download.packet_drops);
    let drops_upload = current
        .upload
        .packet_drops
        .saturating_sub(prior.upload.packet_drops);

    let delta_seconds = (current.time - prior.time).num_milliseconds() as f64 / 1000.0;
    let bits = |bytes: u64| -> u64 {
        if delta_seconds > 0.0 {
            ((bytes as f64 * 8.0) / delta_seconds).round() as u64
        } else {
            0
        }
    };

    DeltaSample {
        bits_download: bits(bytes_download),
        bits_upload: bits(bytes_upload),
        bytes_sent_download: bytes_download,
        bytes_sent_upload: bytes_upload,
        packets_sent_download: packets_download,
        packets_sent_upload: packets_upload,
        packet_drops_download: drops_download,
        packet_drops_upload: drops_upload,
        overload_factor_download: ratio3(drops_download as f64, packets_download as f64),
        overload_factor_upload: ratio3(drops_upload as f64, packets_upload as f64),
    }
}

fn ratio3(numerator: f64, denominator: f64) -> f64 {
    if numerator > 0.0 && denominator > 0.0 {
        round3(numerator / denominator)
    } else {
        0.0
    }
}

fn round1(x: f64) -> f64 {
    (x * 10.0).round() / 10.0
}

fn round3(x: f64) -> f64 {
    (x * 1000.0).round() / 1000.0
}

// ---------------------------------------------------------------------------
// Tracked entities (persisted snapshots)
// ---------------------------------------------------------------------------

/// A circuit as tracked by the stats path
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TrackedCircuit {
    /// Stable circuit id
    pub circuit_id: String,
    /// Display name (a point tag)
    pub circuit_name: String,
    /// Owning node name (a point tag)
    pub parent_node: String,
    /// Leaf class handle, matched against qdisc parent handles
    pub class_id: TcHandle,
    /// Download ceiling in Mbps, the utilization denominator
    pub max_download: u64,
    /// Upload ceiling in Mbps, the utilization denominator
    pub max_upload: u64,
    /// Sliding sample window
    #[serde(default)]
    pub stats: CircuitStats,
}

/// Aggregated per-node deltas for one scrape
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ParentStats {
    /// Sum of child circuits' download bits per second
    pub bits_download: u64,
    /// Sum of child circuits' upload bits per second
    pub bits_upload: u64,
    /// Sum of child circuits' drops, both directions
    pub packet_drops_total: u64,
    /// drops / packets × 100 over the interval, 1 decimal
    pub overload_factor_total: f64,
}

/// A topology node as tracked by the stats path
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TrackedParent {
    /// Node name
    pub name: String,
    /// The node's class handle
    pub class_id: TcHandle,
    /// Download cap in Mbps, the utilization denominator
    pub max_download: u64,
    /// Upload cap in Mbps, the utilization denominator
    pub max_upload: u64,
    /// Aggregates from the latest scrape
    #[serde(default)]
    pub stats: ParentStats,
}

/// Build the tracked-circuit and tracked-parent snapshots for a freshly
/// compiled structure (with empty stats windows)
pub fn tracked_from_structure(
    structure: &QueuingStructure,
) -> (Vec<TrackedCircuit>, Vec<TrackedParent>) {
    let mut circuits = Vec::new();
    let mut parents = Vec::new();
    fn walk(
        nodes: &[crate::topology::NetworkNode],
        circuits: &mut Vec<TrackedCircuit>,
        parents: &mut Vec<TrackedParent>,
    ) {
        for node in nodes {
            parents.push(TrackedParent {
                name: node.name.clone(),
                class_id: node.class_id,
                max_download: node.download_mbps,
                max_upload: node.upload_mbps,
                stats: ParentStats::default(),
            });
            for circuit in &node.circuits {
                circuits.push(TrackedCircuit {
                    circuit_id: circuit.circuit_id.clone(),
                    circuit_name: circuit.circuit_name.clone(),
                    parent_node: node.name.clone(),
                    class_id: circuit.class_id,
                    max_download: circuit.max_download,
                    max_upload: circuit.max_upload,
                    stats: CircuitStats::default(),
                });
            }
            walk(&node.children, circuits, parents);
        }
    }
    walk(&structure.network, &mut circuits, &mut parents);
    (circuits, parents)
}

/// Aggregate child-circuit deltas onto each parent.
///
/// The overload factor is only meaningful when both directions actually
/// moved packets during the interval.
pub fn aggregate_parents(parents: &mut [TrackedParent], circuits: &[TrackedCircuit]) {
    for parent in parents.iter_mut() {
        let mut stats = ParentStats::default();
        let mut packets_download: u64 = 0;
        let mut packets_upload: u64 = 0;
        for circuit in circuits.iter().filter(|c| c.parent_node == parent.name) {
            let since = &circuit.stats.since_last_query;
            stats.bits_download += since.bits_download;
            stats.bits_upload += since.bits_upload;
            stats.packet_drops_total +=
                since.packet_drops_download + since.packet_drops_upload;
            packets_download += since.packets_sent_download;
            packets_upload += since.packets_sent_upload;
        }
        let packets_total = packets_download + packets_upload;
        stats.overload_factor_total = if packets_download > 0 && packets_upload > 0 {
            round1(stats.packet_drops_total as f64 / packets_total as f64 * 100.0)
        } else {
            0.0
        };
        parent.stats = stats;
    }
}

// ---------------------------------------------------------------------------
// Tin stats
// ---------------------------------------------------------------------------

/// A value held once per CAKE tin
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct PerTin<T> {
    /// Bulk tin
    pub bulk: T,
    /// BestEffort tin
    pub best_effort: T,
    /// Video tin
    pub video: T,
    /// Voice tin
    pub voice: T,
}

impl<T> PerTin<T> {
    /// Shared access by tin
    pub fn get(&self, tin: Tin) -> &T {
        match tin {
            Tin::Bulk => &self.bulk,
            Tin::BestEffort => &self.best_effort,
            Tin::Video => &self.video,
            Tin::Voice => &self.voice,
        }
    }

    /// Mutable access by tin
    pub fn get_mut(&mut self, tin: Tin) -> &mut T {
        match tin {
            Tin::Bulk => &mut self.bulk,
            Tin::BestEffort => &mut self.best_effort,
            Tin::Video => &mut self.video,
            Tin::Voice => &mut self.voice,
        }
    }
}

/// A value held once per direction
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct PerDirection<T> {
    /// Download direction
    pub download: T,
    /// Upload direction
    pub upload: T,
}

impl<T> PerDirection<T> {
    /// Shared access by direction
    pub fn get(&self, direction: Direction) -> &T {
        match direction {
            Direction::Download => &self.download,
            Direction::Upload => &self.upload,
        }
    }

    /// Mutable access by direction
    pub fn get_mut(&mut self, direction: Direction) -> &mut T {
        match direction {
            Direction::Download => &mut self.download,
            Direction::Upload => &mut self.upload,
        }
    }
}

/// Cumulative tin counters accumulated across all circuits in one scrape
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct TinCounters {
    /// Packets sent
    pub sent_packets: f64,
    /// Congestion drops (ECN marks + drops - ack drops)
    pub drops: f64,
}

/// Cumulative tin counters for one scrape, all tins and directions
pub type TinQuery = PerTin<PerDirection<TinCounters>>;

/// Per-tin deltas and derived percentages for one interval
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct TinDelta {
    /// Packets sent during the interval
    pub sent_packets: f64,
    /// Congestion drops during the interval
    pub drops: f64,
    /// drops / sent × 100, clamped at 0, 3 decimals
    pub drop_percentage: f64,
    /// Share of the direction's total packets, clamped to [0, 100]
    pub percentage: f64,
}

/// Sliding two-sample window for tin stats
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct TinsStats {
    /// The previous scrape's accumulated counters
    pub prior_query: Option<TinQuery>,
    /// The latest scrape's accumulated counters
    pub current_query: Option<TinQuery>,
    /// Derived deltas between the two
    #[serde(default)]
    pub since_last_query: PerTin<PerDirection<TinDelta>>,
}

/// Compute per-tin deltas and shares.
///
/// `all_packets` carries the direction-wide circuit packet totals for the
/// interval; each tin's share uses its own direction's total.
pub fn tin_deltas(
    current: &TinQuery,
    prior: Option<&TinQuery>,
    all_packets: PerDirection<f64>,
) -> PerTin<PerDirection<TinDelta>> {
    let mut out = PerTin::<PerDirection<TinDelta>>::default();
    for tin in Tin::ALL {
        for direction in Direction::BOTH {
            let cur = current.get(tin).get(direction);
            let (sent, drops) = match prior {
                Some(prior) => {
                    let p = prior.get(tin).get(direction);
                    (
                        (cur.sent_packets - p.sent_packets).max(0.0),
                        (cur.drops - p.drops).max(0.0),
                    )
                }
                None => (0.0, 0.0),
            };
            let drop_percentage = if sent > 0.0 {
                round3(drops / sent * 100.0).max(0.0)
            } else {
                0.0
            };
            let total = *all_packets.get(direction);
            let percentage = if total > 0.0 {
                round3(sent / total * 100.0).min(100.0)
            } else {
                0.0
            };
            *out.get_mut(tin).get_mut(direction) = TinDelta {
                sent_packets: sent,
                drops,
                drop_percentage,
                percentage,
            };
        }
    }
    out
}

/// Cumulative counters that outlive individual scrapes
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct LongTermStats {
    /// Total packets dropped across all parents since first run
    pub dropped_packets_total: f64,
}

// ---------------------------------------------------------------------------
// The collector
// ---------------------------------------------------------------------------

/// Scrapes qdisc counters, updates the persisted windows and publishes
/// derived points
pub struct StatsCollector<'a> {
    config: &'a Config,
    files: DataFiles,
    executor: &'a dyn Executor,
    sink: &'a dyn PointSink,
}

impl<'a> StatsCollector<'a> {
    /// Wire up a collector against an executor and a point sink
    pub fn new(config: &'a Config, executor: &'a dyn Executor, sink: &'a dyn PointSink) -> Self {
        Self {
            config,
            files: DataFiles::new(&config.data_dir),
            executor,
            sink,
        }
    }

    /// Run one scrape cycle: capture, diff, aggregate, publish, persist.
    ///
    /// Snapshots are persisted even when the publisher fails; the publisher
    /// error is surfaced afterwards and never retried within the scrape.
    pub async fn run(&self) -> Result<()> {
        let mut circuits: Vec<TrackedCircuit> = persist::load_json(&self.files.stats_by_circuit())?
            .ok_or_else(|| {
                Error::NotFound(
                    "no circuit stats snapshot on disk; run a full reload first".to_string(),
                )
            })?;
        let mut parents: Vec<TrackedParent> =
            persist::load_json(&self.files.stats_by_parent_node())?.unwrap_or_default();
        let mut tins: TinsStats =
            persist::load_json(&self.files.tins_stats())?.unwrap_or_default();
        let mut long_term: LongTermStats =
            persist::load_json(&self.files.long_term_stats())?.unwrap_or_default();

        info!(circuits = circuits.len(), "retrieving circuit statistics");
        let dump_a = self.interface_dump(&self.config.interface_a).await?;
        let dump_b = self.interface_dump(&self.config.interface_b).await?;

        let now = Utc::now();
        let mut tin_query = TinQuery::default();
        let mut all_packets = PerDirection::<f64>::default();
        for circuit in circuits.iter_mut() {
            let key = circuit.class_id.class_string();
            let entry_a = dump_a.get(&key);
            let entry_b = dump_b.get(&key);
            if self.config.sqm.has_tins() {
                accumulate_tins(&mut tin_query, entry_a, Direction::Download);
                accumulate_tins(&mut tin_query, entry_b, Direction::Upload);
            }

            let current = QuerySample {
                download: entry_a
                    .map(DirectionCounters::from_dump)
                    .unwrap_or_default(),
                upload: entry_b.map(DirectionCounters::from_dump).unwrap_or_default(),
                time: now,
            };
            circuit.stats.prior_query = circuit.stats.current_query.take();
            circuit.stats.since_last_query =
                since_last_query(&current, circuit.stats.prior_query.as_ref());
            circuit.stats.current_query = Some(current);

            all_packets.download += circuit.stats.since_last_query.packets_sent_download as f64;
            all_packets.upload += circuit.stats.since_last_query.packets_sent_upload as f64;
        }

        if self.config.sqm.has_tins() {
            tins.prior_query = tins.current_query.take();
            tins.since_last_query =
                tin_deltas(&tin_query, tins.prior_query.as_ref(), all_packets);
            tins.current_query = Some(tin_query);
        }

        aggregate_parents(&mut parents, &circuits);
        long_term.dropped_packets_total += parents
            .iter()
            .map(|p| p.stats.packet_drops_total as f64)
            .sum::<f64>();

        let publish_result = self.publish(&circuits, &parents, &tins).await;

        persist::save_json(&self.files.stats_by_circuit(), &circuits)?;
        persist::save_json(&self.files.stats_by_parent_node(), &parents)?;
        persist::save_json(&self.files.tins_stats(), &tins)?;
        persist::save_json(&self.files.long_term_stats(), &long_term)?;

        publish_result
    }

    async fn interface_dump(&self, interface: &str) -> Result<HashMap<String, QdiscDump>> {
        let output = self
            .executor
            .run_shell(&format!("tc -j -s qdisc show dev {interface}"))
            .await?;
        if !output.success {
            warn!(interface, "qdisc stats dump returned a failure status");
        }
        parse_qdisc_dump(&output.output)
    }

    async fn publish(
        &self,
        circuits: &[TrackedCircuit],
        parents: &[TrackedParent],
        tins: &TinsStats,
    ) -> Result<()> {
        let mut sent = 0usize;
        let circuit_points: Vec<Point> = circuits.iter().flat_map(circuit_points).collect();
        for chunk in circuit_points.chunks(PUBLISH_CHUNK_SIZE) {
            self.sink.write_points(chunk).await?;
            sent += chunk.len();
        }

        let mut batch: Vec<Point> = parents.iter().flat_map(parent_points).collect();
        if self.config.sqm.has_tins() {
            batch.extend(tin_points(&tins.since_last_query));
        }
        sent += batch.len();
        self.sink.write_points(&batch).await?;
        debug!(points = sent, "published measurement points");
        Ok(())
    }
}

fn accumulate_tins(query: &mut TinQuery, entry: Option<&QdiscDump>, direction: Direction) {
    let Some(entry) = entry else { return };
    for (tin, dump) in Tin::ALL.iter().zip(entry.tins.iter()) {
        let counters = query.get_mut(*tin).get_mut(direction);
        counters.sent_packets += dump.sent_packets as f64;
        counters.drops += dump.true_drops();
    }
}

/// Bandwidth and utilization points for one circuit; only emitted when the
/// circuit moved traffic in both directions during the interval
fn circuit_points(circuit: &TrackedCircuit) -> Vec<Point> {
    let since = &circuit.stats.since_last_query;
    let bits_download = since.bits_download as f64;
    let bits_upload = since.bits_upload as f64;
    if bits_download <= 0.0 || bits_upload <= 0.0 {
        return Vec::new();
    }
    let utilization_download =
        round1(bits_download / (circuit.max_download * 1_000_000) as f64 * 100.0);
    let utilization_upload =
        round1(bits_upload / (circuit.max_upload * 1_000_000) as f64 * 100.0);
    vec![
        Point::new("Bandwidth")
            .tag("Circuit", &circuit.circuit_name)
            .tag("ParentNode", &circuit.parent_node)
            .tag("Type", "Circuit")
            .field("Download", bits_download)
            .field("Upload", bits_upload),
        Point::new("Utilization")
            .tag("Circuit", &circuit.circuit_name)
            .tag("ParentNode", &circuit.parent_node)
            .tag("Type", "Circuit")
            .field("Download", utilization_download)
            .field("Upload", utilization_upload),
    ]
}

/// Bandwidth, utilization and overload points for one parent node
fn parent_points(parent: &TrackedParent) -> Vec<Point> {
    let stats = &parent.stats;
    let bits_download = stats.bits_download as f64;
    let bits_upload = stats.bits_upload as f64;
    if bits_download <= 0.0 || bits_upload <= 0.0 {
        return Vec::new();
    }
    let utilization_download =
        round1(bits_download / (parent.max_download * 1_000_000) as f64 * 100.0);
    let utilization_upload =
        round1(bits_upload / (parent.max_upload * 1_000_000) as f64 * 100.0);
    vec![
        Point::new("Bandwidth")
            .tag("Device", &parent.name)
            .tag("ParentNode", &parent.name)
            .tag("Type", "Parent Node")
            .field("Download", bits_download)
            .field("Upload", bits_upload),
        Point::new("Utilization")
            .tag("Device", &parent.name)
            .tag("ParentNode", &parent.name)
            .tag("Type", "Parent Node")
            .field("Download", utilization_download)
            .field("Upload", utilization_upload),
        Point::new("Overload")
            .tag("Device", &parent.name)
            .tag("ParentNode", &parent.name)
            .tag("Type", "Parent Node")
            .field("Overload", stats.overload_factor_total),
    ]
}

/// Tin drop-percentage and share points, one pair per tin
fn tin_points(since: &PerTin<PerDirection<TinDelta>>) -> Vec<Point> {
    let mut points = Vec::with_capacity(8);
    for tin in Tin::ALL {
        let download = since.get(tin).get(Direction::Download);
        let upload = since.get(tin).get(Direction::Upload);
        points.push(
            Point::new("Tin Drop Percentage")
                .tag("Type", "Tin")
                .tag("Tin", tin.as_str())
                .field("Download", download.drop_percentage)
                .field("Upload", upload.drop_percentage),
        );
        points.push(
            Point::new("Tins Assigned")
                .tag("Type", "Tin")
                .tag("Tin", tin.as_str())
                .field("Download", download.percentage)
                .field("Upload", upload.percentage),
        );
    }
    points
}
