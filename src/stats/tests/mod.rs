use super::*;
use crate::executor::ShellOutput;
use crate::publisher::MemorySink;
use crate::topology::{NetworkNode, NodeKind, ShapedCircuit};
use async_trait::async_trait;
use chrono::Duration;
use std::collections::BTreeMap;
use std::path::Path;
use tempfile::TempDir;

fn sample(bytes: u64, packets: u64, drops: u64, time: DateTime<Utc>) -> QuerySample {
    let counters = DirectionCounters {
        bytes_sent: bytes,
        packets_sent: packets,
        packet_drops: drops,
        overload_factor: 0.0,
    };
    QuerySample {
        download: counters,
        upload: counters,
        time,
    }
}

#[test]
fn qdisc_dump_is_keyed_by_reformatted_parent_handle() {
    let raw = r#"[
        {"kind": "mq", "handle": "7fff:", "bytes": 1, "packets": 1, "drops": 0},
        {"kind": "cake", "handle": "8001:", "parent": "1:3", "bytes": 1000,
         "packets": 10, "drops": 2, "backlog": 0,
         "tins": [
            {"sent_packets": 1, "drops": 0, "ecn_mark": 0, "ack_drops": 0},
            {"sent_packets": 7, "drops": 1, "ecn_mark": 1, "ack_drops": 0},
            {"sent_packets": 1, "drops": 0, "ecn_mark": 0, "ack_drops": 0},
            {"sent_packets": 1, "drops": 1, "ecn_mark": 0, "ack_drops": 1}
         ]}
    ]"#;
    let dump = parse_qdisc_dump(raw).unwrap();
    // The parentless MQ root is skipped
    assert_eq!(dump.len(), 1);
    let entry = &dump["0x1:0x3"];
    assert_eq!(entry.bytes, 1000);
    assert_eq!(entry.packets, 10);
    assert_eq!(entry.drops, 2);
    assert_eq!(entry.tins.len(), 4);
    assert_eq!(entry.tins[1].true_drops(), 2.0);
    assert_eq!(entry.tins[3].true_drops(), 0.0);
}

#[test]
fn empty_dump_yields_empty_map() {
    assert!(parse_qdisc_dump("").unwrap().is_empty());
    assert!(parse_qdisc_dump("  \n").unwrap().is_empty());
}

#[test]
fn malformed_dump_is_a_stats_parse_error() {
    match parse_qdisc_dump("{broken") {
        Err(Error::StatsParse(_)) => {}
        other => panic!("expected StatsParse, got {other:?}"),
    }
}

/// Two synthetic samples one second apart: bytes 1000->2000, packets 10->20,
/// drops 0->1 ⇒ 8000 bits/s, 10 packets, 1 drop, overload 0.1
#[test]
fn delta_math_matches_known_sample_pair() {
    let t0 = Utc::now();
    let prior = sample(1000, 10, 0, t0);
    let current = sample(2000, 20, 1, t0 + Duration::seconds(1));
    let since = since_last_query(&current, Some(&prior));
    assert_eq!(since.bits_download, 8000);
    assert_eq!(since.bytes_sent_download, 1000);
    assert_eq!(since.packets_sent_download, 10);
    assert_eq!(since.packet_drops_download, 1);
    assert_eq!(since.overload_factor_download, 0.1);
    assert_eq!(since.bits_upload, 8000);
}

#[test]
fn zero_interval_yields_zero_bits() {
    let t0 = Utc::now();
    let since = since_last_query(&sample(2000, 20, 0, t0), Some(&sample(1000, 10, 0, t0)));
    assert_eq!(since.bits_download, 0);
    // Counter deltas are still recorded
    assert_eq!(since.bytes_sent_download, 1000);
}

#[test]
fn counter_rollback_yields_zeroes() {
    let t0 = Utc::now();
    let prior = sample(5000, 50, 9, t0);
    let current = sample(1000, 10, 1, t0 + Duration::seconds(1));
    let since = since_last_query(&current, Some(&prior));
    assert_eq!(since.bits_download, 0);
    assert_eq!(since.bytes_sent_download, 0);
    assert_eq!(since.packets_sent_download, 0);
    assert_eq!(since.packet_drops_download, 0);
    assert_eq!(since.overload_factor_download, 0.0);
}

#[test]
fn missing_prior_yields_default_deltas() {
    let current = sample(2000, 20, 1, Utc::now());
    assert_eq!(since_last_query(&current, None), DeltaSample::default());
}

#[test]
fn direction_counters_capture_cumulative_overload() {
    let dump = QdiscDump {
        bytes: 1000,
        packets: 20,
        drops: 1,
        ..QdiscDump::default()
    };
    let counters = DirectionCounters::from_dump(&dump);
    assert_eq!(counters.overload_factor, 0.05);

    let idle = DirectionCounters::from_dump(&QdiscDump::default());
    assert_eq!(idle.overload_factor, 0.0);
}

#[test]
fn tin_deltas_use_own_direction_totals() {
    let mut current = TinQuery::default();
    current.best_effort.download.sent_packets = 80.0;
    current.best_effort.upload.sent_packets = 10.0;
    current.bulk.download.sent_packets = 20.0;

    let deltas = tin_deltas(
        &current,
        Some(&TinQuery::default()),
        PerDirection {
            download: 100.0,
            upload: 10.0,
        },
    );
    assert_eq!(deltas.best_effort.download.percentage, 80.0);
    assert_eq!(deltas.bulk.download.percentage, 20.0);
    // Upload share is computed against the upload total, not download's
    assert_eq!(deltas.best_effort.upload.percentage, 100.0);
}

#[test]
fn tin_shares_in_a_direction_sum_to_at_most_one_hundred() {
    let mut current = TinQuery::default();
    current.bulk.download.sent_packets = 33.0;
    current.best_effort.download.sent_packets = 33.0;
    current.video.download.sent_packets = 33.0;
    current.voice.download.sent_packets = 1.0;

    let deltas = tin_deltas(
        &current,
        Some(&TinQuery::default()),
        PerDirection {
            download: 100.0,
            upload: 0.0,
        },
    );
    let total: f64 = Tin::ALL
        .iter()
        .map(|t| deltas.get(*t).download.percentage)
        .sum();
    assert!(total <= 100.0);
}

#[test]
fn tin_drop_percentage_is_clamped_and_rounded() {
    let mut current = TinQuery::default();
    current.video.download.sent_packets = 3.0;
    current.video.download.drops = 1.0;

    let deltas = tin_deltas(
        &current,
        Some(&TinQuery::default()),
        PerDirection {
            download: 3.0,
            upload: 0.0,
        },
    );
    assert_eq!(deltas.video.download.drop_percentage, 33.333);
    // No packets sent: percentage math degrades to zero rather than NaN
    assert_eq!(deltas.voice.download.drop_percentage, 0.0);
    assert_eq!(deltas.voice.upload.percentage, 0.0);
}

#[test]
fn missing_tin_prior_zeroes_the_window() {
    let mut current = TinQuery::default();
    current.bulk.download.sent_packets = 50.0;
    let deltas = tin_deltas(
        &current,
        None,
        PerDirection {
            download: 50.0,
            upload: 0.0,
        },
    );
    assert_eq!(deltas.bulk.download.sent_packets, 0.0);
    assert_eq!(deltas.bulk.download.percentage, 0.0);
}

#[test]
fn parents_aggregate_child_circuit_deltas() {
    let mut parents = vec![TrackedParent {
        name: "Site_1".into(),
        class_id: TcHandle::new(1, 3),
        max_download: 1000,
        max_upload: 1000,
        stats: ParentStats::default(),
    }];
    let mut circuit = TrackedCircuit {
        circuit_id: "C1".into(),
        circuit_name: "Alice".into(),
        parent_node: "Site_1".into(),
        class_id: TcHandle::new(1, 4),
        max_download: 100,
        max_upload: 100,
        stats: CircuitStats::default(),
    };
    circuit.stats.since_last_query = DeltaSample {
        bits_download: 5000,
        bits_upload: 2000,
        packets_sent_download: 150,
        packets_sent_upload: 50,
        packet_drops_download: 3,
        packet_drops_upload: 1,
        ..DeltaSample::default()
    };
    let mut other = circuit.clone();
    other.circuit_id = "C2".into();
    other.parent_node = "Elsewhere".into();

    aggregate_parents(&mut parents, &[circuit, other]);
    let stats = &parents[0].stats;
    assert_eq!(stats.bits_download, 5000);
    assert_eq!(stats.bits_upload, 2000);
    assert_eq!(stats.packet_drops_total, 4);
    // 4 / 200 * 100 = 2.0, one decimal
    assert_eq!(stats.overload_factor_total, 2.0);
}

#[test]
fn parent_overload_requires_traffic_in_both_directions() {
    let mut parents = vec![TrackedParent {
        name: "Site_1".into(),
        class_id: TcHandle::new(1, 3),
        max_download: 1000,
        max_upload: 1000,
        stats: ParentStats::default(),
    }];
    let mut circuit = TrackedCircuit {
        circuit_id: "C1".into(),
        circuit_name: "Alice".into(),
        parent_node: "Site_1".into(),
        class_id: TcHandle::new(1, 4),
        max_download: 100,
        max_upload: 100,
        stats: CircuitStats::default(),
    };
    circuit.stats.since_last_query = DeltaSample {
        packets_sent_download: 100,
        packet_drops_download: 10,
        ..DeltaSample::default()
    };
    aggregate_parents(&mut parents, &[circuit]);
    assert_eq!(parents[0].stats.overload_factor_total, 0.0);
}

#[test]
fn tracked_snapshots_flatten_the_structure() {
    let structure = QueuingStructure {
        network: vec![NetworkNode {
            name: "Site_1".into(),
            kind: NodeKind::Site,
            download_mbps: 1000,
            upload_mbps: 500,
            download_mbps_min: 0,
            upload_mbps_min: 0,
            class_id: TcHandle::new(1, 3),
            parent_class_id: "0x1:".into(),
            cpu_num: 0,
            circuits: vec![ShapedCircuit {
                circuit_id: "C1".into(),
                circuit_name: "Alice".into(),
                parent_node: "Site_1".into(),
                devices: Vec::new(),
                min_download: 25,
                min_upload: 10,
                max_download: 100,
                max_upload: 50,
                class_id: TcHandle::new(1, 4),
                comment: String::new(),
            }],
            children: vec![NetworkNode {
                name: "AP_A".into(),
                kind: NodeKind::Ap,
                download_mbps: 500,
                upload_mbps: 250,
                download_mbps_min: 0,
                upload_mbps_min: 0,
                class_id: TcHandle::new(1, 5),
                parent_class_id: "0x1:0x3".into(),
                cpu_num: 0,
                circuits: Vec::new(),
                children: Vec::new(),
            }],
        }],
        queues_available: 2,
        next_minor_by_queue: BTreeMap::from([(1, 6), (2, 3)]),
        generated_parents: Vec::new(),
    };
    let (circuits, parents) = tracked_from_structure(&structure);
    assert_eq!(parents.len(), 2);
    assert_eq!(circuits.len(), 1);
    assert_eq!(circuits[0].parent_node, "Site_1");
    assert_eq!(circuits[0].max_download, 100);
    assert!(circuits[0].stats.current_query.is_none());
}

// ---------------------------------------------------------------------------
// Collector end-to-end against a canned executor
// ---------------------------------------------------------------------------

struct CannedExecutor {
    dump_a: String,
    dump_b: String,
}

#[async_trait]
impl Executor for CannedExecutor {
    async fn run_shell(&self, command: &str) -> crate::error::Result<ShellOutput> {
        let output = if command.contains("dev eth1") {
            self.dump_a.clone()
        } else {
            self.dump_b.clone()
        };
        Ok(ShellOutput {
            success: true,
            output,
        })
    }

    async fn run_shell_batch(&self, _file: &Path) -> crate::error::Result<ShellOutput> {
        Ok(ShellOutput::default())
    }

    async fn xdp_clear(&self) -> crate::error::Result<()> {
        Ok(())
    }

    async fn xdp_add_entry(
        &self,
        _ip: &str,
        _cpu: u16,
        _class_id: TcHandle,
    ) -> crate::error::Result<()> {
        Ok(())
    }

    async fn xdp_del_entry(&self, _ip: &str) -> crate::error::Result<()> {
        Ok(())
    }
}

fn canned_dump(bytes: u64, packets: u64, drops: u64) -> String {
    format!(
        r#"[{{"kind": "cake", "handle": "8001:", "parent": "1:4",
             "bytes": {bytes}, "packets": {packets}, "drops": {drops},
             "tins": [
                {{"sent_packets": 0, "drops": 0, "ecn_mark": 0, "ack_drops": 0}},
                {{"sent_packets": {packets}, "drops": {drops}, "ecn_mark": 0, "ack_drops": 0}},
                {{"sent_packets": 0, "drops": 0, "ecn_mark": 0, "ack_drops": 0}},
                {{"sent_packets": 0, "drops": 0, "ecn_mark": 0, "ack_drops": 0}}
             ]}}]"#
    )
}

fn seeded_circuit_snapshot(dir: &Path) -> DataFiles {
    let files = DataFiles::new(dir);
    // A prior scrape 10 seconds ago with small counters, so this scrape
    // produces positive deltas and a sane interval
    let mut circuit = TrackedCircuit {
        circuit_id: "C1".into(),
        circuit_name: "Alice".into(),
        parent_node: "Site_1".into(),
        class_id: TcHandle::new(1, 4),
        max_download: 100,
        max_upload: 100,
        stats: CircuitStats::default(),
    };
    circuit.stats.current_query = Some(sample(
        1_000,
        10,
        0,
        Utc::now() - Duration::seconds(10),
    ));
    persist::save_json(&files.stats_by_circuit(), &vec![circuit]).unwrap();
    let parents = vec![TrackedParent {
        name: "Site_1".into(),
        class_id: TcHandle::new(1, 3),
        max_download: 1000,
        max_upload: 1000,
        stats: ParentStats::default(),
    }];
    persist::save_json(&files.stats_by_parent_node(), &parents).unwrap();
    files
}

#[tokio::test]
async fn collector_publishes_and_persists_a_scrape() {
    let dir = TempDir::new().unwrap();
    let files = seeded_circuit_snapshot(dir.path());
    let config = Config {
        data_dir: dir.path().to_path_buf(),
        ..Config::default()
    };
    let executor = CannedExecutor {
        dump_a: canned_dump(10_001_000, 1_010, 5),
        dump_b: canned_dump(5_001_000, 510, 2),
    };
    let sink = MemorySink::new();

    StatsCollector::new(&config, &executor, &sink)
        .run()
        .await
        .unwrap();

    let points = sink.points();
    assert!(
        points.iter().any(|p| p.measurement == "Bandwidth"
            && p.tags.get("Circuit").map(String::as_str) == Some("Alice")),
        "expected a circuit bandwidth point"
    );
    assert!(
        points
            .iter()
            .any(|p| p.measurement == "Utilization"
                && p.tags.get("Type").map(String::as_str) == Some("Parent Node")),
        "expected a parent utilization point"
    );
    assert!(
        points
            .iter()
            .any(|p| p.measurement == "Tin Drop Percentage"),
        "expected tin points under cake diffserv4"
    );

    // The window slid: prior is the seeded sample, current is this scrape
    let circuits: Vec<TrackedCircuit> =
        persist::load_json(&files.stats_by_circuit()).unwrap().unwrap();
    let stats = &circuits[0].stats;
    assert!(stats.prior_query.is_some());
    assert_eq!(
        stats.current_query.unwrap().download.bytes_sent,
        10_001_000
    );
    assert_eq!(stats.since_last_query.bytes_sent_download, 10_000_000);
    assert!(stats.since_last_query.bits_download > 7_000_000);
    assert!(stats.since_last_query.bits_download < 9_000_000);

    // Long-term drop counter picked up this interval's drops
    let long_term: LongTermStats =
        persist::load_json(&files.long_term_stats()).unwrap().unwrap();
    assert_eq!(long_term.dropped_packets_total, 7.0);

    let parents: Vec<TrackedParent> =
        persist::load_json(&files.stats_by_parent_node()).unwrap().unwrap();
    assert_eq!(parents[0].stats.packet_drops_total, 7);
}

struct FailingSink;

#[async_trait]
impl crate::publisher::PointSink for FailingSink {
    async fn write_points(&self, _points: &[Point]) -> crate::error::Result<()> {
        Err(Error::Publisher("store is down".into()))
    }
}

#[tokio::test]
async fn publisher_failure_still_persists_snapshots() {
    let dir = TempDir::new().unwrap();
    let files = seeded_circuit_snapshot(dir.path());
    let config = Config {
        data_dir: dir.path().to_path_buf(),
        ..Config::default()
    };
    let executor = CannedExecutor {
        dump_a: canned_dump(10_001_000, 1_010, 5),
        dump_b: canned_dump(5_001_000, 510, 2),
    };

    let result = StatsCollector::new(&config, &executor, &FailingSink)
        .run()
        .await;
    match result {
        Err(Error::Publisher(_)) => {}
        other => panic!("expected Publisher error, got {other:?}"),
    }

    // The scrape's window was persisted despite the failed write
    let circuits: Vec<TrackedCircuit> =
        persist::load_json(&files.stats_by_circuit()).unwrap().unwrap();
    assert!(circuits[0].stats.current_query.is_some());
}

#[tokio::test]
async fn collector_without_snapshot_reports_not_found() {
    let dir = TempDir::new().unwrap();
    let config = Config {
        data_dir: dir.path().to_path_buf(),
        ..Config::default()
    };
    let executor = CannedExecutor {
        dump_a: String::new(),
        dump_b: String::new(),
    };
    let sink = MemorySink::new();
    match StatsCollector::new(&config, &executor, &sink).run().await {
        Err(Error::NotFound(msg)) => assert!(msg.contains("full reload")),
        other => panic!("expected NotFound, got {other:?}"),
    }
}
