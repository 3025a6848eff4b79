use super::*;
use crate::compiler;
use crate::executor::{ExecutorCall, RecordingExecutor};
use crate::planner;
use crate::topology::{Device, TopologyNode};

fn test_config() -> Config {
    Config {
        interface_a: "eth1".into(),
        interface_b: "eth2".into(),
        ..Config::default()
    }
}

fn circuit(id: &str, parent: &str, min: u64, max: u64, ips: &[&str]) -> Circuit {
    Circuit {
        circuit_id: id.to_string(),
        circuit_name: format!("{id}-name"),
        parent_node: parent.to_string(),
        devices: vec![Device {
            device_id: format!("{id}-dev"),
            device_name: format!("{id}-dev"),
            mac: "aa:bb:cc:dd:ee:ff".into(),
            ipv4s: ips.iter().map(|s| s.to_string()).collect(),
            ipv6s: vec![],
            comment: String::new(),
        }],
        min_download: min,
        min_upload: min,
        max_download: max,
        max_upload: max,
        comment: String::new(),
    }
}

/// Compile a two-site structure (plus generated parents when the topology
/// is flat) holding the given circuits
fn build_structure(circuits: &[Circuit], flat: bool) -> QueuingStructure {
    let config = test_config();
    let mut topology = if flat {
        Vec::new()
    } else {
        vec![
            TopologyNode::new("Site_A", 500, 500),
            TopologyNode::new("Site_B", 500, 500),
        ]
    };
    let generated = planner::generate_parents(&mut topology, 2, &config);
    let mut circuits = circuits.to_vec();
    planner::place_unparented(&mut circuits, &generated, false);
    planner::clamp_caps(&mut topology, 1000, 1000);
    planner::accumulate_minimums(&mut topology, &circuits);
    compiler::compile(&topology, &circuits, 2, &generated, &config)
        .unwrap()
        .structure
}

#[test]
fn diff_classifies_every_transition() {
    let old = vec![
        circuit("KEEP", "Site_A", 10, 50, &["100.64.0.1"]),
        circuit("RESIZE", "Site_A", 10, 50, &["100.64.0.2"]),
        circuit("MOVE", "Site_A", 10, 50, &["100.64.0.3"]),
        circuit("REWIRE", "Site_A", 10, 50, &["100.64.0.4"]),
        circuit("GONE", "Site_A", 10, 50, &["100.64.0.5"]),
    ];
    let new = vec![
        circuit("KEEP", "Site_A", 10, 50, &["100.64.0.1"]),
        circuit("RESIZE", "Site_A", 20, 80, &["100.64.0.2"]),
        circuit("MOVE", "Site_B", 10, 50, &["100.64.0.3"]),
        circuit("REWIRE", "Site_A", 10, 50, &["100.64.0.9"]),
        circuit("FRESH", "Site_B", 10, 50, &["100.64.0.6"]),
    ];
    let diff = diff_snapshots(&old, &new);
    assert_eq!(diff.unchanged, 1);
    assert_eq!(diff.resized.len(), 1);
    assert_eq!(diff.resized[0].1.circuit_id, "RESIZE");
    assert_eq!(diff.relocated.len(), 1);
    assert_eq!(diff.relocated[0].1.circuit_id, "MOVE");
    assert_eq!(diff.rewired.len(), 1);
    assert_eq!(diff.rewired[0].1.circuit_id, "REWIRE");
    assert_eq!(diff.removed.len(), 1);
    assert_eq!(diff.removed[0].circuit_id, "GONE");
    assert_eq!(diff.added.len(), 1);
    assert_eq!(diff.added[0].circuit_id, "FRESH");
    assert!(!diff.is_empty());
}

#[test]
fn identical_snapshots_diff_to_nothing() {
    let snap = vec![circuit("C1", "Site_A", 10, 50, &["100.64.0.1"])];
    let diff = diff_snapshots(&snap, &snap);
    assert!(diff.is_empty());
    assert_eq!(diff.unchanged, 1);
}

#[test]
fn parent_change_wins_over_bandwidth_change() {
    let old = vec![circuit("C1", "Site_A", 10, 50, &["100.64.0.1"])];
    let new = vec![circuit("C1", "Site_B", 20, 80, &["100.64.0.1"])];
    let diff = diff_snapshots(&old, &new);
    assert_eq!(diff.relocated.len(), 1);
    assert!(diff.resized.is_empty());
}

/// Resize path: X goes from 50/50 to 75/75 under the same parent. Exactly
/// two `tc class change` commands (one per interface), classid kept, and no
/// XDP mutations.
#[tokio::test]
async fn resize_emits_two_class_changes_and_keeps_classid() {
    let old = vec![circuit("X", "Site_A", 50, 50, &["100.64.0.1"])];
    let new = vec![circuit("X", "Site_A", 75, 75, &["100.64.0.1"])];
    let mut structure = build_structure(&old, false);
    let old_class = structure.index().circuit_class["X"];
    let counters_before = structure.next_minor_by_queue.clone();

    let config = test_config();
    let executor = RecordingExecutor::new();
    let summary = Reconciler::new(&config, &executor)
        .apply(&mut structure, &diff_snapshots(&old, &new))
        .await
        .unwrap();

    assert_eq!(summary.resized, 1);
    let commands = executor.shell_commands();
    assert_eq!(commands.len(), 2);
    assert_eq!(
        commands[0],
        format!(
            "tc class change dev eth1 parent 0x1:0x3 classid {} htb rate 75Mbit ceil 75Mbit",
            old_class.minor_string()
        )
    );
    assert!(commands[1].starts_with("tc class change dev eth2"));
    assert!(
        !executor
            .calls()
            .iter()
            .any(|c| matches!(c, ExecutorCall::XdpAdd { .. } | ExecutorCall::XdpDel { .. })),
        "a pure resize must not touch XDP"
    );
    // Classid unchanged, counters unchanged
    assert_eq!(structure.index().circuit_class["X"], old_class);
    assert_eq!(structure.next_minor_by_queue, counters_before);
    assert_eq!(structure.circuits()[0].max_download, 75);
}

/// Relocate path: X moves from Site_A to Site_B. XDP entries removed, the
/// old class deleted on both interfaces, a fresh classid allocated on B's
/// CPU, the class recreated with its SQM qdisc, and XDP re-added with B's
/// CPU.
#[tokio::test]
async fn relocate_reallocates_under_the_new_parent() {
    let old = vec![circuit("X", "Site_A", 10, 50, &["100.64.0.1"])];
    let new = vec![circuit("X", "Site_B", 10, 50, &["100.64.0.1"])];
    let mut structure = build_structure(&old, false);
    let old_class = structure.index().circuit_class["X"];
    let site_b = structure.index().nodes["Site_B"].clone();
    let expected_minor = structure.next_minor_by_queue[&(site_b.cpu_num + 1)];

    let config = test_config();
    let executor = RecordingExecutor::new();
    let summary = Reconciler::new(&config, &executor)
        .apply(&mut structure, &diff_snapshots(&old, &new))
        .await
        .unwrap();
    assert_eq!(summary.relocated, 1);

    let calls = executor.calls();
    // XDP removal precedes the class teardown
    assert_eq!(
        calls[0],
        ExecutorCall::XdpDel {
            ip: "100.64.0.1".into()
        }
    );
    let commands = executor.shell_commands();
    assert_eq!(
        commands[0],
        format!(
            "tc class del dev eth1 classid {}",
            old_class.class_string()
        )
    );
    assert!(commands[1].starts_with("tc class del dev eth2"));
    // Recreated under Site_B's class with a fresh minor on B's queue
    let new_class = structure.index().circuit_class["X"];
    assert_eq!(new_class.major, site_b.cpu_num + 1);
    assert_eq!(new_class.minor as u32, expected_minor);
    assert_ne!(new_class, old_class);
    assert!(commands[2].contains(&format!(
        "class add dev eth1 parent {} classid {}",
        site_b.class_id.class_string(),
        new_class.minor_string()
    )));
    assert!(commands[3].starts_with("tc qdisc add dev eth1"));
    // XDP re-added with the new CPU
    assert!(calls.contains(&ExecutorCall::XdpAdd {
        ip: "100.64.0.1".into(),
        cpu: site_b.cpu_num,
        class_id: new_class,
    }));
    assert_eq!(structure.index().circuit_parent["X"], "Site_B");
}

#[tokio::test]
async fn remove_deletes_class_and_xdp_entries() {
    let old = vec![
        circuit("X", "Site_A", 10, 50, &["100.64.0.1", "100.64.0.2"]),
        circuit("Y", "Site_A", 10, 50, &["100.64.0.3"]),
    ];
    let new = vec![circuit("Y", "Site_A", 10, 50, &["100.64.0.3"])];
    let mut structure = build_structure(&old, false);
    let counters_before = structure.next_minor_by_queue.clone();

    let config = test_config();
    let executor = RecordingExecutor::new();
    let summary = Reconciler::new(&config, &executor)
        .apply(&mut structure, &diff_snapshots(&old, &new))
        .await
        .unwrap();
    assert_eq!(summary.removed, 1);

    let calls = executor.calls();
    let del_count = calls
        .iter()
        .filter(|c| matches!(c, ExecutorCall::XdpDel { .. }))
        .count();
    assert_eq!(del_count, 2, "one XDP delete per device IP");
    assert_eq!(executor.shell_commands().len(), 2, "class del per interface");
    assert_eq!(structure.circuits().len(), 1);
    // Counters never roll back on remove
    assert_eq!(structure.next_minor_by_queue, counters_before);
}

#[tokio::test]
async fn rewire_replaces_xdp_without_tc_commands() {
    let old = vec![circuit("X", "Site_A", 10, 50, &["100.64.0.1"])];
    let new = vec![circuit("X", "Site_A", 10, 50, &["100.64.0.7"])];
    let mut structure = build_structure(&old, false);
    let class_id = structure.index().circuit_class["X"];

    let config = test_config();
    let executor = RecordingExecutor::new();
    let summary = Reconciler::new(&config, &executor)
        .apply(&mut structure, &diff_snapshots(&old, &new))
        .await
        .unwrap();
    assert_eq!(summary.rewired, 1);
    assert!(executor.shell_commands().is_empty());
    let calls = executor.calls();
    assert_eq!(
        calls[0],
        ExecutorCall::XdpDel {
            ip: "100.64.0.1".into()
        }
    );
    assert_eq!(
        calls[1],
        ExecutorCall::XdpAdd {
            ip: "100.64.0.7".into(),
            cpu: 0,
            class_id,
        }
    );
    assert_eq!(
        structure.circuits()[0].devices[0].ipv4s,
        vec!["100.64.0.7".to_string()]
    );
}

#[tokio::test]
async fn added_unparented_circuits_round_robin_generated_parents() {
    let old: Vec<Circuit> = Vec::new();
    let new = vec![
        circuit("A1", "none", 10, 50, &["100.64.0.1"]),
        circuit("A2", "none", 10, 50, &["100.64.0.2"]),
        circuit("A3", "none", 10, 50, &["100.64.0.3"]),
    ];
    let mut structure = build_structure(&old, true);
    assert_eq!(structure.generated_parents.len(), 2);

    let config = test_config();
    let executor = RecordingExecutor::new();
    let summary = Reconciler::new(&config, &executor)
        .apply(&mut structure, &diff_snapshots(&old, &new))
        .await
        .unwrap();
    assert_eq!(summary.added, 3);

    let index = structure.index();
    assert_eq!(index.circuit_parent["A1"], "Generated_PN_1");
    assert_eq!(index.circuit_parent["A2"], "Generated_PN_2");
    assert_eq!(index.circuit_parent["A3"], "Generated_PN_1");
    // Minors advanced on the owning queues
    assert_eq!(structure.next_minor_by_queue[&1], 6); // node used 3, adds used 4 and 5
    assert_eq!(structure.next_minor_by_queue[&2], 5);
}

#[tokio::test]
async fn add_emits_class_qdisc_and_xdp_in_order() {
    let old: Vec<Circuit> = Vec::new();
    let new = vec![circuit("A1", "Site_B", 10, 50, &["100.64.0.1"])];
    let mut structure = build_structure(&old, false);

    let config = test_config();
    let executor = RecordingExecutor::new();
    Reconciler::new(&config, &executor)
        .apply(&mut structure, &diff_snapshots(&old, &new))
        .await
        .unwrap();

    let commands = executor.shell_commands();
    assert_eq!(commands.len(), 4);
    assert!(commands[0].contains("tc class add dev eth1"));
    assert!(commands[0].contains("rate 10Mbit ceil 50Mbit"));
    assert!(commands[1].starts_with("tc qdisc add dev eth1"));
    assert!(commands[1].ends_with("cake diffserv4"));
    assert!(commands[2].contains("tc class add dev eth2"));
    assert!(commands[3].starts_with("tc qdisc add dev eth2"));
    assert!(
        executor
            .calls()
            .iter()
            .any(|c| matches!(c, ExecutorCall::XdpAdd { .. })),
        "added circuit gets XDP entries"
    );
}

/// Partial reload followed by a full compile of the new snapshot agree on
/// circuit placement and bandwidth
#[tokio::test]
async fn partial_reload_matches_full_compile_semantics() {
    let old = vec![
        circuit("C1", "Site_A", 10, 50, &["100.64.0.1"]),
        circuit("C2", "Site_A", 10, 50, &["100.64.0.2"]),
    ];
    let new = vec![
        circuit("C1", "Site_A", 20, 80, &["100.64.0.1"]),
        circuit("C3", "Site_B", 10, 50, &["100.64.0.3"]),
    ];
    let mut structure = build_structure(&old, false);
    let config = test_config();
    let executor = RecordingExecutor::new();
    Reconciler::new(&config, &executor)
        .apply(&mut structure, &diff_snapshots(&old, &new))
        .await
        .unwrap();

    let full = build_structure(&new, false);
    let mut after_partial: Vec<(String, String, u64, u64)> = structure
        .circuits()
        .iter()
        .map(|c| {
            (
                c.circuit_id.clone(),
                c.parent_node.clone(),
                c.min_download,
                c.max_download,
            )
        })
        .collect();
    let mut after_full: Vec<(String, String, u64, u64)> = full
        .circuits()
        .iter()
        .map(|c| {
            (
                c.circuit_id.clone(),
                c.parent_node.clone(),
                c.min_download,
                c.max_download,
            )
        })
        .collect();
    after_partial.sort();
    after_full.sort();
    assert_eq!(after_partial, after_full);
}

#[tokio::test]
async fn missing_compiled_circuit_is_not_found() {
    let old = vec![circuit("GHOST", "Site_A", 10, 50, &["100.64.0.1"])];
    let new: Vec<Circuit> = Vec::new();
    // Structure compiled WITHOUT the ghost circuit
    let mut structure = build_structure(&new, false);

    let config = test_config();
    let executor = RecordingExecutor::new();
    let result = Reconciler::new(&config, &executor)
        .apply(&mut structure, &diff_snapshots(&old, &new))
        .await;
    match result {
        Err(Error::NotFound(msg)) => assert!(msg.contains("GHOST")),
        other => panic!("expected NotFound, got {other:?}"),
    }
}
