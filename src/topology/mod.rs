//! Network topology model: the operator's node tree, subscriber circuits,
//! and the compiled queuing structure that survives across reloads.
//!
//! Two inputs feed this module: a nested topology document (sites, access
//! points, client sites with capacity caps) and a flat subscriber table
//! (circuits and their devices). The capacity planner and queue-tree
//! compiler turn them into a [`QueuingStructure`], which is persisted and
//! later consumed by the incremental reconciler.

/// Subscriber table (CSV) loading and validation
pub mod subscribers;


use crate::error::{Error, Result};
use crate::types::TcHandle;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

/// What a topology node represents in the operator's network
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum NodeKind {
    /// The synthetic root of the whole tree
    Root,
    /// A physical site (tower, POP)
    #[default]
    Site,
    /// An access point
    Ap,
    /// A client site
    Client,
    /// A client site that itself has child nodes
    ClientWithChildren,
    /// An endpoint device
    Device,
}

/// A node of the input topology document, before planning.
///
/// The planner mutates these in place: generated parents are appended at the
/// top level, caps are clamped downward and child minimums are accumulated
/// upward.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TopologyNode {
    /// Stable display name (the key in the topology document)
    pub name: String,
    /// Node kind (defaults to site when the document does not say)
    pub kind: NodeKind,
    /// Download capacity cap in Mbps
    pub download_mbps: u64,
    /// Upload capacity cap in Mbps
    pub upload_mbps: u64,
    /// Sum of child circuit/node download minimums (filled by the planner)
    pub download_mbps_min: u64,
    /// Sum of child circuit/node upload minimums (filled by the planner)
    pub upload_mbps_min: u64,
    /// Child nodes
    pub children: Vec<TopologyNode>,
}

impl TopologyNode {
    /// A fresh node with caps and no children
    pub fn new(name: impl Into<String>, download_mbps: u64, upload_mbps: u64) -> Self {
        Self {
            name: name.into(),
            kind: NodeKind::default(),
            download_mbps,
            upload_mbps,
            download_mbps_min: 0,
            upload_mbps_min: 0,
            children: Vec::new(),
        }
    }
}

/// A subscriber endpoint device, one or more per circuit
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Device {
    /// Stable device identifier
    pub device_id: String,
    /// Display name
    pub device_name: String,
    /// MAC address as provided by the operator (not interpreted)
    pub mac: String,
    /// IPv4 hosts or CIDRs assigned to this device
    pub ipv4s: Vec<String>,
    /// IPv6 hosts or CIDRs assigned to this device
    pub ipv6s: Vec<String>,
    /// Free-form operator comment
    pub comment: String,
}

impl Device {
    /// All IPs of this device, v4 first
    pub fn all_ips(&self) -> impl Iterator<Item = &str> {
        self.ipv4s
            .iter()
            .chain(self.ipv6s.iter())
            .map(String::as_str)
    }
}

/// One subscriber line: one or more devices sharing a shaping envelope.
///
/// Bandwidth numbers carry the configured overhead factor already applied
/// (plan Mbps × overhead, rounded).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Circuit {
    /// Stable unique identifier, required for stateful queue changes
    pub circuit_id: String,
    /// Display name (falls back to the first device name)
    pub circuit_name: String,
    /// Parent node name, or `"none"` before placement
    pub parent_node: String,
    /// Devices under this circuit
    pub devices: Vec<Device>,
    /// Guaranteed download rate in Mbps
    pub min_download: u64,
    /// Guaranteed upload rate in Mbps
    pub min_upload: u64,
    /// Download ceiling in Mbps
    pub max_download: u64,
    /// Upload ceiling in Mbps
    pub max_upload: u64,
    /// Free-form operator comment
    pub comment: String,
}

impl Circuit {
    /// `true` when the circuit has no operator-assigned parent
    pub fn is_unparented(&self) -> bool {
        self.parent_node == "none"
    }

    /// Bin-packing weight: the combined ceilings in both directions
    pub fn placement_weight(&self) -> u64 {
        self.max_download + self.max_upload
    }

    /// Whether any of the four plan numbers differ from `other`'s
    pub fn bandwidth_differs(&self, other: &Circuit) -> bool {
        self.min_download != other.min_download
            || self.min_upload != other.min_upload
            || self.max_download != other.max_download
            || self.max_upload != other.max_upload
    }

    /// All device IPs of this circuit, in device order
    pub fn all_ips(&self) -> impl Iterator<Item = &str> {
        self.devices.iter().flat_map(Device::all_ips)
    }
}

/// A circuit after compilation: caps clamped to the parent and a class
/// handle assigned
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ShapedCircuit {
    /// Stable unique identifier
    pub circuit_id: String,
    /// Display name
    pub circuit_name: String,
    /// The node this circuit hangs under (never `"none"` here)
    pub parent_node: String,
    /// Devices under this circuit
    pub devices: Vec<Device>,
    /// Guaranteed download rate in Mbps (clamped to the ceiling)
    pub min_download: u64,
    /// Guaranteed upload rate in Mbps (clamped to the ceiling)
    pub min_upload: u64,
    /// Download ceiling in Mbps (clamped to the parent cap)
    pub max_download: u64,
    /// Upload ceiling in Mbps (clamped to the parent cap)
    pub max_upload: u64,
    /// HTB leaf class handle on both interfaces
    pub class_id: TcHandle,
    /// Free-form operator comment
    pub comment: String,
}

/// A topology node after compilation, carrying its class handles and the
/// circuits attached to it
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NetworkNode {
    /// Stable display name
    pub name: String,
    /// Node kind
    pub kind: NodeKind,
    /// Download cap in Mbps after downward clamping
    pub download_mbps: u64,
    /// Upload cap in Mbps after downward clamping
    pub upload_mbps: u64,
    /// Accumulated download minimums of everything beneath this node
    pub download_mbps_min: u64,
    /// Accumulated upload minimums of everything beneath this node
    pub upload_mbps_min: u64,
    /// This node's HTB class handle
    pub class_id: TcHandle,
    /// Parent classid string: `0xM:` for top-level nodes, `0xM:0xm` below
    pub parent_class_id: String,
    /// Zero-based CPU this node's subtree is pinned to
    pub cpu_num: u16,
    /// Circuits attached directly to this node
    pub circuits: Vec<ShapedCircuit>,
    /// Child nodes
    pub children: Vec<NetworkNode>,
}

/// The compiled queuing structure, persisted after every reload.
///
/// This is what the incremental reconciler needs to mutate a live tree:
/// the shaped node tree with all class handles, the per-queue next-minor
/// counters, and the generated parent names for round-robin placement of
/// newly added unparented circuits.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct QueuingStructure {
    /// The shaped topology forest
    pub network: Vec<NetworkNode>,
    /// Number of CPU queues the tree was built for
    pub queues_available: usize,
    /// Next free minor handle per queue (1-based queue number)
    pub next_minor_by_queue: BTreeMap<u16, u32>,
    /// Names of the synthesized `Generated_PN_<i>` parents, in order
    pub generated_parents: Vec<String>,
}

/// Lookup data for one node, flattened out of the tree
#[derive(Clone, Debug)]
pub struct NodeRef {
    /// The node's own classid string
    pub class_id: TcHandle,
    /// Parent classid string as used in emitted class commands
    pub parent_class_id: String,
    /// Zero-based CPU number
    pub cpu_num: u16,
}

/// Flattened indexes over a [`QueuingStructure`], for the reconciler's
/// by-name and by-circuit lookups
#[derive(Debug, Default)]
pub struct StructureIndex {
    /// Node name -> handles and CPU
    pub nodes: BTreeMap<String, NodeRef>,
    /// Circuit id -> leaf class handle
    pub circuit_class: BTreeMap<String, TcHandle>,
    /// Circuit id -> owning node name
    pub circuit_parent: BTreeMap<String, String>,
}

impl QueuingStructure {
    /// Build the flattened lookup index
    pub fn index(&self) -> StructureIndex {
        let mut index = StructureIndex::default();
        fn walk(nodes: &[NetworkNode], index: &mut StructureIndex) {
            for node in nodes {
                index.nodes.insert(
                    node.name.clone(),
                    NodeRef {
                        class_id: node.class_id,
                        parent_class_id: node.parent_class_id.clone(),
                        cpu_num: node.cpu_num,
                    },
                );
                for circuit in &node.circuits {
                    index
                        .circuit_class
                        .insert(circuit.circuit_id.clone(), circuit.class_id);
                    index
                        .circuit_parent
                        .insert(circuit.circuit_id.clone(), node.name.clone());
                }
                walk(&node.children, index);
            }
        }
        walk(&self.network, &mut index);
        index
    }

    /// Visit every shaped circuit in the tree
    pub fn circuits(&self) -> Vec<&ShapedCircuit> {
        let mut out = Vec::new();
        fn walk<'a>(nodes: &'a [NetworkNode], out: &mut Vec<&'a ShapedCircuit>) {
            for node in nodes {
                out.extend(node.circuits.iter());
                walk(&node.children, out);
            }
        }
        walk(&self.network, &mut out);
        out
    }

    /// Mutable access to a node by name
    pub fn find_node_mut(&mut self, name: &str) -> Option<&mut NetworkNode> {
        fn walk<'a>(nodes: &'a mut [NetworkNode], name: &str) -> Option<&'a mut NetworkNode> {
            for node in nodes {
                if node.name == name {
                    return Some(node);
                }
                if let Some(found) = walk(&mut node.children, name) {
                    return Some(found);
                }
            }
            None
        }
        walk(&mut self.network, name)
    }

    /// Remove a circuit from whichever node holds it
    pub fn remove_circuit(&mut self, circuit_id: &str) -> bool {
        fn walk(nodes: &mut [NetworkNode], circuit_id: &str) -> bool {
            for node in nodes {
                let before = node.circuits.len();
                node.circuits.retain(|c| c.circuit_id != circuit_id);
                if node.circuits.len() != before {
                    return true;
                }
                if walk(&mut node.children, circuit_id) {
                    return true;
                }
            }
            false
        }
        walk(&mut self.network, circuit_id)
    }

    /// Replace a circuit in place, keyed by its id
    pub fn update_circuit(&mut self, updated: &ShapedCircuit) -> bool {
        fn walk(nodes: &mut [NetworkNode], updated: &ShapedCircuit) -> bool {
            for node in nodes {
                for circuit in &mut node.circuits {
                    if circuit.circuit_id == updated.circuit_id {
                        *circuit = updated.clone();
                        return true;
                    }
                }
                if walk(&mut node.children, updated) {
                    return true;
                }
            }
            false
        }
        walk(&mut self.network, updated)
    }

    /// Append a circuit under the named node
    pub fn add_circuit(&mut self, parent: &str, circuit: ShapedCircuit) -> Result<()> {
        match self.find_node_mut(parent) {
            Some(node) => {
                node.circuits.push(circuit);
                Ok(())
            }
            None => Err(Error::NotFound(format!(
                "parent node '{parent}' is not in the compiled structure"
            ))),
        }
    }
}

/// Load the nested topology document.
///
/// Shape: `{ <name>: { downloadBandwidthMbps, uploadBandwidthMbps,
/// children?: {...} } }`. An empty object is a valid flat network.
/// Declaration order is preserved; it drives the round-robin assignment of
/// top-level nodes to CPU queues.
pub fn load_topology(path: &Path) -> Result<Vec<TopologyNode>> {
    let raw = std::fs::read_to_string(path)?;
    let doc: serde_json::Value = serde_json::from_str(&raw)?;
    parse_topology_value(&doc).map_err(|failures| Error::Validation { failures })
}

fn parse_topology_value(doc: &serde_json::Value) -> std::result::Result<Vec<TopologyNode>, Vec<String>> {
    let Some(map) = doc.as_object() else {
        return Err(vec!["topology document must be a JSON object".to_string()]);
    };
    let mut failures = Vec::new();
    let nodes = parse_topology_level(map, "", &mut failures);
    if failures.is_empty() {
        Ok(nodes)
    } else {
        Err(failures)
    }
}

fn parse_topology_level(
    map: &serde_json::Map<String, serde_json::Value>,
    parent_path: &str,
    failures: &mut Vec<String>,
) -> Vec<TopologyNode> {
    let mut nodes = Vec::new();
    for (name, value) in map {
        let path = if parent_path.is_empty() {
            name.clone()
        } else {
            format!("{parent_path}/{name}")
        };
        let Some(body) = value.as_object() else {
            failures.push(format!("node '{path}' must be an object"));
            continue;
        };
        let mut cap = |key: &str| -> u64 {
            match body.get(key).and_then(serde_json::Value::as_u64) {
                Some(v) if v >= 1 => v,
                _ => {
                    failures.push(format!(
                        "node '{path}' is missing a positive integer '{key}'"
                    ));
                    0
                }
            }
        };
        let download_mbps = cap("downloadBandwidthMbps");
        let upload_mbps = cap("uploadBandwidthMbps");
        let kind = body
            .get("type")
            .cloned()
            .map(serde_json::from_value::<NodeKind>)
            .transpose()
            .unwrap_or_else(|_| {
                failures.push(format!("node '{path}' has an unrecognized 'type'"));
                None
            })
            .unwrap_or_default();
        let children = match body.get("children") {
            Some(serde_json::Value::Object(children)) => {
                parse_topology_level(children, &path, failures)
            }
            Some(_) => {
                failures.push(format!("node '{path}': 'children' must be an object"));
                Vec::new()
            }
            None => Vec::new(),
        };
        nodes.push(TopologyNode {
            name: name.clone(),
            kind,
            download_mbps,
            upload_mbps,
            download_mbps_min: 0,
            upload_mbps_min: 0,
            children,
        });
    }
    nodes
}
