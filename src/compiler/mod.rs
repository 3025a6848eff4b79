//! Queue-tree compilation: turns the planned topology and circuit list into
//! the ordered traffic-control command batch and the XDP classifier entries.
//!
//! For each NIC interface (A = egress toward subscribers carrying download
//! shaping, B = egress toward upstream carrying upload shaping) the plan
//! replaces the root with an MQ qdisc, hangs one HTB per queue beneath it,
//! then walks the topology depth-first emitting an inner class per node and
//! a leaf class plus SQM qdisc per circuit. Top-level nodes round-robin
//! across queues in declaration order, one subtree per queue.
//!
//! The output is deterministic: the same inputs produce a byte-identical
//! command list, which is what makes a repeated full reload idempotent
//! after the clear step.


use crate::allocator::ClassIdAllocator;
use crate::config::Config;
use crate::error::Result;
use crate::topology::{
    Circuit, NetworkNode, QueuingStructure, ShapedCircuit, TopologyNode,
};
use crate::types::TcHandle;
use std::collections::HashSet;
use tracing::{debug, warn};

/// Reserved MQ root handle
pub const MQ_ROOT_HANDLE: &str = "7FFF:";

/// One IP -> (CPU, classid) mapping for the XDP classifier
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct XdpEntry {
    /// Host address or CIDR, exactly as given in the subscriber table
    pub ip: String,
    /// Zero-based CPU the packet is steered to
    pub cpu: u16,
    /// HTB leaf class the packet is placed into
    pub class_id: TcHandle,
}

/// Everything a full reload needs to apply and persist
#[derive(Clone, Debug)]
pub struct CompiledPlan {
    /// The compiled structure to persist for later incremental reloads
    pub structure: QueuingStructure,
    /// Ordered tc command lines (no `tc` prefix; fed to `tc -b`)
    pub tc_commands: Vec<String>,
    /// XDP classifier entries, one per device IP
    pub xdp_entries: Vec<XdpEntry>,
    /// Devices whose circuit referenced a parent node that does not exist
    pub unshaped_devices: Vec<(String, String)>,
}

struct CompileCtx<'a> {
    config: &'a Config,
    allocator: ClassIdAllocator,
    tc: Vec<String>,
    xdp: Vec<XdpEntry>,
    shaped_circuit_ids: HashSet<String>,
}

/// Compile the planned topology and circuits for `queues` CPU queues.
///
/// Expects the planner to have run: generated parents appended, unparented
/// circuits placed, caps clamped and minimums accumulated.
pub fn compile(
    topology: &[TopologyNode],
    circuits: &[Circuit],
    queues: usize,
    generated_parents: &[String],
    config: &Config,
) -> Result<CompiledPlan> {
    let mut ctx = CompileCtx {
        config,
        allocator: ClassIdAllocator::new(queues),
        tc: Vec::new(),
        xdp: Vec::new(),
        shaped_circuit_ids: HashSet::new(),
    };

    mq_setup(&mut ctx.tc, config, queues);

    let mut network = Vec::with_capacity(topology.len());
    let mut queue: u16 = 1;
    for top in topology {
        let parent_class = TcHandle::new(queue, 0).major_string();
        network.push(compile_node(top, queue, &parent_class, circuits, &mut ctx)?);
        // Each top-level node owns one queue; wrap when there are more
        // top-level nodes than queues
        queue = if queue as usize >= queues { 1 } else { queue + 1 };
    }

    let mut unshaped_devices = Vec::new();
    for circuit in circuits {
        if !ctx.shaped_circuit_ids.contains(&circuit.circuit_id) {
            for device in &circuit.devices {
                unshaped_devices.push((device.device_id.clone(), device.device_name.clone()));
            }
        }
    }
    if !unshaped_devices.is_empty() {
        warn!(
            count = unshaped_devices.len(),
            "some devices were not shaped; check that their circuits list a \
             valid parent node"
        );
    }

    Ok(CompiledPlan {
        structure: QueuingStructure {
            network,
            queues_available: queues,
            next_minor_by_queue: ctx.allocator.into_counters(),
            generated_parents: generated_parents.to_vec(),
        },
        tc_commands: ctx.tc,
        xdp_entries: ctx.xdp,
        unshaped_devices,
    })
}

/// MQ root plus per-queue HTB scaffolding on both interfaces.
///
/// Each queue gets a root class (minor 1) at the upstream capacity and a
/// default catchall class (minor 2, prio 5) that traffic only reaches when
/// the classifier did not map its IP. The catchall guarantees a quarter of
/// capacity-minus-one and may burst up to capacity-minus-one.
fn mq_setup(tc: &mut Vec<String>, config: &Config, queues: usize) {
    for (interface, capacity) in [
        (&config.interface_a, config.upstream_mbps(true)),
        (&config.interface_b, config.upstream_mbps(false)),
    ] {
        tc.push(format!(
            "qdisc replace dev {interface} root handle {MQ_ROOT_HANDLE} mq"
        ));
        for q in 1..=queues as u16 {
            let default_rate = ((capacity - 1) as f64 / 4.0).round() as u64;
            tc.push(format!(
                "qdisc add dev {interface} parent {MQ_ROOT_HANDLE}0x{q:x} handle 0x{q:x}: htb default 2"
            ));
            tc.push(format!(
                "class add dev {interface} parent 0x{q:x}: classid 0x{q:x}:1 htb rate {capacity}mbit ceil {capacity}mbit"
            ));
            tc.push(format!(
                "qdisc add dev {interface} parent 0x{q:x}:1 {}",
                config.sqm
            ));
            tc.push(format!(
                "class add dev {interface} parent 0x{q:x}:1 classid 0x{q:x}:2 htb rate {default_rate}mbit ceil {}mbit prio 5",
                capacity - 1
            ));
            tc.push(format!(
                "qdisc add dev {interface} parent 0x{q:x}:2 {}",
                config.sqm
            ));
        }
    }
}

fn compile_node(
    node: &TopologyNode,
    queue: u16,
    parent_class: &str,
    circuits: &[Circuit],
    ctx: &mut CompileCtx<'_>,
) -> Result<NetworkNode> {
    let class_id = ctx.allocator.allocate(queue)?;
    debug!(node = %node.name, class = %class_id, "compiling node");

    // HTB rates respond better to a generous rate with the cap enforced by
    // ceil, so the rate is pinned at 95% of the cap rather than the
    // accumulated minimums
    let rate_download = (node.download_mbps as f64 * 0.95).round() as u64;
    let rate_upload = (node.upload_mbps as f64 * 0.95).round() as u64;
    ctx.tc.push(format!(
        "class add dev {} parent {parent_class} classid {} htb rate {rate_download}mbit ceil {}mbit prio 3",
        ctx.config.interface_a,
        class_id.minor_string(),
        node.download_mbps
    ));
    ctx.tc.push(format!(
        "class add dev {} parent {parent_class} classid {} htb rate {rate_upload}mbit ceil {}mbit prio 3",
        ctx.config.interface_b,
        class_id.minor_string(),
        node.upload_mbps
    ));

    let cpu_num = queue - 1;
    let mut shaped_circuits = Vec::new();
    for circuit in circuits.iter().filter(|c| c.parent_node == node.name) {
        let shaped = compile_circuit(circuit, node, class_id, queue, cpu_num, ctx)?;
        shaped_circuits.push(shaped);
    }

    let mut children = Vec::with_capacity(node.children.len());
    let node_class_string = class_id.class_string();
    for child in &node.children {
        children.push(compile_node(child, queue, &node_class_string, circuits, ctx)?);
    }

    Ok(NetworkNode {
        name: node.name.clone(),
        kind: node.kind,
        download_mbps: node.download_mbps,
        upload_mbps: node.upload_mbps,
        download_mbps_min: node.download_mbps_min,
        upload_mbps_min: node.upload_mbps_min,
        class_id,
        parent_class_id: parent_class.to_string(),
        cpu_num,
        circuits: shaped_circuits,
        children,
    })
}

fn compile_circuit(
    circuit: &Circuit,
    node: &TopologyNode,
    node_class: TcHandle,
    queue: u16,
    cpu_num: u16,
    ctx: &mut CompileCtx<'_>,
) -> Result<ShapedCircuit> {
    if circuit.max_download > node.download_mbps {
        warn!(
            circuit = %circuit.circuit_id,
            "downloadMax of circuit exceeds its parent node's cap; reducing \
             to the parent's cap"
        );
    }
    if circuit.max_upload > node.upload_mbps {
        warn!(
            circuit = %circuit.circuit_id,
            "uploadMax of circuit exceeds its parent node's cap; reducing to \
             the parent's cap"
        );
    }
    let max_download = circuit.max_download.min(node.download_mbps);
    let max_upload = circuit.max_upload.min(node.upload_mbps);
    let min_download = circuit.min_download.min(max_download);
    let min_upload = circuit.min_upload.min(max_upload);

    let class_id = ctx.allocator.allocate(queue)?;
    let parent = node_class.class_string();

    ctx.tc.push(format!(
        "class add dev {} parent {parent} classid {} htb rate {min_download}mbit ceil {max_download}mbit prio 3",
        ctx.config.interface_a,
        class_id.minor_string()
    ));
    ctx.tc.push(format!(
        "qdisc add dev {} parent {} {}",
        ctx.config.interface_a,
        class_id.class_string(),
        ctx.config.sqm
    ));
    ctx.tc.push(format!(
        "class add dev {} parent {parent} classid {} htb rate {min_upload}mbit ceil {max_upload}mbit prio 3",
        ctx.config.interface_b,
        class_id.minor_string()
    ));
    ctx.tc.push(format!(
        "qdisc add dev {} parent {} {}",
        ctx.config.interface_b,
        class_id.class_string(),
        ctx.config.sqm
    ));

    for device in &circuit.devices {
        for ip in device.all_ips() {
            ctx.xdp.push(XdpEntry {
                ip: ip.to_string(),
                cpu: cpu_num,
                class_id,
            });
        }
    }

    ctx.shaped_circuit_ids.insert(circuit.circuit_id.clone());
    Ok(ShapedCircuit {
        circuit_id: circuit.circuit_id.clone(),
        circuit_name: circuit.circuit_name.clone(),
        parent_node: circuit.parent_node.clone(),
        devices: circuit.devices.clone(),
        min_download,
        min_upload,
        max_download,
        max_upload,
        class_id,
        comment: circuit.comment.clone(),
    })
}
