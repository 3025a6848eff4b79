//! Capacity planning: queue/CPU discovery, synthetic parent generation,
//! placement of unparented circuits across CPUs, and the downward/upward
//! bandwidth passes that precede queue-tree compilation.

use crate::config::Config;
use crate::error::{Error, Result};
use crate::topology::{Circuit, TopologyNode};
use tracing::{debug, info, warn};

/// Queue/CPU count used for simulated runs where the NIC is not inspected
const SIMULATED_QUEUE_COUNT: usize = 16;

/// Determine how many CPU queues the tree is built across.
///
/// `queuesAvailable = min(NIC tx-queue count on interface A, CPU cores)`
/// unless the config overrides it. With shell execution disabled the NIC is
/// not inspected and a fixed count of 16 is assumed. Fewer than 2 queues is
/// fatal: the whole design needs one HTB major per queue with traffic
/// spread across at least two CPUs.
pub fn discover_queues(config: &Config) -> Result<usize> {
    if config.queues_available_override != 0 {
        let queues = config.queues_available_override;
        info!(queues, "NIC queues (override)");
        if queues < 2 {
            return Err(Error::CapacityImpossible { queues });
        }
        return Ok(queues);
    }
    if !config.enable_actual_shell_commands {
        info!(
            queues = SIMULATED_QUEUE_COUNT,
            "shell commands disabled; assuming fixed queue/core count"
        );
        return Ok(SIMULATED_QUEUE_COUNT);
    }

    let queues_dir = format!("/sys/class/net/{}/queues", config.interface_a);
    let mut nic_queues = 0usize;
    for entry in std::fs::read_dir(&queues_dir)? {
        let entry = entry?;
        if entry.file_name().to_string_lossy().starts_with("tx-") {
            nic_queues += 1;
        }
    }
    let cpu_cores = std::thread::available_parallelism()
        .map(std::num::NonZero::get)
        .unwrap_or(1);
    info!(nic_queues, cpu_cores, "discovered queue capacity");

    let queues = nic_queues.min(cpu_cores);
    if queues < 2 {
        return Err(Error::CapacityImpossible { queues });
    }
    Ok(queues)
}

/// Synthesize `Generated_PN_<i>` parents so every CPU queue has a top-level
/// subtree to own.
///
/// When the document already declares at least `queues` top-level nodes,
/// nothing is generated. Returns the generated names in order; they are
/// persisted for the incremental path's round-robin placement.
pub fn generate_parents(
    topology: &mut Vec<TopologyNode>,
    queues: usize,
    config: &Config,
) -> Vec<String> {
    let existing = topology.len();
    let mut generated = Vec::new();
    for i in 0..queues.saturating_sub(existing) {
        let name = format!("Generated_PN_{}", i + 1);
        topology.push(TopologyNode::new(
            name.clone(),
            config.generated_pn_download_mbps,
            config.generated_pn_upload_mbps,
        ));
        generated.push(name);
    }
    info!(
        existing,
        generated = generated.len(),
        "generated parent nodes created"
    );
    generated
}

/// Assign every unparented circuit to a generated parent.
///
/// Bin-packing (first-fit-decreasing by `max_down + max_up`, into the bin
/// with the lowest running weight) balances CPU load and is preferred below
/// roughly 25k subscribers; round-robin is the fallback. With no generated
/// parents available, unparented circuits are left as-is and will be
/// reported as unshaped after compilation.
pub fn place_unparented(circuits: &mut [Circuit], generated: &[String], use_bin_packing: bool) {
    if generated.is_empty() {
        return;
    }

    if use_bin_packing {
        info!("bin-packing unparented circuits across CPU queues");
        let mut order: Vec<usize> = circuits
            .iter()
            .enumerate()
            .filter(|(_, c)| c.is_unparented())
            .map(|(i, _)| i)
            .collect();
        order.sort_by(|&a, &b| {
            circuits[b]
                .placement_weight()
                .cmp(&circuits[a].placement_weight())
                .then(a.cmp(&b))
        });

        let mut bin_weight = vec![0u64; generated.len()];
        for idx in order {
            let lightest = bin_weight
                .iter()
                .enumerate()
                .min_by_key(|&(_, w)| *w)
                .map(|(i, _)| i)
                .unwrap_or(0);
            bin_weight[lightest] += circuits[idx].placement_weight();
            circuits[idx].parent_node = generated[lightest].clone();
        }
        for (bin, weight) in bin_weight.iter().enumerate() {
            debug!(parent = %generated[bin], weight, "bin weight after packing");
        }
    } else {
        let mut next = 0usize;
        for circuit in circuits.iter_mut().filter(|c| c.is_unparented()) {
            circuit.parent_node = generated[next].clone();
            next = (next + 1) % generated.len();
        }
    }
}

/// Downward pass: clamp every node's caps to its parent's caps.
///
/// The root's effective cap is the configured upstream capacity in each
/// direction. Caps win ties with accumulated minimums.
pub fn clamp_caps(nodes: &mut [TopologyNode], parent_download: u64, parent_upload: u64) {
    for node in nodes {
        node.download_mbps = node.download_mbps.min(parent_download);
        node.upload_mbps = node.upload_mbps.min(parent_upload);
        clamp_caps(&mut node.children, node.download_mbps, node.upload_mbps);
    }
}

/// Upward pass: record on each node the sum of the guaranteed minimums of
/// every circuit at or below it.
///
/// Returns the forest-wide totals. A node whose accumulated minimums exceed
/// its cap is possible and only warned about; individual circuit ceilings
/// are clamped later during compilation.
pub fn accumulate_minimums(nodes: &mut [TopologyNode], circuits: &[Circuit]) -> (u64, u64) {
    let mut total_download = 0;
    let mut total_upload = 0;
    for node in nodes {
        let mut min_download: u64 = circuits
            .iter()
            .filter(|c| c.parent_node == node.name)
            .map(|c| c.min_download)
            .sum();
        let mut min_upload: u64 = circuits
            .iter()
            .filter(|c| c.parent_node == node.name)
            .map(|c| c.min_upload)
            .sum();
        let (child_download, child_upload) = accumulate_minimums(&mut node.children, circuits);
        min_download += child_download;
        min_upload += child_upload;
        node.download_mbps_min = min_download;
        node.upload_mbps_min = min_upload;
        if min_download > node.download_mbps || min_upload > node.upload_mbps {
            warn!(
                node = %node.name,
                min_download,
                min_upload,
                cap_download = node.download_mbps,
                cap_upload = node.upload_mbps,
                "sum of guaranteed minimums under node exceeds its capacity cap"
            );
        }
        total_download += min_download;
        total_upload += min_upload;
    }
    (total_download, total_upload)
}
