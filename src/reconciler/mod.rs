//! Incremental reconciliation: diff two subscriber snapshots and mutate the
//! live queue tree without tearing down unchanged circuits.
//!
//! The diff classifies every circuit id found in either snapshot as
//! unchanged, bandwidth-changed, devices-changed, parent-moved, added or
//! removed. Mutations are emitted per-command (not batched) in the order
//! {removes, changes, adds}; removes first prevents minor-handle collisions
//! in rare relocations. Per-queue minor counters only ever advance: freed
//! minors are not reused.

#[cfg(test)]
mod tests;

use crate::allocator::ClassIdAllocator;
use crate::config::Config;
use crate::error::{Error, Result};
use crate::executor::Executor;
use crate::topology::{Circuit, QueuingStructure, ShapedCircuit, StructureIndex};
use crate::types::TcHandle;
use std::collections::HashMap;
use tracing::{info, warn};

/// Classified changes between the last-loaded and the new snapshot
#[derive(Clone, Debug, Default)]
pub struct SnapshotDiff {
    /// Present before, absent now
    pub removed: Vec<Circuit>,
    /// Same parent, bandwidth changed: (old, new)
    pub resized: Vec<(Circuit, Circuit)>,
    /// Parent changed: (old, new)
    pub relocated: Vec<(Circuit, Circuit)>,
    /// Same parent and bandwidth, device set changed: (old, new)
    pub rewired: Vec<(Circuit, Circuit)>,
    /// Absent before, present now
    pub added: Vec<Circuit>,
    /// No semantic change
    pub unchanged: usize,
}

impl SnapshotDiff {
    /// Whether any mutation is required at all
    pub fn is_empty(&self) -> bool {
        self.removed.is_empty()
            && self.resized.is_empty()
            && self.relocated.is_empty()
            && self.rewired.is_empty()
            && self.added.is_empty()
    }
}

/// Diff the previous snapshot against the new one.
///
/// A circuit whose bandwidth and devices both changed lands in `resized`
/// with its device change handled by the rewire step of the apply phase, so
/// the classid is kept in every same-parent case.
pub fn diff_snapshots(old: &[Circuit], new: &[Circuit]) -> SnapshotDiff {
    let new_by_id: HashMap<&str, &Circuit> =
        new.iter().map(|c| (c.circuit_id.as_str(), c)).collect();
    let old_by_id: HashMap<&str, &Circuit> =
        old.iter().map(|c| (c.circuit_id.as_str(), c)).collect();

    let mut diff = SnapshotDiff::default();
    for old_circuit in old {
        match new_by_id.get(old_circuit.circuit_id.as_str()) {
            None => diff.removed.push(old_circuit.clone()),
            Some(new_circuit) => {
                let pair = (old_circuit.clone(), (*new_circuit).clone());
                if new_circuit.parent_node != old_circuit.parent_node {
                    diff.relocated.push(pair);
                } else if new_circuit.bandwidth_differs(old_circuit) {
                    diff.resized.push(pair);
                } else if new_circuit.devices != old_circuit.devices {
                    diff.rewired.push(pair);
                } else {
                    diff.unchanged += 1;
                }
            }
        }
    }
    for new_circuit in new {
        if !old_by_id.contains_key(new_circuit.circuit_id.as_str()) {
            diff.added.push(new_circuit.clone());
        }
    }
    diff
}

/// Counts of applied mutations, for logging and assertions
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ReconcileSummary {
    /// Circuits removed
    pub removed: usize,
    /// Circuits resized in place
    pub resized: usize,
    /// Circuits moved to a different parent
    pub relocated: usize,
    /// Circuits whose XDP entries were replaced
    pub rewired: usize,
    /// Circuits added
    pub added: usize,
}

/// Applies a [`SnapshotDiff`] to the live tree through the executor
pub struct Reconciler<'a> {
    config: &'a Config,
    executor: &'a dyn Executor,
}

impl<'a> Reconciler<'a> {
    /// Wire a reconciler against an executor
    pub fn new(config: &'a Config, executor: &'a dyn Executor) -> Self {
        Self { config, executor }
    }

    /// Emit the minimal mutation set and re-sync the in-memory structure.
    ///
    /// The caller is responsible for re-persisting the structure afterwards.
    pub async fn apply(
        &self,
        structure: &mut QueuingStructure,
        diff: &SnapshotDiff,
    ) -> Result<ReconcileSummary> {
        let mut summary = ReconcileSummary::default();
        let index = structure.index();
        let mut allocator =
            ClassIdAllocator::from_counters(structure.next_minor_by_queue.clone());

        // Removes first
        for circuit in &diff.removed {
            self.remove_circuit(circuit, &index).await?;
            structure.remove_circuit(&circuit.circuit_id);
            summary.removed += 1;
        }

        // In-place changes
        for (old, new) in &diff.resized {
            let updated = self.resize_circuit(old, new, &index).await?;
            if new.devices != old.devices {
                self.replace_xdp_entries(old, new, updated.class_id, &index)
                    .await?;
            }
            structure.update_circuit(&updated);
            summary.resized += 1;
        }
        for (old, new) in &diff.rewired {
            let class_id = index
                .circuit_class
                .get(&old.circuit_id)
                .copied()
                .ok_or_else(|| circuit_not_compiled(&old.circuit_id))?;
            self.replace_xdp_entries(old, new, class_id, &index).await?;
            let parent = index
                .circuit_parent
                .get(&old.circuit_id)
                .cloned()
                .ok_or_else(|| circuit_not_compiled(&old.circuit_id))?;
            structure.update_circuit(&shaped_from(new, &parent, class_id));
            summary.rewired += 1;
        }
        for (old, new) in &diff.relocated {
            let shaped = self
                .relocate_circuit(old, new, structure, &index, &mut allocator)
                .await?;
            structure.remove_circuit(&old.circuit_id);
            let parent = shaped.parent_node.clone();
            structure.add_circuit(&parent, shaped)?;
            summary.relocated += 1;
        }

        // Adds last
        let mut generated_rr = 0usize;
        for circuit in &diff.added {
            let shaped = self
                .add_circuit(circuit, structure, &mut allocator, &mut generated_rr)
                .await?;
            let parent = shaped.parent_node.clone();
            structure.add_circuit(&parent, shaped)?;
            summary.added += 1;
        }

        structure.next_minor_by_queue = allocator.into_counters();
        info!(
            removed = summary.removed,
            resized = summary.resized,
            relocated = summary.relocated,
            rewired = summary.rewired,
            added = summary.added,
            unchanged = diff.unchanged,
            "partial reload applied"
        );
        Ok(summary)
    }

    /// Run a single tc command; a kernel sentinel in per-command mode is
    /// fatal for the reload
    async fn tc_fatal(&self, command: String) -> Result<()> {
        let output = self.executor.run_shell(&command).await?;
        if let Some(line) = output.kernel_error() {
            return Err(Error::KernelRejected {
                command,
                line: line.to_string(),
            });
        }
        Ok(())
    }

    async fn remove_xdp(&self, circuit: &Circuit) {
        for ip in circuit.all_ips() {
            if let Err(e) = self.executor.xdp_del_entry(ip).await {
                warn!(ip, error = %e, "failed to remove XDP entry");
            }
        }
    }

    async fn add_xdp(&self, circuit: &Circuit, cpu: u16, class_id: TcHandle) {
        for ip in circuit.all_ips() {
            if let Err(e) = self.executor.xdp_add_entry(ip, cpu, class_id).await {
                warn!(ip, error = %e, "failed to add XDP entry");
            }
        }
    }

    async fn remove_circuit(&self, circuit: &Circuit, index: &StructureIndex) -> Result<()> {
        let class_id = index
            .circuit_class
            .get(&circuit.circuit_id)
            .copied()
            .ok_or_else(|| circuit_not_compiled(&circuit.circuit_id))?;
        self.remove_xdp(circuit).await;
        for interface in [&self.config.interface_a, &self.config.interface_b] {
            self.tc_fatal(format!(
                "tc class del dev {interface} classid {}",
                class_id.class_string()
            ))
            .await?;
        }
        Ok(())
    }

    /// `tc class change` on both interfaces, keeping the classid
    async fn resize_circuit(
        &self,
        old: &Circuit,
        new: &Circuit,
        index: &StructureIndex,
    ) -> Result<ShapedCircuit> {
        let class_id = index
            .circuit_class
            .get(&old.circuit_id)
            .copied()
            .ok_or_else(|| circuit_not_compiled(&old.circuit_id))?;
        let parent_name = index
            .circuit_parent
            .get(&old.circuit_id)
            .cloned()
            .ok_or_else(|| circuit_not_compiled(&old.circuit_id))?;
        let parent_class = index
            .nodes
            .get(&parent_name)
            .map(|n| n.class_id.class_string())
            .ok_or_else(|| Error::NotFound(format!("node '{parent_name}' not compiled")))?;

        for (interface, rate, ceil) in [
            (
                &self.config.interface_a,
                new.min_download,
                new.max_download,
            ),
            (&self.config.interface_b, new.min_upload, new.max_upload),
        ] {
            self.tc_fatal(format!(
                "tc class change dev {interface} parent {parent_class} classid {} htb rate {rate}Mbit ceil {ceil}Mbit",
                class_id.minor_string()
            ))
            .await?;
        }
        Ok(shaped_from(new, &parent_name, class_id))
    }

    async fn replace_xdp_entries(
        &self,
        old: &Circuit,
        new: &Circuit,
        class_id: TcHandle,
        index: &StructureIndex,
    ) -> Result<()> {
        let parent_name = index
            .circuit_parent
            .get(&old.circuit_id)
            .cloned()
            .ok_or_else(|| circuit_not_compiled(&old.circuit_id))?;
        let cpu = index
            .nodes
            .get(&parent_name)
            .map(|n| n.cpu_num)
            .ok_or_else(|| Error::NotFound(format!("node '{parent_name}' not compiled")))?;
        self.remove_xdp(old).await;
        self.add_xdp(new, cpu, class_id).await;
        Ok(())
    }

    /// Delete under the old parent, recreate under the new one with a fresh
    /// minor on the new parent's CPU, and re-point the XDP entries
    async fn relocate_circuit(
        &self,
        old: &Circuit,
        new: &Circuit,
        structure: &QueuingStructure,
        index: &StructureIndex,
        allocator: &mut ClassIdAllocator,
    ) -> Result<ShapedCircuit> {
        let old_class = index
            .circuit_class
            .get(&old.circuit_id)
            .copied()
            .ok_or_else(|| circuit_not_compiled(&old.circuit_id))?;
        self.remove_xdp(old).await;
        for interface in [&self.config.interface_a, &self.config.interface_b] {
            self.tc_fatal(format!(
                "tc class del dev {interface} classid {}",
                old_class.class_string()
            ))
            .await?;
        }

        let parent_name = if new.is_unparented() {
            // Fall back to the first generated parent; a bare relocation to
            // "none" is rare and any generated parent is a valid home
            structure
                .generated_parents
                .first()
                .cloned()
                .ok_or_else(|| {
                    Error::NotFound("no generated parents available for placement".to_string())
                })?
        } else {
            new.parent_node.clone()
        };
        self.create_circuit(new, &parent_name, index, allocator).await
    }

    /// Choose a parent, allocate a minor and create the leaf on both
    /// interfaces
    async fn add_circuit(
        &self,
        circuit: &Circuit,
        structure: &QueuingStructure,
        allocator: &mut ClassIdAllocator,
        generated_rr: &mut usize,
    ) -> Result<ShapedCircuit> {
        let parent_name = if circuit.is_unparented() {
            let generated = &structure.generated_parents;
            if generated.is_empty() {
                return Err(Error::NotFound(
                    "no generated parents available for placement".to_string(),
                ));
            }
            let name = generated[*generated_rr % generated.len()].clone();
            *generated_rr += 1;
            name
        } else {
            circuit.parent_node.clone()
        };
        let index = structure.index();
        self.create_circuit(circuit, &parent_name, &index, allocator)
            .await
    }

    async fn create_circuit(
        &self,
        circuit: &Circuit,
        parent_name: &str,
        index: &StructureIndex,
        allocator: &mut ClassIdAllocator,
    ) -> Result<ShapedCircuit> {
        let node = index
            .nodes
            .get(parent_name)
            .ok_or_else(|| Error::NotFound(format!("node '{parent_name}' not compiled")))?;
        let queue = node.cpu_num + 1;
        let class_id = allocator.allocate(queue)?;
        let parent_class = node.class_id.class_string();

        for (interface, rate, ceil) in [
            (
                &self.config.interface_a,
                circuit.min_download,
                circuit.max_download,
            ),
            (
                &self.config.interface_b,
                circuit.min_upload,
                circuit.max_upload,
            ),
        ] {
            self.tc_fatal(format!(
                "tc class add dev {interface} parent {parent_class} classid {} htb rate {rate}Mbit ceil {ceil}Mbit",
                class_id.minor_string()
            ))
            .await?;
            self.tc_fatal(format!(
                "tc qdisc add dev {interface} parent {} {}",
                class_id.class_string(),
                self.config.sqm
            ))
            .await?;
        }
        self.add_xdp(circuit, node.cpu_num, class_id).await;
        Ok(shaped_from(circuit, parent_name, class_id))
    }
}

fn shaped_from(circuit: &Circuit, parent_name: &str, class_id: TcHandle) -> ShapedCircuit {
    ShapedCircuit {
        circuit_id: circuit.circuit_id.clone(),
        circuit_name: circuit.circuit_name.clone(),
        parent_node: parent_name.to_string(),
        devices: circuit.devices.clone(),
        min_download: circuit.min_download,
        min_upload: circuit.min_upload,
        max_download: circuit.max_download,
        max_upload: circuit.max_upload,
        class_id,
        comment: circuit.comment.clone(),
    }
}

fn circuit_not_compiled(circuit_id: &str) -> Error {
    Error::NotFound(format!(
        "circuit '{circuit_id}' is not in the compiled structure"
    ))
}
