//! Reload orchestration: full reload, update-only reload, validation and
//! teardown.
//!
//! A full reload is the only path that rebuilds the tree from scratch; its
//! order matters: clear prior state, XDP setup, batched TC apply, per-IP
//! XDP entries, then persist. A partial reload leaves the tree standing and
//! routes everything through the incremental reconciler. Both paths are
//! driven by an external scheduler and expected to be serialized by it.

use crate::compiler;
use crate::config::Config;
use crate::error::Result;
use crate::executor::Executor;
use crate::persist::{self, DataFiles};
use crate::planner;
use crate::reconciler::{self, ReconcileSummary, Reconciler};
use crate::stats::{self, TrackedCircuit};
use crate::topology::subscribers;
use crate::topology::{self, Circuit, TopologyNode};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

/// The shaper control plane: owns the config, the data directory and the
/// executor that touches the host
pub struct Shaper {
    config: Config,
    files: DataFiles,
    executor: Arc<dyn Executor>,
}

/// The validated input pair a reload works from
struct ReloadInputs {
    topology_path: PathBuf,
    subscribers_path: PathBuf,
}

impl Shaper {
    /// Validate the config and wire up a shaper
    pub fn new(config: Config, executor: Arc<dyn Executor>) -> Result<Self> {
        config.validate()?;
        std::fs::create_dir_all(&config.data_dir)?;
        let files = DataFiles::new(&config.data_dir);
        Ok(Self {
            config,
            files,
            executor,
        })
    }

    /// The data file locations this shaper reads and writes
    pub fn files(&self) -> &DataFiles {
        &self.files
    }

    /// Input topology document path (`network.json` in the data dir)
    pub fn topology_input(&self) -> PathBuf {
        self.files.dir().join("network.json")
    }

    /// Input subscriber table path (`ShapedDevices.csv` in the data dir)
    pub fn subscribers_input(&self) -> PathBuf {
        self.files.dir().join("ShapedDevices.csv")
    }

    /// Validate both inputs without mutating anything
    pub fn validate_inputs(&self) -> Result<()> {
        topology::load_topology(&self.topology_input())?;
        subscribers::validate_subscriber_table(&self.subscribers_input())?;
        Ok(())
    }

    /// Validate, and on success back the pair up as the last-good config.
    ///
    /// On failure the reload aborts, except on the first run since boot
    /// where the queues are known to be absent: there the last-good pair is
    /// loaded instead so the box comes up shaped.
    fn checked_inputs(&self, allow_fallback: bool) -> Result<ReloadInputs> {
        match self.validate_inputs() {
            Ok(()) => {
                std::fs::copy(self.subscribers_input(), self.files.last_good_subscribers())?;
                std::fs::copy(self.topology_input(), self.files.last_good_topology())?;
                info!("input validation passed; backed up as last good config");
                Ok(ReloadInputs {
                    topology_path: self.topology_input(),
                    subscribers_path: self.subscribers_input(),
                })
            }
            Err(e) if allow_fallback => {
                let topology_path = self.files.last_good_topology();
                let subscribers_path = self.files.last_good_subscribers();
                if !topology_path.exists() || !subscribers_path.exists() {
                    return Err(e);
                }
                warn!(
                    error = %e,
                    "validation failed on first run since boot; loading queues \
                     from last good config"
                );
                Ok(ReloadInputs {
                    topology_path,
                    subscribers_path,
                })
            }
            Err(e) => {
                warn!(
                    "validation failed and queues are already set up; leaving \
                     the running configuration untouched"
                );
                Err(e)
            }
        }
    }

    fn load_inputs(&self, inputs: &ReloadInputs) -> Result<(Vec<TopologyNode>, Vec<Circuit>)> {
        let topology = topology::load_topology(&inputs.topology_path)?;
        let circuits = subscribers::load_subscriber_table(
            &inputs.subscribers_path,
            self.config.overhead_factor(),
        )?;
        Ok((topology, circuits))
    }

    /// Full reload: rebuild and apply the whole queue tree.
    ///
    /// Idempotent once the clear step runs; identical inputs produce a
    /// byte-identical command batch.
    pub async fn full_reload(&self) -> Result<()> {
        info!("full reload starting");
        if !self.config.enable_actual_shell_commands {
            warn!("shell commands are disabled; this is a simulated run");
        }

        let first_run = persist::first_run_since_boot(&self.files);
        let inputs = self.checked_inputs(first_run)?;
        let (mut topology, mut circuits) = self.load_inputs(&inputs)?;

        let queues = planner::discover_queues(&self.config)?;
        let generated = planner::generate_parents(&mut topology, queues, &self.config);
        planner::place_unparented(
            &mut circuits,
            &generated,
            self.config.use_bin_packing_to_balance_cpu,
        );
        planner::clamp_caps(
            &mut topology,
            self.config.upstream_mbps(true),
            self.config.upstream_mbps(false),
        );
        planner::accumulate_minimums(&mut topology, &circuits);

        let plan = compiler::compile(&topology, &circuits, queues, &generated, &self.config)?;
        let batch_file = self.files.tc_batch_file();
        persist::atomic_write(&batch_file, (plan.tc_commands.join("\n") + "\n").as_bytes())?;

        self.clear_prior_settings().await?;
        self.xdp_setup().await?;

        info!(
            commands = plan.tc_commands.len(),
            "executing linux TC class/qdisc commands"
        );
        let batch_output = self.executor.run_shell_batch(&batch_file).await?;
        if let Some(line) = batch_output.kernel_error() {
            warn!(line, "kernel rejected part of the TC batch");
        }

        info!(
            entries = plan.xdp_entries.len(),
            "executing XDP IP filter commands"
        );
        for entry in &plan.xdp_entries {
            if let Err(e) = self
                .executor
                .xdp_add_entry(&entry.ip, entry.cpu, entry.class_id)
                .await
            {
                warn!(ip = %entry.ip, error = %e, "failed to install XDP entry");
            }
        }

        for (device_id, device_name) in &plan.unshaped_devices {
            warn!(device_id = %device_id, device_name = %device_name, "device was not shaped");
        }

        persist::save_queuing_structure(&self.files, &plan.structure)?;
        std::fs::copy(
            &inputs.subscribers_path,
            self.files.shaped_devices_last_loaded(),
        )?;
        let (tracked_circuits, tracked_parents) = stats::tracked_from_structure(&plan.structure);
        persist::save_json(&self.files.stats_by_circuit(), &tracked_circuits)?;
        persist::save_json(&self.files.stats_by_parent_node(), &tracked_parents)?;
        persist::write_last_run(&self.files)?;

        info!("full reload completed");
        Ok(())
    }

    /// Update-only reload: diff against the last-loaded snapshot and mutate
    /// the live tree.
    ///
    /// Requires the persisted compiled structure from a prior full reload.
    /// Validation failures abort outright; there is no last-good fallback
    /// on this path because the running tree is intact.
    pub async fn update_only(&self) -> Result<ReconcileSummary> {
        info!("partial reload starting");
        if !self.config.enable_actual_shell_commands {
            warn!("shell commands are disabled; this is a simulated run");
        }

        let inputs = self.checked_inputs(false)?;
        let mut structure = persist::load_queuing_structure(&self.files)?;
        let previous = subscribers::load_subscriber_table(
            &self.files.shaped_devices_last_loaded(),
            self.config.overhead_factor(),
        )?;
        let (_, current) = self.load_inputs(&inputs)?;

        let diff = reconciler::diff_snapshots(&previous, &current);
        let summary = Reconciler::new(&self.config, self.executor.as_ref())
            .apply(&mut structure, &diff)
            .await?;

        persist::save_queuing_structure(&self.files, &structure)?;
        std::fs::copy(
            &inputs.subscribers_path,
            self.files.shaped_devices_last_loaded(),
        )?;

        // Refresh the stats snapshots to match the mutated tree, carrying
        // each surviving circuit's sample window forward
        let previous_tracked: Vec<TrackedCircuit> =
            persist::load_json(&self.files.stats_by_circuit())?.unwrap_or_default();
        let (mut tracked_circuits, tracked_parents) =
            stats::tracked_from_structure(&structure);
        for circuit in tracked_circuits.iter_mut() {
            if let Some(previous) = previous_tracked
                .iter()
                .find(|p| p.circuit_id == circuit.circuit_id)
            {
                circuit.stats = previous.stats.clone();
            }
        }
        persist::save_json(&self.files.stats_by_circuit(), &tracked_circuits)?;
        persist::save_json(&self.files.stats_by_parent_node(), &tracked_parents)?;

        info!("partial reload completed");
        Ok(summary)
    }

    /// Full teardown: detach XDP from both interfaces and delete the root
    /// qdiscs
    pub async fn clear_rules(&self) -> Result<()> {
        self.executor.xdp_clear().await?;
        for interface in [&self.config.interface_a, &self.config.interface_b] {
            self.executor
                .run_shell(&format!("ip link set dev {interface} xdp off"))
                .await?;
        }
        self.clear_prior_settings().await
    }

    /// Delete the root qdisc on both interfaces; rejection is expected when
    /// nothing is attached yet
    async fn clear_prior_settings(&self) -> Result<()> {
        for interface in [&self.config.interface_a, &self.config.interface_b] {
            self.executor
                .run_shell(&format!("tc qdisc delete dev {interface} root"))
                .await?;
        }
        Ok(())
    }

    /// Attach the XDP program and egress classifier to both interfaces,
    /// with XPS disabled, after flushing the IP map
    async fn xdp_setup(&self) -> Result<()> {
        self.executor.xdp_clear().await?;
        let xps = self.config.xps_setup_script();
        let loader = self.config.xdp_loader();
        let classify = self.config.tc_classify_tool();
        let a = &self.config.interface_a;
        let b = &self.config.interface_b;
        for command in [
            format!("{} -d {a} --default --disable", xps.display()),
            format!("{} -d {b} --default --disable", xps.display()),
            format!("{} --dev {a} --lan", loader.display()),
            format!("{} --dev {b} --wan", loader.display()),
            format!("{} --dev-egress {a}", classify.display()),
            format!("{} --dev-egress {b}", classify.display()),
        ] {
            let output = self.executor.run_shell(&command).await?;
            if let Some(line) = output.kernel_error() {
                warn!(command = %command, line, "XDP setup command reported a kernel error");
            }
        }
        Ok(())
    }
}
