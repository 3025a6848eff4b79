//! External executor interface: the single component permitted to touch the
//! host.
//!
//! Every other module is pure over in-memory state and hands this one
//! command strings, batch files, or XDP map mutations. A dry-run
//! implementation records what would have run, which both backs the
//! simulated-run config flag and makes the full pipeline testable.

use crate::config::Config;
use crate::error::Result;
use crate::types::TcHandle;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tokio::process::Command;
use tracing::{debug, info, warn};

/// Kernel error sentinels scanned for in command output
const KERNEL_ERROR_SENTINELS: [&str; 2] =
    ["RTNETLINK answers", "We have an error talking to the kernel"];

/// Captured result of one shell invocation
#[derive(Clone, Debug, Default)]
pub struct ShellOutput {
    /// Whether the process exited successfully
    pub success: bool,
    /// Combined captured stdout and stderr
    pub output: String,
}

impl ShellOutput {
    /// The first kernel-error sentinel line in the output, if any.
    ///
    /// Batched tc surfaces these as warnings; the per-command path treats
    /// them as fatal for the reload.
    pub fn kernel_error(&self) -> Option<&str> {
        self.output
            .lines()
            .find(|line| KERNEL_ERROR_SENTINELS.iter().any(|s| line.contains(s)))
    }
}

/// Abstract sink for shell invocations and XDP map mutations
#[async_trait]
pub trait Executor: Send + Sync {
    /// Run a single shell command, capturing its output
    async fn run_shell(&self, command: &str) -> Result<ShellOutput>;

    /// Feed a prepared command file to `tc -b`
    async fn run_shell_batch(&self, command_file: &Path) -> Result<ShellOutput>;

    /// Flush the whole IP -> CPU/classid map
    async fn xdp_clear(&self) -> Result<()>;

    /// Map one IP (host or CIDR) to a CPU and an HTB leaf class
    async fn xdp_add_entry(&self, ip: &str, cpu: u16, class_id: TcHandle) -> Result<()>;

    /// Remove one IP from the map
    async fn xdp_del_entry(&self, ip: &str) -> Result<()>;
}

/// Executor that spawns real processes on the host
pub struct ShellExecutor {
    tc_binary: PathBuf,
    xdp_tool: PathBuf,
    sudo: bool,
    dry_run: bool,
}

impl ShellExecutor {
    /// Build from config: discovers the `tc` binary, honors the sudo and
    /// simulated-run flags
    pub fn new(config: &Config) -> Self {
        let tc_binary = which::which("tc").unwrap_or_else(|_| PathBuf::from("/sbin/tc"));
        Self {
            tc_binary,
            xdp_tool: config.xdp_cmdline_tool(),
            sudo: config.run_shell_commands_as_sudo,
            dry_run: !config.enable_actual_shell_commands,
        }
    }

    async fn spawn(&self, program: &str, args: &[&str]) -> Result<ShellOutput> {
        if self.dry_run {
            info!(command = %format!("{program} {}", args.join(" ")), "dry run");
            return Ok(ShellOutput {
                success: true,
                output: String::new(),
            });
        }
        let mut command = if self.sudo {
            let mut c = Command::new("sudo");
            c.arg(program);
            c
        } else {
            Command::new(program)
        };
        command.args(args);
        debug!(program, ?args, "spawning");
        let out = command.output().await?;
        let mut output = String::from_utf8_lossy(&out.stdout).into_owned();
        output.push_str(&String::from_utf8_lossy(&out.stderr));
        let shell_output = ShellOutput {
            success: out.status.success(),
            output,
        };
        if let Some(line) = shell_output.kernel_error() {
            warn!(program, line, "command produced a kernel error");
        }
        Ok(shell_output)
    }
}

#[async_trait]
impl Executor for ShellExecutor {
    async fn run_shell(&self, command: &str) -> Result<ShellOutput> {
        let mut parts = command.split_whitespace();
        let Some(program) = parts.next() else {
            return Ok(ShellOutput::default());
        };
        let args: Vec<&str> = parts.collect();
        self.spawn(program, &args).await
    }

    async fn run_shell_batch(&self, command_file: &Path) -> Result<ShellOutput> {
        let tc = self.tc_binary.to_string_lossy().into_owned();
        let file = command_file.to_string_lossy().into_owned();
        // Without -f a single bad line aborts the batch; keep that behavior
        // in debug runs so the offending command is visible
        if tracing::enabled!(tracing::Level::DEBUG) {
            self.spawn(&tc, &["-b", &file]).await
        } else {
            self.spawn(&tc, &["-f", "-b", &file]).await
        }
    }

    async fn xdp_clear(&self) -> Result<()> {
        let tool = self.xdp_tool.to_string_lossy().into_owned();
        self.spawn(&tool, &["--clear"]).await.map(|_| ())
    }

    async fn xdp_add_entry(&self, ip: &str, cpu: u16, class_id: TcHandle) -> Result<()> {
        let tool = self.xdp_tool.to_string_lossy().into_owned();
        let cpu_hex = format!("0x{cpu:x}");
        let classid = class_id.class_string();
        self.spawn(
            &tool,
            &["--add", "--ip", ip, "--cpu", &cpu_hex, "--classid", &classid],
        )
        .await
        .map(|_| ())
    }

    async fn xdp_del_entry(&self, ip: &str) -> Result<()> {
        let tool = self.xdp_tool.to_string_lossy().into_owned();
        self.spawn(&tool, &["--del", "--ip", ip]).await.map(|_| ())
    }
}

/// One call recorded by [`RecordingExecutor`]
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ExecutorCall {
    /// A single shell command
    Shell(String),
    /// A batched tc file
    ShellBatch(PathBuf),
    /// Map flush
    XdpClear,
    /// Map insert
    XdpAdd {
        /// Host or CIDR
        ip: String,
        /// Zero-based CPU
        cpu: u16,
        /// Target leaf class
        class_id: TcHandle,
    },
    /// Map delete
    XdpDel {
        /// Host or CIDR
        ip: String,
    },
}

/// Executor that records every call without touching the host.
///
/// Everything reports success, so the rest of the system behaves exactly as
/// it would on a healthy host. Used for dry-run inspection and tests.
#[derive(Default)]
pub struct RecordingExecutor {
    calls: Mutex<Vec<ExecutorCall>>,
}

impl RecordingExecutor {
    /// A fresh recorder
    pub fn new() -> Self {
        Self::default()
    }

    /// Everything recorded so far, in call order
    pub fn calls(&self) -> Vec<ExecutorCall> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }

    /// Only the single shell commands, in call order
    pub fn shell_commands(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                ExecutorCall::Shell(cmd) => Some(cmd),
                _ => None,
            })
            .collect()
    }

    fn record(&self, call: ExecutorCall) {
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(call);
        }
    }
}

#[async_trait]
impl Executor for RecordingExecutor {
    async fn run_shell(&self, command: &str) -> Result<ShellOutput> {
        self.record(ExecutorCall::Shell(command.to_string()));
        Ok(ShellOutput {
            success: true,
            output: String::new(),
        })
    }

    async fn run_shell_batch(&self, command_file: &Path) -> Result<ShellOutput> {
        self.record(ExecutorCall::ShellBatch(command_file.to_path_buf()));
        Ok(ShellOutput {
            success: true,
            output: String::new(),
        })
    }

    async fn xdp_clear(&self) -> Result<()> {
        self.record(ExecutorCall::XdpClear);
        Ok(())
    }

    async fn xdp_add_entry(&self, ip: &str, cpu: u16, class_id: TcHandle) -> Result<()> {
        self.record(ExecutorCall::XdpAdd {
            ip: ip.to_string(),
            cpu,
            class_id,
        });
        Ok(())
    }

    async fn xdp_del_entry(&self, ip: &str) -> Result<()> {
        self.record(ExecutorCall::XdpDel { ip: ip.to_string() });
        Ok(())
    }
}
