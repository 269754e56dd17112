//! Instruction execution seam.
//!
//! `RUN` commands are handed to an `InstructionExecutor`; the engine only
//! sequences them, snapshots the rootfs around them and reacts to the exit
//! status. Retry policy, if any, belongs to the executor.

use std::path::PathBuf;

use async_trait::async_trait;
use stagecraft_core::error::{BuildError, Result};

/// Default `PATH` for commands run inside a stage.
pub const DEFAULT_PATH: &str = "/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin";

/// Everything an executor needs to run one command in a stage.
#[derive(Debug, Clone)]
pub struct ExecContext {
    /// Stage label, for diagnostics
    pub stage: String,
    /// Stage root filesystem, exclusively owned by the stage while it runs
    pub rootfs: PathBuf,
    /// Working directory inside the rootfs
    pub workdir: String,
    /// Environment: image `ENV` plus in-scope `ARG`s
    pub env: Vec<(String, String)>,
    pub user: Option<String>,
}

/// Result of running a command.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExecOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl ExecOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Executes shell commands inside a stage's filesystem.
#[async_trait]
pub trait InstructionExecutor: Send + Sync {
    /// Run `command`. An `Err` means the command could not be started; a
    /// non-zero exit is reported through `ExecOutput`.
    async fn execute(&self, ctx: &ExecContext, command: &str) -> Result<ExecOutput>;
}

/// Runs commands with `chroot <rootfs> /bin/sh -c`. Linux only, needs
/// privileges to chroot.
#[derive(Debug, Clone, Default)]
pub struct ChrootExecutor;

impl ChrootExecutor {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl InstructionExecutor for ChrootExecutor {
    #[cfg(target_os = "linux")]
    async fn execute(&self, ctx: &ExecContext, command: &str) -> Result<ExecOutput> {
        let workdir = if ctx.workdir.is_empty() { "/" } else { ctx.workdir.as_str() };

        let mut cmd = tokio::process::Command::new("chroot");
        if let Some(user) = &ctx.user {
            cmd.arg(format!("--userspec={}", user));
        }
        cmd.arg(&ctx.rootfs)
            .arg("/bin/sh")
            .arg("-c")
            .arg(format!("cd '{}' && {}", workdir.replace('\'', r"'\''"), command));

        cmd.env_clear();
        cmd.env("PATH", DEFAULT_PATH);
        cmd.env("HOME", "/root");
        for (key, value) in &ctx.env {
            cmd.env(key, value);
        }

        tracing::debug!(stage = %ctx.stage, command, "Running command in chroot");
        let output = cmd.output().await.map_err(|e| {
            BuildError::Other(format!("Failed to execute RUN command: {}", e))
        })?;

        Ok(ExecOutput {
            exit_code: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }

    #[cfg(not(target_os = "linux"))]
    async fn execute(&self, ctx: &ExecContext, _command: &str) -> Result<ExecOutput> {
        Err(BuildError::Other(format!(
            "stage {}: RUN requires a Linux host",
            ctx.stage
        )))
    }
}
