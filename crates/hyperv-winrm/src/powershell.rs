//! PowerShell execution engine for Hyper-V cmdlets.
//!
//! Wraps `tokio::process::Command` to invoke PowerShell with the Hyper-V
//! module and parse JSON output. Supports both local and remote execution
//! via `Invoke-Command -ComputerName`.

use crate::command::PsCommand;
use crate::error::{HyperVError, HyperVErrorKind, HyperVResult};
use crate::executor::{CallContext, RemoteExecutor};
use crate::types::HyperVConfig;
use async_trait::async_trait;
use log::{debug, trace, warn};
use std::time::Duration;
use tokio::process::Command;

/// Marker the device scripts put in front of a missing-drive throw.
pub const NOT_FOUND_MARKER: &str = "DvdDriveNotFound:";

/// Marker the device scripts put in front of a pool-clear throw.
pub const POLICY_MARKER: &str = "PolicyViolation:";

/// Result of a PowerShell invocation.
#[derive(Debug, Clone)]
pub struct PsOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

impl PsOutput {
    /// A successful invocation that printed `stdout`.
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            stdout: stdout.into(),
            stderr: String::new(),
            exit_code: 0,
        }
    }

    /// Whether the command completed successfully (exit 0, no fatal stderr).
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// Parse stdout, but if it is empty or null return an empty Vec.
    pub fn parse_json_array<T: serde::de::DeserializeOwned>(&self) -> HyperVResult<Vec<T>> {
        let trimmed = self.stdout.trim();
        if trimmed.is_empty() || trimmed == "null" {
            return Ok(Vec::new());
        }
        // PowerShell ConvertTo-Json returns a bare object when N=1, array when N>1
        if trimmed.starts_with('[') {
            serde_json::from_str(trimmed).map_err(|e| {
                HyperVError::with_details(
                    HyperVErrorKind::ParseError,
                    format!("Failed to parse JSON array: {}", e),
                    trimmed.chars().take(500).collect::<String>(),
                )
            })
        } else {
            let item: T = serde_json::from_str(trimmed).map_err(|e| {
                HyperVError::with_details(
                    HyperVErrorKind::ParseError,
                    format!("Failed to parse JSON object: {}", e),
                    trimmed.chars().take(500).collect::<String>(),
                )
            })?;
            Ok(vec![item])
        }
    }

    /// Turn a failed invocation into a classified error.
    pub fn into_error(self) -> HyperVError {
        let msg = if self.stderr.trim().is_empty() {
            format!("PowerShell exited with code {}", self.exit_code)
        } else {
            self.stderr.trim().to_string()
        };
        classify_failure(msg)
    }
}

/// Map PowerShell error text onto an error kind.
pub fn classify_failure(msg: String) -> HyperVError {
    if msg.contains("is not recognized") || msg.contains("The term 'Get-VM' is not recognized") {
        return HyperVError::module_not_available();
    }
    if msg.contains("Access is denied") || msg.contains("AccessDenied") {
        return HyperVError::access_denied(msg);
    }
    if msg.contains("WinRM cannot complete the operation")
        || msg.contains("Connecting to remote server")
    {
        return HyperVError::new(HyperVErrorKind::ConnectionError, msg);
    }
    if let Some(rest) = marker_tail(&msg, NOT_FOUND_MARKER) {
        return HyperVError::new(HyperVErrorKind::DvdDriveNotFound, rest);
    }
    if let Some(rest) = marker_tail(&msg, POLICY_MARKER) {
        return HyperVError::new(HyperVErrorKind::PolicyViolation, rest);
    }
    HyperVError::ps_error(msg)
}

fn marker_tail(msg: &str, marker: &str) -> Option<String> {
    msg.find(marker).map(|i| {
        msg[i + marker.len()..]
            .lines()
            .next()
            .unwrap_or("")
            .trim()
            .to_string()
    })
}

// ─── Executor ────────────────────────────────────────────────────────

/// PowerShell executor for Hyper-V management.
pub struct PsExecutor {
    config: HyperVConfig,
}

impl PsExecutor {
    /// Create a new executor from configuration.
    pub fn new(config: &HyperVConfig) -> Self {
        Self {
            config: config.clone(),
        }
    }

    /// Build the prefix that targets a remote host if `target_host` is set.
    fn remote_prefix(&self) -> String {
        if !self.config.is_remote() {
            return String::new();
        }
        let cred_block = if let Some(ref c) = self.config.credential {
            let user = if let Some(ref d) = c.domain {
                format!("{}\\{}", d, c.username)
            } else {
                c.username.clone()
            };
            format!(
                "$__cred = New-Object System.Management.Automation.PSCredential('{}', (ConvertTo-SecureString '{}' -AsPlainText -Force)); ",
                PsScripts::escape(&user),
                PsScripts::escape(&c.password),
            )
        } else {
            String::new()
        };

        format!(
            "{}Invoke-Command -ComputerName '{}' {} -ScriptBlock {{ ",
            cred_block,
            PsScripts::escape(self.config.target_host.trim()),
            if self.config.credential.is_some() {
                "-Credential $__cred"
            } else {
                ""
            },
        )
    }

    /// Build the suffix that closes the remote block.
    fn remote_suffix(&self) -> String {
        if self.config.is_remote() {
            " }".to_string()
        } else {
            String::new()
        }
    }

    /// Per-command limit from the config; the call context may cut it shorter.
    fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.config.timeout_seconds)
    }

    /// Wrap a script body so it targets the correct host.
    fn wrap_script(&self, body: &str) -> String {
        format!(
            "$ErrorActionPreference = 'Stop'; {}{}{}",
            self.remote_prefix(),
            body,
            self.remote_suffix()
        )
    }

    /// Execute a command and return raw output.
    pub async fn run(&self, ctx: &CallContext, command: &PsCommand) -> HyperVResult<PsOutput> {
        ctx.check(command.name())?;

        let full_script = self.wrap_script(&command.render());
        debug!(
            "HyperV PS exec {} [{}] ({} chars, {} params, host='{}')",
            command.name(),
            command.id(),
            full_script.len(),
            command.parameters().len(),
            self.config.target_host,
        );
        trace!("HyperV PS [{}] body:\n{}", command.id(), command.script());

        let timeout = self.command_timeout();

        let child = Command::new(&self.config.powershell_path)
            .args([
                "-NoProfile",
                "-NonInteractive",
                "-ExecutionPolicy",
                "Bypass",
                "-Command",
                &full_script,
            ])
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                HyperVError::with_details(
                    HyperVErrorKind::PowerShellError,
                    "Failed to spawn PowerShell process",
                    e.to_string(),
                )
            })?;

        // Dropping the child on cancel or deadline kills the process.
        let output = ctx
            .run(command.name(), async move {
                tokio::time::timeout(timeout, child.wait_with_output())
                    .await
                    .map_err(|_| HyperVError::timeout(command.name()))?
                    .map_err(|e| {
                        HyperVError::with_details(
                            HyperVErrorKind::PowerShellError,
                            "PowerShell process failed",
                            e.to_string(),
                        )
                    })
            })
            .await?;

        let stdout = String::from_utf8_lossy(&output.stdout).to_string();
        let stderr = String::from_utf8_lossy(&output.stderr).to_string();
        let exit_code = output.status.code().unwrap_or(-1);

        trace!(
            "PS [{}] stdout ({} bytes): {}",
            command.id(),
            stdout.len(),
            stdout.chars().take(300).collect::<String>()
        );
        if !stderr.is_empty() {
            warn!(
                "PS [{}] stderr: {}",
                command.id(),
                stderr.chars().take(500).collect::<String>()
            );
        }

        Ok(PsOutput {
            stdout,
            stderr,
            exit_code,
        })
    }

    /// Execute and assert success (exit 0), returning the output.
    pub async fn run_ok(&self, ctx: &CallContext, command: &PsCommand) -> HyperVResult<PsOutput> {
        let output = self.run(ctx, command).await?;
        if !output.success() {
            return Err(output.into_error());
        }
        Ok(output)
    }

}

/// Name of the module check command.
pub const CHECK_MODULE: &str = "CheckHyperVModule";

const CHECK_MODULE_SCRIPT: &str =
    "Get-Module -ListAvailable -Name Hyper-V | Select-Object -First 1 Name | ConvertTo-Json";

/// Command that prints the Hyper-V module's name, or nothing.
pub fn check_module_command() -> PsCommand {
    PsCommand::new(CHECK_MODULE, CHECK_MODULE_SCRIPT)
}

/// Interpret the module check's stdout.
pub fn module_present(stdout: &str) -> bool {
    let trimmed = stdout.trim();
    !(trimmed.is_empty() || trimmed.contains("null"))
}

#[async_trait]
impl RemoteExecutor for PsExecutor {
    async fn run_fire_and_forget(
        &self,
        ctx: &CallContext,
        command: &PsCommand,
    ) -> HyperVResult<()> {
        self.run_ok(ctx, command).await?;
        Ok(())
    }

    async fn run_with_result(
        &self,
        ctx: &CallContext,
        command: &PsCommand,
    ) -> HyperVResult<PsOutput> {
        self.run_ok(ctx, command).await
    }
}

// ─── Script Helpers ──────────────────────────────────────────────────

/// Utility functions that build PowerShell script fragments.
pub struct PsScripts;

impl PsScripts {
    /// Escape a string value for embedding inside single-quoted PS strings.
    pub fn escape(s: &str) -> String {
        s.replace('\'', "''")
    }
}
