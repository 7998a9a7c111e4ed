//! Remote payload transfer and script execution over `scp` and `ssh`.
//!
//! Transport failures are reported to the caller as [`RemoteExecError`] and
//! never retried here; retry policy belongs to the deployer.

use std::ffi::OsString;

use camino::{Utf8Path, Utf8PathBuf};
use shell_escape::unix::escape;
use thiserror::Error;
use tracing::debug;

use crate::cluster::{ClusterConfig, SshSettings};

mod types;
mod util;

pub use types::{
    CommandOutput, CommandRunner, ExecOutput, ProcessCommandRunner, RemoteTarget,
};
pub use util::expand_tilde;

/// Exit status `ssh` reserves for its own connection failures.
const SSH_TRANSPORT_FAILURE: i32 = 255;
/// Seconds between keep-alive messages on an established connection.
const SERVER_ALIVE_INTERVAL_SECS: u64 = 15;
/// Unanswered keep-alive messages before the client drops the connection.
const SERVER_ALIVE_COUNT_MAX: u32 = 4;

/// Errors surfaced by remote transfer and execution.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum RemoteExecError {
    /// Raised when SSH settings are missing a required value.
    #[error("missing {field}: set STRATUS_{env_suffix} or add {field} to [ssh] in stratus.toml", env_suffix = field.to_uppercase())]
    InvalidConfig {
        /// Configuration field that failed validation.
        field: String,
    },
    /// Raised when a command cannot be spawned.
    #[error("failed to spawn {program}: {message}")]
    Spawn {
        /// Command that failed to start.
        program: String,
        /// Operating system error string.
        message: String,
    },
    /// Raised when the transport itself fails (copy error or SSH connection
    /// failure).
    #[error("{program} to {host} failed with status {status_text}: {stderr}")]
    Transport {
        /// Command used for the attempted operation.
        program: String,
        /// Host the command targeted.
        host: String,
        /// Human readable exit status.
        status_text: String,
        /// Stderr captured from the process.
        stderr: String,
    },
}

/// Copies the deployment payload to instances and runs scripts on them.
///
/// Both operations block the calling thread until the transfer or script
/// completes.
pub trait RemoteExecutor: Send + Sync {
    /// Copies `local` to the executor's fixed payload path on `target`.
    ///
    /// # Errors
    ///
    /// Returns [`RemoteExecError`] when the transfer fails.
    fn copy(&self, local: &Utf8Path, target: &RemoteTarget) -> Result<(), RemoteExecError>;

    /// Runs `script` on `target`, returning its output and exit status.
    ///
    /// # Errors
    ///
    /// Returns [`RemoteExecError`] when the script cannot be delivered.
    fn exec(&self, script: &str, target: &RemoteTarget) -> Result<ExecOutput, RemoteExecError>;
}

/// [`RemoteExecutor`] built on the system `scp` and `ssh` clients.
#[derive(Clone, Debug)]
pub struct SshExecutor<R: CommandRunner> {
    settings: SshSettings,
    remote_payload_path: Utf8PathBuf,
    runner: R,
}

impl SshExecutor<ProcessCommandRunner> {
    /// Convenience constructor that wires the real process runner.
    ///
    /// # Errors
    ///
    /// Returns [`RemoteExecError::InvalidConfig`] when validation fails.
    pub fn with_process_runner(config: &ClusterConfig) -> Result<Self, RemoteExecError> {
        Self::from_config(config, ProcessCommandRunner)
    }
}

impl<R: CommandRunner> SshExecutor<R> {
    /// Creates an executor from explicit settings.
    ///
    /// # Errors
    ///
    /// Returns [`RemoteExecError::InvalidConfig`] when a required setting is
    /// empty.
    pub fn new(
        settings: SshSettings,
        remote_payload_path: impl Into<Utf8PathBuf>,
        runner: R,
    ) -> Result<Self, RemoteExecError> {
        require_value(&settings.ssh_bin, "ssh_bin")?;
        require_value(&settings.scp_bin, "scp_bin")?;
        require_value(&settings.user, "ssh_user")?;
        if let Some(identity) = settings.identity_file.as_deref() {
            require_value(identity, "ssh_identity_file")?;
        }
        Ok(Self {
            settings,
            remote_payload_path: remote_payload_path.into(),
            runner,
        })
    }

    /// Creates an executor using the cluster's SSH settings and payload path.
    ///
    /// # Errors
    ///
    /// Returns [`RemoteExecError::InvalidConfig`] when validation fails.
    pub fn from_config(config: &ClusterConfig, runner: R) -> Result<Self, RemoteExecError> {
        Self::new(config.ssh.clone(), config.remote_payload_path(), runner)
    }

    fn build_scp_args(&self, local: &Utf8Path, target: &RemoteTarget) -> Vec<OsString> {
        let mut args = self.common_ssh_options("-P");
        args.push(OsString::from(local.as_str()));
        args.push(OsString::from(format!(
            "{}@{}:{}",
            self.settings.user, target.host, self.remote_payload_path
        )));
        args
    }

    fn build_ssh_args(&self, script: &str, target: &RemoteTarget) -> Vec<OsString> {
        let mut args = self.common_ssh_options("-p");
        args.push(OsString::from(format!(
            "{}@{}",
            self.settings.user, target.host
        )));
        args.push(OsString::from(self.remote_command(script)));
        args
    }

    /// `bash -c <script>`, wrapped in `timeout` when a command bound is set so
    /// a hung script hands control back to the caller.
    fn remote_command(&self, script: &str) -> String {
        let invocation = format!("bash -c {}", escape(script.into()));
        let bound = self.settings.command_timeout.as_secs();
        if bound == 0 {
            return invocation;
        }
        format!("timeout {bound} {invocation}")
    }

    fn common_ssh_options(&self, port_flag: &str) -> Vec<OsString> {
        let mut args = vec![
            OsString::from(port_flag),
            OsString::from(self.settings.port.to_string()),
            OsString::from("-o"),
            OsString::from(format!(
                "ConnectTimeout={}",
                self.settings.connect_timeout.as_secs().max(1)
            )),
            OsString::from("-o"),
            OsString::from(format!("ServerAliveInterval={SERVER_ALIVE_INTERVAL_SECS}")),
            OsString::from("-o"),
            OsString::from(format!("ServerAliveCountMax={SERVER_ALIVE_COUNT_MAX}")),
        ];

        if let Some(ref identity_file) = self.settings.identity_file {
            args.push(OsString::from("-i"));
            args.push(OsString::from(expand_tilde(identity_file)));
        }

        if self.settings.batch_mode {
            args.push(OsString::from("-o"));
            args.push(OsString::from("BatchMode=yes"));
        }

        if !self.settings.strict_host_key_checking {
            args.push(OsString::from("-o"));
            args.push(OsString::from("StrictHostKeyChecking=no"));
        }

        if !self.settings.known_hosts_file.trim().is_empty() {
            args.push(OsString::from("-o"));
            args.push(OsString::from(format!(
                "UserKnownHostsFile={}",
                self.settings.known_hosts_file
            )));
        }

        args
    }
}

impl<R: CommandRunner> RemoteExecutor for SshExecutor<R> {
    fn copy(&self, local: &Utf8Path, target: &RemoteTarget) -> Result<(), RemoteExecError> {
        let args = self.build_scp_args(local, target);
        let output = self.runner.run(&self.settings.scp_bin, &args)?;
        if output.is_success() {
            debug!(instance = %target.instance_id, path = %self.remote_payload_path, "payload copied");
            return Ok(());
        }
        Err(transport_error(&self.settings.scp_bin, target, output))
    }

    fn exec(&self, script: &str, target: &RemoteTarget) -> Result<ExecOutput, RemoteExecError> {
        let args = self.build_ssh_args(script, target);
        let output = self.runner.run(&self.settings.ssh_bin, &args)?;
        if output.code == Some(SSH_TRANSPORT_FAILURE) {
            return Err(transport_error(&self.settings.ssh_bin, target, output));
        }
        Ok(ExecOutput {
            stdout: output.stdout,
            stderr: output.stderr,
            exit_status: output.code,
        })
    }
}

fn transport_error(program: &str, target: &RemoteTarget, output: CommandOutput) -> RemoteExecError {
    RemoteExecError::Transport {
        program: program.to_owned(),
        host: target.host.clone(),
        status_text: output
            .code
            .map_or_else(|| String::from("unknown"), |code| code.to_string()),
        stderr: output.stderr,
    }
}

fn require_value(value: &str, field: &str) -> Result<(), RemoteExecError> {
    if value.trim().is_empty() {
        return Err(RemoteExecError::InvalidConfig {
            field: field.to_owned(),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests;
