//! Process runner abstraction and remote execution value types.

use std::ffi::OsString;
use std::process::Command;

use super::RemoteExecError;

/// Result of running an external command.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CommandOutput {
    /// Exit code reported by the process, if available.
    pub code: Option<i32>,
    /// Captured standard output.
    pub stdout: String,
    /// Captured standard error.
    pub stderr: String,
}

impl CommandOutput {
    /// Returns `true` when the exit code equals zero.
    #[must_use]
    pub const fn is_success(&self) -> bool {
        matches!(self.code, Some(0))
    }
}

/// Abstraction over command execution to support fakes in tests.
///
/// Runners are shared by concurrent node flows, hence `Send + Sync`.
pub trait CommandRunner: Send + Sync {
    /// Runs `program` with the given arguments, capturing stdout and stderr.
    ///
    /// # Errors
    ///
    /// Returns [`RemoteExecError::Spawn`] if the command cannot be started.
    fn run(&self, program: &str, args: &[OsString]) -> Result<CommandOutput, RemoteExecError>;
}

/// Real command runner that shells out to the host operating system.
#[derive(Clone, Debug, Default)]
pub struct ProcessCommandRunner;

impl CommandRunner for ProcessCommandRunner {
    fn run(&self, program: &str, args: &[OsString]) -> Result<CommandOutput, RemoteExecError> {
        let output = Command::new(program)
            .args(args)
            .output()
            .map_err(|err| RemoteExecError::Spawn {
                program: program.to_owned(),
                message: err.to_string(),
            })?;

        Ok(CommandOutput {
            code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}

/// Instance a remote operation is addressed to.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct RemoteTarget {
    /// Provider identifier, used for logging.
    pub instance_id: String,
    /// Host name or address to connect to.
    pub host: String,
}

/// Captured result of a remote script.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ExecOutput {
    /// Remote standard output.
    pub stdout: String,
    /// Remote standard error.
    pub stderr: String,
    /// Remote exit status, when the shell reported one.
    pub exit_status: Option<i32>,
}

impl ExecOutput {
    /// Returns `true` when the script exited with status zero.
    #[must_use]
    pub const fn is_success(&self) -> bool {
        matches!(self.exit_status, Some(0))
    }
}
