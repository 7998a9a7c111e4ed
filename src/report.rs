//! Deployment summary and server listing artifact.
//!
//! After a deployment the CLI prints one summary line per node and writes
//! `stratus-servers.csv` listing each node's role, public DNS name and, for
//! admin and container nodes, the application server and management ports.

use std::io;

use camino::{Utf8Path, Utf8PathBuf};
use cap_std::{ambient_authority, fs_utf8::Dir};
use thiserror::Error;

use crate::cluster::{AppPorts, Role};
use crate::orchestrator::DeploymentResult;

/// File name of the server listing written next to the working directory.
pub const ARTIFACT_FILE_NAME: &str = "stratus-servers.csv";

/// Errors raised while writing the server listing.
#[derive(Debug, Error, Eq, PartialEq)]
pub enum ReportError {
    /// Raised when the artifact directory or file cannot be accessed.
    #[error("failed to write {path}: {message}")]
    Io {
        /// Path that was being accessed.
        path: Utf8PathBuf,
        /// Underlying I/O error text.
        message: String,
    },
}

const fn artifact_label(role: Role) -> &'static str {
    match role {
        Role::SingleNode => "singleNode",
        Role::Admin => "adminNode",
        Role::Container => "containerNode",
    }
}

/// Renders deployment results for operators and downstream tooling.
#[derive(Clone, Copy, Debug)]
pub struct DeploymentReport<'a> {
    results: &'a [DeploymentResult],
    ports: &'a AppPorts,
}

impl<'a> DeploymentReport<'a> {
    /// Creates a report over the ordered deployment results.
    #[must_use]
    pub const fn new(results: &'a [DeploymentResult], ports: &'a AppPorts) -> Self {
        Self { results, ports }
    }

    /// Returns `true` when every node deployed successfully.
    #[must_use]
    pub fn all_succeeded(&self) -> bool {
        self.results.iter().all(DeploymentResult::is_success)
    }

    /// Human readable lines, one per node.
    #[must_use]
    pub fn summary_lines(&self) -> Vec<String> {
        self.results
            .iter()
            .map(|result| {
                let node = result.container_index.map_or_else(
                    || result.role.to_string(),
                    |index| format!("container {index}"),
                );
                let mut line = format!(
                    "{node}: {} ({}, {}) {} after {} attempt(s)",
                    result.dns_name,
                    result.address,
                    result.instance_id,
                    result.status,
                    result.attempts
                );
                if let Some(detail) = &result.detail {
                    line.push_str(&format!(": {detail}"));
                }
                line
            })
            .collect()
    }

    /// Renders the server listing, one `role,address[,server,management]`
    /// row per node.
    #[must_use]
    pub fn artifact(&self) -> String {
        self.results
            .iter()
            .map(|result| {
                let label = artifact_label(result.role);
                match result.role {
                    Role::SingleNode => format!("{label},{}\n", result.dns_name),
                    Role::Admin | Role::Container => format!(
                        "{label},{},{},{}\n",
                        result.dns_name,
                        self.ports.server,
                        self.ports.readiness_port(result.role)
                    ),
                }
            })
            .collect()
    }

    /// Writes the server listing into `dir`, replacing any previous copy.
    ///
    /// # Errors
    ///
    /// Returns [`ReportError::Io`] when the directory cannot be opened or the
    /// file cannot be written.
    pub fn write_artifact(&self, dir: &Utf8Path) -> Result<Utf8PathBuf, ReportError> {
        let path = dir.join(ARTIFACT_FILE_NAME);
        let handle = open_dir(dir)?;
        handle
            .write(ARTIFACT_FILE_NAME, self.artifact())
            .map_err(|err| ReportError::Io {
                path: path.clone(),
                message: err.to_string(),
            })?;
        Ok(path)
    }
}

/// Removes a listing left behind by an earlier run so a failed deployment
/// never leaves stale addresses around.
///
/// # Errors
///
/// Returns [`ReportError::Io`] when the file exists but cannot be removed.
pub fn remove_stale_artifact(dir: &Utf8Path) -> Result<(), ReportError> {
    let handle = open_dir(dir)?;
    match handle.remove_file(ARTIFACT_FILE_NAME) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(ReportError::Io {
            path: dir.join(ARTIFACT_FILE_NAME),
            message: err.to_string(),
        }),
    }
}

fn open_dir(dir: &Utf8Path) -> Result<Dir, ReportError> {
    Dir::open_ambient_dir(dir, ambient_authority()).map_err(|err| ReportError::Io {
        path: dir.to_path_buf(),
        message: err.to_string(),
    })
}
