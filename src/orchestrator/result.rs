//! Per-node deployment outcomes.

use std::fmt;
use std::net::IpAddr;

use crate::cluster::Role;

/// Final status of a node.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum DeploymentStatus {
    /// The node's application port opened within the retry budget.
    Success,
    /// The retry budget was exhausted.
    Failure,
}

impl fmt::Display for DeploymentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Success => "success",
            Self::Failure => "failure",
        })
    }
}

/// Outcome recorded exactly once per requested node.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct DeploymentResult {
    /// Role the node was deployed as.
    pub role: Role,
    /// 1-based container index; `None` for admin and single-node.
    pub container_index: Option<u32>,
    /// Provider identifier of the instance.
    pub instance_id: String,
    /// Public IP address.
    pub address: IpAddr,
    /// Public DNS name.
    pub dns_name: String,
    /// Final status.
    pub status: DeploymentStatus,
    /// Last failure seen, when the node failed.
    pub detail: Option<String>,
    /// Attempts consumed by the setup loop.
    pub attempts: u32,
}

impl DeploymentResult {
    /// Returns `true` when the node deployed successfully.
    #[must_use]
    pub const fn is_success(&self) -> bool {
        matches!(self.status, DeploymentStatus::Success)
    }

    /// Sort key placing the admin (or single node) first, then containers by
    /// index.
    #[must_use]
    pub const fn order_key(&self) -> u32 {
        match self.container_index {
            Some(index) => index,
            None => 0,
        }
    }
}
