//! Fatal deployment errors and retryable per-attempt failures.

use std::time::Duration;

use thiserror::Error;

use crate::readiness::ReadinessTimeout;
use crate::remote::RemoteExecError;

/// Errors that abort a deployment.
///
/// Per-node retryable failures never surface here; they end up as a
/// [`crate::orchestrator::DeploymentStatus::Failure`] result instead.
#[derive(Debug, Error)]
pub enum DeployError<ProviderError>
where
    ProviderError: std::error::Error + 'static,
{
    /// An instance never reached the running state or never opened its SSH
    /// port within the infrastructure budget.
    #[error("instance {instance_id} was not provisioned: {source}")]
    ProvisionTimeout {
        /// Provider identifier of the instance.
        instance_id: String,
        /// Readiness gate that expired.
        #[source]
        source: ReadinessTimeout,
    },
    /// The provider returned fewer instances than requested.
    #[error("requested {requested} instances but the provider returned {received}")]
    ProvisionShortfall {
        /// Instances requested.
        requested: u32,
        /// Instances returned.
        received: usize,
    },
    /// A dependent service never became reachable.
    #[error("dependent service {service} is unreachable: {source}")]
    DependentServiceTimeout {
        /// Service name (`cache`, `broker` or `coordination`).
        service: &'static str,
        /// Readiness gate that expired.
        #[source]
        source: ReadinessTimeout,
    },
    /// The container fan-out did not finish before its aggregate deadline.
    #[error("container deployment did not finish within {}s", deadline.as_secs())]
    AggregateTimeout {
        /// Deadline that elapsed.
        deadline: Duration,
    },
    /// A provider request failed outside the retry loop.
    #[error("provider request failed: {0}")]
    Provider(#[source] ProviderError),
    /// A worker task panicked or was cancelled.
    #[error("container worker failed: {0}")]
    Worker(String),
}

/// Failure of a single setup attempt. Every variant is retryable.
#[derive(Debug, Error)]
pub enum AttemptError {
    /// Copying the payload failed.
    #[error("payload copy failed: {0}")]
    Copy(#[source] RemoteExecError),
    /// Delivering the setup script failed.
    #[error("setup script could not run: {0}")]
    Exec(#[source] RemoteExecError),
    /// The setup script ran but exited unsuccessfully.
    #[error("setup script exited with status {status}: {stderr}")]
    NonZeroExit {
        /// Exit status, or `unknown` when the shell reported none.
        status: String,
        /// Captured stderr.
        stderr: String,
    },
    /// Applying tags failed.
    #[error("tagging failed: {0}")]
    Tagging(String),
    /// Re-describing the instance failed.
    #[error("instance lookup failed: {0}")]
    Resolve(String),
    /// The application port never opened.
    #[error("service did not start: {0}")]
    ServiceTimeout(#[source] ReadinessTimeout),
}
