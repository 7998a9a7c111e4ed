//! Cluster teardown.
//!
//! Every instance launched for a cluster carries `Name=<cluster>` once its
//! final tags are applied. Teardown finds those instances in the zone,
//! terminates them and fails if any are still listed afterwards.

use thiserror::Error;
use tracing::info;

use crate::orchestrator::NAME_TAG;
use crate::provider::ComputeProvider;

/// Summary of a teardown run.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct TeardownSummary {
    /// Identifiers of the instances that were terminated.
    pub terminated: Vec<String>,
}

/// Errors returned by [`ClusterTeardown`].
#[derive(Debug, Error)]
pub enum TeardownError<ProviderError>
where
    ProviderError: std::error::Error + 'static,
{
    /// Raised when the cluster name is blank.
    #[error("cluster name must not be empty")]
    EmptyName,
    /// Raised when tagged instances remain after termination.
    #[error("instances remain after teardown: {remaining:?}")]
    NotClean {
        /// Identifiers still listed by the provider.
        remaining: Vec<String>,
    },
    /// Raised when the provider rejects a lookup or termination.
    #[error("provider error during teardown: {0}")]
    Provider(#[source] ProviderError),
}

/// Terminates every instance tagged with a cluster name.
#[derive(Clone, Debug)]
pub struct ClusterTeardown<P: ComputeProvider> {
    provider: P,
    zone: String,
}

impl<P: ComputeProvider> ClusterTeardown<P> {
    /// Creates a teardown for instances in `zone`.
    #[must_use]
    pub fn new(provider: P, zone: impl Into<String>) -> Self {
        Self {
            provider,
            zone: zone.into(),
        }
    }

    /// Terminates all instances tagged `Name=<cluster_name>`.
    ///
    /// # Errors
    ///
    /// Returns [`TeardownError::EmptyName`] for a blank name,
    /// [`TeardownError::Provider`] when the provider fails, and
    /// [`TeardownError::NotClean`] when instances remain listed afterwards.
    pub async fn run(&self, cluster_name: &str) -> Result<TeardownSummary, TeardownError<P::Error>> {
        let name = cluster_name.trim();
        if name.is_empty() {
            return Err(TeardownError::EmptyName);
        }

        let handles = self
            .provider
            .find_tagged(&self.zone, NAME_TAG, name)
            .await
            .map_err(TeardownError::Provider)?;
        if handles.is_empty() {
            info!(cluster = name, zone = %self.zone, "no instances to terminate");
            return Ok(TeardownSummary {
                terminated: Vec::new(),
            });
        }

        info!(cluster = name, count = handles.len(), "terminating cluster instances");
        self.provider
            .terminate_instances(&handles)
            .await
            .map_err(TeardownError::Provider)?;

        let remaining: Vec<String> = self
            .provider
            .find_tagged(&self.zone, NAME_TAG, name)
            .await
            .map_err(TeardownError::Provider)?
            .into_iter()
            .map(|handle| handle.id)
            .collect();
        if !remaining.is_empty() {
            return Err(TeardownError::NotClean { remaining });
        }

        Ok(TeardownSummary {
            terminated: handles.into_iter().map(|handle| handle.id).collect(),
        })
    }
}
