//! Cluster deployment driver.
//!
//! The [`Orchestrator`] branches on topology. Single-node clusters run one
//! node through the state machine. Multi-node clusters run the admin first,
//! because every container script needs its resolved address, then request
//! the container batch and fan out one task per instance on a
//! [`WorkerPool`] bounded to the batch size.
//!
//! Fatal conditions (an instance that never provisions, an unreachable
//! dependent service, a short batch or an expired aggregate deadline) abort
//! with a [`DeployError`]. Anything that goes wrong inside a node's setup
//! loop is retried within the budget and, once exhausted, recorded as a
//! [`DeploymentStatus::Failure`] result so sibling nodes carry on.

use std::sync::Arc;

use tracing::info;

use crate::cluster::{ClusterConfig, Role, Topology};
use crate::provider::ComputeProvider;
use crate::readiness::PortCheck;
use crate::remote::RemoteExecutor;
use crate::script::ScriptBuilder;

mod error;
mod node;
mod pool;
mod result;

pub use error::{AttemptError, DeployError};
pub use node::{
    CONTAINER_INDEX_TAG, DESCRIPTION_TAG, NAME_TAG, NodeState, OWNER_TAG, ROLE_TAG, RetryState,
};
pub use pool::{PoolDeadlineElapsed, WorkerPool};
pub use result::{DeploymentResult, DeploymentStatus};

use node::NodeRunner;

/// Deploys a cluster described by a [`ClusterConfig`].
#[derive(Debug)]
pub struct Orchestrator<P, X, S>
where
    P: ComputeProvider,
    S: PortCheck,
{
    runner: Arc<NodeRunner<P, X, S>>,
}

impl<P, X, S> Orchestrator<P, X, S>
where
    P: ComputeProvider + 'static,
    X: RemoteExecutor + 'static,
    S: PortCheck + 'static,
{
    /// Creates an orchestrator. The configuration is shared read-only with
    /// every worker.
    #[must_use]
    pub fn new(config: Arc<ClusterConfig>, provider: P, executor: X, ports: S) -> Self {
        Self {
            runner: Arc::new(NodeRunner::new(config, provider, executor, ports)),
        }
    }

    /// Configuration the orchestrator deploys.
    #[must_use]
    pub fn config(&self) -> &ClusterConfig {
        &self.runner.config
    }

    /// Underlying compute provider.
    #[must_use]
    pub fn provider(&self) -> &P {
        self.runner.provisioner.provider()
    }

    /// Deploys every node and returns one result per requested node, admin
    /// (or single node) first, then containers by index.
    ///
    /// # Errors
    ///
    /// Returns [`DeployError`] when a fatal precondition fails.
    pub async fn deploy(&self) -> Result<Vec<DeploymentResult>, DeployError<P::Error>> {
        let config = &self.runner.config;
        info!(
            cluster = %config.name,
            topology = ?config.topology,
            containers = config.container_count,
            "starting deployment"
        );
        match config.topology {
            Topology::SingleNode => Ok(vec![self.runner.run_primary(Role::SingleNode).await?]),
            Topology::MultiNode => {
                let admin = self.runner.run_primary(Role::Admin).await?;
                let mut results = self.deploy_containers(&admin.dns_name).await?;
                results.insert(0, admin);
                Ok(results)
            }
        }
    }

    async fn deploy_containers(
        &self,
        admin_host: &str,
    ) -> Result<Vec<DeploymentResult>, DeployError<P::Error>> {
        let config = &self.runner.config;
        let startup = ScriptBuilder::startup(Role::Container, config);
        let handles = self
            .runner
            .provisioner
            .run_instances(&startup, config.container_count)
            .await
            .map_err(|err| node::fatal(err, config.timings.infra_timeout))?;

        let mut pool = WorkerPool::new(handles.len());
        for (index, handle) in (1_u32..).zip(handles) {
            let runner = Arc::clone(&self.runner);
            let admin = admin_host.to_owned();
            pool.spawn(async move { runner.run_container(index, handle, &admin).await });
        }

        let deadline = config.aggregate_deadline();
        let joined = pool
            .join_within(deadline)
            .await
            .map_err(|elapsed| DeployError::AggregateTimeout {
                deadline: elapsed.deadline,
            })?;

        let mut results = Vec::with_capacity(joined.len());
        for outcome in joined {
            let result = outcome.map_err(DeployError::Worker)?;
            results.push(result?);
        }
        results.sort_by_key(DeploymentResult::order_key);
        Ok(results)
    }
}

#[cfg(test)]
mod tests;
