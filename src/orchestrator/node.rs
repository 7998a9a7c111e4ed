//! Per-node state machine: infrastructure gate, dependent-service gate and
//! the bounded setup loop.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::spawn_blocking;
use tracing::{debug, info, warn};

use super::error::{AttemptError, DeployError};
use super::result::{DeploymentResult, DeploymentStatus};
use crate::cluster::{ClusterConfig, Role, ServiceAddress};
use crate::provider::{ComputeProvider, InstanceHandle, Tags};
use crate::provisioner::{InstanceProvisioner, ProvisionError, ResolvedInstance};
use crate::readiness::{PortCheck, ReadinessChecker, ReadinessTimeout};
use crate::remote::{RemoteExecError, RemoteExecutor, RemoteTarget};
use crate::script::{HostContext, ScriptBuilder};

/// Tag key holding the human readable instance name.
pub const NAME_TAG: &str = "Name";
/// Tag key holding the cluster owner.
pub const OWNER_TAG: &str = "Owner";
/// Tag key holding the cluster description.
pub const DESCRIPTION_TAG: &str = "Description";
/// Tag key holding the node role.
pub const ROLE_TAG: &str = "Role";
/// Tag key holding the 1-based container index.
pub const CONTAINER_INDEX_TAG: &str = "ContainerIndex";

/// Stages a node moves through.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum NodeState {
    /// The instance has been requested.
    Requested,
    /// The instance runs and accepts SSH connections.
    InfraReady,
    /// The setup script ran successfully.
    Configured,
    /// The application port accepts connections.
    ServiceReady,
    /// Final cluster tags are applied.
    Tagged,
    /// The node deployed successfully.
    Done,
    /// The retry budget was exhausted.
    Failed,
}

impl fmt::Display for NodeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Bounded attempt counter owned by one node.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct RetryState {
    used: u32,
    budget: u32,
}

impl RetryState {
    /// Creates a counter allowing `budget` attempts.
    #[must_use]
    pub const fn new(budget: u32) -> Self {
        Self { used: 0, budget }
    }

    /// Claims the next attempt, returning `false` once the budget is spent.
    pub const fn begin(&mut self) -> bool {
        if self.used >= self.budget {
            return false;
        }
        self.used += 1;
        true
    }

    /// Attempts claimed so far.
    #[must_use]
    pub const fn used(&self) -> u32 {
        self.used
    }

    /// Attempt budget.
    #[must_use]
    pub const fn budget(&self) -> u32 {
        self.budget
    }
}

/// Identity of one node flowing through the state machine.
#[derive(Clone, Debug)]
pub(crate) struct NodeSpec {
    role: Role,
    container_index: Option<u32>,
    handle: InstanceHandle,
}

impl NodeSpec {
    pub(crate) const fn primary(role: Role, handle: InstanceHandle) -> Self {
        Self {
            role,
            container_index: None,
            handle,
        }
    }

    pub(crate) const fn container(index: u32, handle: InstanceHandle) -> Self {
        Self {
            role: Role::Container,
            container_index: Some(index),
            handle,
        }
    }
}

/// Shared, read-only machinery every node flow runs against.
#[derive(Debug)]
pub(crate) struct NodeRunner<P, X, S>
where
    P: ComputeProvider,
    S: PortCheck,
{
    pub(crate) config: Arc<ClusterConfig>,
    pub(crate) provisioner: InstanceProvisioner<P>,
    executor: Arc<X>,
    checker: ReadinessChecker<S>,
}

impl<P, X, S> NodeRunner<P, X, S>
where
    P: ComputeProvider + 'static,
    X: RemoteExecutor + 'static,
    S: PortCheck + 'static,
{
    pub(crate) fn new(config: Arc<ClusterConfig>, provider: P, executor: X, ports: S) -> Self {
        let checker = ReadinessChecker::new(ports, config.timings.poll_interval);
        let provisioner = InstanceProvisioner::new(provider, config.launch.clone());
        Self {
            config,
            provisioner,
            executor: Arc::new(executor),
            checker,
        }
    }

    /// Runs the admin or single-node flow: one instance, infrastructure
    /// gate, dependent-service gate, then the setup loop.
    pub(crate) async fn run_primary(
        &self,
        role: Role,
    ) -> Result<DeploymentResult, DeployError<P::Error>> {
        let startup = ScriptBuilder::startup(role, &self.config);
        let handle = self
            .provisioner
            .run_instances(&startup, 1)
            .await
            .map_err(|err| fatal(err, self.config.timings.infra_timeout))?
            .into_iter()
            .next()
            .ok_or(DeployError::ProvisionShortfall {
                requested: 1,
                received: 0,
            })?;
        let node = NodeSpec::primary(role, handle);
        transition(&node, NodeState::Requested);

        let resolved = self.await_infra(&node).await?;
        self.mark_attempting(&node).await;
        self.check_dependent_services().await?;

        let context = HostContext::for_self(resolved.dns_name.clone());
        Ok(self.configure(&node, resolved, &context).await)
    }

    /// Runs one container flow against an already requested instance.
    pub(crate) async fn run_container(
        &self,
        index: u32,
        handle: InstanceHandle,
        admin_host: &str,
    ) -> Result<DeploymentResult, DeployError<P::Error>> {
        let node = NodeSpec::container(index, handle);
        transition(&node, NodeState::Requested);

        let resolved = self.await_infra(&node).await?;
        self.mark_attempting(&node).await;

        let context = HostContext::for_container(&self.config, admin_host, index);
        Ok(self.configure(&node, resolved, &context).await)
    }

    async fn await_infra(
        &self,
        node: &NodeSpec,
    ) -> Result<ResolvedInstance, DeployError<P::Error>> {
        let budget = self.config.timings.infra_timeout;
        let provision_timeout = |source| DeployError::ProvisionTimeout {
            instance_id: node.handle.id.clone(),
            source,
        };

        self.checker
            .wait_for_running(self.provisioner.provider(), &node.handle, budget)
            .await
            .map_err(provision_timeout)?;
        let resolved = self
            .provisioner
            .resolve(&node.handle)
            .await
            .map_err(|err| fatal(err, budget))?;
        self.checker
            .wait_for_port(&resolved.dns_name, self.config.ssh.port, budget)
            .await
            .map_err(provision_timeout)?;

        transition(node, NodeState::InfraReady);
        Ok(resolved)
    }

    async fn check_dependent_services(&self) -> Result<(), DeployError<P::Error>> {
        let services = &self.config.services;
        self.service_gate("cache", &services.cache).await?;
        self.service_gate("broker", &services.brokers).await?;
        if let Some(coordination) = &services.coordination {
            self.service_gate("coordination", coordination).await?;
        }
        Ok(())
    }

    async fn service_gate(
        &self,
        service: &'static str,
        addresses: &[ServiceAddress],
    ) -> Result<(), DeployError<P::Error>> {
        self.checker
            .wait_for_any(addresses, self.config.timings.dependent_timeout)
            .await
            .map_err(|source| DeployError::DependentServiceTimeout { service, source })?;
        debug!(service, "dependent service reachable");
        Ok(())
    }

    async fn mark_attempting(&self, node: &NodeSpec) {
        let tags = Tags::new()
            .with(
                NAME_TAG,
                format!("Initializing instance for {}", self.config.owner),
            )
            .with(ROLE_TAG, node.role.tag_value());
        if let Err(err) = self
            .provisioner
            .provider()
            .tag_instance(&node.handle, &tags)
            .await
        {
            warn!(instance = %node.handle.id, error = %err, "failed to apply initialising tags");
        }
    }

    fn final_tags(&self, node: &NodeSpec) -> Tags {
        let mut tags = Tags::new()
            .with(NAME_TAG, self.config.name.as_str())
            .with(OWNER_TAG, self.config.owner.as_str())
            .with(DESCRIPTION_TAG, self.config.description.as_str())
            .with(ROLE_TAG, node.role.tag_value());
        if let Some(index) = node.container_index {
            tags.insert(CONTAINER_INDEX_TAG, index.to_string());
        }
        tags
    }

    async fn configure(
        &self,
        node: &NodeSpec,
        resolved: ResolvedInstance,
        context: &HostContext,
    ) -> DeploymentResult {
        let script = ScriptBuilder::render(node.role, &self.config, context);
        let mut retry = RetryState::new(self.config.retry_budget);
        let mut copied = false;
        let mut last_error = None;

        while retry.begin() {
            match self.attempt(node, &resolved, &script, &mut copied).await {
                Ok(ready) => {
                    self.retag(node).await;
                    transition(node, NodeState::Done);
                    info!(
                        instance = %node.handle.id,
                        role = %node.role,
                        attempts = retry.used(),
                        "node deployed"
                    );
                    return node_result(node, &ready, DeploymentStatus::Success, None, retry);
                }
                Err(err) => {
                    warn!(
                        instance = %node.handle.id,
                        role = %node.role,
                        attempt = retry.used(),
                        budget = retry.budget(),
                        error = %err,
                        "setup attempt failed"
                    );
                    last_error = Some(err.to_string());
                }
            }
        }

        transition(node, NodeState::Failed);
        node_result(node, &resolved, DeploymentStatus::Failure, last_error, retry)
    }

    /// One execute + tag + poll round. Final tags are written whatever the
    /// script outcome.
    async fn attempt(
        &self,
        node: &NodeSpec,
        resolved: &ResolvedInstance,
        script: &str,
        copied: &mut bool,
    ) -> Result<ResolvedInstance, AttemptError> {
        let target = RemoteTarget {
            instance_id: node.handle.id.clone(),
            host: resolved.dns_name.clone(),
        };
        let executed = self.execute(&target, script, copied).await;
        let tagged = self
            .provisioner
            .provider()
            .tag_instance(&node.handle, &self.final_tags(node))
            .await
            .map_err(|err| AttemptError::Tagging(err.to_string()));
        executed?;
        tagged?;
        transition(node, NodeState::Configured);

        let ready = self
            .provisioner
            .resolve(&node.handle)
            .await
            .map_err(|err| AttemptError::Resolve(err.to_string()))?;
        let port = self.config.ports.readiness_port(node.role);
        self.checker
            .wait_for_port(&ready.dns_name, port, self.config.timings.service_timeout)
            .await
            .map_err(AttemptError::ServiceTimeout)?;
        transition(node, NodeState::ServiceReady);
        Ok(ready)
    }

    async fn execute(
        &self,
        target: &RemoteTarget,
        script: &str,
        copied: &mut bool,
    ) -> Result<(), AttemptError> {
        if !*copied {
            let executor = Arc::clone(&self.executor);
            let payload = self.config.payload_path.clone();
            let remote = target.clone();
            run_blocking(move || executor.copy(&payload, &remote))
                .await
                .map_err(AttemptError::Copy)?;
            *copied = true;
        }

        let executor = Arc::clone(&self.executor);
        let remote = target.clone();
        let body = script.to_owned();
        let output = run_blocking(move || executor.exec(&body, &remote))
            .await
            .map_err(AttemptError::Exec)?;
        debug!(
            instance = %target.instance_id,
            stdout = %output.stdout,
            stderr = %output.stderr,
            "setup script finished"
        );
        if output.is_success() {
            return Ok(());
        }
        Err(AttemptError::NonZeroExit {
            status: output
                .exit_status
                .map_or_else(|| String::from("unknown"), |code| code.to_string()),
            stderr: output.stderr,
        })
    }

    async fn retag(&self, node: &NodeSpec) {
        match self
            .provisioner
            .provider()
            .tag_instance(&node.handle, &self.final_tags(node))
            .await
        {
            Ok(()) => transition(node, NodeState::Tagged),
            Err(err) => {
                warn!(instance = %node.handle.id, error = %err, "failed to re-apply cluster tags");
            }
        }
    }
}

fn transition(node: &NodeSpec, state: NodeState) {
    debug!(
        instance = %node.handle.id,
        role = %node.role,
        index = ?node.container_index,
        %state,
        "node state"
    );
}

fn node_result(
    node: &NodeSpec,
    instance: &ResolvedInstance,
    status: DeploymentStatus,
    detail: Option<String>,
    retry: RetryState,
) -> DeploymentResult {
    DeploymentResult {
        role: node.role,
        container_index: node.container_index,
        instance_id: node.handle.id.clone(),
        address: instance.ip,
        dns_name: instance.dns_name.clone(),
        status,
        detail,
        attempts: retry.used(),
    }
}

/// Maps provisioning failures outside the retry loop to fatal errors.
pub(crate) fn fatal<E>(err: ProvisionError<E>, waited: Duration) -> DeployError<E>
where
    E: std::error::Error + 'static,
{
    match err {
        ProvisionError::Provider(source) => DeployError::Provider(source),
        ProvisionError::Shortfall {
            requested,
            received,
        } => DeployError::ProvisionShortfall {
            requested,
            received,
        },
        ProvisionError::Unresolved { instance_id } => DeployError::ProvisionTimeout {
            source: ReadinessTimeout {
                target: format!("public address of {instance_id}"),
                waited,
            },
            instance_id,
        },
    }
}

async fn run_blocking<T, F>(operation: F) -> Result<T, RemoteExecError>
where
    F: FnOnce() -> Result<T, RemoteExecError> + Send + 'static,
    T: Send + 'static,
{
    spawn_blocking(operation)
        .await
        .unwrap_or_else(|err| {
            Err(RemoteExecError::Spawn {
                program: String::from("blocking worker"),
                message: err.to_string(),
            })
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retry_state_is_bounded() {
        let mut retry = RetryState::new(3);
        let mut claimed = 0;
        while retry.begin() {
            claimed += 1;
        }
        assert_eq!(claimed, 3);
        assert_eq!(retry.used(), 3);
        assert!(!retry.begin());
        assert_eq!(retry.used(), 3);
    }

    #[test]
    fn unresolved_instances_become_provision_timeouts() {
        let err: DeployError<std::io::Error> = fatal(
            ProvisionError::Unresolved {
                instance_id: String::from("srv-1"),
            },
            Duration::from_secs(30),
        );
        assert!(
            matches!(err, DeployError::ProvisionTimeout { ref instance_id, .. } if instance_id == "srv-1"),
            "{err}"
        );
    }
}
