//! Core library for the stratus cluster deployer.
//!
//! The crate turns a declarative cluster description into running instances:
//! a [`ComputeProvider`] acquires and labels machines, the
//! [`ReadinessChecker`] waits for them and their dependent services to
//! answer, a [`RemoteExecutor`] pushes the payload and setup script, and the
//! [`Orchestrator`] drives every node through a bounded retry loop before
//! reporting one [`DeploymentResult`] per node.

pub mod cluster;
pub mod config;
pub mod distribution;
pub mod orchestrator;
pub mod properties;
pub mod provider;
pub mod provisioner;
pub mod readiness;
pub mod remote;
pub mod remote_env;
pub mod report;
pub mod scaleway;
pub mod script;
pub mod teardown;
pub mod test_support;

pub use cluster::{
    AppPorts, ClusterConfig, DependentServices, Distribution, MachineSize, Role, ServiceAddress,
    SshSettings, Timings, Topology,
};
pub use config::{CONFIG_FILE_NAME, ClusterSettings, ConfigError, ScalewayConfig};
pub use distribution::verify_distribution;
pub use orchestrator::{
    AttemptError, DeployError, DeploymentResult, DeploymentStatus, Orchestrator, WorkerPool,
};
pub use properties::{Properties, load_properties, parse_properties};
pub use provider::{
    ComputeProvider, InstanceDescription, InstanceHandle, InstanceState, LaunchSpec, Tags,
};
pub use provisioner::{InstanceProvisioner, ProvisionError, ResolvedInstance};
pub use readiness::{PortCheck, ReadinessChecker, ReadinessTimeout, TcpPortCheck};
pub use remote::{
    CommandOutput, CommandRunner, ProcessCommandRunner, RemoteExecError, RemoteExecutor,
    SshExecutor, expand_tilde,
};
pub use report::{ARTIFACT_FILE_NAME, DeploymentReport, ReportError, remove_stale_artifact};
pub use scaleway::{ScalewayProvider, ScalewayProviderError};
pub use script::{HostContext, ScriptBuilder};
pub use teardown::{ClusterTeardown, TeardownError, TeardownSummary};
