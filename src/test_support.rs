//! Test support utilities shared across unit and integration tests.
//!
//! The doubles here are `Send + Sync` so they can be driven through the
//! deployer's worker pool exactly like the real implementations.

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::env;
use std::ffi::OsString;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::{Arc, Mutex, PoisonError};

use camino::Utf8Path;
use thiserror::Error;
use tokio::sync::{Mutex as AsyncMutex, MutexGuard as AsyncMutexGuard};

use crate::cluster::{ClusterConfig, Topology};
use crate::config::{ClusterSettings, ScalewayConfig};
use crate::properties::Properties;
use crate::provider::{
    ComputeProvider, InstanceDescription, InstanceHandle, InstanceState, LaunchSpec,
    ProviderFuture, Tags,
};
use crate::readiness::{PortCheck, PortCheckFuture};
use crate::remote::{
    CommandOutput, CommandRunner, ExecOutput, RemoteExecError, RemoteExecutor, RemoteTarget,
};

fn locked<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Scripted command runner that returns pre-seeded outputs in FIFO order.
///
/// Used to drive deterministic command outcomes without spawning processes.
#[derive(Clone, Debug, Default)]
pub struct ScriptedRunner {
    responses: Arc<Mutex<VecDeque<CommandOutput>>>,
    invocations: Arc<Mutex<Vec<CommandInvocation>>>,
}

/// Records a single invocation made through [`ScriptedRunner`].
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CommandInvocation {
    /// Program name as passed to the runner.
    pub program: String,
    /// Arguments passed to the program.
    pub args: Vec<OsString>,
}

impl CommandInvocation {
    /// Returns a shell-like command string for assertions.
    #[must_use]
    pub fn command_string(&self) -> String {
        let mut parts = Vec::with_capacity(self.args.len() + 1);
        parts.push(self.program.clone());
        parts.extend(
            self.args
                .iter()
                .map(|arg| arg.to_string_lossy().into_owned()),
        );
        parts.join(" ")
    }
}

impl ScriptedRunner {
    /// Creates a new runner with no queued responses.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a snapshot of all invocations recorded so far.
    #[must_use]
    pub fn invocations(&self) -> Vec<CommandInvocation> {
        locked(&self.invocations).clone()
    }

    /// Pushes a successful exit status.
    pub fn push_success(&self) {
        self.push_output(Some(0), "", "");
    }

    /// Pushes an explicit command output response.
    pub fn push_output(
        &self,
        code: Option<i32>,
        stdout: impl Into<String>,
        stderr: impl Into<String>,
    ) {
        locked(&self.responses).push_back(CommandOutput {
            code,
            stdout: stdout.into(),
            stderr: stderr.into(),
        });
    }
}

impl CommandRunner for ScriptedRunner {
    fn run(&self, program: &str, args: &[OsString]) -> Result<CommandOutput, RemoteExecError> {
        locked(&self.invocations).push(CommandInvocation {
            program: program.to_owned(),
            args: args.to_vec(),
        });
        locked(&self.responses)
            .pop_front()
            .ok_or_else(|| RemoteExecError::Spawn {
                program: program.to_owned(),
                message: String::from("no scripted response available"),
            })
    }
}

/// Errors raised by [`ScriptedProvider`].
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum ScriptedProviderError {
    /// The instance is not known to the double.
    #[error("unknown instance {0}")]
    UnknownInstance(String),
    /// Tagging was configured to fail.
    #[error("tagging rejected for {0}")]
    TaggingRejected(String),
    /// Launching was configured to fail.
    #[error("launch rejected")]
    LaunchRejected,
}

#[derive(Clone, Debug)]
struct FakeInstance {
    handle: InstanceHandle,
    state: InstanceState,
    pending: Option<(u32, InstanceState)>,
    describes: u32,
    public_ip: Option<IpAddr>,
    tags: Tags,
    terminated: bool,
}

#[derive(Debug, Default)]
struct ProviderState {
    instances: Vec<FakeInstance>,
    next_octet: u8,
    batch_limit: Option<u32>,
    reject_launch: bool,
    reject_tagging: bool,
    launch_state: Option<InstanceState>,
    user_data: Vec<String>,
    tag_calls: Vec<(String, Tags)>,
}

impl ProviderState {
    fn insert(&mut self, id: &str, state: InstanceState) -> InstanceHandle {
        self.next_octet = self.next_octet.wrapping_add(1);
        let handle = InstanceHandle {
            id: id.to_owned(),
            zone: String::from("fr-par-1"),
        };
        self.instances.push(FakeInstance {
            handle: handle.clone(),
            state,
            pending: None,
            describes: 0,
            public_ip: Some(IpAddr::V4(Ipv4Addr::new(10, 0, 0, self.next_octet))),
            tags: Tags::new(),
            terminated: false,
        });
        handle
    }

    fn find(&mut self, id: &str) -> Result<&mut FakeInstance, ScriptedProviderError> {
        self.instances
            .iter_mut()
            .find(|instance| instance.handle.id == id && !instance.terminated)
            .ok_or_else(|| ScriptedProviderError::UnknownInstance(id.to_owned()))
    }
}

/// In-memory [`ComputeProvider`] whose instances start running immediately
/// unless told otherwise.
#[derive(Clone, Debug, Default)]
pub struct ScriptedProvider {
    state: Arc<Mutex<ProviderState>>,
}

impl ScriptedProvider {
    /// Creates an empty provider.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers an instance with the given id and state.
    pub fn add_instance(&self, id: &str, state: InstanceState) -> InstanceHandle {
        locked(&self.state).insert(id, state)
    }

    /// Switches `id` to `state` after `describes` further describe calls.
    pub fn set_state_after(&self, id: &str, describes: u32, state: InstanceState) {
        if let Ok(instance) = locked(&self.state).find(id) {
            let threshold = instance.describes.saturating_add(describes);
            instance.pending = Some((threshold, state));
        }
    }

    /// Makes future launches return at most `limit` instances.
    pub fn limit_batch(&self, limit: u32) {
        locked(&self.state).batch_limit = Some(limit);
    }

    /// Makes future launches start in `state` instead of running.
    pub fn launch_in_state(&self, state: InstanceState) {
        locked(&self.state).launch_state = Some(state);
    }

    /// Makes future launches fail.
    pub fn reject_launches(&self) {
        locked(&self.state).reject_launch = true;
    }

    /// Makes every tagging request fail.
    pub fn reject_tagging(&self) {
        locked(&self.state).reject_tagging = true;
    }

    /// Removes the public address of `id`.
    pub fn clear_address(&self, id: &str) {
        if let Ok(instance) = locked(&self.state).find(id) {
            instance.public_ip = None;
        }
    }

    /// Startup scripts passed to every launch call, in order.
    #[must_use]
    pub fn user_data(&self) -> Vec<String> {
        locked(&self.state).user_data.clone()
    }

    /// Current tags on `id`.
    #[must_use]
    pub fn tags_for(&self, id: &str) -> Tags {
        locked(&self.state)
            .instances
            .iter()
            .find(|instance| instance.handle.id == id)
            .map(|instance| instance.tags.clone())
            .unwrap_or_default()
    }

    /// Every tag request made for `id`, in order.
    #[must_use]
    pub fn tag_history(&self, id: &str) -> Vec<Tags> {
        locked(&self.state)
            .tag_calls
            .iter()
            .filter(|(instance, _)| instance == id)
            .map(|(_, tags)| tags.clone())
            .collect()
    }

    /// Ids of terminated instances.
    #[must_use]
    pub fn terminated(&self) -> Vec<String> {
        locked(&self.state)
            .instances
            .iter()
            .filter(|instance| instance.terminated)
            .map(|instance| instance.handle.id.clone())
            .collect()
    }

    /// Ids of every instance ever launched or registered.
    #[must_use]
    pub fn instance_ids(&self) -> Vec<String> {
        locked(&self.state)
            .instances
            .iter()
            .map(|instance| instance.handle.id.clone())
            .collect()
    }
}

impl ComputeProvider for ScriptedProvider {
    type Error = ScriptedProviderError;

    fn run_instances<'a>(
        &'a self,
        _spec: &'a LaunchSpec,
        startup_script: &'a str,
        count: u32,
    ) -> ProviderFuture<'a, Vec<InstanceHandle>, Self::Error> {
        Box::pin(async move {
            let mut state = locked(&self.state);
            if state.reject_launch {
                return Err(ScriptedProviderError::LaunchRejected);
            }
            state.user_data.push(startup_script.to_owned());
            let granted = state.batch_limit.map_or(count, |limit| limit.min(count));
            let mut handles = Vec::new();
            let boot_state = state.launch_state.clone().unwrap_or(InstanceState::Running);
            for _ in 0..granted {
                let id = format!("srv-{}", state.instances.len().saturating_add(1));
                handles.push(state.insert(&id, boot_state.clone()));
            }
            Ok(handles)
        })
    }

    fn describe_instance<'a>(
        &'a self,
        handle: &'a InstanceHandle,
    ) -> ProviderFuture<'a, InstanceDescription, Self::Error> {
        Box::pin(async move {
            let mut state = locked(&self.state);
            let instance = state.find(&handle.id)?;
            instance.describes = instance.describes.saturating_add(1);
            if let Some((threshold, next)) = instance.pending.clone()
                && instance.describes > threshold
            {
                instance.state = next;
                instance.pending = None;
            }
            Ok(InstanceDescription {
                handle: instance.handle.clone(),
                state: instance.state.clone(),
                public_ip: instance.public_ip,
                dns_name: instance
                    .public_ip
                    .map(|_| format!("{}.pub.example", instance.handle.id)),
                tags: instance.tags.clone(),
            })
        })
    }

    fn tag_instance<'a>(
        &'a self,
        handle: &'a InstanceHandle,
        tags: &'a Tags,
    ) -> ProviderFuture<'a, (), Self::Error> {
        Box::pin(async move {
            let mut state = locked(&self.state);
            if state.reject_tagging {
                return Err(ScriptedProviderError::TaggingRejected(handle.id.clone()));
            }
            state.tag_calls.push((handle.id.clone(), tags.clone()));
            state.find(&handle.id)?.tags.merge(tags);
            Ok(())
        })
    }

    fn find_tagged<'a>(
        &'a self,
        zone: &'a str,
        key: &'a str,
        value: &'a str,
    ) -> ProviderFuture<'a, Vec<InstanceHandle>, Self::Error> {
        Box::pin(async move {
            Ok(locked(&self.state)
                .instances
                .iter()
                .filter(|instance| {
                    !instance.terminated
                        && instance.handle.zone == zone
                        && instance.tags.get(key) == Some(value)
                })
                .map(|instance| instance.handle.clone())
                .collect())
        })
    }

    fn terminate_instances<'a>(
        &'a self,
        handles: &'a [InstanceHandle],
    ) -> ProviderFuture<'a, (), Self::Error> {
        Box::pin(async move {
            let mut state = locked(&self.state);
            for handle in handles {
                state.find(&handle.id)?.terminated = true;
            }
            Ok(())
        })
    }
}

#[derive(Clone, Copy, Debug)]
enum PortBehaviour {
    Open,
    Closed,
    OpenAfter(u32),
}

#[derive(Debug, Default)]
struct PortState {
    default_open: bool,
    endpoints: HashMap<(String, u16), PortBehaviour>,
    attempts: HashMap<(String, u16), u32>,
}

/// [`PortCheck`] double with per-endpoint behaviour.
#[derive(Clone, Debug, Default)]
pub struct ScriptedPorts {
    state: Arc<Mutex<PortState>>,
}

impl ScriptedPorts {
    /// Creates a table in which every endpoint is closed.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a table in which every endpoint is open.
    #[must_use]
    pub fn all_open() -> Self {
        let ports = Self::default();
        locked(&ports.state).default_open = true;
        ports
    }

    fn set(&self, host: &str, port: u16, behaviour: PortBehaviour) {
        locked(&self.state)
            .endpoints
            .insert((host.to_owned(), port), behaviour);
    }

    /// Marks `host:port` as open.
    pub fn open(&self, host: &str, port: u16) {
        self.set(host, port, PortBehaviour::Open);
    }

    /// Marks `host:port` as permanently closed.
    pub fn close(&self, host: &str, port: u16) {
        self.set(host, port, PortBehaviour::Closed);
    }

    /// Opens `host:port` after `failures` closed checks.
    pub fn open_after(&self, host: &str, port: u16, failures: u32) {
        self.set(host, port, PortBehaviour::OpenAfter(failures));
    }

    /// Number of checks made against `host:port`.
    #[must_use]
    pub fn attempts(&self, host: &str, port: u16) -> u32 {
        locked(&self.state)
            .attempts
            .get(&(host.to_owned(), port))
            .copied()
            .unwrap_or_default()
    }
}

impl PortCheck for ScriptedPorts {
    fn is_open<'a>(&'a self, host: &'a str, port: u16) -> PortCheckFuture<'a> {
        Box::pin(async move {
            let mut state = locked(&self.state);
            let key = (host.to_owned(), port);
            let seen = state.attempts.get(&key).copied().unwrap_or_default();
            state.attempts.insert(key.clone(), seen.saturating_add(1));
            match state.endpoints.get(&key) {
                Some(PortBehaviour::Open) => true,
                Some(PortBehaviour::Closed) => false,
                Some(PortBehaviour::OpenAfter(failures)) => seen >= *failures,
                None => state.default_open,
            }
        })
    }
}

/// A script execution recorded by [`ScriptedExecutor`].
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ExecRecord {
    /// Instance the script ran on.
    pub instance_id: String,
    /// Host the script was addressed to.
    pub host: String,
    /// Script body.
    pub script: String,
}

#[derive(Debug, Default)]
struct ExecutorState {
    copies: Vec<RemoteTarget>,
    execs: Vec<ExecRecord>,
    failing_hosts: BTreeSet<String>,
    exit_codes: HashMap<String, i32>,
}

/// [`RemoteExecutor`] double that records copies and scripts.
#[derive(Clone, Debug, Default)]
pub struct ScriptedExecutor {
    state: Arc<Mutex<ExecutorState>>,
}

impl ScriptedExecutor {
    /// Creates an executor for which every call succeeds.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every copy and exec against `host` fail at the transport level.
    pub fn fail_host(&self, host: &str) {
        locked(&self.state).failing_hosts.insert(host.to_owned());
    }

    /// Makes scripts on `host` exit with `code`.
    pub fn exit_with(&self, host: &str, code: i32) {
        locked(&self.state).exit_codes.insert(host.to_owned(), code);
    }

    /// Every recorded script execution.
    #[must_use]
    pub fn execs(&self) -> Vec<ExecRecord> {
        locked(&self.state).execs.clone()
    }

    /// Script executions against `instance_id`.
    #[must_use]
    pub fn execs_for(&self, instance_id: &str) -> Vec<ExecRecord> {
        locked(&self.state)
            .execs
            .iter()
            .filter(|record| record.instance_id == instance_id)
            .cloned()
            .collect()
    }

    /// Every recorded payload copy.
    #[must_use]
    pub fn copies(&self) -> Vec<RemoteTarget> {
        locked(&self.state).copies.clone()
    }

    fn transport_failure(target: &RemoteTarget) -> RemoteExecError {
        RemoteExecError::Transport {
            program: String::from("ssh"),
            host: target.host.clone(),
            status_text: String::from("255"),
            stderr: String::from("Connection refused"),
        }
    }
}

impl RemoteExecutor for ScriptedExecutor {
    fn copy(&self, _local: &Utf8Path, target: &RemoteTarget) -> Result<(), RemoteExecError> {
        let mut state = locked(&self.state);
        if state.failing_hosts.contains(&target.host) {
            return Err(Self::transport_failure(target));
        }
        state.copies.push(target.clone());
        Ok(())
    }

    fn exec(&self, script: &str, target: &RemoteTarget) -> Result<ExecOutput, RemoteExecError> {
        let mut state = locked(&self.state);
        state.execs.push(ExecRecord {
            instance_id: target.instance_id.clone(),
            host: target.host.clone(),
            script: script.to_owned(),
        });
        if state.failing_hosts.contains(&target.host) {
            return Err(Self::transport_failure(target));
        }
        Ok(ExecOutput {
            stdout: String::new(),
            stderr: String::new(),
            exit_status: Some(state.exit_codes.get(&target.host).copied().unwrap_or(0)),
        })
    }
}

/// Scaleway configuration with placeholder credentials.
#[must_use]
pub fn sample_scaleway() -> ScalewayConfig {
    ScalewayConfig {
        access_key: None,
        secret_key: String::from("SCWSECRETKEYEXAMPLE"),
        default_organization_id: None,
        default_project_id: String::from("11111111-2222-3333-4444-555555555555"),
        default_zone: String::from("fr-par-1"),
        default_image: String::from("Ubuntu 24.04 Noble Numbat"),
        default_architecture: String::from("x86_64"),
    }
}

/// Launch spec matching [`sample_scaleway`].
#[must_use]
pub fn sample_launch_spec() -> LaunchSpec {
    LaunchSpec {
        image_label: String::from("Ubuntu 24.04 Noble Numbat"),
        instance_type: String::from("DEV1-M"),
        zone: String::from("fr-par-1"),
        project_id: String::from("11111111-2222-3333-4444-555555555555"),
        organisation_id: None,
        architecture: String::from("x86_64"),
        security_group: Some(String::from("sg-stratus")),
        key_name: Some(String::from("ops-key")),
        name_prefix: String::from("stratus-demo"),
    }
}

/// Valid multi-node settings with three medium containers.
#[must_use]
pub fn sample_settings() -> ClusterSettings {
    ClusterSettings {
        cluster_name: String::from("demo"),
        owner: String::from("ops"),
        description: String::from("stratus cluster"),
        topology: String::from("multi-node"),
        container_count: 3,
        machine_size: String::from("medium"),
        security_group: Some(String::from("sg-stratus")),
        key_name: Some(String::from("ops-key")),
        cache_address: String::from("cache.internal:6379"),
        broker_addresses: String::from("mq1.internal:5672,mq2.internal:5672"),
        coordination_addresses: Some(String::from("zk1.internal:2181,zk2.internal:2181")),
        embedded_coordination: true,
        distribution_url: String::from("https://downloads.example.com/releases/app-1.0.zip"),
        release_dir: String::from("app-1.0"),
        skip_fetch: false,
        extra_library_urls: None,
        launch_distro: None,
        launcher_prefix: String::from("app"),
        admin_port: 9393,
        container_port: 9394,
        server_port: 8080,
        retry_budget: 3,
        seconds_per_attempt: 300,
        poll_interval_secs: 1,
        infra_timeout_secs: 300,
        service_timeout_secs: 300,
        dependent_timeout_secs: 180,
        ssh_bin: String::from("ssh"),
        scp_bin: String::from("scp"),
        ssh_user: String::from("root"),
        ssh_port: 22,
        ssh_identity_file: None,
        ssh_batch_mode: true,
        ssh_strict_host_key_checking: false,
        ssh_known_hosts_file: String::from("/dev/null"),
        remote_home: String::from("/root"),
        payload_path: Some(String::from("/usr/local/bin/stratus")),
        properties_file: None,
    }
}

/// Application properties used by [`sample_cluster`].
#[must_use]
pub fn sample_properties() -> Properties {
    [
        ("container1.APP_ROLE", "sink"),
        ("container2.APP_ROLE", "ingest"),
        ("server.port", "9000"),
        ("internal.secret", "hunter2"),
    ]
    .into_iter()
    .map(|(key, value)| (key.to_owned(), value.to_owned()))
    .collect()
}

/// Builds a validated cluster from [`sample_settings`] with the given shape.
///
/// # Panics
///
/// Panics if the sample settings fail validation, which indicates a broken
/// fixture.
#[must_use]
pub fn sample_cluster(topology: Topology, containers: u32) -> ClusterConfig {
    let mut settings = sample_settings();
    settings.topology = String::from(match topology {
        Topology::SingleNode => "single-node",
        Topology::MultiNode => "multi-node",
    });
    settings.container_count = containers;
    ClusterConfig::from_settings(&settings, &sample_scaleway(), sample_properties())
        .unwrap_or_else(|err| panic!("sample cluster settings must validate: {err}"))
}

/// Global mutex used to serialise environment mutation in tests.
pub static ENV_LOCK: AsyncMutex<()> = AsyncMutex::const_new(());

/// Guard that holds the env mutex and cleans up variables on drop.
pub struct EnvGuard {
    previous: Vec<(String, Option<OsString>)>,
    _guard: AsyncMutexGuard<'static, ()>,
}

impl EnvGuard {
    /// Sets multiple environment variables while holding a global mutex.
    pub async fn set_vars(pairs: &[(&str, &str)]) -> Self {
        debug_assert!(
            {
                let mut seen = BTreeSet::new();
                pairs.iter().all(|(key, _)| seen.insert(*key))
            },
            "duplicate environment variable keys passed to EnvGuard::set_vars"
        );

        let guard = ENV_LOCK.lock().await;
        let mut previous = Vec::with_capacity(pairs.len());
        for (key, value) in pairs {
            let old = env::var_os(key);
            // SAFETY: Environment mutation is serialised by `ENV_LOCK`, preventing races.
            unsafe { env::set_var(key, value) };
            previous.push(((*key).to_owned(), old));
        }

        Self {
            previous,
            _guard: guard,
        }
    }
}

impl Drop for EnvGuard {
    fn drop(&mut self) {
        for (key, old) in &self.previous {
            // SAFETY: Environment mutation is serialised by holding `_guard`.
            unsafe {
                match old {
                    Some(val) => env::set_var(key, val),
                    None => env::remove_var(key),
                }
            }
        }
    }
}
