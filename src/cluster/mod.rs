//! Typed, validated cluster description consumed by the deployer.
//!
//! [`ClusterConfig`] is built once from [`ClusterSettings`], the provider
//! configuration and the application properties, and is never mutated
//! afterwards. Workers share it behind an `Arc`.

mod address;

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use camino::Utf8PathBuf;

use crate::config::{ClusterSettings, ConfigError, ScalewayConfig, require_field};
use crate::properties::Properties;
use crate::provider::LaunchSpec;

pub use address::{ServiceAddress, parse_address_list};

/// Extra seconds added to the container fan-out deadline.
const AGGREGATE_GRACE_SECS: u64 = 5;
/// Upper bound on the SSH connection timeout derived from the infra timeout.
const MAX_SSH_CONNECT_SECS: u64 = 60;

/// Prefix of per-container property keys (`container<index>.KEY`).
pub const CONTAINER_OVERRIDE_PREFIX: &str = "container";

/// Deployment shape selected by the operator.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Topology {
    /// A single instance running every role.
    SingleNode,
    /// One admin instance plus a batch of container instances.
    MultiNode,
}

impl Topology {
    /// Parses the operator-facing topology flag.
    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "single-node" | "singlenode" | "single" => Some(Self::SingleNode),
            "multi-node" | "multinode" | "multi" => Some(Self::MultiNode),
            _ => None,
        }
    }
}

/// Machine size class mapped to a Scaleway commercial type.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum MachineSize {
    /// `DEV1-S`.
    Small,
    /// `DEV1-M`.
    Medium,
    /// `DEV1-L`.
    Large,
    /// `DEV1-XL`.
    XLarge,
}

impl MachineSize {
    /// Parses a size class name.
    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "small" => Some(Self::Small),
            "medium" => Some(Self::Medium),
            "large" => Some(Self::Large),
            "xlarge" => Some(Self::XLarge),
            _ => None,
        }
    }

    /// Returns the Scaleway commercial type for this size.
    #[must_use]
    pub const fn commercial_type(self) -> &'static str {
        match self {
            Self::Small => "DEV1-S",
            Self::Medium => "DEV1-M",
            Self::Large => "DEV1-L",
            Self::XLarge => "DEV1-XL",
        }
    }
}

/// Role played by a node in the cluster.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum Role {
    /// Standalone node running admin and container duties together.
    SingleNode,
    /// Admin node that containers register with.
    Admin,
    /// Worker container node.
    Container,
}

impl Role {
    /// Value written to the `Role` tag.
    #[must_use]
    pub const fn tag_value(self) -> &'static str {
        match self {
            Self::SingleNode => "SingleNode",
            Self::Admin => "Admin",
            Self::Container => "Container",
        }
    }

    /// Suffix of the launcher script for this role.
    #[must_use]
    pub const fn launcher_suffix(self) -> &'static str {
        match self {
            Self::SingleNode => "singlenode",
            Self::Admin => "admin",
            Self::Container => "container",
        }
    }

    /// Whether this role must verify dependent services before configuring.
    #[must_use]
    pub const fn checks_dependent_services(self) -> bool {
        matches!(self, Self::SingleNode | Self::Admin)
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag_value())
    }
}

/// Addresses of the services the application needs at startup.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct DependentServices {
    /// Cache replicas; any reachable replica is enough.
    pub cache: Vec<ServiceAddress>,
    /// Broker replicas; any reachable replica is enough.
    pub brokers: Vec<ServiceAddress>,
    /// Coordination replicas, or `None` when the embedded service is used.
    pub coordination: Option<Vec<ServiceAddress>>,
}

/// Where the application distribution comes from and how it is launched.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Distribution {
    /// URL of the distribution archive.
    pub url: String,
    /// Directory the archive unpacks into, relative to the remote home.
    pub release_dir: String,
    /// Skip the download step.
    pub skip_fetch: bool,
    /// Extra library URLs fetched into `<release>/lib`.
    pub extra_library_urls: Vec<String>,
    /// Optional distro argument passed to single-node and container
    /// launchers.
    pub launch_distro: Option<String>,
    /// Launcher script prefix under `<release>/bin`.
    pub launcher_prefix: String,
}

impl Distribution {
    /// File name of the archive, taken from the last URL path segment.
    #[must_use]
    pub fn archive_name(&self) -> &str {
        self.url
            .rsplit('/')
            .find(|segment| !segment.is_empty())
            .unwrap_or(self.url.as_str())
    }
}

/// Ports the deployer checks and reports.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct AppPorts {
    /// Management port of admin and single-node instances.
    pub admin: u16,
    /// Management port of container instances.
    pub container: u16,
    /// Application server port.
    pub server: u16,
}

impl AppPorts {
    /// Port that signals service readiness for `role`.
    #[must_use]
    pub const fn readiness_port(&self, role: Role) -> u16 {
        match role {
            Role::SingleNode | Role::Admin => self.admin,
            Role::Container => self.container,
        }
    }
}

/// Polling cadence and timeout budgets.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Timings {
    /// Interval between readiness checks.
    pub poll_interval: Duration,
    /// Budget for the instance to run and expose SSH.
    pub infra_timeout: Duration,
    /// Budget for the application port after each configuration attempt.
    pub service_timeout: Duration,
    /// Budget for dependent services.
    pub dependent_timeout: Duration,
    /// Seconds budgeted per attempt in the aggregate deadline.
    pub seconds_per_attempt: u64,
}

/// SSH client settings used by the remote executor.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SshSettings {
    /// `ssh` executable.
    pub ssh_bin: String,
    /// `scp` executable.
    pub scp_bin: String,
    /// Remote login user.
    pub user: String,
    /// SSH port.
    pub port: u16,
    /// Optional private key path.
    pub identity_file: Option<String>,
    /// Force non-interactive authentication.
    pub batch_mode: bool,
    /// Enforce host key checking.
    pub strict_host_key_checking: bool,
    /// Known hosts file override.
    pub known_hosts_file: String,
    /// Bound on establishing a connection.
    pub connect_timeout: Duration,
    /// Bound on a single remote script run; zero disables it.
    pub command_timeout: Duration,
}

/// Immutable cluster description.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ClusterConfig {
    /// Human cluster name.
    pub name: String,
    /// Operator recorded in tags.
    pub owner: String,
    /// Description recorded in tags.
    pub description: String,
    /// Deployment shape.
    pub topology: Topology,
    /// Number of container nodes (multi-node only).
    pub container_count: u32,
    /// Machine size class.
    pub machine_size: MachineSize,
    /// Provider launch parameters shared by every node.
    pub launch: LaunchSpec,
    /// Dependent service addresses.
    pub services: DependentServices,
    /// Distribution and launcher details.
    pub distribution: Distribution,
    /// Application ports.
    pub ports: AppPorts,
    /// Application properties, excluding per-container overrides.
    pub properties: Properties,
    /// Per-container overrides keyed by 1-based container index.
    pub container_overrides: BTreeMap<u32, Vec<(String, String)>>,
    /// Configure-and-verify attempts per node.
    pub retry_budget: u32,
    /// Readiness cadence and budgets.
    pub timings: Timings,
    /// SSH client settings.
    pub ssh: SshSettings,
    /// Home directory of the remote user.
    pub remote_home: String,
    /// Local payload copied to every node.
    pub payload_path: Utf8PathBuf,
}

impl ClusterConfig {
    /// Validates `settings` and assembles the typed configuration.
    ///
    /// Multi-node clusters always use the external coordination service, so
    /// the embedded flag is ignored for them.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] describing the first invalid or missing value.
    pub fn from_settings(
        settings: &ClusterSettings,
        scaleway: &ScalewayConfig,
        properties: Properties,
    ) -> Result<Self, ConfigError> {
        scaleway.validate()?;
        require_field(&settings.cluster_name, &meta::CLUSTER_NAME)?;
        require_field(&settings.owner, &meta::OWNER)?;

        let topology = Topology::parse(&settings.topology)
            .ok_or_else(|| meta::TOPOLOGY.invalid(&settings.topology, "single-node or multi-node"))?;
        if topology == Topology::MultiNode && settings.container_count == 0 {
            return Err(meta::CONTAINER_COUNT.invalid("0", "at least one container"));
        }
        let machine_size = MachineSize::parse(&settings.machine_size).ok_or_else(|| {
            meta::MACHINE_SIZE.invalid(&settings.machine_size, "small, medium, large or xlarge")
        })?;
        if settings.retry_budget == 0 {
            return Err(meta::RETRY_BUDGET.invalid("0", "at least one attempt"));
        }

        let services = Self::dependent_services(settings, topology)?;
        let distribution = Self::distribution(settings)?;
        let payload_path = settings
            .payload_path
            .as_deref()
            .filter(|path| !path.trim().is_empty())
            .map(Utf8PathBuf::from)
            .ok_or_else(|| meta::PAYLOAD.missing())?;

        let (app_properties, container_overrides) = split_container_overrides(properties);
        let ports = AppPorts {
            admin: settings.admin_port,
            container: property_port(&app_properties, "management.port")?
                .unwrap_or(settings.container_port),
            server: property_port(&app_properties, "server.port")?.unwrap_or(settings.server_port),
        };

        let launch = LaunchSpec::builder()
            .image_label(&scaleway.default_image)
            .instance_type(machine_size.commercial_type())
            .zone(&scaleway.default_zone)
            .project_id(&scaleway.default_project_id)
            .organisation_id(scaleway.default_organization_id.clone())
            .architecture(&scaleway.default_architecture)
            .security_group(settings.security_group.clone())
            .key_name(settings.key_name.clone())
            .name_prefix(format!("stratus-{}", settings.cluster_name.trim()))
            .build()
            .map_err(|err| ConfigError::Invalid(err.to_string()))?;

        Ok(Self {
            name: settings.cluster_name.trim().to_owned(),
            owner: settings.owner.trim().to_owned(),
            description: settings.description.clone(),
            topology,
            container_count: settings.container_count,
            machine_size,
            launch,
            services,
            distribution,
            ports,
            properties: app_properties,
            container_overrides,
            retry_budget: settings.retry_budget,
            timings: Timings {
                poll_interval: Duration::from_secs(settings.poll_interval_secs.max(1)),
                infra_timeout: Duration::from_secs(settings.infra_timeout_secs),
                service_timeout: Duration::from_secs(settings.service_timeout_secs),
                dependent_timeout: Duration::from_secs(settings.dependent_timeout_secs),
                seconds_per_attempt: settings.seconds_per_attempt,
            },
            ssh: SshSettings {
                ssh_bin: settings.ssh_bin.clone(),
                scp_bin: settings.scp_bin.clone(),
                user: settings.ssh_user.clone(),
                port: settings.ssh_port,
                identity_file: settings
                    .ssh_identity_file
                    .clone()
                    .filter(|path| !path.trim().is_empty()),
                batch_mode: settings.ssh_batch_mode,
                strict_host_key_checking: settings.ssh_strict_host_key_checking,
                known_hosts_file: settings.ssh_known_hosts_file.clone(),
                connect_timeout: Duration::from_secs(
                    settings.infra_timeout_secs.clamp(1, MAX_SSH_CONNECT_SECS),
                ),
                command_timeout: Duration::from_secs(settings.seconds_per_attempt),
            },
            remote_home: settings.remote_home.trim_end_matches('/').to_owned(),
            payload_path,
        })
    }

    fn dependent_services(
        settings: &ClusterSettings,
        topology: Topology,
    ) -> Result<DependentServices, ConfigError> {
        require_field(&settings.cache_address, &meta::CACHE)?;
        let cache = parse_address_list(&settings.cache_address)
            .map_err(|entry| meta::CACHE.invalid(&entry, "comma-delimited host:port list"))?;

        require_field(&settings.broker_addresses, &meta::BROKERS)?;
        let brokers = parse_address_list(&settings.broker_addresses)
            .map_err(|entry| meta::BROKERS.invalid(&entry, "comma-delimited host:port list"))?;

        let embedded = settings.embedded_coordination && topology == Topology::SingleNode;
        let coordination = if embedded {
            None
        } else {
            let raw = settings.coordination_addresses.as_deref().unwrap_or_default();
            require_field(raw, &meta::COORDINATION)?;
            Some(
                parse_address_list(raw).map_err(|entry| {
                    meta::COORDINATION.invalid(&entry, "comma-delimited host:port list")
                })?,
            )
        };

        Ok(DependentServices {
            cache,
            brokers,
            coordination,
        })
    }

    fn distribution(settings: &ClusterSettings) -> Result<Distribution, ConfigError> {
        require_field(&settings.distribution_url, &meta::DISTRIBUTION_URL)?;
        require_field(&settings.release_dir, &meta::RELEASE_DIR)?;
        require_field(&settings.launcher_prefix, &meta::LAUNCHER_PREFIX)?;
        Ok(Distribution {
            url: settings.distribution_url.trim().to_owned(),
            release_dir: settings.release_dir.trim().trim_matches('/').to_owned(),
            skip_fetch: settings.skip_fetch,
            extra_library_urls: settings
                .extra_library_urls
                .as_deref()
                .map(|urls| {
                    urls.split(',')
                        .map(str::trim)
                        .filter(|url| !url.is_empty())
                        .map(str::to_owned)
                        .collect()
                })
                .unwrap_or_default(),
            launch_distro: settings
                .launch_distro
                .as_deref()
                .map(str::trim)
                .filter(|distro| !distro.is_empty())
                .map(str::to_owned),
            launcher_prefix: settings.launcher_prefix.trim().to_owned(),
        })
    }

    /// Remote directory holding the unpacked release.
    #[must_use]
    pub fn app_home(&self) -> String {
        format!("{}/{}", self.remote_home, self.distribution.release_dir)
    }

    /// Remote path the payload is copied to.
    #[must_use]
    pub fn remote_payload_path(&self) -> String {
        format!("{}/stratus", self.remote_home)
    }

    /// Overrides declared for the container with 1-based `index`.
    #[must_use]
    pub fn overrides_for(&self, index: u32) -> &[(String, String)] {
        self.container_overrides
            .get(&index)
            .map_or(&[], Vec::as_slice)
    }

    /// Deadline for the whole container fan-out:
    /// `(retry_budget + 1) * seconds_per_attempt + 5s`.
    #[must_use]
    pub fn aggregate_deadline(&self) -> Duration {
        let attempts = u64::from(self.retry_budget).saturating_add(1);
        Duration::from_secs(
            attempts
                .saturating_mul(self.timings.seconds_per_attempt)
                .saturating_add(AGGREGATE_GRACE_SECS),
        )
    }
}

/// Splits `container<i>.KEY` entries out of `properties`.
///
/// Keys whose index does not parse as a positive integer stay in the
/// application properties.
#[must_use]
pub fn split_container_overrides(
    properties: Properties,
) -> (Properties, BTreeMap<u32, Vec<(String, String)>>) {
    let mut remaining = Properties::new();
    let mut overrides: BTreeMap<u32, Vec<(String, String)>> = BTreeMap::new();
    for (key, value) in properties {
        match parse_override_key(&key) {
            Some((index, name)) => overrides
                .entry(index)
                .or_default()
                .push((name.to_owned(), value)),
            None => {
                remaining.insert(key, value);
            }
        }
    }
    (remaining, overrides)
}

fn parse_override_key(key: &str) -> Option<(u32, &str)> {
    let rest = key.strip_prefix(CONTAINER_OVERRIDE_PREFIX)?;
    let (index, name) = rest.split_once('.')?;
    let parsed = index.parse::<u32>().ok().filter(|value| *value > 0)?;
    (!name.is_empty()).then_some((parsed, name))
}

fn property_port(properties: &Properties, key: &str) -> Result<Option<u16>, ConfigError> {
    properties
        .get(key)
        .map(|raw| {
            raw.trim().parse::<u16>().map_err(|_| {
                ConfigError::Invalid(format!("property {key} must be a port number, got `{raw}`"))
            })
        })
        .transpose()
}

mod meta {
    use crate::config::FieldMetadata;

    pub(super) const CLUSTER_NAME: FieldMetadata = FieldMetadata::new(
        "cluster name",
        "STRATUS_CLUSTER_NAME",
        "cluster_name",
        "cluster",
    );
    pub(super) const OWNER: FieldMetadata =
        FieldMetadata::new("cluster owner", "STRATUS_OWNER", "owner", "cluster");
    pub(super) const TOPOLOGY: FieldMetadata =
        FieldMetadata::new("topology", "STRATUS_TOPOLOGY", "topology", "cluster");
    pub(super) const CONTAINER_COUNT: FieldMetadata = FieldMetadata::new(
        "container count",
        "STRATUS_CONTAINER_COUNT",
        "container_count",
        "cluster",
    );
    pub(super) const MACHINE_SIZE: FieldMetadata = FieldMetadata::new(
        "machine size",
        "STRATUS_MACHINE_SIZE",
        "machine_size",
        "cluster",
    );
    pub(super) const RETRY_BUDGET: FieldMetadata = FieldMetadata::new(
        "retry budget",
        "STRATUS_RETRY_BUDGET",
        "retry_budget",
        "cluster",
    );
    pub(super) const CACHE: FieldMetadata = FieldMetadata::new(
        "cache address",
        "STRATUS_CACHE_ADDRESS",
        "cache_address",
        "services",
    );
    pub(super) const BROKERS: FieldMetadata = FieldMetadata::new(
        "broker addresses",
        "STRATUS_BROKER_ADDRESSES",
        "broker_addresses",
        "services",
    );
    pub(super) const COORDINATION: FieldMetadata = FieldMetadata::new(
        "coordination service addresses",
        "STRATUS_COORDINATION_ADDRESSES",
        "coordination_addresses",
        "services",
    );
    pub(super) const DISTRIBUTION_URL: FieldMetadata = FieldMetadata::new(
        "distribution URL",
        "STRATUS_DISTRIBUTION_URL",
        "distribution_url",
        "distribution",
    );
    pub(super) const RELEASE_DIR: FieldMetadata = FieldMetadata::new(
        "release directory",
        "STRATUS_RELEASE_DIR",
        "release_dir",
        "distribution",
    );
    pub(super) const LAUNCHER_PREFIX: FieldMetadata = FieldMetadata::new(
        "launcher prefix",
        "STRATUS_LAUNCHER_PREFIX",
        "launcher_prefix",
        "distribution",
    );
    pub(super) const PAYLOAD: FieldMetadata = FieldMetadata::new(
        "deployment payload",
        "STRATUS_PAYLOAD_PATH",
        "payload_path",
        "ssh",
    );
}
