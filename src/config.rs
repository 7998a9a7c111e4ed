//! Configuration loading via `ortho-config`.
//!
//! Two layered configuration structs are exposed: [`ScalewayConfig`] carries
//! provider credentials and image defaults, while [`ClusterSettings`] carries
//! the raw cluster description. Both merge defaults, `stratus.toml` and
//! environment variables; [`crate::cluster::ClusterConfig::from_settings`]
//! turns the raw settings into the typed configuration consumed by the
//! deployer.

use std::ffi::OsString;

use ortho_config::OrthoConfig;
use serde::Deserialize;
use thiserror::Error;

/// Name of the project configuration file consulted by the loaders.
pub const CONFIG_FILE_NAME: &str = "stratus.toml";

/// Scaleway specific configuration derived from environment variables and
/// configuration files.
#[derive(Clone, Debug, Deserialize, OrthoConfig, PartialEq, Eq)]
#[ortho_config(prefix = "SCW")]
pub struct ScalewayConfig {
    /// Access key assigned to the Scaleway application. Not required for API
    /// calls.
    pub access_key: Option<String>,
    /// Secret key used for authentication. This value is required.
    pub secret_key: String,
    /// Organisation identifier used by some Scaleway endpoints.
    pub default_organization_id: Option<String>,
    /// Project identifier used for billing and resource scoping.
    pub default_project_id: String,
    /// Preferred availability zone. Defaults to `fr-par-1`.
    #[ortho_config(default = "fr-par-1".to_owned())]
    pub default_zone: String,
    /// Human-friendly image label (for example `Ubuntu 24.04 Noble Numbat`).
    #[ortho_config(default = "Ubuntu 24.04 Noble Numbat".to_owned())]
    pub default_image: String,
    /// CPU architecture used to select the correct image variant.
    #[ortho_config(default = "x86_64".to_owned())]
    pub default_architecture: String,
}

/// Metadata for a configuration field, used to generate actionable error
/// messages.
pub(crate) struct FieldMetadata {
    description: &'static str,
    env_var: &'static str,
    toml_key: &'static str,
    section: &'static str,
}

impl FieldMetadata {
    pub(crate) const fn new(
        description: &'static str,
        env_var: &'static str,
        toml_key: &'static str,
        section: &'static str,
    ) -> Self {
        Self {
            description,
            env_var,
            toml_key,
            section,
        }
    }

    /// Builds a [`ConfigError::MissingField`] describing how to supply the
    /// field.
    pub(crate) fn missing(&self) -> ConfigError {
        ConfigError::MissingField(format!(
            "missing {}: set {} or add {} to [{}] in {CONFIG_FILE_NAME}",
            self.description, self.env_var, self.toml_key, self.section
        ))
    }

    /// Builds a [`ConfigError::Invalid`] for a value that failed to parse.
    pub(crate) fn invalid(&self, value: &str, expected: &str) -> ConfigError {
        ConfigError::Invalid(format!(
            "invalid {} `{value}` (expected {expected}): check {} or {} in [{}] of {CONFIG_FILE_NAME}",
            self.description, self.env_var, self.toml_key, self.section
        ))
    }
}

/// Rejects empty or whitespace-only values for required fields.
pub(crate) fn require_field(value: &str, metadata: &FieldMetadata) -> Result<(), ConfigError> {
    if value.trim().is_empty() {
        return Err(metadata.missing());
    }
    Ok(())
}

impl ScalewayConfig {
    /// Loads configuration without attempting to parse CLI arguments. Values
    /// merge defaults, configuration files and environment variables.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] when the merge fails.
    pub fn load_without_cli_args() -> Result<Self, ConfigError> {
        Self::load_from_iter([OsString::from("stratus")])
            .map_err(|err| ConfigError::Parse(err.to_string()))
    }

    /// Performs semantic validation on required fields. Error messages include
    /// guidance on how to provide missing values via environment variables or
    /// configuration files.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::MissingField`] when a required field is empty.
    pub fn validate(&self) -> Result<(), ConfigError> {
        require_field(
            &self.secret_key,
            &FieldMetadata::new(
                "Scaleway API secret key",
                "SCW_SECRET_KEY",
                "secret_key",
                "scaleway",
            ),
        )?;
        require_field(
            &self.default_project_id,
            &FieldMetadata::new(
                "Scaleway project ID",
                "SCW_DEFAULT_PROJECT_ID",
                "default_project_id",
                "scaleway",
            ),
        )?;
        require_field(
            &self.default_image,
            &FieldMetadata::new("VM image", "SCW_DEFAULT_IMAGE", "default_image", "scaleway"),
        )?;
        require_field(
            &self.default_zone,
            &FieldMetadata::new(
                "availability zone",
                "SCW_DEFAULT_ZONE",
                "default_zone",
                "scaleway",
            ),
        )?;
        require_field(
            &self.default_architecture,
            &FieldMetadata::new(
                "CPU architecture",
                "SCW_DEFAULT_ARCHITECTURE",
                "default_architecture",
                "scaleway",
            ),
        )?;
        Ok(())
    }
}

/// Raw cluster description loaded via `ortho-config`.
///
/// Values are validated and converted into a
/// [`crate::cluster::ClusterConfig`] before any provisioning occurs.
#[derive(Clone, Debug, Deserialize, OrthoConfig, PartialEq, Eq)]
#[ortho_config(
    prefix = "STRATUS",
    discovery(
        app_name = "stratus",
        env_var = "STRATUS_CONFIG_PATH",
        config_file_name = "stratus.toml",
        dotfile_name = ".stratus.toml",
        project_file_name = "stratus.toml"
    )
)]
#[expect(
    clippy::struct_excessive_bools,
    reason = "configuration struct with user-facing toggle settings that are naturally expressed as booleans"
)]
pub struct ClusterSettings {
    /// Human cluster name applied as the final `Name` tag.
    #[ortho_config(default = String::new())]
    pub cluster_name: String,
    /// Operator recorded in the `Owner` tag.
    #[ortho_config(default = String::new())]
    pub owner: String,
    /// Free-form description recorded in the `Description` tag.
    #[ortho_config(default = "stratus cluster".to_owned())]
    pub description: String,
    /// Either `single-node` or `multi-node`.
    #[ortho_config(default = "single-node".to_owned())]
    pub topology: String,
    /// Number of container nodes requested for a multi-node cluster.
    #[ortho_config(default = 1)]
    pub container_count: u32,
    /// Machine size class: `small`, `medium`, `large` or `xlarge`.
    #[ortho_config(default = "small".to_owned())]
    pub machine_size: String,
    /// Security group attached to every instance.
    pub security_group: Option<String>,
    /// SSH key pair name recorded on the instances.
    pub key_name: Option<String>,
    /// Comma-delimited cache `host:port` list.
    #[ortho_config(default = String::new())]
    pub cache_address: String,
    /// Comma-delimited broker `host:port` list.
    #[ortho_config(default = String::new())]
    pub broker_addresses: String,
    /// Comma-delimited coordination service `host:port` list. Required unless
    /// the embedded coordination service is used.
    pub coordination_addresses: Option<String>,
    /// Whether the application runs its own embedded coordination service.
    /// Multi-node clusters always use the external service.
    #[ortho_config(default = true)]
    pub embedded_coordination: bool,
    /// URL of the application distribution archive.
    #[ortho_config(default = String::new())]
    pub distribution_url: String,
    /// Directory the distribution archive unpacks into, relative to the
    /// remote home directory.
    #[ortho_config(default = String::new())]
    pub release_dir: String,
    /// Skip downloading the distribution (it is already on the image).
    #[ortho_config(default = false)]
    pub skip_fetch: bool,
    /// Comma-delimited URLs of extra libraries fetched into the release.
    pub extra_library_urls: Option<String>,
    /// Optional distribution argument passed to the single-node and container
    /// launchers.
    pub launch_distro: Option<String>,
    /// Prefix of the launcher scripts under `<release>/bin`.
    #[ortho_config(default = "app".to_owned())]
    pub launcher_prefix: String,
    /// Management port checked on admin and single-node instances.
    #[ortho_config(default = 9393)]
    pub admin_port: u16,
    /// Management port checked on container instances. A `management.port`
    /// application property takes precedence.
    #[ortho_config(default = 9394)]
    pub container_port: u16,
    /// Application server port recorded in the deployment artifact. A
    /// `server.port` application property takes precedence.
    #[ortho_config(default = 8080)]
    pub server_port: u16,
    /// Number of configure-and-verify attempts per node.
    #[ortho_config(default = 3)]
    pub retry_budget: u32,
    /// Seconds budgeted for each attempt when computing the aggregate
    /// container deadline.
    #[ortho_config(default = 300)]
    pub seconds_per_attempt: u64,
    /// Interval between readiness checks, in seconds.
    #[ortho_config(default = 1)]
    pub poll_interval_secs: u64,
    /// Budget for an instance to reach running and open SSH, in seconds.
    #[ortho_config(default = 300)]
    pub infra_timeout_secs: u64,
    /// Budget for the application port to open after configuration, in
    /// seconds.
    #[ortho_config(default = 300)]
    pub service_timeout_secs: u64,
    /// Budget for dependent services to become reachable, in seconds.
    #[ortho_config(default = 180)]
    pub dependent_timeout_secs: u64,
    /// Path to the `ssh` executable.
    #[ortho_config(default = "ssh".to_owned())]
    pub ssh_bin: String,
    /// Path to the `scp` executable.
    #[ortho_config(default = "scp".to_owned())]
    pub scp_bin: String,
    /// Remote user to connect as.
    #[ortho_config(default = "root".to_owned())]
    pub ssh_user: String,
    /// SSH port on the instances.
    #[ortho_config(default = 22, cli_short = 'x')]
    pub ssh_port: u16,
    /// Private key used for SSH; supports `~/` expansion.
    pub ssh_identity_file: Option<String>,
    /// Whether to force batch mode for SSH to avoid password prompts.
    #[ortho_config(default = true)]
    pub ssh_batch_mode: bool,
    /// Whether to enforce host key checking.
    #[ortho_config(default = false)]
    pub ssh_strict_host_key_checking: bool,
    /// Known hosts file override; defaults to `/dev/null` for fresh hosts.
    #[ortho_config(default = "/dev/null".to_owned())]
    pub ssh_known_hosts_file: String,
    /// Home directory of the remote user.
    #[ortho_config(default = "/root".to_owned(), cli_short = 'z')]
    pub remote_home: String,
    /// Local deployment payload copied to every node. Defaults to the running
    /// `stratus` executable.
    pub payload_path: Option<String>,
    /// Optional properties file with application configuration entries.
    pub properties_file: Option<String>,
}

impl ClusterSettings {
    /// Loads settings without attempting to parse CLI arguments.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] when merging sources fails.
    pub fn load_without_cli_args() -> Result<Self, ConfigError> {
        Self::load_from_iter([OsString::from("stratus")])
            .map_err(|err| ConfigError::Parse(err.to_string()))
    }
}

/// Errors raised during configuration loading and validation.
#[derive(Debug, Error, Eq, PartialEq)]
pub enum ConfigError {
    /// Indicates a required configuration field is empty or missing.
    #[error("missing configuration field: {0}")]
    MissingField(String),
    /// Indicates a configuration value is present but malformed.
    #[error("invalid configuration value: {0}")]
    Invalid(String),
    /// Surfaces errors from the `ortho-config` loader.
    #[error("configuration parsing failed: {0}")]
    Parse(String),
    /// Raised when the properties file cannot be read.
    #[error("failed to read properties file {path}: {message}")]
    PropertiesRead {
        /// Path that was requested.
        path: String,
        /// Underlying I/O error text.
        message: String,
    },
    /// Raised when the distribution archive cannot be reached.
    #[error("distribution {url} is not reachable: {message}")]
    DistributionUnreachable {
        /// Distribution URL that was checked.
        url: String,
        /// Transport or status detail.
        message: String,
    },
}

impl From<ortho_config::OrthoError> for ConfigError {
    fn from(value: ortho_config::OrthoError) -> Self {
        Self::Parse(value.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::{fixture, rstest};

    #[fixture]
    fn scaleway() -> ScalewayConfig {
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

    #[rstest]
    fn accepts_complete_scaleway_config(scaleway: ScalewayConfig) {
        assert_eq!(scaleway.validate(), Ok(()));
    }

    #[rstest]
    #[case::secret(|cfg: &mut ScalewayConfig| cfg.secret_key.clear(), "SCW_SECRET_KEY", "secret_key")]
    #[case::project(|cfg: &mut ScalewayConfig| cfg.default_project_id = String::from("  "), "SCW_DEFAULT_PROJECT_ID", "default_project_id")]
    #[case::zone(|cfg: &mut ScalewayConfig| cfg.default_zone.clear(), "SCW_DEFAULT_ZONE", "default_zone")]
    fn missing_scaleway_fields_name_their_sources(
        mut scaleway: ScalewayConfig,
        #[case] mutate: fn(&mut ScalewayConfig),
        #[case] env_var: &str,
        #[case] toml_key: &str,
    ) {
        mutate(&mut scaleway);
        let message = scaleway
            .validate()
            .expect_err("validation should fail")
            .to_string();

        assert!(message.contains(env_var), "missing env var: {message}");
        assert!(message.contains(toml_key), "missing TOML key: {message}");
        assert!(message.contains(CONFIG_FILE_NAME), "missing file: {message}");
    }

    #[test]
    fn invalid_values_echo_the_rejected_input() {
        let metadata = FieldMetadata::new(
            "machine size",
            "STRATUS_MACHINE_SIZE",
            "machine_size",
            "cluster",
        );
        let message = metadata.invalid("huge", "small, medium, large or xlarge").to_string();

        assert!(message.contains("`huge`"), "message: {message}");
        assert!(message.contains("STRATUS_MACHINE_SIZE"), "message: {message}");
    }
}
