//! Compute provider abstraction for acquiring, inspecting, labelling and
//! terminating cluster instances.

use std::collections::BTreeMap;
use std::future::Future;
use std::net::IpAddr;
use std::pin::Pin;

use thiserror::Error;

/// Parameters shared by every instance requested for a cluster.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct LaunchSpec {
    /// Human readable label used for the boot image. The provider resolves
    /// this to a concrete image identifier.
    pub image_label: String,
    /// Commercial type or flavour to request (for example `DEV1-M`).
    pub instance_type: String,
    /// Target availability zone (for example `fr-par-1`).
    pub zone: String,
    /// Project identifier used for billing and ownership.
    pub project_id: String,
    /// Optional organisation identifier when the provider requires one.
    pub organisation_id: Option<String>,
    /// CPU architecture requested for the instance.
    pub architecture: String,
    /// Security group applied to new instances, when configured.
    pub security_group: Option<String>,
    /// Name of the SSH key pair operators use to reach the instances.
    pub key_name: Option<String>,
    /// Prefix used when generating instance names.
    pub name_prefix: String,
}

impl LaunchSpec {
    /// Starts a builder for a [`LaunchSpec`].
    #[must_use]
    pub fn builder() -> LaunchSpecBuilder {
        LaunchSpecBuilder::new()
    }

    /// Validates the spec, returning a descriptive error when a required
    /// field is missing.
    ///
    /// # Errors
    ///
    /// Returns [`ProviderError::Validation`] when any required string field is
    /// empty.
    pub fn validate(&self) -> Result<(), ProviderError> {
        for (value, field) in [
            (&self.image_label, "image_label"),
            (&self.instance_type, "instance_type"),
            (&self.zone, "zone"),
            (&self.project_id, "project_id"),
            (&self.architecture, "architecture"),
            (&self.name_prefix, "name_prefix"),
        ] {
            if value.is_empty() {
                return Err(ProviderError::Validation(field.to_owned()));
            }
        }
        Ok(())
    }
}

/// Builder for [`LaunchSpec`] that defers trimming and validation to
/// construction.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct LaunchSpecBuilder {
    image_label: String,
    instance_type: String,
    zone: String,
    project_id: String,
    organisation_id: Option<String>,
    architecture: String,
    security_group: Option<String>,
    key_name: Option<String>,
    name_prefix: String,
}

impl LaunchSpecBuilder {
    /// Creates an empty builder; fields must be populated before build.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the image label.
    #[must_use]
    pub fn image_label(mut self, value: impl Into<String>) -> Self {
        self.image_label = value.into();
        self
    }

    /// Sets the instance type.
    #[must_use]
    pub fn instance_type(mut self, value: impl Into<String>) -> Self {
        self.instance_type = value.into();
        self
    }

    /// Sets the availability zone.
    #[must_use]
    pub fn zone(mut self, value: impl Into<String>) -> Self {
        self.zone = value.into();
        self
    }

    /// Sets the project identifier.
    #[must_use]
    pub fn project_id(mut self, value: impl Into<String>) -> Self {
        self.project_id = value.into();
        self
    }

    /// Sets the optional organisation identifier.
    #[must_use]
    pub fn organisation_id(mut self, value: Option<String>) -> Self {
        self.organisation_id = value;
        self
    }

    /// Sets the architecture.
    #[must_use]
    pub fn architecture(mut self, value: impl Into<String>) -> Self {
        self.architecture = value.into();
        self
    }

    /// Sets the optional security group.
    #[must_use]
    pub fn security_group(mut self, value: Option<String>) -> Self {
        self.security_group = value;
        self
    }

    /// Sets the optional key pair name.
    #[must_use]
    pub fn key_name(mut self, value: Option<String>) -> Self {
        self.key_name = value;
        self
    }

    /// Sets the instance name prefix.
    #[must_use]
    pub fn name_prefix(mut self, value: impl Into<String>) -> Self {
        self.name_prefix = value.into();
        self
    }

    /// Builds and validates the [`LaunchSpec`], trimming string inputs.
    ///
    /// Optional values that trim to an empty string are dropped.
    ///
    /// # Errors
    ///
    /// Returns [`ProviderError::Validation`] when any required field is empty.
    pub fn build(self) -> Result<LaunchSpec, ProviderError> {
        let spec = LaunchSpec {
            image_label: self.image_label.trim().to_owned(),
            instance_type: self.instance_type.trim().to_owned(),
            zone: self.zone.trim().to_owned(),
            project_id: self.project_id.trim().to_owned(),
            organisation_id: trimmed_optional(self.organisation_id),
            architecture: self.architecture.trim().to_owned(),
            security_group: trimmed_optional(self.security_group),
            key_name: trimmed_optional(self.key_name),
            name_prefix: self.name_prefix.trim().to_owned(),
        };
        spec.validate()?;
        Ok(spec)
    }
}

fn trimmed_optional(value: Option<String>) -> Option<String> {
    value
        .map(|inner| inner.trim().to_owned())
        .filter(|inner| !inner.is_empty())
}

/// Handle returned by a provider once an instance has been requested.
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub struct InstanceHandle {
    /// Provider specific identifier for the instance.
    pub id: String,
    /// Zone in which the instance was created.
    pub zone: String,
}

/// Lifecycle state reported by the provider.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum InstanceState {
    /// The instance is booting or being allocated.
    Starting,
    /// The instance is running.
    Running,
    /// The instance is stopped or stopping.
    Stopped,
    /// Any other provider specific state.
    Other(String),
}

impl InstanceState {
    /// Maps a provider state string to an [`InstanceState`].
    #[must_use]
    pub fn from_provider(value: &str) -> Self {
        match value {
            "running" => Self::Running,
            "starting" | "pending" | "provisioning" => Self::Starting,
            "stopped" | "stopping" | "stopped in place" => Self::Stopped,
            other => Self::Other(other.to_owned()),
        }
    }

    /// Returns `true` when the instance is running.
    #[must_use]
    pub const fn is_running(&self) -> bool {
        matches!(self, Self::Running)
    }
}

/// Snapshot of an instance returned by a describe-by-id lookup.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct InstanceDescription {
    /// Handle the description belongs to.
    pub handle: InstanceHandle,
    /// Current lifecycle state.
    pub state: InstanceState,
    /// Public address, once assigned.
    pub public_ip: Option<IpAddr>,
    /// Public DNS name, once assigned.
    pub dns_name: Option<String>,
    /// Tags currently visible on the instance.
    pub tags: Tags,
}

/// Ordered key/value labels attached to an instance.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct Tags(BTreeMap<String, String>);

impl Tags {
    /// Creates an empty tag set.
    #[must_use]
    pub const fn new() -> Self {
        Self(BTreeMap::new())
    }

    /// Adds or replaces a tag, returning the updated set.
    #[must_use]
    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.insert(key, value);
        self
    }

    /// Adds or replaces a tag in place.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.0.insert(key.into(), value.into());
    }

    /// Returns the value stored for `key`.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    /// Overlays `other` on top of this set; keys in `other` win.
    pub fn merge(&mut self, other: &Self) {
        for (key, value) in other.iter() {
            self.insert(key, value);
        }
    }

    /// Iterates over tags in key order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0
            .iter()
            .map(|(key, value)| (key.as_str(), value.as_str()))
    }

    /// Returns `true` when no tags are present.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<K, V> FromIterator<(K, V)> for Tags
where
    K: Into<String>,
    V: Into<String>,
{
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self(
            iter.into_iter()
                .map(|(key, value)| (key.into(), value.into()))
                .collect(),
        )
    }
}

/// Errors raised by provider-agnostic validation.
#[derive(Debug, Error, Eq, PartialEq)]
pub enum ProviderError {
    /// Raised when a launch spec is missing a required field.
    #[error("missing or empty field: {0}")]
    Validation(String),
}

/// Future returned by provider operations.
pub type ProviderFuture<'a, T, E> = Pin<Box<dyn Future<Output = Result<T, E>> + Send + 'a>>;

/// Interface implemented by cloud compute providers.
///
/// Implementations must be shareable across the container worker pool, so
/// the trait requires `Send + Sync`.
pub trait ComputeProvider: Send + Sync {
    /// Provider specific error type returned by the provider.
    type Error: std::error::Error + Send + Sync + 'static;

    /// Requests `count` instances booting with `startup_script` as user-data.
    fn run_instances<'a>(
        &'a self,
        spec: &'a LaunchSpec,
        startup_script: &'a str,
        count: u32,
    ) -> ProviderFuture<'a, Vec<InstanceHandle>, Self::Error>;

    /// Looks up the current state, addresses and tags of an instance.
    fn describe_instance<'a>(
        &'a self,
        handle: &'a InstanceHandle,
    ) -> ProviderFuture<'a, InstanceDescription, Self::Error>;

    /// Applies `tags` to an instance, replacing values for existing keys.
    fn tag_instance<'a>(
        &'a self,
        handle: &'a InstanceHandle,
        tags: &'a Tags,
    ) -> ProviderFuture<'a, (), Self::Error>;

    /// Lists instances in `zone` carrying the tag `key=value`.
    fn find_tagged<'a>(
        &'a self,
        zone: &'a str,
        key: &'a str,
        value: &'a str,
    ) -> ProviderFuture<'a, Vec<InstanceHandle>, Self::Error>;

    /// Terminates the given instances.
    fn terminate_instances<'a>(
        &'a self,
        handles: &'a [InstanceHandle],
    ) -> ProviderFuture<'a, (), Self::Error>;
}
