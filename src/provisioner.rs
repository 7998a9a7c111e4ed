//! Batch instance acquisition and address resolution.

use std::net::IpAddr;

use thiserror::Error;
use tracing::info;

use crate::provider::{ComputeProvider, InstanceHandle, LaunchSpec};

/// An instance whose public addresses are known.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ResolvedInstance {
    /// Provider handle.
    pub handle: InstanceHandle,
    /// Public IP address.
    pub ip: IpAddr,
    /// Public DNS name; falls back to the IP when the provider has none.
    pub dns_name: String,
}

/// Errors raised while acquiring or resolving instances.
#[derive(Debug, Error)]
pub enum ProvisionError<E>
where
    E: std::error::Error + 'static,
{
    /// The provider call failed.
    #[error("provider request failed: {0}")]
    Provider(#[source] E),
    /// The provider returned fewer instances than requested.
    #[error("requested {requested} instances but the provider returned {received}")]
    Shortfall {
        /// Instances requested.
        requested: u32,
        /// Instances returned.
        received: usize,
    },
    /// The instance has no public address yet.
    #[error("instance {instance_id} has no public address")]
    Unresolved {
        /// Provider identifier.
        instance_id: String,
    },
}

/// Requests instances for a fixed [`LaunchSpec`] and resolves their
/// addresses.
#[derive(Debug)]
pub struct InstanceProvisioner<P: ComputeProvider> {
    provider: P,
    spec: LaunchSpec,
}

impl<P: ComputeProvider> InstanceProvisioner<P> {
    /// Wraps `provider`, launching every instance with `spec`.
    #[must_use]
    pub const fn new(provider: P, spec: LaunchSpec) -> Self {
        Self { provider, spec }
    }

    /// Underlying provider.
    #[must_use]
    pub const fn provider(&self) -> &P {
        &self.provider
    }

    /// Requests exactly `count` instances booting `startup_script`.
    ///
    /// # Errors
    ///
    /// Returns [`ProvisionError::Provider`] when the request fails and
    /// [`ProvisionError::Shortfall`] when fewer than `count` come back.
    pub async fn run_instances(
        &self,
        startup_script: &str,
        count: u32,
    ) -> Result<Vec<InstanceHandle>, ProvisionError<P::Error>> {
        let handles = self
            .provider
            .run_instances(&self.spec, startup_script, count)
            .await
            .map_err(ProvisionError::Provider)?;
        if usize::try_from(count).ok() != Some(handles.len()) {
            return Err(ProvisionError::Shortfall {
                requested: count,
                received: handles.len(),
            });
        }
        info!(
            count,
            instance_type = %self.spec.instance_type,
            zone = %self.spec.zone,
            "instances requested"
        );
        Ok(handles)
    }

    /// Re-describes `handle` to pick up its current addresses.
    ///
    /// # Errors
    ///
    /// Returns [`ProvisionError::Provider`] when the lookup fails and
    /// [`ProvisionError::Unresolved`] when no public address is assigned.
    pub async fn resolve(
        &self,
        handle: &InstanceHandle,
    ) -> Result<ResolvedInstance, ProvisionError<P::Error>> {
        let description = self
            .provider
            .describe_instance(handle)
            .await
            .map_err(ProvisionError::Provider)?;
        let ip = description
            .public_ip
            .ok_or_else(|| ProvisionError::Unresolved {
                instance_id: handle.id.clone(),
            })?;
        Ok(ResolvedInstance {
            handle: handle.clone(),
            ip,
            dns_name: description.dns_name.unwrap_or_else(|| ip.to_string()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::InstanceState;
    use crate::test_support::{ScriptedProvider, sample_launch_spec};

    #[tokio::test]
    async fn returns_exactly_the_requested_batch() {
        let provider = ScriptedProvider::new();
        let provisioner = InstanceProvisioner::new(provider.clone(), sample_launch_spec());

        let handles = provisioner
            .run_instances("#!/usr/bin/env bash\n", 3)
            .await
            .expect("batch should provision");

        assert_eq!(handles.len(), 3);
        assert_eq!(provider.user_data(), vec![String::from("#!/usr/bin/env bash\n")]);
    }

    #[tokio::test]
    async fn short_batches_are_fatal() {
        let provider = ScriptedProvider::new();
        provider.limit_batch(2);
        let provisioner = InstanceProvisioner::new(provider, sample_launch_spec());

        let err = provisioner
            .run_instances("", 3)
            .await
            .expect_err("short batch should fail");

        assert!(
            matches!(err, ProvisionError::Shortfall { requested: 3, received: 2 }),
            "unexpected error: {err}"
        );
    }

    #[tokio::test]
    async fn resolve_prefers_dns_name() {
        let provider = ScriptedProvider::new();
        let handle = provider.add_instance("srv-9", InstanceState::Running);
        let provisioner = InstanceProvisioner::new(provider, sample_launch_spec());

        let resolved = provisioner.resolve(&handle).await.expect("resolve");

        assert_eq!(resolved.dns_name, "srv-9.pub.example");
        assert_eq!(resolved.handle, handle);
    }

    #[tokio::test]
    async fn resolve_requires_a_public_address() {
        let provider = ScriptedProvider::new();
        let handle = provider.add_instance("srv-0", InstanceState::Starting);
        provider.clear_address("srv-0");
        let provisioner = InstanceProvisioner::new(provider, sample_launch_spec());

        let err = provisioner.resolve(&handle).await.expect_err("no address");

        assert!(matches!(err, ProvisionError::Unresolved { ref instance_id } if instance_id == "srv-0"));
    }
}
