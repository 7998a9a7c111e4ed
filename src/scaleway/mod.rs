//! Scaleway implementation of [`ComputeProvider`].
//!
//! Instances are created stopped so the startup script can be stored as
//! cloud-init user-data before the first boot, then powered on. Scaleway has
//! no per-instance key pairs, so the configured key name is recorded as a
//! tag instead.

mod create;
mod error;
mod image;
mod server;
mod tags;

use std::sync::LazyLock;
use std::time::Duration;

use scaleway_rs::ScalewayApi;
use tracing::{debug, info};

use crate::config::ScalewayConfig;
use crate::provider::{
    ComputeProvider, InstanceDescription, InstanceHandle, LaunchSpec, ProviderFuture, Tags,
};

pub use error::ScalewayProviderError;

const HTTP_TIMEOUT: Duration = Duration::from_secs(30);
const SCALEWAY_INSTANCE_API_BASE: &str = "https://api.scaleway.com/instance/v1";
const POLL_INTERVAL: Duration = Duration::from_secs(5);
const WAIT_TIMEOUT: Duration = Duration::from_secs(300);

static HTTP_CLIENT: LazyLock<reqwest::Client> = LazyLock::new(|| {
    reqwest::Client::builder()
        .timeout(HTTP_TIMEOUT)
        .build()
        .unwrap_or_else(|_| reqwest::Client::new())
});

/// Provider that manages cluster instances through the Scaleway Instances
/// API.
#[derive(Clone)]
pub struct ScalewayProvider {
    api: ScalewayApi,
    secret_key: String,
    poll_interval: Duration,
    wait_timeout: Duration,
}

impl ScalewayProvider {
    /// Constructs a provider from validated configuration.
    ///
    /// # Errors
    ///
    /// Returns [`ScalewayProviderError::Config`] when the configuration fails
    /// validation.
    pub fn new(config: &ScalewayConfig) -> Result<Self, ScalewayProviderError> {
        config.validate()?;
        Ok(Self {
            api: ScalewayApi::new(&config.secret_key),
            secret_key: config.secret_key.clone(),
            poll_interval: POLL_INTERVAL,
            wait_timeout: WAIT_TIMEOUT,
        })
    }
}

impl ComputeProvider for ScalewayProvider {
    type Error = ScalewayProviderError;

    fn run_instances<'a>(
        &'a self,
        spec: &'a LaunchSpec,
        startup_script: &'a str,
        count: u32,
    ) -> ProviderFuture<'a, Vec<InstanceHandle>, Self::Error> {
        Box::pin(async move {
            spec.validate()?;
            let image_id = self.resolve_image_id(spec).await?;
            let handles = self
                .launch_batch(spec, &image_id, startup_script, count)
                .await?;
            info!(
                zone = %spec.zone,
                requested = count,
                launched = handles.len(),
                "launched scaleway instances"
            );
            Ok(handles)
        })
    }

    fn describe_instance<'a>(
        &'a self,
        handle: &'a InstanceHandle,
    ) -> ProviderFuture<'a, InstanceDescription, Self::Error> {
        Box::pin(async move {
            let record = self.require_server(handle).await?;
            Ok(record.describe(&handle.zone))
        })
    }

    fn tag_instance<'a>(
        &'a self,
        handle: &'a InstanceHandle,
        tags: &'a Tags,
    ) -> ProviderFuture<'a, (), Self::Error> {
        Box::pin(async move { self.patch_tags(handle, tags).await })
    }

    fn find_tagged<'a>(
        &'a self,
        zone: &'a str,
        key: &'a str,
        value: &'a str,
    ) -> ProviderFuture<'a, Vec<InstanceHandle>, Self::Error> {
        Box::pin(async move {
            let servers = self.list_tagged(zone, key, value).await?;
            Ok(servers
                .into_iter()
                .map(|server| InstanceHandle {
                    id: server.id,
                    zone: zone.to_owned(),
                })
                .collect())
        })
    }

    fn terminate_instances<'a>(
        &'a self,
        handles: &'a [InstanceHandle],
    ) -> ProviderFuture<'a, (), Self::Error> {
        Box::pin(async move {
            for handle in handles {
                debug!(instance_id = %handle.id, zone = %handle.zone, "terminating instance");
                self.api
                    .perform_instance_action_async(&handle.zone, &handle.id, "terminate")
                    .await?;
            }
            for handle in handles {
                self.wait_until_gone(handle).await?;
            }
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests;
