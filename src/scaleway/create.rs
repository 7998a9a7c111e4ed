//! Instance creation for the Scaleway provider.
//!
//! Servers are created with `stopped: true`; the startup script is written
//! to the `cloud-init` user-data key and only then is the server powered on,
//! so cloud-init sees the script on first boot. A batch either launches in
//! full or terminates every server it already created.

use std::future::Future;
use std::slice;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use uuid::Uuid;

use super::server::ServerRecord;
use super::{HTTP_CLIENT, SCALEWAY_INSTANCE_API_BASE, ScalewayProvider, ScalewayProviderError, tags};
use crate::provider::{ComputeProvider, InstanceHandle, LaunchSpec};

/// Tag key recording the SSH key pair operators should use.
pub(super) const KEY_NAME_TAG: &str = "KeyName";

#[derive(Serialize)]
struct CreateServerRequest {
    name: String,
    commercial_type: String,
    image: String,
    project: String,
    routed_ip_enabled: bool,
    dynamic_ip_required: bool,
    tags: Vec<String>,
    stopped: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    security_group: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    organization: Option<String>,
}

#[derive(Deserialize)]
struct CreateServerResponse {
    server: ServerRecord,
}

impl ScalewayProvider {
    pub(super) fn is_instance_type_error(
        api_err: &scaleway_rs::ScalewayApiError,
        spec: &LaunchSpec,
    ) -> bool {
        matches!(api_err.resource.as_deref(), Some("commercial_type"))
            || api_err
                .resource_id
                .as_deref()
                .is_some_and(|id| id == spec.instance_type)
            || (api_err.etype == "invalid_arguments"
                && api_err
                    .message
                    .to_ascii_lowercase()
                    .contains("commercial_type"))
    }

    pub(super) fn creation_tags(spec: &LaunchSpec) -> Vec<String> {
        let mut raw = vec![String::from(tags::MANAGED_TAG)];
        if let Some(key_name) = &spec.key_name {
            raw.push(tags::query(KEY_NAME_TAG, key_name));
        }
        raw
    }

    /// Launches `count` servers sharing one image and startup script.
    pub(super) async fn launch_batch(
        &self,
        spec: &LaunchSpec,
        image_id: &str,
        startup_script: &str,
        count: u32,
    ) -> Result<Vec<InstanceHandle>, ScalewayProviderError> {
        Self::launch_batch_with(
            count,
            || self.launch_one(spec, image_id, startup_script),
            |launched: Vec<InstanceHandle>, cause: ScalewayProviderError| async move {
                self.discard_launched(&launched, &cause).await;
                cause
            },
        )
        .await
    }

    /// Runs `launch` up to `count` times. On the first failure the handles
    /// launched so far go to `discard`, whose result is returned as the error.
    pub(super) async fn launch_batch_with<Launch, LaunchFut, Discard, DiscardFut>(
        count: u32,
        mut launch: Launch,
        discard: Discard,
    ) -> Result<Vec<InstanceHandle>, ScalewayProviderError>
    where
        Launch: FnMut() -> LaunchFut,
        LaunchFut: Future<Output = Result<InstanceHandle, ScalewayProviderError>>,
        Discard: FnOnce(Vec<InstanceHandle>, ScalewayProviderError) -> DiscardFut,
        DiscardFut: Future<Output = ScalewayProviderError>,
    {
        let mut handles = Vec::new();
        for _ in 0..count {
            match launch().await {
                Ok(handle) => handles.push(handle),
                Err(err) => return Err(discard(handles, err).await),
            }
        }
        Ok(handles)
    }

    /// Creates, configures and boots a single server. A server that was
    /// created but could not be booted is terminated again.
    async fn launch_one(
        &self,
        spec: &LaunchSpec,
        image_id: &str,
        startup_script: &str,
    ) -> Result<InstanceHandle, ScalewayProviderError> {
        let server = self.create_server_stopped(spec, image_id).await?;
        let handle = InstanceHandle {
            id: server.id.clone(),
            zone: spec.zone.clone(),
        };
        let booted = async {
            self.upload_user_data(&handle, startup_script).await?;
            self.power_on_if_needed(&spec.zone, &server).await
        }
        .await;
        if let Err(err) = booted {
            self.discard_launched(slice::from_ref(&handle), &err).await;
            return Err(err);
        }
        debug!(instance_id = %handle.id, zone = %handle.zone, "instance powered on");
        Ok(handle)
    }

    async fn discard_launched(&self, handles: &[InstanceHandle], cause: &ScalewayProviderError) {
        if handles.is_empty() {
            return;
        }
        warn!(
            count = handles.len(),
            error = %cause,
            "launch failed; terminating instances it created"
        );
        if let Err(err) = self.terminate_instances(handles).await {
            warn!(error = %err, "could not terminate instances from a failed launch");
        }
    }

    pub(super) async fn power_on_if_needed(
        &self,
        zone: &str,
        server: &ServerRecord,
    ) -> Result<(), ScalewayProviderError> {
        if server.state == "running" {
            return Ok(());
        }

        if server.allowed_actions.iter().any(|action| action == "poweron") {
            self.api
                .perform_instance_action_async(zone, &server.id, "poweron")
                .await?;
            return Ok(());
        }

        Err(ScalewayProviderError::PowerOnNotAllowed {
            instance_id: server.id.clone(),
            state: server.state.clone(),
        })
    }

    async fn create_server_stopped(
        &self,
        spec: &LaunchSpec,
        image_id: &str,
    ) -> Result<ServerRecord, ScalewayProviderError> {
        let url = format!("{SCALEWAY_INSTANCE_API_BASE}/zones/{}/servers", spec.zone);
        let payload = CreateServerRequest {
            name: format!("{}-{}", spec.name_prefix, Uuid::new_v4().simple()),
            commercial_type: spec.instance_type.clone(),
            image: image_id.to_owned(),
            project: spec.project_id.clone(),
            routed_ip_enabled: true,
            dynamic_ip_required: true,
            tags: Self::creation_tags(spec),
            stopped: true,
            security_group: spec.security_group.clone(),
            organization: spec.organisation_id.clone(),
        };

        let response = HTTP_CLIENT
            .post(&url)
            .header("X-Auth-Token", &self.secret_key)
            .json(&payload)
            .send()
            .await
            .map_err(|err| ScalewayProviderError::provider(&err))?;

        let status = response.status();
        let body = response
            .bytes()
            .await
            .map_err(|err| ScalewayProviderError::provider(&err))?;

        if status.is_success() {
            let parsed: CreateServerResponse = serde_json::from_slice(&body)
                .map_err(|err| ScalewayProviderError::provider(&err))?;
            return Ok(parsed.server);
        }

        if let Ok(api_err) = serde_json::from_slice::<scaleway_rs::ScalewayApiError>(&body)
            && Self::is_instance_type_error(&api_err, spec)
        {
            return Err(ScalewayProviderError::InstanceTypeUnavailable {
                instance_type: spec.instance_type.clone(),
                zone: spec.zone.clone(),
            });
        }

        Err(ScalewayProviderError::Provider {
            message: String::from_utf8_lossy(&body).into_owned(),
        })
    }
}
