//! Direct Instances API calls that `scaleway-rs` does not cover: server
//! lookup with tags, tag updates, tag filtering and user-data upload.

use std::net::IpAddr;
use std::str::FromStr;
use std::time::Instant;

use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::time::sleep;

use super::{HTTP_CLIENT, SCALEWAY_INSTANCE_API_BASE, ScalewayProvider, ScalewayProviderError, tags};
use crate::provider::{InstanceDescription, InstanceHandle, InstanceState, Tags};

/// Reserved user-data key that Scaleway feeds to cloud-init on first boot.
pub(super) const CLOUD_INIT_USER_DATA_KEY: &str = "cloud-init";

/// Public DNS suffix Scaleway assigns to every instance with a public IP.
const PUBLIC_DNS_SUFFIX: &str = "pub.instances.scw.cloud";

const LIST_PAGE_SIZE: u32 = 100;

#[derive(Clone, Debug, Deserialize, Eq, PartialEq)]
pub(super) struct PublicIp {
    pub(super) address: String,
}

/// Subset of the server resource the provider relies on.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq)]
pub(super) struct ServerRecord {
    pub(super) id: String,
    pub(super) state: String,
    #[serde(default)]
    pub(super) allowed_actions: Vec<String>,
    #[serde(default)]
    pub(super) public_ip: Option<PublicIp>,
    #[serde(default)]
    pub(super) tags: Vec<String>,
}

impl ServerRecord {
    pub(super) fn describe(&self, zone: &str) -> InstanceDescription {
        let public_ip = self
            .public_ip
            .as_ref()
            .and_then(|ip| IpAddr::from_str(&ip.address).ok());
        InstanceDescription {
            handle: InstanceHandle {
                id: self.id.clone(),
                zone: zone.to_owned(),
            },
            state: InstanceState::from_provider(&self.state),
            public_ip,
            dns_name: public_ip.map(|_| format!("{}.{PUBLIC_DNS_SUFFIX}", self.id)),
            tags: tags::decode(&self.tags),
        }
    }
}

#[derive(Deserialize)]
struct ServerEnvelope {
    server: ServerRecord,
}

#[derive(Deserialize)]
struct ServerList {
    #[serde(default)]
    servers: Vec<ServerRecord>,
}

#[derive(Serialize)]
struct UpdateTagsRequest {
    tags: Vec<String>,
}

pub(super) fn server_url(zone: &str, server_id: &str) -> String {
    format!("{SCALEWAY_INSTANCE_API_BASE}/zones/{zone}/servers/{server_id}")
}

pub(super) fn user_data_url(zone: &str, server_id: &str, key: &str) -> String {
    format!("{}/user_data/{key}", server_url(zone, server_id))
}

impl ScalewayProvider {
    async fn read_json<T: DeserializeOwned>(
        response: reqwest::Response,
    ) -> Result<T, ScalewayProviderError> {
        let status = response.status();
        let body = response
            .bytes()
            .await
            .map_err(|err| ScalewayProviderError::provider(&err))?;
        if !status.is_success() {
            return Err(ScalewayProviderError::Provider {
                message: format!("{status}: {}", String::from_utf8_lossy(&body)),
            });
        }
        serde_json::from_slice(&body).map_err(|err| ScalewayProviderError::provider(&err))
    }

    pub(super) async fn fetch_server(
        &self,
        handle: &InstanceHandle,
    ) -> Result<Option<ServerRecord>, ScalewayProviderError> {
        let response = HTTP_CLIENT
            .get(server_url(&handle.zone, &handle.id))
            .header("X-Auth-Token", &self.secret_key)
            .send()
            .await
            .map_err(|err| ScalewayProviderError::provider(&err))?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let envelope: ServerEnvelope = Self::read_json(response).await?;
        Ok(Some(envelope.server))
    }

    pub(super) async fn require_server(
        &self,
        handle: &InstanceHandle,
    ) -> Result<ServerRecord, ScalewayProviderError> {
        self.fetch_server(handle)
            .await?
            .ok_or_else(|| ScalewayProviderError::NotFound {
                instance_id: handle.id.clone(),
                zone: handle.zone.clone(),
            })
    }

    pub(super) async fn list_tagged(
        &self,
        zone: &str,
        key: &str,
        value: &str,
    ) -> Result<Vec<ServerRecord>, ScalewayProviderError> {
        let url = format!("{SCALEWAY_INSTANCE_API_BASE}/zones/{zone}/servers");
        let response = HTTP_CLIENT
            .get(&url)
            .header("X-Auth-Token", &self.secret_key)
            .query(&[
                ("tags", tags::query(key, value)),
                ("per_page", LIST_PAGE_SIZE.to_string()),
            ])
            .send()
            .await
            .map_err(|err| ScalewayProviderError::provider(&err))?;
        let list: ServerList = Self::read_json(response).await?;
        Ok(list
            .servers
            .into_iter()
            .filter(|server| tags::decode(&server.tags).get(key) == Some(value))
            .collect())
    }

    pub(super) async fn patch_tags(
        &self,
        handle: &InstanceHandle,
        update: &Tags,
    ) -> Result<(), ScalewayProviderError> {
        let current = self.require_server(handle).await?;
        let request = UpdateTagsRequest {
            tags: tags::merged(&current.tags, update),
        };
        let response = HTTP_CLIENT
            .patch(server_url(&handle.zone, &handle.id))
            .header("X-Auth-Token", &self.secret_key)
            .json(&request)
            .send()
            .await
            .map_err(|err| ScalewayProviderError::provider(&err))?;
        let _: ServerEnvelope = Self::read_json(response).await?;
        Ok(())
    }

    pub(super) async fn upload_user_data(
        &self,
        handle: &InstanceHandle,
        script: &str,
    ) -> Result<(), ScalewayProviderError> {
        let response = HTTP_CLIENT
            .patch(user_data_url(
                &handle.zone,
                &handle.id,
                CLOUD_INIT_USER_DATA_KEY,
            ))
            .header("X-Auth-Token", &self.secret_key)
            .header("Content-Type", "text/plain")
            .body(script.to_owned())
            .send()
            .await
            .map_err(|err| ScalewayProviderError::provider(&err))?;
        if response.status().is_success() {
            return Ok(());
        }
        let message = response.text().await.unwrap_or_default();
        Err(ScalewayProviderError::Provider { message })
    }

    pub(super) async fn wait_until_gone(
        &self,
        handle: &InstanceHandle,
    ) -> Result<(), ScalewayProviderError> {
        let deadline = Instant::now() + self.wait_timeout;
        while Instant::now() <= deadline {
            if self.fetch_server(handle).await?.is_none() {
                return Ok(());
            }
            sleep(self.poll_interval).await;
        }

        Err(ScalewayProviderError::ResidualResource {
            instance_id: handle.id.clone(),
        })
    }
}
