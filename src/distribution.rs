//! Pre-flight check that the application distribution can be downloaded.
//!
//! Nodes fetch the archive themselves during setup, so an unreachable URL
//! would only surface after instances had been paid for. A `HEAD` request
//! before provisioning turns that into a configuration error.

use std::sync::LazyLock;
use std::time::Duration;

use tracing::{debug, info};

use crate::cluster::Distribution;
use crate::config::ConfigError;

const PREFLIGHT_TIMEOUT: Duration = Duration::from_secs(20);

static PREFLIGHT_CLIENT: LazyLock<reqwest::Client> = LazyLock::new(|| {
    reqwest::Client::builder()
        .timeout(PREFLIGHT_TIMEOUT)
        .build()
        .unwrap_or_else(|_| reqwest::Client::new())
});

/// Verifies the distribution URL unless fetching is disabled.
///
/// # Errors
///
/// Returns [`ConfigError::DistributionUnreachable`] when the request fails
/// or the server answers with a non-success status.
pub async fn verify_distribution(distribution: &Distribution) -> Result<(), ConfigError> {
    if distribution.skip_fetch {
        debug!(url = %distribution.url, "distribution fetch disabled, skipping pre-flight");
        return Ok(());
    }
    check_url(&distribution.url).await?;
    info!(url = %distribution.url, "distribution is reachable");
    Ok(())
}

/// Issues a `HEAD` request against `url`.
///
/// # Errors
///
/// Returns [`ConfigError::DistributionUnreachable`] describing the transport
/// failure or HTTP status.
pub async fn check_url(url: &str) -> Result<(), ConfigError> {
    let unreachable = |message: String| ConfigError::DistributionUnreachable {
        url: url.to_owned(),
        message,
    };
    let response = PREFLIGHT_CLIENT
        .head(url)
        .send()
        .await
        .map_err(|err| unreachable(err.to_string()))?;
    let status = response.status();
    if status.is_success() {
        Ok(())
    } else {
        Err(unreachable(format!("server answered {status}")))
    }
}
