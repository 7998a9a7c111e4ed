//! Bounded polling for instance and service readiness.
//!
//! Every gate follows the same shape: evaluate a predicate, sleep for the poll
//! interval, and give up with a [`ReadinessTimeout`] once the budget is
//! spent. The checker holds no mutable state, so one instance is shared by
//! every node flow.

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use thiserror::Error;
use tokio::net::TcpStream;
use tokio::time::{Instant, sleep, timeout};
use tracing::debug;

use crate::cluster::ServiceAddress;
use crate::provider::{ComputeProvider, InstanceDescription, InstanceHandle};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(2);

/// Raised when a readiness gate does not pass within its budget.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
#[error("timed out after {}s waiting for {target}", waited.as_secs())]
pub struct ReadinessTimeout {
    /// What was being waited for.
    pub target: String,
    /// Budget that elapsed.
    pub waited: Duration,
}

/// Future returned by [`PortCheck::is_open`].
pub type PortCheckFuture<'a> = Pin<Box<dyn Future<Output = bool> + Send + 'a>>;

/// Checks whether a TCP endpoint accepts connections.
pub trait PortCheck: Send + Sync {
    /// Returns `true` when `host:port` accepted a connection.
    fn is_open<'a>(&'a self, host: &'a str, port: u16) -> PortCheckFuture<'a>;
}

/// [`PortCheck`] that opens a real TCP connection with a short timeout.
#[derive(Clone, Copy, Debug)]
pub struct TcpPortCheck {
    connect_timeout: Duration,
}

impl TcpPortCheck {
    /// Creates a check with the given per-attempt connect timeout.
    #[must_use]
    pub const fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }
}

impl Default for TcpPortCheck {
    fn default() -> Self {
        Self::new(CONNECT_TIMEOUT)
    }
}

impl PortCheck for TcpPortCheck {
    fn is_open<'a>(&'a self, host: &'a str, port: u16) -> PortCheckFuture<'a> {
        Box::pin(async move {
            let connect = timeout(self.connect_timeout, TcpStream::connect((host, port))).await;
            matches!(connect, Ok(Ok(_)))
        })
    }
}

/// Polls `attempt` every `interval` until it yields a value or `max`
/// elapses. The predicate runs at least once.
///
/// # Errors
///
/// Returns [`ReadinessTimeout`] naming `target` when the budget is spent.
pub async fn poll_until<T, F, Fut>(
    target: &str,
    interval: Duration,
    max: Duration,
    mut attempt: F,
) -> Result<T, ReadinessTimeout>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Option<T>>,
{
    let deadline = Instant::now() + max;
    loop {
        if let Some(value) = attempt().await {
            return Ok(value);
        }
        let now = Instant::now();
        if now >= deadline {
            break;
        }
        sleep(interval.min(deadline - now)).await;
    }
    Err(ReadinessTimeout {
        target: target.to_owned(),
        waited: max,
    })
}

/// Boolean form of [`poll_until`].
///
/// # Errors
///
/// Returns [`ReadinessTimeout`] naming `target` when the budget is spent.
pub async fn poll_with_retry<F, Fut>(
    target: &str,
    interval: Duration,
    max: Duration,
    mut predicate: F,
) -> Result<(), ReadinessTimeout>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    poll_until(target, interval, max, || {
        let check = predicate();
        async move { check.await.then_some(()) }
    })
    .await
}

/// Readiness gates used by the deployer.
#[derive(Clone, Debug)]
pub struct ReadinessChecker<S: PortCheck> {
    ports: S,
    interval: Duration,
}

impl<S: PortCheck> ReadinessChecker<S> {
    /// Creates a checker polling every `interval`.
    #[must_use]
    pub const fn new(ports: S, interval: Duration) -> Self {
        Self { ports, interval }
    }

    /// Waits for the provider to report the instance as running and returns
    /// the description observed at that point. Provider errors count as "not
    /// yet".
    ///
    /// # Errors
    ///
    /// Returns [`ReadinessTimeout`] when the instance is not running within
    /// `max`.
    pub async fn wait_for_running<P: ComputeProvider>(
        &self,
        provider: &P,
        handle: &InstanceHandle,
        max: Duration,
    ) -> Result<InstanceDescription, ReadinessTimeout> {
        let target = format!("instance {} to run", handle.id);
        poll_until(&target, self.interval, max, move || async move {
            match provider.describe_instance(handle).await {
                Ok(description) if description.state.is_running() => Some(description),
                Ok(description) => {
                    debug!(instance = %handle.id, state = ?description.state, "instance not running yet");
                    None
                }
                Err(err) => {
                    debug!(instance = %handle.id, error = %err, "describe failed while waiting");
                    None
                }
            }
        })
        .await
    }

    /// Waits for `host:port` to accept connections.
    ///
    /// # Errors
    ///
    /// Returns [`ReadinessTimeout`] when the port stays closed for `max`.
    pub async fn wait_for_port(
        &self,
        host: &str,
        port: u16,
        max: Duration,
    ) -> Result<(), ReadinessTimeout> {
        let target = format!("{host}:{port}");
        poll_with_retry(&target, self.interval, max, || self.ports.is_open(host, port)).await
    }

    /// Waits until at least one of `addresses` accepts connections.
    ///
    /// # Errors
    ///
    /// Returns [`ReadinessTimeout`] when none of the addresses opens within
    /// `max`.
    pub async fn wait_for_any(
        &self,
        addresses: &[ServiceAddress],
        max: Duration,
    ) -> Result<(), ReadinessTimeout> {
        let target = format!(
            "any of {}",
            addresses
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join(",")
        );
        poll_with_retry(&target, self.interval, max, move || async move {
            for address in addresses {
                if self.ports.is_open(&address.host, address.port).await {
                    return true;
                }
            }
            false
        })
        .await
    }
}
