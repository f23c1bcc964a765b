//! Bootstrap utilities for esclient binaries and embedders.

use std::future::Future;
use std::time::Duration;

use backon::Retryable;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use super::retry::bounded_connection_backoff;
use crate::error::{ClientError, Result};

/// Initialize tracing with ESCLIENT_LOG environment variable.
///
/// Defaults to "info" level if ESCLIENT_LOG is not set.
pub fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_env("ESCLIENT_LOG")
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

/// Establish a store connection with exponential backoff.
///
/// Only connection and timeout errors are retried, at most `retries` times.
/// Anything else (bad configuration, rejected credentials) fails at once.
pub async fn connect_with_retry<T, F, Fut>(
    service_name: &str,
    address: &str,
    retries: usize,
    connect: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let result = connect
        .retry(bounded_connection_backoff(retries))
        .when(ClientError::is_retryable)
        .notify(|err: &ClientError, delay: Duration| {
            warn!(
                service = %service_name,
                address = %address,
                error = %err,
                delay = ?delay,
                "Connection failed, retrying"
            );
        })
        .await;

    match &result {
        Ok(_) => info!(service = %service_name, address = %address, "Connected"),
        Err(e) => error!(
            service = %service_name,
            address = %address,
            error = %e,
            "Giving up on connection"
        ),
    }
    result
}
