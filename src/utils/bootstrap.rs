//! Bootstrap utilities for busmux binaries.

use std::future::Future;
use std::time::Duration;

use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::LOG_ENV_VAR;

/// Initialize tracing with the BUSMUX_LOG environment variable.
///
/// Defaults to "info" level if BUSMUX_LOG is not set.
pub fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_env(LOG_ENV_VAR)
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

/// Backoff schedule for establishing the substrate connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectBackoff {
    /// Attempts before giving up, including the first one.
    pub max_attempts: u32,
    /// Wait after the first failed attempt.
    pub initial_delay: Duration,
    /// Upper bound for any single wait.
    pub max_delay: Duration,
}

impl Default for ConnectBackoff {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl ConnectBackoff {
    /// Wait before retrying after failed attempt number `attempt` (1-based).
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let doublings = attempt.saturating_sub(1).min(31);
        self.initial_delay
            .saturating_mul(1u32 << doublings)
            .min(self.max_delay)
    }
}

/// Connect to the substrate, backing off between failed attempts.
///
/// `substrate` and `url` only label the log events. Returns the last error
/// once `backoff.max_attempts` attempts have failed.
pub async fn connect_with_retry<T, E, F, Fut>(
    substrate: &str,
    url: &str,
    backoff: ConnectBackoff,
    connect: F,
) -> Result<T, E>
where
    E: std::fmt::Display,
    F: Fn() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let max_attempts = backoff.max_attempts.max(1);
    let mut attempt = 0;

    loop {
        attempt += 1;
        let error = match connect().await {
            Ok(connection) => {
                info!(substrate = %substrate, url = %url, attempt, "Substrate connected");
                return Ok(connection);
            }
            Err(e) => e,
        };

        if attempt >= max_attempts {
            error!(
                substrate = %substrate,
                url = %url,
                attempts = attempt,
                error = %error,
                "Giving up on substrate connection"
            );
            return Err(error);
        }

        let delay = backoff.delay_after(attempt);
        warn!(
            substrate = %substrate,
            url = %url,
            attempt,
            max_attempts,
            retry_in = ?delay,
            error = %error,
            "Substrate connection failed"
        );
        tokio::time::sleep(delay).await;
    }
}
