//! Readiness probing for spawned subprocesses.

use std::time::Duration;

use anyhow::{Result, anyhow};
use tokio::time::{Instant, sleep};
use tracing::debug;

/// Per-probe request timeout. Keeps a wedged upstream from eating the
/// whole health budget in one request.
const PROBE_TIMEOUT: Duration = Duration::from_secs(2);

/// First retry delay; doubles per attempt.
const INITIAL_BACKOFF: Duration = Duration::from_millis(100);

/// Retry delay ceiling.
const MAX_BACKOFF: Duration = Duration::from_secs(1);

/// Poll `url` until it answers 2xx or `deadline_in` elapses.
///
/// Retries on connection errors and non-2xx statuses with exponential
/// backoff capped at one second.
pub async fn wait_until_healthy(url: &str, deadline_in: Duration) -> Result<()> {
    let deadline = Instant::now() + deadline_in;
    let client = reqwest::Client::builder().timeout(PROBE_TIMEOUT).build()?;
    let mut backoff = INITIAL_BACKOFF;

    loop {
        match client.get(url).send().await {
            Ok(response) if response.status().is_success() => {
                debug!(url, "health check passed");
                return Ok(());
            }
            Ok(response) => {
                debug!(url, status = %response.status(), "health check not ready, retrying");
            }
            Err(e) => {
                debug!(url, error = %e, "health check unreachable, retrying");
            }
        }

        if Instant::now() + backoff >= deadline {
            return Err(anyhow!(
                "no healthy response from {url} within {}s",
                deadline_in.as_secs()
            ));
        }
        sleep(backoff).await;
        backoff = (backoff * 2).min(MAX_BACKOFF);
    }
}
