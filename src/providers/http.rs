//! Shared HTTP plumbing for provider adapters.
//!
//! One retry loop serves every HTTP provider: transient failures (network
//! errors, timeouts, 5xx, 429) are retried up to three times with
//! exponential backoff plus jitter; permanent failures (other 4xx) are
//! reported immediately.

use super::FetchError;
use anyhow::{Context, Result};
use rand::Rng;
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, warn};

pub(crate) const MAX_RETRIES: u32 = 3;
const INITIAL_BACKOFF_SECS: u64 = 2;
const MAX_JITTER_MS: u64 = 500;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum StatusClass {
    Success,
    Transient,
    Permanent,
}

pub(crate) fn classify_status(status: StatusCode) -> StatusClass {
    if status.is_success() {
        StatusClass::Success
    } else if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
        StatusClass::Transient
    } else {
        StatusClass::Permanent
    }
}

pub(crate) fn build_client(timeout: Duration) -> Result<Client> {
    Client::builder()
        .timeout(timeout)
        .user_agent("SERPRadio/1.0 (pricing core)")
        .build()
        .context("failed to build HTTP client")
}

/// Worst-case wall time one request can spend inside the retry loop,
/// excluding the per-attempt timeouts themselves. Used by the worker to
/// size its outer batch deadline.
pub fn max_total_backoff() -> Duration {
    let mut secs = 0u64;
    for attempt in 0..MAX_RETRIES {
        secs += INITIAL_BACKOFF_SECS << attempt;
    }
    Duration::from_secs(secs) + Duration::from_millis(MAX_JITTER_MS * MAX_RETRIES as u64)
}

/// Issue a request, retrying transient failures with 2s/4s/8s backoff
/// (plus jitter). `make_request` rebuilds the request for each attempt.
pub(crate) async fn send_with_retry<F>(make_request: F, label: &str) -> Result<Response, FetchError>
where
    F: Fn() -> RequestBuilder,
{
    let mut last_transient = format!("{label}: no attempt made");

    for attempt in 0..=MAX_RETRIES {
        if attempt > 0 {
            let base = INITIAL_BACKOFF_SECS << (attempt - 1);
            let jitter = rand::thread_rng().gen_range(0..MAX_JITTER_MS);
            let delay = Duration::from_secs(base) + Duration::from_millis(jitter);
            debug!(label, attempt, "retrying in {}ms", delay.as_millis());
            sleep(delay).await;
        }

        match make_request().send().await {
            Ok(response) => {
                let status = response.status();
                match classify_status(status) {
                    StatusClass::Success => return Ok(response),
                    StatusClass::Transient => {
                        warn!(label, %status, attempt, "transient provider status");
                        last_transient = format!("{label}: HTTP {status}");
                    }
                    StatusClass::Permanent => {
                        let body = response.text().await.unwrap_or_default();
                        let detail: String = body.chars().take(200).collect();
                        return Err(FetchError::Permanent(format!(
                            "{label}: HTTP {status}: {detail}"
                        )));
                    }
                }
            }
            Err(err) => {
                warn!(label, attempt, error = %err, "request failed");
                last_transient = format!("{label}: {err}");
            }
        }
    }

    Err(FetchError::Transient(format!(
        "{last_transient} (retries exhausted)"
    )))
}
