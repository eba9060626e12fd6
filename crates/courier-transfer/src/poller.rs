use std::future::Future;
use std::time::Duration;

use serde::Serialize;
use tokio::time::{sleep, Instant};
use tracing::{debug, info, warn};

use crate::error::{TransferError, TransferResult};
use crate::failure::classify_failure;
use crate::remote::{RemoteError, RemoteStatus};
use crate::retry::RetryPolicy;

/// Fixed-interval polling budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollPolicy {
    pub interval: Duration,
    pub max_polls: u32,
}

impl PollPolicy {
    pub fn new(interval: Duration, max_polls: u32) -> Self {
        Self {
            interval,
            max_polls: max_polls.max(1),
        }
    }

    /// Longest a wait can take, ignoring time spent inside fetches.
    pub fn budget(&self) -> Duration {
        self.interval
            .saturating_mul(self.max_polls.saturating_sub(1))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PollOutcome {
    pub status: RemoteStatus,
    /// False when the budget ran out first. The resource is then in an unknown
    /// state and callers proceed at their own risk.
    pub reached_terminal: bool,
    pub polls: u32,
}

/// Polls `fetch` until `is_terminal` holds or `policy.max_polls` fetches were made.
///
/// Each fetch runs under `fetch_retry`. An explicit failure status is always an
/// error; an expired budget is not.
pub async fn await_status<F, Fut, P>(
    resource: &str,
    fetch_retry: &RetryPolicy,
    policy: PollPolicy,
    mut fetch: F,
    is_terminal: P,
) -> TransferResult<PollOutcome>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<RemoteStatus, RemoteError>>,
    P: Fn(RemoteStatus) -> bool,
{
    let max_polls = policy.max_polls.max(1);
    let label = format!("poll {resource}");
    let started = Instant::now();
    let mut status = RemoteStatus::Unknown;

    for poll in 1..=max_polls {
        status = fetch_retry
            .execute_if(&label, &mut fetch, RemoteError::is_retryable)
            .await
            .map_err(|err| classify_failure(resource, err))?;
        debug!(resource, poll, max_polls, status = %status, "observed status");

        if status.is_failure() {
            warn!(resource, poll, status = %status, "resource reported failure");
            return Err(TransferError::RemoteFailed {
                resource: resource.to_string(),
                status,
            });
        }
        if is_terminal(status) {
            info!(
                resource,
                poll,
                status = %status,
                elapsed_ms = started.elapsed().as_millis() as u64,
                "resource reached terminal status"
            );
            return Ok(PollOutcome {
                status,
                reached_terminal: true,
                polls: poll,
            });
        }
        if poll < max_polls {
            sleep(policy.interval).await;
        }
    }

    warn!(
        resource,
        polls = max_polls,
        status = %status,
        elapsed_ms = started.elapsed().as_millis() as u64,
        "poll deadline elapsed before a terminal status; proceeding"
    );
    Ok(PollOutcome {
        status,
        reached_terminal: false,
        polls: max_polls,
    })
}
