//! Run coordination: prerequisites, streamed runs and background analyses.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tracing::{info, warn};

use crate::error::{TransferError, TransferResult};
use crate::failure::classify_failure;
use crate::poller::{await_status, PollPolicy};
use crate::remote::{DocumentService, EventStream, RemoteError, RemoteStatus, RunRequest};
use crate::retry::RetryPolicy;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunSettings {
    pub fetch_retry: RetryPolicy,
    /// Wait for files that are still being indexed before a run starts.
    pub index_file_poll: PollPolicy,
    pub start_retry: RetryPolicy,
    pub run_poll: PollPolicy,
}

impl Default for RunSettings {
    fn default() -> Self {
        let fetch_retry = RetryPolicy::new(3, Duration::from_millis(2_000), Duration::from_secs(30));
        Self {
            fetch_retry,
            index_file_poll: PollPolicy::new(Duration::from_millis(2_000), 30),
            start_retry: fetch_retry,
            run_poll: PollPolicy::new(Duration::from_millis(1_000), 120),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalysisOutcome {
    pub id: String,
    pub status: RemoteStatus,
    pub reached_terminal: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
}

pub struct RunCoordinator {
    service: Arc<dyn DocumentService>,
    settings: RunSettings,
}

impl RunCoordinator {
    pub fn new(service: Arc<dyn DocumentService>, settings: RunSettings) -> Self {
        Self { service, settings }
    }

    /// Checks the index and waits for its files, then opens the event stream.
    pub async fn start_stream(&self, request: &RunRequest) -> TransferResult<EventStream> {
        self.prepare(request).await?;
        let service = self.service.as_ref();
        let stream = self
            .settings
            .start_retry
            .execute_if(
                "start streamed run",
                || service.stream_run(request),
                RemoteError::is_retryable,
            )
            .await
            .map_err(|err| classify_failure(&format!("index {}", request.index_id), err))?;
        info!(index_id = %request.index_id, history = request.conversation.len(), "run stream opened");
        Ok(stream)
    }

    /// Submits a background run and polls it until it settles or the budget runs out.
    pub async fn analyze(&self, request: &RunRequest) -> TransferResult<AnalysisOutcome> {
        self.prepare(request).await?;
        let service = self.service.as_ref();
        let run = self
            .settings
            .start_retry
            .execute_if(
                "submit background run",
                || service.submit_run(request),
                RemoteError::is_retryable,
            )
            .await
            .map_err(|err| classify_failure(&format!("index {}", request.index_id), err))?;
        let run_id = run.id.as_str();
        info!(run_id, index_id = %request.index_id, status = %run.status, "background run submitted");

        let resource = format!("run {run_id}");
        let outcome = await_status(
            &resource,
            &self.settings.fetch_retry,
            self.settings.run_poll,
            || async move { service.get_run(run_id).await.map(|run| run.status) },
            RemoteStatus::is_terminal,
        )
        .await?;

        let text = if outcome.reached_terminal {
            self.settings
                .fetch_retry
                .execute_if(&resource, || service.get_run(run_id), RemoteError::is_retryable)
                .await
                .map_err(|err| classify_failure(&resource, err))?
                .output_text
        } else {
            None
        };

        Ok(AnalysisOutcome {
            id: run.id.clone(),
            status: outcome.status,
            reached_terminal: outcome.reached_terminal,
            text,
        })
    }

    async fn prepare(&self, request: &RunRequest) -> TransferResult<()> {
        let index_id = request.index_id.trim();
        if index_id.is_empty() {
            return Err(TransferError::Validation("indexId is required".into()));
        }
        if request.instructions.trim().is_empty() {
            return Err(TransferError::Validation("instructions are required".into()));
        }

        let service = self.service.as_ref();
        let subject = format!("index {index_id}");
        let retry = &self.settings.fetch_retry;
        retry
            .execute_if(&subject, || service.get_index(index_id), RemoteError::is_retryable)
            .await
            .map_err(|err| classify_failure(&subject, err))?;

        let files = retry
            .execute_if(
                &format!("list files of {subject}"),
                || service.list_index_files(index_id),
                RemoteError::is_retryable,
            )
            .await
            .map_err(|err| classify_failure(&subject, err))?;
        if files.is_empty() {
            warn!(index_id, "index has no files; the run may not find anything");
        }

        for file in files.iter().filter(|file| file.status.is_pending()) {
            let file_id = file.id.as_str();
            let outcome = await_status(
                &format!("index file {file_id}"),
                retry,
                self.settings.index_file_poll,
                || async move {
                    service
                        .get_index_file(index_id, file_id)
                        .await
                        .map(|file| file.status)
                },
                RemoteStatus::is_terminal,
            )
            .await?;
            if !outcome.reached_terminal {
                warn!(index_id, file_id, status = %outcome.status, "file still indexing; starting run anyway");
            }
        }
        Ok(())
    }
}
