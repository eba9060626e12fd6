//! Linking uploaded files into an index.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tracing::{info, warn};

use crate::error::{TransferError, TransferResult};
use crate::failure::classify_failure;
use crate::poller::{await_status, PollPolicy};
use crate::remote::{DocumentService, RemoteError, RemoteStatus};
use crate::retry::RetryPolicy;

pub const PENDING_ATTACH_MESSAGE: &str =
    "File is still being attached to the index and should be available shortly";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinkSettings {
    /// Wait for the uploaded file to finish processing.
    pub file_poll: PollPolicy,
    /// Budget for each individual status fetch.
    pub fetch_retry: RetryPolicy,
    pub attach_retry: RetryPolicy,
}

impl Default for LinkSettings {
    fn default() -> Self {
        Self {
            file_poll: PollPolicy::new(Duration::from_millis(2_000), 30),
            fetch_retry: RetryPolicy::new(3, Duration::from_millis(2_000), Duration::from_secs(30)),
            attach_retry: RetryPolicy::new(5, Duration::from_millis(5_000), Duration::from_secs(120)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AttachOutcome {
    /// File id.
    pub id: String,
    pub index_id: String,
    pub status: RemoteStatus,
    /// The file finished processing before it was attached.
    pub file_ready: bool,
    /// The file shows up when listing the index.
    pub verified: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl AttachOutcome {
    pub fn is_pending(&self) -> bool {
        self.message.is_some()
    }
}

pub struct IndexLinker {
    service: Arc<dyn DocumentService>,
    settings: LinkSettings,
}

impl IndexLinker {
    pub fn new(service: Arc<dyn DocumentService>, settings: LinkSettings) -> Self {
        Self { service, settings }
    }

    pub async fn attach(&self, index_id: &str, file_id: &str) -> TransferResult<AttachOutcome> {
        if index_id.trim().is_empty() || file_id.trim().is_empty() {
            return Err(TransferError::Validation(
                "index id and file id are required".into(),
            ));
        }
        let service = self.service.as_ref();

        let readiness = await_status(
            &format!("file {file_id}"),
            &self.settings.fetch_retry,
            self.settings.file_poll,
            || async move { service.get_file(file_id).await.map(|file| file.status) },
            RemoteStatus::is_terminal,
        )
        .await?;
        if !readiness.reached_terminal {
            warn!(
                file_id,
                index_id,
                status = %readiness.status,
                "file still processing; attaching anyway"
            );
        }

        let label = format!("attach {file_id} to {index_id}");
        let attached = self
            .settings
            .attach_retry
            .execute_if(
                &label,
                || service.attach_file_to_index(index_id, file_id),
                RemoteError::is_retryable,
            )
            .await;
        let attached = match attached {
            Ok(file) => file,
            Err(err) if err.timed_out() => {
                warn!(file_id, index_id, error = %err, "attach timed out; reporting as pending");
                return Ok(AttachOutcome {
                    id: file_id.to_string(),
                    index_id: index_id.to_string(),
                    status: RemoteStatus::Processing,
                    file_ready: readiness.reached_terminal,
                    verified: false,
                    message: Some(PENDING_ATTACH_MESSAGE.to_string()),
                });
            }
            Err(err) => {
                return Err(classify_failure(
                    &format!("index {index_id} or file {file_id}"),
                    err,
                ))
            }
        };

        let verified = match service.list_index_files(index_id).await {
            Ok(files) => files.iter().any(|file| file.id == file_id),
            Err(err) => {
                warn!(index_id, error = %err, "could not list index files to verify attach");
                false
            }
        };
        if !verified {
            warn!(file_id, index_id, "attached file not yet listed in index");
        }
        info!(file_id, index_id, status = %attached.status, verified, "file attached");

        Ok(AttachOutcome {
            id: attached.id,
            index_id: index_id.to_string(),
            status: attached.status,
            file_ready: readiness.reached_terminal,
            verified,
            message: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::memory::{MemoryDocumentService, Scripted};
    use crate::remote::FileUpload;
    use crate::transcode::Transcoded;

    async fn seeded() -> (Arc<MemoryDocumentService>, String) {
        let service = Arc::new(MemoryDocumentService::new());
        service.insert_index("vs_1", "Document Store");
        let file = service
            .create_file(&FileUpload {
                file_name: "notes.txt".into(),
                mime_type: "text/plain".into(),
                payload: Transcoded::from_bytes(bytes::Bytes::from_static(b"notes")),
            })
            .await
            .unwrap();
        (service, file.id)
    }

    fn linker(service: &Arc<MemoryDocumentService>) -> IndexLinker {
        IndexLinker::new(service.clone(), LinkSettings::default())
    }

    #[tokio::test(start_paused = true)]
    async fn waits_for_processing_then_attaches() {
        let (service, file_id) = seeded().await;
        service.set_file_statuses([
            RemoteStatus::Uploaded,
            RemoteStatus::Processing,
            RemoteStatus::Processed,
        ]);

        let outcome = linker(&service).attach("vs_1", &file_id).await.expect("attach");
        assert!(outcome.file_ready);
        assert!(outcome.verified);
        assert!(!outcome.is_pending());
        assert_eq!(service.calls().get_file, 3);
        assert_eq!(service.calls().attach_file_to_index, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn attach_timeout_is_reported_as_pending() {
        let (service, file_id) = seeded().await;
        service.script_attach(std::iter::repeat(Scripted::Hang).take(5));

        let outcome = linker(&service).attach("vs_1", &file_id).await.expect("pending");
        assert!(outcome.is_pending());
        assert_eq!(outcome.status, RemoteStatus::Processing);
        assert_eq!(service.calls().attach_file_to_index, 5);
        let json = serde_json::to_value(&outcome).unwrap();
        assert_eq!(json["status"], "processing");
        assert_eq!(json["id"], file_id.as_str());
    }

    #[tokio::test(start_paused = true)]
    async fn failed_file_is_never_attached() {
        let (service, file_id) = seeded().await;
        service.set_file_statuses([RemoteStatus::Processing, RemoteStatus::Error]);

        let err = linker(&service).attach("vs_1", &file_id).await.expect_err("failed");
        assert_eq!(err.kind(), ErrorKind::RemoteFailed);
        assert_eq!(service.calls().attach_file_to_index, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_processing_still_attaches() {
        let (service, file_id) = seeded().await;
        service.set_file_statuses([RemoteStatus::Processing]);

        let outcome = linker(&service).attach("vs_1", &file_id).await.expect("attach");
        assert!(!outcome.file_ready);
        assert_eq!(service.calls().get_file, 30);
        assert_eq!(service.calls().attach_file_to_index, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn unknown_index_is_not_found() {
        let (service, file_id) = seeded().await;
        let err = linker(&service).attach("vs_missing", &file_id).await.expect_err("404");
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }
}
