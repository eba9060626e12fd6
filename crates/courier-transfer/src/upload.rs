//! Upload orchestration: validate, transcode, submit, interpret.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use serde::Serialize;
use tokio::io::AsyncRead;
use tokio::time::Instant;
use tracing::{info, warn};

use crate::error::{TransferError, TransferResult};
use crate::failure::classify_failure;
use crate::remote::{DocumentService, FileUpload, RemoteError, RemoteFile, RemoteStatus};
use crate::retry::{AttemptError, RetryError, RetryPolicy};
use crate::transcode::{transcode_task, SizeBands, TransferTask, MEBI_BYTE};

/// Size ceilings. `recommended` is the stricter per-deployment limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UploadLimits {
    pub absolute: u64,
    pub recommended: Option<u64>,
}

impl Default for UploadLimits {
    fn default() -> Self {
        Self {
            absolute: 100 * MEBI_BYTE,
            recommended: None,
        }
    }
}

impl UploadLimits {
    pub fn check(&self, size: u64) -> TransferResult<()> {
        if size > self.absolute {
            return Err(TransferError::TooLarge {
                size,
                limit: self.absolute,
            });
        }
        match self.recommended {
            Some(limit) if size > limit => Err(TransferError::TooLargeForEnvironment { size, limit }),
            _ => Ok(()),
        }
    }
}

/// Per-attempt timeout that grows with the payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UploadTimeoutScale {
    pub base: Duration,
    pub per_mib: Duration,
    pub min: Duration,
    pub max: Duration,
}

impl Default for UploadTimeoutScale {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(30),
            per_mib: Duration::from_secs(2),
            min: Duration::from_secs(30),
            max: Duration::from_secs(300),
        }
    }
}

impl UploadTimeoutScale {
    pub fn for_size(&self, bytes: u64) -> Duration {
        let mib = u32::try_from(bytes.div_ceil(MEBI_BYTE)).unwrap_or(u32::MAX);
        let scaled = self.base.saturating_add(self.per_mib.saturating_mul(mib));
        scaled.clamp(self.min, self.max.max(self.min))
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct UploadSettings {
    pub limits: UploadLimits,
    pub bands: SizeBands,
    /// Attempt budget per strategy. Its timeout is replaced by `timeout_scale`.
    pub retry: RetryPolicy,
    pub timeout_scale: UploadTimeoutScale,
}

impl Default for UploadSettings {
    fn default() -> Self {
        Self {
            limits: UploadLimits::default(),
            bands: SizeBands::default(),
            retry: RetryPolicy::new(3, Duration::from_millis(2_000), Duration::from_secs(30)),
            timeout_scale: UploadTimeoutScale::default(),
        }
    }
}

/// One way of getting a file to the remote service.
#[async_trait]
pub trait UploadStrategy: Send + Sync {
    fn name(&self) -> &'static str;

    async fn attempt(&self, upload: &FileUpload) -> Result<RemoteFile, RemoteError>;
}

/// Streams the fragments through [`DocumentService::create_file`].
pub struct ServiceUpload {
    service: Arc<dyn DocumentService>,
}

impl ServiceUpload {
    pub fn new(service: Arc<dyn DocumentService>) -> Self {
        Self { service }
    }
}

#[async_trait]
impl UploadStrategy for ServiceUpload {
    fn name(&self) -> &'static str {
        "streamed"
    }

    async fn attempt(&self, upload: &FileUpload) -> Result<RemoteFile, RemoteError> {
        self.service.create_file(upload).await
    }
}

/// An inbound file whose length was declared before its bytes arrive.
pub struct UploadSource<R> {
    pub reader: R,
    pub declared_len: u64,
    pub file_name: String,
    pub mime_type: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadReceipt {
    pub id: String,
    pub status: RemoteStatus,
    /// Accepted, but the remote side is still processing the file.
    pub pending: bool,
    pub bytes: u64,
    pub file_name: String,
}

pub struct UploadGateway {
    settings: UploadSettings,
    strategies: Vec<Arc<dyn UploadStrategy>>,
}

impl UploadGateway {
    /// `strategies` are tried in order; a later one only runs when the previous
    /// one failed transiently.
    pub fn new(settings: UploadSettings, strategies: Vec<Arc<dyn UploadStrategy>>) -> Self {
        Self {
            settings,
            strategies,
        }
    }

    pub fn settings(&self) -> &UploadSettings {
        &self.settings
    }

    pub fn validate(&self, file_name: &str, declared_len: u64) -> TransferResult<()> {
        if file_name.trim().is_empty() {
            return Err(TransferError::Validation("file name is required".into()));
        }
        if declared_len == 0 {
            return Err(TransferError::Validation("file is empty".into()));
        }
        self.settings.limits.check(declared_len)
    }

    pub async fn upload<R>(&self, source: UploadSource<R>) -> TransferResult<UploadReceipt>
    where
        R: AsyncRead + Unpin + Send,
    {
        let UploadSource {
            mut reader,
            declared_len,
            file_name,
            mime_type,
        } = source;
        self.validate(&file_name, declared_len)?;

        let strategy = self.settings.bands.strategy_for(declared_len);
        let task = TransferTask::plan(declared_len, strategy, mime_type, file_name)?;
        let payload = transcode_task(&mut reader, &task).await?;
        self.submit(FileUpload {
            file_name: task.destination_name().to_string(),
            mime_type: task.mime_type().to_string(),
            payload,
        })
        .await
    }

    /// For payloads that are already in memory, such as decoded base64. The
    /// buffer goes through the same size bands as a streamed source.
    pub async fn upload_bytes(
        &self,
        bytes: Bytes,
        file_name: String,
        mime_type: String,
    ) -> TransferResult<UploadReceipt> {
        self.upload(UploadSource {
            reader: &bytes[..],
            declared_len: bytes.len() as u64,
            file_name,
            mime_type,
        })
        .await
    }

    async fn submit(&self, upload: FileUpload) -> TransferResult<UploadReceipt> {
        let bytes = upload.payload.len();
        let policy = self
            .settings
            .retry
            .with_timeout(self.settings.timeout_scale.for_size(bytes));
        let started = Instant::now();
        info!(
            file_name = %upload.file_name,
            bytes,
            fragments = upload.payload.fragments().len(),
            timeout_ms = policy.per_attempt_timeout().as_millis() as u64,
            "submitting upload"
        );

        let mut last_failure: Option<RetryError<RemoteError>> = None;
        for strategy in &self.strategies {
            let label = format!("upload {} ({})", upload.file_name, strategy.name());
            let result = policy
                .execute_if(&label, || strategy.attempt(&upload), RemoteError::is_retryable)
                .await;
            match result {
                Ok(file) => {
                    info!(
                        file_id = %file.id,
                        status = %file.status,
                        strategy = strategy.name(),
                        elapsed_ms = started.elapsed().as_millis() as u64,
                        "upload accepted"
                    );
                    return receipt(file, &upload);
                }
                Err(err) => {
                    let transient = match &err.last {
                        AttemptError::TimedOut(_) => true,
                        AttemptError::Failed(remote) => remote.is_retryable(),
                    };
                    warn!(
                        strategy = strategy.name(),
                        transient,
                        error = %err,
                        "upload strategy exhausted"
                    );
                    last_failure = Some(err);
                    if !transient {
                        break;
                    }
                }
            }
        }

        match last_failure {
            Some(err) => Err(classify_failure("file upload", err)),
            None => Err(TransferError::Validation(
                "no upload strategy is configured".into(),
            )),
        }
    }
}

fn receipt(file: RemoteFile, upload: &FileUpload) -> TransferResult<UploadReceipt> {
    if file.status.is_failure() {
        return Err(TransferError::RemoteFailed {
            resource: format!("file {}", file.id),
            status: file.status,
        });
    }
    Ok(UploadReceipt {
        pending: matches!(
            file.status,
            RemoteStatus::Processing | RemoteStatus::Queued | RemoteStatus::InProgress
        ),
        bytes: file.bytes.unwrap_or_else(|| upload.payload.len()),
        file_name: file.filename.unwrap_or_else(|| upload.file_name.clone()),
        id: file.id,
        status: file.status,
    })
}
