use std::time::Duration;

use serde::Serialize;
use thiserror::Error;

use crate::remote::RemoteStatus;

/// Stable classification of a [`TransferError`], rendered as the `code` field of
/// error responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Validation,
    NotFound,
    TooLarge,
    TooLargeForEnvironment,
    UploadTimeout,
    ServerOutOfMemory,
    UpstreamFault,
    UpstreamGateway,
    RemoteFailed,
    StreamStall,
}

impl ErrorKind {
    pub fn code(self) -> &'static str {
        match self {
            ErrorKind::Validation => "validation_error",
            ErrorKind::NotFound => "not_found",
            ErrorKind::TooLarge => "file_too_large",
            ErrorKind::TooLargeForEnvironment => "file_too_large_for_environment",
            ErrorKind::UploadTimeout => "upload_timeout",
            ErrorKind::ServerOutOfMemory => "server_out_of_memory",
            ErrorKind::UpstreamFault => "upstream_fault",
            ErrorKind::UpstreamGateway => "upstream_gateway_error",
            ErrorKind::RemoteFailed => "remote_failed",
            ErrorKind::StreamStall => "stream_stall",
        }
    }

    /// Whether the failure is worth suggesting a smaller file to the user.
    pub fn suggests_smaller_file(self) -> bool {
        matches!(
            self,
            ErrorKind::TooLarge
                | ErrorKind::TooLargeForEnvironment
                | ErrorKind::UploadTimeout
                | ErrorKind::ServerOutOfMemory
        )
    }
}

#[derive(Debug, Error)]
pub enum TransferError {
    #[error("{0}")]
    Validation(String),
    #[error("{0} not found")]
    NotFound(String),
    #[error("file size {size} bytes exceeds the {limit} byte limit")]
    TooLarge { size: u64, limit: u64 },
    #[error("file size {size} bytes exceeds the {limit} byte limit recommended for this deployment")]
    TooLargeForEnvironment { size: u64, limit: u64 },
    #[error("upstream timed out: {0}")]
    UpstreamTimeout(String),
    #[error("upstream ran out of memory: {0}")]
    UpstreamOutOfMemory(String),
    #[error("upstream fault: {message}")]
    UpstreamFault {
        status: Option<u16>,
        message: String,
        opaque_gateway: bool,
    },
    #[error("{resource} reported terminal status {status}")]
    RemoteFailed {
        resource: String,
        status: RemoteStatus,
    },
    #[error("upstream stream stalled for {0:?} without an event")]
    StreamStall(Duration),
    #[error("failed to read upload source: {0}")]
    Source(#[from] std::io::Error),
}

pub type TransferResult<T> = Result<T, TransferError>;

impl TransferError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            TransferError::Validation(_) | TransferError::Source(_) => ErrorKind::Validation,
            TransferError::NotFound(_) => ErrorKind::NotFound,
            TransferError::TooLarge { .. } => ErrorKind::TooLarge,
            TransferError::TooLargeForEnvironment { .. } => ErrorKind::TooLargeForEnvironment,
            TransferError::UpstreamTimeout(_) => ErrorKind::UploadTimeout,
            TransferError::UpstreamOutOfMemory(_) => ErrorKind::ServerOutOfMemory,
            TransferError::UpstreamFault {
                opaque_gateway: true,
                ..
            } => ErrorKind::UpstreamGateway,
            TransferError::UpstreamFault { .. } => ErrorKind::UpstreamFault,
            TransferError::RemoteFailed { .. } => ErrorKind::RemoteFailed,
            TransferError::StreamStall(_) => ErrorKind::StreamStall,
        }
    }

    pub fn status_code(&self) -> u16 {
        match self {
            TransferError::Validation(_) | TransferError::Source(_) => 400,
            TransferError::NotFound(_) => 404,
            TransferError::TooLarge { .. } | TransferError::TooLargeForEnvironment { .. } => 413,
            TransferError::UpstreamTimeout(_) | TransferError::StreamStall(_) => 504,
            TransferError::UpstreamOutOfMemory(_) => 507,
            TransferError::UpstreamFault {
                status: Some(status),
                ..
            } if (500..600).contains(status) => *status,
            TransferError::UpstreamFault { .. } | TransferError::RemoteFailed { .. } => 502,
        }
    }

    /// Validation and size errors describe the request itself and are never retried.
    pub fn is_client_error(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::Validation
                | ErrorKind::NotFound
                | ErrorKind::TooLarge
                | ErrorKind::TooLargeForEnvironment
        )
    }
}
