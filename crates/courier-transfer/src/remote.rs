//! Boundary with the remote document-processing service.
//!
//! The service is opaque: it stores files, indexes them into searchable
//! collections, and runs analyses that either stream events or complete in the
//! background. Everything here is transport-neutral; `courier-remote` provides the
//! HTTP implementation and [`crate::memory`] an in-process one.

use std::fmt;

use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::conversation::Conversation;
use crate::transcode::Transcoded;

/// Status field of a remote file, index membership, or run. Transitions are
/// server-driven; this side only observes them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RemoteStatus {
    Uploaded,
    Processing,
    Processed,
    Error,
    Queued,
    InProgress,
    Completed,
    Failed,
    Cancelled,
    Incomplete,
    #[serde(other)]
    Unknown,
}

impl RemoteStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            RemoteStatus::Uploaded => "uploaded",
            RemoteStatus::Processing => "processing",
            RemoteStatus::Processed => "processed",
            RemoteStatus::Error => "error",
            RemoteStatus::Queued => "queued",
            RemoteStatus::InProgress => "in_progress",
            RemoteStatus::Completed => "completed",
            RemoteStatus::Failed => "failed",
            RemoteStatus::Cancelled => "cancelled",
            RemoteStatus::Incomplete => "incomplete",
            RemoteStatus::Unknown => "unknown",
        }
    }

    /// Explicit failure states. Observing one of these always ends a wait with an error.
    pub fn is_failure(self) -> bool {
        matches!(
            self,
            RemoteStatus::Error | RemoteStatus::Failed | RemoteStatus::Cancelled
        )
    }

    /// States after which the remote side will not transition the resource again.
    pub fn is_terminal(self) -> bool {
        self.is_failure()
            || matches!(
                self,
                RemoteStatus::Processed | RemoteStatus::Completed | RemoteStatus::Incomplete
            )
    }

    /// Still moving through the remote pipeline.
    pub fn is_pending(self) -> bool {
        matches!(
            self,
            RemoteStatus::Uploaded
                | RemoteStatus::Processing
                | RemoteStatus::Queued
                | RemoteStatus::InProgress
        )
    }
}

impl fmt::Display for RemoteStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteFile {
    pub id: String,
    pub status: RemoteStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bytes: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filename: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_details: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteIndex {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteRun {
    pub id: String,
    pub status: RemoteStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_text: Option<String>,
}

/// One file ready for submission. `payload` fragments are reference counted, so
/// cloning an upload for a retry does not copy file data.
#[derive(Debug, Clone)]
pub struct FileUpload {
    pub file_name: String,
    pub mime_type: String,
    pub payload: Transcoded,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunRequest {
    pub index_id: String,
    pub instructions: String,
    #[serde(default)]
    pub conversation: Conversation,
}

/// Coarse category of an upstream event, derived from its name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    TextDelta,
    ToolCallStarted,
    ToolCallCompleted,
    ItemAdded,
    ItemDone,
    Other,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpstreamEvent {
    pub name: String,
    pub payload: Value,
}

impl UpstreamEvent {
    pub fn new(name: impl Into<String>, payload: Value) -> Self {
        Self {
            name: name.into(),
            payload,
        }
    }

    pub fn kind(&self) -> EventKind {
        let name = self.name.as_str();
        if name.ends_with("output_text.delta") {
            EventKind::TextDelta
        } else if name.ends_with("output_item.added") {
            EventKind::ItemAdded
        } else if name.ends_with("output_item.done") {
            EventKind::ItemDone
        } else if name.contains("_call") {
            if name.ends_with(".completed") || name.ends_with(".done") {
                EventKind::ToolCallCompleted
            } else if name.ends_with(".in_progress") || name.ends_with(".searching") {
                EventKind::ToolCallStarted
            } else {
                EventKind::Other
            }
        } else {
            EventKind::Other
        }
    }
}

pub type EventStream = BoxStream<'static, Result<UpstreamEvent, RemoteError>>;

#[derive(Debug, Clone, Error)]
pub enum RemoteError {
    #[error("remote returned status {status}: {body}")]
    Status { status: u16, body: String },
    #[error("transport error: {message}")]
    Transport { message: String, timeout: bool },
    #[error("invalid remote response: {0}")]
    Decode(String),
    #[error("remote event stream failed: {0}")]
    Stream(String),
}

impl RemoteError {
    pub fn status(&self) -> Option<u16> {
        match self {
            RemoteError::Status { status, .. } => Some(*status),
            _ => None,
        }
    }

    pub fn is_timeout(&self) -> bool {
        match self {
            RemoteError::Transport { timeout, .. } => *timeout,
            RemoteError::Status { status, .. } => matches!(status, 408 | 504),
            _ => false,
        }
    }

    /// Transient failures worth another attempt. Client-side rejections are final.
    pub fn is_retryable(&self) -> bool {
        match self {
            RemoteError::Status { status, .. } => {
                matches!(status, 408 | 409 | 429) || (500..600).contains(status)
            }
            RemoteError::Transport { .. } | RemoteError::Stream(_) => true,
            RemoteError::Decode(_) => false,
        }
    }
}

/// Operations the remote document service exposes.
#[async_trait]
pub trait DocumentService: Send + Sync {
    async fn create_file(&self, upload: &FileUpload) -> Result<RemoteFile, RemoteError>;

    async fn get_file(&self, file_id: &str) -> Result<RemoteFile, RemoteError>;

    async fn create_index(&self, name: &str) -> Result<RemoteIndex, RemoteError>;

    async fn get_index(&self, index_id: &str) -> Result<RemoteIndex, RemoteError>;

    async fn list_index_files(&self, index_id: &str) -> Result<Vec<RemoteFile>, RemoteError>;

    /// Indexing status of one file inside an index.
    async fn get_index_file(&self, index_id: &str, file_id: &str)
        -> Result<RemoteFile, RemoteError>;

    async fn attach_file_to_index(
        &self,
        index_id: &str,
        file_id: &str,
    ) -> Result<RemoteFile, RemoteError>;

    /// Starts a run and returns its event stream.
    async fn stream_run(&self, request: &RunRequest) -> Result<EventStream, RemoteError>;

    /// Starts a run that completes in the background.
    async fn submit_run(&self, request: &RunRequest) -> Result<RemoteRun, RemoteError>;

    async fn get_run(&self, run_id: &str) -> Result<RemoteRun, RemoteError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn unknown_statuses_deserialize_to_unknown() {
        let status: RemoteStatus = serde_json::from_value(json!("requires_action")).unwrap();
        assert_eq!(status, RemoteStatus::Unknown);
        let status: RemoteStatus = serde_json::from_value(json!("in_progress")).unwrap();
        assert_eq!(status, RemoteStatus::InProgress);
    }

    #[test]
    fn failure_states_are_terminal() {
        for status in [
            RemoteStatus::Error,
            RemoteStatus::Failed,
            RemoteStatus::Cancelled,
        ] {
            assert!(status.is_failure());
            assert!(status.is_terminal());
        }
        assert!(!RemoteStatus::Processing.is_terminal());
        assert!(RemoteStatus::Processing.is_pending());
    }

    #[test]
    fn event_kinds_follow_names() {
        let kind = |name: &str| UpstreamEvent::new(name, Value::Null).kind();
        assert_eq!(kind("response.output_text.delta"), EventKind::TextDelta);
        assert_eq!(kind("response.output_item.added"), EventKind::ItemAdded);
        assert_eq!(kind("response.output_item.done"), EventKind::ItemDone);
        assert_eq!(
            kind("response.file_search_call.searching"),
            EventKind::ToolCallStarted
        );
        assert_eq!(
            kind("response.file_search_call.completed"),
            EventKind::ToolCallCompleted
        );
        assert_eq!(kind("response.created"), EventKind::Other);
    }

    #[test]
    fn only_transient_errors_retry() {
        assert!(RemoteError::Status {
            status: 503,
            body: String::new()
        }
        .is_retryable());
        assert!(RemoteError::Status {
            status: 429,
            body: String::new()
        }
        .is_retryable());
        assert!(!RemoteError::Status {
            status: 400,
            body: String::new()
        }
        .is_retryable());
        assert!(!RemoteError::Decode("bad json".into()).is_retryable());
    }
}
