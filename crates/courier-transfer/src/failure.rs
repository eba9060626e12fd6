//! Classification of exhausted remote calls into [`TransferError`]s.
//!
//! Structured signals come first: the attempt outcome, the HTTP status, and the
//! JSON error body. Only when those are inconclusive is the error text scanned for
//! memory or timeout phrasing. That scan is a heuristic; upstream wording is not a
//! contract and can change without notice.

use serde_json::Value;

use crate::error::TransferError;
use crate::remote::RemoteError;
use crate::retry::{AttemptError, RetryError};

const MAX_DETAIL_CHARS: usize = 500;

const MEMORY_MARKERS: &[&str] = &["memory", "heap", "sigkill", "killed"];
const TIMEOUT_MARKERS: &[&str] = &["timed out", "timeout", "etimedout"];

/// Error detail recovered from a failed response body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailureDetail {
    pub message: String,
    /// Body was an HTML page, typically from a proxy in front of the service.
    pub html: bool,
}

/// `subject` names what was being operated on, e.g. `index vs_123`, and is used
/// for not-found reporting.
pub fn classify_failure(subject: &str, err: RetryError<RemoteError>) -> TransferError {
    match err.last {
        AttemptError::TimedOut(after) => TransferError::UpstreamTimeout(format!(
            "{} did not respond within {after:?} after {} attempt(s)",
            err.label, err.attempts
        )),
        AttemptError::Failed(remote) => classify_remote_error(subject, remote),
    }
}

pub fn classify_remote_error(subject: &str, err: RemoteError) -> TransferError {
    match err {
        RemoteError::Status { status: 404, .. } => TransferError::NotFound(subject.to_string()),
        RemoteError::Status {
            status: 408 | 504,
            body,
        } => TransferError::UpstreamTimeout(parse_detail(&body).message),
        RemoteError::Status { status: 507, body } => {
            TransferError::UpstreamOutOfMemory(parse_detail(&body).message)
        }
        RemoteError::Status { status, body } => {
            let detail = parse_detail(&body);
            from_message(detail.message, Some(status), detail.html)
        }
        RemoteError::Transport {
            message,
            timeout: true,
        } => TransferError::UpstreamTimeout(message),
        RemoteError::Transport { message, .. } | RemoteError::Stream(message) => {
            from_message(message, None, false)
        }
        RemoteError::Decode(message) => TransferError::UpstreamFault {
            status: None,
            message,
            opaque_gateway: false,
        },
    }
}

/// JSON first, then raw text with an HTML sniff.
pub fn parse_detail(body: &str) -> FailureDetail {
    let trimmed = body.trim();
    if trimmed.is_empty() {
        return FailureDetail {
            message: "empty response body".into(),
            html: false,
        };
    }

    if let Ok(value) = serde_json::from_str::<Value>(trimmed) {
        if let Some(message) = json_message(&value) {
            return FailureDetail {
                message,
                html: false,
            };
        }
    }

    if looks_like_html(trimmed) {
        let message = html_title(trimmed)
            .map(|title| format!("upstream gateway error: {title}"))
            .unwrap_or_else(|| "upstream gateway returned an HTML error page".into());
        return FailureDetail {
            message,
            html: true,
        };
    }

    FailureDetail {
        message: truncate(trimmed),
        html: false,
    }
}

fn from_message(message: String, status: Option<u16>, html: bool) -> TransferError {
    if !html {
        let lowered = message.to_ascii_lowercase();
        if mentions_memory(&lowered) {
            return TransferError::UpstreamOutOfMemory(message);
        }
        if TIMEOUT_MARKERS.iter().any(|marker| lowered.contains(marker)) {
            return TransferError::UpstreamTimeout(message);
        }
    }
    TransferError::UpstreamFault {
        status,
        message,
        opaque_gateway: html,
    }
}

fn mentions_memory(lowered: &str) -> bool {
    MEMORY_MARKERS.iter().any(|marker| lowered.contains(marker))
        || lowered
            .split(|c: char| !c.is_ascii_alphanumeric())
            .any(|word| word == "oom")
}

fn json_message(value: &Value) -> Option<String> {
    let error = value.get("error");
    error
        .and_then(|e| e.get("message"))
        .and_then(Value::as_str)
        .or_else(|| error.and_then(Value::as_str))
        .or_else(|| value.get("message").and_then(Value::as_str))
        .or_else(|| value.get("detail").and_then(Value::as_str))
        .map(str::to_string)
}

fn looks_like_html(body: &str) -> bool {
    let head: String = body.chars().take(32).collect::<String>().to_ascii_lowercase();
    head.starts_with("<!doctype") || head.starts_with("<html")
}

fn html_title(body: &str) -> Option<String> {
    let lowered = body.to_ascii_lowercase();
    let start = lowered.find("<title>")? + "<title>".len();
    let end = start + lowered[start..].find("</title>")?;
    let title = body.get(start..end)?.trim();
    (!title.is_empty()).then(|| title.to_string())
}

fn truncate(text: &str) -> String {
    match text.char_indices().nth(MAX_DETAIL_CHARS) {
        Some((cut, _)) => format!("{}...", &text[..cut]),
        None => text.to_string(),
    }
}
