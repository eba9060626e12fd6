use std::io;

use axum::{
    extract::{multipart::MultipartError, Multipart, Path, State},
    http::{header, HeaderMap},
    Json,
};
use base64::{engine::general_purpose::STANDARD, Engine};
use bytes::Bytes;
use courier_transfer::{RemoteFile, TransferError, TransferResult, UploadReceipt, UploadSource};
use futures_util::{stream, TryStreamExt};
use serde::Deserialize;
use tokio_util::io::StreamReader;
use tracing::{info, warn};

use super::{fetch, ApiError, ApiResult};
use crate::{metrics, state::AppState};

const DEFAULT_MIME_TYPE: &str = "application/octet-stream";

/// Room for boundaries, part headers and the optional `size` part.
const MULTIPART_ENVELOPE_ALLOWANCE: u64 = 64 * 1024;

/// Multipart upload. The `file` part is streamed into the transcoder when an
/// earlier `size` part declares its length, and spooled first otherwise.
pub async fn upload_multipart(
    State(state): State<AppState>,
    headers: HeaderMap,
    mut multipart: Multipart,
) -> ApiResult<UploadReceipt> {
    // Content-Length includes the multipart envelope, so only a body too large to
    // hold an acceptable file is refused unread. The exact check runs on the file.
    if let Some(len) = content_length(&headers) {
        let limit = state.uploads().settings().limits.absolute;
        if len > limit.saturating_add(MULTIPART_ENVELOPE_ALLOWANCE) {
            return Err(rejected(&state, TransferError::TooLarge { size: len, limit }));
        }
    }

    let mut declared_len: Option<u64> = None;
    while let Some(field) = multipart.next_field().await.map_err(multipart_error)? {
        let name = field.name().map(str::to_string);
        match name.as_deref() {
            Some("size") => {
                let text = field.text().await.map_err(multipart_error)?;
                let len = text
                    .trim()
                    .parse::<u64>()
                    .map_err(|_| ApiError::bad_request(format!("invalid size field: {text}")))?;
                declared_len = Some(len);
            }
            Some("file") => {
                let file_name = field.file_name().unwrap_or_default().to_string();
                let mime_type = field
                    .content_type()
                    .unwrap_or(DEFAULT_MIME_TYPE)
                    .to_string();
                info!(file_name = %file_name, declared_len, "received multipart upload");

                let result = match declared_len {
                    Some(declared_len) => {
                        let reader = StreamReader::new(Box::pin(field.map_err(read_error)));
                        state
                            .uploads()
                            .upload(UploadSource {
                                reader,
                                declared_len,
                                file_name,
                                mime_type,
                            })
                            .await
                    }
                    None => spool_and_upload(&state, field, file_name, mime_type).await,
                };
                return finish(&state, result);
            }
            _ => {}
        }
    }
    Err(ApiError::bad_request("no file provided"))
}

async fn spool_and_upload(
    state: &AppState,
    mut field: axum::extract::multipart::Field<'_>,
    file_name: String,
    mime_type: String,
) -> TransferResult<UploadReceipt> {
    let limits = state.uploads().settings().limits;
    let mut chunks: Vec<Bytes> = Vec::new();
    let mut total = 0u64;
    while let Some(chunk) = field
        .chunk()
        .await
        .map_err(|err| TransferError::Source(read_error(err)))?
    {
        total += chunk.len() as u64;
        limits.check(total)?;
        chunks.push(chunk);
    }
    let reader = StreamReader::new(stream::iter(chunks.into_iter().map(Ok::<_, io::Error>)));
    state
        .uploads()
        .upload(UploadSource {
            reader,
            declared_len: total,
            file_name,
            mime_type,
        })
        .await
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Base64Upload {
    file_object: Base64File,
}

#[derive(Debug, Deserialize)]
pub struct Base64File {
    name: String,
    content: String,
    #[serde(rename = "type", default)]
    mime_type: Option<String>,
}

pub async fn upload_base64(
    State(state): State<AppState>,
    Json(request): Json<Base64Upload>,
) -> ApiResult<UploadReceipt> {
    let Base64File {
        name,
        content,
        mime_type,
    } = request.file_object;
    let encoded = strip_data_url(content.trim());

    if let Err(err) = state.uploads().settings().limits.check(decoded_estimate(encoded)) {
        return Err(rejected(&state, err));
    }
    let decoded = STANDARD
        .decode(encoded)
        .map_err(|err| ApiError::bad_request(format!("file content is not valid base64: {err}")))?;
    info!(file_name = %name, bytes = decoded.len(), "received base64 upload");

    let result = state
        .uploads()
        .upload_bytes(
            Bytes::from(decoded),
            name,
            mime_type.unwrap_or_else(|| DEFAULT_MIME_TYPE.to_string()),
        )
        .await;
    finish(&state, result)
}

pub async fn get_file(
    State(state): State<AppState>,
    Path(file_id): Path<String>,
) -> ApiResult<RemoteFile> {
    let subject = format!("file {file_id}");
    let file = fetch(&state, &subject, || state.service().get_file(&file_id)).await?;
    Ok(Json(file))
}

fn finish(state: &AppState, result: TransferResult<UploadReceipt>) -> ApiResult<UploadReceipt> {
    match result {
        Ok(receipt) => {
            metrics::UPLOADS.with_label_values(&["ok"]).inc();
            metrics::UPLOADED_BYTES.inc_by(receipt.bytes);
            Ok(Json(receipt))
        }
        Err(err) => Err(rejected(state, err)),
    }
}

fn rejected(state: &AppState, err: TransferError) -> ApiError {
    let kind = err.kind();
    metrics::UPLOADS.with_label_values(&[kind.code()]).inc();
    if kind.suggests_smaller_file() {
        warn!(error = %err, code = kind.code(), "upload rejected; a smaller file may succeed");
    } else {
        warn!(error = %err, code = kind.code(), "upload failed");
    }
    ApiError::transfer(err, state)
}

fn content_length(headers: &HeaderMap) -> Option<u64> {
    headers
        .get(header::CONTENT_LENGTH)?
        .to_str()
        .ok()?
        .parse()
        .ok()
}

fn multipart_error(err: MultipartError) -> ApiError {
    ApiError::bad_request(err.body_text())
}

fn read_error(err: MultipartError) -> io::Error {
    io::Error::other(err.body_text())
}

/// Accepts both bare base64 and `data:<mime>;base64,<payload>` URLs.
fn strip_data_url(content: &str) -> &str {
    if content.starts_with("data:") {
        content
            .split_once(',')
            .map_or(content, |(_, payload)| payload)
    } else {
        content
    }
}

/// Decoded size implied by an encoded length, before paying for the decode.
fn decoded_estimate(encoded: &str) -> u64 {
    let padding = encoded.bytes().rev().take_while(|b| *b == b'=').count() as u64;
    (encoded.len() as u64 / 4 * 3).saturating_sub(padding.min(2))
}
