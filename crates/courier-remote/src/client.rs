use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use courier_transfer::{
    DocumentService, EventStream, FileUpload, RemoteError, RemoteFile, RemoteIndex, RemoteRun,
    RunRequest,
};
use reqwest::multipart::{Form, Part};
use reqwest::{Body, Client, RequestBuilder, Response};
use reqwest_eventsource::retry::Never;
use reqwest_eventsource::RequestBuilderExt;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::debug;
use url::Url;

use crate::events;
use crate::wire::{AttachFileBody, CreateIndexBody, ListResponse, ResponseBody, RunBody};

const FILE_PURPOSE: &str = "assistants";

#[derive(Debug, Clone)]
pub struct RemoteConfig {
    pub base_url: String,
    pub api_key: String,
    pub model: String,
    pub connect_timeout: Duration,
}

impl RemoteConfig {
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            api_key: api_key.into(),
            model: "gpt-4o-mini".into(),
            connect_timeout: Duration::from_secs(10),
        }
    }
}

/// [`DocumentService`] over the remote HTTP API. Per-attempt deadlines are
/// applied by callers; the client itself only bounds connection setup.
#[derive(Clone)]
pub struct HttpDocumentService {
    http: Client,
    base_url: Url,
    api_key: String,
    model: String,
}

/// How the multipart file body is produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileBody {
    /// One body chunk per transcoded fragment.
    Streamed,
    /// Fragments copied into a single contiguous buffer first.
    Buffered,
}

impl HttpDocumentService {
    pub fn new(config: RemoteConfig) -> Result<Self, RemoteError> {
        let mut base_url = Url::parse(config.base_url.trim())
            .map_err(|err| RemoteError::Decode(format!("invalid remote base url: {err}")))?;
        if !base_url.path().ends_with('/') {
            let path = format!("{}/", base_url.path());
            base_url.set_path(&path);
        }
        let http = Client::builder()
            .connect_timeout(config.connect_timeout)
            .build()
            .map_err(transport_error)?;
        Ok(Self {
            http,
            base_url,
            api_key: config.api_key,
            model: config.model,
        })
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    pub async fn upload_file(
        &self,
        upload: &FileUpload,
        body: FileBody,
    ) -> Result<RemoteFile, RemoteError> {
        let len = upload.payload.len();
        let stream_body = match body {
            FileBody::Streamed => {
                let fragments: Vec<Bytes> = upload.payload.fragments().to_vec();
                Body::wrap_stream(futures::stream::iter(
                    fragments.into_iter().map(Ok::<Bytes, std::io::Error>),
                ))
            }
            FileBody::Buffered => Body::from(upload.payload.coalesce()),
        };
        let part = Part::stream_with_length(stream_body, len)
            .file_name(upload.file_name.clone())
            .mime_str(&upload.mime_type)
            .map_err(|err| {
                RemoteError::Decode(format!("invalid mime type {}: {err}", upload.mime_type))
            })?;
        let form = Form::new().text("purpose", FILE_PURPOSE).part("file", part);

        debug!(file_name = %upload.file_name, bytes = len, body = ?body, "posting file");
        let request = self.request(reqwest::Method::POST, "files")?.multipart(form);
        self.send_json(request).await
    }

    fn endpoint(&self, path: &str) -> Result<Url, RemoteError> {
        self.base_url
            .join(path.trim_start_matches('/'))
            .map_err(|err| RemoteError::Decode(format!("invalid remote path {path}: {err}")))
    }

    fn request(&self, method: reqwest::Method, path: &str) -> Result<RequestBuilder, RemoteError> {
        Ok(self
            .http
            .request(method, self.endpoint(path)?)
            .bearer_auth(&self.api_key))
    }

    async fn get_json<T>(&self, path: &str) -> Result<T, RemoteError>
    where
        T: DeserializeOwned,
    {
        self.send_json(self.request(reqwest::Method::GET, path)?).await
    }

    async fn post_json<T, B>(&self, path: &str, body: &B) -> Result<T, RemoteError>
    where
        T: DeserializeOwned,
        B: Serialize + ?Sized,
    {
        self.send_json(self.request(reqwest::Method::POST, path)?.json(body))
            .await
    }

    async fn send_json<T>(&self, request: RequestBuilder) -> Result<T, RemoteError>
    where
        T: DeserializeOwned,
    {
        let response = request.send().await.map_err(transport_error)?;
        if !response.status().is_success() {
            return Err(status_error(response).await);
        }
        let body = response.bytes().await.map_err(transport_error)?;
        serde_json::from_slice(&body).map_err(|err| RemoteError::Decode(err.to_string()))
    }
}

#[async_trait]
impl DocumentService for HttpDocumentService {
    async fn create_file(&self, upload: &FileUpload) -> Result<RemoteFile, RemoteError> {
        self.upload_file(upload, FileBody::Streamed).await
    }

    async fn get_file(&self, file_id: &str) -> Result<RemoteFile, RemoteError> {
        self.get_json(&format!("files/{file_id}")).await
    }

    async fn create_index(&self, name: &str) -> Result<RemoteIndex, RemoteError> {
        self.post_json("vector_stores", &CreateIndexBody { name }).await
    }

    async fn get_index(&self, index_id: &str) -> Result<RemoteIndex, RemoteError> {
        self.get_json(&format!("vector_stores/{index_id}")).await
    }

    async fn list_index_files(&self, index_id: &str) -> Result<Vec<RemoteFile>, RemoteError> {
        let list: ListResponse<RemoteFile> = self
            .get_json(&format!("vector_stores/{index_id}/files"))
            .await?;
        Ok(list.data)
    }

    async fn get_index_file(
        &self,
        index_id: &str,
        file_id: &str,
    ) -> Result<RemoteFile, RemoteError> {
        self.get_json(&format!("vector_stores/{index_id}/files/{file_id}"))
            .await
    }

    async fn attach_file_to_index(
        &self,
        index_id: &str,
        file_id: &str,
    ) -> Result<RemoteFile, RemoteError> {
        self.post_json(
            &format!("vector_stores/{index_id}/files"),
            &AttachFileBody { file_id },
        )
        .await
    }

    async fn stream_run(&self, request: &RunRequest) -> Result<EventStream, RemoteError> {
        let body = RunBody {
            stream: true,
            ..RunBody::new(&self.model, request)
        };
        let mut source = self
            .request(reqwest::Method::POST, "responses")?
            .json(&body)
            .eventsource()
            .map_err(|err| RemoteError::Stream(err.to_string()))?;
        source.set_retry_policy(Box::new(Never));
        events::open(source).await
    }

    async fn submit_run(&self, request: &RunRequest) -> Result<RemoteRun, RemoteError> {
        let body = RunBody {
            background: true,
            ..RunBody::new(&self.model, request)
        };
        let response: ResponseBody = self.post_json("responses", &body).await?;
        Ok(response.into())
    }

    async fn get_run(&self, run_id: &str) -> Result<RemoteRun, RemoteError> {
        let response: ResponseBody = self.get_json(&format!("responses/{run_id}")).await?;
        Ok(response.into())
    }
}

pub(crate) fn transport_error(err: reqwest::Error) -> RemoteError {
    RemoteError::Transport {
        timeout: err.is_timeout(),
        message: err.to_string(),
    }
}

pub(crate) async fn status_error(response: Response) -> RemoteError {
    let status = response.status().as_u16();
    let body = response.text().await.unwrap_or_default();
    RemoteError::Status { status, body }
}
