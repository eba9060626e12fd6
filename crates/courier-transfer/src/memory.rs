//! In-process [`DocumentService`] for tests and for running the gateway without
//! remote credentials.
//!
//! Failures, hangs, status progressions and run event streams can be scripted;
//! every call is counted.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use parking_lot::Mutex;
use serde_json::json;
use uuid::Uuid;

use crate::remote::{
    DocumentService, EventStream, FileUpload, RemoteError, RemoteFile, RemoteIndex, RemoteRun,
    RemoteStatus, RunRequest, UpstreamEvent,
};

/// Scripted behavior for one call. Unscripted calls succeed.
#[derive(Debug, Clone)]
pub enum Scripted {
    Fail(RemoteError),
    /// Never completes.
    Hang,
    /// Succeeds after the delay.
    Delay(Duration),
}

/// One step of a scripted run stream.
#[derive(Debug, Clone)]
pub enum RunStep {
    Event(UpstreamEvent),
    Pause(Duration),
    Fault(RemoteError),
    /// Stops producing events without ending the stream.
    Stall,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CallCounts {
    pub create_file: u32,
    pub get_file: u32,
    pub create_index: u32,
    pub get_index: u32,
    pub list_index_files: u32,
    pub get_index_file: u32,
    pub attach_file_to_index: u32,
    pub stream_run: u32,
    pub submit_run: u32,
    pub get_run: u32,
}

/// Statuses handed out in order; the last one repeats.
#[derive(Debug)]
struct StatusScript {
    queue: VecDeque<RemoteStatus>,
    fallback: RemoteStatus,
}

impl StatusScript {
    fn new(fallback: RemoteStatus) -> Self {
        Self {
            queue: VecDeque::new(),
            fallback,
        }
    }

    fn next(&mut self) -> RemoteStatus {
        if self.queue.len() > 1 {
            self.queue.pop_front().unwrap_or(self.fallback)
        } else {
            self.queue.front().copied().unwrap_or(self.fallback)
        }
    }
}

struct StoredFile {
    name: String,
    data: Vec<u8>,
}

struct StoredRun {
    output: Option<String>,
}

struct State {
    files: HashMap<String, StoredFile>,
    indexes: HashMap<String, (String, Vec<String>)>,
    runs: HashMap<String, StoredRun>,
    create_file_script: VecDeque<Scripted>,
    attach_script: VecDeque<Scripted>,
    file_statuses: StatusScript,
    index_file_statuses: StatusScript,
    run_statuses: StatusScript,
    run_steps: Option<Vec<RunStep>>,
    run_output: Option<String>,
    last_run_request: Option<RunRequest>,
    calls: CallCounts,
}

pub struct MemoryDocumentService {
    state: Mutex<State>,
}

impl Default for MemoryDocumentService {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryDocumentService {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State {
                files: HashMap::new(),
                indexes: HashMap::new(),
                runs: HashMap::new(),
                create_file_script: VecDeque::new(),
                attach_script: VecDeque::new(),
                file_statuses: StatusScript::new(RemoteStatus::Processed),
                index_file_statuses: StatusScript::new(RemoteStatus::Completed),
                run_statuses: StatusScript::new(RemoteStatus::Completed),
                run_steps: None,
                run_output: None,
                last_run_request: None,
                calls: CallCounts::default(),
            }),
        }
    }

    pub fn script_create_file(&self, steps: impl IntoIterator<Item = Scripted>) {
        self.state.lock().create_file_script.extend(steps);
    }

    pub fn script_attach(&self, steps: impl IntoIterator<Item = Scripted>) {
        self.state.lock().attach_script.extend(steps);
    }

    pub fn set_file_statuses(&self, statuses: impl IntoIterator<Item = RemoteStatus>) {
        self.state.lock().file_statuses.queue = statuses.into_iter().collect();
    }

    pub fn set_index_file_statuses(&self, statuses: impl IntoIterator<Item = RemoteStatus>) {
        self.state.lock().index_file_statuses.queue = statuses.into_iter().collect();
    }

    pub fn set_run_statuses(&self, statuses: impl IntoIterator<Item = RemoteStatus>) {
        self.state.lock().run_statuses.queue = statuses.into_iter().collect();
    }

    pub fn set_run_output(&self, text: impl Into<String>) {
        self.state.lock().run_output = Some(text.into());
    }

    /// Replaces the default echo reply of [`DocumentService::stream_run`].
    pub fn script_run(&self, steps: impl IntoIterator<Item = RunStep>) {
        self.state.lock().run_steps = Some(steps.into_iter().collect());
    }

    pub fn insert_index(&self, index_id: &str, name: &str) {
        self.state
            .lock()
            .indexes
            .insert(index_id.to_string(), (name.to_string(), Vec::new()));
    }

    pub fn insert_index_file(&self, index_id: &str, file_id: &str) {
        let mut state = self.state.lock();
        if let Some((_, files)) = state.indexes.get_mut(index_id) {
            files.push(file_id.to_string());
        }
    }

    pub fn calls(&self) -> CallCounts {
        self.state.lock().calls
    }

    pub fn file_contents(&self, file_id: &str) -> Option<Vec<u8>> {
        self.state
            .lock()
            .files
            .get(file_id)
            .map(|file| file.data.clone())
    }

    pub fn last_run_request(&self) -> Option<RunRequest> {
        self.state.lock().last_run_request.clone()
    }

    async fn play(step: Option<Scripted>) -> Result<(), RemoteError> {
        match step {
            None => Ok(()),
            Some(Scripted::Fail(err)) => Err(err),
            Some(Scripted::Hang) => std::future::pending().await,
            Some(Scripted::Delay(delay)) => {
                tokio::time::sleep(delay).await;
                Ok(())
            }
        }
    }

    fn echo_steps(request: &RunRequest) -> Vec<RunStep> {
        let text = format!(
            "No remote service is configured. Instructions received for index {}: {}",
            request.index_id, request.instructions
        );
        vec![
            RunStep::Event(UpstreamEvent::new(
                "response.output_item.added",
                json!({"item": {"type": "message", "id": "msg_local"}}),
            )),
            RunStep::Event(UpstreamEvent::new(
                "response.output_text.delta",
                json!({"item_id": "msg_local", "delta": text}),
            )),
            RunStep::Event(UpstreamEvent::new(
                "response.output_item.done",
                json!({"item": {"type": "message", "id": "msg_local"}}),
            )),
        ]
    }
}

fn not_found(what: &str) -> RemoteError {
    RemoteError::Status {
        status: 404,
        body: json!({"error": {"message": format!("No such {what}")}}).to_string(),
    }
}

fn new_id(prefix: &str) -> String {
    format!("{prefix}-{}", Uuid::new_v4().simple())
}

#[async_trait]
impl DocumentService for MemoryDocumentService {
    async fn create_file(&self, upload: &FileUpload) -> Result<RemoteFile, RemoteError> {
        let step = {
            let mut state = self.state.lock();
            state.calls.create_file += 1;
            state.create_file_script.pop_front()
        };
        Self::play(step).await?;

        let id = new_id("file");
        let data = upload.payload.coalesce().to_vec();
        let bytes = data.len() as u64;
        self.state.lock().files.insert(
            id.clone(),
            StoredFile {
                name: upload.file_name.clone(),
                data,
            },
        );
        Ok(RemoteFile {
            id,
            status: RemoteStatus::Processed,
            bytes: Some(bytes),
            filename: Some(upload.file_name.clone()),
            status_details: None,
        })
    }

    async fn get_file(&self, file_id: &str) -> Result<RemoteFile, RemoteError> {
        let mut state = self.state.lock();
        state.calls.get_file += 1;
        let status = state.file_statuses.next();
        let file = state.files.get(file_id).ok_or_else(|| not_found("file"))?;
        Ok(RemoteFile {
            id: file_id.to_string(),
            status,
            bytes: Some(file.data.len() as u64),
            filename: Some(file.name.clone()),
            status_details: None,
        })
    }

    async fn create_index(&self, name: &str) -> Result<RemoteIndex, RemoteError> {
        let id = new_id("vs");
        let mut state = self.state.lock();
        state.calls.create_index += 1;
        state
            .indexes
            .insert(id.clone(), (name.to_string(), Vec::new()));
        Ok(RemoteIndex {
            id,
            name: Some(name.to_string()),
        })
    }

    async fn get_index(&self, index_id: &str) -> Result<RemoteIndex, RemoteError> {
        let mut state = self.state.lock();
        state.calls.get_index += 1;
        let (name, _) = state.indexes.get(index_id).ok_or_else(|| not_found("index"))?;
        Ok(RemoteIndex {
            id: index_id.to_string(),
            name: Some(name.clone()),
        })
    }

    async fn list_index_files(&self, index_id: &str) -> Result<Vec<RemoteFile>, RemoteError> {
        let mut state = self.state.lock();
        state.calls.list_index_files += 1;
        let file_ids = state
            .indexes
            .get(index_id)
            .map(|(_, files)| files.clone())
            .ok_or_else(|| not_found("index"))?;
        let status = state.index_file_statuses.next();
        Ok(file_ids
            .into_iter()
            .map(|id| RemoteFile {
                id,
                status,
                bytes: None,
                filename: None,
                status_details: None,
            })
            .collect())
    }

    async fn get_index_file(
        &self,
        index_id: &str,
        file_id: &str,
    ) -> Result<RemoteFile, RemoteError> {
        let mut state = self.state.lock();
        state.calls.get_index_file += 1;
        let member = state
            .indexes
            .get(index_id)
            .is_some_and(|(_, files)| files.iter().any(|id| id == file_id));
        if !member {
            return Err(not_found("index file"));
        }
        Ok(RemoteFile {
            id: file_id.to_string(),
            status: state.index_file_statuses.next(),
            bytes: None,
            filename: None,
            status_details: None,
        })
    }

    async fn attach_file_to_index(
        &self,
        index_id: &str,
        file_id: &str,
    ) -> Result<RemoteFile, RemoteError> {
        let step = {
            let mut state = self.state.lock();
            state.calls.attach_file_to_index += 1;
            state.attach_script.pop_front()
        };
        Self::play(step).await?;

        let mut state = self.state.lock();
        if !state.files.contains_key(file_id) {
            return Err(not_found("file"));
        }
        let (_, files) = state
            .indexes
            .get_mut(index_id)
            .ok_or_else(|| not_found("index"))?;
        if !files.iter().any(|id| id == file_id) {
            files.push(file_id.to_string());
        }
        Ok(RemoteFile {
            id: file_id.to_string(),
            status: RemoteStatus::InProgress,
            bytes: None,
            filename: None,
            status_details: None,
        })
    }

    async fn stream_run(&self, request: &RunRequest) -> Result<EventStream, RemoteError> {
        let steps = {
            let mut state = self.state.lock();
            state.calls.stream_run += 1;
            state.last_run_request = Some(request.clone());
            state
                .run_steps
                .clone()
                .unwrap_or_else(|| Self::echo_steps(request))
        };

        let events = stream::unfold(steps.into_iter(), |mut steps| async move {
            loop {
                match steps.next()? {
                    RunStep::Event(event) => return Some((Ok(event), steps)),
                    RunStep::Fault(err) => return Some((Err(err), steps)),
                    RunStep::Pause(delay) => tokio::time::sleep(delay).await,
                    RunStep::Stall => std::future::pending::<()>().await,
                }
            }
        });
        Ok(events.boxed())
    }

    async fn submit_run(&self, request: &RunRequest) -> Result<RemoteRun, RemoteError> {
        let id = new_id("resp");
        let mut state = self.state.lock();
        state.calls.submit_run += 1;
        state.last_run_request = Some(request.clone());
        let output = state.run_output.clone();
        state.runs.insert(id.clone(), StoredRun { output });
        Ok(RemoteRun {
            id,
            status: RemoteStatus::Queued,
            output_text: None,
        })
    }

    async fn get_run(&self, run_id: &str) -> Result<RemoteRun, RemoteError> {
        let mut state = self.state.lock();
        state.calls.get_run += 1;
        let status = state.run_statuses.next();
        let run = state.runs.get(run_id).ok_or_else(|| not_found("run"))?;
        Ok(RemoteRun {
            id: run_id.to_string(),
            status,
            output_text: if status == RemoteStatus::Completed {
                run.output.clone()
            } else {
                None
            },
        })
    }
}
