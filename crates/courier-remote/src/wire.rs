//! Request and response bodies of the remote HTTP API.

use courier_transfer::{ConversationItem, RemoteRun, RemoteStatus, RunRequest};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

#[derive(Debug, Deserialize)]
pub(crate) struct ListResponse<T> {
    pub data: Vec<T>,
}

#[derive(Debug, Serialize)]
pub(crate) struct CreateIndexBody<'a> {
    pub name: &'a str,
}

#[derive(Debug, Serialize)]
pub(crate) struct AttachFileBody<'a> {
    pub file_id: &'a str,
}

#[derive(Debug, Serialize)]
pub(crate) struct RunBody<'a> {
    pub model: &'a str,
    pub input: Vec<Value>,
    pub tools: Vec<Value>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub stream: bool,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub background: bool,
}

impl<'a> RunBody<'a> {
    pub fn new(model: &'a str, request: &RunRequest) -> Self {
        Self {
            model,
            input: run_input(request),
            tools: vec![json!({
                "type": "file_search",
                "vector_store_ids": [request.index_id],
            })],
            stream: false,
            background: false,
        }
    }
}

/// Prior conversation followed by the new instructions as a user message.
/// Tool calls without a recorded output carry nothing the remote side needs.
pub(crate) fn run_input(request: &RunRequest) -> Vec<Value> {
    let mut input: Vec<Value> = request
        .conversation
        .items()
        .iter()
        .filter_map(|item| match item {
            ConversationItem::Message { role, content } => {
                Some(json!({ "role": role, "content": content }))
            }
            ConversationItem::ToolCall {
                call_id: Some(call_id),
                output: Some(output),
                ..
            } => Some(json!({
                "type": "function_call_output",
                "call_id": call_id,
                "output": match output {
                    Value::String(text) => text.clone(),
                    other => other.to_string(),
                },
            })),
            ConversationItem::ToolCall { .. } => None,
        })
        .collect();
    input.push(json!({ "role": "user", "content": request.instructions }));
    input
}

#[derive(Debug, Deserialize)]
pub(crate) struct ResponseBody {
    pub id: String,
    pub status: RemoteStatus,
    #[serde(default)]
    pub output: Vec<Value>,
}

impl From<ResponseBody> for RemoteRun {
    fn from(body: ResponseBody) -> Self {
        let text: String = body
            .output
            .iter()
            .filter(|item| item.get("type").and_then(Value::as_str) == Some("message"))
            .filter_map(|item| item.get("content").and_then(Value::as_array))
            .flatten()
            .filter(|part| part.get("type").and_then(Value::as_str) == Some("output_text"))
            .filter_map(|part| part.get("text").and_then(Value::as_str))
            .collect();
        RemoteRun {
            id: body.id,
            status: body.status,
            output_text: (!text.is_empty()).then_some(text),
        }
    }
}
