//! Conversation state threaded through successive runs.
//!
//! A [`Conversation`] is an ordered log that only grows: each turn produces a new
//! value by appending, the previous one is never edited. [`TurnTranscript`] collects
//! what one relayed turn produced so it can be appended in a single step.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::remote::{EventKind, UpstreamEvent};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ConversationItem {
    Message {
        role: Role,
        content: String,
    },
    ToolCall {
        id: String,
        /// Upstream item type, e.g. `file_search_call`.
        tool: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        status: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        call_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        output: Option<Value>,
    },
}

impl ConversationItem {
    pub fn message(role: Role, content: impl Into<String>) -> Self {
        ConversationItem::Message {
            role,
            content: content.into(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Conversation {
    items: Vec<ConversationItem>,
}

impl Conversation {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn items(&self) -> &[ConversationItem] {
        &self.items
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    #[must_use]
    pub fn with_item(mut self, item: ConversationItem) -> Self {
        self.items.push(item);
        self
    }

    #[must_use]
    pub fn with_items(mut self, items: impl IntoIterator<Item = ConversationItem>) -> Self {
        self.items.extend(items);
        self
    }
}

/// Items produced by one turn, in the order upstream announced them.
#[derive(Debug, Clone, Default)]
pub struct TurnTranscript {
    items: Vec<ConversationItem>,
    open_message: Option<usize>,
}

impl TurnTranscript {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn observe(&mut self, event: &UpstreamEvent) {
        match event.kind() {
            EventKind::TextDelta => {
                if let Some(delta) = event.payload.get("delta").and_then(Value::as_str) {
                    self.append_text(delta);
                }
            }
            EventKind::ItemAdded => {
                if let Some(item) = event.payload.get("item") {
                    self.item_added(item);
                }
            }
            EventKind::ItemDone => {
                if let Some(item) = event.payload.get("item") {
                    self.item_done(item);
                }
            }
            EventKind::ToolCallCompleted => {
                let item_id = event.payload.get("item_id").and_then(Value::as_str);
                if let Some(call) = item_id.and_then(|id| self.tool_call_mut(id)) {
                    if let ConversationItem::ToolCall { status, output, .. } = call {
                        *status = Some("completed".into());
                        if let Some(value) = event.payload.get("output") {
                            *output = Some(value.clone());
                        }
                    }
                }
            }
            EventKind::ToolCallStarted | EventKind::Other => {}
        }
    }

    /// Assistant text gathered so far, across every message item of the turn.
    pub fn text(&self) -> String {
        self.items
            .iter()
            .filter_map(|item| match item {
                ConversationItem::Message {
                    role: Role::Assistant,
                    content,
                } => Some(content.as_str()),
                _ => None,
            })
            .collect()
    }

    pub fn items(&self) -> &[ConversationItem] {
        &self.items
    }

    /// Appends this turn to `conversation`, producing the next one.
    pub fn into_conversation(self, conversation: Conversation) -> Conversation {
        let items = self.items.into_iter().filter(|item| {
            !matches!(item, ConversationItem::Message { content, .. } if content.is_empty())
        });
        conversation.with_items(items)
    }

    fn append_text(&mut self, delta: &str) {
        let index = match self.open_message {
            Some(index) => index,
            None => {
                self.items
                    .push(ConversationItem::message(Role::Assistant, String::new()));
                let index = self.items.len() - 1;
                self.open_message = Some(index);
                index
            }
        };
        if let Some(ConversationItem::Message { content, .. }) = self.items.get_mut(index) {
            content.push_str(delta);
        }
    }

    fn item_added(&mut self, item: &Value) {
        let Some(kind) = item.get("type").and_then(Value::as_str) else {
            return;
        };
        if kind == "message" {
            self.open_message = None;
            self.items
                .push(ConversationItem::message(Role::Assistant, String::new()));
            self.open_message = Some(self.items.len() - 1);
        } else if kind.ends_with("_call") {
            let Some(id) = item.get("id").and_then(Value::as_str) else {
                return;
            };
            self.items.push(ConversationItem::ToolCall {
                id: id.to_string(),
                tool: kind.to_string(),
                status: string_field(item, "status"),
                call_id: string_field(item, "call_id"),
                output: None,
            });
        }
    }

    fn item_done(&mut self, item: &Value) {
        let Some(kind) = item.get("type").and_then(Value::as_str) else {
            return;
        };
        if kind == "message" {
            if let Some(index) = self.open_message.take() {
                if let Some(ConversationItem::Message { content, .. }) = self.items.get_mut(index) {
                    if content.is_empty() {
                        *content = message_text(item);
                    }
                }
            }
            return;
        }
        let Some(id) = item.get("id").and_then(Value::as_str) else {
            return;
        };
        if let Some(ConversationItem::ToolCall {
            status, call_id, ..
        }) = self.tool_call_mut(id)
        {
            if let Some(done_status) = string_field(item, "status") {
                *status = Some(done_status);
            }
            if call_id.is_none() {
                *call_id = string_field(item, "call_id");
            }
        }
    }

    fn tool_call_mut(&mut self, item_id: &str) -> Option<&mut ConversationItem> {
        self.items.iter_mut().find(
            |item| matches!(item, ConversationItem::ToolCall { id, .. } if id == item_id),
        )
    }
}

fn string_field(value: &Value, key: &str) -> Option<String> {
    value.get(key).and_then(Value::as_str).map(str::to_string)
}

fn message_text(item: &Value) -> String {
    item.get("content")
        .and_then(Value::as_array)
        .map(|parts| {
            parts
                .iter()
                .filter_map(|part| part.get("text").and_then(Value::as_str))
                .collect()
        })
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn event(name: &str, payload: Value) -> UpstreamEvent {
        UpstreamEvent::new(name, payload)
    }

    #[test]
    fn deltas_accumulate_into_one_assistant_message() {
        let mut transcript = TurnTranscript::new();
        transcript.observe(&event("response.output_text.delta", json!({"delta": "Hel"})));
        transcript.observe(&event("response.output_text.delta", json!({"delta": "lo"})));
        assert_eq!(transcript.text(), "Hello");
        assert_eq!(transcript.items().len(), 1);
    }

    #[test]
    fn tool_calls_keep_their_position_and_output() {
        let mut transcript = TurnTranscript::new();
        transcript.observe(&event(
            "response.output_item.added",
            json!({"item": {"type": "file_search_call", "id": "fs_1", "status": "in_progress"}}),
        ));
        transcript.observe(&event(
            "response.file_search_call.completed",
            json!({"item_id": "fs_1", "output": "3 results"}),
        ));
        transcript.observe(&event(
            "response.output_item.added",
            json!({"item": {"type": "message", "id": "msg_1"}}),
        ));
        transcript.observe(&event("response.output_text.delta", json!({"delta": "Answer"})));
        transcript.observe(&event(
            "response.output_item.done",
            json!({"item": {"type": "message", "id": "msg_1"}}),
        ));

        let items = transcript.items();
        assert!(matches!(
            &items[0],
            ConversationItem::ToolCall { id, status: Some(status), output: Some(_), .. }
                if id == "fs_1" && status == "completed"
        ));
        assert_eq!(items[1], ConversationItem::message(Role::Assistant, "Answer"));
    }

    #[test]
    fn finishing_a_turn_appends_without_touching_prior_items() {
        let before = Conversation::new().with_item(ConversationItem::message(Role::User, "hi"));
        let mut transcript = TurnTranscript::new();
        transcript.observe(&event("response.output_text.delta", json!({"delta": "hello"})));

        let after = transcript.into_conversation(before.clone());
        assert_eq!(after.len(), 2);
        assert_eq!(&after.items()[..1], before.items());
    }

    #[test]
    fn conversation_serializes_as_a_plain_list() {
        let conversation =
            Conversation::new().with_item(ConversationItem::message(Role::User, "question"));
        let value = serde_json::to_value(&conversation).unwrap();
        assert_eq!(
            value,
            json!([{"type": "message", "role": "user", "content": "question"}])
        );
    }
}
