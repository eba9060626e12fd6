//! Adapts a remote SSE response into an [`EventStream`].

use courier_transfer::{EventStream, RemoteError, UpstreamEvent};
use futures::stream::{self, StreamExt};
use reqwest_eventsource::{Error as SourceError, Event, EventSource};
use serde_json::Value;
use tracing::debug;

use crate::client::{status_error, transport_error};

const DONE: &str = "[DONE]";

/// Waits for the connection to open so that a rejected request surfaces as an
/// error from the call that started it, then yields events until the stream ends.
pub(crate) async fn open(mut source: EventSource) -> Result<EventStream, RemoteError> {
    let mut first = None;
    loop {
        match source.next().await {
            Some(Ok(Event::Open)) => break,
            Some(Ok(Event::Message(message))) => {
                first = decode(&message.event, &message.data);
                break;
            }
            Some(Err(err)) => {
                source.close();
                return Err(source_error(err).await);
            }
            None => {
                return Err(RemoteError::Stream(
                    "event stream closed before it opened".into(),
                ))
            }
        }
    }

    let head = stream::iter(first.map(Ok));
    let rest = stream::unfold(Some(source), |state| async move {
        let mut source = state?;
        loop {
            match source.next().await {
                Some(Ok(Event::Open)) => continue,
                Some(Ok(Event::Message(message))) => {
                    if message.data.trim() == DONE {
                        source.close();
                        return None;
                    }
                    if let Some(event) = decode(&message.event, &message.data) {
                        return Some((Ok(event), Some(source)));
                    }
                }
                Some(Err(SourceError::StreamEnded)) | None => {
                    source.close();
                    return None;
                }
                Some(Err(err)) => {
                    source.close();
                    return Some((Err(source_error(err).await), None));
                }
            }
        }
    });
    Ok(head.chain(rest).boxed())
}

/// The event name comes from the SSE `event:` field, or from the payload's `type`
/// when the field is absent.
fn decode(event: &str, data: &str) -> Option<UpstreamEvent> {
    let data = data.trim();
    if data.is_empty() || data == DONE {
        return None;
    }
    let payload: Value =
        serde_json::from_str(data).unwrap_or_else(|_| Value::String(data.to_string()));
    let name = if event.is_empty() || event == "message" {
        payload
            .get("type")
            .and_then(Value::as_str)
            .unwrap_or("message")
            .to_string()
    } else {
        event.to_string()
    };
    debug!(event = %name, "upstream event");
    Some(UpstreamEvent::new(name, payload))
}

async fn source_error(err: SourceError) -> RemoteError {
    match err {
        SourceError::InvalidStatusCode(_, response) => status_error(response).await,
        SourceError::Transport(err) => transport_error(err),
        other => RemoteError::Stream(other.to_string()),
    }
}
