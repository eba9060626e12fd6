//! Forwarding an upstream event stream to a downstream SSE writer.
//!
//! Every upstream event becomes exactly one frame, written before the next event
//! is read. Each stream ends with exactly one `Done` marker unless the downstream
//! side has already gone away. Nothing is buffered for replay.

use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use serde::Serialize;
use serde_json::{json, Value};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::time::{timeout, Instant};
use tracing::{debug, info, warn};

use crate::conversation::TurnTranscript;
use crate::remote::{EventStream, UpstreamEvent};

pub const ERROR_EVENT: &str = "response.error";
pub const DONE_SENTINEL: &str = "[DONE]";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RelayState {
    Idle,
    Streaming,
    Draining,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CloseReason {
    Completed,
    Stalled,
    UpstreamFault,
    ClientDisconnected,
}

impl CloseReason {
    pub fn as_str(self) -> &'static str {
        match self {
            CloseReason::Completed => "completed",
            CloseReason::Stalled => "stalled",
            CloseReason::UpstreamFault => "upstream_fault",
            CloseReason::ClientDisconnected => "client_disconnected",
        }
    }
}

/// Serialized as `{"event": ..., "data": ...}`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RelayFrame {
    pub event: String,
    pub data: Value,
}

impl RelayFrame {
    pub fn error(message: impl Into<String>, is_timeout: bool) -> Self {
        Self {
            event: ERROR_EVENT.to_string(),
            data: json!({ "message": message.into(), "isTimeout": is_timeout }),
        }
    }

    pub fn is_error(&self) -> bool {
        self.event == ERROR_EVENT
    }
}

impl From<UpstreamEvent> for RelayFrame {
    fn from(event: UpstreamEvent) -> Self {
        Self {
            event: event.name,
            data: event.payload,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum RelayOutput {
    Frame(RelayFrame),
    Done,
}

impl RelayOutput {
    /// Body of the SSE `data:` line.
    pub fn to_data(&self) -> String {
        match self {
            RelayOutput::Frame(frame) => {
                serde_json::to_string(frame).unwrap_or_else(|_| "{}".to_string())
            }
            RelayOutput::Done => DONE_SENTINEL.to_string(),
        }
    }
}

#[derive(Debug, Error)]
#[error("downstream closed")]
pub struct SinkClosed;

/// Downstream side of a relay.
#[async_trait]
pub trait FrameSink: Send + Sync {
    async fn send(&self, output: RelayOutput) -> Result<(), SinkClosed>;

    /// Resolves once the consumer has gone away.
    async fn closed(&self);
}

#[async_trait]
impl FrameSink for mpsc::Sender<RelayOutput> {
    async fn send(&self, output: RelayOutput) -> Result<(), SinkClosed> {
        mpsc::Sender::send(self, output).await.map_err(|_| SinkClosed)
    }

    async fn closed(&self) {
        mpsc::Sender::closed(self).await
    }
}

#[derive(Debug)]
pub struct RelayReport {
    pub state: RelayState,
    pub reason: CloseReason,
    pub frames: u64,
    pub transcript: TurnTranscript,
}

pub struct StreamRelay {
    label: String,
    idle_timeout: Duration,
    state: RelayState,
}

impl StreamRelay {
    pub fn new(label: impl Into<String>, idle_timeout: Duration) -> Self {
        Self {
            label: label.into(),
            idle_timeout,
            state: RelayState::Idle,
        }
    }

    pub fn state(&self) -> RelayState {
        self.state
    }

    /// Drives `upstream` into `sink` until the stream ends, stalls, faults, or the
    /// sink closes. The upstream stream is dropped before this returns.
    pub async fn pump<S>(mut self, mut upstream: EventStream, sink: &S) -> RelayReport
    where
        S: FrameSink + ?Sized,
    {
        let started = Instant::now();
        let mut transcript = TurnTranscript::new();
        let mut frames = 0u64;
        self.state = RelayState::Streaming;
        debug!(label = %self.label, idle_timeout_ms = self.idle_timeout.as_millis() as u64, "relay streaming");

        let reason = loop {
            let next = tokio::select! {
                biased;
                _ = sink.closed() => None,
                read = timeout(self.idle_timeout, upstream.next()) => Some(read),
            };
            let Some(read) = next else {
                info!(label = %self.label, frames, "downstream disconnected; stopping relay");
                break CloseReason::ClientDisconnected;
            };

            match read {
                Ok(Some(Ok(event))) => {
                    transcript.observe(&event);
                    if sink.send(RelayOutput::Frame(event.into())).await.is_err() {
                        info!(label = %self.label, frames, "downstream disconnected mid-frame");
                        break CloseReason::ClientDisconnected;
                    }
                    frames += 1;
                }
                Ok(Some(Err(err))) => {
                    warn!(label = %self.label, frames, error = %err, "upstream stream failed");
                    let frame = RelayFrame::error(err.to_string(), err.is_timeout());
                    self.drain(sink, frame).await;
                    break CloseReason::UpstreamFault;
                }
                Ok(None) => {
                    self.finish(sink).await;
                    break CloseReason::Completed;
                }
                Err(_) => {
                    warn!(
                        label = %self.label,
                        frames,
                        idle_timeout_ms = self.idle_timeout.as_millis() as u64,
                        "upstream stalled"
                    );
                    let frame = RelayFrame::error(
                        format!(
                            "No response from the document service for {} seconds",
                            self.idle_timeout.as_secs()
                        ),
                        true,
                    );
                    self.drain(sink, frame).await;
                    break CloseReason::Stalled;
                }
            }
        };

        drop(upstream);
        self.state = RelayState::Closed;
        info!(
            label = %self.label,
            frames,
            reason = reason.as_str(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "relay closed"
        );
        RelayReport {
            state: self.state,
            reason,
            frames,
            transcript,
        }
    }

    /// Writes the error frame and the terminal marker. Write failures are logged
    /// and dropped since the connection may already be gone.
    async fn drain<S>(&mut self, sink: &S, frame: RelayFrame)
    where
        S: FrameSink + ?Sized,
    {
        self.state = RelayState::Draining;
        if let Err(err) = sink.send(RelayOutput::Frame(frame)).await {
            debug!(label = %self.label, error = %err, "could not deliver error frame");
            return;
        }
        self.finish(sink).await;
    }

    async fn finish<S>(&mut self, sink: &S)
    where
        S: FrameSink + ?Sized,
    {
        if let Err(err) = sink.send(RelayOutput::Done).await {
            debug!(label = %self.label, error = %err, "could not deliver done marker");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::RemoteError;
    use futures::stream;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn event(name: &str) -> UpstreamEvent {
        UpstreamEvent::new(name, json!({ "name": name }))
    }

    fn names(outputs: &[RelayOutput]) -> Vec<String> {
        outputs
            .iter()
            .map(|output| match output {
                RelayOutput::Frame(frame) => frame.event.clone(),
                RelayOutput::Done => DONE_SENTINEL.to_string(),
            })
            .collect()
    }

    async fn collect(mut rx: mpsc::Receiver<RelayOutput>) -> Vec<RelayOutput> {
        let mut outputs = Vec::new();
        while let Some(output) = rx.recv().await {
            outputs.push(output);
        }
        outputs
    }

    #[tokio::test]
    async fn forwards_events_in_order_then_done() {
        let upstream = stream::iter(vec![Ok(event("A")), Ok(event("B")), Ok(event("C"))]).boxed();
        let (tx, rx) = mpsc::channel(16);
        let report = StreamRelay::new("run", Duration::from_secs(60))
            .pump(upstream, &tx)
            .await;
        drop(tx);

        assert_eq!(names(&collect(rx).await), ["A", "B", "C", DONE_SENTINEL]);
        assert_eq!(report.reason, CloseReason::Completed);
        assert_eq!(report.state, RelayState::Closed);
        assert_eq!(report.frames, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn stall_emits_one_timeout_frame_then_done() {
        let upstream = stream::iter(vec![Ok(event("A"))])
            .chain(stream::once(async {
                tokio::time::sleep(Duration::from_secs(61)).await;
                Ok(event("B"))
            }))
            .boxed();
        let (tx, rx) = mpsc::channel(16);
        let started = Instant::now();
        let report = StreamRelay::new("run", Duration::from_secs(60))
            .pump(upstream, &tx)
            .await;
        drop(tx);

        assert_eq!(started.elapsed(), Duration::from_secs(60));
        let outputs = collect(rx).await;
        assert_eq!(names(&outputs), ["A", ERROR_EVENT, DONE_SENTINEL]);
        match &outputs[1] {
            RelayOutput::Frame(frame) => assert_eq!(frame.data["isTimeout"], true),
            RelayOutput::Done => panic!("expected error frame"),
        }
        assert_eq!(report.reason, CloseReason::Stalled);
    }

    #[tokio::test]
    async fn upstream_fault_becomes_error_frame() {
        let upstream = stream::iter(vec![
            Ok(event("A")),
            Err(RemoteError::Stream("connection reset".into())),
            Ok(event("never")),
        ])
        .boxed();
        let (tx, rx) = mpsc::channel(16);
        let report = StreamRelay::new("run", Duration::from_secs(60))
            .pump(upstream, &tx)
            .await;
        drop(tx);

        let outputs = collect(rx).await;
        assert_eq!(names(&outputs), ["A", ERROR_EVENT, DONE_SENTINEL]);
        match &outputs[1] {
            RelayOutput::Frame(frame) => assert_eq!(frame.data["isTimeout"], false),
            RelayOutput::Done => panic!("expected error frame"),
        }
        assert_eq!(report.reason, CloseReason::UpstreamFault);
    }

    #[tokio::test]
    async fn disconnected_client_stops_pulling_upstream() {
        let pulled = Arc::new(AtomicU32::new(0));
        let counter = pulled.clone();
        let upstream = stream::iter(vec![Ok(event("A")), Ok(event("B"))])
            .inspect(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            })
            .boxed();
        let (tx, rx) = mpsc::channel(16);
        drop(rx);

        let report = StreamRelay::new("run", Duration::from_secs(60))
            .pump(upstream, &tx)
            .await;
        assert_eq!(report.reason, CloseReason::ClientDisconnected);
        assert_eq!(report.frames, 0);
        assert_eq!(pulled.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn failed_error_frame_write_is_swallowed() {
        struct BrokenSink;

        #[async_trait]
        impl FrameSink for BrokenSink {
            async fn send(&self, _output: RelayOutput) -> Result<(), SinkClosed> {
                Err(SinkClosed)
            }

            async fn closed(&self) {
                std::future::pending::<()>().await
            }
        }

        let upstream = stream::iter(vec![Err(RemoteError::Stream("broken pipe".into()))]).boxed();
        let report = StreamRelay::new("run", Duration::from_secs(60))
            .pump(upstream, &BrokenSink)
            .await;
        assert_eq!(report.reason, CloseReason::UpstreamFault);
        assert_eq!(report.state, RelayState::Closed);
    }

    #[tokio::test]
    async fn transcript_collects_relayed_text() {
        let upstream = stream::iter(vec![
            Ok(UpstreamEvent::new("response.output_text.delta", json!({"delta": "Hi"}))),
            Ok(UpstreamEvent::new("response.output_text.delta", json!({"delta": " there"}))),
        ])
        .boxed();
        let (tx, _rx) = mpsc::channel(16);
        let report = StreamRelay::new("run", Duration::from_secs(60))
            .pump(upstream, &tx)
            .await;
        assert_eq!(report.transcript.text(), "Hi there");
    }

    #[test]
    fn frames_serialize_as_event_and_data() {
        let output = RelayOutput::Frame(RelayFrame::error("stalled", true));
        let parsed: Value = serde_json::from_str(&output.to_data()).unwrap();
        assert_eq!(
            parsed,
            json!({"event": "response.error", "data": {"message": "stalled", "isTimeout": true}})
        );
        assert_eq!(RelayOutput::Done.to_data(), "[DONE]");
    }
}
