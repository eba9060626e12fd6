use std::convert::Infallible;

use axum::{
    extract::State,
    http::header::HeaderName,
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse,
    },
    Json,
};
use courier_transfer::{AnalysisOutcome, RunRequest, StreamRelay};
use tokio::sync::mpsc;
use tokio_stream::{wrappers::ReceiverStream, StreamExt};
use tracing::info;

use super::{ApiError, ApiResult};
use crate::{metrics, state::AppState};

static X_ACCEL_BUFFERING: HeaderName = HeaderName::from_static("x-accel-buffering");

/// Streams a run as SSE. Prerequisite failures are returned as plain error
/// responses; once the stream is open, failures arrive as in-band error frames.
pub async fn stream_run(
    State(state): State<AppState>,
    Json(request): Json<RunRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let upstream = state
        .runs()
        .start_stream(&request)
        .await
        .map_err(|err| ApiError::transfer(err, &state))?;

    // One slot, so a slow client holds the relay back instead of queueing frames.
    let (tx, rx) = mpsc::channel(1);
    let relay = StreamRelay::new(
        format!("run on {}", request.index_id),
        state.config().stream_idle_timeout,
    );
    tokio::spawn(async move {
        let report = relay.pump(upstream, &tx).await;
        metrics::RELAY_FRAMES.inc_by(report.frames);
        metrics::RELAY_CLOSED
            .with_label_values(&[report.reason.as_str()])
            .inc();
    });

    let events = ReceiverStream::new(rx)
        .map(|output| Ok::<_, Infallible>(Event::default().data(output.to_data())));
    Ok((
        [(X_ACCEL_BUFFERING.clone(), "no")],
        Sse::new(events).keep_alive(KeepAlive::default()),
    ))
}

pub async fn analyze(
    State(state): State<AppState>,
    Json(request): Json<RunRequest>,
) -> ApiResult<AnalysisOutcome> {
    let outcome = state
        .runs()
        .analyze(&request)
        .await
        .map_err(|err| ApiError::transfer(err, &state))?;
    if !outcome.reached_terminal {
        metrics::POLL_DEADLINES.with_label_values(&["run"]).inc();
    }
    info!(
        run_id = %outcome.id,
        status = %outcome.status,
        reached_terminal = outcome.reached_terminal,
        "analysis finished"
    );
    Ok(Json(outcome))
}
