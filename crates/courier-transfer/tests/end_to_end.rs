use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use serde_json::json;
use tokio::io::{AsyncRead, ReadBuf};
use tokio::sync::mpsc;

use courier_transfer::memory::{RunStep, Scripted};
use courier_transfer::relay::{CloseReason, RelayOutput, DONE_SENTINEL, ERROR_EVENT};
use courier_transfer::{
    Conversation, ConversationItem, DocumentService, ErrorKind, IndexLinker, LinkSettings,
    MemoryDocumentService, RemoteError, RetryPolicy, Role, RunCoordinator, RunRequest,
    RunSettings, ServiceUpload, SizeBands, StreamRelay, UploadGateway, UploadLimits,
    UploadSettings, UploadSource, UploadStrategy, UpstreamEvent, MEBI_BYTE,
};

type TestResult = Result<(), Box<dyn std::error::Error>>;

/// Reader that records whether anyone tried to read from it.
struct Untouched(Arc<AtomicBool>);

impl AsyncRead for Untouched {
    fn poll_read(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        _buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        self.0.store(true, Ordering::SeqCst);
        Poll::Ready(Ok(()))
    }
}

fn gateway(service: &Arc<MemoryDocumentService>, settings: UploadSettings) -> UploadGateway {
    let primary: Arc<dyn UploadStrategy> = Arc::new(ServiceUpload::new(service.clone()));
    UploadGateway::new(settings, vec![primary])
}

fn patterned(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 253) as u8).collect()
}

async fn relay_outputs(
    coordinator: &RunCoordinator,
    request: &RunRequest,
    idle_timeout: Duration,
) -> Result<(Vec<RelayOutput>, courier_transfer::RelayReport), Box<dyn std::error::Error>> {
    let upstream = coordinator.start_stream(request).await?;
    let (tx, mut rx) = mpsc::channel(64);
    let report = StreamRelay::new("run", idle_timeout).pump(upstream, &tx).await;
    drop(tx);
    let mut outputs = Vec::new();
    while let Some(output) = rx.recv().await {
        outputs.push(output);
    }
    Ok((outputs, report))
}

#[tokio::test(start_paused = true)]
async fn oversized_upload_is_rejected_before_reading() {
    let service = Arc::new(MemoryDocumentService::new());
    let gateway = gateway(
        &service,
        UploadSettings {
            limits: UploadLimits {
                absolute: 100 * MEBI_BYTE,
                recommended: None,
            },
            ..UploadSettings::default()
        },
    );
    let touched = Arc::new(AtomicBool::new(false));

    let err = gateway
        .upload(UploadSource {
            reader: Untouched(touched.clone()),
            declared_len: 120 * MEBI_BYTE,
            file_name: "scan.pdf".into(),
            mime_type: "application/pdf".into(),
        })
        .await
        .expect_err("too large");

    assert_eq!(err.kind(), ErrorKind::TooLarge);
    assert_eq!(err.status_code(), 413);
    assert!(!touched.load(Ordering::SeqCst));
    assert_eq!(service.calls().create_file, 0);
}

#[tokio::test(start_paused = true)]
async fn deployment_limit_has_its_own_code() {
    let service = Arc::new(MemoryDocumentService::new());
    let gateway = gateway(
        &service,
        UploadSettings {
            limits: UploadLimits {
                absolute: 100 * MEBI_BYTE,
                recommended: Some(50 * MEBI_BYTE),
            },
            ..UploadSettings::default()
        },
    );
    let touched = Arc::new(AtomicBool::new(false));

    let err = gateway
        .upload(UploadSource {
            reader: Untouched(touched.clone()),
            declared_len: 60 * MEBI_BYTE,
            file_name: "scan.pdf".into(),
            mime_type: "application/pdf".into(),
        })
        .await
        .expect_err("too large for deployment");

    assert_eq!(err.kind(), ErrorKind::TooLargeForEnvironment);
    assert_eq!(err.status_code(), 413);
    assert!(!touched.load(Ordering::SeqCst));
}

#[tokio::test(start_paused = true)]
async fn five_megabyte_upload_survives_two_transient_failures() -> TestResult {
    let service = Arc::new(MemoryDocumentService::new());
    service.script_create_file([
        Scripted::Fail(RemoteError::Status {
            status: 502,
            body: "<html><title>Bad Gateway</title></html>".into(),
        }),
        Scripted::Hang,
    ]);
    let gateway = gateway(
        &service,
        UploadSettings {
            retry: RetryPolicy::new(3, Duration::from_millis(2_000), Duration::from_secs(30)),
            ..UploadSettings::default()
        },
    );
    let body = patterned(5 * MEBI_BYTE as usize);

    let receipt = gateway
        .upload(UploadSource {
            reader: body.as_slice(),
            declared_len: body.len() as u64,
            file_name: "case-study.pdf".into(),
            mime_type: "application/pdf".into(),
        })
        .await?;

    assert!(receipt.id.starts_with("file-"));
    assert_eq!(service.calls().create_file, 3);
    assert_eq!(service.file_contents(&receipt.id), Some(body));
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn phased_upload_preserves_every_byte() -> TestResult {
    let service = Arc::new(MemoryDocumentService::new());
    let bands = SizeBands {
        phased_threshold: 2 * MEBI_BYTE,
        phased_chunk_size: 64 * 1024,
        windowed_threshold: MEBI_BYTE,
        windowed_chunk_size: 256 * 1024,
        yield_every: 4,
    };
    let gateway = gateway(
        &service,
        UploadSettings {
            bands,
            ..UploadSettings::default()
        },
    );
    let body = patterned(3 * MEBI_BYTE as usize + 17);

    let receipt = gateway
        .upload(UploadSource {
            reader: body.as_slice(),
            declared_len: body.len() as u64,
            file_name: "large.bin".into(),
            mime_type: "application/octet-stream".into(),
        })
        .await?;

    assert_eq!(receipt.bytes, body.len() as u64);
    assert_eq!(service.file_contents(&receipt.id), Some(body));
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn upload_link_and_relay_two_turns() -> TestResult {
    let service = Arc::new(MemoryDocumentService::new());
    let gateway = gateway(&service, UploadSettings::default());
    let body = patterned(4_096);
    let receipt = gateway
        .upload(UploadSource {
            reader: body.as_slice(),
            declared_len: body.len() as u64,
            file_name: "notes.txt".into(),
            mime_type: "text/plain".into(),
        })
        .await?;

    let index = service.create_index("Document Store").await?;
    let linker = IndexLinker::new(service.clone(), LinkSettings::default());
    let attached = linker.attach(&index.id, &receipt.id).await?;
    assert!(attached.verified);

    service.script_run([
        RunStep::Event(UpstreamEvent::new(
            "response.output_item.added",
            json!({"item": {"type": "message", "id": "msg_1"}}),
        )),
        RunStep::Event(UpstreamEvent::new(
            "response.output_text.delta",
            json!({"item_id": "msg_1", "delta": "The study ran in three phases."}),
        )),
        RunStep::Event(UpstreamEvent::new(
            "response.output_item.done",
            json!({"item": {"type": "message", "id": "msg_1"}}),
        )),
    ]);
    let coordinator = RunCoordinator::new(service.clone(), RunSettings::default());
    let first = RunRequest {
        index_id: index.id.clone(),
        instructions: "How was the study run?".into(),
        conversation: Conversation::new(),
    };
    let (outputs, report) = relay_outputs(&coordinator, &first, Duration::from_secs(60)).await?;
    assert_eq!(outputs.len(), 4);
    assert_eq!(outputs.last(), Some(&RelayOutput::Done));
    assert_eq!(report.reason, CloseReason::Completed);

    let history = report.transcript.into_conversation(
        first
            .conversation
            .clone()
            .with_item(ConversationItem::message(Role::User, first.instructions.clone())),
    );
    let second = RunRequest {
        index_id: index.id.clone(),
        instructions: "And the outcome?".into(),
        conversation: history,
    };
    relay_outputs(&coordinator, &second, Duration::from_secs(60)).await?;

    let seen = service.last_run_request().ok_or("no run recorded")?;
    assert_eq!(seen.conversation.len(), 2);
    assert_eq!(
        seen.conversation.items()[1],
        ConversationItem::message(Role::Assistant, "The study ran in three phases.")
    );
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn stalled_run_gets_one_error_frame_then_done() -> TestResult {
    let service = Arc::new(MemoryDocumentService::new());
    service.insert_index("vs_1", "Document Store");
    service.script_run([
        RunStep::Event(UpstreamEvent::new("response.created", json!({"id": "resp_1"}))),
        RunStep::Pause(Duration::from_secs(61)),
        RunStep::Event(UpstreamEvent::new("response.completed", json!({}))),
    ]);
    let coordinator = RunCoordinator::new(service.clone(), RunSettings::default());
    let request = RunRequest {
        index_id: "vs_1".into(),
        instructions: "Summarise".into(),
        ..RunRequest::default()
    };

    let (outputs, report) = relay_outputs(&coordinator, &request, Duration::from_secs(60)).await?;

    let errors: Vec<_> = outputs
        .iter()
        .filter_map(|output| match output {
            RelayOutput::Frame(frame) if frame.event == ERROR_EVENT => Some(frame),
            _ => None,
        })
        .collect();
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].data["isTimeout"], true);
    assert_eq!(outputs.len(), 3);
    assert_eq!(outputs[2].to_data(), DONE_SENTINEL);
    assert_eq!(report.reason, CloseReason::Stalled);
    Ok(())
}
