//! Courier transfer core: moving large files to a slow remote document service and
//! relaying its streamed answers back.
//!
//! Responsibilities:
//! - bounded retries with per-attempt timeouts for every remote call
//! - windowed transcoding of inbound files into multipart-ready fragments
//! - size validation, submission and failure classification for uploads
//! - polling eventually-consistent remote state within a fixed budget
//! - relaying upstream run events as SSE frames with stall detection

pub mod conversation;
pub mod error;
pub mod failure;
pub mod indexing;
pub mod memory;
pub mod poller;
pub mod relay;
pub mod remote;
pub mod retry;
pub mod runs;
pub mod transcode;
pub mod upload;

pub use conversation::{Conversation, ConversationItem, Role, TurnTranscript};
pub use error::{ErrorKind, TransferError, TransferResult};
pub use indexing::{AttachOutcome, IndexLinker, LinkSettings};
pub use memory::MemoryDocumentService;
pub use poller::{await_status, PollOutcome, PollPolicy};
pub use relay::{CloseReason, FrameSink, RelayFrame, RelayOutput, RelayReport, StreamRelay};
pub use remote::{
    DocumentService, EventStream, FileUpload, RemoteError, RemoteFile, RemoteIndex, RemoteRun,
    RemoteStatus, RunRequest, UpstreamEvent,
};
pub use retry::{RetryError, RetryPolicy};
pub use runs::{AnalysisOutcome, RunCoordinator, RunSettings};
pub use transcode::{SizeBands, Transcoded, TranscodeStrategy, TransferTask, MEBI_BYTE};
pub use upload::{
    ServiceUpload, UploadGateway, UploadLimits, UploadReceipt, UploadSettings, UploadSource,
    UploadStrategy, UploadTimeoutScale,
};
