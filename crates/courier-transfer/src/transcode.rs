//! Windowed conversion of an inbound byte source into multipart-ready fragments.
//!
//! The source is read one fixed-size window at a time. Each window becomes its own
//! reference-counted fragment, so the outbound body can be streamed straight from
//! the fragment list without gathering the file into one buffer again.

use std::io::ErrorKind as IoErrorKind;
use std::ops::Range;

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt};
use tracing::debug;

use crate::error::{TransferError, TransferResult};

pub const MEBI_BYTE: u64 = 1024 * 1024;

/// How a file of a given size is read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TranscodeStrategy {
    /// Whole file in one read.
    OneShot,
    /// Fixed windows, one fragment per window.
    Windowed { chunk_size: usize, yield_every: usize },
    /// Fixed windows, combined into larger segments a group at a time.
    Phased { chunk_size: usize, yield_every: usize },
}

impl TranscodeStrategy {
    pub fn name(&self) -> &'static str {
        match self {
            TranscodeStrategy::OneShot => "one_shot",
            TranscodeStrategy::Windowed { .. } => "windowed",
            TranscodeStrategy::Phased { .. } => "phased",
        }
    }

    fn window_size(&self, total_len: u64) -> usize {
        match self {
            TranscodeStrategy::OneShot => usize::try_from(total_len).unwrap_or(usize::MAX).max(1),
            TranscodeStrategy::Windowed { chunk_size, .. }
            | TranscodeStrategy::Phased { chunk_size, .. } => *chunk_size,
        }
    }
}

/// Size bands that pick a [`TranscodeStrategy`]. All values are tunable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SizeBands {
    pub phased_threshold: u64,
    pub phased_chunk_size: usize,
    pub windowed_threshold: u64,
    pub windowed_chunk_size: usize,
    pub yield_every: usize,
}

impl Default for SizeBands {
    fn default() -> Self {
        Self {
            phased_threshold: 50 * MEBI_BYTE,
            phased_chunk_size: 2 * MEBI_BYTE as usize,
            windowed_threshold: 10 * MEBI_BYTE,
            windowed_chunk_size: 5 * MEBI_BYTE as usize,
            yield_every: 4,
        }
    }
}

impl SizeBands {
    pub fn strategy_for(&self, total_len: u64) -> TranscodeStrategy {
        let yield_every = self.yield_every.max(1);
        if total_len >= self.phased_threshold {
            TranscodeStrategy::Phased {
                chunk_size: self.phased_chunk_size,
                yield_every,
            }
        } else if total_len >= self.windowed_threshold {
            TranscodeStrategy::Windowed {
                chunk_size: self.windowed_chunk_size,
                yield_every,
            }
        } else {
            TranscodeStrategy::OneShot
        }
    }
}

/// One planned upload. Window boundaries are computed up front and cover the
/// source exactly once, in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferTask {
    source_size: u64,
    windows: Vec<Range<u64>>,
    strategy: TranscodeStrategy,
    mime_type: String,
    destination_name: String,
}

impl TransferTask {
    pub fn plan(
        source_size: u64,
        strategy: TranscodeStrategy,
        mime_type: impl Into<String>,
        destination_name: impl Into<String>,
    ) -> TransferResult<Self> {
        let windows = plan_windows(source_size, strategy.window_size(source_size))?;
        Ok(Self {
            source_size,
            windows,
            strategy,
            mime_type: mime_type.into(),
            destination_name: destination_name.into(),
        })
    }

    pub fn source_size(&self) -> u64 {
        self.source_size
    }

    pub fn windows(&self) -> &[Range<u64>] {
        &self.windows
    }

    pub fn strategy(&self) -> TranscodeStrategy {
        self.strategy
    }

    pub fn mime_type(&self) -> &str {
        &self.mime_type
    }

    pub fn destination_name(&self) -> &str {
        &self.destination_name
    }
}

/// Splits `total_len` into `chunk_size` windows; the last one may be shorter.
pub fn plan_windows(total_len: u64, chunk_size: usize) -> TransferResult<Vec<Range<u64>>> {
    if chunk_size == 0 {
        return Err(TransferError::Validation(
            "chunk size must be greater than zero".into(),
        ));
    }
    let step = chunk_size as u64;
    let mut windows = Vec::with_capacity(total_len.div_ceil(step) as usize);
    let mut start = 0u64;
    while start < total_len {
        let end = (start + step).min(total_len);
        windows.push(start..end);
        start = end;
    }
    Ok(windows)
}

/// Ordered fragments that concatenate back to the input.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Transcoded {
    fragments: Vec<Bytes>,
    len: u64,
}

impl Transcoded {
    pub fn from_bytes(bytes: Bytes) -> Self {
        let len = bytes.len() as u64;
        let fragments = if bytes.is_empty() { Vec::new() } else { vec![bytes] };
        Self { fragments, len }
    }

    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn fragments(&self) -> &[Bytes] {
        &self.fragments
    }

    /// Copies every fragment into one contiguous buffer.
    pub fn coalesce(&self) -> Bytes {
        match self.fragments.as_slice() {
            [] => Bytes::new(),
            [single] => single.clone(),
            many => {
                let mut buf = BytesMut::with_capacity(self.len as usize);
                for fragment in many {
                    buf.extend_from_slice(fragment);
                }
                buf.freeze()
            }
        }
    }

    fn push(&mut self, fragment: Bytes) {
        self.len += fragment.len() as u64;
        self.fragments.push(fragment);
    }
}

/// Reads exactly `total_len` bytes from `source` in `chunk_size` windows, yielding
/// to the runtime after every `yield_every` windows.
pub async fn transcode<R>(
    source: &mut R,
    total_len: u64,
    chunk_size: usize,
    yield_every: usize,
) -> TransferResult<Transcoded>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let windows = plan_windows(total_len, chunk_size)?;
    read_windows(source, total_len, &windows, yield_every, false).await
}

/// Executes a planned task with the strategy it was planned for.
pub async fn transcode_task<R>(source: &mut R, task: &TransferTask) -> TransferResult<Transcoded>
where
    R: AsyncRead + Unpin + ?Sized,
{
    debug!(
        strategy = task.strategy.name(),
        bytes = task.source_size,
        windows = task.windows.len(),
        file_name = %task.destination_name,
        "transcoding upload"
    );
    let total = task.source_size;
    match task.strategy {
        TranscodeStrategy::OneShot => read_windows(source, total, &task.windows, 0, false).await,
        TranscodeStrategy::Windowed { yield_every, .. } => {
            read_windows(source, total, &task.windows, yield_every, false).await
        }
        TranscodeStrategy::Phased { yield_every, .. } => {
            read_windows(source, total, &task.windows, yield_every, true).await
        }
    }
}

/// Read phase fills a group of `yield_every` windows; the combine phase merges the
/// group into one segment and drops the window copies before the next group is
/// read. At most one group of windows plus its segment is transient at a time.
async fn read_windows<R>(
    source: &mut R,
    total_len: u64,
    windows: &[Range<u64>],
    yield_every: usize,
    combine: bool,
) -> TransferResult<Transcoded>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut out = Transcoded::default();
    let mut group: Vec<Bytes> = Vec::new();

    for (index, window) in windows.iter().enumerate() {
        let fragment = read_window(source, window, total_len).await?;
        if combine {
            group.push(fragment);
        } else {
            out.push(fragment);
        }

        let boundary = yield_every > 0 && (index + 1) % yield_every == 0;
        if boundary {
            if combine {
                out.push(combine_group(&mut group));
            }
            tokio::task::yield_now().await;
        }
    }
    if !group.is_empty() {
        out.push(combine_group(&mut group));
    }

    let mut probe = [0u8; 1];
    if source.read(&mut probe).await? != 0 {
        return Err(TransferError::Validation(format!(
            "upload is longer than its declared length of {total_len} bytes"
        )));
    }
    debug_assert_eq!(out.len, total_len);
    Ok(out)
}

async fn read_window<R>(source: &mut R, window: &Range<u64>, total_len: u64) -> TransferResult<Bytes>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut buf = BytesMut::zeroed((window.end - window.start) as usize);
    match source.read_exact(&mut buf).await {
        Ok(_) => Ok(buf.freeze()),
        Err(err) if err.kind() == IoErrorKind::UnexpectedEof => {
            Err(TransferError::Validation(format!(
                "upload ended before byte {} of its declared {total_len} bytes",
                window.end
            )))
        }
        Err(err) => Err(TransferError::Source(err)),
    }
}

fn combine_group(group: &mut Vec<Bytes>) -> Bytes {
    if group.len() == 1 {
        return group.pop().unwrap_or_default();
    }
    let total = group.iter().map(Bytes::len).sum();
    let mut segment = BytesMut::with_capacity(total);
    for fragment in group.drain(..) {
        segment.extend_from_slice(&fragment);
    }
    segment.freeze()
}
