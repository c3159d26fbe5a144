//! Receiver pipeline: collects chunks for one incoming file and saves it.
//!
//! # Sinks
//!
//! Small files (and every file when disk streaming is off) stay in
//! memory as an `index → bytes` map and are concatenated in index order
//! on finalize. Larger files are streamed to `<name>.peerdrop-tmp` through
//! a FIFO write queue drained by one writer task, so concurrent arrivals
//! never interleave disk writes. If the temp file cannot be created the
//! receiver falls back to memory.
//!
//! # Completion
//!
//! `received_chunks == total_chunks` is the only completion predicate.
//! Duplicates are dropped before they touch the counter, and a receiver
//! finalizes at most once.

use anyhow::{Context, Result, anyhow};
use bytes::Bytes;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::{AsyncSeekExt, AsyncWriteExt, SeekFrom};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::rate::{ProgressThrottle, RateMeter};
use crate::core::config::{MAX_FILE_SIZE, RECEIVER_WRITE_QUEUE_CHUNKS, TransferPolicy, total_chunks};
use crate::core::error::TransferError;
use crate::core::protocol::FileTransferRequest;
use crate::core::registry::{TransferRegistry, TransferStatus, TransferUpdate};
use crate::utils::atomic_write::atomic_write;

const TEMP_SUFFIX: &str = ".peerdrop-tmp";

/// What happened to one `add_chunk` call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChunkOutcome {
    Stored { received: u32 },
    /// Index already received; nothing changed.
    Duplicate,
    /// Last chunk stored and the file saved at this path.
    Completed(PathBuf),
}

struct DiskSink {
    queue: mpsc::Sender<(u64, Bytes)>,
    writer: JoinHandle<Result<()>>,
    temp_path: PathBuf,
}

enum Sink {
    Memory(BTreeMap<u32, Bytes>),
    Disk(DiskSink),
    Done,
}

pub struct FileReceiver {
    file_id: String,
    file_name: String,
    file_size: u64,
    total_chunks: u32,
    chunk_size: u32,
    /// Where the finished file lands.
    save_path: PathBuf,
    sink: Sink,
    received: Vec<bool>,
    received_chunks: u32,
    rate: RateMeter,
    throttle: ProgressThrottle,
    registry: TransferRegistry,
    saved: Option<PathBuf>,
}

impl FileReceiver {
    /// Create a receiver for `request`, saving into `download_dir`.
    pub async fn new(
        request: &FileTransferRequest,
        download_dir: &Path,
        policy: &TransferPolicy,
        registry: TransferRegistry,
    ) -> Result<Self> {
        if request.file_size > MAX_FILE_SIZE
            || total_chunks(request.file_size, request.chunk_size as usize) != Some(request.total_chunks)
        {
            return Err(anyhow!(
                "inconsistent request: {} bytes in {} chunks of {}",
                request.file_size,
                request.total_chunks,
                request.chunk_size
            ));
        }
        fs::create_dir_all(download_dir)
            .await
            .with_context(|| format!("creating {}", download_dir.display()))?;
        let save_path = unique_save_path(download_dir, &request.file_name).await;

        let sink = if policy.stream_to_disk && !policy.is_small(request.file_size) {
            match DiskSink::open(&save_path, request.file_size).await {
                Ok(disk) => Sink::Disk(disk),
                Err(e) => {
                    warn!(
                        event = "disk_stream_unavailable",
                        file_id = %request.file_id,
                        error = %e,
                        "Falling back to in-memory reassembly"
                    );
                    Sink::Memory(BTreeMap::new())
                }
            }
        } else {
            Sink::Memory(BTreeMap::new())
        };

        debug!(
            event = "receiver_created",
            file_id = %request.file_id,
            total_chunks = request.total_chunks,
            disk = matches!(sink, Sink::Disk(_)),
            path = %save_path.display(),
            "File receiver ready"
        );

        Ok(Self {
            file_id: request.file_id.clone(),
            file_name: request.file_name.clone(),
            file_size: request.file_size,
            total_chunks: request.total_chunks,
            chunk_size: request.chunk_size,
            save_path,
            sink,
            received: vec![false; request.total_chunks as usize],
            received_chunks: 0,
            rate: RateMeter::default(),
            throttle: ProgressThrottle::default(),
            registry,
            saved: None,
        })
    }

    pub fn received_chunks(&self) -> u32 {
        self.received_chunks
    }

    pub fn is_complete(&self) -> bool {
        self.received_chunks == self.total_chunks
    }

    pub fn is_disk_backed(&self) -> bool {
        matches!(self.sink, Sink::Disk(_))
    }

    pub async fn add_chunk(&mut self, index: u32, data: Bytes) -> Result<ChunkOutcome, TransferError> {
        if index >= self.total_chunks {
            return Err(self.index_error(index, "index out of range"));
        }
        if data.is_empty() {
            return Err(self.index_error(index, "empty payload"));
        }
        if data.len() as u64 != self.expected_len(index) {
            return Err(self.index_error(index, "payload size mismatch"));
        }
        if self.received[index as usize] {
            debug!(event = "chunk_duplicate", file_id = %self.file_id, index, "Duplicate chunk ignored");
            return Ok(ChunkOutcome::Duplicate);
        }

        let len = data.len();
        match &mut self.sink {
            Sink::Memory(chunks) => {
                chunks.insert(index, data);
            }
            Sink::Disk(disk) => {
                let offset = index as u64 * self.chunk_size as u64;
                if disk.queue.send((offset, data)).await.is_err() {
                    let err = anyhow!("disk writer stopped");
                    return Err(self.fail(err).await);
                }
            }
            Sink::Done => return Ok(ChunkOutcome::Duplicate),
        }

        self.received[index as usize] = true;
        self.received_chunks += 1;
        let rate = self.rate.record(len);
        let last = self.is_complete();

        if self.throttle.ready(last) {
            let progress = self.received_chunks as f64 / self.total_chunks as f64;
            self.registry.update(
                &self.file_id,
                TransferUpdate::default()
                    .progress(progress)
                    .rate(rate)
                    .received(self.received_chunks),
            );
        }

        if last {
            return self.finalize().await.map(ChunkOutcome::Completed);
        }
        Ok(ChunkOutcome::Stored {
            received: self.received_chunks,
        })
    }

    /// Byte length chunk `index` must have: full chunks, then the remainder.
    fn expected_len(&self, index: u32) -> u64 {
        let offset = index as u64 * self.chunk_size as u64;
        (self.chunk_size as u64).min(self.file_size.saturating_sub(offset))
    }

    /// Save the completed file. Calling it again returns the saved path.
    pub async fn finalize(&mut self) -> Result<PathBuf, TransferError> {
        if let Some(path) = &self.saved {
            return Ok(path.clone());
        }
        if !self.is_complete() {
            return Err(self.index_error(self.received_chunks, "finalize before all chunks"));
        }

        let result = match std::mem::replace(&mut self.sink, Sink::Done) {
            Sink::Memory(chunks) => self.write_memory(chunks).await,
            Sink::Disk(disk) => disk.commit(&self.save_path).await,
            Sink::Done => Err(anyhow!("receiver already released")),
        };
        if let Err(e) = result {
            return Err(self.fail(e).await);
        }

        self.registry.update(
            &self.file_id,
            TransferUpdate::status(TransferStatus::Completed)
                .progress(1.0)
                .received(self.received_chunks)
                .path(self.save_path.clone()),
        );
        info!(
            event = "file_received",
            file_id = %self.file_id,
            name = %self.file_name,
            bytes = self.file_size,
            path = %self.save_path.display(),
            "File saved"
        );
        self.saved = Some(self.save_path.clone());
        Ok(self.save_path.clone())
    }

    /// Drop everything received so far, removing any temp file.
    pub async fn abort(mut self) {
        if let Sink::Disk(disk) = std::mem::replace(&mut self.sink, Sink::Done) {
            disk.discard().await;
        }
        debug!(event = "receiver_aborted", file_id = %self.file_id, "Receiver aborted");
    }

    async fn write_memory(&self, chunks: BTreeMap<u32, Bytes>) -> Result<()> {
        let mut content = Vec::with_capacity(chunks.values().map(Bytes::len).sum());
        for data in chunks.into_values() {
            content.extend_from_slice(&data);
        }
        atomic_write(&self.save_path, &content).await
    }

    async fn fail(&mut self, source: anyhow::Error) -> TransferError {
        if let Sink::Disk(disk) = std::mem::replace(&mut self.sink, Sink::Done) {
            disk.discard().await;
        }
        warn!(event = "finalize_failed", file_id = %self.file_id, error = %source, "Receive failed");
        self.registry
            .update(&self.file_id, TransferUpdate::status(TransferStatus::Failed));
        TransferError::Finalize {
            file_id: self.file_id.clone(),
            source,
        }
    }

    fn index_error(&self, index: u32, reason: &'static str) -> TransferError {
        warn!(event = "chunk_rejected", file_id = %self.file_id, index, reason, "Chunk rejected");
        TransferError::ChunkIndex {
            file_id: self.file_id.clone(),
            index,
            reason,
        }
    }
}

impl DiskSink {
    async fn open(save_path: &Path, file_size: u64) -> Result<Self> {
        let temp_path = temp_path_for(save_path);
        let file = fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&temp_path)
            .await
            .with_context(|| format!("creating {}", temp_path.display()))?;
        file.set_len(file_size).await?;

        let (queue, rx) = mpsc::channel(RECEIVER_WRITE_QUEUE_CHUNKS);
        let writer = tokio::spawn(drain_write_queue(file, rx));
        Ok(Self {
            queue,
            writer,
            temp_path,
        })
    }

    /// Wait for queued writes, then move the temp file into place.
    async fn commit(self, save_path: &Path) -> Result<()> {
        let Self {
            queue,
            writer,
            temp_path,
        } = self;
        drop(queue);
        let flushed = writer.await.map_err(|e| anyhow!("disk writer panicked: {e}"))?;
        if let Err(e) = flushed {
            let _ = fs::remove_file(&temp_path).await;
            return Err(e);
        }
        fs::rename(&temp_path, save_path)
            .await
            .with_context(|| format!("renaming {} into place", temp_path.display()))
    }

    async fn discard(self) {
        drop(self.queue);
        self.writer.abort();
        let _ = self.writer.await;
        if let Err(e) = fs::remove_file(&self.temp_path).await {
            debug!(event = "temp_remove_failed", path = %self.temp_path.display(), error = %e, "Temp file not removed");
        }
    }
}

async fn drain_write_queue(mut file: fs::File, mut rx: mpsc::Receiver<(u64, Bytes)>) -> Result<()> {
    while let Some((offset, data)) = rx.recv().await {
        file.seek(SeekFrom::Start(offset)).await?;
        file.write_all(&data).await?;
    }
    file.flush().await?;
    file.sync_all().await?;
    Ok(())
}

fn temp_path_for(save_path: &Path) -> PathBuf {
    let mut name = save_path.as_os_str().to_owned();
    name.push(TEMP_SUFFIX);
    PathBuf::from(name)
}

/// Strip directories and control characters from a peer-supplied name.
pub fn sanitize_file_name(name: &str) -> String {
    let base = name.rsplit(['/', '\\']).next().unwrap_or("");
    let cleaned: String = base
        .chars()
        .filter(|c| !c.is_control())
        .map(|c| if matches!(c, ':' | '*' | '?' | '"' | '<' | '>' | '|') { '_' } else { c })
        .collect();
    let cleaned = cleaned.trim().trim_start_matches('.').to_string();
    if cleaned.is_empty() {
        "file".to_string()
    } else {
        cleaned
    }
}

/// `dir/name`, or `dir/stem (n).ext` when that is taken.
async fn unique_save_path(dir: &Path, name: &str) -> PathBuf {
    let name = sanitize_file_name(name);
    let candidate = dir.join(&name);
    if !fs::try_exists(&candidate).await.unwrap_or(false) {
        return candidate;
    }
    let (stem, ext) = match name.rfind('.') {
        Some(i) if i > 0 => (&name[..i], &name[i..]),
        _ => (name.as_str(), ""),
    };
    let mut n = 1u32;
    loop {
        let candidate = dir.join(format!("{stem} ({n}){ext}"));
        if !fs::try_exists(&candidate).await.unwrap_or(false) {
            return candidate;
        }
        n += 1;
    }
}
