//! File-backed durable lane.
//!
//! The producer's [`SpoolWriter`] writes each envelope into a shared
//! directory as its own file. The consumer's [`SpoolReader`] later delivers
//! those files in sequence order and removes them. Both ends survive process
//! restarts: anything written and not yet removed is delivered on the next
//! pass.
//!
//! The relay hands each payload version to the durable lane once, so an
//! offline consumer's spool holds at most one file per queued version.
//!
//! ```text
//! <spool_dir>/
//! ├─ WRITER.lock                  # Held by the single writer
//! ├─ READER.lock                  # Held by the single reader
//! ├─ 00000000000000000001.msg     # CBOR envelope
//! └─ 00000000000000000002.msg.tmp # In-flight write, swept on reopen
//! ```

use crate::error::{SyncError, SyncResult};
use crate::store::sync_directory;
use crate::transport::{DurableLane, InboundHandler, LaneKind};
use fs2::FileExt;
use pairsync_protocol::{Envelope, ProtocolResult, ReplyStatus};
use serde::Serialize;
use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

const WRITER_LOCK: &str = "WRITER.lock";
const READER_LOCK: &str = "READER.lock";
const MESSAGE_EXT: &str = "msg";

/// A spooled envelope file.
#[derive(Debug)]
pub struct SpoolEntry {
    /// Sequence number from the file name.
    pub seq: u64,
    /// Path of the file.
    pub path: PathBuf,
    /// The decoded envelope, or why it could not be decoded.
    pub envelope: ProtocolResult<Envelope>,
}

/// Result of one [`SpoolReader::deliver`] pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SpoolReport {
    /// Files handed to the handler and removed.
    pub delivered: usize,
    /// Undecodable files removed without delivery.
    pub discarded: usize,
    /// True if the pass stopped at a file the handler failed to persist.
    pub halted: bool,
}

fn lock_dir(dir: &Path, name: &str) -> SyncResult<File> {
    fs::create_dir_all(dir)?;
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(dir.join(name))?;
    if file.try_lock_exclusive().is_err() {
        return Err(SyncError::Locked {
            path: dir.to_path_buf(),
        });
    }
    Ok(file)
}

fn message_name(seq: u64) -> String {
    format!("{seq:020}.{MESSAGE_EXT}")
}

fn parse_seq(path: &Path) -> Option<u64> {
    if path.extension()? != MESSAGE_EXT {
        return None;
    }
    path.file_stem()?.to_str()?.parse().ok()
}

/// Removes temp files left behind by a writer that died mid-write.
///
/// Only the writer creates them, so the caller must hold the writer lock.
fn sweep_temp_files(dir: &Path) -> std::io::Result<usize> {
    let suffix = format!(".{MESSAGE_EXT}.tmp");
    let mut removed = 0;
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        let is_temp = path
            .file_name()
            .and_then(|name| name.to_str())
            .is_some_and(|name| name.ends_with(&suffix));
        if is_temp {
            fs::remove_file(&path)?;
            removed += 1;
        }
    }
    Ok(removed)
}

/// Lists spooled message files in sequence order.
fn scan(dir: &Path) -> std::io::Result<Vec<(u64, PathBuf)>> {
    let mut files = Vec::new();
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if let Some(seq) = parse_seq(&path) {
            files.push((seq, path));
        }
    }
    files.sort_by_key(|(seq, _)| *seq);
    Ok(files)
}

/// Reads every spooled envelope without taking a lock or removing files.
pub fn read_entries(dir: &Path) -> SyncResult<Vec<SpoolEntry>> {
    scan(dir)?
        .into_iter()
        .map(|(seq, path)| {
            let bytes = fs::read(&path)?;
            Ok::<_, SyncError>(SpoolEntry {
                seq,
                envelope: Envelope::decode(&bytes),
                path,
            })
        })
        .collect()
}

/// The producer end of a spool.
#[derive(Debug)]
pub struct SpoolWriter {
    dir: PathBuf,
    next_seq: AtomicU64,
    _lock: File,
}

impl SpoolWriter {
    /// Opens a spool directory for writing, creating it if needed.
    ///
    /// Numbering continues after the highest file already present.
    /// Unfinished writes from an earlier run are deleted.
    pub fn open(dir: &Path) -> SyncResult<Self> {
        let lock = lock_dir(dir, WRITER_LOCK)?;
        let swept = sweep_temp_files(dir)?;
        if swept > 0 {
            warn!(dir = %dir.display(), swept, "removed unfinished spool writes");
        }
        let next_seq = scan(dir)?.last().map_or(1, |(seq, _)| seq + 1);
        debug!(dir = %dir.display(), next_seq, "opened spool writer");
        Ok(Self {
            dir: dir.to_path_buf(),
            next_seq: AtomicU64::new(next_seq),
            _lock: lock,
        })
    }

    /// The spool directory.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    async fn write(&self, seq: u64, bytes: &[u8]) -> SyncResult<()> {
        let name = message_name(seq);
        let final_path = self.dir.join(&name);
        let temp_path = self.dir.join(format!("{name}.tmp"));

        let mut file = tokio::fs::File::create(&temp_path).await?;
        file.write_all(bytes).await?;
        file.sync_all().await?;
        drop(file);

        tokio::fs::rename(&temp_path, &final_path).await?;
        let dir = self.dir.clone();
        tokio::task::spawn_blocking(move || sync_directory(&dir))
            .await
            .map_err(|e| SyncError::persistence(e.to_string()))?
    }
}

impl DurableLane for SpoolWriter {
    async fn submit(&self, envelope: Envelope) -> SyncResult<()> {
        let bytes = envelope.encode()?;
        let seq = self.next_seq.fetch_add(1, Ordering::SeqCst);
        self.write(seq, &bytes).await.map_err(|e| {
            warn!(seq, error = %e, "spool write failed");
            e
        })?;
        debug!(seq, "envelope spooled");
        Ok(())
    }
}

/// The consumer end of a spool.
#[derive(Debug)]
pub struct SpoolReader {
    dir: PathBuf,
    _lock: File,
}

impl SpoolReader {
    /// Opens a spool directory for reading, creating it if needed.
    pub fn open(dir: &Path) -> SyncResult<Self> {
        let lock = lock_dir(dir, READER_LOCK)?;
        Ok(Self {
            dir: dir.to_path_buf(),
            _lock: lock,
        })
    }

    /// Number of files waiting for delivery.
    pub fn pending(&self) -> SyncResult<usize> {
        Ok(scan(&self.dir)?.len())
    }

    /// Hands every spooled envelope to `handler` in sequence order.
    ///
    /// Each file is removed once handled, unless the handler reports a
    /// persistence failure: the pass then stops and the file stays for the
    /// next one. Files that cannot be decoded are removed and skipped.
    pub async fn deliver<H: InboundHandler>(&self, handler: &H) -> SyncResult<SpoolReport> {
        let dir = self.dir.clone();
        let files = tokio::task::spawn_blocking(move || scan(&dir))
            .await
            .map_err(|e| SyncError::persistence(e.to_string()))??;

        let mut report = SpoolReport::default();
        for (seq, path) in files {
            let bytes = tokio::fs::read(&path).await?;
            let envelope = match Envelope::decode(&bytes) {
                Ok(envelope) => envelope,
                Err(e) => {
                    warn!(seq, error = %e, "discarding undecodable spool file");
                    tokio::fs::remove_file(&path).await?;
                    report.discarded += 1;
                    continue;
                }
            };

            let reply = handler.handle(envelope, LaneKind::Durable).await;
            if reply.status == ReplyStatus::Failed {
                debug!(seq, "handler failed, keeping spool file");
                report.halted = true;
                break;
            }
            tokio::fs::remove_file(&path).await?;
            report.delivered += 1;
        }
        Ok(report)
    }
}
