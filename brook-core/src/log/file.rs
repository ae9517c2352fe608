use super::{slice_from, stamp_batch, Clock, LogError, OrderedLog, FIRST_POSITION};
use crate::record::{Record, RecordDraft};
use crate::types::{PartitionId, Position};
use async_trait::async_trait;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::fs::{self, File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, Notify};
use tracing::{debug, info, warn};

/// Single-node durable log, synced on every append.
///
/// Each line holds one appended batch as a JSON array, so a batch is on disk
/// completely or not at all. A torn last line left by a crash is cut off when
/// the log is opened again.
pub struct FileLog {
    partition_id: PartitionId,
    clock: Arc<dyn Clock>,
    path: PathBuf,
    inner: Mutex<Inner>,
    last_position: AtomicU64,
    appended: Notify,
}

struct Inner {
    file: File,
    bytes: u64,
    records: Vec<Record>,
}

/// Records of the intact prefix of a log file.
#[derive(Debug)]
struct Loaded {
    records: Vec<Record>,
    intact_bytes: usize,
}

fn load(content: &[u8]) -> Result<Loaded, LogError> {
    let mut records = Vec::new();
    let mut offset = 0;
    let mut line = 0;
    while offset < content.len() {
        line += 1;
        let rest = &content[offset..];
        let Some(end) = rest.iter().position(|b| *b == b'\n') else {
            break;
        };
        let text = &rest[..end];
        let next = offset + end + 1;
        if text.iter().all(u8::is_ascii_whitespace) {
            offset = next;
            continue;
        }
        let batch: Vec<Record> = match serde_json::from_slice(text) {
            Ok(batch) => batch,
            // only the last line may be torn
            Err(_) if next == content.len() => break,
            Err(e) => {
                return Err(LogError::Corrupt {
                    line,
                    reason: e.to_string(),
                })
            }
        };
        for record in batch {
            let expected = records.len() as Position + FIRST_POSITION;
            if record.position != expected {
                return Err(LogError::Corrupt {
                    line,
                    reason: format!("expected position {expected}, found {}", record.position),
                });
            }
            records.push(record);
        }
        offset = next;
    }
    Ok(Loaded {
        records,
        intact_bytes: offset,
    })
}

async fn write_synced(file: &mut File, buffer: &[u8]) -> std::io::Result<()> {
    file.write_all(buffer).await?;
    file.flush().await?;
    file.sync_data().await
}

impl FileLog {
    /// Opens (or creates) the log at `path` and loads existing records.
    pub async fn open(
        path: impl AsRef<Path>,
        partition_id: PartitionId,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, LogError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).await?;
            }
        }

        let content = match fs::read(&path).await {
            Ok(content) => content,
            Err(e) if e.kind() == ErrorKind::NotFound => Vec::new(),
            Err(e) => return Err(e.into()),
        };
        let Loaded {
            records,
            intact_bytes,
        } = load(&content)?;

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;
        if intact_bytes < content.len() {
            warn!(
                path = %path.display(),
                dropped_bytes = content.len() - intact_bytes,
                "Truncating torn batch at the end of the log"
            );
            file.set_len(intact_bytes as u64).await?;
            file.sync_data().await?;
        }
        info!(
            path = %path.display(),
            records = records.len(),
            "Opened file log"
        );

        Ok(Self {
            partition_id,
            clock,
            last_position: AtomicU64::new(records.len() as Position),
            path,
            inner: Mutex::new(Inner {
                file,
                bytes: intact_bytes as u64,
                records,
            }),
            appended: Notify::new(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl OrderedLog for FileLog {
    fn partition_id(&self) -> PartitionId {
        self.partition_id
    }

    async fn append(&self, batch: Vec<RecordDraft>) -> Result<Vec<Record>, LogError> {
        if batch.is_empty() {
            return Ok(Vec::new());
        }
        let mut inner = self.inner.lock().await;
        let last_timestamp = inner.records.last().map(|r| r.timestamp).unwrap_or(i64::MIN);
        let timestamp = self.clock.now_millis().max(last_timestamp);
        let next = inner.records.len() as Position + FIRST_POSITION;
        let appended = stamp_batch(batch, next, timestamp, self.partition_id);

        let mut buffer = serde_json::to_vec(&appended).map_err(LogError::Encode)?;
        buffer.push(b'\n');

        if let Err(e) = write_synced(&mut inner.file, &buffer).await {
            // drop a partially written batch so the file stays line-aligned
            let bytes = inner.bytes;
            if let Err(truncate) = inner.file.set_len(bytes).await {
                warn!(error = %truncate, "Failed to drop partial batch");
            }
            return Err(LogError::Io(e));
        }
        inner.bytes += buffer.len() as u64;
        inner.records.extend(appended.iter().cloned());
        self.last_position
            .store(inner.records.len() as Position, Ordering::SeqCst);
        drop(inner);

        debug!(first = next, count = appended.len(), "Appended batch");
        self.appended.notify_waiters();
        Ok(appended)
    }

    async fn read_from(&self, position: Position, max: usize) -> Result<Vec<Record>, LogError> {
        let inner = self.inner.lock().await;
        Ok(slice_from(&inner.records, position, max))
    }

    async fn last_position(&self) -> Result<Position, LogError> {
        Ok(self.last_position.load(Ordering::SeqCst))
    }

    async fn await_position(&self, position: Position) {
        loop {
            let notified = self.appended.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.last_position.load(Ordering::SeqCst) >= position {
                return;
            }
            notified.await;
        }
    }
}
