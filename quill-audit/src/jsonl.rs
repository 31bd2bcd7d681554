use std::collections::HashSet;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use quill_types::ExecutionId;

use crate::{CostSummary, GenerationLogEntry, GenerationLogger, LogError, LogFilter, LogPage};

#[derive(Default)]
struct Tail {
    last_hash: Option<String>,
    ids: HashSet<ExecutionId>,
}

impl Tail {
    fn from_entries(entries: &[GenerationLogEntry]) -> Self {
        let mut tail = Tail::default();
        for entry in entries {
            tail.ids.insert(entry.execution_id);
            tail.last_hash = Some(entry.chain_hash.clone());
        }
        tail
    }
}

struct Inner {
    path: PathBuf,
    tail: Mutex<Tail>,
}

/// Hash-chained JSONL file. Each `record` is flushed with `sync_data` before
/// returning. File work runs on the blocking pool.
#[derive(Clone)]
pub struct JsonlGenerationLog {
    inner: Arc<Inner>,
}

/// Entries plus the byte length they occupy. A trailing line without its
/// newline that does not parse is a torn write and is left out.
struct Scan {
    entries: Vec<GenerationLogEntry>,
    complete_len: u64,
    torn: bool,
    unterminated: bool,
}

impl JsonlGenerationLog {
    /// Open or create the log. A torn final line from an interrupted append is
    /// cut off so the next entry starts on a clean line.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, LogError> {
        let path = path.as_ref().to_path_buf();
        let scan = scan(&path)?;
        if scan.torn {
            tracing::warn!(path = %path.display(), keep = scan.complete_len, "truncating torn final line");
            repair_tail(&path, |f| f.set_len(scan.complete_len))?;
        } else if scan.unterminated {
            repair_tail(&path, |f| f.write_all(b"\n"))?;
        }
        let tail = Tail::from_entries(&scan.entries);
        tracing::debug!(path = %path.display(), entries = tail.ids.len(), "opened generation log");
        Ok(Self::with_tail(path, tail))
    }

    fn with_tail(path: PathBuf, tail: Tail) -> Self {
        Self {
            inner: Arc::new(Inner {
                path,
                tail: Mutex::new(tail),
            }),
        }
    }

    pub fn path(&self) -> &Path {
        &self.inner.path
    }

    async fn blocking<T, F>(&self, f: F) -> Result<T, LogError>
    where
        T: Send + 'static,
        F: FnOnce(&Inner) -> Result<T, LogError> + Send + 'static,
    {
        let inner = self.inner.clone();
        tokio::task::spawn_blocking(move || f(&inner))
            .await
            .map_err(|e| LogError::Io(format!("log task failed: {e}")))?
    }
}

impl Inner {
    fn append(&self, entry: GenerationLogEntry) -> Result<GenerationLogEntry, LogError> {
        self.append_with(entry, |file, bytes| {
            file.write_all(bytes)?;
            file.sync_data()
        })
    }

    /// `write` must either persist `bytes` or fail. On failure the file is cut
    /// back to its previous length; if that fails as well the tail is
    /// re-read from disk so the chain continues from whatever landed.
    fn append_with(
        &self,
        mut entry: GenerationLogEntry,
        write: impl FnOnce(&mut File, &[u8]) -> io::Result<()>,
    ) -> Result<GenerationLogEntry, LogError> {
        let mut tail = self.tail.lock().map_err(|_| LogError::Io("lock".into()))?;
        if tail.ids.contains(&entry.execution_id) {
            return Err(LogError::Duplicate(entry.execution_id));
        }
        entry.seal(tail.last_hash.clone())?;

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(|e| LogError::Io(e.to_string()))?;
        let mut line = serde_json::to_string(&entry).map_err(|e| LogError::Parse(e.to_string()))?;
        line.push('\n');
        let before = file
            .metadata()
            .map_err(|e| LogError::Io(e.to_string()))?
            .len();

        if let Err(err) = write(&mut file, line.as_bytes()) {
            tracing::error!(path = %self.path.display(), error = %err, "append failed; rolling back");
            if let Err(trunc) = file.set_len(before) {
                tracing::error!(error = %trunc, "rollback failed; resyncing tail from disk");
                match scan(&self.path) {
                    Ok(scan) => *tail = Tail::from_entries(&scan.entries),
                    Err(e) => tracing::error!(error = %e, "tail resync failed"),
                }
            }
            return Err(LogError::Io(err.to_string()));
        }

        tail.last_hash = Some(entry.chain_hash.clone());
        tail.ids.insert(entry.execution_id);
        Ok(entry)
    }

    fn load(&self) -> Result<Vec<GenerationLogEntry>, LogError> {
        // Hold the tail lock so readers never see a half-written line.
        let _tail = self.tail.lock().map_err(|_| LogError::Io("lock".into()))?;
        Ok(scan(&self.path)?.entries)
    }
}

#[async_trait]
impl GenerationLogger for JsonlGenerationLog {
    async fn record(&self, entry: GenerationLogEntry) -> Result<GenerationLogEntry, LogError> {
        self.blocking(move |inner| inner.append(entry)).await
    }

    async fn query(&self, filter: &LogFilter) -> Result<LogPage, LogError> {
        let entries = self.blocking(Inner::load).await?;
        Ok(filter.page(entries.iter()))
    }

    async fn get(&self, execution_id: ExecutionId) -> Result<Option<GenerationLogEntry>, LogError> {
        let entries = self.blocking(Inner::load).await?;
        Ok(entries.into_iter().find(|e| e.execution_id == execution_id))
    }

    async fn cost_summary(&self, project_id: &str) -> Result<CostSummary, LogError> {
        let entries = self.blocking(Inner::load).await?;
        Ok(CostSummary::from_entries(project_id, entries.iter()))
    }
}

/// Walk the chain and return the number of verified entries.
pub fn verify_log(path: impl AsRef<Path>) -> Result<usize, LogError> {
    let mut prev: Option<String> = None;
    let entries = scan(path.as_ref())?.entries;
    for (idx, entry) in entries.iter().enumerate() {
        let line = idx + 1;
        if entry.prev_hash != prev {
            return Err(LogError::Chain {
                line,
                reason: "prev_hash mismatch".into(),
            });
        }
        if entry.chain_hash != entry.compute_chain_hash()? {
            return Err(LogError::Chain {
                line,
                reason: "chain hash invalid".into(),
            });
        }
        prev = Some(entry.chain_hash.clone());
    }
    Ok(entries.len())
}

fn scan(path: &Path) -> Result<Scan, LogError> {
    if !path.exists() {
        return Ok(Scan {
            entries: Vec::new(),
            complete_len: 0,
            torn: false,
            unterminated: false,
        });
    }
    let body = fs::read_to_string(path).map_err(|e| LogError::Io(e.to_string()))?;
    let mut entries = Vec::new();
    let mut offset = 0usize;
    let mut torn = false;
    let mut unterminated = false;
    for segment in body.split_inclusive('\n') {
        let terminated = segment.ends_with('\n');
        if segment.trim().is_empty() {
            offset += segment.len();
            continue;
        }
        match serde_json::from_str::<GenerationLogEntry>(segment.trim_end()) {
            Ok(entry) if terminated => {
                entries.push(entry);
                offset += segment.len();
            }
            Ok(entry) => {
                entries.push(entry);
                offset += segment.len();
                unterminated = true;
            }
            Err(_) if !terminated => {
                tracing::warn!(path = %path.display(), bytes = segment.len(), "ignoring torn final line");
                torn = true;
            }
            Err(e) => return Err(LogError::Parse(e.to_string())),
        }
    }
    Ok(Scan {
        entries,
        complete_len: offset as u64,
        torn,
        unterminated,
    })
}

fn repair_tail(path: &Path, fix: impl FnOnce(&mut File) -> io::Result<()>) -> Result<(), LogError> {
    let mut file = OpenOptions::new()
        .append(true)
        .open(path)
        .map_err(|e| LogError::Io(e.to_string()))?;
    fix(&mut file)
        .and_then(|()| file.sync_data())
        .map_err(|e| LogError::Io(e.to_string()))
}
