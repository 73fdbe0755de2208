///! Durable persistence for the orbital element cache
///!
///! The on-disk format is a JSON-lines journal: every mutation appends one
///! entry, loading replays the journal (last write wins), and compaction
///! rewrites it as a single snapshot after a successful refresh.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use skywatch_common::OrbitalElementRecord;
use std::collections::HashMap;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tracing::{debug, info, warn};

use super::types::CacheMetadata;
use crate::error::StoreError;

/// Journal file name inside the data directory
const JOURNAL_FILE: &str = "elements.jsonl";

/// Everything the store holds
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StoreSnapshot {
    pub records: HashMap<String, OrbitalElementRecord>,
    pub metadata: CacheMetadata,
}

/// Persistence backend for [`super::cache::OrbitalElementCache`]
#[async_trait]
pub trait ElementStore: Send + Sync {
    /// Load every persisted record plus the metadata row
    async fn load(&self) -> Result<StoreSnapshot, StoreError>;

    /// Insert or replace one record
    async fn put_record(&self, record: &OrbitalElementRecord) -> Result<(), StoreError>;

    /// Replace the metadata row
    async fn put_metadata(&self, metadata: &CacheMetadata) -> Result<(), StoreError>;

    /// Replace the stored state with `snapshot` in one step
    async fn compact(&self, snapshot: &StoreSnapshot) -> Result<(), StoreError>;
}

#[derive(Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
enum JournalEntryRef<'a> {
    Record(&'a OrbitalElementRecord),
    Metadata(&'a CacheMetadata),
}

#[derive(Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
enum JournalEntry {
    Record(OrbitalElementRecord),
    Metadata(CacheMetadata),
}

/// JSON-lines journal in a data directory
pub struct JsonlStore {
    data_dir: PathBuf,
    /// Append handle, opened lazily and dropped on compaction
    writer: tokio::sync::Mutex<Option<fs::File>>,
}

impl JsonlStore {
    /// Create a store rooted at `data_dir`. Nothing touches the disk until
    /// the first load or write.
    pub fn new<P: AsRef<Path>>(data_dir: P) -> Self {
        Self {
            data_dir: data_dir.as_ref().to_path_buf(),
            writer: tokio::sync::Mutex::new(None),
        }
    }

    pub fn journal_path(&self) -> PathBuf {
        self.data_dir.join(JOURNAL_FILE)
    }

    async fn ensure_data_dir(&self) -> Result<(), StoreError> {
        if !self.data_dir.exists() {
            fs::create_dir_all(&self.data_dir)
                .await
                .map_err(|source| StoreError::Io {
                    path: self.data_dir.clone(),
                    source,
                })?;
            info!("Created data directory: {:?}", self.data_dir);
        }
        Ok(())
    }

    async fn open_journal(&self) -> Result<fs::File, StoreError> {
        self.ensure_data_dir().await?;
        let path = self.journal_path();
        let io_err = |source| StoreError::Io {
            path: path.clone(),
            source,
        };

        let torn = !ends_with_newline(&path).await.map_err(io_err)?;
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .map_err(io_err)?;

        // Terminate a torn tail so the next entry starts on its own line
        if torn {
            warn!("Journal {:?} ends in a partial line, terminating it", path);
            file.write_all(b"\n").await.map_err(io_err)?;
        }
        Ok(file)
    }

    async fn append(&self, entry: JournalEntryRef<'_>) -> Result<(), StoreError> {
        let mut line = serde_json::to_vec(&entry)?;
        line.push(b'\n');

        let mut writer = self.writer.lock().await;
        if writer.is_none() {
            *writer = Some(self.open_journal().await?);
        }
        if let Some(file) = writer.as_mut() {
            let io_err = |source| StoreError::Io {
                path: self.journal_path(),
                source,
            };
            file.write_all(&line).await.map_err(io_err)?;
            file.flush().await.map_err(io_err)?;
        }
        Ok(())
    }
}

#[async_trait]
impl ElementStore for JsonlStore {
    async fn load(&self) -> Result<StoreSnapshot, StoreError> {
        let path = self.journal_path();
        if !path.exists() {
            debug!("Journal does not exist yet: {:?}", path);
            return Ok(StoreSnapshot::default());
        }

        let content = fs::read_to_string(&path)
            .await
            .map_err(|source| StoreError::Io {
                path: path.clone(),
                source,
            })?;

        let mut snapshot = StoreSnapshot::default();
        let mut skipped = 0;
        for (index, line) in content.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<JournalEntry>(line) {
                Ok(JournalEntry::Record(record)) => {
                    snapshot.records.insert(record.catalog_id.clone(), record);
                }
                Ok(JournalEntry::Metadata(metadata)) => snapshot.metadata = metadata,
                Err(e) => {
                    // A torn trailing write is the usual culprit
                    warn!("Skipping malformed journal line {}: {}", index + 1, e);
                    skipped += 1;
                }
            }
        }

        info!(
            "Loaded {} records from {:?} ({} malformed lines skipped)",
            snapshot.records.len(),
            path,
            skipped
        );
        Ok(snapshot)
    }

    async fn put_record(&self, record: &OrbitalElementRecord) -> Result<(), StoreError> {
        self.append(JournalEntryRef::Record(record)).await
    }

    async fn put_metadata(&self, metadata: &CacheMetadata) -> Result<(), StoreError> {
        self.append(JournalEntryRef::Metadata(metadata)).await
    }

    async fn compact(&self, snapshot: &StoreSnapshot) -> Result<(), StoreError> {
        // Hold the writer for the whole rewrite so no append lands in the
        // file that is about to be replaced
        let mut writer = self.writer.lock().await;
        self.ensure_data_dir().await?;

        let tmp_path = self.data_dir.join(format!("{}.tmp", JOURNAL_FILE));
        let io_err = |path: &Path| {
            let path = path.to_path_buf();
            move |source| StoreError::Io { path, source }
        };

        let mut ids: Vec<&String> = snapshot.records.keys().collect();
        ids.sort();

        let mut content = Vec::with_capacity(ids.len() * 256);
        for id in ids {
            serde_json::to_writer(&mut content, &JournalEntryRef::Record(&snapshot.records[id]))?;
            content.push(b'\n');
        }
        serde_json::to_writer(&mut content, &JournalEntryRef::Metadata(&snapshot.metadata))?;
        content.push(b'\n');

        let mut tmp = fs::File::create(&tmp_path).await.map_err(io_err(&tmp_path))?;
        tmp.write_all(&content).await.map_err(io_err(&tmp_path))?;
        tmp.sync_all().await.map_err(io_err(&tmp_path))?;
        drop(tmp);

        *writer = None;
        let journal = self.journal_path();
        fs::rename(&tmp_path, &journal)
            .await
            .map_err(io_err(&journal))?;

        debug!(
            "Compacted journal to {} records",
            snapshot.records.len()
        );
        Ok(())
    }
}

/// Whether the file is missing, empty or ends in `\n`
async fn ends_with_newline(path: &Path) -> std::io::Result<bool> {
    let mut file = match fs::File::open(path).await {
        Ok(file) => file,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(true),
        Err(e) => return Err(e),
    };
    if file.metadata().await?.len() == 0 {
        return Ok(true);
    }

    let mut last = [0u8; 1];
    file.seek(SeekFrom::End(-1)).await?;
    file.read_exact(&mut last).await?;
    Ok(last[0] == b'\n')
}

/// Volatile store, for tests and ephemeral runs
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<StoreSnapshot>,
    writes: AtomicUsize,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start from an existing snapshot, as if it had been persisted earlier
    pub fn with_snapshot(snapshot: StoreSnapshot) -> Self {
        Self {
            state: Mutex::new(snapshot),
            writes: AtomicUsize::new(0),
        }
    }

    /// Number of mutating calls received so far
    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    pub fn snapshot(&self) -> StoreSnapshot {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn with_state<T>(&self, f: impl FnOnce(&mut StoreSnapshot) -> T) -> T {
        self.writes.fetch_add(1, Ordering::SeqCst);
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut state)
    }
}

#[async_trait]
impl ElementStore for MemoryStore {
    async fn load(&self) -> Result<StoreSnapshot, StoreError> {
        Ok(self.snapshot())
    }

    async fn put_record(&self, record: &OrbitalElementRecord) -> Result<(), StoreError> {
        self.with_state(|state| {
            state
                .records
                .insert(record.catalog_id.clone(), record.clone());
        });
        Ok(())
    }

    async fn put_metadata(&self, metadata: &CacheMetadata) -> Result<(), StoreError> {
        self.with_state(|state| state.metadata = metadata.clone());
        Ok(())
    }

    async fn compact(&self, snapshot: &StoreSnapshot) -> Result<(), StoreError> {
        self.with_state(|state| *state = snapshot.clone());
        Ok(())
    }
}
