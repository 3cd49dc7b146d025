//! Durable stores on the local filesystem.
//!
//! Every record is written to a temporary file, synced, renamed into place
//! and followed by a sync of the containing directory, so a crash leaves it
//! either fully present or absent.
//!
//! Checkpoint layout: `<root>/<task_id>/<sequence:020>.json`. A deleted
//! checkpoint leaves an empty `<sequence:020>.deleted` tombstone behind so
//! its sequence is never reused.
//!
//! Task layout: `<root>/<task_id>.json`, loaded into memory on open.

use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

use waypoint_core::{Checkpoint, CoreError, CoreResult, Task, TaskFilters, TaskId};

use super::memory::{select_page, version_conflict};
use super::{CheckpointStore, TaskStore};

const EXTENSION: &str = "json";
const TOMBSTONE: &str = "deleted";
const TEMP_SUFFIX: &str = ".tmp";

/// Task ids become file and directory names; reject anything that could
/// escape the store root or hide as a dotfile.
fn path_segment<'a>(task_id: &'a TaskId, what: &str) -> CoreResult<&'a str> {
    let id = task_id.as_str();
    if id.is_empty() || id.starts_with('.') || id.contains(['/', '\\']) {
        return Err(CoreError::InvalidInput(format!(
            "task id '{id}' cannot be used as a {what}"
        )));
    }
    Ok(id)
}

/// Flush directory entries so a create, rename or unlink survives a crash.
#[cfg(unix)]
async fn sync_dir(dir: &Path) -> io::Result<()> {
    fs::File::open(dir).await?.sync_all().await
}

#[cfg(not(unix))]
async fn sync_dir(_dir: &Path) -> io::Result<()> {
    Ok(())
}

/// Create `dir` (and missing parents), syncing its parent when it is new.
async fn ensure_dir(dir: &Path) -> io::Result<()> {
    if fs::metadata(dir).await.is_ok() {
        return Ok(());
    }
    fs::create_dir_all(dir).await?;
    match dir.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => sync_dir(parent).await,
        _ => Ok(()),
    }
}

/// Write `bytes` to `dir/name` via temp file, fsync, rename and directory fsync.
async fn write_atomic(dir: &Path, name: &str, bytes: &[u8]) -> io::Result<()> {
    let final_path = dir.join(name);
    let temp_path = dir.join(format!(".{name}{TEMP_SUFFIX}"));

    let write = async {
        let mut file = fs::File::create(&temp_path).await?;
        file.write_all(bytes).await?;
        file.sync_all().await?;
        drop(file);
        fs::rename(&temp_path, &final_path).await?;
        sync_dir(dir).await
    };

    let result = write.await;
    if result.is_err() {
        let _ = fs::remove_file(&temp_path).await;
    }
    result
}

// ----------------------------------------------------------------------
// Checkpoints
// ----------------------------------------------------------------------

/// Checkpoint store backed by one directory per task.
pub struct FileCheckpointStore {
    root: PathBuf,
    /// Last reserved sequence per task, rebuilt lazily from disk.
    sequences: Mutex<HashMap<TaskId, u64>>,
}

impl FileCheckpointStore {
    /// Open (creating if needed) a store rooted at `root`.
    pub async fn open(root: impl Into<PathBuf>) -> CoreResult<Self> {
        let root = root.into();
        ensure_dir(&root).await?;
        Ok(Self {
            root,
            sequences: Mutex::new(HashMap::new()),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn task_dir(&self, task_id: &TaskId) -> CoreResult<PathBuf> {
        Ok(self.root.join(path_segment(task_id, "checkpoint directory")?))
    }

    /// Reserve the next sequence for `task_id`. Never hands out the same
    /// number twice, even if the write that follows fails.
    async fn reserve_sequence(&self, task_id: &TaskId, dir: &Path) -> CoreResult<u64> {
        let mut sequences = self.sequences.lock().await;
        let last = match sequences.get(task_id) {
            Some(last) => *last,
            None => scan(dir).await?.highest(),
        };
        let next = last + 1;
        sequences.insert(task_id.clone(), next);
        Ok(next)
    }

    /// Replace a committed checkpoint with its tombstone.
    async fn retire(&self, dir: &Path, sequence: u64) -> CoreResult<()> {
        write_atomic(dir, &file_name(sequence, TOMBSTONE), b"").await?;
        fs::remove_file(dir.join(file_name(sequence, EXTENSION))).await?;
        sync_dir(dir).await?;
        Ok(())
    }
}

fn file_name(sequence: u64, extension: &str) -> String {
    format!("{sequence:020}.{extension}")
}

/// Parse `<sequence:020>.<extension>`; temp files and strays yield `None`.
fn parse_sequence(name: &str, extension: &str) -> Option<u64> {
    let stem = name.strip_suffix(extension)?.strip_suffix('.')?;
    if stem.len() != 20 || !stem.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    stem.parse().ok()
}

/// What a task's checkpoint directory holds.
#[derive(Debug, Default)]
struct Scan {
    /// Committed checkpoints without a tombstone, ascending.
    live: Vec<u64>,
    /// Deleted sequences.
    retired: Vec<u64>,
}

impl Scan {
    fn highest(&self) -> u64 {
        self.live.iter().chain(&self.retired).copied().max().unwrap_or(0)
    }
}

/// Scan `dir`. A missing directory is empty.
async fn scan(dir: &Path) -> CoreResult<Scan> {
    let mut entries = match fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Scan::default()),
        Err(e) => return Err(e.into()),
    };

    let mut scan = Scan::default();
    while let Some(entry) = entries.next_entry().await? {
        let name = entry.file_name();
        let Some(name) = name.to_str() else {
            continue;
        };
        if let Some(seq) = parse_sequence(name, EXTENSION) {
            scan.live.push(seq);
        } else if let Some(seq) = parse_sequence(name, TOMBSTONE) {
            scan.retired.push(seq);
        } else {
            debug!(file = %name, "Ignoring non-checkpoint file");
        }
    }

    // A crash between tombstone and unlink leaves both; the tombstone wins.
    scan.live.retain(|seq| !scan.retired.contains(seq));
    scan.live.sort_unstable();
    Ok(scan)
}

async fn read_checkpoint(path: &Path) -> CoreResult<Checkpoint> {
    let bytes = fs::read(path).await?;
    Ok(serde_json::from_slice(&bytes)?)
}

#[async_trait]
impl CheckpointStore for FileCheckpointStore {
    async fn append(
        &self,
        task_id: &TaskId,
        name: Option<String>,
        data: Value,
    ) -> CoreResult<Checkpoint> {
        let dir = self.task_dir(task_id)?;
        ensure_dir(&dir).await?;

        let sequence = self.reserve_sequence(task_id, &dir).await?;
        let checkpoint = Checkpoint::new(task_id.clone(), sequence, name, data);
        let bytes = serde_json::to_vec_pretty(&checkpoint)?;

        if let Err(e) = write_atomic(&dir, &file_name(sequence, EXTENSION), &bytes).await {
            warn!(
                task_id = %task_id,
                sequence,
                error = %e,
                "Checkpoint write failed, sequence skipped"
            );
            return Err(e.into());
        }

        debug!(task_id = %task_id, sequence, "Checkpoint persisted");
        Ok(checkpoint)
    }

    async fn latest(&self, task_id: &TaskId) -> CoreResult<Checkpoint> {
        let dir = self.task_dir(task_id)?;
        let last = scan(&dir)
            .await?
            .live
            .last()
            .copied()
            .ok_or_else(|| CoreError::checkpoint_not_found(task_id))?;
        read_checkpoint(&dir.join(file_name(last, EXTENSION))).await
    }

    async fn list(&self, task_id: &TaskId) -> CoreResult<Vec<Checkpoint>> {
        let dir = self.task_dir(task_id)?;
        let live = scan(&dir).await?.live;

        let mut history = Vec::with_capacity(live.len());
        for seq in live {
            history.push(read_checkpoint(&dir.join(file_name(seq, EXTENSION))).await?);
        }
        Ok(history)
    }

    async fn delete(&self, task_id: &TaskId, sequence: u64) -> CoreResult<()> {
        let dir = self.task_dir(task_id)?;
        if !scan(&dir).await?.live.contains(&sequence) {
            return Err(CoreError::NotFound {
                kind: "checkpoint",
                id: format!("{task_id}#{sequence}"),
            });
        }
        self.retire(&dir, sequence).await?;
        debug!(task_id = %task_id, sequence, "Checkpoint deleted");
        Ok(())
    }

    async fn delete_all(&self, task_id: &TaskId) -> CoreResult<usize> {
        let dir = self.task_dir(task_id)?;
        let live = scan(&dir).await?.live;
        for &seq in &live {
            self.retire(&dir, seq).await?;
        }
        debug!(task_id = %task_id, removed = live.len(), "Checkpoint history deleted");
        Ok(live.len())
    }
}

// ----------------------------------------------------------------------
// Tasks
// ----------------------------------------------------------------------

/// Task store backed by one JSON file per task.
///
/// The table is held in memory and written through on every change; writes
/// are serialized by the table lock.
pub struct FileTaskStore {
    root: PathBuf,
    tasks: RwLock<HashMap<TaskId, Task>>,
}

impl FileTaskStore {
    /// Open (creating if needed) a store rooted at `root` and load every
    /// committed task.
    pub async fn open(root: impl Into<PathBuf>) -> CoreResult<Self> {
        let root = root.into();
        ensure_dir(&root).await?;

        let mut tasks = HashMap::new();
        let mut entries = fs::read_dir(&root).await?;
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            let committed = name
                .to_str()
                .is_some_and(|n| !n.starts_with('.') && n.ends_with(".json"));
            if !committed {
                debug!(file = ?name, "Ignoring non-task file");
                continue;
            }
            let bytes = fs::read(entry.path()).await?;
            let task: Task = serde_json::from_slice(&bytes)?;
            tasks.insert(task.id.clone(), task);
        }

        info!(path = %root.display(), tasks = tasks.len(), "Loaded task store");
        Ok(Self {
            root,
            tasks: RwLock::new(tasks),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    async fn persist(&self, task: &Task) -> CoreResult<()> {
        let name = format!("{}.{EXTENSION}", path_segment(&task.id, "task file name")?);
        let bytes = serde_json::to_vec_pretty(task)?;
        write_atomic(&self.root, &name, &bytes).await?;
        Ok(())
    }
}

#[async_trait]
impl TaskStore for FileTaskStore {
    async fn create(&self, mut task: Task) -> CoreResult<Task> {
        let mut tasks = self.tasks.write().await;
        if tasks.contains_key(&task.id) {
            return Err(CoreError::DuplicateId {
                kind: "task",
                id: task.id.to_string(),
            });
        }
        task.version = 1;
        self.persist(&task).await?;
        tasks.insert(task.id.clone(), task.clone());
        Ok(task)
    }

    async fn get(&self, id: &TaskId) -> CoreResult<Task> {
        self.tasks
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| CoreError::task_not_found(id))
    }

    async fn update(&self, mut task: Task) -> CoreResult<Task> {
        let mut tasks = self.tasks.write().await;
        let stored_version = tasks
            .get(&task.id)
            .map(|stored| stored.version)
            .ok_or_else(|| CoreError::task_not_found(&task.id))?;

        if stored_version != task.version {
            return Err(version_conflict("task", &task.id, task.version, stored_version));
        }

        task.version += 1;
        task.updated_at = Utc::now();
        self.persist(&task).await?;
        tasks.insert(task.id.clone(), task.clone());
        Ok(task)
    }

    async fn list(&self, filters: &TaskFilters) -> CoreResult<Vec<Task>> {
        Ok(select_page(&*self.tasks.read().await, filters))
    }
}
