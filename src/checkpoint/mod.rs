#![forbid(unsafe_code)]

//! Checkpoints and the task store that persists them.
//!
//! A checkpoint is opaque resumption state produced by a checkpointable
//! query logic. The executor never interprets it: it only stores it inside a
//! `Next` task and hands it back to the logic when that task runs.
//!
//! Tasks are persisted as framed buffers:
//!
//! ```text
//! +-------+---------+-------+-------------+-------------------+
//! | CKPT  | version | crc32 | payload len | JSON payload ...  |
//! | 4 B   | u16 BE  | u32BE | u64 BE      |                   |
//! +-------+---------+-------+-------------+-------------------+
//! ```
//!
//! A reader either decodes a complete frame whose checksum matches or gets
//! [`CairnError::CorruptCheckpoint`]; there is no partial result.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;
use tracing::{debug, warn};

use crate::types::checksum::checkpoint_crc32;
use crate::types::{CairnError, QueryId, QueryKey, Result, TaskId, TaskKey};

const FRAME_MAGIC: [u8; 4] = *b"CKPT";
const FRAME_VERSION: u16 = 1;
const FRAME_HDR_LEN: usize = 4 + 2 + 4 + 8;
const TASK_FILE_EXT: &str = "task";

/// Persisted resumption state for a checkpointable query logic.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryCheckpoint {
    query_key: QueryKey,
    properties: BTreeMap<String, String>,
}

impl QueryCheckpoint {
    /// Empty checkpoint for `query_key`.
    pub fn new(query_key: QueryKey) -> Self {
        Self {
            query_key,
            properties: BTreeMap::new(),
        }
    }

    /// Adds or replaces one named property.
    pub fn with_property(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.properties.insert(name.into(), value.into());
        self
    }

    /// Query the checkpoint resumes.
    pub fn query_key(&self) -> &QueryKey {
        &self.query_key
    }

    /// Value of one property.
    pub fn property(&self, name: &str) -> Option<&str> {
        self.properties.get(name).map(String::as_str)
    }

    /// All properties, ordered by name.
    pub fn properties(&self) -> &BTreeMap<String, String> {
        &self.properties
    }
}

/// Kind of work a task performs.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TaskAction {
    /// Initialize the logic and either exhaust it or checkpoint once.
    Create,
    /// Resume from a checkpoint and pull one bounded slice.
    Next,
}

impl fmt::Display for TaskAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskAction::Create => f.write_str("CREATE"),
            TaskAction::Next => f.write_str("NEXT"),
        }
    }
}

/// One schedulable unit of work, as stored and dispatched.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryTask {
    /// Identity of the task.
    pub task_key: TaskKey,
    /// What the task does when handled.
    pub action: TaskAction,
    /// Resumption state; required for `Next`.
    pub checkpoint: Option<QueryCheckpoint>,
    /// Task whose handling stored this one, for `Next` successors.
    #[serde(default)]
    pub predecessor: Option<TaskId>,
}

impl QueryTask {
    /// Query this belongs to.
    pub fn query_id(&self) -> &QueryId {
        self.task_key.query_id()
    }
}

/// Encodes a task into a checksummed frame.
pub fn encode_task(task: &QueryTask) -> Result<Vec<u8>> {
    let payload = serde_json::to_vec(task)
        .map_err(|err| CairnError::Store(format!("failed to serialize task: {err}")))?;
    let mut buf = Vec::with_capacity(FRAME_HDR_LEN + payload.len());
    buf.extend_from_slice(&FRAME_MAGIC);
    buf.extend_from_slice(&FRAME_VERSION.to_be_bytes());
    buf.extend_from_slice(&checkpoint_crc32(FRAME_VERSION, &payload).to_be_bytes());
    buf.extend_from_slice(&(payload.len() as u64).to_be_bytes());
    buf.extend_from_slice(&payload);
    Ok(buf)
}

/// Decodes a frame written by [`encode_task`].
pub fn decode_task(buf: &[u8]) -> Result<QueryTask> {
    if buf.len() < FRAME_HDR_LEN {
        return Err(CairnError::CorruptCheckpoint(format!(
            "frame truncated: {} bytes",
            buf.len()
        )));
    }
    if buf[0..4] != FRAME_MAGIC {
        return Err(CairnError::CorruptCheckpoint("bad frame magic".into()));
    }
    let version = u16::from_be_bytes([buf[4], buf[5]]);
    if version != FRAME_VERSION {
        return Err(CairnError::CorruptCheckpoint(format!(
            "unsupported frame version {version}"
        )));
    }
    let crc = u32::from_be_bytes([buf[6], buf[7], buf[8], buf[9]]);
    let mut len_bytes = [0u8; 8];
    len_bytes.copy_from_slice(&buf[10..18]);
    let len = u64::from_be_bytes(len_bytes) as usize;
    let payload = &buf[FRAME_HDR_LEN..];
    if payload.len() != len {
        return Err(CairnError::CorruptCheckpoint(format!(
            "payload length {} does not match header length {len}",
            payload.len()
        )));
    }
    if checkpoint_crc32(version, payload) != crc {
        return Err(CairnError::CorruptCheckpoint("checksum mismatch".into()));
    }
    serde_json::from_slice(payload)
        .map_err(|err| CairnError::CorruptCheckpoint(format!("undecodable payload: {err}")))
}

/// Persistent home of query tasks and their checkpoints.
pub trait QueryTaskStore: Send + Sync {
    /// Persists a new task under a fresh task id.
    fn create_task(
        &self,
        query_key: &QueryKey,
        action: TaskAction,
        checkpoint: Option<QueryCheckpoint>,
    ) -> Result<QueryTask>;

    /// Overwrites the stored frame for `task.task_key`.
    fn put_task(&self, task: &QueryTask) -> Result<()>;

    /// Loads a task. Fails with `TaskNotFound` or `CorruptCheckpoint`.
    fn get_task(&self, task_key: &TaskKey) -> Result<QueryTask>;

    /// Removes a handled task. Deleting a missing task is not an error.
    fn delete_task(&self, task_key: &TaskKey) -> Result<()>;

    /// Keys of all tasks stored for a query, in task id order.
    fn tasks_for(&self, query_id: &QueryId) -> Result<Vec<TaskKey>>;

    /// Stores the `Next` task that continues `predecessor` from `checkpoint`.
    ///
    /// A predecessor has at most one successor: handling the same task
    /// twice rewrites the successor already stored instead of forking the
    /// chain.
    fn create_successor(
        &self,
        predecessor: &TaskKey,
        checkpoint: QueryCheckpoint,
    ) -> Result<QueryTask> {
        for key in self.tasks_for(predecessor.query_id())? {
            let existing = self.get_task(&key)?;
            if existing.predecessor == Some(predecessor.task_id) {
                let task = QueryTask {
                    checkpoint: Some(checkpoint),
                    ..existing
                };
                self.put_task(&task)?;
                debug!(task = %task.task_key, predecessor = %predecessor, "tasks.successor.replace");
                return Ok(task);
            }
        }
        let mut task =
            self.create_task(&predecessor.query_key, TaskAction::Next, Some(checkpoint))?;
        task.predecessor = Some(predecessor.task_id);
        self.put_task(&task)?;
        Ok(task)
    }

    /// First stored task of the same query created after `task_key`.
    ///
    /// Tasks of one query form a single chain with increasing ids, so a
    /// later task means `task_key` was already handled.
    fn superseded_by(&self, task_key: &TaskKey) -> Result<Option<TaskKey>> {
        Ok(self
            .tasks_for(task_key.query_id())?
            .into_iter()
            .find(|key| key.task_id > task_key.task_id))
    }
}

/// In-process task store; each task is held as one encoded frame.
#[derive(Default)]
pub struct InMemoryQueryTaskStore {
    frames: RwLock<HashMap<TaskKey, Vec<u8>>>,
    next_id: Mutex<u64>,
}

impl InMemoryQueryTaskStore {
    /// Empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces a stored frame verbatim.
    pub fn put_raw(&self, task_key: TaskKey, frame: Vec<u8>) {
        self.frames.write().insert(task_key, frame);
    }
}

impl QueryTaskStore for InMemoryQueryTaskStore {
    fn create_task(
        &self,
        query_key: &QueryKey,
        action: TaskAction,
        checkpoint: Option<QueryCheckpoint>,
    ) -> Result<QueryTask> {
        let task_id = {
            let mut next = self.next_id.lock();
            *next += 1;
            TaskId(*next)
        };
        let task = QueryTask {
            task_key: TaskKey::new(task_id, query_key.clone()),
            action,
            checkpoint,
            predecessor: None,
        };
        self.put_task(&task)?;
        debug!(task = %task.task_key, action = %action, "tasks.create");
        Ok(task)
    }

    fn put_task(&self, task: &QueryTask) -> Result<()> {
        let frame = encode_task(task)?;
        self.frames.write().insert(task.task_key.clone(), frame);
        Ok(())
    }

    fn get_task(&self, task_key: &TaskKey) -> Result<QueryTask> {
        let frames = self.frames.read();
        let frame = frames
            .get(task_key)
            .ok_or_else(|| CairnError::TaskNotFound(task_key.clone()))?;
        decode_task(frame)
    }

    fn delete_task(&self, task_key: &TaskKey) -> Result<()> {
        self.frames.write().remove(task_key);
        Ok(())
    }

    fn tasks_for(&self, query_id: &QueryId) -> Result<Vec<TaskKey>> {
        let mut keys: Vec<TaskKey> = self
            .frames
            .read()
            .keys()
            .filter(|key| key.query_id() == query_id)
            .cloned()
            .collect();
        keys.sort_by_key(|key| key.task_id);
        Ok(keys)
    }
}

/// Task store backed by one file per task. Writes go to a temporary file in
/// the same directory and are renamed into place.
pub struct FileQueryTaskStore {
    root: PathBuf,
    next_id: Mutex<u64>,
}

impl FileQueryTaskStore {
    /// Opens (creating if needed) a store rooted at `root`.
    pub fn open(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root)?;
        let mut max_id = 0;
        for query_dir in fs::read_dir(&root)? {
            let query_dir = query_dir?;
            if !query_dir.file_type()?.is_dir() {
                continue;
            }
            for entry in fs::read_dir(query_dir.path())? {
                if let Some(id) = task_id_from_path(&entry?.path()) {
                    max_id = max_id.max(id);
                }
            }
        }
        Ok(Self {
            root,
            next_id: Mutex::new(max_id),
        })
    }

    fn query_dir(&self, query_id: &QueryId) -> PathBuf {
        self.root.join(sanitize(query_id.as_str()))
    }

    fn task_path(&self, task_key: &TaskKey) -> PathBuf {
        self.query_dir(task_key.query_id())
            .join(format!("{}.{TASK_FILE_EXT}", task_key.task_id.0))
    }
}

impl QueryTaskStore for FileQueryTaskStore {
    fn create_task(
        &self,
        query_key: &QueryKey,
        action: TaskAction,
        checkpoint: Option<QueryCheckpoint>,
    ) -> Result<QueryTask> {
        let task_id = {
            let mut next = self.next_id.lock();
            *next += 1;
            TaskId(*next)
        };
        let task = QueryTask {
            task_key: TaskKey::new(task_id, query_key.clone()),
            action,
            checkpoint,
            predecessor: None,
        };
        self.put_task(&task)?;
        debug!(task = %task.task_key, action = %action, "tasks.file.create");
        Ok(task)
    }

    fn put_task(&self, task: &QueryTask) -> Result<()> {
        let frame = encode_task(task)?;
        let dir = self.query_dir(task.query_id());
        fs::create_dir_all(&dir)?;
        let mut tmp = NamedTempFile::new_in(&dir)?;
        tmp.write_all(&frame)?;
        tmp.as_file().sync_all()?;
        tmp.persist(self.task_path(&task.task_key))
            .map_err(|err| CairnError::Io(err.error))?;
        Ok(())
    }

    fn get_task(&self, task_key: &TaskKey) -> Result<QueryTask> {
        let path = self.task_path(task_key);
        let frame = match fs::read(&path) {
            Ok(frame) => frame,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Err(CairnError::TaskNotFound(task_key.clone()))
            }
            Err(err) => return Err(err.into()),
        };
        let task = decode_task(&frame)?;
        if &task.task_key != task_key {
            warn!(path = %path.display(), "tasks.file.key_mismatch");
            return Err(CairnError::CorruptCheckpoint(format!(
                "file {} holds task {}",
                path.display(),
                task.task_key
            )));
        }
        Ok(task)
    }

    fn delete_task(&self, task_key: &TaskKey) -> Result<()> {
        match fs::remove_file(self.task_path(task_key)) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    fn tasks_for(&self, query_id: &QueryId) -> Result<Vec<TaskKey>> {
        let dir = self.query_dir(query_id);
        if !dir.exists() {
            return Ok(Vec::new());
        }
        let mut keys = Vec::new();
        for entry in fs::read_dir(&dir)? {
            let path = entry?.path();
            if task_id_from_path(&path).is_none() {
                continue;
            }
            let frame = fs::read(&path)?;
            keys.push(decode_task(&frame)?.task_key);
        }
        keys.sort_by_key(|key| key.task_id);
        Ok(keys)
    }
}

fn task_id_from_path(path: &Path) -> Option<u64> {
    if path.extension()?.to_str()? != TASK_FILE_EXT {
        return None;
    }
    path.file_stem()?.to_str()?.parse().ok()
}

fn sanitize(id: &str) -> String {
    id.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect()
}
