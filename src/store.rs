//! Journaled persistent map.
//!
//! The derivation cache must survive restarts, so its key→value map lives
//! on disk as two files:
//!
//! ```text
//! store_dir/
//! ├── checkpoint.json   # full snapshot, written atomically on close
//! └── journal.jsonl     # one JSON line per mutation since the checkpoint
//! ```
//!
//! Opening loads the checkpoint (if any) and replays the journal, so a
//! process that died mid-run loses nothing. Every mutation appends its
//! journal lines and closes the file before returning; a `put` is visible
//! to subsequent `look`s the moment it returns, and on disk the moment it
//! returns. Closing folds the journal into a fresh checkpoint (temp file,
//! fsync, rename) and removes it.
//!
//! Use [`with_store`] to get the open → use → checkpoint-and-close cycle
//! on every exit path. A [`Store`] dropped without `close` keeps its
//! journal on disk; the next open replays it, so nothing is lost.
//!
//! The checkpoint envelope carries a format version. Unknown *newer*
//! versions start empty rather than erroring — this is a cache, and
//! rebuilding beats refusing to open. Older versions parse through the
//! tolerant serde forms on the value types themselves.

use crate::error::{Error, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;

const CHECKPOINT_FILE: &str = "checkpoint.json";
const JOURNAL_FILE: &str = "journal.jsonl";

/// Current checkpoint format. Version 1 stored bare success values; the
/// tolerant deserializers on the value types lift those on load.
const FORMAT_VERSION: u32 = 2;

#[derive(Serialize, Deserialize)]
#[serde(bound(
    serialize = "K: Serialize, V: Serialize",
    deserialize = "K: DeserializeOwned, V: DeserializeOwned"
))]
struct Checkpoint<K, V> {
    version: u32,
    entries: Vec<(K, V)>,
}

#[derive(Serialize, Deserialize)]
#[serde(bound(
    serialize = "K: Serialize, V: Serialize",
    deserialize = "K: DeserializeOwned, V: DeserializeOwned"
))]
enum JournalOp<K, V> {
    Put { key: K, value: V },
    Delete { key: K },
}

/// A persistent ordered map. One instance owns the store directory for its
/// lifetime; mutations are serialized through `&mut self`.
pub struct Store<K, V> {
    dir: PathBuf,
    entries: BTreeMap<K, V>,
}

impl<K, V> Store<K, V>
where
    K: Ord + Clone + Serialize + DeserializeOwned,
    V: Clone + Serialize + DeserializeOwned,
{
    /// Open the store at `dir`, initializing an empty one if absent.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)
            .map_err(|e| Error::io(format!("creating store {}: {e}", dir.display())))?;

        let mut entries = load_checkpoint(&dir.join(CHECKPOINT_FILE))?;
        replay_journal(&dir.join(JOURNAL_FILE), &mut entries)?;

        tracing::debug!(dir = %dir.display(), entries = entries.len(), "store opened");
        Ok(Store { dir, entries })
    }

    /// Number of live entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Insert or replace one entry.
    pub fn put(&mut self, key: K, value: V) -> Result<()> {
        self.append_journal(&[JournalOp::Put {
            key: key.clone(),
            value: value.clone(),
        }])?;
        self.entries.insert(key, value);
        Ok(())
    }

    /// Insert or replace a batch of entries as one append.
    pub fn put_all(&mut self, batch: BTreeMap<K, V>) -> Result<()> {
        let ops: Vec<JournalOp<K, V>> = batch
            .iter()
            .map(|(key, value)| JournalOp::Put {
                key: key.clone(),
                value: value.clone(),
            })
            .collect();
        self.append_journal(&ops)?;
        self.entries.extend(batch);
        Ok(())
    }

    /// Value for a key, if present.
    pub fn look(&self, key: &K) -> Option<V> {
        self.entries.get(key).cloned()
    }

    /// The present subset of `keys`, as a map.
    pub fn look_many(&self, keys: &[K]) -> BTreeMap<K, V> {
        keys.iter()
            .filter_map(|k| self.entries.get(k).map(|v| (k.clone(), v.clone())))
            .collect()
    }

    /// Every entry.
    pub fn look_all(&self) -> BTreeMap<K, V> {
        self.entries.clone()
    }

    /// Remove one entry. Removing an absent key is a no-op.
    pub fn delete(&mut self, key: &K) -> Result<()> {
        if !self.entries.contains_key(key) {
            return Ok(());
        }
        self.append_journal(&[JournalOp::<K, V>::Delete { key: key.clone() }])?;
        self.entries.remove(key);
        Ok(())
    }

    /// Remove a batch of entries as one append.
    pub fn delete_many(&mut self, keys: &[K]) -> Result<()> {
        let ops: Vec<JournalOp<K, V>> = keys
            .iter()
            .filter(|key| self.entries.contains_key(*key))
            .map(|key| JournalOp::<K, V>::Delete { key: key.clone() })
            .collect();
        if ops.is_empty() {
            return Ok(());
        }
        self.append_journal(&ops)?;
        for key in keys {
            self.entries.remove(key);
        }
        Ok(())
    }

    /// Write a checkpoint and release the store. After this the directory
    /// holds exactly one `checkpoint.json` and no journal.
    pub fn close(self) -> Result<()> {
        self.checkpoint()?;
        let _ = fs::remove_file(self.dir.join(JOURNAL_FILE));
        tracing::debug!(dir = %self.dir.display(), "store closed");
        Ok(())
    }

    /// Append a batch of operations to the journal as one open/write/close.
    fn append_journal(&self, ops: &[JournalOp<K, V>]) -> Result<()> {
        let mut buffer = String::new();
        for op in ops {
            let line = serde_json::to_string(op)
                .map_err(|e| Error::other(format!("encoding journal entry: {e}")))?;
            buffer.push_str(&line);
            buffer.push('\n');
        }
        let mut journal = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.dir.join(JOURNAL_FILE))
            .map_err(|e| Error::io(format!("opening journal: {e}")))?;
        journal
            .write_all(buffer.as_bytes())
            .map_err(|e| Error::io(format!("appending journal: {e}")))
    }

    fn checkpoint(&self) -> Result<()> {
        let snapshot = Checkpoint {
            version: FORMAT_VERSION,
            entries: self
                .entries
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        };
        let json = serde_json::to_string(&snapshot)
            .map_err(|e| Error::other(format!("encoding checkpoint: {e}")))?;

        let mut tmp = NamedTempFile::new_in(&self.dir)
            .map_err(|e| Error::io(format!("creating checkpoint temp file: {e}")))?;
        tmp.write_all(json.as_bytes())
            .map_err(|e| Error::io(format!("writing checkpoint: {e}")))?;
        tmp.as_file()
            .sync_all()
            .map_err(|e| Error::io(format!("syncing checkpoint: {e}")))?;
        tmp.persist(self.dir.join(CHECKPOINT_FILE))
            .map_err(|e| Error::io(format!("installing checkpoint: {e}")))?;
        Ok(())
    }
}

/// Open the store at `dir`, run `body`, then checkpoint and close — on the
/// error path too. The body's error wins over a close failure.
pub fn with_store<K, V, T>(
    dir: impl Into<PathBuf>,
    body: impl FnOnce(&mut Store<K, V>) -> Result<T>,
) -> Result<T>
where
    K: Ord + Clone + Serialize + DeserializeOwned,
    V: Clone + Serialize + DeserializeOwned,
{
    let mut store = Store::open(dir)?;
    let result = body(&mut store);
    let closed = store.close();
    match (result, closed) {
        (Ok(value), Ok(())) => Ok(value),
        (Err(e), _) => Err(e),
        (Ok(_), Err(e)) => Err(e),
    }
}

fn load_checkpoint<K, V>(path: &Path) -> Result<BTreeMap<K, V>>
where
    K: Ord + DeserializeOwned,
    V: DeserializeOwned,
{
    let json = match fs::read_to_string(path) {
        Ok(json) => json,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(BTreeMap::new()),
        Err(e) => return Err(Error::io(format!("reading checkpoint: {e}"))),
    };
    let snapshot: Checkpoint<K, V> = match serde_json::from_str(&json) {
        Ok(snapshot) => snapshot,
        Err(e) => {
            return Err(Error::other(format!("corrupt checkpoint: {e}"))
                .in_function("Store::open"));
        }
    };
    if snapshot.version > FORMAT_VERSION {
        tracing::warn!(
            found = snapshot.version,
            supported = FORMAT_VERSION,
            "checkpoint from a newer format; starting empty"
        );
        return Ok(BTreeMap::new());
    }
    Ok(snapshot.entries.into_iter().collect())
}

fn replay_journal<K, V>(path: &Path, entries: &mut BTreeMap<K, V>) -> Result<()>
where
    K: Ord + DeserializeOwned,
    V: DeserializeOwned,
{
    let file = match fs::File::open(path) {
        Ok(file) => file,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(Error::io(format!("opening journal: {e}"))),
    };
    for line in BufReader::new(file).lines() {
        let line = line.map_err(|e| Error::io(format!("reading journal: {e}")))?;
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<JournalOp<K, V>>(&line) {
            Ok(JournalOp::Put { key, value }) => {
                entries.insert(key, value);
            }
            Ok(JournalOp::Delete { key }) => {
                entries.remove(&key);
            }
            Err(e) => {
                // A torn final line from a crash mid-append; everything
                // before it already applied.
                tracing::warn!(error = %e, "stopping journal replay at undecodable line");
                break;
            }
        }
    }
    Ok(())
}
