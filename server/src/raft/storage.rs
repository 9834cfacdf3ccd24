//! Raft log store, in memory or backed by a data directory.
//!
//! In the node's data directory the store keeps:
//!
//! ```text
//! <data-dir>/
//! ├── vote.json     # last vote cast
//! ├── meta.json     # committed and last purged log ids
//! ├── log.ndjson    # one entry per line, in index order
//! └── snapshot.json # latest snapshot, owned by the state machine
//! ```
//!
//! Appends go to the end of `log.ndjson` and are synced before raft is told
//! they are flushed. Truncate and purge rewrite the file through a temp file.

use std::collections::BTreeMap;
use std::fmt::Debug;
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufRead, BufReader, BufWriter, Write};
use std::ops::RangeBounds;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use openraft::storage::{LogFlushed, RaftLogStorage};
use openraft::{LogState, RaftLogReader, StorageIOError};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{info, warn};

use super::types::{RaftEntry, RaftLogId, RaftStorageError, RaftVote, TypeConfig};

const VOTE_FILE: &str = "vote.json";
const META_FILE: &str = "meta.json";
const LOG_FILE: &str = "log.ndjson";

#[derive(Debug, Default, Serialize, Deserialize)]
struct LogMeta {
    committed: Option<RaftLogId>,
    last_purged: Option<RaftLogId>,
}

#[derive(Default)]
struct LogInner {
    /// `None` keeps everything in memory.
    dir: Option<PathBuf>,
    vote: Option<RaftVote>,
    committed: Option<RaftLogId>,
    last_purged: Option<RaftLogId>,
    /// Log entries (index -> entry)
    log: BTreeMap<u64, RaftEntry>,
}

/// Raft log store. Clones share the same log, which is how the engine gets
/// its reader.
#[derive(Clone, Default)]
pub struct LogStore {
    inner: Arc<RwLock<LogInner>>,
}

impl LogStore {
    /// A store that forgets everything when the process exits.
    pub fn new() -> Self {
        Self::default()
    }

    /// Open (or create) a store in `dir` and load what an earlier run left.
    pub fn open(dir: impl Into<PathBuf>) -> io::Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;

        let mut inner = LogInner {
            vote: read_json(&dir.join(VOTE_FILE))?,
            ..LogInner::default()
        };
        if let Some(meta) = read_json::<LogMeta>(&dir.join(META_FILE))? {
            inner.committed = meta.committed;
            inner.last_purged = meta.last_purged;
        }
        let (log, torn) = load_log(&dir.join(LOG_FILE), inner.last_purged)?;
        inner.log = log;

        info!(
            dir = %dir.display(),
            entries = inner.log.len(),
            vote = ?inner.vote,
            committed = ?inner.committed,
            "opened raft log store"
        );
        inner.dir = Some(dir);
        if torn {
            inner.rewrite_log()?;
        }
        Ok(Self {
            inner: Arc::new(RwLock::new(inner)),
        })
    }
}

impl LogInner {
    fn save_vote(&self) -> io::Result<()> {
        match &self.dir {
            Some(dir) => write_json_atomic(&dir.join(VOTE_FILE), &self.vote),
            None => Ok(()),
        }
    }

    fn save_meta(&self) -> io::Result<()> {
        let Some(dir) = &self.dir else {
            return Ok(());
        };
        let meta = LogMeta {
            committed: self.committed,
            last_purged: self.last_purged,
        };
        write_json_atomic(&dir.join(META_FILE), &meta)
    }

    fn append_entries(&mut self, entries: Vec<RaftEntry>) -> io::Result<()> {
        if entries.is_empty() {
            return Ok(());
        }
        if let Some(dir) = &self.dir {
            let file = OpenOptions::new().create(true).append(true).open(dir.join(LOG_FILE))?;
            let mut writer = BufWriter::new(file);
            for entry in &entries {
                serde_json::to_writer(&mut writer, entry).map_err(invalid_data)?;
                writer.write_all(b"\n")?;
            }
            writer.flush()?;
            writer.get_ref().sync_all()?;
        }
        for entry in entries {
            self.log.insert(entry.log_id.index, entry);
        }
        Ok(())
    }

    /// Replace the log file with the entries currently held in memory.
    fn rewrite_log(&self) -> io::Result<()> {
        let Some(dir) = &self.dir else {
            return Ok(());
        };
        let path = dir.join(LOG_FILE);
        let temp = dir.join(format!("{LOG_FILE}.tmp"));

        let file = OpenOptions::new().create(true).write(true).truncate(true).open(&temp)?;
        let mut writer = BufWriter::new(file);
        for entry in self.log.values() {
            serde_json::to_writer(&mut writer, entry).map_err(invalid_data)?;
            writer.write_all(b"\n")?;
        }
        writer.flush()?;
        writer.get_ref().sync_all()?;
        fs::rename(&temp, &path)
    }
}

fn invalid_data(e: serde_json::Error) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, e)
}

pub(super) fn read_json<T: DeserializeOwned>(path: &Path) -> io::Result<Option<T>> {
    if !path.exists() {
        return Ok(None);
    }
    let file = File::open(path)?;
    serde_json::from_reader(BufReader::new(file))
        .map(Some)
        .map_err(invalid_data)
}

pub(super) fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> io::Result<()> {
    let mut temp = path.as_os_str().to_owned();
    temp.push(".tmp");
    let temp = PathBuf::from(temp);

    let file = OpenOptions::new().create(true).write(true).truncate(true).open(&temp)?;
    let mut writer = BufWriter::new(file);
    serde_json::to_writer(&mut writer, value).map_err(invalid_data)?;
    writer.flush()?;
    writer.get_ref().sync_all()?;
    fs::rename(&temp, path)
}

/// Read the log file. A torn final line from an interrupted append is
/// dropped and reported as `true`; damage anywhere else is an error.
fn load_log(path: &Path, last_purged: Option<RaftLogId>) -> io::Result<(BTreeMap<u64, RaftEntry>, bool)> {
    let mut log = BTreeMap::new();
    if !path.exists() {
        return Ok((log, false));
    }

    let lines = BufReader::new(File::open(path)?)
        .lines()
        .collect::<Result<Vec<_>, _>>()?;
    let last = lines.len().saturating_sub(1);
    for (n, line) in lines.iter().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let entry: RaftEntry = match serde_json::from_str(line) {
            Ok(entry) => entry,
            Err(e) if n == last => {
                warn!(path = %path.display(), error = %e, "dropping torn entry at end of raft log");
                return Ok((log, true));
            }
            Err(e) => return Err(invalid_data(e)),
        };
        // A purge can be interrupted between the meta write and the rewrite.
        if last_purged.is_some_and(|purged| entry.log_id.index <= purged.index) {
            continue;
        }
        log.insert(entry.log_id.index, entry);
    }
    Ok((log, false))
}

impl RaftLogReader<TypeConfig> for LogStore {
    async fn try_get_log_entries<RB: RangeBounds<u64> + Clone + Debug>(
        &mut self,
        range: RB,
    ) -> Result<Vec<RaftEntry>, RaftStorageError> {
        let inner = self.inner.read().await;
        Ok(inner.log.range(range).map(|(_, entry)| entry.clone()).collect())
    }
}

impl RaftLogStorage<TypeConfig> for LogStore {
    type LogReader = Self;

    async fn get_log_state(&mut self) -> Result<LogState<TypeConfig>, RaftStorageError> {
        let inner = self.inner.read().await;
        let last_log_id = inner
            .log
            .iter()
            .next_back()
            .map(|(_, entry)| entry.log_id)
            .or(inner.last_purged);

        Ok(LogState {
            last_purged_log_id: inner.last_purged,
            last_log_id,
        })
    }

    async fn save_committed(&mut self, committed: Option<RaftLogId>) -> Result<(), RaftStorageError> {
        let mut inner = self.inner.write().await;
        inner.committed = committed;
        inner.save_meta().map_err(|e| StorageIOError::write_logs(&e))?;
        Ok(())
    }

    async fn read_committed(&mut self) -> Result<Option<RaftLogId>, RaftStorageError> {
        Ok(self.inner.read().await.committed)
    }

    /// The vote reaches disk before this returns, so a restarted node never
    /// votes twice in one term.
    async fn save_vote(&mut self, vote: &RaftVote) -> Result<(), RaftStorageError> {
        let mut inner = self.inner.write().await;
        let previous = inner.vote.replace(*vote);
        if let Err(e) = inner.save_vote() {
            inner.vote = previous;
            return Err(StorageIOError::write_vote(&e).into());
        }
        Ok(())
    }

    async fn read_vote(&mut self) -> Result<Option<RaftVote>, RaftStorageError> {
        Ok(self.inner.read().await.vote)
    }

    async fn append<I>(
        &mut self,
        entries: I,
        callback: LogFlushed<TypeConfig>,
    ) -> Result<(), RaftStorageError>
    where
        I: IntoIterator<Item = RaftEntry>,
    {
        {
            let mut inner = self.inner.write().await;
            inner
                .append_entries(entries.into_iter().collect())
                .map_err(|e| StorageIOError::write_logs(&e))?;
        }
        callback.log_io_completed(Ok(()));
        Ok(())
    }

    /// Remove `log_id` and everything after it.
    async fn truncate(&mut self, log_id: RaftLogId) -> Result<(), RaftStorageError> {
        let mut inner = self.inner.write().await;
        inner.log.split_off(&log_id.index);
        inner.rewrite_log().map_err(|e| StorageIOError::write_logs(&e))?;
        Ok(())
    }

    /// Remove everything up to and including `log_id`.
    async fn purge(&mut self, log_id: RaftLogId) -> Result<(), RaftStorageError> {
        let mut inner = self.inner.write().await;
        inner.log = inner.log.split_off(&(log_id.index + 1));
        inner.last_purged = Some(log_id);
        inner.save_meta().map_err(|e| StorageIOError::write_logs(&e))?;
        inner.rewrite_log().map_err(|e| StorageIOError::write_logs(&e))?;
        Ok(())
    }

    async fn get_log_reader(&mut self) -> Self::LogReader {
        self.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use openraft::{CommittedLeaderId, EntryPayload, LogId, Vote};
    use tempfile::TempDir;

    fn log_id(term: u64, index: u64) -> RaftLogId {
        LogId::new(CommittedLeaderId::new(term, 0), index)
    }

    fn entries(term: u64, range: std::ops::RangeInclusive<u64>) -> Vec<RaftEntry> {
        range
            .map(|i| RaftEntry {
                log_id: log_id(term, i),
                payload: EntryPayload::Blank,
            })
            .collect()
    }

    /// Append without a raft flush callback.
    async fn seed(store: &LogStore, range: std::ops::RangeInclusive<u64>) {
        store.inner.write().await.append_entries(entries(1, range)).unwrap();
    }

    async fn indexes(store: &mut LogStore) -> Vec<u64> {
        let entries = store.try_get_log_entries(..).await.unwrap();
        entries.iter().map(|e| e.log_id.index).collect()
    }

    #[tokio::test]
    async fn test_read_range() {
        let mut store = LogStore::new();
        seed(&store, 1..=10).await;

        let entries = store.try_get_log_entries(3..6).await.unwrap();
        let indexes: Vec<u64> = entries.iter().map(|e| e.log_id.index).collect();
        assert_eq!(indexes, vec![3, 4, 5]);

        let state = store.get_log_state().await.unwrap();
        assert_eq!(state.last_log_id, Some(log_id(1, 10)));
        assert_eq!(state.last_purged_log_id, None);
    }

    #[tokio::test]
    async fn test_truncate_removes_suffix() {
        let mut store = LogStore::new();
        seed(&store, 1..=10).await;

        store.truncate(log_id(1, 6)).await.unwrap();
        let entries = store.try_get_log_entries(..).await.unwrap();
        assert_eq!(entries.len(), 5);
        assert_eq!(entries.last().unwrap().log_id.index, 5);
    }

    #[tokio::test]
    async fn test_purge_keeps_last_purged() {
        let mut store = LogStore::new();
        seed(&store, 1..=5).await;

        store.purge(log_id(1, 5)).await.unwrap();
        assert!(store.try_get_log_entries(..).await.unwrap().is_empty());

        let state = store.get_log_state().await.unwrap();
        assert_eq!(state.last_purged_log_id, Some(log_id(1, 5)));
        assert_eq!(state.last_log_id, Some(log_id(1, 5)));
    }

    #[tokio::test]
    async fn test_vote_and_committed() {
        let mut store = LogStore::new();
        assert_eq!(store.read_vote().await.unwrap(), None);

        let vote = Vote::new(3, 7);
        store.save_vote(&vote).await.unwrap();
        assert_eq!(store.read_vote().await.unwrap(), Some(vote));

        store.save_committed(Some(log_id(3, 12))).await.unwrap();
        assert_eq!(store.read_committed().await.unwrap(), Some(log_id(3, 12)));

        // Readers share the same log.
        let mut reader = store.get_log_reader().await;
        seed(&store, 1..=2).await;
        assert_eq!(reader.try_get_log_entries(..).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_vote_committed_and_log_survive_reopen() {
        let dir = TempDir::new().unwrap();
        {
            let mut store = LogStore::open(dir.path()).unwrap();
            store.save_vote(&Vote::new(4, 2)).await.unwrap();
            seed(&store, 1..=20).await;
            store.save_committed(Some(log_id(1, 18))).await.unwrap();
        }

        let mut store = LogStore::open(dir.path()).unwrap();
        assert_eq!(store.read_vote().await.unwrap(), Some(Vote::new(4, 2)));
        assert_eq!(store.read_committed().await.unwrap(), Some(log_id(1, 18)));
        assert_eq!(indexes(&mut store).await, (1..=20).collect::<Vec<_>>());
        let state = store.get_log_state().await.unwrap();
        assert_eq!(state.last_log_id, Some(log_id(1, 20)));
    }

    #[tokio::test]
    async fn test_truncate_and_purge_survive_reopen() {
        let dir = TempDir::new().unwrap();
        {
            let mut store = LogStore::open(dir.path()).unwrap();
            seed(&store, 1..=10).await;
            store.truncate(log_id(1, 8)).await.unwrap();
            store.purge(log_id(1, 3)).await.unwrap();
            // Entries appended after a rewrite land after the kept ones.
            store.inner.write().await.append_entries(entries(2, 8..=9)).unwrap();
        }

        let mut store = LogStore::open(dir.path()).unwrap();
        assert_eq!(indexes(&mut store).await, vec![4, 5, 6, 7, 8, 9]);
        let state = store.get_log_state().await.unwrap();
        assert_eq!(state.last_purged_log_id, Some(log_id(1, 3)));
        assert_eq!(state.last_log_id, Some(log_id(2, 9)));
    }

    #[tokio::test]
    async fn test_torn_last_line_is_dropped() {
        let dir = TempDir::new().unwrap();
        {
            let store = LogStore::open(dir.path()).unwrap();
            seed(&store, 1..=3).await;
        }
        let mut file = OpenOptions::new().append(true).open(dir.path().join(LOG_FILE)).unwrap();
        file.write_all(b"{\"log_id\":{\"leader_id\":").unwrap();

        let mut store = LogStore::open(dir.path()).unwrap();
        assert_eq!(indexes(&mut store).await, vec![1, 2, 3]);

        // The fragment is gone, so later appends start on a fresh line.
        seed(&store, 4..=4).await;
        drop(store);
        let mut store = LogStore::open(dir.path()).unwrap();
        assert_eq!(indexes(&mut store).await, vec![1, 2, 3, 4]);
    }

    #[test]
    fn test_open_fails_on_corrupt_vote() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join(VOTE_FILE), b"not json").unwrap();
        assert!(LogStore::open(dir.path()).is_err());
    }
}
