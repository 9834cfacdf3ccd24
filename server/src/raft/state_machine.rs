//! Replicated state machine: applies committed events to the game handler.

use std::fs;
use std::io::Cursor;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use openraft::storage::RaftStateMachine;
use openraft::{EntryPayload, RaftSnapshotBuilder, RaftTypeConfig, StorageIOError, StoredMembership};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};

use super::storage::{read_json, write_json_atomic};
use super::types::{
    ApplyResult, RaftEntry, RaftLogId, RaftSnapshot, RaftSnapshotMeta, RaftStorageError,
    RaftStoredMembership, TypeConfig,
};
use crate::handler::GameHandler;
use crate::protocol::{Command, Event};

/// Decode one log entry and run it through the handler.
///
/// Never panics: undecodable entries and unknown methods produce
/// [`ApplyResult::Failed`], an invalid payload produces a `_fail` reply and a
/// panicking handler is caught.
pub fn dispatch(handler: &mut dyn GameHandler, entry: &[u8]) -> ApplyResult {
    let event = match Event::from_bytes(entry) {
        Ok(event) => event,
        Err(e) => return ApplyResult::failed(format!("failed to unmarshal event: {e}")),
    };

    let command = match Command::parse(&event) {
        Ok(Command::Other { method, .. }) => {
            return ApplyResult::failed(format!("unknown method: {method}"));
        }
        Ok(command) => command,
        Err(e) => {
            return ApplyResult::Reply {
                event: event.reply_fail(e.to_string()),
            };
        }
    };

    let outcome = catch_unwind(AssertUnwindSafe(|| match &command {
        Command::Register(c) => handler.register(&event, c),
        Command::Login(c) => handler.login(&event, c),
        Command::GetCards(q) => handler.get_cards(&event, q),
        Command::BuyPack(u) => handler.buy_pack(&event, u),
        Command::OfferTrade(o) => handler.offer_trade(&event, o),
        Command::AcceptTrade(o) => handler.accept_trade(&event, o),
        Command::StartMatch(u) => handler.start_match(&event, u),
        Command::JoinMatch(a) => handler.join_match(&event, a),
        Command::SurrenderMatch(a) => handler.surrender_match(&event, a),
        Command::MakeMove(m) => handler.make_move(&event, m),
        Command::Other { .. } => event.reply_fail("unknown method"),
    }));

    match outcome {
        Ok(reply) => ApplyResult::Reply { event: reply },
        Err(_) => {
            error!(method = %event.method, "handler panicked while applying entry");
            ApplyResult::failed(format!("handler panicked on {}", event.method))
        }
    }
}

/// Serialized form of a snapshot.
#[derive(Debug, Serialize, Deserialize)]
struct SnapshotImage {
    last_applied: Option<RaftLogId>,
    last_membership: RaftStoredMembership,
    /// Hex encoded handler state.
    handler_state: String,
}

const SNAPSHOT_FILE: &str = "snapshot.json";

#[derive(Debug, Clone)]
struct StoredSnapshot {
    meta: RaftSnapshotMeta,
    data: Vec<u8>,
}

/// `snapshot.json` in the data directory.
#[derive(Debug, Serialize, Deserialize)]
struct SnapshotFile {
    meta: RaftSnapshotMeta,
    /// Hex encoded [`SnapshotImage`] bytes.
    data: String,
}

struct Applied {
    last_applied: Option<RaftLogId>,
    last_membership: RaftStoredMembership,
    handler: Box<dyn GameHandler>,
}

/// State machine shared between the raft core and the rest of the node.
pub struct StateMachineStore {
    state: RwLock<Applied>,
    current_snapshot: RwLock<Option<StoredSnapshot>>,
    snapshot_idx: AtomicU64,
    /// Where the latest snapshot is kept; `None` keeps it in memory only.
    dir: Option<PathBuf>,
}

impl StateMachineStore {
    pub fn new(handler: Box<dyn GameHandler>) -> Arc<Self> {
        Arc::new(Self::with_state(
            Applied {
                last_applied: None,
                last_membership: StoredMembership::default(),
                handler,
            },
            None,
            None,
        ))
    }

    /// State machine that keeps its latest snapshot in `dir`. A snapshot left
    /// there by an earlier run is restored before this returns, so raft only
    /// replays the log after it.
    pub fn open(handler: Box<dyn GameHandler>, dir: impl Into<PathBuf>) -> Result<Arc<Self>, RaftStorageError> {
        let dir = dir.into();
        let mut state = Applied {
            last_applied: None,
            last_membership: StoredMembership::default(),
            handler,
        };

        let file: Option<SnapshotFile> =
            read_json(&dir.join(SNAPSHOT_FILE)).map_err(|e| StorageIOError::read_snapshot(None, &e))?;
        let current = match file {
            Some(file) => {
                let data = const_hex::decode(&file.data)
                    .map_err(|e| StorageIOError::read_snapshot(Some(file.meta.signature()), &e))?;
                restore_into(&mut state, &data)?;
                state.last_applied = file.meta.last_log_id;
                state.last_membership = file.meta.last_membership.clone();
                info!(snapshot_id = %file.meta.snapshot_id, "restored snapshot from disk");
                Some(StoredSnapshot { meta: file.meta, data })
            }
            None => None,
        };

        Ok(Arc::new(Self::with_state(state, current, Some(dir))))
    }

    fn with_state(state: Applied, current: Option<StoredSnapshot>, dir: Option<PathBuf>) -> Self {
        Self {
            state: RwLock::new(state),
            current_snapshot: RwLock::new(current),
            snapshot_idx: AtomicU64::new(0),
            dir,
        }
    }

    fn persist(&self, snapshot: &StoredSnapshot) -> Result<(), RaftStorageError> {
        let Some(dir) = &self.dir else {
            return Ok(());
        };
        let file = SnapshotFile {
            meta: snapshot.meta.clone(),
            data: const_hex::encode(&snapshot.data),
        };
        fs::create_dir_all(dir)
            .and_then(|()| write_json_atomic(&dir.join(SNAPSHOT_FILE), &file))
            .map_err(|e| StorageIOError::write_snapshot(Some(snapshot.meta.signature()), &e).into())
    }

    pub async fn last_applied(&self) -> Option<RaftLogId> {
        self.state.read().await.last_applied
    }

    /// Serialize the current state machine contents.
    pub async fn snapshot(&self) -> Result<Vec<u8>, RaftStorageError> {
        let state = self.state.read().await;
        encode_image(&state)
    }

    /// Replace the state machine contents with a snapshot produced by
    /// [`snapshot`](Self::snapshot).
    pub async fn restore(&self, blob: &[u8]) -> Result<(), RaftStorageError> {
        let mut state = self.state.write().await;
        restore_into(&mut state, blob)
    }
}

fn restore_into(state: &mut Applied, blob: &[u8]) -> Result<(), RaftStorageError> {
    let image: SnapshotImage = serde_json::from_slice(blob).map_err(|e| StorageIOError::read_state_machine(&e))?;
    let handler_state =
        const_hex::decode(&image.handler_state).map_err(|e| StorageIOError::read_state_machine(&e))?;

    state
        .handler
        .restore(&handler_state)
        .map_err(|e| StorageIOError::read_state_machine(&e))?;
    state.last_applied = image.last_applied;
    state.last_membership = image.last_membership;
    Ok(())
}

fn encode_image(state: &Applied) -> Result<Vec<u8>, RaftStorageError> {
    let handler_state = state
        .handler
        .snapshot()
        .map_err(|e| StorageIOError::read_state_machine(&e))?;
    let image = SnapshotImage {
        last_applied: state.last_applied,
        last_membership: state.last_membership.clone(),
        handler_state: const_hex::encode(handler_state),
    };
    Ok(serde_json::to_vec(&image).map_err(|e| StorageIOError::read_state_machine(&e))?)
}

impl RaftSnapshotBuilder<TypeConfig> for Arc<StateMachineStore> {
    async fn build_snapshot(&mut self) -> Result<RaftSnapshot, RaftStorageError> {
        let state = self.state.read().await;
        let data = encode_image(&state)?;
        let last_applied = state.last_applied;
        let last_membership = state.last_membership.clone();

        // Lock snapshot before releasing state lock
        let mut current_snapshot = self.current_snapshot.write().await;
        drop(state);

        let idx = self.snapshot_idx.fetch_add(1, Ordering::Relaxed) + 1;
        let snapshot_id = match last_applied {
            Some(last) => format!("{}-{}-{}", last.leader_id, last.index, idx),
            None => format!("--{idx}"),
        };
        let meta = RaftSnapshotMeta {
            last_log_id: last_applied,
            last_membership,
            snapshot_id,
        };
        info!(snapshot_id = %meta.snapshot_id, size = data.len(), "built snapshot");

        let stored = StoredSnapshot {
            meta: meta.clone(),
            data: data.clone(),
        };
        self.persist(&stored)?;
        *current_snapshot = Some(stored);

        Ok(RaftSnapshot {
            meta,
            snapshot: Box::new(Cursor::new(data)),
        })
    }
}

impl RaftStateMachine<TypeConfig> for Arc<StateMachineStore> {
    type SnapshotBuilder = Self;

    async fn applied_state(
        &mut self,
    ) -> Result<(Option<RaftLogId>, RaftStoredMembership), RaftStorageError> {
        let state = self.state.read().await;
        Ok((state.last_applied, state.last_membership.clone()))
    }

    async fn apply<I>(&mut self, entries: I) -> Result<Vec<ApplyResult>, RaftStorageError>
    where
        I: IntoIterator<Item = RaftEntry> + Send,
    {
        let mut responses = Vec::new();
        let mut state = self.state.write().await;

        for entry in entries {
            if state.last_applied.is_some_and(|last| entry.log_id.index <= last.index) {
                warn!(log_id = %entry.log_id, "skipping already applied entry");
                responses.push(ApplyResult::Ack);
                continue;
            }
            debug!(log_id = %entry.log_id, "applying to state machine");
            state.last_applied = Some(entry.log_id);

            match entry.payload {
                EntryPayload::Blank => responses.push(ApplyResult::Ack),
                EntryPayload::Normal(command) => {
                    responses.push(dispatch(state.handler.as_mut(), command.as_bytes()));
                }
                EntryPayload::Membership(membership) => {
                    state.last_membership = StoredMembership::new(Some(entry.log_id), membership);
                    responses.push(ApplyResult::Ack);
                }
            }
        }

        Ok(responses)
    }

    async fn get_snapshot_builder(&mut self) -> Self::SnapshotBuilder {
        Arc::clone(self)
    }

    async fn begin_receiving_snapshot(
        &mut self,
    ) -> Result<Box<<TypeConfig as RaftTypeConfig>::SnapshotData>, RaftStorageError> {
        Ok(Box::new(Cursor::new(Vec::new())))
    }

    async fn install_snapshot(
        &mut self,
        meta: &RaftSnapshotMeta,
        snapshot: Box<<TypeConfig as RaftTypeConfig>::SnapshotData>,
    ) -> Result<(), RaftStorageError> {
        info!(
            snapshot_id = %meta.snapshot_id,
            snapshot_size = snapshot.get_ref().len(),
            "installing snapshot"
        );
        let data = snapshot.into_inner();

        if let Err(e) = self.restore(&data).await {
            error!(snapshot_id = %meta.snapshot_id, error = %e, "snapshot restore failed");
            return Err(StorageIOError::read_snapshot(Some(meta.signature()), &e).into());
        }

        let mut state = self.state.write().await;
        state.last_applied = meta.last_log_id;
        state.last_membership = meta.last_membership.clone();

        // Lock snapshot before releasing state lock
        let mut current_snapshot = self.current_snapshot.write().await;
        drop(state);

        let stored = StoredSnapshot {
            meta: meta.clone(),
            data,
        };
        self.persist(&stored)?;
        *current_snapshot = Some(stored);
        Ok(())
    }

    async fn get_current_snapshot(&mut self) -> Result<Option<RaftSnapshot>, RaftStorageError> {
        match &*self.current_snapshot.read().await {
            Some(snapshot) => Ok(Some(RaftSnapshot {
                meta: snapshot.meta.clone(),
                snapshot: Box::new(Cursor::new(snapshot.data.clone())),
            })),
            None => Ok(None),
        }
    }
}
