use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::{Error, Result};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use crate::hub::{CancelToken, Code};
use crate::native::{NativeDb, NativeEngine, OpenMode};

use super::{BriefcaseId, BriefcaseKey, DownloadStatus, SyncMode};

/// Code reconciliation conflict retained on the entry until observed.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct CodeConflict {
    pub message: String,
    pub denied_codes: Vec<Code>,
}

/// Public projection of a briefcase entry, also attached to surfaced errors
/// for diagnostics.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct BriefcaseProps {
    pub key: BriefcaseKey,
    pub imodel_id: String,
    pub context_id: String,
    pub briefcase_id: BriefcaseId,
    pub sync_mode: SyncMode,
    pub open_mode: OpenMode,
    pub pathname: PathBuf,
    pub parent_changeset_id: String,
    pub parent_changeset_index: i64,
    pub reversed_changeset_id: Option<String>,
    pub reversed_changeset_index: Option<i64>,
    pub target_changeset_id: String,
    pub target_changeset_index: i64,
    pub current_changeset_id: String,
    pub download_status: DownloadStatus,
    pub is_open: bool,
    pub file_id: Option<String>,
    pub conflict: Option<CodeConflict>,
}

struct EntryState {
    parent_changeset_id: String,
    parent_changeset_index: i64,
    reversed_changeset_id: Option<String>,
    reversed_changeset_index: Option<i64>,
    target_changeset_id: String,
    target_changeset_index: i64,
    file_id: Option<String>,
    conflict: Option<CodeConflict>,
    error: Option<Arc<Error>>,
}

/// Construction parameters for [`BriefcaseEntry`].
pub struct EntryInit {
    pub imodel_id: String,
    pub context_id: String,
    pub briefcase_id: BriefcaseId,
    pub sync_mode: SyncMode,
    pub pathname: PathBuf,
    pub parent_changeset_id: String,
    pub parent_changeset_index: i64,
    pub reversed_changeset_id: Option<String>,
    pub reversed_changeset_index: Option<i64>,
    pub target_changeset_id: String,
    pub target_changeset_index: i64,
}

/// One briefcase known to the manager.
///
/// Identity is immutable; version pointers and status live behind a sync
/// mutex (never held across await); the native handle lives behind an async
/// mutex so exactly one task can operate the file at a time.
pub struct BriefcaseEntry {
    pub imodel_id: String,
    pub context_id: String,
    pub briefcase_id: BriefcaseId,
    pub sync_mode: SyncMode,
    pub pathname: PathBuf,
    pub open_mode: OpenMode,

    state: Mutex<EntryState>,
    pub(crate) db: tokio::sync::Mutex<Option<Box<dyn NativeDb>>>,
    open_flag: AtomicBool,

    status_tx: watch::Sender<DownloadStatus>,
    status_rx: watch::Receiver<DownloadStatus>,

    pub(crate) cancel: CancelToken,
}

impl std::fmt::Debug for BriefcaseEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BriefcaseEntry")
            .field("key", &self.key())
            .field("pathname", &self.pathname)
            .field("status", &self.status())
            .finish()
    }
}

impl BriefcaseEntry {
    pub fn new(init: EntryInit) -> Arc<Self> {
        let (status_tx, status_rx) = watch::channel(DownloadStatus::NotStarted);
        Arc::new(Self {
            imodel_id: init.imodel_id,
            context_id: init.context_id,
            briefcase_id: init.briefcase_id,
            open_mode: init.sync_mode.open_mode(),
            sync_mode: init.sync_mode,
            pathname: init.pathname,
            state: Mutex::new(EntryState {
                parent_changeset_id: init.parent_changeset_id,
                parent_changeset_index: init.parent_changeset_index,
                reversed_changeset_id: init.reversed_changeset_id,
                reversed_changeset_index: init.reversed_changeset_index,
                target_changeset_id: init.target_changeset_id,
                target_changeset_index: init.target_changeset_index,
                file_id: None,
                conflict: None,
                error: None,
            }),
            db: tokio::sync::Mutex::new(None),
            open_flag: AtomicBool::new(false),
            status_tx,
            status_rx,
            cancel: CancelToken::new(),
        })
    }

    /// Recompute the index key from the current fields.
    pub fn key(&self) -> BriefcaseKey {
        let state = self.state.lock().unwrap();
        BriefcaseKey::compute(
            &self.imodel_id,
            self.sync_mode,
            self.briefcase_id,
            &state.target_changeset_id,
        )
    }

    pub fn parent_changeset(&self) -> (String, i64) {
        let state = self.state.lock().unwrap();
        (
            state.parent_changeset_id.clone(),
            state.parent_changeset_index,
        )
    }

    pub fn parent_changeset_index(&self) -> i64 {
        self.state.lock().unwrap().parent_changeset_index
    }

    pub fn set_parent_changeset(&self, id: String, index: i64) {
        let mut state = self.state.lock().unwrap();
        state.parent_changeset_id = id;
        state.parent_changeset_index = index;
    }

    pub fn reversed_changeset(&self) -> Option<(String, i64)> {
        let state = self.state.lock().unwrap();
        match (&state.reversed_changeset_id, state.reversed_changeset_index) {
            (Some(id), Some(index)) => Some((id.clone(), index)),
            _ => None,
        }
    }

    pub fn set_reversed_changeset(&self, reversed: Option<(String, i64)>) {
        let mut state = self.state.lock().unwrap();
        match reversed {
            Some((id, index)) => {
                state.reversed_changeset_id = Some(id);
                state.reversed_changeset_index = Some(index);
            }
            None => {
                state.reversed_changeset_id = None;
                state.reversed_changeset_index = None;
            }
        }
    }

    pub fn target_changeset(&self) -> (String, i64) {
        let state = self.state.lock().unwrap();
        (
            state.target_changeset_id.clone(),
            state.target_changeset_index,
        )
    }

    pub fn set_target_changeset(&self, id: String, index: i64) {
        let mut state = self.state.lock().unwrap();
        state.target_changeset_id = id;
        state.target_changeset_index = index;
    }

    /// `reversed ?? parent`.
    pub fn current_changeset_id(&self) -> String {
        let state = self.state.lock().unwrap();
        state
            .reversed_changeset_id
            .clone()
            .unwrap_or_else(|| state.parent_changeset_id.clone())
    }

    pub fn current_changeset_index(&self) -> i64 {
        let state = self.state.lock().unwrap();
        state
            .reversed_changeset_index
            .unwrap_or(state.parent_changeset_index)
    }

    pub fn file_id(&self) -> Option<String> {
        self.state.lock().unwrap().file_id.clone()
    }

    pub fn set_file_id(&self, file_id: Option<String>) {
        self.state.lock().unwrap().file_id = file_id;
    }

    /// Record a code reconciliation conflict (sticky until observed).
    pub fn set_conflict(&self, conflict: CodeConflict) {
        self.state.lock().unwrap().conflict = Some(conflict);
    }

    /// Observe and clear the sticky conflict.
    pub fn take_conflict(&self) -> Option<CodeConflict> {
        self.state.lock().unwrap().conflict.take()
    }

    pub fn status(&self) -> DownloadStatus {
        *self.status_rx.borrow()
    }

    pub fn set_status(&self, status: DownloadStatus) {
        let _ = self.status_tx.send(status);
    }

    /// Park the entry in the error state, retaining `err` for later callers.
    pub fn set_error(&self, err: Error) -> Arc<Error> {
        let shared = Arc::new(err);
        self.state.lock().unwrap().error = Some(shared.clone());
        self.set_status(DownloadStatus::Error);
        shared
    }

    pub fn last_error(&self) -> Option<Arc<Error>> {
        self.state.lock().unwrap().error.clone()
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// Await the download settling. Every caller of the same entry observes
    /// the same underlying completion.
    pub async fn wait_until_settled(&self) -> Result<()> {
        let mut status_rx = self.status_rx.clone();
        loop {
            match *status_rx.borrow() {
                DownloadStatus::Complete => return Ok(()),
                DownloadStatus::Error => {
                    let retained = self
                        .last_error()
                        .unwrap_or_else(|| Arc::new(anyhow::format_err!("download failed")));
                    return Err(Error::new(SharedError::new(retained)));
                }
                _ => {}
            }
            if status_rx.changed().await.is_err() {
                anyhow::bail!("briefcase {} dropped while downloading", self.key());
            }
        }
    }

    pub fn is_open(&self) -> bool {
        self.open_flag.load(Ordering::SeqCst)
    }

    /// Open the native handle if it is not already open.
    pub(crate) async fn open_db(&self, engine: &dyn NativeEngine, mode: OpenMode) -> Result<()> {
        let mut slot = self.db.lock().await;
        if slot.is_none() {
            *slot = Some(engine.open(&self.pathname, mode)?);
            self.open_flag.store(true, Ordering::SeqCst);
        }
        Ok(())
    }

    /// Close the native handle. Idempotent.
    pub(crate) async fn close_db(&self) -> Result<()> {
        let mut slot = self.db.lock().await;
        self.open_flag.store(false, Ordering::SeqCst);
        match slot.take() {
            Some(db) => db.close(),
            None => Ok(()),
        }
    }

    pub(crate) fn mark_open(&self, open: bool) {
        self.open_flag.store(open, Ordering::SeqCst);
    }

    pub fn props(&self) -> BriefcaseProps {
        let key = self.key();
        let state = self.state.lock().unwrap();
        BriefcaseProps {
            key,
            imodel_id: self.imodel_id.clone(),
            context_id: self.context_id.clone(),
            briefcase_id: self.briefcase_id,
            sync_mode: self.sync_mode,
            open_mode: self.open_mode,
            pathname: self.pathname.clone(),
            parent_changeset_id: state.parent_changeset_id.clone(),
            parent_changeset_index: state.parent_changeset_index,
            reversed_changeset_id: state.reversed_changeset_id.clone(),
            reversed_changeset_index: state.reversed_changeset_index,
            target_changeset_id: state.target_changeset_id.clone(),
            target_changeset_index: state.target_changeset_index,
            current_changeset_id: state
                .reversed_changeset_id
                .clone()
                .unwrap_or_else(|| state.parent_changeset_id.clone()),
            download_status: *self.status_rx.borrow(),
            is_open: self.open_flag.load(Ordering::SeqCst),
            file_id: state.file_id.clone(),
            conflict: state.conflict.clone(),
        }
    }
}

/// Clonable wrapper handing one retained failure to multiple awaiters.
#[derive(Debug, Clone)]
pub struct SharedError {
    inner: Arc<Error>,
}

impl SharedError {
    pub fn new(inner: Arc<Error>) -> Self {
        Self { inner }
    }
}

impl std::fmt::Display for SharedError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.inner)
    }
}

impl std::error::Error for SharedError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&**self.inner)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn test_entry(sync_mode: SyncMode, briefcase_id: BriefcaseId) -> Arc<BriefcaseEntry> {
        BriefcaseEntry::new(EntryInit {
            imodel_id: "imodel-a".to_string(),
            context_id: "ctx".to_string(),
            briefcase_id,
            sync_mode,
            pathname: PathBuf::from("/tmp/bc.bim"),
            parent_changeset_id: "c2".to_string(),
            parent_changeset_index: 2,
            reversed_changeset_id: None,
            reversed_changeset_index: None,
            target_changeset_id: "c3".to_string(),
            target_changeset_index: 3,
        })
    }

    #[test]
    fn current_changeset_prefers_reversed() {
        let entry = test_entry(SyncMode::PullAndPush, BriefcaseId(4));
        assert_eq!(entry.current_changeset_id(), "c2");
        entry.set_reversed_changeset(Some(("c1".to_string(), 1)));
        assert_eq!(entry.current_changeset_id(), "c1");
        assert_eq!(entry.current_changeset_index(), 1);
        entry.set_reversed_changeset(None);
        assert_eq!(entry.current_changeset_id(), "c2");
    }

    #[test]
    fn key_follows_target_for_fixed_version() {
        let entry = test_entry(SyncMode::FixedVersion, BriefcaseId::STANDALONE);
        assert_eq!(entry.key().as_str(), "imodel-a:c3");
        entry.set_target_changeset("c9".to_string(), 9);
        assert_eq!(entry.key().as_str(), "imodel-a:c9");
    }

    #[test]
    fn conflict_is_sticky_until_observed() {
        let entry = test_entry(SyncMode::PullAndPush, BriefcaseId(4));
        entry.set_conflict(CodeConflict {
            message: "denied".to_string(),
            denied_codes: Vec::new(),
        });
        assert!(entry.props().conflict.is_some());
        assert!(entry.take_conflict().is_some());
        assert!(entry.take_conflict().is_none());
    }
}
