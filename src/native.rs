//! Native storage engine interface.
//!
//! The engine that understands the briefcase file format (opening it,
//! reporting its metadata, applying and producing changeset blobs) lives
//! outside this crate. The briefcase manager drives it exclusively through
//! [`NativeEngine`] and [`NativeDb`].

use std::path::{Path, PathBuf};

use anyhow::Error;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::briefcase::BriefcaseId;
use crate::hub::{ChangesType, Code};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OpenMode {
    Readonly,
    ReadWrite,
}

/// How a changeset blob is to be applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOption {
    /// Apply forward on top of the current parent.
    Merge,
    /// Undo a merged changeset, entering (or deepening) the reversed state.
    Reverse,
    /// Redo a previously reversed changeset.
    Reinstate,
}

/// A changeset blob staged on local disk, ready for the native engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ChangesetFileToken {
    pub id: String,
    pub parent_id: String,
    pub path: PathBuf,
    pub changes_type: ChangesType,
    pub size: u64,
}

impl ChangesetFileToken {
    pub fn contains_schema_changes(&self) -> bool {
        self.changes_type == ChangesType::Schema
    }
}

/// Status codes reported by the native changeset machinery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeSetStatus {
    ApplyError,
    CorruptedChangeStream,
    InvalidId,
    InvalidVersion,
    ParentMismatch,
    NothingToPush,
    WrongDbGuid,
    Other,
}

impl ChangeSetStatus {
    /// The corruption family: the staged blob itself is unusable and the
    /// shared changeset pool should be purged before retrying.
    pub fn is_corruption(self) -> bool {
        matches!(
            self,
            ChangeSetStatus::CorruptedChangeStream
                | ChangeSetStatus::InvalidId
                | ChangeSetStatus::InvalidVersion
        )
    }
}

#[derive(Debug, thiserror::Error)]
#[error("changeset error ({status:?}): {message}")]
pub struct NativeError {
    pub status: ChangeSetStatus,
    pub message: String,
}

impl NativeError {
    pub fn new<S: Into<String>>(status: ChangeSetStatus, message: S) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    pub fn status_of(err: &Error) -> Option<ChangeSetStatus> {
        err.chain()
            .find_map(|cause| cause.downcast_ref::<NativeError>())
            .map(|native_err| native_err.status)
    }
}

/// An open briefcase file.
///
/// A handle is exclusively owned by its briefcase entry; the manager
/// serializes all calls through the entry lifecycle.
pub trait NativeDb: Send + Sync {
    fn parent_changeset_id(&self) -> String;
    fn reversed_changeset_id(&self) -> Option<String>;
    fn briefcase_id(&self) -> BriefcaseId;
    fn db_guid(&self) -> String;
    fn project_guid(&self) -> Option<String>;

    /// True while locally committed transactions have not been pushed.
    fn has_pending_txns(&self) -> bool;

    fn reset_briefcase_id(&mut self, briefcase_id: BriefcaseId) -> Result<(), Error>;

    /// Synchronous in-place application of a single staged changeset.
    fn apply_changeset(
        &mut self,
        changeset: &ChangesetFileToken,
        option: ApplyOption,
    ) -> Result<(), Error>;

    /// Collect the local transactions into a changeset staging file.
    fn start_create_changeset(&mut self) -> Result<ChangesetFileToken, Error>;

    /// Commit the staged changeset as the new parent at `changeset_index`.
    fn finish_create_changeset(&mut self, changeset_index: i64) -> Result<(), Error>;

    /// Discard the staging file created by `start_create_changeset`.
    fn abandon_create_changeset(&mut self);

    /// Pending-changeset ledger: ids uploaded but not yet fully reconciled.
    fn add_pending_changeset(&mut self, changeset_id: &str) -> Result<(), Error>;
    fn remove_pending_changeset(&mut self, changeset_id: &str) -> Result<(), Error>;
    fn pending_changesets(&self) -> Vec<String>;

    /// Codes touched by the local transactions.
    fn extract_codes(&self) -> Result<Vec<Code>, Error>;

    /// Codes touched by an already-staged changeset blob.
    fn extract_codes_from_file(&self, changeset: &ChangesetFileToken) -> Result<Vec<Code>, Error>;

    fn close(self: Box<Self>) -> Result<(), Error>;
}

/// Factory and offline operations of the native engine.
#[async_trait]
pub trait NativeEngine: Send + Sync {
    /// Open a briefcase file. Synchronous - callers rely on open not being a
    /// suspension point (see the index critical region).
    fn open(&self, path: &Path, mode: OpenMode) -> Result<Box<dyn NativeDb>, Error>;

    /// Apply staged changesets to a *closed* briefcase file off-thread.
    ///
    /// This is the invasive path used for schema changes and oversized
    /// changesets; the caller closes the handle first and reopens after.
    async fn apply_changesets(
        &self,
        path: &Path,
        changesets: &[ChangesetFileToken],
        option: ApplyOption,
    ) -> Result<(), Error>;
}
