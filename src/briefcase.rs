//! Local briefcase cache and synchronization.
//!
//! # Cache layout
//!
//! Briefcases live below a versioned cache root; the layout revision is part
//! of the path so older processes refuse newer layouts:
//!
//! ```text
//! <cacheRoot>/v1_0/
//!     <iModelId>/csets/                          shared changeset blob pool
//!     <iModelId>/bc/FixedVersion/<csetId>/bc.bim one briefcase per pinned version
//!     <iModelId>/bc/PullOnly/0/bc.bim            one updatable read briefcase
//!     <iModelId>/bc/PullAndPush/<bcId>/bc.bim    one briefcase per acquired id
//! ```
//!
//! The literal `first` stands in for the empty changeset id of version zero.
//! Changeset blobs are deduplicated by file name (ids are content-unique), so
//! every briefcase of an iModel shares one pool and no cross-entry locking is
//! needed for it.
//!
//! # Cache keys
//!
//! Every entry is indexed under a deterministic key: `FixedVersion` entries
//! under `<iModelId>:<targetChangeSetId>` (one per pinned version), variable
//! version entries under `<iModelId>:<briefcaseId>`.
//!
//! # Concurrency
//!
//! The control plane runs on the async runtime; downloads and the invasive
//! changeset application run behind the hub/engine collaborators. Two regions
//! are deliberately synchronous and protected by the in-memory index lock:
//! the span from "lookup miss" to "placeholder entry inserted" (so a key
//! never gains two entries) and every index mutation. `PullAndPush`
//! acquisition additionally holds a manager-wide async mutex from the hub
//! listing to the index insert, so a process never acquires two hub
//! briefcases for the same request pattern.
//!
//! Every entry owns its native handle exclusively; one logical task at a
//! time uses it (guarded by the entry's async db mutex).

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::native::OpenMode;

/// Numeric briefcase identity.
///
/// Hub-assigned ids live in `[2, 2^24 - 11]`. Id 0 is the standalone id used
/// for briefcases that never push; the deprecated standalone id 1 is treated
/// as standalone for classification but is never produced for path layout.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct BriefcaseId(pub u32);

impl BriefcaseId {
    pub const ILLEGAL: BriefcaseId = BriefcaseId(0xffff_ffff);
    pub const STANDALONE: BriefcaseId = BriefcaseId(0);
    pub const DEPRECATED_STANDALONE: BriefcaseId = BriefcaseId(1);
    pub const FIRST_ASSIGNED: BriefcaseId = BriefcaseId(2);
    pub const LAST_ASSIGNED: BriefcaseId = BriefcaseId((1 << 24) - 11);

    pub fn is_standalone(self) -> bool {
        self == Self::STANDALONE || self == Self::DEPRECATED_STANDALONE
    }

    pub fn is_hub_assigned(self) -> bool {
        self >= Self::FIRST_ASSIGNED && self <= Self::LAST_ASSIGNED
    }

    pub fn is_valid(self) -> bool {
        self.is_standalone() || self.is_hub_assigned()
    }
}

impl std::fmt::Display for BriefcaseId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SyncMode {
    FixedVersion,
    PullOnly,
    PullAndPush,
}

impl SyncMode {
    /// Directory name below `<iModelId>/bc/`.
    pub fn dir_name(self) -> &'static str {
        match self {
            SyncMode::FixedVersion => "FixedVersion",
            SyncMode::PullOnly => "PullOnly",
            SyncMode::PullAndPush => "PullAndPush",
        }
    }

    pub fn from_dir_name(name: &str) -> Option<Self> {
        match name {
            "FixedVersion" => Some(SyncMode::FixedVersion),
            "PullOnly" => Some(SyncMode::PullOnly),
            "PullAndPush" => Some(SyncMode::PullAndPush),
            _ => None,
        }
    }

    /// Pinned versions are opened read-only, everything else read-write.
    pub fn open_mode(self) -> OpenMode {
        match self {
            SyncMode::FixedVersion => OpenMode::Readonly,
            SyncMode::PullOnly | SyncMode::PullAndPush => OpenMode::ReadWrite,
        }
    }
}

impl std::fmt::Display for SyncMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.dir_name())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DownloadStatus {
    NotStarted,
    DownloadingCheckpoint,
    DownloadingChangeSets,
    ApplyingChangeSets,
    Initializing,
    Complete,
    Error,
}

impl DownloadStatus {
    pub fn is_final(self) -> bool {
        matches!(self, DownloadStatus::Complete | DownloadStatus::Error)
    }
}

/// Deterministic index key of a briefcase entry.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BriefcaseKey(String);

impl BriefcaseKey {
    pub fn compute(
        imodel_id: &str,
        sync_mode: SyncMode,
        briefcase_id: BriefcaseId,
        target_changeset_id: &str,
    ) -> Self {
        match sync_mode {
            SyncMode::FixedVersion => BriefcaseKey(format!("{}:{}", imodel_id, target_changeset_id)),
            SyncMode::PullOnly | SyncMode::PullAndPush => {
                BriefcaseKey(format!("{}:{}", imodel_id, briefcase_id))
            }
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for BriefcaseKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Caller misuse and lifecycle errors surfaced verbatim to the caller.
#[derive(Debug, thiserror::Error)]
pub enum BriefcaseError {
    #[error("briefcase manager is not initialized")]
    NotInitialized,

    #[error("briefcase manager is already initialized - shut down first")]
    AlreadyInitialized,

    #[error("briefcase {0} is open - close it and retry")]
    BriefcaseInUse(BriefcaseKey),

    #[error("briefcase {0} not found")]
    NotFound(BriefcaseKey),

    #[error("briefcase {0} already registered")]
    DuplicateKey(BriefcaseKey),

    #[error("briefcase {0} has a download in progress")]
    DownloadInProgress(BriefcaseKey),

    #[error("operation requires a PullAndPush briefcase")]
    NotPullAndPush,

    #[error("briefcase is not open")]
    NotOpen,

    #[error("operation requires a writable briefcase")]
    ReadonlyBriefcase,

    #[error("briefcase has no local changes to push")]
    NoLocalChanges,
}

/// Per-request context, threaded through for diagnostics.
#[derive(Debug, Clone, Default)]
pub struct RequestContext {
    pub activity_id: String,
}

impl RequestContext {
    pub fn new<S: Into<String>>(activity_id: S) -> Self {
        Self {
            activity_id: activity_id.into(),
        }
    }
}

/// Manager tuning knobs.
#[derive(Debug, Clone)]
pub struct ManagerOptions {
    pub cache_root: PathBuf,
    pub max_push_attempts: u32,
    pub push_backoff_min: Duration,
    pub push_backoff_max: Duration,
    /// Changesets larger than this are applied on the invasive path.
    pub async_apply_threshold: u64,
}

impl ManagerOptions {
    pub fn new<P: Into<PathBuf>>(cache_root: P) -> Self {
        Self {
            cache_root: cache_root.into(),
            max_push_attempts: 5,
            push_backoff_min: Duration::from_millis(200),
            push_backoff_max: Duration::from_secs(5),
            async_apply_threshold: 1024 * 1024,
        }
    }

    pub fn max_push_attempts(mut self, value: u32) -> Self {
        self.max_push_attempts = value;
        self
    }

    pub fn push_backoff(mut self, min: Duration, max: Duration) -> Self {
        self.push_backoff_min = min;
        self.push_backoff_max = max;
        self
    }

    pub fn async_apply_threshold(mut self, value: u64) -> Self {
        self.async_apply_threshold = value;
        self
    }
}

mod cache_dir;
pub use cache_dir::*;

mod entry;
pub use entry::*;

mod index;
pub use index::*;

mod events;
pub use events::*;

mod changeset;
pub use changeset::*;

mod download;
pub use download::*;

mod push;
pub use push::*;

mod manager;
pub use manager::*;
