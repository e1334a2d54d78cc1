use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::briefcase::BriefcaseId;

/// Changeset payload classification. Schema changesets force the invasive
/// (close/apply/reopen) application path and are promoted on push.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ChangesType {
    Regular,
    Schema,
}

impl Default for ChangesType {
    fn default() -> Self {
        ChangesType::Regular
    }
}

/// One changeset as known to the hub.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ChangesetRecord {
    /// Hub-assigned changeset id.
    pub id: String,
    /// Monotone position in the iModel's changeset chain (1-based, 0 is
    /// reserved for "version zero").
    pub index: i64,
    /// Id of the preceding changeset, empty for the first one.
    pub parent_id: String,
    /// Blob file name inside the shared changeset pool.
    pub file_name: String,
    pub file_size: u64,
    pub changes_type: ChangesType,
    pub description: String,
    /// Briefcase that pushed this changeset.
    pub briefcase_id: BriefcaseId,
}

impl ChangesetRecord {
    pub fn contains_schema_changes(&self) -> bool {
        self.changes_type == ChangesType::Schema
    }
}

/// Record describing a changeset about to be uploaded.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct NewChangeset {
    pub id: String,
    pub parent_id: String,
    pub briefcase_id: BriefcaseId,
    pub seed_file_id: Option<String>,
    pub file_size: u64,
    pub changes_type: ChangesType,
    pub description: String,
}

/// A sealed full-database snapshot served by the hub.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct Checkpoint {
    /// Last changeset merged into the snapshot, empty for version zero.
    pub merged_changeset_id: String,
    pub merged_changeset_index: i64,
    pub file_id: String,
    pub file_size: u64,
    pub download_url: String,
}

/// Hub-side briefcase registration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct HubBriefcaseRecord {
    pub briefcase_id: BriefcaseId,
    /// Seed file handle used when uploading changesets made from this
    /// briefcase.
    pub file_id: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CodeState {
    Available,
    Reserved,
    Used,
    Retired,
}

/// A reserved name within some scope of the iModel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct Code {
    pub spec_id: String,
    pub scope: String,
    pub value: String,
    pub state: CodeState,
}

/// A version of the iModel a briefcase can be brought to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Version {
    /// Version zero, before any changeset.
    First,
    /// Most recent changeset known to the hub.
    Latest,
    /// A named version registered on the hub.
    Named(String),
    /// The state as of a specific changeset id.
    AsOfChangeset(String),
}

/// Byte progress of a checkpoint download.
#[derive(Debug, Clone, Copy, Default)]
pub struct DownloadProgress {
    pub loaded: u64,
    pub total: Option<u64>,
}

impl DownloadProgress {
    pub fn percentage(&self) -> Option<f64> {
        match self.total {
            Some(total) if total > 0 => Some(self.loaded as f64 / total as f64),
            _ => None,
        }
    }
}

impl std::fmt::Display for DownloadProgress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.percentage() {
            Some(percentage) => write!(
                f,
                "{:.2}% ({}/{} bytes)",
                percentage * 100.0,
                self.loaded,
                self.total.unwrap_or(0),
            ),
            None => write!(f, "{} bytes", self.loaded),
        }
    }
}

/// Progress callback invoked by [`super::HubClient::download_checkpoint`].
pub type ProgressCallback = dyn Fn(DownloadProgress) + Send + Sync;

/// Cooperative cancellation flag handed out by `request_download`.
///
/// Cancellation is only honored during the checkpoint download; changeset
/// application is atomic from the caller's viewpoint.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    cancelled: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn progress_display() {
        let progress = DownloadProgress {
            loaded: 512,
            total: Some(2048),
        };
        assert_eq!(progress.to_string(), "25.00% (512/2048 bytes)");

        let unknown = DownloadProgress {
            loaded: 512,
            total: None,
        };
        assert_eq!(unknown.to_string(), "512 bytes");
    }

    #[test]
    fn cancel_token_is_shared() {
        let token = CancelToken::new();
        let clone = token.clone();
        assert!(!clone.is_cancelled());
        token.cancel();
        assert!(clone.is_cancelled());
    }
}
