use std::path::Path;

use anyhow::Error;
use async_trait::async_trait;

use crate::briefcase::BriefcaseId;

use super::{
    CancelToken, ChangesetRecord, Checkpoint, Code, HubBriefcaseRecord, NewChangeset, Version,
};

/// Error reported by a hub operation.
///
/// Hub implementations wrap transport failures into one of these kinds; the
/// briefcase manager recovers the kind via `downcast_ref` on the propagated
/// [`anyhow::Error`] to drive its retry and recovery policies.
#[derive(Debug, thiserror::Error)]
#[error("hub error ({kind}): {message}")]
pub struct HubError {
    pub kind: HubErrorKind,
    pub message: String,
    /// Set for `ConflictingCodes` - the codes the hub refused.
    pub denied_codes: Vec<Code>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HubErrorKind {
    NotFound,
    VersionNotFound,
    AnotherUserPushing,
    PullIsRequired,
    DatabaseTemporarilyLocked,
    OperationFailed,
    ChangeSetAlreadyExists,
    ConflictingCodes,
    UserCancelled,
    Other,
}

impl HubErrorKind {
    /// Kinds worth retrying a push for.
    pub fn is_transient(self) -> bool {
        matches!(
            self,
            HubErrorKind::AnotherUserPushing
                | HubErrorKind::PullIsRequired
                | HubErrorKind::DatabaseTemporarilyLocked
                | HubErrorKind::OperationFailed
        )
    }
}

impl std::fmt::Display for HubErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let text = match self {
            HubErrorKind::NotFound => "NotFound",
            HubErrorKind::VersionNotFound => "VersionNotFound",
            HubErrorKind::AnotherUserPushing => "AnotherUserPushing",
            HubErrorKind::PullIsRequired => "PullIsRequired",
            HubErrorKind::DatabaseTemporarilyLocked => "DatabaseTemporarilyLocked",
            HubErrorKind::OperationFailed => "OperationFailed",
            HubErrorKind::ChangeSetAlreadyExists => "ChangeSetAlreadyExists",
            HubErrorKind::ConflictingCodes => "ConflictingCodes",
            HubErrorKind::UserCancelled => "UserCancelled",
            HubErrorKind::Other => "Other",
        };
        write!(f, "{}", text)
    }
}

impl HubError {
    pub fn new<S: Into<String>>(kind: HubErrorKind, message: S) -> Self {
        Self {
            kind,
            message: message.into(),
            denied_codes: Vec::new(),
        }
    }

    pub fn conflicting_codes<S: Into<String>>(message: S, denied_codes: Vec<Code>) -> Self {
        Self {
            kind: HubErrorKind::ConflictingCodes,
            message: message.into(),
            denied_codes,
        }
    }

    /// The hub error kind buried anywhere in `err`'s cause chain, if any.
    pub fn kind_of(err: &Error) -> Option<HubErrorKind> {
        err.chain()
            .find_map(|cause| cause.downcast_ref::<HubError>())
            .map(|hub_err| hub_err.kind)
    }

    /// The denied codes attached to a `ConflictingCodes` error.
    pub fn denied_codes_of(err: &Error) -> Option<&[Code]> {
        err.chain()
            .find_map(|cause| cause.downcast_ref::<HubError>())
            .filter(|hub_err| hub_err.kind == HubErrorKind::ConflictingCodes)
            .map(|hub_err| hub_err.denied_codes.as_slice())
    }
}

/// Capability set the briefcase manager requires from a hub.
///
/// One configured implementation per process; all methods are object-safe so
/// the manager can hold the client as `Arc<dyn HubClient>`.
#[async_trait]
pub trait HubClient: Send + Sync {
    /// Look up a single changeset by id.
    async fn changeset_by_id(
        &self,
        imodel_id: &str,
        changeset_id: &str,
    ) -> Result<ChangesetRecord, Error>;

    /// The newest changeset of the iModel, `None` when the chain is empty.
    async fn latest_changeset(&self, imodel_id: &str) -> Result<Option<ChangesetRecord>, Error>;

    /// Resolve a named version to its changeset.
    async fn changeset_for_version_name(
        &self,
        imodel_id: &str,
        version_name: &str,
    ) -> Result<ChangesetRecord, Error>;

    /// List changesets with `after_index < index <= through_index`, ascending.
    async fn changesets_in_range(
        &self,
        imodel_id: &str,
        after_index: i64,
        through_index: i64,
    ) -> Result<Vec<ChangesetRecord>, Error>;

    /// Fetch changeset blobs into `dir/<file_name>`.
    async fn download_changesets(
        &self,
        imodel_id: &str,
        records: &[ChangesetRecord],
        dir: &Path,
    ) -> Result<(), Error>;

    /// Upload a new changeset; returns the authoritative record with the
    /// hub-assigned index.
    async fn upload_changeset(
        &self,
        imodel_id: &str,
        record: &NewChangeset,
        file: &Path,
    ) -> Result<ChangesetRecord, Error>;

    /// The nearest checkpoint at or before `changeset_index`.
    async fn preceding_checkpoint(
        &self,
        imodel_id: &str,
        changeset_index: i64,
    ) -> Result<Option<Checkpoint>, Error>;

    async fn download_checkpoint(
        &self,
        imodel_id: &str,
        checkpoint: &Checkpoint,
        path: &Path,
        progress: &super::ProgressCallback,
        cancel: &CancelToken,
    ) -> Result<(), Error>;

    /// Briefcases already acquired by the current user.
    async fn my_briefcases(&self, imodel_id: &str) -> Result<Vec<HubBriefcaseRecord>, Error>;

    async fn acquire_briefcase(&self, imodel_id: &str) -> Result<HubBriefcaseRecord, Error>;

    async fn release_briefcase(
        &self,
        imodel_id: &str,
        briefcase_id: BriefcaseId,
    ) -> Result<(), Error>;

    /// Seed file handle for an acquired briefcase, if the hub knows one.
    async fn briefcase_file_id(
        &self,
        imodel_id: &str,
        briefcase_id: BriefcaseId,
    ) -> Result<Option<String>, Error>;

    /// Reconcile code reservations. With `continue_on_conflict` the hub
    /// processes the full set and reports refusals via a
    /// [`HubErrorKind::ConflictingCodes`] error carrying the denied codes.
    async fn update_codes(
        &self,
        imodel_id: &str,
        briefcase_id: BriefcaseId,
        codes: &[Code],
        continue_on_conflict: bool,
    ) -> Result<(), Error>;

    async fn delete_all_codes(
        &self,
        imodel_id: &str,
        briefcase_id: BriefcaseId,
    ) -> Result<(), Error>;

    async fn delete_all_locks(
        &self,
        imodel_id: &str,
        briefcase_id: BriefcaseId,
    ) -> Result<(), Error>;

    /// Register a new iModel in the given context; returns its id.
    async fn create_imodel(&self, context_id: &str, name: &str) -> Result<String, Error>;
}

impl Version {
    /// Resolve to `(changeset_id, changeset_index)`. Version zero resolves
    /// locally, everything else consults the hub.
    pub async fn resolve(
        &self,
        hub: &dyn HubClient,
        imodel_id: &str,
    ) -> Result<(String, i64), Error> {
        match self {
            Version::First => Ok((String::new(), 0)),
            Version::Latest => match hub.latest_changeset(imodel_id).await? {
                Some(record) => Ok((record.id, record.index)),
                None => Ok((String::new(), 0)),
            },
            Version::Named(name) => {
                let record = hub.changeset_for_version_name(imodel_id, name).await?;
                Ok((record.id, record.index))
            }
            Version::AsOfChangeset(id) if id.is_empty() => Ok((String::new(), 0)),
            Version::AsOfChangeset(id) => {
                let record = hub.changeset_by_id(imodel_id, id).await?;
                Ok((record.id, record.index))
            }
        }
    }
}

/// Index of `changeset_id`, with the version-zero shortcut.
pub async fn changeset_index_of(
    hub: &dyn HubClient,
    imodel_id: &str,
    changeset_id: &str,
) -> Result<i64, Error> {
    if changeset_id.is_empty() {
        return Ok(0);
    }
    Ok(hub.changeset_by_id(imodel_id, changeset_id).await?.index)
}
