use std::path::Path;
use std::sync::Arc;

use anyhow::{bail, Error, Result};

use crate::hub::{
    changeset_index_of, CancelToken, HubError, HubErrorKind, Version,
};
use crate::native::{NativeError, OpenMode};
use crate::tools;

use super::{
    BriefcaseEntry, BriefcaseError, BriefcaseId, BriefcaseIndex, BriefcaseKey, BriefcaseManager,
    BriefcaseProps, DownloadStatus, EntryInit, RequestContext, SyncMode,
};

/// Reuse decision for a briefcase that already exists (in memory or on disk).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Validation {
    Reuse,
    Update,
    Recreate,
}

/// Can `entry` serve a request for `(required_changeset_id,
/// required_briefcase_id)` as-is, after an update, or not at all?
pub(crate) fn validate_briefcase(
    entry: &BriefcaseEntry,
    required_changeset_id: &str,
    required_briefcase_id: BriefcaseId,
) -> Validation {
    if entry.status() == DownloadStatus::Error {
        return Validation::Recreate;
    }
    if entry.briefcase_id != required_briefcase_id {
        return Validation::Recreate;
    }
    if entry.current_changeset_id() == required_changeset_id {
        return Validation::Reuse;
    }
    if entry.sync_mode == SyncMode::FixedVersion {
        // pinned versions never move
        return Validation::Recreate;
    }
    Validation::Update
}

/// Handle returned by [`BriefcaseManager::request_download`].
///
/// Repeated requests for the same key observe the same entry, and therefore
/// the same completion.
pub struct Downloader {
    entry: Arc<BriefcaseEntry>,
}

impl std::fmt::Debug for Downloader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Downloader").field("entry", &self.entry).finish()
    }
}

impl Downloader {
    pub fn entry(&self) -> &Arc<BriefcaseEntry> {
        &self.entry
    }

    pub fn props(&self) -> BriefcaseProps {
        self.entry.props()
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.entry.cancel_token()
    }

    /// Await the background pipeline; resolves once the briefcase is usable.
    pub async fn join(&self) -> Result<BriefcaseProps> {
        self.entry.wait_until_settled().await?;
        Ok(self.entry.props())
    }
}

enum MemoryOutcome {
    Use(Arc<BriefcaseEntry>),
    RecreateFirst(Arc<BriefcaseEntry>),
    Miss,
}

enum AdoptOutcome {
    Adopted(Arc<BriefcaseEntry>),
    Rejected,
}

impl BriefcaseManager {
    /// Locate or materialize a briefcase at `version` and start bringing it
    /// there. Returns immediately with a [`Downloader`]; the pipeline runs in
    /// the background.
    pub async fn request_download(
        self: &Arc<Self>,
        ctx: &RequestContext,
        context_id: &str,
        imodel_id: &str,
        sync_mode: SyncMode,
        version: Version,
    ) -> Result<Downloader> {
        let hub = self.hub()?.clone();
        let (target_id, target_index) = version.resolve(hub.as_ref(), imodel_id).await?;

        log::info!(
            "briefcase requested: iModel {} {} at index {} [{}]",
            imodel_id,
            sync_mode,
            target_index,
            ctx.activity_id
        );

        let entry = match sync_mode {
            SyncMode::FixedVersion | SyncMode::PullOnly => {
                self.request_standalone(context_id, imodel_id, sync_mode, &target_id, target_index)?
            }
            SyncMode::PullAndPush => {
                // serialize the whole acquisition; see the module docs
                let _serializer = self.acquire_mutex.lock().await;
                self.request_pull_and_push(context_id, imodel_id, &target_id, target_index)
                    .await?
            }
        };

        Ok(Downloader { entry })
    }

    /// Convenience wrapper: request and await completion.
    pub async fn download(
        self: &Arc<Self>,
        ctx: &RequestContext,
        context_id: &str,
        imodel_id: &str,
        sync_mode: SyncMode,
        version: Version,
    ) -> Result<BriefcaseProps> {
        let downloader = self
            .request_download(ctx, context_id, imodel_id, sync_mode, version)
            .await?;
        downloader.join().await
    }

    /// FixedVersion/PullOnly resolution. Everything from the index probe to
    /// the placeholder insert happens synchronously under the index lock, so
    /// a key can never gain two entries.
    fn request_standalone(
        self: &Arc<Self>,
        context_id: &str,
        imodel_id: &str,
        sync_mode: SyncMode,
        target_id: &str,
        target_index: i64,
    ) -> Result<Arc<BriefcaseEntry>> {
        let mut index = self.index.lock().unwrap();

        let existing = match sync_mode {
            SyncMode::FixedVersion => index.find_fixed_version(imodel_id, target_id),
            _ => index.find_variable_version(imodel_id, BriefcaseId::STANDALONE, SyncMode::PullOnly),
        };

        if let Some(entry) = existing {
            match self.check_memory_entry(&entry, target_id, target_index)? {
                MemoryOutcome::Use(entry) => return Ok(entry),
                MemoryOutcome::RecreateFirst(entry) => {
                    self.delete_local_locked(&mut index, &entry)?;
                }
                MemoryOutcome::Miss => {}
            }
        }

        let pathname =
            self.layout
                .briefcase_path(imodel_id, sync_mode, BriefcaseId::STANDALONE, target_id);

        if pathname.exists() {
            match self.adopt_from_disk(
                context_id,
                imodel_id,
                sync_mode,
                BriefcaseId::STANDALONE,
                target_id,
                target_index,
                &pathname,
            )? {
                AdoptOutcome::Adopted(entry) => {
                    index.insert(entry.clone())?;
                    self.launch_initialize(&entry);
                    return Ok(entry);
                }
                AdoptOutcome::Rejected => {}
            }
        }

        let entry = self.new_entry(
            context_id,
            imodel_id,
            sync_mode,
            BriefcaseId::STANDALONE,
            target_id,
            target_index,
        );
        index.insert(entry.clone())?;
        self.launch_create(&entry);
        Ok(entry)
    }

    /// PullAndPush resolution. Runs under the acquisition mutex; the hub
    /// calls in here are the reason the serializer exists.
    async fn request_pull_and_push(
        self: &Arc<Self>,
        context_id: &str,
        imodel_id: &str,
        target_id: &str,
        target_index: i64,
    ) -> Result<Arc<BriefcaseEntry>> {
        let hub = self.hub()?.clone();

        let owned = hub.my_briefcases(imodel_id).await?;
        let mut owned_ids: Vec<BriefcaseId> =
            owned.iter().map(|record| record.briefcase_id).collect();

        // in-memory reuse against the owned ids
        let memory_outcome = {
            let index = self.index.lock().unwrap();
            match index.find_any_hub_briefcase(imodel_id, &owned_ids) {
                Some(entry) => self.check_memory_entry(&entry, target_id, target_index)?,
                None => MemoryOutcome::Miss,
            }
        };

        match memory_outcome {
            MemoryOutcome::Use(entry) => return Ok(entry),
            MemoryOutcome::RecreateFirst(entry) => {
                // the stale briefcase releases its hub id as well
                let stale_id = entry.briefcase_id;
                self.delete_briefcase_entry(&entry).await?;
                owned_ids.retain(|id| *id != stale_id);
            }
            MemoryOutcome::Miss => {}
        }

        // adopt a matching briefcase from disk
        {
            let mut index = self.index.lock().unwrap();
            for briefcase_id in &owned_ids {
                let pathname = self.layout.briefcase_path(
                    imodel_id,
                    SyncMode::PullAndPush,
                    *briefcase_id,
                    target_id,
                );
                if !pathname.exists() {
                    continue;
                }
                if let AdoptOutcome::Adopted(entry) = self.adopt_from_disk(
                    context_id,
                    imodel_id,
                    SyncMode::PullAndPush,
                    *briefcase_id,
                    target_id,
                    target_index,
                    &pathname,
                )? {
                    let record = owned
                        .iter()
                        .find(|record| record.briefcase_id == *briefcase_id);
                    if let Some(record) = record {
                        entry.set_file_id(record.file_id.clone());
                    }
                    index.insert(entry.clone())?;
                    self.launch_initialize(&entry);
                    return Ok(entry);
                }
            }
        }

        // acquire a fresh id and create
        let acquired = hub.acquire_briefcase(imodel_id).await?;
        log::info!(
            "acquired briefcase {} for iModel {}",
            acquired.briefcase_id,
            imodel_id
        );

        let entry = self.new_entry(
            context_id,
            imodel_id,
            SyncMode::PullAndPush,
            acquired.briefcase_id,
            target_id,
            target_index,
        );
        entry.set_file_id(acquired.file_id);

        let mut index = self.index.lock().unwrap();
        index.insert(entry.clone())?;
        self.launch_create(&entry);
        Ok(entry)
    }

    /// Decide what to do with an index hit.
    fn check_memory_entry(
        self: &Arc<Self>,
        entry: &Arc<BriefcaseEntry>,
        target_id: &str,
        target_index: i64,
    ) -> Result<MemoryOutcome> {
        if !entry.status().is_final() {
            // still downloading - everybody shares the same completion
            return Ok(MemoryOutcome::Use(entry.clone()));
        }

        match validate_briefcase(entry, target_id, entry.briefcase_id) {
            Validation::Reuse => Ok(MemoryOutcome::Use(entry.clone())),
            outcome => {
                if entry.is_open() {
                    log::error!(
                        "briefcase {} needs {:?} but is open - close it first",
                        entry.key(),
                        outcome
                    );
                    return Err(BriefcaseError::BriefcaseInUse(entry.key()).into());
                }
                match outcome {
                    Validation::Update => {
                        entry.set_target_changeset(target_id.to_string(), target_index);
                        self.launch_initialize_arc(entry.clone());
                        Ok(MemoryOutcome::Use(entry.clone()))
                    }
                    Validation::Recreate => Ok(MemoryOutcome::RecreateFirst(entry.clone())),
                    Validation::Reuse => unreachable!(),
                }
            }
        }
    }

    fn new_entry(
        &self,
        context_id: &str,
        imodel_id: &str,
        sync_mode: SyncMode,
        briefcase_id: BriefcaseId,
        target_id: &str,
        target_index: i64,
    ) -> Arc<BriefcaseEntry> {
        BriefcaseEntry::new(EntryInit {
            imodel_id: imodel_id.to_string(),
            context_id: context_id.to_string(),
            briefcase_id,
            sync_mode,
            pathname: self
                .layout
                .briefcase_path(imodel_id, sync_mode, briefcase_id, target_id),
            parent_changeset_id: String::new(),
            parent_changeset_index: 0,
            reversed_changeset_id: None,
            reversed_changeset_index: None,
            target_changeset_id: target_id.to_string(),
            target_changeset_index: target_index,
        })
    }

    /// Take over an existing file: open it, read its identity, cross-check.
    /// Stale files are closed and removed so the caller can create afresh.
    #[allow(clippy::too_many_arguments)]
    fn adopt_from_disk(
        &self,
        context_id: &str,
        imodel_id: &str,
        sync_mode: SyncMode,
        required_id: BriefcaseId,
        target_id: &str,
        target_index: i64,
        pathname: &Path,
    ) -> Result<AdoptOutcome> {
        let db = self.engine.open(pathname, OpenMode::ReadWrite)?;

        let entry = BriefcaseEntry::new(EntryInit {
            imodel_id: imodel_id.to_string(),
            context_id: context_id.to_string(),
            briefcase_id: db.briefcase_id(),
            sync_mode,
            pathname: pathname.to_path_buf(),
            parent_changeset_id: db.parent_changeset_id(),
            // indexes are resolved by the initialize task
            parent_changeset_index: 0,
            reversed_changeset_id: db.reversed_changeset_id(),
            reversed_changeset_index: db.reversed_changeset_id().map(|_| 0),
            target_changeset_id: target_id.to_string(),
            target_changeset_index: target_index,
        });

        match validate_briefcase(&entry, target_id, required_id) {
            Validation::Reuse | Validation::Update => {
                log::info!("adopting briefcase at {:?}", pathname);
                *entry
                    .db
                    .try_lock()
                    .expect("fresh entry has an uncontended handle slot") = Some(db);
                entry.mark_open(true);
                Ok(AdoptOutcome::Adopted(entry))
            }
            Validation::Recreate => {
                log::info!("discarding stale briefcase at {:?}", pathname);
                db.close()?;
                if let Some(dir) = pathname.parent() {
                    tools::remove_dir_all_if_exists(dir)?;
                }
                Ok(AdoptOutcome::Rejected)
            }
        }
    }

    /// Synchronous removal used while already holding the index lock
    /// (standalone briefcases only - nothing to release on the hub).
    fn delete_local_locked(
        &self,
        index: &mut BriefcaseIndex,
        entry: &Arc<BriefcaseEntry>,
    ) -> Result<()> {
        index.remove(&entry.key())?;
        if let Some(dir) = entry.pathname.parent() {
            tools::remove_dir_all_if_exists(dir)?;
            if let Some(parent) = dir.parent() {
                tools::remove_empty_parents(parent, self.layout.root())?;
            }
        }
        Ok(())
    }

    fn launch_initialize(self: &Arc<Self>, entry: &Arc<BriefcaseEntry>) {
        self.launch_initialize_arc(entry.clone());
    }

    fn launch_initialize_arc(self: &Arc<Self>, entry: Arc<BriefcaseEntry>) {
        entry.set_status(DownloadStatus::Initializing);
        let manager = self.clone();
        tokio::spawn(async move {
            let result = manager.run_initialize(&entry).await;
            manager.settle_download(entry, result).await;
        });
    }

    fn launch_create(self: &Arc<Self>, entry: &Arc<BriefcaseEntry>) {
        entry.set_status(DownloadStatus::Initializing);
        let manager = self.clone();
        let entry = entry.clone();
        tokio::spawn(async move {
            let result = manager.run_create(&entry).await;
            manager.settle_download(entry, result).await;
        });
    }

    async fn settle_download(self: Arc<Self>, entry: Arc<BriefcaseEntry>, result: Result<()>) {
        match result {
            Ok(()) => {
                entry.set_status(DownloadStatus::Complete);
                log::info!("briefcase {} ready at {:?}", entry.key(), entry.pathname);
            }
            Err(err) => self.handle_finish_failure(entry, err).await,
        }
    }

    /// Initialization of an adopted (or updated) briefcase: resolve the hub
    /// indexes, catch up to the target, close.
    async fn run_initialize(&self, entry: &Arc<BriefcaseEntry>) -> Result<()> {
        let hub = self.hub()?.clone();

        let (parent_id, _) = entry.parent_changeset();
        let parent_index = changeset_index_of(hub.as_ref(), &entry.imodel_id, &parent_id).await?;
        entry.set_parent_changeset(parent_id, parent_index);

        if let Some((reversed_id, _)) = entry.reversed_changeset() {
            let reversed_index =
                changeset_index_of(hub.as_ref(), &entry.imodel_id, &reversed_id).await?;
            entry.set_reversed_changeset(Some((reversed_id, reversed_index)));
        }

        if entry.briefcase_id.is_hub_assigned() && entry.file_id().is_none() {
            entry.set_file_id(
                hub.briefcase_file_id(&entry.imodel_id, entry.briefcase_id)
                    .await?,
            );
        }

        let (target_id, target_index) = entry.target_changeset();
        if entry.current_changeset_id() != target_id {
            entry.open_db(self.engine.as_ref(), OpenMode::ReadWrite).await?;
            entry.set_status(DownloadStatus::DownloadingChangeSets);
            self.process_changesets(entry, &target_id, target_index)
                .await?;
        }

        entry.set_status(DownloadStatus::Initializing);
        entry.close_db().await?;
        Ok(())
    }

    /// Materialization of a new briefcase from a checkpoint.
    async fn run_create(&self, entry: &Arc<BriefcaseEntry>) -> Result<()> {
        let hub = self.hub()?.clone();
        let (target_id, target_index) = entry.target_changeset();

        entry.set_status(DownloadStatus::DownloadingCheckpoint);
        let checkpoint = hub
            .preceding_checkpoint(&entry.imodel_id, target_index)
            .await?
            .ok_or_else(|| {
                Error::new(HubError::new(
                    HubErrorKind::VersionNotFound,
                    format!(
                        "no checkpoint preceding index {} of iModel {}",
                        target_index, entry.imodel_id
                    ),
                ))
            })?;

        if let Some(dir) = entry.pathname.parent() {
            tools::create_path(dir)?;
        }

        if entry.pathname.exists() {
            log::info!("checkpoint already on disk at {:?}", entry.pathname);
        } else {
            let key = entry.key();
            let progress = move |progress: crate::hub::DownloadProgress| {
                log::debug!("briefcase {} checkpoint download: {}", key, progress);
            };
            hub.download_checkpoint(
                &entry.imodel_id,
                &checkpoint,
                &entry.pathname,
                &progress,
                &entry.cancel,
            )
            .await?;
        }

        entry
            .open_db(self.engine.as_ref(), OpenMode::ReadWrite)
            .await?;
        {
            let mut slot = entry.db.lock().await;
            let db = slot.as_mut().expect("opened above");
            if db.briefcase_id() != entry.briefcase_id {
                db.reset_briefcase_id(entry.briefcase_id)?;
            }
            if db.parent_changeset_id() != checkpoint.merged_changeset_id {
                bail!(
                    "checkpoint file {:?} is at {:?}, expected {:?}",
                    entry.pathname,
                    db.parent_changeset_id(),
                    checkpoint.merged_changeset_id
                );
            }
            if db.db_guid() != entry.imodel_id {
                bail!(
                    "checkpoint file {:?} belongs to iModel {}, expected {}",
                    entry.pathname,
                    db.db_guid(),
                    entry.imodel_id
                );
            }
            if let Some(project_guid) = db.project_guid() {
                if project_guid != entry.context_id {
                    bail!(
                        "checkpoint file {:?} belongs to context {}, expected {}",
                        entry.pathname,
                        project_guid,
                        entry.context_id
                    );
                }
            }
        }
        entry.set_parent_changeset(
            checkpoint.merged_changeset_id.clone(),
            checkpoint.merged_changeset_index,
        );

        if entry.briefcase_id.is_hub_assigned() && entry.file_id().is_none() {
            entry.set_file_id(
                hub.briefcase_file_id(&entry.imodel_id, entry.briefcase_id)
                    .await?,
            );
        }

        if entry.current_changeset_id() != target_id {
            // application always runs read-write, whatever the entry's mode
            entry.set_status(DownloadStatus::DownloadingChangeSets);
            self.process_changesets(entry, &target_id, target_index)
                .await?;
        }

        entry.set_status(DownloadStatus::Initializing);
        entry.close_db().await?;
        Ok(())
    }

    /// Failure policy of the download pipeline.
    async fn handle_finish_failure(&self, entry: Arc<BriefcaseEntry>, err: Error) {
        // a corrupted changeset stream poisons the shared pool - purge it so
        // a retry starts clean
        if NativeError::status_of(&err).map_or(false, |status| status.is_corruption()) {
            log::warn!(
                "purging changeset pool of iModel {} after corrupted stream",
                entry.imodel_id
            );
            let _ = tools::remove_dir_all_if_exists(self.layout.changeset_dir(&entry.imodel_id));
        }

        let cancelled = HubError::kind_of(&err) == Some(HubErrorKind::UserCancelled);

        let preserve = entry.sync_mode == SyncMode::PullAndPush && {
            let slot = entry.db.lock().await;
            match slot.as_ref() {
                Some(db) => db.has_pending_txns(),
                None => match self.engine.open(&entry.pathname, OpenMode::ReadWrite) {
                    Ok(db) => {
                        let pending = db.has_pending_txns();
                        let _ = db.close();
                        pending
                    }
                    Err(_) => false,
                },
            }
        };

        let projection = serde_json::to_string(&entry.props())
            .unwrap_or_else(|_| entry.key().to_string());
        log::error!("briefcase download failed - {:#} - {}", err, projection);
        entry.set_error(err);
        let _ = entry.close_db().await;

        if cancelled {
            // cancellation leaves the partial state for the next attempt
            return;
        }

        if preserve {
            log::warn!(
                "briefcase {} has local changes - keeping it despite the failure",
                entry.key()
            );
            return;
        }

        if let Err(delete_err) = self.delete_briefcase_entry(&entry).await {
            log::warn!(
                "unable to clean up briefcase {} - {:#}",
                entry.key(),
                delete_err
            );
        }
    }

    /// Look up an entry without touching the hub.
    pub fn find_briefcase_by_key(&self, key: &BriefcaseKey) -> Option<Arc<BriefcaseEntry>> {
        self.index.lock().unwrap().get(key)
    }

    /// Projections of every known briefcase.
    pub fn briefcases(&self) -> Vec<BriefcaseProps> {
        self.index
            .lock()
            .unwrap()
            .entries()
            .iter()
            .map(|entry| entry.props())
            .collect()
    }
}
