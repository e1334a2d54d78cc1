use std::sync::{Arc, Mutex};

use anyhow::{format_err, Result};
use lazy_static::lazy_static;
use once_cell::sync::Lazy;
use regex::Regex;

use crate::hub::HubClient;
use crate::native::{NativeEngine, OpenMode};
use crate::tools;

use super::{
    BriefcaseEntry, BriefcaseError, BriefcaseEvents, BriefcaseId, BriefcaseIndex, BriefcaseKey,
    CacheLayout, DownloadStatus, EntryInit, ManagerOptions, SyncMode, BRIEFCASE_FILE_NAME,
    BRIEFCASE_SUBDIR_NAME,
};

lazy_static! {
    static ref INSTANCE: Mutex<Option<Arc<BriefcaseManager>>> = Mutex::new(None);
}

/// Folder names of variable-version briefcases are bare briefcase ids.
static BRIEFCASE_DIR_REGEX: Lazy<Regex> = Lazy::new(|| Regex::new(r"^\d+$").unwrap());

/// The process-wide briefcase manager.
///
/// Owns the cache layout, the in-memory index and the collaborator handles.
/// Constructed once per process via [`BriefcaseManager::initialize`]; handles
/// retained across [`BriefcaseManager::shutdown`] are invalid.
pub struct BriefcaseManager {
    pub(crate) layout: CacheLayout,
    pub(crate) options: ManagerOptions,
    pub(crate) engine: Arc<dyn NativeEngine>,
    hub: Option<Arc<dyn HubClient>>,
    pub(crate) index: Mutex<BriefcaseIndex>,
    pub(crate) events: BriefcaseEvents,
    pub(crate) acquire_mutex: tokio::sync::Mutex<()>,
}

impl std::fmt::Debug for BriefcaseManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BriefcaseManager")
            .field("root", &self.layout.root())
            .field("offline", &self.hub.is_none())
            .finish()
    }
}

impl BriefcaseManager {
    /// Set up the process singleton. Fails if one is already registered;
    /// shut down first.
    pub fn initialize(
        options: ManagerOptions,
        engine: Arc<dyn NativeEngine>,
        hub: Option<Arc<dyn HubClient>>,
    ) -> Result<Arc<Self>> {
        let mut slot = INSTANCE.lock().unwrap();
        if slot.is_some() {
            return Err(BriefcaseError::AlreadyInitialized.into());
        }
        let manager = Self::create(options, engine, hub)?;
        *slot = Some(manager.clone());
        Ok(manager)
    }

    pub fn get() -> Result<Arc<Self>> {
        INSTANCE
            .lock()
            .unwrap()
            .clone()
            .ok_or_else(|| BriefcaseError::NotInitialized.into())
    }

    /// Tear down the singleton. Every entry becomes unreachable.
    pub fn shutdown() -> Result<()> {
        let mut slot = INSTANCE.lock().unwrap();
        match slot.take() {
            Some(manager) => {
                manager.index.lock().unwrap().clear();
                Ok(())
            }
            None => Err(BriefcaseError::NotInitialized.into()),
        }
    }

    // Unregistered instance for test isolation. This one skips the
    // process-singleton slot on purpose.
    #[doc(hidden)]
    pub fn new_test(
        options: ManagerOptions,
        engine: Arc<dyn NativeEngine>,
        hub: Option<Arc<dyn HubClient>>,
    ) -> Result<Arc<Self>> {
        Self::create(options, engine, hub)
    }

    fn create(
        options: ManagerOptions,
        engine: Arc<dyn NativeEngine>,
        hub: Option<Arc<dyn HubClient>>,
    ) -> Result<Arc<Self>> {
        let layout = CacheLayout::init(&options.cache_root)?;
        let manager = Arc::new(Self {
            layout,
            options,
            engine,
            hub,
            index: Mutex::new(BriefcaseIndex::new()),
            events: BriefcaseEvents::new(),
            acquire_mutex: tokio::sync::Mutex::new(()),
        });
        if manager.hub.is_none() {
            manager.bootstrap_offline()?;
        }
        Ok(manager)
    }

    pub(crate) fn hub(&self) -> Result<&Arc<dyn HubClient>> {
        self.hub
            .as_ref()
            .ok_or_else(|| format_err!("no hub configured - briefcase cache is offline"))
    }

    pub fn events(&self) -> &BriefcaseEvents {
        &self.events
    }

    pub fn layout(&self) -> &CacheLayout {
        &self.layout
    }

    /// Open a settled briefcase with its derived open mode.
    pub async fn open_briefcase(&self, entry: &Arc<BriefcaseEntry>) -> Result<()> {
        if !entry.status().is_final() {
            return Err(BriefcaseError::DownloadInProgress(entry.key()).into());
        }
        entry.open_db(self.engine.as_ref(), entry.open_mode).await?;
        self.events.fire_after_open(entry);
        Ok(())
    }

    /// Close a briefcase. Idempotent.
    pub async fn close_briefcase(&self, entry: &Arc<BriefcaseEntry>) -> Result<()> {
        self.events.fire_before_close(entry);
        entry.close_db().await
    }

    /// Remove a briefcase from memory, disk and (for hub-issued ids) the hub.
    pub async fn delete(&self, key: &BriefcaseKey) -> Result<()> {
        let entry = self
            .find_briefcase_by_key(key)
            .ok_or_else(|| BriefcaseError::NotFound(key.clone()))?;
        self.delete_briefcase_entry(&entry).await
    }

    pub(crate) async fn delete_briefcase_entry(&self, entry: &Arc<BriefcaseEntry>) -> Result<()> {
        if !entry.status().is_final() {
            return Err(BriefcaseError::DownloadInProgress(entry.key()).into());
        }
        if entry.is_open() {
            return Err(BriefcaseError::BriefcaseInUse(entry.key()).into());
        }
        entry.close_db().await?;

        {
            let mut index = self.index.lock().unwrap();
            // a failed download may race its own cleanup; absence is fine
            let _ = index.remove(&entry.key());
        }

        if entry.briefcase_id.is_hub_assigned() {
            if let Ok(hub) = self.hub() {
                if let Err(err) = hub
                    .release_briefcase(&entry.imodel_id, entry.briefcase_id)
                    .await
                {
                    log::warn!(
                        "unable to release briefcase {} on the hub - {:#}",
                        entry.briefcase_id,
                        err
                    );
                }
            }
        }

        if let Some(dir) = entry.pathname.parent() {
            tools::remove_dir_all_if_exists(dir)?;
            if let Some(mode_dir) = dir.parent() {
                tools::remove_empty_parents(mode_dir, self.layout.root())?;
            }
        }

        log::info!("deleted briefcase {}", entry.key());
        Ok(())
    }

    /// Close everything, delete every settled entry, then sweep the cache
    /// directory for leftovers of earlier runs.
    pub async fn purge_cache(&self) -> Result<()> {
        let entries = self.index.lock().unwrap().entries();
        let closed = futures::future::join_all(
            entries.iter().map(|entry| self.close_briefcase(entry)),
        )
        .await;
        for (entry, result) in entries.iter().zip(closed) {
            if let Err(err) = result {
                log::warn!("unable to close briefcase {} - {:#}", entry.key(), err);
            }
        }
        for entry in &entries {
            if !entry.status().is_final() {
                continue;
            }
            if let Err(err) = self.delete_briefcase_entry(entry).await {
                log::warn!("unable to delete briefcase {} - {:#}", entry.key(), err);
            }
        }

        self.sweep_cache_dir().await
    }

    async fn sweep_cache_dir(&self) -> Result<()> {
        let root = self.layout.root().to_path_buf();
        if !root.exists() {
            return Ok(());
        }

        let mut imodel_dirs = Vec::new();
        for item in std::fs::read_dir(&root)? {
            let item = item?;
            if item.path().is_dir() {
                imodel_dirs.push(item.path());
            }
        }

        for imodel_dir in imodel_dirs {
            let imodel_id = match imodel_dir.file_name().and_then(|name| name.to_str()) {
                Some(name) => name.to_string(),
                None => continue,
            };

            let bc_dir = imodel_dir.join(BRIEFCASE_SUBDIR_NAME);
            if bc_dir.is_dir() {
                for mode_item in std::fs::read_dir(&bc_dir)? {
                    let mode_item = mode_item?;
                    let mode = mode_item
                        .file_name()
                        .to_str()
                        .and_then(SyncMode::from_dir_name);
                    let variable_mode = matches!(
                        mode,
                        Some(SyncMode::PullOnly) | Some(SyncMode::PullAndPush)
                    );
                    for folder in std::fs::read_dir(mode_item.path())? {
                        let folder = folder?;
                        if variable_mode {
                            if let Some(briefcase_id) = folder
                                .file_name()
                                .to_str()
                                .filter(|name| BRIEFCASE_DIR_REGEX.is_match(name))
                                .and_then(|name| name.parse::<u32>().ok())
                                .map(BriefcaseId)
                                .filter(|id| id.is_hub_assigned())
                            {
                                if let Ok(hub) = self.hub() {
                                    if let Err(err) =
                                        hub.release_briefcase(&imodel_id, briefcase_id).await
                                    {
                                        log::warn!(
                                            "unable to release briefcase {} on the hub - {:#}",
                                            briefcase_id,
                                            err
                                        );
                                    }
                                }
                            }
                        }
                        tools::remove_dir_all_if_exists(folder.path())?;
                    }
                }
                tools::remove_dir_all_if_exists(&bc_dir)?;
            }

            // the blob pool is cache as well - with it gone the iModel
            // folder can be removed
            tools::remove_dir_all_if_exists(imodel_dir.join(super::CHANGESET_DIR_NAME))?;
            if tools::dir_is_empty(&imodel_dir) {
                tools::remove_dir_all_if_exists(&imodel_dir)?;
            }
        }

        log::info!("purged briefcase cache below {:?}", root);
        Ok(())
    }

    /// Rebuild the index from disk after a restart without a hub.
    fn bootstrap_offline(&self) -> Result<()> {
        let root = self.layout.root().to_path_buf();
        log::info!("scanning briefcase cache at {:?}", root);

        let mut index = self.index.lock().unwrap();

        for imodel_item in std::fs::read_dir(&root)? {
            let imodel_item = imodel_item?;
            if !imodel_item.path().is_dir() {
                continue;
            }
            let imodel_id = match imodel_item.file_name().to_str() {
                Some(name) => name.to_string(),
                None => continue,
            };

            let bc_dir = imodel_item.path().join(BRIEFCASE_SUBDIR_NAME);
            if !bc_dir.is_dir() {
                continue;
            }

            for mode_item in std::fs::read_dir(&bc_dir)? {
                let mode_item = mode_item?;
                let sync_mode = match mode_item
                    .file_name()
                    .to_str()
                    .and_then(SyncMode::from_dir_name)
                {
                    Some(sync_mode) => sync_mode,
                    None => {
                        log::warn!("skipping unknown cache directory {:?}", mode_item.path());
                        continue;
                    }
                };

                for folder in std::fs::read_dir(mode_item.path())? {
                    let folder = folder?;
                    let folder_name = match folder.file_name().to_str() {
                        Some(name) => name.to_string(),
                        None => continue,
                    };
                    let pathname = folder.path().join(BRIEFCASE_FILE_NAME);
                    if !pathname.exists() {
                        continue;
                    }

                    match self.adopt_offline(&imodel_id, sync_mode, &folder_name, pathname) {
                        Ok(entry) => {
                            if let Err(err) = index.insert(entry) {
                                log::warn!("skipping cached briefcase - {}", err);
                            }
                        }
                        Err(err) => {
                            log::warn!(
                                "skipping cached briefcase in {:?} - {:#}",
                                folder.path(),
                                err
                            );
                        }
                    }
                }
            }
        }

        log::info!("found {} cached briefcases", index.len());
        Ok(())
    }

    /// Open and cross-validate one cached briefcase file. Invalid files are
    /// skipped by the caller, never deleted.
    fn adopt_offline(
        &self,
        imodel_id: &str,
        sync_mode: SyncMode,
        folder_name: &str,
        pathname: std::path::PathBuf,
    ) -> Result<Arc<BriefcaseEntry>> {
        let open_mode = match sync_mode {
            SyncMode::FixedVersion => OpenMode::Readonly,
            _ => OpenMode::ReadWrite,
        };
        let db = self.engine.open(&pathname, open_mode)?;

        let validation = (|| {
            if db.db_guid() != imodel_id {
                return Err(format_err!(
                    "file belongs to iModel {}, not {}",
                    db.db_guid(),
                    imodel_id
                ));
            }
            let briefcase_id = db.briefcase_id();
            if briefcase_id == BriefcaseId::DEPRECATED_STANDALONE {
                return Err(format_err!("deprecated standalone briefcase id"));
            }
            let parent_id = db.parent_changeset_id();
            let reversed_id = db.reversed_changeset_id();
            match sync_mode {
                SyncMode::FixedVersion => {
                    if briefcase_id != BriefcaseId::STANDALONE {
                        return Err(format_err!(
                            "pinned briefcase carries briefcase id {}",
                            briefcase_id
                        ));
                    }
                    let current_id = reversed_id.clone().unwrap_or_else(|| parent_id.clone());
                    if folder_name != CacheLayout::fixed_version_folder(&current_id) {
                        return Err(format_err!(
                            "folder {:?} does not match changeset {:?}",
                            folder_name,
                            current_id
                        ));
                    }
                }
                SyncMode::PullOnly | SyncMode::PullAndPush => {
                    if !BRIEFCASE_DIR_REGEX.is_match(folder_name)
                        || folder_name != briefcase_id.to_string()
                    {
                        return Err(format_err!(
                            "folder {:?} does not match briefcase id {}",
                            folder_name,
                            briefcase_id
                        ));
                    }
                }
            }
            Ok((briefcase_id, parent_id, reversed_id))
        })();

        let (briefcase_id, parent_id, reversed_id) = match validation {
            Ok(fields) => fields,
            Err(err) => {
                let _ = db.close();
                return Err(err);
            }
        };

        let current_id = reversed_id.clone().unwrap_or_else(|| parent_id.clone());
        db.close()?;

        let entry = BriefcaseEntry::new(EntryInit {
            imodel_id: imodel_id.to_string(),
            context_id: String::new(),
            briefcase_id,
            sync_mode,
            pathname,
            parent_changeset_id: parent_id,
            // changeset indexes need a hub; offline entries never run the
            // changeset engine, so placeholders are fine
            parent_changeset_index: 0,
            reversed_changeset_index: reversed_id.as_ref().map(|_| 0),
            reversed_changeset_id: reversed_id,
            target_changeset_id: current_id,
            target_changeset_index: 0,
        });
        entry.set_status(DownloadStatus::Complete);
        Ok(entry)
    }

    /// Thin pass-through to the hub capability.
    pub async fn create_imodel(&self, context_id: &str, name: &str) -> Result<String> {
        log::info!("creating iModel {:?}", name);
        self.hub()?.create_imodel(context_id, name).await
    }
}
