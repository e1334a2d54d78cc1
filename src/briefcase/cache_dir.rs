use std::path::{Path, PathBuf};

use anyhow::{format_err, Error};
use lazy_static::lazy_static;
use regex::Regex;

use crate::tools;

use super::{BriefcaseId, SyncMode};

/// Current cache layout revision. Bumping the major number invalidates every
/// existing cache directory; minor bumps migrate in place.
pub const CACHE_LAYOUT_MAJOR: u32 = 1;
pub const CACHE_LAYOUT_MINOR: u32 = 0;

pub const BRIEFCASE_FILE_NAME: &str = "bc.bim";
pub const CHANGESET_DIR_NAME: &str = "csets";
pub const BRIEFCASE_SUBDIR_NAME: &str = "bc";

/// Directory name standing in for the empty changeset id of version zero.
pub const FIRST_VERSION_DIR: &str = "first";

lazy_static! {
    pub static ref LAYOUT_VERSION_REGEX: Regex = Regex::new(r"^v(\d+)_(\d+)$").unwrap();
}

/// Deterministic path scheme below one versioned cache root.
#[derive(Debug, Clone)]
pub struct CacheLayout {
    root: PathBuf,
}

impl CacheLayout {
    fn version_dir_name(major: u32, minor: u32) -> String {
        format!("v{}_{}", major, minor)
    }

    /// Prepare the versioned cache root below `cache_root`.
    ///
    /// Foreign-major subdirectories are deleted wholesale; a same-major
    /// subdirectory with an older or newer minor is adopted by renaming it
    /// to the current layout name.
    pub fn init(cache_root: &Path) -> Result<Self, Error> {
        tools::create_path(cache_root)?;

        let current_name = Self::version_dir_name(CACHE_LAYOUT_MAJOR, CACHE_LAYOUT_MINOR);
        let current = cache_root.join(&current_name);

        for item in std::fs::read_dir(cache_root)
            .map_err(|err| format_err!("unable to scan cache root {:?} - {}", cache_root, err))?
        {
            let item = item?;
            let file_name = item.file_name();
            let name = match file_name.to_str() {
                Some(name) => name,
                None => continue,
            };
            let captures = match LAYOUT_VERSION_REGEX.captures(name) {
                Some(captures) => captures,
                None => continue,
            };
            let major: u32 = captures[1].parse()?;
            let minor: u32 = captures[2].parse()?;

            if major != CACHE_LAYOUT_MAJOR {
                log::info!("deleting incompatible cache layout {:?}", item.path());
                tools::remove_dir_all_if_exists(item.path())?;
            } else if minor != CACHE_LAYOUT_MINOR {
                if current.exists() {
                    // already migrated once - the stray minor dir loses
                    log::info!("deleting stale cache layout {:?}", item.path());
                    tools::remove_dir_all_if_exists(item.path())?;
                } else {
                    log::info!(
                        "migrating cache layout {:?} to {}",
                        item.path(),
                        current_name
                    );
                    std::fs::rename(item.path(), &current)?;
                }
            }
        }

        tools::create_path(&current)?;

        Ok(Self { root: current })
    }

    /// The versioned root (`<cacheRoot>/v<major>_<minor>`).
    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn imodel_dir(&self, imodel_id: &str) -> PathBuf {
        self.root.join(imodel_id)
    }

    /// Shared changeset blob pool of an iModel.
    pub fn changeset_dir(&self, imodel_id: &str) -> PathBuf {
        self.imodel_dir(imodel_id).join(CHANGESET_DIR_NAME)
    }

    pub fn briefcase_parent_dir(&self, imodel_id: &str) -> PathBuf {
        self.imodel_dir(imodel_id).join(BRIEFCASE_SUBDIR_NAME)
    }

    pub fn sync_mode_dir(&self, imodel_id: &str, sync_mode: SyncMode) -> PathBuf {
        self.briefcase_parent_dir(imodel_id).join(sync_mode.dir_name())
    }

    /// Folder name of a pinned-version briefcase.
    pub fn fixed_version_folder(changeset_id: &str) -> &str {
        if changeset_id.is_empty() {
            FIRST_VERSION_DIR
        } else {
            changeset_id
        }
    }

    /// Directory holding one briefcase file.
    pub fn briefcase_dir(
        &self,
        imodel_id: &str,
        sync_mode: SyncMode,
        briefcase_id: BriefcaseId,
        target_changeset_id: &str,
    ) -> PathBuf {
        let dir = self.sync_mode_dir(imodel_id, sync_mode);
        match sync_mode {
            SyncMode::FixedVersion => dir.join(Self::fixed_version_folder(target_changeset_id)),
            SyncMode::PullOnly | SyncMode::PullAndPush => dir.join(briefcase_id.to_string()),
        }
    }

    pub fn briefcase_path(
        &self,
        imodel_id: &str,
        sync_mode: SyncMode,
        briefcase_id: BriefcaseId,
        target_changeset_id: &str,
    ) -> PathBuf {
        self.briefcase_dir(imodel_id, sync_mode, briefcase_id, target_changeset_id)
            .join(BRIEFCASE_FILE_NAME)
    }
}
