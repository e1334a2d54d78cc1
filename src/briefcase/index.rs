use std::collections::HashMap;
use std::sync::Arc;

use super::{BriefcaseEntry, BriefcaseError, BriefcaseId, BriefcaseKey, SyncMode};

/// Keyed container of all briefcases known to one manager.
///
/// Mutated only from the control plane while holding the manager's index
/// lock; the no-duplicate guarantees in here back the cache-key invariants.
#[derive(Default)]
pub struct BriefcaseIndex {
    map: HashMap<BriefcaseKey, Arc<BriefcaseEntry>>,
}

impl BriefcaseIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an entry. Fails if its key is already taken.
    pub fn insert(&mut self, entry: Arc<BriefcaseEntry>) -> Result<(), BriefcaseError> {
        let key = entry.key();
        if self.map.contains_key(&key) {
            return Err(BriefcaseError::DuplicateKey(key));
        }
        self.map.insert(key, entry);
        Ok(())
    }

    /// Drop an entry. Fails if the key is absent.
    pub fn remove(&mut self, key: &BriefcaseKey) -> Result<Arc<BriefcaseEntry>, BriefcaseError> {
        self.map
            .remove(key)
            .ok_or_else(|| BriefcaseError::NotFound(key.clone()))
    }

    pub fn get(&self, key: &BriefcaseKey) -> Option<Arc<BriefcaseEntry>> {
        self.map.get(key).cloned()
    }

    pub fn find<P>(&self, predicate: P) -> Option<Arc<BriefcaseEntry>>
    where
        P: Fn(&BriefcaseEntry) -> bool,
    {
        self.map
            .values()
            .find(|entry| predicate(entry))
            .cloned()
    }

    pub fn entries(&self) -> Vec<Arc<BriefcaseEntry>> {
        self.map.values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn clear(&mut self) {
        self.map.clear();
    }

    /// Pinned-version lookup by `(iModelId, targetChangeSetId)`.
    pub fn find_fixed_version(
        &self,
        imodel_id: &str,
        changeset_id: &str,
    ) -> Option<Arc<BriefcaseEntry>> {
        let key = BriefcaseKey::compute(
            imodel_id,
            SyncMode::FixedVersion,
            BriefcaseId::STANDALONE,
            changeset_id,
        );
        self.map
            .get(&key)
            .filter(|entry| entry.sync_mode == SyncMode::FixedVersion)
            .cloned()
    }

    /// Variable-version lookup by `(iModelId, briefcaseId, syncMode)`.
    pub fn find_variable_version(
        &self,
        imodel_id: &str,
        briefcase_id: BriefcaseId,
        sync_mode: SyncMode,
    ) -> Option<Arc<BriefcaseEntry>> {
        let key = BriefcaseKey::compute(imodel_id, sync_mode, briefcase_id, "");
        self.map
            .get(&key)
            .filter(|entry| entry.sync_mode == sync_mode)
            .cloned()
    }

    /// First `PullAndPush` entry matching any of the hub-issued ids.
    pub fn find_any_hub_briefcase(
        &self,
        imodel_id: &str,
        briefcase_ids: &[BriefcaseId],
    ) -> Option<Arc<BriefcaseEntry>> {
        briefcase_ids.iter().find_map(|briefcase_id| {
            self.find_variable_version(imodel_id, *briefcase_id, SyncMode::PullAndPush)
        })
    }

    /// Re-register an entry whose key-relevant fields changed.
    pub fn rekey(&mut self, old_key: &BriefcaseKey) -> Result<(), BriefcaseError> {
        let entry = self.remove(old_key)?;
        self.insert(entry)
    }
}
