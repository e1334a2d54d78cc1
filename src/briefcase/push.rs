use std::sync::Arc;
use std::time::Duration;

use anyhow::{format_err, Result};
use rand::Rng;

use crate::hub::{ChangesType, HubError, HubErrorKind, NewChangeset, Version};

use super::{BriefcaseEntry, BriefcaseError, BriefcaseManager, CodeConflict, SyncMode};

/// Hub-imposed limit on changeset descriptions.
pub const MAX_PUSH_DESCRIPTION: usize = 254;

pub(crate) fn truncate_description(description: &str) -> String {
    description.chars().take(MAX_PUSH_DESCRIPTION).collect()
}

impl BriefcaseManager {
    /// Upload the local changes of a `PullAndPush` briefcase as one new
    /// changeset: pull to latest, reconcile leftovers of earlier attempts,
    /// create/upload the changeset, reconcile codes, advance the parent.
    ///
    /// Transient hub contention is retried with jittered backoff; code
    /// conflicts never fail the push, they are retained on the entry.
    pub async fn push_changes(
        self: &Arc<Self>,
        entry: &Arc<BriefcaseEntry>,
        description: &str,
        change_type: ChangesType,
        relinquish_codes_locks: bool,
    ) -> Result<()> {
        if entry.sync_mode != SyncMode::PullAndPush {
            return Err(BriefcaseError::NotPullAndPush.into());
        }

        {
            let slot = entry.db.lock().await;
            let db = slot.as_ref().ok_or(BriefcaseError::NotOpen)?;
            if !db.has_pending_txns() && db.pending_changesets().is_empty() {
                return Err(BriefcaseError::NoLocalChanges.into());
            }
        }

        let description = truncate_description(description);
        let max_attempts = self.options.max_push_attempts.max(1);
        let mut attempt = 0;

        loop {
            attempt += 1;
            match self
                .push_once(entry, &description, change_type, relinquish_codes_locks)
                .await
            {
                Ok(()) => {
                    log::info!(
                        "pushed changes of briefcase {} (attempt {})",
                        entry.key(),
                        attempt
                    );
                    return Ok(());
                }
                Err(err) => {
                    let transient = HubError::kind_of(&err)
                        .map_or(false, |kind| kind.is_transient());
                    if !transient || attempt >= max_attempts {
                        return Err(err);
                    }
                    let backoff = self.push_backoff();
                    log::warn!(
                        "push attempt {} for briefcase {} failed ({:#}) - retrying in {:?}",
                        attempt,
                        entry.key(),
                        err,
                        backoff
                    );
                    tokio::time::sleep(backoff).await;
                }
            }
        }
    }

    fn push_backoff(&self) -> Duration {
        let min = self.options.push_backoff_min.as_millis() as u64;
        let max = self.options.push_backoff_max.as_millis() as u64;
        if max <= min {
            return Duration::from_millis(min);
        }
        Duration::from_millis(rand::thread_rng().gen_range(min..=max))
    }

    async fn push_once(
        self: &Arc<Self>,
        entry: &Arc<BriefcaseEntry>,
        description: &str,
        change_type: ChangesType,
        relinquish_codes_locks: bool,
    ) -> Result<()> {
        let hub = self.hub()?.clone();

        // 1. merge whatever landed on the hub since the last pull
        self.pull_and_merge_changes(entry, Version::Latest).await?;

        // 2. finish reconciliation work of earlier partial pushes
        self.drain_pending_changesets(entry).await?;

        {
            let slot = entry.db.lock().await;
            let db = slot.as_ref().ok_or(BriefcaseError::NotOpen)?;
            if !db.has_pending_txns() {
                // the push amounted to completing a prior attempt
                return Ok(());
            }
        }

        // 3. collect local transactions into a staged changeset
        let token = {
            let mut slot = entry.db.lock().await;
            let db = slot.as_mut().ok_or(BriefcaseError::NotOpen)?;
            db.start_create_changeset()?
        };

        // 4. schema work promotes the change type, whatever the caller said
        let changes_type = if token.contains_schema_changes() {
            ChangesType::Schema
        } else {
            change_type
        };
        let record = NewChangeset {
            id: token.id.clone(),
            parent_id: token.parent_id.clone(),
            briefcase_id: entry.briefcase_id,
            seed_file_id: entry.file_id(),
            file_size: token.size,
            changes_type,
            description: description.to_string(),
        };

        // 5. upload; an id the hub already has means a prior attempt made it
        // through upload and died during reconciliation
        let uploaded = match hub
            .upload_changeset(&entry.imodel_id, &record, &token.path)
            .await
        {
            Ok(authoritative) => Some(authoritative),
            Err(err) => {
                if HubError::kind_of(&err) == Some(HubErrorKind::ChangeSetAlreadyExists) {
                    log::info!(
                        "changeset {} already on the hub - continuing reconciliation",
                        record.id
                    );
                    None
                } else {
                    let mut slot = entry.db.lock().await;
                    if let Some(db) = slot.as_mut() {
                        db.abandon_create_changeset();
                    }
                    return Err(err);
                }
            }
        };

        // the changeset is live on the hub now; it stays on the pending
        // ledger until the local commit below succeeds, so any failure in
        // between leaves a state the next attempt can drain
        {
            let mut slot = entry.db.lock().await;
            let db = slot.as_mut().ok_or(BriefcaseError::NotOpen)?;
            db.add_pending_changeset(&record.id)?;
        }
        let changeset_index = match &uploaded {
            Some(authoritative) => authoritative.index,
            None => hub.changeset_by_id(&entry.imodel_id, &record.id).await?.index,
        };

        // 6. reconcile codes; conflicts are recorded, never fatal
        let codes = {
            let slot = entry.db.lock().await;
            let db = slot.as_ref().ok_or(BriefcaseError::NotOpen)?;
            db.extract_codes()?
        };
        if !codes.is_empty() {
            match hub
                .update_codes(&entry.imodel_id, entry.briefcase_id, &codes, true)
                .await
            {
                Ok(()) => {}
                Err(err) => match HubError::kind_of(&err) {
                    Some(HubErrorKind::ConflictingCodes) => {
                        let denied_codes = HubError::denied_codes_of(&err)
                            .map(|codes| codes.to_vec())
                            .unwrap_or_default();
                        log::warn!(
                            "briefcase {} pushed with {} conflicting codes",
                            entry.key(),
                            denied_codes.len()
                        );
                        entry.set_conflict(CodeConflict {
                            message: format!("{:#}", err),
                            denied_codes,
                        });
                    }
                    // leave the id pending for the next attempt
                    _ => return Err(err),
                },
            }
        }

        if relinquish_codes_locks {
            if let Err(err) = hub
                .delete_all_codes(&entry.imodel_id, entry.briefcase_id)
                .await
            {
                log::warn!("unable to relinquish codes - {:#}", err);
            }
            if let Err(err) = hub
                .delete_all_locks(&entry.imodel_id, entry.briefcase_id)
                .await
            {
                log::warn!("unable to relinquish locks - {:#}", err);
            }
        }

        // 7. commit the staged changeset locally, then clear the ledger
        {
            let mut slot = entry.db.lock().await;
            let db = slot.as_mut().ok_or(BriefcaseError::NotOpen)?;
            db.finish_create_changeset(changeset_index)?;
            db.remove_pending_changeset(&record.id)?;
        }

        // 8. advance the parent pointer (and the key, were it derived)
        self.events.fire_before_version_update(entry);
        let old_key = entry.key();
        entry.set_parent_changeset(record.id.clone(), changeset_index);
        entry.set_target_changeset(record.id.clone(), changeset_index);
        let new_key = entry.key();
        if new_key != old_key {
            self.index.lock().unwrap().rekey(&old_key)?;
        }

        Ok(())
    }

    /// Reconcile codes of changesets a previous push uploaded but never
    /// finished, then clear them from the ledger.
    async fn drain_pending_changesets(&self, entry: &Arc<BriefcaseEntry>) -> Result<()> {
        let hub = self.hub()?.clone();

        let pending = {
            let slot = entry.db.lock().await;
            let db = slot.as_ref().ok_or(BriefcaseError::NotOpen)?;
            db.pending_changesets()
        };

        for changeset_id in pending {
            log::info!(
                "reconciling pending changeset {} of briefcase {}",
                changeset_id,
                entry.key()
            );
            let record = hub.changeset_by_id(&entry.imodel_id, &changeset_id).await?;
            let tokens = self.stage_changesets(&entry.imodel_id, &[record]).await?;
            let token = tokens
                .into_iter()
                .next()
                .ok_or_else(|| format_err!("changeset {} could not be staged", changeset_id))?;

            let codes = {
                let slot = entry.db.lock().await;
                let db = slot.as_ref().ok_or(BriefcaseError::NotOpen)?;
                db.extract_codes_from_file(&token)?
            };

            if !codes.is_empty() {
                match hub
                    .update_codes(&entry.imodel_id, entry.briefcase_id, &codes, true)
                    .await
                {
                    Ok(()) => {}
                    Err(err) => match HubError::kind_of(&err) {
                        Some(HubErrorKind::ConflictingCodes) => {
                            let denied_codes = HubError::denied_codes_of(&err)
                                .map(|codes| codes.to_vec())
                                .unwrap_or_default();
                            entry.set_conflict(CodeConflict {
                                message: format!("{:#}", err),
                                denied_codes,
                            });
                        }
                        _ => return Err(err),
                    },
                }
            }

            let mut slot = entry.db.lock().await;
            let db = slot.as_mut().ok_or(BriefcaseError::NotOpen)?;
            db.remove_pending_changeset(&changeset_id)?;
        }

        Ok(())
    }
}
