use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{bail, format_err, Error, Result};

use crate::hub::{changeset_index_of, ChangesetRecord, HubClient, Version};
use crate::native::{ApplyOption, ChangesetFileToken, NativeDb, OpenMode};
use crate::tools;

use super::{BriefcaseEntry, BriefcaseError, BriefcaseManager};

/// One step of a version move. Steps execute strictly in plan order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct PlanStep {
    pub option: ApplyOption,
    pub to_id: String,
    pub to_index: i64,
}

/// Compute the Reverse/Reinstate/Merge sequence that moves a briefcase from
/// `(parent, reversed?)` to `target`.
pub(crate) fn compute_plan(
    parent: (&str, i64),
    reversed: Option<(&str, i64)>,
    target: (&str, i64),
) -> Vec<PlanStep> {
    let (parent_id, parent_index) = parent;
    let (target_id, target_index) = target;
    let mut steps = Vec::new();

    match reversed {
        Some((_, reversed_index)) => {
            if target_index < reversed_index {
                steps.push(PlanStep {
                    option: ApplyOption::Reverse,
                    to_id: target_id.to_string(),
                    to_index: target_index,
                });
            } else if target_index > reversed_index && target_index <= parent_index {
                steps.push(PlanStep {
                    option: ApplyOption::Reinstate,
                    to_id: target_id.to_string(),
                    to_index: target_index,
                });
            } else if target_index > parent_index {
                steps.push(PlanStep {
                    option: ApplyOption::Reinstate,
                    to_id: parent_id.to_string(),
                    to_index: parent_index,
                });
                steps.push(PlanStep {
                    option: ApplyOption::Merge,
                    to_id: target_id.to_string(),
                    to_index: target_index,
                });
            }
        }
        None => {
            if target_index < parent_index {
                steps.push(PlanStep {
                    option: ApplyOption::Reverse,
                    to_id: target_id.to_string(),
                    to_index: target_index,
                });
            } else if target_index > parent_index {
                steps.push(PlanStep {
                    option: ApplyOption::Merge,
                    to_id: target_id.to_string(),
                    to_index: target_index,
                });
            }
        }
    }

    steps
}

impl BriefcaseManager {
    /// Stage changeset blobs in the shared pool and hand back engine tokens.
    ///
    /// Blobs are deduplicated by file name; already-staged files are not
    /// fetched again.
    pub(crate) async fn stage_changesets(
        &self,
        imodel_id: &str,
        records: &[ChangesetRecord],
    ) -> Result<Vec<ChangesetFileToken>> {
        let dir = self.layout.changeset_dir(imodel_id);
        tools::create_path(&dir)?;

        let missing: Vec<ChangesetRecord> = records
            .iter()
            .filter(|record| !dir.join(&record.file_name).exists())
            .cloned()
            .collect();

        if !missing.is_empty() {
            log::info!(
                "downloading {} changesets for iModel {}",
                missing.len(),
                imodel_id
            );
            self.hub()?
                .download_changesets(imodel_id, &missing, &dir)
                .await?;
        }

        let mut tokens = Vec::with_capacity(records.len());
        for record in records {
            let path = dir.join(&record.file_name);
            let size = std::fs::metadata(&path)
                .map_err(|err| format_err!("staged changeset {:?} missing - {}", path, err))?
                .len();
            tokens.push(ChangesetFileToken {
                id: record.id.clone(),
                parent_id: record.parent_id.clone(),
                path,
                changes_type: record.changes_type,
                size,
            });
        }
        Ok(tokens)
    }

    /// Bring an open briefcase to `target`. Computes and executes the
    /// Reverse/Reinstate/Merge plan; `target == current` is a no-op.
    pub(crate) async fn process_changesets(
        &self,
        entry: &Arc<BriefcaseEntry>,
        target_id: &str,
        target_index: i64,
    ) -> Result<()> {
        if entry.current_changeset_id() == target_id {
            return Ok(());
        }

        let mut slot = entry.db.lock().await;
        if slot.is_none() {
            return Err(BriefcaseError::NotOpen.into());
        }

        // the in-memory parent must agree with the file before we touch it
        let (parent_id, parent_index) = entry.parent_changeset();
        {
            let db = slot.as_ref().unwrap();
            let db_parent = db.parent_changeset_id();
            if db_parent != parent_id {
                bail!(
                    "briefcase {} parent mismatch (memory {:?}, file {:?})",
                    entry.key(),
                    parent_id,
                    db_parent
                );
            }
        }

        let reversed = entry.reversed_changeset();
        let steps = compute_plan(
            (&parent_id, parent_index),
            reversed.as_ref().map(|(id, index)| (id.as_str(), *index)),
            (target_id, target_index),
        );

        let mut index_map = HashMap::new();
        index_map.insert(String::new(), 0);
        index_map.insert(parent_id.clone(), parent_index);
        index_map.insert(target_id.to_string(), target_index);
        if let Some((id, index)) = &reversed {
            index_map.insert(id.clone(), *index);
        }

        for step in steps {
            let result = self
                .apply_step(entry, &mut slot, &step, &mut index_map)
                .await;
            let reconcile = self.reconcile_entry(entry, slot.as_ref(), &index_map).await;
            result?;
            reconcile?;
        }

        self.events.fire_changeset_applied(entry);
        Ok(())
    }

    async fn apply_step(
        &self,
        entry: &Arc<BriefcaseEntry>,
        slot: &mut tokio::sync::MutexGuard<'_, Option<Box<dyn NativeDb>>>,
        step: &PlanStep,
        index_map: &mut HashMap<String, i64>,
    ) -> Result<()> {
        let (after_index, through_index, descending) = match step.option {
            ApplyOption::Merge => (entry.parent_changeset_index(), step.to_index, false),
            ApplyOption::Reverse => (step.to_index, entry.current_changeset_index(), true),
            ApplyOption::Reinstate => (entry.current_changeset_index(), step.to_index, false),
        };

        let mut records = self
            .hub()?
            .changesets_in_range(&entry.imodel_id, after_index, through_index)
            .await?;
        for record in &records {
            index_map.insert(record.id.clone(), record.index);
        }
        if descending {
            records.reverse();
        }

        let tokens = self.stage_changesets(&entry.imodel_id, &records).await?;

        if entry.status() == super::DownloadStatus::DownloadingChangeSets {
            entry.set_status(super::DownloadStatus::ApplyingChangeSets);
        }

        let max_size = tokens.iter().map(|token| token.size).max().unwrap_or(0);
        let contains_schema_changes =
            tokens.iter().any(|token| token.contains_schema_changes());
        let invasive =
            max_size > self.options.async_apply_threshold || contains_schema_changes;

        log::info!(
            "applying {} changesets ({:?}) to briefcase {}{}",
            tokens.len(),
            step.option,
            entry.key(),
            if invasive { " [invasive]" } else { "" }
        );

        if invasive {
            // close, apply to the closed file off-thread, reopen
            self.events.fire_before_close(entry);
            if let Some(db) = slot.take() {
                entry.mark_open(false);
                db.close()?;
            }

            let apply_result = self
                .engine
                .apply_changesets(&entry.pathname, &tokens, step.option)
                .await;

            let reopened = self.engine.open(&entry.pathname, OpenMode::ReadWrite)?;
            **slot = Some(reopened);
            entry.mark_open(true);
            self.events.fire_after_open(entry);

            apply_result?;
        } else {
            for token in &tokens {
                let db = slot
                    .as_mut()
                    .ok_or_else(|| format_err!("briefcase closed during apply"))?;
                db.apply_changeset(token, step.option)?;
                // keep the control plane responsive between changesets
                tokio::task::yield_now().await;
            }
        }

        Ok(())
    }

    /// Re-read the version pointers from the file, which is authoritative
    /// after both successful and partial application.
    async fn reconcile_entry(
        &self,
        entry: &Arc<BriefcaseEntry>,
        db: Option<&Box<dyn NativeDb>>,
        index_map: &HashMap<String, i64>,
    ) -> Result<()> {
        let db = match db {
            Some(db) => db,
            None => return Ok(()),
        };

        let parent_id = db.parent_changeset_id();
        let parent_index = self
            .resolve_changeset_index(&entry.imodel_id, &parent_id, index_map)
            .await?;
        entry.set_parent_changeset(parent_id, parent_index);

        match db.reversed_changeset_id() {
            Some(reversed_id) => {
                let reversed_index = self
                    .resolve_changeset_index(&entry.imodel_id, &reversed_id, index_map)
                    .await?;
                entry.set_reversed_changeset(Some((reversed_id, reversed_index)));
            }
            None => entry.set_reversed_changeset(None),
        }

        Ok(())
    }

    async fn resolve_changeset_index(
        &self,
        imodel_id: &str,
        changeset_id: &str,
        index_map: &HashMap<String, i64>,
    ) -> Result<i64> {
        if let Some(index) = index_map.get(changeset_id) {
            return Ok(*index);
        }
        changeset_index_of(self.hub()?.as_ref(), imodel_id, changeset_id).await
    }

    fn require_writable_and_open(entry: &BriefcaseEntry) -> Result<()> {
        if entry.open_mode != OpenMode::ReadWrite {
            return Err(BriefcaseError::ReadonlyBriefcase.into());
        }
        if !entry.is_open() {
            return Err(BriefcaseError::NotOpen.into());
        }
        Ok(())
    }

    /// Merge remote changesets into a writable briefcase up to `version`.
    pub async fn pull_and_merge_changes(
        &self,
        entry: &Arc<BriefcaseEntry>,
        version: Version,
    ) -> Result<()> {
        Self::require_writable_and_open(entry)?;
        let (target_id, target_index) = version.resolve(self.hub()?.as_ref(), &entry.imodel_id).await?;
        if target_index < entry.current_changeset_index() {
            bail!(
                "cannot pull briefcase {} backwards to index {}",
                entry.key(),
                target_index
            );
        }
        entry.set_target_changeset(target_id.clone(), target_index);
        self.process_changesets(entry, &target_id, target_index).await
    }

    /// Undo merged changesets down to `version`, entering the reversed state.
    pub async fn reverse_changes(
        &self,
        entry: &Arc<BriefcaseEntry>,
        version: Version,
    ) -> Result<()> {
        Self::require_writable_and_open(entry)?;
        let (target_id, target_index) = version.resolve(self.hub()?.as_ref(), &entry.imodel_id).await?;
        if target_index > entry.current_changeset_index() {
            bail!(
                "cannot reverse briefcase {} forward to index {}",
                entry.key(),
                target_index
            );
        }
        self.process_changesets(entry, &target_id, target_index).await
    }

    /// Redo reversed changesets up to `version` (the parent by default).
    pub async fn reinstate_changes(
        &self,
        entry: &Arc<BriefcaseEntry>,
        version: Option<Version>,
    ) -> Result<()> {
        Self::require_writable_and_open(entry)?;
        let (target_id, target_index) = match version {
            Some(version) => {
                version
                    .resolve(self.hub()?.as_ref(), &entry.imodel_id)
                    .await?
            }
            None => entry.parent_changeset(),
        };
        if entry.reversed_changeset().is_none() {
            // nothing reversed - only the no-op target is acceptable
            if target_id != entry.current_changeset_id() {
                bail!("briefcase {} has no reversed changesets", entry.key());
            }
            return Ok(());
        }
        if target_index > entry.parent_changeset_index() {
            bail!(
                "cannot reinstate briefcase {} past its parent",
                entry.key()
            );
        }
        self.process_changesets(entry, &target_id, target_index).await
    }
}
