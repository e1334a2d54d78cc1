//! In-process hub and native engine used by the integration tests.
//!
//! The mock briefcase file is a JSON document; the mock changeset blob is a
//! JSON document with optional padding so tests can control blob sizes.

#![allow(dead_code)]

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::{format_err, Error, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use briefcase_manager::briefcase::BriefcaseId;
use briefcase_manager::hub::{
    CancelToken, ChangesType, ChangesetRecord, Checkpoint, Code, CodeState, HubBriefcaseRecord,
    HubClient, HubError, HubErrorKind, NewChangeset, ProgressCallback,
};
use briefcase_manager::native::{
    ApplyOption, ChangeSetStatus, ChangesetFileToken, NativeDb, NativeEngine, NativeError,
    OpenMode,
};

pub const IMODEL: &str = "imodel-1";
pub const CONTEXT: &str = "context-1";

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

pub fn code(value: &str) -> Code {
    Code {
        spec_id: "spec-1".to_string(),
        scope: "root".to_string(),
        value: value.to_string(),
        state: CodeState::Reserved,
    }
}

// ----- mock briefcase file -------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StagedChangeset {
    pub id: String,
    pub parent_id: String,
    pub path: PathBuf,
    pub schema: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MockDbFile {
    pub db_guid: String,
    pub project_guid: Option<String>,
    pub briefcase_id: u32,
    pub parent_changeset_id: String,
    pub reversed_changeset_id: Option<String>,
    pub pending_changesets: Vec<String>,
    pub txn_count: u32,
    pub txn_schema: bool,
    pub codes: Vec<Code>,
    pub staged: Option<StagedChangeset>,
    pub local_seq: u32,
}

impl MockDbFile {
    pub fn new(db_guid: &str, project_guid: &str, parent_changeset_id: &str) -> Self {
        Self {
            db_guid: db_guid.to_string(),
            project_guid: Some(project_guid.to_string()),
            briefcase_id: 0,
            parent_changeset_id: parent_changeset_id.to_string(),
            reversed_changeset_id: None,
            pending_changesets: Vec::new(),
            txn_count: 0,
            txn_schema: false,
            codes: Vec::new(),
            staged: None,
            local_seq: 0,
        }
    }

    pub fn current_changeset_id(&self) -> String {
        self.reversed_changeset_id
            .clone()
            .unwrap_or_else(|| self.parent_changeset_id.clone())
    }
}

pub fn read_mock_db(path: &Path) -> Result<MockDbFile> {
    let raw = std::fs::read(path)?;
    Ok(serde_json::from_slice(&raw)?)
}

pub fn write_mock_db(path: &Path, state: &MockDbFile) -> Result<()> {
    std::fs::write(path, serde_json::to_vec_pretty(state)?)?;
    Ok(())
}

/// Simulate locally committed transactions on a closed briefcase file.
pub fn add_local_change(path: &Path, code_value: &str, schema: bool) -> Result<()> {
    let mut state = read_mock_db(path)?;
    state.txn_count += 1;
    state.txn_schema = state.txn_schema || schema;
    state.codes.push(code(code_value));
    write_mock_db(path, &state)
}

// ----- mock changeset blob -------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MockChangesetFile {
    pub id: String,
    pub parent_id: String,
    pub schema: bool,
    pub codes: Vec<Code>,
    pub padding: String,
}

fn apply_to_state(
    state: &mut MockDbFile,
    token: &ChangesetFileToken,
    option: ApplyOption,
) -> Result<()> {
    // the blob must be present and intact
    let raw = std::fs::read(&token.path).map_err(|err| {
        Error::new(NativeError::new(
            ChangeSetStatus::CorruptedChangeStream,
            format!("cannot read {:?} - {}", token.path, err),
        ))
    })?;
    let blob: MockChangesetFile = serde_json::from_slice(&raw).map_err(|err| {
        Error::new(NativeError::new(
            ChangeSetStatus::CorruptedChangeStream,
            format!("cannot parse {:?} - {}", token.path, err),
        ))
    })?;
    if blob.id != token.id {
        return Err(Error::new(NativeError::new(
            ChangeSetStatus::InvalidId,
            format!("blob {:?} carries id {}", token.path, blob.id),
        )));
    }

    match option {
        ApplyOption::Merge => {
            if state.reversed_changeset_id.is_some() {
                return Err(Error::new(NativeError::new(
                    ChangeSetStatus::ApplyError,
                    "cannot merge into a reversed briefcase",
                )));
            }
            if state.parent_changeset_id != token.parent_id {
                return Err(Error::new(NativeError::new(
                    ChangeSetStatus::ParentMismatch,
                    format!(
                        "merge of {} expects parent {:?}, file is at {:?}",
                        token.id, token.parent_id, state.parent_changeset_id
                    ),
                )));
            }
            state.parent_changeset_id = token.id.clone();
        }
        ApplyOption::Reverse => {
            let current = state.current_changeset_id();
            if current != token.id {
                return Err(Error::new(NativeError::new(
                    ChangeSetStatus::ParentMismatch,
                    format!("reverse of {} but file is at {:?}", token.id, current),
                )));
            }
            state.reversed_changeset_id = Some(token.parent_id.clone());
        }
        ApplyOption::Reinstate => {
            let current = match &state.reversed_changeset_id {
                Some(id) => id.clone(),
                None => {
                    return Err(Error::new(NativeError::new(
                        ChangeSetStatus::ApplyError,
                        "nothing to reinstate",
                    )))
                }
            };
            if current != token.parent_id {
                return Err(Error::new(NativeError::new(
                    ChangeSetStatus::ParentMismatch,
                    format!(
                        "reinstate of {} expects {:?}, file is at {:?}",
                        token.id, token.parent_id, current
                    ),
                )));
            }
            if token.id == state.parent_changeset_id {
                state.reversed_changeset_id = None;
            } else {
                state.reversed_changeset_id = Some(token.id.clone());
            }
        }
    }
    Ok(())
}

// ----- mock native engine --------------------------------------------------

pub struct MockDb {
    path: PathBuf,
    mode: OpenMode,
    state: MockDbFile,
}

impl NativeDb for MockDb {
    fn parent_changeset_id(&self) -> String {
        self.state.parent_changeset_id.clone()
    }

    fn reversed_changeset_id(&self) -> Option<String> {
        self.state.reversed_changeset_id.clone()
    }

    fn briefcase_id(&self) -> BriefcaseId {
        BriefcaseId(self.state.briefcase_id)
    }

    fn db_guid(&self) -> String {
        self.state.db_guid.clone()
    }

    fn project_guid(&self) -> Option<String> {
        self.state.project_guid.clone()
    }

    fn has_pending_txns(&self) -> bool {
        self.state.txn_count > 0
    }

    fn reset_briefcase_id(&mut self, briefcase_id: BriefcaseId) -> Result<()> {
        self.state.briefcase_id = briefcase_id.0;
        Ok(())
    }

    fn apply_changeset(
        &mut self,
        changeset: &ChangesetFileToken,
        option: ApplyOption,
    ) -> Result<()> {
        apply_to_state(&mut self.state, changeset, option)?;
        write_mock_db(&self.path, &self.state)
    }

    fn start_create_changeset(&mut self) -> Result<ChangesetFileToken> {
        if let Some(staged) = &self.state.staged {
            let size = std::fs::metadata(&staged.path).map(|meta| meta.len()).unwrap_or(0);
            return Ok(ChangesetFileToken {
                id: staged.id.clone(),
                parent_id: staged.parent_id.clone(),
                path: staged.path.clone(),
                changes_type: if staged.schema {
                    ChangesType::Schema
                } else {
                    ChangesType::Regular
                },
                size,
            });
        }
        if self.state.txn_count == 0 {
            return Err(Error::new(NativeError::new(
                ChangeSetStatus::NothingToPush,
                "no local transactions",
            )));
        }
        if self.state.reversed_changeset_id.is_some() {
            return Err(Error::new(NativeError::new(
                ChangeSetStatus::ApplyError,
                "cannot push a reversed briefcase",
            )));
        }

        self.state.local_seq += 1;
        let id = format!("local-{}-{}", self.state.briefcase_id, self.state.local_seq);
        let parent_id = self.state.parent_changeset_id.clone();
        let blob = MockChangesetFile {
            id: id.clone(),
            parent_id: parent_id.clone(),
            schema: self.state.txn_schema,
            codes: self.state.codes.clone(),
            padding: String::new(),
        };
        let path = self
            .path
            .parent()
            .expect("briefcase file has a directory")
            .join(format!("{}.cs", id));
        std::fs::write(&path, serde_json::to_vec(&blob)?)?;
        let size = std::fs::metadata(&path)?.len();

        self.state.staged = Some(StagedChangeset {
            id: id.clone(),
            parent_id: parent_id.clone(),
            path: path.clone(),
            schema: self.state.txn_schema,
        });
        write_mock_db(&self.path, &self.state)?;

        Ok(ChangesetFileToken {
            id,
            parent_id,
            path,
            changes_type: if self.state.txn_schema {
                ChangesType::Schema
            } else {
                ChangesType::Regular
            },
            size,
        })
    }

    fn finish_create_changeset(&mut self, _changeset_index: i64) -> Result<()> {
        let staged = self
            .state
            .staged
            .take()
            .ok_or_else(|| format_err!("no staged changeset"))?;
        self.state.parent_changeset_id = staged.id;
        self.state.txn_count = 0;
        self.state.txn_schema = false;
        self.state.codes.clear();
        write_mock_db(&self.path, &self.state)
    }

    fn abandon_create_changeset(&mut self) {
        if let Some(staged) = self.state.staged.take() {
            let _ = std::fs::remove_file(&staged.path);
        }
        let _ = write_mock_db(&self.path, &self.state);
    }

    fn add_pending_changeset(&mut self, changeset_id: &str) -> Result<()> {
        if !self
            .state
            .pending_changesets
            .iter()
            .any(|id| id == changeset_id)
        {
            self.state.pending_changesets.push(changeset_id.to_string());
        }
        write_mock_db(&self.path, &self.state)
    }

    fn remove_pending_changeset(&mut self, changeset_id: &str) -> Result<()> {
        self.state.pending_changesets.retain(|id| id != changeset_id);
        write_mock_db(&self.path, &self.state)
    }

    fn pending_changesets(&self) -> Vec<String> {
        self.state.pending_changesets.clone()
    }

    fn extract_codes(&self) -> Result<Vec<Code>> {
        Ok(self.state.codes.clone())
    }

    fn extract_codes_from_file(&self, changeset: &ChangesetFileToken) -> Result<Vec<Code>> {
        let raw = std::fs::read(&changeset.path)?;
        let blob: MockChangesetFile = serde_json::from_slice(&raw)?;
        Ok(blob.codes)
    }

    fn close(self: Box<Self>) -> Result<()> {
        if self.mode == OpenMode::ReadWrite {
            write_mock_db(&self.path, &self.state)?;
        }
        Ok(())
    }
}

#[derive(Default)]
pub struct MockEngine {
    pub async_applies: AtomicUsize,
}

impl MockEngine {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn async_apply_count(&self) -> usize {
        self.async_applies.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl NativeEngine for MockEngine {
    fn open(&self, path: &Path, mode: OpenMode) -> Result<Box<dyn NativeDb>> {
        let state = read_mock_db(path)
            .map_err(|err| format_err!("cannot open briefcase {:?} - {}", path, err))?;
        Ok(Box::new(MockDb {
            path: path.to_path_buf(),
            mode,
            state,
        }))
    }

    async fn apply_changesets(
        &self,
        path: &Path,
        changesets: &[ChangesetFileToken],
        option: ApplyOption,
    ) -> Result<()> {
        self.async_applies.fetch_add(1, Ordering::SeqCst);
        let mut state = read_mock_db(path)?;
        for token in changesets {
            apply_to_state(&mut state, token, option)?;
        }
        write_mock_db(path, &state)
    }
}

// ----- mock hub ------------------------------------------------------------

pub struct HubState {
    pub changesets: Vec<ChangesetRecord>,
    pub changeset_blobs: HashMap<String, Vec<u8>>,
    pub checkpoints: Vec<(Checkpoint, Vec<u8>)>,
    pub named_versions: HashMap<String, String>,
    pub briefcases: Vec<HubBriefcaseRecord>,
    pub next_briefcase_id: u32,
    pub released: Vec<BriefcaseId>,
    pub reserved_code_values: Vec<String>,
    pub accepted_codes: Vec<Code>,

    pub checkpoint_downloads: usize,
    pub checkpoint_delay_ms: u64,
    pub briefcase_creates: usize,
    pub upload_attempts: usize,
    pub fail_uploads: usize,
    pub code_deletes: usize,
    pub lock_deletes: usize,
}

impl Default for HubState {
    fn default() -> Self {
        Self {
            changesets: Vec::new(),
            changeset_blobs: HashMap::new(),
            checkpoints: Vec::new(),
            named_versions: HashMap::new(),
            briefcases: Vec::new(),
            next_briefcase_id: 2,
            released: Vec::new(),
            reserved_code_values: Vec::new(),
            accepted_codes: Vec::new(),
            checkpoint_downloads: 0,
            checkpoint_delay_ms: 0,
            briefcase_creates: 0,
            upload_attempts: 0,
            fail_uploads: 0,
            code_deletes: 0,
            lock_deletes: 0,
        }
    }
}

pub struct MockHub {
    pub state: Mutex<HubState>,
}

impl MockHub {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(HubState::default()),
        })
    }

    /// Append a changeset to the chain and store its blob.
    pub fn seed_changeset(&self, id: &str, schema: bool, padding: usize, codes: Vec<Code>) {
        let mut state = self.state.lock().unwrap();
        let parent_id = state
            .changesets
            .last()
            .map(|record| record.id.clone())
            .unwrap_or_default();
        let index = state.changesets.len() as i64 + 1;

        let blob = MockChangesetFile {
            id: id.to_string(),
            parent_id: parent_id.clone(),
            schema,
            codes,
            padding: "x".repeat(padding),
        };
        let raw = serde_json::to_vec(&blob).unwrap();
        let file_name = format!("{}.cs", id);

        state.changesets.push(ChangesetRecord {
            id: id.to_string(),
            index,
            parent_id,
            file_name: file_name.clone(),
            file_size: raw.len() as u64,
            changes_type: if schema {
                ChangesType::Schema
            } else {
                ChangesType::Regular
            },
            description: format!("changeset {}", id),
            briefcase_id: BriefcaseId(2),
        });
        state.changeset_blobs.insert(file_name, raw);
    }

    /// Register a checkpoint sealed at the current head of the chain.
    pub fn seed_checkpoint(&self) {
        let mut state = self.state.lock().unwrap();
        let (merged_id, merged_index) = state
            .changesets
            .last()
            .map(|record| (record.id.clone(), record.index))
            .unwrap_or_default();

        let content = MockDbFile::new(IMODEL, CONTEXT, &merged_id);
        let raw = serde_json::to_vec_pretty(&content).unwrap();

        let checkpoint = Checkpoint {
            merged_changeset_id: merged_id.clone(),
            merged_changeset_index: merged_index,
            file_id: format!("checkpoint-{}", merged_index),
            file_size: raw.len() as u64,
            download_url: format!("mock://checkpoints/{}", merged_index),
        };
        state.checkpoints.push((checkpoint, raw));
    }

    pub fn seed_named_version(&self, name: &str, changeset_id: &str) {
        self.state
            .lock()
            .unwrap()
            .named_versions
            .insert(name.to_string(), changeset_id.to_string());
    }

    /// Make the next `count` uploads fail with `AnotherUserPushing`.
    pub fn fail_next_uploads(&self, count: usize) {
        self.state.lock().unwrap().fail_uploads = count;
    }

    /// Reserve a code value for somebody else, provoking push conflicts.
    pub fn reserve_code_value(&self, value: &str) {
        self.state
            .lock()
            .unwrap()
            .reserved_code_values
            .push(value.to_string());
    }

    pub fn checkpoint_downloads(&self) -> usize {
        self.state.lock().unwrap().checkpoint_downloads
    }

    pub fn briefcase_creates(&self) -> usize {
        self.state.lock().unwrap().briefcase_creates
    }

    pub fn upload_attempts(&self) -> usize {
        self.state.lock().unwrap().upload_attempts
    }

    pub fn released_briefcases(&self) -> Vec<BriefcaseId> {
        self.state.lock().unwrap().released.clone()
    }

    pub fn latest_id(&self) -> String {
        self.state
            .lock()
            .unwrap()
            .changesets
            .last()
            .map(|record| record.id.clone())
            .unwrap_or_default()
    }

    fn find_changeset(&self, changeset_id: &str) -> Result<ChangesetRecord> {
        self.state
            .lock()
            .unwrap()
            .changesets
            .iter()
            .find(|record| record.id == changeset_id)
            .cloned()
            .ok_or_else(|| {
                Error::new(HubError::new(
                    HubErrorKind::NotFound,
                    format!("changeset {:?} unknown", changeset_id),
                ))
            })
    }
}

#[async_trait]
impl HubClient for MockHub {
    async fn changeset_by_id(
        &self,
        _imodel_id: &str,
        changeset_id: &str,
    ) -> Result<ChangesetRecord> {
        self.find_changeset(changeset_id)
    }

    async fn latest_changeset(&self, _imodel_id: &str) -> Result<Option<ChangesetRecord>> {
        Ok(self.state.lock().unwrap().changesets.last().cloned())
    }

    async fn changeset_for_version_name(
        &self,
        _imodel_id: &str,
        version_name: &str,
    ) -> Result<ChangesetRecord> {
        let changeset_id = self
            .state
            .lock()
            .unwrap()
            .named_versions
            .get(version_name)
            .cloned()
            .ok_or_else(|| {
                Error::new(HubError::new(
                    HubErrorKind::VersionNotFound,
                    format!("no version named {:?}", version_name),
                ))
            })?;
        self.find_changeset(&changeset_id)
    }

    async fn changesets_in_range(
        &self,
        _imodel_id: &str,
        after_index: i64,
        through_index: i64,
    ) -> Result<Vec<ChangesetRecord>> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .changesets
            .iter()
            .filter(|record| record.index > after_index && record.index <= through_index)
            .cloned()
            .collect())
    }

    async fn download_changesets(
        &self,
        _imodel_id: &str,
        records: &[ChangesetRecord],
        dir: &Path,
    ) -> Result<()> {
        let state = self.state.lock().unwrap();
        for record in records {
            let raw = state.changeset_blobs.get(&record.file_name).ok_or_else(|| {
                Error::new(HubError::new(
                    HubErrorKind::NotFound,
                    format!("no blob for {:?}", record.file_name),
                ))
            })?;
            std::fs::write(dir.join(&record.file_name), raw)?;
        }
        Ok(())
    }

    async fn upload_changeset(
        &self,
        _imodel_id: &str,
        record: &NewChangeset,
        file: &Path,
    ) -> Result<ChangesetRecord> {
        let mut state = self.state.lock().unwrap();
        state.upload_attempts += 1;

        if state.fail_uploads > 0 {
            state.fail_uploads -= 1;
            return Err(Error::new(HubError::new(
                HubErrorKind::AnotherUserPushing,
                "another user is pushing",
            )));
        }
        if state.changesets.iter().any(|known| known.id == record.id) {
            return Err(Error::new(HubError::new(
                HubErrorKind::ChangeSetAlreadyExists,
                format!("changeset {:?} already uploaded", record.id),
            )));
        }

        let raw = std::fs::read(file)?;
        let index = state.changesets.len() as i64 + 1;
        let file_name = format!("{}.cs", record.id);
        let authoritative = ChangesetRecord {
            id: record.id.clone(),
            index,
            parent_id: record.parent_id.clone(),
            file_name: file_name.clone(),
            file_size: raw.len() as u64,
            changes_type: record.changes_type,
            description: record.description.clone(),
            briefcase_id: record.briefcase_id,
        };
        state.changesets.push(authoritative.clone());
        state.changeset_blobs.insert(file_name, raw);
        Ok(authoritative)
    }

    async fn preceding_checkpoint(
        &self,
        _imodel_id: &str,
        changeset_index: i64,
    ) -> Result<Option<Checkpoint>> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .checkpoints
            .iter()
            .filter(|(checkpoint, _)| checkpoint.merged_changeset_index <= changeset_index)
            .max_by_key(|(checkpoint, _)| checkpoint.merged_changeset_index)
            .map(|(checkpoint, _)| checkpoint.clone()))
    }

    async fn download_checkpoint(
        &self,
        _imodel_id: &str,
        checkpoint: &Checkpoint,
        path: &Path,
        progress: &ProgressCallback,
        cancel: &CancelToken,
    ) -> Result<()> {
        let (raw, delay_ms) = {
            let state = self.state.lock().unwrap();
            let raw = state
                .checkpoints
                .iter()
                .find(|(known, _)| known.file_id == checkpoint.file_id)
                .map(|(_, raw)| raw.clone())
                .ok_or_else(|| {
                    Error::new(HubError::new(
                        HubErrorKind::NotFound,
                        "unknown checkpoint",
                    ))
                })?;
            (raw, state.checkpoint_delay_ms)
        };

        progress(briefcase_manager::hub::DownloadProgress {
            loaded: 0,
            total: Some(raw.len() as u64),
        });

        if delay_ms > 0 {
            tokio::time::sleep(std::time::Duration::from_millis(delay_ms)).await;
        }
        if cancel.is_cancelled() {
            return Err(Error::new(HubError::new(
                HubErrorKind::UserCancelled,
                "checkpoint download cancelled",
            )));
        }

        // partials never surface under the final name
        let tmp_path = path.with_extension("tmp");
        std::fs::write(&tmp_path, &raw)?;
        std::fs::rename(&tmp_path, path)?;

        progress(briefcase_manager::hub::DownloadProgress {
            loaded: raw.len() as u64,
            total: Some(raw.len() as u64),
        });

        self.state.lock().unwrap().checkpoint_downloads += 1;
        Ok(())
    }

    async fn my_briefcases(&self, _imodel_id: &str) -> Result<Vec<HubBriefcaseRecord>> {
        Ok(self.state.lock().unwrap().briefcases.clone())
    }

    async fn acquire_briefcase(&self, _imodel_id: &str) -> Result<HubBriefcaseRecord> {
        let mut state = self.state.lock().unwrap();
        let briefcase_id = BriefcaseId(state.next_briefcase_id);
        state.next_briefcase_id += 1;
        state.briefcase_creates += 1;
        let record = HubBriefcaseRecord {
            briefcase_id,
            file_id: Some(format!("seed-{}", briefcase_id)),
        };
        state.briefcases.push(record.clone());
        Ok(record)
    }

    async fn release_briefcase(&self, _imodel_id: &str, briefcase_id: BriefcaseId) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state
            .briefcases
            .retain(|record| record.briefcase_id != briefcase_id);
        state.released.push(briefcase_id);
        Ok(())
    }

    async fn briefcase_file_id(
        &self,
        _imodel_id: &str,
        briefcase_id: BriefcaseId,
    ) -> Result<Option<String>> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .briefcases
            .iter()
            .find(|record| record.briefcase_id == briefcase_id)
            .and_then(|record| record.file_id.clone()))
    }

    async fn update_codes(
        &self,
        _imodel_id: &str,
        _briefcase_id: BriefcaseId,
        codes: &[Code],
        continue_on_conflict: bool,
    ) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let denied: Vec<Code> = codes
            .iter()
            .filter(|code| state.reserved_code_values.contains(&code.value))
            .cloned()
            .collect();

        if denied.is_empty() {
            state.accepted_codes.extend(codes.iter().cloned());
            return Ok(());
        }
        if continue_on_conflict {
            let accepted: Vec<Code> = codes
                .iter()
                .filter(|code| !state.reserved_code_values.contains(&code.value))
                .cloned()
                .collect();
            state.accepted_codes.extend(accepted);
        }
        Err(Error::new(HubError::conflicting_codes(
            format!("{} codes denied", denied.len()),
            denied,
        )))
    }

    async fn delete_all_codes(&self, _imodel_id: &str, _briefcase_id: BriefcaseId) -> Result<()> {
        self.state.lock().unwrap().code_deletes += 1;
        Ok(())
    }

    async fn delete_all_locks(&self, _imodel_id: &str, _briefcase_id: BriefcaseId) -> Result<()> {
        self.state.lock().unwrap().lock_deletes += 1;
        Ok(())
    }

    async fn create_imodel(&self, _context_id: &str, name: &str) -> Result<String> {
        Ok(format!("imodel-{}", name))
    }
}
