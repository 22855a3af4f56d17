//! The replicated record store.
//!
//! A `Store` owns the in-memory histories for one canonical JSON file and implements the
//! replication protocol around it:
//!
//! - the master machine rewrites the canonical file (`store`)
//! - every other machine drops one change file per edited record into `Changes/`
//!   (`create_change_files`)
//! - `merge_changes` folds change files back in; the master also garbage-collects them once they
//!   are older than [`change::SETTLE_WINDOW`]
//! - `reload` reconciles memory with whatever other replicas did in the meantime
//!
//! Flags live beside the change files. They are plain text and may be rewritten by any replica at
//! any time, so they are re-read on every use.

use crate::core::change::{self, CHANGES_DIR};
use crate::core::codec;
use crate::core::config::{self, StoreOptions};
use crate::core::error::CairnError;
use crate::core::flag::FlagFile;
use crate::core::fsio;
use crate::core::history::RecordHistory;
use crate::core::identity::Identity;
use crate::core::record::Record;
use crate::core::sync::SyncContext;
use crate::core::time;
use chrono::{DateTime, Utc};
use rustc_hash::{FxHashMap, FxHashSet};
use serde::Serialize;
use serde_json::Value as JsonValue;
use std::collections::hash_map::Entry;
use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

pub const BACKUP_DIR: &str = "Backup";

/// What `reload` had to do to bring memory up to date.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReloadOutcome {
    Unchanged,
    /// The master published a newer canonical file; local edits were saved first.
    PulledMaster,
    /// Change files from other machines were merged.
    MergedChanges,
    /// Nothing new arrived but local edits were flushed.
    SavedLocal,
}

impl ReloadOutcome {
    pub fn is_reloaded(&self) -> bool {
        !matches!(self, ReloadOutcome::Unchanged)
    }
}

impl fmt::Display for ReloadOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ReloadOutcome::Unchanged => "unchanged",
            ReloadOutcome::PulledMaster => "pulled master",
            ReloadOutcome::MergedChanges => "merged changes",
            ReloadOutcome::SavedLocal => "saved local",
        };
        f.write_str(s)
    }
}

/// Where `save` put the pending edits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "target")]
pub enum SaveOutcome {
    /// Master path: the canonical file was (or did not need to be) rewritten.
    Stored { written: bool },
    /// Non-master path: this many change files were emitted.
    ChangeFiles { written: usize },
}

/// Point-in-time view of the replication state, for status displays.
#[derive(Debug, Clone, Serialize)]
pub struct StoreStatus {
    pub path: PathBuf,
    pub machine: String,
    pub is_master: bool,
    pub master_owner: Option<String>,
    pub master_time: Option<String>,
    pub process_time: Option<String>,
    pub keys: usize,
    pub dirty_keys: Vec<String>,
    pub pending_changes: usize,
    pub foreign_changes: bool,
    pub read_only: bool,
    pub unflagged: bool,
}

/// Sets the shared "persisting" indicator for as long as it lives.
struct PersistingGuard(Arc<AtomicBool>);

impl PersistingGuard {
    fn engage(flag: &Arc<AtomicBool>) -> Self {
        flag.store(true, Ordering::SeqCst);
        Self(Arc::clone(flag))
    }
}

impl Drop for PersistingGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

#[derive(Debug)]
pub struct Store {
    path: PathBuf,
    change_dir: PathBuf,
    options: StoreOptions,
    identity: Identity,
    sync: SyncContext,
    histories: FxHashMap<String, RecordHistory>,
    persisting: Arc<AtomicBool>,
    /// Loads leave the process flag alone.
    undercover: bool,
}

impl Store {
    fn build(
        path: PathBuf,
        options: StoreOptions,
        identity: Identity,
        sync: SyncContext,
    ) -> Result<Self, CairnError> {
        options.validate()?;
        let dir = path.parent().map(Path::to_path_buf).unwrap_or_default();
        Ok(Self {
            change_dir: dir.join(CHANGES_DIR),
            path,
            options,
            identity,
            sync,
            histories: FxHashMap::default(),
            persisting: Arc::new(AtomicBool::new(false)),
            undercover: false,
        })
    }

    /// Open the store backed by `path`.
    ///
    /// With `autoload` the canonical file is read when it exists and pending change files are
    /// merged right away, which also settles mastership for a fresh directory.
    pub fn open(
        path: impl AsRef<Path>,
        options: StoreOptions,
        identity: Identity,
        sync: SyncContext,
    ) -> Result<Self, CairnError> {
        let mut store = Self::build(path.as_ref().to_path_buf(), options, identity, sync)?;
        if store.options.autoload {
            if store.path.exists() {
                store.load()?;
            }
            store.merge_changes()?;
        }
        tracing::debug!(
            path = %store.path.display(),
            machine = %store.identity.machine,
            records = store.histories.len(),
            "store opened"
        );
        Ok(store)
    }

    /// Open with options from `cairn.toml` beside the file, the detected identity and the
    /// process-wide locks.
    pub fn open_with_defaults(path: impl AsRef<Path>) -> Result<Self, CairnError> {
        let path = path.as_ref();
        let dir = path.parent().unwrap_or_else(|| Path::new(""));
        let options = config::load_options(dir)?;
        Self::open(path, options, Identity::detect(), SyncContext::global())
    }

    /// Open, run `f`, then save whatever `f` left dirty.
    ///
    /// The save runs even when `f` fails; the closure's error takes precedence over a save error.
    pub fn session<R, F>(
        path: impl AsRef<Path>,
        options: StoreOptions,
        identity: Identity,
        sync: SyncContext,
        f: F,
    ) -> Result<R, CairnError>
    where
        F: FnOnce(&mut Store) -> Result<R, CairnError>,
    {
        let mut store = Self::open(path, options, identity, sync)?;
        let result = f(&mut store);
        let flushed = if store.options.read_only {
            Ok(())
        } else {
            store.save(None, false).map(|_| ())
        };
        match (result, flushed) {
            (Ok(value), Ok(())) => Ok(value),
            (Ok(_), Err(e)) => Err(e),
            (Err(e), Ok(())) => Err(e),
            (Err(e), Err(flush)) => {
                tracing::warn!(
                    error = %flush,
                    path = %store.path.display(),
                    "save after failed session also failed"
                );
                Err(e)
            }
        }
    }

    /// Throwaway read-only copy of what is currently on disk.
    fn comparison(&self) -> Result<Store, CairnError> {
        let mut disk = Self::build(
            self.path.clone(),
            self.options.comparison(),
            self.identity.clone(),
            self.sync.clone(),
        )?;
        disk.undercover = true;
        if disk.path.exists() {
            disk.load()?;
        }
        Ok(disk)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn change_dir(&self) -> &Path {
        &self.change_dir
    }

    /// Directory holding the canonical file, attachments and `Changes/`.
    pub fn dir(&self) -> &Path {
        self.path.parent().unwrap_or_else(|| Path::new(""))
    }

    pub fn options(&self) -> &StoreOptions {
        &self.options
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    pub fn is_persisting(&self) -> bool {
        self.persisting.load(Ordering::SeqCst)
    }

    /// Shared handle to the persisting indicator, for observers on other threads.
    pub fn persisting_indicator(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.persisting)
    }

    fn fold(&self, key: &str) -> String {
        if self.options.ignore_case {
            key.to_lowercase()
        } else {
            key.to_string()
        }
    }

    fn flag_seed(&self) -> DateTime<Utc> {
        self.latest_modified().unwrap_or_else(time::epoch)
    }

    /// The master flag. Writable stores claim it when unowned.
    pub fn master_flag(&self) -> Result<FlagFile, CairnError> {
        if self.options.read_only {
            return Ok(FlagFile::master_unclaimed(
                &self.change_dir,
                &self.identity,
                &self.sync,
            ));
        }
        FlagFile::master(&self.change_dir, &self.identity, &self.sync, self.flag_seed())
    }

    pub fn process_flag(&self) -> Result<FlagFile, CairnError> {
        FlagFile::process(&self.change_dir, &self.identity, &self.sync, self.flag_seed())
    }

    // ---- persistence -------------------------------------------------------------------------

    /// Replace memory with the canonical file and stamp the process flag.
    pub fn load(&mut self) -> Result<usize, CairnError> {
        let undercover = self.undercover;
        self.load_with(undercover)
    }

    /// Like [`Store::load`]; with `undercover` the process flag is left untouched.
    pub fn load_with(&mut self, undercover: bool) -> Result<usize, CairnError> {
        let _persisting = PersistingGuard::engage(&self.persisting);
        let count = self.ingest()?;
        if !(undercover || self.options.unflagged) {
            let seed = self.flag_seed();
            self.process_flag()?.update(Some(seed), None)?;
        }
        tracing::info!(
            path = %self.path.display(),
            records = count,
            keys = self.histories.len(),
            "loaded"
        );
        Ok(count)
    }

    fn ingest(&mut self) -> Result<usize, CairnError> {
        if !self.path.exists() {
            tracing::debug!(path = %self.path.display(), "no canonical file to load");
            return Ok(0);
        }
        let text = fs::read_to_string(&self.path)?;
        let stacks = codec::decode(&text)?;
        let mut histories: FxHashMap<String, RecordHistory> = FxHashMap::default();
        let mut count = 0;
        for stack in stacks {
            let Some(name) = stack.last().map(|r| r.name().to_string()) else {
                continue;
            };
            let key = self.fold(&name);
            if let Some(stray) = stack.iter().find(|r| self.fold(r.name()) != key) {
                return Err(CairnError::FormatError(format!(
                    "history for '{}' contains a record named '{}'",
                    name,
                    stray.name()
                )));
            }
            count += stack.len();
            let incoming = RecordHistory::from_snapshots(
                name,
                stack,
                self.options.max_count,
                self.options.sharpness_ticks,
            );
            match histories.entry(key) {
                Entry::Occupied(mut e) => {
                    e.get_mut().merge(&incoming);
                    e.get_mut().validate();
                }
                Entry::Vacant(e) => {
                    e.insert(incoming);
                }
            }
        }
        self.histories = histories;
        Ok(count)
    }

    /// Rewrite the canonical file from memory. Returns whether anything was written.
    ///
    /// Without `force` a clean store writes nothing. An empty record set never replaces an
    /// existing file.
    pub fn store(&mut self, force: bool) -> Result<bool, CairnError> {
        if !force && !self.is_dirty() {
            return Ok(false);
        }
        if self.options.read_only {
            return Err(CairnError::IllegalWrite(format!(
                "{} is opened read-only",
                self.path.display()
            )));
        }
        let _persisting = PersistingGuard::engage(&self.persisting);
        let Some(stamp) = self.latest_modified() else {
            if self.path.exists() {
                return Err(CairnError::EmptyOverwrite(self.path.clone()));
            }
            return Ok(false);
        };
        let text = codec::encode(self.sorted_histories(), self.options.pretty)?;
        if self.options.backup && self.path.exists() {
            self.backup_canonical()?;
        }
        fsio::atomic_write(&self.path, text.as_bytes())?;
        fsio::set_modified(&self.path, &stamp)?;
        if !self.options.unflagged {
            self.master_flag()?.update(Some(stamp), None)?;
            self.process_flag()?.update(Some(stamp), None)?;
        }
        for history in self.histories.values_mut() {
            history.validate();
        }
        tracing::info!(
            path = %self.path.display(),
            keys = self.histories.len(),
            stamp = %time::format_iso(&stamp),
            "stored canonical file"
        );
        Ok(true)
    }

    fn sorted_histories(&self) -> Vec<&RecordHistory> {
        let mut sorted: Vec<&RecordHistory> =
            self.histories.values().filter(|h| !h.is_empty()).collect();
        sorted.sort_by(|a, b| a.key().cmp(b.key()));
        sorted
    }

    fn backup_canonical(&self) -> Result<PathBuf, CairnError> {
        let stem = self
            .path
            .file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_default();
        let dir = self.dir().join(BACKUP_DIR);
        fs::create_dir_all(&dir)?;
        let target = dir.join(format!("{}_{}.json", stem, time::to_ticks(&time::now())));
        fs::copy(&self.path, &target)?;
        tracing::debug!(backup = %target.display(), "backed up canonical file");
        Ok(target)
    }

    /// Emit a change file for every record whose newest version is newer than the disk copy.
    pub fn create_change_files(&mut self) -> Result<usize, CairnError> {
        if self.options.read_only {
            return Err(CairnError::IllegalWrite(format!(
                "{} is opened read-only",
                self.path.display()
            )));
        }
        let disk = self.comparison()?;
        let mut written = 0;
        for (key, history) in &self.histories {
            let Some(top) = history.peek(None) else {
                continue;
            };
            let on_disk = disk.histories.get(key).and_then(|h| h.peek(None));
            if on_disk.is_some_and(|d| d.modified_ticks() >= top.modified_ticks()) {
                continue;
            }
            if let Some(path) = change::write(
                &self.change_dir,
                top,
                &self.identity.machine,
                self.options.pretty,
            )? {
                tracing::debug!(
                    change = %path.display(),
                    record = %top.name(),
                    "wrote change file"
                );
                written += 1;
            }
        }
        for history in self.histories.values_mut() {
            history.validate();
        }
        if written > 0 {
            tracing::info!(
                changes = written,
                dir = %self.change_dir.display(),
                "emitted change files"
            );
        }
        Ok(written)
    }

    /// Write one change file for `record`, attributed to `machine` or to this machine.
    pub fn create_change_file(
        &self,
        record: &Record,
        machine: Option<&str>,
    ) -> Result<Option<PathBuf>, CairnError> {
        if self.options.read_only {
            return Err(CairnError::IllegalWrite(format!(
                "{} is opened read-only",
                self.path.display()
            )));
        }
        let machine = machine.unwrap_or(&self.identity.machine);
        change::write(&self.change_dir, record, machine, self.options.pretty)
    }

    /// Persist pending edits: the master stores, everybody else emits change files.
    ///
    /// `backup` overrides the configured backup setting for this and later saves.
    pub fn save(&mut self, backup: Option<bool>, force: bool) -> Result<SaveOutcome, CairnError> {
        if let Some(backup) = backup {
            self.options.backup = backup;
        }
        if self.options.read_only {
            return Err(CairnError::IllegalWrite(format!(
                "{} is opened read-only",
                self.path.display()
            )));
        }
        let sync = self.sync.clone();
        let _guard = sync.lock_save()?;
        if self.running_on_master()? {
            let written = self.store(force)?;
            Ok(SaveOutcome::Stored { written })
        } else {
            let written = self.create_change_files()?;
            Ok(SaveOutcome::ChangeFiles { written })
        }
    }

    /// Fold pending change files into memory, newest first. Returns how many versions were new.
    ///
    /// On the master, files older than the settle window are deleted and the result is stored.
    pub fn merge_changes(&mut self) -> Result<usize, CairnError> {
        let changes = change::list(&self.change_dir)?;
        let writable = !self.options.read_only;
        let is_master = writable && self.running_on_master()?;
        let mut seen: FxHashSet<String> = FxHashSet::default();
        let mut merged = 0;
        for change_file in &changes {
            match change_file.read() {
                Ok(records) => {
                    for record in records {
                        let key = self.fold(record.name());
                        if !seen.insert(key.clone()) {
                            continue;
                        }
                        if self.merge_record(key, record, is_master) {
                            merged += 1;
                        }
                    }
                }
                Err(CairnError::IoError(e)) if e.kind() == io::ErrorKind::NotFound => {
                    tracing::debug!(
                        change = %change_file.path.display(),
                        "change file already collected"
                    );
                    continue;
                }
                Err(e) => {
                    tracing::warn!(
                        change = %change_file.path.display(),
                        error = %e,
                        "skipping unreadable change file"
                    );
                }
            }
            if is_master && change::collect_settled(change_file)? {
                tracing::debug!(
                    change = %change_file.path.display(),
                    "removed settled change file"
                );
            }
        }
        if merged > 0 {
            tracing::info!(
                merged,
                files = changes.len(),
                master = is_master,
                "merged change files"
            );
        }
        if is_master {
            self.store(false)?;
        }
        Ok(merged)
    }

    fn merge_record(&mut self, key: String, record: Record, is_master: bool) -> bool {
        let max_count = self.options.max_count;
        let sharpness = self.options.sharpness_ticks;
        let history = self
            .histories
            .entry(key)
            .or_insert_with(|| RecordHistory::new(record.name(), max_count, sharpness));
        if history.contains(&record) {
            return false;
        }
        let was_dirty = history.is_dirty();
        let name = record.name().to_string();
        let incoming = RecordHistory::from_snapshots(name, vec![record], max_count, sharpness);
        history.merge(&incoming);
        // Non-masters only mirror the change file; persisting the merge is the master's job.
        if !is_master && !was_dirty {
            history.validate();
        }
        true
    }

    /// Bring memory up to date with the other replicas.
    ///
    /// 1. A newer master stamp than this machine's process stamp means the canonical file moved:
    ///    local edits are saved first, then the file is reloaded and pending change files are
    ///    re-applied. On the master itself this is a [`CairnError::ConsistencyViolation`].
    /// 2. Otherwise foreign change files are merged.
    /// 3. Otherwise pending local edits are saved.
    pub fn reload(&mut self) -> Result<ReloadOutcome, CairnError> {
        let writable = !self.options.read_only;
        let outcome = if self.master_updates_available()? {
            if writable && self.running_on_master()? {
                return Err(CairnError::ConsistencyViolation(format!(
                    "master flag for {} moved while {} holds mastership",
                    self.path.display(),
                    self.identity.machine
                )));
            }
            if writable {
                self.save(None, false)?;
            }
            self.load()?;
            // Pending change files, our own included, are not in the canonical file yet.
            self.merge_changes()?;
            ReloadOutcome::PulledMaster
        } else if self.foreign_changes_available()? {
            self.merge_changes()?;
            ReloadOutcome::MergedChanges
        } else if writable && self.is_dirty() {
            self.save(None, false)?;
            ReloadOutcome::SavedLocal
        } else {
            ReloadOutcome::Unchanged
        };
        tracing::debug!(path = %self.path.display(), outcome = %outcome, "reload");
        Ok(outcome)
    }

    // ---- mastership and flags ----------------------------------------------------------------

    pub fn running_on_master(&self) -> Result<bool, CairnError> {
        if self.options.unflagged {
            return Ok(true);
        }
        Ok(self.master_flag()?.owner()? == self.identity.machine)
    }

    /// Take mastership for this machine. Returns the previous owner.
    ///
    /// Newer canonical content is pulled first so the new master starts from the latest file;
    /// pending change files are then merged and stored under the new ownership.
    pub fn claim_master(&mut self) -> Result<String, CairnError> {
        if self.options.read_only {
            return Err(CairnError::IllegalWrite(
                "a read-only store cannot become master".to_string(),
            ));
        }
        if self.options.unflagged {
            return Ok(self.identity.machine.clone());
        }
        let previous = self.master_flag()?.owner()?;
        if previous == self.identity.machine {
            return Ok(previous);
        }
        if self.master_updates_available()? {
            self.save(None, false)?;
            self.load()?;
        }
        let flag = self.master_flag()?;
        let stamp = flag.time()?;
        flag.update(Some(stamp), Some(&self.identity.machine))?;
        self.process_flag()?.update(Some(stamp), None)?;
        tracing::info!(
            previous = %previous,
            machine = %self.identity.machine,
            "claimed mastership"
        );
        self.merge_changes()?;
        Ok(previous)
    }

    /// The canonical file was rewritten after this machine last loaded or stored it.
    pub fn master_updates_available(&self) -> Result<bool, CairnError> {
        if self.options.unflagged {
            return Ok(false);
        }
        let master = time::to_ticks(&self.master_flag()?.time()?);
        let process = time::to_ticks(&self.process_flag()?.time()?);
        Ok(master > process)
    }

    /// Change files written by other machines are waiting in `Changes/`.
    pub fn foreign_changes_available(&self) -> Result<bool, CairnError> {
        Ok(change::list(&self.change_dir)?
            .iter()
            .any(|c| !c.name.authored_by(&self.identity.machine)))
    }

    /// The canonical file is newer than anything in memory.
    pub fn file_changed_on_disk(&self) -> Result<bool, CairnError> {
        if !self.path.exists() {
            return Ok(false);
        }
        let on_disk = time::to_ticks(&fsio::modified_time(&self.path)?);
        Ok(match self.latest_modified() {
            Some(latest) => on_disk > time::to_ticks(&latest),
            None => true,
        })
    }

    pub fn status(&self) -> Result<StoreStatus, CairnError> {
        let (master_owner, master_time, process_time) = if self.options.unflagged {
            (None, None, None)
        } else {
            let master = self.master_flag()?;
            let process = self.process_flag()?;
            (
                Some(master.owner()?),
                Some(time::format_iso(&master.time()?)),
                Some(time::format_iso(&process.time()?)),
            )
        };
        Ok(StoreStatus {
            path: self.path.clone(),
            machine: self.identity.machine.clone(),
            is_master: self.running_on_master()?,
            master_owner,
            master_time,
            process_time,
            keys: self.histories.len(),
            dirty_keys: self.dirty_keys(),
            pending_changes: change::list(&self.change_dir)?.len(),
            foreign_changes: self.foreign_changes_available()?,
            read_only: self.options.read_only,
            unflagged: self.options.unflagged,
        })
    }

    // ---- queries -----------------------------------------------------------------------------

    /// Newest `Modified` across the current version of every key.
    pub fn latest_modified(&self) -> Option<DateTime<Utc>> {
        self.histories
            .values()
            .filter_map(|h| h.peek(None))
            .map(|r| r.modified())
            .max()
    }

    /// Current version of `key`, hiding tombstones.
    pub fn get(&self, key: &str) -> Option<&Record> {
        self.get_with_deleted(key).filter(|r| !r.deleted())
    }

    pub fn get_with_deleted(&self, key: &str) -> Option<&Record> {
        self.histories.get(&self.fold(key)).and_then(|h| h.peek(None))
    }

    pub fn contains(&self, key: &str, with_deleted: bool) -> bool {
        if with_deleted {
            self.get_with_deleted(key).is_some()
        } else {
            self.get(key).is_some()
        }
    }

    pub fn history(&self, key: &str) -> Option<&RecordHistory> {
        self.histories.get(&self.fold(key))
    }

    /// Record names, sorted, tombstones included.
    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self
            .histories
            .values()
            .filter_map(|h| h.peek(None))
            .map(|r| r.name().to_string())
            .collect();
        keys.sort();
        keys
    }

    pub fn len(&self) -> usize {
        self.histories.len()
    }

    pub fn is_empty(&self) -> bool {
        self.histories.is_empty()
    }

    /// Current versions of every live record, sorted by name.
    pub fn all_undeleted(&self) -> Vec<&Record> {
        let mut records: Vec<&Record> = self
            .histories
            .values()
            .filter_map(|h| h.peek(None))
            .filter(|r| !r.deleted())
            .collect();
        records.sort_by(|a, b| a.name().cmp(b.name()));
        records
    }

    /// `(Modified, value)` per stored version of `key`, oldest first. Deleted versions and
    /// versions without the property yield `null`.
    pub fn values_over_time(&self, key: &str, property: &str) -> Vec<(DateTime<Utc>, JsonValue)> {
        let Some(history) = self.history(key) else {
            return Vec::new();
        };
        history
            .iter()
            .map(|r| {
                let value = if r.deleted() {
                    JsonValue::Null
                } else {
                    r.get(property).cloned().unwrap_or(JsonValue::Null)
                };
                (r.modified(), value)
            })
            .collect()
    }

    /// Like [`Store::values_over_time`] for properties holding lists. Arrays yield their
    /// elements, a missing or deleted value an empty list, and any other value a single entry.
    pub fn value_lists_over_time(
        &self,
        key: &str,
        property: &str,
    ) -> Vec<(DateTime<Utc>, Vec<JsonValue>)> {
        self.values_over_time(key, property)
            .into_iter()
            .map(|(at, value)| {
                let list = match value {
                    JsonValue::Array(items) => items,
                    JsonValue::Null => Vec::new(),
                    other => vec![other],
                };
                (at, list)
            })
            .collect()
    }

    /// Live records whose JSON text contains every term of `filter`. See [`Record::matches`].
    pub fn find(&self, filter: &str) -> Vec<&Record> {
        self.all_undeleted()
            .into_iter()
            .filter(|r| r.matches(filter))
            .collect()
    }

    pub fn is_dirty(&self) -> bool {
        self.histories.values().any(|h| h.is_dirty())
    }

    pub fn dirty_keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self
            .histories
            .values()
            .filter(|h| h.is_dirty())
            .map(|h| h.key().to_string())
            .collect();
        keys.sort();
        keys
    }

    // ---- mutations ---------------------------------------------------------------------------

    /// Push `record` onto its key's history. Returns false when an equal version is present.
    pub fn add(&mut self, record: Record, preserve: bool) -> bool {
        let key = self.fold(record.name());
        let (max_count, sharpness) = (self.options.max_count, self.options.sharpness_ticks);
        self.histories
            .entry(key)
            .or_insert_with(|| RecordHistory::new(record.name(), max_count, sharpness))
            .push(record, preserve)
    }

    /// Shallow-merge `document` into `key` as a new version, creating the record if needed.
    pub fn set_property(&mut self, key: &str, document: &JsonValue) -> Result<&Record, CairnError> {
        let next = match self.get_with_deleted(key) {
            Some(current) => {
                let mut next = current.clone();
                next.set_property(document)?;
                next.ensure_newer_than(&current.modified());
                next
            }
            None => Record::with_properties(key, document)?,
        };
        self.push_version(next)
    }

    /// Remove one property from `key` as a new version.
    pub fn delete_property(&mut self, key: &str, property: &str) -> Result<&Record, CairnError> {
        let current = self
            .get_with_deleted(key)
            .ok_or_else(|| CairnError::NotFound(format!("record '{}'", key)))?;
        let mut next = current.clone();
        next.delete_property(property);
        next.ensure_newer_than(&current.modified());
        self.push_version(next)
    }

    /// Tombstone `key`. Returns false when it is absent or already deleted.
    pub fn delete(&mut self, key: &str, by: Option<&str>, back_date: bool) -> bool {
        let Some(current) = self.get_with_deleted(key) else {
            return false;
        };
        let mut next = current.clone();
        if !next.delete(by, back_date) {
            return false;
        }
        next.ensure_newer_than(&current.modified());
        let key = self.fold(next.name());
        if let Some(history) = self.histories.get_mut(&key) {
            history.push(next, true);
        }
        true
    }

    fn push_version(&mut self, record: Record) -> Result<&Record, CairnError> {
        let key = self.fold(record.name());
        let (max_count, sharpness) = (self.options.max_count, self.options.sharpness_ticks);
        let history = self
            .histories
            .entry(key)
            .or_insert_with(|| RecordHistory::new(record.name(), max_count, sharpness));
        history.push(record, true);
        history
            .peek(None)
            .ok_or_else(|| CairnError::ValidationError("history empty after push".to_string()))
    }

    /// Drop every record from memory. The next forced store is refused rather than
    /// emptying the canonical file.
    pub fn clear(&mut self) {
        self.histories.clear();
    }

    pub fn ignore_case(&mut self) {
        self.options.ignore_case = true;
        self.rekey();
    }

    pub fn consider_case(&mut self) {
        self.options.ignore_case = false;
        self.rekey();
    }

    fn rekey(&mut self) {
        let old = std::mem::take(&mut self.histories);
        for (_, mut history) in old {
            let Some(name) = history.peek(None).map(|r| r.name().to_string()) else {
                continue;
            };
            let key = self.fold(&name);
            history.set_key(name);
            match self.histories.entry(key) {
                Entry::Occupied(mut e) => e.get_mut().merge(&history),
                Entry::Vacant(e) => {
                    e.insert(history);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::tempdir;

    fn open(dir: &Path, machine: &str, options: StoreOptions) -> Store {
        Store::open(
            dir.join("Countries.json"),
            options,
            Identity::for_machine(machine),
            SyncContext::isolated(),
        )
        .unwrap()
    }

    #[test]
    fn test_fresh_store_claims_master_and_is_empty() {
        let tmp = tempdir().unwrap();
        let store = open(tmp.path(), "alpha", StoreOptions::default());
        assert!(store.is_empty());
        assert!(store.running_on_master().unwrap());
        assert!(!store.master_updates_available().unwrap());
        assert!(!store.path().exists());
    }

    #[test]
    fn test_set_save_and_reopen() {
        let tmp = tempdir().unwrap();
        let mut store = open(tmp.path(), "alpha", StoreOptions::default());
        store
            .set_property("Finland", &json!({"capital": "Helsinki"}))
            .unwrap();
        assert!(store.is_dirty());
        assert_eq!(
            store.save(None, false).unwrap(),
            SaveOutcome::Stored { written: true }
        );
        assert!(!store.is_dirty());

        let again = open(tmp.path(), "alpha", StoreOptions::default());
        let finland = again.get("Finland").unwrap();
        assert_eq!(finland.get("capital"), Some(&json!("Helsinki")));
        assert!(!finland.is_dirty());
    }

    #[test]
    fn test_store_sets_file_time_and_flags_to_latest_version() {
        let tmp = tempdir().unwrap();
        let mut store = open(tmp.path(), "alpha", StoreOptions::default());
        store.set_property("Finland", &json!({"v": 1})).unwrap();
        store.store(false).unwrap();
        let latest = store.latest_modified().unwrap();
        assert_eq!(
            time::to_ticks(&fsio::modified_time(store.path()).unwrap()),
            time::to_ticks(&latest)
        );
        assert_eq!(store.master_flag().unwrap().time().unwrap(), latest);
        assert_eq!(store.process_flag().unwrap().time().unwrap(), latest);
        assert!(!store.file_changed_on_disk().unwrap());
    }

    #[test]
    fn test_clean_store_writes_nothing() {
        let tmp = tempdir().unwrap();
        let mut store = open(tmp.path(), "alpha", StoreOptions::default());
        assert!(!store.store(false).unwrap());
        assert!(!store.path().exists());
    }

    #[test]
    fn test_empty_store_never_overwrites_file() {
        let tmp = tempdir().unwrap();
        let mut store = open(tmp.path(), "alpha", StoreOptions::default());
        store.set_property("Finland", &json!({"v": 1})).unwrap();
        store.store(false).unwrap();
        let before = fs::read_to_string(store.path()).unwrap();

        store.clear();
        assert!(matches!(
            store.store(true),
            Err(CairnError::EmptyOverwrite(_))
        ));
        assert_eq!(fs::read_to_string(store.path()).unwrap(), before);
        assert!(!store.is_persisting());
    }

    #[test]
    fn test_clean_read_only_store_is_a_no_op() {
        let tmp = tempdir().unwrap();
        let mut store = open(tmp.path(), "alpha", StoreOptions::read_only());
        assert!(!store.store(false).unwrap());
        assert!(!store.path().exists());
    }

    #[test]
    fn test_value_lists_over_time() {
        let tmp = tempdir().unwrap();
        let mut store = open(tmp.path(), "alpha", StoreOptions::default());
        store
            .set_property("Finland", &json!({"languages": ["fi", "sv"]}))
            .unwrap();
        store.set_property("Finland", &json!({"languages": "fi"})).unwrap();
        store.delete("Finland", None, true);
        let lists: Vec<Vec<JsonValue>> = store
            .value_lists_over_time("Finland", "languages")
            .into_iter()
            .map(|(_, list)| list)
            .collect();
        assert_eq!(
            lists,
            vec![vec![json!("fi"), json!("sv")], vec![json!("fi")], vec![]]
        );
        assert!(store.value_lists_over_time("Atlantis", "languages").is_empty());
    }

    #[test]
    fn test_find_matches_every_term() {
        let tmp = tempdir().unwrap();
        let mut store = open(tmp.path(), "alpha", StoreOptions::default());
        store
            .set_property("Finland", &json!({"capital": "Helsinki", "region": "Nordic"}))
            .unwrap();
        store
            .set_property("Sweden", &json!({"capital": "Stockholm", "region": "Nordic"}))
            .unwrap();
        store.set_property("Estonia", &json!({"capital": "Tallinn"})).unwrap();
        store.delete("Estonia", None, true);

        let names = |filter: &str| -> Vec<String> {
            store.find(filter).iter().map(|r| r.name().to_string()).collect()
        };
        assert_eq!(names("Nordic"), vec!["Finland", "Sweden"]);
        assert_eq!(names("Nordic+Helsinki"), vec!["Finland"]);
        assert_eq!(names("Nordic Stockholm"), vec!["Sweden"]);
        assert!(names("Tallinn").is_empty());
        assert_eq!(names("  ").len(), 2);
    }

    #[test]
    fn test_read_only_refuses_writes() {
        let tmp = tempdir().unwrap();
        let mut store = open(tmp.path(), "alpha", StoreOptions::read_only());
        store.set_property("Finland", &json!({"v": 1})).unwrap();
        assert!(matches!(store.store(true), Err(CairnError::IllegalWrite(_))));
        assert!(matches!(
            store.save(None, false),
            Err(CairnError::IllegalWrite(_))
        ));
        assert!(matches!(
            store.create_change_files(),
            Err(CairnError::IllegalWrite(_))
        ));
        assert!(!tmp.path().join("Changes").join("Master.flag").exists());
    }

    #[test]
    fn test_keys_are_written_sorted() {
        let tmp = tempdir().unwrap();
        let mut store = open(tmp.path(), "alpha", StoreOptions::default());
        for name in ["Sweden", "Finland", "Norway"] {
            store.set_property(name, &json!({"x": 1})).unwrap();
        }
        store.store(false).unwrap();
        let stacks = codec::decode(&fs::read_to_string(store.path()).unwrap()).unwrap();
        let names: Vec<&str> = stacks.iter().map(|s| s[0].name()).collect();
        assert_eq!(names, vec!["Finland", "Norway", "Sweden"]);
    }

    #[test]
    fn test_successive_edits_get_increasing_versions() {
        let tmp = tempdir().unwrap();
        let mut store = open(tmp.path(), "alpha", StoreOptions::default());
        for i in 0..4 {
            store.set_property("Finland", &json!({"v": i})).unwrap();
        }
        let history = store.history("Finland").unwrap();
        assert_eq!(history.len(), 4);
        let ticks: Vec<i64> = history.iter().map(|r| r.modified_ticks()).collect();
        assert!(ticks.windows(2).all(|w| w[0] < w[1]));
        let values = store.values_over_time("Finland", "v");
        assert_eq!(values.last().unwrap().1, json!(3));
    }

    #[test]
    fn test_delete_hides_record_but_keeps_tombstone() {
        let tmp = tempdir().unwrap();
        let mut store = open(tmp.path(), "alpha", StoreOptions::default());
        store.set_property("Finland", &json!({"v": 1})).unwrap();
        assert!(store.delete("Finland", Some("tester"), true));
        assert!(!store.delete("Finland", None, true));
        assert!(!store.delete("Atlantis", None, true));
        assert!(store.get("Finland").is_none());
        assert!(store.contains("Finland", true));
        assert!(!store.contains("Finland", false));
        let tomb = store.get_with_deleted("Finland").unwrap();
        assert!(tomb.note().contains("deleted by tester"));
        assert_eq!(store.values_over_time("Finland", "v").last().unwrap().1, JsonValue::Null);
        assert!(store.all_undeleted().is_empty());
        assert_eq!(store.keys(), vec!["Finland".to_string()]);
    }

    #[test]
    fn test_delete_property_requires_record() {
        let tmp = tempdir().unwrap();
        let mut store = open(tmp.path(), "alpha", StoreOptions::default());
        assert!(matches!(
            store.delete_property("Finland", "v"),
            Err(CairnError::NotFound(_))
        ));
        store.set_property("Finland", &json!({"v": 1, "w": 2})).unwrap();
        let record = store.delete_property("Finland", "v").unwrap();
        assert!(record.get("v").is_none());
        assert_eq!(record.get("w"), Some(&json!(2)));
    }

    #[test]
    fn test_ignore_case_folds_keys() {
        let tmp = tempdir().unwrap();
        let mut store = open(tmp.path(), "alpha", StoreOptions::default());
        store.set_property("Finland", &json!({"v": 1})).unwrap();
        assert!(store.get("finland").is_none());
        store.ignore_case();
        assert!(store.get("FINLAND").is_some());
        store.set_property("finland", &json!({"w": 2})).unwrap();
        assert_eq!(store.len(), 1);
        store.consider_case();
        assert!(store.get("Finland").is_some());
    }

    #[test]
    fn test_add_rejects_duplicate_version() {
        let tmp = tempdir().unwrap();
        let mut store = open(tmp.path(), "alpha", StoreOptions::default());
        let r = Record::with_timestamp("Finland", time::parse_iso("2020-01-01T00:00:00Z").unwrap());
        assert!(store.add(r.clone(), true));
        assert!(!store.add(r, true));
        assert!(store.is_dirty());
    }

    #[test]
    fn test_backup_copies_previous_file() {
        let tmp = tempdir().unwrap();
        let mut store = open(tmp.path(), "alpha", StoreOptions::default());
        store.set_property("Finland", &json!({"v": 1})).unwrap();
        store.save(Some(true), false).unwrap();
        store.set_property("Finland", &json!({"v": 2})).unwrap();
        store.save(None, false).unwrap();
        let backups: Vec<_> = fs::read_dir(tmp.path().join(BACKUP_DIR))
            .unwrap()
            .collect::<Result<_, _>>()
            .unwrap();
        assert_eq!(backups.len(), 1);
        let name = backups[0].file_name().to_string_lossy().to_string();
        assert!(name.starts_with("Countries_") && name.ends_with(".json"));
    }

    #[test]
    fn test_unflagged_store_is_master_without_flags() {
        let tmp = tempdir().unwrap();
        let options = StoreOptions {
            unflagged: true,
            ..StoreOptions::default()
        };
        let mut store = open(tmp.path(), "alpha", options);
        store.set_property("Finland", &json!({"v": 1})).unwrap();
        assert_eq!(
            store.save(None, false).unwrap(),
            SaveOutcome::Stored { written: true }
        );
        assert!(!tmp.path().join("Changes").exists());
        assert_eq!(store.reload().unwrap(), ReloadOutcome::Unchanged);
    }

    #[test]
    fn test_session_saves_on_exit() {
        let tmp = tempdir().unwrap();
        let path = tmp.path().join("Countries.json");
        let sync = SyncContext::isolated();
        Store::session(
            &path,
            StoreOptions::default(),
            Identity::for_machine("alpha"),
            sync.clone(),
            |store| {
                store.set_property("Finland", &json!({"v": 1}))?;
                Ok(())
            },
        )
        .unwrap();
        let err = Store::session(
            &path,
            StoreOptions::default(),
            Identity::for_machine("alpha"),
            sync,
            |store| -> Result<(), CairnError> {
                store.set_property("Sweden", &json!({"v": 2}))?;
                Err(CairnError::NotFound("boom".to_string()))
            },
        )
        .unwrap_err();
        assert!(matches!(err, CairnError::NotFound(_)));
        let store = open(tmp.path(), "alpha", StoreOptions::default());
        assert!(store.get("Finland").is_some());
        assert!(store.get("Sweden").is_some());
    }

    #[test]
    fn test_load_rejects_mixed_names_in_one_history() {
        let tmp = tempdir().unwrap();
        let path = tmp.path().join("Countries.json");
        fs::write(
            &path,
            concat!(
                r#"[[{"Name":"Finland","Modified":"2020-01-01T00:00:00Z"},"#,
                r#"{"Name":"Sweden","Modified":"2020-01-02T00:00:00Z"}]]"#
            ),
        )
        .unwrap();
        let err = Store::open(
            &path,
            StoreOptions::default(),
            Identity::for_machine("alpha"),
            SyncContext::isolated(),
        )
        .unwrap_err();
        assert!(matches!(err, CairnError::FormatError(_)));
    }
}
