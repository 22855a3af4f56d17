//! Flag files: one `owner|instant` line that other replicas may rewrite at any moment.
//!
//! Nothing is cached. Every accessor re-reads the file and every update is a read followed by a
//! full rewrite under the process-local flag lock. There is no cross-process or cross-machine
//! locking; the reload protocol refuses to proceed when the flags look inconsistent.

use crate::core::error::CairnError;
use crate::core::fsio;
use crate::core::identity::Identity;
use crate::core::sync::SyncContext;
use crate::core::token::TimestampedToken;
use crate::core::time;
use chrono::{DateTime, Utc};
use std::path::{Path, PathBuf};

pub const MASTER_FLAG_NAME: &str = "Master";
pub const FLAG_EXTENSION: &str = "flag";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlagKind {
    /// Names the machine allowed to rewrite the canonical file.
    Master,
    /// Records, per machine, when that machine last loaded or stored the canonical file.
    Process,
}

#[derive(Debug, Clone)]
pub struct FlagFile {
    path: PathBuf,
    kind: FlagKind,
    identity: Identity,
    sync: SyncContext,
}

pub fn flag_path(change_dir: &Path, name: &str) -> PathBuf {
    change_dir.join(format!("{}.{}", name, FLAG_EXTENSION))
}

impl FlagFile {
    /// Open `Master.flag`, claiming it for the local machine if nobody owns it yet.
    ///
    /// A fresh claim is stamped with `initial`, the newest version the claimer already holds.
    pub fn master(
        change_dir: &Path,
        identity: &Identity,
        sync: &SyncContext,
        initial: DateTime<Utc>,
    ) -> Result<Self, CairnError> {
        let flag = Self::master_unclaimed(change_dir, identity, sync);
        if flag.owner()?.is_empty() {
            let token = flag.update(Some(initial), None)?;
            tracing::info!(
                machine = %token.value,
                flag = %flag.path.display(),
                "claimed master flag"
            );
        }
        Ok(flag)
    }

    /// Open `Master.flag` for reading only; an unowned flag stays unowned.
    pub fn master_unclaimed(change_dir: &Path, identity: &Identity, sync: &SyncContext) -> Self {
        Self {
            path: flag_path(change_dir, MASTER_FLAG_NAME),
            kind: FlagKind::Master,
            identity: identity.clone(),
            sync: sync.clone(),
        }
    }

    /// Open `<machine>.flag`, creating it stamped with `initial` if absent.
    pub fn process(
        change_dir: &Path,
        identity: &Identity,
        sync: &SyncContext,
        initial: DateTime<Utc>,
    ) -> Result<Self, CairnError> {
        let flag = Self {
            path: flag_path(change_dir, &identity.machine),
            kind: FlagKind::Process,
            identity: identity.clone(),
            sync: sync.clone(),
        };
        if fsio::read_first_line(&flag.path)?.is_none() {
            flag.update(Some(initial), None)?;
        }
        Ok(flag)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn kind(&self) -> FlagKind {
        self.kind
    }

    fn read_token(&self) -> Result<Option<TimestampedToken>, CairnError> {
        match fsio::read_first_line(&self.path)? {
            Some(line) => Ok(Some(line.parse()?)),
            None => Ok(None),
        }
    }

    /// Recorded owner, `""` when unclaimed. Re-reads the file.
    pub fn owner(&self) -> Result<String, CairnError> {
        Ok(self.read_token()?.map(|t| t.value).unwrap_or_default())
    }

    /// Recorded instant. Re-reads the file.
    pub fn time(&self) -> Result<DateTime<Utc>, CairnError> {
        Ok(self.read_token()?.map(|t| t.time).unwrap_or_else(time::now))
    }

    /// Rewrite the flag. `owner` overrides the recorded owner, `at` overrides "now".
    pub fn update(
        &self,
        at: Option<DateTime<Utc>>,
        owner: Option<&str>,
    ) -> Result<TimestampedToken, CairnError> {
        let _guard = self.sync.lock_flags()?;
        let current = self.read_token()?;
        let mut value = match self.kind {
            FlagKind::Master => current.map(|t| t.value).unwrap_or_default(),
            FlagKind::Process => self.identity.process.clone(),
        };
        if value.is_empty() {
            value = self.identity.machine.clone();
        }
        if let Some(owner) = owner.filter(|o| !o.is_empty()) {
            value = owner.to_string();
        }
        let token = TimestampedToken::new(value, at);
        fsio::write_line(&self.path, &token.to_string())?;
        tracing::debug!(flag = %self.path.display(), token = %token, "flag updated");
        Ok(token)
    }
}
