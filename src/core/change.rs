//! Change files: one-record deltas named `<modifiedTicks>_<machine>.json`.
//!
//! Non-master writers emit them into the `Changes/` directory beside the canonical file; the
//! master merges them and deletes them once they have had time to reach every replica.

use crate::core::codec;
use crate::core::error::CairnError;
use crate::core::fsio;
use crate::core::record::Record;
use regex::Regex;
use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use std::time::Duration;

pub const CHANGES_DIR: &str = "Changes";

/// Minimum age before the master may delete a processed change file.
pub const SETTLE_WINDOW: Duration = Duration::from_secs(600);

static NAME_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(\d+)_(.+)\.json$").expect("valid change file pattern"));

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeFileName {
    pub ticks: i64,
    pub machine: String,
}

impl ChangeFileName {
    pub fn for_record(record: &Record, machine: &str) -> Self {
        Self {
            ticks: record.modified_ticks(),
            machine: machine.to_string(),
        }
    }

    pub fn parse(file_name: &str) -> Option<Self> {
        let caps = NAME_PATTERN.captures(file_name)?;
        Some(Self {
            ticks: caps[1].parse().ok()?,
            machine: caps[2].to_string(),
        })
    }

    pub fn authored_by(&self, machine: &str) -> bool {
        self.machine == machine
    }
}

impl fmt::Display for ChangeFileName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_{}.json", self.ticks, self.machine)
    }
}

#[derive(Debug, Clone)]
pub struct ChangeFile {
    pub path: PathBuf,
    pub name: ChangeFileName,
}

impl ChangeFile {
    /// The records stored in this change file (normally exactly one).
    pub fn read(&self) -> Result<Vec<Record>, CairnError> {
        let text = fs::read_to_string(&self.path)?;
        Ok(codec::decode(&text)?.into_iter().flatten().collect())
    }
}

/// Change files in `dir`, newest first. A missing directory means no changes.
pub fn list(dir: &Path) -> Result<Vec<ChangeFile>, CairnError> {
    if !dir.is_dir() {
        return Ok(Vec::new());
    }
    let mut changes = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        if !entry.file_type()?.is_file() {
            continue;
        }
        let file_name = entry.file_name().to_string_lossy().to_string();
        if let Some(name) = ChangeFileName::parse(&file_name) {
            changes.push(ChangeFile {
                path: entry.path(),
                name,
            });
        }
    }
    changes.sort_by(|a, b| {
        b.name
            .ticks
            .cmp(&a.name.ticks)
            .then_with(|| b.name.machine.cmp(&a.name.machine))
    });
    Ok(changes)
}

/// Write `record` as a change file. Returns `None` when a file of that name already exists,
/// since the same version from the same machine carries the same content.
pub fn write(
    dir: &Path,
    record: &Record,
    machine: &str,
    pretty: bool,
) -> Result<Option<PathBuf>, CairnError> {
    let path = dir.join(ChangeFileName::for_record(record, machine).to_string());
    if path.exists() {
        return Ok(None);
    }
    let text = codec::encode([[record]], pretty)?;
    fsio::atomic_write(&path, text.as_bytes())?;
    Ok(Some(path))
}

/// Delete `change` once it has aged past [`SETTLE_WINDOW`]. Returns whether it was removed.
///
/// Another replica or the sync service may remove the file first; a file that is already gone
/// counts as collected.
pub fn collect_settled(change: &ChangeFile) -> Result<bool, CairnError> {
    let age = match fsio::file_age(&change.path) {
        Ok(age) => age,
        Err(CairnError::IoError(e)) if e.kind() == io::ErrorKind::NotFound => return Ok(false),
        Err(e) => return Err(e),
    };
    if age < SETTLE_WINDOW {
        return Ok(false);
    }
    match fs::remove_file(&change.path) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e.into()),
    }
}
