//! Binary documents kept inside a store's folder so they replicate alongside it.
//!
//! Only a fixed set of document kinds is accepted; anything else is rejected before touching the
//! filesystem.

use crate::core::error::CairnError;
use crate::core::store::Store;
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};

pub const SUPPORTED_EXTENSIONS: &[&str] = &[
    "webp", "png", "jpeg", "ogg", "mov", "xls", "xlsm", "docx", "pdf",
];

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Attachment {
    /// Path relative to the store folder, `/`-separated.
    pub name: String,
    pub path: PathBuf,
    pub size: u64,
}

fn extension(path: &Path) -> Option<String> {
    path.extension()
        .map(|e| e.to_string_lossy().to_ascii_lowercase())
}

pub fn is_supported(path: &Path) -> bool {
    extension(path).is_some_and(|ext| SUPPORTED_EXTENSIONS.contains(&ext.as_str()))
}

fn ensure_supported(path: &Path) -> Result<(), CairnError> {
    if is_supported(path) {
        return Ok(());
    }
    Err(CairnError::ValidationError(format!(
        "unsupported document type for attachment {} (supported: {})",
        path.display(),
        SUPPORTED_EXTENSIONS.join(", ")
    )))
}

fn describe(root: &Path, path: &Path) -> Result<Attachment, CairnError> {
    let name = path
        .strip_prefix(root)
        .unwrap_or(path)
        .components()
        .map(|c| c.as_os_str().to_string_lossy().to_string())
        .collect::<Vec<_>>()
        .join("/");
    Ok(Attachment {
        name,
        path: path.to_path_buf(),
        size: fs::metadata(path)?.len(),
    })
}

/// Copy `source` into the store folder. A file already inside the folder is left where it is.
pub fn attach(store: &Store, source: &Path) -> Result<Attachment, CairnError> {
    ensure_supported(source)?;
    if store.options().read_only {
        return Err(CairnError::IllegalWrite(format!(
            "cannot attach {} to a read-only store",
            source.display()
        )));
    }
    if !source.is_file() {
        return Err(CairnError::NotFound(format!("attachment source {}", source.display())));
    }
    let root = folder(store)?;
    let source = source.canonicalize()?;
    if source.starts_with(&root) {
        return describe(&root, &source);
    }
    let file_name = source
        .file_name()
        .ok_or_else(|| {
            CairnError::ValidationError(format!("{} has no file name", source.display()))
        })?;
    let target = root.join(file_name);
    fs::copy(&source, &target)?;
    tracing::info!(source = %source.display(), target = %target.display(), "attached document");
    describe(&root, &target)
}

/// Every supported document below the store folder, sorted by name.
pub fn list_attachments(store: &Store) -> Result<Vec<Attachment>, CairnError> {
    let root = folder(store)?;
    let mut found = Vec::new();
    collect(&root, &root, &mut found)?;
    found.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(found)
}

fn collect(root: &Path, dir: &Path, out: &mut Vec<Attachment>) -> Result<(), CairnError> {
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        let file_type = entry.file_type()?;
        if file_type.is_dir() {
            collect(root, &path, out)?;
        } else if file_type.is_file() && is_supported(&path) {
            out.push(describe(root, &path)?);
        }
    }
    Ok(())
}

/// Delete the attachment `name` (relative to the store folder). Returns whether it existed.
pub fn remove_attachment(store: &Store, name: &str) -> Result<bool, CairnError> {
    let relative = Path::new(name);
    ensure_supported(relative)?;
    if store.options().read_only {
        return Err(CairnError::IllegalWrite(format!(
            "cannot remove {} from a read-only store",
            name
        )));
    }
    if relative.is_absolute()
        || relative
            .components()
            .any(|c| matches!(c, std::path::Component::ParentDir))
    {
        return Err(CairnError::ValidationError(format!(
            "attachment name {} must stay inside the store folder",
            name
        )));
    }
    let target = folder(store)?.join(relative);
    if !target.is_file() {
        return Ok(false);
    }
    fs::remove_file(&target)?;
    tracing::info!(attachment = %target.display(), "removed attachment");
    Ok(true)
}

fn folder(store: &Store) -> Result<PathBuf, CairnError> {
    let dir = store.dir();
    let dir = if dir.as_os_str().is_empty() {
        Path::new(".")
    } else {
        dir
    };
    fs::create_dir_all(dir)?;
    Ok(dir.canonicalize()?)
}
