//! Small filesystem primitives: atomic overwrite, single-line files and file times.

use crate::core::error::CairnError;
use chrono::{DateTime, Utc};
use std::fs::{self, File};
use std::io::Write;
use std::path::Path;
use std::time::{Duration, SystemTime};
use ulid::Ulid;

/// Replace `path` with `data` via a sibling temp file and a rename.
///
/// Readers see either the old or the new content, never a partial write.
pub fn atomic_write(path: &Path, data: &[u8]) -> Result<(), CairnError> {
    let dir = path
        .parent()
        .ok_or_else(|| CairnError::ValidationError(format!("{} has no parent", path.display())))?;
    fs::create_dir_all(dir)?;
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    let tmp = dir.join(format!(".{}.{}.tmp", file_name, Ulid::new()));
    {
        let mut f = File::create(&tmp)?;
        f.write_all(data)?;
        f.sync_all()?;
    }
    if let Err(e) = fs::rename(&tmp, path) {
        let _ = fs::remove_file(&tmp);
        return Err(CairnError::IoError(e));
    }
    Ok(())
}

/// First line of a text file, `None` when the file does not exist.
pub fn read_first_line(path: &Path) -> Result<Option<String>, CairnError> {
    if !path.exists() {
        return Ok(None);
    }
    let content = fs::read_to_string(path)?;
    Ok(content.lines().next().map(|l| l.to_string()))
}

pub fn write_line(path: &Path, line: &str) -> Result<(), CairnError> {
    atomic_write(path, format!("{}\n", line).as_bytes())
}

pub fn set_modified(path: &Path, t: &DateTime<Utc>) -> Result<(), CairnError> {
    let f = File::options().write(true).open(path)?;
    f.set_modified(SystemTime::from(*t))?;
    Ok(())
}

pub fn modified_time(path: &Path) -> Result<DateTime<Utc>, CairnError> {
    let modified = fs::metadata(path)?.modified()?;
    Ok(DateTime::<Utc>::from(modified))
}

/// Time since the file was last written; zero for files stamped in the future.
pub fn file_age(path: &Path) -> Result<Duration, CairnError> {
    let modified = fs::metadata(path)?.modified()?;
    Ok(SystemTime::now()
        .duration_since(modified)
        .unwrap_or_default())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::time;
    use tempfile::tempdir;

    #[test]
    fn test_atomic_write_creates_parent_and_replaces() {
        let tmp = tempdir().unwrap();
        let path = tmp.path().join("nested").join("a.txt");
        atomic_write(&path, b"one").unwrap();
        atomic_write(&path, b"two").unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), "two");
        let leftovers: Vec<_> = fs::read_dir(path.parent().unwrap())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn test_read_first_line_missing_file() {
        let tmp = tempdir().unwrap();
        assert_eq!(read_first_line(&tmp.path().join("none.flag")).unwrap(), None);
    }

    #[test]
    fn test_write_line_then_read() {
        let tmp = tempdir().unwrap();
        let path = tmp.path().join("x.flag");
        write_line(&path, "a|b").unwrap();
        assert_eq!(read_first_line(&path).unwrap().as_deref(), Some("a|b"));
    }

    #[test]
    fn test_set_modified_is_visible() {
        let tmp = tempdir().unwrap();
        let path = tmp.path().join("f.json");
        fs::write(&path, "[]").unwrap();
        let t = time::parse_iso("2020-01-01T00:00:00Z").unwrap();
        set_modified(&path, &t).unwrap();
        assert_eq!(modified_time(&path).unwrap(), t);
        assert!(file_age(&path).unwrap() > Duration::from_secs(3600));
    }
}
