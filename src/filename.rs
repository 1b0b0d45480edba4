//! Database directory layout.
//!
//! A database directory contains:
//!
//! - `CURRENT`: the name of the active manifest, newline-terminated
//! - `MANIFEST-<n>`: version-edit logs
//! - `<n>.log`: write-ahead logs
//! - `<n>.ldb`: table files
//! - `LOCK`: the directory lock
//!
//! Unknown file names are ignored by recovery and garbage collection.

use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileType {
    Log,
    Table,
    Manifest,
    Current,
    Lock,
    Temp,
}

pub fn log_file_name(dir: &Path, number: u64) -> PathBuf {
    dir.join(format!("{number:06}.log"))
}

pub fn table_file_name(dir: &Path, number: u64) -> PathBuf {
    dir.join(format!("{number:06}.ldb"))
}

pub fn manifest_file_name(dir: &Path, number: u64) -> PathBuf {
    dir.join(format!("MANIFEST-{number:06}"))
}

pub fn current_file_name(dir: &Path) -> PathBuf {
    dir.join("CURRENT")
}

pub fn lock_file_name(dir: &Path) -> PathBuf {
    dir.join("LOCK")
}

pub fn temp_file_name(dir: &Path, number: u64) -> PathBuf {
    dir.join(format!("{number:06}.dbtmp"))
}

/// Classifies a directory entry by name. Returns `None` for names this
/// engine does not produce.
pub fn parse_file_name(name: &str) -> Option<(u64, FileType)> {
    if name == "CURRENT" {
        return Some((0, FileType::Current));
    }
    if name == "LOCK" {
        return Some((0, FileType::Lock));
    }
    if let Some(rest) = name.strip_prefix("MANIFEST-") {
        let number = rest.parse::<u64>().ok()?;
        return Some((number, FileType::Manifest));
    }
    if let Some(stem) = name.strip_suffix(".log") {
        let number = stem.parse::<u64>().ok()?;
        return Some((number, FileType::Log));
    }
    if let Some(stem) = name.strip_suffix(".ldb") {
        let number = stem.parse::<u64>().ok()?;
        return Some((number, FileType::Table));
    }
    if let Some(stem) = name.strip_suffix(".dbtmp") {
        let number = stem.parse::<u64>().ok()?;
        return Some((number, FileType::Temp));
    }
    None
}

/// Points `CURRENT` at `MANIFEST-<manifest_number>`: the name is written to a
/// temp file, fsynced, then renamed over `CURRENT` so the switch is atomic.
pub fn set_current_file(dir: &Path, manifest_number: u64) -> Result<()> {
    let contents = format!("MANIFEST-{manifest_number:06}\n");
    let tmp = temp_file_name(dir, manifest_number);

    let mut file = File::create(&tmp)?;
    file.write_all(contents.as_bytes())?;
    file.sync_all()?;
    drop(file);

    fs::rename(&tmp, current_file_name(dir))?;

    // Make the rename durable.
    if let Ok(dir_handle) = File::open(dir) {
        let _ = dir_handle.sync_all();
    }
    Ok(())
}

/// Reads `CURRENT` and returns the manifest path it names.
pub fn read_current_file(dir: &Path) -> Result<PathBuf> {
    let contents = fs::read_to_string(current_file_name(dir))?;
    let name = contents.trim_end_matches('\n');
    if name.is_empty() || !contents.ends_with('\n') {
        return Err(Error::Corruption(
            "CURRENT file is malformed".to_string(),
        ));
    }
    if parse_file_name(name).map(|(_, t)| t) != Some(FileType::Manifest) {
        return Err(Error::Corruption(format!(
            "CURRENT names a non-manifest file: {name}"
        )));
    }
    Ok(dir.join(name))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_parse_file_name() {
        assert_eq!(parse_file_name("CURRENT"), Some((0, FileType::Current)));
        assert_eq!(parse_file_name("LOCK"), Some((0, FileType::Lock)));
        assert_eq!(
            parse_file_name("MANIFEST-000005"),
            Some((5, FileType::Manifest))
        );
        assert_eq!(parse_file_name("000123.log"), Some((123, FileType::Log)));
        assert_eq!(parse_file_name("000042.ldb"), Some((42, FileType::Table)));
        assert_eq!(parse_file_name("000007.dbtmp"), Some((7, FileType::Temp)));

        assert_eq!(parse_file_name("README"), None);
        assert_eq!(parse_file_name("xyz.log"), None);
        assert_eq!(parse_file_name("MANIFEST-"), None);
    }

    #[test]
    fn test_names_parse_back() {
        let dir = Path::new("/db");
        for (path, expect) in [
            (log_file_name(dir, 9), (9, FileType::Log)),
            (table_file_name(dir, 9), (9, FileType::Table)),
            (manifest_file_name(dir, 9), (9, FileType::Manifest)),
        ] {
            let name = path.file_name().unwrap().to_str().unwrap();
            assert_eq!(parse_file_name(name), Some(expect));
        }
    }

    #[test]
    fn test_set_and_read_current() {
        let dir = tempdir().expect("tempdir");
        set_current_file(dir.path(), 12).expect("set CURRENT");

        let manifest = read_current_file(dir.path()).expect("read CURRENT");
        assert_eq!(manifest, dir.path().join("MANIFEST-000012"));

        // Re-pointing is atomic and leaves no temp file behind.
        set_current_file(dir.path(), 13).expect("re-set CURRENT");
        let manifest = read_current_file(dir.path()).expect("read CURRENT");
        assert_eq!(manifest, dir.path().join("MANIFEST-000013"));
        assert!(!dir.path().join("000013.dbtmp").exists());
    }

    #[test]
    fn test_read_current_rejects_garbage() {
        let dir = tempdir().expect("tempdir");
        std::fs::write(current_file_name(dir.path()), "000001.ldb\n").unwrap();
        assert!(read_current_file(dir.path()).is_err());
    }
}
