//! Record storage directory

use super::records::TrafficRecord;
use crate::errors::{RecordError, Result};
use log::{debug, info};
use std::fs::{self, DirBuilder, OpenOptions};
use std::io::{BufWriter, ErrorKind, Write};
use std::os::unix::fs::DirBuilderExt;
use std::path::PathBuf;
use uuid::Uuid;

/// Directory that holds one file per recorded exchange
///
/// The path always ends with exactly the separator the user gave or one
/// appended, so record file names can be concatenated onto it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageDirectory {
    path: String,
}

impl StorageDirectory {
    pub fn new(path: &str) -> Result<Self> {
        if path.is_empty() {
            return Err(RecordError::InvalidConfig(
                "storage directory must not be empty".to_string(),
            ));
        }
        Ok(Self {
            path: Self::normalize(path),
        })
    }

    /// Append a trailing `/` unless one is already present
    pub fn normalize(path: &str) -> String {
        if path.ends_with('/') {
            path.to_string()
        } else {
            format!("{}/", path)
        }
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// Create the directory with mode 0700 if it does not exist yet
    pub fn ensure_exists(&self) -> Result<()> {
        match fs::metadata(&self.path) {
            Ok(meta) if meta.is_dir() => {
                debug!("Storing records in existing directory {}", self.path);
                Ok(())
            }
            Ok(_) => Err(RecordError::Storage(format!(
                "{} exists and is not a directory",
                self.path
            ))),
            Err(e) if e.kind() == ErrorKind::NotFound => {
                DirBuilder::new().mode(0o700).create(&self.path).map_err(|e| {
                    RecordError::Storage(format!("cannot create {}: {}", self.path, e))
                })?;
                info!("Created storage directory {}", self.path);
                Ok(())
            }
            Err(e) => Err(RecordError::Storage(format!(
                "cannot access {}: {}",
                self.path, e
            ))),
        }
    }

    pub fn record_path(&self, id: &Uuid) -> PathBuf {
        PathBuf::from(format!("{}save.{}", self.path, id))
    }

    /// Write one record under a fresh name and return its path
    pub fn write_record(&self, record: &TrafficRecord) -> Result<PathBuf> {
        let path = self.record_path(&Uuid::new_v4());
        let file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .map_err(|e| RecordError::Storage(format!("cannot create {}: {}", path.display(), e)))?;

        let mut writer = BufWriter::new(file);
        serde_json::to_writer(&mut writer, record)
            .map_err(|e| RecordError::Storage(format!("cannot encode record: {}", e)))?;
        writer
            .flush()
            .map_err(|e| RecordError::Storage(format!("cannot write {}: {}", path.display(), e)))?;

        debug!("Wrote {}", path.display());
        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;
    use tempfile::TempDir;

    #[test]
    fn test_normalize_appends_single_separator() {
        assert_eq!(StorageDirectory::normalize("out"), "out/");
        assert_eq!(StorageDirectory::normalize("out/"), "out/");
        assert_eq!(StorageDirectory::normalize("/var/rec"), "/var/rec/");
    }

    #[test]
    fn test_normalize_is_idempotent() {
        for input in ["a", "a/", "/", "a/b/c"] {
            let once = StorageDirectory::normalize(input);
            assert_eq!(StorageDirectory::normalize(&once), once);
        }
    }

    #[test]
    fn test_empty_path_rejected() {
        assert!(matches!(
            StorageDirectory::new(""),
            Err(RecordError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_ensure_exists_creates_private_directory() {
        let tmp = TempDir::new().unwrap();
        let target = tmp.path().join("records");
        let storage = StorageDirectory::new(target.to_str().unwrap()).unwrap();

        storage.ensure_exists().unwrap();
        storage.ensure_exists().unwrap();

        let meta = fs::metadata(&target).unwrap();
        assert!(meta.is_dir());
        assert_eq!(meta.permissions().mode() & 0o777, 0o700);
    }

    #[test]
    fn test_ensure_exists_rejects_regular_file() {
        let tmp = TempDir::new().unwrap();
        let file = tmp.path().join("plain");
        fs::write(&file, b"x").unwrap();

        let err = StorageDirectory::new(file.to_str().unwrap())
            .unwrap()
            .ensure_exists()
            .unwrap_err();
        assert_eq!(err.category(), "Storage");
    }

    #[test]
    fn test_ensure_exists_fails_for_missing_parent() {
        let tmp = TempDir::new().unwrap();
        let nested = tmp.path().join("missing").join("records");
        let storage = StorageDirectory::new(nested.to_str().unwrap()).unwrap();
        assert!(storage.ensure_exists().is_err());
    }

    #[test]
    fn test_write_record_uses_save_prefix() {
        let tmp = TempDir::new().unwrap();
        let storage = StorageDirectory::new(tmp.path().to_str().unwrap()).unwrap();
        let record = TrafficRecord::new(
            "100.64.2.1:40000".parse().unwrap(),
            "93.184.216.34:80".parse().unwrap(),
            b"GET / HTTP/1.1\r\n\r\n".to_vec(),
            b"HTTP/1.1 200 OK\r\n\r\n".to_vec(),
        );

        let path = storage.write_record(&record).unwrap();
        let name = path.file_name().unwrap().to_str().unwrap();
        assert!(name.starts_with("save."));
        assert_eq!(path.parent().unwrap(), tmp.path());

        let stored: TrafficRecord = serde_json::from_slice(&fs::read(&path).unwrap()).unwrap();
        assert_eq!(stored, record);
    }

    #[test]
    fn test_write_record_into_missing_directory_fails() {
        let tmp = TempDir::new().unwrap();
        let storage =
            StorageDirectory::new(tmp.path().join("gone").to_str().unwrap()).unwrap();
        let record = TrafficRecord::new(
            "10.0.0.1:1".parse().unwrap(),
            "10.0.0.2:2".parse().unwrap(),
            Vec::new(),
            Vec::new(),
        );
        assert_eq!(storage.write_record(&record).unwrap_err().category(), "Storage");
    }
}
