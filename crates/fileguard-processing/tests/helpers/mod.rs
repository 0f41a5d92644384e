//! Test helpers: upload temp directories and validators wired to them.
//!
//! Run from workspace root: `cargo test -p fileguard-processing`.

#![allow(dead_code)]

pub mod fixtures;

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use fileguard_core::{IniSettings, RawFileEntry, RawFileField, TransportError, UploadConstraints, UploadLimits};
use fileguard_processing::{MultipartUploads, UploadValidator};
use tempfile::TempDir;

/// Uploads temp directory standing in for the web server's one.
pub struct UploadDir {
    dir: TempDir,
    counter: std::cell::Cell<usize>,
}

impl UploadDir {
    pub fn new() -> Self {
        Self {
            dir: TempDir::new().unwrap(),
            counter: std::cell::Cell::new(0),
        }
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    pub fn limits(&self) -> IniSettings {
        IniSettings {
            upload_tmp_dir: Some(self.path().to_path_buf()),
            ..IniSettings::default()
        }
    }

    pub fn shared_limits(&self) -> Arc<dyn UploadLimits> {
        Arc::new(self.limits())
    }

    /// Writes content under a transport-style temp name and returns its path.
    pub fn write_upload(&self, content: &[u8]) -> PathBuf {
        let index = self.counter.get();
        self.counter.set(index + 1);
        let path = self.path().join(format!("php{:04}", index));
        fs::write(&path, content).unwrap();
        path
    }

    pub fn entry(&self, name: &str, mime_type: &str, content: &[u8]) -> RawFileEntry {
        let path = self.write_upload(content);
        RawFileEntry {
            name: name.to_string(),
            mime_type: mime_type.to_string(),
            tmp_name: path.to_string_lossy().to_string(),
            size: content.len() as u64,
            error: TransportError::Ok,
        }
    }

    /// Source with one single-file field.
    pub fn single(&self, field: &str, name: &str, mime_type: &str, content: &[u8]) -> MultipartUploads {
        let entry = self.entry(name, mime_type, content);
        MultipartUploads::new().with_field(
            field,
            RawFileField::single(entry.name, entry.mime_type, entry.tmp_name, entry.size, entry.error),
        )
    }

    pub fn validator(&self, field: &str, constraints: UploadConstraints) -> UploadValidator {
        UploadValidator::new(field, constraints, self.shared_limits()).unwrap()
    }

    /// Number of files and directories left in the uploads directory.
    pub fn leftovers(&self) -> usize {
        fs::read_dir(self.path()).unwrap().count()
    }
}

pub fn constraints(accept: &[&str]) -> UploadConstraints {
    UploadConstraints::new(accept.iter().map(|a| a.to_string()).collect())
}
