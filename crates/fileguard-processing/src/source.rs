//! Raw upload sources feeding the validator.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

use fileguard_core::RawFileField;

/// Transport-level view of submitted files.
pub trait RawUploadSource: Send + Sync {
    /// Raw data for a form field, `None` when nothing was submitted under
    /// that name.
    fn file_field(&self, field: &str) -> Option<RawFileField>;

    /// Whether `path` was produced by this transport, as opposed to a path
    /// smuggled in through client data.
    fn is_uploaded_file(&self, path: &Path) -> bool;
}

/// Multipart form uploads already stored in temp files by the web layer.
#[derive(Debug, Clone, Default)]
pub struct MultipartUploads {
    fields: HashMap<String, RawFileField>,
    uploaded: HashSet<PathBuf>,
}

impl MultipartUploads {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a field. Its temp paths are trusted as transport output.
    pub fn insert(&mut self, field: impl Into<String>, raw: RawFileField) {
        for entry in raw.entries() {
            if !entry.tmp_name.is_empty() {
                self.uploaded.insert(PathBuf::from(entry.tmp_name));
            }
        }
        self.fields.insert(field.into(), raw);
    }

    pub fn with_field(mut self, field: impl Into<String>, raw: RawFileField) -> Self {
        self.insert(field, raw);
        self
    }
}

impl RawUploadSource for MultipartUploads {
    fn file_field(&self, field: &str) -> Option<RawFileField> {
        self.fields.get(field).cloned()
    }

    fn is_uploaded_file(&self, path: &Path) -> bool {
        self.uploaded.contains(path)
    }
}
