//! Upload descriptors and the raw transport shapes they are built from.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// Outcome reported by the upload transport for a single file.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TransportError {
    #[default]
    Ok,
    IniSize,
    Partial,
    NoFile,
    NoTmpDir,
    CantWrite,
    Extension,
}

impl TransportError {
    /// Maps a numeric transport code. Code 2 (form size) is folded into
    /// `IniSize` since both mean the upload exceeded a configured limit.
    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(TransportError::Ok),
            1 | 2 => Some(TransportError::IniSize),
            3 => Some(TransportError::Partial),
            4 => Some(TransportError::NoFile),
            6 => Some(TransportError::NoTmpDir),
            7 => Some(TransportError::CantWrite),
            8 => Some(TransportError::Extension),
            _ => None,
        }
    }

    pub fn code(self) -> u8 {
        match self {
            TransportError::Ok => 0,
            TransportError::IniSize => 1,
            TransportError::Partial => 3,
            TransportError::NoFile => 4,
            TransportError::NoTmpDir => 6,
            TransportError::CantWrite => 7,
            TransportError::Extension => 8,
        }
    }

    pub fn is_ok(self) -> bool {
        self == TransportError::Ok
    }
}

/// A transport value that is either scalar (single-file field) or a list
/// indexed consistently with its siblings (multiple-file field).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum OneOrMany<T> {
    One(T),
    Many(Vec<T>),
}

impl<T: Clone> OneOrMany<T> {
    fn len(&self) -> Option<usize> {
        match self {
            OneOrMany::One(_) => None,
            OneOrMany::Many(items) => Some(items.len()),
        }
    }

    fn get(&self, index: usize) -> Option<T> {
        match self {
            OneOrMany::One(value) => (index == 0).then(|| value.clone()),
            OneOrMany::Many(items) => items.get(index).cloned(),
        }
    }
}

/// Raw file data for one form field as delivered by the transport,
/// shaped like `{name, type, tmp_name, size, error}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawFileField {
    pub name: OneOrMany<String>,
    #[serde(rename = "type")]
    pub mime_type: OneOrMany<String>,
    pub tmp_name: OneOrMany<String>,
    pub size: OneOrMany<u64>,
    pub error: OneOrMany<u8>,
}

/// One file of a [`RawFileField`], after splitting multi-valued fields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawFileEntry {
    pub name: String,
    pub mime_type: String,
    pub tmp_name: String,
    pub size: u64,
    pub error: TransportError,
}

impl RawFileField {
    pub fn single(
        name: impl Into<String>,
        mime_type: impl Into<String>,
        tmp_name: impl Into<String>,
        size: u64,
        error: TransportError,
    ) -> Self {
        Self {
            name: OneOrMany::One(name.into()),
            mime_type: OneOrMany::One(mime_type.into()),
            tmp_name: OneOrMany::One(tmp_name.into()),
            size: OneOrMany::One(size),
            error: OneOrMany::One(error.code()),
        }
    }

    pub fn multiple(entries: Vec<RawFileEntry>) -> Self {
        Self {
            name: OneOrMany::Many(entries.iter().map(|e| e.name.clone()).collect()),
            mime_type: OneOrMany::Many(entries.iter().map(|e| e.mime_type.clone()).collect()),
            tmp_name: OneOrMany::Many(entries.iter().map(|e| e.tmp_name.clone()).collect()),
            size: OneOrMany::Many(entries.iter().map(|e| e.size).collect()),
            error: OneOrMany::Many(entries.iter().map(|e| e.error.code()).collect()),
        }
    }

    pub fn is_multiple(&self) -> bool {
        self.name.len().is_some()
    }

    /// Splits the field into per-file entries. The entry count follows the
    /// `name` list; sibling values missing at an index are defaulted and
    /// unknown transport codes become `NoFile`.
    pub fn entries(&self) -> Vec<RawFileEntry> {
        let count = self.name.len().unwrap_or(1);
        (0..count)
            .map(|index| {
                let error = self
                    .error
                    .get(index)
                    .and_then(TransportError::from_code)
                    .unwrap_or(TransportError::NoFile);
                RawFileEntry {
                    name: self.name.get(index).unwrap_or_default(),
                    mime_type: self.mime_type.get(index).unwrap_or_default(),
                    tmp_name: self.tmp_name.get(index).unwrap_or_default(),
                    size: self.size.get(index).unwrap_or(0),
                    error,
                }
            })
            .collect()
    }
}

/// Canonical record for one uploaded file, mutated in place by each
/// validation stage.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UploadDescriptor {
    pub original_name: String,
    /// Set once the name has been sanitized.
    pub sanitized_name: Option<String>,
    /// Lowercase extension derived from `sanitized_name`.
    pub extension: Option<String>,
    pub declared_mime_type: String,
    /// Set once content sniffing has matched an accept rule.
    pub detected_mime_type: Option<String>,
    pub temp_path: PathBuf,
    pub size_bytes: u64,
    pub transport_error: TransportError,
}

impl UploadDescriptor {
    pub fn from_entry(entry: RawFileEntry) -> Self {
        Self {
            original_name: entry.name,
            sanitized_name: None,
            extension: None,
            declared_mime_type: entry.mime_type,
            detected_mime_type: None,
            temp_path: PathBuf::from(entry.tmp_name),
            size_bytes: entry.size,
            transport_error: entry.error,
        }
    }

    /// Best name available for messages: sanitized if known, else the
    /// submitted basename.
    pub fn display_name(&self) -> String {
        self.sanitized_name
            .clone()
            .unwrap_or_else(|| basename(&self.original_name).to_string())
    }

    pub fn temp_path(&self) -> &Path {
        &self.temp_path
    }
}

/// Last path component, splitting on both `/` and `\` regardless of
/// platform.
pub fn basename(name: &str) -> &str {
    name.rsplit(['/', '\\']).next().unwrap_or(name)
}
