//! Archive and image bomb detection.
//!
//! A [`BombScanner`] walks one layer of a container format. Scanners are
//! picked by magic bytes from an ordered list resolved through the
//! [`ScannerRegistry`]; [`BombDetector`] drives them recursively through
//! nested archives.

mod detector;
mod gzip;
mod png;
mod rar;
mod zip_archive;

use std::collections::HashMap;
use std::fs::File;
use std::io::{self, Read};
use std::path::{Path, PathBuf};

use fileguard_core::UploadError;
use thiserror::Error;

use crate::temp::TempTracker;

pub use detector::{BombDetector, BombScanContext};
pub use gzip::GzipScanner;
pub use png::PngScanner;
pub use rar::RarScanner;
pub use zip_archive::ZipScanner;

/// Number of leading bytes used for magic-byte dispatch.
pub const MAGIC_LEN: usize = 4;

/// Failures reported by scanners. Each maps to a `{1}` message template
/// whose argument is the uploaded file name.
#[derive(Debug, Error)]
pub enum ScannerError {
    #[error("inconsistent PNG image")]
    InvalidPng,

    #[error("PNG image dimensions exceed the configured maximum")]
    InvalidSize,

    #[error("inconsistent ZIP archive: {0}")]
    InconsistentZip(String),

    #[error("ZIP header without a ZIP archive: {0}")]
    NotZip(String),

    #[error("ZIP archive could not be opened: {0}")]
    ZipOpen(String),

    #[error("ZIP archive could not be read: {0}")]
    ZipRead(String),

    #[error("ZIP archive could not be seeked: {0}")]
    ZipSeek(String),

    #[error("inconsistent GZ archive: {0}")]
    InconsistentGzip(String),

    #[error("{0}")]
    Unsupported(String),

    #[error("I/O error while scanning: {0}")]
    Io(#[from] io::Error),
}

impl ScannerError {
    pub fn message_template(&self) -> &'static str {
        match self {
            ScannerError::InvalidPng => "Uploaded file is inconsistent PNG image (`{1}`).",
            ScannerError::InvalidSize => "Uploaded file has invalid sizes (`{1}`).",
            ScannerError::InconsistentZip(_) => "Uploaded file is inconsistent ZIP archive (`{1}`).",
            ScannerError::NotZip(_) => {
                "Uploaded file has archive header but it's not an archive (`{1}`)."
            }
            ScannerError::ZipOpen(_) => "Uploaded file archive is not possible to open (`{1}`).",
            ScannerError::ZipRead(_) | ScannerError::Io(_) => {
                "Uploaded file archive is not possible to read (`{1}`)."
            }
            ScannerError::ZipSeek(_) => "Uploaded file archive is not possible to seek (`{1}`).",
            ScannerError::InconsistentGzip(_) => "Uploaded file is inconsistent GZ archive (`{1}`).",
            ScannerError::Unsupported(_) => "",
        }
    }

    /// Wraps the error into the upload taxonomy for `file`.
    pub fn into_upload_error(self, file: &str) -> UploadError {
        match self {
            ScannerError::Unsupported(message) => UploadError::BombScannerUnsupported(message),
            other => UploadError::BombScanner {
                template: other.message_template().to_string(),
                file: file.to_string(),
            },
        }
    }
}

/// Settings shared by every scanner built during one scan.
#[derive(Debug, Clone)]
pub struct ScanSettings {
    /// Where scanners and the detector create their work directories.
    pub tmp_dir: PathBuf,
    pub png_max_width_height: u32,
    pub temp_tracker: TempTracker,
}

/// One layer of a scanned file.
///
/// Lifecycle: `open`, then `move_next` until it returns false while reading
/// entry data through `entry_size`/`entry_name`/`extract_entry`, then
/// `close`.
pub trait BombScanner {
    fn id(&self) -> &'static str;

    /// False for leaf formats that are checked on open but never iterated.
    fn is_archive(&self) -> bool;

    fn is_supported(&self) -> bool {
        true
    }

    fn not_supported_error(&self) -> String {
        String::new()
    }

    /// Size of the scanned file on disk.
    fn compressed_size(&self) -> u64;

    /// Opens and validates the file. `expansion_budget` is the number of
    /// bytes the scanner may decompress to disk while opening.
    fn open(&mut self, expansion_budget: u64) -> Result<(), ScannerError>;

    fn close(&mut self);

    /// Advances to the next entry; false once entries are exhausted.
    fn move_next(&mut self) -> bool;

    /// Uncompressed size of the current entry as declared by the format.
    fn entry_size(&mut self) -> Result<u64, ScannerError>;

    /// Name of the current entry, `None` for entries to skip.
    fn entry_name(&mut self) -> Result<Option<String>, ScannerError>;

    /// Writes at most `limit + 1` bytes of the current entry to `dest`.
    /// Returns `None` when the entry has no content to extract.
    fn extract_entry(&mut self, dest: &Path, limit: u64) -> Result<Option<PathBuf>, ScannerError>;
}

/// Constructor and magic-byte matcher for one scanner type.
#[derive(Clone, Copy)]
pub struct ScannerKind {
    pub id: &'static str,
    pub matches_magic: fn(&[u8]) -> bool,
    pub build: fn(&Path, &ScanSettings) -> Box<dyn BombScanner>,
}

impl std::fmt::Debug for ScannerKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScannerKind").field("id", &self.id).finish()
    }
}

/// Registry mapping scanner identifiers to their kinds.
#[derive(Debug, Clone)]
pub struct ScannerRegistry {
    kinds: HashMap<&'static str, ScannerKind>,
}

impl ScannerRegistry {
    /// Registry with the built-in `zip`, `png`, `gzip` and `rar` scanners.
    pub fn new() -> Self {
        let mut registry = Self {
            kinds: HashMap::new(),
        };
        registry.register(ZipScanner::kind());
        registry.register(PngScanner::kind());
        registry.register(GzipScanner::kind());
        registry.register(RarScanner::kind());
        registry
    }

    /// Adds a scanner kind, replacing any kind with the same id.
    pub fn register(&mut self, kind: ScannerKind) {
        if self.kinds.insert(kind.id, kind).is_some() {
            tracing::debug!(scanner = kind.id, "Replaced registered bomb scanner");
        }
    }

    pub fn get(&self, id: &str) -> Option<ScannerKind> {
        self.kinds.get(id).copied()
    }

    pub fn ids(&self) -> Vec<&'static str> {
        let mut ids: Vec<_> = self.kinds.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Resolves configured identifiers, keeping their order.
    pub fn resolve(&self, ids: &[String]) -> Result<Vec<ScannerKind>, UploadError> {
        ids.iter()
            .map(|id| {
                let key = id.trim().to_ascii_lowercase();
                self.get(&key)
                    .ok_or_else(|| UploadError::UnknownBombScanner(id.clone()))
            })
            .collect()
    }
}

impl Default for ScannerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Reads up to [`MAGIC_LEN`] leading bytes.
pub fn read_magic(path: &Path) -> io::Result<Vec<u8>> {
    let mut magic = Vec::with_capacity(MAGIC_LEN);
    File::open(path)?
        .take(MAGIC_LEN as u64)
        .read_to_end(&mut magic)?;
    Ok(magic)
}

/// Builds the first scanner in `kinds` whose magic bytes match `path`.
pub fn select_scanner(
    kinds: &[ScannerKind],
    path: &Path,
    settings: &ScanSettings,
) -> io::Result<Option<Box<dyn BombScanner>>> {
    let magic = read_magic(path)?;
    Ok(kinds
        .iter()
        .find(|kind| (kind.matches_magic)(&magic))
        .map(|kind| (kind.build)(path, settings)))
}

fn file_size(path: &Path) -> u64 {
    std::fs::metadata(path).map(|m| m.len()).unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn settings(dir: &TempDir) -> ScanSettings {
        ScanSettings {
            tmp_dir: dir.path().to_path_buf(),
            png_max_width_height: 100,
            temp_tracker: TempTracker::new(),
        }
    }

    #[test]
    fn test_registry_resolves_in_configured_order() {
        let registry = ScannerRegistry::new();
        let kinds = registry
            .resolve(&["gzip".to_string(), "ZIP".to_string()])
            .unwrap();
        let ids: Vec<_> = kinds.iter().map(|k| k.id).collect();
        assert_eq!(ids, vec!["gzip", "zip"]);
        assert_eq!(registry.ids(), vec!["gzip", "png", "rar", "zip"]);
    }

    #[test]
    fn test_registry_unknown_scanner() {
        let registry = ScannerRegistry::new();
        let err = registry.resolve(&["arj".to_string()]).unwrap_err();
        assert_eq!(err, UploadError::UnknownBombScanner("arj".to_string()));
    }

    #[test]
    fn test_select_scanner_by_magic() {
        let dir = TempDir::new().unwrap();
        let settings = settings(&dir);
        let kinds = ScannerRegistry::new()
            .resolve(&["zip".into(), "png".into(), "gzip".into(), "rar".into()])
            .unwrap();

        let cases: &[(&[u8], Option<&str>)] = &[
            (b"PK\x03\x04rest", Some("zip")),
            (b"\x89PNG\r\n", Some("png")),
            (b"\x1f\x8b\x08\x00", Some("gzip")),
            (b"Rar!\x1a\x07", Some("rar")),
            (b"plain text", None),
            (b"PK", None),
        ];
        for (i, (content, expected)) in cases.iter().enumerate() {
            let path = dir.path().join(format!("f{}", i));
            std::fs::write(&path, content).unwrap();
            let scanner = select_scanner(&kinds, &path, &settings).unwrap();
            assert_eq!(scanner.map(|s| s.id()), *expected);
        }
    }

    #[test]
    fn test_scanner_error_into_upload_error() {
        let err = ScannerError::InvalidPng.into_upload_error("a.png");
        assert_eq!(
            err.to_string(),
            "Uploaded file is inconsistent PNG image (`a.png`)."
        );
        let err = ScannerError::Unsupported("not installed".into()).into_upload_error("a.rar");
        assert_eq!(err, UploadError::BombScannerUnsupported("not installed".into()));
    }
}
