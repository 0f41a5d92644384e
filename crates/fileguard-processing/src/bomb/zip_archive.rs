use std::fs::File;
use std::io;
#[cfg(feature = "zip")]
use std::io::Read;
use std::path::{Path, PathBuf};

#[cfg(feature = "zip")]
use zip::result::ZipError;
#[cfg(feature = "zip")]
use zip::ZipArchive;

use super::{file_size, BombScanner, ScanSettings, ScannerError, ScannerKind};

const ZIP_MAGIC: &[u8] = b"PK\x03\x04";

/// Archive scanner for ZIP files, backed by the `zip` crate when the
/// `zip` feature is enabled.
pub struct ZipScanner {
    path: PathBuf,
    compressed_size: u64,
    #[cfg(feature = "zip")]
    archive: Option<ZipArchive<File>>,
    /// Index of the current entry; `None` before the first `move_next`.
    index: Option<usize>,
}

impl ZipScanner {
    pub fn new(path: &Path) -> Self {
        Self {
            path: path.to_path_buf(),
            compressed_size: file_size(path),
            #[cfg(feature = "zip")]
            archive: None,
            index: None,
        }
    }

    pub fn matches_magic(magic: &[u8]) -> bool {
        magic.starts_with(ZIP_MAGIC)
    }

    pub fn kind() -> ScannerKind {
        ScannerKind {
            id: "zip",
            matches_magic: Self::matches_magic,
            build: build_zip,
        }
    }

    #[cfg(feature = "zip")]
    fn current(&mut self) -> Result<zip::read::ZipFile<'_>, ScannerError> {
        let index = self
            .index
            .ok_or_else(|| ScannerError::ZipSeek("no current entry".to_string()))?;
        let archive = self
            .archive
            .as_mut()
            .ok_or_else(|| ScannerError::ZipRead("archive is not open".to_string()))?;
        archive.by_index(index).map_err(map_zip_error)
    }
}

fn build_zip(path: &Path, _settings: &ScanSettings) -> Box<dyn BombScanner> {
    Box::new(ZipScanner::new(path))
}

#[cfg(feature = "zip")]
fn map_zip_error(err: ZipError) -> ScannerError {
    match err {
        ZipError::InvalidArchive(msg) if msg.to_ascii_lowercase().contains("central directory") => {
            ScannerError::NotZip(msg.to_string())
        }
        ZipError::InvalidArchive(msg) => ScannerError::InconsistentZip(msg.to_string()),
        ZipError::FileNotFound => ScannerError::ZipOpen(err.to_string()),
        ZipError::Io(e) if e.kind() == io::ErrorKind::NotFound => ScannerError::ZipOpen(e.to_string()),
        other => ScannerError::ZipRead(other.to_string()),
    }
}

impl BombScanner for ZipScanner {
    fn id(&self) -> &'static str {
        "zip"
    }

    fn is_archive(&self) -> bool {
        true
    }

    fn is_supported(&self) -> bool {
        cfg!(feature = "zip")
    }

    fn not_supported_error(&self) -> String {
        "System extension to detect dangerous ZIP archives is not installed.".to_string()
    }

    fn compressed_size(&self) -> u64 {
        self.compressed_size
    }

    #[cfg(feature = "zip")]
    fn open(&mut self, _expansion_budget: u64) -> Result<(), ScannerError> {
        let file = File::open(&self.path).map_err(|e| ScannerError::ZipOpen(e.to_string()))?;
        let archive = ZipArchive::new(file).map_err(map_zip_error)?;
        tracing::debug!(path = %self.path.display(), entries = archive.len(), "Opened ZIP archive");
        self.archive = Some(archive);
        self.index = None;
        Ok(())
    }

    #[cfg(not(feature = "zip"))]
    fn open(&mut self, _expansion_budget: u64) -> Result<(), ScannerError> {
        Err(ScannerError::Unsupported(self.not_supported_error()))
    }

    fn close(&mut self) {
        #[cfg(feature = "zip")]
        {
            self.archive = None;
        }
        self.index = None;
    }

    #[cfg(feature = "zip")]
    fn move_next(&mut self) -> bool {
        let len = self.archive.as_ref().map(|a| a.len()).unwrap_or(0);
        let next = self.index.map(|i| i + 1).unwrap_or(0);
        if next < len {
            self.index = Some(next);
            true
        } else {
            false
        }
    }

    #[cfg(not(feature = "zip"))]
    fn move_next(&mut self) -> bool {
        false
    }

    #[cfg(feature = "zip")]
    fn entry_size(&mut self) -> Result<u64, ScannerError> {
        Ok(self.current()?.size())
    }

    #[cfg(not(feature = "zip"))]
    fn entry_size(&mut self) -> Result<u64, ScannerError> {
        Ok(0)
    }

    #[cfg(feature = "zip")]
    fn entry_name(&mut self) -> Result<Option<String>, ScannerError> {
        let entry = self.current()?;
        let name = entry.name().to_string();
        Ok((!name.is_empty()).then_some(name))
    }

    #[cfg(not(feature = "zip"))]
    fn entry_name(&mut self) -> Result<Option<String>, ScannerError> {
        Ok(None)
    }

    #[cfg(feature = "zip")]
    fn extract_entry(&mut self, dest: &Path, limit: u64) -> Result<Option<PathBuf>, ScannerError> {
        let entry = self.current()?;
        if entry.is_dir() {
            return Ok(None);
        }
        let mut out = File::create(dest)?;
        io::copy(&mut entry.take(limit.saturating_add(1)), &mut out).map_err(|e| {
            if e.kind() == io::ErrorKind::InvalidData || e.to_string().contains("checksum") {
                ScannerError::InconsistentZip(e.to_string())
            } else {
                ScannerError::ZipRead(e.to_string())
            }
        })?;
        Ok(Some(dest.to_path_buf()))
    }

    #[cfg(not(feature = "zip"))]
    fn extract_entry(&mut self, _dest: &Path, _limit: u64) -> Result<Option<PathBuf>, ScannerError> {
        Ok(None)
    }
}
