use std::path::{Path, PathBuf};

use super::{file_size, BombScanner, ScanSettings, ScannerError, ScannerKind};

const RAR_MAGIC: &[u8] = b"Rar!";

const NOT_SUPPORTED: &str =
    "Uploaded file is RAR archive, which could not be checked for dangerous content.";

/// Placeholder for RAR archives. There is no entry reader, so a matched
/// file is always rejected instead of passing through unscanned.
pub struct RarScanner {
    compressed_size: u64,
}

impl RarScanner {
    pub fn new(path: &Path) -> Self {
        Self {
            compressed_size: file_size(path),
        }
    }

    pub fn matches_magic(magic: &[u8]) -> bool {
        magic.starts_with(RAR_MAGIC)
    }

    pub fn kind() -> ScannerKind {
        ScannerKind {
            id: "rar",
            matches_magic: Self::matches_magic,
            build: build_rar,
        }
    }
}

fn build_rar(path: &Path, _settings: &ScanSettings) -> Box<dyn BombScanner> {
    Box::new(RarScanner::new(path))
}

impl BombScanner for RarScanner {
    fn id(&self) -> &'static str {
        "rar"
    }

    fn is_archive(&self) -> bool {
        true
    }

    fn is_supported(&self) -> bool {
        false
    }

    fn not_supported_error(&self) -> String {
        NOT_SUPPORTED.to_string()
    }

    fn compressed_size(&self) -> u64 {
        self.compressed_size
    }

    fn open(&mut self, _expansion_budget: u64) -> Result<(), ScannerError> {
        Err(ScannerError::Unsupported(self.not_supported_error()))
    }

    fn close(&mut self) {}

    fn move_next(&mut self) -> bool {
        false
    }

    fn entry_size(&mut self) -> Result<u64, ScannerError> {
        Ok(0)
    }

    fn entry_name(&mut self) -> Result<Option<String>, ScannerError> {
        Ok(None)
    }

    fn extract_entry(&mut self, _dest: &Path, _limit: u64) -> Result<Option<PathBuf>, ScannerError> {
        Ok(None)
    }
}
