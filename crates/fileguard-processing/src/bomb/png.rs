use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};

use super::{file_size, BombScanner, ScanSettings, ScannerError, ScannerKind};

const PNG_MAGIC: &[u8] = &[0x89, b'P', b'N', b'G'];

/// Signature (8) + IHDR chunk length (4).
const IHDR_OFFSET: usize = 12;

/// Leaf scanner bounding PNG dimensions, since a small PNG can inflate to
/// an enormous bitmap.
pub struct PngScanner {
    path: PathBuf,
    compressed_size: u64,
    max_width_height: u32,
}

impl PngScanner {
    pub fn new(path: &Path, max_width_height: u32) -> Self {
        Self {
            path: path.to_path_buf(),
            compressed_size: file_size(path),
            max_width_height,
        }
    }

    pub fn matches_magic(magic: &[u8]) -> bool {
        magic.starts_with(PNG_MAGIC)
    }

    pub fn kind() -> ScannerKind {
        ScannerKind {
            id: "png",
            matches_magic: Self::matches_magic,
            build: build_png,
        }
    }
}

fn build_png(path: &Path, settings: &ScanSettings) -> Box<dyn BombScanner> {
    Box::new(PngScanner::new(path, settings.png_max_width_height))
}

impl BombScanner for PngScanner {
    fn id(&self) -> &'static str {
        "png"
    }

    fn is_archive(&self) -> bool {
        false
    }

    fn compressed_size(&self) -> u64 {
        self.compressed_size
    }

    fn open(&mut self, _expansion_budget: u64) -> Result<(), ScannerError> {
        let mut header = Vec::with_capacity(IHDR_OFFSET + 12);
        File::open(&self.path)?
            .take((IHDR_OFFSET + 12) as u64)
            .read_to_end(&mut header)?;

        if header.get(IHDR_OFFSET..IHDR_OFFSET + 4) != Some(b"IHDR".as_slice()) {
            return Err(ScannerError::InvalidPng);
        }

        let read_u32 = |offset: usize| {
            header
                .get(offset..offset + 4)
                .and_then(|b| b.try_into().ok())
                .map(u32::from_be_bytes)
                .unwrap_or(0)
        };
        let width = read_u32(IHDR_OFFSET + 4);
        let height = read_u32(IHDR_OFFSET + 8);
        if width > self.max_width_height || height > self.max_width_height {
            tracing::warn!(width, height, max = self.max_width_height, "PNG dimensions over limit");
            return Err(ScannerError::InvalidSize);
        }
        Ok(())
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
