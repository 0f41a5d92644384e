use std::fs::{self, File};
use std::io::{self, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use flate2::read::MultiGzDecoder;
use tempfile::TempDir;

use super::{file_size, BombScanner, ScanSettings, ScannerError, ScannerKind};
use crate::temp::TempTracker;

const GZIP_MAGIC: &[u8] = &[0x1F, 0x8B, 0x08];

const USTAR_MAGIC: &[u8] = b"ustar";
const USTAR_MAGIC_OFFSET: usize = 257;

/// One member exposed by the scanner.
#[derive(Debug, Clone)]
struct GzEntry {
    name: String,
    size: u64,
    /// Byte range inside the decompressed file; `None` when the content was
    /// never decompressed because its declared size is over budget.
    offset: Option<u64>,
}

/// Archive scanner for gzip streams.
///
/// The stream is decompressed into a tracked work directory. A decompressed
/// tar is exposed member by member, anything else as one opaque entry.
pub struct GzipScanner {
    path: PathBuf,
    compressed_size: u64,
    tmp_dir: PathBuf,
    temp_tracker: TempTracker,
    work_dir: Option<TempDir>,
    decompressed: Option<PathBuf>,
    entries: Vec<GzEntry>,
    index: Option<usize>,
}

impl GzipScanner {
    pub fn new(path: &Path, settings: &ScanSettings) -> Self {
        Self {
            path: path.to_path_buf(),
            compressed_size: file_size(path),
            tmp_dir: settings.tmp_dir.clone(),
            temp_tracker: settings.temp_tracker.clone(),
            work_dir: None,
            decompressed: None,
            entries: Vec::new(),
            index: None,
        }
    }

    pub fn matches_magic(magic: &[u8]) -> bool {
        magic.starts_with(GZIP_MAGIC)
    }

    pub fn kind() -> ScannerKind {
        ScannerKind {
            id: "gzip",
            matches_magic: Self::matches_magic,
            build: build_gzip,
        }
    }

    /// Uncompressed size modulo 2^32 from the trailer of the last member.
    fn declared_size(&self) -> io::Result<u64> {
        if self.compressed_size < 4 {
            return Ok(0);
        }
        let mut file = File::open(&self.path)?;
        file.seek(SeekFrom::End(-4))?;
        let mut trailer = [0u8; 4];
        file.read_exact(&mut trailer)?;
        Ok(u32::from_le_bytes(trailer) as u64)
    }

    fn opaque_name(&self) -> String {
        let name = self
            .path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        let lower = name.to_ascii_lowercase();
        if lower.ends_with(".tgz") {
            format!("{}.tar", &name[..name.len() - 4])
        } else if lower.ends_with(".gz") {
            name[..name.len() - 3].to_string()
        } else if name.is_empty() {
            "content".to_string()
        } else {
            name
        }
    }

    fn decompress(&mut self, budget: u64) -> Result<(PathBuf, u64), ScannerError> {
        let work_dir = tempfile::Builder::new()
            .prefix("gz-")
            .tempdir_in(&self.tmp_dir)?;
        self.temp_tracker.track(work_dir.path());
        let target = work_dir.path().join("content");
        self.work_dir = Some(work_dir);

        let decoder = MultiGzDecoder::new(File::open(&self.path)?);
        let mut out = File::create(&target)?;
        let written = io::copy(&mut decoder.take(budget.saturating_add(1)), &mut out)
            .map_err(|e| ScannerError::InconsistentGzip(e.to_string()))?;
        Ok((target, written))
    }

    fn tar_entries(decompressed: &Path) -> io::Result<Option<Vec<GzEntry>>> {
        let mut head = Vec::with_capacity(USTAR_MAGIC_OFFSET + USTAR_MAGIC.len());
        File::open(decompressed)?
            .take((USTAR_MAGIC_OFFSET + USTAR_MAGIC.len()) as u64)
            .read_to_end(&mut head)?;
        if head.get(USTAR_MAGIC_OFFSET..) != Some(USTAR_MAGIC) {
            return Ok(None);
        }

        let mut archive = tar::Archive::new(File::open(decompressed)?);
        let mut entries = Vec::new();
        for entry in archive.entries()? {
            let entry = entry?;
            if !entry.header().entry_type().is_file() {
                continue;
            }
            entries.push(GzEntry {
                name: entry.path()?.to_string_lossy().to_string(),
                size: entry.size(),
                offset: Some(entry.raw_file_position()),
            });
        }
        Ok(Some(entries))
    }

    fn current(&self) -> Result<&GzEntry, ScannerError> {
        self.index
            .and_then(|i| self.entries.get(i))
            .ok_or_else(|| ScannerError::InconsistentGzip("no current entry".to_string()))
    }

    fn drop_work_dir(&mut self) {
        if let Some(dir) = self.work_dir.take() {
            self.temp_tracker.untrack(dir.path());
            if let Err(e) = dir.close() {
                tracing::warn!(error = %e, "Failed to remove gzip work directory");
            }
        }
    }
}

fn build_gzip(path: &Path, settings: &ScanSettings) -> Box<dyn BombScanner> {
    Box::new(GzipScanner::new(path, settings))
}

impl BombScanner for GzipScanner {
    fn id(&self) -> &'static str {
        "gzip"
    }

    fn is_archive(&self) -> bool {
        true
    }

    fn compressed_size(&self) -> u64 {
        self.compressed_size
    }

    fn open(&mut self, expansion_budget: u64) -> Result<(), ScannerError> {
        self.entries.clear();
        self.index = None;

        let declared = self.declared_size()?;
        if declared > expansion_budget {
            tracing::debug!(
                declared,
                budget = expansion_budget,
                "Gzip trailer declares more than the expansion budget"
            );
            self.entries.push(GzEntry {
                name: self.opaque_name(),
                size: declared,
                offset: None,
            });
            return Ok(());
        }

        let (decompressed, written) = self.decompress(expansion_budget)?;
        if written == self.compressed_size && fs::read(&decompressed)? == fs::read(&self.path)? {
            return Err(ScannerError::InconsistentGzip(
                "decompressed content equals the archive".to_string(),
            ));
        }

        let truncated = written > expansion_budget;
        let members = if truncated {
            None
        } else {
            Self::tar_entries(&decompressed).unwrap_or_else(|e| {
                tracing::debug!(error = %e, "Gzip content is not a readable tar, scanning as one entry");
                None
            })
        };
        self.entries = members.unwrap_or_else(|| {
            vec![GzEntry {
                name: self.opaque_name(),
                size: written,
                offset: Some(0),
            }]
        });
        self.decompressed = Some(decompressed);
        Ok(())
    }

    fn close(&mut self) {
        self.entries.clear();
        self.index = None;
        self.decompressed = None;
        self.drop_work_dir();
    }

    fn move_next(&mut self) -> bool {
        let next = self.index.map(|i| i + 1).unwrap_or(0);
        if next < self.entries.len() {
            self.index = Some(next);
            true
        } else {
            false
        }
    }

    fn entry_size(&mut self) -> Result<u64, ScannerError> {
        Ok(self.current()?.size)
    }

    fn entry_name(&mut self) -> Result<Option<String>, ScannerError> {
        Ok(Some(self.current()?.name.clone()))
    }

    fn extract_entry(&mut self, dest: &Path, limit: u64) -> Result<Option<PathBuf>, ScannerError> {
        let entry = self.current()?.clone();
        let (Some(offset), Some(source)) = (entry.offset, self.decompressed.as_ref()) else {
            return Ok(None);
        };

        let mut input = File::open(source)?;
        input.seek(SeekFrom::Start(offset))?;
        let mut out = File::create(dest)?;
        io::copy(
            &mut input.take(entry.size.min(limit.saturating_add(1))),
            &mut out,
        )?;
        Ok(Some(dest.to_path_buf()))
    }
}

impl Drop for GzipScanner {
    fn drop(&mut self) {
        self.drop_work_dir();
    }
}
