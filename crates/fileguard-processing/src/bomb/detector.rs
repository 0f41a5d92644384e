use std::path::{Path, PathBuf};

use fileguard_core::{UploadConstraints, UploadError};
use tempfile::TempDir;

use super::{file_size, select_scanner, BombScanner, ScanSettings, ScannerKind};

/// Totals shared by every level of one scan, so nested archives count
/// against the same limits as the root.
#[derive(Debug, Clone, Default)]
pub struct BombScanContext {
    pub entries_total_count: u64,
    pub entries_total_size: u64,
    /// Decompressed bytes tolerated for the whole tree, fixed at the root.
    pub all_entries_max_size: u64,
    pub uploaded_file_name: String,
}

impl BombScanContext {
    pub fn new(uploaded_file_name: impl Into<String>) -> Self {
        Self {
            uploaded_file_name: uploaded_file_name.into(),
            ..Self::default()
        }
    }

    /// Bytes that may still be extracted before the expansion limit.
    pub fn remaining(&self) -> u64 {
        self.all_entries_max_size
            .saturating_sub(self.entries_total_size)
    }
}

/// Recursive decompression-bomb detector.
pub struct BombDetector {
    scanners: Vec<ScannerKind>,
    settings: ScanSettings,
    max_items: u64,
    max_levels: u32,
    max_compress_percentage: f64,
}

impl BombDetector {
    pub fn new(scanners: Vec<ScannerKind>, settings: ScanSettings, constraints: &UploadConstraints) -> Self {
        Self {
            scanners,
            settings,
            max_items: constraints.archive_max_items,
            max_levels: constraints.archive_max_levels,
            max_compress_percentage: constraints.archive_max_compress_percentage,
        }
    }

    /// Scans the uploaded file at `path`. `file_name` is the name reported
    /// in error messages.
    pub fn scan(&self, path: &Path, file_name: &str) -> Result<(), UploadError> {
        let scanner = match select_scanner(&self.scanners, path, &self.settings) {
            Ok(Some(scanner)) => scanner,
            Ok(None) => return Ok(()),
            Err(e) => {
                tracing::warn!(file = %file_name, error = %e, "Failed to read file for bomb scan");
                return Err(UploadError::FileBomb(file_name.to_string()));
            }
        };

        let mut ctx = BombScanContext::new(file_name);
        let result = self.scan_archive(scanner, &mut ctx, 0);
        match &result {
            Ok(()) => tracing::debug!(
                file = %file_name,
                entries = ctx.entries_total_count,
                size = ctx.entries_total_size,
                "Bomb scan passed"
            ),
            Err(e) => tracing::warn!(
                file = %file_name,
                entries = ctx.entries_total_count,
                size = ctx.entries_total_size,
                error = %e,
                "Bomb scan rejected file"
            ),
        }
        result
    }

    fn scan_archive(
        &self,
        mut scanner: Box<dyn BombScanner>,
        ctx: &mut BombScanContext,
        level: u32,
    ) -> Result<(), UploadError> {
        if !scanner.is_supported() {
            return Err(UploadError::BombScannerUnsupported(scanner.not_supported_error()));
        }

        let compressed_size = scanner.compressed_size();
        if level == 0 && scanner.is_archive() {
            ctx.all_entries_max_size =
                (compressed_size as f64 * (100.0 / self.max_compress_percentage)) as u64;
        }

        if let Err(e) = scanner.open(ctx.remaining()) {
            scanner.close();
            return Err(e.into_upload_error(&ctx.uploaded_file_name));
        }

        if !scanner.is_archive() {
            scanner.close();
            return Ok(());
        }

        let iterated = self.scan_entries(scanner.as_mut(), ctx, level);
        scanner.close();
        iterated?;

        if level > 0 || ctx.entries_total_size == 0 {
            return Ok(());
        }

        let compress_percentage = compressed_size as f64 / ctx.entries_total_size as f64 * 100.0;
        if compress_percentage > self.max_compress_percentage {
            Ok(())
        } else {
            Err(UploadError::BombTooHighCompression(ctx.uploaded_file_name.clone()))
        }
    }

    fn scan_entries(
        &self,
        scanner: &mut dyn BombScanner,
        ctx: &mut BombScanContext,
        level: u32,
    ) -> Result<(), UploadError> {
        let name = ctx.uploaded_file_name.clone();
        let scanner_error = |e: super::ScannerError| e.into_upload_error(&name);

        while scanner.move_next() {
            if self.settings.temp_tracker.is_cancelled() {
                return Err(UploadError::Cancelled);
            }
            ctx.entries_total_count += 1;
            if ctx.entries_total_count > self.max_items {
                return Err(UploadError::BombTooManyFiles(name.clone()));
            }

            let entry_size = scanner.entry_size().map_err(scanner_error)?;
            if ctx.entries_total_size.saturating_add(entry_size) > ctx.all_entries_max_size {
                return Err(UploadError::BombTooHighCompression(name.clone()));
            }

            let Some(entry_name) = scanner.entry_name().map_err(scanner_error)? else {
                continue;
            };

            let entry_dir = self.entry_dir(&entry_name)?;
            let result = self.scan_entry(scanner, ctx, level, &entry_dir, entry_size);
            self.settings.temp_tracker.untrack(entry_dir.path());
            if let Err(e) = entry_dir.close() {
                tracing::warn!(error = %e, "Failed to remove extracted archive entry");
            }
            result?;
        }
        Ok(())
    }

    fn scan_entry(
        &self,
        scanner: &mut dyn BombScanner,
        ctx: &mut BombScanContext,
        level: u32,
        entry_dir: &EntryDir,
        entry_size: u64,
    ) -> Result<(), UploadError> {
        let name = ctx.uploaded_file_name.clone();
        let extracted = scanner
            .extract_entry(&entry_dir.target, ctx.remaining())
            .map_err(|e| e.into_upload_error(&name))?;

        let Some(extracted) = extracted else {
            ctx.entries_total_size = ctx.entries_total_size.saturating_add(entry_size);
            return Ok(());
        };

        ctx.entries_total_size = ctx.entries_total_size.saturating_add(file_size(&extracted));
        if ctx.entries_total_size > ctx.all_entries_max_size {
            return Err(UploadError::BombTooHighCompression(name));
        }

        let nested = select_scanner(&self.scanners, &extracted, &self.settings).map_err(|e| {
            tracing::warn!(file = %name, error = %e, "Failed to probe extracted entry");
            UploadError::FileBomb(name.clone())
        })?;
        let Some(nested) = nested else {
            return Ok(());
        };

        if nested.is_archive() && level + 1 >= self.max_levels {
            return Err(UploadError::BombTooManyLevels(name));
        }
        tracing::debug!(file = %name, scanner = nested.id(), level = level + 1, "Scanning nested entry");
        self.scan_archive(nested, ctx, level + 1)
    }

    /// Creates a uniquely named, tracked directory for one extracted entry.
    fn entry_dir(&self, entry_name: &str) -> Result<EntryDir, UploadError> {
        let base = safe_base_name(entry_name);
        let dir = tempfile::Builder::new()
            .prefix(&format!("{}.", base))
            .tempdir_in(&self.settings.tmp_dir)
            .map_err(|e| {
                tracing::warn!(
                    dir = %self.settings.tmp_dir.display(),
                    error = %e,
                    "Failed to create archive entry directory"
                );
                UploadError::CantWrite
            })?;
        self.settings.temp_tracker.track(dir.path());
        let target = dir.path().join(&base);
        Ok(EntryDir { dir, target })
    }
}

struct EntryDir {
    dir: TempDir,
    target: PathBuf,
}

impl EntryDir {
    fn path(&self) -> &Path {
        self.dir.path()
    }

    fn close(self) -> std::io::Result<()> {
        self.dir.close()
    }
}

/// Last path segment of an entry name, reduced to `[A-Za-z0-9_.]`.
fn safe_base_name(entry_name: &str) -> String {
    let base = entry_name
        .trim_end_matches(['/', '\\'])
        .rsplit(['/', '\\'])
        .next()
        .unwrap_or_default();
    let cleaned: String = base
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '_' || *c == '.')
        .collect();
    if cleaned.is_empty() || cleaned.chars().all(|c| c == '.') {
        "entry".to_string()
    } else {
        cleaned
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bomb::ScannerRegistry;
    use crate::temp::TempTracker;
    use std::fs::{self, File};
    use std::io::Write;
    use zip::write::FileOptions;
    use zip::{CompressionMethod, ZipWriter};

    fn detector(dir: &TempDir, constraints: &UploadConstraints) -> BombDetector {
        let kinds = ScannerRegistry::new()
            .resolve(&constraints.bomb_scanners)
            .unwrap();
        let settings = ScanSettings {
            tmp_dir: dir.path().to_path_buf(),
            png_max_width_height: constraints.png_image_max_width_height,
            temp_tracker: TempTracker::new(),
        };
        BombDetector::new(kinds, settings, constraints)
    }

    fn zip_bytes(entries: &[(&str, Vec<u8>)], method: CompressionMethod) -> Vec<u8> {
        let mut writer = ZipWriter::new(std::io::Cursor::new(Vec::new()));
        let options = FileOptions::default().compression_method(method);
        for (name, content) in entries {
            writer.start_file(*name, options).unwrap();
            writer.write_all(content).unwrap();
        }
        writer.finish().unwrap().into_inner()
    }

    fn write(dir: &TempDir, name: &str, content: &[u8]) -> PathBuf {
        let path = dir.path().join(name);
        File::create(&path).unwrap().write_all(content).unwrap();
        path
    }

    fn leftover_entries(dir: &TempDir) -> usize {
        fs::read_dir(dir.path())
            .unwrap()
            .filter(|e| e.as_ref().unwrap().path().is_dir())
            .count()
    }

    #[test]
    fn test_plain_file_is_not_scanned() {
        let dir = TempDir::new().unwrap();
        let path = write(&dir, "a.txt", b"just text");
        let constraints = UploadConstraints::new(vec![".txt".into()]);
        assert!(detector(&dir, &constraints).scan(&path, "a.txt").is_ok());
    }

    #[test]
    fn test_incompressible_zip_passes() {
        let dir = TempDir::new().unwrap();
        let content: Vec<u8> = (0..4096u32).map(|i| (i.wrapping_mul(2_654_435_761) >> 13) as u8).collect();
        let archive = zip_bytes(&[("noise.bin", content)], CompressionMethod::Stored);
        let path = write(&dir, "a.zip", &archive);

        let constraints = UploadConstraints::new(vec![".zip".into()]);
        assert!(detector(&dir, &constraints).scan(&path, "a.zip").is_ok());
        assert_eq!(leftover_entries(&dir), 0);
    }

    #[test]
    fn test_highly_compressed_zip_rejected() {
        let dir = TempDir::new().unwrap();
        let archive = zip_bytes(&[("zeros.bin", vec![0u8; 1_000_000])], CompressionMethod::Deflated);
        let path = write(&dir, "bomb.zip", &archive);

        let constraints = UploadConstraints::new(vec![".zip".into()]);
        let err = detector(&dir, &constraints).scan(&path, "bomb.zip").unwrap_err();
        assert_eq!(err, UploadError::BombTooHighCompression("bomb.zip".to_string()));
        assert_eq!(leftover_entries(&dir), 0);
    }

    #[test]
    fn test_too_many_entries_rejected() {
        let dir = TempDir::new().unwrap();
        let entries: Vec<(String, Vec<u8>)> = (0..20).map(|i| (format!("f{}.txt", i), vec![b'x'])).collect();
        let refs: Vec<(&str, Vec<u8>)> = entries.iter().map(|(n, c)| (n.as_str(), c.clone())).collect();
        let path = write(&dir, "many.zip", &zip_bytes(&refs, CompressionMethod::Stored));

        let mut constraints = UploadConstraints::new(vec![".zip".into()]);
        constraints.archive_max_items = 10;
        let err = detector(&dir, &constraints).scan(&path, "many.zip").unwrap_err();
        assert_eq!(err, UploadError::BombTooManyFiles("many.zip".to_string()));
        assert_eq!(leftover_entries(&dir), 0);
    }

    #[test]
    fn test_nesting_limit() {
        let dir = TempDir::new().unwrap();
        let noise: Vec<u8> = (0..2048u32).map(|i| (i.wrapping_mul(2_246_822_519) >> 11) as u8).collect();
        let inner = zip_bytes(&[("noise.bin", noise)], CompressionMethod::Stored);
        let middle = zip_bytes(&[("inner.zip", inner)], CompressionMethod::Stored);
        let path = write(&dir, "outer.zip", &middle);

        let mut constraints = UploadConstraints::new(vec![".zip".into()]);
        assert!(detector(&dir, &constraints).scan(&path, "outer.zip").is_ok());

        constraints.archive_max_levels = 1;
        let err = detector(&dir, &constraints).scan(&path, "outer.zip").unwrap_err();
        assert_eq!(err, UploadError::BombTooManyLevels("outer.zip".to_string()));
        assert_eq!(leftover_entries(&dir), 0);
    }

    #[test]
    fn test_cancelled_scan_stops_before_extracting() {
        let dir = TempDir::new().unwrap();
        let noise: Vec<u8> = (0..2048u32).map(|i| (i.wrapping_mul(2_246_822_519) >> 11) as u8).collect();
        let archive = zip_bytes(&[("a.bin", noise.clone()), ("b.bin", noise)], CompressionMethod::Stored);
        let path = write(&dir, "a.zip", &archive);

        let constraints = UploadConstraints::new(vec![".zip".into()]);
        let detector = detector(&dir, &constraints);
        detector.settings.temp_tracker.cancel();

        assert_eq!(detector.scan(&path, "a.zip"), Err(UploadError::Cancelled));
        assert_eq!(leftover_entries(&dir), 0);
        assert!(detector.settings.temp_tracker.is_empty());
    }

    #[test]
    fn test_unsupported_scanner_fails_closed() {
        let dir = TempDir::new().unwrap();
        let path = write(&dir, "a.rar", b"Rar!\x1a\x07\x00rest");
        let mut constraints = UploadConstraints::new(vec![".rar".into()]);
        constraints.bomb_scanners.push("rar".into());
        let err = detector(&dir, &constraints).scan(&path, "a.rar").unwrap_err();
        assert!(matches!(err, UploadError::BombScannerUnsupported(_)));
    }

    #[test]
    fn test_safe_base_name() {
        assert_eq!(safe_base_name("dir/sub/file name!.txt"), "filename.txt");
        assert_eq!(safe_base_name("dir\\evil.zip"), "evil.zip");
        assert_eq!(safe_base_name("folder/"), "folder");
        assert_eq!(safe_base_name("***"), "entry");
        assert_eq!(safe_base_name(".."), "entry");
    }

    #[test]
    fn test_context_remaining() {
        let mut ctx = BombScanContext::new("a.zip");
        ctx.all_entries_max_size = 100;
        ctx.entries_total_size = 40;
        assert_eq!(ctx.remaining(), 60);
        ctx.entries_total_size = 140;
        assert_eq!(ctx.remaining(), 0);
    }
}
