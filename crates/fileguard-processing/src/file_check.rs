use std::fs;

use fileguard_core::{human_size, UploadDescriptor, UploadError};

use crate::source::RawUploadSource;

/// Confirms a descriptor points at a genuine uploaded regular file and
/// that its on-disk size is within bounds.
#[derive(Debug, Clone, Default)]
pub struct FileAndSizeChecker {
    min_size: Option<u64>,
    max_size: Option<u64>,
}

impl FileAndSizeChecker {
    pub fn new(min_size: Option<u64>, max_size: Option<u64>) -> Self {
        Self { min_size, max_size }
    }

    /// Replaces the declared `size_bytes` with the size found on disk.
    pub fn check(
        &self,
        file: &mut UploadDescriptor,
        source: &dyn RawUploadSource,
    ) -> Result<(), UploadError> {
        if !source.is_uploaded_file(&file.temp_path) {
            return Err(UploadError::NotPosted);
        }
        if !file.temp_path.is_file() {
            return Err(UploadError::NotFile);
        }

        let size = fs::metadata(&file.temp_path)
            .map_err(|_| UploadError::TooLargeFile)?
            .len();
        if size < 1 {
            return Err(UploadError::EmptyFile);
        }
        file.size_bytes = size;

        if let Some(min_size) = self.min_size {
            if size < min_size {
                return Err(UploadError::MinSize(human_size(min_size)));
            }
        }
        if let Some(max_size) = self.max_size {
            if size > max_size {
                return Err(UploadError::MaxSize(human_size(max_size)));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::MultipartUploads;
    use fileguard_core::{RawFileField, TransportError};
    use tempfile::TempDir;

    fn upload(dir: &TempDir, content: &[u8]) -> (MultipartUploads, UploadDescriptor) {
        let path = dir.path().join("php_upload");
        fs::write(&path, content).unwrap();
        let tmp = path.to_string_lossy().to_string();
        let mut source = MultipartUploads::new();
        source.insert(
            "file",
            RawFileField::single("a.txt", "text/plain", tmp, 999, TransportError::Ok),
        );
        let entry = source.file_field("file").unwrap().entries().remove(0);
        (source, UploadDescriptor::from_entry(entry))
    }

    #[test]
    fn test_check_updates_size_from_disk() {
        let dir = TempDir::new().unwrap();
        let (source, mut file) = upload(&dir, b"hello");
        FileAndSizeChecker::default().check(&mut file, &source).unwrap();
        assert_eq!(file.size_bytes, 5);
    }

    #[test]
    fn test_not_posted() {
        let dir = TempDir::new().unwrap();
        let (source, mut file) = upload(&dir, b"hello");
        file.temp_path = dir.path().join("injected");
        fs::write(&file.temp_path, b"x").unwrap();
        assert!(matches!(
            FileAndSizeChecker::default().check(&mut file, &source),
            Err(UploadError::NotPosted)
        ));
    }

    #[test]
    fn test_not_file_and_empty() {
        let dir = TempDir::new().unwrap();
        let (source, mut file) = upload(&dir, b"");
        assert!(matches!(
            FileAndSizeChecker::default().check(&mut file, &source),
            Err(UploadError::EmptyFile)
        ));

        fs::remove_file(&file.temp_path).unwrap();
        fs::create_dir(&file.temp_path).unwrap();
        assert!(matches!(
            FileAndSizeChecker::default().check(&mut file, &source),
            Err(UploadError::NotFile)
        ));
    }

    #[test]
    fn test_min_and_max_size() {
        let dir = TempDir::new().unwrap();
        let (source, mut file) = upload(&dir, &[7u8; 2048]);
        let err = FileAndSizeChecker::new(Some(4096), None)
            .check(&mut file, &source)
            .unwrap_err();
        assert_eq!(err, UploadError::MinSize("4 KB".to_string()));

        let err = FileAndSizeChecker::new(None, Some(1024))
            .check(&mut file, &source)
            .unwrap_err();
        assert_eq!(err, UploadError::MaxSize("1 KB".to_string()));

        assert!(FileAndSizeChecker::new(Some(1024), Some(4096))
            .check(&mut file, &source)
            .is_ok());
    }
}
