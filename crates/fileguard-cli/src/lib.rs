//! Shared pieces of the `fileguard` command-line tool.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use fileguard_core::{ErrorMetadata, RawFileEntry, RawFileField, TransportError, UploadDescriptor, UploadError};
use fileguard_processing::{MultipartUploads, RawUploadSource, UploadValidator};
use serde::Serialize;
use tracing_subscriber::EnvFilter;

/// Filter used when neither `FILEGUARD_LOG` nor `RUST_LOG` is set.
const DEFAULT_LOG_FILTER: &str = "warn,fileguard_core=info,fileguard_processing=info,fileguard_cli=info";

/// Initialize tracing on stderr so stdout carries only the JSON report.
/// `FILEGUARD_LOG` takes precedence over `RUST_LOG`.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_env("FILEGUARD_LOG")
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_env_filter(filter)
        .init();
}

/// Outcome of one validation run as printed by the CLI.
#[derive(Debug, Serialize)]
pub struct Report {
    pub field: String,
    pub valid: bool,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub files: Vec<UploadDescriptor>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ReportError>,
}

#[derive(Debug, Serialize)]
pub struct ReportError {
    pub code: u16,
    pub error_code: &'static str,
    pub message: String,
}

impl Report {
    pub fn from_result(field: &str, result: Result<Vec<UploadDescriptor>, UploadError>) -> Self {
        match result {
            Ok(files) => Self {
                field: field.to_string(),
                valid: true,
                files,
                error: None,
            },
            Err(err) => Self {
                field: field.to_string(),
                valid: false,
                files: Vec::new(),
                error: Some(ReportError {
                    code: err.code(),
                    error_code: err.error_code(),
                    message: err.to_string(),
                }),
            },
        }
    }

    /// Report for a run cut short by the deadline.
    pub fn timed_out(field: &str, deadline: Duration) -> Self {
        Self {
            field: field.to_string(),
            valid: false,
            files: Vec::new(),
            error: Some(ReportError {
                code: 0,
                error_code: "TIMEOUT",
                message: format!("Validation did not finish within {} ms.", deadline.as_millis()),
            }),
        }
    }
}

/// Runs the validator on a blocking thread under `deadline`.
///
/// When the deadline passes the run is cancelled through its temp tracker,
/// which deletes everything tracked so far and anything the worker still
/// creates. The worker is awaited before returning, so no temp file
/// outlives the call.
pub async fn run_with_deadline(
    validator: UploadValidator,
    source: Arc<dyn RawUploadSource>,
    deadline: Duration,
) -> anyhow::Result<Report> {
    let field = validator.field().to_string();
    let tracker = validator.temp_tracker();
    let mut task = tokio::task::spawn_blocking(move || validator.validate(source.as_ref()));

    match tokio::time::timeout(deadline, &mut task).await {
        Ok(joined) => {
            let result = joined.context("Validation task failed")?;
            Ok(Report::from_result(&field, result))
        }
        Err(_) => {
            let removed = tracker.cancel();
            tracing::warn!(
                field = %field,
                removed,
                deadline_ms = deadline.as_millis() as u64,
                "Validation deadline exceeded, cancelling"
            );
            if let Err(e) = task.await {
                tracing::error!(field = %field, error = %e, "Cancelled validation task failed");
            }
            tracker.remove_all();
            Ok(Report::timed_out(&field, deadline))
        }
    }
}

/// Copies local files into `upload_dir` the way a web server stores
/// multipart uploads, and registers them under `field`.
pub fn stage_files(field: &str, files: &[PathBuf], upload_dir: &Path) -> anyhow::Result<MultipartUploads> {
    let mut entries = Vec::with_capacity(files.len());
    for (index, file) in files.iter().enumerate() {
        let target = upload_dir.join(format!("upload{:04}", index));
        let size = fs::copy(file, &target)
            .with_context(|| format!("Failed to stage '{}'", file.display()))?;
        entries.push(RawFileEntry {
            name: file
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_default(),
            mime_type: String::new(),
            tmp_name: target.to_string_lossy().to_string(),
            size,
            error: TransportError::Ok,
        });
    }

    let raw = if entries.len() == 1 {
        let entry = entries.remove(0);
        RawFileField::single(entry.name, entry.mime_type, entry.tmp_name, entry.size, entry.error)
    } else {
        RawFileField::multiple(entries)
    };
    Ok(MultipartUploads::new().with_field(field, raw))
}

#[cfg(test)]
mod tests {
    use super::*;
    use fileguard_core::{IniSettings, UploadConstraints};

    #[test]
    fn test_stage_files_copies_into_upload_dir() {
        let input = tempfile::TempDir::new().unwrap();
        let uploads = tempfile::TempDir::new().unwrap();
        let a = input.path().join("a.txt");
        let b = input.path().join("b.txt");
        fs::write(&a, b"alpha").unwrap();
        fs::write(&b, b"bravo!").unwrap();

        let source = stage_files("docs", &[a, b], uploads.path()).unwrap();
        let entries = source.file_field("docs").unwrap().entries();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[1].name, "b.txt");
        assert_eq!(entries[1].size, 6);
        assert!(source.is_uploaded_file(Path::new(&entries[0].tmp_name)));
    }

    #[test]
    fn test_report_from_error() {
        let report = Report::from_result("docs", Err(UploadError::NoFile));
        assert!(!report.valid);
        let error = report.error.unwrap();
        assert_eq!(error.code, 4);
        assert_eq!(error.message, "No file was uploaded.");
    }

    /// Source that takes longer to hand over its field than the deadline.
    struct SlowSource {
        inner: MultipartUploads,
        delay: Duration,
    }

    impl RawUploadSource for SlowSource {
        fn file_field(&self, field: &str) -> Option<RawFileField> {
            std::thread::sleep(self.delay);
            self.inner.file_field(field)
        }

        fn is_uploaded_file(&self, path: &Path) -> bool {
            self.inner.is_uploaded_file(path)
        }
    }

    fn validator(uploads: &Path) -> UploadValidator {
        let limits = IniSettings {
            upload_tmp_dir: Some(uploads.to_path_buf()),
            ..IniSettings::default()
        };
        UploadValidator::new("docs", UploadConstraints::new(vec![".txt".into()]), Arc::new(limits)).unwrap()
    }

    #[tokio::test]
    async fn test_deadline_cancels_run_and_leaves_no_temp_files() {
        let input = tempfile::TempDir::new().unwrap();
        let uploads = tempfile::TempDir::new().unwrap();
        let file = input.path().join("a.txt");
        fs::write(&file, b"slow upload\n").unwrap();
        let staged = stage_files("docs", &[file], uploads.path()).unwrap();

        let validator = validator(uploads.path());
        let tracker = validator.temp_tracker();
        let source = SlowSource {
            inner: staged,
            delay: Duration::from_millis(300),
        };

        let report = run_with_deadline(validator, Arc::new(source), Duration::from_millis(20))
            .await
            .unwrap();
        assert!(!report.valid);
        assert_eq!(report.error.unwrap().error_code, "TIMEOUT");
        assert!(tracker.is_cancelled());
        assert!(tracker.is_empty());
        assert_eq!(fs::read_dir(uploads.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_run_within_deadline_reports_files() {
        let input = tempfile::TempDir::new().unwrap();
        let uploads = tempfile::TempDir::new().unwrap();
        let file = input.path().join("a.txt");
        fs::write(&file, b"quick upload\n").unwrap();
        let staged = stage_files("docs", &[file], uploads.path()).unwrap();

        let report = run_with_deadline(validator(uploads.path()), Arc::new(staged), Duration::from_secs(10))
            .await
            .unwrap();
        assert!(report.valid);
        assert_eq!(report.files.len(), 1);
        assert!(report.files[0].temp_path.exists());
    }

    #[test]
    fn test_stage_missing_file_fails() {
        let uploads = tempfile::TempDir::new().unwrap();
        let missing = uploads.path().join("missing.bin");
        assert!(stage_files("docs", &[missing], uploads.path()).is_err());
    }
}
