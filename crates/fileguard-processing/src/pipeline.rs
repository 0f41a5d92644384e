//! Upload validation pipeline.
//!
//! Stages run strictly in order and stop at the first failure:
//! requirements, descriptor collection, accept-rule compilation, then for
//! each file the transport error, file and size check, name sanitation,
//! content sniffing and bomb scan. One failing file rejects the whole
//! batch, and every temp file tracked during the run is deleted.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use fileguard_core::{
    ErrorMetadata, ErrorSink, LogLevel, MimeRegistry, StaticMimeRegistry, UploadConstraints,
    UploadDescriptor, UploadError, UploadLimits,
};

use crate::accept::AcceptRules;
use crate::bomb::{BombDetector, ScanSettings, ScannerKind, ScannerRegistry};
use crate::file_check::FileAndSizeChecker;
use crate::sanitize::NameSanitizer;
use crate::sniff::{ContentSniffer, InferSniffer, TypeSniffer};
use crate::source::RawUploadSource;
use crate::temp::TempTracker;

/// Validates the files submitted under one form field.
///
/// Temp paths are tracked per validator, so concurrent validations should
/// each use their own instance.
pub struct UploadValidator {
    field: String,
    constraints: UploadConstraints,
    limits: Arc<dyn UploadLimits>,
    mime_registry: Option<Arc<dyn MimeRegistry>>,
    sniffer: Option<Arc<dyn ContentSniffer>>,
    scanners: Vec<ScannerKind>,
    sanitizer: NameSanitizer,
    file_checker: FileAndSizeChecker,
    temp_tracker: TempTracker,
}

impl UploadValidator {
    /// Builds a validator with the built-in MIME registry, the `infer`
    /// based sniffer and the built-in bomb scanners.
    ///
    /// Fails when the constraints are inconsistent, conflict with `limits`,
    /// name an unknown bomb scanner or carry an invalid file name character
    /// class.
    pub fn new(
        field: impl Into<String>,
        constraints: UploadConstraints,
        limits: Arc<dyn UploadLimits>,
    ) -> anyhow::Result<Self> {
        Self::with_scanner_registry(field, constraints, limits, &ScannerRegistry::new())
    }

    pub fn with_scanner_registry(
        field: impl Into<String>,
        constraints: UploadConstraints,
        limits: Arc<dyn UploadLimits>,
        scanner_registry: &ScannerRegistry,
    ) -> anyhow::Result<Self> {
        let field = field.into();
        constraints
            .validate()
            .with_context(|| format!("Invalid upload constraints for field '{}'", field))?;
        constraints
            .check_against_limits(limits.as_ref())
            .with_context(|| format!("Upload constraints for field '{}' exceed system limits", field))?;

        let scanners = scanner_registry
            .resolve(&constraints.bomb_scanners)
            .map_err(|e| anyhow::anyhow!("{}", e))
            .context("Failed to resolve bomb scanners")?;
        let sanitizer = NameSanitizer::new(
            &constraints.allowed_file_name_chars,
            constraints.allowed_file_name_chars_handler.clone(),
        )
        .context("Invalid allowed file name characters")?;
        let file_checker = FileAndSizeChecker::new(constraints.min_size, constraints.max_size);

        tracing::debug!(
            field = %field,
            scanners = ?scanners.iter().map(|k| k.id).collect::<Vec<_>>(),
            "Upload validator configured"
        );

        Ok(Self {
            field,
            constraints,
            limits,
            mime_registry: Some(Arc::new(StaticMimeRegistry::new())),
            sniffer: Some(Arc::new(InferSniffer)),
            scanners,
            sanitizer,
            file_checker,
            temp_tracker: TempTracker::new(),
        })
    }

    pub fn with_mime_registry(mut self, registry: Arc<dyn MimeRegistry>) -> Self {
        self.mime_registry = Some(registry);
        self
    }

    pub fn without_mime_registry(mut self) -> Self {
        self.mime_registry = None;
        self
    }

    pub fn with_sniffer(mut self, sniffer: Arc<dyn ContentSniffer>) -> Self {
        self.sniffer = Some(sniffer);
        self
    }

    pub fn without_sniffer(mut self) -> Self {
        self.sniffer = None;
        self
    }

    /// Toggles rejection of Windows device names (`CON`, `LPT1`, ...).
    pub fn with_windows_reserved_names(mut self, enabled: bool) -> Self {
        self.sanitizer = self.sanitizer.with_windows_reserved(enabled);
        self
    }

    pub fn field(&self) -> &str {
        &self.field
    }

    pub fn constraints(&self) -> &UploadConstraints {
        &self.constraints
    }

    /// Shared handle on the temp paths of the current run. A caller
    /// enforcing a deadline can call [`TempTracker::remove_all`] on it
    /// while validation is still running.
    pub fn temp_tracker(&self) -> TempTracker {
        self.temp_tracker.clone()
    }

    /// Runs every stage. On success the temp files are handed over to the
    /// caller through the returned descriptors; on failure all of them are
    /// deleted.
    ///
    /// Once [`TempTracker::cancel`] has been called on this validator's
    /// tracker, every run ends in [`UploadError::Cancelled`] with the same
    /// cleanup.
    pub fn validate(&self, source: &dyn RawUploadSource) -> Result<Vec<UploadDescriptor>, UploadError> {
        let result = match self.run(source) {
            _ if self.temp_tracker.is_cancelled() => Err(UploadError::Cancelled),
            result => result,
        };
        match result {
            Ok(files) => {
                self.temp_tracker.release_all();
                tracing::info!(field = %self.field, files = files.len(), "Upload validated");
                Ok(files)
            }
            Err(err) => {
                let removed = self.temp_tracker.remove_all();
                self.log_failure(&err, removed);
                Err(err)
            }
        }
    }

    /// Like [`UploadValidator::validate`], reporting a failure to `sink`
    /// instead of returning it.
    pub fn validate_with_sink(
        &self,
        source: &dyn RawUploadSource,
        sink: &mut dyn ErrorSink,
    ) -> Option<Vec<UploadDescriptor>> {
        match self.validate(source) {
            Ok(files) => Some(files),
            Err(err) => {
                sink.add_upload_error(&err);
                None
            }
        }
    }

    fn run(&self, source: &dyn RawUploadSource) -> Result<Vec<UploadDescriptor>, UploadError> {
        let (mime_registry, sniffer, tmp_dir) = self.check_requirements()?;
        let mut files = self.collect(source)?;
        let rules = AcceptRules::compile(&self.constraints.accept, mime_registry.as_ref())?;

        let type_sniffer = TypeSniffer::new(sniffer);
        let detector = BombDetector::new(
            self.scanners.clone(),
            ScanSettings {
                tmp_dir,
                png_max_width_height: self.constraints.png_image_max_width_height,
                temp_tracker: self.temp_tracker.clone(),
            },
            &self.constraints,
        );

        for file in &mut files {
            if self.temp_tracker.is_cancelled() {
                return Err(UploadError::Cancelled);
            }
            if let Some(err) =
                UploadError::from_transport(file.transport_error, self.limits.upload_max_filesize())
            {
                return Err(err);
            }

            self.file_checker.check(file, source)?;

            let sanitized = self.sanitizer.sanitize(&file.original_name)?;
            file.sanitized_name = Some(sanitized.name);
            file.extension = Some(sanitized.extension);

            type_sniffer.check(file, &rules)?;

            let name = file.display_name();
            detector.scan(&file.temp_path, &name)?;

            tracing::debug!(
                field = %self.field,
                file = %name,
                size = file.size_bytes,
                mime_type = file.detected_mime_type.as_deref().unwrap_or_default(),
                "Uploaded file passed all checks"
            );
        }
        Ok(files)
    }

    fn check_requirements(
        &self,
    ) -> Result<(Arc<dyn MimeRegistry>, Arc<dyn ContentSniffer>, PathBuf), UploadError> {
        let sniffer = self.sniffer.clone().ok_or(UploadError::NoSniffer)?;
        let mime_registry = self.mime_registry.clone().ok_or(UploadError::NoMimeRegistry)?;
        let tmp_dir = self.limits.uploads_tmp_dir();
        if !tmp_dir.is_dir() {
            return Err(UploadError::NoTmpDir);
        }
        Ok((mime_registry, sniffer, tmp_dir))
    }

    fn collect(&self, source: &dyn RawUploadSource) -> Result<Vec<UploadDescriptor>, UploadError> {
        let Some(raw) = source.file_field(&self.field) else {
            return Err(UploadError::NoFile);
        };

        let files: Vec<UploadDescriptor> = raw
            .entries()
            .into_iter()
            .map(UploadDescriptor::from_entry)
            .collect();

        // Only transport-produced paths are ever deleted.
        for file in &files {
            if !file.temp_path.as_os_str().is_empty() && source.is_uploaded_file(&file.temp_path) {
                self.temp_tracker.track(&file.temp_path);
            }
        }

        let count = files.len();
        if let Some(min_count) = self.constraints.min_count {
            if count < min_count {
                return Err(UploadError::TooFewFiles(min_count));
            }
        }
        let max_count = if self.constraints.multiple {
            self.constraints.max_count
        } else {
            Some(1)
        };
        if let Some(max_count) = max_count {
            if count > max_count {
                return Err(UploadError::TooManyFiles(max_count));
            }
        }
        if count == 0 {
            return Err(UploadError::NoFile);
        }

        tracing::debug!(field = %self.field, files = count, "Collected uploaded files");
        Ok(files)
    }

    fn log_failure(&self, err: &UploadError, removed: usize) {
        let code = err.error_code();
        match err.log_level() {
            LogLevel::Error => tracing::error!(field = %self.field, code, removed, error = %err, "Upload validation failed"),
            LogLevel::Warn => tracing::warn!(field = %self.field, code, removed, error = %err, "Upload validation failed"),
            LogLevel::Info => tracing::info!(field = %self.field, code, removed, error = %err, "Upload validation failed"),
            LogLevel::Debug => tracing::debug!(field = %self.field, code, removed, error = %err, "Upload validation failed"),
        }
    }
}
