//! Configuration module
//!
//! Upload field constraints shared by the field-facing and validator-facing
//! code, plus the ini-style system limits the constraints are checked against.

use std::env;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::constants::{
    DEFAULT_ALLOWED_FILE_NAME_CHARS, DEFAULT_ARCHIVE_MAX_COMPRESS_PERCENTAGE,
    DEFAULT_ARCHIVE_MAX_ITEMS, DEFAULT_ARCHIVE_MAX_LEVELS, DEFAULT_BOMB_SCANNERS,
    DEFAULT_MAX_FILE_UPLOADS, DEFAULT_PNG_IMAGE_MAX_WIDTH_HEIGHT, DEFAULT_POST_MAX_SIZE,
    DEFAULT_UPLOAD_MAX_FILESIZE, DEFAULT_WRITE_BUFFER_SIZE,
};
use crate::size::parse_ini_size;

/// Field configuration inconsistencies, found before any upload is read.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ConfigError {
    #[error("No `accept` property defined.")]
    NoAccept,

    #[error("System has not allowed file upload.")]
    UploadsNotAllowed,

    #[error("System value for max. file upload size is lower than field configuration.")]
    MaxUploadSizeLower,

    #[error("System value for max. POST size is lower than field configuration.")]
    MaxPostSizeLower,

    #[error("System value for max. uploaded files count is lower than field configuration.")]
    MaxFilesCountLower,

    #[error("Mismatch in min. and max. uploaded files count in field configuration.")]
    MismatchMinMaxCount,

    #[error("Mismatch in min. and max. uploaded files sizes in field configuration.")]
    MismatchMinMaxSize,

    #[error("Archive max. compress percentage must be in (0, 100], got {0}.")]
    InvalidCompressPercentage(f64),

    #[error("Archive max. levels must be at least 1.")]
    InvalidArchiveMaxLevels,

    #[error("Archive max. items must be at least 1.")]
    InvalidArchiveMaxItems,

    #[error("Write buffer size must be greater than zero.")]
    InvalidWriteBufferSize,
}

/// Custom file name sanitizer. When set it replaces the character
/// allow-list step of name sanitation.
#[derive(Clone)]
pub struct FileNameHandler(Arc<dyn Fn(&str) -> String + Send + Sync>);

impl FileNameHandler {
    pub fn new<F>(handler: F) -> Self
    where
        F: Fn(&str) -> String + Send + Sync + 'static,
    {
        Self(Arc::new(handler))
    }

    pub fn call(&self, file_name: &str) -> String {
        (self.0)(file_name)
    }
}

impl fmt::Debug for FileNameHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("FileNameHandler(..)")
    }
}

/// Constraints for one upload field.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UploadConstraints {
    /// Accept tokens: `.ext` or `type/subtype` with optional `*` wildcards.
    pub accept: Vec<String>,
    pub multiple: bool,
    pub min_count: Option<usize>,
    pub max_count: Option<usize>,
    /// Bytes.
    pub min_size: Option<u64>,
    /// Bytes.
    pub max_size: Option<u64>,
    /// Regex character-class body of characters kept in file names.
    pub allowed_file_name_chars: String,
    #[serde(skip)]
    pub allowed_file_name_chars_handler: Option<FileNameHandler>,
    pub archive_max_items: u64,
    pub archive_max_levels: u32,
    pub archive_max_compress_percentage: f64,
    pub png_image_max_width_height: u32,
    /// Scanner identifiers in probe order.
    pub bomb_scanners: Vec<String>,
    /// Chunk size for streaming base64 payloads to disk.
    pub write_buffer_size: usize,
}

impl Default for UploadConstraints {
    fn default() -> Self {
        Self {
            accept: Vec::new(),
            multiple: false,
            min_count: None,
            max_count: None,
            min_size: None,
            max_size: None,
            allowed_file_name_chars: DEFAULT_ALLOWED_FILE_NAME_CHARS.to_string(),
            allowed_file_name_chars_handler: None,
            archive_max_items: DEFAULT_ARCHIVE_MAX_ITEMS,
            archive_max_levels: DEFAULT_ARCHIVE_MAX_LEVELS,
            archive_max_compress_percentage: DEFAULT_ARCHIVE_MAX_COMPRESS_PERCENTAGE,
            png_image_max_width_height: DEFAULT_PNG_IMAGE_MAX_WIDTH_HEIGHT,
            bomb_scanners: DEFAULT_BOMB_SCANNERS.iter().map(|s| s.to_string()).collect(),
            write_buffer_size: DEFAULT_WRITE_BUFFER_SIZE,
        }
    }
}

impl UploadConstraints {
    pub fn new(accept: Vec<String>) -> Self {
        Self {
            accept,
            ..Self::default()
        }
    }

    /// Load constraints from `FILEGUARD_*` environment variables, falling
    /// back to defaults for anything unset or unparseable.
    pub fn from_env() -> Result<Self, anyhow::Error> {
        dotenvy::dotenv().ok();

        let defaults = Self::default();
        let constraints = Self {
            accept: env_list("FILEGUARD_ACCEPT").unwrap_or_default(),
            multiple: env::var("FILEGUARD_MULTIPLE")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.multiple),
            min_count: env_parse("FILEGUARD_MIN_COUNT"),
            max_count: env_parse("FILEGUARD_MAX_COUNT"),
            min_size: env::var("FILEGUARD_MIN_SIZE")
                .ok()
                .and_then(|v| parse_ini_size(&v)),
            max_size: env::var("FILEGUARD_MAX_SIZE")
                .ok()
                .and_then(|v| parse_ini_size(&v)),
            allowed_file_name_chars: env::var("FILEGUARD_ALLOWED_FILE_NAME_CHARS")
                .unwrap_or(defaults.allowed_file_name_chars),
            allowed_file_name_chars_handler: None,
            archive_max_items: env_parse("FILEGUARD_ARCHIVE_MAX_ITEMS")
                .unwrap_or(DEFAULT_ARCHIVE_MAX_ITEMS),
            archive_max_levels: env_parse("FILEGUARD_ARCHIVE_MAX_LEVELS")
                .unwrap_or(DEFAULT_ARCHIVE_MAX_LEVELS),
            archive_max_compress_percentage: env_parse("FILEGUARD_ARCHIVE_MAX_COMPRESS_PERCENTAGE")
                .unwrap_or(DEFAULT_ARCHIVE_MAX_COMPRESS_PERCENTAGE),
            png_image_max_width_height: env_parse("FILEGUARD_PNG_IMAGE_MAX_WIDTH_HEIGHT")
                .unwrap_or(DEFAULT_PNG_IMAGE_MAX_WIDTH_HEIGHT),
            bomb_scanners: env_list("FILEGUARD_BOMB_SCANNERS").unwrap_or(defaults.bomb_scanners),
            write_buffer_size: env_parse("FILEGUARD_WRITE_BUFFER_SIZE")
                .unwrap_or(DEFAULT_WRITE_BUFFER_SIZE),
        };

        constraints.validate()?;
        Ok(constraints)
    }

    /// Internal consistency of the constraints themselves.
    pub fn validate(&self) -> Result<(), anyhow::Error> {
        let pct = self.archive_max_compress_percentage;
        if !(pct > 0.0 && pct <= 100.0) {
            return Err(ConfigError::InvalidCompressPercentage(pct).into());
        }
        if self.archive_max_levels < 1 {
            return Err(ConfigError::InvalidArchiveMaxLevels.into());
        }
        if self.archive_max_items < 1 {
            return Err(ConfigError::InvalidArchiveMaxItems.into());
        }
        if self.write_buffer_size == 0 {
            return Err(ConfigError::InvalidWriteBufferSize.into());
        }
        if let (Some(min), Some(max)) = (self.min_count, self.max_count) {
            if min > max {
                return Err(ConfigError::MismatchMinMaxCount.into());
            }
        }
        if let (Some(min), Some(max)) = (self.min_size, self.max_size) {
            if min > max {
                return Err(ConfigError::MismatchMinMaxSize.into());
            }
        }
        Ok(())
    }

    /// Checks the field configuration against system upload limits.
    pub fn check_against_limits(&self, limits: &dyn UploadLimits) -> Result<(), ConfigError> {
        if self.accept.is_empty() {
            return Err(ConfigError::NoAccept);
        }
        if !limits.file_uploads() {
            return Err(ConfigError::UploadsNotAllowed);
        }
        if let Some(max_size) = self.max_size {
            if max_size > limits.upload_max_filesize() {
                return Err(ConfigError::MaxUploadSizeLower);
            }
            if max_size > limits.post_max_size() {
                return Err(ConfigError::MaxPostSizeLower);
            }
        }
        if self.multiple {
            let max_files = limits.max_file_uploads() as usize;
            if max_files < 2 || self.max_count.is_some_and(|count| count > max_files) {
                return Err(ConfigError::MaxFilesCountLower);
            }
        }
        if let (Some(min), Some(max)) = (self.min_count, self.max_count) {
            if min > max {
                return Err(ConfigError::MismatchMinMaxCount);
            }
        }
        if let (Some(min), Some(max)) = (self.min_size, self.max_size) {
            if min > max {
                return Err(ConfigError::MismatchMinMaxSize);
            }
        }
        Ok(())
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    env::var(key).ok().and_then(|v| v.trim().parse().ok())
}

fn env_list(key: &str) -> Option<Vec<String>> {
    env::var(key).ok().map(|v| {
        v.split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect()
    })
}

/// System-level upload limits, as an ini-style configuration exposes them.
pub trait UploadLimits: Send + Sync {
    /// Bytes.
    fn upload_max_filesize(&self) -> u64;

    /// Bytes.
    fn post_max_size(&self) -> u64;

    fn max_file_uploads(&self) -> u32;

    fn file_uploads(&self) -> bool {
        true
    }

    /// Explicitly configured uploads temp directory, if any.
    fn upload_tmp_dir(&self) -> Option<PathBuf>;

    /// Configured uploads temp directory, else the system temp directory.
    fn uploads_tmp_dir(&self) -> PathBuf {
        self.upload_tmp_dir().unwrap_or_else(env::temp_dir)
    }
}

/// [`UploadLimits`] backed by plain values.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IniSettings {
    pub file_uploads: bool,
    pub upload_max_filesize: u64,
    pub post_max_size: u64,
    pub max_file_uploads: u32,
    pub upload_tmp_dir: Option<PathBuf>,
}

impl Default for IniSettings {
    fn default() -> Self {
        Self {
            file_uploads: true,
            upload_max_filesize: DEFAULT_UPLOAD_MAX_FILESIZE,
            post_max_size: DEFAULT_POST_MAX_SIZE,
            max_file_uploads: DEFAULT_MAX_FILE_UPLOADS,
            upload_tmp_dir: None,
        }
    }
}

impl IniSettings {
    /// Load limits from `FILEGUARD_UPLOAD_MAX_FILESIZE`,
    /// `FILEGUARD_POST_MAX_SIZE`, `FILEGUARD_MAX_FILE_UPLOADS`,
    /// `FILEGUARD_FILE_UPLOADS` and `FILEGUARD_UPLOAD_TMP_DIR`. Sizes accept
    /// shorthand such as `2M`.
    pub fn from_env() -> Self {
        dotenvy::dotenv().ok();

        Self {
            file_uploads: env::var("FILEGUARD_FILE_UPLOADS")
                .map(|v| !matches!(v.trim().to_ascii_lowercase().as_str(), "0" | "off" | "false"))
                .unwrap_or(true),
            upload_max_filesize: env::var("FILEGUARD_UPLOAD_MAX_FILESIZE")
                .ok()
                .and_then(|v| parse_ini_size(&v))
                .unwrap_or(DEFAULT_UPLOAD_MAX_FILESIZE),
            post_max_size: env::var("FILEGUARD_POST_MAX_SIZE")
                .ok()
                .and_then(|v| parse_ini_size(&v))
                .unwrap_or(DEFAULT_POST_MAX_SIZE),
            max_file_uploads: env_parse("FILEGUARD_MAX_FILE_UPLOADS")
                .unwrap_or(DEFAULT_MAX_FILE_UPLOADS),
            upload_tmp_dir: env::var("FILEGUARD_UPLOAD_TMP_DIR")
                .ok()
                .filter(|v| !v.trim().is_empty())
                .map(PathBuf::from),
        }
    }
}

impl UploadLimits for IniSettings {
    fn upload_max_filesize(&self) -> u64 {
        self.upload_max_filesize
    }

    fn post_max_size(&self) -> u64 {
        self.post_max_size
    }

    fn max_file_uploads(&self) -> u32 {
        self.max_file_uploads
    }

    fn file_uploads(&self) -> bool {
        self.file_uploads
    }

    fn upload_tmp_dir(&self) -> Option<PathBuf> {
        self.upload_tmp_dir.clone()
    }
}
