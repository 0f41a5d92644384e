//! Error taxonomy for upload validation.
//!
//! Every failure the validator can report is a variant of [`UploadError`].
//! Numeric codes continue the upload transport numbering (0-8) so callers
//! that already map transport codes can treat both uniformly. Messages are
//! `{1}`-style templates with positional arguments, which lets an
//! [`ErrorSink`] translate the template before substituting arguments.

use std::sync::OnceLock;

use regex::{Captures, Regex};
use thiserror::Error;

use crate::models::TransportError;

/// Log level an error should be reported at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
}

/// Metadata about an error for logging and client reporting.
pub trait ErrorMetadata {
    /// Numeric code, continuing the transport code numbering.
    fn code(&self) -> u16;

    /// Machine-readable error code (e.g. "RESERVED_NAME").
    fn error_code(&self) -> &'static str;

    /// Message template with `{1}`, `{2}`, ... placeholders.
    fn message_template(&self) -> &str;

    /// Positional arguments for [`ErrorMetadata::message_template`].
    fn message_args(&self) -> Vec<String>;

    fn log_level(&self) -> LogLevel;

    /// Whether the error comes from field configuration or missing
    /// runtime capabilities rather than from the uploaded data.
    fn is_configuration_error(&self) -> bool;
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum UploadError {
    #[error("Uploaded file exceeds maximum size to upload. (`{max_bytes}` bytes).")]
    IniSize { max_bytes: u64 },

    #[error("Uploaded file was only partially uploaded.")]
    Partial,

    #[error("No file was uploaded.")]
    NoFile,

    #[error("Missing a temporary folder for uploaded file.")]
    NoTmpDir,

    #[error("Failed to write uploaded file to disk.")]
    CantWrite,

    #[error("System extension stopped the file upload.")]
    Extension,

    #[error("Field allows to upload `{0}` file(s) at minimum.")]
    TooFewFiles(usize),

    #[error("Field allows to upload `{0}` file(s) at maximum.")]
    TooManyFiles(usize),

    #[error("File wasn't uploaded via HTTP POST.")]
    NotPosted,

    #[error("Uploaded file is not valid file.")]
    NotFile,

    #[error("Uploaded file is empty.")]
    EmptyFile,

    #[error("Uploaded file is too large.")]
    TooLargeFile,

    #[error("One of uploaded files is too small. Min. required size is `{0}`.")]
    MinSize(String),

    #[error("One of uploaded files is too large. Max. allowed size is `{0}`.")]
    MaxSize(String),

    #[error("System extension for files recognition is missing.")]
    NoSniffer,

    #[error("System extension for mime type(s) and extensions is missing.")]
    NoMimeRegistry,

    #[error("Unknown accept attribute value found: `{0}`.")]
    UnknownAccept(String),

    #[error("Unknown file mimetype found for accept file extension: `{0}`.")]
    UnknownExtension(String),

    #[error("Unknown file extension found for accept file mimetype: `{0}`.")]
    UnknownMimeType(String),

    #[error("Uploaded file name has system reserved name (`{0}`).")]
    ReservedName(String),

    #[error("Uploaded file is not in the expected file format (`{0}`).")]
    NotAccepted(String),

    #[error("Uploaded file has been evaluated as a potential file bomb (`{0}`).")]
    FileBomb(String),

    #[error("Uploaded archive has too high compression ratio, it's probably an archive bomb (`{0}`).")]
    BombTooHighCompression(String),

    #[error("Uploaded archive contains too many nested archive levels (`{0}`).")]
    BombTooManyLevels(String),

    #[error("Uploaded archive contains too many files (`{0}`).")]
    BombTooManyFiles(String),

    #[error("Uploaded file has no usable name (`{0}`).")]
    NoName(String),

    #[error("Unknown bomb scanner configured: `{0}`.")]
    UnknownBombScanner(String),

    /// Scanner-specific failure; `template` carries the scanner's own
    /// `{1}` message with the file name as the only argument.
    #[error("{}", format_message(.template, &[.file]))]
    BombScanner { template: String, file: String },

    #[error("{0}")]
    BombScannerUnsupported(String),

    /// The run was cancelled from outside, e.g. by a deadline.
    #[error("Upload validation was cancelled before it finished.")]
    Cancelled,
}

impl UploadError {
    /// Error for a non-ok transport outcome. `upload_max_filesize` fills the
    /// ini-size message argument.
    pub fn from_transport(error: TransportError, upload_max_filesize: u64) -> Option<Self> {
        match error {
            TransportError::Ok => None,
            TransportError::IniSize => Some(UploadError::IniSize {
                max_bytes: upload_max_filesize,
            }),
            TransportError::Partial => Some(UploadError::Partial),
            TransportError::NoFile => Some(UploadError::NoFile),
            TransportError::NoTmpDir => Some(UploadError::NoTmpDir),
            TransportError::CantWrite => Some(UploadError::CantWrite),
            TransportError::Extension => Some(UploadError::Extension),
        }
    }

    pub fn is_bomb(&self) -> bool {
        (24..=27).contains(&self.code())
    }
}

/// Returns (code, error_code, message_template, log_level, is_configuration_error).
/// Dynamic-template variants return an empty template here.
fn upload_error_static_metadata(
    err: &UploadError,
) -> (u16, &'static str, &'static str, LogLevel, bool) {
    match err {
        UploadError::IniSize { .. } => (
            1,
            "INI_SIZE",
            "Uploaded file exceeds maximum size to upload. (`{1}` bytes).",
            LogLevel::Info,
            false,
        ),
        UploadError::Partial => (
            3,
            "PARTIAL",
            "Uploaded file was only partially uploaded.",
            LogLevel::Info,
            false,
        ),
        UploadError::NoFile => (4, "NO_FILE", "No file was uploaded.", LogLevel::Debug, false),
        UploadError::NoTmpDir => (
            6,
            "NO_TMP_DIR",
            "Missing a temporary folder for uploaded file.",
            LogLevel::Error,
            true,
        ),
        UploadError::CantWrite => (
            7,
            "CANT_WRITE",
            "Failed to write uploaded file to disk.",
            LogLevel::Error,
            false,
        ),
        UploadError::Extension => (
            8,
            "EXTENSION",
            "System extension stopped the file upload.",
            LogLevel::Warn,
            false,
        ),
        UploadError::TooFewFiles(_) => (
            9,
            "TOO_FEW_FILES",
            "Field allows to upload `{1}` file(s) at minimum.",
            LogLevel::Debug,
            false,
        ),
        UploadError::TooManyFiles(_) => (
            10,
            "TOO_MANY_FILES",
            "Field allows to upload `{1}` file(s) at maximum.",
            LogLevel::Debug,
            false,
        ),
        UploadError::NotPosted => (
            11,
            "NOT_POSTED",
            "File wasn't uploaded via HTTP POST.",
            LogLevel::Warn,
            false,
        ),
        UploadError::NotFile => (
            12,
            "NOT_FILE",
            "Uploaded file is not valid file.",
            LogLevel::Warn,
            false,
        ),
        UploadError::EmptyFile => (13, "EMPTY_FILE", "Uploaded file is empty.", LogLevel::Debug, false),
        UploadError::TooLargeFile => (
            14,
            "TOO_LARGE_FILE",
            "Uploaded file is too large.",
            LogLevel::Info,
            false,
        ),
        UploadError::MinSize(_) => (
            15,
            "MIN_SIZE",
            "One of uploaded files is too small. Min. required size is `{1}`.",
            LogLevel::Debug,
            false,
        ),
        UploadError::MaxSize(_) => (
            16,
            "MAX_SIZE",
            "One of uploaded files is too large. Max. allowed size is `{1}`.",
            LogLevel::Debug,
            false,
        ),
        UploadError::NoSniffer => (
            17,
            "NO_SNIFFER",
            "System extension for files recognition is missing.",
            LogLevel::Error,
            true,
        ),
        UploadError::NoMimeRegistry => (
            18,
            "NO_MIME_REGISTRY",
            "System extension for mime type(s) and extensions is missing.",
            LogLevel::Error,
            true,
        ),
        UploadError::UnknownAccept(_) => (
            19,
            "UNKNOWN_ACCEPT",
            "Unknown accept attribute value found: `{1}`.",
            LogLevel::Error,
            true,
        ),
        UploadError::UnknownExtension(_) => (
            20,
            "UNKNOWN_EXTENSION",
            "Unknown file mimetype found for accept file extension: `{1}`.",
            LogLevel::Error,
            true,
        ),
        UploadError::UnknownMimeType(_) => (
            21,
            "UNKNOWN_MIME_TYPE",
            "Unknown file extension found for accept file mimetype: `{1}`.",
            LogLevel::Error,
            true,
        ),
        UploadError::ReservedName(_) => (
            22,
            "RESERVED_NAME",
            "Uploaded file name has system reserved name (`{1}`).",
            LogLevel::Warn,
            false,
        ),
        UploadError::NotAccepted(_) => (
            23,
            "NOT_ACCEPTED",
            "Uploaded file is not in the expected file format (`{1}`).",
            LogLevel::Info,
            false,
        ),
        UploadError::FileBomb(_) => (
            24,
            "FILE_BOMB",
            "Uploaded file has been evaluated as a potential file bomb (`{1}`).",
            LogLevel::Warn,
            false,
        ),
        UploadError::BombTooHighCompression(_) => (
            25,
            "BOMB_TOO_HIGH_COMPRESSION",
            "Uploaded archive has too high compression ratio, it's probably an archive bomb (`{1}`).",
            LogLevel::Warn,
            false,
        ),
        UploadError::BombTooManyLevels(_) => (
            26,
            "BOMB_TOO_MANY_LEVELS",
            "Uploaded archive contains too many nested archive levels (`{1}`).",
            LogLevel::Warn,
            false,
        ),
        UploadError::BombTooManyFiles(_) => (
            27,
            "BOMB_TOO_MANY_FILES",
            "Uploaded archive contains too many files (`{1}`).",
            LogLevel::Warn,
            false,
        ),
        UploadError::NoName(_) => (
            28,
            "NO_NAME",
            "Uploaded file has no usable name (`{1}`).",
            LogLevel::Info,
            false,
        ),
        UploadError::UnknownBombScanner(_) => (
            29,
            "UNKNOWN_BOMB_SCANNER",
            "Unknown bomb scanner configured: `{1}`.",
            LogLevel::Error,
            true,
        ),
        UploadError::BombScanner { .. } => (30, "BOMB_SCANNER_ERROR", "", LogLevel::Warn, false),
        UploadError::BombScannerUnsupported(_) => {
            (31, "BOMB_SCANNER_UNSUPPORTED", "", LogLevel::Error, true)
        }
        UploadError::Cancelled => (
            32,
            "CANCELLED",
            "Upload validation was cancelled before it finished.",
            LogLevel::Warn,
            false,
        ),
    }
}

impl ErrorMetadata for UploadError {
    fn code(&self) -> u16 {
        upload_error_static_metadata(self).0
    }

    fn error_code(&self) -> &'static str {
        upload_error_static_metadata(self).1
    }

    fn message_template(&self) -> &str {
        match self {
            UploadError::BombScanner { template, .. } => template,
            UploadError::BombScannerUnsupported(message) => message,
            _ => upload_error_static_metadata(self).2,
        }
    }

    fn message_args(&self) -> Vec<String> {
        match self {
            UploadError::IniSize { max_bytes } => vec![max_bytes.to_string()],
            UploadError::TooFewFiles(count) | UploadError::TooManyFiles(count) => {
                vec![count.to_string()]
            }
            UploadError::MinSize(arg)
            | UploadError::MaxSize(arg)
            | UploadError::UnknownAccept(arg)
            | UploadError::UnknownExtension(arg)
            | UploadError::UnknownMimeType(arg)
            | UploadError::ReservedName(arg)
            | UploadError::NotAccepted(arg)
            | UploadError::FileBomb(arg)
            | UploadError::BombTooHighCompression(arg)
            | UploadError::BombTooManyLevels(arg)
            | UploadError::BombTooManyFiles(arg)
            | UploadError::NoName(arg)
            | UploadError::UnknownBombScanner(arg) => vec![arg.clone()],
            UploadError::BombScanner { file, .. } => vec![file.clone()],
            _ => Vec::new(),
        }
    }

    fn log_level(&self) -> LogLevel {
        upload_error_static_metadata(self).3
    }

    fn is_configuration_error(&self) -> bool {
        upload_error_static_metadata(self).4
    }
}

/// Substitutes `{1}`, `{2}`, ... in `template` with positional `args`.
/// Placeholders without a matching argument are left untouched.
/// Argument text is inserted verbatim, never scanned for placeholders.
pub fn format_message<S: AsRef<str>>(template: &str, args: &[S]) -> String {
    let Some(placeholder) = placeholder_regex() else {
        return template.to_string();
    };
    placeholder
        .replace_all(template, |caps: &Captures<'_>| {
            caps[1]
                .parse::<usize>()
                .ok()
                .and_then(|n| n.checked_sub(1))
                .and_then(|index| args.get(index))
                .map(|arg| arg.as_ref().to_string())
                .unwrap_or_else(|| caps[0].to_string())
        })
        .into_owned()
}

fn placeholder_regex() -> Option<&'static Regex> {
    static PLACEHOLDER: OnceLock<Option<Regex>> = OnceLock::new();
    PLACEHOLDER
        .get_or_init(|| Regex::new(r"\{(\d+)\}").ok())
        .as_ref()
}

/// Receives validation errors for a form field.
pub trait ErrorSink {
    fn add_error(&mut self, template: &str, args: &[String]);

    fn add_upload_error(&mut self, err: &UploadError) {
        self.add_error(err.message_template(), &err.message_args());
    }
}

/// One error collected by [`FieldErrors`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldError {
    pub template: String,
    pub args: Vec<String>,
}

impl FieldError {
    pub fn message(&self) -> String {
        format_message(&self.template, &self.args)
    }
}

/// In-memory [`ErrorSink`] for one field.
#[derive(Debug, Clone, Default)]
pub struct FieldErrors {
    pub field: String,
    pub errors: Vec<FieldError>,
}

impl FieldErrors {
    pub fn new(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            errors: Vec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn messages(&self) -> Vec<String> {
        self.errors.iter().map(FieldError::message).collect()
    }
}

impl ErrorSink for FieldErrors {
    fn add_error(&mut self, template: &str, args: &[String]) {
        self.errors.push(FieldError {
            template: template.to_string(),
            args: args.to_vec(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_message() {
        assert_eq!(
            format_message("Field allows `{1}` of `{2}`.", &["2", "5"]),
            "Field allows `2` of `5`."
        );
        assert_eq!(format_message("No args `{1}`.", &[] as &[&str]), "No args `{1}`.");
        assert_eq!(format_message("`{0}` and `{10}`.", &["a"]), "`{0}` and `{10}`.");
    }

    #[test]
    fn test_format_message_does_not_expand_arguments() {
        assert_eq!(
            format_message("File `{1}` exceeds `{2}`.", &["report{2}.pdf", "5 MB"]),
            "File `report{2}.pdf` exceeds `5 MB`."
        );
        let err = UploadError::BombScanner {
            template: "Uploaded file is inconsistent PNG image (`{1}`).".to_string(),
            file: "{1}.png".to_string(),
        };
        assert_eq!(err.to_string(), "Uploaded file is inconsistent PNG image (`{1}.png`).");
    }

    #[test]
    fn test_error_metadata_too_few_files() {
        let err = UploadError::TooFewFiles(2);
        assert_eq!(err.code(), 9);
        assert_eq!(err.error_code(), "TOO_FEW_FILES");
        assert_eq!(err.message_args(), vec!["2".to_string()]);
        assert_eq!(err.log_level(), LogLevel::Debug);
        assert!(!err.is_configuration_error());
    }

    #[test]
    fn test_display_matches_formatted_template() {
        let errors = vec![
            UploadError::IniSize { max_bytes: 2048 },
            UploadError::MaxSize("5 MB".to_string()),
            UploadError::ReservedName(".htaccess".to_string()),
            UploadError::BombTooManyFiles("a.zip".to_string()),
            UploadError::BombScanner {
                template: "Uploaded file is inconsistent PNG image (`{1}`).".to_string(),
                file: "x.png".to_string(),
            },
            UploadError::NoFile,
            UploadError::Cancelled,
        ];
        for err in errors {
            assert_eq!(
                err.to_string(),
                format_message(err.message_template(), &err.message_args())
            );
        }
    }

    #[test]
    fn test_configuration_errors() {
        assert!(UploadError::NoSniffer.is_configuration_error());
        assert!(UploadError::UnknownAccept("foo".into()).is_configuration_error());
        assert!(UploadError::UnknownBombScanner("arj".into()).is_configuration_error());
        assert_eq!(UploadError::UnknownAccept("foo".into()).log_level(), LogLevel::Error);
    }

    #[test]
    fn test_bomb_classification() {
        assert!(UploadError::FileBomb("a".into()).is_bomb());
        assert!(UploadError::BombTooManyLevels("a".into()).is_bomb());
        assert!(!UploadError::NotAccepted("a".into()).is_bomb());
    }

    #[test]
    fn test_from_transport() {
        assert_eq!(UploadError::from_transport(TransportError::Ok, 10), None);
        assert_eq!(
            UploadError::from_transport(TransportError::IniSize, 10),
            Some(UploadError::IniSize { max_bytes: 10 })
        );
        assert_eq!(UploadError::from_transport(TransportError::Partial, 10).map(|e| e.code()), Some(3));
    }

    #[test]
    fn test_field_errors_sink() {
        let mut sink = FieldErrors::new("attachments");
        sink.add_upload_error(&UploadError::NotAccepted("a.exe".into()));
        assert_eq!(sink.errors.len(), 1);
        assert_eq!(
            sink.messages(),
            vec!["Uploaded file is not in the expected file format (`a.exe`).".to_string()]
        );
    }
}
