//! Fileguard Core Library
//!
//! Domain types shared by every fileguard component: upload descriptors,
//! validation constraints, the error taxonomy, the MIME registry
//! collaborator and byte-size helpers.

pub mod config;
pub mod constants;
pub mod error;
pub mod mime;
pub mod models;
pub mod size;

// Re-export commonly used types
pub use config::{ConfigError, FileNameHandler, IniSettings, UploadConstraints, UploadLimits};
pub use error::{
    format_message, ErrorMetadata, ErrorSink, FieldError, FieldErrors, LogLevel, UploadError,
};
pub use mime::{MimeRegistry, StaticMimeRegistry};
pub use models::{OneOrMany, RawFileEntry, RawFileField, TransportError, UploadDescriptor};
pub use size::{human_size, parse_ini_size};
