//! Fileguard Processing
//!
//! The upload validation pipeline: accept-rule compilation, file name
//! sanitation, size checks, content sniffing and recursive archive bomb
//! detection, plus the multipart and AJAX upload sources feeding it.

pub mod accept;
pub mod ajax;
pub mod bomb;
pub mod file_check;
pub mod pipeline;
pub mod sanitize;
pub mod sniff;
pub mod source;
pub mod temp;

pub use accept::{AcceptRule, AcceptRules};
pub use ajax::{AjaxFileItem, AjaxUploadDecoder, AjaxUploads};
pub use bomb::{BombDetector, BombScanner, ScanSettings, ScannerError, ScannerRegistry};
pub use file_check::FileAndSizeChecker;
pub use pipeline::UploadValidator;
pub use sanitize::{NameSanitizer, SanitizedName};
pub use sniff::{ContentSniffer, InferSniffer, TypeSniffer};
pub use source::{MultipartUploads, RawUploadSource};
pub use temp::TempTracker;
