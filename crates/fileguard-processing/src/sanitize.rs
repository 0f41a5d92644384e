//! File name sanitation.
//!
//! Submitted names are attacker controlled. [`NameSanitizer`] reduces them
//! to a flat, filesystem and URL safe name with a normalized lowercase
//! extension, and rejects names that would be dangerous even when clean
//! (web server control files, Windows device names).

use fileguard_core::constants::{MAX_FILE_NAME_BYTES, WEB_RESERVED_NAMES, WINDOWS_RESERVED_NAMES};
use fileguard_core::models::basename;
use fileguard_core::{FileNameHandler, UploadError};
use percent_encoding::percent_decode_str;
use regex::Regex;

/// Characters removed from every name regardless of the configured allow-list.
const OS_HOSTILE_CHARS: &[char] = &['<', '>', ':', '"', '/', '\\', '|', '?', '*', '&'];

/// Result of a successful sanitation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SanitizedName {
    pub name: String,
    pub stem: String,
    /// Lowercase, possibly empty.
    pub extension: String,
}

#[derive(Debug, Clone)]
pub struct NameSanitizer {
    disallowed: Regex,
    handler: Option<FileNameHandler>,
    windows_reserved: bool,
}

impl NameSanitizer {
    /// `allowed_chars` is a regex character-class body such as
    /// `-a-zA-Z0-9._`. Ranges are kept; class metacharacters are escaped.
    pub fn new(allowed_chars: &str, handler: Option<FileNameHandler>) -> Result<Self, regex::Error> {
        let disallowed = Regex::new(&format!("[^{}]", escape_class_body(allowed_chars)))?;
        Ok(Self {
            disallowed,
            handler,
            windows_reserved: cfg!(windows),
        })
    }

    /// Enables or disables the Windows device name check, which is on by
    /// default only when compiled for Windows.
    pub fn with_windows_reserved(mut self, enabled: bool) -> Self {
        self.windows_reserved = enabled;
        self
    }

    pub fn sanitize(&self, raw_name: &str) -> Result<SanitizedName, UploadError> {
        let decoded = decode_repeatedly(raw_name).replace('%', "%25");
        let (raw_stem, raw_extension) = split_extension(basename(&decoded));

        let mut stem = match &self.handler {
            Some(handler) => handler.call(raw_stem),
            None => self.disallowed.replace_all(raw_stem, "").into_owned(),
        };
        stem.retain(|c| !c.is_control() && !OS_HOSTILE_CHARS.contains(&c));
        if stem.trim().is_empty() {
            return Err(UploadError::NoName(basename(raw_name).to_string()));
        }

        let mut extension = raw_extension.to_lowercase();
        extension.retain(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '+' | '-'));

        let mut name = compose(&stem, &extension);
        while name.contains("..") {
            name = name.replace("..", "");
        }

        let lowered = name.to_lowercase();
        if WEB_RESERVED_NAMES.contains(&lowered.as_str()) || name.contains("./") {
            tracing::warn!(file = %name, "Rejected reserved file name");
            return Err(UploadError::ReservedName(name));
        }

        let (stem, extension) = split_extension(&name);
        let (stem, extension) = (stem.to_string(), extension.to_string());

        if self.windows_reserved {
            let upper_name = name.to_uppercase();
            let upper_stem = stem.to_uppercase();
            if WINDOWS_RESERVED_NAMES.contains(&upper_name.as_str()) {
                return Err(UploadError::ReservedName(name));
            }
            if WINDOWS_RESERVED_NAMES.contains(&upper_stem.as_str()) {
                return Err(UploadError::ReservedName(stem));
            }
        }

        if stem.trim().is_empty() {
            return Err(UploadError::NoName(basename(raw_name).to_string()));
        }

        Ok(truncate(stem, extension))
    }
}

/// Escapes characters with special meaning inside a character class,
/// leaving `-` alone so ranges keep working.
fn escape_class_body(chars: &str) -> String {
    let mut escaped = String::with_capacity(chars.len() * 2);
    for c in chars.chars() {
        if matches!(c, '\\' | '[' | ']' | '^' | '&' | '~') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

fn has_percent_escape(value: &str) -> bool {
    value
        .as_bytes()
        .windows(3)
        .any(|w| w[0] == b'%' && w[1].is_ascii_hexdigit() && w[2].is_ascii_hexdigit())
}

/// Percent-decodes until no escape sequence is left, undoing multiple
/// layers of encoding. Every pass removes at least one escape, so the loop
/// terminates.
fn decode_repeatedly(value: &str) -> String {
    let mut decoded = value.to_string();
    while has_percent_escape(&decoded) {
        decoded = percent_decode_str(&decoded).decode_utf8_lossy().into_owned();
    }
    decoded
}

/// Splits at the last dot. A name whose only dot is the leading one
/// (`.htaccess`) has no extension.
fn split_extension(name: &str) -> (&str, &str) {
    match name.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() => (stem, ext),
        _ => (name, ""),
    }
}

fn compose(stem: &str, extension: &str) -> String {
    if extension.is_empty() {
        stem.to_string()
    } else {
        format!("{}.{}", stem, extension)
    }
}

fn truncate_at_char_boundary(value: &str, max_bytes: usize) -> &str {
    if value.len() <= max_bytes {
        return value;
    }
    let mut end = max_bytes;
    while !value.is_char_boundary(end) {
        end -= 1;
    }
    &value[..end]
}

/// Shortens the stem so the whole name fits [`MAX_FILE_NAME_BYTES`],
/// keeping the extension intact.
fn truncate(stem: String, extension: String) -> SanitizedName {
    let name = compose(&stem, &extension);
    if name.len() <= MAX_FILE_NAME_BYTES {
        return SanitizedName {
            name,
            stem,
            extension,
        };
    }

    if extension.len() + 2 > MAX_FILE_NAME_BYTES {
        let name = truncate_at_char_boundary(&name, MAX_FILE_NAME_BYTES)
            .trim_end_matches('.')
            .to_string();
        let (stem, extension) = split_extension(&name);
        return SanitizedName {
            stem: stem.to_string(),
            extension: extension.to_string(),
            name: name.clone(),
        };
    }

    let budget = MAX_FILE_NAME_BYTES - extension.len() - 1;
    let stem = truncate_at_char_boundary(&stem, budget)
        .trim_end_matches('.')
        .to_string();
    SanitizedName {
        name: compose(&stem, &extension),
        stem,
        extension,
    }
}
