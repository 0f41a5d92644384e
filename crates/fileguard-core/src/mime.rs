//! Extension and MIME type lookup.

use std::collections::BTreeMap;

use regex::Regex;

/// Two-way lookup between file extensions and MIME types.
pub trait MimeRegistry: Send + Sync {
    /// MIME types registered for a lowercase extension without the dot.
    fn mime_types_by_extension(&self, extension: &str) -> Option<Vec<String>>;

    /// Extensions registered for a MIME type. `*` in `mime_type` matches
    /// any substring.
    fn extensions_by_mime_type(&self, mime_type: &str) -> Option<Vec<String>>;
}

/// Extension to MIME types table. Types are the ones content sniffing
/// reports, so a registry lookup and a sniffed type agree on naming.
const DEFAULT_MAPPINGS: &[(&str, &[&str])] = &[
    ("png", &["image/png"]),
    ("jpg", &["image/jpeg"]),
    ("jpeg", &["image/jpeg"]),
    ("gif", &["image/gif"]),
    ("webp", &["image/webp"]),
    ("bmp", &["image/bmp"]),
    ("tif", &["image/tiff"]),
    ("tiff", &["image/tiff"]),
    ("ico", &["image/vnd.microsoft.icon", "image/x-icon"]),
    ("svg", &["image/svg+xml"]),
    ("avif", &["image/avif"]),
    ("heic", &["image/heif"]),
    ("pdf", &["application/pdf"]),
    ("zip", &["application/zip"]),
    ("gz", &["application/gzip"]),
    ("tgz", &["application/gzip"]),
    ("tar", &["application/x-tar"]),
    ("rar", &["application/vnd.rar", "application/x-rar-compressed"]),
    ("7z", &["application/x-7z-compressed"]),
    ("docx", &["application/vnd.openxmlformats-officedocument.wordprocessingml.document"]),
    ("xlsx", &["application/vnd.openxmlformats-officedocument.spreadsheetml.sheet"]),
    ("pptx", &["application/vnd.openxmlformats-officedocument.presentationml.presentation"]),
    ("odt", &["application/vnd.oasis.opendocument.text"]),
    ("mp3", &["audio/mpeg"]),
    ("wav", &["audio/x-wav", "audio/wav"]),
    ("ogg", &["audio/ogg"]),
    ("flac", &["audio/x-flac"]),
    ("mp4", &["video/mp4"]),
    ("webm", &["video/webm"]),
    ("mov", &["video/quicktime"]),
    ("avi", &["video/x-msvideo"]),
    ("txt", &["text/plain"]),
    ("csv", &["text/csv", "text/plain"]),
    ("md", &["text/markdown", "text/plain"]),
    ("json", &["application/json", "text/plain"]),
    ("xml", &["text/xml", "application/xml"]),
    ("html", &["text/html"]),
    ("htm", &["text/html"]),
    ("php", &["application/x-httpd-php", "text/plain"]),
    ("exe", &["application/vnd.microsoft.portable-executable", "application/x-msdownload"]),
    ("bin", &["application/octet-stream"]),
];

/// In-memory [`MimeRegistry`] seeded with common web formats.
#[derive(Debug, Clone)]
pub struct StaticMimeRegistry {
    by_extension: BTreeMap<String, Vec<String>>,
}

impl StaticMimeRegistry {
    pub fn new() -> Self {
        let by_extension = DEFAULT_MAPPINGS
            .iter()
            .map(|(ext, mimes)| {
                (
                    ext.to_string(),
                    mimes.iter().map(|m| m.to_string()).collect(),
                )
            })
            .collect();
        Self { by_extension }
    }

    /// Empty registry, for callers that supply their own table.
    pub fn empty() -> Self {
        Self {
            by_extension: BTreeMap::new(),
        }
    }

    /// Adds or replaces the MIME types for an extension.
    pub fn with_mapping(mut self, extension: &str, mime_types: &[&str]) -> Self {
        self.by_extension.insert(
            extension.to_ascii_lowercase(),
            mime_types.iter().map(|m| m.to_string()).collect(),
        );
        self
    }
}

impl Default for StaticMimeRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl MimeRegistry for StaticMimeRegistry {
    fn mime_types_by_extension(&self, extension: &str) -> Option<Vec<String>> {
        self.by_extension
            .get(&extension.to_ascii_lowercase())
            .filter(|mimes| !mimes.is_empty())
            .cloned()
    }

    fn extensions_by_mime_type(&self, mime_type: &str) -> Option<Vec<String>> {
        let Ok(matcher) = wildcard_regex(&mime_type.to_ascii_lowercase()) else {
            return None;
        };
        let extensions: Vec<String> = self
            .by_extension
            .iter()
            .filter(|(_, mimes)| mimes.iter().any(|m| matcher.is_match(m)))
            .map(|(ext, _)| ext.clone())
            .collect();
        if extensions.is_empty() {
            None
        } else {
            Some(extensions)
        }
    }
}

/// Anchored regex for a MIME pattern where `*` matches any (possibly
/// empty) substring and everything else is literal.
pub fn wildcard_regex(pattern: &str) -> Result<Regex, regex::Error> {
    let body = pattern
        .split('*')
        .map(regex::escape)
        .collect::<Vec<_>>()
        .join(".*");
    Regex::new(&format!("^{}$", body))
}

/// Whether `value` matches the `*` wildcard `pattern`.
pub fn mime_pattern_matches(pattern: &str, value: &str) -> bool {
    wildcard_regex(pattern).is_ok_and(|r| r.is_match(value))
}
