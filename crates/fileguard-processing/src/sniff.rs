//! Content-based type detection and accept-rule cross-check.

use std::fs::File;
use std::io::{self, Read};
use std::path::Path;
use std::sync::Arc;

use fileguard_core::{UploadDescriptor, UploadError};

use crate::accept::AcceptRules;

/// Bytes read from the start of a file for detection.
const SNIFF_BYTES: u64 = 8192;

const OCTET_STREAM: &str = "application/octet-stream";

/// Detects a file's MIME type from its content.
pub trait ContentSniffer: Send + Sync {
    fn sniff(&self, path: &Path) -> io::Result<String>;
}

/// [`ContentSniffer`] using magic-byte signatures from the `infer` crate,
/// with a text heuristic for formats that have no signature.
#[derive(Debug, Clone, Copy, Default)]
pub struct InferSniffer;

impl InferSniffer {
    pub fn sniff_bytes(&self, head: &[u8]) -> String {
        // Text signatures (xml, html, scripts) are refined below.
        let inferred = infer::get(head).map(|kind| kind.mime_type());
        if let Some(mime) = inferred.filter(|m| !m.starts_with("text/")) {
            return mime.to_string();
        }
        if !looks_like_text(head) {
            return inferred.unwrap_or(OCTET_STREAM).to_string();
        }

        let text = String::from_utf8_lossy(head);
        let start = text.trim_start().to_ascii_lowercase();
        if start.starts_with("<svg") || (start.starts_with("<?xml") && start.contains("<svg")) {
            "image/svg+xml".to_string()
        } else if start.starts_with("<?xml") {
            "text/xml".to_string()
        } else if start.starts_with("<!doctype html") || start.starts_with("<html") {
            "text/html".to_string()
        } else {
            "text/plain".to_string()
        }
    }
}

impl ContentSniffer for InferSniffer {
    fn sniff(&self, path: &Path) -> io::Result<String> {
        let mut head = Vec::with_capacity(SNIFF_BYTES as usize);
        File::open(path)?.take(SNIFF_BYTES).read_to_end(&mut head)?;
        Ok(self.sniff_bytes(&head))
    }
}

/// UTF-8 without NUL bytes. A multi-byte sequence cut off by the read
/// window still counts as text.
fn looks_like_text(head: &[u8]) -> bool {
    if head.is_empty() || head.contains(&0) {
        return false;
    }
    match std::str::from_utf8(head) {
        Ok(_) => true,
        Err(e) => e.error_len().is_none(),
    }
}

/// Cross-checks sniffed content type and sanitized extension against the
/// compiled accept rules.
#[derive(Clone)]
pub struct TypeSniffer {
    sniffer: Arc<dyn ContentSniffer>,
}

impl TypeSniffer {
    pub fn new(sniffer: Arc<dyn ContentSniffer>) -> Self {
        Self { sniffer }
    }

    /// Sets `detected_mime_type` to the sniffed type when the first rule
    /// matching both type and extension is found.
    pub fn check(&self, file: &mut UploadDescriptor, rules: &AcceptRules) -> Result<(), UploadError> {
        let name = file.display_name();
        let detected = match self.sniffer.sniff(&file.temp_path) {
            Ok(mime) => mime,
            Err(e) => {
                tracing::warn!(file = %name, error = %e, "Failed to sniff uploaded file");
                return Err(UploadError::NotAccepted(name));
            }
        };
        let detected = detected
            .split(';')
            .next()
            .unwrap_or_default()
            .trim()
            .to_ascii_lowercase();
        let extension = file.extension.clone().unwrap_or_default();

        match rules.find(&detected, &extension) {
            Some(rule) => {
                tracing::debug!(
                    file = %name,
                    detected = %detected,
                    rule = %rule.mime_type,
                    "Upload matched accept rule"
                );
                file.detected_mime_type = Some(detected);
                Ok(())
            }
            None => {
                tracing::debug!(
                    file = %name,
                    detected = %detected,
                    extension = %extension,
                    "Upload not accepted"
                );
                Err(UploadError::NotAccepted(name))
            }
        }
    }
}
