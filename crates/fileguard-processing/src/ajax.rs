//! AJAX uploads: files submitted as JSON objects carrying base64 data URIs.
//!
//! Each `{filename, type, content}` object is decoded into a temp file and
//! exposed in the same raw shape multipart uploads have, so the validator
//! treats both transports alike.

use std::collections::{HashMap, HashSet};
use std::fs::{File, OpenOptions};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};

use base64::alphabet;
use base64::engine::{DecodePaddingMode, GeneralPurpose, GeneralPurposeConfig};
use base64::read::DecoderReader;
use fileguard_core::constants::DEFAULT_WRITE_BUFFER_SIZE;
use fileguard_core::{MimeRegistry, RawFileEntry, RawFileField, TransportError, UploadLimits};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::source::RawUploadSource;

/// Accepts unpadded payloads and non-zero trailing bits.
const LENIENT_BASE64: GeneralPurpose = GeneralPurpose::new(
    &alphabet::STANDARD,
    GeneralPurposeConfig::new()
        .with_decode_padding_mode(DecodePaddingMode::Indifferent)
        .with_decode_allow_trailing_bits(true),
);

const BASE64_MARKER: &str = ";base64,";

fn data_uri_regex() -> Option<&'static Regex> {
    static DATA_URI: OnceLock<Option<Regex>> = OnceLock::new();
    DATA_URI
        .get_or_init(|| {
            Regex::new(r"^data:([a-zA-Z0-9.+-]+/[a-zA-Z0-9.+-]+);base64,([a-zA-Z0-9+/]+=*)$")
                .map_err(|e| tracing::error!(error = %e, "Failed to compile data URI pattern"))
                .ok()
        })
        .as_ref()
}

/// One submitted AJAX file object.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AjaxFileItem {
    pub filename: String,
    #[serde(rename = "type")]
    pub mime_type: String,
    /// `data:<mime>;base64,<payload>`.
    pub content: Option<String>,
}

impl AjaxFileItem {
    /// Lenient conversion of one JSON value. Non-string members are
    /// treated as missing.
    fn from_value(value: &Value) -> Option<Self> {
        let object = value.as_object()?;
        let text = |key: &str| object.get(key).and_then(Value::as_str).map(str::to_string);
        Some(Self {
            filename: text("filename").unwrap_or_default(),
            mime_type: text("type").unwrap_or_default(),
            content: text("content"),
        })
    }
}

/// Streams base64 data URIs into upload temp files.
#[derive(Clone)]
pub struct AjaxUploadDecoder {
    write_buffer_size: usize,
    tmp_dir: PathBuf,
    upload_max_filesize: u64,
    registry: Option<Arc<dyn MimeRegistry>>,
}

impl AjaxUploadDecoder {
    pub fn new(tmp_dir: impl Into<PathBuf>, upload_max_filesize: u64) -> Self {
        Self {
            write_buffer_size: DEFAULT_WRITE_BUFFER_SIZE,
            tmp_dir: tmp_dir.into(),
            upload_max_filesize,
            registry: None,
        }
    }

    pub fn from_limits(limits: &dyn UploadLimits) -> Self {
        Self::new(limits.uploads_tmp_dir(), limits.upload_max_filesize())
    }

    /// Buffer size used while decoding; zero falls back to the default.
    pub fn with_write_buffer_size(mut self, size: usize) -> Self {
        self.write_buffer_size = if size > 0 { size } else { DEFAULT_WRITE_BUFFER_SIZE };
        self
    }

    /// Registry used to give temp files an extension matching the declared
    /// type.
    pub fn with_registry(mut self, registry: Arc<dyn MimeRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Decodes one item into a raw entry. Failures are reported through the
    /// entry's transport error, never as `Err`.
    pub fn decode(&self, item: &AjaxFileItem) -> RawFileEntry {
        let mut entry = RawFileEntry {
            name: item.filename.clone(),
            mime_type: item.mime_type.clone(),
            tmp_name: String::new(),
            size: 0,
            error: TransportError::Ok,
        };

        let Some(payload) = item.content.as_deref().and_then(data_uri_payload) else {
            tracing::debug!(file = %item.filename, "AJAX upload content is not a base64 data URI");
            entry.error = TransportError::NoFile;
            return entry;
        };

        if !self.tmp_dir.is_dir() {
            tracing::error!(dir = %self.tmp_dir.display(), "Uploads temp directory is missing");
            entry.error = TransportError::NoTmpDir;
            return entry;
        }

        let path = self.temp_file_path(&item.mime_type);
        let file = match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(file) => file,
            Err(e) => {
                tracing::error!(path = %path.display(), error = %e, "Failed to create AJAX upload temp file");
                entry.error = TransportError::CantWrite;
                return entry;
            }
        };
        entry.tmp_name = path.to_string_lossy().to_string();

        let (written, error) = self.write_payload(payload, file);
        entry.size = written;
        entry.error = error.unwrap_or_else(|| {
            if written < expected_size(payload) {
                TransportError::Partial
            } else {
                TransportError::Ok
            }
        });
        if !entry.error.is_ok() {
            tracing::debug!(
                file = %item.filename,
                size = written,
                error = ?entry.error,
                "AJAX upload decoded with transport error"
            );
        }
        entry
    }

    fn temp_file_path(&self, mime_type: &str) -> PathBuf {
        let mut name = format!("upload_{}", Uuid::new_v4().simple());
        let extension = self
            .registry
            .as_ref()
            .and_then(|r| r.extensions_by_mime_type(mime_type))
            .and_then(|exts| exts.into_iter().find(|e| !e.is_empty()));
        if let Some(extension) = extension {
            name.push('.');
            name.push_str(&extension);
        }
        self.tmp_dir.join(name)
    }

    /// Returns bytes written and the transport error that stopped writing,
    /// if any.
    fn write_payload(&self, payload: &str, mut out: File) -> (u64, Option<TransportError>) {
        let mut decoder = DecoderReader::new(payload.as_bytes(), &LENIENT_BASE64);
        let mut buffer = vec![0u8; self.write_buffer_size];
        let mut written = 0u64;
        loop {
            let read = match decoder.read(&mut buffer) {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    tracing::debug!(error = %e, "Base64 payload could not be decoded completely");
                    let error = if is_truncated(payload) || written < expected_size(payload) {
                        TransportError::Partial
                    } else {
                        TransportError::NoFile
                    };
                    return (written, Some(error));
                }
            };
            if let Err(e) = out.write_all(&buffer[..read]) {
                tracing::error!(error = %e, "Failed to write AJAX upload temp file");
                return (written, Some(TransportError::CantWrite));
            }
            written += read as u64;
            if written > self.upload_max_filesize {
                return (written, Some(TransportError::IniSize));
            }
        }
        if let Err(e) = out.flush() {
            tracing::error!(error = %e, "Failed to flush AJAX upload temp file");
            return (written, Some(TransportError::CantWrite));
        }
        (written, None)
    }
}

/// Base64 payload of a `data:<mime>;base64,<payload>` URI.
fn data_uri_payload(content: &str) -> Option<&str> {
    if !data_uri_regex()?.is_match(content) {
        return None;
    }
    content
        .find(BASE64_MARKER)
        .map(|pos| &content[pos + BASE64_MARKER.len()..])
}

/// Decoded size implied by the payload length, ignoring padding.
fn expected_size(payload: &str) -> u64 {
    let unpadded = payload.trim_end_matches('=').len() as u64;
    unpadded * 3 / 4
}

/// No complete base64 payload leaves a single character in its last
/// quantum, so such a payload was cut off in transit.
fn is_truncated(payload: &str) -> bool {
    payload.trim_end_matches('=').len() % 4 == 1
}

/// [`RawUploadSource`] over a decoded AJAX JSON payload.
#[derive(Debug, Clone, Default)]
pub struct AjaxUploads {
    fields: HashMap<String, RawFileField>,
    created: HashSet<PathBuf>,
}

impl AjaxUploads {
    /// Decodes every field of a JSON object. With `multiple`, a field must
    /// hold an array of file objects, otherwise a single object; values of
    /// the wrong shape are ignored.
    pub fn decode(payload: &Value, multiple: bool, decoder: &AjaxUploadDecoder) -> Self {
        let mut uploads = Self::default();
        let Some(object) = payload.as_object() else {
            return uploads;
        };
        for (field, value) in object {
            uploads.decode_field(field, value, multiple, decoder);
        }
        uploads
    }

    pub fn from_json(
        json: &str,
        multiple: bool,
        decoder: &AjaxUploadDecoder,
    ) -> Result<Self, serde_json::Error> {
        let payload: Value = serde_json::from_str(json)?;
        Ok(Self::decode(&payload, multiple, decoder))
    }

    /// Decodes one field's value and registers it under `field`.
    pub fn decode_field(&mut self, field: &str, value: &Value, multiple: bool, decoder: &AjaxUploadDecoder) {
        let raw = if multiple {
            let Some(items) = value.as_array() else {
                return;
            };
            let entries: Vec<RawFileEntry> = items
                .iter()
                .filter_map(AjaxFileItem::from_value)
                .map(|item| self.decode_item(&item, decoder))
                .collect();
            if entries.is_empty() {
                return;
            }
            RawFileField::multiple(entries)
        } else {
            let Some(item) = AjaxFileItem::from_value(value) else {
                return;
            };
            let entry = self.decode_item(&item, decoder);
            RawFileField::single(entry.name, entry.mime_type, entry.tmp_name, entry.size, entry.error)
        };
        self.fields.insert(field.to_string(), raw);
    }

    fn decode_item(&mut self, item: &AjaxFileItem, decoder: &AjaxUploadDecoder) -> RawFileEntry {
        let entry = decoder.decode(item);
        if !entry.tmp_name.is_empty() {
            self.created.insert(PathBuf::from(&entry.tmp_name));
        }
        entry
    }

    /// Temp files created while decoding.
    pub fn created_paths(&self) -> Vec<PathBuf> {
        self.created.iter().cloned().collect()
    }
}

impl RawUploadSource for AjaxUploads {
    fn file_field(&self, field: &str) -> Option<RawFileField> {
        self.fields.get(field).cloned()
    }

    fn is_uploaded_file(&self, path: &Path) -> bool {
        self.created.contains(path)
    }
}
