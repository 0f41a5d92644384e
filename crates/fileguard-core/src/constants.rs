//! Default limits and fixed name lists used by the validator.

/// Default maximum number of entries across a whole (possibly nested) archive.
pub const DEFAULT_ARCHIVE_MAX_ITEMS: u64 = 1000;

/// Default maximum archive nesting depth.
pub const DEFAULT_ARCHIVE_MAX_LEVELS: u32 = 3;

/// Default minimum compressed/uncompressed percentage an archive must keep.
pub const DEFAULT_ARCHIVE_MAX_COMPRESS_PERCENTAGE: f64 = 5.0;

/// Default maximum PNG width or height in pixels.
pub const DEFAULT_PNG_IMAGE_MAX_WIDTH_HEIGHT: u32 = 10_000;

/// Default chunk size used when decoding base64 payloads to disk (1 MiB).
pub const DEFAULT_WRITE_BUFFER_SIZE: usize = 1024 * 1024;

/// Characters kept in file names by the default allow-list, in regex
/// character-class notation.
pub const DEFAULT_ALLOWED_FILE_NAME_CHARS: &str = "-a-zA-Z0-9@,._ ()+={}[]'";

/// Scanner identifiers used when none are configured, in probe order.
pub const DEFAULT_BOMB_SCANNERS: &[&str] = &["zip", "png", "gzip"];

/// Longest file name accepted by common filesystems, in bytes.
pub const MAX_FILE_NAME_BYTES: usize = 255;

/// Names that configure web servers when dropped into a served directory.
pub const WEB_RESERVED_NAMES: &[&str] = &[".htaccess", ".htpasswd", "web.config", ".user.ini"];

/// Device names Windows refuses as file names, with or without extension.
pub const WINDOWS_RESERVED_NAMES: &[&str] = &[
    "CON", "PRN", "AUX", "NUL", "COM1", "COM2", "COM3", "COM4", "COM5", "COM6", "COM7", "COM8",
    "COM9", "LPT1", "LPT2", "LPT3", "LPT4", "LPT5", "LPT6", "LPT7", "LPT8", "LPT9",
];

/// Fallback for `upload_max_filesize` when no ini value is configured.
pub const DEFAULT_UPLOAD_MAX_FILESIZE: u64 = 2 * 1024 * 1024;

/// Fallback for `post_max_size` when no ini value is configured.
pub const DEFAULT_POST_MAX_SIZE: u64 = 8 * 1024 * 1024;

/// Fallback for `max_file_uploads` when no ini value is configured.
pub const DEFAULT_MAX_FILE_UPLOADS: u32 = 20;
