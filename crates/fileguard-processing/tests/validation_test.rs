//! End-to-end validation of multipart uploads.
//!
//! Run with: `cargo test -p fileguard-processing --test validation_test`

mod helpers;

use fileguard_core::{ErrorMetadata, FieldErrors, RawFileField, UploadError};
use fileguard_processing::MultipartUploads;
use helpers::{constraints, fixtures, UploadDir};

#[test]
fn test_traversal_name_with_png_content_is_accepted() {
    let uploads = UploadDir::new();
    let source = uploads.single("image", "../../evil.php%00.png", "image/png", &fixtures::png(64, 48));
    let validator = uploads.validator("image", constraints(&["image/png"]));

    let files = validator.validate(&source).unwrap();
    let file = &files[0];
    let name = file.sanitized_name.as_deref().unwrap();
    assert_eq!(name, "evil.php.png");
    assert!(!name.contains(".."));
    assert!(!name.contains('\0'));
    assert!(!name.contains('/'));
    assert_eq!(file.extension.as_deref(), Some("png"));
    assert_eq!(file.detected_mime_type.as_deref(), Some("image/png"));
    assert!(file.temp_path.exists());
}

#[test]
fn test_too_few_files_before_per_file_checks() {
    let uploads = UploadDir::new();
    let mut config = constraints(&[".txt"]);
    config.multiple = true;
    config.min_count = Some(2);
    config.max_count = Some(5);

    // Empty content would fail the per-file checks if they ran.
    let entry = uploads.entry("a.txt", "text/plain", b"");
    let source = MultipartUploads::new().with_field("docs", RawFileField::multiple(vec![entry]));
    let validator = uploads.validator("docs", config);

    let mut sink = FieldErrors::new("docs");
    assert!(validator.validate_with_sink(&source, &mut sink).is_none());
    assert_eq!(sink.errors.len(), 1);
    assert_eq!(sink.errors[0].args, vec!["2".to_string()]);
    assert_eq!(sink.messages(), vec!["Field allows to upload `2` file(s) at minimum.".to_string()]);
    assert_eq!(uploads.leftovers(), 0);
}

#[test]
fn test_multiple_files_all_accepted() {
    let uploads = UploadDir::new();
    let mut config = constraints(&[".txt", "image/*"]);
    config.multiple = true;
    config.max_count = Some(5);

    let entries = vec![
        uploads.entry("readme.txt", "text/plain", b"read me\n"),
        uploads.entry("photo.PNG", "image/png", &fixtures::png(10, 10)),
    ];
    let source = MultipartUploads::new().with_field("files", RawFileField::multiple(entries));
    let files = uploads.validator("files", config).validate(&source).unwrap();

    let names: Vec<_> = files.iter().map(|f| f.sanitized_name.clone().unwrap()).collect();
    assert_eq!(names, vec!["readme.txt".to_string(), "photo.png".to_string()]);
    assert_eq!(uploads.leftovers(), 2);
}

#[test]
fn test_disguised_content_is_rejected() {
    let uploads = UploadDir::new();
    let source = uploads.single("image", "cat.png", "image/png", b"<?php echo 'hi'; ?>");
    let validator = uploads.validator("image", constraints(&[".png"]));

    let err = validator.validate(&source).unwrap_err();
    assert_eq!(err, UploadError::NotAccepted("cat.png".to_string()));
    assert_eq!(err.error_code(), "NOT_ACCEPTED");
    assert_eq!(uploads.leftovers(), 0);
}

#[test]
fn test_reserved_name_is_rejected() {
    let uploads = UploadDir::new();
    let source = uploads.single("file", ".htaccess", "text/plain", b"Options +Indexes\n");
    let validator = uploads.validator("file", constraints(&[".txt"]));

    let err = validator.validate(&source).unwrap_err();
    assert!(matches!(err, UploadError::ReservedName(_)));
    assert_eq!(uploads.leftovers(), 0);
}

#[test]
fn test_size_bounds_use_human_sizes() {
    let uploads = UploadDir::new();
    let mut config = constraints(&[".txt"]);
    config.max_size = Some(1024);
    let source = uploads.single("doc", "long.txt", "text/plain", &vec![b'a'; 2048]);

    let err = uploads.validator("doc", config.clone()).validate(&source).unwrap_err();
    assert_eq!(err, UploadError::MaxSize("1 KB".to_string()));

    config.max_size = None;
    config.min_size = Some(1536);
    let source = uploads.single("doc", "short.txt", "text/plain", b"tiny");
    let err = uploads.validator("doc", config).validate(&source).unwrap_err();
    assert_eq!(err, UploadError::MinSize("1.5 KB".to_string()));
}

#[test]
fn test_unknown_accept_token_is_configuration_error() {
    let uploads = UploadDir::new();
    let source = uploads.single("doc", "a.txt", "text/plain", b"text");
    let validator = uploads.validator("doc", constraints(&["not a type"]));

    let err = validator.validate(&source).unwrap_err();
    assert_eq!(err, UploadError::UnknownAccept("not a type".to_string()));
    assert!(err.is_configuration_error());
    assert_eq!(uploads.leftovers(), 0);
}
