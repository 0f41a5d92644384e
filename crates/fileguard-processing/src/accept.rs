//! Accept-list compilation.
//!
//! Turns the configured accept tokens (`.ext` or `type/subtype`, optionally
//! with `*` wildcards and `;params`) into MIME matchers paired with the
//! extensions allowed for each MIME type.

use fileguard_core::mime::wildcard_regex;
use fileguard_core::{MimeRegistry, UploadError};
use regex::Regex;

/// One compiled accept rule.
#[derive(Debug, Clone)]
pub struct AcceptRule {
    pub mime_type: String,
    matcher: Regex,
    pub extensions: Vec<String>,
}

impl AcceptRule {
    fn new(mime_type: String, extensions: Vec<String>) -> Result<Self, UploadError> {
        let matcher = wildcard_regex(&mime_type)
            .map_err(|_| UploadError::UnknownAccept(mime_type.clone()))?;
        Ok(Self {
            mime_type,
            matcher,
            extensions,
        })
    }

    pub fn matches_mime_type(&self, mime_type: &str) -> bool {
        self.matcher.is_match(mime_type)
    }

    pub fn allows_extension(&self, extension: &str) -> bool {
        self.extensions.iter().any(|e| e == extension)
    }

    pub fn matches(&self, mime_type: &str, extension: &str) -> bool {
        self.matches_mime_type(mime_type) && self.allows_extension(extension)
    }
}

/// Compiled accept rules in configuration order.
#[derive(Debug, Clone, Default)]
pub struct AcceptRules {
    rules: Vec<AcceptRule>,
}

enum AcceptToken {
    Extension(String),
    MimeType(String),
}

fn parse_token(raw: &str) -> Result<AcceptToken, UploadError> {
    let token = raw.trim();
    if let Some(ext) = token.strip_prefix('.') {
        if !ext.is_empty() {
            return Ok(AcceptToken::Extension(ext.to_ascii_lowercase()));
        }
    }
    // The top-level type is matched as given; the subtype is normalized.
    if let Some((kind, _)) = token.split_once('/') {
        if !kind.is_empty() && kind.chars().all(|c| c.is_ascii_lowercase() || c == '-') {
            let mime = token.split(';').next().unwrap_or_default().trim();
            return Ok(AcceptToken::MimeType(mime.to_ascii_lowercase()));
        }
    }
    Err(UploadError::UnknownAccept(raw.to_string()))
}

impl AcceptRules {
    /// Compile accept tokens against `registry`. Fails on the first token
    /// that cannot be parsed or resolved; never returns a partial set.
    pub fn compile(accept: &[String], registry: &dyn MimeRegistry) -> Result<Self, UploadError> {
        let mut extensions: Vec<String> = Vec::new();
        // MIME type -> extensions that produced it (None when given directly).
        let mut mime_types: Vec<(String, Option<Vec<String>>)> = Vec::new();

        for raw in accept {
            match parse_token(raw)? {
                AcceptToken::Extension(ext) => {
                    if !extensions.contains(&ext) {
                        extensions.push(ext);
                    }
                }
                AcceptToken::MimeType(mime) => {
                    if !mime_types.iter().any(|(m, _)| *m == mime) {
                        mime_types.push((mime, None));
                    }
                }
            }
        }

        for ext in &extensions {
            let resolved = registry
                .mime_types_by_extension(ext)
                .ok_or_else(|| UploadError::UnknownExtension(ext.clone()))?;
            for mime in resolved {
                let mime = mime.to_ascii_lowercase();
                match mime_types.iter_mut().find(|(m, _)| *m == mime) {
                    Some((_, Some(exts))) => {
                        if !exts.contains(ext) {
                            exts.push(ext.clone());
                        }
                    }
                    Some((_, slot)) => *slot = Some(vec![ext.clone()]),
                    None => mime_types.push((mime, Some(vec![ext.clone()]))),
                }
            }
        }

        let mut rules = Vec::with_capacity(mime_types.len());
        for (mime, from_extensions) in mime_types {
            let allowed = match from_extensions {
                Some(exts) => exts,
                None => registry
                    .extensions_by_mime_type(&mime)
                    .map(|exts| exts.into_iter().map(|e| e.to_ascii_lowercase()).collect())
                    .ok_or_else(|| UploadError::UnknownMimeType(mime.clone()))?,
            };
            rules.push(AcceptRule::new(mime, allowed)?);
        }

        tracing::debug!(rules = rules.len(), "Compiled accept rules");
        Ok(Self { rules })
    }

    pub fn rules(&self) -> &[AcceptRule] {
        &self.rules
    }

    pub fn mime_types(&self) -> Vec<&str> {
        self.rules.iter().map(|r| r.mime_type.as_str()).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// First rule whose matcher accepts `mime_type` and whose extensions
    /// include `extension`.
    pub fn find(&self, mime_type: &str, extension: &str) -> Option<&AcceptRule> {
        self.rules.iter().find(|r| r.matches(mime_type, extension))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fileguard_core::StaticMimeRegistry;
    use std::collections::BTreeSet;

    fn compile(tokens: &[&str]) -> Result<AcceptRules, UploadError> {
        let tokens: Vec<String> = tokens.iter().map(|t| t.to_string()).collect();
        AcceptRules::compile(&tokens, &StaticMimeRegistry::new())
    }

    #[test]
    fn test_extensions_only_key_set_is_registry_union() {
        let registry = StaticMimeRegistry::new();
        let rules = compile(&[".jpg", ".png", ".jpeg", ".csv", ".JPG"]).unwrap();
        let keys: BTreeSet<&str> = rules.mime_types().into_iter().collect();
        let expected: BTreeSet<String> = ["jpg", "png", "jpeg", "csv"]
            .iter()
            .flat_map(|e| registry.mime_types_by_extension(e).unwrap())
            .collect();
        assert_eq!(keys.len(), rules.rules().len());
        assert_eq!(
            keys,
            expected.iter().map(String::as_str).collect::<BTreeSet<_>>()
        );
    }

    #[test]
    fn test_extension_derived_rule_keeps_only_producing_extensions() {
        let rules = compile(&[".jpg"]).unwrap();
        let rule = rules.find("image/jpeg", "jpg").unwrap();
        assert_eq!(rule.extensions, vec!["jpg"]);
        assert!(rules.find("image/jpeg", "jpeg").is_none());
    }

    #[test]
    fn test_mime_token_uses_registry_extensions() {
        let rules = compile(&["image/jpeg"]).unwrap();
        assert!(rules.find("image/jpeg", "jpeg").is_some());
        assert!(rules.find("image/jpeg", "jpg").is_some());
    }

    #[test]
    fn test_wildcard_and_params() {
        let rules = compile(&["audio/*;capture=microphone", "image/*"]).unwrap();
        assert_eq!(rules.mime_types(), vec!["audio/*", "image/*"]);
        assert!(rules.find("audio/mpeg", "mp3").is_some());
        assert!(rules.find("image/png", "png").is_some());
        assert!(rules.find("image/png", "mp3").is_none());
        assert!(rules.find("video/mp4", "mp4").is_none());
    }

    #[test]
    fn test_matcher_escapes_metacharacters() {
        let rules = compile(&["image/svg+xml"]).unwrap();
        assert!(rules.rules()[0].matches_mime_type("image/svg+xml"));
        assert!(!rules.rules()[0].matches_mime_type("image/svggxml"));
    }

    #[test]
    fn test_unknown_accept_token() {
        assert!(matches!(compile(&["png"]), Err(UploadError::UnknownAccept(t)) if t == "png"));
        assert!(matches!(compile(&["."]), Err(UploadError::UnknownAccept(_))));
        assert!(matches!(compile(&["1x/y"]), Err(UploadError::UnknownAccept(_))));
    }

    #[test]
    fn test_uppercase_mime_type_is_unknown_accept() {
        assert!(matches!(
            compile(&["Image/PNG"]),
            Err(UploadError::UnknownAccept(t)) if t == "Image/PNG"
        ));
        assert!(compile(&["image/PNG"]).unwrap().find("image/png", "png").is_some());
        assert!(compile(&[".PNG"]).unwrap().find("image/png", "png").is_some());
    }

    #[test]
    fn test_unknown_extension_and_mime() {
        assert!(matches!(
            compile(&[".nope"]),
            Err(UploadError::UnknownExtension(e)) if e == "nope"
        ));
        assert!(matches!(
            compile(&["application/x-nothing"]),
            Err(UploadError::UnknownMimeType(m)) if m == "application/x-nothing"
        ));
    }
}
