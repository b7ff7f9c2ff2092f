//! Item id normalization and extension checks shared by the change consumers.

use std::borrow::Cow;
use std::collections::BTreeSet;

use crate::error::{Error, Result};

/// Undo the storage system's key encoding: `+` is a space, then percent
/// escapes. Ids may contain spaces and non-ASCII characters.
pub fn decode_item_id(raw: &str) -> Result<String> {
    let spaced = raw.replace('+', " ");
    urlencoding::decode(&spaced)
        .map(Cow::into_owned)
        .map_err(|e| Error::Validation(format!("item id {raw:?} does not decode to UTF-8: {e}")))
}

/// Supported file extensions, compared case-insensitively.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtensionAllowlist {
    extensions: BTreeSet<String>,
}

impl ExtensionAllowlist {
    pub fn new<I, S>(extensions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            extensions: extensions
                .into_iter()
                .map(|e| e.as_ref().trim_start_matches('.').to_ascii_lowercase())
                .filter(|e| !e.is_empty())
                .collect(),
        }
    }

    /// Extension of the last path segment, without the dot.
    pub fn extension_of(item_id: &str) -> Option<&str> {
        let file_name = item_id.rsplit('/').next().unwrap_or(item_id);
        match file_name.rsplit_once('.') {
            Some((_, ext)) if !ext.is_empty() => Some(ext),
            _ => None,
        }
    }

    pub fn allows(&self, item_id: &str) -> bool {
        Self::extension_of(item_id)
            .is_some_and(|ext| self.extensions.contains(&ext.to_ascii_lowercase()))
    }

    /// Fail with `Validation` unless the id carries an allowed extension.
    pub fn validate(&self, item_id: &str) -> Result<()> {
        match Self::extension_of(item_id) {
            None => Err(Error::Validation(format!("{item_id:?} has no file extension"))),
            Some(_) if self.allows(item_id) => Ok(()),
            Some(ext) => Err(Error::Validation(format!(
                "unsupported extension {ext:?} for {item_id:?}"
            ))),
        }
    }

    pub fn extensions(&self) -> impl Iterator<Item = &str> {
        self.extensions.iter().map(String::as_str)
    }
}

impl Default for ExtensionAllowlist {
    fn default() -> Self {
        Self::new(["jpeg", "png"])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plus_and_percent_escapes_decode() {
        assert_eq!(decode_item_id("my+photo%20(1).png").unwrap(), "my photo (1).png");
        assert_eq!(decode_item_id("caf%C3%A9.jpeg").unwrap(), "café.jpeg");
    }

    #[test]
    fn encoded_plus_survives_decoding() {
        assert_eq!(decode_item_id("a%2Bb.png").unwrap(), "a+b.png");
    }

    #[test]
    fn invalid_utf8_is_a_validation_error() {
        let err = decode_item_id("bad%FF.png").unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }

    #[test]
    fn disallowed_extension_fails_validation() {
        let allow = ExtensionAllowlist::new(["jpeg", "png"]);
        assert!(matches!(allow.validate("x.exe"), Err(Error::Validation(_))));
        assert!(matches!(allow.validate("noext"), Err(Error::Validation(_))));
        assert!(allow.validate("x.png").is_ok());
        assert!(allow.validate("x.PNG").is_ok());
    }

    #[test]
    fn extension_comes_from_last_path_segment() {
        assert_eq!(ExtensionAllowlist::extension_of("albums.v2/cat"), None);
        assert_eq!(ExtensionAllowlist::extension_of("albums/cat.jpeg"), Some("jpeg"));
        assert_eq!(ExtensionAllowlist::extension_of("trailing."), None);
    }
}
