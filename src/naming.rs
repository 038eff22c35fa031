//! Storage key layout.
//!
//! Metadata lives under `metadata/<role>.json`, targets under
//! `targets/<sha256-hex>.<original-filename>`. The layout is persisted, so it
//! has to stay stable across versions.

use core::fmt;
use std::str::FromStr;

use sha2::{Digest, Sha256};

pub const JSON_CONTENT_TYPE: &str = "application/json";
pub const OCTET_STREAM_CONTENT_TYPE: &str = "application/octet-stream";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Category {
    Metadata,
    Targets,
}

impl Category {
    /// The key prefix (without the trailing `/`).
    pub fn prefix(self) -> &'static str {
        match self {
            Self::Metadata => "metadata",
            Self::Targets => "targets",
        }
    }

    pub fn content_type(self) -> &'static str {
        match self {
            Self::Metadata => JSON_CONTENT_TYPE,
            Self::Targets => OCTET_STREAM_CONTENT_TYPE,
        }
    }

    /// Human readable label used in "not found" messages.
    pub fn label(self) -> &'static str {
        match self {
            Self::Metadata => "Metadata",
            Self::Targets => "Target",
        }
    }

    /// Which category a requested filename belongs to, judged by its suffix.
    pub fn infer(name: &str) -> Self {
        if name.ends_with(".json") {
            Self::Metadata
        } else {
            Self::Targets
        }
    }

    /// The category a stored key lives in, if it follows the layout at all.
    pub fn of_key(key: &str) -> Option<Self> {
        let (prefix, rest) = key.split_once('/')?;
        if rest.is_empty() {
            return None;
        }
        match prefix {
            "metadata" => Some(Self::Metadata),
            "targets" => Some(Self::Targets),
            _ => None,
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.prefix())
    }
}

#[derive(Debug, thiserror::Error)]
#[error("invalid category {0:?}")]
pub struct InvalidCategory(pub String);

impl FromStr for Category {
    type Err = InvalidCategory;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "metadata" => Ok(Self::Metadata),
            "targets" => Ok(Self::Targets),
            other => Err(InvalidCategory(other.into())),
        }
    }
}

#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum InvalidFilename {
    #[error("filename is empty")]
    Empty,
    #[error("filename {0:?} is a relative path component")]
    RelativeComponent(String),
    #[error("filename {0:?} contains a path separator")]
    Separator(String),
    #[error("filename {0:?} contains control characters")]
    ControlCharacter(String),
}

/// Rejects filenames that would escape their category prefix or smuggle odd
/// bytes into a storage key.
pub fn validate_filename(filename: &str) -> Result<(), InvalidFilename> {
    if filename.is_empty() {
        return Err(InvalidFilename::Empty);
    }
    if filename == "." || filename == ".." {
        return Err(InvalidFilename::RelativeComponent(filename.into()));
    }
    if filename.contains(['/', '\\']) {
        return Err(InvalidFilename::Separator(filename.into()));
    }
    if filename.chars().any(|c| c.is_control()) {
        return Err(InvalidFilename::ControlCharacter(filename.into()));
    }
    Ok(())
}

/// Maps a requested filename to the key it would be stored under.
pub fn resolve_retrieval_key(name: &str) -> (Category, String) {
    let category = Category::infer(name);
    (category, format!("{}/{name}", category.prefix()))
}

pub fn sha256_hex(payload: &[u8]) -> String {
    let digest = Sha256::digest(payload);
    format!("{:x}", base16ct::HexDisplay(&digest))
}

pub fn target_key(filename: &str, payload: &[u8]) -> String {
    format!(
        "{}/{}.{filename}",
        Category::Targets.prefix(),
        sha256_hex(payload)
    )
}

pub fn metadata_key(filename: &str) -> String {
    format!("{}/{filename}", Category::Metadata.prefix())
}

/// Content type by key suffix, independent of how the key was requested.
pub fn content_type_for_key(key: &str) -> &'static str {
    Category::infer(key).content_type()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_category_inference() {
        assert_eq!(
            resolve_retrieval_key("root.json"),
            (Category::Metadata, "metadata/root.json".into())
        );
        assert_eq!(
            resolve_retrieval_key("app.tar.gz"),
            (Category::Targets, "targets/app.tar.gz".into())
        );
        // only the suffix counts
        assert_eq!(resolve_retrieval_key("json").0, Category::Targets);
        assert_eq!(resolve_retrieval_key("x.json.sig").0, Category::Targets);
    }

    #[test]
    fn test_target_key_is_content_addressed() {
        let a = target_key("a.bin", b"hello");
        assert_eq!(
            a,
            "targets/2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824.a.bin"
        );
        assert_eq!(a, target_key("a.bin", b"hello"));
        assert_ne!(a, target_key("a.bin", b"hello!"));
        assert_ne!(a, target_key("b.bin", b"hello"));

        // sha256 of the empty string
        assert_eq!(
            target_key("empty", b""),
            "targets/e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855.empty"
        );
    }

    #[test]
    fn test_metadata_key_is_verbatim() {
        assert_eq!(metadata_key("timestamp.json"), "metadata/timestamp.json");
        assert_eq!(metadata_key("1.root.json"), "metadata/1.root.json");
    }

    #[test]
    fn test_parse_category() {
        assert_eq!("metadata".parse::<Category>().unwrap(), Category::Metadata);
        assert_eq!("targets".parse::<Category>().unwrap(), Category::Targets);
        assert!("target".parse::<Category>().is_err());
        assert!("Metadata".parse::<Category>().is_err());
        assert!("".parse::<Category>().is_err());
    }

    #[test]
    fn test_category_of_key() {
        assert_eq!(Category::of_key("metadata/root.json"), Some(Category::Metadata));
        assert_eq!(Category::of_key("targets/abc.bin"), Some(Category::Targets));
        assert_eq!(Category::of_key("targets/"), None);
        assert_eq!(Category::of_key("other/x"), None);
        assert_eq!(Category::of_key("metadata"), None);
    }

    #[test]
    fn test_validate_filename() {
        assert!(validate_filename("timestamp.json").is_ok());
        assert!(validate_filename("app-1.0.tar.gz").is_ok());
        assert!(validate_filename("..hidden").is_ok());

        assert_eq!(validate_filename(""), Err(InvalidFilename::Empty));
        assert!(matches!(
            validate_filename(".."),
            Err(InvalidFilename::RelativeComponent(_))
        ));
        assert!(matches!(
            validate_filename("../root.json"),
            Err(InvalidFilename::Separator(_))
        ));
        assert!(matches!(
            validate_filename("a\\b"),
            Err(InvalidFilename::Separator(_))
        ));
        assert!(matches!(
            validate_filename("a\0b"),
            Err(InvalidFilename::ControlCharacter(_))
        ));
        assert!(matches!(
            validate_filename("line\nbreak"),
            Err(InvalidFilename::ControlCharacter(_))
        ));
    }

    #[test]
    fn test_content_type_for_key() {
        assert_eq!(content_type_for_key("metadata/root.json"), JSON_CONTENT_TYPE);
        assert_eq!(content_type_for_key("targets/abc.a.bin"), OCTET_STREAM_CONTENT_TYPE);
    }
}
