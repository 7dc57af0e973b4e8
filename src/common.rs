use std::fmt::{self, Display, Formatter};
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// What a document holds, inferred from the file extension at creation time.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MediaType {
    Xml,
    Schema,
    Xquery,
    PlainText,
    Binary,
}

impl MediaType {
    /// Infers the media type from a document name: `.xml`, `.xsd`, `.xqy`
    /// and `.txt` are recognized, everything else is binary.
    pub fn from_name(name: &str) -> MediaType {
        match Path::new(name).extension().and_then(|e| e.to_str()) {
            Some("xml") => MediaType::Xml,
            Some("xsd") => MediaType::Schema,
            Some("xqy") => MediaType::Xquery,
            Some("txt") => MediaType::PlainText,
            _ => MediaType::Binary,
        }
    }

    pub(crate) fn tag(self) -> u8 {
        match self {
            MediaType::Xml => 0,
            MediaType::Schema => 1,
            MediaType::Xquery => 2,
            MediaType::PlainText => 3,
            MediaType::Binary => 4,
        }
    }

    pub(crate) fn from_tag(tag: u8) -> Result<MediaType> {
        match tag {
            0 => Ok(MediaType::Xml),
            1 => Ok(MediaType::Schema),
            2 => Ok(MediaType::Xquery),
            3 => Ok(MediaType::PlainText),
            4 => Ok(MediaType::Binary),
            other => Err(Error::catalog(format!("unknown media type tag {}", other))),
        }
    }
}

impl Display for MediaType {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let name = match self {
            MediaType::Xml => "xml",
            MediaType::Schema => "schema",
            MediaType::Xquery => "xquery",
            MediaType::PlainText => "plain_text",
            MediaType::Binary => "binary",
        };
        write!(f, "{}", name)
    }
}

/// Schema validation policy for XML documents in a collection.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValidationMode {
    /// Validation is required; a document without a known schema is rejected.
    On,
    /// Best effort; documents without a known schema are accepted as-is.
    Auto,
    Off,
}

/// Storage compression for document content.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompressionMode {
    None,
    Deflate,
}

/// A per-collection setting that either carries an explicit value or defers
/// to the parent collection. The root collection never defers.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Inheritable<T> {
    Set(T),
    Inherit,
}

impl<T> Inheritable<T> {
    pub fn is_inherit(&self) -> bool {
        matches!(self, Inheritable::Inherit)
    }
}

pub(crate) fn validation_tag(mode: Inheritable<ValidationMode>) -> u8 {
    match mode {
        Inheritable::Set(ValidationMode::On) => 0,
        Inheritable::Set(ValidationMode::Auto) => 1,
        Inheritable::Set(ValidationMode::Off) => 2,
        Inheritable::Inherit => 3,
    }
}

pub(crate) fn validation_from_tag(tag: u8) -> Result<Inheritable<ValidationMode>> {
    match tag {
        0 => Ok(Inheritable::Set(ValidationMode::On)),
        1 => Ok(Inheritable::Set(ValidationMode::Auto)),
        2 => Ok(Inheritable::Set(ValidationMode::Off)),
        3 => Ok(Inheritable::Inherit),
        other => Err(Error::catalog(format!("unknown validation mode tag {}", other))),
    }
}

pub(crate) fn compression_tag(mode: Inheritable<CompressionMode>) -> u8 {
    match mode {
        Inheritable::Set(CompressionMode::None) => 0,
        Inheritable::Set(CompressionMode::Deflate) => 1,
        Inheritable::Inherit => 2,
    }
}

pub(crate) fn compression_from_tag(tag: u8) -> Result<Inheritable<CompressionMode>> {
    match tag {
        0 => Ok(Inheritable::Set(CompressionMode::None)),
        1 => Ok(Inheritable::Set(CompressionMode::Deflate)),
        2 => Ok(Inheritable::Inherit),
        other => Err(Error::catalog(format!("unknown compression mode tag {}", other))),
    }
}

/// Milliseconds since the Unix epoch, as stored in the catalog.
pub(crate) fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn media_type_from_extension() {
        assert_eq!(MediaType::from_name("report.xml"), MediaType::Xml);
        assert_eq!(MediaType::from_name("schema.xsd"), MediaType::Schema);
        assert_eq!(MediaType::from_name("run.xqy"), MediaType::Xquery);
        assert_eq!(MediaType::from_name("notes.txt"), MediaType::PlainText);
        assert_eq!(MediaType::from_name("image.png"), MediaType::Binary);
        assert_eq!(MediaType::from_name("no_extension"), MediaType::Binary);
    }

    #[test]
    fn mode_tags_roundtrip() {
        for mode in [
            Inheritable::Set(ValidationMode::On),
            Inheritable::Set(ValidationMode::Auto),
            Inheritable::Set(ValidationMode::Off),
            Inheritable::Inherit,
        ] {
            assert_eq!(validation_from_tag(validation_tag(mode)).unwrap(), mode);
        }
        for mode in [
            Inheritable::Set(CompressionMode::None),
            Inheritable::Set(CompressionMode::Deflate),
            Inheritable::Inherit,
        ] {
            assert_eq!(compression_from_tag(compression_tag(mode)).unwrap(), mode);
        }
    }
}
