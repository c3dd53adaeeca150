//! Content-addressed cache keys, payload encodings and entry descriptions.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use time::OffsetDateTime;

use super::error::DomainError;

/// Number of hex characters in a SHA-256 digest.
pub const CONTENT_HASH_LEN: usize = 64;

/// Lowercase hex SHA-256 digest identifying a cached payload.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ContentHash(String);

impl ContentHash {
    /// Hash an in-memory payload.
    pub fn digest(bytes: &[u8]) -> Self {
        let digest = Sha256::digest(bytes);
        Self::from_digest(&digest[..])
    }

    /// Wrap finished digest output.
    pub fn from_digest(digest: &[u8]) -> Self {
        Self(hex::encode(digest))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl FromStr for ContentHash {
    type Err = DomainError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let value = value.trim();
        if value.is_empty() {
            return Err(DomainError::validation("hash parameter is required"));
        }
        if value.len() != CONTENT_HASH_LEN
            || !value
                .bytes()
                .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b.to_ascii_lowercase()))
        {
            return Err(DomainError::validation(format!(
                "hash `{value}` is not a {CONTENT_HASH_LEN}-character hex digest"
            )));
        }
        Ok(Self(value.to_ascii_lowercase()))
    }
}

impl TryFrom<String> for ContentHash {
    type Error = DomainError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<ContentHash> for String {
    fn from(hash: ContentHash) -> Self {
        hash.0
    }
}

impl fmt::Display for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Transfer encoding of template content submitted inline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContentEncoding {
    #[default]
    Base64,
    Binary,
    Hex,
}

impl ContentEncoding {
    pub fn as_str(self) -> &'static str {
        match self {
            ContentEncoding::Base64 => "base64",
            ContentEncoding::Binary => "binary",
            ContentEncoding::Hex => "hex",
        }
    }

    /// Decode submitted content into the raw payload bytes.
    pub fn decode(self, content: &[u8]) -> Result<Vec<u8>, DomainError> {
        match self {
            ContentEncoding::Binary => Ok(content.to_vec()),
            ContentEncoding::Base64 => {
                let trimmed = content.trim_ascii();
                BASE64.decode(trimmed).map_err(|err| {
                    DomainError::validation(format!("content is not valid base64: {err}"))
                })
            }
            ContentEncoding::Hex => hex::decode(content.trim_ascii())
                .map_err(|err| DomainError::validation(format!("content is not valid hex: {err}"))),
        }
    }
}

impl FromStr for ContentEncoding {
    type Err = DomainError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "" | "base64" => Ok(ContentEncoding::Base64),
            "binary" | "raw" => Ok(ContentEncoding::Binary),
            "hex" => Ok(ContentEncoding::Hex),
            other => Err(DomainError::validation(format!(
                "unsupported content encoding `{other}`"
            ))),
        }
    }
}

/// A stored cache entry: one hash directory holding exactly one payload file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CacheEntry {
    pub hash: ContentHash,
    /// Payload file name, including extension.
    pub name: String,
    /// Extension of `name` without the leading dot; empty when absent.
    pub ext: String,
    /// Hash directory.
    pub dir: PathBuf,
    /// Full path of the payload file.
    pub path: PathBuf,
    pub size_bytes: u64,
    #[serde(with = "time::serde::rfc3339")]
    pub modified_at: OffsetDateTime,
}

impl CacheEntry {
    /// MIME type guessed from the payload extension.
    pub fn content_type(&self) -> String {
        mime_guess::from_path(Path::new(&self.name))
            .first_or_octet_stream()
            .essence_str()
            .to_string()
    }
}

/// Extension of a file name without the leading dot, or an empty string.
pub fn extension_of(name: &str) -> String {
    Path::new(name)
        .extension()
        .and_then(|ext| ext.to_str())
        .unwrap_or_default()
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn digest_is_lowercase_hex_of_expected_length() {
        let hash = ContentHash::digest(b"hello");
        assert_eq!(hash.as_str().len(), CONTENT_HASH_LEN);
        assert_eq!(
            hash.as_str(),
            "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824"
        );
    }

    #[test]
    fn parse_normalises_case_and_rejects_bad_input() {
        let upper = "2CF24DBA5FB0A30E26E83B2AC5B9E29E1B161E5C1FA7425E73043362938B9824";
        let parsed: ContentHash = upper.parse().expect("valid hash");
        assert_eq!(parsed, ContentHash::digest(b"hello"));

        assert!("".parse::<ContentHash>().is_err());
        assert!("abc".parse::<ContentHash>().is_err());
        assert!("../etc/passwd".parse::<ContentHash>().is_err());
        let wrong_alphabet = "z".repeat(CONTENT_HASH_LEN);
        assert!(wrong_alphabet.parse::<ContentHash>().is_err());
    }

    #[test]
    fn encodings_decode_payloads() {
        assert_eq!(
            ContentEncoding::Base64.decode(b"aGVsbG8=").expect("base64"),
            b"hello"
        );
        assert_eq!(
            ContentEncoding::Hex.decode(b"68656c6c6f").expect("hex"),
            b"hello"
        );
        assert_eq!(
            ContentEncoding::Binary.decode(b"hello").expect("binary"),
            b"hello"
        );
        assert!(ContentEncoding::Hex.decode(b"not hex").is_err());
    }

    #[test]
    fn unsupported_encoding_is_a_validation_error() {
        assert_eq!("RAW".parse::<ContentEncoding>(), Ok(ContentEncoding::Binary));
        assert!(matches!(
            "utf16".parse::<ContentEncoding>(),
            Err(DomainError::Validation { .. })
        ));
    }

    #[test]
    fn extension_of_strips_dot() {
        assert_eq!(extension_of("report.docx"), "docx");
        assert_eq!(extension_of("archive.tar.gz"), "gz");
        assert_eq!(extension_of("README"), "");
    }
}
