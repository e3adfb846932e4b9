//! Sandbox ID and content digest validation.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::{ImgvolError, ImgvolResult};

/// A validated pod sandbox ID.
///
/// Sandbox IDs must:
/// - Be 1-128 characters long
/// - Contain only alphanumeric characters, hyphens, underscores and dots
/// - Start with an alphanumeric character
///
/// These rules keep a sandbox ID usable as a single path component.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct SandboxId(String);

impl SandboxId {
    /// Maximum length of a sandbox ID.
    pub const MAX_LENGTH: usize = 128;

    /// Create a new sandbox ID, validating the format.
    ///
    /// # Errors
    ///
    /// Returns an error if the ID format is invalid.
    pub fn new(id: impl Into<String>) -> ImgvolResult<Self> {
        let id = id.into();
        Self::validate(&id)?;
        Ok(Self(id))
    }

    /// Get the sandbox ID as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    fn validate(id: &str) -> ImgvolResult<()> {
        let invalid = || ImgvolError::InvalidSandboxId { id: id.to_string() };

        if id.is_empty() || id.len() > Self::MAX_LENGTH {
            return Err(invalid());
        }

        if !id.starts_with(|c: char| c.is_ascii_alphanumeric()) {
            return Err(invalid());
        }

        if !id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
        {
            return Err(invalid());
        }

        Ok(())
    }
}

impl fmt::Display for SandboxId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for SandboxId {
    type Err = ImgvolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl TryFrom<String> for SandboxId {
    type Error = ImgvolError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<SandboxId> for String {
    fn from(id: SandboxId) -> Self {
        id.0
    }
}

impl AsRef<str> for SandboxId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// A content-addressable digest (e.g., sha256:abc123...).
///
/// The algorithm is lowercase alphanumeric and the hash is lowercase hex, so
/// the hash is always safe to use as a path component.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Digest {
    algorithm: String,
    hash: String,
}

impl Digest {
    /// The only algorithm imgvol produces.
    pub const SHA256: &'static str = "sha256";

    /// Create a new digest, validating both parts.
    ///
    /// # Errors
    ///
    /// Returns an error if the algorithm or hash is malformed.
    pub fn new(algorithm: impl Into<String>, hash: impl Into<String>) -> ImgvolResult<Self> {
        let digest = Self {
            algorithm: algorithm.into(),
            hash: hash.into(),
        };
        digest.validate()?;
        Ok(digest)
    }

    /// Create a SHA-256 digest from its hex encoding.
    ///
    /// # Errors
    ///
    /// Returns an error if `hash` is not 64 lowercase hex characters.
    pub fn sha256(hash: impl Into<String>) -> ImgvolResult<Self> {
        Self::new(Self::SHA256, hash)
    }

    /// Create a SHA-256 digest from raw hash bytes.
    #[must_use]
    pub fn from_sha256_bytes(bytes: &[u8]) -> Self {
        Self {
            algorithm: Self::SHA256.to_string(),
            hash: hex::encode(bytes),
        }
    }

    /// The algorithm (e.g., "sha256").
    #[must_use]
    pub fn algorithm(&self) -> &str {
        &self.algorithm
    }

    /// The hex-encoded hash.
    #[must_use]
    pub fn hex(&self) -> &str {
        &self.hash
    }

    fn validate(&self) -> ImgvolResult<()> {
        let invalid = || ImgvolError::InvalidDigest {
            digest: format!("{}:{}", self.algorithm, self.hash),
        };

        if self.algorithm.is_empty()
            || !self
                .algorithm
                .chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit())
        {
            return Err(invalid());
        }

        if self.hash.is_empty()
            || !self
                .hash
                .chars()
                .all(|c| c.is_ascii_digit() || ('a'..='f').contains(&c))
        {
            return Err(invalid());
        }

        if self.algorithm == Self::SHA256 && hex::decode(&self.hash).map(|b| b.len()) != Ok(32) {
            return Err(invalid());
        }

        Ok(())
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.algorithm, self.hash)
    }
}

impl FromStr for Digest {
    type Err = ImgvolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (algorithm, hash) = s.split_once(':').ok_or_else(|| ImgvolError::InvalidDigest {
            digest: s.to_string(),
        })?;
        Self::new(algorithm, hash)
    }
}

impl TryFrom<String> for Digest {
    type Error = ImgvolError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Digest> for String {
    fn from(digest: Digest) -> Self {
        digest.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const HEX: &str = "9f86d081884c7d659a2feaa0c55ad015a3bf4f1b2b0b822cd15d6c15b0f00a08";

    #[test]
    fn valid_sandbox_ids() {
        assert!(SandboxId::new("abc123").is_ok());
        assert!(SandboxId::new("my-sandbox").is_ok());
        assert!(SandboxId::new("my_sandbox.1").is_ok());
        assert!(SandboxId::new("a".repeat(128)).is_ok());
    }

    #[test]
    fn invalid_sandbox_ids() {
        assert!(SandboxId::new("").is_err());
        assert!(SandboxId::new("-invalid").is_err());
        assert!(SandboxId::new(".hidden").is_err());
        assert!(SandboxId::new("a/b").is_err());
        assert!(SandboxId::new("..").is_err());
        assert!(SandboxId::new("a".repeat(129)).is_err());
    }

    #[test]
    fn digest_parsing() {
        let digest: Digest = format!("sha256:{HEX}").parse().unwrap();
        assert_eq!(digest.algorithm(), "sha256");
        assert_eq!(digest.hex(), HEX);
        assert_eq!(digest.to_string(), format!("sha256:{HEX}"));
    }

    #[test]
    fn invalid_digests() {
        assert!("sha256".parse::<Digest>().is_err());
        assert!("sha256:abc".parse::<Digest>().is_err());
        assert!(format!("sha256:{}", HEX.to_uppercase()).parse::<Digest>().is_err());
        assert!("sha256:../../etc".parse::<Digest>().is_err());
        assert!(format!("SHA256:{HEX}").parse::<Digest>().is_err());
    }

    #[test]
    fn digest_serde_roundtrip_is_a_string() {
        let digest = Digest::sha256(HEX).unwrap();
        let json = serde_json::to_string(&digest).unwrap();
        assert_eq!(json, format!("\"sha256:{HEX}\""));
        assert!(serde_json::from_str::<Digest>("\"sha256:nothex\"").is_err());
    }
}
