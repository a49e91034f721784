//! Declared archive checksums: an algorithm tag plus a hex digest.

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ChecksumError {
    #[error("unsupported checksum algorithm '{0}'")]
    UnsupportedAlgorithm(String),

    #[error("malformed checksum '{0}': expected '<algorithm>:<hex digest>'")]
    Malformed(String),

    #[error("invalid {algorithm} digest: expected {expected} hex characters, got {got}")]
    BadDigest {
        algorithm: Algorithm,
        expected: usize,
        got: usize,
    },
}

/// Digest algorithms a descriptor may declare.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Algorithm {
    Sha256,
    Blake3,
}

impl Algorithm {
    pub fn as_str(&self) -> &'static str {
        match self {
            Algorithm::Sha256 => "sha256",
            Algorithm::Blake3 => "blake3",
        }
    }

    /// Hex digest length for this algorithm.
    pub fn digest_len(&self) -> usize {
        match self {
            Algorithm::Sha256 | Algorithm::Blake3 => 64,
        }
    }
}

impl std::str::FromStr for Algorithm {
    type Err = ChecksumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "sha256" => Ok(Algorithm::Sha256),
            "blake3" => Ok(Algorithm::Blake3),
            other => Err(ChecksumError::UnsupportedAlgorithm(other.to_string())),
        }
    }
}

impl std::fmt::Display for Algorithm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A declared checksum, parsed from `"<algorithm>:<hex digest>"`.
///
/// The digest is validated (length and hex alphabet) and lowercased at
/// construction, so every `Checksum` in the system is well-formed. An
/// unknown algorithm tag fails here, long before any fetch is attempted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Checksum {
    algorithm: Algorithm,
    digest: String,
}

impl Checksum {
    /// Parse a `"sha256:963885d8..."` style declaration.
    pub fn parse(s: &str) -> Result<Self, ChecksumError> {
        let (tag, hex) = s
            .split_once(':')
            .ok_or_else(|| ChecksumError::Malformed(s.to_string()))?;

        let algorithm: Algorithm = tag.parse()?;

        if hex.len() != algorithm.digest_len() {
            return Err(ChecksumError::BadDigest {
                algorithm,
                expected: algorithm.digest_len(),
                got: hex.len(),
            });
        }
        if !hex.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(ChecksumError::Malformed(s.to_string()));
        }

        Ok(Self {
            algorithm,
            digest: hex.to_lowercase(),
        })
    }

    pub fn algorithm(&self) -> Algorithm {
        self.algorithm
    }

    /// The declared digest, lowercase hex.
    pub fn digest(&self) -> &str {
        &self.digest
    }
}

impl std::fmt::Display for Checksum {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.algorithm, self.digest)
    }
}
