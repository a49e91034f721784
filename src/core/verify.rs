//! Archive integrity verification.
//!
//! Recomputes the digest of fetched bytes under the declared algorithm
//! and compares against the declared digest. The answer is all or
//! nothing; a mismatch is always fatal for that descriptor.

use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::types::{Algorithm, Checksum};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum VerifyError {
    #[error("integrity mismatch ({algorithm}): expected {expected}, got {actual}")]
    IntegrityMismatch {
        algorithm: Algorithm,
        expected: String,
        actual: String,
    },
}

/// Verify `data` against a declared checksum.
pub fn verify(data: &[u8], checksum: &Checksum) -> Result<(), VerifyError> {
    let actual = compute(checksum.algorithm(), data);
    if digest_eq(checksum.digest().as_bytes(), actual.as_bytes()) {
        Ok(())
    } else {
        Err(VerifyError::IntegrityMismatch {
            algorithm: checksum.algorithm(),
            expected: checksum.digest().to_string(),
            actual,
        })
    }
}

/// Compute the lowercase hex digest of `data` under `algorithm`.
pub fn compute(algorithm: Algorithm, data: &[u8]) -> String {
    match algorithm {
        Algorithm::Sha256 => {
            let mut hasher = Sha256::new();
            hasher.update(data);
            hex::encode(hasher.finalize())
        }
        Algorithm::Blake3 => blake3::hash(data).to_hex().to_string(),
    }
}

/// Length-checked comparison that always inspects every byte of
/// equal-length inputs, so the comparison shape does not depend on where
/// the first difference is.
fn digest_eq(expected: &[u8], actual: &[u8]) -> bool {
    if expected.len() != actual.len() {
        return false;
    }
    expected
        .iter()
        .zip(actual)
        .fold(0u8, |acc, (a, b)| acc | (a ^ b))
        == 0
}
