//! Livecheck: read-only probe for the latest upstream version.
//!
//! Fetches the descriptor's poll URL, applies the extraction pattern to
//! the text, and returns the highest version-like token. One
//! invocation, one answer or one failure; installs in progress are
//! never touched and never blocked.

use thiserror::Error;

use crate::core::descriptor::LivecheckSpec;
use crate::core::version;
use crate::io::fetch::Fetch;
use crate::ops::error::exit_code;
use crate::types::Version;

#[derive(Error, Debug)]
pub enum LivecheckError {
    #[error("upstream unreachable: {0}")]
    Unreachable(String),

    #[error("no version found at {url} with pattern '{pattern}'")]
    NoVersionFound { url: String, pattern: String },
}

impl LivecheckError {
    pub fn exit_code(&self) -> u8 {
        match self {
            LivecheckError::Unreachable(_) => exit_code::LIVECHECK_UNREACHABLE,
            LivecheckError::NoVersionFound { .. } => exit_code::NO_VERSION_FOUND,
        }
    }
}

/// Poll upstream once and return the highest version token found.
pub async fn check(spec: &LivecheckSpec, fetcher: &dyn Fetch) -> Result<Version, LivecheckError> {
    let bytes = fetcher
        .fetch(&spec.url)
        .await
        .map_err(|e| LivecheckError::Unreachable(e.to_string()))?;
    let text = String::from_utf8_lossy(&bytes);

    extract_latest(&text, &spec.pattern).ok_or_else(|| LivecheckError::NoVersionFound {
        url: spec.url.clone(),
        pattern: spec.pattern.clone(),
    })
}

/// Pure extraction: apply the pattern to `text` and pick the highest
/// token. The first capture group is the version; a pattern without
/// groups uses the whole match.
pub fn extract_latest(text: &str, pattern: &str) -> Option<Version> {
    // Patterns are validated at descriptor construction.
    let re = regex::Regex::new(pattern).ok()?;

    re.captures_iter(text)
        .filter_map(|caps| {
            caps.get(1)
                .or_else(|| caps.get(0))
                .map(|m| m.as_str().to_string())
        })
        .max_by(|a, b| version::compare(a, b))
        .map(|v| Version::new(&v))
}
