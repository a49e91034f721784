//! keg - a declarative package build pipeline
//!
//! # Overview
//!
//! keg turns TOML build descriptors into installed packages. A
//! descriptor declares identity, provenance, dependencies and per-stage
//! commands; keg validates it, resolves a dependency-ordered install
//! plan, and drives each package through a staged pipeline:
//! fetch → verify → unpack → configure → build → install → test.
//! A separate livecheck probe reports upstream staleness without ever
//! touching the install path.
//!
//! # Architecture
//!
//! - **Descriptors are pure data**: construction validates everything,
//!   execution never mutates them. Upgrading a package means a new
//!   descriptor, never an edit in place.
//! - **Seams are traits**: fetching (`io::fetch::Fetch`) and command
//!   execution (`io::command::CommandRunner`) are injected, so the whole
//!   pipeline runs under test without network or processes.
//! - **Newtypes**: `PackageName`, `Version` and `Checksum` keep
//!   identifiers type-safe and validated.
//!
//! # Directory Layout
//!
//! ```text
//! ~/.keg/
//! ├── store/      # Installed packages by name/version_revision
//! ├── tmp/        # Per-build staging dirs (same volume as store)
//! └── logs/       # Build logs
//! ```

pub mod cmd;
pub mod core;
pub mod io;
pub mod ops;
pub mod types;
pub mod ui;

use std::path::{Path, PathBuf};

use types::{PackageName, Version};

/// User agent for upstream requests.
pub const USER_AGENT: &str = concat!("keg/", env!("CARGO_PKG_VERSION"));

/// Filesystem layout rooted at the keg home directory.
///
/// The home is `$KEG_HOME` or `~/.keg`; tests point it at a temp dir.
/// Staging lives under the same root as the store so a finished build
/// can be moved into place with a rename.
#[derive(Debug, Clone)]
pub struct Layout {
    root: PathBuf,
}

impl Layout {
    /// Layout rooted at an explicit directory.
    pub fn at(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Resolve the default home: `$KEG_HOME`, else `~/.keg`.
    pub fn discover() -> Option<Self> {
        if let Ok(home) = std::env::var("KEG_HOME") {
            return Some(Self::at(home));
        }
        dirs::home_dir().map(|h| Self::at(h.join(".keg")))
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn store_dir(&self) -> PathBuf {
        self.root.join("store")
    }

    /// Install target for one build identity. Embeds the revision so
    /// two revisions of one version never share a path.
    pub fn store_path(&self, name: &PackageName, version: &Version, revision: u32) -> PathBuf {
        self.store_dir()
            .join(name.as_str())
            .join(format!("{version}_{revision}"))
    }

    /// Staging area, guaranteed same volume as the store.
    pub fn tmp_dir(&self) -> PathBuf {
        self.root.join("tmp")
    }

    pub fn log_dir(&self) -> PathBuf {
        self.root.join("logs")
    }

    /// Build log path for one package build.
    pub fn build_log_path(&self, name: &PackageName, version: &Version) -> PathBuf {
        let timestamp = chrono::Utc::now().format("%Y%m%d-%H%M%S");
        self.log_dir()
            .join(format!("build-{name}-{version}-{timestamp}.log"))
    }
}

/// Extract the filename from a URL.
///
/// # Example
///
/// ```
/// use keg::filename_from_url;
///
/// assert_eq!(filename_from_url("https://example.com/path/pkg-1.0.tar.gz"), "pkg-1.0.tar.gz");
/// assert_eq!(filename_from_url(""), "");
/// ```
pub fn filename_from_url(url: &str) -> &str {
    url.split('/').next_back().unwrap_or("")
}
