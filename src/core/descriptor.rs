//! TOML build descriptors.
//!
//! A descriptor is the complete, immutable recipe for one package build:
//! identity, provenance, dependencies, per-stage commands, and the
//! optional post-install test and livecheck blocks. Construction
//! validates the whole document and reports every violated rule at once,
//! so a broken package definition can be fixed in one pass.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::core::platform::ConditionalGroup;
use crate::types::{Checksum, ChecksumError, PackageName, Version};

#[derive(Error, Debug)]
pub enum DescriptorError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Parse error: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("{package}: unsupported checksum algorithm '{algorithm}'")]
    UnsupportedAlgorithm { package: String, algorithm: String },

    #[error("invalid descriptor '{package}': {}", .violations.join("; "))]
    Invalid {
        package: String,
        violations: Vec<String>,
    },
}

/// Package identity and informational metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PackageInfo {
    pub name: PackageName,
    pub version: Version,
    /// Forces a distinct build identity without a version bump. Part of
    /// the uniqueness key `(name, version, revision)`.
    #[serde(default)]
    pub revision: u32,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub homepage: String,
    #[serde(default)]
    pub license: String,
}

/// Where the source archive comes from and how to verify it.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Source {
    #[serde(default)]
    pub url: String,
    /// Fallback locations, tried in order after `url`.
    #[serde(default)]
    pub mirrors: Vec<String>,
    /// `"<algorithm>:<hex digest>"`, required whenever `url` is set.
    #[serde(default)]
    pub checksum: String,
    /// Leading path components stripped during default archive
    /// extraction (the usual single top-level directory).
    #[serde(default = "default_strip")]
    pub strip_components: u32,
}

fn default_strip() -> u32 {
    1
}

/// Dependency kind: when the dependency must be present.
///
/// Both kinds must be installed before their dependent; the distinction
/// is informational for resolution purposes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DepKind {
    Build,
    Runtime,
}

impl std::fmt::Display for DepKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DepKind::Build => f.write_str("build"),
            DepKind::Runtime => f.write_str("runtime"),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Dependencies {
    #[serde(default)]
    pub runtime: Vec<PackageName>,
    #[serde(default)]
    pub build: Vec<PackageName>,
}

/// One external command: a program and its argument list.
///
/// Arguments and environment values may reference `${prefix}`, `${jobs}`
/// and `${version}`; the pipeline substitutes them before execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandSpec {
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
}

impl std::fmt::Display for CommandSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.program)?;
        for arg in &self.args {
            write!(f, " {arg}")?;
        }
        Ok(())
    }
}

/// Per-stage command sequences. An empty `unpack` means the fetched
/// archive is extracted with the built-in extractor.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Stages {
    #[serde(default)]
    pub unpack: Vec<CommandSpec>,
    #[serde(default)]
    pub configure: Vec<CommandSpec>,
    #[serde(default)]
    pub build: Vec<CommandSpec>,
    #[serde(default)]
    pub install: Vec<CommandSpec>,
}

/// Upstream version probe: poll a URL, extract version tokens.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LivecheckSpec {
    pub url: String,
    /// Regex applied to the fetched text. The first capture group (or
    /// the whole match when there is none) is the version token.
    pub pattern: String,
}

/// Post-install hints, printed and never executed.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Hints {
    #[serde(default)]
    pub post_install: String,
}

/// A complete package build descriptor, immutable after construction.
#[derive(Debug, Clone, Deserialize)]
pub struct Descriptor {
    package: PackageInfo,
    #[serde(default)]
    source: Source,
    #[serde(default)]
    dependencies: Dependencies,
    #[serde(default)]
    conditionals: Vec<ConditionalGroup>,
    #[serde(default)]
    stages: Stages,
    test: Option<CommandSpec>,
    livecheck: Option<LivecheckSpec>,
    #[serde(default)]
    hints: Hints,
    #[serde(skip)]
    checksum: Option<Checksum>,
}

impl Descriptor {
    /// Parse and validate a descriptor from a TOML file.
    pub fn from_file(path: &Path) -> Result<Self, DescriptorError> {
        let content = fs::read_to_string(path)?;
        Self::from_str(&content)
    }

    /// Parse and validate a descriptor from a TOML string.
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(content: &str) -> Result<Self, DescriptorError> {
        let mut descriptor: Descriptor = toml::from_str(content)?;
        descriptor.validate()?;
        Ok(descriptor)
    }

    /// Validate every construction rule, collecting all violations.
    fn validate(&mut self) -> Result<(), DescriptorError> {
        let mut violations = Vec::new();
        let mut unsupported: Option<String> = None;

        if self.package.name.is_empty() {
            violations.push("package.name must not be empty".to_string());
        }
        if self.package.version.is_empty() {
            violations.push("package.version must not be empty".to_string());
        }

        if !self.source.url.is_empty() && self.source.checksum.is_empty() {
            violations.push("source.checksum is required when source.url is set".to_string());
        }
        if !self.source.checksum.is_empty() {
            match Checksum::parse(&self.source.checksum) {
                Ok(checksum) => self.checksum = Some(checksum),
                Err(ChecksumError::UnsupportedAlgorithm(tag)) => unsupported = Some(tag),
                Err(e) => violations.push(e.to_string()),
            }
        }

        for dep in self
            .dependencies
            .runtime
            .iter()
            .chain(&self.dependencies.build)
        {
            if *dep == self.package.name {
                violations.push(format!("package depends on itself ('{dep}')"));
            }
        }

        for group in &self.conditionals {
            violations.extend(group.violations());
        }

        for (stage, commands) in [
            ("unpack", &self.stages.unpack),
            ("configure", &self.stages.configure),
            ("build", &self.stages.build),
            ("install", &self.stages.install),
        ] {
            for (i, command) in commands.iter().enumerate() {
                if command.program.is_empty() {
                    violations.push(format!("stages.{stage}[{i}] has an empty program"));
                }
            }
        }
        if let Some(test) = &self.test {
            if test.program.is_empty() {
                violations.push("test has an empty program".to_string());
            }
        }

        if let Some(livecheck) = &self.livecheck {
            if livecheck.url.is_empty() {
                violations.push("livecheck.url must not be empty".to_string());
            }
            if let Err(e) = regex::Regex::new(&livecheck.pattern) {
                violations.push(format!("livecheck.pattern does not compile: {e}"));
            }
        }

        if let Some(algorithm) = unsupported {
            return Err(DescriptorError::UnsupportedAlgorithm {
                package: self.package.name.to_string(),
                algorithm,
            });
        }
        if !violations.is_empty() {
            return Err(DescriptorError::Invalid {
                package: self.package.name.to_string(),
                violations,
            });
        }
        Ok(())
    }

    pub fn name(&self) -> &PackageName {
        &self.package.name
    }

    pub fn version(&self) -> &Version {
        &self.package.version
    }

    pub fn revision(&self) -> u32 {
        self.package.revision
    }

    pub fn description(&self) -> &str {
        &self.package.description
    }

    pub fn homepage(&self) -> &str {
        &self.package.homepage
    }

    pub fn license(&self) -> &str {
        &self.package.license
    }

    pub fn source(&self) -> &Source {
        &self.source
    }

    /// The parsed checksum; present whenever `source.url` is.
    pub fn checksum(&self) -> Option<&Checksum> {
        self.checksum.as_ref()
    }

    /// All fetch candidates: the primary URL, then each mirror in order.
    pub fn fetch_candidates(&self) -> Vec<&str> {
        if self.source.url.is_empty() {
            return Vec::new();
        }
        std::iter::once(self.source.url.as_str())
            .chain(self.source.mirrors.iter().map(String::as_str))
            .collect()
    }

    /// The `(name, kind)` dependency set, sorted and deduplicated.
    pub fn dependency_set(&self) -> Vec<(PackageName, DepKind)> {
        let mut set: BTreeMap<PackageName, DepKind> = BTreeMap::new();
        for dep in &self.dependencies.build {
            set.insert(dep.clone(), DepKind::Build);
        }
        // Runtime wins when a name is declared under both kinds.
        for dep in &self.dependencies.runtime {
            set.insert(dep.clone(), DepKind::Runtime);
        }
        set.into_iter().collect()
    }

    /// Every dependency name in ascending order, kind-agnostic.
    pub fn dependency_names(&self) -> Vec<PackageName> {
        self.dependency_set().into_iter().map(|(n, _)| n).collect()
    }

    pub fn conditionals(&self) -> &[ConditionalGroup] {
        &self.conditionals
    }

    pub fn stages(&self) -> &Stages {
        &self.stages
    }

    pub fn test(&self) -> Option<&CommandSpec> {
        self.test.as_ref()
    }

    pub fn livecheck(&self) -> Option<&LivecheckSpec> {
        self.livecheck.as_ref()
    }

    pub fn hints(&self) -> &Hints {
        &self.hints
    }

    /// The build identity `name/version_revision` used for store paths
    /// and diagnostics. Bumping the revision alone yields a distinct id.
    pub fn build_id(&self) -> String {
        format!(
            "{}/{}_{}",
            self.package.name, self.package.version, self.package.revision
        )
    }
}
