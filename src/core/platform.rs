//! Platform facts and conditional build effects.
//!
//! A descriptor can vary its configure arguments and environment by
//! platform. The facts are an explicit input supplied by the caller, so
//! the pipeline stays pure with respect to its inputs and every platform
//! combination is testable without running on real hardware.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Os {
    Linux,
    Macos,
}

impl Os {
    pub const ALL: [Os; 2] = [Os::Linux, Os::Macos];

    pub fn as_str(&self) -> &'static str {
        match self {
            Os::Linux => "linux",
            Os::Macos => "macos",
        }
    }
}

impl std::fmt::Display for Os {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Arch {
    #[serde(rename = "x86_64")]
    X86_64,
    Aarch64,
}

impl Arch {
    pub const ALL: [Arch; 2] = [Arch::X86_64, Arch::Aarch64];

    pub fn as_str(&self) -> &'static str {
        match self {
            Arch::X86_64 => "x86_64",
            Arch::Aarch64 => "aarch64",
        }
    }
}

impl std::fmt::Display for Arch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The platform a pipeline run targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlatformFacts {
    pub os: Os,
    pub arch: Arch,
}

impl PlatformFacts {
    pub fn new(os: Os, arch: Arch) -> Self {
        Self { os, arch }
    }

    /// Detect the host platform. Called once at the CLI boundary; the
    /// pipeline itself only ever sees the resulting value.
    pub fn host() -> Self {
        let os = if cfg!(target_os = "macos") {
            Os::Macos
        } else {
            Os::Linux
        };
        let arch = if cfg!(target_arch = "aarch64") {
            Arch::Aarch64
        } else {
            Arch::X86_64
        };
        Self { os, arch }
    }
}

impl std::fmt::Display for PlatformFacts {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.os, self.arch)
    }
}

/// A predicate over platform facts. Omitted fields are wildcards, so an
/// empty predicate matches every platform (a catch-all arm).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Predicate {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub os: Option<Os>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub arch: Option<Arch>,
}

impl Predicate {
    pub fn matches(&self, facts: PlatformFacts) -> bool {
        self.os.is_none_or(|os| os == facts.os) && self.arch.is_none_or(|a| a == facts.arch)
    }
}

impl std::fmt::Display for Predicate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match (self.os, self.arch) {
            (Some(os), Some(arch)) => write!(f, "{os}/{arch}"),
            (Some(os), None) => write!(f, "{os}/*"),
            (None, Some(arch)) => write!(f, "*/{arch}"),
            (None, None) => write!(f, "*/*"),
        }
    }
}

/// One arm of a conditional group: a predicate and the effect applied
/// when it is selected.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConditionalCase {
    pub when: Predicate,
    /// Arguments appended to each command of the configure stage.
    #[serde(default)]
    pub configure_args: Vec<String>,
    /// Environment variables applied to configure and later stages.
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

/// A group of mutually exclusive platform cases.
///
/// Validation proves that over the full os × arch matrix every platform
/// selects exactly one case, so selection at build time can never come up
/// empty or ambiguous for a descriptor that passed construction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConditionalGroup {
    /// Label used in diagnostics.
    #[serde(default)]
    pub name: String,
    #[serde(rename = "case")]
    pub cases: Vec<ConditionalCase>,
}

impl ConditionalGroup {
    fn label(&self) -> &str {
        if self.name.is_empty() {
            "<unnamed>"
        } else {
            &self.name
        }
    }

    /// Check exhaustiveness and mutual exclusivity over every platform
    /// combination. Returns one message per violated combination.
    pub fn violations(&self) -> Vec<String> {
        let mut out = Vec::new();
        if self.cases.is_empty() {
            out.push(format!("conditional group '{}' has no cases", self.label()));
            return out;
        }
        for os in Os::ALL {
            for arch in Arch::ALL {
                let facts = PlatformFacts::new(os, arch);
                let matching = self.cases.iter().filter(|c| c.when.matches(facts)).count();
                match matching {
                    0 => out.push(format!(
                        "conditional group '{}' selects no case on {facts}",
                        self.label()
                    )),
                    1 => {}
                    n => out.push(format!(
                        "conditional group '{}' selects {n} cases on {facts}",
                        self.label()
                    )),
                }
            }
        }
        out
    }

    /// Select the single case matching `facts`.
    ///
    /// Descriptors are validated at construction, so this cannot fail for
    /// a descriptor that was actually constructed; the error path is kept
    /// so a broken invariant surfaces as a hard stage failure instead of
    /// a silent skip.
    pub fn select(&self, facts: PlatformFacts) -> Result<&ConditionalCase, String> {
        let mut matching = self.cases.iter().filter(|c| c.when.matches(facts));
        match (matching.next(), matching.next()) {
            (Some(case), None) => Ok(case),
            (None, _) => Err(format!(
                "conditional group '{}' selects no case on {facts}",
                self.label()
            )),
            (Some(_), Some(_)) => Err(format!(
                "conditional group '{}' selects multiple cases on {facts}",
                self.label()
            )),
        }
    }
}

/// The combined effect of every conditional group, resolved once at entry
/// to the configure stage and fixed for the remainder of the run.
#[derive(Debug, Clone, Default)]
pub struct ResolvedEffects {
    pub configure_args: Vec<String>,
    pub env: Vec<(String, String)>,
}

/// Resolve all groups against the given facts.
pub fn resolve_effects(
    groups: &[ConditionalGroup],
    facts: PlatformFacts,
) -> Result<ResolvedEffects, String> {
    let mut effects = ResolvedEffects::default();
    for group in groups {
        let case = group.select(facts)?;
        effects
            .configure_args
            .extend(case.configure_args.iter().cloned());
        effects
            .env
            .extend(case.env.iter().map(|(k, v)| (k.clone(), v.clone())));
    }
    Ok(effects)
}
