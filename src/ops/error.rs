//! Domain errors for install operations, and their exit codes.
//!
//! Batch-level errors (`InstallError`) are raised before any side effect
//! and abort the whole run; stage errors (`StageError`) are scoped to a
//! single descriptor's pipeline.

use thiserror::Error;

use crate::core::descriptor::DescriptorError;
use crate::core::resolver::ResolveError;
use crate::core::verify::VerifyError;
use crate::io::extract::ExtractError;
use crate::types::PackageName;

/// A failure inside one descriptor's pipeline. Always paired with the
/// stage it occurred in (see `ops::pipeline::PipelineStatus::Failed`).
#[derive(Error, Debug)]
pub enum StageError {
    #[error("all sources exhausted: [{}]", .attempts.join(", "))]
    FetchExhausted { attempts: Vec<String> },

    #[error(transparent)]
    Integrity(#[from] VerifyError),

    #[error(transparent)]
    Extract(#[from] ExtractError),

    #[error("command '{command}' failed with status {}: {stderr}", render_status(.status))]
    Command {
        command: String,
        status: Option<i32>,
        stderr: String,
    },

    #[error("test '{command}' failed with status {}: {stderr}", render_status(.status))]
    TestFailed {
        command: String,
        status: Option<i32>,
        stderr: String,
    },

    #[error("{0}")]
    Conditional(String),

    #[error("dependency '{dependency}' failed")]
    DependencyFailed { dependency: PackageName },

    #[error("cancelled")]
    Cancelled,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

fn render_status(status: &Option<i32>) -> String {
    match status {
        Some(code) => code.to_string(),
        None => "signal".to_string(),
    }
}

/// Batch-level failures: a structurally broken request, detected before
/// any pipeline runs.
#[derive(Error, Debug)]
pub enum InstallError {
    #[error(transparent)]
    Descriptor(#[from] DescriptorError),

    #[error(transparent)]
    Resolve(#[from] ResolveError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Distinct process exit codes, one per failure kind.
pub mod exit_code {
    pub const SUCCESS: u8 = 0;
    pub const GENERIC: u8 = 1;
    pub const INVALID_DESCRIPTOR: u8 = 2;
    pub const UNSUPPORTED_ALGORITHM: u8 = 3;
    pub const UNRESOLVED_DEPENDENCY: u8 = 4;
    pub const DEPENDENCY_CYCLE: u8 = 5;
    pub const FETCH_EXHAUSTED: u8 = 6;
    pub const INTEGRITY_MISMATCH: u8 = 7;
    pub const COMMAND_FAILED: u8 = 8;
    pub const TEST_FAILED: u8 = 9;
    pub const DEPENDENCY_FAILED: u8 = 10;
    pub const CANCELLED: u8 = 11;
    pub const LIVECHECK_UNREACHABLE: u8 = 12;
    pub const NO_VERSION_FOUND: u8 = 13;
}

impl StageError {
    pub fn exit_code(&self) -> u8 {
        match self {
            StageError::FetchExhausted { .. } => exit_code::FETCH_EXHAUSTED,
            StageError::Integrity(_) => exit_code::INTEGRITY_MISMATCH,
            StageError::Extract(_) | StageError::Command { .. } => exit_code::COMMAND_FAILED,
            StageError::TestFailed { .. } => exit_code::TEST_FAILED,
            StageError::Conditional(_) => exit_code::INVALID_DESCRIPTOR,
            StageError::DependencyFailed { .. } => exit_code::DEPENDENCY_FAILED,
            StageError::Cancelled => exit_code::CANCELLED,
            StageError::Io(_) => exit_code::GENERIC,
        }
    }
}

impl InstallError {
    pub fn exit_code(&self) -> u8 {
        match self {
            InstallError::Descriptor(DescriptorError::UnsupportedAlgorithm { .. }) => {
                exit_code::UNSUPPORTED_ALGORITHM
            }
            InstallError::Descriptor(_) => exit_code::INVALID_DESCRIPTOR,
            InstallError::Resolve(ResolveError::Cycle { .. }) => exit_code::DEPENDENCY_CYCLE,
            InstallError::Resolve(ResolveError::Unresolved { .. }) => {
                exit_code::UNRESOLVED_DEPENDENCY
            }
            InstallError::Io(_) => exit_code::GENERIC,
        }
    }
}
