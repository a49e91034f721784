//! Reporter trait for dependency injection
//!
//! Lets command logic report progress and status without being coupled
//! to a specific output implementation.

use crate::types::{PackageName, Version};

pub trait Reporter: Send + Sync {
    /// A package operation finished successfully.
    fn done(&self, name: &PackageName, version: &Version, detail: &str);

    /// A package operation failed.
    fn failed(&self, name: &PackageName, version: &Version, reason: &str);

    /// Log an informational message.
    fn info(&self, msg: &str);

    /// Log a warning message.
    fn warning(&self, msg: &str);

    /// Log an error message.
    fn error(&self, msg: &str);

    /// Final summary of multiple operations.
    fn summary(&self, count: usize, action: &str, elapsed_secs: f64);
}

/// Plain console output.
#[derive(Debug, Default, Clone, Copy)]
pub struct Console;

impl Reporter for Console {
    fn done(&self, name: &PackageName, version: &Version, detail: &str) {
        println!("  {name} {version} {detail}");
    }

    fn failed(&self, name: &PackageName, version: &Version, reason: &str) {
        eprintln!("  {name} {version} failed: {reason}");
    }

    fn info(&self, msg: &str) {
        println!("{msg}");
    }

    fn warning(&self, msg: &str) {
        eprintln!("warning: {msg}");
    }

    fn error(&self, msg: &str) {
        eprintln!("error: {msg}");
    }

    fn summary(&self, count: usize, action: &str, elapsed_secs: f64) {
        let noun = if count == 1 { "package" } else { "packages" };
        println!("{count} {noun} {action} in {elapsed_secs:.1}s");
    }
}
