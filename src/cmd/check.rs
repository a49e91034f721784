//! `keg check` - validate a descriptor file.

use std::path::Path;

use crate::core::descriptor::{Descriptor, DescriptorError};
use crate::ops::error::exit_code;
use crate::ui::Reporter;

pub fn check(reporter: &dyn Reporter, path: &Path) -> u8 {
    match Descriptor::from_file(path) {
        Ok(descriptor) => {
            reporter.info(&format!(
                "ok: {} {} (revision {})",
                descriptor.name(),
                descriptor.version(),
                descriptor.revision()
            ));
            exit_code::SUCCESS
        }
        Err(DescriptorError::Invalid {
            package,
            violations,
        }) => {
            reporter.error(&format!("invalid descriptor '{package}':"));
            for violation in &violations {
                reporter.error(&format!("  - {violation}"));
            }
            exit_code::INVALID_DESCRIPTOR
        }
        Err(e @ DescriptorError::UnsupportedAlgorithm { .. }) => {
            reporter.error(&e.to_string());
            exit_code::UNSUPPORTED_ALGORITHM
        }
        Err(e) => {
            reporter.error(&e.to_string());
            exit_code::INVALID_DESCRIPTOR
        }
    }
}
