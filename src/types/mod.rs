pub mod checksum;
pub mod package;

pub use checksum::{Algorithm, Checksum, ChecksumError};
pub use package::{PackageName, Version};
