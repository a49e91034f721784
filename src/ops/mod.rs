pub mod error;
pub mod livecheck;
pub mod orchestrator;
pub mod pipeline;

pub use error::{InstallError, StageError};
pub use orchestrator::{BatchReport, DescriptorSet, Orchestrator};
pub use pipeline::{Pipeline, PipelineContext, PipelineReport, Stage};
