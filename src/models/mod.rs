pub mod requests;
pub mod results;

pub use requests::{InstallRequest, UninstallRequest};
pub use results::{
    ExistingInstallation, MigrationOutcome, PipelineReport, ProgressEmitter, ProgressPayload,
    StepResult,
};
