mod checkpoint;
mod error;
mod observer;
mod report;
mod run;
mod stage;
mod stages;
mod store;
mod subset;

pub use checkpoint::CheckpointManager;
pub use error::PipelineError;
pub use observer::{CancellationToken, TracingObserver};
pub use run::{Pipeline, PipelineOptions, REPORT_FILE_NAME, RunRequest};
pub use stage::{Stage, StageSet, all_stages};
pub use store::ResultStore;
pub use subset::{SmokeTest, declared_filter_categories};
