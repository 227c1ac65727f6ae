pub mod manager;
pub mod runner;
pub mod state;
pub mod workload;

pub use manager::JobManager;
pub use runner::JobRunner;
pub use state::{JobState, JobStatus, Mode};
pub use workload::Workload;
