//! Time-based job scheduling

mod jobs;
mod schedule;

pub use jobs::{JobHandler, JobKey, JobScheduler, JobStatus};
pub use schedule::Schedule;
