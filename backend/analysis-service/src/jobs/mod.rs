//! Batch jobs

pub mod batch;

pub use batch::{BatchItem, BatchJob, BatchSettings, BatchStats};
