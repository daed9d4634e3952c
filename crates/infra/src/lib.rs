//! Infrastructure layer: job store, task queue backends, object store,
//! the worker executor, the submission gateway and configuration.

pub mod config;
pub mod job_store;
pub mod jobs;
pub mod object_store;
pub mod queue;

#[cfg(test)]
mod integration_tests;
#[cfg(test)]
mod testing;
