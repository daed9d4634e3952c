//! Task queue: decouples job submission from job execution.
//!
//! - `queue`: the broker contract (`TaskQueue`, `Delivery`, `AckHandle`, `QueueError`)
//! - `in_memory`: single-process broker for dev/tests

pub mod in_memory;
pub mod queue;

pub use in_memory::{InMemoryTaskQueue, QueueDepth};
pub use queue::{AckHandle, Delivery, QueueError, TaskQueue};
