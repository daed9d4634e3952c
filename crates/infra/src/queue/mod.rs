//! Infrastructure task queue implementations.
//!
//! The queue contract and the in-memory broker live in `docdiff-queue`.
//! This module provides broker-backed implementations (e.g. Redis).

pub use docdiff_queue::{AckHandle, Delivery, InMemoryTaskQueue, QueueError, TaskQueue};

#[cfg(feature = "redis")]
pub mod redis_streams;

#[cfg(feature = "redis")]
pub use redis_streams::RedisStreamsTaskQueue;
