//! Task scheduling for quarry.
//!
//! Two pieces live here: the [`TaskSystem`], a fixed pool of worker threads
//! with per-worker queues and work stealing, and the [`AsyncMapConsumer`],
//! a concurrent key-to-value map whose values are produced on demand by a
//! user-supplied creator, with at-most-one evaluation per key, recursive
//! sub-calls and cycle detection. All analysis and traversal work in quarry
//! runs through these two types.

mod async_map;
mod task_system;

pub use async_map::{
    AsyncMapConsumer, Continuation, CyclePrinter, FailureReporter, Logger, Setter, SubCaller,
    ValueCreator,
};
pub use task_system::{TaskHandle, TaskSystem};
