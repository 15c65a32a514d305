//! ioqueue - asynchronous block-I/O request queue
//!
//! A single issuer submits many positional file reads/writes without
//! blocking per request, then collects their completions out of order via
//! callbacks. Two interchangeable backends implement the same contract:
//!
//! - **Kernel AIO**: batches requests into `io_submit(2)`, drains events
//!   with `io_getevents(2)`, and signals an eventfd so the queue plugs into
//!   an external poll/epoll loop.
//! - **Thread pool**: one worker thread per depth slot performing
//!   synchronous `pread`/`pwrite`, posting completions back to the issuer.
//!
//! Capacity is fixed at init, submits never block, callbacks run exactly
//! once on the issuer thread, and teardown drains everything in flight.

pub mod engine;
pub mod error;
pub mod global;
pub mod queue;
pub mod report;
pub mod stats;
pub mod util;

// Re-export commonly used types
pub use error::{QueueError, Result};
pub use queue::{BackendKind, IoQueue};
