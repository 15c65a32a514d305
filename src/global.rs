//! Process-wide default queue
//!
//! Thin wrapper over one [`IoQueue`] for callers that want the classic
//! init/submit/reap/destroy surface without threading a handle around. The
//! wrapper owns the double-init check; the handle API itself allows any
//! number of independent queues.
//!
//! The default queue is still a single-issuer facility: the mutex here only
//! guards installation and teardown, it does not make concurrent submit or
//! reap calls meaningful.

use crate::error::{QueueError, Result};
use crate::queue::{BackendKind, IoQueue};
use std::io;
use std::os::unix::io::RawFd;
use std::sync::Mutex;

static DEFAULT: Mutex<Option<IoQueue>> = Mutex::new(None);

fn with_queue<T>(f: impl FnOnce(&mut IoQueue) -> Result<T>) -> Result<T> {
    let mut slot = DEFAULT.lock().unwrap();
    match slot.as_mut() {
        Some(queue) => f(queue),
        None => Err(QueueError::InvalidArgument("default queue not initialized")),
    }
}

/// Install the default queue
///
/// Fails with `InvalidArgument` if a default queue already exists; call
/// [`destroy`] first. Depth validation and backend setup behave exactly as
/// [`IoQueue::new`].
pub fn init(kind: BackendKind, depth: u32) -> Result<()> {
    let mut slot = DEFAULT.lock().unwrap();
    if slot.is_some() {
        return Err(QueueError::InvalidArgument("default queue already initialized"));
    }
    *slot = Some(IoQueue::new(kind, depth)?);
    Ok(())
}

/// Readiness descriptor of the default queue
pub fn readiness_fd() -> Result<RawFd> {
    with_queue(|queue| queue.readiness_fd())
}

/// Enqueue a positional read on the default queue
pub fn submit_read<F>(fd: RawFd, buf: *mut u8, len: usize, offset: u64, complete: F) -> Result<()>
where
    F: FnOnce(io::Result<usize>, *mut u8) + Send + 'static,
{
    with_queue(|queue| queue.submit_read(fd, buf, len, offset, complete))
}

/// Enqueue a positional write on the default queue
pub fn submit_write<F>(fd: RawFd, buf: *mut u8, len: usize, offset: u64, complete: F) -> Result<()>
where
    F: FnOnce(io::Result<usize>, *mut u8) + Send + 'static,
{
    with_queue(|queue| queue.submit_write(fd, buf, len, offset, complete))
}

/// Reap at least `min` completions from the default queue
pub fn reap(min: usize) -> Result<usize> {
    with_queue(|queue| queue.reap(min))
}

/// Outstanding requests on the default queue
pub fn outstanding() -> Result<usize> {
    with_queue(|queue| Ok(queue.outstanding()))
}

/// Drain and tear down the default queue
///
/// Blocks until every outstanding request's callback has run. A later
/// [`init`] is legal. Does nothing if no default queue is installed.
pub fn destroy() {
    let queue = DEFAULT.lock().unwrap().take();
    drop(queue);
}
