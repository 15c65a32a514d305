//! Public queue handle
//!
//! `IoQueue` is the single-issuer facade over one backend engine: it
//! validates arguments, enforces the reap contract, and drains outstanding
//! requests on teardown. Multiple independent queues may coexist; a
//! process-wide default lives in [`crate::global`].
//!
//! # Example
//!
//! ```no_run
//! use ioqueue::{BackendKind, IoQueue};
//! use std::fs::File;
//! use std::os::unix::io::AsRawFd;
//!
//! let mut queue = IoQueue::new(BackendKind::ThreadPool, 32)?;
//! let file = File::open("/dev/zero")?;
//! let mut buf = vec![0u8; 512];
//!
//! queue.submit_read(file.as_raw_fd(), buf.as_mut_ptr(), 512, 0, |res, _buf| {
//!     println!("read {} bytes", res.unwrap());
//! })?;
//! queue.reap(1)?;
//! queue.destroy();
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

use crate::engine::{Backend, CompletionFn, IoRequest, OpKind};
use crate::error::{QueueError, Result};
use std::fmt;
use std::io;
use std::os::unix::io::RawFd;

#[cfg(target_os = "linux")]
use crate::engine::kaio::KaioBackend;
use crate::engine::threadpool::ThreadPoolBackend;

/// Which completion engine backs the queue
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    /// Linux kernel AIO (io_submit/io_getevents) with eventfd readiness
    KernelAio,
    /// One synchronous-I/O worker thread per depth slot
    ThreadPool,
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendKind::KernelAio => write!(f, "kaio"),
            BackendKind::ThreadPool => write!(f, "threads"),
        }
    }
}

/// Asynchronous block-I/O request queue
///
/// A fixed-capacity, single-issuer queue: submits never block, completions
/// are collected out of order through callbacks during [`reap`](Self::reap),
/// and every accepted request is dispatched exactly once before
/// [`destroy`](Self::destroy) (or drop) returns. All bookkeeping is sized at
/// construction; steady-state operation does not allocate.
pub struct IoQueue {
    backend: Box<dyn Backend>,
    depth: u32,
}

impl IoQueue {
    /// Create a queue accepting at most `depth` concurrently outstanding
    /// requests
    ///
    /// # Errors
    ///
    /// `InvalidArgument` when `depth` is zero or not representable as a
    /// positive signed integer; `OutOfMemory` or `Engine` when backend setup
    /// fails (everything acquired up to that point is released).
    pub fn new(kind: BackendKind, depth: u32) -> Result<Self> {
        if depth == 0 {
            return Err(QueueError::InvalidArgument("depth must be non-zero"));
        }
        if depth > i32::MAX as u32 {
            return Err(QueueError::InvalidArgument("depth exceeds i32::MAX"));
        }
        let backend: Box<dyn Backend> = match kind {
            #[cfg(target_os = "linux")]
            BackendKind::KernelAio => Box::new(KaioBackend::new(depth)?),
            #[cfg(not(target_os = "linux"))]
            BackendKind::KernelAio => return Err(QueueError::NotSupported),
            BackendKind::ThreadPool => Box::new(ThreadPoolBackend::new(depth)?),
        };
        Ok(Self { backend, depth })
    }

    /// Maximum number of concurrently outstanding requests
    pub fn depth(&self) -> u32 {
        self.depth
    }

    /// Short name of the backing engine (for the metrics row)
    pub fn backend_name(&self) -> &'static str {
        self.backend.name()
    }

    /// Requests currently staged, in flight, or awaiting dispatch
    pub fn outstanding(&self) -> usize {
        self.backend.outstanding()
    }

    /// Descriptor signalled when completions become available
    ///
    /// Poll it to learn when [`reap`](Self::reap) would not block. The queue
    /// never reads the descriptor; draining its counter belongs to the
    /// poller. Fails with `NotSupported` on the thread-pool backend.
    pub fn readiness_fd(&self) -> Result<RawFd> {
        self.backend.readiness_fd()
    }

    /// Enqueue a positional read; never blocks, never runs the callback
    /// synchronously
    ///
    /// The callback receives the operation result and the same `buf` pointer
    /// supplied here, on the issuer thread, during a later
    /// [`reap`](Self::reap).
    ///
    /// # Errors
    ///
    /// `InvalidArgument` for a null buffer or a length of zero or beyond
    /// `isize::MAX` (validation never consumes a slot and never invokes the
    /// callback); `QueueFull` when all `depth` slots are occupied.
    ///
    /// # Safety
    ///
    /// `buf` must point to at least `len` writable bytes that remain valid
    /// until the callback has returned.
    pub fn submit_read<F>(&mut self, fd: RawFd, buf: *mut u8, len: usize, offset: u64, complete: F) -> Result<()>
    where
        F: FnOnce(io::Result<usize>, *mut u8) + Send + 'static,
    {
        self.submit(OpKind::Read, fd, buf, len, offset, Box::new(complete))
    }

    /// Enqueue a positional write; same contract as
    /// [`submit_read`](Self::submit_read)
    ///
    /// # Safety
    ///
    /// `buf` must point to at least `len` readable bytes that remain valid
    /// until the callback has returned.
    pub fn submit_write<F>(&mut self, fd: RawFd, buf: *mut u8, len: usize, offset: u64, complete: F) -> Result<()>
    where
        F: FnOnce(io::Result<usize>, *mut u8) + Send + 'static,
    {
        self.submit(OpKind::Write, fd, buf, len, offset, Box::new(complete))
    }

    fn submit(
        &mut self,
        op: OpKind,
        fd: RawFd,
        buf: *mut u8,
        len: usize,
        offset: u64,
        complete: CompletionFn,
    ) -> Result<()> {
        if buf.is_null() {
            return Err(QueueError::InvalidArgument("buffer must be non-null"));
        }
        if len == 0 {
            return Err(QueueError::InvalidArgument("length must be non-zero"));
        }
        if len > isize::MAX as usize {
            return Err(QueueError::InvalidArgument("length exceeds isize::MAX"));
        }
        self.backend.submit(IoRequest {
            op,
            fd,
            buf,
            len,
            offset,
            complete,
        })
    }

    /// Push staged requests to the engine, then block until at least `min`
    /// completions have been dispatched
    ///
    /// Returns the number of callbacks invoked during this call (including
    /// requests the engine rejected at submission, which are finished
    /// through their own callbacks). Callbacks run on the calling thread, in
    /// the order completions are drained; each request's slot is recycled
    /// before its callback runs, so capacity freed here may be reused as
    /// soon as this call returns.
    ///
    /// # Errors
    ///
    /// `InvalidArgument` when `min` is zero or exceeds
    /// [`outstanding`](Self::outstanding); `Engine` when the backend fails
    /// (callbacks already dispatched in this call are not rolled back).
    pub fn reap(&mut self, min: usize) -> Result<usize> {
        if min == 0 {
            return Err(QueueError::InvalidArgument("min must be non-zero"));
        }
        if min > self.backend.outstanding() {
            return Err(QueueError::InvalidArgument("min exceeds outstanding requests"));
        }
        self.backend.reap(min)
    }

    /// Drain every outstanding request and release the queue
    ///
    /// Blocks until all in-flight and staged requests have completed and
    /// their callbacks have run. Dropping the queue does the same.
    pub fn destroy(self) {
        // Drop impl drains and shuts the backend down.
    }

    fn drain(&mut self) {
        while self.backend.outstanding() > 0 {
            if self.backend.reap(1).is_err() {
                break;
            }
        }
    }
}

impl Drop for IoQueue {
    fn drop(&mut self) {
        self.drain();
        let _ = self.backend.shutdown();
    }
}

impl fmt::Debug for IoQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IoQueue")
            .field("backend", &self.backend.name())
            .field("depth", &self.depth)
            .field("outstanding", &self.backend.outstanding())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_depth_validation() {
        for kind in [BackendKind::ThreadPool, BackendKind::KernelAio] {
            assert!(matches!(
                IoQueue::new(kind, 0),
                Err(QueueError::InvalidArgument(_))
            ));
            assert!(matches!(
                IoQueue::new(kind, u32::MAX),
                Err(QueueError::InvalidArgument(_))
            ));
        }
    }

    #[test]
    fn test_submit_validation_never_consumes_a_slot() {
        let mut queue = IoQueue::new(BackendKind::ThreadPool, 2).unwrap();
        let mut buf = [0u8; 64];

        assert!(matches!(
            queue.submit_read(0, std::ptr::null_mut(), 64, 0, |_, _| {}),
            Err(QueueError::InvalidArgument(_))
        ));
        assert!(matches!(
            queue.submit_read(0, buf.as_mut_ptr(), 0, 0, |_, _| {}),
            Err(QueueError::InvalidArgument(_))
        ));
        assert!(matches!(
            queue.submit_write(0, buf.as_mut_ptr(), (isize::MAX as usize) + 1, 0, |_, _| {}),
            Err(QueueError::InvalidArgument(_))
        ));
        assert_eq!(queue.outstanding(), 0);
    }

    #[test]
    fn test_reap_bounds() {
        let mut queue = IoQueue::new(BackendKind::ThreadPool, 4).unwrap();
        assert!(matches!(
            queue.reap(0),
            Err(QueueError::InvalidArgument(_))
        ));
        assert!(matches!(
            queue.reap(1),
            Err(QueueError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_backend_names() {
        let queue = IoQueue::new(BackendKind::ThreadPool, 1).unwrap();
        assert_eq!(queue.backend_name(), "threads");
        assert_eq!(BackendKind::KernelAio.to_string(), "kaio");
        assert_eq!(BackendKind::ThreadPool.to_string(), "threads");
    }
}
