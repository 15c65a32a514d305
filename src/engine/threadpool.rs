//! Thread-pool backend
//!
//! Portable counterpart to the kernel-AIO engine: one worker thread per
//! queue-depth slot, each performing synchronous `pread`/`pwrite` on
//! requests fanned out round-robin across per-worker rings. Completions are
//! posted back to the issuer through a shared reap condition.
//!
//! # Locking
//!
//! Each worker ring has its own mutex and "work available" condvar; only the
//! issuer and that worker ever touch it. A global reap mutex + condvar
//! signals "some worker produced a completion": workers take the reap lock
//! only on their ring's zero-to-one completed transition, and the issuer
//! holds it while sweeping rings but releases it across every user callback
//! so callbacks never run under an engine lock.
//!
//! Staging is implicit here. Submit places the request directly on a worker
//! ring, so the drain-staging step of `reap` is a no-op and workers may
//! begin I/O before the issuer ever reaps.

use super::{Backend, CompletionFn, IoRequest, OpKind};
use crate::error::{QueueError, Result};
use std::io;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};

/// Slots per worker ring; total capacity across rings equals the depth
const RING_SLOTS: usize = 1;

/// Workers only run one positional syscall deep
const WORKER_STACK: usize = 128 * 1024;

/// A request parked on a worker ring
struct PoolRequest {
    op: OpKind,
    fd: RawFd,
    buf: *mut u8,
    len: usize,
    offset: u64,
    complete: Option<CompletionFn>,
    /// Raw syscall result: bytes transferred, or -errno
    result: isize,
}

// Same justification as IoRequest: the buffer is caller-owned and the record
// is handled by one thread at a time.
unsafe impl Send for PoolRequest {}

impl From<IoRequest> for PoolRequest {
    fn from(req: IoRequest) -> Self {
        Self {
            op: req.op,
            fd: req.fd,
            buf: req.buf,
            len: req.len,
            offset: req.offset,
            complete: Some(req.complete),
            result: 0,
        }
    }
}

/// What a worker needs to perform the I/O, copied out of the ring so the
/// ring lock is not held across the syscall
#[derive(Clone, Copy)]
struct IoParams {
    op: OpKind,
    fd: RawFd,
    buf: *mut u8,
    len: usize,
    offset: u64,
}

/// Bounded ring with a completed prefix
///
/// Logical layout: `[head, head+done)` hold finished requests awaiting the
/// issuer, `[head+done, head+size)` hold pending work. The worker finishes
/// requests strictly in arrival order, so `done` only ever grows at the
/// boundary between the two regions.
struct Ring {
    slots: Vec<Option<PoolRequest>>,
    head: usize,
    size: usize,
    done: usize,
}

impl Ring {
    fn new(capacity: usize) -> Self {
        Self {
            slots: (0..capacity).map(|_| None).collect(),
            head: 0,
            size: 0,
            done: 0,
        }
    }

    fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Append to the tail; hands the request back when the ring is full
    fn push(&mut self, req: PoolRequest) -> std::result::Result<(), PoolRequest> {
        if self.size == self.capacity() {
            return Err(req);
        }
        let slot = (self.head + self.size) % self.capacity();
        self.slots[slot] = Some(req);
        self.size += 1;
        Ok(())
    }

    /// The oldest request not yet worked on
    fn next_pending(&self) -> Option<(usize, IoParams)> {
        if self.done == self.size {
            return None;
        }
        let slot = (self.head + self.done) % self.capacity();
        let req = self.slots[slot].as_ref()?;
        Some((
            slot,
            IoParams {
                op: req.op,
                fd: req.fd,
                buf: req.buf,
                len: req.len,
                offset: req.offset,
            },
        ))
    }

    /// Record the result for the request at `slot`; true when this is the
    /// ring's first undispatched completion
    fn complete(&mut self, slot: usize, result: isize) -> bool {
        if let Some(req) = self.slots[slot].as_mut() {
            req.result = result;
        }
        let was_empty = self.done == 0;
        self.done += 1;
        was_empty
    }

    /// Pop the oldest finished request
    fn take_done(&mut self) -> Option<PoolRequest> {
        if self.done == 0 {
            return None;
        }
        let req = self.slots[self.head].take()?;
        self.head = (self.head + 1) % self.capacity();
        self.done -= 1;
        self.size -= 1;
        Some(req)
    }
}

struct WorkerQueue {
    ring: Mutex<Ring>,
    work: Condvar,
}

struct Shared {
    running: AtomicBool,
    queues: Vec<WorkerQueue>,
    reap_lock: Mutex<()>,
    reap_cond: Condvar,
}

fn execute(params: IoParams) -> isize {
    let ret = unsafe {
        match params.op {
            OpKind::Read => libc::pread(
                params.fd,
                params.buf as *mut libc::c_void,
                params.len,
                params.offset as libc::off_t,
            ),
            OpKind::Write => libc::pwrite(
                params.fd,
                params.buf as *const libc::c_void,
                params.len,
                params.offset as libc::off_t,
            ),
        }
    };
    if ret < 0 {
        -(io::Error::last_os_error().raw_os_error().unwrap_or(libc::EIO) as isize)
    } else {
        ret
    }
}

fn worker_loop(shared: Arc<Shared>, index: usize) {
    let queue = &shared.queues[index];
    let mut ring = queue.ring.lock().unwrap();
    loop {
        if !shared.running.load(Ordering::Acquire) {
            return;
        }
        let (slot, params) = match ring.next_pending() {
            Some(next) => next,
            None => {
                ring = queue.work.wait(ring).unwrap();
                continue;
            }
        };

        // One syscall, ring unlocked. The slot cannot move underneath us:
        // the issuer pops only finished requests and this one is not yet
        // marked done.
        drop(ring);
        let result = execute(params);
        ring = queue.ring.lock().unwrap();

        if ring.complete(slot, result) {
            // First pending completion on this ring; the issuer may be
            // blocked in reap.
            drop(ring);
            let guard = shared.reap_lock.lock().unwrap();
            shared.reap_cond.notify_one();
            drop(guard);
            ring = queue.ring.lock().unwrap();
        }
    }
}

fn stop_workers(shared: &Shared, workers: &mut Vec<JoinHandle<()>>) {
    shared.running.store(false, Ordering::Release);
    for queue in &shared.queues {
        let _ring = queue.ring.lock().unwrap();
        queue.work.notify_all();
    }
    for handle in workers.drain(..) {
        let _ = handle.join();
    }
}

/// Thread-pool engine state
pub struct ThreadPoolBackend {
    shared: Arc<Shared>,
    workers: Vec<JoinHandle<()>>,
    next_queue: usize,
    outstanding: usize,
}

impl ThreadPoolBackend {
    /// Start `depth` joinable workers, each with a one-slot ring
    ///
    /// A spawn failure mid-startup stops and joins the workers already
    /// running before returning the originating error.
    pub fn new(depth: u32) -> Result<Self> {
        let depth = depth as usize;
        let shared = Arc::new(Shared {
            running: AtomicBool::new(true),
            queues: (0..depth)
                .map(|_| WorkerQueue {
                    ring: Mutex::new(Ring::new(RING_SLOTS)),
                    work: Condvar::new(),
                })
                .collect(),
            reap_lock: Mutex::new(()),
            reap_cond: Condvar::new(),
        });

        let mut workers = Vec::with_capacity(depth);
        for index in 0..depth {
            let worker_shared = Arc::clone(&shared);
            let spawned = thread::Builder::new()
                .name(format!("ioq-worker-{index}"))
                .stack_size(WORKER_STACK)
                .spawn(move || worker_loop(worker_shared, index));
            match spawned {
                Ok(handle) => workers.push(handle),
                Err(err) => {
                    stop_workers(&shared, &mut workers);
                    return Err(QueueError::Engine(err));
                }
            }
        }

        Ok(Self {
            shared,
            workers,
            next_queue: 0,
            outstanding: 0,
        })
    }

    fn dispatch(mut req: PoolRequest) {
        let result = if req.result < 0 {
            Err(io::Error::from_raw_os_error(-req.result as i32))
        } else {
            Ok(req.result as usize)
        };
        if let Some(complete) = req.complete.take() {
            complete(result, req.buf);
        }
    }
}

impl Backend for ThreadPoolBackend {
    fn name(&self) -> &'static str {
        "threads"
    }

    fn submit(&mut self, req: IoRequest) -> Result<()> {
        let nqueues = self.shared.queues.len();
        let mut req = PoolRequest::from(req);
        for _ in 0..nqueues {
            let queue = &self.shared.queues[self.next_queue];
            self.next_queue = (self.next_queue + 1) % nqueues;
            let mut ring = queue.ring.lock().unwrap();
            match ring.push(req) {
                Ok(()) => {
                    queue.work.notify_one();
                    self.outstanding += 1;
                    return Ok(());
                }
                Err(back) => req = back,
            }
        }
        Err(QueueError::QueueFull)
    }

    fn reap(&mut self, min: usize) -> Result<usize> {
        let shared = Arc::clone(&self.shared);
        let mut dispatched = 0;
        let mut guard = shared.reap_lock.lock().unwrap();
        loop {
            let mut took_any = false;
            for queue in &shared.queues {
                loop {
                    let taken = queue.ring.lock().unwrap().take_done();
                    let req = match taken {
                        Some(req) => req,
                        None => break,
                    };
                    took_any = true;
                    dispatched += 1;
                    self.outstanding -= 1;

                    // Run the callback without the reap lock so a worker's
                    // first-completion signal is never blocked on user code.
                    drop(guard);
                    Self::dispatch(req);
                    guard = shared.reap_lock.lock().unwrap();
                }
            }
            if took_any {
                continue;
            }
            if dispatched >= min {
                break;
            }
            // Below the target and nothing ready: at least one worker still
            // holds unfinished work (the caller bounded min by outstanding),
            // and its zero-to-one transition will signal us.
            guard = shared.reap_cond.wait(guard).unwrap();
        }
        drop(guard);
        Ok(dispatched)
    }

    fn outstanding(&self) -> usize {
        self.outstanding
    }

    fn readiness_fd(&self) -> Result<RawFd> {
        Err(QueueError::NotSupported)
    }

    fn shutdown(&mut self) -> Result<()> {
        if !self.workers.is_empty() {
            stop_workers(&self.shared, &mut self.workers);
        }
        Ok(())
    }
}

impl Drop for ThreadPoolBackend {
    fn drop(&mut self) {
        let _ = self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::File;
    use std::os::unix::io::AsRawFd;
    use std::sync::atomic::{AtomicIsize, AtomicUsize};
    use tempfile::TempDir;

    fn sample_request(result: isize) -> PoolRequest {
        PoolRequest {
            op: OpKind::Read,
            fd: -1,
            buf: std::ptr::null_mut(),
            len: 0,
            offset: 0,
            complete: None,
            result,
        }
    }

    #[test]
    fn test_ring_push_and_take_fifo() {
        let mut ring = Ring::new(3);
        for i in 0..3 {
            ring.push(sample_request(i)).ok().unwrap();
        }
        assert!(ring.push(sample_request(9)).is_err());

        // Worker finishes the first two in order
        let (slot, _) = ring.next_pending().unwrap();
        assert!(ring.complete(slot, 10));
        let (slot, _) = ring.next_pending().unwrap();
        assert!(!ring.complete(slot, 11));

        assert_eq!(ring.take_done().unwrap().result, 10);
        assert_eq!(ring.take_done().unwrap().result, 11);
        assert!(ring.take_done().is_none());
        assert!(ring.next_pending().is_some()); // one pending request remains
    }

    #[test]
    fn test_ring_wraps_after_take() {
        let mut ring = Ring::new(2);
        ring.push(sample_request(0)).ok().unwrap();
        let (slot, _) = ring.next_pending().unwrap();
        ring.complete(slot, 0);
        ring.take_done().unwrap();

        // head has advanced; pushes keep landing in free slots
        ring.push(sample_request(1)).ok().unwrap();
        ring.push(sample_request(2)).ok().unwrap();
        assert!(ring.push(sample_request(3)).is_err());
        let (slot, _) = ring.next_pending().unwrap();
        ring.complete(slot, 1);
        assert_eq!(ring.take_done().unwrap().result, 1);
    }

    #[test]
    fn test_read_roundtrip() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("read.dat");
        let mut data = vec![0u8; 4096];
        data[100] = 7;
        std::fs::write(&path, &data).unwrap();
        let file = File::open(&path).unwrap();

        let mut backend = ThreadPoolBackend::new(4).unwrap();
        let mut buffer = vec![0u8; 4096];
        let res = Arc::new(AtomicIsize::new(0));
        let res2 = res.clone();
        backend
            .submit(IoRequest {
                op: OpKind::Read,
                fd: file.as_raw_fd(),
                buf: buffer.as_mut_ptr(),
                len: 4096,
                offset: 0,
                complete: Box::new(move |result, _| {
                    res2.store(result.map(|n| n as isize).unwrap_or(-1), Ordering::SeqCst);
                }),
            })
            .unwrap();
        assert_eq!(backend.outstanding(), 1);
        assert_eq!(backend.reap(1).unwrap(), 1);
        assert_eq!(res.load(Ordering::SeqCst), 4096);
        assert_eq!(buffer[100], 7);
        assert_eq!(backend.outstanding(), 0);
    }

    #[test]
    fn test_reap_collects_across_workers() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("multi.dat");
        std::fs::write(&path, vec![3u8; 16384]).unwrap();
        let file = File::open(&path).unwrap();

        let mut backend = ThreadPoolBackend::new(4).unwrap();
        let count = Arc::new(AtomicUsize::new(0));
        let mut buffers = vec![vec![0u8; 4096]; 4];
        for (i, buffer) in buffers.iter_mut().enumerate() {
            let count = count.clone();
            backend
                .submit(IoRequest {
                    op: OpKind::Read,
                    fd: file.as_raw_fd(),
                    buf: buffer.as_mut_ptr(),
                    len: 4096,
                    offset: (i * 4096) as u64,
                    complete: Box::new(move |result, _| {
                        assert_eq!(result.unwrap(), 4096);
                        count.fetch_add(1, Ordering::SeqCst);
                    }),
                })
                .unwrap();
        }
        assert_eq!(backend.reap(4).unwrap(), 4);
        assert_eq!(count.load(Ordering::SeqCst), 4);
    }

    #[test]
    fn test_queue_full_when_all_rings_occupied() {
        // Depth 2 and a descriptor that never completes quickly enough to
        // matter: use a bad fd so the completions park on the rings.
        let mut backend = ThreadPoolBackend::new(2).unwrap();
        let mut buffers = vec![vec![0u8; 512]; 3];
        for buffer in buffers.iter_mut().take(2) {
            backend
                .submit(IoRequest {
                    op: OpKind::Read,
                    fd: -1,
                    buf: buffer.as_mut_ptr(),
                    len: 512,
                    offset: 0,
                    complete: Box::new(|_, _| {}),
                })
                .unwrap();
        }
        let overflow = backend.submit(IoRequest {
            op: OpKind::Read,
            fd: -1,
            buf: buffers[2].as_mut_ptr(),
            len: 512,
            offset: 0,
            complete: Box::new(|_, _| {}),
        });
        assert!(matches!(overflow, Err(QueueError::QueueFull)));
        assert_eq!(backend.reap(2).unwrap(), 2);
    }

    #[test]
    fn test_bad_descriptor_surfaces_through_callback() {
        let mut backend = ThreadPoolBackend::new(2).unwrap();
        let mut buffer = vec![0u8; 512];
        let res = Arc::new(AtomicIsize::new(0));
        let res2 = res.clone();
        backend
            .submit(IoRequest {
                op: OpKind::Read,
                fd: -1,
                buf: buffer.as_mut_ptr(),
                len: 512,
                offset: 0,
                complete: Box::new(move |result, _| {
                    let errno = result.unwrap_err().raw_os_error().unwrap();
                    res2.store(errno as isize, Ordering::SeqCst);
                }),
            })
            .unwrap();
        assert_eq!(backend.reap(1).unwrap(), 1);
        assert_eq!(res.load(Ordering::SeqCst), libc::EBADF as isize);
    }

    #[test]
    fn test_shutdown_joins_workers() {
        let mut backend = ThreadPoolBackend::new(8).unwrap();
        backend.shutdown().unwrap();
        backend.shutdown().unwrap();
        assert!(backend.workers.is_empty());
    }
}
