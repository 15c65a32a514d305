//! Kernel-AIO backend
//!
//! This backend drives requests through the Linux native asynchronous I/O
//! facility: staged requests are pushed to the kernel in batches via
//! `io_submit(2)` and completions are drained with `io_getevents(2)`. Every
//! control block is tagged to signal an `eventfd(2)` on completion, so the
//! queue can sit behind an external poll/epoll loop.
//!
//! # Implementation
//!
//! Raw syscalls via libc rather than a binding crate, to stay off the LGPL
//! libaio library. Control blocks live inside pooled request records; the
//! `aio_data` field of each iocb carries the record's pool index, which is
//! all a completion event needs to find its callback and buffer again.
//!
//! Submission is deferred until `reap` so consecutive submits coalesce into
//! one `io_submit` call. A bad descriptor is only discovered by the kernel
//! at that point; the offending request is finished locally through its own
//! callback (result `EBADF`) while the rest of the batch proceeds.

use super::{Backend, CompletionFn, IoRequest, OpKind};
use crate::error::{QueueError, Result};
use std::io;
use std::os::unix::io::RawFd;
use std::ptr;

type AioContext = libc::c_ulong;

const IOCB_CMD_PREAD: u16 = 0;
const IOCB_CMD_PWRITE: u16 = 1;

/// Ask the kernel to signal `aio_resfd` when the operation completes
const IOCB_FLAG_RESFD: u32 = 1;

/// Kernel AIO control block (linux/aio_abi.h)
#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
struct Iocb {
    data: u64,         // aio_data: pool index of the owning record
    key: u32,          // aio_key
    aio_rw_flags: u32, // RWF_* flags
    lio_opcode: u16,   // IOCB_CMD_*
    reqprio: i16,      // aio_reqprio
    fildes: u32,       // aio_fildes
    buf: u64,          // aio_buf
    nbytes: u64,       // aio_nbytes
    offset: i64,       // aio_offset
    reserved2: u64,    // aio_reserved2
    flags: u32,        // IOCB_FLAG_*
    resfd: u32,        // aio_resfd
}

/// Kernel AIO completion event (linux/aio_abi.h)
#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
struct IoEvent {
    data: u64, // aio_data from the iocb
    obj: u64,  // pointer to the iocb
    res: i64,  // bytes transferred or -errno
    res2: i64, // secondary result
}

unsafe fn io_setup(maxevents: libc::c_int, ctxp: *mut AioContext) -> libc::c_int {
    libc::syscall(libc::SYS_io_setup, maxevents as libc::c_long, ctxp) as libc::c_int
}

unsafe fn io_destroy(ctx: AioContext) -> libc::c_int {
    libc::syscall(libc::SYS_io_destroy, ctx) as libc::c_int
}

unsafe fn io_submit(ctx: AioContext, nr: libc::c_long, iocbpp: *mut *mut Iocb) -> libc::c_int {
    libc::syscall(libc::SYS_io_submit, ctx, nr, iocbpp) as libc::c_int
}

unsafe fn io_getevents(
    ctx: AioContext,
    min_nr: libc::c_long,
    nr: libc::c_long,
    events: *mut IoEvent,
    timeout: *mut libc::timespec,
) -> libc::c_int {
    libc::syscall(libc::SYS_io_getevents, ctx, min_nr, nr, events, timeout) as libc::c_int
}

/// Pooled request record
///
/// The iocb must stay the first field: `io_submit` takes an array of iocb
/// pointers, and a record pointer doubles as its iocb pointer under
/// `repr(C)`.
#[repr(C)]
#[derive(Default)]
struct Request {
    iocb: Iocb,
    complete: Option<CompletionFn>,
}

/// Kernel-AIO engine state
pub struct KaioBackend {
    ctx: AioContext,
    depth: usize,
    event_fd: RawFd,
    pool: super::pool::RequestPool<Request>,
    in_flight: usize,
    /// Reusable iocb-pointer batch handed to io_submit
    batch: Vec<*mut Request>,
    /// Reusable completion-event buffer filled by io_getevents
    events: Vec<IoEvent>,
}

// Raw pointers in the reusable batch refer to pool-owned records; the
// backend is only ever driven from the single issuer thread.
unsafe impl Send for KaioBackend {}

impl KaioBackend {
    /// Create an engine context sized for `depth` simultaneous operations
    ///
    /// Allocates all bookkeeping up front and creates the readiness eventfd
    /// with close-on-exec + non-blocking semantics. On partial failure,
    /// everything acquired so far is released before the error is returned.
    pub fn new(depth: u32) -> Result<Self> {
        let depth = depth as usize;

        let mut ctx: AioContext = 0;
        let ret = unsafe { io_setup(depth as libc::c_int, &mut ctx) };
        if ret < 0 {
            let err = io::Error::last_os_error();
            return Err(match err.raw_os_error() {
                Some(libc::ENOMEM) => QueueError::OutOfMemory,
                _ => QueueError::Engine(err),
            });
        }

        let event_fd = unsafe { libc::eventfd(0, libc::EFD_CLOEXEC | libc::EFD_NONBLOCK) };
        if event_fd < 0 {
            let err = io::Error::last_os_error();
            unsafe { io_destroy(ctx) };
            return Err(QueueError::Engine(err));
        }

        Ok(Self {
            ctx,
            depth,
            event_fd,
            pool: super::pool::RequestPool::new(depth),
            in_flight: 0,
            batch: Vec::with_capacity(depth),
            events: vec![IoEvent::default(); depth],
        })
    }

    /// Finish the head staged request locally with the given errno
    ///
    /// The slot is recycled before the callback runs, so capacity is already
    /// available when the issuer regains control.
    fn finish_head_local(&mut self, errno: i32) {
        let idx = match self.pool.pop_staged() {
            Some(idx) => idx,
            None => return,
        };
        let rec = self.pool.record_mut(idx);
        let complete = rec.complete.take();
        let buf = rec.iocb.buf as *mut u8;
        self.pool.release(idx);
        if let Some(complete) = complete {
            complete(Err(io::Error::from_raw_os_error(errno)), buf);
        }
    }

    /// Push staged requests to the kernel in batches
    ///
    /// Returns the number of requests finished locally (bad descriptors
    /// rejected by io_submit). On any other submission error the unsubmitted
    /// entries stay at the head of the staging queue and the error is
    /// returned.
    fn submit_staged(&mut self) -> Result<usize> {
        let mut finished = 0;
        while self.pool.staged_len() > 0 {
            self.pool.staged_records(&mut self.batch);
            let nr = self.batch.len() as libc::c_long;
            let ret = unsafe { io_submit(self.ctx, nr, self.batch.as_mut_ptr() as *mut *mut Iocb) };
            if ret < 0 {
                let err = io::Error::last_os_error();
                match err.raw_os_error() {
                    Some(libc::EINTR) => continue,
                    Some(libc::EBADF) => {
                        // The kernel rejects the head iocb; complete it
                        // through its own callback and keep going.
                        self.finish_head_local(libc::EBADF);
                        finished += 1;
                    }
                    _ => return Err(QueueError::Engine(err)),
                }
            } else {
                for _ in 0..ret {
                    self.pool.pop_staged();
                }
                self.in_flight += ret as usize;
            }
        }
        Ok(finished)
    }

    /// Block for at least `min` completion events and dispatch them
    fn wait_and_dispatch(&mut self, min: usize) -> Result<usize> {
        let got = loop {
            let ret = unsafe {
                io_getevents(
                    self.ctx,
                    min as libc::c_long,
                    self.depth as libc::c_long,
                    self.events.as_mut_ptr(),
                    ptr::null_mut(),
                )
            };
            if ret < 0 {
                let err = io::Error::last_os_error();
                if err.raw_os_error() == Some(libc::EINTR) {
                    continue;
                }
                return Err(QueueError::Engine(err));
            }
            break ret as usize;
        };

        for i in 0..got {
            let event = self.events[i];
            let idx = event.data as usize;
            let rec = self.pool.record_mut(idx);
            let complete = rec.complete.take();
            let buf = rec.iocb.buf as *mut u8;
            self.pool.release(idx);
            self.in_flight -= 1;
            let result = if event.res < 0 {
                Err(io::Error::from_raw_os_error(-event.res as i32))
            } else {
                Ok(event.res as usize)
            };
            if let Some(complete) = complete {
                complete(result, buf);
            }
        }
        Ok(got)
    }
}

impl Backend for KaioBackend {
    fn name(&self) -> &'static str {
        "kaio"
    }

    fn submit(&mut self, req: IoRequest) -> Result<()> {
        let idx = self.pool.acquire()?;
        let event_fd = self.event_fd;
        let rec = self.pool.record_mut(idx);
        rec.iocb = Iocb {
            data: idx as u64,
            lio_opcode: match req.op {
                OpKind::Read => IOCB_CMD_PREAD,
                OpKind::Write => IOCB_CMD_PWRITE,
            },
            fildes: req.fd as u32,
            buf: req.buf as u64,
            nbytes: req.len as u64,
            offset: req.offset as i64,
            flags: IOCB_FLAG_RESFD,
            resfd: event_fd as u32,
            ..Iocb::default()
        };
        rec.complete = Some(req.complete);
        self.pool.stage(idx);
        Ok(())
    }

    fn reap(&mut self, min: usize) -> Result<usize> {
        let mut dispatched = self.submit_staged()?;
        let wait_min = min.saturating_sub(dispatched);
        if self.in_flight > 0 {
            dispatched += self.wait_and_dispatch(wait_min)?;
        }
        Ok(dispatched)
    }

    fn outstanding(&self) -> usize {
        self.pool.staged_len() + self.in_flight
    }

    fn readiness_fd(&self) -> Result<RawFd> {
        Ok(self.event_fd)
    }

    fn shutdown(&mut self) -> Result<()> {
        if self.ctx != 0 {
            let ret = unsafe { io_destroy(self.ctx) };
            self.ctx = 0;
            if ret < 0 {
                return Err(QueueError::Engine(io::Error::last_os_error()));
            }
        }
        if self.event_fd >= 0 {
            unsafe { libc::close(self.event_fd) };
            self.event_fd = -1;
        }
        Ok(())
    }
}

impl Drop for KaioBackend {
    fn drop(&mut self) {
        let _ = self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::{File, OpenOptions};
    use std::os::unix::io::AsRawFd;
    use std::sync::atomic::{AtomicIsize, AtomicUsize, Ordering};
    use std::sync::Arc;
    use tempfile::TempDir;

    fn read_req(fd: RawFd, buf: *mut u8, len: usize, offset: u64, res: Arc<AtomicIsize>) -> IoRequest {
        IoRequest {
            op: OpKind::Read,
            fd,
            buf,
            len,
            offset,
            complete: Box::new(move |result, _| {
                res.store(
                    match result {
                        Ok(n) => n as isize,
                        Err(e) => -(e.raw_os_error().unwrap_or(libc::EIO) as isize),
                    },
                    Ordering::SeqCst,
                );
            }),
        }
    }

    #[test]
    fn test_init_and_shutdown() {
        let mut backend = KaioBackend::new(32).unwrap();
        assert!(backend.readiness_fd().unwrap() >= 0);
        assert_eq!(backend.outstanding(), 0);
        backend.shutdown().unwrap();
        // Idempotent
        backend.shutdown().unwrap();
    }

    #[test]
    fn test_read_roundtrip() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("read.dat");
        let mut data = vec![0u8; 4096];
        data[100] = 7;
        std::fs::write(&path, &data).unwrap();

        let file = File::open(&path).unwrap();
        let mut backend = KaioBackend::new(8).unwrap();

        let mut buffer = vec![0u8; 4096];
        let res = Arc::new(AtomicIsize::new(0));
        backend
            .submit(read_req(file.as_raw_fd(), buffer.as_mut_ptr(), 4096, 0, res.clone()))
            .unwrap();
        assert_eq!(backend.outstanding(), 1);

        assert_eq!(backend.reap(1).unwrap(), 1);
        assert_eq!(res.load(Ordering::SeqCst), 4096);
        assert_eq!(buffer[100], 7);
        assert_eq!(backend.outstanding(), 0);
    }

    #[test]
    fn test_write_roundtrip() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("write.dat");
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&path)
            .unwrap();

        let mut backend = KaioBackend::new(8).unwrap();
        let mut buffer = vec![0u8; 4096];
        buffer[250] = 1;
        let res = Arc::new(AtomicIsize::new(0));
        let res2 = res.clone();
        backend
            .submit(IoRequest {
                op: OpKind::Write,
                fd: file.as_raw_fd(),
                buf: buffer.as_mut_ptr(),
                len: 4096,
                offset: 0,
                complete: Box::new(move |result, _| {
                    res2.store(result.map(|n| n as isize).unwrap_or(-1), Ordering::SeqCst);
                }),
            })
            .unwrap();
        assert_eq!(backend.reap(1).unwrap(), 1);
        assert_eq!(res.load(Ordering::SeqCst), 4096);
        drop(file);

        let written = std::fs::read(&path).unwrap();
        assert_eq!(written[250], 1);
    }

    #[test]
    fn test_batched_submission_reaps_all() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("batch.dat");
        let data: Vec<u8> = (0..20480).map(|i| (i % 256) as u8).collect();
        std::fs::write(&path, &data).unwrap();

        let file = File::open(&path).unwrap();
        let mut backend = KaioBackend::new(8).unwrap();

        let count = Arc::new(AtomicUsize::new(0));
        let mut buffers = vec![vec![0u8; 4096]; 5];
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
        assert_eq!(backend.outstanding(), 5);

        let mut reaped = backend.reap(5).unwrap();
        while reaped < 5 {
            reaped += backend.reap(1).unwrap();
        }
        assert_eq!(count.load(Ordering::SeqCst), 5);

        for (i, buffer) in buffers.iter().enumerate() {
            assert_eq!(buffer[0], ((i * 4096) % 256) as u8);
        }
    }

    #[test]
    fn test_queue_full_at_depth() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("full.dat");
        std::fs::write(&path, vec![0u8; 8192]).unwrap();
        let file = File::open(&path).unwrap();

        let mut backend = KaioBackend::new(2).unwrap();
        let mut buffers = vec![vec![0u8; 512]; 3];
        let res = Arc::new(AtomicIsize::new(0));
        for buffer in buffers.iter_mut().take(2) {
            backend
                .submit(read_req(file.as_raw_fd(), buffer.as_mut_ptr(), 512, 0, res.clone()))
                .unwrap();
        }
        let overflow = backend.submit(read_req(
            file.as_raw_fd(),
            buffers[2].as_mut_ptr(),
            512,
            0,
            res.clone(),
        ));
        assert!(matches!(overflow, Err(QueueError::QueueFull)));

        let mut reaped = backend.reap(2).unwrap();
        while reaped < 2 {
            reaped += backend.reap(1).unwrap();
        }
    }

    #[test]
    fn test_bad_descriptor_finishes_through_callback() {
        let mut backend = KaioBackend::new(4).unwrap();
        let mut buffer = vec![0u8; 512];
        let res = Arc::new(AtomicIsize::new(0));
        backend
            .submit(read_req(-1, buffer.as_mut_ptr(), 512, 0, res.clone()))
            .unwrap();
        assert_eq!(backend.outstanding(), 1);

        assert_eq!(backend.reap(1).unwrap(), 1);
        assert_eq!(res.load(Ordering::SeqCst), -(libc::EBADF as isize));
        assert_eq!(backend.outstanding(), 0);
    }
}
