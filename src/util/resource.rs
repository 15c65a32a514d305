//! Process CPU accounting
//!
//! Thin wrapper over `getrusage(2)` used by the benchmark to split elapsed
//! time into user and system CPU time.

use std::io;
use std::mem::MaybeUninit;
use std::ops::Sub;
use std::time::Duration;

/// CPU time consumed by this process
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CpuTimes {
    /// Time spent in user mode
    pub user: Duration,
    /// Time spent in kernel mode
    pub system: Duration,
}

impl CpuTimes {
    /// Snapshot the calling process's CPU usage
    pub fn process() -> io::Result<Self> {
        let mut usage = MaybeUninit::<libc::rusage>::uninit();
        let ret = unsafe { libc::getrusage(libc::RUSAGE_SELF, usage.as_mut_ptr()) };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }
        let usage = unsafe { usage.assume_init() };
        Ok(Self {
            user: timeval_to_duration(usage.ru_utime),
            system: timeval_to_duration(usage.ru_stime),
        })
    }

    /// Total CPU time (user + system)
    pub fn total(&self) -> Duration {
        self.user + self.system
    }
}

impl Sub for CpuTimes {
    type Output = CpuTimes;

    fn sub(self, earlier: CpuTimes) -> CpuTimes {
        CpuTimes {
            user: self.user.saturating_sub(earlier.user),
            system: self.system.saturating_sub(earlier.system),
        }
    }
}

fn timeval_to_duration(tv: libc::timeval) -> Duration {
    Duration::new(tv.tv_sec as u64, (tv.tv_usec as u32) * 1_000)
}
