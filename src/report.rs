//! Benchmark metrics row
//!
//! The benchmark emits one row per run: backend, request count, buffer
//! size, depth, wall/user/system/total CPU time, mean per-op latency, and
//! throughput. The fixed-width header goes to stderr so that stdout stays a
//! clean, concatenable results table; `--json` swaps the row for a JSON
//! object.

use serde::Serialize;
use std::time::Duration;

/// One benchmark run's metrics
#[derive(Debug, Clone, Serialize)]
pub struct BenchReport {
    /// Backend name ("kaio" or "threads")
    pub backend: String,
    /// Total requests executed
    pub requests: u64,
    /// I/O buffer size in bytes
    pub bufsize: usize,
    /// Queue depth
    pub depth: u32,
    /// Wall-clock time, milliseconds
    pub real_ms: u64,
    /// User CPU time, milliseconds
    pub user_ms: u64,
    /// System CPU time, milliseconds
    pub system_ms: u64,
    /// Total CPU time, milliseconds
    pub cpu_ms: u64,
    /// Mean per-operation latency, microseconds
    pub mean_us: u64,
    /// Completed operations per second
    pub ops_per_sec: u64,
    /// Throughput in MiB per second
    pub mb_per_sec: f64,
}

impl BenchReport {
    /// Assemble the row from raw measurements
    pub fn new(
        backend: &str,
        requests: u64,
        bufsize: usize,
        depth: u32,
        elapsed: Duration,
        user: Duration,
        system: Duration,
        mean_us: f64,
    ) -> Self {
        let secs = elapsed.as_secs_f64();
        let total_bytes = requests as f64 * bufsize as f64;
        let ops_per_sec = if secs > 0.0 { requests as f64 / secs } else { 0.0 };
        let mb_per_sec = if secs > 0.0 {
            total_bytes / secs / (1 << 20) as f64
        } else {
            0.0
        };
        Self {
            backend: backend.to_string(),
            requests,
            bufsize,
            depth,
            real_ms: elapsed.as_millis() as u64,
            user_ms: user.as_millis() as u64,
            system_ms: system.as_millis() as u64,
            cpu_ms: (user + system).as_millis() as u64,
            mean_us: mean_us.round() as u64,
            ops_per_sec: ops_per_sec as u64,
            mb_per_sec,
        }
    }

    /// Column header matching [`row`](Self::row)
    pub fn header() -> &'static str {
        "backend reqs    bufsize depth   rtime   utime   stime   cpu     us/op   op/s    MB/s"
    }

    /// Fixed-width metrics row
    pub fn row(&self) -> String {
        format!(
            "{:<7} {:<7} {:<7} {:<7} {:<7} {:<7} {:<7} {:<7} {:<7} {:<7} {:<7.2}",
            self.backend,
            self.requests,
            self.bufsize,
            self.depth,
            self.real_ms,
            self.user_ms,
            self.system_ms,
            self.cpu_ms,
            self.mean_us,
            self.ops_per_sec,
            self.mb_per_sec,
        )
    }

    /// JSON rendering of the same record
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}
