//! ioqueue-bench CLI entry point
//!
//! Random-read benchmark over the queue backends: keeps `Q_DEPTH` aligned
//! buffers in flight against the input files, measures per-request latency
//! from submit to callback, and prints a one-line metrics row. All knobs are
//! environment variables (with equivalent flags) so result tables can be
//! produced from shell loops.

use anyhow::{bail, Context, Result};
use clap::{Parser, ValueEnum};
use ioqueue::report::BenchReport;
use ioqueue::stats::LatencyHistogram;
use ioqueue::util::buffer::BufferPool;
use ioqueue::util::resource::CpuTimes;
use ioqueue::{BackendKind, IoQueue};
use rand::{Rng, SeedableRng};
use rand_xoshiro::Xoshiro256PlusPlus;
use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::fs::OpenOptionsExt;
use std::os::unix::io::{AsRawFd, RawFd};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Instant;

/// Buffer alignment for O_DIRECT
const BUFFER_ALIGNMENT: usize = 512;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum BackendArg {
    /// Kernel AIO (io_submit/io_getevents)
    Kaio,
    /// Worker-thread pool
    Threads,
}

impl From<BackendArg> for BackendKind {
    fn from(arg: BackendArg) -> Self {
        match arg {
            BackendArg::Kaio => BackendKind::KernelAio,
            BackendArg::Threads => BackendKind::ThreadPool,
        }
    }
}

#[derive(Debug, Parser)]
#[command(
    name = "ioqueue-bench",
    version,
    about = "Random-read benchmark over the ioqueue backends"
)]
struct Cli {
    /// Input files, opened read-only with O_DIRECT
    #[arg(required = true)]
    paths: Vec<PathBuf>,

    /// Completion engine to benchmark
    #[arg(long, env = "IOQ_BACKEND", value_enum, default_value = "kaio")]
    backend: BackendArg,

    /// Print resolved configuration at start (0/1)
    #[arg(long, env = "VERBOSE", default_value_t = 0)]
    verbose: u8,

    /// Concurrent request count (queue depth)
    #[arg(long, env = "Q_DEPTH", default_value_t = 20)]
    depth: u32,

    /// I/O buffer size in bytes (power of two)
    #[arg(long, env = "BUFSIZE", default_value_t = 512)]
    bufsize: usize,

    /// Number of requests to execute
    #[arg(long, env = "REQUESTS", default_value_t = 262_144)]
    requests: u64,

    /// Seed for the random offset generator
    #[arg(long, env = "RANDSEED", default_value_t = 0)]
    seed: u64,

    /// Emit the metrics row as JSON instead of the fixed-width table
    #[arg(long)]
    json: bool,
}

impl Cli {
    fn validate(&self) -> Result<()> {
        if !self.bufsize.is_power_of_two() {
            bail!("BUFSIZE must be a power of two, got {}", self.bufsize);
        }
        if self.requests == 0 {
            bail!("REQUESTS must be non-zero");
        }
        Ok(())
    }

    fn print_config(&self) {
        eprintln!("{:<8} = {}", "VERBOSE", self.verbose);
        eprintln!("{:<8} = {}", "Q_DEPTH", self.depth);
        eprintln!("{:<8} = {}", "BUFSIZE", self.bufsize);
        eprintln!("{:<8} = {}", "REQUESTS", self.requests);
        eprintln!("{:<8} = {}", "RANDSEED", self.seed);
        eprintln!("{:<8} = {}", "BACKEND", BackendKind::from(self.backend));
    }
}

/// An opened input file and its usable length (truncated to whole buffers)
struct Target {
    file: File,
    usable: u64,
}

fn open_targets(paths: &[PathBuf], bufsize: usize) -> Result<Vec<Target>> {
    let mut targets = Vec::with_capacity(paths.len());
    for path in paths {
        let target = open_target(path, bufsize)
            .with_context(|| format!("cannot use input file {}", path.display()))?;
        targets.push(target);
    }
    Ok(targets)
}

fn open_target(path: &Path, bufsize: usize) -> Result<Target> {
    let file = OpenOptions::new()
        .read(true)
        .custom_flags(libc::O_DIRECT)
        .open(path)
        .context("open with O_DIRECT failed")?;
    let metadata = file.metadata().context("fstat failed")?;
    if !metadata.is_file() || metadata.len() == 0 {
        bail!("not a regular non-empty file");
    }
    let usable = metadata.len() / bufsize as u64 * bufsize as u64;
    if usable == 0 {
        bail!("file is smaller than one {bufsize}-byte buffer");
    }

    // Drop cached pages so the run measures the device, not the page cache.
    let ret = unsafe { libc::posix_fadvise(file.as_raw_fd(), 0, 0, libc::POSIX_FADV_DONTNEED) };
    if ret != 0 {
        bail!("posix_fadvise failed: {}", io::Error::from_raw_os_error(ret));
    }

    Ok(Target { file, usable })
}

/// Pick a random target and a buffer-aligned offset within it
fn next_read(rng: &mut Xoshiro256PlusPlus, targets: &[Target], bufsize: usize) -> (RawFd, u64) {
    let target = &targets[rng.gen_range(0..targets.len())];
    let blocks = target.usable / bufsize as u64;
    let offset = rng.gen_range(0..blocks) * bufsize as u64;
    (target.file.as_raw_fd(), offset)
}

fn run(cli: &Cli) -> Result<BenchReport> {
    let targets = open_targets(&cli.paths, cli.bufsize)?;
    let mut queue = IoQueue::new(cli.backend.into(), cli.depth)
        .context("queue initialization failed")?;
    let backend = queue.backend_name();
    let depth = queue.depth();
    let mut pool = BufferPool::new(depth as usize, cli.bufsize, BUFFER_ALIGNMENT);

    let histogram = Arc::new(Mutex::new(LatencyHistogram::new()));
    // Buffer indices handed back by completion callbacks, pending pool.put()
    let returned: Arc<Mutex<Vec<usize>>> = Arc::new(Mutex::new(Vec::with_capacity(depth as usize)));
    let failure: Arc<Mutex<Option<io::Error>>> = Arc::new(Mutex::new(None));

    let mut rng = Xoshiro256PlusPlus::seed_from_u64(cli.seed);
    let cpu_start = CpuTimes::process().context("getrusage failed")?;
    let started = Instant::now();

    let mut issued = 0u64;
    while issued < cli.requests {
        // Fill the queue until the buffer pool runs dry
        while issued < cli.requests {
            let index = match pool.get() {
                Some(index) => index,
                None => break,
            };
            let (fd, offset) = next_read(&mut rng, &targets, cli.bufsize);
            let histogram = Arc::clone(&histogram);
            let returned = Arc::clone(&returned);
            let failure = Arc::clone(&failure);
            let begin = Instant::now();
            queue.submit_read(fd, pool.ptr(index), cli.bufsize, offset, move |result, _buf| {
                match result {
                    Ok(_) => histogram.lock().unwrap().record(begin.elapsed()),
                    Err(err) => {
                        let mut slot = failure.lock().unwrap();
                        if slot.is_none() {
                            *slot = Some(err);
                        }
                    }
                }
                returned.lock().unwrap().push(index);
            })?;
            issued += 1;
        }

        // Blocking when no buffers remain; frees at least one
        queue.reap(1).context("reap failed")?;

        for index in returned.lock().unwrap().drain(..) {
            pool.put(index);
        }
        if let Some(err) = failure.lock().unwrap().take() {
            bail!("read failed: {err}");
        }
    }

    // Drain the tail of in-flight requests
    queue.destroy();
    if let Some(err) = failure.lock().unwrap().take() {
        bail!("read failed: {err}");
    }

    let elapsed = started.elapsed();
    let cpu = CpuTimes::process().context("getrusage failed")? - cpu_start;
    let mean_us = histogram.lock().unwrap().mean_us();

    Ok(BenchReport::new(
        backend,
        cli.requests,
        cli.bufsize,
        depth,
        elapsed,
        cpu.user,
        cpu.system,
        mean_us,
    ))
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    cli.validate()?;
    if cli.verbose != 0 {
        cli.print_config();
    }

    let report = run(&cli)?;

    if cli.json {
        println!("{}", report.to_json()?);
    } else {
        eprintln!("{}", BenchReport::header());
        println!("{}", report.row());
    }
    Ok(())
}
