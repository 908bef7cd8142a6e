use crate::cancel::CancelToken;
use log::{debug, info, warn};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use thiserror::Error;

/// How often the target's CPU time is sampled.
pub const SAMPLE_INTERVAL: Duration = Duration::from_millis(200);

/// Utilization (in percent) at or below which a sample counts as idle.
pub const IDLE_THRESHOLD_PERCENT: f64 = 1e-10;

#[derive(Error, Debug)]
pub enum SampleError {
    #[error("failed to read CPU counters for process {pid}: {source}")]
    Io {
        pid: u32,
        #[source]
        source: std::io::Error,
    },
    #[error("malformed CPU counters for process {pid}: {reason}")]
    Parse { pid: u32, reason: String },
    /// The process has terminated, possibly not yet reaped.
    #[error("process {pid} has exited")]
    Exited { pid: u32 },
    #[error("CPU sampling is not supported on this platform")]
    Unsupported,
}

/// Cumulative CPU time of a process at a moment in time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CpuSample {
    pub cpu_time: Duration,
    pub taken_at: Instant,
}

/// Reads cumulative CPU time for a process id.
pub trait CpuSampler: Send {
    fn sample(&mut self, pid: u32) -> Result<CpuSample, SampleError>;
}

/// Percentage of one CPU used between two samples.
///
/// Without a previous sample, or when no wall time elapsed, the result is 0.
pub fn utilization(previous: Option<&CpuSample>, current: &CpuSample) -> f64 {
    let Some(previous) = previous else {
        return 0.0;
    };
    let wall = current.taken_at.saturating_duration_since(previous.taken_at);
    if wall.is_zero() {
        return 0.0;
    }
    let cpu = current.cpu_time.saturating_sub(previous.cpu_time);
    cpu.as_secs_f64() / wall.as_secs_f64() * 100.0
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HangState {
    NotStarted,
    Active,
    IdleAfterActive,
}

/// Decides from a stream of utilization readings whether a process has
/// stalled. A process that has never shown activity is never reported.
#[derive(Debug)]
pub struct HangTracker {
    state: HangState,
    kill_requested: bool,
}

impl Default for HangTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl HangTracker {
    pub fn new() -> Self {
        Self {
            state: HangState::NotStarted,
            kill_requested: false,
        }
    }

    pub fn state(&self) -> HangState {
        self.state
    }

    /// Feeds one reading; returns `true` exactly once, on the reading that
    /// moves the tracker into `IdleAfterActive`.
    pub fn observe(&mut self, percent: f64) -> bool {
        if self.kill_requested {
            return false;
        }
        let idle = percent < IDLE_THRESHOLD_PERCENT;
        self.state = match (self.state, idle) {
            (HangState::NotStarted, true) => HangState::NotStarted,
            (_, false) => HangState::Active,
            (HangState::Active | HangState::IdleAfterActive, true) => HangState::IdleAfterActive,
        };
        if self.state == HangState::IdleAfterActive {
            self.kill_requested = true;
        }
        self.kill_requested
    }
}

/// Background sampler that calls `on_hang` once the target goes idle after
/// having been busy.
pub struct HangDetector {
    token: CancelToken,
    handle: Option<JoinHandle<()>>,
}

impl HangDetector {
    pub fn spawn<S, F>(pid: u32, mut sampler: S, interval: Duration, on_hang: F) -> Self
    where
        S: CpuSampler + 'static,
        F: FnOnce() + Send + 'static,
    {
        let token = CancelToken::new();
        let thread_token = token.clone();
        let handle = thread::spawn(move || {
            let mut tracker = HangTracker::new();
            let mut previous: Option<CpuSample> = None;
            while !thread_token.is_cancelled() {
                match sampler.sample(pid) {
                    Ok(sample) => {
                        let percent = utilization(previous.as_ref(), &sample);
                        previous = Some(sample);
                        debug!("Process {pid} CPU usage: {percent}");
                        if tracker.observe(percent) {
                            info!("Killing {pid} due to CPU inactivity");
                            on_hang();
                            return;
                        }
                    }
                    Err(SampleError::Exited { .. }) => {
                        // A zombie's CPU time no longer moves; its idleness is not a hang.
                        debug!("Process {pid} exited, stopping CPU watch");
                        return;
                    }
                    Err(SampleError::Unsupported) => {
                        warn!("CPU sampling unsupported, hang detection disabled for {pid}");
                        return;
                    }
                    Err(e) => debug!("Skipping CPU sample: {e}"),
                }
                if thread_token.wait_timeout(interval) {
                    break;
                }
            }
        });
        Self {
            token,
            handle: Some(handle),
        }
    }

    /// Stops sampling and waits for the sampling thread. Idempotent.
    pub fn stop(&mut self) {
        self.token.cancel();
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                warn!("Hang detector thread panicked");
            }
        }
    }
}

impl Drop for HangDetector {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Extracts utime + stime (in clock ticks) from a `/proc/<pid>/stat` line.
pub fn parse_stat_cpu_ticks(contents: &str) -> Result<u64, String> {
    let fields = stat_fields(contents)?;
    // fields[0] is the state (field 3); utime and stime are fields 14 and 15.
    let field = |index: usize, name: &str| -> Result<u64, String> {
        fields
            .get(index)
            .ok_or_else(|| format!("missing {name}"))?
            .parse::<u64>()
            .map_err(|e| format!("bad {name}: {e}"))
    };
    Ok(field(11, "utime")? + field(12, "stime")?)
}

/// Whether a `/proc/<pid>/stat` line describes a zombie or dead process.
pub fn stat_reports_exited(contents: &str) -> bool {
    stat_fields(contents)
        .ok()
        .and_then(|fields| fields.first().copied())
        .is_some_and(|state| matches!(state, "Z" | "X" | "x"))
}

fn stat_fields(contents: &str) -> Result<Vec<&str>, String> {
    // comm is parenthesised and may itself contain spaces or parentheses.
    let close = contents
        .rfind(')')
        .ok_or_else(|| "missing command terminator".to_string())?;
    Ok(contents[close + 1..].split_whitespace().collect())
}

/// Samples CPU time from procfs.
#[cfg(target_os = "linux")]
#[derive(Debug)]
pub struct ProcfsSampler {
    ticks_per_second: u64,
}

#[cfg(target_os = "linux")]
impl Default for ProcfsSampler {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(target_os = "linux")]
impl ProcfsSampler {
    pub fn new() -> Self {
        use nix::unistd::{SysconfVar, sysconf};

        let ticks = sysconf(SysconfVar::CLK_TCK)
            .ok()
            .flatten()
            .and_then(|t| u64::try_from(t).ok())
            .filter(|t| *t > 0)
            .unwrap_or(100);
        Self {
            ticks_per_second: ticks,
        }
    }
}

#[cfg(target_os = "linux")]
impl CpuSampler for ProcfsSampler {
    fn sample(&mut self, pid: u32) -> Result<CpuSample, SampleError> {
        let contents = match std::fs::read_to_string(format!("/proc/{pid}/stat")) {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(SampleError::Exited { pid });
            }
            Err(source) => return Err(SampleError::Io { pid, source }),
        };
        let taken_at = Instant::now();
        if stat_reports_exited(&contents) {
            return Err(SampleError::Exited { pid });
        }
        let ticks =
            parse_stat_cpu_ticks(&contents).map_err(|reason| SampleError::Parse { pid, reason })?;
        let nanos = u128::from(ticks) * 1_000_000_000 / u128::from(self.ticks_per_second);
        Ok(CpuSample {
            cpu_time: Duration::from_nanos(u64::try_from(nanos).unwrap_or(u64::MAX)),
            taken_at,
        })
    }
}

/// Stand-in for platforms without a sampling backend.
#[derive(Debug, Default)]
pub struct UnsupportedSampler;

impl CpuSampler for UnsupportedSampler {
    fn sample(&mut self, _pid: u32) -> Result<CpuSample, SampleError> {
        Err(SampleError::Unsupported)
    }
}

/// The sampling backend for the host platform.
pub fn platform_sampler() -> Box<dyn CpuSampler> {
    #[cfg(target_os = "linux")]
    {
        Box::new(ProcfsSampler::new())
    }
    #[cfg(not(target_os = "linux"))]
    {
        Box::new(UnsupportedSampler)
    }
}

impl CpuSampler for Box<dyn CpuSampler> {
    fn sample(&mut self, pid: u32) -> Result<CpuSample, SampleError> {
        (**self).sample(pid)
    }
}
