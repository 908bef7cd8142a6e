use crate::arch::{self, ArchitectureError, HeaderProbe, WordWidthProbe};
use crate::classify::{Verdict, classify, termination_code};
use crate::command::{CommandError, CommandTemplate, display_argv};
use crate::hang::{CpuSampler, HangDetector, SAMPLE_INTERVAL, platform_sampler};
use crate::hook_store::HookStore;
use crate::hooks::{HookInstaller, HookPlan, RegistryError};
use crate::process::{KillSwitch, isolate_group};
use crate::watchdog::Watchdog;
use log::{debug, info};
use std::ffi::OsString;
use std::io;
use std::path::PathBuf;
use std::process::{Command, ExitStatus, Stdio};
use std::sync::Arc;
use std::sync::mpsc::{self, Receiver};
use std::thread;
use std::time::{Duration, Instant};
use thiserror::Error;

/// Per-run switches.
#[derive(Debug, Clone, PartialEq)]
pub struct RunOptions {
    /// Kill the target when it goes idle after having been busy.
    pub watch_cpu: bool,
    /// Budget after which the target and its descendants are killed.
    pub timeout: Duration,
    /// Send the target's stdout and stderr to the null device.
    pub hide_output: bool,
    /// Check the program's word width against `expected_bits` before launch.
    pub verify_architecture: bool,
    /// 32 or 64.
    pub expected_bits: u32,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            watch_cpu: false,
            timeout: Duration::from_secs(5),
            hide_output: true,
            verify_architecture: true,
            expected_bits: arch::host_bits(),
        }
    }
}

/// Everything needed to execute the target once against one fuzzed file.
#[derive(Debug, Clone, PartialEq)]
pub struct RunConfiguration {
    pub command: CommandTemplate,
    pub fuzzed_file: PathBuf,
    pub working_dir: PathBuf,
    pub options: RunOptions,
}

/// How a run reached its terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    ExitedNormal,
    KilledTimeout,
    KilledHang,
}

/// The single observable product of a run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunResult {
    /// Termination code reinterpreted as unsigned 32-bit.
    pub raw_code: u32,
    /// Set iff `raw_code` is in the exception catalog.
    pub crash: bool,
    pub exception: Option<&'static str>,
    pub outcome: Outcome,
    pub elapsed: Duration,
}

/// Reasons a run could not produce a [`RunResult`].
///
/// Every variant except `Wait` means the target never ran. None of them
/// counts as a crash.
#[derive(Error, Debug)]
pub enum RunnerError {
    #[error(transparent)]
    Command(#[from] CommandError),
    #[error(transparent)]
    Architecture(#[from] ArchitectureError),
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error("failed to create working directory {path:?}: {source}")]
    WorkingDir {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to spawn command '{command}': {source}")]
    Spawn {
        command: String,
        #[source]
        source: io::Error,
    },
    #[error("failed to wait for target: {0}")]
    Wait(io::Error),
}

/// Executes one fuzzed input and reports how the target terminated.
pub trait Runner {
    fn run(&mut self, config: &RunConfiguration) -> Result<RunResult, RunnerError>;
}

enum RaceEvent {
    Exited(io::Result<ExitStatus>),
    TimedOut,
    HangDetected,
}

/// Runs the target as a child process, racing it against a watchdog and,
/// optionally, a hang detector. With debug hooks configured, the OS-wide
/// crash hooks are installed for the duration of each run.
pub struct CommandRunner {
    probe: Box<dyn WordWidthProbe>,
    hooks: Option<HookInstaller<Box<dyn HookStore>>>,
    sampler: fn() -> Box<dyn CpuSampler>,
    sample_interval: Duration,
}

impl Default for CommandRunner {
    fn default() -> Self {
        Self::new()
    }
}

impl CommandRunner {
    pub fn new() -> Self {
        Self {
            probe: Box::new(HeaderProbe),
            hooks: None,
            sampler: platform_sampler,
            sample_interval: SAMPLE_INTERVAL,
        }
    }

    pub fn with_probe(mut self, probe: Box<dyn WordWidthProbe>) -> Self {
        self.probe = probe;
        self
    }

    pub fn with_debug_hooks(mut self, store: Box<dyn HookStore>, plan: HookPlan) -> Self {
        self.hooks = Some(HookInstaller::new(store, plan));
        self
    }

    pub fn with_sampler(mut self, sampler: fn() -> Box<dyn CpuSampler>) -> Self {
        self.sampler = sampler;
        self
    }

    pub fn with_sample_interval(mut self, interval: Duration) -> Self {
        self.sample_interval = interval;
        self
    }
}

impl Runner for CommandRunner {
    fn run(&mut self, config: &RunConfiguration) -> Result<RunResult, RunnerError> {
        let argv = config.command.render(&config.fuzzed_file);
        debug!("Command: {}", display_argv(&argv));

        if config.options.verify_architecture {
            let program = config.command.resolve_program()?;
            arch::verify(self.probe.as_ref(), &program, config.options.expected_bits)?;
        }

        std::fs::create_dir_all(&config.working_dir).map_err(|source| {
            RunnerError::WorkingDir {
                path: config.working_dir.clone(),
                source,
            }
        })?;

        let sampler = self.sampler;
        let interval = self.sample_interval;
        let guard = match self.hooks.as_mut() {
            Some(installer) => Some(installer.acquire()?),
            None => None,
        };

        let result = launch_and_race(&argv, config, sampler, interval);

        if let Some(guard) = guard {
            let outcomes = guard.release();
            debug!("Hook restore: {outcomes:?}");
        }
        result
    }
}

fn launch_and_race(
    argv: &[OsString],
    config: &RunConfiguration,
    sampler: fn() -> Box<dyn CpuSampler>,
    interval: Duration,
) -> Result<RunResult, RunnerError> {
    let options = &config.options;
    debug!("Running: {} in {:?}", display_argv(argv), config.working_dir);

    let mut cmd = Command::new(&argv[0]);
    cmd.args(&argv[1..]).current_dir(&config.working_dir);
    if options.hide_output {
        cmd.stdout(Stdio::null()).stderr(Stdio::null());
    }
    isolate_group(&mut cmd);

    let started = Instant::now();
    let mut child = cmd.spawn().map_err(|source| RunnerError::Spawn {
        command: display_argv(argv),
        source,
    })?;
    let switch = Arc::new(KillSwitch::new(child.id()));
    let (tx, rx) = mpsc::channel();

    let waiter = {
        let tx = tx.clone();
        let switch = Arc::clone(&switch);
        thread::spawn(move || {
            let status = child.wait();
            switch.mark_reaped();
            let _ = tx.send(RaceEvent::Exited(status));
        })
    };

    debug!("...Timer: {:?}", options.timeout);
    let mut watchdog = Watchdog::new();
    {
        let tx = tx.clone();
        let switch = Arc::clone(&switch);
        watchdog.start(options.timeout, move || {
            if switch.kill_group() {
                let _ = tx.send(RaceEvent::TimedOut);
            }
        });
    }

    let mut detector = options.watch_cpu.then(|| {
        let tx = tx.clone();
        let kill = Arc::clone(&switch);
        HangDetector::spawn(switch.pid(), sampler(), interval, move || {
            if kill.kill_group() {
                let _ = tx.send(RaceEvent::HangDetected);
            }
        })
    });
    drop(tx);

    let first = rx.recv();
    // Whatever won, nothing else may fire from here on.
    debug!("...timer stop");
    watchdog.cancel();
    if let Some(detector) = detector.as_mut() {
        detector.stop();
    }

    let (outcome, status) = match first {
        Ok(RaceEvent::Exited(status)) => (Outcome::ExitedNormal, status),
        Ok(RaceEvent::TimedOut) => (Outcome::KilledTimeout, wait_for_exit(&rx)),
        Ok(RaceEvent::HangDetected) => (Outcome::KilledHang, wait_for_exit(&rx)),
        Err(_) => (
            Outcome::ExitedNormal,
            Err(io::Error::other("process monitor ended without reporting")),
        ),
    };
    let elapsed = started.elapsed();
    let _ = waiter.join();
    let status = status.map_err(RunnerError::Wait)?;

    let raw_code = termination_code(&status);
    let verdict = classify(raw_code);
    debug!("...Returncode: raw={status:?} cast=0x{raw_code:08X}");
    let result = RunResult {
        raw_code,
        crash: verdict.is_crash(),
        exception: match verdict {
            Verdict::Crash(entry) => Some(entry.name),
            Verdict::NotCrash => None,
        },
        outcome,
        elapsed,
    };
    if result.crash {
        info!(
            "Target crashed with 0x{raw_code:08X} ({})",
            result.exception.unwrap_or_default()
        );
    }
    debug!("...Saw_crash: {} ({outcome:?})", result.crash);
    Ok(result)
}

fn wait_for_exit(rx: &Receiver<RaceEvent>) -> io::Result<ExitStatus> {
    loop {
        match rx.recv() {
            Ok(RaceEvent::Exited(status)) => return status,
            Ok(_) => continue,
            Err(_) => return Err(io::Error::other("process monitor ended without reporting")),
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::hook_store::{HookKey, MemoryHookStore};
    use crate::hooks::{AEDEBUG_LOCATION, HookPaths};
    use std::path::Path;

    fn target(name: &str) -> PathBuf {
        let path = PathBuf::from(env!("CARGO_MANIFEST_DIR"))
            .join("../test_targets")
            .join(name);
        assert!(path.exists(), "Test target missing: {path:?}");
        path
    }

    fn config(script: &str, fuzzed_file: &Path, workdir: &Path) -> RunConfiguration {
        RunConfiguration {
            command: CommandTemplate::new(vec![
                "sh".to_string(),
                target(script).to_string_lossy().into_owned(),
                "{}".to_string(),
            ])
            .unwrap(),
            fuzzed_file: fuzzed_file.to_path_buf(),
            working_dir: workdir.to_path_buf(),
            options: RunOptions {
                timeout: Duration::from_secs(10),
                verify_architecture: false,
                ..RunOptions::default()
            },
        }
    }

    fn fixed_hook_paths() -> HookPaths {
        HookPaths::from_executable(Ok(PathBuf::from("/opt/cw/crashwatch")))
    }

    fn scratch() -> (tempfile::TempDir, PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let fuzzed = dir.path().join("fuzzed.bin");
        std::fs::write(&fuzzed, b"GOOD").unwrap();
        (dir, fuzzed)
    }

    #[test]
    fn clean_exit_is_not_a_crash() {
        let (dir, fuzzed) = scratch();
        let result = CommandRunner::new()
            .run(&config("exit_ok.sh", &fuzzed, dir.path()))
            .unwrap();
        assert_eq!(result.raw_code, 0);
        assert!(!result.crash);
        assert_eq!(result.outcome, Outcome::ExitedNormal);
        assert_eq!(result.exception, None);
    }

    #[test]
    fn nonzero_exit_outside_catalog_is_not_a_crash() {
        let (dir, fuzzed) = scratch();
        let result = CommandRunner::new()
            .run(&config("exit_code.sh", &fuzzed, dir.path()))
            .unwrap();
        assert_eq!(result.raw_code, 3);
        assert!(!result.crash);
    }

    #[test]
    fn access_violation_is_a_crash() {
        let (dir, fuzzed) = scratch();
        let result = CommandRunner::new()
            .run(&config("segv.sh", &fuzzed, dir.path()))
            .unwrap();
        assert_eq!(result.raw_code, 0xC000_0005);
        assert!(result.crash);
        assert_eq!(result.exception, Some("STATUS_ACCESS_VIOLATION"));
        assert_eq!(result.outcome, Outcome::ExitedNormal);
    }

    #[test]
    fn fuzzed_file_reaches_the_target() {
        let (dir, fuzzed) = scratch();
        let mut runner = CommandRunner::new();
        let cfg = config("crash_on_marker.sh", &fuzzed, dir.path());
        assert!(!runner.run(&cfg).unwrap().crash);

        std::fs::write(&fuzzed, b"xxCRASHxx").unwrap();
        assert!(runner.run(&cfg).unwrap().crash);
    }

    #[test]
    fn overrunning_target_is_killed_on_timeout() {
        let (dir, fuzzed) = scratch();
        let mut cfg = config("sleep.sh", &fuzzed, dir.path());
        cfg.options.timeout = Duration::from_secs(1);
        let result = CommandRunner::new().run(&cfg).unwrap();
        assert_eq!(result.outcome, Outcome::KilledTimeout);
        assert!(!result.crash);
        assert!(result.elapsed >= Duration::from_millis(900));
        assert!(result.elapsed < Duration::from_secs(4), "{:?}", result.elapsed);
    }

    #[test]
    fn timeout_kills_descendants_too() {
        let (dir, fuzzed) = scratch();
        let mut cfg = config("spawn_children.sh", &fuzzed, dir.path());
        cfg.options.timeout = Duration::from_millis(500);
        let result = CommandRunner::new().run(&cfg).unwrap();
        assert_eq!(result.outcome, Outcome::KilledTimeout);
        // A surviving grandchild would write this after two seconds.
        thread::sleep(Duration::from_secs(3));
        assert!(!dir.path().join("orphan_survived").exists());
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn idle_after_activity_is_killed_as_hang() {
        let (dir, fuzzed) = scratch();
        let mut cfg = config("busy_then_idle.sh", &fuzzed, dir.path());
        cfg.options.watch_cpu = true;
        cfg.options.timeout = Duration::from_secs(20);
        let result = CommandRunner::new().run(&cfg).unwrap();
        assert_eq!(result.outcome, Outcome::KilledHang);
        assert!(!result.crash);
        assert!(result.elapsed < Duration::from_secs(15), "{:?}", result.elapsed);
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn busy_target_still_times_out_with_cpu_watch() {
        let (dir, fuzzed) = scratch();
        let mut cfg = config("spin.sh", &fuzzed, dir.path());
        cfg.options.watch_cpu = true;
        cfg.options.timeout = Duration::from_secs(1);
        let result = CommandRunner::new().run(&cfg).unwrap();
        assert_eq!(result.outcome, Outcome::KilledTimeout);
    }

    #[test]
    fn quick_exit_under_cpu_watch_is_normal() {
        let (dir, fuzzed) = scratch();
        let mut cfg = config("exit_ok.sh", &fuzzed, dir.path());
        cfg.options.watch_cpu = true;
        let result = CommandRunner::new().run(&cfg).unwrap();
        assert_eq!(result.outcome, Outcome::ExitedNormal);
        assert!(!result.crash);
    }

    #[test]
    fn working_directory_is_created() {
        let (dir, fuzzed) = scratch();
        let workdir = dir.path().join("nested").join("work");
        let result = CommandRunner::new()
            .run(&config("touch_marker.sh", &fuzzed, &workdir))
            .unwrap();
        assert_eq!(result.raw_code, 0);
        assert!(workdir.join("ran").exists());
    }

    #[test]
    fn missing_program_is_a_spawn_error() {
        let (dir, fuzzed) = scratch();
        let mut cfg = config("exit_ok.sh", &fuzzed, dir.path());
        cfg.command =
            CommandTemplate::new(vec!["./this_command_does_not_exist_ever_12345".into()]).unwrap();
        match CommandRunner::new().run(&cfg) {
            Err(RunnerError::Spawn { command, .. }) => {
                assert!(command.contains("this_command_does_not_exist"))
            }
            other => panic!("Expected spawn error, got {other:?}"),
        }
    }

    struct ReportingProbe(&'static str);

    impl WordWidthProbe for ReportingProbe {
        fn word_width(&self, _program: &Path) -> Result<String, ArchitectureError> {
            Ok(self.0.to_string())
        }
    }

    #[test]
    fn architecture_mismatch_aborts_before_launch() {
        let (dir, fuzzed) = scratch();
        let workdir = dir.path().join("work");
        let mut cfg = config("touch_marker.sh", &fuzzed, &workdir);
        cfg.options.verify_architecture = true;
        cfg.options.expected_bits = 64;
        let mut runner = CommandRunner::new().with_probe(Box::new(ReportingProbe("32bit")));
        assert!(matches!(
            runner.run(&cfg),
            Err(RunnerError::Architecture(ArchitectureError::Mismatch { .. }))
        ));
        assert!(!workdir.join("ran").exists());

        cfg.options.expected_bits = 16;
        assert!(matches!(
            runner.run(&cfg),
            Err(RunnerError::Architecture(
                ArchitectureError::InvalidExpectation(16)
            ))
        ));
    }

    #[test]
    fn host_shell_passes_header_verification() {
        let (dir, fuzzed) = scratch();
        let mut cfg = config("exit_ok.sh", &fuzzed, dir.path());
        cfg.options.verify_architecture = true;
        let result = CommandRunner::new().run(&cfg).unwrap();
        assert_eq!(result.raw_code, 0);
    }

    #[test]
    fn debug_hooks_are_restored_after_the_run() {
        let (dir, fuzzed) = scratch();
        let debugger = HookKey::new(AEDEBUG_LOCATION, "Debugger");
        let store = MemoryHookStore::new().with_value(debugger.clone(), "\"drwtsn32\" -p %ld");
        let before = store.values();
        let plan = HookPlan::jit_debugger(&fixed_hook_paths());
        let mut runner = CommandRunner::new().with_debug_hooks(Box::new(store.clone()), plan);

        let result = runner.run(&config("segv.sh", &fuzzed, dir.path())).unwrap();
        assert!(result.crash);
        assert_eq!(store.values(), before);
        // Three installs followed by three restores.
        assert_eq!(store.journal().len(), 6);
    }

    #[test]
    fn failed_hook_install_aborts_before_launch() {
        let (dir, fuzzed) = scratch();
        let workdir = dir.path().join("work");
        let auto = HookKey::new(AEDEBUG_LOCATION, "Auto");
        let store = MemoryHookStore::new().deny_writes(auto);
        let plan = HookPlan::jit_debugger(&fixed_hook_paths());
        let mut runner = CommandRunner::new().with_debug_hooks(Box::new(store.clone()), plan);

        assert!(matches!(
            runner.run(&config("touch_marker.sh", &fuzzed, &workdir)),
            Err(RunnerError::Registry(_))
        ));
        assert!(!workdir.join("ran").exists());
        assert!(store.values().is_empty());
    }
}
