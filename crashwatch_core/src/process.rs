use log::{debug, warn};
use parking_lot::Mutex;
use std::io;
use std::process::Command;

/// Places the spawned process at the head of its own kill group so that
/// [`KillSwitch::kill_group`] also reaches its descendants.
pub fn isolate_group(cmd: &mut Command) {
    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        cmd.process_group(0);
    }
    #[cfg(not(unix))]
    {
        let _ = cmd;
    }
}

#[derive(Debug, Default)]
struct KillState {
    reaped: bool,
    signalled: bool,
}

/// Force-terminates a launched process and all of its descendants.
///
/// Shared between the watchdog and the hang detector. Killing is idempotent
/// and becomes a no-op once the foreground has reaped the process, so a late
/// timer cannot signal an unrelated process that reused the id.
#[derive(Debug)]
pub struct KillSwitch {
    pid: u32,
    state: Mutex<KillState>,
}

impl KillSwitch {
    pub fn new(pid: u32) -> Self {
        Self {
            pid,
            state: Mutex::new(KillState::default()),
        }
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Returns `true` if this call delivered the kill.
    pub fn kill_group(&self) -> bool {
        let mut state = self.state.lock();
        if state.reaped {
            debug!("Process {} already reaped, not killing", self.pid);
            return false;
        }
        if state.signalled {
            return false;
        }
        debug!("kill group {}", self.pid);
        match kill_process_group(self.pid) {
            Ok(()) => {
                state.signalled = true;
                true
            }
            Err(e) => {
                warn!("Failed to kill process group {}: {e}", self.pid);
                false
            }
        }
    }

    /// Records that the process has been waited on; later kills are ignored.
    pub fn mark_reaped(&self) {
        self.state.lock().reaped = true;
    }

    pub fn was_signalled(&self) -> bool {
        self.state.lock().signalled
    }
}

#[cfg(unix)]
fn kill_process_group(pid: u32) -> io::Result<()> {
    use nix::errno::Errno;
    use nix::sys::signal::{Signal, killpg};
    use nix::unistd::Pid;

    let pgid = i32::try_from(pid)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "pid out of range"))?;
    match killpg(Pid::from_raw(pgid), Signal::SIGKILL) {
        // ESRCH: group already gone.
        Ok(()) | Err(Errno::ESRCH) => Ok(()),
        Err(errno) => Err(io::Error::from(errno)),
    }
}

#[cfg(windows)]
fn kill_process_group(pid: u32) -> io::Result<()> {
    use std::process::Stdio;

    let status = Command::new("taskkill")
        .args(["/F", "/T", "/PID", &pid.to_string()])
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()?;
    // taskkill exits 128 when the process no longer exists.
    if status.success() || status.code() == Some(128) {
        Ok(())
    } else {
        Err(io::Error::other(format!("taskkill exited with {status}")))
    }
}

#[cfg(not(any(unix, windows)))]
fn kill_process_group(_pid: u32) -> io::Result<()> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "process group kill is not supported on this platform",
    ))
}
