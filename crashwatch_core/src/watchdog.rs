use crate::cancel::CancelToken;
use log::{debug, warn};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

enum WatchdogState {
    Idle,
    Armed {
        token: CancelToken,
        handle: JoinHandle<()>,
    },
    Stopped,
}

/// A one-shot timer that runs a callback on its own thread unless cancelled
/// first.
///
/// `cancel` is idempotent and safe in every state: before `start`, after the
/// callback fired, or after an earlier `cancel`. Dropping an armed watchdog
/// cancels it.
pub struct Watchdog {
    state: WatchdogState,
    fired: Arc<AtomicBool>,
}

impl Default for Watchdog {
    fn default() -> Self {
        Self::new()
    }
}

impl Watchdog {
    pub fn new() -> Self {
        Self {
            state: WatchdogState::Idle,
            fired: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Arms the timer. A watchdog that is already armed is cancelled first so
    /// that at most one callback is ever pending.
    pub fn start<F>(&mut self, duration: Duration, on_expire: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.cancel();
        self.fired.store(false, Ordering::SeqCst);

        let token = CancelToken::new();
        let thread_token = token.clone();
        let fired = Arc::clone(&self.fired);
        debug!("Watchdog armed for {duration:?}");
        let handle = thread::spawn(move || {
            if thread_token.wait_timeout(duration) {
                return;
            }
            fired.store(true, Ordering::SeqCst);
            debug!("Watchdog expired after {duration:?}");
            on_expire();
        });
        self.state = WatchdogState::Armed { token, handle };
    }

    pub fn cancel(&mut self) {
        match std::mem::replace(&mut self.state, WatchdogState::Stopped) {
            WatchdogState::Armed { token, handle } => {
                debug!("Canceling watchdog");
                token.cancel();
                if handle.join().is_err() {
                    warn!("Watchdog callback panicked");
                }
            }
            WatchdogState::Idle => self.state = WatchdogState::Idle,
            WatchdogState::Stopped => {}
        }
    }

    /// Whether the callback ran (or is running) for the most recent `start`.
    pub fn has_fired(&self) -> bool {
        self.fired.load(Ordering::SeqCst)
    }
}

impl Drop for Watchdog {
    fn drop(&mut self) {
        self.cancel();
    }
}
