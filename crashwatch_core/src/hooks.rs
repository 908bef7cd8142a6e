//! Temporary installation of the OS-wide crash hooks.
//!
//! The hooks are global to the host, not to the target process. Two runners
//! installing them at once would restore each other's values in the wrong
//! order, so only one runner per host may use them. Nothing here enforces
//! that; callers running several harnesses must serialize them.

use crate::hook_store::{HookKey, HookStore, HookStoreError, HookValue};
use log::{debug, error, warn};
use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;

pub const APPINIT_LOCATION: &str = r"HKLM\SOFTWARE\Microsoft\Windows NT\CurrentVersion\Windows";
pub const AEDEBUG_LOCATION: &str = r"HKLM\SOFTWARE\Microsoft\Windows NT\CurrentVersion\AeDebug";

/// Substituted when the running executable cannot be located.
pub const FALLBACK_EXECUTABLE: &str = r"C:\Program Files\crashwatch\crashwatch.exe";

/// Subcommand of the harness binary that the OS runs as JIT debugger.
pub const JIT_SUBCOMMAND: &str = "jit";

/// Separators in the `AppInit_DLLs` library list.
const LIBRARY_LIST_DELIMITERS: [char; 2] = [' ', ','];

#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("unable to set {key}={value}: {source}")]
    Write {
        key: HookKey,
        value: String,
        #[source]
        source: HookStoreError,
    },
}

/// Filesystem locations embedded in the hook values.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HookPaths {
    pub executable: PathBuf,
    pub hook_library: PathBuf,
}

impl HookPaths {
    pub fn discover() -> Self {
        Self::from_executable(std::env::current_exe())
    }

    pub fn from_executable(executable: io::Result<PathBuf>) -> Self {
        let executable = match executable {
            Ok(path) => path,
            Err(e) => {
                warn!(
                    "No path to own executable ({e}), using default of {FALLBACK_EXECUTABLE}"
                );
                PathBuf::from(FALLBACK_EXECUTABLE)
            }
        };
        let dir = executable
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_default();
        Self {
            hook_library: dir.join("hooks").join("hook.dll"),
            executable,
        }
    }

    /// The JIT debugger command line: this executable's `jit` subcommand.
    /// The OS substitutes the crashing pid for `%ld`.
    pub fn debugger_command(&self) -> String {
        format!(
            "\"{}\" {JIT_SUBCOMMAND} %ld",
            self.executable.display()
        )
    }
}

/// The form of `path` that survives `AppInit_DLLs` parsing.
///
/// The loader splits that value on spaces and commas, so the 8.3 short name
/// is used where the filesystem provides one. Returns `None`, with a warning,
/// when the path would still be split.
pub fn library_list_entry(path: &Path) -> Option<String> {
    let entry = short_path(path).unwrap_or_else(|| path.display().to_string());
    if entry.contains(LIBRARY_LIST_DELIMITERS) {
        warn!("Hook library path {entry:?} contains a list delimiter, not registering it");
        return None;
    }
    Some(entry)
}

#[cfg(windows)]
fn short_path(path: &Path) -> Option<String> {
    use std::ffi::OsString;
    use std::os::windows::ffi::{OsStrExt, OsStringExt};
    use windows_sys::Win32::Storage::FileSystem::GetShortPathNameW;

    let long: Vec<u16> = path
        .as_os_str()
        .encode_wide()
        .chain(std::iter::once(0))
        .collect();
    let mut buffer = vec![0u16; 260];
    loop {
        let capacity = u32::try_from(buffer.len()).ok()?;
        // SAFETY: `long` is NUL-terminated and `buffer` has `capacity`
        // writable units.
        let written =
            unsafe { GetShortPathNameW(long.as_ptr(), buffer.as_mut_ptr(), capacity) } as usize;
        match written {
            0 => return None,
            n if n < buffer.len() => {
                buffer.truncate(n);
                return OsString::from_wide(&buffer).into_string().ok();
            }
            needed => buffer.resize(needed, 0),
        }
    }
}

#[cfg(not(windows))]
fn short_path(_path: &Path) -> Option<String> {
    None
}

/// One value to install.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HookEntry {
    pub key: HookKey,
    /// Installed as `REG_SZ`.
    pub value: String,
}

/// The values to install, in installation order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HookPlan {
    entries: Vec<HookEntry>,
}

impl HookPlan {
    pub fn new(entries: Vec<HookEntry>) -> Self {
        Self { entries }
    }

    /// Library injection point, then debugger command, then auto-invoke.
    ///
    /// The library entry is left out when its path cannot be expressed in
    /// the loader's list syntax.
    pub fn jit_debugger(paths: &HookPaths) -> Self {
        let library = library_list_entry(&paths.hook_library).map(|value| HookEntry {
            key: HookKey::new(APPINIT_LOCATION, "AppInit_DLLs"),
            value,
        });
        let debugger = [
            HookEntry {
                key: HookKey::new(AEDEBUG_LOCATION, "Debugger"),
                value: paths.debugger_command(),
            },
            HookEntry {
                key: HookKey::new(AEDEBUG_LOCATION, "Auto"),
                value: "1".to_string(),
            },
        ];
        Self::new(library.into_iter().chain(debugger).collect())
    }

    pub fn entries(&self) -> &[HookEntry] {
        &self.entries
    }
}

/// What a value held before it was overwritten.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Prior {
    /// The value existed; restored with its original type and bytes.
    Value(HookValue),
    /// The value did not exist; restored by removing it.
    Absent,
}

impl fmt::Display for Prior {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Prior::Value(value) => fmt::Display::fmt(value, f),
            Prior::Absent => f.write_str("<absent>"),
        }
    }
}

/// A captured prior value, recorded just before its key was overwritten.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotEntry {
    pub key: HookKey,
    pub prior: Prior,
}

/// Prior values in mutation order. Values that could not be read are not
/// part of the snapshot.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RegistrySnapshot {
    pub entries: Vec<SnapshotEntry>,
}

/// Result of putting back one captured value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RestoreOutcome {
    Restored(HookKey),
    /// The prior value could not be read, so there was nothing to restore.
    SkippedNoPriorValue(HookKey),
    /// The restore write failed; the failure was logged.
    FailedLogged(HookKey),
}

#[derive(Debug)]
enum Capture {
    Recorded(SnapshotEntry),
    Unreadable(HookKey),
}

/// Installs a [`HookPlan`] into a [`HookStore`] for the duration of a guard.
pub struct HookInstaller<S: HookStore> {
    store: S,
    plan: HookPlan,
}

impl<S: HookStore> HookInstaller<S> {
    pub fn new(store: S, plan: HookPlan) -> Self {
        Self { store, plan }
    }

    /// Captures and overwrites every planned value.
    ///
    /// If any write fails, the values already written are put back before
    /// the error is returned.
    pub fn acquire(&mut self) -> Result<HookGuard<'_, S>, RegistryError> {
        let plan = &self.plan;
        let mut guard = HookGuard {
            store: &mut self.store,
            captures: Vec::with_capacity(plan.entries.len()),
            released: false,
        };
        for entry in &plan.entries {
            guard.capture(&entry.key);
            if let Err(source) = guard.store.write(&entry.key, &HookValue::string(&entry.value)) {
                error!("Unable to set registry: {}={}", entry.key, entry.value);
                // Nothing changed for this key.
                guard.captures.pop();
                let rollback = guard.release();
                debug!("Rolled back partial hook install: {rollback:?}");
                return Err(RegistryError::Write {
                    key: entry.key.clone(),
                    value: entry.value.clone(),
                    source,
                });
            }
            debug!("Set registry: {}={}", entry.key, entry.value);
        }
        Ok(guard)
    }
}

/// Live hook installation. Restores every overwritten value, last first,
/// on [`release`](HookGuard::release) or drop.
pub struct HookGuard<'a, S: HookStore> {
    store: &'a mut S,
    captures: Vec<Capture>,
    released: bool,
}

impl<S: HookStore> HookGuard<'_, S> {
    fn capture(&mut self, key: &HookKey) {
        let capture = match self.store.read(key) {
            Ok(Some(value)) => Capture::Recorded(SnapshotEntry {
                key: key.clone(),
                prior: Prior::Value(value),
            }),
            Ok(None) => Capture::Recorded(SnapshotEntry {
                key: key.clone(),
                prior: Prior::Absent,
            }),
            Err(e) => {
                // Nothing to restore, but not worth failing over.
                warn!("Unable to read prior value of {key}: {e}");
                Capture::Unreadable(key.clone())
            }
        };
        self.captures.push(capture);
    }

    pub fn snapshot(&self) -> RegistrySnapshot {
        RegistrySnapshot {
            entries: self
                .captures
                .iter()
                .filter_map(|c| match c {
                    Capture::Recorded(entry) => Some(entry.clone()),
                    Capture::Unreadable(_) => None,
                })
                .collect(),
        }
    }

    /// Restores in reverse mutation order. Failures are logged, never
    /// returned, so they cannot mask the result of the run.
    pub fn release(mut self) -> Vec<RestoreOutcome> {
        self.restore()
    }

    fn restore(&mut self) -> Vec<RestoreOutcome> {
        self.released = true;
        let captures = std::mem::take(&mut self.captures);
        captures
            .into_iter()
            .rev()
            .map(|capture| match capture {
                Capture::Unreadable(key) => RestoreOutcome::SkippedNoPriorValue(key),
                Capture::Recorded(SnapshotEntry { key, prior }) => {
                    let result = match &prior {
                        Prior::Value(value) => self.store.write(&key, value),
                        Prior::Absent => self.store.remove(&key),
                    };
                    match result {
                        Ok(()) => {
                            debug!("Restored registry: {key}={prior}");
                            RestoreOutcome::Restored(key)
                        }
                        Err(e) => {
                            warn!("Unable to restore registry: {key}={prior}: {e}");
                            RestoreOutcome::FailedLogged(key)
                        }
                    }
                }
            })
            .collect()
    }
}

impl<S: HookStore> Drop for HookGuard<'_, S> {
    fn drop(&mut self) {
        if !self.released {
            self.restore();
        }
    }
}
