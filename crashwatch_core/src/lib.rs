pub mod arch;
pub mod cancel;
pub mod classify;
pub mod command;
pub mod config;
pub mod hang;
pub mod hook_store;
pub mod hooks;
pub mod mutator;
pub mod oracle;
pub mod process;
pub mod runner;
pub mod watchdog;

pub use arch::{ArchitectureError, HeaderProbe, WordWidthProbe};
pub use classify::{EXCEPTION_CATALOG, Verdict, classify};
pub use command::{CommandError, CommandTemplate};
pub use config::{ConfigError, HarnessConfig};
pub use hang::{CpuSampler, HangDetector, HangTracker};
pub use hook_store::{HookKey, HookStore, HookValue, MemoryHookStore};
#[cfg(windows)]
pub use hook_store::RegistryHookStore;
pub use hooks::{HookInstaller, HookPaths, HookPlan, RegistryError, RestoreOutcome};
pub use mutator::{FlipSingleByteMutator, Mutator, MutatorError, WaveMutator};
pub use oracle::{BugReport, CrashOracle, Oracle};
pub use runner::{CommandRunner, Outcome, RunConfiguration, RunResult, Runner, RunnerError};
pub use watchdog::Watchdog;
