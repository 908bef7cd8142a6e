use crate::arch;
use crate::command::{CommandError, CommandTemplate};
use crate::runner::{RunConfiguration, RunOptions};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file at {path:?}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse TOML from config file {path:?}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("timeout-secs must be a positive number of seconds, got {0}")]
    Timeout(f64),
    #[error("range-list entry [{start}, {end}] ends before it starts")]
    InvertedRange { start: usize, end: usize },
    #[error(transparent)]
    Command(#[from] CommandError),
}

/// The `[runner]` table: how each fuzzed file is executed.
#[derive(Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct RunnerSettings {
    pub command: Vec<String>,
    #[serde(default = "default_working_dir")]
    pub working_dir: PathBuf,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: f64,
    #[serde(default)]
    pub watch_cpu: bool,
    #[serde(default = "default_true")]
    pub hide_output: bool,
    #[serde(default = "default_true")]
    pub verify_architecture: bool,
    #[serde(default = "arch::host_bits")]
    pub expected_bits: u32,
    #[serde(default)]
    pub debug_hooks: bool,
}

pub fn default_working_dir() -> PathBuf {
    PathBuf::from("./.crashwatch_work")
}

fn default_timeout_secs() -> f64 {
    5.0
}

fn default_true() -> bool {
    true
}

impl RunnerSettings {
    pub fn timeout(&self) -> Result<Duration, ConfigError> {
        if self.timeout_secs.is_nan() || self.timeout_secs <= 0.0 {
            return Err(ConfigError::Timeout(self.timeout_secs));
        }
        Duration::try_from_secs_f64(self.timeout_secs)
            .map_err(|_| ConfigError::Timeout(self.timeout_secs))
    }

    /// The immutable per-run configuration for one fuzzed file.
    pub fn to_run_configuration(&self, fuzzed_file: &Path) -> Result<RunConfiguration, ConfigError> {
        Ok(RunConfiguration {
            command: CommandTemplate::new(self.command.clone())?,
            fuzzed_file: fuzzed_file.to_path_buf(),
            working_dir: self.working_dir.clone(),
            options: RunOptions {
                watch_cpu: self.watch_cpu,
                timeout: self.timeout()?,
                hide_output: self.hide_output,
                verify_architecture: self.verify_architecture,
                expected_bits: self.expected_bits,
            },
        })
    }
}

#[derive(Deserialize, Debug, Clone, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum MutatorKind {
    #[default]
    Wave,
    FlipByte,
}

/// The `[fuzzer]` table: what to mutate and for how long.
#[derive(Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct FuzzerSettings {
    /// File every candidate is derived from.
    pub seed_file: PathBuf,
    /// Upper bound on runs; the wave mutator may end the loop sooner.
    #[serde(default = "default_iterations")]
    pub iterations: u64,
    #[serde(default)]
    pub mutator: MutatorKind,
    /// Inclusive byte ranges the wave mutator is limited to.
    #[serde(default)]
    pub range_list: Option<Vec<(usize, usize)>>,
    /// Seed for the mutation RNG, so a campaign can be replayed.
    #[serde(default)]
    pub rng_seed: u64,
}

pub fn default_iterations() -> u64 {
    1000
}

#[derive(Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct HarnessConfig {
    pub runner: RunnerSettings,
    pub fuzzer: FuzzerSettings,
}

impl HarnessConfig {
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Self = toml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Checks constraints serde cannot express.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if let Some(&(start, end)) = self
            .fuzzer
            .range_list
            .iter()
            .flatten()
            .find(|(start, end)| end < start)
        {
            return Err(ConfigError::InvertedRange { start, end });
        }
        self.runner.timeout()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const FULL: &str = r#"
[runner]
command = ["viewer", "--open", "{}"]
working-dir = "/tmp/cw"
timeout-secs = 2.5
watch-cpu = true
hide-output = false
verify-architecture = false
expected-bits = 32
debug-hooks = true

[fuzzer]
seed-file = "seeds/a.pdf"
iterations = 42
mutator = "flip-byte"
range-list = [[0, 3], [10, 12]]
rng-seed = 7
"#;

    #[test]
    fn parses_full_config() {
        let config: HarnessConfig = toml::from_str(FULL).unwrap();
        assert_eq!(config.runner.command, vec!["viewer", "--open", "{}"]);
        assert_eq!(config.runner.working_dir, PathBuf::from("/tmp/cw"));
        assert!(config.runner.watch_cpu);
        assert!(!config.runner.hide_output);
        assert!(config.runner.debug_hooks);
        assert_eq!(config.runner.expected_bits, 32);
        assert_eq!(config.fuzzer.iterations, 42);
        assert_eq!(config.fuzzer.mutator, MutatorKind::FlipByte);
        assert_eq!(config.fuzzer.range_list, Some(vec![(0, 3), (10, 12)]));

        let run = config
            .runner
            .to_run_configuration(Path::new("/tmp/cw/fuzzed.pdf"))
            .unwrap();
        assert_eq!(run.options.timeout, Duration::from_millis(2500));
        assert_eq!(run.fuzzed_file, PathBuf::from("/tmp/cw/fuzzed.pdf"));
        assert!(!run.options.verify_architecture);
    }

    #[test]
    fn applies_defaults() {
        let config: HarnessConfig = toml::from_str(
            "[runner]\ncommand = [\"t\", \"{}\"]\n[fuzzer]\nseed-file = \"s\"\n",
        )
        .unwrap();
        assert_eq!(config.runner.timeout_secs, 5.0);
        assert!(!config.runner.watch_cpu);
        assert!(config.runner.hide_output);
        assert!(config.runner.verify_architecture);
        assert!(!config.runner.debug_hooks);
        assert_eq!(config.runner.expected_bits, arch::host_bits());
        assert_eq!(config.runner.working_dir, default_working_dir());
        assert_eq!(config.fuzzer.iterations, default_iterations());
        assert_eq!(config.fuzzer.mutator, MutatorKind::Wave);
    }

    #[test]
    fn rejects_unknown_fields() {
        let err = toml::from_str::<HarnessConfig>(
            "[runner]\ncommand = [\"t\"]\nbogus = 1\n[fuzzer]\nseed-file = \"s\"\n",
        );
        assert!(err.is_err());
    }

    #[test]
    fn rejects_non_positive_timeouts() {
        let mut config: HarnessConfig = toml::from_str(FULL).unwrap();
        for bad in [0.0, -1.0, f64::NAN] {
            config.runner.timeout_secs = bad;
            assert!(matches!(
                config.runner.to_run_configuration(Path::new("f")),
                Err(ConfigError::Timeout(_))
            ));
        }
    }

    #[test]
    fn empty_command_is_rejected() {
        let mut config: HarnessConfig = toml::from_str(FULL).unwrap();
        config.runner.command.clear();
        assert!(matches!(
            config.runner.to_run_configuration(Path::new("f")),
            Err(ConfigError::Command(CommandError::Empty))
        ));
    }

    #[test]
    fn loads_from_file_and_reports_parse_errors() {
        let mut good = tempfile::NamedTempFile::new().unwrap();
        good.write_all(FULL.as_bytes()).unwrap();
        let config = HarnessConfig::load_from_file(good.path()).unwrap();
        assert_eq!(config.fuzzer.rng_seed, 7);

        let mut bad = tempfile::NamedTempFile::new().unwrap();
        bad.write_all(b"[runner\n").unwrap();
        assert!(matches!(
            HarnessConfig::load_from_file(bad.path()),
            Err(ConfigError::Parse { .. })
        ));
        assert!(matches!(
            HarnessConfig::load_from_file(Path::new("/no/such/crashwatch.toml")),
            Err(ConfigError::Parse { .. } | ConfigError::Read { .. })
        ));
    }

    #[test]
    fn inverted_ranges_are_rejected_on_load() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(
            b"[runner]\ncommand = [\"t\", \"{}\"]\n[fuzzer]\nseed-file = \"s\"\nrange-list = [[0, 3], [9, 4]]\n",
        )
        .unwrap();
        assert!(matches!(
            HarnessConfig::load_from_file(file.path()),
            Err(ConfigError::InvertedRange { start: 9, end: 4 })
        ));
    }
}
