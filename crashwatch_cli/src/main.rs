use crashwatch_core::config::{HarnessConfig, MutatorKind};
use crashwatch_core::hook_store::HookStore;
use crashwatch_core::hooks::{HookPaths, HookPlan};
use crashwatch_core::mutator::{FlipSingleByteMutator, Mutator, MutatorError, WaveMutator};
use crashwatch_core::oracle::{CrashOracle, Oracle};
use crashwatch_core::runner::{CommandRunner, Outcome, Runner};

use anyhow::Context;
use clap::{Parser, Subcommand};
use env_logger::Env;
use log::{debug, info, warn};
use rand_chacha::ChaCha8Rng;
use rand_core::SeedableRng;
use std::path::{Path, PathBuf};
use std::time::Instant;

#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
struct Cli {
    #[clap(short, long, value_parser)]
    config: Option<PathBuf>,
    #[clap(short, long)]
    iterations: Option<u64>,
    #[clap(long)]
    timeout_secs: Option<f64>,
    #[clap(long)]
    watch_cpu: bool,
    #[clap(short, long)]
    verbose: bool,
    #[clap(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug, PartialEq)]
enum Commands {
    /// Run by the OS as the just-in-time debugger of a crashing target.
    ///
    /// Logs the crashing pid and returns, after which the OS terminates the
    /// target with its exception code for the runner to classify.
    Jit { pid: u32 },
}

#[derive(Debug, Default)]
struct Tally {
    executions: u64,
    crashes: u64,
    timeouts: u64,
    hangs: u64,
}

fn fuzzed_file_path(working_dir: &Path, seed_file: &Path, iteration: u64) -> PathBuf {
    let stem = seed_file
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "seed".to_string());
    let mut name = format!("{stem}-{iteration:06}");
    if let Some(ext) = seed_file.extension() {
        name.push('.');
        name.push_str(&ext.to_string_lossy());
    }
    working_dir.join(name)
}

#[cfg(windows)]
fn hook_store() -> anyhow::Result<Box<dyn HookStore>> {
    Ok(Box::new(crashwatch_core::hook_store::RegistryHookStore::new()))
}

#[cfg(not(windows))]
fn hook_store() -> anyhow::Result<Box<dyn HookStore>> {
    anyhow::bail!("debug-hooks requires Windows")
}

fn main() -> Result<(), anyhow::Error> {
    let cli = Cli::parse();
    let default_filter = if cli.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(Env::default().default_filter_or(default_filter)).init();

    match cli.command {
        Some(Commands::Jit { pid }) => {
            warn!("Process {pid} raised an unhandled exception");
            Ok(())
        }
        None => fuzz(cli),
    }
}

fn fuzz(cli: Cli) -> Result<(), anyhow::Error> {
    let config_path = cli
        .config
        .unwrap_or_else(|| PathBuf::from("crashwatch.toml"));
    info!("Loading configuration from {config_path:?}");
    let mut config = HarnessConfig::load_from_file(&config_path)?;

    if let Some(iterations) = cli.iterations {
        config.fuzzer.iterations = iterations;
    }
    if let Some(timeout_secs) = cli.timeout_secs {
        config.runner.timeout_secs = timeout_secs;
    }
    if cli.watch_cpu {
        config.runner.watch_cpu = true;
    }
    // The target runs inside the working directory, so hand it absolute paths.
    config.runner.working_dir = std::path::absolute(&config.runner.working_dir)
        .with_context(|| format!("resolving {:?}", config.runner.working_dir))?;
    debug!("Effective configuration: {config:#?}");

    let seed = std::fs::read(&config.fuzzer.seed_file)
        .with_context(|| format!("reading seed file {:?}", config.fuzzer.seed_file))?;
    std::fs::create_dir_all(&config.runner.working_dir)
        .with_context(|| format!("creating {:?}", config.runner.working_dir))?;

    let mut rng = ChaCha8Rng::seed_from_u64(config.fuzzer.rng_seed);
    let mut mutator: Box<dyn Mutator<ChaCha8Rng>> = match config.fuzzer.mutator {
        MutatorKind::Wave => match config.fuzzer.range_list.clone() {
            Some(ranges) => Box::new(WaveMutator::with_ranges(ranges)),
            None => Box::new(WaveMutator::new()),
        },
        MutatorKind::FlipByte => Box::new(FlipSingleByteMutator),
    };

    let mut runner = CommandRunner::new();
    if config.runner.debug_hooks {
        let plan = HookPlan::jit_debugger(&HookPaths::discover());
        runner = runner.with_debug_hooks(hook_store()?, plan);
    }
    let oracle = CrashOracle::new();

    let max_iterations = config.fuzzer.iterations;
    info!(
        "Starting fuzz loop for {max_iterations} iterations with the {} mutator...",
        mutator.name()
    );
    let start_time = Instant::now();
    let mut tally = Tally::default();

    for i in 0..max_iterations {
        let fuzzed = match mutator.mutate(&seed, &mut rng) {
            Ok(fuzzed) => fuzzed,
            Err(MutatorError::Exhausted { iteration }) => {
                info!("Mutator exhausted at iteration {iteration}, stopping");
                break;
            }
        };
        let fuzzed_path =
            fuzzed_file_path(&config.runner.working_dir, &config.fuzzer.seed_file, i);
        std::fs::write(&fuzzed_path, &fuzzed)
            .with_context(|| format!("writing fuzzed file {fuzzed_path:?}"))?;

        let run_config = config.runner.to_run_configuration(&fuzzed_path)?;
        let result = runner
            .run(&run_config)
            .with_context(|| format!("running iteration {i}"))?;
        tally.executions += 1;
        match result.outcome {
            Outcome::KilledTimeout => tally.timeouts += 1,
            Outcome::KilledHang => tally.hangs += 1,
            Outcome::ExitedNormal => {}
        }

        if let Some(report) = oracle.examine(&fuzzed, &result) {
            tally.crashes += 1;
            info!(
                "!!! CRASH (iteration {i}) {} input {} kept at {fuzzed_path:?}",
                report.description(),
                report.input_hash
            );
        } else if let Err(e) = std::fs::remove_file(&fuzzed_path) {
            warn!("Failed to remove {fuzzed_path:?}: {e}");
        }

        if i > 0 && i % (max_iterations / 100).max(1) == 0 {
            let elapsed = start_time.elapsed().as_secs_f32();
            let exec_per_sec = if elapsed > 0.0 {
                tally.executions as f32 / elapsed
            } else {
                0.0
            };
            info!(
                "Iter: {i}/{max_iterations}, Crashes: {}, Timeouts: {}, Hangs: {}, Execs/sec: {exec_per_sec:.2}",
                tally.crashes, tally.timeouts, tally.hangs
            );
        }
    }

    info!(
        "Fuzz loop finished in {:.2?}. Executions: {}, Crashes: {}, Timeouts: {}, Hangs: {}",
        start_time.elapsed(),
        tally.executions,
        tally.crashes,
        tally.timeouts,
        tally.hangs
    );
    Ok(())
}
