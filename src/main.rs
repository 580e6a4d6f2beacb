//! The kernel executable: parses the CLI (spec.md §6.3), wires up logging, loads the init module,
//! and runs it to completion.

#[macro_use]
extern crate log;

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use env_logger::Env;

use c4rt::config::Config;
use c4rt::kernel::task::Privilege;
use c4rt::kernel::Kernel;

/// A cooperative+preemptive multitasking runtime for C4 relocatable object files.
#[derive(Parser, Debug)]
#[command(name = "c4rt", version, about)]
struct Cli {
    /// Enable debug-level kernel diagnostics (shorthand for -v 80).
    #[arg(short = 'd', long)]
    debug: bool,

    /// Start the kernel's built-in self-test tasks instead of (or alongside) an init module.
    #[arg(short = 't', long = "test")]
    start_test_tasks: bool,

    /// Skip the boot-time cycles-per-second calibration and use a conservative default interval.
    #[arg(short = 'm', long = "no-calibrate")]
    skip_calibration: bool,

    /// Load each module's symbol table for richer fault diagnostics.
    #[arg(short = 'g', long = "symbols")]
    load_symbols: bool,

    /// Verbosity 0-100; overrides -d.
    #[arg(short = 'v', long, value_name = "N")]
    verbosity: Option<u8>,

    /// Force the cycle (preemption) interval, bypassing calibration entirely.
    #[arg(short = 'c', long = "cycle-interval", value_name = "N")]
    forced_cycle_interval: Option<u64>,

    /// The init module to load and run (a C4R relocatable object file).
    init_module: Option<PathBuf>,

    /// Arguments passed through to the init module's `main(argc, argv)`.
    #[arg(trailing_var_arg = true)]
    init_args: Vec<String>,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = Config {
        debug: cli.debug,
        start_test_tasks: cli.start_test_tasks,
        skip_calibration: cli.skip_calibration,
        load_symbols: cli.load_symbols,
        forced_cycle_interval: cli.forced_cycle_interval,
        init_module: cli.init_module.clone(),
        init_args: cli.init_args.clone(),
        ..Config::default()
    };
    if let Some(v) = cli.verbosity {
        config.verbosity = v;
    } else if config.debug {
        config.verbosity = 80;
    }

    env_logger::Builder::from_env(Env::default().default_filter_or(
        config.log_level_filter().to_string().to_lowercase(),
    ))
    .init();

    let Some(init_module) = config.init_module.clone() else {
        anyhow::bail!("no init module given; usage: c4rt [flags] <module.c4r> [args...]");
    };

    info!("loading init module from {}", init_module.display());
    let bytes = std::fs::read(&init_module)
        .with_context(|| format!("reading {}", init_module.display()))?;

    let mut kernel = Kernel::new(config)?;
    kernel.calibrate();

    // Forward host SIGINT into the VM loop (spec.md §4.6 "host-level" signal forwarding); the
    // step loop checks this flag once per cycle and routes it to whichever task holds focus.
    signal_hook::flag::register(signal_hook::consts::SIGINT, kernel.vm.host_signal_pending.clone())
        .context("installing SIGINT handler")?;

    let argv_name = init_module
        .file_name()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "init".to_string());
    let mut argv = vec![argv_name.clone()];
    argv.extend(kernel.config.init_args.clone());

    let init_pid = kernel
        .start_task(&argv_name, Privilege::User, Some(&bytes), &argv, 1)
        .context("starting init task")?;

    let exit_code = kernel.run_until_exit(init_pid);
    info!("init task exited with code {exit_code}");

    std::process::exit(exit_code as i32);
}
