//! Kernel configuration, threaded from `main` into [`crate::kernel::Kernel::new`] rather than
//! read from globals (spec.md §2 [ADD]). `main.rs` builds this from `clap`-parsed CLI flags
//! (spec.md §6.3); nothing outside `main.rs` touches `std::env` directly.

use std::path::PathBuf;

pub const DEFAULT_TASK_TABLE_SIZE: usize = 128;

/// A conservative floor below which the cost of preemption dominates useful work
/// (spec.md §4.4 "clamped to a conservative minimum").
pub const MIN_CYCLE_INTERVAL: u64 = 1_000;

/// Target interrupts per second used when calibrating the cycle interval at boot.
pub const TARGET_INTERRUPTS_PER_SEC: u64 = 100;

#[derive(Clone, Debug)]
pub struct Config {
    pub debug: bool,
    pub start_test_tasks: bool,
    /// `-m`: skip the boot-time cycles-per-second measurement.
    pub skip_calibration: bool,
    /// `-g`: load module symbol tables by default.
    pub load_symbols: bool,
    /// `-v N`, 0-100.
    pub verbosity: u8,
    /// `-c N`: force the cycle interval, bypassing calibration entirely.
    pub forced_cycle_interval: Option<u64>,
    pub task_table_size: usize,
    pub init_module: Option<PathBuf>,
    pub init_args: Vec<String>,
}

impl Default for Config {
    fn default() -> Config {
        Config {
            debug: false,
            start_test_tasks: false,
            skip_calibration: false,
            load_symbols: false,
            verbosity: 50,
            forced_cycle_interval: None,
            task_table_size: DEFAULT_TASK_TABLE_SIZE,
            init_module: None,
            init_args: Vec::new(),
        }
    }
}

impl Config {
    /// Maps `-v N` (0-100) onto a `log::LevelFilter`, the same bucketing
    /// `multitool::main` applies to its own `--verbose` flag.
    pub fn log_level_filter(&self) -> log::LevelFilter {
        match self.verbosity {
            0 => log::LevelFilter::Off,
            1..=20 => log::LevelFilter::Error,
            21..=40 => log::LevelFilter::Warn,
            41..=70 => log::LevelFilter::Info,
            71..=90 => log::LevelFilter::Debug,
            _ => log::LevelFilter::Trace,
        }
    }
}
