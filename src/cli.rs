//! Command line interface of taro built on clap.
//!
//! Defines [`Cli`] with the [`Command`] subcommands and the global flags
//! selecting the configuration and overriding its log options.

use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};

use crate::config::LogOverrides;
use crate::execution::ExecutionState;
use crate::process::DEFAULT_OUTPUT_QUEUE;

/// taro: run jobs and watch or control them from other terminals.
#[derive(Debug, Parser)]
#[command(name = "taro", version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Configuration file to use instead of ./taro.toml.
    #[arg(short = 'C', long, global = true)]
    pub config: Option<PathBuf>,

    /// Ignore configuration files and use the defaults.
    #[arg(long, global = true, conflicts_with = "config")]
    pub def_config: bool,

    /// Enable or disable logging.
    #[arg(long, global = true)]
    pub log_enabled: Option<bool>,

    /// Console log level.
    #[arg(long, global = true, value_name = "LEVEL")]
    pub log_stdout: Option<String>,

    /// Log file level, `off` disables the file.
    #[arg(long, global = true, value_name = "LEVEL")]
    pub log_file: Option<String>,

    #[arg(long, global = true, value_name = "PATH")]
    pub log_file_path: Option<PathBuf>,
}

impl Cli {
    pub fn log_overrides(&self) -> LogOverrides {
        LogOverrides {
            enabled: self.log_enabled,
            stdout_level: self.log_stdout.clone(),
            file_level: self.log_file.clone(),
            file_path: self.log_file_path.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    #[default]
    Table,
    Json,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Executes a command as a tracked job.
    Exec {
        /// Job id, defaults to the program name.
        #[arg(long)]
        id: Option<String>,

        /// Capture standard output and make it available to `tail`.
        #[arg(long)]
        capture: bool,

        /// Capacity of the captured output queue.
        #[arg(long, default_value_t = DEFAULT_OUTPUT_QUEUE)]
        queue_size: usize,

        /// Program and its arguments.
        #[arg(required = true, trailing_var_arg = true, allow_hyphen_values = true)]
        command: Vec<String>,
    },

    /// Lists running jobs.
    Ps {
        /// Wildcard pattern on job or instance id.
        pattern: Option<String>,

        #[arg(long, value_enum, default_value_t)]
        format: OutputFormat,
    },

    /// Stops running jobs, or interrupts them with `--signal`.
    Stop {
        /// Wildcard pattern on job or instance id.
        pattern: String,

        /// Interrupt with this signal (9 or 15) instead of a graceful stop.
        #[arg(long)]
        signal: Option<i32>,
    },

    /// Prints the last output lines of running jobs.
    Tail {
        pattern: Option<String>,
    },

    /// Waits for state changes of jobs.
    Wait {
        pattern: Option<String>,

        /// States to wait for, all states when empty.
        #[arg(long, value_delimiter = ',')]
        states: Vec<ExecutionState>,

        /// Number of matching changes to wait for.
        #[arg(long, default_value_t = 1)]
        count: u32,
    },

    /// Shows finished jobs.
    History {
        /// Oldest jobs first.
        #[arg(long)]
        chronological: bool,

        #[arg(long, value_enum, default_value_t)]
        format: OutputFormat,
    },

    /// Disables jobs: executing them ends in DISABLED without running.
    Disable {
        /// Treat ids as regular expressions matching whole job ids.
        #[arg(long)]
        regex: bool,

        #[arg(required = true)]
        ids: Vec<String>,
    },

    /// Enables previously disabled jobs.
    Enable {
        #[arg(required = true)]
        ids: Vec<String>,
    },

    /// Lists disabled jobs.
    Disabled,

    /// Configuration commands.
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Debug, Subcommand)]
pub enum ConfigAction {
    /// Prints the effective configuration.
    Show,
}
