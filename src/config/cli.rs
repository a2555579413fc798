use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, builder::BoolishValueParser};

use crate::cache::PolicyPreset;

/// Command-line arguments for the icebreak binary.
#[derive(Debug, Parser)]
#[command(name = "icebreak", version, about = "icebreak query cache toolkit")]
pub struct CliArgs {
    /// Optional path to a configuration file.
    #[arg(long = "config-file", env = "ICEBREAK_CONFIG_FILE", value_name = "PATH")]
    pub config_file: Option<PathBuf>,

    #[command(flatten)]
    pub logging: LoggingOverrides,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Debug, Subcommand, Clone)]
pub enum Command {
    /// Print the effective cache policy for every preset.
    Policies(PoliciesArgs),
    /// Run a scripted lobby session against an in-memory event API.
    Simulate(SimulateArgs),
}

#[derive(Debug, Args, Default, Clone)]
pub struct LoggingOverrides {
    /// Override the base log level (trace|debug|info|warn|error).
    #[arg(long = "log-level", value_name = "LEVEL", global = true)]
    pub log_level: Option<String>,

    /// Toggle JSON logging.
    #[arg(
        long = "log-json",
        value_name = "BOOL",
        value_parser = BoolishValueParser::new(),
        global = true
    )]
    pub log_json: Option<bool>,
}

#[derive(Debug, Args, Default, Clone)]
pub struct PoliciesArgs {
    /// Emit the table as JSON instead of aligned text.
    #[arg(long, action = clap::ArgAction::SetTrue)]
    pub json: bool,

    /// Only show this preset.
    #[arg(long, value_name = "PRESET", value_parser = parse_preset)]
    pub preset: Option<PolicyPreset>,
}

#[derive(Debug, Args, Clone)]
pub struct SimulateArgs {
    /// Number of players joining the lobby.
    #[arg(long, default_value_t = 3, value_parser = clap::value_parser!(u32).range(1..=64))]
    pub players: u32,

    /// Number of answer rounds to play.
    #[arg(long, default_value_t = 2, value_parser = clap::value_parser!(u32).range(1..=32))]
    pub rounds: u32,

    /// Simulated backend latency per request, in milliseconds.
    #[arg(long = "latency-ms", default_value_t = 20)]
    pub latency_ms: u64,

    /// Make every Nth backend request fail (0 disables failures).
    #[arg(long = "fail-every", default_value_t = 0)]
    pub fail_every: u32,
}

impl Default for SimulateArgs {
    fn default() -> Self {
        Self {
            players: 3,
            rounds: 2,
            latency_ms: 20,
            fail_every: 0,
        }
    }
}

fn parse_preset(value: &str) -> Result<PolicyPreset, String> {
    value.parse()
}
