// SPDX-License-Identifier: GPL-3.0-only

use clap::{Parser, Subcommand, ValueEnum};
use depth_vsr::{DevicePreference, OffloadPolicy};
use std::path::PathBuf;

mod cli;

#[derive(Parser)]
#[command(name = "depth-vsr")]
#[command(about = "Depth video super-resolution from dToF measurements")]
#[command(version = env!("GIT_VERSION"))]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, ValueEnum)]
enum DeviceArg {
    Cpu,
    Auto,
    Gpu,
}

impl From<DeviceArg> for DevicePreference {
    fn from(arg: DeviceArg) -> Self {
        match arg {
            DeviceArg::Cpu => DevicePreference::Cpu,
            DeviceArg::Auto => DevicePreference::Auto,
            DeviceArg::Gpu => DevicePreference::Gpu,
        }
    }
}

#[derive(Clone, Copy, ValueEnum)]
enum OffloadArg {
    Auto,
    Always,
    Never,
}

impl From<OffloadArg> for OffloadPolicy {
    fn from(arg: OffloadArg) -> Self {
        match arg {
            OffloadArg::Auto => OffloadPolicy::Auto,
            OffloadArg::Always => OffloadPolicy::Always,
            OffloadArg::Never => OffloadPolicy::Never,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Super-resolve a sequence stored as safetensors
    Run {
        /// Input file with `guides` and `observations` (or `lqs`) tensors
        #[arg(short, long)]
        input: PathBuf,

        /// Output file for the predicted tensors
        #[arg(short, long)]
        output: PathBuf,

        /// Configuration file (default: ~/.config/depth-vsr/config.json)
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Model checkpoint, overrides the configured one
        #[arg(short, long)]
        weights: Option<PathBuf>,

        /// Flow-network checkpoint, overrides the configured one
        #[arg(long)]
        flow_weights: Option<PathBuf>,

        /// Also write every blended depth frame as a 16-bit PNG here
        #[arg(long)]
        png_dir: Option<PathBuf>,

        /// Compute device, overrides the configured one
        #[arg(long, value_enum)]
        device: Option<DeviceArg>,

        /// Host offload of intermediates
        #[arg(long, value_enum, default_value = "auto")]
        offload: OffloadArg,
    },

    /// Print the effective configuration as JSON
    Config {
        /// Configuration file (default: ~/.config/depth-vsr/config.json)
        #[arg(short, long)]
        config: Option<PathBuf>,
    },

    /// List the tensors of a checkpoint
    Inspect {
        /// Safetensors checkpoint
        #[arg(short, long)]
        weights: PathBuf,
    },
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    // Set RUST_LOG environment variable to control log level
    // Examples: RUST_LOG=debug, RUST_LOG=depth_vsr=trace, RUST_LOG=info
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_target(true)
        .with_level(true)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            input,
            output,
            config,
            weights,
            flow_weights,
            png_dir,
            device,
            offload,
        } => cli::run_sequence(cli::RunOptions {
            input,
            output,
            config,
            weights,
            flow_weights,
            png_dir,
            device: device.map(Into::into),
            offload: offload.into(),
        }),
        Commands::Config { config } => cli::print_config(config),
        Commands::Inspect { weights } => cli::inspect_weights(&weights),
    }
}
