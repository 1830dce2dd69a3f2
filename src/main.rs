// SPDX-License-Identifier: GPL-3.0-only

use clap::{Parser, Subcommand};

mod sim;

#[derive(Parser)]
#[command(name = "capture-pipeline")]
#[command(about = "Drive the camera stage pipeline with a simulated device")]
#[command(version = env!("PIPELINE_BUILD_VERSION"))]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a synthetic capture session through pass-through stages
    Simulate {
        /// Number of stages in the pipeline
        #[arg(short, long, default_value = "3")]
        stages: usize,

        /// Number of frames to capture
        #[arg(short, long, default_value = "10")]
        frames: u32,

        /// How many stages (from the first) get their own worker thread
        #[arg(short, long, default_value = "1")]
        threaded: usize,

        /// Log every descriptor at every stage boundary (needs RUST_LOG=debug)
        #[arg(long)]
        trace: bool,

        /// Frame number whose request the first stage rejects
        #[arg(long)]
        fail_request: Option<u32>,
    },
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    // Set RUST_LOG environment variable to control log level
    // Examples: RUST_LOG=debug, RUST_LOG=capture_pipeline=debug, RUST_LOG=info
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
        Commands::Simulate {
            stages,
            frames,
            threaded,
            trace,
            fail_request,
        } => {
            let options = sim::SimulationOptions {
                stages,
                frames,
                threaded: threaded.min(stages),
                trace,
                fail_request,
            };
            let report = sim::run_simulation(&options)?;

            println!("Simulated {} frames through {} stages", frames, stages);
            println!("  Frames delivered:  {}", report.frames_delivered);
            println!("  Buffers delivered: {}", report.buffers_delivered);
            println!("  Buffer errors:     {}", report.buffer_errors);
            println!("  Notifications:     {}", report.notifications);
            println!("  Request failures:  {}", report.request_failures);
            Ok(())
        }
    }
}
