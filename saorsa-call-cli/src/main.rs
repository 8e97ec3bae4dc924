//! Saorsa Call CLI: simulator and offline tooling for call signaling

use analyze::CliNetworkMode;
use anyhow::Result;
use clap::{Parser, Subcommand};
use simulate::{NetworkProfile, SimulationOptions};
use std::path::PathBuf;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

mod analyze;
mod config;
mod simulate;

#[derive(Parser)]
#[command(author, version, about)]
struct Cli {
    /// Configuration file (JSON); defaults to the platform config directory
    #[arg(short, long, env = "SAORSA_CALL_CONFIG", global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a call between two simulated peers
    Simulate {
        /// Network behaviour seen by the caller
        #[arg(long, value_enum, default_value = "degrading")]
        profile: NetworkProfile,

        /// Stats ticks once connected
        #[arg(long, default_value_t = 20)]
        ticks: u32,

        /// Sample generator seed
        #[arg(long, default_value_t = 1)]
        seed: u64,

        /// Audio only
        #[arg(long)]
        no_video: bool,

        /// Milliseconds between ticks
        #[arg(long, default_value_t = 250)]
        tick_ms: u64,
    },

    /// Replay a JSON array of stats samples through the classifier
    Classify {
        /// Stats file
        file: PathBuf,

        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },

    /// Shape a session description for a network mode
    Optimize {
        /// SDP file
        file: PathBuf,

        /// Target network mode
        #[arg(long, value_enum, default_value = "low")]
        mode: CliNetworkMode,
    },

    /// Print the default configuration, or write it out
    Config {
        /// Write to the config path instead of printing
        #[arg(long)]
        write: bool,
    },

    /// Show where configuration comes from and what is in effect
    Status,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("saorsa_call=info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Simulate {
            profile,
            ticks,
            seed,
            no_video,
            tick_ms,
        } => {
            let config = config::load(cli.config.as_deref())?;
            handle_simulate(
                config,
                SimulationOptions {
                    profile,
                    ticks,
                    seed,
                    video: !no_video,
                    tick_interval: Duration::from_millis(tick_ms),
                },
            )
            .await?;
        }
        Commands::Classify { file, json } => {
            let config = config::load(cli.config.as_deref())?;
            handle_classify(&config, &file, json)?;
        }
        Commands::Optimize { file, mode } => {
            print!("{}", analyze::optimize_file(&file, mode.into())?);
        }
        Commands::Config { write } => {
            handle_config(cli.config, write)?;
        }
        Commands::Status => {
            handle_status(cli.config)?;
        }
    }

    Ok(())
}

async fn handle_simulate(
    config: saorsa_call_core::CallManagerConfig,
    options: SimulationOptions,
) -> Result<()> {
    println!(
        "🧪 Simulating a {} call over a {:?} network ({} ticks, seed {})",
        if options.video { "video" } else { "voice" },
        options.profile,
        options.ticks,
        options.seed
    );

    let report = simulate::run(config, options, |side, event| {
        println!("   [{side:>6}] {}", simulate::describe(event));
    })
    .await?;

    println!();
    println!("📊 Call {}", report.call_id);
    for (tick, (mode, level)) in report.modes.iter().zip(&report.levels).enumerate() {
        println!("   tick {tick:>3}  {:<9} {level}", mode.to_string());
    }
    if let Some(duration) = report.caller.duration() {
        println!("   duration: {} ms", duration.num_milliseconds());
    }
    println!(
        "   caller ended: {} | callee ended: {}",
        report
            .caller
            .end_reason()
            .map_or("-".to_string(), |r| r.to_string()),
        report
            .callee
            .end_reason()
            .map_or("-".to_string(), |r| r.to_string()),
    );
    Ok(())
}

fn handle_classify(
    config: &saorsa_call_core::CallManagerConfig,
    file: &std::path::Path,
    json: bool,
) -> Result<()> {
    let samples = analyze::read_samples(file)?;
    let report = analyze::classify(config, samples);
    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    println!("tick  scored    mode      level         mean rtt  mean kbps  video");
    for row in report {
        println!(
            "{:>4}  {:<9} {:<9} {:<13} {:>8}  {:>9}  {}",
            row.tick,
            row.scored.to_string(),
            row.mode.to_string(),
            row.level.to_string(),
            row.window
                .mean_rtt_ms
                .map_or("-".to_string(), |rtt| format!("{rtt} ms")),
            row.window.mean_kbps,
            row.video_kbps
                .map_or("-".to_string(), |kbps| format!("{kbps} kbps")),
        );
    }
    Ok(())
}

fn handle_config(explicit: Option<PathBuf>, write: bool) -> Result<()> {
    if !write {
        println!("{}", config::default_json()?);
        return Ok(());
    }
    let Some(path) = config::resolve_path(explicit.as_deref()) else {
        anyhow::bail!("no config directory on this platform; pass --config");
    };
    config::write_default(&path)?;
    println!("✅ Wrote default configuration to {}", path.display());
    Ok(())
}

fn handle_status(explicit: Option<PathBuf>) -> Result<()> {
    println!("📊 Saorsa Call Status");
    println!("=====================");
    match config::resolve_path(explicit.as_deref()) {
        Some(path) if path.exists() => println!("✅ Config: {}", path.display()),
        Some(path) => println!("⚠️  Config: {} (not found, using defaults)", path.display()),
        None => println!("⚠️  Config: no platform config directory, using defaults"),
    }

    let config = config::load(explicit.as_deref())?;
    println!("   Max concurrent calls: {}", config.max_concurrent_calls);
    println!(
        "   Negotiation timeout:  {} ms",
        config.negotiation_timeout_ms
    );
    println!(
        "   Hysteresis:           {} of {} samples",
        config.classifier.hysteresis_samples, config.classifier.window_size
    );
    println!(
        "   Upgrade dwell:        {} ticks",
        config.degradation.upgrade_dwell_ticks
    );
    println!(
        "   Stats polling:        {}",
        config
            .stats_poll_interval_ms
            .map_or("off".to_string(), |ms| format!("every {ms} ms"))
    );
    println!();
    println!("Available commands:");
    println!("  saorsa-call simulate [options]     - Run a simulated call");
    println!("  saorsa-call classify <stats.json>  - Replay stats samples");
    println!("  saorsa-call optimize <offer.sdp>   - Shape a description for a mode");
    println!("  saorsa-call config [--write]       - Show or write default configuration");
    println!("  saorsa-call status                 - Show this status");
    Ok(())
}
