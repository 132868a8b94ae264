// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! keenmqtt relay daemon.

use std::fs;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use keenmqtt::{KeenRelay, RelayConfig, StatsSnapshot};

#[derive(Parser)]
#[command(name = "keenmqtt", version, about = "MQTT to Keen IO event relay")]
struct Args {
    /// Path to the YAML configuration file.
    #[arg(short, long, default_value = "config.yaml")]
    config: PathBuf,

    /// Increase log verbosity (-v: debug, -vv: trace).
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Write a commented example configuration file.
    GenConfig {
        /// Destination path.
        #[arg(default_value = "config.yaml")]
        output: PathBuf,

        /// Overwrite an existing file.
        #[arg(long)]
        force: bool,
    },

    /// Parse and validate a configuration file, then exit.
    Validate,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    match args.command {
        Some(Command::GenConfig { output, force }) => cmd_gen_config(&output, force),
        Some(Command::Validate) => cmd_validate(&args.config),
        None => cmd_run(&args.config, args.verbose),
    }
}

/// `RUST_LOG` wins; otherwise `-v` flags override the configured
/// level.
fn init_logging(config_level: &str, verbose: u8) {
    let level = match verbose {
        0 => config_level,
        1 => "debug",
        _ => "trace",
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level.to_string()));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

fn cmd_run(config_path: &Path, verbose: u8) -> anyhow::Result<()> {
    let config = RelayConfig::from_file(config_path)
        .with_context(|| format!("failed to load {}", config_path.display()))?;
    init_logging(&config.log_level, verbose);

    info!(version = keenmqtt::VERSION, "keenmqtt starting");

    let stats_interval =
        (config.stats_interval_secs > 0).then(|| Duration::from_secs(config.stats_interval_secs));
    let mut relay = KeenRelay::new(config);
    relay.setup().context("relay setup failed")?;
    relay.start().context("failed to start relay worker")?;

    let stop = relay.stop_handle();
    ctrlc::set_handler(move || {
        info!("Interrupt received; shutting down");
        stop.stop();
    })
    .context("failed to install signal handler")?;

    let mut last_stats = Instant::now();
    while relay.is_running() {
        thread::sleep(Duration::from_millis(200));
        if let Some(interval) = stats_interval {
            if last_stats.elapsed() >= interval {
                log_stats(&relay.stats());
                last_stats = Instant::now();
            }
        }
    }

    relay.stop();
    log_stats(&relay.stats());
    info!("keenmqtt stopped");
    Ok(())
}

fn cmd_gen_config(output: &Path, force: bool) -> anyhow::Result<()> {
    if output.exists() && !force {
        anyhow::bail!(
            "{} already exists (use --force to overwrite)",
            output.display()
        );
    }
    fs::write(output, RelayConfig::example_yaml())
        .with_context(|| format!("failed to write {}", output.display()))?;
    println!("Wrote example configuration to {}", output.display());
    Ok(())
}

fn cmd_validate(path: &Path) -> anyhow::Result<()> {
    let config = RelayConfig::from_file(path)
        .with_context(|| format!("invalid configuration: {}", path.display()))?;

    println!("Configuration OK: {}", path.display());
    if let Some(mqtt) = &config.mqtt {
        println!("  broker:   {}:{}", mqtt.host, mqtt.port);
    }
    if let Some(keen) = &config.keen {
        println!("  keen:     project {} via {}", keen.project_id, keen.api_url);
    }
    println!("  mappings: {}", config.collection_mappings.len());
    for (pattern, collection) in &config.collection_mappings {
        println!("    {} -> {}", pattern, collection);
    }
    Ok(())
}

fn log_stats(stats: &StatsSnapshot) {
    info!(
        uptime_secs = stats.uptime.as_secs(),
        messages = stats.messages_received,
        records = stats.records_decoded,
        pushed = stats.events_pushed,
        filtered = stats.records_filtered,
        unrouted = stats.records_unrouted,
        decode_errors = stats.decode_errors,
        push_errors = stats.push_errors,
        "Relay stats"
    );
}
