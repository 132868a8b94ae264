// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! keenmqtt-sim - Publish synthetic sensor readings
//!
//! Traffic generator for exercising a keenmqtt relay against a real
//! broker: simulated temperature sensors random-walk their values and
//! publish JSON readings on a fixed interval.

use clap::Parser;
use colored::Colorize;
use keenmqtt::{BusClient, MqttClient, MqttConfig};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

/// Publish synthetic sensor readings to an MQTT broker
#[derive(Parser, Debug)]
#[command(name = "keenmqtt-sim")]
#[command(version = "0.1.0")]
#[command(about = "Publish synthetic sensor readings (traffic generator for keenmqtt)")]
struct Args {
    /// MQTT broker host
    #[arg(short = 'H', long, default_value = "localhost")]
    host: String,

    /// MQTT broker port
    #[arg(short, long, default_value = "1883")]
    port: u16,

    /// Topic prefix; readings go to <prefix>/<sensor-id>
    #[arg(long, default_value = "home/temperature")]
    prefix: String,

    /// Number of simulated sensors
    #[arg(short, long, default_value = "3")]
    sensors: usize,

    /// Milliseconds between publish rounds
    #[arg(short, long, default_value = "2000")]
    interval_ms: u64,

    /// Stop after this many messages (0 = unlimited)
    #[arg(short = 'n', long, default_value = "0")]
    count: u64,

    /// Only output errors
    #[arg(short, long)]
    quiet: bool,
}

fn main() {
    let args = Args::parse();

    if let Err(e) = run_sim(&args) {
        eprintln!("{}: {}", "Error".red().bold(), e);
        std::process::exit(1);
    }
}

fn run_sim(args: &Args) -> Result<(), Box<dyn std::error::Error>> {
    let running = Arc::new(AtomicBool::new(true));
    let r = running.clone();
    ctrlc::set_handler(move || {
        r.store(false, Ordering::SeqCst);
    })?;

    let config = MqttConfig {
        host: args.host.clone(),
        port: args.port,
        client_id: Some(format!("keenmqtt-sim-{:04x}", fastrand::u16(..))),
        ..MqttConfig::default()
    };
    let mut client = MqttClient::new(&config);
    client.connect()?;

    if !args.quiet {
        print_header(args);
    }

    // Each sensor random-walks around its own baseline.
    let mut values: Vec<f64> = (0..args.sensors).map(|i| 18.0 + i as f64 * 1.5).collect();
    let mut published: u64 = 0;

    'rounds: while running.load(Ordering::SeqCst) {
        for (i, value) in values.iter_mut().enumerate() {
            *value += (fastrand::f64() - 0.5) * 0.8;
            let sensor_id = format!("sensor-{:02}", i + 1);
            let topic = format!("{}/{}", args.prefix, sensor_id);
            let payload = serde_json::json!({
                "sensor_id": sensor_id,
                "sensor_value": (*value * 100.0).round() / 100.0,
                "type": "temperature",
            });

            match client.publish(&topic, payload.to_string().as_bytes()) {
                Ok(()) => {
                    published += 1;
                    if !args.quiet {
                        println!("{} {}", topic, payload);
                    }
                }
                Err(e) => {
                    eprintln!("{}: publish failed: {}", "Warning".yellow(), e);
                }
            }

            if args.count > 0 && published >= args.count {
                break 'rounds;
            }
        }

        // Service keepalive and reconnects between rounds.
        let next_round = Instant::now() + Duration::from_millis(args.interval_ms);
        while running.load(Ordering::SeqCst) && Instant::now() < next_round {
            let _ = client.poll()?;
            thread::sleep(Duration::from_millis(50));
        }
    }

    if !args.quiet {
        eprintln!("\n{} Published {} message(s)", "---".dimmed(), published);
    }
    Ok(())
}

fn print_header(args: &Args) {
    eprintln!(
        "{} {} {} ({} sensor(s), every {}ms)",
        ">>>".green().bold(),
        "Publishing to".bold(),
        format!("{}:{}", args.host, args.port).cyan(),
        args.sensors,
        args.interval_ms
    );
    eprintln!("    readings go to {}/sensor-NN", args.prefix.cyan());
    eprintln!("{}", "Press Ctrl+C to stop".dimmed());
    eprintln!();
}
