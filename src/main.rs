//! minirep workload simulator
//!
//! Runs concurrent client sessions against the in-process provider while
//! injecting brute-force aborts, then prints a JSON report.

use std::path::PathBuf;

use log::info;

use minirep::{simulation, Config, SimulationConfig};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args: Vec<String> = std::env::args().collect();

    let mut config_path: Option<PathBuf> = None;
    let mut clients: Option<usize> = None;
    let mut transactions: Option<usize> = None;
    let mut seed: Option<u64> = None;
    let mut high_contention = false;

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--config" | "-c" => {
                if i + 1 < args.len() {
                    config_path = Some(PathBuf::from(&args[i + 1]));
                    i += 1;
                }
            }
            "--clients" | "-n" => {
                if i + 1 < args.len() {
                    clients = Some(args[i + 1].parse()?);
                    i += 1;
                }
            }
            "--transactions" | "-t" => {
                if i + 1 < args.len() {
                    transactions = Some(args[i + 1].parse()?);
                    i += 1;
                }
            }
            "--seed" | "-s" => {
                if i + 1 < args.len() {
                    seed = Some(args[i + 1].parse()?);
                    i += 1;
                }
            }
            "--high-contention" => high_contention = true,
            "--help" | "-h" => {
                println!("minirep - replication transaction core workload simulator");
                println!();
                println!("Usage: minirep [OPTIONS]");
                println!();
                println!("Options:");
                println!("  -c, --config FILE         JSON configuration file");
                println!("  -n, --clients N           Number of client sessions (default: 4)");
                println!("  -t, --transactions N      Transactions per client (default: 200)");
                println!("  -s, --seed N              RNG seed (default: 42)");
                println!("      --high-contention     Small key space, frequent BF-aborts");
                println!("  -h, --help                Show this help");
                return Ok(());
            }
            other => {
                eprintln!("Unknown argument: {}", other);
            }
        }
        i += 1;
    }

    let mut config = match config_path {
        Some(path) => {
            info!("Loading configuration from {}", path.display());
            Config::from_json_file(&path)?
        }
        None => Config::default(),
    };
    if high_contention {
        config.simulation = SimulationConfig {
            clients: config.simulation.clients,
            transactions_per_client: config.simulation.transactions_per_client,
            ..SimulationConfig::high_contention()
        };
    }
    if let Some(n) = clients {
        config.simulation.clients = n;
    }
    if let Some(n) = transactions {
        config.simulation.transactions_per_client = n;
    }
    if let Some(s) = seed {
        config.simulation.seed = s;
    }

    let report = simulation::run(&config)?;
    println!("{}", serde_json::to_string_pretty(&report)?);

    if report.invalid_histories > 0 {
        return Err(format!("{} invalid state histories", report.invalid_histories).into());
    }
    Ok(())
}
