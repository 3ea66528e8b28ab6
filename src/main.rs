//! TubeClient - register with a message-queue master from the command line

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use serde_json::json;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use tubeclient::config::{self, Config};
use tubeclient::protocol::{self, RegistrationResponse, HEADER_SIZE, MARKER};
use tubeclient::{ClientError, MasterAddrList, MasterStatus, RegistrationClient};

/// TubeClient - register with a message-queue master
#[derive(Parser)]
#[command(name = "tubeclient")]
#[command(author = "TubeClient Contributors")]
#[command(version = "0.1.0")]
#[command(about = "Register a client with a message-queue master", long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Register with a master
    Register {
        /// Master addresses, e.g. "10.0.0.1:8000,10.0.0.2:8000"
        #[arg(short, long)]
        master: Option<String>,

        /// Address to announce to the master
        #[arg(long)]
        host_name: Option<String>,

        /// Client id (defaults to "<host-name>-lan")
        #[arg(long)]
        client_id: Option<String>,

        /// Topic to register for (repeatable)
        #[arg(short, long = "topic")]
        topics: Vec<String>,

        /// Keep the connection open until Ctrl+C
        #[arg(short, long)]
        wait: bool,

        /// Print the master's response as JSON
        #[arg(long)]
        json: bool,
    },

    /// Show current configuration
    Config {
        /// Generate a sample configuration file
        #[arg(short, long)]
        generate: bool,

        /// Output path for generated config
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Show protocol information
    Info,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // RUST_LOG wins over the flag
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if cli.verbose {
            EnvFilter::new("debug")
        } else {
            EnvFilter::new("info")
        }
    });

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(filter)
        .init();

    let mut config = if let Some(config_path) = &cli.config {
        Config::load(config_path)?
    } else {
        Config::load_default().unwrap_or_default()
    };

    match cli.command {
        Commands::Register {
            master,
            host_name,
            client_id,
            topics,
            wait,
            json,
        } => {
            if let Some(master) = master {
                config.master.addresses = master;
            }
            if let Some(host_name) = host_name {
                config.client.host_name = host_name;
            }
            if client_id.is_some() {
                config.client.client_id = client_id;
            }
            if !topics.is_empty() {
                config.client.topics = topics;
            }
            run_register(config, wait, json).await?;
        }
        Commands::Config { generate, output } => {
            if generate {
                let sample = config::generate_sample_config()?;
                if let Some(path) = output {
                    std::fs::write(&path, &sample)?;
                    println!("Configuration written to: {}", path.display());
                } else {
                    println!("{}", sample);
                }
            } else {
                println!("{}", toml::to_string_pretty(&config)?);
            }
        }
        Commands::Info => {
            print_protocol_info();
        }
    }

    Ok(())
}

/// Connect to the first reachable master and register.
///
/// Each master is tried once, in order. The client itself never retries.
async fn run_register(config: Config, wait: bool, json: bool) -> anyhow::Result<()> {
    let masters: MasterAddrList = config.master.master_addrs()?;
    let request = config.registration_request();
    let client = RegistrationClient::new(config.network_config());

    let mut connected = None;
    for master in masters.iter() {
        match client.connect_master(master).await {
            Ok(()) => {
                connected = Some(master.clone());
                break;
            }
            Err(e) => tracing::warn!("Master {} unavailable: {}", master, e),
        }
    }

    let Some(master) = connected else {
        anyhow::bail!("No master reachable in {}", masters);
    };

    tracing::info!(
        "Registering '{}' ({}) with {}",
        request.client_id,
        request.host_name,
        master
    );

    let result = client.register_and_wait(&request).await;

    let outcome = match result {
        Ok(response) => {
            report(&response, json);
            Ok(())
        }
        Err(ClientError::Rejected { status, message }) => {
            if json {
                println!(
                    "{}",
                    json!({ "success": false, "err_code": status.code(), "err_msg": message })
                );
            }
            Err(anyhow::anyhow!("{}: {} {}", rejection_summary(status), status, message))
        }
        Err(e) => Err(e.into()),
    };

    if outcome.is_ok() && wait {
        let mut unsolicited = match client.connection().await {
            Some(conn) => conn.take_unsolicited_receiver(),
            None => anyhow::bail!("Connection lost after registration"),
        };

        println!("Registered. Press Ctrl+C to disconnect.");

        loop {
            tokio::select! {
                frame = unsolicited.recv() => {
                    match frame {
                        Some(frame) => tracing::info!(
                            "Unsolicited frame serial={} len={}",
                            frame.serial_number,
                            frame.payload_length()
                        ),
                        None => {
                            tracing::info!("Master closed the connection");
                            break;
                        }
                    }
                }
                _ = tokio::signal::ctrl_c() => {
                    println!("\nDisconnecting...");
                    break;
                }
            }
        }
    }

    client.close().await;
    outcome
}

fn rejection_summary(status: MasterStatus) -> &'static str {
    if status.is_server_error() {
        "Master failed to process registration"
    } else {
        "Master rejected registration"
    }
}

fn report(response: &RegistrationResponse, json: bool) {
    if json {
        println!(
            "{}",
            json!({
                "success": response.success,
                "err_code": response.err_code,
                "err_msg": response.err_msg,
                "broker_check_sum": response.broker_check_sum,
            })
        );
    } else {
        println!(
            "Registered: {} (broker checksum {})",
            response.status(),
            response.broker_check_sum
        );
    }
}

/// Print protocol information
fn print_protocol_info() {
    println!("TubeClient Protocol Information");
    println!("===============================\n");

    println!("Marker: {:02X?}", MARKER);
    println!("Header size: {} bytes", HEADER_SIZE);
    println!("Default port: {}", protocol::DEFAULT_PORT);
    println!("Max inbound payload: {} bytes", protocol::DEFAULT_MAX_PAYLOAD_SIZE);
}
