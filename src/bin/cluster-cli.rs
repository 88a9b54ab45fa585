use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use bytes::Bytes;
use clap::{Parser, Subcommand};
use serde_json::json;

use cluster_client::config::{read_config, validate_config};
use cluster_client::health::probe_server;
use cluster_client::observability::{logging, metrics};
use cluster_client::{Client, ClientConfig, ServerAddress};

#[derive(Parser)]
#[command(name = "cluster-cli")]
#[command(about = "Talk to a cluster through the pooled RPC client", long_about = None)]
struct Cli {
    /// TOML config file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Server address (repeatable); replaces server_addresses from the config
    #[arg(short, long = "server")]
    servers: Vec<ServerAddress>,

    /// Log level, overridden by RUST_LOG
    #[arg(long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Send a text payload and print the responses
    Send {
        text: String,

        /// Number of requests to send
        #[arg(long, default_value_t = 1)]
        count: u32,

        /// Per-request response timeout
        #[arg(long)]
        timeout_ms: Option<u64>,
    },
    /// Connect (and handshake) to every server once
    Probe,
    /// Print server health and pool statistics as JSON
    Stats,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => read_config(path)?,
        None => ClientConfig::default(),
    };
    if !cli.servers.is_empty() {
        config.server_addresses = cli.servers.clone();
    }
    if let Some(level) = &cli.log_level {
        config.observability.log_level = level.clone();
    }
    if let Err(errors) = validate_config(&config) {
        for error in &errors {
            eprintln!("config error: {}", error);
        }
        std::process::exit(2);
    }

    logging::init(&config.observability.log_level);
    if config.observability.metrics_enabled {
        let addr: SocketAddr = config.observability.metrics_address.parse()?;
        metrics::init_metrics(addr);
    }

    match cli.command {
        Commands::Send {
            text,
            count,
            timeout_ms,
        } => {
            let client = Client::new(config)?;
            let timeout = timeout_ms
                .map(Duration::from_millis)
                .unwrap_or_else(|| client.config().handle_timeout());

            let mut failures = 0;
            for i in 0..count {
                let result = client
                    .send_request(text.as_bytes(), utf8, timeout)
                    .await;
                match result {
                    Ok(response) => println!("{}", response),
                    Err(e) => {
                        failures += 1;
                        eprintln!("request {} failed: {}", i + 1, e);
                    }
                }
            }
            client.close();
            if failures > 0 {
                std::process::exit(1);
            }
        }
        Commands::Probe => {
            let settings = config.connect_settings();
            let timeout = config.health.probe_timeout();
            let mut failures = 0;
            for server in &config.server_addresses {
                match probe_server(server, &settings, timeout).await {
                    Ok(()) => println!("{}: ok", server),
                    Err(e) => {
                        failures += 1;
                        println!("{}: {}", server, e);
                    }
                }
            }
            if failures > 0 {
                std::process::exit(1);
            }
        }
        Commands::Stats => {
            let client = Client::new(config)?;
            let servers: Vec<_> = client
                .server_health()
                .into_iter()
                .map(|health| {
                    let pool = client.server_pool_stats(&health.address);
                    json!({ "health": health, "pool": pool })
                })
                .collect();
            let report = json!({
                "client_id": client.id(),
                "servers": servers,
                "totals": client.pool_stats(),
            });
            println!("{}", serde_json::to_string_pretty(&report)?);
            client.close();
        }
    }

    Ok(())
}

fn utf8(body: Bytes) -> Result<String, std::string::FromUtf8Error> {
    String::from_utf8(body.to_vec())
}
