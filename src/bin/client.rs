//! lproxy client binary
//!
//! Usage: lproxy-client [OPTIONS]
//!
//! Options:
//!   -c, --config <FILE>  Run the client with a configuration file
//!   -g, --generate       Print a sample configuration
//!   -v, --version        Print version
//!   -h, --help           Print help information

use std::env;
use std::sync::Arc;

use lproxy::proxy::{run_socks5_server, RequestHandler};
use lproxy::transport::WsDialer;
use lproxy::{ClientConfig, ClientConfigFile, Pool};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let args: Vec<String> = env::args().collect();

    if args.len() < 2 {
        print_usage();
        return Ok(());
    }

    match args[1].as_str() {
        "-h" | "--help" => {
            print_usage();
        }
        "-v" | "--version" => {
            println!("lproxy-client {}", lproxy::VERSION);
        }
        "-g" | "--generate" => {
            generate_config()?;
        }
        "-c" | "--config" => {
            if args.len() < 3 {
                eprintln!("Error: --config requires a file path");
                return Ok(());
            }
            run_client(&args[2]).await?;
        }
        _ => {
            eprintln!("Unknown option: {}", args[1]);
            print_usage();
        }
    }

    Ok(())
}

fn print_usage() {
    println!(
        r#"lproxy client - SOCKS5 over multiplexed WebSocket tunnels

USAGE:
    lproxy-client [OPTIONS]

OPTIONS:
    -c, --config <FILE>  Run the client with a configuration file
    -g, --generate       Print a sample configuration
    -v, --version        Print version
    -h, --help           Print help information

CONFIGURATION FILE FORMAT (JSON):
    {{
        "url": "wss://relay.example.com/tunnel",
        "uuid": "<identity token>",
        "listen_addr": "127.0.0.1:8020",
        "tunnel_count": 2,
        "flow_capacity": 200
    }}

ENVIRONMENT:
    RUST_LOG             Log filter (default: info)

EXAMPLES:
    Generate a configuration:
        lproxy-client --generate > client.json

    Run the client:
        lproxy-client --config client.json
"#
    );
}

fn generate_config() -> anyhow::Result<()> {
    let config = ClientConfig::new("wss://relay.example.com/tunnel", "replace-with-your-uuid");
    let config_file = ClientConfigFile::from_config(&config);
    println!("{}", serde_json::to_string_pretty(&config_file)?);
    Ok(())
}

async fn run_client(config_path: &str) -> anyhow::Result<()> {
    let config = load_config(config_path)?;

    tracing::info!(
        "Relay {} with {} tunnels, {} flow slots",
        config.url,
        config.tunnel_count,
        config.flow_capacity
    );

    let dialer = WsDialer::new(config.tunnel_url()?, config.connect_timeout);
    let listen_addr = config.listen_addr.clone();
    let pool = Pool::new(config, Arc::new(dialer))?;
    pool.start();

    let handler: Arc<dyn RequestHandler> = pool.clone();
    let server = tokio::spawn(async move { run_socks5_server(&listen_addr, handler).await });

    tokio::select! {
        result = server => {
            match result {
                Ok(Ok(())) => {}
                Ok(Err(e)) => tracing::error!("SOCKS5 server failed: {}", e),
                Err(e) => tracing::error!("SOCKS5 server task failed: {}", e),
            }
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Shutting down");
        }
    }

    pool.shutdown().await;
    Ok(())
}

fn load_config(path: &str) -> anyhow::Result<ClientConfig> {
    let content = std::fs::read_to_string(path)?;
    let config_file: ClientConfigFile = serde_json::from_str(&content)?;
    let config = config_file.to_config()?;
    Ok(config)
}
