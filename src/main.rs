use clap::{Parser, ValueEnum};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::info;
use tracing_subscriber::EnvFilter;

use rudict::client::{run_exerciser, UdpClient};
use rudict::config::{ClientConfig, ServerConfig, DEFAULT_PORT};
use rudict::server::UdpServer;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Mode {
    Server,
    Client,
    /// Periodic exerciser alternating LIST and random LOOKUPs.
    Teste,
}

#[derive(Parser)]
#[command(name = "rudict", about = "Shared dictionary service over reliable UDP")]
struct Args {
    /// Mode to run
    #[arg(long, value_enum)]
    mode: Mode,

    /// Address to bind (server) or connect to (client)
    #[arg(long, env = "HOST", default_value = "localhost")]
    address: String,

    /// Port to bind/connect to
    #[arg(long, env = "PORT", default_value_t = DEFAULT_PORT)]
    port: u16,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = match Args::try_parse() {
        Ok(args) => args,
        Err(e) if matches!(
            e.kind(),
            clap::error::ErrorKind::DisplayHelp | clap::error::ErrorKind::DisplayVersion
        ) =>
        {
            e.print()?;
            return Ok(());
        }
        Err(e) => {
            e.print()?;
            std::process::exit(1);
        }
    };

    match args.mode {
        Mode::Server => {
            let config = ServerConfig::new(args.address, args.port);
            info!(addr = %config.bind_addr(), "starting UDP server");
            let server = Arc::new(UdpServer::bind(config).await?);
            server.run().await
        }
        Mode::Client => {
            let config = ClientConfig::new(args.address, args.port);
            info!(addr = %config.server_addr(), "starting UDP client");
            let client = UdpClient::connect(config).await?;
            let _heartbeat = client.spawn_heartbeat();
            interactive_loop(&client).await
        }
        Mode::Teste => {
            let config = ClientConfig::new(args.address, args.port);
            info!(addr = %config.server_addr(), "starting exerciser");
            let client = UdpClient::connect(config).await?;
            run_exerciser(&client, Duration::from_secs(1)).await
        }
    }
}

async fn interactive_loop(client: &UdpClient) -> anyhow::Result<()> {
    println!("commands: LIST | LOOKUP <term> | INSERT <term> <definition> | UPDATE <term> <definition> | quit");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if line.eq_ignore_ascii_case("quit") {
            break;
        }

        match client.send_command(line).await {
            Ok(reply) => {
                println!("{} ({}): {}", reply.class().label(), reply.status, reply.message);
            }
            Err(e) => eprintln!("error: {:#}", e),
        }
    }
    Ok(())
}
