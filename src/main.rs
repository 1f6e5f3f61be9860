use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use holepunch::nat_traversal::DEFAULT_REMOTE_RETRIES;
use holepunch::rendezvous::{run_rendezvous_server, ServerConfig, DEFAULT_PORT};
use holepunch::{ClientConfig, PeerRoute, Receiver, Sender};
use std::net::SocketAddr;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

/// UDP rendezvous and hole punching
#[derive(Parser, Debug)]
#[command(name = "holepunch", version, about)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the rendezvous server
    Server {
        /// UDP port to listen on
        #[arg(short, long, env = "HOLEPUNCH_PORT", default_value_t = DEFAULT_PORT)]
        port: u16,

        /// Forget registrations not refreshed for this many seconds
        #[arg(long, env = "HOLEPUNCH_TTL_SECS")]
        ttl_secs: Option<u64>,
    },

    /// Register with the server and wait for a receiver
    Send {
        #[command(flatten)]
        client: ClientArgs,
    },

    /// Connect to the sender registered under IDENTIFIER
    Receive {
        #[command(flatten)]
        client: ClientArgs,

        /// Identifier printed by the sender
        identifier: String,
    },
}

#[derive(clap::Args, Debug)]
struct ClientArgs {
    /// Rendezvous server, host:port
    #[arg(short, long, env = "HOLEPUNCH_SERVER")]
    server: String,

    /// Wait per attempt, in milliseconds
    #[arg(long, env = "HOLEPUNCH_RETRY_MS", default_value_t = 3000)]
    retry_ms: u64,

    /// Public address attempts after the first one
    #[arg(long, env = "HOLEPUNCH_REMOTE_RETRIES", default_value_t = DEFAULT_REMOTE_RETRIES)]
    remote_retries: u32,
}

impl ClientArgs {
    async fn config(&self) -> Result<ClientConfig> {
        let server_addr: SocketAddr = tokio::net::lookup_host(&self.server)
            .await
            .with_context(|| format!("Failed to resolve rendezvous server {}", self.server))?
            .next()
            .with_context(|| format!("No address found for {}", self.server))?;

        Ok(ClientConfig::new(server_addr)
            .with_retry_interval(Duration::from_millis(self.retry_ms))
            .with_remote_retries(self.remote_retries))
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();

    match cli.command {
        Command::Server { port, ttl_secs } => {
            let mut config = ServerConfig::new(port);
            if let Some(ttl) = ttl_secs {
                config = config.with_registration_ttl(Duration::from_secs(ttl));
            }
            run_rendezvous_server(config)
                .await
                .context("Rendezvous server failed")?;
        }
        Command::Send { client } => run_sender(client.config().await?).await?,
        Command::Receive { client, identifier } => {
            run_receiver(client.config().await?, &identifier).await?
        }
    }

    Ok(())
}

/// Cancel `token` on Ctrl-C
fn cancel_on_ctrl_c(token: CancellationToken) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            token.cancel();
        }
    });
}

async fn run_sender(config: ClientConfig) -> Result<()> {
    let mut sender = Sender::new(config).context("Failed to open sender socket")?;
    sender.set_delegate(|identifier: &str| {
        println!("Identifier: {}", identifier);
        println!("Give this to the receiver.");
        println!();
    });
    cancel_on_ctrl_c(sender.cancellation_token());

    println!("Registering with rendezvous server...");
    sender
        .connect_to_receiver()
        .await
        .context("Failed to connect to receiver")?;

    print_connection(sender.peer_address(), sender.route());
    drop(sender.into_socket()?);
    Ok(())
}

async fn run_receiver(config: ClientConfig, identifier: &str) -> Result<()> {
    let mut receiver = Receiver::new(config).context("Failed to open receiver socket")?;
    receiver.set_delegate(|| {
        eprintln!("The server doesn't know that identifier.");
    });
    cancel_on_ctrl_c(receiver.cancellation_token());

    println!("Looking up {}...", identifier);
    receiver
        .connect_to_sender(identifier)
        .await
        .with_context(|| format!("Failed to connect to sender {}", identifier))?;

    print_connection(receiver.peer_address(), receiver.route());
    drop(receiver.into_socket()?);
    Ok(())
}

fn print_connection(peer: Option<SocketAddr>, route: Option<PeerRoute>) {
    println!();
    println!("✅ Connected!");
    if let Some(peer) = peer {
        println!("  Peer address : {}", peer);
    }
    if let Some(route) = route {
        println!("  Route        : {}", route);
    }
}
