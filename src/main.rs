use std::net::{IpAddr, Ipv4Addr, SocketAddr};

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{debug, info, warn};
use tracing_subscriber::{fmt, EnvFilter};

use meshcast::{DiscoveryConfig, Identity, Node, NodeConfig, PeerAddr, DEFAULT_SERVICE_TAG};

/// Chat line as carried in a gossip payload.
#[derive(Serialize, Deserialize, Debug)]
struct ChatMessage {
    message: String,
    sender_id: String,
    sender_nick: String,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, ValueEnum)]
enum Mode {
    #[default]
    Peer,
    /// Print the address other nodes should pass to `--bootstrap`.
    Bootstrap,
}

#[derive(Parser, Debug)]
#[command(name = "meshcast")]
#[command(author, version, about = "Chat over a meshcast gossip topic", long_about = None)]
struct Args {
    /// Chat room; the gossip topic is `chat-room<ROOM>`.
    #[arg(short, long, default_value = "test")]
    room: String,

    /// Display name. Defaults to `$USER-<last 8 hex of peer id>`.
    #[arg(short, long)]
    nick: Option<String>,

    /// QUIC listening port, 0 for an ephemeral one.
    #[arg(short, long, default_value_t = 4001)]
    port: u16,

    #[arg(short = 'B', long = "bootstrap", value_name = "PEER_ADDR")]
    bootstrap: Vec<PeerAddr>,

    #[arg(long, value_enum, default_value_t = Mode::Peer)]
    mode: Mode,

    /// Disable local-network discovery.
    #[arg(long)]
    no_mdns: bool,

    #[arg(long, default_value = DEFAULT_SERVICE_TAG)]
    service_tag: String,
}

fn default_nick(peer_id: Identity) -> String {
    let user = std::env::var("USER").unwrap_or_else(|_| "anon".to_string());
    let hex = peer_id.to_hex();
    format!("{}-{}", user, &hex[hex.len() - 8..])
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .with_writer(std::io::stderr)
        .init();

    let mut config = NodeConfig::default()
        .with_bind_addr(SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), args.port));
    config.discovery = if args.no_mdns {
        None
    } else {
        Some(DiscoveryConfig::default().with_service_tag(args.service_tag.clone()))
    };

    let node = Node::bind(config)
        .await
        .with_context(|| format!("cannot start node on port {}", args.port))?;

    println!("Listening on {}", node.local_addr());
    println!("Peer ID: {}", node.peer_id());
    if args.mode == Mode::Bootstrap {
        println!("Bootstrap address (pass to --bootstrap):");
        for addr in node.routable_peer_addrs() {
            println!("  {}", addr);
        }
    }

    if !args.bootstrap.is_empty() {
        match node.bootstrap(&args.bootstrap).await {
            Ok(found) => info!(learned = found.len(), "bootstrap complete"),
            Err(e) => warn!(error = %e, "bootstrap failed"),
        }
    }

    let nick = args.nick.clone().unwrap_or_else(|| default_nick(node.peer_id()));
    let topic = format!("chat-room{}", args.room);
    let mut room = node
        .join(&topic)
        .await
        .with_context(|| format!("failed to join room '{}'", args.room))?;
    println!("Joined room '{}' as {}. Type /quit to exit.", args.room, nick);

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received shutdown signal, exiting gracefully");
                break;
            }
            line = lines.next_line() => {
                let Some(line) = line.context("failed to read stdin")? else {
                    break;
                };
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                if line == "/quit" {
                    break;
                }
                let chat = ChatMessage {
                    message: line.to_string(),
                    sender_id: node.peer_id().to_hex(),
                    sender_nick: nick.clone(),
                };
                let payload = serde_json::to_vec(&chat).context("failed to encode chat message")?;
                if let Err(e) = node.publish(&topic, payload).await {
                    warn!(error = %e, "publish failed");
                }
            }
            delivery = room.recv() => {
                let Some(delivery) = delivery else {
                    break;
                };
                if delivery.is_local() {
                    continue;
                }
                match serde_json::from_slice::<ChatMessage>(&delivery.payload) {
                    Ok(chat) => println!("{} : {}", chat.sender_nick, chat.message),
                    Err(e) => debug!(error = %e, "skipping unparsable chat payload"),
                }
            }
        }
    }

    node.shutdown().await;
    Ok(())
}
