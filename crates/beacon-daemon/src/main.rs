//! beacon: headless peer for a beacon channel.
//!
//! Joins a channel over UDP multicast (or the directory store fallback),
//! takes part in leader election and logs membership changes. With
//! `--ping-interval-ms` it also sends a leader-directed `ping` on a timer,
//! which the current leader logs.

use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use beacon_core::{BeaconEvent, Peer, PeerId};
use beacon_daemon::{open_transport, Settings, TransportKind};
use clap::Parser;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "beacon")]
#[command(about = "Leader election and failure detection peer")]
struct Args {
    /// JSON config file; command-line flags override it
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Channel to join
    #[arg(long)]
    channel: Option<String>,

    /// Broadcast medium
    #[arg(long, value_enum)]
    transport: Option<TransportKind>,

    /// Directory for the store transport
    #[arg(long)]
    store_dir: Option<PathBuf>,

    /// Multicast group
    #[arg(long)]
    group: Option<Ipv4Addr>,

    /// Multicast port
    #[arg(long)]
    port: Option<u16>,

    /// Peer ID (generated if not provided)
    #[arg(long)]
    peer_id: Option<String>,

    /// Heartbeat interval in milliseconds
    #[arg(long)]
    heartbeat_ms: Option<u64>,

    /// Stale threshold in milliseconds
    #[arg(long)]
    stale_ms: Option<u64>,

    /// Send a leader-directed ping this often (milliseconds)
    #[arg(long)]
    ping_interval_ms: Option<u64>,

    /// Enable verbose logging
    #[arg(long)]
    verbose: bool,
}

impl Args {
    /// Fold command-line overrides into file settings.
    fn apply(self, mut settings: Settings) -> Settings {
        if let Some(channel) = self.channel {
            settings.beacon.channel_name = channel;
        }
        if let Some(kind) = self.transport {
            settings.transport.kind = kind;
        }
        if let Some(dir) = self.store_dir {
            settings.transport.store_dir = Some(dir);
        }
        if let Some(group) = self.group {
            settings.transport.group = group;
        }
        if let Some(port) = self.port {
            settings.transport.port = port;
        }
        if let Some(peer_id) = self.peer_id {
            settings.peer_id = Some(peer_id);
        }
        if let Some(ms) = self.heartbeat_ms {
            settings.beacon.heartbeat_interval_ms = ms;
        }
        if let Some(ms) = self.stale_ms {
            settings.beacon.stale_threshold_ms = ms;
        }
        if let Some(ms) = self.ping_interval_ms {
            settings.ping_interval_ms = Some(ms);
        }
        settings
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct Ping {
    seq: u64,
}

fn log_event(event: &BeaconEvent) {
    match event {
        BeaconEvent::MemberJoined { peer_id } => info!("Member joined: {}", peer_id),
        BeaconEvent::MemberLeft { peer_id, reason } => {
            info!("Member left: {} ({:?})", peer_id, reason)
        }
        BeaconEvent::LeaderChanged { leader: Some(leader) } => info!("Leader is now {}", leader),
        BeaconEvent::LeaderChanged { leader: None } => info!("No leader known"),
        BeaconEvent::RoleChanged { is_leader: true } => info!("This peer is the leader"),
        BeaconEvent::RoleChanged { is_leader: false } => info!("This peer is a follower"),
        BeaconEvent::ServerConnectedChanged { connected } => {
            info!("Server connected: {}", connected)
        }
        BeaconEvent::MemberSeen { .. } => {}
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Set up logging - respects RUST_LOG env var, defaults to info (or debug with --verbose)
    let default_filter = if args.verbose {
        "debug,beacon_core=debug,beacon_daemon=debug"
    } else {
        "info,beacon_daemon=info"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let settings = Settings::load_or_default(args.config.as_deref())?;
    let settings = args.apply(settings);
    settings
        .beacon
        .validate()
        .context("Invalid beacon configuration")?;

    info!("Starting beacon");
    info!("Channel: {}", settings.beacon.channel_name);

    let transport = open_transport(&settings.beacon.channel_name, &settings.transport)?;

    let peer_id = match &settings.peer_id {
        Some(id) => id
            .parse::<PeerId>()
            .with_context(|| format!("Invalid peer ID: {:?}", id))?,
        None => {
            let id = PeerId::generate();
            info!("Generated peer ID: {}", id);
            id
        }
    };

    let peer = Peer::start_with_id(peer_id, settings.beacon.clone(), transport)
        .context("Failed to start peer")?;
    info!("Peer {} running. Press Ctrl+C to stop.", peer.self_id());

    let _events = peer.subscribe(log_event);
    let _ping_handler = peer.register_typed("ping", |ping: Ping, delivery| {
        info!("Leader received ping #{} from {}", ping.seq, delivery.sender_id);
    });

    let ping_period = settings
        .ping_interval_ms
        .filter(|ms| *ms > 0)
        .map(Duration::from_millis);
    let mut ping_timer = tokio::time::interval(ping_period.unwrap_or(Duration::from_secs(3600)));
    ping_timer.tick().await;
    let mut seq = 0u64;

    loop {
        tokio::select! {
            _ = ping_timer.tick(), if ping_period.is_some() => {
                seq += 1;
                match peer.send_to_leader("ping", &Ping { seq }) {
                    Ok(()) => debug!("Sent ping #{} to leader {:?}", seq, peer.leader()),
                    Err(e) => warn!("Failed to send ping: {}", e),
                }
            }

            // Handle graceful shutdown
            _ = tokio::signal::ctrl_c() => {
                info!("Shutdown signal received");
                break;
            }
        }
    }

    info!(
        "Shutting down ({} members, leader {:?})",
        peer.members().len(),
        peer.leader()
    );
    peer.stop();
    let stats = peer.stats();
    info!(
        "Sent {} / received {} / dropped {} messages, {} election(s), {} eviction(s)",
        stats.messages_sent,
        stats.messages_received,
        stats.messages_dropped,
        stats.elections_initiated,
        stats.members_evicted
    );
    Ok(())
}
