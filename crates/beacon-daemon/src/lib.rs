//! beacon-daemon library: native transports and daemon settings.
//!
//! Exposed as a library so integration tests can drive the transports
//! directly.

pub mod settings;
pub mod store;
pub mod udp;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use beacon_core::Transport;
use tracing::warn;

pub use settings::{Settings, TransportKind, TransportSettings};
pub use store::{StoreConfig, StoreTransport};
pub use udp::{UdpConfig, UdpMulticastTransport};

/// Open the transport selected by `settings` for `channel`.
///
/// `Auto` tries UDP multicast first and falls back to the directory store
/// when the socket cannot be opened. Must be called inside a Tokio runtime.
pub fn open_transport(channel: &str, settings: &TransportSettings) -> Result<Arc<dyn Transport>> {
    match settings.kind {
        TransportKind::Udp => Ok(Arc::new(open_udp(channel, settings)?)),
        TransportKind::Store => Ok(Arc::new(open_store(channel, settings)?)),
        TransportKind::Auto => match open_udp(channel, settings) {
            Ok(udp) => Ok(Arc::new(udp)),
            Err(e) => {
                warn!(
                    "Multicast unavailable ({:#}); falling back to store at {:?}. Delivery is limited to this host.",
                    e,
                    settings.store_dir()
                );
                Ok(Arc::new(open_store(channel, settings)?))
            }
        },
    }
}

fn open_udp(channel: &str, settings: &TransportSettings) -> Result<UdpMulticastTransport> {
    let config = UdpConfig {
        group: settings.group,
        port: settings.port,
        ..UdpConfig::default()
    };
    UdpMulticastTransport::bind(channel, &config)
        .with_context(|| format!("Failed to join {}:{}", settings.group, settings.port))
}

fn open_store(channel: &str, settings: &TransportSettings) -> Result<StoreTransport> {
    let dir = settings.store_dir();
    let config = StoreConfig::new(&dir).with_ttl(Duration::from_millis(settings.store_ttl_ms));
    StoreTransport::open(channel, config)
        .with_context(|| format!("Failed to open store directory {:?}", dir))
}
