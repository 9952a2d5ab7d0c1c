//! Mainline DHT presence for seeded bundles

use anyhow::Result;
use mainline::{Dht, Id};
use std::collections::HashSet;
use std::net::SocketAddrV4;
use tracing::{debug, info};

/// Upper bound on distinct peers counted per bundle
const MAX_SWARM_PEERS: usize = 50;

/// What one DHT round learned about a bundle's swarm
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SwarmSighting {
    pub announced: bool,
    /// Distinct remote addresses, capped at `MAX_SWARM_PEERS`
    pub peers: usize,
}

/// One DHT client shared by every session of an engine. Calls block on
/// network round trips, so run them on a blocking thread.
pub struct DhtAnnouncer {
    dht: Dht,
    port: u16,
}

impl DhtAnnouncer {
    pub fn new(port: u16) -> Result<Self> {
        let dht = Dht::client()?;
        info!("DHT client started, advertising port {}", port);
        Ok(Self { dht, port })
    }

    /// Advertise `info_hash` and count the peers already in its swarm. An
    /// announce failure still reports the peers found.
    pub fn sight(&self, info_hash: [u8; 20]) -> Result<SwarmSighting> {
        let id = Id::from_bytes(info_hash)?;
        let announced = match self.dht.announce_peer(id, Some(self.port)) {
            Ok(_) => true,
            Err(e) => {
                debug!("DHT announce for {} failed: {}", hex::encode(info_hash), e);
                false
            }
        };
        let peers = distinct_peers(self.dht.get_peers(id), MAX_SWARM_PEERS).len();
        Ok(SwarmSighting { announced, peers })
    }
}

/// Lookups answer in batches that repeat addresses; stop once `cap` are known
fn distinct_peers<I>(batches: I, cap: usize) -> HashSet<SocketAddrV4>
where
    I: IntoIterator,
    I::Item: IntoIterator<Item = SocketAddrV4>,
{
    let mut seen = HashSet::new();
    for batch in batches {
        for addr in batch {
            if seen.len() >= cap {
                return seen;
            }
            seen.insert(addr);
        }
    }
    seen
}
