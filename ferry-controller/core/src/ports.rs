//! Bind port allocation.
//!
//! Every import hub owns an allocator handing out ports from a fixed pool, one
//! per exported service port. Assignments are recovered from the hub's
//! existing tunnel resources on startup so that they stay stable across
//! controller restarts.

use ahash::AHashMap as HashMap;
use std::ops::Range;

pub const DEFAULT_PORT_START: u16 = 40000;
pub const DEFAULT_PORT_COUNT: u16 = 10000;

/// An exported service port, as seen from an import hub.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PortPeer {
    pub export_hub: String,
    pub namespace: String,
    pub name: String,
    pub port: u16,
}

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum PortError {
    #[error("no free port left in {start}..{end}")]
    Exhausted { start: u16, end: u16 },

    #[error("invalid port {0:?}")]
    InvalidPort(String),

    #[error("port {port} is already bound to {owner:?}")]
    Conflict { port: u16, owner: PortPeer },
}

#[derive(Debug)]
pub struct PortAllocator {
    range: Range<u16>,
    cursor: u16,
    port_to_peer: HashMap<u16, PortPeer>,
    peer_to_port: HashMap<PortPeer, u16>,
}

// === impl PortPeer ===

impl PortPeer {
    pub fn new(
        export_hub: impl ToString,
        namespace: impl ToString,
        name: impl ToString,
        port: u16,
    ) -> Self {
        Self {
            export_hub: export_hub.to_string(),
            namespace: namespace.to_string(),
            name: name.to_string(),
            port,
        }
    }
}

// === impl PortAllocator ===

impl Default for PortAllocator {
    fn default() -> Self {
        Self::new(DEFAULT_PORT_START, DEFAULT_PORT_COUNT)
    }
}

impl PortAllocator {
    pub fn new(start: u16, count: u16) -> Self {
        let end = start.saturating_add(count);
        Self {
            range: start..end,
            cursor: start,
            port_to_peer: HashMap::default(),
            peer_to_port: HashMap::default(),
        }
    }

    /// Returns the port already bound to `peer`, without allocating.
    pub fn lookup(&self, peer: &PortPeer) -> Option<u16> {
        self.peer_to_port.get(peer).copied()
    }

    /// Returns the port bound to `peer`, allocating the next free one if needed.
    pub fn get(&mut self, peer: &PortPeer) -> Result<u16, PortError> {
        if let Some(port) = self.lookup(peer) {
            return Ok(port);
        }

        let count = self.range.len();
        let mut port = self.cursor;
        for _ in 0..count {
            if !self.port_to_peer.contains_key(&port) {
                self.bind(peer.clone(), port);
                self.cursor = self.next(port);
                return Ok(port);
            }
            port = self.next(port);
        }

        Err(PortError::Exhausted {
            start: self.range.start,
            end: self.range.end,
        })
    }

    /// Releases the port bound to `peer`. The cursor is not rewound.
    pub fn delete(&mut self, peer: &PortPeer) -> Option<u16> {
        let port = self.peer_to_port.remove(peer)?;
        self.port_to_peer.remove(&port);
        Some(port)
    }

    /// Records an existing assignment, e.g. one recovered from a hub.
    ///
    /// Re-registering the same assignment is a no-op.
    pub fn register(&mut self, peer: PortPeer, port: u16) -> Result<(), PortError> {
        if let Some(owner) = self.port_to_peer.get(&port) {
            if *owner == peer {
                return Ok(());
            }
            return Err(PortError::Conflict {
                port,
                owner: owner.clone(),
            });
        }

        if let Some(old) = self.peer_to_port.get(&peer).copied() {
            tracing::debug!(?peer, old, new = port, "Rebinding port peer");
            self.port_to_peer.remove(&old);
        }

        self.bind(peer, port);
        if self.range.contains(&port) && port >= self.cursor {
            self.cursor = self.next(port);
        }
        Ok(())
    }

    /// Records a batch of recovered assignments, stopping at the first conflict.
    pub fn load(
        &mut self,
        peers: impl IntoIterator<Item = (PortPeer, u16)>,
    ) -> Result<(), PortError> {
        for (peer, port) in peers {
            self.register(peer, port)?;
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.peer_to_port.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peer_to_port.is_empty()
    }

    fn bind(&mut self, peer: PortPeer, port: u16) {
        self.port_to_peer.insert(port, peer.clone());
        self.peer_to_port.insert(peer, port);
    }

    fn next(&self, port: u16) -> u16 {
        if port.saturating_add(1) >= self.range.end {
            self.range.start
        } else {
            port + 1
        }
    }
}

/// Parses a dash-separated port list, e.g. `80-443`.
pub fn parse_port_list(s: &str) -> Result<Vec<u16>, PortError> {
    s.split('-')
        .filter(|p| !p.trim().is_empty())
        .map(|p| {
            p.trim()
                .parse::<u16>()
                .map_err(|_| PortError::InvalidPort(p.to_string()))
        })
        .collect()
}

/// Formats ports as a dash-separated list.
pub fn format_port_list(ports: impl IntoIterator<Item = u16>) -> String {
    ports
        .into_iter()
        .map(|p| p.to_string())
        .collect::<Vec<_>>()
        .join("-")
}
