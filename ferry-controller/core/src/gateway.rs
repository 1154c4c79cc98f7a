/// Describes how a hub is dialed by its peers and how it dials out.
///
/// Way hints list hub names ordered from the farthest hop to the nearest
/// one, as seen from the hub that declares them.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Gateway {
    pub reachable: bool,

    /// `host:port` of the hub's SSH tunnel endpoint.
    pub address: String,

    pub navigation_way: Vec<String>,
    pub reception_way: Vec<String>,

    pub navigation_proxy: Vec<Hop>,
    pub reception_proxy: Vec<Hop>,
}

/// A proxy hop: either another hub's tunnel or an opaque proxy URI.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Hop {
    Hub(String),
    Proxy(String),
}

impl Gateway {
    pub fn reachable(address: impl ToString) -> Self {
        Self {
            reachable: true,
            address: address.to_string(),
            ..Default::default()
        }
    }

    pub fn unreachable() -> Self {
        Self::default()
    }
}
