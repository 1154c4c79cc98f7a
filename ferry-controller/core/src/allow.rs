use serde::{Deserialize, Serialize};
use std::fmt;

/// The SSH request kinds a hub may grant a peer.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Kind {
    DirectTcpip,
    DirectStreamlocal,
    TcpipForward,
    StreamlocalForward,
}

/// Allow/block targets for a single request kind.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Permission {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<bool>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub allows: Vec<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub blocks: Vec<String>,
}

/// Everything a hub grants one inbound peer.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllowList {
    #[serde(rename = "direct-streamlocal", default)]
    pub direct_streamlocal: Permission,

    #[serde(rename = "direct-tcpip", default)]
    pub direct_tcpip: Permission,

    #[serde(rename = "streamlocal-forward", default)]
    pub streamlocal_forward: Permission,

    #[serde(rename = "tcpip-forward", default)]
    pub tcpip_forward: Permission,
}

// === impl Kind ===

impl fmt::Display for Kind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::DirectTcpip => "direct-tcpip",
            Self::DirectStreamlocal => "direct-streamlocal",
            Self::TcpipForward => "tcpip-forward",
            Self::StreamlocalForward => "streamlocal-forward",
        })
    }
}

// === impl Permission ===

impl Permission {
    pub fn is_empty(&self) -> bool {
        self.default.is_none() && self.allows.is_empty() && self.blocks.is_empty()
    }

    /// Unions allows and blocks. A default survives only when both sides agree.
    pub fn merge(&mut self, other: &Permission) {
        if self.default != other.default {
            self.default = None;
        }
        union(&mut self.allows, &other.allows);
        union(&mut self.blocks, &other.blocks);
    }
}

fn union(into: &mut Vec<String>, from: &[String]) {
    into.extend(from.iter().cloned());
    into.sort();
    into.dedup();
}

// === impl AllowList ===

impl AllowList {
    /// An allow list granting a single target.
    pub fn allow(kind: Kind, target: impl ToString) -> Self {
        let mut list = Self::default();
        list.permission_mut(kind).allows.push(target.to_string());
        list
    }

    pub fn permission(&self, kind: Kind) -> &Permission {
        match kind {
            Kind::DirectTcpip => &self.direct_tcpip,
            Kind::DirectStreamlocal => &self.direct_streamlocal,
            Kind::TcpipForward => &self.tcpip_forward,
            Kind::StreamlocalForward => &self.streamlocal_forward,
        }
    }

    pub fn permission_mut(&mut self, kind: Kind) -> &mut Permission {
        match kind {
            Kind::DirectTcpip => &mut self.direct_tcpip,
            Kind::DirectStreamlocal => &mut self.direct_streamlocal,
            Kind::TcpipForward => &mut self.tcpip_forward,
            Kind::StreamlocalForward => &mut self.streamlocal_forward,
        }
    }

    pub fn merge(&mut self, other: &AllowList) {
        self.direct_streamlocal.merge(&other.direct_streamlocal);
        self.direct_tcpip.merge(&other.direct_tcpip);
        self.streamlocal_forward.merge(&other.streamlocal_forward);
        self.tcpip_forward.merge(&other.tcpip_forward);
    }

    pub fn is_empty(&self) -> bool {
        self.direct_streamlocal.is_empty()
            && self.direct_tcpip.is_empty()
            && self.streamlocal_forward.is_empty()
            && self.tcpip_forward.is_empty()
    }
}
