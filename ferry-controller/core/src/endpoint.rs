//! Endpoint descriptors used in tunnel rules.
//!
//! ```text
//! listen    := ":" uint16
//! tcp-tgt   := host ":" uint16
//! unix-ep   := "unix://" abs-path
//! ssh-hop   := "ssh://" [user "@"] host ":" uint16 ["?" query]
//! ```
//!
//! Any other `scheme://...` string is an opaque proxy and is carried verbatim.

use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use std::{collections::BTreeMap, fmt, str::FromStr};

const UNIX_SCHEME: &str = "unix://";
const SSH_SCHEME: &str = "ssh://";

pub const IDENTITY_FILE_PARAM: &str = "identity_file";
pub const TARGET_HUB_PARAM: &str = "target_hub";

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum Endpoint {
    /// Listens on (or dials) a local TCP port.
    Listen(u16),

    /// A `host:port` target.
    Tcp { host: String, port: u16 },

    /// A unix socket, holding its absolute path.
    Unix(String),

    Ssh(SshHop),

    /// An opaque proxy URI, e.g. `socks5://proxy:1080`.
    Proxy(String),
}

/// An SSH hop. Query parameters are kept sorted so encoding is stable.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct SshHop {
    pub user: Option<String>,
    pub address: String,
    pub params: BTreeMap<String, String>,
}

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    #[error("invalid port in endpoint {0:?}")]
    InvalidPort(String),

    #[error("unix socket path must be absolute: {0:?}")]
    RelativeSocket(String),

    #[error("missing address in endpoint {0:?}")]
    MissingAddress(String),

    #[error("malformed query in endpoint {0:?}")]
    MalformedQuery(String),
}

// === impl Endpoint ===

impl Endpoint {
    pub fn unix(path: impl ToString) -> Self {
        Self::Unix(path.to_string())
    }

    pub fn tcp(host: impl ToString, port: u16) -> Self {
        Self::Tcp {
            host: host.to_string(),
            port,
        }
    }

    pub fn is_unix(&self) -> bool {
        matches!(self, Self::Unix(_))
    }

    pub fn as_ssh(&self) -> Option<&SshHop> {
        match self {
            Self::Ssh(hop) => Some(hop),
            _ => None,
        }
    }

    /// The `host:port` a peer dials to reach this endpoint, if it has one.
    pub fn address(&self) -> Option<String> {
        match self {
            Self::Tcp { host, port } => Some(format!("{host}:{port}")),
            Self::Ssh(hop) => Some(hop.address.clone()),
            Self::Proxy(uri) => {
                let (_, rest) = uri.split_once("://")?;
                let authority = rest.split(['/', '?']).next()?;
                let host = authority.rsplit('@').next()?;
                (!host.is_empty()).then(|| host.to_string())
            }
            Self::Listen(_) | Self::Unix(_) => None,
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Listen(port) => write!(f, ":{port}"),
            Self::Tcp { host, port } => write!(f, "{host}:{port}"),
            Self::Unix(path) => write!(f, "{UNIX_SCHEME}{path}"),
            Self::Ssh(hop) => hop.fmt(f),
            Self::Proxy(uri) => f.write_str(uri),
        }
    }
}

impl FromStr for Endpoint {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Some(path) = s.strip_prefix(UNIX_SCHEME) {
            if !path.starts_with('/') {
                return Err(ParseError::RelativeSocket(s.to_string()));
            }
            return Ok(Self::Unix(path.to_string()));
        }

        if s.starts_with(SSH_SCHEME) {
            return s.parse().map(Self::Ssh);
        }

        if s.contains("://") {
            return Ok(Self::Proxy(s.to_string()));
        }

        let (host, port) = s
            .rsplit_once(':')
            .ok_or_else(|| ParseError::InvalidPort(s.to_string()))?;
        let port = port
            .parse()
            .map_err(|_| ParseError::InvalidPort(s.to_string()))?;
        if host.is_empty() {
            Ok(Self::Listen(port))
        } else {
            Ok(Self::tcp(host, port))
        }
    }
}

impl Serialize for Endpoint {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Endpoint {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(de::Error::custom)
    }
}

// === impl SshHop ===

impl SshHop {
    /// A hop to the tunnel of `hub`, listening at `address`.
    pub fn to_hub(address: impl ToString, hub: impl ToString) -> Self {
        let mut params = BTreeMap::new();
        params.insert(TARGET_HUB_PARAM.to_string(), hub.to_string());
        Self {
            user: None,
            address: address.to_string(),
            params,
        }
    }

    pub fn target_hub(&self) -> Option<&str> {
        self.params.get(TARGET_HUB_PARAM).map(String::as_str)
    }

    pub fn identity_file(&self) -> Option<&str> {
        self.params.get(IDENTITY_FILE_PARAM).map(String::as_str)
    }

    /// Sets the login user and the key it authenticates with.
    pub fn authenticate(&mut self, user: impl ToString, identity_file: impl ToString) {
        self.user = Some(user.to_string());
        self.params
            .insert(IDENTITY_FILE_PARAM.to_string(), identity_file.to_string());
    }
}

impl fmt::Display for SshHop {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(SSH_SCHEME)?;
        if let Some(user) = &self.user {
            write!(f, "{user}@")?;
        }
        f.write_str(&self.address)?;
        for (i, (k, v)) in self.params.iter().enumerate() {
            let sep = if i == 0 { '?' } else { '&' };
            write!(f, "{sep}{k}={v}")?;
        }
        Ok(())
    }
}

impl FromStr for SshHop {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let rest = s
            .strip_prefix(SSH_SCHEME)
            .ok_or_else(|| ParseError::MissingAddress(s.to_string()))?;
        let (authority, query) = match rest.split_once('?') {
            Some((authority, query)) => (authority, Some(query)),
            None => (rest, None),
        };

        let (user, address) = match authority.rsplit_once('@') {
            Some((user, address)) => (Some(user.to_string()), address),
            None => (None, authority),
        };
        if address.is_empty() {
            return Err(ParseError::MissingAddress(s.to_string()));
        }
        match address.rsplit_once(':') {
            Some((_, port)) if port.parse::<u16>().is_ok() => {}
            _ => return Err(ParseError::InvalidPort(s.to_string())),
        }

        let mut params = BTreeMap::new();
        for pair in query.into_iter().flat_map(|q| q.split('&')) {
            if pair.is_empty() {
                continue;
            }
            let (k, v) = pair
                .split_once('=')
                .ok_or_else(|| ParseError::MalformedQuery(s.to_string()))?;
            params.insert(k.to_string(), v.to_string());
        }

        Ok(Self {
            user,
            address: address.to_string(),
            params,
        })
    }
}
