//! Builds the tunnel chains each hub on a way runs for one service port.
//!
//! For every adjacent pair of hubs on the way, the side that cannot be dialed
//! runs a chain that dials the reachable side:
//!
//! - When the exporting side is reachable, the importing hub runs a chain that
//!   listens locally and proxies through SSH hops to the exporting side.
//! - Otherwise, when the importing side is reachable, the exporting hub runs a
//!   chain that dials the importing side and asks it to forward its listener.
//!
//! Repeaters (hubs in the middle of the way) hand traffic between their two
//! chains over a unix socket. Three merge passes then fold chains together
//! wherever a single hub can dial further on its own, and finally every SSH
//! hop is authenticated as the hub running the chain, producing the inbound
//! allow list of each hub that is dialed.

use crate::{
    allow::{AllowList, Kind},
    endpoint::{Endpoint, ParseError, SshHop},
    Gateway, Hop, ServiceRef,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A pair of endpoint stacks run by a single hub.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chain {
    pub bind: Vec<Endpoint>,
    pub proxy: Vec<Endpoint>,
}

/// Everything one hub needs for one tunnel.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Bound {
    /// Chains this hub runs.
    pub outbound: Vec<Chain>,

    /// What this hub grants each peer that dials it.
    pub inbound: BTreeMap<String, AllowList>,
}

/// Chains keyed by the hub that runs them.
pub type Chains = BTreeMap<String, Vec<Chain>>;

/// Identifies the tunnel for a single exported service port.
#[derive(Clone, Debug)]
pub struct Tunnel<'a> {
    pub route: &'a str,
    pub service: &'a ServiceRef,
    pub export_port: u16,
    pub bind_port: u16,
    pub identity_file: &'a str,
}

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum ChainError {
    #[error("both export {export} and import {import} are unreachable")]
    Unreachable { export: String, import: String },

    #[error("a way needs at least two hubs, got {0:?}")]
    ShortWay(Vec<String>),

    #[error("invalid proxy endpoint: {0}")]
    Endpoint(#[from] ParseError),
}

// === impl Tunnel ===

impl Tunnel<'_> {
    fn origin(&self) -> Endpoint {
        Endpoint::tcp(
            format!("{}.{}.svc", self.service.name, self.service.namespace),
            self.export_port,
        )
    }

    fn socket(&self) -> Endpoint {
        Endpoint::unix(format!(
            "/dev/shm/{}-{}-{}-tunnel.socks",
            self.route, self.export_port, self.bind_port
        ))
    }
}

// === impl Bound ===

impl Bound {
    pub fn is_empty(&self) -> bool {
        self.outbound.is_empty() && self.inbound.is_empty()
    }
}

/// Builds the chains and allow lists of every hub on `way`.
pub fn build<G>(
    way: &[String],
    tunnel: &Tunnel<'_>,
    gateway: G,
) -> Result<BTreeMap<String, Bound>, ChainError>
where
    G: Fn(&str, &str) -> Gateway,
{
    let mut chains = raw(way, tunnel, &gateway)?;
    merge(way, &mut chains);
    Ok(authorize(chains, tunnel.identity_file))
}

/// Builds one chain per adjacent pair, before any merging.
pub fn raw<G>(way: &[String], tunnel: &Tunnel<'_>, gateway: G) -> Result<Chains, ChainError>
where
    G: Fn(&str, &str) -> Gateway,
{
    if way.len() < 2 {
        return Err(ChainError::ShortWay(way.to_vec()));
    }

    let last = way.len() - 1;
    let mut chains = Chains::new();
    for (i, pair) in way.windows(2).enumerate() {
        let (export, import) = (&pair[0], &pair[1]);
        let export_repeater = i != 0;
        let import_repeater = i + 1 != last;

        let bind = if import_repeater {
            tunnel.socket()
        } else {
            Endpoint::Listen(tunnel.bind_port)
        };
        let proxy = if export_repeater {
            tunnel.socket()
        } else {
            tunnel.origin()
        };
        let mut chain = Chain {
            bind: vec![bind],
            proxy: vec![proxy],
        };

        let export_gw = gateway(export, import);
        let import_gw = gateway(import, export);
        let runner = if export_gw.reachable {
            chain.proxy.push(hub_hop(export, &export_gw));
            chain
                .proxy
                .extend(expand(&export_gw.reception_proxy, import, &gateway)?);
            chain
                .proxy
                .extend(expand(&import_gw.navigation_proxy, import, &gateway)?);
            import
        } else if import_gw.reachable {
            chain.bind.push(hub_hop(import, &import_gw));
            chain
                .bind
                .extend(expand(&import_gw.reception_proxy, export, &gateway)?);
            chain
                .bind
                .extend(expand(&export_gw.navigation_proxy, export, &gateway)?);
            export
        } else {
            return Err(ChainError::Unreachable {
                export: export.clone(),
                import: import.clone(),
            });
        };

        chains.entry(runner.clone()).or_default().push(chain);
    }

    Ok(chains)
}

fn hub_hop(hub: &str, gateway: &Gateway) -> Endpoint {
    Endpoint::Ssh(SshHop::to_hub(&gateway.address, hub))
}

/// Expands proxy hops as dialed by `runner`.
fn expand<G>(hops: &[Hop], runner: &str, gateway: &G) -> Result<Vec<Endpoint>, ChainError>
where
    G: Fn(&str, &str) -> Gateway,
{
    hops.iter()
        .map(|hop| match hop {
            Hop::Hub(hub) => Ok(hub_hop(hub, &gateway(hub, runner))),
            Hop::Proxy(uri) => Ok(uri.parse()?),
        })
        .collect()
}

/// Applies the three merge passes in order. Each pass is idempotent.
pub fn merge(way: &[String], chains: &mut Chains) {
    merge_repeaters(chains);
    merge_reachable_exports(way, chains);
    merge_reachable_imports(way, chains);
    chains.retain(|_, chains| !chains.is_empty());
}

/// Fuses the two chains of a repeater that neither side can dial.
///
/// The first chain listens on the socket the second one dials; the fused chain
/// listens where the second did and dials what the first did.
fn merge_repeaters(chains: &mut Chains) {
    for (hub, hub_chains) in chains.iter_mut() {
        if let [first, second] = hub_chains.as_slice() {
            let shared = match (first.bind.first(), second.proxy.first()) {
                (Some(b), Some(p)) if b == p && b.is_unix() => b,
                _ => continue,
            };
            tracing::trace!(%hub, %shared, "Fusing repeater chains");
            let fused = Chain {
                bind: second.bind.clone(),
                proxy: first.proxy.clone(),
            };
            *hub_chains = vec![fused];
        }
    }
}

/// Folds a reachable exporting hub's chain into the importing hub's chain when
/// the exporting hub only relays over a unix socket.
fn merge_reachable_exports(way: &[String], chains: &mut Chains) {
    for pair in way.windows(2) {
        let (export, import) = (&pair[0], &pair[1]);
        let shared = match (single(chains, export), single(chains, import)) {
            (Some(e), Some(i))
                if e.bind.len() == 1
                    && e.bind[0].is_unix()
                    && i.proxy.first() == Some(&e.bind[0]) =>
            {
                e.bind[0].clone()
            }
            _ => continue,
        };

        tracing::trace!(%export, %import, %shared, "Merging reachable export");
        let Some(from) = chains.get_mut(export).and_then(Vec::pop) else {
            continue;
        };
        if let Some(into) = chains.get_mut(import).and_then(|c| c.first_mut()) {
            let mut proxy = from.proxy;
            proxy.extend(into.proxy.drain(1..));
            into.proxy = proxy;
        }
    }
}

/// Folds a reachable importing hub's chain into the exporting hub's chain when
/// the importing hub only relays from a unix socket.
fn merge_reachable_imports(way: &[String], chains: &mut Chains) {
    for pair in way.windows(2).rev() {
        let (export, import) = (&pair[0], &pair[1]);
        let shared = match (single(chains, export), single(chains, import)) {
            (Some(e), Some(i))
                if i.proxy.len() == 1
                    && i.proxy[0].is_unix()
                    && e.bind.first() == Some(&i.proxy[0]) =>
            {
                i.proxy[0].clone()
            }
            _ => continue,
        };

        tracing::trace!(%export, %import, %shared, "Merging reachable import");
        let Some(from) = chains.get_mut(import).and_then(Vec::pop) else {
            continue;
        };
        if let Some(into) = chains.get_mut(export).and_then(|c| c.first_mut()) {
            let mut bind = from.bind;
            bind.extend(into.bind.drain(1..));
            into.bind = bind;
        }
    }
}

fn single<'c>(chains: &'c Chains, hub: &str) -> Option<&'c Chain> {
    match chains.get(hub).map(Vec::as_slice) {
        Some([chain]) => Some(chain),
        _ => None,
    }
}

/// Authenticates every SSH hop as the hub that runs it and derives each dialed
/// hub's inbound allow list.
pub fn authorize(chains: Chains, identity_file: &str) -> BTreeMap<String, Bound> {
    let mut bounds = BTreeMap::<String, Bound>::new();
    for (runner, hub_chains) in chains {
        for mut chain in hub_chains {
            let mut allows = authenticate(&runner, &mut chain.proxy, Side::Proxy, identity_file);
            allows.extend(authenticate(&runner, &mut chain.bind, Side::Bind, identity_file));
            for (target, allow) in allows {
                bounds
                    .entry(target)
                    .or_default()
                    .inbound
                    .entry(runner.clone())
                    .or_default()
                    .merge(&allow);
            }
            bounds.entry(runner.clone()).or_default().outbound.push(chain);
        }
    }
    bounds
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum Side {
    Bind,
    Proxy,
}

/// Rewrites the SSH hops of one stack, returning what each target hub must allow.
fn authenticate(
    runner: &str,
    stack: &mut [Endpoint],
    side: Side,
    identity_file: &str,
) -> Vec<(String, AllowList)> {
    let mut allows = Vec::new();
    for i in 1..stack.len() {
        let (head, tail) = stack.split_at_mut(i);
        let Endpoint::Ssh(hop) = &mut tail[0] else {
            continue;
        };
        hop.authenticate(runner, identity_file);

        let Some(target) = hop.target_hub().map(str::to_string) else {
            tracing::warn!(%hop, "SSH hop does not name its target hub");
            continue;
        };

        let previous = &head[i - 1];
        let allow = if i == 1 {
            match (side, previous) {
                (Side::Proxy, Endpoint::Unix(path)) => {
                    AllowList::allow(Kind::DirectStreamlocal, path)
                }
                (Side::Proxy, ep) => AllowList::allow(Kind::DirectTcpip, ep),
                (Side::Bind, Endpoint::Unix(path)) => {
                    AllowList::allow(Kind::StreamlocalForward, path)
                }
                (Side::Bind, ep) => AllowList::allow(Kind::TcpipForward, ep),
            }
        } else {
            match previous.address() {
                Some(addr) => AllowList::allow(Kind::DirectTcpip, addr),
                None => {
                    tracing::warn!(%previous, "Relayed hop has no address");
                    continue;
                }
            }
        };
        allows.push((target, allow));
    }
    allows
}

#[cfg(test)]
mod tests;
