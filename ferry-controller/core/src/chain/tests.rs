use super::*;
use crate::way;
use ahash::AHashMap as HashMap;
use maplit::btreemap;
use pretty_assertions::assert_eq;
use quickcheck::{quickcheck, Arbitrary, Gen};

const IDENTITY: &str = "/var/ferry/ssh/identity";
const SOCKET: &str = "/dev/shm/route-80-10001-tunnel.socks";

/// Hub gateways, with optional per-peer overrides.
#[derive(Clone, Debug, Default)]
struct Hubs {
    gateways: HashMap<String, Gateway>,
    overrides: HashMap<(String, String), Gateway>,
}

impl Hubs {
    fn with(mut self, hub: &str, gw: Gateway) -> Self {
        self.gateways.insert(hub.to_string(), gw);
        self
    }

    fn with_override(mut self, hub: &str, for_hub: &str, gw: Gateway) -> Self {
        self.overrides
            .insert((hub.to_string(), for_hub.to_string()), gw);
        self
    }

    fn gateway(&self) -> impl Fn(&str, &str) -> Gateway + '_ {
        move |hub: &str, for_hub: &str| {
            self.overrides
                .get(&(hub.to_string(), for_hub.to_string()))
                .or_else(|| self.gateways.get(hub))
                .cloned()
                .unwrap_or_default()
        }
    }
}

fn way(hubs: &[&str]) -> Vec<String> {
    hubs.iter().map(|h| h.to_string()).collect()
}

fn ep(s: &str) -> Endpoint {
    s.parse().expect("valid endpoint")
}

fn eps(s: &[&str]) -> Vec<Endpoint> {
    s.iter().map(|s| ep(s)).collect()
}

fn hop(user: &str, addr: &str, target: &str) -> String {
    format!("ssh://{user}@{addr}?identity_file={IDENTITY}&target_hub={target}")
}

fn build_route(way: &[String], hubs: &Hubs) -> Result<BTreeMap<String, Bound>, ChainError> {
    let service = ServiceRef::new("test", "svc1");
    let tunnel = Tunnel {
        route: "route",
        service: &service,
        export_port: 80,
        bind_port: 10001,
        identity_file: IDENTITY,
    };
    build(way, &tunnel, hubs.gateway())
}

#[test]
fn export_reachable() {
    let hubs = Hubs::default()
        .with("export", Gateway::reachable("10.0.0.1:8080"))
        .with("import", Gateway::unreachable());

    let bounds = build_route(&way(&["export", "import"]), &hubs).unwrap();

    assert_eq!(
        bounds,
        btreemap! {
            "export".to_string() => Bound {
                outbound: vec![],
                inbound: btreemap! {
                    "import".to_string() => AllowList::allow(Kind::DirectTcpip, "svc1.test.svc:80"),
                },
            },
            "import".to_string() => Bound {
                outbound: vec![Chain {
                    bind: eps(&[":10001"]),
                    proxy: vec![
                        ep("svc1.test.svc:80"),
                        ep("ssh://import@10.0.0.1:8080?identity_file=/var/ferry/ssh/identity&target_hub=export"),
                    ],
                }],
                inbound: btreemap! {},
            },
        }
    );
}

#[test]
fn import_reachable() {
    let hubs = Hubs::default()
        .with("export", Gateway::unreachable())
        .with("import", Gateway::reachable("10.0.0.2:8080"));

    let bounds = build_route(&way(&["export", "import"]), &hubs).unwrap();

    assert_eq!(
        bounds,
        btreemap! {
            "export".to_string() => Bound {
                outbound: vec![Chain {
                    bind: vec![ep(":10001"), ep(&hop("export", "10.0.0.2:8080", "import"))],
                    proxy: eps(&["svc1.test.svc:80"]),
                }],
                inbound: btreemap! {},
            },
            "import".to_string() => Bound {
                outbound: vec![],
                inbound: btreemap! {
                    "export".to_string() => AllowList::allow(Kind::TcpipForward, ":10001"),
                },
            },
        }
    );
}

#[test]
fn export_side_wins_when_both_reachable() {
    let hubs = Hubs::default()
        .with("export", Gateway::reachable("10.0.0.1:22"))
        .with("import", Gateway::reachable("10.0.0.2:22"));

    let bounds = build_route(&way(&["export", "import"]), &hubs).unwrap();
    assert!(bounds["export"].outbound.is_empty());
    assert_eq!(bounds["import"].outbound.len(), 1);
}

#[test]
fn both_unreachable() {
    let hubs = Hubs::default();
    assert_eq!(
        build_route(&way(&["export", "import"]), &hubs),
        Err(ChainError::Unreachable {
            export: "export".to_string(),
            import: "import".to_string(),
        })
    );
    assert_eq!(
        build_route(&way(&["export"]), &hubs),
        Err(ChainError::ShortWay(way(&["export"])))
    );
}

#[test]
fn unreachable_repeater_between_reachable_hubs() {
    let hubs = Hubs::default()
        .with("export", Gateway::reachable("10.0.0.1:22"))
        .with("repeater", Gateway::unreachable())
        .with("import", Gateway::reachable("10.0.0.3:22"));

    let bounds = build_route(&way(&["export", "repeater", "import"]), &hubs).unwrap();

    assert_eq!(
        bounds,
        btreemap! {
            "export".to_string() => Bound {
                outbound: vec![],
                inbound: btreemap! {
                    "repeater".to_string() => AllowList::allow(Kind::DirectTcpip, "svc1.test.svc:80"),
                },
            },
            "import".to_string() => Bound {
                outbound: vec![],
                inbound: btreemap! {
                    "repeater".to_string() => AllowList::allow(Kind::TcpipForward, ":10001"),
                },
            },
            "repeater".to_string() => Bound {
                outbound: vec![Chain {
                    bind: vec![ep(":10001"), ep(&hop("repeater", "10.0.0.3:22", "import"))],
                    proxy: vec![
                        ep("svc1.test.svc:80"),
                        ep(&hop("repeater", "10.0.0.1:22", "export")),
                    ],
                }],
                inbound: btreemap! {},
            },
        }
    );
}

#[test]
fn reachable_repeater_between_unreachable_hubs() {
    let hubs = Hubs::default()
        .with("export", Gateway::unreachable())
        .with("repeater", Gateway::reachable("10.0.0.2:22"))
        .with("import", Gateway::unreachable());

    let bounds = build_route(&way(&["export", "repeater", "import"]), &hubs).unwrap();
    let socket = format!("unix://{SOCKET}");

    assert_eq!(
        bounds,
        btreemap! {
            "export".to_string() => Bound {
                outbound: vec![Chain {
                    bind: vec![ep(&socket), ep(&hop("export", "10.0.0.2:22", "repeater"))],
                    proxy: eps(&["svc1.test.svc:80"]),
                }],
                inbound: btreemap! {},
            },
            "import".to_string() => Bound {
                outbound: vec![Chain {
                    bind: eps(&[":10001"]),
                    proxy: vec![ep(&socket), ep(&hop("import", "10.0.0.2:22", "repeater"))],
                }],
                inbound: btreemap! {},
            },
            "repeater".to_string() => Bound {
                outbound: vec![],
                inbound: btreemap! {
                    "export".to_string() => AllowList::allow(Kind::StreamlocalForward, SOCKET),
                    "import".to_string() => AllowList::allow(Kind::DirectStreamlocal, SOCKET),
                },
            },
        }
    );
}

#[test]
fn four_hubs_share_the_only_reachable_repeater() {
    let via_r1 = Gateway {
        navigation_way: way(&["r1"]),
        ..Default::default()
    };
    let hubs = Hubs::default()
        .with("export", via_r1.clone())
        .with("r1", Gateway::reachable("10.0.0.2:22"))
        .with("r2", via_r1.clone())
        .with("import", via_r1);

    let solved = way::solve("export", "import", hubs.gateway());
    assert_eq!(solved, way(&["export", "r1", "import"]));

    let bounds = build_route(&solved, &hubs).unwrap();
    let socket = format!("unix://{SOCKET}");
    assert_eq!(
        bounds,
        btreemap! {
            "export".to_string() => Bound {
                outbound: vec![Chain {
                    bind: vec![ep(&socket), ep(&hop("export", "10.0.0.2:22", "r1"))],
                    proxy: eps(&["svc1.test.svc:80"]),
                }],
                inbound: btreemap! {},
            },
            "import".to_string() => Bound {
                outbound: vec![Chain {
                    bind: eps(&[":10001"]),
                    proxy: vec![ep(&socket), ep(&hop("import", "10.0.0.2:22", "r1"))],
                }],
                inbound: btreemap! {},
            },
            "r1".to_string() => Bound {
                outbound: vec![],
                inbound: btreemap! {
                    "export".to_string() => AllowList::allow(Kind::StreamlocalForward, SOCKET),
                    "import".to_string() => AllowList::allow(Kind::DirectStreamlocal, SOCKET),
                },
            },
        }
    );

    // Routing through the unreachable repeater leaves a pair nobody can dial.
    assert_eq!(
        build_route(&way(&["export", "r1", "r2", "import"]), &hubs),
        Err(ChainError::Unreachable {
            export: "r2".to_string(),
            import: "import".to_string(),
        })
    );
}

#[test]
fn continuous_reachable_exports_merge() {
    let hubs = Hubs::default()
        .with("a", Gateway::reachable("10.0.0.1:22"))
        .with("b", Gateway::reachable("10.0.0.2:22"))
        .with("c", Gateway::unreachable());

    let bounds = build_route(&way(&["a", "b", "c"]), &hubs).unwrap();

    assert!(bounds["b"].outbound.is_empty());
    assert_eq!(
        bounds["c"].outbound,
        vec![Chain {
            bind: eps(&[":10001"]),
            proxy: vec![
                ep("svc1.test.svc:80"),
                ep(&hop("c", "10.0.0.1:22", "a")),
                ep(&hop("c", "10.0.0.2:22", "b")),
            ],
        }]
    );
    assert_eq!(
        bounds["a"].inbound,
        btreemap! { "c".to_string() => AllowList::allow(Kind::DirectTcpip, "svc1.test.svc:80") }
    );
    assert_eq!(
        bounds["b"].inbound,
        btreemap! { "c".to_string() => AllowList::allow(Kind::DirectTcpip, "10.0.0.1:22") }
    );
}

#[test]
fn continuous_reachable_imports_merge() {
    // `b` can only be dialed by `a`; `c` can be dialed by anyone.
    let hubs = Hubs::default()
        .with("a", Gateway::unreachable())
        .with("b", Gateway::unreachable())
        .with_override("b", "a", Gateway::reachable("10.0.0.2:22"))
        .with("c", Gateway::reachable("10.0.0.3:22"));

    let bounds = build_route(&way(&["a", "b", "c"]), &hubs).unwrap();

    assert!(bounds["b"].outbound.is_empty());
    assert_eq!(
        bounds["a"].outbound,
        vec![Chain {
            bind: vec![
                ep(":10001"),
                ep(&hop("a", "10.0.0.3:22", "c")),
                ep(&hop("a", "10.0.0.2:22", "b")),
            ],
            proxy: eps(&["svc1.test.svc:80"]),
        }]
    );
    assert_eq!(
        bounds["c"].inbound,
        btreemap! { "a".to_string() => AllowList::allow(Kind::TcpipForward, ":10001") }
    );
    assert_eq!(
        bounds["b"].inbound,
        btreemap! { "a".to_string() => AllowList::allow(Kind::DirectTcpip, "10.0.0.3:22") }
    );
}

#[test]
fn expands_proxy_hops() {
    let hubs = Hubs::default()
        .with(
            "export",
            Gateway {
                reachable: true,
                address: "10.0.0.1:22".to_string(),
                reception_proxy: vec![Hop::Hub("jump".to_string())],
                ..Default::default()
            },
        )
        .with(
            "import",
            Gateway {
                navigation_proxy: vec![Hop::Proxy("socks5://proxy:1080".to_string())],
                ..Default::default()
            },
        )
        .with("jump", Gateway::reachable("10.0.0.9:22"));

    let bounds = build_route(&way(&["export", "import"]), &hubs).unwrap();

    assert_eq!(
        bounds["import"].outbound,
        vec![Chain {
            bind: eps(&[":10001"]),
            proxy: vec![
                ep("svc1.test.svc:80"),
                ep(&hop("import", "10.0.0.1:22", "export")),
                ep(&hop("import", "10.0.0.9:22", "jump")),
                Endpoint::Proxy("socks5://proxy:1080".to_string()),
            ],
        }]
    );
    assert_eq!(
        bounds["jump"].inbound,
        btreemap! { "import".to_string() => AllowList::allow(Kind::DirectTcpip, "10.0.0.1:22") }
    );
}

#[test]
fn rejects_malformed_proxy() {
    let hubs = Hubs::default()
        .with(
            "export",
            Gateway {
                reachable: true,
                address: "10.0.0.1:22".to_string(),
                reception_proxy: vec![Hop::Proxy("ssh://no-port".to_string())],
                ..Default::default()
            },
        )
        .with("import", Gateway::unreachable());

    assert!(matches!(
        build_route(&way(&["export", "import"]), &hubs),
        Err(ChainError::Endpoint(_))
    ));
}

// === properties ===

const NAMES: &[&str] = &["h0", "h1", "h2", "h3", "h4"];

/// A random graph of hubs, some reachable only by specific peers.
#[derive(Clone, Debug)]
struct Graph(Hubs);

impl Arbitrary for Graph {
    fn arbitrary(g: &mut Gen) -> Self {
        let mut hubs = Hubs::default();
        for (i, name) in NAMES.iter().enumerate() {
            let gw = Gateway {
                reachable: bool::arbitrary(g),
                address: format!("10.0.0.{i}:22"),
                navigation_way: (0..usize::arbitrary(g) % 2)
                    .map(|_| g.choose(NAMES).expect("names").to_string())
                    .collect(),
                ..Default::default()
            };
            hubs = hubs.with(name, gw);
            if bool::arbitrary(g) {
                let peer = g.choose(NAMES).expect("names");
                hubs = hubs.with_override(name, peer, Gateway::reachable(format!("10.1.0.{i}:22")));
            }
        }
        Graph(hubs)
    }
}

/// A random way through every hub, with a random length.
#[derive(Clone, Debug)]
struct Way(Vec<String>);

impl Arbitrary for Way {
    fn arbitrary(g: &mut Gen) -> Self {
        let len = 2 + usize::arbitrary(g) % (NAMES.len() - 1);
        let mut names = NAMES.iter().map(|n| n.to_string()).collect::<Vec<_>>();
        // Fisher-Yates with the generator's randomness.
        for i in (1..names.len()).rev() {
            let j = usize::arbitrary(g) % (i + 1);
            names.swap(i, j);
        }
        names.truncate(len);
        Way(names)
    }
}

fn reachable_pairs(way: &[String], hubs: &Hubs) -> bool {
    let gw = hubs.gateway();
    way.windows(2)
        .all(|p| gw(&p[0], &p[1]).reachable || gw(&p[1], &p[0]).reachable)
}

quickcheck! {
    fn merge_is_idempotent(graph: Graph, way: Way) -> bool {
        let service = ServiceRef::new("test", "svc1");
        let tunnel = Tunnel {
            route: "route",
            service: &service,
            export_port: 80,
            bind_port: 10001,
            identity_file: IDENTITY,
        };
        let Ok(mut chains) = raw(&way.0, &tunnel, graph.0.gateway()) else {
            return true;
        };
        merge(&way.0, &mut chains);
        let once = chains.clone();
        merge(&way.0, &mut chains);
        once == chains
    }

    fn build_fails_only_on_unreachable_pairs(graph: Graph, e: u8, i: u8) -> bool {
        let export = NAMES[e as usize % NAMES.len()];
        let import = NAMES[i as usize % NAMES.len()];
        if export == import {
            return true;
        }
        let way = way::solve(export, import, graph.0.gateway());
        let built = build_route(&way, &graph.0);
        built.is_ok() == reachable_pairs(&way, &graph.0)
    }

    fn every_hop_is_allowed(graph: Graph, way: Way) -> bool {
        let Ok(bounds) = build_route(&way.0, &graph.0) else {
            return true;
        };

        let mut hops = 0;
        for (runner, bound) in &bounds {
            for chain in &bound.outbound {
                for (side, stack) in [(Side::Proxy, &chain.proxy), (Side::Bind, &chain.bind)] {
                    for (i, hop) in stack.iter().enumerate().skip(1) {
                        let Some(hop) = hop.as_ssh() else { continue };
                        hops += 1;
                        if hop.user.as_deref() != Some(runner.as_str())
                            || hop.identity_file() != Some(IDENTITY)
                        {
                            return false;
                        }
                        let Some(allow) = hop
                            .target_hub()
                            .and_then(|t| bounds.get(t))
                            .and_then(|b| b.inbound.get(runner))
                        else {
                            return false;
                        };
                        let (kind, target) = match (i, side, &stack[i - 1]) {
                            (1, Side::Proxy, Endpoint::Unix(p)) => (Kind::DirectStreamlocal, p.clone()),
                            (1, Side::Proxy, e) => (Kind::DirectTcpip, e.to_string()),
                            (1, Side::Bind, Endpoint::Unix(p)) => (Kind::StreamlocalForward, p.clone()),
                            (1, Side::Bind, e) => (Kind::TcpipForward, e.to_string()),
                            (_, _, e) => (Kind::DirectTcpip, e.address().unwrap_or_default()),
                        };
                        if !allow.permission(kind).allows.contains(&target) {
                            return false;
                        }
                    }
                }
            }
        }

        // Every inbound grant is backed by at least one hop.
        let grants = bounds.values().map(|b| b.inbound.len()).sum::<usize>();
        grants <= hops
    }
}
