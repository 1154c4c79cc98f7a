//! Computes the ordered list of hubs a tunnel traverses.

use crate::Gateway;
use ahash::AHashMap as HashMap;

/// Solves the way from `export` to `import`.
///
/// `gateway(hub, for_hub)` returns `hub`'s gateway as seen by `for_hub`.
///
/// Starting from `[export, import]`, each adjacent pair is expanded with the
/// way hints of whichever side is reachable (or of both sides when neither is)
/// until no pair yields a new hub. A hub is never inserted twice. The result
/// always starts with `export` and ends with `import`; a pair with no reachable
/// side may remain, in which case building its chain fails.
pub fn solve<G>(export: &str, import: &str, gateway: G) -> Vec<String>
where
    G: Fn(&str, &str) -> Gateway,
{
    let mut way = vec![export.to_string(), import.to_string()];
    if export == import {
        way.pop();
        return way;
    }

    let mut i = 0;
    while i + 1 < way.len() {
        let inserts = {
            let (e, im) = (&way[i], &way[i + 1]);
            let eg = gateway(e, im);
            let ig = gateway(im, e);
            hints(&eg, &ig)
                .into_iter()
                .filter(|hub| !way.contains(hub))
                .fold(Vec::<String>::new(), |mut acc, hub| {
                    if !acc.contains(&hub) {
                        acc.push(hub);
                    }
                    acc
                })
        };

        if inserts.is_empty() {
            i += 1;
            continue;
        }

        tracing::trace!(export = %way[i], import = %way[i + 1], ?inserts, "Expanding way");
        // Re-examine the pair ending at the first inserted hub so that the
        // waypoints' own hints are honored.
        let tail = way.split_off(i + 1);
        way.extend(inserts);
        way.extend(tail);
    }

    collapse(way)
}

/// The waypoints to splice between an exporting and an importing gateway.
fn hints(export: &Gateway, import: &Gateway) -> Vec<String> {
    if export.reachable {
        export
            .reception_way
            .iter()
            .rev()
            .chain(import.navigation_way.iter())
            .cloned()
            .collect()
    } else if import.reachable {
        export
            .navigation_way
            .iter()
            .rev()
            .chain(import.reception_way.iter())
            .cloned()
            .collect()
    } else {
        export
            .navigation_way
            .iter()
            .rev()
            .chain(import.navigation_way.iter())
            .cloned()
            .collect()
    }
}

/// Removes loops: whenever a hub appears again later in the way, everything
/// from its first occurrence up to (but excluding) the later one is dropped.
fn collapse(way: Vec<String>) -> Vec<String> {
    let mut out = Vec::<String>::with_capacity(way.len());
    let mut index = HashMap::<String, usize>::default();
    for hub in way {
        if let Some(&i) = index.get(&hub) {
            for dropped in out.drain(i..) {
                index.remove(&dropped);
            }
        }
        index.insert(hub.clone(), out.len());
        out.push(hub);
    }
    out
}
