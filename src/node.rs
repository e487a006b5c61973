//! Relay fingerprints, per-node descriptors, and three-hop paths.

use std::fmt;

use serde::{Deserialize, Serialize};

/// A 40-character uppercase-hex relay fingerprint.
///
/// We keep this as a thin newtype rather than a bare `String` so that
/// fingerprint comparisons (used pervasively by the anti-hammer set)
/// can't accidentally be confused with other string-keyed data.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Fingerprint(String);

impl Fingerprint {
    /// Build a fingerprint from a 40-character uppercase-hex string.
    ///
    /// Returns `None` if `s` isn't a well-formed fingerprint; callers
    /// that scan free-form control channel text should use
    /// [`Fingerprint::find_all`] instead.
    pub fn parse(s: &str) -> Option<Self> {
        if s.len() == 40 && s.bytes().all(|b| b.is_ascii_hexdigit()) {
            Some(Self(s.to_ascii_uppercase()))
        } else {
            None
        }
    }

    /// Extract every 40-character uppercase-hex-digit token from free
    /// text, in order of appearance. Used to parse `FINDPATH` replies.
    pub fn find_all(text: &str) -> Vec<Self> {
        static RE: once_cell::sync::Lazy<regex::Regex> =
            once_cell::sync::Lazy::new(|| regex::Regex::new("[A-Z0-9]{40}").unwrap());
        RE.find_iter(text)
            .map(|m| Self(m.as_str().to_string()))
            .collect()
    }

    /// Borrow the fingerprint as a plain string, e.g. to use as a
    /// control-channel command argument.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Relay flags carried by a network-status entry, as relevant to path
/// validity (`spec.md` §3).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayFlags {
    /// Relay is currently running.
    pub running: bool,
    /// Relay's descriptor is valid.
    pub valid: bool,
    /// Relay may be used as a guard (first hop).
    pub guard: bool,
    /// Relay may be used as an exit.
    pub exit: bool,
}

/// Snapshot of a relay's network-status entry at sampling time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkStatus {
    /// The relay's fingerprint.
    pub fingerprint: Fingerprint,
    /// Consensus flags relevant to path selection.
    pub flags: RelayFlags,
    /// Bandwidth weight as given by the consensus.
    pub bandwidth_weight: u32,
}

/// Snapshot of a relay's server descriptor at sampling time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerDescriptor {
    /// The relay's fingerprint (repeated for convenience; must match
    /// the enclosing [`NetworkStatus`]).
    pub fingerprint: Fingerprint,
    /// Whether the relay's exit policy permits outbound HTTP (port 80).
    pub exit_policy_permits_http: bool,
    /// The advertised overlay client version string.
    pub version: String,
}

/// An immutable, per-node snapshot taken at sampling time.
///
/// Workers only ever use [`Node::fingerprint`]; the rest of the
/// descriptor exists purely so the sampler can validate path
/// constraints before handing the path off.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    /// Network-status entry fetched at sampling time.
    pub ns: NetworkStatus,
    /// Server descriptor fetched at sampling time.
    pub desc: ServerDescriptor,
}

impl Node {
    /// The node's fingerprint, taken from its network-status entry.
    pub fn fingerprint(&self) -> &Fingerprint {
        &self.ns.fingerprint
    }
}

/// An ordered, validated three-hop path: `[entry, middle, exit]`.
///
/// Construction is infallible once validity has been checked by the
/// caller (the [`crate::sampler::PathSampler`]); a `Path` is never
/// mutated after creation and is consumed by exactly one worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Path {
    nodes: [Node; 3],
}

impl Path {
    /// Build a path from exactly three nodes, checking the validity
    /// constraints from `spec.md` §3: each node `Running` and `Valid`,
    /// the entry a `Guard`, and the exit's policy permitting HTTP.
    pub fn new(entry: Node, middle: Node, exit: Node) -> Result<Self, String> {
        for (role, node) in [("entry", &entry), ("middle", &middle), ("exit", &exit)] {
            if !node.ns.flags.running || !node.ns.flags.valid {
                return Err(format!(
                    "{role} node {} is not Running+Valid",
                    node.fingerprint()
                ));
            }
        }
        if entry.fingerprint() == middle.fingerprint()
            || entry.fingerprint() == exit.fingerprint()
            || middle.fingerprint() == exit.fingerprint()
        {
            return Err(format!(
                "path reuses a fingerprint across hops: {}, {}, {}",
                entry.fingerprint(),
                middle.fingerprint(),
                exit.fingerprint()
            ));
        }
        if !entry.ns.flags.guard {
            return Err(format!("entry node {} is not a Guard", entry.fingerprint()));
        }
        if !exit.desc.exit_policy_permits_http {
            return Err(format!(
                "exit node {} does not permit outbound HTTP",
                exit.fingerprint()
            ));
        }
        Ok(Self {
            nodes: [entry, middle, exit],
        })
    }

    /// Borrow the three nodes in order.
    pub fn nodes(&self) -> &[Node; 3] {
        &self.nodes
    }

    /// Fingerprints in path order, as required by `extend_circuit`.
    pub fn fingerprints(&self) -> [Fingerprint; 3] {
        let [e, m, x] = &self.nodes;
        [e.fingerprint().clone(), m.fingerprint().clone(), x.fingerprint().clone()]
    }
}
