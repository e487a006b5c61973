//! The Probe Record: the engine's output unit, and the event types
//! accumulated into it over a circuit's lifetime.

use std::net::Ipv4Addr;

use serde::{Deserialize, Serialize};

use crate::node::{Node, Path};

/// Lifecycle status of a circuit, as reported by `CIRC` events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CircStatus {
    /// The control channel has accepted a request to build the circuit.
    Launched,
    /// One more hop has been added.
    Extended,
    /// All hops are in place; the circuit is ready for streams.
    Built,
    /// Circuit construction failed.
    Failed,
    /// The circuit has been torn down.
    Closed,
}

/// Lifecycle status of a stream, as reported by `STREAM` events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StreamStatus {
    /// A new stream has been requested.
    New,
    /// A CONNECT request has been sent to the exit.
    SentConnect,
    /// The stream was detached from its circuit (and may be reattached).
    Detached,
    /// The stream failed.
    Failed,
    /// The stream closed.
    Closed,
}

/// A snapshot of a single circuit-lifecycle notification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CircuitEvent {
    /// Circuit identifier, as assigned by the control channel.
    pub id: String,
    /// Lifecycle status this event reports.
    pub status: CircStatus,
    /// Machine-readable reason code, if any (e.g. `"NONE"`, `"TIMEOUT"`).
    pub reason: Option<String>,
    /// Build flags attached to the circuit (e.g. `"IS_INTERNAL"`,
    /// `"NEED_CAPACITY"`).
    pub build_flags: Vec<String>,
    /// The circuit's stated purpose (e.g. `"GENERAL"`).
    pub purpose: String,
    /// Fingerprints of the circuit's hops, if known at event time.
    pub path: Vec<String>,
    /// Wall-clock time the control channel reported this event.
    #[serde(with = "time::serde::timestamp")]
    pub created_at: time::OffsetDateTime,
}

/// A snapshot of a single stream-lifecycle notification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamEvent {
    /// Stream identifier, as assigned by the control channel.
    pub id: String,
    /// Lifecycle status this event reports.
    pub status: StreamStatus,
    /// Machine-readable local reason code, if any.
    pub reason: Option<String>,
    /// Machine-readable reason code as reported by the remote endpoint.
    pub remote_reason: Option<String>,
    /// The stream's stated purpose (e.g. `"USER"`).
    pub purpose: String,
    /// The address (and port) the stream was opened towards.
    pub target_address: String,
    /// Wall-clock time the control channel reported this event.
    #[serde(with = "time::serde::timestamp")]
    pub arrived_at: time::OffsetDateTime,
}

/// A single probe measurement: either three elapsed-time samples, in
/// seconds, or a single error description.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum TimingSample {
    /// `(connect_time, starttransfer_time, total_time)`, all seconds.
    Timing {
        /// Time from connect start to TCP connect completion.
        connect_time: f64,
        /// Time from connect start to first response byte.
        starttransfer_time: f64,
        /// Time from connect start to transfer completion.
        total_time: f64,
    },
    /// A transport failure or response-shape mismatch, recorded as a
    /// single descriptive string.
    Error(String),
}

/// The output unit of the engine: the full trace of one circuit's
/// lifetime plus whatever measurements it produced.
///
/// Invariants (checked by [`Probe::check_invariants`] and exercised in
/// unit tests): exactly one circuit id appears across `circs`; `cbt` is
/// either absent or a single positive integer; `streams` is empty
/// whenever the circuit failed to build; every entry in `streams` shares
/// `target_address` with this probe's allocated destination.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Probe {
    /// The three-hop path this probe measured.
    pub path: [Node; 3],
    /// This circuit's allocated loopback destination (`spec.md` §4.6):
    /// the RTT probe's CONNECT target, and the archive's entry key.
    pub dest: Ipv4Addr,
    /// Full circuit-lifecycle trace, in arrival order.
    pub circs: Vec<CircuitEvent>,
    /// Circuit-build time in milliseconds, if one was ever observed.
    pub cbt: Option<u32>,
    /// Stream-lifecycle events for this circuit's probe streams.
    pub streams: Vec<StreamEvent>,
    /// TTFB timing samples, one per TTFB probe iteration attempted.
    pub perf: Vec<TimingSample>,
    /// Bulk-throughput timing samples, one per BW probe iteration
    /// attempted.
    pub bw: Vec<TimingSample>,
}

impl Probe {
    /// Start an empty record for a freshly admitted path and its
    /// allocated destination.
    pub fn new(path: Path, dest: Ipv4Addr) -> Self {
        let [entry, middle, exit] = path.nodes().clone();
        Self {
            path: [entry, middle, exit],
            dest,
            circs: Vec::new(),
            cbt: None,
            streams: Vec::new(),
            perf: Vec::new(),
            bw: Vec::new(),
        }
    }

    /// The circuit id recorded across `circs`, if any events have been
    /// appended yet.
    pub fn circuit_id(&self) -> Option<&str> {
        self.circs.first().map(|e| e.id.as_str())
    }

    /// Append a circuit event, enforcing the "exactly one circuit id"
    /// invariant.
    ///
    /// # Panics
    ///
    /// Panics if `event.id` differs from the id of events already
    /// recorded — this is an invariant violation (`spec.md` §7 item 4),
    /// not a recoverable condition.
    pub fn push_circ_event(&mut self, event: CircuitEvent) {
        if let Some(existing) = self.circuit_id() {
            assert_eq!(
                existing, event.id,
                "probe record accumulated events for two different circuit ids"
            );
        }
        self.circs.push(event);
    }

    /// Record the circuit-build time, enforcing the singleton
    /// invariant.
    ///
    /// # Panics
    ///
    /// Panics if `cbt` has already been set — a circuit is only ever
    /// reported built once.
    pub fn set_cbt(&mut self, ms: u32) {
        assert!(self.cbt.is_none(), "cbt for circuit was already set");
        self.cbt = Some(ms);
    }

    /// Check the structural invariants this record must uphold,
    /// returning `Err` with a description on violation. Used by tests
    /// and can be called defensively before archiving.
    pub fn check_invariants(&self) -> Result<(), String> {
        let ids: std::collections::HashSet<&str> = self.circs.iter().map(|e| e.id.as_str()).collect();
        if ids.len() > 1 {
            return Err(format!("probe spans {} distinct circuit ids", ids.len()));
        }
        let build_failed = self
            .circs
            .iter()
            .any(|e| matches!(e.status, CircStatus::Failed))
            && !self.circs.iter().any(|e| matches!(e.status, CircStatus::Built));
        if build_failed && !self.streams.is_empty() {
            return Err("streams present on a circuit that never built".into());
        }
        Ok(())
    }
}
