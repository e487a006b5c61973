//! Path Sampler: waits for the overlay client to have enough directory
//! information, then asks it to choose a fresh three-hop path via
//! `FINDPATH`, resolving each hop's descriptor before handing the path
//! to a [`crate::worker::ProbeWorker`].

use std::time::Duration;

use crate::control::{ControlClient, Event, EventKind};
use crate::error::FatalError;
use crate::node::{Fingerprint, Node, Path};

/// How many consecutive `FINDPATH` attempts to make before giving up
/// and asking the caller to try again later.
const MAX_FINDPATH_ATTEMPTS: u32 = 10;

/// Interval between `status/enough-dir-info` polls while waiting for
/// the client to become ready.
const READINESS_POLL_INTERVAL: Duration = Duration::from_secs(5);

/// Chooses fresh three-hop paths for the scheduler to launch circuits
/// over.
pub struct PathSampler {
    control: ControlClient,
}

impl PathSampler {
    /// Wrap a connected control client.
    pub fn new(control: ControlClient) -> Self {
        Self { control }
    }

    /// Block until `GETINFO status/enough-dir-info` reports `1`,
    /// polling at [`READINESS_POLL_INTERVAL`].
    pub async fn wait_until_ready(&self) -> Result<(), FatalError> {
        loop {
            let value = self.control.get_info("status/enough-dir-info").await?;
            if value.trim() == "1" {
                return Ok(());
            }
            tracing::info!("waiting for enough directory info");
            tokio::time::sleep(READINESS_POLL_INTERVAL).await;
        }
    }

    /// Ask the overlay client to refresh its guard set. A failure here
    /// is fatal: without guards no circuit can ever be valid. An
    /// "unrecognized command" reply means the overlay client simply
    /// doesn't implement this non-standard extension at all
    /// (`spec.md` §6/§7 item 1), which is a distinct, clearer diagnostic
    /// than a generic protocol failure.
    pub async fn rotate_guards(&self) -> Result<(), FatalError> {
        let reply = self.control.raw("DUMPGUARDS").await?;
        if !reply.is_ok() {
            if is_unrecognized_command(&reply) {
                return Err(FatalError::MissingCommand {
                    command: "DUMPGUARDS",
                    reply: reply.body(),
                });
            }
            return Err(FatalError::Protocol(format!(
                "DUMPGUARDS failed: {}",
                reply.body()
            )));
        }
        Ok(())
    }

    /// Sample a fresh three-hop path, retrying `FINDPATH` up to
    /// [`MAX_FINDPATH_ATTEMPTS`] times.
    ///
    /// Issues `DUMPGUARDS` unconditionally before the `FINDPATH` retry
    /// loop (`spec.md` §4.2: "Issue `DUMPGUARDS` before every sample"),
    /// not just reactively or once at process startup, so every sampled
    /// path — not only the first — forces a fresh guard.
    ///
    /// Each attempt is independent: fingerprints that fail to resolve
    /// (`GETINFO ns/id/*` or `desc/id/*` returning not-found) are
    /// dropped from *that* attempt rather than carried into the next
    /// one, so a path is only returned from an iteration that resolved
    /// exactly three hops on its own.
    pub async fn sample_path(&self) -> Result<Option<Path>, FatalError> {
        self.rotate_guards().await?;
        let (sub_id, mut circ_rx) = self.control.subscribe(EventKind::Circ);
        let result = self.sample_path_inner(&mut circ_rx).await;
        self.control.unsubscribe(sub_id);
        result
    }

    async fn sample_path_inner(
        &self,
        circ_rx: &mut tokio::sync::mpsc::UnboundedReceiver<Event>,
    ) -> Result<Option<Path>, FatalError> {
        for attempt in 1..=MAX_FINDPATH_ATTEMPTS {
            // Drain any stale build-failure notifications from the
            // previous attempt before issuing a new FINDPATH.
            while circ_rx.try_recv().is_ok() {}

            let reply = self.control.raw("FINDPATH").await?;
            if !reply.is_ok() {
                if is_unrecognized_command(&reply) {
                    return Err(FatalError::MissingCommand {
                        command: "FINDPATH",
                        reply: reply.body(),
                    });
                }
                tracing::warn!(attempt, "FINDPATH failed: {}", reply.body());
                continue;
            }
            let fingerprints = Fingerprint::find_all(&reply.body());

            let mut nodes = Vec::with_capacity(3);
            for fp in &fingerprints {
                match self.resolve_node(fp).await {
                    Ok(node) => nodes.push(node),
                    Err(crate::error::ControlError::NotFound(_)) => {
                        tracing::warn!(fingerprint = %fp, "relay descriptor not found, skipping");
                    }
                    Err(e) => {
                        tracing::warn!(fingerprint = %fp, error = %e, "failed to resolve relay");
                    }
                }
            }

            if nodes.len() != 3 {
                tracing::debug!(attempt, resolved = nodes.len(), "incomplete path, retrying");
                // Purely a synchronization signal that the client has
                // released capacity between FINDPATH attempts
                // (`spec.md` §4.2) — guard rotation itself already
                // happened once, unconditionally, at the top of this
                // sample.
                if self.saw_capacity_failure(circ_rx) {
                    tracing::debug!(attempt, "observed capacity-release signal");
                }
                continue;
            }

            let entry = nodes.remove(0);
            let middle = nodes.remove(0);
            let exit = nodes.remove(0);
            match Path::new(entry, middle, exit) {
                Ok(path) => return Ok(Some(path)),
                Err(reason) => {
                    tracing::debug!(attempt, %reason, "path rejected, retrying");
                }
            }
        }
        Ok(None)
    }

    async fn resolve_node(
        &self,
        fp: &Fingerprint,
    ) -> Result<Node, crate::error::ControlError> {
        let ns = self.control.get_network_status(fp).await?;
        let desc = self.control.get_server_descriptor(fp).await?;
        Ok(Node { ns, desc })
    }

    /// Check whether a `CIRC ... FAILED REASON=NONE
    /// BUILD_FLAGS=...NEED_CAPACITY...` event has arrived since the
    /// receiver was last drained — the signal that the client's guard
    /// set is too thin to complete a build.
    fn saw_capacity_failure(
        &self,
        circ_rx: &mut tokio::sync::mpsc::UnboundedReceiver<Event>,
    ) -> bool {
        let mut found = false;
        while let Ok(event) = circ_rx.try_recv() {
            if let Event::Circ(ev) = event {
                if ev.status == crate::record::CircStatus::Failed
                    && ev.reason.as_deref() == Some("NONE")
                    && ev.build_flags.iter().any(|f| f == "NEED_CAPACITY")
                {
                    found = true;
                }
            }
        }
        found
    }
}

/// Whether `reply` is the control channel's "I don't know this command"
/// response (status `510`), as opposed to some other failure of a
/// command it does recognize.
fn is_unrecognized_command(reply: &crate::control::Reply) -> bool {
    reply.status == "510"
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn max_attempts_matches_documented_budget() {
        assert_eq!(MAX_FINDPATH_ATTEMPTS, 10);
    }

    #[test]
    fn unrecognized_command_reply_is_detected() {
        let reply = crate::control::Reply {
            status: "510".into(),
            lines: vec!["Unrecognized command \"FINDPATH\"".into()],
        };
        assert!(is_unrecognized_command(&reply));
        let other = crate::control::Reply {
            status: "552".into(),
            lines: vec!["Unknown circuit".into()],
        };
        assert!(!is_unrecognized_command(&other));
    }
}
