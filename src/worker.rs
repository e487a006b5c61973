//! Probe Worker: drives one three-hop circuit from `EXTENDCIRCUIT`
//! through teardown, running the RTT/TTFB/BW probe loops in between and
//! handing the finished [`Probe`] record off to the archive writer.

use std::net::Ipv4Addr;
use std::sync::Arc;

use once_cell::sync::Lazy;
use regex::Regex;
use tokio::sync::{mpsc, Mutex, OwnedSemaphorePermit, Semaphore};

use crate::control::{ControlClient, Event, EventKind};
use crate::dest::DestAllocator;
use crate::error::{ControlError, FatalError};
use crate::node::Path;
use crate::record::{CircStatus, Probe, StreamStatus};
use crate::{http, socks};

static CBT_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"circuit_send_next_onion_skin\(\): circuit (\d+) built in (\d+)msec").unwrap()
});

/// State shared by every [`ProbeWorker`] spawned by the scheduler.
///
/// `launch_lock` serializes `EXTENDCIRCUIT` against the first
/// unattributed `LAUNCHED` event, since the control protocol doesn't
/// otherwise say which circuit id a given `EXTENDCIRCUIT` produced.
/// `perf_lock`/`bw_lock` serialize the TTFB and BW probe phases
/// system-wide, which is also what makes matching a `STREAM NEW` event
/// to "the" TTFB/BW request by host alone safe.
pub struct WorkerShared {
    pub control: ControlClient,
    pub launch_lock: Arc<Mutex<()>>,
    pub perf_lock: Arc<Semaphore>,
    pub bw_lock: Arc<Semaphore>,
    pub socks_addr: (Ipv4Addr, u16),
    pub dest_allocator: Arc<DestAllocator>,
    pub archive_tx: mpsc::UnboundedSender<Probe>,
    pub rtt_iterations: u32,
    pub ttfb_iterations: u32,
    pub bw_iterations: u32,
    pub probesleep: std::time::Duration,
    pub ttfb_url: String,
    pub bw_url: String,
}

/// Drives a single circuit's full lifecycle and sends the completed
/// [`Probe`] to the archive writer.
pub struct ProbeWorker {
    shared: Arc<WorkerShared>,
}

impl ProbeWorker {
    pub fn new(shared: Arc<WorkerShared>) -> Self {
        Self { shared }
    }

    /// Run this worker to completion for the given `path`.
    pub async fn run(&self, path: Path) -> Result<(), FatalError> {
        // One destination per circuit (`spec.md` §4.6), allocated once
        // up front and reused across every RTT iteration so the
        // stream-observer filter and the archive's entry key agree on
        // a single address for this probe's whole lifetime.
        let dest = self
            .shared
            .dest_allocator
            .allocate()
            .ok_or_else(|| FatalError::Invariant("destination allocator exhausted".into()))?;
        let mut probe = Probe::new(path.clone(), dest);
        let fps = path.fingerprints();

        let (circ_sub, mut circ_rx) = self.shared.control.subscribe(EventKind::Circ);
        let (stream_sub, mut stream_rx) = self.shared.control.subscribe(EventKind::Stream);
        let (info_sub, mut info_rx) = self.shared.control.subscribe(EventKind::Info);

        let result = self
            .drive(&fps, &mut probe, &mut circ_rx, &mut stream_rx, &mut info_rx)
            .await;

        self.shared.control.unsubscribe(circ_sub);
        self.shared.control.unsubscribe(stream_sub);
        self.shared.control.unsubscribe(info_sub);

        result?;

        if let Err(e) = probe.check_invariants() {
            return Err(FatalError::Invariant(e));
        }
        let _ = self.shared.archive_tx.send(probe);
        Ok(())
    }

    async fn drive(
        &self,
        fps: &[crate::node::Fingerprint; 3],
        probe: &mut Probe,
        circ_rx: &mut mpsc::UnboundedReceiver<Event>,
        stream_rx: &mut mpsc::UnboundedReceiver<Event>,
        info_rx: &mut mpsc::UnboundedReceiver<Event>,
    ) -> Result<(), FatalError> {
        let launched = self.launch_and_attribute(fps, circ_rx).await?;
        let circ_id = launched.id.clone();
        probe.push_circ_event(launched);
        let built = self.drive_build(&circ_id, probe, circ_rx, info_rx).await?;

        if built {
            self.run_rtt_probes(&circ_id, probe, stream_rx).await?;
            self.run_ttfb_probes(&circ_id, probe, stream_rx).await?;
            self.run_bw_probes(&circ_id, probe, stream_rx).await?;
            let _ = self.shared.control.close_circuit(&circ_id).await;
            self.drain_teardown(&circ_id, probe, circ_rx).await;
        }
        Ok(())
    }

    /// Hold `launch_lock` across `EXTENDCIRCUIT` and the wait for the
    /// next `LAUNCHED` event: while held, no other worker can also be
    /// waiting for an unattributed `LAUNCHED`, so the first one to
    /// arrive is provably ours.
    async fn launch_and_attribute(
        &self,
        fps: &[crate::node::Fingerprint; 3],
        circ_rx: &mut mpsc::UnboundedReceiver<Event>,
    ) -> Result<crate::record::CircuitEvent, FatalError> {
        let _guard = self.shared.launch_lock.lock().await;
        while circ_rx.try_recv().is_ok() {}
        self.shared.control.extend_circuit(fps).await?;
        loop {
            match circ_rx.recv().await {
                Some(Event::Circ(ev)) if ev.status == CircStatus::Launched => return Ok(ev),
                Some(_) => continue,
                None => return Err(FatalError::ConnectionClosed),
            }
        }
    }

    /// Consume `CIRC`/`INFO` events for `circ_id` until the circuit
    /// reaches a terminal state, returning whether it built.
    async fn drive_build(
        &self,
        circ_id: &str,
        probe: &mut Probe,
        circ_rx: &mut mpsc::UnboundedReceiver<Event>,
        info_rx: &mut mpsc::UnboundedReceiver<Event>,
    ) -> Result<bool, FatalError> {
        loop {
            tokio::select! {
                circ = circ_rx.recv() => {
                    let Some(Event::Circ(ev)) = circ else {
                        return Err(FatalError::ConnectionClosed);
                    };
                    if ev.id != circ_id {
                        continue;
                    }
                    let terminal = matches!(ev.status, CircStatus::Built | CircStatus::Failed | CircStatus::Closed);
                    let built = matches!(ev.status, CircStatus::Built);
                    probe.push_circ_event(ev);
                    if terminal {
                        return Ok(built);
                    }
                }
                info = info_rx.recv() => {
                    let Some(Event::Info { message }) = info else {
                        continue;
                    };
                    if let Some(caps) = CBT_RE.captures(&message) {
                        if &caps[1] == circ_id {
                            if let Ok(ms) = caps[2].parse() {
                                if probe.cbt.is_none() {
                                    probe.set_cbt(ms);
                                }
                            }
                        }
                    }
                }
            }
        }
    }

    async fn run_rtt_probes(
        &self,
        circ_id: &str,
        probe: &mut Probe,
        stream_rx: &mut mpsc::UnboundedReceiver<Event>,
    ) -> Result<(), FatalError> {
        let dest = probe.dest;
        let target_host = dest.to_string();
        for _ in 0..self.shared.rtt_iterations {
            let socks_addr = self.shared.socks_addr;
            let io = socks::rtt_connect(socks_addr, dest);
            // RTT streams target this circuit's own loopback `dest`, so
            // (and only so) their events belong in `probe.streams`
            // (`spec.md` §3).
            let outcome = self
                .run_attached(circ_id, &target_host, true, None, probe, stream_rx, io)
                .await?;
            // Only the acceptable SOCKS5 reply codes are absorbed by
            // `rtt_connect` itself; anything it still returns as an
            // error is outside that whitelist and is fatal.
            if let Err(e) = outcome {
                return Err(FatalError::ProtocolViolation(format!("rtt probe: {e}")));
            }
        }
        Ok(())
    }

    async fn run_ttfb_probes(
        &self,
        circ_id: &str,
        probe: &mut Probe,
        stream_rx: &mut mpsc::UnboundedReceiver<Event>,
    ) -> Result<(), FatalError> {
        let target_host = host_prefix(&self.shared.ttfb_url);
        for i in 0..self.shared.ttfb_iterations {
            if i > 0 && !self.shared.probesleep.is_zero() {
                tokio::time::sleep(self.shared.probesleep).await;
            }
            let permit = self
                .shared
                .perf_lock
                .clone()
                .acquire_owned()
                .await
                .expect("perf_lock closed");
            let socks_addr = self.shared.socks_addr;
            let url = self.shared.ttfb_url.clone();
            let io = http::ttfb_probe(socks_addr, &url);
            // TTFB streams target the external probe host, not this
            // circuit's `dest`; their events are never recorded into
            // `probe.streams` (`spec.md` §3). `permit` is dropped by
            // `run_attached` as soon as the matching stream is
            // observed, not held for the rest of the transfer
            // (`spec.md` §4.3).
            let sample = self
                .run_attached(circ_id, &target_host, false, Some(permit), probe, stream_rx, io)
                .await?;
            probe.perf.push(sample);
        }
        Ok(())
    }

    async fn run_bw_probes(
        &self,
        circ_id: &str,
        probe: &mut Probe,
        stream_rx: &mut mpsc::UnboundedReceiver<Event>,
    ) -> Result<(), FatalError> {
        let target_host = host_prefix(&self.shared.bw_url);
        for _ in 0..self.shared.bw_iterations {
            let permit = self
                .shared
                .bw_lock
                .clone()
                .acquire_owned()
                .await
                .expect("bw_lock closed");
            let socks_addr = self.shared.socks_addr;
            let url = self.shared.bw_url.clone();
            let io = http::bw_probe(socks_addr, &url);
            // Same as TTFB: the BW target host is never this circuit's
            // `dest`, so its stream events are never recorded.
            let sample = self
                .run_attached(circ_id, &target_host, false, Some(permit), probe, stream_rx, io)
                .await?;
            probe.bw.push(sample);
        }
        Ok(())
    }

    /// Run `io` to completion while concurrently attaching any `NEW
    /// USER` stream whose target host exactly matches `target_host` to
    /// `circ_id`.
    ///
    /// `record_streams` selects whether matching events are appended to
    /// `probe.streams`: only RTT-phase streams (whose target is this
    /// circuit's own allocated loopback `dest`) belong there (`spec.md`
    /// §3); TTFB/BW streams target an external host and must never be
    /// recorded, even though they still need to be attached.
    ///
    /// The match itself must be host equality, not a prefix test:
    /// `DestAllocator` hands out sequential `127.a.b.c` addresses, so
    /// e.g. `"127.0.0.10"` is a valid prefix match for `"127.0.0.1"`
    /// even though they are two different concurrently active workers'
    /// destinations. Only streams with `purpose == "USER"` are treated
    /// as the one this phase is waiting for — a directory-fetch stream
    /// the overlay client opens on its own could otherwise land on the
    /// same external host and get wrongly classified as the TTFB/BW
    /// stream (`spec.md` §4.3: "the first `NEW USER` stream").
    ///
    /// `release_permit`, when given, is dropped the instant the
    /// matching stream is observed — not held through the rest of
    /// `io` — mirroring the one-shot observer in `spec.md` §4.3 that
    /// "releases [the] lock on the first `NEW USER` stream ..., then
    /// attaches it". Holding the permit across the whole transfer would
    /// serialize every TTFB/BW probe in the fleet for as long as the
    /// slowest single transfer takes.
    async fn run_attached<Fut, T>(
        &self,
        circ_id: &str,
        target_host: &str,
        record_streams: bool,
        mut release_permit: Option<OwnedSemaphorePermit>,
        probe: &mut Probe,
        stream_rx: &mut mpsc::UnboundedReceiver<Event>,
        io: Fut,
    ) -> Result<T, FatalError>
    where
        Fut: std::future::Future<Output = T>,
    {
        tokio::pin!(io);
        loop {
            tokio::select! {
                result = &mut io => return Ok(result),
                ev = stream_rx.recv() => {
                    let Some(Event::Stream(ev)) = ev else {
                        return Err(FatalError::ConnectionClosed);
                    };
                    if stream_target_host(&ev.target_address) != target_host {
                        continue;
                    }
                    if ev.status == StreamStatus::New && ev.purpose == "USER" {
                        release_permit.take();
                        match self.shared.control.attach_stream(&ev.id, circ_id).await {
                            Ok(()) => {}
                            Err(ControlError::UnknownCircuit(_))
                            | Err(ControlError::NotOpenOriginCircuit(_)) => {
                                let _ = self.shared.control.close_stream(&ev.id).await;
                            }
                            Err(ControlError::UnknownStream(_)) => {
                                tracing::debug!(stream = %ev.id, "stream vanished before attach");
                            }
                            Err(e) => {
                                return Err(FatalError::ProtocolViolation(format!(
                                    "attach_stream: {e}"
                                )));
                            }
                        }
                    }
                    if record_streams {
                        probe.streams.push(ev);
                    }
                }
            }
        }
    }

    async fn drain_teardown(
        &self,
        circ_id: &str,
        probe: &mut Probe,
        circ_rx: &mut mpsc::UnboundedReceiver<Event>,
    ) {
        while let Some(Event::Circ(ev)) = circ_rx.recv().await {
            if ev.id != circ_id {
                continue;
            }
            let closed = matches!(ev.status, CircStatus::Closed);
            probe.push_circ_event(ev);
            if closed {
                return;
            }
        }
    }
}

/// The bare host a probe URL's target stream will be reported under by
/// `STREAM NEW`, with scheme, port, and path stripped.
fn host_prefix(url: &str) -> String {
    reqwest::Url::parse(url)
        .ok()
        .and_then(|u| u.host_str().map(str::to_string))
        .unwrap_or_default()
}

/// The host portion of a `STREAM`'s `target_address` (`"host:port"` ->
/// `"host"`), for exact comparison against an expected target host.
fn stream_target_host(target_address: &str) -> &str {
    target_address
        .rsplit_once(':')
        .map(|(host, _)| host)
        .unwrap_or(target_address)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cbt_regex_extracts_circuit_and_millis() {
        let msg = "circuit_send_next_onion_skin(): circuit 42 built in 318msec";
        let caps = CBT_RE.captures(msg).unwrap();
        assert_eq!(&caps[1], "42");
        assert_eq!(&caps[2], "318");
    }

    #[test]
    fn host_prefix_strips_scheme_and_path() {
        assert_eq!(host_prefix("http://example.invalid/bulk"), "example.invalid");
    }

    #[test]
    fn stream_target_host_strips_port() {
        assert_eq!(stream_target_host("127.0.0.1:80"), "127.0.0.1");
        assert_eq!(stream_target_host("example.invalid:80"), "example.invalid");
    }

    #[test]
    fn stream_target_host_does_not_prefix_match_sibling_dests() {
        // A naive `starts_with` on the raw target_address would wrongly
        // match "127.0.0.10:80" against the shorter dest "127.0.0.1" —
        // exact host comparison must not.
        assert_ne!(stream_target_host("127.0.0.10:80"), "127.0.0.1");
    }
}
