//! A thin typed wrapper around the overlay client's line-oriented
//! control channel (`spec.md` §4.1).

mod events;
mod proto;

pub use events::{Event, EventKind, SubscriptionId};
pub use proto::Reply;

use std::collections::VecDeque;
use std::sync::Arc;

use tokio::io::{AsyncWriteExt, BufReader};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, Mutex};

use crate::error::{ControlError, FatalError};
use crate::node::{Fingerprint, NetworkStatus, RelayFlags, ServerDescriptor};
use proto::{parse_circ_event, parse_keyvalue, parse_stream_event, Fed, ReplyAssembler};

/// Circuit info as reported by `GETINFO circuit-status`.
#[derive(Debug, Clone)]
pub struct CircuitInfo {
    /// Circuit identifier.
    pub id: String,
    /// Raw status string (`"BUILT"`, `"LAUNCHED"`, ...).
    pub status: String,
    /// Build flags, if any.
    pub build_flags: Vec<String>,
}

struct Shared {
    writer: Mutex<OwnedWriteHalf>,
    pending: Mutex<VecDeque<oneshot::Sender<Reply>>>,
    events: events::EventBus,
}

/// A connected, authenticated client for the overlay's control channel.
///
/// Cloning an `ControlClient` is cheap and shares the same connection;
/// every clone talks to the same reader task.
#[derive(Clone)]
pub struct ControlClient {
    shared: Arc<Shared>,
}

impl ControlClient {
    /// Connect to the control channel at `host:port` and spawn its
    /// reader task. Does not authenticate — callers that need
    /// authentication should issue it via [`ControlClient::raw`]
    /// before using any other method.
    pub async fn connect(host: &str, port: u16) -> Result<Self, FatalError> {
        let stream = TcpStream::connect((host, port))
            .await
            .map_err(|source| FatalError::ConnectFailed {
                host: host.to_string(),
                port,
                source,
            })?;
        let (read_half, write_half) = stream.into_split();
        let shared = Arc::new(Shared {
            writer: Mutex::new(write_half),
            pending: Mutex::new(VecDeque::new()),
            events: events::EventBus::new(),
        });
        let reader_shared = shared.clone();
        tokio::spawn(async move {
            if let Err(err) = reader_loop(reader_shared, read_half).await {
                tracing::warn!("control channel reader task ended: {err}");
            }
        });
        Ok(Self { shared })
    }

    /// Issue a raw command and wait for its reply. Used directly for
    /// `DUMPGUARDS`/`FINDPATH`, and internally by every other method.
    pub async fn raw(&self, cmd: &str) -> Result<Reply, FatalError> {
        let (tx, rx) = oneshot::channel();
        {
            let mut pending = self.shared.pending.lock().await;
            let mut writer = self.shared.writer.lock().await;
            writer
                .write_all(format!("{cmd}\r\n").as_bytes())
                .await
                .map_err(|e| FatalError::Protocol(format!("write failed: {e}")))?;
            pending.push_back(tx);
        }
        rx.await
            .map_err(|_| FatalError::ConnectionClosed)
    }

    /// `SETCONF key=value`.
    pub async fn set_conf(&self, key: &str, value: &str) -> Result<(), FatalError> {
        let reply = self.raw(&format!("SETCONF {key}={value}")).await?;
        require_ok(reply, "SETCONF")
    }

    /// `RESETCONF key`.
    pub async fn reset_conf(&self, key: &str) -> Result<(), FatalError> {
        let reply = self.raw(&format!("RESETCONF {key}")).await?;
        require_ok(reply, "RESETCONF")
    }

    /// `GETCONF key`.
    pub async fn get_conf(&self, key: &str) -> Result<Option<String>, FatalError> {
        let reply = self.raw(&format!("GETCONF {key}")).await?;
        require_ok(reply.clone(), "GETCONF")?;
        Ok(reply
            .lines
            .iter()
            .find_map(|l| parse_keyvalue(l, key)))
    }

    /// `GETINFO key`.
    pub async fn get_info(&self, key: &str) -> Result<String, FatalError> {
        let reply = self.raw(&format!("GETINFO {key}")).await?;
        require_ok(reply.clone(), "GETINFO")?;
        reply
            .lines
            .iter()
            .find_map(|l| parse_keyvalue(l, key))
            .ok_or_else(|| FatalError::Protocol(format!("GETINFO {key} missing value")))
    }

    /// `GETINFO circuit-status`.
    pub async fn get_circuits(&self) -> Result<Vec<CircuitInfo>, FatalError> {
        let reply = self.raw("GETINFO circuit-status").await?;
        require_ok(reply.clone(), "GETINFO circuit-status")?;
        let mut out = Vec::new();
        for line in &reply.lines {
            if line == "circuit-status=" || line == "OK" || line.is_empty() {
                continue;
            }
            let mut fields = line.split_whitespace();
            let Some(id) = fields.next() else { continue };
            let Some(status) = fields.next() else { continue };
            let mut build_flags = Vec::new();
            for field in fields {
                if let Some(v) = field.strip_prefix("BUILD_FLAGS=") {
                    build_flags = v.split(',').map(str::to_string).collect();
                }
            }
            out.push(CircuitInfo {
                id: id.to_string(),
                status: status.to_string(),
                build_flags,
            });
        }
        Ok(out)
    }

    /// `CLOSECIRCUIT id`. An unknown circuit is reported as
    /// [`ControlError::UnknownCircuit`] rather than a hard error — it's
    /// idempotent from the caller's point of view.
    pub async fn close_circuit(&self, id: &str) -> Result<(), ControlError> {
        let reply = self
            .raw(&format!("CLOSECIRCUIT {id}"))
            .await
            .map_err(|e| ControlError::Other(e.to_string()))?;
        if reply.is_ok() {
            Ok(())
        } else {
            Err(reply.into_control_error())
        }
    }

    /// `EXTENDCIRCUIT 0 fp1,fp2,fp3`. Returns immediately once the
    /// command is acknowledged; the assigned circuit id arrives later
    /// via a `LAUNCHED` event.
    pub async fn extend_circuit(&self, path: &[Fingerprint]) -> Result<(), FatalError> {
        let joined = path
            .iter()
            .map(Fingerprint::as_str)
            .collect::<Vec<_>>()
            .join(",");
        let reply = self
            .raw(&format!("EXTENDCIRCUIT 0 {joined} purpose=general"))
            .await?;
        require_ok(reply, "EXTENDCIRCUIT")
    }

    /// `ATTACHSTREAM stream_id circ_id`.
    pub async fn attach_stream(&self, stream_id: &str, circ_id: &str) -> Result<(), ControlError> {
        let reply = self
            .raw(&format!("ATTACHSTREAM {stream_id} {circ_id}"))
            .await
            .map_err(|e| ControlError::Other(e.to_string()))?;
        if reply.is_ok() {
            Ok(())
        } else {
            Err(reply.into_control_error())
        }
    }

    /// `CLOSESTREAM id 1` (reason `MISC`).
    pub async fn close_stream(&self, id: &str) -> Result<(), ControlError> {
        let reply = self
            .raw(&format!("CLOSESTREAM {id} 1"))
            .await
            .map_err(|e| ControlError::Other(e.to_string()))?;
        if reply.is_ok() {
            Ok(())
        } else {
            Err(reply.into_control_error())
        }
    }

    /// `GETINFO ns/id/FP`.
    pub async fn get_network_status(&self, fp: &Fingerprint) -> Result<NetworkStatus, ControlError> {
        let reply = self
            .raw(&format!("GETINFO ns/id/{fp}"))
            .await
            .map_err(|e| ControlError::Other(e.to_string()))?;
        if !reply.is_ok() {
            return Err(reply.into_control_error());
        }
        let body = reply.body();
        Ok(NetworkStatus {
            fingerprint: fp.clone(),
            flags: RelayFlags {
                running: body.contains("Running"),
                valid: body.contains("Valid"),
                guard: body.contains("Guard"),
                exit: body.contains("Exit"),
            },
            bandwidth_weight: extract_bandwidth(&body),
        })
    }

    /// `GETINFO desc/id/FP`.
    pub async fn get_server_descriptor(
        &self,
        fp: &Fingerprint,
    ) -> Result<ServerDescriptor, ControlError> {
        let reply = self
            .raw(&format!("GETINFO desc/id/{fp}"))
            .await
            .map_err(|e| ControlError::Other(e.to_string()))?;
        if !reply.is_ok() {
            return Err(reply.into_control_error());
        }
        let body = reply.body();
        let exit_policy_permits_http =
            body.lines().any(|l| l.starts_with("accept") && l.contains(":80"))
                && !body.lines().any(|l| l.starts_with("reject *:*"));
        let version = body
            .lines()
            .find_map(|l| l.strip_prefix("platform Tor "))
            .map(|rest| rest.split_whitespace().next().unwrap_or("").to_string())
            .unwrap_or_default();
        Ok(ServerDescriptor {
            fingerprint: fp.clone(),
            exit_policy_permits_http,
            version,
        })
    }

    /// Subscribe to a class of asynchronous events.
    pub fn subscribe(&self, kind: EventKind) -> (SubscriptionId, mpsc::UnboundedReceiver<Event>) {
        self.shared.events.subscribe(kind)
    }

    /// Stop receiving events for a prior subscription.
    pub fn unsubscribe(&self, id: SubscriptionId) {
        self.shared.events.unsubscribe(id)
    }

    /// Close every circuit the control channel currently reports that
    /// isn't marked `IS_INTERNAL`, as the original implementation does
    /// before starting a run.
    pub async fn reset_non_internal_circuits(&self) -> Result<(), FatalError> {
        for circ in self.get_circuits().await? {
            if !circ.build_flags.iter().any(|f| f == "IS_INTERNAL") {
                let _ = self.close_circuit(&circ.id).await;
            }
        }
        Ok(())
    }

    /// Apply the mandatory measurement-time configuration overrides
    /// (`spec.md` §4.1), returning the prior values so the caller can
    /// restore them on shutdown via [`ControlClient::restore_startup_config`].
    ///
    /// `MaxCircuitDirtiness` is only ever raised, never lowered: the
    /// circuit must outlive the full probe budget
    /// (`10 * (rtt_probes + ttfb_probes)` seconds), but an operator's
    /// existing, larger value is left alone.
    pub async fn apply_startup_config(
        &self,
        rtt_probes: u32,
        ttfb_probes: u32,
    ) -> Result<StartupConfig, FatalError> {
        let prior = StartupConfig {
            disable_predicted_circuits: self.get_conf("__DisablePredictedCircuits").await?,
            leave_streams_unattached: self.get_conf("__LeaveStreamsUnattached").await?,
            max_client_circuits_pending: self.get_conf("MaxClientCircuitsPending").await?,
            max_circuit_dirtiness: self.get_conf("MaxCircuitDirtiness").await?,
        };

        self.set_conf("__DisablePredictedCircuits", "1").await?;
        self.set_conf("__LeaveStreamsUnattached", "1").await?;
        self.set_conf("MaxClientCircuitsPending", "1024").await?;

        let current_dirtiness: u64 = prior
            .max_circuit_dirtiness
            .as_deref()
            .and_then(|v| v.parse().ok())
            .unwrap_or(0);
        let required_dirtiness = 10 * (rtt_probes as u64 + ttfb_probes as u64);
        let new_dirtiness = current_dirtiness.max(required_dirtiness);
        self.set_conf("MaxCircuitDirtiness", &new_dirtiness.to_string())
            .await?;

        Ok(prior)
    }

    /// Restore the configuration keys [`ControlClient::apply_startup_config`]
    /// overrode to their prior values, or `RESETCONF` them if they had no
    /// prior value at all.
    pub async fn restore_startup_config(&self, prior: &StartupConfig) -> Result<(), FatalError> {
        self.restore_one("__DisablePredictedCircuits", prior.disable_predicted_circuits.as_deref())
            .await?;
        self.restore_one("__LeaveStreamsUnattached", prior.leave_streams_unattached.as_deref())
            .await?;
        self.restore_one(
            "MaxClientCircuitsPending",
            prior.max_client_circuits_pending.as_deref(),
        )
        .await?;
        self.restore_one("MaxCircuitDirtiness", prior.max_circuit_dirtiness.as_deref())
            .await?;
        Ok(())
    }

    async fn restore_one(&self, key: &str, prior: Option<&str>) -> Result<(), FatalError> {
        match prior {
            Some(value) => self.set_conf(key, value).await,
            None => self.reset_conf(key).await,
        }
    }
}

/// Prior values of the configuration keys [`ControlClient::apply_startup_config`]
/// overrides, captured so they can be restored on shutdown (`spec.md` §5
/// cancellation: "Control-channel configuration overrides applied at
/// startup are unconditionally reset").
#[derive(Debug, Clone, Default)]
pub struct StartupConfig {
    disable_predicted_circuits: Option<String>,
    leave_streams_unattached: Option<String>,
    max_client_circuits_pending: Option<String>,
    max_circuit_dirtiness: Option<String>,
}

fn require_ok(reply: Reply, what: &str) -> Result<(), FatalError> {
    if reply.is_ok() {
        Ok(())
    } else {
        Err(FatalError::Protocol(format!("{what} failed: {}", reply.body())))
    }
}

fn extract_bandwidth(body: &str) -> u32 {
    body.split_whitespace()
        .find_map(|tok| tok.strip_prefix("Bandwidth="))
        .and_then(|v| v.parse().ok())
        .unwrap_or(0)
}

async fn reader_loop(
    shared: Arc<Shared>,
    read_half: tokio::net::tcp::OwnedReadHalf,
) -> Result<(), FatalError> {
    use tokio::io::AsyncBufReadExt;
    let mut reader = BufReader::new(read_half).lines();
    let mut assembler = ReplyAssembler::default();
    while let Some(line) = reader
        .next_line()
        .await
        .map_err(|e| FatalError::Protocol(format!("read failed: {e}")))?
    {
        match assembler.feed(&line)? {
            Fed::Pending => {}
            Fed::Reply(reply) => {
                let waiter = shared.pending.lock().await.pop_front();
                if let Some(tx) = waiter {
                    let _ = tx.send(reply);
                }
            }
            Fed::EventBlock { lines, .. } => {
                dispatch_event_block(&shared.events, &lines);
            }
        }
    }
    Ok(())
}

fn dispatch_event_block(events: &events::EventBus, lines: &[String]) {
    let now = time::OffsetDateTime::now_utc();
    if let Some(ev) = parse_circ_event(lines, now) {
        events.dispatch(Event::Circ(ev));
        return;
    }
    if let Some(ev) = parse_stream_event(lines, now) {
        events.dispatch(Event::Stream(ev));
        return;
    }
    if let Some(first) = lines.first() {
        if let Some(rest) = first.strip_prefix("INFO ") {
            events.dispatch(Event::Info {
                message: rest.to_string(),
            });
        } else if let Some(rest) = first.strip_prefix("NOTICE ") {
            events.dispatch(Event::Notice {
                message: rest.to_string(),
            });
        }
    }
}
