//! Error taxonomy for the measurement engine.
//!
//! Mirrors the five error kinds from the design: environmental
//! prerequisites, transient per-probe failures, control-protocol
//! contract violations, invariant violations, and user interruption.
//! Only the first and fourth are fatal; the others are absorbed at the
//! point they occur and never propagate up as a [`FatalError`].

use thiserror::Error;

/// Unrecoverable startup or control-protocol failure.
///
/// Anything of this kind aborts the whole run with a non-zero exit code.
#[derive(Debug, Error)]
pub enum FatalError {
    /// Could not open a TCP connection to the control channel.
    #[error("could not connect to control channel at {host}:{port}: {source}")]
    ConnectFailed {
        /// Control channel host.
        host: String,
        /// Control channel port.
        port: u16,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// The control channel does not understand a mandatory non-standard
    /// command (`DUMPGUARDS` or `FINDPATH`).
    #[error("control channel rejected mandatory command {command:?}: {reply}. Is your overlay client patched?")]
    MissingCommand {
        /// The command that failed.
        command: &'static str,
        /// The raw reply text.
        reply: String,
    },

    /// The control channel returned a reply we could not parse at all.
    #[error("malformed control channel reply: {0}")]
    Protocol(String),

    /// The underlying TCP connection to the control channel closed
    /// unexpectedly.
    #[error("control channel connection closed unexpectedly")]
    ConnectionClosed,

    /// A command-line argument failed validation before any control
    /// channel side effect was attempted.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// A control-protocol contract violation outside the whitelisted set
    /// absorbed in [`ControlError`].
    #[error("unexpected control channel condition: {0}")]
    ProtocolViolation(String),

    /// An internal invariant was violated — a programmer error, not an
    /// external fault.
    #[error("invariant violated: {0}")]
    Invariant(String),

    /// Failure to set up logging, configuration, or other process
    /// plumbing.
    #[error("startup failure: {0}")]
    Startup(#[from] anyhow::Error),
}

/// A condition reported by the control channel in response to a
/// command. Some variants are expected and recoverable by the caller;
/// others are promoted to [`FatalError`] by whoever receives them.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ControlError {
    /// `close_circuit`/`attach_stream` referred to a circuit the
    /// control channel no longer knows about. Idempotent: callers may
    /// ignore this.
    #[error("unknown circuit {0:?}")]
    UnknownCircuit(String),

    /// `attach_stream`/`close_stream` referred to a stream the control
    /// channel no longer knows about.
    #[error("unknown stream {0:?}")]
    UnknownStream(String),

    /// `attach_stream` was issued against a circuit that exists but is
    /// not an open, origin-side circuit (e.g. it failed or closed
    /// between `extend_circuit` returning and the attach attempt).
    #[error("not an open origin circuit: {0:?}")]
    NotOpenOriginCircuit(String),

    /// `get_network_status`/`get_server_descriptor` found nothing for
    /// the given fingerprint.
    #[error("not found: {0:?}")]
    NotFound(String),

    /// Any other error reply from the control channel, not part of the
    /// whitelist above.
    #[error("control channel error: {0}")]
    Other(String),
}

/// A per-probe failure absorbed into the [`crate::record::Probe`] being
/// built, rather than surfaced to the caller.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ProbeError {
    /// A SOCKS5 CONNECT failed with a reason outside the accepted
    /// whitelist.
    #[error("socks5 error: {0}")]
    Socks(String),

    /// The underlying HTTP transport failed (connect refused, timeout,
    /// TLS error, etc).
    #[error("http transport error: {0}")]
    Transport(String),

    /// The HTTP response had an unexpected `Content-Length` or redirect
    /// count.
    #[error("{0}")]
    UnexpectedResponse(String),
}

/// Report a fatal error to stderr and exit the process with a non-zero
/// status, the way `tor_error::report_and_exit` does for `arti`.
pub fn report_and_exit(err: anyhow::Error) -> ! {
    eprintln!("navigator: fatal: {err:#}");
    std::process::exit(1);
}
