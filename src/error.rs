//! Error taxonomy shared by every layer of the fleet.
//!
//! Per spec, these are a *taxonomy*, not a zoo of distinct types: every
//! caller-facing failure is a [`FleetError`] carrying a stable [`ErrorKind`]
//! tag, a human message, and optional context (upstream name, correlation
//! id). `TransportError` is the narrower error surfaced by a single
//! transport adapter (C1), which `ResilientConnection` translates into a
//! `FleetError` when it escapes to a caller.

use std::fmt;
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

/// Errors an upstream transport adapter (C1) can return.
///
/// `Remote` and `Protocol` are never recorded as circuit breaker failures;
/// `Transport` and `Timeout` are.
#[derive(Debug, Error, Clone)]
pub enum TransportError {
    #[error("transport error: {message}")]
    Transport { message: String },

    #[error("protocol violation: {message}")]
    Protocol { message: String },

    #[error("operation timed out after {duration:?}")]
    Timeout { duration: Duration },

    #[error("upstream returned an error: {message}")]
    Remote { message: String },
}

/// Stable error kind tag, independent of the human-readable message.
///
/// Callers should match on this rather than on [`FleetError`]'s `Display`
/// output, which is free to change wording. Metrics count errors by kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Backpressure: submission was rejected immediately.
    QueueFull,
    /// Selector found no eligible connection at dispatch time.
    NoUpstreamAvailable,
    /// Deadline elapsed, in queue or during the upstream call.
    Timeout,
    /// Explicit cancellation by caller or shutdown.
    Cancelled,
    /// The chosen upstream's breaker refused the call.
    CircuitOpen,
    /// Underlying I/O or process failure; retriable at the fleet level.
    Transport,
    /// Malformed frame or contract violation; typically non-retriable.
    Protocol,
    /// Upstream explicitly returned an error; passed through verbatim.
    Remote,
    /// Invalid config at startup or on dynamic update.
    ConfigurationError,
    /// Tried to add an upstream past the configured cap.
    LimitExceeded,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::QueueFull => "queue_full",
            Self::NoUpstreamAvailable => "no_upstream_available",
            Self::Timeout => "timeout",
            Self::Cancelled => "cancelled",
            Self::CircuitOpen => "circuit_open",
            Self::Transport => "transport",
            Self::Protocol => "protocol",
            Self::Remote => "remote",
            Self::ConfigurationError => "configuration_error",
            Self::LimitExceeded => "limit_exceeded",
        };
        f.write_str(s)
    }
}

/// Error surfaced to embedders of the fleet manager.
///
/// Carries a stable [`ErrorKind`], a human-readable message, and optional
/// context: the upstream involved, a correlation id for tracing a single
/// request across logs, and the transport-level cause when one exists.
#[derive(Debug, Error, Clone)]
#[error("{kind}: {message}")]
pub struct FleetError {
    pub kind: ErrorKind,
    pub message: String,
    pub upstream: Option<String>,
    pub correlation_id: Option<Uuid>,
    #[source]
    pub source: Option<TransportError>,
}

impl FleetError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            upstream: None,
            correlation_id: None,
            source: None,
        }
    }

    pub fn with_upstream(mut self, upstream: impl Into<String>) -> Self {
        self.upstream = Some(upstream.into());
        self
    }

    pub fn with_correlation_id(mut self, id: Uuid) -> Self {
        self.correlation_id = Some(id);
        self
    }

    pub fn queue_full(depth: usize, capacity: usize) -> Self {
        Self::new(
            ErrorKind::QueueFull,
            format!("request queue is full ({depth}/{capacity})"),
        )
    }

    pub fn no_upstream_available() -> Self {
        Self::new(ErrorKind::NoUpstreamAvailable, "no eligible upstream available")
    }

    pub fn timeout() -> Self {
        Self::new(ErrorKind::Timeout, "deadline elapsed")
    }

    pub fn cancelled() -> Self {
        Self::new(ErrorKind::Cancelled, "request was cancelled")
    }

    pub fn circuit_open(upstream: impl Into<String>) -> Self {
        let upstream = upstream.into();
        Self::new(ErrorKind::CircuitOpen, format!("circuit breaker open for '{upstream}'"))
            .with_upstream(upstream)
    }

    pub fn configuration(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::ConfigurationError, message)
    }

    pub fn limit_exceeded(current: usize, max: usize) -> Self {
        Self::new(
            ErrorKind::LimitExceeded,
            format!("fleet size limit exceeded ({current}/{max})"),
        )
    }

    /// Translate a transport-level error (C1) into a caller-facing error,
    /// tagging it with the upstream it came from.
    pub fn from_transport(upstream: impl Into<String>, err: TransportError) -> Self {
        let upstream = upstream.into();
        let kind = match &err {
            TransportError::Transport { .. } => ErrorKind::Transport,
            TransportError::Protocol { .. } => ErrorKind::Protocol,
            TransportError::Timeout { .. } => ErrorKind::Timeout,
            TransportError::Remote { .. } => ErrorKind::Remote,
        };
        let message = err.to_string();
        Self {
            kind,
            message,
            upstream: Some(upstream),
            correlation_id: None,
            source: Some(err),
        }
    }

    /// Whether a fleet-level retry against a different upstream is worth
    /// attempting, if the caller's retry budget allows it.
    pub fn is_retriable(&self) -> bool {
        matches!(
            self.kind,
            ErrorKind::Transport | ErrorKind::Timeout | ErrorKind::CircuitOpen | ErrorKind::NoUpstreamAvailable
        )
    }

    /// Whether this error should be recorded as a circuit breaker failure.
    /// `Remote` and `Protocol` are contract violations or business errors,
    /// not liveness signals; `Cancelled` is never a failure.
    pub fn feeds_breaker(&self) -> bool {
        matches!(self.kind, ErrorKind::Transport | ErrorKind::Timeout)
    }
}
