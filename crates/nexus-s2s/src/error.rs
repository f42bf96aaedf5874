//! Federation error types and session fault classification.

use std::fmt;

use nexus_common::JidError;
use thiserror::Error;

use crate::cid::Cid;
use crate::protocol::StreamErrorCondition;
use crate::transport::TransportError;

/// Errors returned by router and pipeline operations.
#[derive(Debug, Error)]
pub enum S2sError {
    // ── Addressing ───────────────────────────────────────────────────────────

    #[error("Domain '{0}' is not hosted on this server")]
    NotLocalHost(String),

    #[error("Remote domain '{0}' is hosted on this server")]
    LocalHost(String),

    #[error("Stanza has an invalid address: {0}")]
    InvalidAddress(String),

    #[error("Stanza addressed to local domain '{0}' cannot be federated")]
    LocalDestination(String),

    // ── Capacity (retryable) ─────────────────────────────────────────────────

    #[error("Waiting queue for {cid} is full ({waiting} stanzas)")]
    PoolExhausted { cid: Cid, waiting: usize },

    #[error("No connection available for {0}")]
    NoConnection(Cid),

    // ── Setup ────────────────────────────────────────────────────────────────

    #[error("Invalid processor pipeline: {0}")]
    Pipeline(String),

    #[error("Router is shutting down")]
    ShuttingDown,

    // ── General ──────────────────────────────────────────────────────────────

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Jid(#[from] JidError),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl S2sError {
    /// Resource exhaustion is reported to callers as retryable, never fatal.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::PoolExhausted { .. } | Self::NoConnection(_))
    }

    /// Stream error a peer receives when this error ends its session.
    pub fn stream_condition(&self) -> StreamErrorCondition {
        match self {
            Self::NotLocalHost(_) => StreamErrorCondition::HostUnknown,
            Self::LocalHost(_) => StreamErrorCondition::InvalidFrom,
            Self::InvalidAddress(_) | Self::Jid(_) => StreamErrorCondition::ImproperAddressing,
            Self::PoolExhausted { .. } | Self::NoConnection(_) => StreamErrorCondition::ResourceConstraint,
            Self::ShuttingDown => StreamErrorCondition::SystemShutdown,
            _ => StreamErrorCondition::InternalServerError,
        }
    }
}

// ─── Session faults ──────────────────────────────────────────────────────────

/// Fault classes; each decides how a session is torn down.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FaultKind {
    /// Malformed stream, unknown namespace, non-local target. No retry.
    Protocol,
    /// Dialback `invalid`, required TLS missing or failed. The CID is not blacklisted.
    Security,
    /// A deadline expired; handled like a security fault.
    Timeout,
    /// Local capacity limits.
    ResourceExhausted,
    /// Socket-level failure: the transport is force-closed without an error flush.
    Transport,
    /// Local shutdown or idle reaping.
    Shutdown,
}

impl FaultKind {
    /// Whether a best-effort `<stream:error/>` is written before closing.
    pub fn flushes_error(&self) -> bool {
        !matches!(self, Self::Transport)
    }
}

/// Why a session is being closed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fault {
    pub kind: FaultKind,
    pub condition: Option<StreamErrorCondition>,
    pub reason: String,
}

impl Fault {
    pub fn new(kind: FaultKind, condition: Option<StreamErrorCondition>, reason: impl Into<String>) -> Self {
        Self { kind, condition, reason: reason.into() }
    }

    pub fn protocol(condition: StreamErrorCondition, reason: impl Into<String>) -> Self {
        Self::new(FaultKind::Protocol, Some(condition), reason)
    }

    pub fn security(condition: StreamErrorCondition, reason: impl Into<String>) -> Self {
        Self::new(FaultKind::Security, Some(condition), reason)
    }

    pub fn timeout() -> Self {
        Self::new(FaultKind::Timeout, Some(StreamErrorCondition::ConnectionTimeout), "timeout")
    }

    pub fn transport(reason: impl Into<String>) -> Self {
        Self::new(FaultKind::Transport, None, reason)
    }

    pub fn shutdown(condition: Option<StreamErrorCondition>, reason: impl Into<String>) -> Self {
        Self::new(FaultKind::Shutdown, condition, reason)
    }

    /// The peer reported a stream error; nothing is sent back.
    pub fn remote(condition: Option<StreamErrorCondition>) -> Self {
        let reason = match condition {
            Some(c) => format!("peer sent stream error {c}"),
            None => "peer sent stream error".to_owned(),
        };
        Self::new(FaultKind::Protocol, None, reason)
    }

    /// Map a routing error raised while handling a peer's stream.
    pub fn from_error(err: &S2sError) -> Self {
        let kind = match err {
            S2sError::Transport(_) => FaultKind::Transport,
            S2sError::PoolExhausted { .. } | S2sError::NoConnection(_) => FaultKind::ResourceExhausted,
            S2sError::ShuttingDown => FaultKind::Shutdown,
            _ => FaultKind::Protocol,
        };
        let condition = kind.flushes_error().then(|| err.stream_condition());
        Self::new(kind, condition, err.to_string())
    }
}

impl fmt::Display for Fault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}: {}", self.kind, self.reason)?;
        if let Some(c) = self.condition {
            write!(f, " ({c})")?;
        }
        Ok(())
    }
}
