//! Error taxonomy for the stack core.
//!
//! Capacity errors are values the caller recovers from (drop the unit, let
//! the peer retry). Protocol errors discard the offending unit. Connection
//! fatal conditions surface exactly once through `on_error`. Configuration
//! errors abort startup before the poll loop exists.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    /// A fixed-capacity pool has no free slot. Never fatal; the offending
    /// inbound unit is dropped or the new connection is refused.
    #[error("{0} pool exhausted")]
    Exhausted(&'static str),

    /// A header failed validation; the datagram is discarded.
    #[error("malformed packet: {0}")]
    Malformed(&'static str),

    /// An operation was attempted on a connection in a state that does not
    /// permit it (e.g. `send` after close).
    #[error("invalid state: {0}")]
    InvalidState(&'static str),

    /// The per-connection send queue reached the configured segment limit.
    #[error("send queue full")]
    QueueFull,

    /// A stale connection handle (the slot was recycled).
    #[error("stale connection handle")]
    StaleHandle,

    /// The memory budget cannot yield a usable profile, or arena
    /// reservations exceed it. Fatal at startup.
    #[error("configuration error: {0}")]
    Config(String),
}

/// Why a connection was torn down. Delivered once via `on_error`; the
/// handle is invalid afterwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// Retransmission limit exceeded or explicit local abort.
    Aborted,
    /// The peer sent RST.
    Reset,
    /// Keepalive probes went unanswered.
    KeepaliveTimeout,
    /// The accept handler rejected the connection.
    Refused,
}

impl std::fmt::Display for CloseReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CloseReason::Aborted => write!(f, "connection aborted"),
            CloseReason::Reset => write!(f, "connection reset by peer"),
            CloseReason::KeepaliveTimeout => write!(f, "keepalive timeout"),
            CloseReason::Refused => write!(f, "connection refused"),
        }
    }
}
