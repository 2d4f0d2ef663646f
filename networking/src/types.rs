use std::fmt::Display;

use serde::{Deserialize, Serialize};

/// Peer connection state machine.
///
/// Tracks the lifecycle of a connection to a peer:
/// DISCONNECTED -> CONNECTING -> CONNECTED -> DISCONNECTING -> DISCONNECTED
#[derive(Debug, Serialize, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    /// No active connection to this peer.
    Disconnected,
    /// TCP/QUIC connection in progress.
    Connecting,
    /// Transport established, can exchange protocol messages.
    Connected,
    /// Graceful shutdown in progress (Goodbye sent/received).
    Disconnecting,
}

/// Reason given when disconnecting from a peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u64)]
pub enum GoodbyeReason {
    /// Node is shutting down normally.
    ClientShutdown = 1,
    /// Peer is on a different fork or network.
    IrrelevantNetwork = 2,
    /// Peer served invalid data or otherwise misbehaved.
    FaultOrError = 3,
}

impl Display for GoodbyeReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            GoodbyeReason::ClientShutdown => "client_shutdown",
            GoodbyeReason::IrrelevantNetwork => "irrelevant_network",
            GoodbyeReason::FaultOrError => "fault_or_error",
        };
        f.write_str(label)
    }
}
