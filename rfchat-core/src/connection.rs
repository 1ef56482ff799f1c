//! Connection lifecycle: role, state machine, and what to do when a read fails.

use std::fmt;
use std::io::ErrorKind;

use crate::wire::FrameReadError;

/// Which side of the chat this connection is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    /// Advertises the service and accepts one inbound peer.
    Server,
    /// Discovers a peer and opens the outbound stream.
    Client,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Server => f.write_str("server"),
            Role::Client => f.write_str("client"),
        }
    }
}

/// Lifecycle of the single connection slot. The client's discovery phase is
/// tracked by the watcher status, not here.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    Idle,
    Advertising,
    Connecting,
    Connected,
    Disconnecting,
    Disconnected,
}

/// Connection state guarded by the legal transitions for its role.
#[derive(Debug, Clone)]
pub struct ConnectionStateMachine {
    role: Option<Role>,
    state: ConnectionState,
}

impl ConnectionStateMachine {
    pub fn new() -> Self {
        Self {
            role: None,
            state: ConnectionState::Idle,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Role of the current or most recent connection attempt.
    pub fn role(&self) -> Option<Role> {
        self.role
    }

    /// True while nothing is held: a new listen or connect may begin.
    pub fn is_idle(&self) -> bool {
        matches!(
            self.state,
            ConnectionState::Idle | ConnectionState::Disconnected
        )
    }

    /// Begin a listen (server) or connect (client) attempt.
    pub fn begin(&mut self, role: Role) -> Result<(), TransitionError> {
        let to = match role {
            Role::Server => ConnectionState::Advertising,
            Role::Client => ConnectionState::Connecting,
        };
        if !self.is_idle() {
            return Err(TransitionError {
                from: self.state,
                to,
            });
        }
        self.role = Some(role);
        self.state = to;
        Ok(())
    }

    /// Move to `to` if the transition is legal; otherwise leave the state untouched.
    pub fn transition(&mut self, to: ConnectionState) -> Result<(), TransitionError> {
        if !can_transition(self.state, to) {
            return Err(TransitionError {
                from: self.state,
                to,
            });
        }
        self.state = to;
        if to == ConnectionState::Idle {
            self.role = None;
        }
        Ok(())
    }
}

impl Default for ConnectionStateMachine {
    fn default() -> Self {
        Self::new()
    }
}

/// Legal moves. `begin` covers leaving Idle/Disconnected.
pub fn can_transition(from: ConnectionState, to: ConnectionState) -> bool {
    use ConnectionState::*;
    matches!(
        (from, to),
        (Advertising, Connected)
            | (Advertising, Idle)
            | (Advertising, Disconnecting)
            | (Connecting, Connected)
            | (Connecting, Idle)
            | (Connecting, Disconnecting)
            | (Connected, Disconnected)
            | (Connected, Disconnecting)
            | (Disconnecting, Disconnected)
            | (Disconnected, Disconnecting)
    )
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("illegal connection transition {from:?} -> {to:?}")]
pub struct TransitionError {
    pub from: ConnectionState,
    pub to: ConnectionState,
}

/// Why the receive loop ended without raising an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopCause {
    /// Orderly close between frames.
    PeerClosed,
    /// Stream ended mid-frame; the partial message is dropped.
    TruncatedFrame,
    /// The local side closed the stream under the read.
    LocalAbort,
}

impl fmt::Display for StopCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StopCause::PeerClosed => f.write_str("peer closed the connection"),
            StopCause::TruncatedFrame => f.write_str("connection closed mid-message"),
            StopCause::LocalAbort => f.write_str("connection closed locally"),
        }
    }
}

/// Receive-loop decision for a failed read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadOutcome {
    /// Exit the loop without notifying the caller of an error.
    StopSilently(StopCause),
    /// Notify the caller and tear the connection down.
    Disconnect(DisconnectReason),
}

/// Classify a read failure. `locally_closed` is true once the stream has been
/// released by a local disconnect; any fault after that is expected.
pub fn classify_read_error(err: &FrameReadError, locally_closed: bool) -> ReadOutcome {
    match err {
        FrameReadError::PeerClosed => ReadOutcome::StopSilently(StopCause::PeerClosed),
        FrameReadError::TruncatedFrame { .. } => {
            ReadOutcome::StopSilently(StopCause::TruncatedFrame)
        }
        _ if locally_closed => ReadOutcome::StopSilently(StopCause::LocalAbort),
        FrameReadError::Io(e) if is_abort(e.kind()) => {
            ReadOutcome::StopSilently(StopCause::LocalAbort)
        }
        other => ReadOutcome::Disconnect(DisconnectReason::ReadFailed(other.to_string())),
    }
}

fn is_abort(kind: ErrorKind) -> bool {
    matches!(kind, ErrorKind::ConnectionAborted | ErrorKind::Interrupted)
}

/// True when a write failure means the peer has gone away.
pub fn is_peer_gone(kind: ErrorKind) -> bool {
    matches!(
        kind,
        ErrorKind::BrokenPipe
            | ErrorKind::ConnectionReset
            | ErrorKind::ConnectionAborted
            | ErrorKind::NotConnected
            | ErrorKind::UnexpectedEof
    )
}

/// Reason reported with a disconnect notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisconnectReason {
    /// User asked to disconnect.
    Local,
    /// Reading from the stream failed.
    ReadFailed(String),
    /// Writing to the stream failed because the peer is gone.
    RemoteSideDisconnect(String),
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DisconnectReason::Local => f.write_str("Disconnected"),
            DisconnectReason::ReadFailed(e) => write!(f, "Read stream failed with error: {e}"),
            DisconnectReason::RemoteSideDisconnect(e) => write!(f, "Remote side disconnect: {e}"),
        }
    }
}
