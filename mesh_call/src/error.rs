use crate::message::PeerId;

/// Failures surfaced by a meeting session.
///
/// Per-peer failures (`NegotiationFailed`, `TrackReplaceFailed`) are isolated to
/// the connection they happened on; the session keeps running.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Media capture permission denied: {0}")]
    PermissionDenied(String),

    #[error("Media unavailable: {0}")]
    MediaUnavailable(String),

    #[error("Another media operation is still in progress")]
    MediaBusy,

    #[error("Negotiation with {peer_id} failed")]
    NegotiationFailed {
        peer_id: PeerId,
        #[source]
        source: TransportError,
    },

    #[error("Malformed signal payload")]
    MalformedSignal(#[source] serde_json::Error),

    #[error("Relay disconnected")]
    RelayDisconnected,

    #[error("Replacing track for {peer_id} failed")]
    TrackReplaceFailed {
        peer_id: PeerId,
        #[source]
        source: TransportError,
    },

    #[error("Display name must not be empty")]
    EmptyDisplayName,

    #[error("Meeting code must not be empty")]
    EmptyMeetingCode,

    #[error("Meeting has ended")]
    MeetingEnded,

    #[error("Relay error: {0}")]
    Relay(String),

    #[error(transparent)]
    UnexpectedError(#[from] anyhow::Error),
}

/// Failures of a single peer transport.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("Connection closed")]
    Closed,

    #[error("Unknown sender {0}")]
    UnknownSender(usize),

    #[error("Unsupported session description type {0}")]
    UnsupportedDescription(String),

    #[error(transparent)]
    Rtc(#[from] webrtc::Error),

    #[error("{0}")]
    Other(String),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
