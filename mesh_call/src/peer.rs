use std::{
    collections::{HashMap, VecDeque},
    fmt,
    sync::Arc,
};

use async_trait::async_trait;
use getset::{CopyGetters, Getters};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::{
    error::TransportError,
    media::{LocalTrack, RemoteStream, RemoteTrack, TrackKind},
    message::{IceCandidate, PeerId, SessionDescription, SignalPayload},
};

mod rtc;
mod rtc_config;
pub use rtc::{RtcTransport, RtcTransportFactory};
pub use rtc_config::{RtcConfig, RtcConfigBuilder};

/// Index of an outbound sender on one transport.
pub type SenderId = usize;

/// Identifies one connection instance. A peer that is removed and created
/// again gets a new id, so continuations of the old one can be told apart.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(pub u64);

/// Negotiated transport to one remote peer.
#[async_trait]
pub trait PeerTransport: Send + Sync {
    async fn create_offer(&self) -> Result<SessionDescription, TransportError>;

    async fn create_answer(&self) -> Result<SessionDescription, TransportError>;

    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), TransportError>;

    async fn local_description(&self) -> Option<SessionDescription>;

    async fn set_remote_description(&self, desc: SessionDescription)
        -> Result<(), TransportError>;

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), TransportError>;

    /// Adds an outbound sender of `kind`, optionally with a track already on it.
    async fn add_track(
        &self,
        kind: TrackKind,
        track: Option<LocalTrack>,
    ) -> Result<SenderId, TransportError>;

    /// Swaps the track on an existing sender without renegotiating.
    async fn replace_track(
        &self,
        sender: SenderId,
        track: Option<LocalTrack>,
    ) -> Result<(), TransportError>;

    fn is_closed(&self) -> bool;

    async fn close(&self) -> Result<(), TransportError>;
}

/// Builds transports for new connections.
#[async_trait]
pub trait TransportFactory: Send + Sync {
    async fn create(
        &self,
        peer_id: &PeerId,
        connection: ConnectionId,
        events: PeerEventSender,
    ) -> Result<Arc<dyn PeerTransport>, TransportError>;
}

/// Something a transport reports on its own.
#[derive(Debug, Clone)]
pub struct PeerEvent {
    pub peer_id: PeerId,
    pub connection: ConnectionId,
    pub kind: PeerEventKind,
}

#[derive(Debug, Clone)]
pub enum PeerEventKind {
    LocalCandidate(IceCandidate),
    RemoteTrack(RemoteTrack),
}

pub type PeerEventSender = mpsc::UnboundedSender<PeerEvent>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiationState {
    New,
    OfferSent,
    AnswerPending,
    Stable,
    Closed,
}

impl fmt::Display for NegotiationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            NegotiationState::New => "NEW",
            NegotiationState::OfferSent => "OFFER_SENT",
            NegotiationState::AnswerPending => "ANSWER_PENDING",
            NegotiationState::Stable => "STABLE",
            NegotiationState::Closed => "CLOSED",
        };
        f.write_str(name)
    }
}

/// One negotiated connection and its signaling bookkeeping.
#[derive(Getters, CopyGetters)]
pub struct Connection {
    #[getset(get_copy = "pub")]
    id: ConnectionId,
    #[getset(get = "pub")]
    transport: Arc<dyn PeerTransport>,
    #[getset(get_copy = "pub")]
    pub(crate) state: NegotiationState,
    #[getset(get = "pub")]
    pub(crate) local_description: Option<SessionDescription>,
    #[getset(get = "pub")]
    pub(crate) remote_description: Option<SessionDescription>,
    /// Remote candidates that arrived before the remote description.
    pub(crate) pending_ice: Vec<IceCandidate>,
    senders: HashMap<TrackKind, SenderId>,
    /// Set while an asynchronous negotiation step runs.
    pub(crate) in_flight: bool,
    /// Signals that arrived while a step was in flight.
    pub(crate) queued: VecDeque<SignalPayload>,
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("state", &self.state)
            .field("pending_ice", &self.pending_ice.len())
            .field("in_flight", &self.in_flight)
            .field("queued", &self.queued.len())
            .finish()
    }
}

impl Connection {
    pub fn new(id: ConnectionId, transport: Arc<dyn PeerTransport>) -> Self {
        Self {
            id,
            transport,
            state: NegotiationState::New,
            local_description: None,
            remote_description: None,
            pending_ice: Vec::new(),
            senders: HashMap::new(),
            in_flight: false,
            queued: VecDeque::new(),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.state == NegotiationState::Closed
    }

    pub fn pending_candidates(&self) -> &[IceCandidate] {
        &self.pending_ice
    }

    pub fn sender(&self, kind: TrackKind) -> Option<SenderId> {
        self.senders.get(&kind).copied()
    }

    pub(crate) fn insert_sender(&mut self, kind: TrackKind, sender: SenderId) {
        self.senders.insert(kind, sender);
    }

    /// Takes over the remote candidates and queued signals of a connection
    /// this one replaces.
    pub(crate) fn inherit(&mut self, previous: &mut Connection) {
        self.pending_ice.append(&mut previous.pending_ice);
        self.queued.append(&mut previous.queued);
    }

    /// Marks the connection closed and releases the transport in the
    /// background. Continuations still in flight are discarded on arrival.
    pub fn close(&mut self) {
        if self.is_closed() {
            return;
        }
        self.state = NegotiationState::Closed;
        self.in_flight = false;
        self.pending_ice.clear();
        self.queued.clear();
        self.senders.clear();
        let transport = self.transport.clone();
        let id = self.id;
        tokio::spawn(async move {
            if let Err(e) = transport.close().await {
                warn!(?id, ?e, "Closing transport failed");
            }
        });
    }
}

/// One remote participant.
#[derive(Debug, Getters)]
pub struct Peer {
    #[getset(get = "pub")]
    peer_id: PeerId,
    #[getset(get = "pub")]
    display_name: String,
    #[getset(get = "pub")]
    connection: Connection,
    #[getset(get = "pub")]
    remote_stream: Option<RemoteStream>,
}

impl Peer {
    pub fn new(peer_id: PeerId, display_name: String, connection: Connection) -> Self {
        Self {
            peer_id,
            display_name,
            connection,
            remote_stream: None,
        }
    }

    pub fn connection_mut(&mut self) -> &mut Connection {
        &mut self.connection
    }

    pub(crate) fn replace_connection(&mut self, connection: Connection) -> Connection {
        self.remote_stream = None;
        std::mem::replace(&mut self.connection, connection)
    }

    pub fn set_display_name_if_unknown(&mut self, display_name: &str) {
        if self.display_name.is_empty() && !display_name.is_empty() {
            self.display_name = display_name.to_string();
        }
    }

    pub fn attach_remote_track(&mut self, track: RemoteTrack) {
        debug!(peer_id = %self.peer_id, track = %track.id, "Remote track attached");
        self.remote_stream
            .get_or_insert_with(RemoteStream::default)
            .attach(track);
    }
}
