use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use webrtc::{
    api::{
        interceptor_registry::register_default_interceptors, media_engine::MediaEngine, APIBuilder,
    },
    ice_transport::{ice_candidate::RTCIceCandidateInit, ice_server::RTCIceServer},
    interceptor::registry::Registry,
    peer_connection::{
        configuration::RTCConfiguration, peer_connection_state::RTCPeerConnectionState,
        sdp::{sdp_type::RTCSdpType, session_description::RTCSessionDescription},
        RTCPeerConnection,
    },
    rtp_transceiver::{
        rtp_receiver::RTCRtpReceiver, rtp_sender::RTCRtpSender,
        rtp_transceiver_direction::RTCRtpTransceiverDirection, RTCRtpTransceiver,
        RTCRtpTransceiverInit,
    },
    track::track_remote::TrackRemote,
};

use super::{
    ConnectionId, PeerEvent, PeerEventKind, PeerEventSender, PeerTransport, RtcConfig, SenderId,
    TransportFactory,
};
use crate::{
    error::TransportError,
    media::{LocalTrack, RemoteTrack, TrackKind},
    message::{IceCandidate, PeerId, SdpType, SessionDescription},
};

fn to_rtc_description(desc: SessionDescription) -> Result<RTCSessionDescription, TransportError> {
    let desc = match desc.kind {
        SdpType::Offer => RTCSessionDescription::offer(desc.sdp)?,
        SdpType::Answer => RTCSessionDescription::answer(desc.sdp)?,
    };
    Ok(desc)
}

fn from_rtc_description(desc: RTCSessionDescription) -> Result<SessionDescription, TransportError> {
    match desc.sdp_type {
        RTCSdpType::Offer => Ok(SessionDescription::offer(desc.sdp)),
        RTCSdpType::Answer => Ok(SessionDescription::answer(desc.sdp)),
        other => Err(TransportError::UnsupportedDescription(other.to_string())),
    }
}

impl From<RTCIceCandidateInit> for IceCandidate {
    fn from(init: RTCIceCandidateInit) -> Self {
        Self {
            candidate: init.candidate,
            sdp_mid: init.sdp_mid,
            sdp_mline_index: init.sdp_mline_index,
            username_fragment: init.username_fragment,
        }
    }
}

impl From<IceCandidate> for RTCIceCandidateInit {
    fn from(candidate: IceCandidate) -> Self {
        Self {
            candidate: candidate.candidate,
            sdp_mid: candidate.sdp_mid,
            sdp_mline_index: candidate.sdp_mline_index,
            username_fragment: candidate.username_fragment,
        }
    }
}

/// Creates one webrtc-rs peer connection per remote peer.
#[derive(Debug, Clone)]
pub struct RtcTransportFactory {
    ice_servers: Vec<RTCIceServer>,
}

impl RtcTransportFactory {
    pub fn new(config: &RtcConfig) -> Self {
        Self {
            ice_servers: config.ice_servers.clone(),
        }
    }
}

#[async_trait]
impl TransportFactory for RtcTransportFactory {
    async fn create(
        &self,
        peer_id: &PeerId,
        connection: ConnectionId,
        events: PeerEventSender,
    ) -> Result<Arc<dyn PeerTransport>, TransportError> {
        let transport =
            RtcTransport::new(peer_id.clone(), connection, &self.ice_servers, events).await?;
        Ok(Arc::new(transport))
    }
}

pub struct RtcTransport {
    peer_id: PeerId,
    connection: Arc<RTCPeerConnection>,
    senders: Mutex<Vec<Arc<RTCRtpSender>>>,
    closed: AtomicBool,
}

impl std::fmt::Debug for RtcTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RtcTransport")
            .field("peer_id", &self.peer_id)
            .finish()
    }
}

impl RtcTransport {
    pub async fn new(
        peer_id: PeerId,
        id: ConnectionId,
        ice_servers: &[RTCIceServer],
        events: PeerEventSender,
    ) -> Result<Self, TransportError> {
        let connection = Self::create_peer_connection(&peer_id, ice_servers).await?;
        let transport = Self {
            peer_id,
            connection,
            senders: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        };
        transport.ice_candidates(id, events.clone());
        transport.remote_tracks(id, events);
        Ok(transport)
    }

    async fn create_peer_connection(
        peer_id: &PeerId,
        ice_servers: &[RTCIceServer],
    ) -> Result<Arc<RTCPeerConnection>, TransportError> {
        let mut m = MediaEngine::default();
        m.register_default_codecs()?;
        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut m)?;

        let api = APIBuilder::new()
            .with_media_engine(m)
            .with_interceptor_registry(registry)
            .build();
        let config = RTCConfiguration {
            ice_servers: ice_servers.to_vec(),
            ..Default::default()
        };
        let connection = Arc::new(api.new_peer_connection(config).await?);

        let peer_id = peer_id.clone();
        connection.on_peer_connection_state_change(Box::new(move |s: RTCPeerConnectionState| {
            info!(%peer_id, "Peer Connection State has changed: {}", s);

            if s == RTCPeerConnectionState::Failed {
                warn!(%peer_id, "Peer Connection has gone to failed state");
            }

            Box::pin(async {})
        }));
        Ok(connection)
    }

    fn ice_candidates(&self, id: ConnectionId, events: PeerEventSender) {
        let peer_id = self.peer_id.clone();
        self.connection.on_ice_candidate(Box::new(move |c| {
            let events = events.clone();
            let peer_id = peer_id.clone();
            Box::pin(async move {
                let Some(candidate) = c else {
                    return;
                };
                match candidate.to_json() {
                    Ok(init) => {
                        debug!(%peer_id, candidate = %init.candidate, "Local ICE candidate");
                        let _ = events.send(PeerEvent {
                            peer_id,
                            connection: id,
                            kind: PeerEventKind::LocalCandidate(init.into()),
                        });
                    }
                    Err(e) => warn!(%peer_id, ?e, "Could not serialize ICE candidate"),
                }
            })
        }));
    }

    fn remote_tracks(&self, id: ConnectionId, events: PeerEventSender) {
        let peer_id = self.peer_id.clone();
        self.connection.on_track(Box::new(
            move |track: Arc<TrackRemote>,
                  _receiver: Arc<RTCRtpReceiver>,
                  _transceiver: Arc<RTCRtpTransceiver>| {
                let track = RemoteTrack::from_rtp(track);
                info!(%peer_id, track = %track.id, kind = ?track.kind, "Remote track");
                let _ = events.send(PeerEvent {
                    peer_id: peer_id.clone(),
                    connection: id,
                    kind: PeerEventKind::RemoteTrack(track),
                });
                Box::pin(async {})
            },
        ));
    }

    async fn sender(&self, sender: SenderId) -> Result<Arc<RTCRtpSender>, TransportError> {
        self.senders
            .lock()
            .await
            .get(sender)
            .cloned()
            .ok_or(TransportError::UnknownSender(sender))
    }
}

#[async_trait]
impl PeerTransport for RtcTransport {
    async fn create_offer(&self) -> Result<SessionDescription, TransportError> {
        from_rtc_description(self.connection.create_offer(None).await?)
    }

    async fn create_answer(&self) -> Result<SessionDescription, TransportError> {
        from_rtc_description(self.connection.create_answer(None).await?)
    }

    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), TransportError> {
        self.connection
            .set_local_description(to_rtc_description(desc)?)
            .await?;
        Ok(())
    }

    async fn local_description(&self) -> Option<SessionDescription> {
        let desc = self.connection.local_description().await?;
        from_rtc_description(desc).ok()
    }

    async fn set_remote_description(
        &self,
        desc: SessionDescription,
    ) -> Result<(), TransportError> {
        self.connection
            .set_remote_description(to_rtc_description(desc)?)
            .await?;
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), TransportError> {
        self.connection.add_ice_candidate(candidate.into()).await?;
        Ok(())
    }

    async fn add_track(
        &self,
        kind: TrackKind,
        track: Option<LocalTrack>,
    ) -> Result<SenderId, TransportError> {
        let sender = match track {
            Some(track) => self.connection.add_track(track.rtp()).await?,
            None => {
                let init = RTCRtpTransceiverInit {
                    direction: RTCRtpTransceiverDirection::Sendrecv,
                    send_encodings: vec![],
                };
                let transceiver = self
                    .connection
                    .add_transceiver_from_kind(kind.into(), Some(init))
                    .await?;
                transceiver.sender().await
            }
        };
        let mut senders = self.senders.lock().await;
        senders.push(sender);
        Ok(senders.len() - 1)
    }

    async fn replace_track(
        &self,
        sender: SenderId,
        track: Option<LocalTrack>,
    ) -> Result<(), TransportError> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }
        let sender = self.sender(sender).await?;
        sender.replace_track(track.map(|t| t.rtp())).await?;
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
            || self.connection.connection_state() == RTCPeerConnectionState::Closed
    }

    async fn close(&self) -> Result<(), TransportError> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        debug!(peer_id = %self.peer_id, "Closing peer connection");
        self.connection.close().await?;
        Ok(())
    }
}
