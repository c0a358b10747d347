//! In-memory stand-ins for transports, devices, the relay and the history
//! backend.

use std::{
    collections::{HashMap, HashSet},
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc, Mutex, MutexGuard,
    },
};

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::{
    error::{Error, TransportError},
    history::MeetingHistory,
    media::{
        CapturedMedia, LocalTrack, MediaConstraints, MediaDevices, RemoteTrack, TrackKind,
        TrackSource,
    },
    message::{ClientMessage, IceCandidate, MeetingCode, PeerId, SdpType, SessionDescription},
    peer::{
        ConnectionId, PeerEvent, PeerEventKind, PeerEventSender, PeerTransport, SenderId,
        TransportFactory,
    },
    relay::{Relay, RelayConnector, RelayEvent},
};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

#[derive(Debug, Default)]
struct MockState {
    calls: Vec<String>,
    local: Option<SessionDescription>,
    remote: Option<SessionDescription>,
    senders: HashMap<SenderId, Option<String>>,
    next_sender: SenderId,
    candidates: Vec<String>,
    rejected: HashSet<String>,
    fail_set_remote: bool,
    fail_replace: bool,
}

/// Transport that records every call and emits a local candidate after each
/// local description and a remote video track after each remote description.
#[derive(Debug)]
pub struct MockTransport {
    peer_id: PeerId,
    connection: ConnectionId,
    events: Option<PeerEventSender>,
    state: Mutex<MockState>,
    closed: AtomicBool,
}

impl MockTransport {
    pub fn new(
        peer_id: PeerId,
        connection: ConnectionId,
        events: Option<PeerEventSender>,
    ) -> Arc<Self> {
        Arc::new(Self {
            peer_id,
            connection,
            events,
            state: Mutex::new(MockState::default()),
            closed: AtomicBool::new(false),
        })
    }

    /// A transport nobody listens to.
    pub fn detached() -> Arc<Self> {
        Self::new(PeerId::from("detached"), ConnectionId(0), None)
    }

    pub fn connection(&self) -> ConnectionId {
        self.connection
    }

    pub fn fail_set_remote_description(&self) {
        lock(&self.state).fail_set_remote = true;
    }

    pub fn fail_replace_track(&self) {
        lock(&self.state).fail_replace = true;
    }

    pub fn reject_candidate(&self, candidate: &str) {
        lock(&self.state).rejected.insert(candidate.to_string());
    }

    /// Id of the track currently on `sender`.
    pub fn sender_track(&self, sender: SenderId) -> Option<String> {
        lock(&self.state).senders.get(&sender).cloned().flatten()
    }

    pub fn applied_candidates(&self) -> Vec<String> {
        lock(&self.state).candidates.clone()
    }

    pub fn remote(&self) -> Option<SessionDescription> {
        lock(&self.state).remote.clone()
    }

    pub fn calls(&self) -> Vec<String> {
        lock(&self.state).calls.clone()
    }

    pub fn count_calls(&self, prefix: &str) -> usize {
        lock(&self.state)
            .calls
            .iter()
            .filter(|c| c.starts_with(prefix))
            .count()
    }

    fn record(&self, call: String) -> MutexGuard<'_, MockState> {
        let mut state = lock(&self.state);
        state.calls.push(call);
        state
    }

    fn emit(&self, kind: PeerEventKind) {
        if let Some(events) = &self.events {
            let _ = events.send(PeerEvent {
                peer_id: self.peer_id.clone(),
                connection: self.connection,
                kind,
            });
        }
    }

    fn check_open(&self) -> Result<(), TransportError> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }
        Ok(())
    }
}

#[async_trait]
impl PeerTransport for MockTransport {
    async fn create_offer(&self) -> Result<SessionDescription, TransportError> {
        self.check_open()?;
        let state = self.record("create_offer".to_string());
        Ok(SessionDescription::offer(format!(
            "offer {} #{}",
            self.peer_id,
            state.calls.len()
        )))
    }

    async fn create_answer(&self) -> Result<SessionDescription, TransportError> {
        self.check_open()?;
        let state = self.record("create_answer".to_string());
        match &state.remote {
            Some(remote) if remote.kind == SdpType::Offer => Ok(SessionDescription::answer(
                format!("answer {} #{}", self.peer_id, state.calls.len()),
            )),
            _ => Err(TransportError::Other("no remote offer".to_string())),
        }
    }

    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), TransportError> {
        self.check_open()?;
        {
            let mut state = self.record(format!("set_local:{:?}", desc.kind));
            state.local = Some(desc);
        }
        let candidate = IceCandidate {
            candidate: format!("candidate:{}:{}", self.peer_id, self.connection.0),
            sdp_mid: Some("0".to_string()),
            sdp_mline_index: Some(0),
            username_fragment: None,
        };
        self.emit(PeerEventKind::LocalCandidate(candidate));
        Ok(())
    }

    async fn local_description(&self) -> Option<SessionDescription> {
        lock(&self.state).local.clone()
    }

    async fn set_remote_description(
        &self,
        desc: SessionDescription,
    ) -> Result<(), TransportError> {
        self.check_open()?;
        {
            let mut state = self.record(format!("set_remote:{:?}", desc.kind));
            if state.fail_set_remote {
                return Err(TransportError::Other(
                    "rejected remote description".to_string(),
                ));
            }
            state.remote = Some(desc);
        }
        self.emit(PeerEventKind::RemoteTrack(RemoteTrack {
            id: format!("{}-video", self.peer_id),
            stream_id: self.peer_id.to_string(),
            kind: TrackKind::Video,
            rtp: None,
        }));
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), TransportError> {
        self.check_open()?;
        let mut state = self.record(format!("add_ice:{}", candidate.candidate));
        if state.remote.is_none() {
            return Err(TransportError::Other(
                "candidate before remote description".to_string(),
            ));
        }
        if state.rejected.contains(&candidate.candidate) {
            return Err(TransportError::Other("invalid candidate".to_string()));
        }
        state.candidates.push(candidate.candidate);
        Ok(())
    }

    async fn add_track(
        &self,
        kind: TrackKind,
        track: Option<LocalTrack>,
    ) -> Result<SenderId, TransportError> {
        self.check_open()?;
        let mut state = self.record(format!("add_track:{kind:?}"));
        let sender = state.next_sender;
        state.next_sender += 1;
        state
            .senders
            .insert(sender, track.map(|t| t.id().to_string()));
        Ok(sender)
    }

    async fn replace_track(
        &self,
        sender: SenderId,
        track: Option<LocalTrack>,
    ) -> Result<(), TransportError> {
        self.check_open()?;
        let mut state = self.record(format!("replace_track:{sender}"));
        if state.fail_replace {
            return Err(TransportError::Other("replace_track failed".to_string()));
        }
        state
            .senders
            .insert(sender, track.map(|t| t.id().to_string()));
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    async fn close(&self) -> Result<(), TransportError> {
        if !self.closed.swap(true, Ordering::AcqRel) {
            drop(self.record("close".to_string()));
        }
        Ok(())
    }
}

/// Hands out [`MockTransport`]s and keeps them for inspection.
#[derive(Debug, Default)]
pub struct MockTransportFactory {
    transports: Mutex<HashMap<PeerId, Vec<Arc<MockTransport>>>>,
    failing_remote: Mutex<HashSet<PeerId>>,
}

impl MockTransportFactory {
    /// Transports created for `peer_id` from now on reject remote descriptions.
    pub fn fail_set_remote_for(&self, peer_id: &PeerId) {
        lock(&self.failing_remote).insert(peer_id.clone());
    }

    pub fn latest(&self, peer_id: &PeerId) -> Option<Arc<MockTransport>> {
        lock(&self.transports)
            .get(peer_id)
            .and_then(|t| t.last().cloned())
    }

    pub fn all(&self, peer_id: &PeerId) -> Vec<Arc<MockTransport>> {
        lock(&self.transports)
            .get(peer_id)
            .cloned()
            .unwrap_or_default()
    }

    pub fn created(&self, peer_id: &PeerId) -> usize {
        lock(&self.transports).get(peer_id).map_or(0, Vec::len)
    }
}

#[async_trait]
impl TransportFactory for MockTransportFactory {
    async fn create(
        &self,
        peer_id: &PeerId,
        connection: ConnectionId,
        events: PeerEventSender,
    ) -> Result<Arc<dyn PeerTransport>, TransportError> {
        let transport = MockTransport::new(peer_id.clone(), connection, Some(events));
        if lock(&self.failing_remote).contains(peer_id) {
            transport.fail_set_remote_description();
        }
        lock(&self.transports)
            .entry(peer_id.clone())
            .or_default()
            .push(transport.clone());
        Ok(transport)
    }
}

/// Devices that hand out fresh tracks, or refuse.
#[derive(Debug, Default)]
pub struct MockDevices {
    deny_user_media: bool,
    deny_display: bool,
    captures: AtomicUsize,
}

impl MockDevices {
    pub fn denying() -> Self {
        Self {
            deny_user_media: true,
            ..Default::default()
        }
    }

    pub fn denying_display() -> Self {
        Self {
            deny_display: true,
            ..Default::default()
        }
    }

    pub fn captures(&self) -> usize {
        self.captures.load(Ordering::Acquire)
    }
}

#[async_trait]
impl MediaDevices for MockDevices {
    async fn user_media(&self, constraints: MediaConstraints) -> Result<CapturedMedia, Error> {
        if self.deny_user_media {
            return Err(Error::PermissionDenied("user media".to_string()));
        }
        self.captures.fetch_add(1, Ordering::AcqRel);
        Ok(CapturedMedia {
            audio: constraints
                .audio
                .then(|| LocalTrack::new(TrackSource::Microphone, "local")),
            video: constraints
                .video
                .then(|| LocalTrack::new(TrackSource::Camera, "local")),
        })
    }

    async fn display_media(&self) -> Result<LocalTrack, Error> {
        if self.deny_display {
            return Err(Error::PermissionDenied("display".to_string()));
        }
        self.captures.fetch_add(1, Ordering::AcqRel);
        Ok(LocalTrack::new(TrackSource::Screen, "local"))
    }
}

/// Relay driven by a test through [`RelayScript`].
pub fn scripted_relay(local_id: &str) -> (ScriptedConnector, RelayScript) {
    let (event_tx, event_rx) = mpsc::unbounded_channel();
    let (sent_tx, sent_rx) = mpsc::unbounded_channel();
    let disconnected = Arc::new(AtomicBool::new(false));
    let connector = ScriptedConnector {
        id: PeerId::from(local_id),
        relay: ScriptedRelay {
            events: event_rx,
            sent: sent_tx,
            disconnected: disconnected.clone(),
        },
    };
    let script = RelayScript {
        events: event_tx,
        sent: sent_rx,
        disconnected,
    };
    (connector, script)
}

pub struct ScriptedConnector {
    id: PeerId,
    relay: ScriptedRelay,
}

#[async_trait(?Send)]
impl RelayConnector for ScriptedConnector {
    type Relay = ScriptedRelay;

    async fn connect(
        mut self,
        code: &MeetingCode,
        display_name: &str,
    ) -> Result<(ScriptedRelay, PeerId), Error> {
        self.relay
            .send(ClientMessage::Join {
                room: code.to_string(),
                display_name: display_name.to_string(),
            })
            .await?;
        Ok((self.relay, self.id))
    }
}

pub struct ScriptedRelay {
    events: mpsc::UnboundedReceiver<RelayEvent>,
    sent: mpsc::UnboundedSender<ClientMessage>,
    disconnected: Arc<AtomicBool>,
}

#[async_trait(?Send)]
impl Relay for ScriptedRelay {
    async fn send(&mut self, msg: ClientMessage) -> Result<(), Error> {
        if self.disconnected.load(Ordering::Acquire) {
            return Err(Error::RelayDisconnected);
        }
        self.sent.send(msg).map_err(|_| Error::RelayDisconnected)
    }

    async fn next_event(&mut self) -> RelayEvent {
        self.events
            .recv()
            .await
            .unwrap_or(RelayEvent::ConnectionLost)
    }

    async fn disconnect(&mut self) {
        self.disconnected.store(true, Ordering::Release);
    }
}

/// Test side of a scripted relay.
pub struct RelayScript {
    events: mpsc::UnboundedSender<RelayEvent>,
    sent: mpsc::UnboundedReceiver<ClientMessage>,
    disconnected: Arc<AtomicBool>,
}

impl RelayScript {
    pub fn push(&self, event: RelayEvent) {
        let _ = self.events.send(event);
    }

    pub fn joined(&self, id: &str, display_name: &str, peers: &[&str]) {
        self.push(RelayEvent::PeerJoined {
            id: PeerId::from(id),
            display_name: display_name.to_string(),
            peers: peers.iter().copied().map(PeerId::from).collect(),
        });
    }

    pub fn left(&self, id: &str) {
        self.push(RelayEvent::PeerLeft {
            id: PeerId::from(id),
        });
    }

    pub fn signal(&self, from: &str, payload: &str) {
        self.push(RelayEvent::Signal {
            from: PeerId::from(from),
            payload: payload.to_string(),
        });
    }

    pub fn lose_connection(&self) {
        self.push(RelayEvent::ConnectionLost);
    }

    /// Everything sent so far.
    pub fn drain_sent(&mut self) -> Vec<ClientMessage> {
        std::iter::from_fn(|| self.sent.try_recv().ok()).collect()
    }

    pub fn is_disconnected(&self) -> bool {
        self.disconnected.load(Ordering::Acquire)
    }
}

#[derive(Debug)]
struct Member {
    room: String,
    display_name: String,
    tx: mpsc::UnboundedSender<RelayEvent>,
}

#[derive(Debug, Default)]
struct HubState {
    rooms: HashMap<String, Vec<PeerId>>,
    members: HashMap<PeerId, Member>,
}

impl HubState {
    fn broadcast(&self, room: &str, event: RelayEvent) {
        for id in self.rooms.get(room).into_iter().flatten() {
            if let Some(member) = self.members.get(id) {
                let _ = member.tx.send(event.clone());
            }
        }
    }

    fn leave(&mut self, id: &PeerId) {
        let Some(member) = self.members.remove(id) else {
            return;
        };
        if let Some(room) = self.rooms.get_mut(&member.room) {
            room.retain(|m| m != id);
            if room.is_empty() {
                self.rooms.remove(&member.room);
            }
        }
        self.broadcast(&member.room, RelayEvent::PeerLeft { id: id.clone() });
    }
}

/// In-process relay with the same room semantics as the relay server.
#[derive(Debug, Clone, Default)]
pub struct MemoryHub {
    state: Arc<Mutex<HubState>>,
}

impl MemoryHub {
    /// Connector that will be assigned `id`.
    pub fn connector(&self, id: &str) -> MemoryConnector {
        MemoryConnector {
            hub: self.clone(),
            id: PeerId::from(id),
        }
    }

    pub fn members(&self, room: &str) -> Vec<PeerId> {
        lock(&self.state)
            .rooms
            .get(room)
            .cloned()
            .unwrap_or_default()
    }

    /// Drops the socket of `id`: the others see it leave and `id` sees the
    /// connection go away.
    pub fn drop_connection(&self, id: &PeerId) {
        lock(&self.state).leave(id);
    }
}

pub struct MemoryConnector {
    hub: MemoryHub,
    id: PeerId,
}

#[async_trait(?Send)]
impl RelayConnector for MemoryConnector {
    type Relay = MemoryRelay;

    async fn connect(
        self,
        code: &MeetingCode,
        display_name: &str,
    ) -> Result<(MemoryRelay, PeerId), Error> {
        let (tx, rx) = mpsc::unbounded_channel();
        {
            let mut state = lock(&self.hub.state);
            if state.members.contains_key(&self.id) {
                return Err(Error::Relay(format!("{} is already connected", self.id)));
            }
            let room = code.to_string();
            state.members.insert(
                self.id.clone(),
                Member {
                    room: room.clone(),
                    display_name: display_name.to_string(),
                    tx,
                },
            );
            let peers = {
                let members = state.rooms.entry(room.clone()).or_default();
                members.push(self.id.clone());
                members.clone()
            };
            state.broadcast(
                &room,
                RelayEvent::PeerJoined {
                    id: self.id.clone(),
                    display_name: display_name.to_string(),
                    peers,
                },
            );
        }
        let relay = MemoryRelay {
            hub: self.hub,
            id: self.id.clone(),
            events: rx,
        };
        Ok((relay, self.id))
    }
}

pub struct MemoryRelay {
    hub: MemoryHub,
    id: PeerId,
    events: mpsc::UnboundedReceiver<RelayEvent>,
}

#[async_trait(?Send)]
impl Relay for MemoryRelay {
    async fn send(&mut self, msg: ClientMessage) -> Result<(), Error> {
        let state = lock(&self.hub.state);
        let Some(member) = state.members.get(&self.id) else {
            return Err(Error::RelayDisconnected);
        };
        match msg {
            ClientMessage::Join { .. } => {
                return Err(Error::Relay("already joined".to_string()));
            }
            ClientMessage::Signal { target, payload } => {
                if let Some(to) = state.members.get(&target) {
                    if to.room == member.room {
                        let _ = to.tx.send(RelayEvent::Signal {
                            from: self.id.clone(),
                            payload,
                        });
                    }
                }
            }
            ClientMessage::Chat { text } => state.broadcast(
                &member.room,
                RelayEvent::Chat {
                    sender: member.display_name.clone(),
                    text,
                },
            ),
        }
        Ok(())
    }

    async fn next_event(&mut self) -> RelayEvent {
        self.events
            .recv()
            .await
            .unwrap_or(RelayEvent::ConnectionLost)
    }

    async fn disconnect(&mut self) {
        lock(&self.hub.state).leave(&self.id);
    }
}

/// Remembers every visit.
#[derive(Debug, Default)]
pub struct RecordingHistory {
    visits: Mutex<Vec<MeetingCode>>,
}

impl RecordingHistory {
    pub fn visits(&self) -> Vec<MeetingCode> {
        lock(&self.visits).clone()
    }
}

#[async_trait(?Send)]
impl MeetingHistory for RecordingHistory {
    async fn record_visit(&self, code: &MeetingCode) -> anyhow::Result<()> {
        lock(&self.visits).push(code.clone());
        Ok(())
    }
}

/// Backend that is always down.
#[derive(Debug, Default)]
pub struct FailingHistory;

#[async_trait(?Send)]
impl MeetingHistory for FailingHistory {
    async fn record_visit(&self, _code: &MeetingCode) -> anyhow::Result<()> {
        Err(anyhow::anyhow!("history backend unavailable"))
    }
}
