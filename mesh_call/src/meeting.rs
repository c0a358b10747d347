use std::{collections::BTreeMap, sync::Arc};

use futures_util::{
    future::LocalBoxFuture,
    stream::{FuturesUnordered, StreamExt},
    FutureExt,
};
use tokio::{
    select,
    sync::{mpsc, oneshot, watch},
};
use tracing::{debug, error, info, warn};

use crate::{
    error::{Error, TransportError},
    history::{self, MeetingHistory},
    media::{
        replace_track_everywhere, LocalTrack, MediaConstraints, MediaController, MediaDevices,
        RemoteStream, ReplaceReport, ReplaceTarget, TrackKind, VideoToggle,
    },
    message::{ChatMessage, ClientMessage, MeetingCode, PeerId, SignalPayload},
    negotiation::{Decision, Negotiator, Step, StepOutput},
    peer::{ConnectionId, NegotiationState, PeerEvent, PeerEventKind, TransportFactory},
    registry::Registry,
    relay::{Relay, RelayConnector, RelayEvent},
};

type MediaReply = oneshot::Sender<Result<ReplaceReport, Error>>;

enum Command {
    ToggleAudio(oneshot::Sender<bool>),
    ToggleVideo(MediaReply),
    StartScreenShare(MediaReply),
    StopScreenShare(MediaReply),
    SendChat(String, oneshot::Sender<Result<(), Error>>),
    Leave(oneshot::Sender<()>),
}

/// Result of background work, fed back into the event loop.
enum Completion {
    Negotiation {
        peer_id: PeerId,
        connection: ConnectionId,
        result: Result<StepOutput, TransportError>,
    },
    CameraAcquired {
        result: Result<LocalTrack, Error>,
        reply: MediaReply,
    },
    ScreenAcquired {
        result: Result<LocalTrack, Error>,
        reply: MediaReply,
    },
    TracksReplaced {
        report: ReplaceReport,
        reply: Option<MediaReply>,
    },
    ScreenEnded {
        track_id: String,
    },
}

enum MeetingEvent {
    Relay(RelayEvent),
    Command(Command),
    HandlesDropped,
    Peer(PeerEvent),
    Completed(Completion),
}

/// What a UI renders.
#[derive(Debug, Clone)]
pub struct MeetingView {
    pub meeting_code: MeetingCode,
    pub local_id: PeerId,
    pub local_preview: Option<LocalTrack>,
    pub audio_enabled: bool,
    pub video_enabled: bool,
    pub screen_sharing: bool,
    pub peers: BTreeMap<PeerId, PeerView>,
    pub messages: Vec<ChatMessage>,
    pub active: bool,
}

#[derive(Debug, Clone)]
pub struct PeerView {
    pub display_name: String,
    pub state: NegotiationState,
    pub stream: Option<RemoteStream>,
}

impl MeetingView {
    fn new(meeting_code: MeetingCode, local_id: PeerId) -> Self {
        Self {
            meeting_code,
            local_id,
            local_preview: None,
            audio_enabled: false,
            video_enabled: false,
            screen_sharing: false,
            peers: BTreeMap::new(),
            messages: Vec::new(),
            active: false,
        }
    }

    /// Peers whose remote stream currently carries video.
    pub fn peers_with_video(&self) -> Vec<&PeerId> {
        self.peers
            .iter()
            .filter(|(_, p)| p.stream.as_ref().map_or(false, RemoteStream::has_video))
            .map(|(id, _)| id)
            .collect()
    }

    pub fn peer_state(&self, peer_id: &PeerId) -> Option<NegotiationState> {
        self.peers.get(peer_id).map(|p| p.state)
    }
}

/// Joins a meeting.
pub struct MeetingBuilder {
    code: Option<MeetingCode>,
    display_name: String,
    constraints: MediaConstraints,
    devices: Arc<dyn MediaDevices>,
    transports: Arc<dyn TransportFactory>,
    history: Option<Arc<dyn MeetingHistory>>,
}

impl MeetingBuilder {
    pub fn new<S: AsRef<str>>(
        display_name: S,
        devices: Arc<dyn MediaDevices>,
        transports: Arc<dyn TransportFactory>,
    ) -> Self {
        Self {
            code: None,
            display_name: display_name.as_ref().to_string(),
            constraints: MediaConstraints::default(),
            devices,
            transports,
            history: None,
        }
    }

    /// Room to join. A fresh code is generated when none is given.
    pub fn code(mut self, code: MeetingCode) -> Self {
        self.code = Some(code);
        self
    }

    pub fn constraints(mut self, constraints: MediaConstraints) -> Self {
        self.constraints = constraints;
        self
    }

    pub fn history(mut self, history: Arc<dyn MeetingHistory>) -> Self {
        self.history = Some(history);
        self
    }

    /// Acquires local media, records the visit in the background and joins
    /// the room through `connector`.
    pub async fn join<C: RelayConnector>(
        self,
        connector: C,
    ) -> Result<(Meeting<C::Relay>, MeetingHandle), Error> {
        let display_name = self.display_name.trim().to_string();
        if display_name.is_empty() {
            return Err(Error::EmptyDisplayName);
        }
        let code = self.code.unwrap_or_else(MeetingCode::generate);

        let mut media = MediaController::new(self.devices, self.constraints);
        media.acquire_local_media().await?;

        if let Some(history) = self.history {
            history::record_in_background(history, code.clone());
        }

        let (relay, local_id) = match connector.connect(&code, &display_name).await {
            Ok(connected) => connected,
            Err(e) => {
                media.stop_all();
                return Err(e);
            }
        };
        info!(%code, %local_id, %display_name, "Joined meeting");

        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (peer_tx, peer_rx) = mpsc::unbounded_channel();
        let (view_tx, view_rx) = watch::channel(MeetingView::new(code.clone(), local_id.clone()));
        let meeting = Meeting {
            code,
            local_id: local_id.clone(),
            relay,
            registry: Registry::new(self.transports, peer_tx),
            negotiator: Negotiator::new(local_id),
            media,
            commands: command_rx,
            peer_events: peer_rx,
            pending: FuturesUnordered::new(),
            messages: Vec::new(),
            view: view_tx,
            active: true,
        };
        meeting.publish();
        let handle = MeetingHandle {
            commands: command_tx,
            view: view_rx,
        };
        Ok((meeting, handle))
    }

    /// Joins and runs the session on the current actix system.
    pub async fn start<C>(
        self,
        connector: C,
    ) -> Result<(MeetingHandle, actix_rt::task::JoinHandle<Result<(), Error>>), Error>
    where
        C: RelayConnector,
        C::Relay: 'static,
    {
        let (meeting, handle) = self.join(connector).await?;
        Ok((handle, actix_rt::spawn(meeting.run())))
    }
}

/// The per-session event loop.
///
/// Every relay event, UI command, transport event and finished background
/// step is processed here, one at a time. Negotiation steps and media
/// captures run as futures owned by the loop; their results come back as
/// completions and are dropped when the connection they belong to is gone.
pub struct Meeting<R> {
    code: MeetingCode,
    local_id: PeerId,
    relay: R,
    registry: Registry,
    negotiator: Negotiator,
    media: MediaController,
    commands: mpsc::UnboundedReceiver<Command>,
    peer_events: mpsc::UnboundedReceiver<PeerEvent>,
    pending: FuturesUnordered<LocalBoxFuture<'static, Completion>>,
    messages: Vec<ChatMessage>,
    view: watch::Sender<MeetingView>,
    active: bool,
}

impl<R: Relay> Meeting<R> {
    pub fn local_id(&self) -> &PeerId {
        &self.local_id
    }

    pub fn code(&self) -> &MeetingCode {
        &self.code
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Runs until the session is left. Losing the relay tears the session down
    /// and returns [`Error::RelayDisconnected`].
    pub async fn run(mut self) -> Result<(), Error> {
        while self.active {
            let event = select! {
                event = self.relay.next_event() => MeetingEvent::Relay(event),
                command = self.commands.recv() => match command {
                    Some(command) => MeetingEvent::Command(command),
                    None => MeetingEvent::HandlesDropped,
                },
                Some(event) = self.peer_events.recv() => MeetingEvent::Peer(event),
                Some(done) = self.pending.next() => MeetingEvent::Completed(done),
            };
            let result = self.handle(event).await;
            self.publish();
            result?;
        }
        Ok(())
    }

    async fn handle(&mut self, event: MeetingEvent) -> Result<(), Error> {
        match event {
            MeetingEvent::Relay(event) => return self.on_relay(event).await,
            MeetingEvent::Command(command) => self.on_command(command).await,
            MeetingEvent::HandlesDropped => {
                info!("All meeting handles dropped, leaving");
                self.shutdown().await;
            }
            MeetingEvent::Peer(event) => self.on_peer_event(event).await,
            MeetingEvent::Completed(done) => self.on_completion(done).await,
        }
        Ok(())
    }

    async fn on_relay(&mut self, event: RelayEvent) -> Result<(), Error> {
        match event {
            RelayEvent::PeerJoined {
                id,
                display_name,
                peers,
            } => self.on_peer_joined(id, display_name, peers).await,
            RelayEvent::PeerLeft { id } => {
                if self.registry.remove(&id).is_none() {
                    debug!(peer_id = %id, "Leave for unknown peer");
                }
            }
            RelayEvent::Signal { from, payload } => self.on_signal(from, &payload).await,
            RelayEvent::Chat { sender, text } => {
                info!(%sender, %text, "Chat");
                self.messages.push(ChatMessage { sender, text });
            }
            RelayEvent::ConnectionLost => {
                error!(code = %self.code, "Relay connection lost");
                self.shutdown().await;
                return Err(Error::RelayDisconnected);
            }
        }
        Ok(())
    }

    async fn on_peer_joined(&mut self, id: PeerId, display_name: String, peers: Vec<PeerId>) {
        let latecomer = id == self.local_id;
        if !latecomer {
            info!(peer_id = %id, %display_name, "Peer joined");
            self.ensure_peer(&id, &display_name).await;
        }
        for known in peers {
            if known == self.local_id || known == id || self.registry.contains(&known) {
                continue;
            }
            self.ensure_peer(&known, "").await;
            if latecomer {
                let decision = match self.registry.get_mut(&known) {
                    Some(peer) => self.negotiator.initiate(peer.connection_mut()),
                    None => Decision::Idle,
                };
                self.drive(&known, decision).await;
            }
        }
    }

    async fn ensure_peer(&mut self, peer_id: &PeerId, display_name: &str) -> bool {
        let outbound = self.media.outbound();
        let created = self
            .registry
            .get_or_create(peer_id, display_name, &outbound)
            .await
            .map(|_| ());
        if let Err(source) = created {
            self.fail_peer(peer_id, source);
            return false;
        }
        true
    }

    async fn on_signal(&mut self, from: PeerId, payload: &str) {
        let payload = match SignalPayload::parse(payload) {
            Ok(payload) => payload,
            Err(e) => {
                warn!(peer_id = %from, ?e, "Dropping malformed signal");
                return;
            }
        };
        if !self.ensure_peer(&from, "").await {
            return;
        }
        let decision = match self.registry.get_mut(&from) {
            Some(peer) => self
                .negotiator
                .on_signal(peer.connection_mut(), &from, payload),
            None => Decision::Idle,
        };
        self.drive(&from, decision).await;
    }

    /// Carries out a negotiator decision. Restarts are resolved here so the
    /// replacement connection picks up the remote offer straight away.
    async fn drive(&mut self, peer_id: &PeerId, mut decision: Decision) {
        loop {
            match decision {
                Decision::Idle => return,
                Decision::Run(step) => {
                    self.schedule(peer_id, step);
                    return;
                }
                Decision::Restart(offer) => {
                    let outbound = self.media.outbound();
                    let next = self
                        .registry
                        .reconnect(peer_id, &outbound)
                        .await
                        .map(|peer| {
                            self.negotiator.on_signal(
                                peer.connection_mut(),
                                peer_id,
                                SignalPayload::Sdp(offer),
                            )
                        });
                    match next {
                        Ok(next) => decision = next,
                        Err(source) => {
                            self.fail_peer(peer_id, source);
                            return;
                        }
                    }
                }
            }
        }
    }

    fn schedule(&mut self, peer_id: &PeerId, step: Step) {
        let Some(peer) = self.registry.get(peer_id) else {
            return;
        };
        let connection = peer.connection().id();
        let transport = peer.connection().transport().clone();
        let peer_id = peer_id.clone();
        debug!(%peer_id, ?step, "Scheduling negotiation step");
        self.pending.push(
            async move {
                let result = step.run(transport).await;
                Completion::Negotiation {
                    peer_id,
                    connection,
                    result,
                }
            }
            .boxed_local(),
        );
    }

    fn fail_peer(&mut self, peer_id: &PeerId, source: TransportError) {
        let e = Error::NegotiationFailed {
            peer_id: peer_id.clone(),
            source,
        };
        warn!(error = ?e, "Dropping peer after failed negotiation");
        self.registry.remove(peer_id);
    }

    async fn send_signal(&mut self, target: &PeerId, payload: SignalPayload) {
        let payload = match payload.to_json() {
            Ok(payload) => payload,
            Err(e) => {
                warn!(peer_id = %target, ?e, "Could not encode signal");
                return;
            }
        };
        let msg = ClientMessage::Signal {
            target: target.clone(),
            payload,
        };
        if let Err(e) = self.relay.send(msg).await {
            warn!(peer_id = %target, ?e, "Could not send signal");
        }
    }

    async fn on_peer_event(&mut self, event: PeerEvent) {
        let Some(peer) = self.registry.get_mut(&event.peer_id) else {
            debug!(peer_id = %event.peer_id, "Event for unknown peer");
            return;
        };
        if peer.connection().id() != event.connection || peer.connection().is_closed() {
            debug!(peer_id = %event.peer_id, "Discarding stale transport event");
            return;
        }
        match event.kind {
            PeerEventKind::LocalCandidate(candidate) => {
                self.send_signal(&event.peer_id, SignalPayload::Ice(candidate))
                    .await
            }
            PeerEventKind::RemoteTrack(track) => peer.attach_remote_track(track),
        }
    }

    async fn on_completion(&mut self, done: Completion) {
        match done {
            Completion::Negotiation {
                peer_id,
                connection,
                result,
            } => {
                let Some(peer) = self.registry.get_mut(&peer_id) else {
                    debug!(%peer_id, "Discarding result for removed peer");
                    return;
                };
                if peer.connection().id() != connection || peer.connection().is_closed() {
                    debug!(%peer_id, "Discarding result for replaced connection");
                    return;
                }
                match self
                    .negotiator
                    .on_complete(peer.connection_mut(), &peer_id, result)
                {
                    Ok(progress) => {
                        if let Some(payload) = progress.outbound {
                            self.send_signal(&peer_id, payload).await;
                        }
                        self.drive(&peer_id, progress.decision).await;
                    }
                    Err(source) => self.fail_peer(&peer_id, source),
                }
            }
            Completion::CameraAcquired { result, reply } => {
                match self.media.install_camera(result) {
                    Ok(Some(track)) => self.replace_video(Some(track), Some(reply)),
                    Ok(None) => {
                        let _ = reply.send(Ok(ReplaceReport::default()));
                    }
                    Err(e) => {
                        let _ = reply.send(Err(e));
                    }
                }
            }
            Completion::ScreenAcquired { result, reply } => match self.media.install_screen(result) {
                Ok(track) => {
                    self.watch_screen(track.clone());
                    self.replace_video(Some(track), Some(reply));
                }
                Err(e) => {
                    let _ = reply.send(Err(e));
                }
            },
            Completion::TracksReplaced { report, reply } => {
                info!(
                    replaced = report.replaced.len(),
                    skipped = report.skipped.len(),
                    failed = report.failed.len(),
                    "Video sender update finished"
                );
                if let Some(reply) = reply {
                    let _ = reply.send(Ok(report));
                }
            }
            Completion::ScreenEnded { track_id } => {
                if let Some(camera) = self.media.end_screen_share(Some(&track_id)) {
                    info!(track = %track_id, "Screen share ended by the capture source");
                    self.replace_video(camera, None);
                }
            }
        }
    }

    fn watch_screen(&mut self, track: LocalTrack) {
        self.pending.push(
            async move {
                track.ended().await;
                Completion::ScreenEnded {
                    track_id: track.id().to_string(),
                }
            }
            .boxed_local(),
        );
    }

    /// Points the video sender of every live connection at `track`.
    fn replace_video(&mut self, track: Option<LocalTrack>, reply: Option<MediaReply>) {
        let targets: Vec<ReplaceTarget> = self
            .registry
            .all()
            .filter(|(_, peer)| !peer.connection().is_closed())
            .filter_map(|(peer_id, peer)| {
                Some(ReplaceTarget {
                    peer_id: peer_id.clone(),
                    transport: peer.connection().transport().clone(),
                    sender: peer.connection().sender(TrackKind::Video)?,
                })
            })
            .collect();
        debug!(
            targets = targets.len(),
            track = ?track.as_ref().map(LocalTrack::id),
            "Replacing video track"
        );
        self.pending.push(
            async move {
                let report = replace_track_everywhere(targets, track).await;
                Completion::TracksReplaced { report, reply }
            }
            .boxed_local(),
        );
    }

    async fn on_command(&mut self, command: Command) {
        match command {
            Command::ToggleAudio(reply) => {
                let _ = reply.send(self.media.toggle_audio());
            }
            Command::ToggleVideo(reply) => match self.media.toggle_video() {
                Ok(VideoToggle::Stopped) if self.media.state().is_screen_sharing() => {
                    let _ = reply.send(Ok(ReplaceReport::default()));
                }
                Ok(VideoToggle::Stopped) => self.replace_video(None, Some(reply)),
                Ok(VideoToggle::Acquire(capture)) => self.pending.push(
                    async move {
                        let result = capture.await;
                        Completion::CameraAcquired { result, reply }
                    }
                    .boxed_local(),
                ),
                Err(e) => {
                    let _ = reply.send(Err(e));
                }
            },
            Command::StartScreenShare(reply) => match self.media.capture_screen() {
                Ok(capture) => self.pending.push(
                    async move {
                        let result = capture.await;
                        Completion::ScreenAcquired { result, reply }
                    }
                    .boxed_local(),
                ),
                Err(e) => {
                    let _ = reply.send(Err(e));
                }
            },
            Command::StopScreenShare(reply) => match self.media.stop_screen_share() {
                Ok(Some(camera)) => self.replace_video(camera, Some(reply)),
                Ok(None) => {
                    let _ = reply.send(Ok(ReplaceReport::default()));
                }
                Err(e) => {
                    let _ = reply.send(Err(e));
                }
            },
            Command::SendChat(text, reply) => {
                let result = self.relay.send(ClientMessage::Chat { text }).await;
                let _ = reply.send(result);
            }
            Command::Leave(reply) => {
                self.shutdown().await;
                let _ = reply.send(());
            }
        }
    }

    /// Stops local media, closes every connection and leaves the relay. Safe
    /// to call more than once.
    async fn shutdown(&mut self) {
        if !self.active {
            return;
        }
        self.active = false;
        self.media.stop_all();
        self.registry.clear();
        self.pending = FuturesUnordered::new();
        self.relay.disconnect().await;
        info!(code = %self.code, "Left meeting");
    }

    fn snapshot(&self) -> MeetingView {
        let state = self.media.state();
        MeetingView {
            meeting_code: self.code.clone(),
            local_id: self.local_id.clone(),
            local_preview: state.outbound_video(),
            audio_enabled: state.audio_enabled(),
            video_enabled: state.video_enabled(),
            screen_sharing: state.is_screen_sharing(),
            peers: self
                .registry
                .all()
                .map(|(id, peer)| {
                    (
                        id.clone(),
                        PeerView {
                            display_name: peer.display_name().clone(),
                            state: peer.connection().state(),
                            stream: peer.remote_stream().clone(),
                        },
                    )
                })
                .collect(),
            messages: self.messages.clone(),
            active: self.active,
        }
    }

    fn publish(&self) {
        self.view.send_replace(self.snapshot());
    }
}

/// Cloneable control surface of a running meeting.
#[derive(Debug, Clone)]
pub struct MeetingHandle {
    commands: mpsc::UnboundedSender<Command>,
    view: watch::Receiver<MeetingView>,
}

impl std::fmt::Debug for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Command::ToggleAudio(_) => "ToggleAudio",
            Command::ToggleVideo(_) => "ToggleVideo",
            Command::StartScreenShare(_) => "StartScreenShare",
            Command::StopScreenShare(_) => "StopScreenShare",
            Command::SendChat(..) => "SendChat",
            Command::Leave(_) => "Leave",
        };
        f.write_str(name)
    }
}

impl MeetingHandle {
    async fn request<T>(
        &self,
        command: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> Result<T, Error> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(command(tx))
            .map_err(|_| Error::MeetingEnded)?;
        rx.await.map_err(|_| Error::MeetingEnded)
    }

    pub fn view(&self) -> MeetingView {
        self.view.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<MeetingView> {
        self.view.clone()
    }

    /// Waits until the published view satisfies `f`. Returns `None` once the
    /// event loop is gone.
    pub async fn wait_for<F>(&self, f: F) -> Option<MeetingView>
    where
        F: FnMut(&MeetingView) -> bool,
    {
        let mut view = self.view.clone();
        let result = view.wait_for(f).await.ok().map(|v| v.clone());
        result
    }

    pub fn is_active(&self) -> bool {
        self.view.borrow().active
    }

    /// Returns whether the microphone is now enabled.
    pub async fn toggle_audio(&self) -> Result<bool, Error> {
        self.request(Command::ToggleAudio).await
    }

    pub async fn toggle_video(&self) -> Result<ReplaceReport, Error> {
        self.request(Command::ToggleVideo).await?
    }

    pub async fn start_screen_share(&self) -> Result<ReplaceReport, Error> {
        self.request(Command::StartScreenShare).await?
    }

    pub async fn stop_screen_share(&self) -> Result<ReplaceReport, Error> {
        self.request(Command::StopScreenShare).await?
    }

    pub async fn send_chat<S: Into<String>>(&self, text: S) -> Result<(), Error> {
        let text = text.into();
        self.request(|reply| Command::SendChat(text, reply)).await?
    }

    /// Leaves the meeting. Leaving an ended meeting is a no-op.
    pub async fn leave(&self) {
        if self.request(Command::Leave).await.is_err() {
            debug!("Meeting already ended");
        }
    }
}
