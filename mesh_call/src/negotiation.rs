use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::{
    error::TransportError,
    message::{IceCandidate, PeerId, SdpType, SessionDescription, SignalPayload},
    peer::{Connection, NegotiationState, PeerTransport},
};

/// One asynchronous unit of work against a transport. At most one step runs
/// per connection at a time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Step {
    CreateOffer,
    AcceptOffer(SessionDescription),
    ApplyAnswer(SessionDescription),
    AddCandidates(Vec<IceCandidate>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepOutput {
    OfferCreated(SessionDescription),
    OfferAccepted {
        remote: SessionDescription,
        answer: SessionDescription,
    },
    AnswerApplied(SessionDescription),
    CandidatesApplied {
        applied: usize,
        failed: usize,
    },
}

impl Step {
    pub async fn run(self, transport: Arc<dyn PeerTransport>) -> Result<StepOutput, TransportError> {
        match self {
            Step::CreateOffer => {
                let offer = transport.create_offer().await?;
                transport.set_local_description(offer.clone()).await?;
                let local = transport.local_description().await.unwrap_or(offer);
                Ok(StepOutput::OfferCreated(local))
            }
            Step::AcceptOffer(remote) => {
                transport.set_remote_description(remote.clone()).await?;
                let answer = transport.create_answer().await?;
                transport.set_local_description(answer.clone()).await?;
                let answer = transport.local_description().await.unwrap_or(answer);
                Ok(StepOutput::OfferAccepted { remote, answer })
            }
            Step::ApplyAnswer(remote) => {
                transport.set_remote_description(remote.clone()).await?;
                Ok(StepOutput::AnswerApplied(remote))
            }
            Step::AddCandidates(candidates) => {
                let mut applied = 0;
                let mut failed = 0;
                for candidate in candidates {
                    match transport.add_ice_candidate(candidate).await {
                        Ok(()) => applied += 1,
                        Err(e) => {
                            warn!(?e, "Ignoring ICE candidate that failed to apply");
                            failed += 1;
                        }
                    }
                }
                Ok(StepOutput::CandidatesApplied { applied, failed })
            }
        }
    }
}

/// What the coordinator has to do next for a connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    /// Run the step in the background and report back with
    /// [`Negotiator::on_complete`].
    Run(Step),
    /// Replace the connection with a fresh one and feed it this offer.
    Restart(SessionDescription),
    Idle,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Progress {
    /// Signal to relay to the remote peer.
    pub outbound: Option<SignalPayload>,
    pub decision: Decision,
}

/// Offer/answer/candidate state machine, one decision at a time.
///
/// The negotiator never touches a transport itself. It inspects and updates a
/// [`Connection`] and hands back [`Step`]s which the caller runs outside the
/// event loop; results come back through [`Negotiator::on_complete`]. While a
/// step is in flight, further signals for the same connection are queued.
#[derive(Debug, Clone)]
pub struct Negotiator {
    local_id: PeerId,
}

impl Negotiator {
    pub fn new(local_id: PeerId) -> Self {
        Self { local_id }
    }

    pub fn local_id(&self) -> &PeerId {
        &self.local_id
    }

    /// Glare rule: on simultaneous offers the peer with the larger id gives
    /// up its own offer and answers the remote one.
    pub fn yields_to(&self, remote: &PeerId) -> bool {
        self.local_id > *remote
    }

    /// Starts the initiator path on a fresh connection.
    pub fn initiate(&self, connection: &mut Connection) -> Decision {
        if connection.state != NegotiationState::New || connection.in_flight {
            return Decision::Idle;
        }
        Self::begin(connection, Step::CreateOffer)
    }

    pub fn on_signal(
        &self,
        connection: &mut Connection,
        from: &PeerId,
        payload: SignalPayload,
    ) -> Decision {
        if connection.is_closed() {
            debug!(%from, "Dropping signal for closed connection");
            return Decision::Idle;
        }
        if connection.in_flight {
            debug!(%from, "Negotiation in flight, queueing signal");
            connection.queued.push_back(payload);
            return Decision::Idle;
        }
        self.dispatch(connection, from, payload)
    }

    /// Applies the result of a finished step and picks the next one.
    ///
    /// An error leaves the connection untouched; the caller closes and removes
    /// it.
    pub fn on_complete(
        &self,
        connection: &mut Connection,
        from: &PeerId,
        result: Result<StepOutput, TransportError>,
    ) -> Result<Progress, TransportError> {
        connection.in_flight = false;
        let output = result?;
        let outbound = match output {
            StepOutput::OfferCreated(offer) => {
                connection.local_description = Some(offer.clone());
                connection.state = NegotiationState::OfferSent;
                info!(peer_id = %from, state = %connection.state, "Offer created");
                Some(SignalPayload::Sdp(offer))
            }
            StepOutput::OfferAccepted { remote, answer } => {
                connection.remote_description = Some(remote);
                connection.local_description = Some(answer.clone());
                connection.state = NegotiationState::Stable;
                info!(peer_id = %from, state = %connection.state, "Answered remote offer");
                Some(SignalPayload::Sdp(answer))
            }
            StepOutput::AnswerApplied(remote) => {
                connection.remote_description = Some(remote);
                connection.state = NegotiationState::Stable;
                info!(peer_id = %from, state = %connection.state, "Remote answer applied");
                None
            }
            StepOutput::CandidatesApplied { applied, failed } => {
                debug!(peer_id = %from, applied, failed, "ICE candidates applied");
                None
            }
        };
        let decision = self.next(connection, from);
        Ok(Progress { outbound, decision })
    }

    fn next(&self, connection: &mut Connection, from: &PeerId) -> Decision {
        if connection.remote_description.is_some() && !connection.pending_ice.is_empty() {
            let candidates = std::mem::take(&mut connection.pending_ice);
            debug!(peer_id = %from, count = candidates.len(), "Flushing buffered ICE candidates");
            return Self::begin(connection, Step::AddCandidates(candidates));
        }
        while let Some(payload) = connection.queued.pop_front() {
            let decision = match payload {
                SignalPayload::Ice(candidate) if connection.remote_description.is_some() => {
                    let mut candidates = vec![candidate];
                    while let Some(SignalPayload::Ice(_)) = connection.queued.front() {
                        if let Some(SignalPayload::Ice(candidate)) = connection.queued.pop_front()
                        {
                            candidates.push(candidate);
                        }
                    }
                    Self::begin(connection, Step::AddCandidates(candidates))
                }
                payload => self.dispatch(connection, from, payload),
            };
            if decision != Decision::Idle {
                return decision;
            }
        }
        Decision::Idle
    }

    fn dispatch(
        &self,
        connection: &mut Connection,
        from: &PeerId,
        payload: SignalPayload,
    ) -> Decision {
        match payload {
            SignalPayload::Sdp(desc) => match desc.kind {
                SdpType::Offer => self.on_offer(connection, from, desc),
                SdpType::Answer => Self::on_answer(connection, from, desc),
            },
            SignalPayload::Ice(candidate) => {
                if connection.remote_description.is_none() {
                    debug!(peer_id = %from, "Buffering ICE candidate until remote description");
                    connection.pending_ice.push(candidate);
                    return Decision::Idle;
                }
                Self::begin(connection, Step::AddCandidates(vec![candidate]))
            }
        }
    }

    fn on_offer(
        &self,
        connection: &mut Connection,
        from: &PeerId,
        offer: SessionDescription,
    ) -> Decision {
        match connection.state {
            NegotiationState::New | NegotiationState::Stable => {
                Self::begin(connection, Step::AcceptOffer(offer))
            }
            NegotiationState::OfferSent | NegotiationState::AnswerPending => {
                if self.yields_to(from) {
                    info!(peer_id = %from, "Offer collision, yielding to remote offer");
                    Decision::Restart(offer)
                } else {
                    info!(peer_id = %from, "Offer collision, keeping local offer");
                    Decision::Idle
                }
            }
            NegotiationState::Closed => Decision::Idle,
        }
    }

    fn on_answer(connection: &mut Connection, from: &PeerId, answer: SessionDescription) -> Decision {
        if connection.state != NegotiationState::OfferSent {
            warn!(peer_id = %from, state = %connection.state, "Dropping unexpected answer");
            return Decision::Idle;
        }
        connection.state = NegotiationState::AnswerPending;
        Self::begin(connection, Step::ApplyAnswer(answer))
    }

    fn begin(connection: &mut Connection, step: Step) -> Decision {
        connection.in_flight = true;
        Decision::Run(step)
    }
}
