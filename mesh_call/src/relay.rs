use async_trait::async_trait;
pub use awc::ws;
use awc::{ws::Codec, BoxedSocket};
use futures_util::{SinkExt, StreamExt};
use tracing::{debug, info, warn};

use crate::{
    error::Error,
    message::{ClientMessage, MeetingCode, PeerId, ServerMessage},
};

/// Room events as seen by one session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayEvent {
    PeerJoined {
        id: PeerId,
        display_name: String,
        peers: Vec<PeerId>,
    },
    PeerLeft {
        id: PeerId,
    },
    Signal {
        from: PeerId,
        payload: String,
    },
    Chat {
        sender: String,
        text: String,
    },
    ConnectionLost,
}

/// An open relay connection bound to one room.
#[async_trait(?Send)]
pub trait Relay {
    async fn send(&mut self, msg: ClientMessage) -> Result<(), Error>;

    /// Waits for the next room event. Once the connection is gone this keeps
    /// returning [`RelayEvent::ConnectionLost`].
    async fn next_event(&mut self) -> RelayEvent;

    async fn disconnect(&mut self);
}

/// Opens the single relay connection of a session.
#[async_trait(?Send)]
pub trait RelayConnector {
    type Relay: Relay;

    /// Connects, joins `code` and returns the relay-assigned local identity.
    async fn connect(
        self,
        code: &MeetingCode,
        display_name: &str,
    ) -> Result<(Self::Relay, PeerId), Error>;
}

/// Relay reached over an awc WebSocket.
pub struct WsConnector {
    url: String,
}

impl WsConnector {
    pub fn new<S: Into<String>>(url: S) -> Self {
        Self { url: url.into() }
    }
}

#[async_trait(?Send)]
impl RelayConnector for WsConnector {
    type Relay = WsRelay;

    async fn connect(
        self,
        code: &MeetingCode,
        display_name: &str,
    ) -> Result<(WsRelay, PeerId), Error> {
        let (_res, mut ws) = awc::Client::new()
            .ws(&self.url)
            .connect()
            .await
            .map_err(|e| Error::Relay(format!("Client error: {}", e)))?;

        let id = match ws.next().await {
            Some(Ok(ws::Frame::Text(msg))) => match serde_json::from_slice(&msg) {
                Ok(ServerMessage::Welcome { id }) => id,
                Ok(other) => {
                    return Err(Error::Relay(format!(
                        "First message must be Welcome, got {other:?}"
                    )))
                }
                Err(e) => return Err(Error::Relay(e.to_string())),
            },
            _ => return Err(Error::Relay("Error with Ws connection!".to_string())),
        };
        info!(%id, url = %self.url, "Connected to relay");

        let mut relay = WsRelay {
            ws,
            open: true,
        };
        relay
            .send(ClientMessage::Join {
                room: code.to_string(),
                display_name: display_name.to_string(),
            })
            .await?;
        Ok((relay, id))
    }
}

pub struct WsRelay {
    ws: actix_codec::Framed<BoxedSocket, Codec>,
    open: bool,
}

impl std::fmt::Debug for WsRelay {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WsRelay").field("open", &self.open).finish()
    }
}

#[async_trait(?Send)]
impl Relay for WsRelay {
    async fn send(&mut self, msg: ClientMessage) -> Result<(), Error> {
        if !self.open {
            return Err(Error::RelayDisconnected);
        }
        let text = serde_json::to_string(&msg).map_err(|e| Error::UnexpectedError(e.into()))?;
        self.ws
            .send(ws::Message::Text(text.into()))
            .await
            .map_err(|e| {
                warn!(?e, "Relay send failed");
                Error::RelayDisconnected
            })
    }

    async fn next_event(&mut self) -> RelayEvent {
        while self.open {
            let frame = match self.ws.next().await {
                Some(Ok(frame)) => frame,
                Some(Err(e)) => {
                    warn!(?e, "Relay protocol error");
                    break;
                }
                None => break,
            };
            match frame {
                ws::Frame::Text(msg) => match serde_json::from_slice::<ServerMessage>(&msg) {
                    Ok(ServerMessage::Welcome { .. }) => {}
                    Ok(ServerMessage::PeerJoined {
                        id,
                        display_name,
                        peers,
                    }) => {
                        return RelayEvent::PeerJoined {
                            id,
                            display_name,
                            peers,
                        }
                    }
                    Ok(ServerMessage::PeerLeft { id }) => return RelayEvent::PeerLeft { id },
                    Ok(ServerMessage::Signal { from, payload }) => {
                        return RelayEvent::Signal { from, payload }
                    }
                    Ok(ServerMessage::Chat { sender, text }) => {
                        return RelayEvent::Chat { sender, text }
                    }
                    Err(e) => warn!(?e, "Dropping malformed relay frame"),
                },
                ws::Frame::Ping(msg) => {
                    if self.ws.send(ws::Message::Pong(msg)).await.is_err() {
                        break;
                    }
                }
                ws::Frame::Close(reason) => {
                    debug!(?reason, "Relay closed the connection");
                    break;
                }
                ws::Frame::Pong(_) | ws::Frame::Binary(_) | ws::Frame::Continuation(_) => {}
            }
        }
        self.open = false;
        RelayEvent::ConnectionLost
    }

    async fn disconnect(&mut self) {
        if !self.open {
            return;
        }
        self.open = false;
        if let Err(e) = self.ws.close().await {
            debug!(?e, "Closing relay socket failed");
        }
        info!("Disconnected from relay");
    }
}
