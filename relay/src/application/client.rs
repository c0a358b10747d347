use std::time::{Duration, Instant};

use actix::prelude::*;
use actix_web_actors::ws;
use mesh_call::{ClientMessage, PeerId, ServerMessage};
use tracing::{debug, error, info, warn};

pub use ws::start;

use super::moderator::{self, Deliver, Moderator};

/// How often heartbeat pings are sent
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(5);

/// How long before lack of client response causes a timeout
const CLIENT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug)]
pub struct WsClient {
    id: PeerId,
    heartbeat: Instant,
    moderator: Addr<Moderator>,
}

impl WsClient {
    pub fn new(id: PeerId, moderator: Addr<Moderator>) -> Self {
        Self {
            id,
            heartbeat: Instant::now(),
            moderator,
        }
    }

    /// helper method that sends ping to client every 5 seconds (HEARTBEAT_INTERVAL).
    ///
    /// also this method checks heartbeats from client
    fn heartbeat(&self, ctx: &mut <Self as Actor>::Context) {
        ctx.run_interval(HEARTBEAT_INTERVAL, |act, ctx| {
            if Instant::now().duration_since(act.heartbeat) > CLIENT_TIMEOUT {
                error!(id = %act.id, "Websocket Client heartbeat failed, disconnecting!");
                ctx.stop();
                return;
            }

            ctx.ping(b"");
        });
    }

    fn push(&self, msg: &ServerMessage, ctx: &mut <Self as Actor>::Context) {
        match serde_json::to_string(msg) {
            Ok(text) => ctx.text(text),
            Err(e) => error!(?e, "Could not encode frame"),
        }
    }

    /// Hands `msg` to the moderator and waits for it before reading the next
    /// frame, so a client's frames reach the room in the order they were sent.
    fn moderate<M>(&mut self, msg: M, ctx: &mut <Self as Actor>::Context)
    where
        M: Message<Result = Result<(), moderator::Error>> + Send + 'static,
        Moderator: Handler<M>,
    {
        self.moderator
            .send(msg)
            .into_actor(self)
            .then(|res, act, ctx| {
                match res {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => warn!(id = %act.id, error = %e, "Rejected client frame"),
                    Err(e) => {
                        error!(?e, "Moderator unavailable");
                        ctx.stop();
                    }
                }
                fut::ready(())
            })
            .wait(ctx);
    }

    fn on_text(&mut self, text: &str, ctx: &mut <Self as Actor>::Context) {
        let msg = match serde_json::from_str::<ClientMessage>(text) {
            Ok(msg) => msg,
            Err(e) => {
                warn!(id = %self.id, ?e, "Dropping malformed client frame");
                return;
            }
        };
        match msg {
            ClientMessage::Join { room, display_name } => {
                let addr = ctx.address().recipient();
                self.moderate(
                    moderator::Join {
                        id: self.id.clone(),
                        room,
                        display_name,
                        addr,
                    },
                    ctx,
                );
            }
            ClientMessage::Signal { target, payload } => self.moderate(
                moderator::Forward {
                    from: self.id.clone(),
                    target,
                    payload,
                },
                ctx,
            ),
            ClientMessage::Chat { text } => self.moderate(
                moderator::Chat {
                    from: self.id.clone(),
                    text,
                },
                ctx,
            ),
        }
    }
}

impl Handler<Deliver> for WsClient {
    type Result = ();

    fn handle(&mut self, msg: Deliver, ctx: &mut Self::Context) -> Self::Result {
        debug!(id = %self.id, msg = ?msg.0, "Deliver");
        self.push(&msg.0, ctx);
    }
}

impl Actor for WsClient {
    type Context = ws::WebsocketContext<Self>;

    /// Method is called on actor start. We start the heartbeat process here.
    fn started(&mut self, ctx: &mut Self::Context) {
        self.heartbeat(ctx);
        info!(id = %self.id, "WsClient started");
        self.push(
            &ServerMessage::Welcome {
                id: self.id.clone(),
            },
            ctx,
        );
    }

    fn stopping(&mut self, _: &mut Self::Context) -> Running {
        self.moderator.do_send(moderator::Disconnect {
            id: self.id.clone(),
        });
        Running::Stop
    }
}

/// Handler for ws::Message message
impl StreamHandler<Result<ws::Message, ws::ProtocolError>> for WsClient {
    fn handle(&mut self, msg: Result<ws::Message, ws::ProtocolError>, ctx: &mut Self::Context) {
        match msg {
            Ok(ws::Message::Ping(msg)) => {
                self.heartbeat = Instant::now();
                ctx.pong(&msg);
            }
            Ok(ws::Message::Pong(_)) => {
                self.heartbeat = Instant::now();
            }
            Ok(ws::Message::Text(text)) => self.on_text(&text, ctx),
            Ok(ws::Message::Binary(_)) => warn!(id = %self.id, "Ignoring binary frame"),
            Ok(ws::Message::Close(reason)) => {
                debug!(id = %self.id, ?reason, "Client closed");
                ctx.close(reason);
                ctx.stop();
            }
            Ok(ws::Message::Continuation(_)) | Ok(ws::Message::Nop) => {}
            Err(e) => {
                warn!(id = %self.id, ?e, "Protocol error");
                ctx.stop();
            }
        }
    }
}
