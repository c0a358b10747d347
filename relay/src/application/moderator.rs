//! Room bookkeeping. One actor owns every room, so membership changes and the
//! broadcasts they trigger are seen in the same order by all members.

use std::collections::HashMap;

use actix::prelude::*;
use mesh_call::{PeerId, ServerMessage};
use tracing::{debug, info};

/// A frame to push down one client's socket.
#[derive(Message, Debug, Clone)]
#[rtype(result = "()")]
pub struct Deliver(pub ServerMessage);

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Already joined room {0}")]
    AlreadyJoined(String),
    #[error("{0} is not in a room")]
    NotInRoom(PeerId),
}

#[derive(Message)]
#[rtype(result = "Result<(), Error>")]
pub struct Join {
    pub id: PeerId,
    pub room: String,
    pub display_name: String,
    pub addr: Recipient<Deliver>,
}

/// Point-to-point signal from `from` to `target`.
#[derive(Message)]
#[rtype(result = "Result<(), Error>")]
pub struct Forward {
    pub from: PeerId,
    pub target: PeerId,
    pub payload: String,
}

#[derive(Message)]
#[rtype(result = "Result<(), Error>")]
pub struct Chat {
    pub from: PeerId,
    pub text: String,
}

#[derive(Message)]
#[rtype(result = "()")]
pub struct Disconnect {
    pub id: PeerId,
}

struct Member {
    room: String,
    display_name: String,
    addr: Recipient<Deliver>,
}

#[derive(Default)]
pub struct Moderator {
    rooms: HashMap<String, Vec<PeerId>>,
    members: HashMap<PeerId, Member>,
}

impl Moderator {
    fn broadcast(&self, room: &str, msg: ServerMessage) {
        for id in self.rooms.get(room).into_iter().flatten() {
            if let Some(member) = self.members.get(id) {
                member.addr.do_send(Deliver(msg.clone()));
            }
        }
    }

    fn member(&self, id: &PeerId) -> Result<&Member, Error> {
        self.members
            .get(id)
            .ok_or_else(|| Error::NotInRoom(id.clone()))
    }
}

impl Actor for Moderator {
    type Context = Context<Self>;
}

impl Handler<Join> for Moderator {
    type Result = Result<(), Error>;

    fn handle(&mut self, msg: Join, _ctx: &mut Self::Context) -> Self::Result {
        if let Some(member) = self.members.get(&msg.id) {
            return Err(Error::AlreadyJoined(member.room.clone()));
        }
        let peers = self.rooms.entry(msg.room.clone()).or_default();
        peers.push(msg.id.clone());
        let peers = peers.clone();
        info!(id = %msg.id, room = %msg.room, members = peers.len(), "Peer joined");

        self.members.insert(
            msg.id.clone(),
            Member {
                room: msg.room.clone(),
                display_name: msg.display_name.clone(),
                addr: msg.addr,
            },
        );
        self.broadcast(
            &msg.room,
            ServerMessage::PeerJoined {
                id: msg.id,
                display_name: msg.display_name,
                peers,
            },
        );
        Ok(())
    }
}

impl Handler<Forward> for Moderator {
    type Result = Result<(), Error>;

    fn handle(&mut self, msg: Forward, _ctx: &mut Self::Context) -> Self::Result {
        let room = &self.member(&msg.from)?.room;
        let target = self
            .members
            .get(&msg.target)
            .filter(|target| &target.room == room)
            .ok_or_else(|| Error::NotInRoom(msg.target.clone()))?;
        debug!(from = %msg.from, to = %msg.target, "Forwarding signal");
        target.addr.do_send(Deliver(ServerMessage::Signal {
            from: msg.from,
            payload: msg.payload,
        }));
        Ok(())
    }
}

impl Handler<Chat> for Moderator {
    type Result = Result<(), Error>;

    fn handle(&mut self, msg: Chat, _ctx: &mut Self::Context) -> Self::Result {
        let member = self.member(&msg.from)?;
        let room = member.room.clone();
        let sender = member.display_name.clone();
        self.broadcast(
            &room,
            ServerMessage::Chat {
                sender,
                text: msg.text,
            },
        );
        Ok(())
    }
}

impl Handler<Disconnect> for Moderator {
    type Result = ();

    fn handle(&mut self, msg: Disconnect, _ctx: &mut Self::Context) -> Self::Result {
        let Some(member) = self.members.remove(&msg.id) else {
            return;
        };
        let Some(peers) = self.rooms.get_mut(&member.room) else {
            return;
        };
        peers.retain(|id| id != &msg.id);
        info!(id = %msg.id, room = %member.room, remaining = peers.len(), "Peer left");
        if peers.is_empty() {
            self.rooms.remove(&member.room);
            return;
        }
        self.broadcast(&member.room, ServerMessage::PeerLeft { id: msg.id });
    }
}
