use std::{collections::HashMap, sync::Arc};

use tracing::{debug, info, warn};

use crate::{
    error::TransportError,
    media::{OutboundTracks, TrackKind},
    message::PeerId,
    peer::{Connection, ConnectionId, Peer, PeerEventSender, TransportFactory},
};

/// Single source of truth for which peers exist and their connections.
pub struct Registry {
    peers: HashMap<PeerId, Peer>,
    factory: Arc<dyn TransportFactory>,
    events: PeerEventSender,
    next_connection: u64,
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry")
            .field("peers", &self.peers)
            .finish()
    }
}

impl Registry {
    pub fn new(factory: Arc<dyn TransportFactory>, events: PeerEventSender) -> Self {
        Self {
            peers: HashMap::new(),
            factory,
            events,
            next_connection: 0,
        }
    }

    pub fn contains(&self, peer_id: &PeerId) -> bool {
        self.peers.contains_key(peer_id)
    }

    pub fn get(&self, peer_id: &PeerId) -> Option<&Peer> {
        self.peers.get(peer_id)
    }

    pub fn get_mut(&mut self, peer_id: &PeerId) -> Option<&mut Peer> {
        self.peers.get_mut(peer_id)
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    pub fn all(&self) -> impl Iterator<Item = (&PeerId, &Peer)> {
        self.peers.iter()
    }

    pub fn ids(&self) -> Vec<PeerId> {
        self.peers.keys().cloned().collect()
    }

    /// Returns the peer for `peer_id`, creating it with a fresh connection
    /// carrying `tracks` when absent.
    pub async fn get_or_create(
        &mut self,
        peer_id: &PeerId,
        display_name: &str,
        tracks: &OutboundTracks,
    ) -> Result<&mut Peer, TransportError> {
        if !self.peers.contains_key(peer_id) {
            let connection = self.connect(peer_id, tracks).await?;
            info!(%peer_id, id = ?connection.id(), "Peer added");
            self.peers.insert(
                peer_id.clone(),
                Peer::new(peer_id.clone(), display_name.to_string(), connection),
            );
        }
        let peer = self
            .peers
            .get_mut(peer_id)
            .ok_or(TransportError::Closed)?;
        peer.set_display_name_if_unknown(display_name);
        Ok(peer)
    }

    /// Closes the connection of `peer_id` and gives the peer a new one that
    /// inherits its buffered remote candidates and queued signals.
    pub async fn reconnect(
        &mut self,
        peer_id: &PeerId,
        tracks: &OutboundTracks,
    ) -> Result<&mut Peer, TransportError> {
        let mut connection = self.connect(peer_id, tracks).await?;
        let Some(peer) = self.peers.get_mut(peer_id) else {
            connection.close();
            return Err(TransportError::Closed);
        };
        connection.inherit(peer.connection_mut());
        let mut previous = peer.replace_connection(connection);
        previous.close();
        info!(%peer_id, id = ?peer.connection().id(), "Peer connection replaced");
        Ok(peer)
    }

    async fn connect(
        &mut self,
        peer_id: &PeerId,
        tracks: &OutboundTracks,
    ) -> Result<Connection, TransportError> {
        let id = ConnectionId(self.next_connection);
        self.next_connection += 1;
        let transport = self
            .factory
            .create(peer_id, id, self.events.clone())
            .await?;
        let mut connection = Connection::new(id, transport.clone());
        for kind in [TrackKind::Audio, TrackKind::Video] {
            match transport.add_track(kind, tracks.get(kind)).await {
                Ok(sender) => connection.insert_sender(kind, sender),
                Err(e) => {
                    connection.close();
                    return Err(e);
                }
            }
        }
        debug!(%peer_id, ?id, "Connection created");
        Ok(connection)
    }

    /// Closes and evicts `peer_id`. Absent peers are ignored.
    pub fn remove(&mut self, peer_id: &PeerId) -> Option<Peer> {
        let mut peer = self.peers.remove(peer_id)?;
        peer.connection_mut().close();
        info!(%peer_id, "Peer removed");
        Some(peer)
    }

    pub fn clear(&mut self) {
        if self.peers.is_empty() {
            return;
        }
        warn!(count = self.peers.len(), "Closing all peer connections");
        for (_, mut peer) in self.peers.drain() {
            peer.connection_mut().close();
        }
    }
}
