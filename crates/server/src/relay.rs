//! In-memory room fan-out for the development relay. History lives only as
//! long as the process.

use std::collections::{BTreeMap, HashMap, HashSet};

use chrono::Utc;
use shared::{
    domain::{ClientMessageId, MessageId, OnlineUser, RoomId, UserId},
    protocol::{
        ClientRequest, MessageErrorPayload, MessagePayload, OutboundMessage, ServerEvent,
        TypingPayload, TypingSignal,
    },
};
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};
use uuid::Uuid;

pub(crate) type PeerId = Uuid;

struct Peer {
    user: OnlineUser,
    rooms: HashSet<RoomId>,
    tx: mpsc::UnboundedSender<ServerEvent>,
}

#[derive(Default)]
struct HubInner {
    peers: HashMap<PeerId, Peer>,
    history: HashMap<RoomId, Vec<MessagePayload>>,
}

#[derive(Default)]
pub(crate) struct Hub {
    inner: Mutex<HubInner>,
}

impl Hub {
    /// Adds a connection and pushes the new online-user snapshot to everyone.
    pub(crate) async fn register(
        &self,
        user: OnlineUser,
    ) -> (PeerId, mpsc::UnboundedReceiver<ServerEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let peer_id = Uuid::new_v4();
        let mut inner = self.inner.lock().await;
        info!(%peer_id, user_id = %user.id, "relay: peer connected");
        inner.peers.insert(
            peer_id,
            Peer {
                user,
                rooms: HashSet::new(),
                tx,
            },
        );
        broadcast_online(&inner);
        (peer_id, rx)
    }

    pub(crate) async fn unregister(&self, peer_id: PeerId) {
        let mut inner = self.inner.lock().await;
        if inner.peers.remove(&peer_id).is_some() {
            info!(%peer_id, "relay: peer disconnected");
            broadcast_online(&inner);
        }
    }

    pub(crate) async fn handle(&self, peer_id: PeerId, request: ClientRequest) {
        let mut inner = self.inner.lock().await;
        match request {
            ClientRequest::JoinRoom(room_id) => {
                if room_id.is_blank() {
                    reject(&inner, peer_id, None, None, "room id is empty");
                    return;
                }
                if let Some(peer) = inner.peers.get_mut(&peer_id) {
                    peer.rooms.insert(room_id.clone());
                }
                let members = room_members(&inner, &room_id);
                debug!(%peer_id, room_id = %room_id, members, "relay: joined room");
            }
            ClientRequest::LeaveRoom(room_id) => {
                if let Some(peer) = inner.peers.get_mut(&peer_id) {
                    peer.rooms.remove(&room_id);
                }
                debug!(%peer_id, room_id = %room_id, "relay: left room");
            }
            ClientRequest::ChatMessage(outbound) => publish(&mut inner, peer_id, outbound),
            ClientRequest::Typing(signal) => relay_typing(&inner, peer_id, signal),
        }
    }

    /// Tells one peer its frame could not be understood.
    pub(crate) async fn reject_frame(&self, peer_id: PeerId, message: &str) {
        let inner = self.inner.lock().await;
        reject(&inner, peer_id, None, None, message);
    }

    pub(crate) async fn history(&self, room_id: &RoomId) -> Vec<MessagePayload> {
        self.inner
            .lock()
            .await
            .history
            .get(room_id)
            .cloned()
            .unwrap_or_default()
    }

    pub(crate) async fn online_users(&self) -> Vec<OnlineUser> {
        online_snapshot(&*self.inner.lock().await)
    }

    #[cfg(test)]
    pub(crate) async fn room_members(&self, room_id: &RoomId) -> usize {
        room_members(&*self.inner.lock().await, room_id)
    }
}

fn publish(inner: &mut HubInner, peer_id: PeerId, outbound: OutboundMessage) {
    let Some(peer) = inner.peers.get(&peer_id) else {
        return;
    };
    let client_id = outbound.client_message_id.clone();
    let room_id = outbound.room_id.clone();

    let problem = if outbound.content.trim().is_empty() {
        Some("message content is empty")
    } else if outbound.sender_id != peer.user.id {
        Some("sender does not match the authenticated user")
    } else if !peer.rooms.contains(&room_id) {
        Some("join the room before sending to it")
    } else {
        None
    };
    if let Some(problem) = problem {
        warn!(%peer_id, room_id = %room_id, "relay: message rejected: {problem}");
        reject(inner, peer_id, Some(room_id), client_id, problem);
        return;
    }

    // A resend after a lost echo: answer the sender with the stored copy.
    let stored = client_id.as_ref().and_then(|client_id| {
        inner.history.get(&room_id)?.iter().find(|stored| {
            stored.sender_id == outbound.sender_id
                && stored.client_message_id.as_ref() == Some(client_id)
        })
    });
    if let Some(stored) = stored {
        debug!(
            %peer_id,
            room_id = %room_id,
            message_id = %stored.id,
            "relay: duplicate send answered from history"
        );
        let _ = peer.tx.send(ServerEvent::MessageCreated(stored.clone()));
        return;
    }

    let message = MessagePayload {
        id: MessageId::new(Uuid::new_v4().to_string()),
        room_id: room_id.clone(),
        sender_id: outbound.sender_id,
        kind: outbound.kind,
        content: outbound.content,
        created_at: Utc::now(),
        client_message_id: client_id,
    };
    inner
        .history
        .entry(room_id.clone())
        .or_default()
        .push(message.clone());

    let mut delivered = 0;
    for peer in inner.peers.values().filter(|peer| peer.rooms.contains(&room_id)) {
        if peer.tx.send(ServerEvent::MessageCreated(message.clone())).is_ok() {
            delivered += 1;
        }
    }
    debug!(room_id = %room_id, message_id = %message.id, delivered, "relay: message fanned out");
}

fn relay_typing(inner: &HubInner, peer_id: PeerId, signal: TypingSignal) {
    let Some(sender) = inner.peers.get(&peer_id) else {
        return;
    };
    if !sender.rooms.contains(&signal.room_id) {
        return;
    }
    let event = ServerEvent::UserTyping(TypingPayload {
        user_id: sender.user.id.clone(),
        username: sender.user.username.clone(),
        is_typing: signal.is_typing,
        room_id: Some(signal.room_id.clone()),
    });
    for (id, peer) in &inner.peers {
        if *id != peer_id && peer.rooms.contains(&signal.room_id) {
            let _ = peer.tx.send(event.clone());
        }
    }
}

fn reject(
    inner: &HubInner,
    peer_id: PeerId,
    room_id: Option<RoomId>,
    client_message_id: Option<ClientMessageId>,
    message: &str,
) {
    if let Some(peer) = inner.peers.get(&peer_id) {
        let _ = peer.tx.send(ServerEvent::MessageError(MessageErrorPayload {
            message: message.to_string(),
            client_message_id,
            room_id,
        }));
    }
}

/// One entry per user, however many connections (tabs) they hold.
fn online_snapshot(inner: &HubInner) -> Vec<OnlineUser> {
    let unique: BTreeMap<&UserId, &OnlineUser> = inner
        .peers
        .values()
        .map(|peer| (&peer.user.id, &peer.user))
        .collect();
    unique.into_values().cloned().collect()
}

fn broadcast_online(inner: &HubInner) {
    let snapshot = online_snapshot(inner);
    for peer in inner.peers.values() {
        let _ = peer.tx.send(ServerEvent::OnlineUsers(snapshot.clone()));
    }
}

fn room_members(inner: &HubInner, room_id: &RoomId) -> usize {
    inner
        .peers
        .values()
        .filter(|peer| peer.rooms.contains(room_id))
        .count()
}

#[cfg(test)]
#[path = "tests/relay_tests.rs"]
mod tests;
