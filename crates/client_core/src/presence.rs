use std::{collections::HashMap, time::Duration};

use shared::{
    domain::{OnlineUser, RoomId, UserId},
    protocol::TypingSignal,
};
use tokio::time::Instant;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TypingUser {
    pub user_id: UserId,
    pub display_name: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TypingTimings {
    /// Remote entries vanish after this long without renewal.
    pub ttl: Duration,
    /// Minimum gap between repeated "typing" signals for the same room.
    pub renew_interval: Duration,
    /// Local typing with no activity for this long is stopped automatically.
    pub idle_timeout: Duration,
}

#[derive(Debug, Clone)]
struct RemoteTyping {
    display_name: String,
    expires_at: Instant,
}

#[derive(Debug, Clone, Copy)]
struct LocalTyping {
    last_sent: Instant,
    last_activity: Instant,
}

#[derive(Debug, Clone)]
pub struct PresenceAggregator {
    local_user: UserId,
    timings: TypingTimings,
    typing: HashMap<RoomId, HashMap<UserId, RemoteTyping>>,
    outgoing: HashMap<RoomId, LocalTyping>,
    online: Vec<OnlineUser>,
}

impl PresenceAggregator {
    pub fn new(local_user: UserId, timings: TypingTimings) -> Self {
        Self {
            local_user,
            timings,
            typing: HashMap::new(),
            outgoing: HashMap::new(),
            online: Vec::new(),
        }
    }

    pub fn local_user(&self) -> &UserId {
        &self.local_user
    }

    /// Local keystroke intent. Returns the signal to emit, if any; repeated
    /// "typing" inside the renew interval is swallowed.
    pub fn set_typing(&mut self, room_id: &RoomId, is_typing: bool, now: Instant) -> Option<TypingSignal> {
        if !is_typing {
            return self.outgoing.remove(room_id).map(|_| TypingSignal {
                room_id: room_id.clone(),
                is_typing: false,
            });
        }

        if let Some(local) = self.outgoing.get_mut(room_id) {
            local.last_activity = now;
            if now.saturating_duration_since(local.last_sent) < self.timings.renew_interval {
                return None;
            }
            local.last_sent = now;
        } else {
            self.outgoing.insert(
                room_id.clone(),
                LocalTyping {
                    last_sent: now,
                    last_activity: now,
                },
            );
        }

        Some(TypingSignal {
            room_id: room_id.clone(),
            is_typing: true,
        })
    }

    /// Stop signals for rooms where local typing went idle.
    pub fn idle_typing(&mut self, now: Instant) -> Vec<TypingSignal> {
        let idle_timeout = self.timings.idle_timeout;
        let idle: Vec<RoomId> = self
            .outgoing
            .iter()
            .filter(|(_, local)| now.saturating_duration_since(local.last_activity) >= idle_timeout)
            .map(|(room, _)| room.clone())
            .collect();

        idle.into_iter()
            .filter_map(|room| self.set_typing(&room, false, now))
            .collect()
    }

    /// Returns whether the room's typing map changed.
    pub fn on_remote_typing(
        &mut self,
        room_id: &RoomId,
        user_id: &UserId,
        display_name: &str,
        is_typing: bool,
        now: Instant,
    ) -> bool {
        if *user_id == self.local_user {
            return false;
        }

        if is_typing {
            let previous = self.typing.entry(room_id.clone()).or_default().insert(
                user_id.clone(),
                RemoteTyping {
                    display_name: display_name.to_string(),
                    expires_at: now + self.timings.ttl,
                },
            );
            previous.map_or(true, |prev| prev.display_name != display_name)
        } else {
            let Some(room) = self.typing.get_mut(room_id) else {
                return false;
            };
            let removed = room.remove(user_id).is_some();
            if room.is_empty() {
                self.typing.remove(room_id);
            }
            removed
        }
    }

    /// Drops stale remote entries; returns the rooms that changed.
    pub fn expire_typing(&mut self, now: Instant) -> Vec<RoomId> {
        let mut changed = Vec::new();
        self.typing.retain(|room_id, users| {
            let before = users.len();
            users.retain(|_, entry| entry.expires_at > now);
            if users.len() != before {
                changed.push(room_id.clone());
            }
            !users.is_empty()
        });
        changed
    }

    pub fn typing_users(&self, room_id: &RoomId) -> Vec<TypingUser> {
        let mut users: Vec<TypingUser> = self
            .typing
            .get(room_id)
            .map(|users| {
                users
                    .iter()
                    .map(|(user_id, entry)| TypingUser {
                        user_id: user_id.clone(),
                        display_name: entry.display_name.clone(),
                    })
                    .collect()
            })
            .unwrap_or_default();
        users.sort_by(|a, b| a.user_id.cmp(&b.user_id));
        users
    }

    pub fn is_typing(&self, room_id: &RoomId, user_id: &UserId) -> bool {
        self.typing
            .get(room_id)
            .is_some_and(|users| users.contains_key(user_id))
    }

    /// The server's list is authoritative; it replaces whatever was known.
    pub fn set_online_users(&mut self, users: Vec<OnlineUser>) {
        self.online = users;
    }

    pub fn online_users(&self) -> &[OnlineUser] {
        &self.online
    }

    /// Forgets a room's typing state; returns the stop signal owed to the server.
    pub fn forget_room(&mut self, room_id: &RoomId, now: Instant) -> Option<TypingSignal> {
        self.typing.remove(room_id);
        self.set_typing(room_id, false, now)
    }

    /// After a reconnect nobody is known to be typing and nothing was sent.
    pub fn reset_after_reconnect(&mut self) {
        self.typing.clear();
        self.outgoing.clear();
    }
}

#[cfg(test)]
#[path = "tests/presence_tests.rs"]
mod tests;
