//! Per-room message views merging optimistic sends, live pushes and history.
//!
//! Matching order for an incoming message:
//! 1. same server id (or an id already absorbed as an echo) is a duplicate;
//! 2. same client message id confirms the local entry carrying it;
//! 3. without a client id, the oldest pending or failed local entry with the
//!    same sender, kind and content is confirmed;
//! 4. without a client id, a confirmed entry (local or not) with the same body
//!    created within the dedup window absorbs one copy under a different id.
//!
//! Anything else is appended. Entries stay ordered by creation time, ties by
//! arrival.

use std::{collections::HashMap, time::Duration};

use chrono::{DateTime, Utc};
use shared::{
    domain::{ClientMessageId, MessageId, MessageKind, RoomId, UserId},
    protocol::MessagePayload,
};
use tokio::time::Instant;
use tracing::debug;

use crate::error::SendError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryState {
    Pending,
    Confirmed,
    Failed { reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimelineEntry {
    pub message: MessagePayload,
    pub delivery: DeliveryState,
    arrival: u64,
    local: bool,
    dispatched_at: Option<Instant>,
    echo_id: Option<MessageId>,
}

impl TimelineEntry {
    /// Sent from this session (as opposed to pushed or fetched).
    pub fn is_local(&self) -> bool {
        self.local
    }

    fn sort_key(&self) -> (DateTime<Utc>, u64) {
        (self.message.created_at, self.arrival)
    }

    fn answers_to(&self, id: &MessageId) -> bool {
        &self.message.id == id || self.echo_id.as_ref() == Some(id)
    }

    fn unconfirmed(&self) -> bool {
        !matches!(self.delivery, DeliveryState::Confirmed)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IncomingOutcome {
    Appended,
    Confirmed { temp_id: MessageId },
    Duplicate,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HistoryMerge {
    pub appended: usize,
    pub confirmed: Vec<MessageId>,
    pub duplicates: usize,
}

#[derive(Debug, Clone)]
pub struct RoomTimeline {
    room_id: RoomId,
    dedup_window: chrono::Duration,
    entries: Vec<TimelineEntry>,
    next_arrival: u64,
}

impl RoomTimeline {
    pub fn new(room_id: RoomId, dedup_window: Duration) -> Self {
        Self {
            room_id,
            dedup_window: chrono::Duration::from_std(dedup_window)
                .unwrap_or_else(|_| chrono::Duration::seconds(120)),
            entries: Vec::new(),
            next_arrival: 0,
        }
    }

    pub fn room_id(&self) -> &RoomId {
        &self.room_id
    }

    pub fn entries(&self) -> &[TimelineEntry] {
        &self.entries
    }

    pub fn messages(&self) -> Vec<MessagePayload> {
        self.entries.iter().map(|entry| entry.message.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, id: &MessageId) -> Option<&TimelineEntry> {
        self.entries.iter().find(|entry| entry.answers_to(id))
    }

    /// Adds a local send at the end of the view under a temporary id.
    pub fn append_optimistic(
        &mut self,
        sender_id: UserId,
        kind: MessageKind,
        content: String,
        now: DateTime<Utc>,
    ) -> MessagePayload {
        let created_at = self
            .entries
            .last()
            .map(|last| last.message.created_at.max(now))
            .unwrap_or(now);
        let message = MessagePayload {
            id: MessageId::temporary(),
            room_id: self.room_id.clone(),
            sender_id,
            kind,
            content,
            created_at,
            client_message_id: Some(ClientMessageId::generate()),
        };
        let arrival = self.take_arrival();
        self.insert_sorted(TimelineEntry {
            message: message.clone(),
            delivery: DeliveryState::Pending,
            arrival,
            local: true,
            dispatched_at: None,
            echo_id: None,
        });
        message
    }

    pub fn append_incoming(&mut self, message: MessagePayload) -> IncomingOutcome {
        let outcome = self.merge_one(message);
        if let IncomingOutcome::Confirmed { temp_id } = &outcome {
            debug!(room_id = %self.room_id, temp_id = %temp_id, "timeline: optimistic send confirmed");
        }
        outcome
    }

    /// Merges a fetched batch. The batch is sorted first so it lands as one
    /// ascending run regardless of the order the collaborator returned it in.
    pub fn load_history(&mut self, mut batch: Vec<MessagePayload>) -> HistoryMerge {
        batch.sort_by_key(|message| message.created_at);
        let mut merge = HistoryMerge::default();
        for message in batch {
            match self.merge_one(message) {
                IncomingOutcome::Appended => merge.appended += 1,
                IncomingOutcome::Confirmed { temp_id } => merge.confirmed.push(temp_id),
                IncomingOutcome::Duplicate => merge.duplicates += 1,
            }
        }
        merge
    }

    /// Confirms a local entry with the authoritative copy returned by the
    /// mutation collaborator.
    pub fn confirm(&mut self, temp_id: &MessageId, confirmed: MessagePayload) -> bool {
        if self.entries.iter().any(|entry| entry.answers_to(&confirmed.id)) {
            // The live push won the race; the local entry is now redundant.
            if let Some(index) = self.position_unconfirmed(temp_id) {
                self.entries.remove(index);
            }
            return false;
        }
        match self.position_unconfirmed(temp_id) {
            Some(index) => {
                self.promote(index, confirmed);
                true
            }
            None => false,
        }
    }

    pub fn mark_dispatched(&mut self, temp_id: &MessageId, at: Instant) {
        if let Some(index) = self.position_unconfirmed(temp_id) {
            let entry = &mut self.entries[index];
            entry.delivery = DeliveryState::Pending;
            entry.dispatched_at = Some(at);
        }
    }

    pub fn mark_failed(&mut self, temp_id: &MessageId, reason: impl Into<String>) -> bool {
        match self.position_unconfirmed(temp_id) {
            Some(index) => {
                self.entries[index].delivery = DeliveryState::Failed {
                    reason: reason.into(),
                };
                self.entries[index].dispatched_at = None;
                true
            }
            None => false,
        }
    }

    pub fn fail_by_client_id(
        &mut self,
        client_id: &ClientMessageId,
        reason: &str,
    ) -> Option<MessageId> {
        let entry = self.entries.iter_mut().find(|entry| {
            entry.unconfirmed() && entry.message.client_message_id.as_ref() == Some(client_id)
        })?;
        entry.delivery = DeliveryState::Failed {
            reason: reason.to_string(),
        };
        entry.dispatched_at = None;
        Some(entry.message.id.clone())
    }

    /// Fails dispatched entries that have waited `timeout` without confirmation.
    pub fn expire_pending(&mut self, now: Instant, timeout: Duration) -> Vec<MessageId> {
        let mut expired = Vec::new();
        for entry in &mut self.entries {
            let Some(dispatched_at) = entry.dispatched_at else {
                continue;
            };
            if entry.delivery == DeliveryState::Pending
                && now.saturating_duration_since(dispatched_at) >= timeout
            {
                entry.delivery = DeliveryState::Failed {
                    reason: "not confirmed in time".into(),
                };
                entry.dispatched_at = None;
                expired.push(entry.message.id.clone());
            }
        }
        expired
    }

    /// Fails every pending entry, dispatched or not.
    pub fn fail_all_pending(&mut self, reason: &str) -> Vec<MessageId> {
        let mut failed = Vec::new();
        for entry in &mut self.entries {
            if entry.delivery == DeliveryState::Pending {
                entry.delivery = DeliveryState::Failed {
                    reason: reason.to_string(),
                };
                entry.dispatched_at = None;
                failed.push(entry.message.id.clone());
            }
        }
        failed
    }

    /// Pending local entries in view order, for (re)sending.
    pub fn pending_outbound(&self) -> Vec<MessagePayload> {
        self.entries
            .iter()
            .filter(|entry| entry.local && entry.delivery == DeliveryState::Pending)
            .map(|entry| entry.message.clone())
            .collect()
    }

    /// Moves a failed entry back to pending and returns it for sending again.
    pub fn retry(&mut self, temp_id: &MessageId) -> Result<MessagePayload, SendError> {
        let entry = self
            .entries
            .iter_mut()
            .find(|entry| {
                &entry.message.id == temp_id && matches!(entry.delivery, DeliveryState::Failed { .. })
            })
            .ok_or_else(|| SendError::UnknownMessage(temp_id.clone()))?;
        entry.delivery = DeliveryState::Pending;
        entry.dispatched_at = None;
        Ok(entry.message.clone())
    }

    fn merge_one(&mut self, message: MessagePayload) -> IncomingOutcome {
        if self.entries.iter().any(|entry| entry.answers_to(&message.id)) {
            return IncomingOutcome::Duplicate;
        }

        if let Some(client_id) = message.client_message_id.clone() {
            let keyed = self
                .entries
                .iter()
                .position(|entry| entry.message.client_message_id.as_ref() == Some(&client_id));
            if let Some(index) = keyed {
                if self.entries[index].unconfirmed() {
                    return self.promote(index, message);
                }
                let entry = &mut self.entries[index];
                if entry.echo_id.is_none() {
                    entry.echo_id = Some(message.id);
                }
                return IncomingOutcome::Duplicate;
            }
        } else {
            let pending = self
                .entries
                .iter()
                .position(|entry| entry.local && entry.unconfirmed() && entry.message.same_body(&message));
            if let Some(index) = pending {
                return self.promote(index, message);
            }

            let window = self.dedup_window;
            let echoed = self.entries.iter_mut().find(|entry| {
                !entry.unconfirmed()
                    && entry.echo_id.is_none()
                    && entry.message.same_body(&message)
                    && (entry.message.created_at - message.created_at).abs() <= window
            });
            if let Some(entry) = echoed {
                entry.echo_id = Some(message.id);
                return IncomingOutcome::Duplicate;
            }
        }

        let arrival = self.take_arrival();
        self.insert_sorted(TimelineEntry {
            message,
            delivery: DeliveryState::Confirmed,
            arrival,
            local: false,
            dispatched_at: None,
            echo_id: None,
        });
        IncomingOutcome::Appended
    }

    /// Replaces a local entry with the server's copy and re-sorts it.
    fn promote(&mut self, index: usize, confirmed: MessagePayload) -> IncomingOutcome {
        let mut entry = self.entries.remove(index);
        let temp_id = entry.message.id.clone();
        let client_message_id = entry.message.client_message_id.clone();
        entry.message = confirmed;
        if entry.message.client_message_id.is_none() {
            entry.message.client_message_id = client_message_id;
        }
        entry.delivery = DeliveryState::Confirmed;
        entry.dispatched_at = None;
        self.insert_sorted(entry);
        IncomingOutcome::Confirmed { temp_id }
    }

    fn position_unconfirmed(&self, temp_id: &MessageId) -> Option<usize> {
        self.entries
            .iter()
            .position(|entry| &entry.message.id == temp_id && entry.unconfirmed())
    }

    fn insert_sorted(&mut self, entry: TimelineEntry) {
        let key = entry.sort_key();
        let index = self.entries.partition_point(|existing| existing.sort_key() <= key);
        self.entries.insert(index, entry);
    }

    fn take_arrival(&mut self) -> u64 {
        let arrival = self.next_arrival;
        self.next_arrival += 1;
        arrival
    }
}

/// All room views of one session.
#[derive(Debug, Clone)]
pub struct Timelines {
    dedup_window: Duration,
    rooms: HashMap<RoomId, RoomTimeline>,
}

impl Timelines {
    pub fn new(dedup_window: Duration) -> Self {
        Self {
            dedup_window,
            rooms: HashMap::new(),
        }
    }

    pub fn room(&self, room_id: &RoomId) -> Option<&RoomTimeline> {
        self.rooms.get(room_id)
    }

    pub fn room_mut(&mut self, room_id: &RoomId) -> &mut RoomTimeline {
        let window = self.dedup_window;
        self.rooms
            .entry(room_id.clone())
            .or_insert_with(|| RoomTimeline::new(room_id.clone(), window))
    }

    pub fn rooms_mut(&mut self) -> impl Iterator<Item = &mut RoomTimeline> {
        self.rooms.values_mut()
    }

    pub fn remove(&mut self, room_id: &RoomId) -> Option<RoomTimeline> {
        self.rooms.remove(room_id)
    }

    pub fn clear(&mut self) {
        self.rooms.clear();
    }
}

#[cfg(test)]
#[path = "tests/timeline_tests.rs"]
mod tests;
