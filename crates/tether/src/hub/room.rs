//! Channel membership of live connections.

use dashmap::DashMap;
use std::collections::HashSet;

/// Tracks which connections joined which channels, indexed both ways so
/// fan-out and disconnect cleanup are single lookups.
#[derive(Debug, Default)]
pub struct RoomManager {
    /// channel -> connection ids
    rooms: DashMap<String, HashSet<String>>,
    /// connection id -> channels
    memberships: DashMap<String, HashSet<String>>,
}

impl RoomManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns false if the connection was already a member.
    pub fn join(&self, connection_id: &str, channel: &str) -> bool {
        let inserted = self
            .rooms
            .entry(channel.to_string())
            .or_default()
            .insert(connection_id.to_string());
        self.memberships
            .entry(connection_id.to_string())
            .or_default()
            .insert(channel.to_string());
        inserted
    }

    /// Returns false if the connection was not a member.
    pub fn leave(&self, connection_id: &str, channel: &str) -> bool {
        let removed = self
            .rooms
            .get_mut(channel)
            .map(|mut members| members.remove(connection_id))
            .unwrap_or(false);
        self.rooms.remove_if(channel, |_, members| members.is_empty());

        if let Some(mut channels) = self.memberships.get_mut(connection_id) {
            channels.remove(channel);
        }
        self.memberships
            .remove_if(connection_id, |_, channels| channels.is_empty());
        removed
    }

    /// Drop every membership of a connection. Returns the channels it left.
    pub fn leave_all(&self, connection_id: &str) -> Vec<String> {
        let Some((_, channels)) = self.memberships.remove(connection_id) else {
            return Vec::new();
        };
        for channel in &channels {
            if let Some(mut members) = self.rooms.get_mut(channel) {
                members.remove(connection_id);
            }
            self.rooms.remove_if(channel, |_, members| members.is_empty());
        }
        channels.into_iter().collect()
    }

    pub fn members(&self, channel: &str) -> Vec<String> {
        self.rooms
            .get(channel)
            .map(|members| members.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn is_member(&self, connection_id: &str, channel: &str) -> bool {
        self.rooms
            .get(channel)
            .map(|members| members.contains(connection_id))
            .unwrap_or(false)
    }

    pub fn channels_of(&self, connection_id: &str) -> Vec<String> {
        self.memberships
            .get(connection_id)
            .map(|channels| channels.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn room_count(&self) -> usize {
        self.rooms.len()
    }

    pub fn clear(&self) {
        self.rooms.clear();
        self.memberships.clear();
    }
}
