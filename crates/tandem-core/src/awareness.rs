//! Awareness (presence) registry
//!
//! Ephemeral per-user state such as display name, cursor color and cursor
//! position. Entries carry a per-user clock; an update only wins when its
//! clock is newer, so out-of-order delivery is harmless. Users that stop
//! sending heartbeats expire after a timeout.

use crate::encoding::{read_var_len, read_var_string, read_var_u64, write_var_string, write_var_u64, Decode, Encode};
use crate::error::{Error, Result};
use bytes::{Buf, BufMut};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeSet, HashMap};
use std::time::{Duration, Instant};

/// Default presence timeout without heartbeat
pub const DEFAULT_AWARENESS_TIMEOUT: Duration = Duration::from_secs(30);

/// Presence fields as sent by clients
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserPresence {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cursor_color: Option<String>,
    /// Anything else the client attaches (cursor, selection, ...)
    #[serde(flatten)]
    pub custom_fields: Map<String, Value>,
}

impl UserPresence {
    pub fn named(display_name: impl Into<String>) -> Self {
        Self {
            display_name: Some(display_name.into()),
            ..Default::default()
        }
    }

    pub fn with_color(mut self, color: impl Into<String>) -> Self {
        self.cursor_color = Some(color.into());
        self
    }

    pub fn with_field(mut self, key: impl Into<String>, value: Value) -> Self {
        self.custom_fields.insert(key.into(), value);
        self
    }

    /// Merge `other` into self. Fields absent in `other` are kept, custom
    /// fields set to `null` are removed.
    pub fn merge(&mut self, other: UserPresence) {
        if other.display_name.is_some() {
            self.display_name = other.display_name;
        }
        if other.cursor_color.is_some() {
            self.cursor_color = other.cursor_color;
        }
        for (key, value) in other.custom_fields {
            if value.is_null() {
                self.custom_fields.remove(&key);
            } else {
                self.custom_fields.insert(key, value);
            }
        }
    }
}

/// A user's presence as held by the registry
#[derive(Debug, Clone, PartialEq)]
pub struct AwarenessState {
    pub presence: UserPresence,
    pub clock: u64,
    pub last_seen: Instant,
}

/// One entry of an awareness delta; `state: None` means the user left
#[derive(Debug, Clone, PartialEq)]
pub struct AwarenessEntry {
    pub user_id: String,
    pub clock: u64,
    pub state: Option<UserPresence>,
}

/// Awareness delta exchanged on the wire
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AwarenessUpdate {
    pub entries: Vec<AwarenessEntry>,
}

impl AwarenessUpdate {
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Encode for AwarenessUpdate {
    fn encode<B: BufMut>(&self, buf: &mut B) {
        write_var_u64(buf, self.entries.len() as u64);
        for entry in &self.entries {
            write_var_string(buf, &entry.user_id);
            write_var_u64(buf, entry.clock);
            // serializing a map of strings and JSON values cannot fail
            let json = serde_json::to_string(&entry.state).unwrap_or_else(|_| "null".into());
            write_var_string(buf, &json);
        }
    }
}

impl Decode for AwarenessUpdate {
    fn decode<B: Buf>(buf: &mut B) -> Result<Self> {
        let count = read_var_len(buf)?;
        let mut entries = Vec::with_capacity(count);
        for _ in 0..count {
            let user_id = read_var_string(buf)?;
            let clock = read_var_u64(buf)?;
            let json = read_var_string(buf)?;
            let state: Option<UserPresence> = serde_json::from_str(&json)
                .map_err(|e| Error::Serialization(format!("invalid awareness state for {}: {}", user_id, e)))?;
            entries.push(AwarenessEntry { user_id, clock, state });
        }
        Ok(Self { entries })
    }
}

/// Users added, updated or removed by one registry mutation
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AwarenessChange {
    pub added: BTreeSet<String>,
    pub updated: BTreeSet<String>,
    pub removed: BTreeSet<String>,
}

impl AwarenessChange {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.updated.is_empty() && self.removed.is_empty()
    }
}

type Listener = Box<dyn Fn(&AwarenessChange) + Send + Sync>;

/// Presence registry for one room
#[derive(Default)]
pub struct AwarenessRegistry {
    states: HashMap<String, AwarenessState>,
    /// Last clock per user, kept after removal so stale updates stay ignored
    clocks: HashMap<String, u64>,
    listeners: Vec<Listener>,
}

impl AwarenessRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a listener called with every non-empty change
    pub fn on_change<F>(&mut self, listener: F)
    where
        F: Fn(&AwarenessChange) + Send + Sync + 'static,
    {
        self.listeners.push(Box::new(listener));
    }

    pub fn get(&self, user_id: &str) -> Option<&AwarenessState> {
        self.states.get(user_id)
    }

    pub fn get_all(&self) -> HashMap<String, AwarenessState> {
        self.states.clone()
    }

    pub fn clock(&self, user_id: &str) -> u64 {
        self.clocks.get(user_id).copied().unwrap_or(0)
    }

    pub fn len(&self) -> usize {
        self.states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }

    /// Replace the state of `user_id`, bumping its clock
    pub fn set_local(
        &mut self,
        user_id: &str,
        presence: UserPresence,
        now: Instant,
    ) -> (AwarenessChange, AwarenessUpdate) {
        let clock = self.clock(user_id) + 1;
        let entry = AwarenessEntry {
            user_id: user_id.to_string(),
            clock,
            state: Some(presence),
        };
        let change = self.apply_entry(entry.clone(), now);
        self.notify(&change);
        (change, AwarenessUpdate { entries: vec![entry] })
    }

    /// Merge `fields` into the current state of `user_id`
    pub fn set_local_fields(
        &mut self,
        user_id: &str,
        fields: UserPresence,
        now: Instant,
    ) -> (AwarenessChange, AwarenessUpdate) {
        let mut presence = self
            .states
            .get(user_id)
            .map(|s| s.presence.clone())
            .unwrap_or_default();
        presence.merge(fields);
        self.set_local(user_id, presence, now)
    }

    /// Remove `user_id`, bumping its clock so peers drop it too
    pub fn remove_local(&mut self, user_id: &str) -> (AwarenessChange, AwarenessUpdate) {
        let mut change = AwarenessChange::default();
        let mut update = AwarenessUpdate::default();
        if self.states.remove(user_id).is_some() {
            let clock = self.clock(user_id) + 1;
            self.clocks.insert(user_id.to_string(), clock);
            change.removed.insert(user_id.to_string());
            update.entries.push(AwarenessEntry {
                user_id: user_id.to_string(),
                clock,
                state: None,
            });
        }
        self.notify(&change);
        (change, update)
    }

    /// Apply a remote delta. Entries with an older clock are ignored; an
    /// equal clock only wins when it removes an existing user.
    pub fn apply_update(&mut self, update: &AwarenessUpdate, now: Instant) -> AwarenessChange {
        let mut change = AwarenessChange::default();
        for entry in &update.entries {
            let one = self.apply_entry(entry.clone(), now);
            change.added.extend(one.added);
            change.updated.extend(one.updated);
            change.removed.extend(one.removed);
        }
        self.notify(&change);
        change
    }

    /// Expire users without a heartbeat for longer than `timeout`
    pub fn sweep(&mut self, now: Instant, timeout: Duration) -> (AwarenessChange, AwarenessUpdate) {
        let expired: Vec<String> = self
            .states
            .iter()
            .filter(|(_, state)| now.saturating_duration_since(state.last_seen) >= timeout)
            .map(|(user, _)| user.clone())
            .collect();

        let mut change = AwarenessChange::default();
        let mut update = AwarenessUpdate::default();
        for user_id in expired {
            self.states.remove(&user_id);
            let clock = self.clock(&user_id) + 1;
            self.clocks.insert(user_id.clone(), clock);
            update.entries.push(AwarenessEntry {
                user_id: user_id.clone(),
                clock,
                state: None,
            });
            change.removed.insert(user_id);
        }
        self.notify(&change);
        (change, update)
    }

    /// Snapshot of every present user, sent to newly joined sessions
    pub fn encode_all(&self) -> AwarenessUpdate {
        let mut entries: Vec<AwarenessEntry> = self
            .states
            .iter()
            .map(|(user_id, state)| AwarenessEntry {
                user_id: user_id.clone(),
                clock: state.clock,
                state: Some(state.presence.clone()),
            })
            .collect();
        entries.sort_by(|a, b| a.user_id.cmp(&b.user_id));
        AwarenessUpdate { entries }
    }

    fn apply_entry(&mut self, entry: AwarenessEntry, now: Instant) -> AwarenessChange {
        let mut change = AwarenessChange::default();
        let current = self.clock(&entry.user_id);
        let exists = self.states.contains_key(&entry.user_id);

        let newer = current < entry.clock;
        let removes_at_same_clock = current == entry.clock && entry.state.is_none() && exists;
        if !newer && !removes_at_same_clock {
            return change;
        }

        self.clocks.insert(entry.user_id.clone(), entry.clock);
        match entry.state {
            None => {
                if self.states.remove(&entry.user_id).is_some() {
                    change.removed.insert(entry.user_id);
                }
            }
            Some(presence) => match self.states.get_mut(&entry.user_id) {
                Some(state) => {
                    state.clock = entry.clock;
                    state.last_seen = now;
                    if state.presence != presence {
                        state.presence = presence;
                        change.updated.insert(entry.user_id);
                    }
                }
                None => {
                    self.states.insert(
                        entry.user_id.clone(),
                        AwarenessState { presence, clock: entry.clock, last_seen: now },
                    );
                    change.added.insert(entry.user_id);
                }
            },
        }
        change
    }

    fn notify(&self, change: &AwarenessChange) {
        if change.is_empty() {
            return;
        }
        for listener in &self.listeners {
            listener(change);
        }
    }
}

impl std::fmt::Debug for AwarenessRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AwarenessRegistry")
            .field("states", &self.states)
            .field("listeners", &self.listeners.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::{Arc, Mutex};

    fn entry(user: &str, clock: u64, state: Option<UserPresence>) -> AwarenessUpdate {
        AwarenessUpdate {
            entries: vec![AwarenessEntry { user_id: user.into(), clock, state }],
        }
    }

    #[test]
    fn test_added_updated_removed() {
        let mut registry = AwarenessRegistry::new();
        let now = Instant::now();

        let change = registry.apply_update(&entry("u1", 1, Some(UserPresence::named("Ann"))), now);
        assert!(change.added.contains("u1"));

        let change = registry.apply_update(&entry("u1", 2, Some(UserPresence::named("Anna"))), now);
        assert!(change.updated.contains("u1"));
        assert_eq!(registry.get("u1").unwrap().presence.display_name.as_deref(), Some("Anna"));

        let change = registry.apply_update(&entry("u1", 3, None), now);
        assert!(change.removed.contains("u1"));
        assert!(registry.get_all().is_empty());
    }

    #[test]
    fn test_stale_clock_ignored() {
        let mut registry = AwarenessRegistry::new();
        let now = Instant::now();
        registry.apply_update(&entry("u1", 5, Some(UserPresence::named("new"))), now);

        let change = registry.apply_update(&entry("u1", 4, Some(UserPresence::named("old"))), now);
        assert!(change.is_empty());
        assert_eq!(registry.get("u1").unwrap().presence.display_name.as_deref(), Some("new"));

        // a removal with an older clock cannot resurrect or remove anything
        assert!(registry.apply_update(&entry("u1", 4, None), now).is_empty());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_equal_clock_removal_wins() {
        let mut registry = AwarenessRegistry::new();
        let now = Instant::now();
        registry.apply_update(&entry("u1", 2, Some(UserPresence::named("a"))), now);
        let change = registry.apply_update(&entry("u1", 2, None), now);
        assert!(change.removed.contains("u1"));
    }

    #[test]
    fn test_heartbeat_refreshes_without_update_event() {
        let mut registry = AwarenessRegistry::new();
        let start = Instant::now();
        registry.apply_update(&entry("u1", 1, Some(UserPresence::named("a"))), start);

        let later = start + Duration::from_secs(20);
        let change = registry.apply_update(&entry("u1", 2, Some(UserPresence::named("a"))), later);
        assert!(change.is_empty());
        assert_eq!(registry.get("u1").unwrap().last_seen, later);

        let (change, _) = registry.sweep(start + Duration::from_secs(40), DEFAULT_AWARENESS_TIMEOUT);
        assert!(change.is_empty());
    }

    #[test]
    fn test_sweep_expires_silent_users() {
        let mut registry = AwarenessRegistry::new();
        let start = Instant::now();
        registry.apply_update(&entry("quiet", 1, Some(UserPresence::named("q"))), start);
        registry.apply_update(
            &entry("chatty", 1, Some(UserPresence::named("c"))),
            start + Duration::from_secs(25),
        );

        let (change, update) = registry.sweep(start + Duration::from_secs(31), DEFAULT_AWARENESS_TIMEOUT);
        assert_eq!(change.removed.iter().collect::<Vec<_>>(), vec!["quiet"]);
        assert_eq!(update.entries.len(), 1);
        assert_eq!(update.entries[0].state, None);
        assert!(registry.get("quiet").is_none());
        assert!(registry.get("chatty").is_some());

        // peers holding the old clock accept the synthetic removal
        let mut peer = AwarenessRegistry::new();
        peer.apply_update(&entry("quiet", 1, Some(UserPresence::named("q"))), start);
        let change = peer.apply_update(&update, start);
        assert!(change.removed.contains("quiet"));
    }

    #[test]
    fn test_set_local_fields_merges() {
        let mut registry = AwarenessRegistry::new();
        let now = Instant::now();
        registry.set_local("u1", UserPresence::named("Ann").with_color("#ff0000"), now);

        let fields = UserPresence::default().with_field("cursor", json!({"anchor": 3, "head": 5}));
        let (change, update) = registry.set_local_fields("u1", fields, now);
        assert!(change.updated.contains("u1"));
        assert_eq!(update.entries[0].clock, 2);

        let state = registry.get("u1").unwrap();
        assert_eq!(state.presence.display_name.as_deref(), Some("Ann"));
        assert_eq!(state.presence.cursor_color.as_deref(), Some("#ff0000"));
        assert_eq!(state.presence.custom_fields["cursor"]["head"], json!(5));

        let clear = UserPresence::default().with_field("cursor", Value::Null);
        registry.set_local_fields("u1", clear, now);
        assert!(!registry.get("u1").unwrap().presence.custom_fields.contains_key("cursor"));
    }

    #[test]
    fn test_remove_local_bumps_clock() {
        let mut registry = AwarenessRegistry::new();
        let now = Instant::now();
        registry.set_local("u1", UserPresence::named("a"), now);
        let (change, update) = registry.remove_local("u1");
        assert!(change.removed.contains("u1"));
        assert_eq!(update.entries[0].clock, 2);

        // removing an absent user is a no-op
        let (change, update) = registry.remove_local("u1");
        assert!(change.is_empty());
        assert!(update.is_empty());
    }

    #[test]
    fn test_on_change_listener() {
        let mut registry = AwarenessRegistry::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        registry.on_change(move |change| sink.lock().unwrap().push(change.clone()));

        let now = Instant::now();
        registry.set_local("u1", UserPresence::named("a"), now);
        registry.set_local("u1", UserPresence::named("a"), now);
        registry.remove_local("u1");

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 2);
        assert!(seen[0].added.contains("u1"));
        assert!(seen[1].removed.contains("u1"));
    }

    #[test]
    fn test_wire_format_keeps_custom_fields() {
        let update = AwarenessUpdate {
            entries: vec![
                AwarenessEntry {
                    user_id: "u1".into(),
                    clock: 3,
                    state: Some(UserPresence::named("Ann").with_field("cursor", json!({"head": 1}))),
                },
                AwarenessEntry { user_id: "u2".into(), clock: 9, state: None },
            ],
        };
        let bytes = update.encode_to_vec();
        assert_eq!(AwarenessUpdate::decode_from_slice(&bytes).unwrap(), update);
    }

    #[test]
    fn test_decode_rejects_non_object_state() {
        let mut bytes = Vec::new();
        write_var_u64(&mut bytes, 1);
        write_var_string(&mut bytes, "u1");
        write_var_u64(&mut bytes, 1);
        write_var_string(&mut bytes, "[1,2]");
        assert!(AwarenessUpdate::decode_from_slice(&bytes).is_err());
    }
}
