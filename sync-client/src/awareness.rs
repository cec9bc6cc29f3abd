//! Ephemeral awareness state (presence, cursors, user names).
//!
//! Every client owns one JSON state and a logical clock. Updates are merged
//! last-writer-wins on the clock; a `null` state is a tombstone. Unlike
//! document state, awareness is never persisted and entries of clients that
//! stop refreshing are dropped after a timeout.
//!
//! Update layout (compatible with y-protocols):
//!
//! ```text
//! [count: varuint]
//! count x [client: varuint][clock: varuint][state: varstring JSON, "null" = removed]
//! ```

use duplex_sync_types::{ClientId, Decoder, Encoder, FrameError};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::mpsc;

/// Remote entries older than this are dropped by the outdated sweep.
pub const DEFAULT_OUTDATED_TIMEOUT: Duration = Duration::from_secs(30);

/// Awareness errors.
#[derive(Debug, Error)]
pub enum AwarenessError {
    /// The update is not a valid awareness encoding.
    #[error("malformed awareness update: {0}")]
    Malformed(#[from] FrameError),

    /// A state is not valid JSON.
    #[error("invalid awareness state: {0}")]
    InvalidState(#[from] serde_json::Error),
}

/// Who caused an awareness change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AwarenessOrigin {
    /// The local application or session.
    Local,
    /// An update received from a peer.
    Remote,
    /// The outdated-state sweep.
    Timeout,
}

/// A batch of awareness changes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AwarenessChange {
    /// Clients that gained a state.
    pub added: Vec<ClientId>,
    /// Clients whose state was refreshed (possibly to the same value).
    pub updated: Vec<ClientId>,
    /// Clients whose state was removed.
    pub removed: Vec<ClientId>,
    /// Cause of the change.
    pub origin: AwarenessOrigin,
}

impl AwarenessChange {
    /// Every client touched by this change.
    pub fn changed_clients(&self) -> Vec<ClientId> {
        let mut all =
            Vec::with_capacity(self.added.len() + self.updated.len() + self.removed.len());
        all.extend(&self.added);
        all.extend(&self.updated);
        all.extend(&self.removed);
        all
    }

    fn is_empty(&self) -> bool {
        self.added.is_empty() && self.updated.is_empty() && self.removed.is_empty()
    }
}

#[derive(Debug, Clone, Copy)]
struct Meta {
    clock: u64,
    last_updated: Instant,
}

#[derive(Debug, Default)]
struct Inner {
    states: BTreeMap<ClientId, Value>,
    // Kept after removal so stale updates stay rejected.
    meta: HashMap<ClientId, Meta>,
    listeners: Vec<mpsc::UnboundedSender<AwarenessChange>>,
}

impl Inner {
    fn emit(&mut self, change: AwarenessChange) {
        if change.is_empty() {
            return;
        }
        self.listeners
            .retain(|listener| listener.send(change.clone()).is_ok());
    }
}

/// Awareness registry shared by a document's sessions.
#[derive(Debug)]
pub struct Awareness {
    client_id: ClientId,
    inner: Mutex<Inner>,
}

impl Awareness {
    /// Create a registry for `client_id` with an empty (`{}`) local state.
    pub fn new(client_id: ClientId) -> Self {
        let awareness = Self {
            client_id,
            inner: Mutex::new(Inner::default()),
        };
        awareness.set_local_state(Some(Value::Object(Default::default())));
        awareness
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// The local client id.
    pub fn client_id(&self) -> ClientId {
        self.client_id
    }

    /// Receive every future change. Dropping the receiver unsubscribes.
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<AwarenessChange> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.lock().listeners.push(tx);
        rx
    }

    /// The local state, if set.
    pub fn local_state(&self) -> Option<Value> {
        self.lock().states.get(&self.client_id).cloned()
    }

    /// Snapshot of every known state.
    pub fn states(&self) -> BTreeMap<ClientId, Value> {
        self.lock().states.clone()
    }

    /// Current clock of `client`, if it was ever seen.
    pub fn clock(&self, client: ClientId) -> Option<u64> {
        self.lock().meta.get(&client).map(|m| m.clock)
    }

    /// Replace the local state. `None` marks the local client offline.
    pub fn set_local_state(&self, state: Option<Value>) {
        let mut inner = self.lock();
        let change = Self::set_local_locked(&mut inner, self.client_id, state, Instant::now());
        inner.emit(change);
    }

    /// Set one field of the local state object.
    pub fn set_local_state_field(&self, field: &str, value: Value) {
        let mut state = match self.local_state() {
            Some(Value::Object(map)) => map,
            _ => Default::default(),
        };
        state.insert(field.to_string(), value);
        self.set_local_state(Some(Value::Object(state)));
    }

    fn set_local_locked(
        inner: &mut Inner,
        client_id: ClientId,
        state: Option<Value>,
        now: Instant,
    ) -> AwarenessChange {
        let clock = inner
            .meta
            .get(&client_id)
            .map_or(0, |meta| meta.clock + 1);
        let had_state = inner.states.contains_key(&client_id);

        let mut change = AwarenessChange {
            added: Vec::new(),
            updated: Vec::new(),
            removed: Vec::new(),
            origin: AwarenessOrigin::Local,
        };
        match state {
            Some(value) => {
                inner.states.insert(client_id, value);
                if had_state {
                    change.updated.push(client_id);
                } else {
                    change.added.push(client_id);
                }
            }
            None => {
                inner.states.remove(&client_id);
                if had_state {
                    change.removed.push(client_id);
                }
            }
        }
        inner.meta.insert(
            client_id,
            Meta {
                clock,
                last_updated: now,
            },
        );
        change
    }

    /// Remove the states of `clients`.
    ///
    /// Removing the local client bumps its clock so the tombstone wins over
    /// the last state peers have seen.
    pub fn remove_states(&self, clients: &[ClientId], origin: AwarenessOrigin) {
        let mut inner = self.lock();
        let now = Instant::now();
        let mut removed = Vec::new();
        for &client in clients {
            if inner.states.remove(&client).is_none() {
                continue;
            }
            if client == self.client_id {
                if let Some(meta) = inner.meta.get_mut(&client) {
                    meta.clock += 1;
                    meta.last_updated = now;
                }
            }
            removed.push(client);
        }
        inner.emit(AwarenessChange {
            added: Vec::new(),
            updated: Vec::new(),
            removed,
            origin,
        });
    }

    /// Encode the entries of `clients`. Clients never seen are skipped.
    pub fn encode_update(&self, clients: &[ClientId]) -> Vec<u8> {
        let inner = self.lock();
        let entries: Vec<(ClientId, u64, String)> = clients
            .iter()
            .filter_map(|client| {
                let meta = inner.meta.get(client)?;
                let json = inner
                    .states
                    .get(client)
                    .map_or_else(|| "null".to_string(), Value::to_string);
                Some((*client, meta.clock, json))
            })
            .collect();

        let mut enc = Encoder::new();
        enc.write_var_uint(entries.len() as u64);
        for (client, clock, json) in &entries {
            enc.write_var_uint(*client);
            enc.write_var_uint(*clock);
            enc.write_var_string(json);
        }
        enc.into_bytes()
    }

    /// Encode every client that currently has a state.
    pub fn encode_all(&self) -> Vec<u8> {
        let clients: Vec<ClientId> = self.lock().states.keys().copied().collect();
        self.encode_update(&clients)
    }

    /// Merge an encoded update.
    ///
    /// An entry wins if its clock is newer, or if it is a tombstone with the
    /// same clock as a live state. An entry for a client never seen before is
    /// always accepted. A tombstone for the local client is refused: the
    /// local clock is bumped instead and a local change is emitted so the
    /// session re-announces the local state.
    pub fn apply_update(
        &self,
        update: &[u8],
        origin: AwarenessOrigin,
    ) -> Result<(), AwarenessError> {
        let entries = decode_entries(update)?;

        let now = Instant::now();
        let mut inner = self.lock();
        let mut change = AwarenessChange {
            added: Vec::new(),
            updated: Vec::new(),
            removed: Vec::new(),
            origin,
        };
        let mut reasserted = false;

        for (client, mut clock, state) in entries {
            let known = inner.meta.get(&client).copied();
            let has_state = inner.states.contains_key(&client);

            let accept = match known {
                None => true,
                Some(meta) => {
                    meta.clock < clock || (meta.clock == clock && state.is_none() && has_state)
                }
            };
            if !accept {
                continue;
            }

            let refused = state.is_none() && client == self.client_id && has_state;
            match &state {
                None if refused => clock += 1,
                None => {
                    inner.states.remove(&client);
                }
                Some(value) => {
                    inner.states.insert(client, value.clone());
                }
            }
            inner.meta.insert(
                client,
                Meta {
                    clock,
                    last_updated: now,
                },
            );

            if refused {
                reasserted = true;
            } else if state.is_some() && !has_state {
                change.added.push(client);
            } else if state.is_some() {
                change.updated.push(client);
            } else if has_state {
                change.removed.push(client);
            }
        }

        inner.emit(change);
        if reasserted {
            inner.emit(AwarenessChange {
                added: Vec::new(),
                updated: vec![self.client_id],
                removed: Vec::new(),
                origin: AwarenessOrigin::Local,
            });
        }
        Ok(())
    }

    /// Drop remote clients not refreshed within `timeout` and renew the
    /// local state when it is older than half of it.
    pub fn remove_outdated(&self, timeout: Duration) {
        self.remove_outdated_at(Instant::now(), timeout);
    }

    /// [`remove_outdated`](Self::remove_outdated) against an explicit clock.
    pub fn remove_outdated_at(&self, now: Instant, timeout: Duration) {
        let mut inner = self.lock();

        let local_age = inner
            .meta
            .get(&self.client_id)
            .map(|meta| now.saturating_duration_since(meta.last_updated));
        if let (Some(state), Some(age)) = (inner.states.get(&self.client_id).cloned(), local_age) {
            if age >= timeout / 2 {
                let change = Self::set_local_locked(&mut inner, self.client_id, Some(state), now);
                inner.emit(change);
            }
        }

        let outdated: Vec<ClientId> = inner
            .meta
            .iter()
            .filter(|(client, meta)| {
                **client != self.client_id
                    && now.saturating_duration_since(meta.last_updated) >= timeout
            })
            .map(|(client, _)| *client)
            .filter(|client| inner.states.contains_key(client))
            .collect();
        for client in &outdated {
            inner.states.remove(client);
        }
        inner.emit(AwarenessChange {
            added: Vec::new(),
            updated: Vec::new(),
            removed: outdated,
            origin: AwarenessOrigin::Timeout,
        });
    }
}

fn decode_entries(update: &[u8]) -> Result<Vec<(ClientId, u64, Option<Value>)>, AwarenessError> {
    let mut dec = Decoder::new(update);
    let count = dec.read_var_uint()?;
    let mut entries = Vec::new();
    for _ in 0..count {
        let client = dec.read_var_uint()?;
        let clock = dec.read_var_uint()?;
        let json = dec.read_var_string()?;
        let state = match serde_json::from_str::<Value>(json)? {
            Value::Null => None,
            value => Some(value),
        };
        entries.push((client, clock, state));
    }
    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn drain(rx: &mut mpsc::UnboundedReceiver<AwarenessChange>) -> Vec<AwarenessChange> {
        let mut out = Vec::new();
        while let Ok(change) = rx.try_recv() {
            out.push(change);
        }
        out
    }

    // ===========================================
    // Local State Tests
    // ===========================================

    #[test]
    fn starts_with_empty_local_state() {
        let awareness = Awareness::new(1);
        assert_eq!(awareness.local_state(), Some(json!({})));
        assert_eq!(awareness.clock(1), Some(0));
    }

    #[test]
    fn set_local_state_bumps_clock_and_emits() {
        let awareness = Awareness::new(1);
        let mut rx = awareness.subscribe();

        awareness.set_local_state(Some(json!({"name": "ada"})));

        assert_eq!(awareness.clock(1), Some(1));
        let changes = drain(&mut rx);
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].updated, vec![1]);
        assert_eq!(changes[0].origin, AwarenessOrigin::Local);
    }

    #[test]
    fn set_local_state_field_merges_into_object() {
        let awareness = Awareness::new(1);
        awareness.set_local_state_field("name", json!("ada"));
        awareness.set_local_state_field("cursor", json!(4));
        assert_eq!(
            awareness.local_state(),
            Some(json!({"name": "ada", "cursor": 4}))
        );
    }

    #[test]
    fn clearing_local_state_reports_removal() {
        let awareness = Awareness::new(1);
        let mut rx = awareness.subscribe();
        awareness.set_local_state(None);

        let changes = drain(&mut rx);
        assert_eq!(changes[0].removed, vec![1]);
        assert!(awareness.states().is_empty());
    }

    // ===========================================
    // Merge Tests
    // ===========================================

    #[test]
    fn remote_state_is_added_then_updated() {
        let a = Awareness::new(1);
        let b = Awareness::new(2);
        let mut rx = b.subscribe();

        a.set_local_state(Some(json!({"n": 1})));
        b.apply_update(&a.encode_update(&[1]), AwarenessOrigin::Remote)
            .unwrap();
        a.set_local_state(Some(json!({"n": 2})));
        b.apply_update(&a.encode_update(&[1]), AwarenessOrigin::Remote)
            .unwrap();

        let changes = drain(&mut rx);
        assert_eq!(changes[0].added, vec![1]);
        assert_eq!(changes[0].origin, AwarenessOrigin::Remote);
        assert_eq!(changes[1].updated, vec![1]);
        assert_eq!(b.states().get(&1), Some(&json!({"n": 2})));
    }

    #[test]
    fn initial_state_with_clock_zero_is_accepted() {
        let a = Awareness::new(1);
        let b = Awareness::new(2);
        b.apply_update(&a.encode_update(&[1]), AwarenessOrigin::Remote)
            .unwrap();
        assert_eq!(b.states().get(&1), Some(&json!({})));
    }

    #[test]
    fn stale_update_is_ignored() {
        let a = Awareness::new(1);
        let b = Awareness::new(2);

        a.set_local_state(Some(json!({"v": "old"})));
        let old = a.encode_update(&[1]);
        a.set_local_state(Some(json!({"v": "new"})));
        let new = a.encode_update(&[1]);

        b.apply_update(&new, AwarenessOrigin::Remote).unwrap();
        let mut rx = b.subscribe();
        b.apply_update(&old, AwarenessOrigin::Remote).unwrap();

        assert!(drain(&mut rx).is_empty());
        assert_eq!(b.states().get(&1), Some(&json!({"v": "new"})));
    }

    #[test]
    fn same_clock_tombstone_removes_live_state() {
        let b = Awareness::new(2);
        let mut enc = Encoder::new();
        enc.write_var_uint(1);
        enc.write_var_uint(7);
        enc.write_var_uint(3);
        enc.write_var_string("{\"x\":1}");
        b.apply_update(&enc.into_bytes(), AwarenessOrigin::Remote)
            .unwrap();

        let mut enc = Encoder::new();
        enc.write_var_uint(1);
        enc.write_var_uint(7);
        enc.write_var_uint(3);
        enc.write_var_string("null");
        let mut rx = b.subscribe();
        b.apply_update(&enc.into_bytes(), AwarenessOrigin::Remote)
            .unwrap();

        assert!(!b.states().contains_key(&7));
        assert_eq!(drain(&mut rx)[0].removed, vec![7]);
    }

    #[test]
    fn remote_removal_of_local_client_is_refused() {
        let a = Awareness::new(1);
        let peer = Awareness::new(2);
        peer.apply_update(&a.encode_update(&[1]), AwarenessOrigin::Remote)
            .unwrap();
        peer.remove_states(&[1], AwarenessOrigin::Local);
        let tombstone = peer.encode_update(&[1]);

        // The tombstone carries the same clock as our live state.
        let mut rx = a.subscribe();
        a.apply_update(&tombstone, AwarenessOrigin::Remote).unwrap();

        assert_eq!(a.local_state(), Some(json!({})));
        assert_eq!(a.clock(1), Some(1));
        let changes = drain(&mut rx);
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].origin, AwarenessOrigin::Local);
        assert_eq!(changes[0].updated, vec![1]);

        // Our re-announcement beats the tombstone on the peer.
        peer.apply_update(&a.encode_update(&[1]), AwarenessOrigin::Remote)
            .unwrap();
        assert_eq!(peer.states().get(&1), Some(&json!({})));
    }

    #[test]
    fn local_removal_propagates_as_tombstone() {
        let a = Awareness::new(1);
        let b = Awareness::new(2);
        b.apply_update(&a.encode_update(&[1]), AwarenessOrigin::Remote)
            .unwrap();

        a.remove_states(&[1], AwarenessOrigin::Local);
        assert_eq!(a.clock(1), Some(1));
        b.apply_update(&a.encode_update(&[1]), AwarenessOrigin::Remote)
            .unwrap();

        assert!(!b.states().contains_key(&1));
    }

    #[test]
    fn remove_states_ignores_unknown_clients() {
        let a = Awareness::new(1);
        let mut rx = a.subscribe();
        a.remove_states(&[99], AwarenessOrigin::Local);
        assert!(drain(&mut rx).is_empty());
    }

    #[test]
    fn encode_all_includes_every_live_state() {
        let a = Awareness::new(1);
        let b = Awareness::new(2);
        a.apply_update(&b.encode_update(&[2]), AwarenessOrigin::Remote)
            .unwrap();

        let c = Awareness::new(3);
        c.apply_update(&a.encode_all(), AwarenessOrigin::Remote)
            .unwrap();
        let states = c.states();
        assert!(states.contains_key(&1));
        assert!(states.contains_key(&2));
    }

    // ===========================================
    // Decoding Tests
    // ===========================================

    #[test]
    fn truncated_update_is_rejected() {
        let a = Awareness::new(1);
        let mut update = a.encode_update(&[1]);
        update.pop();
        let b = Awareness::new(2);
        assert!(matches!(
            b.apply_update(&update, AwarenessOrigin::Remote),
            Err(AwarenessError::Malformed(_))
        ));
    }

    #[test]
    fn invalid_json_is_rejected() {
        let mut enc = Encoder::new();
        enc.write_var_uint(1);
        enc.write_var_uint(5);
        enc.write_var_uint(1);
        enc.write_var_string("{not json");
        let b = Awareness::new(2);
        assert!(matches!(
            b.apply_update(&enc.into_bytes(), AwarenessOrigin::Remote),
            Err(AwarenessError::InvalidState(_))
        ));
    }

    // ===========================================
    // Outdated Sweep Tests
    // ===========================================

    #[test]
    fn sweep_drops_stale_remote_clients() {
        let a = Awareness::new(1);
        let b = Awareness::new(2);
        a.apply_update(&b.encode_update(&[2]), AwarenessOrigin::Remote)
            .unwrap();
        let mut rx = a.subscribe();

        let later = Instant::now() + Duration::from_secs(31);
        a.remove_outdated_at(later, DEFAULT_OUTDATED_TIMEOUT);

        assert!(!a.states().contains_key(&2));
        let changes = drain(&mut rx);
        let timeout = changes
            .iter()
            .find(|c| c.origin == AwarenessOrigin::Timeout)
            .unwrap();
        assert_eq!(timeout.removed, vec![2]);
    }

    #[test]
    fn sweep_renews_aging_local_state() {
        let a = Awareness::new(1);
        let later = Instant::now() + Duration::from_secs(16);
        a.remove_outdated_at(later, DEFAULT_OUTDATED_TIMEOUT);

        assert_eq!(a.clock(1), Some(1));
        assert_eq!(a.local_state(), Some(json!({})));
    }

    #[test]
    fn sweep_keeps_fresh_clients() {
        let a = Awareness::new(1);
        let b = Awareness::new(2);
        a.apply_update(&b.encode_update(&[2]), AwarenessOrigin::Remote)
            .unwrap();

        a.remove_outdated(DEFAULT_OUTDATED_TIMEOUT);
        assert!(a.states().contains_key(&2));
        assert_eq!(a.clock(1), Some(0));
    }

    #[test]
    fn dropped_listener_is_pruned() {
        let a = Awareness::new(1);
        let rx = a.subscribe();
        drop(rx);
        a.set_local_state(Some(json!({"x": 1})));
        assert!(a.lock().listeners.is_empty());
    }
}
