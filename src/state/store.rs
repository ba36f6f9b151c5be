// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Shared device-state store with change notification.
//!
//! One `StateStore` instance is constructed at assembly time and handed to
//! every consumer; there are no ambient globals. All mutations go through
//! [`StateStore::update`] — concurrent direct mutation bypassing it could
//! lose updates, so snapshots are only ever handed out as immutable `Arc`s.
//!
//! Subscribers receive the *applied delta* of every update (the subset of
//! fields that actually changed) plus a full-snapshot catch-up replay at
//! registration time. Each callback dispatch runs as its own task.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use parking_lot::RwLock;

use super::DeviceState;

/// Opaque token identifying a store subscription.
///
/// Returned by [`StateStore::subscribe`]; pass it to
/// [`StateStore::unsubscribe`] to deregister. Removal is best-effort:
/// already-dispatched notifications may still be delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

impl std::fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Sub({})", self.0)
    }
}

/// Callback invoked with the device uid and the applied state delta.
type StateCallback = Arc<dyn Fn(&str, &DeviceState) + Send + Sync>;

struct StoreInner {
    devices: RwLock<HashMap<String, Arc<DeviceState>>>,
    subscribers: RwLock<HashMap<SubscriptionId, StateCallback>>,
    next_subscription: AtomicU64,
}

/// Shared, mergeable device-state store with publish/subscribe fan-out.
///
/// Cloning is cheap and yields a handle to the same store.
///
/// # Examples
///
/// ```
/// use cradlecast::state::{DeviceState, StateStore};
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() {
/// let store = StateStore::new();
/// store.update("abc123", DeviceState::new().with_temperature_milli(21_000));
/// assert_eq!(store.get_state("abc123").temperature(), Some(21.0));
/// # }
/// ```
#[derive(Clone)]
pub struct StateStore {
    inner: Arc<StoreInner>,
}

impl StateStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(StoreInner {
                devices: RwLock::new(HashMap::new()),
                subscribers: RwLock::new(HashMap::new()),
                next_subscription: AtomicU64::new(1),
            }),
        }
    }

    /// Applies a partial update to a device's state.
    ///
    /// The device entry is created on first reference. Only fields present
    /// in the patch and different from the current value participate in the
    /// merge; when nothing differs the pre-existing snapshot is returned
    /// unchanged by identity (`Arc::ptr_eq`) and no subscriber is notified.
    pub fn update(&self, device_uid: &str, patch: DeviceState) -> Arc<DeviceState> {
        let delta;
        let merged;
        {
            let mut devices = self.inner.devices.write();
            let current = devices
                .entry(device_uid.to_string())
                .or_insert_with(|| Arc::new(DeviceState::new()));

            match current.diff(&patch) {
                None => return Arc::clone(current),
                Some(changed) => {
                    merged = Arc::new(current.merged_with(&changed));
                    *current = Arc::clone(&merged);
                    delta = Arc::new(changed);
                }
            }
        }

        tracing::debug!(device_uid, changed = ?delta.as_map(true), "device state updated");
        self.notify_subscribers(device_uid, &delta);
        merged
    }

    /// Returns the current snapshot of a device.
    ///
    /// Unknown devices read as an empty snapshot.
    #[must_use]
    pub fn get_state(&self, device_uid: &str) -> Arc<DeviceState> {
        self.inner
            .devices
            .read()
            .get(device_uid)
            .cloned()
            .unwrap_or_default()
    }

    /// Stamps a motion event for the device.
    pub fn note_motion(&self, device_uid: &str, at: DateTime<Utc>) {
        self.update(device_uid, DeviceState::new().with_motion_at(at));
    }

    /// Stamps a sound event for the device.
    pub fn note_sound(&self, device_uid: &str, at: DateTime<Utc>) {
        self.update(device_uid, DeviceState::new().with_sound_at(at));
    }

    /// Registers a callback for state changes.
    ///
    /// The current snapshot of every known device is replayed to the new
    /// subscriber asynchronously (catch-up), then every subsequent update's
    /// delta is delivered as it occurs.
    pub fn subscribe<F>(&self, callback: F) -> SubscriptionId
    where
        F: Fn(&str, &DeviceState) + Send + Sync + 'static,
    {
        let id = SubscriptionId(self.inner.next_subscription.fetch_add(1, Ordering::Relaxed));
        let callback: StateCallback = Arc::new(callback);
        self.inner
            .subscribers
            .write()
            .insert(id, Arc::clone(&callback));

        let snapshot: Vec<(String, Arc<DeviceState>)> = self
            .inner
            .devices
            .read()
            .iter()
            .map(|(uid, state)| (uid.clone(), Arc::clone(state)))
            .collect();

        tokio::spawn(async move {
            for (uid, state) in snapshot {
                callback(&uid, &state);
            }
        });

        id
    }

    /// Deregisters a subscription.
    ///
    /// Returns `true` if the subscription existed.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.inner.subscribers.write().remove(&id).is_some()
    }

    /// Number of registered subscribers.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.inner.subscribers.read().len()
    }

    fn notify_subscribers(&self, device_uid: &str, delta: &Arc<DeviceState>) {
        let callbacks: Vec<StateCallback> =
            self.inner.subscribers.read().values().cloned().collect();

        for callback in callbacks {
            let uid = device_uid.to_string();
            let delta = Arc::clone(delta);
            tokio::spawn(async move {
                callback(&uid, &delta);
            });
        }
    }
}

impl Default for StateStore {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for StateStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateStore")
            .field("devices", &self.inner.devices.read().len())
            .field("subscribers", &self.subscriber_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::sync::mpsc;

    use super::*;
    use crate::state::StreamState;

    #[tokio::test]
    async fn unchanged_update_returns_same_snapshot_by_identity() {
        let store = StateStore::new();
        let patch = DeviceState::new().with_temperature_milli(20_000);

        let first = store.update("abc123", patch.clone());
        let second = store.update("abc123", patch.clone());
        let third = store.update("abc123", patch);

        assert!(!Arc::ptr_eq(&first, &Arc::new(DeviceState::new())));
        assert!(Arc::ptr_eq(&first, &second));
        assert!(Arc::ptr_eq(&second, &third));
    }

    #[tokio::test]
    async fn serialized_updates_combine_last_write_wins() {
        let store = StateStore::new();

        store.update("abc123", DeviceState::new().with_temperature_milli(20_000));
        store.update(
            "abc123",
            DeviceState::new()
                .with_humidity_milli(40_000)
                .with_is_night(false),
        );
        store.update("abc123", DeviceState::new().with_temperature_milli(21_000));
        store.update("abc123", DeviceState::new().with_is_night(true));

        let state = store.get_state("abc123");
        assert_eq!(state.temperature(), Some(21.0));
        assert_eq!(state.humidity(), Some(40.0));
        assert_eq!(state.is_night(), Some(true));
    }

    #[tokio::test]
    async fn unknown_device_reads_empty() {
        let store = StateStore::new();
        let state = store.get_state("nope");
        assert_eq!(state.temperature(), None);
        assert!(!state.websocket_alive());
    }

    #[tokio::test]
    async fn subscriber_receives_applied_delta() {
        let store = StateStore::new();
        let (tx, mut rx) = mpsc::unbounded_channel();

        store.subscribe(move |uid, delta| {
            let _ = tx.send((uid.to_string(), delta.clone()));
        });

        store.update(
            "abc123",
            DeviceState::new()
                .with_temperature_milli(20_000)
                .with_humidity_milli(40_000),
        );
        // Second update repeats temperature; only humidity changes.
        store.update(
            "abc123",
            DeviceState::new()
                .with_temperature_milli(20_000)
                .with_humidity_milli(41_000),
        );

        let (uid, delta) = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("notification")
            .expect("open channel");
        assert_eq!(uid, "abc123");
        assert_eq!(delta.temperature(), Some(20.0));

        let (_, delta) = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("notification")
            .expect("open channel");
        assert_eq!(delta.temperature(), None);
        assert_eq!(delta.humidity(), Some(41.0));
    }

    #[tokio::test]
    async fn no_change_update_does_not_notify() {
        let store = StateStore::new();
        let (tx, mut rx) = mpsc::unbounded_channel();

        store.update("abc123", DeviceState::new().with_standby(true));
        store.subscribe(move |uid, delta| {
            let _ = tx.send((uid.to_string(), delta.clone()));
        });

        // Catch-up replay of the known device arrives first.
        let (uid, _) = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("catch-up")
            .expect("open channel");
        assert_eq!(uid, "abc123");

        // An update changing nothing must stay silent.
        store.update("abc123", DeviceState::new().with_standby(true));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn new_subscriber_gets_catch_up_replay() {
        let store = StateStore::new();
        store.update("cam-a", DeviceState::new().with_temperature_milli(19_000));
        store.update("cam-b", DeviceState::new().with_is_night(true));

        let (tx, mut rx) = mpsc::unbounded_channel();
        store.subscribe(move |uid, state| {
            let _ = tx.send((uid.to_string(), state.clone()));
        });

        let mut seen = Vec::new();
        for _ in 0..2 {
            let (uid, _) = tokio::time::timeout(Duration::from_secs(1), rx.recv())
                .await
                .expect("catch-up")
                .expect("open channel");
            seen.push(uid);
        }
        seen.sort();
        assert_eq!(seen, vec!["cam-a", "cam-b"]);
    }

    #[tokio::test]
    async fn unsubscribe_stops_delivery() {
        let store = StateStore::new();
        let (tx, mut rx) = mpsc::unbounded_channel();

        let id = store.subscribe(move |uid, _| {
            let _ = tx.send(uid.to_string());
        });
        assert!(store.unsubscribe(id));
        assert!(!store.unsubscribe(id));

        store.update("abc123", DeviceState::new().with_standby(false));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn event_notes_flow_through_update() {
        let store = StateStore::new();
        let at = Utc::now();
        store.note_motion("abc123", at);
        store.note_sound("abc123", at);

        let state = store.get_state("abc123");
        assert_eq!(state.motion_at().map(|t| t.timestamp()), Some(at.timestamp()));
        assert_eq!(state.sound_at().map(|t| t.timestamp()), Some(at.timestamp()));
    }

    #[tokio::test]
    async fn internal_fields_merge_like_any_other() {
        let store = StateStore::new();
        store.update(
            "abc123",
            DeviceState::new().with_stream_state(StreamState::Alive),
        );
        store.update("abc123", DeviceState::new().with_websocket_alive(true));

        let state = store.get_state("abc123");
        assert_eq!(state.stream_state(), StreamState::Alive);
        assert!(state.websocket_alive());
    }
}
