// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Device-to-broadcaster registry enforcing single-active-publisher.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::state::{DeviceState, StateStore, StreamState};

use super::Packet;
use super::broadcaster::{Broadcaster, StreamSubscriber};

struct RelayInner {
    store: StateStore,
    broadcasters: RwLock<HashMap<String, Arc<Broadcaster>>>,
}

/// Registry routing each device's packet stream from its single publisher
/// to any number of subscribers.
///
/// Registering a publisher atomically supersedes the previous one for that
/// device; the superseded broadcaster's subscribers are torn down
/// asynchronously. Stream liveness is reported into the [`StateStore`].
///
/// # Examples
///
/// ```
/// use bytes::Bytes;
/// use cradlecast::relay::{Packet, StreamRelay};
/// use cradlecast::state::StateStore;
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() {
/// let relay = StreamRelay::new(StateStore::new());
///
/// let publisher = relay.register_publisher("abc123");
/// let mut subscriber = relay.subscribe("abc123").expect("publisher registered");
///
/// publisher.broadcast(Packet::new(1, Bytes::from_static(b"frame")));
/// # }
/// ```
#[derive(Clone)]
pub struct StreamRelay {
    inner: Arc<RelayInner>,
}

impl StreamRelay {
    /// Creates an empty relay reporting liveness into `store`.
    #[must_use]
    pub fn new(store: StateStore) -> Self {
        Self {
            inner: Arc::new(RelayInner {
                store,
                broadcasters: RwLock::new(HashMap::new()),
            }),
        }
    }

    /// Installs a new broadcaster for the device and returns the publisher
    /// handle.
    ///
    /// Any previously registered broadcaster is superseded: its subscribers
    /// are closed asynchronously, without blocking the caller. The device's
    /// stream state transitions to [`StreamState::Alive`].
    pub fn register_publisher(&self, device_uid: &str) -> PublisherHandle {
        let broadcaster = Arc::new(Broadcaster::new());
        let previous = self
            .inner
            .broadcasters
            .write()
            .insert(device_uid.to_string(), Arc::clone(&broadcaster));

        if let Some(previous) = previous {
            tracing::warn!(
                device_uid,
                "device already has an active publisher, closing existing subscribers"
            );
            tokio::spawn(async move {
                previous.close_subscribers();
            });
        }

        tracing::info!(device_uid, "new stream publisher registered");
        self.inner.store.update(
            device_uid,
            DeviceState::new().with_stream_state(StreamState::Alive),
        );

        PublisherHandle {
            relay: self.clone(),
            device_uid: device_uid.to_string(),
            broadcaster,
        }
    }

    /// Attaches a subscriber to the device's current broadcaster.
    ///
    /// Returns `None` definitively when no publisher is registered; the
    /// caller must reject the connection.
    #[must_use]
    pub fn subscribe(&self, device_uid: &str) -> Option<StreamSubscriber> {
        let broadcaster = self.inner.broadcasters.read().get(device_uid).cloned()?;
        tracing::debug!(device_uid, "new stream subscriber attached");
        Some(broadcaster.subscribe())
    }

    /// Returns `true` if a publisher is currently registered for the device.
    #[must_use]
    pub fn has_publisher(&self, device_uid: &str) -> bool {
        self.inner.broadcasters.read().contains_key(device_uid)
    }

    fn close_publisher(&self, device_uid: &str, broadcaster: &Arc<Broadcaster>) {
        self.inner.store.update(
            device_uid,
            DeviceState::new().with_stream_state(StreamState::Unhealthy),
        );

        {
            let mut broadcasters = self.inner.broadcasters.write();
            // Guard against a newer publisher having already taken over.
            if broadcasters
                .get(device_uid)
                .is_some_and(|current| current.instance_id() == broadcaster.instance_id())
            {
                broadcasters.remove(device_uid);
            }
        }

        broadcaster.close_subscribers();
    }
}

impl std::fmt::Debug for StreamRelay {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamRelay")
            .field("broadcasters", &self.inner.broadcasters.read().len())
            .finish()
    }
}

/// Handle held by a device's active publisher.
///
/// Close it when the publisher's transport ends; the device's stream state
/// turns Unhealthy and the subscribers are released. There is no automatic
/// close on drop — a handle that is simply dropped leaves the broadcaster
/// registered until a new publisher supersedes it.
pub struct PublisherHandle {
    relay: StreamRelay,
    device_uid: String,
    broadcaster: Arc<Broadcaster>,
}

impl PublisherHandle {
    /// Distributes a packet to the device's subscribers.
    pub fn broadcast(&self, packet: Packet) {
        self.broadcaster.broadcast(packet);
    }

    /// The device this publisher feeds.
    #[must_use]
    pub fn device_uid(&self) -> &str {
        &self.device_uid
    }

    /// The underlying broadcaster.
    #[must_use]
    pub fn broadcaster(&self) -> &Arc<Broadcaster> {
        &self.broadcaster
    }

    /// Reports the publisher stream as ended.
    ///
    /// Marks the device's stream Unhealthy, removes the broadcaster from
    /// the registry only if it is still the currently registered one, and
    /// closes its subscribers.
    pub fn close(self) {
        tracing::warn!(device_uid = %self.device_uid, "publisher stream closed");
        self.relay.close_publisher(&self.device_uid, &self.broadcaster);
    }
}

impl std::fmt::Debug for PublisherHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PublisherHandle")
            .field("device_uid", &self.device_uid)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use bytes::Bytes;

    use super::*;

    fn media(n: u8) -> Packet {
        Packet::new(1, Bytes::from(vec![n]))
    }

    fn header(n: u8) -> Packet {
        Packet::new(9, Bytes::from(vec![n]))
    }

    #[tokio::test]
    async fn subscribe_without_publisher_is_rejected() {
        let relay = StreamRelay::new(StateStore::new());
        assert!(relay.subscribe("abc123").is_none());
    }

    #[tokio::test]
    async fn headers_replay_to_late_subscriber() {
        let relay = StreamRelay::new(StateStore::new());
        let publisher = relay.register_publisher("abc123");

        publisher.broadcast(header(1));
        publisher.broadcast(header(2));
        publisher.broadcast(media(10));

        let mut sub = relay.subscribe("abc123").expect("publisher registered");
        publisher.broadcast(media(11));

        let received: Vec<u8> = std::iter::from_fn(|| sub.try_recv())
            .map(|p| p.payload[0])
            .collect();
        // The two headers, then only media broadcast after attaching.
        assert_eq!(received, vec![1, 2, 11]);
    }

    #[tokio::test]
    async fn new_publisher_supersedes_and_closes_old_subscribers() {
        let relay = StreamRelay::new(StateStore::new());
        let publisher1 = relay.register_publisher("abc123");
        let mut sub_a = relay.subscribe("abc123").expect("publisher1 registered");

        let publisher2 = relay.register_publisher("abc123");

        // Subscriber A's stream ends once the teardown task runs.
        let closed = tokio::time::timeout(Duration::from_secs(1), sub_a.recv()).await;
        assert_eq!(closed.expect("teardown"), None);

        // New subscribers attach to publisher2 only.
        let mut sub_b = relay.subscribe("abc123").expect("publisher2 registered");
        publisher2.broadcast(media(42));
        assert_eq!(sub_b.try_recv().map(|p| p.payload[0]), Some(42));

        publisher1.broadcast(media(7));
        assert!(sub_b.try_recv().is_none());
    }

    #[tokio::test]
    async fn close_reports_unhealthy_and_rejects_new_subscribers() {
        let store = StateStore::new();
        let relay = StreamRelay::new(store.clone());
        let publisher = relay.register_publisher("abc123");

        assert_eq!(store.get_state("abc123").stream_state(), StreamState::Alive);

        let mut sub = relay.subscribe("abc123").expect("publisher registered");
        publisher.close();

        assert_eq!(
            store.get_state("abc123").stream_state(),
            StreamState::Unhealthy
        );
        assert!(sub.recv().await.is_none());
        assert!(relay.subscribe("abc123").is_none());
    }

    #[tokio::test]
    async fn stale_close_does_not_remove_new_publisher() {
        let relay = StreamRelay::new(StateStore::new());
        let publisher1 = relay.register_publisher("abc123");
        let _publisher2 = relay.register_publisher("abc123");

        // publisher1's transport fails after publisher2 already took over.
        publisher1.close();

        assert!(relay.has_publisher("abc123"));
        assert!(relay.subscribe("abc123").is_some());
    }

    #[tokio::test]
    async fn publishers_are_isolated_per_device() {
        let relay = StreamRelay::new(StateStore::new());
        let publisher_a = relay.register_publisher("cam-a");
        let _publisher_b = relay.register_publisher("cam-b");

        let mut sub_b = relay.subscribe("cam-b").expect("publisher registered");
        publisher_a.broadcast(media(1));
        assert!(sub_b.try_recv().is_none());
    }
}
