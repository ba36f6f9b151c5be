// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Per-device packet fan-out.
//!
//! A [`Broadcaster`] retains header/config packets for replay and forwards
//! media packets live to every subscriber. Subscribers own a bounded queue;
//! a full queue drops the newest packet rather than blocking the publisher.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use uuid::Uuid;

use super::Packet;

/// Bound on each subscriber's delivery queue.
pub const SUBSCRIBER_QUEUE_CAPACITY: usize = 10;

struct SubscriberSlot {
    tx: mpsc::Sender<Packet>,
    /// Set once the retained headers have been replayed to this subscriber.
    initialized: bool,
}

/// Fan-out actor for one device's packet stream.
///
/// At most one broadcaster is active per device; the
/// [`StreamRelay`](super::StreamRelay) registry enforces that by atomically
/// superseding the previous one on publisher registration.
pub struct Broadcaster {
    id: Uuid,
    headers: Mutex<Vec<Packet>>,
    subscribers: Mutex<HashMap<u64, SubscriberSlot>>,
    next_subscriber: AtomicU64,
    dropped: AtomicU64,
}

impl Broadcaster {
    pub(crate) fn new() -> Self {
        Self {
            id: Uuid::new_v4(),
            headers: Mutex::new(Vec::new()),
            subscribers: Mutex::new(HashMap::new()),
            next_subscriber: AtomicU64::new(1),
            dropped: AtomicU64::new(0),
        }
    }

    /// Instance identity, used to guard registry removal against a newer
    /// publisher having already taken over.
    #[must_use]
    pub fn instance_id(&self) -> Uuid {
        self.id
    }

    /// Number of packets dropped on full subscriber queues.
    #[must_use]
    pub fn dropped_packets(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Distributes a packet.
    ///
    /// Header packets are retained for replay, never delivered directly.
    /// Media packets go to every subscriber; a subscriber that has not yet
    /// received the retained headers gets them first, in original order.
    pub fn broadcast(&self, packet: Packet) {
        if packet.is_header() {
            self.headers.lock().push(packet);
            return;
        }

        let mut subscribers = self.subscribers.lock();
        let mut closed = Vec::new();

        for (id, slot) in subscribers.iter_mut() {
            if !slot.initialized {
                slot.initialized = true;
                let headers = self.headers.lock().clone();
                for header in headers {
                    if !self.offer(slot, header) {
                        closed.push(*id);
                        break;
                    }
                }
            }

            if !self.offer(slot, packet.clone()) {
                closed.push(*id);
            }
        }

        for id in closed {
            subscribers.remove(&id);
        }
    }

    /// Admits a new subscriber.
    pub(crate) fn subscribe(self: &Arc<Self>) -> StreamSubscriber {
        let (tx, rx) = mpsc::channel(SUBSCRIBER_QUEUE_CAPACITY);
        let id = self.next_subscriber.fetch_add(1, Ordering::Relaxed);
        self.subscribers.lock().insert(
            id,
            SubscriberSlot {
                tx,
                initialized: false,
            },
        );

        StreamSubscriber {
            id,
            rx,
            broadcaster: Arc::clone(self),
        }
    }

    pub(crate) fn unsubscribe(&self, id: u64) {
        self.subscribers.lock().remove(&id);
    }

    /// Closes every subscriber's queue.
    pub(crate) fn close_subscribers(&self) {
        self.subscribers.lock().clear();
    }

    /// Number of live subscribers.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().len()
    }

    /// Returns `false` when the subscriber's receiver is gone.
    fn offer(&self, slot: &SubscriberSlot, packet: Packet) -> bool {
        match slot.tx.try_send(packet) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                // Drop-newest: never block the publisher on a slow consumer.
                let total = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                tracing::trace!(dropped = total, "subscriber queue full, dropping packet");
                true
            }
            Err(TrySendError::Closed(_)) => false,
        }
    }
}

impl std::fmt::Debug for Broadcaster {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Broadcaster")
            .field("id", &self.id)
            .field("headers", &self.headers.lock().len())
            .field("subscribers", &self.subscriber_count())
            .finish()
    }
}

/// A live subscription to one device's packet stream.
///
/// Dropping the subscriber deregisters it from the broadcaster; packets
/// already queued are discarded with it.
pub struct StreamSubscriber {
    id: u64,
    rx: mpsc::Receiver<Packet>,
    broadcaster: Arc<Broadcaster>,
}

impl StreamSubscriber {
    /// Receives the next packet.
    ///
    /// Returns `None` once the publisher is gone and the queue is drained.
    pub async fn recv(&mut self) -> Option<Packet> {
        self.rx.recv().await
    }

    /// Non-blocking receive, for draining in tests and polling loops.
    pub fn try_recv(&mut self) -> Option<Packet> {
        self.rx.try_recv().ok()
    }
}

impl Drop for StreamSubscriber {
    fn drop(&mut self) {
        self.broadcaster.unsubscribe(self.id);
    }
}

impl std::fmt::Debug for StreamSubscriber {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamSubscriber").field("id", &self.id).finish()
    }
}
