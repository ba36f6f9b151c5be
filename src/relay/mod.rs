// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Local video redistribution.
//!
//! One publisher per device pushes opaque packets into a
//! [`Broadcaster`]; any number of subscribers receive them. Packets are
//! never decoded — the relay only distinguishes media packets (forwarded
//! live) from header/config packets (retained and replayed to newcomers).
//!
//! Publisher and subscriber roles for a device uid are distinguished by the
//! transport layer (e.g. a `/local/{device_uid}` path plus a role flag);
//! the transport hands packets to [`PublisherHandle::broadcast`] and reads
//! them from [`StreamSubscriber::recv`].

mod broadcaster;
mod registry;

use bytes::Bytes;

pub use broadcaster::{Broadcaster, SUBSCRIBER_QUEUE_CAPACITY, StreamSubscriber};
pub use registry::{PublisherHandle, StreamRelay};

/// Highest type tag that counts as media; anything above is a header/config
/// packet that gets retained and replayed.
pub const MEDIA_TAG_MAX: u8 = 2;

/// An opaque relay packet.
///
/// The payload is reference-counted, so fanning a packet out to many
/// subscribers shares one allocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    /// Transport-assigned type tag.
    pub tag: u8,
    /// Opaque packet bytes.
    pub payload: Bytes,
}

impl Packet {
    /// Creates a packet.
    #[must_use]
    pub fn new(tag: u8, payload: Bytes) -> Self {
        Self { tag, payload }
    }

    /// Returns `true` for header/config packets (retained and replayed).
    #[must_use]
    pub fn is_header(&self) -> bool {
        self.tag > MEDIA_TAG_MAX
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tag_threshold_splits_media_from_headers() {
        assert!(!Packet::new(0, Bytes::new()).is_header());
        assert!(!Packet::new(2, Bytes::new()).is_header());
        assert!(Packet::new(3, Bytes::new()).is_header());
        assert!(Packet::new(200, Bytes::new()).is_header());
    }
}
