// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Device state tracking and fan-out.
//!
//! [`DeviceState`] is an immutable snapshot of a device's optional
//! attributes; [`StateStore`] holds the merged snapshot per device and
//! notifies subscribers of every applied delta.
//!
//! # Examples
//!
//! ```
//! use cradlecast::state::{DeviceState, StateStore};
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let store = StateStore::new();
//!
//! let token = store.subscribe(|uid, delta| {
//!     println!("{uid} changed: {:?}", delta.as_map(false));
//! });
//!
//! store.update("abc123", DeviceState::new().with_is_night(true));
//! store.unsubscribe(token);
//! # }
//! ```

mod device_state;
mod store;

pub use device_state::{DeviceState, StreamRequestState, StreamState};
pub use store::{StateStore, SubscriptionId};
