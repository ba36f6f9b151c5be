// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! `cradlecast` - A Rust library bridging proprietary nursery cameras to
//! home-automation ecosystems.
//!
//! The library speaks the cameras' binary request/response protocol over a
//! persistent connection, merges their reported state into a shared store,
//! republishes changes over MQTT, and redistributes the raw video stream to
//! local subscribers.
//!
//! # Building Blocks
//!
//! - [`supervise`]: hierarchical cancellation scopes and cooldown-ladder
//!   retry — everything long-lived in the crate runs under them
//! - [`session`]: the persistent device session with request/response
//!   correlation and reconnection
//! - [`state`]: per-device mergeable snapshots with change notification
//! - [`relay`]: single-publisher/multi-subscriber video packet fan-out
//! - [`gateway`]: assembly of the above, one session per device
//! - [`mqtt`] (feature `mqtt`): state publisher and command relay
//!
//! # Quick Start
//!
//! ```no_run
//! use cradlecast::gateway::{DeviceInfo, Gateway, GatewayOptions};
//! use cradlecast::session::WsConnector;
//! use cradlecast::supervise::Scope;
//! # use cradlecast::error::ProtocolError;
//! # use cradlecast::session::TokenSource;
//! # struct StaticToken(String);
//! # impl TokenSource for StaticToken {
//! #     async fn authorize(&self, _force: bool) -> Result<String, ProtocolError> {
//! #         Ok(self.0.clone())
//! #     }
//! # }
//!
//! #[tokio::main]
//! async fn main() {
//!     let mut gateway = Gateway::new(GatewayOptions {
//!         stream_public_addr: Some("192.168.1.10:1935".to_string()),
//!     });
//!
//!     let camera_uid = "cam-uid";
//!     let connector = WsConnector::new(
//!         format!("wss://api.example.com/focus/cameras/{camera_uid}/user_connect"),
//!         StaticToken("token".to_string()),
//!     );
//!     gateway.add_device(DeviceInfo::new("abc123", camera_uid), connector);
//!
//!     let root = Scope::root();
//!     let handle = root.spawn(move |scope| async move {
//!         gateway.run(&scope).await;
//!         Ok(())
//!     });
//!
//!     // Cancelling blocks until every session has torn down.
//!     handle.cancel().await;
//! }
//! ```
//!
//! # Watching State
//!
//! ```
//! use cradlecast::state::{DeviceState, StateStore};
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let store = StateStore::new();
//! store.subscribe(|device_uid, delta| {
//!     for (attribute, value) in delta.as_map(false) {
//!         println!("{device_uid}/{attribute} = {value}");
//!     }
//! });
//!
//! store.update("abc123", DeviceState::new().with_temperature_milli(21_500));
//! # }
//! ```

pub mod error;
pub mod gateway;
#[cfg(feature = "mqtt")]
pub mod mqtt;
pub mod proto;
pub mod relay;
pub mod session;
pub mod state;
pub mod supervise;

pub use error::{Error, ProtocolError, Result};
pub use gateway::{DeviceInfo, Gateway, GatewayOptions};
pub use relay::{Packet, PublisherHandle, StreamRelay, StreamSubscriber};
pub use session::{Connection, Connector, ResponseAwaiter, SessionManager, TokenSource, Transport};
pub use state::{DeviceState, StateStore, StreamRequestState, StreamState, SubscriptionId};
pub use supervise::{Attempt, Outcome, RetryPolicy, Scope, TaskHandle, run_with_retry};
