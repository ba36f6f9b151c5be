// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Persistent device sessions.
//!
//! A session owns one framed protocol connection at a time and keeps it
//! alive forever: connects through a [`Connector`], correlates requests with
//! responses on the [`Connection`], and reconnects with escalating cooldowns
//! when the transport drops. Consumers hook in through
//! [`SessionManager::on_ready`], which runs their handler once per
//! established connection.
//!
//! The concrete transport is pluggable; the `ws` feature ships a
//! tokio-tungstenite implementation ([`WsConnector`]).

mod connection;
mod manager;
mod streaming;
mod transport;

pub use connection::{Connection, ResponseAwaiter};
pub use manager::{KEEPALIVE_INTERVAL, SessionManager, session_retry_policy};
pub use streaming::{
    CONNECTION_LIMIT_COOLDOWN, CONNECTION_LIMIT_MESSAGE, STREAMING_AWAIT_TIMEOUT,
    request_streaming,
};
pub use transport::{Connector, TokenSource, Transport};

#[cfg(feature = "ws")]
pub use transport::{WsConnector, WsTransport};
