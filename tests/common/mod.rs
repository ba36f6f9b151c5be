// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! In-memory transport for driving sessions without a network.

#![allow(dead_code)]

use std::collections::VecDeque;

use parking_lot::Mutex;
use tokio::sync::mpsc;

use cradlecast::error::ProtocolError;
use cradlecast::proto::{Envelope, Request};
use cradlecast::session::{Connector, Transport};

/// Transport backed by channels; the test plays the camera side.
pub struct ChannelTransport {
    incoming: mpsc::UnboundedReceiver<Result<Envelope, ProtocolError>>,
    sent: mpsc::UnboundedSender<Envelope>,
}

impl Transport for ChannelTransport {
    async fn send(&mut self, envelope: Envelope) -> Result<(), ProtocolError> {
        self.sent
            .send(envelope)
            .map_err(|_| ProtocolError::ConnectionFailed("test sink gone".to_string()))
    }

    async fn recv(&mut self) -> Option<Result<Envelope, ProtocolError>> {
        self.incoming.recv().await
    }

    async fn close(&mut self) {}
}

/// The camera-side ends of one [`ChannelTransport`].
pub struct TransportSides {
    /// Feed envelopes into the session as if the camera sent them.
    pub to_session: mpsc::UnboundedSender<Result<Envelope, ProtocolError>>,
    /// Observe envelopes the session sends.
    pub from_session: mpsc::UnboundedReceiver<Envelope>,
}

impl TransportSides {
    /// Next non-keepalive request the session sent.
    pub async fn next_request(&mut self) -> Request {
        loop {
            match self.from_session.recv().await.expect("session connected") {
                Envelope::Request(request) => return request,
                Envelope::Keepalive => {}
                other => panic!("unexpected envelope from session: {other:?}"),
            }
        }
    }

    /// Kills the connection from the camera side.
    pub fn fail_connection(&self) {
        let _ = self
            .to_session
            .send(Err(ProtocolError::ConnectionFailed("lost".to_string())));
    }
}

/// Connector handing out one pre-built transport per attempt.
pub struct ChannelConnector {
    transports: Mutex<VecDeque<ChannelTransport>>,
}

impl Connector for ChannelConnector {
    type Transport = ChannelTransport;

    async fn connect(&self, _reauthorize: bool) -> Result<ChannelTransport, ProtocolError> {
        self.transports
            .lock()
            .pop_front()
            .ok_or_else(|| ProtocolError::ConnectionFailed("no transport left".to_string()))
    }
}

/// Builds a connector good for `attempts` connections, plus the camera-side
/// ends of each.
pub fn channel_connector(attempts: usize) -> (ChannelConnector, Vec<TransportSides>) {
    let mut transports = VecDeque::new();
    let mut sides = Vec::new();

    for _ in 0..attempts {
        let (in_tx, in_rx) = mpsc::unbounded_channel();
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        transports.push_back(ChannelTransport {
            incoming: in_rx,
            sent: out_tx,
        });
        sides.push(TransportSides {
            to_session: in_tx,
            from_session: out_rx,
        });
    }

    (
        ChannelConnector {
            transports: Mutex::new(transports),
        },
        sides,
    )
}
