// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Transport seam for the device session.
//!
//! The session logic only depends on the [`Transport`] and [`Connector`]
//! traits, so tests drive it with in-memory channels and deployments pick a
//! concrete transport. The bundled websocket transport (`ws` feature)
//! carries envelopes as serde-encoded binary frames; the proprietary
//! schema's codec slots in here without touching the session.

use std::future::Future;

use crate::error::ProtocolError;
use crate::proto::Envelope;

/// A connected, framed transport.
pub trait Transport: Send + 'static {
    /// Sends one envelope.
    fn send(
        &mut self,
        envelope: Envelope,
    ) -> impl Future<Output = Result<(), ProtocolError>> + Send;

    /// Receives the next envelope.
    ///
    /// `Some(Err)` with a [frame error](ProtocolError::is_frame_error) marks
    /// a single undecodable frame (the connection stays usable); any other
    /// error is a connection failure. `None` means the peer closed.
    fn recv(&mut self) -> impl Future<Output = Option<Result<Envelope, ProtocolError>>> + Send;

    /// Closes the transport; best-effort.
    fn close(&mut self) -> impl Future<Output = ()> + Send;
}

/// Dials a fresh [`Transport`] for each connection attempt.
pub trait Connector: Send + Sync + 'static {
    /// The transport this connector produces.
    type Transport: Transport;

    /// Establishes a connection.
    ///
    /// `reauthorize` is set on every attempt after the first; the connector
    /// must refresh its credentials unconditionally in that case.
    fn connect(
        &self,
        reauthorize: bool,
    ) -> impl Future<Output = Result<Self::Transport, ProtocolError>> + Send;
}

/// Supplies bearer tokens for the upstream service.
///
/// The REST login/refresh flow lives outside this crate; implementations
/// wrap it and decide how long tokens stay cached.
pub trait TokenSource: Send + Sync + 'static {
    /// Returns a token, refreshing unconditionally when `force` is set.
    fn authorize(&self, force: bool)
    -> impl Future<Output = Result<String, ProtocolError>> + Send;
}

#[cfg(feature = "ws")]
pub use ws::{WsConnector, WsTransport};

#[cfg(feature = "ws")]
mod ws {
    use futures_util::{SinkExt, StreamExt};
    use tokio::net::TcpStream;
    use tokio_tungstenite::tungstenite::ClientRequestBuilder;
    use tokio_tungstenite::tungstenite::http::Uri;
    use tokio_tungstenite::tungstenite::protocol::Message;
    use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

    use super::{Connector, TokenSource, Transport};
    use crate::error::ProtocolError;
    use crate::proto::Envelope;

    /// Websocket transport carrying serde-encoded binary frames.
    pub struct WsTransport {
        stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
    }

    impl Transport for WsTransport {
        async fn send(&mut self, envelope: Envelope) -> Result<(), ProtocolError> {
            let bytes = serde_json::to_vec(&envelope)
                .map_err(|e| ProtocolError::MalformedFrame(e.to_string()))?;
            self.stream
                .send(Message::Binary(bytes.into()))
                .await
                .map_err(ProtocolError::Websocket)
        }

        async fn recv(&mut self) -> Option<Result<Envelope, ProtocolError>> {
            loop {
                match self.stream.next().await? {
                    Ok(Message::Binary(data)) => {
                        return Some(
                            serde_json::from_slice(&data)
                                .map_err(|e| ProtocolError::MalformedFrame(e.to_string())),
                        );
                    }
                    Ok(Message::Close(_)) => return None,
                    // Ping/pong and text frames are transport noise here.
                    Ok(_) => {}
                    Err(err) => return Some(Err(ProtocolError::Websocket(err))),
                }
            }
        }

        async fn close(&mut self) {
            let _ = self.stream.close(None).await;
        }
    }

    /// Dials the camera's websocket endpoint with a bearer token.
    ///
    /// # Examples
    ///
    /// ```ignore
    /// let connector = WsConnector::new(
    ///     format!("wss://api.example.com/focus/cameras/{camera_uid}/user_connect"),
    ///     token_source,
    /// );
    /// ```
    pub struct WsConnector<A> {
        url: String,
        token_source: A,
    }

    impl<A> WsConnector<A> {
        /// Creates a connector for the given endpoint url.
        pub fn new(url: impl Into<String>, token_source: A) -> Self {
            Self {
                url: url.into(),
                token_source,
            }
        }

        /// The endpoint url this connector dials.
        #[must_use]
        pub fn url(&self) -> &str {
            &self.url
        }
    }

    impl<A: TokenSource> Connector for WsConnector<A> {
        type Transport = WsTransport;

        async fn connect(&self, reauthorize: bool) -> Result<WsTransport, ProtocolError> {
            let token = self.token_source.authorize(reauthorize).await?;

            let uri: Uri = self
                .url
                .parse()
                .map_err(|_| ProtocolError::InvalidAddress(self.url.clone()))?;
            let request = ClientRequestBuilder::new(uri)
                .with_header("Authorization", format!("Bearer {token}"));

            tracing::trace!(url = %self.url, "connecting to websocket");
            let (stream, _) = tokio_tungstenite::connect_async(request)
                .await
                .map_err(ProtocolError::Websocket)?;

            tracing::info!(url = %self.url, "connected to websocket");
            Ok(WsTransport { stream })
        }
    }
}
