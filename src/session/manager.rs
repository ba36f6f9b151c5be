// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Persistent device session with reconnection.
//!
//! A [`SessionManager`] drives the `Disconnected → Connecting → Ready`
//! lifecycle: one retry-supervisor attempt per connection lifetime, a
//! keepalive ticker while Ready, liveness flags into the state store, and a
//! ready-handler registry whose handlers run as supervised children of the
//! connection — once per established connection, again on every reconnect.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::error::{Error, Result};
use crate::proto::Envelope;
use crate::state::{DeviceState, StateStore};
use crate::supervise::{Attempt, RetryPolicy, Scope, run_with_retry};

use super::connection::Connection;
use super::transport::{Connector, Transport};

/// Keepalive cadence while a connection is Ready.
pub const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(20);

/// Reconnect policy for device sessions: quick retry after long-lived
/// connections, escalating cooldowns under sustained failure.
#[must_use]
pub fn session_retry_policy() -> RetryPolicy {
    RetryPolicy::new(
        vec![
            Duration::from_secs(30),
            Duration::from_secs(2 * 60),
            Duration::from_secs(15 * 60),
            Duration::from_secs(60 * 60),
        ],
        Duration::from_secs(2),
    )
}

type BoxedReadyFuture = Pin<Box<dyn Future<Output = Result<()>> + Send>>;
type ReadyHandler = Arc<dyn Fn(Arc<Connection>, Scope) -> BoxedReadyFuture + Send + Sync>;

#[derive(Clone)]
struct ReadyConnection {
    connection: Arc<Connection>,
    scope: Scope,
}

#[derive(Default)]
struct ReadyState {
    handlers: Vec<ReadyHandler>,
    current: Option<ReadyConnection>,
}

struct SessionInner<C> {
    device_uid: String,
    camera_uid: String,
    connector: C,
    store: StateStore,
    ready: Mutex<ReadyState>,
}

/// Manager for one device's persistent protocol session.
///
/// Cloning yields another handle to the same session.
///
/// # Examples
///
/// ```ignore
/// let session = SessionManager::new("abc123", "cam-uid", connector, store.clone());
///
/// session.on_ready(|connection, scope| async move {
///     let _ = connection.send_request(RequestBody::GetSensorData { all: true });
///     scope.cancelled().await;
///     Ok(())
/// });
///
/// scope.spawn(move |child| async move {
///     session.run(&child).await;
///     Ok(())
/// });
/// ```
pub struct SessionManager<C> {
    inner: Arc<SessionInner<C>>,
}

impl<C> Clone for SessionManager<C> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<C: Connector> SessionManager<C> {
    /// Creates a session manager for one device.
    ///
    /// A keepalive handler is registered up front; it ticks every
    /// [`KEEPALIVE_INTERVAL`] while a connection is Ready.
    pub fn new(
        device_uid: impl Into<String>,
        camera_uid: impl Into<String>,
        connector: C,
        store: StateStore,
    ) -> Self {
        let manager = Self {
            inner: Arc::new(SessionInner {
                device_uid: device_uid.into(),
                camera_uid: camera_uid.into(),
                connector,
                store,
                ready: Mutex::new(ReadyState::default()),
            }),
        };

        manager.on_ready(|connection, scope| async move {
            let mut ticker = tokio::time::interval(KEEPALIVE_INTERVAL);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            // The first tick completes immediately; the camera does not need
            // a keepalive right after the handshake.
            ticker.tick().await;
            loop {
                tokio::select! {
                    () = scope.cancelled() => return Ok(()),
                    _ = ticker.tick() => connection.send_message(Envelope::Keepalive),
                }
            }
        });

        manager
    }

    /// The device this session belongs to.
    #[must_use]
    pub fn device_uid(&self) -> &str {
        &self.inner.device_uid
    }

    /// Registers a handler invoked on every established connection.
    ///
    /// The handler runs as a supervised child of the connection's lifetime:
    /// exactly once per connection, immediately if a connection is already
    /// Ready, again after every reconnect, and cancelled when the
    /// connection's lifetime ends.
    pub fn on_ready<F, Fut>(&self, handler: F)
    where
        F: Fn(Arc<Connection>, Scope) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let handler: ReadyHandler =
            Arc::new(move |connection, scope| Box::pin(handler(connection, scope)));

        let current = {
            let mut ready = self.inner.ready.lock();
            ready.handlers.push(Arc::clone(&handler));
            ready.current.clone()
        };

        if let Some(ready) = current {
            tracing::debug!(device_uid = %self.inner.device_uid, "immediately notifying ready handler");
            Self::notify_ready_handler(&handler, &ready);
        }
    }

    /// The currently Ready connection, if any.
    #[must_use]
    pub fn current_connection(&self) -> Option<Arc<Connection>> {
        self.inner
            .ready
            .lock()
            .current
            .as_ref()
            .map(|ready| Arc::clone(&ready.connection))
    }

    /// Runs the session's connect/reconnect loop until `scope` is cancelled.
    pub async fn run(&self, scope: &Scope) {
        let runner = format!("session-{}", self.inner.camera_uid);
        let policy = session_retry_policy();
        let manager = self.clone();

        run_with_retry(scope, &runner, &policy, move |attempt| {
            let manager = manager.clone();
            async move { manager.run_once(attempt).await }
        })
        .await;
    }

    async fn run_once(&self, attempt: Attempt) -> Result<()> {
        // Reauthorize unconditionally on every attempt after the first.
        let reauthorize = attempt.try_number() > 1;
        let mut transport = self
            .inner
            .connector
            .connect(reauthorize)
            .await
            .map_err(|err| {
                tracing::error!(
                    camera_uid = %self.inner.camera_uid,
                    error = %err,
                    "unable to establish connection"
                );
                Error::from(err)
            })?;

        let (outbox_tx, mut outbox_rx) = mpsc::unbounded_channel();
        let connection = Arc::new(Connection::new(outbox_tx));
        let ready_connection = ReadyConnection {
            connection: Arc::clone(&connection),
            scope: attempt.scope().clone(),
        };

        let handlers = {
            let mut ready = self.inner.ready.lock();
            ready.current = Some(ready_connection.clone());
            ready.handlers.clone()
        };

        self.inner.store.update(
            &self.inner.device_uid,
            DeviceState::new().with_websocket_alive(true),
        );

        tracing::trace!(num_handlers = handlers.len(), "notifying ready handlers");
        for handler in &handlers {
            Self::notify_ready_handler(handler, &ready_connection);
        }

        let result = self
            .pump(&mut transport, &mut outbox_rx, &connection, attempt.scope())
            .await;

        self.inner.store.update(
            &self.inner.device_uid,
            DeviceState::new().with_websocket_alive(false),
        );
        {
            let mut ready = self.inner.ready.lock();
            if ready
                .current
                .as_ref()
                .is_some_and(|r| Arc::ptr_eq(&r.connection, &connection))
            {
                ready.current = None;
            }
        }

        match &result {
            Ok(()) => tracing::debug!(camera_uid = %self.inner.camera_uid, "closing connection"),
            Err(err) => {
                tracing::error!(camera_uid = %self.inner.camera_uid, error = %err, "disconnected from server");
            }
        }
        transport.close().await;

        result
    }

    /// Single-owner read/write loop for one connection.
    async fn pump<T: Transport>(
        &self,
        transport: &mut T,
        outbox: &mut mpsc::UnboundedReceiver<Envelope>,
        connection: &Arc<Connection>,
        scope: &Scope,
    ) -> Result<()> {
        loop {
            tokio::select! {
                () = scope.cancelled() => return Ok(()),
                outgoing = outbox.recv() => {
                    // The sender half lives in `connection`, which outlives
                    // this loop, so the outbox cannot actually close here.
                    let Some(envelope) = outgoing else { return Ok(()) };
                    transport.send(envelope).await.map_err(Error::from)?;
                }
                incoming = transport.recv() => match incoming {
                    Some(Ok(envelope)) => connection.handle_envelope(&envelope),
                    Some(Err(err)) if err.is_frame_error() => {
                        tracing::error!(error = %err, "received malformed message");
                    }
                    Some(Err(err)) => return Err(err.into()),
                    None => {
                        return Err(crate::error::ProtocolError::ConnectionFailed(
                            "server closed the connection".to_string(),
                        )
                        .into());
                    }
                }
            }
        }
    }

    fn notify_ready_handler(handler: &ReadyHandler, ready: &ReadyConnection) {
        let handler = Arc::clone(handler);
        let connection = Arc::clone(&ready.connection);
        ready.scope.spawn(move |scope| handler(connection, scope));
    }
}

impl<C> std::fmt::Debug for SessionManager<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionManager")
            .field("device_uid", &self.inner.device_uid)
            .field("camera_uid", &self.inner.camera_uid)
            .finish()
    }
}
