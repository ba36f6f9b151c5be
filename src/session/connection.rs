// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! A ready connection: outbox, request correlation, message fan-out.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tokio::sync::{mpsc, oneshot};

use crate::error::{Error, ProtocolError, Result};
use crate::proto::{Envelope, Request, RequestBody, RequestKind, Response, STATUS_OK};

/// Handler invoked for every incoming envelope.
type MessageHandler = dyn Fn(&Envelope, &Connection) + Send + Sync;

struct PendingRequest {
    /// Kind of the originating request, for type-matched correlation.
    kind: RequestKind,
    tx: oneshot::Sender<Response>,
}

type PendingTable = Mutex<HashMap<u32, PendingRequest>>;

/// A ready protocol connection.
///
/// Lives for one connection lifetime; the session manager hands it to ready
/// handlers and drops it on disconnect. Request ids are connection-scoped
/// and strictly increasing.
pub struct Connection {
    outbox: mpsc::UnboundedSender<Envelope>,
    pending: Arc<PendingTable>,
    last_request_id: AtomicU32,
    handlers: RwLock<Vec<Arc<MessageHandler>>>,
}

impl Connection {
    pub(crate) fn new(outbox: mpsc::UnboundedSender<Envelope>) -> Self {
        Self {
            outbox,
            pending: Arc::new(Mutex::new(HashMap::new())),
            last_request_id: AtomicU32::new(0),
            handlers: RwLock::new(Vec::new()),
        }
    }

    /// Registers a handler called for every incoming envelope.
    ///
    /// Handlers run on the session read loop and must not block.
    pub fn register_message_handler<F>(&self, handler: F)
    where
        F: Fn(&Envelope, &Connection) + Send + Sync + 'static,
    {
        self.handlers.write().push(Arc::new(handler));
    }

    /// Low-level send of a raw envelope.
    ///
    /// Use [`Connection::send_request`] for requests that expect a response.
    pub fn send_message(&self, envelope: Envelope) {
        if envelope.is_keepalive() {
            tracing::trace!(data = ?envelope, "sending message");
        } else {
            tracing::debug!(data = ?envelope, "sending message");
        }

        if self.outbox.send(envelope).is_err() {
            tracing::debug!("outbox closed, message dropped");
        }
    }

    /// Sends a request and returns an awaiter for the matching response.
    ///
    /// The awaiter blocks its caller until the response arrives or the
    /// caller-supplied timeout elapses; exactly one of the two wins and the
    /// other becomes a silent no-op.
    pub fn send_request(&self, body: RequestBody) -> ResponseAwaiter {
        let id = self.last_request_id.fetch_add(1, Ordering::Relaxed) + 1;
        let request = Request { id, body };
        let kind = request.kind();

        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(id, PendingRequest { kind, tx });

        self.send_message(Envelope::Request(request));

        ResponseAwaiter {
            id,
            rx,
            pending: Arc::clone(&self.pending),
        }
    }

    /// Number of requests still awaiting a response.
    #[must_use]
    pub fn pending_requests(&self) -> usize {
        self.pending.lock().len()
    }

    /// Routes one incoming envelope: correlates responses, then fans out to
    /// the registered message handlers.
    pub(crate) fn handle_envelope(&self, envelope: &Envelope) {
        if envelope.is_keepalive() {
            tracing::trace!(data = ?envelope, "received message");
        } else {
            tracing::debug!(data = ?envelope, "received message");
        }

        if let Envelope::Response(response) = envelope {
            self.handle_response(response);
        }

        let handlers: Vec<Arc<MessageHandler>> = self.handlers.read().iter().cloned().collect();
        for handler in handlers {
            handler(envelope, self);
        }
    }

    fn handle_response(&self, response: &Response) {
        let entry = {
            let mut pending = self.pending.lock();
            match pending.get(&response.request_id) {
                Some(candidate) if candidate.kind == response.request_type => {
                    pending.remove(&response.request_id)
                }
                _ => None,
            }
        };

        if let Some(entry) = entry {
            // A no-op when the awaiter already timed out and went away.
            let _ = entry.tx.send(response.clone());
        }
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("pending_requests", &self.pending_requests())
            .field("last_request_id", &self.last_request_id.load(Ordering::Relaxed))
            .finish()
    }
}

/// Awaits the response to one request.
///
/// Returned by [`Connection::send_request`]; consumed by
/// [`ResponseAwaiter::wait`].
pub struct ResponseAwaiter {
    id: u32,
    rx: oneshot::Receiver<Response>,
    pending: Arc<PendingTable>,
}

impl ResponseAwaiter {
    /// The id assigned to the request.
    #[must_use]
    pub fn request_id(&self) -> u32 {
        self.id
    }

    /// Blocks until the matching response arrives or `timeout` elapses.
    ///
    /// On timeout the pending entry is removed, so repeated timeouts never
    /// leak table entries. Non-200 responses come back as
    /// [`Error::RequestRejected`] carrying the device's status message;
    /// a response without a status code is [`Error::MalformedResponse`].
    pub async fn wait(self, timeout: Duration) -> Result<Response> {
        #[allow(clippy::cast_possible_truncation)]
        let timeout_ms = timeout.as_millis() as u64;

        match tokio::time::timeout(timeout, self.rx).await {
            Err(_) => {
                self.pending.lock().remove(&self.id);
                Err(Error::RequestTimeout(timeout_ms))
            }
            Ok(Err(_)) => Err(ProtocolError::ConnectionFailed(
                "connection closed while awaiting response".to_string(),
            )
            .into()),
            Ok(Ok(response)) => match response.status_code {
                None => Err(Error::MalformedResponse(
                    "response carries no status code".to_string(),
                )),
                Some(STATUS_OK) => Ok(response),
                Some(status) => {
                    let message = response
                        .status_message
                        .clone()
                        .unwrap_or_else(|| format!("unexpected status code {status}"));
                    Err(Error::RequestRejected { status, message })
                }
            },
        }
    }
}

impl std::fmt::Debug for ResponseAwaiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResponseAwaiter").field("id", &self.id).finish()
    }
}
