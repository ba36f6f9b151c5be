// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Streaming control towards the camera.
//!
//! Cameras push their stream to a URL we hand them; this module drives the
//! request loop. A camera that hit its app-connection limit answers with a
//! recognizable rejection, which warrants a long cooldown before asking
//! again rather than the session-level backoff.

use std::time::Duration;

use crate::error::Error;
use crate::proto::{RequestBody, StreamIdentifier, StreamingRequest, StreamingStatus};
use crate::state::{DeviceState, StateStore, StreamRequestState, StreamState};
use crate::supervise::Scope;

use super::connection::Connection;

/// Rejection text the camera sends when its app-connection slots are full.
pub const CONNECTION_LIMIT_MESSAGE: &str =
    "Forbidden: Number of Mobile App connections above limit, declining connection";

/// How long each streaming request may wait for its response.
pub const STREAMING_AWAIT_TIMEOUT: Duration = Duration::from_secs(30);

/// Cooldown after the camera declined for being over its connection limit.
pub const CONNECTION_LIMIT_COOLDOWN: Duration = Duration::from_secs(300);

/// Requests the camera to start, pause, or stop streaming to `target_url`.
///
/// Retries on timeout while the session is alive and waits out
/// [`CONNECTION_LIMIT_COOLDOWN`] when the camera is over its connection
/// limit. The outcome is recorded in the device's stream-request state;
/// other rejections end the loop and leave recovery to the stream-health
/// watchdog.
pub async fn request_streaming(
    device_uid: &str,
    target_url: &str,
    status: StreamingStatus,
    connection: &Connection,
    store: &StateStore,
    scope: &Scope,
) {
    loop {
        match status {
            StreamingStatus::Started => {
                tracing::info!(target = target_url, "requesting local streaming");
            }
            StreamingStatus::Paused => {
                tracing::info!(target = target_url, "pausing local streaming");
            }
            StreamingStatus::Stopped => {
                tracing::info!(target = target_url, "stopping local streaming");
            }
        }

        let awaiter = connection.send_request(RequestBody::Streaming(StreamingRequest {
            id: StreamIdentifier::Mobile,
            rtmp_url: target_url.to_string(),
            status,
            attempts: 1,
        }));

        let result = tokio::select! {
            () = scope.cancelled() => return,
            result = awaiter.wait(STREAMING_AWAIT_TIMEOUT) => result,
        };

        match result {
            Ok(_) => {
                tracing::info!("local streaming successfully requested");
                store.update(
                    device_uid,
                    DeviceState::new().with_stream_request_state(StreamRequestState::Requested),
                );
                return;
            }
            Err(err) => match &err {
                Error::RequestRejected { message, .. } if message == CONNECTION_LIMIT_MESSAGE => {
                    tracing::warn!(
                        error = %err,
                        "too many app connections, waiting for a connection to become available"
                    );
                    store.update(
                        device_uid,
                        DeviceState::new()
                            .with_stream_request_state(StreamRequestState::RequestFailed),
                    );
                    tokio::select! {
                        () = scope.cancelled() => return,
                        () = tokio::time::sleep(CONNECTION_LIMIT_COOLDOWN) => {}
                    }
                }
                Error::RequestTimeout(_) => {
                    if !store.get_state(device_uid).websocket_alive() {
                        return;
                    }
                    tracing::warn!("streaming request timeout, trying again");
                }
                _ => {
                    match store.get_state(device_uid).stream_state() {
                        StreamState::Alive => {
                            tracing::info!(
                                error = %err,
                                "failed to request local streaming, but stream seems to be alive from previous run"
                            );
                        }
                        StreamState::Unhealthy => {
                            tracing::error!(
                                error = %err,
                                "failed to request local streaming and stream seems to be dead"
                            );
                            store.update(
                                device_uid,
                                DeviceState::new()
                                    .with_stream_request_state(StreamRequestState::RequestFailed),
                            );
                        }
                        StreamState::Unknown => {
                            tracing::warn!(
                                error = %err,
                                "failed to request local streaming, awaiting stream health check"
                            );
                            store.update(
                                device_uid,
                                DeviceState::new()
                                    .with_stream_request_state(StreamRequestState::RequestFailed),
                            );
                        }
                    }
                    return;
                }
            },
        }
    }
}
