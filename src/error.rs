// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Error types for the `cradlecast` library.
//!
//! The taxonomy separates transport-level failures (recovered by the retry
//! supervisor) from request-level failures (returned to the single awaiting
//! caller) and from the cancellation sentinel (terminal, never retried).

use thiserror::Error;

/// The main error type for this library.
#[derive(Debug, Error)]
pub enum Error {
    /// Error occurred at the transport/protocol layer.
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// No response arrived within the caller-supplied deadline.
    ///
    /// Scoped to the single awaiting caller; the connection and other
    /// in-flight requests are unaffected.
    #[error("request timed out after {0} ms")]
    RequestTimeout(u64),

    /// The device answered with a non-200 status.
    ///
    /// Carries the device's status message so callers can special-case
    /// known rejections (e.g. the connection-limit text).
    #[error("request rejected: {message}")]
    RequestRejected {
        /// Status code reported by the device.
        status: u16,
        /// Status message reported by the device, if any.
        message: String,
    },

    /// The response did not carry a status code.
    #[error("malformed response: {0}")]
    MalformedResponse(String),

    /// Voluntary shutdown sentinel.
    ///
    /// Marks a cancelled subtree; never retried.
    #[error("cancelled execution")]
    Cancelled,
}

impl Error {
    /// Returns `true` if this is the cancellation sentinel.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    /// Returns the device's rejection message, if this is a rejection.
    #[must_use]
    pub fn rejection_message(&self) -> Option<&str> {
        match self {
            Self::RequestRejected { message, .. } => Some(message),
            _ => None,
        }
    }
}

/// Errors related to transport and framing.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Connection to the camera or broker failed.
    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    /// A frame could not be decoded.
    ///
    /// Logged and dropped by the session read loop; does not by itself
    /// close the connection.
    #[error("malformed frame: {0}")]
    MalformedFrame(String),

    /// Authentication with the upstream service failed.
    #[error("authentication failed: {0}")]
    Authentication(String),

    /// Invalid URL or address.
    #[error("invalid address: {0}")]
    InvalidAddress(String),

    /// Websocket transport error.
    #[cfg(feature = "ws")]
    #[error("websocket error: {0}")]
    Websocket(#[from] tokio_tungstenite::tungstenite::Error),

    /// MQTT connection or communication failed.
    #[cfg(feature = "mqtt")]
    #[error("MQTT error: {0}")]
    Mqtt(#[from] rumqttc::ClientError),
}

impl ProtocolError {
    /// Returns `true` if the error only affects a single frame.
    #[must_use]
    pub fn is_frame_error(&self) -> bool {
        matches!(self, Self::MalformedFrame(_))
    }
}

/// A specialized Result type for this library.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeout_display() {
        let err = Error::RequestTimeout(30_000);
        assert_eq!(err.to_string(), "request timed out after 30000 ms");
    }

    #[test]
    fn rejection_display_carries_message() {
        let err = Error::RequestRejected {
            status: 403,
            message: "declined".to_string(),
        };
        assert_eq!(err.to_string(), "request rejected: declined");
        assert_eq!(err.rejection_message(), Some("declined"));
    }

    #[test]
    fn cancelled_is_sentinel() {
        assert!(Error::Cancelled.is_cancelled());
        assert!(!Error::RequestTimeout(1).is_cancelled());
    }

    #[test]
    fn error_from_protocol_error() {
        let proto = ProtocolError::ConnectionFailed("refused".to_string());
        let err: Error = proto.into();
        assert!(matches!(
            err,
            Error::Protocol(ProtocolError::ConnectionFailed(_))
        ));
    }

    #[test]
    fn frame_errors_are_recoverable() {
        assert!(ProtocolError::MalformedFrame("bad tag".to_string()).is_frame_error());
        assert!(!ProtocolError::ConnectionFailed("gone".to_string()).is_frame_error());
    }
}
