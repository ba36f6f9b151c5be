// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Wire model of the camera protocol.
//!
//! The camera speaks a persistent, binary framed protocol whose outer
//! discriminator is the [`Envelope`]: keepalives, requests, and responses.
//! Requests carry a connection-scoped, strictly increasing id; responses
//! echo the originating id and request kind plus a status code.
//!
//! The field layout mirrors the upstream schema definition; the byte-level
//! encoding lives in the transport implementations so that alternative
//! codecs can be swapped in behind the
//! [`Transport`](crate::session::Transport) seam.

use serde::{Deserialize, Serialize};

/// Status code reported by the camera on success.
pub const STATUS_OK: u16 = 200;

/// Outer discriminator of a wire message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Envelope {
    /// Connection liveness probe; carries no payload.
    Keepalive,
    /// A request, either ours or camera-initiated (state pushes).
    Request(Request),
    /// A response to a previously sent request.
    Response(Response),
}

impl Envelope {
    /// Returns `true` for keepalive frames (logged at trace level only).
    #[must_use]
    pub fn is_keepalive(&self) -> bool {
        matches!(self, Self::Keepalive)
    }
}

/// Kinds of requests the protocol defines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RequestKind {
    /// Ask the camera for its current sensor readings.
    GetSensorData,
    /// Camera-initiated push of sensor readings.
    PutSensorData,
    /// Start, pause, or stop a stream towards a given URL.
    PutStreaming,
    /// Toggle camera controls (night light).
    PutControl,
    /// Change camera settings (standby).
    PutSettings,
}

/// A request message.
///
/// The id is connection-scoped and assigned at send time by the session;
/// camera-initiated requests arrive with the camera's own ids.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    /// Connection-scoped request id.
    pub id: u32,
    /// The typed payload.
    pub body: RequestBody,
}

impl Request {
    /// Creates a request with an unassigned id.
    #[must_use]
    pub fn new(body: RequestBody) -> Self {
        Self { id: 0, body }
    }

    /// The request kind, derived from the payload.
    #[must_use]
    pub fn kind(&self) -> RequestKind {
        self.body.kind()
    }
}

/// Typed request payloads.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RequestBody {
    /// Query sensor readings.
    GetSensorData {
        /// Request every sensor, not just changed ones.
        all: bool,
    },
    /// Camera-initiated sensor push.
    SensorData(Vec<SensorReading>),
    /// Streaming control.
    Streaming(StreamingRequest),
    /// Camera controls.
    Control(Control),
    /// Camera settings.
    Settings(Settings),
}

impl RequestBody {
    /// The request kind this payload travels under.
    #[must_use]
    pub fn kind(&self) -> RequestKind {
        match self {
            Self::GetSensorData { .. } => RequestKind::GetSensorData,
            Self::SensorData(_) => RequestKind::PutSensorData,
            Self::Streaming(_) => RequestKind::PutStreaming,
            Self::Control(_) => RequestKind::PutControl,
            Self::Settings(_) => RequestKind::PutSettings,
        }
    }
}

/// A response message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    /// Id of the request being answered.
    pub request_id: u32,
    /// Kind of the request being answered.
    pub request_type: RequestKind,
    /// Status code; 200 is success. Absent on malformed responses.
    pub status_code: Option<u16>,
    /// Optional human-readable status text.
    pub status_message: Option<String>,
    /// Sensor readings, for sensor-data responses.
    #[serde(default)]
    pub sensor_data: Vec<SensorReading>,
}

impl Response {
    /// Creates a success response echoing a request.
    #[must_use]
    pub fn ok(request_id: u32, request_type: RequestKind) -> Self {
        Self {
            request_id,
            request_type,
            status_code: Some(STATUS_OK),
            status_message: None,
            sensor_data: Vec::new(),
        }
    }
}

/// Sensor families reported by the camera.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SensorKind {
    /// Ambient temperature, in thousandths of a degree.
    Temperature,
    /// Relative humidity, in thousandths of a percent.
    Humidity,
    /// Night mode flag (value 1 = night).
    Night,
}

/// A single sensor reading.
///
/// Scaled readings use `value_milli` (fixed-point thousandths); flag-like
/// readings use `value`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SensorReading {
    /// The sensor family.
    pub sensor: SensorKind,
    /// Raw integer value, for flags.
    pub value: Option<i32>,
    /// Fixed-point value in thousandths, for scaled readings.
    pub value_milli: Option<i32>,
}

impl SensorReading {
    /// A fixed-point reading in thousandths.
    #[must_use]
    pub fn milli(sensor: SensorKind, value_milli: i32) -> Self {
        Self {
            sensor,
            value: None,
            value_milli: Some(value_milli),
        }
    }

    /// A flag reading.
    #[must_use]
    pub fn flag(sensor: SensorKind, value: i32) -> Self {
        Self {
            sensor,
            value: Some(value),
            value_milli: None,
        }
    }
}

/// Which stream slot of the camera to drive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StreamIdentifier {
    /// The mobile-app slot, reused for local redistribution.
    Mobile,
}

/// Desired streaming state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StreamingStatus {
    /// Start pushing the stream.
    Started,
    /// Pause the stream.
    Paused,
    /// Stop the stream.
    Stopped,
}

/// Streaming control payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamingRequest {
    /// The stream slot to drive.
    pub id: StreamIdentifier,
    /// Where the camera should push the stream.
    pub rtmp_url: String,
    /// Desired state.
    pub status: StreamingStatus,
    /// Attempt counter the camera expects.
    pub attempts: i32,
}

/// Camera control payload.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Control {
    /// Night-light on/off, when present.
    pub night_light: Option<bool>,
}

/// Camera settings payload.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Settings {
    /// Standby (sleep mode) on/off, when present.
    pub sleep_mode: Option<bool>,
}
