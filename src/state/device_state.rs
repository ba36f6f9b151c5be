// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Per-device state snapshots.
//!
//! A [`DeviceState`] is an immutable record of optional attributes. Partial
//! states double as patches: a field that is absent in a patch never
//! overwrites a present value, only present-and-different fields participate
//! in a merge. The store relies on [`DeviceState::diff`] returning `None` to
//! skip notification and logging entirely when nothing changed.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};

/// Health of a device's outbound video stream.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum StreamState {
    /// No information yet.
    #[default]
    Unknown,
    /// The publisher dropped; the stream needs to be re-requested.
    Unhealthy,
    /// A publisher is actively delivering packets.
    Alive,
}

/// Progress of the most recent streaming request towards the device.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum StreamRequestState {
    /// No streaming request issued yet.
    #[default]
    NotRequested,
    /// The device accepted the streaming request.
    Requested,
    /// The device rejected the streaming request.
    RequestFailed,
}

/// Immutable snapshot of a single device's merged state.
///
/// All fields are optional because state is only known once the device
/// reports it. The connection-liveness and stream-health fields are
/// internal: they drive gateway behavior but are suppressed from externally
/// published views.
///
/// # Examples
///
/// ```
/// use cradlecast::state::DeviceState;
///
/// let patch = DeviceState::new().with_temperature_milli(21_500);
/// assert_eq!(patch.temperature(), Some(21.5));
/// ```
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeviceState {
    // Internal fields, excluded from external views.
    websocket_alive: Option<bool>,
    stream_state: Option<StreamState>,
    stream_request_state: Option<StreamRequestState>,

    // Externally published fields.
    motion_at: Option<DateTime<Utc>>,
    sound_at: Option<DateTime<Utc>>,
    temperature_milli: Option<i32>,
    humidity_milli: Option<i32>,
    is_night: Option<bool>,
    night_light: Option<bool>,
    standby: Option<bool>,
}

/// Copies patch fields that are present and differ from the current value
/// into the delta.
macro_rules! diff_fields {
    ($current:expr, $patch:expr, $delta:expr, $( $field:ident ),+ $(,)?) => {
        $(
            if let Some(value) = $patch.$field
                && $current.$field != Some(value)
            {
                $delta.$field = Some(value);
            }
        )+
    };
}

/// Overlays present delta fields onto the merged copy.
macro_rules! apply_fields {
    ($merged:expr, $delta:expr, $( $field:ident ),+ $(,)?) => {
        $(
            if let Some(value) = $delta.$field {
                $merged.$field = Some(value);
            }
        )+
    };
}

impl DeviceState {
    /// Creates an empty state.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    // ========== Merge ==========

    /// Reduces a patch to the fields that are present and different from
    /// this state.
    ///
    /// Returns `None` when no field differs — the no-change fast path.
    #[must_use]
    pub fn diff(&self, patch: &Self) -> Option<Self> {
        let mut delta = Self::new();
        diff_fields!(
            self,
            patch,
            delta,
            websocket_alive,
            stream_state,
            stream_request_state,
            motion_at,
            sound_at,
            temperature_milli,
            humidity_milli,
            is_night,
            night_light,
            standby,
        );

        if delta == Self::new() { None } else { Some(delta) }
    }

    /// Returns a new snapshot with the delta's present fields applied.
    #[must_use]
    pub fn merged_with(&self, delta: &Self) -> Self {
        let mut merged = self.clone();
        apply_fields!(
            merged,
            delta,
            websocket_alive,
            stream_state,
            stream_request_state,
            motion_at,
            sound_at,
            temperature_milli,
            humidity_milli,
            is_night,
            night_light,
            standby,
        );
        merged
    }

    // ========== Builders ==========

    /// Sets connection liveness (internal field).
    #[must_use]
    pub fn with_websocket_alive(mut self, alive: bool) -> Self {
        self.websocket_alive = Some(alive);
        self
    }

    /// Sets stream health (internal field).
    #[must_use]
    pub fn with_stream_state(mut self, state: StreamState) -> Self {
        self.stream_state = Some(state);
        self
    }

    /// Sets streaming-request progress (internal field).
    #[must_use]
    pub fn with_stream_request_state(mut self, state: StreamRequestState) -> Self {
        self.stream_request_state = Some(state);
        self
    }

    /// Sets the last motion event timestamp.
    #[must_use]
    pub fn with_motion_at(mut self, at: DateTime<Utc>) -> Self {
        self.motion_at = Some(at);
        self
    }

    /// Sets the last sound event timestamp.
    #[must_use]
    pub fn with_sound_at(mut self, at: DateTime<Utc>) -> Self {
        self.sound_at = Some(at);
        self
    }

    /// Sets the temperature in thousandths of a degree.
    #[must_use]
    pub fn with_temperature_milli(mut self, milli: i32) -> Self {
        self.temperature_milli = Some(milli);
        self
    }

    /// Sets the relative humidity in thousandths of a percent.
    #[must_use]
    pub fn with_humidity_milli(mut self, milli: i32) -> Self {
        self.humidity_milli = Some(milli);
        self
    }

    /// Sets the night-mode flag.
    #[must_use]
    pub fn with_is_night(mut self, night: bool) -> Self {
        self.is_night = Some(night);
        self
    }

    /// Sets the night-light flag.
    #[must_use]
    pub fn with_night_light(mut self, on: bool) -> Self {
        self.night_light = Some(on);
        self
    }

    /// Sets the standby flag.
    #[must_use]
    pub fn with_standby(mut self, standby: bool) -> Self {
        self.standby = Some(standby);
        self
    }

    // ========== Accessors ==========

    /// Connection liveness; unknown counts as not alive.
    #[must_use]
    pub fn websocket_alive(&self) -> bool {
        self.websocket_alive.unwrap_or(false)
    }

    /// Stream health; defaults to [`StreamState::Unknown`].
    #[must_use]
    pub fn stream_state(&self) -> StreamState {
        self.stream_state.unwrap_or_default()
    }

    /// Streaming-request progress; defaults to
    /// [`StreamRequestState::NotRequested`].
    #[must_use]
    pub fn stream_request_state(&self) -> StreamRequestState {
        self.stream_request_state.unwrap_or_default()
    }

    /// Last motion event timestamp.
    #[must_use]
    pub fn motion_at(&self) -> Option<DateTime<Utc>> {
        self.motion_at
    }

    /// Last sound event timestamp.
    #[must_use]
    pub fn sound_at(&self) -> Option<DateTime<Utc>> {
        self.sound_at
    }

    /// Temperature as floating point degrees.
    #[must_use]
    pub fn temperature(&self) -> Option<f64> {
        self.temperature_milli.map(|m| f64::from(m) / 1000.0)
    }

    /// Relative humidity as floating point percent.
    #[must_use]
    pub fn humidity(&self) -> Option<f64> {
        self.humidity_milli.map(|m| f64::from(m) / 1000.0)
    }

    /// Night-mode flag.
    #[must_use]
    pub fn is_night(&self) -> Option<bool> {
        self.is_night
    }

    /// Night-light flag.
    #[must_use]
    pub fn night_light(&self) -> Option<bool> {
        self.night_light
    }

    /// Standby flag.
    #[must_use]
    pub fn standby(&self) -> Option<bool> {
        self.standby
    }

    // ========== Views ==========

    /// Returns the present fields as a name/value map.
    ///
    /// Scaled readings are exposed as floats, event timestamps as unix
    /// seconds. Internal fields are included only on request (diagnostics
    /// and logging); externally published views leave them out.
    #[must_use]
    pub fn as_map(&self, include_internal: bool) -> Map<String, Value> {
        let mut map = Map::new();

        if let Some(at) = self.motion_at {
            map.insert("motion_timestamp".to_string(), json!(at.timestamp()));
        }
        if let Some(at) = self.sound_at {
            map.insert("sound_timestamp".to_string(), json!(at.timestamp()));
        }
        if let Some(value) = self.temperature() {
            map.insert("temperature".to_string(), json!(value));
        }
        if let Some(value) = self.humidity() {
            map.insert("humidity".to_string(), json!(value));
        }
        if let Some(night) = self.is_night {
            map.insert("is_night".to_string(), json!(night));
        }
        if let Some(on) = self.night_light {
            map.insert("night_light".to_string(), json!(on));
        }
        if let Some(standby) = self.standby {
            map.insert("standby".to_string(), json!(standby));
        }

        if include_internal {
            if let Some(alive) = self.websocket_alive {
                map.insert("is_websocket_alive".to_string(), json!(alive));
            }
            if let Some(state) = self.stream_state {
                map.insert("stream_state".to_string(), json!(state));
            }
            if let Some(state) = self.stream_request_state {
                map.insert("stream_request_state".to_string(), json!(state));
            }
        }

        map
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    #[test]
    fn absent_field_never_overwrites_present_value() {
        let current = DeviceState::new()
            .with_temperature_milli(20_000)
            .with_is_night(true);
        let patch = DeviceState::new().with_humidity_milli(45_000);

        let delta = current.diff(&patch).expect("humidity changed");
        let merged = current.merged_with(&delta);

        assert_eq!(merged.temperature(), Some(20.0));
        assert_eq!(merged.is_night(), Some(true));
        assert_eq!(merged.humidity(), Some(45.0));
    }

    #[test]
    fn identical_patch_yields_no_delta() {
        let current = DeviceState::new().with_temperature_milli(20_000);
        let patch = DeviceState::new().with_temperature_milli(20_000);
        assert!(current.diff(&patch).is_none());
    }

    #[test]
    fn empty_patch_yields_no_delta() {
        let current = DeviceState::new().with_standby(false);
        assert!(current.diff(&DeviceState::new()).is_none());
    }

    #[test]
    fn delta_contains_only_changed_fields() {
        let current = DeviceState::new()
            .with_temperature_milli(20_000)
            .with_humidity_milli(40_000);
        let patch = DeviceState::new()
            .with_temperature_milli(20_000)
            .with_humidity_milli(41_000)
            .with_is_night(false);

        let delta = current.diff(&patch).expect("two fields changed");
        assert_eq!(delta.temperature(), None);
        assert_eq!(delta.humidity(), Some(41.0));
        assert_eq!(delta.is_night(), Some(false));
    }

    #[test]
    fn milli_fields_expose_floats() {
        let state = DeviceState::new()
            .with_temperature_milli(21_537)
            .with_humidity_milli(48_200);
        assert_eq!(state.temperature(), Some(21.537));
        assert_eq!(state.humidity(), Some(48.2));
    }

    #[test]
    fn defaults_for_unknown_internal_fields() {
        let state = DeviceState::new();
        assert!(!state.websocket_alive());
        assert_eq!(state.stream_state(), StreamState::Unknown);
        assert_eq!(
            state.stream_request_state(),
            StreamRequestState::NotRequested
        );
    }

    #[test]
    fn as_map_suppresses_internal_fields() {
        let at = Utc.with_ymd_and_hms(2021, 3, 14, 9, 26, 53).unwrap();
        let state = DeviceState::new()
            .with_temperature_milli(20_500)
            .with_motion_at(at)
            .with_websocket_alive(true)
            .with_stream_state(StreamState::Alive);

        let external = state.as_map(false);
        assert_eq!(external.get("temperature"), Some(&json!(20.5)));
        assert_eq!(
            external.get("motion_timestamp"),
            Some(&json!(at.timestamp()))
        );
        assert!(!external.contains_key("is_websocket_alive"));
        assert!(!external.contains_key("stream_state"));

        let internal = state.as_map(true);
        assert_eq!(internal.get("is_websocket_alive"), Some(&json!(true)));
        assert!(internal.contains_key("stream_state"));
    }
}
