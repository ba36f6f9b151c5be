// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Application assembly.
//!
//! A [`Gateway`] wires the pieces together: one explicit [`StateStore`]
//! shared by everything, a [`StreamRelay`] for local video redistribution,
//! optionally an MQTT adapter, and one [`SessionManager`] per device. Every
//! established session gets the device wiring — sensor/control processing
//! into the store, the initial sensor query, and the streaming watchdog.
//!
//! Configuration loading stays outside this crate; callers construct
//! [`GatewayOptions`] and per-device [`Connector`]s themselves.

use std::sync::Arc;

use crate::proto::{
    Control, Envelope, RequestBody, RequestKind, SensorKind, SensorReading, Settings,
    StreamIdentifier, StreamingRequest, StreamingStatus,
};
use crate::relay::StreamRelay;
use crate::session::{Connection, Connector, SessionManager, request_streaming};
use crate::state::{DeviceState, StateStore, StreamRequestState, StreamState};
use crate::supervise::Scope;

#[cfg(feature = "mqtt")]
use crate::mqtt::MqttAdapter;

/// A device under gateway management.
#[derive(Debug, Clone)]
pub struct DeviceInfo {
    /// Stable device uid used for state, topics, and relay addressing.
    pub uid: String,
    /// Secondary camera uid used for transport addressing.
    pub camera_uid: String,
}

impl DeviceInfo {
    /// Creates a device descriptor.
    #[must_use]
    pub fn new(uid: impl Into<String>, camera_uid: impl Into<String>) -> Self {
        Self {
            uid: uid.into(),
            camera_uid: camera_uid.into(),
        }
    }
}

/// Gateway configuration.
#[derive(Debug, Clone, Default)]
pub struct GatewayOptions {
    /// Public address of the local stream relay (`host:port`). When set,
    /// cameras are asked to push their stream to
    /// `rtmp://{addr}/local/{device_uid}`.
    pub stream_public_addr: Option<String>,
}

impl GatewayOptions {
    fn local_stream_url(&self, device_uid: &str) -> Option<String> {
        self.stream_public_addr
            .as_ref()
            .map(|addr| format!("rtmp://{addr}/local/{device_uid}"))
    }
}

/// Coordinator for sessions, state, relay, and adapters.
///
/// # Examples
///
/// ```ignore
/// let mut gateway = Gateway::new(GatewayOptions {
///     stream_public_addr: Some("192.168.1.10:1935".to_string()),
/// });
/// gateway.add_device(DeviceInfo::new("abc123", "cam-uid"), connector);
///
/// let root = Scope::root();
/// let handle = root.spawn(move |scope| async move {
///     gateway.run(&scope).await;
///     Ok(())
/// });
/// ```
pub struct Gateway<C> {
    options: GatewayOptions,
    store: StateStore,
    relay: StreamRelay,
    #[cfg(feature = "mqtt")]
    mqtt: Option<MqttAdapter>,
    devices: Vec<(DeviceInfo, SessionManager<C>)>,
}

impl<C: Connector> Gateway<C> {
    /// Creates a gateway with a fresh store and relay.
    #[must_use]
    pub fn new(options: GatewayOptions) -> Self {
        let store = StateStore::new();
        let relay = StreamRelay::new(store.clone());
        Self {
            options,
            store,
            relay,
            #[cfg(feature = "mqtt")]
            mqtt: None,
            devices: Vec::new(),
        }
    }

    /// The shared state store.
    #[must_use]
    pub fn store(&self) -> &StateStore {
        &self.store
    }

    /// The local video relay.
    #[must_use]
    pub fn relay(&self) -> &StreamRelay {
        &self.relay
    }

    /// Attaches an MQTT adapter.
    ///
    /// The adapter must have been constructed over this gateway's store so
    /// published attributes reflect the same state the sessions update.
    #[cfg(feature = "mqtt")]
    pub fn set_mqtt(&mut self, adapter: MqttAdapter) {
        self.mqtt = Some(adapter);
    }

    /// Registers a device and its transport connector.
    ///
    /// Returns the session manager handle, e.g. for issuing requests from
    /// custom automation.
    pub fn add_device(&mut self, info: DeviceInfo, connector: C) -> SessionManager<C> {
        let session = SessionManager::new(
            info.uid.clone(),
            info.camera_uid.clone(),
            connector,
            self.store.clone(),
        );
        self.devices.push((info, session.clone()));
        session
    }

    /// Runs every session (and the MQTT adapter, if attached) under `scope`
    /// until it is cancelled.
    pub async fn run(&self, scope: &Scope) {
        #[cfg(feature = "mqtt")]
        if let Some(adapter) = &self.mqtt {
            let adapter = adapter.clone();
            scope.spawn(move |child| async move {
                adapter.run(&child).await;
                Ok(())
            });
        }

        for (info, session) in &self.devices {
            self.wire_device(info, session);
            let session = session.clone();
            scope.spawn(move |child| async move {
                session.run(&child).await;
                Ok(())
            });
        }

        scope.cancelled().await;
    }

    /// Installs the per-connection device wiring.
    fn wire_device(&self, info: &DeviceInfo, session: &SessionManager<C>) {
        let device_uid = info.uid.clone();
        let store = self.store.clone();
        let stream_url = self.options.local_stream_url(&info.uid);
        #[cfg(feature = "mqtt")]
        let mqtt = self.mqtt.clone();

        session.on_ready(move |connection, scope| {
            let device_uid = device_uid.clone();
            let store = store.clone();
            let stream_url = stream_url.clone();
            #[cfg(feature = "mqtt")]
            let mqtt = mqtt.clone();

            async move {
                #[cfg(feature = "mqtt")]
                if let Some(mqtt) = &mqtt {
                    let conn = Arc::clone(&connection);
                    mqtt.register_command_handler(&device_uid, move |command| {
                        match command.control.as_str() {
                            "night_light" => send_night_light(&conn, command.enabled),
                            "standby" => send_standby(&conn, command.enabled),
                            other => tracing::warn!(control = other, "unknown command received"),
                        }
                    });
                }

                run_device_session(device_uid, stream_url, store, connection, scope).await
            }
        });
    }
}

impl<C> std::fmt::Debug for Gateway<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Gateway")
            .field("devices", &self.devices.len())
            .finish()
    }
}

/// Per-connection device lifecycle, running as a supervised ready handler.
async fn run_device_session(
    device_uid: String,
    stream_url: Option<String>,
    store: StateStore,
    connection: Arc<Connection>,
    scope: Scope,
) -> crate::error::Result<()> {
    // Sensor and control pushes from the camera, plus answers to our own
    // sensor queries, all land in the store.
    {
        let store = store.clone();
        let uid = device_uid.clone();
        connection.register_message_handler(move |envelope, _| {
            handle_device_message(&uid, envelope, &store);
        });
    }

    // Initial sensor query; the camera answers with a full readout.
    let _ = connection.send_request(RequestBody::GetSensorData { all: true });

    let Some(target_url) = stream_url else {
        scope.cancelled().await;
        return Ok(());
    };

    // Watchdog: re-request streaming whenever the stream turns unhealthy,
    // unless the last request already failed.
    let watchdog = {
        let uid = device_uid.clone();
        let target = target_url.clone();
        let conn = Arc::clone(&connection);
        let request_store = store.clone();
        let request_scope = scope.clone();

        store.subscribe(move |updated_uid, delta| {
            if updated_uid != uid || delta.stream_state() != StreamState::Unhealthy {
                return;
            }
            if request_store.get_state(&uid).stream_request_state()
                == StreamRequestState::RequestFailed
            {
                return;
            }

            let uid = uid.clone();
            let target = target.clone();
            let conn = Arc::clone(&conn);
            let store = request_store.clone();
            request_scope.spawn(move |child| async move {
                request_streaming(
                    &uid,
                    &target,
                    StreamingStatus::Started,
                    &conn,
                    &store,
                    &child,
                )
                .await;
                Ok(())
            });
        })
    };

    // Ask for the stream right away unless it is already known to be alive.
    let state = store.get_state(&device_uid);
    if state.stream_state() != StreamState::Alive
        && (state.stream_request_state() != StreamRequestState::Requested
            || state.stream_state() == StreamState::Unhealthy)
    {
        let uid = device_uid.clone();
        let target = target_url.clone();
        let conn = Arc::clone(&connection);
        let request_store = store.clone();
        scope.spawn(move |child| async move {
            request_streaming(
                &uid,
                &target,
                StreamingStatus::Started,
                &conn,
                &request_store,
                &child,
            )
            .await;
            Ok(())
        });
    }

    scope.cancelled().await;

    store.unsubscribe(watchdog);

    // Best-effort stop on the way out. The response cannot arrive once the
    // connection tears down, so it is fired without awaiting.
    let state = store.get_state(&device_uid);
    if state.websocket_alive() && state.stream_state() == StreamState::Alive {
        tracing::info!(target = %target_url, "stopping local streaming");
        let _ = connection.send_request(RequestBody::Streaming(StreamingRequest {
            id: StreamIdentifier::Mobile,
            rtmp_url: target_url,
            status: StreamingStatus::Stopped,
            attempts: 1,
        }));
    }

    Ok(())
}

/// Routes camera traffic into the state store.
fn handle_device_message(device_uid: &str, envelope: &Envelope, store: &StateStore) {
    match envelope {
        // Answer to a sensor query initiated by us (or another client).
        Envelope::Response(response)
            if response.request_type == RequestKind::GetSensorData
                && !response.sensor_data.is_empty() =>
        {
            process_sensor_data(device_uid, &response.sensor_data, store);
        }
        // Camera-initiated pushes: periodic sensor updates plus control and
        // settings changes made from other clients.
        Envelope::Request(request) => match &request.body {
            RequestBody::SensorData(readings) if !readings.is_empty() => {
                process_sensor_data(device_uid, readings, store);
            }
            RequestBody::Control(control) => process_control(device_uid, control, store),
            RequestBody::Settings(settings) => process_settings(device_uid, settings, store),
            _ => {}
        },
        _ => {}
    }
}

fn process_sensor_data(device_uid: &str, readings: &[SensorReading], store: &StateStore) {
    let mut patch = DeviceState::new();
    for reading in readings {
        match reading.sensor {
            SensorKind::Temperature => {
                if let Some(milli) = reading.value_milli {
                    patch = patch.with_temperature_milli(milli);
                }
            }
            SensorKind::Humidity => {
                if let Some(milli) = reading.value_milli {
                    patch = patch.with_humidity_milli(milli);
                }
            }
            SensorKind::Night => {
                if let Some(value) = reading.value {
                    patch = patch.with_is_night(value == 1);
                }
            }
        }
    }

    store.update(device_uid, patch);
}

fn process_control(device_uid: &str, control: &Control, store: &StateStore) {
    if let Some(on) = control.night_light {
        store.update(device_uid, DeviceState::new().with_night_light(on));
    }
}

fn process_settings(device_uid: &str, settings: &Settings, store: &StateStore) {
    if let Some(standby) = settings.sleep_mode {
        store.update(device_uid, DeviceState::new().with_standby(standby));
    }
}

/// Issues a night-light toggle towards the camera, fire-and-forget.
pub fn send_night_light(connection: &Connection, on: bool) {
    let _ = connection.send_request(RequestBody::Control(Control {
        night_light: Some(on),
    }));
}

/// Issues a standby toggle towards the camera, fire-and-forget.
pub fn send_standby(connection: &Connection, standby: bool) {
    let _ = connection.send_request(RequestBody::Settings(Settings {
        sleep_mode: Some(standby),
    }));
}
