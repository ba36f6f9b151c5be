// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! MQTT publish/command adapter.
//!
//! Bridges the state store to an MQTT broker: every externally-visible
//! changed attribute publishes to `{prefix}/{device_uid}/{attribute}`, and
//! inbound `{prefix}/{device_uid}/{control}/set` payloads relay to the
//! per-device command handlers the gateway registers. Runs under the retry
//! supervisor so broker outages recover with backoff.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::RwLock;
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use serde_json::Value;

use crate::error::{Error, ProtocolError, Result};
use crate::state::{DeviceState, StateStore, StreamState};
use crate::supervise::{Attempt, RetryPolicy, Scope, run_with_retry};

/// Global counter for generating unique client IDs.
static CLIENT_ID_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Reconnect policy for the broker connection.
#[must_use]
pub fn mqtt_retry_policy() -> RetryPolicy {
    RetryPolicy::new(
        vec![
            Duration::from_secs(2),
            Duration::from_secs(10),
            Duration::from_secs(60),
        ],
        Duration::from_secs(2),
    )
}

/// Broker connection and topic configuration.
#[derive(Debug, Clone)]
pub struct MqttAdapterOptions {
    /// Broker URL, e.g. `mqtt://192.168.1.50:1883`.
    pub broker_url: String,
    /// Topic prefix for state and command topics.
    pub topic_prefix: String,
    /// Optional broker username.
    pub username: Option<String>,
    /// Optional broker password.
    pub password: Option<String>,
    /// Client id override; autogenerated when absent.
    pub client_id: Option<String>,
}

/// A parsed inbound command.
#[derive(Debug, Clone)]
pub struct MqttCommand {
    /// Device the command addresses.
    pub device_uid: String,
    /// Control name, e.g. `night_light` or `standby`.
    pub control: String,
    /// Desired on/off state (payload `"true"` means on).
    pub enabled: bool,
}

type CommandHandler = Arc<dyn Fn(&MqttCommand) + Send + Sync>;

struct AdapterInner {
    options: MqttAdapterOptions,
    store: StateStore,
    commands: RwLock<HashMap<String, CommandHandler>>,
}

/// State publisher and command relay for one broker.
///
/// Cloning yields another handle to the same adapter.
#[derive(Clone)]
pub struct MqttAdapter {
    inner: Arc<AdapterInner>,
}

impl MqttAdapter {
    /// Creates an adapter publishing `store` updates to the broker.
    #[must_use]
    pub fn new(options: MqttAdapterOptions, store: StateStore) -> Self {
        Self {
            inner: Arc::new(AdapterInner {
                options,
                store,
                commands: RwLock::new(HashMap::new()),
            }),
        }
    }

    /// Registers the command handler for a device.
    ///
    /// Called by the gateway on every established session; the latest
    /// registration wins, so commands always reach the live connection.
    pub fn register_command_handler<F>(&self, device_uid: &str, handler: F)
    where
        F: Fn(&MqttCommand) + Send + Sync + 'static,
    {
        self.inner
            .commands
            .write()
            .insert(device_uid.to_string(), Arc::new(handler));
    }

    /// Runs the broker connection loop until `scope` is cancelled.
    pub async fn run(&self, scope: &Scope) {
        let policy = mqtt_retry_policy();
        let adapter = self.clone();

        run_with_retry(scope, "mqtt", &policy, move |attempt| {
            let adapter = adapter.clone();
            async move { adapter.run_once(attempt).await }
        })
        .await;
    }

    async fn run_once(&self, attempt: Attempt) -> Result<()> {
        let options = &self.inner.options;
        let (host, port) = parse_mqtt_url(&options.broker_url)?;

        let client_id = options.client_id.clone().unwrap_or_else(|| {
            let counter = CLIENT_ID_COUNTER.fetch_add(1, Ordering::Relaxed);
            format!("cradlecast_{}_{}", std::process::id(), counter)
        });

        let mut mqtt_options = MqttOptions::new(client_id, host, port);
        mqtt_options.set_keep_alive(Duration::from_secs(30));
        mqtt_options.set_clean_session(false);
        if let Some(username) = &options.username {
            mqtt_options.set_credentials(
                username.clone(),
                options.password.clone().unwrap_or_default(),
            );
        }

        let (client, mut event_loop) = AsyncClient::new(mqtt_options, 10);

        let command_topic = format!("{}/+/+/set", options.topic_prefix);
        tracing::debug!(topic = %command_topic, "subscribing to command topic");
        client
            .subscribe(&command_topic, QoS::AtLeastOnce)
            .await
            .map_err(ProtocolError::Mqtt)?;

        let publish_client = client.clone();
        let topic_prefix = options.topic_prefix.clone();
        let subscription = self.inner.store.subscribe(move |device_uid, delta| {
            publish_state(&publish_client, &topic_prefix, device_uid, delta);
        });

        let result = loop {
            tokio::select! {
                () = attempt.cancelled() => break Ok(()),
                event = event_loop.poll() => match event {
                    Ok(Event::Incoming(Packet::ConnAck(_))) => {
                        tracing::info!(broker_url = %options.broker_url, "connected to MQTT broker");
                    }
                    Ok(Event::Incoming(Packet::Publish(publish))) => {
                        self.handle_command(&publish.topic, &publish.payload);
                    }
                    Ok(_) => {}
                    Err(err) => {
                        tracing::error!(broker_url = %options.broker_url, error = %err, "MQTT event loop error");
                        break Err(Error::from(ProtocolError::ConnectionFailed(err.to_string())));
                    }
                }
            }
        };

        tracing::debug!("closing MQTT connection");
        self.inner.store.unsubscribe(subscription);
        let _ = client.disconnect().await;
        result
    }

    fn handle_command(&self, topic: &str, payload: &[u8]) {
        let prefix = &self.inner.options.topic_prefix;
        let Some(rest) = topic
            .strip_prefix(prefix.as_str())
            .and_then(|rest| rest.strip_prefix('/'))
        else {
            tracing::warn!(topic, "command on unexpected topic");
            return;
        };

        let parts: Vec<&str> = rest.split('/').collect();
        if parts.len() != 3 || parts[2] != "set" {
            tracing::warn!(topic, "invalid command topic format");
            return;
        }

        let command = MqttCommand {
            device_uid: parts[0].to_string(),
            control: parts[1].to_string(),
            enabled: payload == b"true".as_slice(),
        };
        tracing::debug!(
            device_uid = %command.device_uid,
            control = %command.control,
            enabled = command.enabled,
            "received command"
        );

        let handler = self.inner.commands.read().get(&command.device_uid).cloned();
        match handler {
            Some(handler) => handler(&command),
            None => {
                tracing::warn!(device_uid = %command.device_uid, "no command handler registered");
            }
        }
    }
}

impl std::fmt::Debug for MqttAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MqttAdapter")
            .field("broker_url", &self.inner.options.broker_url)
            .field("topic_prefix", &self.inner.options.topic_prefix)
            .finish()
    }
}

/// Publishes a state delta's externally-visible attributes.
fn publish_state(client: &AsyncClient, topic_prefix: &str, device_uid: &str, delta: &DeviceState) {
    let publish = |attribute: &str, payload: String| {
        let topic = format!("{topic_prefix}/{device_uid}/{attribute}");
        tracing::trace!(topic = %topic, payload = %payload, "MQTT publish");

        if let Err(err) = client.try_publish(&topic, QoS::AtLeastOnce, false, payload) {
            tracing::error!(error = %err, attribute, "unable to publish state update");
        }
    };

    for (attribute, value) in delta.as_map(false) {
        let payload = match value {
            Value::String(text) => text,
            other => other.to_string(),
        };
        publish(&attribute, payload);
    }

    // Derived liveness flag; only published when stream health is known.
    if delta.stream_state() != StreamState::Unknown {
        publish(
            "is_stream_alive",
            (delta.stream_state() == StreamState::Alive).to_string(),
        );
    }
}

/// Parses an MQTT URL into host and port.
fn parse_mqtt_url(url: &str) -> std::result::Result<(String, u16), ProtocolError> {
    let url = url
        .strip_prefix("mqtt://")
        .or_else(|| url.strip_prefix("tcp://"))
        .unwrap_or(url);

    let (host, port) = if let Some((h, p)) = url.rsplit_once(':') {
        let port = p
            .parse()
            .map_err(|_| ProtocolError::InvalidAddress(format!("Invalid port: {p}")))?;
        (h.to_string(), port)
    } else {
        (url.to_string(), 1883)
    };

    Ok((host, port))
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicU32;

    use super::*;

    fn adapter() -> MqttAdapter {
        MqttAdapter::new(
            MqttAdapterOptions {
                broker_url: "mqtt://127.0.0.1:1883".to_string(),
                topic_prefix: "cradlecast".to_string(),
                username: None,
                password: None,
                client_id: None,
            },
            StateStore::new(),
        )
    }

    #[test]
    fn parse_url_with_scheme() {
        let (host, port) = parse_mqtt_url("mqtt://192.168.1.50:1883").unwrap();
        assert_eq!(host, "192.168.1.50");
        assert_eq!(port, 1883);
    }

    #[test]
    fn parse_url_defaults_port() {
        let (host, port) = parse_mqtt_url("broker.local").unwrap();
        assert_eq!(host, "broker.local");
        assert_eq!(port, 1883);
    }

    #[test]
    fn parse_url_rejects_bad_port() {
        assert!(parse_mqtt_url("broker.local:notaport").is_err());
    }

    #[tokio::test]
    async fn command_routes_to_registered_handler() {
        let adapter = adapter();
        let received = Arc::new(parking_lot::Mutex::new(None));
        let received_clone = Arc::clone(&received);

        adapter.register_command_handler("abc123", move |command| {
            *received_clone.lock() = Some((command.control.clone(), command.enabled));
        });

        adapter.handle_command("cradlecast/abc123/night_light/set", b"true");

        assert_eq!(
            received.lock().clone(),
            Some(("night_light".to_string(), true))
        );
    }

    #[tokio::test]
    async fn non_true_payload_means_off() {
        let adapter = adapter();
        let received = Arc::new(parking_lot::Mutex::new(None));
        let received_clone = Arc::clone(&received);

        adapter.register_command_handler("abc123", move |command| {
            *received_clone.lock() = Some(command.enabled);
        });

        adapter.handle_command("cradlecast/abc123/standby/set", b"false");
        assert_eq!(received.lock().clone(), Some(false));
    }

    #[tokio::test]
    async fn malformed_topics_are_ignored() {
        let adapter = adapter();
        let calls = Arc::new(AtomicU32::new(0));
        let calls_clone = Arc::clone(&calls);

        adapter.register_command_handler("abc123", move |_| {
            calls_clone.fetch_add(1, Ordering::SeqCst);
        });

        adapter.handle_command("cradlecast/abc123/night_light", b"true");
        adapter.handle_command("cradlecast/abc123/night_light/get", b"true");
        adapter.handle_command("other/abc123/night_light/set", b"true");

        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn latest_handler_registration_wins() {
        let adapter = adapter();
        let first = Arc::new(AtomicU32::new(0));
        let second = Arc::new(AtomicU32::new(0));

        let first_clone = Arc::clone(&first);
        adapter.register_command_handler("abc123", move |_| {
            first_clone.fetch_add(1, Ordering::SeqCst);
        });
        let second_clone = Arc::clone(&second);
        adapter.register_command_handler("abc123", move |_| {
            second_clone.fetch_add(1, Ordering::SeqCst);
        });

        adapter.handle_command("cradlecast/abc123/night_light/set", b"true");

        assert_eq!(first.load(Ordering::SeqCst), 0);
        assert_eq!(second.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn retry_policy_matches_broker_profile() {
        let policy = mqtt_retry_policy();
        assert_eq!(policy.cooldown.len(), 3);
        assert_eq!(policy.reset_threshold, Duration::from_secs(2));
    }
}
