//! Multi-instance hub over MQTT.
//!
//! Every instance publishes committed snapshots on one shared topic and
//! listens on it. Local subscribers are served directly at publish time;
//! broker messages carrying this instance's own `origin` are skipped so nobody
//! gets a snapshot twice.

use std::borrow::Cow;
use std::sync::Arc;
use std::time::Duration;

use rumqttc::{AsyncClient, Event, Incoming, MqttOptions, QoS};
use serde::{Deserialize, Serialize};
use serde_json::value::RawValue;
use tokio::task;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{Payload, Registry, SnapshotHub, Subscription};
use crate::config::MqttConf;

pub const SNAPSHOT_TOPIC: &str = "procmon/snapshots@v1";

/// Snapshots with thousands of processes are well past rumqttc's 10 KiB default.
const MAX_PACKET_BYTES: usize = 16 * 1024 * 1024;

#[derive(Serialize, Deserialize)]
struct Envelope<'a> {
    origin: Uuid,
    #[serde(borrow)]
    hostname: Cow<'a, str>,
    #[serde(borrow)]
    snapshot: &'a RawValue,
}

pub struct MqttHub {
    origin: Uuid,
    registry: Arc<Registry>,
    client: AsyncClient,
}

impl MqttHub {
    /// Creates the client and spawns its event loop. Must run inside a tokio runtime.
    pub fn connect(conf: &MqttConf) -> Self {
        let origin = Uuid::new_v4();
        let registry = Arc::new(Registry::default());

        let mut opts = MqttOptions::new(format!("procmon-server-{origin}"), &conf.host, conf.port);
        opts.set_keep_alive(Duration::from_secs(15));
        opts.set_max_packet_size(MAX_PACKET_BYTES, MAX_PACKET_BYTES);

        let (client, eventloop) = AsyncClient::new(opts, 64);
        spawn_listener(eventloop, client.clone(), Arc::clone(&registry), origin);

        info!(host = %conf.host, port = conf.port, %origin, "MQTT fan-out configured");
        Self { origin, registry, client }
    }
}

impl SnapshotHub for MqttHub {
    fn subscribe(&self, hostname: &str) -> Subscription {
        self.registry.subscribe(hostname)
    }

    fn publish(&self, hostname: &str, payload: Payload) {
        let delivered = self.registry.deliver(hostname, &payload);
        debug!(hostname, delivered, "Snapshot delivered locally");

        let wire = match encode(self.origin, hostname, &payload) {
            Ok(wire) => wire,
            Err(e) => {
                warn!(hostname, error = %e, "Snapshot not forwarded: bad payload");
                return;
            }
        };
        if let Err(e) = self.client.try_publish(SNAPSHOT_TOPIC, QoS::AtLeastOnce, false, wire) {
            warn!(hostname, error = ?e, "Snapshot not forwarded to broker");
        }
    }

    fn backend(&self) -> &'static str {
        "mqtt"
    }
}

fn encode(origin: Uuid, hostname: &str, payload: &str) -> Result<Vec<u8>, serde_json::Error> {
    let snapshot: &RawValue = serde_json::from_str(payload)?;
    serde_json::to_vec(&Envelope {
        origin,
        hostname: Cow::Borrowed(hostname),
        snapshot,
    })
}

/// Delivers a broker message to local subscribers unless this instance sent it.
fn handle_incoming(registry: &Registry, origin: Uuid, bytes: &[u8]) -> usize {
    let envelope: Envelope<'_> = match serde_json::from_slice(bytes) {
        Ok(envelope) => envelope,
        Err(e) => {
            warn!(error = %e, "Undecodable snapshot on broker");
            return 0;
        }
    };
    if envelope.origin == origin {
        return 0;
    }
    let payload: Payload = Arc::from(envelope.snapshot.get());
    registry.deliver(&envelope.hostname, &payload)
}

fn spawn_listener(mut eventloop: rumqttc::EventLoop, client: AsyncClient, registry: Arc<Registry>, origin: Uuid) {
    task::spawn(async move {
        loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(Incoming::ConnAck(_))) => {
                    info!("MQTT connected");
                    // Subscriptions do not survive a clean-session reconnect.
                    if let Err(e) = client.try_subscribe(SNAPSHOT_TOPIC, QoS::AtLeastOnce) {
                        warn!(error = ?e, "MQTT subscribe failed");
                    }
                }
                Ok(Event::Incoming(Incoming::Publish(p))) if p.topic == SNAPSHOT_TOPIC => {
                    let delivered = handle_incoming(&registry, origin, &p.payload);
                    debug!(delivered, "Remote snapshot fanned out");
                }
                Ok(_) => {}
                Err(e) => {
                    warn!(error = ?e, "MQTT connection error");
                    tokio::time::sleep(Duration::from_secs(2)).await;
                }
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_envelope_round_trip_keeps_snapshot_bytes() {
        let origin = Uuid::new_v4();
        let snapshot = r#"{"id":3,"hostname":"h1","processes":[]}"#;
        let wire = encode(origin, "h1", snapshot).unwrap();

        let envelope: Envelope<'_> = serde_json::from_slice(&wire).unwrap();
        assert_eq!(envelope.origin, origin);
        assert_eq!(envelope.hostname, "h1");
        assert_eq!(envelope.snapshot.get(), snapshot);
    }

    #[tokio::test]
    async fn test_remote_snapshot_reaches_local_subscriber() {
        let registry = Arc::new(Registry::default());
        let mut sub = registry.subscribe("h1");
        let remote = Uuid::new_v4();

        let wire = encode(remote, "h1", r#"{"id":9}"#).unwrap();
        assert_eq!(handle_incoming(&registry, Uuid::new_v4(), &wire), 1);

        assert_eq!(sub.recv().await.as_deref(), Some(r#"{"id":9}"#));
    }

    #[tokio::test]
    async fn test_own_echo_is_ignored() {
        let registry = Arc::new(Registry::default());
        let _sub = registry.subscribe("h1");
        let me = Uuid::new_v4();

        let wire = encode(me, "h1", r#"{"id":1}"#).unwrap();
        assert_eq!(handle_incoming(&registry, me, &wire), 0);
    }

    #[test]
    fn test_garbage_from_broker_is_dropped() {
        let registry = Registry::default();
        assert_eq!(handle_incoming(&registry, Uuid::new_v4(), b"not json"), 0);
    }

    #[tokio::test]
    async fn test_publish_without_broker_still_serves_local_subscribers() {
        // nothing listens on this port; the event loop just keeps retrying
        let hub = MqttHub::connect(&MqttConf { host: "127.0.0.1".into(), port: 1 });
        let mut sub = hub.subscribe("h1");

        for i in 0..100 {
            hub.publish("h1", Arc::from(format!(r#"{{"id":{i}}}"#).as_str()));
        }
        hub.publish("h1", Arc::from("not json"));

        for i in 0..100 {
            assert_eq!(sub.recv().await.as_deref(), Some(format!(r#"{{"id":{i}}}"#).as_str()));
        }
        assert_eq!(hub.backend(), "mqtt");
    }
}
