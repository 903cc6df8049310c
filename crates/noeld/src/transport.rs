//! MQTT transport: one reconnecting broker connection feeding the pipeline.
//!
//! The event loop runs on its own task. Every successful (re)connection
//! re-subscribes to the three sensor topics; every decodable publish is
//! handed to the pipeline as exactly one [`InboundEvent`] over a bounded
//! channel. Undecodable payloads are logged and dropped.

use crate::config::MqttSettings;
use crate::pipeline::Counters;
use noel_core::{decode_payload, DecodeError, InboundEvent, TopicKind};
use rand::Rng;
use rumqttc::{
    AsyncClient, Event, EventLoop, MqttOptions, NetworkOptions, Packet, Publish, QoS,
};
use std::ops::ControlFlow;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

/// Request queue depth between the client handle and the event loop.
const CLIENT_CAPACITY: usize = 64;
/// How long to keep polling after DISCONNECT is queued so it reaches the wire.
const DISCONNECT_FLUSH: Duration = Duration::from_millis(500);

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("connection error: {0}")]
    Connection(#[from] rumqttc::ConnectionError),
    #[error(transparent)]
    Decode(#[from] DecodeError),
    #[error("publish on unexpected topic {0}")]
    UnexpectedTopic(String),
}

/// Point-in-time broker connection status.
pub trait ConnectionStatus: Send + Sync {
    fn is_connected(&self) -> bool;
}

/// Best-effort outbound publishing.
pub trait Publisher: Send + Sync {
    /// Returns whether the send was attempted, not whether the broker
    /// accepted it. Never blocks.
    fn publish(&self, topic: &str, payload: &[u8]) -> bool;
}

struct Shared {
    client: AsyncClient,
    connected: AtomicBool,
    stopped: AtomicBool,
    shutdown: watch::Sender<bool>,
}

/// Clone-safe handle to the transport task.
#[derive(Clone)]
pub struct TransportHandle {
    shared: Arc<Shared>,
}

/// Random client id so restarts never collide with a lingering session.
pub fn random_client_id(prefix: &str) -> String {
    let suffix: u32 = rand::thread_rng().gen_range(0..0x100_0000);
    format!("{prefix}-{suffix:06x}")
}

impl TransportHandle {
    /// Configure the client and spawn the event loop. The connection
    /// itself is established (and re-established) by the event loop;
    /// this never blocks on the network.
    pub fn connect(
        settings: &MqttSettings,
        events: mpsc::Sender<InboundEvent>,
        counters: Arc<Counters>,
    ) -> (Self, JoinHandle<()>) {
        let client_id = random_client_id(&settings.client_prefix);
        let mut options = MqttOptions::new(&client_id, &settings.host, settings.port);
        options.set_keep_alive(settings.keep_alive);
        options.set_clean_session(true);
        if let Some(user) = &settings.username {
            options.set_credentials(user, settings.password.clone().unwrap_or_default());
        }

        let (client, mut eventloop) = AsyncClient::new(options, CLIENT_CAPACITY);
        let mut network = NetworkOptions::new();
        network.set_connection_timeout(settings.connect_timeout.as_secs());
        eventloop.set_network_options(network);

        let (shutdown, shutdown_rx) = watch::channel(false);
        let shared = Arc::new(Shared {
            client,
            connected: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
            shutdown,
        });

        tracing::info!(
            broker = %format!("{}:{}", settings.host, settings.port),
            client_id = %client_id,
            namespace = %settings.namespace,
            auth = settings.username.is_some(),
            "connecting to MQTT broker"
        );

        let task = tokio::spawn(run_event_loop(
            eventloop,
            Arc::clone(&shared),
            settings.namespace.clone(),
            settings.reconnect_interval,
            events,
            counters,
            shutdown_rx,
        ));

        (Self { shared }, task)
    }

    /// Stop the connection without reconnecting. Idempotent.
    pub fn disconnect(&self) {
        if self.shared.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        tracing::info!("disconnecting from MQTT broker");
        self.shared.connected.store(false, Ordering::SeqCst);
        let _ = self.shared.shutdown.send(true);
    }
}

impl ConnectionStatus for TransportHandle {
    fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::SeqCst)
    }
}

impl Publisher for TransportHandle {
    fn publish(&self, topic: &str, payload: &[u8]) -> bool {
        if self.shared.stopped.load(Ordering::SeqCst) || !self.is_connected() {
            tracing::warn!(topic, "MQTT not connected, cannot publish");
            return false;
        }
        match self
            .shared
            .client
            .try_publish(topic, QoS::AtMostOnce, false, payload.to_vec())
        {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(topic, error = %e, "failed to queue publish");
                false
            }
        }
    }
}

/// Map one inbound publish to a typed event.
pub fn decode_message(
    namespace: &str,
    topic: &str,
    payload: &[u8],
) -> Result<InboundEvent, TransportError> {
    let kind = TopicKind::from_topic(namespace, topic)
        .ok_or_else(|| TransportError::UnexpectedTopic(topic.to_string()))?;
    Ok(decode_payload(kind, payload)?)
}

fn subscribe_all(client: &AsyncClient, namespace: &str) {
    for kind in TopicKind::ALL {
        let topic = kind.topic(namespace);
        match client.try_subscribe(topic.as_str(), QoS::AtMostOnce) {
            Ok(()) => tracing::info!(topic = %topic, "subscribed"),
            Err(e) => tracing::error!(topic = %topic, error = %e, "failed to subscribe"),
        }
    }
}

/// Decode one publish and queue it for the pipeline. Undecodable payloads
/// are counted and dropped. Breaks when the pipeline is gone or shutdown
/// fires while the queue is full.
async fn forward_publish(
    namespace: &str,
    publish: &Publish,
    events: &mpsc::Sender<InboundEvent>,
    counters: &Counters,
    shutdown: &mut watch::Receiver<bool>,
) -> ControlFlow<()> {
    let event = match decode_message(namespace, &publish.topic, &publish.payload) {
        Ok(event) => event,
        Err(e) => {
            counters.record_decode_failure();
            tracing::warn!(topic = %publish.topic, error = %e, "dropping undecodable message");
            return ControlFlow::Continue(());
        }
    };
    tracing::debug!(topic = %publish.topic, kind = %event.kind(), "message decoded");
    tokio::select! {
        sent = events.send(event) => {
            if sent.is_err() {
                tracing::info!("pipeline gone; transport stopping");
                return ControlFlow::Break(());
            }
            ControlFlow::Continue(())
        }
        _ = shutdown.changed() => {
            tracing::info!("shutdown while pipeline queue full; dropping message");
            ControlFlow::Break(())
        }
    }
}

async fn run_event_loop(
    mut eventloop: EventLoop,
    shared: Arc<Shared>,
    namespace: String,
    reconnect_interval: Duration,
    events: mpsc::Sender<InboundEvent>,
    counters: Arc<Counters>,
    mut shutdown: watch::Receiver<bool>,
) {
    // Whether the broker acknowledged the current connection.
    let mut session_up = false;
    loop {
        let polled = tokio::select! {
            polled = eventloop.poll() => polled,
            _ = shutdown.changed() => break,
        };

        match polled {
            Ok(Event::Incoming(Packet::ConnAck(_))) => {
                session_up = true;
                shared.connected.store(true, Ordering::SeqCst);
                tracing::info!("MQTT connected");
                subscribe_all(&shared.client, &namespace);
            }
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                let flow =
                    forward_publish(&namespace, &publish, &events, &counters, &mut shutdown).await;
                if flow.is_break() {
                    break;
                }
            }
            Ok(Event::Incoming(Packet::Disconnect)) => {
                session_up = false;
                shared.connected.store(false, Ordering::SeqCst);
                tracing::warn!("broker sent DISCONNECT");
            }
            Ok(_) => {}
            Err(e) => {
                session_up = false;
                shared.connected.store(false, Ordering::SeqCst);
                if shared.stopped.load(Ordering::SeqCst) {
                    break;
                }
                let err = TransportError::from(e);
                tracing::warn!(
                    error = %err,
                    retry_ms = reconnect_interval.as_millis() as u64,
                    "MQTT connection lost; reconnecting"
                );
                tokio::select! {
                    _ = tokio::time::sleep(reconnect_interval) => {}
                    _ = shutdown.changed() => break,
                }
            }
        }
    }

    // Without an acknowledged session, polling again would start a fresh
    // connect attempt instead of flushing DISCONNECT.
    if session_up && shared.client.try_disconnect().is_ok() {
        let _ = tokio::time::timeout(DISCONNECT_FLUSH, eventloop.poll()).await;
    }
    shared.connected.store(false, Ordering::SeqCst);
    tracing::info!("MQTT event loop stopped");
}
