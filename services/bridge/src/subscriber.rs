//! MQTT subscriber with mutual TLS, bounded reconnection, and clean shutdown.
//!
//! The subscriber owns the broker session and runs the MQTT event loop in its
//! own task. Every PUBLISH on the configured topic is stamped with its receipt
//! time and handed to the pipeline through a bounded channel, so decoding and
//! persistence never run on the network loop.

use crate::config::MqttConfig;
use crate::identity::{Identity, IdentityError};
use backoff::backoff::{Backoff, Constant};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use rumqttc::{
    AsyncClient, ClientError, ConnectReturnCode, ConnectionError, Event, EventLoop, MqttOptions,
    Outgoing, Packet, QoS, SubscribeReasonCode, Transport,
};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Capacity of the request queue between the client handle and the event loop.
const REQUEST_CAPACITY: usize = 16;

/// How long shutdown waits for the DISCONNECT to be flushed.
const DISCONNECT_TIMEOUT: Duration = Duration::from_secs(2);

/// Errors that can occur during the subscriber's lifetime.
#[derive(Debug, Error)]
pub enum SubscriberError {
    #[error("TLS handshake with broker failed: {0}")]
    Handshake(String),

    #[error("Broker refused connection: {0:?}")]
    Refused(ConnectReturnCode),

    #[error("Subscription to {topic} rejected by broker")]
    SubscribeRejected { topic: String },

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Failed to queue MQTT request: {0}")]
    Client(#[from] ClientError),

    #[error("Invalid TLS identity: {0}")]
    Identity(#[from] IdentityError),

    #[error("Giving up after {attempts} consecutive failed sessions")]
    ReconnectExhausted { attempts: u32 },

    #[error("Message channel closed")]
    ChannelClosed,
}

impl From<ConnectionError> for SubscriberError {
    fn from(err: ConnectionError) -> Self {
        match err {
            ConnectionError::Tls(e) => SubscriberError::Handshake(e.to_string()),
            ConnectionError::ConnectionRefused(code) => SubscriberError::Refused(code),
            other => SubscriberError::Connection(other.to_string()),
        }
    }
}

/// State of the broker session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Subscribed,
    /// Reconnect budget spent; terminal.
    Failed,
}

/// A message as received from the broker, not yet decoded.
#[derive(Debug, Clone)]
pub struct IncomingPublish {
    pub topic: String,
    pub payload: Bytes,
    pub received_at: DateTime<Utc>,
}

/// What to do after a session ends in failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconnectionDecision {
    Retry { attempt: u32, delay: Duration },
    GiveUp { attempts: u32 },
}

/// Fixed-delay reconnection with a bound on consecutive failures.
///
/// The failure count resets once a subscription is acknowledged, so a
/// long-lived session that later drops gets the full budget again.
pub struct ReconnectPolicy {
    max_attempts: u32,
    backoff: Constant,
    failures: u32,
}

impl ReconnectPolicy {
    pub fn new(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            backoff: Constant::new(delay),
            failures: 0,
        }
    }

    pub fn on_failure(&mut self) -> ReconnectionDecision {
        self.failures += 1;
        if self.failures >= self.max_attempts {
            return ReconnectionDecision::GiveUp {
                attempts: self.failures,
            };
        }

        ReconnectionDecision::Retry {
            attempt: self.failures,
            delay: self.backoff.next_backoff().unwrap_or_default(),
        }
    }

    pub fn on_subscribed(&mut self) {
        self.failures = 0;
        self.backoff.reset();
    }

    pub fn failures(&self) -> u32 {
        self.failures
    }
}

/// How the session reacts to an incoming packet.
#[derive(Debug, PartialEq)]
enum PacketAction {
    Subscribe,
    Subscribed,
    Rejected,
    Deliver,
    Ignore,
}

fn classify(packet: &Packet) -> PacketAction {
    match packet {
        Packet::ConnAck(_) => PacketAction::Subscribe,
        Packet::SubAck(ack) => {
            let accepted = !ack.return_codes.is_empty()
                && ack
                    .return_codes
                    .iter()
                    .all(|code| matches!(code, SubscribeReasonCode::Success(_)));
            if accepted {
                PacketAction::Subscribed
            } else {
                PacketAction::Rejected
            }
        }
        Packet::Publish(_) => PacketAction::Deliver,
        _ => PacketAction::Ignore,
    }
}

/// Receipt timestamp that never goes backwards within a session.
fn receipt_time(now: DateTime<Utc>, last: &mut Option<DateTime<Utc>>) -> DateTime<Utc> {
    let stamped = match *last {
        Some(previous) if previous > now => previous,
        _ => now,
    };
    *last = Some(stamped);
    stamped
}

fn qos(level: u8) -> QoS {
    match level {
        0 => QoS::AtMostOnce,
        1 => QoS::AtLeastOnce,
        _ => QoS::ExactlyOnce,
    }
}

enum SessionEnd {
    Cancelled,
    Failed(SubscriberError),
}

/// Owns the secured broker connection for the lifetime of the process.
pub struct Subscriber {
    config: MqttConfig,
    identity: Identity,
    state: Arc<RwLock<ConnectionState>>,
}

impl Subscriber {
    pub fn new(config: MqttConfig, identity: Identity) -> Self {
        Self {
            config,
            identity,
            state: Arc::new(RwLock::new(ConnectionState::Disconnected)),
        }
    }

    /// Get the current connection state.
    pub fn state(&self) -> ConnectionState {
        *self.state.read()
    }

    fn set_state(&self, state: ConnectionState) {
        *self.state.write() = state;
    }

    fn options(&self) -> Result<MqttOptions, SubscriberError> {
        let mut options = self.session_options();
        options.set_transport(Transport::Tls(self.identity.tls_configuration()?));

        Ok(options)
    }

    /// Session settings independent of the transport.
    fn session_options(&self) -> MqttOptions {
        let mut options = MqttOptions::new(
            self.config.client_id.clone(),
            self.config.broker.clone(),
            self.config.port,
        );
        options
            .set_keep_alive(self.config.keep_alive())
            .set_clean_session(true)
            .set_max_packet_size(self.config.max_packet_size, self.config.max_packet_size);

        options
    }

    /// Run until cancelled or until the reconnect budget is spent.
    ///
    /// Messages go to `tx` in arrival order. The sender is dropped on return,
    /// which lets the pipeline drain and finish.
    pub async fn run(
        &self,
        tx: mpsc::Sender<IncomingPublish>,
        cancel: CancellationToken,
    ) -> Result<(), SubscriberError> {
        let mut policy = ReconnectPolicy::new(
            self.config.reconnect_attempts,
            self.config.reconnect_delay(),
        );

        loop {
            self.set_state(ConnectionState::Connecting);
            info!(
                broker = %self.config.broker,
                port = self.config.port,
                client_id = %self.config.client_id,
                "Connecting to MQTT broker"
            );

            let (client, eventloop) = AsyncClient::new(self.options()?, REQUEST_CAPACITY);

            match self.session(&client, eventloop, &tx, &cancel, &mut policy).await {
                SessionEnd::Cancelled => {
                    self.set_state(ConnectionState::Disconnected);
                    info!("MQTT subscriber stopped");
                    return Ok(());
                }
                SessionEnd::Failed(SubscriberError::ChannelClosed) => {
                    self.set_state(ConnectionState::Disconnected);
                    return Err(SubscriberError::ChannelClosed);
                }
                SessionEnd::Failed(e) => {
                    self.set_state(ConnectionState::Disconnected);
                    if let SubscriberError::Handshake(ref detail) = e {
                        error!(broker = %self.config.broker, error = %detail, "TLS handshake rejected");
                    }

                    match policy.on_failure() {
                        ReconnectionDecision::Retry { attempt, delay } => {
                            warn!(
                                attempt = attempt,
                                max_attempts = self.config.reconnect_attempts,
                                delay_ms = delay.as_millis() as u64,
                                error = %e,
                                "MQTT session failed, reconnecting"
                            );
                            metrics::counter!("bridge.mqtt.reconnects").increment(1);

                            tokio::select! {
                                _ = cancel.cancelled() => {
                                    info!("MQTT subscriber stopped during reconnect delay");
                                    return Ok(());
                                }
                                _ = tokio::time::sleep(delay) => {}
                            }
                        }
                        ReconnectionDecision::GiveUp { attempts } => {
                            self.set_state(ConnectionState::Failed);
                            error!(
                                attempts = attempts,
                                error = %e,
                                "MQTT reconnect budget exhausted"
                            );
                            return Err(SubscriberError::ReconnectExhausted { attempts });
                        }
                    }
                }
            }
        }
    }

    /// Drive one connection from CONNECT until it fails or is cancelled.
    async fn session(
        &self,
        client: &AsyncClient,
        mut eventloop: EventLoop,
        tx: &mpsc::Sender<IncomingPublish>,
        cancel: &CancellationToken,
        policy: &mut ReconnectPolicy,
    ) -> SessionEnd {
        let mut last_received = None;

        loop {
            let polled = tokio::select! {
                biased;
                _ = cancel.cancelled() => None,
                event = eventloop.poll() => Some(event),
            };

            let Some(event) = polled else {
                self.disconnect(client, &mut eventloop).await;
                return SessionEnd::Cancelled;
            };

            let packet = match event {
                Ok(Event::Incoming(packet)) => packet,
                Ok(Event::Outgoing(_)) => continue,
                Err(e) => return SessionEnd::Failed(e.into()),
            };

            match classify(&packet) {
                PacketAction::Subscribe => {
                    self.set_state(ConnectionState::Connected);
                    info!(broker = %self.config.broker, "Connected to MQTT broker");

                    if let Err(e) = client.try_subscribe(self.config.topic.clone(), qos(self.config.qos)) {
                        return SessionEnd::Failed(e.into());
                    }
                }
                PacketAction::Subscribed => {
                    self.set_state(ConnectionState::Subscribed);
                    policy.on_subscribed();
                    info!(topic = %self.config.topic, qos = self.config.qos, "Subscribed to topic");
                }
                PacketAction::Rejected => {
                    error!(topic = %self.config.topic, packet = ?packet, "Broker rejected subscription");
                    return SessionEnd::Failed(SubscriberError::SubscribeRejected {
                        topic: self.config.topic.clone(),
                    });
                }
                PacketAction::Deliver => {
                    let Packet::Publish(publish) = packet else {
                        continue;
                    };
                    let received_at = receipt_time(Utc::now(), &mut last_received);

                    debug!(
                        topic = %publish.topic,
                        size_bytes = publish.payload.len(),
                        "Received message"
                    );
                    metrics::counter!("bridge.messages.received").increment(1);

                    let message = IncomingPublish {
                        topic: publish.topic,
                        payload: publish.payload,
                        received_at,
                    };
                    if tx.send(message).await.is_err() {
                        error!("Pipeline channel closed, stopping subscriber");
                        self.disconnect(client, &mut eventloop).await;
                        return SessionEnd::Failed(SubscriberError::ChannelClosed);
                    }
                }
                PacketAction::Ignore => {}
            }
        }
    }

    /// Unsubscribe and disconnect, flushing the DISCONNECT packet.
    async fn disconnect(&self, client: &AsyncClient, eventloop: &mut EventLoop) {
        if self.state() == ConnectionState::Subscribed {
            if let Err(e) = client.try_unsubscribe(self.config.topic.clone()) {
                warn!(error = %e, "Failed to queue unsubscribe");
            }
        }
        if let Err(e) = client.try_disconnect() {
            warn!(error = %e, "Failed to queue disconnect");
            return;
        }

        let drain = async {
            loop {
                match eventloop.poll().await {
                    Ok(Event::Outgoing(Outgoing::Disconnect)) => return Ok(()),
                    Ok(_) => {}
                    Err(e) => return Err(e),
                }
            }
        };

        match tokio::time::timeout(DISCONNECT_TIMEOUT, drain).await {
            Ok(Ok(())) => info!("Disconnected from MQTT broker"),
            Ok(Err(e)) => warn!(error = %e, "Connection lost before DISCONNECT was sent"),
            Err(_) => warn!("Timed out waiting for MQTT disconnect"),
        }
    }
}
