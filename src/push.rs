//! Push delivery agent: device-initiated publish loop toward an MQTT broker.
//!
//! State machine: `Disconnected -> Connecting -> Connected -> Publishing <->
//! AwaitingAck`, back to `Connecting` on any transport error and `Stopped`
//! on shutdown. Exactly one record is in flight at a time; the queue cursor
//! advances only on the broker's per-message confirmation, so an unacked
//! record is republished unchanged next session. Cursor flushes are
//! amortized over a confirmation window rather than per message.
//!
//! Reconnection uses a fixed backoff with an unbounded retry count: the
//! device cannot assume a human is present to intervene.

use std::sync::Arc;
use std::time::Duration;

use rumqttc::{AsyncClient, Event, LastWill, MqttOptions, Packet, QoS};
use serde_json::json;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::config::PushConfig;
use crate::quarantine::QuarantineStore;
use crate::queue::{DurableQueue, QueueError};
use crate::record::Record;

/// MQTT keep-alive interval.
const KEEP_ALIVE: Duration = Duration::from_secs(30);

/// Capacity of the rumqttc request channel.
const CLIENT_CHANNEL_CAPACITY: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DeliveryState {
    Disconnected,
    Connecting,
    Connected,
    Publishing,
    AwaitingAck,
    Stopped,
}

/// How a broker session ended.
enum SessionEnd {
    /// Shutdown signal fired
    Shutdown,

    /// Transport failed; reconnect after backoff
    Transport(String),
}

/// Topic names templated with the device hostname.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topics {
    /// Per-record data publishes
    pub data: String,

    /// Retained online/offline status (offline set via last-will)
    pub status: String,

    /// Retained device metadata, published once per session
    pub meta: String,
}

impl Topics {
    pub fn new(prefix: &str, device_name: &str) -> Self {
        let prefix = prefix.trim_end_matches('/');
        Self {
            data: format!("{}/{}/data", prefix, device_name),
            status: format!("{}/{}/status", prefix, device_name),
            meta: format!("{}/{}/meta", prefix, device_name),
        }
    }
}

/// Flush-cadence tracker: flush the cursor every Nth confirmation.
#[derive(Debug)]
pub struct AckWindow {
    window: u64,
    since_flush: u64,
}

impl AckWindow {
    pub fn new(window: u64) -> Self {
        Self {
            window: window.max(1),
            since_flush: 0,
        }
    }

    /// Register one confirmation; true means the caller should flush now.
    pub fn confirm(&mut self) -> bool {
        self.since_flush += 1;
        if self.since_flush >= self.window {
            self.since_flush = 0;
            true
        } else {
            false
        }
    }

    /// Confirmations soft-deleted but not yet flushed.
    pub fn pending(&self) -> u64 {
        self.since_flush
    }
}

/// Advance the queue past one confirmed record, flushing on the window
/// boundary.
fn confirm_delivery(queue: &DurableQueue, window: &mut AckWindow) -> Result<(), QueueError> {
    queue.delete(1);
    if window.confirm() {
        queue.flush()?;
    }
    Ok(())
}

fn qos_level(qos: u8) -> QoS {
    match qos {
        0 => QoS::AtMostOnce,
        1 => QoS::AtLeastOnce,
        _ => QoS::ExactlyOnce,
    }
}

/// Publishes queued records to the broker, one confirmed message at a time.
pub struct PushAgent {
    queue: Arc<DurableQueue>,
    quarantine: Arc<QuarantineStore>,
    config: PushConfig,
    topics: Topics,
    device_name: String,
    shutdown: watch::Receiver<bool>,
    state: DeliveryState,
    window: AckWindow,
}

impl PushAgent {
    pub fn new(
        queue: Arc<DurableQueue>,
        quarantine: Arc<QuarantineStore>,
        config: PushConfig,
        device_name: impl Into<String>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        let device_name = device_name.into();
        let topics = Topics::new(&config.topic_prefix, &device_name);
        let window = AckWindow::new(config.ack_flush_window);

        Self {
            queue,
            quarantine,
            config,
            topics,
            device_name,
            shutdown,
            state: DeliveryState::Disconnected,
            window,
        }
    }

    /// Run connect/publish/ack sessions until shutdown.
    pub async fn run(mut self) {
        info!(
            broker = %self.config.broker,
            port = self.config.port,
            topic = %self.topics.data,
            qos = self.config.qos,
            "Push delivery agent starting"
        );

        while !*self.shutdown.borrow() {
            self.transition(DeliveryState::Connecting);

            match self.session().await {
                SessionEnd::Shutdown => break,
                SessionEnd::Transport(reason) => {
                    warn!(
                        error = %reason,
                        retry_secs = self.config.reconnect_delay_secs,
                        "Broker session failed; will reconnect"
                    );
                    self.transition(DeliveryState::Disconnected);
                    self.flush_best_effort();

                    // Fixed backoff, unbounded retries.
                    let stop = tokio::select! {
                        _ = tokio::time::sleep(self.config.reconnect_delay()) => false,
                        _ = self.shutdown.changed() => true,
                    };
                    if stop {
                        break;
                    }
                }
            }
        }

        self.transition(DeliveryState::Stopped);
        self.flush_best_effort();
        info!("Push delivery agent stopped");
    }

    /// One broker session: connect, bootstrap, publish until it dies.
    async fn session(&mut self) -> SessionEnd {
        let mut options =
            MqttOptions::new(self.device_name.clone(), self.config.broker.clone(), self.config.port);
        options.set_keep_alive(KEEP_ALIVE);
        options.set_clean_session(false);
        options.set_last_will(LastWill::new(
            self.topics.status.clone(),
            "offline",
            QoS::AtLeastOnce,
            true,
        ));
        if let (Some(username), Some(password)) =
            (self.config.username.clone(), self.config.password.clone())
        {
            options.set_credentials(username, password);
        }

        let (client, mut eventloop) = AsyncClient::new(options, CLIENT_CHANNEL_CAPACITY);
        let qos = qos_level(self.config.qos);
        let queue = self.queue.clone();
        let mut shutdown = self.shutdown.clone();
        let mut connected = false;
        let mut in_flight = false;

        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    let _ = client.try_disconnect();
                    return SessionEnd::Shutdown;
                }

                event = eventloop.poll() => match event {
                    Ok(Event::Incoming(Packet::ConnAck(_))) => {
                        info!(broker = %self.config.broker, "Connected to broker");
                        self.transition(DeliveryState::Connected);

                        // Session bootstrap: retained liveness + metadata so
                        // the collector can tell stale devices from live
                        // ones. QoS 0 keeps these acks out of the data
                        // confirmation path.
                        let metadata = json!({
                            "device": self.device_name,
                            "firmware": env!("CARGO_PKG_VERSION"),
                        })
                        .to_string();

                        if let Err(e) = client
                            .publish(self.topics.status.as_str(), QoS::AtMostOnce, true, "online")
                            .await
                        {
                            return SessionEnd::Transport(e.to_string());
                        }
                        if let Err(e) = client
                            .publish(self.topics.meta.as_str(), QoS::AtMostOnce, true, metadata)
                            .await
                        {
                            return SessionEnd::Transport(e.to_string());
                        }

                        connected = true;
                        self.transition(DeliveryState::Publishing);
                    }

                    Ok(Event::Incoming(Packet::PubAck(_)))
                    | Ok(Event::Incoming(Packet::PubComp(_))) => {
                        if in_flight {
                            in_flight = false;
                            debug!("Broker confirmed delivery");
                            if let Err(e) = confirm_delivery(&queue, &mut self.window) {
                                warn!(error = %e, "Failed to flush cursor after confirmation");
                            }
                            self.transition(DeliveryState::Publishing);
                        }
                    }

                    Ok(_) => {}

                    Err(e) => return SessionEnd::Transport(e.to_string()),
                },

                // Deliver the oldest record once connected and idle. The
                // blocking peek is cancelled by the other select arms.
                records = queue.peek_blocking(1), if connected && !in_flight => {
                    let Some(record) = records.into_iter().next() else {
                        continue;
                    };

                    let payload = match record.encode() {
                        Ok(payload) => payload,
                        Err(e) => {
                            // Poison record: quarantine it and advance the
                            // cursor so the pipeline keeps moving.
                            if let Err(qe) = self.quarantine_head(&record, &e.to_string()) {
                                warn!(error = %qe, "Failed to quarantine poison record");
                            }
                            continue;
                        }
                    };

                    debug!(
                        sequence = record.sequence,
                        queue_length = queue.len(),
                        "Publishing record"
                    );

                    if let Err(e) = client
                        .publish(self.topics.data.as_str(), qos, false, payload)
                        .await
                    {
                        return SessionEnd::Transport(e.to_string());
                    }

                    if qos == QoS::AtMostOnce {
                        // Fire-and-forget: nothing will confirm, advance now.
                        if let Err(e) = confirm_delivery(&queue, &mut self.window) {
                            warn!(error = %e, "Failed to flush cursor");
                        }
                    } else {
                        in_flight = true;
                        self.transition(DeliveryState::AwaitingAck);
                    }
                }
            }
        }
    }

    fn quarantine_head(&self, record: &Record, reason: &str) -> Result<(), QueueError> {
        let payload = serde_json::to_vec(record).unwrap_or_default();
        self.quarantine.write(reason, payload)?;
        self.queue.delete(1);
        self.queue.flush()
    }

    /// Persist any soft-deleted-but-unflushed confirmations.
    fn flush_best_effort(&self) {
        if let Err(e) = self.queue.flush() {
            warn!(error = %e, "Best-effort flush failed");
        }
    }

    fn transition(&mut self, next: DeliveryState) {
        if self.state != next {
            debug!(from = ?self.state, to = ?next, "Push agent state change");
            self.state = next;
        }
    }
}
