//! Producer loop: samples sensors and pushes composite records.
//!
//! State machine: `Starting -> Sampling <-> Waiting -> Stopped`. Every
//! cycle reads all configured sensors, merges their measurements with the
//! sampling metadata and pushes one record into the durable queue. Failures
//! are absorbed: a silent sensor is preferable to a dead logger in an
//! unattended deployment, so nothing on this path is fatal.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::queue::DurableQueue;
use crate::record::{Measurement, Record};
use crate::sensor::Sensor;

/// Backoff after a cycle with a sensor or queue failure.
const FAILURE_BACKOFF: Duration = Duration::from_secs(15);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ProducerState {
    Starting,
    Sampling,
    Waiting,
    Stopped,
}

/// Periodically samples the configured sensors into the durable queue.
pub struct Producer {
    queue: Arc<DurableQueue>,
    sensors: Vec<Box<dyn Sensor>>,
    interval: Duration,
    shutdown: watch::Receiver<bool>,
    state: ProducerState,
}

impl Producer {
    pub fn new(
        queue: Arc<DurableQueue>,
        sensors: Vec<Box<dyn Sensor>>,
        interval: Duration,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            queue,
            sensors,
            interval,
            shutdown,
            state: ProducerState::Starting,
        }
    }

    /// Run until the shutdown signal fires.
    pub async fn run(mut self) {
        info!(
            sensors = self.sensors.len(),
            interval_secs = self.interval.as_secs(),
            "Producer loop starting"
        );

        for sensor in &mut self.sensors {
            sensor.start();
        }

        let mut sequence: u64 = 0;

        while !*self.shutdown.borrow() {
            self.transition(ProducerState::Sampling);

            sequence += 1;
            let (record, had_failure) = self.sample(sequence);

            let push_failed = match self.queue.push(record) {
                Ok(()) => {
                    debug!(sequence = sequence, "Pushed sampling record");
                    false
                }
                Err(e) => {
                    // Treated like any transient fault: log, back off, keep
                    // sampling.
                    warn!(error = %e, sequence = sequence, "Failed to push record");
                    true
                }
            };

            self.transition(ProducerState::Waiting);
            let delay = if had_failure || push_failed {
                FAILURE_BACKOFF.min(self.interval)
            } else {
                self.interval
            };

            if self.wait(delay).await {
                break;
            }
        }

        self.transition(ProducerState::Stopped);
        for sensor in &mut self.sensors {
            sensor.stop();
        }
        info!("Producer loop stopped");
    }

    /// Read every sensor and assemble the composite record.
    ///
    /// A failed sensor contributes null values for each of its fields, so
    /// absence round-trips instead of silently narrowing the record.
    fn sample(&mut self, sequence: u64) -> (Record, bool) {
        let queue_length = self.queue.len() as u64;
        let mut measurements = BTreeMap::new();
        let mut had_failure = false;

        for sensor in &mut self.sensors {
            match sensor.read() {
                Ok(values) => {
                    measurements.extend(values);
                }
                Err(e) => {
                    warn!(sensor = sensor.name(), error = %e, "Sensor read failed");
                    had_failure = true;
                    for (name, unit) in sensor.fields() {
                        measurements.insert((*name).to_string(), Measurement::missing(*unit));
                    }
                }
            }
        }

        let record = Record::new(Utc::now(), sequence, queue_length, measurements);
        (record, had_failure)
    }

    /// Sleep for `delay`, waking immediately on shutdown. Returns true if
    /// shutdown fired.
    async fn wait(&mut self, delay: Duration) -> bool {
        tokio::select! {
            _ = tokio::time::sleep(delay) => false,
            _ = self.shutdown.changed() => true,
        }
    }

    fn transition(&mut self, next: ProducerState) {
        if self.state != next {
            debug!(from = ?self.state, to = ?next, "Producer state change");
            self.state = next;
        }
    }
}
