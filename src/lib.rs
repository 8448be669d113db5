//! Field Logger Library
//!
//! Components for a crash-safe environmental data logger that must deliver
//! every reading at least once, across reboots and long network outages:
//!
//! - **config**: TOML-based deployment configuration
//! - **record**: reading records and their canonical serialized form
//! - **queue**: durable FIFO with decoupled soft-delete and flush
//! - **quarantine**: side-channel store for poison records
//! - **sensor**: sensor capability trait plus the static registry
//! - **producer**: sampling loop feeding the queue
//! - **pull**: collector-driven ack-and-fetch delivery service
//! - **push**: broker-driven confirmed-publish delivery agent
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use field_logger::config::Config;
//! use field_logger::queue::DurableQueue;
//! use field_logger::quarantine::QuarantineStore;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = Config::load("config.toml")?;
//! let queue = Arc::new(DurableQueue::open(&config.queue.data_path)?);
//! let quarantine = Arc::new(QuarantineStore::open(&config.queue.quarantine_path)?);
//!
//! // Sample a sensor and persist the reading.
//! let sensors: Vec<_> = config.sampling.sensors.iter().map(|k| k.build()).collect();
//! assert!(queue.is_empty());
//! # Ok(())
//! # }
//! ```

// Module declarations
pub mod config;
pub mod producer;
pub mod pull;
pub mod push;
pub mod quarantine;
pub mod queue;
pub mod record;
pub mod sensor;

// Re-export commonly used types at crate root for convenience
pub use config::{Config, ConfigError, DeliveryMode};
pub use producer::Producer;
pub use pull::{PullRequest, PullService};
pub use push::PushAgent;
pub use quarantine::QuarantineStore;
pub use queue::{DurableQueue, QueueError};
pub use record::{Measurement, QuarantineRecord, Record, SerializationError};
pub use sensor::{Sensor, SensorKind, SensorReadError};
