//! Sensor capability interface and the static sensor registry.
//!
//! Each sensor exposes `start` / `read` / `stop`; the producer loop calls
//! `read` once per sampling cycle and tolerates per-sensor failures. Sensor
//! kinds are a closed set resolved once at startup from configuration;
//! there is no dynamic loading.
//!
//! The real hardware drivers (serial particle counters, I2C climate
//! sensors) live outside this crate; the implementations here simulate
//! their output so the pipeline can run and be tested end to end.

use std::collections::BTreeMap;

use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::record::Measurement;

/// A transient failure while reading a sensor.
///
/// Never fatal: the producer loop substitutes null values for the sensor's
/// fields and keeps sampling.
#[derive(Debug)]
pub struct SensorReadError {
    /// Which sensor failed
    pub sensor: &'static str,

    /// What went wrong
    pub message: String,
}

impl SensorReadError {
    pub fn new(sensor: &'static str, message: impl Into<String>) -> Self {
        Self {
            sensor,
            message: message.into(),
        }
    }
}

impl std::fmt::Display for SensorReadError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "sensor '{}' read failed: {}", self.sensor, self.message)
    }
}

impl std::error::Error for SensorReadError {}

/// Capability interface every configured sensor exposes.
pub trait Sensor: Send {
    /// Stable identifier used in logs.
    fn name(&self) -> &'static str;

    /// The (measurement name, unit) pairs this sensor contributes.
    ///
    /// Used to substitute null values when a read fails, so absence still
    /// round-trips through the record.
    fn fields(&self) -> &'static [(&'static str, &'static str)];

    /// Bring the sensor up. Called once before the first read.
    fn start(&mut self);

    /// Take one reading.
    fn read(&mut self) -> Result<BTreeMap<String, Measurement>, SensorReadError>;

    /// Shut the sensor down. Called once at process exit.
    fn stop(&mut self);
}

/// The closed set of sensor kinds the registry can build.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SensorKind {
    /// Airborne particle counter (small/large counts)
    Particle,

    /// Temperature and humidity sensor
    Climate,
}

impl SensorKind {
    /// Build the sensor for this kind.
    pub fn build(self) -> Box<dyn Sensor> {
        match self {
            SensorKind::Particle => Box::new(ParticleSensor::new()),
            SensorKind::Climate => Box::new(ClimateSensor::new(true)),
        }
    }
}

/// Simulated airborne particle counter.
///
/// Stands in for a serial-attached counter reporting small and large
/// particle counts per sample.
pub struct ParticleSensor {
    started: bool,
}

impl ParticleSensor {
    pub fn new() -> Self {
        Self { started: false }
    }
}

impl Default for ParticleSensor {
    fn default() -> Self {
        Self::new()
    }
}

impl Sensor for ParticleSensor {
    fn name(&self) -> &'static str {
        "particle"
    }

    fn fields(&self) -> &'static [(&'static str, &'static str)] {
        &[("small", "counts"), ("large", "counts")]
    }

    fn start(&mut self) {
        debug!(sensor = self.name(), "Starting sensor");
        self.started = true;
    }

    fn read(&mut self) -> Result<BTreeMap<String, Measurement>, SensorReadError> {
        if !self.started {
            return Err(SensorReadError::new(self.name(), "sensor not started"));
        }

        let mut rng = rand::thread_rng();
        let small = rng.gen_range(20..2000) as f64;
        // Large particles track small counts at a much lower rate.
        let large = rng.gen_range(0..(small as u64 / 10).max(1)) as f64;

        let mut values = BTreeMap::new();
        values.insert("small".to_string(), Measurement::new(small, "counts"));
        values.insert("large".to_string(), Measurement::new(large, "counts"));
        Ok(values)
    }

    fn stop(&mut self) {
        debug!(sensor = self.name(), "Stopping sensor");
        self.started = false;
    }
}

/// Simulated temperature/humidity sensor.
///
/// The hardware this stands in for is optional on real deployments, so the
/// unavailable case is modeled too: readings come back with null values
/// rather than an error, matching what the pipeline stores for an absent
/// sensor.
pub struct ClimateSensor {
    available: bool,
}

impl ClimateSensor {
    pub fn new(available: bool) -> Self {
        Self { available }
    }
}

impl Sensor for ClimateSensor {
    fn name(&self) -> &'static str {
        "climate"
    }

    fn fields(&self) -> &'static [(&'static str, &'static str)] {
        &[("temperature", "celsius"), ("humidity", "percent")]
    }

    fn start(&mut self) {
        debug!(
            sensor = self.name(),
            available = self.available,
            "Starting sensor"
        );
    }

    fn read(&mut self) -> Result<BTreeMap<String, Measurement>, SensorReadError> {
        let mut values = BTreeMap::new();

        if !self.available {
            values.insert(
                "temperature".to_string(),
                Measurement::missing("celsius"),
            );
            values.insert("humidity".to_string(), Measurement::missing("percent"));
            return Ok(values);
        }

        let mut rng = rand::thread_rng();
        let temperature = rng.gen_range(18.0..28.0_f64).round();
        let humidity = rng.gen_range(30.0..60.0_f64).round();

        values.insert(
            "temperature".to_string(),
            Measurement::new(temperature, "celsius"),
        );
        values.insert(
            "humidity".to_string(),
            Measurement::new(humidity, "percent"),
        );
        Ok(values)
    }

    fn stop(&mut self) {
        debug!(sensor = self.name(), "Stopping sensor");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_particle_sensor_reads_after_start() {
        let mut sensor = ParticleSensor::new();
        sensor.start();

        let values = sensor.read().unwrap();
        assert_eq!(values.len(), 2);
        assert!(values["small"].value.is_some());
        assert!(values["large"].value.is_some());
        assert_eq!(values["small"].unit, "counts");
    }

    #[test]
    fn test_particle_sensor_fails_before_start() {
        let mut sensor = ParticleSensor::new();
        let err = sensor.read().unwrap_err();
        assert_eq!(err.sensor, "particle");
    }

    #[test]
    fn test_climate_sensor_available() {
        let mut sensor = ClimateSensor::new(true);
        sensor.start();

        let values = sensor.read().unwrap();
        let temperature = values["temperature"].value.unwrap();
        assert!((18.0..=28.0).contains(&temperature));
        let humidity = values["humidity"].value.unwrap();
        assert!((30.0..=60.0).contains(&humidity));
    }

    #[test]
    fn test_climate_sensor_unavailable_yields_nulls() {
        let mut sensor = ClimateSensor::new(false);
        sensor.start();

        let values = sensor.read().unwrap();
        assert_eq!(values["temperature"].value, None);
        assert_eq!(values["humidity"].value, None);
        assert_eq!(values["temperature"].unit, "celsius");
    }

    #[test]
    fn test_registry_builds_each_kind() {
        let particle = SensorKind::Particle.build();
        assert_eq!(particle.name(), "particle");

        let climate = SensorKind::Climate.build();
        assert_eq!(climate.name(), "climate");
    }

    #[test]
    fn test_sensor_kind_deserializes_from_config_names() {
        let kind: SensorKind = serde_json::from_str("\"particle\"").unwrap();
        assert_eq!(kind, SensorKind::Particle);

        let unknown = serde_json::from_str::<SensorKind>("\"dynamic_import\"");
        assert!(unknown.is_err());
    }
}
