//! Data model for sensor readings and quarantined payloads.
//!
//! Every reading that flows through the durable queue is a [`Record`]: an
//! ordered mapping of measurement names to (value, unit) pairs plus the
//! sampling metadata (`sampletime`, `sequence`, `queue_length`). Records are
//! serialized in one canonical form everywhere: queue log lines, pull
//! responses and push payloads all use the same JSON object with sorted
//! measurement keys.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A single measurement taken from a sensor.
///
/// `value` is `None` when the sensor read failed or the hardware is absent;
/// the null must round-trip because absence is itself meaningful data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Measurement {
    /// Measured value, or `None` if the sensor could not produce one
    pub value: Option<f64>,

    /// Unit of measurement (e.g. "celsius", "percent", "counts")
    pub unit: String,
}

impl Measurement {
    /// Create a measurement with a value.
    pub fn new(value: f64, unit: impl Into<String>) -> Self {
        Self {
            value: Some(value),
            unit: unit.into(),
        }
    }

    /// Create a measurement whose value is absent (failed sensor read).
    pub fn missing(unit: impl Into<String>) -> Self {
        Self {
            value: None,
            unit: unit.into(),
        }
    }
}

/// A composite reading assembled by the producer loop on each sampling cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    /// Wall-clock timestamp at sample time
    pub sampletime: DateTime<Utc>,

    /// Monotonically increasing per-device counter, starts at 1
    pub sequence: u64,

    /// Queue depth at sample time, for diagnostics
    pub queue_length: u64,

    /// Measurement name -> (value, unit), sorted by name
    pub measurements: BTreeMap<String, Measurement>,
}

impl Record {
    /// Create a record with the given metadata and measurements.
    pub fn new(
        sampletime: DateTime<Utc>,
        sequence: u64,
        queue_length: u64,
        measurements: BTreeMap<String, Measurement>,
    ) -> Self {
        Self {
            sampletime,
            sequence,
            queue_length,
            measurements,
        }
    }

    /// Well-formedness check run by the delivery paths before encoding.
    ///
    /// A record that fails here is routed to the quarantine store rather
    /// than re-enqueued, so a single poisoned record cannot stall delivery.
    pub fn validate(&self) -> Result<(), SerializationError> {
        if self.sequence == 0 {
            return Err(SerializationError::Invalid(
                "sequence must start at 1".to_string(),
            ));
        }

        for (name, measurement) in &self.measurements {
            if name.is_empty() {
                return Err(SerializationError::Invalid(
                    "empty measurement name".to_string(),
                ));
            }

            if let Some(value) = measurement.value {
                if !value.is_finite() {
                    return Err(SerializationError::Invalid(format!(
                        "non-finite value for measurement '{}'",
                        name
                    )));
                }
            }
        }

        Ok(())
    }

    /// Validate and serialize this record into its canonical JSON form.
    pub fn encode(&self) -> Result<Vec<u8>, SerializationError> {
        self.validate()?;
        serde_json::to_vec(self).map_err(SerializationError::Json)
    }
}

/// Serialize a batch of records as a canonical JSON array.
///
/// Used by the pull delivery service for response payloads. Callers are
/// expected to have swept invalid records to quarantine beforehand.
pub fn encode_batch(records: &[Record]) -> Result<Vec<u8>, SerializationError> {
    for record in records {
        record.validate()?;
    }
    serde_json::to_vec(records).map_err(SerializationError::Json)
}

/// A record that could not be validated or delivered.
///
/// Written once to the quarantine store and never automatically retried;
/// exists purely for offline forensic recovery.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuarantineRecord {
    /// Unique identifier for forensic reference
    pub id: Uuid,

    /// Why the record was quarantined
    pub message: String,

    /// Original payload bytes as captured at failure time
    pub original_payload: Vec<u8>,

    /// When the record was quarantined
    pub timestamp: DateTime<Utc>,
}

impl QuarantineRecord {
    /// Create a quarantine record stamped with the current time.
    pub fn new(message: impl Into<String>, original_payload: Vec<u8>) -> Self {
        Self {
            id: Uuid::new_v4(),
            message: message.into(),
            original_payload,
            timestamp: Utc::now(),
        }
    }
}

/// Errors raised while validating or encoding records.
#[derive(Debug)]
pub enum SerializationError {
    /// The record failed the well-formedness check
    Invalid(String),

    /// JSON encoding failed
    Json(serde_json::Error),
}

impl std::fmt::Display for SerializationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SerializationError::Invalid(reason) => {
                write!(f, "record failed validation: {}", reason)
            }
            SerializationError::Json(e) => write!(f, "failed to encode record: {}", e),
        }
    }
}

impl std::error::Error for SerializationError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            SerializationError::Json(e) => Some(e),
            SerializationError::Invalid(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_record(sequence: u64) -> Record {
        let mut measurements = BTreeMap::new();
        measurements.insert("small".to_string(), Measurement::new(42.0, "counts"));
        measurements.insert("large".to_string(), Measurement::new(7.0, "counts"));
        Record::new(Utc::now(), sequence, 0, measurements)
    }

    #[test]
    fn test_record_round_trip() {
        let record = sample_record(1);
        let bytes = record.encode().unwrap();
        let decoded: Record = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(record, decoded);
    }

    #[test]
    fn test_missing_value_round_trips_as_null() {
        let mut measurements = BTreeMap::new();
        measurements.insert(
            "temperature".to_string(),
            Measurement::missing("celsius"),
        );
        let record = Record::new(Utc::now(), 1, 3, measurements);

        let bytes = record.encode().unwrap();
        let json: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert!(json["measurements"]["temperature"]["value"].is_null());

        let decoded: Record = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(decoded.measurements["temperature"].value, None);
    }

    #[test]
    fn test_measurement_keys_are_sorted() {
        let record = sample_record(1);
        let bytes = record.encode().unwrap();
        let text = String::from_utf8(bytes).unwrap();

        let large_pos = text.find("\"large\"").unwrap();
        let small_pos = text.find("\"small\"").unwrap();
        assert!(large_pos < small_pos);
    }

    #[test]
    fn test_validate_rejects_zero_sequence() {
        let mut record = sample_record(1);
        record.sequence = 0;
        assert!(matches!(
            record.validate(),
            Err(SerializationError::Invalid(_))
        ));
    }

    #[test]
    fn test_validate_rejects_non_finite_value() {
        let mut record = sample_record(1);
        record
            .measurements
            .insert("bad".to_string(), Measurement::new(f64::NAN, "unitless"));
        assert!(record.validate().is_err());
        assert!(record.encode().is_err());
    }

    #[test]
    fn test_encode_batch() {
        let records = vec![sample_record(1), sample_record(2)];
        let bytes = encode_batch(&records).unwrap();
        let decoded: Vec<Record> = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(decoded.len(), 2);
        assert_eq!(decoded[1].sequence, 2);
    }

    #[test]
    fn test_encode_batch_empty() {
        let bytes = encode_batch(&[]).unwrap();
        assert_eq!(bytes, b"[]");
    }

    #[test]
    fn test_quarantine_record_captures_payload() {
        let qr = QuarantineRecord::new("schema rejection", vec![1, 2, 3]);
        assert_eq!(qr.original_payload, vec![1, 2, 3]);
        assert_eq!(qr.message, "schema rejection");
    }
}
