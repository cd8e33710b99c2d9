//! Captured recording metadata.
//!
//! A `Recording` is created once on the device at capture time. Its `id`
//! is the idempotency key for ingestion and is never regenerated, no
//! matter how many times the upload is retried.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

/// One captured audio segment of a clinical encounter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Recording {
    /// Client-generated opaque token, stable across retries.
    pub id: Uuid,

    /// The clinician who captured the encounter.
    pub owner_id: Uuid,

    /// The clinic the encounter belongs to.
    pub clinic_id: Uuid,

    /// Optional patient reference (external identifier).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub patient_ref: Option<String>,

    /// Optional encounter reference (external identifier).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub encounter_ref: Option<String>,

    /// Size of the audio payload in bytes.
    pub byte_size: u64,

    /// Duration of the audio in milliseconds.
    pub duration_ms: u64,

    /// SHA-256 of the audio payload, hex-encoded. Verified server-side.
    pub content_hash: String,

    /// When the capture finished on the device.
    pub captured_at: DateTime<Utc>,
}

impl Recording {
    /// Create a recording for a finished capture. Generates the id here,
    /// exactly once.
    pub fn capture(owner_id: Uuid, clinic_id: Uuid, audio: &[u8], duration_ms: u64) -> Self {
        Self {
            id: Uuid::new_v4(),
            owner_id,
            clinic_id,
            patient_ref: None,
            encounter_ref: None,
            byte_size: audio.len() as u64,
            duration_ms,
            content_hash: content_hash(audio),
            captured_at: Utc::now(),
        }
    }

    /// Attach a patient reference.
    pub fn with_patient(mut self, patient_ref: impl Into<String>) -> Self {
        self.patient_ref = Some(patient_ref.into());
        self
    }

    /// Attach an encounter reference.
    pub fn with_encounter(mut self, encounter_ref: impl Into<String>) -> Self {
        self.encounter_ref = Some(encounter_ref.into());
        self
    }

    /// Whether `audio` matches the hash recorded at capture time.
    pub fn verify(&self, audio: &[u8]) -> bool {
        content_hash(audio) == self.content_hash
    }
}

/// SHA-256 of a payload, hex-encoded.
pub fn content_hash(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capture_hashes_payload() {
        let audio = b"fake aac frames";
        let rec = Recording::capture(Uuid::new_v4(), Uuid::new_v4(), audio, 1200);

        assert_eq!(rec.byte_size, audio.len() as u64);
        assert_eq!(rec.content_hash.len(), 64);
        assert!(rec.verify(audio));
        assert!(!rec.verify(b"different payload"));
    }

    #[test]
    fn ids_are_unique_per_capture() {
        let a = Recording::capture(Uuid::new_v4(), Uuid::new_v4(), b"x", 10);
        let b = Recording::capture(Uuid::new_v4(), Uuid::new_v4(), b"x", 10);
        assert_ne!(a.id, b.id);
    }

    #[test]
    fn serialization_round_trip() {
        let rec = Recording::capture(Uuid::new_v4(), Uuid::new_v4(), b"abc", 500)
            .with_patient("patient-17")
            .with_encounter("enc-9");

        let json = serde_json::to_string(&rec).unwrap();
        let parsed: Recording = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, rec);
    }
}
