use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;
use uuid::Uuid;

/// Length of the descriptor vectors produced by the 68-landmark extractor.
pub const DEFAULT_EMBEDDING_DIM: usize = 128;

/// Bounding box for a detected face, as reported by the external detector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    #[serde(default)]
    pub confidence: f32,
}

/// Face embedding vector (128-dimensional for the descriptor network in use).
///
/// Immutable once captured; serialized as a bare JSON array.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Embedding {
    pub values: Vec<f32>,
}

impl Embedding {
    pub fn new(values: Vec<f32>) -> Self {
        Self { values }
    }

    pub fn dim(&self) -> usize {
        self.values.len()
    }

    /// Compute Euclidean distance between two embeddings.
    ///
    /// Smaller is a better match. Callers must ensure both sides have the
    /// same dimension (see [`validate`](Self::validate)).
    pub fn euclidean_distance(&self, other: &Embedding) -> f32 {
        self.values
            .iter()
            .zip(other.values.iter())
            .map(|(a, b)| (a - b).powi(2))
            .sum::<f32>()
            .sqrt()
    }

    /// Reject vectors of the wrong length or with non-finite components.
    pub fn validate(&self, expected_dim: usize) -> Result<(), ProbeError> {
        if self.values.len() != expected_dim {
            return Err(ProbeError::MalformedEmbedding(format!(
                "expected {expected_dim}-dim embedding, got {}",
                self.values.len()
            )));
        }
        if let Some(idx) = self.values.iter().position(|v| !v.is_finite()) {
            return Err(ProbeError::MalformedEmbedding(format!(
                "non-finite component at index {idx}"
            )));
        }
        Ok(())
    }
}

/// Input-shape failures. `NoFaceDetected` and `MultipleFacesDetected` are
/// user-correctable; `MalformedEmbedding` means the extractor misbehaved.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ProbeError {
    #[error("no face detected")]
    NoFaceDetected,
    #[error("{0} faces detected; exactly one face required")]
    MultipleFacesDetected(usize),
    #[error("malformed embedding: {0}")]
    MalformedEmbedding(String),
}

/// One face as reported by the external detector/extractor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetectedFace {
    pub bbox: BoundingBox,
    pub embedding: Embedding,
}

/// Reduce a detector's face list to the single probe embedding.
pub fn single_probe(mut faces: Vec<DetectedFace>) -> Result<Embedding, ProbeError> {
    match faces.len() {
        0 => Err(ProbeError::NoFaceDetected),
        1 => Ok(faces.remove(0).embedding),
        n => Err(ProbeError::MultipleFacesDetected(n)),
    }
}

/// Enrollment payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdentityCandidate {
    pub identity_id: String,
    pub display_name: String,
    pub contact_address: String,
    pub group_tag: String,
    pub embedding: Embedding,
}

impl IdentityCandidate {
    /// Name of the first empty required field, if any.
    pub fn missing_field(&self) -> Option<&'static str> {
        [
            ("identity_id", &self.identity_id),
            ("display_name", &self.display_name),
            ("contact_address", &self.contact_address),
            ("group_tag", &self.group_tag),
        ]
        .into_iter()
        .find(|(_, v)| v.trim().is_empty())
        .map(|(name, _)| name)
    }
}

/// An enrolled person. Created once by the registrar, never mutated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Identity {
    pub identity_id: String,
    pub display_name: String,
    pub contact_address: String,
    pub group_tag: String,
    pub embedding: Embedding,
    pub enrolled_at: DateTime<Utc>,
}

impl Identity {
    pub fn from_candidate(candidate: IdentityCandidate, enrolled_at: DateTime<Utc>) -> Self {
        Self {
            identity_id: candidate.identity_id,
            display_name: candidate.display_name,
            contact_address: candidate.contact_address,
            group_tag: candidate.group_tag,
            embedding: candidate.embedding,
            enrolled_at,
        }
    }

    pub fn public(&self) -> PublicIdentity {
        PublicIdentity {
            identity_id: self.identity_id.clone(),
            display_name: self.display_name.clone(),
            contact_address: self.contact_address.clone(),
            group_tag: self.group_tag.clone(),
        }
    }
}

/// Fields of an identity that may be shown to users. Never carries the embedding.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublicIdentity {
    pub identity_id: String,
    pub display_name: String,
    pub contact_address: String,
    pub group_tag: String,
}

/// At most one attendance event exists per key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DedupKey {
    pub identity_id: String,
    pub date: NaiveDate,
    pub session_tag: String,
}

impl DedupKey {
    pub fn new(identity_id: impl Into<String>, date: NaiveDate, session_tag: impl Into<String>) -> Self {
        Self {
            identity_id: identity_id.into(),
            date,
            session_tag: session_tag.into(),
        }
    }
}

impl fmt::Display for DedupKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}|{}|{}", self.identity_id, self.date.format("%Y-%m-%d"), self.session_tag)
    }
}

/// A committed attendance mark.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttendanceEvent {
    pub event_id: Uuid,
    pub identity_id: String,
    pub date: NaiveDate,
    pub session_tag: String,
    /// Copied from the identity so reports can filter by group without a join.
    pub group_tag: String,
    pub committed_at: DateTime<Utc>,
}

impl AttendanceEvent {
    pub fn new(key: DedupKey, group_tag: impl Into<String>, committed_at: DateTime<Utc>) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            identity_id: key.identity_id,
            date: key.date,
            session_tag: key.session_tag,
            group_tag: group_tag.into(),
            committed_at,
        }
    }

    pub fn dedup_key(&self) -> DedupKey {
        DedupKey::new(self.identity_id.clone(), self.date, self.session_tag.clone())
    }
}

/// One line of the attendance report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportRow {
    pub date: NaiveDate,
    pub identity_id: String,
    pub display_name: String,
    pub group_tag: String,
    pub session_tag: String,
}
