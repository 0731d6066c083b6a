//! rollcall-core: face gallery matching and attendance gating.
//!
//! Matches externally extracted face embeddings against the enrolled
//! gallery, enforces identity uniqueness at enrollment, and admits at most
//! one attendance event per (identity, date, session). Also hosts the
//! temporal confirmer that debounces per-frame detections on the client.

pub mod confirmer;
pub mod gate;
pub mod matcher;
pub mod readiness;
pub mod registrar;
pub mod store;
pub mod types;

pub use confirmer::{Commit, ConfirmerConfig, ConfirmerState, FrameObservation, TemporalConfirmer};
pub use gate::{AttendanceGate, Notification, Notifier, NotifyError, NullNotifier, RecordError, RecordedAttendance};
pub use matcher::{EuclideanMatcher, GalleryEntry, GalleryMatcher, IdentifyError, Label, MatchResult, Matcher};
pub use readiness::{Readiness, ReadinessError, ReadinessState};
pub use registrar::{EnrollError, IdentityRegistrar};
pub use store::{Conflict, EmbeddingStore, InsertOutcome, MemoryStore, ReportQuery, Store, StoreError};
pub use types::{
    AttendanceEvent, BoundingBox, DedupKey, DetectedFace, Embedding, Identity, IdentityCandidate,
    ProbeError, PublicIdentity, ReportRow,
};
