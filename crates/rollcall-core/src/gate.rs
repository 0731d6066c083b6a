//! Idempotent attendance marking.

use crate::matcher::{GalleryMatcher, IdentifyError};
use crate::readiness::ReadinessError;
use crate::store::{InsertOutcome, Store, StoreError};
use crate::types::{AttendanceEvent, DedupKey, Embedding, ProbeError, PublicIdentity};
use chrono::{NaiveDate, Utc};
use std::sync::Arc;
use thiserror::Error;

/// Message handed to the notification collaborator after a commit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub contact_address: String,
    pub identity_id: String,
    pub session_tag: String,
    pub date: NaiveDate,
}

impl Notification {
    pub const SUBJECT: &'static str = "Attendance Confirmation";

    pub fn body(&self) -> String {
        format!(
            "Your attendance has been successfully marked for the {} slot.",
            self.session_tag
        )
    }
}

#[derive(Error, Debug)]
pub enum NotifyError {
    #[error("notification queue full")]
    QueueFull,
    #[error("notification channel closed")]
    Closed,
    #[error("delivery failed: {0}")]
    Delivery(String),
}

/// Best-effort, fire-and-forget delivery. Implementations must not block.
pub trait Notifier: Send + Sync {
    fn notify(&self, notification: Notification) -> Result<(), NotifyError>;
}

/// Drops every notification.
pub struct NullNotifier;

impl Notifier for NullNotifier {
    fn notify(&self, _notification: Notification) -> Result<(), NotifyError> {
        Ok(())
    }
}

#[derive(Error, Debug)]
pub enum RecordError {
    #[error("missing required field: {0}")]
    MissingField(&'static str),
    #[error(transparent)]
    Probe(#[from] ProbeError),
    #[error("no matching identity found (nearest distance {distance:.3})")]
    NoMatch { distance: f32 },
    #[error("attendance already marked for {} in this session today", .0.identity_id)]
    AlreadyMarked(PublicIdentity),
    #[error(transparent)]
    NotReady(#[from] ReadinessError),
    #[error(transparent)]
    StorageUnavailable(#[from] StoreError),
}

impl From<IdentifyError> for RecordError {
    fn from(e: IdentifyError) -> Self {
        match e {
            IdentifyError::NotReady(e) => RecordError::NotReady(e),
            IdentifyError::Probe(e) => RecordError::Probe(e),
            IdentifyError::Storage(e) => RecordError::StorageUnavailable(e),
        }
    }
}

/// A committed event together with who it was for.
#[derive(Debug, Clone)]
pub struct RecordedAttendance {
    pub event: AttendanceEvent,
    pub identity: PublicIdentity,
}

/// Admits at most one attendance event per (identity, date, session).
pub struct AttendanceGate {
    matcher: Arc<GalleryMatcher>,
    store: Arc<dyn Store>,
    notifier: Arc<dyn Notifier>,
}

impl AttendanceGate {
    pub fn new(matcher: Arc<GalleryMatcher>, store: Arc<dyn Store>, notifier: Arc<dyn Notifier>) -> Self {
        Self {
            matcher,
            store,
            notifier,
        }
    }

    /// Recognize `probe` and mark attendance for `session_tag` on `as_of`.
    ///
    /// The existence check is only a fast path; the store's conditional
    /// insert decides the winner when two requests race on the same key.
    pub fn record(
        &self,
        probe: &Embedding,
        session_tag: &str,
        as_of: NaiveDate,
    ) -> Result<RecordedAttendance, RecordError> {
        if session_tag.trim().is_empty() {
            return Err(RecordError::MissingField("session_tag"));
        }

        let result = self.matcher.identify(probe)?;
        let Some(matched_id) = result.accepted_id() else {
            tracing::debug!(distance = result.distance, "record: no match");
            return Err(RecordError::NoMatch {
                distance: result.distance,
            });
        };

        // Removed between the scan and the lookup: treat as nobody.
        let Some(identity) = self.store.identity(matched_id)? else {
            tracing::debug!(identity_id = matched_id, "record: matched identity vanished");
            return Err(RecordError::NoMatch {
                distance: result.distance,
            });
        };

        let key = DedupKey::new(identity.identity_id.clone(), as_of, session_tag);
        if self.store.attendance(&key)?.is_some() {
            tracing::info!(key = %key, "record: already marked");
            return Err(RecordError::AlreadyMarked(identity.public()));
        }

        let event = AttendanceEvent::new(key, identity.group_tag.clone(), Utc::now());
        match self.store.insert_attendance(&event)? {
            InsertOutcome::Inserted => {}
            InsertOutcome::Exists(conflict) => {
                tracing::info!(key = %event.dedup_key(), ?conflict, "record: lost insert race");
                return Err(RecordError::AlreadyMarked(identity.public()));
            }
        }

        tracing::info!(
            identity_id = %event.identity_id,
            date = %event.date,
            session = %event.session_tag,
            distance = result.distance,
            "attendance recorded"
        );

        let notification = Notification {
            contact_address: identity.contact_address.clone(),
            identity_id: identity.identity_id.clone(),
            session_tag: event.session_tag.clone(),
            date: event.date,
        };
        if let Err(err) = self.notifier.notify(notification) {
            tracing::warn!(
                error = %err,
                identity_id = %identity.identity_id,
                "attendance notification failed; commit stands"
            );
        }

        Ok(RecordedAttendance {
            event,
            identity: identity.public(),
        })
    }
}
