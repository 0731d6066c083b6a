//! Enrollment with biometric and business-key uniqueness.

use crate::matcher::{GalleryMatcher, IdentifyError};
use crate::readiness::ReadinessError;
use crate::store::{Conflict, InsertOutcome, Store, StoreError};
use crate::types::{Identity, IdentityCandidate, ProbeError, PublicIdentity};
use chrono::Utc;
use std::sync::Arc;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum EnrollError {
    #[error("missing required field: {0}")]
    MissingField(&'static str),
    #[error(transparent)]
    Probe(#[from] ProbeError),
    #[error("this face is already registered to {}", .0.identity_id)]
    DuplicateFace(PublicIdentity),
    #[error("identity id already exists: {0}")]
    DuplicateIdentity(String),
    #[error("contact address already exists: {0}")]
    DuplicateContact(String),
    #[error(transparent)]
    NotReady(#[from] ReadinessError),
    #[error(transparent)]
    StorageUnavailable(#[from] StoreError),
}

impl From<IdentifyError> for EnrollError {
    fn from(e: IdentifyError) -> Self {
        match e {
            IdentifyError::NotReady(e) => EnrollError::NotReady(e),
            IdentifyError::Probe(e) => EnrollError::Probe(e),
            IdentifyError::Storage(e) => EnrollError::StorageUnavailable(e),
        }
    }
}

/// Creates identities. The only writer of the gallery.
pub struct IdentityRegistrar {
    matcher: Arc<GalleryMatcher>,
    store: Arc<dyn Store>,
}

impl IdentityRegistrar {
    pub fn new(matcher: Arc<GalleryMatcher>, store: Arc<dyn Store>) -> Self {
        Self { matcher, store }
    }

    /// Enroll a new identity.
    ///
    /// Checks run in order and short-circuit: face, identity id, contact.
    /// The face check is best-effort against concurrent enrollments; the key
    /// checks are re-enforced atomically by the store's conditional insert.
    pub fn enroll(&self, candidate: IdentityCandidate) -> Result<Identity, EnrollError> {
        if let Some(field) = candidate.missing_field() {
            return Err(EnrollError::MissingField(field));
        }

        let result = self.matcher.identify(&candidate.embedding)?;
        if let Some(existing_id) = result.accepted_id() {
            match self.store.identity(existing_id)? {
                Some(existing) => {
                    tracing::info!(
                        candidate = %candidate.identity_id,
                        existing = %existing.identity_id,
                        distance = result.distance,
                        "enroll rejected: face already registered"
                    );
                    return Err(EnrollError::DuplicateFace(existing.public()));
                }
                None => {
                    // Removed between the gallery scan and this lookup.
                    tracing::debug!(existing = existing_id, "matched identity vanished; continuing");
                }
            }
        }

        if self.store.identity(&candidate.identity_id)?.is_some() {
            return Err(EnrollError::DuplicateIdentity(candidate.identity_id));
        }
        if self.store.identity_by_contact(&candidate.contact_address)?.is_some() {
            return Err(EnrollError::DuplicateContact(candidate.contact_address));
        }

        let identity = Identity::from_candidate(candidate, Utc::now());
        match self.store.insert_identity(&identity)? {
            InsertOutcome::Inserted => {}
            InsertOutcome::Exists(Conflict::IdentityId) => {
                return Err(EnrollError::DuplicateIdentity(identity.identity_id));
            }
            InsertOutcome::Exists(Conflict::ContactAddress) => {
                return Err(EnrollError::DuplicateContact(identity.contact_address));
            }
            InsertOutcome::Exists(Conflict::DedupKey) => {
                return Err(EnrollError::StorageUnavailable(StoreError::Corrupt(
                    "identity insert reported an attendance conflict".into(),
                )));
            }
        }

        tracing::info!(
            identity_id = %identity.identity_id,
            group = %identity.group_tag,
            "identity enrolled"
        );
        Ok(identity)
    }
}
