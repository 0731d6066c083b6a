//! Nearest-neighbour matching of a probe embedding against the gallery.

use crate::readiness::{Readiness, ReadinessError};
use crate::store::{EmbeddingStore, StoreError};
use crate::types::{Embedding, ProbeError};
use std::fmt;
use thiserror::Error;

/// Acceptance threshold in descriptor-distance units (not a similarity).
pub const DEFAULT_MATCH_THRESHOLD: f32 = 0.6;

/// Outcome label of a match: an enrolled identity or nobody.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Label {
    Known(String),
    Unknown,
}

impl fmt::Display for Label {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Label::Known(id) => f.write_str(id),
            Label::Unknown => f.write_str("unknown"),
        }
    }
}

/// Result of matching a probe embedding against a gallery.
#[derive(Debug, Clone, PartialEq)]
pub struct MatchResult {
    pub label: Label,
    /// Distance to the nearest entry; `f32::INFINITY` for an empty gallery.
    pub distance: f32,
    pub accepted: bool,
}

impl MatchResult {
    fn unknown(distance: f32) -> Self {
        Self {
            label: Label::Unknown,
            distance,
            accepted: false,
        }
    }

    /// The matched identity id, only when the match was accepted.
    pub fn accepted_id(&self) -> Option<&str> {
        match (&self.label, self.accepted) {
            (Label::Known(id), true) => Some(id),
            _ => None,
        }
    }
}

/// One enrolled `(identity_id, embedding)` pair.
#[derive(Debug, Clone)]
pub struct GalleryEntry {
    pub identity_id: String,
    pub embedding: Embedding,
}

/// Strategy for comparing a probe embedding against a gallery of enrolled faces.
///
/// Implementations must be pure: identical inputs give identical results.
pub trait Matcher: Send + Sync {
    fn compare(&self, probe: &Embedding, gallery: &[GalleryEntry]) -> MatchResult;
}

/// Linear-scan Euclidean matcher.
///
/// Ties keep the first entry in gallery order, so results are stable for a
/// given gallery ordering.
#[derive(Debug, Clone, Copy)]
pub struct EuclideanMatcher {
    threshold: f32,
}

impl Default for EuclideanMatcher {
    fn default() -> Self {
        Self::new(DEFAULT_MATCH_THRESHOLD)
    }
}

impl EuclideanMatcher {
    pub fn new(threshold: f32) -> Self {
        Self { threshold }
    }

    pub fn threshold(&self) -> f32 {
        self.threshold
    }
}

impl Matcher for EuclideanMatcher {
    fn compare(&self, probe: &Embedding, gallery: &[GalleryEntry]) -> MatchResult {
        let mut best_dist = f32::INFINITY;
        let mut best_idx: Option<usize> = None;

        for (i, entry) in gallery.iter().enumerate() {
            let dist = probe.euclidean_distance(&entry.embedding);
            // Strict `<`: equal distances keep the earlier entry; NaN never wins.
            if dist < best_dist {
                best_dist = dist;
                best_idx = Some(i);
            }
        }

        match best_idx {
            Some(idx) if best_dist <= self.threshold => MatchResult {
                label: Label::Known(gallery[idx].identity_id.clone()),
                distance: best_dist,
                accepted: true,
            },
            _ => MatchResult::unknown(best_dist),
        }
    }
}

#[derive(Error, Debug)]
pub enum IdentifyError {
    #[error(transparent)]
    NotReady(#[from] ReadinessError),
    #[error(transparent)]
    Probe(#[from] ProbeError),
    #[error(transparent)]
    Storage(#[from] StoreError),
}

/// Matcher bound to the live gallery and the process readiness state.
pub struct GalleryMatcher {
    strategy: Box<dyn Matcher>,
    gallery: EmbeddingStore,
    readiness: Readiness,
}

impl GalleryMatcher {
    pub fn new(strategy: Box<dyn Matcher>, gallery: EmbeddingStore, readiness: Readiness) -> Self {
        Self {
            strategy,
            gallery,
            readiness,
        }
    }

    pub fn readiness(&self) -> &Readiness {
        &self.readiness
    }

    pub fn gallery(&self) -> &EmbeddingStore {
        &self.gallery
    }

    /// Match `probe` against every enrolled identity.
    ///
    /// Storage failures propagate; they are never reported as a non-match.
    pub fn identify(&self, probe: &Embedding) -> Result<MatchResult, IdentifyError> {
        self.readiness.ensure_ready()?;
        probe.validate(self.gallery.expected_dim())?;
        let gallery = self.gallery.gallery()?;
        let result = self.strategy.compare(probe, &gallery);
        tracing::debug!(
            gallery_size = gallery.len(),
            label = %result.label,
            distance = result.distance,
            accepted = result.accepted,
            "probe matched"
        );
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{MemoryStore, Store};
    use crate::types::Identity;
    use chrono::Utc;
    use std::sync::Arc;

    fn entry(id: &str, values: Vec<f32>) -> GalleryEntry {
        GalleryEntry {
            identity_id: id.into(),
            embedding: Embedding::new(values),
        }
    }

    #[test]
    fn test_matcher_scans_whole_gallery() {
        // Best match is the last entry.
        let probe = Embedding::new(vec![1.0, 0.0, 0.0]);
        let gallery = vec![
            entry("decoy1", vec![0.0, 1.0, 0.0]),
            entry("decoy2", vec![0.0, 0.0, 1.0]),
            entry("match", vec![1.0, 0.05, 0.0]),
        ];

        let result = EuclideanMatcher::default().compare(&probe, &gallery);
        assert!(result.accepted);
        assert_eq!(result.accepted_id(), Some("match"));
        assert!((result.distance - 0.05).abs() < 1e-6);
    }

    #[test]
    fn test_matcher_empty_gallery() {
        let probe = Embedding::new(vec![1.0, 0.0]);
        let result = EuclideanMatcher::default().compare(&probe, &[]);
        assert!(!result.accepted);
        assert_eq!(result.label, Label::Unknown);
        assert_eq!(result.accepted_id(), None);
    }

    #[test]
    fn test_matcher_outside_threshold() {
        let probe = Embedding::new(vec![1.0, 0.0]);
        let gallery = vec![entry("far", vec![0.0, 1.0])];
        let result = EuclideanMatcher::new(0.6).compare(&probe, &gallery);
        assert!(!result.accepted);
        assert_eq!(result.label, Label::Unknown);
        assert!((result.distance - 2f32.sqrt()).abs() < 1e-6);
    }

    #[test]
    fn test_matcher_threshold_is_inclusive() {
        let probe = Embedding::new(vec![0.0, 0.0]);
        let gallery = vec![entry("edge", vec![0.5, 0.0])];
        assert!(EuclideanMatcher::new(0.5).compare(&probe, &gallery).accepted);
        assert!(!EuclideanMatcher::new(0.49).compare(&probe, &gallery).accepted);
    }

    #[test]
    fn test_matcher_tie_keeps_first_entry() {
        let probe = Embedding::new(vec![0.0, 0.0]);
        let gallery = vec![
            entry("first", vec![0.1, 0.0]),
            entry("second", vec![0.0, 0.1]),
        ];
        let result = EuclideanMatcher::default().compare(&probe, &gallery);
        assert_eq!(result.accepted_id(), Some("first"));

        let reversed: Vec<_> = gallery.into_iter().rev().collect();
        let result = EuclideanMatcher::default().compare(&probe, &reversed);
        assert_eq!(result.accepted_id(), Some("second"));
    }

    #[test]
    fn test_matcher_is_deterministic() {
        let probe = Embedding::new(vec![0.3, 0.1, 0.7]);
        let gallery = vec![
            entry("a", vec![0.3, 0.2, 0.7]),
            entry("b", vec![0.2, 0.1, 0.6]),
            entry("c", vec![0.9, 0.9, 0.9]),
        ];
        let m = EuclideanMatcher::default();
        let first = m.compare(&probe, &gallery);
        for _ in 0..10 {
            assert_eq!(m.compare(&probe, &gallery), first);
        }
    }

    fn gallery_matcher(store: Arc<MemoryStore>, dim: usize) -> GalleryMatcher {
        let readiness = Readiness::new();
        readiness.init(|| Ok(())).unwrap();
        GalleryMatcher::new(
            Box::new(EuclideanMatcher::default()),
            EmbeddingStore::new(store, dim),
            readiness,
        )
    }

    #[test]
    fn test_identify_requires_readiness() {
        let store = Arc::new(MemoryStore::new());
        let m = GalleryMatcher::new(
            Box::new(EuclideanMatcher::default()),
            EmbeddingStore::new(store, 2),
            Readiness::new(),
        );
        let err = m.identify(&Embedding::new(vec![0.0, 0.0])).unwrap_err();
        assert!(matches!(err, IdentifyError::NotReady(_)));
    }

    #[test]
    fn test_identify_rejects_malformed_probe() {
        let m = gallery_matcher(Arc::new(MemoryStore::new()), 3);
        let err = m.identify(&Embedding::new(vec![0.0, 0.0])).unwrap_err();
        assert!(matches!(err, IdentifyError::Probe(ProbeError::MalformedEmbedding(_))));
    }

    #[test]
    fn test_identify_storage_outage_is_not_a_non_match() {
        let store = Arc::new(MemoryStore::new());
        let m = gallery_matcher(store.clone(), 2);
        store.set_available(false);
        let err = m.identify(&Embedding::new(vec![0.0, 0.0])).unwrap_err();
        assert!(matches!(err, IdentifyError::Storage(StoreError::Unavailable(_))));
    }

    #[test]
    fn test_identify_against_live_gallery() {
        let store = Arc::new(MemoryStore::new());
        store
            .insert_identity(&Identity {
                identity_id: "S1".into(),
                display_name: "Ada".into(),
                contact_address: "a@x.com".into(),
                group_tag: "CS".into(),
                embedding: Embedding::new(vec![0.2, 0.4]),
                enrolled_at: Utc::now(),
            })
            .unwrap();
        let m = gallery_matcher(store, 2);
        let result = m.identify(&Embedding::new(vec![0.21, 0.39])).unwrap();
        assert_eq!(result.accepted_id(), Some("S1"));
    }
}
