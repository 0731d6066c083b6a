//! Temporal confirmation of per-frame detections.
//!
//! Turns a noisy 5 Hz stream of detector results into a single commit per
//! sustained single-face presence. Time is supplied by the caller so the
//! state machine runs without real timers.

use crate::types::{DetectedFace, Embedding};
use std::time::{Duration, Instant};

pub const DEFAULT_REQUIRED_HITS: u32 = 15;
pub const DEFAULT_SAMPLE_INTERVAL: Duration = Duration::from_millis(200);
pub const DEFAULT_COOLDOWN: Duration = Duration::from_secs(3);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConfirmerConfig {
    /// Consecutive single-face frames needed for a commit.
    pub required_hits: u32,
    /// Sampling cadence of the driving loop.
    pub sample_interval: Duration,
    /// Sampling is suppressed for this long after a commit.
    pub cooldown: Duration,
}

impl Default for ConfirmerConfig {
    fn default() -> Self {
        Self {
            required_hits: DEFAULT_REQUIRED_HITS,
            sample_interval: DEFAULT_SAMPLE_INTERVAL,
            cooldown: DEFAULT_COOLDOWN,
        }
    }
}

/// What the detector saw in one frame.
#[derive(Debug, Clone)]
pub enum FrameObservation {
    NoFace,
    SingleFace(Embedding),
    MultipleFaces(usize),
}

impl FrameObservation {
    pub fn from_faces(mut faces: Vec<DetectedFace>) -> Self {
        match faces.len() {
            0 => FrameObservation::NoFace,
            1 => FrameObservation::SingleFace(faces.remove(0).embedding),
            n => FrameObservation::MultipleFaces(n),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConfirmationWindow {
    pub consecutive_hits: u32,
    pub required_hits: u32,
    pub last_frame_had_face: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfirmerState {
    Idle,
    Accumulating { hits: u32 },
    Cooldown { until: Instant },
}

/// Authorization for exactly one downstream match attempt.
#[derive(Debug, Clone)]
pub struct Commit {
    pub embedding: Embedding,
    pub at: Instant,
}

pub struct TemporalConfirmer {
    config: ConfirmerConfig,
    window: ConfirmationWindow,
    cooldown_until: Option<Instant>,
}

impl TemporalConfirmer {
    pub fn new(config: ConfirmerConfig) -> Self {
        let required_hits = config.required_hits.max(1);
        Self {
            config: ConfirmerConfig {
                required_hits,
                ..config
            },
            window: ConfirmationWindow {
                consecutive_hits: 0,
                required_hits,
                last_frame_had_face: false,
            },
            cooldown_until: None,
        }
    }

    pub fn config(&self) -> &ConfirmerConfig {
        &self.config
    }

    pub fn window(&self) -> ConfirmationWindow {
        self.window
    }

    pub fn state(&self) -> ConfirmerState {
        match (self.cooldown_until, self.window.consecutive_hits) {
            (Some(until), _) => ConfirmerState::Cooldown { until },
            (None, 0) => ConfirmerState::Idle,
            (None, hits) => ConfirmerState::Accumulating { hits },
        }
    }

    /// Feed one sampled frame taken at `now`.
    ///
    /// Returns a commit on the frame that completes the required run.
    /// Frames during cooldown are ignored.
    pub fn observe(&mut self, now: Instant, frame: FrameObservation) -> Option<Commit> {
        if let Some(until) = self.cooldown_until {
            if now < until {
                return None;
            }
            self.cooldown_until = None;
            tracing::debug!("confirmer: cooldown elapsed");
        }

        let embedding = match frame {
            FrameObservation::SingleFace(embedding) => embedding,
            FrameObservation::NoFace | FrameObservation::MultipleFaces(_) => {
                if self.window.consecutive_hits > 0 {
                    tracing::debug!(hits = self.window.consecutive_hits, "confirmer: run broken");
                }
                self.window.consecutive_hits = 0;
                self.window.last_frame_had_face = false;
                return None;
            }
        };

        self.window.consecutive_hits += 1;
        self.window.last_frame_had_face = true;

        if self.window.consecutive_hits < self.window.required_hits {
            return None;
        }

        tracing::info!(hits = self.window.consecutive_hits, "confirmer: commit");
        self.window.consecutive_hits = 0;
        self.cooldown_until = Some(now + self.config.cooldown);
        Some(Commit { embedding, at: now })
    }

    /// Stop confirming: drop any partial run and any pending cooldown.
    pub fn cancel(&mut self) {
        self.window.consecutive_hits = 0;
        self.window.last_frame_had_face = false;
        self.cooldown_until = None;
    }
}
