//! Startup/teardown lifecycle for the matching components.
//!
//! A `Readiness` handle is created unready, flipped to `Ready` once by
//! [`Readiness::init`] after the startup checks pass, and is terminal after
//! [`Readiness::teardown`]. Components that hold a clone refuse to serve
//! until it reports `Ready`.

use serde::Serialize;
use std::path::Path;
use std::sync::{Arc, PoisonError, RwLock};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReadinessState {
    Uninitialized,
    Ready,
    TornDown,
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ReadinessError {
    #[error("matcher not ready (state: {0:?})")]
    NotReady(ReadinessState),
    #[error("startup check failed: {0}")]
    CheckFailed(String),
    #[error("missing model files in {dir}: {missing:?}")]
    MissingModelFiles { dir: String, missing: Vec<String> },
}

/// Shared lifecycle handle. Clones observe the same state.
#[derive(Debug, Clone)]
pub struct Readiness {
    state: Arc<RwLock<ReadinessState>>,
}

impl Default for Readiness {
    fn default() -> Self {
        Self::new()
    }
}

impl Readiness {
    pub fn new() -> Self {
        Self {
            state: Arc::new(RwLock::new(ReadinessState::Uninitialized)),
        }
    }

    pub fn state(&self) -> ReadinessState {
        *self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    /// Run `checks` and mark ready if they pass.
    ///
    /// Calling `init` on a ready handle is a no-op; a torn-down handle
    /// cannot be revived.
    pub fn init<F>(&self, checks: F) -> Result<(), ReadinessError>
    where
        F: FnOnce() -> Result<(), ReadinessError>,
    {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        match *state {
            ReadinessState::Ready => return Ok(()),
            ReadinessState::TornDown => return Err(ReadinessError::NotReady(ReadinessState::TornDown)),
            ReadinessState::Uninitialized => {}
        }

        checks()?;
        *state = ReadinessState::Ready;
        tracing::info!("matcher ready");
        Ok(())
    }

    pub fn ensure_ready(&self) -> Result<(), ReadinessError> {
        match self.state() {
            ReadinessState::Ready => Ok(()),
            other => Err(ReadinessError::NotReady(other)),
        }
    }

    pub fn teardown(&self) {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        if *state != ReadinessState::TornDown {
            *state = ReadinessState::TornDown;
            tracing::info!("matcher torn down");
        }
    }
}

/// Verify that every required extractor model file exists under `dir`.
pub fn check_model_files(dir: &Path, required: &[String]) -> Result<(), ReadinessError> {
    let missing: Vec<String> = required
        .iter()
        .filter(|name| !dir.join(name.as_str()).exists())
        .cloned()
        .collect();

    if missing.is_empty() {
        Ok(())
    } else {
        Err(ReadinessError::MissingModelFiles {
            dir: dir.display().to_string(),
            missing,
        })
    }
}
