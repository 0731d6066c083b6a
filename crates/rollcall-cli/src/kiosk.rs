//! Kiosk sampling loop.
//!
//! Replays per-frame detector output (one JSON array of faces per line) at
//! the confirmer's cadence and forwards each commit for a `Record` call.

use rollcall_core::confirmer::{
    DEFAULT_COOLDOWN, DEFAULT_REQUIRED_HITS, DEFAULT_SAMPLE_INTERVAL,
};
use rollcall_core::{Commit, ConfirmerConfig, DetectedFace, FrameObservation, TemporalConfirmer};
use std::future::Future;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader, Lines};
use tokio::sync::{mpsc, watch};
use tokio::time::MissedTickBehavior;

/// Build the confirmer config from `ROLLCALL_*` overrides.
pub fn confirmer_config(lookup: impl Fn(&str) -> Option<String>) -> ConfirmerConfig {
    let parse = |key: &str, default: u64| -> u64 {
        match lookup(key) {
            Some(raw) => raw.trim().parse().unwrap_or_else(|_| {
                tracing::warn!(key, value = %raw, "ignoring unparseable kiosk override");
                default
            }),
            None => default,
        }
    };
    ConfirmerConfig {
        required_hits: parse("ROLLCALL_REQUIRED_HITS", u64::from(DEFAULT_REQUIRED_HITS))
            .try_into()
            .unwrap_or(DEFAULT_REQUIRED_HITS),
        sample_interval: Duration::from_millis(parse(
            "ROLLCALL_SAMPLE_INTERVAL_MS",
            DEFAULT_SAMPLE_INTERVAL.as_millis() as u64,
        ))
        .max(Duration::from_millis(1)),
        cooldown: Duration::from_millis(parse(
            "ROLLCALL_COOLDOWN_MS",
            DEFAULT_COOLDOWN.as_millis() as u64,
        )),
    }
}

/// Line-delimited detector output.
pub struct JsonlFrames<R> {
    lines: Lines<BufReader<R>>,
    line_no: usize,
}

impl<R: AsyncRead + Unpin> JsonlFrames<R> {
    pub fn new(reader: R) -> Self {
        Self {
            lines: BufReader::new(reader).lines(),
            line_no: 0,
        }
    }

    /// The next frame, or `None` at end of stream. A line that does not
    /// parse counts as a frame without a face.
    pub async fn next_frame(&mut self) -> Option<FrameObservation> {
        let line = match self.lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => return None,
            Err(e) => {
                tracing::warn!(error = %e, "frame stream read failed");
                return None;
            }
        };
        self.line_no += 1;
        if line.trim().is_empty() {
            return Some(FrameObservation::NoFace);
        }
        match serde_json::from_str::<Vec<DetectedFace>>(&line) {
            Ok(faces) => Some(FrameObservation::from_faces(faces)),
            Err(e) => {
                tracing::warn!(line = self.line_no, error = %e, "malformed frame; treating as no face");
                Some(FrameObservation::NoFace)
            }
        }
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SamplerStats {
    pub frames: usize,
    pub commits: usize,
    pub cancelled: bool,
}

/// Drive a confirmer from `source` until the stream ends or `cancel` fires.
///
/// Each commit goes to `commits`. Once cancelled, no further commit is sent,
/// the confirmer is reset and unread frames are dropped.
pub async fn run_sampler<R: AsyncRead + Unpin>(
    mut source: JsonlFrames<R>,
    config: ConfirmerConfig,
    mut cancel: watch::Receiver<bool>,
    commits: mpsc::Sender<Commit>,
) -> SamplerStats {
    let mut confirmer = TemporalConfirmer::new(config);
    let mut ticker = tokio::time::interval(config.sample_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut stats = SamplerStats::default();

    loop {
        tokio::select! {
            biased;
            _ = cancel.changed() => {
                stats.cancelled = true;
                break;
            }
            _ = ticker.tick() => {
                let Some(frame) = source.next_frame().await else {
                    tracing::info!(frames = stats.frames, "frame stream ended");
                    break;
                };
                stats.frames += 1;
                let now = tokio::time::Instant::now().into_std();
                let Some(commit) = confirmer.observe(now, frame) else {
                    continue;
                };
                if *cancel.borrow() {
                    stats.cancelled = true;
                    break;
                }
                if commits.send(commit).await.is_err() {
                    tracing::warn!("commit receiver gone; stopping sampler");
                    break;
                }
                stats.commits += 1;
            }
        }
    }

    confirmer.cancel();
    drop(source);
    tracing::info!(
        frames = stats.frames,
        commits = stats.commits,
        cancelled = stats.cancelled,
        "sampler stopped"
    );
    stats
}

/// Hand each commit to `send` until the channel closes or `cancel` fires.
///
/// A commit already queued when the cancel arrives is dropped, not sent.
/// Returns how many commits were sent.
pub async fn forward_commits<F, Fut>(
    commits: &mut mpsc::Receiver<Commit>,
    cancel: &watch::Receiver<bool>,
    mut send: F,
) -> usize
where
    F: FnMut(Commit) -> Fut,
    Fut: Future<Output = ()>,
{
    let mut sent = 0;
    while let Some(commit) = commits.recv().await {
        if *cancel.borrow() {
            tracing::info!("kiosk cancelled; dropping queued commits");
            break;
        }
        send(commit).await;
        sent += 1;
    }
    sent
}
