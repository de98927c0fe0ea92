//! Periodic sampling loop: frame → descriptors → matches → ledger.
//!
//! A tokio ticker fires on a fixed cadence and hands each tick to the blocking
//! pool. A tick that fires while the previous one is still running is dropped,
//! never queued. Teardown cancels the ticker, releases the camera and fences
//! the ledger so an in-flight tick can finish but cannot write.

use crate::extractor::ModelBundle;
use crate::ledger::SharedLedger;
use crate::matcher::FaceMatcher;
use crate::overlay::{Overlay, OverlayBox};
use crate::types::{GrayFrame, MatchResult, RecognitionEvent, Roster};
use serde::Serialize;
use std::fmt::Display;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

pub const DEFAULT_SAMPLE_INTERVAL: Duration = Duration::from_millis(1000);
pub const DEFAULT_ESCALATE_AFTER: u32 = 10;

#[derive(Error, Debug)]
pub enum SourceError {
    #[error("webcam unavailable: {0}")]
    Unavailable(String),
    #[error("frame capture failed: {0}")]
    Capture(String),
}

pub enum FrameRead {
    Frame(GrayFrame),
    /// The stream is over (device gone, playback ended).
    Ended,
}

/// A live video stream.
pub trait FrameSource: Send {
    fn next_frame(&mut self) -> Result<FrameRead, SourceError>;

    /// Stop the stream and give the device back. Must be idempotent.
    fn release(&mut self);
}

#[derive(Error, Debug)]
pub enum SamplerError {
    #[error("webcam unavailable: {0}")]
    CameraUnavailable(String),
    #[error("video source ended before the first frame")]
    SourceEnded,
    #[error("invalid sampler config: {0}")]
    InvalidConfig(String),
}

#[derive(Debug, Clone)]
pub struct SamplerConfig {
    /// Time between tick starts.
    pub interval: Duration,
    /// Consecutive failed ticks before the failure is escalated; 0 disables.
    pub escalate_after: u32,
}

impl Default for SamplerConfig {
    fn default() -> Self {
        Self {
            interval: DEFAULT_SAMPLE_INTERVAL,
            escalate_after: DEFAULT_ESCALATE_AFTER,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SamplerState {
    Idle,
    Sampling,
    Stopped,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SamplerStats {
    pub ticks_run: u64,
    pub ticks_skipped: u64,
    pub tick_failures: u64,
    pub consecutive_failures: u32,
    pub events_emitted: u64,
}

/// Non-overlap guard: at most one tick holds a permit at a time.
#[derive(Debug, Clone, Default)]
pub struct TickGuard {
    busy: Arc<AtomicBool>,
}

impl TickGuard {
    pub fn try_begin(&self) -> Option<TickPermit> {
        self.busy
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| TickPermit {
                busy: Arc::clone(&self.busy),
            })
    }

    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::Acquire)
    }
}

/// Held for the duration of one tick; dropping it frees the guard.
#[derive(Debug)]
pub struct TickPermit {
    busy: Arc<AtomicBool>,
}

impl Drop for TickPermit {
    fn drop(&mut self) {
        self.busy.store(false, Ordering::Release);
    }
}

/// What one tick did.
#[derive(Debug, Clone, PartialEq)]
pub enum TickOutcome {
    Processed {
        results: Vec<MatchResult>,
        events: Vec<RecognitionEvent>,
        newly_marked: usize,
    },
    /// Teardown happened while the tick was in flight.
    Discarded,
    SourceEnded,
    Failed(String),
}

/// Everything a running tick touches.
struct Pipeline {
    bundle: ModelBundle,
    matcher: FaceMatcher,
    roster: Roster,
    source: Mutex<Option<Box<dyn FrameSource>>>,
    ledger: SharedLedger,
    cancel: CancellationToken,
    stats: Mutex<SamplerStats>,
    overlay_tx: watch::Sender<Overlay>,
    state_tx: watch::Sender<SamplerState>,
    escalate_after: u32,
}

fn relock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Pipeline {
    fn stats(&self) -> MutexGuard<'_, SamplerStats> {
        relock(&self.stats)
    }

    fn release_source(&self) {
        if let Some(mut source) = relock(&self.source).take() {
            source.release();
            tracing::info!("camera released");
        }
    }

    fn run_tick(&self, tick: u64) -> TickOutcome {
        if self.cancel.is_cancelled() {
            return TickOutcome::Discarded;
        }
        self.stats().ticks_run += 1;

        let read = {
            let mut slot = relock(&self.source);
            let Some(source) = slot.as_mut() else {
                return TickOutcome::Discarded;
            };
            source.next_frame()
        };
        let frame = match read {
            Ok(FrameRead::Frame(frame)) => frame,
            Ok(FrameRead::Ended) => {
                tracing::info!(tick, "video source ended, stopping sampler");
                self.cancel.cancel();
                self.release_source();
                self.state_tx.send_replace(SamplerState::Stopped);
                return TickOutcome::SourceEnded;
            }
            Err(e) => return self.fail(tick, &e),
        };

        let detections = match self.bundle.detect_all(&frame) {
            Ok(d) => d,
            Err(e) => return self.fail(tick, &e),
        };

        let mut results = Vec::with_capacity(detections.len());
        let mut boxes = Vec::with_capacity(detections.len());
        let mut events = Vec::new();
        for detection in detections {
            let result = self.matcher.find_best_match(&detection.descriptor);
            if let Some(identity_id) = result.identity() {
                events.push(RecognitionEvent { identity_id });
            }
            boxes.push(OverlayBox::for_match(detection.bbox, &result, &self.roster));
            results.push(result);
        }

        let newly_marked = {
            let mut ledger = self.ledger.lock();
            if self.cancel.is_cancelled() {
                tracing::debug!(tick, "sampler stopped mid-tick, discarding results");
                return TickOutcome::Discarded;
            }
            ledger.apply(&events)
        };

        {
            let mut stats = self.stats();
            stats.consecutive_failures = 0;
            stats.events_emitted += events.len() as u64;
        }

        tracing::debug!(
            tick,
            faces = results.len(),
            recognized = events.len(),
            newly_marked,
            "tick complete"
        );
        self.overlay_tx.send_replace(Overlay {
            tick,
            frame: Some(frame),
            boxes,
        });

        TickOutcome::Processed {
            results,
            events,
            newly_marked,
        }
    }

    /// `run_tick`, with a panic in the extractor counted as a tick failure.
    fn run_tick_guarded(&self, tick: u64) -> TickOutcome {
        match panic::catch_unwind(AssertUnwindSafe(|| self.run_tick(tick))) {
            Ok(outcome) => outcome,
            Err(payload) => {
                let reason = payload
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| payload.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_string());
                self.fail(tick, &format!("tick panicked: {reason}"))
            }
        }
    }

    fn fail(&self, tick: u64, error: &dyn Display) -> TickOutcome {
        let mut stats = self.stats();
        stats.tick_failures += 1;
        stats.consecutive_failures += 1;
        tracing::warn!(
            tick,
            error = %error,
            consecutive = stats.consecutive_failures,
            "tick failed, skipping"
        );
        if self.escalate_after > 0 && stats.consecutive_failures == self.escalate_after {
            tracing::error!(
                consecutive = stats.consecutive_failures,
                error = %error,
                "face detection keeps failing; check the camera and model bundle"
            );
        }
        TickOutcome::Failed(error.to_string())
    }
}

async fn run_ticker(pipeline: Arc<Pipeline>, interval: Duration) {
    let guard = TickGuard::default();
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut tick = 0u64;

    loop {
        tokio::select! {
            biased;
            _ = pipeline.cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }
        tick += 1;

        let Some(permit) = guard.try_begin() else {
            pipeline.stats().ticks_skipped += 1;
            tracing::debug!(tick, "previous tick still running, dropping this one");
            continue;
        };

        let worker = Arc::clone(&pipeline);
        tokio::task::spawn_blocking(move || {
            let _permit = permit;
            worker.run_tick_guarded(tick)
        });
    }
    tracing::debug!("sampling ticker exited");
}

/// A sampling loop that has not started yet.
pub struct Sampler {
    config: SamplerConfig,
    bundle: ModelBundle,
    matcher: FaceMatcher,
    roster: Roster,
    source: Box<dyn FrameSource>,
    ledger: SharedLedger,
    state_tx: watch::Sender<SamplerState>,
}

impl Sampler {
    /// Requires a matcher, so it cannot exist before enrollment succeeded.
    pub fn new(
        config: SamplerConfig,
        bundle: ModelBundle,
        matcher: FaceMatcher,
        roster: Roster,
        source: Box<dyn FrameSource>,
        ledger: SharedLedger,
    ) -> Self {
        let (state_tx, _) = watch::channel(SamplerState::Idle);
        Self {
            config,
            bundle,
            matcher,
            roster,
            source,
            ledger,
            state_tx,
        }
    }

    pub fn state(&self) -> watch::Receiver<SamplerState> {
        self.state_tx.subscribe()
    }

    /// Wait for a first frame, then begin ticking.
    ///
    /// A camera failure here is terminal for this sampler: the source is
    /// released and the caller must build a new one to retry.
    pub async fn start(self) -> Result<SamplerHandle, SamplerError> {
        let Sampler {
            config,
            bundle,
            matcher,
            roster,
            mut source,
            ledger,
            state_tx,
        } = self;

        if config.interval.is_zero() {
            source.release();
            state_tx.send_replace(SamplerState::Stopped);
            return Err(SamplerError::InvalidConfig(
                "sample interval must be non-zero".into(),
            ));
        }

        let (mut source, first) = tokio::task::spawn_blocking(move || {
            let mut source = source;
            let first = source.next_frame();
            (source, first)
        })
        .await
        .map_err(|e| SamplerError::CameraUnavailable(format!("first frame read panicked: {e}")))?;

        let first = match first {
            Ok(FrameRead::Frame(frame)) => frame,
            Ok(FrameRead::Ended) => {
                source.release();
                state_tx.send_replace(SamplerState::Stopped);
                return Err(SamplerError::SourceEnded);
            }
            Err(e) => {
                tracing::error!(error = %e, "webcam unavailable, sampling will not start");
                source.release();
                state_tx.send_replace(SamplerState::Stopped);
                return Err(SamplerError::CameraUnavailable(e.to_string()));
            }
        };

        let (overlay_tx, _) = watch::channel(Overlay::cleared(0, Some(first)));
        let pipeline = Arc::new(Pipeline {
            bundle,
            matcher,
            roster,
            source: Mutex::new(Some(source)),
            ledger,
            cancel: CancellationToken::new(),
            stats: Mutex::new(SamplerStats::default()),
            overlay_tx,
            state_tx,
            escalate_after: config.escalate_after,
        });

        pipeline.state_tx.send_replace(SamplerState::Sampling);
        tracing::info!(
            interval_ms = config.interval.as_millis() as u64,
            enrolled = pipeline.matcher.len(),
            threshold = pipeline.matcher.threshold(),
            "sampling started"
        );

        let ticker = tokio::spawn(run_ticker(Arc::clone(&pipeline), config.interval));
        Ok(SamplerHandle {
            pipeline,
            ticker: Some(ticker),
        })
    }
}

/// A running sampling loop.
pub struct SamplerHandle {
    pipeline: Arc<Pipeline>,
    ticker: Option<JoinHandle<()>>,
}

impl SamplerHandle {
    pub fn state(&self) -> SamplerState {
        *self.pipeline.state_tx.borrow()
    }

    pub fn state_changes(&self) -> watch::Receiver<SamplerState> {
        self.pipeline.state_tx.subscribe()
    }

    pub fn stats(&self) -> SamplerStats {
        *self.pipeline.stats()
    }

    pub fn overlay(&self) -> watch::Receiver<Overlay> {
        self.pipeline.overlay_tx.subscribe()
    }

    pub fn ledger(&self) -> &SharedLedger {
        &self.pipeline.ledger
    }

    /// Tear down. When this returns no tick will fire again, the camera has
    /// been released and the ledger will not be written by this sampler.
    pub async fn stop(mut self) {
        self.pipeline.cancel.cancel();
        if let Some(ticker) = self.ticker.take() {
            if let Err(e) = ticker.await {
                tracing::warn!(error = %e, "sampling ticker did not shut down cleanly");
            }
        }
        self.pipeline.release_source();
        // Wait out an apply that raced the cancel; later ones see it.
        drop(self.pipeline.ledger.lock());
        self.pipeline.state_tx.send_replace(SamplerState::Stopped);
        tracing::info!(stats = ?self.stats(), "sampling stopped");
    }
}

impl Drop for SamplerHandle {
    fn drop(&mut self) {
        if self.ticker.is_some() {
            self.pipeline.cancel.cancel();
            self.pipeline.release_source();
            self.pipeline.state_tx.send_replace(SamplerState::Stopped);
        }
    }
}
