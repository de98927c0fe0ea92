//! Whole-session flows: enroll, sample, mark, report, tear down.

use async_trait::async_trait;
use rollcall_core::{
    enroll, AttendanceSnapshot, AttendanceStatus, BoundingBox, Descriptor, DescriptorExtractor,
    Detection, ExtractError, FetchError, FrameRead, FrameSource, GrayFrame, Identity, ModelBundle,
    ReferenceFetcher, ReportError, ReportRequester, Roster, Sampler, SamplerConfig, SamplerState,
    SharedLedger, SourceError,
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc, Mutex};
use std::time::{Duration, Instant};

/// A "photo" is a one-pixel frame; the pixel value picks what the extractor sees.
fn photo(key: u8) -> GrayFrame {
    GrayFrame::new(vec![key], 1, 1)
}

fn detection(values: &[f32]) -> Detection {
    Detection {
        bbox: BoundingBox {
            x: 10.0,
            y: 10.0,
            width: 50.0,
            height: 50.0,
            confidence: 0.95,
            landmarks: None,
        },
        descriptor: Descriptor::new(values.to_vec()),
    }
}

#[derive(Clone, Default)]
struct Gate {
    entered: Option<Arc<Mutex<mpsc::Sender<()>>>>,
    release: Option<Arc<Mutex<mpsc::Receiver<()>>>>,
}

/// Maps photo keys to the faces in them; optionally slow or gated.
struct ScriptedExtractor {
    faces: HashMap<u8, Vec<Vec<f32>>>,
    delay: Duration,
    gate: Gate,
    gate_key: Option<u8>,
}

impl ScriptedExtractor {
    fn new(faces: HashMap<u8, Vec<Vec<f32>>>) -> Self {
        Self {
            faces,
            delay: Duration::ZERO,
            gate: Gate::default(),
            gate_key: None,
        }
    }
}

impl DescriptorExtractor for ScriptedExtractor {
    fn detect_all(&mut self, image: &GrayFrame) -> Result<Vec<Detection>, ExtractError> {
        let key = image.data[0];
        if Some(key) == self.gate_key {
            if let Some(entered) = &self.gate.entered {
                let _ = entered.lock().unwrap().send(());
            }
            if let Some(release) = &self.gate.release {
                let _ = release.lock().unwrap().recv_timeout(Duration::from_secs(5));
            }
        }
        if !self.delay.is_zero() {
            std::thread::sleep(self.delay);
        }
        Ok(self
            .faces
            .get(&key)
            .map(|faces| faces.iter().map(|v| detection(v)).collect())
            .unwrap_or_default())
    }
}

struct PhotoFetcher(HashMap<&'static str, u8>);

#[async_trait]
impl ReferenceFetcher for PhotoFetcher {
    async fn fetch(&self, uri: &str) -> Result<GrayFrame, FetchError> {
        self.0.get(uri).map(|&k| photo(k)).ok_or(FetchError::Status(404))
    }
}

/// Plays `frames` in order, then repeats the last one forever.
struct Playlist {
    frames: Vec<u8>,
    pos: usize,
    released: Arc<AtomicBool>,
}

impl Playlist {
    fn new(frames: &[u8], released: Arc<AtomicBool>) -> Self {
        Self {
            frames: frames.to_vec(),
            pos: 0,
            released,
        }
    }
}

impl FrameSource for Playlist {
    fn next_frame(&mut self) -> Result<FrameRead, SourceError> {
        if self.released.load(Ordering::SeqCst) {
            return Err(SourceError::Unavailable("read after release".into()));
        }
        let key = self.frames[self.pos.min(self.frames.len() - 1)];
        self.pos += 1;
        Ok(FrameRead::Frame(photo(key)))
    }

    fn release(&mut self) {
        self.released.store(true, Ordering::SeqCst);
    }
}

/// Records what it was asked to summarize.
#[derive(Default)]
struct RecordingReporter {
    seen: Mutex<Vec<AttendanceSnapshot>>,
}

#[async_trait]
impl ReportRequester for RecordingReporter {
    async fn summarize(&self, snapshot: &AttendanceSnapshot) -> Result<String, ReportError> {
        self.seen.lock().unwrap().push(snapshot.clone());
        Ok("Great turnout today! Let's get started.".into())
    }
}

fn class() -> Roster {
    Roster::new(vec![
        Identity::new(1, "Alice", "alice.png"),
        Identity::new(2, "Bob", "bob.png"),
        Identity::new(3, "Carol", "carol.png"),
    ])
    .unwrap()
}

const ALICE_PHOTO: u8 = 1;
const BOB_PHOTO: u8 = 2;
const CAROL_PHOTO: u8 = 3;
const EMPTY_ROOM: u8 = 10;
const ALICE_LIVE: u8 = 11;
const STRANGER_LIVE: u8 = 12;

/// Reference descriptors sit far apart on one axis; Alice's live face is 0.3
/// from her photo, the stranger 0.9 from it.
fn faces() -> HashMap<u8, Vec<Vec<f32>>> {
    HashMap::from([
        (ALICE_PHOTO, vec![vec![0.0, 0.0]]),
        (BOB_PHOTO, vec![vec![10.0, 0.0]]),
        (CAROL_PHOTO, vec![vec![20.0, 0.0]]),
        (ALICE_LIVE, vec![vec![0.3, 0.0]]),
        (STRANGER_LIVE, vec![vec![-0.9, 0.0]]),
    ])
}

fn fetcher() -> PhotoFetcher {
    PhotoFetcher(HashMap::from([
        ("alice.png", ALICE_PHOTO),
        ("bob.png", BOB_PHOTO),
        ("carol.png", CAROL_PHOTO),
    ]))
}

async fn wait_until(timeout: Duration, mut done: impl FnMut() -> bool) {
    let deadline = Instant::now() + timeout;
    while !done() {
        assert!(Instant::now() < deadline, "condition not reached within {timeout:?}");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

#[tokio::test]
async fn test_alice_is_marked_and_stranger_is_not() {
    let roster = class();
    let bundle = ModelBundle::with_extractor(ScriptedExtractor::new(faces()));
    let matcher = enroll(&roster, &fetcher(), &bundle)
        .await
        .unwrap()
        .into_matcher(0.6)
        .unwrap();

    let ledger = SharedLedger::new(&roster);
    let released = Arc::new(AtomicBool::new(false));
    // First frame is the liveness check at start.
    let source = Playlist::new(
        &[EMPTY_ROOM, ALICE_LIVE, STRANGER_LIVE, EMPTY_ROOM],
        Arc::clone(&released),
    );
    let handle = Sampler::new(
        SamplerConfig { interval: Duration::from_millis(30), escalate_after: 10 },
        bundle,
        matcher,
        roster.clone(),
        Box::new(source),
        ledger.clone(),
    )
    .start()
    .await
    .unwrap();

    let mut overlays = handle.overlay();
    let mut labels_by_tick = Vec::new();
    while labels_by_tick.len() < 3 {
        tokio::time::timeout(Duration::from_secs(5), overlays.changed())
            .await
            .expect("tick within 5s")
            .unwrap();
        let overlay = overlays.borrow_and_update().clone();
        labels_by_tick.push(overlay.boxes.iter().map(|b| b.label.clone()).collect::<Vec<_>>());
    }

    assert_eq!(labels_by_tick[0], vec!["Alice (0.30)"]);
    assert_eq!(labels_by_tick[1], vec!["unknown (0.90)"]);
    assert!(labels_by_tick[2].is_empty());

    let statuses: Vec<_> = ledger.snapshot().entries.iter().map(|e| e.status).collect();
    assert_eq!(
        statuses,
        vec![AttendanceStatus::Present, AttendanceStatus::Absent, AttendanceStatus::Absent]
    );

    let reporter = RecordingReporter::default();
    let snapshot = ledger.snapshot();
    let text = reporter.summarize(&snapshot).await.unwrap();
    assert!(!text.is_empty());
    assert_eq!(reporter.seen.lock().unwrap()[0], snapshot);

    handle.stop().await;
    assert!(released.load(Ordering::SeqCst));
}

#[tokio::test]
async fn test_slow_ticks_are_skipped_not_queued() {
    let roster = class();
    let mut extractor = ScriptedExtractor::new(faces());
    let bundle = ModelBundle::with_extractor(ScriptedExtractor::new(faces()));
    let matcher = enroll(&roster, &fetcher(), &bundle)
        .await
        .unwrap()
        .into_matcher(0.6)
        .unwrap();
    extractor.delay = Duration::from_millis(120);

    let interval = Duration::from_millis(40);
    let started = Instant::now();
    let handle = Sampler::new(
        SamplerConfig { interval, escalate_after: 0 },
        ModelBundle::with_extractor(extractor),
        matcher,
        roster.clone(),
        Box::new(Playlist::new(&[EMPTY_ROOM], Arc::default())),
        SharedLedger::new(&roster),
    )
    .start()
    .await
    .unwrap();

    tokio::time::sleep(Duration::from_millis(600)).await;
    let stats = handle.stats();
    let elapsed = started.elapsed();
    handle.stop().await;

    let periods = (elapsed.as_millis() / interval.as_millis()) as u64 + 1;
    assert!(stats.ticks_run <= periods, "{} ticks in {periods} periods", stats.ticks_run);
    assert!(stats.ticks_skipped > 0, "overlapping ticks must be dropped");
    // Each tick needs 120ms, so at most one per three periods can have run.
    assert!(stats.ticks_run as u128 <= elapsed.as_millis() / 120 + 1);
}

#[tokio::test]
async fn test_teardown_discards_in_flight_tick() {
    let roster = class();
    let bundle = ModelBundle::with_extractor(ScriptedExtractor::new(faces()));
    let matcher = enroll(&roster, &fetcher(), &bundle)
        .await
        .unwrap()
        .into_matcher(0.6)
        .unwrap();

    let (entered_tx, entered_rx) = mpsc::channel();
    let (release_tx, release_rx) = mpsc::channel();
    let mut extractor = ScriptedExtractor::new(faces());
    extractor.gate_key = Some(ALICE_LIVE);
    extractor.gate = Gate {
        entered: Some(Arc::new(Mutex::new(entered_tx))),
        release: Some(Arc::new(Mutex::new(release_rx))),
    };

    let ledger = SharedLedger::new(&roster);
    let released = Arc::new(AtomicBool::new(false));
    let handle = Sampler::new(
        SamplerConfig { interval: Duration::from_millis(20), escalate_after: 10 },
        ModelBundle::with_extractor(extractor),
        matcher,
        roster.clone(),
        Box::new(Playlist::new(&[EMPTY_ROOM, ALICE_LIVE], Arc::clone(&released))),
        ledger.clone(),
    )
    .start()
    .await
    .unwrap();
    let mut state = handle.state_changes();
    let overlays = handle.overlay();

    // Alice's tick is now blocked inside detection.
    tokio::task::spawn_blocking(move || entered_rx.recv_timeout(Duration::from_secs(5)))
        .await
        .unwrap()
        .expect("tick reached detection");

    handle.stop().await;
    assert!(released.load(Ordering::SeqCst), "camera released during teardown");
    assert_eq!(*state.borrow_and_update(), SamplerState::Stopped);

    release_tx.send(()).unwrap();
    let tick_before = overlays.borrow().tick;
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert_eq!(ledger.snapshot().present_count(), 0, "in-flight results must be discarded");
    assert_eq!(overlays.borrow().tick, tick_before);
}

#[tokio::test]
async fn test_reset_mid_session_keeps_sampling() {
    let roster = class();
    let bundle = ModelBundle::with_extractor(ScriptedExtractor::new(faces()));
    let matcher = enroll(&roster, &fetcher(), &bundle).await.unwrap().into_matcher(0.6).unwrap();
    let ledger = SharedLedger::new(&roster);
    let handle = Sampler::new(
        SamplerConfig { interval: Duration::from_millis(20), escalate_after: 10 },
        bundle,
        matcher,
        roster.clone(),
        Box::new(Playlist::new(&[EMPTY_ROOM, ALICE_LIVE], Arc::default())),
        ledger.clone(),
    )
    .start()
    .await
    .unwrap();

    wait_until(Duration::from_secs(5), || ledger.snapshot().present_count() == 1).await;
    let first = ledger.snapshot().session_id;
    let second = ledger.reset(&roster);
    assert_ne!(first, second);

    // Alice is still in view, so the new session marks her again.
    wait_until(Duration::from_secs(5), || ledger.snapshot().present_count() == 1).await;
    assert_eq!(ledger.snapshot().session_id, second);
    handle.stop().await;
}
