/// Detection loop run on the processing thread
///
/// Pulls chunks from the queue, scores them, fires registered actions for
/// every score above the threshold and resets the engine once per chunk that
/// produced a detection. Engine and action failures are logged and the loop
/// carries on.

use crate::chunk_queue::{AudioChunk, ChunkQueue};
use crate::engine::{DetectionResult, InferenceEngine};
use crate::registry::CallbackRegistry;
use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tracing::{debug, error, info, trace, warn};

/// Processing loop lifecycle: `Idle -> Running -> Stopping -> Idle`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    Idle,
    Running,
    Stopping,
}

impl LoopState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => LoopState::Running,
            2 => LoopState::Stopping,
            _ => LoopState::Idle,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            LoopState::Idle => 0,
            LoopState::Running => 1,
            LoopState::Stopping => 2,
        }
    }
}

/// Loop state and counters shared between the processing thread and the detector
#[derive(Debug, Default)]
pub(crate) struct LoopStatus {
    state: AtomicU8,
    chunks_processed: AtomicU64,
    detections: AtomicU64,
    inference_failures: AtomicU64,
    callback_failures: AtomicU64,
}

impl LoopStatus {
    pub(crate) fn state(&self) -> LoopState {
        LoopState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub(crate) fn set_state(&self, state: LoopState) {
        self.state.store(state.as_u8(), Ordering::Release);
    }

    pub(crate) fn chunks_processed(&self) -> u64 {
        self.chunks_processed.load(Ordering::Relaxed)
    }

    pub(crate) fn detections(&self) -> u64 {
        self.detections.load(Ordering::Relaxed)
    }

    pub(crate) fn inference_failures(&self) -> u64 {
        self.inference_failures.load(Ordering::Relaxed)
    }

    pub(crate) fn callback_failures(&self) -> u64 {
        self.callback_failures.load(Ordering::Relaxed)
    }
}

pub(crate) struct DetectionLoop<E> {
    engine: Arc<Mutex<E>>,
    queue: Arc<ChunkQueue>,
    registry: CallbackRegistry,
    listening: Arc<AtomicBool>,
    status: Arc<LoopStatus>,
    threshold: f32,
    poll_timeout: Duration,
}

impl<E: InferenceEngine> DetectionLoop<E> {
    pub(crate) fn new(
        engine: Arc<Mutex<E>>,
        queue: Arc<ChunkQueue>,
        registry: CallbackRegistry,
        listening: Arc<AtomicBool>,
        status: Arc<LoopStatus>,
        threshold: f32,
        poll_timeout: Duration,
    ) -> Self {
        Self {
            engine,
            queue,
            registry,
            listening,
            status,
            threshold,
            poll_timeout,
        }
    }

    /// Run until the listening flag is cleared.
    ///
    /// The flag is checked before every pop, so once it is cleared the loop
    /// exits within one poll timeout plus the chunk in flight, regardless of
    /// how many chunks are still queued.
    pub(crate) fn run(self) {
        info!("Detection loop started");

        while self.listening.load(Ordering::Acquire) {
            match self.queue.pop_timeout(self.poll_timeout) {
                Some(chunk) => {
                    self.process_chunk(&chunk);
                }
                None => continue,
            }
        }

        self.status.set_state(LoopState::Stopping);
        debug!("Detection loop stopping, {} chunks left in queue", self.queue.len());
        self.status.set_state(LoopState::Idle);
        info!("Detection loop exited");
    }

    /// Score one chunk and dispatch its detections. Returns the number of hits.
    pub(crate) fn process_chunk(&self, chunk: &AudioChunk) -> usize {
        let scores = match self.predict(chunk) {
            Some(scores) => scores,
            None => return 0,
        };
        self.status.chunks_processed.fetch_add(1, Ordering::Relaxed);

        let mut hits = 0;
        for (wake_word, &score) in &scores {
            trace!(wake_word = %wake_word, score, "Score");

            if score > self.threshold {
                hits += 1;
                self.status.detections.fetch_add(1, Ordering::Relaxed);
                info!(wake_word = %wake_word, score, "Wake-word detected");
                self.dispatch(wake_word, score);
            }
        }

        if hits > 0 {
            self.reset_engine();
        }

        hits
    }

    fn predict(&self, chunk: &AudioChunk) -> Option<DetectionResult> {
        let mut engine = self.lock_engine();
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| engine.predict(chunk)));
        drop(engine);

        match outcome {
            Ok(Ok(scores)) => Some(scores),
            Ok(Err(e)) => {
                self.status.inference_failures.fetch_add(1, Ordering::Relaxed);
                error!(component = "inference", error = %e, "Inference failed, skipping chunk");
                None
            }
            Err(payload) => {
                self.status.inference_failures.fetch_add(1, Ordering::Relaxed);
                error!(
                    component = "inference",
                    panic = panic_message(&*payload),
                    "Inference panicked, skipping chunk"
                );
                None
            }
        }
    }

    fn dispatch(&self, wake_word: &str, score: f32) {
        let Some(action) = self.registry.lookup(wake_word) else {
            debug!(wake_word = %wake_word, "No callback registered");
            return;
        };

        match panic::catch_unwind(AssertUnwindSafe(|| action(wake_word, score))) {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                self.status.callback_failures.fetch_add(1, Ordering::Relaxed);
                error!(
                    component = "callback",
                    wake_word = %wake_word,
                    error = %e,
                    "Callback failed"
                );
            }
            Err(payload) => {
                self.status.callback_failures.fetch_add(1, Ordering::Relaxed);
                error!(
                    component = "callback",
                    wake_word = %wake_word,
                    panic = panic_message(&*payload),
                    "Callback panicked"
                );
            }
        }
    }

    fn reset_engine(&self) {
        let mut engine = self.lock_engine();
        if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| engine.reset())) {
            warn!(
                component = "inference",
                panic = panic_message(&*payload),
                "Engine reset panicked"
            );
        }
    }

    fn lock_engine(&self) -> MutexGuard<'_, E> {
        self.engine.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.as_str()
    } else {
        "unknown panic"
    }
}
