/// Inference engine boundary
///
/// The acoustic model is external to this crate. Anything that can turn a chunk
/// of PCM audio into per-wake-word scores, and forget its temporal state on
/// request, can drive the detector.

use crate::chunk_queue::AudioChunk;
use std::collections::BTreeMap;
use thiserror::Error;

/// Scores keyed by wake-word id, iterated in ascending id order.
///
/// Scores are nominally in [0, 1] but engines do not guarantee it; callers
/// should only compare them against a threshold.
pub type DetectionResult = BTreeMap<String, f32>;

#[derive(Error, Debug)]
pub enum InferenceError {
    #[error("Invalid input chunk: {0}")]
    InvalidInput(String),

    #[error("Model failure: {0}")]
    Model(String),
}

/// Stateful wake-word model.
///
/// `predict` may keep a sliding window over several chunks, so earlier chunks
/// influence later scores. `reset` clears that window; the detection loop calls
/// it once after every chunk that produced a detection.
#[cfg_attr(test, mockall::automock)]
pub trait InferenceEngine: Send {
    fn predict(&mut self, chunk: &AudioChunk) -> Result<DetectionResult, InferenceError>;

    fn reset(&mut self);
}

impl<E: InferenceEngine + ?Sized> InferenceEngine for Box<E> {
    fn predict(&mut self, chunk: &AudioChunk) -> Result<DetectionResult, InferenceError> {
        (**self).predict(chunk)
    }

    fn reset(&mut self) {
        (**self).reset()
    }
}
