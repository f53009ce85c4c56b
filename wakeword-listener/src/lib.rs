/// Wake-word listener library
///
/// This library captures microphone audio, hands fixed-size chunks to a
/// detection thread through a bounded queue, scores them with a pluggable
/// inference engine and runs registered callbacks for detected wake-words.

pub mod audio_source;
pub mod chunk_queue;
pub mod config;
pub mod detection_loop;
pub mod detector;
pub mod engine;
pub mod logging;
pub mod registry;

// Re-export main types
pub use audio_source::{
    AudioConfig, AudioError, AudioSource, ChunkAssembler, ChunkSink, CpalSource, WavFileSource,
};
pub use chunk_queue::{AudioChunk, AudioSample, ChunkQueue, CHUNK_SIZE, SAMPLE_RATE};
pub use config::{ConfigError, DetectorConfig, InferenceBackend, ModelId};
pub use detection_loop::LoopState;
pub use detector::{DetectorError, DetectorState, DetectorStats, ListeningGuard, WakeWordDetector};
pub use engine::{DetectionResult, InferenceEngine, InferenceError};
pub use logging::init_tracing;
pub use registry::{CallbackRegistry, WakeAction};
