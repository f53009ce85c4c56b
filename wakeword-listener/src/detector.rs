/// Wake-word detector main module
///
/// Ties an audio source, the chunk queue, an inference engine and the callback
/// registry together under start/stop lifecycle control. The audio callback
/// only enqueues; inference and callbacks run on a dedicated detection thread.

use crate::audio_source::{AudioError, AudioSource, ChunkSink, CpalSource};
use crate::chunk_queue::{AudioChunk, ChunkQueue};
use crate::config::{ConfigError, DetectorConfig, InferenceBackend, ModelId};
use crate::detection_loop::{DetectionLoop, LoopState, LoopStatus};
use crate::engine::{InferenceEngine, InferenceError};
use crate::registry::CallbackRegistry;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use thiserror::Error;
use tracing::{debug, error, info, warn};

#[derive(Error, Debug)]
pub enum DetectorError {
    #[error("Invalid configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("Audio device error: {0}")]
    Device(#[from] AudioError),

    #[error("Failed to load wake-word models: {0}")]
    Inference(#[from] InferenceError),

    #[error("Failed to spawn detection thread: {0}")]
    ThreadSpawn(std::io::Error),
}

/// Detector lifecycle. The audio stream and the detection thread exist
/// exactly when the detector is `Listening`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DetectorState {
    Stopped,
    Listening,
}

/// Detector statistics
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DetectorStats {
    pub chunks_processed: u64,
    pub wake_words_detected: u64,
    pub inference_failures: u64,
    pub callback_failures: u64,
    pub chunks_dropped: u64,
    pub queue_depth: usize,
    pub is_listening: bool,
}

/// Main wake-word detector
pub struct WakeWordDetector<E, S>
where
    E: InferenceEngine + 'static,
    S: AudioSource,
{
    config: DetectorConfig,
    source: S,
    engine: Arc<Mutex<E>>,
    queue: Arc<ChunkQueue>,
    registry: CallbackRegistry,
    listening: Arc<AtomicBool>,
    status: Arc<LoopStatus>,
    worker: Option<JoinHandle<()>>,
}

impl<E> WakeWordDetector<E, CpalSource>
where
    E: InferenceEngine + 'static,
{
    /// Create a detector capturing from the configured (or default) microphone
    pub fn with_microphone(config: DetectorConfig, engine: E) -> Result<Self, DetectorError> {
        Self::new(config, engine, CpalSource::new())
    }
}

impl<E, S> WakeWordDetector<E, S>
where
    E: InferenceEngine + 'static,
    S: AudioSource,
{
    /// Create a new wake-word detector
    pub fn new(config: DetectorConfig, engine: E, source: S) -> Result<Self, DetectorError> {
        config.validate()?;

        info!("Initializing wake-word detector");
        info!("Models: {:?} ({})", config.wakeword_models, config.inference_backend);
        info!("Threshold: {}", config.threshold);
        debug!(
            "Audio: {} Hz, {} channel(s), {} samples per chunk",
            config.sample_rate, config.channels, config.chunk_size
        );

        let queue = Arc::new(ChunkQueue::with_capacity(config.queue_capacity));

        Ok(Self {
            config,
            source,
            engine: Arc::new(Mutex::new(engine)),
            queue,
            registry: CallbackRegistry::new(),
            listening: Arc::new(AtomicBool::new(false)),
            status: Arc::new(LoopStatus::default()),
            worker: None,
        })
    }

    /// Create a detector whose engine is built from the configured models.
    ///
    /// `loader` receives the parsed model identifiers and the inference backend;
    /// resolving and loading the model artifacts is up to it.
    pub fn with_loader<L>(
        config: DetectorConfig,
        source: S,
        loader: L,
    ) -> Result<Self, DetectorError>
    where
        L: FnOnce(&[ModelId], InferenceBackend) -> Result<E, InferenceError>,
    {
        config.validate()?;

        let models = config.model_ids();
        let engine = loader(&models, config.inference_backend).map_err(|e| {
            error!(component = "inference", error = %e, "Failed to load wake-word models");
            e
        })?;

        Self::new(config, engine, source)
    }

    /// Register the action run when `wake_word` scores above the threshold.
    ///
    /// Replaces any earlier action for the same wake-word. Actions run on the
    /// detection thread; a slow action delays the chunks behind it.
    pub fn register_callback<F>(&self, wake_word: impl Into<String>, action: F)
    where
        F: Fn(&str, f32) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let wake_word: String = wake_word.into();
        let configured = self
            .config
            .model_ids()
            .iter()
            .any(|model| model.wake_word() == wake_word);
        if !configured {
            warn!(wake_word = %wake_word, "No configured model reports this wake-word");
        }

        self.registry.register(wake_word, action);
    }

    pub fn unregister_callback(&self, wake_word: &str) -> bool {
        self.registry.unregister(wake_word)
    }

    /// Open the audio source and start the detection thread.
    ///
    /// Calling this while already listening logs a warning and does nothing.
    /// If the device cannot be opened the detector stays stopped.
    pub fn start(&mut self) -> Result<(), DetectorError> {
        if self.state() == DetectorState::Listening {
            warn!("Detector already listening");
            return Ok(());
        }

        info!("Starting wake-word detector");

        let queue = Arc::clone(&self.queue);
        let listening = Arc::clone(&self.listening);
        let sink: ChunkSink = Box::new(move |chunk: AudioChunk| {
            if listening.load(Ordering::Acquire) {
                queue.push(chunk);
            }
        });

        // Sources may deliver before `open` returns; those chunks wait in the queue
        // until the detection thread is up.
        self.listening.store(true, Ordering::Release);

        if let Err(e) = self.source.open(&self.config.audio_config(), sink) {
            self.listening.store(false, Ordering::Release);
            self.queue.clear();
            error!(component = "audio", error = %e, "Failed to open audio source");
            return Err(e.into());
        }

        self.status.set_state(LoopState::Running);

        let detection_loop = DetectionLoop::new(
            Arc::clone(&self.engine),
            Arc::clone(&self.queue),
            self.registry.clone(),
            Arc::clone(&self.listening),
            Arc::clone(&self.status),
            self.config.threshold,
            self.config.poll_timeout(),
        );

        let spawned = thread::Builder::new()
            .name("wakeword-detection".into())
            .spawn(move || detection_loop.run());

        match spawned {
            Ok(handle) => {
                self.worker = Some(handle);
                info!("Detector started and listening");
                Ok(())
            }
            Err(e) => {
                error!(component = "detector", error = %e, "Failed to spawn detection thread");
                self.listening.store(false, Ordering::Release);
                self.status.set_state(LoopState::Idle);
                self.close_source();
                self.queue.clear();
                Err(DetectorError::ThreadSpawn(e))
            }
        }
    }

    /// Stop listening: join the detection thread, close the audio source and
    /// drain the queue.
    ///
    /// Does nothing if already stopped. Never fails; close errors are logged.
    /// Returns within one poll timeout plus the chunk being processed.
    pub fn stop(&mut self) {
        let Some(worker) = self.worker.take() else {
            return;
        };

        info!("Stopping detector");
        self.listening.store(false, Ordering::Release);
        self.status.set_state(LoopState::Stopping);

        if worker.join().is_err() {
            error!(component = "detector", "Detection thread panicked");
        }
        self.status.set_state(LoopState::Idle);

        self.close_source();

        let drained = self.queue.clear();
        if drained > 0 {
            debug!("Discarded {} unprocessed chunks", drained);
        }

        info!("Detector stopped");
    }

    /// Start listening and return a guard that stops the detector when dropped,
    /// including on early return and panic unwinding.
    pub fn listen(&mut self) -> Result<ListeningGuard<'_, E, S>, DetectorError> {
        self.start()?;
        Ok(ListeningGuard { detector: self })
    }

    pub fn state(&self) -> DetectorState {
        if self.worker.is_some() {
            DetectorState::Listening
        } else {
            DetectorState::Stopped
        }
    }

    pub fn is_listening(&self) -> bool {
        self.state() == DetectorState::Listening
    }

    pub fn loop_state(&self) -> LoopState {
        self.status.state()
    }

    /// Get current statistics
    pub fn stats(&self) -> DetectorStats {
        DetectorStats {
            chunks_processed: self.status.chunks_processed(),
            wake_words_detected: self.status.detections(),
            inference_failures: self.status.inference_failures(),
            callback_failures: self.status.callback_failures(),
            chunks_dropped: self.queue.dropped(),
            queue_depth: self.queue.len(),
            is_listening: self.is_listening(),
        }
    }

    pub fn config(&self) -> &DetectorConfig {
        &self.config
    }

    pub fn source(&self) -> &S {
        &self.source
    }

    fn close_source(&mut self) {
        if let Err(e) = self.source.close() {
            warn!(component = "audio", error = %e, "Failed to close audio source");
        }
    }
}

impl<E, S> Drop for WakeWordDetector<E, S>
where
    E: InferenceEngine + 'static,
    S: AudioSource,
{
    fn drop(&mut self) {
        self.stop();
    }
}

/// Scope guard returned by [`WakeWordDetector::listen`]
pub struct ListeningGuard<'a, E, S>
where
    E: InferenceEngine + 'static,
    S: AudioSource,
{
    detector: &'a mut WakeWordDetector<E, S>,
}

impl<E, S> Deref for ListeningGuard<'_, E, S>
where
    E: InferenceEngine + 'static,
    S: AudioSource,
{
    type Target = WakeWordDetector<E, S>;

    fn deref(&self) -> &Self::Target {
        &*self.detector
    }
}

impl<E, S> DerefMut for ListeningGuard<'_, E, S>
where
    E: InferenceEngine + 'static,
    S: AudioSource,
{
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut *self.detector
    }
}

impl<E, S> Drop for ListeningGuard<'_, E, S>
where
    E: InferenceEngine + 'static,
    S: AudioSource,
{
    fn drop(&mut self) {
        self.detector.stop();
    }
}
