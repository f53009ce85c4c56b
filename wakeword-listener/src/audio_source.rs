/// Audio sources feeding the detector
///
/// A source owns the device (or file) handle and delivers fixed-size mono
/// chunks to a sink closure from a thread it controls. For microphones that is
/// the platform's real-time audio thread, so sinks must return immediately.

use crate::chunk_queue::{AudioChunk, AudioSample};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use thiserror::Error;
use tracing::{debug, error, info, warn};

#[derive(Error, Debug)]
pub enum AudioError {
    #[error("No input device available")]
    NoInputDevice,

    #[error("Input device not found: {0}")]
    DeviceNotFound(String),

    #[error("Unsupported stream format: {0}")]
    Unsupported(String),

    #[error("Audio stream error: {0}")]
    Stream(String),

    #[error("WAV error: {0}")]
    Wav(#[from] hound::Error),

    #[error("Audio source already open")]
    AlreadyOpen,
}

/// Receives each completed chunk. Called on the source's delivery thread.
pub type ChunkSink = Box<dyn FnMut(AudioChunk) + Send + 'static>;

/// Stream parameters requested from a source
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioConfig {
    pub sample_rate: u32,
    pub channels: u16,
    /// Mono samples per delivered chunk
    pub chunk_size: usize,
    pub device_name: Option<String>,
}

/// Capture device abstraction.
///
/// `open` starts delivery into `sink`; `close` stops it. After `close`
/// returns the sink is never called again.
pub trait AudioSource {
    fn open(&mut self, config: &AudioConfig, sink: ChunkSink) -> Result<(), AudioError>;

    fn close(&mut self) -> Result<(), AudioError>;

    fn is_open(&self) -> bool;
}

/// Regroups arbitrarily sized interleaved device buffers into exact mono chunks.
///
/// Multi-channel frames are downmixed by averaging.
pub struct ChunkAssembler {
    chunk_size: usize,
    channels: usize,
    pending: Vec<AudioSample>,
}

impl ChunkAssembler {
    /// A zero `chunk_size` is treated as one sample per chunk.
    pub fn new(chunk_size: usize, channels: u16) -> Self {
        let chunk_size = chunk_size.max(1);
        Self {
            chunk_size,
            channels: channels.max(1) as usize,
            pending: Vec::with_capacity(chunk_size),
        }
    }

    /// Feed interleaved `i16` samples, emitting every completed chunk
    pub fn feed(&mut self, data: &[AudioSample], emit: &mut dyn FnMut(AudioChunk)) {
        self.feed_with(data, |s| s, emit);
    }

    /// Feed interleaved `f32` samples in [-1.0, 1.0]
    pub fn feed_f32(&mut self, data: &[f32], emit: &mut dyn FnMut(AudioChunk)) {
        self.feed_with(data, f32_to_i16, emit);
    }

    fn feed_with<T: Copy>(
        &mut self,
        data: &[T],
        convert: impl Fn(T) -> AudioSample,
        emit: &mut dyn FnMut(AudioChunk),
    ) {
        for frame in data.chunks(self.channels) {
            let sample = if self.channels == 1 {
                convert(frame[0])
            } else {
                let sum: i32 = frame.iter().map(|&s| convert(s) as i32).sum();
                (sum / frame.len() as i32) as AudioSample
            };

            self.pending.push(sample);

            if self.pending.len() == self.chunk_size {
                let full =
                    std::mem::replace(&mut self.pending, Vec::with_capacity(self.chunk_size));
                emit(AudioChunk::new(full));
            }
        }
    }

    /// Emit any partial chunk zero-padded to full length
    pub fn flush(&mut self, emit: &mut dyn FnMut(AudioChunk)) {
        if self.pending.is_empty() {
            return;
        }
        let mut rest = std::mem::take(&mut self.pending);
        rest.resize(self.chunk_size, 0);
        emit(AudioChunk::new(rest));
    }

    /// Samples buffered towards the next chunk
    pub fn pending(&self) -> usize {
        self.pending.len()
    }
}

fn f32_to_i16(s: f32) -> AudioSample {
    (s * 32767.0).clamp(-32768.0, 32767.0) as AudioSample
}

/// Microphone capture through cpal.
///
/// The stream handle is not `Send` on every platform, so neither is this source.
#[derive(Default)]
pub struct CpalSource {
    stream: Option<cpal::Stream>,
}

impl CpalSource {
    pub fn new() -> Self {
        Self::default()
    }

    fn select_device(name: Option<&str>) -> Result<cpal::Device, AudioError> {
        let host = cpal::default_host();

        match name {
            None => host.default_input_device().ok_or(AudioError::NoInputDevice),
            Some(wanted) => host
                .input_devices()
                .map_err(|e| AudioError::Stream(e.to_string()))?
                .find(|d| d.name().map(|n| n == wanted).unwrap_or(false))
                .ok_or_else(|| AudioError::DeviceNotFound(wanted.to_string())),
        }
    }
}

impl AudioSource for CpalSource {
    fn open(&mut self, config: &AudioConfig, mut sink: ChunkSink) -> Result<(), AudioError> {
        if self.stream.is_some() {
            return Err(AudioError::AlreadyOpen);
        }

        let device = Self::select_device(config.device_name.as_deref())?;
        if let Ok(name) = device.name() {
            info!("Input device: {}", name);
        }

        let sample_format = device
            .default_input_config()
            .map_err(|e| AudioError::Unsupported(e.to_string()))?
            .sample_format();

        let stream_config = cpal::StreamConfig {
            channels: config.channels,
            sample_rate: cpal::SampleRate(config.sample_rate),
            buffer_size: cpal::BufferSize::Default,
        };
        debug!("Requested input config: {:?} ({:?})", stream_config, sample_format);

        let mut assembler = ChunkAssembler::new(config.chunk_size, config.channels);
        let err_fn = |err| error!("An error occurred on the input stream: {}", err);

        let stream = match sample_format {
            cpal::SampleFormat::I16 => device.build_input_stream(
                &stream_config,
                move |data: &[i16], _: &cpal::InputCallbackInfo| {
                    assembler.feed(data, &mut sink);
                },
                err_fn,
                None,
            ),
            cpal::SampleFormat::F32 => device.build_input_stream(
                &stream_config,
                move |data: &[f32], _: &cpal::InputCallbackInfo| {
                    assembler.feed_f32(data, &mut sink);
                },
                err_fn,
                None,
            ),
            other => {
                return Err(AudioError::Unsupported(format!("sample format {:?}", other)));
            }
        }
        .map_err(|e| AudioError::Stream(e.to_string()))?;

        stream.play().map_err(|e| AudioError::Stream(e.to_string()))?;
        info!("Audio capture stream started");

        self.stream = Some(stream);
        Ok(())
    }

    fn close(&mut self) -> Result<(), AudioError> {
        let Some(stream) = self.stream.take() else {
            return Ok(());
        };

        let paused = stream.pause();
        drop(stream);
        info!("Audio capture stream closed");

        paused.map_err(|e| AudioError::Stream(e.to_string()))
    }

    fn is_open(&self) -> bool {
        self.stream.is_some()
    }
}

/// Replays a 16-bit PCM WAV file as if it were a microphone.
///
/// Chunks are delivered from a dedicated thread, paced at real time unless
/// `realtime` is off. The final partial chunk is zero-padded.
pub struct WavFileSource {
    path: PathBuf,
    realtime: bool,
    stop: Arc<AtomicBool>,
    finished: Arc<AtomicBool>,
    worker: Option<JoinHandle<()>>,
}

impl WavFileSource {
    pub fn new(path: impl AsRef<Path>, realtime: bool) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            realtime,
            stop: Arc::new(AtomicBool::new(false)),
            finished: Arc::new(AtomicBool::new(false)),
            worker: None,
        }
    }

    /// True once every chunk of the file has been delivered
    pub fn is_finished(&self) -> bool {
        self.finished.load(Ordering::Acquire)
    }
}

impl AudioSource for WavFileSource {
    fn open(&mut self, config: &AudioConfig, mut sink: ChunkSink) -> Result<(), AudioError> {
        if self.worker.is_some() {
            return Err(AudioError::AlreadyOpen);
        }

        let reader = hound::WavReader::open(&self.path)?;
        let spec = reader.spec();

        if spec.sample_format != hound::SampleFormat::Int || spec.bits_per_sample != 16 {
            return Err(AudioError::Unsupported(format!(
                "{:?} expected 16-bit integer PCM, got {} bit {:?}",
                self.path, spec.bits_per_sample, spec.sample_format
            )));
        }

        if spec.sample_rate != config.sample_rate {
            return Err(AudioError::Unsupported(format!(
                "{:?} is {} Hz, detector expects {} Hz",
                self.path, spec.sample_rate, config.sample_rate
            )));
        }

        let samples = reader.into_samples::<i16>().collect::<Result<Vec<_>, _>>()?;
        info!(
            "Replaying {:?}: {} samples, {} channel(s)",
            self.path,
            samples.len(),
            spec.channels
        );

        self.stop.store(false, Ordering::Release);
        self.finished.store(false, Ordering::Release);

        let stop = Arc::clone(&self.stop);
        let finished = Arc::clone(&self.finished);
        let realtime = self.realtime;
        let sample_rate = config.sample_rate;
        let frames_per_block = config.chunk_size;
        let channels = spec.channels;
        let mut assembler = ChunkAssembler::new(config.chunk_size, channels);

        let worker = thread::Builder::new()
            .name("wav-source".into())
            .spawn(move || {
                let mut deliver = |chunk: AudioChunk| {
                    let pace = chunk.duration(sample_rate);
                    sink(chunk);
                    if realtime {
                        thread::sleep(pace);
                    }
                };

                for block in samples.chunks(frames_per_block * channels as usize) {
                    if stop.load(Ordering::Acquire) {
                        debug!("WAV replay stopped early");
                        return;
                    }
                    assembler.feed(block, &mut deliver);
                }
                assembler.flush(&mut deliver);

                finished.store(true, Ordering::Release);
                debug!("WAV replay finished");
            })
            .map_err(|e| AudioError::Stream(format!("failed to spawn replay thread: {}", e)))?;

        self.worker = Some(worker);
        Ok(())
    }

    fn close(&mut self) -> Result<(), AudioError> {
        let Some(worker) = self.worker.take() else {
            return Ok(());
        };

        self.stop.store(true, Ordering::Release);
        if worker.join().is_err() {
            warn!("WAV replay thread panicked");
            return Err(AudioError::Stream("replay thread panicked".to_string()));
        }
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.worker.is_some()
    }
}

impl Drop for WavFileSource {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            warn!(component = "audio", error = %e, "Failed to close WAV source");
        }
    }
}
