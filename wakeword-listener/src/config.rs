/// Detector configuration
///
/// Constructor parameters for the listener, with defaults matching a 16kHz mono
/// openWakeWord-style model fed 80ms chunks. Can be loaded from a JSON file or
/// overlaid from `WAKEWORD_*` environment variables.

use crate::audio_source::AudioConfig;
use crate::chunk_queue::{CHUNK_SIZE, QUEUE_CAPACITY, SAMPLE_RATE};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

pub const DEFAULT_WAKEWORD_MODEL: &str = "hey_jarvis";
pub const DEFAULT_THRESHOLD: f32 = 0.25;
pub const DEFAULT_POLL_TIMEOUT_MS: u64 = 100;
/// Longest poll timeout accepted; `stop()` latency is bounded by it
pub const MAX_POLL_TIMEOUT_MS: u64 = 1000;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Invalid value for {var}: {value:?}")]
    InvalidEnv { var: &'static str, value: String },

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Inference framework the external engine should load models with
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InferenceBackend {
    #[default]
    Onnx,
    Tflite,
}

impl InferenceBackend {
    /// File extension of model artifacts for this backend
    pub fn model_extension(&self) -> &'static str {
        match self {
            InferenceBackend::Onnx => "onnx",
            InferenceBackend::Tflite => "tflite",
        }
    }
}

impl fmt::Display for InferenceBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.model_extension())
    }
}

impl FromStr for InferenceBackend {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "onnx" => Ok(InferenceBackend::Onnx),
            "tflite" => Ok(InferenceBackend::Tflite),
            other => Err(ConfigError::Invalid(format!("unknown inference backend '{}'", other))),
        }
    }
}

/// A configured wake-word model: a named preset the engine ships with, or a
/// path to a model file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModelId {
    Preset(String),
    File(PathBuf),
}

impl ModelId {
    pub fn parse(id: &str) -> Self {
        let path = Path::new(id);
        let has_separator = id.contains('/') || id.contains('\\');
        let has_model_ext = matches!(
            path.extension().and_then(|e| e.to_str()),
            Some("onnx") | Some("tflite")
        );

        if has_separator || has_model_ext {
            ModelId::File(path.to_path_buf())
        } else {
            ModelId::Preset(id.to_string())
        }
    }

    /// Key under which the engine reports this model's score.
    ///
    /// Model files are keyed by their file stem, so `models/hey_companion.onnx`
    /// scores as `hey_companion`.
    pub fn wake_word(&self) -> String {
        match self {
            ModelId::Preset(name) => name.clone(),
            ModelId::File(path) => path
                .file_stem()
                .map(|s| s.to_string_lossy().into_owned())
                .unwrap_or_else(|| path.to_string_lossy().into_owned()),
        }
    }
}

/// Configuration for the wake-word detector
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectorConfig {
    /// Wake-word model identifiers handed to the inference engine
    pub wakeword_models: Vec<String>,

    pub inference_backend: InferenceBackend,

    /// Detection threshold, a score must be strictly greater to fire
    pub threshold: f32,

    /// Samples per chunk
    pub chunk_size: usize,

    pub sample_rate: u32,

    pub channels: u16,

    /// Chunks the queue holds before dropping the oldest
    pub queue_capacity: usize,

    /// How long the detection loop waits for a chunk before re-checking the stop flag
    pub poll_timeout_ms: u64,

    /// Input device name, default device when unset
    pub input_device: Option<String>,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            wakeword_models: vec![DEFAULT_WAKEWORD_MODEL.to_string()],
            inference_backend: InferenceBackend::default(),
            threshold: DEFAULT_THRESHOLD,
            chunk_size: CHUNK_SIZE,
            sample_rate: SAMPLE_RATE,
            channels: 1,
            queue_capacity: QUEUE_CAPACITY,
            poll_timeout_ms: DEFAULT_POLL_TIMEOUT_MS,
            input_device: None,
        }
    }
}

impl DetectorConfig {
    /// Validate configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.threshold.is_finite() {
            return Err(ConfigError::Invalid(format!(
                "threshold must be a finite number, got {}",
                self.threshold
            )));
        }

        if self.chunk_size == 0 {
            return Err(ConfigError::Invalid("chunk_size must be greater than 0".to_string()));
        }

        if self.sample_rate == 0 {
            return Err(ConfigError::Invalid("sample_rate must be greater than 0".to_string()));
        }

        if self.channels == 0 {
            return Err(ConfigError::Invalid("channels must be greater than 0".to_string()));
        }

        if self.queue_capacity == 0 {
            return Err(ConfigError::Invalid("queue_capacity must be greater than 0".to_string()));
        }

        if self.poll_timeout_ms == 0 || self.poll_timeout_ms > MAX_POLL_TIMEOUT_MS {
            return Err(ConfigError::Invalid(format!(
                "poll_timeout_ms must be between 1 and {}",
                MAX_POLL_TIMEOUT_MS
            )));
        }

        if self.wakeword_models.iter().all(|m| m.trim().is_empty()) {
            return Err(ConfigError::Invalid(
                "at least one wake-word model is required".to_string(),
            ));
        }

        Ok(())
    }

    /// Load and validate a JSON config file. Missing fields take their defaults.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config: DetectorConfig = serde_json::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Defaults overlaid with `WAKEWORD_*` environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Defaults overlaid with values from `lookup`, keyed like the environment
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(models) = lookup("WAKEWORD_MODELS") {
            config.wakeword_models = models
                .split(',')
                .map(str::trim)
                .filter(|m| !m.is_empty())
                .map(String::from)
                .collect();
        }

        if let Some(backend) = lookup("WAKEWORD_BACKEND") {
            config.inference_backend = backend.parse()?;
        }

        if let Some(value) = lookup("WAKEWORD_THRESHOLD") {
            config.threshold = parse_env("WAKEWORD_THRESHOLD", value)?;
        }

        if let Some(value) = lookup("WAKEWORD_CHUNK_SIZE") {
            config.chunk_size = parse_env("WAKEWORD_CHUNK_SIZE", value)?;
        }

        if let Some(value) = lookup("WAKEWORD_SAMPLE_RATE") {
            config.sample_rate = parse_env("WAKEWORD_SAMPLE_RATE", value)?;
        }

        if let Some(device) = lookup("WAKEWORD_INPUT_DEVICE") {
            config.input_device = Some(device).filter(|d| !d.trim().is_empty());
        }

        config.validate()?;
        Ok(config)
    }

    /// Parsed model identifiers, blank entries skipped
    pub fn model_ids(&self) -> Vec<ModelId> {
        self.wakeword_models
            .iter()
            .map(|m| m.trim())
            .filter(|m| !m.is_empty())
            .map(ModelId::parse)
            .collect()
    }

    pub fn poll_timeout(&self) -> Duration {
        Duration::from_millis(self.poll_timeout_ms)
    }

    /// Stream parameters for the audio source
    pub fn audio_config(&self) -> AudioConfig {
        AudioConfig {
            sample_rate: self.sample_rate,
            channels: self.channels,
            chunk_size: self.chunk_size,
            device_name: self.input_device.clone(),
        }
    }
}

fn parse_env<T: FromStr>(var: &'static str, value: String) -> Result<T, ConfigError> {
    value
        .trim()
        .parse()
        .map_err(|_| ConfigError::InvalidEnv { var, value })
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use std::collections::HashMap;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = DetectorConfig::default();
        assert_eq!(config.wakeword_models, vec!["hey_jarvis"]);
        assert_eq!(config.inference_backend, InferenceBackend::Onnx);
        assert_relative_eq!(config.threshold, 0.25);
        assert_eq!(config.chunk_size, 1280);
        assert_eq!(config.sample_rate, 16000);
        assert_eq!(config.channels, 1);
        assert_eq!(config.poll_timeout(), Duration::from_millis(100));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation() {
        let mut config = DetectorConfig::default();

        config.threshold = f32::NAN;
        assert!(config.validate().is_err());
        config.threshold = 0.5;

        config.chunk_size = 0;
        assert!(config.validate().is_err());
        config.chunk_size = CHUNK_SIZE;

        config.channels = 0;
        assert!(config.validate().is_err());
        config.channels = 1;

        config.queue_capacity = 0;
        assert!(config.validate().is_err());
        config.queue_capacity = 8;

        config.poll_timeout_ms = 5000;
        assert!(config.validate().is_err());
        config.poll_timeout_ms = 50;

        config.wakeword_models = vec![" ".to_string()];
        assert!(config.validate().is_err());
        config.wakeword_models = vec!["alexa".to_string()];

        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_thresholds_above_one_are_accepted() {
        // Engines do not bound their scores, so neither does the threshold
        let config = DetectorConfig {
            threshold: 1.5,
            ..Default::default()
        };
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_from_json_file_fills_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{
                "wakeword_models": ["alexa", "models/hey_companion.onnx"],
                "threshold": 0.5,
                "inference_backend": "tflite"
            }}"#
        )
        .unwrap();

        let config = DetectorConfig::from_json_file(file.path()).unwrap();
        assert_eq!(config.wakeword_models.len(), 2);
        assert_relative_eq!(config.threshold, 0.5);
        assert_eq!(config.inference_backend, InferenceBackend::Tflite);
        assert_eq!(config.chunk_size, CHUNK_SIZE);
        assert_eq!(config.sample_rate, SAMPLE_RATE);
    }

    #[test]
    fn test_from_json_file_rejects_invalid() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{ "chunk_size": 0 }}"#).unwrap();
        assert!(matches!(
            DetectorConfig::from_json_file(file.path()),
            Err(ConfigError::Invalid(_))
        ));

        let mut garbage = tempfile::NamedTempFile::new().unwrap();
        write!(garbage, "not json").unwrap();
        assert!(matches!(
            DetectorConfig::from_json_file(garbage.path()),
            Err(ConfigError::Parse(_))
        ));

        assert!(matches!(
            DetectorConfig::from_json_file("/nonexistent/wakeword.json"),
            Err(ConfigError::Io { .. })
        ));
    }

    #[test]
    fn test_from_lookup() {
        let vars: HashMap<&str, &str> = HashMap::from([
            ("WAKEWORD_MODELS", "alexa, hey_companion ,"),
            ("WAKEWORD_BACKEND", "TFLite"),
            ("WAKEWORD_THRESHOLD", "0.6"),
            ("WAKEWORD_INPUT_DEVICE", "USB Mic"),
        ]);

        let config = DetectorConfig::from_lookup(|k| vars.get(k).map(|v| v.to_string())).unwrap();
        assert_eq!(config.wakeword_models, vec!["alexa", "hey_companion"]);
        assert_eq!(config.inference_backend, InferenceBackend::Tflite);
        assert_relative_eq!(config.threshold, 0.6);
        assert_eq!(config.input_device.as_deref(), Some("USB Mic"));
        assert_eq!(config.chunk_size, CHUNK_SIZE);
    }

    #[test]
    fn test_from_lookup_invalid_number() {
        let result = DetectorConfig::from_lookup(|k| {
            (k == "WAKEWORD_THRESHOLD").then(|| "loud".to_string())
        });
        match result {
            Err(ConfigError::InvalidEnv { var, value }) => {
                assert_eq!(var, "WAKEWORD_THRESHOLD");
                assert_eq!(value, "loud");
            }
            other => panic!("Expected InvalidEnv error, got {:?}", other),
        }
    }

    #[test]
    fn test_model_ids() {
        let config = DetectorConfig {
            wakeword_models: vec![
                "alexa".to_string(),
                "models/hey_companion.onnx".to_string(),
                "custom.tflite".to_string(),
            ],
            ..Default::default()
        };

        let ids = config.model_ids();
        assert_eq!(ids[0], ModelId::Preset("alexa".to_string()));
        assert_eq!(ids[1], ModelId::File(PathBuf::from("models/hey_companion.onnx")));
        assert_eq!(ids[2], ModelId::File(PathBuf::from("custom.tflite")));

        let keys: Vec<String> = ids.iter().map(ModelId::wake_word).collect();
        assert_eq!(keys, vec!["alexa", "hey_companion", "custom"]);
    }

    #[test]
    fn test_audio_config() {
        let config = DetectorConfig {
            input_device: Some("default".to_string()),
            ..Default::default()
        };
        let audio = config.audio_config();
        assert_eq!(audio.sample_rate, 16000);
        assert_eq!(audio.channels, 1);
        assert_eq!(audio.chunk_size, 1280);
        assert_eq!(audio.device_name.as_deref(), Some("default"));
    }
}
