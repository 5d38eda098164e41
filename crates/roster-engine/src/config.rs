use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

/// Detector model file inside `model_dir`.
pub const DETECTOR_MODEL_FILE: &str = "det_10g.onnx";
/// Recognizer model file inside `model_dir`.
pub const RECOGNIZER_MODEL_FILE: &str = "w600k_r50.onnx";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },
    #[error("invalid config file {path}: {source}")]
    Parse {
        path: String,
        source: toml::de::Error,
    },
}

/// Engine configuration: defaults, then an optional TOML file named by
/// `ROSTER_CONFIG`, then `ROSTER_*` environment variables.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Directory containing ONNX model files.
    pub model_dir: PathBuf,
    /// Path to the SQLite database file.
    pub db_path: PathBuf,
    /// Where enrollment thumbnails are written.
    pub thumbnail_dir: PathBuf,
    /// Detections below this score are dropped before embedding.
    pub frame_min_score: f32,
    /// Best-match similarity must exceed this to count as identified.
    pub match_threshold: f32,
    /// Enrollment is rejected when any enrolled face exceeds this similarity.
    pub duplicate_threshold: f32,
    /// Minimum detection score for an enrollment frame.
    pub enroll_min_score: f32,
    /// Pacing between frames in a scan loop.
    pub frame_interval_ms: u64,
    /// Consecutive still samples required before enrolling.
    pub stability_frames: usize,
    /// Allowed box movement between samples, as a fraction of box size.
    pub stability_tolerance: f32,
    /// Delay between stability samples.
    pub stability_sample_ms: u64,
    /// Give up waiting for a still face after this long.
    pub stability_timeout_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        let data_dir = default_data_dir();
        Self {
            model_dir: data_dir.join("models"),
            db_path: data_dir.join("roster.db"),
            thumbnail_dir: data_dir.join("img"),
            frame_min_score: 0.5,
            match_threshold: 0.25,
            duplicate_threshold: 0.25,
            enroll_min_score: 0.6,
            frame_interval_ms: 33,
            stability_frames: 3,
            stability_tolerance: 0.05,
            stability_sample_ms: 150,
            stability_timeout_secs: 5,
        }
    }
}

impl Config {
    /// Load configuration from the process environment.
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_with(|key| std::env::var(key).ok())
    }

    /// Load configuration reading variables through `lookup`.
    pub fn load_with<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = match lookup("ROSTER_CONFIG") {
            Some(path) if Path::new(&path).exists() => Self::from_file(Path::new(&path))?,
            Some(path) => {
                tracing::warn!(path = %path, "config file not found; using defaults");
                Self::default()
            }
            None => Self::default(),
        };
        config.apply_env(&lookup);
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        let config = Self::from_toml(&text).map_err(|source| ConfigError::Parse {
            path: path.display().to_string(),
            source,
        })?;
        tracing::debug!(path = %path.display(), "loaded config file");
        Ok(config)
    }

    /// Parse a TOML document; missing keys keep their defaults.
    pub fn from_toml(text: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(text)
    }

    fn apply_env<F>(&mut self, lookup: &F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("ROSTER_MODEL_DIR") {
            self.model_dir = PathBuf::from(v);
        }
        if let Some(v) = lookup("ROSTER_DB_PATH") {
            self.db_path = PathBuf::from(v);
        }
        if let Some(v) = lookup("ROSTER_THUMBNAIL_DIR") {
            self.thumbnail_dir = PathBuf::from(v);
        }
        env_parse(lookup, "ROSTER_FRAME_MIN_SCORE", &mut self.frame_min_score);
        env_parse(lookup, "ROSTER_MATCH_THRESHOLD", &mut self.match_threshold);
        env_parse(lookup, "ROSTER_DUPLICATE_THRESHOLD", &mut self.duplicate_threshold);
        env_parse(lookup, "ROSTER_ENROLL_MIN_SCORE", &mut self.enroll_min_score);
        env_parse(lookup, "ROSTER_FRAME_INTERVAL_MS", &mut self.frame_interval_ms);
        env_parse(lookup, "ROSTER_STABILITY_FRAMES", &mut self.stability_frames);
        env_parse(lookup, "ROSTER_STABILITY_TOLERANCE", &mut self.stability_tolerance);
        env_parse(lookup, "ROSTER_STABILITY_SAMPLE_MS", &mut self.stability_sample_ms);
        env_parse(lookup, "ROSTER_STABILITY_TIMEOUT_SECS", &mut self.stability_timeout_secs);
    }

    /// Path to the SCRFD detection model.
    pub fn detector_model_path(&self) -> PathBuf {
        self.model_dir.join(DETECTOR_MODEL_FILE)
    }

    /// Path to the ArcFace recognition model.
    pub fn recognizer_model_path(&self) -> PathBuf {
        self.model_dir.join(RECOGNIZER_MODEL_FILE)
    }

    pub fn frame_interval(&self) -> Duration {
        Duration::from_millis(self.frame_interval_ms)
    }

    pub fn stability_timeout(&self) -> Duration {
        Duration::from_secs(self.stability_timeout_secs)
    }
}

fn default_data_dir() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
            PathBuf::from(home).join(".local/share")
        })
        .join("roster")
}

/// Overwrite `target` when `key` is set and parses; a malformed value is
/// logged and ignored.
fn env_parse<T, F>(lookup: &F, key: &str, target: &mut T)
where
    T: FromStr,
    F: Fn(&str) -> Option<String>,
{
    let Some(raw) = lookup(key) else {
        return;
    };
    match raw.trim().parse() {
        Ok(value) => *target = value,
        Err(_) => tracing::warn!(key, value = %raw, "ignoring unparseable config value"),
    }
}
