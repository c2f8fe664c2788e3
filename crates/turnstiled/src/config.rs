use std::path::PathBuf;
use std::time::Duration;

/// Daemon configuration, loaded from environment variables.
pub struct Config {
    /// HTTP listen address (default: 127.0.0.1:8000).
    pub bind: String,
    /// Gallery JSON file (name → reference embedding).
    pub gallery_path: PathBuf,
    /// Event log JSON file.
    pub events_path: PathBuf,
    /// Directory containing ONNX model files.
    pub model_dir: PathBuf,
    /// Minimum spacing between two logged events for the same person and camera.
    pub debounce_window: Duration,
    /// Cosine similarity threshold used by `/match` when `thr` is omitted.
    pub match_threshold: f32,
    /// Camera name used when a request does not name one.
    pub default_camera: String,
    /// Upper bound on a single face extraction, including queueing.
    pub extract_timeout: Duration,
    /// Request body limit for uploads.
    pub max_upload_bytes: usize,
}

impl Config {
    /// Load configuration from `TURNSTILE_*` environment variables with defaults.
    pub fn from_env() -> Self {
        let data_dir = std::env::var("TURNSTILE_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("data"));

        let gallery_path = std::env::var("TURNSTILE_GALLERY_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| data_dir.join("embeddings/gallery.json"));

        let events_path = std::env::var("TURNSTILE_EVENTS_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| data_dir.join("events.json"));

        let model_dir = std::env::var("TURNSTILE_MODEL_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| turnstile_core::default_model_dir());

        Self {
            bind: std::env::var("TURNSTILE_BIND").unwrap_or_else(|_| "127.0.0.1:8000".to_string()),
            gallery_path,
            events_path,
            model_dir,
            debounce_window: env_secs("TURNSTILE_DEBOUNCE_SECS", Duration::from_secs(30)),
            match_threshold: env_f32("TURNSTILE_MATCH_THRESHOLD", 0.45),
            default_camera: std::env::var("TURNSTILE_DEFAULT_CAMERA")
                .unwrap_or_else(|_| "simulator".to_string()),
            extract_timeout: env_secs("TURNSTILE_EXTRACT_TIMEOUT_SECS", Duration::from_secs(20)),
            max_upload_bytes: env_megabytes("TURNSTILE_MAX_UPLOAD_MB", 16),
        }
    }

    /// Path to the SCRFD detection model.
    pub fn detector_model_path(&self) -> PathBuf {
        self.model_dir.join(turnstile_core::DETECTOR_MODEL_FILE)
    }

    /// Path to the ArcFace recognition model.
    pub fn recognizer_model_path(&self) -> PathBuf {
        self.model_dir.join(turnstile_core::RECOGNIZER_MODEL_FILE)
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.trim().parse().ok())
}

fn env_f32(key: &str, default: f32) -> f32 {
    env_parse::<f32>(key).filter(|v| v.is_finite()).unwrap_or(default)
}

/// Seconds as a `Duration`. Negative, non-finite, and out-of-range values
/// fall back to `default`.
fn env_secs(key: &str, default: Duration) -> Duration {
    env_parse::<f64>(key)
        .and_then(|secs| Duration::try_from_secs_f64(secs).ok())
        .unwrap_or(default)
}

/// Megabytes as a byte count, falling back to `default_mb` on overflow.
fn env_megabytes(key: &str, default_mb: usize) -> usize {
    env_parse::<usize>(key)
        .and_then(|mb| mb.checked_mul(1024 * 1024))
        .unwrap_or(default_mb * 1024 * 1024)
}
