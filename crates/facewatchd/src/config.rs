use facewatch_core::{DEFAULT_MATCH_TOLERANCE, DETECTOR_MODEL_FILE, RECOGNIZER_MODEL_FILE};
use facewatch_video::SourceSettings;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("cannot read config file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("invalid config file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
}

/// Daemon configuration.
///
/// Loaded from `FACEWATCH_*` environment variables, layered over an optional
/// TOML file named by `FACEWATCH_CONFIG`, layered over defaults.
#[derive(Debug, Clone)]
pub struct Config {
    /// Directory containing the ONNX model files.
    pub model_dir: PathBuf,
    /// Path to the SQLite database file.
    pub db_path: PathBuf,
    /// Directory that `video=` file references resolve against.
    pub upload_dir: PathBuf,
    /// HTTP bind address.
    pub listen: String,
    /// Default cooldown window between two events for one identity.
    pub cooldown_secs: u64,
    /// Default Euclidean distance below which a match is accepted.
    pub match_tolerance: f32,
    /// Device indices tried when the requested camera is unusable.
    pub device_attempts: u32,
    /// Per-read timeout for file and network streams.
    pub read_timeout_secs: u64,
    /// Transport open timeout for network streams.
    pub network_open_timeout_secs: u64,
    pub rtsp_tcp: bool,
    /// Font used for labels and placeholder text; the bundled font when unset.
    pub font_path: Option<PathBuf>,
    pub jpeg_quality: u8,
    /// Share one cooldown gate across all concurrently running pipelines.
    pub shared_cooldown: bool,
}

/// Optional keys of the TOML config file.
#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct FileConfig {
    model_dir: Option<PathBuf>,
    db_path: Option<PathBuf>,
    upload_dir: Option<PathBuf>,
    listen: Option<String>,
    cooldown_secs: Option<u64>,
    match_tolerance: Option<f32>,
    device_attempts: Option<u32>,
    read_timeout_secs: Option<u64>,
    network_open_timeout_secs: Option<u64>,
    rtsp_tcp: Option<bool>,
    font_path: Option<PathBuf>,
    jpeg_quality: Option<u8>,
    shared_cooldown: Option<bool>,
}

impl FileConfig {
    fn read(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }
}

/// `$XDG_DATA_HOME/facewatch`, falling back to `~/.local/share/facewatch`.
pub fn default_data_dir() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
            PathBuf::from(home).join(".local/share")
        })
        .join("facewatch")
}

impl Config {
    /// Load configuration from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        let file = match std::env::var_os("FACEWATCH_CONFIG") {
            Some(path) => FileConfig::read(Path::new(&path))?,
            None => FileConfig::default(),
        };
        Ok(Self::resolve(file, default_data_dir(), |key| std::env::var(key).ok()))
    }

    fn resolve(file: FileConfig, data_dir: PathBuf, env: impl Fn(&str) -> Option<String>) -> Self {
        let path = |key: &str, file_value: Option<PathBuf>, default: PathBuf| {
            env(key).map(PathBuf::from).or(file_value).unwrap_or(default)
        };

        Self {
            model_dir: path("FACEWATCH_MODEL_DIR", file.model_dir, data_dir.join("models")),
            db_path: path("FACEWATCH_DB_PATH", file.db_path, data_dir.join("facewatch.db")),
            upload_dir: path("FACEWATCH_UPLOAD_DIR", file.upload_dir, data_dir.join("uploads")),
            listen: env("FACEWATCH_LISTEN")
                .or(file.listen)
                .unwrap_or_else(|| "127.0.0.1:5000".to_string()),
            cooldown_secs: parsed(&env, "FACEWATCH_COOLDOWN_SECS", file.cooldown_secs, 30),
            match_tolerance: parsed(&env, "FACEWATCH_MATCH_TOLERANCE", file.match_tolerance, DEFAULT_MATCH_TOLERANCE),
            device_attempts: parsed(&env, "FACEWATCH_DEVICE_ATTEMPTS", file.device_attempts, 4),
            read_timeout_secs: parsed(&env, "FACEWATCH_READ_TIMEOUT_SECS", file.read_timeout_secs, 10),
            network_open_timeout_secs: parsed(
                &env,
                "FACEWATCH_NETWORK_OPEN_TIMEOUT_SECS",
                file.network_open_timeout_secs,
                10,
            ),
            rtsp_tcp: env_flag(&env, "FACEWATCH_RTSP_TCP")
                .or(file.rtsp_tcp)
                .unwrap_or(true),
            font_path: env("FACEWATCH_FONT_PATH").map(PathBuf::from).or(file.font_path),
            jpeg_quality: parsed(&env, "FACEWATCH_JPEG_QUALITY", file.jpeg_quality, 80),
            shared_cooldown: env_flag(&env, "FACEWATCH_SHARED_COOLDOWN")
                .or(file.shared_cooldown)
                .unwrap_or(false),
        }
    }

    /// Path to the SCRFD detection model.
    pub fn detector_model_path(&self) -> String {
        self.model_dir
            .join(DETECTOR_MODEL_FILE)
            .to_string_lossy()
            .into_owned()
    }

    /// Path to the ArcFace recognition model.
    pub fn recognizer_model_path(&self) -> String {
        self.model_dir
            .join(RECOGNIZER_MODEL_FILE)
            .to_string_lossy()
            .into_owned()
    }

    /// Defaults rooted at `data_dir`, ignoring the environment.
    #[cfg(test)]
    pub(crate) fn with_data_dir(data_dir: &Path) -> Self {
        Self::resolve(FileConfig::default(), data_dir.to_path_buf(), |_| None)
    }

    pub fn cooldown_window(&self) -> Duration {
        Duration::from_secs(self.cooldown_secs)
    }

    pub fn source_settings(&self) -> SourceSettings {
        SourceSettings {
            device_attempts: self.device_attempts,
            read_timeout: Duration::from_secs(self.read_timeout_secs),
            network_open_timeout: Duration::from_secs(self.network_open_timeout_secs),
            rtsp_tcp: self.rtsp_tcp,
            ..SourceSettings::default()
        }
    }
}

/// Env value if it parses, else the file value, else the default. An
/// unparsable env value is ignored with a warning.
fn parsed<T: std::str::FromStr>(env: &impl Fn(&str) -> Option<String>, key: &str, file: Option<T>, default: T) -> T {
    let from_env = env(key).and_then(|v| match v.trim().parse() {
        Ok(parsed) => Some(parsed),
        Err(_) => {
            tracing::warn!(key, value = %v, "ignoring unparsable config value");
            None
        }
    });
    from_env.or(file).unwrap_or(default)
}

/// `0`, `false`, `no`, `off` are false; anything else set is true.
fn env_flag(env: &impl Fn(&str) -> Option<String>, key: &str) -> Option<bool> {
    env(key).map(|v| !matches!(v.trim().to_ascii_lowercase().as_str(), "0" | "false" | "no" | "off"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env_of(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = Config::resolve(FileConfig::default(), PathBuf::from("/data/fw"), env_of(&[]));
        assert_eq!(config.db_path, PathBuf::from("/data/fw/facewatch.db"));
        assert_eq!(config.listen, "127.0.0.1:5000");
        assert_eq!(config.cooldown_secs, 30);
        assert_eq!(config.match_tolerance, 1.10);
        assert_eq!(config.device_attempts, 4);
        assert_eq!(config.font_path, None);
        assert!(config.rtsp_tcp);
        assert!(!config.shared_cooldown);
        assert_eq!(config.detector_model_path(), "/data/fw/models/det_10g.onnx");
        assert_eq!(config.recognizer_model_path(), "/data/fw/models/w600k_r50.onnx");
    }

    #[test]
    fn test_env_beats_file_beats_default() {
        let file: FileConfig = toml::from_str(
            r#"
            cooldown_secs = 60
            match_tolerance = 0.6
            listen = "0.0.0.0:8080"
            rtsp_tcp = false
            "#,
        )
        .unwrap();
        let env = env_of(&[("FACEWATCH_COOLDOWN_SECS", "5"), ("FACEWATCH_SHARED_COOLDOWN", "1")]);
        let config = Config::resolve(file, PathBuf::from("/d"), env);

        assert_eq!(config.cooldown_secs, 5);
        assert_eq!(config.match_tolerance, 0.6);
        assert_eq!(config.listen, "0.0.0.0:8080");
        assert!(!config.rtsp_tcp);
        assert!(config.shared_cooldown);
        assert_eq!(config.jpeg_quality, 80);
    }

    #[test]
    fn test_bad_env_value_falls_through() {
        let env = env_of(&[("FACEWATCH_DEVICE_ATTEMPTS", "many"), ("FACEWATCH_RTSP_TCP", "off")]);
        let config = Config::resolve(FileConfig::default(), PathBuf::from("/d"), env);
        assert_eq!(config.device_attempts, 4);
        assert!(!config.rtsp_tcp);
    }

    #[test]
    fn test_unknown_file_key_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("facewatch.toml");
        std::fs::write(&path, "cooldown = 10\n").unwrap();
        assert!(matches!(FileConfig::read(&path), Err(ConfigError::Parse { .. })));
        assert!(matches!(
            FileConfig::read(&dir.path().join("missing.toml")),
            Err(ConfigError::Read { .. })
        ));
    }

    #[test]
    fn test_source_settings() {
        let env = env_of(&[("FACEWATCH_READ_TIMEOUT_SECS", "3"), ("FACEWATCH_DEVICE_ATTEMPTS", "2")]);
        let settings = Config::resolve(FileConfig::default(), PathBuf::from("/d"), env).source_settings();
        assert_eq!(settings.read_timeout, Duration::from_secs(3));
        assert_eq!(settings.device_attempts, 2);
        assert_eq!(settings.ffmpeg_bin, "ffmpeg");
    }
}
