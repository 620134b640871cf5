use std::{fmt::Display, str::FromStr, time::Duration};
use tracing::Level;
use tutor_core::{
    VadConfig, connection::ReconnectPolicy, protocol::DifficultyLevel, speech::SpeechSettings,
};

/// A custom error type for configuration loading failures.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing environment variable: {0}")]
    MissingVar(String),
    #[error("Invalid value for environment variable {0}: {1}")]
    InvalidValue(String, String),
}

/// Where teacher speech comes from.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SpeechBackendKind {
    /// A voice engine installed on this machine.
    Local,
    /// An HTTP synthesis service, played through `AUDIO_PLAYER`.
    Remote,
    /// Audio the backend streams over the socket, played through `AUDIO_PLAYER`.
    Server,
}

/// Holds all configuration loaded from the environment at startup.
#[derive(Clone, Debug)]
pub struct Config {
    pub api_base: String,
    pub reconnect: ReconnectPolicy,
    pub vad: VadConfig,
    pub speech_backend: SpeechBackendKind,
    pub speech: SpeechSettings,
    pub tts_api_url: Option<String>,
    pub tts_api_key: Option<String>,
    pub audio_player: String,
    pub default_difficulty: Option<DifficultyLevel>,
    pub log_level: Level,
}

/// Reads `name`, falling back to `default` when unset.
fn parse_var<T>(name: &str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: Display,
{
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse::<T>()
            .map_err(|e| ConfigError::InvalidValue(name.to_string(), e.to_string())),
        Err(_) => Ok(default),
    }
}

impl Config {
    /// Loads configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        // Only load from .env in non-test mode to avoid contamination
        if !cfg!(test) {
            dotenvy::dotenv().ok();
        }

        let api_base = std::env::var("TUTOR_API_BASE")
            .unwrap_or_else(|_| "http://localhost:8000".to_string());
        if !(api_base.starts_with("http://") || api_base.starts_with("https://")) {
            return Err(ConfigError::InvalidValue(
                "TUTOR_API_BASE".to_string(),
                format!("'{}' must start with http:// or https://", api_base),
            ));
        }

        let defaults = ReconnectPolicy::default();
        let reconnect = ReconnectPolicy {
            max_attempts: parse_var("RECONNECT_MAX_ATTEMPTS", defaults.max_attempts)?,
            delay: Duration::from_millis(parse_var(
                "RECONNECT_DELAY_MS",
                defaults.delay.as_millis() as u64,
            )?),
        };

        let vad_defaults = VadConfig::default();
        let vad = VadConfig {
            threshold: parse_var("VAD_THRESHOLD", vad_defaults.threshold)?,
            min_confirmed_frames: parse_var(
                "VAD_MIN_CONFIRMED_FRAMES",
                vad_defaults.min_confirmed_frames,
            )?,
            silence_duration: Duration::from_millis(parse_var(
                "VAD_SILENCE_MS",
                vad_defaults.silence_duration.as_millis() as u64,
            )?),
            frame_size: parse_var("VAD_FRAME_SIZE", vad_defaults.frame_size)?,
            sample_rate: parse_var("AUDIO_SAMPLE_RATE", vad_defaults.sample_rate)?,
        };
        if vad.frame_size == 0 || vad.sample_rate == 0 {
            return Err(ConfigError::InvalidValue(
                "VAD_FRAME_SIZE/AUDIO_SAMPLE_RATE".to_string(),
                "must be greater than zero".to_string(),
            ));
        }

        let backend_str = std::env::var("SPEECH_BACKEND").unwrap_or_else(|_| "local".to_string());
        let speech_backend = match backend_str.to_lowercase().as_str() {
            "local" => SpeechBackendKind::Local,
            "remote" => SpeechBackendKind::Remote,
            "server" => SpeechBackendKind::Server,
            other => {
                return Err(ConfigError::InvalidValue(
                    "SPEECH_BACKEND".to_string(),
                    format!("'{}' is not one of local, remote, server", other),
                ));
            }
        };

        let speech_defaults = SpeechSettings::default();
        let speech = SpeechSettings {
            voice: std::env::var("SPEECH_VOICE").ok().filter(|v| !v.is_empty()),
            language: std::env::var("SPEECH_LANGUAGE").unwrap_or(speech_defaults.language),
            rate: parse_var("SPEECH_RATE", speech_defaults.rate)?,
            pitch: parse_var("SPEECH_PITCH", speech_defaults.pitch)?,
            volume: parse_var("SPEECH_VOLUME", speech_defaults.volume)?,
        };

        let tts_api_url = std::env::var("TTS_API_URL").ok();
        let tts_api_key = std::env::var("TTS_API_KEY").ok();
        if speech_backend == SpeechBackendKind::Remote && tts_api_url.is_none() {
            return Err(ConfigError::MissingVar(
                "TTS_API_URL must be set for 'remote' speech backend".to_string(),
            ));
        }

        let audio_player = std::env::var("AUDIO_PLAYER").unwrap_or_else(|_| "aplay -q".to_string());

        let default_difficulty = match std::env::var("DEFAULT_DIFFICULTY") {
            Ok(raw) => Some(
                raw.trim()
                    .parse::<u8>()
                    .ok()
                    .and_then(DifficultyLevel::new)
                    .ok_or_else(|| {
                        ConfigError::InvalidValue(
                            "DEFAULT_DIFFICULTY".to_string(),
                            format!("'{}' is not a level between 1 and 5", raw),
                        )
                    })?,
            ),
            Err(_) => None,
        };

        let log_level_str = std::env::var("RUST_LOG").unwrap_or_else(|_| "INFO".to_string());
        let log_level = log_level_str.parse::<Level>().map_err(|_| {
            ConfigError::InvalidValue(
                "RUST_LOG".to_string(),
                format!("'{}' is not a valid log level", log_level_str),
            )
        })?;

        Ok(Self {
            api_base,
            reconnect,
            vad,
            speech_backend,
            speech,
            tts_api_url,
            tts_api_key,
            audio_player,
            default_difficulty,
            log_level,
        })
    }
}
