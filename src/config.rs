use secrecy::{ExposeSecret, SecretBox};
use std::env;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

use crate::language::Language;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Invalid value for {var}: {reason}")]
    InvalidValue { var: String, reason: String },
    #[error("Missing required setting: {0}")]
    Missing(String),
}

/// Thresholds for the silence-based auto-stop heuristic.
///
/// Levels are normalized loudness in `[0, 1]` as produced by the audio level sampler.
#[derive(Debug, Clone)]
pub struct SilenceConfig {
    /// A sample above this marks the utterance as containing speech
    pub speech_threshold: f32,
    /// A sample below this (after speech) starts the silence timer
    pub silence_threshold: f32,
    /// Continuous silence needed to end the utterance
    pub silence_duration: Duration,
    /// Hard bound for an utterance in which no speech was ever detected
    pub fallback_timeout: Duration,
    /// Quiet-microphone detector kicks in after this much time without speech
    pub variance_grace: Duration,
    /// Bin spread (max - min) that counts as speech for quiet microphones.
    /// Empirical; validate per kiosk hardware.
    pub variance_threshold: f32,
}

impl Default for SilenceConfig {
    fn default() -> Self {
        Self {
            speech_threshold: 0.12,
            silence_threshold: 0.06,
            silence_duration: Duration::from_millis(2000),
            fallback_timeout: Duration::from_millis(10_000),
            variance_grace: Duration::from_millis(4000),
            variance_threshold: 0.04,
        }
    }
}

/// Audio level sampler settings.
#[derive(Debug, Clone)]
pub struct SamplerConfig {
    /// FFT window length in samples (power of two)
    pub fft_size: usize,
    /// Minimum interval between emitted level samples
    pub interval: Duration,
    /// Temporal smoothing of the frequency buffer (0 = none)
    pub smoothing: f32,
    pub min_decibels: f32,
    pub max_decibels: f32,
}

impl Default for SamplerConfig {
    fn default() -> Self {
        Self {
            fft_size: 512,
            interval: Duration::from_millis(50),
            smoothing: 0.8,
            min_decibels: -100.0,
            max_decibels: -30.0,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ListenerConfig {
    /// Accepted wake phrases, matched case-insensitively
    pub wake_phrases: Vec<String>,
    /// Fixed delay before restarting an engine that ended benignly
    pub restart_delay: Duration,
    /// Fixed delay before restarting an engine that ended with an error
    pub error_restart_delay: Duration,
    /// How long a stopped listener may take to report that it ended
    pub teardown_timeout: Duration,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            wake_phrases: vec![
                "hey kisaan".to_string(),
                "hello kisaan".to_string(),
                "hey mira".to_string(),
                "hi mira".to_string(),
                "hello mira".to_string(),
            ],
            restart_delay: Duration::from_millis(300),
            error_restart_delay: Duration::from_millis(1000),
            teardown_timeout: Duration::from_millis(1500),
        }
    }
}

#[derive(Debug, Clone)]
pub struct EchoConfig {
    /// Wait after the avatar stops speaking before listening again
    pub settle_delay: Duration,
}

impl Default for EchoConfig {
    fn default() -> Self {
        Self {
            settle_delay: Duration::from_millis(500),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Backend-issued session id; generated when absent
    pub session_id: Option<String>,
    pub language: Language,
    /// Idle conversation is reset to wake-word mode after this long
    pub inactivity_timeout: Duration,
    /// Re-arm the microphone if no reply arrives within this long
    pub reply_timeout: Duration,
    /// After a reply arrives, listen again unless the avatar starts speaking within this long
    pub reply_grace: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            session_id: None,
            language: Language::default(),
            inactivity_timeout: Duration::from_secs(120),
            reply_timeout: Duration::from_secs(20),
            reply_grace: Duration::from_secs(3),
        }
    }
}

#[derive(Debug)]
pub struct TransportConfig {
    /// Stream recognition replaces the listeners for the whole session when set
    pub enabled: bool,
    pub url: String,
    pub token: Option<SecretBox<String>>,
    pub max_reconnect_attempts: u32,
    pub base_delay: Duration,
    /// Duration of audio carried by one `audio` message
    pub chunk_duration: Duration,
    pub sample_rate: u32,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            url: "ws://localhost:8000/ws/voice".to_string(),
            token: None,
            max_reconnect_attempts: 5,
            base_delay: Duration::from_secs(2),
            chunk_duration: Duration::from_millis(100),
            sample_rate: 16_000,
        }
    }
}

impl Clone for TransportConfig {
    fn clone(&self) -> Self {
        Self {
            enabled: self.enabled,
            url: self.url.clone(),
            token: self
                .token
                .as_ref()
                .map(|token| SecretBox::new(Box::new(token.expose_secret().clone()))),
            max_reconnect_attempts: self.max_reconnect_attempts,
            base_delay: self.base_delay,
            chunk_duration: self.chunk_duration,
            sample_rate: self.sample_rate,
        }
    }
}

impl TransportConfig {
    /// Bearer token for the stream server (use only when connecting)
    pub fn token(&self) -> Option<&str> {
        self.token.as_ref().map(|token| token.expose_secret().as_str())
    }

    /// Samples carried by one audio message
    pub fn chunk_samples(&self) -> usize {
        (self.sample_rate as u128 * self.chunk_duration.as_millis() / 1000) as usize
    }
}

/// Complete controller configuration
#[derive(Debug, Clone, Default)]
pub struct VoiceConfig {
    pub silence: SilenceConfig,
    pub sampler: SamplerConfig,
    pub listener: ListenerConfig,
    pub echo: EchoConfig,
    pub session: SessionConfig,
    pub transport: TransportConfig,
}

impl VoiceConfig {
    /// Defaults overridden by `KIOSK_*` environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        // Load .env file if it exists (for development)
        dotenvy::dotenv().ok();

        let mut config = Self::default();

        if let Some(url) = env_string("KIOSK_STREAM_URL") {
            url::Url::parse(&url).map_err(|e| ConfigError::InvalidValue {
                var: "KIOSK_STREAM_URL".to_string(),
                reason: e.to_string(),
            })?;
            config.transport.url = url;
        }
        if let Some(token) = env_string("KIOSK_STREAM_TOKEN") {
            config.transport.token = Some(SecretBox::new(Box::new(token)));
        }
        if let Some(enabled) = env_parse::<bool>("KIOSK_USE_STREAM")? {
            config.transport.enabled = enabled;
        }
        if let Some(value) = env_string("KIOSK_LANGUAGE") {
            config.session.language =
                Language::parse(&value).ok_or_else(|| ConfigError::InvalidValue {
                    var: "KIOSK_LANGUAGE".to_string(),
                    reason: format!("unsupported language '{}'", value),
                })?;
        }
        if let Some(phrases) = env_string("KIOSK_WAKE_PHRASES") {
            let phrases: Vec<String> = phrases
                .split(',')
                .map(|p| p.trim().to_lowercase())
                .filter(|p| !p.is_empty())
                .collect();
            if phrases.is_empty() {
                return Err(ConfigError::InvalidValue {
                    var: "KIOSK_WAKE_PHRASES".to_string(),
                    reason: "at least one wake phrase is required".to_string(),
                });
            }
            config.listener.wake_phrases = phrases;
        }
        if let Some(v) = env_parse::<f32>("KIOSK_SPEECH_THRESHOLD")? {
            config.silence.speech_threshold = unit_interval("KIOSK_SPEECH_THRESHOLD", v)?;
        }
        if let Some(v) = env_parse::<f32>("KIOSK_SILENCE_THRESHOLD")? {
            config.silence.silence_threshold = unit_interval("KIOSK_SILENCE_THRESHOLD", v)?;
        }
        if let Some(v) = env_parse::<f32>("KIOSK_VARIANCE_THRESHOLD")? {
            config.silence.variance_threshold = unit_interval("KIOSK_VARIANCE_THRESHOLD", v)?;
        }
        if let Some(ms) = env_parse::<u64>("KIOSK_SILENCE_MS")? {
            config.silence.silence_duration = Duration::from_millis(ms);
        }
        if let Some(ms) = env_parse::<u64>("KIOSK_FALLBACK_MS")? {
            config.silence.fallback_timeout = Duration::from_millis(ms);
        }
        if let Some(secs) = env_parse::<u64>("KIOSK_SESSION_TIMEOUT_SECS")? {
            config.session.inactivity_timeout = Duration::from_secs(secs);
        }
        if let Some(ms) = env_parse::<u64>("KIOSK_REPLY_GRACE_MS")? {
            config.session.reply_grace = Duration::from_millis(ms);
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.silence.silence_threshold > self.silence.speech_threshold {
            return Err(ConfigError::InvalidValue {
                var: "silence_threshold".to_string(),
                reason: "must not exceed speech_threshold".to_string(),
            });
        }
        if !self.sampler.fft_size.is_power_of_two() {
            return Err(ConfigError::InvalidValue {
                var: "fft_size".to_string(),
                reason: "must be a power of two".to_string(),
            });
        }
        if self.listener.wake_phrases.is_empty() {
            return Err(ConfigError::Missing("wake_phrases".to_string()));
        }
        Ok(())
    }
}

fn env_string(var: &str) -> Option<String> {
    env::var(var).ok().filter(|value| !value.trim().is_empty())
}

fn env_parse<T>(var: &str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match env_string(var) {
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|e| ConfigError::InvalidValue {
                var: var.to_string(),
                reason: e.to_string(),
            }),
        None => Ok(None),
    }
}

fn unit_interval(var: &str, value: f32) -> Result<f32, ConfigError> {
    if (0.0..=1.0).contains(&value) {
        Ok(value)
    } else {
        Err(ConfigError::InvalidValue {
            var: var.to_string(),
            reason: format!("{} is outside [0, 1]", value),
        })
    }
}

/// Load configuration with helpful error messages for development
pub fn load_config() -> Result<VoiceConfig, ConfigError> {
    match VoiceConfig::from_env() {
        Ok(config) => {
            log::info!(
                "Loaded voice configuration (stream transport: {}, language: {})",
                config.transport.enabled,
                config.session.language
            );
            Ok(config)
        }
        Err(ConfigError::InvalidValue { var, reason }) => {
            log::error!("Invalid value for {}: {}", var, reason);
            log::error!("Fix or remove {} in your environment or .env file", var);
            Err(ConfigError::InvalidValue { var, reason })
        }
        Err(e) => {
            log::error!("Configuration error: {}", e);
            Err(e)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_consistent() {
        let config = VoiceConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.echo.settle_delay, Duration::from_millis(500));
        assert_eq!(config.transport.max_reconnect_attempts, 5);
        assert_eq!(config.transport.base_delay, Duration::from_secs(2));
        assert_eq!(config.transport.chunk_samples(), 1600);
    }

    #[test]
    fn test_validation_rejects_inverted_thresholds() {
        let mut config = VoiceConfig::default();
        config.silence.silence_threshold = 0.5;
        config.silence.speech_threshold = 0.1;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_unit_interval() {
        assert!(unit_interval("X", 0.3).is_ok());
        assert!(unit_interval("X", 1.5).is_err());
    }

    #[test]
    fn test_token_is_cloned() {
        let mut transport = TransportConfig::default();
        transport.token = Some(SecretBox::new(Box::new("secret-token".to_string())));
        let cloned = transport.clone();
        assert_eq!(cloned.token(), Some("secret-token"));
    }
}
