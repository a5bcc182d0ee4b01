//! # Configuration Management
//!
//! Loads application configuration from multiple sources:
//! - Built-in defaults (`AppConfig::default()`)
//! - An optional `config.toml` next to the binary
//! - Environment variables prefixed with `APP_` (nested keys use `__`,
//!   e.g. `APP_LIVE__MODEL`)
//! - Deployment-style overrides: `HOST`, `PORT`, and the live credential from
//!   `GEMINI_API_KEY` or `API_KEY`
//!
//! ## Configuration Priority (highest to lowest):
//! 1. Special environment variables (`HOST`, `PORT`, `GEMINI_API_KEY`, `API_KEY`)
//! 2. `APP_` environment variables
//! 3. `config.toml`
//! 4. Defaults
//!
//! The API credential is optional at load time. A missing credential is only an
//! error when a call is started, so the HTTP API stays usable without it.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::env;

/// Main application configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub live: LiveConfig,
    pub audio: AudioConfig,
    pub evaluation: EvaluationConfig,
    pub performance: PerformanceConfig,
}

/// HTTP server bind settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

/// Remote live agent session settings.
///
/// ## Fields:
/// - `endpoint`: WebSocket URL of the bidirectional live session service
/// - `model`: Native-audio model used for the simulated caller
/// - `voice`: Prebuilt voice name for synthesized speech
/// - `api_key`: Credential appended to the endpoint; never echoed by the API
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LiveConfig {
    pub endpoint: String,
    pub model: String,
    pub voice: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
}

impl LiveConfig {
    /// Returns the credential if one is configured and non-blank.
    pub fn api_key(&self) -> Option<&str> {
        self.api_key
            .as_deref()
            .map(str::trim)
            .filter(|key| !key.is_empty())
    }
}

/// Audio pipeline settings.
///
/// ## Fields:
/// - `capture_sample_rate`: Microphone rate sent to the agent (16 kHz)
/// - `playback_sample_rate`: Rate of synthesized agent audio (24 kHz)
/// - `frame_samples`: Samples per outbound capture frame (4096)
/// - `capture_queue_depth`: Frames buffered between the device thread and the encoder
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AudioConfig {
    pub capture_sample_rate: u32,
    pub playback_sample_rate: u32,
    pub frame_samples: usize,
    pub capture_queue_depth: usize,
}

/// Post-call evaluation service settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvaluationConfig {
    pub endpoint: String,
    pub model: String,
    pub timeout_secs: u64,
}

/// Connection limits for the host surface.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PerformanceConfig {
    pub max_concurrent_sessions: usize,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: "127.0.0.1".to_string(),
                port: 8080,
            },
            live: LiveConfig {
                endpoint: "wss://generativelanguage.googleapis.com/ws/google.ai.generativelanguage.v1beta.GenerativeService.BidiGenerateContent".to_string(),
                model: "gemini-2.5-flash-native-audio-preview-09-2025".to_string(),
                voice: "Zephyr".to_string(),
                api_key: None,
            },
            audio: AudioConfig {
                capture_sample_rate: 16000,
                playback_sample_rate: 24000,
                frame_samples: 4096,
                capture_queue_depth: 32,
            },
            evaluation: EvaluationConfig {
                endpoint: "https://generativelanguage.googleapis.com/v1beta".to_string(),
                model: "gemini-2.5-pro".to_string(),
                timeout_secs: 60,
            },
            performance: PerformanceConfig {
                max_concurrent_sessions: 4,
            },
        }
    }
}

impl AppConfig {
    /// Load configuration from defaults, `config.toml` and the environment.
    pub fn load() -> Result<Self> {
        let mut settings = config::Config::builder()
            .add_source(config::Config::try_from(&AppConfig::default())?)
            .add_source(config::File::with_name("config").required(false))
            .add_source(config::Environment::with_prefix("APP").separator("__"));

        if let Ok(host) = env::var("HOST") {
            settings = settings.set_override("server.host", host)?;
        }

        if let Ok(port) = env::var("PORT") {
            settings = settings.set_override("server.port", port)?;
        }

        if let Some(key) = env::var("GEMINI_API_KEY").ok().or_else(|| env::var("API_KEY").ok()) {
            settings = settings.set_override("live.api_key", key)?;
        }

        let config = settings.build()?.try_deserialize()?;
        Ok(config)
    }

    /// Validate that the configuration values make sense.
    pub fn validate(&self) -> Result<()> {
        if self.server.port == 0 {
            return Err(anyhow::anyhow!("Server port cannot be 0"));
        }

        if !(self.live.endpoint.starts_with("ws://") || self.live.endpoint.starts_with("wss://")) {
            return Err(anyhow::anyhow!("Live endpoint must be a ws:// or wss:// URL"));
        }

        if self.live.model.trim().is_empty() {
            return Err(anyhow::anyhow!("Live model cannot be empty"));
        }

        if self.audio.capture_sample_rate == 0 || self.audio.playback_sample_rate == 0 {
            return Err(anyhow::anyhow!("Audio sample rates must be greater than 0"));
        }

        if self.audio.frame_samples == 0 {
            return Err(anyhow::anyhow!("Frame size must be greater than 0"));
        }

        if self.audio.capture_queue_depth == 0 {
            return Err(anyhow::anyhow!("Capture queue depth must be greater than 0"));
        }

        if !(self.evaluation.endpoint.starts_with("http://") || self.evaluation.endpoint.starts_with("https://")) {
            return Err(anyhow::anyhow!("Evaluation endpoint must be an http(s) URL"));
        }

        if self.performance.max_concurrent_sessions == 0 {
            return Err(anyhow::anyhow!("Max concurrent sessions must be greater than 0"));
        }

        Ok(())
    }

    /// Apply a partial JSON update (used by `PUT /api/v1/config`).
    ///
    /// Only the fields present in the JSON are changed. The live credential
    /// cannot be changed through this path.
    pub fn update_from_json(&mut self, json_str: &str) -> Result<()> {
        let partial: serde_json::Value = serde_json::from_str(json_str)?;

        if let Some(server) = partial.get("server") {
            if let Some(host) = server.get("host").and_then(|v| v.as_str()) {
                self.server.host = host.to_string();
            }
            if let Some(port) = server.get("port").and_then(|v| v.as_u64()) {
                self.server.port = u16::try_from(port)
                    .map_err(|_| anyhow::anyhow!("Server port out of range: {}", port))?;
            }
        }

        if let Some(live) = partial.get("live") {
            if let Some(endpoint) = live.get("endpoint").and_then(|v| v.as_str()) {
                self.live.endpoint = endpoint.to_string();
            }
            if let Some(model) = live.get("model").and_then(|v| v.as_str()) {
                self.live.model = model.to_string();
            }
            if let Some(voice) = live.get("voice").and_then(|v| v.as_str()) {
                self.live.voice = voice.to_string();
            }
        }

        if let Some(audio) = partial.get("audio") {
            if let Some(frames) = audio.get("frame_samples").and_then(|v| v.as_u64()) {
                self.audio.frame_samples = frames as usize;
            }
            if let Some(depth) = audio.get("capture_queue_depth").and_then(|v| v.as_u64()) {
                self.audio.capture_queue_depth = depth as usize;
            }
        }

        if let Some(evaluation) = partial.get("evaluation") {
            if let Some(model) = evaluation.get("model").and_then(|v| v.as_str()) {
                self.evaluation.model = model.to_string();
            }
            if let Some(timeout) = evaluation.get("timeout_secs").and_then(|v| v.as_u64()) {
                self.evaluation.timeout_secs = timeout;
            }
        }

        if let Some(performance) = partial.get("performance") {
            if let Some(sessions) = performance.get("max_concurrent_sessions").and_then(|v| v.as_u64()) {
                self.performance.max_concurrent_sessions = sessions as usize;
            }
        }

        self.validate()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = AppConfig::default();
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.audio.capture_sample_rate, 16000);
        assert_eq!(config.audio.playback_sample_rate, 24000);
        assert_eq!(config.audio.frame_samples, 4096);
        assert!(config.live.api_key().is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation() {
        let mut config = AppConfig::default();
        config.audio.frame_samples = 0;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.live.endpoint = "https://not-a-websocket".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_blank_api_key_counts_as_missing() {
        let mut config = AppConfig::default();
        config.live.api_key = Some("   ".to_string());
        assert!(config.live.api_key().is_none());

        config.live.api_key = Some(" abc ".to_string());
        assert_eq!(config.live.api_key(), Some("abc"));
    }

    #[test]
    fn test_config_update() {
        let mut config = AppConfig::default();
        let json = r#"{"server": {"port": 9090}, "live": {"voice": "Puck", "api_key": "ignored"}}"#;
        assert!(config.update_from_json(json).is_ok());
        assert_eq!(config.server.port, 9090);
        assert_eq!(config.live.voice, "Puck");
        assert!(config.live.api_key.is_none());
        assert_eq!(config.server.host, "127.0.0.1");
    }

    #[test]
    fn test_config_update_rejects_invalid_values() {
        let mut config = AppConfig::default();
        assert!(config.update_from_json(r#"{"server": {"port": 70000}}"#).is_err());
        assert!(config.update_from_json(r#"{"audio": {"frame_samples": 0}}"#).is_err());
    }
}
