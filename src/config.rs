//! # Configuration Management
//!
//! This module handles loading and managing application configuration from multiple sources:
//! - TOML configuration files (config.toml)
//! - Environment variables (with APP_ prefix)
//! - Default values (built into the code)
//!
//! ## Configuration Priority (highest to lowest):
//! 1. Special deployment variables (HOST, PORT, API_KEY)
//! 2. Environment variables (APP_SERVER__PORT, APP_LIVE__VOICE_NAME, etc.)
//! 3. Configuration file (config.toml)
//! 4. Default values (defined in the Default impl)
//!
//! ## Sections:
//! - **server**: where the control API listens
//! - **live**: what the remote speech session is asked for (model, voice, instruction)
//! - **audio**: sample rates, frame size and the playback timing knobs

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::env;

/// Main application configuration that contains all settings.
///
/// ## Why separate config structs:
/// The live session only ever sees `LiveConfig` and `AudioSettings`; they are
/// passed into the session manager explicitly instead of being read from
/// global state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub live: LiveConfig,
    pub audio: AudioSettings,
}

/// Server-specific configuration settings.
///
/// ## Common values:
/// - `host = "127.0.0.1"`: Only accept connections from localhost (development)
/// - `host = "0.0.0.0"`: Accept connections from any IP address (production)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

/// Remote speech session settings.
///
/// ## Fields:
/// - `endpoint`: WebSocket URL of the bidirectional streaming service
/// - `model`: model identifier sent in the setup message
/// - `voice_name`: requested synthetic voice (validated against an allow-list at connect time)
/// - `system_instruction`: fully composed behaviour instruction, opaque to this service
/// - `api_key`: credential appended to the endpoint; never echoed back by the API
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LiveConfig {
    pub endpoint: String,
    pub model: String,
    pub voice_name: String,
    pub system_instruction: String,
    pub api_key: Option<String>,
}

/// Audio pipeline settings.
///
/// ## Timing knobs:
/// `jitter_buffer_secs` and `underrun_epsilon_secs` were tuned by ear rather
/// than derived; treat them as starting points and adjust against real
/// network conditions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AudioSettings {
    /// Capture / outbound sample rate in Hz
    pub input_sample_rate: u32,
    /// Rate of the synthesized audio the remote session streams back
    pub output_sample_rate: u32,
    /// Samples per outbound frame
    pub frame_size: usize,
    /// Lead added before the first chunk (and after an interruption)
    pub jitter_buffer_secs: f64,
    /// Lead used when playback fell behind real time
    pub underrun_epsilon_secs: f64,
    /// Analyser FFT size used by the level monitor
    pub fft_size: usize,
    /// Analyser smoothing between consecutive level samples (0.0 - 1.0)
    pub smoothing_time_constant: f32,
    /// Level monitor tick in milliseconds
    pub level_interval_ms: u64,
    /// How often the UI WebSocket receives a snapshot
    pub snapshot_interval_ms: u64,
    /// Audio backend preference: "auto", "native" or "headless"
    pub backend: String,
    /// Optional WAV file used as the microphone by the headless backend
    pub input_wav_path: Option<String>,
}

impl Default for AudioSettings {
    fn default() -> Self {
        Self {
            input_sample_rate: 16_000,
            output_sample_rate: 24_000,
            frame_size: 4096,
            jitter_buffer_secs: 0.35,
            underrun_epsilon_secs: 0.05,
            fft_size: 256,
            smoothing_time_constant: 0.8,
            level_interval_ms: 16,     // roughly one animation frame
            snapshot_interval_ms: 50,
            backend: "auto".to_string(),
            input_wav_path: None,
        }
    }
}

impl Default for LiveConfig {
    fn default() -> Self {
        Self {
            endpoint: "wss://generativelanguage.googleapis.com/ws/google.ai.generativelanguage.v1beta.GenerativeService.BidiGenerateContent".to_string(),
            model: "gemini-2.5-flash-native-audio-preview-09-2025".to_string(),
            voice_name: "Zephyr".to_string(),
            system_instruction: String::new(),
            api_key: None,
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: "127.0.0.1".to_string(),  // Localhost only (safe for development)
                port: 8080,
            },
            live: LiveConfig::default(),
            audio: AudioSettings::default(),
        }
    }
}

impl AppConfig {
    /// Load configuration from multiple sources in priority order.
    ///
    /// ## Configuration Loading Process:
    /// 1. Start with built-in defaults
    /// 2. Override with values from config.toml (if it exists)
    /// 3. Override with environment variables prefixed with APP_
    /// 4. Handle special cases for HOST, PORT and API_KEY environment variables
    ///
    /// ## Environment Variable Examples:
    /// - `APP_SERVER__PORT=3000`: Override server port
    /// - `APP_LIVE__VOICE_NAME=Puck`: Override requested voice
    /// - `APP_AUDIO__JITTER_BUFFER_SECS=0.2`: Override the jitter buffer
    /// - `API_KEY=...`: Credential for the remote session
    pub fn load() -> Result<Self> {
        let mut settings = config::Config::builder()
            .add_source(config::Config::try_from(&AppConfig::default())?)
            .add_source(config::File::with_name("config").required(false))
            // Double underscore separates sections so field names may keep single ones
            .add_source(
                config::Environment::with_prefix("APP")
                    .prefix_separator("_")
                    .separator("__"),
            );

        if let Ok(host) = env::var("HOST") {
            settings = settings.set_override("server.host", host)?;
        }

        if let Ok(port) = env::var("PORT") {
            settings = settings.set_override("server.port", port)?;
        }

        if let Ok(key) = env::var("API_KEY") {
            settings = settings.set_override("live.api_key", key)?;
        }

        let config = settings.build()?.try_deserialize()?;
        Ok(config)
    }

    /// Validate that the configuration values make sense.
    ///
    /// ## What this checks:
    /// - Server port is not 0
    /// - Sample rates and frame size are non-zero
    /// - Timing knobs are finite and not negative
    /// - The analyser FFT size is a power of two the analyser supports
    pub fn validate(&self) -> Result<()> {
        if self.server.port == 0 {
            return Err(anyhow::anyhow!("Server port cannot be 0"));
        }

        if self.live.model.trim().is_empty() {
            return Err(anyhow::anyhow!("Live model identifier cannot be empty"));
        }

        self.audio.validate()
    }

    /// Update configuration from a JSON string (used for runtime config updates).
    ///
    /// ## Partial updates:
    /// Only the provided fields change, e.g. `{"live": {"voice_name": "Puck"}}`.
    /// Changes to `live` and `audio` take effect on the next `connect()`.
    pub fn update_from_json(&mut self, json_str: &str) -> Result<()> {
        let partial_config: serde_json::Value = serde_json::from_str(json_str)?;

        if let Some(server) = partial_config.get("server") {
            if let Some(host) = server.get("host").and_then(|v| v.as_str()) {
                self.server.host = host.to_string();
            }
            if let Some(port) = server.get("port").and_then(|v| v.as_u64()) {
                self.server.port = u16::try_from(port)
                    .map_err(|_| anyhow::anyhow!("Server port {} is out of range", port))?;
            }
        }

        if let Some(live) = partial_config.get("live") {
            if let Some(model) = live.get("model").and_then(|v| v.as_str()) {
                self.live.model = model.to_string();
            }
            if let Some(voice) = live.get("voice_name").and_then(|v| v.as_str()) {
                self.live.voice_name = voice.to_string();
            }
            if let Some(instruction) = live.get("system_instruction").and_then(|v| v.as_str()) {
                self.live.system_instruction = instruction.to_string();
            }
        }

        if let Some(audio) = partial_config.get("audio") {
            if let Some(jitter) = audio.get("jitter_buffer_secs").and_then(|v| v.as_f64()) {
                self.audio.jitter_buffer_secs = jitter;
            }
            if let Some(epsilon) = audio.get("underrun_epsilon_secs").and_then(|v| v.as_f64()) {
                self.audio.underrun_epsilon_secs = epsilon;
            }
            if let Some(smoothing) = audio.get("smoothing_time_constant").and_then(|v| v.as_f64()) {
                self.audio.smoothing_time_constant = smoothing as f32;
            }
        }

        self.validate()?;
        Ok(())
    }
}

impl AudioSettings {
    pub fn validate(&self) -> Result<()> {
        if self.input_sample_rate == 0 || self.output_sample_rate == 0 {
            return Err(anyhow::anyhow!("Sample rates must be greater than 0"));
        }

        if self.frame_size == 0 {
            return Err(anyhow::anyhow!("Frame size must be greater than 0"));
        }

        for (name, value) in [
            ("jitter_buffer_secs", self.jitter_buffer_secs),
            ("underrun_epsilon_secs", self.underrun_epsilon_secs),
        ] {
            if !value.is_finite() || value < 0.0 {
                return Err(anyhow::anyhow!("{} must be a non-negative number, got {}", name, value));
            }
        }

        if !self.fft_size.is_power_of_two() || !(32..=32768).contains(&self.fft_size) {
            return Err(anyhow::anyhow!(
                "FFT size must be a power of two between 32 and 32768, got {}",
                self.fft_size
            ));
        }

        if !(0.0..=1.0).contains(&self.smoothing_time_constant) {
            return Err(anyhow::anyhow!("Smoothing time constant must be within [0, 1]"));
        }

        if self.level_interval_ms == 0 || self.snapshot_interval_ms == 0 {
            return Err(anyhow::anyhow!("Level and snapshot intervals must be greater than 0"));
        }

        Ok(())
    }
}
