//! # Configuration Management
//!
//! Loads application configuration from multiple sources:
//! - TOML configuration files (config.toml)
//! - Environment variables (with APP_ prefix)
//! - Default values (built into the code)
//!
//! ## Configuration Priority (highest to lowest):
//! 1. Environment variables (APP_SERVER_HOST, APP_LIFECYCLE_CONNECTION_TTL_SECS, ...)
//! 2. Configuration file (config.toml)
//! 3. Default values (defined in the Default impl)
//!
//! The lifecycle section carries the constants the connection state machine is
//! built around: the transport ceiling, the refresh safety margin, and the
//! heartbeat cadence.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::env;
use std::time::Duration;

/// Main application configuration that contains all settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub auth: AuthConfig,
    pub lifecycle: LifecycleConfig,
    pub audio: AudioConfig,
    pub performance: PerformanceConfig,
}

/// Server bind settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

/// Speaker credential verification settings.
///
/// ## Fields:
/// - `issuer`: expected `iss` claim, also the base the JWKS document hangs off
/// - `audience`: expected `aud` claim (the app client id)
/// - `jwks_url`: where the issuer publishes its signing keys
/// - `expected_token_use`: the `token_use` claim value a speaker token must carry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    pub issuer: String,
    pub audience: String,
    pub jwks_url: String,
    pub expected_token_use: String,
}

/// Connection lifecycle timings, all in seconds.
///
/// ## Fields:
/// - `heartbeat_interval_secs`: cadence of liveness pings; a peer silent for
///   3x this interval is presumed gone
/// - `connection_ttl_secs`: the transport's hard connection ceiling (~2h)
/// - `refresh_margin_secs`: safety margin before the ceiling at which the
///   refresh starts (e.g. 20 minutes)
/// - `refresh_warning_secs`: advance notice sent to the peer before the
///   refresh threshold
/// - `refresh_timeout_secs`: how long to wait for the successor connection
/// - `refresh_retry_base_secs` / `refresh_retry_cap_secs`: exponential backoff
///   bounds for retrying a failed refresh window
/// - `supersede_grace_secs`: how long a superseded connection waits for the
///   peer to close before the server closes it
/// - `session_max_duration_secs`: ceiling on a whole session's lifetime
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LifecycleConfig {
    pub heartbeat_interval_secs: u64,
    pub connection_ttl_secs: u64,
    pub refresh_margin_secs: u64,
    pub refresh_warning_secs: u64,
    pub refresh_timeout_secs: u64,
    pub refresh_retry_base_secs: u64,
    pub refresh_retry_cap_secs: u64,
    pub supersede_grace_secs: u64,
    pub session_max_duration_secs: u64,
}

impl LifecycleConfig {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    /// A peer silent for longer than this is presumed gone.
    pub fn heartbeat_deadline(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs * 3)
    }

    /// Wall-clock age at which a connection must start its refresh:
    /// transport ceiling minus the safety margin.
    pub fn refresh_threshold(&self) -> Duration {
        Duration::from_secs(self.connection_ttl_secs.saturating_sub(self.refresh_margin_secs))
    }

    /// Advance-warning point, shortly before the refresh threshold.
    pub fn refresh_warning_at(&self) -> Duration {
        Duration::from_secs(
            self.connection_ttl_secs
                .saturating_sub(self.refresh_margin_secs)
                .saturating_sub(self.refresh_warning_secs),
        )
    }

    pub fn refresh_timeout(&self) -> Duration {
        Duration::from_secs(self.refresh_timeout_secs)
    }

    pub fn supersede_grace(&self) -> Duration {
        Duration::from_secs(self.supersede_grace_secs)
    }

    pub fn session_max_duration(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.session_max_duration_secs as i64)
    }

    /// Backoff before retry `attempt` (1-based): base * 2^(attempt-1), capped.
    pub fn refresh_backoff(&self, attempt: u32) -> Duration {
        let base = self.refresh_retry_base_secs;
        let exp = base.saturating_mul(1u64 << attempt.saturating_sub(1).min(16));
        Duration::from_secs(exp.min(self.refresh_retry_cap_secs))
    }
}

/// Audio pipeline settings.
///
/// ## Fields:
/// - `sample_rate` / `channels` / `bit_depth`: the PCM format the speaker
///   client captures (16kHz, mono, 16-bit LE)
/// - `capture_buffer_ms`: capacity of the speaker-side ring buffer
/// - `frame_duration_ms`: size of one outbound audio frame
/// - `prefetch_chunks`: playback look-ahead that resolves payload pointers
/// - `playback_capacity_chunks`: bound on buffered-but-unplayed chunks
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AudioConfig {
    pub sample_rate: u32,
    pub channels: u8,
    pub bit_depth: u8,
    pub capture_buffer_ms: u32,
    pub frame_duration_ms: u32,
    pub prefetch_chunks: usize,
    pub playback_capacity_chunks: usize,
}

impl AudioConfig {
    pub fn capture_config(&self) -> crate::audio::capture::CaptureBufferConfig {
        crate::audio::capture::CaptureBufferConfig {
            sample_rate: self.sample_rate,
            channels: self.channels,
            capacity_ms: self.capture_buffer_ms,
            frame_duration_ms: self.frame_duration_ms,
        }
    }

    pub fn playback_config(&self) -> crate::audio::playback::PlaybackQueueConfig {
        crate::audio::playback::PlaybackQueueConfig {
            capacity_chunks: self.playback_capacity_chunks,
            prefetch: self.prefetch_chunks,
        }
    }
}

/// Capacity limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PerformanceConfig {
    pub max_concurrent_sessions: usize,
    pub max_listeners_per_session: usize,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: "127.0.0.1".to_string(),
                port: 8080,
            },
            auth: AuthConfig {
                issuer: "https://auth.example.com/broadcast".to_string(),
                audience: "broadcast-speaker-app".to_string(),
                jwks_url: "https://auth.example.com/broadcast/.well-known/jwks.json"
                    .to_string(),
                expected_token_use: "id".to_string(),
            },
            lifecycle: LifecycleConfig {
                heartbeat_interval_secs: 30,
                connection_ttl_secs: 7200,     // the transport's 2h ceiling
                refresh_margin_secs: 1200,     // refresh 20 minutes before it
                refresh_warning_secs: 60,
                refresh_timeout_secs: 60,
                refresh_retry_base_secs: 30,
                refresh_retry_cap_secs: 300,
                supersede_grace_secs: 10,
                session_max_duration_secs: 28_800, // 8h of refreshed connections
            },
            audio: AudioConfig {
                sample_rate: 16000,
                channels: 1,
                bit_depth: 16,
                capture_buffer_ms: 30_000,     // 30s of audio absorbs a refresh
                frame_duration_ms: 200,
                prefetch_chunks: 3,
                playback_capacity_chunks: 150,
            },
            performance: PerformanceConfig {
                max_concurrent_sessions: 50,
                max_listeners_per_session: 500,
            },
        }
    }
}

impl AppConfig {
    /// Load configuration from defaults, config.toml, and APP_* environment
    /// variables, with HOST/PORT as deployment-platform overrides.
    pub fn load() -> Result<Self> {
        let mut settings = config::Config::builder()
            .add_source(config::Config::try_from(&AppConfig::default())?)
            .add_source(config::File::with_name("config").required(false))
            .add_source(config::Environment::with_prefix("APP").separator("_"));

        if let Ok(host) = env::var("HOST") {
            settings = settings.set_override("server.host", host)?;
        }

        if let Ok(port) = env::var("PORT") {
            settings = settings.set_override("server.port", port)?;
        }

        let config = settings.build()?.try_deserialize()?;
        Ok(config)
    }

    /// Validate that the configuration values make sense.
    ///
    /// The lifecycle invariants matter most: the refresh margin must leave the
    /// refresh threshold strictly inside the connection TTL, and the warning
    /// must precede the threshold.
    pub fn validate(&self) -> Result<()> {
        if self.server.port == 0 {
            return Err(anyhow::anyhow!("Server port cannot be 0"));
        }

        if self.lifecycle.heartbeat_interval_secs == 0 {
            return Err(anyhow::anyhow!("Heartbeat interval must be greater than 0"));
        }

        if self.lifecycle.refresh_margin_secs >= self.lifecycle.connection_ttl_secs {
            return Err(anyhow::anyhow!(
                "Refresh margin ({}) must be smaller than the connection TTL ({})",
                self.lifecycle.refresh_margin_secs,
                self.lifecycle.connection_ttl_secs
            ));
        }

        if self.lifecycle.refresh_retry_base_secs == 0
            || self.lifecycle.refresh_retry_base_secs > self.lifecycle.refresh_retry_cap_secs
        {
            return Err(anyhow::anyhow!(
                "Refresh retry base must be in 1..=cap ({})",
                self.lifecycle.refresh_retry_cap_secs
            ));
        }

        if self.audio.capture_buffer_ms == 0 || self.audio.frame_duration_ms == 0 {
            return Err(anyhow::anyhow!("Audio buffer durations must be greater than 0"));
        }

        if self.audio.bit_depth != 16 {
            return Err(anyhow::anyhow!(
                "Only 16-bit PCM is supported, got {}-bit",
                self.audio.bit_depth
            ));
        }

        if self.audio.playback_capacity_chunks == 0 || self.audio.prefetch_chunks == 0 {
            return Err(anyhow::anyhow!("Playback capacity and prefetch must be greater than 0"));
        }

        if self.performance.max_concurrent_sessions == 0
            || self.performance.max_listeners_per_session == 0
        {
            return Err(anyhow::anyhow!("Capacity limits must be greater than 0"));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = AppConfig::default();
        assert_eq!(config.server.host, "127.0.0.1");
        assert_eq!(config.server.port, 8080);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_default_config_round_trips_through_toml() {
        // The shipped defaults are what a config.toml would override
        let rendered = toml::to_string(&AppConfig::default()).unwrap();
        assert!(rendered.contains("[server]"));
        assert!(rendered.contains("[lifecycle]"));

        let parsed: AppConfig = toml::from_str(&rendered).unwrap();
        assert!(parsed.validate().is_ok());
        assert_eq!(parsed.lifecycle.connection_ttl_secs, 7200);
    }

    #[test]
    fn test_refresh_threshold_inside_ttl() {
        let config = AppConfig::default();
        let threshold = config.lifecycle.refresh_threshold();
        assert!(threshold < Duration::from_secs(config.lifecycle.connection_ttl_secs));
        assert_eq!(threshold, Duration::from_secs(6000));
        assert!(config.lifecycle.refresh_warning_at() < threshold);
    }

    #[test]
    fn test_backoff_is_capped() {
        let config = AppConfig::default();
        assert_eq!(config.lifecycle.refresh_backoff(1), Duration::from_secs(30));
        assert_eq!(config.lifecycle.refresh_backoff(2), Duration::from_secs(60));
        assert_eq!(config.lifecycle.refresh_backoff(3), Duration::from_secs(120));
        // base 30s doubling caps out at 5 minutes
        assert_eq!(config.lifecycle.refresh_backoff(10), Duration::from_secs(300));
    }

    #[test]
    fn test_config_validation() {
        let mut config = AppConfig::default();
        config.lifecycle.refresh_margin_secs = config.lifecycle.connection_ttl_secs;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.server.port = 0;
        assert!(config.validate().is_err());
    }
}
