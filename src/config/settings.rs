//! Client settings and configuration structures.

use std::time::Duration;

use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use validator::Validate;

use crate::application::ConversationConfig;
use crate::gateway::{Backoff, SessionConfig};

/// Root configuration structure containing all client settings.
#[derive(Debug, Clone, Deserialize, Validate)]
pub struct Settings {
    /// Realtime endpoint and session tuning
    #[validate(nested)]
    pub realtime: RealtimeSettings,

    /// Reconnect backoff
    #[validate(nested)]
    pub reconnect: ReconnectSettings,

    /// Conversation state tuning
    #[validate(nested)]
    pub conversation: ConversationSettings,

    /// Current environment (development, staging, production)
    pub environment: String,
}

/// Realtime endpoint configuration.
#[derive(Debug, Clone, Deserialize, Validate)]
pub struct RealtimeSettings {
    /// WebSocket endpoint (ws:// or wss://)
    #[validate(length(min = 1))]
    pub url: String,

    /// Heartbeat interval in milliseconds, both directions
    #[validate(range(min = 100))]
    pub heartbeat_interval_ms: u64,

    /// Consecutive silent heartbeat intervals before the connection is
    /// considered lost
    #[validate(range(min = 1, max = 20))]
    pub max_missed_heartbeats: u32,

    #[validate(range(min = 100))]
    pub connect_timeout_ms: u64,

    #[validate(range(min = 100))]
    pub send_timeout_ms: u64,

    /// Resolve sends on server receipt rather than on write
    pub await_receipts: bool,

    /// Maximum inbound frame size in bytes (default: 1MB)
    #[validate(range(min = 1024))]
    pub max_frame_size: usize,
}

/// Reconnect backoff configuration.
#[derive(Debug, Clone, Deserialize, Validate)]
pub struct ReconnectSettings {
    /// Delay before the first reconnect attempt; doubles per attempt
    #[validate(range(min = 1))]
    pub base_delay_ms: u64,

    #[validate(range(min = 1, max = 30))]
    pub max_attempts: u32,
}

/// Conversation state configuration.
#[derive(Debug, Clone, Deserialize, Validate)]
pub struct ConversationSettings {
    #[validate(range(min = 1, max = 500))]
    pub history_page_size: u32,

    /// Typing signal lifetime in milliseconds, local and remote
    #[validate(range(min = 100))]
    pub typing_ttl_ms: u64,

    #[validate(range(min = 1))]
    pub event_channel_capacity: usize,
}

impl Settings {
    /// Load settings from environment variables and configuration files.
    ///
    /// The loading order is:
    /// 1. built-in defaults
    /// 2. config/default.toml
    /// 3. config/{RUN_ENV}.toml
    /// 4. `APP__` environment variables, then `REALTIME_URL`
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if configuration cannot be loaded or parsed, or
    /// if a value is out of range.
    pub fn load() -> Result<Self, ConfigError> {
        // Load .env file if present (ignore errors if not found)
        let _ = dotenvy::dotenv();

        let environment = std::env::var("RUN_ENV").unwrap_or_else(|_| "development".into());

        Config::builder()
            .set_default("environment", environment.clone())?
            .set_default("realtime.url", "ws://localhost:8080/ws")?
            .set_default("realtime.heartbeat_interval_ms", 10_000_i64)?
            .set_default("realtime.max_missed_heartbeats", 3_i64)?
            .set_default("realtime.connect_timeout_ms", 10_000_i64)?
            .set_default("realtime.send_timeout_ms", 5_000_i64)?
            .set_default("realtime.await_receipts", true)?
            .set_default("realtime.max_frame_size", 1_048_576_i64)?
            .set_default("reconnect.base_delay_ms", 1_000_i64)?
            .set_default("reconnect.max_attempts", 5_i64)?
            .set_default("conversation.history_page_size", 30_i64)?
            .set_default("conversation.typing_ttl_ms", 3_000_i64)?
            .set_default("conversation.event_channel_capacity", 256_i64)?
            .add_source(File::with_name("config/default").required(false))
            .add_source(File::with_name(&format!("config/{}", environment)).required(false))
            // APP__REALTIME__URL=wss://... -> realtime.url
            .add_source(
                Environment::default()
                    .prefix("APP")
                    .separator("__")
                    .try_parsing(true),
            )
            .set_override_option("realtime.url", std::env::var("REALTIME_URL").ok())?
            .build()?
            .try_deserialize()
            .and_then(|settings: Self| settings.validated())
    }

    /// Check value ranges.
    pub fn validated(self) -> Result<Self, ConfigError> {
        self.validate()
            .map_err(|e| ConfigError::Message(format!("invalid settings: {}", e)))?;
        Ok(self)
    }

    /// Session tuning derived from these settings.
    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            heartbeat_interval: Duration::from_millis(self.realtime.heartbeat_interval_ms),
            max_missed_heartbeats: self.realtime.max_missed_heartbeats,
            connect_timeout: Duration::from_millis(self.realtime.connect_timeout_ms),
            send_timeout: Duration::from_millis(self.realtime.send_timeout_ms),
            await_receipts: self.realtime.await_receipts,
            backoff: Backoff::new(
                Duration::from_millis(self.reconnect.base_delay_ms),
                self.reconnect.max_attempts,
            ),
        }
    }

    pub fn conversation_config(&self) -> ConversationConfig {
        ConversationConfig {
            history_page_size: self.conversation.history_page_size,
            typing_ttl: self.typing_ttl(),
            event_channel_capacity: self.conversation.event_channel_capacity,
        }
    }

    pub fn typing_ttl(&self) -> Duration {
        Duration::from_millis(self.conversation.typing_ttl_ms)
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            realtime: RealtimeSettings {
                url: "ws://localhost:8080/ws".into(),
                heartbeat_interval_ms: 10_000,
                max_missed_heartbeats: 3,
                connect_timeout_ms: 10_000,
                send_timeout_ms: 5_000,
                await_receipts: true,
                max_frame_size: 1_048_576,
            },
            reconnect: ReconnectSettings {
                base_delay_ms: 1_000,
                max_attempts: 5,
            },
            conversation: ConversationSettings {
                history_page_size: 30,
                typing_ttl_ms: 3_000,
                event_channel_capacity: 256,
            },
            environment: "development".into(),
        }
    }
}
