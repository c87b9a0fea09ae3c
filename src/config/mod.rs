//! Configuration module - environment variable parsing

use std::env;
use std::net::SocketAddr;
use std::str::FromStr;

use crate::movement::{PolicyKind, Position, RateLimitConfig, SpeedProfile};

/// Application configuration loaded from environment variables
#[derive(Clone, Debug)]
pub struct Config {
    /// Server binding address
    pub server_addr: SocketAddr,
    /// Log level (trace, debug, info, warn, error)
    pub log_level: String,
    /// Allowed client origins for CORS, comma-separated, `*` for any
    pub client_origin: String,
    /// Bearer token for the mobile admin routes; unset disables them
    pub admin_token: Option<String>,

    /// Movement admission settings
    pub movement: RateLimitConfig,
    /// Walking tile duration on foot
    pub base_tile_duration_ms: u64,
    /// Walking tile duration when mounted
    pub mounted_tile_duration_ms: u64,
    /// Where new mobiles enter the world
    pub spawn: Position,

    /// Inbound WebSocket frames allowed per second per connection
    pub inbound_message_rate: u32,
    /// Violations before a connection is dropped (0 = never)
    pub violation_disconnect_threshold: u32,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Load configuration from an arbitrary key lookup
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        // PORT wins over SERVER_ADDR for hosted deployments
        let server_addr = match lookup("PORT") {
            Some(port) => format!("0.0.0.0:{}", port.trim()),
            None => lookup("SERVER_ADDR").unwrap_or_else(|| "0.0.0.0:2593".to_string()),
        };

        let defaults = RateLimitConfig::default();
        let movement = RateLimitConfig {
            policy: parse_var(&lookup, "MOVEMENT_POLICY", defaults.policy)?,
            ticket_buffer_size: parse_var(&lookup, "TICKET_BUFFER_SIZE", defaults.ticket_buffer_size)?,
            queue_depth_limit: parse_var(&lookup, "QUEUE_DEPTH_LIMIT", defaults.queue_depth_limit)?,
            distance_window_ms: parse_var(&lookup, "DISTANCE_WINDOW_MS", defaults.distance_window_ms)?,
            distance_limit_tiles: parse_var(&lookup, "DISTANCE_LIMIT_TILES", defaults.distance_limit_tiles)?,
            run_speed_multiplier: parse_var(&lookup, "RUN_SPEED_MULTIPLIER", defaults.run_speed_multiplier)?,
            stall_grace_ms: parse_var(&lookup, "STALL_GRACE_MS", defaults.stall_grace_ms)?,
        };
        movement.validate()?;

        let config = Self {
            server_addr: server_addr
                .parse()
                .map_err(|_| ConfigError::InvalidAddress)?,

            log_level: lookup("LOG_LEVEL").unwrap_or_else(|| "info".to_string()),
            client_origin: lookup("CLIENT_ORIGIN").unwrap_or_else(|| "*".to_string()),
            admin_token: lookup("ADMIN_TOKEN").filter(|token| !token.trim().is_empty()),

            movement,
            base_tile_duration_ms: parse_var(&lookup, "BASE_TILE_DURATION_MS", 400)?,
            mounted_tile_duration_ms: parse_var(&lookup, "MOUNTED_TILE_DURATION_MS", 200)?,
            spawn: Position::new(
                parse_var(&lookup, "SPAWN_X", 3667)?,
                parse_var(&lookup, "SPAWN_Y", 2625)?,
                parse_var(&lookup, "SPAWN_Z", 0)?,
            ),

            inbound_message_rate: parse_var(&lookup, "INBOUND_MESSAGE_RATE", 30)?,
            violation_disconnect_threshold: parse_var(&lookup, "VIOLATION_DISCONNECT_THRESHOLD", 10)?,
        };

        if config.base_tile_duration_ms == 0 {
            return Err(ConfigError::OutOfRange("BASE_TILE_DURATION_MS"));
        }
        if config.mounted_tile_duration_ms == 0 {
            return Err(ConfigError::OutOfRange("MOUNTED_TILE_DURATION_MS"));
        }
        if config.inbound_message_rate == 0 {
            return Err(ConfigError::OutOfRange("INBOUND_MESSAGE_RATE"));
        }

        Ok(config)
    }

    /// Speed supplied to a new session
    pub fn speed_profile(&self, mounted: bool) -> SpeedProfile {
        if mounted {
            SpeedProfile::new(self.mounted_tile_duration_ms)
        } else {
            SpeedProfile::new(self.base_tile_duration_ms)
        }
    }

    pub fn policy(&self) -> PolicyKind {
        self.movement.policy
    }
}

fn parse_var<F, T>(lookup: &F, var: &'static str, default: T) -> Result<T, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
{
    match lookup(var) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|_| ConfigError::Invalid { var, value: raw }),
        None => Ok(default),
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid server address format")]
    InvalidAddress,

    #[error("Invalid value for {var}: {value:?}")]
    Invalid { var: &'static str, value: String },

    #[error("{0} is out of range")]
    OutOfRange(&'static str),
}
