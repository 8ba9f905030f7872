// Relay server configuration.
//
// Centralizes environment variable parsing with defaults for local
// development. Room limits and liveness windows live here so the room
// actors and the connection gateway read one source of truth.

use std::net::SocketAddr;
use std::time::Duration;

const DEV_JWT_SECRET: &str = "coderoom_local_development_jwt_secret_must_be_32_chars";

/// Room for the JSON envelope around the largest accepted document.
pub const FRAME_ENVELOPE_BYTES: usize = 65_536;

/// A join resync is four non-ephemeral events; leave room for deltas behind it.
pub const MIN_OUTBOUND_QUEUE: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Text,
    Json,
}

/// Limits applied by every Room Session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoomLimits {
    /// Maximum concurrent participants per room.
    pub max_participants: usize,
    /// Number of chat messages retained and replayed on resync.
    pub chat_history_limit: usize,
    /// How long an empty room survives before it is destroyed.
    pub grace_period: Duration,
    pub max_code_bytes: usize,
    pub max_chat_bytes: usize,
    pub max_whiteboard_objects: usize,
}

impl Default for RoomLimits {
    fn default() -> Self {
        Self {
            max_participants: 16,
            chat_history_limit: 100,
            grace_period: Duration::from_millis(30_000),
            max_code_bytes: 1_048_576,
            max_chat_bytes: 4_096,
            max_whiteboard_objects: 10_000,
        }
    }
}

/// Per-connection settings used by the WebSocket gateway.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GatewayConfig {
    pub heartbeat_interval: Duration,
    /// Silence window W after which a connection is treated as gone.
    pub liveness_timeout: Duration,
    pub outbound_queue_capacity: usize,
    pub max_frame_bytes: usize,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_millis(10_000),
            liveness_timeout: Duration::from_millis(30_000),
            outbound_queue_capacity: 256,
            max_frame_bytes: RoomLimits::default().max_code_bytes + FRAME_ENVELOPE_BYTES,
        }
    }
}

/// Core relay server configuration.
///
/// Constructed via [`RelayConfig::from_env`] which reads environment
/// variables and falls back to development defaults.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Listen address (host:port).
    pub listen_addr: SocketAddr,
    /// HS256 secret for identity tokens.
    pub jwt_secret: String,
    /// Comma-separated CORS origins (or `"*"` for any).
    pub cors_origins: Option<String>,
    /// Log filter directive (e.g. `info`, `coderoom_relay=debug`).
    pub log_filter: String,
    pub log_format: LogFormat,
    pub rooms: RoomLimits,
    pub gateway: GatewayConfig,
}

impl RelayConfig {
    /// Parse configuration from environment variables.
    ///
    /// | Variable | Default |
    /// |---|---|
    /// | `CODEROOM_RELAY_HOST` | `0.0.0.0` |
    /// | `CODEROOM_RELAY_PORT` | `8080` |
    /// | `CODEROOM_RELAY_JWT_SECRET` | dev-only placeholder |
    /// | `CODEROOM_RELAY_CORS_ORIGINS` | *(none, cors.rs uses dev defaults)* |
    /// | `CODEROOM_RELAY_LOG_FILTER` | `info` |
    /// | `CODEROOM_RELAY_LOG_FORMAT` | `text` |
    /// | `CODEROOM_RELAY_MAX_PARTICIPANTS` | `16` |
    /// | `CODEROOM_RELAY_CHAT_HISTORY_LIMIT` | `100` |
    /// | `CODEROOM_RELAY_ROOM_GRACE_MS` | `30000` |
    /// | `CODEROOM_RELAY_HEARTBEAT_INTERVAL_MS` | `10000` |
    /// | `CODEROOM_RELAY_LIVENESS_TIMEOUT_MS` | `30000` |
    /// | `CODEROOM_RELAY_OUTBOUND_QUEUE` | `256` (at least 16) |
    /// | `CODEROOM_RELAY_MAX_FRAME_BYTES` | max code bytes + 64 KiB (never less) |
    /// | `CODEROOM_RELAY_MAX_CODE_BYTES` | `1048576` |
    /// | `CODEROOM_RELAY_MAX_CHAT_BYTES` | `4096` |
    /// | `CODEROOM_RELAY_MAX_WHITEBOARD_OBJECTS` | `10000` |
    pub fn from_env() -> Self {
        Self::from_env_fn(|key| std::env::var(key))
    }

    /// Testable constructor that accepts an environment lookup function.
    pub(crate) fn from_env_fn<F>(env: F) -> Self
    where
        F: Fn(&str) -> Result<String, std::env::VarError>,
    {
        let parse = |key: &str| env(key).ok().and_then(|v| v.trim().parse::<u64>().ok());

        let host = env("CODEROOM_RELAY_HOST").unwrap_or_else(|_| "0.0.0.0".into());
        let port: u16 = env("CODEROOM_RELAY_PORT")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(8080);
        let listen_addr = format!("{host}:{port}")
            .parse()
            .unwrap_or_else(|_| SocketAddr::from(([0, 0, 0, 0], port)));

        let jwt_secret = env("CODEROOM_RELAY_JWT_SECRET").unwrap_or_else(|_| DEV_JWT_SECRET.into());
        let cors_origins = env("CODEROOM_RELAY_CORS_ORIGINS").ok();
        let log_filter = env("CODEROOM_RELAY_LOG_FILTER").unwrap_or_else(|_| "info".into());
        let log_format = match env("CODEROOM_RELAY_LOG_FORMAT").as_deref().map(str::trim) {
            Ok(value) if value.eq_ignore_ascii_case("json") => LogFormat::Json,
            _ => LogFormat::Text,
        };

        let room_defaults = RoomLimits::default();
        let rooms = RoomLimits {
            max_participants: parse("CODEROOM_RELAY_MAX_PARTICIPANTS")
                .filter(|v| *v > 0)
                .map_or(room_defaults.max_participants, |v| v as usize),
            chat_history_limit: parse("CODEROOM_RELAY_CHAT_HISTORY_LIMIT")
                .map_or(room_defaults.chat_history_limit, |v| v as usize),
            grace_period: parse("CODEROOM_RELAY_ROOM_GRACE_MS")
                .map_or(room_defaults.grace_period, Duration::from_millis),
            max_code_bytes: parse("CODEROOM_RELAY_MAX_CODE_BYTES")
                .map_or(room_defaults.max_code_bytes, |v| v as usize),
            max_chat_bytes: parse("CODEROOM_RELAY_MAX_CHAT_BYTES")
                .map_or(room_defaults.max_chat_bytes, |v| v as usize),
            max_whiteboard_objects: parse("CODEROOM_RELAY_MAX_WHITEBOARD_OBJECTS")
                .map_or(room_defaults.max_whiteboard_objects, |v| v as usize),
        };

        let gateway_defaults = GatewayConfig::default();
        let heartbeat_interval = parse("CODEROOM_RELAY_HEARTBEAT_INTERVAL_MS")
            .filter(|v| *v > 0)
            .map_or(gateway_defaults.heartbeat_interval, Duration::from_millis);
        let mut liveness_timeout = parse("CODEROOM_RELAY_LIVENESS_TIMEOUT_MS")
            .map_or(gateway_defaults.liveness_timeout, Duration::from_millis);
        // A window shorter than one heartbeat would expire healthy connections.
        if liveness_timeout <= heartbeat_interval {
            liveness_timeout = heartbeat_interval * 2;
        }
        let gateway = GatewayConfig {
            heartbeat_interval,
            liveness_timeout,
            outbound_queue_capacity: parse("CODEROOM_RELAY_OUTBOUND_QUEUE")
                .map_or(gateway_defaults.outbound_queue_capacity, |v| v as usize)
                .max(MIN_OUTBOUND_QUEUE),
            // A frame must always fit the largest document the rooms accept.
            max_frame_bytes: parse("CODEROOM_RELAY_MAX_FRAME_BYTES")
                .map_or(gateway_defaults.max_frame_bytes, |v| v as usize)
                .max(rooms.max_code_bytes.saturating_add(FRAME_ENVELOPE_BYTES)),
        };

        Self { listen_addr, jwt_secret, cors_origins, log_filter, log_format, rooms, gateway }
    }

    /// Returns true when using the development-only JWT secret.
    pub fn is_dev_jwt_secret(&self) -> bool {
        self.jwt_secret == DEV_JWT_SECRET
    }
}
