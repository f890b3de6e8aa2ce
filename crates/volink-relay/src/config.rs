use std::net::SocketAddr;
use std::time::Duration;

const DEFAULT_TICKS_PER_SECOND: u32 = 10;
const DEFAULT_CHANNEL_CAPACITY: usize = 256;
const DEFAULT_ROOM_IDLE_SECS: u64 = 30;

/// Relay settings, read from `VOLINK_RELAY_*` environment variables.
#[derive(Debug, Clone, PartialEq)]
pub struct RelayConfig {
    pub addr: SocketAddr,
    /// Ordering ticks per second in every room.
    pub ticks_per_second: u32,
    /// Per-room request queue and broadcast buffer size.
    pub channel_capacity: usize,
    /// How long a room without members lives before it shuts down.
    pub room_idle: Duration,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            addr: SocketAddr::from(([0, 0, 0, 0], 3030)),
            ticks_per_second: DEFAULT_TICKS_PER_SECOND,
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
            room_idle: Duration::from_secs(DEFAULT_ROOM_IDLE_SECS),
        }
    }
}

impl RelayConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            addr: env_parse("VOLINK_RELAY_ADDR", defaults.addr),
            ticks_per_second: env_parse("VOLINK_RELAY_TPS", DEFAULT_TICKS_PER_SECOND).max(1),
            channel_capacity: env_parse("VOLINK_RELAY_CHANNEL_CAPACITY", DEFAULT_CHANNEL_CAPACITY).max(1),
            room_idle: Duration::from_secs(env_parse("VOLINK_RELAY_ROOM_IDLE_SECS", DEFAULT_ROOM_IDLE_SECS)),
        }
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_secs(1) / self.ticks_per_second.max(1)
    }
}

fn env_parse<T>(key: &str, default: T) -> T
where
    T: std::str::FromStr + Copy,
{
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse::<T>().ok())
        .unwrap_or(default)
}
