//! Server tunables and their environment overrides.

use crate::registry::RegistryConfig;
use crate::session::SESSION_TIMEOUT;
use crate::solver::{Backend, GridDims};
use protocol::ServerFrameMessage;
use std::num::NonZeroUsize;
use std::time::Duration;
use thiserror::Error;

pub const DEFAULT_PORT: u16 = 8080;
/// One cycle per ~60 Hz display frame
pub const DEFAULT_TICK: Duration = Duration::from_millis(16);
pub const DEFAULT_OUTBOUND_DEPTH: usize = 2;
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;
pub const DEFAULT_EVENT_CAPACITY: usize = 1024;
/// Largest single WebSocket frame a tungstenite client accepts by default
pub const CLIENT_FRAME_LIMIT: usize = 16 * 1024 * 1024;
/// Length of every generated session id
const SESSION_ID_LEN: usize = 32;

#[derive(Debug, Error, PartialEq, Eq)]
#[error("invalid value {value:?} for {variable}: {reason}")]
pub struct ConfigError {
    pub variable: &'static str,
    pub value: String,
    pub reason: String,
}

/// Everything the server binary can tune.
///
/// Each `ServerFrame` goes out as one unfragmented WebSocket message of
/// [`ServerConfig::frame_message_size`] bytes, about 50 MB for the default
/// 128^3 grid. That is above the default frame limit of most client
/// libraries ([`CLIENT_FRAME_LIMIT`] for tungstenite), so clients must raise
/// their limit or the server must run a smaller `FDTD_GRID`.
/// `max_message_size` only bounds what clients send.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Period of the update/broadcast cycle
    pub tick: Duration,
    /// Grid every new session is initialized with
    pub grid: GridDims,
    pub backend: Backend,
    pub session_timeout: Duration,
    pub worker_threads: usize,
    /// Encoded messages a connection may have queued before frames are deferred
    pub outbound_depth: usize,
    pub max_message_size: usize,
    pub event_capacity: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: DEFAULT_PORT,
            tick: DEFAULT_TICK,
            grid: GridDims::default(),
            backend: Backend::Cpu,
            session_timeout: SESSION_TIMEOUT,
            worker_threads: std::thread::available_parallelism()
                .map(NonZeroUsize::get)
                .unwrap_or(1),
            outbound_depth: DEFAULT_OUTBOUND_DEPTH,
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            event_capacity: DEFAULT_EVENT_CAPACITY,
        }
    }
}

impl ServerConfig {
    /// Defaults with `FDTD_*` environment overrides applied.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Defaults with overrides taken from `lookup`.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(value) = lookup("FDTD_BACKEND") {
            config.backend = value.parse().map_err(|reason| ConfigError {
                variable: "FDTD_BACKEND",
                value: value.clone(),
                reason,
            })?;
        }
        if let Some(value) = lookup("FDTD_GRID") {
            config.grid = value.parse().map_err(|reason| ConfigError {
                variable: "FDTD_GRID",
                value: value.clone(),
                reason,
            })?;
        }
        if let Some(value) = lookup("FDTD_WORKERS") {
            config.worker_threads = parse_positive("FDTD_WORKERS", &value)?;
        }
        if let Some(value) = lookup("FDTD_TICK_MS") {
            let millis = parse_positive("FDTD_TICK_MS", &value)?;
            config.tick = Duration::from_millis(millis as u64);
        }

        Ok(config)
    }

    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Encoded size of one `ServerFrame` for the configured grid.
    pub fn frame_message_size(&self) -> usize {
        let session_id = "0".repeat(SESSION_ID_LEN);
        ServerFrameMessage::encoded_len_for(&session_id, self.grid.frame_bytes())
    }

    pub fn registry(&self) -> RegistryConfig {
        RegistryConfig {
            grid: self.grid,
            backend: self.backend,
            session_timeout: self.session_timeout,
            worker_threads: self.worker_threads,
        }
    }
}

fn parse_positive(variable: &'static str, value: &str) -> Result<usize, ConfigError> {
    let invalid = |reason: String| ConfigError {
        variable,
        value: value.to_string(),
        reason,
    };
    match value.trim().parse::<usize>() {
        Ok(0) => Err(invalid("must be positive".to_string())),
        Ok(n) => Ok(n),
        Err(e) => Err(invalid(e.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| vars.get(name).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = ServerConfig::default();
        assert_eq!(config.bind_address(), "0.0.0.0:8080");
        assert_eq!(config.tick, Duration::from_millis(16));
        assert_eq!(config.grid, GridDims::cube(128).unwrap());
        assert_eq!(config.backend, Backend::Cpu);
        assert_eq!(config.session_timeout, Duration::from_secs(1800));
        assert_eq!(config.outbound_depth, 2);
        assert_eq!(config.max_message_size, 16 * 1024 * 1024);
        assert!(config.worker_threads >= 1);
    }

    #[test]
    fn test_no_overrides_keeps_defaults() {
        let config = ServerConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config.grid, GridDims::default());
        assert_eq!(config.tick, DEFAULT_TICK);
    }

    #[test]
    fn test_overrides_apply() {
        let config = ServerConfig::from_lookup(lookup(&[
            ("FDTD_BACKEND", "headless"),
            ("FDTD_GRID", "32x16x8"),
            ("FDTD_WORKERS", "3"),
            ("FDTD_TICK_MS", "33"),
        ]))
        .unwrap();

        assert_eq!(config.backend, Backend::Headless);
        assert_eq!(config.grid, GridDims::new(32, 16, 8).unwrap());
        assert_eq!(config.worker_threads, 3);
        assert_eq!(config.tick, Duration::from_millis(33));

        let registry = config.registry();
        assert_eq!(registry.grid, config.grid);
        assert_eq!(registry.worker_threads, 3);
    }

    #[test]
    fn test_malformed_values_name_the_variable() {
        let err = ServerConfig::from_lookup(lookup(&[("FDTD_GRID", "big")])).unwrap_err();
        assert_eq!(err.variable, "FDTD_GRID");

        let err = ServerConfig::from_lookup(lookup(&[("FDTD_WORKERS", "0")])).unwrap_err();
        assert_eq!(err.variable, "FDTD_WORKERS");
        assert!(err.to_string().contains("must be positive"));

        let err = ServerConfig::from_lookup(lookup(&[("FDTD_BACKEND", "gpu")])).unwrap_err();
        assert_eq!(err.variable, "FDTD_BACKEND");

        assert!(ServerConfig::from_lookup(lookup(&[("FDTD_TICK_MS", "-5")])).is_err());
    }

    #[test]
    fn test_default_frames_exceed_client_limit() {
        let config = ServerConfig::default();
        // tag, id string, sim time, payload prefix, E and M for 128^3 cells
        let expected = 1 + (4 + 32) + 8 + 4 + 128 * 128 * 128 * 6 * 4;
        assert_eq!(config.frame_message_size(), expected);
        assert!(config.frame_message_size() > CLIENT_FRAME_LIMIT);

        let small = ServerConfig {
            grid: GridDims::cube(32).unwrap(),
            ..ServerConfig::default()
        };
        assert!(small.frame_message_size() < CLIENT_FRAME_LIMIT);
    }
}
