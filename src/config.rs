use crate::error::Error;
use crate::tls_config::load_tls_client_config;
use ::config::Config;
use rustls::ClientConfig;
use std::sync::Arc;
use std::time::Duration;

pub(crate) const DEFAULT_POLL_CAPACITY: usize = 256;

/// Upper bound of the socket table. Slots are encoded into the low bits of
/// the mio token, see `engine::token_for`.
pub const MAX_SOCKETS: usize = 16000;

pub(crate) fn get_namespaced_value<T, F>(
    config: &Config,
    name: &str,
    key: &str,
    getter: F,
) -> Result<T, config::ConfigError>
where
    F: Fn(&Config, &str) -> Result<T, config::ConfigError>,
{
    if name.is_empty() {
        getter(config, key)
    } else {
        getter(config, &format!("{name}.{key}")).or_else(|_| getter(config, key))
    }
}

pub(crate) fn get_namespaced_usize(
    config: &Config,
    name: &str,
    key: &str,
) -> Result<usize, config::ConfigError> {
    get_namespaced_value(config, name, key, |cfg, key| cfg.get::<usize>(key))
}

pub(crate) fn get_namespaced_u64(
    config: &Config,
    name: &str,
    key: &str,
) -> Result<u64, config::ConfigError> {
    get_namespaced_value(config, name, key, |cfg, key| cfg.get::<u64>(key))
}

pub(crate) fn get_namespaced_string(
    config: &Config,
    name: &str,
    key: &str,
) -> Result<String, config::ConfigError> {
    get_namespaced_value(config, name, key, Config::get_string)
}

/// Tunables of a [`SocketEngine`](crate::SocketEngine).
///
/// Every field has a default, so an empty [`Config`] is valid input.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub poll_capacity: usize,
    pub max_sockets: usize,
    /// Forced timer pass interval when the poller keeps returning events.
    pub timer_starvation: Duration,
    /// Minimum SO_SNDBUF for sockets marked as data connections.
    pub data_sndbuf_size: usize,
    /// Minimum SO_RCVBUF for sockets marked as data connections.
    pub data_rcvbuf_size: usize,
    pub listen_backlog: i32,
    pub tls_client_config: Option<Arc<ClientConfig>>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            poll_capacity: DEFAULT_POLL_CAPACITY,
            max_sockets: MAX_SOCKETS,
            timer_starvation: Duration::from_millis(500),
            data_sndbuf_size: 256 * 1024,
            data_rcvbuf_size: 4 * 1024 * 1024,
            listen_backlog: 5,
            tls_client_config: None,
        }
    }
}

impl EngineConfig {
    /// Reads the engine settings, trying `{name}.{key}` before `key`.
    pub fn from_config(config: &Config, name: &str) -> Result<Self, Error> {
        let defaults = Self::default();

        let max_sockets = get_namespaced_usize(config, name, "max_sockets")
            .unwrap_or(defaults.max_sockets)
            .min(MAX_SOCKETS);

        let tls_client_config = match get_namespaced_string(config, name, "tls_ca_cert") {
            Ok(path) => Some(Arc::new(load_tls_client_config(&path)?)),
            Err(_) => None,
        };

        Ok(Self {
            poll_capacity: get_namespaced_usize(config, name, "poll_capacity")
                .unwrap_or(defaults.poll_capacity),
            max_sockets,
            timer_starvation: get_namespaced_u64(config, name, "timer_starvation_ms")
                .map(Duration::from_millis)
                .unwrap_or(defaults.timer_starvation),
            data_sndbuf_size: get_namespaced_usize(config, name, "data_sndbuf_size")
                .unwrap_or(defaults.data_sndbuf_size),
            data_rcvbuf_size: get_namespaced_usize(config, name, "data_rcvbuf_size")
                .unwrap_or(defaults.data_rcvbuf_size),
            listen_backlog: get_namespaced_usize(config, name, "listen_backlog")
                .map(|v| v.min(i32::MAX as usize) as i32)
                .unwrap_or(defaults.listen_backlog),
            tls_client_config,
        })
    }
}
