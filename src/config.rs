use clap::Parser;
use std::time::Duration;

use crate::parser::{
    Limits, DEFAULT_MAX_BULK_LEN, DEFAULT_MAX_INLINE_LEN, DEFAULT_MAX_MULTIBULK_LEN,
};

pub const BIND_HOST: &str = "0.0.0.0";
pub const PORT: u16 = 9877;
pub const UPSTREAM_HOST: &str = "127.0.0.1";
pub const UPSTREAM_PORT: u16 = 6379;
pub const READ_BUFFER_INIT_SIZE: usize = 16 * 1024;
pub const READ_BUFFER_MIN_SIZE: usize = 1024;
pub const PIPELINE_CAPACITY: usize = 10_000;
pub const SESSION_POOL_SIZE: usize = 768;
pub const RECONNECT_DELAY_MS: u64 = 1000;

/// Runtime options, read from the command line with environment fallbacks.
#[derive(Parser, Debug, Clone)]
#[command(name = "resproxy", about = "A pipelining RESP proxy", version)]
pub struct Config {
    /// Address to accept client connections on
    #[arg(long, env = "RESPROXY_BIND_HOST", default_value = BIND_HOST)]
    pub bind_host: String,

    /// Port to accept client connections on
    #[arg(short, long, env = "RESPROXY_PORT", default_value_t = PORT)]
    pub port: u16,

    /// Backend server host
    #[arg(long, env = "RESPROXY_UPSTREAM_HOST", default_value = UPSTREAM_HOST)]
    pub upstream_host: String,

    /// Backend server port
    #[arg(long, env = "RESPROXY_UPSTREAM_PORT", default_value_t = UPSTREAM_PORT)]
    pub upstream_port: u16,

    /// Password sent with AUTH on every backend connection
    #[arg(long, env = "RESPROXY_PASSWORD")]
    pub password: Option<String>,

    /// Route keys over a backend cluster (not supported)
    #[arg(long, env = "RESPROXY_CLUSTER_MODE")]
    pub cluster_mode: bool,

    /// Initial size of every read buffer
    #[arg(long, default_value_t = READ_BUFFER_INIT_SIZE)]
    pub read_buffer_init_size: usize,

    /// Free space guaranteed before each socket read
    #[arg(long, default_value_t = READ_BUFFER_MIN_SIZE)]
    pub read_buffer_min_size: usize,

    /// Requests that may wait for a backend reply at once
    #[arg(long, default_value_t = PIPELINE_CAPACITY)]
    pub pipeline_capacity: usize,

    /// Idle client sessions kept for reuse
    #[arg(long, default_value_t = SESSION_POOL_SIZE)]
    pub session_pool_size: usize,

    /// Largest accepted bulk string
    #[arg(long, default_value_t = DEFAULT_MAX_BULK_LEN)]
    pub max_bulk_len: usize,

    /// Largest accepted inline request line
    #[arg(long, default_value_t = DEFAULT_MAX_INLINE_LEN)]
    pub max_inline_len: usize,

    /// Most arguments accepted in one multibulk request
    #[arg(long, default_value_t = DEFAULT_MAX_MULTIBULK_LEN)]
    pub max_multibulk_len: usize,

    /// Pause between backend reconnection attempts, in milliseconds
    #[arg(long, default_value_t = RECONNECT_DELAY_MS)]
    pub reconnect_delay_ms: u64,

    /// Consecutive failed backend connection attempts before giving up, 0 for no limit
    #[arg(long, default_value_t = 0)]
    pub max_reconnects: u32,

    /// Log filter used when RUST_LOG is not set
    #[arg(long, default_value = "info")]
    pub log_level: String,
}

impl Config {
    pub fn limits(&self) -> Limits {
        Limits {
            max_bulk_len: self.max_bulk_len,
            max_inline_len: self.max_inline_len,
            max_multibulk_len: self.max_multibulk_len,
        }
    }

    pub fn upstream_address(&self) -> String {
        format!("{}:{}", self.upstream_host, self.upstream_port)
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            bind_host: BIND_HOST.to_string(),
            port: PORT,
            upstream_host: UPSTREAM_HOST.to_string(),
            upstream_port: UPSTREAM_PORT,
            password: None,
            cluster_mode: false,
            read_buffer_init_size: READ_BUFFER_INIT_SIZE,
            read_buffer_min_size: READ_BUFFER_MIN_SIZE,
            pipeline_capacity: PIPELINE_CAPACITY,
            session_pool_size: SESSION_POOL_SIZE,
            max_bulk_len: DEFAULT_MAX_BULK_LEN,
            max_inline_len: DEFAULT_MAX_INLINE_LEN,
            max_multibulk_len: DEFAULT_MAX_MULTIBULK_LEN,
            reconnect_delay_ms: RECONNECT_DELAY_MS,
            max_reconnects: 0,
            log_level: "info".to_string(),
        }
    }
}
