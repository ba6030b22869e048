//! Plain configuration structs, one per component. No file-format parsing or
//! env binding lives here — a host process builds these however it likes and
//! passes them into the constructors below.
use packetforge_core::buffer_pool::BufferPoolConfig;

/// Listener-level socket options and accept-loop behavior.
#[derive(Debug, Clone)]
pub struct ListenerConfig {
    pub endpoint: String,
    pub backlog: u32,
    pub tcp_nodelay: bool,
    pub keepalive: bool,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        ListenerConfig {
            endpoint: "0.0.0.0:7777".to_string(),
            backlog: 1024,
            tcp_nodelay: true,
            keepalive: true,
        }
    }
}

/// Priority queue bounds and optional statistics collection.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    pub max_total: usize,
    pub per_packet_timeout_ms: u64,
    pub validate_on_dequeue: bool,
    pub thread_safe: bool,
    pub collect_statistics: bool,
}

impl Default for QueueConfig {
    fn default() -> Self {
        QueueConfig {
            max_total: 0,
            per_packet_timeout_ms: 0,
            validate_on_dequeue: false,
            thread_safe: true,
            collect_statistics: true,
        }
    }
}

/// Dispatcher-wide defaults applied when a handler descriptor leaves a field
/// unset, plus the per-connection handler-failure budget.
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    pub default_timeout_ms: u32,
    pub max_handler_failures_per_conn: u32,
    /// Optional: once a `(connection, rate_group)` pair exceeds its limit,
    /// block it for this long regardless of the window clearing. `0` disables
    /// lockouts and relies on the sliding window alone.
    pub rate_limit_lockout_ms: u64,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        DispatcherConfig {
            default_timeout_ms: 5_000,
            max_handler_failures_per_conn: 8,
            rate_limit_lockout_ms: 0,
        }
    }
}

/// Per-IP accept limiting and inactivity sweep, see `listener::ConnectionLimiter`.
#[derive(Debug, Clone)]
pub struct ConnectionLimiterConfig {
    pub max_per_ip: usize,
    pub inactivity_threshold_s: u64,
    pub cleanup_interval_s: u64,
}

impl Default for ConnectionLimiterConfig {
    fn default() -> Self {
        ConnectionLimiterConfig {
            max_per_ip: 64,
            inactivity_threshold_s: 30,
            cleanup_interval_s: 3,
        }
    }
}

/// Top-level configuration bundle a host process assembles and hands to
/// `Listener::bind`.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub listener: ListenerConfig,
    pub buffer_pool: BufferPoolConfig,
    pub queue: QueueConfig,
    pub dispatcher: DispatcherConfig,
    pub connection_limiter: ConnectionLimiterConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            listener: ListenerConfig::default(),
            buffer_pool: BufferPoolConfig::default(),
            queue: QueueConfig::default(),
            dispatcher: DispatcherConfig::default(),
            connection_limiter: ConnectionLimiterConfig::default(),
        }
    }
}
