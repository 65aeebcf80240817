//! Port and launcher configuration
//!
//! Library defaults come from [`PortConfig::new`]. [`PortConfig::from_env`]
//! applies `TCPLINK_*` overrides on top:
//!
//! | Variable | Default |
//! |----------|---------|
//! | `TCPLINK_ADDRESS` | `0.0.0.0` |
//! | `TCPLINK_PORT` | `0` (ephemeral) |
//! | `TCPLINK_BACKLOG` | 4000 |
//! | `TCPLINK_IDLE_MIN` / `TCPLINK_IDLE_MAX` | 4 / 64 |
//! | `TCPLINK_THREAD_MAX` | 256 |
//! | `TCPLINK_THROTTLE_PERIOD_MS` / `_LIMIT` / `_SLEEP_MS` | 1000 / 1024 / 10 |
//! | `TCPLINK_WORKER_IDLE_TIMEOUT_MS` | 60000 |
//! | `TCPLINK_TASK_RETRY` | 3 |
//! | `TCPLINK_ACCEPT_QUEUE` / `TCPLINK_RESUME_QUEUE` | 1024 / 16384 |
//! | `TCPLINK_CONNECTION_MAX` | 1048576 |
//! | `TCPLINK_KEEPALIVE_MAX` | 65536 |
//! | `TCPLINK_KEEPALIVE_TIME_MAX_MS` | 600000 |
//! | `TCPLINK_KEEPALIVE_TIMEOUT_MS` | 120000 |
//! | `TCPLINK_KEEPALIVE_SELECT` | true |
//! | `TCPLINK_KEEPALIVE_SELECT_THREAD_TIMEOUT_MS` | 1000 |
//! | `TCPLINK_SOCKET_TIMEOUT_MS` | 120000 |
//! | `TCPLINK_SUSPEND_TIME_MAX_MS` | 600000 |
//! | `TCPLINK_SUSPEND_CLOSE_TIME_MAX_MS` | 120000 |
//! | `TCPLINK_SUSPEND_REAPER_MS` | 60000 |
//! | `TCPLINK_IDLE_POOL` | 256 |
//! | `TCPLINK_TCP_NODELAY` | true |
//!
//! The throttle and retry numbers are tuning knobs, not correctness
//! constants. Validate them under load for a given deployment.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use crate::env::{env_get, env_get_bool, env_get_millis};
use crate::error::ConfigError;

/// Elastic worker pool settings
#[derive(Debug, Clone)]
pub struct LauncherConfig {
    /// Thread name prefix
    pub name: String,

    /// Acceptor threads kept waiting in `accept()`
    pub idle_min: usize,

    /// Acceptors beyond this give up and return their link
    pub idle_max: usize,

    /// Hard cap on live worker threads
    pub thread_max: usize,

    /// Thread-start rate window
    pub throttle_period: Duration,

    /// Thread starts allowed per window
    pub throttle_limit: usize,

    /// Back-off when the window is exhausted
    pub throttle_sleep: Duration,

    /// Parked workers above `idle_min` retire after this long
    pub idle_timeout: Duration,

    /// Empty polls before a worker parks
    pub task_retry_max: usize,

    pub accept_queue_capacity: usize,
    pub resume_queue_capacity: usize,
}

impl Default for LauncherConfig {
    fn default() -> Self {
        Self {
            name: "tcplink".to_string(),
            idle_min: 4,
            idle_max: 64,
            thread_max: 256,
            throttle_period: Duration::from_millis(1000),
            throttle_limit: 1024,
            throttle_sleep: Duration::from_millis(10),
            idle_timeout: Duration::from_secs(60),
            task_retry_max: 3,
            accept_queue_capacity: 1024,
            resume_queue_capacity: 16 * 1024,
        }
    }
}

impl LauncherConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn idle(mut self, min: usize, max: usize) -> Self {
        self.idle_min = min;
        self.idle_max = max;
        self
    }

    pub fn thread_max(mut self, n: usize) -> Self {
        self.thread_max = n;
        self
    }

    pub fn throttle(mut self, period: Duration, limit: usize, sleep: Duration) -> Self {
        self.throttle_period = period;
        self.throttle_limit = limit;
        self.throttle_sleep = sleep;
        self
    }

    pub fn idle_timeout(mut self, d: Duration) -> Self {
        self.idle_timeout = d;
        self
    }

    pub fn task_retry_max(mut self, n: usize) -> Self {
        self.task_retry_max = n;
        self
    }

    pub fn queues(mut self, accept: usize, resume: usize) -> Self {
        self.accept_queue_capacity = accept;
        self.resume_queue_capacity = resume;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.idle_min == 0 {
            return Err(ConfigError::InvalidValue("idle_min must be at least 1"));
        }
        if self.idle_max <= self.idle_min {
            return Err(ConfigError::InvalidValue("idle_max must exceed idle_min"));
        }
        if self.thread_max < self.idle_max {
            return Err(ConfigError::InvalidValue("thread_max must be at least idle_max"));
        }
        if self.throttle_limit == 0 {
            return Err(ConfigError::InvalidValue("throttle_limit must be at least 1"));
        }
        if self.accept_queue_capacity == 0 || self.resume_queue_capacity == 0 {
            return Err(ConfigError::InvalidValue("queue capacities must be non-zero"));
        }
        Ok(())
    }
}

/// Listener configuration
#[derive(Debug, Clone)]
pub struct PortConfig {
    pub address: IpAddr,

    /// 0 binds an ephemeral port
    pub port: u16,

    pub accept_backlog: i32,

    pub launcher: LauncherConfig,

    /// Bound on concurrently open accepted sockets
    pub connection_max: usize,

    /// Port-wide keepalive slots
    pub keepalive_max: usize,

    /// Total lifetime of one connection before keepalive is refused
    pub keepalive_time_max: Duration,

    /// Idle wait for the next request on a kept-alive connection
    pub keepalive_timeout: Duration,

    /// Hand idle keepalive links to the selector instead of blocking a thread
    pub keepalive_select_enable: bool,

    /// Short blocking read attempted before selector registration
    pub keepalive_select_thread_timeout: Duration,

    pub socket_timeout: Duration,

    /// Deadline for a suspended comet cycle
    pub suspend_time_max: Duration,

    /// Suspended links whose peer hung up are completed after this long
    pub suspend_close_time_max: Duration,

    pub suspend_reaper_interval: Duration,

    /// Recycled links kept for reuse
    pub idle_pool_capacity: usize,

    pub tcp_nodelay: bool,
}

impl Default for PortConfig {
    fn default() -> Self {
        Self {
            address: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: 0,
            accept_backlog: 4000,
            launcher: LauncherConfig::default(),
            connection_max: 1024 * 1024,
            keepalive_max: 65536,
            keepalive_time_max: Duration::from_secs(600),
            keepalive_timeout: Duration::from_secs(120),
            keepalive_select_enable: true,
            keepalive_select_thread_timeout: Duration::from_secs(1),
            socket_timeout: Duration::from_secs(120),
            suspend_time_max: Duration::from_secs(600),
            suspend_close_time_max: Duration::from_secs(120),
            suspend_reaper_interval: Duration::from_secs(60),
            idle_pool_capacity: 256,
            tcp_nodelay: true,
        }
    }
}

impl PortConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Defaults overridden by `TCPLINK_*` environment variables
    pub fn from_env() -> Self {
        let d = Self::default();
        let l = d.launcher.clone();

        Self {
            address: env_get("TCPLINK_ADDRESS", d.address),
            port: env_get("TCPLINK_PORT", d.port),
            accept_backlog: env_get("TCPLINK_BACKLOG", d.accept_backlog),
            launcher: LauncherConfig {
                name: l.name,
                idle_min: env_get("TCPLINK_IDLE_MIN", l.idle_min),
                idle_max: env_get("TCPLINK_IDLE_MAX", l.idle_max),
                thread_max: env_get("TCPLINK_THREAD_MAX", l.thread_max),
                throttle_period: env_get_millis("TCPLINK_THROTTLE_PERIOD_MS", l.throttle_period),
                throttle_limit: env_get("TCPLINK_THROTTLE_LIMIT", l.throttle_limit),
                throttle_sleep: env_get_millis("TCPLINK_THROTTLE_SLEEP_MS", l.throttle_sleep),
                idle_timeout: env_get_millis("TCPLINK_WORKER_IDLE_TIMEOUT_MS", l.idle_timeout),
                task_retry_max: env_get("TCPLINK_TASK_RETRY", l.task_retry_max),
                accept_queue_capacity: env_get("TCPLINK_ACCEPT_QUEUE", l.accept_queue_capacity),
                resume_queue_capacity: env_get("TCPLINK_RESUME_QUEUE", l.resume_queue_capacity),
            },
            connection_max: env_get("TCPLINK_CONNECTION_MAX", d.connection_max),
            keepalive_max: env_get("TCPLINK_KEEPALIVE_MAX", d.keepalive_max),
            keepalive_time_max: env_get_millis("TCPLINK_KEEPALIVE_TIME_MAX_MS", d.keepalive_time_max),
            keepalive_timeout: env_get_millis("TCPLINK_KEEPALIVE_TIMEOUT_MS", d.keepalive_timeout),
            keepalive_select_enable: env_get_bool(
                "TCPLINK_KEEPALIVE_SELECT",
                d.keepalive_select_enable,
            ),
            keepalive_select_thread_timeout: env_get_millis(
                "TCPLINK_KEEPALIVE_SELECT_THREAD_TIMEOUT_MS",
                d.keepalive_select_thread_timeout,
            ),
            socket_timeout: env_get_millis("TCPLINK_SOCKET_TIMEOUT_MS", d.socket_timeout),
            suspend_time_max: env_get_millis("TCPLINK_SUSPEND_TIME_MAX_MS", d.suspend_time_max),
            suspend_close_time_max: env_get_millis(
                "TCPLINK_SUSPEND_CLOSE_TIME_MAX_MS",
                d.suspend_close_time_max,
            ),
            suspend_reaper_interval: env_get_millis(
                "TCPLINK_SUSPEND_REAPER_MS",
                d.suspend_reaper_interval,
            ),
            idle_pool_capacity: env_get("TCPLINK_IDLE_POOL", d.idle_pool_capacity),
            tcp_nodelay: env_get_bool("TCPLINK_TCP_NODELAY", d.tcp_nodelay),
        }
    }

    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.address, self.port)
    }

    /// Parse and set the bind address
    pub fn bind(mut self, addr: &str) -> Result<Self, ConfigError> {
        let parsed: SocketAddr = addr
            .parse()
            .map_err(|_| ConfigError::InvalidAddress(addr.to_string()))?;
        self.address = parsed.ip();
        self.port = parsed.port();
        Ok(self)
    }

    pub fn address(mut self, addr: IpAddr) -> Self {
        self.address = addr;
        self
    }

    pub fn port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn accept_backlog(mut self, n: i32) -> Self {
        self.accept_backlog = n;
        self
    }

    pub fn launcher(mut self, launcher: LauncherConfig) -> Self {
        self.launcher = launcher;
        self
    }

    pub fn accept_idle(mut self, min: usize, max: usize) -> Self {
        self.launcher.idle_min = min;
        self.launcher.idle_max = max;
        self
    }

    pub fn thread_max(mut self, n: usize) -> Self {
        self.launcher.thread_max = n;
        self
    }

    pub fn connection_max(mut self, n: usize) -> Self {
        self.connection_max = n;
        self
    }

    pub fn keepalive_max(mut self, n: usize) -> Self {
        self.keepalive_max = n;
        self
    }

    pub fn keepalive_time_max(mut self, d: Duration) -> Self {
        self.keepalive_time_max = d;
        self
    }

    pub fn keepalive_timeout(mut self, d: Duration) -> Self {
        self.keepalive_timeout = d;
        self
    }

    pub fn keepalive_select(mut self, enable: bool) -> Self {
        self.keepalive_select_enable = enable;
        self
    }

    pub fn keepalive_select_thread_timeout(mut self, d: Duration) -> Self {
        self.keepalive_select_thread_timeout = d;
        self
    }

    pub fn socket_timeout(mut self, d: Duration) -> Self {
        self.socket_timeout = d;
        self
    }

    pub fn suspend_time_max(mut self, d: Duration) -> Self {
        self.suspend_time_max = d;
        self
    }

    pub fn suspend_close_time_max(mut self, d: Duration) -> Self {
        self.suspend_close_time_max = d;
        self
    }

    pub fn suspend_reaper_interval(mut self, d: Duration) -> Self {
        self.suspend_reaper_interval = d;
        self
    }

    pub fn idle_pool_capacity(mut self, n: usize) -> Self {
        self.idle_pool_capacity = n;
        self
    }

    pub fn tcp_nodelay(mut self, enable: bool) -> Self {
        self.tcp_nodelay = enable;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.launcher.validate()?;

        if self.accept_backlog <= 0 {
            return Err(ConfigError::InvalidValue("accept_backlog must be positive"));
        }
        if self.connection_max == 0 {
            return Err(ConfigError::InvalidValue("connection_max must be at least 1"));
        }
        if self.keepalive_timeout.is_zero() {
            return Err(ConfigError::InvalidValue("keepalive_timeout must be non-zero"));
        }
        if self.socket_timeout.is_zero() {
            return Err(ConfigError::InvalidValue("socket_timeout must be non-zero"));
        }
        if self.suspend_reaper_interval.is_zero() {
            return Err(ConfigError::InvalidValue("suspend_reaper_interval must be non-zero"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        let config = PortConfig::new();
        assert!(config.validate().is_ok());
        assert_eq!(config.launcher.idle_min, 4);
        assert_eq!(config.launcher.resume_queue_capacity, 16384);
        assert_eq!(config.keepalive_timeout, Duration::from_secs(120));
    }

    #[test]
    fn test_builder() {
        let config = PortConfig::new()
            .bind("127.0.0.1:8085")
            .unwrap()
            .accept_idle(2, 4)
            .thread_max(8)
            .keepalive_select(false);

        assert_eq!(config.socket_addr().to_string(), "127.0.0.1:8085");
        assert_eq!(config.launcher.thread_max, 8);
        assert!(!config.keepalive_select_enable);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects() {
        let bad = PortConfig::new().accept_idle(0, 4);
        assert_eq!(
            bad.validate(),
            Err(ConfigError::InvalidValue("idle_min must be at least 1"))
        );

        let bad = PortConfig::new().accept_idle(4, 4);
        assert!(bad.validate().is_err());

        let bad = PortConfig::new().accept_idle(2, 16).thread_max(8);
        assert!(bad.validate().is_err());

        let bad = PortConfig::new().suspend_reaper_interval(Duration::ZERO);
        assert!(bad.validate().is_err());

        assert!(PortConfig::new().bind("not an address").is_err());
    }

    #[test]
    fn test_from_env() {
        std::env::set_var("TCPLINK_THREAD_MAX", "32");
        std::env::set_var("TCPLINK_KEEPALIVE_TIMEOUT_MS", "1500");
        std::env::set_var("TCPLINK_ADDRESS", "127.0.0.1");

        let config = PortConfig::from_env();
        assert_eq!(config.launcher.thread_max, 32);
        assert_eq!(config.keepalive_timeout, Duration::from_millis(1500));
        assert_eq!(config.address, IpAddr::V4(Ipv4Addr::LOCALHOST));

        std::env::remove_var("TCPLINK_THREAD_MAX");
        std::env::remove_var("TCPLINK_KEEPALIVE_TIMEOUT_MS");
        std::env::remove_var("TCPLINK_ADDRESS");
    }
}
