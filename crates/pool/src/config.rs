use std::time::Duration;

use engine::{RuntimeConfig, TransportKind};

/// Configuration for the isolate manager
#[derive(Clone, Debug)]
pub struct PoolConfig {
    /// How the proxy talks to isolates
    pub transport: TransportKind,
    /// First port tried for loopback isolates
    pub port_start: u16,
    /// Last port tried (inclusive)
    pub port_end: u16,
    /// Max wait for a new isolate's health endpoint
    pub health_timeout: Duration,
    /// Delay between health checks
    pub health_interval: Duration,
    /// Spawn attempts before giving up, each on a fresh port
    pub spawn_attempts: u32,
    /// Program started for each isolate by the process launcher
    pub command: Option<String>,
    pub args: Vec<String>,
    /// Sandboxing flags handed to every isolate
    pub permissions: Vec<String>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            transport: TransportKind::Http,
            port_start: 9100,
            port_end: 9999,
            health_timeout: Duration::from_secs(60),
            health_interval: Duration::from_millis(100),
            spawn_attempts: 3,
            command: None,
            args: Vec::new(),
            permissions: Vec::new(),
        }
    }
}

impl PoolConfig {
    /// Create config from environment variables
    ///
    /// Environment variables:
    /// - ISOLATE_PORT_START / ISOLATE_PORT_END: port range
    /// - ISOLATE_HEALTH_TIMEOUT_MS: readiness timeout in ms
    /// - ISOLATE_HEALTH_INTERVAL_MS: health check interval in ms
    /// - ISOLATE_SPAWN_ATTEMPTS: spawn attempts per cold start
    pub fn from_env() -> Self {
        Self::default().with_env()
    }

    /// `[pool]` section of the runtime config, then the environment.
    pub fn from_runtime(config: &RuntimeConfig) -> Self {
        let mut pool = Self::default();
        if let Some(section) = &config.pool {
            if let Some(transport) = section.transport {
                pool.transport = transport;
            }
            if let Some(start) = section.port_start {
                pool.port_start = start;
            }
            if let Some(end) = section.port_end {
                pool.port_end = end;
            }
            if let Some(ms) = section.health_timeout_ms {
                pool.health_timeout = Duration::from_millis(ms);
            }
            if let Some(ms) = section.health_interval_ms {
                pool.health_interval = Duration::from_millis(ms);
            }
            if let Some(attempts) = section.spawn_attempts {
                pool.spawn_attempts = attempts;
            }
            pool.command = section.command.clone();
            pool.args = section.args.clone();
            pool.permissions = section.permissions.clone();
        }
        pool.with_env()
    }

    fn with_env(mut self) -> Self {
        if let Some(start) = env_parse("ISOLATE_PORT_START") {
            self.port_start = start;
        }
        if let Some(end) = env_parse("ISOLATE_PORT_END") {
            self.port_end = end;
        }
        if let Some(ms) = env_parse("ISOLATE_HEALTH_TIMEOUT_MS") {
            self.health_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = env_parse("ISOLATE_HEALTH_INTERVAL_MS") {
            self.health_interval = Duration::from_millis(ms);
        }
        if let Some(attempts) = env_parse("ISOLATE_SPAWN_ATTEMPTS") {
            self.spawn_attempts = attempts;
        }
        self.normalized()
    }

    fn normalized(mut self) -> Self {
        if self.port_end < self.port_start {
            std::mem::swap(&mut self.port_start, &mut self.port_end);
        }
        self.spawn_attempts = self.spawn_attempts.max(1);
        if self.health_interval.is_zero() {
            self.health_interval = Duration::from_millis(100);
        }
        self
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|value| value.trim().parse().ok())
}
