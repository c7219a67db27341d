use std::time::Duration;

pub const DEFAULT_PORT: u16 = 6379;
pub const DEFAULT_RW_TIMEOUT: Duration = Duration::from_secs(5);
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(5 * 60);
pub const DEFAULT_BUFFER_SIZE: usize = 16 * 1024;
pub const DEFAULT_ACCEPT_BACKOFF: Duration = Duration::from_secs(1);
pub const DEFAULT_MAX_ACCEPT_BACKOFF: Duration = Duration::from_secs(64);

/// Server settings. How they are loaded is up to the caller; the `beam` binary reads them
/// from the command line and the environment.
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    /// Address the listener binds to, as `host:port`.
    pub addr: String,
    /// Deadline for every single read and write on a connection.
    pub rw_timeout: Duration,
    /// A connection that decodes no command for this long is closed.
    pub idle_timeout: Duration,
    /// Capacity of the per-connection read buffer. A single command that does not fit is
    /// rejected and its connection closed.
    pub buffer_size: usize,
    /// First pause after a transient accept error. It doubles on every consecutive failure.
    pub accept_backoff: Duration,
    /// Cap for the accept backoff.
    pub max_accept_backoff: Duration,
}

impl Config {
    pub fn new(addr: impl Into<String>) -> Config {
        Config {
            addr: addr.into(),
            ..Config::default()
        }
    }

    pub fn with_rw_timeout(mut self, timeout: Duration) -> Config {
        self.rw_timeout = timeout;
        self
    }

    pub fn with_idle_timeout(mut self, timeout: Duration) -> Config {
        self.idle_timeout = timeout;
        self
    }

    pub fn with_buffer_size(mut self, size: usize) -> Config {
        self.buffer_size = size;
        self
    }

    pub fn with_accept_backoff(mut self, initial: Duration, max: Duration) -> Config {
        self.accept_backoff = initial;
        self.max_accept_backoff = max;
        self
    }

    /// Replaces zero values with their defaults.
    pub fn normalized(mut self) -> Config {
        if self.rw_timeout.is_zero() {
            self.rw_timeout = DEFAULT_RW_TIMEOUT;
        }
        if self.idle_timeout.is_zero() {
            self.idle_timeout = DEFAULT_IDLE_TIMEOUT;
        }
        if self.buffer_size == 0 {
            self.buffer_size = DEFAULT_BUFFER_SIZE;
        }
        if self.accept_backoff.is_zero() {
            self.accept_backoff = DEFAULT_ACCEPT_BACKOFF;
        }
        if self.max_accept_backoff < self.accept_backoff {
            self.max_accept_backoff = self.accept_backoff;
        }
        self
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            addr: format!("127.0.0.1:{}", DEFAULT_PORT),
            rw_timeout: DEFAULT_RW_TIMEOUT,
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            buffer_size: DEFAULT_BUFFER_SIZE,
            accept_backoff: DEFAULT_ACCEPT_BACKOFF,
            max_accept_backoff: DEFAULT_MAX_ACCEPT_BACKOFF,
        }
    }
}
