//! Configuration of the connection to the gateway.

use std::time::Duration;

use crate::GpibError;

/// Default TCP port of Prologix Ethernet to GPIB gateways.
pub const DEFAULT_PORT: u16 = 1234;

/// Configuration for a [`crate::PrologixController`].
///
/// Create it with [`GatewayConfig::new`] and adjust the defaults with the `with_*` methods:
///
/// ```
/// use std::time::Duration;
/// use gpibrs::GatewayConfig;
///
/// let config = GatewayConfig::new("192.168.10.20")
///     .with_port(1234)
///     .with_default_timeout(Duration::from_secs(5));
/// assert_eq!(config.socket_addr(), "192.168.10.20:1234");
/// ```
#[derive(Clone, Debug)]
pub struct GatewayConfig {
    host: String,
    port: u16,
    connect_timeout: Duration,
    socket_timeout: Duration,
    eot_char: u8,
    eoi_linger: Duration,
    reader_error_budget: u32,
    channel_warn_threshold: usize,
    default_timeout: Duration,
}

impl GatewayConfig {
    /// Create a new configuration for a gateway with the given host name or IP address.
    pub fn new(host: &str) -> Self {
        Self {
            host: host.to_string(),
            port: DEFAULT_PORT,
            connect_timeout: Duration::from_secs(5),
            socket_timeout: Duration::from_secs(1),
            eot_char: 0xFF,
            eoi_linger: Duration::from_millis(50),
            reader_error_budget: 3,
            channel_warn_threshold: 64 * 1024,
            default_timeout: Duration::from_secs(3),
        }
    }

    /// Create a configuration from a `host` or `host:port` string.
    ///
    /// If no port is given, the default port 1234 is used.
    pub fn from_addr(addr: &str) -> Result<Self, GpibError> {
        let addr = addr.trim();
        if addr.is_empty() {
            return Err(GpibError::InvalidArgument(
                "Gateway address must not be empty.".to_string(),
            ));
        }
        match addr.rsplit_once(':') {
            Some((host, port)) if !host.contains(':') => {
                let port = port.parse().map_err(|_| {
                    GpibError::InvalidArgument(format!("Invalid port in gateway address: {addr}"))
                })?;
                Ok(Self::new(host).with_port(port))
            }
            _ => Ok(Self::new(addr)),
        }
    }

    /// Set the TCP port of the gateway.
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Set the timeout for establishing the TCP connection.
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Set the socket read and write timeout.
    ///
    /// This is not a protocol timeout: it determines how fast the background reader notices that
    /// it should stop or that the socket was replaced.
    pub fn with_socket_timeout(mut self, timeout: Duration) -> Self {
        self.socket_timeout = timeout;
        self
    }

    /// Set the byte that the gateway inserts when it detects EOI during a read.
    pub fn with_eot_char(mut self, eot_char: u8) -> Self {
        self.eot_char = eot_char;
        self
    }

    /// Set how long to wait after an EOT byte before treating it as the end of a transfer.
    pub fn with_eoi_linger(mut self, linger: Duration) -> Self {
        self.eoi_linger = linger;
        self
    }

    /// Set how many socket errors the background reader tolerates before giving up.
    pub fn with_reader_error_budget(mut self, budget: u32) -> Self {
        self.reader_error_budget = budget;
        self
    }

    /// Set the number of buffered bytes above which a warning is logged.
    pub fn with_channel_warn_threshold(mut self, threshold: usize) -> Self {
        self.channel_warn_threshold = threshold;
        self
    }

    /// Set the timeout used for commands that are submitted asynchronously.
    pub fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = timeout;
        self
    }

    /// The gateway address as `host:port`.
    pub fn socket_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Get the host name.
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Get the TCP port.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Get the connect timeout.
    pub fn connect_timeout(&self) -> Duration {
        self.connect_timeout
    }

    /// Get the socket timeout.
    pub fn socket_timeout(&self) -> Duration {
        self.socket_timeout
    }

    /// Get the EOT byte.
    pub fn eot_char(&self) -> u8 {
        self.eot_char
    }

    /// Get the EOI linger window.
    pub fn eoi_linger(&self) -> Duration {
        self.eoi_linger
    }

    /// Get the reader error budget.
    pub fn reader_error_budget(&self) -> u32 {
        self.reader_error_budget
    }

    /// Get the buffered byte count above which a warning is logged.
    pub fn channel_warn_threshold(&self) -> usize {
        self.channel_warn_threshold
    }

    /// Get the timeout for asynchronously submitted commands.
    pub fn default_timeout(&self) -> Duration {
        self.default_timeout
    }
}
