//! Media dispatcher configuration

use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;

use super::ports::PortRange;

/// Default cap on the reserved-port queue
pub const MAX_RESERVED_PORTS: usize = 10;

/// Default interval between consumer bootstrap retries
pub const RETRY_INTERVAL: Duration = Duration::from_millis(1000);

/// Media dispatcher configuration options
#[derive(Debug, Clone)]
pub struct MediaConfig {
    /// Broker host the dispatcher consumes on
    pub host: String,

    /// Address streaming listener sockets bind to
    pub bind_ip: IpAddr,

    /// Port selection mode for the reserved-port pool
    pub port_range: PortRange,

    /// Cap on the reserved-port queue
    pub max_reserved_ports: usize,

    /// Interval between consumer bootstrap retries
    pub retry_interval: Duration,

    /// Database implied when a media name carries none
    pub default_db: String,

    /// Client-process identity the dispatcher registers with the
    /// session manager
    pub server_id: String,
}

impl Default for MediaConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            bind_ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port_range: PortRange::Any,
            max_reserved_ports: MAX_RESERVED_PORTS,
            retry_interval: RETRY_INTERVAL,
            default_db: "media".to_string(),
            server_id: "media-dispatcher".to_string(),
        }
    }
}

impl MediaConfig {
    /// Config with a custom broker host
    pub fn with_host(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            ..Default::default()
        }
    }

    /// Set the listener bind address
    pub fn bind_ip(mut self, ip: IpAddr) -> Self {
        self.bind_ip = ip;
        self
    }

    /// Set the port selection mode
    pub fn port_range(mut self, range: PortRange) -> Self {
        self.port_range = range;
        self
    }

    /// Set the reserved-port cap
    pub fn max_reserved_ports(mut self, max: usize) -> Self {
        self.max_reserved_ports = max;
        self
    }

    /// Set the bootstrap retry interval
    pub fn retry_interval(mut self, interval: Duration) -> Self {
        self.retry_interval = interval;
        self
    }

    /// Set the default media database
    pub fn default_db(mut self, db: impl Into<String>) -> Self {
        self.default_db = db.into();
        self
    }

    /// Set the dispatcher's client-process identity
    pub fn server_id(mut self, id: impl Into<String>) -> Self {
        self.server_id = id.into();
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = MediaConfig::default();

        assert_eq!(config.max_reserved_ports, MAX_RESERVED_PORTS);
        assert_eq!(config.retry_interval, Duration::from_millis(1000));
        assert_eq!(config.default_db, "media");
        assert_eq!(config.server_id, "media-dispatcher");
        assert!(matches!(config.port_range, PortRange::Any));
    }

    #[test]
    fn test_builder_chaining() {
        let config = MediaConfig::with_host("rabbit-1")
            .port_range(PortRange::Range(9000, 9010))
            .max_reserved_ports(4)
            .retry_interval(Duration::from_millis(250))
            .default_db("system_media")
            .server_id("media-1");

        assert_eq!(config.host, "rabbit-1");
        assert!(matches!(config.port_range, PortRange::Range(9000, 9010)));
        assert_eq!(config.max_reserved_ports, 4);
        assert_eq!(config.default_db, "system_media");
        assert_eq!(config.server_id, "media-1");
    }
}
