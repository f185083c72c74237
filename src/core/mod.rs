/// Core abstractions shared by the pool, the monitors and the topology
pub mod connection;
pub mod description;
pub mod handshake;
pub mod tls;
pub mod wire;

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::{RutaError, RutaResult};
use crate::utils::split_host_port;

pub use connection::{Connection, Connector, TcpConnector};
pub use description::{NodeDescription, NodeRole};

/// Address of one node, normalized to a lowercase host and explicit port
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ServerAddress {
    host: String,
    port: u16,
}

impl ServerAddress {
    pub fn new<S: Into<String>>(host: S, port: u16) -> Self {
        Self {
            host: host.into().to_ascii_lowercase(),
            port,
        }
    }

    /// Parse `host[:port]`, defaulting the port to 27017
    pub fn parse(input: &str) -> RutaResult<Self> {
        let (host, port) = split_host_port(input).map_err(RutaError::invalid_argument)?;
        Ok(Self { host, port })
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }
}

impl fmt::Display for ServerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

impl FromStr for ServerAddress {
    type Err = RutaError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for ServerAddress {
    type Error = RutaError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<ServerAddress> for String {
    fn from(address: ServerAddress) -> Self {
        address.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_server_address_normalization() {
        let a = ServerAddress::parse("DB1.Example.com").unwrap();
        let b = ServerAddress::new("db1.example.com", 27017);
        assert_eq!(a, b);
        assert_eq!(a.to_string(), "db1.example.com:27017");
    }

    #[test]
    fn test_ipv6_display_round_trips() {
        let address: ServerAddress = "[::1]:27018".parse().unwrap();
        assert_eq!(address.host(), "::1");
        assert_eq!(address.to_string(), "[::1]:27018");
        assert_eq!(ServerAddress::parse(&address.to_string()).unwrap(), address);
    }

    #[test]
    fn test_invalid_address() {
        assert!(matches!(
            ServerAddress::parse("db1:abc"),
            Err(RutaError::InvalidArgument { .. })
        ));
    }
}
