//! Peer locations: `<ocapn-node transport address hints>`.

use crate::descriptors::{expect_record, field_bool, field_str};
use crate::error::{WireError, WireResult};
use ocapn_types::Value;
use std::fmt;
use std::net::SocketAddr;

/// Transport name of the plain TCP netlayer.
pub const TCP_TRANSPORT: &str = "tcp-testing-only";

/// Where a peer can be reached. Also the object signed during the handshake.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Location {
    pub transport: String,
    pub address: String,
    pub hints: bool,
}

impl Location {
    pub fn new(transport: impl Into<String>, address: impl Into<String>) -> Self {
        Self {
            transport: transport.into(),
            address: address.into(),
            hints: false,
        }
    }

    pub fn tcp(address: impl Into<String>) -> Self {
        Self::new(TCP_TRANSPORT, address)
    }

    /// Registry key: `transport:address`.
    pub fn id(&self) -> String {
        format!("{}:{}", self.transport, self.address)
    }

    pub fn socket_addr(&self) -> WireResult<SocketAddr> {
        if self.transport != TCP_TRANSPORT {
            return Err(WireError::Protocol(format!(
                "unsupported transport: {}",
                self.transport
            )));
        }
        self.address
            .parse()
            .map_err(|e| WireError::InvalidDescriptor(format!("bad address {}: {e}", self.address)))
    }

    pub fn to_value(&self) -> Value {
        Value::record(
            "ocapn-node",
            vec![
                Value::symbol(self.transport.clone()),
                Value::string(self.address.clone()),
                Value::Boolean(self.hints),
            ],
        )
    }

    pub fn from_value(value: &Value) -> WireResult<Self> {
        let fields = expect_record(value, "ocapn-node", 3)?;
        let transport = fields[0]
            .as_symbol()
            .ok_or_else(|| WireError::InvalidDescriptor("location transport must be a selector".into()))?;
        Ok(Self {
            transport: transport.to_string(),
            address: field_str(&fields[1], "location address")?.to_string(),
            hints: field_bool(&fields[2], "location hints")?,
        })
    }
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.id())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_location_value_roundtrip() {
        let location = Location::tcp("127.0.0.1:7000");
        assert_eq!(location.id(), "tcp-testing-only:127.0.0.1:7000");
        let value = location.to_value();
        assert_eq!(
            value.to_string(),
            "<ocapn-node 'tcp-testing-only \"127.0.0.1:7000\" false>"
        );
        assert_eq!(Location::from_value(&value).unwrap(), location);
        assert_eq!(location.socket_addr().unwrap().port(), 7000);
    }

    #[test]
    fn test_location_rejects_string_transport() {
        let value = Value::record(
            "ocapn-node",
            vec![
                Value::string("tcp-testing-only"),
                Value::string("127.0.0.1:1"),
                Value::Boolean(false),
            ],
        );
        assert!(Location::from_value(&value).is_err());
    }

    #[test]
    fn test_unsupported_transport_has_no_socket_addr() {
        let location = Location::new("onion", "abc.onion");
        assert!(matches!(location.socket_addr(), Err(WireError::Protocol(_))));
    }
}
