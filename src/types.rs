use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Network identity of any peer in the overlay: a DNS name or IP literal
/// plus a TCP port. Two endpoints are the same node iff host and port match.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NodeEndpoint {
    pub host: String,
    pub port: u16,
}

impl NodeEndpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        NodeEndpoint {
            host: host.into(),
            port,
        }
    }

    /// `host:port` form used for dialing and log output.
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl fmt::Display for NodeEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

impl FromStr for NodeEndpoint {
    type Err = String;

    /// Parse `host:port`. The split is on the last colon so multi-colon
    /// hosts keep their port intact.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (host, port_str) = s
            .rsplit_once(':')
            .ok_or_else(|| format!("'{}' is not host:port", s))?;
        if host.is_empty() {
            return Err(format!("'{}' has an empty host", s));
        }
        let port: u16 = port_str
            .parse()
            .map_err(|_| format!("'{}' has an invalid port", s))?;
        Ok(NodeEndpoint::new(host, port))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_host_port() {
        let ep: NodeEndpoint = "127.0.2.1:6001".parse().unwrap();
        assert_eq!(ep.host, "127.0.2.1");
        assert_eq!(ep.port, 6001);
        assert_eq!(ep.to_string(), "127.0.2.1:6001");
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!("no-port-here".parse::<NodeEndpoint>().is_err());
        assert!(":9000".parse::<NodeEndpoint>().is_err());
        assert!("host:notaport".parse::<NodeEndpoint>().is_err());
    }

    #[test]
    fn test_endpoint_identity() {
        use std::collections::HashSet;
        let mut set = HashSet::new();
        set.insert(NodeEndpoint::new("10.0.0.1", 6001));
        set.insert(NodeEndpoint::new("10.0.0.1", 6001));
        set.insert(NodeEndpoint::new("10.0.0.1", 6002));
        assert_eq!(set.len(), 2);
    }
}
