//! Endpoint information exposed for every connection

use std::fmt;
use std::net::SocketAddr;

/// Which side of the stream an [`IpInfo`] describes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointKind {
    /// The local end; used when the peer address was unavailable at accept time
    Local,
    Remote,
}

/// Address information of a connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IpInfo {
    address: String,
    endpoint: SocketAddr,
    kind: EndpointKind,
}

impl IpInfo {
    pub fn new(endpoint: SocketAddr, kind: EndpointKind) -> Self {
        Self {
            address: endpoint.ip().to_string(),
            endpoint,
            kind,
        }
    }

    /// Build from the addresses of a stream, preferring the remote end
    pub fn resolve(remote: Option<SocketAddr>, local: Option<SocketAddr>) -> Option<Self> {
        match (remote, local) {
            (Some(addr), _) => Some(Self::new(addr, EndpointKind::Remote)),
            (None, Some(addr)) => Some(Self::new(addr, EndpointKind::Local)),
            (None, None) => None,
        }
    }

    /// Textual IP address
    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn endpoint(&self) -> SocketAddr {
        self.endpoint
    }

    pub fn kind(&self) -> EndpointKind {
        self.kind
    }
}

impl fmt::Display for IpInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.endpoint)
    }
}
