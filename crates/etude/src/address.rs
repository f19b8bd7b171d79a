// src/address.rs
//! Listen address parsing: `scheme://host[:port][/path]`.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, ToSocketAddrs};
use std::str::FromStr;

use crate::error::{EngineError, EngineResult};

/// A parsed listen URL. Immutable once parsed.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ServerAddress {
    pub scheme: String,
    pub host: String,
    pub port: u16,
    /// Path base without a trailing slash; empty when absent.
    pub path: String,
    /// Whether the port came from the URL rather than the scheme default.
    pub explicit_port: bool,
}

impl ServerAddress {
    /// Parse a listen URL.
    ///
    /// The host and port are located via `://`, the last `:` before the first
    /// `/` after it, and that first `/`. `http` defaults to port 80, `https`
    /// to 443, and any other scheme to 0.
    pub fn parse(url: &str) -> EngineResult<Self> {
        let Some(scheme_end) = url.find("://") else {
            return Err(EngineError::address(url, "missing '://' scheme separator"));
        };
        let scheme = &url[..scheme_end];
        if scheme.is_empty() {
            return Err(EngineError::address(url, "empty scheme"));
        }

        let rest = &url[scheme_end + 3..];
        let (authority, path) = match rest.find('/') {
            Some(slash) => (&rest[..slash], &rest[slash..]),
            None => (rest, ""),
        };

        // `[::1]` contains colons that do not introduce a port.
        let (host, port_token) = match authority.rfind(':') {
            Some(colon) if !authority[colon..].contains(']') => {
                (&authority[..colon], Some(&authority[colon + 1..]))
            }
            _ => (authority, None),
        };

        if host.is_empty() {
            return Err(EngineError::address(url, "missing host"));
        }

        let scheme = scheme.to_ascii_lowercase();
        let (port, explicit_port) = match port_token {
            Some(token) => {
                let port = token
                    .parse::<u16>()
                    .map_err(|_| EngineError::address(url, format!("invalid port {token:?}")))?;
                (port, true)
            }
            None => (default_port(&scheme), false),
        };

        Ok(Self {
            scheme,
            host: host.to_string(),
            port,
            path: path.trim_end_matches('/').to_string(),
            explicit_port,
        })
    }

    pub fn is_https(&self) -> bool {
        self.scheme == "https"
    }

    /// Resolve the host to a bindable socket address.
    ///
    /// `*`, `+` and `0.0.0.0` bind every IPv4 interface; `localhost` binds
    /// the IPv4 loopback.
    pub fn socket_addr(&self) -> EngineResult<SocketAddr> {
        let host = self.host.trim_start_matches('[').trim_end_matches(']');
        let ip = match host {
            "*" | "+" => Some(IpAddr::V4(Ipv4Addr::UNSPECIFIED)),
            h if h.eq_ignore_ascii_case("localhost") => Some(IpAddr::V4(Ipv4Addr::LOCALHOST)),
            h => h.parse::<IpAddr>().ok(),
        };
        if let Some(ip) = ip {
            return Ok(SocketAddr::new(ip, self.port));
        }

        (host, self.port)
            .to_socket_addrs()
            .map_err(|e| EngineError::address(&self.to_string(), e.to_string()))?
            .next()
            .ok_or_else(|| EngineError::address(&self.to_string(), "host did not resolve"))
    }
}

fn default_port(scheme: &str) -> u16 {
    match scheme {
        "http" => 80,
        "https" => 443,
        _ => 0,
    }
}

impl FromStr for ServerAddress {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for ServerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}:{}{}", self.scheme, self.host, self.port, self.path)
    }
}
