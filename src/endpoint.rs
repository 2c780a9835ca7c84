use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Port used when an endpoint URI does not carry one.
pub const DEFAULT_PORT: u16 = 2112;

/// URI scheme of plaintext THL endpoints.
pub const PLAINTEXT_SCHEME: &str = "thl";

/// URI scheme of TLS-protected THL endpoints.
pub const SECURE_SCHEME: &str = "thls";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Scheme {
    Plaintext,
    Secure,
}

impl Scheme {
    pub fn as_str(&self) -> &'static str {
        match self {
            Scheme::Plaintext => PLAINTEXT_SCHEME,
            Scheme::Secure => SECURE_SCHEME,
        }
    }

    pub fn is_secure(&self) -> bool {
        matches!(self, Scheme::Secure)
    }
}

/// Network location of a THL server, e.g. `thls://db1.example.com:2112`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub scheme: Scheme,
    pub host: String,
    pub port: u16,
}

impl Endpoint {
    pub fn new(scheme: Scheme, host: impl Into<String>, port: u16) -> Self {
        Self {
            scheme,
            host: host.into(),
            port,
        }
    }

    pub fn parse(uri: &str) -> Result<Self> {
        let (scheme, rest) = uri
            .split_once("://")
            .ok_or_else(|| Error::Config(format!("Malformed URI: {}", uri)))?;

        let scheme = match scheme.to_ascii_lowercase().as_str() {
            PLAINTEXT_SCHEME => Scheme::Plaintext,
            SECURE_SCHEME => Scheme::Secure,
            other => return Err(Error::Config(format!("Unsupported scheme {}", other))),
        };

        // Anything after the authority (path, query) carries no meaning here.
        let authority = rest.split(['/', '?', '#']).next().unwrap_or_default();
        if authority.is_empty() {
            return Err(Error::Config(format!("Malformed URI, no host: {}", uri)));
        }

        let (host, port) = split_host_port(authority, uri)?;
        Ok(Self::new(scheme, host, port.unwrap_or(DEFAULT_PORT)))
    }

    pub fn is_secure(&self) -> bool {
        self.scheme.is_secure()
    }

    /// Address suitable for `TcpListener::bind` / `TcpStream::connect`.
    pub fn socket_address(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }

    pub fn with_port(&self, port: u16) -> Self {
        Self {
            port,
            ..self.clone()
        }
    }
}

fn split_host_port<'a>(authority: &'a str, uri: &str) -> Result<(&'a str, Option<u16>)> {
    // Bracketed IPv6 literal: [::1]:2112
    if let Some(stripped) = authority.strip_prefix('[') {
        let (host, tail) = stripped
            .split_once(']')
            .ok_or_else(|| Error::Config(format!("Malformed URI: {}", uri)))?;
        return match tail.strip_prefix(':') {
            Some(port) => Ok((host, Some(parse_port(port, uri)?))),
            None if tail.is_empty() => Ok((host, None)),
            None => Err(Error::Config(format!("Malformed URI: {}", uri))),
        };
    }

    match authority.rsplit_once(':') {
        Some((host, port)) if !host.is_empty() => Ok((host, Some(parse_port(port, uri)?))),
        Some(_) => Err(Error::Config(format!("Malformed URI, no host: {}", uri))),
        None => Ok((authority, None)),
    }
}

fn parse_port(port: &str, uri: &str) -> Result<u16> {
    port.parse::<u16>()
        .map_err(|_| Error::Config(format!("Malformed URI, bad port '{}': {}", port, uri)))
}

impl FromStr for Endpoint {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Endpoint::parse(s)
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}", self.scheme.as_str(), self.socket_address())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_plaintext_with_port() {
        let endpoint = Endpoint::parse("thl://localhost:2113").unwrap();
        assert_eq!(endpoint.scheme, Scheme::Plaintext);
        assert_eq!(endpoint.host, "localhost");
        assert_eq!(endpoint.port, 2113);
        assert!(!endpoint.is_secure());
    }

    #[test]
    fn test_parse_secure_default_port() {
        let endpoint = Endpoint::parse("thls://db1.example.com").unwrap();
        assert_eq!(endpoint.scheme, Scheme::Secure);
        assert_eq!(endpoint.port, DEFAULT_PORT);
        assert_eq!(endpoint.socket_address(), "db1.example.com:2112");
    }

    #[test]
    fn test_parse_ignores_path() {
        let endpoint = Endpoint::parse("thl://0.0.0.0:0/ignored?x=1").unwrap();
        assert_eq!(endpoint.host, "0.0.0.0");
        assert_eq!(endpoint.port, 0);
    }

    #[test]
    fn test_parse_ipv6() {
        let endpoint = Endpoint::parse("thl://[::1]:2200").unwrap();
        assert_eq!(endpoint.host, "::1");
        assert_eq!(endpoint.port, 2200);
        assert_eq!(endpoint.socket_address(), "[::1]:2200");
        assert_eq!(endpoint.to_string(), "thl://[::1]:2200");
    }

    #[test]
    fn test_unsupported_scheme() {
        let err = Endpoint::parse("http://localhost:2112").unwrap_err();
        assert!(matches!(err, Error::Config(msg) if msg.contains("Unsupported scheme")));
    }

    #[test]
    fn test_malformed_uris() {
        for uri in ["localhost:2112", "thl://", "thl://:2112", "thl://host:notaport", "thl://host:70000"] {
            assert!(
                matches!(Endpoint::parse(uri), Err(Error::Config(_))),
                "expected config error for {}",
                uri
            );
        }
    }
}
