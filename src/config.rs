use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::endpoint::Endpoint;

/// Connection type whose keystore alias is presented by the THL server to
/// downstream replicators.
pub const PRIMARY_DISTRIBUTION_ALIAS: &str = "replicator.master.to.slave";

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    pub server: ServerConfig,
    #[serde(default)]
    pub security: Option<SecurityConfig>,
    #[serde(default)]
    pub filter: Option<FilterConfig>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    pub uri: String,
    /// Name given to the in-process log store when the server runs
    /// standalone. Clients see whatever name the store reports.
    #[serde(default = "default_store_name")]
    pub store_name: String,
    #[serde(default = "default_protocol")]
    pub protocol: String,
    #[serde(default = "default_handshake_timeout_ms")]
    pub handshake_timeout_ms: u64,
    #[serde(default = "default_handler_stop_timeout_ms")]
    pub handler_stop_timeout_ms: u64,
    #[serde(default = "default_accept_stop_timeout_ms")]
    pub accept_stop_timeout_ms: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct SecurityConfig {
    /// Directory holding `<alias>.crt` / `<alias>.key` PEM pairs.
    #[serde(default)]
    pub keystore_dir: Option<PathBuf>,
    /// PEM file with the CA certificates clients trust.
    #[serde(default)]
    pub truststore: Option<PathBuf>,
    /// `login=secret` file consulted to authenticate encrypted connections.
    #[serde(default)]
    pub password_file: Option<PathBuf>,
    #[serde(default = "default_enabled_protocols")]
    pub enabled_protocols: Vec<String>,
    /// Empty means every suite the crypto provider supports.
    #[serde(default)]
    pub enabled_cipher_suites: Vec<String>,
    /// Connection type -> keystore alias.
    #[serde(default)]
    pub aliases: HashMap<String, String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct FilterConfig {
    pub catalog_schema: String,
}

impl Config {
    pub fn from_file<P: AsRef<Path>>(path: P) -> crate::Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::from(path.as_ref()))
            .add_source(
                config::Environment::with_prefix("THL_SERVER")
                    .prefix_separator("_")
                    .separator("__"),
            )
            .build()?;

        Ok(settings.try_deserialize()?)
    }

    /// Minimal configuration serving `uri` with every other setting at its
    /// default.
    pub fn new(uri: impl Into<String>) -> Self {
        Self {
            server: ServerConfig::new(uri),
            security: None,
            filter: None,
        }
    }

    pub fn with_security(mut self, security: SecurityConfig) -> Self {
        self.security = Some(security);
        self
    }

    pub fn with_catalog_schema(mut self, schema: impl Into<String>) -> Self {
        self.filter = Some(FilterConfig {
            catalog_schema: schema.into(),
        });
        self
    }

    pub fn with_protocol(mut self, protocol: impl Into<String>) -> Self {
        self.server.protocol = protocol.into();
        self
    }

    pub fn endpoint(&self) -> crate::Result<Endpoint> {
        Endpoint::parse(&self.server.uri)
    }
}

impl ServerConfig {
    pub fn new(uri: impl Into<String>) -> Self {
        Self {
            uri: uri.into(),
            store_name: default_store_name(),
            protocol: default_protocol(),
            handshake_timeout_ms: default_handshake_timeout_ms(),
            handler_stop_timeout_ms: default_handler_stop_timeout_ms(),
            accept_stop_timeout_ms: default_accept_stop_timeout_ms(),
        }
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    pub fn handler_stop_timeout(&self) -> Duration {
        Duration::from_millis(self.handler_stop_timeout_ms)
    }

    pub fn accept_stop_timeout(&self) -> Duration {
        Duration::from_millis(self.accept_stop_timeout_ms)
    }
}

impl SecurityConfig {
    /// Keystore alias configured for `connection_type`, if any.
    pub fn alias_for(&self, connection_type: &str) -> Option<&str> {
        self.aliases.get(connection_type).map(String::as_str)
    }
}

fn default_store_name() -> String {
    "thl".to_string()
}

fn default_protocol() -> String {
    "thl".to_string()
}

fn default_handshake_timeout_ms() -> u64 {
    10_000
}

fn default_handler_stop_timeout_ms() -> u64 {
    5_000
}

fn default_accept_stop_timeout_ms() -> u64 {
    5_000
}

fn default_enabled_protocols() -> Vec<String> {
    vec!["TLSv1.3".to_string(), "TLSv1.2".to_string()]
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::Builder;

    #[test]
    fn test_from_file_with_defaults() {
        let mut file = Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            r#"
[server]
uri = "thls://0.0.0.0:2112"

[security]
keystore_dir = "/etc/thl/keystore"
truststore = "/etc/thl/truststore.pem"
password_file = "/etc/thl/passwords"

[security.aliases]
"replicator.master.to.slave" = "replicator"

[filter]
catalog_schema = "tungsten_alpha"
"#
        )
        .unwrap();

        let config = Config::from_file(file.path()).unwrap();
        assert_eq!(config.server.store_name, "thl");
        assert_eq!(config.server.protocol, "thl");
        assert_eq!(config.server.handler_stop_timeout(), Duration::from_secs(5));
        assert!(config.endpoint().unwrap().is_secure());

        let security = config.security.unwrap();
        assert_eq!(security.alias_for(PRIMARY_DISTRIBUTION_ALIAS), Some("replicator"));
        assert_eq!(security.enabled_protocols, vec!["TLSv1.3", "TLSv1.2"]);
        assert!(security.enabled_cipher_suites.is_empty());
        assert_eq!(config.filter.unwrap().catalog_schema, "tungsten_alpha");
    }

    #[test]
    fn test_missing_uri_is_error() {
        let mut file = Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(file, "[server]\nstore_name = \"alpha\"").unwrap();
        assert!(matches!(
            Config::from_file(file.path()),
            Err(crate::Error::ConfigLoad(_))
        ));
    }
}
