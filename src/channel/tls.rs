//! TLS material loading and explicit identity selection.
//!
//! A keystore is a directory of `<alias>.crt` / `<alias>.key` PEM pairs, so
//! one store can hold distinct identities for distinct logical channels.
//! The server presents exactly the alias configured for its connection
//! type; when that alias is missing every handshake fails instead of
//! falling back to some other identity.

use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use rustls::crypto::CryptoProvider;
use rustls::pki_types::pem::PemObject;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::server::{ClientHello, ResolvesServerCert};
use rustls::sign::CertifiedKey;
use rustls::{ClientConfig, RootCertStore, ServerConfig, SupportedProtocolVersion};
use tokio_rustls::{TlsAcceptor, TlsConnector};
use tracing::{debug, info, warn};
use zeroize::Zeroizing;

use crate::config::SecurityConfig;
use crate::{Error, Result};

const CERT_EXTENSION: &str = "crt";
const KEY_EXTENSION: &str = "key";

/// Identities loaded from a keystore directory, indexed by alias.
pub struct KeyStore {
    location: PathBuf,
    entries: HashMap<String, Arc<CertifiedKey>>,
}

impl KeyStore {
    pub fn load(dir: &Path, provider: &CryptoProvider) -> Result<Self> {
        let listing = fs::read_dir(dir).map_err(|e| {
            Error::Tls(format!("Cannot read keystore {}: {}", dir.display(), e))
        })?;

        let mut entries = HashMap::new();
        for entry in listing {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some(CERT_EXTENSION) {
                continue;
            }
            let Some(alias) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };

            let key_path = path.with_extension(KEY_EXTENSION);
            if !key_path.is_file() {
                return Err(Error::Tls(format!(
                    "Keystore entry '{}' has no private key at {}",
                    alias,
                    key_path.display()
                )));
            }

            let chain = read_certificates(&path)?;
            let key = read_private_key(&key_path)?;
            let signing_key = provider.key_provider.load_private_key(key).map_err(|e| {
                Error::Tls(format!("Unsupported private key for alias '{}': {}", alias, e))
            })?;

            debug!(alias, keystore = %dir.display(), "Loaded keystore entry");
            entries.insert(alias.to_string(), Arc::new(CertifiedKey::new(chain, signing_key)));
        }

        Ok(Self {
            location: dir.to_path_buf(),
            entries,
        })
    }

    pub fn location(&self) -> &Path {
        &self.location
    }

    pub fn contains(&self, alias: &str) -> bool {
        self.entries.contains_key(alias)
    }

    pub fn aliases(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    fn get(&self, alias: &str) -> Option<Arc<CertifiedKey>> {
        self.entries.get(alias).cloned()
    }
}

/// Server certificate resolver that only ever presents one alias.
struct AliasSelector {
    alias: String,
    keystore: PathBuf,
    identity: Option<Arc<CertifiedKey>>,
}

impl fmt::Debug for AliasSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AliasSelector")
            .field("alias", &self.alias)
            .field("keystore", &self.keystore)
            .field("found", &self.identity.is_some())
            .finish()
    }
}

impl ResolvesServerCert for AliasSelector {
    fn resolve(&self, _client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        if self.identity.is_none() {
            warn!(
                alias = %self.alias,
                keystore = %self.keystore.display(),
                "Could not find keystore alias; refusing handshake"
            );
        }
        self.identity.clone()
    }
}

/// Server-side TLS settings presenting one explicitly selected identity.
#[derive(Clone)]
pub struct ServerTls {
    config: Arc<ServerConfig>,
    alias: String,
}

impl ServerTls {
    /// Builds the server TLS configuration for `connection_type`, whose
    /// alias must be mapped in `security.aliases`.
    pub fn from_security(security: &SecurityConfig, connection_type: &str) -> Result<Self> {
        let alias = security.alias_for(connection_type).ok_or_else(|| {
            Error::Config(format!(
                "No keystore alias configured for connection type {}",
                connection_type
            ))
        })?;
        let keystore_dir = security
            .keystore_dir
            .as_deref()
            .ok_or_else(|| Error::Config("security.keystore_dir is required for TLS".to_string()))?;

        let provider = crypto_provider(&security.enabled_cipher_suites)?;
        let versions = protocol_versions(&security.enabled_protocols)?;
        let keystore = KeyStore::load(keystore_dir, &provider)?;
        Self::build(provider, &versions, &keystore, alias)
    }

    fn build(
        provider: CryptoProvider,
        versions: &[&'static SupportedProtocolVersion],
        keystore: &KeyStore,
        alias: &str,
    ) -> Result<Self> {
        let identity = keystore.get(alias);
        if identity.is_none() {
            // Start anyway: the handshake itself reports the missing alias.
            warn!(
                alias,
                keystore = %keystore.location().display(),
                available = ?keystore.aliases().collect::<Vec<_>>(),
                "Configured keystore alias not found; every TLS handshake will fail"
            );
        } else {
            info!(alias, keystore = %keystore.location().display(), "Using keystore alias");
        }

        let resolver = AliasSelector {
            alias: alias.to_string(),
            keystore: keystore.location().to_path_buf(),
            identity,
        };

        let config = ServerConfig::builder_with_provider(Arc::new(provider))
            .with_protocol_versions(versions)
            .map_err(|e| Error::Tls(format!("server config error: {}", e)))?
            .with_no_client_auth()
            .with_cert_resolver(Arc::new(resolver));

        Ok(Self {
            config: Arc::new(config),
            alias: alias.to_string(),
        })
    }

    pub fn alias(&self) -> &str {
        &self.alias
    }

    pub fn acceptor(&self) -> TlsAcceptor {
        TlsAcceptor::from(self.config.clone())
    }
}

/// Client-side TLS settings trusting the configured truststore.
#[derive(Clone)]
pub struct ClientTls {
    config: Arc<ClientConfig>,
}

impl ClientTls {
    pub fn from_security(security: &SecurityConfig) -> Result<Self> {
        let truststore = security
            .truststore
            .as_deref()
            .ok_or_else(|| Error::Config("security.truststore is required for TLS clients".to_string()))?;

        let provider = crypto_provider(&security.enabled_cipher_suites)?;
        let versions = protocol_versions(&security.enabled_protocols)?;

        let mut roots = RootCertStore::empty();
        for cert in read_certificates(truststore)? {
            roots
                .add(cert)
                .map_err(|e| Error::Tls(format!("failed to add trusted certificate: {}", e)))?;
        }

        let config = ClientConfig::builder_with_provider(Arc::new(provider))
            .with_protocol_versions(&versions)
            .map_err(|e| Error::Tls(format!("client config error: {}", e)))?
            .with_root_certificates(roots)
            .with_no_client_auth();

        Ok(Self {
            config: Arc::new(config),
        })
    }

    /// Trusts the certificates in `truststore` with default protocols and
    /// cipher suites.
    pub fn from_truststore(truststore: impl Into<PathBuf>) -> Result<Self> {
        Self::from_security(&SecurityConfig {
            truststore: Some(truststore.into()),
            enabled_protocols: vec!["TLSv1.3".to_string(), "TLSv1.2".to_string()],
            ..Default::default()
        })
    }

    pub fn connector(&self) -> TlsConnector {
        TlsConnector::from(self.config.clone())
    }
}

/// Ring provider restricted to `enabled` cipher suites (all when empty).
fn crypto_provider(enabled: &[String]) -> Result<CryptoProvider> {
    let mut provider = rustls::crypto::ring::default_provider();
    if enabled.is_empty() {
        return Ok(provider);
    }

    provider.cipher_suites.retain(|suite| {
        let name = format!("{:?}", suite.suite());
        enabled.iter().any(|e| e.eq_ignore_ascii_case(&name))
    });
    if provider.cipher_suites.is_empty() {
        return Err(Error::Tls(format!(
            "None of the enabled cipher suites is supported: {:?}",
            enabled
        )));
    }
    Ok(provider)
}

fn protocol_versions(enabled: &[String]) -> Result<Vec<&'static SupportedProtocolVersion>> {
    if enabled.is_empty() {
        return Ok(rustls::DEFAULT_VERSIONS.to_vec());
    }
    let mut versions: Vec<&'static SupportedProtocolVersion> = Vec::new();
    for name in enabled {
        let version = match name.to_ascii_uppercase().replace('_', ".").as_str() {
            "TLSV1.3" | "TLS1.3" | "1.3" => &rustls::version::TLS13,
            "TLSV1.2" | "TLS1.2" | "1.2" => &rustls::version::TLS12,
            _ => {
                warn!(protocol = %name, "Ignoring unsupported TLS protocol");
                continue;
            }
        };
        if !versions.iter().any(|v| v.version == version.version) {
            versions.push(version);
        }
    }

    if versions.is_empty() {
        return Err(Error::Tls(format!(
            "None of the enabled protocols is supported: {:?}",
            enabled
        )));
    }
    Ok(versions)
}

fn read_certificates(path: &Path) -> Result<Vec<CertificateDer<'static>>> {
    let pem = fs::read(path)
        .map_err(|e| Error::Tls(format!("Cannot read {}: {}", path.display(), e)))?;
    let certs = CertificateDer::pem_slice_iter(&pem)
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| Error::Tls(format!("failed to parse certificates in {}: {}", path.display(), e)))?;
    if certs.is_empty() {
        return Err(Error::Tls(format!("no certificates found in {}", path.display())));
    }
    Ok(certs)
}

fn read_private_key(path: &Path) -> Result<PrivateKeyDer<'static>> {
    let pem = Zeroizing::new(
        fs::read(path).map_err(|e| Error::Tls(format!("Cannot read {}: {}", path.display(), e)))?,
    );
    PrivateKeyDer::from_pem_slice(&pem)
        .map_err(|e| Error::Tls(format!("failed to parse private key in {}: {}", path.display(), e)))
}
