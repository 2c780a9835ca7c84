#![allow(dead_code)]

use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

use rcgen::{BasicConstraints, CertificateParams, DnType, IsCa, KeyPair};
use serde_json::json;
use tempfile::TempDir;
use thl_server::config::{Config, SecurityConfig, PRIMARY_DISTRIBUTION_ALIAS};
use thl_server::endpoint::{Endpoint, Scheme};
use thl_server::store::{DbmsData, LogRecord, RowAction, RowChange, Statement};
use thl_server::{DistributionServer, LogStore, MemoryLogStore};

pub const TEST_LOGIN: &str = "tungsten";
pub const TEST_SECRET: &str = "secret";

pub fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter("thl_server=debug")
        .try_init()
        .ok();
}

/// CA, keystore and truststore written to a temporary directory.
pub struct TestPki {
    dir: TempDir,
    pub keystore_dir: PathBuf,
    pub truststore: PathBuf,
    pub password_file: PathBuf,
}

impl TestPki {
    /// One leaf certificate for `localhost`/`127.0.0.1` per alias, all
    /// signed by the same CA.
    pub fn new(aliases: &[&str]) -> Self {
        let dir = TempDir::new().unwrap();
        let keystore_dir = dir.path().join("keystore");
        fs::create_dir(&keystore_dir).unwrap();

        let mut ca_params = CertificateParams::default();
        ca_params
            .distinguished_name
            .push(DnType::CommonName, "THL Test CA");
        ca_params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        let ca_key = KeyPair::generate().unwrap();
        let ca_cert = ca_params.self_signed(&ca_key).unwrap();

        for alias in aliases {
            let mut params =
                CertificateParams::new(vec!["localhost".to_string(), "127.0.0.1".to_string()])
                    .unwrap();
            params.distinguished_name.push(DnType::CommonName, *alias);
            let key = KeyPair::generate().unwrap();
            let cert = params.signed_by(&key, &ca_cert, &ca_key).unwrap();

            fs::write(keystore_dir.join(format!("{}.crt", alias)), cert.pem()).unwrap();
            fs::write(keystore_dir.join(format!("{}.key", alias)), key.serialize_pem()).unwrap();
        }

        let truststore = dir.path().join("truststore.pem");
        fs::write(&truststore, ca_cert.pem()).unwrap();

        let password_file = dir.path().join("passwords.properties");
        fs::write(
            &password_file,
            format!("# THL logins\n{}={}\n", TEST_LOGIN, TEST_SECRET),
        )
        .unwrap();

        Self {
            dir,
            keystore_dir,
            truststore,
            password_file,
        }
    }

    /// Security settings presenting `alias` for the distribution channel.
    pub fn security(&self, alias: &str) -> SecurityConfig {
        let mut security = SecurityConfig {
            keystore_dir: Some(self.keystore_dir.clone()),
            truststore: Some(self.truststore.clone()),
            password_file: Some(self.password_file.clone()),
            enabled_protocols: vec!["TLSv1.3".to_string(), "TLSv1.2".to_string()],
            ..Default::default()
        };
        security
            .aliases
            .insert(PRIMARY_DISTRIBUTION_ALIAS.to_string(), alias.to_string());
        security
    }
}

pub fn plaintext_config(protocol: &str) -> Config {
    Config::new("thl://127.0.0.1:0").with_protocol(protocol)
}

pub fn secure_config(pki: &TestPki, alias: &str, protocol: &str) -> Config {
    Config::new("thls://127.0.0.1:0")
        .with_protocol(protocol)
        .with_security(pki.security(alias))
}

/// Starts a server on an ephemeral port and returns the endpoint clients
/// should dial.
pub async fn start_server(
    config: Config,
    store: Arc<dyn LogStore>,
) -> (DistributionServer, Endpoint) {
    let mut server = DistributionServer::new(config, store).unwrap();
    server.start().await.unwrap();
    let endpoint = client_endpoint(&server);
    (server, endpoint)
}

pub fn client_endpoint(server: &DistributionServer) -> Endpoint {
    let port = server.local_addr().unwrap().port();
    server.endpoint().with_port(port)
}

pub fn memory_store() -> Arc<MemoryLogStore> {
    Arc::new(MemoryLogStore::new("thl"))
}

pub fn plaintext_endpoint(port: u16) -> Endpoint {
    Endpoint::new(Scheme::Plaintext, "127.0.0.1", port)
}

/// Single row change on `schema.table`.
pub fn row_record(seqno: u64, schema: &str, table: &str) -> LogRecord {
    let change = RowChange::new(schema, table, RowAction::Insert)
        .with_row(&["id", "name"], vec![json!(seqno), json!(format!("row-{}", seqno))]);
    LogRecord::new(
        seqno,
        "db1",
        vec![DbmsData::RowChanges {
            changes: vec![change],
        }],
    )
}

pub fn statement_record(seqno: u64, query: &str) -> LogRecord {
    LogRecord::new(
        seqno,
        "db1",
        vec![DbmsData::Statement(Statement::new(query, Some("app")))],
    )
}
