//! PostgreSQL adapter: schema discovery over the catalogs, row movement
//! with server-side typing via `row_to_json` / `json_populate_record`,
//! and CDC through wal2json logical decoding.

mod data;
mod metadata;
mod replication;
mod schema;
mod values;

use crate::connection::InstanceOperator;
use crate::error::{Error, ErrorKind, Result};
use models::{ConnectionConfig, InstanceConfig, StoreType, TlsConfig, TlsMode};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_postgres::error::SqlState;

pub struct PostgresClient {
    pub(crate) client: tokio_postgres::Client,
    pub(crate) config: ConnectionConfig,
    conn_task: JoinHandle<()>,
}

impl PostgresClient {
    pub async fn connect(config: &ConnectionConfig) -> Result<Self> {
        let (client, conn_task) = open_client(
            &config.host,
            config.port,
            &config.username,
            &config.password,
            &config.database_name,
            config.tls.as_ref(),
            config.ssl_verify,
        )
        .await?;

        Ok(Self {
            client,
            config: config.clone(),
            conn_task,
        })
    }

    pub async fn ping(&self) -> Result<()> {
        self.client
            .simple_query("SELECT 1")
            .await
            .map(|_| ())
            .map_err(|err| pg_err("ping", err))
    }

    pub async fn close(&self) {
        self.conn_task.abort();
    }

    /// A second session against the same database, used by replication
    /// readers so slot polling never contends with data operations.
    pub(crate) async fn open_sibling(&self) -> Result<(tokio_postgres::Client, JoinHandle<()>)> {
        open_client(
            &self.config.host,
            self.config.port,
            &self.config.username,
            &self.config.password,
            &self.config.database_name,
            self.config.tls.as_ref(),
            self.config.ssl_verify,
        )
        .await
    }
}

pub struct PostgresInstance {
    client: tokio_postgres::Client,
    conn_task: JoinHandle<()>,
}

impl PostgresInstance {
    pub async fn connect(config: &InstanceConfig) -> Result<Self> {
        // Administrative sessions attach to the maintenance database.
        let (client, conn_task) = open_client(
            &config.host,
            config.port,
            &config.username,
            &config.password,
            "postgres",
            config.tls.as_ref(),
            config.ssl_verify,
        )
        .await?;
        Ok(Self { client, conn_task })
    }
}

#[async_trait::async_trait]
impl InstanceOperator for PostgresInstance {
    async fn ping(&self) -> Result<()> {
        self.client
            .simple_query("SELECT 1")
            .await
            .map(|_| ())
            .map_err(|err| pg_err("ping", err))
    }

    async fn list_databases(&self) -> Result<Vec<String>> {
        let rows = self
            .client
            .query(
                "SELECT datname FROM pg_database WHERE NOT datistemplate ORDER BY datname",
                &[],
            )
            .await
            .map_err(|err| pg_err("list_databases", err))?;
        Ok(rows.iter().map(|r| r.get::<_, String>(0)).collect())
    }

    async fn create_database(&self, name: &str) -> Result<()> {
        self.client
            .execute(&format!("CREATE DATABASE {}", quote_ident(name)), &[])
            .await
            .map(|_| ())
            .map_err(|err| pg_err("create_database", err))
    }

    async fn drop_database(&self, name: &str) -> Result<()> {
        self.client
            .execute(&format!("DROP DATABASE IF EXISTS {}", quote_ident(name)), &[])
            .await
            .map(|_| ())
            .map_err(|err| pg_err("drop_database", err))
    }

    async fn close(&self) {
        self.conn_task.abort();
    }
}

async fn open_client(
    host: &str,
    port: u16,
    username: &str,
    password: &str,
    database: &str,
    tls: Option<&TlsConfig>,
    ssl_verify: bool,
) -> Result<(tokio_postgres::Client, JoinHandle<()>)> {
    let mut pg = tokio_postgres::Config::new();
    pg.host(host)
        .port(port)
        .user(username)
        .password(password)
        .dbname(database)
        .application_name("redb-relay");

    match tls {
        Some(tls) if tls.mode != TlsMode::Disable => {
            let connector =
                tokio_postgres_rustls::MakeRustlsConnect::new(build_tls(tls, ssl_verify)?);
            let (client, connection) = pg
                .connect(connector)
                .await
                .map_err(|err| pg_err("connect", err))?;
            let task = tokio::spawn(async move {
                if let Err(err) = connection.await {
                    tracing::warn!(error = %err, "postgres connection terminated");
                }
            });
            Ok((client, task))
        }
        _ => {
            let (client, connection) = pg
                .connect(tokio_postgres::NoTls)
                .await
                .map_err(|err| pg_err("connect", err))?;
            let task = tokio::spawn(async move {
                if let Err(err) = connection.await {
                    tracing::warn!(error = %err, "postgres connection terminated");
                }
            });
            Ok((client, task))
        }
    }
}

fn build_tls(tls: &TlsConfig, ssl_verify: bool) -> Result<rustls::ClientConfig> {
    let mut roots = rustls::RootCertStore::empty();

    if let Some(root_pem) = &tls.root_cert {
        for cert in rustls_pemfile::certs(&mut root_pem.as_bytes()) {
            let cert = cert.map_err(|err| {
                Error::configuration("connect", "invalid root certificate PEM").with_source(err)
            })?;
            roots.add(cert).map_err(|err| {
                Error::configuration("connect", "unusable root certificate").with_source(err)
            })?;
        }
    } else {
        for cert in rustls_native_certs::load_native_certs().map_err(|err| {
            Error::configuration("connect", "cannot load native root certificates").with_source(err)
        })? {
            // Skip unparseable platform certificates.
            let _ = roots.add(cert);
        }
    }

    let builder = rustls::ClientConfig::builder().with_root_certificates(roots);

    let mut config = match (&tls.cert, &tls.key) {
        (Some(cert_pem), Some(key_pem)) => {
            let certs = rustls_pemfile::certs(&mut cert_pem.as_bytes())
                .collect::<std::result::Result<Vec<_>, _>>()
                .map_err(|err| {
                    Error::configuration("connect", "invalid client certificate PEM")
                        .with_source(err)
                })?;
            let key = rustls_pemfile::private_key(&mut key_pem.as_bytes())
                .map_err(|err| {
                    Error::configuration("connect", "invalid client key PEM").with_source(err)
                })?
                .ok_or_else(|| Error::configuration("connect", "client key PEM holds no key"))?;
            builder.with_client_auth_cert(certs, key).map_err(|err| {
                Error::configuration("connect", "client certificate rejected").with_source(err)
            })?
        }
        _ => builder.with_no_client_auth(),
    };

    if !ssl_verify {
        config
            .dangerous()
            .set_certificate_verifier(Arc::new(danger::NoVerification));
    }
    Ok(config)
}

mod danger {
    use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
    use rustls::crypto::{verify_tls12_signature, verify_tls13_signature, CryptoProvider};

    /// Accept-any-certificate verifier, used only when the connection
    /// config explicitly disables SSL verification.
    #[derive(Debug)]
    pub(super) struct NoVerification;

    impl ServerCertVerifier for NoVerification {
        fn verify_server_cert(
            &self,
            _end_entity: &rustls::pki_types::CertificateDer<'_>,
            _intermediates: &[rustls::pki_types::CertificateDer<'_>],
            _server_name: &rustls::pki_types::ServerName<'_>,
            _ocsp_response: &[u8],
            _now: rustls::pki_types::UnixTime,
        ) -> Result<ServerCertVerified, rustls::Error> {
            Ok(ServerCertVerified::assertion())
        }

        fn verify_tls12_signature(
            &self,
            message: &[u8],
            cert: &rustls::pki_types::CertificateDer<'_>,
            dss: &rustls::DigitallySignedStruct,
        ) -> Result<HandshakeSignatureValid, rustls::Error> {
            verify_tls12_signature(
                message,
                cert,
                dss,
                &CryptoProvider::get_default()
                    .expect("crypto provider is installed")
                    .signature_verification_algorithms,
            )
        }

        fn verify_tls13_signature(
            &self,
            message: &[u8],
            cert: &rustls::pki_types::CertificateDer<'_>,
            dss: &rustls::DigitallySignedStruct,
        ) -> Result<HandshakeSignatureValid, rustls::Error> {
            verify_tls13_signature(
                message,
                cert,
                dss,
                &CryptoProvider::get_default()
                    .expect("crypto provider is installed")
                    .signature_verification_algorithms,
            )
        }

        fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
            CryptoProvider::get_default()
                .expect("crypto provider is installed")
                .signature_verification_algorithms
                .supported_schemes()
        }
    }
}

/// Double-quote an SQL identifier.
pub(crate) fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Fully-qualified, quoted relation reference in the public schema.
pub(crate) fn qualified(table: &str) -> String {
    format!("public.{}", quote_ident(table))
}

/// Map a driver error into the structured taxonomy.
pub(crate) fn pg_err(operation: &'static str, err: tokio_postgres::Error) -> Error {
    let kind = match err.code() {
        Some(code) if *code == SqlState::INVALID_PASSWORD => ErrorKind::Authentication,
        Some(code) if *code == SqlState::INVALID_AUTHORIZATION_SPECIFICATION => {
            ErrorKind::Authentication
        }
        Some(code) if *code == SqlState::UNDEFINED_TABLE => ErrorKind::NotFound,
        Some(code) if *code == SqlState::UNDEFINED_OBJECT => ErrorKind::NotFound,
        Some(code) if *code == SqlState::DUPLICATE_TABLE => ErrorKind::SchemaConflict,
        Some(code) if *code == SqlState::DUPLICATE_OBJECT => ErrorKind::SchemaConflict,
        Some(code) if *code == SqlState::INSUFFICIENT_PRIVILEGE => ErrorKind::Configuration,
        Some(_) => ErrorKind::InvalidData,
        // No SQLSTATE: an I/O or protocol failure.
        None => ErrorKind::Transient,
    };
    Error::new(kind, operation, err.to_string())
        .with_store(StoreType::Postgres)
        .with_source(err)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn identifiers_are_quoted() {
        assert_eq!(quote_ident("users"), "\"users\"");
        assert_eq!(quote_ident("we\"ird"), "\"we\"\"ird\"");
        assert_eq!(qualified("orders"), "public.\"orders\"");
    }
}
