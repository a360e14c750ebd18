//! MongoDB adapter: collections discovered by sampling, `_id`-keyed
//! movement, and CDC over change streams with resume tokens.

mod data;
mod metadata;
mod replication;
mod schema;

use crate::connection::InstanceOperator;
use crate::error::{Error, ErrorKind, Result};
use ::mongodb::bson::{doc, Bson, Document};
use ::mongodb::options::{ClientOptions, Credential, ServerAddress, Tls, TlsOptions};
use models::{ConnectionConfig, InstanceConfig, StoreType, TlsConfig, TlsMode};
use serde_json::{Map, Value};

pub struct MongoClient {
    pub(crate) client: ::mongodb::Client,
    pub(crate) config: ConnectionConfig,
}

impl MongoClient {
    pub async fn connect(config: &ConnectionConfig) -> Result<Self> {
        let options = client_options(
            &config.host,
            config.port,
            &config.username,
            &config.password,
            config.tls.as_ref(),
            config.ssl_verify,
        )?;
        let client = ::mongodb::Client::with_options(options)
            .map_err(|err| mongo_err("connect", err))?;

        // Driver construction is lazy; force a round trip now so a bad
        // endpoint fails at connect rather than first use.
        client
            .database(&config.database_name)
            .run_command(doc! { "ping": 1 }, None)
            .await
            .map_err(|err| mongo_err("connect", err))?;

        Ok(Self {
            client,
            config: config.clone(),
        })
    }

    pub(crate) fn database(&self) -> ::mongodb::Database {
        self.client.database(&self.config.database_name)
    }

    pub(crate) fn collection(&self, name: &str) -> ::mongodb::Collection<Document> {
        self.database().collection(name)
    }

    pub async fn ping(&self) -> Result<()> {
        self.database()
            .run_command(doc! { "ping": 1 }, None)
            .await
            .map(|_| ())
            .map_err(|err| mongo_err("ping", err))
    }

    pub async fn close(&self) {
        self.client.clone().shutdown().await;
    }
}

pub struct MongoInstance {
    client: ::mongodb::Client,
}

impl MongoInstance {
    pub async fn connect(config: &InstanceConfig) -> Result<Self> {
        let options = client_options(
            &config.host,
            config.port,
            &config.username,
            &config.password,
            config.tls.as_ref(),
            config.ssl_verify,
        )?;
        let client = ::mongodb::Client::with_options(options)
            .map_err(|err| mongo_err("connect_instance", err))?;
        client
            .database("admin")
            .run_command(doc! { "ping": 1 }, None)
            .await
            .map_err(|err| mongo_err("connect_instance", err))?;
        Ok(Self { client })
    }
}

#[async_trait::async_trait]
impl InstanceOperator for MongoInstance {
    async fn ping(&self) -> Result<()> {
        self.client
            .database("admin")
            .run_command(doc! { "ping": 1 }, None)
            .await
            .map(|_| ())
            .map_err(|err| mongo_err("ping", err))
    }

    async fn list_databases(&self) -> Result<Vec<String>> {
        self.client
            .list_database_names(None, None)
            .await
            .map_err(|err| mongo_err("list_databases", err))
    }

    async fn create_database(&self, name: &str) -> Result<()> {
        // Databases materialize with their first collection.
        self.client
            .database(name)
            .create_collection("_redb_init", None)
            .await
            .map_err(|err| mongo_err("create_database", err))
    }

    async fn drop_database(&self, name: &str) -> Result<()> {
        self.client
            .database(name)
            .drop(None)
            .await
            .map_err(|err| mongo_err("drop_database", err))
    }

    async fn close(&self) {
        self.client.clone().shutdown().await;
    }
}

fn client_options(
    host: &str,
    port: u16,
    username: &str,
    password: &str,
    tls: Option<&TlsConfig>,
    ssl_verify: bool,
) -> Result<ClientOptions> {
    let credential = if username.is_empty() {
        None
    } else {
        Some(
            Credential::builder()
                .username(username.to_string())
                .password(password.to_string())
                .build(),
        )
    };

    let tls = match tls {
        Some(tls) if tls.mode != TlsMode::Disable => {
            if tls.root_cert.is_some() {
                tracing::warn!("inline root certificates are not supported for mongodb; using system roots");
            }
            Some(Tls::Enabled(
                TlsOptions::builder()
                    .allow_invalid_certificates(!ssl_verify)
                    .build(),
            ))
        }
        _ => None,
    };

    Ok(ClientOptions::builder()
        .hosts(vec![ServerAddress::Tcp {
            host: host.to_string(),
            port: Some(port),
        }])
        .credential(credential)
        .tls(tls)
        .app_name("redb-relay".to_string())
        .build())
}

/// Map a driver error into the structured taxonomy.
pub(crate) fn mongo_err(operation: &'static str, err: ::mongodb::error::Error) -> Error {
    use ::mongodb::error::ErrorKind as MongoKind;

    let kind = match err.kind.as_ref() {
        MongoKind::Authentication { .. } => ErrorKind::Authentication,
        MongoKind::ServerSelection { .. } | MongoKind::Io(_) => ErrorKind::Transient,
        MongoKind::Command(command) => match command.code {
            13 | 18 => ErrorKind::Authentication,
            26 => ErrorKind::NotFound,
            48 => ErrorKind::SchemaConflict,
            _ => ErrorKind::InvalidData,
        },
        MongoKind::InvalidArgument { .. } => ErrorKind::Configuration,
        _ => ErrorKind::Connection,
    };
    Error::new(kind, operation, err.to_string())
        .with_store(StoreType::Mongodb)
        .with_source(err)
}

/// JSON row -> BSON document.
pub(crate) fn map_to_document(operation: &'static str, map: &Map<String, Value>) -> Result<Document> {
    let mut document = Document::new();
    for (key, value) in map {
        let bson = Bson::try_from(value.clone()).map_err(|err| {
            Error::invalid_data(operation, format!("value of '{key}' is not BSON-representable"))
                .with_source(err)
        })?;
        document.insert(key.clone(), bson);
    }
    Ok(document)
}

/// BSON document -> JSON row, in relaxed extended JSON.
pub(crate) fn document_to_map(operation: &'static str, document: &Document) -> Result<Map<String, Value>> {
    match serde_json::to_value(document) {
        Ok(Value::Object(map)) => Ok(map),
        Ok(other) => Err(Error::invalid_data(
            operation,
            format!("document serialized to {other}, expected an object"),
        )),
        Err(err) => Err(Error::invalid_data(operation, "document is not JSON-representable")
            .with_source(err)),
    }
}
