use crate::cursor::Cursor;
use crate::error::Result;
use crate::source::{RawEvent, ReplicationSource};
use models::{
    CdcEvent, CdcMechanism, ReplicationConfig, ResourceContainer, ResourceItem, Row, UnifiedModel,
};
use serde_json::{Map, Value};

/// A container description together with its items, as returned by
/// `get_table_schema`.
#[derive(Debug, Clone, PartialEq)]
pub struct ContainerSchema {
    pub container: ResourceContainer,
    pub items: Vec<ResourceItem>,
}

/// One batch of a lazy, finite stream over a table.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamBatch {
    pub rows: Vec<Row>,
    pub is_complete: bool,
    /// Token resuming after this batch; None once the stream completes.
    pub next_cursor: Option<Cursor>,
}

/// Parameters of one `stream` call.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamRequest {
    pub table: String,
    pub batch_size: u32,
    pub cursor: Option<Cursor>,
    /// Projection; empty means every column.
    pub columns: Vec<String>,
}

/// Outcome of a batched write, attributing per-row errors by index.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WriteReport {
    pub rows_written: u64,
    pub row_errors: Vec<RowError>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RowError {
    pub index: usize,
    pub message: String,
}

/// Schema discovery and deployment.
#[async_trait::async_trait]
pub trait SchemaOperator: Send + Sync {
    /// Discover the connected database into a unified model. Read-only
    /// and side-effect free.
    async fn discover_schema(&self) -> Result<UnifiedModel>;

    /// Deploy the model's containers. Additive and idempotent at the
    /// container level: re-creating an existing container is not an
    /// error, but attribute conflicts fail with `SchemaConflict`.
    async fn create_structure(&self, model: &UnifiedModel) -> Result<()>;

    async fn list_tables(&self) -> Result<Vec<String>>;

    async fn get_table_schema(&self, table: &str) -> Result<ContainerSchema>;
}

/// Row-level reads and writes.
#[async_trait::async_trait]
pub trait DataOperator: Send + Sync {
    async fn fetch(&self, table: &str, limit: u32) -> Result<Vec<Row>>;

    /// Insert rows. With `use_transaction` on a transactional store the
    /// batch is atomic; otherwise rows are written one at a time with
    /// errors attributed to their row index.
    async fn insert(&self, table: &str, rows: &[Row], use_transaction: bool)
        -> Result<WriteReport>;

    /// Update rows matching on `where_columns`, taking the remaining
    /// columns as the new values.
    async fn update(&self, table: &str, rows: &[Row], where_columns: &[String]) -> Result<u64>;

    /// Delete rows matching every column of `key`.
    async fn delete(&self, table: &str, key: &Row) -> Result<u64>;

    /// Run a native query or command with positional parameters.
    async fn execute_query(&self, statement: &str, params: &[Value]) -> Result<Vec<Row>>;

    /// One step of a lazy finite stream of row batches. Cursors are
    /// opaque tokens (`Cursor`); callers never parse them.
    async fn stream(&self, req: &StreamRequest) -> Result<StreamBatch>;

    /// Possibly-approximate row count, from store statistics when
    /// available.
    async fn get_table_row_count(&self, table: &str) -> Result<u64>;
}

/// Observability metadata of the connected database or instance.
#[async_trait::async_trait]
pub trait MetadataOperator: Send + Sync {
    async fn collect_database_metadata(&self) -> Result<Map<String, Value>>;
    async fn collect_instance_metadata(&self) -> Result<Map<String, Value>>;
    async fn get_version(&self) -> Result<String>;
    /// A stable identifier of the backing server or cluster.
    async fn get_unique_identifier(&self) -> Result<String>;
    async fn get_database_size(&self) -> Result<u64>;
    async fn get_table_count(&self) -> Result<u64>;
    async fn execute_command(&self, command: &str) -> Result<Value>;
}

/// Change-data-capture: sourcing raw change events and applying
/// canonical ones.
#[async_trait::async_trait]
pub trait ReplicationOperator: Send + Sync {
    fn is_supported(&self) -> bool;

    fn supported_mechanisms(&self) -> &'static [CdcMechanism];

    /// Verify mechanism prerequisites (plugin installed, CDC enabled on
    /// every configured table) before acquiring stream resources.
    async fn check_prerequisites(&self, config: &ReplicationConfig) -> Result<()>;

    /// Acquire stream resources and return a connected source.
    async fn connect_source(&self, config: ReplicationConfig) -> Result<ReplicationSource>;

    /// Translate one raw store event into the canonical shape. Pure:
    /// parsing the same raw event twice yields equal events.
    fn parse_event(&self, raw: &RawEvent) -> Result<CdcEvent>;

    /// Apply a canonical event. At-least-once safe: adapters choose
    /// idempotent primitives (upsert by primary key) where the store
    /// supports them, and convert key violations otherwise.
    async fn apply_cdc_event(&self, event: &CdcEvent) -> Result<()>;

    /// Transform a row image under column rules, delegating `custom`
    /// kinds to the external transformation service when configured.
    async fn transform_data(
        &self,
        data: &Row,
        rules: &[transform::TransformRule],
        source_table: Option<&str>,
        mutation: Option<&dyn transform::MutationClient>,
    ) -> Result<Row> {
        Ok(transform::apply_rules(data, rules, source_table, false, mutation).await)
    }
}
