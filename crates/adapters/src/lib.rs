//! The adapter layer: a uniform capability-driven operator surface over
//! heterogeneous data stores. Each store module implements the four
//! operator facets; `connect` dispatches on the closed store-type enum.

mod capabilities;
mod connection;
mod cursor;
mod error;
pub mod memory;
mod source;
mod traits;

pub mod dynamo;
pub mod kafka;
pub mod mongo;
pub mod postgres;
pub mod redis;

pub use capabilities::{capabilities, Capabilities};
pub use connection::{
    connect, connect_instance, Connection, InstanceClient, InstanceConnection, InstanceOperator,
    StoreClient,
};
pub use cursor::Cursor;
pub use error::{Error, ErrorKind, Result};
pub use source::{RawEvent, ReplicationSource, ShardReader};
pub use traits::{
    ContainerSchema, DataOperator, MetadataOperator, ReplicationOperator, RowError, SchemaOperator,
    StreamBatch, StreamRequest, WriteReport,
};
