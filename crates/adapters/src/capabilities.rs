use models::{CdcMechanism, StoreType};

/// Static properties of a store type, queryable without a connection.
/// Constant for the lifetime of the process: the engine consults this
/// table instead of making trial-and-error calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capabilities {
    pub supports_cdc: bool,
    pub cdc_mechanisms: &'static [CdcMechanism],
    pub supports_transactions: bool,
    pub supports_secondary_indexes: bool,
    pub supports_logical_databases: bool,
    pub supports_cursor_pagination: bool,
    pub supports_offset_pagination: bool,
    pub supports_bulk_insert: bool,
    pub supports_upsert: bool,
}

pub const fn capabilities(store_type: StoreType) -> &'static Capabilities {
    match store_type {
        StoreType::Postgres => &POSTGRES,
        StoreType::Mongodb => &MONGODB,
        StoreType::Redis => &REDIS,
        StoreType::Kafka => &KAFKA,
        StoreType::Dynamodb => &DYNAMODB,
    }
}

const POSTGRES: Capabilities = Capabilities {
    supports_cdc: true,
    cdc_mechanisms: &[CdcMechanism::LogicalReplication],
    supports_transactions: true,
    supports_secondary_indexes: true,
    supports_logical_databases: true,
    supports_cursor_pagination: true,
    supports_offset_pagination: true,
    supports_bulk_insert: true,
    supports_upsert: true,
};

const MONGODB: Capabilities = Capabilities {
    supports_cdc: true,
    cdc_mechanisms: &[CdcMechanism::ChangeStreams],
    supports_transactions: true,
    supports_secondary_indexes: true,
    supports_logical_databases: true,
    supports_cursor_pagination: true,
    supports_offset_pagination: false,
    supports_bulk_insert: true,
    supports_upsert: true,
};

const REDIS: Capabilities = Capabilities {
    supports_cdc: false,
    cdc_mechanisms: &[],
    supports_transactions: false,
    supports_secondary_indexes: false,
    supports_logical_databases: true,
    supports_cursor_pagination: true,
    supports_offset_pagination: false,
    supports_bulk_insert: true,
    supports_upsert: true,
};

const KAFKA: Capabilities = Capabilities {
    supports_cdc: true,
    cdc_mechanisms: &[CdcMechanism::TopicOffsets],
    supports_transactions: false,
    supports_secondary_indexes: false,
    supports_logical_databases: false,
    supports_cursor_pagination: true,
    supports_offset_pagination: true,
    supports_bulk_insert: true,
    // Topics are append-only; "upsert" is emitting the newest image.
    supports_upsert: false,
};

const DYNAMODB: Capabilities = Capabilities {
    supports_cdc: true,
    cdc_mechanisms: &[CdcMechanism::StreamShards],
    supports_transactions: false,
    supports_secondary_indexes: true,
    supports_logical_databases: false,
    supports_cursor_pagination: true,
    supports_offset_pagination: false,
    supports_bulk_insert: true,
    supports_upsert: true,
};

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn cdc_support_matches_mechanisms() {
        for store in StoreType::ALL {
            let caps = capabilities(store);
            assert_eq!(
                caps.supports_cdc,
                !caps.cdc_mechanisms.is_empty(),
                "store: {store}",
            );
        }
    }
}
