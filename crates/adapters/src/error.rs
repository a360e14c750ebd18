use models::StoreType;
use std::collections::BTreeMap;
use std::fmt;

/// Classification of an adapter error, driving retry and surfacing policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Cannot open or use the native client; caller retries with backoff.
    Connection,
    /// Credentials rejected; never retried.
    Authentication,
    /// Missing required field or incompatible settings; fatal for the call.
    Configuration,
    /// The capability table says "no"; never retried.
    UnsupportedOperation,
    /// Named resource absent.
    NotFound,
    /// `create_structure` met an incompatible existing object.
    SchemaConflict,
    /// CDC event missing a required field, or a bad URI.
    InvalidData,
    /// Cast or date-parse failure during transformation.
    Transformation,
    /// Network blip or throttling; workers back off and retry.
    Transient,
    /// DELETE without identifying columns.
    MissingKey,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Connection => "connection error",
            Self::Authentication => "authentication error",
            Self::Configuration => "configuration error",
            Self::UnsupportedOperation => "unsupported operation",
            Self::NotFound => "not found",
            Self::SchemaConflict => "schema conflict",
            Self::InvalidData => "invalid data",
            Self::Transformation => "transformation error",
            Self::Transient => "transient error",
            Self::MissingKey => "missing key",
        }
    }
}

/// The uniform, structured adapter error: kind, store type, operation and
/// a context map, always paired with a short human-readable message.
#[derive(Debug)]
pub struct Error {
    pub kind: ErrorKind,
    pub store_type: Option<StoreType>,
    pub operation: &'static str,
    pub message: String,
    pub context: BTreeMap<&'static str, String>,
    source: Option<Box<dyn std::error::Error + Send + Sync + 'static>>,
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub fn new(kind: ErrorKind, operation: &'static str, message: impl Into<String>) -> Self {
        Self {
            kind,
            store_type: None,
            operation,
            message: message.into(),
            context: BTreeMap::new(),
            source: None,
        }
    }

    pub fn with_store(mut self, store_type: StoreType) -> Self {
        self.store_type = Some(store_type);
        self
    }

    pub fn with_context(mut self, key: &'static str, value: impl Into<String>) -> Self {
        self.context.insert(key, value.into());
        self
    }

    pub fn with_source(
        mut self,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        self.source = Some(Box::new(source));
        self
    }

    /// The structured error for invoking an operator a store does not
    /// support. All "does not support X" errors are of this shape.
    pub fn unsupported(store_type: StoreType, operation: &'static str, reason: &str) -> Self {
        Self::new(
            ErrorKind::UnsupportedOperation,
            operation,
            format!("{store_type} does not support {operation}: {reason}"),
        )
        .with_store(store_type)
    }

    pub fn configuration(operation: &'static str, message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Configuration, operation, message)
    }

    pub fn not_found(operation: &'static str, what: impl Into<String>) -> Self {
        Self::new(ErrorKind::NotFound, operation, what)
    }

    pub fn missing_key(operation: &'static str, message: impl Into<String>) -> Self {
        Self::new(ErrorKind::MissingKey, operation, message)
    }

    pub fn invalid_data(operation: &'static str, message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidData, operation, message)
    }

    /// Whether a CDC worker should back off and retry rather than fail the
    /// stream.
    pub fn is_transient(&self) -> bool {
        matches!(self.kind, ErrorKind::Transient | ErrorKind::Connection)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind.as_str(), self.message)?;
        if let Some(store) = self.store_type {
            write!(f, " (store: {store}, operation: {})", self.operation)?;
        } else {
            write!(f, " (operation: {})", self.operation)?;
        }
        for (key, value) in &self.context {
            write!(f, " {key}={value}")?;
        }
        Ok(())
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source
            .as_deref()
            .map(|e| e as &(dyn std::error::Error + 'static))
    }
}

impl From<transform::TransformError> for Error {
    fn from(err: transform::TransformError) -> Self {
        Error::new(ErrorKind::Transformation, "transform", err.to_string())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn unsupported_errors_are_structured() {
        let err = Error::unsupported(StoreType::Redis, "execute_query", "no SQL surface")
            .with_context("table", "users");

        assert_eq!(err.kind, ErrorKind::UnsupportedOperation);
        assert_eq!(err.store_type, Some(StoreType::Redis));
        assert_eq!(err.operation, "execute_query");
        assert_eq!(
            err.to_string(),
            "unsupported operation: redis does not support execute_query: no SQL surface \
             (store: redis, operation: execute_query) table=users",
        );
        assert!(!err.is_transient());
    }
}
