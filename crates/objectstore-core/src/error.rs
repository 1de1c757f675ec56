//! Error types for ObjectStore operations.

use std::fmt;
use std::sync::Arc;

use crate::entity::EntityRef;

/// The primary error type for all ObjectStore operations.
#[derive(Debug)]
pub enum Error {
    /// Connection-related errors (open, close, lost connection)
    Connection(ConnectionError),
    /// Command execution errors reported by the provider
    Query(QueryError),
    /// Type conversion errors
    Type(TypeError),
    /// An expression or query chain has no SQL or in-memory mapping
    Translation(TranslationError),
    /// A save batch failed on one object and was rolled back
    Save(SaveError),
    /// An operation is not valid for the object's current state
    State(StateError),
    /// Pool and worker queue errors
    Pool(PoolError),
    /// Configuration errors
    Config(ConfigError),
    /// Mapping metadata errors
    Mapping(MappingError),
    /// One failure delivered to several receivers (every item of a batch)
    Shared(Arc<Error>),
    /// Custom error with message
    Custom(String),
}

#[derive(Debug)]
pub struct ConnectionError {
    pub kind: ConnectionErrorKind,
    pub message: String,
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionErrorKind {
    /// Failed to establish connection
    Connect,
    /// Connection lost during operation
    Disconnected,
    /// Connection was closed while still in use
    Closed,
}

#[derive(Debug)]
pub struct QueryError {
    pub kind: QueryErrorKind,
    pub sql: Option<String>,
    pub message: String,
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryErrorKind {
    /// Syntax error in SQL
    Syntax,
    /// Constraint violation (unique, foreign key, etc.)
    Constraint,
    /// Table or column not found
    NotFound,
    /// The batch produced fewer result sets than commands
    MissingResult,
    /// Other database error
    Database,
}

#[derive(Debug)]
pub struct TypeError {
    pub expected: &'static str,
    pub actual: String,
    pub column: Option<String>,
}

#[derive(Debug)]
pub struct TranslationError {
    pub kind: TranslationErrorKind,
    /// Rendering of the offending sub-expression
    pub expression: String,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TranslationErrorKind {
    /// Node kind has no translation rule
    Unsupported,
    /// SQL substitution template has a bad or missing slot
    MalformedTemplate,
    /// Parameter alias cannot be resolved unambiguously
    AmbiguousMember,
    /// Member is not mapped on the table
    UnknownMember,
    /// Query operator chain is not recognized
    NotSupportedQuery,
}

/// A save failure carrying the object that caused it.
pub struct SaveError {
    pub object: EntityRef,
    pub source: Box<Error>,
}

#[derive(Debug)]
pub struct StateError {
    pub message: String,
}

#[derive(Debug)]
pub struct PoolError {
    pub kind: PoolErrorKind,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolErrorKind {
    /// Pool or queue is shut down
    Closed,
    /// Worker finished without delivering a result
    Abandoned,
    /// A result handler panicked
    HandlerPanicked,
}

#[derive(Debug)]
pub struct ConfigError {
    pub message: String,
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

#[derive(Debug)]
pub struct MappingError {
    pub table: String,
    pub message: String,
}

impl Error {
    /// Build a translation error for the given sub-expression.
    pub fn translation(
        kind: TranslationErrorKind,
        expression: impl fmt::Display,
        message: impl Into<String>,
    ) -> Self {
        Error::Translation(TranslationError {
            kind,
            expression: expression.to_string(),
            message: message.into(),
        })
    }

    pub fn state(message: impl Into<String>) -> Self {
        Error::State(StateError {
            message: message.into(),
        })
    }

    pub fn mapping(table: impl Into<String>, message: impl Into<String>) -> Self {
        Error::Mapping(MappingError {
            table: table.into(),
            message: message.into(),
        })
    }

    pub fn pool(kind: PoolErrorKind, message: impl Into<String>) -> Self {
        Error::Pool(PoolError {
            kind,
            message: message.into(),
        })
    }

    /// Strip `Shared` wrappers.
    pub fn root(&self) -> &Error {
        match self {
            Error::Shared(inner) => inner.root(),
            other => other,
        }
    }

    /// Is this a translation or query-analysis error?
    pub fn is_translation(&self) -> bool {
        matches!(self.root(), Error::Translation(_))
    }

    pub fn translation_kind(&self) -> Option<TranslationErrorKind> {
        match self.root() {
            Error::Translation(t) => Some(t.kind),
            _ => None,
        }
    }

    /// The object a save failure was attributed to.
    pub fn failed_object(&self) -> Option<&EntityRef> {
        match self.root() {
            Error::Save(s) => Some(&s.object),
            _ => None,
        }
    }

    /// Is this a connection error that likely requires reconnection?
    pub fn is_connection_error(&self) -> bool {
        matches!(self.root(), Error::Connection(_))
    }

    /// Get the SQL that caused this error, if available
    pub fn sql(&self) -> Option<&str> {
        match self.root() {
            Error::Query(q) => q.sql.as_deref(),
            Error::Save(s) => s.source.sql(),
            _ => None,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Connection(e) => write!(f, "Connection error: {}", e.message),
            Error::Query(e) => write!(f, "Query error: {}", e.message),
            Error::Type(e) => {
                if let Some(col) = &e.column {
                    write!(
                        f,
                        "Type error in column '{}': expected {}, found {}",
                        col, e.expected, e.actual
                    )
                } else {
                    write!(f, "Type error: expected {}, found {}", e.expected, e.actual)
                }
            }
            Error::Translation(e) => write!(f, "Translation error: {}", e),
            Error::Save(e) => write!(f, "Save error: {}", e),
            Error::State(e) => write!(f, "State error: {}", e.message),
            Error::Pool(e) => write!(f, "Pool error: {}", e.message),
            Error::Config(e) => write!(f, "Configuration error: {}", e.message),
            Error::Mapping(e) => write!(f, "Mapping error on '{}': {}", e.table, e.message),
            Error::Shared(e) => write!(f, "{}", e),
            Error::Custom(msg) => write!(f, "{}", msg),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Connection(e) => e
                .source
                .as_deref()
                .map(|err| err as &(dyn std::error::Error + 'static)),
            Error::Query(e) => e
                .source
                .as_deref()
                .map(|err| err as &(dyn std::error::Error + 'static)),
            Error::Config(e) => e
                .source
                .as_deref()
                .map(|err| err as &(dyn std::error::Error + 'static)),
            Error::Save(e) => Some(e.source.as_ref()),
            Error::Shared(e) => Some(e.as_ref()),
            _ => None,
        }
    }
}

impl fmt::Display for ConnectionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl fmt::Display for QueryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(sql) = &self.sql {
            write!(f, "{} (in `{}`)", self.message, sql)
        } else {
            write!(f, "{}", self.message)
        }
    }
}

impl fmt::Display for TypeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(col) = &self.column {
            write!(
                f,
                "expected {} for column '{}', found {}",
                self.expected, col, self.actual
            )
        } else {
            write!(f, "expected {}, found {}", self.expected, self.actual)
        }
    }
}

impl fmt::Display for TranslationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} in `{}`", self.message, self.expression)
    }
}

impl fmt::Display for SaveError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "saving {} {} failed: {}",
            self.object.mapping().table(),
            self.object.keys(),
            self.source
        )
    }
}

impl fmt::Debug for SaveError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SaveError")
            .field("table", &self.object.mapping().table())
            .field("keys", &self.object.keys())
            .field("state", &self.object.state())
            .field("source", &self.source)
            .finish()
    }
}

impl fmt::Display for PoolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl From<ConnectionError> for Error {
    fn from(err: ConnectionError) -> Self {
        Error::Connection(err)
    }
}

impl From<QueryError> for Error {
    fn from(err: QueryError) -> Self {
        Error::Query(err)
    }
}

impl From<TypeError> for Error {
    fn from(err: TypeError) -> Self {
        Error::Type(err)
    }
}

impl From<TranslationError> for Error {
    fn from(err: TranslationError) -> Self {
        Error::Translation(err)
    }
}

impl From<SaveError> for Error {
    fn from(err: SaveError) -> Self {
        Error::Save(err)
    }
}

impl From<PoolError> for Error {
    fn from(err: PoolError) -> Self {
        Error::Pool(err)
    }
}

impl From<ConfigError> for Error {
    fn from(err: ConfigError) -> Self {
        Error::Config(err)
    }
}

impl From<MappingError> for Error {
    fn from(err: MappingError) -> Self {
        Error::Mapping(err)
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Config(ConfigError {
            message: err.to_string(),
            source: Some(Box::new(err)),
        })
    }
}

/// Result type alias for ObjectStore operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shared_errors_expose_their_root() {
        let query = Error::Query(QueryError {
            kind: QueryErrorKind::Constraint,
            sql: Some("INSERT INTO t".to_string()),
            message: "unique violation".to_string(),
            source: None,
        });
        let shared = Error::Shared(Arc::new(query));

        assert_eq!(shared.sql(), Some("INSERT INTO t"));
        assert!(matches!(shared.root(), Error::Query(_)));
        assert!(std::error::Error::source(&shared).is_some());
    }

    #[test]
    fn translation_helpers() {
        let err = Error::translation(
            TranslationErrorKind::Unsupported,
            "(x.a * 2)",
            "arithmetic operator `*` has no SQL mapping",
        );
        assert!(err.is_translation());
        assert_eq!(err.translation_kind(), Some(TranslationErrorKind::Unsupported));
        assert_eq!(
            err.to_string(),
            "Translation error: arithmetic operator `*` has no SQL mapping in `(x.a * 2)`"
        );
    }

    #[test]
    fn mapping_display_names_table() {
        let err = Error::mapping("users", "no key field");
        assert_eq!(err.to_string(), "Mapping error on 'users': no key field");
        assert!(!err.is_connection_error());
    }
}
