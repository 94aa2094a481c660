//! Error types for Hideable database operations.

use std::fmt;
use std::path::PathBuf;

use crate::codec::CodecError;

/// The primary error type for all database operations.
#[derive(Debug)]
pub enum Error {
    /// Opening the database failed
    Connection(ConnectionError),
    /// Query execution errors
    Query(QueryError),
    /// Type conversion errors
    Type(TypeError),
    /// Transaction nesting errors
    Transaction(TransactionError),
    /// Stored binary value could not be decoded
    Codec(CodecError),
    /// Configuration errors
    Config(ConfigError),
    /// Custom error with message
    Custom(String),
}

/// Which location the process lacks write access to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Denied {
    /// The directory holding the database file
    DataDir(PathBuf),
    /// The database file itself
    DatabaseFile(PathBuf),
}

impl fmt::Display for Denied {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Denied::DataDir(p) => write!(f, "no write permission on data directory {}", p.display()),
            Denied::DatabaseFile(p) => {
                write!(f, "no write permission on database file {}", p.display())
            }
        }
    }
}

#[derive(Debug)]
pub struct ConnectionError {
    pub kind: ConnectionErrorKind,
    pub path: PathBuf,
    pub message: String,
    pub denied: Option<Denied>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionErrorKind {
    /// The data directory or database file is not writable
    PermissionDenied,
    /// The engine refused to open the file for another reason
    OpenFailed,
}

#[derive(Debug)]
pub struct QueryError {
    pub kind: QueryErrorKind,
    /// Statement text, lossily decoded when it was not UTF-8
    pub sql: Option<String>,
    pub message: String,
    /// Permission problem found while diagnosing the failure
    pub denied: Option<Denied>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryErrorKind {
    /// Syntax error in SQL, or SQL the engine cannot accept
    Syntax,
    /// Constraint violation (unique, foreign key, etc.)
    Constraint,
    /// Database is locked by another connection
    Busy,
    /// Write attempted on a read-only database
    ReadOnly,
    /// Permission denied
    Permission,
    /// Data too large for column
    TooBig,
    /// Interrupted
    Interrupted,
    /// A user-defined function could not be registered
    Function,
    /// The handle was used again from inside one of its own SQL functions
    Reentrant,
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
pub struct TransactionError {
    pub kind: TransactionErrorKind,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionErrorKind {
    /// Commit or rollback without a matching begin
    NotInTransaction,
}

#[derive(Debug)]
pub struct ConfigError {
    pub message: String,
}

impl Error {
    /// Is this a permission failure, either while opening or while querying?
    pub fn is_permission_denied(&self) -> bool {
        match self {
            Error::Connection(c) => c.kind == ConnectionErrorKind::PermissionDenied,
            Error::Query(q) => q.denied.is_some() || q.kind == QueryErrorKind::Permission,
            _ => false,
        }
    }

    /// Did opening the database fail for a reason other than permissions?
    pub fn is_open_failed(&self) -> bool {
        matches!(self, Error::Connection(c) if c.kind == ConnectionErrorKind::OpenFailed)
    }

    /// Did executing a statement fail?
    pub fn is_query_failed(&self) -> bool {
        matches!(self, Error::Query(_))
    }

    /// Get the SQL that caused this error, if available
    pub fn sql(&self) -> Option<&str> {
        match self {
            Error::Query(q) => q.sql.as_deref(),
            _ => None,
        }
    }

    /// The engine's own message, when the error came from the engine.
    pub fn engine_message(&self) -> Option<&str> {
        match self {
            Error::Connection(c) => Some(&c.message),
            Error::Query(q) => Some(&q.message),
            _ => None,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Connection(e) => write!(f, "Connection error: {}", e),
            Error::Query(e) => write!(f, "Query error: {}", e),
            Error::Type(e) => write!(f, "Type error: {}", e),
            Error::Transaction(e) => write!(f, "Transaction error: {}", e.message),
            Error::Codec(e) => write!(f, "Codec error: {}", e),
            Error::Config(e) => write!(f, "Configuration error: {}", e.message),
            Error::Custom(msg) => write!(f, "{}", msg),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Codec(e) => Some(e),
            _ => None,
        }
    }
}

impl fmt::Display for ConnectionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.denied {
            Some(denied) => write!(f, "{}: {}", denied, self.message),
            None => write!(
                f,
                "could not open {}: {}",
                self.path.display(),
                self.message
            ),
        }
    }
}

impl fmt::Display for QueryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(denied) = &self.denied {
            write!(f, "{}; ", denied)?;
        }
        write!(f, "{}", self.message)
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

impl fmt::Display for TransactionError {
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

impl From<TransactionError> for Error {
    fn from(err: TransactionError) -> Self {
        Error::Transaction(err)
    }
}

impl From<CodecError> for Error {
    fn from(err: CodecError) -> Self {
        Error::Codec(err)
    }
}

impl From<ConfigError> for Error {
    fn from(err: ConfigError) -> Self {
        Error::Config(err)
    }
}

/// Result type alias for database operations.
pub type Result<T> = std::result::Result<T, Error>;
