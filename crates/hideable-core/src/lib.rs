//! Core types for Hideable's SQLite persistence.
//!
//! - `codec`: binary-safe encoding for SQL string literals
//! - `literal`: quote escaping that falls back to the codec when needed
//! - `Value` and `Row` for query results and function arguments
//! - `Error` for everything the database layer can report

pub mod codec;
pub mod error;
pub mod literal;
pub mod row;
pub mod value;

pub use codec::{CodecError, decode_binary, encode_binary};
pub use error::{
    ConfigError, ConnectionError, ConnectionErrorKind, Denied, Error, QueryError, QueryErrorKind,
    Result, TransactionError, TransactionErrorKind, TypeError,
};
pub use literal::{escape_for_literal, escape_text, quote_literal, unescape_from_literal};
pub use row::{ColumnInfo, FromValue, Row};
pub use value::Value;
