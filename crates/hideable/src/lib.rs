//! Hideable - binary-safe SQLite persistence for a wiki.
//!
//! Wiki pages and attachments are written to SQLite as SQL text. Text goes
//! in quote-doubled; bytes that SQL text cannot carry (NUL, or a leading
//! `0x01`) are first rewritten by a reversible codec that keeps the bytes
//! `0x00`, `0x01` and `'` out of the literal body.
//!
//! # Quick Start
//!
//! ```ignore
//! use hideable::prelude::*;
//!
//! let db = Database::open_wiki("/var/lib/hideable", "main")?;
//! db.exec("CREATE TABLE IF NOT EXISTS attachment (name TEXT, data TEXT)")?;
//!
//! let mut sql = b"INSERT INTO attachment VALUES ('logo.png', ".to_vec();
//! sql.extend(quote_literal(&png_bytes));
//! sql.push(b')');
//! db.exec(sql)?;
//!
//! let row = db.query_row("SELECT data FROM attachment")?.unwrap();
//! let data = unescape_from_literal(row.get_bytes("data").unwrap())?;
//! ```
//!
//! # Crates
//!
//! - `hideable-core`: the codec, literal escaping, values, rows and errors
//! - `hideable-sqlite`: the [`Database`] handle over libsqlite3

pub use hideable_core::error::{
    ConfigError, ConnectionError, ConnectionErrorKind, Denied, QueryError, QueryErrorKind,
    TransactionError, TransactionErrorKind, TypeError,
};
pub use hideable_core::literal::{double_quotes, needs_binary_encoding, undouble_quotes};
pub use hideable_core::{
    CodecError, ColumnInfo, Error, FromValue, Result, Row, Value, decode_binary, encode_binary,
    escape_for_literal, escape_text, quote_literal, unescape_from_literal,
};
pub use hideable_sqlite::{
    AggregateFunction, Database, DatabaseConfig, FunctionRegistry, OpenFlags, ScalarFunction,
    sqlite_version,
};

/// Everything needed to open a wiki database and move bytes through it.
pub mod prelude {
    pub use crate::{
        CodecError, Database, DatabaseConfig, Error, FromValue, OpenFlags, Result, Row, Value,
        decode_binary, encode_binary, escape_for_literal, quote_literal, unescape_from_literal,
    };
}
