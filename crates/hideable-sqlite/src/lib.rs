//! SQLite database handle for Hideable.
//!
// FFI bindings require unsafe code - this is expected for database drivers
#![allow(unsafe_code)]
//!
//! Wraps a single libsqlite3 connection behind [`Database`]: byte-oriented
//! SQL text so binary-encoded literals survive, nested transactions,
//! permission-aware open errors and native scalar functions.
//!
//! # Example
//!
//! ```rust,ignore
//! use hideable_sqlite::Database;
//!
//! let db = Database::open_memory()?;
//! db.exec("CREATE TABLE page (name TEXT, body TEXT)")?;
//!
//! let mut sql = b"INSERT INTO page VALUES ('Front', '".to_vec();
//! sql.extend(db.escape_binary(b"raw\0bytes"));
//! sql.extend(b"')");
//! db.exec(sql)?;
//!
//! let row = db.query_row("SELECT body FROM page")?.unwrap();
//! let body = db.unescape_binary(row.get_bytes("body").unwrap())?;
//! assert_eq!(&*body, b"raw\0bytes");
//! ```
//!
//! # Thread Safety
//!
//! `Database` is both `Send` and `Sync`. Every call takes an internal mutex
//! around the SQLite handle.

pub mod connection;
pub mod ffi;
pub mod functions;
pub mod types;

pub use connection::{Database, DatabaseConfig, OpenFlags};
pub use functions::{AggregateFunction, FunctionRegistry, ScalarFunction};

/// Re-export the SQLite library version.
pub fn sqlite_version() -> &'static str {
    ffi::version()
}
