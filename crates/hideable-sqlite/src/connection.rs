//! SQLite database handle.
//!
//! [`Database`] owns one libsqlite3 connection. SQL text is taken as bytes
//! throughout, because values escaped with
//! [`escape_for_literal`](hideable_core::escape_for_literal) are interpolated
//! straight into statements and need not be UTF-8.

// Allow casts in FFI code where we need to match C types exactly
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::result_large_err)] // Error type is defined in hideable-core
#![allow(clippy::borrow_as_ptr)] // FFI requires raw pointers

use crate::ffi;
use crate::functions::{self, AggregateFunction, CALL_FUNCTION, FunctionRegistry, ScalarFunction};
use crate::types;
use hideable_core::error::{
    ConfigError, ConnectionError, ConnectionErrorKind, Denied, QueryError, QueryErrorKind,
    TransactionError, TransactionErrorKind,
};
use hideable_core::{
    Error, Result, Row, Value, escape_for_literal, escape_text, row::ColumnInfo,
    unescape_from_literal,
};
use serde::Deserialize;
use std::borrow::Cow;
use std::ffi::{CStr, CString, c_int};
use std::ops::{Deref, DerefMut};
use std::path::{Path, PathBuf};
use std::ptr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, ThreadId};

const MEMORY_PATH: &str = ":memory:";
const DEFAULT_BUSY_TIMEOUT_MS: u32 = 5000;

/// Configuration for opening a database.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// Path to the database file, or ":memory:" for an in-memory database.
    pub path: PathBuf,
    /// Open flags (read-only, read-write, create, etc.)
    pub flags: OpenFlags,
    /// Busy timeout in milliseconds. Zero leaves SQLite's default.
    pub busy_timeout_ms: u32,
}

/// Flags controlling how the database is opened.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct OpenFlags {
    /// Open for reading only.
    pub read_only: bool,
    /// Open for reading and writing.
    pub read_write: bool,
    /// Create the database if it doesn't exist.
    pub create: bool,
    /// Open in serialized mode.
    pub full_mutex: bool,
}

impl OpenFlags {
    /// Create flags for read-only access.
    pub fn read_only() -> Self {
        Self {
            read_only: true,
            ..Default::default()
        }
    }

    /// Create flags for read-write access (database must exist).
    pub fn read_write() -> Self {
        Self {
            read_write: true,
            ..Default::default()
        }
    }

    /// Create flags for read-write access with creation if needed.
    pub fn create_read_write() -> Self {
        Self {
            read_write: true,
            create: true,
            ..Default::default()
        }
    }

    fn to_sqlite_flags(self) -> c_int {
        let mut flags = 0;

        if self.read_only {
            flags |= ffi::SQLITE_OPEN_READONLY;
        }
        if self.read_write {
            flags |= ffi::SQLITE_OPEN_READWRITE;
        }
        if self.create {
            flags |= ffi::SQLITE_OPEN_CREATE;
        }
        if self.full_mutex {
            flags |= ffi::SQLITE_OPEN_FULLMUTEX;
        }

        // Default to read-write if no mode specified
        if flags & (ffi::SQLITE_OPEN_READONLY | ffi::SQLITE_OPEN_READWRITE) == 0 {
            flags |= ffi::SQLITE_OPEN_READWRITE | ffi::SQLITE_OPEN_CREATE;
        }

        flags
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from(MEMORY_PATH),
            flags: OpenFlags::create_read_write(),
            busy_timeout_ms: DEFAULT_BUSY_TIMEOUT_MS,
        }
    }
}

impl DatabaseConfig {
    /// Config for the database of one wiki: `<data_dir>/<wiki_id>.db`.
    pub fn wiki(data_dir: impl AsRef<Path>, wiki_id: &str) -> Self {
        Self::file(data_dir.as_ref().join(format!("{}.db", wiki_id)))
    }

    /// Create a new config for a file-based database.
    pub fn file(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            ..Self::default()
        }
    }

    /// Create a new config for an in-memory database.
    pub fn memory() -> Self {
        Self::default()
    }

    /// Set open flags.
    pub fn flags(mut self, flags: OpenFlags) -> Self {
        self.flags = flags;
        self
    }

    /// Set busy timeout.
    pub fn busy_timeout(mut self, ms: u32) -> Self {
        self.busy_timeout_ms = ms;
        self
    }
}

/// Connection state, protected by the handle's mutex.
struct DatabaseInner {
    db: *mut ffi::sqlite3,
    /// Nesting depth of `begin()` calls
    depth: u32,
}

// SAFETY: the raw handle is only ever used while the owning Mutex is held.
unsafe impl Send for DatabaseInner {}

/// Lock on [`DatabaseInner`] that records the holding thread, so a SQL
/// function calling back into the same handle fails instead of deadlocking.
struct InnerGuard<'a> {
    inner: MutexGuard<'a, DatabaseInner>,
    holder: &'a Mutex<Option<ThreadId>>,
}

impl Deref for InnerGuard<'_> {
    type Target = DatabaseInner;

    fn deref(&self) -> &DatabaseInner {
        &self.inner
    }
}

impl DerefMut for InnerGuard<'_> {
    fn deref_mut(&mut self) -> &mut DatabaseInner {
        &mut self.inner
    }
}

impl Drop for InnerGuard<'_> {
    fn drop(&mut self) {
        // Cleared before `inner` unlocks.
        *self.holder.lock().unwrap_or_else(PoisonError::into_inner) = None;
    }
}

/// An open wiki database.
///
/// Created explicitly with [`Database::open`] and closed on drop. A
/// transaction still open at that point is rolled back first.
pub struct Database {
    inner: Mutex<DatabaseInner>,
    /// Thread currently holding `inner`
    holder: Mutex<Option<ThreadId>>,
    path: PathBuf,
    functions: FunctionRegistry,
}

impl Database {
    /// Open a database with the given configuration.
    ///
    /// Registers the `call`, `encode_binary` and `decode_binary` SQL
    /// functions. When the engine refuses to open the file, the data
    /// directory and the file are checked for write access so the error can
    /// say which one is at fault.
    #[tracing::instrument(level = "debug", skip(config), fields(path = %config.path.display()))]
    pub fn open(config: &DatabaseConfig) -> Result<Self> {
        let path = &config.path;
        let c_path = path_cstring(path).ok_or_else(|| {
            Error::Connection(ConnectionError {
                kind: ConnectionErrorKind::OpenFailed,
                path: path.clone(),
                message: "Invalid path: contains null byte or is not representable".to_string(),
                denied: None,
            })
        })?;

        let mut db: *mut ffi::sqlite3 = ptr::null_mut();
        let flags = config.flags.to_sqlite_flags();

        // SAFETY: We pass valid pointers and check the return value
        let rc = unsafe { ffi::sqlite3_open_v2(c_path.as_ptr(), &mut db, flags, ptr::null()) };

        if rc != ffi::SQLITE_OK {
            let message = if db.is_null() {
                ffi::error_string(rc).to_string()
            } else {
                // SAFETY: db is a handle SQLite allocated for this failed open
                unsafe {
                    let (_, msg) = ffi::last_error(db);
                    ffi::sqlite3_close_v2(db);
                    msg
                }
            };
            return Err(open_error(path, message));
        }

        if config.busy_timeout_ms > 0 {
            let ms = c_int::try_from(config.busy_timeout_ms).unwrap_or(c_int::MAX);
            // SAFETY: db is valid
            unsafe {
                ffi::sqlite3_busy_timeout(db, ms);
            }
        }

        let database = Self {
            inner: Mutex::new(DatabaseInner { db, depth: 0 }),
            holder: Mutex::new(None),
            path: path.clone(),
            functions: FunctionRegistry::new(),
        };
        database.register_builtins()?;

        tracing::debug!(flags, busy_timeout_ms = config.busy_timeout_ms, "Database opened");
        Ok(database)
    }

    /// Open an in-memory database.
    pub fn open_memory() -> Result<Self> {
        Self::open(&DatabaseConfig::memory())
    }

    /// Open the database of one wiki inside `data_dir`.
    pub fn open_wiki(data_dir: impl AsRef<Path>, wiki_id: &str) -> Result<Self> {
        Self::open(&DatabaseConfig::wiki(data_dir, wiki_id))
    }

    /// Get the database path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn register_builtins(&self) -> Result<()> {
        let inner = self.lock()?;
        let builtins = functions::codec_functions();
        for function in &builtins {
            self.install(&inner, function)?;
        }
        self.install(&inner, &self.functions.dispatcher())?;
        for function in builtins {
            self.functions.insert(function);
        }
        Ok(())
    }

    fn install(&self, inner: &DatabaseInner, function: &ScalarFunction) -> Result<()> {
        // SAFETY: db is valid while the lock is held
        let rc = unsafe { functions::install(inner.db, function) };
        registration_result(inner, function.name(), rc)
    }

    /// Lock the connection for the calling thread.
    ///
    /// Fails with [`QueryErrorKind::Reentrant`] when the thread already holds
    /// the lock, which happens when a SQL function calls back into the handle
    /// running its statement.
    fn lock(&self) -> Result<InnerGuard<'_>> {
        let current = thread::current().id();
        if *self.holder.lock().unwrap_or_else(PoisonError::into_inner) == Some(current) {
            tracing::warn!(path = %self.path.display(), "Re-entrant database use from a SQL function");
            return Err(Error::Query(QueryError {
                kind: QueryErrorKind::Reentrant,
                sql: None,
                message: "database is already executing a statement on this thread; \
                          SQL functions cannot use the handle that calls them"
                    .to_string(),
                denied: None,
            }));
        }
        let inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        *self.holder.lock().unwrap_or_else(PoisonError::into_inner) = Some(current);
        Ok(InnerGuard {
            inner,
            holder: &self.holder,
        })
    }

    /// Run one or more statements that return no rows.
    pub fn exec(&self, sql: impl AsRef<[u8]>) -> Result<()> {
        let sql = sql.as_ref();
        let inner = self.lock()?;
        self.exec_locked(&inner, sql)
    }

    fn exec_locked(&self, inner: &DatabaseInner, sql: &[u8]) -> Result<()> {
        tracing::trace!(sql = %String::from_utf8_lossy(sql), "Executing statements");
        let c_sql = sql_cstring(sql)?;
        // SAFETY: db is valid while the lock is held
        unsafe { exec_raw(inner.db, &c_sql) }
            .map_err(|(code, message)| self.query_error(code, message, sql))
    }

    /// Run a query and return all rows.
    pub fn query(&self, sql: impl AsRef<[u8]>) -> Result<Vec<Row>> {
        self.fetch(sql.as_ref(), &[], None)
    }

    /// Run a parameterized query and return all rows.
    pub fn query_with(&self, sql: impl AsRef<[u8]>, params: &[Value]) -> Result<Vec<Row>> {
        self.fetch(sql.as_ref(), params, None)
    }

    /// Run a query and return its first row, if any.
    pub fn query_row(&self, sql: impl AsRef<[u8]>) -> Result<Option<Row>> {
        Ok(self.fetch(sql.as_ref(), &[], Some(1))?.into_iter().next())
    }

    /// Run a query and return the first column of every row.
    pub fn query_column(&self, sql: impl AsRef<[u8]>) -> Result<Vec<Value>> {
        Ok(self
            .fetch(sql.as_ref(), &[], None)?
            .into_iter()
            .filter_map(|row| row.into_values().into_iter().next())
            .collect())
    }

    /// Prepare and execute a single statement, returning rows changed.
    pub fn execute(&self, sql: impl AsRef<[u8]>, params: &[Value]) -> Result<u64> {
        let sql = sql.as_ref();
        tracing::trace!(sql = %String::from_utf8_lossy(sql), params = params.len(), "Executing statement");

        let inner = self.lock()?;
        let stmt = self.prepare(&inner, sql, params)?;

        // SAFETY: stmt is valid
        let rc = unsafe { ffi::sqlite3_step(stmt) };

        let result = match rc {
            // SAFETY: db is valid
            ffi::SQLITE_DONE | ffi::SQLITE_ROW => Ok(count(unsafe { ffi::sqlite3_changes(inner.db) })),
            _ => Err(self.engine_error(inner.db, sql)),
        };

        // SAFETY: stmt is valid
        unsafe { ffi::sqlite3_finalize(stmt) };
        result
    }

    /// Prepare, bind and step a query, collecting up to `limit` rows.
    fn fetch(&self, sql: &[u8], params: &[Value], limit: Option<usize>) -> Result<Vec<Row>> {
        tracing::trace!(sql = %String::from_utf8_lossy(sql), params = params.len(), "Executing query");

        let inner = self.lock()?;
        let stmt = self.prepare(&inner, sql, params)?;

        // SAFETY: stmt is valid
        let col_count = unsafe { ffi::sqlite3_column_count(stmt) };
        let col_names = (0..col_count)
            // SAFETY: stmt is valid, index is in range
            .map(|i| unsafe { types::column_name(stmt, i) }.unwrap_or_else(|| format!("col{}", i)))
            .collect();
        let columns = Arc::new(ColumnInfo::new(col_names));

        let mut rows = Vec::new();
        let result = loop {
            if limit.is_some_and(|max| rows.len() >= max) {
                break Ok(());
            }
            // SAFETY: stmt is valid
            let rc = unsafe { ffi::sqlite3_step(stmt) };
            match rc {
                ffi::SQLITE_ROW => {
                    let values = (0..col_count)
                        // SAFETY: stmt is valid, we just got SQLITE_ROW
                        .map(|i| unsafe { types::read_column(stmt, i) })
                        .collect();
                    rows.push(Row::with_columns(Arc::clone(&columns), values));
                }
                ffi::SQLITE_DONE => break Ok(()),
                _ => break Err(self.engine_error(inner.db, sql)),
            }
        };

        // SAFETY: stmt is valid
        unsafe { ffi::sqlite3_finalize(stmt) };
        result.map(|()| rows)
    }

    /// Prepare `sql` and bind `params`; the caller finalizes the statement.
    fn prepare(
        &self,
        inner: &DatabaseInner,
        sql: &[u8],
        params: &[Value],
    ) -> Result<*mut ffi::sqlite3_stmt> {
        let c_sql = sql_cstring(sql)?;
        let mut stmt: *mut ffi::sqlite3_stmt = ptr::null_mut();

        // SAFETY: All pointers are valid
        let rc = unsafe {
            ffi::sqlite3_prepare_v2(inner.db, c_sql.as_ptr(), -1, &mut stmt, ptr::null_mut())
        };
        if rc != ffi::SQLITE_OK {
            return Err(self.engine_error(inner.db, sql));
        }
        if stmt.is_null() {
            // Whitespace or comments only
            return Err(Error::Query(QueryError {
                kind: QueryErrorKind::Syntax,
                sql: Some(String::from_utf8_lossy(sql).into_owned()),
                message: "SQL contains no statement".to_string(),
                denied: None,
            }));
        }

        for (i, param) in params.iter().enumerate() {
            let index = (i + 1) as c_int;
            // SAFETY: stmt is valid, index is 1-based
            let rc = unsafe { types::bind_value(stmt, index, param) };
            if rc != ffi::SQLITE_OK {
                // SAFETY: db is valid
                let (_, msg) = unsafe { ffi::last_error(inner.db) };
                // SAFETY: stmt is valid
                unsafe { ffi::sqlite3_finalize(stmt) };
                return Err(self.query_error(
                    rc,
                    format!("Failed to bind parameter {}: {}", index, msg),
                    sql,
                ));
            }
        }

        Ok(stmt)
    }

    /// Escape text for use inside a `'...'` literal.
    pub fn escape(&self, text: &str) -> String {
        escape_text(text)
    }

    /// Escape arbitrary bytes for use inside a `'...'` literal, switching to
    /// the binary encoding when the bytes need it.
    pub fn escape_binary(&self, bytes: &[u8]) -> Vec<u8> {
        escape_for_literal(bytes)
    }

    /// Reverse [`Database::escape_binary`] on a value read back from a row.
    pub fn unescape_binary<'a>(&self, bytes: &'a [u8]) -> Result<Cow<'a, [u8]>> {
        unescape_from_literal(bytes).map_err(Error::from)
    }

    /// Get the number of rows changed by the last statement.
    pub fn changes(&self) -> Result<u64> {
        let inner = self.lock()?;
        // SAFETY: db is valid
        Ok(count(unsafe { ffi::sqlite3_changes(inner.db) }))
    }

    /// Get the last insert rowid.
    pub fn last_insert_rowid(&self) -> Result<i64> {
        let inner = self.lock()?;
        // SAFETY: db is valid
        Ok(unsafe { ffi::sqlite3_last_insert_rowid(inner.db) })
    }

    /// Current nesting depth of [`Database::begin`].
    pub fn transaction_depth(&self) -> Result<u32> {
        Ok(self.lock()?.depth)
    }

    /// Begin a transaction, or join the one already open.
    ///
    /// Only the outermost call issues `BEGIN TRANSACTION`.
    pub fn begin(&self) -> Result<()> {
        let mut inner = self.lock()?;
        if inner.depth == 0 {
            self.exec_locked(&inner, b"BEGIN TRANSACTION")?;
            tracing::debug!(path = %self.path.display(), "Transaction started");
        }
        inner.depth += 1;
        Ok(())
    }

    /// Leave one level of transaction nesting, committing at the outermost.
    ///
    /// A failed `COMMIT` leaves the depth unchanged so the caller can still
    /// roll back.
    pub fn commit(&self) -> Result<()> {
        let mut inner = self.lock()?;
        match inner.depth {
            0 => Err(not_in_transaction("commit")),
            1 => {
                self.exec_locked(&inner, b"COMMIT")?;
                inner.depth = 0;
                tracing::debug!(path = %self.path.display(), "Transaction committed");
                Ok(())
            }
            _ => {
                inner.depth -= 1;
                Ok(())
            }
        }
    }

    /// Roll back the whole transaction, whatever the nesting depth.
    pub fn rollback(&self) -> Result<()> {
        let mut inner = self.lock()?;
        if inner.depth == 0 {
            return Err(not_in_transaction("rollback"));
        }
        let result = self.exec_locked(&inner, b"ROLLBACK");
        inner.depth = 0;
        tracing::debug!(path = %self.path.display(), ok = result.is_ok(), "Transaction rolled back");
        result
    }

    /// Check whether a permanent or temporary table named `name` exists.
    pub fn is_table(&self, name: &str) -> Result<bool> {
        // No table name can hold NUL, and the statement could not carry it.
        if name.contains('\0') {
            return Ok(false);
        }
        let name = self.escape(name);
        let sql = format!(
            "SELECT name FROM sqlite_master WHERE type = 'table' AND name = '{name}' \
             UNION ALL \
             SELECT name FROM sqlite_temp_master WHERE type = 'table' AND name = '{name}'"
        );
        Ok(self.query_row(sql)?.is_some())
    }

    /// Register a native scalar function with the engine and with the
    /// registry behind `call()`.
    ///
    /// `n_args == -1` makes the function variadic. Errors returned by `func`
    /// surface as SQL errors of the calling statement.
    #[tracing::instrument(level = "debug", skip(self, func))]
    pub fn create_function<F>(&self, name: &str, n_args: i32, func: F) -> Result<()>
    where
        F: Fn(&[Value]) -> Result<Value> + Send + Sync + 'static,
    {
        if name.eq_ignore_ascii_case(CALL_FUNCTION) {
            return Err(Error::Config(ConfigError {
                message: format!("'{}' is reserved for the function dispatcher", CALL_FUNCTION),
            }));
        }
        let function = ScalarFunction::new(name, n_args, func)?;
        let inner = self.lock()?;
        self.install(&inner, &function)?;
        self.functions.insert(function);
        tracing::debug!("SQL function registered");
        Ok(())
    }

    /// Register a native aggregate function.
    ///
    /// Each group starts from `init()`, folds every row's arguments in with
    /// `step` and yields `finalize(state)`. A group without rows, such as an
    /// aggregate over an empty table, finalizes a fresh `init()` state.
    /// Aggregates are not reachable through `call()`.
    #[tracing::instrument(level = "debug", skip(self, init, step, finalize))]
    pub fn create_aggregate<S, I, St, F>(
        &self,
        name: &str,
        n_args: i32,
        init: I,
        step: St,
        finalize: F,
    ) -> Result<()>
    where
        S: 'static,
        I: Fn() -> S + Send + Sync + 'static,
        St: Fn(&mut S, &[Value]) -> Result<()> + Send + Sync + 'static,
        F: Fn(S) -> Result<Value> + Send + Sync + 'static,
    {
        if name.eq_ignore_ascii_case(CALL_FUNCTION) {
            return Err(Error::Config(ConfigError {
                message: format!("'{}' is reserved for the function dispatcher", CALL_FUNCTION),
            }));
        }
        let function = AggregateFunction::new(name, n_args, init, step, finalize)?;
        let inner = self.lock()?;
        // SAFETY: db is valid while the lock is held
        let rc = unsafe { functions::install_aggregate(inner.db, &function) };
        registration_result(&inner, function.name(), rc)?;
        self.functions.insert_aggregate(function);
        tracing::debug!("SQL aggregate registered");
        Ok(())
    }

    /// Names of every function reachable through `call()`, sorted.
    pub fn registered_functions(&self) -> Vec<String> {
        self.functions.names()
    }

    /// Names of every registered aggregate, sorted.
    pub fn registered_aggregates(&self) -> Vec<String> {
        self.functions.aggregate_names()
    }

    fn engine_error(&self, db: *mut ffi::sqlite3, sql: &[u8]) -> Error {
        // SAFETY: db is valid
        let (code, message) = unsafe { ffi::last_error(db) };
        self.query_error(code, message, sql)
    }

    fn query_error(&self, code: c_int, message: String, sql: &[u8]) -> Error {
        let denied = if is_access_failure(code) {
            diagnose_permissions(&self.path)
        } else {
            None
        };
        Error::Query(QueryError {
            kind: error_code_to_kind(code),
            sql: Some(String::from_utf8_lossy(sql).into_owned()),
            message,
            denied,
        })
    }
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database")
            .field("path", &self.path)
            .field("depth", &self.inner.try_lock().ok().map(|inner| inner.depth))
            .field("functions", &self.functions.names())
            .finish()
    }
}

impl Drop for Database {
    fn drop(&mut self) {
        let inner = self.inner.get_mut().unwrap_or_else(PoisonError::into_inner);
        if inner.db.is_null() {
            return;
        }
        if inner.depth > 0 {
            tracing::warn!(
                path = %self.path.display(),
                depth = inner.depth,
                "Rolling back transaction left open at close"
            );
            // SAFETY: db is valid
            if let Err((_, message)) = unsafe { exec_raw(inner.db, c"ROLLBACK") } {
                tracing::warn!(error = %message, "Rollback on close failed");
            }
        }
        // SAFETY: db is valid and not used after this point
        unsafe {
            ffi::sqlite3_close_v2(inner.db);
        }
        inner.db = ptr::null_mut();
        tracing::debug!(path = %self.path.display(), "Database closed");
    }
}

#[cfg(unix)]
fn path_cstring(path: &Path) -> Option<CString> {
    use std::os::unix::ffi::OsStrExt;
    CString::new(path.as_os_str().as_bytes()).ok()
}

#[cfg(not(unix))]
fn path_cstring(path: &Path) -> Option<CString> {
    path.to_str().and_then(|p| CString::new(p).ok())
}

fn registration_result(inner: &DatabaseInner, name: &str, rc: c_int) -> Result<()> {
    if rc == ffi::SQLITE_OK {
        return Ok(());
    }
    // SAFETY: db is valid while the caller holds the lock
    let (_, message) = unsafe { ffi::last_error(inner.db) };
    Err(Error::Query(QueryError {
        kind: QueryErrorKind::Function,
        sql: None,
        message: format!("Failed to register {}(): {}", name, message),
        denied: None,
    }))
}

fn sql_cstring(sql: &[u8]) -> Result<CString> {
    CString::new(sql).map_err(|_| {
        Error::Query(QueryError {
            kind: QueryErrorKind::Syntax,
            sql: Some(String::from_utf8_lossy(sql).into_owned()),
            message: "SQL contains null byte".to_string(),
            denied: None,
        })
    })
}

/// Run statements through `sqlite3_exec`, returning the code and message on
/// failure.
///
/// # Safety
/// `db` must be a valid connection handle.
unsafe fn exec_raw(
    db: *mut ffi::sqlite3,
    sql: &CStr,
) -> std::result::Result<(), (c_int, String)> {
    let mut errmsg: *mut std::ffi::c_char = ptr::null_mut();

    // SAFETY: All pointers are valid
    let rc = unsafe { ffi::sqlite3_exec(db, sql.as_ptr(), None, ptr::null_mut(), &mut errmsg) };

    if rc == ffi::SQLITE_OK {
        return Ok(());
    }

    let msg = if errmsg.is_null() {
        ffi::error_string(rc).to_string()
    } else {
        // SAFETY: errmsg was allocated by SQLite and is released here
        unsafe {
            let msg = CStr::from_ptr(errmsg).to_string_lossy().into_owned();
            ffi::sqlite3_free(errmsg.cast());
            msg
        }
    };
    Err((rc, msg))
}

fn count(changes: c_int) -> u64 {
    u64::try_from(changes).unwrap_or(0)
}

fn not_in_transaction(op: &str) -> Error {
    Error::Transaction(TransactionError {
        kind: TransactionErrorKind::NotInTransaction,
        message: format!("Cannot {} outside a transaction", op),
    })
}

fn open_error(path: &Path, message: String) -> Error {
    let denied = diagnose_permissions(path);
    Error::Connection(ConnectionError {
        kind: if denied.is_some() {
            ConnectionErrorKind::PermissionDenied
        } else {
            ConnectionErrorKind::OpenFailed
        },
        path: path.to_path_buf(),
        message,
        denied,
    })
}

/// Result codes worth checking file permissions for.
fn is_access_failure(code: c_int) -> bool {
    matches!(
        code,
        ffi::SQLITE_READONLY | ffi::SQLITE_PERM | ffi::SQLITE_CANTOPEN | ffi::SQLITE_IOERR
    )
}

/// Find which location, if any, lacks write permission: the directory that
/// holds the database, then the database file itself.
fn diagnose_permissions(path: &Path) -> Option<Denied> {
    if path.as_os_str().is_empty() || path == Path::new(MEMORY_PATH) {
        return None;
    }
    let dir = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    if is_read_only(dir) {
        return Some(Denied::DataDir(dir.to_path_buf()));
    }
    if is_read_only(path) {
        return Some(Denied::DatabaseFile(path.to_path_buf()));
    }
    None
}

/// Missing paths are not read-only; they fail for some other reason.
fn is_read_only(path: &Path) -> bool {
    std::fs::metadata(path).is_ok_and(|m| m.permissions().readonly())
}

fn error_code_to_kind(code: c_int) -> QueryErrorKind {
    match code {
        ffi::SQLITE_ERROR => QueryErrorKind::Syntax,
        ffi::SQLITE_CONSTRAINT => QueryErrorKind::Constraint,
        ffi::SQLITE_BUSY | ffi::SQLITE_LOCKED => QueryErrorKind::Busy,
        ffi::SQLITE_READONLY => QueryErrorKind::ReadOnly,
        ffi::SQLITE_PERM | ffi::SQLITE_AUTH | ffi::SQLITE_CANTOPEN => QueryErrorKind::Permission,
        ffi::SQLITE_TOOBIG => QueryErrorKind::TooBig,
        ffi::SQLITE_INTERRUPT => QueryErrorKind::Interrupted,
        _ => QueryErrorKind::Database,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hideable_core::literal::quote_literal;

    fn memory_with_table() -> Database {
        let db = Database::open_memory().unwrap();
        db.exec("CREATE TABLE page (id INTEGER PRIMARY KEY, name TEXT, body TEXT)")
            .unwrap();
        db
    }

    #[test]
    fn test_open_memory() {
        let db = Database::open_memory().unwrap();
        assert_eq!(db.path(), Path::new(":memory:"));
        assert_eq!(db.transaction_depth().unwrap(), 0);
    }

    #[test]
    fn test_handle_is_send_and_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<Database>();
    }

    #[test]
    fn test_exec_changes_and_rowid() {
        let db = memory_with_table();
        db.exec("INSERT INTO page (name) VALUES ('Front'); INSERT INTO page (name) VALUES ('Help')")
            .unwrap();
        assert_eq!(db.changes().unwrap(), 1);
        assert_eq!(db.last_insert_rowid().unwrap(), 2);
    }

    #[test]
    fn test_query_variants() {
        let db = memory_with_table();
        db.exec("INSERT INTO page (name) VALUES ('Alice'), ('Bob')")
            .unwrap();

        let rows = db.query("SELECT id, name FROM page ORDER BY id").unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[1].get_named::<String>("name").unwrap(), "Bob");

        let first = db.query_row("SELECT name FROM page ORDER BY id").unwrap();
        assert_eq!(
            first.unwrap().get_named::<String>("name").unwrap(),
            "Alice"
        );
        assert!(
            db.query_row("SELECT name FROM page WHERE id = 99")
                .unwrap()
                .is_none()
        );

        let names = db.query_column("SELECT name FROM page ORDER BY id").unwrap();
        assert_eq!(names, vec![Value::from("Alice"), Value::from("Bob")]);
    }

    #[test]
    fn test_parameterized_statements() {
        let db = memory_with_table();
        let changed = db
            .execute(
                "INSERT INTO page (name, body) VALUES (?, ?)",
                &[Value::from("Front"), Value::Null],
            )
            .unwrap();
        assert_eq!(changed, 1);

        let rows = db
            .query_with("SELECT body FROM page WHERE name = ?", &[Value::from("Front")])
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].get_named::<Option<String>>("body").unwrap(), None);
    }

    #[test]
    fn test_binary_literal_round_trip() {
        let db = memory_with_table();
        let raw: Vec<u8> = vec![0x01, 0x00, b'\'', 0xff, 0x27, 0x00];

        let mut sql = b"INSERT INTO page (name, body) VALUES ('bin', ".to_vec();
        sql.extend(quote_literal(&raw));
        sql.push(b')');
        db.exec(&sql).unwrap();

        let row = db
            .query_row("SELECT body FROM page WHERE name = 'bin'")
            .unwrap()
            .unwrap();
        let stored = row.get_bytes("body").unwrap();
        assert_eq!(&*db.unescape_binary(stored).unwrap(), raw.as_slice());
    }

    #[test]
    fn test_codec_sql_functions() {
        let db = Database::open_memory().unwrap();
        let row = db
            .query_row("SELECT decode_binary(encode_binary(x'00012700')) AS v")
            .unwrap()
            .unwrap();
        assert_eq!(row.get_named::<Vec<u8>>("v").unwrap(), vec![0, 1, 0x27, 0]);

        let row = db.query_row("SELECT decode_binary(NULL) AS v").unwrap().unwrap();
        assert_eq!(row.get_by_name("v"), Some(&Value::Null));

        let err = db.query("SELECT decode_binary(x'01')").unwrap_err();
        assert!(err.is_query_failed());
        assert!(err.to_string().contains("malformed"));
    }

    #[test]
    fn test_nested_transactions() {
        let db = memory_with_table();
        db.begin().unwrap();
        db.begin().unwrap();
        assert_eq!(db.transaction_depth().unwrap(), 2);
        db.exec("INSERT INTO page (name) VALUES ('inner')").unwrap();
        db.commit().unwrap();
        assert_eq!(db.transaction_depth().unwrap(), 1);
        db.commit().unwrap();
        assert_eq!(db.transaction_depth().unwrap(), 0);
        assert_eq!(db.query("SELECT * FROM page").unwrap().len(), 1);

        db.begin().unwrap();
        db.begin().unwrap();
        db.exec("INSERT INTO page (name) VALUES ('discarded')").unwrap();
        db.rollback().unwrap();
        assert_eq!(db.transaction_depth().unwrap(), 0);
        assert_eq!(db.query("SELECT * FROM page").unwrap().len(), 1);
    }

    #[test]
    fn test_commit_without_begin_fails() {
        let db = Database::open_memory().unwrap();
        assert!(matches!(db.commit(), Err(Error::Transaction(_))));
        assert!(matches!(db.rollback(), Err(Error::Transaction(_))));
        assert_eq!(db.transaction_depth().unwrap(), 0);
    }

    #[test]
    fn test_is_table() {
        let db = memory_with_table();
        db.exec("CREATE TEMP TABLE scratch (x)").unwrap();
        assert!(db.is_table("page").unwrap());
        assert!(db.is_table("scratch").unwrap());
        assert!(!db.is_table("missing").unwrap());
        assert!(!db.is_table("page' OR '1'='1").unwrap());
        assert!(!db.is_table("page\0").unwrap());
        assert!(!db.is_table("\0").unwrap());
    }

    #[test]
    fn test_create_function_and_call() {
        let db = Database::open_memory().unwrap();
        db.create_function("shout", 1, |args| {
            Ok(Value::Text(args[0].as_str().unwrap_or_default().to_uppercase()))
        })
        .unwrap();

        let direct = db.query_column("SELECT shout('wiki')").unwrap();
        assert_eq!(direct, vec![Value::from("WIKI")]);

        let via_call = db.query_column("SELECT call('shout', 'page')").unwrap();
        assert_eq!(via_call, vec![Value::from("PAGE")]);

        assert_eq!(
            db.query_column("SELECT call()").unwrap(),
            vec![Value::Null]
        );
        assert_eq!(
            db.registered_functions(),
            vec!["decode_binary", "encode_binary", "shout"]
        );
    }

    #[test]
    fn test_function_errors_become_sql_errors() {
        let db = Database::open_memory().unwrap();
        db.create_function("fails", 0, |_| Err(Error::Custom("no such page".into())))
            .unwrap();
        db.create_function("panics", 0, |_| panic!("boom")).unwrap();

        let err = db.query("SELECT fails()").unwrap_err();
        assert!(err.to_string().contains("no such page"));
        assert!(db.query("SELECT panics()").is_err());
        assert!(db.query("SELECT call('missing')").is_err());
    }

    #[test]
    fn test_function_using_its_own_handle_fails() {
        let db = Arc::new(memory_with_table());
        let handle = Arc::downgrade(&db);
        let inner_kind = Arc::new(Mutex::new(None));
        let seen = Arc::clone(&inner_kind);
        db.create_function("lookup", 0, move |_| {
            let db = handle
                .upgrade()
                .ok_or_else(|| Error::Custom("database closed".into()))?;
            let result = db.is_table("page");
            if let Err(Error::Query(q)) = &result {
                *seen.lock().unwrap() = Some(q.kind);
            }
            result.map(Value::from)
        })
        .unwrap();

        let err = db.query("SELECT lookup()").unwrap_err();
        assert!(err.is_query_failed());
        assert!(err.to_string().contains("SQL functions cannot use the handle"));
        assert_eq!(*inner_kind.lock().unwrap(), Some(QueryErrorKind::Reentrant));

        // The handle is released and usable afterwards.
        assert!(db.is_table("page").unwrap());
        assert_eq!(db.transaction_depth().unwrap(), 0);
    }

    #[test]
    fn test_other_threads_wait_instead_of_failing() {
        let db = Arc::new(memory_with_table());
        let workers: Vec<_> = (0..4)
            .map(|i| {
                let db = Arc::clone(&db);
                std::thread::spawn(move || {
                    db.execute(
                        "INSERT INTO page (name) VALUES (?)",
                        &[Value::from(format!("p{i}"))],
                    )
                })
            })
            .collect();
        for worker in workers {
            assert_eq!(worker.join().unwrap().unwrap(), 1);
        }
        assert_eq!(db.query("SELECT * FROM page").unwrap().len(), 4);
    }

    fn concat_all(db: &Database) {
        db.create_aggregate(
            "concat_all",
            1,
            Vec::<String>::new,
            |parts: &mut Vec<String>, args| {
                if let Some(text) = args[0].as_str() {
                    parts.push(text.to_string());
                }
                Ok(())
            },
            |mut parts| {
                parts.sort();
                Ok(Value::Text(parts.join(",")))
            },
        )
        .unwrap();
    }

    #[test]
    fn test_create_aggregate_groups() {
        let db = Database::open_memory().unwrap();
        db.exec(
            "CREATE TABLE revision (page TEXT, author TEXT); \
             INSERT INTO revision VALUES ('Main', 'bob'), ('Help', 'eve'), \
             ('Main', 'alice'), ('Main', NULL), ('Help', 'dan')",
        )
        .unwrap();
        concat_all(&db);

        let rows = db
            .query("SELECT page, concat_all(author) FROM revision GROUP BY page ORDER BY page")
            .unwrap();
        let groups: Vec<(String, String)> = rows
            .iter()
            .map(|row| (row.get_as(0).unwrap(), row.get_as(1).unwrap()))
            .collect();
        assert_eq!(
            groups,
            vec![
                ("Help".to_string(), "dan,eve".to_string()),
                ("Main".to_string(), "alice,bob".to_string()),
            ]
        );

        // No rows at all still yields the initial state.
        assert_eq!(
            db.query_column("SELECT concat_all(author) FROM revision WHERE 0")
                .unwrap(),
            vec![Value::Text(String::new())]
        );
        assert_eq!(db.registered_aggregates(), vec!["concat_all"]);
        assert!(!db.registered_functions().contains(&"concat_all".to_string()));
    }

    #[test]
    fn test_aggregate_errors_become_sql_errors() {
        let db = Database::open_memory().unwrap();
        db.exec("CREATE TABLE t (n INTEGER); INSERT INTO t VALUES (1), (2), (3)")
            .unwrap();
        db.create_aggregate(
            "strict_sum",
            1,
            || 0i64,
            |total: &mut i64, args| match args[0].as_i64() {
                Some(n) if n < 3 => {
                    *total += n;
                    Ok(())
                }
                _ => Err(Error::Custom("value out of range".into())),
            },
            |total| Ok(Value::Integer(total)),
        )
        .unwrap();
        db.create_aggregate(
            "panics_at_end",
            1,
            || (),
            |_: &mut (), _| Ok(()),
            |()| -> Result<Value> { panic!("boom") },
        )
        .unwrap();

        assert_eq!(
            db.query_column("SELECT strict_sum(n) FROM t WHERE n < 3").unwrap(),
            vec![Value::Integer(3)]
        );
        let err = db.query("SELECT strict_sum(n) FROM t").unwrap_err();
        assert!(err.to_string().contains("value out of range"));
        assert!(db.query("SELECT panics_at_end(n) FROM t").is_err());
        assert!(db.query("SELECT strict_sum(n, n) FROM t").is_err());
        assert!(matches!(
            db.create_aggregate("call", 1, || (), |_: &mut (), _| Ok(()), |()| Ok(Value::Null)),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn test_function_names_are_validated() {
        let db = Database::open_memory().unwrap();
        let noop = |_: &[Value]| -> Result<Value> { Ok(Value::Null) };
        assert!(matches!(
            db.create_function("bad name", 0, noop),
            Err(Error::Config(_))
        ));
        assert!(matches!(
            db.create_function("CALL", 0, noop),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn test_syntax_error_carries_sql() {
        let db = Database::open_memory().unwrap();
        match db.query("SELEC nothing") {
            Err(Error::Query(q)) => {
                assert_eq!(q.kind, QueryErrorKind::Syntax);
                assert_eq!(q.sql.as_deref(), Some("SELEC nothing"));
                assert!(q.denied.is_none());
            }
            other => panic!("expected query error, got {other:?}"),
        }
        assert!(db.query("   ").is_err());
    }

    #[test]
    fn test_constraint_kind() {
        let db = Database::open_memory().unwrap();
        db.exec("CREATE TABLE t (k TEXT UNIQUE)").unwrap();
        db.exec("INSERT INTO t VALUES ('a')").unwrap();
        match db.exec("INSERT INTO t VALUES ('a')") {
            Err(Error::Query(q)) => assert_eq!(q.kind, QueryErrorKind::Constraint),
            other => panic!("expected constraint error, got {other:?}"),
        }
    }

    #[test]
    fn test_drop_rolls_back_open_transaction() {
        let dir = tempfile::tempdir().unwrap();
        let config = DatabaseConfig::file(dir.path().join("wiki.db"));

        let db = Database::open(&config).unwrap();
        db.exec("CREATE TABLE page (name TEXT)").unwrap();
        db.begin().unwrap();
        db.exec("INSERT INTO page VALUES ('lost')").unwrap();
        drop(db);

        let db = Database::open(&config).unwrap();
        assert!(db.query("SELECT * FROM page").unwrap().is_empty());
    }

    #[test]
    fn test_read_only_flags() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ro.db");
        let db = Database::open(&DatabaseConfig::file(&path)).unwrap();
        db.exec("CREATE TABLE page (name TEXT)").unwrap();
        drop(db);

        let db = Database::open(&DatabaseConfig::file(&path).flags(OpenFlags::read_only()))
            .unwrap();
        assert!(db.query("SELECT * FROM page").unwrap().is_empty());
        match db.exec("INSERT INTO page VALUES ('x')") {
            Err(Error::Query(q)) => {
                assert_eq!(q.kind, QueryErrorKind::ReadOnly);
                assert!(q.denied.is_none());
            }
            other => panic!("expected read-only error, got {other:?}"),
        }
    }

    #[test]
    fn test_open_in_missing_directory_fails() {
        let dir = tempfile::tempdir().unwrap();
        let err = Database::open_wiki(dir.path().join("nope"), "main").unwrap_err();
        assert!(err.is_open_failed());
        assert!(!err.is_permission_denied());
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_open_non_utf8_path() {
        use std::ffi::OsStr;
        use std::os::unix::ffi::OsStrExt;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(OsStr::from_bytes(b"wiki-\xff.db"));
        assert!(path.to_str().is_none());

        let db = Database::open(&DatabaseConfig::file(&path)).unwrap();
        db.exec("CREATE TABLE page (name TEXT)").unwrap();
        drop(db);
        assert!(path.exists());

        let err = Database::open(&DatabaseConfig::file(dir.path().join("nul\0.db"))).unwrap_err();
        assert!(err.is_open_failed());
    }

    #[cfg(unix)]
    #[test]
    fn test_diagnose_permissions() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("wiki.db");
        std::fs::write(&file, b"").unwrap();
        assert_eq!(diagnose_permissions(&file), None);

        std::fs::set_permissions(&file, std::fs::Permissions::from_mode(0o444)).unwrap();
        assert_eq!(
            diagnose_permissions(&file),
            Some(Denied::DatabaseFile(file.clone()))
        );

        std::fs::set_permissions(dir.path(), std::fs::Permissions::from_mode(0o555)).unwrap();
        assert_eq!(
            diagnose_permissions(&file),
            Some(Denied::DataDir(dir.path().to_path_buf()))
        );

        std::fs::set_permissions(dir.path(), std::fs::Permissions::from_mode(0o755)).unwrap();
        assert_eq!(diagnose_permissions(Path::new(":memory:")), None);
    }

    #[test]
    fn test_open_flags() {
        assert_eq!(
            OpenFlags::default().to_sqlite_flags(),
            ffi::SQLITE_OPEN_READWRITE | ffi::SQLITE_OPEN_CREATE
        );
        assert_eq!(OpenFlags::read_only().to_sqlite_flags(), ffi::SQLITE_OPEN_READONLY);
        assert_eq!(OpenFlags::read_write().to_sqlite_flags(), ffi::SQLITE_OPEN_READWRITE);
    }

    #[test]
    fn test_config_builders() {
        let config = DatabaseConfig::wiki("/srv/wiki", "main").busy_timeout(100);
        assert_eq!(config.path, PathBuf::from("/srv/wiki/main.db"));
        assert_eq!(config.flags, OpenFlags::create_read_write());
        assert_eq!(config.busy_timeout_ms, 100);
    }

    #[test]
    fn test_config_from_json() {
        let config: DatabaseConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config.path, PathBuf::from(":memory:"));
        assert_eq!(config.busy_timeout_ms, 5000);
        assert_eq!(config.flags, OpenFlags::create_read_write());

        let config: DatabaseConfig = serde_json::from_str(
            r#"{"path": "/srv/wiki/main.db", "flags": {"read_only": true}}"#,
        )
        .unwrap();
        assert_eq!(config.path, PathBuf::from("/srv/wiki/main.db"));
        assert_eq!(config.flags, OpenFlags::read_only());
    }
}
