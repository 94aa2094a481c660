//! Value conversion between Rust and SQLite.
//!
//! SQLite has 5 storage classes (INTEGER, REAL, TEXT, BLOB, NULL), mapped
//! one to one onto [`Value`]. TEXT is read back byte for byte: if the bytes
//! are not UTF-8 the value comes back as [`Value::Blob`] instead of being
//! transcoded, so codec output stored in a text column survives intact.

use crate::ffi;
use hideable_core::Value;
use std::ffi::{CStr, CString, c_int};

/// Bind a Value to a prepared statement parameter.
///
/// # Safety
/// - `stmt` must be a valid, non-null prepared statement handle
/// - `index` must be a valid 1-based parameter index
pub unsafe fn bind_value(stmt: *mut ffi::sqlite3_stmt, index: c_int, value: &Value) -> c_int {
    // SAFETY: caller guarantees stmt/index; buffers are copied (TRANSIENT)
    unsafe {
        match value {
            Value::Null => ffi::sqlite3_bind_null(stmt, index),

            Value::Integer(v) => ffi::sqlite3_bind_int64(stmt, index, *v),

            Value::Real(v) => ffi::sqlite3_bind_double(stmt, index, *v),

            Value::Text(s) => match c_int::try_from(s.len()) {
                Ok(len) => ffi::sqlite3_bind_text(
                    stmt,
                    index,
                    s.as_ptr().cast(),
                    len,
                    ffi::SQLITE_TRANSIENT(),
                ),
                Err(_) => ffi::SQLITE_TOOBIG,
            },

            Value::Blob(b) => match c_int::try_from(b.len()) {
                Ok(len) => ffi::sqlite3_bind_blob(
                    stmt,
                    index,
                    b.as_ptr().cast(),
                    len,
                    ffi::SQLITE_TRANSIENT(),
                ),
                Err(_) => ffi::SQLITE_TOOBIG,
            },
        }
    }
}

/// Copy `len` bytes starting at `ptr`, treating a null pointer as empty.
///
/// # Safety
/// `ptr` must be null or point to at least `len` readable bytes.
unsafe fn copy_bytes(ptr: *const u8, len: c_int) -> Vec<u8> {
    match usize::try_from(len) {
        Ok(len) if !ptr.is_null() && len > 0 => {
            // SAFETY: caller guarantees ptr/len describe a live buffer
            unsafe { std::slice::from_raw_parts(ptr, len) }.to_vec()
        }
        _ => Vec::new(),
    }
}

/// Read a column value from a result row.
///
/// # Safety
/// - `stmt` must be a valid prepared statement that has just returned SQLITE_ROW
/// - `index` must be a valid 0-based column index
pub unsafe fn read_column(stmt: *mut ffi::sqlite3_stmt, index: c_int) -> Value {
    // SAFETY: caller guarantees stmt is positioned on a row. The pointer
    // accessor is called before sqlite3_column_bytes, as SQLite requires.
    unsafe {
        match ffi::sqlite3_column_type(stmt, index) {
            ffi::SQLITE_INTEGER => Value::Integer(ffi::sqlite3_column_int64(stmt, index)),

            ffi::SQLITE_FLOAT => Value::Real(ffi::sqlite3_column_double(stmt, index)),

            ffi::SQLITE_TEXT => {
                let ptr = ffi::sqlite3_column_text(stmt, index);
                let len = ffi::sqlite3_column_bytes(stmt, index);
                Value::from_text_bytes(copy_bytes(ptr.cast(), len))
            }

            ffi::SQLITE_BLOB => {
                let ptr = ffi::sqlite3_column_blob(stmt, index);
                let len = ffi::sqlite3_column_bytes(stmt, index);
                Value::Blob(copy_bytes(ptr.cast(), len))
            }

            _ => Value::Null,
        }
    }
}

/// Get the column name from a result.
///
/// # Safety
/// - `stmt` must be a valid prepared statement
/// - `index` must be a valid 0-based column index
pub unsafe fn column_name(stmt: *mut ffi::sqlite3_stmt, index: c_int) -> Option<String> {
    // SAFETY: caller guarantees stmt/index
    unsafe {
        let ptr = ffi::sqlite3_column_name(stmt, index);
        if ptr.is_null() {
            None
        } else {
            Some(CStr::from_ptr(ptr).to_string_lossy().into_owned())
        }
    }
}

/// Read a user-function argument.
///
/// # Safety
/// `value` must be a valid protected `sqlite3_value` for the duration of
/// the call.
pub unsafe fn read_argument(value: *mut ffi::sqlite3_value) -> Value {
    // SAFETY: caller guarantees value is valid
    unsafe {
        match ffi::sqlite3_value_type(value) {
            ffi::SQLITE_INTEGER => Value::Integer(ffi::sqlite3_value_int64(value)),

            ffi::SQLITE_FLOAT => Value::Real(ffi::sqlite3_value_double(value)),

            ffi::SQLITE_TEXT => {
                let ptr = ffi::sqlite3_value_text(value);
                let len = ffi::sqlite3_value_bytes(value);
                Value::from_text_bytes(copy_bytes(ptr.cast(), len))
            }

            ffi::SQLITE_BLOB => {
                let ptr = ffi::sqlite3_value_blob(value);
                let len = ffi::sqlite3_value_bytes(value);
                Value::Blob(copy_bytes(ptr.cast(), len))
            }

            _ => Value::Null,
        }
    }
}

/// Hand a user-function result back to SQLite.
///
/// # Safety
/// `ctx` must be the context of the function invocation in progress.
pub unsafe fn set_result(ctx: *mut ffi::sqlite3_context, value: &Value) {
    let too_big = || format!("{} result too large", value.type_name());
    // SAFETY: caller guarantees ctx; buffers are copied (TRANSIENT)
    unsafe {
        match value {
            Value::Null => ffi::sqlite3_result_null(ctx),
            Value::Integer(v) => ffi::sqlite3_result_int64(ctx, *v),
            Value::Real(v) => ffi::sqlite3_result_double(ctx, *v),
            Value::Text(s) => match c_int::try_from(s.len()) {
                Ok(len) => {
                    ffi::sqlite3_result_text(ctx, s.as_ptr().cast(), len, ffi::SQLITE_TRANSIENT());
                }
                Err(_) => set_error(ctx, &too_big()),
            },
            Value::Blob(b) => match c_int::try_from(b.len()) {
                Ok(len) => {
                    ffi::sqlite3_result_blob(ctx, b.as_ptr().cast(), len, ffi::SQLITE_TRANSIENT());
                }
                Err(_) => set_error(ctx, &too_big()),
            },
        }
    }
}

/// Report a user-function failure to SQLite.
///
/// # Safety
/// `ctx` must be the context of the function invocation in progress.
pub unsafe fn set_error(ctx: *mut ffi::sqlite3_context, message: &str) {
    let msg = CString::new(message.replace('\0', " ")).unwrap_or_default();
    // SAFETY: caller guarantees ctx; -1 means read up to the terminator and
    // SQLite copies the message
    unsafe { ffi::sqlite3_result_error(ctx, msg.as_ptr(), -1) };
}
