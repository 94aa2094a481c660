//! User-defined SQL functions.
//!
//! Scalar functions are native closures registered under a name. Each one
//! is installed in SQLite directly and also recorded in a
//! [`FunctionRegistry`], which backs the built-in `call(name, args...)` SQL
//! function so queries can dispatch to any registered function by name.
//!
//! Aggregate functions fold each group through an `init`/`step`/`finalize`
//! triple. The per-group state lives in SQLite's aggregate context.

use crate::ffi;
use crate::types;
use hideable_core::error::ConfigError;
use hideable_core::{Error, Result, Value, decode_binary, encode_binary};
use regex::Regex;
use std::any::Any;
use std::collections::HashMap;
use std::ffi::{CString, c_int, c_void};
use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::ptr;
use std::sync::{Arc, OnceLock, RwLock};

/// Signature every native scalar function implements.
pub type ScalarFn = dyn Fn(&[Value]) -> Result<Value> + Send + Sync;

/// Name of the built-in dispatcher function.
pub const CALL_FUNCTION: &str = "call";

const FUNCTION_NAME_PATTERN: &str = r"^[A-Za-z_][A-Za-z0-9_]*$";

/// Check that a function name is a plain SQL identifier.
pub fn is_valid_function_name(name: &str) -> bool {
    static PATTERN: OnceLock<std::result::Result<Regex, regex::Error>> = OnceLock::new();
    match PATTERN.get_or_init(|| Regex::new(FUNCTION_NAME_PATTERN)) {
        Ok(regex) => regex.is_match(name),
        Err(e) => {
            tracing::warn!(
                pattern = FUNCTION_NAME_PATTERN,
                error = %e,
                "Invalid function name pattern, rejecting name"
            );
            false
        }
    }
}

/// Reject names that are not SQL identifiers and impossible arities.
fn check_signature(name: &str, n_args: i32) -> Result<()> {
    if !is_valid_function_name(name) {
        return Err(Error::Config(ConfigError {
            message: format!("invalid SQL function name '{}'", name),
        }));
    }
    if !(-1..=127).contains(&n_args) {
        return Err(Error::Config(ConfigError {
            message: format!("function '{}' declares {} arguments", name, n_args),
        }));
    }
    Ok(())
}

fn check_arity(name: &str, n_args: i32, args: &[Value]) -> Result<()> {
    if n_args >= 0 && args.len() != n_args as usize {
        return Err(Error::Custom(format!(
            "{}() takes {} arguments, got {}",
            name,
            n_args,
            args.len()
        )));
    }
    Ok(())
}

/// A registered native scalar function.
#[derive(Clone)]
pub struct ScalarFunction {
    name: String,
    n_args: i32,
    func: Arc<ScalarFn>,
}

impl ScalarFunction {
    /// Create a function. `n_args == -1` accepts any number of arguments.
    pub fn new<F>(name: impl Into<String>, n_args: i32, func: F) -> Result<Self>
    where
        F: Fn(&[Value]) -> Result<Value> + Send + Sync + 'static,
    {
        let name = name.into();
        check_signature(&name, n_args)?;
        Ok(Self {
            name,
            n_args,
            func: Arc::new(func),
        })
    }

    /// The function's name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Declared argument count, `-1` for variadic.
    pub fn n_args(&self) -> i32 {
        self.n_args
    }

    /// Invoke the function, checking the argument count first.
    pub fn invoke(&self, args: &[Value]) -> Result<Value> {
        check_arity(&self.name, self.n_args, args)?;
        (self.func)(args)
    }
}

impl fmt::Debug for ScalarFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScalarFunction")
            .field("name", &self.name)
            .field("n_args", &self.n_args)
            .finish_non_exhaustive()
    }
}

type InitFn = dyn Fn() -> Box<dyn Any> + Send + Sync;
type StepFn = dyn Fn(&mut dyn Any, &[Value]) -> Result<()> + Send + Sync;
type FinalizeFn = dyn Fn(Box<dyn Any>) -> Result<Value> + Send + Sync;

/// A registered native aggregate function.
///
/// `init` creates the state of a group, `step` folds one row of arguments
/// into it and `finalize` turns it into the group's result. A group with no
/// rows is finalized from a fresh `init()` state.
#[derive(Clone)]
pub struct AggregateFunction {
    name: String,
    n_args: i32,
    init: Arc<InitFn>,
    step: Arc<StepFn>,
    finalize: Arc<FinalizeFn>,
}

fn state_mismatch(name: &str) -> Error {
    Error::Custom(format!("{}() aggregate state has an unexpected type", name))
}

impl AggregateFunction {
    /// Create an aggregate. `n_args == -1` accepts any number of arguments.
    pub fn new<S, I, St, F>(
        name: impl Into<String>,
        n_args: i32,
        init: I,
        step: St,
        finalize: F,
    ) -> Result<Self>
    where
        S: 'static,
        I: Fn() -> S + Send + Sync + 'static,
        St: Fn(&mut S, &[Value]) -> Result<()> + Send + Sync + 'static,
        F: Fn(S) -> Result<Value> + Send + Sync + 'static,
    {
        let name = name.into();
        check_signature(&name, n_args)?;

        let step_name = name.clone();
        let finalize_name = name.clone();
        Ok(Self {
            name,
            n_args,
            init: Arc::new(move || Box::new(init()) as Box<dyn Any>),
            step: Arc::new(move |state: &mut dyn Any, args: &[Value]| {
                let state = state
                    .downcast_mut::<S>()
                    .ok_or_else(|| state_mismatch(&step_name))?;
                step(state, args)
            }),
            finalize: Arc::new(move |state: Box<dyn Any>| {
                let state = state
                    .downcast::<S>()
                    .map_err(|_| state_mismatch(&finalize_name))?;
                finalize(*state)
            }),
        })
    }

    /// The function's name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Declared argument count, `-1` for variadic.
    pub fn n_args(&self) -> i32 {
        self.n_args
    }

    fn new_state(&self) -> Box<dyn Any> {
        (self.init)()
    }

    fn step_state(&self, state: &mut dyn Any, args: &[Value]) -> Result<()> {
        check_arity(&self.name, self.n_args, args)?;
        (self.step)(state, args)
    }

    fn finalize_state(&self, state: Box<dyn Any>) -> Result<Value> {
        (self.finalize)(state)
    }

    /// Fold one group of argument rows outside the engine.
    pub fn aggregate<'a, R>(&self, rows: R) -> Result<Value>
    where
        R: IntoIterator<Item = &'a [Value]>,
    {
        let mut state = self.new_state();
        for args in rows {
            self.step_state(&mut *state, args)?;
        }
        self.finalize_state(state)
    }
}

impl fmt::Debug for AggregateFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AggregateFunction")
            .field("name", &self.name)
            .field("n_args", &self.n_args)
            .finish_non_exhaustive()
    }
}

/// Name to function mapping shared by a connection and its `call` dispatcher.
#[derive(Debug, Clone, Default)]
pub struct FunctionRegistry {
    functions: Arc<RwLock<HashMap<String, ScalarFunction>>>,
    aggregates: Arc<RwLock<HashMap<String, AggregateFunction>>>,
}

impl FunctionRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace a function.
    pub fn insert(&self, function: ScalarFunction) {
        let mut map = self.functions.write().unwrap_or_else(|e| e.into_inner());
        map.insert(function.name.to_ascii_lowercase(), function);
    }

    /// Look a function up by name, ignoring ASCII case as SQL does.
    pub fn get(&self, name: &str) -> Option<ScalarFunction> {
        let map = self.functions.read().unwrap_or_else(|e| e.into_inner());
        map.get(&name.to_ascii_lowercase()).cloned()
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<String> {
        let map = self.functions.read().unwrap_or_else(|e| e.into_inner());
        let mut names: Vec<String> = map.values().map(|f| f.name.clone()).collect();
        names.sort();
        names
    }

    /// Add or replace an aggregate.
    pub fn insert_aggregate(&self, function: AggregateFunction) {
        let mut map = self.aggregates.write().unwrap_or_else(|e| e.into_inner());
        map.insert(function.name.to_ascii_lowercase(), function);
    }

    /// Registered aggregate names, sorted.
    pub fn aggregate_names(&self) -> Vec<String> {
        let map = self.aggregates.read().unwrap_or_else(|e| e.into_inner());
        let mut names: Vec<String> = map.values().map(|f| f.name.clone()).collect();
        names.sort();
        names
    }

    /// Dispatch to a registered function by name.
    pub fn call(&self, name: &str, args: &[Value]) -> Result<Value> {
        let function = self
            .get(name)
            .ok_or_else(|| Error::Custom(format!("no such function: {}", name)))?;
        function.invoke(args)
    }

    /// Build the `call(name, args...)` dispatcher over this registry.
    ///
    /// `call()` with no arguments returns NULL.
    pub fn dispatcher(&self) -> ScalarFunction {
        let registry = self.clone();
        ScalarFunction {
            name: CALL_FUNCTION.to_string(),
            n_args: -1,
            func: Arc::new(move |args: &[Value]| {
                let Some((first, rest)) = args.split_first() else {
                    return Ok(Value::Null);
                };
                let name = first.as_str().ok_or_else(|| {
                    Error::Custom(format!(
                        "{}() expects a function name, got {}",
                        CALL_FUNCTION,
                        first.type_name()
                    ))
                })?;
                registry.call(name, rest)
            }),
        }
    }
}

/// Codec functions every connection exposes to SQL:
/// `encode_binary(x)` and `decode_binary(x)`, both returning BLOBs and
/// passing NULL through.
pub fn codec_functions() -> Vec<ScalarFunction> {
    fn bytes_arg<'a>(name: &str, value: &'a Value) -> Result<Option<&'a [u8]>> {
        match value {
            Value::Null => Ok(None),
            v => v.as_bytes().map(Some).ok_or_else(|| {
                Error::Custom(format!(
                    "{}() expects TEXT or BLOB, got {}",
                    name,
                    v.type_name()
                ))
            }),
        }
    }

    vec![
        ScalarFunction {
            name: "encode_binary".to_string(),
            n_args: 1,
            func: Arc::new(|args: &[Value]| {
                Ok(bytes_arg("encode_binary", &args[0])?
                    .map_or(Value::Null, |b| Value::Blob(encode_binary(b))))
            }),
        },
        ScalarFunction {
            name: "decode_binary".to_string(),
            n_args: 1,
            func: Arc::new(|args: &[Value]| match bytes_arg("decode_binary", &args[0])? {
                Some(b) => Ok(Value::Blob(decode_binary(b)?)),
                None => Ok(Value::Null),
            }),
        },
    ]
}

/// Install a scalar function on a connection.
///
/// SQLite takes ownership of a boxed clone of the function and frees it
/// through [`destroy_boxed`] when the function is replaced or the
/// connection closes.
///
/// # Safety
/// `db` must be a valid connection handle.
pub(crate) unsafe fn install(db: *mut ffi::sqlite3, function: &ScalarFunction) -> c_int {
    let Ok(c_name) = CString::new(function.name.as_str()) else {
        return ffi::SQLITE_MISUSE;
    };
    let user_data = Box::into_raw(Box::new(function.clone())).cast::<c_void>();

    // SAFETY: db is valid; on failure SQLite calls xDestroy on user_data
    unsafe {
        ffi::sqlite3_create_function_v2(
            db,
            c_name.as_ptr(),
            function.n_args,
            ffi::SQLITE_UTF8,
            user_data,
            Some(call_scalar),
            None,
            None,
            Some(destroy_boxed::<ScalarFunction>),
        )
    }
}

/// Install an aggregate function on a connection.
///
/// # Safety
/// `db` must be a valid connection handle.
pub(crate) unsafe fn install_aggregate(
    db: *mut ffi::sqlite3,
    function: &AggregateFunction,
) -> c_int {
    let Ok(c_name) = CString::new(function.name.as_str()) else {
        return ffi::SQLITE_MISUSE;
    };
    let user_data = Box::into_raw(Box::new(function.clone())).cast::<c_void>();

    // SAFETY: db is valid; on failure SQLite calls xDestroy on user_data
    unsafe {
        ffi::sqlite3_create_function_v2(
            db,
            c_name.as_ptr(),
            function.n_args,
            ffi::SQLITE_UTF8,
            user_data,
            None,
            Some(aggregate_step),
            Some(aggregate_final),
            Some(destroy_boxed::<AggregateFunction>),
        )
    }
}

/// Read the `argc` arguments of the current invocation.
///
/// # Safety
/// `argv` must hold `argc` valid values for the duration of the call.
unsafe fn read_args(argc: c_int, argv: *mut *mut ffi::sqlite3_value) -> Vec<Value> {
    (0..usize::try_from(argc).unwrap_or(0))
        // SAFETY: caller guarantees argv/argc
        .map(|i| unsafe { types::read_argument(*argv.add(i)) })
        .collect()
}

/// Turn the outcome of user code into a value, reporting failures and
/// panics to SQLite as errors of the current statement.
///
/// # Safety
/// `ctx` must be the context of the invocation in progress.
unsafe fn settle<T>(
    ctx: *mut ffi::sqlite3_context,
    name: &str,
    outcome: std::thread::Result<Result<T>>,
) -> Option<T> {
    match outcome {
        Ok(Ok(value)) => Some(value),
        Ok(Err(e)) => {
            tracing::warn!(function = %name, error = %e, "SQL function failed");
            // SAFETY: caller guarantees ctx
            unsafe { types::set_error(ctx, &e.to_string()) };
            None
        }
        Err(_) => {
            tracing::warn!(function = %name, "SQL function panicked");
            // SAFETY: as above
            unsafe { types::set_error(ctx, &format!("{}() panicked", name)) };
            None
        }
    }
}

/// xFunc trampoline for every installed scalar function.
unsafe extern "C" fn call_scalar(
    ctx: *mut ffi::sqlite3_context,
    argc: c_int,
    argv: *mut *mut ffi::sqlite3_value,
) {
    // SAFETY: user_data is the Box<ScalarFunction> installed above and lives
    // until destroy_boxed runs
    let function = unsafe { &*ffi::sqlite3_user_data(ctx).cast::<ScalarFunction>() };
    // SAFETY: SQLite passes argc valid values
    let args = unsafe { read_args(argc, argv) };

    let outcome = catch_unwind(AssertUnwindSafe(|| function.invoke(&args)));

    // SAFETY: ctx is the live invocation context
    unsafe {
        if let Some(value) = settle(ctx, &function.name, outcome) {
            types::set_result(ctx, &value);
        }
    }
}

/// Slot in SQLite's aggregate context holding the group's boxed state.
type StateSlot = *mut Box<dyn Any>;

/// Get the state slot of the current group. With `create == false` the
/// result is null when no row of the group reached `aggregate_step`.
///
/// # Safety
/// `ctx` must be the context of an aggregate invocation in progress.
unsafe fn state_slot(ctx: *mut ffi::sqlite3_context, create: bool) -> *mut StateSlot {
    let n_bytes = if create {
        c_int::try_from(std::mem::size_of::<StateSlot>()).unwrap_or(c_int::MAX)
    } else {
        0
    };
    // SAFETY: caller guarantees ctx; SQLite zeroes new aggregate memory
    unsafe { ffi::sqlite3_aggregate_context(ctx, n_bytes).cast::<StateSlot>() }
}

/// xStep trampoline for every installed aggregate function.
unsafe extern "C" fn aggregate_step(
    ctx: *mut ffi::sqlite3_context,
    argc: c_int,
    argv: *mut *mut ffi::sqlite3_value,
) {
    // SAFETY: user_data is the Box<AggregateFunction> installed above
    let function = unsafe { &*ffi::sqlite3_user_data(ctx).cast::<AggregateFunction>() };
    // SAFETY: SQLite passes argc valid values
    let args = unsafe { read_args(argc, argv) };
    // SAFETY: ctx is a live aggregate context
    let slot = unsafe { state_slot(ctx, true) };
    if slot.is_null() {
        // SAFETY: as above
        unsafe { types::set_error(ctx, "out of memory for aggregate state") };
        return;
    }

    let outcome = catch_unwind(AssertUnwindSafe(|| {
        // SAFETY: slot points at this group's zero-initialized slot, filled
        // on the first row and emptied by aggregate_final
        let state: &mut dyn Any = unsafe {
            if (*slot).is_null() {
                *slot = Box::into_raw(Box::new(function.new_state()));
            }
            &mut ***slot
        };
        function.step_state(state, &args)
    }));

    // SAFETY: as above
    unsafe { settle(ctx, &function.name, outcome) };
}

/// xFinal trampoline for every installed aggregate function.
unsafe extern "C" fn aggregate_final(ctx: *mut ffi::sqlite3_context) {
    // SAFETY: user_data is the Box<AggregateFunction> installed above
    let function = unsafe { &*ffi::sqlite3_user_data(ctx).cast::<AggregateFunction>() };
    // SAFETY: ctx is a live aggregate context
    let slot = unsafe { state_slot(ctx, false) };

    // SAFETY: a non-null slot holds null or a pointer from Box::into_raw in
    // aggregate_step; it is cleared so the state is released exactly once
    let state = unsafe {
        if slot.is_null() || (*slot).is_null() {
            None
        } else {
            let raw = *slot;
            *slot = ptr::null_mut();
            Some(Box::from_raw(raw))
        }
    };

    let outcome = catch_unwind(AssertUnwindSafe(|| {
        let state = match state {
            Some(boxed) => *boxed,
            None => function.new_state(),
        };
        function.finalize_state(state)
    }));

    // SAFETY: ctx is the live invocation context
    unsafe {
        if let Some(value) = settle(ctx, &function.name, outcome) {
            types::set_result(ctx, &value);
        }
    }
}

/// xDestroy callback releasing a boxed function.
unsafe extern "C" fn destroy_boxed<T>(user_data: *mut c_void) {
    if !user_data.is_null() {
        // SAFETY: user_data was produced by Box::into_raw::<T> at install
        drop(unsafe { Box::from_raw(user_data.cast::<T>()) });
    }
}
