//! Code units compiled as dynamic libraries.
//!
//! A unit library exports two C-ABI symbols, usually generated with
//! [`export_unit!`](crate::export_unit):
//!
//! ```text
//! offload_unit_call(args_ptr, args_len, out_ptr, out_len) -> i32
//! offload_unit_free(ptr, len)
//! ```
//!
//! Arguments go in as a JSON array. The output buffer is allocated by the
//! unit and released through `offload_unit_free`, so both sides may use
//! different allocators. A library loaded as a preload module may also
//! export `offload_preload(out_ptr, out_len) -> i32`, run once when it is
//! loaded. On failure its output holds a rejection envelope, released
//! through `offload_unit_free` like any other output.

use std::any::Any;
use std::path::Path;
use std::sync::Arc;

use futures::FutureExt;
use libloading::Library;

use crate::envelope::{self, ErrorValue, Rejection};
use crate::error::LoadError;
use crate::value::Value;

use super::unit::{CodeUnit, CodeUnitLoader, UnitFuture};

/// Symbol invoked to run the unit.
pub const CALL_SYMBOL: &str = "offload_unit_call";
/// Symbol releasing an output buffer.
pub const FREE_SYMBOL: &str = "offload_unit_free";
/// Optional symbol run when the library is preloaded.
pub const PRELOAD_SYMBOL: &str = "offload_preload";

/// `offload_unit_call`: JSON args in, status code out, output via out-params.
pub type UnitCallFn = unsafe extern "C" fn(*const u8, usize, *mut *mut u8, *mut usize) -> i32;
/// `offload_unit_free`.
pub type UnitFreeFn = unsafe extern "C" fn(*mut u8, usize);
/// `offload_preload`: zero on success, otherwise output holds the error.
pub type PreloadFn = unsafe extern "C" fn(*mut *mut u8, *mut usize) -> i32;

/// Result code from `offload_unit_call`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum ExecutionResult {
    /// Output holds the JSON result.
    Success = 0,
    /// The unit could not decode its arguments.
    DeserializationError = -1,
    /// Output holds a rejection envelope.
    UnitError = -2,
    /// The unit could not encode its result.
    SerializationError = -3,
    /// The unit panicked; output holds the panic message.
    Panic = -4,
}

impl From<i32> for ExecutionResult {
    fn from(code: i32) -> Self {
        match code {
            0 => Self::Success,
            -1 => Self::DeserializationError,
            -3 => Self::SerializationError,
            -4 => Self::Panic,
            _ => Self::UnitError,
        }
    }
}

/// Loads units and preload modules from shared libraries.
#[derive(Debug, Default)]
pub struct DylibLoader {
    // Preloaded libraries stay mapped for the life of the worker.
    preloaded: Vec<Arc<Library>>,
}

impl DylibLoader {
    pub fn new() -> Self {
        Self::default()
    }
}

fn open(path: &str) -> Result<Arc<Library>, LoadError> {
    // SAFETY: loading a library runs its initializers; the worker exists to
    // run code the host asked for.
    match unsafe { Library::new(path) } {
        Ok(library) => Ok(Arc::new(library)),
        Err(_) if !Path::new(path).exists() => Err(LoadError::NotFound(path.to_string())),
        Err(e) => Err(LoadError::Init {
            path: path.to_string(),
            error: ErrorValue::from_error(&e),
        }),
    }
}

fn missing_symbol(path: &str, symbol: &str, error: libloading::Error) -> LoadError {
    LoadError::Init {
        path: path.to_string(),
        error: ErrorValue::new(format!("Failed to get symbol {}: {}", symbol, error)),
    }
}

impl CodeUnitLoader for DylibLoader {
    fn preload(&mut self, id: &str) -> Result<(), LoadError> {
        let library = open(id)?;

        // SAFETY: the symbol, when present, has the `PreloadFn` signature.
        let hook = unsafe { library.get::<PreloadFn>(PRELOAD_SYMBOL.as_bytes()) }
            .ok()
            .map(|symbol| *symbol);
        if let Some(hook) = hook {
            // SAFETY: a library exporting the hook exports the free symbol too.
            let free = unsafe { library.get::<UnitFreeFn>(FREE_SYMBOL.as_bytes()) }
                .map(|symbol| *symbol)
                .map_err(|e| missing_symbol(id, FREE_SYMBOL, e))?;

            let mut out_ptr: *mut u8 = std::ptr::null_mut();
            let mut out_len: usize = 0;
            // SAFETY: see above.
            let code = unsafe { hook(&mut out_ptr, &mut out_len) };
            let output = OutputGuard {
                ptr: out_ptr,
                len: out_len,
                free,
            };
            if code != 0 {
                let error = preload_error(id, code, output.bytes());
                tracing::error!("Preload hook of '{}' failed: {}", id, error);
                return Err(LoadError::Init {
                    path: id.to_string(),
                    error,
                });
            }
        }

        tracing::debug!("Preloaded {}", id);
        self.preloaded.push(library);
        Ok(())
    }

    fn load(&mut self, path: &str) -> Result<Arc<dyn CodeUnit>, LoadError> {
        let library = open(path)?;

        // SAFETY: unit libraries export these symbols with these signatures.
        let call = unsafe { library.get::<UnitCallFn>(CALL_SYMBOL.as_bytes()) }
            .map(|symbol| *symbol)
            .map_err(|e| missing_symbol(path, CALL_SYMBOL, e))?;
        // SAFETY: as above.
        let free = unsafe { library.get::<UnitFreeFn>(FREE_SYMBOL.as_bytes()) }
            .map(|symbol| *symbol)
            .map_err(|e| missing_symbol(path, FREE_SYMBOL, e))?;

        Ok(Arc::new(DylibUnit {
            call,
            free,
            _library: Some(library),
        }))
    }
}

/// The error a failed preload hook reported, or a generic one naming its code.
fn preload_error(id: &str, code: i32, output: &[u8]) -> ErrorValue {
    let reported = serde_json::from_slice::<serde_json::Value>(output)
        .ok()
        .and_then(|json| envelope::unwrap(&Value::from(json)).ok());
    match reported {
        Some(Rejection::Error(error)) => error,
        _ => ErrorValue::new(format!(
            "preload hook of '{}' failed with code {}",
            id, code
        )),
    }
}

/// A unit behind a pair of C-ABI entry points.
pub struct DylibUnit {
    call: UnitCallFn,
    free: UnitFreeFn,
    // Keeps `call` and `free` mapped.
    _library: Option<Arc<Library>>,
}

impl DylibUnit {
    /// Wrap entry points that are already linked into this process.
    ///
    /// # Safety
    /// `call` and `free` must follow the `offload_unit_call` /
    /// `offload_unit_free` contract and stay valid for the unit's lifetime.
    pub unsafe fn from_raw_parts(call: UnitCallFn, free: UnitFreeFn) -> Self {
        Self {
            call,
            free,
            _library: None,
        }
    }

    fn invoke(&self, args: Vec<Value>) -> Result<Value, Rejection> {
        let input = Value::Array(args).to_json().map_err(|e| {
            Rejection::Error(ErrorValue::new(format!(
                "arguments cannot be passed to a library unit: {}",
                e
            )))
        })?;
        let input = serde_json::to_vec(&input)?;

        let mut out_ptr: *mut u8 = std::ptr::null_mut();
        let mut out_len: usize = 0;
        // SAFETY: `call` honours the entry point contract; the input buffer
        // outlives the call.
        let code = unsafe { (self.call)(input.as_ptr(), input.len(), &mut out_ptr, &mut out_len) };
        let output = OutputGuard {
            ptr: out_ptr,
            len: out_len,
            free: self.free,
        };

        let payload: serde_json::Value = if output.bytes().is_empty() {
            serde_json::Value::Null
        } else {
            serde_json::from_slice(output.bytes())?
        };

        match ExecutionResult::from(code) {
            ExecutionResult::Success => Ok(Value::from(payload)),
            ExecutionResult::UnitError => match envelope::unwrap(&Value::from(payload)) {
                Ok(rejection) => Err(rejection),
                Err(e) => Err(Rejection::Error(ErrorValue::new(e.to_string()))),
            },
            ExecutionResult::DeserializationError => {
                Err(failure("unit could not decode its arguments", payload))
            }
            ExecutionResult::SerializationError => {
                Err(failure("unit could not encode its result", payload))
            }
            ExecutionResult::Panic => Err(failure("unit panicked", payload)),
        }
    }
}

fn failure(what: &str, detail: serde_json::Value) -> Rejection {
    let message = match detail.as_str() {
        Some(detail) => format!("{}: {}", what, detail),
        None => what.to_string(),
    };
    Rejection::Error(ErrorValue::new(message))
}

impl CodeUnit for DylibUnit {
    fn call(&self, args: Vec<Value>) -> UnitFuture {
        let outcome = self.invoke(args);
        futures::future::ready(outcome).boxed()
    }
}

/// Releases a unit-allocated output buffer on drop.
struct OutputGuard {
    ptr: *mut u8,
    len: usize,
    free: UnitFreeFn,
}

impl OutputGuard {
    fn bytes(&self) -> &[u8] {
        if self.ptr.is_null() {
            return &[];
        }
        // SAFETY: the unit wrote a buffer of `len` bytes at `ptr`.
        unsafe { std::slice::from_raw_parts(self.ptr, self.len) }
    }
}

impl Drop for OutputGuard {
    fn drop(&mut self) {
        if !self.ptr.is_null() {
            // SAFETY: the buffer came from the matching unit and is freed once.
            unsafe { (self.free)(self.ptr, self.len) }
        }
    }
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// Unit-side body of `offload_unit_call`. Use [`export_unit!`](crate::export_unit).
///
/// # Safety
/// The pointers must satisfy the `offload_unit_call` contract.
#[doc(hidden)]
pub unsafe fn __dispatch(
    unit: fn(Vec<Value>) -> Result<Value, Rejection>,
    input: *const u8,
    input_len: usize,
    out_ptr: *mut *mut u8,
    out_len: *mut usize,
) -> i32 {
    let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
        let bytes: &[u8] = if input.is_null() {
            &[]
        } else {
            // SAFETY: caller passes a valid buffer of `input_len` bytes.
            unsafe { std::slice::from_raw_parts(input, input_len) }
        };
        let args = match serde_json::from_slice::<serde_json::Value>(bytes) {
            Ok(serde_json::Value::Array(items)) => items.into_iter().map(Value::from).collect(),
            Ok(other) => {
                return (
                    ExecutionResult::DeserializationError,
                    serde_json::Value::from(format!("expected an argument array, got {}", other)),
                );
            }
            Err(e) => {
                return (
                    ExecutionResult::DeserializationError,
                    serde_json::Value::from(e.to_string()),
                );
            }
        };

        let (code, value) = match unit(args) {
            Ok(value) => (ExecutionResult::Success, value),
            Err(rejection) => (ExecutionResult::UnitError, envelope::wrap(&rejection)),
        };
        match value.to_json() {
            Ok(json) => (code, json),
            Err(e) => (
                ExecutionResult::SerializationError,
                serde_json::Value::from(e.to_string()),
            ),
        }
    }));

    let (code, payload) = outcome.unwrap_or_else(|panic| {
        (
            ExecutionResult::Panic,
            serde_json::Value::from(panic_message(panic.as_ref())),
        )
    });

    // SAFETY: forwarded from the caller.
    unsafe { write_output(&payload, out_ptr, out_len) };
    code as i32
}

/// Leak `payload` as JSON into a buffer released by `__free`.
///
/// # Safety
/// `out_ptr` and `out_len` must be valid for writes.
unsafe fn write_output(payload: &serde_json::Value, out_ptr: *mut *mut u8, out_len: *mut usize) {
    let bytes = serde_json::to_vec(payload).unwrap_or_default().into_boxed_slice();
    let len = bytes.len();
    let ptr = Box::into_raw(bytes) as *mut u8;
    // SAFETY: caller passes valid out-params.
    unsafe {
        *out_ptr = ptr;
        *out_len = len;
    }
}

/// Unit-side body of `offload_unit_free`.
///
/// # Safety
/// `ptr` and `len` must come from one `__dispatch` call, freed once.
#[doc(hidden)]
pub unsafe fn __free(ptr: *mut u8, len: usize) {
    if !ptr.is_null() {
        // SAFETY: reconstructs the boxed slice leaked by `__dispatch`.
        drop(unsafe { Box::from_raw(std::ptr::slice_from_raw_parts_mut(ptr, len)) });
    }
}

/// Unit-side body of `offload_preload`.
///
/// # Safety
/// `out_ptr` and `out_len` must be valid for writes.
#[doc(hidden)]
pub unsafe fn __preload(
    hook: fn() -> Result<(), ErrorValue>,
    out_ptr: *mut *mut u8,
    out_len: *mut usize,
) -> i32 {
    let (code, error) = match std::panic::catch_unwind(hook) {
        Ok(Ok(())) => return 0,
        Ok(Err(error)) => (1, error),
        Err(panic) => (
            2,
            ErrorValue::new(format!(
                "preload hook panicked: {}",
                panic_message(panic.as_ref())
            )),
        ),
    };
    // Reported to the loader, which logs it.
    let payload = envelope::wrap(&Rejection::Error(error))
        .to_json()
        .unwrap_or_default();
    // SAFETY: forwarded from the caller.
    unsafe { write_output(&payload, out_ptr, out_len) };
    code
}

/// Export a function as a dynamic-library code unit.
///
/// The function has the signature
/// `fn(Vec<Value>) -> Result<Value, Rejection>`. An optional preload hook
/// `fn() -> Result<(), ErrorValue>` runs when the library is loaded as a
/// preload module.
///
/// ```ignore
/// fn greet(args: Vec<Value>) -> Result<Value, Rejection> {
///     let name = args.first().and_then(Value::as_str).unwrap_or("world");
///     Ok(Value::from(format!("Hello, {}!", name)))
/// }
///
/// offload_core::export_unit!(greet);
/// ```
#[macro_export]
macro_rules! export_unit {
    ($unit:path) => {
        #[unsafe(no_mangle)]
        pub unsafe extern "C" fn offload_unit_call(
            input: *const u8,
            input_len: usize,
            out_ptr: *mut *mut u8,
            out_len: *mut usize,
        ) -> i32 {
            unsafe { $crate::worker::dylib::__dispatch($unit, input, input_len, out_ptr, out_len) }
        }

        #[unsafe(no_mangle)]
        pub unsafe extern "C" fn offload_unit_free(ptr: *mut u8, len: usize) {
            unsafe { $crate::worker::dylib::__free(ptr, len) }
        }
    };
    ($unit:path, preload = $hook:path) => {
        $crate::export_unit!($unit);

        #[unsafe(no_mangle)]
        pub unsafe extern "C" fn offload_preload(
            out_ptr: *mut *mut u8,
            out_len: *mut usize,
        ) -> i32 {
            unsafe { $crate::worker::dylib::__preload($hook, out_ptr, out_len) }
        }
    };
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::Callback;
    use std::io::Write;

    fn fixture(args: Vec<Value>) -> Result<Value, Rejection> {
        match args.first().and_then(Value::as_str) {
            Some("echo") => Ok(Value::from(args)),
            Some("reject-data") => Err(Rejection::data(Value::object([("code", Value::from(7))]))),
            Some("reject-error") => Err(Rejection::Error(
                ErrorValue::new("Failure!").with_field("code", 404),
            )),
            Some("panic") => panic!("boom"),
            _ => Ok(Value::Null),
        }
    }

    crate::export_unit!(fixture);

    fn unit() -> DylibUnit {
        unsafe { DylibUnit::from_raw_parts(offload_unit_call, offload_unit_free) }
    }

    #[test]
    fn test_execution_result_from_i32() {
        assert_eq!(ExecutionResult::from(0), ExecutionResult::Success);
        assert_eq!(ExecutionResult::from(-1), ExecutionResult::DeserializationError);
        assert_eq!(ExecutionResult::from(-2), ExecutionResult::UnitError);
        assert_eq!(ExecutionResult::from(-3), ExecutionResult::SerializationError);
        assert_eq!(ExecutionResult::from(-4), ExecutionResult::Panic);
        assert_eq!(ExecutionResult::from(-99), ExecutionResult::UnitError);
    }

    #[test]
    fn test_success_crosses_the_boundary() {
        let args = vec![
            Value::from("echo"),
            Value::object([("nested", Value::from(vec![Value::from(1.5)]))]),
        ];
        assert_eq!(unit().invoke(args.clone()).unwrap(), Value::from(args));
    }

    #[test]
    fn test_rejections_cross_the_boundary() {
        assert_eq!(
            unit().invoke(vec![Value::from("reject-data")]).unwrap_err(),
            Rejection::data(Value::object([("code", Value::from(7))]))
        );

        match unit().invoke(vec![Value::from("reject-error")]).unwrap_err() {
            Rejection::Error(error) => {
                assert_eq!(error.message(), "Failure!");
                assert_eq!(error.field("code").and_then(Value::as_i64), Some(404));
            }
            other => panic!("expected error rejection, got {:?}", other),
        }
    }

    #[test]
    fn test_panics_are_contained() {
        match unit().invoke(vec![Value::from("panic")]).unwrap_err() {
            Rejection::Error(error) => assert_eq!(error.message(), "unit panicked: boom"),
            other => panic!("expected error rejection, got {:?}", other),
        }
    }

    #[test]
    fn test_callbacks_cannot_cross_a_library_boundary() {
        let callback = Callback::new(|_| async { Ok(Value::Null) });
        match unit().invoke(vec![Value::Callback(callback)]).unwrap_err() {
            Rejection::Error(error) => {
                assert!(error.message().starts_with("arguments cannot be passed"));
            }
            other => panic!("expected error rejection, got {:?}", other),
        }
    }

    #[test]
    fn test_loader_distinguishes_missing_from_broken() {
        let mut loader = DylibLoader::new();
        match loader.load("/nonexistent/libunit.so") {
            Err(LoadError::NotFound(path)) => assert_eq!(path, "/nonexistent/libunit.so"),
            other => panic!("expected not found, got {:?}", other.err()),
        }

        let mut not_a_library = tempfile::NamedTempFile::new().unwrap();
        writeln!(not_a_library, "plain text").unwrap();
        let path = not_a_library.path().to_string_lossy().to_string();
        assert!(matches!(loader.load(&path), Err(LoadError::Init { .. })));
        assert!(matches!(loader.preload(&path), Err(LoadError::Init { .. })));
    }

    fn refusing_hook() -> Result<(), ErrorValue> {
        Err(ErrorValue::new("hook refused").with_field("code", 3))
    }

    fn panicking_hook() -> Result<(), ErrorValue> {
        panic!("hook boom")
    }

    fn run_hook(hook: fn() -> Result<(), ErrorValue>) -> (i32, ErrorValue) {
        let mut out_ptr: *mut u8 = std::ptr::null_mut();
        let mut out_len: usize = 0;
        let code = unsafe { __preload(hook, &mut out_ptr, &mut out_len) };
        let output = OutputGuard {
            ptr: out_ptr,
            len: out_len,
            free: offload_unit_free,
        };
        (code, preload_error("libhooks.so", code, output.bytes()))
    }

    #[test]
    fn test_preload_failures_reach_the_loader() {
        let (code, error) = run_hook(refusing_hook);
        assert_eq!(code, 1);
        assert_eq!(error.message(), "hook refused");
        assert_eq!(error.field("code").and_then(Value::as_i64), Some(3));

        let (code, error) = run_hook(panicking_hook);
        assert_eq!(code, 2);
        assert_eq!(error.message(), "preload hook panicked: hook boom");

        let error = preload_error("libhooks.so", 5, b"");
        assert_eq!(error.message(), "preload hook of 'libhooks.so' failed with code 5");
    }

    #[test]
    fn test_successful_preload_writes_nothing() {
        let mut out_ptr: *mut u8 = std::ptr::null_mut();
        let mut out_len: usize = 0;
        let code = unsafe { __preload(|| Ok(()), &mut out_ptr, &mut out_len) };
        assert_eq!(code, 0);
        assert!(out_ptr.is_null());
    }
}
