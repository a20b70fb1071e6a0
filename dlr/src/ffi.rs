//! Raw function-pointer types for the DLR C API.
//!
//! These match `dlr.h`. We hand-write the subset the bridge drives. Every
//! model entry point takes a pointer to the opaque `DLRModelHandle` and
//! returns 0 on success; on failure the runtime keeps a message that
//! `GetDLRLastError` returns.

use std::os::raw::{c_char, c_int, c_void};
use std::path::Path;

use libloading::Library;

use crate::error::DlrError;

/// Opaque DLR model handle.
pub type DLRModelHandle = *mut c_void;

pub type FnGetNumInputs = unsafe extern "C" fn(handle: *mut DLRModelHandle, num: *mut c_int) -> c_int;
pub type FnGetNumWeights = unsafe extern "C" fn(handle: *mut DLRModelHandle, num: *mut c_int) -> c_int;
pub type FnGetNumOutputs = unsafe extern "C" fn(handle: *mut DLRModelHandle, num: *mut c_int) -> c_int;
pub type FnGetInputName =
    unsafe extern "C" fn(handle: *mut DLRModelHandle, index: c_int, name: *mut *const c_char) -> c_int;
pub type FnGetWeightName =
    unsafe extern "C" fn(handle: *mut DLRModelHandle, index: c_int, name: *mut *const c_char) -> c_int;
pub type FnSetInput = unsafe extern "C" fn(
    handle: *mut DLRModelHandle,
    name: *const c_char,
    shape: *const i64,
    input: *const c_void,
    dim: c_int,
) -> c_int;
pub type FnGetOutputShape =
    unsafe extern "C" fn(handle: *mut DLRModelHandle, index: c_int, shape: *mut i64) -> c_int;
pub type FnGetOutput = unsafe extern "C" fn(handle: *mut DLRModelHandle, index: c_int, out: *mut c_void) -> c_int;
pub type FnGetOutputSizeDim =
    unsafe extern "C" fn(handle: *mut DLRModelHandle, index: c_int, size: *mut i64, dim: *mut c_int) -> c_int;
pub type FnCreateModel = unsafe extern "C" fn(
    handle: *mut DLRModelHandle,
    model_path: *const c_char,
    dev_type: c_int,
    dev_id: c_int,
) -> c_int;
pub type FnDeleteModel = unsafe extern "C" fn(handle: *mut DLRModelHandle) -> c_int;
pub type FnRunModel = unsafe extern "C" fn(handle: *mut DLRModelHandle) -> c_int;
pub type FnGetLastError = unsafe extern "C" fn() -> *const c_char;
pub type FnGetBackend = unsafe extern "C" fn(handle: *mut DLRModelHandle, name: *mut *const c_char) -> c_int;
pub type FnSetNumThreads = unsafe extern "C" fn(handle: *mut DLRModelHandle, threads: c_int) -> c_int;
pub type FnUseCpuAffinity = unsafe extern "C" fn(handle: *mut DLRModelHandle, enabled: c_int) -> c_int;

/// Symbol names resolved from every runtime library, in load order.
pub const SYMBOLS: [&str; 16] = [
    "GetDLRNumInputs",
    "GetDLRNumWeights",
    "GetDLRInputName",
    "GetDLRWeightName",
    "SetDLRInput",
    "GetDLROutputShape",
    "GetDLROutput",
    "GetDLROutputSizeDim",
    "GetDLRNumOutputs",
    "CreateDLRModel",
    "DeleteDLRModel",
    "RunDLRModel",
    "GetDLRLastError",
    "GetDLRBackend",
    "SetDLRNumThreads",
    "UseDLRCPUAffinity",
];

/// Function table resolved from one loaded runtime library.
///
/// The pointers are only valid while the [`Library`] they came from is
/// open, so a `DlrApi` is always stored next to its library.
#[derive(Clone, Copy)]
pub struct DlrApi {
    pub get_num_inputs: FnGetNumInputs,
    pub get_num_weights: FnGetNumWeights,
    pub get_input_name: FnGetInputName,
    pub get_weight_name: FnGetWeightName,
    pub set_input: FnSetInput,
    pub get_output_shape: FnGetOutputShape,
    pub get_output: FnGetOutput,
    pub get_output_size_dim: FnGetOutputSizeDim,
    pub get_num_outputs: FnGetNumOutputs,
    pub create_model: FnCreateModel,
    pub delete_model: FnDeleteModel,
    pub run_model: FnRunModel,
    pub get_last_error: FnGetLastError,
    pub get_backend: FnGetBackend,
    pub set_num_threads: FnSetNumThreads,
    pub use_cpu_affinity: FnUseCpuAffinity,
}

/// Resolves a symbol and copies the function pointer out of the library.
macro_rules! load_sym {
    ($lib:expr, $path:expr, $ty:ty, $name:literal) => {{
        let sym = unsafe { $lib.get::<$ty>(concat!($name, "\0").as_bytes()) }.map_err(|e| {
            DlrError::MissingSymbol {
                path: $path.to_path_buf(),
                symbol: $name,
                reason: e.to_string(),
            }
        })?;
        *sym
    }};
}

impl DlrApi {
    /// Resolves the full symbol set from `lib`.
    ///
    /// Fails on the first missing symbol; no partial table is returned.
    pub fn load(lib: &Library, path: &Path) -> Result<Self, DlrError> {
        Ok(Self {
            get_num_inputs: load_sym!(lib, path, FnGetNumInputs, "GetDLRNumInputs"),
            get_num_weights: load_sym!(lib, path, FnGetNumWeights, "GetDLRNumWeights"),
            get_input_name: load_sym!(lib, path, FnGetInputName, "GetDLRInputName"),
            get_weight_name: load_sym!(lib, path, FnGetWeightName, "GetDLRWeightName"),
            set_input: load_sym!(lib, path, FnSetInput, "SetDLRInput"),
            get_output_shape: load_sym!(lib, path, FnGetOutputShape, "GetDLROutputShape"),
            get_output: load_sym!(lib, path, FnGetOutput, "GetDLROutput"),
            get_output_size_dim: load_sym!(lib, path, FnGetOutputSizeDim, "GetDLROutputSizeDim"),
            get_num_outputs: load_sym!(lib, path, FnGetNumOutputs, "GetDLRNumOutputs"),
            create_model: load_sym!(lib, path, FnCreateModel, "CreateDLRModel"),
            delete_model: load_sym!(lib, path, FnDeleteModel, "DeleteDLRModel"),
            run_model: load_sym!(lib, path, FnRunModel, "RunDLRModel"),
            get_last_error: load_sym!(lib, path, FnGetLastError, "GetDLRLastError"),
            get_backend: load_sym!(lib, path, FnGetBackend, "GetDLRBackend"),
            set_num_threads: load_sym!(lib, path, FnSetNumThreads, "SetDLRNumThreads"),
            use_cpu_affinity: load_sym!(lib, path, FnUseCpuAffinity, "UseDLRCPUAffinity"),
        })
    }
}
