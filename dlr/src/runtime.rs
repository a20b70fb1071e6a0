//! Runtime abstraction: one loaded instance of the DLR runtime.
//!
//! [`Runtime`] mirrors the DLR C API one method per entry point, with
//! Rust buffers in place of raw pointers. A method returns the native
//! status code as [`StatusCode`] on failure; the bridge then asks the same
//! instance for [`Runtime::last_error`].

use std::ffi::CStr;
use std::fmt;
use std::os::raw::c_void;

use serde::{Deserialize, Serialize};

use crate::error::DlrError;

/// Nonzero status returned by a native entry point.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusCode(pub i32);

/// Result of a single native call.
pub type NativeResult<T> = Result<T, StatusCode>;

/// Identifies a runtime build. The loader embeds it in the library path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RuntimeId(pub u64);

impl fmt::Display for RuntimeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// DLR device type codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "i32", into = "i32")]
pub enum DeviceType {
    Cpu,
    Gpu,
    OpenCl,
    /// A code this crate does not know; passed through unchanged.
    Other(i32),
}

impl DeviceType {
    pub fn code(self) -> i32 {
        match self {
            DeviceType::Cpu => 1,
            DeviceType::Gpu => 2,
            DeviceType::OpenCl => 4,
            DeviceType::Other(code) => code,
        }
    }
}

impl From<i32> for DeviceType {
    fn from(code: i32) -> Self {
        match code {
            1 => DeviceType::Cpu,
            2 => DeviceType::Gpu,
            4 => DeviceType::OpenCl,
            other => DeviceType::Other(other),
        }
    }
}

impl From<DeviceType> for i32 {
    fn from(t: DeviceType) -> Self {
        t.code()
    }
}

/// Device a model is created on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Device {
    pub device_type: DeviceType,
    pub device_id: i32,
}

impl Device {
    pub fn new(device_type: impl Into<DeviceType>, device_id: i32) -> Self {
        Self {
            device_type: device_type.into(),
            device_id,
        }
    }

    pub fn cpu() -> Self {
        Self::new(DeviceType::Cpu, 0)
    }

    pub fn gpu(device_id: i32) -> Self {
        Self::new(DeviceType::Gpu, device_id)
    }
}

impl Default for Device {
    fn default() -> Self {
        Self::cpu()
    }
}

/// Opaque native model pointer (`DLRModelHandle`).
///
/// Only the runtime that created a pointer may be handed it back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModelPtr(*mut c_void);

// The pointer is an opaque token; the registry serializes all calls that
// pass it back to the runtime.
unsafe impl Send for ModelPtr {}
unsafe impl Sync for ModelPtr {}

impl ModelPtr {
    /// Wraps a native model pointer.
    ///
    /// # Safety
    ///
    /// `ptr` must be the value a runtime produced for a live model, or a
    /// token that the [`Runtime`] receiving it understands (as the mock
    /// runtime does).
    pub unsafe fn from_raw(ptr: *mut c_void) -> Self {
        Self(ptr)
    }

    pub fn as_raw(self) -> *mut c_void {
        self.0
    }
}

/// One loaded instance of the DLR runtime and its function table.
///
/// Dropping the instance releases the underlying library.
pub trait Runtime: Send + Sync {
    fn create_model(&self, model_path: &CStr, device: Device) -> NativeResult<ModelPtr>;
    fn delete_model(&self, model: ModelPtr) -> NativeResult<()>;
    fn run_model(&self, model: ModelPtr) -> NativeResult<()>;

    fn num_inputs(&self, model: ModelPtr) -> NativeResult<i32>;
    fn num_weights(&self, model: ModelPtr) -> NativeResult<i32>;
    fn num_outputs(&self, model: ModelPtr) -> NativeResult<i32>;
    fn input_name(&self, model: ModelPtr, index: i32) -> NativeResult<String>;
    fn weight_name(&self, model: ModelPtr, index: i32) -> NativeResult<String>;

    /// Feeds an input. The caller guarantees `shape.len() >= dim` and that
    /// `data` holds at least the product of the first `dim` dimensions.
    fn set_input(&self, model: ModelPtr, name: &CStr, shape: &[i64], data: &[f32], dim: i32) -> NativeResult<()>;

    /// Returns `(element count, dimensionality)` of an output.
    fn output_size_dim(&self, model: ModelPtr, index: i32) -> NativeResult<(i64, i32)>;
    /// Fills `shape`, sized from [`Runtime::output_size_dim`].
    fn output_shape(&self, model: ModelPtr, index: i32, shape: &mut [i64]) -> NativeResult<()>;
    /// Fills `data`, sized from [`Runtime::output_size_dim`].
    fn output(&self, model: ModelPtr, index: i32, data: &mut [f32]) -> NativeResult<()>;

    fn backend(&self, model: ModelPtr) -> NativeResult<String>;
    fn set_num_threads(&self, model: ModelPtr, threads: i32) -> NativeResult<()>;
    fn use_cpu_affinity(&self, model: ModelPtr, enabled: bool) -> NativeResult<()>;

    /// Message describing the most recent failure in this runtime.
    fn last_error(&self) -> String;
}

/// Produces runtime instances by id.
pub trait RuntimeLoader: Send + Sync {
    fn load(&self, id: RuntimeId) -> Result<Box<dyn Runtime>, DlrError>;
}
