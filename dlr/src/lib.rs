//! Rust bridge for the DLR inference runtime.
//!
//! DLR ships as a shared library per build (CPU, GPU, versions). This crate
//! loads those libraries at runtime, resolves the DLR C API into a typed
//! function table, and exposes every model operation through opaque
//! [`ModelHandle`]s. Several runtime builds can be loaded side by side;
//! each handle remembers the runtime that created it.
//!
//! # Usage
//!
//! ```no_run
//! use dlr_bridge::{Bridge, Device, RuntimeConfig, RuntimeId};
//!
//! let bridge = Bridge::with_config(RuntimeConfig::from_env());
//! let model = bridge.create_model(RuntimeId(1), "/models/resnet18", Device::cpu()).unwrap();
//!
//! let input = vec![0.5f32; 3 * 224 * 224];
//! bridge.set_input(model, "data", &[1, 3, 224, 224], &input, 4).unwrap();
//! bridge.run_model(model).unwrap();
//! let scores = bridge.output(model, 0).unwrap();
//!
//! bridge.delete_model(model).unwrap();
//! ```
//!
//! # Dynamic Linking
//!
//! Runtime `N` is loaded from `{library_dir}/{prefix}dlr_N{suffix}` by
//! default; see [`RuntimeConfig`]. Each created model owns its own loaded
//! instance, released when the model is deleted.
//!
//! # Thread Safety
//!
//! [`Bridge`] is safe for concurrent use. Calls on the same handle are
//! serialized because DLR models are not reentrant.

mod bridge;
mod config;
mod error;
pub mod ffi;
mod library;
#[cfg(any(test, feature = "mock"))]
pub mod mock;
mod registry;
mod runtime;

pub use bridge::{Bridge, ModelInfo};
pub use config::{RuntimeConfig, DEFAULT_FILE_NAME, LIBRARY_PATH_ENV};
pub use error::DlrError;
pub use library::{LibraryLoader, SharedLibraryRuntime};
pub use registry::ModelHandle;
pub use runtime::{Device, DeviceType, ModelPtr, NativeResult, Runtime, RuntimeId, RuntimeLoader, StatusCode};
