//! The bridge: one shim per DLR operation over the handle registry.

use std::ffi::CString;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::config::RuntimeConfig;
use crate::error::DlrError;
use crate::library::LibraryLoader;
use crate::registry::{HandleRegistry, LiveModel, ModelHandle, ModelSlot};
use crate::runtime::{Device, NativeResult, RuntimeId, RuntimeLoader, StatusCode};

/// Summary of a model's metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelInfo {
    pub runtime_id: RuntimeId,
    pub backend: String,
    pub inputs: Vec<String>,
    pub weights: Vec<String>,
    pub num_outputs: i32,
}

impl LiveModel {
    /// Turns a native status into [`DlrError::Native`], reading the
    /// runtime's last error.
    fn check<T>(&self, op: &'static str, result: NativeResult<T>) -> Result<T, DlrError> {
        result.map_err(|StatusCode(code)| DlrError::Native {
            op,
            code,
            message: self.runtime.last_error(),
        })
    }

    fn names(&self, count: i32, op: &'static str, name_at: impl Fn(i32) -> NativeResult<String>) -> Result<Vec<String>, DlrError> {
        (0..count).map(|i| self.check(op, name_at(i))).collect()
    }
}

fn to_c_string(what: &str, value: &str) -> Result<CString, DlrError> {
    CString::new(value).map_err(|_| DlrError::InvalidArgument(format!("{what} {value:?} contains a NUL byte")))
}

#[cfg(unix)]
fn path_to_c_string(path: &Path) -> Result<CString, DlrError> {
    use std::os::unix::ffi::OsStrExt;

    CString::new(path.as_os_str().as_bytes())
        .map_err(|_| DlrError::InvalidArgument(format!("model path {path:?} contains a NUL byte")))
}

#[cfg(not(unix))]
fn path_to_c_string(path: &Path) -> Result<CString, DlrError> {
    to_c_string("model path", &path.to_string_lossy())
}

/// Checks that the native side can read `dim` shape entries and the
/// corresponding number of floats without leaving the caller's buffers.
fn check_input_bounds(shape: &[i64], data: &[f32], dim: i32) -> Result<(), DlrError> {
    let dim = usize::try_from(dim)
        .ok()
        .filter(|&d| d <= shape.len())
        .ok_or_else(|| {
            DlrError::InvalidArgument(format!("dim {dim} out of range for shape of {} entries", shape.len()))
        })?;

    let mut size: usize = 1;
    for &d in &shape[..dim] {
        let d = usize::try_from(d)
            .map_err(|_| DlrError::InvalidArgument(format!("negative dimension {d} in shape {shape:?}")))?;
        size = size
            .checked_mul(d)
            .ok_or_else(|| DlrError::InvalidArgument(format!("shape {shape:?} overflows")))?;
    }

    if data.len() < size {
        return Err(DlrError::InvalidArgument(format!(
            "input data too short: got {}, need {size} for shape {:?}",
            data.len(),
            &shape[..dim]
        )));
    }
    Ok(())
}

fn output_len(index: i32, what: &str, value: i64) -> Result<usize, DlrError> {
    usize::try_from(value).map_err(|_| DlrError::InvalidOutput {
        index,
        reason: format!("runtime reported {what} {value}"),
    })
}

/// Locks `slot` and runs `f` on its model. A slot emptied by a delete that
/// got the lock first reads as an invalid handle.
fn with_slot<T>(
    handle: ModelHandle,
    slot: &ModelSlot,
    f: impl FnOnce(&LiveModel) -> Result<T, DlrError>,
) -> Result<T, DlrError> {
    let state = slot.state.lock();
    let live = state.as_ref().ok_or(DlrError::InvalidHandle(handle))?;
    f(live)
}

/// Drives DLR runtimes through opaque model handles.
///
/// Each [`Bridge::create_model`] loads its own runtime instance through the
/// injected [`RuntimeLoader`]; the instance is released when the model is
/// deleted. Dropping the bridge deletes every model still alive.
///
/// # Thread Safety
///
/// A Bridge is safe for concurrent use. Calls on different handles run in
/// parallel; calls on the same handle are serialized, since DLR models are
/// not reentrant.
pub struct Bridge {
    loader: Box<dyn RuntimeLoader>,
    registry: HandleRegistry,
}

impl Bridge {
    /// Creates a bridge that loads runtimes with `loader`.
    pub fn new(loader: impl RuntimeLoader + 'static) -> Self {
        Self {
            loader: Box::new(loader),
            registry: HandleRegistry::new(),
        }
    }

    /// Creates a bridge that loads shared libraries laid out per `config`.
    pub fn with_config(config: RuntimeConfig) -> Self {
        Self::new(LibraryLoader::new(config))
    }

    /// Runs `f` on the live model behind `handle` with the model lock held.
    fn with_model<T>(&self, handle: ModelHandle, f: impl FnOnce(&LiveModel) -> Result<T, DlrError>) -> Result<T, DlrError> {
        let slot = self.registry.lookup(handle)?;
        with_slot(handle, &slot, f)
    }

    // -----------------------------------------------------------------------
    // Lifecycle
    // -----------------------------------------------------------------------

    /// Loads runtime `runtime_id` and creates a model from `model_path`.
    pub fn create_model(
        &self,
        runtime_id: RuntimeId,
        model_path: impl AsRef<Path>,
        device: Device,
    ) -> Result<ModelHandle, DlrError> {
        let model_path = model_path.as_ref();
        let c_path = path_to_c_string(model_path)?;

        let runtime = self.loader.load(runtime_id)?;
        let native = match runtime.create_model(&c_path, device) {
            Ok(native) => native,
            Err(StatusCode(code)) => {
                // Read the message before the runtime (and its library) goes away.
                return Err(DlrError::Native {
                    op: "CreateDLRModel",
                    code,
                    message: runtime.last_error(),
                });
            }
        };

        let handle = self.registry.register(runtime_id, LiveModel { native, runtime });
        debug!(%handle, runtime_id = %runtime_id, path = %model_path.display(), ?device, "dlr: model created");
        Ok(handle)
    }

    /// Deletes a model and releases its runtime library.
    ///
    /// The handle is invalid once this is called, and the library is
    /// released even when the native deletion fails.
    pub fn delete_model(&self, handle: ModelHandle) -> Result<(), DlrError> {
        let slot = self.registry.unregister(handle)?;
        let live = slot.state.lock().take().ok_or(DlrError::InvalidHandle(handle))?;
        let result = live.check("DeleteDLRModel", live.runtime.delete_model(live.native));
        drop(live);
        debug!(%handle, runtime_id = %slot.runtime_id, ok = result.is_ok(), "dlr: model deleted");
        result
    }

    /// Runs inference on inputs previously set with [`Bridge::set_input`].
    pub fn run_model(&self, handle: ModelHandle) -> Result<(), DlrError> {
        self.with_model(handle, |m| m.check("RunDLRModel", m.runtime.run_model(m.native)))
    }

    // -----------------------------------------------------------------------
    // Metadata
    // -----------------------------------------------------------------------

    pub fn num_inputs(&self, handle: ModelHandle) -> Result<i32, DlrError> {
        self.with_model(handle, |m| m.check("GetDLRNumInputs", m.runtime.num_inputs(m.native)))
    }

    pub fn num_weights(&self, handle: ModelHandle) -> Result<i32, DlrError> {
        self.with_model(handle, |m| m.check("GetDLRNumWeights", m.runtime.num_weights(m.native)))
    }

    pub fn num_outputs(&self, handle: ModelHandle) -> Result<i32, DlrError> {
        self.with_model(handle, |m| m.check("GetDLRNumOutputs", m.runtime.num_outputs(m.native)))
    }

    /// Returns the name of input `index`, in `[0, num_inputs)`.
    pub fn input_name(&self, handle: ModelHandle, index: i32) -> Result<String, DlrError> {
        self.with_model(handle, |m| m.check("GetDLRInputName", m.runtime.input_name(m.native, index)))
    }

    /// Returns the name of weight `index`, in `[0, num_weights)`.
    pub fn weight_name(&self, handle: ModelHandle, index: i32) -> Result<String, DlrError> {
        self.with_model(handle, |m| m.check("GetDLRWeightName", m.runtime.weight_name(m.native, index)))
    }

    pub fn backend(&self, handle: ModelHandle) -> Result<String, DlrError> {
        self.with_model(handle, |m| m.check("GetDLRBackend", m.runtime.backend(m.native)))
    }

    /// Collects inputs, weights, output count and backend in one locked pass.
    pub fn model_info(&self, handle: ModelHandle) -> Result<ModelInfo, DlrError> {
        let runtime_id = self.registry.lookup(handle)?.runtime_id;
        self.with_model(handle, |m| {
            let rt = m.runtime.as_ref();
            let num_inputs = m.check("GetDLRNumInputs", rt.num_inputs(m.native))?;
            let num_weights = m.check("GetDLRNumWeights", rt.num_weights(m.native))?;
            Ok(ModelInfo {
                runtime_id,
                backend: m.check("GetDLRBackend", rt.backend(m.native))?,
                inputs: m.names(num_inputs, "GetDLRInputName", |i| rt.input_name(m.native, i))?,
                weights: m.names(num_weights, "GetDLRWeightName", |i| rt.weight_name(m.native, i))?,
                num_outputs: m.check("GetDLRNumOutputs", rt.num_outputs(m.native))?,
            })
        })
    }

    // -----------------------------------------------------------------------
    // Tensors
    // -----------------------------------------------------------------------

    /// Feeds input `name` with a flat float buffer laid out per `shape`.
    ///
    /// `dim` is the number of leading `shape` entries the runtime reads.
    /// Only buffer bounds are checked here; shape and type mismatches are
    /// reported by the runtime, if at all.
    pub fn set_input(&self, handle: ModelHandle, name: &str, shape: &[i64], data: &[f32], dim: i32) -> Result<(), DlrError> {
        let c_name = to_c_string("input name", name)?;
        check_input_bounds(shape, data, dim)?;
        self.with_model(handle, |m| {
            m.check("SetDLRInput", m.runtime.set_input(m.native, &c_name, shape, data, dim))
        })
    }

    /// Returns the shape of output `index`.
    ///
    /// Two native calls are made under the model lock: the size/dim query,
    /// then the shape copy. The runtime must report the same dim to both.
    pub fn output_shape(&self, handle: ModelHandle, index: i32) -> Result<Vec<i64>, DlrError> {
        self.with_model(handle, |m| {
            let (_, dim) = m.check("GetDLROutputSizeDim", m.runtime.output_size_dim(m.native, index))?;
            let mut shape = vec![0i64; output_len(index, "dim", i64::from(dim))?];
            m.check("GetDLROutputShape", m.runtime.output_shape(m.native, index, &mut shape))?;
            Ok(shape)
        })
    }

    /// Returns the data of output `index` as a flat float vector.
    ///
    /// Like [`Bridge::output_shape`], this sizes the buffer from the
    /// size/dim query and then copies, under the model lock.
    pub fn output(&self, handle: ModelHandle, index: i32) -> Result<Vec<f32>, DlrError> {
        self.with_model(handle, |m| {
            let (size, _) = m.check("GetDLROutputSizeDim", m.runtime.output_size_dim(m.native, index))?;
            let mut data = vec![0f32; output_len(index, "size", size)?];
            m.check("GetDLROutput", m.runtime.output(m.native, index, &mut data))?;
            Ok(data)
        })
    }

    // -----------------------------------------------------------------------
    // Tuning
    // -----------------------------------------------------------------------

    pub fn set_num_threads(&self, handle: ModelHandle, threads: i32) -> Result<(), DlrError> {
        self.with_model(handle, |m| {
            m.check("SetDLRNumThreads", m.runtime.set_num_threads(m.native, threads))
        })
    }

    pub fn use_cpu_affinity(&self, handle: ModelHandle, enabled: bool) -> Result<(), DlrError> {
        self.with_model(handle, |m| {
            m.check("UseDLRCPUAffinity", m.runtime.use_cpu_affinity(m.native, enabled))
        })
    }

    // -----------------------------------------------------------------------
    // Registry
    // -----------------------------------------------------------------------

    /// Handles of all live models, in creation order.
    pub fn live_models(&self) -> Vec<ModelHandle> {
        self.registry.handles()
    }

    /// Deletes every live model. Returns the deletions that failed; their
    /// libraries are released regardless.
    pub fn close_all(&self) -> Vec<(ModelHandle, DlrError)> {
        self.registry
            .handles()
            .into_iter()
            .filter_map(|h| self.delete_model(h).err().map(|e| (h, e)))
            .collect()
    }
}

impl Drop for Bridge {
    fn drop(&mut self) {
        for (handle, err) in self.close_all() {
            warn!(%handle, error = %err, "dlr: delete on teardown failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockLoader;

    fn bridge() -> (Bridge, MockLoader) {
        let loader = MockLoader::new();
        (Bridge::new(loader.clone()), loader)
    }

    #[test]
    fn create_and_delete() {
        let (bridge, loader) = bridge();
        let h = bridge.create_model(RuntimeId(1), "/models/resnet", Device::gpu(1)).unwrap();
        assert_eq!(bridge.live_models(), vec![h]);
        assert_eq!(loader.created_models(), vec![("/models/resnet".to_string(), Device::gpu(1))]);

        bridge.delete_model(h).unwrap();
        assert!(bridge.live_models().is_empty());
        assert_eq!(loader.opens(), 1);
        assert_eq!(loader.closes(), 1);
    }

    #[test]
    fn create_failure_closes_runtime() {
        let (bridge, loader) = bridge();
        loader.fail_on("CreateDLRModel");
        let err = bridge.create_model(RuntimeId(1), "m", Device::cpu()).unwrap_err();
        assert_eq!(err.native_message(), Some(MockLoader::error_message("CreateDLRModel").as_str()));
        assert!(bridge.live_models().is_empty());
        assert_eq!(loader.opens(), loader.closes());
    }

    #[test]
    fn create_rejects_nul_in_path() {
        let (bridge, loader) = bridge();
        let err = bridge.create_model(RuntimeId(1), "bad\0path", Device::cpu()).unwrap_err();
        assert!(matches!(err, DlrError::InvalidArgument(_)));
        assert_eq!(loader.opens(), 0);
    }

    #[test]
    fn load_failure_propagates() {
        let (bridge, loader) = bridge();
        loader.fail_loads("missing");
        let err = bridge.create_model(RuntimeId(3), "m", Device::cpu()).unwrap_err();
        assert!(matches!(err, DlrError::Load { .. }));
    }

    #[test]
    fn model_info() {
        let (bridge, _) = bridge();
        let h = bridge.create_model(RuntimeId(7), "m", Device::cpu()).unwrap();
        let info = bridge.model_info(h).unwrap();
        assert_eq!(
            info,
            ModelInfo {
                runtime_id: RuntimeId(7),
                backend: "tvm".into(),
                inputs: vec!["data".into()],
                weights: vec!["fc1_weight".into(), "fc1_bias".into()],
                num_outputs: 1,
            }
        );
    }

    #[test]
    fn tuning_reaches_runtime() {
        let (bridge, loader) = bridge();
        let h = bridge.create_model(RuntimeId(1), "m", Device::cpu()).unwrap();
        bridge.set_num_threads(h, 4).unwrap();
        bridge.use_cpu_affinity(h, true).unwrap();
        assert_eq!(loader.num_threads(), 4);
        assert!(loader.cpu_affinity());
    }

    #[test]
    fn input_bounds() {
        assert!(check_input_bounds(&[2, 3], &[0.0; 6], 2).is_ok());
        // Trailing shape entries beyond dim are ignored.
        assert!(check_input_bounds(&[2, 3, 100], &[0.0; 6], 2).is_ok());
        assert!(check_input_bounds(&[], &[0.0], 0).is_ok());
        assert!(check_input_bounds(&[2, 3], &[0.0; 5], 2).is_err());
        assert!(check_input_bounds(&[2, 3], &[0.0; 6], 3).is_err());
        assert!(check_input_bounds(&[2, 3], &[0.0; 6], -1).is_err());
        assert!(check_input_bounds(&[-2, 3], &[0.0; 6], 2).is_err());
        assert!(check_input_bounds(&[i64::MAX, i64::MAX], &[0.0; 6], 2).is_err());
    }

    #[test]
    fn set_input_bounds_checked_before_native_call() {
        let (bridge, _) = bridge();
        let h = bridge.create_model(RuntimeId(1), "m", Device::cpu()).unwrap();
        let err = bridge.set_input(h, "data", &[4], &[1.0, 2.0], 1).unwrap_err();
        assert!(matches!(err, DlrError::InvalidArgument(_)));
        let err = bridge.set_input(h, "da\0ta", &[1], &[1.0], 1).unwrap_err();
        assert!(matches!(err, DlrError::InvalidArgument(_)));
    }

    #[test]
    fn drop_releases_all_runtimes() {
        let loader = MockLoader::new();
        {
            let bridge = Bridge::new(loader.clone());
            for _ in 0..3 {
                bridge.create_model(RuntimeId(1), "m", Device::cpu()).unwrap();
            }
            assert_eq!(loader.opens(), 3);
        }
        assert_eq!(loader.closes(), 3);
    }

    #[test]
    fn caller_queued_behind_delete_sees_invalid_handle() {
        let (bridge, loader) = bridge();
        let h = bridge.create_model(RuntimeId(1), "m", Device::cpu()).unwrap();
        bridge.set_input(h, "data", &[1], &[1.0], 1).unwrap();
        let bridge = std::sync::Arc::new(bridge);

        loader.hold_runs();
        let runner = {
            let bridge = bridge.clone();
            std::thread::spawn(move || bridge.run_model(h))
        };
        loader.wait_for_parked_run();

        // A caller that resolved the handle before the delete.
        let queued = bridge.registry.lookup(h).unwrap();

        let deleter = {
            let bridge = bridge.clone();
            std::thread::spawn(move || bridge.delete_model(h))
        };
        while !bridge.live_models().is_empty() {
            std::thread::yield_now();
        }
        // The delete has unregistered the handle but waits for the run.
        assert_eq!(loader.closes(), 0);

        loader.release_runs();
        runner.join().unwrap().unwrap();
        deleter.join().unwrap().unwrap();
        assert_eq!(loader.closes(), 1);

        let err = with_slot(h, &queued, |m| m.check("GetDLRNumInputs", m.runtime.num_inputs(m.native))).unwrap_err();
        assert!(matches!(err, DlrError::InvalidHandle(x) if x == h));
        assert!(matches!(bridge.num_inputs(h), Err(DlrError::InvalidHandle(_))));
    }

    #[test]
    fn close_all_reports_failures() {
        let (bridge, loader) = bridge();
        let a = bridge.create_model(RuntimeId(1), "a", Device::cpu()).unwrap();
        let b = bridge.create_model(RuntimeId(1), "b", Device::cpu()).unwrap();
        loader.fail_on("DeleteDLRModel");

        let failures = bridge.close_all();
        let failed: Vec<ModelHandle> = failures.iter().map(|(h, _)| *h).collect();
        assert_eq!(failed, vec![a, b]);
        assert!(bridge.live_models().is_empty());
        assert_eq!(loader.closes(), 2);
    }
}
