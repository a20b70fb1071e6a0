//! In-memory runtime for tests and benchmarks.
//!
//! [`MockLoader`] hands out [`MockRuntime`] instances that behave like a
//! DLR runtime with one output: running the model copies the most recent
//! `SetDLRInput` tensor to output 0. Opens and closes are counted, and any
//! entry point can be made to fail by symbol name.

use std::collections::{HashMap, HashSet};
use std::ffi::CStr;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicUsize, Ordering};

use parking_lot::{Condvar, Mutex};

use crate::error::DlrError;
use crate::ffi::SYMBOLS;
use crate::runtime::{Device, ModelPtr, NativeResult, Runtime, RuntimeId, RuntimeLoader, StatusCode};

/// Status returned by every failing mock call.
pub const MOCK_FAILURE: StatusCode = StatusCode(-1);

/// Static description of the model every mock runtime serves.
#[derive(Debug, Clone)]
pub struct MockModelSpec {
    pub inputs: Vec<String>,
    pub weights: Vec<String>,
    pub backend: String,
}

impl Default for MockModelSpec {
    fn default() -> Self {
        Self {
            inputs: vec!["data".to_string()],
            weights: vec!["fc1_weight".to_string(), "fc1_bias".to_string()],
            backend: "tvm".to_string(),
        }
    }
}

#[derive(Default)]
struct Shared {
    opens: AtomicUsize,
    closes: AtomicUsize,
    next_model: AtomicUsize,
    failing: Mutex<HashSet<&'static str>>,
    load_error: Mutex<Option<String>>,
    created: Mutex<Vec<(String, Device)>>,
    num_threads: AtomicI32,
    cpu_affinity: AtomicBool,
    negative_outputs: AtomicBool,
    run_gate: RunGate,
}

/// Parks `RunDLRModel` calls while held.
#[derive(Default)]
struct RunGate {
    state: Mutex<GateState>,
    cond: Condvar,
}

#[derive(Default)]
struct GateState {
    held: bool,
    parked: usize,
}

impl RunGate {
    fn pass(&self) {
        let mut state = self.state.lock();
        if !state.held {
            return;
        }
        state.parked += 1;
        self.cond.notify_all();
        while state.held {
            self.cond.wait(&mut state);
        }
        state.parked -= 1;
    }
}

/// Loader producing [`MockRuntime`]s. Clones share counters and failure
/// settings, so a test can keep one clone while a bridge owns another.
#[derive(Clone, Default)]
pub struct MockLoader {
    shared: Arc<Shared>,
    spec: MockModelSpec,
}

impl MockLoader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_spec(spec: MockModelSpec) -> Self {
        Self {
            shared: Arc::default(),
            spec,
        }
    }

    /// The message a failing call to `symbol` leaves as last error.
    pub fn error_message(symbol: &str) -> String {
        format!("mock: {symbol} failed")
    }

    /// Makes every later call to `symbol` fail.
    pub fn fail_on(&self, symbol: &'static str) {
        debug_assert!(SYMBOLS.contains(&symbol), "unknown DLR symbol {symbol}");
        self.shared.failing.lock().insert(symbol);
    }

    pub fn clear_failures(&self) {
        self.shared.failing.lock().clear();
    }

    /// Makes every later load fail with `reason`.
    pub fn fail_loads(&self, reason: impl Into<String>) {
        *self.shared.load_error.lock() = Some(reason.into());
    }

    /// Number of runtime instances opened so far.
    pub fn opens(&self) -> usize {
        self.shared.opens.load(Ordering::SeqCst)
    }

    /// Number of runtime instances released so far.
    pub fn closes(&self) -> usize {
        self.shared.closes.load(Ordering::SeqCst)
    }

    /// `(model path, device)` of every successful create, in order.
    pub fn created_models(&self) -> Vec<(String, Device)> {
        self.shared.created.lock().clone()
    }

    /// Thread count most recently set through any runtime.
    pub fn num_threads(&self) -> i32 {
        self.shared.num_threads.load(Ordering::SeqCst)
    }

    /// CPU affinity flag most recently set through any runtime.
    pub fn cpu_affinity(&self) -> bool {
        self.shared.cpu_affinity.load(Ordering::SeqCst)
    }

    /// Makes `GetDLROutputSizeDim` report a negative size and dim.
    pub fn report_negative_outputs(&self, enabled: bool) {
        self.shared.negative_outputs.store(enabled, Ordering::SeqCst);
    }

    /// Parks every later `RunDLRModel` call until [`MockLoader::release_runs`].
    pub fn hold_runs(&self) {
        self.shared.run_gate.state.lock().held = true;
    }

    /// Blocks until at least one run is parked by [`MockLoader::hold_runs`].
    pub fn wait_for_parked_run(&self) {
        let gate = &self.shared.run_gate;
        let mut state = gate.state.lock();
        while state.parked == 0 {
            gate.cond.wait(&mut state);
        }
    }

    /// Lets parked and future runs through.
    pub fn release_runs(&self) {
        let gate = &self.shared.run_gate;
        gate.state.lock().held = false;
        gate.cond.notify_all();
    }
}

impl RuntimeLoader for MockLoader {
    fn load(&self, id: RuntimeId) -> Result<Box<dyn Runtime>, DlrError> {
        if let Some(reason) = self.shared.load_error.lock().clone() {
            return Err(DlrError::Load {
                path: PathBuf::from(format!("mock://dlr_{id}")),
                reason,
            });
        }
        self.shared.opens.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MockRuntime {
            shared: self.shared.clone(),
            spec: self.spec.clone(),
            state: Mutex::new(MockState::default()),
        }))
    }
}

/// A tensor as the mock stores it.
#[derive(Debug, Clone, Default)]
struct MockTensor {
    shape: Vec<i64>,
    data: Vec<f32>,
}

#[derive(Default)]
struct MockState {
    last_error: String,
    models: HashSet<usize>,
    inputs: HashMap<String, MockTensor>,
    last_input: Option<MockTensor>,
    output: MockTensor,
}

/// One mock runtime instance; counts as closed when dropped.
pub struct MockRuntime {
    shared: Arc<Shared>,
    spec: MockModelSpec,
    state: Mutex<MockState>,
}

impl Drop for MockRuntime {
    fn drop(&mut self) {
        self.shared.closes.fetch_add(1, Ordering::SeqCst);
    }
}

impl MockRuntime {
    /// Fails with `msg` recorded as last error.
    fn error(&self, msg: String) -> StatusCode {
        self.state.lock().last_error = msg;
        MOCK_FAILURE
    }

    /// Checks failure injection and model validity before a call.
    fn enter(&self, symbol: &'static str, model: ModelPtr) -> NativeResult<()> {
        if self.shared.failing.lock().contains(symbol) {
            return Err(self.error(MockLoader::error_message(symbol)));
        }
        let known = self.state.lock().models.contains(&model.as_raw().addr());
        if !known {
            return Err(self.error(format!("mock: {symbol}: unknown model")));
        }
        Ok(())
    }

    fn name_at(&self, names: &[String], kind: &str, index: i32) -> NativeResult<String> {
        usize::try_from(index)
            .ok()
            .and_then(|i| names.get(i))
            .cloned()
            .ok_or_else(|| self.error(format!("mock: {kind} index {index} out of range")))
    }

    fn output_at(&self, index: i32) -> NativeResult<MockTensor> {
        if index != 0 {
            return Err(self.error(format!("mock: output index {index} out of range")));
        }
        Ok(self.state.lock().output.clone())
    }
}

impl Runtime for MockRuntime {
    fn create_model(&self, model_path: &CStr, device: Device) -> NativeResult<ModelPtr> {
        if self.shared.failing.lock().contains("CreateDLRModel") {
            return Err(self.error(MockLoader::error_message("CreateDLRModel")));
        }
        let id = self.shared.next_model.fetch_add(1, Ordering::SeqCst) + 1;
        self.state.lock().models.insert(id);
        self.shared
            .created
            .lock()
            .push((model_path.to_string_lossy().into_owned(), device));
        Ok(unsafe { ModelPtr::from_raw(std::ptr::without_provenance_mut(id)) })
    }

    fn delete_model(&self, model: ModelPtr) -> NativeResult<()> {
        self.enter("DeleteDLRModel", model)?;
        self.state.lock().models.remove(&model.as_raw().addr());
        Ok(())
    }

    fn run_model(&self, model: ModelPtr) -> NativeResult<()> {
        self.enter("RunDLRModel", model)?;
        self.shared.run_gate.pass();
        let mut state = self.state.lock();
        match state.last_input.clone() {
            Some(input) => {
                state.output = input;
                Ok(())
            }
            None => {
                state.last_error = "mock: no input set".to_string();
                Err(MOCK_FAILURE)
            }
        }
    }

    fn num_inputs(&self, model: ModelPtr) -> NativeResult<i32> {
        self.enter("GetDLRNumInputs", model)?;
        Ok(self.spec.inputs.len() as i32)
    }

    fn num_weights(&self, model: ModelPtr) -> NativeResult<i32> {
        self.enter("GetDLRNumWeights", model)?;
        Ok(self.spec.weights.len() as i32)
    }

    fn num_outputs(&self, model: ModelPtr) -> NativeResult<i32> {
        self.enter("GetDLRNumOutputs", model)?;
        Ok(1)
    }

    fn input_name(&self, model: ModelPtr, index: i32) -> NativeResult<String> {
        self.enter("GetDLRInputName", model)?;
        self.name_at(&self.spec.inputs, "input", index)
    }

    fn weight_name(&self, model: ModelPtr, index: i32) -> NativeResult<String> {
        self.enter("GetDLRWeightName", model)?;
        self.name_at(&self.spec.weights, "weight", index)
    }

    fn set_input(&self, model: ModelPtr, name: &CStr, shape: &[i64], data: &[f32], dim: i32) -> NativeResult<()> {
        self.enter("SetDLRInput", model)?;
        let name = name.to_string_lossy().into_owned();
        if !self.spec.inputs.contains(&name) {
            return Err(self.error(format!("mock: unknown input {name:?}")));
        }
        let shape = match usize::try_from(dim).ok().and_then(|d| shape.get(..d)) {
            Some(shape) => shape.to_vec(),
            None => return Err(self.error(format!("mock: dim {dim} out of range"))),
        };
        let data = shape
            .iter()
            .try_fold(1usize, |acc, &d| usize::try_from(d).ok().and_then(|d| acc.checked_mul(d)))
            .and_then(|size| data.get(..size));
        let Some(data) = data else {
            return Err(self.error(format!("mock: input {name:?} too short for shape {shape:?}")));
        };
        let tensor = MockTensor {
            data: data.to_vec(),
            shape,
        };
        let mut state = self.state.lock();
        state.inputs.insert(name, tensor.clone());
        state.last_input = Some(tensor);
        Ok(())
    }

    fn output_size_dim(&self, model: ModelPtr, index: i32) -> NativeResult<(i64, i32)> {
        self.enter("GetDLROutputSizeDim", model)?;
        let out = self.output_at(index)?;
        if self.shared.negative_outputs.load(Ordering::SeqCst) {
            return Ok((-5, -1));
        }
        Ok((out.data.len() as i64, out.shape.len() as i32))
    }

    fn output_shape(&self, model: ModelPtr, index: i32, shape: &mut [i64]) -> NativeResult<()> {
        self.enter("GetDLROutputShape", model)?;
        let out = self.output_at(index)?;
        if shape.len() != out.shape.len() {
            return Err(self.error(format!("mock: shape buffer of {} for dim {}", shape.len(), out.shape.len())));
        }
        shape.copy_from_slice(&out.shape);
        Ok(())
    }

    fn output(&self, model: ModelPtr, index: i32, data: &mut [f32]) -> NativeResult<()> {
        self.enter("GetDLROutput", model)?;
        let out = self.output_at(index)?;
        if data.len() != out.data.len() {
            return Err(self.error(format!("mock: output buffer of {} for size {}", data.len(), out.data.len())));
        }
        data.copy_from_slice(&out.data);
        Ok(())
    }

    fn backend(&self, model: ModelPtr) -> NativeResult<String> {
        self.enter("GetDLRBackend", model)?;
        Ok(self.spec.backend.clone())
    }

    fn set_num_threads(&self, model: ModelPtr, threads: i32) -> NativeResult<()> {
        self.enter("SetDLRNumThreads", model)?;
        self.shared.num_threads.store(threads, Ordering::SeqCst);
        Ok(())
    }

    fn use_cpu_affinity(&self, model: ModelPtr, enabled: bool) -> NativeResult<()> {
        self.enter("UseDLRCPUAffinity", model)?;
        self.shared.cpu_affinity.store(enabled, Ordering::SeqCst);
        Ok(())
    }

    fn last_error(&self) -> String {
        self.state.lock().last_error.clone()
    }
}
