//! [`Runtime`] backed by a dynamically loaded DLR shared library.

use std::ffi::CStr;
use std::os::raw::{c_char, c_int};
use std::path::{Path, PathBuf};
use std::ptr;

use libloading::Library;
use tracing::debug;

use crate::config::RuntimeConfig;
use crate::error::DlrError;
use crate::ffi::{DLRModelHandle, DlrApi};
use crate::runtime::{Device, ModelPtr, NativeResult, Runtime, RuntimeId, RuntimeLoader, StatusCode};

fn check(status: c_int) -> NativeResult<()> {
    if status == 0 { Ok(()) } else { Err(StatusCode(status)) }
}

/// Copies a runtime-owned C string. A null pointer reads as empty.
fn copy_c_str(ptr: *const c_char) -> String {
    if ptr.is_null() {
        return String::new();
    }
    unsafe { CStr::from_ptr(ptr) }.to_string_lossy().into_owned()
}

#[cfg(unix)]
fn open_library(path: &Path) -> Result<Library, libloading::Error> {
    use libloading::os::unix::{Library as UnixLibrary, RTLD_LAZY, RTLD_LOCAL};

    let lib = unsafe { UnixLibrary::open(Some(path), RTLD_LAZY | RTLD_LOCAL) }?;
    Ok(lib.into())
}

#[cfg(not(unix))]
fn open_library(path: &Path) -> Result<Library, libloading::Error> {
    unsafe { Library::new(path) }
}

// ---------------------------------------------------------------------------
// SharedLibraryRuntime
// ---------------------------------------------------------------------------

/// One opened DLR runtime library with its resolved function table.
///
/// The library is closed when this value is dropped.
pub struct SharedLibraryRuntime {
    api: DlrApi,
    path: PathBuf,
    // Declared last so the table never outlives the library.
    _lib: Library,
}

impl SharedLibraryRuntime {
    /// Opens the library at `path` and resolves every DLR entry point.
    pub fn open(path: &Path) -> Result<Self, DlrError> {
        let lib = open_library(path).map_err(|e| DlrError::Load {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
        // On failure `lib` is dropped here, closing the library.
        let api = DlrApi::load(&lib, path)?;
        debug!(path = %path.display(), "dlr: runtime library loaded");
        Ok(Self::from_parts(api, lib, path.to_path_buf()))
    }

    /// Pairs a function table with the library it was resolved from.
    pub(crate) fn from_parts(api: DlrApi, lib: Library, path: PathBuf) -> Self {
        Self { api, path, _lib: lib }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for SharedLibraryRuntime {
    fn drop(&mut self) {
        debug!(path = %self.path.display(), "dlr: runtime library released");
    }
}

impl Runtime for SharedLibraryRuntime {
    fn create_model(&self, model_path: &CStr, device: Device) -> NativeResult<ModelPtr> {
        let mut handle: DLRModelHandle = ptr::null_mut();
        check(unsafe {
            (self.api.create_model)(
                &mut handle,
                model_path.as_ptr(),
                device.device_type.code(),
                device.device_id,
            )
        })?;
        Ok(unsafe { ModelPtr::from_raw(handle) })
    }

    fn delete_model(&self, model: ModelPtr) -> NativeResult<()> {
        let mut handle = model.as_raw();
        check(unsafe { (self.api.delete_model)(&mut handle) })
    }

    fn run_model(&self, model: ModelPtr) -> NativeResult<()> {
        let mut handle = model.as_raw();
        check(unsafe { (self.api.run_model)(&mut handle) })
    }

    fn num_inputs(&self, model: ModelPtr) -> NativeResult<i32> {
        let mut handle = model.as_raw();
        let mut num: c_int = 0;
        check(unsafe { (self.api.get_num_inputs)(&mut handle, &mut num) })?;
        Ok(num)
    }

    fn num_weights(&self, model: ModelPtr) -> NativeResult<i32> {
        let mut handle = model.as_raw();
        let mut num: c_int = 0;
        check(unsafe { (self.api.get_num_weights)(&mut handle, &mut num) })?;
        Ok(num)
    }

    fn num_outputs(&self, model: ModelPtr) -> NativeResult<i32> {
        let mut handle = model.as_raw();
        let mut num: c_int = 0;
        check(unsafe { (self.api.get_num_outputs)(&mut handle, &mut num) })?;
        Ok(num)
    }

    fn input_name(&self, model: ModelPtr, index: i32) -> NativeResult<String> {
        let mut handle = model.as_raw();
        let mut name: *const c_char = ptr::null();
        check(unsafe { (self.api.get_input_name)(&mut handle, index, &mut name) })?;
        Ok(copy_c_str(name))
    }

    fn weight_name(&self, model: ModelPtr, index: i32) -> NativeResult<String> {
        let mut handle = model.as_raw();
        let mut name: *const c_char = ptr::null();
        check(unsafe { (self.api.get_weight_name)(&mut handle, index, &mut name) })?;
        Ok(copy_c_str(name))
    }

    fn set_input(&self, model: ModelPtr, name: &CStr, shape: &[i64], data: &[f32], dim: i32) -> NativeResult<()> {
        let mut handle = model.as_raw();
        check(unsafe {
            (self.api.set_input)(
                &mut handle,
                name.as_ptr(),
                shape.as_ptr(),
                data.as_ptr().cast(),
                dim,
            )
        })
    }

    fn output_size_dim(&self, model: ModelPtr, index: i32) -> NativeResult<(i64, i32)> {
        let mut handle = model.as_raw();
        let mut size: i64 = 0;
        let mut dim: c_int = 0;
        check(unsafe { (self.api.get_output_size_dim)(&mut handle, index, &mut size, &mut dim) })?;
        Ok((size, dim))
    }

    fn output_shape(&self, model: ModelPtr, index: i32, shape: &mut [i64]) -> NativeResult<()> {
        let mut handle = model.as_raw();
        check(unsafe { (self.api.get_output_shape)(&mut handle, index, shape.as_mut_ptr()) })
    }

    fn output(&self, model: ModelPtr, index: i32, data: &mut [f32]) -> NativeResult<()> {
        let mut handle = model.as_raw();
        check(unsafe { (self.api.get_output)(&mut handle, index, data.as_mut_ptr().cast()) })
    }

    fn backend(&self, model: ModelPtr) -> NativeResult<String> {
        let mut handle = model.as_raw();
        let mut name: *const c_char = ptr::null();
        check(unsafe { (self.api.get_backend)(&mut handle, &mut name) })?;
        Ok(copy_c_str(name))
    }

    fn set_num_threads(&self, model: ModelPtr, threads: i32) -> NativeResult<()> {
        let mut handle = model.as_raw();
        check(unsafe { (self.api.set_num_threads)(&mut handle, threads) })
    }

    fn use_cpu_affinity(&self, model: ModelPtr, enabled: bool) -> NativeResult<()> {
        let mut handle = model.as_raw();
        check(unsafe { (self.api.use_cpu_affinity)(&mut handle, c_int::from(enabled)) })
    }

    fn last_error(&self) -> String {
        let msg = copy_c_str(unsafe { (self.api.get_last_error)() });
        if msg.is_empty() { "unknown error".to_string() } else { msg }
    }
}

// ---------------------------------------------------------------------------
// LibraryLoader
// ---------------------------------------------------------------------------

/// Loads runtimes from the filesystem layout described by a [`RuntimeConfig`].
#[derive(Debug, Clone)]
pub struct LibraryLoader {
    config: RuntimeConfig,
}

impl LibraryLoader {
    pub fn new(config: RuntimeConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }
}

impl RuntimeLoader for LibraryLoader {
    fn load(&self, id: RuntimeId) -> Result<Box<dyn Runtime>, DlrError> {
        let path = self.config.library_path(id)?;
        debug!(runtime_id = %id, path = %path.display(), "dlr: loading runtime");
        Ok(Box::new(SharedLibraryRuntime::open(&path)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_library_is_load_error() {
        let dir = tempfile::tempdir().unwrap();
        let loader = LibraryLoader::new(RuntimeConfig::new(dir.path()));
        match loader.load(RuntimeId(42)) {
            Err(DlrError::Load { path, .. }) => {
                assert!(path.starts_with(dir.path()));
                assert!(path.to_string_lossy().contains("dlr_42"));
            }
            Err(other) => panic!("unexpected error: {other}"),
            Ok(_) => panic!("loaded a library that does not exist"),
        }
    }

    #[test]
    fn bad_template_fails_before_open() {
        let loader = LibraryLoader::new(RuntimeConfig::new("/nonexistent").with_file_name("dlr.so"));
        assert!(matches!(loader.load(RuntimeId(1)), Err(DlrError::Config(_))));
    }

    #[cfg(all(target_os = "linux", target_env = "gnu"))]
    #[test]
    fn library_without_dlr_symbols_is_rejected() {
        let err = SharedLibraryRuntime::open(Path::new("libc.so.6")).err().unwrap();
        assert!(matches!(err, DlrError::MissingSymbol { symbol: "GetDLRNumInputs", .. }));
    }

    // ----- In-process C API -----
    //
    // These stand in for a runtime library: the model handle points at a
    // boxed FakeModel and SetDLRInput is echoed back as output 0.

    use std::cell::RefCell;
    use std::ffi::CString;
    use std::os::raw::c_void;

    #[derive(Default)]
    struct FakeModel {
        path: String,
        device: (c_int, c_int),
        shape: Vec<i64>,
        data: Vec<f32>,
        ran: bool,
        threads: c_int,
        affinity: c_int,
    }

    const INPUT: &CStr = c"data";
    const WEIGHTS: [&CStr; 2] = [c"fc_weight", c"fc_bias"];

    thread_local! {
        static LAST_ERROR: RefCell<CString> = RefCell::new(CString::default());
    }

    fn set_error(msg: &str) -> c_int {
        LAST_ERROR.with(|e| *e.borrow_mut() = CString::new(msg).unwrap());
        -1
    }

    unsafe fn model<'a>(handle: *mut DLRModelHandle) -> &'a mut FakeModel {
        unsafe { &mut *(*handle).cast::<FakeModel>() }
    }

    unsafe extern "C" fn fake_create(
        handle: *mut DLRModelHandle,
        path: *const c_char,
        dev_type: c_int,
        dev_id: c_int,
    ) -> c_int {
        let path = unsafe { CStr::from_ptr(path) }.to_string_lossy().into_owned();
        if path.is_empty() {
            return set_error("empty model path");
        }
        let m = Box::new(FakeModel {
            path,
            device: (dev_type, dev_id),
            ..FakeModel::default()
        });
        unsafe { *handle = Box::into_raw(m).cast::<c_void>() };
        0
    }

    unsafe extern "C" fn fake_delete(handle: *mut DLRModelHandle) -> c_int {
        drop(unsafe { Box::from_raw((*handle).cast::<FakeModel>()) });
        0
    }

    unsafe extern "C" fn fake_run(handle: *mut DLRModelHandle) -> c_int {
        let m = unsafe { model(handle) };
        if m.shape.is_empty() {
            // Fails without leaving a message.
            return set_error("");
        }
        m.ran = true;
        0
    }

    unsafe extern "C" fn fake_num_inputs(_: *mut DLRModelHandle, num: *mut c_int) -> c_int {
        unsafe { *num = 1 };
        0
    }

    unsafe extern "C" fn fake_num_weights(_: *mut DLRModelHandle, num: *mut c_int) -> c_int {
        unsafe { *num = WEIGHTS.len() as c_int };
        0
    }

    unsafe extern "C" fn fake_num_outputs(_: *mut DLRModelHandle, num: *mut c_int) -> c_int {
        unsafe { *num = 1 };
        0
    }

    unsafe extern "C" fn fake_input_name(_: *mut DLRModelHandle, index: c_int, name: *mut *const c_char) -> c_int {
        if index != 0 {
            return set_error("input index out of range");
        }
        unsafe { *name = INPUT.as_ptr() };
        0
    }

    unsafe extern "C" fn fake_weight_name(_: *mut DLRModelHandle, index: c_int, name: *mut *const c_char) -> c_int {
        match usize::try_from(index).ok().and_then(|i| WEIGHTS.get(i)) {
            Some(w) => {
                unsafe { *name = w.as_ptr() };
                0
            }
            None => set_error("weight index out of range"),
        }
    }

    unsafe extern "C" fn fake_set_input(
        handle: *mut DLRModelHandle,
        name: *const c_char,
        shape: *const i64,
        input: *const c_void,
        dim: c_int,
    ) -> c_int {
        if unsafe { CStr::from_ptr(name) } != INPUT {
            return set_error("unknown input");
        }
        let m = unsafe { model(handle) };
        m.shape = unsafe { std::slice::from_raw_parts(shape, dim as usize) }.to_vec();
        let size = m.shape.iter().product::<i64>() as usize;
        m.data = unsafe { std::slice::from_raw_parts(input.cast::<f32>(), size) }.to_vec();
        m.ran = false;
        0
    }

    unsafe extern "C" fn fake_output_size_dim(
        handle: *mut DLRModelHandle,
        index: c_int,
        size: *mut i64,
        dim: *mut c_int,
    ) -> c_int {
        if index != 0 {
            return set_error("output index out of range");
        }
        let m = unsafe { model(handle) };
        let (s, d) = if m.ran { (m.data.len() as i64, m.shape.len() as c_int) } else { (0, 0) };
        unsafe {
            *size = s;
            *dim = d;
        }
        0
    }

    unsafe extern "C" fn fake_output_shape(handle: *mut DLRModelHandle, _: c_int, shape: *mut i64) -> c_int {
        let m = unsafe { model(handle) };
        if m.ran {
            unsafe { ptr::copy_nonoverlapping(m.shape.as_ptr(), shape, m.shape.len()) };
        }
        0
    }

    unsafe extern "C" fn fake_output(handle: *mut DLRModelHandle, _: c_int, out: *mut c_void) -> c_int {
        let m = unsafe { model(handle) };
        if m.ran {
            unsafe { ptr::copy_nonoverlapping(m.data.as_ptr(), out.cast::<f32>(), m.data.len()) };
        }
        0
    }

    unsafe extern "C" fn fake_last_error() -> *const c_char {
        LAST_ERROR.with(|e| e.borrow().as_ptr())
    }

    unsafe extern "C" fn fake_backend(_: *mut DLRModelHandle, name: *mut *const c_char) -> c_int {
        unsafe { *name = c"fake".as_ptr() };
        0
    }

    unsafe extern "C" fn fake_set_num_threads(handle: *mut DLRModelHandle, threads: c_int) -> c_int {
        let m = unsafe { model(handle) };
        m.threads = threads;
        0
    }

    unsafe extern "C" fn fake_use_cpu_affinity(handle: *mut DLRModelHandle, enabled: c_int) -> c_int {
        let m = unsafe { model(handle) };
        m.affinity = enabled;
        0
    }

    #[cfg(unix)]
    fn fake_runtime() -> SharedLibraryRuntime {
        let api = DlrApi {
            get_num_inputs: fake_num_inputs,
            get_num_weights: fake_num_weights,
            get_input_name: fake_input_name,
            get_weight_name: fake_weight_name,
            set_input: fake_set_input,
            get_output_shape: fake_output_shape,
            get_output: fake_output,
            get_output_size_dim: fake_output_size_dim,
            get_num_outputs: fake_num_outputs,
            create_model: fake_create,
            delete_model: fake_delete,
            run_model: fake_run,
            get_last_error: fake_last_error,
            get_backend: fake_backend,
            set_num_threads: fake_set_num_threads,
            use_cpu_affinity: fake_use_cpu_affinity,
        };
        let lib: Library = libloading::os::unix::Library::this().into();
        SharedLibraryRuntime::from_parts(api, lib, PathBuf::from("in-process"))
    }

    fn fake_model(native: ModelPtr) -> &'static FakeModel {
        unsafe { &*native.as_raw().cast::<FakeModel>() }
    }

    #[cfg(unix)]
    #[test]
    fn marshals_create_and_metadata() {
        let rt = fake_runtime();
        let native = rt.create_model(c"/models/resnet", Device::gpu(3)).unwrap();
        assert_eq!(fake_model(native).path, "/models/resnet");
        assert_eq!(fake_model(native).device, (2, 3));

        assert_eq!(rt.num_inputs(native), Ok(1));
        assert_eq!(rt.num_weights(native), Ok(2));
        assert_eq!(rt.num_outputs(native), Ok(1));
        assert_eq!(rt.input_name(native, 0).unwrap(), "data");
        assert_eq!(rt.weight_name(native, 1).unwrap(), "fc_bias");
        assert_eq!(rt.backend(native).unwrap(), "fake");

        assert_eq!(rt.weight_name(native, 2), Err(StatusCode(-1)));
        assert_eq!(rt.last_error(), "weight index out of range");

        rt.set_num_threads(native, 6).unwrap();
        rt.use_cpu_affinity(native, true).unwrap();
        assert_eq!(fake_model(native).threads, 6);
        assert_eq!(fake_model(native).affinity, 1);

        rt.delete_model(native).unwrap();
    }

    #[cfg(unix)]
    #[test]
    fn marshals_tensors_bit_exact() {
        let rt = fake_runtime();
        let native = rt.create_model(c"m", Device::cpu()).unwrap();

        let input: Vec<f32> = (0..6).map(|i| i as f32 * 1.5 - 2.0).collect();
        // Only the first `dim` shape entries cross the boundary.
        rt.set_input(native, c"data", &[2, 3, 99], &input, 2).unwrap();
        rt.run_model(native).unwrap();

        let (size, dim) = rt.output_size_dim(native, 0).unwrap();
        assert_eq!((size, dim), (6, 2));

        let mut shape = vec![0i64; dim as usize];
        rt.output_shape(native, 0, &mut shape).unwrap();
        assert_eq!(shape, vec![2, 3]);

        let mut data = vec![0f32; size as usize];
        rt.output(native, 0, &mut data).unwrap();
        for (a, b) in input.iter().zip(&data) {
            assert_eq!(a.to_bits(), b.to_bits());
        }

        assert_eq!(rt.set_input(native, c"other", &[1], &[0.0], 1), Err(StatusCode(-1)));
        assert_eq!(rt.last_error(), "unknown input");

        rt.delete_model(native).unwrap();
    }

    #[cfg(unix)]
    #[test]
    fn empty_last_error_reads_unknown() {
        let rt = fake_runtime();
        assert_eq!(rt.create_model(c"", Device::cpu()), Err(StatusCode(-1)));
        assert_eq!(rt.last_error(), "empty model path");

        let native = rt.create_model(c"m", Device::cpu()).unwrap();
        assert_eq!(rt.run_model(native), Err(StatusCode(-1)));
        assert_eq!(rt.last_error(), "unknown error");
        rt.delete_model(native).unwrap();
    }

    #[cfg(unix)]
    #[test]
    fn bridge_drives_shared_library_runtime() {
        struct FakeLoader;

        impl RuntimeLoader for FakeLoader {
            fn load(&self, _: RuntimeId) -> Result<Box<dyn Runtime>, DlrError> {
                Ok(Box::new(fake_runtime()))
            }
        }

        let bridge = crate::Bridge::new(FakeLoader);
        let h = bridge.create_model(RuntimeId(1), "/models/m", Device::cpu()).unwrap();
        let info = bridge.model_info(h).unwrap();
        assert_eq!(info.inputs, vec!["data".to_string()]);
        assert_eq!(info.weights, vec!["fc_weight".to_string(), "fc_bias".to_string()]);

        bridge.set_input(h, "data", &[1, 4], &[0.5, -0.5, 8.0, 1e-3], 2).unwrap();
        bridge.run_model(h).unwrap();
        assert_eq!(bridge.output_shape(h, 0).unwrap(), vec![1, 4]);
        assert_eq!(bridge.output(h, 0).unwrap(), vec![0.5, -0.5, 8.0, 1e-3]);
        bridge.delete_model(h).unwrap();
    }

    #[test]
    fn null_c_string_reads_empty() {
        assert_eq!(copy_c_str(ptr::null()), "");
        assert_eq!(copy_c_str(c"cpu".as_ptr()), "cpu");
    }
}
