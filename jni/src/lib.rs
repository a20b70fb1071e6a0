//! JNI entry points for `ai.djl.dlr.jni.DlrLibrary`.
//!
//! Every native method of the Java class maps to one [`Bridge`] call on a
//! process-wide bridge. Model handles cross the boundary as the `jlong`
//! value of a [`ModelHandle`]. Any failure is thrown as
//! `ai.djl.engine.EngineException` carrying the error text; the return
//! value is then a zero/null placeholder the Java side never sees.
//!
//! The runtime libraries are found through [`RuntimeConfig::from_env`],
//! so `DLR_LIBRARY_PATH` must point at the directory holding
//! `libdlr_<id>.so` (or the platform equivalent).

use jni::JNIEnv;
use jni::objects::{JFloatArray, JLongArray, JObject, JString};
use jni::sys::{JNI_FALSE, jboolean, jfloatArray, jint, jlong, jlongArray, jsize, jstring};
use once_cell::sync::Lazy;
use thiserror::Error;
use tracing::warn;

use dlr_bridge::{Bridge, Device, DlrError, ModelHandle, RuntimeConfig, RuntimeId};

const ENGINE_EXCEPTION: &str = "ai/djl/engine/EngineException";

static BRIDGE: Lazy<Bridge> = Lazy::new(|| Bridge::with_config(RuntimeConfig::from_env()));

/// Errors raised while servicing a JNI call.
#[derive(Debug, Error)]
enum JniBridgeError {
    #[error(transparent)]
    Dlr(#[from] DlrError),

    #[error("jni: {0}")]
    Jni(#[from] jni::errors::Error),
}

type JniResult<T> = Result<T, JniBridgeError>;

/// Throws `err` as an EngineException unless a Java exception is already
/// pending.
fn throw(env: &mut JNIEnv, err: &JniBridgeError) {
    if matches!(err, JniBridgeError::Jni(jni::errors::Error::JavaException)) {
        return;
    }
    if let Err(e) = env.throw_new(ENGINE_EXCEPTION, err.to_string()) {
        warn!(error = %e, cause = %err, "dlr-jni: failed to throw EngineException");
    }
}

fn or_throw<T>(env: &mut JNIEnv, result: JniResult<T>, fallback: T) -> T {
    match result {
        Ok(v) => v,
        Err(err) => {
            throw(env, &err);
            fallback
        }
    }
}

fn model_handle(jhandle: jlong) -> ModelHandle {
    ModelHandle::from_raw(jhandle as u64)
}

fn runtime_id(jid: jlong) -> Result<RuntimeId, DlrError> {
    u64::try_from(jid)
        .map(RuntimeId)
        .map_err(|_| DlrError::InvalidArgument(format!("negative runtime id {jid}")))
}

fn array_len(len: usize) -> Result<jsize, DlrError> {
    jsize::try_from(len).map_err(|_| DlrError::InvalidArgument(format!("array of {len} elements exceeds JNI limits")))
}

fn new_string(env: &mut JNIEnv, s: &str) -> JniResult<jstring> {
    Ok(env.new_string(s)?.into_raw())
}

// ---------------------------------------------------------------------------
// Call bodies
// ---------------------------------------------------------------------------

fn create_model(env: &mut JNIEnv, jid: jlong, jmodel_path: &JString, dev_type: jint, dev_id: jint) -> JniResult<jlong> {
    let id = runtime_id(jid)?;
    let model_path: String = env.get_string(jmodel_path)?.into();
    let handle = BRIDGE.create_model(id, model_path, Device::new(dev_type, dev_id))?;
    Ok(handle.as_raw() as jlong)
}

fn set_input(
    env: &mut JNIEnv,
    jhandle: jlong,
    jname: &JString,
    jshape: &JLongArray,
    jinput: &JFloatArray,
    dim: jint,
) -> JniResult<()> {
    let name: String = env.get_string(jname)?.into();

    let mut shape = vec![0i64; env.get_array_length(jshape)? as usize];
    env.get_long_array_region(jshape, 0, &mut shape)?;

    let mut data = vec![0f32; env.get_array_length(jinput)? as usize];
    env.get_float_array_region(jinput, 0, &mut data)?;

    BRIDGE.set_input(model_handle(jhandle), &name, &shape, &data, dim)?;
    Ok(())
}

fn output_shape(env: &mut JNIEnv, jhandle: jlong, index: jint) -> JniResult<jlongArray> {
    let shape = BRIDGE.output_shape(model_handle(jhandle), index)?;
    let arr = env.new_long_array(array_len(shape.len())?)?;
    env.set_long_array_region(&arr, 0, &shape)?;
    Ok(arr.into_raw())
}

fn output(env: &mut JNIEnv, jhandle: jlong, index: jint) -> JniResult<jfloatArray> {
    let data = BRIDGE.output(model_handle(jhandle), index)?;
    let arr = env.new_float_array(array_len(data.len())?)?;
    env.set_float_array_region(&arr, 0, &data)?;
    Ok(arr.into_raw())
}

// ---------------------------------------------------------------------------
// Exported symbols
// ---------------------------------------------------------------------------

#[unsafe(no_mangle)]
pub extern "system" fn Java_ai_djl_dlr_jni_DlrLibrary_createDlrModel<'local>(
    mut env: JNIEnv<'local>,
    _this: JObject<'local>,
    jid: jlong,
    jmodel_path: JString<'local>,
    jdev_type: jint,
    jdev_id: jint,
) -> jlong {
    let result = create_model(&mut env, jid, &jmodel_path, jdev_type, jdev_id);
    or_throw(&mut env, result, 0)
}

#[unsafe(no_mangle)]
pub extern "system" fn Java_ai_djl_dlr_jni_DlrLibrary_deleteDlrModel<'local>(
    mut env: JNIEnv<'local>,
    _this: JObject<'local>,
    jhandle: jlong,
) {
    let result = BRIDGE.delete_model(model_handle(jhandle)).map_err(Into::into);
    or_throw(&mut env, result, ())
}

#[unsafe(no_mangle)]
pub extern "system" fn Java_ai_djl_dlr_jni_DlrLibrary_runDlrModel<'local>(
    mut env: JNIEnv<'local>,
    _this: JObject<'local>,
    jhandle: jlong,
) {
    let result = BRIDGE.run_model(model_handle(jhandle)).map_err(Into::into);
    or_throw(&mut env, result, ())
}

#[unsafe(no_mangle)]
pub extern "system" fn Java_ai_djl_dlr_jni_DlrLibrary_getDlrNumInputs<'local>(
    mut env: JNIEnv<'local>,
    _this: JObject<'local>,
    jhandle: jlong,
) -> jint {
    let result = BRIDGE.num_inputs(model_handle(jhandle)).map_err(Into::into);
    or_throw(&mut env, result, 0)
}

#[unsafe(no_mangle)]
pub extern "system" fn Java_ai_djl_dlr_jni_DlrLibrary_getDlrNumWeights<'local>(
    mut env: JNIEnv<'local>,
    _this: JObject<'local>,
    jhandle: jlong,
) -> jint {
    let result = BRIDGE.num_weights(model_handle(jhandle)).map_err(Into::into);
    or_throw(&mut env, result, 0)
}

#[unsafe(no_mangle)]
pub extern "system" fn Java_ai_djl_dlr_jni_DlrLibrary_getDlrNumOutputs<'local>(
    mut env: JNIEnv<'local>,
    _this: JObject<'local>,
    jhandle: jlong,
) -> jint {
    let result = BRIDGE.num_outputs(model_handle(jhandle)).map_err(Into::into);
    or_throw(&mut env, result, 0)
}

#[unsafe(no_mangle)]
pub extern "system" fn Java_ai_djl_dlr_jni_DlrLibrary_getDlrInputName<'local>(
    mut env: JNIEnv<'local>,
    _this: JObject<'local>,
    jhandle: jlong,
    jindex: jint,
) -> jstring {
    let result = BRIDGE
        .input_name(model_handle(jhandle), jindex)
        .map_err(JniBridgeError::from)
        .and_then(|name| new_string(&mut env, &name));
    or_throw(&mut env, result, std::ptr::null_mut())
}

#[unsafe(no_mangle)]
pub extern "system" fn Java_ai_djl_dlr_jni_DlrLibrary_getDlrWeightName<'local>(
    mut env: JNIEnv<'local>,
    _this: JObject<'local>,
    jhandle: jlong,
    jindex: jint,
) -> jstring {
    let result = BRIDGE
        .weight_name(model_handle(jhandle), jindex)
        .map_err(JniBridgeError::from)
        .and_then(|name| new_string(&mut env, &name));
    or_throw(&mut env, result, std::ptr::null_mut())
}

#[unsafe(no_mangle)]
pub extern "system" fn Java_ai_djl_dlr_jni_DlrLibrary_setDLRInput<'local>(
    mut env: JNIEnv<'local>,
    _this: JObject<'local>,
    jhandle: jlong,
    jname: JString<'local>,
    jshape: JLongArray<'local>,
    jinput: JFloatArray<'local>,
    jdim: jint,
) {
    let result = set_input(&mut env, jhandle, &jname, &jshape, &jinput, jdim);
    or_throw(&mut env, result, ())
}

#[unsafe(no_mangle)]
pub extern "system" fn Java_ai_djl_dlr_jni_DlrLibrary_getDlrOutputShape<'local>(
    mut env: JNIEnv<'local>,
    _this: JObject<'local>,
    jhandle: jlong,
    jindex: jint,
) -> jlongArray {
    let result = output_shape(&mut env, jhandle, jindex);
    or_throw(&mut env, result, std::ptr::null_mut())
}

#[unsafe(no_mangle)]
pub extern "system" fn Java_ai_djl_dlr_jni_DlrLibrary_getDlrOutput<'local>(
    mut env: JNIEnv<'local>,
    _this: JObject<'local>,
    jhandle: jlong,
    jindex: jint,
) -> jfloatArray {
    let result = output(&mut env, jhandle, jindex);
    or_throw(&mut env, result, std::ptr::null_mut())
}

#[unsafe(no_mangle)]
pub extern "system" fn Java_ai_djl_dlr_jni_DlrLibrary_getDlrBackend<'local>(
    mut env: JNIEnv<'local>,
    _this: JObject<'local>,
    jhandle: jlong,
) -> jstring {
    let result = BRIDGE
        .backend(model_handle(jhandle))
        .map_err(JniBridgeError::from)
        .and_then(|name| new_string(&mut env, &name));
    or_throw(&mut env, result, std::ptr::null_mut())
}

#[unsafe(no_mangle)]
pub extern "system" fn Java_ai_djl_dlr_jni_DlrLibrary_setDlrNumThreads<'local>(
    mut env: JNIEnv<'local>,
    _this: JObject<'local>,
    jhandle: jlong,
    jthreads: jint,
) {
    let result = BRIDGE.set_num_threads(model_handle(jhandle), jthreads).map_err(Into::into);
    or_throw(&mut env, result, ())
}

#[unsafe(no_mangle)]
pub extern "system" fn Java_ai_djl_dlr_jni_DlrLibrary_useDlrCPUAffinity<'local>(
    mut env: JNIEnv<'local>,
    _this: JObject<'local>,
    jhandle: jlong,
    juse: jboolean,
) {
    let result = BRIDGE
        .use_cpu_affinity(model_handle(jhandle), juse != JNI_FALSE)
        .map_err(Into::into);
    or_throw(&mut env, result, ())
}
