//! Model inspection and inference commands.

use clap::{Args, ValueEnum};
use serde::{Deserialize, Serialize};

use dlr_bridge::{Bridge, Device, DeviceType, ModelHandle, RuntimeId};

use super::{get_config, load_request, output_result, print_verbose};
use crate::Cli;

#[derive(Clone, Copy, Debug, ValueEnum)]
enum DeviceKind {
    Cpu,
    Gpu,
    Opencl,
}

impl From<DeviceKind> for DeviceType {
    fn from(kind: DeviceKind) -> Self {
        match kind {
            DeviceKind::Cpu => DeviceType::Cpu,
            DeviceKind::Gpu => DeviceType::Gpu,
            DeviceKind::Opencl => DeviceType::OpenCl,
        }
    }
}

/// Arguments selecting a runtime build and a compiled model.
#[derive(Args)]
struct ModelArgs {
    /// Runtime id (selects libdlr_<id>)
    #[arg(short = 'r', long, default_value_t = 0)]
    runtime: u64,

    /// Compiled model directory
    #[arg(short = 'm', long)]
    model: String,

    /// Device to create the model on
    #[arg(long, value_enum, default_value_t = DeviceKind::Cpu)]
    device: DeviceKind,

    /// Device ordinal
    #[arg(long, default_value_t = 0)]
    device_id: i32,
}

impl ModelArgs {
    fn device(&self) -> Device {
        Device::new(self.device, self.device_id)
    }

    /// Creates the model, runs `f` on it and deletes it again.
    fn with_model<T>(
        &self,
        cli: &Cli,
        f: impl FnOnce(&Bridge, ModelHandle) -> anyhow::Result<T>,
    ) -> anyhow::Result<T> {
        let bridge = Bridge::with_config(get_config(cli)?);
        let handle = bridge.create_model(RuntimeId(self.runtime), &self.model, self.device())?;
        print_verbose(cli, &format!("created {} from {}", handle, self.model));

        let result = f(&bridge, handle);
        let deleted = bridge.delete_model(handle);
        let value = result?;
        deleted?;
        Ok(value)
    }
}

// ---------------------------------------------------------------------------
// info
// ---------------------------------------------------------------------------

/// Show the inputs, weights and outputs of a model.
#[derive(Args)]
pub struct InfoCommand {
    #[command(flatten)]
    model: ModelArgs,
}

impl InfoCommand {
    pub fn run(&self, cli: &Cli) -> anyhow::Result<()> {
        let info = self.model.with_model(cli, |bridge, handle| Ok(bridge.model_info(handle)?))?;
        output_result(cli, &info)
    }
}

// ---------------------------------------------------------------------------
// run
// ---------------------------------------------------------------------------

/// Run a model on the inputs of a request file.
#[derive(Args)]
pub struct RunCommand {
    #[command(flatten)]
    model: ModelArgs,
}

/// Request file for `dlr run`.
#[derive(Debug, Deserialize)]
struct RunRequest {
    inputs: Vec<InputTensor>,

    /// Thread count passed to the runtime before the run.
    #[serde(default)]
    threads: Option<i32>,

    #[serde(default)]
    cpu_affinity: Option<bool>,
}

#[derive(Debug, Deserialize)]
struct InputTensor {
    name: String,
    shape: Vec<i64>,
    data: Vec<f32>,
}

#[derive(Debug, Serialize)]
struct RunResult {
    backend: String,
    outputs: Vec<OutputTensor>,
}

#[derive(Debug, Serialize)]
struct OutputTensor {
    index: i32,
    shape: Vec<i64>,
    data: Vec<f32>,
}

impl RunCommand {
    pub fn run(&self, cli: &Cli) -> anyhow::Result<()> {
        let req: RunRequest = load_request(cli)?;
        if req.inputs.is_empty() {
            anyhow::bail!("request has no inputs");
        }

        let result = self.model.with_model(cli, |bridge, handle| run_request(cli, bridge, handle, &req))?;
        output_result(cli, &result)
    }
}

fn run_request(cli: &Cli, bridge: &Bridge, handle: ModelHandle, req: &RunRequest) -> anyhow::Result<RunResult> {
    if let Some(threads) = req.threads {
        bridge.set_num_threads(handle, threads)?;
    }
    if let Some(enabled) = req.cpu_affinity {
        bridge.use_cpu_affinity(handle, enabled)?;
    }

    for input in &req.inputs {
        let dim = i32::try_from(input.shape.len())?;
        bridge.set_input(handle, &input.name, &input.shape, &input.data, dim)?;
        print_verbose(cli, &format!("set input {} {:?}", input.name, input.shape));
    }

    bridge.run_model(handle)?;

    let count = bridge.num_outputs(handle)?;
    let mut outputs = Vec::with_capacity(count.max(0) as usize);
    for index in 0..count {
        outputs.push(OutputTensor {
            index,
            shape: bridge.output_shape(handle, index)?,
            data: bridge.output(handle, index)?,
        });
    }

    Ok(RunResult {
        backend: bridge.backend(handle)?,
        outputs,
    })
}
