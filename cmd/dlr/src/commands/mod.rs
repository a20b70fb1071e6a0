//! CLI commands module.

mod model;
mod path;
mod util;

pub use model::{InfoCommand, RunCommand};
pub use path::PathCommand;

pub(crate) use util::*;
