//! Runtime library path resolution.

use clap::Args;

use dlr_bridge::RuntimeId;

use super::{get_config, print_verbose, print_warning};
use crate::Cli;

/// Print the library path resolved for a runtime id.
#[derive(Args)]
pub struct PathCommand {
    /// Runtime id
    runtime: u64,
}

impl PathCommand {
    pub fn run(&self, cli: &Cli) -> anyhow::Result<()> {
        let config = get_config(cli)?;
        print_verbose(cli, &format!("library dir: {}", config.library_dir.display()));

        let path = config.library_path(RuntimeId(self.runtime))?;
        if !path.exists() {
            print_warning(&format!("{} does not exist", path.display()));
        }
        println!("{}", path.display());
        Ok(())
    }
}
