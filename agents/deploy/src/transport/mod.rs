//! How artefacts reach a target and how commands run there.

mod local;
mod ssh;

use std::path::Path;

use anyhow::Result;

use crate::config::Target;

pub use local::LocalConnector;
pub use ssh::SshConnector;

/// Result of one command on a target. Output is stdout and stderr merged.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecOutput {
    pub status: i32,
    pub output: String,
}

impl ExecOutput {
    pub fn success(&self) -> bool {
        self.status == 0
    }
}

/// An open connection to one target. Blocking; callers run it off the
/// async runtime.
pub trait Transport: Send {
    /// Copy `local` to `remote`, returning the bytes written.
    fn upload(&mut self, local: &Path, remote: &str) -> Result<u64>;

    /// Run a shell command line on the target.
    fn exec(&mut self, cmd: &str) -> Result<ExecOutput>;
}

/// Opens transports to targets.
pub trait Connector: Send + Sync {
    fn connect(&self, target: &Target) -> Result<Box<dyn Transport>>;
}
