use std::path::Path;
use std::process::Command;

use anyhow::{Context, Result};

use super::{Connector, ExecOutput, Transport};
use crate::config::Target;

/// Targets on this machine: upload is a copy, commands run under bash.
pub struct LocalConnector;

impl Connector for LocalConnector {
    fn connect(&self, _target: &Target) -> Result<Box<dyn Transport>> {
        Ok(Box::new(LocalTransport))
    }
}

pub struct LocalTransport;

impl Transport for LocalTransport {
    fn upload(&mut self, local: &Path, remote: &str) -> Result<u64> {
        let remote = Path::new(remote);
        if let Some(dir) = remote.parent() {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("create dir {}", dir.display()))?;
        }

        let same = match (local.canonicalize(), remote.canonicalize()) {
            (Ok(a), Ok(b)) => a == b,
            _ => false,
        };
        if same {
            return Ok(std::fs::metadata(local)?.len());
        }
        std::fs::copy(local, remote)
            .with_context(|| format!("copy to {}", remote.display()))
    }

    fn exec(&mut self, cmd: &str) -> Result<ExecOutput> {
        let output = Command::new("bash")
            .arg("-c")
            .arg(cmd)
            .output()
            .context("Failed to execute bash")?;

        let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
        text.push_str(&String::from_utf8_lossy(&output.stderr));
        Ok(ExecOutput {
            status: output.status.code().unwrap_or(-1),
            output: text,
        })
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_upload_copies_and_creates_dir() {
        let tmp = tempfile::tempdir().unwrap();
        let src = tmp.path().join("app_1.zip");
        std::fs::write(&src, b"zipdata").unwrap();
        let dest = tmp.path().join("srv/app/app_1.zip");

        let written = LocalTransport
            .upload(&src, &dest.display().to_string())
            .unwrap();
        assert_eq!(written, 7);
        assert_eq!(std::fs::read(&dest).unwrap(), b"zipdata");

        // Same file on both sides is left alone.
        let written = LocalTransport
            .upload(&src, &src.display().to_string())
            .unwrap();
        assert_eq!(written, 7);
        assert_eq!(std::fs::read(&src).unwrap(), b"zipdata");
    }

    #[test]
    fn test_exec_merges_output_and_status() {
        let out = LocalTransport.exec("echo out; echo err >&2; exit 3").unwrap();
        assert_eq!(out.status, 3);
        assert!(!out.success());
        assert_eq!(out.output, "out\nerr\n");
    }
}
