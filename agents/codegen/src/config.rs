use anyhow::{bail, Context, Result};
use std::path::{Path, PathBuf};
use std::time::Duration;

use taskrelay::conf::{self, Section};
use taskrelay::verify;

/// Auto-deploy post-step settings. Present only when a deploy binary is
/// configured.
#[derive(Debug, Clone)]
pub struct DeployHook {
    pub agent_path: PathBuf,
    /// Config handed to the deploy binary. Required to run the hook.
    pub config: Option<PathBuf>,
    pub verify_url: Option<String>,
    pub verify_timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct CodegenConfig {
    pub server_url: String,
    pub agent_name: String,
    pub auth_token: String,
    pub workspaces: Vec<PathBuf>,
    pub claude_path: String,
    pub opencode_path: String,
    pub max_concurrent: usize,
    /// Default turn limit when a task does not set one
    pub max_turns: u64,
    pub claudecode_settings_dir: PathBuf,
    pub opencode_settings_dir: PathBuf,
    pub deploy: Option<DeployHook>,
}

fn default_max_concurrent() -> u64 {
    3
}

fn default_max_turns() -> u64 {
    20
}

impl CodegenConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let doc = conf::load(path)?;
        let config_dir = path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        let cwd = std::env::current_dir().context("Failed to read current directory")?;
        Self::from_section(&doc.flatten(), &cwd.join(config_dir), &cwd)
    }

    /// Build from parsed keys. Settings directories default under
    /// `config_dir`; every other relative path is taken against `cwd`.
    pub fn from_section(keys: &Section, config_dir: &Path, cwd: &Path) -> Result<Self> {
        let Some(server_url) = keys.value("server_url") else {
            bail!("server_url is required");
        };

        let workspaces: Vec<PathBuf> = keys
            .value("workspaces")
            .map(conf::split_list)
            .unwrap_or_default()
            .iter()
            .map(|ws| conf::absolutize(ws, cwd))
            .collect();
        if workspaces.is_empty() {
            bail!("workspaces is required");
        }

        let agent_name = keys
            .value("agent_name")
            .map(str::to_string)
            .or_else(conf::hostname)
            .unwrap_or_else(|| "codegen-agent".to_string());

        let settings_dir = |key: &str, tool: &str| match keys.value(key) {
            Some(dir) => conf::absolutize(dir, cwd),
            None => config_dir.join("settings").join(tool),
        };

        let deploy = keys.value("deploy_agent_path").map(|agent_path| DeployHook {
            agent_path: conf::absolutize(agent_path, cwd),
            config: keys
                .value("deploy_agent_config")
                .map(|c| conf::absolutize(c, cwd)),
            verify_url: keys.value("verify_url").map(str::to_string),
            verify_timeout: Duration::from_secs(conf::positive_or(
                keys.get("verify_timeout"),
                verify::DEFAULT_TIMEOUT.as_secs(),
            )),
        });

        Ok(Self {
            server_url: server_url.to_string(),
            agent_name,
            auth_token: keys.get("auth_token").unwrap_or_default().to_string(),
            workspaces,
            claude_path: keys.value("claude_path").unwrap_or("claude").to_string(),
            opencode_path: keys.value("opencode_path").unwrap_or("opencode").to_string(),
            max_concurrent: conf::positive_or(keys.get("max_concurrent"), default_max_concurrent())
                as usize,
            max_turns: conf::positive_or(keys.get("max_turns"), default_max_turns()),
            claudecode_settings_dir: settings_dir("claudecode_settings_dir", "claudecode"),
            opencode_settings_dir: settings_dir("opencode_settings_dir", "opencode"),
            deploy,
        })
    }
}
