//! Deploy configuration: globals plus one or more projects.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};

use taskrelay::conf::{self, Document, Section};
use taskrelay::verify;

pub const DEFAULT_SSH_PORT: u16 = 22;
const LEGACY_PROJECT: &str = "default";

/// One deployment destination.
#[derive(Debug, Clone, PartialEq)]
pub struct Target {
    pub name: String,
    /// `user@host`, or a bare host meaning `root`.
    pub host: String,
    pub port: u16,
    pub remote_dir: String,
    pub remote_script: Option<String>,
}

impl Target {
    fn named(name: &str) -> Self {
        Self {
            name: name.to_string(),
            host: String::new(),
            port: DEFAULT_SSH_PORT,
            remote_dir: String::new(),
            remote_script: None,
        }
    }

    /// Split `host` into user and host name.
    pub fn user_host(&self) -> (&str, &str) {
        match self.host.split_once('@') {
            Some((user, host)) => (user, host),
            None => ("root", self.host.as_str()),
        }
    }

    /// Deployed with local file operations instead of SSH.
    pub fn is_local(&self) -> bool {
        let (_, host) = self.user_host();
        matches!(
            host.to_ascii_lowercase().as_str(),
            "local" | "localhost" | "127.0.0.1" | "::1"
        )
    }

    /// Key the SSH password is stored under: `user@host:port`.
    pub fn account(&self) -> String {
        let (user, host) = self.user_host();
        format!("{}@{}:{}", user, host, self.port)
    }

    /// Name shown in progress output.
    pub fn label(&self) -> String {
        if self.name.starts_with("default-") {
            self.host.clone()
        } else {
            format!("{} ({})", self.name, self.host)
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ProjectConfig {
    pub name: String,
    pub project_dir: PathBuf,
    pub pack_script: PathBuf,
    /// Artefact file name; `{date}` matches any text.
    pub pack_pattern: String,
    pub targets: Vec<Target>,
    pub ssh_key: Option<PathBuf>,
    pub verify_url: Option<String>,
    pub verify_timeout: Duration,
    /// File the project was read from.
    pub source: PathBuf,
}

impl ProjectConfig {
    fn from_section(name: &str, keys: &Section, source: &Path, cwd: &Path) -> Result<Self> {
        let mut simple_port = DEFAULT_SSH_PORT;
        let mut named: Vec<Target> = Vec::new();

        for (key, value) in keys.iter() {
            if key == "ssh_port" {
                simple_port = port_or(Some(value), simple_port);
                continue;
            }
            let Some(rest) = key.strip_prefix("target.") else {
                continue;
            };
            let Some((tname, field)) = rest.split_once('.') else {
                continue;
            };
            let idx = match named.iter().position(|t| t.name == tname) {
                Some(idx) => idx,
                None => {
                    named.push(Target::named(tname));
                    named.len() - 1
                }
            };
            let target = &mut named[idx];
            match field {
                "host" => target.host = value.to_string(),
                "port" => target.port = port_or(Some(value), target.port),
                "remote_dir" => target.remote_dir = value.to_string(),
                "remote_script" => {
                    target.remote_script = Some(value.to_string()).filter(|s| !s.is_empty())
                }
                _ => {}
            }
        }

        let targets = if !named.is_empty() {
            if let Some(t) = named.iter().find(|t| t.host.is_empty()) {
                bail!("target.{}.host is required", t.name);
            }
            named
        } else {
            let remote_dir = keys.get("remote_dir").unwrap_or_default();
            let remote_script = keys.value("remote_script").map(str::to_string);
            keys.value("targets")
                .map(conf::split_list)
                .unwrap_or_default()
                .into_iter()
                .enumerate()
                .map(|(i, host)| Target {
                    name: format!("default-{}", i),
                    host,
                    port: simple_port,
                    remote_dir: remote_dir.to_string(),
                    remote_script: remote_script.clone(),
                })
                .collect()
        };

        let Some(dir) = keys.value("project_dir") else {
            bail!("project_dir is required");
        };
        let project_dir = conf::absolutize(dir, cwd);
        if !project_dir.is_dir() {
            bail!(
                "project_dir does not exist or is not a directory: {}",
                project_dir.display()
            );
        }
        if targets.is_empty() {
            bail!("at least one deploy target is required");
        }

        let pack_script = match keys.value("pack_script") {
            Some(script) => conf::absolutize(script, &project_dir),
            None => project_dir.join(default_pack_script()),
        };

        Ok(Self {
            name: name.to_string(),
            project_dir,
            pack_script,
            pack_pattern: keys
                .value("pack_pattern")
                .map(str::to_string)
                .unwrap_or_else(|| format!("{}_{{date}}.zip", name)),
            targets,
            ssh_key: keys.value("ssh_key").map(|k| conf::absolutize(k, cwd)),
            verify_url: keys.value("verify_url").map(str::to_string),
            verify_timeout: Duration::from_secs(conf::positive_or(
                keys.get("verify_timeout"),
                verify::DEFAULT_TIMEOUT.as_secs(),
            )),
            source: source.to_path_buf(),
        })
    }

    /// Targets selected by `filter` (a name or a host); all when unset.
    pub fn select_targets(&self, filter: Option<&str>) -> Result<Vec<Target>> {
        let Some(filter) = filter.filter(|f| !f.is_empty()) else {
            return Ok(self.targets.clone());
        };
        self.targets
            .iter()
            .find(|t| t.name == filter || t.host == filter)
            .map(|t| vec![t.clone()])
            .ok_or_else(|| anyhow!("target {:?} not found", filter))
    }
}

fn default_pack_script() -> &'static str {
    if cfg!(windows) {
        "pack.bat"
    } else {
        "pack.sh"
    }
}

fn port_or(value: Option<&str>, default: u16) -> u16 {
    u16::try_from(conf::positive_or(value, default as u64)).unwrap_or(default)
}

#[derive(Debug, Clone)]
pub struct DeployConfig {
    pub server_url: Option<String>,
    pub agent_name: String,
    pub auth_token: String,
    pub max_concurrent: usize,
    pub ssh_password: Option<String>,
    pub settings_dir: Option<PathBuf>,
    /// Projects in declaration order: inline sections first, then
    /// `settings_dir` files sorted by name.
    pub projects: Vec<ProjectConfig>,
}

impl DeployConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let doc = conf::load(path)?;
        let cwd = std::env::current_dir().context("Failed to read current directory")?;
        Self::from_document(&doc, path, &cwd)
    }

    pub fn from_document(doc: &Document, path: &Path, cwd: &Path) -> Result<Self> {
        let globals = &doc.globals;

        let mut sections: Vec<(String, Section)> = doc.sections.clone();
        if sections.is_empty() && (globals.has("project_dir") || globals.has("targets")) {
            sections.push((LEGACY_PROJECT.to_string(), globals.clone()));
        }

        let global_key = globals.value("ssh_key").map(|k| conf::absolutize(k, cwd));
        let mut projects: Vec<ProjectConfig> = Vec::new();
        for (name, section) in &sections {
            let project = ProjectConfig::from_section(name, section, path, cwd)
                .with_context(|| format!("project [{}]", name))?;
            projects.push(project);
        }

        let config_dir = path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .map(|p| conf::absolutize(&p.to_string_lossy(), cwd))
            .unwrap_or_else(|| cwd.to_path_buf());
        let settings_dir = globals
            .value("settings_dir")
            .map(|d| conf::absolutize(d, &config_dir));
        if let Some(dir) = &settings_dir {
            load_settings_dir(dir, cwd, &mut projects)
                .with_context(|| format!("load settings_dir {}", dir.display()))?;
        }

        if projects.is_empty() {
            bail!("no projects found (check settings_dir or [project] sections)");
        }
        for project in &mut projects {
            if project.ssh_key.is_none() {
                project.ssh_key = global_key.clone();
            }
        }

        let agent_name = globals
            .value("agent_name")
            .map(str::to_string)
            .or_else(|| conf::hostname().map(|h| format!("{}-deploy", h)))
            .unwrap_or_else(|| "deploy-agent".to_string());

        Ok(Self {
            server_url: globals.value("server_url").map(str::to_string),
            agent_name,
            auth_token: globals.get("auth_token").unwrap_or_default().to_string(),
            max_concurrent: conf::positive_or(globals.get("max_concurrent"), 1) as usize,
            ssh_password: globals.value("ssh_password").map(str::to_string),
            settings_dir,
            projects,
        })
    }

    pub fn project(&self, name: &str) -> Option<&ProjectConfig> {
        self.projects.iter().find(|p| p.name == name)
    }

    pub fn project_names(&self) -> Vec<String> {
        self.projects.iter().map(|p| p.name.clone()).collect()
    }

    /// The named project, or the only project when `name` is empty.
    pub fn resolve(&self, name: &str) -> Result<&ProjectConfig> {
        if !name.is_empty() {
            return self.project(name).ok_or_else(|| {
                anyhow!(
                    "project {:?} not found, available: {:?}",
                    name,
                    self.project_names()
                )
            });
        }
        match self.projects.as_slice() {
            [only] => Ok(only),
            _ => bail!(
                "project name required, available: {:?}",
                self.project_names()
            ),
        }
    }
}

/// Each `*.conf` file in `dir` is one project named after the file.
fn load_settings_dir(dir: &Path, cwd: &Path, projects: &mut Vec<ProjectConfig>) -> Result<()> {
    let mut files: Vec<PathBuf> = std::fs::read_dir(dir)
        .context("read dir")?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| path.is_file())
        .filter(|path| {
            path.extension()
                .map(|ext| ext.eq_ignore_ascii_case("conf"))
                .unwrap_or(false)
        })
        .collect();
    files.sort();

    for file in files {
        let Some(name) = file.file_stem().map(|s| s.to_string_lossy().into_owned()) else {
            continue;
        };
        if projects.iter().any(|p| p.name == name) {
            bail!(
                "duplicate project [{}]: already defined, conflicts with settings file {}",
                name,
                file.display()
            );
        }
        let doc = conf::load(&file)?;
        let project = ProjectConfig::from_section(&name, &doc.flatten(), &file, cwd)
            .with_context(|| format!("settings {}", file.display()))?;
        projects.push(project);
    }
    Ok(())
}
