mod config;
mod credential;
mod crypto;
mod daemon;
mod pipeline;
mod transport;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{info, warn};

use taskrelay::{link, logging, process, Link, LinkConfig};

use config::{DeployConfig, ProjectConfig};
use credential::CredentialStore;
use daemon::{ConnectorFactory, DeployAgent};
use pipeline::{Deployer, RunOptions, StdoutProgress};
use transport::{Connector, SshConnector};

#[derive(Parser)]
#[command(
    name = "deploy-agent",
    about = "Pack a project and deploy it to its targets",
    version
)]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "deploy.conf")]
    config: PathBuf,

    /// Project to deploy (defaults to the only project)
    #[arg(long)]
    project: Option<String>,

    /// Only deploy the target with this name or host
    #[arg(long)]
    target: Option<String>,

    /// Pack without deploying
    #[arg(long)]
    pack_only: bool,

    /// SSH password
    #[arg(long)]
    password: Option<String>,

    /// Save the password once an SSH connection with it succeeded
    #[arg(long)]
    save_password: bool,

    /// List configured projects and exit
    #[arg(long)]
    list: bool,

    /// Run one deploy and exit even when server_url is configured
    #[arg(long)]
    once: bool,
}

impl Cli {
    fn one_shot(&self) -> bool {
        self.once || self.pack_only || self.project.is_some() || self.target.is_some()
    }
}

/// SSH password for `project`: the flag, then the config file, then the
/// credential store, then (when `interactive`) a prompt.
fn resolve_password(
    flag: Option<&str>,
    config: &DeployConfig,
    store: Option<&CredentialStore>,
    project: &ProjectConfig,
    interactive: bool,
) -> String {
    if let Some(pw) = flag.filter(|p| !p.is_empty()) {
        return pw.to_string();
    }
    if let Some(pw) = &config.ssh_password {
        return pw.clone();
    }
    let Some(target) = project.targets.iter().find(|t| !t.is_local()) else {
        return String::new();
    };
    let account = target.account();
    if let Some(store) = store {
        match store.get(&account) {
            Ok(pw) => {
                info!(%account, "using saved password");
                return pw;
            }
            Err(e) => info!(%account, "{}", e),
        }
    }
    if !interactive || project.ssh_key.is_some() {
        return String::new();
    }
    match rpassword::prompt_password("SSH 密码: ") {
        Ok(pw) => pw,
        Err(e) => {
            warn!("password prompt failed: {}", e);
            String::new()
        }
    }
}

fn print_projects(config: &DeployConfig) {
    if let Some(dir) = &config.settings_dir {
        println!("settings_dir: {}", dir.display());
    }
    for project in &config.projects {
        println!("[{}] {}", project.name, project.source.display());
        println!("  项目目录: {}", project.project_dir.display());
        println!("  打包脚本: {}", project.pack_script.display());
        println!("  部署目标: {} 个", project.targets.len());
        for t in &project.targets {
            println!("    - {} ({}:{}) -> {}", t.name, t.host, t.port, t.remote_dir);
        }
        if let Some(url) = &project.verify_url {
            println!("  验证地址: {}", url);
        }
    }
}

async fn run_once(cli: &Cli, config: &DeployConfig, store: Option<&CredentialStore>) -> Result<()> {
    let project = config.resolve(cli.project.as_deref().unwrap_or(""))?;
    println!("项目: {}", project.name);
    println!("项目目录: {}", project.project_dir.display());
    println!("打包脚本: {}", project.pack_script.display());
    println!("部署目标: {} 个", project.targets.len());
    for t in &project.targets {
        println!("  - {} ({}) -> {}", t.name, t.host, t.remote_dir);
    }
    println!();

    let password = if cli.pack_only {
        String::new()
    } else {
        resolve_password(cli.password.as_deref(), config, store, project, true)
    };
    let ssh = Arc::new(SshConnector::new(project.ssh_key.clone(), password.clone()));
    let deployer = Deployer::new(project.clone(), ssh.clone(), Arc::new(StdoutProgress));
    let result = deployer
        .run(&RunOptions {
            pack_only: cli.pack_only,
            target: cli.target.clone(),
        })
        .await;

    if cli.save_password && !password.is_empty() && ssh.connected() {
        save_password(store, project, &password);
    }
    result.map(|_| ())
}

fn save_password(store: Option<&CredentialStore>, project: &ProjectConfig, password: &str) {
    let Some(store) = store else {
        eprintln!("保存密码失败: 凭据存储不可用");
        return;
    };
    for target in project.targets.iter().filter(|t| !t.is_local()) {
        let account = target.account();
        match store.set(&account, password) {
            Ok(()) => println!("密码已保存 ({})", account),
            Err(e) => eprintln!("保存密码失败 ({}): {}", account, e),
        }
    }
}

async fn run_daemon(
    config: DeployConfig,
    server_url: String,
    flag: Option<&str>,
    store: Option<&CredentialStore>,
) -> Result<()> {
    let passwords: HashMap<String, String> = config
        .projects
        .iter()
        .map(|p| (p.name.clone(), resolve_password(flag, &config, store, p, false)))
        .collect();
    let connectors: ConnectorFactory = Arc::new(move |project: &ProjectConfig| {
        let password = passwords.get(&project.name).cloned().unwrap_or_default();
        let connector: Arc<dyn Connector> =
            Arc::new(SshConnector::new(project.ssh_key.clone(), password));
        connector
    });

    let agent_id = link::new_agent_id("deploy");
    info!(
        %agent_id,
        name = %config.agent_name,
        server = %server_url,
        projects = ?config.project_names(),
        max_concurrent = config.max_concurrent,
        "deploy agent starting in daemon mode"
    );
    let link = Arc::new(Link::new(LinkConfig::new(
        server_url,
        config.auth_token.clone(),
    )));
    let agent = Arc::new(DeployAgent::new(agent_id, config, connectors));

    {
        let link = link.clone();
        tokio::spawn(async move {
            process::shutdown_signal().await;
            link.stop();
        });
    }
    link.run(agent).await?;
    info!("deploy agent stopped");
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    logging::init();
    let cli = Cli::parse();

    let config = DeployConfig::load(&cli.config)
        .with_context(|| format!("加载配置失败: {}", cli.config.display()))?;
    if cli.list {
        print_projects(&config);
        return Ok(());
    }

    let store = match CredentialStore::system() {
        Ok(store) => Some(store),
        Err(e) => {
            warn!("credential store unavailable: {:#}", e);
            None
        }
    };

    match config.server_url.clone() {
        Some(server_url) if !cli.one_shot() => {
            run_daemon(config, server_url, cli.password.as_deref(), store.as_ref()).await
        }
        _ => run_once(&cli, &config, store.as_ref()).await,
    }
}
