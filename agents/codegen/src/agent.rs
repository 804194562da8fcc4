//! Codegen side of the control protocol.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{info, warn};

use taskrelay::protocol::{
    FileRead, FileReadResp, Heartbeat, MessageType, ProjectCreate, ProjectCreateResp, Register,
    TaskAccepted, TaskAssign, TaskRejected, TreeRead, TreeReadResp,
};
use taskrelay::{Dispatch, Inbound, Outbox, Scheduler};

use crate::config::CodegenConfig;
use crate::executor::Executor;
use crate::pipeline::PostDeploy;
use crate::tools::Inventory;
use crate::workspace::{Workspaces, DEFAULT_TREE_DEPTH};

pub struct CodegenAgent {
    agent_id: String,
    config: Arc<CodegenConfig>,
    workspaces: Workspaces,
    scheduler: Arc<Scheduler>,
    executor: Arc<Executor>,
}

impl CodegenAgent {
    pub fn new(agent_id: impl Into<String>, config: CodegenConfig) -> Self {
        Self::with_post_deploy(agent_id, config, PostDeploy::new)
    }

    fn with_post_deploy(
        agent_id: impl Into<String>,
        config: CodegenConfig,
        post_deploy: impl FnOnce(Option<crate::config::DeployHook>) -> PostDeploy,
    ) -> Self {
        let config = Arc::new(config);
        let workspaces = Workspaces::new(config.workspaces.clone());
        let scheduler = Arc::new(Scheduler::new(config.max_concurrent));
        let executor = Arc::new(Executor::new(
            config.clone(),
            workspaces.clone(),
            scheduler.clone(),
            post_deploy(config.deploy.clone()),
        ));
        Self {
            agent_id: agent_id.into(),
            config,
            workspaces,
            scheduler,
            executor,
        }
    }

    async fn assign(&self, outbox: &Outbox, task: TaskAssign) {
        let session_id = task.session_id.clone();
        let token = match self.scheduler.admit(&session_id).await {
            Ok(token) => token,
            Err(e) => {
                warn!(%session_id, "task rejected: {}", e);
                let rejected = TaskRejected {
                    session_id,
                    reason: e.to_string(),
                };
                if let Err(e) = outbox.send(MessageType::TaskRejected, &rejected).await {
                    warn!("task_rejected not delivered: {:#}", e);
                }
                return;
            }
        };

        info!(
            %session_id,
            project = %task.project,
            tool = %task.tool,
            deploy_only = task.deploy_only,
            auto_deploy = task.auto_deploy,
            "task accepted"
        );
        let accepted = TaskAccepted {
            session_id: session_id.clone(),
        };
        if let Err(e) = outbox.send(MessageType::TaskAccepted, &accepted).await {
            warn!(%session_id, "task_accepted not delivered: {:#}", e);
        }

        let executor = self.executor.clone();
        let outbox = outbox.clone();
        tokio::spawn(async move { executor.run(outbox, task, token).await });
    }

    fn read_file(&self, outbox: &Outbox, req: FileRead) {
        let workspaces = self.workspaces.clone();
        let outbox = outbox.clone();
        tokio::spawn(async move {
            let resp = match workspaces.read_file(&req.project, &req.path).await {
                Ok(content) => FileReadResp {
                    request_id: req.request_id,
                    content,
                    ..Default::default()
                },
                Err(e) => FileReadResp {
                    request_id: req.request_id,
                    error: format!("{:#}", e),
                    ..Default::default()
                },
            };
            if let Err(e) = outbox.send(MessageType::FileReadResp, &resp).await {
                warn!("file_read_resp not delivered: {:#}", e);
            }
        });
    }

    fn read_tree(&self, outbox: &Outbox, req: TreeRead) {
        let workspaces = self.workspaces.clone();
        let outbox = outbox.clone();
        tokio::spawn(async move {
            let depth = if req.max_depth > 0 {
                req.max_depth as usize
            } else {
                DEFAULT_TREE_DEPTH
            };
            let resp = match workspaces.tree(&req.project, depth).await {
                Ok(tree) => TreeReadResp {
                    request_id: req.request_id,
                    tree: Some(tree),
                    ..Default::default()
                },
                Err(e) => TreeReadResp {
                    request_id: req.request_id,
                    error: format!("{:#}", e),
                    ..Default::default()
                },
            };
            if let Err(e) = outbox.send(MessageType::TreeReadResp, &resp).await {
                warn!("tree_read_resp not delivered: {:#}", e);
            }
        });
    }

    fn create_project(&self, outbox: &Outbox, req: ProjectCreate) {
        let workspaces = self.workspaces.clone();
        let outbox = outbox.clone();
        tokio::spawn(async move {
            let resp = match workspaces.create(&req.name).await {
                Ok(_) => ProjectCreateResp {
                    request_id: req.request_id,
                    success: true,
                    ..Default::default()
                },
                Err(e) => ProjectCreateResp {
                    request_id: req.request_id,
                    success: false,
                    error: format!("{:#}", e),
                },
            };
            if let Err(e) = outbox.send(MessageType::ProjectCreateResp, &resp).await {
                warn!("project_create_resp not delivered: {:#}", e);
            }
        });
    }
}

fn display_paths(paths: &[impl AsRef<Path>]) -> Vec<String> {
    paths
        .iter()
        .map(|p| p.as_ref().display().to_string())
        .collect()
}

#[async_trait]
impl Dispatch for CodegenAgent {
    async fn registration(&self) -> Register {
        let inventory = Inventory::scan(&self.config);
        Register {
            agent_id: self.agent_id.clone(),
            name: self.config.agent_name.clone(),
            workspaces: display_paths(&self.config.workspaces),
            projects: self.workspaces.scan(),
            models: inventory.models,
            claudecode_models: inventory.claudecode_models,
            opencode_models: inventory.opencode_models,
            tools: inventory.tools,
            max_concurrent: self.scheduler.capacity(),
            auth_token: self.config.auth_token.clone(),
        }
    }

    async fn heartbeat(&self) -> Heartbeat {
        let active = self.scheduler.active_count().await;
        let inventory = Inventory::scan(&self.config);
        Heartbeat {
            agent_id: self.agent_id.clone(),
            active_sessions: active,
            load: taskrelay::scheduler::load_factor(active, self.scheduler.capacity()),
            projects: self.workspaces.scan(),
            models: inventory.models,
            claudecode_models: inventory.claudecode_models,
            opencode_models: inventory.opencode_models,
            tools: inventory.tools,
        }
    }

    async fn dispatch(&self, outbox: &Outbox, message: Inbound) {
        match message {
            Inbound::TaskAssign(task) => self.assign(outbox, task).await,
            Inbound::TaskStop(stop) => {
                if self.scheduler.stop(&stop.session_id).await {
                    info!(session_id = %stop.session_id, "stop requested");
                } else {
                    info!(session_id = %stop.session_id, "stop for unknown session ignored");
                }
            }
            Inbound::FileRead(req) => self.read_file(outbox, req),
            Inbound::TreeRead(req) => self.read_tree(outbox, req),
            Inbound::ProjectCreate(req) => self.create_project(outbox, req),
            Inbound::RegisterAck(_) | Inbound::HeartbeatAck => {}
        }
    }
}
