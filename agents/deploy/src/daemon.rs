//! Deploy agent as a long-running daemon on the control link.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::{info, warn};

use taskrelay::protocol::{
    FileReadResp, Heartbeat, MessageType, ProjectCreateResp, Register, StreamEvent, TaskAccepted,
    TaskAssign, TaskComplete, TaskRejected, TreeReadResp,
};
use taskrelay::scheduler::load_factor;
use taskrelay::{verify, AdmitError, Dispatch, Inbound, Outbox, Scheduler};

use crate::config::{DeployConfig, ProjectConfig};
use crate::pipeline::{Deployer, Progress, RunOptions};
use crate::transport::Connector;

const TOOL: &str = "deploy";
const BUSY: &str = "deploy agent busy";
const UNSUPPORTED: &str = "not supported by deploy agent";

/// Builds the remote connector for a project run.
pub type ConnectorFactory = Arc<dyn Fn(&ProjectConfig) -> Arc<dyn Connector> + Send + Sync>;

/// Progress lines pushed onto a channel, drained in order by one task.
struct ChannelProgress(mpsc::UnboundedSender<String>);

impl Progress for ChannelProgress {
    fn line(&self, text: &str) {
        let _ = self.0.send(text.to_string());
    }
}

fn progress_event(line: String) -> StreamEvent {
    if line.starts_with("[ERROR]") {
        StreamEvent::error(line)
    } else {
        StreamEvent::system(line)
    }
}

pub struct DeployAgent {
    agent_id: String,
    config: Arc<DeployConfig>,
    scheduler: Arc<Scheduler>,
    connectors: ConnectorFactory,
    settle: Duration,
}

impl DeployAgent {
    pub fn new(
        agent_id: impl Into<String>,
        config: DeployConfig,
        connectors: ConnectorFactory,
    ) -> Self {
        let scheduler = Arc::new(Scheduler::new(config.max_concurrent));
        Self {
            agent_id: agent_id.into(),
            config: Arc::new(config),
            scheduler,
            connectors,
            settle: verify::SETTLE_DELAY,
        }
    }

    pub fn with_settle(mut self, settle: Duration) -> Self {
        self.settle = settle;
        self
    }

    async fn assign(&self, outbox: &Outbox, task: TaskAssign) {
        let session_id = task.session_id.clone();
        info!(%session_id, project = %task.project, "received deploy task");

        // Deploys are not interruptible, so the stop token is unused.
        let _token = match self.scheduler.admit(&session_id).await {
            Ok(token) => token,
            Err(e) => {
                let reason = match e {
                    AdmitError::AtCapacity => BUSY.to_string(),
                    other => other.to_string(),
                };
                warn!(%session_id, "deploy task rejected: {}", reason);
                let rejected = TaskRejected { session_id, reason };
                if let Err(e) = outbox.send(MessageType::TaskRejected, &rejected).await {
                    warn!("task_rejected not delivered: {:#}", e);
                }
                return;
            }
        };

        let accepted = TaskAccepted {
            session_id: session_id.clone(),
        };
        if let Err(e) = outbox.send(MessageType::TaskAccepted, &accepted).await {
            warn!(%session_id, "task_accepted not delivered: {:#}", e);
        }

        let run = DeployRun {
            outbox: outbox.clone(),
            session_id,
            config: self.config.clone(),
            connectors: self.connectors.clone(),
            settle: self.settle,
        };
        let scheduler = self.scheduler.clone();
        tokio::spawn(async move {
            let result = run.execute(&task.project).await;
            scheduler.finish(&run.session_id).await;

            let complete = match result {
                Ok(()) => TaskComplete::done(&run.session_id),
                Err(e) => TaskComplete::failed(&run.session_id, format!("{:#}", e)),
            };
            info!(
                session_id = %run.session_id,
                project = %task.project,
                status = ?complete.status,
                "deploy task completed"
            );
            if let Err(e) = run.outbox.send(MessageType::TaskComplete, &complete).await {
                warn!(session_id = %run.session_id, "task_complete not delivered: {:#}", e);
            }
        });
    }

    async fn unsupported(&self, outbox: &Outbox, message: Inbound) {
        let sent = match message {
            Inbound::FileRead(req) => {
                let resp = FileReadResp {
                    request_id: req.request_id,
                    error: UNSUPPORTED.to_string(),
                    ..Default::default()
                };
                outbox.send(MessageType::FileReadResp, &resp).await
            }
            Inbound::TreeRead(req) => {
                let resp = TreeReadResp {
                    request_id: req.request_id,
                    error: UNSUPPORTED.to_string(),
                    ..Default::default()
                };
                outbox.send(MessageType::TreeReadResp, &resp).await
            }
            Inbound::ProjectCreate(req) => {
                let resp = ProjectCreateResp {
                    request_id: req.request_id,
                    success: false,
                    error: UNSUPPORTED.to_string(),
                };
                outbox.send(MessageType::ProjectCreateResp, &resp).await
            }
            _ => Ok(()),
        };
        if let Err(e) = sent {
            warn!("response not delivered: {:#}", e);
        }
    }
}

/// One accepted deploy task.
struct DeployRun {
    outbox: Outbox,
    session_id: String,
    config: Arc<DeployConfig>,
    connectors: ConnectorFactory,
    settle: Duration,
}

impl DeployRun {
    async fn emit(&self, event: StreamEvent) {
        self.outbox.emit(&self.session_id, event).await;
    }

    async fn execute(&self, project_name: &str) -> Result<()> {
        let project = match self.config.resolve(project_name) {
            Ok(project) => project.clone(),
            Err(e) => {
                self.emit(StreamEvent::error(format!("❌ {:#}", e))).await;
                return Err(e);
            }
        };
        let name = project.name.clone();
        self.emit(StreamEvent::system(format!("🚀 开始部署项目 [{}]...", name)))
            .await;

        let (tx, mut rx) = mpsc::unbounded_channel::<String>();
        let forward = {
            let outbox = self.outbox.clone();
            let session_id = self.session_id.clone();
            tokio::spawn(async move {
                while let Some(line) = rx.recv().await {
                    outbox.emit(&session_id, progress_event(line)).await;
                }
            })
        };

        let connector = (self.connectors)(&project);
        let deployer = Deployer::new(project, connector, Arc::new(ChannelProgress(tx)))
            .with_settle(self.settle);
        let result = deployer.run(&RunOptions::default()).await;
        // Last sender goes with the deployer; the forwarder then drains and exits.
        drop(deployer);
        let _ = forward.await;

        match result {
            Ok(report) => {
                info!(
                    session_id = %self.session_id,
                    artefact = ?report.artefact,
                    succeeded = report.succeeded.len(),
                    failed = report.failed.len(),
                    "deploy finished"
                );
                for (label, reason) in &report.failed {
                    warn!(session_id = %self.session_id, target = %label, "target failed: {}", reason);
                }
                self.emit(StreamEvent::system(format!("✅ 项目 [{}] 部署完成", name)))
                    .await;
                Ok(())
            }
            Err(e) => {
                self.emit(StreamEvent::error(format!("❌ 部署失败: {:#}", e)))
                    .await;
                Err(e)
            }
        }
    }
}

#[async_trait]
impl Dispatch for DeployAgent {
    async fn registration(&self) -> Register {
        Register {
            agent_id: self.agent_id.clone(),
            name: self.config.agent_name.clone(),
            workspaces: Vec::new(),
            projects: self.config.project_names(),
            tools: vec![TOOL.to_string()],
            max_concurrent: self.scheduler.capacity(),
            auth_token: self.config.auth_token.clone(),
            ..Default::default()
        }
    }

    async fn heartbeat(&self) -> Heartbeat {
        let active = self.scheduler.active_count().await;
        Heartbeat {
            agent_id: self.agent_id.clone(),
            active_sessions: active,
            load: load_factor(active, self.scheduler.capacity()),
            projects: self.config.project_names(),
            tools: vec![TOOL.to_string()],
            ..Default::default()
        }
    }

    async fn dispatch(&self, outbox: &Outbox, message: Inbound) {
        match message {
            Inbound::TaskAssign(task) => self.assign(outbox, task).await,
            Inbound::TaskStop(stop) => {
                info!(session_id = %stop.session_id, "stop deploy task ignored: deploys are not interruptible");
            }
            Inbound::FileRead(_) | Inbound::TreeRead(_) | Inbound::ProjectCreate(_) => {
                self.unsupported(outbox, message).await
            }
            Inbound::RegisterAck(_) | Inbound::HeartbeatAck => {}
        }
    }
}
