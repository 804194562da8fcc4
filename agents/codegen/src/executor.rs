//! Runs one coding task: child CLI, output translation, completion.

use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use taskrelay::process::{BoundedLines, CODEGEN_LINE_MAX};
use taskrelay::protocol::{MessageType, StreamEvent, TaskAssign, TaskComplete};
use taskrelay::{Outbox, Scheduler};

use crate::config::CodegenConfig;
use crate::pipeline::PostDeploy;
use crate::summary::TaskSummary;
use crate::tools::CodingTool;
use crate::workspace::Workspaces;

/// How long to wait for the stderr reader once the child has exited.
const STDERR_DRAIN: Duration = Duration::from_secs(2);

pub struct Executor {
    config: Arc<CodegenConfig>,
    workspaces: Workspaces,
    scheduler: Arc<Scheduler>,
    post_deploy: PostDeploy,
}

impl Executor {
    pub fn new(
        config: Arc<CodegenConfig>,
        workspaces: Workspaces,
        scheduler: Arc<Scheduler>,
        post_deploy: PostDeploy,
    ) -> Self {
        Self {
            config,
            workspaces,
            scheduler,
            post_deploy,
        }
    }

    /// Drive an admitted task to completion. The slot is released before
    /// `task_complete` goes out, and nothing about the session is sent
    /// after it.
    pub async fn run(&self, outbox: Outbox, task: TaskAssign, cancel: CancellationToken) {
        let session_id = task.session_id.clone();
        let result = self.execute(&outbox, &task, &cancel).await;
        self.scheduler.finish(&session_id).await;

        let complete = match result {
            Ok(()) => TaskComplete::done(&session_id),
            Err(e) => TaskComplete::failed(&session_id, format!("{:#}", e)),
        };
        info!(%session_id, status = ?complete.status, error = %complete.error, "task completed");
        if let Err(e) = outbox.send(MessageType::TaskComplete, &complete).await {
            warn!(%session_id, "task_complete not delivered: {:#}", e);
        }
    }

    async fn execute(
        &self,
        outbox: &Outbox,
        task: &TaskAssign,
        cancel: &CancellationToken,
    ) -> Result<()> {
        if task.deploy_only {
            return self.post_deploy.run(outbox, &task.session_id).await;
        }
        self.code(outbox, task, cancel).await?;
        if task.auto_deploy {
            self.post_deploy.run(outbox, &task.session_id).await?;
        }
        Ok(())
    }

    async fn code(
        &self,
        outbox: &Outbox,
        task: &TaskAssign,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let session_id = task.session_id.as_str();
        let tool = CodingTool::from_task(&task.tool);
        let project = self.workspaces.resolve(&task.project).await?;
        if cancel.is_cancelled() {
            bail!("task stopped before start");
        }

        let program = tool.program(&self.config);
        let args = tool.args(task, &self.config);
        info!(
            %session_id,
            tool = tool.id(),
            model = %task.model,
            dir = %project.display(),
            "executing {} {}",
            program,
            args.join(" ")
        );

        let mut child = Command::new(program)
            .args(&args)
            .current_dir(&project)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("start {}", tool.label()))?;
        let stdout = child.stdout.take().context("stdout pipe")?;
        let stderr = child.stderr.take().context("stderr pipe")?;

        outbox
            .emit(
                session_id,
                StreamEvent::system(format!(
                    "🔧 {} 开始编码... (项目: {}, Agent: {})",
                    tool.label(),
                    task.project,
                    self.config.agent_name
                )),
            )
            .await;

        let mut stderr_task = {
            let outbox = outbox.clone();
            let session_id = session_id.to_string();
            tokio::spawn(async move {
                let mut lines = BoundedLines::new(stderr, CODEGEN_LINE_MAX);
                while let Some(line) = lines.next_line().await {
                    debug!(%session_id, "stderr: {}", line);
                    if let Some(event) = tool.parse_stderr(&line) {
                        outbox.emit(&session_id, event).await;
                    }
                }
            })
        };

        let mut summary = TaskSummary::default();
        let mut lines = BoundedLines::new(stdout, CODEGEN_LINE_MAX);
        let mut stopped = false;
        loop {
            let line = tokio::select! {
                _ = cancel.cancelled() => {
                    info!(%session_id, "killing task");
                    if let Err(e) = child.start_kill() {
                        warn!(%session_id, "kill failed: {}", e);
                    }
                    stopped = true;
                    break;
                }
                line = lines.next_line() => line,
            };
            let Some(line) = line else { break };
            if line.trim().is_empty() {
                continue;
            }
            match tool.parse_stdout(&line) {
                Some(event) => {
                    summary.update(&event);
                    outbox.emit(session_id, event).await;
                }
                None => debug!(%session_id, "no event for line"),
            }
        }

        let status = child.wait().await.context("wait for child")?;
        if tokio::time::timeout(STDERR_DRAIN, &mut stderr_task)
            .await
            .is_err()
        {
            stderr_task.abort();
            let _ = stderr_task.await;
        }

        if stopped {
            bail!("task stopped: {} killed ({})", tool.label(), status);
        }
        if !status.success() {
            bail!("{} exited with {}", tool.label(), status);
        }
        info!(%session_id, "{}", summary.report());
        Ok(())
    }
}
