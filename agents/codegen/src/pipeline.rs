//! Auto-deploy post-step: run the deploy agent once, then verify.

use std::process::Stdio;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use tokio::io::AsyncRead;
use tokio::process::Command;
use tokio::task::JoinHandle;

use taskrelay::process::{BoundedLines, DEPLOY_LINE_MAX};
use taskrelay::protocol::StreamEvent;
use taskrelay::{verify, Outbox};

use crate::config::DeployHook;

/// How long output readers may lag behind the deploy agent's exit. A
/// background process holding the pipes open never lets them finish.
const OUTPUT_DRAIN: Duration = Duration::from_secs(2);

pub struct PostDeploy {
    hook: Option<DeployHook>,
    settle: Duration,
}

impl PostDeploy {
    pub fn new(hook: Option<DeployHook>) -> Self {
        Self {
            hook,
            settle: verify::SETTLE_DELAY,
        }
    }

    pub fn with_settle(mut self, settle: Duration) -> Self {
        self.settle = settle;
        self
    }

    pub async fn run(&self, outbox: &Outbox, session_id: &str) -> Result<()> {
        let Some(hook) = &self.hook else {
            bail!("auto deploy not configured: deploy_agent_path is not set");
        };
        let Some(config) = &hook.config else {
            bail!("auto deploy not configured: deploy_agent_config is not set");
        };

        outbox
            .emit(session_id, StreamEvent::system("🚀 开始自动部署..."))
            .await;

        if let Err(e) = self.deploy(hook, config, outbox, session_id).await {
            outbox
                .emit(session_id, StreamEvent::error(format!("❌ 部署失败: {:#}", e)))
                .await;
            return Err(e);
        }
        outbox
            .emit(session_id, StreamEvent::system("✅ 部署完成"))
            .await;

        let Some(url) = &hook.verify_url else {
            return Ok(());
        };
        outbox
            .emit(
                session_id,
                StreamEvent::system(format!("⏳ 等待服务启动 ({}s)...", self.settle.as_secs())),
            )
            .await;
        tokio::time::sleep(self.settle).await;

        if let Err(e) = verify::check(url, hook.verify_timeout).await {
            outbox
                .emit(session_id, StreamEvent::error(format!("❌ 验证失败: {:#}", e)))
                .await;
            return Err(e);
        }
        outbox
            .emit(session_id, StreamEvent::system("✅ 部署验证通过（HTTP 200）"))
            .await;
        Ok(())
    }

    async fn deploy(
        &self,
        hook: &DeployHook,
        config: &std::path::Path,
        outbox: &Outbox,
        session_id: &str,
    ) -> Result<()> {
        tracing::info!(
            %session_id,
            agent = %hook.agent_path.display(),
            config = %config.display(),
            "running deploy agent"
        );

        let mut child = Command::new(&hook.agent_path)
            .arg("--config")
            .arg(config)
            .arg("--once")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("start {}", hook.agent_path.display()))?;

        let stdout = child.stdout.take().context("stdout pipe")?;
        let stderr = child.stderr.take().context("stderr pipe")?;

        let out_task = forward(stdout, "📦 ", outbox, session_id);
        let err_task = forward(stderr, "⚠️ ", outbox, session_id);

        let status = child.wait().await.context("wait for deploy agent")?;
        drain(out_task).await;
        drain(err_task).await;

        if !status.success() {
            return Err(anyhow!("deploy-agent exit: {}", status));
        }
        Ok(())
    }
}

async fn drain(mut task: JoinHandle<()>) {
    if tokio::time::timeout(OUTPUT_DRAIN, &mut task).await.is_err() {
        tracing::warn!("deploy agent output still open after exit, detaching reader");
        task.abort();
        let _ = task.await;
    }
}

/// Relay each line of a deploy agent pipe as a system event.
fn forward<R>(reader: R, prefix: &'static str, outbox: &Outbox, session_id: &str) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let outbox = outbox.clone();
    let session_id = session_id.to_string();
    tokio::spawn(async move {
        let mut lines = BoundedLines::new(reader, DEPLOY_LINE_MAX);
        while let Some(line) = lines.next_line().await {
            tracing::debug!(%session_id, "deploy: {}", line);
            outbox
                .emit(&session_id, StreamEvent::system(format!("{}{}", prefix, line)))
                .await;
        }
    })
}
