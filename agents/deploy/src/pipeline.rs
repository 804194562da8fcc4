//! Pack, then upload, unpack and release per target, then verify.
//!
//! Every step is reported as one progress line. `[STEP k/N]` opens a step,
//! `[ERROR]`, `[OK]` and `[DONE]` close them. A failing target is reported
//! and the next one is attempted; the run fails only when no target
//! succeeded or verification failed.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use anyhow::{anyhow, bail, Context, Result};
use tokio::process::Command;

use taskrelay::process::{self, BoundedLines, DEPLOY_LINE_MAX};
use taskrelay::verify;

use crate::config::{ProjectConfig, Target};
use crate::transport::{Connector, LocalConnector, Transport};

/// Where progress lines go: stdout for the CLI, stream events for the daemon.
pub trait Progress: Send + Sync {
    fn line(&self, text: &str);
}

pub struct StdoutProgress;

impl Progress for StdoutProgress {
    fn line(&self, text: &str) {
        println!("{}", text);
    }
}

#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    pub pack_only: bool,
    /// Only the target with this name or host.
    pub target: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Artefact {
    pub path: PathBuf,
    pub name: String,
    pub size: u64,
}

#[derive(Debug, Default)]
pub struct DeployReport {
    pub artefact: Option<String>,
    pub succeeded: Vec<String>,
    /// Target label and the reason it failed.
    pub failed: Vec<(String, String)>,
}

pub struct Deployer {
    project: ProjectConfig,
    remote: Arc<dyn Connector>,
    local: Arc<dyn Connector>,
    progress: Arc<dyn Progress>,
    settle: Duration,
}

impl Deployer {
    pub fn new(
        project: ProjectConfig,
        remote: Arc<dyn Connector>,
        progress: Arc<dyn Progress>,
    ) -> Self {
        Self {
            project,
            remote,
            local: Arc::new(LocalConnector),
            progress,
            settle: verify::SETTLE_DELAY,
        }
    }

    pub fn with_settle(mut self, settle: Duration) -> Self {
        self.settle = settle;
        self
    }

    fn say(&self, text: impl AsRef<str>) {
        self.progress.line(text.as_ref());
    }

    pub async fn run(&self, opts: &RunOptions) -> Result<DeployReport> {
        let start = Instant::now();
        let targets = self.project.select_targets(opts.target.as_deref())?;
        let total = if opts.pack_only { 1 } else { 4 };
        let mut report = DeployReport::default();

        self.say(format!(
            "[STEP 1/{}] 打包项目 [{}]...",
            total, self.project.name
        ));
        let artefact = match self.pack().await {
            Ok(artefact) => artefact,
            Err(e) => {
                self.say(format!("[ERROR] 打包失败: {:#}", e));
                return Err(e.context("打包失败"));
            }
        };
        self.say(format!(
            "[STEP 1/{}] 打包完成: {} ({})",
            total,
            artefact.name,
            format_size(artefact.size)
        ));
        report.artefact = Some(artefact.name.clone());

        if opts.pack_only {
            self.say(format!(
                "[DONE] 打包完成，耗时 {}",
                format_duration(start.elapsed())
            ));
            return Ok(report);
        }

        for target in &targets {
            let label = target.label();
            match self.deploy_target(target, &artefact, total).await {
                Ok(()) => {
                    self.say(format!("[OK] {} 部署成功", label));
                    report.succeeded.push(label);
                }
                Err(e) => {
                    self.say(format!("[ERROR] {}: {:#}", label, e));
                    report.failed.push((label, format!("{:#}", e)));
                }
            }
        }

        if report.succeeded.is_empty() {
            let reasons: Vec<String> = report
                .failed
                .iter()
                .map(|(label, reason)| format!("[{}] {}", label, reason))
                .collect();
            bail!("部署失败: {}", reasons.join("; "));
        }

        if let Some(url) = &self.project.verify_url {
            self.say(format!("⏳ 等待服务启动 ({}s)...", self.settle.as_secs()));
            tokio::time::sleep(self.settle).await;
            if let Err(e) = verify::check(url, self.project.verify_timeout).await {
                self.say(format!("[ERROR] 验证失败: {:#}", e));
                return Err(anyhow!("部署验证失败: {:#}", e));
            }
            self.say("[OK] 部署验证通过（HTTP 200）");
        }

        self.say(format!(
            "[DONE] {}/{} 目标成功，耗时 {}",
            report.succeeded.len(),
            targets.len(),
            format_duration(start.elapsed())
        ));
        Ok(report)
    }

    /// Run the pack script and pick up the newest matching artefact.
    async fn pack(&self) -> Result<Artefact> {
        let project_dir = &self.project.project_dir;
        let (program, args) = pack_command(&self.project.pack_script);
        self.say(format!("  > {} {}", program, args.join(" ")));
        let started = Instant::now();

        let mut child = Command::new(program)
            .args(&args)
            .current_dir(project_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("Failed to execute {}", program))?;
        let stdout = child.stdout.take().context("stdout pipe")?;
        let stderr = child.stderr.take().context("stderr pipe")?;

        let stderr_task = {
            let progress = self.progress.clone();
            tokio::spawn(async move {
                let mut lines = BoundedLines::new(stderr, DEPLOY_LINE_MAX);
                while let Some(line) = lines.next_line().await {
                    progress.line(&format!("  {}", line));
                }
            })
        };
        let mut lines = BoundedLines::new(stdout, DEPLOY_LINE_MAX);
        while let Some(line) = lines.next_line().await {
            self.say(format!("  {}", line));
        }
        let status = child.wait().await.context("wait for pack script")?;
        let _ = stderr_task.await;

        if !status.success() {
            bail!(
                "{} failed ({}): {}",
                program,
                format_duration(started.elapsed()),
                status
            );
        }
        self.say(format!("  > 完成 ({})", format_duration(started.elapsed())));
        find_artefact(project_dir, &self.project.pack_pattern)
    }

    async fn deploy_target(&self, target: &Target, artefact: &Artefact, total: u32) -> Result<()> {
        let connector = if target.is_local() {
            self.local.clone()
        } else {
            self.remote.clone()
        };
        let progress = self.progress.clone();
        let target = target.clone();
        let artefact = artefact.clone();
        tokio::task::spawn_blocking(move || {
            TargetRun {
                target: &target,
                artefact: &artefact,
                progress: progress.as_ref(),
                total,
            }
            .run(connector.as_ref())
        })
        .await
        .context("target worker panicked")?
    }
}

/// Blocking per-target steps: connect, upload, unpack, release.
struct TargetRun<'a> {
    target: &'a Target,
    artefact: &'a Artefact,
    progress: &'a dyn Progress,
    total: u32,
}

impl TargetRun<'_> {
    fn run(&self, connector: &dyn Connector) -> Result<()> {
        let target = self.target;
        let label = target.label();

        self.progress.line(&format!(
            "[STEP 2/{}] 上传 ({}) -> {}",
            self.total, label, target.remote_dir
        ));
        let mut transport = connector
            .connect(target)
            .with_context(|| format!("连接 {} 失败", label))?;

        let remote_path = remote_join(&target.remote_dir, &self.artefact.name);
        let started = Instant::now();
        let written = transport
            .upload(&self.artefact.path, &remote_path)
            .with_context(|| format!("上传到 {} 失败", label))?;
        if written != self.artefact.size {
            tracing::warn!(
                host = %label,
                written,
                expected = self.artefact.size,
                "upload size differs from artefact"
            );
        }
        self.progress.line(&format!(
            "  > 已上传 {} ({}, {})",
            remote_path,
            format_size(written),
            format_duration(started.elapsed())
        ));

        self.progress
            .line(&format!("[STEP 3/{}] 解压 ({})", self.total, label));
        self.exec(
            transport.as_mut(),
            &unpack_command(&target.remote_dir, &self.artefact.name),
        )
        .context("解压失败")?;

        match &target.remote_script {
            Some(script) => {
                self.progress
                    .line(&format!("[STEP 4/{}] 发布 ({}): {}", self.total, label, script));
                let setsid = !target.is_local() || process::which("setsid").is_some();
                self.exec(
                    transport.as_mut(),
                    &release_command(&target.remote_dir, script, setsid),
                )
                .with_context(|| format!("执行 {} 失败", script))?;
            }
            None => self.progress.line(&format!(
                "[STEP 4/{}] 发布 ({}): 无发布脚本，跳过",
                self.total, label
            )),
        }
        Ok(())
    }

    fn exec(&self, transport: &mut dyn Transport, cmd: &str) -> Result<()> {
        let started = Instant::now();
        let out = transport.exec(cmd)?;
        let elapsed = format_duration(started.elapsed());
        if !out.success() {
            for line in out.output.lines() {
                self.progress.line(&format!("  | {}", line));
            }
            bail!("命令执行失败 (exit {}, {})", out.status, elapsed);
        }
        self.progress.line(&format!("  > 完成 ({})", elapsed));
        Ok(())
    }
}

fn pack_command(script: &Path) -> (&'static str, Vec<String>) {
    let path = script.display().to_string();
    let is_batch = script
        .extension()
        .map(|ext| ext.eq_ignore_ascii_case("bat") || ext.eq_ignore_ascii_case("cmd"))
        .unwrap_or(false);
    if is_batch {
        ("cmd", vec!["/C".to_string(), path])
    } else {
        ("bash", vec![path])
    }
}

/// Newest file in `dir` matching `pattern`, with `{date}` matching anything.
pub fn find_artefact(dir: &Path, pattern: &str) -> Result<Artefact> {
    let file_glob = pattern.replace("{date}", "*");
    let full = format!(
        "{}/{}",
        glob::Pattern::escape(&dir.display().to_string()),
        file_glob
    );

    let newest = glob::glob(&full)
        .with_context(|| format!("bad pack_pattern {:?}", pattern))?
        .filter_map(|entry| entry.ok())
        .filter_map(|path| {
            let meta = std::fs::metadata(&path).ok()?;
            meta.is_file()
                .then(|| (meta.modified().unwrap_or(SystemTime::UNIX_EPOCH), meta.len(), path))
        })
        .max_by_key(|(modified, _, _)| *modified);

    let Some((_, size, path)) = newest else {
        bail!("打包完成但未找到匹配 {:?} 的文件", file_glob);
    };
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    Ok(Artefact { path, name, size })
}

fn remote_join(dir: &str, name: &str) -> String {
    if dir.is_empty() {
        return name.to_string();
    }
    format!("{}/{}", dir.trim_end_matches('/'), name)
}

pub fn unpack_command(remote_dir: &str, artefact: &str) -> String {
    format!("cd {} && unzip -o {}", remote_dir, artefact)
}

/// Detached release: the script gets its own session and no inherited
/// descriptors, so daemons it starts cannot hold the exec channel open.
/// Output is only shown when the script fails.
pub fn release_command(remote_dir: &str, script: &str, setsid: bool) -> String {
    let log = "/tmp/deploy_publish_$$.log";
    let launcher = if setsid { "setsid bash" } else { "bash" };
    format!(
        "cd {dir} && {launcher} {script} > {log} 2>&1 < /dev/null; ec=$?; if [ $ec -ne 0 ]; then cat {log}; fi; rm -f {log}; exit $ec",
        dir = remote_dir,
        launcher = launcher,
        script = script,
        log = log
    )
}

pub fn format_size(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;
    match bytes {
        b if b >= GB => format!("{:.1}GB", b as f64 / GB as f64),
        b if b >= MB => format!("{:.1}MB", b as f64 / MB as f64),
        b if b >= KB => format!("{:.1}KB", b as f64 / KB as f64),
        b => format!("{}B", b),
    }
}

pub fn format_duration(d: Duration) -> String {
    if d < Duration::from_secs(1) {
        format!("{}ms", d.as_millis())
    } else {
        format!("{:.1}s", d.as_secs_f64())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::ExecOutput;
    use pretty_assertions::assert_eq;
    use std::sync::Mutex;

    #[test]
    fn test_format_size() {
        assert_eq!(format_size(512), "512B");
        assert_eq!(format_size(2048), "2.0KB");
        assert_eq!(format_size(5 * 1024 * 1024 + 512 * 1024), "5.5MB");
        assert_eq!(format_size(3 * 1024 * 1024 * 1024), "3.0GB");
    }

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(Duration::from_millis(250)), "250ms");
        assert_eq!(format_duration(Duration::from_millis(1500)), "1.5s");
    }

    #[test]
    fn test_release_command_is_detached() {
        assert_eq!(
            release_command("/srv/app", "publish.sh", true),
            "cd /srv/app && setsid bash publish.sh > /tmp/deploy_publish_$$.log 2>&1 < /dev/null; \
             ec=$?; if [ $ec -ne 0 ]; then cat /tmp/deploy_publish_$$.log; fi; \
             rm -f /tmp/deploy_publish_$$.log; exit $ec"
        );
        assert!(release_command("/srv", "p.sh", false).starts_with("cd /srv && bash p.sh > "));
        assert_eq!(unpack_command("/srv/app", "a.zip"), "cd /srv/app && unzip -o a.zip");
    }

    #[test]
    fn test_pack_command_by_extension() {
        assert_eq!(pack_command(Path::new("/p/pack.sh")).0, "bash");
        let (program, args) = pack_command(Path::new("/p/PACK.BAT"));
        assert_eq!(program, "cmd");
        assert_eq!(args[0], "/C");
    }

    #[test]
    fn test_find_artefact_picks_newest() {
        let tmp = tempfile::tempdir().unwrap();
        let old = tmp.path().join("demo_20240101.zip");
        let new = tmp.path().join("demo_20240102.zip");
        std::fs::write(&old, b"old").unwrap();
        std::fs::write(&new, b"newer").unwrap();
        std::fs::write(tmp.path().join("other_20240103.zip"), b"x").unwrap();
        let past = SystemTime::now() - Duration::from_secs(3600);
        std::fs::File::options()
            .write(true)
            .open(&old)
            .unwrap()
            .set_modified(past)
            .unwrap();

        let artefact = find_artefact(tmp.path(), "demo_{date}.zip").unwrap();
        assert_eq!(artefact.name, "demo_20240102.zip");
        assert_eq!(artefact.size, 5);

        let err = find_artefact(tmp.path(), "none_{date}.zip").unwrap_err();
        assert!(err.to_string().contains("none_*.zip"));
    }

    #[derive(Default)]
    struct Recorder(Mutex<Vec<String>>);

    impl Recorder {
        fn lines(&self) -> Vec<String> {
            self.0.lock().unwrap().clone()
        }
    }

    impl Progress for Recorder {
        fn line(&self, text: &str) {
            self.0.lock().unwrap().push(text.to_string());
        }
    }

    /// In-memory targets. Uploads to `fail_upload` hosts fail.
    #[derive(Default)]
    struct FakeConnector {
        fail_upload: Vec<String>,
        log: Arc<Mutex<Vec<String>>>,
    }

    struct FakeTransport {
        host: String,
        fail_upload: bool,
        log: Arc<Mutex<Vec<String>>>,
    }

    impl Connector for FakeConnector {
        fn connect(&self, target: &Target) -> Result<Box<dyn Transport>> {
            Ok(Box::new(FakeTransport {
                host: target.host.clone(),
                fail_upload: self.fail_upload.contains(&target.host),
                log: self.log.clone(),
            }))
        }
    }

    impl Transport for FakeTransport {
        fn upload(&mut self, local: &Path, remote: &str) -> Result<u64> {
            if self.fail_upload {
                bail!("connection reset");
            }
            // Scaled so tests can tell the reported count from the artefact size.
            let size = std::fs::metadata(local)?.len() * 1024;
            self.log
                .lock()
                .unwrap()
                .push(format!("{} put {}", self.host, remote));
            Ok(size)
        }

        fn exec(&mut self, cmd: &str) -> Result<ExecOutput> {
            self.log
                .lock()
                .unwrap()
                .push(format!("{} exec {}", self.host, cmd));
            Ok(ExecOutput {
                status: 0,
                output: String::new(),
            })
        }
    }

    async fn serve(status_line: &'static str) -> String {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 1024];
            let _ = socket.read(&mut buf).await;
            let response = format!(
                "HTTP/1.1 {}\r\ncontent-length: 0\r\nconnection: close\r\n\r\n",
                status_line
            );
            socket.write_all(response.as_bytes()).await.unwrap();
        });
        format!("http://{}/", addr)
    }

    fn target(name: &str, host: &str, script: Option<&str>) -> Target {
        Target {
            name: name.to_string(),
            host: host.to_string(),
            port: 22,
            remote_dir: "/srv/demo".to_string(),
            remote_script: script.map(str::to_string),
        }
    }

    fn project(dir: &Path, targets: Vec<Target>, verify_url: Option<String>) -> ProjectConfig {
        std::fs::write(
            dir.join("pack.sh"),
            "echo packing\necho 'zip content' > demo_20240101_120000.zip\n",
        )
        .unwrap();
        ProjectConfig {
            name: "demo".to_string(),
            project_dir: dir.to_path_buf(),
            pack_script: dir.join("pack.sh"),
            pack_pattern: "demo_{date}.zip".to_string(),
            targets,
            ssh_key: None,
            verify_url,
            verify_timeout: Duration::from_secs(5),
            source: dir.join("deploy.conf"),
        }
    }

    fn deployer(
        project: ProjectConfig,
        connector: Arc<FakeConnector>,
        progress: Arc<Recorder>,
    ) -> Deployer {
        Deployer::new(project, connector, progress).with_settle(Duration::ZERO)
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_partial_deploy_succeeds() {
        let tmp = tempfile::tempdir().unwrap();
        let url = serve("200 OK").await;
        let project = project(
            tmp.path(),
            vec![
                target("t1", "t1host", None),
                target("t2", "t2host", Some("publish.sh")),
            ],
            Some(url),
        );
        let connector = Arc::new(FakeConnector {
            fail_upload: vec!["t1host".to_string()],
            ..Default::default()
        });
        let progress = Arc::new(Recorder::default());

        let report = deployer(project, connector.clone(), progress.clone())
            .run(&RunOptions::default())
            .await
            .unwrap();

        assert_eq!(report.artefact.as_deref(), Some("demo_20240101_120000.zip"));
        assert_eq!(report.succeeded, vec!["t2 (t2host)".to_string()]);
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].0, "t1 (t1host)");
        assert!(report.failed[0].1.contains("connection reset"));

        assert_eq!(
            *connector.log.lock().unwrap(),
            vec![
                "t2host put /srv/demo/demo_20240101_120000.zip".to_string(),
                "t2host exec cd /srv/demo && unzip -o demo_20240101_120000.zip".to_string(),
                format!("t2host exec {}", release_command("/srv/demo", "publish.sh", true)),
            ]
        );

        let lines = progress.lines();
        assert!(lines[0].starts_with("[STEP 1/4] 打包"));
        assert!(lines.contains(&"  packing".to_string()));
        assert!(lines.iter().any(|l| l.starts_with("[ERROR] t1 (t1host): 上传到")));
        assert!(lines
            .iter()
            .any(|l| l.starts_with("  > 已上传 /srv/demo/demo_20240101_120000.zip (12.0KB, ")));
        assert!(lines.contains(&"[OK] t2 (t2host) 部署成功".to_string()));
        assert!(lines.contains(&"[OK] 部署验证通过（HTTP 200）".to_string()));
        assert!(lines.last().unwrap().starts_with("[DONE] 1/2 目标成功"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_all_targets_failing_is_an_error() {
        let tmp = tempfile::tempdir().unwrap();
        let project = project(tmp.path(), vec![target("t1", "t1host", None)], None);
        let connector = Arc::new(FakeConnector {
            fail_upload: vec!["t1host".to_string()],
            ..Default::default()
        });
        let progress = Arc::new(Recorder::default());
        let err = deployer(project, connector, progress)
            .run(&RunOptions::default())
            .await
            .unwrap_err();
        assert!(err.to_string().starts_with("部署失败: [t1 (t1host)]"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_verify_failure_fails_the_run() {
        let tmp = tempfile::tempdir().unwrap();
        let url = serve("500 Internal Server Error").await;
        let project = project(tmp.path(), vec![target("t1", "t1host", None)], Some(url));
        let progress = Arc::new(Recorder::default());
        let err = deployer(project, Arc::new(FakeConnector::default()), progress.clone())
            .run(&RunOptions::default())
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "部署验证失败: HTTP 500");
        assert!(progress
            .lines()
            .contains(&"[ERROR] 验证失败: HTTP 500".to_string()));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_pack_only_and_target_filter() {
        let tmp = tempfile::tempdir().unwrap();
        let project = project(
            tmp.path(),
            vec![target("a", "ahost", None), target("b", "bhost", None)],
            None,
        );
        let connector = Arc::new(FakeConnector::default());
        let progress = Arc::new(Recorder::default());
        let d = deployer(project, connector.clone(), progress.clone());

        let report = d
            .run(&RunOptions {
                pack_only: true,
                target: None,
            })
            .await
            .unwrap();
        assert!(report.succeeded.is_empty());
        assert!(connector.log.lock().unwrap().is_empty());
        assert!(progress.lines()[0].starts_with("[STEP 1/1]"));

        let report = d
            .run(&RunOptions {
                pack_only: false,
                target: Some("bhost".to_string()),
            })
            .await
            .unwrap();
        assert_eq!(report.succeeded, vec!["b (bhost)".to_string()]);

        let err = d
            .run(&RunOptions {
                pack_only: false,
                target: Some("zzz".to_string()),
            })
            .await
            .unwrap_err();
        assert!(err.to_string().contains("not found"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_pack_failure_is_reported() {
        let tmp = tempfile::tempdir().unwrap();
        let project = project(tmp.path(), vec![target("a", "ahost", None)], None);
        std::fs::write(&project.pack_script, "echo broken >&2\nexit 1\n").unwrap();
        let progress = Arc::new(Recorder::default());
        let err = deployer(project, Arc::new(FakeConnector::default()), progress.clone())
            .run(&RunOptions::default())
            .await
            .unwrap_err();
        assert!(format!("{:#}", err).starts_with("打包失败: bash failed"));
        let lines = progress.lines();
        assert!(lines.contains(&"  broken".to_string()));
        assert!(lines.last().unwrap().starts_with("[ERROR] 打包失败"));
    }
}
