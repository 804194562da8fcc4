use std::io::Read;
use std::net::{TcpStream, ToSocketAddrs};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use ssh2::{ExtendedData, KeyboardInteractivePrompt, Prompt, Session};
use tracing::debug;

use super::{Connector, ExecOutput, Transport};
use crate::config::Target;

pub const DIAL_TIMEOUT: Duration = Duration::from_secs(30);

/// SSH connections authenticated by key, password, then
/// keyboard-interactive answering every prompt with the password.
pub struct SshConnector {
    key: Option<PathBuf>,
    password: String,
    connected: AtomicBool,
}

impl SshConnector {
    pub fn new(key: Option<PathBuf>, password: impl Into<String>) -> Self {
        Self {
            key,
            password: password.into(),
            connected: AtomicBool::new(false),
        }
    }

    /// Whether any connection made through this connector authenticated.
    pub fn connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn authenticate(&self, session: &Session, user: &str) {
        if let Some(key) = &self.key {
            match session.userauth_pubkey_file(user, None, key, None) {
                Ok(()) => return,
                Err(e) => debug!(key = %key.display(), "public key auth failed: {}", e),
            }
        }
        if self.password.is_empty() {
            return;
        }
        if let Err(e) = session.userauth_password(user, &self.password) {
            debug!("password auth failed: {}", e);
        }
        if session.authenticated() {
            return;
        }
        let mut prompter = PasswordPrompt(&self.password);
        if let Err(e) = session.userauth_keyboard_interactive(user, &mut prompter) {
            debug!("keyboard-interactive auth failed: {}", e);
        }
    }
}

struct PasswordPrompt<'a>(&'a str);

impl KeyboardInteractivePrompt for PasswordPrompt<'_> {
    fn prompt<'b>(
        &mut self,
        _username: &str,
        _instructions: &str,
        prompts: &[Prompt<'b>],
    ) -> Vec<String> {
        prompts.iter().map(|_| self.0.to_string()).collect()
    }
}

impl Connector for SshConnector {
    fn connect(&self, target: &Target) -> Result<Box<dyn Transport>> {
        let (user, host) = target.user_host();
        let addr = (host, target.port)
            .to_socket_addrs()
            .with_context(|| format!("resolve {}:{}", host, target.port))?
            .next()
            .with_context(|| format!("no address for {}", host))?;

        let tcp = TcpStream::connect_timeout(&addr, DIAL_TIMEOUT)
            .with_context(|| format!("dial {}", addr))?;
        let mut session = Session::new().context("create SSH session")?;
        session.set_tcp_stream(tcp);
        session.set_timeout(DIAL_TIMEOUT.as_millis() as u32);
        session.handshake().context("SSH handshake")?;
        // TODO: check the server key against known_hosts; every host key is accepted today.

        self.authenticate(&session, user);
        if !session.authenticated() {
            bail!("SSH authentication failed for {}@{}", user, host);
        }
        // Release scripts may run for a while; only the dial is bounded.
        session.set_timeout(0);
        self.connected.store(true, Ordering::SeqCst);
        Ok(Box::new(SshTransport { session }))
    }
}

struct SshTransport {
    session: Session,
}

impl Transport for SshTransport {
    fn upload(&mut self, local: &Path, remote: &str) -> Result<u64> {
        let sftp = self.session.sftp().context("创建 SFTP 连接失败")?;
        let mut source = std::fs::File::open(local)
            .with_context(|| format!("打开本地文件失败: {}", local.display()))?;
        let mut dest = sftp
            .create(Path::new(remote))
            .with_context(|| format!("创建远程文件失败: {}", remote))?;
        let written = std::io::copy(&mut source, &mut dest).context("上传失败")?;
        // File first, then the channel.
        drop(dest);
        drop(sftp);
        Ok(written)
    }

    fn exec(&mut self, cmd: &str) -> Result<ExecOutput> {
        let mut channel = self
            .session
            .channel_session()
            .context("创建 SSH 会话失败")?;
        channel.handle_extended_data(ExtendedData::Merge)?;
        channel.exec(cmd)?;

        let mut raw = Vec::new();
        channel.read_to_end(&mut raw)?;
        channel.wait_close()?;
        Ok(ExecOutput {
            status: channel.exit_status()?,
            output: String::from_utf8_lossy(&raw).into_owned(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prompt_answers_every_question() {
        let mut prompter = PasswordPrompt("pw");
        let prompts = [
            Prompt {
                text: "Password: ".into(),
                echo: false,
            },
            Prompt {
                text: "OTP: ".into(),
                echo: false,
            },
        ];
        assert_eq!(prompter.prompt("u", "", &prompts), vec!["pw", "pw"]);
    }

    #[test]
    fn test_unreachable_target_does_not_mark_connected() {
        let connector = SshConnector::new(None, "pw");
        let target = Target {
            name: "t".to_string(),
            host: "u@127.0.0.1".to_string(),
            port: 1,
            remote_dir: "/srv".to_string(),
            remote_script: None,
        };
        assert!(connector.connect(&target).is_err());
        assert!(!connector.connected());
    }
}
