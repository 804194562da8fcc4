//! Child process plumbing shared by both agents.

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use bytes::BytesMut;
use futures_util::StreamExt;
use tokio::io::AsyncRead;
use tokio::process::Command;
use tokio_util::codec::{AnyDelimiterCodec, AnyDelimiterCodecError, Decoder, FramedRead};

/// Per-line cap for coding CLI stdout.
pub const CODEGEN_LINE_MAX: usize = 1024 * 1024;

/// Per-line cap for deploy agent output.
pub const DEPLOY_LINE_MAX: usize = 256 * 1024;

#[derive(Debug, PartialEq)]
enum Line {
    Text(String),
    Overlong,
}

/// Newline framing with a length cap. Overlong lines become a marker
/// instead of an error, so one huge line never ends the stream.
struct LineCodec {
    inner: AnyDelimiterCodec,
}

impl LineCodec {
    fn new(max: usize) -> Self {
        Self {
            inner: AnyDelimiterCodec::new_with_max_length(b"\n".to_vec(), Vec::new(), max),
        }
    }

    fn map(
        item: Result<Option<bytes::Bytes>, AnyDelimiterCodecError>,
    ) -> Result<Option<Line>, std::io::Error> {
        match item {
            Ok(Some(bytes)) => {
                let text = String::from_utf8_lossy(&bytes);
                Ok(Some(Line::Text(text.trim_end_matches('\r').to_string())))
            }
            Ok(None) => Ok(None),
            Err(AnyDelimiterCodecError::MaxChunkLengthExceeded) => Ok(Some(Line::Overlong)),
            Err(AnyDelimiterCodecError::Io(e)) => Err(e),
        }
    }
}

impl Decoder for LineCodec {
    type Item = Line;
    type Error = std::io::Error;

    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Line>, std::io::Error> {
        Self::map(self.inner.decode(buf))
    }

    fn decode_eof(&mut self, buf: &mut BytesMut) -> Result<Option<Line>, std::io::Error> {
        Self::map(self.inner.decode_eof(buf))
    }
}

/// Line reader over a child pipe.
pub struct BoundedLines<R> {
    frames: FramedRead<R, LineCodec>,
    max: usize,
}

impl<R: AsyncRead + Unpin> BoundedLines<R> {
    pub fn new(reader: R, max: usize) -> Self {
        Self {
            frames: FramedRead::new(reader, LineCodec::new(max)),
            max,
        }
    }

    /// Next line without its terminator. Lines longer than the cap are
    /// skipped with a warning; `None` at end of stream or on a read error.
    pub async fn next_line(&mut self) -> Option<String> {
        loop {
            match self.frames.next().await {
                None => return None,
                Some(Ok(Line::Text(line))) => return Some(line),
                Some(Ok(Line::Overlong)) => {
                    tracing::warn!(max = self.max, "skipping overlong output line");
                }
                Some(Err(e)) => {
                    tracing::warn!("read child output: {}", e);
                    return None;
                }
            }
        }
    }
}

/// Run a short command to completion, returning stdout.
pub async fn run(program: &str, args: &[&str], dir: &Path) -> Result<String> {
    let output = Command::new(program)
        .args(args)
        .current_dir(dir)
        .output()
        .await
        .with_context(|| format!("Failed to execute {}", program))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        bail!("{} {}: {}", program, args.join(" "), stderr.trim());
    }
    Ok(String::from_utf8_lossy(&output.stdout).into())
}

/// Give `dir` its own git repository unless it already has one.
pub async fn ensure_git_repo(dir: &Path) {
    if dir.join(".git").exists() {
        return;
    }
    match run("git", &["init"], dir).await {
        Ok(_) => tracing::info!(dir = %dir.display(), "initialized git repository"),
        Err(e) => tracing::warn!(dir = %dir.display(), "git init failed: {:#}", e),
    }
}

/// Resolves on Ctrl-C, or SIGTERM on unix.
pub async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = term.recv() => {}
                }
            }
            Err(e) => {
                tracing::warn!("SIGTERM handler unavailable: {}", e);
                tokio::signal::ctrl_c().await.ok();
            }
        }
    }
    #[cfg(not(unix))]
    tokio::signal::ctrl_c().await.ok();
    tracing::info!("shutdown signal received");
}

/// Resolve a program name the way a shell would. Names containing a path
/// separator are checked as paths.
pub fn which(program: &str) -> Option<PathBuf> {
    let candidate = Path::new(program);
    if candidate.components().count() > 1 || candidate.is_absolute() {
        return candidate.is_file().then(|| candidate.to_path_buf());
    }

    let paths = std::env::var_os("PATH")?;
    std::env::split_paths(&paths).find_map(|dir| {
        let full = dir.join(program);
        if full.is_file() {
            return Some(full);
        }
        if cfg!(windows) {
            let exe = dir.join(format!("{}.exe", program));
            if exe.is_file() {
                return Some(exe);
            }
        }
        None
    })
}
