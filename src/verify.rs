//! Post-deploy HTTP health check.

use std::time::Duration;

use anyhow::{bail, Context, Result};

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// Quiet period before verifying, so a freshly released service can bind.
pub const SETTLE_DELAY: Duration = Duration::from_secs(5);

/// One GET against `url`; anything but 200 is a failure.
pub async fn check(url: &str, timeout: Duration) -> Result<()> {
    let client = reqwest::Client::builder()
        .timeout(timeout)
        .build()
        .context("Failed to build HTTP client")?;

    let response = client
        .get(url)
        .send()
        .await
        .with_context(|| format!("连接失败: {}", url))?;

    let status = response.status();
    if status != reqwest::StatusCode::OK {
        bail!("HTTP {}", status.as_u16());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    async fn serve_once(status_line: &'static str) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 1024];
            let _ = socket.read(&mut buf).await;
            let response = format!(
                "HTTP/1.1 {}\r\ncontent-length: 2\r\nconnection: close\r\n\r\nok",
                status_line
            );
            socket.write_all(response.as_bytes()).await.unwrap();
        });
        format!("http://{}/health", addr)
    }

    #[tokio::test]
    async fn test_ok_passes() {
        let url = serve_once("200 OK").await;
        check(&url, DEFAULT_TIMEOUT).await.unwrap();
    }

    #[tokio::test]
    async fn test_non_200_fails() {
        let url = serve_once("503 Service Unavailable").await;
        let err = check(&url, DEFAULT_TIMEOUT).await.unwrap_err();
        assert_eq!(err.to_string(), "HTTP 503");
    }

    #[tokio::test]
    async fn test_connection_refused_fails() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        let url = format!("http://{}/", addr);
        assert!(check(&url, Duration::from_secs(2)).await.is_err());
    }
}
