//! Health probe on a unix domain socket.
//!
//! Serves `GET /health` over a plain byte stream at `/tmp/<name>`: 200 while
//! the control loop is alive, 503 otherwise. The socket file is removed on
//! start and again on clean shutdown.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{UnixListener, UnixStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::core::health::Health;

async fn remove_if_exists(path: &Path) -> Result<()> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err).with_context(|| format!("removing {}", path.display())),
    }
}

async fn handle(stream: &mut UnixStream, health: &Health) -> std::io::Result<()> {
    let mut buf = [0u8; 1024];
    let n = stream.read(&mut buf).await?;
    let request = String::from_utf8_lossy(&buf[..n]);
    let line = request.lines().next().unwrap_or("");

    let response: &str = if line.starts_with("GET /health") {
        if health.healthy() {
            "HTTP/1.1 200 OK\r\ncontent-length: 2\r\n\r\nOK"
        } else {
            "HTTP/1.1 503 Service Unavailable\r\ncontent-length: 0\r\n\r\n"
        }
    } else {
        "HTTP/1.1 404 Not Found\r\ncontent-length: 0\r\n\r\n"
    };

    stream.write_all(response.as_bytes()).await?;
    stream.shutdown().await
}

/// Bind the socket and answer probes until the stop token fires.
pub async fn serve(path: PathBuf, health: Arc<Health>, stop: CancellationToken) -> Result<()> {
    remove_if_exists(&path).await?;

    let listener = UnixListener::bind(&path)
        .with_context(|| format!("binding health socket {}", path.display()))?;
    info!(path = %path.display(), "health listener");

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                match accepted {
                    Ok((mut stream, _)) => {
                        let health = health.clone();
                        tokio::spawn(async move {
                            if let Err(err) = handle(&mut stream, &health).await {
                                debug!(error = %err, "health probe connection");
                            }
                        });
                    }
                    Err(err) => warn!(error = %err, "health listener accept"),
                }
            }
            _ = stop.cancelled() => break,
        }
    }

    drop(listener);
    remove_if_exists(&path).await?;
    info!("health listener stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    async fn probe(path: &Path) -> String {
        let mut stream = UnixStream::connect(path).await.unwrap();
        stream
            .write_all(b"GET /health HTTP/1.1\r\nhost: localhost\r\n\r\n")
            .await
            .unwrap();
        let mut response = String::new();
        stream.read_to_string(&mut response).await.unwrap();
        response
    }

    #[tokio::test]
    async fn probe_reflects_health_state() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pvflow-test");
        let health = Arc::new(Health::new(Duration::from_secs(30)));
        let stop = CancellationToken::new();

        let server = tokio::spawn(serve(path.clone(), health.clone(), stop.clone()));
        // wait for the socket to appear
        for _ in 0..50 {
            if path.exists() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        let response = probe(&path).await;
        assert!(response.starts_with("HTTP/1.1 503"), "no update yet: {response}");

        health.update();
        let response = probe(&path).await;
        assert!(response.starts_with("HTTP/1.1 200"), "alive: {response}");
        assert!(response.ends_with("OK"));

        let mut stream = UnixStream::connect(&path).await.unwrap();
        stream.write_all(b"GET /other HTTP/1.1\r\n\r\n").await.unwrap();
        let mut response = String::new();
        stream.read_to_string(&mut response).await.unwrap();
        assert!(response.starts_with("HTTP/1.1 404"));

        stop.cancel();
        server.await.unwrap().unwrap();
        assert!(!path.exists(), "socket removed on shutdown");
    }
}
