//! Console server.
//!
//! Operators (and their tooling) speak a line-oriented text protocol over a
//! Unix domain socket: one command per line, one response per command, every
//! response prefixed `250` on success or `5xx` on failure.

use std::{path::Path, sync::Arc, time::Duration};

use async_trait::async_trait;
use harbinger_common::Signal;
use thiserror::Error;
use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
    net::{UnixListener, UnixStream},
    sync::broadcast,
};
use tracing::{debug, error, info};

#[derive(Debug, Error)]
pub enum ControlError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("console connection timed out")]
    Timeout,
}

/// Handler turning one tokenized command line into a protocol response.
#[async_trait]
pub trait CommandHandler: Send + Sync {
    /// Handle one command. The returned string must carry the `250`/`5xx`
    /// prefix; the server appends the line terminator.
    async fn handle(&self, argv: &[&str]) -> String;
}

/// Unix-socket console server.
pub struct ConsoleServer {
    socket_path: String,
    handler: Arc<dyn CommandHandler>,
}

impl ConsoleServer {
    pub fn new(socket_path: impl Into<String>, handler: Arc<dyn CommandHandler>) -> Self {
        Self {
            socket_path: socket_path.into(),
            handler,
        }
    }

    /// Serve until a shutdown signal arrives.
    ///
    /// # Errors
    ///
    /// Returns an error when the socket cannot be bound.
    pub async fn serve(&self, mut shutdown: broadcast::Receiver<Signal>) -> Result<(), ControlError> {
        let socket_path = Path::new(&self.socket_path);
        if socket_path.exists() {
            if UnixStream::connect(socket_path).await.is_ok() {
                return Err(ControlError::Io(std::io::Error::new(
                    std::io::ErrorKind::AddrInUse,
                    format!("console socket already in use: {}", self.socket_path),
                )));
            }
            info!("removing stale console socket {}", self.socket_path);
            tokio::fs::remove_file(socket_path).await?;
        }

        let listener = UnixListener::bind(&self.socket_path)?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let metadata = tokio::fs::metadata(&self.socket_path).await?;
            let mut permissions = metadata.permissions();
            permissions.set_mode(0o600);
            tokio::fs::set_permissions(&self.socket_path, permissions).await?;
        }
        info!("console listening on {}", self.socket_path);

        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, _addr)) => {
                            let handler = Arc::clone(&self.handler);
                            tokio::spawn(async move {
                                if let Err(e) = Self::handle_connection(stream, handler).await {
                                    error!("console connection error: {e}");
                                }
                            });
                        }
                        Err(e) => error!("console accept error: {e}"),
                    }
                }
                _ = shutdown.recv() => {
                    info!("console shutting down");
                    break;
                }
            }
        }

        if socket_path.exists() {
            debug!("removing console socket {}", self.socket_path);
            let _ = tokio::fs::remove_file(socket_path).await;
        }
        Ok(())
    }

    async fn handle_connection(
        stream: UnixStream,
        handler: Arc<dyn CommandHandler>,
    ) -> Result<(), ControlError> {
        let idle = Duration::from_secs(300);
        let (reader, mut writer) = stream.into_split();
        let mut lines = BufReader::new(reader).lines();

        loop {
            let line = tokio::time::timeout(idle, lines.next_line())
                .await
                .map_err(|_| ControlError::Timeout)??;
            let Some(line) = line else {
                break; // client closed
            };
            let argv: Vec<&str> = line.split_whitespace().collect();
            if argv.is_empty() {
                continue;
            }
            let response = handler.handle(&argv).await;
            writer.write_all(response.as_bytes()).await?;
            writer.write_all(b"\r\n").await?;
            writer.flush().await?;
        }
        Ok(())
    }
}
