//! Local protocol endpoint over a Unix domain socket.
//!
//! Messages are newline-delimited JSON. The heartbeat is a `ping` request
//! answered by any single JSON line.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use serde_json::json;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::Mutex;
use tracing::debug;

use super::ProtocolTransport;
use crate::error::{Error, Result};

pub struct UnixSocketTransport {
    path: PathBuf,
    reader: Mutex<BufReader<OwnedReadHalf>>,
    writer: Mutex<Option<OwnedWriteHalf>>,
    next_id: AtomicU64,
}

impl UnixSocketTransport {
    pub async fn connect(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if !path.exists() {
            return Err(Error::Network(format!(
                "Socket not found: {}",
                path.display()
            )));
        }

        let stream = UnixStream::connect(&path)
            .await
            .map_err(|e| io_to_network(&path, e))?;
        let (read, write) = stream.into_split();
        debug!(socket = %path.display(), "Unix socket connected");

        Ok(Self {
            path,
            reader: Mutex::new(BufReader::new(read)),
            writer: Mutex::new(Some(write)),
            next_id: AtomicU64::new(1),
        })
    }

    /// Socket path from a `unix:` URI. Accepts `unix:/p` and `unix:///p`.
    pub fn socket_path(uri: &str) -> Option<PathBuf> {
        let rest = uri.strip_prefix("unix:")?;
        let rest = rest.strip_prefix("//").unwrap_or(rest);
        if rest.is_empty() {
            None
        } else {
            Some(PathBuf::from(rest))
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn write_line(&self, message: &serde_json::Value) -> Result<()> {
        let mut line = serde_json::to_vec(message)?;
        line.push(b'\n');

        let mut writer = self.writer.lock().await;
        let stream = writer
            .as_mut()
            .ok_or_else(|| Error::Network("Transport closed".into()))?;
        stream
            .write_all(&line)
            .await
            .map_err(|e| io_to_network(&self.path, e))?;
        stream.flush().await.map_err(|e| io_to_network(&self.path, e))
    }

    async fn read_line(&self) -> Result<serde_json::Value> {
        let mut reader = self.reader.lock().await;
        let mut line = String::new();
        let read = reader
            .read_line(&mut line)
            .await
            .map_err(|e| io_to_network(&self.path, e))?;
        if read == 0 {
            return Err(Error::Network(format!(
                "Connection closed by {}",
                self.path.display()
            )));
        }
        Ok(serde_json::from_str(line.trim_end())?)
    }
}

fn io_to_network(path: &Path, e: io::Error) -> Error {
    Error::Network(format!("{}: {}", path.display(), e))
}

#[async_trait]
impl ProtocolTransport for UnixSocketTransport {
    async fn send(&self, message: serde_json::Value) -> Result<()> {
        self.write_line(&message).await
    }

    async fn receive(&self) -> Result<serde_json::Value> {
        self.read_line().await
    }

    async fn heartbeat(&self) -> Result<()> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.write_line(&json!({ "jsonrpc": "2.0", "id": id, "method": "ping" }))
            .await?;
        let reply = self.read_line().await?;
        if let Some(error) = reply.get("error") {
            return Err(Error::Network(format!("Ping failed: {}", error)));
        }
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        if let Some(mut writer) = self.writer.lock().await.take() {
            let _ = writer.shutdown().await;
        }
        Ok(())
    }
}
