/// Client-side progress emitter
///
/// Used by the HTTP-facing ingestion path to push a progress update into the
/// sync server. The connection is opened lazily and reused; a failed write
/// drops it so the next call reconnects. Nothing is retried internally.
///
/// The emitter never reads on its own, so the server reaps its connection
/// once the heartbeat threshold passes. Before every write the cached stream
/// is checked for a peer close (and any lines the server pushed are
/// discarded); a closed stream is replaced with a fresh connection.
use std::io::ErrorKind;

use sync_events::{ClientMessage, ProgressUpdate};
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::error::Result;

pub struct ProgressEmitter {
    addr: String,
    stream: Mutex<Option<TcpStream>>,
}

impl ProgressEmitter {
    /// Create an emitter that connects on first use
    pub fn new(addr: impl Into<String>) -> Self {
        Self {
            addr: addr.into(),
            stream: Mutex::new(None),
        }
    }

    /// Create an emitter and connect immediately
    pub async fn connect(addr: impl Into<String>) -> Result<Self> {
        let emitter = Self::new(addr);
        let stream = TcpStream::connect(&emitter.addr).await?;
        *emitter.stream.lock().await = Some(stream);
        Ok(emitter)
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    /// Send one progress update
    pub async fn emit(&self, update: &ProgressUpdate) -> Result<()> {
        let line = ClientMessage::progress(update).to_line()?;
        self.send_line(&line).await
    }

    /// Send a heartbeat so the server keeps this connection registered
    pub async fn ping(&self) -> Result<()> {
        let line = ClientMessage::Ping.to_line()?;
        self.send_line(&line).await
    }

    async fn send_line(&self, line: &str) -> Result<()> {
        let mut guard = self.stream.lock().await;

        if guard.as_ref().is_some_and(peer_closed) {
            debug!(addr = %self.addr, "progress sync server closed the connection; reconnecting");
            *guard = None;
        }

        if guard.is_none() {
            debug!(addr = %self.addr, "connecting progress emitter");
            *guard = Some(TcpStream::connect(&self.addr).await?);
        }

        if let Some(stream) = guard.as_mut() {
            if let Err(e) = stream.write_all(line.as_bytes()).await {
                warn!(addr = %self.addr, error = %e, "progress emit failed; dropping connection");
                *guard = None;
                return Err(e.into());
            }
        }
        Ok(())
    }
}

/// Drain whatever the server has sent and report whether it has hung up
fn peer_closed(stream: &TcpStream) -> bool {
    let mut scratch = [0u8; 4096];
    loop {
        match stream.try_read(&mut scratch) {
            Ok(0) => return true,
            Ok(_) => continue,
            Err(e) if e.kind() == ErrorKind::WouldBlock => return false,
            Err(_) => return true,
        }
    }
}
