/// A registered progress-sync connection
///
/// The read half lives in the connection's handler task; the write half is
/// kept here behind its own async mutex so that replay, PONG replies and
/// broadcast writes never interleave within a line. The socket itself is
/// released when both halves are dropped; `close()` only flips the state,
/// wakes the reader and sends FIN, and is a no-op after the first call.
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::sync::{Mutex as AsyncMutex, MutexGuard, Notify};
use tokio::time::{timeout, timeout_at, Instant};
use tracing::warn;

use crate::error::{AppError, Result};

pub type ConnectionId = u64;

pub struct Connection {
    id: ConnectionId,
    addr: SocketAddr,
    writer: AsyncMutex<OwnedWriteHalf>,
    last_heartbeat: Mutex<Instant>,
    closed: AtomicBool,
    close_signal: Notify,
}

impl Connection {
    pub fn new(id: ConnectionId, addr: SocketAddr, writer: OwnedWriteHalf) -> Self {
        Self {
            id,
            addr,
            writer: AsyncMutex::new(writer),
            last_heartbeat: Mutex::new(Instant::now()),
            closed: AtomicBool::new(false),
            close_signal: Notify::new(),
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Record liveness
    pub fn touch(&self) {
        *self.last_heartbeat.lock() = Instant::now();
    }

    pub fn last_heartbeat(&self) -> Instant {
        *self.last_heartbeat.lock()
    }

    pub fn idle_for(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_heartbeat())
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Exclusive access to the write half, for multi-line sequences
    pub async fn lock_writer(&self) -> MutexGuard<'_, OwnedWriteHalf> {
        self.writer.lock().await
    }

    /// Write one newline-terminated frame, bounded by `limit`
    ///
    /// The limit covers waiting for the writer lock as well as the write. A
    /// write that times out may have left a partial frame on the wire, so the
    /// connection is closed; the reader then unregisters it.
    pub async fn write_line(&self, line: &str, limit: Duration) -> Result<()> {
        if self.is_closed() {
            return Err(AppError::ConnectionClosed(self.addr));
        }

        let deadline = Instant::now() + limit;
        let frame = frame(line);

        let mut writer = timeout_at(deadline, self.writer.lock())
            .await
            .map_err(|_| AppError::Timeout(limit))?;

        let written = timeout_at(deadline, writer.write_all(&frame)).await;
        match written {
            Ok(written) => Ok(written?),
            Err(_) => {
                drop(writer);
                warn!(peer = %self.addr, timeout = ?limit, "write timed out mid-frame; closing connection");
                self.close(limit).await;
                Err(AppError::Timeout(limit))
            }
        }
    }

    /// Write one frame through an already held writer guard
    ///
    /// On timeout the caller must close the connection: the frame may be
    /// partially written.
    pub async fn write_line_locked(
        writer: &mut OwnedWriteHalf,
        line: &str,
        limit: Duration,
    ) -> Result<()> {
        let frame = frame(line);
        timeout(limit, writer.write_all(&frame))
            .await
            .map_err(|_| AppError::Timeout(limit))??;
        Ok(())
    }

    /// Close the connection. Returns `true` only for the call that actually
    /// performed the close.
    pub async fn close(&self, limit: Duration) -> bool {
        if self.closed.swap(true, Ordering::AcqRel) {
            return false;
        }

        self.close_signal.notify_waiters();

        if let Ok(mut writer) = timeout(limit, self.writer.lock()).await {
            let _ = timeout(limit, writer.shutdown()).await;
        }
        true
    }

    /// Resolves once `close()` has been called
    pub async fn closed(&self) {
        loop {
            let notified = self.close_signal.notified();
            if self.is_closed() {
                return;
            }
            notified.await;
        }
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("addr", &self.addr)
            .field("closed", &self.is_closed())
            .finish()
    }
}

fn frame(line: &str) -> Vec<u8> {
    let mut frame = Vec::with_capacity(line.len() + 1);
    frame.extend_from_slice(line.as_bytes());
    frame.push(b'\n');
    frame
}
