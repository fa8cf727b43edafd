/// TCP progress sync server
///
/// Long-lived, newline-delimited JSON connections. Three loops run for the
/// lifetime of the server, plus one reader task per connection:
///
/// 1. accept loop: registers the connection, replays the backlog, spawns
///    the reader
/// 2. broadcast loop: single consumer of the fan-out channel; appends each
///    event to the backlog and writes it to every connection in order
/// 3. reaper: closes connections whose last heartbeat is older than the
///    liveness threshold
///
/// Connection lifecycle: `Accepted → Active → Closed`. Only the reader (on
/// EOF/error) and the reaper remove connections; broadcast write failures
/// are logged and left for those two to clean up.
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use sync_events::{now_millis, ClientMessage, ProgressUpdate, ServerMessage};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use super::connection::{Connection, ConnectionId};
use super::registry::ConnectionRegistry;
use crate::config::TcpConfig;
use crate::delivery::DeliveryBridge;
use crate::error::{AppError, Result};
use crate::metrics;

/// Longest accepted inbound line, newline excluded
const MAX_LINE_BYTES: usize = 16 * 1024;

/// State shared by the server loops and connection handlers
struct Shared {
    registry: Arc<ConnectionRegistry>,
    events: mpsc::Sender<ProgressUpdate>,
    delivery: DeliveryBridge,
    config: TcpConfig,
    next_id: AtomicU64,
}

pub struct ProgressSyncServer {
    listener: TcpListener,
    shared: Arc<Shared>,
    events_rx: mpsc::Receiver<ProgressUpdate>,
}

impl ProgressSyncServer {
    /// Bind the listener. Bind failure is fatal to the caller.
    pub async fn bind(config: &TcpConfig, delivery: DeliveryBridge) -> Result<Self> {
        let listener = TcpListener::bind(&config.bind_addr)
            .await
            .map_err(|e| AppError::bind(&config.bind_addr, e))?;

        info!(addr = %listener.local_addr()?, "progress sync server bound");

        let (events, events_rx) = mpsc::channel(config.channel_capacity);
        let shared = Arc::new(Shared {
            registry: Arc::new(ConnectionRegistry::new(config.backlog_capacity)),
            events,
            delivery,
            config: config.clone(),
            next_id: AtomicU64::new(1),
        });

        Ok(Self {
            listener,
            shared,
            events_rx,
        })
    }

    /// Bind and serve until shutdown
    pub async fn start(
        config: &TcpConfig,
        delivery: DeliveryBridge,
        shutdown: watch::Receiver<bool>,
    ) -> Result<()> {
        Self::bind(config, delivery).await?.run(shutdown).await
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub fn registry(&self) -> Arc<ConnectionRegistry> {
        self.shared.registry.clone()
    }

    /// Run the accept, broadcast and reaper loops until shutdown.
    ///
    /// On shutdown every registered connection is closed.
    pub async fn run(self, shutdown: watch::Receiver<bool>) -> Result<()> {
        let Self {
            listener,
            shared,
            events_rx,
        } = self;

        let mut background = JoinSet::new();
        background.spawn(broadcast_loop(shared.clone(), events_rx, shutdown.clone()));
        background.spawn(reaper_loop(shared.clone(), shutdown.clone()));

        accept_loop(&listener, shared.clone(), shutdown).await;

        let close_limit = shared.config.write_timeout;
        for conn in shared.registry.drain() {
            conn.close(close_limit).await;
        }

        while let Some(joined) = background.join_next().await {
            if let Err(e) = joined {
                error!(error = %e, "progress sync background task failed");
            }
        }

        info!("progress sync server stopped");
        Ok(())
    }
}

async fn accept_loop(
    listener: &TcpListener,
    shared: Arc<Shared>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    info!("progress sync server shutting down");
                    return;
                }
            }
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, addr)) => {
                        tokio::spawn(handle_connection(shared.clone(), stream, addr));
                    }
                    Err(e) => {
                        warn!(error = %e, "accept error");
                    }
                }
            }
        }
    }
}

/// Register the connection, replay the backlog, then read until it closes
async fn handle_connection(shared: Arc<Shared>, stream: TcpStream, addr: SocketAddr) {
    if let Err(e) = stream.set_nodelay(true) {
        debug!(peer = %addr, error = %e, "failed to set TCP_NODELAY");
    }

    let (read_half, write_half) = stream.into_split();
    let id: ConnectionId = shared.next_id.fetch_add(1, Ordering::Relaxed);
    let conn = Arc::new(Connection::new(id, addr, write_half));
    let limit = shared.config.write_timeout;

    // Hold the writer across registration so no broadcast can reach this
    // connection before its replay has been written.
    let replayed = {
        let mut writer = conn.lock_writer().await;
        let Some(replay) = shared.registry.add(conn.clone()) else {
            warn!(peer = %addr, "connection from an already registered address; dropping");
            return;
        };

        info!(peer = %addr, replay = replay.len(), "client connected");

        let mut replayed = true;
        for line in &replay {
            if let Err(e) = Connection::write_line_locked(&mut writer, line, limit).await {
                warn!(peer = %addr, error = %e, "backlog replay failed");
                replayed = false;
                break;
            }
        }
        replayed
    };

    // A failed replay may have left a partial frame behind
    if replayed {
        read_loop(&shared, &conn, read_half).await;
    }

    shared.registry.remove(addr, id);
    conn.close(limit).await;
    info!(peer = %addr, "client disconnected");
}

async fn read_loop(shared: &Shared, conn: &Arc<Connection>, read_half: OwnedReadHalf) {
    let addr = conn.addr();
    let mut reader = BufReader::new(read_half);
    let mut buf = Vec::with_capacity(256);

    loop {
        buf.clear();
        let read = tokio::select! {
            _ = conn.closed() => return,
            read = read_frame(&mut reader, &mut buf) => read,
        };

        match read {
            Ok(FrameRead::Line) => handle_line(shared, conn, &buf).await,
            Ok(FrameRead::Eof) => return,
            Ok(FrameRead::TooLong) => {
                warn!(peer = %addr, limit = MAX_LINE_BYTES, "line too long; closing connection");
                return;
            }
            Err(e) => {
                debug!(peer = %addr, error = %e, "read error");
                return;
            }
        }
    }
}

enum FrameRead {
    Line,
    Eof,
    TooLong,
}

/// Read one newline-terminated frame into `buf` (newline stripped)
async fn read_frame(
    reader: &mut BufReader<OwnedReadHalf>,
    buf: &mut Vec<u8>,
) -> std::io::Result<FrameRead> {
    let limit = (MAX_LINE_BYTES + 1) as u64;
    let read = (&mut *reader).take(limit).read_until(b'\n', buf).await?;

    if read == 0 {
        return Ok(FrameRead::Eof);
    }
    if buf.last() == Some(&b'\n') {
        buf.pop();
    } else if buf.len() > MAX_LINE_BYTES {
        return Ok(FrameRead::TooLong);
    }
    if buf.last() == Some(&b'\r') {
        buf.pop();
    }
    Ok(FrameRead::Line)
}

async fn handle_line(shared: &Shared, conn: &Arc<Connection>, raw: &[u8]) {
    if raw.iter().all(u8::is_ascii_whitespace) {
        return;
    }

    conn.touch();

    let message = match std::str::from_utf8(raw)
        .ok()
        .and_then(|line| ClientMessage::from_line(line).ok())
    {
        Some(message) => message,
        None => {
            debug!(peer = %conn.addr(), "dropping malformed message");
            return;
        }
    };

    match message {
        ClientMessage::Ping => {
            let pong = match ServerMessage::Pong.to_line() {
                Ok(pong) => pong,
                Err(e) => {
                    warn!(error = %e, "failed to encode PONG");
                    return;
                }
            };
            if let Err(e) = conn
                .write_line(pong.trim_end(), shared.config.write_timeout)
                .await
            {
                warn!(peer = %conn.addr(), error = %e, "failed to send PONG");
            }
        }
        ClientMessage::Progress {
            user_id,
            manga_id,
            chapter,
        } => {
            let update = ProgressUpdate::new(user_id, manga_id, chapter).stamped(now_millis());
            ingest(shared, update);
        }
    }
}

/// Hand an update to the delivery bridge and the fan-out channel.
///
/// A full channel drops the new event instead of blocking the reader.
fn ingest(shared: &Shared, update: ProgressUpdate) {
    shared.delivery.forward(update.clone());

    match shared.events.try_send(update) {
        Ok(()) => metrics::record_progress_event("accepted"),
        Err(TrySendError::Full(update)) => {
            metrics::record_progress_event("dropped");
            warn!(
                user_id = %update.user_id,
                manga_id = %update.manga_id,
                "fan-out channel full; dropping progress event"
            );
        }
        Err(TrySendError::Closed(_)) => {
            debug!("fan-out channel closed; server is shutting down");
        }
    }
}

async fn broadcast_loop(
    shared: Arc<Shared>,
    mut events: mpsc::Receiver<ProgressUpdate>,
    mut shutdown: watch::Receiver<bool>,
) {
    let limit = shared.config.write_timeout;

    loop {
        let update = tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    return;
                }
                continue;
            }
            update = events.recv() => match update {
                Some(update) => update,
                None => return,
            },
        };

        let line: Arc<str> = match update.to_json() {
            Ok(json) => json.into(),
            Err(e) => {
                warn!(error = %e, "failed to encode progress update");
                continue;
            }
        };

        let targets = shared.registry.record_event(line.clone());
        debug!(
            user_id = %update.user_id,
            targets = targets.len(),
            "broadcasting progress update"
        );

        for conn in targets {
            if let Err(e) = conn.write_line(&line, limit).await {
                metrics::record_send_failure("tcp", "write");
                warn!(peer = %conn.addr(), error = %e, "progress broadcast write failed");
            }
        }
    }
}

async fn reaper_loop(shared: Arc<Shared>, mut shutdown: watch::Receiver<bool>) {
    let threshold = shared.config.heartbeat_timeout;
    let mut interval = tokio::time::interval(shared.config.reaper_interval);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    interval.tick().await;

    loop {
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    return;
                }
            }
            _ = interval.tick() => {
                for conn in shared.registry.remove_stale(threshold) {
                    metrics::record_reaped_connection();
                    info!(peer = %conn.addr(), "closing stale connection");
                    conn.close(shared.config.write_timeout).await;
                }
            }
        }
    }
}
