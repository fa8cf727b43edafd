/// UDP notification broadcaster
///
/// Owns one UDP socket that is used both for the registration handshake and
/// for outbound notifications, so subscribers always see datagrams arrive
/// from the port they registered with.
///
/// Protocol:
/// 1. Client sends `{"type":"REGISTER"}`
/// 2. Server records the sender address and replies `{"type":"REGISTER_ACK"}`
/// 3. Every `broadcast()` sends the notification JSON to each subscriber
/// 4. Client may answer `{"type":"ACK","id":...}`; this is logged only
///
/// Delivery is best-effort and at-most-once: nothing is retried or queued.
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use sync_events::{Notification, UdpMessage};
use tokio::net::UdpSocket;
use tokio::sync::{watch, Semaphore};
use tokio::time::{timeout, Interval, MissedTickBehavior};
use tracing::{debug, info, warn};

use super::registry::SubscriberRegistry;
use crate::config::UdpConfig;
use crate::error::{AppError, Result};
use crate::fanout::dispatch_bounded;
use crate::metrics;

/// Largest datagram the receive loop accepts
const MAX_DATAGRAM_SIZE: usize = 2048;

/// Result of a single `broadcast()` call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BroadcastReport {
    /// Id assigned to the notification
    pub id: String,
    pub subscribers: usize,
    pub delivered: usize,
    pub failed: usize,
}

pub struct NotificationServer {
    socket: Arc<UdpSocket>,
    registry: Arc<SubscriberRegistry>,
    limiter: Arc<Semaphore>,
    send_timeout: Duration,
    subscriber_ttl: Option<Duration>,
}

impl NotificationServer {
    /// Bind the notification socket. Bind failure is fatal to the caller.
    pub async fn bind(config: &UdpConfig) -> Result<Arc<Self>> {
        let socket = UdpSocket::bind(&config.bind_addr)
            .await
            .map_err(|e| AppError::bind(&config.bind_addr, e))?;

        info!(addr = %socket.local_addr()?, "UDP notification server bound");

        Ok(Arc::new(Self {
            socket: Arc::new(socket),
            registry: Arc::new(SubscriberRegistry::new()),
            limiter: Arc::new(Semaphore::new(config.max_concurrent_sends)),
            send_timeout: config.send_timeout,
            subscriber_ttl: config.subscriber_ttl,
        }))
    }

    /// Bind and run the receive loop until shutdown
    pub async fn start(config: &UdpConfig, shutdown: watch::Receiver<bool>) -> Result<()> {
        let server = Self::bind(config).await?;
        server.run(shutdown).await
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    pub fn registry(&self) -> &Arc<SubscriberRegistry> {
        &self.registry
    }

    /// Receive loop: handles registrations and acknowledgements.
    ///
    /// Only returns when the shutdown signal fires. Read errors and malformed
    /// datagrams are logged and skipped.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
        let mut sweep = self.subscriber_ttl.map(sweep_interval);

        info!("UDP notification server accepting registrations");

        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("UDP notification server shutting down");
                        break;
                    }
                }
                received = self.socket.recv_from(&mut buf) => {
                    match received {
                        Ok((len, peer)) => self.handle_datagram(&buf[..len], peer).await,
                        Err(e) => {
                            // ICMP errors from earlier sends surface here on some platforms
                            debug!(error = %e, "UDP read error");
                        }
                    }
                }
                _ = tick(&mut sweep) => {
                    if let Some(ttl) = self.subscriber_ttl {
                        for addr in self.registry.expire_older_than(ttl) {
                            info!(peer = %addr, "UDP subscriber expired");
                        }
                    }
                }
            }
        }

        self.registry.clear();
        Ok(())
    }

    async fn handle_datagram(&self, bytes: &[u8], peer: SocketAddr) {
        let message = match UdpMessage::from_bytes(bytes) {
            Ok(message) => message,
            Err(e) => {
                debug!(peer = %peer, error = %e, "dropping malformed datagram");
                return;
            }
        };

        match message {
            UdpMessage::Register => {
                if self.registry.add(peer) {
                    info!(peer = %peer, total = self.registry.len(), "UDP client registered");
                } else {
                    debug!(peer = %peer, "UDP client re-registered");
                }
                self.send_register_ack(peer).await;
            }
            UdpMessage::Ack { id } => {
                debug!(peer = %peer, id = ?id, "notification acknowledged");
            }
            UdpMessage::RegisterAck => {
                debug!(peer = %peer, "ignoring REGISTER_ACK sent to server");
            }
        }
    }

    async fn send_register_ack(&self, peer: SocketAddr) {
        let payload = match UdpMessage::RegisterAck.to_bytes() {
            Ok(payload) => payload,
            Err(e) => {
                warn!(error = %e, "failed to encode REGISTER_ACK");
                return;
            }
        };

        match timeout(self.send_timeout, self.socket.send_to(&payload, peer)).await {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => warn!(peer = %peer, error = %e, "failed to send REGISTER_ACK"),
            Err(_) => warn!(peer = %peer, "timed out sending REGISTER_ACK"),
        }
    }

    /// Fan a notification out to every registered subscriber.
    ///
    /// Assigns a fresh id, encodes once, and sends to a registry snapshot
    /// with bounded concurrency. Returns after every send has completed or
    /// timed out; individual failures are logged and counted only.
    pub async fn broadcast(&self, notification: Notification) -> Result<BroadcastReport> {
        let notification = notification.with_fresh_id();
        let payload: Arc<[u8]> = serde_json::to_vec(&notification)?.into();
        let subscribers = self.registry.snapshot();

        metrics::record_notification_broadcast();
        debug!(
            id = %notification.id,
            kind = %notification.kind,
            subscribers = subscribers.len(),
            "broadcasting notification"
        );

        let subscriber_count = subscribers.len();
        let socket = self.socket.clone();
        let send_timeout = self.send_timeout;

        let summary = dispatch_bounded(subscribers, self.limiter.clone(), |peer| {
            let socket = socket.clone();
            let payload = payload.clone();
            async move {
                match timeout(send_timeout, socket.send_to(&payload, peer)).await {
                    Ok(Ok(_)) => true,
                    Ok(Err(e)) => {
                        warn!(peer = %peer, error = %e, "UDP send failed");
                        metrics::record_send_failure("udp", "io");
                        false
                    }
                    Err(_) => {
                        warn!(peer = %peer, timeout = ?send_timeout, "UDP send timed out");
                        metrics::record_send_failure("udp", "timeout");
                        false
                    }
                }
            }
        })
        .await;

        Ok(BroadcastReport {
            id: notification.id,
            subscribers: subscriber_count,
            delivered: summary.delivered,
            failed: summary.failed,
        })
    }
}

fn sweep_interval(ttl: Duration) -> Interval {
    let period = (ttl / 2).max(Duration::from_secs(1));
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    interval
}

async fn tick(interval: &mut Option<Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sync_events::NotificationKind;

    fn test_config() -> UdpConfig {
        UdpConfig {
            bind_addr: "127.0.0.1:0".to_string(),
            max_concurrent_sends: 4,
            send_timeout: Duration::from_millis(500),
            subscriber_ttl: None,
        }
    }

    #[tokio::test]
    async fn test_broadcast_without_subscribers() {
        let server = NotificationServer::bind(&test_config()).await.unwrap();
        let report = server
            .broadcast(Notification::new(NotificationKind::NewManga, "m1", "hello"))
            .await
            .unwrap();

        assert_eq!(report.subscribers, 0);
        assert_eq!(report.delivered, 0);
        assert!(!report.id.is_empty());
    }

    #[tokio::test]
    async fn test_register_datagram_is_acknowledged() {
        let server = NotificationServer::bind(&test_config()).await.unwrap();
        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let client_addr = client.local_addr().unwrap();

        server
            .handle_datagram(br#"{"type":"REGISTER"}"#, client_addr)
            .await;

        let mut buf = [0u8; 256];
        let (len, from) = timeout(Duration::from_secs(2), client.recv_from(&mut buf))
            .await
            .unwrap()
            .unwrap();

        assert_eq!(from, server.local_addr().unwrap());
        assert_eq!(
            UdpMessage::from_bytes(&buf[..len]).unwrap(),
            UdpMessage::RegisterAck
        );
        assert!(server.registry().contains(client_addr));
    }

    #[tokio::test]
    async fn test_malformed_and_ack_datagrams_do_not_register() {
        let server = NotificationServer::bind(&test_config()).await.unwrap();
        let peer = SocketAddr::from(([127, 0, 0, 1], 9));

        server.handle_datagram(b"REGISTER", peer).await;
        server.handle_datagram(br#"{"type":"ACK","id":"x"}"#, peer).await;
        server.handle_datagram(&[0xff, 0xfe], peer).await;

        assert!(server.registry().is_empty());
    }

    #[tokio::test]
    async fn test_broadcast_sends_only_under_the_server_limiter() {
        let server = NotificationServer::bind(&UdpConfig {
            max_concurrent_sends: 2,
            ..test_config()
        })
        .await
        .unwrap();
        assert_eq!(server.limiter.available_permits(), 2);

        let mut subscribers = Vec::new();
        for _ in 0..8 {
            let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
            server.registry().add(socket.local_addr().unwrap());
            subscribers.push(socket);
        }

        // With every permit taken, nothing may leave the server
        let held = server.limiter.clone().acquire_many_owned(2).await.unwrap();
        let broadcast = {
            let server = server.clone();
            tokio::spawn(async move {
                server
                    .broadcast(Notification::new(NotificationKind::NewChapter, "m1", "ch 2"))
                    .await
            })
        };

        let mut buf = [0u8; MAX_DATAGRAM_SIZE];
        tokio::time::sleep(Duration::from_millis(50)).await;
        for socket in &subscribers {
            assert!(timeout(Duration::from_millis(10), socket.recv_from(&mut buf))
                .await
                .is_err());
        }
        assert!(!broadcast.is_finished());

        drop(held);
        let report = timeout(Duration::from_secs(2), broadcast)
            .await
            .unwrap()
            .unwrap()
            .unwrap();

        assert_eq!(report.subscribers, 8);
        assert_eq!(report.delivered, 8);
        for socket in &subscribers {
            let (len, _) = timeout(Duration::from_secs(1), socket.recv_from(&mut buf))
                .await
                .unwrap()
                .unwrap();
            let received: Notification = serde_json::from_slice(&buf[..len]).unwrap();
            assert_eq!(received.id, report.id);
        }
        assert_eq!(server.limiter.available_permits(), 2);
    }

    #[tokio::test]
    async fn test_bind_failure_is_reported() {
        let first = NotificationServer::bind(&test_config()).await.unwrap();
        let taken = first.local_addr().unwrap().to_string();

        let result = NotificationServer::bind(&UdpConfig {
            bind_addr: taken,
            ..test_config()
        })
        .await;

        assert!(matches!(result, Err(AppError::Bind { .. })));
    }
}
