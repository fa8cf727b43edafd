/// Subscriber side of the UDP notification protocol
///
/// Keeps re-sending `REGISTER` until the server answers with `REGISTER_ACK`,
/// then yields notifications as they arrive. Datagrams that are not
/// notifications (late `REGISTER_ACK`s, garbage) are skipped.
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::Duration;

use sync_events::{Notification, UdpMessage};
use tokio::net::UdpSocket;
use tokio::time::{timeout, Instant};
use tracing::{debug, info};

use crate::error::{AppError, Result};

const RECV_BUFFER_SIZE: usize = 2048;

pub struct NotificationSubscriber {
    socket: UdpSocket,
    server: SocketAddr,
}

impl NotificationSubscriber {
    /// Open an ephemeral socket connected to the notification server
    pub async fn connect(server: SocketAddr) -> Result<Self> {
        let local: SocketAddr = if server.is_ipv4() {
            (Ipv4Addr::UNSPECIFIED, 0).into()
        } else {
            (Ipv6Addr::UNSPECIFIED, 0).into()
        };

        let socket = UdpSocket::bind(local)
            .await
            .map_err(|e| AppError::bind(local.to_string(), e))?;
        socket.connect(server).await?;

        Ok(Self { socket, server })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    /// Register with the server, retrying every `retry_every` until
    /// acknowledged or `deadline` has passed.
    pub async fn register(&self, retry_every: Duration, deadline: Duration) -> Result<()> {
        let register = UdpMessage::Register.to_bytes()?;
        let give_up_at = Instant::now() + deadline;
        let mut buf = [0u8; RECV_BUFFER_SIZE];

        while Instant::now() < give_up_at {
            self.socket.send(&register).await?;

            let wait_until = (Instant::now() + retry_every).min(give_up_at);
            while let Ok(received) =
                tokio::time::timeout_at(wait_until, self.socket.recv(&mut buf)).await
            {
                let len = match received {
                    Ok(len) => len,
                    Err(e) => {
                        debug!(error = %e, "read error while registering");
                        tokio::time::sleep_until(wait_until).await;
                        break;
                    }
                };

                if matches!(UdpMessage::from_bytes(&buf[..len]), Ok(UdpMessage::RegisterAck)) {
                    info!(server = %self.server, "registered for notifications");
                    return Ok(());
                }
            }
        }

        Err(AppError::RegistrationUnacknowledged(self.server))
    }

    /// Wait for the next notification
    pub async fn recv(&self) -> Result<Notification> {
        let mut buf = [0u8; RECV_BUFFER_SIZE];
        loop {
            let len = self.socket.recv(&mut buf).await?;
            match serde_json::from_slice::<Notification>(&buf[..len]) {
                Ok(notification) => return Ok(notification),
                Err(_) => debug!(len, "skipping non-notification datagram"),
            }
        }
    }

    /// Wait for the next notification, giving up after `limit`
    pub async fn recv_timeout(&self, limit: Duration) -> Result<Notification> {
        timeout(limit, self.recv())
            .await
            .map_err(|_| AppError::Timeout(limit))?
    }

    /// Acknowledge a received notification
    pub async fn ack(&self, id: &str) -> Result<()> {
        let payload = UdpMessage::ack(id).to_bytes()?;
        self.socket.send(&payload).await?;
        Ok(())
    }
}
