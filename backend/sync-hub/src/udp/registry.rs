/// Registry of UDP notification subscribers
///
/// Membership is keyed by the peer's socket address. All reads and writes go
/// through a single mutex that is only ever held for in-memory work; callers
/// that need to talk to the network take a `snapshot()` first.
use std::net::SocketAddr;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;


#[derive(Debug, Clone)]
struct Subscriber {
    addr: SocketAddr,
    last_seen: Instant,
}

#[derive(Debug, Default)]
pub struct SubscriberRegistry {
    subscribers: Mutex<Vec<Subscriber>>,
}

impl SubscriberRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a subscriber.
    ///
    /// Returns `true` if the address was not registered before. Registering
    /// an existing address only refreshes its last-seen time.
    pub fn add(&self, addr: SocketAddr) -> bool {
        let now = Instant::now();
        let mut subscribers = self.subscribers.lock();

        if let Some(existing) = subscribers.iter_mut().find(|s| s.addr == addr) {
            existing.last_seen = now;
            return false;
        }

        subscribers.push(Subscriber {
            addr,
            last_seen: now,
        });
        true
    }

    pub fn remove(&self, addr: SocketAddr) -> bool {
        let mut subscribers = self.subscribers.lock();
        let before = subscribers.len();
        subscribers.retain(|s| s.addr != addr);
        subscribers.len() != before
    }

    /// Point-in-time copy of all subscriber addresses, in registration order
    pub fn snapshot(&self) -> Vec<SocketAddr> {
        self.subscribers.lock().iter().map(|s| s.addr).collect()
    }

    pub fn contains(&self, addr: SocketAddr) -> bool {
        self.subscribers.lock().iter().any(|s| s.addr == addr)
    }

    pub fn len(&self) -> usize {
        self.subscribers.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.subscribers.lock().is_empty()
    }

    /// Drop subscribers not seen within `ttl`, returning the removed addresses
    pub fn expire_older_than(&self, ttl: Duration) -> Vec<SocketAddr> {
        let now = Instant::now();
        let mut subscribers = self.subscribers.lock();
        let mut expired = Vec::new();

        subscribers.retain(|s| {
            if now.duration_since(s.last_seen) > ttl {
                expired.push(s.addr);
                false
            } else {
                true
            }
        });

        expired
    }

    pub fn clear(&self) {
        self.subscribers.lock().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    #[test]
    fn test_add_is_idempotent() {
        let registry = SubscriberRegistry::new();

        assert!(registry.add(addr(4000)));
        for _ in 0..5 {
            assert!(!registry.add(addr(4000)));
        }

        assert_eq!(registry.len(), 1);
        assert_eq!(registry.snapshot(), vec![addr(4000)]);
    }

    #[test]
    fn test_same_host_different_port_is_distinct() {
        let registry = SubscriberRegistry::new();
        registry.add(addr(4000));
        registry.add(addr(4001));
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn test_snapshot_preserves_registration_order() {
        let registry = SubscriberRegistry::new();
        for port in [4003, 4001, 4002] {
            registry.add(addr(port));
        }
        assert_eq!(registry.snapshot(), vec![addr(4003), addr(4001), addr(4002)]);
    }

    #[test]
    fn test_snapshot_is_a_copy() {
        let registry = SubscriberRegistry::new();
        registry.add(addr(4000));

        let snapshot = registry.snapshot();
        registry.add(addr(4001));
        registry.remove(addr(4000));

        assert_eq!(snapshot, vec![addr(4000)]);
        assert_eq!(registry.snapshot(), vec![addr(4001)]);
    }

    #[test]
    fn test_remove() {
        let registry = SubscriberRegistry::new();
        registry.add(addr(4000));

        assert!(registry.remove(addr(4000)));
        assert!(!registry.remove(addr(4000)));
        assert!(registry.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_expiry_respects_reregistration() {
        let registry = SubscriberRegistry::new();
        registry.add(addr(4000));
        registry.add(addr(4001));

        tokio::time::advance(Duration::from_secs(40)).await;
        registry.add(addr(4001));
        tokio::time::advance(Duration::from_secs(30)).await;

        let expired = registry.expire_older_than(Duration::from_secs(60));
        assert_eq!(expired, vec![addr(4000)]);
        assert!(registry.contains(addr(4001)));
    }
}
