/// Connection registry and replay backlog
///
/// Both live behind one mutex so that "append to backlog + snapshot
/// connections" and "register connection + copy backlog" are atomic with
/// respect to each other. That is what guarantees a new connection sees
/// every event exactly once: either in its replay, or in a later broadcast
/// snapshot, never both and never neither.
///
/// The lock is never held across I/O.
use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;

use super::connection::{Connection, ConnectionId};

#[derive(Default)]
struct Inner {
    connections: HashMap<SocketAddr, Arc<Connection>>,
    backlog: VecDeque<Arc<str>>,
}

pub struct ConnectionRegistry {
    inner: Mutex<Inner>,
    backlog_capacity: usize,
}

impl ConnectionRegistry {
    pub fn new(backlog_capacity: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                connections: HashMap::new(),
                backlog: VecDeque::with_capacity(backlog_capacity),
            }),
            backlog_capacity,
        }
    }

    /// Register a connection and return the backlog it must be replayed.
    ///
    /// Returns `None` without registering if a connection from the same
    /// address is already present.
    pub fn add(&self, conn: Arc<Connection>) -> Option<Vec<Arc<str>>> {
        let mut inner = self.inner.lock();
        if inner.connections.contains_key(&conn.addr()) {
            return None;
        }

        inner.connections.insert(conn.addr(), conn);
        Some(inner.backlog.iter().cloned().collect())
    }

    /// Remove the connection registered under `addr`, but only if it is the
    /// same connection instance (`id`) the caller is holding.
    pub fn remove(&self, addr: SocketAddr, id: ConnectionId) -> Option<Arc<Connection>> {
        let mut inner = self.inner.lock();
        let matches = inner
            .connections
            .get(&addr)
            .map(|c| c.id() == id)
            .unwrap_or(false);
        if !matches {
            return None;
        }

        inner.connections.remove(&addr)
    }

    /// Point-in-time copy of all connections, oldest first
    pub fn snapshot(&self) -> Vec<Arc<Connection>> {
        let inner = self.inner.lock();
        sorted(inner.connections.values().cloned().collect())
    }

    /// Append an encoded event to the backlog and return the connections it
    /// must be delivered to.
    pub fn record_event(&self, line: Arc<str>) -> Vec<Arc<Connection>> {
        let mut inner = self.inner.lock();
        while inner.backlog.len() >= self.backlog_capacity {
            inner.backlog.pop_front();
        }
        inner.backlog.push_back(line);
        sorted(inner.connections.values().cloned().collect())
    }

    /// Remove every connection idle for longer than `threshold`
    pub fn remove_stale(&self, threshold: Duration) -> Vec<Arc<Connection>> {
        let now = Instant::now();
        let mut inner = self.inner.lock();

        let stale: Vec<SocketAddr> = inner
            .connections
            .iter()
            .filter(|(_, conn)| conn.idle_for(now) > threshold)
            .map(|(addr, _)| *addr)
            .collect();

        let removed: Vec<Arc<Connection>> = stale
            .iter()
            .filter_map(|addr| inner.connections.remove(addr))
            .collect();
        sorted(removed)
    }

    /// Remove and return every connection
    pub fn drain(&self) -> Vec<Arc<Connection>> {
        let mut inner = self.inner.lock();
        let all = inner.connections.drain().map(|(_, c)| c).collect();
        sorted(all)
    }

    pub fn backlog(&self) -> Vec<Arc<str>> {
        self.inner.lock().backlog.iter().cloned().collect()
    }

    pub fn backlog_len(&self) -> usize {
        self.inner.lock().backlog.len()
    }

    pub fn backlog_capacity(&self) -> usize {
        self.backlog_capacity
    }

    pub fn contains(&self, addr: SocketAddr) -> bool {
        self.inner.lock().connections.contains_key(&addr)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().connections.is_empty()
    }
}

fn sorted(mut connections: Vec<Arc<Connection>>) -> Vec<Arc<Connection>> {
    connections.sort_by_key(|c| c.id());
    connections
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::{TcpListener, TcpStream};

    /// Returns a server-side connection plus the client stream keeping it open
    async fn make_connection(id: ConnectionId) -> (Arc<Connection>, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let client = TcpStream::connect(listener.local_addr().unwrap())
            .await
            .unwrap();
        let (server_side, peer) = listener.accept().await.unwrap();
        let (_read, write) = server_side.into_split();
        (Arc::new(Connection::new(id, peer, write)), client)
    }

    fn event(n: usize) -> Arc<str> {
        Arc::from(format!("event-{n}"))
    }

    #[tokio::test]
    async fn test_add_returns_backlog_and_is_idempotent() {
        let registry = ConnectionRegistry::new(4);
        registry.record_event(event(1));
        registry.record_event(event(2));

        let (conn, _client) = make_connection(1).await;
        let replay = registry.add(conn.clone()).unwrap();
        assert_eq!(replay, vec![event(1), event(2)]);

        assert!(registry.add(conn).is_none());
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn test_backlog_evicts_oldest() {
        let registry = ConnectionRegistry::new(3);
        for n in 1..=4 {
            registry.record_event(event(n));
        }

        assert_eq!(registry.backlog_len(), 3);
        assert_eq!(registry.backlog(), vec![event(2), event(3), event(4)]);
    }

    #[tokio::test]
    async fn test_backlog_never_exceeds_capacity() {
        let registry = ConnectionRegistry::new(5);
        for n in 0..100 {
            registry.record_event(event(n));
            assert!(registry.backlog_len() <= 5);
        }
        assert_eq!(registry.backlog().last(), Some(&event(99)));
    }

    #[tokio::test]
    async fn test_record_event_snapshots_current_connections() {
        let registry = ConnectionRegistry::new(2);
        let (a, _ca) = make_connection(1).await;
        let (b, _cb) = make_connection(2).await;
        registry.add(b.clone());
        registry.add(a.clone());

        let targets = registry.record_event(event(1));
        let ids: Vec<_> = targets.iter().map(|c| c.id()).collect();
        assert_eq!(ids, vec![1, 2]);
    }

    #[tokio::test]
    async fn test_remove_requires_matching_id() {
        let registry = ConnectionRegistry::new(2);
        let (conn, _client) = make_connection(7).await;
        let addr = conn.addr();
        registry.add(conn);

        assert!(registry.remove(addr, 8).is_none());
        assert!(registry.contains(addr));

        assert!(registry.remove(addr, 7).is_some());
        assert!(registry.remove(addr, 7).is_none());
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_remove_stale() {
        let registry = ConnectionRegistry::new(2);
        let (idle, _ci) = make_connection(1).await;
        let (active, _ca) = make_connection(2).await;
        registry.add(idle.clone());
        registry.add(active.clone());

        tokio::time::sleep(Duration::from_millis(60)).await;
        active.touch();

        let stale = registry.remove_stale(Duration::from_millis(30));
        assert_eq!(stale.len(), 1);
        assert_eq!(stale[0].id(), 1);
        assert!(!registry.contains(idle.addr()));
        assert!(registry.contains(active.addr()));
    }

    #[tokio::test]
    async fn test_drain() {
        let registry = ConnectionRegistry::new(2);
        let (a, _ca) = make_connection(1).await;
        let (b, _cb) = make_connection(2).await;
        registry.add(a);
        registry.add(b);

        assert_eq!(registry.drain().len(), 2);
        assert!(registry.is_empty());
    }
}
