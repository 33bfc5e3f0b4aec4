use super::{
    backoff::RetryPolicy, manager::ConnectionManager, ConnectionConfig, ConnectionEvent,
    ConnectionId,
};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info};
use url::Url;

/// Set of [`ConnectionManager`]s owned by one adapter.
///
/// A single connection carries up to `max_streams` logical streams; the pool
/// grows once that cap is reached. Idle secondary connections (zero assigned
/// streams, untouched for `idle_timeout`) are closed by [`sweep_idle`].
///
/// [`sweep_idle`]: ConnectionPool::sweep_idle
#[derive(Debug)]
pub struct ConnectionPool {
    base_url: Url,
    config: ConnectionConfig,
    retry: RetryPolicy,
    events: mpsc::UnboundedSender<ConnectionEvent>,
    next_id: u64,
    connections: Vec<PooledConnection>,
}

#[derive(Debug)]
struct PooledConnection {
    manager: ConnectionManager,
    assigned_streams: usize,
    last_used: Instant,
}

impl ConnectionPool {
    pub fn new(
        base_url: Url,
        config: ConnectionConfig,
        retry: RetryPolicy,
        events: mpsc::UnboundedSender<ConnectionEvent>,
    ) -> Self {
        Self {
            base_url,
            config,
            retry,
            events,
            next_id: 0,
            connections: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    pub fn get(&self, id: ConnectionId) -> Option<&ConnectionManager> {
        self.connections
            .iter()
            .find(|pooled| pooled.manager.id() == id)
            .map(|pooled| &pooled.manager)
    }

    /// Pick the connection for a new stream assignment, spawning a fresh one
    /// when every existing connection is at its stream cap.
    pub fn assign_stream(&mut self) -> &ConnectionManager {
        let position = self
            .connections
            .iter()
            .position(|pooled| pooled.assigned_streams < self.config.max_streams);

        let position = match position {
            Some(position) => position,
            None => {
                let id = ConnectionId(self.next_id);
                self.next_id += 1;
                info!(connection = %id, "spawning additional pooled connection");

                let manager = ConnectionManager::spawn(
                    id,
                    self.base_url.clone(),
                    self.config,
                    self.retry,
                    self.events.clone(),
                );
                self.connections.push(PooledConnection {
                    manager,
                    assigned_streams: 0,
                    last_used: Instant::now(),
                });
                self.connections.len() - 1
            }
        };

        let pooled = &mut self.connections[position];
        pooled.assigned_streams += 1;
        pooled.last_used = Instant::now();
        &pooled.manager
    }

    /// Release one stream assignment from the identified connection.
    pub fn release_stream(&mut self, id: ConnectionId) {
        if let Some(pooled) = self
            .connections
            .iter_mut()
            .find(|pooled| pooled.manager.id() == id)
        {
            pooled.assigned_streams = pooled.assigned_streams.saturating_sub(1);
            pooled.last_used = Instant::now();
        }
    }

    /// Number of streams currently assigned to the identified connection.
    pub fn assigned_streams(&self, id: ConnectionId) -> usize {
        self.connections
            .iter()
            .find(|pooled| pooled.manager.id() == id)
            .map_or(0, |pooled| pooled.assigned_streams)
    }

    /// Close pooled connections that are idle: no assigned streams and not
    /// used within the idle timeout. The primary (first) connection is kept.
    pub async fn sweep_idle(&mut self) {
        let idle_timeout = self.config.idle_timeout();
        let mut index = self.connections.len();

        while index > 1 {
            index -= 1;
            let pooled = &self.connections[index];
            if pooled.assigned_streams == 0 && pooled.last_used.elapsed() >= idle_timeout {
                let pooled = self.connections.remove(index);
                debug!(connection = %pooled.manager.id(), "closing idle pooled connection");
                let _ = pooled.manager.close().await;
            }
        }
    }

    /// Close every pooled connection, in reverse creation order.
    pub async fn close_all(&mut self) {
        while let Some(pooled) = self.connections.pop() {
            let _ = pooled.manager.close().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_pool(max_streams: usize) -> ConnectionPool {
        let (event_tx, _event_rx) = mpsc::unbounded_channel();
        let config = ConnectionConfig {
            max_streams,
            auto_manage_streams: false,
            idle_timeout_ms: 0,
            ..ConnectionConfig::default()
        };
        ConnectionPool::new(
            Url::parse("ws://127.0.0.1:9").unwrap(),
            config,
            RetryPolicy::default(),
            event_tx,
        )
    }

    #[tokio::test]
    async fn test_assign_stream_grows_pool_at_cap() {
        let mut pool = test_pool(2);
        assert!(pool.is_empty());

        let first = pool.assign_stream().id();
        let second = pool.assign_stream().id();
        assert_eq!(first, second);
        assert_eq!(pool.len(), 1);
        assert_eq!(pool.assigned_streams(first), 2);

        // Third stream exceeds the per-connection cap.
        let third = pool.assign_stream().id();
        assert_ne!(first, third);
        assert_eq!(pool.len(), 2);

        pool.close_all().await;
        assert!(pool.is_empty());
    }

    #[tokio::test]
    async fn test_release_stream_frees_capacity() {
        let mut pool = test_pool(1);

        let first = pool.assign_stream().id();
        pool.release_stream(first);
        assert_eq!(pool.assigned_streams(first), 0);

        // Freed capacity is reused instead of growing the pool.
        let reused = pool.assign_stream().id();
        assert_eq!(first, reused);
        assert_eq!(pool.len(), 1);

        pool.close_all().await;
    }

    #[tokio::test]
    async fn test_sweep_idle_keeps_primary() {
        let mut pool = test_pool(1);

        let first = pool.assign_stream().id();
        let second = pool.assign_stream().id();
        pool.release_stream(first);
        pool.release_stream(second);
        assert_eq!(pool.len(), 2);

        // idle_timeout_ms = 0 so both are immediately idle; only the
        // secondary is swept.
        pool.sweep_idle().await;
        assert_eq!(pool.len(), 1);
        assert!(pool.get(first).is_some());

        pool.close_all().await;
    }
}
