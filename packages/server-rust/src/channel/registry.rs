//! Live channel registry for the accept loop.
//!
//! Lock-free concurrent tracking via `DashMap`, so pumps can deregister
//! themselves while shutdown enumerates what is left.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use dashmap::DashMap;

use super::transport::{Channel, ChannelShape};

/// Unique identifier for an accepted channel, assigned by the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChannelId(pub u64);

/// A live channel and its accept-time metadata.
#[derive(Debug)]
pub struct ChannelHandle {
    pub id: ChannelId,
    pub channel: Arc<dyn Channel>,
    pub shape: ChannelShape,
    pub session_id: Option<String>,
    pub accepted_at: Instant,
}

/// Thread-safe set of live channels.
#[derive(Debug)]
pub struct ChannelRegistry {
    channels: DashMap<ChannelId, Arc<ChannelHandle>>,
    next_id: AtomicU64,
}

impl ChannelRegistry {
    /// Channel IDs start at 1.
    #[must_use]
    pub fn new() -> Self {
        Self {
            channels: DashMap::new(),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn register(&self, channel: Arc<dyn Channel>) -> Arc<ChannelHandle> {
        let id = ChannelId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let handle = Arc::new(ChannelHandle {
            id,
            shape: channel.shape(),
            session_id: channel.session_id().map(str::to_string),
            channel,
            accepted_at: Instant::now(),
        });
        self.channels.insert(id, Arc::clone(&handle));
        handle
    }

    pub fn remove(&self, id: ChannelId) -> Option<Arc<ChannelHandle>> {
        self.channels.remove(&id).map(|(_, handle)| handle)
    }

    #[must_use]
    pub fn get(&self, id: ChannelId) -> Option<Arc<ChannelHandle>> {
        self.channels.get(&id).map(|r| r.value().clone())
    }

    #[must_use]
    pub fn count(&self) -> usize {
        self.channels.len()
    }

    #[must_use]
    pub fn count_by_shape(&self, shape: ChannelShape) -> usize {
        self.channels
            .iter()
            .filter(|entry| entry.value().shape == shape)
            .count()
    }

    /// Snapshot of all live channels.
    #[must_use]
    pub fn channels(&self) -> Vec<Arc<ChannelHandle>> {
        self.channels
            .iter()
            .map(|entry| entry.value().clone())
            .collect()
    }

    /// Removes and returns all channels. Used during shutdown.
    pub fn drain_all(&self) -> Vec<Arc<ChannelHandle>> {
        let keys: Vec<ChannelId> = self.channels.iter().map(|entry| *entry.key()).collect();

        let mut handles = Vec::with_capacity(keys.len());
        for key in keys {
            if let Some((_, handle)) = self.channels.remove(&key) {
                handles.push(handle);
            }
        }
        handles
    }
}

impl Default for ChannelRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::memory::MemoryListener;
    use crate::channel::transport::ChannelListener;

    async fn channel(
        listener: &MemoryListener,
        shape: ChannelShape,
        session: Option<&str>,
    ) -> (Arc<dyn Channel>, crate::channel::memory::MemoryClient) {
        let client = listener.connector().connect(shape, session).unwrap();
        let channel = listener.accept_channel().await.unwrap().unwrap();
        (channel, client)
    }

    async fn open_listener() -> MemoryListener {
        let listener = MemoryListener::new("mem://host/svc");
        listener
            .open(std::time::Duration::from_secs(1))
            .await
            .unwrap();
        listener
    }

    #[tokio::test]
    async fn register_assigns_sequential_ids() {
        let listener = open_listener().await;
        let registry = ChannelRegistry::new();
        let (a, _ca) = channel(&listener, ChannelShape::Reply, None).await;
        let (b, _cb) = channel(&listener, ChannelShape::Duplex, Some("s1")).await;

        let ha = registry.register(a);
        let hb = registry.register(b);
        assert_eq!(ha.id, ChannelId(1));
        assert_eq!(hb.id, ChannelId(2));
        assert_eq!(hb.session_id.as_deref(), Some("s1"));
        assert_eq!(registry.count(), 2);
    }

    #[tokio::test]
    async fn remove_and_get() {
        let listener = open_listener().await;
        let registry = ChannelRegistry::new();
        let (a, _ca) = channel(&listener, ChannelShape::Reply, None).await;
        let id = registry.register(a).id;

        assert_eq!(registry.get(id).unwrap().id, id);
        assert!(registry.remove(id).is_some());
        assert!(registry.remove(id).is_none());
        assert!(registry.get(ChannelId(999)).is_none());
    }

    #[tokio::test]
    async fn count_by_shape_and_drain() {
        let listener = open_listener().await;
        let registry = ChannelRegistry::new();
        let mut clients = Vec::new();
        for shape in [ChannelShape::Reply, ChannelShape::Reply, ChannelShape::Input] {
            let (ch, client) = channel(&listener, shape, None).await;
            clients.push(client);
            registry.register(ch);
        }
        assert_eq!(registry.count_by_shape(ChannelShape::Reply), 2);
        assert_eq!(registry.count_by_shape(ChannelShape::Input), 1);
        assert_eq!(registry.channels().len(), 3);

        assert_eq!(registry.drain_all().len(), 3);
        assert_eq!(registry.count(), 0);
    }
}
