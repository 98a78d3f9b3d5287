//! Registry of live connection tasks.
//!
//! Applications keep their `TcpTask`s here to look them up by slot, count
//! them, and broadcast to them. Slots are handed out before the task is
//! built so the task's handler can remember where it lives.

use crate::runtime::task::TcpTask;
use slab::Slab;
use std::sync::Arc;

/// Slab-backed registry of connection tasks with a fixed capacity.
///
/// Provides O(1) insert, lookup, and remove operations.
#[derive(Debug)]
pub struct ConnectionRegistry {
    connections: Slab<Arc<TcpTask>>,
    max_connections: usize,
}

impl ConnectionRegistry {
    /// Create a new registry with specified maximum capacity.
    pub fn new(max_connections: usize) -> Self {
        Self {
            connections: Slab::with_capacity(max_connections),
            max_connections,
        }
    }

    /// Insert a task built by `build`, which receives the slot it will occupy.
    ///
    /// Returns `None` (without calling `build`) if the registry is full.
    pub fn insert_with<F>(&mut self, build: F) -> Option<(usize, Arc<TcpTask>)>
    where
        F: FnOnce(usize) -> Arc<TcpTask>,
    {
        if self.connections.len() >= self.max_connections {
            return None;
        }
        let entry = self.connections.vacant_entry();
        let slot = entry.key();
        let task = build(slot);
        entry.insert(Arc::clone(&task));
        Some((slot, task))
    }

    pub fn get(&self, slot: usize) -> Option<&Arc<TcpTask>> {
        self.connections.get(slot)
    }

    /// Remove a task from the registry.
    pub fn remove(&mut self, slot: usize) -> Option<Arc<TcpTask>> {
        self.connections.try_remove(slot)
    }

    pub fn contains(&self, slot: usize) -> bool {
        self.connections.contains(slot)
    }

    /// Number of registered tasks.
    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    /// Maximum number of tasks allowed.
    pub fn capacity(&self) -> usize {
        self.max_connections
    }

    /// Iterate over all registered tasks.
    pub fn iter(&self) -> impl Iterator<Item = (usize, &Arc<TcpTask>)> {
        self.connections.iter()
    }

    /// Queue a frame on every open task. Returns how many accepted it.
    pub fn broadcast(&self, flag: u8, payload: &[u8]) -> usize {
        self.connections
            .iter()
            .filter(|(_, task)| task.send_frame(flag, payload))
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::task::{TaskConfig, TaskHandler};
    use tokio::net::{TcpListener, TcpStream};

    struct Noop;

    impl TaskHandler for Noop {
        fn parse_msg(&self, _task: &TcpTask, _frame: &[u8]) -> bool {
            true
        }

        fn on_close(&self, _task: &TcpTask) {}
    }

    async fn task() -> (Arc<TcpTask>, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let client = TcpStream::connect(listener.local_addr().unwrap()).await.unwrap();
        let (server, _) = listener.accept().await.unwrap();
        (TcpTask::new(server, Arc::new(Noop), TaskConfig::default()), client)
    }

    #[tokio::test]
    async fn test_connection_registry() {
        let mut registry = ConnectionRegistry::new(2);
        let (t1, _c1) = task().await;
        let (t2, _c2) = task().await;
        let (t3, _c3) = task().await;

        let mut seen_slot = None;
        let (id1, _) = registry
            .insert_with(|slot| {
                seen_slot = Some(slot);
                t1
            })
            .unwrap();
        assert_eq!(seen_slot, Some(id1));

        let (id2, _) = registry.insert_with(|_| t2).unwrap();

        // At capacity
        assert!(registry.insert_with(|_| t3).is_none());

        assert_eq!(registry.len(), 2);
        assert_eq!(registry.capacity(), 2);
        assert!(registry.get(id2).is_some());

        registry.remove(id1);
        assert!(!registry.contains(id1));
        assert!(registry.remove(id1).is_none());
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.iter().count(), 1);
    }

    #[tokio::test]
    async fn test_broadcast_skips_unstarted() {
        let mut registry = ConnectionRegistry::new(4);
        let (open, _c1) = task().await;
        let (idle, _c2) = task().await;
        assert!(open.start());

        registry.insert_with(|_| open).unwrap();
        registry.insert_with(|_| idle).unwrap();

        assert_eq!(registry.broadcast(0, b"hi"), 1);
    }
}
