//! Per-chat advisory locks.
//!
//! A second turn on the same chat waits until the first one has finished, so
//! the two never interleave their writes.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

#[derive(Debug, Default)]
pub struct ChatLocks {
    inner: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

impl ChatLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive access to `chat_id`. Released when the guard drops.
    pub async fn acquire(&self, chat_id: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut map = self.inner.lock().unwrap_or_else(|e| e.into_inner());
            // Drop entries nobody holds or waits on.
            map.retain(|id, lock| id == chat_id || Arc::strong_count(lock) > 1);
            Arc::clone(map.entry(chat_id.to_string()).or_default())
        };
        lock.lock_owned().await
    }

    pub fn len(&self) -> usize {
        self.inner.lock().map(|m| m.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_same_chat_is_serialized() {
        let locks = Arc::new(ChatLocks::new());
        let guard = locks.acquire("chat-1").await;

        let waiter = {
            let locks = Arc::clone(&locks);
            tokio::spawn(async move {
                let _g = locks.acquire("chat-1").await;
            })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!waiter.is_finished());

        drop(guard);
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_different_chats_do_not_block() {
        let locks = ChatLocks::new();
        let _a = locks.acquire("chat-a").await;
        let b = tokio::time::timeout(Duration::from_millis(200), locks.acquire("chat-b")).await;
        assert!(b.is_ok());
    }

    #[tokio::test]
    async fn test_released_entries_are_pruned() {
        let locks = ChatLocks::new();
        drop(locks.acquire("chat-a").await);
        drop(locks.acquire("chat-b").await);
        assert_eq!(locks.len(), 1);
    }
}
