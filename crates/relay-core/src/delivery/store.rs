//! Message body store for fetch-pointer delivery

use crate::errors::RelayError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use serde_json::Value;
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StoredBody {
    pub id: String,
    pub content: String,
    pub metadata: Value,
    pub stored_at: DateTime<Utc>,
}

#[async_trait]
pub trait MessageBodyStore: Send + Sync {
    async fn store(&self, id: &str, content: &str, metadata: Value) -> Result<(), RelayError>;

    /// `None` once the entry is unknown or expired.
    async fn fetch(&self, id: &str) -> Option<StoredBody>;

    /// Drop expired entries, returning how many were removed.
    async fn purge_expired(&self) -> usize;
}

/// Process-local store with a fixed TTL per entry.
pub struct InMemoryBodyStore {
    entries: DashMap<String, (StoredBody, Instant)>,
    ttl: Duration,
}

impl InMemoryBodyStore {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            ttl,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[async_trait]
impl MessageBodyStore for InMemoryBodyStore {
    async fn store(&self, id: &str, content: &str, metadata: Value) -> Result<(), RelayError> {
        let body = StoredBody {
            id: id.to_string(),
            content: content.to_string(),
            metadata,
            stored_at: Utc::now(),
        };
        self.entries
            .insert(id.to_string(), (body, Instant::now() + self.ttl));
        Ok(())
    }

    async fn fetch(&self, id: &str) -> Option<StoredBody> {
        let now = Instant::now();
        let expired = match self.entries.get(id) {
            Some(entry) if now < entry.1 => return Some(entry.0.clone()),
            Some(_) => true,
            None => false,
        };
        if expired {
            self.entries.remove_if(id, |_, (_, expires_at)| now >= *expires_at);
        }
        None
    }

    async fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.entries.len();
        self.entries.retain(|_, (_, expires_at)| now < *expires_at);
        before.saturating_sub(self.entries.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test(start_paused = true)]
    async fn test_round_trip_until_ttl() {
        let store = InMemoryBodyStore::new(Duration::from_secs(60));
        let content = "ünïcödé body\nwith lines and a very long tail ".repeat(200);
        store
            .store("b1", &content, json!({"session_id": "s1"}))
            .await
            .unwrap();

        tokio::time::advance(Duration::from_secs(59)).await;
        let fetched = store.fetch("b1").await.unwrap();
        assert_eq!(fetched.content, content);
        assert_eq!(fetched.metadata["session_id"], "s1");

        tokio::time::advance(Duration::from_secs(1)).await;
        assert!(store.fetch("b1").await.is_none());
        assert!(store.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_purge_expired() {
        let store = InMemoryBodyStore::new(Duration::from_secs(10));
        store.store("old", "a", Value::Null).await.unwrap();
        tokio::time::advance(Duration::from_secs(6)).await;
        store.store("new", "b", Value::Null).await.unwrap();
        tokio::time::advance(Duration::from_secs(5)).await;

        assert_eq!(store.purge_expired().await, 1);
        assert!(store.fetch("new").await.is_some());
        assert!(store.fetch("missing").await.is_none());
    }
}
