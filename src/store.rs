//! Outstanding request-ID tracking for `InResponseTo` correlation.
//!
//! The engine never owns this state. Callers inject a `RequestIdStore`; the
//! `MemoryRequestIdStore` here is suitable for development and single-node
//! deployments. For multi-node deployments, back the trait with a shared
//! cache or database so a response can land on any node.

use std::{collections::HashMap, sync::Arc};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

/// Result type for request-ID store operations.
pub type StoreResult<T> = Result<T, StoreError>;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Backend error: {0}")]
    Backend(String),
}

/// The flow a request ID was issued for. A response is only correlated with
/// a request of the matching kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RequestKind {
    /// `AuthnRequest`, answered by a `Response` at the ACS.
    Authn,
    /// `LogoutRequest`, answered by a `LogoutResponse` at the SLS.
    Logout,
}

/// Storage for request IDs the SP has issued and not yet seen answered.
#[async_trait]
pub trait RequestIdStore: Send + Sync {
    /// Record an issued request ID, valid until `expires_at`.
    async fn put(&self, id: &str, kind: RequestKind, expires_at: DateTime<Utc>) -> StoreResult<()>;

    /// Whether `id` is outstanding for `kind` and not expired.
    async fn exists(&self, id: &str, kind: RequestKind) -> StoreResult<bool>;

    /// Consume `id` if it is outstanding for `kind` and not expired,
    /// returning whether it was. Check and removal must be a single atomic
    /// step so that one request ID can be answered only once, even when
    /// the same response is submitted concurrently.
    async fn take(&self, id: &str, kind: RequestKind) -> StoreResult<bool>;

    /// Drop expired entries.
    async fn cleanup(&self) -> StoreResult<()> {
        Ok(())
    }
}

pub type SharedRequestIdStore = Arc<dyn RequestIdStore>;

#[derive(Debug, Clone, Copy)]
struct Outstanding {
    kind: RequestKind,
    expires_at: DateTime<Utc>,
}

impl Outstanding {
    fn matches(&self, kind: RequestKind, now: DateTime<Utc>) -> bool {
        self.kind == kind && self.expires_at > now
    }
}

/// In-memory request-ID store.
///
/// IDs are lost on restart and not shared across nodes.
pub struct MemoryRequestIdStore {
    ids: RwLock<HashMap<String, Outstanding>>,
}

impl MemoryRequestIdStore {
    pub fn new() -> Self {
        Self {
            ids: RwLock::new(HashMap::new()),
        }
    }

    pub fn shared() -> SharedRequestIdStore {
        Arc::new(Self::new())
    }

    pub async fn len(&self) -> usize {
        self.ids.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.ids.read().await.is_empty()
    }
}

impl Default for MemoryRequestIdStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RequestIdStore for MemoryRequestIdStore {
    async fn put(&self, id: &str, kind: RequestKind, expires_at: DateTime<Utc>) -> StoreResult<()> {
        let mut ids = self.ids.write().await;
        ids.insert(id.to_string(), Outstanding { kind, expires_at });
        Ok(())
    }

    async fn exists(&self, id: &str, kind: RequestKind) -> StoreResult<bool> {
        let ids = self.ids.read().await;
        Ok(ids.get(id).is_some_and(|entry| entry.matches(kind, Utc::now())))
    }

    async fn take(&self, id: &str, kind: RequestKind) -> StoreResult<bool> {
        let now = Utc::now();
        let mut ids = self.ids.write().await;
        let Some(entry) = ids.get(id).copied() else {
            return Ok(false);
        };
        // Another flow's ID stays outstanding for that flow.
        if entry.kind != kind {
            return Ok(false);
        }
        ids.remove(id);
        Ok(entry.expires_at > now)
    }

    async fn cleanup(&self) -> StoreResult<()> {
        let now = Utc::now();
        let mut ids = self.ids.write().await;
        ids.retain(|_, entry| entry.expires_at > now);
        Ok(())
    }
}
