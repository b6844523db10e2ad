//! Server-side session access
//!
//! The flow keeps state binding markers and the signed-in user in a
//! per-browser session. Production code uses `tower_sessions::Session`; the
//! in-memory store serves embedding without a session layer and tests.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::time::{Duration, Instant};

use tokio::sync::Mutex;

use crate::error::Result;

/// Boxed future returned by [`SessionStore`] methods.
pub type SessionFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>;

/// Key/value view of one client's session. Structured values are stored as JSON text.
pub trait SessionStore: Send + Sync {
    fn insert<'a>(&'a self, key: &'a str, value: String) -> SessionFuture<'a, ()>;

    fn get<'a>(&'a self, key: &'a str) -> SessionFuture<'a, Option<String>>;

    /// Get and delete. `tower_sessions::Session` only removes from its own
    /// request's copy of the record until it is saved.
    fn take<'a>(&'a self, key: &'a str) -> SessionFuture<'a, Option<String>>;

    /// Drop every entry of the session.
    fn flush(&self) -> SessionFuture<'_, ()>;
}

impl SessionStore for tower_sessions::Session {
    fn insert<'a>(&'a self, key: &'a str, value: String) -> SessionFuture<'a, ()> {
        Box::pin(async move { Ok(tower_sessions::Session::insert(self, key, value).await?) })
    }

    fn get<'a>(&'a self, key: &'a str) -> SessionFuture<'a, Option<String>> {
        Box::pin(async move { Ok(tower_sessions::Session::get::<String>(self, key).await?) })
    }

    fn take<'a>(&'a self, key: &'a str) -> SessionFuture<'a, Option<String>> {
        Box::pin(async move { Ok(self.remove::<String>(key).await?) })
    }

    fn flush(&self) -> SessionFuture<'_, ()> {
        Box::pin(async move { Ok(tower_sessions::Session::flush(self).await?) })
    }
}

/// Entries older than this are dropped on the next write.
pub const MEMORY_ENTRY_EXPIRY: Duration = Duration::from_secs(600);

struct Entry {
    value: String,
    created_at: Instant,
}

/// Single in-process session with a per-entry expiry.
pub struct MemorySessionStore {
    entries: Mutex<HashMap<String, Entry>>,
    expiry: Duration,
}

impl Default for MemorySessionStore {
    fn default() -> Self {
        Self::new(MEMORY_ENTRY_EXPIRY)
    }
}

impl MemorySessionStore {
    pub fn new(expiry: Duration) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            expiry,
        }
    }

    pub async fn len(&self) -> usize {
        let expiry = self.expiry;
        let entries = self.entries.lock().await;
        entries
            .values()
            .filter(|e| e.created_at.elapsed() < expiry)
            .count()
    }
}

impl SessionStore for MemorySessionStore {
    fn insert<'a>(&'a self, key: &'a str, value: String) -> SessionFuture<'a, ()> {
        Box::pin(async move {
            let expiry = self.expiry;
            let mut entries = self.entries.lock().await;
            // Lazy cleanup while holding the lock
            entries.retain(|_, e| e.created_at.elapsed() < expiry);
            entries.insert(
                key.to_string(),
                Entry {
                    value,
                    created_at: Instant::now(),
                },
            );
            Ok(())
        })
    }

    fn get<'a>(&'a self, key: &'a str) -> SessionFuture<'a, Option<String>> {
        Box::pin(async move {
            let entries = self.entries.lock().await;
            Ok(entries
                .get(key)
                .filter(|e| e.created_at.elapsed() < self.expiry)
                .map(|e| e.value.clone()))
        })
    }

    fn take<'a>(&'a self, key: &'a str) -> SessionFuture<'a, Option<String>> {
        Box::pin(async move {
            let mut entries = self.entries.lock().await;
            Ok(entries
                .remove(key)
                .filter(|e| e.created_at.elapsed() < self.expiry)
                .map(|e| e.value))
        })
    }

    fn flush(&self) -> SessionFuture<'_, ()> {
        Box::pin(async move {
            self.entries.lock().await.clear();
            Ok(())
        })
    }
}
