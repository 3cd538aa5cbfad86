//! Per-run registry of open sessions.
//!
//! The run context owns one registry. Every session the engine opens is
//! registered and deregistered again when its owner drops the returned
//! [`Tracked`] handle. On interrupt, [`ConnectionRegistry::close_all`] closes
//! whatever is still open.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, info};

use crate::domain::error::SyncResult;
use crate::domain::ports::{ConnectionProvider, Session, SessionCloser};
use crate::infrastructure::config::EndpointConfig;

struct Entry {
    endpoint: String,
    closer: Arc<dyn SessionCloser>,
}

#[derive(Default)]
pub struct ConnectionRegistry {
    sessions: Mutex<HashMap<u64, Entry>>,
    next_id: AtomicU64,
}

impl ConnectionRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn sessions(&self) -> MutexGuard<'_, HashMap<u64, Entry>> {
        self.sessions
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Open a session through `provider` and track it until the handle drops.
    pub async fn open(
        self: &Arc<Self>,
        provider: &dyn ConnectionProvider,
        endpoint: &EndpointConfig,
    ) -> SyncResult<Tracked> {
        let session = provider.open(endpoint).await?;
        let registration = self.register(session.as_ref());
        Ok(Tracked {
            session,
            _registration: registration,
        })
    }

    pub fn register(self: &Arc<Self>, session: &dyn Session) -> Registration {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.sessions().insert(
            id,
            Entry {
                endpoint: session.endpoint().to_string(),
                closer: session.closer(),
            },
        );
        debug!(endpoint = %session.endpoint(), id, "session registered");
        Registration {
            registry: Arc::clone(self),
            id,
        }
    }

    /// Sessions currently open.
    pub fn open_count(&self) -> usize {
        self.sessions().len()
    }

    /// Close every registered session; returns how many were closed.
    pub async fn close_all(&self) -> usize {
        let entries: Vec<Entry> = self.sessions().drain().map(|(_, e)| e).collect();
        for entry in &entries {
            info!(endpoint = %entry.endpoint, "closing open session");
            entry.closer.close().await;
        }
        entries.len()
    }
}

/// Removes its session from the registry on drop.
pub struct Registration {
    registry: Arc<ConnectionRegistry>,
    id: u64,
}

impl Drop for Registration {
    fn drop(&mut self) {
        self.registry.sessions().remove(&self.id);
    }
}

/// A session plus its registration.
pub struct Tracked {
    pub session: Box<dyn Session>,
    _registration: Registration,
}

impl Tracked {
    /// Close the session and deregister it.
    pub async fn close(mut self) {
        self.session.close().await;
    }
}
