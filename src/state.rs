//! Session registry: which session owns which sandbox.

use crate::config::SandboxConfig;
use crate::engine::ContainerEngine;
use crate::error::Result;
use crate::sandbox::SandboxHandle;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tracing::{info, warn};

/// Per-session slot. Holding its lock serializes creation for that session only.
#[derive(Default)]
struct Slot {
    handle: Mutex<Option<Arc<SandboxHandle>>>,
}

/// Point-in-time view of one registered sandbox.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionEntry {
    pub session_id: String,
    pub container_name: String,
    pub activity: u64,
    /// An install, execute or folder removal is in flight.
    pub busy: bool,
}

/// Thread-safe map from session id to its single live sandbox.
///
/// The map lock is only held to claim or drop a slot; engine calls happen
/// under the per-session slot lock so one slow container start never blocks
/// unrelated sessions.
pub struct SessionRegistry {
    slots: RwLock<HashMap<String, Arc<Slot>>>,
    engine: Arc<dyn ContainerEngine>,
    config: Arc<SandboxConfig>,
}

impl SessionRegistry {
    pub fn new(engine: Arc<dyn ContainerEngine>, config: SandboxConfig) -> Self {
        Self {
            slots: RwLock::new(HashMap::new()),
            engine,
            config: Arc::new(config),
        }
    }

    pub fn engine(&self) -> &Arc<dyn ContainerEngine> {
        &self.engine
    }

    pub fn config(&self) -> &Arc<SandboxConfig> {
        &self.config
    }

    /// Build an unregistered handle for `session_id` (no engine calls).
    pub fn detached_handle(&self, session_id: &str) -> Result<SandboxHandle> {
        SandboxHandle::new(session_id, self.engine.clone(), self.config.clone())
    }

    async fn is_current(&self, session_id: &str, slot: &Arc<Slot>) -> bool {
        self.slots
            .read()
            .await
            .get(session_id)
            .is_some_and(|current| Arc::ptr_eq(current, slot))
    }

    /// Return the session's sandbox, creating and starting it if absent.
    pub async fn resolve(&self, session_id: &str) -> Result<Arc<SandboxHandle>> {
        loop {
            let slot = {
                let mut slots = self.slots.write().await;
                slots.entry(session_id.to_string()).or_default().clone()
            };

            let mut guard = slot.handle.lock().await;
            // Evicted while we waited for the slot; claim a fresh one.
            if !self.is_current(session_id, &slot).await {
                continue;
            }
            if let Some(handle) = guard.as_ref() {
                return Ok(handle.clone());
            }

            let handle = Arc::new(self.detached_handle(session_id)?);
            if let Err(e) = handle.start().await {
                warn!(session = session_id, error = %e, "Sandbox failed to start");
                drop(guard);
                let mut slots = self.slots.write().await;
                if slots
                    .get(session_id)
                    .is_some_and(|current| Arc::ptr_eq(current, &slot))
                {
                    slots.remove(session_id);
                }
                return Err(e);
            }
            *guard = Some(handle.clone());
            info!(session = session_id, container = handle.container_name(), "Registered sandbox");
            return Ok(handle);
        }
    }

    /// Look up without creating.
    pub async fn get(&self, session_id: &str) -> Option<Arc<SandboxHandle>> {
        let slot = self.slots.read().await.get(session_id).cloned()?;
        let guard = slot.handle.lock().await;
        guard.clone()
    }

    /// Stop the session's sandbox and drop the mapping.
    ///
    /// The stop runs under the slot lock and the slot only leaves the map
    /// afterwards, so a concurrent `resolve` waits and then starts a fresh
    /// container instead of adopting the one being stopped. With no
    /// registered handle, a container left by an earlier process under the
    /// same deterministic name is stopped instead. Returns whether anything
    /// was stopped.
    pub async fn evict_and_stop(&self, session_id: &str) -> Result<bool> {
        let slot = {
            let mut slots = self.slots.write().await;
            slots.entry(session_id.to_string()).or_default().clone()
        };
        let mut guard = slot.handle.lock().await;

        let stopped = match guard.take() {
            Some(handle) => handle.stop().await.map(|()| true),
            None => self.stop_orphan(session_id).await,
        };

        let mut slots = self.slots.write().await;
        if slots
            .get(session_id)
            .is_some_and(|current| Arc::ptr_eq(current, &slot))
        {
            slots.remove(session_id);
        }
        drop(slots);
        drop(guard);

        if let Ok(true) = stopped {
            info!(session = session_id, "Evicted sandbox");
        }
        stopped
    }

    async fn stop_orphan(&self, session_id: &str) -> Result<bool> {
        let orphan = self.detached_handle(session_id)?;
        if !orphan.exists().await? {
            return Ok(false);
        }
        orphan.stop().await?;
        Ok(true)
    }

    /// Snapshot of every live mapping. Slots still starting are skipped.
    pub async fn list(&self) -> Vec<SessionEntry> {
        let slots: Vec<Arc<Slot>> = self.slots.read().await.values().cloned().collect();
        let mut entries = Vec::with_capacity(slots.len());
        for slot in slots {
            let Ok(guard) = slot.handle.try_lock() else {
                continue;
            };
            if let Some(handle) = guard.as_ref() {
                entries.push(SessionEntry {
                    session_id: handle.session_id().to_string(),
                    container_name: handle.container_name().to_string(),
                    activity: handle.activity_count(),
                    busy: handle.is_busy(),
                });
            }
        }
        entries
    }

    pub async fn handles(&self) -> Vec<Arc<SandboxHandle>> {
        let slots: Vec<Arc<Slot>> = self.slots.read().await.values().cloned().collect();
        let mut handles = Vec::with_capacity(slots.len());
        for slot in slots {
            if let Ok(guard) = slot.handle.try_lock() {
                handles.extend(guard.clone());
            }
        }
        handles
    }

    /// Remove every mapping, returning the handles for shutdown.
    pub async fn drain(&self) -> Vec<Arc<SandboxHandle>> {
        let slots: Vec<Arc<Slot>> = self.slots.write().await.drain().map(|(_, s)| s).collect();
        let mut handles = Vec::with_capacity(slots.len());
        for slot in slots {
            handles.extend(slot.handle.lock().await.take());
        }
        handles
    }
}
