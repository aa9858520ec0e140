use std::{
    collections::BTreeMap,
    sync::{Arc, RwLock},
};

use crate::process::ServerProcessHandle;

/// Source of truth for which server processes are currently attached.
///
/// Answers are read fresh on every call; callers must not cache them across awaits.
pub trait Launcher: Send + Sync {
    fn server_processes(&self) -> Vec<Arc<ServerProcessHandle>>;

    fn server_process(&self, instance: u32) -> Option<Arc<ServerProcessHandle>> {
        self.server_processes()
            .into_iter()
            .find(|p| p.instance() == instance)
    }

    fn is_instance_active(&self, instance: u32) -> bool {
        self.server_process(instance)
            .is_some_and(|p| p.is_active())
    }
}

/// In-memory registry keyed by instance id.
#[derive(Clone, Debug, Default)]
pub struct ProcessRegistry {
    inner: Arc<RwLock<BTreeMap<u32, Arc<ServerProcessHandle>>>>,
}

impl ProcessRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces (and returns) any handle already registered for the instance.
    pub fn insert(&self, handle: Arc<ServerProcessHandle>) -> Option<Arc<ServerProcessHandle>> {
        self.inner
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(handle.instance(), handle)
    }

    pub fn remove(&self, instance: u32) -> Option<Arc<ServerProcessHandle>> {
        self.inner
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&instance)
    }

    pub fn get(&self, instance: u32) -> Option<Arc<ServerProcessHandle>> {
        self.inner
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&instance)
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.inner.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drops handles that reached a terminal state or were retired by a restart.
    pub fn prune_inactive(&self) -> Vec<Arc<ServerProcessHandle>> {
        let mut map = self.inner.write().unwrap_or_else(|e| e.into_inner());
        let dead: Vec<u32> = map
            .iter()
            .filter(|(_, h)| !h.is_active())
            .map(|(id, _)| *id)
            .collect();
        dead.into_iter().filter_map(|id| map.remove(&id)).collect()
    }
}

impl Launcher for ProcessRegistry {
    fn server_processes(&self) -> Vec<Arc<ServerProcessHandle>> {
        self.inner
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .cloned()
            .collect()
    }

    fn server_process(&self, instance: u32) -> Option<Arc<ServerProcessHandle>> {
        self.get(instance)
    }
}
