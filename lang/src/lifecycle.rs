use std::{
    sync::Weak,
    thread,
    time::{Duration, Instant},
};

use tracing::{info, warn};

use crate::loader::{ContextId, LinkedModule, LoadedModule};

const POLL_INTERVAL: Duration = Duration::from_millis(1);

/// Tears execution contexts down.
#[derive(Debug, Default, Clone, Copy)]
pub struct LifecycleManager;

impl LifecycleManager {
    pub fn new() -> Self {
        LifecycleManager
    }

    /// Requests the context be unloaded. Later invocations through any
    /// clone of `loaded` fail; memory is reclaimed once nothing else holds
    /// the module.
    pub fn unload(&self, loaded: LoadedModule) -> UnloadHandle {
        let context = loaded.id().clone();
        let module = loaded.context().release();
        let handle = UnloadHandle { context, module };
        if handle.is_complete() {
            info!(context = %handle.context, "unloaded context");
        } else {
            warn!(context = %handle.context, "context unloaded but still referenced");
        }
        handle
    }
}

/// Tracks whether an unloaded context has actually been reclaimed.
#[derive(Debug, Clone)]
pub struct UnloadHandle {
    context: ContextId,
    module: Weak<LinkedModule>,
}

impl UnloadHandle {
    pub fn context(&self) -> &ContextId {
        &self.context
    }

    pub fn is_complete(&self) -> bool {
        self.module.strong_count() == 0
    }

    /// Polls until reclaimed or `timeout` passes. Returns whether the
    /// context was reclaimed.
    pub fn wait(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if self.is_complete() {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            thread::sleep(POLL_INTERVAL.min(deadline - now));
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::{
        bytecode::Image,
        ids::SequentialIds,
        loader::{ContextRegistry, Loader},
        references::ModuleTable,
    };

    fn loaded() -> LoadedModule {
        let image = Image {
            name: "unit".to_owned(),
            ..Image::default()
        };
        Loader::new(
            Arc::new(ModuleTable::standard()),
            Arc::new(SequentialIds::new("t")),
            Arc::new(ContextRegistry::new()),
        )
        .load(image.encode().unwrap())
        .unwrap()
    }

    #[test]
    fn unload_completes_without_escaped_references() {
        let loaded = loaded();
        let handle = LifecycleManager::new().unload(loaded.clone());
        assert!(handle.is_complete());
        assert!(handle.wait(Duration::ZERO));
        assert!(loaded.context().is_unloaded());
        assert_eq!(handle.context().0, "t-ctx-0");
    }

    #[test]
    fn pin_delays_reclamation() {
        let loaded = loaded();
        let pin = loaded.pin().unwrap();
        let handle = LifecycleManager::new().unload(loaded.clone());
        assert!(loaded.context().is_unloaded());
        assert!(loaded.pin().is_none());
        assert!(!handle.wait(Duration::from_millis(5)));

        drop(pin);
        assert!(handle.wait(Duration::from_millis(5)));
    }

    #[test]
    fn unloading_twice_is_harmless() {
        let loaded = loaded();
        let manager = LifecycleManager::new();
        manager.unload(loaded.clone());
        assert!(manager.unload(loaded).is_complete());
    }
}
