//! Handler registry (§4.1).
//!
//! Maps a job `type` string to the `JobHandler` that executes it, the same
//! `DashMap`-backed registry shape as `websocket::broadcast::BroadcastManager`
//! uses for its topic -> subscriber map, keyed here by job type instead.

use dashmap::DashMap;
use std::sync::Arc;
use tracing::{debug, warn};

use super::JobHandler;

/// In-process registry of job-type -> handler. Plugins register their
/// handlers at startup and can unregister them all at once on teardown.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: DashMap<String, (Arc<dyn JobHandler>, Option<String>)>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self {
            handlers: DashMap::new(),
        }
    }

    /// Register `handler` for `job_type`, optionally tagged with the
    /// `plugin_id` that owns it (used by `unregister_all_for_plugin`).
    /// Registering a type a second time replaces the previous handler.
    pub fn register(
        &self,
        job_type: impl Into<String>,
        handler: Arc<dyn JobHandler>,
        plugin_id: Option<String>,
    ) {
        let job_type = job_type.into();
        if self.handlers.contains_key(&job_type) {
            warn!(job_type, "replacing existing handler registration");
        }
        debug!(job_type, plugin_id = ?plugin_id, "handler registered");
        self.handlers.insert(job_type, (handler, plugin_id));
    }

    pub fn unregister(&self, job_type: &str) -> bool {
        self.handlers.remove(job_type).is_some()
    }

    /// Remove every handler registered by `plugin_id`. Used when a plugin is
    /// unloaded so its job types stop accepting new work.
    pub fn unregister_all_for_plugin(&self, plugin_id: &str) -> usize {
        let to_remove: Vec<String> = self
            .handlers
            .iter()
            .filter(|entry| entry.value().1.as_deref() == Some(plugin_id))
            .map(|entry| entry.key().clone())
            .collect();

        for job_type in &to_remove {
            self.handlers.remove(job_type);
        }
        to_remove.len()
    }

    pub fn get_handler(&self, job_type: &str) -> Option<Arc<dyn JobHandler>> {
        self.handlers.get(job_type).map(|entry| entry.value().0.clone())
    }

    pub fn is_registered(&self, job_type: &str) -> bool {
        self.handlers.contains_key(job_type)
    }

    pub fn list_types(&self) -> Vec<String> {
        self.handlers.iter().map(|entry| entry.key().clone()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::ProgressReporter;
    use crate::Result;
    use async_trait::async_trait;

    struct EchoHandler;

    #[async_trait]
    impl JobHandler for EchoHandler {
        async fn process(
            &self,
            parsed: &serde_json::Value,
            _job_id: &str,
            _reporter: &ProgressReporter,
        ) -> Result<serde_json::Value> {
            Ok(parsed.clone())
        }
    }

    #[test]
    fn register_and_lookup() {
        let registry = HandlerRegistry::new();
        assert!(registry.get_handler("site-build").is_none());

        registry.register("site-build", Arc::new(EchoHandler), None);
        assert!(registry.is_registered("site-build"));
        assert!(registry.get_handler("site-build").is_some());
    }

    #[test]
    fn unregister_all_for_plugin_only_removes_its_own_types() {
        let registry = HandlerRegistry::new();
        registry.register("plugin-a:ingest", Arc::new(EchoHandler), Some("plugin-a".to_string()));
        registry.register("plugin-b:ingest", Arc::new(EchoHandler), Some("plugin-b".to_string()));
        registry.register("core:site-build", Arc::new(EchoHandler), None);

        let removed = registry.unregister_all_for_plugin("plugin-a");
        assert_eq!(removed, 1);
        assert!(!registry.is_registered("plugin-a:ingest"));
        assert!(registry.is_registered("plugin-b:ingest"));
        assert!(registry.is_registered("core:site-build"));
    }

    #[test]
    fn re_registering_a_type_replaces_the_handler() {
        let registry = HandlerRegistry::new();
        registry.register("site-build", Arc::new(EchoHandler), None);
        registry.register("site-build", Arc::new(EchoHandler), None);
        assert_eq!(registry.list_types().len(), 1);
    }
}
