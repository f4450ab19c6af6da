//! Registry of named event sources with bulk lifecycle operations.

use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::{info, warn};

use super::lifecycle::SourceStatus;
use super::EventSource;
use crate::error::{Result, TributaryError};

/// Result of a bulk start or stop.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BulkOutcome {
    pub succeeded: Vec<String>,
    /// Already in the target state
    pub skipped: Vec<String>,
    /// `(source_id, message)` pairs
    pub failed: Vec<(String, String)>,
}

impl BulkOutcome {
    pub fn is_success(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Source counts by status.
///
/// Serializes flat, e.g. `{"running": 2, "error": 1, "total": 3}`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RegistryStats {
    #[serde(flatten)]
    pub by_status: BTreeMap<SourceStatus, usize>,
    pub total: usize,
}

impl RegistryStats {
    pub fn count(&self, status: SourceStatus) -> usize {
        self.by_status.get(&status).copied().unwrap_or(0)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Source Registry
// ═══════════════════════════════════════════════════════════════════════════════

/// Id-keyed collection of sources.
///
/// Cheap to clone; clones share the same map. The lock is never held
/// across an await: bulk operations snapshot the sources first.
#[derive(Clone, Default)]
pub struct SourceRegistry {
    sources: Arc<parking_lot::RwLock<HashMap<String, Arc<dyn EventSource>>>>,
}

impl SourceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Membership
    // ─────────────────────────────────────────────────────────────────────────

    /// Register a source under its id, returning any source it replaced.
    ///
    /// A replaced source is not stopped.
    pub fn register(&self, source: Arc<dyn EventSource>) -> Option<Arc<dyn EventSource>> {
        let id = source.id().to_string();
        let previous = self.sources.write().insert(id.clone(), source);
        if previous.is_some() {
            warn!(source_id = %id, "Replacing already registered event source");
        } else {
            info!(source_id = %id, "Registered event source");
        }
        previous
    }

    /// Remove a source. It is not stopped.
    pub fn unregister(&self, source_id: &str) -> Option<Arc<dyn EventSource>> {
        let removed = self.sources.write().remove(source_id);
        if removed.is_none() {
            warn!(source_id = %source_id, "Attempted to unregister unknown event source");
        }
        removed
    }

    pub fn get(&self, source_id: &str) -> Option<Arc<dyn EventSource>> {
        self.sources.read().get(source_id).cloned()
    }

    /// Like [`get`](Self::get), but an unknown id is a `SourceNotFound` error.
    pub fn require(&self, source_id: &str) -> Result<Arc<dyn EventSource>> {
        self.get(source_id)
            .ok_or_else(|| TributaryError::source_not_found(source_id))
    }

    /// All sources, ordered by id.
    pub fn list_all(&self) -> Vec<Arc<dyn EventSource>> {
        let mut sources: Vec<_> = self.sources.read().values().cloned().collect();
        sources.sort_by(|a, b| a.id().cmp(b.id()));
        sources
    }

    pub fn clear(&self) {
        self.sources.write().clear();
    }

    pub fn len(&self) -> usize {
        self.sources.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sources.read().is_empty()
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Bulk lifecycle
    // ─────────────────────────────────────────────────────────────────────────

    /// Start every source that is not already active, one at a time.
    /// A failure is recorded and the remaining sources are still started.
    pub async fn start_all(&self) -> BulkOutcome {
        let mut outcome = BulkOutcome::default();

        for source in self.list_all() {
            let id = source.id().to_string();
            if source.status().is_active() {
                outcome.skipped.push(id);
                continue;
            }
            match source.start().await {
                Ok(()) => outcome.succeeded.push(id),
                Err(e) => {
                    let message = source.last_error().unwrap_or_else(|| e.summary());
                    warn!(source_id = %id, error = %e, "Event source failed during start_all");
                    outcome.failed.push((id, message));
                }
            }
        }

        info!(
            started = outcome.succeeded.len(),
            skipped = outcome.skipped.len(),
            failed = outcome.failed.len(),
            "Started registered event sources"
        );
        outcome
    }

    /// Stop every source that is not already stopped, one at a time.
    pub async fn stop_all(&self) -> BulkOutcome {
        let mut outcome = BulkOutcome::default();

        for source in self.list_all() {
            let id = source.id().to_string();
            if source.status() == SourceStatus::Stopped {
                outcome.skipped.push(id);
                continue;
            }
            match source.stop().await {
                Ok(()) => outcome.succeeded.push(id),
                Err(e) => {
                    let message = source.last_error().unwrap_or_else(|| e.summary());
                    warn!(source_id = %id, error = %e, "Event source failed during stop_all");
                    outcome.failed.push((id, message));
                }
            }
        }

        info!(
            stopped = outcome.succeeded.len(),
            skipped = outcome.skipped.len(),
            failed = outcome.failed.len(),
            "Stopped registered event sources"
        );
        outcome
    }

    /// Start one registered source by id.
    pub async fn start_source(&self, source_id: &str) -> Result<()> {
        self.require(source_id)?.start().await
    }

    /// Stop one registered source by id.
    pub async fn stop_source(&self, source_id: &str) -> Result<()> {
        self.require(source_id)?.stop().await
    }

    pub fn stats(&self) -> RegistryStats {
        let sources = self.sources.read();
        let mut by_status = BTreeMap::new();
        for source in sources.values() {
            *by_status.entry(source.status()).or_insert(0) += 1;
        }
        RegistryStats {
            by_status,
            total: sources.len(),
        }
    }
}

impl std::fmt::Debug for SourceRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut ids: Vec<String> = self.sources.read().keys().cloned().collect();
        ids.sort();
        f.debug_struct("SourceRegistry").field("sources", &ids).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCode;
    use crate::sources::lifecycle::{SourceCore, SourceKind};
    use async_trait::async_trait;
    use serde_json::json;

    struct StubSource {
        core: SourceCore,
        fail: bool,
    }

    impl StubSource {
        fn healthy(id: &str) -> Arc<dyn EventSource> {
            Arc::new(Self {
                core: SourceCore::new(id, SourceKind::Queue),
                fail: false,
            })
        }

        fn failing(id: &str) -> Arc<dyn EventSource> {
            Arc::new(Self {
                core: SourceCore::new(id, SourceKind::Kafka),
                fail: true,
            })
        }
    }

    #[async_trait]
    impl EventSource for StubSource {
        fn core(&self) -> &SourceCore {
            &self.core
        }

        async fn start_acquisition(&self) -> Result<()> {
            if self.fail {
                return Err(TributaryError::broker_connection("Kafka", "connection refused"));
            }
            Ok(())
        }

        async fn stop_acquisition(&self) -> Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_register_get_unregister() {
        let registry = SourceRegistry::new();
        assert!(registry.register(StubSource::healthy("a")).is_none());
        assert!(registry.register(StubSource::healthy("a")).is_some());
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.get("a").unwrap().id(), "a");

        assert!(registry.unregister("a").is_some());
        assert!(registry.unregister("a").is_none());
        assert!(registry.get("a").is_none());
        assert!(registry.is_empty());
    }

    #[test]
    fn test_list_all_is_sorted_and_clear_empties() {
        let registry = SourceRegistry::new();
        for id in ["c", "a", "b"] {
            registry.register(StubSource::healthy(id));
        }
        let ids: Vec<String> = registry.list_all().iter().map(|s| s.id().to_string()).collect();
        assert_eq!(ids, vec!["a", "b", "c"]);

        let clone = registry.clone();
        clone.clear();
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_start_all_continues_past_failures() {
        let registry = SourceRegistry::new();
        registry.register(StubSource::failing("broken"));
        registry.register(StubSource::healthy("healthy"));

        let outcome = registry.start_all().await;
        assert_eq!(outcome.succeeded, vec!["healthy".to_string()]);
        assert_eq!(outcome.failed.len(), 1);
        assert_eq!(outcome.failed[0].0, "broken");
        assert!(outcome.failed[0].1.contains("connection refused"));
        assert!(!outcome.is_success());

        let stats = registry.stats();
        assert_eq!(stats.count(SourceStatus::Running), 1);
        assert_eq!(stats.count(SourceStatus::Error), 1);
        assert_eq!(stats.total, 2);

        let again = registry.start_all().await;
        assert_eq!(again.skipped, vec!["healthy".to_string()]);
        assert_eq!(again.failed.len(), 1);
    }

    #[tokio::test]
    async fn test_stop_all_skips_stopped_and_clears_errors() {
        let registry = SourceRegistry::new();
        registry.register(StubSource::failing("broken"));
        registry.register(StubSource::healthy("healthy"));
        registry.register(StubSource::healthy("idle"));
        registry.get("healthy").unwrap().start().await.unwrap();
        let _ = registry.get("broken").unwrap().start().await;

        let outcome = registry.stop_all().await;
        assert_eq!(outcome.succeeded, vec!["broken".to_string(), "healthy".to_string()]);
        assert_eq!(outcome.skipped, vec!["idle".to_string()]);
        assert_eq!(registry.stats().count(SourceStatus::Stopped), 3);
    }

    #[tokio::test]
    async fn test_single_source_lifecycle_by_id() {
        let registry = SourceRegistry::new();
        registry.register(StubSource::healthy("a"));

        registry.start_source("a").await.unwrap();
        assert_eq!(registry.get("a").unwrap().status(), SourceStatus::Running);
        registry.stop_source("a").await.unwrap();
        assert_eq!(registry.get("a").unwrap().status(), SourceStatus::Stopped);

        let err = registry.start_source("ghost").await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::SourceNotFound);
        assert_eq!(err.details().entity_id.as_deref(), Some("ghost"));
        assert_eq!(
            registry.stop_source("ghost").await.unwrap_err().code(),
            ErrorCode::SourceNotFound
        );
        assert!(registry.require("ghost").is_err());
    }

    #[tokio::test]
    async fn test_stats_serialize_flat() {
        let registry = SourceRegistry::new();
        registry.register(StubSource::healthy("a"));
        registry.register(StubSource::healthy("b"));
        registry.get("a").unwrap().start().await.unwrap();

        let value = serde_json::to_value(registry.stats()).unwrap();
        assert_eq!(value, json!({"running": 1, "stopped": 1, "total": 2}));
    }
}
