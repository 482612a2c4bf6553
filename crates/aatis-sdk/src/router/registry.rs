//! Capability Registry
//!
//! Process-wide table of agent capabilities. Changes only through explicit
//! register / deregister / set-health calls; registration order is recorded
//! and breaks priority ties during selection.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::RwLock;

use aatis_core::Database;
use aatis_core::audit::{self, AuditEvent, AuditEventType, AuditSink, NullAuditSink};
use aatis_core::types::{CapabilityDescriptor, Task};

use crate::utils::validate_id;
use crate::{SDKError, SDKResult};

/// Result of a successful capability invocation
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CapabilityOutput {
    pub result: String,
    pub output_tags: BTreeSet<String>,
}

impl CapabilityOutput {
    pub fn new(result: impl Into<String>) -> Self {
        Self {
            result: result.into(),
            output_tags: BTreeSet::new(),
        }
    }

    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.output_tags = tags.into_iter().map(Into::into).collect();
        self
    }
}

/// Failure reported by a capability
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{message}")]
pub struct CapabilityError {
    pub message: String,
}

impl CapabilityError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// An external unit of work (agent persona, tool wrapper, ...)
#[async_trait]
pub trait AgentCapability: Send + Sync {
    async fn invoke(&self, task: &Task) -> Result<CapabilityOutput, CapabilityError>;
}

struct Registration {
    seq: u64,
    descriptor: CapabilityDescriptor,
    handler: Arc<dyn AgentCapability>,
}

/// Registered capabilities and their handlers
pub struct CapabilityRegistry {
    entries: RwLock<HashMap<String, Registration>>,
    next_seq: AtomicU64,
    db: Option<Arc<Database>>,
    audit: Arc<dyn AuditSink>,
}

impl Default for CapabilityRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl CapabilityRegistry {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            next_seq: AtomicU64::new(1),
            db: None,
            audit: Arc::new(NullAuditSink),
        }
    }

    /// Persist the registry snapshot. Registration sequence numbers continue
    /// after the highest persisted one.
    pub fn with_db(mut self, db: Arc<Database>) -> SDKResult<Self> {
        let last = db
            .list_capabilities()?
            .into_iter()
            .map(|(seq, _)| seq)
            .max()
            .unwrap_or(0);
        self.next_seq = AtomicU64::new(last + 1);
        self.db = Some(db);
        Ok(self)
    }

    pub fn with_audit(mut self, audit: Arc<dyn AuditSink>) -> Self {
        self.audit = audit;
        self
    }

    /// Register a capability. Returns its registration sequence number.
    pub async fn register(
        &self,
        descriptor: CapabilityDescriptor,
        handler: Arc<dyn AgentCapability>,
    ) -> SDKResult<u64> {
        validate_id(&descriptor.name)
            .map_err(|e| SDKError::invalid_operation(format!("capability name: {}", e)))?;

        let mut entries = self.entries.write().await;
        if entries.contains_key(&descriptor.name) {
            return Err(SDKError::invalid_operation(format!(
                "capability already registered: {}",
                descriptor.name
            )));
        }

        let seq = self.next_seq.fetch_add(1, Ordering::SeqCst);
        if let Some(db) = &self.db {
            db.save_capability(seq, &descriptor)?;
        }

        tracing::info!(
            capability = %descriptor.name,
            seq,
            priority = descriptor.priority,
            accepts = ?descriptor.accepts,
            "Capability registered"
        );
        self.emit(
            &descriptor.name,
            AuditEventType::CapabilityRegistered,
            format!("seq={} priority={}", seq, descriptor.priority),
        );

        entries.insert(
            descriptor.name.clone(),
            Registration {
                seq,
                descriptor,
                handler,
            },
        );
        Ok(seq)
    }

    /// Remove a capability
    pub async fn deregister(&self, name: &str) -> SDKResult<CapabilityDescriptor> {
        let removed = self
            .entries
            .write()
            .await
            .remove(name)
            .ok_or_else(|| SDKError::not_found("Capability", name))?;

        if let Some(db) = &self.db {
            db.delete_capability(name)?;
        }
        tracing::info!(capability = %name, "Capability deregistered");
        self.emit(name, AuditEventType::CapabilityDeregistered, format!("seq={}", removed.seq));

        Ok(removed.descriptor)
    }

    /// Mark a capability healthy or unhealthy
    pub async fn set_health(&self, name: &str, healthy: bool) -> SDKResult<()> {
        let mut entries = self.entries.write().await;
        let entry = entries
            .get_mut(name)
            .ok_or_else(|| SDKError::not_found("Capability", name))?;

        if entry.descriptor.healthy == healthy {
            return Ok(());
        }
        entry.descriptor.healthy = healthy;

        if let Some(db) = &self.db {
            db.save_capability(entry.seq, &entry.descriptor)?;
        }
        tracing::info!(capability = %name, healthy, "Capability health changed");
        self.emit(name, AuditEventType::CapabilityHealthChanged, format!("healthy={}", healthy));
        Ok(())
    }

    pub async fn get(&self, name: &str) -> Option<CapabilityDescriptor> {
        self.entries.read().await.get(name).map(|e| e.descriptor.clone())
    }

    /// Handler of a healthy capability
    pub async fn handler(&self, name: &str) -> Option<Arc<dyn AgentCapability>> {
        self.entries
            .read()
            .await
            .get(name)
            .filter(|e| e.descriptor.healthy)
            .map(|e| e.handler.clone())
    }

    /// All capabilities in registration order
    pub async fn list(&self) -> Vec<CapabilityDescriptor> {
        let entries = self.entries.read().await;
        let mut list: Vec<_> = entries.values().collect();
        list.sort_by_key(|e| e.seq);
        list.into_iter().map(|e| e.descriptor.clone()).collect()
    }

    /// Pick the healthy capability accepting every required tag, preferring
    /// the highest priority, then the earliest registration
    pub async fn select(
        &self,
        required: &BTreeSet<String>,
        excluded: &BTreeSet<String>,
    ) -> Option<CapabilityDescriptor> {
        let entries = self.entries.read().await;
        entries
            .values()
            .filter(|e| e.descriptor.healthy)
            .filter(|e| !excluded.contains(&e.descriptor.name))
            .filter(|e| e.descriptor.accepts_all(required))
            .min_by(|a, b| {
                b.descriptor
                    .priority
                    .cmp(&a.descriptor.priority)
                    .then(a.seq.cmp(&b.seq))
            })
            .map(|e| e.descriptor.clone())
    }

    fn emit(&self, name: &str, event_type: AuditEventType, detail: String) {
        audit::emit(
            self.audit.as_ref(),
            AuditEvent::new(name, event_type, "router", detail),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use aatis_core::audit::MemoryAuditSink;

    struct Echo;

    #[async_trait]
    impl AgentCapability for Echo {
        async fn invoke(&self, task: &Task) -> Result<CapabilityOutput, CapabilityError> {
            Ok(CapabilityOutput::new(task.request.clone()))
        }
    }

    fn tags(list: &[&str]) -> BTreeSet<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn test_superset_and_priority() {
        let registry = CapabilityRegistry::new();
        registry
            .register(CapabilityDescriptor::new("a").accepts(["search", "summarize", "write"]).priority(1), Arc::new(Echo))
            .await
            .unwrap();
        registry
            .register(CapabilityDescriptor::new("b").accepts(["search"]).priority(5), Arc::new(Echo))
            .await
            .unwrap();

        let picked = registry.select(&tags(&["search", "summarize"]), &BTreeSet::new()).await.unwrap();
        assert_eq!(picked.name, "a");

        let picked = registry.select(&tags(&["search"]), &BTreeSet::new()).await.unwrap();
        assert_eq!(picked.name, "b");
    }

    #[tokio::test]
    async fn test_equal_priority_uses_registration_order() {
        let registry = CapabilityRegistry::new();
        for name in ["first", "second", "third"] {
            registry
                .register(CapabilityDescriptor::new(name).accepts(["scan"]).priority(3), Arc::new(Echo))
                .await
                .unwrap();
        }
        for _ in 0..5 {
            let picked = registry.select(&tags(&["scan"]), &BTreeSet::new()).await.unwrap();
            assert_eq!(picked.name, "first");
        }

        let picked = registry.select(&tags(&["scan"]), &tags(&["first"])).await.unwrap();
        assert_eq!(picked.name, "second");
    }

    #[tokio::test]
    async fn test_unhealthy_is_skipped() {
        let audit = Arc::new(MemoryAuditSink::new());
        let registry = CapabilityRegistry::new().with_audit(audit.clone());
        registry
            .register(CapabilityDescriptor::new("recon").accepts(["scan"]), Arc::new(Echo))
            .await
            .unwrap();

        registry.set_health("recon", false).await.unwrap();
        assert!(registry.select(&tags(&["scan"]), &BTreeSet::new()).await.is_none());
        assert!(registry.handler("recon").await.is_none());

        registry.set_health("recon", true).await.unwrap();
        assert!(registry.select(&tags(&["scan"]), &BTreeSet::new()).await.is_some());
        assert_eq!(audit.events_of(AuditEventType::CapabilityHealthChanged).len(), 2);
    }

    #[tokio::test]
    async fn test_register_validation() {
        let registry = CapabilityRegistry::new();
        registry
            .register(CapabilityDescriptor::new("recon"), Arc::new(Echo))
            .await
            .unwrap();
        assert!(registry.register(CapabilityDescriptor::new("recon"), Arc::new(Echo)).await.is_err());
        assert!(registry.register(CapabilityDescriptor::new("Bad Name"), Arc::new(Echo)).await.is_err());

        registry.deregister("recon").await.unwrap();
        assert!(registry.deregister("recon").await.unwrap_err().is_not_found());
        assert!(registry.list().await.is_empty());
    }

    #[tokio::test]
    async fn test_snapshot_persisted() {
        let db = Arc::new(Database::open_in_memory().unwrap());
        let registry = CapabilityRegistry::new().with_db(db.clone()).unwrap();
        registry
            .register(CapabilityDescriptor::new("recon").accepts(["scan"]), Arc::new(Echo))
            .await
            .unwrap();
        registry
            .register(CapabilityDescriptor::new("writer").accepts(["report"]), Arc::new(Echo))
            .await
            .unwrap();
        registry.deregister("writer").await.unwrap();

        let rows = db.list_capabilities().unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].1.name, "recon");

        let restarted = CapabilityRegistry::new().with_db(db).unwrap();
        let seq = restarted
            .register(CapabilityDescriptor::new("writer"), Arc::new(Echo))
            .await
            .unwrap();
        assert_eq!(seq, 2);
    }
}
