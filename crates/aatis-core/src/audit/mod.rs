//! Append-only audit stream.
//!
//! Every task transition, tier transition, eviction, verdict and registry
//! change is emitted as an [`AuditEvent`] to an [`AuditSink`]. Sinks only
//! append; nothing in the core reads them back to make decisions.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Kind of audited event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditEventType {
    TaskCreated,
    TaskTransition,
    MemoryWritten,
    MemoryPromoted,
    MemoryDemoted,
    MemoryEvicted,
    PolicyVerdict,
    RuleSetLoaded,
    RuleSetRejected,
    CapabilityRegistered,
    CapabilityDeregistered,
    CapabilityHealthChanged,
}

impl AuditEventType {
    /// Convert to string for storage.
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditEventType::TaskCreated => "task_created",
            AuditEventType::TaskTransition => "task_transition",
            AuditEventType::MemoryWritten => "memory_written",
            AuditEventType::MemoryPromoted => "memory_promoted",
            AuditEventType::MemoryDemoted => "memory_demoted",
            AuditEventType::MemoryEvicted => "memory_evicted",
            AuditEventType::PolicyVerdict => "policy_verdict",
            AuditEventType::RuleSetLoaded => "rule_set_loaded",
            AuditEventType::RuleSetRejected => "rule_set_rejected",
            AuditEventType::CapabilityRegistered => "capability_registered",
            AuditEventType::CapabilityDeregistered => "capability_deregistered",
            AuditEventType::CapabilityHealthChanged => "capability_health_changed",
        }
    }
}

impl std::fmt::Display for AuditEventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for AuditEventType {
    type Err = String;
    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let all = [
            AuditEventType::TaskCreated,
            AuditEventType::TaskTransition,
            AuditEventType::MemoryWritten,
            AuditEventType::MemoryPromoted,
            AuditEventType::MemoryDemoted,
            AuditEventType::MemoryEvicted,
            AuditEventType::PolicyVerdict,
            AuditEventType::RuleSetLoaded,
            AuditEventType::RuleSetRejected,
            AuditEventType::CapabilityRegistered,
            AuditEventType::CapabilityDeregistered,
            AuditEventType::CapabilityHealthChanged,
        ];
        all.into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| format!("Invalid audit event type: {}", s))
    }
}

/// One entry of the audit stream
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditEvent {
    pub entity_id: String,
    pub event_type: AuditEventType,
    pub timestamp: DateTime<Utc>,
    pub actor: String,
    pub detail: String,
}

impl AuditEvent {
    /// Create an event stamped with the current time
    pub fn new(
        entity_id: impl Into<String>,
        event_type: AuditEventType,
        actor: impl Into<String>,
        detail: impl Into<String>,
    ) -> Self {
        Self {
            entity_id: entity_id.into(),
            event_type,
            timestamp: Utc::now(),
            actor: actor.into(),
            detail: detail.into(),
        }
    }

    /// Override the timestamp (for events that carry their own clock)
    pub fn at(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }
}

/// Destination of the audit stream.
pub trait AuditSink: Send + Sync {
    /// Append one event.
    fn record(&self, event: &AuditEvent) -> Result<()>;
}

/// Sink that drops everything
#[derive(Debug, Default, Clone, Copy)]
pub struct NullAuditSink;

impl AuditSink for NullAuditSink {
    fn record(&self, _event: &AuditEvent) -> Result<()> {
        Ok(())
    }
}

/// Sink that keeps events in memory, mostly for tests and inspection
#[derive(Debug, Default)]
pub struct MemoryAuditSink {
    events: Mutex<Vec<AuditEvent>>,
}

impl MemoryAuditSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of all recorded events, oldest first
    pub fn events(&self) -> Vec<AuditEvent> {
        self.events
            .lock()
            .map(|events| events.clone())
            .unwrap_or_default()
    }

    /// Recorded events of one type
    pub fn events_of(&self, event_type: AuditEventType) -> Vec<AuditEvent> {
        self.events()
            .into_iter()
            .filter(|e| e.event_type == event_type)
            .collect()
    }
}

impl AuditSink for MemoryAuditSink {
    fn record(&self, event: &AuditEvent) -> Result<()> {
        let mut events = self.events.lock().map_err(|_| Error::LockPoisoned)?;
        events.push(event.clone());
        Ok(())
    }
}

/// Sink that appends one JSON object per line to a file
pub struct JsonlAuditSink {
    path: PathBuf,
    file: Mutex<File>,
}

impl JsonlAuditSink {
    /// Open (or create) the file in append mode
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self {
            path,
            file: Mutex::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read back every event in the file
    pub fn read_all(path: impl AsRef<Path>) -> Result<Vec<AuditEvent>> {
        let content = std::fs::read_to_string(path)?;
        content
            .lines()
            .filter(|line| !line.trim().is_empty())
            .map(|line| serde_json::from_str(line).map_err(Error::from))
            .collect()
    }
}

impl AuditSink for JsonlAuditSink {
    fn record(&self, event: &AuditEvent) -> Result<()> {
        let line = serde_json::to_string(event)?;
        let mut file = self.file.lock().map_err(|_| Error::LockPoisoned)?;
        writeln!(file, "{}", line)?;
        file.flush()?;
        Ok(())
    }
}

/// Sink that forwards every event to several sinks.
///
/// All sinks are attempted; the first error is returned.
#[derive(Default, Clone)]
pub struct FanoutAuditSink {
    sinks: Vec<Arc<dyn AuditSink>>,
}

impl FanoutAuditSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, sink: Arc<dyn AuditSink>) -> Self {
        self.sinks.push(sink);
        self
    }

    pub fn len(&self) -> usize {
        self.sinks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sinks.is_empty()
    }
}

impl AuditSink for FanoutAuditSink {
    fn record(&self, event: &AuditEvent) -> Result<()> {
        let mut first_err = None;
        for sink in &self.sinks {
            if let Err(e) = sink.record(event) {
                tracing::warn!(entity_id = %event.entity_id, error = %e, "Audit sink rejected event");
                first_err.get_or_insert(e);
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

/// Record an event, logging instead of failing when the sink errors.
///
/// Audit failures must not abort the operation being audited.
pub fn emit(sink: &dyn AuditSink, event: AuditEvent) {
    if let Err(e) = sink.record(&event) {
        tracing::error!(
            entity_id = %event.entity_id,
            event_type = %event.event_type,
            error = %e,
            "Failed to record audit event"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_memory_sink_keeps_order() {
        let sink = MemoryAuditSink::new();
        emit(&sink, AuditEvent::new("t-1", AuditEventType::TaskCreated, "router", "created"));
        emit(&sink, AuditEvent::new("t-1", AuditEventType::TaskTransition, "router", "received -> routed"));

        let events = sink.events();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].event_type, AuditEventType::TaskCreated);
        assert_eq!(sink.events_of(AuditEventType::TaskTransition).len(), 1);
    }

    #[test]
    fn test_jsonl_sink_appends() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("audit/events.jsonl");

        {
            let sink = JsonlAuditSink::open(&path).unwrap();
            sink.record(&AuditEvent::new("mem-1", AuditEventType::MemoryEvicted, "memory", "tier=long_term")).unwrap();
        }
        {
            let sink = JsonlAuditSink::open(&path).unwrap();
            sink.record(&AuditEvent::new("mem-2", AuditEventType::MemoryEvicted, "memory", "tier=short_term")).unwrap();
        }

        let events = JsonlAuditSink::read_all(&path).unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].entity_id, "mem-1");
        assert_eq!(events[1].detail, "tier=short_term");
    }

    #[test]
    fn test_fanout_reaches_every_sink() {
        let a = Arc::new(MemoryAuditSink::new());
        let b = Arc::new(MemoryAuditSink::new());
        let fanout = FanoutAuditSink::new().with(a.clone()).with(b.clone());
        assert_eq!(fanout.len(), 2);

        fanout.record(&AuditEvent::new("cap", AuditEventType::CapabilityRegistered, "operator", "")).unwrap();
        assert_eq!(a.events().len(), 1);
        assert_eq!(b.events().len(), 1);
    }

    #[test]
    fn test_event_type_parse() {
        assert_eq!("memory_evicted".parse::<AuditEventType>().unwrap(), AuditEventType::MemoryEvicted);
        assert!("nope".parse::<AuditEventType>().is_err());
    }
}
