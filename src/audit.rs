//! Audit consumer: records every message it sees.
//!
//! Meant to be subscribed with pattern `#` so it receives everything on an
//! exchange. Messages it does not recognise are still recorded, under the
//! generic `user.activity` type. Each record goes to every sink in parallel;
//! a sink failure is logged and never fails the delivery. There is no atomic
//! write across sinks.

use std::error::Error;
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use futures_util::future::join_all;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, error, info};
use uuid::Uuid;

use crate::bus::MessageHandler;
use crate::envelope::{now_ms, Envelope};
use crate::error::HandlerError;

/// Event type recorded when a message has no `type` field.
pub const FALLBACK_EVENT_TYPE: &str = "user.activity";

/// Actor recorded when the envelope names no user.
pub const SYSTEM_ACTOR: &str = "system";

pub type SinkError = Box<dyn Error + Send + Sync>;

/// One audited message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditRecord {
    pub id: Uuid,
    #[serde(rename = "type")]
    pub event_type: String,
    pub service: String,
    pub timestamp: u64,
    pub actor: String,
    pub data: Value,
}

impl AuditRecord {
    pub fn from_envelope(envelope: &Envelope) -> Self {
        let metadata = envelope.metadata();
        Self {
            id: Uuid::new_v4(),
            event_type: envelope
                .event_type()
                .unwrap_or(FALLBACK_EVENT_TYPE)
                .to_string(),
            service: envelope.source_service().to_string(),
            timestamp: metadata.map(|m| m.timestamp).unwrap_or_else(now_ms),
            actor: metadata
                .and_then(|m| m.user_id.clone())
                .unwrap_or_else(|| SYSTEM_ACTOR.to_string()),
            data: envelope.body().clone(),
        }
    }
}

/// Destination for audit records (document store, search index, ...).
#[async_trait]
pub trait AuditSink: Send + Sync {
    fn name(&self) -> &str;

    async fn store(&self, record: &AuditRecord) -> Result<(), SinkError>;
}

/// Message handler writing every message to all sinks.
#[derive(Clone, Default)]
pub struct AuditHandler {
    sinks: Vec<Arc<dyn AuditSink>>,
}

impl AuditHandler {
    pub fn new(sinks: Vec<Arc<dyn AuditSink>>) -> Self {
        Self { sinks }
    }

    pub fn with_sink(mut self, sink: impl AuditSink + 'static) -> Self {
        self.sinks.push(Arc::new(sink));
        self
    }

    /// Store `record` in every sink, returning the names of the sinks that failed.
    pub async fn record(&self, record: &AuditRecord) -> Vec<String> {
        let results = join_all(self.sinks.iter().map(|sink| sink.store(record))).await;

        let mut failed = Vec::new();
        for (sink, result) in self.sinks.iter().zip(results) {
            match result {
                Ok(()) => debug!(sink = sink.name(), id = %record.id, "audit record stored"),
                Err(err) => {
                    error!(sink = sink.name(), id = %record.id, error = %err, "audit record not stored");
                    failed.push(sink.name().to_string());
                }
            }
        }
        failed
    }
}

#[async_trait]
impl MessageHandler for AuditHandler {
    async fn handle(&self, envelope: Envelope) -> Result<(), HandlerError> {
        let record = AuditRecord::from_envelope(&envelope);
        info!(event_type = %record.event_type, source = %record.service, "recording audit event");
        self.record(&record).await;
        Ok(())
    }
}

/// Sink keeping records in memory.
#[derive(Clone, Default)]
pub struct InMemoryAuditSink {
    name: String,
    records: Arc<Mutex<Vec<AuditRecord>>>,
    failing: bool,
}

impl InMemoryAuditSink {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    /// A sink whose every write fails.
    pub fn failing(name: impl Into<String>) -> Self {
        Self {
            failing: true,
            ..Self::new(name)
        }
    }

    pub fn records(&self) -> Vec<AuditRecord> {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[async_trait]
impl AuditSink for InMemoryAuditSink {
    fn name(&self) -> &str {
        &self.name
    }

    async fn store(&self, record: &AuditRecord) -> Result<(), SinkError> {
        if self.failing {
            return Err(format!("{} is unavailable", self.name).into());
        }
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(record.clone());
        Ok(())
    }
}
