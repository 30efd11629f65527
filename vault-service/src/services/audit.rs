//! Append-only audit trail for role lifecycle and login attempts.

use async_trait::async_trait;
use chrono::Utc;
use sqlx::postgres::PgPool;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::models::{AuditContext, AuditEvent, AuditEventType};

#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn append(&self, event: &AuditEvent) -> Result<(), anyhow::Error>;
}

#[derive(Clone)]
pub struct PgAuditSink {
    pool: PgPool,
}

impl PgAuditSink {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl AuditSink for PgAuditSink {
    async fn append(&self, event: &AuditEvent) -> Result<(), anyhow::Error> {
        sqlx::query(
            r#"
            INSERT INTO audit_events (
                event_id, sequence_number, event_type, actor_type, actor_id,
                event_data, access_granted, correlation_id, created_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(event.event_id)
        .bind(event.sequence_number)
        .bind(&event.event_type)
        .bind(&event.actor_type)
        .bind(&event.actor_id)
        .bind(&event.event_data)
        .bind(event.access_granted)
        .bind(&event.correlation_id)
        .bind(event.created_at)
        .execute(&self.pool)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to insert audit event: {}", e))?;
        Ok(())
    }
}

/// Keeps events in process memory. Used without `DATABASE_URL` and in tests.
#[derive(Default)]
pub struct InMemoryAuditSink {
    events: RwLock<Vec<AuditEvent>>,
}

impl InMemoryAuditSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn events(&self) -> Vec<AuditEvent> {
        self.events.read().await.clone()
    }

    pub async fn events_of(&self, event_type: AuditEventType) -> Vec<AuditEvent> {
        self.events
            .read()
            .await
            .iter()
            .filter(|e| e.event_type == event_type.as_str())
            .cloned()
            .collect()
    }
}

#[async_trait]
impl AuditSink for InMemoryAuditSink {
    async fn append(&self, event: &AuditEvent) -> Result<(), anyhow::Error> {
        self.events.write().await.push(event.clone());
        Ok(())
    }
}

/// Stamps events with a process-wide sequence number and hands them to the
/// sink. Write failures are logged and never surface to the caller.
#[derive(Clone)]
pub struct AuditService {
    sink: Arc<dyn AuditSink>,
    sequence: Arc<AtomicU64>,
}

impl AuditService {
    pub fn new(sink: Arc<dyn AuditSink>) -> Self {
        // Seeded from wall-clock millis so numbers keep rising across restarts.
        let seed = Utc::now().timestamp_millis().max(0) as u64;
        Self {
            sink,
            sequence: Arc::new(AtomicU64::new(seed)),
        }
    }

    fn next_sequence(&self) -> i64 {
        self.sequence.fetch_add(1, Ordering::SeqCst) as i64
    }

    pub async fn record(
        &self,
        event_type: AuditEventType,
        context: &AuditContext,
        event_data: serde_json::Value,
    ) {
        let event = AuditEvent::new(self.next_sequence(), event_type, context, event_data);

        if let Err(e) = self.sink.append(&event).await {
            tracing::error!(
                event_id = %event.event_id,
                event_type = %event.event_type,
                error = %e,
                "Failed to write audit event"
            );
        }
    }
}
