//! Billing audit sink.
//!
//! Every priced request emits exactly one audit record: a success record with
//! the bill and the card version that produced it, or a failure record naming
//! the pricing stage that failed. Dispatch is fire-and-forget from the
//! caller's point of view; a sink error is logged and never propagates into
//! the request or stream path.

use crate::pricing::Bill;
use crate::types::{RequestId, TeamId};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tracing::{error, info, warn};

/// Pricing stage at which a request failed to produce a bill.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureStage {
    CardLookup,
    UsageExtraction,
    StreamAborted,
    Finalize,
}

impl std::fmt::Display for FailureStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let stage = match self {
            Self::CardLookup => "card_lookup",
            Self::UsageExtraction => "usage_extraction",
            Self::StreamAborted => "stream_aborted",
            Self::Finalize => "finalize",
        };
        f.write_str(stage)
    }
}

/// Audit record for a successfully priced request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SuccessRecord {
    pub request_id: RequestId,
    pub team_id: Option<TeamId>,
    pub provider: String,
    pub model: String,
    pub endpoint: String,
    pub pricing_plan: String,
    /// Card version (max `updated_at` of its rules) that priced the request.
    pub card_version: DateTime<Utc>,
    pub usage: Value,
    pub bill: Bill,
    pub latency_ms: Option<i64>,
    pub generation_ms: Option<i64>,
    pub finish_reason: Option<String>,
    pub recorded_at: DateTime<Utc>,
}

/// Audit record for a request that could not be priced.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailureRecord {
    pub request_id: RequestId,
    pub team_id: Option<TeamId>,
    pub provider: String,
    pub model: String,
    pub endpoint: String,
    pub stage: FailureStage,
    pub error_code: String,
    pub error_message: String,
    pub status_code: Option<u16>,
    pub recorded_at: DateTime<Utc>,
}

/// Destination for billing audit records. Implementations may persist to a
/// database, forward to an external ledger, or just log.
#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn record_success(&self, record: SuccessRecord) -> anyhow::Result<()>;
    async fn record_failure(&self, record: FailureRecord) -> anyhow::Result<()>;
}

/// Records a success off the response path. Sink errors are logged with the
/// request context and swallowed.
pub fn dispatch_success(sink: Arc<dyn AuditSink>, record: SuccessRecord) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let request_id = record.request_id;
        if let Err(err) = sink.record_success(record).await {
            error!(request_id = %request_id, error = %err, "audit sink rejected success record");
        }
    })
}

/// Records a failure off the response path. Sink errors are logged with the
/// request context and swallowed.
pub fn dispatch_failure(sink: Arc<dyn AuditSink>, record: FailureRecord) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let request_id = record.request_id;
        if let Err(err) = sink.record_failure(record).await {
            error!(request_id = %request_id, error = %err, "audit sink rejected failure record");
        }
    })
}

/// Sink that emits records as structured log events. The default when no
/// persistent ledger is wired in.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingAuditSink;

#[async_trait]
impl AuditSink for TracingAuditSink {
    async fn record_success(&self, record: SuccessRecord) -> anyhow::Result<()> {
        info!(
            request_id = %record.request_id,
            provider = %record.provider,
            model = %record.model,
            endpoint = %record.endpoint,
            plan = %record.pricing_plan,
            card_version = %record.card_version,
            total_nanos = record.bill.total_nanos,
            total = %record.bill.total_usd_str,
            lines = record.bill.lines.len(),
            "billing audit: priced"
        );
        Ok(())
    }

    async fn record_failure(&self, record: FailureRecord) -> anyhow::Result<()> {
        warn!(
            request_id = %record.request_id,
            provider = %record.provider,
            model = %record.model,
            endpoint = %record.endpoint,
            stage = %record.stage,
            error_code = %record.error_code,
            error_message = %record.error_message,
            "billing audit: unpriced"
        );
        Ok(())
    }
}

/// In-memory sink for tests and the simulator's dry runs.
#[derive(Debug, Default)]
pub struct MemoryAuditSink {
    successes: std::sync::Mutex<Vec<SuccessRecord>>,
    failures: std::sync::Mutex<Vec<FailureRecord>>,
}

impl MemoryAuditSink {
    pub fn successes(&self) -> Vec<SuccessRecord> {
        self.successes.lock().map(|records| records.clone()).unwrap_or_default()
    }

    pub fn failures(&self) -> Vec<FailureRecord> {
        self.failures.lock().map(|records| records.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl AuditSink for MemoryAuditSink {
    async fn record_success(&self, record: SuccessRecord) -> anyhow::Result<()> {
        self.successes
            .lock()
            .map_err(|_| anyhow::anyhow!("audit sink poisoned"))?
            .push(record);
        Ok(())
    }

    async fn record_failure(&self, record: FailureRecord) -> anyhow::Result<()> {
        self.failures
            .lock()
            .map_err(|_| anyhow::anyhow!("audit sink poisoned"))?
            .push(record);
        Ok(())
    }
}
