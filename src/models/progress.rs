use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

use chrono::Utc;
use serde::Serialize;
use uuid::Uuid;

use crate::models::message::{Filter, InputMessage};

/// A monotone, lock-free event counter.
#[derive(Debug, Default)]
pub struct Counter(AtomicU64);

impl Counter {
    pub fn incr(&self) {
        self.0.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(&self, n: u64) {
        self.0.fetch_add(n, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

/// Per-stage drop and output accounting. Every record the reader emits ends
/// up either in `produced_messages` or in exactly one drop counter.
#[derive(Debug, Default)]
pub struct StageCounters {
    pub parser_errors: Counter,
    pub parser_skipped: Counter,
    pub template_missing: Counter,
    pub fetcher_errors: Counter,
    pub unresolved_variables: Counter,
    pub builder_errors: Counter,
    pub expired: Counter,
    pub publish_errors: Counter,
    pub produced_messages: Counter,
}

/// Live progress for one job run. Owned by the orchestrator, written by the
/// pipeline stages through atomics, snapshotted by the status reporter. All
/// fields are monotone non-decreasing.
#[derive(Debug)]
pub struct JobProgress {
    pub job_id: Uuid,
    pub started_at: i64,
    pub message: InputMessage,
    pub filters: Vec<Filter>,
    pub counters: StageCounters,
    total_tokens: AtomicI64,
    processed_tokens: AtomicI64,
    total_pages: AtomicI64,
    processed_pages: AtomicI64,
}

impl JobProgress {
    pub fn new(message: InputMessage, filters: Vec<Filter>) -> Self {
        Self {
            job_id: message.job_id,
            started_at: Utc::now().timestamp(),
            message,
            filters,
            counters: StageCounters::default(),
            total_tokens: AtomicI64::new(0),
            processed_tokens: AtomicI64::new(0),
            total_pages: AtomicI64::new(0),
            processed_pages: AtomicI64::new(0),
        }
    }

    pub fn set_total_tokens(&self, total: i64) {
        self.total_tokens.store(total, Ordering::Relaxed);
    }

    pub fn set_total_pages(&self, total: i64) {
        self.total_pages.store(total, Ordering::Relaxed);
    }

    pub fn incr_processed_tokens(&self) {
        self.processed_tokens.fetch_add(1, Ordering::Relaxed);
    }

    pub fn incr_processed_pages(&self) {
        self.processed_pages.fetch_add(1, Ordering::Relaxed);
    }

    pub fn total_tokens(&self) -> i64 {
        self.total_tokens.load(Ordering::Relaxed)
    }

    pub fn processed_tokens(&self) -> i64 {
        self.processed_tokens.load(Ordering::Relaxed)
    }

    /// Captures each field with an independent read. The snapshot is not
    /// globally consistent, but every field is monotone.
    pub fn snapshot(&self) -> ProgressSnapshot {
        ProgressSnapshot {
            notification_id: self.job_id,
            started_at: self.started_at,
            total_tokens: self.total_tokens.load(Ordering::Relaxed),
            processed_tokens: self.processed_tokens.load(Ordering::Relaxed),
            total_pages: self.total_pages.load(Ordering::Relaxed),
            processed_pages: self.processed_pages.load(Ordering::Relaxed),
            message: self.message.clone(),
            filters: self.filters.clone(),
            counters: CounterSnapshot {
                parser_errors: self.counters.parser_errors.get(),
                parser_skipped: self.counters.parser_skipped.get(),
                template_missing: self.counters.template_missing.get(),
                fetcher_errors: self.counters.fetcher_errors.get(),
                unresolved_variables: self.counters.unresolved_variables.get(),
                builder_errors: self.counters.builder_errors.get(),
                expired: self.counters.expired.get(),
                publish_errors: self.counters.publish_errors.get(),
                produced_messages: self.counters.produced_messages.get(),
            },
        }
    }
}

/// The KV value written by the status reporter. Field names are part of the
/// status contract.
#[derive(Debug, Clone, Serialize)]
pub struct ProgressSnapshot {
    #[serde(rename = "notificationID")]
    pub notification_id: Uuid,
    #[serde(rename = "startedAt")]
    pub started_at: i64,
    #[serde(rename = "totalTokens")]
    pub total_tokens: i64,
    #[serde(rename = "processedTokens")]
    pub processed_tokens: i64,
    #[serde(rename = "totalPages")]
    pub total_pages: i64,
    #[serde(rename = "processedPages")]
    pub processed_pages: i64,
    pub message: InputMessage,
    pub filters: Vec<Filter>,
    pub counters: CounterSnapshot,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CounterSnapshot {
    pub parser_errors: u64,
    pub parser_skipped: u64,
    pub template_missing: u64,
    pub fetcher_errors: u64,
    pub unresolved_variables: u64,
    pub builder_errors: u64,
    pub expired: u64,
    pub publish_errors: u64,
    pub produced_messages: u64,
}
