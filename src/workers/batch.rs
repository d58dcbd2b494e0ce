use std::sync::Arc;
use std::time::Duration;

use anyhow::{Error, Result, anyhow};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use crate::{
    clients::{
        kafka::{BusSink, KafkaSink},
        postgres::{PgStore, Store},
        redis::{KeyValueStore, RedisClient},
    },
    config::Config,
    models::{
        message::{BatchMessage, Filter, InputMessage, Modifier, TemplatedMessage},
        progress::JobProgress,
        retry::RetryConfig,
    },
    templates::cache::TemplateCache,
    utils::now_nanos,
    workers::{builder, fetcher, parser, publisher, reader, shared, status},
};

/// Orchestrates one job run: owns the shared client handles, wires the
/// stage queues, spawns the worker pools, and tears everything down when
/// the pipeline drains or a fatal error cancels it.
pub struct BatchWorker {
    /// Identity of this worker instance; the first half of the status key.
    pub id: Uuid,
    config: Config,
    store: Arc<dyn Store>,
    kv: Arc<dyn KeyValueStore>,
    sink: Arc<dyn BusSink>,
    cache: Arc<TemplateCache>,
}

impl BatchWorker {
    /// Connects the real clients. Connections are held for the lifetime of
    /// the worker and released when it drops.
    pub async fn connect(config: Config) -> Result<Self, Error> {
        let store = Arc::new(PgStore::connect(&config).await?);
        let kv = Arc::new(RedisClient::connect(&config).await?);
        let sink = Arc::new(KafkaSink::connect(&config)?);
        Ok(Self::with_clients(config, store, kv, sink))
    }

    pub fn with_clients(
        config: Config,
        store: Arc<dyn Store>,
        kv: Arc<dyn KeyValueStore>,
        sink: Arc<dyn BusSink>,
    ) -> Self {
        let cache = Arc::new(TemplateCache::new(
            Duration::from_secs(config.template_cache_ttl_seconds),
            config.template_cache_capacity,
        ));
        Self {
            id: Uuid::new_v4(),
            config,
            store,
            kv,
            sink,
            cache,
        }
    }

    /// Runs the staged pipeline for a store-selected audience.
    pub async fn run(
        &self,
        job: InputMessage,
        filters: Vec<Filter>,
        modifiers: Vec<Modifier>,
    ) -> Result<(), Error> {
        let job = self.apply_job_defaults(job);
        let modifiers = self.apply_default_modifiers(modifiers);

        self.store
            .find_app(&job.app_name)
            .await?
            .ok_or_else(|| anyhow!("Unknown app: {}", job.app_name))?;

        let progress = Arc::new(JobProgress::new(job.clone(), filters.clone()));
        let cancel = CancellationToken::new();
        let status_stop = CancellationToken::new();

        info!(job_id = %job.job_id, app = %job.app_name, service = %job.service, "Starting worker pipeline");

        let status_handle = tokio::spawn(status::run(
            self.id,
            progress.clone(),
            self.kv.clone(),
            self.config.status_interval_ms,
            status_stop.clone(),
        ));

        let (raw_tx, raw_rx) = mpsc::channel(self.config.pg_to_parser_chan_size.max(1));
        let (parsed_tx, parsed_rx) =
            mpsc::channel(self.config.parser_to_fetcher_chan_size.max(1));
        let (templated_tx, templated_rx) =
            mpsc::channel(self.config.fetcher_to_builder_chan_size.max(1));
        let (bus_tx, bus_rx) = mpsc::channel(self.config.builder_to_producer_chan_size.max(1));

        let raw_rx = shared(raw_rx);
        let parsed_rx = shared(parsed_rx);
        let templated_rx = shared(templated_rx);
        let bus_rx = shared(bus_rx);

        let mut handles: Vec<JoinHandle<()>> = Vec::new();

        for worker_id in 0..self.config.parsers.max(1) {
            handles.push(tokio::spawn(parser::run(
                worker_id,
                false,
                raw_rx.clone(),
                parsed_tx.clone(),
                progress.clone(),
                cancel.clone(),
            )));
        }
        drop(parsed_tx);

        for worker_id in 0..self.config.fetchers.max(1) {
            handles.push(tokio::spawn(fetcher::run(
                worker_id,
                parsed_rx.clone(),
                templated_tx.clone(),
                self.store.clone(),
                self.cache.clone(),
                self.config.retry_config(),
                self.config.default_locale.clone(),
                progress.clone(),
                cancel.clone(),
            )));
        }
        drop(templated_tx);

        for worker_id in 0..self.config.builders.max(1) {
            handles.push(tokio::spawn(builder::run(
                worker_id,
                templated_rx.clone(),
                bus_tx.clone(),
                progress.clone(),
                cancel.clone(),
            )));
        }
        drop(bus_tx);

        for worker_id in 0..self.config.producers.max(1) {
            handles.push(tokio::spawn(publisher::run(
                worker_id,
                bus_rx.clone(),
                self.sink.clone(),
                RetryConfig::from_config(&self.config),
                progress.clone(),
                cancel.clone(),
            )));
        }

        let reader_result = reader::run(
            self.store.clone(),
            &job,
            &filters,
            &modifiers,
            progress.clone(),
            raw_tx,
            &self.config.retry_config(),
            &cancel,
        )
        .await;

        if let Err(e) = &reader_result {
            warn!(job_id = %job.job_id, error = %e, "Reader failed, cancelling pipeline");
            cancel.cancel();
        }

        self.shutdown(handles, status_stop, status_handle).await;

        info!(
            job_id = %job.job_id,
            processed_tokens = progress.processed_tokens(),
            produced_messages = progress.counters.produced_messages.get(),
            "Worker pipeline finished"
        );

        reader_result
    }

    /// Runs the fetcher-less pipeline for a job whose template and users
    /// arrive inline as one batch.
    pub async fn run_batch(&self, batch: BatchMessage) -> Result<(), Error> {
        let job = self.apply_job_defaults(InputMessage {
            job_id: batch.job_id,
            app_name: batch.app_name.clone(),
            service: batch.service.clone(),
            template_name: String::new(),
            context: batch.context.clone(),
            metadata: batch.metadata.clone(),
            expires_at: batch.expires_at,
            user_id: None,
            token: String::new(),
            locale: String::new(),
            tz: None,
        });

        let progress = Arc::new(JobProgress::new(job.clone(), Vec::new()));
        let cancel = CancellationToken::new();
        let status_stop = CancellationToken::new();

        info!(
            job_id = %job.job_id,
            app = %job.app_name,
            service = %job.service,
            users = batch.users.len(),
            "Starting batch pipeline"
        );

        let status_handle = tokio::spawn(status::run(
            self.id,
            progress.clone(),
            self.kv.clone(),
            self.config.status_interval_ms,
            status_stop.clone(),
        ));

        let (templated_tx, templated_rx) =
            mpsc::channel(self.config.fetcher_to_builder_chan_size.max(1));
        let (bus_tx, bus_rx) = mpsc::channel(self.config.builder_to_producer_chan_size.max(1));
        let templated_rx = shared(templated_rx);
        let bus_rx = shared(bus_rx);

        let mut handles: Vec<JoinHandle<()>> = Vec::new();

        for worker_id in 0..self.config.builders.max(1) {
            handles.push(tokio::spawn(builder::run(
                worker_id,
                templated_rx.clone(),
                bus_tx.clone(),
                progress.clone(),
                cancel.clone(),
            )));
        }
        drop(bus_tx);

        for worker_id in 0..self.config.producers.max(1) {
            handles.push(tokio::spawn(publisher::run(
                worker_id,
                bus_rx.clone(),
                self.sink.clone(),
                self.config.retry_config(),
                progress.clone(),
                cancel.clone(),
            )));
        }

        progress.set_total_tokens(batch.users.len() as i64);
        progress.set_total_pages(1);

        for user in &batch.users {
            if cancel.is_cancelled() {
                break;
            }

            let mut record = job.clone();
            record.user_id = Uuid::parse_str(&user.user_id).ok();
            record.token = user.token.clone();

            progress.incr_processed_tokens();

            if record.token.is_empty() {
                progress.counters.parser_skipped.incr();
                continue;
            }

            let context =
                fetcher::merge_context(&batch.template.defaults, &batch.context, &record);
            let templated = TemplatedMessage {
                body: batch.template.body.clone(),
                context,
                message: record,
            };
            let sent = tokio::select! {
                _ = cancel.cancelled() => break,
                sent = templated_tx.send(templated) => sent,
            };
            if sent.is_err() {
                break;
            }
        }
        progress.incr_processed_pages();
        drop(templated_tx);

        self.shutdown(handles, status_stop, status_handle).await;

        info!(
            job_id = %job.job_id,
            produced_messages = progress.counters.produced_messages.get(),
            "Batch pipeline finished"
        );

        Ok(())
    }

    async fn shutdown(
        &self,
        handles: Vec<JoinHandle<()>>,
        status_stop: CancellationToken,
        status_handle: JoinHandle<()>,
    ) {
        for handle in handles {
            let _ = handle.await;
        }
        if let Err(e) = self.sink.close().await {
            warn!(error = %e, "Failed to flush bus sink");
        }
        status_stop.cancel();
        let _ = status_handle.await;
    }

    /// Jobs without an expiry pick up the configured default push expiry.
    fn apply_job_defaults(&self, mut job: InputMessage) -> InputMessage {
        if job.expires_at == 0 && self.config.push_expiry_seconds > 0 {
            job.expires_at = now_nanos()
                .saturating_add(self.config.push_expiry_seconds.saturating_mul(1_000_000_000));
        }
        job
    }

    /// Fills in the configured LIMIT and ORDER BY when the job does not set
    /// them. A job that sets an explicit non-positive limit stays invalid.
    fn apply_default_modifiers(&self, mut modifiers: Vec<Modifier>) -> Vec<Modifier> {
        if !modifiers.iter().any(|m| m.op == "LIMIT") {
            modifiers.push(Modifier::limit(self.config.default_modifier_limit));
        }
        if !modifiers.iter().any(|m| m.op == "ORDER BY") {
            modifiers.push(Modifier::order_by(&self.config.default_modifier_order));
        }
        modifiers
    }
}
