use std::sync::Arc;

use anyhow::{Error, Result, anyhow};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::{
    clients::postgres::Store,
    models::{
        message::{Filter, InputMessage, Modifier, limit_from_modifiers, order_from_modifiers},
        progress::JobProgress,
        retry::RetryConfig,
    },
    utils::retry_with_backoff,
};

const DEFAULT_ORDER_BY: &str = "updated_at ASC";

/// Drives the pipeline: paginates user tokens out of the store and emits
/// one serialized job-plus-user record per device. Closing the output
/// channel (by returning) is what lets the downstream stages drain.
///
/// Errors here are resource-level and fatal for the whole job; the
/// orchestrator reacts by cancelling every stage.
pub async fn run(
    store: Arc<dyn Store>,
    message: &InputMessage,
    filters: &[Filter],
    modifiers: &[Modifier],
    progress: Arc<JobProgress>,
    out_tx: mpsc::Sender<String>,
    retry: &RetryConfig,
    cancel: &CancellationToken,
) -> Result<(), Error> {
    let limit = limit_from_modifiers(modifiers).unwrap_or(-1);
    if limit <= 0 {
        return Err(anyhow!(
            "InvalidModifier: limit must be greater than 0, got {}",
            limit
        ));
    }
    let order_by =
        order_from_modifiers(modifiers).unwrap_or_else(|| DEFAULT_ORDER_BY.to_string());

    let app = &message.app_name;
    let service = &message.service;

    let total_tokens = retry_with_backoff(retry, || {
        store.count_user_tokens(app, service, filters)
    })
    .await
    .map_err(|e| anyhow!("Error while counting tokens: {}", e))?;
    progress.set_total_tokens(total_tokens);

    let total_pages = if total_tokens == 0 {
        0
    } else {
        (total_tokens + limit - 1) / limit
    };
    progress.set_total_pages(total_pages);

    info!(
        job_id = %message.job_id,
        total_tokens,
        total_pages,
        limit,
        order_by = %order_by,
        "Starting user token read"
    );

    for page in 0..total_pages {
        if cancel.is_cancelled() {
            return Ok(());
        }

        let offset = page * limit;
        let batch = retry_with_backoff(retry, || {
            store.select_user_tokens(app, service, filters, limit, offset, &order_by)
        })
        .await
        .map_err(|e| anyhow!("Failed to read user token batch at page {}: {}", page, e))?;

        debug!(page, batch = batch.len(), "Read user token page");

        for user in batch {
            let mut record = message.clone();
            record.user_id = Some(user.user_id);
            record.token = user.token;
            record.locale = user.locale;
            record.tz = user.tz;

            let raw = serde_json::to_string(&record)
                .map_err(|e| anyhow!("Failed to serialize user record: {}", e))?;

            tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                sent = out_tx.send(raw) => {
                    sent.map_err(|_| anyhow!("Parser input channel closed early"))?;
                }
            }
            progress.incr_processed_tokens();
        }

        progress.incr_processed_pages();
    }

    info!(job_id = %message.job_id, "Finished reading user tokens");

    Ok(())
}
