use std::sync::Arc;

use tokio::time::{Duration, interval};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::{clients::redis::KeyValueStore, models::progress::JobProgress};

/// Periodically serializes the job progress and writes it under
/// `<notifierId>|<jobId>`. KV failures are logged, never fatal; a final
/// flush runs on stop.
pub async fn run(
    notifier_id: Uuid,
    progress: Arc<JobProgress>,
    kv: Arc<dyn KeyValueStore>,
    interval_ms: u64,
    stop: CancellationToken,
) {
    let key = format!("{}|{}", notifier_id, progress.job_id);
    let mut ticker = interval(Duration::from_millis(interval_ms.max(1)));

    debug!(key = %key, "Starting status reporter");

    loop {
        tokio::select! {
            _ = stop.cancelled() => break,
            _ = ticker.tick() => write_status(&key, &progress, kv.as_ref()).await,
        }
    }

    write_status(&key, &progress, kv.as_ref()).await;

    debug!(key = %key, "Status reporter exiting");
}

async fn write_status(key: &str, progress: &JobProgress, kv: &dyn KeyValueStore) {
    let snapshot = progress.snapshot();
    match serde_json::to_string(&snapshot) {
        Ok(status) => {
            if let Err(e) = kv.set(key, &status).await {
                warn!(key, error = %e, "Failed to write job status");
            }
        }
        Err(e) => warn!(key, error = %e, "Failed to serialize job status"),
    }
}
