use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use crate::{
    clients::kafka::BusSink,
    models::{message::BusMessage, progress::JobProgress, retry::RetryConfig},
    utils::retry_with_backoff,
    workers::{SharedReceiver, next_item},
};

/// Drains rendered messages into the bus. Sends are retried with backoff;
/// a terminally failing message is dropped and counted so the pipeline
/// never blocks on the bus.
pub async fn run(
    worker_id: usize,
    in_rx: SharedReceiver<BusMessage>,
    sink: Arc<dyn BusSink>,
    retry: RetryConfig,
    progress: Arc<JobProgress>,
    cancel: CancellationToken,
) {
    loop {
        let message = tokio::select! {
            _ = cancel.cancelled() => break,
            message = next_item(&in_rx) => match message {
                Some(message) => message,
                None => break,
            },
        };

        let sent = tokio::select! {
            _ = cancel.cancelled() => break,
            sent = retry_with_backoff(&retry, || sink.send(&message)) => sent,
        };

        match sent {
            Ok(()) => {
                progress.counters.produced_messages.incr();
                debug!(worker_id, topic = %message.topic, "Produced message");
            }
            Err(e) => {
                error!(
                    worker_id,
                    topic = %message.topic,
                    error = %e,
                    "Dropping message after exhausting send retries"
                );
                progress.counters.publish_errors.incr();
            }
        }
    }

    debug!(worker_id, "Publisher worker exiting");
}
