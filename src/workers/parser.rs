use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::{
    models::{message::InputMessage, progress::JobProgress},
    workers::{SharedReceiver, next_item},
};

/// Decodes raw user records into validated job messages. Stateless; a bad
/// record is dropped and counted, never fatal.
pub async fn run(
    worker_id: usize,
    require_token: bool,
    in_rx: SharedReceiver<String>,
    out_tx: mpsc::Sender<InputMessage>,
    progress: Arc<JobProgress>,
    cancel: CancellationToken,
) {
    loop {
        let raw = tokio::select! {
            _ = cancel.cancelled() => break,
            raw = next_item(&in_rx) => match raw {
                Some(raw) => raw,
                None => break,
            },
        };

        let message: InputMessage = match serde_json::from_str(&raw) {
            Ok(message) => message,
            Err(e) => {
                warn!(worker_id, error = %e, "Failed to decode user record, dropping");
                progress.counters.parser_errors.incr();
                continue;
            }
        };

        if require_token && message.token.is_empty() {
            debug!(worker_id, user_id = ?message.user_id, "Record without token, skipping");
            progress.counters.parser_skipped.incr();
            continue;
        }

        let sent = tokio::select! {
            _ = cancel.cancelled() => break,
            sent = out_tx.send(message) => sent,
        };
        if sent.is_err() {
            break;
        }
    }

    debug!(worker_id, "Parser worker exiting");
}
