use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use anyhow::{Error, Result};
use serde_json::Value as JsonValue;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::{
    models::{
        message::{BusMessage, TemplatedMessage},
        progress::JobProgress,
    },
    utils::now_nanos,
    workers::{SharedReceiver, next_item},
};

/// Renders each record's payload from its template body and merged context
/// and wraps it as a bus message.
pub async fn run(
    worker_id: usize,
    in_rx: SharedReceiver<TemplatedMessage>,
    out_tx: mpsc::Sender<BusMessage>,
    progress: Arc<JobProgress>,
    cancel: CancellationToken,
) {
    loop {
        let templated = tokio::select! {
            _ = cancel.cancelled() => break,
            templated = next_item(&in_rx) => match templated {
                Some(templated) => templated,
                None => break,
            },
        };

        let message = &templated.message;
        if message.expires_at > 0 && now_nanos() > message.expires_at {
            debug!(worker_id, job_id = %message.job_id, "Job expired, dropping message");
            progress.counters.expired.incr();
            continue;
        }

        let (payload, unresolved) = match render(&templated.body, &templated.context) {
            Ok(rendered) => rendered,
            Err(e) => {
                warn!(worker_id, error = %e, "Failed to render payload, dropping");
                progress.counters.builder_errors.incr();
                continue;
            }
        };
        if unresolved > 0 {
            progress.counters.unresolved_variables.add(unresolved);
        }

        let bus_message = BusMessage {
            topic: topic_for(&message.service, &message.app_name),
            payload,
            partition_key: (!message.token.is_empty()).then(|| message.token.clone()),
        };

        let sent = tokio::select! {
            _ = cancel.cancelled() => break,
            sent = out_tx.send(bus_message) => sent,
        };
        if sent.is_err() {
            break;
        }
    }

    debug!(worker_id, "Builder worker exiting");
}

/// Bus topic for a service/app pair. Consumers fan out by this exact
/// naming, so the format is a wire contract.
pub fn topic_for(service: &str, app_name: &str) -> String {
    format!("push-{}_{}", service, app_name)
}

/// Renders every body field and serializes the result as compact JSON with
/// sorted keys. Returns the payload bytes and the number of placeholders
/// that had no value in the context.
pub fn render(
    body: &HashMap<String, String>,
    context: &HashMap<String, JsonValue>,
) -> Result<(Vec<u8>, u64), Error> {
    let mut rendered = BTreeMap::new();
    let mut unresolved = 0;
    for (field, template) in body {
        let (value, missing) = render_field(template, context);
        unresolved += missing;
        rendered.insert(field.clone(), value);
    }
    let payload = serde_json::to_vec(&rendered)?;
    Ok((payload, unresolved))
}

/// Substitutes every whole `{{var}}` token with the string form of the
/// context value. Unknown variables render as the empty string, never as
/// the literal placeholder.
fn render_field(template: &str, context: &HashMap<String, JsonValue>) -> (String, u64) {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    let mut unresolved = 0;

    while let Some(start) = rest.find("{{") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        match after.find("}}") {
            Some(end) => {
                match context.get(&after[..end]) {
                    Some(value) => out.push_str(&stringify(value)),
                    None => unresolved += 1,
                }
                rest = &after[end + 2..];
            }
            None => {
                // Unterminated placeholder; emit the tail verbatim.
                out.push_str(&rest[start..]);
                rest = "";
            }
        }
    }
    out.push_str(rest);

    (out, unresolved)
}

fn stringify(value: &JsonValue) -> String {
    match value {
        JsonValue::String(s) => s.clone(),
        JsonValue::Null => String::new(),
        other => other.to_string(),
    }
}
