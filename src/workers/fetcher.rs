use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{Error, Result};
use serde_json::Value as JsonValue;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::{
    clients::postgres::Store,
    models::{
        message::{InputMessage, TemplatedMessage},
        progress::JobProgress,
        retry::RetryConfig,
        template::Template,
    },
    templates::cache::TemplateCache,
    utils::retry_with_backoff,
    workers::{SharedReceiver, next_item},
};

/// Resolves each record's template through the cache, falling back to the
/// store, and emits the record with its merged substitution context.
pub async fn run(
    worker_id: usize,
    in_rx: SharedReceiver<InputMessage>,
    out_tx: mpsc::Sender<TemplatedMessage>,
    store: Arc<dyn Store>,
    cache: Arc<TemplateCache>,
    retry: RetryConfig,
    default_locale: String,
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

        let template = tokio::select! {
            _ = cancel.cancelled() => break,
            template = resolve_template(
                store.as_ref(),
                &cache,
                &message,
                &retry,
                &default_locale,
            ) => template,
        };

        let template = match template {
            Ok(Some(template)) => template,
            Ok(None) => {
                warn!(
                    worker_id,
                    template = %message.template_name,
                    locale = %message.locale,
                    "Template not found, dropping record"
                );
                progress.counters.template_missing.incr();
                continue;
            }
            Err(e) => {
                error!(worker_id, error = %e, "Template lookup failed, dropping record");
                progress.counters.fetcher_errors.incr();
                continue;
            }
        };

        let context = merge_context(&template.defaults, &message.context, &message);
        let templated = TemplatedMessage {
            body: template.body.clone(),
            context,
            message,
        };

        let sent = tokio::select! {
            _ = cancel.cancelled() => break,
            sent = out_tx.send(templated) => sent,
        };
        if sent.is_err() {
            break;
        }
    }

    debug!(worker_id, "Fetcher worker exiting");
}

/// Looks up the template for the record's locale, then retries exactly once
/// with the default locale when the requested one is absent.
async fn resolve_template(
    store: &dyn Store,
    cache: &TemplateCache,
    message: &InputMessage,
    retry: &RetryConfig,
    default_locale: &str,
) -> Result<Option<Arc<Template>>, Error> {
    let found = lookup(store, cache, message, retry, &message.locale).await?;
    if found.is_some() || message.locale == default_locale {
        return Ok(found);
    }

    debug!(
        template = %message.template_name,
        locale = %message.locale,
        default_locale,
        "Template missing for locale, trying default"
    );
    lookup(store, cache, message, retry, default_locale).await
}

async fn lookup(
    store: &dyn Store,
    cache: &TemplateCache,
    message: &InputMessage,
    retry: &RetryConfig,
    locale: &str,
) -> Result<Option<Arc<Template>>, Error> {
    cache
        .get_or_load(&message.template_name, &message.service, locale, || async {
            retry_with_backoff(retry, || {
                store.find_template(
                    &message.app_name,
                    &message.template_name,
                    &message.service,
                    locale,
                )
            })
            .await
        })
        .await
}

/// Builds the substitution context: template defaults, then the job
/// context, then the user's own fields, with the right-hand side winning.
pub fn merge_context(
    defaults: &HashMap<String, String>,
    context: &HashMap<String, JsonValue>,
    message: &InputMessage,
) -> HashMap<String, JsonValue> {
    let mut merged: HashMap<String, JsonValue> = defaults
        .iter()
        .map(|(key, value)| (key.clone(), JsonValue::String(value.clone())))
        .collect();

    for (key, value) in context {
        merged.insert(key.clone(), value.clone());
    }

    if let Some(user_id) = message.user_id {
        merged.insert(
            "user_id".to_string(),
            JsonValue::String(user_id.to_string()),
        );
    }
    if !message.token.is_empty() {
        merged.insert("token".to_string(), JsonValue::String(message.token.clone()));
    }
    if !message.locale.is_empty() {
        merged.insert(
            "locale".to_string(),
            JsonValue::String(message.locale.clone()),
        );
    }
    if let Some(tz) = &message.tz {
        merged.insert("tz".to_string(), JsonValue::String(tz.clone()));
    }

    merged
}
