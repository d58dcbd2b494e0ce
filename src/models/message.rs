use std::collections::HashMap;

use anyhow::{Error, Result, anyhow};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use uuid::Uuid;

/// Error message for a batch wire array with the wrong number of elements.
pub const INVALID_MESSAGE_ARRAY: &str = "InvalidMessageArray";

/// One admin-accepted unit of work: message, audience filter, delivery
/// service. Immutable once accepted, except for the per-user fields
/// (`user_id`, `token`, `locale`, `tz`) which the reader fills in before
/// serializing a copy of the job for each selected device.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InputMessage {
    pub job_id: Uuid,
    pub app_name: String,
    pub service: String,
    #[serde(default)]
    pub template_name: String,
    #[serde(default)]
    pub context: HashMap<String, JsonValue>,
    #[serde(default)]
    pub metadata: HashMap<String, JsonValue>,
    /// Unix nanoseconds; 0 means the job never expires.
    #[serde(default)]
    pub expires_at: i64,
    #[serde(default)]
    pub user_id: Option<Uuid>,
    #[serde(default)]
    pub token: String,
    #[serde(default)]
    pub locale: String,
    #[serde(default)]
    pub tz: Option<String>,
}

/// A `(column, op, value)` constraint over the user token table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Filter {
    pub column: String,
    pub op: String,
    pub value: JsonValue,
}

/// A query modifier. Recognized ops are `LIMIT` (required, > 0) and
/// `ORDER BY`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Modifier {
    pub op: String,
    pub arg: JsonValue,
}

impl Modifier {
    pub fn limit(limit: i64) -> Self {
        Self {
            op: "LIMIT".to_string(),
            arg: JsonValue::from(limit),
        }
    }

    pub fn order_by(order: &str) -> Self {
        Self {
            op: "ORDER BY".to_string(),
            arg: JsonValue::from(order),
        }
    }
}

/// Finds the `LIMIT` modifier, if any.
pub fn limit_from_modifiers(modifiers: &[Modifier]) -> Option<i64> {
    modifiers
        .iter()
        .find(|m| m.op == "LIMIT")
        .and_then(|m| m.arg.as_i64())
}

/// Finds the `ORDER BY` modifier, if any.
pub fn order_from_modifiers(modifiers: &[Modifier]) -> Option<String> {
    modifiers
        .iter()
        .find(|m| m.op == "ORDER BY")
        .and_then(|m| m.arg.as_str().map(str::to_string))
}

/// The job descriptor handed to the worker binary: the message plus the
/// audience selection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobDescriptor {
    pub message: InputMessage,
    #[serde(default)]
    pub filters: Vec<Filter>,
    #[serde(default)]
    pub modifiers: Vec<Modifier>,
}

/// Intermediate between the fetcher and the builder: the per-user job plus
/// the resolved template body and the merged substitution context.
#[derive(Debug, Clone)]
pub struct TemplatedMessage {
    pub message: InputMessage,
    pub body: HashMap<String, String>,
    pub context: HashMap<String, JsonValue>,
}

/// Final pipeline output, handed to the message bus.
#[derive(Debug, Clone, PartialEq)]
pub struct BusMessage {
    pub topic: String,
    pub payload: Vec<u8>,
    pub partition_key: Option<String>,
}

/// An inline template carried by the batch wire format: body and defaults
/// only, no identity.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct InlineTemplate {
    #[serde(default)]
    pub body: HashMap<String, String>,
    #[serde(default)]
    pub defaults: HashMap<String, String>,
}

/// A user as carried by the batch wire format.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BatchUser {
    pub user_id: String,
    pub token: String,
}

/// A job whose template and users arrive inline instead of being resolved
/// from the store.
#[derive(Debug, Clone)]
pub struct BatchMessage {
    pub job_id: Uuid,
    pub app_name: String,
    pub service: String,
    pub template: InlineTemplate,
    pub context: HashMap<String, JsonValue>,
    pub metadata: HashMap<String, JsonValue>,
    pub users: Vec<BatchUser>,
    pub expires_at: i64,
}

/// Decodes the 8-element batch wire array
/// `[jobId, appName, service, templateObj, context, metadata, users,
/// expiresAt]`. The element count and the error messages are part of the
/// wire contract.
pub fn parse_batch_message_array(arr: &[JsonValue]) -> Result<BatchMessage, Error> {
    if arr.len() != 8 {
        return Err(anyhow!(INVALID_MESSAGE_ARRAY));
    }

    let job_id = arr[0].as_str().ok_or_else(|| anyhow!(INVALID_MESSAGE_ARRAY))?;
    let job_id =
        Uuid::parse_str(job_id).map_err(|e| anyhow!("job id is not a valid uuid: {}", e))?;

    let app_name = arr[1]
        .as_str()
        .ok_or_else(|| anyhow!("app name must be a string"))?
        .to_string();
    let service = arr[2]
        .as_str()
        .ok_or_else(|| anyhow!("service must be a string"))?
        .to_string();

    let template: InlineTemplate = serde_json::from_value(arr[3].clone())
        .map_err(|e| anyhow!("invalid template object: {}", e))?;
    let context: HashMap<String, JsonValue> = serde_json::from_value(arr[4].clone())
        .map_err(|e| anyhow!("invalid context object: {}", e))?;
    let metadata: HashMap<String, JsonValue> = serde_json::from_value(arr[5].clone())
        .map_err(|e| anyhow!("invalid metadata object: {}", e))?;

    let users: Vec<BatchUser> = serde_json::from_value(arr[6].clone())
        .map_err(|e| anyhow!("invalid users array: {}", e))?;
    if users.is_empty() {
        return Err(anyhow!("there must be at least one user"));
    }

    let expires_at = arr[7]
        .as_i64()
        .ok_or_else(|| anyhow!("expiresAt must be an integer"))?;

    Ok(BatchMessage {
        job_id,
        app_name,
        service,
        template,
        context,
        metadata,
        users,
        expires_at,
    })
}
