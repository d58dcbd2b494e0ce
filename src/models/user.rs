use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// One device registration row from a `user_tokens_<app>_<service>` table.
/// `token` is the opaque per-device identifier for the delivery service.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
#[serde(rename_all = "camelCase")]
pub struct UserToken {
    pub user_id: Uuid,
    pub token: String,
    pub locale: String,
    pub tz: Option<String>,
}
