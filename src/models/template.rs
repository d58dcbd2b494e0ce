use std::collections::{BTreeMap, HashMap};

use anyhow::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A named, per-locale message template. `body` holds one raw template string
/// per payload field (e.g. `alert`) with `{{var}}` placeholders; `defaults`
/// supplies fallbacks for variables missing from a job's context.
///
/// `(app_id, name, locale)` is globally unique.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Template {
    pub id: Uuid,
    pub app_id: Uuid,
    pub name: String,
    pub locale: String,
    pub defaults: HashMap<String, String>,
    pub body: HashMap<String, String>,
    pub compiled_body: String,
    pub created_by: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Template {
    pub fn new(
        app_id: Uuid,
        name: String,
        locale: String,
        defaults: HashMap<String, String>,
        body: HashMap<String, String>,
        created_by: String,
    ) -> Result<Self, Error> {
        let now = Utc::now();
        let mut template = Self {
            id: Uuid::new_v4(),
            app_id,
            name,
            locale,
            defaults,
            body,
            compiled_body: String::new(),
            created_by,
            created_at: now,
            updated_at: now,
        };
        template.recompile()?;
        Ok(template)
    }

    /// Recomputes `compiled_body` from `body`. Must be called whenever `body`
    /// changes; the compiled form is the canonical sorted-key serialization.
    pub fn recompile(&mut self) -> Result<(), Error> {
        let sorted: BTreeMap<&String, &String> = self.body.iter().collect();
        self.compiled_body = serde_json::to_string(&sorted)?;
        self.updated_at = Utc::now();
        Ok(())
    }
}
