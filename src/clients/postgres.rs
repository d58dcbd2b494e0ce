use std::collections::HashMap;

use anyhow::{Error, Result, anyhow};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;
use sqlx::{
    FromRow, PgPool, Postgres, QueryBuilder,
    postgres::PgPoolOptions,
    types::Json,
};
use tracing::{debug, info};
use uuid::Uuid;

use crate::{
    config::Config,
    models::{app::App, message::Filter, template::Template, user::UserToken},
};

/// Relational operations the pipeline consumes. User tokens live in one
/// table per `(app, service)` pair.
#[async_trait]
pub trait Store: Send + Sync {
    async fn find_app(&self, key: &str) -> Result<Option<App>, Error>;

    async fn count_user_tokens(
        &self,
        app: &str,
        service: &str,
        filters: &[Filter],
    ) -> Result<i64, Error>;

    async fn select_user_tokens(
        &self,
        app: &str,
        service: &str,
        filters: &[Filter],
        limit: i64,
        offset: i64,
        order_by: &str,
    ) -> Result<Vec<UserToken>, Error>;

    async fn find_template(
        &self,
        app_name: &str,
        name: &str,
        service: &str,
        locale: &str,
    ) -> Result<Option<Template>, Error>;
}

pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub async fn connect(config: &Config) -> Result<Self, Error> {
        info!(
            host = %config.postgres_host,
            port = config.postgres_port,
            dbname = %config.postgres_dbname,
            "Connecting to PostgreSQL database"
        );

        let pool = PgPoolOptions::new()
            .max_connections(config.postgres_max_connections)
            .connect(&config.postgres_conn_string())
            .await
            .map_err(|e| anyhow!("Failed to connect to database: {}", e))?;

        info!("PostgreSQL connection established");

        Ok(Self { pool })
    }
}

#[async_trait]
impl Store for PgStore {
    async fn find_app(&self, key: &str) -> Result<Option<App>, Error> {
        let app = sqlx::query_as::<_, App>(
            "SELECT id, key, bundle_id, created_by, created_at, updated_at \
             FROM apps WHERE key = $1",
        )
        .bind(key)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| anyhow!("Failed to read app {}: {}", key, e))?;

        Ok(app)
    }

    async fn count_user_tokens(
        &self,
        app: &str,
        service: &str,
        filters: &[Filter],
    ) -> Result<i64, Error> {
        let table = user_tokens_table(app, service)?;
        let mut query = QueryBuilder::<Postgres>::new(format!("SELECT count(*) FROM {}", table));
        push_filters(&mut query, filters)?;

        let (count,): (i64,) = query
            .build_query_as()
            .fetch_one(&self.pool)
            .await
            .map_err(|e| anyhow!("Failed to count user tokens in {}: {}", table, e))?;

        debug!(table = %table, count, "Counted user tokens");

        Ok(count)
    }

    async fn select_user_tokens(
        &self,
        app: &str,
        service: &str,
        filters: &[Filter],
        limit: i64,
        offset: i64,
        order_by: &str,
    ) -> Result<Vec<UserToken>, Error> {
        let table = user_tokens_table(app, service)?;
        let mut query = QueryBuilder::<Postgres>::new(format!(
            "SELECT user_id, token, locale, tz FROM {}",
            table
        ));
        push_filters(&mut query, filters)?;
        query.push(" ORDER BY ");
        query.push(valid_order_by(order_by)?);
        query.push(" LIMIT ");
        query.push_bind(limit);
        query.push(" OFFSET ");
        query.push_bind(offset);

        let tokens = query
            .build_query_as::<UserToken>()
            .fetch_all(&self.pool)
            .await
            .map_err(|e| anyhow!("Failed to select user tokens from {}: {}", table, e))?;

        debug!(table = %table, batch = tokens.len(), offset, "Selected user token batch");

        Ok(tokens)
    }

    async fn find_template(
        &self,
        app_name: &str,
        name: &str,
        service: &str,
        locale: &str,
    ) -> Result<Option<Template>, Error> {
        // Templates are unique per (app, name, locale); the service only
        // selects the token table and the cache slot.
        let row = sqlx::query_as::<_, TemplateRow>(
            "SELECT t.id, t.app_id, t.name, t.locale, t.defaults, t.body, \
                    t.compiled_body, t.created_by, t.created_at, t.updated_at \
             FROM templates t JOIN apps a ON a.id = t.app_id \
             WHERE a.key = $1 AND t.name = $2 AND t.locale = $3",
        )
        .bind(app_name)
        .bind(name)
        .bind(locale)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| anyhow!("Failed to read template {} ({}): {}", name, locale, e))?;

        debug!(
            app_name,
            template = name,
            service,
            locale,
            found = row.is_some(),
            "Template lookup"
        );

        Ok(row.map(Template::from))
    }
}

#[derive(FromRow)]
struct TemplateRow {
    id: Uuid,
    app_id: Uuid,
    name: String,
    locale: String,
    defaults: Json<HashMap<String, String>>,
    body: Json<HashMap<String, String>>,
    compiled_body: String,
    created_by: String,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl From<TemplateRow> for Template {
    fn from(row: TemplateRow) -> Self {
        Template {
            id: row.id,
            app_id: row.app_id,
            name: row.name,
            locale: row.locale,
            defaults: row.defaults.0,
            body: row.body.0,
            compiled_body: row.compiled_body,
            created_by: row.created_by,
            created_at: row.created_at,
            updated_at: row.updated_at,
        }
    }
}

/// Builds the `user_tokens_<app>_<service>` table name. Both parts end up in
/// the statement text, so they must be plain identifiers.
fn user_tokens_table(app: &str, service: &str) -> Result<String, Error> {
    Ok(format!(
        "user_tokens_{}_{}",
        valid_ident(app)?,
        valid_ident(service)?
    ))
}

fn valid_ident(ident: &str) -> Result<&str, Error> {
    let ok = !ident.is_empty()
        && ident
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_');
    if !ok {
        return Err(anyhow!("Invalid identifier: {}", ident));
    }
    Ok(ident)
}

fn valid_op(op: &str) -> Result<&str, Error> {
    match op {
        "=" | "!=" | "<" | ">" | "<=" | ">=" | "LIKE" | "ILIKE" => Ok(op),
        _ => Err(anyhow!("Invalid filter operator: {}", op)),
    }
}

/// Validates an `ORDER BY` argument of the form `<column> [ASC|DESC]`.
fn valid_order_by(order_by: &str) -> Result<String, Error> {
    let mut parts = order_by.split_whitespace();
    let column = valid_ident(parts.next().unwrap_or(""))?;
    match parts.next() {
        None => Ok(column.to_string()),
        Some(dir) if dir.eq_ignore_ascii_case("asc") || dir.eq_ignore_ascii_case("desc") => {
            if parts.next().is_some() {
                return Err(anyhow!("Invalid order by: {}", order_by));
            }
            Ok(format!("{} {}", column, dir.to_uppercase()))
        }
        Some(_) => Err(anyhow!("Invalid order by: {}", order_by)),
    }
}

/// Appends `WHERE`/`AND` clauses for the filter triples. Column names and
/// operators go into the statement text after validation; values are bound.
fn push_filters(query: &mut QueryBuilder<'_, Postgres>, filters: &[Filter]) -> Result<(), Error> {
    for (i, filter) in filters.iter().enumerate() {
        query.push(if i == 0 { " WHERE " } else { " AND " });
        query.push(valid_ident(&filter.column)?);
        query.push(" ");
        query.push(valid_op(&filter.op)?);
        query.push(" ");
        match &filter.value {
            JsonValue::String(s) => query.push_bind(s.clone()),
            JsonValue::Bool(b) => query.push_bind(*b),
            JsonValue::Number(n) => {
                if let Some(v) = n.as_i64() {
                    query.push_bind(v)
                } else if let Some(v) = n.as_f64() {
                    query.push_bind(v)
                } else {
                    return Err(anyhow!("Unsupported numeric filter value: {}", n));
                }
            }
            other => return Err(anyhow!("Unsupported filter value: {}", other)),
        };
    }
    Ok(())
}
