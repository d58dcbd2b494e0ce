use anyhow::{Error, Result, anyhow};
use dotenvy::dotenv;
use serde::Deserialize;

use crate::models::retry::RetryConfig;

/// Worker configuration, loaded from the environment with the `MARATHON_`
/// prefix. Field renames mirror the recognized dotted keys with `.` mapped
/// to `_`, e.g. `workers.modules.parsers` comes from
/// `MARATHON_WORKERS_MODULES_PARSERS`.
#[derive(Clone, Deserialize, Debug)]
#[serde(default)]
pub struct Config {
    #[serde(rename = "workers_modules_parsers")]
    pub parsers: usize,
    #[serde(rename = "workers_modules_fetchers")]
    pub fetchers: usize,
    #[serde(rename = "workers_modules_builders")]
    pub builders: usize,
    #[serde(rename = "workers_modules_producers")]
    pub producers: usize,

    #[serde(rename = "workers_modules_pgtoparserchansize")]
    pub pg_to_parser_chan_size: usize,
    #[serde(rename = "workers_modules_parsertofetcherchansize")]
    pub parser_to_fetcher_chan_size: usize,
    #[serde(rename = "workers_modules_fetchertobuilderchansize")]
    pub fetcher_to_builder_chan_size: usize,
    #[serde(rename = "workers_modules_buildertoproducerchansize")]
    pub builder_to_producer_chan_size: usize,

    #[serde(rename = "workers_postgres_defaults_modifiers_limit")]
    pub default_modifier_limit: i64,
    #[serde(rename = "workers_postgres_defaults_modifiers_order")]
    pub default_modifier_order: String,
    /// Seconds added to `expires_at` for jobs that do not set one; 0 means
    /// jobs never expire by default.
    #[serde(rename = "workers_postgres_defaults_pushexpiry")]
    pub push_expiry_seconds: i64,

    pub postgres_host: String,
    pub postgres_user: String,
    pub postgres_port: u16,
    pub postgres_dbname: String,
    pub postgres_password: String,
    pub postgres_sslmode: String,
    pub postgres_max_connections: u32,

    pub redis_host: String,
    pub redis_port: u16,
    pub redis_password: String,
    pub redis_db: i64,
    #[serde(rename = "redis_maxpoolsize")]
    pub redis_max_pool_size: u32,

    pub kafka_brokers: String,

    #[serde(rename = "templates_cache_ttlseconds")]
    pub template_cache_ttl_seconds: u64,
    #[serde(rename = "templates_cache_capacity")]
    pub template_cache_capacity: usize,

    pub status_interval_ms: u64,
    /// TTL for the status key in seconds; 0 means no expiry.
    pub status_ttl_seconds: u64,

    pub max_retry_attempts: u32,
    pub initial_retry_delay_ms: u64,
    pub max_retry_delay_ms: u64,
    pub retry_backoff_multiplier: u64,

    pub default_locale: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            parsers: 1,
            fetchers: 1,
            builders: 1,
            producers: 1,
            pg_to_parser_chan_size: 10000,
            parser_to_fetcher_chan_size: 1000,
            fetcher_to_builder_chan_size: 1000,
            builder_to_producer_chan_size: 1000,
            default_modifier_limit: 1000,
            default_modifier_order: "updated_at ASC".to_string(),
            push_expiry_seconds: 0,
            postgres_host: "localhost".to_string(),
            postgres_user: "marathon".to_string(),
            postgres_port: 5432,
            postgres_dbname: "marathon".to_string(),
            postgres_password: String::new(),
            postgres_sslmode: "disable".to_string(),
            postgres_max_connections: 10,
            redis_host: "localhost".to_string(),
            redis_port: 6379,
            redis_password: String::new(),
            redis_db: 0,
            redis_max_pool_size: 10,
            kafka_brokers: "localhost:9092".to_string(),
            template_cache_ttl_seconds: 60,
            template_cache_capacity: 1024,
            status_interval_ms: 250,
            status_ttl_seconds: 0,
            max_retry_attempts: 3,
            initial_retry_delay_ms: 200,
            max_retry_delay_ms: 5000,
            retry_backoff_multiplier: 2,
            default_locale: "en".to_string(),
        }
    }
}

impl Config {
    pub fn load() -> Result<Self, Error> {
        dotenv().ok();

        let config = envy::prefixed("MARATHON_")
            .from_env::<Self>()
            .map_err(|e| anyhow!("Invalid environment variable: {}", e))?;
        Ok(config)
    }

    /// Connection string in libpq keyword form, which sqlx accepts.
    pub fn postgres_conn_string(&self) -> String {
        let mut conn = format!(
            "host={} user={} port={} sslmode={} dbname={}",
            self.postgres_host,
            self.postgres_user,
            self.postgres_port,
            self.postgres_sslmode,
            self.postgres_dbname,
        );
        if !self.postgres_password.is_empty() {
            conn.push_str(&format!(" password={}", self.postgres_password));
        }
        conn
    }

    pub fn redis_url(&self) -> String {
        if self.redis_password.is_empty() {
            format!(
                "redis://{}:{}/{}",
                self.redis_host, self.redis_port, self.redis_db
            )
        } else {
            format!(
                "redis://:{}@{}:{}/{}",
                self.redis_password, self.redis_host, self.redis_port, self.redis_db
            )
        }
    }

    pub fn retry_config(&self) -> RetryConfig {
        RetryConfig {
            max_attempts: self.max_retry_attempts,
            initial_delay_ms: self.initial_retry_delay_ms,
            max_delay_ms: self.max_retry_delay_ms,
            backoff_multiplier: self.retry_backoff_multiplier,
        }
    }
}
