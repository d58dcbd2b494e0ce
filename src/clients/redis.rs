use anyhow::{Error, Result, anyhow};
use async_trait::async_trait;
use redis::{AsyncCommands, Client, aio::MultiplexedConnection};
use tracing::{debug, info};

use crate::config::Config;

/// The KV store the status reporter writes job progress to.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    async fn set(&self, key: &str, value: &str) -> Result<(), Error>;
}

pub struct RedisClient {
    connection: MultiplexedConnection,
    status_ttl_seconds: u64,
}

impl RedisClient {
    pub async fn connect(config: &Config) -> Result<Self, Error> {
        info!(
            host = %config.redis_host,
            port = config.redis_port,
            db = config.redis_db,
            max_pool_size = config.redis_max_pool_size,
            "Connecting to Redis"
        );

        let client = Client::open(config.redis_url())
            .map_err(|_| anyhow!("Failed to create redis client"))?;

        let connection = client
            .get_multiplexed_async_connection()
            .await
            .map_err(|_| anyhow!("Failed to connect to redis client"))?;

        info!("Redis connection established");

        Ok(Self {
            connection,
            status_ttl_seconds: config.status_ttl_seconds,
        })
    }
}

#[async_trait]
impl KeyValueStore for RedisClient {
    async fn set(&self, key: &str, value: &str) -> Result<(), Error> {
        let mut connection = self.connection.clone();

        if self.status_ttl_seconds > 0 {
            connection
                .set_ex::<_, _, ()>(key, value, self.status_ttl_seconds)
                .await
                .map_err(|e| anyhow!("Failed to set key {}: {}", key, e))?;
        } else {
            connection
                .set::<_, _, ()>(key, value)
                .await
                .map_err(|e| anyhow!("Failed to set key {}: {}", key, e))?;
        }

        debug!(key, "Wrote status key");

        Ok(())
    }
}
