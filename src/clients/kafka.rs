use std::sync::Mutex;
use std::time::Duration;

use anyhow::{Error, Result, anyhow};
use async_trait::async_trait;
use rdkafka::{
    config::ClientConfig,
    producer::{FutureProducer, FutureRecord, Producer},
    util::Timeout,
};
use tracing::{debug, info};

use crate::{config::Config, models::message::BusMessage};

const SEND_TIMEOUT: Duration = Duration::from_secs(5);
const FLUSH_TIMEOUT: Duration = Duration::from_secs(10);

/// The downstream message bus the publisher hands rendered payloads to.
#[async_trait]
pub trait BusSink: Send + Sync {
    async fn send(&self, message: &BusMessage) -> Result<(), Error>;
    async fn close(&self) -> Result<(), Error>;
}

/// Broker endpoint discovery, reduced to configuration. The deployment
/// environment resolves the cluster (e.g. through Zookeeper) and hands the
/// result to the worker as a comma-separated list.
pub fn broker_endpoints(config: &Config) -> Vec<String> {
    config
        .kafka_brokers
        .split(',')
        .map(str::trim)
        .filter(|broker| !broker.is_empty())
        .map(str::to_string)
        .collect()
}

pub struct KafkaSink {
    producer: FutureProducer,
}

impl KafkaSink {
    pub fn connect(config: &Config) -> Result<Self, Error> {
        let brokers = broker_endpoints(config);
        if brokers.is_empty() {
            return Err(anyhow!("No kafka brokers configured"));
        }

        let producer: FutureProducer = ClientConfig::new()
            .set("bootstrap.servers", brokers.join(","))
            .set("message.timeout.ms", "5000")
            .create()
            .map_err(|e| anyhow!("Failed to create kafka producer: {}", e))?;

        info!(brokers = %brokers.join(","), "Kafka producer created");

        Ok(Self { producer })
    }
}

#[async_trait]
impl BusSink for KafkaSink {
    async fn send(&self, message: &BusMessage) -> Result<(), Error> {
        let mut record: FutureRecord<'_, str, Vec<u8>> =
            FutureRecord::to(&message.topic).payload(&message.payload);
        if let Some(key) = message.partition_key.as_deref() {
            record = record.key(key);
        }

        self.producer
            .send(record, Timeout::After(SEND_TIMEOUT))
            .await
            .map_err(|(e, _)| anyhow!("Failed to send to topic {}: {}", message.topic, e))?;

        debug!(topic = %message.topic, "Sent message");

        Ok(())
    }

    async fn close(&self) -> Result<(), Error> {
        self.producer
            .flush(Timeout::After(FLUSH_TIMEOUT))
            .map_err(|e| anyhow!("Failed to flush kafka producer: {}", e))?;
        Ok(())
    }
}

/// Recording sink for tests: stores every message and can be told to fail
/// the next N sends.
#[derive(Debug, Default)]
pub struct MemorySink {
    messages: Mutex<Vec<BusMessage>>,
    fail_remaining: Mutex<u32>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_next(&self, sends: u32) {
        if let Ok(mut fail) = self.fail_remaining.lock() {
            *fail = sends;
        }
    }

    pub fn messages(&self) -> Vec<BusMessage> {
        self.messages
            .lock()
            .map(|messages| messages.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl BusSink for MemorySink {
    async fn send(&self, message: &BusMessage) -> Result<(), Error> {
        {
            let mut fail = self
                .fail_remaining
                .lock()
                .map_err(|_| anyhow!("sink lock poisoned"))?;
            if *fail > 0 {
                *fail -= 1;
                return Err(anyhow!("Injected send failure"));
            }
        }

        self.messages
            .lock()
            .map_err(|_| anyhow!("sink lock poisoned"))?
            .push(message.clone());
        Ok(())
    }

    async fn close(&self) -> Result<(), Error> {
        Ok(())
    }
}
