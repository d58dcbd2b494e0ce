use anyhow::{Error, Result, anyhow};
use marathon::{
    config::Config,
    models::message::{JobDescriptor, parse_batch_message_array},
    workers::batch::BatchWorker,
};
use tracing::error;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let code = match run().await {
        Ok(()) => 0,
        Err(e) => {
            error!(error = %e, "Job failed");
            1
        }
    };
    std::process::exit(code);
}

async fn run() -> Result<(), Error> {
    let config = Config::load()?;

    let path = std::env::args()
        .nth(1)
        .ok_or_else(|| anyhow!("usage: marathon <job-file>"))?;
    let raw = tokio::fs::read_to_string(&path)
        .await
        .map_err(|e| anyhow!("Failed to read job file {}: {}", path, e))?;
    let job: serde_json::Value = serde_json::from_str(&raw)
        .map_err(|e| anyhow!("Failed to parse job file {}: {}", path, e))?;

    let worker = BatchWorker::connect(config).await?;

    match job.as_array() {
        Some(batch) => {
            let batch = parse_batch_message_array(batch)?;
            worker.run_batch(batch).await
        }
        None => {
            let descriptor: JobDescriptor = serde_json::from_value(job)
                .map_err(|e| anyhow!("Invalid job descriptor: {}", e))?;
            worker
                .run(descriptor.message, descriptor.filters, descriptor.modifiers)
                .await
        }
    }
}
