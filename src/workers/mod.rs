pub mod batch;
pub mod builder;
pub mod fetcher;
pub mod parser;
pub mod publisher;
pub mod reader;
pub mod status;

use std::sync::Arc;

use tokio::sync::{Mutex, mpsc};

/// A stage input queue shared by the stage's worker pool. Workers take turns
/// receiving; holding the lock across the `recv` await is what serializes
/// them.
pub type SharedReceiver<T> = Arc<Mutex<mpsc::Receiver<T>>>;

pub fn shared<T>(receiver: mpsc::Receiver<T>) -> SharedReceiver<T> {
    Arc::new(Mutex::new(receiver))
}

pub(crate) async fn next_item<T>(receiver: &SharedReceiver<T>) -> Option<T> {
    receiver.lock().await.recv().await
}
