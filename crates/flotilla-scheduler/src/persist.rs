//! Background writer mirroring task state into the coordination store.
//!
//! Operations are applied one at a time in the order the engine queued
//! them, so a write and a later delete for the same task cannot swap.
//! Failures are logged and dropped.

use std::sync::Arc;

use flotilla_state::CoordinationStore;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::engine::PersistOp;

pub type PersistSender = mpsc::UnboundedSender<PersistOp>;

/// Spawn the worker. It exits once every sender is dropped.
pub fn spawn(store: Arc<dyn CoordinationStore>) -> (PersistSender, tokio::task::JoinHandle<()>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let handle = tokio::spawn(run(store, rx));
    (tx, handle)
}

async fn run(store: Arc<dyn CoordinationStore>, mut rx: mpsc::UnboundedReceiver<PersistOp>) {
    while let Some(op) = rx.recv().await {
        apply(store.as_ref(), op).await;
    }
    debug!("persistence worker stopped");
}

pub(crate) async fn apply(store: &dyn CoordinationStore, op: PersistOp) {
    match op {
        PersistOp::Write { path, data } => {
            if let Err(e) = store.set(&path, &data).await {
                warn!(%path, error = %e, "failed to persist node");
            }
        }
        PersistOp::Delete { path } => match store.delete(&path).await {
            Ok(()) => debug!(%path, "node deleted"),
            Err(e) if e.is_no_node() => debug!(%path, "node already gone"),
            Err(e) => warn!(%path, error = %e, "failed to delete node"),
        },
    }
}
