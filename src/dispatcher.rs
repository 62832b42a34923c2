use crate::runner::Runner;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio::task::{self, JoinSet};
use tracing::{error, info};

/// Handle for queueing pipeline runs onto the dispatch loop.
#[derive(Clone)]
pub struct Dispatcher {
    tx: mpsc::UnboundedSender<String>,
    active: Arc<Mutex<HashSet<String>>>,
}

pub struct DispatchQueue {
    rx: mpsc::UnboundedReceiver<String>,
    active: Arc<Mutex<HashSet<String>>>,
}

pub fn channel() -> (Dispatcher, DispatchQueue) {
    let (tx, rx) = mpsc::unbounded_channel();
    let active = Arc::new(Mutex::new(HashSet::new()));
    (
        Dispatcher {
            tx,
            active: active.clone(),
        },
        DispatchQueue { rx, active },
    )
}

impl Dispatcher {
    /// Queues a run. Returns `false` if the pipeline is already queued or running, or the
    /// dispatch loop has stopped.
    pub fn enqueue(&self, pipeline_id: &str) -> bool {
        self.claim(pipeline_id) && self.submit(pipeline_id)
    }

    /// Reserves the pipeline so no other caller can queue it. Pair with `submit` or `release`.
    pub fn claim(&self, pipeline_id: &str) -> bool {
        self.active
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(pipeline_id.to_string())
    }

    pub fn release(&self, pipeline_id: &str) {
        self.active
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(pipeline_id);
    }

    /// Hands a claimed pipeline to the dispatch loop.
    pub fn submit(&self, pipeline_id: &str) -> bool {
        if self.tx.send(pipeline_id.to_string()).is_err() {
            error!("Dispatch loop is gone, dropping run for pipeline {}", pipeline_id);
            self.release(pipeline_id);
            return false;
        }
        true
    }

    #[cfg(test)]
    pub fn is_active(&self, pipeline_id: &str) -> bool {
        self.active
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains(pipeline_id)
    }
}

/// Spawns every queued run as its own task and logs how each one ends. Returns once all
/// `Dispatcher` handles are dropped and in-flight runs have finished.
pub async fn start_dispatch_loop(runner: Arc<Runner>, queue: DispatchQueue) {
    let DispatchQueue { mut rx, active } = queue;
    let mut set: JoinSet<()> = JoinSet::new();
    let mut in_flight: HashMap<task::Id, String> = HashMap::new();

    loop {
        tokio::select! {
            Some(pipeline_id) = rx.recv() => {
                let runner = runner.clone();
                let id = pipeline_id.clone();
                let handle = set.spawn(async move {
                    match runner.run(&id).await {
                        Ok(status) => info!("Run for pipeline {} finished: {}", id, status),
                        Err(e) => error!("Run for pipeline {} did not complete: {}", id, e),
                    }
                });
                in_flight.insert(handle.id(), pipeline_id);
            }
            Some(res) = set.join_next_with_id(), if !set.is_empty() => {
                let task_id = match res {
                    Ok((task_id, ())) => task_id,
                    Err(e) => {
                        error!("Run task join error: {}", e);
                        e.id()
                    }
                };
                if let Some(pipeline_id) = in_flight.remove(&task_id) {
                    active.lock().unwrap_or_else(|e| e.into_inner()).remove(&pipeline_id);
                }
            }
            else => break,
        }
    }

    info!("Dispatch loop stopped");
}
