//! Task Orchestrator
//!
//! Accepts analysis tasks into a bounded queue, fans each out as one
//! pipeline per requested VM, aggregates the per-VM results into a task
//! summary, and enforces the pipeline concurrency ceiling. Pipelines are
//! independent; one failing never cancels its siblings.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{mpsc, watch, Semaphore};
use tokio::task::JoinSet;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::collector::CollectorRegistry;
use crate::config::Config;
use crate::controller::VmController;
use crate::model::{Sample, Summary, Task, TaskStatus};
use crate::pipeline::{run_pipeline, PipelineContext};
use crate::pool::{VmOccupancy, VmPool};
use crate::store::ResultStore;
use crate::{Error, Result};

/// Liveness view served by the health endpoint.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthSnapshot {
    pub status: &'static str,
    pub queue_depth: usize,
    pub queue_capacity: usize,
    pub active_pipelines: usize,
    pub max_concurrent_tasks: usize,
    pub pool: Vec<VmOccupancy>,
}

struct Inner {
    config: Config,
    store: ResultStore,
    ctx: PipelineContext,
    queue_tx: mpsc::Sender<Uuid>,
    /// Ceiling on concurrently running pipelines.
    pipeline_permits: Arc<Semaphore>,
    /// Gate on in-flight task handlers, so the submit queue stays a real
    /// bound instead of draining into unbounded spawns.
    task_permits: Arc<Semaphore>,
    cancels: Mutex<HashMap<Uuid, watch::Sender<bool>>>,
}

#[derive(Clone)]
pub struct Orchestrator {
    inner: Arc<Inner>,
}

impl Orchestrator {
    /// Wire the collaborators and start the worker loop.
    pub fn start(config: Config, controller: Arc<dyn VmController>, store: ResultStore) -> Self {
        let (queue_tx, queue_rx) = mpsc::channel(config.analysis.queue_size);
        let ctx = PipelineContext {
            controller,
            pool: VmPool::new(config.vm_names()),
            collectors: CollectorRegistry::standard(),
            analysis: config.analysis.clone(),
        };
        let inner = Arc::new(Inner {
            pipeline_permits: Arc::new(Semaphore::new(config.analysis.max_concurrent_tasks)),
            task_permits: Arc::new(Semaphore::new(config.analysis.max_concurrent_tasks)),
            cancels: Mutex::new(HashMap::new()),
            config,
            store,
            ctx,
            queue_tx,
        });

        tokio::spawn(worker_loop(Arc::clone(&inner), queue_rx));
        Self { inner }
    }

    pub fn store(&self) -> &ResultStore {
        &self.inner.store
    }

    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    /// Register a task and enqueue it. Rejects unknown VM names and a full
    /// queue before anything is registered.
    pub fn submit(
        &self,
        sample: Sample,
        requested_vms: Option<Vec<String>>,
        timeout_seconds: Option<u64>,
    ) -> Result<Uuid> {
        let vms = match requested_vms {
            Some(vms) => {
                for name in &vms {
                    if self.inner.config.vm(name).is_none() {
                        return Err(Error::UnknownVm(format!(
                            "requested VM '{}' is not configured",
                            name
                        )));
                    }
                }
                vms
            }
            None => self.inner.config.vm_names(),
        };

        let timeout =
            timeout_seconds.unwrap_or(self.inner.config.analysis.per_vm_max_seconds);

        // Reserve the queue slot first so a rejected submission leaves no
        // trace in the store.
        let slot = self.inner.queue_tx.try_reserve().map_err(|_| {
            Error::QueueFull(format!(
                "work queue at capacity ({})",
                self.inner.config.analysis.queue_size
            ))
        })?;

        let task = Task::new(sample, vms, timeout);
        let task_id = task.task_id;
        self.inner.store.insert(task)?;

        let (cancel_tx, _) = watch::channel(false);
        self.inner
            .cancels
            .lock()
            .unwrap()
            .insert(task_id, cancel_tx);

        slot.send(task_id);
        info!(%task_id, "task enqueued");
        Ok(task_id)
    }

    /// Cancel a pending or running task. Returns false for unknown tasks;
    /// cancelling an already-terminal task is a no-op success.
    pub fn cancel(&self, task_id: Uuid) -> Result<bool> {
        if self.inner.store.get(task_id).is_none() {
            return Ok(false);
        }
        if self
            .inner
            .store
            .advance_if_active(task_id, TaskStatus::Cancelled)?
        {
            if let Some(cancel) = self.inner.cancels.lock().unwrap().get(&task_id) {
                let _ = cancel.send(true);
            }
            info!(%task_id, "task cancelled");
        }
        Ok(true)
    }

    pub fn health(&self) -> HealthSnapshot {
        let queue_capacity = self.inner.config.analysis.queue_size;
        let max_concurrent = self.inner.config.analysis.max_concurrent_tasks;
        HealthSnapshot {
            status: "ok",
            queue_depth: queue_capacity - self.inner.queue_tx.capacity(),
            queue_capacity,
            active_pipelines: max_concurrent - self.inner.pipeline_permits.available_permits(),
            max_concurrent_tasks: max_concurrent,
            pool: self.inner.ctx.pool.occupancy(),
        }
    }
}

async fn worker_loop(inner: Arc<Inner>, mut queue_rx: mpsc::Receiver<Uuid>) {
    loop {
        let permit = match Arc::clone(&inner.task_permits).acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => return,
        };
        let Some(task_id) = queue_rx.recv().await else {
            return;
        };
        let inner = Arc::clone(&inner);
        tokio::spawn(async move {
            process_task(&inner, task_id).await;
            drop(permit);
        });
    }
}

async fn process_task(inner: &Arc<Inner>, task_id: Uuid) {
    let Some(task) = inner.store.get(task_id) else {
        error!(%task_id, "dequeued task missing from store");
        return;
    };
    match inner.store.advance_if_active(task_id, TaskStatus::Running) {
        Ok(true) => {}
        Ok(false) => {
            // Cancelled while still queued; nothing to run.
            inner.cancels.lock().unwrap().remove(&task_id);
            return;
        }
        Err(err) => {
            error!(%task_id, %err, "could not mark task running");
            return;
        }
    }

    let cancel_rx = {
        let cancels = inner.cancels.lock().unwrap();
        match cancels.get(&task_id) {
            Some(tx) => tx.subscribe(),
            None => watch::channel(false).1,
        }
    };

    let per_vm_timeout = Duration::from_secs(
        task.timeout_seconds
            .min(inner.config.analysis.per_vm_max_seconds),
    );

    let mut pipelines = JoinSet::new();
    for vm_name in &task.requested_vms {
        // Names were validated at submit; a missing entry here is a wiring bug.
        let Some(vm) = inner.config.vm(vm_name).cloned() else {
            error!(%task_id, vm = %vm_name, "requested VM vanished from config");
            continue;
        };
        let ctx = inner.ctx.clone();
        let sample = task.sample.clone();
        let permits = Arc::clone(&inner.pipeline_permits);
        let cancel = cancel_rx.clone();
        pipelines.spawn(async move {
            // Closing the semaphore is impossible here; the permit gates
            // the global pipeline ceiling for the run's duration.
            let _permit = permits.acquire_owned().await.ok();
            run_pipeline(ctx, vm, sample, per_vm_timeout, cancel).await
        });
    }

    let mut produced_any = false;
    while let Some(joined) = pipelines.join_next().await {
        match joined {
            Ok(result) => {
                produced_any = true;
                if let Err(err) = inner.store.record_per_vm(task_id, result) {
                    error!(%task_id, %err, "failed to record per-VM result");
                }
            }
            Err(join_err) => {
                error!(%task_id, %join_err, "pipeline task aborted");
            }
        }
    }

    if let Some(task) = inner.store.get(task_id) {
        let summary = Summary::aggregate(task.per_vm_results.values());
        if let Err(err) = inner.store.set_summary(task_id, summary) {
            error!(%task_id, %err, "failed to store summary");
        }

        // A concurrent cancel keeps its terminal status; otherwise the
        // task completed even when individual per-VM results errored.
        if produced_any {
            let _ = inner.store.advance_if_active(task_id, TaskStatus::Completed);
        } else {
            warn!(%task_id, "no pipeline produced a result, failing task");
            let _ = inner.store.advance_if_active(task_id, TaskStatus::Failed);
        }
    }

    inner.cancels.lock().unwrap().remove(&task_id);
    info!(%task_id, "task finished");
}
