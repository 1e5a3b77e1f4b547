//! VM Pool
//!
//! Ownership ledger over the fixed set of sandbox VMs. Hands a VM out
//! exclusively to one pipeline at a time; waiters on the same VM are served
//! FIFO. The pool never touches power state; it only enforces task-level
//! exclusivity and carries the needs-attention flag for VMs a failed
//! cleanup left poisoned.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Local};
use serde::Serialize;
use tokio::sync::oneshot;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::{Error, Result};

/// An exclusive-use claim on a VM for the duration of one pipeline.
#[derive(Debug, Clone)]
pub struct VmLease {
    pub vm_name: String,
    pub pipeline_id: Uuid,
    pub acquired_at: DateTime<Local>,
}

struct VmState {
    leased_to: Option<(Uuid, DateTime<Local>)>,
    waiters: VecDeque<(Uuid, oneshot::Sender<VmLease>)>,
    needs_attention: bool,
}

impl VmState {
    fn new() -> Self {
        Self {
            leased_to: None,
            waiters: VecDeque::new(),
            needs_attention: false,
        }
    }
}

/// Per-VM occupancy row in the health view.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VmOccupancy {
    pub vm_name: String,
    pub leased: bool,
    pub waiters: usize,
    pub needs_attention: bool,
}

#[derive(Clone)]
pub struct VmPool {
    inner: Arc<Mutex<HashMap<String, VmState>>>,
}

impl VmPool {
    pub fn new<I, S>(vm_names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let vms = vm_names
            .into_iter()
            .map(|name| (name.into(), VmState::new()))
            .collect();
        Self {
            inner: Arc::new(Mutex::new(vms)),
        }
    }

    /// Acquire the named VM, waiting FIFO behind earlier claimants up to
    /// `wait_deadline`.
    pub async fn acquire(
        &self,
        vm_name: &str,
        pipeline_id: Uuid,
        wait_deadline: Duration,
    ) -> Result<VmLease> {
        let rx = {
            let mut vms = self.inner.lock().unwrap();
            let state = vms
                .get_mut(vm_name)
                .ok_or_else(|| Error::Pool(format!("VM '{}' not in pool", vm_name)))?;

            if state.leased_to.is_none() && state.waiters.is_empty() {
                let lease = VmLease {
                    vm_name: vm_name.to_string(),
                    pipeline_id,
                    acquired_at: Local::now(),
                };
                state.leased_to = Some((pipeline_id, lease.acquired_at));
                debug!(vm = vm_name, %pipeline_id, "lease granted immediately");
                return Ok(lease);
            }

            let (tx, rx) = oneshot::channel();
            state.waiters.push_back((pipeline_id, tx));
            rx
        };

        match tokio::time::timeout(wait_deadline, rx).await {
            Ok(Ok(lease)) => Ok(lease),
            Ok(Err(_)) => Err(Error::Pool(format!(
                "pool dropped while waiting for '{}'",
                vm_name
            ))),
            Err(_) => {
                // The grant may have raced the timeout; check before giving up.
                let mut vms = self.inner.lock().unwrap();
                if let Some(state) = vms.get_mut(vm_name) {
                    if matches!(state.leased_to, Some((id, _)) if id == pipeline_id) {
                        return Ok(VmLease {
                            vm_name: vm_name.to_string(),
                            pipeline_id,
                            acquired_at: state.leased_to.unwrap().1,
                        });
                    }
                    state.waiters.retain(|(id, _)| *id != pipeline_id);
                }
                Err(Error::Timeout(format!(
                    "lease on '{}' not available within {}",
                    vm_name,
                    humantime::format_duration(wait_deadline)
                )))
            }
        }
    }

    /// Release a lease and wake the next live waiter. Idempotent: releasing
    /// a lease that is no longer held is a no-op.
    pub fn release(&self, lease: &VmLease) {
        let mut vms = self.inner.lock().unwrap();
        let Some(state) = vms.get_mut(&lease.vm_name) else {
            return;
        };
        match state.leased_to {
            Some((holder, _)) if holder == lease.pipeline_id => {}
            _ => return,
        }
        state.leased_to = None;

        // Hand off to the first waiter whose receiver is still alive;
        // timed-out waiters are skipped.
        while let Some((pipeline_id, tx)) = state.waiters.pop_front() {
            let granted = VmLease {
                vm_name: lease.vm_name.clone(),
                pipeline_id,
                acquired_at: Local::now(),
            };
            state.leased_to = Some((pipeline_id, granted.acquired_at));
            if tx.send(granted).is_ok() {
                debug!(vm = %lease.vm_name, %pipeline_id, "lease handed to next waiter");
                return;
            }
            state.leased_to = None;
        }
    }

    /// Flag a VM as poisoned by a failed cleanup: it stays listed but
    /// operators must intervene before trusting further runs.
    pub fn mark_needs_attention(&self, vm_name: &str) {
        let mut vms = self.inner.lock().unwrap();
        if let Some(state) = vms.get_mut(vm_name) {
            warn!(vm = vm_name, "VM marked needs-attention");
            state.needs_attention = true;
        }
    }

    /// Clear the needs-attention flag after a successful full cleanup.
    pub fn clear_needs_attention(&self, vm_name: &str) {
        let mut vms = self.inner.lock().unwrap();
        if let Some(state) = vms.get_mut(vm_name) {
            state.needs_attention = false;
        }
    }

    pub fn needs_attention(&self, vm_name: &str) -> bool {
        let vms = self.inner.lock().unwrap();
        vms.get(vm_name).map(|s| s.needs_attention).unwrap_or(false)
    }

    /// Occupancy snapshot for the health endpoint.
    pub fn occupancy(&self) -> Vec<VmOccupancy> {
        let vms = self.inner.lock().unwrap();
        let mut rows: Vec<VmOccupancy> = vms
            .iter()
            .map(|(name, state)| VmOccupancy {
                vm_name: name.clone(),
                leased: state.leased_to.is_some(),
                waiters: state.waiters.len(),
                needs_attention: state.needs_attention,
            })
            .collect();
        rows.sort_by(|a, b| a.vm_name.cmp(&b.vm_name));
        rows
    }
}
