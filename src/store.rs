//! Result Store
//!
//! In-memory, concurrency-safe task registry keyed by task id. Status
//! transitions are validated against the monotone order; an invalid
//! transition is a programming error and fails loudly.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use uuid::Uuid;

use crate::model::{Summary, Task, TaskStatus, VmResult};
use crate::{Error, Result};

#[derive(Clone)]
pub struct ResultStore {
    tasks: Arc<Mutex<HashMap<Uuid, Task>>>,
}

impl Default for ResultStore {
    fn default() -> Self {
        Self::new()
    }
}

impl ResultStore {
    pub fn new() -> Self {
        Self {
            tasks: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Register a freshly created task. The task id must be new.
    pub fn insert(&self, task: Task) -> Result<()> {
        let mut tasks = self.tasks.lock().unwrap();
        if tasks.contains_key(&task.task_id) {
            return Err(Error::Internal(format!(
                "task {} already registered",
                task.task_id
            )));
        }
        tasks.insert(task.task_id, task);
        Ok(())
    }

    pub fn get(&self, task_id: Uuid) -> Option<Task> {
        self.tasks.lock().unwrap().get(&task_id).cloned()
    }

    /// All tasks, optionally filtered by status, newest first.
    pub fn list(&self, status: Option<TaskStatus>) -> Vec<Task> {
        let tasks = self.tasks.lock().unwrap();
        let mut out: Vec<Task> = tasks
            .values()
            .filter(|t| status.map(|s| t.status == s).unwrap_or(true))
            .cloned()
            .collect();
        out.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        out
    }

    /// Advance a task's status. Valid moves only go forward in the monotone
    /// order; Cancelled may preempt any active state. Anything else is an
    /// invariant violation.
    pub fn advance_status(&self, task_id: Uuid, new_status: TaskStatus) -> Result<()> {
        let mut tasks = self.tasks.lock().unwrap();
        let task = tasks
            .get_mut(&task_id)
            .ok_or_else(|| Error::Internal(format!("unknown task {}", task_id)))?;

        let valid = match (task.status, new_status) {
            (current, TaskStatus::Cancelled) if current.is_active() => true,
            (current, next) => current.is_active() && next.rank() == current.rank() + 1,
        };
        if !valid {
            debug_assert!(false, "invalid transition {:?} -> {:?}", task.status, new_status);
            return Err(Error::Internal(format!(
                "invalid status transition {:?} -> {:?} on task {}",
                task.status, new_status, task_id
            )));
        }
        task.status = new_status;
        Ok(())
    }

    /// Advance a task's status unless it already reached a terminal state.
    /// Returns false on the no-op. This is the race-safe variant for the
    /// worker and the cancel path, where losing to a concurrent terminal
    /// transition is legitimate rather than a programming error.
    pub fn advance_if_active(&self, task_id: Uuid, new_status: TaskStatus) -> Result<bool> {
        let mut tasks = self.tasks.lock().unwrap();
        let task = tasks
            .get_mut(&task_id)
            .ok_or_else(|| Error::Internal(format!("unknown task {}", task_id)))?;

        if task.status.is_terminal() {
            return Ok(false);
        }
        let valid = match (task.status, new_status) {
            (_, TaskStatus::Cancelled) => true,
            (current, next) => next.rank() == current.rank() + 1,
        };
        if !valid {
            debug_assert!(false, "invalid transition {:?} -> {:?}", task.status, new_status);
            return Err(Error::Internal(format!(
                "invalid status transition {:?} -> {:?} on task {}",
                task.status, new_status, task_id
            )));
        }
        task.status = new_status;
        Ok(true)
    }

    /// Record the finished per-VM result of one pipeline. Each requested VM
    /// gets exactly one entry; a second write for the same VM is an
    /// invariant violation.
    pub fn record_per_vm(&self, task_id: Uuid, result: VmResult) -> Result<()> {
        let mut tasks = self.tasks.lock().unwrap();
        let task = tasks
            .get_mut(&task_id)
            .ok_or_else(|| Error::Internal(format!("unknown task {}", task_id)))?;

        if !task.requested_vms.iter().any(|vm| *vm == result.vm_name) {
            return Err(Error::Internal(format!(
                "result for '{}' which task {} never requested",
                result.vm_name, task_id
            )));
        }
        if task.per_vm_results.contains_key(&result.vm_name) {
            debug_assert!(false, "duplicate per-VM result for {}", result.vm_name);
            return Err(Error::Internal(format!(
                "duplicate per-VM result for '{}' on task {}",
                result.vm_name, task_id
            )));
        }
        task.per_vm_results.insert(result.vm_name.clone(), result);
        Ok(())
    }

    /// Attach the aggregated summary of a finished task.
    pub fn set_summary(&self, task_id: Uuid, summary: Summary) -> Result<()> {
        let mut tasks = self.tasks.lock().unwrap();
        let task = tasks
            .get_mut(&task_id)
            .ok_or_else(|| Error::Internal(format!("unknown task {}", task_id)))?;
        task.summary = Some(summary);
        Ok(())
    }

    /// Number of registered tasks in an active (non-terminal) state.
    pub fn active_count(&self) -> usize {
        self.tasks
            .lock()
            .unwrap()
            .values()
            .filter(|t| t.status.is_active())
            .count()
    }
}
