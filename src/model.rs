//! Core data model: samples, tasks, per-VM results, alerts, events, summaries.
//!
//! Everything here is part of the external JSON contract (task polling and
//! the final report), so field names are stable camelCase keys.

use std::collections::BTreeMap;
use std::path::PathBuf;

use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::config::AgentKind;
use crate::error::ErrorKind;

/// An immutable submitted sample. Created on submission, never mutated.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Sample {
    pub sample_id: Uuid,
    pub name: String,
    pub path: PathBuf,
    pub hash_hex: String,
    pub size_bytes: u64,
    pub received_at: DateTime<Local>,
}

impl Sample {
    pub fn new(name: impl Into<String>, path: impl Into<PathBuf>, bytes: &[u8]) -> Self {
        Self {
            sample_id: Uuid::now_v7(),
            name: name.into(),
            path: path.into(),
            hash_hex: sha256_hex(bytes),
            size_bytes: bytes.len() as u64,
            received_at: Local::now(),
        }
    }
}

/// Hex-encoded SHA-256 digest of the given bytes.
pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Task status. Advances monotonically except Cancelled, which may preempt
/// Pending or Running.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }

    pub fn is_active(&self) -> bool {
        !self.is_terminal()
    }

    /// Position in the monotone order. Terminal states share the top rank.
    pub(crate) fn rank(&self) -> u8 {
        match self {
            TaskStatus::Pending => 0,
            TaskStatus::Running => 1,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled => 2,
        }
    }
}

/// One analysis task: a sample fanned out over the requested VMs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    pub task_id: Uuid,
    pub sample: Sample,
    /// Ordered, unique VM names this task runs on.
    pub requested_vms: Vec<String>,
    pub timeout_seconds: u64,
    pub created_at: DateTime<Local>,
    pub status: TaskStatus,
    /// One entry per requested VM once its pipeline has finished.
    #[serde(rename = "perVMResults")]
    pub per_vm_results: BTreeMap<String, VmResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub summary: Option<Summary>,
}

impl Task {
    pub fn new(sample: Sample, requested_vms: Vec<String>, timeout_seconds: u64) -> Self {
        Self {
            task_id: Uuid::now_v7(),
            sample,
            requested_vms,
            timeout_seconds,
            created_at: Local::now(),
            status: TaskStatus::Pending,
            per_vm_results: BTreeMap::new(),
            summary: None,
        }
    }
}

/// Pipeline phases, in order. Cleanup always runs; Released is terminal.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
pub enum Phase {
    Queued,
    Acquired,
    Restoring,
    Starting,
    WaitingGuest,
    Uploading,
    Detonating,
    Dwelling,
    Collecting,
    Cleanup,
    Released,
}

/// The outcome of one pipeline run on one VM. Mutated only by the owning
/// pipeline; published into the task when the pipeline finishes.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VmResult {
    pub vm_name: String,
    pub agent_kind: AgentKind,
    pub phase: Phase,
    pub started_at: DateTime<Local>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Local>>,
    /// The agent removed the sample before it could be executed. A
    /// first-class detection outcome, not an error.
    pub sample_deleted_by_agent: bool,
    pub alerts: Vec<Alert>,
    pub events: Vec<Event>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ErrorKind>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_detail: Option<String>,
}

impl VmResult {
    pub fn new(vm_name: impl Into<String>, agent_kind: AgentKind) -> Self {
        Self {
            vm_name: vm_name.into(),
            agent_kind,
            phase: Phase::Queued,
            started_at: Local::now(),
            ended_at: None,
            sample_deleted_by_agent: false,
            alerts: Vec::new(),
            events: Vec::new(),
            error_kind: None,
            error_detail: None,
        }
    }

    /// The agent detected something: raised at least one alert or consumed
    /// the sample outright.
    pub fn detected(&self) -> bool {
        !self.alerts.is_empty() || self.sample_deleted_by_agent
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Low,
    Medium,
    High,
    Critical,
}

/// A threat alert raised by a security agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Alert {
    pub alert_id: Uuid,
    pub timestamp: DateTime<Local>,
    pub severity: Severity,
    /// Agent-specific alert category, e.g. "threat-detected", "quarantine".
    pub kind: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub threat_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_hint: Option<String>,
    /// Product-specific fields preserved verbatim.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub raw_fields: BTreeMap<String, serde_json::Value>,
}

/// Behavioral event types captured by the in-guest event monitor.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "camelCase")]
pub enum EventType {
    ProcessCreate,
    ProcessExit,
    RemoteThread,
    ProcessAccess,
    ProcessTampering,
    FileCreate,
    FileDelete,
    FileStreamCreate,
    FileCreateTimeChange,
    FileBlockExec,
    FileBlockShred,
    RegKeyChange,
    RegValueSet,
    RegRename,
    NetConnect,
    DnsQuery,
    DriverLoad,
    ImageLoad,
    RawRead,
    ServiceConfigChange,
    PipeCreate,
    PipeConnect,
    WmiFilter,
    WmiConsumer,
    WmiBinding,
    ClipboardChange,
    SvcStateChange,
    Other,
}

/// One structured behavioral event.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    pub event_type: EventType,
    pub timestamp: DateTime<Local>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ppid: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub command_line: Option<String>,
    /// Event-type-specific target descriptors (paths, registry keys, hosts).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub targets: Vec<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub raw_fields: BTreeMap<String, serde_json::Value>,
}

/// Aggregated verdict over all per-VM results.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Summary {
    pub detected: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub first_detection_at: Option<DateTime<Local>>,
    /// First alert (or agent deletion) per agent kind.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub first_detection_by_agent: BTreeMap<String, DateTime<Local>>,
    /// Alert count per alert kind, unioned over all VMs.
    pub alert_counts: BTreeMap<String, u64>,
    pub event_count: u64,
}

impl Summary {
    /// Aggregate the per-VM results of a finished task.
    pub fn aggregate<'a, I>(results: I) -> Self
    where
        I: IntoIterator<Item = &'a VmResult>,
    {
        let mut detected = false;
        let mut first_detection_at: Option<DateTime<Local>> = None;
        let mut first_detection_by_agent: BTreeMap<String, DateTime<Local>> = BTreeMap::new();
        let mut alert_counts: BTreeMap<String, u64> = BTreeMap::new();
        let mut event_count = 0u64;

        for result in results {
            event_count += result.events.len() as u64;

            let mut vm_first: Option<DateTime<Local>> = None;
            for alert in &result.alerts {
                *alert_counts.entry(alert.kind.clone()).or_insert(0) += 1;
                vm_first = Some(match vm_first {
                    Some(t) => t.min(alert.timestamp),
                    None => alert.timestamp,
                });
            }
            if result.sample_deleted_by_agent {
                // The deletion happened before the first probe; the pipeline
                // start is the closest observable bound.
                vm_first = Some(match vm_first {
                    Some(t) => t.min(result.started_at),
                    None => result.started_at,
                });
            }

            if result.detected() {
                detected = true;
            }
            if let Some(t) = vm_first {
                first_detection_at = Some(match first_detection_at {
                    Some(cur) => cur.min(t),
                    None => t,
                });
                first_detection_by_agent
                    .entry(result.agent_kind.as_str().to_string())
                    .and_modify(|cur| *cur = (*cur).min(t))
                    .or_insert(t);
            }
        }

        Self {
            detected,
            first_detection_at,
            first_detection_by_agent,
            alert_counts,
            event_count,
        }
    }
}

/// The flattened report served by `GET /api/result/{taskId}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Report {
    pub task_id: Uuid,
    pub sample: ReportSample,
    pub created_at: DateTime<Local>,
    pub status: TaskStatus,
    #[serde(rename = "perVM")]
    pub per_vm: Vec<VmResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub summary: Option<Summary>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReportSample {
    pub name: String,
    pub hash_hex: String,
    pub size_bytes: u64,
}

impl Report {
    pub fn from_task(task: &Task) -> Self {
        Self {
            task_id: task.task_id,
            sample: ReportSample {
                name: task.sample.name.clone(),
                hash_hex: task.sample.hash_hex.clone(),
                size_bytes: task.sample.size_bytes,
            },
            created_at: task.created_at,
            status: task.status,
            per_vm: task.per_vm_results.values().cloned().collect(),
            summary: task.summary.clone(),
        }
    }
}
