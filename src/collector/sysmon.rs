//! Behavioral collector reading the in-guest Sysmon operational channel.
//!
//! Queries the event log through the guest shell, maps Sysmon event ids
//! onto the behavioral event vocabulary, and parses the rendered message's
//! `Key: Value` block into typed fields. Always returns events with no
//! alerts; a guest without the Sysmon channel is AgentUnavailable.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;

use super::{json_values, parse_ps_datetime, Collection, CollectionWindow, Collector, SampleHints};
use crate::guest::{GuestCommandBuilder, GuestShell};
use crate::model::{Event, EventType};
use crate::{Error, Result};

const EXEC_TIMEOUT: Duration = Duration::from_secs(90);

const SYSMON_CHANNEL: &str = "Microsoft-Windows-Sysmon/Operational";

/// Sysmon event id to behavioral event type, per the published schema.
pub fn event_type_for_id(id: i64) -> EventType {
    match id {
        1 => EventType::ProcessCreate,
        2 => EventType::FileCreateTimeChange,
        3 => EventType::NetConnect,
        4 => EventType::SvcStateChange,
        5 => EventType::ProcessExit,
        6 => EventType::DriverLoad,
        7 => EventType::ImageLoad,
        8 => EventType::RemoteThread,
        9 => EventType::RawRead,
        10 => EventType::ProcessAccess,
        11 => EventType::FileCreate,
        12 => EventType::RegKeyChange,
        13 => EventType::RegValueSet,
        14 => EventType::RegRename,
        15 => EventType::FileStreamCreate,
        16 => EventType::ServiceConfigChange,
        17 => EventType::PipeCreate,
        18 => EventType::PipeConnect,
        19 => EventType::WmiFilter,
        20 => EventType::WmiConsumer,
        21 => EventType::WmiBinding,
        22 => EventType::DnsQuery,
        // 26 is the delete-detected variant; both fold into fileDelete.
        23 | 26 => EventType::FileDelete,
        24 => EventType::ClipboardChange,
        25 => EventType::ProcessTampering,
        27 => EventType::FileBlockExec,
        28 => EventType::FileBlockShred,
        _ => EventType::Other,
    }
}

/// Message keys whose values describe the operation's target.
const TARGET_KEYS: &[&str] = &[
    "TargetFilename",
    "TargetObject",
    "TargetImage",
    "DestinationIp",
    "DestinationHostname",
    "QueryName",
    "PipeName",
    "ImageLoaded",
    "Device",
    "Destination",
];

/// Parse the `Key: Value` lines of a rendered Sysmon message.
fn parse_message_fields(message: &str) -> BTreeMap<String, String> {
    message
        .lines()
        .filter_map(|line| {
            let (key, value) = line.split_once(':')?;
            let key = key.trim();
            // Keys are single PascalCase words; anything else is prose.
            if key.is_empty() || key.contains(' ') {
                return None;
            }
            Some((key.to_string(), value.trim().to_string()))
        })
        .collect()
}

fn build_event(value: &serde_json::Value, window: &CollectionWindow) -> Option<Event> {
    let id = value.get("Id")?.as_i64()?;
    let timestamp = value
        .get("TimeCreated")
        .and_then(|v| v.as_str())
        .and_then(parse_ps_datetime)?;
    if !window.contains(timestamp) {
        return None;
    }

    let message = value.get("Message").and_then(|v| v.as_str()).unwrap_or("");
    let fields = parse_message_fields(message);

    let pid = fields.get("ProcessId").and_then(|v| v.parse().ok());
    let ppid = fields.get("ParentProcessId").and_then(|v| v.parse().ok());
    let image = fields.get("Image").cloned();
    let command_line = fields.get("CommandLine").cloned();
    let targets: Vec<String> = TARGET_KEYS
        .iter()
        .filter_map(|key| fields.get(*key))
        .filter(|v| !v.is_empty() && *v != "-")
        .cloned()
        .collect();

    let raw_fields = fields
        .into_iter()
        .map(|(k, v)| (k, serde_json::Value::String(v)))
        .collect();

    Some(Event {
        event_type: event_type_for_id(id),
        timestamp,
        pid,
        ppid,
        image,
        command_line,
        targets,
        raw_fields,
    })
}

fn channel_missing(stderr: &str) -> bool {
    stderr.contains("There is no event log") || stderr.contains("could not be found")
}

pub struct SysmonCollector;

impl SysmonCollector {
    pub fn new() -> Self {
        Self
    }
}

impl Default for SysmonCollector {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Collector for SysmonCollector {
    async fn collect(
        &self,
        shell: &GuestShell,
        window: &CollectionWindow,
        _hints: &SampleHints,
    ) -> Result<Collection> {
        let start = CollectionWindow::format_for_guest(window.start);
        let end = CollectionWindow::format_for_guest(window.end);
        let script = format!(
            "Get-WinEvent -FilterHashtable @{{LogName='{}'; StartTime=[datetime]'{}'; EndTime=[datetime]'{}'}} -ErrorAction Stop | Select-Object Id,TimeCreated,Message | ConvertTo-Json -Depth 3",
            SYSMON_CHANNEL, start, end
        );
        let command = GuestCommandBuilder::new().raw(&script).build()?;
        let output = shell.run_command(&command, EXEC_TIMEOUT).await?;

        if !output.success() {
            // An empty window makes Get-WinEvent fail with "No events were
            // found"; that is clean no-data, not a collector failure.
            if output.stderr.contains("No events were found") {
                return Ok(Collection::default());
            }
            if channel_missing(&output.stderr) {
                return Err(Error::AgentUnavailable(format!(
                    "Sysmon channel missing on '{}': {}",
                    shell.vm_name(),
                    output.stderr.trim()
                )));
            }
            return Err(Error::Collector(format!(
                "Get-WinEvent exited {}: {}",
                output.exit_code,
                output.stderr.trim()
            )));
        }

        let events = json_values(&output.stdout)?
            .iter()
            .filter_map(|value| build_event(value, window))
            .collect();

        Ok(Collection {
            alerts: Vec::new(),
            events,
        })
    }
}
