//! Collector Interface
//!
//! One collector per agent kind, selected from a registry. A collector is
//! free in its mechanism (in-guest command execution, log retrieval, event
//! log query) but must confine itself to the detonation window plus grace,
//! normalize timestamps to local time with offset, and tolerate "no data"
//! by returning empty collections. An unreachable in-guest tool is
//! [`crate::Error::AgentUnavailable`].

pub mod antivirus;
pub mod defender;
pub mod sysmon;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Local};

use crate::config::AgentKind;
use crate::guest::GuestShell;
use crate::model::{Alert, Event};
use crate::{Error, Result};

/// The detonation window alerts and events must fall into, already
/// extended by the configured grace on both sides.
#[derive(Debug, Clone, Copy)]
pub struct CollectionWindow {
    pub start: DateTime<Local>,
    pub end: DateTime<Local>,
}

impl CollectionWindow {
    /// Build from the raw pipeline window and the grace δ.
    pub fn with_grace(
        started_at: DateTime<Local>,
        ended_at: DateTime<Local>,
        grace: std::time::Duration,
    ) -> Self {
        let grace = ChronoDuration::from_std(grace).unwrap_or_else(|_| ChronoDuration::seconds(0));
        Self {
            start: started_at - grace,
            end: ended_at + grace,
        }
    }

    pub fn contains(&self, timestamp: DateTime<Local>) -> bool {
        timestamp >= self.start && timestamp <= self.end
    }

    /// Render a bound the guest shell can cast with `[datetime]'...'`.
    pub fn format_for_guest(timestamp: DateTime<Local>) -> String {
        timestamp.format("%Y-%m-%d %H:%M:%S").to_string()
    }
}

/// What the pipeline knows about the sample, passed to collectors as
/// matching hints.
#[derive(Debug, Clone)]
pub struct SampleHints {
    pub name: String,
    pub hash_hex: String,
    pub guest_path: String,
}

/// The structured outcome of one collection pass.
#[derive(Debug, Clone, Default)]
pub struct Collection {
    pub alerts: Vec<Alert>,
    pub events: Vec<Event>,
}

#[async_trait]
pub trait Collector: Send + Sync {
    async fn collect(
        &self,
        shell: &GuestShell,
        window: &CollectionWindow,
        hints: &SampleHints,
    ) -> Result<Collection>;
}

/// Registry mapping each agent kind to its collector.
#[derive(Clone)]
pub struct CollectorRegistry {
    collectors: HashMap<AgentKind, Arc<dyn Collector>>,
}

impl CollectorRegistry {
    /// The standard set: Defender, the four AV log collectors, and the
    /// behavioral monitor.
    pub fn standard() -> Self {
        let mut collectors: HashMap<AgentKind, Arc<dyn Collector>> = HashMap::new();
        collectors.insert(
            AgentKind::Defender,
            Arc::new(defender::DefenderCollector::new()),
        );
        collectors.insert(
            AgentKind::Kaspersky,
            Arc::new(antivirus::AvLogCollector::kaspersky()),
        );
        collectors.insert(
            AgentKind::Mcafee,
            Arc::new(antivirus::AvLogCollector::mcafee()),
        );
        collectors.insert(
            AgentKind::Avira,
            Arc::new(antivirus::AvLogCollector::avira()),
        );
        collectors.insert(
            AgentKind::Trend,
            Arc::new(antivirus::AvLogCollector::trend()),
        );
        collectors.insert(
            AgentKind::BehavioralMonitor,
            Arc::new(sysmon::SysmonCollector::new()),
        );
        Self { collectors }
    }

    /// Replace the collector for one agent kind (tests).
    pub fn with_collector(mut self, kind: AgentKind, collector: Arc<dyn Collector>) -> Self {
        self.collectors.insert(kind, collector);
        self
    }

    pub fn for_kind(&self, kind: AgentKind) -> Result<Arc<dyn Collector>> {
        self.collectors
            .get(&kind)
            .cloned()
            .ok_or_else(|| Error::Collector(format!("no collector registered for '{}'", kind)))
    }
}

/// Parse the timestamp formats PowerShell's `ConvertTo-Json` emits for
/// DateTime values: the DCOM `\/Date(milliseconds)\/` envelope on Windows
/// PowerShell 5.1 and ISO-8601 on PowerShell 7.
pub(crate) fn parse_ps_datetime(raw: &str) -> Option<DateTime<Local>> {
    let raw = raw.trim().trim_matches('"');

    if let Some(ms) = raw
        .strip_prefix("/Date(")
        .or_else(|| raw.strip_prefix("\\/Date("))
        .and_then(|rest| rest.split(')').next())
    {
        // Offset suffixes like 1700000000000+0200 repeat the local offset;
        // the epoch value alone is authoritative.
        let ms: i64 = ms
            .chars()
            .take_while(|c| c.is_ascii_digit() || *c == '-')
            .collect::<String>()
            .parse()
            .ok()?;
        return DateTime::from_timestamp_millis(ms).map(|utc| utc.with_timezone(&Local));
    }

    if let Ok(parsed) = DateTime::parse_from_rfc3339(raw) {
        return Some(parsed.with_timezone(&Local));
    }
    if let Ok(naive) = chrono::NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f") {
        return naive.and_local_timezone(Local).single();
    }
    if let Ok(naive) = chrono::NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S") {
        return naive.and_local_timezone(Local).single();
    }
    None
}

/// ConvertTo-Json collapses a single element to a bare object; normalize
/// to a list either way. Empty output means no data.
pub(crate) fn json_values(stdout: &str) -> Result<Vec<serde_json::Value>> {
    let trimmed = stdout.trim();
    if trimmed.is_empty() || trimmed == "null" {
        return Ok(Vec::new());
    }
    let value: serde_json::Value = serde_json::from_str(trimmed)
        .map_err(|e| Error::Collector(format!("unparseable collector JSON: {}", e)))?;
    Ok(match value {
        serde_json::Value::Array(items) => items,
        serde_json::Value::Null => Vec::new(),
        other => vec![other],
    })
}
