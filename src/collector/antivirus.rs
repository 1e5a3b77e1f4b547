//! Log-file collectors for the third-party antivirus agents.
//!
//! Kaspersky, McAfee, Avira and Trend Micro share a retrieval core: the
//! product's report log is read through the guest shell and handed to a
//! per-product line parser. A missing log file means no detections yet;
//! any other retrieval failure means the agent is unreachable.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Local, NaiveDateTime};
use uuid::Uuid;

use super::{Collection, CollectionWindow, Collector, SampleHints};
use crate::guest::{GuestCommandBuilder, GuestShell};
use crate::model::{Alert, Severity};
use crate::{Error, Result};

const EXEC_TIMEOUT: Duration = Duration::from_secs(60);

type LineParser = fn(&str) -> Option<ParsedDetection>;

/// A product-neutral detection record extracted from one log line.
#[derive(Debug, Clone)]
pub(crate) struct ParsedDetection {
    timestamp: DateTime<Local>,
    action: String,
    threat_name: Option<String>,
    file_path: Option<String>,
}

/// Severity follows how far the agent went: removal and blocking outrank a
/// bare detection.
fn severity_for_action(action: &str) -> Severity {
    let action = action.to_ascii_lowercase();
    if action.contains("quarant") || action.contains("delet") || action.contains("block") {
        Severity::High
    } else if action.contains("detect") || action.contains("found") {
        Severity::Medium
    } else {
        Severity::Info
    }
}

fn local(naive: NaiveDateTime) -> Option<DateTime<Local>> {
    naive.and_local_timezone(Local).single()
}

/// Kaspersky report export: tab-separated
/// `2026-08-01 10:30:15<TAB>Detected object<TAB>HEUR:Trojan.Win32.Agent.gen<TAB>C:\...\x.exe`.
pub(crate) fn parse_kaspersky_line(line: &str) -> Option<ParsedDetection> {
    let mut fields = line.split('\t');
    let timestamp = local(NaiveDateTime::parse_from_str(
        fields.next()?.trim(),
        "%Y-%m-%d %H:%M:%S",
    )
    .ok()?)?;
    let action = fields.next()?.trim().to_string();
    let threat_name = fields.next().map(|s| s.trim().to_string()).filter(|s| !s.is_empty());
    let file_path = fields.next().map(|s| s.trim().to_string()).filter(|s| !s.is_empty());
    Some(ParsedDetection {
        timestamp,
        action,
        threat_name,
        file_path,
    })
}

/// McAfee activity log:
/// `8/1/2026 10:30:15 AM|Blocked by on-access scan|Trojan-Agent|C:\...\x.exe`.
pub(crate) fn parse_mcafee_line(line: &str) -> Option<ParsedDetection> {
    let mut fields = line.split('|');
    let timestamp = local(NaiveDateTime::parse_from_str(
        fields.next()?.trim(),
        "%m/%d/%Y %I:%M:%S %p",
    )
    .ok()?)?;
    let action = fields.next()?.trim().to_string();
    let threat_name = fields.next().map(|s| s.trim().to_string()).filter(|s| !s.is_empty());
    let file_path = fields.next().map(|s| s.trim().to_string()).filter(|s| !s.is_empty());
    Some(ParsedDetection {
        timestamp,
        action,
        threat_name,
        file_path,
    })
}

/// Avira log entry:
/// `[2026-08-01 10:30:15] [DETECTION] file='C:\...\x.exe' malware='TR/Dropper.Gen' action='quarantine'`.
pub(crate) fn parse_avira_line(line: &str) -> Option<ParsedDetection> {
    let rest = line.strip_prefix('[')?;
    let (stamp, rest) = rest.split_once(']')?;
    let timestamp = local(NaiveDateTime::parse_from_str(stamp.trim(), "%Y-%m-%d %H:%M:%S").ok()?)?;
    if !rest.contains("[DETECTION]") {
        return None;
    }
    let quoted = |key: &str| -> Option<String> {
        let idx = rest.find(&format!("{}='", key))?;
        let start = idx + key.len() + 2;
        let end = rest[start..].find('\'')?;
        Some(rest[start..start + end].to_string())
    };
    Some(ParsedDetection {
        timestamp,
        action: quoted("action").unwrap_or_else(|| "detection".to_string()),
        threat_name: quoted("malware"),
        file_path: quoted("file"),
    })
}

/// Trend Micro scan log, comma-separated:
/// `2026/08/01 10:30:15,Virus detected,TROJ_GEN.R002C0,C:\...\x.exe,Quarantine`.
pub(crate) fn parse_trend_line(line: &str) -> Option<ParsedDetection> {
    let mut fields = line.split(',');
    let timestamp = local(NaiveDateTime::parse_from_str(
        fields.next()?.trim(),
        "%Y/%m/%d %H:%M:%S",
    )
    .ok()?)?;
    let detection = fields.next()?.trim().to_string();
    let threat_name = fields.next().map(|s| s.trim().to_string()).filter(|s| !s.is_empty());
    let file_path = fields.next().map(|s| s.trim().to_string()).filter(|s| !s.is_empty());
    let action = fields
        .next()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .unwrap_or(detection);
    Some(ParsedDetection {
        timestamp,
        action,
        threat_name,
        file_path,
    })
}

pub struct AvLogCollector {
    product: &'static str,
    log_path: &'static str,
    parser: LineParser,
}

impl AvLogCollector {
    pub fn kaspersky() -> Self {
        Self {
            product: "kaspersky",
            log_path: r"C:\ProgramData\Kaspersky Lab\Report\detect.log",
            parser: parse_kaspersky_line,
        }
    }

    pub fn mcafee() -> Self {
        Self {
            product: "mcafee",
            log_path: r"C:\ProgramData\McAfee\Endpoint Security\Logs\OnAccessScan_Activity.log",
            parser: parse_mcafee_line,
        }
    }

    pub fn avira() -> Self {
        Self {
            product: "avira",
            log_path: r"C:\ProgramData\Avira\Antivirus\LOGFILES\avira.log",
            parser: parse_avira_line,
        }
    }

    pub fn trend() -> Self {
        Self {
            product: "trend",
            log_path: r"C:\ProgramData\Trend Micro\Security Agent\Log\scan.log",
            parser: parse_trend_line,
        }
    }

    fn alerts_from_log(&self, log_text: &str, window: &CollectionWindow) -> Vec<Alert> {
        log_text
            .lines()
            .filter_map(|line| (self.parser)(line.trim_end_matches('\r')))
            .filter(|d| window.contains(d.timestamp))
            .map(|d| {
                let mut raw_fields = BTreeMap::new();
                raw_fields.insert(
                    "product".to_string(),
                    serde_json::Value::String(self.product.to_string()),
                );
                raw_fields.insert(
                    "action".to_string(),
                    serde_json::Value::String(d.action.clone()),
                );
                Alert {
                    alert_id: Uuid::now_v7(),
                    timestamp: d.timestamp,
                    severity: severity_for_action(&d.action),
                    kind: normalize_action(&d.action),
                    threat_name: d.threat_name,
                    file_hint: d.file_path,
                    raw_fields,
                }
            })
            .collect()
    }
}

fn normalize_action(action: &str) -> String {
    let action = action.to_ascii_lowercase();
    if action.contains("quarant") {
        "quarantine".to_string()
    } else if action.contains("delet") {
        "delete".to_string()
    } else if action.contains("block") {
        "block".to_string()
    } else {
        "threat-detected".to_string()
    }
}

fn log_missing(stderr: &str) -> bool {
    stderr.contains("Cannot find path") || stderr.contains("does not exist")
}

#[async_trait]
impl Collector for AvLogCollector {
    async fn collect(
        &self,
        shell: &GuestShell,
        window: &CollectionWindow,
        _hints: &SampleHints,
    ) -> Result<Collection> {
        let command = GuestCommandBuilder::new()
            .raw("Get-Content -LiteralPath")
            .path(self.log_path)
            .raw("-ErrorAction Stop")
            .build()?;
        let output = shell.run_command(&command, EXEC_TIMEOUT).await?;

        if !output.success() {
            // No log yet is a clean "no detections"; anything else means
            // the product install is not answering.
            if log_missing(&output.stderr) {
                return Ok(Collection::default());
            }
            return Err(Error::AgentUnavailable(format!(
                "{} log unreadable on '{}': exit {} {}",
                self.product,
                shell.vm_name(),
                output.exit_code,
                output.stderr.trim()
            )));
        }

        Ok(Collection {
            alerts: self.alerts_from_log(&output.stdout, window),
            events: Vec::new(),
        })
    }
}
