//! Windows Defender collector.
//!
//! Queries the Defender cmdlets through the guest shell and joins detection
//! records with threat metadata. Detections outside the window are
//! discarded; a guest without the Defender module is AgentUnavailable.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;
use uuid::Uuid;

use super::{json_values, parse_ps_datetime, Collection, CollectionWindow, Collector, SampleHints};
use crate::guest::{GuestCommandBuilder, GuestShell};
use crate::model::{Alert, Severity};
use crate::{Error, Result};

const EXEC_TIMEOUT: Duration = Duration::from_secs(60);

pub struct DefenderCollector;

impl DefenderCollector {
    pub fn new() -> Self {
        Self
    }
}

impl Default for DefenderCollector {
    fn default() -> Self {
        Self::new()
    }
}

/// Defender SeverityID: 1 Low, 2 Moderate, 4 High, 5 Severe.
fn map_severity(severity_id: Option<i64>) -> Severity {
    match severity_id {
        Some(1) => Severity::Low,
        Some(2) => Severity::Medium,
        Some(4) => Severity::High,
        Some(5) => Severity::Critical,
        Some(0) => Severity::Info,
        _ => Severity::Medium,
    }
}

fn str_field(value: &serde_json::Value, key: &str) -> Option<String> {
    value.get(key).and_then(|v| match v {
        serde_json::Value::String(s) if !s.is_empty() => Some(s.clone()),
        serde_json::Value::Number(n) => Some(n.to_string()),
        _ => None,
    })
}

/// Join detections with threat metadata into alerts, keeping only those
/// inside the window.
fn build_alerts(
    detections: &[serde_json::Value],
    threats: &[serde_json::Value],
    window: &CollectionWindow,
    hints: &SampleHints,
) -> Vec<Alert> {
    let threat_names: BTreeMap<String, (Option<String>, Option<i64>)> = threats
        .iter()
        .filter_map(|t| {
            let id = str_field(t, "ThreatID")?;
            let name = str_field(t, "ThreatName");
            let severity = t.get("SeverityID").and_then(|v| v.as_i64());
            Some((id, (name, severity)))
        })
        .collect();

    let mut alerts = Vec::new();
    for detection in detections {
        let Some(timestamp) = str_field(detection, "InitialDetectionTime")
            .as_deref()
            .and_then(parse_ps_datetime)
        else {
            continue;
        };
        if !window.contains(timestamp) {
            continue;
        }

        let threat_id = str_field(detection, "ThreatID");
        let (threat_name, severity_id) = threat_id
            .as_ref()
            .and_then(|id| threat_names.get(id).cloned())
            .unwrap_or((None, None));

        let resources = str_field(detection, "Resources");
        let file_hint = resources
            .as_deref()
            .filter(|r| r.contains(hints.name.as_str()))
            .map(str::to_string)
            .or(resources.clone());

        let mut raw_fields = BTreeMap::new();
        if let serde_json::Value::Object(map) = detection {
            for (k, v) in map {
                raw_fields.insert(k.clone(), v.clone());
            }
        }

        alerts.push(Alert {
            alert_id: Uuid::now_v7(),
            timestamp,
            severity: map_severity(severity_id),
            kind: "threat-detected".to_string(),
            threat_name,
            file_hint,
            raw_fields,
        });
    }
    alerts
}

fn unavailable(stderr: &str) -> bool {
    stderr.contains("is not recognized")
        || stderr.contains("Defender")
            && (stderr.contains("service") || stderr.contains("not running"))
}

#[async_trait]
impl Collector for DefenderCollector {
    async fn collect(
        &self,
        shell: &GuestShell,
        window: &CollectionWindow,
        hints: &SampleHints,
    ) -> Result<Collection> {
        let detections_cmd = GuestCommandBuilder::new()
            .raw("Get-MpThreatDetection | Select-Object ThreatID,ProcessName,Resources,InitialDetectionTime,ActionSuccess | ConvertTo-Json -Depth 4")
            .build()?;
        let detections_out = shell.run_command(&detections_cmd, EXEC_TIMEOUT).await?;
        if !detections_out.success() {
            if unavailable(&detections_out.stderr) {
                return Err(Error::AgentUnavailable(format!(
                    "Defender cmdlets unreachable on '{}': {}",
                    shell.vm_name(),
                    detections_out.stderr.trim()
                )));
            }
            return Err(Error::Collector(format!(
                "Get-MpThreatDetection exited {}: {}",
                detections_out.exit_code,
                detections_out.stderr.trim()
            )));
        }
        let detections = json_values(&detections_out.stdout)?;
        if detections.is_empty() {
            return Ok(Collection::default());
        }

        // Threat metadata carries names and severities; a failed lookup
        // degrades to defaults rather than dropping the detections.
        let threats_cmd = GuestCommandBuilder::new()
            .raw("Get-MpThreat | Select-Object ThreatID,ThreatName,SeverityID | ConvertTo-Json -Depth 4")
            .build()?;
        let threats = match shell.run_command(&threats_cmd, EXEC_TIMEOUT).await {
            Ok(out) if out.success() => json_values(&out.stdout).unwrap_or_default(),
            Ok(out) => {
                debug!(exit = out.exit_code, "Get-MpThreat failed, alerts keep defaults");
                Vec::new()
            }
            Err(_) => Vec::new(),
        };

        Ok(Collection {
            alerts: build_alerts(&detections, &threats, window, hints),
            events: Vec::new(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Local, TimeZone};

    fn window() -> CollectionWindow {
        CollectionWindow {
            start: Local.timestamp_opt(1_699_999_990, 0).unwrap(),
            end: Local.timestamp_opt(1_700_000_100, 0).unwrap(),
        }
    }

    fn hints() -> SampleHints {
        SampleHints {
            name: "eicar.com".into(),
            hash_hex: "aa".repeat(32),
            guest_path: r"C:\Users\sandbox\Desktop\eicar.com".into(),
        }
    }

    #[test]
    fn joins_detection_with_threat_metadata() {
        let detections = json_values(
            r#"{"ThreatID":2147519003,"ProcessName":"Unknown","Resources":"file:_C:\\Users\\sandbox\\Desktop\\eicar.com","InitialDetectionTime":"/Date(1700000050000)/","ActionSuccess":true}"#,
        )
        .unwrap();
        let threats = json_values(
            r#"[{"ThreatID":2147519003,"ThreatName":"Virus:DOS/EICAR_Test_File","SeverityID":5}]"#,
        )
        .unwrap();

        let alerts = build_alerts(&detections, &threats, &window(), &hints());
        assert_eq!(alerts.len(), 1);
        let alert = &alerts[0];
        assert_eq!(alert.severity, Severity::Critical);
        assert_eq!(
            alert.threat_name.as_deref(),
            Some("Virus:DOS/EICAR_Test_File")
        );
        assert!(alert.file_hint.as_deref().unwrap().contains("eicar.com"));
        assert_eq!(alert.kind, "threat-detected");
        assert!(alert.raw_fields.contains_key("ThreatID"));
    }

    #[test]
    fn discards_detections_outside_window() {
        let detections = json_values(
            r#"{"ThreatID":1,"InitialDetectionTime":"/Date(1600000000000)/"}"#,
        )
        .unwrap();
        let alerts = build_alerts(&detections, &[], &window(), &hints());
        assert!(alerts.is_empty());
    }

    #[test]
    fn missing_metadata_degrades_to_defaults() {
        let detections = json_values(
            r#"{"ThreatID":99,"InitialDetectionTime":"/Date(1700000050000)/"}"#,
        )
        .unwrap();
        let alerts = build_alerts(&detections, &[], &window(), &hints());
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].severity, Severity::Medium);
        assert!(alerts[0].threat_name.is_none());
    }

    #[test]
    fn severity_mapping() {
        assert_eq!(map_severity(Some(1)), Severity::Low);
        assert_eq!(map_severity(Some(2)), Severity::Medium);
        assert_eq!(map_severity(Some(4)), Severity::High);
        assert_eq!(map_severity(Some(5)), Severity::Critical);
        assert_eq!(map_severity(Some(0)), Severity::Info);
        assert_eq!(map_severity(None), Severity::Medium);
    }

    #[test]
    fn missing_module_is_unavailable() {
        assert!(unavailable(
            "The term 'Get-MpThreatDetection' is not recognized as the name of a cmdlet"
        ));
        assert!(!unavailable("some other failure"));
    }
}
