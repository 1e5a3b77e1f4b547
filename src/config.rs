use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::{Error, Result};

/// Top-level detonator configuration, loaded from YAML.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    /// Absolute path (or PATH-resolvable name) of the VBoxManage-compatible CLI.
    #[serde(default = "default_vbox_manage_path")]
    pub vbox_manage_path: String,
    pub vms: Vec<VmSpec>,
    #[serde(default)]
    pub analysis: AnalysisConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_port")]
    pub port: u16,
    /// Host directory where submitted samples land.
    pub upload_dir: PathBuf,
    /// Uploads over this limit are rejected with InvalidSample.
    #[serde(default = "default_max_file_size")]
    pub max_file_size: u64,
    /// Required in the X-API-Key header of every request.
    pub api_key: String,
}

/// One sandbox VM and the agent it carries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VmSpec {
    pub name: String,
    pub role: VmRole,
    pub agent: AgentKind,
    pub user: String,
    pub password: String,
    /// The clean pre-infection snapshot restored between runs.
    pub baseline_snapshot: String,
    /// Guest directory the sample is copied to, e.g. `C:\Users\sandbox\Desktop`.
    pub desktop_path: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum VmRole {
    Behavioral,
    SecurityAgent,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum AgentKind {
    Defender,
    Kaspersky,
    Mcafee,
    Avira,
    Trend,
    BehavioralMonitor,
}

impl AgentKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AgentKind::Defender => "defender",
            AgentKind::Kaspersky => "kaspersky",
            AgentKind::Mcafee => "mcafee",
            AgentKind::Avira => "avira",
            AgentKind::Trend => "trend",
            AgentKind::BehavioralMonitor => "behavioral-monitor",
        }
    }
}

impl std::fmt::Display for AgentKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisConfig {
    /// WaitingGuest deadline in seconds. Agents known to boot slowly may raise this.
    #[serde(default = "default_vm_startup_timeout")]
    pub vm_startup_timeout: u64,
    /// Agent-reaction wait before probing the uploaded sample, seconds.
    #[serde(default = "default_detonation_dwell")]
    pub detonation_dwell: u64,
    /// Dwelling duration, seconds.
    #[serde(default = "default_monitoring_window")]
    pub monitoring_window: u64,
    /// Grace added on both sides of the collection window, seconds.
    #[serde(default = "default_collection_grace")]
    pub collection_grace: u64,
    /// Ceiling on concurrently running pipelines.
    #[serde(default = "default_max_concurrent_tasks")]
    pub max_concurrent_tasks: usize,
    /// Bounded work-queue capacity.
    #[serde(default = "default_queue_size")]
    pub queue_size: usize,
    /// PowerOn mode: GUI when true so operators can observe, headless otherwise.
    #[serde(default = "default_gui_mode")]
    pub gui_mode: bool,
    /// Upper bound on a single pipeline's timeout, seconds.
    #[serde(default = "default_per_vm_max_seconds")]
    pub per_vm_max_seconds: u64,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            vm_startup_timeout: default_vm_startup_timeout(),
            detonation_dwell: default_detonation_dwell(),
            monitoring_window: default_monitoring_window(),
            collection_grace: default_collection_grace(),
            max_concurrent_tasks: default_max_concurrent_tasks(),
            queue_size: default_queue_size(),
            gui_mode: default_gui_mode(),
            per_vm_max_seconds: default_per_vm_max_seconds(),
        }
    }
}

impl AnalysisConfig {
    pub fn vm_startup_timeout(&self) -> Duration {
        Duration::from_secs(self.vm_startup_timeout)
    }

    pub fn detonation_dwell(&self) -> Duration {
        Duration::from_secs(self.detonation_dwell)
    }

    pub fn monitoring_window(&self) -> Duration {
        Duration::from_secs(self.monitoring_window)
    }

    pub fn collection_grace(&self) -> Duration {
        Duration::from_secs(self.collection_grace)
    }
}

fn default_port() -> u16 {
    8093
}

fn default_max_file_size() -> u64 {
    100 * 1024 * 1024
}

fn default_vbox_manage_path() -> String {
    "VBoxManage".to_string()
}

fn default_vm_startup_timeout() -> u64 {
    120
}

fn default_detonation_dwell() -> u64 {
    5
}

fn default_monitoring_window() -> u64 {
    60
}

fn default_collection_grace() -> u64 {
    10
}

fn default_max_concurrent_tasks() -> usize {
    10
}

fn default_queue_size() -> usize {
    100
}

fn default_gui_mode() -> bool {
    true
}

fn default_per_vm_max_seconds() -> u64 {
    600
}

pub fn load_config(path: &Path) -> Result<Config> {
    let raw = fs::read_to_string(path)
        .map_err(|e| Error::Config(format!("failed to read {}: {}", path.display(), e)))?;

    let config: Config = serde_yaml::from_str(&raw)
        .map_err(|e| Error::Config(format!("invalid YAML config {}: {}", path.display(), e)))?;

    validate_config(&config)?;
    Ok(config)
}

pub fn validate_config(config: &Config) -> Result<()> {
    if config.server.api_key.trim().is_empty() {
        return Err(Error::Config("server.api_key cannot be empty".into()));
    }
    if config.server.max_file_size == 0 {
        return Err(Error::Config("server.max_file_size must be > 0".into()));
    }
    if config.vms.is_empty() {
        return Err(Error::Config("at least one VM must be configured".into()));
    }

    let mut seen = HashSet::new();
    for vm in &config.vms {
        if vm.name.trim().is_empty() {
            return Err(Error::Config("vms[].name cannot be empty".into()));
        }
        if !seen.insert(vm.name.as_str()) {
            return Err(Error::Config(format!("duplicate VM name '{}'", vm.name)));
        }
        if vm.baseline_snapshot.trim().is_empty() {
            return Err(Error::Config(format!(
                "vms[{}].baseline_snapshot cannot be empty",
                vm.name
            )));
        }
        if vm.desktop_path.trim().is_empty() {
            return Err(Error::Config(format!(
                "vms[{}].desktop_path cannot be empty",
                vm.name
            )));
        }
        match (vm.role, vm.agent) {
            (VmRole::Behavioral, AgentKind::BehavioralMonitor) => {}
            (VmRole::Behavioral, other) => {
                return Err(Error::Config(format!(
                    "vms[{}]: role 'behavioral' requires agent 'behavioral-monitor', got '{}'",
                    vm.name, other
                )));
            }
            (VmRole::SecurityAgent, AgentKind::BehavioralMonitor) => {
                return Err(Error::Config(format!(
                    "vms[{}]: role 'security-agent' cannot carry the behavioral monitor",
                    vm.name
                )));
            }
            (VmRole::SecurityAgent, _) => {}
        }
    }

    if config.analysis.max_concurrent_tasks == 0 {
        return Err(Error::Config(
            "analysis.max_concurrent_tasks must be >= 1".into(),
        ));
    }
    if config.analysis.queue_size == 0 {
        return Err(Error::Config("analysis.queue_size must be >= 1".into()));
    }
    if config.analysis.vm_startup_timeout == 0 {
        return Err(Error::Config(
            "analysis.vm_startup_timeout must be > 0".into(),
        ));
    }
    if config.analysis.per_vm_max_seconds == 0 {
        return Err(Error::Config(
            "analysis.per_vm_max_seconds must be > 0".into(),
        ));
    }

    Ok(())
}

impl Config {
    /// Look up a configured VM by name.
    pub fn vm(&self, name: &str) -> Option<&VmSpec> {
        self.vms.iter().find(|vm| vm.name == name)
    }

    /// The names of all configured VMs, in config order.
    pub fn vm_names(&self) -> Vec<String> {
        self.vms.iter().map(|vm| vm.name.clone()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_yaml() -> &'static str {
        r#"
server:
  port: 8093
  upload_dir: /var/lib/detonator/uploads
  api_key: secret
vbox_manage_path: /usr/bin/VBoxManage
vms:
  - name: beh
    role: behavioral
    agent: behavioral-monitor
    user: sandbox
    password: sandbox
    baseline_snapshot: clean
    desktop_path: 'C:\Users\sandbox\Desktop'
  - name: def
    role: security-agent
    agent: defender
    user: sandbox
    password: sandbox
    baseline_snapshot: clean
    desktop_path: 'C:\Users\sandbox\Desktop'
analysis:
  monitoring_window: 45
"#
    }

    #[test]
    fn parses_and_validates_sample_config() {
        let config: Config = serde_yaml::from_str(sample_yaml()).unwrap();
        validate_config(&config).unwrap();
        assert_eq!(config.server.port, 8093);
        assert_eq!(config.vms.len(), 2);
        assert_eq!(config.analysis.monitoring_window, 45);
        // Untouched keys keep their defaults.
        assert_eq!(config.analysis.detonation_dwell, 5);
        assert_eq!(config.analysis.queue_size, 100);
        assert!(config.analysis.gui_mode);
    }

    #[test]
    fn rejects_duplicate_vm_names() {
        let mut config: Config = serde_yaml::from_str(sample_yaml()).unwrap();
        config.vms[1].name = "beh".into();
        let err = validate_config(&config).unwrap_err();
        assert!(err.to_string().contains("duplicate VM name"));
    }

    #[test]
    fn rejects_behavioral_role_with_av_agent() {
        let mut config: Config = serde_yaml::from_str(sample_yaml()).unwrap();
        config.vms[0].agent = AgentKind::Kaspersky;
        assert!(validate_config(&config).is_err());
    }

    #[test]
    fn rejects_empty_api_key() {
        let mut config: Config = serde_yaml::from_str(sample_yaml()).unwrap();
        config.server.api_key = " ".into();
        assert!(validate_config(&config).is_err());
    }

    #[test]
    fn vm_lookup_by_name() {
        let config: Config = serde_yaml::from_str(sample_yaml()).unwrap();
        assert!(config.vm("def").is_some());
        assert!(config.vm("nope").is_none());
        assert_eq!(config.vm_names(), vec!["beh", "def"]);
    }

    #[test]
    fn agent_kind_parses_kebab_case() {
        let kind: AgentKind = serde_yaml::from_str("behavioral-monitor").unwrap();
        assert_eq!(kind, AgentKind::BehavioralMonitor);
        let kind: AgentKind = serde_yaml::from_str("trend").unwrap();
        assert_eq!(kind, AgentKind::Trend);
    }
}
