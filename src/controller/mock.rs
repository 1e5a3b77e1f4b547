//! Scriptable in-memory VM controller for tests and dry runs.
//!
//! Models per-VM power state and a flat guest filesystem, records every
//! operation with a timestamp, and lets tests script failure behaviors:
//! unready guests, agents that delete the sample on upload, stuck sessions
//! that need the full power-off ladder, and cleanups that fail outright.

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;

use super::{GuestExecOutput, PowerState, SessionState, StartMode, VmController, VmStatus};
use crate::{Error, Result};

/// One recorded controller operation.
#[derive(Debug, Clone)]
pub struct CallRecord {
    pub vm: String,
    pub op: String,
    pub at: Instant,
}

#[derive(Default)]
struct MockState {
    registered: Vec<String>,
    power: HashMap<String, PowerState>,
    guest_files: HashMap<String, HashSet<String>>,
    fail_guest_ready: HashSet<String>,
    fail_restore: HashSet<String>,
    /// Cleanup fails once this VM's successful-cleanup count exceeds the
    /// stored threshold (0 = fail immediately).
    fail_cleanup_after: HashMap<String, usize>,
    cleanup_counts: HashMap<String, usize>,
    delete_on_upload: HashSet<String>,
    stuck_session: HashSet<String>,
    /// Per-VM scripted exec responses: first entry whose needle occurs in
    /// the rendered command line is popped and returned.
    exec_responses: HashMap<String, Vec<(String, GuestExecOutput)>>,
    calls: Vec<CallRecord>,
}

pub struct MockVmController {
    state: Mutex<MockState>,
}

impl Default for MockVmController {
    fn default() -> Self {
        Self::new()
    }
}

impl MockVmController {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MockState::default()),
        }
    }

    /// Register a VM, powered off.
    pub fn with_vm(self, vm: &str) -> Self {
        {
            let mut state = self.state.lock().unwrap();
            state.registered.push(vm.to_string());
            state.power.insert(vm.to_string(), PowerState::PowerOff);
        }
        self
    }

    /// Guest-readiness probes on this VM never succeed.
    pub fn fail_guest_ready(&self, vm: &str) {
        self.state
            .lock()
            .unwrap()
            .fail_guest_ready
            .insert(vm.to_string());
    }

    /// Snapshot restore on this VM fails.
    pub fn fail_restore(&self, vm: &str) {
        self.state
            .lock()
            .unwrap()
            .fail_restore
            .insert(vm.to_string());
    }

    /// Cleanup on this VM cannot get it off.
    pub fn fail_cleanup(&self, vm: &str) {
        self.fail_cleanup_after(vm, 0);
    }

    /// Let the first `successes` cleanups pass, then fail the rest.
    pub fn fail_cleanup_after(&self, vm: &str, successes: usize) {
        self.state
            .lock()
            .unwrap()
            .fail_cleanup_after
            .insert(vm.to_string(), successes);
    }

    /// The in-guest agent removes any uploaded file before it lands.
    pub fn delete_sample_on_upload(&self, vm: &str) {
        self.state
            .lock()
            .unwrap()
            .delete_on_upload
            .insert(vm.to_string());
    }

    /// The first graceful power-off is rejected, forcing the full ladder.
    pub fn stuck_session(&self, vm: &str) {
        self.state
            .lock()
            .unwrap()
            .stuck_session
            .insert(vm.to_string());
    }

    /// Script a guest-exec response, matched by substring of the command line.
    pub fn script_exec(&self, vm: &str, needle: &str, output: GuestExecOutput) {
        self.state
            .lock()
            .unwrap()
            .exec_responses
            .entry(vm.to_string())
            .or_default()
            .push((needle.to_string(), output));
    }

    pub fn set_power(&self, vm: &str, power: PowerState) {
        self.state
            .lock()
            .unwrap()
            .power
            .insert(vm.to_string(), power);
    }

    /// Every recorded operation, in order.
    pub fn calls(&self) -> Vec<CallRecord> {
        self.state.lock().unwrap().calls.clone()
    }

    /// Operation names recorded for one VM, in order.
    pub fn ops_for(&self, vm: &str) -> Vec<String> {
        self.state
            .lock()
            .unwrap()
            .calls
            .iter()
            .filter(|c| c.vm == vm)
            .map(|c| c.op.clone())
            .collect()
    }

    pub fn guest_has_file(&self, vm: &str, path: &str) -> bool {
        self.state
            .lock()
            .unwrap()
            .guest_files
            .get(vm)
            .map(|files| files.contains(path))
            .unwrap_or(false)
    }

    fn record(state: &mut MockState, vm: &str, op: &str) {
        state.calls.push(CallRecord {
            vm: vm.to_string(),
            op: op.to_string(),
            at: Instant::now(),
        });
    }

    /// Pull the first single-quoted token out of a PowerShell payload,
    /// undoing the doubled-quote escape.
    fn quoted_path(command_line: &str) -> Option<String> {
        let start = command_line.find('\'')? + 1;
        let rest = &command_line[start..];
        let mut path = String::new();
        let mut chars = rest.chars().peekable();
        while let Some(c) = chars.next() {
            if c == '\'' {
                if chars.peek() == Some(&'\'') {
                    chars.next();
                    path.push('\'');
                } else {
                    return Some(path);
                }
            } else {
                path.push(c);
            }
        }
        None
    }
}

#[async_trait]
impl VmController for MockVmController {
    async fn status(&self, vm: &str) -> Result<VmStatus> {
        let mut state = self.state.lock().unwrap();
        Self::record(&mut state, vm, "status");
        let power_state = state
            .power
            .get(vm)
            .copied()
            .unwrap_or(PowerState::Unknown);
        let session_state = if power_state.is_up() {
            SessionState::Locked
        } else {
            SessionState::Unlocked
        };
        Ok(VmStatus {
            power_state,
            session_state,
        })
    }

    async fn restore_snapshot(&self, vm: &str, snapshot: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        Self::record(&mut state, vm, "restore_snapshot");
        if state.fail_restore.contains(vm) {
            return Err(Error::Controller(format!(
                "snapshot restore on '{}': scripted failure",
                vm
            )));
        }
        let power = state.power.get(vm).copied().unwrap_or(PowerState::PowerOff);
        if power.is_up() {
            return Err(Error::Controller(format!(
                "cannot restore '{}' on '{}' while {:?}",
                snapshot, vm, power
            )));
        }
        state.guest_files.insert(vm.to_string(), HashSet::new());
        Ok(())
    }

    async fn power_on(&self, vm: &str, _mode: StartMode) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        Self::record(&mut state, vm, "power_on");
        state.power.insert(vm.to_string(), PowerState::Running);
        Ok(())
    }

    async fn wait_guest_ready(
        &self,
        vm: &str,
        _user: &str,
        _password: &str,
        _deadline: Duration,
    ) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        Self::record(&mut state, vm, "wait_guest_ready");
        if state.fail_guest_ready.contains(vm) {
            return Err(Error::Controller(format!(
                "guest additions on '{}' not ready within deadline",
                vm
            )));
        }
        Ok(())
    }

    async fn copy_to_guest(
        &self,
        vm: &str,
        _host_path: &Path,
        guest_path: &str,
        _user: &str,
        _password: &str,
        _deadline: Duration,
    ) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        Self::record(&mut state, vm, "copy_to_guest");
        let power = state.power.get(vm).copied().unwrap_or(PowerState::PowerOff);
        if !matches!(power, PowerState::Running) {
            return Err(Error::Transfer(format!(
                "copy into '{}' while {:?}",
                vm, power
            )));
        }
        if !state.delete_on_upload.contains(vm) {
            state
                .guest_files
                .entry(vm.to_string())
                .or_default()
                .insert(guest_path.to_string());
        }
        Ok(())
    }

    async fn exec_in_guest(
        &self,
        vm: &str,
        program: &str,
        args: &[String],
        _user: &str,
        _password: &str,
        _deadline: Duration,
    ) -> Result<GuestExecOutput> {
        let command_line = format!("{} {}", program, args.join(" "));
        let mut state = self.state.lock().unwrap();
        Self::record(&mut state, vm, "exec_in_guest");

        if let Some(responses) = state.exec_responses.get_mut(vm) {
            if let Some(idx) = responses
                .iter()
                .position(|(needle, _)| command_line.contains(needle.as_str()))
            {
                return Ok(responses.remove(idx).1);
            }
        }

        if command_line.contains("Test-Path") {
            let present = Self::quoted_path(&command_line)
                .map(|path| {
                    state
                        .guest_files
                        .get(vm)
                        .map(|files| files.contains(&path))
                        .unwrap_or(false)
                })
                .unwrap_or(false);
            return Ok(GuestExecOutput {
                exit_code: 0,
                stdout: format!("{}\r\n", if present { "True" } else { "False" }),
                stderr: String::new(),
            });
        }

        if command_line.contains("Remove-Item") {
            if let Some(path) = Self::quoted_path(&command_line) {
                if let Some(files) = state.guest_files.get_mut(vm) {
                    files.remove(&path);
                }
            }
            return Ok(GuestExecOutput {
                exit_code: 0,
                stdout: String::new(),
                stderr: String::new(),
            });
        }

        // Start-Process, readiness probes, unscripted collectors: succeed
        // with empty output.
        Ok(GuestExecOutput {
            exit_code: 0,
            stdout: String::new(),
            stderr: String::new(),
        })
    }

    async fn cleanup_resources(&self, vm: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        Self::record(&mut state, vm, "cleanup");

        let power = state.power.get(vm).copied().unwrap_or(PowerState::PowerOff);
        if power.is_up() && state.stuck_session.contains(vm) {
            // Rejected graceful off, ignored ACPI, forced off: the ladder
            // the real controller walks on a locked session.
            Self::record(&mut state, vm, "poweroff_rejected");
            Self::record(&mut state, vm, "acpipowerbutton");
            Self::record(&mut state, vm, "poweroff_forced");
        }

        let done = state.cleanup_counts.get(vm).copied().unwrap_or(0);
        if let Some(&allowed) = state.fail_cleanup_after.get(vm) {
            if done >= allowed {
                Self::record(&mut state, vm, "cleanup_failed");
                return Err(Error::Cleanup(format!(
                    "'{}' still Running after power-off ladder",
                    vm
                )));
            }
        }
        state.cleanup_counts.insert(vm.to_string(), done + 1);

        state.power.insert(vm.to_string(), PowerState::PowerOff);
        Self::record(&mut state, vm, "cleanup_done");
        Ok(())
    }

    async fn list_vms(&self) -> Result<Vec<String>> {
        Ok(self.state.lock().unwrap().registered.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn unknown_vm_reports_unknown_power_state() {
        let mock = MockVmController::new();
        let status = mock.status("ghost").await.unwrap();
        assert_eq!(status.power_state, PowerState::Unknown);
    }

    #[tokio::test]
    async fn upload_then_probe_sees_file() {
        let mock = MockVmController::new().with_vm("vm1");
        mock.power_on("vm1", StartMode::Gui).await.unwrap();
        mock.copy_to_guest(
            "vm1",
            Path::new("/tmp/s.exe"),
            r"C:\Users\sandbox\Desktop\s.exe",
            "u",
            "p",
            Duration::from_secs(5),
        )
        .await
        .unwrap();
        assert!(mock.guest_has_file("vm1", r"C:\Users\sandbox\Desktop\s.exe"));

        let probe = mock
            .exec_in_guest(
                "vm1",
                "powershell.exe",
                &[
                    "-NoProfile".into(),
                    "-Command".into(),
                    r"Test-Path -LiteralPath 'C:\Users\sandbox\Desktop\s.exe'".into(),
                ],
                "u",
                "p",
                Duration::from_secs(5),
            )
            .await
            .unwrap();
        assert!(probe.stdout.contains("True"));
    }

    #[tokio::test]
    async fn delete_on_upload_makes_probe_false() {
        let mock = MockVmController::new().with_vm("vm1");
        mock.delete_sample_on_upload("vm1");
        mock.power_on("vm1", StartMode::Gui).await.unwrap();
        mock.copy_to_guest(
            "vm1",
            Path::new("/tmp/s.exe"),
            r"C:\Desktop\s.exe",
            "u",
            "p",
            Duration::from_secs(5),
        )
        .await
        .unwrap();
        assert!(!mock.guest_has_file("vm1", r"C:\Desktop\s.exe"));
    }

    #[tokio::test]
    async fn stuck_session_walks_the_ladder() {
        let mock = MockVmController::new().with_vm("vm1");
        mock.stuck_session("vm1");
        mock.set_power("vm1", PowerState::Running);
        mock.cleanup_resources("vm1").await.unwrap();

        let ops = mock.ops_for("vm1");
        let ladder: Vec<&str> = ops
            .iter()
            .filter(|op| op.starts_with("poweroff") || *op == "acpipowerbutton")
            .map(|s| s.as_str())
            .collect();
        assert_eq!(
            ladder,
            vec!["poweroff_rejected", "acpipowerbutton", "poweroff_forced"]
        );
        let status = mock.status("vm1").await.unwrap();
        assert!(status.power_state.is_off());
    }

    #[tokio::test]
    async fn scripted_exec_response_matches_by_needle() {
        let mock = MockVmController::new().with_vm("vm1");
        mock.script_exec(
            "vm1",
            "Get-MpThreatDetection",
            GuestExecOutput {
                exit_code: 0,
                stdout: "[]".into(),
                stderr: String::new(),
            },
        );
        let out = mock
            .exec_in_guest(
                "vm1",
                "powershell.exe",
                &["-Command".into(), "Get-MpThreatDetection".into()],
                "u",
                "p",
                Duration::from_secs(5),
            )
            .await
            .unwrap();
        assert_eq!(out.stdout, "[]");
    }
}
