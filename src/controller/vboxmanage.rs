//! VBoxManage-compatible CLI controller.
//!
//! Shells out to the configured executable for every operation, parses the
//! machine-readable output, and classifies the CLI's stderr into typed
//! errors. Children that outlive their deadline are killed, never awaited
//! into zombies.

use std::collections::HashMap;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, warn};

use super::{GuestExecOutput, PowerState, SessionState, StartMode, VmController, VmStatus};
use crate::{Error, Result};

/// Default deadline for short CLI invocations (status, power control).
const CONTROL_TIMEOUT: Duration = Duration::from_secs(30);
/// Default deadline for snapshot restore.
const RESTORE_TIMEOUT: Duration = Duration::from_secs(120);

#[derive(Debug, Clone)]
pub struct VBoxManage {
    executable_path: String,
    /// Wait after the ACPI power button before escalating to forced off.
    acpi_wait: Duration,
    /// Total budget for the off-state poll in cleanup.
    off_wait: Duration,
    /// Poll cadence during cleanup.
    poll_interval: Duration,
    /// Pause after power-off so the platform releases the session lock.
    settle: Duration,
    /// Cadence of guest-readiness probes.
    ready_poll_interval: Duration,
}

impl VBoxManage {
    pub fn new(executable_path: impl Into<String>) -> Self {
        Self {
            executable_path: executable_path.into().trim().to_string(),
            acpi_wait: Duration::from_secs(5),
            off_wait: Duration::from_secs(30),
            poll_interval: Duration::from_secs(1),
            settle: Duration::from_secs(2),
            ready_poll_interval: Duration::from_secs(3),
        }
    }

    /// Shrink the cleanup/readiness timing for tests.
    #[doc(hidden)]
    pub fn with_timings(
        mut self,
        acpi_wait: Duration,
        off_wait: Duration,
        poll_interval: Duration,
        settle: Duration,
    ) -> Self {
        self.acpi_wait = acpi_wait;
        self.off_wait = off_wait;
        self.poll_interval = poll_interval;
        self.settle = settle;
        self
    }

    /// Run the CLI with the given args, capturing stdout and stderr.
    ///
    /// The child is spawned with `kill_on_drop`: when the timeout fires the
    /// in-flight future is dropped and the runtime kills and reaps the
    /// child, so an overrunning CLI never lingers.
    async fn run(&self, args: &[&str], deadline: Duration) -> Result<(String, String, i32)> {
        debug!(exe = %self.executable_path, ?args, "vboxmanage invoke");
        let output = tokio::time::timeout(
            deadline,
            Command::new(&self.executable_path)
                .args(args)
                .stdin(Stdio::null())
                .stdout(Stdio::piped())
                .stderr(Stdio::piped())
                .kill_on_drop(true)
                .output(),
        )
        .await
        .map_err(|_| {
            Error::Timeout(format!(
                "{} {} exceeded {}",
                self.executable_path,
                args.first().unwrap_or(&""),
                humantime::format_duration(deadline)
            ))
        })?
        .map_err(|e| Error::Controller(format!("failed to spawn {}: {}", self.executable_path, e)))?;

        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
        let code = output.status.code().unwrap_or(-1);
        Ok((stdout, stderr, code))
    }

    /// Run and require exit 0, classifying stderr on failure.
    async fn run_checked(&self, args: &[&str], deadline: Duration) -> Result<String> {
        let (stdout, stderr, code) = self.run(args, deadline).await?;
        if code == 0 {
            Ok(stdout)
        } else {
            Err(classify_cli_failure(&stderr, code))
        }
    }

    async fn control(&self, vm: &str, subcommand: &str) -> Result<()> {
        self.run_checked(&["controlvm", vm, subcommand], CONTROL_TIMEOUT)
            .await
            .map(|_| ())
    }
}

/// Map a non-zero CLI exit to a typed error based on its stderr text.
fn classify_cli_failure(stderr: &str, code: i32) -> Error {
    let text = stderr.trim();
    if text.contains("The specified user was not able to logon on guest") {
        return Error::Auth(first_line(text).to_string());
    }
    if text.contains("Could not find a registered machine named") {
        return Error::Controller(format!("VM not registered: {}", first_line(text)));
    }
    if text.contains("Could not find a snapshot named") {
        return Error::Controller(format!("snapshot not found: {}", first_line(text)));
    }
    if text.contains("is already locked by a session") {
        return Error::Controller(format!("session locked: {}", first_line(text)));
    }
    if text.contains("is not currently running") || text.contains("is not running") {
        return Error::Controller(format!("VM not running: {}", first_line(text)));
    }
    Error::Controller(format!("CLI exited {}: {}", code, first_line(text)))
}

fn first_line(s: &str) -> &str {
    s.lines().next().unwrap_or(s)
}

fn is_unregistered(err: &Error) -> bool {
    matches!(err, Error::Controller(msg) if msg.starts_with("VM not registered"))
}

/// Parse `showvminfo --machinereadable` output into a key/value map.
/// Values are unquoted where the CLI quoted them.
fn parse_machine_readable(output: &str) -> HashMap<&str, &str> {
    output
        .lines()
        .filter_map(|line| {
            let (key, value) = line.split_once('=')?;
            let value = value
                .strip_prefix('"')
                .and_then(|v| v.strip_suffix('"'))
                .unwrap_or(value);
            Some((key.trim(), value))
        })
        .collect()
}

fn parse_power_state(vm_state: &str) -> PowerState {
    match vm_state {
        "running" => PowerState::Running,
        "paused" => PowerState::Paused,
        "gurumeditation" => PowerState::Stuck,
        "starting" | "restoring" => PowerState::Starting,
        "poweroff" => PowerState::PowerOff,
        "aborted" | "aborted-saved" => PowerState::Aborted,
        "saved" | "saving" => PowerState::Saved,
        _ => PowerState::Unknown,
    }
}

fn parse_status(info: &HashMap<&str, &str>) -> VmStatus {
    let power_state = info
        .get("VMState")
        .map(|v| parse_power_state(v))
        .unwrap_or(PowerState::Unknown);

    // A present SessionName means the platform holds a session on the VM.
    let session_state = match info.get("SessionName") {
        Some(name) if !name.is_empty() => SessionState::Locked,
        Some(_) => SessionState::Unlocked,
        None => {
            if power_state.is_off() {
                SessionState::Unlocked
            } else {
                SessionState::Unknown
            }
        }
    };

    VmStatus {
        power_state,
        session_state,
    }
}

/// Parse `list vms` output: one `"name" {uuid}` per line.
fn parse_vm_list(output: &str) -> Vec<String> {
    output
        .lines()
        .filter_map(|line| {
            let line = line.trim();
            let rest = line.strip_prefix('"')?;
            let end = rest.find('"')?;
            Some(rest[..end].to_string())
        })
        .collect()
}

#[async_trait]
impl VmController for VBoxManage {
    async fn status(&self, vm: &str) -> Result<VmStatus> {
        match self
            .run_checked(&["showvminfo", vm, "--machinereadable"], CONTROL_TIMEOUT)
            .await
        {
            Ok(output) => Ok(parse_status(&parse_machine_readable(&output))),
            Err(err) if is_unregistered(&err) => Ok(VmStatus::unknown()),
            Err(err) => Err(err),
        }
    }

    async fn restore_snapshot(&self, vm: &str, snapshot: &str) -> Result<()> {
        self.run_checked(&["snapshot", vm, "restore", snapshot], RESTORE_TIMEOUT)
            .await
            .map(|_| ())
            .map_err(|e| Error::Controller(format!("snapshot restore on '{}': {}", vm, e)))
    }

    async fn power_on(&self, vm: &str, mode: StartMode) -> Result<()> {
        self.run_checked(
            &["startvm", vm, "--type", mode.as_cli_arg()],
            CONTROL_TIMEOUT,
        )
        .await
        .map(|_| ())
    }

    async fn wait_guest_ready(
        &self,
        vm: &str,
        user: &str,
        password: &str,
        deadline: Duration,
    ) -> Result<()> {
        let started = tokio::time::Instant::now();
        loop {
            let probe = self
                .exec_in_guest(
                    vm,
                    "cmd.exe",
                    &["/C".to_string(), "exit".to_string(), "0".to_string()],
                    user,
                    password,
                    self.ready_poll_interval + Duration::from_secs(10),
                )
                .await;

            match probe {
                Ok(output) if output.success() => return Ok(()),
                Ok(output) => {
                    debug!(vm, exit = output.exit_code, "guest probe not ready");
                }
                Err(Error::Auth(msg)) => return Err(Error::Auth(msg)),
                Err(err) => {
                    debug!(vm, %err, "guest probe failed");
                }
            }

            if started.elapsed() >= deadline {
                return Err(Error::Controller(format!(
                    "guest additions on '{}' not ready within {}",
                    vm,
                    humantime::format_duration(deadline)
                )));
            }
            tokio::time::sleep(self.ready_poll_interval).await;
        }
    }

    async fn copy_to_guest(
        &self,
        vm: &str,
        host_path: &Path,
        guest_path: &str,
        user: &str,
        password: &str,
        deadline: Duration,
    ) -> Result<()> {
        let host = host_path.to_string_lossy();
        let result = self
            .run_checked(
                &[
                    "guestcontrol",
                    vm,
                    "copyto",
                    "--username",
                    user,
                    "--password",
                    password,
                    host.as_ref(),
                    guest_path,
                ],
                deadline,
            )
            .await;

        match result {
            Ok(_) => Ok(()),
            Err(Error::Auth(msg)) => Err(Error::Auth(msg)),
            Err(err) => Err(Error::Transfer(format!(
                "copy {} -> {}:{}: {}",
                host, vm, guest_path, err
            ))),
        }
    }

    async fn exec_in_guest(
        &self,
        vm: &str,
        program: &str,
        args: &[String],
        user: &str,
        password: &str,
        deadline: Duration,
    ) -> Result<GuestExecOutput> {
        let mut cli_args = vec![
            "guestcontrol",
            vm,
            "run",
            "--username",
            user,
            "--password",
            password,
            "--wait-stdout",
            "--wait-stderr",
            "--exe",
            program,
            "--",
            program,
        ];
        cli_args.extend(args.iter().map(|s| s.as_str()));

        let (stdout, stderr, code) = self.run(&cli_args, deadline).await?;
        if code != 0 && stderr.contains("The specified user was not able to logon on guest") {
            return Err(Error::Auth(first_line(&stderr).to_string()));
        }
        // Non-zero guest exits are data, not controller failures; callers
        // interpret the exit code.
        Ok(GuestExecOutput {
            exit_code: code,
            stdout,
            stderr,
        })
    }

    async fn cleanup_resources(&self, vm: &str) -> Result<()> {
        let status = self.status(vm).await?;

        if status.power_state.is_up() {
            // Ladder: power-off, then ACPI with a short wait, then forced
            // power-off. Each rung only fires if the previous left the VM up.
            if let Err(err) = self.control(vm, "poweroff").await {
                warn!(vm, %err, "poweroff rejected, pressing ACPI power button");
                let _ = self.control(vm, "acpipowerbutton").await;

                let acpi_deadline = tokio::time::Instant::now() + self.acpi_wait;
                while tokio::time::Instant::now() < acpi_deadline {
                    if self.status(vm).await?.power_state.is_off() {
                        break;
                    }
                    tokio::time::sleep(self.poll_interval).await;
                }

                if !self.status(vm).await?.power_state.is_off() {
                    warn!(vm, "ACPI ignored, forcing power off");
                    let _ = self.control(vm, "poweroff").await;
                }
            }
        }

        // Poll until the platform reports an off state.
        let off_deadline = tokio::time::Instant::now() + self.off_wait;
        let mut final_state = self.status(vm).await?.power_state;
        while !final_state.is_off() && tokio::time::Instant::now() < off_deadline {
            tokio::time::sleep(self.poll_interval).await;
            final_state = self.status(vm).await?.power_state;
        }

        // Let the platform release the session lock before the next run.
        tokio::time::sleep(self.settle).await;

        if final_state.is_off() || final_state == PowerState::Unknown {
            Ok(())
        } else {
            Err(Error::Cleanup(format!(
                "'{}' still {:?} after power-off ladder",
                vm, final_state
            )))
        }
    }

    async fn list_vms(&self) -> Result<Vec<String>> {
        let output = self.run_checked(&["list", "vms"], CONTROL_TIMEOUT).await?;
        Ok(parse_vm_list(&output))
    }
}
