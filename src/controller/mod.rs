//! VM Controller
//!
//! One-shot wrapper over the external virtualization CLI: power control,
//! snapshot restore, status, guest file copy, guest execution. Every
//! operation is async and bounded by a caller-supplied timeout; each
//! invocation spawns a fresh CLI child process.
//!
//! The production implementation is [`vboxmanage::VBoxManage`]. Tests and
//! dry runs use [`mock::MockVmController`].

pub mod mock;
pub mod vboxmanage;

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;

use crate::Result;

/// VM power state as reported by the virtualization CLI.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PowerState {
    Running,
    Paused,
    /// Guru meditation / wedged guest.
    Stuck,
    Starting,
    PowerOff,
    Aborted,
    Saved,
    Unknown,
}

impl PowerState {
    /// States from which the VM must be forced down before a snapshot restore.
    pub fn is_up(&self) -> bool {
        matches!(
            self,
            PowerState::Running | PowerState::Paused | PowerState::Stuck | PowerState::Starting
        )
    }

    /// States that count as "off" for the cleanup post-condition.
    pub fn is_off(&self) -> bool {
        matches!(
            self,
            PowerState::PowerOff | PowerState::Aborted | PowerState::Saved
        )
    }
}

/// Whether the platform still holds a session on the VM.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Locked,
    Unlocked,
    Unknown,
}

/// Snapshot of a VM's externally visible state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VmStatus {
    pub power_state: PowerState,
    pub session_state: SessionState,
}

impl VmStatus {
    pub fn unknown() -> Self {
        Self {
            power_state: PowerState::Unknown,
            session_state: SessionState::Unknown,
        }
    }
}

/// VM start mode. GUI is the operational default so operators can observe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartMode {
    Headless,
    Gui,
}

impl StartMode {
    pub fn as_cli_arg(&self) -> &'static str {
        match self {
            StartMode::Headless => "headless",
            StartMode::Gui => "gui",
        }
    }
}

/// Captured output of a guest command.
#[derive(Debug, Clone)]
pub struct GuestExecOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl GuestExecOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// The seam between the orchestration core and the virtualization platform.
///
/// Implementations must never leave a child process behind: a call that
/// exceeds its deadline kills the CLI child before returning.
#[async_trait]
pub trait VmController: Send + Sync {
    /// Read the VM's power and session state. Never fails for an unknown
    /// VM; reports [`PowerState::Unknown`] instead.
    async fn status(&self, vm: &str) -> Result<VmStatus>;

    /// Restore the named snapshot. The VM must not be running; callers
    /// invoke [`VmController::cleanup_resources`] first.
    async fn restore_snapshot(&self, vm: &str, snapshot: &str) -> Result<()>;

    /// Ask the CLI to start the VM. Returns once the request is accepted;
    /// guest readiness is probed separately.
    async fn power_on(&self, vm: &str, mode: StartMode) -> Result<()>;

    /// Poll guest-additions responsiveness by running a trivial guest
    /// command until it exits cleanly or the deadline expires.
    async fn wait_guest_ready(
        &self,
        vm: &str,
        user: &str,
        password: &str,
        deadline: Duration,
    ) -> Result<()>;

    /// Copy a host file into the guest, overwriting any existing file.
    async fn copy_to_guest(
        &self,
        vm: &str,
        host_path: &Path,
        guest_path: &str,
        user: &str,
        password: &str,
        deadline: Duration,
    ) -> Result<()>;

    /// Execute a single program (with argv) in the guest. Not a shell.
    async fn exec_in_guest(
        &self,
        vm: &str,
        program: &str,
        args: &[String],
        user: &str,
        password: &str,
        deadline: Duration,
    ) -> Result<GuestExecOutput>;

    /// Return the VM to `poweroff` with no held session, surviving stuck
    /// and locked states. Idempotent; safe on an already-off VM. Every
    /// pipeline exit path calls this.
    async fn cleanup_resources(&self, vm: &str) -> Result<()>;

    /// Names of all VMs registered with the platform.
    async fn list_vms(&self) -> Result<Vec<String>>;
}
