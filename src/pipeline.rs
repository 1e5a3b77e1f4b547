//! Pipeline State Machine
//!
//! Drives one sample through one VM:
//!
//! ```text
//! Queued → Acquired → Restoring → Starting → WaitingGuest →
//! Uploading → Detonating → Dwelling → Collecting → Cleanup → Released
//! ```
//!
//! Phases are strictly sequential; any failure short-circuits to Cleanup,
//! which always runs and is not cancellable. The lease is released even
//! when cleanup fails, so the pool never deadlocks; the VM is flagged
//! needs-attention instead.

use std::sync::Arc;
use std::time::Duration;

use chrono::Local;
use tokio::sync::watch;
use tracing::{info, warn};
use uuid::Uuid;

use crate::collector::{CollectionWindow, CollectorRegistry, SampleHints};
use crate::config::{AnalysisConfig, VmSpec};
use crate::controller::{StartMode, VmController};
use crate::error::ErrorKind;
use crate::guest::GuestShell;
use crate::model::{Phase, Sample, VmResult};
use crate::pool::VmPool;
use crate::{Error, Result};

/// Hard ceiling on the terminal cleanup phase. Past this the VM is
/// declared poisoned rather than holding the lease forever.
const CLEANUP_TIMEOUT: Duration = Duration::from_secs(90);

/// Deadline for the individual guest probes around detonation.
const PROBE_TIMEOUT: Duration = Duration::from_secs(30);

/// Extra headroom the fire-and-forget sample execution gets beyond the
/// monitoring window before its CLI child is killed.
const DETONATE_MARGIN: Duration = Duration::from_secs(30);

/// Collaborators a pipeline runs against, wired once at process start.
#[derive(Clone)]
pub struct PipelineContext {
    pub controller: Arc<dyn VmController>,
    pub pool: VmPool,
    pub collectors: CollectorRegistry,
    pub analysis: AnalysisConfig,
}

/// Why the forward phases stopped early.
enum Interrupt {
    Cancelled,
    Failed(ErrorKind, String),
}

/// Everything one pipeline run needs, bundled so phase helpers stay terse.
struct PipelineRun<'a> {
    ctx: &'a PipelineContext,
    vm: &'a VmSpec,
    sample: &'a Sample,
    shell: GuestShell,
    guest_sample_path: String,
    cancel: watch::Receiver<bool>,
    deadline: tokio::time::Instant,
}

/// File name the sample gets on the guest desktop: extensionless samples
/// are suffixed `.bin` so the shell can address them uniformly.
pub fn guest_file_name(sample_name: &str) -> String {
    if sample_name.rsplit('.').nth(1).is_some() {
        sample_name.to_string()
    } else {
        format!("{}.bin", sample_name)
    }
}

fn guest_sample_path(vm: &VmSpec, sample_name: &str) -> String {
    format!(
        "{}\\{}",
        vm.desktop_path.trim_end_matches('\\'),
        guest_file_name(sample_name)
    )
}

/// Run one sample on one VM to completion, producing its result. Never
/// propagates pipeline-local failures; only programming errors escape via
/// the result's Internal kind.
pub async fn run_pipeline(
    ctx: PipelineContext,
    vm: VmSpec,
    sample: Sample,
    timeout: Duration,
    cancel: watch::Receiver<bool>,
) -> VmResult {
    let pipeline_id = Uuid::now_v7();
    let deadline = tokio::time::Instant::now() + timeout;
    let mut result = VmResult::new(&vm.name, vm.agent);
    info!(vm = %vm.name, sample = %sample.name, %pipeline_id, "pipeline queued");

    // Acquired: exclusivity first. The wait shares the pipeline deadline;
    // a VM that never frees up is a cancellation, not an environment fault.
    let lease = match ctx
        .pool
        .acquire(&vm.name, pipeline_id, timeout)
        .await
    {
        Ok(lease) => lease,
        Err(Error::Timeout(detail)) => {
            result.error_kind = Some(ErrorKind::Cancelled);
            result.error_detail = Some(detail);
            result.ended_at = Some(Local::now());
            return result;
        }
        Err(err) => {
            result.error_kind = Some(ErrorKind::Internal);
            result.error_detail = Some(err.to_string());
            result.ended_at = Some(Local::now());
            return result;
        }
    };
    result.phase = Phase::Acquired;

    let mut run = PipelineRun {
        shell: GuestShell::new(Arc::clone(&ctx.controller), &vm),
        guest_sample_path: guest_sample_path(&vm, &sample.name),
        ctx: &ctx,
        vm: &vm,
        sample: &sample,
        cancel,
        deadline,
    };

    run.drive(&mut result).await;

    // On failure the phase freezes where the pipeline stopped; only an
    // unblemished run advances through Cleanup to Released.
    let clean_so_far = result.error_kind.is_none();
    if clean_so_far {
        result.phase = Phase::Cleanup;
    }

    // Cleanup: unconditional, not cancellable, bounded on its own.
    let cleanup = tokio::time::timeout(
        CLEANUP_TIMEOUT,
        ctx.controller.cleanup_resources(&vm.name),
    )
    .await;
    match cleanup {
        Ok(Ok(())) => {
            ctx.pool.clear_needs_attention(&vm.name);
        }
        Ok(Err(err)) => {
            warn!(vm = %vm.name, %err, "cleanup failed, VM needs attention");
            ctx.pool.mark_needs_attention(&vm.name);
            // A VM left running poisons the next run; that outranks
            // whatever the earlier phases concluded.
            result.phase = Phase::Cleanup;
            result.error_kind = Some(ErrorKind::CleanupFailed);
            result.error_detail = Some(err.to_string());
        }
        Err(_) => {
            warn!(vm = %vm.name, "cleanup exceeded its deadline, VM needs attention");
            ctx.pool.mark_needs_attention(&vm.name);
            result.phase = Phase::Cleanup;
            result.error_kind = Some(ErrorKind::CleanupFailed);
            result.error_detail = Some(format!(
                "cleanup did not finish within {}",
                humantime::format_duration(CLEANUP_TIMEOUT)
            ));
        }
    }

    ctx.pool.release(&lease);
    if result.error_kind.is_none() {
        result.phase = Phase::Released;
    }
    result.ended_at = Some(Local::now());
    info!(
        vm = %vm.name,
        sample = %sample.name,
        detected = result.detected(),
        error = result.error_kind.map(|k| k.as_str()).unwrap_or("none"),
        "pipeline finished"
    );
    result
}

impl PipelineRun<'_> {
    fn cancelled(&self) -> bool {
        *self.cancel.borrow() || tokio::time::Instant::now() >= self.deadline
    }

    /// Sleep for `duration`, cut short by cancellation or the pipeline
    /// deadline. Returns false when interrupted.
    async fn dwell(&mut self, duration: Duration) -> bool {
        let wakeup = tokio::time::Instant::now() + duration;
        let until = wakeup.min(self.deadline);
        loop {
            tokio::select! {
                _ = tokio::time::sleep_until(until) => {
                    return until == wakeup && !*self.cancel.borrow();
                }
                changed = self.cancel.changed() => {
                    if changed.is_err() || *self.cancel.borrow() {
                        return false;
                    }
                }
            }
        }
    }

    /// Forward phases up to and including Collecting. Failures and
    /// cancellations are folded into the result per the phase policy.
    async fn drive(&mut self, result: &mut VmResult) {
        match self.environment(result).await {
            Ok(()) => {}
            Err(Interrupt::Cancelled) => {
                result.error_kind = Some(ErrorKind::Cancelled);
                result.error_detail = Some("cancelled before detonation".into());
                return;
            }
            Err(Interrupt::Failed(kind, detail)) => {
                result.error_kind = Some(kind);
                result.error_detail = Some(detail);
                return;
            }
        }

        // Uploading/Detonating failures still collect: the agent may have
        // alerted on the upload itself.
        let mut detonation_error: Option<(ErrorKind, String)> = None;
        match self.detonate(result).await {
            // An agent that consumed the sample skips the monitoring
            // window; there is nothing left to observe running.
            Ok(()) if result.sample_deleted_by_agent => {}
            Ok(()) => {
                result.phase = Phase::Dwelling;
                if !self.dwell(self.ctx.analysis.monitoring_window()).await {
                    result.error_kind = Some(ErrorKind::Cancelled);
                    result.error_detail = Some("cancelled during monitoring window".into());
                }
            }
            Err(Interrupt::Cancelled) => {
                result.error_kind = Some(ErrorKind::Cancelled);
                result.error_detail = Some("cancelled during detonation".into());
            }
            Err(Interrupt::Failed(kind, detail)) => {
                detonation_error = Some((kind, detail));
            }
        }

        // Collect either way; on cancellation or detonation failure the
        // phase stays frozen while a best-effort pass salvages whatever
        // the agent observed up to this point.
        if result.error_kind.is_none() && detonation_error.is_none() {
            result.phase = Phase::Collecting;
        }
        match self.collect(result).await {
            Ok(()) => {}
            Err(err) => {
                let kind = match err {
                    Error::AgentUnavailable(_) => ErrorKind::AgentUnavailable,
                    _ => ErrorKind::CollectionFailed,
                };
                warn!(vm = %self.vm.name, %err, "collection failed");
                if result.error_kind.is_none() {
                    result.error_kind = Some(kind);
                    result.error_detail = Some(err.to_string());
                }
            }
        }

        // A detonation failure outranks a collection verdict on the wire.
        if let Some((kind, detail)) = detonation_error {
            result.error_kind = Some(kind);
            result.error_detail = Some(detail);
        }
    }

    /// Restoring, Starting, WaitingGuest. Any failure here means the
    /// environment never became analyzable.
    async fn environment(&mut self, result: &mut VmResult) -> std::result::Result<(), Interrupt> {
        let vm = self.vm;

        result.phase = Phase::Restoring;
        if self.cancelled() {
            return Err(Interrupt::Cancelled);
        }
        info!(vm = %vm.name, snapshot = %vm.baseline_snapshot, "restoring baseline");
        // A prior crash may have left the VM running; always clean first.
        self.ctx
            .controller
            .cleanup_resources(&vm.name)
            .await
            .map_err(|e| Interrupt::Failed(ErrorKind::EnvironmentFailed, e.to_string()))?;
        self.ctx
            .controller
            .restore_snapshot(&vm.name, &vm.baseline_snapshot)
            .await
            .map_err(|e| Interrupt::Failed(ErrorKind::EnvironmentFailed, e.to_string()))?;

        result.phase = Phase::Starting;
        if self.cancelled() {
            return Err(Interrupt::Cancelled);
        }
        let mode = if self.ctx.analysis.gui_mode {
            StartMode::Gui
        } else {
            StartMode::Headless
        };
        self.ctx
            .controller
            .power_on(&vm.name, mode)
            .await
            .map_err(|e| Interrupt::Failed(ErrorKind::EnvironmentFailed, e.to_string()))?;

        result.phase = Phase::WaitingGuest;
        if self.cancelled() {
            return Err(Interrupt::Cancelled);
        }
        self.ctx
            .controller
            .wait_guest_ready(
                &vm.name,
                &vm.user,
                &vm.password,
                self.ctx.analysis.vm_startup_timeout(),
            )
            .await
            .map_err(|e| Interrupt::Failed(ErrorKind::EnvironmentFailed, e.to_string()))?;

        Ok(())
    }

    /// Uploading and Detonating, including the agent-reaction probe.
    async fn detonate(&mut self, result: &mut VmResult) -> std::result::Result<(), Interrupt> {
        let vm = self.vm;

        result.phase = Phase::Uploading;
        if self.cancelled() {
            return Err(Interrupt::Cancelled);
        }
        info!(vm = %vm.name, guest_path = %self.guest_sample_path, "uploading sample");
        let copied = self
            .ctx
            .controller
            .copy_to_guest(
                &vm.name,
                &self.sample.path,
                &self.guest_sample_path,
                &vm.user,
                &vm.password,
                PROBE_TIMEOUT,
            )
            .await;
        if let Err(err) = copied {
            let kind = match err {
                Error::Auth(_) => ErrorKind::AuthFailed,
                Error::Transfer(_) => ErrorKind::TransferFailed,
                _ => ErrorKind::TransferFailed,
            };
            return Err(Interrupt::Failed(kind, err.to_string()));
        }

        result.phase = Phase::Detonating;
        // Give the agent its reaction window before probing.
        if !self.dwell(self.ctx.analysis.detonation_dwell()).await {
            return Err(Interrupt::Cancelled);
        }

        let present = self
            .shell
            .path_exists(&self.guest_sample_path, PROBE_TIMEOUT)
            .await
            .map_err(|e| Interrupt::Failed(ErrorKind::DetonationFailed, e.to_string()))?;

        if !present {
            // The agent already acted: a first-class outcome, skip execution.
            info!(vm = %vm.name, "sample deleted by agent before execution");
            result.sample_deleted_by_agent = true;
            return Ok(());
        }

        let upper = self.ctx.analysis.monitoring_window() + DETONATE_MARGIN;
        self.shell
            .run_executable(&self.guest_sample_path, &[], upper)
            .map_err(|e| Interrupt::Failed(ErrorKind::DetonationFailed, e.to_string()))?;
        info!(vm = %vm.name, "sample launched (detached)");
        Ok(())
    }

    async fn collect(&mut self, result: &mut VmResult) -> Result<()> {
        let window = CollectionWindow::with_grace(
            result.started_at,
            Local::now(),
            self.ctx.analysis.collection_grace(),
        );
        let hints = SampleHints {
            name: self.sample.name.clone(),
            hash_hex: self.sample.hash_hex.clone(),
            guest_path: self.guest_sample_path.clone(),
        };
        let collector = self.ctx.collectors.for_kind(self.vm.agent)?;
        let collection = collector.collect(&self.shell, &window, &hints).await?;
        result.alerts.extend(collection.alerts);
        result.events.extend(collection.events);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AgentKind, VmRole};
    use crate::controller::mock::MockVmController;
    use crate::controller::GuestExecOutput;

    fn vm_spec(name: &str, agent: AgentKind) -> VmSpec {
        VmSpec {
            name: name.into(),
            role: if agent == AgentKind::BehavioralMonitor {
                VmRole::Behavioral
            } else {
                VmRole::SecurityAgent
            },
            agent,
            user: "sandbox".into(),
            password: "sandbox".into(),
            baseline_snapshot: "clean".into(),
            desktop_path: r"C:\Users\sandbox\Desktop".into(),
        }
    }

    fn fast_analysis() -> AnalysisConfig {
        AnalysisConfig {
            vm_startup_timeout: 5,
            detonation_dwell: 0,
            monitoring_window: 0,
            collection_grace: 10,
            max_concurrent_tasks: 10,
            queue_size: 100,
            gui_mode: true,
            per_vm_max_seconds: 30,
        }
    }

    fn context(mock: Arc<MockVmController>, vms: &[&str]) -> PipelineContext {
        PipelineContext {
            controller: mock,
            pool: VmPool::new(vms.iter().map(|s| s.to_string())),
            collectors: CollectorRegistry::standard(),
            analysis: fast_analysis(),
        }
    }

    fn sample() -> Sample {
        Sample::new("calc.exe", "/tmp/calc.exe", b"MZ")
    }

    #[test]
    fn extensionless_samples_get_bin_suffix() {
        assert_eq!(guest_file_name("calc.exe"), "calc.exe");
        assert_eq!(guest_file_name("dropper"), "dropper.bin");
        assert_eq!(guest_file_name("archive.tar.gz"), "archive.tar.gz");
    }

    #[tokio::test]
    async fn clean_run_walks_all_phases() {
        let mock = Arc::new(MockVmController::new().with_vm("def"));
        let ctx = context(Arc::clone(&mock), &["def"]);
        let (_cancel, cancel_rx) = watch::channel(false);

        let result = run_pipeline(
            ctx,
            vm_spec("def", AgentKind::Defender),
            sample(),
            Duration::from_secs(30),
            cancel_rx,
        )
        .await;

        assert_eq!(result.phase, Phase::Released);
        assert!(result.error_kind.is_none(), "{:?}", result.error_detail);
        assert!(!result.sample_deleted_by_agent);
        assert!(result.alerts.is_empty());
        assert!(result.ended_at.is_some());

        let ops = mock.ops_for("def");
        // Cleanup runs twice: once before restore, once terminally.
        assert_eq!(ops.iter().filter(|op| *op == "cleanup").count(), 2);
        let restore_idx = ops.iter().position(|op| op == "restore_snapshot").unwrap();
        let power_idx = ops.iter().position(|op| op == "power_on").unwrap();
        let copy_idx = ops.iter().position(|op| op == "copy_to_guest").unwrap();
        assert!(restore_idx < power_idx && power_idx < copy_idx);

        let status = mock.status("def").await.unwrap();
        assert!(status.power_state.is_off());
    }

    #[tokio::test]
    async fn agent_deleting_sample_is_a_detection_not_an_error() {
        let mock = Arc::new(MockVmController::new().with_vm("def"));
        mock.delete_sample_on_upload("def");
        let ctx = context(Arc::clone(&mock), &["def"]);
        let (_cancel, cancel_rx) = watch::channel(false);

        let result = run_pipeline(
            ctx,
            vm_spec("def", AgentKind::Defender),
            sample(),
            Duration::from_secs(30),
            cancel_rx,
        )
        .await;

        assert!(result.sample_deleted_by_agent);
        assert!(result.error_kind.is_none());
        assert!(result.detected());
        // Execution was skipped: no Start-Process reached the guest.
        assert!(!mock.guest_has_file("def", r"C:\Users\sandbox\Desktop\calc.exe"));
    }

    #[tokio::test]
    async fn guest_not_ready_fails_environment_and_still_cleans_up() {
        let mock = Arc::new(MockVmController::new().with_vm("def"));
        mock.fail_guest_ready("def");
        let ctx = context(Arc::clone(&mock), &["def"]);
        let (_cancel, cancel_rx) = watch::channel(false);

        let result = run_pipeline(
            ctx,
            vm_spec("def", AgentKind::Defender),
            sample(),
            Duration::from_secs(30),
            cancel_rx,
        )
        .await;

        assert_eq!(result.error_kind, Some(ErrorKind::EnvironmentFailed));
        assert_eq!(result.phase, Phase::WaitingGuest);
        let status = mock.status("def").await.unwrap();
        assert!(status.power_state.is_off());
        // No upload was attempted after the environment failure.
        assert!(!mock.ops_for("def").iter().any(|op| op == "copy_to_guest"));
    }

    #[tokio::test]
    async fn cleanup_failure_marks_vm_needs_attention_and_releases_lease() {
        let mock = Arc::new(MockVmController::new().with_vm("def"));
        // The pre-restore cleanup passes; the terminal one fails.
        mock.fail_cleanup_after("def", 1);
        let ctx = context(Arc::clone(&mock), &["def"]);
        let pool = ctx.pool.clone();
        let (_cancel, cancel_rx) = watch::channel(false);

        let result = run_pipeline(
            ctx,
            vm_spec("def", AgentKind::Defender),
            sample(),
            Duration::from_secs(30),
            cancel_rx,
        )
        .await;

        assert_eq!(result.error_kind, Some(ErrorKind::CleanupFailed));
        assert!(pool.needs_attention("def"));
        // The lease is still free for the next pipeline.
        assert!(pool
            .acquire("def", Uuid::now_v7(), Duration::from_millis(100))
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn cancellation_before_start_goes_straight_to_cleanup() {
        let mock = Arc::new(MockVmController::new().with_vm("def"));
        let ctx = context(Arc::clone(&mock), &["def"]);
        let (tx, rx) = watch::channel(true);
        drop(tx);

        let result = run_pipeline(
            ctx,
            vm_spec("def", AgentKind::Defender),
            sample(),
            Duration::from_secs(30),
            rx,
        )
        .await;

        assert_eq!(result.error_kind, Some(ErrorKind::Cancelled));
        assert_eq!(result.phase, Phase::Restoring);
        assert!(!mock.ops_for("def").iter().any(|op| op == "power_on"));
    }

    #[tokio::test]
    async fn behavioral_events_flow_into_the_result() {
        let mock = Arc::new(MockVmController::new().with_vm("beh"));
        let now_ms = Local::now().timestamp_millis();
        mock.script_exec(
            "beh",
            "Get-WinEvent",
            GuestExecOutput {
                exit_code: 0,
                stdout: format!(
                    r#"[{{"Id":1,"TimeCreated":"/Date({})/","Message":"Process Create:\nProcessId: 4321\nImage: C:\\x.exe"}}]"#,
                    now_ms
                ),
                stderr: String::new(),
            },
        );
        let ctx = context(Arc::clone(&mock), &["beh"]);
        let (_cancel, cancel_rx) = watch::channel(false);

        let result = run_pipeline(
            ctx,
            vm_spec("beh", AgentKind::BehavioralMonitor),
            sample(),
            Duration::from_secs(30),
            cancel_rx,
        )
        .await;

        assert!(result.error_kind.is_none(), "{:?}", result.error_detail);
        assert_eq!(result.events.len(), 1);
        assert!(result.alerts.is_empty());
        assert!(!result.detected());
    }
}
