//! End-to-end analysis scenarios over the scripted mock controller.
//!
//! Covers the full pipeline lifecycle without a hypervisor: detection and
//! clean verdicts, environment failures with sibling isolation, the
//! power-off ladder on a locked VM, single-VM serialization under load,
//! and cancellation mid-monitoring.

use std::sync::Arc;
use std::time::Duration;

use chrono::Local;
use tokio::sync::watch;

use detonator::config::{AgentKind, AnalysisConfig, Config, ServerConfig, VmRole, VmSpec};
use detonator::controller::mock::MockVmController;
use detonator::controller::{GuestExecOutput, PowerState, VmController};
use detonator::collector::CollectorRegistry;
use detonator::model::{Sample, TaskStatus};
use detonator::orchestrator::Orchestrator;
use detonator::pipeline::{run_pipeline, PipelineContext};
use detonator::pool::VmPool;
use detonator::store::ResultStore;
use detonator::ErrorKind;

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

fn analysis(monitoring_window: u64) -> AnalysisConfig {
    AnalysisConfig {
        vm_startup_timeout: 5,
        detonation_dwell: 0,
        monitoring_window,
        collection_grace: 30,
        max_concurrent_tasks: 10,
        queue_size: 100,
        gui_mode: true,
        per_vm_max_seconds: 60,
    }
}

fn config(vms: Vec<VmSpec>, monitoring_window: u64) -> Config {
    Config {
        server: ServerConfig {
            port: 0,
            upload_dir: std::env::temp_dir().join("detonator-scenarios"),
            max_file_size: 1024 * 1024,
            api_key: "k".into(),
        },
        vbox_manage_path: "VBoxManage".into(),
        vms,
        analysis: analysis(monitoring_window),
    }
}

fn sample(name: &str) -> Sample {
    Sample::new(name, format!("/tmp/{name}"), b"MZ test sample")
}

/// Canned Sysmon query output with one process-create event stamped now.
fn sysmon_events_json() -> String {
    format!(
        r#"[{{"Id":1,"TimeCreated":"/Date({})/","Message":"Process Create:\nProcessId: 4321\nParentProcessId: 600\nImage: C:\\Users\\sandbox\\Desktop\\calc.exe\nCommandLine: calc.exe"}},{{"Id":3,"TimeCreated":"/Date({})/","Message":"Network connection detected:\nProcessId: 4321\nImage: C:\\Users\\sandbox\\Desktop\\calc.exe\nDestinationIp: 192.0.2.7"}}]"#,
        Local::now().timestamp_millis(),
        Local::now().timestamp_millis()
    )
}

/// Canned Defender detection pair (detections + threat metadata).
fn script_defender_detection(mock: &MockVmController, vm: &str) {
    mock.script_exec(
        vm,
        "Get-MpThreatDetection",
        GuestExecOutput {
            exit_code: 0,
            stdout: format!(
                r#"{{"ThreatID":2147519003,"ProcessName":"Unknown","Resources":"file:_C:\\Users\\sandbox\\Desktop\\eicar.com","InitialDetectionTime":"/Date({})/","ActionSuccess":true}}"#,
                Local::now().timestamp_millis()
            ),
            stderr: String::new(),
        },
    );
    mock.script_exec(
        vm,
        "Get-MpThreat ",
        GuestExecOutput {
            exit_code: 0,
            stdout: r#"[{"ThreatID":2147519003,"ThreatName":"Virus:DOS/EICAR_Test_File","SeverityID":5}]"#.into(),
            stderr: String::new(),
        },
    );
}

async fn wait_terminal(orchestrator: &Orchestrator, task_id: uuid::Uuid) -> detonator::model::Task {
    for _ in 0..400 {
        if let Some(task) = orchestrator.store().get(task_id) {
            if task.status.is_terminal() {
                return task;
            }
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    panic!("task did not terminate");
}

// ==========================================================================
// Scenario 1: clean file, two VMs
// ==========================================================================

#[tokio::test]
async fn clean_file_on_two_vms_completes_undetected() {
    let mock = Arc::new(MockVmController::new().with_vm("beh").with_vm("def"));
    mock.script_exec(
        "beh",
        "Get-WinEvent",
        GuestExecOutput {
            exit_code: 0,
            stdout: sysmon_events_json(),
            stderr: String::new(),
        },
    );
    let orchestrator = Orchestrator::start(
        config(
            vec![
                vm_spec("beh", AgentKind::BehavioralMonitor),
                vm_spec("def", AgentKind::Defender),
            ],
            0,
        ),
        Arc::clone(&mock) as Arc<dyn VmController>,
        ResultStore::new(),
    );

    let task_id = orchestrator.submit(sample("calc.exe"), None, None).unwrap();
    let task = wait_terminal(&orchestrator, task_id).await;

    assert_eq!(task.status, TaskStatus::Completed);
    assert_eq!(task.per_vm_results.len(), 2);
    let summary = task.summary.unwrap();
    assert!(!summary.detected);
    assert!(summary.alert_counts.is_empty());
    assert_eq!(summary.event_count, 2);
    assert!(task.per_vm_results["beh"].events.len() > 0);

    for vm in ["beh", "def"] {
        let status = mock.status(vm).await.unwrap();
        assert!(status.power_state.is_off(), "{vm} still on");
    }
}

// ==========================================================================
// Scenario 2: known malware, agent deletes on copy
// ==========================================================================

#[tokio::test]
async fn agent_deleting_sample_reports_detection_without_execution() {
    let mock = Arc::new(MockVmController::new().with_vm("def"));
    mock.delete_sample_on_upload("def");
    script_defender_detection(&mock, "def");
    let orchestrator = Orchestrator::start(
        config(vec![vm_spec("def", AgentKind::Defender)], 0),
        Arc::clone(&mock) as Arc<dyn VmController>,
        ResultStore::new(),
    );

    let task_id = orchestrator
        .submit(sample("eicar.com"), None, None)
        .unwrap();
    let task = wait_terminal(&orchestrator, task_id).await;

    let result = &task.per_vm_results["def"];
    assert!(result.sample_deleted_by_agent);
    assert!(result.error_kind.is_none());
    assert!(result
        .alerts
        .iter()
        .any(|a| matches!(
            a.severity,
            detonator::model::Severity::High | detonator::model::Severity::Critical
        )));
    assert!(task.summary.unwrap().detected);
    // Execution was never attempted: no Start-Process call is recorded
    // because the probe already reported the sample gone.
    assert!(mock
        .ops_for("def")
        .iter()
        .filter(|op| *op == "exec_in_guest")
        .count()
        >= 1);
}

// ==========================================================================
// Scenario 3: VM fails to boot; sibling unaffected
// ==========================================================================

#[tokio::test]
async fn boot_failure_is_isolated_to_its_vm() {
    let mock = Arc::new(MockVmController::new().with_vm("beh").with_vm("def"));
    mock.fail_guest_ready("def");
    let orchestrator = Orchestrator::start(
        config(
            vec![
                vm_spec("beh", AgentKind::BehavioralMonitor),
                vm_spec("def", AgentKind::Defender),
            ],
            0,
        ),
        Arc::clone(&mock) as Arc<dyn VmController>,
        ResultStore::new(),
    );

    let task_id = orchestrator.submit(sample("calc.exe"), None, None).unwrap();
    let task = wait_terminal(&orchestrator, task_id).await;

    assert_eq!(task.status, TaskStatus::Completed);
    let def = &task.per_vm_results["def"];
    assert_eq!(def.error_kind, Some(ErrorKind::EnvironmentFailed));
    assert_eq!(def.phase, detonator::model::Phase::WaitingGuest);
    assert!(task.per_vm_results["beh"].error_kind.is_none());

    let status = mock.status("def").await.unwrap();
    assert!(status.power_state.is_off());
}

// ==========================================================================
// Scenario 4: cleanup unsticks a locked VM
// ==========================================================================

#[tokio::test]
async fn cleanup_ladder_unsticks_a_locked_vm() {
    let mock = Arc::new(MockVmController::new().with_vm("def"));
    // Pre-state: a prior crash left the VM running with a locked session.
    mock.set_power("def", PowerState::Running);
    mock.stuck_session("def");

    let ctx = PipelineContext {
        controller: Arc::clone(&mock) as Arc<dyn VmController>,
        pool: VmPool::new(["def"]),
        collectors: CollectorRegistry::standard(),
        analysis: analysis(0),
    };
    let (_cancel, cancel_rx) = watch::channel(false);
    let started = std::time::Instant::now();
    let result = run_pipeline(
        ctx,
        vm_spec("def", AgentKind::Defender),
        sample("calc.exe"),
        Duration::from_secs(60),
        cancel_rx,
    )
    .await;

    assert!(result.error_kind.is_none(), "{:?}", result.error_detail);
    let ops = mock.ops_for("def");
    let ladder: Vec<&str> = ops
        .iter()
        .filter(|op| op.starts_with("poweroff") || *op == "acpipowerbutton")
        .map(|s| s.as_str())
        .collect();
    assert_eq!(
        &ladder[..3],
        &["poweroff_rejected", "acpipowerbutton", "poweroff_forced"],
        "first cleanup must walk the full ladder"
    );
    let status = mock.status("def").await.unwrap();
    assert!(status.power_state.is_off());
    assert!(started.elapsed() < Duration::from_secs(40));
}

// ==========================================================================
// Scenario 5: 12 tasks, one VM, strict serialization
// ==========================================================================

#[tokio::test]
async fn twelve_tasks_on_one_vm_serialize_and_complete() {
    let mock = Arc::new(MockVmController::new().with_vm("def"));
    let orchestrator = Orchestrator::start(
        config(vec![vm_spec("def", AgentKind::Defender)], 0),
        Arc::clone(&mock) as Arc<dyn VmController>,
        ResultStore::new(),
    );

    let mut task_ids = Vec::new();
    for i in 0..12 {
        let task_id = orchestrator
            .submit(sample(&format!("sample-{i}.exe")), None, None)
            .unwrap();
        task_ids.push(task_id);
        // Space the submissions so arrival order at the pool is the
        // submission order.
        tokio::time::sleep(Duration::from_millis(30)).await;
    }

    let mut completions = Vec::new();
    for task_id in &task_ids {
        let task = wait_terminal(&orchestrator, *task_id).await;
        assert_eq!(task.status, TaskStatus::Completed);
        let result = &task.per_vm_results["def"];
        assert!(result.error_kind.is_none());
        completions.push(result.ended_at.unwrap());
    }

    // Completion order matches submission order: no lease overlap, FIFO
    // hand-off between consecutive pipelines.
    for window in completions.windows(2) {
        assert!(window[0] <= window[1]);
    }
}

// ==========================================================================
// Scenario 6: cancellation during the monitoring window
// ==========================================================================

#[tokio::test]
async fn cancellation_during_dwelling_cleans_up_and_keeps_partial_events() {
    let mock = Arc::new(MockVmController::new().with_vm("beh"));
    mock.script_exec(
        "beh",
        "Get-WinEvent",
        GuestExecOutput {
            exit_code: 0,
            stdout: sysmon_events_json(),
            stderr: String::new(),
        },
    );
    // A long window keeps the pipeline dwelling until the cancel lands.
    let orchestrator = Orchestrator::start(
        config(vec![vm_spec("beh", AgentKind::BehavioralMonitor)], 30),
        Arc::clone(&mock) as Arc<dyn VmController>,
        ResultStore::new(),
    );

    let task_id = orchestrator.submit(sample("calc.exe"), None, None).unwrap();
    // Let the pipeline reach Dwelling (mock phases are instantaneous).
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(orchestrator.cancel(task_id).unwrap());

    let task = wait_terminal(&orchestrator, task_id).await;
    assert_eq!(task.status, TaskStatus::Cancelled);

    let result = &task.per_vm_results["beh"];
    assert_eq!(result.error_kind, Some(ErrorKind::Cancelled));
    // Events observed up to the cancel survive on the result.
    assert_eq!(result.events.len(), 2);

    let status = mock.status("beh").await.unwrap();
    assert!(status.power_state.is_off());
}
