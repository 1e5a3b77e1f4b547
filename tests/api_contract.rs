//! HTTP API contract tests.
//!
//! These validate the surface an API client codes against:
//! - `X-API-Key` enforcement
//! - `POST /api/analyze` multipart submission → `{taskId, status: "pending"}`
//! - Task polling reaches a terminal status with per-VM results
//! - Report format stable keys (`perVM`, `summary.detected`, ...)
//! - Boundary behaviors: unknown VM, oversize sample, unknown task id
//! - Cancellation endpoint semantics

use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;

use detonator::config::{AgentKind, AnalysisConfig, Config, ServerConfig, VmRole, VmSpec};
use detonator::controller::mock::MockVmController;
use detonator::orchestrator::Orchestrator;
use detonator::store::ResultStore;

const API_KEY: &str = "test-key";

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

fn test_config(upload_dir: std::path::PathBuf) -> Config {
    Config {
        server: ServerConfig {
            port: 0,
            upload_dir,
            max_file_size: 64 * 1024,
            api_key: API_KEY.into(),
        },
        vbox_manage_path: "VBoxManage".into(),
        vms: vec![
            vm_spec("beh", AgentKind::BehavioralMonitor),
            vm_spec("def", AgentKind::Defender),
        ],
        analysis: AnalysisConfig {
            vm_startup_timeout: 5,
            detonation_dwell: 0,
            monitoring_window: 0,
            collection_grace: 10,
            max_concurrent_tasks: 4,
            queue_size: 16,
            gui_mode: true,
            per_vm_max_seconds: 30,
        },
    }
}

/// Start the API on a random port against the given mock controller.
fn start_server(mock: Arc<MockVmController>) -> SocketAddr {
    let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
    let listener = std::net::TcpListener::bind(addr).unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    std::thread::spawn(move || {
        let rt = tokio::runtime::Runtime::new().unwrap();
        rt.block_on(async {
            let dir = tempfile::tempdir().unwrap();
            let config = test_config(dir.path().to_path_buf());
            let orchestrator = Orchestrator::start(config, mock, ResultStore::new());
            let _ = detonator::server::serve(addr, orchestrator).await;
        });
    });

    for _ in 0..50 {
        if TcpStream::connect_timeout(&addr, Duration::from_millis(50)).is_ok() {
            return addr;
        }
        std::thread::sleep(Duration::from_millis(50));
    }
    panic!("server did not start within timeout");
}

fn raw_request(addr: SocketAddr, request: &[u8]) -> (u16, Value) {
    let mut stream = TcpStream::connect_timeout(&addr, Duration::from_secs(5)).unwrap();
    stream
        .set_read_timeout(Some(Duration::from_secs(5)))
        .unwrap();
    stream.write_all(request).unwrap();

    let mut response = String::new();
    let _ = stream.read_to_string(&mut response);

    let status_code: u16 = response
        .lines()
        .next()
        .and_then(|line| line.split_whitespace().nth(1))
        .and_then(|code| code.parse().ok())
        .unwrap_or(0);
    let body = response.split("\r\n\r\n").nth(1).unwrap_or("{}");
    let json: Value = serde_json::from_str(body).unwrap_or(Value::Null);
    (status_code, json)
}

fn http_get(addr: SocketAddr, path: &str, api_key: Option<&str>) -> (u16, Value) {
    let key_header = api_key
        .map(|k| format!("X-API-Key: {k}\r\n"))
        .unwrap_or_default();
    let request = format!(
        "GET {path} HTTP/1.1\r\nHost: localhost\r\n{key_header}Connection: close\r\n\r\n"
    );
    raw_request(addr, request.as_bytes())
}

fn http_post(addr: SocketAddr, path: &str, api_key: Option<&str>) -> (u16, Value) {
    let key_header = api_key
        .map(|k| format!("X-API-Key: {k}\r\n"))
        .unwrap_or_default();
    let request = format!(
        "POST {path} HTTP/1.1\r\nHost: localhost\r\n{key_header}Content-Length: 0\r\nConnection: close\r\n\r\n"
    );
    raw_request(addr, request.as_bytes())
}

/// Submit a sample through the multipart endpoint.
fn analyze(
    addr: SocketAddr,
    file_name: &str,
    data: &[u8],
    vm_names: Option<&str>,
) -> (u16, Value) {
    const BOUNDARY: &str = "detonator-test-boundary";
    let mut body = Vec::new();
    body.extend_from_slice(format!("--{BOUNDARY}\r\n").as_bytes());
    body.extend_from_slice(
        format!(
            "Content-Disposition: form-data; name=\"file\"; filename=\"{file_name}\"\r\n\r\n"
        )
        .as_bytes(),
    );
    body.extend_from_slice(data);
    body.extend_from_slice(b"\r\n");
    if let Some(vms) = vm_names {
        body.extend_from_slice(format!("--{BOUNDARY}\r\n").as_bytes());
        body.extend_from_slice(b"Content-Disposition: form-data; name=\"vm_names\"\r\n\r\n");
        body.extend_from_slice(vms.as_bytes());
        body.extend_from_slice(b"\r\n");
    }
    body.extend_from_slice(format!("--{BOUNDARY}--\r\n").as_bytes());

    let mut request = Vec::new();
    request.extend_from_slice(
        format!(
            "POST /api/analyze HTTP/1.1\r\nHost: localhost\r\nX-API-Key: {API_KEY}\r\nContent-Type: multipart/form-data; boundary={BOUNDARY}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
            body.len()
        )
        .as_bytes(),
    );
    request.extend_from_slice(&body);
    raw_request(addr, &request)
}

/// Poll the task until it reaches a terminal status.
fn wait_terminal(addr: SocketAddr, task_id: &str) -> Value {
    for _ in 0..100 {
        let (status, task) = http_get(addr, &format!("/api/task/{task_id}"), Some(API_KEY));
        assert_eq!(status, 200, "task poll failed: {task}");
        let state = task["status"].as_str().unwrap_or("");
        if matches!(state, "completed" | "failed" | "cancelled") {
            return task;
        }
        std::thread::sleep(Duration::from_millis(50));
    }
    panic!("task {task_id} never reached a terminal status");
}

// ==========================================================================
// Auth and health
// ==========================================================================

#[test]
fn health_needs_no_auth_and_reports_pool() {
    let mock = Arc::new(MockVmController::new().with_vm("beh").with_vm("def"));
    let addr = start_server(mock);

    let (status, body) = http_get(addr, "/api/health", None);
    assert_eq!(status, 200);
    assert_eq!(body["status"], "ok");
    assert_eq!(body["queueCapacity"], 16);
    assert_eq!(body["pool"].as_array().unwrap().len(), 2);
    assert!(body["queueDepth"].is_number());
}

#[test]
fn missing_api_key_is_unauthorized() {
    let mock = Arc::new(MockVmController::new().with_vm("beh").with_vm("def"));
    let addr = start_server(mock);

    let (status, _) = http_get(addr, "/api/task/whatever", None);
    assert_eq!(status, 401);
    let (status, _) = http_get(addr, "/api/task/whatever", Some("wrong-key"));
    assert_eq!(status, 401);
}

// ==========================================================================
// Submission → report
// ==========================================================================

#[test]
fn analyze_submits_and_completes_with_stable_report_keys() {
    let mock = Arc::new(MockVmController::new().with_vm("beh").with_vm("def"));
    let addr = start_server(mock);

    let (status, body) = analyze(addr, "calc.exe", b"MZ fake binary", None);
    assert_eq!(status, 200, "{body}");
    assert_eq!(body["status"], "pending");
    let task_id = body["taskId"].as_str().unwrap().to_string();

    let task = wait_terminal(addr, &task_id);
    assert_eq!(task["status"], "completed");
    assert_eq!(task["perVMResults"].as_object().unwrap().len(), 2);

    let (status, report) = http_get(addr, &format!("/api/result/{task_id}"), Some(API_KEY));
    assert_eq!(status, 200);
    assert_eq!(report["taskId"], task_id.as_str());
    assert_eq!(report["sample"]["name"], "calc.exe");
    assert!(report["sample"]["hashHex"].is_string());
    assert_eq!(report["sample"]["sizeBytes"], 14);
    assert_eq!(report["perVM"].as_array().unwrap().len(), 2);
    assert_eq!(report["summary"]["detected"], false);
    assert_eq!(report["summary"]["eventCount"], 0);
}

#[test]
fn analyze_with_vm_subset_runs_only_those() {
    let mock = Arc::new(MockVmController::new().with_vm("beh").with_vm("def"));
    let addr = start_server(mock);

    let (status, body) = analyze(addr, "calc.exe", b"MZ", Some("def"));
    assert_eq!(status, 200, "{body}");
    let task_id = body["taskId"].as_str().unwrap().to_string();

    let task = wait_terminal(addr, &task_id);
    let results = task["perVMResults"].as_object().unwrap();
    assert_eq!(results.len(), 1);
    assert!(results.contains_key("def"));
}

#[test]
fn unknown_vm_is_rejected() {
    let mock = Arc::new(MockVmController::new().with_vm("beh").with_vm("def"));
    let addr = start_server(mock);

    let (status, body) = analyze(addr, "calc.exe", b"MZ", Some("ghost"));
    assert_eq!(status, 400);
    assert_eq!(body["errorKind"], "VMUnknown");
}

#[test]
fn oversize_sample_is_rejected() {
    let mock = Arc::new(MockVmController::new().with_vm("beh").with_vm("def"));
    let addr = start_server(mock);

    let blob = vec![0u8; 80 * 1024]; // over the 64 KiB test cap
    let (status, body) = analyze(addr, "big.bin", &blob, None);
    assert_eq!(status, 413);
    assert_eq!(body["errorKind"], "InvalidSample");
}

#[test]
fn agent_deletion_reports_detected() {
    let mock = Arc::new(MockVmController::new().with_vm("beh").with_vm("def"));
    mock.delete_sample_on_upload("def");
    let addr = start_server(mock);

    let (status, body) = analyze(addr, "eicar.com", b"X5O!P%@AP[4\\PZX54(P^)7CC)7}$", Some("def"));
    assert_eq!(status, 200, "{body}");
    let task_id = body["taskId"].as_str().unwrap().to_string();
    wait_terminal(addr, &task_id);

    let (_, report) = http_get(addr, &format!("/api/result/{task_id}"), Some(API_KEY));
    let per_vm = &report["perVM"][0];
    assert_eq!(per_vm["sampleDeletedByAgent"], true);
    assert_eq!(report["summary"]["detected"], true);
}

// ==========================================================================
// Task lookup and cancellation
// ==========================================================================

#[test]
fn unknown_task_is_not_found() {
    let mock = Arc::new(MockVmController::new().with_vm("beh").with_vm("def"));
    let addr = start_server(mock);

    let (status, _) = http_get(
        addr,
        "/api/task/00000000-0000-0000-0000-000000000000",
        Some(API_KEY),
    );
    assert_eq!(status, 404);
    let (status, _) = http_get(addr, "/api/task/not-a-uuid", Some(API_KEY));
    assert_eq!(status, 404);
    let (status, _) = http_get(
        addr,
        "/api/result/00000000-0000-0000-0000-000000000000",
        Some(API_KEY),
    );
    assert_eq!(status, 404);
}

#[test]
fn cancel_is_idempotent_and_terminal() {
    let mock = Arc::new(MockVmController::new().with_vm("beh").with_vm("def"));
    let addr = start_server(mock);

    let (status, body) = analyze(addr, "calc.exe", b"MZ", Some("def"));
    assert_eq!(status, 200, "{body}");
    let task_id = body["taskId"].as_str().unwrap().to_string();

    let (status, cancel) = http_post(addr, &format!("/api/task/{task_id}/cancel"), Some(API_KEY));
    assert_eq!(status, 200);
    assert_eq!(cancel["taskId"], task_id.as_str());

    let task = wait_terminal(addr, &task_id);
    // Either the cancel preempted the run or the run had already finished;
    // both are terminal and a second cancel must still answer 200.
    assert!(matches!(
        task["status"].as_str().unwrap(),
        "cancelled" | "completed"
    ));
    let (status, _) = http_post(addr, &format!("/api/task/{task_id}/cancel"), Some(API_KEY));
    assert_eq!(status, 200);
}
