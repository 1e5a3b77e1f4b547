//! Thin HTTP handler over the orchestrator.
//!
//! Hand-rolled over a tokio `TcpListener`: one connection per request,
//! JSON responses, `Connection: close`. The surface is deliberately small:
//! submit a sample, poll a task, fetch the flattened report, cancel, and a
//! health probe. Everything except `/api/health` requires the configured
//! `X-API-Key`.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::error::ApiError;
use crate::model::{Report, Sample, TaskStatus};
use crate::orchestrator::Orchestrator;
use crate::{Error, Result};

/// Cushion on top of the configured sample cap for multipart framing and
/// headers.
const REQUEST_OVERHEAD: usize = 1024 * 1024;

struct Request {
    method: String,
    path: String,
    headers: HashMap<String, String>,
    body: Vec<u8>,
}

/// One decoded part of a multipart/form-data body.
#[derive(Debug)]
struct MultipartPart {
    name: String,
    filename: Option<String>,
    data: Vec<u8>,
}

pub async fn serve(addr: SocketAddr, orchestrator: Orchestrator) -> Result<()> {
    let listener = TcpListener::bind(addr).await?;
    info!(%addr, "detonator API listening");

    loop {
        let (stream, peer) = listener.accept().await?;
        let orchestrator = orchestrator.clone();
        tokio::spawn(async move {
            if let Err(err) = handle_stream(stream, orchestrator).await {
                warn!(%peer, %err, "connection error");
            }
        });
    }
}

async fn handle_stream(mut stream: TcpStream, orchestrator: Orchestrator) -> Result<()> {
    let limit =
        orchestrator.config().server.max_file_size as usize + REQUEST_OVERHEAD;
    let request = match read_request(&mut stream, limit).await {
        Ok(Some(request)) => request,
        Ok(None) => return Ok(()),
        Err(err) => {
            let (status, payload) = (
                "413 Payload Too Large",
                ApiError::invalid_sample(err.to_string()).to_json(),
            );
            write_response(&mut stream, status, &payload).await?;
            return Ok(());
        }
    };

    let (status, payload) = route_request(&request, &orchestrator).await;
    write_response(&mut stream, &status, &payload).await
}

/// Read one HTTP request: headers, then exactly Content-Length body bytes.
/// Returns Ok(None) on an immediately closed connection and an error when
/// the request exceeds the size limit.
async fn read_request(stream: &mut TcpStream, limit: usize) -> Result<Option<Request>> {
    let mut buf: Vec<u8> = Vec::with_capacity(8 * 1024);
    let mut chunk = [0u8; 16 * 1024];

    let header_end = loop {
        if let Some(pos) = find_subslice(&buf, b"\r\n\r\n") {
            break pos;
        }
        if buf.len() > limit {
            return Err(Error::Server("request exceeds size limit".into()));
        }
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            if buf.is_empty() {
                return Ok(None);
            }
            return Err(Error::Server("connection closed mid-headers".into()));
        }
        buf.extend_from_slice(&chunk[..n]);
    };

    let header_text = String::from_utf8_lossy(&buf[..header_end]).into_owned();
    let mut lines = header_text.lines();
    let request_line = lines.next().unwrap_or("");
    let mut parts = request_line.split_whitespace();
    let method = parts.next().unwrap_or("").to_string();
    let path = parts.next().unwrap_or("").to_string();

    let mut headers = HashMap::new();
    for line in lines {
        if let Some((key, value)) = line.split_once(':') {
            headers.insert(key.trim().to_ascii_lowercase(), value.trim().to_string());
        }
    }

    let content_length: usize = headers
        .get("content-length")
        .and_then(|v| v.parse().ok())
        .unwrap_or(0);
    if content_length > limit {
        return Err(Error::Server("request body exceeds size limit".into()));
    }

    let body_start = header_end + 4;
    let mut body: Vec<u8> = buf[body_start..].to_vec();
    while body.len() < content_length {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Err(Error::Server("connection closed mid-body".into()));
        }
        body.extend_from_slice(&chunk[..n]);
    }
    body.truncate(content_length);

    Ok(Some(Request {
        method,
        path,
        headers,
        body,
    }))
}

async fn write_response(stream: &mut TcpStream, status: &str, payload: &str) -> Result<()> {
    let response = format!(
        "HTTP/1.1 {}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        status,
        payload.len(),
        payload
    );
    stream.write_all(response.as_bytes()).await?;
    Ok(())
}

async fn route_request(request: &Request, orchestrator: &Orchestrator) -> (String, String) {
    let method = request.method.as_str();
    let path = request.path.as_str();

    if method == "GET" && path == "/api/health" {
        return (
            "200 OK".to_string(),
            serde_json::to_string(&orchestrator.health()).unwrap_or_else(|_| "{}".into()),
        );
    }

    // Everything else is authenticated.
    let expected = orchestrator.config().server.api_key.as_str();
    if request.headers.get("x-api-key").map(String::as_str) != Some(expected) {
        return (
            "401 Unauthorized".to_string(),
            serde_json::json!({ "error": "missing or invalid X-API-Key" }).to_string(),
        );
    }

    match (method, path) {
        ("POST", "/api/analyze") => analyze(request, orchestrator).await,
        _ => {
            if let Some(rest) = path.strip_prefix("/api/task/") {
                if let Some(id) = rest.strip_suffix("/cancel") {
                    if method == "POST" {
                        return cancel_task(id, orchestrator);
                    }
                } else if method == "GET" {
                    return get_task(rest, orchestrator);
                }
            }
            if let Some(id) = path.strip_prefix("/api/result/") {
                if method == "GET" {
                    return get_result(id, orchestrator);
                }
            }
            (
                "404 Not Found".to_string(),
                ApiError::internal("route not found").to_json(),
            )
        }
    }
}

/// Keep only the final path component of a client-supplied file name.
fn sanitize_file_name(raw: &str) -> String {
    let name = raw
        .rsplit(['/', '\\'])
        .next()
        .unwrap_or("")
        .trim()
        .to_string();
    if name.is_empty() || name == "." || name == ".." {
        "sample.bin".to_string()
    } else {
        name
    }
}

async fn analyze(request: &Request, orchestrator: &Orchestrator) -> (String, String) {
    let Some(content_type) = request.headers.get("content-type") else {
        return (
            "400 Bad Request".to_string(),
            ApiError::invalid_sample("missing Content-Type").to_json(),
        );
    };

    let parts = match parse_multipart(content_type, &request.body) {
        Ok(parts) => parts,
        Err(err) => {
            return (
                "400 Bad Request".to_string(),
                ApiError::invalid_sample(err.to_string()).to_json(),
            )
        }
    };

    let mut file: Option<&MultipartPart> = None;
    let mut filename_override: Option<String> = None;
    let mut vm_names: Option<Vec<String>> = None;
    let mut timeout: Option<u64> = None;
    for part in &parts {
        match part.name.as_str() {
            "file" => file = Some(part),
            "filename" => {
                filename_override = Some(String::from_utf8_lossy(&part.data).trim().to_string())
            }
            "vm_names" => {
                let raw = String::from_utf8_lossy(&part.data);
                let names: Vec<String> = raw
                    .split(',')
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty())
                    .collect();
                if !names.is_empty() {
                    vm_names = Some(names);
                }
            }
            "timeout" => {
                timeout = String::from_utf8_lossy(&part.data).trim().parse().ok();
            }
            _ => {}
        }
    }

    let Some(file) = file else {
        return (
            "400 Bad Request".to_string(),
            ApiError::invalid_sample("multipart field 'file' is required").to_json(),
        );
    };
    if file.data.is_empty() {
        return (
            "400 Bad Request".to_string(),
            ApiError::invalid_sample("submitted file is empty").to_json(),
        );
    }
    let max = orchestrator.config().server.max_file_size;
    if file.data.len() as u64 > max {
        return (
            "413 Payload Too Large".to_string(),
            ApiError::invalid_sample(format!("file exceeds max_file_size ({} bytes)", max))
                .to_json(),
        );
    }

    let name = sanitize_file_name(
        filename_override
            .as_deref()
            .filter(|s| !s.is_empty())
            .or(file.filename.as_deref())
            .unwrap_or("sample.bin"),
    );

    // Samples land under a fresh directory so identical submissions never
    // alias each other's bytes.
    let sample_id = Uuid::now_v7();
    let dir: PathBuf = orchestrator
        .config()
        .server
        .upload_dir
        .join(sample_id.to_string());
    if let Err(err) = tokio::fs::create_dir_all(&dir).await {
        error!(%err, "failed to create upload directory");
        return (
            "500 Internal Server Error".to_string(),
            ApiError::internal("upload storage unavailable").to_json(),
        );
    }
    let host_path = dir.join(&name);
    if let Err(err) = tokio::fs::write(&host_path, &file.data).await {
        error!(%err, "failed to store sample");
        return (
            "500 Internal Server Error".to_string(),
            ApiError::internal("upload storage unavailable").to_json(),
        );
    }

    let sample = Sample {
        sample_id,
        name,
        path: host_path,
        hash_hex: crate::model::sha256_hex(&file.data),
        size_bytes: file.data.len() as u64,
        received_at: chrono::Local::now(),
    };
    info!(sample = %sample.name, hash = %sample.hash_hex, "sample received");

    match orchestrator.submit(sample, vm_names, timeout) {
        Ok(task_id) => (
            "200 OK".to_string(),
            serde_json::json!({ "taskId": task_id, "status": "pending" }).to_string(),
        ),
        Err(err @ Error::QueueFull(_)) => (
            "503 Service Unavailable".to_string(),
            ApiError::new(err.kind(), err.to_string()).to_json(),
        ),
        Err(err @ Error::UnknownVm(_)) => (
            "400 Bad Request".to_string(),
            ApiError::new(err.kind(), err.to_string()).to_json(),
        ),
        Err(err) => (
            "500 Internal Server Error".to_string(),
            ApiError::internal(err.to_string()).to_json(),
        ),
    }
}

fn parse_task_id(raw: &str) -> Option<Uuid> {
    Uuid::parse_str(raw).ok()
}

fn get_task(id: &str, orchestrator: &Orchestrator) -> (String, String) {
    let Some(task_id) = parse_task_id(id) else {
        return not_found(id);
    };
    match orchestrator.store().get(task_id) {
        Some(task) => (
            "200 OK".to_string(),
            serde_json::to_string(&task).unwrap_or_else(|_| "{}".into()),
        ),
        None => not_found(id),
    }
}

fn get_result(id: &str, orchestrator: &Orchestrator) -> (String, String) {
    let Some(task_id) = parse_task_id(id) else {
        return not_found(id);
    };
    match orchestrator.store().get(task_id) {
        Some(task) => (
            "200 OK".to_string(),
            serde_json::to_string(&Report::from_task(&task)).unwrap_or_else(|_| "{}".into()),
        ),
        None => not_found(id),
    }
}

fn cancel_task(id: &str, orchestrator: &Orchestrator) -> (String, String) {
    let Some(task_id) = parse_task_id(id) else {
        return not_found(id);
    };
    match orchestrator.cancel(task_id) {
        Ok(true) => {
            let status = orchestrator
                .store()
                .get(task_id)
                .map(|t| t.status)
                .unwrap_or(TaskStatus::Cancelled);
            (
                "200 OK".to_string(),
                serde_json::json!({ "taskId": task_id, "status": status }).to_string(),
            )
        }
        Ok(false) => not_found(id),
        Err(err) => (
            "500 Internal Server Error".to_string(),
            ApiError::internal(err.to_string()).to_json(),
        ),
    }
}

fn not_found(id: &str) -> (String, String) {
    (
        "404 Not Found".to_string(),
        serde_json::json!({ "error": format!("task '{}' not found", id) }).to_string(),
    )
}

fn find_subslice(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

/// Minimal multipart/form-data decoder: boundary from the Content-Type,
/// per-part Content-Disposition for the field name and file name.
fn parse_multipart(content_type: &str, body: &[u8]) -> Result<Vec<MultipartPart>> {
    let boundary = content_type
        .split(';')
        .map(str::trim)
        .find_map(|param| param.strip_prefix("boundary="))
        .map(|b| b.trim_matches('"'))
        .ok_or_else(|| Error::Server("multipart boundary missing".into()))?;

    let delimiter = format!("--{}", boundary);
    let delimiter = delimiter.as_bytes();
    // Part data ends at a CRLF followed by the delimiter; matching the bare
    // delimiter would trip on binary payloads.
    let close_delimiter = format!("\r\n--{}", boundary);
    let close_delimiter = close_delimiter.as_bytes();

    let mut parts = Vec::new();
    let mut offset = find_subslice(body, delimiter)
        .ok_or_else(|| Error::Server("multipart body has no boundary".into()))?
        + delimiter.len();

    loop {
        // After each delimiter: "--" closes the stream, CRLF opens a part.
        if body.len() < offset + 2 {
            return Err(Error::Server("multipart body truncated".into()));
        }
        if body[offset..].starts_with(b"--") {
            break;
        }
        let part_start = offset + 2; // skip CRLF
        let rest = &body[part_start..];
        let Some(header_end) = find_subslice(rest, b"\r\n\r\n") else {
            return Err(Error::Server("multipart part missing header block".into()));
        };
        let header_text = String::from_utf8_lossy(&rest[..header_end]);

        let mut name = String::new();
        let mut filename = None;
        for line in header_text.lines() {
            if line.to_ascii_lowercase().starts_with("content-disposition:") {
                for param in line.split(';').map(str::trim) {
                    if let Some(value) = param.strip_prefix("name=") {
                        name = value.trim_matches('"').to_string();
                    }
                    if let Some(value) = param.strip_prefix("filename=") {
                        let value = value.trim_matches('"');
                        if !value.is_empty() {
                            filename = Some(value.to_string());
                        }
                    }
                }
            }
        }

        let data_start = header_end + 4;
        let Some(data_len) = find_subslice(&rest[data_start..], close_delimiter) else {
            return Err(Error::Server("multipart part not terminated".into()));
        };
        let data = rest[data_start..data_start + data_len].to_vec();

        parts.push(MultipartPart {
            name,
            filename,
            data,
        });

        offset = part_start + data_start + data_len + close_delimiter.len();
    }

    Ok(parts)
}
