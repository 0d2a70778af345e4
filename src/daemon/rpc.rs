//! Local RPC between CLI processes and the daemon
//!
//! A unix socket in the `.braid` directory carries length-prefixed JSON
//! envelopes: a 4-byte big-endian payload length, then one JSON object.
//! Requests are tagged by `op`; responses always carry `success` and either
//! `data` or `error`. Reads and writes are bounded by a 5 second timeout.

use std::io::{Read, Write};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::Sender;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use super::DaemonEvent;
use crate::domain::{Issue, IssueId, IssueType, Status};
use crate::storage::SearchFilter;
use crate::sync::SyncEngine;

/// Socket read/write budget
pub const RPC_TIMEOUT: Duration = Duration::from_secs(5);

/// Upper bound for one envelope; a larger frame is a protocol error
const MAX_FRAME_LEN: u32 = 16 * 1024 * 1024;

/// Operations the daemon accepts from CLI processes
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Request {
    Create {
        title: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        description: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        priority: Option<i64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        issue_type: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        assignee: Option<String>,
    },
    Update {
        id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        title: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        description: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        status: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        priority: Option<i64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        assignee: Option<String>,
    },
    Close {
        id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
    List {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        issue_type: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        exclude_status: Option<String>,
        #[serde(default)]
        include_tombstones: bool,
        /// Restrict to issues whose blocking dependencies are all resolved
        #[serde(default)]
        ready: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        limit: Option<usize>,
    },
    Show {
        id: String,
    },
    Export,
}

/// Envelope sent back for every request
#[derive(Debug, Serialize, Deserialize)]
pub struct Response {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

impl Response {
    fn ok(data: serde_json::Value) -> Self {
        Self {
            success: true,
            error: None,
            data: Some(data),
        }
    }

    fn err(message: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(message.into()),
            data: None,
        }
    }
}

// --- Framing ---

fn write_frame(stream: &mut impl Write, payload: &[u8]) -> Result<()> {
    let len = u32::try_from(payload.len()).context("frame too large")?;
    stream.write_all(&len.to_be_bytes())?;
    stream.write_all(payload)?;
    stream.flush()?;
    Ok(())
}

fn read_frame(stream: &mut impl Read) -> Result<Vec<u8>> {
    let mut len_buf = [0u8; 4];
    stream.read_exact(&mut len_buf).context("read frame length")?;
    let len = u32::from_be_bytes(len_buf);
    if len > MAX_FRAME_LEN {
        anyhow::bail!("frame of {} bytes exceeds the {} byte limit", len, MAX_FRAME_LEN);
    }
    let mut payload = vec![0u8; len as usize];
    stream.read_exact(&mut payload).context("read frame payload")?;
    Ok(payload)
}

// --- Server ---

/// Accept loop; runs until the shutdown flag is set
///
/// Connections are handled inline: the callers are short-lived local CLI
/// processes, one request per connection.
pub fn serve(
    socket_path: &Path,
    engine: Arc<Mutex<SyncEngine>>,
    events: Sender<DaemonEvent>,
    shutdown: Arc<AtomicBool>,
) -> Result<()> {
    // A previous daemon's socket file blocks bind
    if socket_path.exists() {
        std::fs::remove_file(socket_path)
            .with_context(|| format!("Failed to remove stale socket: {}", socket_path.display()))?;
    }

    let listener = UnixListener::bind(socket_path)
        .with_context(|| format!("Failed to bind socket: {}", socket_path.display()))?;
    listener.set_nonblocking(true)?;

    while !shutdown.load(Ordering::SeqCst) {
        match listener.accept() {
            Ok((stream, _addr)) => {
                if let Err(e) = handle_connection(stream, &engine, &events) {
                    eprintln!("warning: rpc connection error: {:#}", e);
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                std::thread::sleep(Duration::from_millis(100));
            }
            Err(e) => return Err(e).context("accept on rpc socket"),
        }
    }

    let _ = std::fs::remove_file(socket_path);
    Ok(())
}

fn handle_connection(
    mut stream: UnixStream,
    engine: &Arc<Mutex<SyncEngine>>,
    events: &Sender<DaemonEvent>,
) -> Result<()> {
    stream.set_read_timeout(Some(RPC_TIMEOUT))?;
    stream.set_write_timeout(Some(RPC_TIMEOUT))?;
    stream.set_nonblocking(false)?;

    let payload = read_frame(&mut stream)?;
    let response = match serde_json::from_slice::<Request>(&payload) {
        Ok(request) => dispatch(engine, events, request),
        Err(e) => Response::err(format!("malformed request: {}", e)),
    };

    let bytes = serde_json::to_vec(&response)?;
    write_frame(&mut stream, &bytes)
}

fn dispatch(
    engine: &Arc<Mutex<SyncEngine>>,
    events: &Sender<DaemonEvent>,
    request: Request,
) -> Response {
    let mut engine = match engine.lock() {
        Ok(engine) => engine,
        Err(_) => return Response::err("engine lock poisoned"),
    };

    match handle_request(&mut engine, request) {
        Ok((data, mutated)) => {
            if mutated {
                let _ = events.send(DaemonEvent::Mutated);
            }
            Response::ok(data)
        }
        Err(e) => Response::err(format!("{:#}", e)),
    }
}

/// Executes one request; returns the payload and whether the index changed
fn handle_request(
    engine: &mut SyncEngine,
    request: Request,
) -> Result<(serde_json::Value, bool)> {
    match request {
        Request::Create {
            title,
            description,
            priority,
            issue_type,
            assignee,
        } => {
            let prefix = engine.config().issue_prefix.clone();
            let now = chrono::Utc::now();
            let mut issue = Issue::new(IssueId::new(&prefix, &title, now), title);
            if let Some(description) = description {
                issue.description = description;
            }
            if let Some(priority) = priority {
                issue.priority = priority;
            }
            if let Some(issue_type) = issue_type {
                issue.issue_type = IssueType::from(issue_type);
            }
            issue.assignee = assignee;

            engine.store().create_issue(&issue)?;
            Ok((serde_json::json!({ "id": issue.id.as_str() }), true))
        }

        Request::Update {
            id,
            title,
            description,
            status,
            priority,
            assignee,
        } => {
            let id: IssueId = id.parse()?;
            let mut issue = engine.store().get_issue(&id)?;
            if let Some(title) = title {
                issue.title = title;
            }
            if let Some(description) = description {
                issue.description = description;
            }
            if let Some(status) = status {
                issue.status = Status::from(status);
            }
            if let Some(priority) = priority {
                issue.priority = priority;
            }
            if let Some(assignee) = assignee {
                issue.assignee = Some(assignee);
            }
            issue.touch();
            engine.store().update_issue(&issue)?;
            Ok((serde_json::json!({ "id": id.as_str() }), true))
        }

        Request::Close { id, reason } => {
            let id: IssueId = id.parse()?;
            engine.store().close_issue(&id, reason.as_deref())?;
            Ok((serde_json::json!({ "id": id.as_str() }), true))
        }

        Request::List {
            issue_type,
            exclude_status,
            include_tombstones,
            ready,
            limit,
        } => {
            if ready {
                let kinds = engine.config().ready_kinds.clone();
                let mut issues = engine.store().ready_issues(&kinds)?;
                if let Some(limit) = limit {
                    issues.truncate(limit);
                }
                return Ok((serde_json::to_value(&issues)?, false));
            }

            let filter = SearchFilter {
                types: issue_type.map(|t| vec![IssueType::from(t)]).unwrap_or_default(),
                exclude_statuses: exclude_status.map(|s| vec![Status::from(s)]).unwrap_or_default(),
                include_tombstones,
                assignee: None,
                limit,
            };
            let issues = engine.store().search(&filter)?;
            Ok((serde_json::to_value(&issues)?, false))
        }

        Request::Show { id } => {
            let id: IssueId = id.parse()?;
            let issue = engine.store().get_issue_full(&id)?;
            Ok((serde_json::to_value(&issue)?, false))
        }

        Request::Export => {
            let outcome = engine.export_only()?;
            Ok((serde_json::json!({ "outcome": format!("{:?}", outcome) }), false))
        }
    }
}

// --- Client ---

/// Client side used by CLI processes
pub struct RpcClient {
    socket_path: PathBuf,
}

impl RpcClient {
    pub fn new(socket_path: impl Into<PathBuf>) -> Self {
        Self {
            socket_path: socket_path.into(),
        }
    }

    /// True if a daemon is listening
    pub fn is_available(&self) -> bool {
        UnixStream::connect(&self.socket_path).is_ok()
    }

    /// Sends one request and waits for the response
    pub fn call(&self, request: &Request) -> Result<Response> {
        let mut stream = UnixStream::connect(&self.socket_path).with_context(|| {
            format!("Failed to connect to daemon at {}", self.socket_path.display())
        })?;
        stream.set_read_timeout(Some(RPC_TIMEOUT))?;
        stream.set_write_timeout(Some(RPC_TIMEOUT))?;

        let payload = serde_json::to_vec(request)?;
        write_frame(&mut stream, &payload)?;
        let response = read_frame(&mut stream)?;
        serde_json::from_slice(&response).context("malformed response from daemon")
    }
}
