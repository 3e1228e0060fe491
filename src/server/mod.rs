//! Façade servers that expose a job's two event channels to remote judges.
//!
//! The server type is a closed set: plain HTTP polling or a single
//! persistent WebSocket. Both register emitted [`RunningSystem`]s under
//! fresh opaque ids and dispatch the judge's verdicts back to them.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use serde::Serialize;
use tokio::sync::{Mutex, mpsc};

use crate::job::{OffendingCommit, RunningSystem};

pub mod http;
pub mod ws;

/// Which façade to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerType {
    Http,
    Websocket,
}

/// Shared façade state: the job's two receivers plus the table of systems
/// awaiting a verdict, keyed by opaque id.
pub(crate) struct FacadeState {
    rs_rx: Mutex<mpsc::Receiver<RunningSystem>>,
    oc_rx: Mutex<mpsc::Receiver<OffendingCommit>>,
    systems: std::sync::Mutex<HashMap<String, RunningSystem>>,
}

impl FacadeState {
    pub(crate) fn new(
        rs_rx: mpsc::Receiver<RunningSystem>,
        oc_rx: mpsc::Receiver<OffendingCommit>,
    ) -> Self {
        Self {
            rs_rx: Mutex::new(rs_rx),
            oc_rx: Mutex::new(oc_rx),
            systems: std::sync::Mutex::new(HashMap::new()),
        }
    }

    /// Store a system under a fresh opaque id and return its wire shape.
    pub(crate) fn register(&self, system: RunningSystem) -> RunningSystemResponse {
        let id = uuid::Uuid::new_v4().simple().to_string();
        let response = RunningSystemResponse::new(&id, &system);
        self.systems
            .lock()
            .expect("systems lock poisoned")
            .insert(id, system);
        response
    }

    /// Remove the system with this id and hand it to `apply`. Returns false
    /// for unknown ids.
    pub(crate) fn dispatch(&self, id: &str, apply: impl FnOnce(&RunningSystem)) -> bool {
        let system = self.systems.lock().expect("systems lock poisoned").remove(id);
        match system {
            Some(system) => {
                apply(&system);
                true
            }
            None => false,
        }
    }
}

/// Wire shape of a system awaiting a verdict. The port map is stringified
/// because JSON has no integer keys.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunningSystemResponse {
    pub system_index: String,
    pub replica_index: Option<usize>,
    pub commit_offset: usize,
    pub ports: HashMap<String, String>,
}

impl RunningSystemResponse {
    fn new(id: &str, system: &RunningSystem) -> Self {
        Self {
            system_index: id.to_string(),
            replica_index: system.replica_index,
            commit_offset: system.commit_offset,
            ports: system
                .ports
                .iter()
                .map(|(container, host)| (container.to_string(), host.to_string()))
                .collect(),
        }
    }
}

/// Serve the façade until the process is stopped.
pub async fn serve(
    server_type: ServerType,
    port: u16,
    rs_rx: mpsc::Receiver<RunningSystem>,
    oc_rx: mpsc::Receiver<OffendingCommit>,
) -> Result<()> {
    let state = Arc::new(FacadeState::new(rs_rx, oc_rx));
    let app = match server_type {
        ServerType::Http => http::router(state),
        ServerType::Websocket => ws::router(state),
    };

    let addr = format!("127.0.0.1:{}", port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;
    eprintln!("[server] listening on http://{}", addr);
    axum::serve(listener, app).await.context("Server failed")
}
