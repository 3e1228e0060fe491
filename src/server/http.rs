//! HTTP façade.
//!
//! `GET /system` blocks until the job emits either a system ready to be
//! judged or an offending commit. Verdicts come back through
//! `POST /isGood/{id}`, `/isBad/{id}`, `/isBroken/{id}` and `/done/{id}`:
//! 200 when the id is known, 404 otherwise.

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};

use super::FacadeState;

pub(crate) fn router(state: Arc<FacadeState>) -> Router {
    Router::new()
        .route("/system", get(get_system))
        .route("/isGood/:id", post(post_is_good))
        .route("/isBad/:id", post(post_is_bad))
        .route("/isBroken/:id", post(post_is_broken))
        .route("/done/:id", post(post_done))
        .with_state(state)
}

/// Block until one of the two channels yields. 410 once both are closed,
/// i.e. every replica has converged or the job was stopped.
async fn get_system(State(state): State<Arc<FacadeState>>) -> Response {
    let mut rs_rx = state.rs_rx.lock().await;
    let mut oc_rx = state.oc_rx.lock().await;

    let mut rs_open = true;
    let mut oc_open = true;
    loop {
        tokio::select! {
            system = rs_rx.recv(), if rs_open => match system {
                Some(system) => {
                    let response = state.register(system);
                    return Json(response).into_response();
                }
                None => rs_open = false,
            },
            commit = oc_rx.recv(), if oc_open => match commit {
                Some(commit) => return Json(commit).into_response(),
                None => oc_open = false,
            },
            else => return StatusCode::GONE.into_response(),
        }
    }
}

async fn post_is_good(State(state): State<Arc<FacadeState>>, Path(id): Path<String>) -> StatusCode {
    verdict_status(state.dispatch(&id, |system| system.is_good()))
}

async fn post_is_bad(State(state): State<Arc<FacadeState>>, Path(id): Path<String>) -> StatusCode {
    verdict_status(state.dispatch(&id, |system| system.is_bad()))
}

async fn post_is_broken(
    State(state): State<Arc<FacadeState>>,
    Path(id): Path<String>,
) -> StatusCode {
    verdict_status(state.dispatch(&id, |system| system.is_broken()))
}

async fn post_done(State(state): State<Arc<FacadeState>>, Path(id): Path<String>) -> StatusCode {
    verdict_status(state.dispatch(&id, |system| system.done()))
}

fn verdict_status(found: bool) -> StatusCode {
    if found { StatusCode::OK } else { StatusCode::NOT_FOUND }
}
