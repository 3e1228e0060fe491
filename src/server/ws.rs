//! WebSocket façade.
//!
//! The same events as the HTTP façade, pushed over a single persistent
//! connection as tagged JSON messages. The client answers with
//! `{"command": "isGood" | "isBad" | "isBroken" | "done", "systemIndex": …}`.

use std::sync::Arc;

use axum::{
    Router,
    extract::{
        State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    response::IntoResponse,
    routing::get,
};
use futures_util::{SinkExt, StreamExt, stream::SplitSink, stream::SplitStream};
use serde::{Deserialize, Serialize};

use super::{FacadeState, RunningSystemResponse};
use crate::job::OffendingCommit;

pub(crate) fn router(state: Arc<FacadeState>) -> Router {
    Router::new().route("/", get(ws_handler)).with_state(state)
}

/// Messages pushed to the judge.
#[derive(Debug, Serialize)]
#[serde(tag = "type", content = "data", rename_all_fields = "camelCase")]
enum ServerMessage {
    RunningSystem(RunningSystemResponse),
    OffendingCommit(OffendingCommit),
    /// Verdict accepted.
    Ack { system_index: String },
    /// Verdict for an id this server does not know.
    UnknownSystem { system_index: String },
}

/// A verdict sent by the judge.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ClientCommand {
    command: String,
    system_index: String,
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<FacadeState>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: Arc<FacadeState>) {
    let (sender, receiver) = socket.split();
    run_socket_loop(sender, receiver, state).await;
}

/// Forward job events to the client and dispatch its verdicts until the
/// connection drops or the job's channels close.
async fn run_socket_loop(
    mut sender: SplitSink<WebSocket, Message>,
    mut receiver: SplitStream<WebSocket>,
    state: Arc<FacadeState>,
) {
    let mut rs_rx = state.rs_rx.lock().await;
    let mut oc_rx = state.oc_rx.lock().await;

    let mut rs_open = true;
    let mut oc_open = true;
    loop {
        tokio::select! {
            system = rs_rx.recv(), if rs_open => match system {
                Some(system) => {
                    let response = state.register(system);
                    if send_message(&mut sender, &ServerMessage::RunningSystem(response))
                        .await
                        .is_err()
                    {
                        break;
                    }
                }
                None => rs_open = false,
            },

            commit = oc_rx.recv(), if oc_open => match commit {
                Some(commit) => {
                    if send_message(&mut sender, &ServerMessage::OffendingCommit(commit))
                        .await
                        .is_err()
                    {
                        break;
                    }
                }
                None => oc_open = false,
            },

            message = receiver.next() => {
                match message {
                    Some(Ok(Message::Text(text))) => {
                        if let Some(reply) = handle_command(&state, &text) {
                            if send_message(&mut sender, &reply).await.is_err() {
                                break;
                            }
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {
                        // Ignore pings, pongs and binary frames.
                    }
                    Some(Err(_)) => break,
                }
            }
        }

        if !rs_open && !oc_open {
            // Job finished; nothing further will be pushed.
            break;
        }
    }

    let _ = sender.send(Message::Close(None)).await;
}

async fn send_message(
    sender: &mut SplitSink<WebSocket, Message>,
    message: &ServerMessage,
) -> Result<(), axum::Error> {
    match serde_json::to_string(message) {
        Ok(json) => sender.send(Message::Text(json)).await,
        Err(e) => {
            eprintln!("[server] failed to serialize message: {}", e);
            Ok(())
        }
    }
}

fn handle_command(state: &FacadeState, text: &str) -> Option<ServerMessage> {
    let command: ClientCommand = match serde_json::from_str(text) {
        Ok(command) => command,
        Err(e) => {
            eprintln!("[server] unparseable client message: {}", e);
            return None;
        }
    };

    let found = match command.command.as_str() {
        "isGood" => state.dispatch(&command.system_index, |system| system.is_good()),
        "isBad" => state.dispatch(&command.system_index, |system| system.is_bad()),
        "isBroken" => state.dispatch(&command.system_index, |system| system.is_broken()),
        "done" => state.dispatch(&command.system_index, |system| system.done()),
        other => {
            eprintln!("[server] unknown command {:?}", other);
            false
        }
    };

    Some(if found {
        ServerMessage::Ack { system_index: command.system_index }
    } else {
        ServerMessage::UnknownSystem { system_index: command.system_index }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::RunningSystem;
    use tokio::sync::mpsc;

    fn state() -> Arc<FacadeState> {
        let (_rs_tx, rs_rx) = mpsc::channel(1);
        let (_oc_tx, oc_rx) = mpsc::channel(1);
        Arc::new(FacadeState::new(rs_rx, oc_rx))
    }

    #[test]
    fn command_dispatches_verdict() {
        let state = state();
        let (system, mut verdict_rx) = RunningSystem::new(Some(0), 2, Default::default());
        let response = state.register(system);

        let text = format!(r#"{{"command":"isBad","systemIndex":"{}"}}"#, response.system_index);
        let reply = handle_command(&state, &text).unwrap();
        assert!(matches!(reply, ServerMessage::Ack { .. }));
        assert!(verdict_rx.try_recv().is_ok());
    }

    #[test]
    fn unknown_id_yields_unknown_system() {
        let state = state();
        let text = r#"{"command":"isGood","systemIndex":"nope"}"#;
        let reply = handle_command(&state, text).unwrap();
        assert!(matches!(reply, ServerMessage::UnknownSystem { .. }));
    }

    #[test]
    fn garbage_and_unknown_commands_are_tolerated() {
        let state = state();
        assert!(handle_command(&state, "not json").is_none());

        let reply =
            handle_command(&state, r#"{"command":"frobnicate","systemIndex":"x"}"#).unwrap();
        assert!(matches!(reply, ServerMessage::UnknownSystem { .. }));
    }

    #[test]
    fn server_messages_are_tagged() {
        let message = ServerMessage::Ack { system_index: "abc".into() };
        let json = serde_json::to_string(&message).unwrap();
        assert!(json.contains("\"type\":\"Ack\""));
        assert!(json.contains("\"systemIndex\":\"abc\""));
    }
}
