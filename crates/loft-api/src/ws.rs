use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Extension, State};
use axum::response::Response;
use chrono::Utc;
use loft_core::Caller;
use loft_notifier::{ClientAction, ClientCommand, ServerMessage};
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, warn};

use crate::auth::Principal;
use crate::state::AppState;

/// Upgrade to the persistent event connection. The middleware already
/// refused anything without a verified principal, so every socket here has
/// an owner attached.
pub async fn event_socket(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
) -> Response {
    ws.on_upgrade(move |socket| drive_session(socket, state, principal))
}

async fn drive_session(mut socket: WebSocket, state: AppState, principal: Principal) {
    let notifier = state.notifier().clone();
    let mut handle = notifier.connect(principal.0.clone());
    let session_id = handle.id;
    let caller = Caller::User(principal.0);

    loop {
        tokio::select! {
            outbound = handle.receiver.recv() => {
                match outbound {
                    Ok(message) => {
                        let Ok(text) = serde_json::to_string(&message) else { continue };
                        if socket.send(Message::Text(text)).await.is_err() {
                            // the write failed; the session is gone
                            break;
                        }
                    }
                    Err(RecvError::Lagged(n)) => {
                        notifier.record_lag(session_id, n);
                        debug!(session = %session_id, lagged = n, "slow event consumer");
                    }
                    Err(RecvError::Closed) => break,
                }
            }
            inbound = socket.recv() => {
                match inbound {
                    Some(Ok(Message::Text(text))) => {
                        handle_command(&state, &notifier, session_id, &caller, &text).await;
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {} // binary/ping frames are ignored
                    Some(Err(e)) => {
                        warn!(session = %session_id, error = %e, "socket receive error");
                        break;
                    }
                }
            }
        }
    }

    notifier.disconnect(session_id);
}

async fn handle_command(
    state: &AppState,
    notifier: &loft_notifier::Notifier,
    session_id: loft_notifier::SessionId,
    caller: &Caller,
    text: &str,
) {
    let command: ClientCommand = match serde_json::from_str(text) {
        Ok(command) => command,
        Err(e) => {
            notifier.send_to(
                session_id,
                ServerMessage::Error {
                    message: format!("unrecognized command: {e}"),
                    timestamp: Utc::now(),
                },
            );
            return;
        }
    };

    match (command.action, command.project_id) {
        (ClientAction::Ping, _) => {
            notifier.send_to(session_id, ServerMessage::Pong { timestamp: Utc::now() });
        }
        (ClientAction::Subscribe, Some(env_id)) => {
            // only owners may watch an environment's events
            match state.orchestrator.get_environment(caller, env_id).await {
                Ok(_) => {
                    notifier.subscribe(session_id, env_id);
                    state.orchestrator.record_access(env_id).await;
                    notifier.send_to(
                        session_id,
                        ServerMessage::Subscribed { project_id: env_id, timestamp: Utc::now() },
                    );
                }
                Err(e) => {
                    notifier.send_to(
                        session_id,
                        ServerMessage::Error { message: e.to_string(), timestamp: Utc::now() },
                    );
                }
            }
        }
        (ClientAction::Unsubscribe, Some(env_id)) => {
            notifier.unsubscribe(session_id, env_id);
            notifier.send_to(
                session_id,
                ServerMessage::Unsubscribed { project_id: env_id, timestamp: Utc::now() },
            );
        }
        (_, None) => {
            notifier.send_to(
                session_id,
                ServerMessage::Error {
                    message: "projectId required".into(),
                    timestamp: Utc::now(),
                },
            );
        }
    }
}
