//! Connection broker: the long-lived axum server exposing a liveness probe
//! and the single bidirectional message channel. Per-connection mutable
//! state on a websocket becomes an owned record guarded by that connection's
//! own task -- one task per connection owns a `Mutex<Option<AttachedProxy>>`
//! and no field is ever touched off-task.

pub mod messages;

use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;

use axum::Router;
use axum::extract::State;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::response::IntoResponse;
use axum::routing::get;
use futures_util::{SinkExt, StreamExt};
use serde_json::json;
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{debug, warn};

use crate::config::Config;
use crate::db::SessionDatabase;
use crate::errors::AgentboardError;
use crate::model::{AgentSessionPatch, Session, SessionPatch, SessionSource};
use crate::proxy::direct::ProxyEvent;
use crate::proxy::{ProxyVariant, TerminalProxy};
use crate::registry::{RegistryEvent, SessionRegistry};
use crate::tmux;
use crate::validators::{is_valid_session_id, is_valid_tmux_target};
use crate::workers::refresh::RefreshWorker;
use messages::{ClientMessage, KNOWN_CLIENT_TYPES, ServerMessage};

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub registry: Arc<SessionRegistry>,
    pub db: Arc<SessionDatabase>,
    pub refresh: Arc<RefreshWorker>,
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/ws", get(ws_handler))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn healthz() -> impl IntoResponse {
    axum::Json(json!({ "status": "ok", "version": env!("CARGO_PKG_VERSION") }))
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

/// The per-connection terminal attachment, owned entirely by that
/// connection's task: disposal cancels the read loop and closes the child.
struct AttachedProxy {
    session_id: String,
    proxy: Arc<TerminalProxy>,
    forward_task: JoinHandle<()>,
}

impl AttachedProxy {
    fn teardown(self) {
        self.forward_task.abort();
        self.proxy.dispose();
    }
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    let (mut ws_sink, mut ws_stream) = socket.split();
    let (outbox_tx, mut outbox_rx) = mpsc::unbounded_channel::<Message>();

    let writer_task = tokio::spawn(async move {
        while let Some(msg) = outbox_rx.recv().await {
            if ws_sink.send(msg).await.is_err() {
                break;
            }
        }
    });

    let initial = state.registry.get_all();
    let known_ids: Arc<Mutex<HashSet<String>>> =
        Arc::new(Mutex::new(initial.iter().map(|s| s.id.clone()).collect()));
    send(&outbox_tx, &ServerMessage::Sessions { sessions: initial });

    let registry_task = spawn_registry_forward(state.registry.clone(), known_ids, outbox_tx.clone());
    let attached: Mutex<Option<AttachedProxy>> = Mutex::new(None);

    while let Some(Ok(msg)) = ws_stream.next().await {
        let Message::Text(text) = msg else { continue };
        handle_inbound(&text, &state, &outbox_tx, &attached).await;
    }

    if let Some(a) = attached.lock().await.take() {
        a.teardown();
    }
    registry_task.abort();
    writer_task.abort();
}

fn send(outbox: &mpsc::UnboundedSender<Message>, msg: &ServerMessage) {
    if let Ok(text) = serde_json::to_string(msg) {
        let _ = outbox.send(Message::Text(text.into()));
    }
}

/// Subscribes to registry events for the lifetime of one connection,
/// translating them to outgoing messages. The first-seen-id set starts from
/// the initial snapshot sent before this task is spawned, so a
/// `SessionUpdate` for an id already in that snapshot is relabeled
/// `session-update`, never `session-created`.
fn spawn_registry_forward(
    registry: Arc<SessionRegistry>,
    known_ids: Arc<Mutex<HashSet<String>>>,
    outbox: mpsc::UnboundedSender<Message>,
) -> JoinHandle<()> {
    let mut rx = registry.subscribe();
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(RegistryEvent::Sessions(sessions)) => {
                    *known_ids.lock().await = sessions.iter().map(|s| s.id.clone()).collect();
                    send(&outbox, &ServerMessage::Sessions { sessions });
                }
                Ok(RegistryEvent::SessionUpdate(session)) => {
                    let is_new = known_ids.lock().await.insert(session.id.clone());
                    if is_new {
                        send(&outbox, &ServerMessage::SessionCreated { session });
                    } else {
                        send(&outbox, &ServerMessage::SessionUpdate { session });
                    }
                }
                Ok(RegistryEvent::SessionRemoved(session_id)) => {
                    known_ids.lock().await.remove(&session_id);
                    send(&outbox, &ServerMessage::SessionRemoved { session_id });
                }
                Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}

enum DecodeOutcome {
    Unknown,
    Malformed,
}

/// Pure wire decode step, split out from `handle_inbound` so the
/// unknown-type-vs-malformed-json distinction is testable without a live
/// socket: an unknown message type is logged and dropped, while malformed
/// JSON is logged separately.
fn decode_client_message(text: &str) -> Result<ClientMessage, DecodeOutcome> {
    let value: serde_json::Value = serde_json::from_str(text).map_err(|_| DecodeOutcome::Malformed)?;
    let msg_type = value.get("type").and_then(|t| t.as_str()).unwrap_or("");
    if !KNOWN_CLIENT_TYPES.contains(&msg_type) {
        return Err(DecodeOutcome::Unknown);
    }
    serde_json::from_value(value).map_err(|_| DecodeOutcome::Malformed)
}

async fn handle_inbound(
    text: &str,
    state: &AppState,
    outbox: &mpsc::UnboundedSender<Message>,
    attached: &Mutex<Option<AttachedProxy>>,
) {
    let msg = match decode_client_message(text) {
        Ok(msg) => msg,
        Err(DecodeOutcome::Unknown) => {
            debug!("broker: unknown message type, dropping");
            return;
        }
        Err(DecodeOutcome::Malformed) => {
            warn!("broker: malformed json from client, dropping");
            return;
        }
    };

    match msg {
        ClientMessage::TerminalAttach { session_id, cols, rows } => {
            handle_terminal_attach(outbox, attached, session_id, cols, rows).await;
        }
        ClientMessage::TerminalDetach { session_id } => {
            handle_terminal_detach(attached, &session_id).await;
        }
        ClientMessage::TerminalInput { session_id, data } => {
            handle_terminal_input(attached, &session_id, &data).await;
        }
        ClientMessage::TerminalResize { session_id, cols, rows } => {
            handle_terminal_resize(attached, &session_id, cols, rows).await;
        }
        ClientMessage::SessionCreate { project_path, name, command } => {
            handle_session_create(state, outbox, project_path, name, command).await;
        }
        ClientMessage::SessionKill { session_id } => {
            handle_session_kill(state, outbox, &session_id).await;
        }
        ClientMessage::SessionRename { session_id, new_name } => {
            handle_session_rename(state, outbox, &session_id, &new_name).await;
        }
        ClientMessage::SessionPin { session_id, is_pinned } => {
            handle_session_pin(state, outbox, &session_id, is_pinned).await;
        }
        ClientMessage::SessionRefresh => {
            state.refresh.trigger().await;
        }
    }
}

async fn handle_terminal_attach(
    outbox: &mpsc::UnboundedSender<Message>,
    attached: &Mutex<Option<AttachedProxy>>,
    session_id: String,
    cols: Option<u16>,
    rows: Option<u16>,
) {
    if !is_valid_session_id(&session_id) {
        send(outbox, &ServerMessage::Error { message: AgentboardError::InvalidSessionId(session_id).client_message() });
        return;
    }

    if let Some(prev) = attached.lock().await.take() {
        prev.teardown();
    }

    let proxy = TerminalProxy::new(ProxyVariant::Direct);
    match proxy.start(&session_id, cols.unwrap_or(80), rows.unwrap_or(24)).await {
        Ok(()) => {
            send(outbox, &ServerMessage::TerminalReady { session_id: session_id.clone() });
            let forward_task = spawn_output_forward(proxy.clone(), session_id.clone(), outbox.clone());
            *attached.lock().await = Some(AttachedProxy { session_id, proxy, forward_task });
        }
        Err(e) => send(outbox, &ServerMessage::Error { message: e.client_message() }),
    }
}

/// Subscribes only after `start` has resolved, per the contract documented
/// on `TerminalProxy::subscribe`: bytes forwarded before `terminal-ready` are
/// not emitted.
fn spawn_output_forward(
    proxy: Arc<TerminalProxy>,
    session_id: String,
    outbox: mpsc::UnboundedSender<Message>,
) -> JoinHandle<()> {
    let mut rx = proxy.subscribe();
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(ProxyEvent::Output(data)) => {
                    let data = String::from_utf8_lossy(&data).into_owned();
                    send(&outbox, &ServerMessage::TerminalOutput { session_id: session_id.clone(), data });
                }
                Ok(ProxyEvent::Exit) => break,
                Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}

async fn handle_terminal_detach(attached: &Mutex<Option<AttachedProxy>>, session_id: &str) {
    let mut guard = attached.lock().await;
    if guard.as_ref().is_some_and(|a| a.session_id == session_id)
        && let Some(a) = guard.take()
    {
        a.teardown();
    }
}

async fn handle_terminal_input(attached: &Mutex<Option<AttachedProxy>>, session_id: &str, data: &str) {
    let guard = attached.lock().await;
    if let Some(a) = guard.as_ref()
        && a.session_id == session_id
        && let Err(e) = a.proxy.write(data.as_bytes())
    {
        warn!(session_id, error = %e, "broker: terminal input dropped, proxy not ready");
    }
}

async fn handle_terminal_resize(attached: &Mutex<Option<AttachedProxy>>, session_id: &str, cols: u16, rows: u16) {
    let guard = attached.lock().await;
    if let Some(a) = guard.as_ref()
        && a.session_id == session_id
    {
        a.proxy.resize(cols, rows);
    }
}

async fn handle_session_create(
    state: &AppState,
    outbox: &mpsc::UnboundedSender<Message>,
    project_path: String,
    name: Option<String>,
    command: Option<String>,
) {
    let existing: HashSet<String> = state
        .registry
        .get_all()
        .into_iter()
        .filter(|s| s.source == SessionSource::Managed)
        .map(|s| s.name)
        .collect();

    let tmux_session = state.config.tmux_session.clone();
    let result = tokio::task::spawn_blocking(move || {
        tmux::create_window(tmux::CreateWindowParams {
            session: &tmux_session,
            project_path: Path::new(&project_path),
            name: name.as_deref(),
            command: command.as_deref(),
            existing_managed_names: &existing,
        })
    })
    .await
    .expect("session-create task panicked");

    match result {
        Ok(window_name) => match find_session_by_name(state.config.clone(), window_name.clone()).await {
            Some(session) => state.registry.insert(session),
            None => {
                warn!(window_name, "broker: session-create succeeded but window not found on relist");
                send(outbox, &ServerMessage::Error {
                    message: "session created but could not be located".to_string(),
                });
            }
        },
        Err(e) => send(outbox, &ServerMessage::Error { message: e.client_message() }),
    }
}

async fn find_session_by_name(config: Arc<Config>, window_name: String) -> Option<Session> {
    tokio::task::spawn_blocking(move || {
        tmux::list_windows(&config)
            .ok()?
            .into_iter()
            .filter(|s| s.source == SessionSource::Managed && s.name == window_name)
            .max_by(|a, b| a.created_at.cmp(&b.created_at))
    })
    .await
    .ok()
    .flatten()
}

async fn handle_session_kill(state: &AppState, outbox: &mpsc::UnboundedSender<Message>, session_id: &str) {
    if !is_valid_tmux_target(session_id) {
        send(outbox, &ServerMessage::Error {
            message: AgentboardError::InvalidTmuxTarget(session_id.to_string()).client_message(),
        });
        return;
    }
    let target = session_id.to_string();
    let result = tokio::task::spawn_blocking(move || tmux::kill_window(&target))
        .await
        .expect("session-kill task panicked");
    match result {
        Ok(()) => state.refresh.trigger().await,
        Err(e) => send(outbox, &ServerMessage::Error { message: e.client_message() }),
    }
}

async fn handle_session_rename(
    state: &AppState,
    outbox: &mpsc::UnboundedSender<Message>,
    session_id: &str,
    new_name: &str,
) {
    let collision = state
        .registry
        .get_all()
        .into_iter()
        .any(|s| s.source == SessionSource::Managed && s.id != session_id && s.name == new_name);
    if collision {
        send(outbox, &ServerMessage::Error { message: AgentboardError::NameCollision.client_message() });
        return;
    }

    let target = session_id.to_string();
    let name = new_name.to_string();
    let result = tokio::task::spawn_blocking(move || tmux::rename_window(&target, &name))
        .await
        .expect("session-rename task panicked");
    match result {
        Ok(()) => state.registry.update_session(
            session_id,
            SessionPatch { name: Some(new_name.to_string()), ..Default::default() },
        ),
        Err(e) => send(outbox, &ServerMessage::Error { message: e.client_message() }),
    }
}

async fn handle_session_pin(state: &AppState, outbox: &mpsc::UnboundedSender<Message>, session_id: &str, is_pinned: bool) {
    let db = state.db.clone();
    let target = session_id.to_string();
    let result = tokio::task::spawn_blocking(move || -> anyhow::Result<bool> {
        let Some(row) = db.get_session_by_window(&target)? else {
            return Ok(false);
        };
        db.update_session(row.id, AgentSessionPatch { is_pinned: Some(is_pinned), ..Default::default() })?;
        Ok(true)
    })
    .await
    .expect("session-pin task panicked");

    let ok = result.unwrap_or(false);
    send(outbox, &ServerMessage::SessionPinResult { session_id: session_id.to_string(), ok });
}
