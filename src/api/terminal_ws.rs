//! WebSocket binding for the viewer gateway.

use axum::{
    extract::{
        ws::{rejection::WebSocketUpgradeRejection, CloseFrame, Message, WebSocket, WebSocketUpgrade},
        OriginalUri, State,
    },
    http::HeaderMap,
    response::{IntoResponse, Response},
};
use bytes::Bytes;
use futures::{stream::SplitSink, SinkExt, StreamExt};

use crate::gateway::{close_code, GatewayError};
use crate::session::ViewerFrame;

use super::auth::verify_basic;
use super::error::ApiError;
use super::AppState;

type WsSink = SplitSink<WebSocket, Message>;

/// `GET /api/terminals/{id}` with an upgrade. Auth and lookup failures are
/// reported as close codes after the upgrade, not as HTTP errors.
pub(super) async fn terminal_ws(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    OriginalUri(uri): OriginalUri,
    headers: HeaderMap,
) -> Response {
    let authorized = authorize(&state, &headers);
    let path = uri.path().to_string();
    ws.on_upgrade(move |socket| handle_terminal_socket(socket, state, path, authorized))
}

/// Any other path: upgrades are accepted and closed as invalid, everything
/// else is a plain 404.
pub(super) async fn fallback(
    ws: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
    State(state): State<AppState>,
    OriginalUri(uri): OriginalUri,
    headers: HeaderMap,
) -> Response {
    match ws {
        Ok(ws) => {
            let authorized = authorize(&state, &headers);
            let path = uri.path().to_string();
            ws.on_upgrade(move |socket| handle_terminal_socket(socket, state, path, authorized))
        }
        Err(_) => ApiError::NotFound.into_response(),
    }
}

fn authorize(state: &AppState, headers: &HeaderMap) -> bool {
    state
        .credentials
        .as_deref()
        .map_or(true, |creds| verify_basic(headers, creds).is_ok())
}

async fn close(ws_tx: &mut WsSink, code: u16, reason: &str) {
    let frame = CloseFrame {
        code,
        reason: reason.to_string().into(),
    };
    let _ = ws_tx.send(Message::Close(Some(frame))).await;
    let _ = ws_tx.flush().await;
}

async fn handle_terminal_socket(socket: WebSocket, state: AppState, path: String, authorized: bool) {
    let (_guard, mut shutdown_rx) = state.shutdown.register();
    let (mut ws_tx, mut ws_rx) = socket.split();

    if !authorized {
        let err = GatewayError::Unauthorized;
        close(&mut ws_tx, err.close_code(), &err.to_string()).await;
        return;
    }

    let (conn, mut frames) = match state.gateway.connect(&path) {
        Ok(attached) => attached,
        Err(err) => {
            tracing::debug!(%path, error = %err, "rejecting terminal connection");
            close(&mut ws_tx, err.close_code(), &err.to_string()).await;
            return;
        }
    };

    if *shutdown_rx.borrow() {
        close(&mut ws_tx, close_code::AWAY, "Server shutting down").await;
        state.gateway.disconnect(conn);
        return;
    }

    loop {
        tokio::select! {
            frame = frames.recv() => match frame {
                Some(ViewerFrame::Output(data)) => {
                    if ws_tx.send(Message::Binary(data)).await.is_err() {
                        break;
                    }
                }
                Some(ViewerFrame::Notice(text)) => {
                    if ws_tx.send(Message::Text(text.into())).await.is_err() {
                        break;
                    }
                }
                Some(ViewerFrame::Close(reason)) => {
                    close(&mut ws_tx, reason.code(), reason.reason()).await;
                    break;
                }
                None => {
                    close(&mut ws_tx, close_code::ERROR, "Viewer too slow").await;
                    break;
                }
            },

            msg = ws_rx.next() => match msg {
                Some(Ok(Message::Binary(data))) => {
                    state.gateway.handle_inbound(&conn, data);
                }
                Some(Ok(Message::Text(text))) => {
                    state
                        .gateway
                        .handle_inbound(&conn, Bytes::copy_from_slice(text.as_str().as_bytes()));
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => continue, // Ping/Pong handled automatically
                Some(Err(e)) => {
                    tracing::debug!(session = %conn.session_id(), error = %e, "websocket error");
                    break;
                }
            },

            changed = shutdown_rx.changed() => {
                if changed.is_err() || *shutdown_rx.borrow() {
                    close(&mut ws_tx, close_code::AWAY, "Server shutting down").await;
                    break;
                }
            }
        }
    }

    state.gateway.disconnect(conn);
}
