use crate::bridge_logic::config::Config;
use crate::bridge_logic::model::{
    parse_channels, ClientMessage, DevicesParams, HistoryParams, ServerMessage,
};
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path, Query, State,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post, put},
    Json, Router,
};
use futures_util::StreamExt;
use lib_bridge::configs::{AntennaConfig, TakServerConfig};
use lib_bridge::core::FanoutHub;
use lib_bridge::models::Channel;
use lib_bridge::tak::FilterChange;
use lib_bridge::{BridgeError, BridgeHandle};
use serde_json::json;
use std::net::SocketAddr;
use tokio_graceful::ShutdownGuard;
use tracing::{debug, error, info, warn};

pub fn router(handle: BridgeHandle) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/health", get(health_handler))
        .route("/status", get(status_handler))
        .route("/devices", get(devices_handler))
        .route("/devices/{id}/history", get(history_handler))
        .route("/control/reconnect", post(reconnect_handler))
        .route("/control/refresh", post(refresh_handler))
        .route("/tak/connect", post(tak_connect_handler))
        .route("/tak/disconnect", post(tak_disconnect_handler))
        .route("/tak/config", put(tak_config_handler))
        .route("/tak/filter", get(filter_handler).post(filter_change_handler))
        .route("/tak/antenna", get(antenna_handler).put(antenna_change_handler))
        .with_state(handle)
}

pub async fn run(config: Config, handle: BridgeHandle, guard: ShutdownGuard) {
    let bind = config.bind_address.clone().unwrap_or_else(|| "0.0.0.0".to_string());
    let port = config.port.unwrap_or(8092);
    let addr: SocketAddr = match format!("{}:{}", bind, port).parse() {
        Ok(addr) => addr,
        Err(e) => {
            error!(bind = %bind, port, error = %e, "Invalid listen address");
            handle.shutdown();
            return;
        }
    };

    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(e) => {
            error!(%addr, error = %e, "Failed to bind dashboard server");
            handle.shutdown();
            return;
        }
    };
    info!(%addr, "Dashboard server listening");

    let app = router(handle.clone());
    let served = axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            guard.cancelled().await;
            info!("Dashboard server shutting down.");
        })
        .await;
    if let Err(e) = served {
        error!(error = %e, "Dashboard server failed");
    }
    handle.shutdown();
}

async fn ws_handler(ws: WebSocketUpgrade, State(handle): State<BridgeHandle>) -> impl IntoResponse {
    ws.on_upgrade(|socket| handle_socket(socket, handle))
}

async fn health_handler(State(handle): State<BridgeHandle>) -> impl IntoResponse {
    if handle.is_shutdown() {
        (StatusCode::SERVICE_UNAVAILABLE, "STOPPING")
    } else {
        (StatusCode::OK, "OK")
    }
}

fn bridge_error(e: BridgeError) -> Response {
    let status = match e {
        BridgeError::Config(_) => StatusCode::CONFLICT,
        BridgeError::Connection(_) | BridgeError::Timeout(_) => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::BAD_GATEWAY,
    };
    (status, Json(json!({ "error": e.to_string() }))).into_response()
}

/// Like [`bridge_error`], but an invalid change is the caller's fault.
fn rejected_change(e: BridgeError) -> Response {
    match e {
        BridgeError::Config(msg) => {
            (StatusCode::BAD_REQUEST, Json(json!({ "error": msg }))).into_response()
        }
        other => bridge_error(other),
    }
}

async fn status_handler(State(handle): State<BridgeHandle>) -> Response {
    match handle.status().await {
        Ok(status) => Json(status).into_response(),
        Err(e) => bridge_error(e),
    }
}

async fn devices_handler(
    State(handle): State<BridgeHandle>,
    Query(params): Query<DevicesParams>,
) -> Response {
    let query = match params.into_query() {
        Ok(query) => query,
        Err(msg) => return (StatusCode::BAD_REQUEST, Json(json!({ "error": msg }))).into_response(),
    };
    match handle.active_devices(query).await {
        Ok(devices) => Json(devices).into_response(),
        Err(e) => bridge_error(e),
    }
}

async fn history_handler(
    State(handle): State<BridgeHandle>,
    Path(id): Path<String>,
    Query(params): Query<HistoryParams>,
) -> Response {
    match handle.device_history(id, params.limit).await {
        Ok(samples) => Json(samples).into_response(),
        Err(e) => bridge_error(e),
    }
}

async fn reconnect_handler(State(handle): State<BridgeHandle>) -> Response {
    match handle.reconnect().await {
        Ok(()) => Json(json!({ "ok": true })).into_response(),
        Err(e) => bridge_error(e),
    }
}

async fn refresh_handler(State(handle): State<BridgeHandle>) -> Response {
    match handle.force_refresh().await {
        Ok(started) => Json(json!({ "ok": true, "started": started })).into_response(),
        Err(e) => bridge_error(e),
    }
}

async fn tak_connect_handler(State(handle): State<BridgeHandle>) -> Response {
    match handle.tak_connect().await {
        Ok(()) => Json(json!({ "ok": true })).into_response(),
        Err(e) => bridge_error(e),
    }
}

async fn tak_disconnect_handler(State(handle): State<BridgeHandle>) -> Response {
    match handle.tak_disconnect().await {
        Ok(()) => Json(json!({ "ok": true })).into_response(),
        Err(e) => bridge_error(e),
    }
}

async fn tak_config_handler(
    State(handle): State<BridgeHandle>,
    Json(config): Json<TakServerConfig>,
) -> Response {
    match handle.tak_update_config(config).await {
        Ok(()) => Json(json!({ "ok": true })).into_response(),
        Err(e) => bridge_error(e),
    }
}

async fn filter_handler(State(handle): State<BridgeHandle>) -> Response {
    match handle.filter_settings().await {
        Ok(filter) => Json(filter).into_response(),
        Err(e) => bridge_error(e),
    }
}

async fn filter_change_handler(
    State(handle): State<BridgeHandle>,
    Json(change): Json<FilterChange>,
) -> Response {
    info!(?change, "TAK filter change requested");
    match handle.update_filter(change).await {
        Ok(filter) => Json(filter).into_response(),
        Err(e) => rejected_change(e),
    }
}

async fn antenna_handler(State(handle): State<BridgeHandle>) -> Response {
    match handle.antenna_settings().await {
        Ok(settings) => Json(settings).into_response(),
        Err(e) => bridge_error(e),
    }
}

async fn antenna_change_handler(
    State(handle): State<BridgeHandle>,
    Json(antenna): Json<AntennaConfig>,
) -> Response {
    match handle.update_antenna(antenna).await {
        Ok(settings) => Json(settings).into_response(),
        Err(e) => rejected_change(e),
    }
}

async fn send_control(socket: &mut WebSocket, message: &ServerMessage) -> bool {
    match serde_json::to_string(message) {
        Ok(text) => socket.send(Message::Text(text.into())).await.is_ok(),
        Err(e) => {
            warn!(error = %e, "Failed to serialize control message");
            true
        }
    }
}

/// Applies one client control message. Returns the reply to send.
fn apply_client_message(hub: &FanoutHub, client_id: u64, text: &str) -> ServerMessage {
    let msg = match serde_json::from_str::<ClientMessage>(text) {
        Ok(msg) => msg,
        Err(e) => return ServerMessage::error(format!("invalid message: {}", e)),
    };

    let mut unknown = Vec::new();
    if let Some(names) = msg.subscribe {
        let (channels, bad) = parse_channels(&names);
        hub.subscribe(client_id, &channels);
        unknown.extend(bad);
    }
    if let Some(names) = msg.unsubscribe {
        let (channels, bad) = parse_channels(&names);
        hub.unsubscribe(client_id, &channels);
        unknown.extend(bad);
    }

    if unknown.is_empty() {
        ServerMessage::subscriptions(hub.channels_of(client_id))
    } else {
        ServerMessage::error(format!("unknown channels: {}", unknown.join(", ")))
    }
}

async fn handle_socket(mut socket: WebSocket, handle: BridgeHandle) {
    let hub = handle.hub().clone();
    let (client_id, mut frames) = hub.add_client(Vec::<Channel>::new());
    info!(client_id, "Client connected");

    if !send_control(&mut socket, &ServerMessage::welcome(client_id)).await {
        hub.remove_client(client_id);
        return;
    }

    loop {
        tokio::select! {
            _ = handle.stopped() => {
                let _ = socket.send(Message::Close(None)).await;
                break;
            }
            incoming = socket.next() => {
                match incoming {
                    Some(Ok(Message::Text(text))) => {
                        let reply = apply_client_message(&hub, client_id, text.as_str());
                        if !send_control(&mut socket, &reply).await {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        debug!(client_id, error = %e, "WebSocket receive error");
                        break;
                    }
                }
            }
            frame = frames.recv() => {
                let Some(frame) = frame else { break };
                // Frames queued before an unsubscribe are filtered here.
                if !hub.is_subscribed(client_id, frame.channel) {
                    continue;
                }
                if socket.send(Message::Text(frame.body.clone().into())).await.is_err() {
                    break;
                }
            }
        }
    }

    hub.remove_client(client_id);
    info!(client_id, "Client disconnected");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_apply_client_message_updates_membership() {
        let hub = FanoutHub::default();
        let (id, _rx) = hub.add_client(Vec::<Channel>::new());

        let reply = apply_client_message(&hub, id, r#"{"subscribe":["devices","tak"]}"#);
        assert_eq!(reply.r#type, "subscriptions");
        assert!(hub.is_subscribed(id, Channel::Devices));
        assert!(hub.is_subscribed(id, Channel::Tak));

        apply_client_message(&hub, id, r#"{"unsubscribe":["tak"]}"#);
        assert!(!hub.is_subscribed(id, Channel::Tak));
        assert_eq!(hub.channels_of(id), vec![Channel::Devices]);
    }

    #[test]
    fn test_apply_client_message_reports_errors() {
        let hub = FanoutHub::default();
        let (id, _rx) = hub.add_client(Vec::<Channel>::new());

        assert_eq!(apply_client_message(&hub, id, "not json").r#type, "error");
        let reply = apply_client_message(&hub, id, r#"{"subscribe":["alerts","bogus"]}"#);
        assert_eq!(reply.r#type, "error");
        assert!(reply.error.unwrap().contains("bogus"));
        assert!(hub.is_subscribed(id, Channel::Alerts));
    }

    #[test]
    fn test_rejected_changes_map_to_bad_request() {
        let invalid = rejected_change(BridgeError::Config("unknown antenna sensitivity".into()));
        assert_eq!(invalid.status(), StatusCode::BAD_REQUEST);
        let stopped = rejected_change(BridgeError::Connection("bridge is not running".into()));
        assert_eq!(stopped.status(), StatusCode::SERVICE_UNAVAILABLE);
        let disabled = bridge_error(BridgeError::Config("disabled".into()));
        assert_eq!(disabled.status(), StatusCode::CONFLICT);
    }

    #[test]
    fn test_filter_change_bodies_parse() {
        let change: FilterChange =
            serde_json::from_str(r#"{"op":"setColor","key":"Target","argb":-65536}"#).unwrap();
        assert!(matches!(change, FilterChange::SetColor { argb: -65536, .. }));
        assert!(serde_json::from_str::<FilterChange>(r#"{"op":"excludeSsid"}"#).is_err());
    }
}
