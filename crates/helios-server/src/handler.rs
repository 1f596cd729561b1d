//! HTTP and WebSocket handlers.

use crate::server::AppState;
use axum::{
    extract::{
        ws::{CloseFrame, Message as WsMessage, WebSocket, WebSocketUpgrade},
        ConnectInfo, Query, State,
    },
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use futures::{SinkExt, StreamExt};
use helios_core::{ChannelTransport, Frame, Handshake, Helios, ProtocolConfig, Transport};
use serde::Deserialize;
use serde_json::json;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{debug, error, warn};

/// Query string accepted on the WebSocket endpoint.
#[derive(Debug, Default, Deserialize)]
pub struct ConnectParams {
    /// Recovery token from a previous session.
    #[serde(default)]
    pub recover: Option<String>,
}

/// Health check endpoint.
pub async fn handle_health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "protocol": ProtocolConfig::PROTOCOL_NAME,
        "version": ProtocolConfig::PROTOCOL_VERSION,
        "starlings": state.helios.starlings().len(),
        "uptimeSecs": state.started_at.elapsed().as_secs(),
    }))
}

/// Connected starlings, for diagnostics.
pub async fn handle_starlings(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(json!({
        "starlings": state.helios.starlings().describe(),
        "methods": state.helios.methods().names(),
    }))
}

/// Whether the client offered the Helios subprotocol.
pub(crate) fn offers_protocol(headers: &HeaderMap) -> bool {
    headers
        .get_all(header::SEC_WEBSOCKET_PROTOCOL)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .any(|protocol| protocol.trim() == ProtocolConfig::PROTOCOL_NAME)
}

/// WebSocket upgrade endpoint.
pub async fn handle_ws(
    State(state): State<Arc<AppState>>,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
    Query(params): Query<ConnectParams>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    if !offers_protocol(&headers) {
        warn!("Rejected connection without the {} subprotocol", ProtocolConfig::PROTOCOL_NAME);
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({
                "error": format!("subprotocol '{}' required", ProtocolConfig::PROTOCOL_NAME),
            })),
        )
            .into_response();
    }

    let handshake = Handshake {
        recover: params.recover,
        remote_addr: Some(remote.to_string()),
    };
    let helios = state.helios.clone();

    ws.protocols([ProtocolConfig::PROTOCOL_NAME])
        .on_upgrade(move |socket| serve_socket(socket, helios, handshake))
}

/// Pump one socket through the engine until either side closes it.
async fn serve_socket(socket: WebSocket, helios: Helios, handshake: Handshake) {
    let (mut sink, mut stream) = socket.split();
    let (transport, mut outgoing) = ChannelTransport::new();
    let handle = transport.handle();
    let mut close_signal = transport.close_signal();

    let starling = helios.on_open(Arc::new(transport), &handshake);
    debug!("Socket {} serving starling {}", handle, starling.id());
    drop(starling);

    let writer = tokio::spawn(async move {
        loop {
            tokio::select! {
                frame = outgoing.recv() => {
                    let Some(frame) = frame else { break };
                    let message = match frame {
                        Frame::Text(text) => WsMessage::Text(text),
                        Frame::Binary(bytes) => WsMessage::Binary(bytes),
                    };
                    if let Err(e) = sink.send(message).await {
                        debug!("Write to {} failed: {}", handle, e);
                        break;
                    }
                }
                closed = async { close_signal.wait_for(Option::is_some).await.map(|r| r.clone()) } => {
                    let reason = match closed {
                        Ok(reason) => reason,
                        Err(_) => None,
                    };
                    let frame = reason.map(|reason| CloseFrame {
                        code: reason.code,
                        reason: reason.reason.into(),
                    });
                    let _ = sink.send(WsMessage::Close(frame)).await;
                    break;
                }
            }
        }
    });

    let mut code = 1005;
    let mut reason = String::new();

    while let Some(received) = stream.next().await {
        let frame = match received {
            Ok(WsMessage::Text(text)) => Frame::Text(text),
            Ok(WsMessage::Binary(bytes)) => Frame::Binary(bytes),
            Ok(WsMessage::Close(frame)) => {
                if let Some(frame) = frame {
                    code = frame.code;
                    reason = frame.reason.into_owned();
                }
                break;
            }
            Ok(WsMessage::Ping(_)) | Ok(WsMessage::Pong(_)) => continue,
            Err(e) => {
                error!("Socket {} error: {}", handle, e);
                helios.on_error(handle, &e.to_string());
                code = 1006;
                break;
            }
        };

        if let Err(e) = helios.on_message(handle, frame) {
            debug!("Dropping socket {}: {}", handle, e);
            break;
        }
    }

    helios.on_close(handle, code, &reason);
    writer.abort();
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn test_offers_protocol_accepts_listed_protocol() {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::SEC_WEBSOCKET_PROTOCOL,
            HeaderValue::from_static("chat, helios-starling"),
        );
        assert!(offers_protocol(&headers));
    }

    #[test]
    fn test_offers_protocol_rejects_missing_protocol() {
        let mut headers = HeaderMap::new();
        assert!(!offers_protocol(&headers));

        headers.insert(
            header::SEC_WEBSOCKET_PROTOCOL,
            HeaderValue::from_static("helios"),
        );
        assert!(!offers_protocol(&headers));
    }
}
