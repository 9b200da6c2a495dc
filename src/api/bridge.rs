//! Full-duplex WebSocket relay between a browser and a session backend.
//!
//! The downstream handshake has already completed when [`run`] is called. The
//! bridge then dials `ws://localhost:<port><path>` and pumps frames in both
//! directions with one task per direction. Either task finishing cancels the
//! other through a shared [`CancellationToken`]; a server shutdown cancels
//! both.

use axum::extract::ws::{close_code, CloseFrame, Message, WebSocket};
use axum::http::{header, HeaderMap, Uri};
use futures::{SinkExt, StreamExt};
use tokio_tungstenite::tungstenite::{
    self,
    client::IntoClientRequest,
    handshake::client::Request as ClientRequest,
    protocol::frame::coding::CloseCode,
};
use tokio_util::sync::CancellationToken;

/// Request headers copied from the downstream upgrade to the upstream one.
pub const CAPTURE_CONNECT_HEADERS: [&str; 3] = ["sec-websocket-extensions", "sec-websocket-key", "origin"];

/// True for `Connection: upgrade` + `Upgrade: websocket` requests.
pub fn is_upgrade_request(headers: &HeaderMap) -> bool {
    let connection_upgrade = headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .any(|token| token.trim().eq_ignore_ascii_case("upgrade"));
    let upgrade_websocket = headers
        .get(header::UPGRADE)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.eq_ignore_ascii_case("websocket"))
        .unwrap_or(false);
    connection_upgrade && upgrade_websocket
}

/// `ws://localhost:<port>` followed by the downstream path and query.
pub fn upstream_ws_url(uri: &Uri, port: u16) -> String {
    let path_and_query = uri.path_and_query().map(|pq| pq.as_str()).unwrap_or("/");
    format!("ws://localhost:{port}{path_and_query}")
}

/// Build the upstream handshake request, carrying over the allow-listed
/// headers. The client's key replaces the generated one when present.
pub fn upstream_request(
    uri: &Uri,
    headers: &HeaderMap,
    port: u16,
) -> Result<ClientRequest, tungstenite::Error> {
    let mut request = upstream_ws_url(uri, port).into_client_request()?;
    let upstream_headers = request.headers_mut();
    for name in CAPTURE_CONNECT_HEADERS {
        if let Some(value) = headers.get(name) {
            upstream_headers.insert(name, value.clone());
        }
    }
    Ok(request)
}

fn to_upstream(msg: Message) -> Option<tungstenite::Message> {
    match msg {
        Message::Text(text) => Some(tungstenite::Message::Text(text.as_str().into())),
        Message::Binary(data) => Some(tungstenite::Message::Binary(data)),
        Message::Close(frame) => Some(tungstenite::Message::Close(frame.map(|f| {
            tungstenite::protocol::CloseFrame {
                code: CloseCode::from(f.code),
                reason: f.reason.as_str().into(),
            }
        }))),
        // Both ends answer pings themselves.
        Message::Ping(_) | Message::Pong(_) => None,
    }
}

fn to_downstream(msg: tungstenite::Message) -> Option<Message> {
    match msg {
        tungstenite::Message::Text(text) => Some(Message::Text(text.as_str().into())),
        tungstenite::Message::Binary(data) => Some(Message::Binary(data)),
        tungstenite::Message::Close(frame) => Some(Message::Close(frame.map(|f| CloseFrame {
            code: u16::from(f.code),
            reason: f.reason.as_str().into(),
        }))),
        tungstenite::Message::Ping(_)
        | tungstenite::Message::Pong(_)
        | tungstenite::Message::Frame(_) => None,
    }
}

/// Relay `socket` to the backend described by `request` until either side
/// closes or `shutdown` is cancelled.
pub async fn run(mut socket: WebSocket, request: ClientRequest, shutdown: CancellationToken) {
    let url = request.uri().to_string();
    let upstream = match tokio_tungstenite::connect_async(request).await {
        Ok((upstream, _)) => upstream,
        Err(e) => {
            tracing::warn!(%url, error = %e, "could not connect to upstream websocket");
            let close_frame = CloseFrame {
                code: close_code::ERROR,
                reason: "could not connect to notebook".into(),
            };
            let _ = socket.send(Message::Close(Some(close_frame))).await;
            return;
        }
    };
    tracing::debug!(%url, "websocket bridge open");

    let (mut up_tx, mut up_rx) = upstream.split();
    let (mut down_tx, mut down_rx) = socket.split();
    let cancel = shutdown.child_token();

    let downstream_cancel = cancel.clone();
    let client_to_backend = tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = downstream_cancel.cancelled() => break,
                msg = down_rx.next() => match msg {
                    Some(Ok(msg)) => {
                        let closing = matches!(msg, Message::Close(_));
                        if let Some(msg) = to_upstream(msg) {
                            if up_tx.send(msg).await.is_err() {
                                break;
                            }
                        }
                        if closing {
                            break;
                        }
                    }
                    Some(Err(e)) => {
                        tracing::debug!(error = %e, "downstream websocket error");
                        break;
                    }
                    None => break,
                },
            }
        }
        let _ = up_tx.close().await;
        downstream_cancel.cancel();
    });

    let upstream_cancel = cancel.clone();
    let server_shutdown = shutdown.clone();
    let backend_to_client = tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = upstream_cancel.cancelled() => break,
                msg = up_rx.next() => match msg {
                    Some(Ok(msg)) => {
                        let closing = msg.is_close();
                        if let Some(msg) = to_downstream(msg) {
                            if down_tx.send(msg).await.is_err() {
                                break;
                            }
                        }
                        if closing {
                            break;
                        }
                    }
                    Some(Err(e)) => {
                        tracing::debug!(error = %e, "upstream websocket error");
                        break;
                    }
                    None => break,
                },
            }
        }
        if server_shutdown.is_cancelled() {
            let close_frame = CloseFrame {
                code: close_code::AWAY,
                reason: "server shutting down".into(),
            };
            let _ = down_tx.send(Message::Close(Some(close_frame))).await;
        }
        let _ = down_tx.close().await;
        upstream_cancel.cancel();
    });

    let _ = tokio::join!(client_to_backend, backend_to_client);
    tracing::debug!(%url, "websocket bridge closed");
}
