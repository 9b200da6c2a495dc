mod common;

use axum::{
    body::{Body, Bytes},
    http::{header, HeaderMap, HeaderName, Method, Request, StatusCode, Uri},
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use common::{create_test_manager, create_test_state, dead_port, fake_running_session, start_gateway, start_server};
use http_body_util::BodyExt;
use nbgate::api::{self, proxy::ReverseProxy, RouterConfig};
use serde_json::{json, Value};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

/// Backend stand-in: echoes what it received as JSON.
async fn echo(method: Method, uri: Uri, headers: HeaderMap, body: Bytes) -> Json<Value> {
    let headers: serde_json::Map<String, Value> = headers
        .iter()
        .map(|(k, v)| (k.to_string(), json!(v.to_str().unwrap_or_default())))
        .collect();
    Json(json!({
        "method": method.as_str(),
        "uri": uri.to_string(),
        "headers": headers,
        "body": String::from_utf8_lossy(&body),
    }))
}

async fn chunked() -> impl IntoResponse {
    let parts = (0..4).map(|i| Ok::<_, std::io::Error>(Bytes::from(format!("part{i};"))));
    (
        [(header::CONTENT_TYPE, "text/x-tea")],
        Body::from_stream(futures::stream::iter(parts)),
    )
}

/// Upstream that answers every connection with one fixed raw HTTP response.
async fn start_raw_backend(response: &'static str) -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        while let Ok((mut stream, _)) = listener.accept().await {
            tokio::spawn(async move {
                let mut request = Vec::new();
                let mut buf = [0u8; 1024];
                while !request.windows(4).any(|w| w == b"\r\n\r\n") {
                    match stream.read(&mut buf).await {
                        Ok(0) | Err(_) => return,
                        Ok(n) => request.extend_from_slice(&buf[..n]),
                    }
                }
                let _ = stream.write_all(response.as_bytes()).await;
                let _ = stream.shutdown().await;
            });
        }
    });
    port
}

/// Send `request` verbatim to `addr` and return everything the server wrote.
async fn raw_exchange(addr: std::net::SocketAddr, request: &str) -> String {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream.write_all(request.as_bytes()).await.unwrap();
    let mut reply = Vec::new();
    tokio::time::timeout(Duration::from_secs(5), stream.read_to_end(&mut reply))
        .await
        .expect("gateway did not close the connection")
        .unwrap();
    String::from_utf8_lossy(&reply).into_owned()
}

async fn start_backend() -> u16 {
    let app = Router::new()
        .route("/session/alice/chunked", get(chunked))
        .fallback(echo);
    start_server(app).await.port()
}

async fn body_json(response: axum::response::Response) -> Value {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}

#[tokio::test]
async fn forwards_method_path_query_and_body() {
    let port = start_backend().await;
    let proxy = ReverseProxy::new();

    let req = Request::builder()
        .method(Method::PUT)
        .uri("/session/alice/api/contents/x.ipynb?type=notebook")
        .header("content-type", "application/json")
        .body(Body::from(r#"{"content": 1}"#))
        .unwrap();
    let response = proxy.forward(req, port).await;
    assert_eq!(response.status(), StatusCode::OK);

    let echoed = body_json(response).await;
    assert_eq!(echoed["method"], "PUT");
    assert_eq!(echoed["uri"], "/session/alice/api/contents/x.ipynb?type=notebook");
    assert_eq!(echoed["body"], r#"{"content": 1}"#);
    assert_eq!(echoed["headers"]["content-type"], "application/json");
    assert_eq!(echoed["headers"]["host"], format!("localhost:{port}"));
}

#[tokio::test]
async fn strips_hop_by_hop_request_headers() {
    let port = start_backend().await;
    let req = Request::builder()
        .uri("/session/alice/")
        .header("proxy-authorization", "Basic secret")
        .header("keep-alive", "timeout=5")
        .header("x-custom", "kept")
        .body(Body::empty())
        .unwrap();
    let echoed = body_json(ReverseProxy::new().forward(req, port).await).await;
    let headers = echoed["headers"].as_object().unwrap();
    assert!(!headers.contains_key("proxy-authorization"));
    assert!(!headers.contains_key("keep-alive"));
    assert_eq!(headers["x-custom"], "kept");
}

#[tokio::test]
async fn chunked_response_is_streamed_without_transfer_encoding() {
    let port = start_backend().await;
    let req = Request::builder()
        .uri("/session/alice/chunked")
        .body(Body::empty())
        .unwrap();
    let response = ReverseProxy::new().forward(req, port).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert!(response.headers().get("transfer-encoding").is_none());
    assert_eq!(response.headers()[header::CONTENT_TYPE], "text/x-tea");

    let body = response.into_body().collect().await.unwrap().to_bytes();
    assert_eq!(&body[..], b"part0;part1;part2;part3;");
}

#[tokio::test]
async fn matrix_parameters_are_restored() {
    let port = start_backend().await;
    let req = Request::builder()
        .uri("/session/alice/files/a%3Bb%3D1")
        .body(Body::empty())
        .unwrap();
    let echoed = body_json(ReverseProxy::new().forward(req, port).await).await;
    assert_eq!(echoed["uri"], "/session/alice/files/a;b=1");
}

#[tokio::test]
async fn lengthless_form_post_is_repaired() {
    let port = start_backend().await;
    let req = Request::builder()
        .method(Method::POST)
        .uri("/session/alice/api/sessions")
        .header("content-type", "application/x-www-form-urlencoded; charset=UTF-8")
        .body(Body::from("%7B%22kernel%22%3A+%22python3%22%7D="))
        .unwrap();
    let echoed = body_json(ReverseProxy::new().forward(req, port).await).await;
    assert_eq!(echoed["body"], r#"{"kernel": "python3"}"#);
    assert_eq!(echoed["headers"]["content-length"], "21");
}

#[tokio::test]
async fn form_post_with_length_is_untouched() {
    let port = start_backend().await;
    let raw = "a=1%202";
    let req = Request::builder()
        .method(Method::POST)
        .uri("/session/alice/form")
        .header("content-type", "application/x-www-form-urlencoded; charset=UTF-8")
        .header("content-length", raw.len())
        .body(Body::from(raw))
        .unwrap();
    let echoed = body_json(ReverseProxy::new().forward(req, port).await).await;
    assert_eq!(echoed["body"], raw);
}

#[tokio::test]
async fn unreachable_backend_is_bad_gateway() {
    let port = dead_port();
    let req = Request::builder()
        .uri("/session/alice/tree")
        .body(Body::empty())
        .unwrap();
    let response = ReverseProxy::new().forward(req, port).await;
    assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    let body = response.into_body().collect().await.unwrap().to_bytes();
    let text = String::from_utf8_lossy(&body);
    assert!(text.contains(&format!("localhost:{port}")), "body: {text}");
}

// ── Through the gateway router ─────────────────────────────────────

#[tokio::test]
async fn gateway_health() {
    let dir = tempfile::tempdir().unwrap();
    let addr = start_gateway(create_test_state(create_test_manager(dir.path(), 41000, 10))).await;
    let body: Value = reqwest::get(format!("http://{addr}/health"))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["status"], "ok");
}

#[tokio::test]
async fn gateway_refuses_sessions_without_backend() {
    let dir = tempfile::tempdir().unwrap();
    let addr = start_gateway(create_test_state(create_test_manager(dir.path(), 41000, 10))).await;

    let response = reqwest::get(format!("http://{addr}/session/alice/tree"))
        .await
        .unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::INTERNAL_SERVER_ERROR);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["error"]["code"], "session_not_running");
}

#[tokio::test]
async fn gateway_proxies_running_session() {
    let backend = start_backend().await;
    let dir = tempfile::tempdir().unwrap();
    let state = create_test_state(create_test_manager(dir.path(), 41000, 10));
    fake_running_session(&state.manager, "alice", backend);
    let addr = start_gateway(state).await;

    for (path, expected) in [
        ("/session/alice/api/kernels?x=1", "/session/alice/api/kernels?x=1"),
        ("/session/alice/", "/session/alice/"),
        ("/session/alice", "/session/alice"),
    ] {
        let response = reqwest::get(format!("http://{addr}{path}")).await.unwrap();
        assert_eq!(response.status(), reqwest::StatusCode::OK, "{path}");
        let body: Value = response.json().await.unwrap();
        assert_eq!(body["uri"], expected);
    }

    let status: Value = reqwest::get(format!("http://{addr}/status/alice"))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(status["running"], true);
    assert_eq!(status["context"]["http_port"], backend);
}

#[tokio::test]
async fn gateway_keeps_upstream_status_line_and_content_type() {
    let backend = start_raw_backend(
        "HTTP/1.1 418 Custom Teapot\r\n\
         content-type: text/x-tea\r\n\
         content-length: 3\r\n\
         connection: close\r\n\
         \r\n\
         tea",
    )
    .await;
    let dir = tempfile::tempdir().unwrap();
    let state = create_test_state(create_test_manager(dir.path(), 41000, 10));
    fake_running_session(&state.manager, "alice", backend);
    let addr = start_gateway(state).await;

    let reply = raw_exchange(
        addr,
        "GET /session/alice/tea HTTP/1.1\r\nHost: gateway\r\nConnection: close\r\n\r\n",
    )
    .await;
    assert!(reply.starts_with("HTTP/1.1 418 Custom Teapot\r\n"), "reply: {reply}");
    assert!(reply.to_lowercase().contains("\r\ncontent-type: text/x-tea\r\n"), "reply: {reply}");
    assert!(reply.ends_with("tea"), "reply: {reply}");
}

#[tokio::test]
async fn gateway_session_with_dead_backend_port_is_bad_gateway() {
    let dir = tempfile::tempdir().unwrap();
    let state = create_test_state(create_test_manager(dir.path(), 41000, 10));
    fake_running_session(&state.manager, "alice", dead_port());
    let addr = start_gateway(state).await;

    let response = reqwest::get(format!("http://{addr}/session/alice/tree"))
        .await
        .unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::BAD_GATEWAY);
}

#[tokio::test(flavor = "multi_thread")]
async fn gateway_shutdown_redirects_home() {
    let dir = tempfile::tempdir().unwrap();
    let addr = start_gateway(create_test_state(create_test_manager(dir.path(), 41000, 10))).await;
    let client = reqwest::Client::builder()
        .redirect(reqwest::redirect::Policy::none())
        .build()
        .unwrap();

    let response = client
        .post(format!("http://{addr}/session/erin/shutdown"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::SEE_OTHER);
    assert_eq!(response.headers()["location"], "/");

    let response = client
        .post(format!("http://{addr}/session/a%20b/shutdown"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn gateway_rejects_bad_names() {
    let dir = tempfile::tempdir().unwrap();
    let addr = start_gateway(create_test_state(create_test_manager(dir.path(), 41000, 10))).await;

    let response = reqwest::get(format!("http://{addr}/launch/a%20b")).await.unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::BAD_REQUEST);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["error"]["code"], "invalid_session_name");
}

#[tokio::test]
async fn gateway_enforces_trusted_user_header() {
    let backend = start_backend().await;
    let dir = tempfile::tempdir().unwrap();
    let state = create_test_state(create_test_manager(dir.path(), 41000, 10));
    fake_running_session(&state.manager, "alice", backend);
    let app = api::router(
        state,
        RouterConfig {
            trusted_user_header: Some(HeaderName::from_static("x-remote-user")),
        },
    );
    let addr = start_server(app).await;
    let client = reqwest::Client::new();
    let url = format!("http://{addr}/session/alice/tree");

    let anonymous = client.get(&url).send().await.unwrap();
    assert_eq!(anonymous.status(), reqwest::StatusCode::FORBIDDEN);

    let other = client.get(&url).header("x-remote-user", "bob").send().await.unwrap();
    assert_eq!(other.status(), reqwest::StatusCode::FORBIDDEN);

    let owner = client.get(&url).header("x-remote-user", "alice").send().await.unwrap();
    assert_eq!(owner.status(), reqwest::StatusCode::OK);

    let health = client.get(format!("http://{addr}/health")).send().await.unwrap();
    assert_eq!(health.status(), reqwest::StatusCode::OK);
}
