//! HTTP reverse-proxy pipeline: the OAuth auth gate, transparent request
//! forwarding, and WebSocket upgrade pass-through.
//!
//! The Go original wraps the `http.ResponseWriter` in a recorder that
//! delegates `Hijack()` to the underlying writer so IDE WebSocket clients
//! can upgrade through the proxy. Rust's equivalent hijack point is
//! `hyper::upgrade::on`, used below the same way: grabbed on the inbound
//! request before any response is written, and spliced byte-for-byte
//! against a raw TCP handshake with the backend.

use std::sync::Arc;
use std::time::Duration;

use axum::body::{to_bytes, Body};
use axum::extract::{Request, State};
use axum::http::{header, HeaderMap, HeaderValue, StatusCode, Uri};
use axum::response::{IntoResponse, Redirect, Response};
use axum::routing::any;
use axum::Router;
use hyper_util::rt::TokioIo;
use reqwest::Client;
use tokio::io::{copy_bidirectional, AsyncWriteExt};
use tokio::net::TcpStream;

use crate::identity::IdentityApiFactory;
use crate::metrics::MetricsCollector;
use crate::oauth::{self, OAuthConfig};
use crate::registry::{HostMapping, Registry};
use crate::session::SESSION_COOKIE_NAME;

const MAX_PROXIED_BODY_BYTES: usize = 64 * 1024 * 1024;

#[derive(Clone)]
pub struct ProxyState {
    pub registry: Registry,
    pub config: Arc<OAuthConfig>,
    pub identity_factory: IdentityApiFactory,
    pub http: Client,
    pub metrics: Arc<parking_lot::Mutex<MetricsCollector>>,
    pub metrics_path: String,
}

pub fn router(state: ProxyState) -> Router {
    let metrics_path = state.metrics_path.clone();
    Router::new()
        .route(&metrics_path, any(metrics_handler))
        .fallback(any(pipeline))
        .with_state(state)
}

async fn metrics_handler(State(state): State<ProxyState>) -> impl IntoResponse {
    let body = state.metrics.lock().to_prometheus(state.registry.len());
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        body,
    )
}

fn request_host(headers: &HeaderMap) -> Option<String> {
    headers
        .get(header::HOST)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string())
}

/// Entry point for every non-metrics request: run the OAuth state machine
/// (§4.4) and, once PROXY is reached, forward the request to the backend.
/// Wraps every branch so the status-class counter sees every response this
/// pipeline produces, not just the backend-forward leg.
async fn pipeline(State(state): State<ProxyState>, request: Request) -> Response {
    let response = pipeline_inner(&state, request).await;
    state.metrics.lock().on_http_response(response.status().as_u16());
    response
}

async fn pipeline_inner(state: &ProxyState, request: Request) -> Response {
    let Some(host) = request_host(request.headers()) else {
        return (StatusCode::BAD_REQUEST, "Missing Host header").into_response();
    };
    let host_without_port = host.split(':').next().unwrap_or(&host).to_string();

    if oauth::is_callback_uri(&host_without_port, request.uri().path(), &state.config.redirect_uri) {
        return handle_callback_branch(state, &request).await;
    }

    handle_forward_gate(state, request, &host, &host_without_port).await
}

async fn handle_callback_branch(state: &ProxyState, request: &Request) -> Response {
    let query = query_params(request.uri());
    let code = query.get("code").map(String::as_str);
    let state_param = query.get("state").map(String::as_str);

    match oauth::handle_callback(
        &state.http,
        &state.config,
        &state.registry,
        &state.identity_factory,
        code,
        state_param,
    )
    .await
    {
        Ok(result) => {
            state.metrics.lock().on_oauth_redirect();
            let expires = (chrono::Utc::now() + chrono::Duration::seconds(result.ttl_seconds))
                .format("%a, %d %b %Y %H:%M:%S GMT");
            let cookie = format!(
                "{}={}; Domain={}; Path=/; Expires={}",
                SESSION_COOKIE_NAME, result.session_token, result.cookie_domain, expires
            );
            let mut response = Redirect::temporary(&result.redirect_to).into_response();
            response.headers_mut().insert(
                header::SET_COOKIE,
                HeaderValue::from_str(&cookie).unwrap_or_else(|_| HeaderValue::from_static("")),
            );
            response
        }
        Err(err) => {
            state.metrics.lock().on_oauth_failure();
            tracing::warn!(error = %err, "oauth callback rejected");
            StatusCode::BAD_REQUEST.into_response()
        }
    }
    // This branch always returns here; it must never fall through to the
    // forward-gate branch below in the same request.
}

async fn handle_forward_gate(
    state: &ProxyState,
    request: Request,
    host: &str,
    host_without_port: &str,
) -> Response {
    let session_cookie = cookie_value(request.headers(), SESSION_COOKIE_NAME);

    let Some((mapping, authorized)) = oauth::resolve_and_check_session(
        &state.registry,
        &state.config,
        host_without_port,
        session_cookie.as_deref(),
    ) else {
        return (StatusCode::NOT_FOUND, "Workspace not found").into_response();
    };

    if !authorized {
        state.metrics.lock().on_oauth_redirect();
        let current_url = oauth::current_url(
            &state.config.protocol,
            host,
            &request
                .uri()
                .path_and_query()
                .map(|pq| pq.as_str().to_string())
                .unwrap_or_default(),
        );
        let authorize_url = oauth::build_authorize_url(&state.config, &current_url);
        return Redirect::temporary(&authorize_url).into_response();
    }

    forward(state, request, mapping).await
}

fn query_params(uri: &Uri) -> std::collections::HashMap<String, String> {
    uri.query()
        .map(|q| {
            q.split('&')
                .filter_map(|pair| pair.split_once('='))
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect()
        })
        .unwrap_or_default()
}

fn cookie_value(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get_all(header::COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(';'))
        .filter_map(|kv| kv.trim().split_once('='))
        .find(|(k, _)| *k == name)
        .map(|(_, v)| v.to_string())
}

fn is_websocket_upgrade(headers: &HeaderMap) -> bool {
    let has_upgrade_token = headers
        .get(header::CONNECTION)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_lowercase().contains("upgrade"))
        .unwrap_or(false);
    let is_websocket = headers
        .get(header::UPGRADE)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.eq_ignore_ascii_case("websocket"))
        .unwrap_or(false);
    has_upgrade_token && is_websocket
}

/// Forward `request` to the backend described by `mapping`, transparently
/// handling both ordinary HTTP and WebSocket-upgrade traffic.
async fn forward(state: &ProxyState, mut request: Request, mapping: HostMapping) -> Response {
    let path_and_query = request
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| "/".to_string());

    if is_websocket_upgrade(request.headers()) {
        return match proxy_websocket_upgrade(&mut request, &mapping, &path_and_query).await {
            Ok(response) => response,
            Err(err) => {
                tracing::error!(error = %err, hostname = %mapping.hostname, "websocket proxy failed");
                (StatusCode::BAD_GATEWAY, "upgrade failed").into_response()
            }
        };
    }

    let method = request.method().clone();
    let headers = request.headers().clone();
    let body = match to_bytes(request.into_body(), MAX_PROXIED_BODY_BYTES).await {
        Ok(bytes) => bytes,
        Err(err) => {
            tracing::error!(error = %err, hostname = %mapping.hostname, "failed reading request body");
            return (StatusCode::BAD_REQUEST, "failed to read request body").into_response();
        }
    };

    let backend_url = mapping.backend_url(&path_and_query);
    let backend_url = match reqwest::Url::parse(&backend_url) {
        Ok(url) => url,
        Err(err) => {
            tracing::error!(error = %err, hostname = %mapping.hostname, "backend url is unparseable");
            return (StatusCode::INTERNAL_SERVER_ERROR, "internal error").into_response();
        }
    };
    let mut outbound = state.http.request(method, backend_url).body(body);
    for (name, value) in &headers {
        if name == header::HOST {
            continue;
        }
        outbound = outbound.header(name, value);
    }

    match outbound.send().await {
        Ok(upstream) => {
            let status = upstream.status();
            let mut response_headers = HeaderMap::new();
            for (name, value) in upstream.headers() {
                response_headers.insert(name, value.clone());
            }
            let body = upstream.bytes().await.unwrap_or_default();
            let mut response = Response::builder()
                .status(status)
                .body(Body::from(body))
                .unwrap();
            *response.headers_mut() = response_headers;
            response
        }
        Err(err) => {
            tracing::error!(error = %err, hostname = %mapping.hostname, "backend request failed");
            (StatusCode::INTERNAL_SERVER_ERROR, "backend unavailable").into_response()
        }
    }
}

/// Splice a WebSocket upgrade through to the backend. Grabs the hijacked
/// connection via `hyper::upgrade::on` (the Rust analogue of the Go
/// recorder's delegated `Hijack()`), dials the backend directly, replays
/// the HTTP/1.1 upgrade handshake, then copies bytes bidirectionally until
/// either side closes.
async fn proxy_websocket_upgrade(
    request: &mut Request,
    mapping: &HostMapping,
    path_and_query: &str,
) -> anyhow::Result<Response> {
    let mut handshake = format!("{} {} HTTP/1.1\r\n", request.method(), path_and_query);
    for (name, value) in request.headers() {
        if name == header::HOST {
            continue;
        }
        handshake.push_str(&format!(
            "{}: {}\r\n",
            name.as_str(),
            value.to_str().unwrap_or("")
        ));
    }
    handshake.push_str(&format!(
        "Host: {}:{}\r\n\r\n",
        mapping.backend_host, mapping.backend_port
    ));

    let on_upgrade = hyper::upgrade::on(request);
    let backend_addr = (mapping.backend_host.clone(), mapping.backend_port);
    let mapping = mapping.clone();

    tokio::spawn(async move {
        let mut backend = match TcpStream::connect(backend_addr).await {
            Ok(stream) => stream,
            Err(err) => {
                tracing::error!(error = %err, hostname = %mapping.hostname, "backend dial failed for websocket upgrade");
                return;
            }
        };
        if let Err(err) = backend.write_all(handshake.as_bytes()).await {
            tracing::error!(error = %err, "failed writing backend handshake");
            return;
        }

        match on_upgrade.await {
            Ok(upgraded) => {
                let mut upgraded = TokioIo::new(upgraded);
                if let Err(err) = copy_bidirectional(&mut upgraded, &mut backend).await {
                    tracing::debug!(error = %err, "websocket splice ended");
                }
            }
            Err(err) => tracing::error!(error = %err, "client upgrade failed"),
        }
    });

    Ok(Response::builder()
        .status(StatusCode::SWITCHING_PROTOCOLS)
        .body(Body::empty())?)
}
