//! End-to-end exercises of the HTTP auth-gate pipeline (§8): unauthenticated
//! first hit, successful OAuth callback, authorized forwarding, and unknown
//! hosts, all driven in-process through the real router via `tower::oneshot`
//! against mock GitLab and backend servers.

use std::sync::Arc;

use axum::body::Body;
use axum::http::{header, Request, StatusCode};
use httpmock::Method::{GET, POST};
use httpmock::MockServer;
use tower::ServiceExt;

use workspace_gate_proxy::identity::GraphQlIdentityClient;
use workspace_gate_proxy::metrics::MetricsCollector;
use workspace_gate_proxy::oauth::OAuthConfig;
use workspace_gate_proxy::proxy::{router, ProxyState};
use workspace_gate_proxy::registry::{BackendProtocol, HostMapping};
use workspace_gate_proxy::session;
use workspace_gate_proxy::Registry;

fn graphql_body(user_id: &str) -> String {
    format!(
        r#"{{"data":{{"currentUser":{{"id":"{user_id}","name":"Ada Lovelace","username":"ada"}},"workspace":{{"id":"1","name":"workspace1","user":{{"id":"{user_id}","name":"Ada Lovelace","username":"ada"}}}}}}}}"#
    )
}

fn state(gitlab_host: &str, registry: Registry) -> ProxyState {
    let config = Arc::new(OAuthConfig {
        client_id: "client-id".to_string(),
        client_secret: "client-secret".to_string(),
        redirect_uri: "https://gateway.example.com/auth/callback".to_string(),
        host: gitlab_host.to_string(),
        signing_key: b"integration-test-signing-key".to_vec(),
        protocol: "http".to_string(),
    });
    ProxyState {
        registry,
        config,
        identity_factory: GraphQlIdentityClient::factory(gitlab_host.to_string()),
        http: reqwest::Client::new(),
        metrics: Arc::new(parking_lot::Mutex::new(MetricsCollector::new())),
        metrics_path: "/metrics".to_string(),
    }
}

#[tokio::test]
async fn unauthenticated_first_hit_redirects_to_authorize() {
    let registry = Registry::new();
    let mapping = HostMapping {
        hostname: "workspace1.example.com".to_string(),
        backend_host: "127.0.0.1".to_string(),
        backend_port: 1,
        backend_protocol: BackendProtocol::Http,
        workspace_id: "1".to_string(),
        workspace_name: "workspace1".to_string(),
    };
    registry.add(mapping.clone());
    let app = router(state("https://gitlab.example.com", registry));

    let request = Request::builder()
        .uri("/dashboard")
        .header(header::HOST, "workspace1.example.com")
        .body(Body::empty())
        .unwrap();
    let response = app.oneshot(request).await.unwrap();

    assert_eq!(response.status(), StatusCode::TEMPORARY_REDIRECT);
    let location = response
        .headers()
        .get(header::LOCATION)
        .unwrap()
        .to_str()
        .unwrap();
    assert!(location.starts_with("https://gitlab.example.com/oauth/authorize"));
    assert!(location.contains("state=http%3A%2F%2Fworkspace1.example.com%2Fdashboard"));
}

#[tokio::test]
async fn oauth_callback_success_sets_cookie_and_redirects() {
    let gitlab = MockServer::start();
    gitlab.mock(|when, then| {
        when.method(POST).path("/oauth/token");
        then.status(200)
            .header("content-type", "application/json")
            .body(r#"{"access_token":"abc123","expires_in":3600}"#);
    });
    gitlab.mock(|when, then| {
        when.method(POST).path("/api/graphql");
        then.status(200)
            .header("content-type", "application/json")
            .body(graphql_body("1"));
    });

    let registry = Registry::new();
    let mapping = HostMapping {
        hostname: "workspace1.example.com".to_string(),
        backend_host: "127.0.0.1".to_string(),
        backend_port: 1,
        backend_protocol: BackendProtocol::Http,
        workspace_id: "1".to_string(),
        workspace_name: "workspace1".to_string(),
    };
    registry.add(mapping.clone());
    let app = router(state(&gitlab.base_url(), registry));

    let state_param =
        workspace_gate_proxy::oauth::encode_state("http://workspace1.example.com/dashboard");
    let request = Request::builder()
        .uri(format!("/auth/callback?code=xyz&state={state_param}"))
        .header(header::HOST, "gateway.example.com")
        .body(Body::empty())
        .unwrap();
    let response = app.oneshot(request).await.unwrap();

    assert_eq!(response.status(), StatusCode::TEMPORARY_REDIRECT);
    let location = response.headers().get(header::LOCATION).unwrap();
    assert_eq!(location, "http://workspace1.example.com/dashboard");
    let set_cookie = response
        .headers()
        .get(header::SET_COOKIE)
        .unwrap()
        .to_str()
        .unwrap();
    assert!(set_cookie.starts_with("gitlab-workspace-session="));
    assert!(set_cookie.contains("Domain=.example.com"));
}

#[tokio::test]
async fn oauth_callback_owner_mismatch_is_rejected() {
    let gitlab = MockServer::start();
    gitlab.mock(|when, then| {
        when.method(POST).path("/oauth/token");
        then.status(200)
            .header("content-type", "application/json")
            .body(r#"{"access_token":"abc123","expires_in":3600}"#);
    });
    // currentUser.id (2) does not match workspace.user.id (1).
    gitlab.mock(|when, then| {
        when.method(POST).path("/api/graphql");
        then.status(200)
            .header("content-type", "application/json")
            .body(r#"{"data":{"currentUser":{"id":"2","name":"Bob","username":"bob"},"workspace":{"id":"1","name":"workspace1","user":{"id":"1","name":"Ada","username":"ada"}}}}"#);
    });

    let registry = Registry::new();
    let mapping = HostMapping {
        hostname: "workspace1.example.com".to_string(),
        backend_host: "127.0.0.1".to_string(),
        backend_port: 1,
        backend_protocol: BackendProtocol::Http,
        workspace_id: "1".to_string(),
        workspace_name: "workspace1".to_string(),
    };
    registry.add(mapping.clone());
    let app = router(state(&gitlab.base_url(), registry));

    let state_param = workspace_gate_proxy::oauth::encode_state("http://workspace1.example.com/");
    let request = Request::builder()
        .uri(format!("/auth/callback?code=xyz&state={state_param}"))
        .header(header::HOST, "gateway.example.com")
        .body(Body::empty())
        .unwrap();
    let response = app.oneshot(request).await.unwrap();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn valid_session_cookie_forwards_to_backend() {
    let backend = MockServer::start();
    backend.mock(|when, then| {
        when.method(GET).path("/hello");
        then.status(200).body("hi from the workspace");
    });
    let backend_addr = backend.address();

    let registry = Registry::new();
    let mapping = HostMapping {
        hostname: "workspace1.example.com".to_string(),
        backend_host: backend_addr.ip().to_string(),
        backend_port: backend_addr.port(),
        backend_protocol: BackendProtocol::Http,
        workspace_id: "1".to_string(),
        workspace_name: "workspace1".to_string(),
    };
    registry.add(mapping.clone());
    let app = router(state("https://gitlab.example.com", registry));

    let token = session::mint(b"integration-test-signing-key", "1", 3600).unwrap();
    let request = Request::builder()
        .uri("/hello")
        .header(header::HOST, "workspace1.example.com")
        .header(header::COOKIE, format!("gitlab-workspace-session={token}"))
        .body(Body::empty())
        .unwrap();
    let response = app.oneshot(request).await.unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    assert_eq!(&body[..], b"hi from the workspace");
}

#[tokio::test]
async fn unknown_host_is_404_before_any_auth_check() {
    let registry = Registry::new();
    let mapping = HostMapping {
        hostname: "workspace1.example.com".to_string(),
        backend_host: "127.0.0.1".to_string(),
        backend_port: 1,
        backend_protocol: BackendProtocol::Http,
        workspace_id: "1".to_string(),
        workspace_name: "workspace1".to_string(),
    };
    registry.add(mapping.clone());
    let app = router(state("https://gitlab.example.com", registry));

    let request = Request::builder()
        .uri("/")
        .header(header::HOST, "ghost.example.com")
        .body(Body::empty())
        .unwrap();
    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}
