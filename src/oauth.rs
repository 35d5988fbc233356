//! OAuth2 authorization-code flow: state encoding, token exchange, and the
//! callback/forward-gate state machine driving the HTTP auth gate.
//!
//! The state machine is deliberately written so the CALLBACK branch always
//! returns before control could fall through into the FORWARD_GATE branch —
//! an earlier implementation of this flow let a callback response fall
//! through into the cookie check below it, re-processing a stale request.

use std::time::Duration;

use percent_encoding::{percent_decode_str, utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use reqwest::Client;
use serde::Deserialize;

use crate::identity::{IdentityApiFactory, TokenKind};
use crate::registry::{HostMapping, Registry};
use crate::session;

/// Percent-encode set matching `encodeURIComponent`: escape everything but
/// the RFC 3986 "unreserved" characters, so `:` and `/` in the carried URL
/// are escaped while hostname dots and dashes survive unescaped.
const COMPONENT: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'~');

#[derive(Debug, Clone)]
pub struct OAuthConfig {
    pub client_id: String,
    pub client_secret: String,
    pub redirect_uri: String,
    pub host: String,
    pub signing_key: Vec<u8>,
    pub protocol: String,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: i64,
}

#[derive(Debug, thiserror::Error)]
pub enum OAuthError {
    #[error("missing authorization code")]
    MissingCode,
    #[error("missing state parameter")]
    MissingState,
    #[error("token exchange failed: {0}")]
    TokenExchange(#[from] reqwest::Error),
    #[error("no workspace is routed for this request")]
    UnknownWorkspace,
    #[error("the authenticated user does not own this workspace")]
    NotOwner,
    #[error("identity lookup failed: {0}")]
    Identity(#[from] crate::identity::IdentityError),
    #[error("failed to mint session token: {0}")]
    Session(#[from] session::SessionError),
}

/// Percent-encode a full request URL for embedding as the `state` query
/// parameter.
pub fn encode_state(url: &str) -> String {
    utf8_percent_encode(url, COMPONENT).to_string()
}

/// Percent-decode a `state` value back into the original request URL.
pub fn decode_state(state: &str) -> Result<String, std::str::Utf8Error> {
    Ok(percent_decode_str(state).decode_utf8()?.into_owned())
}

/// Is this request (by host and path) the OAuth callback endpoint configured
/// via `redirect_uri`? Both host and path must match, not path alone — a
/// workspace backend that happens to expose its own `/auth/callback` route
/// must never be mistaken for the gateway's own callback.
pub fn is_callback_uri(host_without_port: &str, path: &str, redirect_uri: &str) -> bool {
    let without_scheme = redirect_uri
        .split_once("://")
        .map(|(_, rest)| rest)
        .unwrap_or(redirect_uri);
    let (redirect_host, redirect_path) = match without_scheme.split_once('/') {
        Some((host, rest)) => (host, format!("/{rest}")),
        None => (without_scheme, "/".to_string()),
    };
    let redirect_host_without_port = redirect_host.split(':').next().unwrap_or(redirect_host);

    redirect_host_without_port == host_without_port && path == redirect_path
}

/// Build the current-request URL used as the `state` carrier.
pub fn current_url(protocol: &str, host: &str, path_and_query: &str) -> String {
    format!("{protocol}://{host}{path_and_query}")
}

/// Build the provider's `/oauth/authorize` redirect target. `scope` is
/// written as a raw, literal space-separated string rather than percent- or
/// plus-encoded — the original never runs it through an encoder, and
/// providers expect it verbatim.
pub fn build_authorize_url(config: &OAuthConfig, current_request_url: &str) -> String {
    format!(
        "{host}/oauth/authorize?response_type=code&client_id={client_id}&redirect_uri={redirect_uri}&scope=openid profile api read_user&state={state}",
        host = config.host,
        client_id = config.client_id,
        redirect_uri = config.redirect_uri,
        state = encode_state(current_request_url),
    )
}

async fn exchange_code(http: &Client, config: &OAuthConfig, code: &str) -> Result<TokenResponse, OAuthError> {
    let response = http
        .post(format!("{}/oauth/token", config.host))
        .timeout(Duration::from_secs(10))
        .form(&[
            ("grant_type", "authorization_code"),
            ("code", code),
            ("redirect_uri", config.redirect_uri.as_str()),
            ("client_id", config.client_id.as_str()),
            ("client_secret", config.client_secret.as_str()),
        ])
        .send()
        .await?
        .error_for_status()?
        .json::<TokenResponse>()
        .await?;
    Ok(response)
}

/// Outcome of resolving the OAuth callback branch of the state machine.
pub struct CallbackResult {
    /// The hostname (and scheme) to redirect the browser back to.
    pub redirect_to: String,
    /// Value to set on the session cookie.
    pub session_token: String,
    /// Domain attribute for the session cookie (the eTLD+1 of the resolved
    /// workspace host).
    pub cookie_domain: String,
    /// Cookie lifetime in seconds, taken from the provider's `expires_in`;
    /// callers render this as the `Expires` attribute.
    pub ttl_seconds: i64,
}

/// Handle the OAuth `redirect_uri` callback: exchange the code, verify
/// workspace ownership, mint a session token. Always terminal — callers
/// MUST return the resulting redirect/error without falling through to the
/// forward-gate branch.
pub async fn handle_callback(
    http: &Client,
    config: &OAuthConfig,
    registry: &Registry,
    identity_factory: &IdentityApiFactory,
    code: Option<&str>,
    state: Option<&str>,
) -> Result<CallbackResult, OAuthError> {
    let code = code.ok_or(OAuthError::MissingCode)?;
    let token = exchange_code(http, config, code).await?;

    let state = state.ok_or(OAuthError::MissingState)?;
    let redirect_to = decode_state(state).map_err(|_| OAuthError::UnknownWorkspace)?;
    let request_host = host_from_url(&redirect_to).ok_or(OAuthError::UnknownWorkspace)?;

    let mapping = registry
        .get_by_hostname(&request_host)
        .ok_or(OAuthError::UnknownWorkspace)?;

    let identity = identity_factory(&token.access_token, TokenKind::Bearer);
    let current_user = identity.current_user().await?;
    let workspace = identity.workspace(&mapping.workspace_id).await?;
    if current_user.id != workspace.owner.id {
        return Err(OAuthError::NotOwner);
    }

    let session_token = session::mint(&config.signing_key, &mapping.workspace_id, token.expires_in)?;

    Ok(CallbackResult {
        redirect_to,
        session_token,
        cookie_domain: cookie_domain_for(&request_host),
        ttl_seconds: token.expires_in,
    })
}

/// Resolve the workspace routed for `request_url` and check whether
/// `session_cookie` (if any) is a valid session for it. Returns the
/// resolved mapping on success so callers can proceed to proxy, or `None`
/// if the registry has no route for this host.
pub fn resolve_and_check_session(
    registry: &Registry,
    config: &OAuthConfig,
    request_host: &str,
    session_cookie: Option<&str>,
) -> Option<(HostMapping, bool)> {
    let mapping = registry.get_by_hostname(request_host)?;
    let authorized = session_cookie
        .map(|cookie| session::verify(&config.signing_key, cookie, &mapping.workspace_id))
        .unwrap_or(false);
    Some((mapping, authorized))
}

fn host_from_url(url: &str) -> Option<String> {
    let without_scheme = url.split_once("://").map(|(_, rest)| rest).unwrap_or(url);
    let host = without_scheme.split(['/', '?']).next()?;
    Some(host.to_string())
}

fn cookie_domain_for(host: &str) -> String {
    let host_without_port = host.split(':').next().unwrap_or(host);
    let labels: Vec<&str> = host_without_port.split('.').collect();
    if labels.len() <= 2 {
        format!(".{host_without_port}")
    } else {
        format!(".{}", labels[labels.len() - 2..].join("."))
    }
}
