//! Session token mint/verify.
//!
//! The proxy never stores server-side session state; the cookie value is a
//! self-contained, HMAC-signed token binding a workspace id and an expiry.

use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};

pub const SESSION_COOKIE_NAME: &str = "gitlab-workspace-session";

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Claims {
    workspace_id: String,
    exp: usize,
}

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("failed to mint session token: {0}")]
    Mint(#[from] jsonwebtoken::errors::Error),
}

/// Mint a session token for `workspace_id`, valid for `ttl_seconds`.
pub fn mint(signing_key: &[u8], workspace_id: &str, ttl_seconds: i64) -> Result<String, SessionError> {
    let exp = (chrono::Utc::now() + chrono::Duration::seconds(ttl_seconds)).timestamp() as usize;
    let claims = Claims {
        workspace_id: workspace_id.to_string(),
        exp,
    };
    let token = encode(
        &Header::new(Algorithm::HS256),
        &claims,
        &EncodingKey::from_secret(signing_key),
    )?;
    Ok(token)
}

/// Verify `token` was signed with `signing_key`, is unexpired, and is bound
/// to `expected_workspace_id`. Any other outcome (bad signature, wrong
/// algorithm, expiry, or workspace mismatch) returns `false`.
pub fn verify(signing_key: &[u8], token: &str, expected_workspace_id: &str) -> bool {
    let mut validation = Validation::new(Algorithm::HS256);
    validation.algorithms = vec![Algorithm::HS256];
    validation.validate_exp = true;

    let data = match decode::<Claims>(token, &DecodingKey::from_secret(signing_key), &validation) {
        Ok(data) => data,
        Err(_) => return false,
    };

    data.claims.workspace_id == expected_workspace_id
}
