//! Client for the remote identity provider's GraphQL API.
//!
//! Two operations are needed anywhere in this proxy: "who is this access
//! token" and "who owns this workspace". Both the OAuth callback and the
//! SSH authorization callback go through the same [`IdentityApi`] trait so
//! tests can substitute [`MockIdentityApi`] at a single seam.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::json;

/// How the access token is presented to the identity provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenKind {
    Bearer,
    PersonalAccessToken,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct User {
    pub id: String,
    pub name: String,
    pub username: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Workspace {
    pub id: String,
    pub name: String,
    pub owner: User,
}

#[derive(Debug, thiserror::Error)]
pub enum IdentityError {
    #[error("identity request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("identity response was malformed: {0}")]
    MalformedResponse(String),

    #[error("workspace not found")]
    WorkspaceNotFound,

    #[error("identity provider rejected the access token ({status})")]
    Unauthorized { status: StatusCode },
}

impl IdentityError {
    pub fn is_auth_rejection(&self) -> bool {
        matches!(self, IdentityError::Unauthorized { .. })
    }
}

pub type Result<T> = std::result::Result<T, IdentityError>;

/// Queries this proxy depends on from the identity provider.
#[async_trait::async_trait]
pub trait IdentityApi: Send + Sync {
    async fn current_user(&self) -> Result<User>;
    async fn workspace(&self, workspace_id: &str) -> Result<Workspace>;
}

/// Builds an [`IdentityApi`] bound to a single access token.
pub type IdentityApiFactory = Arc<dyn Fn(&str, TokenKind) -> Arc<dyn IdentityApi> + Send + Sync>;

/// GraphQL client talking to the identity provider over HTTPS.
pub struct GraphQlIdentityClient {
    http: Client,
    host: String,
    token: String,
    token_kind: TokenKind,
}

impl GraphQlIdentityClient {
    pub fn new(host: impl Into<String>, token: impl Into<String>, token_kind: TokenKind) -> Self {
        Self {
            http: Client::builder()
                .timeout(Duration::from_secs(10))
                .build()
                .expect("reqwest client builds with static config"),
            host: host.into(),
            token: token.into(),
            token_kind,
        }
    }

    pub fn factory(host: impl Into<String>) -> IdentityApiFactory {
        let host = host.into();
        Arc::new(move |token, token_kind| {
            Arc::new(GraphQlIdentityClient::new(host.clone(), token, token_kind))
                as Arc<dyn IdentityApi>
        })
    }

    fn global_id(workspace_id: &str) -> String {
        format!("gid://gitlab/RemoteDevelopment::Workspace/{workspace_id}")
    }

    async fn graphql(&self, query: &str, variables: serde_json::Value) -> Result<serde_json::Value> {
        let mut request = self
            .http
            .post(format!("{}/api/graphql", self.host))
            .json(&json!({ "query": query, "variables": variables }));

        request = match self.token_kind {
            TokenKind::Bearer => request.header("Authorization", format!("Bearer {}", self.token)),
            TokenKind::PersonalAccessToken => request.header("PRIVATE-TOKEN", &self.token),
        };

        let response = request.send().await?;
        let status = response.status();
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            return Err(IdentityError::Unauthorized { status });
        }

        let body: serde_json::Value = response.json().await?;
        if let Some(errors) = body.get("errors").and_then(|v| v.as_array()) {
            if !errors.is_empty() {
                return Err(IdentityError::MalformedResponse(errors.to_string()));
            }
        }
        body.get("data")
            .cloned()
            .ok_or_else(|| IdentityError::MalformedResponse("missing data field".to_string()))
    }
}

#[async_trait::async_trait]
impl IdentityApi for GraphQlIdentityClient {
    async fn current_user(&self) -> Result<User> {
        let data = self
            .graphql("query { currentUser { id name username } }", json!({}))
            .await?;
        serde_json::from_value(
            data.get("currentUser")
                .cloned()
                .ok_or_else(|| IdentityError::MalformedResponse("missing currentUser".into()))?,
        )
        .map_err(|e| IdentityError::MalformedResponse(e.to_string()))
    }

    async fn workspace(&self, workspace_id: &str) -> Result<Workspace> {
        let data = self
            .graphql(
                "query($id: RemoteDevelopmentWorkspaceID!) { \
                 workspace(id: $id) { id name user { id name username } } }",
                json!({ "id": Self::global_id(workspace_id) }),
            )
            .await?;
        let workspace = data
            .get("workspace")
            .cloned()
            .ok_or(IdentityError::WorkspaceNotFound)?;
        if workspace.is_null() {
            return Err(IdentityError::WorkspaceNotFound);
        }
        let id = workspace
            .get("id")
            .and_then(|v| v.as_str())
            .ok_or_else(|| IdentityError::MalformedResponse("missing workspace id".into()))?
            .to_string();
        let name = workspace
            .get("name")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string();
        let owner: User = serde_json::from_value(
            workspace
                .get("user")
                .cloned()
                .ok_or_else(|| IdentityError::MalformedResponse("missing workspace owner".into()))?,
        )
        .map_err(|e| IdentityError::MalformedResponse(e.to_string()))?;

        Ok(Workspace { id, name, owner })
    }
}

/// Fixed-response identity client for tests, keyed by access token.
#[derive(Clone, Default)]
pub struct MockIdentityApi {
    pub current_user: Option<User>,
    pub workspaces: HashMap<String, Workspace>,
    pub reject: bool,
}

impl MockIdentityApi {
    pub fn new(current_user: User) -> Self {
        Self {
            current_user: Some(current_user),
            workspaces: HashMap::new(),
            reject: false,
        }
    }

    pub fn with_workspace(mut self, workspace: Workspace) -> Self {
        self.workspaces.insert(workspace.id.clone(), workspace);
        self
    }

    pub fn rejecting() -> Self {
        Self {
            reject: true,
            ..Default::default()
        }
    }
}

#[async_trait::async_trait]
impl IdentityApi for MockIdentityApi {
    async fn current_user(&self) -> Result<User> {
        if self.reject {
            return Err(IdentityError::Unauthorized {
                status: StatusCode::UNAUTHORIZED,
            });
        }
        self.current_user
            .clone()
            .ok_or_else(|| IdentityError::MalformedResponse("no current user configured".into()))
    }

    async fn workspace(&self, workspace_id: &str) -> Result<Workspace> {
        if self.reject {
            return Err(IdentityError::Unauthorized {
                status: StatusCode::UNAUTHORIZED,
            });
        }
        self.workspaces
            .get(workspace_id)
            .cloned()
            .ok_or(IdentityError::WorkspaceNotFound)
    }
}
