//! Concurrent in-memory upstream registry.
//!
//! Maintains two indexes over the same set of [`HostMapping`] records —
//! by hostname (used by the HTTP pipeline) and by workspace name (used by
//! the SSH bastion) — and keeps them consistent across adds and deletes.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

/// Protocol spoken to the backend workspace pod.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendProtocol {
    Http,
    Https,
}

impl BackendProtocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackendProtocol::Http => "http",
            BackendProtocol::Https => "https",
        }
    }
}

/// A single hostname -> backend routing record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostMapping {
    pub hostname: String,
    pub backend_host: String,
    pub backend_port: u16,
    pub backend_protocol: BackendProtocol,
    pub workspace_id: String,
    pub workspace_name: String,
}

impl HostMapping {
    pub fn backend_url(&self, path_and_query: &str) -> String {
        format!(
            "{}://{}:{}{}",
            self.backend_protocol.as_str(),
            self.backend_host,
            self.backend_port,
            path_and_query
        )
    }
}

#[derive(Default)]
struct Indexes {
    by_hostname: HashMap<String, HostMapping>,
    by_workspace_name: HashMap<String, HostMapping>,
}

/// Concurrent hostname/workspace-name -> [`HostMapping`] index.
///
/// Cheap to clone; all clones share the same underlying table.
#[derive(Clone, Default)]
pub struct Registry {
    inner: Arc<RwLock<Indexes>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or overwrite a mapping. Last writer wins on both indexes.
    pub fn add(&self, mapping: HostMapping) {
        let mut indexes = self.inner.write();
        indexes
            .by_workspace_name
            .insert(mapping.workspace_name.clone(), mapping.clone());
        indexes.by_hostname.insert(mapping.hostname.clone(), mapping);
    }

    /// Remove the mapping stored under `hostname`, if any, clearing both
    /// indexes using the workspace name recorded on the stored mapping
    /// (not a caller-supplied one) so the two indexes never drift apart.
    pub fn delete_by_hostname(&self, hostname: &str) {
        let mut indexes = self.inner.write();
        if let Some(mapping) = indexes.by_hostname.remove(hostname) {
            indexes.by_workspace_name.remove(&mapping.workspace_name);
        }
    }

    pub fn get_by_hostname(&self, hostname: &str) -> Option<HostMapping> {
        self.inner.read().by_hostname.get(hostname).cloned()
    }

    pub fn get_by_workspace_name(&self, workspace_name: &str) -> Option<HostMapping> {
        self.inner
            .read()
            .by_workspace_name
            .get(workspace_name)
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.inner.read().by_hostname.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
