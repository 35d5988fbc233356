//! Cluster Watcher Adapter (§4.8): the pure mapping from a cluster-watch
//! notification to zero or more [`Registry`] mutations, plus a concrete
//! adapter wrapping `kube`'s watch stream.
//!
//! The pure function at the bottom of this module is what's actually under
//! test; the `kube`-backed `run` loop around it is thin glue that is not
//! worth mocking a whole Kubernetes API server to exercise.

use std::collections::BTreeMap;

use futures_util::StreamExt;
use k8s_openapi::api::core::v1::Service;
use kube::runtime::watcher::{self, Event};
use kube::runtime::WatchStreamExt;
use kube::{Api, Client};

use crate::registry::{BackendProtocol, HostMapping, Registry};

const LABEL_SELECTOR: &str = "agent.gitlab.com/id";
const HOST_TEMPLATE_ANNOTATION: &str = "workspaces.gitlab.com/host-template";
const WORKSPACE_ID_ANNOTATION: &str = "workspaces.gitlab.com/id";
const PORT_PLACEHOLDER: &str = "{{.port}}";

/// What kind of change the cluster observed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceAction {
    Add,
    Update,
    Delete,
}

/// Transport-agnostic projection of a watched Service (§3). The adapter
/// depends only on this shape, never on `k8s_openapi::Service` directly, so
/// it is testable without a live cluster.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceEvent {
    pub action: ServiceAction,
    pub name: String,
    pub namespace: String,
    pub ports: Vec<i32>,
    pub annotations: BTreeMap<String, String>,
}

/// Apply one [`ServiceEvent`] to `registry`. Pure with respect to the event:
/// the same event always produces the same set of mutations, which is what
/// makes this testable without a cluster (§8, testable property).
pub fn apply_event(registry: &Registry, event: &ServiceEvent) {
    match event.action {
        ServiceAction::Add | ServiceAction::Update => apply_add_or_update(registry, event),
        ServiceAction::Delete => apply_delete(registry, event),
    }
}

fn apply_add_or_update(registry: &Registry, event: &ServiceEvent) {
    let Some(host_template) = event.annotations.get(HOST_TEMPLATE_ANNOTATION) else {
        tracing::warn!(
            service = %event.name,
            namespace = %event.namespace,
            "service missing {HOST_TEMPLATE_ANNOTATION} annotation, skipping"
        );
        return;
    };
    let Some(workspace_id) = event.annotations.get(WORKSPACE_ID_ANNOTATION) else {
        tracing::warn!(
            service = %event.name,
            namespace = %event.namespace,
            "service missing {WORKSPACE_ID_ANNOTATION} annotation, skipping"
        );
        return;
    };

    for port in &event.ports {
        let hostname = host_template.replace(PORT_PLACEHOLDER, &port.to_string());
        let mapping = HostMapping {
            hostname,
            backend_host: format!("{}.{}", event.name, event.namespace),
            backend_port: (*port).max(0) as u16,
            backend_protocol: BackendProtocol::Http,
            workspace_id: workspace_id.clone(),
            workspace_name: event.name.clone(),
        };
        registry.add(mapping);
    }
}

fn apply_delete(registry: &Registry, event: &ServiceEvent) {
    let Some(host_template) = event.annotations.get(HOST_TEMPLATE_ANNOTATION) else {
        tracing::warn!(
            service = %event.name,
            namespace = %event.namespace,
            "delete event missing {HOST_TEMPLATE_ANNOTATION} annotation, skipping"
        );
        return;
    };
    registry.delete_by_hostname(host_template);
}

/// Run the real cluster-watch loop against `client`, feeding every observed
/// Service through [`apply_event`] until the watch stream ends or errors out.
pub async fn run(client: Client, registry: Registry) -> anyhow::Result<()> {
    let services: Api<Service> = Api::all(client);
    let config = watcher::Config::default().labels(LABEL_SELECTOR);
    let mut stream = Box::pin(watcher::watcher(services, config).default_backoff());

    while let Some(event) = stream.next().await {
        match event {
            Ok(Event::Apply(service)) => {
                if let Some(event) = service_event(ServiceAction::Update, &service) {
                    apply_event(&registry, &event);
                }
            }
            Ok(Event::Delete(service)) => {
                if let Some(event) = service_event(ServiceAction::Delete, &service) {
                    apply_event(&registry, &event);
                }
            }
            Ok(Event::Init) | Ok(Event::InitApply(_)) | Ok(Event::InitDone) => {}
            Err(err) => {
                tracing::warn!(error = %err, "cluster watch stream error");
            }
        }
    }

    Ok(())
}

fn service_event(action: ServiceAction, service: &Service) -> Option<ServiceEvent> {
    let metadata = &service.metadata;
    let name = metadata.name.clone()?;
    let namespace = metadata.namespace.clone().unwrap_or_default();
    let annotations: BTreeMap<String, String> = metadata
        .annotations
        .clone()
        .unwrap_or_default()
        .into_iter()
        .collect();
    let ports = service
        .spec
        .as_ref()
        .map(|spec| spec.ports.clone().unwrap_or_default())
        .unwrap_or_default()
        .into_iter()
        .map(|p| p.port)
        .collect();

    Some(ServiceEvent {
        action,
        name,
        namespace,
        ports,
        annotations,
    })
}
