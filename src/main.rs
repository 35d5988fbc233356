//! Binary entry point: load configuration, initialize the cluster client
//! and tracing, wire the registry/identity/proxy/bastion pieces together,
//! and run the supervisor to completion.

use std::sync::Arc;

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use workspace_gate_proxy::config::Cli;
use workspace_gate_proxy::identity::GraphQlIdentityClient;
use workspace_gate_proxy::metrics::MetricsCollector;
use workspace_gate_proxy::oauth::OAuthConfig;
use workspace_gate_proxy::proxy::ProxyState;
use workspace_gate_proxy::ssh::BastionConfig;
use workspace_gate_proxy::supervisor::Supervisor;
use workspace_gate_proxy::{watcher, Config, Registry};

#[tokio::main]
async fn main() {
    if let Err(err) = run().await {
        tracing::error!(error = %err, "fatal error");
        eprintln!("error: {err:#}");
        std::process::exit(1);
    }
}

async fn run() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = Config::load(&cli.config)?;
    init_tracing(&config.log_level);

    let kube_client = build_kube_client(cli.kubeconfig.as_deref()).await?;

    let registry = Registry::new();
    let metrics = Arc::new(parking_lot::Mutex::new(MetricsCollector::new()));
    let identity_factory = GraphQlIdentityClient::factory(config.auth.host.clone());

    let cancellation = CancellationToken::new();

    let watcher_registry = registry.clone();
    let watcher_token = cancellation.clone();
    tokio::spawn(async move {
        tokio::select! {
            result = watcher::run(kube_client, watcher_registry) => {
                if let Err(err) = result {
                    tracing::error!(error = %err, "cluster watcher stopped");
                }
            }
            _ = watcher_token.cancelled() => {}
        }
    });

    let oauth_config = Arc::new(OAuthConfig {
        client_id: config.auth.client_id.clone(),
        client_secret: config.auth.client_secret.clone(),
        redirect_uri: config.auth.redirect_uri.clone(),
        host: config.auth.host.clone(),
        signing_key: config.auth.signing_key.clone().into_bytes(),
        protocol: config.auth.protocol.clone(),
    });

    let proxy_state = ProxyState {
        registry: registry.clone(),
        config: oauth_config,
        identity_factory: identity_factory.clone(),
        http: reqwest::Client::new(),
        metrics: metrics.clone(),
        metrics_path: config.metrics_path.clone(),
    };

    let http_addr = config
        .http
        .enabled
        .then(|| std::net::SocketAddr::from(([0, 0, 0, 0], config.http.port)));
    let ssh_bastion = config.ssh.enabled.then(|| BastionConfig {
        listen_addr: std::net::SocketAddr::from(([0, 0, 0, 0], config.ssh.port)),
        host_key: config.ssh.host_key.clone(),
        backend_port: config.ssh.backend_port,
        backend_username: config.ssh.backend_username.clone(),
    });

    let supervisor = Supervisor::new(http_addr, ssh_bastion)?;

    let shutdown_token = cancellation.clone();
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        tracing::info!("received shutdown signal");
        shutdown_token.cancel();
    });

    supervisor
        .run(proxy_state, registry, identity_factory, metrics, cancellation)
        .await
}

fn init_tracing(log_level: &str) {
    let filter = EnvFilter::try_new(log_level).unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

async fn build_kube_client(kubeconfig: Option<&std::path::Path>) -> anyhow::Result<kube::Client> {
    match kubeconfig {
        Some(path) => {
            let kubeconfig = kube::config::Kubeconfig::read_from(path)?;
            let config =
                kube::Config::from_custom_kubeconfig(kubeconfig, &Default::default()).await?;
            Ok(kube::Client::try_from(config)?)
        }
        None => Ok(kube::Client::try_default().await?),
    }
}
