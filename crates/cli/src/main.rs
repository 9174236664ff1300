use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{ArgAction, Parser};
use labeler_controller::{Controller, ControllerConfig, Relationship};
use labeler_core::{ChangeEvent, Role};
use labeler_kubehub::{KubeStore, WatchTarget};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

mod labeling;

#[derive(Parser, Debug)]
#[command(name = "labeler", version, about = "Labeler controller")]
struct Cli {
    /// GVK key of the reconciled custom resource
    #[arg(long, env = "LABELER_PRIMARY_GVK", default_value = "clusterops.knative.dev/v1alpha1/Labeler")]
    primary_gvk: String,

    /// GVK key of the related workload resource
    #[arg(long, env = "LABELER_SECONDARY_GVK", default_value = "apps/v1/Deployment")]
    secondary_gvk: String,

    /// Watch a single namespace (default: all)
    #[arg(long = "ns", env = "LABELER_NAMESPACE")]
    namespace: Option<String>,

    /// Concurrent reconciles
    #[arg(long, env = "LABELER_WORKERS", default_value_t = 2)]
    workers: usize,

    /// Write the status sub-resource after successful reconciles
    #[arg(long = "status-updates", env = "LABELER_STATUS_UPDATES", action = ArgAction::SetTrue)]
    status_updates: bool,

    #[arg(long, env = "LABELER_BACKOFF_BASE_MS", default_value_t = 5)]
    backoff_base_ms: u64,

    #[arg(long, env = "LABELER_BACKOFF_MAX_MS", default_value_t = 1_000_000)]
    backoff_max_ms: u64,

    /// Buffered events per watched kind
    #[arg(long, env = "LABELER_CHANNEL_CAPACITY", default_value_t = 1024)]
    channel_capacity: usize,

    /// How a Deployment maps back to Labelers: owner, namespace or label:<key>
    #[arg(long, env = "LABELER_RELATIONSHIP", default_value = "namespace")]
    relationship: Relationship,

    #[arg(long, env = "LABELER_FIELD_MANAGER", default_value = "labeler-controller")]
    field_manager: String,
}

impl Cli {
    fn controller_config(&self) -> Result<ControllerConfig> {
        let primary = labeler_kubehub::parse_gvk_key(&self.primary_gvk)?;
        let config = ControllerConfig {
            primary_kind: primary.kind,
            workers: self.workers,
            skip_status_updates: !self.status_updates,
            backoff_base: Duration::from_millis(self.backoff_base_ms),
            backoff_max: Duration::from_millis(self.backoff_max_ms),
            channel_capacity: self.channel_capacity,
            relationship: self.relationship.clone(),
        };
        config.validate()?;
        Ok(config)
    }

    fn target(&self, gvk_key: &str, role: Role) -> WatchTarget {
        WatchTarget { gvk_key: gvk_key.to_string(), namespace: self.namespace.clone(), role }
    }
}

fn init_tracing() {
    let env = std::env::var("LABELER_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("LABELER_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            warn!(addr = %addr, "invalid LABELER_METRICS_ADDR; expected host:port");
        }
    }
}

/// Keep a watcher alive, restarting it with capped backoff until shutdown.
async fn supervise_watch(client: kube::Client, target: WatchTarget, tx: mpsc::Sender<ChangeEvent>, shutdown: CancellationToken) {
    let mut delay = Duration::from_secs(1);
    loop {
        let res = tokio::select! {
            _ = shutdown.cancelled() => return,
            res = labeler_kubehub::watch_kind(client.clone(), target.clone(), tx.clone()) => res,
        };
        match res {
            Ok(()) => warn!(gvk = %target.gvk_key, "watcher exited"),
            Err(e) => error!(gvk = %target.gvk_key, error = ?e, "watcher failed"),
        }
        if tx.is_closed() {
            return;
        }
        tokio::select! {
            _ = shutdown.cancelled() => return,
            _ = tokio::time::sleep(delay) => {}
        }
        delay = (delay * 2).min(Duration::from_secs(60));
    }
}

async fn wait_for_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => info!("interrupt received"),
                    _ = term.recv() => info!("SIGTERM received"),
                }
                return;
            }
            Err(e) => warn!(error = %e, "cannot listen for SIGTERM"),
        }
    }
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "cannot listen for ctrl-c");
        std::future::pending::<()>().await;
    }
    info!("interrupt received");
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();
    let config = cli.controller_config()?;

    let client = kube::Client::try_default().await.context("building kube client")?;
    let primary = labeler_kubehub::resolve_resource(client.clone(), &cli.primary_gvk)
        .await
        .with_context(|| format!("resolving {}", cli.primary_gvk))?;
    let store = Arc::new(KubeStore::new(client.clone(), primary, &cli.field_manager));
    let reconciler = Arc::new(labeling::LabelDeployments::new(client.clone(), &cli.field_manager));
    let controller = Controller::new(config, store, reconciler)?;

    let (primary_tx, primary_rx) = controller.event_channel();
    let (secondary_tx, secondary_rx) = controller.event_channel();
    let shutdown = CancellationToken::new();

    info!(primary = %cli.primary_gvk, secondary = %cli.secondary_gvk, ns = ?cli.namespace, "setting up event handlers");
    let watchers = [
        tokio::spawn(supervise_watch(client.clone(), cli.target(&cli.primary_gvk, Role::Primary), primary_tx, shutdown.clone())),
        tokio::spawn(supervise_watch(client.clone(), cli.target(&cli.secondary_gvk, Role::Secondary), secondary_tx, shutdown.clone())),
    ];

    tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            wait_for_signal().await;
            shutdown.cancel();
        }
    });

    controller.run(primary_rx, secondary_rx, shutdown).await?;
    for w in watchers {
        w.abort();
    }
    info!("labeler stopped");
    Ok(())
}
