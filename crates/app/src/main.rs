#![forbid(unsafe_code)]

use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{ArgAction, Parser};
use fnview_api::InProcApi;
use fnview_core::{FunctionTarget, WatchFilter, WatchResource};
use fnview_kubehub::{KubeWatchSource, ResourceWatchClient};
use fnview_view::{FunctionView, ViewModel, ViewPhase};
use metrics::counter;
use metrics_exporter_prometheus::PrometheusBuilder;
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "fnview", version, about = "Live view of a function and its deployment rollout")]
struct Cli {
    /// Function name
    function: String,

    /// Namespace of the function
    #[arg(long = "namespace", short = 'n', env = "FNVIEW_NAMESPACE", default_value = "default")]
    namespace: String,

    /// apiVersion of the watched deployments
    #[arg(long = "deployment-api", env = "FNVIEW_DEPLOYMENT_API", default_value = "apps/v1")]
    deployment_api: String,

    /// apiVersion of the function resource
    #[arg(long = "function-api", env = "FNVIEW_FUNCTION_API", default_value = "kubeless.io/v1beta1")]
    function_api: String,

    /// Replace the function source with this file once the view is ready, then save
    #[arg(long = "source-file")]
    source_file: Option<PathBuf>,

    /// Delete the function once it is loaded
    #[arg(long = "delete", action = ArgAction::SetTrue, conflicts_with = "source_file")]
    delete: bool,

    /// Log filter directives
    #[arg(long = "log", env = "FNVIEW_LOG", default_value = "info")]
    log: String,

    /// Prometheus exporter listen address (host:port)
    #[arg(long = "metrics-addr", env = "FNVIEW_METRICS_ADDR")]
    metrics_addr: Option<SocketAddr>,
}

/// Install the fmt subscriber. Directives that do not parse fall back to `info`.
fn init_tracing(directives: &str) {
    let filter = EnvFilter::from_str(directives).unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).init();
}

/// Serve counters for Prometheus on `addr`, when configured. A failed install is logged and
/// the view runs without an exporter.
fn init_metrics(addr: Option<SocketAddr>) {
    let Some(addr) = addr else { return };
    match PrometheusBuilder::new().with_http_listener(addr).install() {
        Ok(()) => info!(%addr, "fnview: metrics exporter listening"),
        Err(e) => warn!(%addr, error = %e, "fnview: metrics exporter not installed"),
    }
}

fn status_line(view: &FunctionView) -> String {
    match view.render() {
        ViewModel::Loading => format!("{} • loading", view.target()),
        ViewModel::Ready(r) => {
            let stale = if r.deployment.stream_open { "" } else { " [stale]" };
            let dirty = if r.controls.save_enabled { " • unsaved edits" } else { "" };
            format!(
                "{}/{} • {} • {} • {}{}{}",
                r.function.namespace,
                r.function.name,
                r.function.runtime,
                r.deployment.name,
                r.deployment.rollout.summary(),
                stale,
                dirty
            )
        }
    }
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(&cli.log);
    init_metrics(cli.metrics_addr);

    // reject bad names before touching the cluster
    WatchFilter::for_function(&cli.namespace, &cli.function)?;
    let deployments = WatchResource::from_api_version(&cli.deployment_api, "Deployment", "deployments")?;
    let functions = WatchResource::from_api_version(&cli.function_api, "Function", "functions")?;
    let mut pending_source = match &cli.source_file {
        Some(path) => Some(std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?),
        None => None,
    };

    let client = fnview_kubehub::kube_client().await?;
    let source = Arc::new(KubeWatchSource::new(client.clone()));
    let watch = Arc::new(ResourceWatchClient::new(source).with_resource(deployments));
    let api = Arc::new(InProcApi::new(client, &functions));

    let target = FunctionTarget::new(cli.namespace.clone(), cli.function.clone());
    info!(function = %target, "fnview: starting");
    let mut view = FunctionView::new(target, api, watch);
    view.mount();

    let mut delete_pending = cli.delete;
    let mut last_line = String::new();
    let mut last_error: Option<String> = None;
    loop {
        tokio::select! {
            _ = signal::ctrl_c() => {
                info!("fnview: interrupted");
                break;
            }
            changed = view.process_next() => {
                if !changed {
                    continue;
                }
                counter!("fnview_view_changes", 1u64);
                if view.last_error() != last_error.as_deref() {
                    last_error = view.last_error().map(str::to_string);
                    if let Some(e) = &last_error {
                        warn!(error = %e, "fnview: view error");
                    }
                }
                if view.phase() == ViewPhase::AwaitingEntity {
                    if let Some(e) = &last_error {
                        anyhow::bail!("cannot load {}: {}", view.target(), e);
                    }
                }
                if delete_pending && view.entity().is_some() {
                    delete_pending = !view.delete();
                }
                if view.is_deleted() {
                    println!("{} • deleted", view.target());
                    break;
                }
                if view.phase() == ViewPhase::Live {
                    if let Some(text) = pending_source.take() {
                        view.edit(text);
                        if !view.save() {
                            warn!("fnview: save not sent");
                        }
                    }
                }
                let line = status_line(&view);
                if line != last_line {
                    println!("{}", line);
                    last_line = line;
                }
            }
        }
    }
    view.unmount();
    Ok(())
}
