use std::sync::Arc;

use chrono::Utc;
use futures::StreamExt;
use kube::{
    api::{Api, ListParams, ResourceExt},
    client::Client,
    runtime::{
        controller::{self, Action, Controller},
        events::Recorder,
        watcher::Config,
    },
};
use tokio::sync::RwLock;
use tracing::*;

use crate::config::InteroperatorConfig;
use crate::controllers::lifecycle::Provisioner;
use crate::controllers::{
    error_policy, owns_watch_list, report_failure, settle, Diagnostics, State, REPORTER,
};
use crate::resources::sfservicebindings::SFServiceBinding;
use crate::store::KubeStore;
use crate::{telemetry, Metrics, Result};

// Context for our reconciler
#[derive(Clone)]
pub(super) struct Context {
    /// Kubernetes event recorder
    pub recorder: Recorder,
    /// Diagnostics read by the web server
    pub diagnostics: Arc<RwLock<Diagnostics>>,
    /// Prometheus metrics
    pub metrics: Metrics,
    pub provisioner: Provisioner,
}

#[instrument(skip(ctx, sb), fields(trace_id))]
async fn reconcile(sb: Arc<SFServiceBinding>, ctx: Arc<Context>) -> Result<Action> {
    if let Some(trace_id) = telemetry::get_trace_id() {
        Span::current().record("trace_id", field::display(&trace_id));
    }
    let _timer = ctx.metrics.count_and_measure::<SFServiceBinding>();
    ctx.diagnostics.write().await.last_event = Utc::now();

    let name = sb.name_any();
    let namespace = sb.namespace().unwrap_or_default();
    info!("Reconciling SFServiceBinding \"{name}\" in {namespace}");
    match ctx.provisioner.reconcile_binding(&name, &namespace).await {
        Ok(outcome) => settle(&ctx.recorder, &ctx.metrics, sb.as_ref(), outcome).await,
        Err(err) => report_failure(&ctx.recorder, &ctx.metrics, sb.as_ref(), err).await,
    }
}

/// Runs the SFServiceBinding controller until shutdown
pub async fn run(
    client: Client,
    metrics: Metrics,
    state: State,
    provisioner: Provisioner,
    store: Arc<KubeStore>,
    config: InteroperatorConfig,
) {
    let bindings = Api::<SFServiceBinding>::all(client.clone());
    if let Err(e) = bindings.list(&ListParams::default().limit(1)).await {
        error!("SFServiceBinding is not queryable; {e:?}. Is the CRD installed?");
        std::process::exit(1);
    }

    let controller = Controller::new(bindings, Config::default())
        .with_config(controller::Config::default().concurrency(config.binding_worker_count))
        .shutdown_on_signal();
    let controller = owns_watch_list(
        controller,
        &client,
        &store,
        &config.binding_controller_watch_list,
    )
    .await;

    let context = Arc::new(Context {
        recorder: Recorder::new(client, REPORTER.into()),
        diagnostics: state.diagnostics.clone(),
        metrics,
        provisioner,
    });
    controller
        .run(reconcile, error_policy, context)
        .filter_map(|x| async move { std::result::Result::ok(x) })
        .for_each(|_| futures::future::ready(()))
        .await;
}
