use std::sync::Arc;

use chrono::{DateTime, Utc};
use kube::api::{Api, DynamicObject};
use kube::runtime::controller::{Action, Controller};
use kube::runtime::events::{Event, EventType, Recorder};
use kube::{Client, Resource};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::RwLock;
use tokio::time::Duration;
use tracing::*;

use crate::config::InteroperatorConfig;
use crate::reconcilers::ResourceManager;
use crate::renderer::Registry;
use crate::resources::ApiVersionKind;
use crate::store::KubeStore;
use crate::{Error, Metrics, Result};

pub mod lifecycle;
pub mod sfservicebinding;
pub mod sfserviceinstance;

use lifecycle::{Outcome, Provisioner};

/// Requeue interval while an operation is in flight
const PROGRESS_REQUEUE: Duration = Duration::from_secs(30);

/// Name reported on Kubernetes events
const REPORTER: &str = "interoperator";

/// Diagnostics to be exposed by the web server
#[derive(Clone, Serialize)]
pub struct Diagnostics {
    pub last_event: DateTime<Utc>,
}

impl Default for Diagnostics {
    fn default() -> Self {
        Self {
            last_event: Utc::now(),
        }
    }
}

/// Command line overrides for the config map values
#[derive(Clone, Debug, Default)]
pub struct Overrides {
    pub instance_workers: Option<u16>,
    pub binding_workers: Option<u16>,
    pub error_threshold: Option<u32>,
}

impl Overrides {
    pub fn apply(&self, mut config: InteroperatorConfig) -> InteroperatorConfig {
        if let Some(workers) = self.instance_workers {
            config.instance_worker_count = workers;
        }
        if let Some(workers) = self.binding_workers {
            config.binding_worker_count = workers;
        }
        if let Some(threshold) = self.error_threshold {
            config.error_threshold = threshold;
        }
        config.with_defaults()
    }
}

/// State shared between the controllers and the web server
#[derive(Clone)]
pub struct State {
    /// Diagnostics populated by the reconcilers
    pub diagnostics: Arc<RwLock<Diagnostics>>,
    /// Metrics registry
    pub registry: prometheus::Registry,
    /// Namespace holding SFService and SFPlan objects and the config map
    namespace: String,
    /// Name of the config map holding the operator configuration
    config_map: String,
    overrides: Overrides,
}

/// State wrapper around the controller outputs for the web server
impl State {
    pub fn new(namespace: String, config_map: String, overrides: Overrides) -> Self {
        Self {
            diagnostics: Arc::new(RwLock::new(Diagnostics::default())),
            registry: prometheus::Registry::default(),
            namespace,
            config_map,
            overrides,
        }
    }

    /// Metrics getter
    pub fn metrics(&self) -> Vec<prometheus::proto::MetricFamily> {
        self.registry.gather()
    }

    /// State getter
    pub async fn diagnostics(&self) -> Diagnostics {
        self.diagnostics.read().await.clone()
    }
}

/// Initialize the controllers and shared state (given the crds are installed)
pub async fn run(state: State) {
    let client = Client::try_default()
        .await
        .expect("failed to create kube Client");

    let config = match InteroperatorConfig::load(client.clone(), &state.namespace, &state.config_map).await {
        Ok(config) => state.overrides.apply(config),
        Err(e) => {
            error!("Could not load config map {}: {e:?}", state.config_map);
            std::process::exit(1);
        }
    };
    info!(?config, "starting controllers");

    let metrics = Metrics::default()
        .register(&state.registry)
        .expect("failed to register metrics");
    let store = Arc::new(KubeStore::new(client.clone()));
    let provisioner = Provisioner {
        source: store.clone(),
        target: store.clone(),
        manager: ResourceManager::new(Registry::default(), &config, &state.namespace),
        error_threshold: config.error_threshold,
    };

    tokio::join!(
        sfserviceinstance::run(
            client.clone(),
            metrics.clone(),
            state.clone(),
            provisioner.clone(),
            store.clone(),
            config.clone(),
        ),
        sfservicebinding::run(client, metrics, state, provisioner, store, config),
    );
}

/// Registers an owned-object watch for every kind in `watch_list` that can be discovered
async fn owns_watch_list<K>(
    mut controller: Controller<K>,
    client: &Client,
    store: &KubeStore,
    watch_list: &[ApiVersionKind],
) -> Controller<K>
where
    K: Resource<DynamicType = ()> + Clone + DeserializeOwned + std::fmt::Debug + Send + Sync + 'static,
{
    for watched in watch_list {
        match store.api_resource(&watched.api_version, &watched.kind).await {
            Ok(resource) => {
                info!(api_version = %watched.api_version, kind = %watched.kind, "watching owned objects");
                let api = Api::<DynamicObject>::all_with(client.clone(), &resource);
                controller = controller.owns_with(api, resource, Default::default());
            }
            Err(e) => warn!(
                api_version = %watched.api_version,
                kind = %watched.kind,
                "not watching unknown kind: {e}"
            ),
        }
    }
    controller
}

/// Turns the outcome of a pass into the next controller action
async fn settle<K>(recorder: &Recorder, metrics: &Metrics, obj: &K, outcome: Outcome) -> Result<Action>
where
    K: Resource<DynamicType = ()>,
{
    match outcome {
        Outcome::Settled => Ok(Action::await_change()),
        Outcome::Progressing => Ok(Action::requeue(PROGRESS_REQUEUE)),
        Outcome::Failed(message) => {
            metrics.terminal_failure::<K>();
            recorder
                .publish(
                    &Event {
                        type_: EventType::Warning,
                        reason: "RetryThresholdReached".into(),
                        note: Some(message),
                        action: "Reconcile".into(),
                        secondary: None,
                    },
                    &obj.object_ref(&()),
                )
                .await?;
            Ok(Action::await_change())
        }
    }
}

/// Records a failed pass as an event and a metric
async fn report_failure<K>(recorder: &Recorder, metrics: &Metrics, obj: &K, err: Error) -> Result<Action>
where
    K: Resource<DynamicType = ()>,
{
    warn!("reconcile failed: {:?}", err);
    recorder
        .publish(
            &Event {
                type_: EventType::Warning,
                reason: "FailedReconcile".into(),
                note: Some(err.to_string()),
                action: "Reconcile".into(),
                secondary: None,
            },
            &obj.object_ref(&()),
        )
        .await?;
    metrics.reconcile_failure(obj, &err);
    Err(err)
}

fn error_policy<K, C>(_obj: Arc<K>, _error: &Error, _ctx: C) -> Action {
    Action::requeue(Duration::from_secs(30))
}
