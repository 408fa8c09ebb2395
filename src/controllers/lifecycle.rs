//! State machine plumbing shared by the instance and binding controllers.

use std::fmt::Debug;
use std::sync::Arc;

use kube::{Resource, ResourceExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::*;

use crate::reconcilers::ResourceManager;
use crate::resources::sfservicebindings::{SFServiceBinding, SFServiceBindingStatus};
use crate::resources::sfserviceinstances::{SFServiceInstance, SFServiceInstanceStatus};
use crate::resources::{
    state, Source, ERROR_COUNT_LABEL, INTEROPERATOR_FINALIZER, LAST_OPERATION_LABEL,
};
use crate::store::{get_typed, update_typed, ObjectStore};
use crate::{Error, Result};

/// An object whose lifecycle is driven by plan templates
pub trait Managed:
    Resource<DynamicType = ()> + Serialize + DeserializeOwned + Clone + Debug + Send + Sync + 'static
{
    /// Broker id used in user facing messages
    fn id(&self) -> String;

    fn current_state(&self) -> &str;

    fn set_state(&mut self, state: &str);

    fn applied_resources(&self) -> Vec<Source>;

    fn set_resources(&mut self, resources: Vec<Source>);

    fn set_failure(&mut self, error: String, description: String);
}

impl Managed for SFServiceInstance {
    fn id(&self) -> String {
        self.instance_id()
    }

    fn current_state(&self) -> &str {
        self.state()
    }

    fn set_state(&mut self, state: &str) {
        self.status
            .get_or_insert_with(SFServiceInstanceStatus::default)
            .state = state.to_string();
    }

    fn applied_resources(&self) -> Vec<Source> {
        self.resources()
    }

    fn set_resources(&mut self, resources: Vec<Source>) {
        self.status
            .get_or_insert_with(SFServiceInstanceStatus::default)
            .resources = resources;
    }

    fn set_failure(&mut self, error: String, description: String) {
        let status = self.status.get_or_insert_with(SFServiceInstanceStatus::default);
        status.error = error;
        status.description = description;
    }
}

impl Managed for SFServiceBinding {
    fn id(&self) -> String {
        self.binding_id()
    }

    fn current_state(&self) -> &str {
        self.state()
    }

    fn set_state(&mut self, state: &str) {
        self.status
            .get_or_insert_with(SFServiceBindingStatus::default)
            .state = state.to_string();
    }

    fn applied_resources(&self) -> Vec<Source> {
        self.resources()
    }

    fn set_resources(&mut self, resources: Vec<Source>) {
        self.status
            .get_or_insert_with(SFServiceBindingStatus::default)
            .resources = resources;
    }

    fn set_failure(&mut self, error: String, _description: String) {
        self.status
            .get_or_insert_with(SFServiceBindingStatus::default)
            .error = error;
    }
}

/// The operation last dispatched downstream, from the `state` label
pub fn last_operation<K: Resource>(obj: &K) -> &str {
    obj.labels()
        .get(LAST_OPERATION_LABEL)
        .map(String::as_str)
        .unwrap_or(state::IN_QUEUE)
}

/// Consecutive failed reconciliations, from the `error-count` label
pub fn error_count<K: Resource>(obj: &K) -> u32 {
    obj.labels()
        .get(ERROR_COUNT_LABEL)
        .and_then(|count| count.parse().ok())
        .unwrap_or_default()
}

pub fn has_finalizer<K: Resource>(obj: &K) -> bool {
    obj.finalizers().iter().any(|f| f == INTEROPERATOR_FINALIZER)
}

/// The state to act on. An object being deleted is deprovisioned unless a delete is in
/// flight or a delete already failed.
pub fn effective_state<K: Managed>(obj: &K) -> &str {
    let current = match obj.current_state() {
        "" => state::IN_QUEUE,
        current => current,
    };
    if obj.meta().deletion_timestamp.is_none() {
        return current;
    }
    let deleting = last_operation(obj) == state::DELETE;
    if deleting && (current == state::IN_PROGRESS || current == state::FAILED) {
        return current;
    }
    state::DELETE
}

/// What the controller should do after a pass
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// Nothing left to do until the object changes
    Settled,
    /// An operation is in flight, observe it again later
    Progressing,
    /// The object was forced into the failed state
    Failed(String),
}

/// Drives instances and bindings through their lifecycle
#[derive(Clone)]
pub struct Provisioner {
    /// Store holding instances, bindings and the catalog
    pub source: Arc<dyn ObjectStore>,
    /// Store the rendered resources are applied to
    pub target: Arc<dyn ObjectStore>,
    pub manager: ResourceManager,
    pub error_threshold: u32,
}

impl Provisioner {
    /// Re-reads the object, applies `mutate` and writes it back, retrying on conflicts.
    ///
    /// `mutate` returns whether it changed anything; unchanged objects are not written.
    /// Returns `None` when the object no longer exists.
    pub async fn write<K, F>(&self, name: &str, namespace: &str, mut mutate: F) -> Result<Option<K>>
    where
        K: Managed,
        F: FnMut(&mut K) -> Result<bool>,
    {
        let mut attempt = 0;
        loop {
            let Some(mut obj) = get_typed::<K>(self.source.as_ref(), name, namespace).await? else {
                return Ok(None);
            };
            if !mutate(&mut obj)? {
                return Ok(Some(obj));
            }
            match update_typed(self.source.as_ref(), &obj).await {
                Ok(updated) => return Ok(Some(updated)),
                Err(err) if err.is_conflict() && attempt < self.manager.conflict_retries() => {
                    attempt += 1;
                    debug!(name, attempt, "conflict writing {}, retrying", K::kind(&()));
                }
                Err(err) => return Err(err),
            }
        }
    }

    pub async fn ensure_finalizer<K: Managed>(&self, name: &str, namespace: &str) -> Result<()> {
        self.write::<K, _>(name, namespace, |obj| {
            if obj.meta().deletion_timestamp.is_some() || has_finalizer(obj) {
                return Ok(false);
            }
            obj.finalizers_mut().push(INTEROPERATOR_FINALIZER.to_string());
            Ok(true)
        })
        .await?;
        Ok(())
    }

    /// Records `resources` and, unless another operation was requested meanwhile, moves the
    /// object to `in progress` for `operation`
    pub async fn set_in_progress<K: Managed>(
        &self,
        name: &str,
        namespace: &str,
        operation: &str,
        resources: Vec<Source>,
    ) -> Result<()> {
        self.write::<K, _>(name, namespace, |obj| {
            if effective_state(obj) == operation {
                obj.set_state(state::IN_PROGRESS);
                obj.labels_mut()
                    .insert(LAST_OPERATION_LABEL.to_string(), operation.to_string());
            } else {
                info!(
                    operation,
                    current = obj.current_state(),
                    "state changed while reconciling, keeping it"
                );
            }
            obj.set_resources(resources.clone());
            Ok(true)
        })
        .await?;
        info!(name, operation, "in progress");
        Ok(())
    }

    pub async fn clear_error_count<K: Managed>(&self, name: &str, namespace: &str) -> Result<()> {
        self.write::<K, _>(name, namespace, |obj| {
            Ok(match obj.labels_mut().get_mut(ERROR_COUNT_LABEL) {
                Some(count) if count != "0" => {
                    *count = "0".to_string();
                    true
                }
                _ => false,
            })
        })
        .await?;
        Ok(())
    }

    /// Counts `err` against the object.
    ///
    /// Past the error threshold, or when the API server rejected a rendered resource as
    /// invalid, the object is marked failed and the error is absorbed. Otherwise the error
    /// is returned so the pass is retried.
    pub async fn handle_error<K: Managed>(&self, name: &str, namespace: &str, err: Error) -> Result<Outcome> {
        let mut failure: Option<String> = None;
        let threshold = self.error_threshold;
        let recorded = self
            .write::<K, _>(name, namespace, |obj| {
                let id = obj.id();
                if err.is_unprocessable() {
                    let description = format!("{}, Error code: 422", unprocessable_message(&err));
                    obj.set_state(state::FAILED);
                    obj.set_failure(
                        format!("StatusError encountered for {id}.\n{err}"),
                        description.clone(),
                    );
                    obj.labels_mut()
                        .insert(ERROR_COUNT_LABEL.to_string(), "0".to_string());
                    failure = Some(description);
                    return Ok(true);
                }

                let count = error_count(obj) + 1;
                if count > threshold {
                    let message = format!("Retry threshold reached for {id}.\n{err}");
                    obj.set_state(state::FAILED);
                    obj.set_failure(message.clone(), err.to_string());
                    obj.labels_mut()
                        .insert(ERROR_COUNT_LABEL.to_string(), "0".to_string());
                    failure = Some(message);
                } else {
                    obj.labels_mut()
                        .insert(ERROR_COUNT_LABEL.to_string(), count.to_string());
                    failure = None;
                }
                Ok(true)
            })
            .await;

        if let Err(write_err) = recorded {
            warn!(name, "failed to record reconcile error: {write_err}");
            return Err(err);
        }
        match failure {
            Some(message) => {
                error!(name, "{message}");
                Ok(Outcome::Failed(message))
            }
            None => Err(err),
        }
    }
}

/// Fails the precondition when the object left `in progress` while its status was computed
pub fn expect_in_progress<K: Managed>(obj: &K) -> Result<()> {
    if obj.current_state() == state::IN_PROGRESS {
        Ok(())
    } else {
        Err(Error::Precondition(format!(
            "{} {} is {}, not in progress",
            K::kind(&()),
            obj.name_any(),
            obj.current_state()
        )))
    }
}

fn unprocessable_message(err: &Error) -> String {
    match err {
        Error::KubeError(kube::Error::Api(resp)) if !resp.message.is_empty() => resp.message.clone(),
        _ => err.to_string(),
    }
}
