use crate::{
    apis::mongodb_types::{MongoDBBackup, MongoDBReplicaSet, MongoDBShardedCluster},
    backup, replicaset, sharded, Metrics,
};
use chrono::{DateTime, Utc};
use futures::stream::StreamExt;
use k8s_openapi::{
    api::core::v1::Pod,
    apimachinery::pkg::apis::meta::v1::{Condition, Time},
};
use kube::{
    api::{Api, ListParams, Patch, PatchParams},
    client::Client,
    runtime::{
        controller::{Action, Controller},
        events::{Recorder, Reporter},
        wait::Condition as WaitCondition,
        watcher::Config as watcherConfig,
    },
    Resource,
};
use serde::{de::DeserializeOwned, Serialize};
use std::{fmt::Debug, sync::Arc};
use tokio::{sync::RwLock, time::Duration};
use tracing::*;

/// Requeue cadence while waiting on pod readiness or a MongoDB-level
/// operation that usually resolves within seconds.
pub const SHORT_REQUEUE_SECONDS: u64 = 10;
/// Steady-state heartbeat cadence.
pub const REQUEUE_SECONDS: u64 = 30;

// Context for our reconcilers
#[derive(Clone)]
pub struct Context {
    /// Kubernetes client
    pub client: Client,
    /// Diagnostics read by the web server
    pub diagnostics: Arc<RwLock<Diagnostics>>,
    /// Prometheus metrics
    pub metrics: Metrics,
}

pub fn is_pod_ready() -> impl WaitCondition<Pod> + 'static {
    move |obj: Option<&Pod>| {
        if let Some(pod) = &obj {
            if let Some(status) = &pod.status {
                if let Some(conds) = &status.conditions {
                    if let Some(pcond) = conds.iter().find(|c| c.type_ == "ContainersReady") {
                        return pcond.status == "True";
                    }
                }
            }
        }
        false
    }
}

/// Merge-patch the status subresource. Failures map to a short requeue so
/// callers can use `?` inside a reconcile.
pub async fn patch_status_merge<K>(
    api: &Api<K>,
    name: &str,
    patch: serde_json::Value,
) -> Result<(), Action>
where
    K: Resource + Clone + DeserializeOwned + Debug,
{
    let pp = PatchParams {
        field_manager: Some("mongodb-operator".to_string()),
        ..PatchParams::default()
    };
    let patch_status = Patch::Merge(patch);
    match api.patch_status(name, &pp, &patch_status).await {
        Ok(_) => {
            debug!("Successfully updated status for {}", name);
            Ok(())
        }
        Err(e) => {
            error!("Error updating status for {}: {:?}", name, e);
            Err(Action::requeue(Duration::from_secs(SHORT_REQUEUE_SECONDS)))
        }
    }
}

/// A status condition stamped with the observed generation.
pub fn build_condition(
    type_: &str,
    healthy: bool,
    reason: &str,
    message: &str,
    observed_generation: Option<i64>,
) -> Condition {
    Condition {
        last_transition_time: Time(Utc::now()),
        message: message.to_string(),
        observed_generation,
        reason: reason.to_string(),
        status: if healthy { "True" } else { "False" }.to_string(),
        type_: type_.to_string(),
    }
}

/// Diagnostics to be exposed by the web server
#[derive(Clone, Serialize)]
pub struct Diagnostics {
    pub last_event: DateTime<Utc>,
    #[serde(skip)]
    pub reporter: Reporter,
}
impl Default for Diagnostics {
    fn default() -> Self {
        Self {
            last_event: Utc::now(),
            reporter: "mongodb-operator".into(),
        }
    }
}
impl Diagnostics {
    pub fn recorder<K>(&self, client: Client, obj: &K) -> Recorder
    where
        K: Resource<DynamicType = ()>,
    {
        Recorder::new(client, self.reporter.clone(), obj.object_ref(&()))
    }
}

/// State shared between the controllers and the web server
#[derive(Clone, Default)]
pub struct State {
    /// Diagnostics populated by the reconcilers
    diagnostics: Arc<RwLock<Diagnostics>>,
    /// Metrics registry
    registry: prometheus::Registry,
}

/// State wrapper around the controller outputs for the web server
impl State {
    /// Metrics getter
    pub fn metrics(&self) -> Vec<prometheus::proto::MetricFamily> {
        self.registry.gather()
    }

    /// State getter
    pub async fn diagnostics(&self) -> Diagnostics {
        self.diagnostics.read().await.clone()
    }

    // Create a Controller Context that can update State
    pub fn create_context(&self, client: Client) -> Arc<Context> {
        Arc::new(Context {
            client,
            metrics: Metrics::default().register(&self.registry).unwrap(),
            diagnostics: self.diagnostics.clone(),
        })
    }
}

async fn require_crd<K>(api: &Api<K>, kind: &str)
where
    K: Resource + Clone + DeserializeOwned + Debug,
{
    if let Err(e) = api.list(&ListParams::default().limit(1)).await {
        error!("{kind} CRD is not queryable; {e:?}. Is the CRD installed?");
        info!("Installation: cargo run --bin crdgen | kubectl apply -f -");
        std::process::exit(1);
    }
}

/// Initialize the three controllers and block until shutdown (given the
/// CRDs are installed)
pub async fn run(state: State) {
    let client = match Client::try_default().await {
        Ok(client) => client,
        Err(_) => panic!("Please configure your Kubernetes Context"),
    };

    let replica_sets = Api::<MongoDBReplicaSet>::all(client.clone());
    let sharded_clusters = Api::<MongoDBShardedCluster>::all(client.clone());
    let backups = Api::<MongoDBBackup>::all(client.clone());
    require_crd(&replica_sets, "MongoDBReplicaSet").await;
    require_crd(&sharded_clusters, "MongoDBShardedCluster").await;
    require_crd(&backups, "MongoDBBackup").await;

    let ctx = state.create_context(client);

    let replica_set_controller =
        Controller::new(replica_sets, watcherConfig::default().any_semantic())
            .shutdown_on_signal()
            .run(replicaset::reconcile, replicaset::error_policy, ctx.clone())
            .filter_map(|x| async move { std::result::Result::ok(x) })
            .for_each(|_| futures::future::ready(()));

    let sharded_cluster_controller =
        Controller::new(sharded_clusters, watcherConfig::default().any_semantic())
            .shutdown_on_signal()
            .run(sharded::reconcile, sharded::error_policy, ctx.clone())
            .filter_map(|x| async move { std::result::Result::ok(x) })
            .for_each(|_| futures::future::ready(()));

    let backup_controller = Controller::new(backups, watcherConfig::default().any_semantic())
        .shutdown_on_signal()
        .run(backup::reconcile, backup::error_policy, ctx)
        .filter_map(|x| async move { std::result::Result::ok(x) })
        .for_each(|_| futures::future::ready(()));

    tokio::join!(
        replica_set_controller,
        sharded_cluster_controller,
        backup_controller
    );
}
