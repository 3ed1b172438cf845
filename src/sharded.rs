use crate::{
    apis::mongodb_types::{ClusterPhase, ComponentStatus, MongoDBShardedCluster, ShardStatus},
    auth::{AuthManager, Credentials},
    configmap::{reconcile_mongos_configmap, reconcile_scripts_configmap},
    controller::{
        build_condition, is_pod_ready, patch_status_merge, Context, REQUEUE_SECONDS,
        SHORT_REQUEUE_SECONDS,
    },
    deployment::{reconcile_mongos_deployment, MONGOS_CONTAINER},
    exec::statefulset_fqdns,
    replset::{replset_config, ReplsetManager, CONFIG_SERVER_PORT, MONGODB_PORT, SHARD_PORT},
    secret::{admin_credentials, reconcile_keyfile_secret},
    service::{reconcile_headless_service, reconcile_mongos_service},
    sharding::{shard_connection_string, ShardManager},
    statefulset::{
        config_server_statefulset, reconcile_statefulset, shard_statefulset, MONGODB_CONTAINER,
    },
    telemetry, Error, Result,
};
use chrono::Utc;
use k8s_openapi::api::{
    apps::v1::{Deployment, StatefulSet},
    core::v1::Pod,
};
use kube::{
    api::{Api, ListParams, ResourceExt},
    runtime::{
        controller::Action,
        events::{Event, EventType},
        finalizer::{finalizer, Event as Finalizer},
        wait::Condition as WaitCondition,
    },
    Resource,
};
use serde_json::json;
use std::sync::Arc;
use tokio::time::Duration;
use tracing::*;

pub static SHARDED_CLUSTER_FINALIZER: &str = "mongodbshardedclusters.mongodb.keiailab.com";

const API_VERSION: &str = "mongodb.keiailab.com/v1alpha1";
const KIND: &str = "MongoDBShardedCluster";

#[instrument(skip(ctx, cluster), fields(trace_id))]
pub async fn reconcile(cluster: Arc<MongoDBShardedCluster>, ctx: Arc<Context>) -> Result<Action> {
    let trace_id = telemetry::get_trace_id();
    Span::current().record("trace_id", &field::display(&trace_id));
    let _timer = ctx.metrics.count_and_measure();
    ctx.diagnostics.write().await.last_event = Utc::now();
    let ns = cluster.namespace().unwrap(); // cluster is namespace scoped
    let api: Api<MongoDBShardedCluster> = Api::namespaced(ctx.client.clone(), &ns);

    info!(
        "Reconciling MongoDBShardedCluster \"{}\" in {}",
        cluster.name_any(),
        ns
    );
    finalizer(&api, SHARDED_CLUSTER_FINALIZER, cluster, |event| async {
        match event {
            Finalizer::Apply(cluster) => match cluster.reconcile(ctx.clone()).await {
                Ok(action) => Ok(action),
                Err(requeue_action) => Ok(requeue_action),
            },
            Finalizer::Cleanup(cluster) => cluster.cleanup(ctx.clone()).await,
        }
    })
    .await
    .map_err(|e| Error::FinalizerError(Box::new(e)))
}

pub fn error_policy(
    cluster: Arc<MongoDBShardedCluster>,
    error: &Error,
    ctx: Arc<Context>,
) -> Action {
    warn!("reconcile failed: {:?}", error);
    ctx.metrics.reconcile_failure(cluster.as_ref(), error);
    Action::requeue(Duration::from_secs(5 * 60))
}

fn short_requeue() -> Action {
    Action::requeue(Duration::from_secs(SHORT_REQUEUE_SECONDS))
}

/// Resize a progress array to the desired shard count, keeping existing
/// entries. Scale-out extends with `false`; scale-down forgets the
/// removed tail (the workloads it tracked become orphans, deliberately).
fn resize_preserving(current: &[bool], count: usize) -> Vec<bool> {
    let mut resized = vec![false; count];
    for (i, value) in current.iter().take(count).enumerate() {
        resized[i] = *value;
    }
    resized
}

fn component_phase(ready: i32, total: i32) -> ClusterPhase {
    if total > 0 && ready >= total {
        ClusterPhase::Running
    } else {
        ClusterPhase::Initializing
    }
}

#[allow(clippy::too_many_arguments)]
fn compute_phase(
    cfg: &ComponentStatus,
    shards: &[ShardStatus],
    mongos: &ComponentStatus,
    cfg_initialized: bool,
    shards_initialized: &[bool],
    shards_added: &[bool],
    admin_created: bool,
) -> ClusterPhase {
    let all_ready = cfg.ready == cfg.total
        && mongos.ready == mongos.total
        && shards.iter().all(|s| s.ready == s.total);
    let all_initialized = cfg_initialized
        && shards_initialized.iter().all(|b| *b)
        && shards_added.iter().all(|b| *b)
        && admin_created;
    if all_ready && all_initialized {
        ClusterPhase::Running
    } else {
        ClusterPhase::Initializing
    }
}

impl MongoDBShardedCluster {
    // Reconcile (for non-finalizer related changes)
    async fn reconcile(&self, ctx: Arc<Context>) -> Result<Action, Action> {
        let client = ctx.client.clone();
        let ns = self.namespace().unwrap();
        let name = self.name_any();
        let api: Api<MongoDBShardedCluster> = Api::namespaced(client.clone(), &ns);
        let status = self.status.clone().unwrap_or_default();
        let oref = self
            .controller_owner_ref(&())
            .expect("MongoDBShardedCluster has metadata for an owner reference");
        let shard_count = self.spec.shards.count;

        if status.phase == ClusterPhase::Pending {
            self.patch_status(&api, json!({"phase": ClusterPhase::Initializing}))
                .await?;
        }

        // 1. Keyfile, shared by every process in the cluster. Create-only.
        if let Err(e) = reconcile_keyfile_secret(
            client.clone(),
            &self.keyfile_secret_name(),
            &name,
            &ns,
            oref.clone(),
        )
        .await
        {
            return Err(self.fail(ctx.clone(), &api, "keyfile-secret", &e).await);
        }
        if let Err(e) = reconcile_scripts_configmap(
            client.clone(),
            &self.scripts_configmap_name(),
            &name,
            &ns,
            oref.clone(),
        )
        .await
        {
            return Err(self.fail(ctx.clone(), &api, "scripts-configmap", &e).await);
        }

        // 2. Config servers
        if let Err(e) = reconcile_headless_service(
            client.clone(),
            &name,
            &ns,
            &self.config_server_name(),
            "config-server",
            CONFIG_SERVER_PORT,
            oref.clone(),
        )
        .await
        {
            return Err(self.fail(ctx.clone(), &api, "config-server-service", &e).await);
        }
        if let Err(e) = reconcile_statefulset(
            client.clone(),
            &ns,
            config_server_statefulset(self, oref.clone()),
        )
        .await
        {
            return Err(self.fail(ctx.clone(), &api, "config-server-statefulset", &e).await);
        }

        // 3. Gate: config servers ready
        let sts_api: Api<StatefulSet> = Api::namespaced(client.clone(), &ns);
        let cfg_ready = ready_replicas(&sts_api, &self.config_server_name()).await;
        let cfg_status = ComponentStatus {
            ready: cfg_ready,
            total: self.spec.configServer.members,
            phase: component_phase(cfg_ready, self.spec.configServer.members),
        };
        if cfg_ready < self.spec.configServer.members {
            debug!(
                "Waiting for config servers of {name}: {cfg_ready}/{}",
                self.spec.configServer.members
            );
            self.patch_status(&api, json!({"configServer": cfg_status}))
                .await?;
            return Ok(short_requeue());
        }

        // 4. Shard workloads
        for i in 0..shard_count {
            if let Err(e) = reconcile_headless_service(
                client.clone(),
                &name,
                &ns,
                &self.shard_name(i),
                "shard",
                SHARD_PORT,
                oref.clone(),
            )
            .await
            {
                return Err(self.fail(ctx.clone(), &api, "shard-service", &e).await);
            }
            if let Err(e) = reconcile_statefulset(
                client.clone(),
                &ns,
                shard_statefulset(self, i, oref.clone()),
            )
            .await
            {
                return Err(self.fail(ctx.clone(), &api, "shard-statefulset", &e).await);
            }
        }

        // 5. Gate: every shard fully ready
        let mut shard_statuses = Vec::with_capacity(shard_count as usize);
        for i in 0..shard_count {
            let ready = ready_replicas(&sts_api, &self.shard_name(i)).await;
            shard_statuses.push(ShardStatus {
                name: self.shard_name(i),
                ready,
                total: self.spec.shards.membersPerShard,
                phase: component_phase(ready, self.spec.shards.membersPerShard),
            });
        }
        if shard_statuses
            .iter()
            .any(|s| s.ready < self.spec.shards.membersPerShard)
        {
            debug!("Waiting for shard members of {name}");
            self.patch_status(&api, json!({"shards": shard_statuses}))
                .await?;
            return Ok(short_requeue());
        }

        // 6. Routers
        if let Err(e) = reconcile_mongos_configmap(client.clone(), self, oref.clone()).await {
            return Err(self.fail(ctx.clone(), &api, "mongos-configmap", &e).await);
        }
        if let Err(e) = reconcile_mongos_service(client.clone(), self, oref.clone()).await {
            return Err(self.fail(ctx.clone(), &api, "mongos-service", &e).await);
        }
        if let Err(e) = reconcile_mongos_deployment(client.clone(), self, oref.clone()).await {
            return Err(self.fail(ctx.clone(), &api, "mongos-deployment", &e).await);
        }

        // 7. Config-server replica set
        let mut cfg_initialized = status.configServerInitialized;
        if !cfg_initialized {
            let replset =
                ReplsetManager::new(client.clone(), &ns, MONGODB_CONTAINER, CONFIG_SERVER_PORT);
            let pod0 = format!("{}-0", self.config_server_name());
            match replset.is_initialized(&pod0, None).await {
                Ok(true) => {
                    self.patch_status(&api, json!({"configServerInitialized": true}))
                        .await?;
                    cfg_initialized = true;
                }
                Ok(false) => {
                    let config = replset_config(
                        &self.config_server_name(),
                        &self.config_server_name(),
                        &self.config_server_headless_service_name(),
                        &ns,
                        self.spec.configServer.members,
                        CONFIG_SERVER_PORT,
                    )
                    .with_configsvr();
                    match replset.initiate(&pod0, None, &config).await {
                        Ok(()) => {
                            info!("Initiated config-server replica set for {name}");
                            self.patch_status(&api, json!({"configServerInitialized": true}))
                                .await?;
                            cfg_initialized = true;
                        }
                        Err(e) => {
                            warn!("Config-server initiate for {name} did not succeed yet: {e}");
                            return Ok(short_requeue());
                        }
                    }
                }
                Err(e) => {
                    warn!("Could not probe config-server state of {name}: {e}");
                    return Ok(short_requeue());
                }
            }
        }

        // 8. Per-shard replica sets. A failing shard does not block the
        // others in the same pass; it is retried on the next one.
        let mut shards_initialized =
            resize_preserving(&status.shardsInitialized, shard_count as usize);
        if shards_initialized.len() != status.shardsInitialized.len() {
            self.patch_status(&api, json!({"shardsInitialized": &shards_initialized}))
                .await?;
        }
        let shard_replset = ReplsetManager::new(client.clone(), &ns, MONGODB_CONTAINER, SHARD_PORT);
        let mut initialized_changed = false;
        for i in 0..shard_count {
            let idx = i as usize;
            if shards_initialized[idx] {
                continue;
            }
            let shard = self.shard_name(i);
            let pod0 = format!("{shard}-0");
            let initiated = match shard_replset.is_initialized(&pod0, None).await {
                Ok(true) => true,
                Ok(false) => {
                    let config = replset_config(
                        &shard,
                        &shard,
                        &self.shard_headless_service_name(i),
                        &ns,
                        self.spec.shards.membersPerShard,
                        SHARD_PORT,
                    );
                    match shard_replset.initiate(&pod0, None, &config).await {
                        Ok(()) => {
                            info!("Initiated replica set of shard {shard}");
                            true
                        }
                        Err(e) => {
                            warn!("Initiate of shard {shard} did not succeed yet: {e}");
                            false
                        }
                    }
                }
                Err(e) => {
                    warn!("Could not probe shard {shard}: {e}");
                    false
                }
            };
            if initiated {
                shards_initialized[idx] = true;
                initialized_changed = true;
            }
        }
        if initialized_changed {
            self.patch_status(&api, json!({"shardsInitialized": &shards_initialized}))
                .await?;
        }

        // 9. Gate: at least one router serving
        let deployment_api: Api<Deployment> = Api::namespaced(client.clone(), &ns);
        let mongos_ready = deployment_ready_replicas(&deployment_api, &self.mongos_name()).await;
        let mongos_status = ComponentStatus {
            ready: mongos_ready,
            total: self.spec.mongos.replicas,
            phase: component_phase(mongos_ready, self.spec.mongos.replicas),
        };
        if mongos_ready < 1 {
            debug!("Waiting for a ready mongos of {name}");
            self.patch_status(&api, json!({"mongos": mongos_status}))
                .await?;
            return Ok(short_requeue());
        }

        let router = match self.router_pod(ctx.clone()).await {
            Ok(Some(router)) => router,
            Ok(None) => {
                debug!("No ready mongos pod listed for {name}");
                return Ok(short_requeue());
            }
            Err(e) => {
                warn!("Could not list mongos pods of {name}: {e}");
                return Ok(short_requeue());
            }
        };

        // 10. Admin user, created through the router so it lands on the
        // config servers.
        let admin = match admin_credentials(
            client.clone(),
            &ns,
            &self.spec.auth.adminCredentialsSecretRef.name,
        )
        .await
        {
            Ok(admin) => admin,
            Err(e) => {
                warn!("Admin credentials for {name} not readable: {e}");
                return Ok(short_requeue());
            }
        };
        let mut admin_created = status.adminUserCreated;
        if !admin_created {
            let auth = AuthManager::new(client.clone(), &ns, MONGOS_CONTAINER, MONGODB_PORT);
            let exists = auth
                .user_exists(&router, None, "admin", &admin.username)
                .await
                .unwrap_or(false);
            if !exists {
                if let Err(e) = auth.create_admin_user(&router, &admin).await {
                    warn!("Admin user creation via {router} did not succeed yet: {e}");
                    return Ok(short_requeue());
                }
                info!("Created admin user for {name} via {router}");
            }
            self.patch_status(&api, json!({"adminUserCreated": true}))
                .await?;
            admin_created = true;
        }

        // 11. Shard registration, only once every shard replica set exists.
        let mut shards_added = resize_preserving(&status.shardsAdded, shard_count as usize);
        if shards_added.len() != status.shardsAdded.len() {
            self.patch_status(&api, json!({"shardsAdded": &shards_added}))
                .await?;
        }
        if !shards_initialized.iter().all(|b| *b) {
            debug!("Not all shards of {name} initialized yet; registration deferred");
            return Ok(short_requeue());
        }
        let mut added_changed = false;
        for i in 0..shard_count {
            let idx = i as usize;
            if shards_added[idx] {
                continue;
            }
            if let Err(e) = self
                .register_shard(ctx.clone(), &router, &admin, i)
                .await
            {
                warn!("Registering shard {} did not succeed yet: {e}", self.shard_name(i));
                continue;
            }
            shards_added[idx] = true;
            added_changed = true;
        }
        if added_changed {
            self.patch_status(&api, json!({"shardsAdded": &shards_added}))
                .await?;
        }

        // 12. Aggregate
        let phase = compute_phase(
            &cfg_status,
            &shard_statuses,
            &mongos_status,
            cfg_initialized,
            &shards_initialized,
            &shards_added,
            admin_created,
        );
        let generation = self.metadata.generation;
        let all_added = shards_added.iter().all(|b| *b);
        let conditions = vec![
            build_condition(
                "Ready",
                phase == ClusterPhase::Running,
                if phase == ClusterPhase::Running {
                    "AllComponentsReady"
                } else {
                    "ComponentsNotReady"
                },
                &format!(
                    "config-server {cfg_ready}/{}, mongos {mongos_ready}/{}",
                    self.spec.configServer.members, self.spec.mongos.replicas
                ),
                generation,
            ),
            build_condition(
                "ConfigServerInitialized",
                cfg_initialized,
                if cfg_initialized { "Initialized" } else { "NotInitialized" },
                &self.config_server_name(),
                generation,
            ),
            build_condition(
                "ShardsRegistered",
                all_added,
                if all_added { "AllShardsAdded" } else { "ShardsPending" },
                &format!(
                    "{}/{} shards registered",
                    shards_added.iter().filter(|b| **b).count(),
                    shard_count
                ),
                generation,
            ),
            build_condition(
                "AuthenticationReady",
                admin_created,
                if admin_created { "AdminUserCreated" } else { "AdminUserPending" },
                "admin user in the admin database",
                generation,
            ),
        ];
        let connection_uri = format!(
            "mongodb://{}.{ns}.svc.cluster.local:{MONGODB_PORT}",
            self.mongos_name()
        );
        self.patch_status(
            &api,
            json!({
                "phase": phase,
                "configServer": cfg_status,
                "mongos": mongos_status,
                "shards": shard_statuses,
                "configServerInitialized": cfg_initialized,
                "shardsInitialized": shards_initialized,
                "shardsAdded": shards_added,
                "adminUserCreated": admin_created,
                "connectionURI": connection_uri,
                "observedGeneration": generation,
                "conditions": conditions,
            }),
        )
        .await?;

        Ok(Action::requeue(Duration::from_secs(REQUEUE_SECONDS)))
    }

    // Finalizer cleanup (the object is being deleted; children are
    // garbage-collected through their owner references)
    async fn cleanup(&self, ctx: Arc<Context>) -> Result<Action> {
        let recorder = ctx
            .diagnostics
            .read()
            .await
            .recorder(ctx.client.clone(), self);
        recorder
            .publish(Event {
                type_: EventType::Normal,
                reason: "DeleteMongoDBShardedCluster".into(),
                note: Some(format!("Delete `{}`", self.name_any())),
                action: "Reconciling".into(),
                secondary: None,
            })
            .await
            .map_err(Error::KubeError)?;
        Ok(Action::await_change())
    }

    /// First mongos pod that reports ready; exec targets need a concrete
    /// pod, not the deployment.
    async fn router_pod(&self, ctx: Arc<Context>) -> Result<Option<String>> {
        let ns = self.namespace().unwrap();
        let pods: Api<Pod> = Api::namespaced(ctx.client.clone(), &ns);
        let selector = format!(
            "app.kubernetes.io/instance={},app.kubernetes.io/component=mongos",
            self.name_any()
        );
        let pod_list = pods
            .list(&ListParams::default().labels(&selector))
            .await
            .map_err(Error::KubeError)?;
        Ok(pod_list
            .items
            .iter()
            .find(|pod| is_pod_ready().matches_object(Some(pod)))
            .and_then(|pod| pod.metadata.name.clone()))
    }

    async fn register_shard(
        &self,
        ctx: Arc<Context>,
        router: &str,
        admin: &Credentials,
        index: i32,
    ) -> Result<()> {
        let ns = self.namespace().unwrap();
        let shard = self.shard_name(index);
        let shards = ShardManager::new(ctx.client.clone(), &ns, MONGOS_CONTAINER, MONGODB_PORT);
        if shards.is_shard_added(router, admin, &shard).await? {
            return Ok(());
        }
        let hosts = statefulset_fqdns(
            &shard,
            &self.shard_headless_service_name(index),
            &ns,
            self.spec.shards.membersPerShard,
            SHARD_PORT,
        );
        let connection_string = shard_connection_string(&shard, &hosts);
        shards.add_shard(router, admin, &connection_string).await
    }

    async fn patch_status(
        &self,
        api: &Api<MongoDBShardedCluster>,
        status: serde_json::Value,
    ) -> Result<(), Action> {
        let patch = json!({
            "apiVersion": API_VERSION,
            "kind": KIND,
            "status": status,
        });
        patch_status_merge(api, &self.name_any(), patch).await
    }

    /// A core resource operation failed: record it, flip the phase to
    /// Failed and let the host back off.
    async fn fail(
        &self,
        ctx: Arc<Context>,
        api: &Api<MongoDBShardedCluster>,
        component: &str,
        err: &Error,
    ) -> Action {
        error!(
            "Error reconciling {component} for MongoDBShardedCluster {}: {err:?}",
            self.name_any()
        );
        let recorder = ctx
            .diagnostics
            .read()
            .await
            .recorder(ctx.client.clone(), self);
        let _ = recorder
            .publish(Event {
                type_: EventType::Warning,
                reason: "ReconcileError".into(),
                note: Some(format!("{component}: {err}")),
                action: "Reconciling".into(),
                secondary: None,
            })
            .await;
        let condition = build_condition(
            "ReconcileError",
            true,
            "ReconcileFailed",
            &format!("{component}: {err}"),
            self.metadata.generation,
        );
        let _ = self
            .patch_status(
                api,
                json!({"phase": ClusterPhase::Failed, "conditions": [condition]}),
            )
            .await;
        Action::requeue(Duration::from_secs(5 * 60))
    }
}

async fn ready_replicas(api: &Api<StatefulSet>, name: &str) -> i32 {
    match api.get(name).await {
        Ok(sts) => sts.status.and_then(|s| s.ready_replicas).unwrap_or(0),
        Err(_) => 0,
    }
}

async fn deployment_ready_replicas(api: &Api<Deployment>, name: &str) -> i32 {
    match api.get(name).await {
        Ok(deployment) => deployment.status.and_then(|s| s.ready_replicas).unwrap_or(0),
        Err(_) => 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resize_preserving_scale_out() {
        let resized = resize_preserving(&[true, true], 5);
        assert_eq!(resized, vec![true, true, false, false, false]);
    }

    #[test]
    fn test_resize_preserving_scale_down_forgets_tail() {
        let resized = resize_preserving(&[true, false, true], 2);
        assert_eq!(resized, vec![true, false]);
    }

    #[test]
    fn test_resize_preserving_same_length_is_identity() {
        let current = vec![true, false, true];
        assert_eq!(resize_preserving(&current, 3), current);
    }

    #[test]
    fn test_resize_preserving_from_empty() {
        assert_eq!(resize_preserving(&[], 2), vec![false, false]);
    }

    fn component(ready: i32, total: i32) -> ComponentStatus {
        ComponentStatus {
            ready,
            total,
            phase: component_phase(ready, total),
        }
    }

    fn shard(name: &str, ready: i32, total: i32) -> ShardStatus {
        ShardStatus {
            name: name.to_owned(),
            ready,
            total,
            phase: component_phase(ready, total),
        }
    }

    #[test]
    fn test_compute_phase_running() {
        let phase = compute_phase(
            &component(3, 3),
            &[shard("s-0", 3, 3), shard("s-1", 3, 3)],
            &component(2, 2),
            true,
            &[true, true],
            &[true, true],
            true,
        );
        assert_eq!(phase, ClusterPhase::Running);
    }

    #[test]
    fn test_compute_phase_initializing_when_a_shard_lags() {
        let phase = compute_phase(
            &component(3, 3),
            &[shard("s-0", 3, 3), shard("s-1", 2, 3)],
            &component(2, 2),
            true,
            &[true, true],
            &[true, true],
            true,
        );
        assert_eq!(phase, ClusterPhase::Initializing);
    }

    #[test]
    fn test_compute_phase_initializing_until_registered() {
        let phase = compute_phase(
            &component(3, 3),
            &[shard("s-0", 3, 3)],
            &component(2, 2),
            true,
            &[true],
            &[false],
            true,
        );
        assert_eq!(phase, ClusterPhase::Initializing);
    }

    #[test]
    fn test_component_phase() {
        assert_eq!(component_phase(3, 3), ClusterPhase::Running);
        assert_eq!(component_phase(1, 3), ClusterPhase::Initializing);
        assert_eq!(component_phase(0, 0), ClusterPhase::Initializing);
    }
}
