use crate::{
    apis::mongodb_types::{ClusterPhase, MongoDBReplicaSet},
    auth::AuthManager,
    configmap::reconcile_scripts_configmap,
    controller::{
        build_condition, patch_status_merge, Context, REQUEUE_SECONDS, SHORT_REQUEUE_SECONDS,
    },
    replset::{replset_config, ReplsetManager, MONGODB_PORT},
    secret::{admin_credentials, reconcile_keyfile_secret},
    service::{reconcile_client_service, reconcile_headless_service},
    statefulset::{reconcile_statefulset, replicaset_statefulset, MONGODB_CONTAINER},
    telemetry, Error, Result,
};
use chrono::Utc;
use k8s_openapi::api::apps::v1::StatefulSet;
use kube::{
    api::{Api, ResourceExt},
    runtime::{
        controller::Action,
        events::{Event, EventType},
        finalizer::{finalizer, Event as Finalizer},
    },
    Resource,
};
use serde_json::json;
use std::sync::Arc;
use tokio::time::Duration;
use tracing::*;

pub static REPLICA_SET_FINALIZER: &str = "mongodbreplicasets.mongodb.keiailab.com";

const API_VERSION: &str = "mongodb.keiailab.com/v1alpha1";
const KIND: &str = "MongoDBReplicaSet";

#[instrument(skip(ctx, mdb), fields(trace_id))]
pub async fn reconcile(mdb: Arc<MongoDBReplicaSet>, ctx: Arc<Context>) -> Result<Action> {
    let trace_id = telemetry::get_trace_id();
    Span::current().record("trace_id", &field::display(&trace_id));
    let _timer = ctx.metrics.count_and_measure();
    ctx.diagnostics.write().await.last_event = Utc::now();
    let ns = mdb.namespace().unwrap(); // mdb is namespace scoped
    let api: Api<MongoDBReplicaSet> = Api::namespaced(ctx.client.clone(), &ns);

    info!("Reconciling MongoDBReplicaSet \"{}\" in {}", mdb.name_any(), ns);
    finalizer(&api, REPLICA_SET_FINALIZER, mdb, |event| async {
        match event {
            Finalizer::Apply(mdb) => match mdb.reconcile(ctx.clone()).await {
                Ok(action) => Ok(action),
                Err(requeue_action) => Ok(requeue_action),
            },
            Finalizer::Cleanup(mdb) => mdb.cleanup(ctx.clone()).await,
        }
    })
    .await
    .map_err(|e| Error::FinalizerError(Box::new(e)))
}

pub fn error_policy(mdb: Arc<MongoDBReplicaSet>, error: &Error, ctx: Arc<Context>) -> Action {
    warn!("reconcile failed: {:?}", error);
    ctx.metrics.reconcile_failure(mdb.as_ref(), error);
    Action::requeue(Duration::from_secs(5 * 60))
}

fn short_requeue() -> Action {
    Action::requeue(Duration::from_secs(SHORT_REQUEUE_SECONDS))
}

/// Overall phase of a replica set from the gates that matter.
fn compute_phase(
    ready: i32,
    desired: i32,
    initialized: bool,
    has_primary: bool,
    admin_created: bool,
    upgrading: bool,
) -> ClusterPhase {
    if upgrading {
        return ClusterPhase::Upgrading;
    }
    if ready == desired && initialized && has_primary && admin_created {
        ClusterPhase::Running
    } else {
        ClusterPhase::Initializing
    }
}

impl MongoDBReplicaSet {
    // Reconcile (for non-finalizer related changes)
    async fn reconcile(&self, ctx: Arc<Context>) -> Result<Action, Action> {
        let client = ctx.client.clone();
        let ns = self.namespace().unwrap();
        let name = self.name_any();
        let api: Api<MongoDBReplicaSet> = Api::namespaced(client.clone(), &ns);
        let status = self.status.clone().unwrap_or_default();
        let oref = self
            .controller_owner_ref(&())
            .expect("MongoDBReplicaSet has metadata for an owner reference");

        if status.phase == ClusterPhase::Pending {
            self.patch_status(&api, json!({"phase": ClusterPhase::Initializing}))
                .await?;
        }

        // Child objects, in dependency order. The keyfile is create-only;
        // everything else is create-or-update.
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
        if let Err(e) = reconcile_headless_service(
            client.clone(),
            &name,
            &ns,
            &name,
            "mongodb",
            MONGODB_PORT,
            oref.clone(),
        )
        .await
        {
            return Err(self.fail(ctx.clone(), &api, "headless-service", &e).await);
        }
        if let Err(e) = reconcile_client_service(client.clone(), self, oref.clone()).await {
            return Err(self.fail(ctx.clone(), &api, "client-service", &e).await);
        }
        if let Err(e) = reconcile_statefulset(
            client.clone(),
            &ns,
            replicaset_statefulset(self, oref.clone()),
        )
        .await
        {
            return Err(self.fail(ctx.clone(), &api, "statefulset", &e).await);
        }

        // Readiness gate: every member pod must be serving before any
        // in-database work.
        let sts_api: Api<StatefulSet> = Api::namespaced(client.clone(), &ns);
        let sts = match sts_api.get(&name).await {
            Ok(sts) => sts,
            Err(e) => {
                warn!("StatefulSet {name} not readable yet: {e}");
                return Ok(short_requeue());
            }
        };
        let ready = sts.status.as_ref().and_then(|s| s.ready_replicas).unwrap_or(0);
        if ready < self.spec.members {
            debug!(
                "Waiting for members of {name}: {ready}/{} ready",
                self.spec.members
            );
            self.patch_status(&api, json!({"readyMembers": ready})).await?;
            return Ok(short_requeue());
        }

        let replset = ReplsetManager::new(client.clone(), &ns, MONGODB_CONTAINER, MONGODB_PORT);
        let pod0 = format!("{name}-0");
        let mut initialized = status.replicaSetInitialized;
        if !initialized {
            match replset.is_initialized(&pod0, None).await {
                Ok(true) => {
                    self.patch_status(&api, json!({"replicaSetInitialized": true}))
                        .await?;
                    initialized = true;
                }
                Ok(false) => {
                    let mut config = replset_config(
                        &self.spec.replicaSetName,
                        &name,
                        &self.headless_service_name(),
                        &ns,
                        self.spec.members,
                        MONGODB_PORT,
                    );
                    if self.spec.arbiter {
                        config = config.with_arbiter();
                    }
                    match replset.initiate(&pod0, None, &config).await {
                        Ok(()) => {
                            info!("Initiated replica set {} via {pod0}", self.spec.replicaSetName);
                            self.patch_status(&api, json!({"replicaSetInitialized": true}))
                                .await?;
                            initialized = true;
                        }
                        Err(e) => {
                            warn!("rs.initiate on {pod0} did not succeed yet: {e}");
                            return Ok(short_requeue());
                        }
                    }
                }
                Err(e) => {
                    warn!("Could not probe replica set state on {pod0}: {e}");
                    return Ok(short_requeue());
                }
            }
        }

        // Admin credentials are only usable once the user exists; before
        // that the localhost exception applies.
        let creds = if status.adminUserCreated {
            admin_credentials(
                client.clone(),
                &ns,
                &self.spec.auth.adminCredentialsSecretRef.name,
            )
            .await
            .ok()
        } else {
            None
        };

        // Primary gate
        match replset.has_primary(&pod0, creds.as_ref()).await {
            Ok(true) => {}
            Ok(false) => {
                debug!("No primary elected yet for {name}");
                return Ok(short_requeue());
            }
            Err(e) => {
                warn!("Could not read replica set status of {name}: {e}");
                return Ok(short_requeue());
            }
        }

        let mut admin_created = status.adminUserCreated;
        if !admin_created {
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
            let primary = match replset.primary_pod(&pod0, None).await {
                Ok(Some(primary)) => primary,
                Ok(None) => return Ok(short_requeue()),
                Err(e) => {
                    warn!("Could not discover primary of {name}: {e}");
                    return Ok(short_requeue());
                }
            };
            let auth = AuthManager::new(client.clone(), &ns, MONGODB_CONTAINER, MONGODB_PORT);
            let exists = auth
                .user_exists(&primary, None, "admin", &admin.username)
                .await
                .unwrap_or(false);
            if !exists {
                if let Err(e) = auth.create_admin_user(&primary, &admin).await {
                    warn!("Admin user creation on {primary} did not succeed yet: {e}");
                    return Ok(short_requeue());
                }
                info!("Created admin user for {name} via {primary}");
            }
            self.patch_status(&api, json!({"adminUserCreated": true}))
                .await?;
            admin_created = true;
        }

        // Final status pass
        let sts = sts_api.get(&name).await.map_err(|e| {
            error!("Error re-reading StatefulSet {name}: {e}");
            short_requeue()
        })?;
        let ready = sts.status.as_ref().and_then(|s| s.ready_replicas).unwrap_or(0);
        let updated = sts.status.as_ref().and_then(|s| s.updated_replicas).unwrap_or(0);
        let upgrading = initialized && ready > 0 && updated < self.spec.members;

        let creds = admin_credentials(
            client.clone(),
            &ns,
            &self.spec.auth.adminCredentialsSecretRef.name,
        )
        .await
        .ok();
        let current_primary = if initialized {
            replset
                .primary_pod(&pod0, creds.as_ref())
                .await
                .ok()
                .flatten()
        } else {
            None
        };
        let has_primary = current_primary.is_some();

        let phase = compute_phase(
            ready,
            self.spec.members,
            initialized,
            has_primary,
            admin_created,
            upgrading,
        );
        let generation = self.metadata.generation;
        let conditions = vec![
            build_condition(
                "Ready",
                phase == ClusterPhase::Running,
                if phase == ClusterPhase::Running {
                    "AllMembersReady"
                } else {
                    "MembersNotReady"
                },
                &format!("{ready}/{} members ready", self.spec.members),
                generation,
            ),
            build_condition(
                "ReplicaSetInitialized",
                initialized,
                if initialized { "Initialized" } else { "NotInitialized" },
                &format!("replica set {}", self.spec.replicaSetName),
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
            "mongodb://{name}.{ns}.svc.cluster.local:{MONGODB_PORT}/?replicaSet={}",
            self.spec.replicaSetName
        );
        self.patch_status(
            &api,
            json!({
                "phase": phase,
                "readyMembers": ready,
                "currentPrimary": current_primary,
                "replicaSetInitialized": initialized,
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
                reason: "DeleteMongoDBReplicaSet".into(),
                note: Some(format!("Delete `{}`", self.name_any())),
                action: "Reconciling".into(),
                secondary: None,
            })
            .await
            .map_err(Error::KubeError)?;
        Ok(Action::await_change())
    }

    async fn patch_status(
        &self,
        api: &Api<MongoDBReplicaSet>,
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
        api: &Api<MongoDBReplicaSet>,
        component: &str,
        err: &Error,
    ) -> Action {
        error!(
            "Error reconciling {component} for MongoDBReplicaSet {}: {err:?}",
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compute_phase_running_requires_everything() {
        assert_eq!(
            compute_phase(3, 3, true, true, true, false),
            ClusterPhase::Running
        );
        assert_eq!(
            compute_phase(2, 3, true, true, true, false),
            ClusterPhase::Initializing
        );
        assert_eq!(
            compute_phase(3, 3, false, true, true, false),
            ClusterPhase::Initializing
        );
        assert_eq!(
            compute_phase(3, 3, true, false, true, false),
            ClusterPhase::Initializing
        );
        assert_eq!(
            compute_phase(3, 3, true, true, false, false),
            ClusterPhase::Initializing
        );
    }

    #[test]
    fn test_compute_phase_upgrading_wins() {
        assert_eq!(
            compute_phase(3, 3, true, true, true, true),
            ClusterPhase::Upgrading
        );
    }
}
