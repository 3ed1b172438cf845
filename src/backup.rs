use crate::{
    apis::mongodb_types::{
        BackupPhase, MongoDBBackup, MongoDBReplicaSet, MongoDBShardedCluster, TargetKind,
    },
    backupjob::{backup_location, reconcile_backup_job, BackupTarget},
    controller::{patch_status_merge, Context, SHORT_REQUEUE_SECONDS},
    replset::MONGODB_PORT,
    secret::admin_credentials,
    telemetry, Error, Result,
};
use chrono::Utc;
use k8s_openapi::api::batch::v1::Job;
use kube::{
    api::{Api, DeleteParams, PropagationPolicy, ResourceExt},
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

pub static BACKUP_FINALIZER: &str = "mongodbbackups.mongodb.keiailab.com";

const API_VERSION: &str = "mongodb.keiailab.com/v1alpha1";
const KIND: &str = "MongoDBBackup";

#[instrument(skip(ctx, backup), fields(trace_id))]
pub async fn reconcile(backup: Arc<MongoDBBackup>, ctx: Arc<Context>) -> Result<Action> {
    let trace_id = telemetry::get_trace_id();
    Span::current().record("trace_id", &field::display(&trace_id));
    let _timer = ctx.metrics.count_and_measure();
    ctx.diagnostics.write().await.last_event = Utc::now();
    let ns = backup.namespace().unwrap(); // backup is namespace scoped
    let api: Api<MongoDBBackup> = Api::namespaced(ctx.client.clone(), &ns);

    info!("Reconciling MongoDBBackup \"{}\" in {}", backup.name_any(), ns);
    finalizer(&api, BACKUP_FINALIZER, backup, |event| async {
        match event {
            Finalizer::Apply(backup) => match backup.reconcile(ctx.clone()).await {
                Ok(action) => Ok(action),
                Err(requeue_action) => Ok(requeue_action),
            },
            Finalizer::Cleanup(backup) => backup.cleanup(ctx.clone()).await,
        }
    })
    .await
    .map_err(|e| Error::FinalizerError(Box::new(e)))
}

pub fn error_policy(backup: Arc<MongoDBBackup>, error: &Error, ctx: Arc<Context>) -> Action {
    warn!("reconcile failed: {:?}", error);
    ctx.metrics.reconcile_failure(backup.as_ref(), error);
    Action::requeue(Duration::from_secs(5 * 60))
}

impl MongoDBBackup {
    // Reconcile (for non-finalizer related changes)
    async fn reconcile(&self, ctx: Arc<Context>) -> Result<Action, Action> {
        let client = ctx.client.clone();
        let ns = self.namespace().unwrap();
        let name = self.name_any();
        let api: Api<MongoDBBackup> = Api::namespaced(client.clone(), &ns);
        let status = self.status.clone().unwrap_or_default();

        // Completed and Failed are terminal.
        if matches!(status.phase, BackupPhase::Completed | BackupPhase::Failed) {
            return Ok(Action::await_change());
        }

        if self.status.is_none() {
            self.patch_status(
                &api,
                json!({"phase": BackupPhase::Pending, "startTime": Utc::now()}),
            )
            .await?;
        }

        // Resolve the target cluster; a dangling reference cannot recover
        // on its own, so it is terminal.
        let target = match self.resolve_target(ctx.clone()).await {
            Ok(target) => target,
            Err(e) => {
                return Ok(self.fail_terminal(&api, &format!("target cluster: {e}")).await);
            }
        };

        // The dump authenticates as the admin user; both keys must exist.
        if let Err(e) = admin_credentials(client.clone(), &ns, &target.admin_secret).await {
            return Ok(self
                .fail_terminal(&api, &format!("admin credentials: {e}"))
                .await);
        }

        let oref = self
            .controller_owner_ref(&())
            .expect("MongoDBBackup has metadata for an owner reference");
        if let Err(e) = reconcile_backup_job(client.clone(), self, &target, oref).await {
            return Ok(self.fail_terminal(&api, &format!("backup job: {e}")).await);
        }

        // Track the job through its conditions.
        let jobs: Api<Job> = Api::namespaced(client.clone(), &ns);
        let job = match jobs.get(&name).await {
            Ok(job) => job,
            Err(e) => {
                warn!("Backup job {name} not readable yet: {e}");
                return Ok(Action::requeue(Duration::from_secs(SHORT_REQUEUE_SECONDS)));
            }
        };
        let job_status = job.status.unwrap_or_default();
        let location = backup_location(self);

        let completed = job_status
            .conditions
            .as_ref()
            .and_then(|conds| {
                conds
                    .iter()
                    .find(|c| c.type_ == "Complete" && c.status == "True")
            })
            .cloned();
        if completed.is_some() {
            info!("Backup {name} completed");
            self.patch_status(
                &api,
                json!({
                    "phase": BackupPhase::Completed,
                    "completionTime": Utc::now(),
                    "location": location,
                }),
            )
            .await?;
            return Ok(Action::await_change());
        }

        let failed = job_status
            .conditions
            .as_ref()
            .and_then(|conds| {
                conds
                    .iter()
                    .find(|c| c.type_ == "Failed" && c.status == "True")
            })
            .cloned();
        if let Some(failed) = failed {
            let message = failed
                .message
                .unwrap_or_else(|| "backup job failed".to_owned());
            error!("Backup {name} failed: {message}");
            self.patch_status(
                &api,
                json!({
                    "phase": BackupPhase::Failed,
                    "completionTime": Utc::now(),
                    "error": message,
                }),
            )
            .await?;
            return Ok(Action::await_change());
        }

        if job_status.active.unwrap_or(0) > 0 {
            self.patch_status(
                &api,
                json!({"phase": BackupPhase::Running, "location": location}),
            )
            .await?;
        }

        Ok(Action::requeue(Duration::from_secs(SHORT_REQUEUE_SECONDS)))
    }

    // Finalizer cleanup: tear the job down with its pods.
    async fn cleanup(&self, ctx: Arc<Context>) -> Result<Action> {
        let ns = self.namespace().unwrap();
        let name = self.name_any();
        let jobs: Api<Job> = Api::namespaced(ctx.client.clone(), &ns);
        let dp = DeleteParams {
            propagation_policy: Some(PropagationPolicy::Background),
            ..DeleteParams::default()
        };
        match jobs.delete(&name, &dp).await {
            Ok(_) => debug!("Deleted backup job {name}"),
            Err(kube::Error::Api(ae)) if ae.code == 404 => {}
            Err(e) => return Err(Error::KubeError(e)),
        }
        let recorder = ctx
            .diagnostics
            .read()
            .await
            .recorder(ctx.client.clone(), self);
        recorder
            .publish(Event {
                type_: EventType::Normal,
                reason: "DeleteMongoDBBackup".into(),
                note: Some(format!("Delete `{name}`")),
                action: "Reconciling".into(),
                secondary: None,
            })
            .await
            .map_err(Error::KubeError)?;
        Ok(Action::await_change())
    }

    /// Resolve the referenced cluster into a concrete host, image and
    /// admin-secret name.
    async fn resolve_target(&self, ctx: Arc<Context>) -> Result<BackupTarget> {
        let ns = self.namespace().unwrap();
        let target_name = self.spec.clusterRef.name.clone();
        match self.spec.clusterRef.kind {
            TargetKind::ReplicaSet => {
                let api: Api<MongoDBReplicaSet> = Api::namespaced(ctx.client.clone(), &ns);
                let mdb = api.get(&target_name).await.map_err(|_| {
                    Error::InvalidReferenceError(format!(
                        "MongoDBReplicaSet {target_name} not found in {ns}"
                    ))
                })?;
                Ok(BackupTarget {
                    name: target_name.clone(),
                    host: format!("{target_name}:{MONGODB_PORT}"),
                    image: mdb.image(),
                    admin_secret: mdb.spec.auth.adminCredentialsSecretRef.name.clone(),
                })
            }
            TargetKind::Sharded => {
                let api: Api<MongoDBShardedCluster> = Api::namespaced(ctx.client.clone(), &ns);
                let cluster = api.get(&target_name).await.map_err(|_| {
                    Error::InvalidReferenceError(format!(
                        "MongoDBShardedCluster {target_name} not found in {ns}"
                    ))
                })?;
                Ok(BackupTarget {
                    name: target_name.clone(),
                    host: format!("{}:{MONGODB_PORT}", cluster.mongos_name()),
                    image: cluster.image(),
                    admin_secret: cluster.spec.auth.adminCredentialsSecretRef.name.clone(),
                })
            }
        }
    }

    async fn patch_status(
        &self,
        api: &Api<MongoDBBackup>,
        status: serde_json::Value,
    ) -> Result<(), Action> {
        let patch = json!({
            "apiVersion": API_VERSION,
            "kind": KIND,
            "status": status,
        });
        patch_status_merge(api, &self.name_any(), patch).await
    }

    /// Unlike the cluster reconcilers, a backup gives up: runtime errors
    /// park it in the terminal Failed phase.
    async fn fail_terminal(&self, api: &Api<MongoDBBackup>, message: &str) -> Action {
        error!("Backup {} failed: {message}", self.name_any());
        let _ = self
            .patch_status(
                api,
                json!({
                    "phase": BackupPhase::Failed,
                    "completionTime": Utc::now(),
                    "error": message,
                }),
            )
            .await;
        Action::await_change()
    }
}
