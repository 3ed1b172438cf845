use crate::{
    apis::mongodb_types::{BackupType, MongoDBBackup},
    kubernetes::canonical_labels,
    Result,
};
use k8s_openapi::{
    api::{
        batch::v1::{Job, JobSpec},
        core::v1::{
            Container, EnvVar, EnvVarSource, PersistentVolumeClaimVolumeSource, PodSpec,
            PodTemplateSpec, SecretKeySelector, Volume, VolumeMount,
        },
    },
    apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference},
};
use kube::{api::Api, client::Client, ResourceExt};

use crate::kubernetes::create_if_absent;

const BACKUP_MOUNT_PATH: &str = "/backup";

/// Where to reach the cluster being dumped, resolved by the reconciler
/// from the target reference.
pub struct BackupTarget {
    pub name: String,
    pub host: String,
    pub image: String,
    pub admin_secret: String,
}

fn secret_env(name: &str, secret: &str, key: &str) -> EnvVar {
    EnvVar {
        name: name.to_owned(),
        value_from: Some(EnvVarSource {
            secret_key_ref: Some(SecretKeySelector {
                name: Some(secret.to_owned()),
                key: key.to_owned(),
                ..SecretKeySelector::default()
            }),
            ..EnvVarSource::default()
        }),
        ..EnvVar::default()
    }
}

fn value_env(name: &str, value: &str) -> EnvVar {
    EnvVar {
        name: name.to_owned(),
        value: Some(value.to_owned()),
        ..EnvVar::default()
    }
}

/// The shell pipeline the job runs. `mongodump --archive` on stdout,
/// optionally compressed, streamed either to S3 or onto a mounted volume.
fn backup_script(backup: &MongoDBBackup) -> String {
    let dump_flags = match backup.spec.backupType {
        BackupType::Full => "",
        BackupType::Incremental => " --oplog",
    };
    let (compress_pipe, extension) = if backup.spec.compression.enabled {
        let algorithm = &backup.spec.compression.algorithm;
        (
            format!(" | {}", algorithm.command()),
            format!(".{}", algorithm.extension()),
        )
    } else {
        (String::new(), String::new())
    };

    let mut script = String::from("set -e\n");
    script.push_str(&format!(
        "ARCHIVE=\"${{TARGET_NAME}}-$(date +%Y%m%d-%H%M%S).archive{extension}\"\n"
    ));
    script.push_str(
        "MONGODB_URI=\"mongodb://${MONGODB_USERNAME}:${MONGODB_PASSWORD}@${MONGODB_HOST}/?authSource=admin\"\n",
    );

    if backup.spec.storage.s3.is_some() {
        script.push_str(
            "if ! command -v aws >/dev/null 2>&1; then\n  \
             apt-get update -qq >/dev/null && apt-get install -y -qq awscli >/dev/null\nfi\n",
        );
        script.push_str(&format!(
            "mongodump --uri=\"$MONGODB_URI\" --archive{dump_flags}{compress_pipe} \
             | aws ${{S3_ENDPOINT:+--endpoint-url \"$S3_ENDPOINT\"}} s3 cp - \
             \"s3://${{S3_BUCKET}}/${{S3_PREFIX}}${{ARCHIVE}}\"\n"
        ));
    } else {
        script.push_str(&format!(
            "mongodump --uri=\"$MONGODB_URI\" --archive{dump_flags}{compress_pipe} \
             > \"{BACKUP_MOUNT_PATH}/${{ARCHIVE}}\"\n"
        ));
    }
    script
}

/// The reported archive location, known before the job runs.
pub fn backup_location(backup: &MongoDBBackup) -> Option<String> {
    if let Some(s3) = &backup.spec.storage.s3 {
        return Some(format!(
            "s3://{}/{}{}",
            s3.bucket,
            s3.prefix,
            backup.name_any()
        ));
    }
    backup.spec.storage.persistentVolume.as_ref().map(|pv| {
        format!(
            "pvc://{}{}",
            pv.claimName,
            pv.path.clone().unwrap_or_else(|| BACKUP_MOUNT_PATH.to_owned())
        )
    })
}

pub fn backup_job(backup: &MongoDBBackup, target: &BackupTarget, oref: OwnerReference) -> Job {
    let name = backup.name_any();
    let ns = backup.namespace().unwrap_or_default();

    let mut env = vec![
        value_env("TARGET_NAME", &target.name),
        value_env("MONGODB_HOST", &target.host),
        secret_env("MONGODB_USERNAME", &target.admin_secret, "username"),
        secret_env("MONGODB_PASSWORD", &target.admin_secret, "password"),
    ];
    let mut volumes = None;
    let mut volume_mounts = None;

    if let Some(s3) = &backup.spec.storage.s3 {
        env.push(value_env("S3_BUCKET", &s3.bucket));
        env.push(value_env("S3_PREFIX", &s3.prefix));
        env.push(secret_env(
            "AWS_ACCESS_KEY_ID",
            &s3.credentialsSecretRef.name,
            "access-key",
        ));
        env.push(secret_env(
            "AWS_SECRET_ACCESS_KEY",
            &s3.credentialsSecretRef.name,
            "secret-key",
        ));
        if let Some(region) = &s3.region {
            env.push(value_env("AWS_DEFAULT_REGION", region));
        }
        if let Some(endpoint) = &s3.endpoint {
            env.push(value_env("S3_ENDPOINT", endpoint));
        }
    } else if let Some(pv) = &backup.spec.storage.persistentVolume {
        volumes = Some(vec![Volume {
            name: "backup".to_owned(),
            persistent_volume_claim: Some(PersistentVolumeClaimVolumeSource {
                claim_name: pv.claimName.clone(),
                ..PersistentVolumeClaimVolumeSource::default()
            }),
            ..Volume::default()
        }]);
        volume_mounts = Some(vec![VolumeMount {
            name: "backup".to_owned(),
            mount_path: BACKUP_MOUNT_PATH.to_owned(),
            sub_path: pv.path.clone().map(|p| p.trim_start_matches('/').to_owned()),
            ..VolumeMount::default()
        }]);
    }

    let container = Container {
        name: "backup".to_owned(),
        image: Some(target.image.clone()),
        command: Some(vec!["/bin/bash".to_owned(), "-c".to_owned()]),
        args: Some(vec![backup_script(backup)]),
        env: Some(env),
        volume_mounts,
        ..Container::default()
    };

    Job {
        metadata: ObjectMeta {
            name: Some(name.clone()),
            namespace: Some(ns),
            labels: Some(canonical_labels(&name, "backup")),
            owner_references: Some(vec![oref]),
            ..ObjectMeta::default()
        },
        spec: Some(JobSpec {
            backoff_limit: Some(3),
            ttl_seconds_after_finished: Some(86400),
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(canonical_labels(&name, "backup")),
                    ..ObjectMeta::default()
                }),
                spec: Some(PodSpec {
                    restart_policy: Some("OnFailure".to_owned()),
                    containers: vec![container],
                    volumes,
                    ..PodSpec::default()
                }),
            },
            ..JobSpec::default()
        }),
        ..Job::default()
    }
}

pub async fn reconcile_backup_job(
    client: Client,
    backup: &MongoDBBackup,
    target: &BackupTarget,
    oref: OwnerReference,
) -> Result<()> {
    let ns = backup.namespace().unwrap_or_default();
    let api: Api<Job> = Api::namespaced(client, &ns);
    let job = backup_job(backup, target, oref);
    // never update a running dump in place
    create_if_absent(&api, &backup.name_any(), job).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::apis::mongodb_types::{
        BackupStorageSpec, ClusterRef, CompressionAlgorithm, CompressionSpec, MongoDBBackupSpec,
        PersistentVolumeStorageSpec, S3StorageSpec, SecretRef, TargetKind,
    };

    fn s3_backup() -> MongoDBBackup {
        let mut backup = MongoDBBackup::new(
            "nightly",
            MongoDBBackupSpec {
                clusterRef: ClusterRef {
                    name: "db".to_owned(),
                    kind: TargetKind::ReplicaSet,
                },
                storage: BackupStorageSpec {
                    s3: Some(S3StorageSpec {
                        bucket: "mongodb-backups".to_owned(),
                        prefix: "prod/".to_owned(),
                        region: Some("us-east-1".to_owned()),
                        endpoint: None,
                        credentialsSecretRef: SecretRef {
                            name: "s3-credentials".to_owned(),
                        },
                    }),
                    persistentVolume: None,
                },
                backupType: BackupType::Full,
                compression: CompressionSpec {
                    enabled: true,
                    algorithm: CompressionAlgorithm::Gzip,
                },
            },
        );
        backup.metadata.namespace = Some("prod".to_owned());
        backup
    }

    fn target() -> BackupTarget {
        BackupTarget {
            name: "db".to_owned(),
            host: "db:27017".to_owned(),
            image: "mongo:8.2".to_owned(),
            admin_secret: "mongodb-admin".to_owned(),
        }
    }

    #[test]
    fn test_backup_script_s3_gzip() {
        let script = backup_script(&s3_backup());
        assert!(script.contains("mongodump --uri=\"$MONGODB_URI\" --archive | gzip"));
        assert!(script.contains("aws "));
        assert!(script.contains("s3://${S3_BUCKET}/${S3_PREFIX}${ARCHIVE}"));
        assert!(script.contains(".archive.gz"));
        // the URI must not carry a database path; /admin would restrict
        // the dump to that database
        assert!(script.contains("@${MONGODB_HOST}/?authSource=admin"));
    }

    #[test]
    fn test_backup_script_incremental_uncompressed_pv() {
        let mut backup = s3_backup();
        backup.spec.backupType = BackupType::Incremental;
        backup.spec.compression.enabled = false;
        backup.spec.storage.s3 = None;
        backup.spec.storage.persistentVolume = Some(PersistentVolumeStorageSpec {
            claimName: "backup-pvc".to_owned(),
            path: None,
        });
        let script = backup_script(&backup);
        assert!(script.contains("--archive --oplog"));
        assert!(!script.contains("| gzip"));
        assert!(script.contains("> \"/backup/${ARCHIVE}\""));
    }

    #[test]
    fn test_backup_job_shape() {
        let job = backup_job(&s3_backup(), &target(), OwnerReference::default());
        let spec = job.spec.unwrap();
        assert_eq!(spec.backoff_limit, Some(3));
        assert_eq!(spec.ttl_seconds_after_finished, Some(86400));
        let pod_spec = spec.template.spec.unwrap();
        assert_eq!(pod_spec.restart_policy.as_deref(), Some("OnFailure"));
        let env = pod_spec.containers[0].env.as_ref().unwrap();
        let names: Vec<_> = env.iter().map(|e| e.name.as_str()).collect();
        assert!(names.contains(&"MONGODB_USERNAME"));
        assert!(names.contains(&"AWS_ACCESS_KEY_ID"));
        let access_key = env.iter().find(|e| e.name == "AWS_ACCESS_KEY_ID").unwrap();
        assert_eq!(
            access_key
                .value_from
                .as_ref()
                .unwrap()
                .secret_key_ref
                .as_ref()
                .unwrap()
                .key,
            "access-key"
        );
    }

    #[test]
    fn test_backup_location() {
        assert_eq!(
            backup_location(&s3_backup()).unwrap(),
            "s3://mongodb-backups/prod/nightly"
        );
    }
}
