// Include the #[ignore] macro on slow tests.
// That way, 'cargo test' does not run them by default.
// To run just these tests, use 'cargo test -- --ignored'
// To run all tests, use 'cargo test -- --include-ignored'
//
// https://doc.rust-lang.org/book/ch11-02-running-tests.html
//
// These tests assume there is already kubernetes running and you have a context configured.
// It also assumes that the CRD(s) and operator are already installed for this cluster.
// In this way, it can be used as a conformance test on a target, separate from installation.

#[cfg(test)]
mod test {
    use controller::apis::mongodb_types::{
        BackupPhase, ClusterPhase, MongoDBBackup, MongoDBReplicaSet,
    };
    use k8s_openapi::{
        api::{
            apps::v1::StatefulSet,
            batch::v1::Job,
            core::v1::{Pod, Secret},
        },
        ByteString,
    };
    use kube::{
        api::{Api, AttachParams, DeleteParams, Patch, PatchParams, PostParams},
        Client,
    };
    use rand::Rng;
    use std::{collections::BTreeMap, time::Duration};
    use tokio::io::AsyncReadExt;
    use tokio::time::sleep;

    const API_VERSION: &str = "mongodb.keiailab.com/v1alpha1";
    // Timeout settings while waiting for an event
    const TIMEOUT_SECONDS_POD_READY: u64 = 300;
    const TIMEOUT_SECONDS_RUNNING: u64 = 600;
    const TIMEOUT_SECONDS_BACKUP: u64 = 600;
    const TIMEOUT_SECONDS_DELETED: u64 = 120;

    async fn kube_client() -> Client {
        Client::try_default()
            .await
            .expect("Failed to create kube client; is a context configured?")
    }

    fn test_name(prefix: &str) -> String {
        let mut rng = rand::thread_rng();
        let suffix: u16 = rng.gen_range(0..10000);
        format!("{prefix}-{suffix}")
    }

    async fn create_admin_secret(client: Client, namespace: &str, name: &str) {
        let secrets: Api<Secret> = Api::namespaced(client, namespace);
        let mut data = BTreeMap::new();
        data.insert("username".to_owned(), ByteString(b"admin".to_vec()));
        data.insert("password".to_owned(), ByteString(b"password123".to_vec()));
        let secret = Secret {
            metadata: kube::core::ObjectMeta {
                name: Some(name.to_owned()),
                namespace: Some(namespace.to_owned()),
                ..Default::default()
            },
            data: Some(data),
            ..Secret::default()
        };
        let _ = secrets.create(&PostParams::default(), &secret).await;
    }

    async fn run_command_in_container(
        pods_api: Api<Pod>,
        pod_name: String,
        container: &str,
        command: Vec<String>,
    ) -> String {
        let attach_params = AttachParams {
            container: Some(container.to_string()),
            tty: false,
            stdin: false,
            stdout: true,
            stderr: true,
            max_stdin_buf_size: Some(1024),
            max_stdout_buf_size: Some(1024),
            max_stderr_buf_size: Some(1024),
        };

        for _ in 1..10 {
            let attach_res = pods_api
                .exec(pod_name.as_str(), &command, &attach_params)
                .await;
            let mut attached_process = match attach_res {
                Ok(ap) => ap,
                Err(e) => {
                    println!("Error attaching to pod {pod_name}: {e}");
                    sleep(Duration::from_millis(5000)).await;
                    continue;
                }
            };
            let mut stdout_reader = attached_process.stdout().unwrap();
            let mut result_stdout = String::new();
            stdout_reader
                .read_to_string(&mut result_stdout)
                .await
                .unwrap();
            return result_stdout;
        }
        panic!("Failed to run command in container");
    }

    async fn wait_for_running(api: &Api<MongoDBReplicaSet>, name: &str) {
        for _ in 0..(TIMEOUT_SECONDS_RUNNING / 5) {
            if let Ok(mdb) = api.get(name).await {
                if let Some(status) = mdb.status {
                    if status.phase == ClusterPhase::Running {
                        return;
                    }
                }
            }
            sleep(Duration::from_secs(5)).await;
        }
        panic!("Timed out waiting for {name} to reach Running");
    }

    #[tokio::test]
    #[ignore]
    async fn functional_test_replica_set_basic() {
        let client = kube_client().await;
        let namespace = "default";
        let name = test_name("mdb-rs");
        create_admin_secret(client.clone(), namespace, "mongodb-admin").await;

        let replica_sets: Api<MongoDBReplicaSet> = Api::namespaced(client.clone(), namespace);
        let mdb = serde_json::json!({
            "apiVersion": API_VERSION,
            "kind": "MongoDBReplicaSet",
            "metadata": { "name": name },
            "spec": {
                "members": 3,
                "version": "8.2",
                "storage": { "size": "1Gi" },
                "auth": {
                    "mechanism": "SCRAM-SHA-256",
                    "adminCredentialsSecretRef": { "name": "mongodb-admin" }
                }
            }
        });
        let params = PatchParams::apply("functional-test").force();
        let _ = replica_sets
            .patch(&name, &params, &Patch::Apply(&mdb))
            .await
            .unwrap();

        // Pods come up
        let sts_api: Api<StatefulSet> = Api::namespaced(client.clone(), namespace);
        for _ in 0..(TIMEOUT_SECONDS_POD_READY / 5) {
            if let Ok(sts) = sts_api.get(&name).await {
                if sts.status.and_then(|s| s.ready_replicas).unwrap_or(0) == 3 {
                    break;
                }
            }
            sleep(Duration::from_secs(5)).await;
        }

        // The reconciler drives the resource to Running
        wait_for_running(&replica_sets, &name).await;
        let mdb = replica_sets.get(&name).await.unwrap();
        let status = mdb.status.unwrap();
        assert!(status.replicaSetInitialized);
        assert!(status.adminUserCreated);
        assert_eq!(status.readyMembers, 3);
        assert_eq!(status.currentPrimary.as_deref(), Some(format!("{name}-0").as_str()));

        // The replica set reports healthy from inside the pod
        let pods_api: Api<Pod> = Api::namespaced(client.clone(), namespace);
        let out = run_command_in_container(
            pods_api.clone(),
            format!("{name}-0"),
            "mongodb",
            vec![
                "mongosh".to_owned(),
                "--quiet".to_owned(),
                "-u".to_owned(),
                "admin".to_owned(),
                "-p".to_owned(),
                "password123".to_owned(),
                "--authenticationDatabase".to_owned(),
                "admin".to_owned(),
                "--eval".to_owned(),
                "rs.status().ok".to_owned(),
            ],
        )
        .await;
        assert_eq!(out.trim(), "1");

        // Keyfile stays byte-identical across further reconciles
        let secrets: Api<Secret> = Api::namespaced(client.clone(), namespace);
        let keyfile_before = secrets.get(&format!("{name}-keyfile")).await.unwrap();
        sleep(Duration::from_secs(35)).await;
        let keyfile_after = secrets.get(&format!("{name}-keyfile")).await.unwrap();
        assert_eq!(keyfile_before.data, keyfile_after.data);

        // Deleting the resource cascades to the children
        replica_sets
            .delete(&name, &DeleteParams::default())
            .await
            .unwrap();
        for _ in 0..(TIMEOUT_SECONDS_DELETED / 5) {
            if sts_api.get(&name).await.is_err() {
                break;
            }
            sleep(Duration::from_secs(5)).await;
        }
        assert!(sts_api.get(&name).await.is_err());
    }

    #[tokio::test]
    #[ignore]
    async fn functional_test_backup_creates_job() {
        let client = kube_client().await;
        let namespace = "default";
        let target = test_name("mdb-rs");
        let backup_name = test_name("mdb-backup");
        create_admin_secret(client.clone(), namespace, "mongodb-admin").await;

        let replica_sets: Api<MongoDBReplicaSet> = Api::namespaced(client.clone(), namespace);
        let mdb = serde_json::json!({
            "apiVersion": API_VERSION,
            "kind": "MongoDBReplicaSet",
            "metadata": { "name": target },
            "spec": {
                "members": 1,
                "version": "8.2",
                "storage": { "size": "1Gi" },
                "auth": {
                    "adminCredentialsSecretRef": { "name": "mongodb-admin" }
                }
            }
        });
        let params = PatchParams::apply("functional-test").force();
        let _ = replica_sets
            .patch(&target, &params, &Patch::Apply(&mdb))
            .await
            .unwrap();
        wait_for_running(&replica_sets, &target).await;

        let backups: Api<MongoDBBackup> = Api::namespaced(client.clone(), namespace);
        let backup = serde_json::json!({
            "apiVersion": API_VERSION,
            "kind": "MongoDBBackup",
            "metadata": { "name": backup_name },
            "spec": {
                "clusterRef": { "name": target, "kind": "ReplicaSet" },
                "storage": {
                    "persistentVolume": { "claimName": "backup-pvc" }
                }
            }
        });
        let _ = backups
            .patch(&backup_name, &params, &Patch::Apply(&backup))
            .await
            .unwrap();

        // Exactly one job appears and the backup reaches a terminal phase
        let jobs: Api<Job> = Api::namespaced(client.clone(), namespace);
        for _ in 0..(TIMEOUT_SECONDS_BACKUP / 5) {
            if let Ok(backup) = backups.get(&backup_name).await {
                if let Some(status) = backup.status {
                    if status.phase == BackupPhase::Completed {
                        assert!(status.completionTime.is_some());
                        assert!(jobs.get(&backup_name).await.is_ok());
                        return;
                    }
                    assert_ne!(status.phase, BackupPhase::Failed, "backup failed");
                }
            }
            sleep(Duration::from_secs(5)).await;
        }
        panic!("Timed out waiting for backup {backup_name} to complete");
    }
}
