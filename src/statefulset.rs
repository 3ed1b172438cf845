use crate::{
    apis::mongodb_types::{
        MongoDBReplicaSet, MongoDBShardedCluster, MonitoringSpec, PodOverrides, StorageSpec,
    },
    defaults,
    kubernetes::{apply_resource, workload_labels},
    replset::{CONFIG_SERVER_PORT, MONGODB_PORT, SHARD_PORT},
    service::METRICS_PORT,
    Result,
};
use k8s_openapi::{
    api::{
        apps::v1::{StatefulSet, StatefulSetSpec, StatefulSetUpdateStrategy},
        core::v1::{
            Affinity, ConfigMapVolumeSource, Container, ContainerPort, ExecAction,
            PersistentVolumeClaim, PersistentVolumeClaimSpec, PodAffinityTerm, PodAntiAffinity,
            PodSpec, PodTemplateSpec, Probe, ResourceRequirements, SecretVolumeSource, Volume,
            VolumeMount, WeightedPodAffinityTerm,
        },
    },
    apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta, OwnerReference},
};
use kube::{api::Api, client::Client, ResourceExt};
use std::collections::BTreeMap;

pub const KEYFILE_MOUNT_PATH: &str = "/etc/mongodb-keyfile";
pub const KEYFILE_PATH: &str = "/etc/mongodb-keyfile/keyfile";
pub const SCRIPTS_MOUNT_PATH: &str = "/scripts";
pub const MONGODB_CONTAINER: &str = "mongodb";

struct MongodWorkload<'a> {
    workload_name: String,
    instance: String,
    namespace: String,
    component: &'a str,
    replicas: i32,
    replset_name: String,
    port: i32,
    data_dir: String,
    role_args: Vec<String>,
    image: String,
    storage: &'a StorageSpec,
    keyfile_secret: String,
    scripts_configmap: String,
    monitoring: Option<&'a MonitoringSpec>,
    overrides: Option<&'a PodOverrides>,
}

fn mongosh_ping(port: i32) -> Vec<String> {
    vec![
        "mongosh".to_owned(),
        "--quiet".to_owned(),
        "--port".to_owned(),
        port.to_string(),
        "--eval".to_owned(),
        "db.adminCommand('ping')".to_owned(),
    ]
}

fn exporter_container(monitoring: &MonitoringSpec, port: i32) -> Container {
    Container {
        name: "metrics".to_owned(),
        image: Some(monitoring.exporterImage.clone()),
        args: Some(vec![format!("--mongodb.uri=mongodb://localhost:{port}")]),
        ports: Some(vec![ContainerPort {
            container_port: METRICS_PORT,
            name: Some("metrics".to_owned()),
            ..ContainerPort::default()
        }]),
        ..Container::default()
    }
}

fn anti_affinity(instance: &str) -> Affinity {
    let mut match_labels = BTreeMap::new();
    match_labels.insert("app.kubernetes.io/name".to_owned(), "mongodb".to_owned());
    match_labels.insert("app.kubernetes.io/instance".to_owned(), instance.to_owned());
    Affinity {
        pod_anti_affinity: Some(PodAntiAffinity {
            preferred_during_scheduling_ignored_during_execution: Some(vec![
                WeightedPodAffinityTerm {
                    weight: 100,
                    pod_affinity_term: PodAffinityTerm {
                        label_selector: Some(LabelSelector {
                            match_labels: Some(match_labels),
                            ..LabelSelector::default()
                        }),
                        topology_key: "kubernetes.io/hostname".to_owned(),
                        ..PodAffinityTerm::default()
                    },
                },
            ]),
            ..PodAntiAffinity::default()
        }),
        ..Affinity::default()
    }
}

fn data_volume_claim(storage: &StorageSpec) -> PersistentVolumeClaim {
    let storage_class = storage
        .className
        .clone()
        .filter(|c| !c.is_empty())
        .unwrap_or_else(defaults::default_storage_class);
    let mut requests = BTreeMap::new();
    requests.insert("storage".to_owned(), storage.size.clone());
    PersistentVolumeClaim {
        metadata: ObjectMeta {
            name: Some("data".to_owned()),
            ..ObjectMeta::default()
        },
        spec: Some(PersistentVolumeClaimSpec {
            access_modes: Some(vec!["ReadWriteOnce".to_owned()]),
            storage_class_name: Some(storage_class),
            resources: Some(ResourceRequirements {
                requests: Some(requests),
                ..ResourceRequirements::default()
            }),
            ..PersistentVolumeClaimSpec::default()
        }),
        ..PersistentVolumeClaim::default()
    }
}

fn mongod_statefulset(w: &MongodWorkload, oref: OwnerReference) -> StatefulSet {
    let labels = workload_labels(&w.instance, w.component, &w.workload_name);

    let mut args = w.role_args.clone();
    args.extend([
        "--replSet".to_owned(),
        w.replset_name.clone(),
        "--bind_ip_all".to_owned(),
        "--auth".to_owned(),
        "--keyFile".to_owned(),
        KEYFILE_PATH.to_owned(),
        "--dbpath".to_owned(),
        w.data_dir.clone(),
        "--port".to_owned(),
        w.port.to_string(),
    ]);

    let readiness_probe = Probe {
        exec: Some(ExecAction {
            command: Some(mongosh_ping(w.port)),
        }),
        initial_delay_seconds: Some(5),
        period_seconds: Some(10),
        timeout_seconds: Some(5),
        ..Probe::default()
    };
    let liveness_probe = Probe {
        exec: Some(ExecAction {
            command: Some(mongosh_ping(w.port)),
        }),
        initial_delay_seconds: Some(30),
        period_seconds: Some(10),
        failure_threshold: Some(6),
        ..Probe::default()
    };

    let mongod = Container {
        name: MONGODB_CONTAINER.to_owned(),
        image: Some(w.image.clone()),
        command: Some(vec!["mongod".to_owned()]),
        args: Some(args),
        ports: Some(vec![ContainerPort {
            container_port: w.port,
            name: Some("mongodb".to_owned()),
            ..ContainerPort::default()
        }]),
        readiness_probe: Some(readiness_probe),
        liveness_probe: Some(liveness_probe),
        resources: w.overrides.and_then(|o| o.resources.clone()),
        volume_mounts: Some(vec![
            VolumeMount {
                name: "data".to_owned(),
                mount_path: w.data_dir.clone(),
                ..VolumeMount::default()
            },
            VolumeMount {
                name: "keyfile".to_owned(),
                mount_path: KEYFILE_MOUNT_PATH.to_owned(),
                read_only: Some(true),
                ..VolumeMount::default()
            },
            VolumeMount {
                name: "scripts".to_owned(),
                mount_path: SCRIPTS_MOUNT_PATH.to_owned(),
                ..VolumeMount::default()
            },
        ]),
        ..Container::default()
    };

    let mut containers = vec![mongod];
    if let Some(monitoring) = w.monitoring.filter(|m| m.enabled) {
        containers.push(exporter_container(monitoring, w.port));
    }

    StatefulSet {
        metadata: ObjectMeta {
            name: Some(w.workload_name.clone()),
            namespace: Some(w.namespace.clone()),
            labels: Some(labels.clone()),
            owner_references: Some(vec![oref]),
            ..ObjectMeta::default()
        },
        spec: Some(StatefulSetSpec {
            replicas: Some(w.replicas),
            service_name: format!("{}-headless", w.workload_name),
            pod_management_policy: Some("Parallel".to_owned()),
            update_strategy: Some(StatefulSetUpdateStrategy {
                type_: Some("RollingUpdate".to_owned()),
                ..StatefulSetUpdateStrategy::default()
            }),
            selector: LabelSelector {
                match_labels: Some(labels.clone()),
                ..LabelSelector::default()
            },
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(labels),
                    ..ObjectMeta::default()
                }),
                spec: Some(PodSpec {
                    affinity: Some(anti_affinity(&w.instance)),
                    node_selector: w.overrides.and_then(|o| o.nodeSelector.clone()),
                    containers,
                    volumes: Some(vec![
                        Volume {
                            name: "keyfile".to_owned(),
                            secret: Some(SecretVolumeSource {
                                secret_name: Some(w.keyfile_secret.clone()),
                                default_mode: Some(0o400),
                                ..SecretVolumeSource::default()
                            }),
                            ..Volume::default()
                        },
                        Volume {
                            name: "scripts".to_owned(),
                            config_map: Some(ConfigMapVolumeSource {
                                name: Some(w.scripts_configmap.clone()),
                                default_mode: Some(0o755),
                                ..ConfigMapVolumeSource::default()
                            }),
                            ..Volume::default()
                        },
                    ]),
                    ..PodSpec::default()
                }),
            },
            volume_claim_templates: Some(vec![data_volume_claim(w.storage)]),
            ..StatefulSetSpec::default()
        }),
        ..StatefulSet::default()
    }
}

/// Stateful workload for a standalone replica set, members on 27017.
pub fn replicaset_statefulset(mdb: &MongoDBReplicaSet, oref: OwnerReference) -> StatefulSet {
    let name = mdb.name_any();
    mongod_statefulset(
        &MongodWorkload {
            workload_name: name.clone(),
            instance: name.clone(),
            namespace: mdb.namespace().unwrap_or_default(),
            component: "mongodb",
            replicas: mdb.spec.members,
            replset_name: mdb.spec.replicaSetName.clone(),
            port: MONGODB_PORT,
            data_dir: mdb.data_dir(),
            role_args: vec![],
            image: mdb.image(),
            storage: &mdb.spec.storage,
            keyfile_secret: mdb.keyfile_secret_name(),
            scripts_configmap: mdb.scripts_configmap_name(),
            monitoring: mdb.spec.monitoring.as_ref(),
            overrides: mdb.spec.podOverrides.as_ref(),
        },
        oref,
    )
}

/// Config-server workload, members on 27019, data under /data/configdb.
pub fn config_server_statefulset(
    cluster: &MongoDBShardedCluster,
    oref: OwnerReference,
) -> StatefulSet {
    let data_dir = cluster
        .spec
        .configServer
        .storage
        .dataDir
        .clone()
        .unwrap_or_else(|| "/data/configdb".to_owned());
    mongod_statefulset(
        &MongodWorkload {
            workload_name: cluster.config_server_name(),
            instance: cluster.name_any(),
            namespace: cluster.namespace().unwrap_or_default(),
            component: "config-server",
            replicas: cluster.spec.configServer.members,
            replset_name: cluster.config_server_name(),
            port: CONFIG_SERVER_PORT,
            data_dir,
            role_args: vec!["--configsvr".to_owned()],
            image: cluster.image(),
            storage: &cluster.spec.configServer.storage,
            keyfile_secret: cluster.keyfile_secret_name(),
            scripts_configmap: cluster.scripts_configmap_name(),
            monitoring: cluster.spec.monitoring.as_ref(),
            overrides: None,
        },
        oref,
    )
}

/// Shard workload, members on 27018.
pub fn shard_statefulset(
    cluster: &MongoDBShardedCluster,
    index: i32,
    oref: OwnerReference,
) -> StatefulSet {
    let data_dir = cluster
        .spec
        .shards
        .storage
        .dataDir
        .clone()
        .unwrap_or_else(|| "/data/db".to_owned());
    mongod_statefulset(
        &MongodWorkload {
            workload_name: cluster.shard_name(index),
            instance: cluster.name_any(),
            namespace: cluster.namespace().unwrap_or_default(),
            component: "shard",
            replicas: cluster.spec.shards.membersPerShard,
            replset_name: cluster.shard_name(index),
            port: SHARD_PORT,
            data_dir,
            role_args: vec!["--shardsvr".to_owned()],
            image: cluster.image(),
            storage: &cluster.spec.shards.storage,
            keyfile_secret: cluster.keyfile_secret_name(),
            scripts_configmap: cluster.scripts_configmap_name(),
            monitoring: cluster.spec.monitoring.as_ref(),
            overrides: None,
        },
        oref,
    )
}

pub async fn reconcile_statefulset(
    client: Client,
    namespace: &str,
    sts: StatefulSet,
) -> Result<()> {
    let name = sts.name_any();
    let api: Api<StatefulSet> = Api::namespaced(client, namespace);
    apply_resource(&api, &name, sts).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::apis::mongodb_types::{
        AuthSpec, ConfigServerSpec, MongoDBReplicaSetSpec, MongoDBShardedClusterSpec, MongosSpec,
        SecretRef, ShardsSpec,
    };
    use k8s_openapi::apimachinery::pkg::api::resource::Quantity;

    fn test_replicaset() -> MongoDBReplicaSet {
        let mut mdb = MongoDBReplicaSet::new(
            "db",
            MongoDBReplicaSetSpec {
                members: 3,
                replicaSetName: "rs0".to_owned(),
                version: "8.2".to_owned(),
                storage: StorageSpec::default(),
                tls: None,
                auth: AuthSpec {
                    mechanism: "SCRAM-SHA-256".to_owned(),
                    adminCredentialsSecretRef: SecretRef {
                        name: "mongodb-admin".to_owned(),
                    },
                },
                monitoring: None,
                arbiter: false,
                podOverrides: None,
            },
        );
        mdb.metadata.namespace = Some("prod".to_owned());
        mdb
    }

    fn test_cluster() -> MongoDBShardedCluster {
        let mut cluster = MongoDBShardedCluster::new(
            "shop",
            MongoDBShardedClusterSpec {
                version: "8.2".to_owned(),
                configServer: ConfigServerSpec::default(),
                shards: ShardsSpec::default(),
                mongos: MongosSpec::default(),
                auth: AuthSpec {
                    mechanism: "SCRAM-SHA-256".to_owned(),
                    adminCredentialsSecretRef: SecretRef {
                        name: "mongodb-admin".to_owned(),
                    },
                },
                monitoring: None,
            },
        );
        cluster.metadata.namespace = Some("prod".to_owned());
        cluster
    }

    #[test]
    fn test_replicaset_statefulset_shape() {
        let mdb = test_replicaset();
        let sts = replicaset_statefulset(&mdb, OwnerReference::default());
        assert_eq!(sts.metadata.name.as_deref(), Some("db"));
        let spec = sts.spec.unwrap();
        assert_eq!(spec.replicas, Some(3));
        assert_eq!(spec.service_name, "db-headless");
        assert_eq!(spec.pod_management_policy.as_deref(), Some("Parallel"));

        let pod_spec = spec.template.spec.unwrap();
        let mongod = &pod_spec.containers[0];
        assert_eq!(mongod.name, "mongodb");
        assert_eq!(mongod.image.as_deref(), Some("mongo:8.2"));
        let args = mongod.args.as_ref().unwrap();
        assert!(args.windows(2).any(|w| w == ["--replSet", "rs0"]));
        assert!(args.contains(&"--auth".to_owned()));
        assert!(args.windows(2).any(|w| w
            == ["--keyFile".to_owned(), KEYFILE_PATH.to_owned()]));

        // keyfile is read-only with mode 0400
        let volumes = pod_spec.volumes.unwrap();
        let keyfile = volumes.iter().find(|v| v.name == "keyfile").unwrap();
        assert_eq!(keyfile.secret.as_ref().unwrap().default_mode, Some(0o400));

        // anti-affinity prefers spreading across hostnames
        let affinity = pod_spec.affinity.unwrap().pod_anti_affinity.unwrap();
        let term = &affinity
            .preferred_during_scheduling_ignored_during_execution
            .unwrap()[0];
        assert_eq!(term.weight, 100);
        assert_eq!(term.pod_affinity_term.topology_key, "kubernetes.io/hostname");

        // data claim defaults
        let pvc = &spec.volume_claim_templates.unwrap()[0];
        let pvc_spec = pvc.spec.as_ref().unwrap();
        assert_eq!(pvc_spec.storage_class_name.as_deref(), Some("ceph-block"));
        assert_eq!(
            pvc_spec
                .resources
                .as_ref()
                .unwrap()
                .requests
                .as_ref()
                .unwrap()
                .get("storage")
                .unwrap(),
            &Quantity("10Gi".to_owned())
        );
    }

    #[test]
    fn test_config_server_statefulset() {
        let cluster = test_cluster();
        let sts = config_server_statefulset(&cluster, OwnerReference::default());
        assert_eq!(sts.metadata.name.as_deref(), Some("shop-cfg"));
        let spec = sts.spec.unwrap();
        let mongod = &spec.template.spec.unwrap().containers[0];
        let args = mongod.args.as_ref().unwrap();
        assert_eq!(args[0], "--configsvr");
        assert!(args.windows(2).any(|w| w == ["--replSet", "shop-cfg"]));
        assert!(args.windows(2).any(|w| w == ["--dbpath", "/data/configdb"]));
        assert!(args.windows(2).any(|w| w == ["--port", "27019"]));
    }

    #[test]
    fn test_shard_statefulset() {
        let cluster = test_cluster();
        let sts = shard_statefulset(&cluster, 1, OwnerReference::default());
        assert_eq!(sts.metadata.name.as_deref(), Some("shop-shard-1"));
        let spec = sts.spec.unwrap();
        assert_eq!(spec.replicas, Some(3));
        assert_eq!(spec.service_name, "shop-shard-1-headless");
        let mongod = &spec.template.spec.unwrap().containers[0];
        let args = mongod.args.as_ref().unwrap();
        assert_eq!(args[0], "--shardsvr");
        assert!(args.windows(2).any(|w| w == ["--replSet", "shop-shard-1"]));
        assert!(args.windows(2).any(|w| w == ["--port", "27018"]));

        // shards default to the larger volume
        let pvc = &spec.volume_claim_templates.unwrap()[0];
        assert_eq!(
            pvc.spec
                .as_ref()
                .unwrap()
                .resources
                .as_ref()
                .unwrap()
                .requests
                .as_ref()
                .unwrap()
                .get("storage")
                .unwrap(),
            &Quantity("50Gi".to_owned())
        );
    }

    #[test]
    fn test_monitoring_sidecar_appended() {
        let mut mdb = test_replicaset();
        mdb.spec.monitoring = Some(MonitoringSpec {
            enabled: true,
            exporterImage: defaults::default_exporter_image(),
        });
        let sts = replicaset_statefulset(&mdb, OwnerReference::default());
        let containers = sts.spec.unwrap().template.spec.unwrap().containers;
        assert_eq!(containers.len(), 2);
        assert_eq!(containers[1].name, "metrics");
        assert_eq!(
            containers[1].ports.as_ref().unwrap()[0].container_port,
            METRICS_PORT
        );
    }
}
