use crate::{
    apis::mongodb_types::MongoDBShardedCluster,
    configmap::CONFIGDB_KEY,
    kubernetes::{apply_resource, canonical_labels},
    replset::MONGODB_PORT,
    service::METRICS_PORT,
    statefulset::{KEYFILE_MOUNT_PATH, KEYFILE_PATH},
    Result,
};
use k8s_openapi::{
    api::{
        apps::v1::{Deployment, DeploymentSpec},
        core::v1::{
            ConfigMapKeySelector, Container, ContainerPort, EnvVar, EnvVarSource, ExecAction,
            PodSpec, PodTemplateSpec, Probe, ResourceRequirements, SecretVolumeSource,
            TCPSocketAction, Volume, VolumeMount,
        },
    },
    apimachinery::pkg::{
        api::resource::Quantity,
        apis::meta::v1::{LabelSelector, ObjectMeta, OwnerReference},
        util::intstr::IntOrString,
    },
};
use kube::{api::Api, client::Client, ResourceExt};
use std::collections::BTreeMap;

pub const MONGOS_CONTAINER: &str = "mongos";

/// Routers need headroom for connection handling; below half a GiB they
/// OOM under load.
fn mongos_resources() -> ResourceRequirements {
    let mut requests = BTreeMap::new();
    requests.insert("memory".to_owned(), Quantity("512Mi".to_owned()));
    ResourceRequirements {
        requests: Some(requests),
        ..ResourceRequirements::default()
    }
}

/// Stateless router deployment. The config-server connection string is
/// read from the mongos configmap and expanded into the args.
pub fn mongos_deployment(cluster: &MongoDBShardedCluster, oref: OwnerReference) -> Deployment {
    let instance = cluster.name_any();
    let ns = cluster.namespace().unwrap_or_default();
    let labels = canonical_labels(&instance, "mongos");

    let readiness_probe = Probe {
        exec: Some(ExecAction {
            command: Some(vec![
                "mongosh".to_owned(),
                "--quiet".to_owned(),
                "--port".to_owned(),
                MONGODB_PORT.to_string(),
                "--eval".to_owned(),
                "db.adminCommand('ping')".to_owned(),
            ]),
        }),
        initial_delay_seconds: Some(5),
        period_seconds: Some(10),
        timeout_seconds: Some(5),
        ..Probe::default()
    };
    let liveness_probe = Probe {
        tcp_socket: Some(TCPSocketAction {
            port: IntOrString::Int(MONGODB_PORT),
            ..TCPSocketAction::default()
        }),
        initial_delay_seconds: Some(30),
        period_seconds: Some(10),
        ..Probe::default()
    };

    let container = Container {
        name: MONGOS_CONTAINER.to_owned(),
        image: Some(cluster.image()),
        command: Some(vec!["mongos".to_owned()]),
        args: Some(vec![
            "--configdb".to_owned(),
            "$(CONFIGDB)".to_owned(),
            "--bind_ip_all".to_owned(),
            "--keyFile".to_owned(),
            KEYFILE_PATH.to_owned(),
            "--port".to_owned(),
            MONGODB_PORT.to_string(),
        ]),
        env: Some(vec![EnvVar {
            name: "CONFIGDB".to_owned(),
            value_from: Some(EnvVarSource {
                config_map_key_ref: Some(ConfigMapKeySelector {
                    name: Some(cluster.mongos_configmap_name()),
                    key: CONFIGDB_KEY.to_owned(),
                    ..ConfigMapKeySelector::default()
                }),
                ..EnvVarSource::default()
            }),
            ..EnvVar::default()
        }]),
        ports: Some(vec![
            ContainerPort {
                container_port: MONGODB_PORT,
                name: Some("mongodb".to_owned()),
                ..ContainerPort::default()
            },
            ContainerPort {
                container_port: METRICS_PORT,
                name: Some("metrics".to_owned()),
                ..ContainerPort::default()
            },
        ]),
        readiness_probe: Some(readiness_probe),
        liveness_probe: Some(liveness_probe),
        resources: Some(mongos_resources()),
        volume_mounts: Some(vec![VolumeMount {
            name: "keyfile".to_owned(),
            mount_path: KEYFILE_MOUNT_PATH.to_owned(),
            read_only: Some(true),
            ..VolumeMount::default()
        }]),
        ..Container::default()
    };

    Deployment {
        metadata: ObjectMeta {
            name: Some(cluster.mongos_name()),
            namespace: Some(ns),
            labels: Some(labels.clone()),
            owner_references: Some(vec![oref]),
            ..ObjectMeta::default()
        },
        spec: Some(DeploymentSpec {
            replicas: Some(cluster.spec.mongos.replicas),
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
                    containers: vec![container],
                    volumes: Some(vec![Volume {
                        name: "keyfile".to_owned(),
                        secret: Some(SecretVolumeSource {
                            secret_name: Some(cluster.keyfile_secret_name()),
                            default_mode: Some(0o400),
                            ..SecretVolumeSource::default()
                        }),
                        ..Volume::default()
                    }]),
                    ..PodSpec::default()
                }),
            },
            ..DeploymentSpec::default()
        }),
        ..Deployment::default()
    }
}

pub async fn reconcile_mongos_deployment(
    client: Client,
    cluster: &MongoDBShardedCluster,
    oref: OwnerReference,
) -> Result<()> {
    let ns = cluster.namespace().unwrap_or_default();
    let api: Api<Deployment> = Api::namespaced(client, &ns);
    let deployment = mongos_deployment(cluster, oref);
    apply_resource(&api, &cluster.mongos_name(), deployment).await?;
    Ok(())
}
