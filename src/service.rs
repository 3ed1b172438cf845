use crate::{
    apis::mongodb_types::{MongoDBReplicaSet, MongoDBShardedCluster},
    kubernetes::{apply_resource, canonical_labels, workload_labels},
    replset::MONGODB_PORT,
    Result,
};
use k8s_openapi::{
    api::core::v1::{Service, ServicePort, ServiceSpec},
    apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference},
};
use kube::{api::Api, client::Client, ResourceExt};

pub const METRICS_PORT: i32 = 9216;

fn mongodb_port(port: i32) -> ServicePort {
    ServicePort {
        name: Some("mongodb".to_owned()),
        port,
        ..ServicePort::default()
    }
}

fn metrics_port() -> ServicePort {
    ServicePort {
        name: Some("metrics".to_owned()),
        port: METRICS_PORT,
        ..ServicePort::default()
    }
}

/// Headless service for one stateful workload. Publishes addresses for
/// not-ready pods so members can resolve one another before the replica
/// set has formed.
pub fn headless_service(
    instance: &str,
    namespace: &str,
    workload: &str,
    component: &str,
    port: i32,
    oref: OwnerReference,
) -> Service {
    let selector = workload_labels(instance, component, workload);
    Service {
        metadata: ObjectMeta {
            name: Some(format!("{workload}-headless")),
            namespace: Some(namespace.to_owned()),
            labels: Some(selector.clone()),
            owner_references: Some(vec![oref]),
            ..ObjectMeta::default()
        },
        spec: Some(ServiceSpec {
            cluster_ip: Some("None".to_owned()),
            publish_not_ready_addresses: Some(true),
            selector: Some(selector),
            ports: Some(vec![mongodb_port(port)]),
            ..ServiceSpec::default()
        }),
        ..Service::default()
    }
}

pub async fn reconcile_headless_service(
    client: Client,
    instance: &str,
    namespace: &str,
    workload: &str,
    component: &str,
    port: i32,
    oref: OwnerReference,
) -> Result<()> {
    let api: Api<Service> = Api::namespaced(client, namespace);
    let svc = headless_service(instance, namespace, workload, component, port, oref);
    let name = format!("{workload}-headless");
    apply_resource(&api, &name, svc).await?;
    Ok(())
}

/// Client-facing service for a replica set, named after the resource.
pub fn client_service(mdb: &MongoDBReplicaSet, oref: OwnerReference) -> Service {
    let name = mdb.name_any();
    let ns = mdb.namespace().unwrap_or_default();
    let selector = workload_labels(&name, "mongodb", &name);
    Service {
        metadata: ObjectMeta {
            name: Some(name.clone()),
            namespace: Some(ns),
            labels: Some(canonical_labels(&name, "mongodb")),
            owner_references: Some(vec![oref]),
            ..ObjectMeta::default()
        },
        spec: Some(ServiceSpec {
            type_: Some("ClusterIP".to_owned()),
            selector: Some(selector),
            ports: Some(vec![mongodb_port(MONGODB_PORT), metrics_port()]),
            ..ServiceSpec::default()
        }),
        ..Service::default()
    }
}

pub async fn reconcile_client_service(
    client: Client,
    mdb: &MongoDBReplicaSet,
    oref: OwnerReference,
) -> Result<()> {
    let ns = mdb.namespace().unwrap_or_default();
    let api: Api<Service> = Api::namespaced(client, &ns);
    let svc = client_service(mdb, oref);
    apply_resource(&api, &mdb.name_any(), svc).await?;
    Ok(())
}

/// Router service for a sharded cluster, typed per the spec.
pub fn mongos_service(cluster: &MongoDBShardedCluster, oref: OwnerReference) -> Service {
    let instance = cluster.name_any();
    let ns = cluster.namespace().unwrap_or_default();
    let selector = canonical_labels(&instance, "mongos");
    Service {
        metadata: ObjectMeta {
            name: Some(cluster.mongos_name()),
            namespace: Some(ns),
            labels: Some(selector.clone()),
            owner_references: Some(vec![oref]),
            ..ObjectMeta::default()
        },
        spec: Some(ServiceSpec {
            type_: Some(cluster.spec.mongos.serviceType.clone()),
            selector: Some(selector),
            ports: Some(vec![mongodb_port(MONGODB_PORT), metrics_port()]),
            ..ServiceSpec::default()
        }),
        ..Service::default()
    }
}

pub async fn reconcile_mongos_service(
    client: Client,
    cluster: &MongoDBShardedCluster,
    oref: OwnerReference,
) -> Result<()> {
    let ns = cluster.namespace().unwrap_or_default();
    let api: Api<Service> = Api::namespaced(client, &ns);
    let svc = mongos_service(cluster, oref);
    apply_resource(&api, &cluster.mongos_name(), svc).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_headless_service_shape() {
        let svc = headless_service(
            "shop",
            "prod",
            "shop-shard-1",
            "shard",
            27018,
            OwnerReference::default(),
        );
        assert_eq!(svc.metadata.name.as_deref(), Some("shop-shard-1-headless"));
        let spec = svc.spec.unwrap();
        assert_eq!(spec.cluster_ip.as_deref(), Some("None"));
        assert_eq!(spec.publish_not_ready_addresses, Some(true));
        let selector = spec.selector.unwrap();
        assert_eq!(selector.get("statefulset").unwrap(), "shop-shard-1");
        assert_eq!(spec.ports.unwrap()[0].port, 27018);
    }
}
