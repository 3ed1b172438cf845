use crate::{
    apis::mongodb_types::MongoDBShardedCluster,
    exec::statefulset_fqdns,
    kubernetes::{apply_resource, canonical_labels},
    replset::CONFIG_SERVER_PORT,
    Result,
};
use itertools::Itertools;
use k8s_openapi::{
    api::core::v1::ConfigMap,
    apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference},
};
use kube::{api::Api, client::Client, ResourceExt};
use std::collections::BTreeMap;

pub const CONFIGDB_KEY: &str = "configdb";

/// Startup/debug scripts mounted into every mongod pod at /scripts.
pub fn scripts_configmap(
    configmap_name: &str,
    instance: &str,
    namespace: &str,
    oref: OwnerReference,
) -> ConfigMap {
    let readiness = "#!/bin/sh\n\
        # Probe helper, mounted so it can be patched without an image rebuild.\n\
        exec mongosh --quiet --port \"${1:-27017}\" \
        --eval \"db.adminCommand('ping').ok\" | grep -q 1\n";
    let mut data = BTreeMap::new();
    data.insert("readiness.sh".to_owned(), readiness.to_owned());
    ConfigMap {
        metadata: ObjectMeta {
            name: Some(configmap_name.to_owned()),
            namespace: Some(namespace.to_owned()),
            labels: Some(canonical_labels(instance, "scripts")),
            owner_references: Some(vec![oref]),
            ..ObjectMeta::default()
        },
        data: Some(data),
        ..ConfigMap::default()
    }
}

pub async fn reconcile_scripts_configmap(
    client: Client,
    configmap_name: &str,
    instance: &str,
    namespace: &str,
    oref: OwnerReference,
) -> Result<()> {
    let api: Api<ConfigMap> = Api::namespaced(client, namespace);
    let cm = scripts_configmap(configmap_name, instance, namespace, oref);
    apply_resource(&api, configmap_name, cm).await?;
    Ok(())
}

/// The config-server connection string the routers point at, e.g.
/// `shop-cfg/shop-cfg-0.shop-cfg-headless.ns.svc.cluster.local:27019,…`.
pub fn configdb_connection_string(cluster: &MongoDBShardedCluster) -> String {
    let ns = cluster.namespace().unwrap_or_default();
    let hosts = statefulset_fqdns(
        &cluster.config_server_name(),
        &cluster.config_server_headless_service_name(),
        &ns,
        cluster.spec.configServer.members,
        CONFIG_SERVER_PORT,
    );
    format!(
        "{}/{}",
        cluster.config_server_name(),
        hosts.iter().join(",")
    )
}

pub fn mongos_configmap(cluster: &MongoDBShardedCluster, oref: OwnerReference) -> ConfigMap {
    let name = cluster.name_any();
    let ns = cluster.namespace().unwrap_or_default();
    let mut data = BTreeMap::new();
    data.insert(CONFIGDB_KEY.to_owned(), configdb_connection_string(cluster));
    ConfigMap {
        metadata: ObjectMeta {
            name: Some(cluster.mongos_configmap_name()),
            namespace: Some(ns),
            labels: Some(canonical_labels(&name, "mongos")),
            owner_references: Some(vec![oref]),
            ..ObjectMeta::default()
        },
        data: Some(data),
        ..ConfigMap::default()
    }
}

pub async fn reconcile_mongos_configmap(
    client: Client,
    cluster: &MongoDBShardedCluster,
    oref: OwnerReference,
) -> Result<()> {
    let ns = cluster.namespace().unwrap_or_default();
    let api: Api<ConfigMap> = Api::namespaced(client, &ns);
    let cm = mongos_configmap(cluster, oref);
    apply_resource(&api, &cluster.mongos_configmap_name(), cm).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::apis::mongodb_types::{
        AuthSpec, ConfigServerSpec, MongoDBShardedClusterSpec, MongosSpec, SecretRef, ShardsSpec,
    };

    fn test_cluster() -> MongoDBShardedCluster {
        let mut cluster = MongoDBShardedCluster::new(
            "shop",
            MongoDBShardedClusterSpec {
                version: "8.2".to_owned(),
                configServer: ConfigServerSpec {
                    members: 3,
                    ..ConfigServerSpec::default()
                },
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
    fn test_configdb_connection_string() {
        let cluster = test_cluster();
        assert_eq!(
            configdb_connection_string(&cluster),
            "shop-cfg/shop-cfg-0.shop-cfg-headless.prod.svc.cluster.local:27019,\
             shop-cfg-1.shop-cfg-headless.prod.svc.cluster.local:27019,\
             shop-cfg-2.shop-cfg-headless.prod.svc.cluster.local:27019"
        );
    }

    #[test]
    fn test_mongos_configmap_carries_single_entry() {
        let cluster = test_cluster();
        let oref = OwnerReference::default();
        let cm = mongos_configmap(&cluster, oref);
        assert_eq!(cm.metadata.name.as_deref(), Some("shop-mongos-config"));
        let data = cm.data.unwrap();
        assert_eq!(data.len(), 1);
        assert!(data.get(CONFIGDB_KEY).unwrap().starts_with("shop-cfg/"));
    }

    #[test]
    fn test_scripts_configmap() {
        let cm = scripts_configmap("shop-scripts", "shop", "prod", OwnerReference::default());
        let data = cm.data.unwrap();
        assert!(data.get("readiness.sh").unwrap().contains("mongosh"));
    }
}
