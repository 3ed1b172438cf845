use crate::{Error, Result};
use kube::{
    api::{Api, PostParams},
    Resource, ResourceExt,
};
use serde::{de::DeserializeOwned, Serialize};
use std::collections::BTreeMap;
use tracing::debug;

/// Canonical labels stamped on every owned child object.
pub fn canonical_labels(instance: &str, component: &str) -> BTreeMap<String, String> {
    let mut labels = BTreeMap::new();
    labels.insert("app.kubernetes.io/name".to_owned(), "mongodb".to_owned());
    labels.insert("app.kubernetes.io/instance".to_owned(), instance.to_owned());
    labels.insert(
        "app.kubernetes.io/component".to_owned(),
        component.to_owned(),
    );
    labels.insert(
        "app.kubernetes.io/managed-by".to_owned(),
        "mongodb-operator".to_owned(),
    );
    labels
}

/// Labels for the pods of one stateful workload, distinguishable from
/// sibling workloads of the same instance (shards of a sharded cluster).
pub fn workload_labels(
    instance: &str,
    component: &str,
    workload: &str,
) -> BTreeMap<String, String> {
    let mut labels = canonical_labels(instance, component);
    labels.insert("statefulset".to_owned(), workload.to_owned());
    labels
}

/// Create the object if it does not exist, otherwise update it in place,
/// carrying over the resource version of the observed object.
pub async fn apply_resource<K>(api: &Api<K>, name: &str, mut desired: K) -> Result<K>
where
    K: Resource<DynamicType = ()> + Clone + std::fmt::Debug + DeserializeOwned + Serialize,
{
    match api.get(name).await {
        Ok(existing) => {
            desired.meta_mut().resource_version = existing.resource_version();
            debug!("updating {}", name);
            api.replace(name, &PostParams::default(), &desired)
                .await
                .map_err(Error::KubeError)
        }
        Err(kube::Error::Api(ae)) if ae.code == 404 => {
            debug!("creating {}", name);
            api.create(&PostParams::default(), &desired)
                .await
                .map_err(Error::KubeError)
        }
        Err(e) => Err(Error::KubeError(e)),
    }
}

/// Create the object only if it does not exist; never rewrite it. A lost
/// creation race reports AlreadyExists, which is success here.
pub async fn create_if_absent<K>(api: &Api<K>, name: &str, desired: K) -> Result<()>
where
    K: Resource<DynamicType = ()> + Clone + std::fmt::Debug + DeserializeOwned + Serialize,
{
    match api.get(name).await {
        Ok(_) => Ok(()),
        Err(kube::Error::Api(ae)) if ae.code == 404 => {
            debug!("creating {}", name);
            match api.create(&PostParams::default(), &desired).await {
                Ok(_) => Ok(()),
                Err(kube::Error::Api(ae)) if ae.code == 409 => Ok(()),
                Err(e) => Err(Error::KubeError(e)),
            }
        }
        Err(e) => Err(Error::KubeError(e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_canonical_labels() {
        let labels = canonical_labels("shop", "mongos");
        assert_eq!(labels.get("app.kubernetes.io/name").unwrap(), "mongodb");
        assert_eq!(labels.get("app.kubernetes.io/instance").unwrap(), "shop");
        assert_eq!(labels.get("app.kubernetes.io/component").unwrap(), "mongos");
        assert_eq!(
            labels.get("app.kubernetes.io/managed-by").unwrap(),
            "mongodb-operator"
        );
    }

    #[test]
    fn test_workload_labels_distinguish_shards() {
        let shard0 = workload_labels("shop", "shard", "shop-shard-0");
        let shard1 = workload_labels("shop", "shard", "shop-shard-1");
        assert_ne!(shard0, shard1);
        assert_eq!(shard0.get("statefulset").unwrap(), "shop-shard-0");
    }
}
