use crate::defaults;
use chrono::{DateTime, Utc};
use k8s_openapi::{
    api::core::v1::ResourceRequirements,
    apimachinery::pkg::{api::resource::Quantity, apis::meta::v1::Condition},
};
use kube::{CustomResource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

pub const API_GROUP: &str = "mongodb.keiailab.com";

/// Reference to a secret in the same namespace, by name.
#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema, Default, PartialEq)]
pub struct SecretRef {
    pub name: String,
}

#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema, PartialEq)]
#[allow(non_snake_case)]
pub struct StorageSpec {
    /// Storage class for the per-pod volume claims. Empty means the
    /// cluster default, which the builders treat as `ceph-block`.
    pub className: Option<String>,
    #[serde(default = "defaults::default_storage_size")]
    pub size: Quantity,
    pub dataDir: Option<String>,
}

impl Default for StorageSpec {
    fn default() -> Self {
        defaults::default_storage()
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema, Default)]
#[allow(non_snake_case)]
pub struct TlsSpec {
    #[serde(default)]
    pub enabled: bool,
    pub secretRef: Option<SecretRef>,
}

#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema, Default)]
#[allow(non_snake_case)]
pub struct AuthSpec {
    #[serde(default = "defaults::default_auth_mechanism")]
    pub mechanism: String,
    pub adminCredentialsSecretRef: SecretRef,
}

#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema, Default)]
#[allow(non_snake_case)]
pub struct MonitoringSpec {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "defaults::default_exporter_image")]
    pub exporterImage: String,
}

#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema, Default)]
#[allow(non_snake_case)]
pub struct PodOverrides {
    pub resources: Option<ResourceRequirements>,
    pub nodeSelector: Option<BTreeMap<String, String>>,
}

/// Phase of a replica set or sharded cluster resource.
#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema, Default, PartialEq, Eq)]
pub enum ClusterPhase {
    #[default]
    Pending,
    Initializing,
    Running,
    Failed,
    Upgrading,
}

impl fmt::Display for ClusterPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ClusterPhase::Pending => "Pending",
            ClusterPhase::Initializing => "Initializing",
            ClusterPhase::Running => "Running",
            ClusterPhase::Failed => "Failed",
            ClusterPhase::Upgrading => "Upgrading",
        };
        write!(f, "{s}")
    }
}

/// Generate the Kubernetes wrapper struct `MongoDBReplicaSet` from our Spec
/// and Status struct
///
/// This provides a hook for generating the CRD yaml (in crdgen.rs)
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, JsonSchema)]
#[cfg_attr(test, derive(Default))]
#[kube(
    kind = "MongoDBReplicaSet",
    group = "mongodb.keiailab.com",
    version = "v1alpha1",
    namespaced
)]
#[kube(status = "MongoDBReplicaSetStatus", shortname = "mdbrs")]
#[kube(
    printcolumn = r#"{"name":"Phase","type":"string","jsonPath":".status.phase"}"#
)]
#[kube(
    printcolumn = r#"{"name":"Ready","type":"integer","jsonPath":".status.readyMembers"}"#
)]
#[kube(
    printcolumn = r#"{"name":"Primary","type":"string","jsonPath":".status.currentPrimary"}"#
)]
#[kube(
    printcolumn = r#"{"name":"Version","type":"string","jsonPath":".spec.version"}"#
)]
#[kube(
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[allow(non_snake_case)]
pub struct MongoDBReplicaSetSpec {
    #[serde(default = "defaults::default_members")]
    pub members: i32,

    #[serde(default = "defaults::default_replica_set_name")]
    pub replicaSetName: String,

    #[serde(default = "defaults::default_version")]
    pub version: String,

    #[serde(default)]
    pub storage: StorageSpec,

    pub tls: Option<TlsSpec>,

    pub auth: AuthSpec,

    pub monitoring: Option<MonitoringSpec>,

    #[serde(default)]
    pub arbiter: bool,

    pub podOverrides: Option<PodOverrides>,
}

/// The status object of `MongoDBReplicaSet`
#[derive(Deserialize, Serialize, Clone, Default, Debug, JsonSchema)]
#[allow(non_snake_case)]
pub struct MongoDBReplicaSetStatus {
    #[serde(default)]
    pub phase: ClusterPhase,
    #[serde(default)]
    pub readyMembers: i32,
    pub currentPrimary: Option<String>,
    #[serde(default)]
    pub replicaSetInitialized: bool,
    #[serde(default)]
    pub adminUserCreated: bool,
    pub connectionURI: Option<String>,
    pub observedGeneration: Option<i64>,
    #[serde(default)]
    pub conditions: Vec<Condition>,
}

impl MongoDBReplicaSet {
    pub fn headless_service_name(&self) -> String {
        format!("{}-headless", self.name_any())
    }

    pub fn keyfile_secret_name(&self) -> String {
        format!("{}-keyfile", self.name_any())
    }

    pub fn scripts_configmap_name(&self) -> String {
        format!("{}-scripts", self.name_any())
    }

    pub fn image(&self) -> String {
        format!("mongo:{}", self.spec.version)
    }

    pub fn data_dir(&self) -> String {
        self.spec
            .storage
            .dataDir
            .clone()
            .unwrap_or_else(|| "/data/db".to_owned())
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema)]
#[allow(non_snake_case)]
pub struct ConfigServerSpec {
    #[serde(default = "defaults::default_config_server_members")]
    pub members: i32,
    #[serde(default)]
    pub storage: StorageSpec,
}

impl Default for ConfigServerSpec {
    fn default() -> Self {
        Self {
            members: defaults::default_config_server_members(),
            storage: StorageSpec::default(),
        }
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema)]
#[allow(non_snake_case)]
pub struct ShardsSpec {
    #[serde(default = "defaults::default_shard_count")]
    pub count: i32,
    #[serde(default = "defaults::default_members_per_shard")]
    pub membersPerShard: i32,
    #[serde(default = "defaults::default_shard_storage")]
    pub storage: StorageSpec,
}

impl Default for ShardsSpec {
    fn default() -> Self {
        Self {
            count: defaults::default_shard_count(),
            membersPerShard: defaults::default_members_per_shard(),
            storage: defaults::default_shard_storage(),
        }
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema)]
#[allow(non_snake_case)]
pub struct MongosSpec {
    #[serde(default = "defaults::default_mongos_replicas")]
    pub replicas: i32,
    #[serde(default = "defaults::default_service_type")]
    pub serviceType: String,
}

impl Default for MongosSpec {
    fn default() -> Self {
        Self {
            replicas: defaults::default_mongos_replicas(),
            serviceType: defaults::default_service_type(),
        }
    }
}

#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, JsonSchema)]
#[cfg_attr(test, derive(Default))]
#[kube(
    kind = "MongoDBShardedCluster",
    group = "mongodb.keiailab.com",
    version = "v1alpha1",
    namespaced
)]
#[kube(status = "MongoDBShardedClusterStatus", shortname = "mdbsc")]
#[kube(
    printcolumn = r#"{"name":"Phase","type":"string","jsonPath":".status.phase"}"#
)]
#[kube(
    printcolumn = r#"{"name":"Shards","type":"integer","jsonPath":".spec.shards.count"}"#
)]
#[kube(
    printcolumn = r#"{"name":"Version","type":"string","jsonPath":".spec.version"}"#
)]
#[kube(
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[allow(non_snake_case)]
pub struct MongoDBShardedClusterSpec {
    #[serde(default = "defaults::default_version")]
    pub version: String,

    #[serde(default)]
    pub configServer: ConfigServerSpec,

    #[serde(default)]
    pub shards: ShardsSpec,

    #[serde(default)]
    pub mongos: MongosSpec,

    pub auth: AuthSpec,

    pub monitoring: Option<MonitoringSpec>,
}

/// Readiness of one component (config server or mongos tier).
#[derive(Deserialize, Serialize, Clone, Default, Debug, JsonSchema)]
pub struct ComponentStatus {
    #[serde(default)]
    pub ready: i32,
    #[serde(default)]
    pub total: i32,
    #[serde(default)]
    pub phase: ClusterPhase,
}

#[derive(Deserialize, Serialize, Clone, Default, Debug, JsonSchema)]
pub struct ShardStatus {
    pub name: String,
    #[serde(default)]
    pub ready: i32,
    #[serde(default)]
    pub total: i32,
    #[serde(default)]
    pub phase: ClusterPhase,
}

/// The status object of `MongoDBShardedCluster`
#[derive(Deserialize, Serialize, Clone, Default, Debug, JsonSchema)]
#[allow(non_snake_case)]
pub struct MongoDBShardedClusterStatus {
    #[serde(default)]
    pub phase: ClusterPhase,
    pub configServer: Option<ComponentStatus>,
    pub mongos: Option<ComponentStatus>,
    #[serde(default)]
    pub shards: Vec<ShardStatus>,
    #[serde(default)]
    pub configServerInitialized: bool,
    #[serde(default)]
    pub shardsInitialized: Vec<bool>,
    #[serde(default)]
    pub shardsAdded: Vec<bool>,
    #[serde(default)]
    pub adminUserCreated: bool,
    pub connectionURI: Option<String>,
    pub observedGeneration: Option<i64>,
    #[serde(default)]
    pub conditions: Vec<Condition>,
}

impl MongoDBShardedCluster {
    pub fn config_server_name(&self) -> String {
        format!("{}-cfg", self.name_any())
    }

    pub fn config_server_headless_service_name(&self) -> String {
        format!("{}-headless", self.config_server_name())
    }

    pub fn shard_name(&self, index: i32) -> String {
        format!("{}-shard-{}", self.name_any(), index)
    }

    pub fn shard_headless_service_name(&self, index: i32) -> String {
        format!("{}-headless", self.shard_name(index))
    }

    pub fn mongos_name(&self) -> String {
        format!("{}-mongos", self.name_any())
    }

    pub fn mongos_configmap_name(&self) -> String {
        format!("{}-mongos-config", self.name_any())
    }

    pub fn keyfile_secret_name(&self) -> String {
        format!("{}-keyfile", self.name_any())
    }

    pub fn scripts_configmap_name(&self) -> String {
        format!("{}-scripts", self.name_any())
    }

    pub fn image(&self) -> String {
        format!("mongo:{}", self.spec.version)
    }
}

/// Which kind of cluster a backup targets.
#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema, Default, PartialEq, Eq)]
pub enum TargetKind {
    #[default]
    ReplicaSet,
    Sharded,
}

#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema, Default)]
pub struct ClusterRef {
    pub name: String,
    #[serde(default)]
    pub kind: TargetKind,
}

#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema, Default)]
#[allow(non_snake_case)]
pub struct S3StorageSpec {
    pub bucket: String,
    #[serde(default)]
    pub prefix: String,
    pub region: Option<String>,
    pub endpoint: Option<String>,
    pub credentialsSecretRef: SecretRef,
}

#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema, Default)]
#[allow(non_snake_case)]
pub struct PersistentVolumeStorageSpec {
    pub claimName: String,
    pub path: Option<String>,
}

#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema, Default)]
#[allow(non_snake_case)]
pub struct BackupStorageSpec {
    pub s3: Option<S3StorageSpec>,
    pub persistentVolume: Option<PersistentVolumeStorageSpec>,
}

#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum BackupType {
    #[default]
    Full,
    Incremental,
}

#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum CompressionAlgorithm {
    #[default]
    Gzip,
    Zstd,
    Snappy,
}

impl CompressionAlgorithm {
    /// File suffix of the compressed archive.
    pub fn extension(&self) -> &'static str {
        match self {
            CompressionAlgorithm::Gzip => "gz",
            CompressionAlgorithm::Zstd => "zst",
            CompressionAlgorithm::Snappy => "snappy",
        }
    }

    /// Pipe command the backup script compresses through.
    pub fn command(&self) -> &'static str {
        match self {
            CompressionAlgorithm::Gzip => "gzip",
            CompressionAlgorithm::Zstd => "zstd",
            CompressionAlgorithm::Snappy => "snzip",
        }
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema)]
pub struct CompressionSpec {
    #[serde(default = "defaults::default_compression_enabled")]
    pub enabled: bool,
    #[serde(default = "defaults::default_compression_algorithm")]
    pub algorithm: CompressionAlgorithm,
}

impl Default for CompressionSpec {
    fn default() -> Self {
        defaults::default_compression()
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema, Default, PartialEq, Eq)]
pub enum BackupPhase {
    #[default]
    Pending,
    Running,
    Completed,
    Failed,
}

impl fmt::Display for BackupPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            BackupPhase::Pending => "Pending",
            BackupPhase::Running => "Running",
            BackupPhase::Completed => "Completed",
            BackupPhase::Failed => "Failed",
        };
        write!(f, "{s}")
    }
}

#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, JsonSchema)]
#[cfg_attr(test, derive(Default))]
#[kube(
    kind = "MongoDBBackup",
    group = "mongodb.keiailab.com",
    version = "v1alpha1",
    namespaced
)]
#[kube(status = "MongoDBBackupStatus", shortname = "mdbbk")]
#[kube(
    printcolumn = r#"{"name":"Phase","type":"string","jsonPath":".status.phase"}"#
)]
#[kube(
    printcolumn = r#"{"name":"Location","type":"string","jsonPath":".status.location"}"#
)]
#[kube(
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[allow(non_snake_case)]
pub struct MongoDBBackupSpec {
    pub clusterRef: ClusterRef,

    #[serde(default)]
    pub storage: BackupStorageSpec,

    #[serde(default = "defaults::default_backup_type")]
    pub backupType: BackupType,

    #[serde(default)]
    pub compression: CompressionSpec,
}

/// The status object of `MongoDBBackup`
#[derive(Deserialize, Serialize, Clone, Default, Debug, JsonSchema)]
#[allow(non_snake_case)]
pub struct MongoDBBackupStatus {
    #[serde(default)]
    pub phase: BackupPhase,
    pub startTime: Option<DateTime<Utc>>,
    pub completionTime: Option<DateTime<Utc>>,
    pub location: Option<String>,
    pub error: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deserialize_replica_set_spec_defaults() {
        let json_str = r#"
        {
          "auth": {
            "adminCredentialsSecretRef": { "name": "mongodb-admin" }
          }
        }
        "#;

        let spec: MongoDBReplicaSetSpec = serde_json::from_str(json_str).unwrap();
        assert_eq!(spec.members, 3);
        assert_eq!(spec.replicaSetName, "rs0");
        assert_eq!(spec.version, "8.0");
        assert_eq!(spec.storage.size, Quantity("10Gi".to_owned()));
        assert_eq!(spec.auth.mechanism, "SCRAM-SHA-256");
        assert_eq!(spec.auth.adminCredentialsSecretRef.name, "mongodb-admin");
        assert!(!spec.arbiter);
        assert!(spec.monitoring.is_none());
    }

    #[test]
    fn test_deserialize_sharded_spec_defaults() {
        let json_str = r#"
        {
          "version": "8.2",
          "shards": { "count": 2 },
          "auth": {
            "mechanism": "SCRAM-SHA-256",
            "adminCredentialsSecretRef": { "name": "mongodb-admin" }
          }
        }
        "#;

        let spec: MongoDBShardedClusterSpec = serde_json::from_str(json_str).unwrap();
        assert_eq!(spec.configServer.members, 3);
        assert_eq!(spec.shards.count, 2);
        assert_eq!(spec.shards.membersPerShard, 3);
        assert_eq!(spec.shards.storage.size, Quantity("50Gi".to_owned()));
        assert_eq!(spec.mongos.replicas, 2);
        assert_eq!(spec.mongos.serviceType, "ClusterIP");
    }

    #[test]
    fn test_deserialize_backup_spec() {
        let json_str = r#"
        {
          "clusterRef": { "name": "my-mongodb", "kind": "ReplicaSet" },
          "storage": {
            "s3": {
              "bucket": "mongodb-backups",
              "credentialsSecretRef": { "name": "s3-credentials" }
            }
          }
        }
        "#;

        let spec: MongoDBBackupSpec = serde_json::from_str(json_str).unwrap();
        assert_eq!(spec.clusterRef.kind, TargetKind::ReplicaSet);
        assert_eq!(spec.backupType, BackupType::Full);
        assert!(spec.compression.enabled);
        assert_eq!(spec.compression.algorithm, CompressionAlgorithm::Gzip);
        assert_eq!(spec.storage.s3.unwrap().bucket, "mongodb-backups");
    }

    #[test]
    fn test_phase_serialization() {
        assert_eq!(
            serde_json::to_string(&ClusterPhase::Initializing).unwrap(),
            "\"Initializing\""
        );
        assert_eq!(
            serde_json::to_string(&BackupPhase::Completed).unwrap(),
            "\"Completed\""
        );
        assert_eq!(
            serde_json::to_string(&BackupType::Incremental).unwrap(),
            "\"incremental\""
        );
    }

    #[test]
    fn test_component_names() {
        let mut sc = MongoDBShardedCluster::new(
            "shop",
            MongoDBShardedClusterSpec {
                version: defaults::default_version(),
                configServer: ConfigServerSpec::default(),
                shards: ShardsSpec::default(),
                mongos: MongosSpec::default(),
                auth: AuthSpec::default(),
                monitoring: None,
            },
        );
        sc.metadata.namespace = Some("default".to_owned());
        assert_eq!(sc.config_server_name(), "shop-cfg");
        assert_eq!(sc.shard_name(1), "shop-shard-1");
        assert_eq!(sc.mongos_name(), "shop-mongos");
        assert_eq!(sc.shard_headless_service_name(0), "shop-shard-0-headless");
    }
}
