use crate::apis::mongodb_types::{
    BackupType, CompressionAlgorithm, CompressionSpec, StorageSpec,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;

pub fn default_members() -> i32 {
    3
}

pub fn default_replica_set_name() -> String {
    "rs0".to_owned()
}

pub fn default_version() -> String {
    "8.0".to_owned()
}

pub fn default_storage_class() -> String {
    "ceph-block".to_owned()
}

pub fn default_storage_size() -> Quantity {
    Quantity("10Gi".to_owned())
}

pub fn default_shard_storage_size() -> Quantity {
    Quantity("50Gi".to_owned())
}

pub fn default_storage() -> StorageSpec {
    StorageSpec {
        className: None,
        size: default_storage_size(),
        dataDir: None,
    }
}

pub fn default_shard_storage() -> StorageSpec {
    StorageSpec {
        className: None,
        size: default_shard_storage_size(),
        dataDir: None,
    }
}

pub fn default_auth_mechanism() -> String {
    "SCRAM-SHA-256".to_owned()
}

pub fn default_config_server_members() -> i32 {
    3
}

pub fn default_shard_count() -> i32 {
    2
}

pub fn default_members_per_shard() -> i32 {
    3
}

pub fn default_mongos_replicas() -> i32 {
    2
}

pub fn default_service_type() -> String {
    "ClusterIP".to_owned()
}

pub fn default_exporter_image() -> String {
    "percona/mongodb_exporter:0.40".to_owned()
}

pub fn default_backup_type() -> BackupType {
    BackupType::Full
}

pub fn default_compression() -> CompressionSpec {
    CompressionSpec {
        enabled: default_compression_enabled(),
        algorithm: default_compression_algorithm(),
    }
}

pub fn default_compression_enabled() -> bool {
    true
}

pub fn default_compression_algorithm() -> CompressionAlgorithm {
    CompressionAlgorithm::Gzip
}
