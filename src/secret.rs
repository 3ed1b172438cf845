use crate::{
    auth::Credentials,
    kubernetes::{canonical_labels, create_if_absent},
    Error, Result,
};
use base64::{engine::general_purpose, Engine as _};
use k8s_openapi::{
    api::core::v1::Secret,
    apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference},
    ByteString,
};
use kube::{api::Api, client::Client};
use rand::RngCore;

pub const KEYFILE_KEY: &str = "keyfile";
const KEYFILE_BYTES: usize = 756;

/// Generate keyfile content: random bytes, base64-encoded, as mongod
/// expects the file on disk.
pub fn generate_keyfile() -> String {
    let mut bytes = vec![0u8; KEYFILE_BYTES];
    rand::thread_rng().fill_bytes(&mut bytes);
    general_purpose::STANDARD.encode(bytes)
}

/// The shared cluster keyfile secret. Built once; the reconcilers only
/// create it on NotFound and never rewrite it, because replacing the
/// keyfile breaks authentication between every member at once.
pub fn keyfile_secret(
    secret_name: &str,
    instance: &str,
    namespace: &str,
    oref: OwnerReference,
) -> Secret {
    let mut data = std::collections::BTreeMap::new();
    data.insert(
        KEYFILE_KEY.to_owned(),
        ByteString(generate_keyfile().into_bytes()),
    );
    Secret {
        metadata: ObjectMeta {
            name: Some(secret_name.to_owned()),
            namespace: Some(namespace.to_owned()),
            labels: Some(canonical_labels(instance, "keyfile")),
            owner_references: Some(vec![oref]),
            ..ObjectMeta::default()
        },
        data: Some(data),
        ..Secret::default()
    }
}

pub async fn reconcile_keyfile_secret(
    client: Client,
    secret_name: &str,
    instance: &str,
    namespace: &str,
    oref: OwnerReference,
) -> Result<()> {
    let secret_api: Api<Secret> = Api::namespaced(client, namespace);
    let secret = keyfile_secret(secret_name, instance, namespace, oref);
    create_if_absent(&secret_api, secret_name, secret).await
}

/// Read one key out of a secret as a UTF-8 string.
pub async fn secret_value(
    client: Client,
    namespace: &str,
    secret_name: &str,
    key: &str,
) -> Result<String> {
    let secret_api: Api<Secret> = Api::namespaced(client, namespace);
    let secret = secret_api.get(secret_name).await.map_err(Error::KubeError)?;
    let data = secret
        .data
        .ok_or_else(|| Error::MissingSecretError(format!("no data in secret {secret_name}")))?;
    let bytes = data.get(key).ok_or_else(|| {
        Error::MissingSecretError(format!("key {key} not found in secret {secret_name}"))
    })?;
    String::from_utf8(bytes.0.clone()).map_err(|_| {
        Error::MissingSecretError(format!("key {key} in secret {secret_name} is not UTF-8"))
    })
}

/// Read the admin credentials secret (`username` and `password` keys,
/// both required).
pub async fn admin_credentials(
    client: Client,
    namespace: &str,
    secret_name: &str,
) -> Result<Credentials> {
    let username = secret_value(client.clone(), namespace, secret_name, "username").await?;
    let password = secret_value(client, namespace, secret_name, "password").await?;
    Ok(Credentials { username, password })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_keyfile_is_base64_of_756_bytes() {
        let keyfile = generate_keyfile();
        let decoded = general_purpose::STANDARD.decode(&keyfile).unwrap();
        assert_eq!(decoded.len(), 756);
        // 1008 characters of base64, within mongod's 1024-char limit
        assert_eq!(keyfile.len(), 1008);
    }

    #[test]
    fn test_generate_keyfile_is_random() {
        assert_ne!(generate_keyfile(), generate_keyfile());
    }

    #[test]
    fn test_keyfile_secret_shape() {
        let oref = OwnerReference {
            api_version: "mongodb.keiailab.com/v1alpha1".to_owned(),
            kind: "MongoDBReplicaSet".to_owned(),
            name: "db".to_owned(),
            uid: "1234".to_owned(),
            controller: Some(true),
            ..OwnerReference::default()
        };
        let secret = keyfile_secret("db-keyfile", "db", "prod", oref);
        assert_eq!(secret.metadata.name.as_deref(), Some("db-keyfile"));
        let data = secret.data.unwrap();
        assert!(data.contains_key(KEYFILE_KEY));
        let owners = secret.metadata.owner_references.unwrap();
        assert_eq!(owners[0].kind, "MongoDBReplicaSet");
    }
}
