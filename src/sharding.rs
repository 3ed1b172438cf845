use crate::{
    auth::Credentials,
    exec::{json_eval, mongosh_args_auth, ExecCommand, ExecOutput},
    Error, Result,
};
use itertools::Itertools;
use kube::client::Client;
use serde::Deserialize;
use tracing::debug;

/// One entry of `db.adminCommand({listShards: 1}).shards`.
#[derive(Deserialize, Clone, Debug)]
pub struct ShardEntry {
    #[serde(rename = "_id")]
    pub id: String,
    #[serde(default)]
    pub host: String,
    #[serde(default)]
    pub state: i64,
}

#[derive(Deserialize, Clone, Debug, Default)]
struct ListShardsResponse {
    #[serde(default)]
    shards: Vec<ShardEntry>,
    #[serde(default)]
    ok: f64,
}

/// Connection string for `sh.addShard`:
/// `<shardName>/<host1>,<host2>,…`.
pub fn shard_connection_string(shard_name: &str, hosts: &[String]) -> String {
    format!("{}/{}", shard_name, hosts.iter().join(","))
}

/// Shard administration against a mongos router, authenticated as the
/// admin user.
pub struct ShardManager {
    client: Client,
    namespace: String,
    container: String,
    port: i32,
}

impl ShardManager {
    pub fn new(client: Client, namespace: &str, container: &str, port: i32) -> Self {
        Self {
            client,
            namespace: namespace.to_string(),
            container: container.to_string(),
            port,
        }
    }

    async fn run(&self, pod: &str, creds: &Credentials, eval: &str) -> Result<ExecOutput> {
        let command = mongosh_args_auth(self.port, &creds.username, &creds.password, eval);
        ExecCommand::new(pod.to_string(), self.namespace.clone(), self.client.clone())
            .execute(&self.container, &command)
            .await
    }

    pub async fn add_shard(
        &self,
        pod: &str,
        creds: &Credentials,
        connection_string: &str,
    ) -> Result<()> {
        debug!("adding shard {connection_string} via {pod}");
        let out = self
            .run(pod, creds, &format!("sh.addShard(\"{connection_string}\")"))
            .await?;
        if out.success() || already_exists(&out) {
            return Ok(());
        }
        Err(Error::PodError(format!(
            "sh.addShard failed on {pod}: {}",
            out.stderr.trim()
        )))
    }

    pub async fn list_shards(&self, pod: &str, creds: &Credentials) -> Result<Vec<ShardEntry>> {
        let out = self
            .run(pod, creds, &json_eval("db.adminCommand({listShards: 1})"))
            .await?;
        if !out.success() {
            return Err(Error::PodError(format!(
                "listShards failed on {pod}: {}",
                out.stderr.trim()
            )));
        }
        let response: ListShardsResponse =
            serde_json::from_str(out.stdout.trim()).map_err(Error::SerializationError)?;
        if response.ok != 1.0 {
            return Err(Error::PodError(format!(
                "listShards returned ok={} on {pod}",
                response.ok
            )));
        }
        Ok(response.shards)
    }

    pub async fn is_shard_added(
        &self,
        pod: &str,
        creds: &Credentials,
        shard_name: &str,
    ) -> Result<bool> {
        let shards = self.list_shards(pod, creds).await?;
        Ok(shards.iter().any(|s| s.id == shard_name))
    }

    pub async fn remove_shard(
        &self,
        pod: &str,
        creds: &Credentials,
        shard_name: &str,
    ) -> Result<()> {
        let out = self
            .run(
                pod,
                creds,
                &format!("db.adminCommand({{removeShard: \"{shard_name}\"}})"),
            )
            .await?;
        if out.success() {
            return Ok(());
        }
        Err(Error::PodError(format!(
            "removeShard failed on {pod}: {}",
            out.stderr.trim()
        )))
    }

    pub async fn enable_sharding(
        &self,
        pod: &str,
        creds: &Credentials,
        database: &str,
    ) -> Result<()> {
        let out = self
            .run(pod, creds, &format!("sh.enableSharding(\"{database}\")"))
            .await?;
        if out.success() || out.stderr.contains("already enabled") {
            return Ok(());
        }
        Err(Error::PodError(format!(
            "enableSharding failed on {pod}: {}",
            out.stderr.trim()
        )))
    }

    pub async fn shard_collection(
        &self,
        pod: &str,
        creds: &Credentials,
        collection: &str,
        key_json: &str,
    ) -> Result<()> {
        let out = self
            .run(
                pod,
                creds,
                &format!("sh.shardCollection(\"{collection}\", {key_json})"),
            )
            .await?;
        if out.success() || out.stderr.contains("already sharded") {
            return Ok(());
        }
        Err(Error::PodError(format!(
            "shardCollection failed on {pod}: {}",
            out.stderr.trim()
        )))
    }
}

fn already_exists(out: &ExecOutput) -> bool {
    out.stderr.contains("already exists") || out.stdout.contains("already exists")
}
