use crate::{
    auth::Credentials,
    exec::{json_eval, mongosh_args, mongosh_args_auth, pod_fqdn, ExecCommand, ExecOutput},
    Error, Result,
};
use kube::client::Client;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Port of replica-set members and mongos routers.
pub const MONGODB_PORT: i32 = 27017;
/// Port of shard members.
pub const SHARD_PORT: i32 = 27018;
/// Port of config-server members.
pub const CONFIG_SERVER_PORT: i32 = 27019;

/// The document passed to `rs.initiate`.
#[derive(Serialize, Clone, Debug)]
pub struct ReplsetConfig {
    #[serde(rename = "_id")]
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub configsvr: Option<bool>,
    pub members: Vec<ReplsetMemberConfig>,
}

#[derive(Serialize, Clone, Debug)]
pub struct ReplsetMemberConfig {
    #[serde(rename = "_id")]
    pub id: i32,
    pub host: String,
    #[serde(rename = "arbiterOnly", skip_serializing_if = "Option::is_none")]
    pub arbiter_only: Option<bool>,
}

impl ReplsetConfig {
    /// Mark the config as a config-server replica set.
    pub fn with_configsvr(mut self) -> Self {
        self.configsvr = Some(true);
        self
    }

    /// Demote the last member to an arbiter.
    pub fn with_arbiter(mut self) -> Self {
        if let Some(last) = self.members.last_mut() {
            last.arbiter_only = Some(true);
        }
        self
    }
}

/// Build the initiate config for an N-member stateful workload. The same
/// builder serves replica sets, config servers and shards; only the port
/// and the replica-set name differ.
pub fn replset_config(
    rs_name: &str,
    base_name: &str,
    service_name: &str,
    namespace: &str,
    members: i32,
    port: i32,
) -> ReplsetConfig {
    ReplsetConfig {
        id: rs_name.to_string(),
        configsvr: None,
        members: (0..members)
            .map(|i| ReplsetMemberConfig {
                id: i,
                host: pod_fqdn(&format!("{base_name}-{i}"), service_name, namespace, port),
                arbiter_only: None,
            })
            .collect(),
    }
}

/// `rs.status()` as far as the reconcilers care about it. Deserialization
/// is tolerant; mongosh adds fields per server version.
#[derive(Deserialize, Clone, Debug, Default)]
pub struct ReplsetStatus {
    #[serde(default)]
    pub set: String,
    #[serde(default)]
    pub ok: f64,
    #[serde(default)]
    pub members: Vec<ReplsetMemberStatus>,
}

#[derive(Deserialize, Clone, Debug, Default)]
pub struct ReplsetMemberStatus {
    #[serde(rename = "_id", default)]
    pub id: i32,
    #[serde(default)]
    pub name: String,
    #[serde(rename = "stateStr", default)]
    pub state: String,
    #[serde(default)]
    pub health: f64,
}

impl ReplsetStatus {
    pub fn primary(&self) -> Option<&ReplsetMemberStatus> {
        self.members
            .iter()
            .find(|m| m.state == "PRIMARY" && m.health == 1.0)
    }
}

/// Extract the pod name from a member address like
/// `db-0.db-headless.ns.svc.cluster.local:27017`.
pub fn pod_name_from_member(member_name: &str) -> String {
    member_name
        .split('.')
        .next()
        .unwrap_or(member_name)
        .split(':')
        .next()
        .unwrap_or(member_name)
        .to_string()
}

/// Replica-set administration over pod exec, parameterized by the member
/// port (27017 for replica sets, 27018 for shards, 27019 for config
/// servers).
pub struct ReplsetManager {
    client: Client,
    namespace: String,
    container: String,
    port: i32,
}

impl ReplsetManager {
    pub fn new(client: Client, namespace: &str, container: &str, port: i32) -> Self {
        Self {
            client,
            namespace: namespace.to_string(),
            container: container.to_string(),
            port,
        }
    }

    async fn run(
        &self,
        pod: &str,
        creds: Option<&Credentials>,
        eval: &str,
    ) -> Result<ExecOutput> {
        let command = match creds {
            Some(c) => mongosh_args_auth(self.port, &c.username, &c.password, eval),
            None => mongosh_args(self.port, eval),
        };
        ExecCommand::new(pod.to_string(), self.namespace.clone(), self.client.clone())
            .execute(&self.container, &command)
            .await
    }

    /// Whether `rs.initiate` has already been run against this member.
    pub async fn is_initialized(&self, pod: &str, creds: Option<&Credentials>) -> Result<bool> {
        let out = self.run(pod, creds, "rs.status().ok").await?;
        if out.stdout.trim() == "1" {
            return Ok(true);
        }
        let not_initialized = |s: &str| {
            s.contains("no replset config") || s.contains("NotYetInitialized")
        };
        if not_initialized(&out.stderr) || not_initialized(&out.stdout) {
            return Ok(false);
        }
        if out.success() {
            return Ok(false);
        }
        Err(Error::PodError(format!(
            "rs.status() failed on {pod}: {}",
            out.stderr.trim()
        )))
    }

    pub async fn initiate(
        &self,
        pod: &str,
        creds: Option<&Credentials>,
        config: &ReplsetConfig,
    ) -> Result<()> {
        let config_json = serde_json::to_string(config).map_err(Error::SerializationError)?;
        debug!("initiating replica set {} via {}", config.id, pod);
        let out = self
            .run(pod, creds, &format!("rs.initiate({config_json})"))
            .await?;
        if out.success() || out.stderr.contains("already initialized") {
            return Ok(());
        }
        Err(Error::PodError(format!(
            "rs.initiate failed on {pod}: {}",
            out.stderr.trim()
        )))
    }

    pub async fn status(&self, pod: &str, creds: Option<&Credentials>) -> Result<ReplsetStatus> {
        let out = self.run(pod, creds, &json_eval("rs.status()")).await?;
        if !out.success() {
            return Err(Error::PodError(format!(
                "rs.status() failed on {pod}: {}",
                out.stderr.trim()
            )));
        }
        serde_json::from_str(out.stdout.trim()).map_err(Error::SerializationError)
    }

    pub async fn has_primary(&self, pod: &str, creds: Option<&Credentials>) -> Result<bool> {
        Ok(self.status(pod, creds).await?.primary().is_some())
    }

    /// The pod name of the current primary, if one has been elected.
    pub async fn primary_pod(
        &self,
        pod: &str,
        creds: Option<&Credentials>,
    ) -> Result<Option<String>> {
        let status = self.status(pod, creds).await?;
        Ok(status.primary().map(|m| pod_name_from_member(&m.name)))
    }

    pub async fn add_member(
        &self,
        pod: &str,
        creds: Option<&Credentials>,
        host: &str,
    ) -> Result<()> {
        self.member_op(pod, creds, &format!("rs.add(\"{host}\")"))
            .await
    }

    pub async fn add_arbiter(
        &self,
        pod: &str,
        creds: Option<&Credentials>,
        host: &str,
    ) -> Result<()> {
        self.member_op(pod, creds, &format!("rs.addArb(\"{host}\")"))
            .await
    }

    pub async fn remove_member(
        &self,
        pod: &str,
        creds: Option<&Credentials>,
        host: &str,
    ) -> Result<()> {
        self.member_op(pod, creds, &format!("rs.remove(\"{host}\")"))
            .await
    }

    async fn member_op(&self, pod: &str, creds: Option<&Credentials>, eval: &str) -> Result<()> {
        let out = self.run(pod, creds, eval).await?;
        if out.success() {
            return Ok(());
        }
        Err(Error::PodError(format!(
            "{eval} failed on {pod}: {}",
            out.stderr.trim()
        )))
    }

    pub async fn reconfigure(
        &self,
        pod: &str,
        creds: Option<&Credentials>,
        config: &ReplsetConfig,
        force: bool,
    ) -> Result<()> {
        let config_json = serde_json::to_string(config).map_err(Error::SerializationError)?;
        let out = self
            .run(
                pod,
                creds,
                &format!("rs.reconfig({config_json}, {{force: {force}}})"),
            )
            .await?;
        if out.success() {
            return Ok(());
        }
        Err(Error::PodError(format!(
            "rs.reconfig failed on {pod}: {}",
            out.stderr.trim()
        )))
    }
}
