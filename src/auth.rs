use crate::{
    exec::{mongosh_args, mongosh_args_auth, ExecCommand, ExecOutput},
    Error, Result,
};
use kube::client::Client;
use serde::Serialize;
use serde_json::json;
use tracing::debug;

#[derive(Clone, Debug)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

#[derive(Serialize, Clone, Debug)]
pub struct UserRole {
    pub role: String,
    pub db: String,
}

impl UserRole {
    pub fn new(role: &str, db: &str) -> Self {
        Self {
            role: role.to_string(),
            db: db.to_string(),
        }
    }
}

/// MongoDB user administration over pod exec. Runs either under the
/// localhost exception (no credentials, only valid until the first user
/// exists) or authenticated against the admin database.
pub struct AuthManager {
    client: Client,
    namespace: String,
    container: String,
    port: i32,
}

impl AuthManager {
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

    /// Create the first user with the root role via the localhost
    /// exception. Once a user exists the exception is gone, so a
    /// concurrent or repeated attempt reports "already exists", which is
    /// the state we wanted.
    pub async fn create_admin_user(&self, pod: &str, admin: &Credentials) -> Result<()> {
        let user_doc = json!({
            "user": admin.username,
            "pwd": admin.password,
            "roles": [{"role": "root", "db": "admin"}],
        });
        debug!("creating admin user {} via {}", admin.username, pod);
        let eval = format!("db.getSiblingDB(\"admin\").createUser({user_doc})");
        let out = self.run(pod, None, &eval).await?;
        if out.success() || already_exists(&out) {
            return Ok(());
        }
        Err(Error::PodError(format!(
            "createUser failed on {pod}: {}",
            out.stderr.trim()
        )))
    }

    /// Whether the user exists in the given database. An unauthorized
    /// probe reads as absent; the create path resolves the ambiguity.
    pub async fn user_exists(
        &self,
        pod: &str,
        creds: Option<&Credentials>,
        db: &str,
        username: &str,
    ) -> Result<bool> {
        let eval = format!(
            "db.getSiblingDB({}).getUser({}) !== null",
            js_string(db),
            js_string(username)
        );
        let out = self.run(pod, creds, &eval).await?;
        if !out.success() {
            return Ok(false);
        }
        Ok(out.stdout.trim() == "true")
    }

    pub async fn create_user(
        &self,
        pod: &str,
        admin: &Credentials,
        db: &str,
        username: &str,
        password: &str,
        roles: &[UserRole],
    ) -> Result<()> {
        let user_doc = json!({
            "user": username,
            "pwd": password,
            "roles": roles,
        });
        let eval = format!("db.getSiblingDB({}).createUser({user_doc})", js_string(db));
        let out = self.run(pod, Some(admin), &eval).await?;
        if out.success() || already_exists(&out) {
            return Ok(());
        }
        Err(Error::PodError(format!(
            "createUser failed on {pod}: {}",
            out.stderr.trim()
        )))
    }

    pub async fn update_password(
        &self,
        pod: &str,
        admin: &Credentials,
        db: &str,
        username: &str,
        password: &str,
    ) -> Result<()> {
        let eval = format!(
            "db.getSiblingDB({}).changeUserPassword({}, {})",
            js_string(db),
            js_string(username),
            js_string(password)
        );
        let out = self.run(pod, Some(admin), &eval).await?;
        if out.success() {
            return Ok(());
        }
        Err(Error::PodError(format!(
            "changeUserPassword failed on {pod}: {}",
            out.stderr.trim()
        )))
    }

    pub async fn grant_roles(
        &self,
        pod: &str,
        admin: &Credentials,
        db: &str,
        username: &str,
        roles: &[UserRole],
    ) -> Result<()> {
        let roles_json = serde_json::to_string(roles).map_err(Error::SerializationError)?;
        let eval = format!(
            "db.getSiblingDB({}).grantRolesToUser({}, {roles_json})",
            js_string(db),
            js_string(username)
        );
        let out = self.run(pod, Some(admin), &eval).await?;
        if out.success() {
            return Ok(());
        }
        Err(Error::PodError(format!(
            "grantRolesToUser failed on {pod}: {}",
            out.stderr.trim()
        )))
    }

    pub async fn revoke_roles(
        &self,
        pod: &str,
        admin: &Credentials,
        db: &str,
        username: &str,
        roles: &[UserRole],
    ) -> Result<()> {
        let roles_json = serde_json::to_string(roles).map_err(Error::SerializationError)?;
        let eval = format!(
            "db.getSiblingDB({}).revokeRolesFromUser({}, {roles_json})",
            js_string(db),
            js_string(username)
        );
        let out = self.run(pod, Some(admin), &eval).await?;
        if out.success() {
            return Ok(());
        }
        Err(Error::PodError(format!(
            "revokeRolesFromUser failed on {pod}: {}",
            out.stderr.trim()
        )))
    }

    pub async fn drop_user(
        &self,
        pod: &str,
        admin: &Credentials,
        db: &str,
        username: &str,
    ) -> Result<()> {
        let eval = format!(
            "db.getSiblingDB({}).dropUser({})",
            js_string(db),
            js_string(username)
        );
        let out = self.run(pod, Some(admin), &eval).await?;
        if out.success() || out.stderr.contains("UserNotFound") {
            return Ok(());
        }
        Err(Error::PodError(format!(
            "dropUser failed on {pod}: {}",
            out.stderr.trim()
        )))
    }

    /// Validate credentials by running an authenticated ping.
    pub async fn authenticate(&self, pod: &str, creds: &Credentials) -> Result<bool> {
        let out = self
            .run(pod, Some(creds), "db.adminCommand('ping').ok")
            .await?;
        Ok(out.success() && out.stdout.trim() == "1")
    }
}

fn already_exists(out: &ExecOutput) -> bool {
    out.stderr.contains("already exists") || out.stdout.contains("already exists")
}

/// Quote a value as a JavaScript string literal.
fn js_string(value: &str) -> String {
    serde_json::to_string(value).expect("strings always serialize")
}
