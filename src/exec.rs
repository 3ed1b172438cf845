use crate::{Error, Result};
use k8s_openapi::{api::core::v1::Pod, apimachinery::pkg::apis::meta::v1::Status};
use kube::{
    api::{Api, AttachParams},
    client::Client,
};
use tokio::io::AsyncReadExt;
use tracing::debug;

/// Marker the API server writes to stderr when a command exits non-zero
/// over the exec subprotocol. Collapsed to exit code 1 rather than being
/// treated as a transport failure.
const EXIT_CODE_MARKER: &str = "command terminated with exit code";

pub struct ExecOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

impl ExecOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

pub struct ExecCommand {
    pod_name: String,
    namespace: String,
    client: Client,
}

impl ExecCommand {
    pub fn new(pod_name: String, namespace: String, client: Client) -> Self {
        Self {
            pod_name,
            namespace,
            client,
        }
    }

    /// Run a command in the named container and capture stdout, stderr and
    /// the exit code. A non-zero container exit is reported in the output,
    /// not as an error; only transport failures are errors.
    pub async fn execute(&self, container: &str, command: &[String]) -> Result<ExecOutput> {
        let pods: Api<Pod> = Api::namespaced(self.client.clone(), &self.namespace);
        let attach_params = AttachParams {
            container: Some(container.to_string()),
            tty: false,
            stdin: false,
            stdout: true,
            stderr: true,
            max_stdin_buf_size: Some(1024),
            max_stdout_buf_size: Some(1024 * 1024),
            max_stderr_buf_size: Some(1024 * 1024),
        };

        let mut attached = pods
            .exec(&self.pod_name, command, &attach_params)
            .await
            .map_err(|e| {
                Error::KubeExecError(format!(
                    "Failed to exec in pod {}/{}: {}",
                    self.namespace, self.pod_name, e
                ))
            })?;

        let mut stdout_reader = attached.stdout().ok_or_else(|| {
            Error::KubeExecError("Failed to attach to stdout of exec process".to_string())
        })?;
        let mut stderr_reader = attached.stderr().ok_or_else(|| {
            Error::KubeExecError("Failed to attach to stderr of exec process".to_string())
        })?;

        let mut stdout = String::new();
        let mut stderr = String::new();
        let (stdout_result, stderr_result) = tokio::join!(
            stdout_reader.read_to_string(&mut stdout),
            stderr_reader.read_to_string(&mut stderr)
        );
        stdout_result
            .map_err(|e| Error::KubeExecError(format!("Failed to read stdout: {e}")))?;
        stderr_result
            .map_err(|e| Error::KubeExecError(format!("Failed to read stderr: {e}")))?;

        let mut exit_code = match attached.take_status() {
            Some(status) => status.await.as_ref().map_or(0, exit_code_from_status),
            None => 0,
        };
        if exit_code == 0 && stderr.contains(EXIT_CODE_MARKER) {
            exit_code = 1;
        }

        debug!(
            "exec in {}/{} exited {}: {:?}",
            self.namespace, self.pod_name, exit_code, command
        );
        Ok(ExecOutput {
            stdout,
            stderr,
            exit_code,
        })
    }
}

fn exit_code_from_status(status: &Status) -> i32 {
    if status.status.as_deref() == Some("Success") {
        return 0;
    }
    status
        .details
        .as_ref()
        .and_then(|details| details.causes.as_ref())
        .and_then(|causes| {
            causes
                .iter()
                .find(|c| c.reason.as_deref() == Some("ExitCode"))
        })
        .and_then(|cause| cause.message.as_ref())
        .and_then(|msg| msg.trim().parse::<i32>().ok())
        .unwrap_or(1)
}

/// Argv for an unauthenticated mongosh evaluation on the given port.
pub fn mongosh_args(port: i32, eval: &str) -> Vec<String> {
    vec![
        "mongosh".to_string(),
        "--quiet".to_string(),
        "--port".to_string(),
        port.to_string(),
        "--eval".to_string(),
        eval.to_string(),
    ]
}

/// Argv for an authenticated mongosh evaluation against the admin database.
pub fn mongosh_args_auth(port: i32, username: &str, password: &str, eval: &str) -> Vec<String> {
    vec![
        "mongosh".to_string(),
        "--quiet".to_string(),
        "--port".to_string(),
        port.to_string(),
        "-u".to_string(),
        username.to_string(),
        "-p".to_string(),
        password.to_string(),
        "--authenticationDatabase".to_string(),
        "admin".to_string(),
        "--eval".to_string(),
        eval.to_string(),
    ]
}

/// Wrap the expression so mongosh prints parseable JSON on stdout.
pub fn json_eval(expr: &str) -> String {
    format!("JSON.stringify({expr})")
}

/// Fully qualified DNS name of a pod under a headless service.
pub fn pod_fqdn(pod: &str, service: &str, namespace: &str, port: i32) -> String {
    format!("{pod}.{service}.{namespace}.svc.cluster.local:{port}")
}

/// The addresses of every pod in an N-replica stateful workload.
pub fn statefulset_fqdns(
    base_name: &str,
    service: &str,
    namespace: &str,
    replicas: i32,
    port: i32,
) -> Vec<String> {
    (0..replicas)
        .map(|i| pod_fqdn(&format!("{base_name}-{i}"), service, namespace, port))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::{StatusCause, StatusDetails};

    #[test]
    fn test_mongosh_args() {
        let args = mongosh_args(27019, "rs.status().ok");
        assert_eq!(
            args,
            vec!["mongosh", "--quiet", "--port", "27019", "--eval", "rs.status().ok"]
        );
    }

    #[test]
    fn test_mongosh_args_auth() {
        let args = mongosh_args_auth(27017, "admin", "s3cret", "db.adminCommand('ping')");
        assert_eq!(args[4], "-u");
        assert_eq!(args[5], "admin");
        assert_eq!(args[6], "-p");
        assert_eq!(args[7], "s3cret");
        assert_eq!(args[8], "--authenticationDatabase");
        assert_eq!(args[9], "admin");
    }

    #[test]
    fn test_json_eval_wraps() {
        assert_eq!(json_eval("rs.status()"), "JSON.stringify(rs.status())");
    }

    #[test]
    fn test_pod_fqdn() {
        assert_eq!(
            pod_fqdn("db-0", "db-headless", "prod", 27017),
            "db-0.db-headless.prod.svc.cluster.local:27017"
        );
    }

    #[test]
    fn test_statefulset_fqdns() {
        let fqdns = statefulset_fqdns("db-shard-1", "db-shard-1-headless", "prod", 3, 27018);
        assert_eq!(fqdns.len(), 3);
        assert_eq!(
            fqdns[0],
            "db-shard-1-0.db-shard-1-headless.prod.svc.cluster.local:27018"
        );
        assert_eq!(
            fqdns[2],
            "db-shard-1-2.db-shard-1-headless.prod.svc.cluster.local:27018"
        );
    }

    #[test]
    fn test_exit_code_from_status() {
        let success = Status {
            status: Some("Success".to_string()),
            ..Status::default()
        };
        assert_eq!(exit_code_from_status(&success), 0);

        let failed = Status {
            status: Some("Failure".to_string()),
            details: Some(StatusDetails {
                causes: Some(vec![StatusCause {
                    reason: Some("ExitCode".to_string()),
                    message: Some("14".to_string()),
                    ..StatusCause::default()
                }]),
                ..StatusDetails::default()
            }),
            ..Status::default()
        };
        assert_eq!(exit_code_from_status(&failed), 14);

        let opaque = Status {
            status: Some("Failure".to_string()),
            ..Status::default()
        };
        assert_eq!(exit_code_from_status(&opaque), 1);
    }
}
