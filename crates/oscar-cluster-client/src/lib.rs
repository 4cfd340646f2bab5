//! Thin RPC client for the cluster control API: create/delete/poll jobs and
//! deployments against a namespace, authenticated with a bearer token read
//! once from a mounted service-account file.
//!
//! Deliberately not built on the `kube`/`k8s-openapi` client libraries: the
//! contract here is "fire a raw REST call and poll," mirroring the original
//! controller's `requests`-based implementation rather than a full client
//! with watches/informers. See DESIGN.md for the tradeoff.

use std::path::Path;
use std::time::Duration;

use oscar_common::{is_create_status_ok, is_delete_status_ok, is_get_status_ok, OscarError};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{error, info, instrument, warn};

const TOKEN_PATH: &str = "/var/run/secrets/kubernetes.io/serviceaccount/token";
const CA_CERT_PATH: &str = "/var/run/secrets/kubernetes.io/serviceaccount/ca.crt";
const DEFAULT_HOST: &str = "kubernetes.default";
const DEFAULT_PORT: &str = "443";
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Error, Debug)]
pub enum ClusterError {
    #[error(transparent)]
    Common(#[from] OscarError),
    #[error("job wait loop aborted: {0}")]
    WaitAborted(String),
}

pub type Result<T> = std::result::Result<T, ClusterError>;

/// Connection parameters, resolved once from the ambient host environment.
#[derive(Debug, Clone)]
pub struct ClusterConfig {
    /// `https://<host>:<port>`, or an http(s) base pointed at a test server.
    pub api_base: String,
    pub token: String,
    /// Accept invalid/self-signed certs when no CA bundle was mounted —
    /// mirrors the original's `verify=False` fallback.
    pub accept_invalid_certs: bool,
}

impl ClusterConfig {
    pub fn new(api_base: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            api_base: api_base.into(),
            token: token.into(),
            accept_invalid_certs: false,
        }
    }

    pub fn accepting_invalid_certs(mut self) -> Self {
        self.accept_invalid_certs = true;
        self
    }

    /// Resolves host/port/token/CA presence from the ambient environment and
    /// mounted files, defaulting host/port to the canonical in-cluster values
    /// when absent.
    pub fn from_env() -> std::result::Result<Self, OscarError> {
        let host =
            std::env::var("KUBERNETES_SERVICE_HOST").unwrap_or_else(|_| DEFAULT_HOST.to_string());
        let port =
            std::env::var("KUBERNETES_SERVICE_PORT").unwrap_or_else(|_| DEFAULT_PORT.to_string());
        let token = std::fs::read_to_string(TOKEN_PATH)
            .map_err(|e| OscarError::ConfigMissing(format!("service account token: {e}")))?
            .trim()
            .to_string();
        let accept_invalid_certs = !Path::new(CA_CERT_PATH).is_file();
        Ok(Self {
            api_base: format!("https://{host}:{port}"),
            token,
            accept_invalid_certs,
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnvVar {
    pub name: String,
    #[serde(default)]
    pub value: Option<String>,
}

/// Outcome of a `wait_job` poll loop. A transport error mid-poll is surfaced
/// as `Aborted`: the caller must treat it as an unknown outcome, not failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    Succeeded,
    Failed,
    Aborted,
}

#[derive(Clone)]
pub struct ClusterClient {
    config: ClusterConfig,
    http: reqwest::Client,
}

impl ClusterClient {
    pub fn new(config: ClusterConfig) -> Self {
        let http = reqwest::Client::builder()
            .danger_accept_invalid_certs(config.accept_invalid_certs)
            .build()
            .expect("reqwest client builder should never fail with these options");
        Self { config, http }
    }

    fn auth_header(&self) -> String {
        format!("Bearer {}", self.config.token)
    }

    fn jobs_url(&self, namespace: &str, name: Option<&str>) -> String {
        match name {
            Some(name) => format!(
                "{}/apis/batch/v1/namespaces/{namespace}/jobs/{name}",
                self.config.api_base
            ),
            None => format!(
                "{}/apis/batch/v1/namespaces/{namespace}/jobs",
                self.config.api_base
            ),
        }
    }

    fn deployments_url(&self, namespace: &str, name: Option<&str>) -> String {
        match name {
            Some(name) => format!(
                "{}/apis/apps/v1/namespaces/{namespace}/deployments/{name}",
                self.config.api_base
            ),
            None => format!(
                "{}/apis/apps/v1/namespaces/{namespace}/deployments",
                self.config.api_base
            ),
        }
    }

    #[instrument(skip(self, definition), fields(%name, %namespace))]
    pub async fn create_job(
        &self,
        definition: &serde_json::Value,
        name: &str,
        namespace: &str,
    ) -> Result<()> {
        let resp = self
            .http
            .post(self.jobs_url(namespace, None))
            .header("Authorization", self.auth_header())
            .json(definition)
            .send()
            .await
            .map_err(|source| ClusterError::Common(OscarError::Transport {
                target: "cluster jobs API".to_string(),
                source,
            }))?;
        let status = resp.status().as_u16();
        if !is_create_status_ok(status) {
            let body = resp.text().await.unwrap_or_default();
            error!(%status, %body, "error creating job");
            return Err(ClusterError::Common(OscarError::Upstream { status, body }));
        }
        info!("job created");
        Ok(())
    }

    #[instrument(skip(self), fields(%name, %namespace))]
    pub async fn delete_job(&self, name: &str, namespace: &str) -> Result<()> {
        let resp = self
            .http
            .delete(self.jobs_url(namespace, Some(name)))
            .header("Authorization", self.auth_header())
            .query(&[("propagationPolicy", "Background")])
            .send()
            .await
            .map_err(|source| ClusterError::Common(OscarError::Transport {
                target: "cluster jobs API".to_string(),
                source,
            }))?;
        let status = resp.status().as_u16();
        if !is_delete_status_ok(status) {
            let body = resp.text().await.unwrap_or_default();
            error!(%status, %body, "error deleting job");
            return Err(ClusterError::Common(OscarError::Upstream { status, body }));
        }
        info!("job deleted");
        Ok(())
    }

    /// Polls a job at `poll_interval` until either `succeeded >= completions`
    /// or `failed >= backoffLimit`. On success with `delete_on_success`,
    /// issues a background-propagation delete. A transport error mid-poll
    /// aborts the wait; it is not retried.
    #[instrument(skip(self), fields(%name, %namespace))]
    pub async fn wait_job(
        &self,
        name: &str,
        namespace: &str,
        delete_on_success: bool,
        poll_interval: Duration,
    ) -> JobOutcome {
        let url = self.jobs_url(namespace, Some(name));
        loop {
            let resp = match self
                .http
                .get(&url)
                .header("Authorization", self.auth_header())
                .send()
                .await
            {
                Ok(resp) => resp,
                Err(e) => {
                    error!(error=%e, "transport failure polling job, aborting wait");
                    return JobOutcome::Aborted;
                }
            };
            let status = resp.status().as_u16();
            if !is_get_status_ok(status) {
                let body = resp.text().await.unwrap_or_default();
                error!(%status, %body, "error obtaining job info, aborting wait");
                return JobOutcome::Aborted;
            }
            let job: serde_json::Value = match resp.json().await {
                Ok(job) => job,
                Err(e) => {
                    error!(error=%e, "malformed job body, aborting wait");
                    return JobOutcome::Aborted;
                }
            };
            if let (Some(succeeded), Some(completions)) = (
                job.pointer("/status/succeeded").and_then(|v| v.as_i64()),
                job.pointer("/spec/completions").and_then(|v| v.as_i64()),
            ) {
                if succeeded >= completions {
                    if delete_on_success {
                        if let Err(e) = self.delete_job(name, namespace).await {
                            warn!(error=%e, "failed to delete succeeded job");
                        }
                    }
                    return JobOutcome::Succeeded;
                }
            }
            if let (Some(failed), Some(backoff_limit)) = (
                job.pointer("/status/failed").and_then(|v| v.as_i64()),
                job.pointer("/spec/backoffLimit").and_then(|v| v.as_i64()),
            ) {
                if failed >= backoff_limit {
                    error!("job failed, see pod logs for details");
                    return JobOutcome::Failed;
                }
            }
            tokio::time::sleep(poll_interval).await;
        }
    }

    #[instrument(skip(self, definition), fields(%name, %namespace))]
    pub async fn create_deployment(
        &self,
        definition: &serde_json::Value,
        name: &str,
        namespace: &str,
    ) -> Result<()> {
        let resp = self
            .http
            .post(self.deployments_url(namespace, None))
            .header("Authorization", self.auth_header())
            .json(definition)
            .send()
            .await
            .map_err(|source| ClusterError::Common(OscarError::Transport {
                target: "cluster deployments API".to_string(),
                source,
            }))?;
        let status = resp.status().as_u16();
        if !is_create_status_ok(status) {
            let body = resp.text().await.unwrap_or_default();
            error!(%status, %body, "error creating deployment");
            return Err(ClusterError::Common(OscarError::Upstream { status, body }));
        }
        info!("deployment created");
        Ok(())
    }

    #[instrument(skip(self), fields(%name, %namespace))]
    pub async fn delete_deployment(&self, name: &str, namespace: &str) -> Result<()> {
        let resp = self
            .http
            .delete(self.deployments_url(namespace, Some(name)))
            .header("Authorization", self.auth_header())
            .send()
            .await
            .map_err(|source| ClusterError::Common(OscarError::Transport {
                target: "cluster deployments API".to_string(),
                source,
            }))?;
        let status = resp.status().as_u16();
        if !is_delete_status_ok(status) {
            let body = resp.text().await.unwrap_or_default();
            error!(%status, %body, "error deleting deployment");
            return Err(ClusterError::Common(OscarError::Upstream { status, body }));
        }
        info!("deployment deleted");
        Ok(())
    }

    /// Fetches the live deployment's first container's environment
    /// variables, warning if more than one container is present.
    #[instrument(skip(self), fields(%name, %namespace))]
    pub async fn get_deployment_env(&self, name: &str, namespace: &str) -> Result<Vec<EnvVar>> {
        let resp = self
            .http
            .get(self.deployments_url(namespace, Some(name)))
            .header("Authorization", self.auth_header())
            .send()
            .await
            .map_err(|source| ClusterError::Common(OscarError::Transport {
                target: "cluster deployments API".to_string(),
                source,
            }))?;
        let status = resp.status().as_u16();
        if !is_get_status_ok(status) {
            let body = resp.text().await.unwrap_or_default();
            error!(%status, %body, "error reading deployment");
            return Err(ClusterError::Common(OscarError::Upstream { status, body }));
        }
        let deploy: serde_json::Value = resp.json().await.map_err(|source| {
            ClusterError::Common(OscarError::Transport {
                target: "cluster deployments API".to_string(),
                source,
            })
        })?;
        let containers = deploy
            .pointer("/spec/template/spec/containers")
            .and_then(|v| v.as_array())
            .cloned()
            .unwrap_or_default();
        if containers.len() > 1 {
            warn!("function has more than one container, reading env from container 0");
        }
        let env_vars = containers
            .first()
            .and_then(|c| c.get("env"))
            .cloned()
            .map(serde_json::from_value)
            .transpose()
            .unwrap_or(None)
            .unwrap_or_default();
        Ok(env_vars)
    }
}

pub fn default_poll_interval() -> Duration {
    DEFAULT_POLL_INTERVAL
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn client_for(server_url: &str) -> ClusterClient {
        ClusterClient::new(ClusterConfig::new(server_url, "test-token"))
    }

    #[tokio::test]
    async fn create_job_accepts_201() {
        let mut server = mockito::Server::new_async().await;
        let m = server
            .mock("POST", "/apis/batch/v1/namespaces/kaniko-builds/jobs")
            .with_status(201)
            .create_async()
            .await;
        let client = client_for(&server.url());
        client
            .create_job(&json!({"kind": "Job"}), "echo-build-job", "kaniko-builds")
            .await
            .expect("create_job should succeed on 201");
        m.assert_async().await;
    }

    #[tokio::test]
    async fn create_job_surfaces_upstream_rejection() {
        let mut server = mockito::Server::new_async().await;
        let _m = server
            .mock("POST", "/apis/batch/v1/namespaces/kaniko-builds/jobs")
            .with_status(500)
            .with_body("boom")
            .create_async()
            .await;
        let client = client_for(&server.url());
        let err = client
            .create_job(&json!({}), "echo-build-job", "kaniko-builds")
            .await
            .unwrap_err();
        match err {
            ClusterError::Common(OscarError::Upstream { status, body }) => {
                assert_eq!(status, 500);
                assert_eq!(body, "boom");
            }
            other => panic!("expected Upstream error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn wait_job_succeeds_and_deletes_on_success() {
        let mut server = mockito::Server::new_async().await;
        let _get = server
            .mock("GET", "/apis/batch/v1/namespaces/kaniko-builds/jobs/echo-build-job")
            .with_status(200)
            .with_body(
                json!({
                    "status": {"succeeded": 1},
                    "spec": {"completions": 1}
                })
                .to_string(),
            )
            .create_async()
            .await;
        let _delete = server
            .mock("DELETE", "/apis/batch/v1/namespaces/kaniko-builds/jobs/echo-build-job")
            .with_status(202)
            .create_async()
            .await;
        let client = client_for(&server.url());
        let outcome = client
            .wait_job(
                "echo-build-job",
                "kaniko-builds",
                true,
                Duration::from_millis(1),
            )
            .await;
        assert_eq!(outcome, JobOutcome::Succeeded);
    }

    #[tokio::test]
    async fn wait_job_reports_failed_without_deleting() {
        let mut server = mockito::Server::new_async().await;
        let _get = server
            .mock("GET", "/apis/batch/v1/namespaces/kaniko-builds/jobs/echo-build-job")
            .with_status(200)
            .with_body(
                json!({
                    "status": {"failed": 2},
                    "spec": {"backoffLimit": 2}
                })
                .to_string(),
            )
            .create_async()
            .await;
        let client = client_for(&server.url());
        let outcome = client
            .wait_job(
                "echo-build-job",
                "kaniko-builds",
                true,
                Duration::from_millis(1),
            )
            .await;
        assert_eq!(outcome, JobOutcome::Failed);
    }

    #[tokio::test]
    async fn wait_job_aborts_on_transport_error() {
        let mut server = mockito::Server::new_async().await;
        let _get = server
            .mock("GET", "/apis/batch/v1/namespaces/kaniko-builds/jobs/echo-build-job")
            .with_status(503)
            .create_async()
            .await;
        let client = client_for(&server.url());
        let outcome = client
            .wait_job(
                "echo-build-job",
                "kaniko-builds",
                true,
                Duration::from_millis(1),
            )
            .await;
        assert_eq!(outcome, JobOutcome::Aborted);
    }

    #[tokio::test]
    async fn get_deployment_env_reads_first_container() {
        let mut server = mockito::Server::new_async().await;
        let _m = server
            .mock("GET", "/apis/apps/v1/namespaces/oscar/deployments/echo-onetrigger")
            .with_status(200)
            .with_body(
                json!({
                    "spec": {"template": {"spec": {"containers": [
                        {"name": "onetrigger", "env": [{"name": "ONEDATA_SPACE", "value": "myspace"}]}
                    ]}}}
                })
                .to_string(),
            )
            .create_async()
            .await;
        let client = client_for(&server.url());
        let env = client
            .get_deployment_env("echo-onetrigger", "oscar")
            .await
            .unwrap();
        assert_eq!(env.len(), 1);
        assert_eq!(env[0].name, "ONEDATA_SPACE");
        assert_eq!(env[0].value.as_deref(), Some("myspace"));
    }
}
