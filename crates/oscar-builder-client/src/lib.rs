//! Materializes a build context (Dockerfile, embedded binaries, user script)
//! and submits it as a cluster job that builds and pushes the derived image.

use std::path::{Path, PathBuf};

use base64::Engine;
use oscar_cluster_client::{ClusterClient, ClusterError, JobOutcome};
use oscar_common::{FunctionSpec, OscarError};
use serde_json::json;
use thiserror::Error;
use tracing::{error, info, instrument};
use uuid::Uuid;

const DOCKERFILE_TEMPLATE: &str = include_str!("../templates/Dockerfile");
const BUILD_NAMESPACE: &str = "kaniko-builds";
const BUILDER_IMAGE: &str = "gcr.io/kaniko-project/executor:latest";

#[derive(Error, Debug)]
pub enum BuilderError {
    #[error(transparent)]
    Common(#[from] OscarError),
    #[error(transparent)]
    Cluster(#[from] ClusterError),
    #[error("build job {0} failed, see pod logs for details")]
    BuildFailed(String),
    #[error("build job {0} wait aborted, outcome unknown")]
    WaitAborted(String),
    #[error("io error preparing build context: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, BuilderError>;

#[derive(Debug, Clone)]
pub struct BuilderConfig {
    pub registry: String,
    pub supervisor_version: Option<String>,
    /// Host-path volume root shared with the build job; each build gets a
    /// random-UUID subdirectory so concurrent builds never collide.
    pub base_dir: PathBuf,
}

impl BuilderConfig {
    pub fn from_env() -> std::result::Result<Self, OscarError> {
        let registry = std::env::var("DOCKER_REGISTRY")
            .map_err(|_| OscarError::ConfigMissing("DOCKER_REGISTRY".to_string()))?;
        let supervisor_version = std::env::var("SUPERVISOR_VERSION").ok();
        Ok(Self {
            registry,
            supervisor_version,
            base_dir: PathBuf::from("/pv/kaniko-builds"),
        })
    }
}

pub struct BuilderClient {
    config: BuilderConfig,
    cluster: ClusterClient,
    http: reqwest::Client,
    poll_interval: std::time::Duration,
}

impl BuilderClient {
    pub fn new(config: BuilderConfig, cluster: ClusterClient) -> Self {
        Self {
            config,
            cluster,
            http: reqwest::Client::new(),
            poll_interval: oscar_cluster_client::default_poll_interval(),
        }
    }

    pub fn with_poll_interval(mut self, interval: std::time::Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    #[cfg(test)]
    fn cluster(&self) -> &ClusterClient {
        &self.cluster
    }

    /// The image tag a build for `name` pushes to, independent of whether
    /// the build itself has run or succeeded yet (it's derived purely from
    /// config, matching the original `DockerClient.registry_image_id`
    /// property). Callers that treat a build failure as best-effort still
    /// need this to stamp the function's registration with the tag the
    /// registry is expected to hold.
    pub fn registry_image_id(&self, name: &str) -> String {
        format!("{}/{}", self.config.registry, name)
    }

    fn job_name(name: &str) -> String {
        format!("{name}-build-job")
    }

    async fn write_dockerfile(&self, dir: &Path, image: &str) -> Result<()> {
        let contents = DOCKERFILE_TEMPLATE.replace("FROM ubuntu", &format!("FROM {image}"));
        tokio::fs::write(dir.join("Dockerfile"), contents).await?;
        Ok(())
    }

    async fn download_binary(&self, url: &str, dest: &Path) -> Result<()> {
        let resp = self.http.get(url).send().await.map_err(|source| {
            BuilderError::Common(OscarError::Transport {
                target: url.to_string(),
                source,
            })
        })?;
        if !resp.status().is_success() {
            return Err(BuilderError::Common(OscarError::Upstream {
                status: resp.status().as_u16(),
                body: format!("failed to download {url}"),
            }));
        }
        let bytes = resp.bytes().await.map_err(|source| {
            BuilderError::Common(OscarError::Transport {
                target: url.to_string(),
                source,
            })
        })?;
        tokio::fs::write(dest, &bytes).await?;
        set_executable(dest).await?;
        Ok(())
    }

    async fn download_binaries(&self, dir: &Path) -> Result<()> {
        let watchdog_url = "https://github.com/openfaas/faas/releases/latest/download/fwatchdog";
        self.download_binary(watchdog_url, &dir.join("fwatchdog"))
            .await?;

        let supervisor_url = match &self.config.supervisor_version {
            Some(version) => format!(
                "https://github.com/grycap/faas-supervisor/releases/download/{version}/supervisor"
            ),
            None => {
                "https://github.com/grycap/faas-supervisor/releases/latest/download/supervisor"
                    .to_string()
            }
        };
        self.download_binary(&supervisor_url, &dir.join("supervisor"))
            .await?;
        Ok(())
    }

    async fn write_user_script(&self, dir: &Path, spec: &FunctionSpec) -> Result<()> {
        let script_b64 = spec
            .script
            .as_deref()
            .ok_or_else(|| BuilderError::Common(OscarError::InvalidSpec("script".to_string())))?;
        let decoded = base64::engine::general_purpose::STANDARD
            .decode(script_b64)
            .map_err(|e| BuilderError::Common(OscarError::InvalidSpec(format!("script is not valid base64: {e}"))))?;
        tokio::fs::write(dir.join("user_script.sh"), decoded).await?;
        Ok(())
    }

    fn job_definition(&self, job_name: &str, image_folder: &Path, registry_image_id: &str) -> serde_json::Value {
        json!({
            "apiVersion": "batch/v1",
            "kind": "Job",
            "metadata": { "name": job_name, "namespace": BUILD_NAMESPACE },
            "spec": {
                "template": {
                    "spec": {
                        "containers": [{
                            "name": "build",
                            "image": BUILDER_IMAGE,
                            "args": ["-c", "/workspace/", "-d", registry_image_id, "--skip-tls-verify"],
                            "resources": { "requests": { "memory": "256Mi", "cpu": "250m" } },
                            "volumeMounts": [{ "name": "build-context", "mountPath": "/workspace" }]
                        }],
                        "restartPolicy": "Never",
                        "volumes": [{
                            "name": "build-context",
                            "hostPath": { "path": image_folder.to_string_lossy(), "type": "Directory" }
                        }]
                    }
                }
            }
        })
    }

    /// Builds and pushes the derived image for `spec`, returning its
    /// `<registry>/<name>` tag. The working directory is deleted once the
    /// build job completes, regardless of outcome.
    #[instrument(skip(self, spec), fields(name = %spec.name))]
    pub async fn build_and_push(&self, spec: &FunctionSpec) -> Result<String> {
        let image_folder = self.config.base_dir.join(Uuid::new_v4().to_string());
        tokio::fs::create_dir_all(&image_folder).await?;

        let build_result = self.prepare_and_submit(spec, &image_folder).await;

        if let Err(e) = tokio::fs::remove_dir_all(&image_folder).await {
            error!(error=%e, "failed to clean up build context directory");
        }

        build_result
    }

    async fn prepare_and_submit(&self, spec: &FunctionSpec, image_folder: &Path) -> Result<String> {
        self.write_dockerfile(image_folder, &spec.image).await?;
        self.download_binaries(image_folder).await?;
        self.write_user_script(image_folder, spec).await?;

        let job_name = Self::job_name(&spec.name);
        let registry_image_id = self.registry_image_id(&spec.name);
        let definition = self.job_definition(&job_name, image_folder, &registry_image_id);

        self.cluster
            .create_job(&definition, &job_name, BUILD_NAMESPACE)
            .await?;

        match self
            .cluster
            .wait_job(&job_name, BUILD_NAMESPACE, true, self.poll_interval)
            .await
        {
            JobOutcome::Succeeded => {
                info!(image = %registry_image_id, "build succeeded");
                Ok(registry_image_id)
            }
            JobOutcome::Failed => Err(BuilderError::BuildFailed(job_name)),
            JobOutcome::Aborted => Err(BuilderError::WaitAborted(job_name)),
        }
    }
}

#[cfg(unix)]
async fn set_executable(path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    let mut perms = tokio::fs::metadata(path).await?.permissions();
    perms.set_mode(perms.mode() | 0o111);
    tokio::fs::set_permissions(path, perms).await?;
    Ok(())
}

#[cfg(not(unix))]
async fn set_executable(_path: &Path) -> Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use oscar_cluster_client::ClusterConfig;
    use std::collections::HashMap;

    fn client_for(server_url: &str, base_dir: PathBuf) -> BuilderClient {
        let cluster = ClusterClient::new(ClusterConfig::new(server_url, "test-token"));
        let config = BuilderConfig {
            registry: "registry.local".to_string(),
            supervisor_version: Some("1.2.3".to_string()),
            base_dir,
        };
        BuilderClient::new(config, cluster).with_poll_interval(std::time::Duration::from_millis(1))
    }

    fn echo_spec() -> FunctionSpec {
        FunctionSpec {
            name: "echo".to_string(),
            image: "alpine:3".to_string(),
            script: Some(base64::engine::general_purpose::STANDARD.encode("cat $1")),
            env_vars: HashMap::new(),
            labels: HashMap::new(),
            annotations: HashMap::new(),
            delete_buckets: false,
        }
    }

    #[tokio::test]
    async fn build_and_push_submits_job_under_kaniko_builds_and_returns_registry_tag() {
        let mut server = mockito::Server::new_async().await;

        let tmp = tempfile::tempdir().unwrap();
        let job_mock = server
            .mock("POST", "/apis/batch/v1/namespaces/kaniko-builds/jobs")
            .with_status(201)
            .create_async()
            .await;
        let wait_mock = server
            .mock("GET", "/apis/batch/v1/namespaces/kaniko-builds/jobs/echo-build-job")
            .with_status(200)
            .with_body(
                serde_json::json!({"status": {"succeeded": 1}, "spec": {"completions": 1}})
                    .to_string(),
            )
            .create_async()
            .await;
        let _delete_mock = server
            .mock("DELETE", "/apis/batch/v1/namespaces/kaniko-builds/jobs/echo-build-job")
            .with_status(202)
            .create_async()
            .await;

        let client = client_for(&server.url(), tmp.path().to_path_buf());
        let image_folder = tmp.path().join("prepared");
        tokio::fs::create_dir_all(&image_folder).await.unwrap();
        let spec = echo_spec();

        // Exercise Dockerfile + user-script preparation directly (binary
        // download hits the real GitHub URLs, which are unreachable in this
        // sandboxed test run) and job submission/wait against the mock server.
        client.write_dockerfile(&image_folder, &spec.image).await.unwrap();
        client.write_user_script(&image_folder, &spec).await.unwrap();
        let dockerfile = tokio::fs::read_to_string(image_folder.join("Dockerfile"))
            .await
            .unwrap();
        assert!(dockerfile.contains("FROM alpine:3"));
        let script = tokio::fs::read_to_string(image_folder.join("user_script.sh"))
            .await
            .unwrap();
        assert_eq!(script, "cat $1");

        let job_name = BuilderClient::job_name(&spec.name);
        let registry_image_id = client.registry_image_id(&spec.name);
        assert_eq!(registry_image_id, "registry.local/echo");
        let definition = client.job_definition(&job_name, &image_folder, &registry_image_id);
        client
            .cluster()
            .create_job(&definition, &job_name, BUILD_NAMESPACE)
            .await
            .unwrap();
        let outcome = client
            .cluster()
            .wait_job(&job_name, BUILD_NAMESPACE, true, std::time::Duration::from_millis(1))
            .await;
        assert_eq!(outcome, oscar_cluster_client::JobOutcome::Succeeded);

        job_mock.assert_async().await;
        wait_mock.assert_async().await;
    }

    #[test]
    fn dockerfile_template_replaces_base_image_line_only() {
        let rewritten = DOCKERFILE_TEMPLATE.replace("FROM ubuntu", "FROM alpine:3");
        assert!(rewritten.starts_with("FROM alpine:3"));
        assert!(rewritten.contains("fwatchdog"));
    }
}
