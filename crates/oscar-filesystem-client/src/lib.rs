//! OneData/CDMI filesystem client: space-folder provisioning and the
//! `onetrigger` deployment that watches the input folder for new objects.
//!
//! Folder operations are best-effort: a failure is logged and swallowed
//! rather than propagated, mirroring the original controller's behavior of
//! never letting a storage-provider hiccup abort function registration.

use oscar_cluster_client::ClusterClient;
use oscar_common::FunctionSpec;
use serde_json::json;
use tracing::{error, info, warn};

const CDMI_VERSION_HEADER: &str = "X-CDMI-Specification-Version";
const CDMI_VERSION: &str = "1.1.1";
const CDMI_CONTAINER_CONTENT_TYPE: &str = "application/cdmi-container";
const ONETRIGGER_NAMESPACE: &str = "oscar";

#[derive(Debug, Clone)]
pub struct FilesystemConfig {
    pub function_name: String,
    /// Explicit `OUTPUT_BUCKET` override; when set, no output folder is
    /// provisioned and this name is reported verbatim.
    pub output_bucket: Option<String>,
    pub oneprovider_host: String,
    pub onedata_access_token: String,
    pub onedata_space: String,
}

impl FilesystemConfig {
    pub fn from_spec(spec: &FunctionSpec) -> Option<Self> {
        let oneprovider_host = spec.env_vars.get("ONEPROVIDER_HOST")?.clone();
        let onedata_access_token = spec.env_vars.get("ONEDATA_ACCESS_TOKEN")?.clone();
        let onedata_space = spec
            .env_vars
            .get("ONEDATA_SPACE")?
            .trim_matches(|c: char| c == '/' || c == ' ')
            .to_string();
        let output_bucket = spec
            .env_vars
            .get("OUTPUT_BUCKET")
            .map(|v| v.trim_matches(|c: char| c == '/' || c == ' ').to_string());
        Some(Self {
            function_name: spec.name.clone(),
            output_bucket,
            oneprovider_host,
            onedata_access_token,
            onedata_space,
        })
    }
}

pub struct FilesystemClient {
    config: FilesystemConfig,
    cluster: ClusterClient,
    http: reqwest::Client,
    /// `grycap/onetrigger:<ONETRIGGER_VERSION|latest>`, per spec.md §4.4.
    onetrigger_image: String,
    /// FaaS gateway base URL; the onetrigger sidecar posts new-object
    /// notifications to `<faas_endpoint>/async-function/<fn>`.
    faas_endpoint: String,
}

impl FilesystemClient {
    pub fn new(
        config: FilesystemConfig,
        cluster: ClusterClient,
        onetrigger_version: Option<String>,
        faas_endpoint: impl Into<String>,
    ) -> Self {
        let onetrigger_image = format!(
            "grycap/onetrigger:{}",
            onetrigger_version.as_deref().unwrap_or("latest")
        );
        Self {
            config,
            cluster,
            http: reqwest::Client::new(),
            onetrigger_image,
            faas_endpoint: faas_endpoint.into(),
        }
    }

    /// Oneprovider hosts are normally a bare hostname (implicit `https://`),
    /// but an already-schemed value (e.g. a test double) is taken as-is.
    fn provider_base_url(&self) -> String {
        if self.config.oneprovider_host.starts_with("http") {
            self.config.oneprovider_host.clone()
        } else {
            format!("https://{}", self.config.oneprovider_host)
        }
    }

    fn space_url(&self) -> String {
        format!(
            "{}/cdmi/{}?children",
            self.provider_base_url(),
            self.config.onedata_space
        )
    }

    fn folder_url(&self, folder_name: &str) -> String {
        format!(
            "{}/cdmi/{}/{}/",
            self.provider_base_url(),
            self.config.onedata_space,
            folder_name
        )
    }

    fn auth_header(&self) -> &str {
        &self.config.onedata_access_token
    }

    /// Verifies the configured space is reachable with the configured
    /// token, per spec.md §4.4: queries the space itself (the provider has
    /// no separate "list all spaces" endpoint in the CDMI protocol this
    /// client speaks, so the space-scoped children query doubles as the
    /// authorization probe). A 401 authoritatively disables the binding; any
    /// other non-200 status or transport failure is logged and reported as
    /// `false` rather than propagated.
    pub async fn check_connection(&self) -> bool {
        let resp = match self
            .http
            .get(self.space_url())
            .header(CDMI_VERSION_HEADER, CDMI_VERSION)
            .header("X-Auth-Token", self.auth_header())
            .send()
            .await
        {
            Ok(resp) => resp,
            Err(e) => {
                warn!(space = %self.config.onedata_space, error = %e, "cannot reach filesystem provider");
                return false;
            }
        };
        match resp.status().as_u16() {
            200 => true,
            401 => {
                warn!(space = %self.config.onedata_space, "filesystem token unauthorized, disabling binding");
                false
            }
            status => {
                warn!(space = %self.config.onedata_space, %status, "unexpected status checking filesystem connection");
                false
            }
        }
    }

    async fn create_folder(&self, folder_name: &str) {
        let resp = self
            .http
            .put(self.folder_url(folder_name))
            .header(CDMI_VERSION_HEADER, CDMI_VERSION)
            .header("Content-Type", CDMI_CONTAINER_CONTENT_TYPE)
            .header("X-Auth-Token", self.auth_header())
            .send()
            .await;
        match resp {
            Ok(resp) if matches!(resp.status().as_u16(), 201 | 202) => {
                info!(folder = %folder_name, space = %self.config.onedata_space, "folder created");
            }
            Ok(resp) => {
                warn!(folder = %folder_name, status = %resp.status(), "unable to create folder");
            }
            Err(e) => {
                warn!(folder = %folder_name, error = %e, "unable to create folder");
            }
        }
    }

    async fn delete_folder(&self, folder_name: &str) {
        let resp = self
            .http
            .delete(self.folder_url(folder_name))
            .header(CDMI_VERSION_HEADER, CDMI_VERSION)
            .header("X-Auth-Token", self.auth_header())
            .send()
            .await;
        match resp {
            Ok(resp) if resp.status().as_u16() == 204 => {
                info!(folder = %folder_name, space = %self.config.onedata_space, "folder deleted");
            }
            Ok(resp) => {
                warn!(folder = %folder_name, status = %resp.status(), "unable to delete folder");
            }
            Err(e) => {
                warn!(folder = %folder_name, error = %e, "unable to delete folder");
            }
        }
    }

    pub async fn create_input_folder(&self) {
        self.create_folder(&format!("{}-in", self.config.function_name)).await;
    }

    pub async fn create_output_folder(&self) {
        if self.config.output_bucket.is_none() {
            self.create_folder(&format!("{}-out", self.config.function_name)).await;
        }
    }

    pub async fn delete_input_folder(&self) {
        self.delete_folder(&format!("{}-in", self.config.function_name)).await;
    }

    pub async fn delete_output_folder(&self) {
        self.delete_folder(&format!("{}-out", self.config.function_name)).await;
    }

    pub fn output_bucket_name(&self) -> String {
        self.config
            .output_bucket
            .clone()
            .unwrap_or_else(|| format!("{}-out", self.config.function_name))
    }

    fn onetrigger_name(&self) -> String {
        format!("{}-onetrigger", self.config.function_name)
    }

    fn onetrigger_definition(&self) -> serde_json::Value {
        let name = self.onetrigger_name();
        json!({
            "apiVersion": "apps/v1",
            "kind": "Deployment",
            "metadata": {
                "name": name,
                "namespace": ONETRIGGER_NAMESPACE,
                "labels": { "app": name }
            },
            "spec": {
                "selector": { "matchLabels": { "app": name } },
                "replicas": 1,
                "template": {
                    "metadata": { "labels": { "app": name } },
                    "spec": {
                        "containers": [{
                            "name": "onetrigger",
                            "image": self.onetrigger_image,
                            "imagePullPolicy": "Always",
                            "env": [
                                { "name": "ONEPROVIDER_HOST", "value": self.config.oneprovider_host },
                                { "name": "ONEDATA_ACCESS_TOKEN", "value": self.config.onedata_access_token },
                                { "name": "ONEDATA_SPACE", "value": self.config.onedata_space },
                                { "name": "ONEDATA_SPACE_FOLDER", "value": format!("{}-in", self.config.function_name) },
                                { "name": "ONETRIGGER_WEBHOOK", "value": format!("{}/async-function/{}", self.faas_endpoint, self.config.function_name) }
                            ]
                        }]
                    }
                }
            }
        })
    }

    /// Deploys the `onetrigger` sidecar that polls the input folder and
    /// forwards new-object notifications to the FaaS gateway's async-invoke
    /// endpoint for this function, per spec.md §4.4.
    pub async fn deploy_onetrigger(&self) {
        let name = self.onetrigger_name();
        let definition = self.onetrigger_definition();
        if let Err(e) = self
            .cluster
            .create_deployment(&definition, &name, ONETRIGGER_NAMESPACE)
            .await
        {
            error!(deployment = %name, error = %e, "unable to deploy onetrigger");
        }
    }

    pub async fn delete_onetrigger_deploy(&self) {
        let name = self.onetrigger_name();
        if let Err(e) = self.cluster.delete_deployment(&name, ONETRIGGER_NAMESPACE).await {
            error!(deployment = %name, error = %e, "unable to delete onetrigger deployment");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use oscar_cluster_client::ClusterConfig;
    use std::collections::HashMap;

    fn config() -> FilesystemConfig {
        FilesystemConfig {
            function_name: "echo".to_string(),
            output_bucket: None,
            oneprovider_host: "oneprovider.example.org".to_string(),
            onedata_access_token: "tok".to_string(),
            onedata_space: "myspace".to_string(),
        }
    }

    fn cluster_for(server_url: &str) -> ClusterClient {
        ClusterClient::new(ClusterConfig::new(server_url, "test-token"))
    }

    #[test]
    fn config_from_spec_reads_onedata_env_vars_and_trims_space() {
        let mut spec = FunctionSpec::new("echo", "alpine:3");
        spec.env_vars.insert("ONEPROVIDER_HOST".to_string(), "host".to_string());
        spec.env_vars.insert("ONEDATA_ACCESS_TOKEN".to_string(), "tok".to_string());
        spec.env_vars.insert("ONEDATA_SPACE".to_string(), " myspace/ ".to_string());
        let cfg = FilesystemConfig::from_spec(&spec).expect("onedata config should parse");
        assert_eq!(cfg.onedata_space, "myspace");
        assert!(cfg.output_bucket.is_none());
    }

    #[test]
    fn config_from_spec_is_none_without_oneprovider_host() {
        let spec = FunctionSpec::new("echo", "alpine:3");
        assert!(FilesystemConfig::from_spec(&spec).is_none());
    }

    fn client_for(server_url: &str, onetrigger_version: Option<&str>, faas_endpoint: &str) -> FilesystemClient {
        FilesystemClient::new(
            config(),
            cluster_for(server_url),
            onetrigger_version.map(str::to_string),
            faas_endpoint,
        )
    }

    #[test]
    fn output_bucket_name_defaults_to_name_out_suffix() {
        let client = client_for("https://unused.example", None, "http://gateway.oscar");
        assert_eq!(client.output_bucket_name(), "echo-out");
    }

    #[test]
    fn output_bucket_name_honors_explicit_override() {
        let mut cfg = config();
        cfg.output_bucket = Some("shared-out".to_string());
        let client = FilesystemClient::new(cfg, cluster_for("https://unused.example"), None, "http://gateway.oscar");
        assert_eq!(client.output_bucket_name(), "shared-out");
    }

    #[test]
    fn onetrigger_image_defaults_to_latest_and_honors_version_override() {
        let default = client_for("https://unused.example", None, "http://gateway.oscar");
        assert_eq!(default.onetrigger_image, "grycap/onetrigger:latest");

        let pinned = client_for("https://unused.example", Some("1.4.0"), "http://gateway.oscar");
        assert_eq!(pinned.onetrigger_image, "grycap/onetrigger:1.4.0");
    }

    #[test]
    fn onetrigger_definition_webhook_targets_faas_async_invoke_endpoint() {
        let client = client_for("https://unused.example", None, "http://gateway.oscar");
        let definition = client.onetrigger_definition();
        let env = definition["spec"]["template"]["spec"]["containers"][0]["env"]
            .as_array()
            .unwrap();
        let webhook = env
            .iter()
            .find(|e| e["name"] == "ONETRIGGER_WEBHOOK")
            .unwrap();
        assert_eq!(webhook["value"], "http://gateway.oscar/async-function/echo");
    }

    fn client_with_provider(provider_url: &str) -> FilesystemClient {
        let mut cfg = config();
        cfg.oneprovider_host = provider_url.to_string();
        FilesystemClient::new(cfg, cluster_for("https://unused.example"), None, "http://gateway.oscar")
    }

    #[tokio::test]
    async fn check_connection_true_on_200() {
        let mut server = mockito::Server::new_async().await;
        let m = server
            .mock("GET", "/cdmi/myspace?children")
            .with_status(200)
            .create_async()
            .await;
        let client = client_with_provider(&server.url());
        assert!(client.check_connection().await);
        m.assert_async().await;
    }

    #[tokio::test]
    async fn check_connection_false_on_401() {
        let mut server = mockito::Server::new_async().await;
        let m = server
            .mock("GET", "/cdmi/myspace?children")
            .with_status(401)
            .create_async()
            .await;
        let client = client_with_provider(&server.url());
        assert!(!client.check_connection().await);
        m.assert_async().await;
    }

    #[tokio::test]
    async fn check_connection_false_on_unexpected_status() {
        let mut server = mockito::Server::new_async().await;
        let m = server
            .mock("GET", "/cdmi/myspace?children")
            .with_status(500)
            .create_async()
            .await;
        let client = client_with_provider(&server.url());
        assert!(!client.check_connection().await);
        m.assert_async().await;
    }

    #[tokio::test]
    async fn check_connection_false_on_transport_error() {
        let client = client_with_provider("http://127.0.0.1:1");
        assert!(!client.check_connection().await);
    }

    #[tokio::test]
    async fn deploy_onetrigger_posts_under_oscar_namespace() {
        let mut server = mockito::Server::new_async().await;
        let m = server
            .mock("POST", "/apis/apps/v1/namespaces/oscar/deployments")
            .with_status(201)
            .create_async()
            .await;
        let client = client_for(&server.url(), None, "http://gateway.oscar");
        client.deploy_onetrigger().await;
        m.assert_async().await;
    }

    #[tokio::test]
    async fn delete_onetrigger_deploy_targets_name_suffixed_deployment() {
        let mut server = mockito::Server::new_async().await;
        let m = server
            .mock("DELETE", "/apis/apps/v1/namespaces/oscar/deployments/echo-onetrigger")
            .with_status(200)
            .create_async()
            .await;
        let client = client_for(&server.url(), None, "http://gateway.oscar");
        client.delete_onetrigger_deploy().await;
        m.assert_async().await;
    }
}
