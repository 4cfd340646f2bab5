//! OpenFaaS gateway client: registers functions fronted by the `supervisor`
//! entrypoint and invokes them synchronously or asynchronously.
//!
//! Every function definition this client sends carries a fixed set of
//! overrides (`envProcess=supervisor`, generous timeouts, scale-to-zero) so
//! the caller's spec never needs to know about the supervisor wiring.

use std::collections::HashMap;

use oscar_common::{FunctionSpec, OscarError};
use serde_json::json;
use thiserror::Error;
use tracing::{error, info, instrument};

const FUNCTIONS_PATH: &str = "system/functions";
const FUNCTION_INFO_PATH: &str = "system/function";
const INVOKE_SYNC_PATH: &str = "function";
const INVOKE_ASYNC_PATH: &str = "async-function";
const BASIC_AUTH_USER_PATH: &str = "/var/secrets/basic-auth-user";
const BASIC_AUTH_PASSWORD_PATH: &str = "/var/secrets/basic-auth-password";

#[derive(Error, Debug)]
pub enum FaasError {
    #[error(transparent)]
    Common(#[from] OscarError),
}

pub type Result<T> = std::result::Result<T, FaasError>;

#[derive(Debug, Clone)]
pub struct FaasConfig {
    pub endpoint: String,
    pub basic_auth: Option<(String, String)>,
}

impl FaasConfig {
    pub fn from_env() -> std::result::Result<Self, OscarError> {
        let endpoint = std::env::var("OPENFAAS_ENDPOINT")
            .map_err(|_| OscarError::ConfigMissing("OPENFAAS_ENDPOINT".to_string()))?;
        let basic_auth = match (
            std::fs::read_to_string(BASIC_AUTH_USER_PATH),
            std::fs::read_to_string(BASIC_AUTH_PASSWORD_PATH),
        ) {
            (Ok(user), Ok(pass)) => Some((user.trim().to_string(), pass.trim().to_string())),
            _ => None,
        };
        Ok(Self { endpoint, basic_auth })
    }
}

pub struct FaasClient {
    config: FaasConfig,
    http: reqwest::Client,
}

impl FaasClient {
    pub fn new(config: FaasConfig) -> Self {
        Self {
            config,
            http: reqwest::Client::new(),
        }
    }

    fn with_auth(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.config.basic_auth {
            Some((user, pass)) => builder.basic_auth(user, Some(pass)),
            None => builder,
        }
    }

    /// Builds the OpenFaaS function-definition payload, forcing the
    /// supervisor entrypoint, generous timeouts, scale-to-zero, and a copy
    /// of the function's script under `SCRIPT` regardless of what the
    /// caller's spec already carries in those slots.
    fn function_definition(&self, spec: &FunctionSpec) -> serde_json::Value {
        let mut env_vars: HashMap<String, String> = spec.env_vars.clone();
        env_vars.insert("read_timeout".to_string(), "90".to_string());
        env_vars.insert("write_timeout".to_string(), "90".to_string());
        if let Some(script) = &spec.script {
            env_vars.insert("SCRIPT".to_string(), script.clone());
        }

        let mut labels: HashMap<String, String> = spec.labels.clone();
        labels.insert("com.openfaas.scale.zero".to_string(), "true".to_string());

        json!({
            "service": spec.name,
            "image": spec.image,
            "envProcess": "supervisor",
            "envVars": env_vars,
            "labels": labels,
            "annotations": spec.annotations,
        })
    }

    #[instrument(skip(self, spec), fields(name = %spec.name))]
    pub async fn create_function(&self, spec: &FunctionSpec) -> Result<()> {
        let definition = self.function_definition(spec);
        let resp = self
            .with_auth(self.http.post(format!("{}/{FUNCTIONS_PATH}", self.config.endpoint)))
            .json(&definition)
            .send()
            .await
            .map_err(|source| {
                FaasError::Common(OscarError::Transport {
                    target: "openfaas gateway".to_string(),
                    source,
                })
            })?;
        let status = resp.status().as_u16();
        if !oscar_common::is_create_status_ok(status) {
            let body = resp.text().await.unwrap_or_default();
            error!(%status, %body, "error creating function");
            return Err(FaasError::Common(OscarError::Upstream { status, body }));
        }
        info!("function created");
        Ok(())
    }

    #[instrument(skip(self))]
    pub async fn delete_function(&self, name: &str) -> Result<()> {
        let payload = json!({ "functionName": name });
        let resp = self
            .with_auth(self.http.delete(format!("{}/{FUNCTIONS_PATH}", self.config.endpoint)))
            .json(&payload)
            .send()
            .await
            .map_err(|source| {
                FaasError::Common(OscarError::Transport {
                    target: "openfaas gateway".to_string(),
                    source,
                })
            })?;
        let status = resp.status().as_u16();
        if !oscar_common::is_delete_status_ok(status) {
            let body = resp.text().await.unwrap_or_default();
            error!(%status, %body, "error deleting function");
            return Err(FaasError::Common(OscarError::Upstream { status, body }));
        }
        info!("function deleted");
        Ok(())
    }

    /// Fetches per-function metadata verbatim (status + body), backing
    /// `GET /function/{name}`. Not the idempotency check `init` uses — see
    /// [`FaasClient::exists_raw`] for that (spec.md §4.5 distinguishes the
    /// metadata path from the synchronous invocation path).
    #[instrument(skip(self))]
    pub async fn get_raw(&self, name: &str) -> Result<(u16, Vec<u8>)> {
        let resp = self
            .with_auth(
                self.http
                    .get(format!("{}/{FUNCTION_INFO_PATH}/{name}", self.config.endpoint)),
            )
            .send()
            .await
            .map_err(|source| {
                FaasError::Common(OscarError::Transport {
                    target: "openfaas gateway".to_string(),
                    source,
                })
            })?;
        let status = resp.status().as_u16();
        let body = resp.bytes().await.map_err(|source| {
            FaasError::Common(OscarError::Transport {
                target: "openfaas gateway".to_string(),
                source,
            })
        })?;
        Ok((status, body.to_vec()))
    }

    /// Probes the synchronous invocation path (not the metadata path) for
    /// `name`, per spec.md §4.5: `exists` "maps a 200 on the synchronous
    /// invocation path to 'present'". Status and body are returned verbatim
    /// so `init`'s idempotency short-circuit (spec.md §4.6 step 1) can
    /// forward the gateway's own response.
    #[instrument(skip(self))]
    pub async fn exists_raw(&self, name: &str) -> Result<(u16, Vec<u8>)> {
        let resp = self
            .with_auth(
                self.http
                    .get(format!("{}/{INVOKE_SYNC_PATH}/{name}", self.config.endpoint)),
            )
            .send()
            .await
            .map_err(|source| {
                FaasError::Common(OscarError::Transport {
                    target: "openfaas gateway".to_string(),
                    source,
                })
            })?;
        let status = resp.status().as_u16();
        let body = resp.bytes().await.map_err(|source| {
            FaasError::Common(OscarError::Transport {
                target: "openfaas gateway".to_string(),
                source,
            })
        })?;
        Ok((status, body.to_vec()))
    }

    #[instrument(skip(self))]
    pub async fn exists(&self, name: &str) -> Result<bool> {
        Ok(self.exists_raw(name).await?.0 == 200)
    }

    /// Lists all registered functions, pass-through of the gateway's own
    /// listing payload.
    #[instrument(skip(self))]
    pub async fn list(&self) -> Result<(u16, Vec<u8>)> {
        let resp = self
            .with_auth(self.http.get(format!("{}/{FUNCTIONS_PATH}", self.config.endpoint)))
            .send()
            .await
            .map_err(|source| {
                FaasError::Common(OscarError::Transport {
                    target: "openfaas gateway".to_string(),
                    source,
                })
            })?;
        let status = resp.status().as_u16();
        let body = resp.bytes().await.map_err(|source| {
            FaasError::Common(OscarError::Transport {
                target: "openfaas gateway".to_string(),
                source,
            })
        })?;
        Ok((status, body.to_vec()))
    }

    #[instrument(skip(self))]
    pub async fn get_function_env_vars(&self, name: &str) -> Result<HashMap<String, String>> {
        let resp = self
            .with_auth(
                self.http
                    .get(format!("{}/{FUNCTION_INFO_PATH}/{name}", self.config.endpoint)),
            )
            .send()
            .await
            .map_err(|source| {
                FaasError::Common(OscarError::Transport {
                    target: "openfaas gateway".to_string(),
                    source,
                })
            })?;
        let status = resp.status().as_u16();
        if !oscar_common::is_get_status_ok(status) {
            let body = resp.text().await.unwrap_or_default();
            error!(%status, %body, "error reading function info");
            return Err(FaasError::Common(OscarError::Upstream { status, body }));
        }
        let body: serde_json::Value = resp.json().await.map_err(|source| {
            FaasError::Common(OscarError::Transport {
                target: "openfaas gateway".to_string(),
                source,
            })
        })?;
        Ok(body
            .get("envVars")
            .and_then(|v| v.as_object())
            .map(|obj| {
                obj.iter()
                    .filter_map(|(k, v)| v.as_str().map(|v| (k.clone(), v.to_string())))
                    .collect()
            })
            .unwrap_or_default())
    }

    /// Invokes the function. `asynch` selects the `async-function` path
    /// (fire-and-forget, 202 accepted) over the request/response `function`
    /// path; the response body is returned verbatim either way.
    #[instrument(skip(self, body), fields(name = %name, %asynch))]
    pub async fn invoke(&self, name: &str, body: Vec<u8>, asynch: bool) -> Result<Vec<u8>> {
        let path = if asynch { INVOKE_ASYNC_PATH } else { INVOKE_SYNC_PATH };
        let resp = self
            .with_auth(self.http.post(format!("{}/{path}/{name}", self.config.endpoint)))
            .body(body)
            .send()
            .await
            .map_err(|source| {
                FaasError::Common(OscarError::Transport {
                    target: "openfaas gateway".to_string(),
                    source,
                })
            })?;
        let status = resp.status().as_u16();
        if asynch {
            if status != 202 {
                let body = resp.text().await.unwrap_or_default();
                error!(%status, %body, "error invoking function asynchronously");
                return Err(FaasError::Common(OscarError::Upstream { status, body }));
            }
            return Ok(Vec::new());
        }
        if !status_is_invoke_ok(status) {
            let body = resp.text().await.unwrap_or_default();
            error!(%status, %body, "error invoking function");
            return Err(FaasError::Common(OscarError::Upstream { status, body }));
        }
        resp.bytes().await.map(|b| b.to_vec()).map_err(|source| {
            FaasError::Common(OscarError::Transport {
                target: "openfaas gateway".to_string(),
                source,
            })
        })
    }
}

fn status_is_invoke_ok(status: u16) -> bool {
    (200..300).contains(&status)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config_for(endpoint: &str) -> FaasConfig {
        FaasConfig {
            endpoint: endpoint.to_string(),
            basic_auth: None,
        }
    }

    #[test]
    fn function_definition_forces_supervisor_wiring_regardless_of_input() {
        let client = FaasClient::new(config_for("http://unused"));
        let mut spec = FunctionSpec::new("echo", "alpine:3");
        spec.script = Some("ZWNobyBoaQ==".to_string());
        spec.env_vars.insert("read_timeout".to_string(), "5".to_string());

        let definition = client.function_definition(&spec);
        assert_eq!(definition["envProcess"], "supervisor");
        assert_eq!(definition["envVars"]["read_timeout"], "90");
        assert_eq!(definition["envVars"]["write_timeout"], "90");
        assert_eq!(definition["envVars"]["SCRIPT"], "ZWNobyBoaQ==");
        assert_eq!(definition["labels"]["com.openfaas.scale.zero"], "true");
    }

    #[tokio::test]
    async fn create_function_accepts_202() {
        let mut server = mockito::Server::new_async().await;
        let m = server
            .mock("POST", "/system/functions")
            .with_status(202)
            .create_async()
            .await;
        let client = FaasClient::new(config_for(&server.url()));
        client
            .create_function(&FunctionSpec::new("echo", "alpine:3"))
            .await
            .unwrap();
        m.assert_async().await;
    }

    #[tokio::test]
    async fn get_raw_forwards_status_and_body_verbatim() {
        let mut server = mockito::Server::new_async().await;
        let m = server
            .mock("GET", "/system/function/echo")
            .with_status(200)
            .with_body(r#"{"service":"echo"}"#)
            .create_async()
            .await;
        let client = FaasClient::new(config_for(&server.url()));
        let (status, body) = client.get_raw("echo").await.unwrap();
        assert_eq!(status, 200);
        assert_eq!(body, br#"{"service":"echo"}"#);
        m.assert_async().await;
    }

    #[tokio::test]
    async fn exists_reports_false_on_404() {
        let mut server = mockito::Server::new_async().await;
        let _m = server
            .mock("GET", "/function/echo")
            .with_status(404)
            .create_async()
            .await;
        let client = FaasClient::new(config_for(&server.url()));
        assert!(!client.exists("echo").await.unwrap());
    }

    #[tokio::test]
    async fn exists_raw_probes_synchronous_invocation_path_not_metadata_path() {
        let mut server = mockito::Server::new_async().await;
        let m = server
            .mock("GET", "/function/echo")
            .with_status(200)
            .with_body("already running")
            .create_async()
            .await;
        let client = FaasClient::new(config_for(&server.url()));
        let (status, body) = client.exists_raw("echo").await.unwrap();
        assert_eq!(status, 200);
        assert_eq!(body, b"already running");
        m.assert_async().await;
    }

    #[tokio::test]
    async fn invoke_async_returns_empty_body_on_202() {
        let mut server = mockito::Server::new_async().await;
        let m = server
            .mock("POST", "/async-function/echo")
            .with_status(202)
            .create_async()
            .await;
        let client = FaasClient::new(config_for(&server.url()));
        let body = client.invoke("echo", b"hi".to_vec(), true).await.unwrap();
        assert!(body.is_empty());
        m.assert_async().await;
    }

    #[tokio::test]
    async fn invoke_sync_returns_response_body() {
        let mut server = mockito::Server::new_async().await;
        let m = server
            .mock("POST", "/function/echo")
            .with_status(200)
            .with_body("hi back")
            .create_async()
            .await;
        let client = FaasClient::new(config_for(&server.url()));
        let body = client.invoke("echo", b"hi".to_vec(), false).await.unwrap();
        assert_eq!(body, b"hi back");
        m.assert_async().await;
    }
}
