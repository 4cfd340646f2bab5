//! Coordinates function lifecycle across the five storage/compute
//! collaborators: build an image, provision storage, register the function
//! with the FaaS gateway, and route storage events back to invocations.
//!
//! The collaborators are abstracted behind small traits so the state machine
//! can be exercised with `mockall` doubles instead of live clusters; the
//! concrete client crates each get a thin trait impl that just delegates to
//! their own inherent methods.

pub mod event_router;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use oscar_builder_client::BuilderClient;
use oscar_cluster_client::{ClusterClient, EnvVar};
use oscar_common::{FunctionSpec, OscarError, StorageBinding};
use oscar_faas_client::FaasClient;
use oscar_filesystem_client::{FilesystemClient, FilesystemConfig};
use oscar_objectstore_client::ObjectStoreClient;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{info, instrument, warn};

/// Namespace faas-netes creates function Deployments in; `getFunctionEnvironmentVariables`
/// reads them back from here.
pub const FUNCTIONS_NAMESPACE: &str = "openfaas-fn";
const OBJECTSTORE_KIND: &str = "MINIO";

/// Generates a fresh, per-function provider id for the mandatory
/// object-store binding, per spec.md §4.6 step 4 ("generate a random
/// providerId"). Six digits keeps the derived env-var keys readable while
/// being effectively unique per function lifetime.
fn generate_provider_id() -> String {
    rand::Rng::gen_range(&mut rand::thread_rng(), 100_000..1_000_000).to_string()
}

/// Builds the `STORAGE_AUTH_MINIO_<pid>_*` / `STORAGE_PATH_{INPUT,OUTPUT}_<pid>`
/// env vars that let the user script discover its object-store credentials
/// and paths, per spec.md §6's naming convention.
fn object_store_env(
    provider_id: &str,
    auth: &ObjectStoreAuth,
    input_path: &str,
    output_path: &str,
) -> HashMap<String, String> {
    HashMap::from([
        (
            format!("STORAGE_AUTH_{OBJECTSTORE_KIND}_{provider_id}_USER"),
            auth.access_key.clone(),
        ),
        (
            format!("STORAGE_AUTH_{OBJECTSTORE_KIND}_{provider_id}_PASS"),
            auth.secret_key.clone(),
        ),
        (
            format!("STORAGE_AUTH_{OBJECTSTORE_KIND}_{provider_id}_HOST"),
            auth.endpoint.clone(),
        ),
        (format!("STORAGE_PATH_INPUT_{provider_id}"), input_path.to_string()),
        (format!("STORAGE_PATH_OUTPUT_{provider_id}"), output_path.to_string()),
    ])
}

/// Object-store credentials the orchestrator stamps into every registered
/// function's env, mirroring `MINIO_ENDPOINT`/`MINIO_USER`/`MINIO_PASS`.
#[derive(Debug, Clone)]
pub struct ObjectStoreAuth {
    pub endpoint: String,
    pub access_key: String,
    pub secret_key: String,
}

#[derive(Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Common(#[from] OscarError),
}

pub type Result<T> = std::result::Result<T, Error>;

#[async_trait]
pub trait BuilderOps: Send + Sync {
    async fn build_and_push(&self, spec: &FunctionSpec) -> std::result::Result<String, OscarError>;
    /// The `<registry>/<name>` tag a build for `name` pushes to, derived
    /// purely from config rather than the outcome of an actual build — used
    /// to stamp a function's registration even when `build_and_push` failed
    /// (spec.md §7: a build failure is best-effort, not fatal to `init`).
    fn expected_image_tag(&self, name: &str) -> String;
}

#[async_trait]
impl BuilderOps for BuilderClient {
    async fn build_and_push(&self, spec: &FunctionSpec) -> std::result::Result<String, OscarError> {
        self.build_and_push(spec)
            .await
            .map_err(|e| OscarError::Other(e.to_string()))
    }
    fn expected_image_tag(&self, name: &str) -> String {
        self.registry_image_id(name)
    }
}

#[async_trait]
pub trait ObjectStoreOps: Send + Sync {
    async fn create_input_bucket(&self, input_path: &str) -> std::result::Result<(), OscarError>;
    async fn create_output_bucket(&self, output_path: &str) -> std::result::Result<(), OscarError>;
    async fn delete_input_bucket(&self, input_path: &str) -> std::result::Result<(), OscarError>;
    async fn delete_output_bucket(&self, output_path: &str) -> std::result::Result<(), OscarError>;
}

#[async_trait]
impl ObjectStoreOps for ObjectStoreClient {
    async fn create_input_bucket(&self, input_path: &str) -> std::result::Result<(), OscarError> {
        self.create_input_bucket(input_path)
            .await
            .map_err(|e| OscarError::Other(e.to_string()))
    }
    async fn create_output_bucket(&self, output_path: &str) -> std::result::Result<(), OscarError> {
        self.create_output_bucket(output_path)
            .await
            .map_err(|e| OscarError::Other(e.to_string()))
    }
    async fn delete_input_bucket(&self, input_path: &str) -> std::result::Result<(), OscarError> {
        self.delete_input_bucket(input_path)
            .await
            .map_err(|e| OscarError::Other(e.to_string()))
    }
    async fn delete_output_bucket(&self, output_path: &str) -> std::result::Result<(), OscarError> {
        self.delete_output_bucket(output_path)
            .await
            .map_err(|e| OscarError::Other(e.to_string()))
    }
}

#[async_trait]
pub trait FaasOps: Send + Sync {
    async fn create_function(&self, spec: &FunctionSpec) -> std::result::Result<(), OscarError>;
    async fn delete_function(&self, name: &str) -> std::result::Result<(), OscarError>;
    async fn invoke(
        &self,
        name: &str,
        body: Vec<u8>,
        asynch: bool,
    ) -> std::result::Result<Vec<u8>, OscarError>;
    /// Verbatim (status, body) of the gateway's per-function metadata, used
    /// for `GET /function/{name}`.
    async fn get_raw(&self, name: &str) -> std::result::Result<(u16, Vec<u8>), OscarError>;
    /// Verbatim (status, body) of a probe against the gateway's synchronous
    /// invocation path, per spec.md §4.5 `exists` — used for the `init`
    /// idempotency short-circuit (spec.md §4.6 step 1), distinct from
    /// `get_raw`'s metadata path.
    async fn exists_raw(&self, name: &str) -> std::result::Result<(u16, Vec<u8>), OscarError>;
    /// Verbatim (status, body) of the gateway's function listing.
    async fn list_raw(&self) -> std::result::Result<(u16, Vec<u8>), OscarError>;
}

#[async_trait]
impl FaasOps for FaasClient {
    async fn create_function(&self, spec: &FunctionSpec) -> std::result::Result<(), OscarError> {
        self.create_function(spec)
            .await
            .map_err(|e| OscarError::Other(e.to_string()))
    }
    async fn delete_function(&self, name: &str) -> std::result::Result<(), OscarError> {
        self.delete_function(name)
            .await
            .map_err(|e| OscarError::Other(e.to_string()))
    }
    async fn invoke(
        &self,
        name: &str,
        body: Vec<u8>,
        asynch: bool,
    ) -> std::result::Result<Vec<u8>, OscarError> {
        self.invoke(name, body, asynch)
            .await
            .map_err(|e| OscarError::Other(e.to_string()))
    }
    async fn get_raw(&self, name: &str) -> std::result::Result<(u16, Vec<u8>), OscarError> {
        self.get_raw(name)
            .await
            .map_err(|e| OscarError::Other(e.to_string()))
    }
    async fn exists_raw(&self, name: &str) -> std::result::Result<(u16, Vec<u8>), OscarError> {
        self.exists_raw(name)
            .await
            .map_err(|e| OscarError::Other(e.to_string()))
    }
    async fn list_raw(&self) -> std::result::Result<(u16, Vec<u8>), OscarError> {
        self.list()
            .await
            .map_err(|e| OscarError::Other(e.to_string()))
    }
}

#[async_trait]
pub trait ClusterOps: Send + Sync {
    async fn get_deployment_env(
        &self,
        name: &str,
        namespace: &str,
    ) -> std::result::Result<Vec<EnvVar>, OscarError>;
}

#[async_trait]
impl ClusterOps for ClusterClient {
    async fn get_deployment_env(
        &self,
        name: &str,
        namespace: &str,
    ) -> std::result::Result<Vec<EnvVar>, OscarError> {
        self.get_deployment_env(name, namespace)
            .await
            .map_err(|e| OscarError::Other(e.to_string()))
    }
}

#[async_trait]
pub trait FilesystemOps: Send + Sync {
    async fn check_connection(&self) -> bool;
    async fn create_input_folder(&self);
    async fn create_output_folder(&self);
    async fn delete_input_folder(&self);
    async fn delete_output_folder(&self);
    async fn deploy_onetrigger(&self);
    async fn delete_onetrigger_deploy(&self);
    fn output_bucket_name(&self) -> String;
}

#[async_trait]
impl FilesystemOps for FilesystemClient {
    async fn check_connection(&self) -> bool {
        self.check_connection().await
    }
    async fn create_input_folder(&self) {
        self.create_input_folder().await
    }
    async fn create_output_folder(&self) {
        self.create_output_folder().await
    }
    async fn delete_input_folder(&self) {
        self.delete_input_folder().await
    }
    async fn delete_output_folder(&self) {
        self.delete_output_folder().await
    }
    async fn deploy_onetrigger(&self) {
        self.deploy_onetrigger().await
    }
    async fn delete_onetrigger_deploy(&self) {
        self.delete_onetrigger_deploy().await
    }
    fn output_bucket_name(&self) -> String {
        self.output_bucket_name()
    }
}

/// Builds a [`FilesystemOps`] handle for a spec that carries OneData env
/// vars, or `None` when the function has no filesystem binding attached.
/// A trait (rather than a bare constructor call) so orchestrator tests can
/// substitute a mock without touching real env vars or a real cluster.
pub trait FilesystemFactory: Send + Sync {
    fn client_for(&self, spec: &FunctionSpec) -> Option<Arc<dyn FilesystemOps>>;
}

pub struct DefaultFilesystemFactory {
    cluster: ClusterClient,
    /// `ONETRIGGER_VERSION` (spec.md §6); `None` pins the sidecar to `latest`.
    onetrigger_version: Option<String>,
    /// FaaS gateway base URL, so the onetrigger sidecar can be wired to post
    /// directly at `<faas_endpoint>/async-function/<fn>`.
    faas_endpoint: String,
}

impl DefaultFilesystemFactory {
    pub fn new(cluster: ClusterClient, onetrigger_version: Option<String>, faas_endpoint: impl Into<String>) -> Self {
        Self {
            cluster,
            onetrigger_version,
            faas_endpoint: faas_endpoint.into(),
        }
    }
}

impl FilesystemFactory for DefaultFilesystemFactory {
    fn client_for(&self, spec: &FunctionSpec) -> Option<Arc<dyn FilesystemOps>> {
        let config = FilesystemConfig::from_spec(spec)?;
        Some(Arc::new(FilesystemClient::new(
            config,
            self.cluster.clone(),
            self.onetrigger_version.clone(),
            self.faas_endpoint.clone(),
        )))
    }
}

/// Resolves `output_path`, honoring a per-provider `STORAGE_PATH_OUTPUT_<PID>`
/// override over the `<name>-out` default, per spec.md's provider-id env-var
/// convention.
fn resolve_output_path(spec: &FunctionSpec, provider_id: &str) -> String {
    spec.env_vars
        .get(&format!("STORAGE_PATH_OUTPUT_{provider_id}"))
        .cloned()
        .unwrap_or_else(|| spec.default_output_path())
}

/// Same override as [`resolve_output_path`], but for callers (namely `rm` on
/// an untracked function) that don't know the object-store binding's
/// `provider_id` and must instead scan for whichever `STORAGE_PATH_OUTPUT_*`
/// key is present among the function's live env vars.
fn find_output_path_override(env_vars: &HashMap<String, String>) -> Option<String> {
    env_vars
        .iter()
        .find(|(k, _)| k.starts_with("STORAGE_PATH_OUTPUT_"))
        .map(|(_, v)| v.clone())
}

/// Builds the [`StorageBinding::Filesystem`] bookkeeping entry for a function
/// whose OneData connection check succeeded. The fixed `ONEPROVIDER_HOST`/
/// `ONEDATA_ACCESS_TOKEN`/`ONEDATA_SPACE` env vars carry no embedded provider
/// id (DESIGN.md), so this mints an internal-only one the way the
/// object-store binding's is minted, purely to satisfy `StorageBinding`'s
/// shape — it never appears in an env-var key.
fn filesystem_storage_binding(spec: &FunctionSpec, output_path: String) -> Option<StorageBinding> {
    Some(StorageBinding::Filesystem {
        provider_id: generate_provider_id(),
        oneprovider_host: spec.env_vars.get("ONEPROVIDER_HOST")?.clone(),
        access_token: spec.env_vars.get("ONEDATA_ACCESS_TOKEN")?.clone(),
        space: spec.env_vars.get("ONEDATA_SPACE")?.clone(),
        input_path: spec.default_input_path(),
        output_path,
    })
}

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Credentials stamped into every registered function's env so its
    /// script can reach the object store directly (spec.md §6).
    pub objectstore_auth: ObjectStoreAuth,
}

impl OrchestratorConfig {
    pub fn new(objectstore_auth: ObjectStoreAuth) -> Self {
        Self { objectstore_auth }
    }

    pub fn from_env() -> std::result::Result<Self, OscarError> {
        let objectstore_auth = ObjectStoreAuth {
            endpoint: std::env::var("MINIO_ENDPOINT")
                .map_err(|_| OscarError::ConfigMissing("MINIO_ENDPOINT".to_string()))?,
            access_key: std::env::var("MINIO_USER")
                .map_err(|_| OscarError::ConfigMissing("MINIO_USER".to_string()))?,
            secret_key: std::env::var("MINIO_PASS")
                .map_err(|_| OscarError::ConfigMissing("MINIO_PASS".to_string()))?,
        };
        Ok(Self { objectstore_auth })
    }
}

/// Per-function state the orchestrator keeps so `rm`/`ls`/event-routing
/// don't need to re-derive storage bindings from scratch. Models spec.md
/// §3's "exactly one object-store binding (mandatory), at most one
/// filesystem binding (optional)" directly via [`StorageBinding`], rather
/// than tracking the same paths/credentials again as loose fields.
#[derive(Debug, Clone)]
struct Registration {
    spec: FunctionSpec,
    object_store: StorageBinding,
    filesystem: Option<StorageBinding>,
}

pub struct Orchestrator {
    config: OrchestratorConfig,
    builder: Arc<dyn BuilderOps>,
    objectstore: Arc<dyn ObjectStoreOps>,
    faas: Arc<dyn FaasOps>,
    cluster: Arc<dyn ClusterOps>,
    filesystem_factory: Arc<dyn FilesystemFactory>,
    registry: Mutex<HashMap<String, Registration>>,
    /// Per-function-name lock, so concurrent `init`/`rm` calls for the same
    /// name serialize instead of racing on bucket/function creation.
    name_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl Orchestrator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: OrchestratorConfig,
        builder: Arc<dyn BuilderOps>,
        objectstore: Arc<dyn ObjectStoreOps>,
        faas: Arc<dyn FaasOps>,
        cluster: Arc<dyn ClusterOps>,
        filesystem_factory: Arc<dyn FilesystemFactory>,
    ) -> Self {
        Self {
            config,
            builder,
            objectstore,
            faas,
            cluster,
            filesystem_factory,
            registry: Mutex::new(HashMap::new()),
            name_locks: Mutex::new(HashMap::new()),
        }
    }

    async fn lock_for(&self, name: &str) -> Arc<Mutex<()>> {
        let mut locks = self.name_locks.lock().await;
        locks
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

/// Outcome of the `init` idempotency check (spec.md §4.6 step 1): either the
/// function already exists and its registration response should be forwarded
/// verbatim, or it's new and the caller should spawn the background build.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExistsOutcome {
    AlreadyRegistered { status: u16, body: Vec<u8> },
    Absent,
}

impl Orchestrator {
    /// Checks whether `name` is already registered with the FaaS gateway,
    /// per spec.md §4.6 `init` step 1. A transport failure during the check
    /// is treated as "absent" (best effort, logged) so a gateway hiccup
    /// doesn't permanently block re-registration.
    #[instrument(skip(self))]
    pub async fn exists(&self, name: &str) -> ExistsOutcome {
        match self.faas.exists_raw(name).await {
            Ok((200, body)) => ExistsOutcome::AlreadyRegistered { status: 200, body },
            Ok(_) => ExistsOutcome::Absent,
            Err(e) => {
                warn!(error = %e, "existence check failed, proceeding as if absent");
                ExistsOutcome::Absent
            }
        }
    }

    /// Builds the function's image, provisions its storage bindings, and
    /// registers it with the FaaS gateway. Idempotent: re-running `init` for
    /// a name already in flight waits for the prior attempt rather than
    /// racing it (spec.md §9's TOCTOU closure).
    ///
    /// Per spec.md §7, `init` is a best-effort sequence of steps: a build
    /// failure or a bucket-provisioning failure is logged and the remaining
    /// steps still run, so a transient collaborator outage doesn't prevent
    /// the function from reaching FaaS registration. Only the final
    /// registration call's outcome is surfaced to the caller, matching the
    /// grounding original's `controller.py::init` (every internal client call
    /// logs and swallows except the last, returned `create_function`).
    ///
    /// Callers implementing the early-`200` contract (spec.md §4.6 step 2)
    /// should call [`Orchestrator::exists`] first and, if absent, spawn this
    /// method as a detached task rather than awaiting it inline.
    #[instrument(skip(self, spec), fields(name = %spec.name))]
    pub async fn init(&self, spec: FunctionSpec) -> Result<()> {
        let lock = self.lock_for(&spec.name).await;
        let _guard = lock.lock().await;

        let image = match self.builder.build_and_push(&spec).await {
            Ok(image) => image,
            Err(e) => {
                warn!(name = %spec.name, error = %e, "image build failed, continuing with expected registry tag");
                self.builder.expected_image_tag(&spec.name)
            }
        };
        let built_spec = spec.with_image(image);

        let provider_id = generate_provider_id();
        let input_path = built_spec.default_input_path();
        let output_path = resolve_output_path(&built_spec, &provider_id);
        let built_spec = built_spec.merge_env(object_store_env(
            &provider_id,
            &self.config.objectstore_auth,
            &input_path,
            &output_path,
        ));
        let object_store_binding = StorageBinding::ObjectStore {
            provider_id,
            input_path: input_path.clone(),
            output_path: output_path.clone(),
        };

        if let Err(e) = self.objectstore.create_input_bucket(&input_path).await {
            warn!(name = %built_spec.name, error = %e, "failed to create input bucket, continuing");
        }
        if let Err(e) = self.objectstore.create_output_bucket(&output_path).await {
            warn!(name = %built_spec.name, error = %e, "failed to create output bucket, continuing");
        }

        let filesystem = self.filesystem_factory.client_for(&built_spec);
        let mut filesystem_binding = None;
        if let Some(fs) = &filesystem {
            if fs.check_connection().await {
                fs.create_input_folder().await;
                fs.create_output_folder().await;
                fs.deploy_onetrigger().await;
                filesystem_binding = filesystem_storage_binding(&built_spec, fs.output_bucket_name());
            } else {
                warn!(name = %built_spec.name, "filesystem binding configured but unreachable, skipping folder provisioning");
            }
        }

        self.faas.create_function(&built_spec).await?;

        let mut registry = self.registry.lock().await;
        registry.insert(
            built_spec.name.clone(),
            Registration {
                spec: built_spec,
                object_store: object_store_binding,
                filesystem: filesystem_binding,
            },
        );
        info!("function initialized");
        Ok(())
    }

    /// Tears down a function: deletes its storage (if `spec.delete_buckets`),
    /// then its filesystem notifier/folders, then deregisters it from the
    /// FaaS gateway — the order spec.md §4.6 enumerates, matching the
    /// grounding original's `controller.py::rm` (buckets first, event-gateway
    /// deregistration next, `openfaas.delete_function()` last and the only
    /// call whose response is returned). Bucket and filesystem teardown are
    /// best-effort: a failure there is logged and does not prevent the later
    /// steps from running, so a transient storage outage never blocks
    /// deregistration; only the final deregister call's outcome is surfaced
    /// to the caller.
    ///
    /// When `spec.env_vars` is empty (the caller only sent `{name,
    /// deleteBuckets}`), falls back to a previously tracked registration and
    /// then to `getFunctionEnvironmentVariables` (spec.md §4.6) so the
    /// filesystem-binding detection still has the keys it needs.
    #[instrument(skip(self, spec), fields(name = %spec.name))]
    pub async fn rm(&self, spec: FunctionSpec) -> Result<()> {
        let lock = self.lock_for(&spec.name).await;
        let _guard = lock.lock().await;

        let registration = {
            let mut registry = self.registry.lock().await;
            registry.remove(&spec.name)
        };

        let env_vars = if !spec.env_vars.is_empty() {
            spec.env_vars.clone()
        } else if let Some(reg) = &registration {
            reg.spec.env_vars.clone()
        } else {
            self.get_function_environment_variables(&spec.name)
                .await
                .unwrap_or_default()
        };
        let effective_spec = spec.merge_env(env_vars);

        if spec.delete_buckets {
            let input_path = effective_spec.default_input_path();
            let output_path = registration
                .as_ref()
                .map(|r| r.object_store.output_path().to_string())
                .or_else(|| find_output_path_override(&effective_spec.env_vars))
                .unwrap_or_else(|| effective_spec.default_output_path());
            if let Err(e) = self.objectstore.delete_input_bucket(&input_path).await {
                warn!(name = %spec.name, error = %e, "failed to delete input bucket, continuing");
            }
            if let Err(e) = self.objectstore.delete_output_bucket(&output_path).await {
                warn!(name = %spec.name, error = %e, "failed to delete output bucket, continuing");
            }
        }

        let filesystem = self.filesystem_factory.client_for(&effective_spec);
        if let Some(fs) = &filesystem {
            fs.delete_onetrigger_deploy().await;
            if spec.delete_buckets {
                fs.delete_input_folder().await;
                fs.delete_output_folder().await;
            }
        }

        self.faas.delete_function(&spec.name).await?;

        info!("function removed");
        Ok(())
    }

    #[instrument(skip(self, body), fields(%name, %asynch))]
    pub async fn invoke(&self, name: &str, body: Vec<u8>, asynch: bool) -> Result<Vec<u8>> {
        Ok(self.faas.invoke(name, body, asynch).await?)
    }

    /// Locally tracked functions (storage-binding bookkeeping, see
    /// [`Registration`]); not a substitute for `GET /functions`, which
    /// forwards the gateway's own listing (see [`Orchestrator::list_functions`]).
    pub async fn ls(&self) -> Vec<FunctionSpec> {
        self.registry
            .lock()
            .await
            .values()
            .map(|r| r.spec.clone())
            .collect()
    }

    /// Pass-through of the gateway's function listing, per spec.md §6
    /// `GET /functions`.
    #[instrument(skip(self))]
    pub async fn list_functions(&self) -> Result<(u16, Vec<u8>)> {
        Ok(self.faas.list_raw().await?)
    }

    /// Pass-through of the gateway's per-function metadata, per spec.md §6
    /// `GET /function/{name}`.
    #[instrument(skip(self))]
    pub async fn get_function(&self, name: &str) -> Result<(u16, Vec<u8>)> {
        Ok(self.faas.get_raw(name).await?)
    }

    #[instrument(skip(self))]
    pub async fn get_function_environment_variables(
        &self,
        name: &str,
    ) -> Result<HashMap<String, String>> {
        let env_vars = self.cluster.get_deployment_env(name, FUNCTIONS_NAMESPACE).await?;
        Ok(env_vars
            .into_iter()
            .filter_map(|e| e.value.map(|v| (e.name, v)))
            .collect())
    }

    /// Routes a storage-backend's object-created notification to the owning
    /// function's asynchronous invocation, forwarding `raw_body` (the
    /// original notification JSON) verbatim as the invocation payload per
    /// spec.md §4.6 `processEvent`. Logs and drops notifications whose
    /// bucket name doesn't resolve to a known function.
    #[instrument(skip(self, notification, raw_body))]
    pub async fn process_event(&self, notification: &oscar_common::BucketNotification, raw_body: Vec<u8>) {
        match event_router::route(notification) {
            Some(name) => {
                if let Err(e) = self.faas.invoke(&name, raw_body, true).await {
                    warn!(function = %name, error = %e, "failed to dispatch event to function");
                }
            }
            None => warn!("event notification has no owning function, dropping"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockall::mock;
    use mockall::predicate::eq;

    mock! {
        Builder {}
        #[async_trait]
        impl BuilderOps for Builder {
            async fn build_and_push(&self, spec: &FunctionSpec) -> std::result::Result<String, OscarError>;
            fn expected_image_tag(&self, name: &str) -> String;
        }
    }

    mock! {
        Store {}
        #[async_trait]
        impl ObjectStoreOps for Store {
            async fn create_input_bucket(&self, input_path: &str) -> std::result::Result<(), OscarError>;
            async fn create_output_bucket(&self, output_path: &str) -> std::result::Result<(), OscarError>;
            async fn delete_input_bucket(&self, input_path: &str) -> std::result::Result<(), OscarError>;
            async fn delete_output_bucket(&self, output_path: &str) -> std::result::Result<(), OscarError>;
        }
    }

    mock! {
        Faas {}
        #[async_trait]
        impl FaasOps for Faas {
            async fn create_function(&self, spec: &FunctionSpec) -> std::result::Result<(), OscarError>;
            async fn delete_function(&self, name: &str) -> std::result::Result<(), OscarError>;
            async fn invoke(&self, name: &str, body: Vec<u8>, asynch: bool) -> std::result::Result<Vec<u8>, OscarError>;
            async fn get_raw(&self, name: &str) -> std::result::Result<(u16, Vec<u8>), OscarError>;
            async fn exists_raw(&self, name: &str) -> std::result::Result<(u16, Vec<u8>), OscarError>;
            async fn list_raw(&self) -> std::result::Result<(u16, Vec<u8>), OscarError>;
        }
    }

    mock! {
        Cluster {}
        #[async_trait]
        impl ClusterOps for Cluster {
            async fn get_deployment_env(&self, name: &str, namespace: &str) -> std::result::Result<Vec<EnvVar>, OscarError>;
        }
    }

    struct NoFilesystem;
    impl FilesystemFactory for NoFilesystem {
        fn client_for(&self, _spec: &FunctionSpec) -> Option<Arc<dyn FilesystemOps>> {
            None
        }
    }

    mock! {
        Filesystem {}
        #[async_trait]
        impl FilesystemOps for Filesystem {
            async fn check_connection(&self) -> bool;
            async fn create_input_folder(&self);
            async fn create_output_folder(&self);
            async fn delete_input_folder(&self);
            async fn delete_output_folder(&self);
            async fn deploy_onetrigger(&self);
            async fn delete_onetrigger_deploy(&self);
            fn output_bucket_name(&self) -> String;
        }
    }

    struct OneFilesystem(Arc<dyn FilesystemOps>);
    impl FilesystemFactory for OneFilesystem {
        fn client_for(&self, _spec: &FunctionSpec) -> Option<Arc<dyn FilesystemOps>> {
            Some(self.0.clone())
        }
    }

    fn orchestrator(
        builder: MockBuilder,
        store: MockStore,
        faas: MockFaas,
        cluster: MockCluster,
    ) -> Orchestrator {
        Orchestrator::new(
            OrchestratorConfig::new(ObjectStoreAuth {
                endpoint: "minio.local:9000".to_string(),
                access_key: "test-user".to_string(),
                secret_key: "test-pass".to_string(),
            }),
            Arc::new(builder),
            Arc::new(store),
            Arc::new(faas),
            Arc::new(cluster),
            Arc::new(NoFilesystem),
        )
    }

    #[tokio::test]
    async fn init_builds_provisions_storage_and_registers_function() {
        let mut builder = MockBuilder::new();
        builder
            .expect_build_and_push()
            .withf(|spec| spec.name == "echo")
            .returning(|_| Ok("registry.local/echo".to_string()));

        let mut store = MockStore::new();
        store
            .expect_create_input_bucket()
            .with(eq("echo-in"))
            .returning(|_| Ok(()));
        store
            .expect_create_output_bucket()
            .with(eq("echo-out"))
            .returning(|_| Ok(()));

        let mut faas = MockFaas::new();
        faas.expect_create_function()
            .withf(|spec| spec.image == "registry.local/echo")
            .returning(|_| Ok(()));

        let cluster = MockCluster::new();
        let orchestrator = orchestrator(builder, store, faas, cluster);

        orchestrator
            .init(FunctionSpec::new("echo", "alpine:3"))
            .await
            .unwrap();

        let registered = orchestrator.ls().await;
        assert_eq!(registered.len(), 1);
        assert_eq!(registered[0].image, "registry.local/echo");
    }

    #[tokio::test]
    async fn init_provisions_filesystem_folders_when_check_connection_succeeds() {
        let mut builder = MockBuilder::new();
        builder.expect_build_and_push().returning(|_| Ok("registry.local/echo".to_string()));
        let mut store = MockStore::new();
        store.expect_create_input_bucket().returning(|_| Ok(()));
        store.expect_create_output_bucket().returning(|_| Ok(()));
        let mut faas = MockFaas::new();
        faas.expect_create_function().returning(|_| Ok(()));
        let cluster = MockCluster::new();

        let mut fs = MockFilesystem::new();
        fs.expect_check_connection().returning(|| true);
        fs.expect_create_input_folder().times(1).returning(|| ());
        fs.expect_create_output_folder().times(1).returning(|| ());
        fs.expect_deploy_onetrigger().times(1).returning(|| ());

        let orchestrator = Orchestrator::new(
            OrchestratorConfig::new(ObjectStoreAuth {
                endpoint: "minio.local:9000".to_string(),
                access_key: "test-user".to_string(),
                secret_key: "test-pass".to_string(),
            }),
            Arc::new(builder),
            Arc::new(store),
            Arc::new(faas),
            Arc::new(cluster),
            Arc::new(OneFilesystem(Arc::new(fs))),
        );

        orchestrator
            .init(FunctionSpec::new("echo", "alpine:3"))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn init_skips_filesystem_folders_when_check_connection_fails() {
        let mut builder = MockBuilder::new();
        builder.expect_build_and_push().returning(|_| Ok("registry.local/echo".to_string()));
        let mut store = MockStore::new();
        store.expect_create_input_bucket().returning(|_| Ok(()));
        store.expect_create_output_bucket().returning(|_| Ok(()));
        let mut faas = MockFaas::new();
        faas.expect_create_function().returning(|_| Ok(()));
        let cluster = MockCluster::new();

        let mut fs = MockFilesystem::new();
        fs.expect_check_connection().returning(|| false);
        fs.expect_create_input_folder().times(0);
        fs.expect_create_output_folder().times(0);
        fs.expect_deploy_onetrigger().times(0);

        let orchestrator = Orchestrator::new(
            OrchestratorConfig::new(ObjectStoreAuth {
                endpoint: "minio.local:9000".to_string(),
                access_key: "test-user".to_string(),
                secret_key: "test-pass".to_string(),
            }),
            Arc::new(builder),
            Arc::new(store),
            Arc::new(faas),
            Arc::new(cluster),
            Arc::new(OneFilesystem(Arc::new(fs))),
        );

        orchestrator
            .init(FunctionSpec::new("echo", "alpine:3"))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn rm_skips_bucket_deletion_when_delete_buckets_is_false() {
        let mut builder = MockBuilder::new();
        builder.expect_build_and_push().returning(|_| Ok("registry.local/echo".to_string()));
        let mut store = MockStore::new();
        store.expect_create_input_bucket().returning(|_| Ok(()));
        store.expect_create_output_bucket().returning(|_| Ok(()));
        store.expect_delete_input_bucket().times(0);
        store.expect_delete_output_bucket().times(0);
        let mut faas = MockFaas::new();
        faas.expect_create_function().returning(|_| Ok(()));
        faas.expect_delete_function().with(eq("echo")).returning(|_| Ok(()));
        let cluster = MockCluster::new();
        let orchestrator = orchestrator(builder, store, faas, cluster);

        let mut spec = FunctionSpec::new("echo", "alpine:3");
        spec.delete_buckets = false;
        orchestrator.init(spec.clone()).await.unwrap();
        orchestrator.rm(spec).await.unwrap();

        assert!(orchestrator.ls().await.is_empty());
    }

    #[tokio::test]
    async fn rm_deletes_buckets_when_delete_buckets_is_true() {
        let mut builder = MockBuilder::new();
        builder.expect_build_and_push().returning(|_| Ok("registry.local/echo".to_string()));
        let mut store = MockStore::new();
        store.expect_create_input_bucket().returning(|_| Ok(()));
        store.expect_create_output_bucket().returning(|_| Ok(()));
        store.expect_delete_input_bucket().with(eq("echo-in")).returning(|_| Ok(()));
        store.expect_delete_output_bucket().with(eq("echo-out")).returning(|_| Ok(()));
        let mut faas = MockFaas::new();
        faas.expect_create_function().returning(|_| Ok(()));
        faas.expect_delete_function().returning(|_| Ok(()));
        let cluster = MockCluster::new();
        let orchestrator = orchestrator(builder, store, faas, cluster);

        let mut spec = FunctionSpec::new("echo", "alpine:3");
        spec.delete_buckets = true;
        orchestrator.init(spec.clone()).await.unwrap();
        orchestrator.rm(spec).await.unwrap();
    }

    #[tokio::test]
    async fn rm_untracked_function_falls_back_to_live_deployment_env() {
        let mut faas = MockFaas::new();
        faas.expect_delete_function()
            .with(eq("ghost"))
            .returning(|_| Ok(()));
        let mut cluster = MockCluster::new();
        cluster
            .expect_get_deployment_env()
            .with(eq("ghost"), eq(FUNCTIONS_NAMESPACE))
            .returning(|_, _| Ok(Vec::new()));
        let orchestrator = orchestrator(MockBuilder::new(), MockStore::new(), faas, cluster);

        let mut spec = FunctionSpec::new("ghost", "alpine:3");
        spec.delete_buckets = false;
        orchestrator.rm(spec).await.unwrap();
    }

    #[tokio::test]
    async fn rm_untracked_function_honors_output_path_override_from_live_env() {
        let mut store = MockStore::new();
        store
            .expect_delete_input_bucket()
            .with(eq("ghost-in"))
            .returning(|_| Ok(()));
        store
            .expect_delete_output_bucket()
            .with(eq("shared-out"))
            .returning(|_| Ok(()));
        let mut faas = MockFaas::new();
        faas.expect_delete_function().with(eq("ghost")).returning(|_| Ok(()));
        let mut cluster = MockCluster::new();
        cluster
            .expect_get_deployment_env()
            .with(eq("ghost"), eq(FUNCTIONS_NAMESPACE))
            .returning(|_, _| {
                Ok(vec![EnvVar {
                    name: "STORAGE_PATH_OUTPUT_123456".to_string(),
                    value: Some("shared-out".to_string()),
                }])
            });
        let orchestrator = orchestrator(MockBuilder::new(), store, faas, cluster);

        let mut spec = FunctionSpec::new("ghost", "alpine:3");
        spec.delete_buckets = true;
        orchestrator.rm(spec).await.unwrap();
    }

    #[tokio::test]
    async fn process_event_invokes_owning_function_asynchronously() {
        let mut faas = MockFaas::new();
        let notification: oscar_common::BucketNotification = serde_json::from_value(serde_json::json!({
            "Records": [{ "s3": { "bucket": {"name": "echo-in"}, "object": {"key": "hello.txt"} } }]
        }))
        .unwrap();
        let raw_body = serde_json::to_vec(&notification).unwrap();
        let expected_body = raw_body.clone();
        faas.expect_invoke()
            .withf(move |name, body, asynch| name == "echo" && *body == expected_body && *asynch)
            .returning(|_, _, _| Ok(Vec::new()));
        let orchestrator = orchestrator(MockBuilder::new(), MockStore::new(), faas, MockCluster::new());

        orchestrator.process_event(&notification, raw_body).await;
    }

    #[tokio::test]
    async fn exists_reports_already_registered_from_sync_invocation_probe() {
        let mut faas = MockFaas::new();
        faas.expect_exists_raw()
            .with(eq("echo"))
            .returning(|_| Ok((200, b"pong".to_vec())));
        let orchestrator = orchestrator(MockBuilder::new(), MockStore::new(), faas, MockCluster::new());

        let outcome = orchestrator.exists("echo").await;
        assert_eq!(
            outcome,
            ExistsOutcome::AlreadyRegistered {
                status: 200,
                body: b"pong".to_vec()
            }
        );
    }

    #[tokio::test]
    async fn exists_reports_absent_when_sync_invocation_probe_is_not_200() {
        let mut faas = MockFaas::new();
        faas.expect_exists_raw()
            .with(eq("echo"))
            .returning(|_| Ok((404, Vec::new())));
        let orchestrator = orchestrator(MockBuilder::new(), MockStore::new(), faas, MockCluster::new());

        assert_eq!(orchestrator.exists("echo").await, ExistsOutcome::Absent);
    }

    #[tokio::test]
    async fn get_function_environment_variables_reads_from_deployment() {
        let mut cluster = MockCluster::new();
        cluster
            .expect_get_deployment_env()
            .with(eq("echo"), eq(FUNCTIONS_NAMESPACE))
            .returning(|_, _| {
                Ok(vec![EnvVar {
                    name: "FOO".to_string(),
                    value: Some("bar".to_string()),
                }])
            });
        let orchestrator = orchestrator(MockBuilder::new(), MockStore::new(), MockFaas::new(), cluster);

        let env = orchestrator.get_function_environment_variables("echo").await.unwrap();
        assert_eq!(env.get("FOO"), Some(&"bar".to_string()));
    }

    #[tokio::test]
    async fn init_still_registers_with_expected_tag_when_build_fails() {
        let mut builder = MockBuilder::new();
        builder
            .expect_build_and_push()
            .returning(|_| Err(OscarError::Other("kaniko job failed".to_string())));
        builder
            .expect_expected_image_tag()
            .with(eq("echo"))
            .returning(|_| "registry.local/echo".to_string());

        let mut store = MockStore::new();
        store.expect_create_input_bucket().returning(|_| Ok(()));
        store.expect_create_output_bucket().returning(|_| Ok(()));

        let mut faas = MockFaas::new();
        faas.expect_create_function()
            .withf(|spec| spec.image == "registry.local/echo")
            .returning(|_| Ok(()));

        let orchestrator = orchestrator(builder, store, faas, MockCluster::new());

        orchestrator
            .init(FunctionSpec::new("echo", "alpine:3"))
            .await
            .unwrap();

        let registered = orchestrator.ls().await;
        assert_eq!(registered.len(), 1);
        assert_eq!(registered[0].image, "registry.local/echo");
    }

    #[tokio::test]
    async fn init_still_registers_when_bucket_provisioning_fails() {
        let mut builder = MockBuilder::new();
        builder.expect_build_and_push().returning(|_| Ok("registry.local/echo".to_string()));

        let mut store = MockStore::new();
        store
            .expect_create_input_bucket()
            .returning(|_| Err(OscarError::Other("bucket create failed".to_string())));
        store
            .expect_create_output_bucket()
            .returning(|_| Err(OscarError::Other("bucket create failed".to_string())));

        let mut faas = MockFaas::new();
        faas.expect_create_function().times(1).returning(|_| Ok(()));

        let orchestrator = orchestrator(builder, store, faas, MockCluster::new());

        orchestrator
            .init(FunctionSpec::new("echo", "alpine:3"))
            .await
            .unwrap();

        assert_eq!(orchestrator.ls().await.len(), 1);
    }

    #[tokio::test]
    async fn rm_tears_down_buckets_and_filesystem_even_when_deregister_fails() {
        let mut builder = MockBuilder::new();
        builder.expect_build_and_push().returning(|_| Ok("registry.local/echo".to_string()));
        let mut store = MockStore::new();
        store.expect_create_input_bucket().returning(|_| Ok(()));
        store.expect_create_output_bucket().returning(|_| Ok(()));
        store
            .expect_delete_input_bucket()
            .with(eq("echo-in"))
            .times(1)
            .returning(|_| Ok(()));
        store
            .expect_delete_output_bucket()
            .with(eq("echo-out"))
            .times(1)
            .returning(|_| Ok(()));
        let mut faas = MockFaas::new();
        faas.expect_create_function().returning(|_| Ok(()));
        faas.expect_delete_function()
            .with(eq("echo"))
            .times(1)
            .returning(|_| Err(OscarError::Upstream { status: 500, body: "boom".to_string() }));
        let orchestrator = orchestrator(builder, store, faas, MockCluster::new());

        let mut spec = FunctionSpec::new("echo", "alpine:3");
        spec.delete_buckets = true;
        orchestrator.init(spec.clone()).await.unwrap();

        let err = orchestrator.rm(spec).await.unwrap_err();
        match err {
            Error::Common(OscarError::Upstream { status, .. }) => assert_eq!(status, 500),
            other => panic!("expected Upstream error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn rm_runs_filesystem_teardown_before_deregistering() {
        let mut faas = MockFaas::new();
        faas.expect_delete_function()
            .with(eq("echo"))
            .times(1)
            .returning(|_| Ok(()));
        let cluster = MockCluster::new();

        let mut fs = MockFilesystem::new();
        fs.expect_delete_onetrigger_deploy().times(1).returning(|| ());
        fs.expect_delete_input_folder().times(0);
        fs.expect_delete_output_folder().times(0);

        let orchestrator = Orchestrator::new(
            OrchestratorConfig::new(ObjectStoreAuth {
                endpoint: "minio.local:9000".to_string(),
                access_key: "test-user".to_string(),
                secret_key: "test-pass".to_string(),
            }),
            Arc::new(MockBuilder::new()),
            Arc::new(MockStore::new()),
            Arc::new(faas),
            Arc::new(cluster),
            Arc::new(OneFilesystem(Arc::new(fs))),
        );

        let mut spec = FunctionSpec::new("echo", "alpine:3");
        spec.delete_buckets = false;
        orchestrator.rm(spec).await.unwrap();
    }
}
