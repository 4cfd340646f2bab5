//! Shared data model and error type for the OSCAR on-premises FaaS control plane.
//!
//! A [`FunctionSpec`] is the caller-provided definition of a function; everything
//! downstream of it (build, storage, notifier, registration) is derived from its
//! fields and the ambient cluster environment, never mutated back onto the caller's
//! original value — components that need to add keys build a new spec instead.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Caller-provided function definition. Immutable once `init` begins: every
/// collaborator that needs to add environment variables or labels does so by
/// returning a derived copy (see [`FunctionSpec::merge_env`] /
/// [`FunctionSpec::merge_labels`]) rather than mutating this value in place.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionSpec {
    /// DNS-label name; primary key of all downstream resources.
    pub name: String,
    /// Base container image reference.
    pub image: String,
    /// Base64-encoded shell script, decoded into the build context.
    #[serde(default)]
    pub script: Option<String>,
    #[serde(default)]
    pub env_vars: HashMap<String, String>,
    #[serde(default)]
    pub labels: HashMap<String, String>,
    #[serde(default)]
    pub annotations: HashMap<String, String>,
    #[serde(default)]
    pub delete_buckets: bool,
}

impl FunctionSpec {
    /// Minimal constructor for a function with no script, env vars, labels,
    /// or annotations yet attached.
    pub fn new(name: impl Into<String>, image: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            image: image.into(),
            script: None,
            env_vars: HashMap::new(),
            labels: HashMap::new(),
            annotations: HashMap::new(),
            delete_buckets: false,
        }
    }

    /// Returns a copy with `vars` merged into `env_vars`, overwriting on key
    /// collision. Used by every collaborator that needs to hand the caller's
    /// spec back downstream carrying additional keys.
    pub fn merge_env(&self, vars: impl IntoIterator<Item = (String, String)>) -> Self {
        let mut out = self.clone();
        out.env_vars.extend(vars);
        out
    }

    pub fn merge_labels(&self, labels: impl IntoIterator<Item = (String, String)>) -> Self {
        let mut out = self.clone();
        out.labels.extend(labels);
        out
    }

    pub fn with_annotation(&self, key: impl Into<String>, value: impl Into<String>) -> Self {
        let mut out = self.clone();
        out.annotations.insert(key.into(), value.into());
        out
    }

    pub fn with_image(&self, image: impl Into<String>) -> Self {
        let mut out = self.clone();
        out.image = image.into();
        out
    }

    /// Default input bucket/folder name: `<name>-in`.
    pub fn default_input_path(&self) -> String {
        format!("{}-in", self.name)
    }

    /// Default output bucket/folder name, unless overridden downstream by a
    /// `STORAGE_PATH_OUTPUT_<providerId>` env var.
    pub fn default_output_path(&self) -> String {
        format!("{}-out", self.name)
    }
}

/// One storage backend attached to a function. The object-store binding is
/// mandatory (exactly one per function); the filesystem binding is optional
/// (at most one). Both variants are namespaced by a stable `provider_id` so
/// their env-var keys never collide.
#[derive(Debug, Clone, PartialEq)]
pub enum StorageBinding {
    ObjectStore {
        provider_id: String,
        input_path: String,
        output_path: String,
    },
    Filesystem {
        provider_id: String,
        oneprovider_host: String,
        access_token: String,
        space: String,
        input_path: String,
        output_path: String,
    },
}

impl StorageBinding {
    pub fn provider_id(&self) -> &str {
        match self {
            StorageBinding::ObjectStore { provider_id, .. } => provider_id,
            StorageBinding::Filesystem { provider_id, .. } => provider_id,
        }
    }

    pub fn input_path(&self) -> &str {
        match self {
            StorageBinding::ObjectStore { input_path, .. } => input_path,
            StorageBinding::Filesystem { input_path, .. } => input_path,
        }
    }

    pub fn output_path(&self) -> &str {
        match self {
            StorageBinding::ObjectStore { output_path, .. } => output_path,
            StorageBinding::Filesystem { output_path, .. } => output_path,
        }
    }
}

/// Crate-wide error type. Client crates convert their own thiserror enums into
/// this one at the boundary they return to the orchestrator, so the orchestrator
/// can log a uniform line regardless of which collaborator failed.
#[derive(Error, Debug)]
pub enum OscarError {
    #[error("upstream rejected request: status {status}, body: {body}")]
    Upstream { status: u16, body: String },

    #[error("transport failure talking to {target}: {source}")]
    Transport {
        target: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("required configuration missing: {0}")]
    ConfigMissing(String),

    #[error("invalid function spec: {0}")]
    InvalidSpec(String),

    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, OscarError>;

/// Status-code acceptance policy shared by every cluster-facing client, per
/// spec.md §4.1: creates accept {200,201,202}, deletes accept {200,202},
/// gets accept 200.
pub fn is_create_status_ok(status: u16) -> bool {
    matches!(status, 200 | 201 | 202)
}

pub fn is_delete_status_ok(status: u16) -> bool {
    matches!(status, 200 | 202)
}

pub fn is_get_status_ok(status: u16) -> bool {
    status == 200
}

/// Extracts the provider id from an env-var key of the form
/// `STORAGE_AUTH_<KIND>_<PID>_<FIELD>`. The provider id is the concatenation
/// (with `_`) of every segment strictly between position 3 and the final
/// segment, so `STORAGE_AUTH_MINIO_123_456_USER` yields `123_456`.
///
/// Returns `None` if `key` doesn't have at least 5 underscore-separated
/// segments (prefix + kind + at least one provider-id segment + field).
pub fn parse_provider_id(key: &str) -> Option<String> {
    let segments: Vec<&str> = key.split('_').collect();
    if segments.len() < 5 || segments[0] != "STORAGE" || segments[1] != "AUTH" {
        return None;
    }
    let pid_segments = &segments[3..segments.len() - 1];
    if pid_segments.is_empty() {
        return None;
    }
    Some(pid_segments.join("_"))
}

/// Recovers the function name from a bucket-notification's bucket name by
/// stripping the trailing `-in` suffix (three characters), per spec.md §4.6
/// `processEvent`.
pub fn function_name_from_input_bucket(bucket_name: &str) -> Option<String> {
    bucket_name.strip_suffix("-in").map(str::to_owned)
}

/// Shape of the S3-compatible object-creation notification delivered to
/// `POST /events` (spec.md §6).
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BucketNotification {
    #[serde(rename = "Records")]
    pub records: Vec<BucketNotificationRecord>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BucketNotificationRecord {
    pub s3: S3Event,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct S3Event {
    pub bucket: S3Bucket,
    pub object: S3Object,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct S3Bucket {
    pub name: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct S3Object {
    pub key: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn merge_env_overwrites_on_collision_and_preserves_others() {
        let spec = FunctionSpec {
            name: "echo".into(),
            image: "alpine:3".into(),
            script: None,
            env_vars: HashMap::from([("FOO".to_string(), "bar".to_string())]),
            labels: HashMap::new(),
            annotations: HashMap::new(),
            delete_buckets: false,
        };
        let derived = spec.merge_env([("FOO".to_string(), "baz".to_string())]);
        assert_eq!(derived.env_vars.get("FOO"), Some(&"baz".to_string()));
        // original untouched
        assert_eq!(spec.env_vars.get("FOO"), Some(&"bar".to_string()));
    }

    #[test]
    fn default_paths_follow_name_in_out_convention() {
        let spec = FunctionSpec {
            name: "echo".into(),
            image: "alpine:3".into(),
            script: None,
            env_vars: HashMap::new(),
            labels: HashMap::new(),
            annotations: HashMap::new(),
            delete_buckets: false,
        };
        assert_eq!(spec.default_input_path(), "echo-in");
        assert_eq!(spec.default_output_path(), "echo-out");
    }

    #[test]
    fn provider_id_extraction_handles_segmented_ids() {
        assert_eq!(
            parse_provider_id("STORAGE_AUTH_MINIO_123_456_USER"),
            Some("123_456".to_string())
        );
        assert_eq!(
            parse_provider_id("STORAGE_AUTH_ONEDATA_aa_bb_HOST"),
            Some("aa_bb".to_string())
        );
        assert_eq!(
            parse_provider_id("STORAGE_AUTH_ONEDATA_abc-def_TOKEN"),
            Some("abc-def".to_string())
        );
        assert_eq!(parse_provider_id("STORAGE_PATH_INPUT_123"), None);
        assert_eq!(parse_provider_id("UNRELATED_KEY"), None);
    }

    #[test]
    fn function_name_recovered_from_input_bucket() {
        assert_eq!(
            function_name_from_input_bucket("echo-in"),
            Some("echo".to_string())
        );
        assert_eq!(function_name_from_input_bucket("noinsuffix"), None);
    }

    #[test]
    fn bucket_notification_deserializes_from_wire_shape() {
        let json = serde_json::json!({
            "Records": [
                { "s3": { "bucket": {"name": "echo-in"}, "object": {"key": "hello.txt"} } }
            ]
        });
        let parsed: BucketNotification = serde_json::from_value(json).unwrap();
        assert_eq!(parsed.records[0].s3.bucket.name, "echo-in");
        assert_eq!(parsed.records[0].s3.object.key, "hello.txt");
    }
}
