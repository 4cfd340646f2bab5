//! S3-compatible (MinIO) object-store client: bucket provisioning plus
//! object-creation notifications wired back to the controller's webhook.
//!
//! All operations are idempotent; pre-existing state (bucket already owned,
//! no notification configured) is logged at info and treated as success,
//! per spec.md §4.3/§7.

use aws_sdk_s3::types::{Event, NotificationConfiguration, QueueConfiguration};
use oscar_common::OscarError;
use thiserror::Error;
use tracing::{error, info, warn};

/// MinIO's (non-standard) ARN for its webhook notification target, matching
/// the original controller's hardcoded `arn:minio:sqs::1:webhook`.
pub const WEBHOOK_ARN: &str = "arn:minio:sqs::1:webhook";

#[derive(Error, Debug)]
pub enum ObjectStoreError {
    #[error(transparent)]
    Common(#[from] OscarError),
}

pub type Result<T> = std::result::Result<T, ObjectStoreError>;

#[derive(Debug, Clone)]
pub struct ObjectStoreConfig {
    pub endpoint: String,
    pub access_key: String,
    pub secret_key: String,
}

impl ObjectStoreConfig {
    pub fn from_env() -> std::result::Result<Self, OscarError> {
        let endpoint = std::env::var("MINIO_ENDPOINT")
            .map_err(|_| OscarError::ConfigMissing("MINIO_ENDPOINT".to_string()))?;
        let access_key = std::env::var("MINIO_USER")
            .map_err(|_| OscarError::ConfigMissing("MINIO_USER".to_string()))?;
        let secret_key = std::env::var("MINIO_PASS")
            .map_err(|_| OscarError::ConfigMissing("MINIO_PASS".to_string()))?;
        Ok(Self {
            endpoint,
            access_key,
            secret_key,
        })
    }
}

pub struct ObjectStoreClient {
    client: aws_sdk_s3::Client,
}

impl ObjectStoreClient {
    pub async fn new(config: ObjectStoreConfig) -> Self {
        let creds = aws_sdk_s3::config::Credentials::new(
            config.access_key,
            config.secret_key,
            None,
            None,
            "oscar-objectstore-client",
        );
        let endpoint = if config.endpoint.starts_with("http") {
            config.endpoint
        } else {
            format!("http://{}", config.endpoint)
        };
        let s3_config = aws_sdk_s3::Config::builder()
            .endpoint_url(endpoint)
            .credentials_provider(creds)
            .region(aws_sdk_s3::config::Region::new("us-east-1"))
            .force_path_style(true)
            .behavior_version(aws_sdk_s3::config::BehaviorVersion::latest())
            .build();
        Self {
            client: aws_sdk_s3::Client::from_conf(s3_config),
        }
    }

    /// Test-only constructor pointed at an arbitrary S3-compatible endpoint
    /// (e.g. a local test double), bypassing env discovery.
    pub async fn with_client(client: aws_sdk_s3::Client) -> Self {
        Self { client }
    }

    async fn create_bucket(&self, name: &str) -> Result<()> {
        match self.client.create_bucket().bucket(name).send().await {
            Ok(_) => {
                info!(bucket = %name, "bucket created");
                Ok(())
            }
            Err(e) => {
                let svc = e.as_service_error();
                if svc.map(|e| e.is_bucket_already_owned_by_you()).unwrap_or(false)
                    || svc.map(|e| e.is_bucket_already_exists()).unwrap_or(false)
                {
                    info!(bucket = %name, "bucket already exists, treating as success");
                    Ok(())
                } else {
                    error!(bucket = %name, error = %e, "error creating bucket");
                    Err(ObjectStoreError::Common(OscarError::Other(e.to_string())))
                }
            }
        }
    }

    async fn set_notification(&self, name: &str) -> Result<()> {
        let queue_config = QueueConfiguration::builder()
            .id(format!("{name}-created"))
            .queue_arn(WEBHOOK_ARN)
            .events(Event::from("s3:ObjectCreated:*"))
            .build()
            .map_err(|e| ObjectStoreError::Common(OscarError::Other(e.to_string())))?;
        let notification = NotificationConfiguration::builder()
            .queue_configurations(queue_config)
            .build();
        self.client
            .put_bucket_notification_configuration()
            .bucket(name)
            .notification_configuration(notification)
            .send()
            .await
            .map_err(|e| {
                error!(bucket = %name, error = %e, "error setting bucket notification");
                ObjectStoreError::Common(OscarError::Other(e.to_string()))
            })?;
        info!(bucket = %name, "notification configured");
        Ok(())
    }

    async fn clear_notification(&self, name: &str) -> Result<()> {
        let empty = NotificationConfiguration::builder().build();
        if let Err(e) = self
            .client
            .put_bucket_notification_configuration()
            .bucket(name)
            .notification_configuration(empty)
            .send()
            .await
        {
            warn!(bucket = %name, error = %e, "failed to clear bucket notification, continuing");
        }
        Ok(())
    }

    async fn delete_all_objects(&self, name: &str) -> Result<()> {
        let mut continuation_token = None;
        loop {
            let mut req = self.client.list_objects_v2().bucket(name);
            if let Some(token) = continuation_token.take() {
                req = req.continuation_token(token);
            }
            let resp = match req.send().await {
                Ok(resp) => resp,
                Err(e) => {
                    warn!(bucket = %name, error = %e, "failed to list objects, continuing");
                    return Ok(());
                }
            };
            for object in resp.contents() {
                if let Some(key) = object.key() {
                    if let Err(e) = self
                        .client
                        .delete_object()
                        .bucket(name)
                        .key(key)
                        .send()
                        .await
                    {
                        warn!(bucket = %name, %key, error = %e, "failed to delete object, continuing");
                    }
                }
            }
            if resp.is_truncated().unwrap_or(false) {
                continuation_token = resp.next_continuation_token().map(str::to_string);
            } else {
                break;
            }
        }
        Ok(())
    }

    async fn delete_bucket(&self, name: &str) -> Result<()> {
        match self.client.delete_bucket().bucket(name).send().await {
            Ok(_) => {
                info!(bucket = %name, "bucket deleted");
                Ok(())
            }
            Err(e) => {
                let is_no_such_bucket = e
                    .as_service_error()
                    .map(|e| e.is_no_such_bucket())
                    .unwrap_or(false);
                if is_no_such_bucket {
                    info!(bucket = %name, "bucket already absent, treating as success");
                    Ok(())
                } else {
                    warn!(bucket = %name, error = %e, "failed to delete bucket, continuing");
                    Ok(())
                }
            }
        }
    }

    /// Creates `<name>-in` if absent and attaches an `s3:ObjectCreated:*`
    /// notification targeting the controller's webhook ARN.
    pub async fn create_input_bucket(&self, input_path: &str) -> Result<()> {
        self.create_bucket(input_path).await?;
        self.set_notification(input_path).await
    }

    /// Creates `<name>-out` (or the caller's overridden output path) if
    /// absent. No notification is attached to the output bucket.
    pub async fn create_output_bucket(&self, output_path: &str) -> Result<()> {
        self.create_bucket(output_path).await
    }

    /// Clears notifications, then removes all objects, then removes the
    /// bucket itself.
    pub async fn delete_input_bucket(&self, input_path: &str) -> Result<()> {
        self.clear_notification(input_path).await?;
        self.delete_all_objects(input_path).await?;
        self.delete_bucket(input_path).await
    }

    /// Removes all objects, then removes the bucket.
    pub async fn delete_output_bucket(&self, output_path: &str) -> Result<()> {
        self.delete_all_objects(output_path).await?;
        self.delete_bucket(output_path).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn webhook_arn_matches_minio_sqs_convention() {
        assert_eq!(WEBHOOK_ARN, "arn:minio:sqs::1:webhook");
    }
}
