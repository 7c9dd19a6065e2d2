use crate::config::Config;
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use aws_config::timeout::TimeoutConfig;
use aws_sdk_s3::config::Region;
use aws_sdk_s3::error::DisplayErrorContext;
use aws_sdk_s3::Client;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectSummary {
    pub key: String,
    pub size: u64,
}

/// The upload bucket clients drop their envelopes into.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn list(&self) -> Result<Vec<ObjectSummary>>;
    async fn get(&self, key: &str) -> Result<Vec<u8>>;
    async fn delete(&self, key: &str) -> Result<()>;
}

pub struct S3ObjectStore {
    client: Client,
    bucket: String,
}

impl S3ObjectStore {
    pub fn new(client: Client, bucket: impl Into<String>) -> Self {
        S3ObjectStore {
            client,
            bucket: bucket.into(),
        }
    }

    /// Credentials come from the usual AWS provider chain.
    pub async fn from_config(config: &Config) -> Self {
        log::debug!(
            "Initializing S3 client for bucket {} in {}",
            config.s3_bucket_name,
            config.aws_region
        );
        let sdk_config = aws_config::defaults(aws_config::BehaviorVersion::latest())
            .region(Region::new(config.aws_region.clone()))
            .timeout_config(timeouts(config.http_timeout()))
            .load()
            .await;
        Self::new(Client::new(&sdk_config), config.s3_bucket_name.clone())
    }
}

/// Every S3 call, retries included, is bounded by `timeout`.
fn timeouts(timeout: Duration) -> TimeoutConfig {
    TimeoutConfig::builder()
        .connect_timeout(timeout)
        .operation_attempt_timeout(timeout)
        .operation_timeout(timeout)
        .build()
}

#[async_trait]
impl ObjectStore for S3ObjectStore {
    async fn list(&self) -> Result<Vec<ObjectSummary>> {
        let mut pages = self
            .client
            .list_objects_v2()
            .bucket(&self.bucket)
            .into_paginator()
            .send();

        let mut objects = Vec::new();
        while let Some(page) = pages.next().await {
            let page = page.map_err(|e| {
                anyhow!(
                    "failed to list bucket {}: {}",
                    self.bucket,
                    DisplayErrorContext(&e)
                )
            })?;
            for object in page.contents() {
                let Some(key) = object.key() else { continue };
                objects.push(ObjectSummary {
                    key: key.to_string(),
                    size: object.size().unwrap_or(0).max(0) as u64,
                });
            }
        }
        Ok(objects)
    }

    async fn get(&self, key: &str) -> Result<Vec<u8>> {
        let output = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| anyhow!("failed to get object {key}: {}", DisplayErrorContext(&e)))?;
        let body = output
            .body
            .collect()
            .await
            .map_err(|e| anyhow!("failed to read object {key}: {e}"))?;
        Ok(body.into_bytes().to_vec())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| {
                anyhow!("failed to delete object {key}: {}", DisplayErrorContext(&e))
            })?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_s3_calls_are_bounded() {
        let config = Config::example();
        let timeouts = timeouts(config.http_timeout());
        assert_eq!(timeouts.connect_timeout(), Some(Duration::from_secs(10)));
        assert_eq!(timeouts.operation_timeout(), Some(Duration::from_secs(10)));
        assert_eq!(
            timeouts.operation_attempt_timeout(),
            Some(Duration::from_secs(10))
        );
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use std::collections::BTreeMap;
    use std::sync::{Arc, Mutex};

    #[derive(Debug, Clone, Default)]
    pub struct MemoryBucket {
        objects: Arc<Mutex<BTreeMap<String, Vec<u8>>>>,
    }

    impl MemoryBucket {
        pub fn put(&self, key: &str, data: impl Into<Vec<u8>>) {
            self.objects
                .lock()
                .unwrap()
                .insert(key.to_string(), data.into());
        }

        pub fn keys(&self) -> Vec<String> {
            self.objects.lock().unwrap().keys().cloned().collect()
        }
    }

    #[async_trait]
    impl ObjectStore for MemoryBucket {
        async fn list(&self) -> Result<Vec<ObjectSummary>> {
            Ok(self
                .objects
                .lock()
                .unwrap()
                .iter()
                .map(|(key, data)| ObjectSummary {
                    key: key.clone(),
                    size: data.len() as u64,
                })
                .collect())
        }

        async fn get(&self, key: &str) -> Result<Vec<u8>> {
            self.objects
                .lock()
                .unwrap()
                .get(key)
                .cloned()
                .ok_or_else(|| anyhow!("no such key {key}"))
        }

        async fn delete(&self, key: &str) -> Result<()> {
            self.objects.lock().unwrap().remove(key);
            Ok(())
        }
    }
}
