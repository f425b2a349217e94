use anyhow::{anyhow, Result};
use aws_config::BehaviorVersion;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::Client;
use log::{debug, error, info};

use crate::storage::remote::{ListPage, RemoteObjectMeta, RemoteStore};

/// S3-compatible remote tier. Every key is stored under `prefix`.
pub struct S3Remote {
    client: Client,
    bucket: String,
    prefix: String,
}

impl S3Remote {
    /// Build a client from the ambient AWS configuration (env, profile, IMDS)
    pub async fn new(bucket: String, prefix: String) -> Result<Self> {
        let config = aws_config::defaults(BehaviorVersion::latest()).load().await;
        let client = Client::new(&config);
        info!("S3 remote tier configured for bucket {} (prefix '{}')", bucket, prefix);

        Ok(Self {
            client,
            bucket,
            prefix: prefix.trim_matches('/').to_string(),
        })
    }

    fn full_key(&self, key: &str) -> String {
        if self.prefix.is_empty() {
            key.to_string()
        } else {
            format!("{}/{}", self.prefix, key)
        }
    }

    fn relative_key<'a>(&self, full: &'a str) -> &'a str {
        if self.prefix.is_empty() {
            full
        } else {
            full.strip_prefix(&self.prefix)
                .map(|rest| rest.trim_start_matches('/'))
                .unwrap_or(full)
        }
    }
}

fn to_timestamp(value: Option<&aws_sdk_s3::primitives::DateTime>) -> Option<crate::model::Timestamp> {
    value.and_then(|dt| chrono::DateTime::from_timestamp(dt.secs(), dt.subsec_nanos()))
}

#[async_trait::async_trait]
impl RemoteStore for S3Remote {
    async fn head(&self, key: &str) -> Result<Option<RemoteObjectMeta>> {
        match self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(self.full_key(key))
            .send()
            .await
        {
            Ok(output) => Ok(Some(RemoteObjectMeta {
                key: key.to_string(),
                size: output.content_length().unwrap_or(0).max(0) as u64,
                content_type: output.content_type().map(str::to_string),
                last_modified: to_timestamp(output.last_modified()),
            })),
            Err(e) => {
                let service_error = e.into_service_error();
                if service_error.is_not_found() {
                    Ok(None)
                } else {
                    Err(anyhow!("Failed to stat S3 object {}: {}", key, service_error))
                }
            }
        }
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        debug!("Reading from S3 bucket {} with key: {}", self.bucket, key);

        let output = match self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(self.full_key(key))
            .send()
            .await
        {
            Ok(output) => output,
            Err(e) => {
                let service_error = e.into_service_error();
                if service_error.is_no_such_key() {
                    return Ok(None);
                }
                return Err(anyhow!("Failed to read S3 object {}: {}", key, service_error));
            }
        };

        let body = output
            .body
            .collect()
            .await
            .map_err(|e| anyhow!("Failed to collect body: {}", e))?;
        Ok(Some(body.to_vec()))
    }

    async fn put(&self, key: &str, bytes: Vec<u8>, content_type: Option<&str>) -> Result<()> {
        let size = bytes.len();
        let mut request = self
            .client
            .put_object()
            .bucket(&self.bucket)
            .key(self.full_key(key))
            .body(ByteStream::from(bytes));
        if let Some(content_type) = content_type {
            request = request.content_type(content_type);
        }

        request.send().await.map_err(|e| {
            error!("S3 PUT failed - Bucket: {}, Key: {}, Error: {:?}", self.bucket, key, e);
            anyhow!("Failed to write S3 object {}: {}", key, e)
        })?;

        debug!("Wrote {} bytes to S3 key {}", size, key);
        Ok(())
    }

    async fn copy(&self, src: &str, dst: &str) -> Result<()> {
        self.client
            .copy_object()
            .bucket(&self.bucket)
            .copy_source(format!("{}/{}", self.bucket, self.full_key(src)))
            .key(self.full_key(dst))
            .send()
            .await
            .map_err(|e| anyhow!("Failed to copy S3 object {} -> {}: {}", src, dst, e))?;
        Ok(())
    }

    async fn list_page(&self, prefix: &str, token: Option<String>, limit: usize) -> Result<ListPage> {
        let output = self
            .client
            .list_objects_v2()
            .bucket(&self.bucket)
            .prefix(self.full_key(prefix))
            .set_continuation_token(token)
            .max_keys(limit.clamp(1, 1000) as i32)
            .send()
            .await
            .map_err(|e| anyhow!("Failed to list S3 prefix {}: {}", prefix, e))?;

        let objects = output
            .contents()
            .iter()
            .filter_map(|object| {
                let key = object.key()?;
                Some(RemoteObjectMeta {
                    key: self.relative_key(key).to_string(),
                    size: object.size().unwrap_or(0).max(0) as u64,
                    content_type: None,
                    last_modified: to_timestamp(object.last_modified()),
                })
            })
            .collect();

        Ok(ListPage {
            objects,
            next_token: output.next_continuation_token().map(str::to_string),
        })
    }

    async fn delete_prefix(&self, prefix: &str) -> Result<usize> {
        let mut removed = 0;
        let mut token = None;

        loop {
            let page = self.list_page(prefix, token, 1000).await?;
            for object in &page.objects {
                self.client
                    .delete_object()
                    .bucket(&self.bucket)
                    .key(self.full_key(&object.key))
                    .send()
                    .await
                    .map_err(|e| anyhow!("Failed to delete S3 object {}: {}", object.key, e))?;
                removed += 1;
            }
            match page.next_token {
                Some(next) => token = Some(next),
                None => break,
            }
        }

        debug!("Deleted {} S3 objects under {}", removed, prefix);
        Ok(removed)
    }
}
