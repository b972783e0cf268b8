use crate::config::{Config, R2Config};
use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_s3::Client;
use aws_sdk_s3::config::{RequestChecksumCalculation, ResponseChecksumValidation};
use aws_sdk_s3::error::ProvideErrorMetadata;
use aws_smithy_types::byte_stream::ByteStream;
use std::fmt::{Debug, Display};
use std::sync::Arc;
use tracing::info;
use whiteboard_sync::{BlobObject, BlobStore, InMemoryBlobStore};

/// Room storage backed by an R2 (S3-compatible) bucket.
///
/// Every key is stored under the configured prefix; `list` strips it again so
/// callers only ever see the logical key layout.
#[derive(Clone)]
pub struct R2BlobStore {
    client: Client,
    bucket: String,
    prefix: String,
}

impl R2BlobStore {
    pub async fn new(config: &R2Config) -> Result<Self, String> {
        let endpoint = config
            .endpoint
            .clone()
            .unwrap_or_else(|| format!("https://{}.r2.cloudflarestorage.com", config.account_id));

        let sdk_config = aws_config::defaults(BehaviorVersion::latest())
            .region(aws_sdk_s3::config::Region::new("auto"))
            .credentials_provider(aws_sdk_s3::config::Credentials::new(
                &config.access_key_id,
                &config.secret_access_key,
                None,
                None,
                "whiteboard-r2",
            ))
            .endpoint_url(endpoint)
            .load()
            .await;

        let s3_config = aws_sdk_s3::config::Builder::from(&sdk_config)
            .force_path_style(true)
            // R2 can reject optional checksum behavior used by newer S3 SDK defaults.
            .request_checksum_calculation(RequestChecksumCalculation::WhenRequired)
            .response_checksum_validation(ResponseChecksumValidation::WhenRequired)
            .build();

        Ok(Self {
            client: Client::from_conf(s3_config),
            bucket: config.bucket.clone(),
            prefix: config.prefix.trim_matches('/').to_string(),
        })
    }

    fn object_key(&self, key: &str) -> String {
        object_key(&self.prefix, key)
    }

    fn logical_key<'a>(&self, object_key: &'a str) -> &'a str {
        logical_key(&self.prefix, object_key)
    }

    fn describe<E>(&self, op: &str, key: &str, e: &E) -> String
    where
        E: ProvideErrorMetadata + Debug,
    {
        let code = e.code().unwrap_or("unknown");
        let message = e.message().unwrap_or("unknown");
        format!(
            "R2 {} failed for bucket={} key={}: code={} message={} raw={:?}",
            op, self.bucket, key, code, message, e
        )
    }
}

fn object_key(prefix: &str, key: &str) -> String {
    if prefix.is_empty() {
        key.to_string()
    } else {
        format!("{}/{}", prefix, key)
    }
}

fn logical_key<'a>(prefix: &str, object_key: &'a str) -> &'a str {
    if prefix.is_empty() {
        return object_key;
    }
    object_key
        .strip_prefix(prefix)
        .and_then(|rest| rest.strip_prefix('/'))
        .unwrap_or(object_key)
}

fn is_not_found<E>(e: &E) -> bool
where
    E: ProvideErrorMetadata + Display,
{
    if matches!(e.code(), Some("NoSuchKey") | Some("NotFound")) {
        return true;
    }
    let msg = e.to_string();
    msg.contains("NoSuchKey") || msg.contains("404") || msg.contains("Not Found")
}

#[async_trait]
impl BlobStore for R2BlobStore {
    async fn put(&self, key: &str, bytes: &[u8], mime_type: &str) -> Result<(), String> {
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(self.object_key(key))
            .content_type(mime_type)
            .content_length(bytes.len() as i64)
            .body(ByteStream::from(bytes.to_vec()))
            .send()
            .await
            .map_err(|e| self.describe("put", key, &e))?;
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, String> {
        Ok(self.get_object(key).await?.map(|object| object.bytes))
    }

    async fn get_object(&self, key: &str) -> Result<Option<BlobObject>, String> {
        let response = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(self.object_key(key))
            .send()
            .await;

        match response {
            Ok(out) => {
                let mime_type = out
                    .content_type()
                    .unwrap_or(whiteboard_sync::storage::OCTET_STREAM_MIME)
                    .to_string();
                let body = out
                    .body
                    .collect()
                    .await
                    .map_err(|e| format!("R2 get body failed for {}: {}", key, e))?;
                Ok(Some(BlobObject {
                    bytes: body.into_bytes().to_vec(),
                    mime_type,
                }))
            }
            Err(e) if is_not_found(&e) => Ok(None),
            Err(e) => Err(self.describe("get", key, &e)),
        }
    }

    async fn delete(&self, key: &str) -> Result<(), String> {
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(self.object_key(key))
            .send()
            .await
            .map_err(|e| self.describe("delete", key, &e))?;
        Ok(())
    }

    async fn exists(&self, key: &str) -> Result<bool, String> {
        let result = self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(self.object_key(key))
            .send()
            .await;

        match result {
            Ok(_) => Ok(true),
            Err(e) if is_not_found(&e) => Ok(false),
            Err(e) => Err(self.describe("exists", key, &e)),
        }
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>, String> {
        let mut keys = Vec::new();
        let mut continuation: Option<String> = None;

        loop {
            let mut request = self
                .client
                .list_objects_v2()
                .bucket(&self.bucket)
                .prefix(self.object_key(prefix));
            if let Some(token) = continuation.take() {
                request = request.continuation_token(token);
            }
            let out = request
                .send()
                .await
                .map_err(|e| self.describe("list", prefix, &e))?;

            keys.extend(
                out.contents()
                    .iter()
                    .filter_map(|object| object.key())
                    .map(|key| self.logical_key(key).to_string()),
            );

            match out.next_continuation_token() {
                Some(token) if out.is_truncated().unwrap_or(false) => {
                    continuation = Some(token.to_string());
                }
                _ => break,
            }
        }

        keys.sort();
        Ok(keys)
    }
}

/// R2 when credentials are configured, otherwise a process-local store.
pub async fn build_blob_store(config: &Config) -> Result<Arc<dyn BlobStore>, String> {
    if config.is_r2_configured() {
        let store = R2BlobStore::new(&config.r2).await?;
        info!("Room blob store: R2 ({})", config.r2.bucket);
        Ok(Arc::new(store))
    } else {
        info!("Room blob store: in-memory (R2 not configured)");
        Ok(Arc::new(InMemoryBlobStore::new()))
    }
}
