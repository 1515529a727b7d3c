//! S3-compatible content store.
//!
//! Works with AWS S3 and S3-compatible services (Backblaze B2, Tigris, MinIO,
//! ...). Credentials are provided explicitly via the configuration file.

use crate::{
    ContentStore, ObjectInfo,
    backend::ObjectInfoStream,
    error::{ErrorKind, Result},
    validate_key,
};
use async_stream::stream;
use async_trait::async_trait;
use aws_sdk_s3::{
    Client,
    config::{BehaviorVersion, Credentials, Region, http::HttpResponse, retry::RetryConfig},
    error::{DisplayErrorContext, SdkError},
    primitives::{ByteStream, DateTime},
    types::{Delete, ObjectIdentifier},
};
use exn::{OptionExt, ResultExt};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use time::OffsetDateTime;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// Generous default for concurrent S3 requests.
const DEFAULT_CONCURRENT_REQUESTS: usize = 100;
/// `DeleteObjects` accepts at most this many keys per request.
const DELETE_BATCH_SIZE: usize = 1000;

/// S3-compatible content store.
///
/// Stores objects in an S3 bucket, optionally under a key prefix. All keys
/// are relative to the configured prefix (if any).
///
/// # Examples
///
/// ```no_run
/// use quire_storage::backend::S3Backend;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let backend = S3Backend::new(
///     "media",
///     "my-bucket",
///     Some("quire/".to_string()),
///     "us-west-004",
///     Some("https://s3.us-west-004.backblazeb2.com".to_string()),
///     "access_key_id",
///     "secret_access_key",
/// ).await?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct S3Backend {
    name: String,
    client: Client,
    bucket: String,
    prefix: Option<String>,
    /// Rate limiter for concurrent S3 requests.
    rate_limiter: Arc<Semaphore>,
}

impl S3Backend {
    /// Create a new S3 content store.
    ///
    /// # Arguments
    /// * `name` - A name for this backend (used in logging)
    /// * `bucket` - S3 bucket name
    /// * `prefix` - Optional key prefix (acts as virtual directory)
    /// * `region` - AWS region or provider-specific region
    /// * `endpoint` - Custom endpoint URL for S3-compatible services
    /// * `key_id` - Access key ID
    /// * `key_secret` - Secret access key
    pub async fn new(
        name: impl Into<String>,
        bucket: impl Into<String>,
        prefix: Option<String>,
        region: impl Into<String>,
        endpoint: Option<impl Into<String>>,
        key_id: impl Into<String>,
        key_secret: impl Into<String>,
    ) -> Result<Self> {
        let prefix = prefix.map(validate_key).transpose()?.map(|p| p.to_string_lossy().into_owned());
        let credentials = Credentials::new(key_id, key_secret, None, None, "quire-config");
        let mut config_builder = aws_sdk_s3::Config::builder()
            .behavior_version(BehaviorVersion::latest())
            .credentials_provider(credentials)
            .region(Region::new(region.into()))
            // Exponential backoff (1 initial + 3 retries)
            .retry_config(RetryConfig::standard().with_max_attempts(4))
            // Path-style addressing for S3-compatible services (Backblaze, MinIO, etc.)
            .force_path_style(true);
        if let Some(endpoint_url) = endpoint {
            config_builder = config_builder.endpoint_url(endpoint_url);
        }
        Ok(Self {
            name: name.into(),
            client: Client::from_conf(config_builder.build()),
            bucket: bucket.into(),
            prefix,
            rate_limiter: Arc::new(Semaphore::new(DEFAULT_CONCURRENT_REQUESTS)),
        })
    }

    fn full_key(&self, key: &Path) -> Result<String> {
        let validated = validate_key(key)?;
        let key = validated.to_str().ok_or_raise(|| ErrorKind::InvalidKey(validated.clone()))?;
        Ok(join_prefix(self.prefix.as_deref(), key))
    }

    fn relative_key(&self, key: &str) -> Result<PathBuf> {
        validate_key(strip_prefix(self.prefix.as_deref(), key))
    }

    async fn acquire_permit(&self) -> Result<OwnedSemaphorePermit> {
        self.rate_limiter
            .clone()
            .acquire_owned()
            .await
            .or_raise(|| ErrorKind::BackendError("S3 rate limiter closed".to_string()))
    }

    fn parse_datetime(dt: Option<&DateTime>) -> Result<OffsetDateTime> {
        match dt {
            Some(dt) => OffsetDateTime::from_unix_timestamp_nanos(dt.as_nanos())
                .or_raise(|| ErrorKind::BackendError("S3 datetime out of range".to_string())),
            None => Ok(OffsetDateTime::UNIX_EPOCH),
        }
    }

    fn sdk_error<E: std::error::Error + 'static>(err: SdkError<E, HttpResponse>, key: &Path) -> ErrorKind {
        if is_not_found(&err) {
            return ErrorKind::NotFound(key.to_path_buf());
        }
        match err {
            SdkError::TimeoutError(_) | SdkError::DispatchFailure(_) => {
                ErrorKind::Network(DisplayErrorContext(&err).to_string())
            },
            _ => ErrorKind::BackendError(DisplayErrorContext(&err).to_string()),
        }
    }

    async fn list_page(
        &self,
        prefix: Option<&str>,
        token: Option<String>,
    ) -> Result<(Vec<ObjectInfo>, Option<String>)> {
        let _permit = self.acquire_permit().await?;
        let output = self
            .client
            .list_objects_v2()
            .bucket(&self.bucket)
            .set_prefix(prefix.map(str::to_string))
            .set_continuation_token(token)
            .send()
            .await
            .map_err(|e| Self::sdk_error(e, Path::new(prefix.unwrap_or_default())))?;
        let mut objects = Vec::with_capacity(output.contents().len());
        for object in output.contents() {
            let Some(key) = object.key() else { continue };
            // Directory markers created by some S3 consoles.
            if key.ends_with('/') {
                continue;
            }
            let size = u64::try_from(object.size().unwrap_or_default()).unwrap_or_default();
            objects.push(ObjectInfo::new(self.relative_key(key)?, size, Self::parse_datetime(object.last_modified())?));
        }
        let next = match output.is_truncated() {
            Some(true) => output.next_continuation_token().map(str::to_string),
            _ => None,
        };
        Ok((objects, next))
    }
}

/// Prefix a key with the configured (virtual directory) prefix.
fn join_prefix(prefix: Option<&str>, key: &str) -> String {
    match prefix {
        Some(prefix) => format!("{}/{}", prefix.trim_end_matches('/'), key),
        None => key.to_string(),
    }
}

/// Strip the configured prefix from an S3 key.
fn strip_prefix<'a>(prefix: Option<&str>, key: &'a str) -> &'a str {
    match prefix {
        Some(prefix) => key.strip_prefix(prefix.trim_end_matches('/')).and_then(|s| s.strip_prefix('/')).unwrap_or(key),
        None => key,
    }
}

fn is_not_found<E>(err: &SdkError<E, HttpResponse>) -> bool {
    err.raw_response().is_some_and(|response| response.status().as_u16() == 404)
}

#[async_trait]
impl ContentStore for S3Backend {
    fn name(&self) -> &str {
        &self.name
    }

    fn list_stream<'a>(&'a self, prefix: Option<&'a Path>) -> ObjectInfoStream<'a> {
        // S3 prefixes are string-based; append a separator so `m/c` doesn't
        // also match `m/cx/...`.
        let prefix = match prefix.map(|p| self.full_key(p)).transpose() {
            Ok(pfx) => pfx.map(|p| format!("{p}/")),
            Err(e) => return Box::pin(futures::stream::once(async { Err(e) })),
        };
        let prefix = prefix.or_else(|| self.prefix.as_ref().map(|p| format!("{}/", p.trim_end_matches('/'))));

        Box::pin(stream! {
            let mut token = None;
            loop {
                match self.list_page(prefix.as_deref(), token.take()).await {
                    Ok((objects, next)) => {
                        for object in objects {
                            yield Ok(object);
                        }
                        match next {
                            Some(next) => token = Some(next),
                            None => break,
                        }
                    },
                    Err(e) => {
                        yield Err(e);
                        break;
                    },
                }
            }
        })
    }

    async fn exists(&self, key: &Path) -> Result<bool> {
        match self.stat(key).await {
            Ok(_) => Ok(true),
            Err(e) if e.is_not_found() => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn get(&self, key: &Path) -> Result<Vec<u8>> {
        let full_key = self.full_key(key)?;
        let _permit = self.acquire_permit().await?;
        let output = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(full_key)
            .send()
            .await
            .map_err(|e| Self::sdk_error(e, key))?;
        let data = output.body.collect().await.or_raise(|| ErrorKind::Network(format!("reading {}", key.display())))?;
        Ok(data.into_bytes().to_vec())
    }

    async fn put(&self, key: &Path, data: &[u8]) -> Result<()> {
        let full_key = self.full_key(key)?;
        let _permit = self.acquire_permit().await?;
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(full_key)
            .body(ByteStream::from(data.to_vec()))
            .send()
            .await
            .map_err(|e| Self::sdk_error(e, key))?;
        Ok(())
    }

    async fn remove(&self, key: &Path) -> Result<()> {
        let full_key = self.full_key(key)?;
        let _permit = self.acquire_permit().await?;
        // S3 reports success when deleting a key that doesn't exist.
        match self.client.delete_object().bucket(&self.bucket).key(full_key).send().await {
            Ok(_) => Ok(()),
            Err(e) if is_not_found(&e) => Ok(()),
            Err(e) => exn::bail!(Self::sdk_error(e, key)),
        }
    }

    async fn stat(&self, key: &Path) -> Result<ObjectInfo> {
        let full_key = self.full_key(key)?;
        let _permit = self.acquire_permit().await?;
        let output = self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(full_key)
            .send()
            .await
            .map_err(|e| Self::sdk_error(e, key))?;
        let size = u64::try_from(output.content_length().unwrap_or_default()).unwrap_or_default();
        Ok(ObjectInfo::new(validate_key(key)?, size, Self::parse_datetime(output.last_modified())?))
    }

    async fn copy(&self, from: &Path, to: &Path) -> Result<()> {
        let source = format!("{}/{}", self.bucket, self.full_key(from)?);
        let target = self.full_key(to)?;
        let _permit = self.acquire_permit().await?;
        self.client
            .copy_object()
            .bucket(&self.bucket)
            .copy_source(source)
            .key(target)
            .send()
            .await
            .map_err(|e| Self::sdk_error(e, from))?;
        Ok(())
    }

    async fn remove_many(&self, keys: &[PathBuf]) -> Result<()> {
        for batch in keys.chunks(DELETE_BATCH_SIZE) {
            let objects = batch
                .iter()
                .map(|key| {
                    let full_key = self.full_key(key)?;
                    ObjectIdentifier::builder()
                        .key(full_key)
                        .build()
                        .or_raise(|| ErrorKind::BackendError("invalid object identifier".to_string()))
                })
                .collect::<Result<Vec<_>>>()?;
            let delete = Delete::builder()
                .set_objects(Some(objects))
                .quiet(true)
                .build()
                .or_raise(|| ErrorKind::BackendError("invalid delete request".to_string()))?;
            let _permit = self.acquire_permit().await?;
            let output = self
                .client
                .delete_objects()
                .bucket(&self.bucket)
                .delete(delete)
                .send()
                .await
                .map_err(|e| Self::sdk_error(e, Path::new(&self.bucket)))?;
            // Missing keys are never reported as errors by S3; anything
            // listed here is a genuine failure.
            if let Some(failed) = output.errors().first() {
                exn::bail!(ErrorKind::BackendError(format!(
                    "failed to delete {}: {}",
                    failed.key().unwrap_or_default(),
                    failed.message().unwrap_or_default()
                )));
            }
        }
        Ok(())
    }
}
