//! S3 backend: a single JSON object at `<prefix>/snapshot.json`.

use std::time::Instant;

use anyhow::{Context, Result};
use aws_config::BehaviorVersion;
use aws_sdk_s3::config::Builder as S3ConfigBuilder;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::Client as S3Client;
use tokio::io::{AsyncRead, AsyncReadExt};
use tracing::{debug, info};

use crate::{PersistError, S3Settings, SnapshotBackend};

pub struct S3Backend {
    client: S3Client,
    bucket: String,
    key: String,
}

impl S3Backend {
    /// Build a client from the default credential chain.
    pub async fn new(settings: S3Settings) -> Self {
        let aws_config = aws_config::defaults(BehaviorVersion::latest())
            .region(aws_config::Region::new(settings.region.clone()))
            .load()
            .await;

        let mut builder = S3ConfigBuilder::from(&aws_config);
        if let Some(ref endpoint) = settings.endpoint {
            builder = builder.endpoint_url(endpoint).force_path_style(true);
        }
        let client = S3Client::from_conf(builder.build());

        info!(
            bucket = %settings.bucket,
            region = %settings.region,
            endpoint = ?settings.endpoint,
            "S3 snapshot client initialized"
        );
        Self::with_client(client, &settings)
    }

    pub fn with_client(client: S3Client, settings: &S3Settings) -> Self {
        Self { client, bucket: settings.bucket.clone(), key: settings.object_key() }
    }
}

#[async_trait::async_trait]
impl SnapshotBackend for S3Backend {
    fn location(&self) -> String {
        format!("s3://{}/{}", self.bucket, self.key)
    }

    async fn get(&self, max_bytes: usize) -> Result<Option<Vec<u8>>> {
        let started = Instant::now();
        let out = match self.client.get_object().bucket(&self.bucket).key(&self.key).send().await {
            Ok(out) => out,
            Err(e) if e.as_service_error().map(|se| se.is_no_such_key()).unwrap_or(false) => return Ok(None),
            Err(e) => return Err(anyhow::Error::new(e).context("S3 GetObject failed")),
        };
        if let Some(len) = out.content_length().filter(|len| *len > 0) {
            if len as u64 > max_bytes as u64 {
                return Err(PersistError::TooLarge { size: len as u64, max: max_bytes }.into());
            }
        }
        let body = read_bounded(out.body.into_async_read(), max_bytes).await?;
        debug!(bytes = body.len(), took_ms = %started.elapsed().as_millis(), "S3 snapshot read");
        Ok(Some(body))
    }

    async fn put(&self, body: Vec<u8>) -> Result<()> {
        let started = Instant::now();
        let size = body.len();
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(&self.key)
            .body(ByteStream::from(body))
            .content_type("application/json")
            .send()
            .await
            .context("S3 PutObject failed")?;
        debug!(bytes = size, took_ms = %started.elapsed().as_millis(), "S3 snapshot written");
        Ok(())
    }
}

/// Read at most `max_bytes`; one byte more is enough to reject the object
/// without buffering the rest of it.
async fn read_bounded<R: AsyncRead + Unpin>(reader: R, max_bytes: usize) -> Result<Vec<u8>> {
    let mut body = Vec::new();
    reader.take(max_bytes as u64 + 1).read_to_end(&mut body).await.context("reading S3 object body")?;
    if body.len() > max_bytes {
        return Err(PersistError::TooLarge { size: body.len() as u64, max: max_bytes }.into());
    }
    Ok(body)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn bounded_read_accepts_up_to_the_limit() {
        let body = read_bounded(&b"{\"claims\":[]}"[..], 13).await.unwrap();
        assert_eq!(body, b"{\"claims\":[]}");
    }

    #[tokio::test]
    async fn bounded_read_stops_one_byte_past_the_limit() {
        let big = vec![b'x'; 64 * 1024];
        let err = read_bounded(&big[..], 1024).await.unwrap_err();
        match err.downcast_ref::<PersistError>() {
            Some(PersistError::TooLarge { size, max }) => assert_eq!((*size, *max), (1025, 1024)),
            other => panic!("unexpected error: {other:?}"),
        }
    }
}
