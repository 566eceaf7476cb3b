use std::path::Path;

use anyhow::Context;
use async_trait::async_trait;
use aws_config::{defaults, BehaviorVersion};
use aws_credential_types::Credentials;
use aws_sdk_s3::{
    config::{Builder as S3ConfigBuilder, Region},
    Client,
};
use aws_smithy_types::byte_stream::ByteStream;
use bytes::Bytes;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::config::MediaConfig;

/// A file hosted by the media store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaAsset {
    pub key: String,
    pub url: String,
}

/// Hosts uploaded files and hands back public URLs.
#[async_trait]
pub trait MediaStore: Send + Sync {
    /// Uploads a local file. The local file is removed afterwards, whether or not the upload succeeded.
    async fn upload(&self, local_path: &Path, content_type: &str) -> anyhow::Result<MediaAsset>;
    async fn destroy(&self, key: &str) -> anyhow::Result<()>;
}

#[derive(Clone)]
pub struct S3MediaStore {
    client: Client,
    bucket: String,
    public_url: String,
}

impl S3MediaStore {
    pub async fn new(cfg: &MediaConfig) -> anyhow::Result<Self> {
        let shared = defaults(BehaviorVersion::latest())
            .region(Region::new(cfg.region.clone()))
            .credentials_provider(Credentials::new(
                &cfg.access_key,
                &cfg.secret_key,
                None,
                None,
                "static",
            ))
            .endpoint_url(&cfg.endpoint)
            .load()
            .await;

        let conf = S3ConfigBuilder::from(&shared)
            .endpoint_url(&cfg.endpoint)
            .force_path_style(true)
            .build();

        Ok(Self {
            client: Client::from_conf(conf),
            bucket: cfg.bucket.clone(),
            public_url: cfg.public_url.trim_end_matches('/').to_string(),
        })
    }

    async fn put_object(&self, key: &str, body: Bytes, content_type: &str) -> anyhow::Result<()> {
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(ByteStream::from(body))
            .content_type(content_type)
            .send()
            .await
            .context("s3 put_object")?;
        Ok(())
    }
}

#[async_trait]
impl MediaStore for S3MediaStore {
    async fn upload(&self, local_path: &Path, content_type: &str) -> anyhow::Result<MediaAsset> {
        let key = object_key(content_type);
        let result = async {
            let body = tokio::fs::read(local_path)
                .await
                .with_context(|| format!("read {}", local_path.display()))?;
            self.put_object(&key, Bytes::from(body), content_type)
                .await
                .with_context(|| format!("put_object {}", key))
        }
        .await;

        if let Err(e) = tokio::fs::remove_file(local_path).await {
            warn!(error = %e, path = %local_path.display(), "failed to remove temp upload");
        }
        result?;

        debug!(%key, "media uploaded");
        Ok(MediaAsset {
            url: format!("{}/{}", self.public_url, key),
            key,
        })
    }

    async fn destroy(&self, key: &str) -> anyhow::Result<()> {
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .context("s3 delete_object")?;
        Ok(())
    }
}

fn object_key(content_type: &str) -> String {
    let ext = ext_from_mime(content_type).unwrap_or("bin");
    format!("users/{}.{}", Uuid::new_v4(), ext)
}

fn ext_from_mime(ct: &str) -> Option<&'static str> {
    match ct {
        "image/jpeg" | "image/jpg" => Some("jpg"),
        "image/png" => Some("png"),
        "image/webp" => Some("webp"),
        "image/gif" => Some("gif"),
        "image/heic" => Some("heic"),
        _ => None,
    }
}
