//! Artifact capture pipeline
//!
//! Connection handlers and drivers queue artifacts on a channel; a single
//! consumer task writes each record through every configured sink. Sink
//! failures are logged and never stop the consumer.

use std::borrow::Cow;
use std::path::PathBuf;

use anyhow::Result;
use aws_sdk_s3::config::{BehaviorVersion, Credentials, Region};
use aws_sdk_s3::primitives::ByteStream;
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::config::{CaptureConfig, S3Config};

/// Bucket for one-per-fingerprint captures of initial bytes.
pub const RAW_BUCKET: &str = "raw";
/// Bucket for driver-emitted per-interaction captures.
pub const SESSIONS_BUCKET: &str = "sessions";

/// One record to persist: `<bucket>/<filename>` with the given bytes.
#[derive(Debug, Clone)]
pub struct Artifact {
    pub filename: String,
    pub bucket: &'static str,
    pub data: Vec<u8>,
}

/// Sender handle for queueing artifacts.
pub type StoreSender = mpsc::UnboundedSender<Artifact>;

/// The configured persistence sinks: a local folder, S3-compatible object
/// storage, both, or neither.
pub struct Store {
    root: Option<PathBuf>,
    s3: Option<S3Sink>,
}

struct S3Sink {
    client: aws_sdk_s3::Client,
    bucket: String,
}

impl Store {
    /// Prepare the sinks: resolve the output folder, create the bucket
    /// subdirectories, and build the S3 client when a key is configured.
    pub fn new(capture: &CaptureConfig, s3: &S3Config) -> Result<Self> {
        let root = match capture.output_folder.as_str() {
            "" => None,
            "." => Some(std::env::current_dir()?),
            folder => Some(PathBuf::from(folder)),
        };

        if let Some(root) = &root {
            std::fs::create_dir_all(root.join(RAW_BUCKET))?;
            std::fs::create_dir_all(root.join(SESSIONS_BUCKET))?;
            info!("local artifact sink at {}", root.display());
        }

        let s3 = if s3.key.is_empty() {
            None
        } else {
            let credentials =
                Credentials::new(s3.key_id.clone(), s3.key.clone(), None, None, "mantrap");
            let mut builder = aws_sdk_s3::config::Builder::new()
                .behavior_version(BehaviorVersion::latest())
                .region(Region::new(s3.region.clone()))
                .credentials_provider(credentials)
                .force_path_style(true);
            if !s3.endpoint.is_empty() {
                builder = builder.endpoint_url(s3.endpoint.clone());
            }
            info!("s3 artifact sink in bucket {}", s3.bucket);
            Some(S3Sink {
                client: aws_sdk_s3::Client::from_conf(builder.build()),
                bucket: s3.bucket.clone(),
            })
        };

        Ok(Self { root, s3 })
    }

    /// Sink-specific scrubbing applied before any write. Identity for now.
    fn sanitize<'a>(&self, data: &'a [u8]) -> Cow<'a, [u8]> {
        Cow::Borrowed(data)
    }

    async fn put(&self, artifact: &Artifact) {
        let data = self.sanitize(&artifact.data);

        if let Some(root) = &self.root {
            let path = root.join(artifact.bucket).join(&artifact.filename);
            if let Err(e) = tokio::fs::write(&path, data.as_ref()).await {
                debug!("error saving {}: {}", path.display(), e);
            }
        }

        if let Some(s3) = &self.s3 {
            let key = format!("{}/{}", artifact.bucket, artifact.filename);
            let body = ByteStream::from(data.into_owned());
            if let Err(e) = s3
                .client
                .put_object()
                .bucket(s3.bucket.as_str())
                .key(key.as_str())
                .body(body)
                .send()
                .await
            {
                debug!("error uploading {}: {}", key, e);
            }
        }
    }
}

/// Start the single-consumer store task and return the producer handle.
pub fn start_store(store: Store) -> StoreSender {
    let (tx, rx) = mpsc::unbounded_channel();
    tokio::spawn(store_task(store, rx));
    tx
}

async fn store_task(store: Store, mut rx: mpsc::UnboundedReceiver<Artifact>) {
    info!("artifact store started");
    while let Some(artifact) = rx.recv().await {
        store.put(&artifact).await;
    }
    info!("artifact store shutting down");
}
