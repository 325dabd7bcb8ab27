#![warn(missing_docs)]
//! # capwatch-upload
//!
//! ## Purpose
//! Runs the capture pipeline: acquire one screen image, persist it briefly,
//! upload it, and always remove the file afterwards.
//!
//! ## Responsibilities
//! - Allocate a timestamped artifact path per run.
//! - Move the blocking OS capture call off the event loop.
//! - Upload the artifact as multipart field `image` through the authenticated
//!   client, tagged with a content-derived idempotency key.
//! - Delete the artifact on every exit path, including cancellation.
//!
//! ## Data flow
//! [`CapturePipeline::run_once`] -> [`CaptureBackend::capture_png`] -> write
//! artifact -> read artifact -> `POST /upload` -> delete artifact ->
//! [`PipelineOutcome`].
//!
//! ## Error model
//! Nothing escapes a run. Capture failures become
//! [`PipelineOutcome::CaptureFailed`]; persistence and upload failures become
//! [`PipelineOutcome::UploadFailed`] with an [`UploadError`].
//!
//! ## Security and privacy notes
//! Artifacts live only for the duration of one run. Upload error bodies are
//! redacted by the client before they reach logs.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use capwatch_auth::{AuthenticatedClient, HttpError, HttpMethod, MultipartFile, RequestBody};
use capwatch_capture::{CaptureBackend, CaptureError, CapturedImage};
use capwatch_core::CaptureArtifact;
use capwatch_scheduler::CaptureJob;
use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{debug, info, warn};

/// Path of the upload endpoint.
pub const UPLOAD_PATH: &str = "/upload";

/// Multipart field carrying the image.
pub const IMAGE_FIELD: &str = "image";

/// MIME type of uploaded captures.
pub const IMAGE_MIME: &str = "image/png";

/// Header carrying the content-derived idempotency key.
pub const IDEMPOTENCY_HEADER: &str = "X-Idempotency-Key";

/// Result of one pipeline run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PipelineOutcome {
    /// Upload accepted by the server.
    Uploaded {
        /// Uploaded byte count.
        bytes: usize,
    },
    /// OS capture failed; no artifact was written.
    CaptureFailed(CaptureError),
    /// Persisting or uploading failed; the artifact was still removed.
    UploadFailed(UploadError),
}

/// Computes the idempotency key for an artifact body.
///
/// Identical bytes always produce the same lowercase hex SHA-256 digest.
pub fn idempotency_key(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

/// Builds the artifact path for one run.
pub fn artifact_path(capture_dir: &Path, created_at: DateTime<Utc>, sequence: u64) -> PathBuf {
    capture_dir.join(format!(
        "capture-{}-{sequence}.png",
        created_at.format("%Y%m%dT%H%M%S%.3fZ")
    ))
}

/// Removes its artifact when dropped unless already cleaned up.
#[derive(Debug)]
pub struct ArtifactGuard {
    artifact: CaptureArtifact,
    released: bool,
}

impl ArtifactGuard {
    /// Takes ownership of the artifact's cleanup.
    pub fn new(artifact: CaptureArtifact) -> Self {
        Self {
            artifact,
            released: false,
        }
    }

    /// Returns the guarded artifact.
    pub fn artifact(&self) -> &CaptureArtifact {
        &self.artifact
    }

    /// Deletes the artifact if it exists.
    ///
    /// # Errors
    /// Returns the I/O error for failures other than the file being absent.
    pub async fn cleanup(mut self) -> io::Result<()> {
        let removed = tokio::fs::remove_file(&self.artifact.path).await;
        // Only a completed attempt releases the guard; a cancelled one falls back to Drop.
        self.released = true;
        match removed {
            Ok(()) => Ok(()),
            Err(error) if error.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(error) => Err(error),
        }
    }
}

impl Drop for ArtifactGuard {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        if let Err(error) = std::fs::remove_file(&self.artifact.path)
            && error.kind() != io::ErrorKind::NotFound
        {
            warn!(
                stage = "pipeline",
                action = "cleanup_failed",
                path = %self.artifact.path.display(),
                %error,
                "artifact left behind"
            );
        }
    }
}

/// Capture-persist-upload-cleanup pipeline.
pub struct CapturePipeline {
    client: Arc<AuthenticatedClient>,
    backend: Arc<dyn CaptureBackend>,
    capture_dir: PathBuf,
    sequence: AtomicU64,
}

impl CapturePipeline {
    /// Creates a pipeline writing artifacts into `capture_dir`.
    pub fn new(
        client: Arc<AuthenticatedClient>,
        backend: Arc<dyn CaptureBackend>,
        capture_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            client,
            backend,
            capture_dir: capture_dir.into(),
            sequence: AtomicU64::new(0),
        }
    }

    /// Returns the artifact directory.
    pub fn capture_dir(&self) -> &Path {
        &self.capture_dir
    }

    /// Runs one capture end to end. Never fails; see [`PipelineOutcome`].
    pub async fn run_once(&self) -> PipelineOutcome {
        let created_at = Utc::now();
        let sequence = self.sequence.fetch_add(1, Ordering::SeqCst);
        let artifact = CaptureArtifact::new(
            artifact_path(&self.capture_dir, created_at, sequence),
            created_at,
        );
        let guard = ArtifactGuard::new(artifact.clone());

        let outcome = self.capture_and_upload(&artifact).await;

        if let Err(error) = guard.cleanup().await {
            warn!(
                stage = "pipeline",
                action = "cleanup_failed",
                path = %artifact.path.display(),
                %error,
                "artifact left behind"
            );
        }

        match &outcome {
            PipelineOutcome::Uploaded { bytes } => {
                info!(stage = "pipeline", action = "uploaded", bytes = *bytes);
            }
            PipelineOutcome::CaptureFailed(error) => {
                warn!(stage = "pipeline", action = "capture_failed", %error);
            }
            PipelineOutcome::UploadFailed(error) => {
                warn!(stage = "pipeline", action = "upload_failed", %error);
            }
        }
        outcome
    }

    async fn capture_and_upload(&self, artifact: &CaptureArtifact) -> PipelineOutcome {
        let image = match self.capture().await {
            Ok(image) => image,
            Err(error) => return PipelineOutcome::CaptureFailed(error),
        };
        debug!(
            stage = "pipeline",
            action = "captured",
            width = image.width,
            height = image.height,
            "screen captured"
        );

        match self.persist_and_upload(artifact, &image).await {
            Ok(bytes) => PipelineOutcome::Uploaded { bytes },
            Err(error) => PipelineOutcome::UploadFailed(error),
        }
    }

    async fn capture(&self) -> Result<CapturedImage, CaptureError> {
        let backend = self.backend.clone();
        tokio::task::spawn_blocking(move || backend.capture_png())
            .await
            .map_err(|error| CaptureError::Backend(format!("capture task failed: {error}")))?
    }

    async fn persist_and_upload(
        &self,
        artifact: &CaptureArtifact,
        image: &CapturedImage,
    ) -> Result<usize, UploadError> {
        tokio::fs::create_dir_all(&self.capture_dir)
            .await
            .map_err(|error| UploadError::Persist(error.to_string()))?;
        tokio::fs::write(&artifact.path, &image.png)
            .await
            .map_err(|error| UploadError::Persist(error.to_string()))?;

        let bytes = tokio::fs::read(&artifact.path)
            .await
            .map_err(|error| UploadError::Read(error.to_string()))?;
        let size = bytes.len();
        let key = idempotency_key(&bytes);
        let file_name = artifact
            .path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| "capture.png".to_string());

        let body = RequestBody::Multipart(MultipartFile {
            field: IMAGE_FIELD.to_string(),
            file_name,
            mime: IMAGE_MIME.to_string(),
            bytes,
        });
        self.client
            .request(
                HttpMethod::Post,
                UPLOAD_PATH,
                Some(body),
                Some(vec![(IDEMPOTENCY_HEADER.to_string(), key)]),
            )
            .await?;

        Ok(size)
    }
}

#[async_trait]
impl CaptureJob for CapturePipeline {
    async fn run(&self) {
        self.run_once().await;
    }
}

/// Upload stage error type.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum UploadError {
    /// Artifact could not be written.
    #[error("failed to persist artifact: {0}")]
    Persist(String),
    /// Artifact could not be read back.
    #[error("failed to read artifact: {0}")]
    Read(String),
    /// Upload request failed.
    #[error("upload request failed: {0}")]
    Http(#[from] HttpError),
}
