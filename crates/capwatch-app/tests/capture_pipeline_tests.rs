//! Integration tests for the capture-persist-upload-cleanup pipeline.

mod common;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use capwatch_auth::{HttpError, REFRESH_PATH, RequestBody};
use capwatch_capture::{CaptureError, SyntheticCaptureBackend};
use capwatch_upload::{
    CapturePipeline, IDEMPOTENCY_HEADER, IMAGE_FIELD, IMAGE_MIME, PipelineOutcome, UPLOAD_PATH,
    UploadError, idempotency_key,
};
use common::{FailingCaptureBackend, ScriptedTransport, client_with_token, file_count, json};
use serde_json::json;

#[tokio::test]
async fn capture_pipeline_tests_successful_upload_removes_artifact() {
    let dir = tempfile::tempdir().expect("temp dir");
    let dir_path = dir.path().to_path_buf();
    let artifact_seen = Arc::new(AtomicBool::new(false));
    let seen = artifact_seen.clone();
    let transport = ScriptedTransport::new(move |request| {
        if request.path == UPLOAD_PATH {
            seen.store(file_count(&dir_path) == 1, Ordering::SeqCst);
        }
        json(201, json!({ "ok": true }))
    });
    let (client, _store) = client_with_token(transport.clone(), Some("abc"));
    let pipeline = CapturePipeline::new(
        client,
        Arc::new(SyntheticCaptureBackend::new()),
        dir.path(),
    );

    let outcome = pipeline.run_once().await;

    assert!(matches!(outcome, PipelineOutcome::Uploaded { bytes } if bytes > 0));
    assert!(artifact_seen.load(Ordering::SeqCst));
    assert_eq!(file_count(dir.path()), 0);

    let upload = &transport.requests()[0];
    assert_eq!(upload.header("authorization"), Some("Bearer abc"));
    let RequestBody::Multipart(file) = &upload.body else {
        panic!("upload must be multipart");
    };
    assert_eq!(file.field, IMAGE_FIELD);
    assert_eq!(file.mime, IMAGE_MIME);
    assert!(file.file_name.ends_with(".png"));
    assert_eq!(
        upload.header(IDEMPOTENCY_HEADER),
        Some(idempotency_key(&file.bytes).as_str())
    );
}

#[tokio::test]
async fn capture_pipeline_tests_server_error_still_removes_artifact() {
    let dir = tempfile::tempdir().expect("temp dir");
    let transport = ScriptedTransport::new(|_| json(500, json!({ "error": "boom" })));
    let (client, _store) = client_with_token(transport.clone(), Some("abc"));
    let pipeline = CapturePipeline::new(
        client,
        Arc::new(SyntheticCaptureBackend::new()),
        dir.path(),
    );

    let outcome = pipeline.run_once().await;

    assert!(matches!(
        outcome,
        PipelineOutcome::UploadFailed(UploadError::Http(HttpError::Status { status: 500, .. }))
    ));
    assert_eq!(transport.count(UPLOAD_PATH), 1);
    assert_eq!(file_count(dir.path()), 0);
}

#[tokio::test]
async fn capture_pipeline_tests_capture_failure_creates_nothing() {
    let dir = tempfile::tempdir().expect("temp dir");
    let transport = ScriptedTransport::new(|_| json(200, json!({})));
    let (client, _store) = client_with_token(transport.clone(), Some("abc"));
    let pipeline = CapturePipeline::new(client, Arc::new(FailingCaptureBackend), dir.path());

    let outcome = pipeline.run_once().await;

    assert!(matches!(
        outcome,
        PipelineOutcome::CaptureFailed(CaptureError::Backend(_))
    ));
    assert!(transport.requests().is_empty());
    assert_eq!(file_count(dir.path()), 0);
}

#[tokio::test]
async fn capture_pipeline_tests_repeated_401_clears_session_after_one_refresh() {
    let dir = tempfile::tempdir().expect("temp dir");
    let transport = ScriptedTransport::new(|request| {
        if request.path == REFRESH_PATH {
            json(200, json!({ "accessToken": "fresh" }))
        } else {
            json(401, json!({}))
        }
    });
    let (client, store) = client_with_token(transport.clone(), Some("stale"));
    let pipeline = CapturePipeline::new(
        client,
        Arc::new(SyntheticCaptureBackend::new()),
        dir.path(),
    );

    let outcome = pipeline.run_once().await;

    assert!(matches!(
        outcome,
        PipelineOutcome::UploadFailed(UploadError::Http(HttpError::Unauthorized { .. }))
    ));
    assert_eq!(transport.count(REFRESH_PATH), 1);
    assert_eq!(
        transport.bearers(UPLOAD_PATH),
        vec![Some("Bearer stale".to_string()), Some("Bearer fresh".to_string())]
    );
    assert!(store.get().is_none());
    assert_eq!(file_count(dir.path()), 0);
}

#[tokio::test]
async fn capture_pipeline_tests_artifact_names_do_not_collide() {
    let dir = tempfile::tempdir().expect("temp dir");
    let transport = ScriptedTransport::new(|_| json(200, json!({})));
    let (client, _store) = client_with_token(transport.clone(), Some("abc"));
    let pipeline = CapturePipeline::new(
        client,
        Arc::new(SyntheticCaptureBackend::new()),
        dir.path(),
    );

    pipeline.run_once().await;
    pipeline.run_once().await;

    let names: Vec<String> = transport
        .requests()
        .iter()
        .filter_map(|request| match &request.body {
            RequestBody::Multipart(file) => Some(file.file_name.clone()),
            _ => None,
        })
        .collect();
    assert_eq!(names.len(), 2);
    assert_ne!(names[0], names[1]);
}
