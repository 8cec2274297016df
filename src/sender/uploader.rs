use super::client::ClientError;
use super::retry_client::RetryClient;
use crate::domain::Record;
use crate::reliability::{RequestContext, upsert_retry_policy};
use std::collections::BTreeMap;
use std::future::Future;
use thiserror::Error;
use tracing::debug;

#[derive(Error, Debug)]
pub enum UploadError {
    #[error("failed to upload {kind}")]
    Client {
        kind: &'static str,
        #[source]
        source: ClientError,
    },
}

/// One unit of work for the remote service.
#[derive(Debug, Clone, Copy)]
pub enum Upload<'a> {
    /// Create or update the run itself.
    Run(&'a Record),
    /// Full current configuration of the run.
    Config(&'a BTreeMap<String, String>),
    Record(&'a Record),
    Exit(&'a Record),
}

impl Upload<'_> {
    pub fn kind(&self) -> &'static str {
        match self {
            Upload::Run(_) => "run",
            Upload::Config(_) => "config",
            Upload::Record(record) => record.kind(),
            Upload::Exit(_) => "exit",
        }
    }
}

/// Transport used by the sender stage.
pub trait Uploader: Send + Sync + 'static {
    fn upload(
        &self,
        ctx: &RequestContext,
        upload: Upload<'_>,
    ) -> impl Future<Output = Result<(), UploadError>> + Send;

    /// Waits until everything handed to `upload` has been delivered.
    fn flush(&self, _ctx: &RequestContext) -> impl Future<Output = Result<(), UploadError>> + Send {
        async { Ok(()) }
    }
}

/// Uploads over HTTP with retries.
///
/// Routes, relative to the endpoint:
/// - `PUT v1/runs/{run}` run upsert
/// - `PUT v1/runs/{run}/config` configuration upsert
/// - `POST v1/runs/{run}/records` every other record
/// - `POST v1/runs/{run}/exit` exit marker
#[derive(Debug, Clone)]
pub struct HttpUploader {
    client: RetryClient,
    run_id: String,
}

impl HttpUploader {
    pub fn new(client: RetryClient, run_id: impl Into<String>) -> Self {
        Self {
            client,
            run_id: run_id.into(),
        }
    }

    pub fn client(&self) -> &RetryClient {
        &self.client
    }

    fn route(&self, upload: &Upload<'_>) -> String {
        let run = &self.run_id;
        match upload {
            Upload::Run(_) => format!("v1/runs/{run}"),
            Upload::Config(_) => format!("v1/runs/{run}/config"),
            Upload::Record(_) => format!("v1/runs/{run}/records"),
            Upload::Exit(_) => format!("v1/runs/{run}/exit"),
        }
    }

    async fn send(&self, ctx: &RequestContext, upload: Upload<'_>) -> Result<(), ClientError> {
        let url = self.client.http().url(&self.route(&upload))?;
        let response = match upload {
            Upload::Run(record) => {
                self.client
                    .execute(ctx, Some(upsert_retry_policy), |c| {
                        c.put(url.clone()).json(record)
                    })
                    .await?
            }
            Upload::Config(config) => {
                self.client
                    .execute(ctx, Some(upsert_retry_policy), |c| {
                        c.put(url.clone()).json(config)
                    })
                    .await?
            }
            Upload::Record(record) | Upload::Exit(record) => {
                self.client
                    .execute(ctx, None, |c| c.post(url.clone()).json(record))
                    .await?
            }
        };
        debug!(status = response.status().as_u16(), kind = upload.kind(), "Uploaded");
        Ok(())
    }
}

impl Uploader for HttpUploader {
    async fn upload(&self, ctx: &RequestContext, upload: Upload<'_>) -> Result<(), UploadError> {
        let kind = upload.kind();
        self.send(ctx, upload)
            .await
            .map_err(|source| UploadError::Client { kind, source })
    }
}

/// Accepts everything and sends nothing; records stay in the transaction log.
#[derive(Debug, Default, Clone, Copy)]
pub struct OfflineUploader;

impl Uploader for OfflineUploader {
    async fn upload(&self, _ctx: &RequestContext, upload: Upload<'_>) -> Result<(), UploadError> {
        debug!(kind = upload.kind(), "Offline, not uploading");
        Ok(())
    }
}
