//! Network side of the pipeline: the HTTP client, its retry loop and the
//! uploaders the sender stage delivers through.

pub mod client;
pub mod retry_client;
pub mod uploader;

pub use client::{ClientConfig, ClientError, ClientStatsSnapshot, HttpClient};
pub use retry_client::RetryClient;
pub use uploader::{HttpUploader, OfflineUploader, Upload, UploadError, Uploader};
