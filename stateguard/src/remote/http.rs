//! Remote store speaking plain HTTP object semantics.
//!
//! `PUT {base}/{key}` uploads, `GET {base}/{key}` downloads, `DELETE` removes
//! and `GET {base}?prefix=...` returns a JSON array of [`RemoteObject`].

use async_trait::async_trait;
use futures_util::StreamExt;
use reqwest::header::{AUTHORIZATION, CONTENT_LENGTH};
use reqwest::{Client, RequestBuilder, StatusCode};
use std::path::Path;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio_util::io::ReaderStream;
use tracing::debug;

use super::progress::{format_bytes, ProgressStream};
use super::{RemoteObject, RemoteStore};
use crate::utils::errors::{Result, StateguardError};

/// Log upload progress every 64 MiB
const PROGRESS_STEP: u64 = 64 * 1024 * 1024;

pub struct HttpRemote {
    base_url: String,
    token: Option<String>,
    client: Client,
}

impl HttpRemote {
    pub fn new(base_url: impl Into<String>, token: Option<String>, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .connect_timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token,
            client,
        })
    }

    fn url(&self, key: &str) -> String {
        format!("{}/{}", self.base_url, key.trim_start_matches('/'))
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.token {
            Some(token) => request.header(AUTHORIZATION, format!("Bearer {token}")),
            None => request,
        }
    }
}

#[async_trait]
impl RemoteStore for HttpRemote {
    fn describe(&self) -> String {
        self.base_url.clone()
    }

    async fn upload(&self, local: &Path, key: &str) -> Result<()> {
        let file = tokio::fs::File::open(local).await?;
        let size = file.metadata().await?.len();

        let label = key.to_string();
        let stream = ProgressStream::new(
            ReaderStream::new(file),
            PROGRESS_STEP,
            move |sent| {
                debug!(key = %label, "Uploaded {} of {}", format_bytes(sent), format_bytes(size));
            },
        );

        self.authorize(self.client.put(self.url(key)))
            .header(CONTENT_LENGTH, size)
            .body(reqwest::Body::wrap_stream(stream))
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }

    async fn download(&self, key: &str, local: &Path) -> Result<()> {
        let response = self.authorize(self.client.get(self.url(key))).send().await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Err(StateguardError::ManifestNotFound(format!(
                "{key} is not in {}",
                self.base_url
            )));
        }
        let response = response.error_for_status()?;

        let mut file = tokio::fs::File::create(local).await?;
        let mut body = response.bytes_stream();
        while let Some(chunk) = body.next().await {
            file.write_all(&chunk?).await?;
        }
        file.flush().await?;
        Ok(())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<RemoteObject>> {
        let objects = self
            .authorize(self.client.get(&self.base_url))
            .query(&[("prefix", prefix)])
            .send()
            .await?
            .error_for_status()?
            .json::<Vec<RemoteObject>>()
            .await?;
        Ok(objects)
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let response = self.authorize(self.client.delete(self.url(key))).send().await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(());
        }
        response.error_for_status()?;
        Ok(())
    }
}
