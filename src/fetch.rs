//! Retrieval of raw upload bytes from the storage service.
//!
//! The HTTP API never trusts a caller-supplied address: [`StorageLocator`]
//! derives it from `[ingest].storage_base_url` and the upload's storage key,
//! and the server's fetcher is [`scoped`](StorageFetcher::scoped) to that
//! base. `http(s)://` addresses are downloaded with `reqwest`; `file://` URLs
//! and bare paths are read from the local filesystem, which is what the CLI
//! `ingest` command uses.

use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;

use crate::error::IngestError;

#[async_trait]
pub trait ContentFetcher: Send + Sync {
    async fn fetch(&self, address: &str) -> Result<Vec<u8>>;
}

/// Maps storage keys onto retrieval addresses under one base URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageLocator {
    base: String,
}

impl StorageLocator {
    pub fn new(base_url: &str) -> Self {
        Self {
            base: base_url.trim_end_matches('/').to_string(),
        }
    }

    pub fn base(&self) -> &str {
        &self.base
    }

    /// `{base}/{storage_key}`. Keys are relative paths of plain URL-safe
    /// characters; `.` and `..` segments are rejected.
    pub fn address(&self, storage_key: &str) -> Result<String, IngestError> {
        check_storage_key(storage_key)
            .map_err(|reason| IngestError::BadRequest(format!("storageKey {}", reason)))?;
        Ok(format!("{}/{}", self.base, storage_key))
    }
}

fn check_storage_key(key: &str) -> Result<(), &'static str> {
    if key.is_empty() {
        return Err("must not be empty");
    }
    if !key
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | '~' | '/'))
    {
        return Err("contains unsupported characters");
    }
    if key
        .split('/')
        .any(|segment| segment.is_empty() || segment == "." || segment == "..")
    {
        return Err("must be a relative path without empty, '.' or '..' segments");
    }
    Ok(())
}

pub struct StorageFetcher {
    client: reqwest::Client,
    scope: Option<String>,
}

impl StorageFetcher {
    /// A fetcher that reads any URL or local path.
    pub fn new(timeout_secs: u64) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .build()?;
        Ok(Self {
            client,
            scope: None,
        })
    }

    /// Refuse every address that is not a valid key under `locator`'s base.
    pub fn scoped(mut self, locator: &StorageLocator) -> Self {
        self.scope = Some(format!("{}/", locator.base()));
        self
    }

    fn check_scope(&self, address: &str) -> Result<()> {
        let Some(prefix) = &self.scope else {
            return Ok(());
        };
        match address.strip_prefix(prefix.as_str()) {
            Some(key) if check_storage_key(key).is_ok() => Ok(()),
            _ => bail!("address {} is outside the storage service", address),
        }
    }
}

#[async_trait]
impl ContentFetcher for StorageFetcher {
    async fn fetch(&self, address: &str) -> Result<Vec<u8>> {
        self.check_scope(address)?;

        if address.starts_with("http://") || address.starts_with("https://") {
            let response = self
                .client
                .get(address)
                .send()
                .await
                .with_context(|| format!("request to {} failed", address))?;
            let status = response.status();
            if !status.is_success() {
                bail!("storage returned {} for {}", status, address);
            }
            let bytes = response.bytes().await?;
            return Ok(bytes.to_vec());
        }

        let path = address.strip_prefix("file://").unwrap_or(address);
        tokio::fs::read(path)
            .await
            .with_context(|| format!("failed to read {}", path))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn reads_file_urls_and_paths() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("doc.txt");
        std::fs::write(&path, b"page one").unwrap();

        let fetcher = StorageFetcher::new(5).unwrap();
        let by_path = fetcher.fetch(path.to_str().unwrap()).await.unwrap();
        let by_url = fetcher
            .fetch(&format!("file://{}", path.display()))
            .await
            .unwrap();
        assert_eq!(by_path, b"page one");
        assert_eq!(by_url, by_path);
    }

    #[tokio::test]
    async fn missing_file_is_an_error() {
        let fetcher = StorageFetcher::new(5).unwrap();
        let err = fetcher.fetch("/nonexistent/upload.pdf").await.unwrap_err();
        assert!(err.to_string().contains("failed to read"));
    }

    #[test]
    fn locator_joins_base_and_key() {
        let locator = StorageLocator::new("https://utfs.io/f/");
        assert_eq!(
            locator.address("abc123-report.pdf").unwrap(),
            "https://utfs.io/f/abc123-report.pdf"
        );
        assert_eq!(
            locator.address("uploads/q3.txt").unwrap(),
            "https://utfs.io/f/uploads/q3.txt"
        );
    }

    #[test]
    fn locator_rejects_keys_that_escape_the_base() {
        let locator = StorageLocator::new("file:///srv/uploads");
        for key in [
            "",
            "../docchat.sqlite",
            "a/../../etc/passwd",
            "/etc/passwd",
            "a//b",
            "x?y=1",
            "http://evil.example/x",
            "./a",
        ] {
            let err = locator.address(key).unwrap_err();
            assert!(matches!(err, IngestError::BadRequest(_)), "accepted {:?}", key);
        }
    }

    #[tokio::test]
    async fn scoped_fetcher_only_reads_under_its_base() {
        let tmp = TempDir::new().unwrap();
        let store = tmp.path().join("store");
        std::fs::create_dir_all(&store).unwrap();
        std::fs::write(store.join("doc.txt"), b"inside").unwrap();
        let secret = tmp.path().join("secret.toml");
        std::fs::write(&secret, b"session_secret = \"s\"").unwrap();

        let locator = StorageLocator::new(&format!("file://{}", store.display()));
        let fetcher = StorageFetcher::new(5).unwrap().scoped(&locator);

        let inside = fetcher.fetch(&locator.address("doc.txt").unwrap()).await.unwrap();
        assert_eq!(inside, b"inside");

        for address in [
            format!("file://{}", secret.display()),
            secret.display().to_string(),
            format!("{}/../secret.toml", locator.base()),
            "http://169.254.169.254/latest/meta-data".to_string(),
        ] {
            let err = fetcher.fetch(&address).await.unwrap_err();
            assert!(
                err.to_string().contains("outside the storage service"),
                "fetched {}",
                address
            );
        }
    }
}
