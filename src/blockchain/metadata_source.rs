//! Where organization metadata comes from
//!
//! The listener re-fetches metadata after every on-chain update event, so a
//! source must always return the canonical current document.

use async_trait::async_trait;
use std::path::PathBuf;
use std::time::Duration;
use tracing::debug;

use super::metadata::OrganizationMetaData;
use crate::types::{Result, TollgateError};

const DEFAULT_FETCH_TIMEOUT: Duration = Duration::from_secs(30);

#[async_trait]
pub trait MetadataSource: Send + Sync {
    async fn fetch(&self, org_id: &str) -> Result<OrganizationMetaData>;
}

/// Fetches metadata over HTTP. `{org_id}` in the URL template is replaced with
/// the organization id.
pub struct HttpMetadataSource {
    client: reqwest::Client,
    url_template: String,
    group_name: String,
}

impl HttpMetadataSource {
    pub fn new(url_template: impl Into<String>, group_name: impl Into<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(DEFAULT_FETCH_TIMEOUT)
            .build()
            .map_err(|e| TollgateError::Config(format!("HTTP client: {}", e)))?;
        Ok(Self {
            client,
            url_template: url_template.into(),
            group_name: group_name.into(),
        })
    }

    pub fn url_for(&self, org_id: &str) -> String {
        self.url_template.replace("{org_id}", org_id)
    }
}

#[async_trait]
impl MetadataSource for HttpMetadataSource {
    async fn fetch(&self, org_id: &str) -> Result<OrganizationMetaData> {
        let url = self.url_for(org_id);
        debug!(url = %url, "Fetching organization metadata");

        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| TollgateError::Metadata(format!("GET {} failed: {}", url, e)))?;
        if !response.status().is_success() {
            return Err(TollgateError::Metadata(format!(
                "GET {} returned {}",
                url,
                response.status()
            )));
        }
        let body = response
            .bytes()
            .await
            .map_err(|e| TollgateError::Metadata(format!("reading {} failed: {}", url, e)))?;

        OrganizationMetaData::from_json(&body, &self.group_name)
    }
}

/// Reads metadata from a local JSON file on every fetch
pub struct FileMetadataSource {
    path: PathBuf,
    group_name: String,
}

impl FileMetadataSource {
    pub fn new(path: impl Into<PathBuf>, group_name: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            group_name: group_name.into(),
        }
    }
}

#[async_trait]
impl MetadataSource for FileMetadataSource {
    async fn fetch(&self, org_id: &str) -> Result<OrganizationMetaData> {
        let raw = tokio::fs::read(&self.path).await.map_err(|e| {
            TollgateError::Metadata(format!("reading {} failed: {}", self.path.display(), e))
        })?;
        let metadata = OrganizationMetaData::from_json(&raw, &self.group_name)?;
        if metadata.org_id != org_id {
            return Err(TollgateError::Metadata(format!(
                "{} describes organization {}, expected {}",
                self.path.display(),
                metadata.org_id,
                org_id
            )));
        }
        Ok(metadata)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blockchain::metadata::tests::metadata_json;

    #[test]
    fn test_url_template() {
        let source = HttpMetadataSource::new("https://meta.example.com/orgs/{org_id}.json", "g").unwrap();
        assert_eq!(
            source.url_for("snet"),
            "https://meta.example.com/orgs/snet.json"
        );
    }

    #[tokio::test]
    async fn test_file_source_checks_org() {
        let path = std::env::temp_dir().join(format!("tollgate-meta-{}.json", uuid::Uuid::new_v4()));
        tokio::fs::write(&path, metadata_json(&["http://127.0.0.1:2379"]))
            .await
            .unwrap();

        let source = FileMetadataSource::new(path.clone(), "default_group");
        let metadata = source.fetch("test_org_id").await.unwrap();
        assert_eq!(metadata.group_id(), "99ybRIg2wAx55mqVsA6sB4S7WxPQHNKqa4BPu/bhj+U=");
        assert!(source.fetch("another_org").await.is_err());

        let _ = tokio::fs::remove_file(&path).await;
    }
}
