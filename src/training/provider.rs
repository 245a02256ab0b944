//! Training-status provider
//!
//! The external authority on where a model's validation or training stands.
//! Queries must be side-effect free on the daemon's own state; the
//! reconciliation loop may repeat them freely.

use async_trait::async_trait;
use serde::Deserialize;
use std::time::Duration;

use super::models::{ModelData, Status};
use crate::types::{Result, TollgateError};

const DEFAULT_PROVIDER_TIMEOUT: Duration = Duration::from_secs(30);

#[async_trait]
pub trait TrainingStatusProvider: Send + Sync {
    async fn model_status(&self, model: &ModelData) -> Result<Status>;
}

#[derive(Debug, Deserialize)]
struct StatusResponse {
    status: String,
}

/// Queries `GET {endpoint}/models/{org}/{service}/{group}/{model_id}/status`
pub struct HttpTrainingProvider {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpTrainingProvider {
    pub fn new(endpoint: impl Into<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(DEFAULT_PROVIDER_TIMEOUT)
            .build()
            .map_err(|e| TollgateError::Config(format!("HTTP client: {}", e)))?;
        Ok(Self {
            client,
            endpoint: endpoint.into().trim_end_matches('/').to_string(),
        })
    }

    pub fn status_url(&self, model: &ModelData) -> Result<reqwest::Url> {
        let invalid = |reason: String| {
            TollgateError::Provider(format!("bad provider endpoint {}: {}", self.endpoint, reason))
        };
        let mut url = reqwest::Url::parse(&self.endpoint).map_err(|e| invalid(e.to_string()))?;
        url.path_segments_mut()
            .map_err(|_| invalid("cannot be a base URL".into()))?
            .pop_if_empty()
            .extend([
                "models",
                model.organization_id.as_str(),
                model.service_id.as_str(),
                model.group_id.as_str(),
                model.model_id.as_str(),
                "status",
            ]);
        Ok(url)
    }
}

#[async_trait]
impl TrainingStatusProvider for HttpTrainingProvider {
    async fn model_status(&self, model: &ModelData) -> Result<Status> {
        let url = self.status_url(model)?;

        let response = self
            .client
            .get(url.clone())
            .send()
            .await
            .map_err(|e| TollgateError::Provider(format!("GET {} failed: {}", url, e)))?;
        if !response.status().is_success() {
            return Err(TollgateError::Provider(format!(
                "GET {} returned {}",
                url,
                response.status()
            )));
        }

        let body: StatusResponse = response
            .json()
            .await
            .map_err(|e| TollgateError::Provider(format!("bad response from {}: {}", url, e)))?;
        body.status
            .parse()
            .map_err(|_| TollgateError::Provider(format!("unknown status {:?}", body.status)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::training::models::tests::sample_model;

    #[test]
    fn test_status_url_escapes_segments() {
        let provider = HttpTrainingProvider::new("http://trainer:9000/api/").unwrap();
        let mut model = sample_model("7", Status::Training);
        model.group_id = "99yb/bhj+U=".into();

        let url = provider.status_url(&model).unwrap();
        assert_eq!(
            url.as_str(),
            "http://trainer:9000/api/models/org1/svc1/99yb%2Fbhj+U=/7/status"
        );
    }

    #[test]
    fn test_bad_endpoint() {
        let provider = HttpTrainingProvider::new("not a url").unwrap();
        let model = sample_model("7", Status::Training);
        assert!(matches!(
            provider.status_url(&model),
            Err(TollgateError::Provider(_))
        ));
    }
}
