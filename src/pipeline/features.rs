//! Feature extraction through a hosted inference endpoint.

use async_trait::async_trait;
use aws_sdk_sagemakerruntime::error::DisplayErrorContext;
use aws_sdk_sagemakerruntime::primitives::Blob;
use serde::Deserialize;
use std::time::Duration;
use tracing::debug;

use crate::error::LookupError;
use crate::model::{FeatureVector, ImageBuffer};

/// Turns an image into a feature vector.
///
/// Implementations hold only connection configuration and are shared by
/// all in-flight requests.
#[async_trait]
pub trait FeatureExtractor: Send + Sync {
    /// Short name used in logs
    fn name(&self) -> &'static str {
        "feature-extractor"
    }

    async fn extract(&self, image: &ImageBuffer) -> Result<FeatureVector, LookupError>;
}

/// [`FeatureExtractor`] backed by a SageMaker runtime endpoint.
#[derive(Debug, Clone)]
pub struct SageMakerExtractor {
    client: aws_sdk_sagemakerruntime::Client,
    endpoint_name: String,
    timeout: Duration,
}

impl SageMakerExtractor {
    pub fn new(
        client: aws_sdk_sagemakerruntime::Client,
        endpoint_name: impl Into<String>,
        timeout: Duration,
    ) -> Self {
        Self {
            client,
            endpoint_name: endpoint_name.into(),
            timeout,
        }
    }
}

#[async_trait]
impl FeatureExtractor for SageMakerExtractor {
    fn name(&self) -> &'static str {
        "sagemaker"
    }

    async fn extract(&self, image: &ImageBuffer) -> Result<FeatureVector, LookupError> {
        let call = self
            .client
            .invoke_endpoint()
            .endpoint_name(&self.endpoint_name)
            .content_type(ImageBuffer::CONTENT_TYPE)
            .body(Blob::new(image.bytes.to_vec()))
            .send();

        let output = tokio::time::timeout(self.timeout, call)
            .await
            .map_err(|_| {
                LookupError::InferenceFailure(format!(
                    "endpoint '{}' did not answer within {:?}",
                    self.endpoint_name, self.timeout
                ))
            })?
            .map_err(|e| LookupError::InferenceFailure(DisplayErrorContext(&e).to_string()))?;

        let body = output.body().ok_or_else(|| {
            LookupError::InferenceResponseInvalid("endpoint returned no body".to_string())
        })?;
        let features = parse_predictions(body.as_ref())?;
        debug!(dim = features.dim(), endpoint = %self.endpoint_name, "extracted features");
        Ok(features)
    }
}

#[derive(Deserialize)]
struct PredictionResponse {
    predictions: Vec<serde_json::Value>,
}

/// Parse `{"predictions": [[...], ...]}` and return the first vector.
///
/// Only the first prediction is validated; any others are ignored.
pub fn parse_predictions(body: &[u8]) -> Result<FeatureVector, LookupError> {
    let response: PredictionResponse = serde_json::from_slice(body)
        .map_err(|e| LookupError::InferenceResponseInvalid(e.to_string()))?;
    let first = response
        .predictions
        .into_iter()
        .next()
        .ok_or_else(|| LookupError::InferenceResponseInvalid("'predictions' is empty".to_string()))?;
    let first: Vec<f32> = serde_json::from_value(first).map_err(|e| {
        LookupError::InferenceResponseInvalid(format!("first prediction is not a vector: {}", e))
    })?;
    if first.is_empty() {
        return Err(LookupError::InferenceResponseInvalid(
            "first prediction has no components".to_string(),
        ));
    }
    Ok(FeatureVector(first))
}
