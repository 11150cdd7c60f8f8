//! Nearest-neighbor lookup against a k-NN vector index.

use async_trait::async_trait;
use aws_sigv4::http_request::{sign, SignableBody, SignableRequest, SigningSettings};
use aws_sigv4::sign::v4;
use reqwest::header::CONTENT_TYPE;
use reqwest::{StatusCode, Url};
use serde::Deserialize;
use serde_json::{json, Value as JsonValue};
use std::num::NonZeroUsize;
use std::time::{Duration, SystemTime};
use tracing::{debug, warn};

use super::credentials::CredentialCache;
use crate::config::SearchConfig;
use crate::error::{Error, LookupError, Result};
use crate::model::{CatalogReference, FeatureVector};

/// SigV4 service name for managed OpenSearch domains.
pub const SIGNING_SERVICE: &str = "es";

/// Finds the catalog entries closest to a feature vector.
#[async_trait]
pub trait NeighborIndex: Send + Sync {
    fn name(&self) -> &'static str {
        "neighbor-index"
    }

    /// Return at most `k` references, nearest first.
    async fn nearest(
        &self,
        features: &FeatureVector,
        k: NonZeroUsize,
    ) -> std::result::Result<Vec<CatalogReference>, LookupError>;
}

/// Build the k-NN query body for `field`.
pub fn knn_query(field: &str, vector: &[f32], k: usize) -> JsonValue {
    json!({
        "size": k,
        "query": {
            "knn": {
                field: {
                    "vector": vector,
                    "k": k,
                }
            }
        }
    })
}

#[derive(Deserialize)]
struct SearchResponse {
    hits: SearchHits,
}

#[derive(Deserialize)]
struct SearchHits {
    hits: Vec<SearchHit>,
}

#[derive(Deserialize)]
struct SearchHit {
    #[serde(rename = "_source", default)]
    source: Option<JsonValue>,
}

/// Map a search response to catalog references in `bucket`.
///
/// Keeps the index's order and takes at most `k` hits. Every hit must carry
/// a string `image` field with the object key.
pub fn parse_hits(
    body: &[u8],
    bucket: &str,
    k: usize,
) -> std::result::Result<Vec<CatalogReference>, LookupError> {
    let response: SearchResponse = serde_json::from_slice(body)
        .map_err(|e| LookupError::search(format!("unexpected search response: {}", e)))?;

    response
        .hits
        .hits
        .into_iter()
        .take(k)
        .enumerate()
        .map(|(rank, hit)| {
            hit.source
                .as_ref()
                .and_then(|s| s.get("image"))
                .and_then(|v| v.as_str())
                .map(|key| CatalogReference::new(bucket, key))
                .ok_or_else(|| {
                    LookupError::search(format!("hit {} has no string 'image' field", rank))
                })
        })
        .collect()
}

/// [`NeighborIndex`] backed by an OpenSearch k-NN index, signed with SigV4.
#[derive(Debug)]
pub struct OpenSearchIndex {
    client: reqwest::Client,
    search_url: Url,
    vector_field: String,
    bucket: String,
    region: String,
    timeout: Duration,
    credentials: CredentialCache,
}

impl OpenSearchIndex {
    pub fn new(
        config: &SearchConfig,
        region: impl Into<String>,
        bucket: impl Into<String>,
        credentials: CredentialCache,
    ) -> Result<Self> {
        let client = reqwest::Client::builder()
            .build()
            .map_err(|e| Error::Api(format!("failed to build search client: {}", e)))?;

        Ok(Self {
            client,
            search_url: search_url(&config.endpoint, &config.index)?,
            vector_field: config.vector_field.clone(),
            bucket: bucket.into(),
            region: region.into(),
            timeout: config.timeout(),
            credentials,
        })
    }

    pub fn search_url(&self) -> &Url {
        &self.search_url
    }

    async fn signed_headers(
        &self,
        body: &[u8],
    ) -> std::result::Result<Vec<(String, String)>, LookupError> {
        let credentials = self
            .credentials
            .get()
            .await
            .map_err(|e| LookupError::search(format!("no credentials for search: {}", e)))?;
        let identity = credentials.into();

        let params = v4::SigningParams::builder()
            .identity(&identity)
            .region(&self.region)
            .name(SIGNING_SERVICE)
            .time(SystemTime::now())
            .settings(SigningSettings::default())
            .build()
            .map_err(|e| LookupError::search(format!("invalid signing parameters: {}", e)))?
            .into();

        let headers = [("content-type", "application/json")];
        let signable = SignableRequest::new(
            "POST",
            self.search_url.as_str(),
            headers.into_iter(),
            SignableBody::Bytes(body),
        )
        .map_err(|e| LookupError::search(format!("cannot sign search request: {}", e)))?;

        let (instructions, _signature) = sign(signable, &params)
            .map_err(|e| LookupError::search(format!("cannot sign search request: {}", e)))?
            .into_parts();

        Ok(instructions
            .headers()
            .map(|(name, value)| (name.to_string(), value.to_string()))
            .collect())
    }
}

#[async_trait]
impl NeighborIndex for OpenSearchIndex {
    fn name(&self) -> &'static str {
        "opensearch"
    }

    async fn nearest(
        &self,
        features: &FeatureVector,
        k: NonZeroUsize,
    ) -> std::result::Result<Vec<CatalogReference>, LookupError> {
        let query = knn_query(&self.vector_field, features.as_slice(), k.get());
        let body = serde_json::to_vec(&query)
            .map_err(|e| LookupError::search(format!("cannot encode query: {}", e)))?;

        let mut request = self
            .client
            .post(self.search_url.clone())
            .timeout(self.timeout)
            .header(CONTENT_TYPE, "application/json");
        for (name, value) in self.signed_headers(&body).await? {
            request = request.header(name, value);
        }

        let response = request.body(body).send().await.map_err(|e| {
            if e.is_timeout() {
                LookupError::SearchFailure {
                    reason: format!("query exceeded {:?}", self.timeout),
                    timed_out: true,
                }
            } else {
                LookupError::search(format!("search request failed: {}", e))
            }
        })?;

        let status = response.status();
        let payload = response.bytes().await.map_err(|e| {
            if e.is_timeout() {
                LookupError::SearchFailure {
                    reason: format!("query exceeded {:?}", self.timeout),
                    timed_out: true,
                }
            } else {
                LookupError::search(format!("failed to read search response: {}", e))
            }
        })?;

        if !status.is_success() {
            if matches!(status, StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN) {
                warn!(%status, "search rejected credentials, dropping cached credentials");
                self.credentials.invalidate().await;
            }
            let snippet: String = String::from_utf8_lossy(&payload).chars().take(200).collect();
            return Err(LookupError::search(format!(
                "index returned HTTP {}: {}",
                status, snippet
            )));
        }

        let references = parse_hits(&payload, &self.bucket, k.get())?;
        debug!(requested = k.get(), found = references.len(), "nearest neighbors located");
        Ok(references)
    }
}

/// Accepts a bare host (`https` assumed) or a full base URL.
fn search_url(endpoint: &str, index: &str) -> Result<Url> {
    let endpoint = endpoint.trim().trim_end_matches('/');
    let base = if endpoint.starts_with("http://") || endpoint.starts_with("https://") {
        endpoint.to_string()
    } else {
        format!("https://{}", endpoint)
    };
    Url::parse(&format!("{}/{}/_search", base, index))
        .map_err(|e| Error::Config(format!("invalid search endpoint '{}': {}", endpoint, e)))
}
