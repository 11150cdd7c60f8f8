//! Values that flow through the lookup pipeline.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::fmt;
use std::num::NonZeroUsize;
use std::time::Duration;

use crate::error::LookupError;

/// Path that selects URL input; every other path selects inline input.
pub const URL_ROUTE: &str = "/postURL";

/// How the request carries its image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputMode {
    /// `url` field, fetched over HTTP
    Url,
    /// `base64img` field, decoded in place
    Inline,
}

impl InputMode {
    pub fn from_path(path: &str) -> Self {
        if path == URL_ROUTE {
            InputMode::Url
        } else {
            InputMode::Inline
        }
    }

    /// Body field holding the image source for this mode.
    pub fn field(&self) -> &'static str {
        match self {
            InputMode::Url => "url",
            InputMode::Inline => "base64img",
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            InputMode::Url => "url",
            InputMode::Inline => "inline",
        }
    }
}

/// Where the query image comes from.
#[derive(Clone, PartialEq, Eq)]
pub enum ImageSource {
    Url(String),
    Inline(String),
}

impl ImageSource {
    pub fn mode(&self) -> InputMode {
        match self {
            ImageSource::Url(_) => InputMode::Url,
            ImageSource::Inline(_) => InputMode::Inline,
        }
    }
}

// Inline payloads can be megabytes of base64; keep them out of logs.
impl fmt::Debug for ImageSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ImageSource::Url(url) => f.debug_tuple("Url").field(url).finish(),
            ImageSource::Inline(data) => write!(f, "Inline(<{} chars>)", data.len()),
        }
    }
}

/// One validated lookup request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LookupRequest {
    pub neighbor_count: NonZeroUsize,
    pub source: ImageSource,
}

impl LookupRequest {
    pub fn new(neighbor_count: NonZeroUsize, source: ImageSource) -> Self {
        Self {
            neighbor_count,
            source,
        }
    }

    /// Parse and validate a JSON request body.
    ///
    /// `k` must be an integer in `1..=max_neighbors`; the image field is
    /// chosen by `mode`. Any violation is a `BadRequest`.
    pub fn from_body(
        mode: InputMode,
        body: &[u8],
        max_neighbors: usize,
    ) -> Result<Self, LookupError> {
        let value: JsonValue = serde_json::from_slice(body)
            .map_err(|e| LookupError::BadRequest(format!("body is not valid JSON: {}", e)))?;
        let object = value
            .as_object()
            .ok_or_else(|| LookupError::BadRequest("body must be a JSON object".to_string()))?;

        let k = object
            .get("k")
            .ok_or_else(|| LookupError::BadRequest("missing required field 'k'".to_string()))?;
        let k = k
            .as_i64()
            .ok_or_else(|| LookupError::BadRequest(format!("'k' must be an integer, got {}", k)))?;
        if k < 1 {
            return Err(LookupError::BadRequest(format!(
                "'k' must be at least 1, got {}",
                k
            )));
        }
        let k = usize::try_from(k)
            .ok()
            .filter(|k| *k <= max_neighbors)
            .and_then(NonZeroUsize::new)
            .ok_or_else(|| {
                LookupError::BadRequest(format!("'k' must be at most {}, got {}", max_neighbors, k))
            })?;

        let field = mode.field();
        let source = object
            .get(field)
            .ok_or_else(|| LookupError::BadRequest(format!("missing required field '{}'", field)))?
            .as_str()
            .ok_or_else(|| LookupError::BadRequest(format!("'{}' must be a string", field)))?
            .to_string();

        let source = match mode {
            InputMode::Url => ImageSource::Url(source),
            InputMode::Inline => ImageSource::Inline(source),
        };
        Ok(Self::new(k, source))
    }
}

/// Raw image bytes handed to the inference endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageBuffer {
    pub bytes: Bytes,
}

impl ImageBuffer {
    /// Content type the inference endpoint expects.
    pub const CONTENT_TYPE: &'static str = "application/x-image";

    pub fn new(bytes: impl Into<Bytes>) -> Self {
        Self {
            bytes: bytes.into(),
        }
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

/// Embedding produced by the inference endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FeatureVector(pub Vec<f32>);

impl FeatureVector {
    pub fn as_slice(&self) -> &[f32] {
        &self.0
    }

    pub fn dim(&self) -> usize {
        self.0.len()
    }
}

/// Location of one catalog image in the object store.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CatalogReference {
    pub bucket: String,
    pub key: String,
}

impl CatalogReference {
    pub fn new(bucket: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            key: key.into(),
        }
    }
}

impl fmt::Display for CatalogReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "s3://{}/{}", self.bucket, self.key)
    }
}

/// Time-limited download URL for one catalog reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedLink {
    pub url: String,
    pub expires_in: Duration,
}

/// Success body: signed links, nearest first.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LookupResponse {
    pub images: Vec<String>,
}

impl From<Vec<SignedLink>> for LookupResponse {
    fn from(links: Vec<SignedLink>) -> Self {
        Self {
            images: links.into_iter().map(|l| l.url).collect(),
        }
    }
}
