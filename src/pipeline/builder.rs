//! Pipeline builder: wires stage handles into a [`SimilarityPipeline`].

use aws_config::{BehaviorVersion, Region};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use super::{
    CredentialCache, FeatureExtractor, InputResolver, LinkSigner, NeighborIndex,
    OpenSearchIndex, S3LinkSigner, SageMakerExtractor, SimilarityPipeline,
};
use crate::config::{ServiceConfig, DEFAULT_LINK_EXPIRY_SECS};
use crate::error::{Error, Result};

/// Builder for [`SimilarityPipeline`].
///
/// Every stage must be supplied; tests pass fakes, [`PipelineBuilder::connect`]
/// builds the AWS-backed handles.
pub struct PipelineBuilder {
    resolver: Option<InputResolver>,
    extractor: Option<Arc<dyn FeatureExtractor>>,
    index: Option<Arc<dyn NeighborIndex>>,
    signer: Option<Arc<dyn LinkSigner>>,
    link_expiry: Duration,
}

impl Default for PipelineBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl PipelineBuilder {
    pub fn new() -> Self {
        Self {
            resolver: None,
            extractor: None,
            index: None,
            signer: None,
            link_expiry: Duration::from_secs(DEFAULT_LINK_EXPIRY_SECS),
        }
    }

    /// Set the input resolver
    pub fn resolver(mut self, resolver: InputResolver) -> Self {
        self.resolver = Some(resolver);
        self
    }

    /// Set the feature extractor
    pub fn extractor(mut self, extractor: Arc<dyn FeatureExtractor>) -> Self {
        self.extractor = Some(extractor);
        self
    }

    /// Set the neighbor index
    pub fn index(mut self, index: Arc<dyn NeighborIndex>) -> Self {
        self.index = Some(index);
        self
    }

    /// Set the link signer
    pub fn signer(mut self, signer: Arc<dyn LinkSigner>) -> Self {
        self.signer = Some(signer);
        self
    }

    /// Set the lifetime of issued links
    pub fn link_expiry(mut self, expiry: Duration) -> Self {
        self.link_expiry = expiry;
        self
    }

    /// Build the AWS-backed stages from configuration.
    ///
    /// Resolves ambient credentials once; the clients are then reused for
    /// the life of the process.
    pub async fn connect(config: &ServiceConfig) -> Result<Self> {
        let sdk_config = aws_config::defaults(BehaviorVersion::latest())
            .region(Region::new(config.region.clone()))
            .load()
            .await;

        let provider = sdk_config
            .credentials_provider()
            .ok_or_else(|| Error::Aws("no AWS credentials provider available".to_string()))?;
        let credentials = CredentialCache::new(provider, config.search.credential_refresh());

        let extractor = SageMakerExtractor::new(
            aws_sdk_sagemakerruntime::Client::new(&sdk_config),
            config.inference.endpoint_name.clone(),
            config.inference.timeout(),
        );
        let index = OpenSearchIndex::new(
            &config.search,
            config.region.clone(),
            config.storage.bucket.clone(),
            credentials,
        )?;
        let signer = S3LinkSigner::new(aws_sdk_s3::Client::new(&sdk_config));

        info!(
            region = %config.region,
            endpoint = %config.inference.endpoint_name,
            search = %index.search_url(),
            bucket = %config.storage.bucket,
            "AWS clients initialized"
        );

        Ok(Self::new()
            .resolver(InputResolver::new(&config.download)?)
            .extractor(Arc::new(extractor))
            .index(Arc::new(index))
            .signer(Arc::new(signer))
            .link_expiry(config.storage.link_expiry()))
    }

    /// Build the pipeline
    pub fn build(self) -> Result<SimilarityPipeline> {
        let missing = |stage: &str| Error::Config(format!("pipeline is missing its {}", stage));
        Ok(SimilarityPipeline {
            resolver: self.resolver.ok_or_else(|| missing("input resolver"))?,
            extractor: self.extractor.ok_or_else(|| missing("feature extractor"))?,
            index: self.index.ok_or_else(|| missing("neighbor index"))?,
            signer: self.signer.ok_or_else(|| missing("link signer"))?,
            link_expiry: self.link_expiry,
        })
    }
}
