//! The similarity-lookup pipeline.
//!
//! Four stages run strictly in sequence for every request:
//!
//! ```text
//! ┌───────────────┐   ┌──────────────────┐   ┌────────────────┐   ┌────────────────┐
//! │ InputResolver │──▶│ FeatureExtractor │──▶│ NeighborIndex  │──▶│ LinkSigner     │
//! │ url | base64  │   │ image → vector   │   │ vector → top-k │   │ ref → URL      │
//! └───────────────┘   └──────────────────┘   └────────────────┘   └────────────────┘
//! ```
//!
//! The first failing stage aborts the request. Stage handles are long-lived
//! and shared between concurrent requests.

mod builder;
pub mod credentials;
pub mod features;
pub mod input;
pub mod links;
pub mod neighbors;

pub use builder::PipelineBuilder;
pub use credentials::CredentialCache;
pub use features::{FeatureExtractor, SageMakerExtractor};
pub use input::InputResolver;
pub use links::{publish_links, LinkSigner, S3LinkSigner};
pub use neighbors::{NeighborIndex, OpenSearchIndex};

use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info};

use crate::error::LookupError;
use crate::metrics;
use crate::model::{LookupRequest, SignedLink};

/// Orchestrates one lookup across the four stages.
pub struct SimilarityPipeline {
    resolver: InputResolver,
    extractor: Arc<dyn FeatureExtractor>,
    index: Arc<dyn NeighborIndex>,
    signer: Arc<dyn LinkSigner>,
    link_expiry: Duration,
}

impl SimilarityPipeline {
    pub fn builder() -> PipelineBuilder {
        PipelineBuilder::new()
    }

    pub fn link_expiry(&self) -> Duration {
        self.link_expiry
    }

    /// Run resolve → extract → locate → publish.
    ///
    /// Returns at most `request.neighbor_count` links, nearest first.
    pub async fn lookup(&self, request: &LookupRequest) -> Result<Vec<SignedLink>, LookupError> {
        let started = Instant::now();
        let k = request.neighbor_count;

        let stage = Instant::now();
        let image = self.resolver.resolve(&request.source).await?;
        metrics::record_stage("resolve", stage.elapsed());
        debug!(bytes = image.len(), "image resolved");

        let stage = Instant::now();
        let features = self.extractor.extract(&image).await?;
        metrics::record_stage("extract", stage.elapsed());
        debug!(dim = features.dim(), extractor = self.extractor.name(), "features extracted");

        let stage = Instant::now();
        let mut references = self.index.nearest(&features, k).await?;
        metrics::record_stage("search", stage.elapsed());
        // an index that ignores `size` must not inflate the response
        references.truncate(k.get());
        debug!(found = references.len(), index = self.index.name(), "neighbors located");

        let stage = Instant::now();
        let links = publish_links(self.signer.as_ref(), &references, self.link_expiry).await?;
        metrics::record_stage("sign", stage.elapsed());

        info!(
            requested = k.get(),
            returned = links.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "lookup complete"
        );
        Ok(links)
    }
}

impl std::fmt::Debug for SimilarityPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SimilarityPipeline")
            .field("extractor", &self.extractor.name())
            .field("index", &self.index.name())
            .field("signer", &self.signer.name())
            .field("link_expiry", &self.link_expiry)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DownloadConfig;
    use crate::model::{CatalogReference, FeatureVector, ImageBuffer, ImageSource};
    use async_trait::async_trait;
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use std::num::NonZeroUsize;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    #[derive(Default)]
    struct FixedExtractor {
        calls: AtomicUsize,
        seen: Mutex<Vec<Vec<u8>>>,
    }

    #[async_trait]
    impl FeatureExtractor for FixedExtractor {
        async fn extract(&self, image: &ImageBuffer) -> Result<FeatureVector, LookupError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.seen.lock().unwrap().push(image.bytes.to_vec());
            Ok(FeatureVector(vec![0.1, 0.2, 0.3]))
        }
    }

    struct CatalogIndex {
        keys: Vec<&'static str>,
        calls: AtomicUsize,
        requested: Mutex<Vec<usize>>,
    }

    impl CatalogIndex {
        fn new(keys: Vec<&'static str>) -> Self {
            Self {
                keys,
                calls: AtomicUsize::new(0),
                requested: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl NeighborIndex for CatalogIndex {
        async fn nearest(
            &self,
            _features: &FeatureVector,
            k: NonZeroUsize,
        ) -> Result<Vec<CatalogReference>, LookupError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.requested.lock().unwrap().push(k.get());
            // deliberately ignores k to check the pipeline bound
            Ok(self
                .keys
                .iter()
                .map(|key| CatalogReference::new("training", *key))
                .collect())
        }
    }

    struct PlainSigner;

    #[async_trait]
    impl LinkSigner for PlainSigner {
        async fn sign(
            &self,
            reference: &CatalogReference,
            expires_in: Duration,
        ) -> Result<SignedLink, LookupError> {
            Ok(SignedLink {
                url: format!("https://{}.example/{}", reference.bucket, reference.key),
                expires_in,
            })
        }
    }

    fn pipeline(
        extractor: Arc<FixedExtractor>,
        index: Arc<CatalogIndex>,
    ) -> SimilarityPipeline {
        SimilarityPipeline::builder()
            .resolver(
                InputResolver::new(&DownloadConfig {
                    allow_private_hosts: true,
                    ..DownloadConfig::default()
                })
                .unwrap(),
            )
            .extractor(extractor)
            .index(index)
            .signer(Arc::new(PlainSigner))
            .build()
            .unwrap()
    }

    fn inline(k: usize, bytes: &[u8]) -> LookupRequest {
        LookupRequest::new(
            NonZeroUsize::new(k).unwrap(),
            ImageSource::Inline(STANDARD.encode(bytes)),
        )
    }

    #[tokio::test]
    async fn test_stages_run_in_order() {
        let extractor = Arc::new(FixedExtractor::default());
        let index = Arc::new(CatalogIndex::new(vec!["a.jpg", "b.jpg", "c.jpg"]));
        let p = pipeline(extractor.clone(), index.clone());

        let links = p.lookup(&inline(3, b"jpeg-bytes")).await.unwrap();

        assert_eq!(extractor.calls.load(Ordering::SeqCst), 1);
        assert_eq!(extractor.seen.lock().unwrap()[0], b"jpeg-bytes");
        assert_eq!(*index.requested.lock().unwrap(), vec![3]);
        let urls: Vec<&str> = links.iter().map(|l| l.url.as_str()).collect();
        assert_eq!(
            urls,
            vec![
                "https://training.example/a.jpg",
                "https://training.example/b.jpg",
                "https://training.example/c.jpg",
            ]
        );
    }

    #[tokio::test]
    async fn test_result_never_exceeds_k() {
        let index = Arc::new(CatalogIndex::new(vec!["a", "b", "c", "d"]));
        let p = pipeline(Arc::new(FixedExtractor::default()), index);
        assert_eq!(p.lookup(&inline(1, b"x")).await.unwrap().len(), 1);
        assert_eq!(p.lookup(&inline(2, b"x")).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_fewer_matches_than_k() {
        let index = Arc::new(CatalogIndex::new(vec!["only"]));
        let p = pipeline(Arc::new(FixedExtractor::default()), index);
        assert_eq!(p.lookup(&inline(5, b"x")).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_decode_failure_stops_pipeline() {
        let extractor = Arc::new(FixedExtractor::default());
        let index = Arc::new(CatalogIndex::new(vec!["a"]));
        let p = pipeline(extractor.clone(), index.clone());

        let request = LookupRequest::new(
            NonZeroUsize::new(1).unwrap(),
            ImageSource::Inline("***".into()),
        );
        let err = p.lookup(&request).await.unwrap_err();

        assert!(matches!(err, LookupError::DecodeFailure(_)));
        assert_eq!(extractor.calls.load(Ordering::SeqCst), 0);
        assert_eq!(index.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_repeated_lookup_targets_same_references() {
        let index = Arc::new(CatalogIndex::new(vec!["x.jpg", "y.jpg"]));
        let p = pipeline(Arc::new(FixedExtractor::default()), index);
        let first = p.lookup(&inline(2, b"same")).await.unwrap();
        let second = p.lookup(&inline(2, b"same")).await.unwrap();
        assert_eq!(first, second);
    }
}
