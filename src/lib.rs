//! Visual-similarity lookup service.
//!
//! Given an image (by URL or inline base64) and a count `k`, returns
//! time-limited download links to the `k` most similar catalog images.
//! The service orchestrates three managed backends: an inference endpoint
//! for feature vectors, a k-NN index for neighbor search, and an object
//! store for signed links.

pub mod api;
pub mod config;
pub mod error;
pub mod metrics;
pub mod model;
pub mod pipeline;

pub use api::{create_router, ApiServer, AppState};
pub use config::ServiceConfig;
pub use error::{Error, ErrorKind, LookupError, Result};
pub use model::{
    CatalogReference, FeatureVector, ImageBuffer, ImageSource, InputMode, LookupRequest,
    LookupResponse, SignedLink,
};
pub use pipeline::{
    FeatureExtractor, InputResolver, LinkSigner, NeighborIndex, PipelineBuilder,
    SimilarityPipeline,
};
