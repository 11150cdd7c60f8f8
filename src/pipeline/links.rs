//! Signed download links for catalog references.

use async_trait::async_trait;
use aws_sdk_s3::error::DisplayErrorContext;
use aws_sdk_s3::presigning::PresigningConfig;
use std::time::Duration;

use crate::error::LookupError;
use crate::model::{CatalogReference, SignedLink};

/// Issues a time-limited read URL for one stored object.
#[async_trait]
pub trait LinkSigner: Send + Sync {
    fn name(&self) -> &'static str {
        "link-signer"
    }

    async fn sign(
        &self,
        reference: &CatalogReference,
        expires_in: Duration,
    ) -> Result<SignedLink, LookupError>;
}

/// Sign every reference in order.
///
/// One output per input, same order, duplicates kept. The first failure
/// aborts the whole batch.
pub async fn publish_links(
    signer: &dyn LinkSigner,
    references: &[CatalogReference],
    expires_in: Duration,
) -> Result<Vec<SignedLink>, LookupError> {
    let mut links = Vec::with_capacity(references.len());
    for reference in references {
        links.push(signer.sign(reference, expires_in).await?);
    }
    Ok(links)
}

/// [`LinkSigner`] producing S3 presigned `GetObject` URLs.
#[derive(Debug, Clone)]
pub struct S3LinkSigner {
    client: aws_sdk_s3::Client,
}

impl S3LinkSigner {
    pub fn new(client: aws_sdk_s3::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl LinkSigner for S3LinkSigner {
    fn name(&self) -> &'static str {
        "s3"
    }

    async fn sign(
        &self,
        reference: &CatalogReference,
        expires_in: Duration,
    ) -> Result<SignedLink, LookupError> {
        let presigning = PresigningConfig::expires_in(expires_in)
            .map_err(|e| LookupError::SigningFailure(format!("invalid link expiry: {}", e)))?;

        let request = self
            .client
            .get_object()
            .bucket(&reference.bucket)
            .key(&reference.key)
            .presigned(presigning)
            .await
            .map_err(|e| {
                LookupError::SigningFailure(format!(
                    "{}: {}",
                    reference,
                    DisplayErrorContext(&e)
                ))
            })?;

        Ok(SignedLink {
            url: request.uri().to_string(),
            expires_in,
        })
    }
}
