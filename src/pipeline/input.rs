//! Input resolution: turns a URL or inline base64 payload into image bytes.
//!
//! Fetching a caller-supplied URL is a trust boundary. Only `http`/`https`
//! is accepted, and unless explicitly allowed, hosts that are literal
//! loopback/private/link-local addresses are refused, including as
//! redirect targets. Host names are resolved through a filter that drops
//! non-public addresses, so a name pointing at a private network fails too.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use bytes::BytesMut;
use reqwest::dns::{Addrs, Name, Resolve, Resolving};
use reqwest::redirect::Policy;
use reqwest::Url;
use std::error::Error as StdError;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use tracing::debug;

use crate::config::DownloadConfig;
use crate::error::{Error, LookupError, Result};
use crate::model::{ImageBuffer, ImageSource};

/// Maximum redirects followed when downloading an image.
const MAX_REDIRECTS: usize = 5;

/// Resolves an [`ImageSource`] into an [`ImageBuffer`].
#[derive(Debug, Clone)]
pub struct InputResolver {
    client: reqwest::Client,
    max_bytes: usize,
    allow_private_hosts: bool,
}

impl InputResolver {
    /// Build a resolver with its own HTTP client.
    pub fn new(config: &DownloadConfig) -> Result<Self> {
        let allow_private_hosts = config.allow_private_hosts;
        let policy = Policy::custom(move |attempt| {
            if attempt.previous().len() >= MAX_REDIRECTS {
                attempt.error("too many redirects")
            } else if !allow_private_hosts && is_forbidden_host(attempt.url()) {
                attempt.stop()
            } else {
                attempt.follow()
            }
        });

        let mut builder = reqwest::Client::builder()
            .timeout(config.timeout())
            .redirect(policy);
        if !allow_private_hosts {
            builder = builder.dns_resolver(Arc::new(PublicResolver));
        }
        let client = builder
            .build()
            .map_err(|e| Error::Api(format!("failed to build download client: {}", e)))?;

        Ok(Self {
            client,
            max_bytes: config.max_bytes,
            allow_private_hosts,
        })
    }

    pub async fn resolve(
        &self,
        source: &ImageSource,
    ) -> std::result::Result<ImageBuffer, LookupError> {
        match source {
            ImageSource::Url(url) => self.download(url).await,
            ImageSource::Inline(data) => decode_inline(data),
        }
    }

    async fn download(&self, raw_url: &str) -> std::result::Result<ImageBuffer, LookupError> {
        let url = Url::parse(raw_url)
            .map_err(|e| LookupError::BadRequest(format!("invalid image URL: {}", e)))?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(LookupError::BadRequest(format!(
                "unsupported URL scheme '{}'",
                url.scheme()
            )));
        }
        if !self.allow_private_hosts && is_forbidden_host(&url) {
            return Err(LookupError::BadRequest(
                "image URL points at a non-public address".to_string(),
            ));
        }

        let mut response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| classify(&e))?;

        let status = response.status();
        if !status.is_success() {
            return Err(LookupError::DownloadFailure(format!(
                "image URL returned HTTP {}",
                status
            )));
        }

        if let Some(len) = response.content_length() {
            if len > self.max_bytes as u64 {
                return Err(LookupError::DownloadFailure(format!(
                    "image is {} bytes, limit is {}",
                    len, self.max_bytes
                )));
            }
        }

        let mut body = BytesMut::new();
        while let Some(chunk) = response
            .chunk()
            .await
            .map_err(|e| LookupError::DownloadFailure(describe(&e)))?
        {
            if body.len() + chunk.len() > self.max_bytes {
                return Err(LookupError::DownloadFailure(format!(
                    "image exceeds {} bytes",
                    self.max_bytes
                )));
            }
            body.extend_from_slice(&chunk);
        }

        if body.is_empty() {
            return Err(LookupError::DownloadFailure(
                "image URL returned an empty body".to_string(),
            ));
        }

        debug!(bytes = body.len(), "downloaded query image");
        Ok(ImageBuffer::new(body.freeze()))
    }
}

/// Decode a standard base64 payload, ignoring embedded whitespace.
pub fn decode_inline(data: &str) -> std::result::Result<ImageBuffer, LookupError> {
    let compact: String = data.chars().filter(|c| !c.is_ascii_whitespace()).collect();
    let bytes = STANDARD
        .decode(compact.as_bytes())
        .map_err(|e| LookupError::DecodeFailure(format!("invalid base64 image: {}", e)))?;
    if bytes.is_empty() {
        return Err(LookupError::DecodeFailure("image payload is empty".to_string()));
    }
    debug!(bytes = bytes.len(), "decoded inline query image");
    Ok(ImageBuffer::new(bytes))
}

/// Map a fetch error, surfacing a refused host as a caller error.
fn classify(err: &reqwest::Error) -> LookupError {
    let mut source = err.source();
    while let Some(cause) = source {
        if let Some(refused) = cause.downcast_ref::<NonPublicHost>() {
            return LookupError::BadRequest(refused.to_string());
        }
        source = cause.source();
    }
    LookupError::DownloadFailure(describe(err))
}

fn describe(err: &reqwest::Error) -> String {
    if err.is_timeout() {
        "timed out fetching image".to_string()
    } else if err.is_redirect() {
        format!("redirect rejected: {}", err)
    } else {
        format!("failed to fetch image: {}", err)
    }
}

/// Host name that resolved only to non-public addresses.
#[derive(Debug)]
pub struct NonPublicHost(String);

impl fmt::Display for NonPublicHost {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "image host '{}' resolves to a non-public address", self.0)
    }
}

impl StdError for NonPublicHost {}

/// DNS resolver that only hands out public addresses.
#[derive(Debug, Clone, Copy)]
struct PublicResolver;

impl Resolve for PublicResolver {
    fn resolve(&self, name: Name) -> Resolving {
        let host = name.as_str().to_string();
        Box::pin(async move {
            let addrs = resolve_public(&host).await?;
            Ok::<Addrs, Box<dyn StdError + Send + Sync>>(Box::new(addrs.into_iter()))
        })
    }
}

/// Resolve `host`, keeping only addresses that may be fetched.
pub async fn resolve_public(
    host: &str,
) -> std::result::Result<Vec<SocketAddr>, Box<dyn StdError + Send + Sync>> {
    let addrs: Vec<SocketAddr> = tokio::net::lookup_host((host, 0))
        .await?
        .filter(|addr| !is_forbidden_ip(&addr.ip()))
        .collect();
    if addrs.is_empty() {
        return Err(Box::new(NonPublicHost(host.to_string())));
    }
    Ok(addrs)
}

/// Whether the URL's host is a name or literal address that must not be fetched.
pub fn is_forbidden_host(url: &Url) -> bool {
    let Some(host) = url.host_str() else {
        return true;
    };
    let host = host.trim_start_matches('[').trim_end_matches(']');
    // fully qualified form, `localhost.`
    let host = host.strip_suffix('.').unwrap_or(host);
    if host.eq_ignore_ascii_case("localhost") || host.to_ascii_lowercase().ends_with(".localhost") {
        return true;
    }
    match host.parse::<IpAddr>() {
        Ok(ip) => is_forbidden_ip(&ip),
        Err(_) => false,
    }
}

fn is_forbidden_ip(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(ip) => is_forbidden_v4(ip),
        IpAddr::V6(ip) => is_forbidden_v6(ip),
    }
}

fn is_forbidden_v4(ip: &Ipv4Addr) -> bool {
    let [a, b, ..] = ip.octets();
    ip.is_loopback()
        || ip.is_private()
        || ip.is_link_local()
        || ip.is_unspecified()
        || ip.is_broadcast()
        // carrier-grade NAT, 100.64.0.0/10
        || (a == 100 && (64..128).contains(&b))
}

fn is_forbidden_v6(ip: &Ipv6Addr) -> bool {
    if let Some(v4) = ip.to_ipv4_mapped() {
        return is_forbidden_v4(&v4);
    }
    let first = ip.segments()[0];
    ip.is_loopback()
        || ip.is_unspecified()
        // unique local, fc00::/7
        || (first & 0xfe00) == 0xfc00
        // link local, fe80::/10
        || (first & 0xffc0) == 0xfe80
}

#[cfg(test)]
mod tests {
    use super::*;
    use httpmock::prelude::*;

    fn resolver(allow_private_hosts: bool) -> InputResolver {
        InputResolver::new(&DownloadConfig {
            timeout_secs: 5,
            max_bytes: 64,
            allow_private_hosts,
        })
        .unwrap()
    }

    #[test]
    fn test_base64_round_trip() {
        let original: Vec<u8> = (0u8..=255).collect();
        let encoded = STANDARD.encode(&original);
        let image = decode_inline(&encoded).unwrap();
        assert_eq!(image.bytes.as_ref(), original.as_slice());
    }

    #[test]
    fn test_base64_ignores_whitespace() {
        let image = decode_inline("/9j/\n4AAQ\r\nSkZJ RgAB").unwrap();
        assert_eq!(&image.bytes[..4], &[0xff, 0xd8, 0xff, 0xe0]);
    }

    #[test]
    fn test_malformed_base64_is_decode_failure() {
        for bad in ["not base64!!", "AAE", "%%%%"] {
            match decode_inline(bad) {
                Err(LookupError::DecodeFailure(_)) => {}
                other => panic!("expected DecodeFailure for {:?}, got {:?}", bad, other),
            }
        }
    }

    #[test]
    fn test_empty_payload_is_decode_failure() {
        assert!(matches!(decode_inline(""), Err(LookupError::DecodeFailure(_))));
    }

    #[test]
    fn test_forbidden_hosts() {
        for url in [
            "http://127.0.0.1/a.jpg",
            "http://10.1.2.3/a.jpg",
            "http://192.168.0.10/a.jpg",
            "http://169.254.169.254/latest/meta-data",
            "http://100.64.0.1/a.jpg",
            "http://0.0.0.0/a.jpg",
            "http://localhost:8080/a.jpg",
            "http://localhost./a.jpg",
            "http://LocalHost.:9/a.jpg",
            "http://app.localhost./a.jpg",
            "http://[::1]/a.jpg",
            "http://[fd00::1]/a.jpg",
            "http://[fe80::1]/a.jpg",
            "http://[::ffff:10.0.0.1]/a.jpg",
        ] {
            assert!(is_forbidden_host(&Url::parse(url).unwrap()), "{url}");
        }
        for url in [
            "https://example.com/a.jpg",
            "http://93.184.216.34/a.jpg",
            "https://[2606:4700::1111]/a.jpg",
        ] {
            assert!(!is_forbidden_host(&Url::parse(url).unwrap()), "{url}");
        }
    }

    #[tokio::test]
    async fn test_rejects_private_host_before_fetching() {
        // nothing listens on the discard port; a fetch would be a DownloadFailure
        let err = resolver(false)
            .resolve(&ImageSource::Url("http://127.0.0.1:9/a.jpg".into()))
            .await
            .unwrap_err();
        assert!(matches!(err, LookupError::BadRequest(_)), "{:?}", err);
    }

    #[tokio::test]
    async fn test_rejects_fully_qualified_localhost() {
        let err = resolver(false)
            .resolve(&ImageSource::Url("http://localhost.:9/a.jpg".into()))
            .await
            .unwrap_err();
        assert!(matches!(err, LookupError::BadRequest(_)), "{:?}", err);
    }

    #[tokio::test]
    async fn test_resolver_drops_private_addresses() {
        let err = resolve_public("localhost").await.unwrap_err();
        assert!(err.downcast_ref::<NonPublicHost>().is_some(), "{}", err);
    }

    #[tokio::test]
    async fn test_rejects_non_http_scheme() {
        let err = resolver(true)
            .resolve(&ImageSource::Url("file:///etc/passwd".into()))
            .await
            .unwrap_err();
        assert!(matches!(err, LookupError::BadRequest(_)));
    }

    #[tokio::test]
    async fn test_downloads_image() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/cat.jpg");
                then.status(200)
                    .header("content-type", "image/jpeg")
                    .body([0xffu8, 0xd8, 0xff, 0xe0]);
            })
            .await;

        let image = resolver(true)
            .resolve(&ImageSource::Url(server.url("/cat.jpg")))
            .await
            .unwrap();
        assert_eq!(image.bytes.as_ref(), &[0xff, 0xd8, 0xff, 0xe0]);
    }

    #[tokio::test]
    async fn test_not_found_is_download_failure() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/missing.jpg");
                then.status(404);
            })
            .await;

        let err = resolver(true)
            .resolve(&ImageSource::Url(server.url("/missing.jpg")))
            .await
            .unwrap_err();
        match err {
            LookupError::DownloadFailure(msg) => assert!(msg.contains("404"), "{msg}"),
            other => panic!("expected DownloadFailure, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_oversized_image_is_download_failure() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/huge.jpg");
                then.status(200).body(vec![7u8; 65]);
            })
            .await;

        let err = resolver(true)
            .resolve(&ImageSource::Url(server.url("/huge.jpg")))
            .await
            .unwrap_err();
        assert!(matches!(err, LookupError::DownloadFailure(_)));
    }

    #[tokio::test]
    async fn test_empty_body_is_download_failure() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/empty.jpg");
                then.status(200);
            })
            .await;

        let err = resolver(true)
            .resolve(&ImageSource::Url(server.url("/empty.jpg")))
            .await
            .unwrap_err();
        assert!(matches!(err, LookupError::DownloadFailure(_)));
    }
}
