//! Service configuration.
//!
//! Values come from an optional TOML file, then environment overrides.
//! The region, search endpoint, inference endpoint and training bucket have
//! no usable defaults and must be present before the service starts.

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use crate::error::{Error, Result};

/// Region used for the AWS clients and request signing.
pub const ENV_REGION: &str = "AWS_REGION";
/// Vector-search endpoint host.
pub const ENV_SEARCH_ENDPOINT: &str = "OSS_ENDPOINT";
/// Inference endpoint name.
pub const ENV_INFERENCE_ENDPOINT: &str = "SM_ENDPOINT";
/// Bucket holding the catalog images.
pub const ENV_TRAINING_BUCKET: &str = "S3_TRAINING_BUCKET";
/// Optional index name override.
pub const ENV_SEARCH_INDEX: &str = "OSS_INDEX";
/// Optional vector field override.
pub const ENV_VECTOR_FIELD: &str = "OSS_VECTOR_FIELD";

/// Default k-NN index name.
pub const DEFAULT_INDEX: &str = "idx_zalando";

/// Default vector field inside the index.
pub const DEFAULT_VECTOR_FIELD: &str = "zalando_img_vector";

/// Lifetime of a signed download link.
pub const DEFAULT_LINK_EXPIRY_SECS: u64 = 300;

/// Upper bound for `k` accepted by the k-NN plugin.
pub const DEFAULT_MAX_NEIGHBORS: usize = 10_000;

/// Top-level configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    /// AWS region identifier
    pub region: String,
    pub api: ApiConfig,
    pub download: DownloadConfig,
    pub inference: InferenceConfig,
    pub search: SearchConfig,
    pub storage: StorageConfig,
    pub metrics: MetricsConfig,
}

/// HTTP API settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    /// Listen address for the lookup API
    pub listen_address: String,
    /// Largest accepted request body
    pub max_body_bytes: usize,
    /// Largest accepted `k`
    pub max_neighbors: usize,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            listen_address: "0.0.0.0:8080".to_string(),
            max_body_bytes: 16 * 1024 * 1024,
            max_neighbors: DEFAULT_MAX_NEIGHBORS,
        }
    }
}

/// Settings for fetching caller-supplied image URLs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DownloadConfig {
    pub timeout_secs: u64,
    /// Largest image accepted from a URL
    pub max_bytes: usize,
    /// Permit URLs that point at loopback, private or link-local addresses
    pub allow_private_hosts: bool,
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 10,
            max_bytes: 10 * 1024 * 1024,
            allow_private_hosts: false,
        }
    }
}

impl DownloadConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// Inference endpoint settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InferenceConfig {
    /// Name of the deployed inference endpoint
    pub endpoint_name: String,
    pub timeout_secs: u64,
}

impl Default for InferenceConfig {
    fn default() -> Self {
        Self {
            endpoint_name: String::new(),
            timeout_secs: 30,
        }
    }
}

impl InferenceConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// Vector index settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchConfig {
    /// Host (or base URL) of the search domain
    pub endpoint: String,
    pub index: String,
    pub vector_field: String,
    /// Query timeout
    pub timeout_secs: u64,
    /// Maximum age of cached signing credentials
    pub credential_refresh_secs: u64,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            endpoint: String::new(),
            index: DEFAULT_INDEX.to_string(),
            vector_field: DEFAULT_VECTOR_FIELD.to_string(),
            timeout_secs: 30,
            credential_refresh_secs: 300,
        }
    }
}

impl SearchConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn credential_refresh(&self) -> Duration {
        Duration::from_secs(self.credential_refresh_secs)
    }
}

/// Object store settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Bucket every catalog reference points into
    pub bucket: String,
    pub link_expiry_secs: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            bucket: String::new(),
            link_expiry_secs: DEFAULT_LINK_EXPIRY_SECS,
        }
    }
}

impl StorageConfig {
    pub fn link_expiry(&self) -> Duration {
        Duration::from_secs(self.link_expiry_secs)
    }
}

/// Prometheus exporter settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    pub enabled: bool,
    pub listen_address: String,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            listen_address: "0.0.0.0:9090".to_string(),
        }
    }
}

impl ServiceConfig {
    /// Load configuration from a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&content)?)
    }

    /// Save configuration to a TOML file.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Apply overrides from the process environment.
    pub fn apply_env(&mut self) {
        self.apply_env_from(|key| std::env::var(key).ok());
    }

    /// Apply overrides from an arbitrary variable lookup.
    ///
    /// Empty values are treated as unset.
    pub fn apply_env_from<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(v) = get(ENV_REGION) {
            self.region = v;
        }
        if let Some(v) = get(ENV_SEARCH_ENDPOINT) {
            self.search.endpoint = v;
        }
        if let Some(v) = get(ENV_INFERENCE_ENDPOINT) {
            self.inference.endpoint_name = v;
        }
        if let Some(v) = get(ENV_TRAINING_BUCKET) {
            self.storage.bucket = v;
        }
        if let Some(v) = get(ENV_SEARCH_INDEX) {
            self.search.index = v;
        }
        if let Some(v) = get(ENV_VECTOR_FIELD) {
            self.search.vector_field = v;
        }
    }

    /// Check that everything needed to serve requests is present.
    pub fn validate(&self) -> Result<()> {
        let required = [
            (ENV_REGION, &self.region),
            (ENV_SEARCH_ENDPOINT, &self.search.endpoint),
            (ENV_INFERENCE_ENDPOINT, &self.inference.endpoint_name),
            (ENV_TRAINING_BUCKET, &self.storage.bucket),
        ];
        for (key, value) in required {
            if value.trim().is_empty() {
                return Err(Error::Config(format!("{} is required but not set", key)));
            }
        }

        if self.search.index.is_empty() || self.search.vector_field.is_empty() {
            return Err(Error::Config(
                "search.index and search.vector_field must not be empty".to_string(),
            ));
        }
        if self.api.max_neighbors == 0 {
            return Err(Error::Config("api.max_neighbors must be at least 1".to_string()));
        }
        if self.storage.link_expiry_secs == 0 {
            return Err(Error::Config(
                "storage.link_expiry_secs must be at least 1".to_string(),
            ));
        }

        self.api
            .listen_address
            .parse::<SocketAddr>()
            .map_err(|e| Error::Config(format!("invalid api.listen_address: {}", e)))?;
        if self.metrics.enabled {
            self.metrics
                .listen_address
                .parse::<SocketAddr>()
                .map_err(|e| Error::Config(format!("invalid metrics.listen_address: {}", e)))?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn full_env() -> HashMap<&'static str, String> {
        HashMap::from([
            (ENV_REGION, "eu-west-1".to_string()),
            (ENV_SEARCH_ENDPOINT, "search-catalog.eu-west-1.es.amazonaws.com".to_string()),
            (ENV_INFERENCE_ENDPOINT, "img-features".to_string()),
            (ENV_TRAINING_BUCKET, "catalog-training".to_string()),
        ])
    }

    fn from_env(env: &HashMap<&'static str, String>) -> ServiceConfig {
        let mut config = ServiceConfig::default();
        config.apply_env_from(|key| env.get(key).cloned());
        config
    }

    #[test]
    fn test_defaults() {
        let config = ServiceConfig::default();
        assert_eq!(config.search.index, "idx_zalando");
        assert_eq!(config.search.vector_field, "zalando_img_vector");
        assert_eq!(config.search.timeout(), Duration::from_secs(30));
        assert_eq!(config.storage.link_expiry(), Duration::from_secs(300));
        assert!(!config.download.allow_private_hosts);
    }

    #[test]
    fn test_env_overrides_apply() {
        let config = from_env(&full_env());
        assert_eq!(config.region, "eu-west-1");
        assert_eq!(config.inference.endpoint_name, "img-features");
        assert_eq!(config.storage.bucket, "catalog-training");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_index_and_field_overrides() {
        let mut env = full_env();
        env.insert(ENV_SEARCH_INDEX, "idx_shoes".to_string());
        env.insert(ENV_VECTOR_FIELD, "shoe_vector".to_string());
        let config = from_env(&env);
        assert_eq!(config.search.index, "idx_shoes");
        assert_eq!(config.search.vector_field, "shoe_vector");
    }

    #[test]
    fn test_missing_required_values_are_fatal() {
        for missing in [
            ENV_REGION,
            ENV_SEARCH_ENDPOINT,
            ENV_INFERENCE_ENDPOINT,
            ENV_TRAINING_BUCKET,
        ] {
            let mut env = full_env();
            env.remove(missing);
            let err = from_env(&env).validate().unwrap_err();
            assert!(
                err.to_string().contains(missing),
                "error should name {}: {}",
                missing,
                err
            );
        }
    }

    #[test]
    fn test_blank_env_value_is_ignored() {
        let mut env = full_env();
        env.insert(ENV_TRAINING_BUCKET, "   ".to_string());
        assert!(from_env(&env).validate().is_err());
    }

    #[test]
    fn test_invalid_listen_address_rejected() {
        let mut config = from_env(&full_env());
        config.api.listen_address = "not-an-address".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");

        let mut config = from_env(&full_env());
        config.download.allow_private_hosts = true;
        config.storage.link_expiry_secs = 120;
        config.save(&path).unwrap();

        let loaded = ServiceConfig::load(&path).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "region = \"us-east-1\"\n\n[storage]\nbucket = \"b\"\n").unwrap();

        let loaded = ServiceConfig::load(&path).unwrap();
        assert_eq!(loaded.region, "us-east-1");
        assert_eq!(loaded.storage.bucket, "b");
        assert_eq!(loaded.storage.link_expiry_secs, DEFAULT_LINK_EXPIRY_SECS);
        assert_eq!(loaded.search.index, DEFAULT_INDEX);
    }
}
